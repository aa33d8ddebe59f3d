use crate::core::{FaultCode, Result, RmError};
use crate::protocol::Envelope;
use async_trait::async_trait;
use serde_json::Value;

/// Outbound wire access.
///
/// Implementations serialize the envelope for their transport and return the
/// synchronous response carried on the back channel, if any.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, envelope: Envelope, destination: &str) -> Result<Option<Envelope>>;
}

/// The application the engine hands deduplicated messages to.
#[async_trait]
pub trait Application: Send + Sync {
    /// Processes one message. A returned value is sent back as the reply.
    async fn invoke(
        &self,
        sequence_id: &str,
        message_number: u64,
        payload: Value,
    ) -> Result<Option<Value>>;
}

/// Proof-of-possession checks for sequences bound to a security token.
pub trait SecurityManager: Send + Sync {
    fn verify_proof_of_possession(&self, token: &str, envelope: &Envelope) -> Result<()>;
}

/// Accepts everything; used when no security collaborator is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSecurity;

impl SecurityManager for NoSecurity {
    fn verify_proof_of_possession(&self, _token: &str, _envelope: &Envelope) -> Result<()> {
        Ok(())
    }
}

/// Requires every message on a token-bound sequence to present the same token reference.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenMatchSecurity;

impl SecurityManager for TokenMatchSecurity {
    fn verify_proof_of_possession(&self, token: &str, envelope: &Envelope) -> Result<()> {
        match envelope.security_token.as_deref() {
            Some(presented) if presented == token => Ok(()),
            _ => Err(RmError::fault(
                FaultCode::ProofOfPossession,
                envelope.sequence.as_ref().map(|s| s.sequence_id.as_str()),
                "message is not protected by the token bound to the sequence",
            )),
        }
    }
}

/// Discards every message; handy for engines that only send.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullApplication;

#[async_trait]
impl Application for NullApplication {
    async fn invoke(
        &self,
        _sequence_id: &str,
        _message_number: u64,
        _payload: Value,
    ) -> Result<Option<Value>> {
        Ok(None)
    }
}
