use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol-level fault codes carried back to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultCode {
    UnknownSequence,
    SequenceTerminated,
    SequenceClosed,
    InvalidAcknowledgement,
    CreateSequenceRefused,
    MessageNumberRollover,
    ProofOfPossession,
    LastMessageNumberExceeded,
    MissingSelection,
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultCode::UnknownSequence => "UnknownSequence",
            FaultCode::SequenceTerminated => "SequenceTerminated",
            FaultCode::SequenceClosed => "SequenceClosed",
            FaultCode::InvalidAcknowledgement => "InvalidAcknowledgement",
            FaultCode::CreateSequenceRefused => "CreateSequenceRefused",
            FaultCode::MessageNumberRollover => "MessageNumberRollover",
            FaultCode::ProofOfPossession => "ProofOfPossession",
            FaultCode::LastMessageNumberExceeded => "LastMessageNumberExceeded",
            FaultCode::MissingSelection => "MissingSelection",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolFault {
    pub code: FaultCode,
    pub sequence_id: Option<String>,
    pub detail: String,
}

impl fmt::Display for ProtocolFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sequence_id {
            Some(id) => write!(f, "{} fault on '{}': {}", self.code, id, self.detail),
            None => write!(f, "{} fault: {}", self.code, self.detail),
        }
    }
}

#[derive(Error, Debug)]
pub enum RmError {
    #[error("{0}")]
    Fault(ProtocolFault),

    #[error("Delivery failed for sequence '{0}': {1}")]
    DeliveryFailed(String, String),

    #[error("Sequence '{0}' not found")]
    SequenceNotFound(String),

    #[error("Storage conflict: {0}")]
    Conflict(String),

    #[error("Transaction retries exhausted: {0}")]
    RetriesExhausted(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Application error: {0}")]
    Application(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, RmError>;

impl RmError {
    pub fn fault(code: FaultCode, sequence_id: Option<&str>, detail: impl Into<String>) -> Self {
        Self::Fault(ProtocolFault {
            code,
            sequence_id: sequence_id.map(str::to_string),
            detail: detail.into(),
        })
    }

    pub fn unknown_sequence(sequence_id: &str) -> Self {
        Self::fault(
            FaultCode::UnknownSequence,
            Some(sequence_id),
            "the sequence is not known to this endpoint",
        )
    }

    pub fn sequence_terminated(sequence_id: &str) -> Self {
        Self::fault(
            FaultCode::SequenceTerminated,
            Some(sequence_id),
            "the sequence has been terminated",
        )
    }

    pub fn sequence_closed(sequence_id: &str) -> Self {
        Self::fault(
            FaultCode::SequenceClosed,
            Some(sequence_id),
            "the sequence is closed and accepts no further messages",
        )
    }

    pub fn create_sequence_refused(detail: impl Into<String>) -> Self {
        Self::fault(FaultCode::CreateSequenceRefused, None, detail)
    }

    /// Returns the fault code when this error is a protocol fault.
    pub fn fault_code(&self) -> Option<FaultCode> {
        match self {
            Self::Fault(fault) => Some(fault.code),
            _ => None,
        }
    }

    /// Errors worth retrying at the transaction boundary.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::IoError(_) | Self::LockError(_))
    }
}

impl<T> From<std::sync::PoisonError<T>> for RmError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for RmError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for RmError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_display_names_sequence() {
        let err = RmError::unknown_sequence("urn:uuid:abc");
        assert_eq!(err.fault_code(), Some(FaultCode::UnknownSequence));
        assert!(err.to_string().starts_with("UnknownSequence fault on 'urn:uuid:abc'"));
    }

    #[test]
    fn only_storage_errors_are_retryable() {
        assert!(RmError::Conflict("x".into()).is_retryable());
        assert!(RmError::IoError("disk".into()).is_retryable());
        assert!(!RmError::sequence_closed("s").is_retryable());
        assert!(!RmError::Transport("down".into()).is_retryable());
    }
}
