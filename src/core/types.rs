use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// WS-Addressing anonymous endpoint: "reply on the back channel".
pub const ANONYMOUS_ADDRESS: &str = "http://www.w3.org/2005/08/addressing/anonymous";

/// Prefix of MakeConnection anonymous endpoints, one per polling client.
pub const RM_ANONYMOUS_PREFIX: &str = "http://docs.oasis-open.org/ws-rx/wsmc/200702/anonymous?id=";

/// Largest message number a sequence may assign.
pub const MAX_MESSAGE_NUMBER: u64 = i64::MAX as u64;

/// Protocol revision negotiated for a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SpecVersion {
    V1_0,
    #[default]
    V1_1,
}

impl SpecVersion {
    /// Whether TerminateSequence / CloseSequence are answered with a response message.
    pub fn has_responses(self) -> bool {
        matches!(self, SpecVersion::V1_1)
    }
}

impl fmt::Display for SpecVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecVersion::V1_0 => f.write_str("1.0"),
            SpecVersion::V1_1 => f.write_str("1.1"),
        }
    }
}

/// Closed set of protocol message kinds the engine routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageKind {
    CreateSequence,
    CreateSequenceResponse,
    CloseSequence,
    CloseSequenceResponse,
    TerminateSequence,
    TerminateSequenceResponse,
    Application,
    Acknowledgement,
    AckRequest,
    MakeConnection,
    Fault,
}

impl MessageKind {
    /// Kinds whose pending-send record stays queued after a successful send until
    /// a protocol reply retires it.
    pub fn is_resend(self) -> bool {
        matches!(self, MessageKind::Application | MessageKind::CreateSequence)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::CreateSequence => "CreateSequence",
            MessageKind::CreateSequenceResponse => "CreateSequenceResponse",
            MessageKind::CloseSequence => "CloseSequence",
            MessageKind::CloseSequenceResponse => "CloseSequenceResponse",
            MessageKind::TerminateSequence => "TerminateSequence",
            MessageKind::TerminateSequenceResponse => "TerminateSequenceResponse",
            MessageKind::Application => "Application",
            MessageKind::Acknowledgement => "Acknowledgement",
            MessageKind::AckRequest => "AckRequest",
            MessageKind::MakeConnection => "MakeConnection",
            MessageKind::Fault => "Fault",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let kind = match s {
            "CreateSequence" => MessageKind::CreateSequence,
            "CreateSequenceResponse" => MessageKind::CreateSequenceResponse,
            "CloseSequence" => MessageKind::CloseSequence,
            "CloseSequenceResponse" => MessageKind::CloseSequenceResponse,
            "TerminateSequence" => MessageKind::TerminateSequence,
            "TerminateSequenceResponse" => MessageKind::TerminateSequenceResponse,
            "Application" => MessageKind::Application,
            "Acknowledgement" => MessageKind::Acknowledgement,
            "AckRequest" => MessageKind::AckRequest,
            "MakeConnection" => MessageKind::MakeConnection,
            "Fault" => MessageKind::Fault,
            other => return Err(format!("unknown message kind '{}'", other)),
        };
        Ok(kind)
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn new_message_id() -> String {
    format!("urn:uuid:{}", Uuid::new_v4())
}

pub fn new_sequence_id() -> String {
    format!("urn:uuid:{}", Uuid::new_v4())
}

/// A fresh MakeConnection anonymous address for a polling endpoint.
pub fn new_rm_anonymous_address() -> String {
    format!("{}{}", RM_ANONYMOUS_PREFIX, Uuid::new_v4())
}

/// True for plain WS-A anonymous.
pub fn is_plain_anonymous(address: Option<&str>) -> bool {
    matches!(address, None | Some(ANONYMOUS_ADDRESS))
}

/// True when a message to `address` cannot be pushed and must wait for the peer
/// (back channel or MakeConnection).
pub fn is_anonymous(address: Option<&str>) -> bool {
    match address {
        None => true,
        Some(addr) => addr == ANONYMOUS_ADDRESS || addr.starts_with(RM_ANONYMOUS_PREFIX),
    }
}
