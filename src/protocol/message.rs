use crate::core::{MessageKind, ProtocolFault, SpecVersion, new_message_id};
use crate::ledger::{AckRange, RangeSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceHeader {
    pub sequence_id: String,
    pub message_number: u64,
    pub last_message: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceAcknowledgement {
    pub sequence_id: String,
    pub ranges: Vec<AckRange>,
    #[serde(default)]
    pub nacks: Vec<u64>,
    /// Set once the receiver will accept no further messages on the sequence.
    #[serde(default)]
    pub final_ack: bool,
}

impl SequenceAcknowledgement {
    pub fn from_ranges(sequence_id: impl Into<String>, ranges: &RangeSet, final_ack: bool) -> Self {
        Self {
            sequence_id: sequence_id.into(),
            ranges: ranges.ranges().to_vec(),
            nacks: Vec::new(),
            final_ack,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRequested {
    pub sequence_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MakeConnection {
    pub address: Option<String>,
    pub sequence_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePending {
    pub pending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub sequence_id: String,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accept {
    pub acks_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProtocolBody {
    CreateSequence {
        acks_to: Option<String>,
        offer: Option<Offer>,
        spec_version: SpecVersion,
    },
    CreateSequenceResponse {
        sequence_id: String,
        accept: Option<Accept>,
    },
    CloseSequence {
        sequence_id: String,
        last_message_number: Option<u64>,
    },
    CloseSequenceResponse {
        sequence_id: String,
    },
    TerminateSequence {
        sequence_id: String,
        last_message_number: Option<u64>,
    },
    TerminateSequenceResponse {
        sequence_id: String,
    },
    MakeConnection(MakeConnection),
    Application {
        payload: Value,
    },
    Fault(ProtocolFault),
    /// Header-only message (standalone acknowledgement, AckRequested).
    Empty,
}

/// One protocol message with its addressing and reliable-messaging headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: String,
    pub relates_to: Option<String>,
    pub to: Option<String>,
    pub reply_to: Option<String>,
    pub security_token: Option<String>,
    pub sequence: Option<SequenceHeader>,
    #[serde(default)]
    pub acknowledgements: Vec<SequenceAcknowledgement>,
    #[serde(default)]
    pub ack_requested: Vec<AckRequested>,
    pub message_pending: Option<MessagePending>,
    pub body: ProtocolBody,
}

impl Envelope {
    pub fn new(body: ProtocolBody) -> Self {
        Self {
            message_id: new_message_id(),
            relates_to: None,
            to: None,
            reply_to: None,
            security_token: None,
            sequence: None,
            acknowledgements: Vec::new(),
            ack_requested: Vec::new(),
            message_pending: None,
            body,
        }
    }

    pub fn application(payload: Value) -> Self {
        Self::new(ProtocolBody::Application { payload })
    }

    pub fn acknowledgement(ack: SequenceAcknowledgement) -> Self {
        let mut envelope = Self::new(ProtocolBody::Empty);
        envelope.acknowledgements.push(ack);
        envelope
    }

    pub fn ack_request(sequence_id: impl Into<String>) -> Self {
        let mut envelope = Self::new(ProtocolBody::Empty);
        envelope.ack_requested.push(AckRequested {
            sequence_id: sequence_id.into(),
        });
        envelope
    }

    pub fn fault(fault: ProtocolFault) -> Self {
        Self::new(ProtocolBody::Fault(fault))
    }

    pub fn with_to(mut self, to: Option<String>) -> Self {
        self.to = to;
        self
    }

    pub fn with_reply_to(mut self, reply_to: Option<String>) -> Self {
        self.reply_to = reply_to;
        self
    }

    pub fn with_relates_to(mut self, relates_to: impl Into<String>) -> Self {
        self.relates_to = Some(relates_to.into());
        self
    }

    pub fn with_sequence(mut self, header: SequenceHeader) -> Self {
        self.sequence = Some(header);
        self
    }

    pub fn with_security_token(mut self, token: Option<String>) -> Self {
        self.security_token = token;
        self
    }

    /// Message kind used for routing.
    pub fn kind(&self) -> MessageKind {
        match &self.body {
            ProtocolBody::CreateSequence { .. } => MessageKind::CreateSequence,
            ProtocolBody::CreateSequenceResponse { .. } => MessageKind::CreateSequenceResponse,
            ProtocolBody::CloseSequence { .. } => MessageKind::CloseSequence,
            ProtocolBody::CloseSequenceResponse { .. } => MessageKind::CloseSequenceResponse,
            ProtocolBody::TerminateSequence { .. } => MessageKind::TerminateSequence,
            ProtocolBody::TerminateSequenceResponse { .. } => {
                MessageKind::TerminateSequenceResponse
            }
            ProtocolBody::MakeConnection(_) => MessageKind::MakeConnection,
            ProtocolBody::Application { .. } => MessageKind::Application,
            ProtocolBody::Fault(_) => MessageKind::Fault,
            ProtocolBody::Empty => {
                if self.acknowledgements.is_empty() && !self.ack_requested.is_empty() {
                    MessageKind::AckRequest
                } else {
                    MessageKind::Acknowledgement
                }
            }
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        match &self.body {
            ProtocolBody::Application { payload } => Some(payload),
            _ => None,
        }
    }

    pub fn is_pending_more(&self) -> bool {
        self.message_pending.map(|mp| mp.pending).unwrap_or(false)
    }
}
