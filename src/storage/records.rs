use crate::core::{MessageKind, SpecVersion, is_anonymous};
use crate::ledger::RangeSet;
use crate::protocol::Envelope;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequenceSide {
    Sending,
    Receiving,
}

/// Observable lifecycle state derived from a record's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequenceState {
    CreatePending,
    Established,
    Closing,
    TerminatePending,
    Terminated,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceRecord {
    pub side: SequenceSide,
    /// Local correlation key. Receiving records use their wire id.
    pub internal_id: String,
    /// Wire id, assigned once.
    pub sequence_id: Option<String>,
    pub to_address: Option<String>,
    pub reply_to: Option<String>,
    pub acks_to: Option<String>,
    pub spec_version: SpecVersion,

    pub polling_mode: bool,
    pub closed: bool,
    pub terminated: bool,
    pub terminate_added: bool,
    pub timed_out: bool,
    pub failed: bool,
    pub auto_termination_suppressed: bool,
    pub poll_requested: bool,

    /// Sending side: next number to assign.
    pub next_message_number: u64,
    pub highest_out_message_number: u64,
    pub highest_in_message_number: u64,
    /// Receiving side: next number the in-order invoker may hand to the application.
    pub next_message_to_invoke: u64,
    pub last_message_number: Option<u64>,
    /// Acknowledged numbers (sending) or received numbers (receiving).
    pub acked: RangeSet,

    /// Sending side: the inbound sequence paired through an offer.
    pub offered_sequence_id: Option<String>,
    /// Receiving side: internal id of the sending sequence that carries replies.
    pub paired_internal_id: Option<String>,
    pub expected_replies: u64,

    pub created_ms: i64,
    pub last_activated_ms: i64,
    pub security_token: Option<String>,
    pub create_message_id: Option<String>,
    pub last_send_error: Option<String>,
    pub last_send_error_ms: Option<i64>,

    pub revision: u64,
}

impl SequenceRecord {
    pub fn new_sending(
        internal_id: impl Into<String>,
        to_address: Option<String>,
        spec_version: SpecVersion,
        now_ms: i64,
    ) -> Self {
        Self::blank(SequenceSide::Sending, internal_id.into(), None, to_address, spec_version, now_ms)
    }

    pub fn new_receiving(
        sequence_id: impl Into<String>,
        spec_version: SpecVersion,
        now_ms: i64,
    ) -> Self {
        let sequence_id = sequence_id.into();
        Self::blank(
            SequenceSide::Receiving,
            sequence_id.clone(),
            Some(sequence_id),
            None,
            spec_version,
            now_ms,
        )
    }

    fn blank(
        side: SequenceSide,
        internal_id: String,
        sequence_id: Option<String>,
        to_address: Option<String>,
        spec_version: SpecVersion,
        now_ms: i64,
    ) -> Self {
        Self {
            side,
            internal_id,
            sequence_id,
            to_address,
            reply_to: None,
            acks_to: None,
            spec_version,
            polling_mode: false,
            closed: false,
            terminated: false,
            terminate_added: false,
            timed_out: false,
            failed: false,
            auto_termination_suppressed: false,
            poll_requested: false,
            next_message_number: 1,
            highest_out_message_number: 0,
            highest_in_message_number: 0,
            next_message_to_invoke: 1,
            last_message_number: None,
            acked: RangeSet::new(),
            offered_sequence_id: None,
            paired_internal_id: None,
            expected_replies: 0,
            created_ms: now_ms,
            last_activated_ms: now_ms,
            security_token: None,
            create_message_id: None,
            last_send_error: None,
            last_send_error_ms: None,
            revision: 0,
        }
    }

    pub fn state(&self) -> SequenceState {
        if self.failed {
            SequenceState::Failed
        } else if self.terminated {
            SequenceState::Terminated
        } else if self.side == SequenceSide::Receiving {
            SequenceState::Established
        } else if self.terminate_added {
            SequenceState::TerminatePending
        } else if self.sequence_id.is_none() {
            SequenceState::CreatePending
        } else if self.closed {
            SequenceState::Closing
        } else {
            SequenceState::Established
        }
    }

    pub fn is_active(&self) -> bool {
        !self.terminated && !self.failed
    }

    /// Wire id if bound, otherwise the internal id (for logs and errors).
    pub fn display_id(&self) -> &str {
        self.sequence_id.as_deref().unwrap_or(&self.internal_id)
    }

    /// Every message up to the last one has been acknowledged.
    pub fn is_fully_acknowledged(&self) -> bool {
        match self.last_message_number {
            Some(0) => true,
            Some(last) => self.acked.is_complete_up_to(last),
            None => false,
        }
    }
}

/// Identifies the request a queued reply answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyCorrelation {
    pub sequence_id: String,
    pub message_number: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRecord {
    pub message_id: String,
    /// Internal id of the owning sequence (wire id for receiving sequences).
    pub internal_id: String,
    pub sequence_id: Option<String>,
    pub message_number: Option<u64>,
    pub kind: MessageKind,
    pub destination: Option<String>,
    pub time_to_send_ms: i64,
    pub sent_count: u32,
    pub send: bool,
    pub transport_available: bool,
    pub resend: bool,
    pub body_key: String,
    pub last_message: bool,
    pub in_reply_to: Option<ReplyCorrelation>,
    pub revision: u64,
}

impl SendRecord {
    pub fn new(
        message_id: impl Into<String>,
        internal_id: impl Into<String>,
        kind: MessageKind,
        destination: Option<String>,
        time_to_send_ms: i64,
    ) -> Self {
        let message_id = message_id.into();
        Self {
            body_key: message_id.clone(),
            message_id,
            internal_id: internal_id.into(),
            sequence_id: None,
            message_number: None,
            kind,
            transport_available: !is_anonymous(destination.as_deref()),
            destination,
            time_to_send_ms,
            sent_count: 0,
            send: true,
            resend: kind.is_resend(),
            last_message: false,
            in_reply_to: None,
            revision: 0,
        }
    }

    /// Dispatch claim key: message id plus scheduled time.
    pub fn work_id(&self) -> String {
        format!("{}@{}", self.message_id, self.time_to_send_ms)
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        self.send && self.time_to_send_ms <= now_ms
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeRecord {
    pub sequence_id: String,
    pub message_number: u64,
    pub body_key: String,
    pub received_ms: i64,
}

/// A stored message body referenced by send and invoke records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub key: String,
    pub envelope: Envelope,
    pub stored_ms: i64,
}
