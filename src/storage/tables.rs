use super::records::{InvokeRecord, SendRecord, SequenceRecord, StoredMessage};
use crate::core::MessageKind;
use im::OrdMap;
use serde::{Deserialize, Serialize};

/// All persisted state. Persistent maps make a per-unit snapshot a cheap clone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreTables {
    /// Sending sequences by internal id.
    pub sending: OrdMap<String, SequenceRecord>,
    /// Receiving sequences by wire id.
    pub receiving: OrdMap<String, SequenceRecord>,
    /// Wire id -> internal id for sending sequences.
    pub sending_by_wire: OrdMap<String, String>,
    pub sends: OrdMap<String, SendRecord>,
    pub invokes: OrdMap<String, InvokeRecord>,
    pub messages: OrdMap<String, StoredMessage>,
}

/// Zero-padded so that keys of one sequence sort by message number.
pub fn invoke_key(sequence_id: &str, message_number: u64) -> String {
    format!("{}#{:020}", sequence_id, message_number)
}

/// Read access to a consistent set of tables.
pub trait StoreView {
    fn tables(&self) -> &StoreTables;
}

impl StoreView for StoreTables {
    fn tables(&self) -> &StoreTables {
        self
    }
}

// ============================================================================
// Typed repositories
// ============================================================================

pub trait SequenceRepository: StoreView {
    fn sending_by_internal_id(&self, internal_id: &str) -> Option<SequenceRecord> {
        self.tables().sending.get(internal_id).cloned()
    }

    fn sending_by_sequence_id(&self, sequence_id: &str) -> Option<SequenceRecord> {
        let tables = self.tables();
        tables
            .sending_by_wire
            .get(sequence_id)
            .and_then(|internal_id| tables.sending.get(internal_id))
            .cloned()
    }

    fn sending_by_create_message_id(&self, message_id: &str) -> Option<SequenceRecord> {
        self.tables()
            .sending
            .values()
            .find(|record| record.create_message_id.as_deref() == Some(message_id))
            .cloned()
    }

    fn receiving_by_sequence_id(&self, sequence_id: &str) -> Option<SequenceRecord> {
        self.tables().receiving.get(sequence_id).cloned()
    }

    /// True if the id names any sending or receiving sequence.
    fn sequence_id_in_use(&self, sequence_id: &str) -> bool {
        let tables = self.tables();
        tables.sending_by_wire.contains_key(sequence_id)
            || tables.receiving.contains_key(sequence_id)
            || tables
                .sending
                .values()
                .any(|record| record.offered_sequence_id.as_deref() == Some(sequence_id))
    }

    fn sending_sequences(&self) -> Vec<SequenceRecord> {
        self.tables().sending.values().cloned().collect()
    }

    fn receiving_sequences(&self) -> Vec<SequenceRecord> {
        self.tables().receiving.values().cloned().collect()
    }
}

pub trait SendRepository: StoreView {
    fn send_by_message_id(&self, message_id: &str) -> Option<SendRecord> {
        self.tables().sends.get(message_id).cloned()
    }

    fn sends_for_sequence(&self, internal_id: &str) -> Vec<SendRecord> {
        self.tables()
            .sends
            .values()
            .filter(|record| record.internal_id == internal_id)
            .cloned()
            .collect()
    }

    fn application_send(&self, internal_id: &str, message_number: u64) -> Option<SendRecord> {
        self.tables()
            .sends
            .values()
            .find(|record| {
                record.internal_id == internal_id
                    && record.kind == MessageKind::Application
                    && record.message_number == Some(message_number)
            })
            .cloned()
    }

    /// Send-enabled, pushable records due at or before `time_ms`, earliest first.
    fn pending_before(&self, time_ms: i64) -> Vec<SendRecord> {
        let mut due: Vec<SendRecord> = self
            .tables()
            .sends
            .values()
            .filter(|record| record.transport_available && record.is_due(time_ms))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.time_to_send_ms
                .cmp(&b.time_to_send_ms)
                .then(a.message_id.cmp(&b.message_id))
        });
        due
    }

    /// Records parked for MakeConnection that match the poll filters, earliest first.
    fn pollable(
        &self,
        now_ms: i64,
        address: Option<&str>,
        sequence_id: Option<&str>,
    ) -> Vec<SendRecord> {
        let mut matches: Vec<SendRecord> = self
            .tables()
            .sends
            .values()
            .filter(|record| !record.transport_available && record.is_due(now_ms))
            .filter(|record| record.resend || record.sent_count == 0)
            .filter(|record| match address {
                Some(address) => record.destination.as_deref() == Some(address),
                None => true,
            })
            .filter(|record| match sequence_id {
                Some(sequence_id) => record.sequence_id.as_deref() == Some(sequence_id),
                None => true,
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| {
            a.time_to_send_ms
                .cmp(&b.time_to_send_ms)
                .then(a.message_id.cmp(&b.message_id))
        });
        matches
    }

    fn pending_acks_for(&self, internal_id: &str) -> Vec<SendRecord> {
        self.tables()
            .sends
            .values()
            .filter(|record| {
                record.internal_id == internal_id && record.kind == MessageKind::Acknowledgement
            })
            .cloned()
            .collect()
    }

    /// The reply queued for inbound message `message_number` of `sequence_id`.
    fn reply_for(&self, sequence_id: &str, message_number: u64) -> Option<SendRecord> {
        self.tables()
            .sends
            .values()
            .find(|record| {
                record.in_reply_to.as_ref().is_some_and(|corr| {
                    corr.sequence_id == sequence_id && corr.message_number == message_number
                })
            })
            .cloned()
    }
}

pub trait InvokeRepository: StoreView {
    fn invoke_record(&self, sequence_id: &str, message_number: u64) -> Option<InvokeRecord> {
        self.tables()
            .invokes
            .get(&invoke_key(sequence_id, message_number))
            .cloned()
    }

    fn invokes_for_sequence(&self, sequence_id: &str) -> Vec<InvokeRecord> {
        let prefix = format!("{}#", sequence_id);
        self.tables()
            .invokes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(_, record)| record.clone())
            .collect()
    }

    fn stored_message(&self, key: &str) -> Option<StoredMessage> {
        self.tables().messages.get(key).cloned()
    }
}

impl<T: StoreView + ?Sized> SequenceRepository for T {}
impl<T: StoreView + ?Sized> SendRepository for T {}
impl<T: StoreView + ?Sized> InvokeRepository for T {}
