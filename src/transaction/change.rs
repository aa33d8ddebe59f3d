// ============================================================================
// Store operations
// ============================================================================
//
// Each unit of work records the operations it performed. They are applied to
// the unit's private snapshot immediately, journaled on commit, and re-applied
// to the latest tables when another unit committed first. Re-application
// fails with a conflict when a revision check no longer holds.
//
// ============================================================================

use crate::core::{Result, RmError};
use crate::storage::{
    InvokeRecord, SendRecord, SequenceRecord, SequenceSide, StoreTables, StoredMessage,
    invoke_key,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreOp {
    InsertSequence {
        record: SequenceRecord,
    },
    UpdateSequence {
        record: SequenceRecord,
        expected_revision: u64,
    },
    InsertSend {
        record: SendRecord,
    },
    UpdateSend {
        record: SendRecord,
        expected_revision: u64,
    },
    DeleteSend {
        message_id: String,
    },
    PutInvoke {
        record: InvokeRecord,
    },
    DeleteInvoke {
        sequence_id: String,
        message_number: u64,
    },
    PutMessage {
        message: StoredMessage,
    },
    DeleteMessage {
        key: String,
    },
}

impl StoreOp {
    pub fn apply_to(&self, tables: &mut StoreTables) -> Result<()> {
        match self {
            StoreOp::InsertSequence { record } => insert_sequence(tables, record),
            StoreOp::UpdateSequence {
                record,
                expected_revision,
            } => update_sequence(tables, record, *expected_revision),
            StoreOp::InsertSend { record } => {
                if tables.sends.contains_key(&record.message_id) {
                    return Err(RmError::Conflict(format!(
                        "send record '{}' already exists",
                        record.message_id
                    )));
                }
                tables.sends.insert(record.message_id.clone(), record.clone());
                Ok(())
            }
            StoreOp::UpdateSend {
                record,
                expected_revision,
            } => {
                let current = tables.sends.get(&record.message_id).ok_or_else(|| {
                    RmError::Conflict(format!("send record '{}' is gone", record.message_id))
                })?;
                if current.revision != *expected_revision {
                    return Err(RmError::Conflict(format!(
                        "send record '{}' changed (revision {} != {})",
                        record.message_id, current.revision, expected_revision
                    )));
                }
                tables.sends.insert(record.message_id.clone(), record.clone());
                Ok(())
            }
            StoreOp::DeleteSend { message_id } => {
                tables.sends.remove(message_id);
                Ok(())
            }
            StoreOp::PutInvoke { record } => {
                tables.invokes.insert(
                    invoke_key(&record.sequence_id, record.message_number),
                    record.clone(),
                );
                Ok(())
            }
            StoreOp::DeleteInvoke {
                sequence_id,
                message_number,
            } => {
                tables.invokes.remove(&invoke_key(sequence_id, *message_number));
                Ok(())
            }
            StoreOp::PutMessage { message } => {
                tables.messages.insert(message.key.clone(), message.clone());
                Ok(())
            }
            StoreOp::DeleteMessage { key } => {
                tables.messages.remove(key);
                Ok(())
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StoreOp::InsertSequence { .. } => "insert_sequence",
            StoreOp::UpdateSequence { .. } => "update_sequence",
            StoreOp::InsertSend { .. } => "insert_send",
            StoreOp::UpdateSend { .. } => "update_send",
            StoreOp::DeleteSend { .. } => "delete_send",
            StoreOp::PutInvoke { .. } => "put_invoke",
            StoreOp::DeleteInvoke { .. } => "delete_invoke",
            StoreOp::PutMessage { .. } => "put_message",
            StoreOp::DeleteMessage { .. } => "delete_message",
        }
    }
}

fn insert_sequence(tables: &mut StoreTables, record: &SequenceRecord) -> Result<()> {
    match record.side {
        SequenceSide::Sending => {
            if tables.sending.contains_key(&record.internal_id) {
                return Err(RmError::Conflict(format!(
                    "sending sequence '{}' already exists",
                    record.internal_id
                )));
            }
            if let Some(wire_id) = &record.sequence_id {
                if tables.sending_by_wire.contains_key(wire_id) {
                    return Err(RmError::Conflict(format!(
                        "sequence id '{}' already bound",
                        wire_id
                    )));
                }
                tables
                    .sending_by_wire
                    .insert(wire_id.clone(), record.internal_id.clone());
            }
            tables
                .sending
                .insert(record.internal_id.clone(), record.clone());
        }
        SequenceSide::Receiving => {
            let wire_id = receiving_key(record)?;
            if tables.receiving.contains_key(wire_id) {
                return Err(RmError::Conflict(format!(
                    "receiving sequence '{}' already exists",
                    wire_id
                )));
            }
            tables.receiving.insert(wire_id.to_string(), record.clone());
        }
    }
    Ok(())
}

fn update_sequence(
    tables: &mut StoreTables,
    record: &SequenceRecord,
    expected_revision: u64,
) -> Result<()> {
    let current = match record.side {
        SequenceSide::Sending => tables.sending.get(&record.internal_id),
        SequenceSide::Receiving => tables.receiving.get(receiving_key(record)?),
    }
    .ok_or_else(|| RmError::Conflict(format!("sequence '{}' is gone", record.internal_id)))?;

    if current.revision != expected_revision {
        return Err(RmError::Conflict(format!(
            "sequence '{}' changed (revision {} != {})",
            record.internal_id, current.revision, expected_revision
        )));
    }

    match (&current.sequence_id, &record.sequence_id) {
        (Some(old), Some(new)) if old != new => {
            return Err(RmError::Conflict(format!(
                "sequence id of '{}' is immutable ({} -> {})",
                record.internal_id, old, new
            )));
        }
        (Some(old), None) => {
            return Err(RmError::Conflict(format!(
                "sequence id '{}' cannot be unbound",
                old
            )));
        }
        _ => {}
    }

    match record.side {
        SequenceSide::Sending => {
            if let Some(wire_id) = &record.sequence_id {
                match tables.sending_by_wire.get(wire_id) {
                    Some(owner) if owner != &record.internal_id => {
                        return Err(RmError::Conflict(format!(
                            "sequence id '{}' already bound to '{}'",
                            wire_id, owner
                        )));
                    }
                    Some(_) => {}
                    None => {
                        tables
                            .sending_by_wire
                            .insert(wire_id.clone(), record.internal_id.clone());
                    }
                }
            }
            tables
                .sending
                .insert(record.internal_id.clone(), record.clone());
        }
        SequenceSide::Receiving => {
            tables
                .receiving
                .insert(receiving_key(record)?.to_string(), record.clone());
        }
    }
    Ok(())
}

fn receiving_key(record: &SequenceRecord) -> Result<&str> {
    record.sequence_id.as_deref().ok_or_else(|| {
        RmError::Conflict(format!(
            "receiving sequence '{}' has no sequence id",
            record.internal_id
        ))
    })
}
