// ============================================================================
// Unit of Work
// ============================================================================
//
// A unit of work reads from a private snapshot of the store, records every
// mutation as a StoreOp applied to that snapshot, and either commits the ops
// atomically or is discarded.
//
// State transitions:
//   Active ──commit──> Committed
//     │
//     └──rollback / drop──> RolledBack
//
// ============================================================================

use super::StoreOp;
use super::manager::StateStore;
use crate::core::{Result, RmError};
use crate::storage::{
    InvokeRecord, SendRecord, SequenceRecord, StorageBackend, StoreTables, StoreView,
    StoredMessage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Active,
    Committed,
    RolledBack,
}

pub struct UnitOfWork<'s, B: StorageBackend> {
    store: &'s StateStore<B>,
    label: String,
    base_version: u64,
    tables: StoreTables,
    ops: Vec<StoreOp>,
    state: UnitState,
}

impl<'s, B: StorageBackend> UnitOfWork<'s, B> {
    pub(crate) fn new(
        store: &'s StateStore<B>,
        label: impl Into<String>,
        base_version: u64,
        tables: StoreTables,
    ) -> Self {
        Self {
            store,
            label: label.into(),
            base_version,
            tables,
            ops: Vec::new(),
            state: UnitState::Active,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn is_dirty(&self) -> bool {
        !self.ops.is_empty()
    }

    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    fn record(&mut self, op: StoreOp) -> Result<()> {
        if self.state != UnitState::Active {
            return Err(RmError::Conflict(format!(
                "unit of work '{}' is no longer active",
                self.label
            )));
        }
        op.apply_to(&mut self.tables)?;
        self.ops.push(op);
        Ok(())
    }

    /// Inserts a new sequence; fails with a conflict if the key is taken.
    pub fn insert_sequence(&mut self, mut record: SequenceRecord) -> Result<SequenceRecord> {
        record.revision = 1;
        self.record(StoreOp::InsertSequence {
            record: record.clone(),
        })?;
        Ok(record)
    }

    /// Writes back a record read in this unit and returns the stored version.
    pub fn update_sequence(&mut self, record: SequenceRecord) -> Result<SequenceRecord> {
        let expected_revision = record.revision;
        let mut next = record;
        next.revision = expected_revision + 1;
        self.record(StoreOp::UpdateSequence {
            record: next.clone(),
            expected_revision,
        })?;
        Ok(next)
    }

    pub fn insert_send(&mut self, mut record: SendRecord) -> Result<SendRecord> {
        record.revision = 1;
        self.record(StoreOp::InsertSend {
            record: record.clone(),
        })?;
        Ok(record)
    }

    pub fn update_send(&mut self, record: SendRecord) -> Result<SendRecord> {
        let expected_revision = record.revision;
        let mut next = record;
        next.revision = expected_revision + 1;
        self.record(StoreOp::UpdateSend {
            record: next.clone(),
            expected_revision,
        })?;
        Ok(next)
    }

    pub fn delete_send(&mut self, message_id: &str) -> Result<()> {
        self.record(StoreOp::DeleteSend {
            message_id: message_id.to_string(),
        })
    }

    /// Removes a send record together with its stored body.
    pub fn retire_send(&mut self, record: &SendRecord) -> Result<()> {
        self.delete_send(&record.message_id)?;
        self.delete_message(&record.body_key)
    }

    pub fn put_invoke(&mut self, record: InvokeRecord) -> Result<()> {
        self.record(StoreOp::PutInvoke { record })
    }

    pub fn delete_invoke(&mut self, sequence_id: &str, message_number: u64) -> Result<()> {
        self.record(StoreOp::DeleteInvoke {
            sequence_id: sequence_id.to_string(),
            message_number,
        })
    }

    pub fn put_message(&mut self, message: StoredMessage) -> Result<()> {
        self.record(StoreOp::PutMessage { message })
    }

    pub fn delete_message(&mut self, key: &str) -> Result<()> {
        self.record(StoreOp::DeleteMessage {
            key: key.to_string(),
        })
    }

    /// Publishes the recorded operations. A unit without operations commits without I/O.
    pub async fn commit(mut self) -> Result<u64> {
        if self.state != UnitState::Active {
            return Err(RmError::Conflict(format!(
                "unit of work '{}' is no longer active",
                self.label
            )));
        }
        let ops = std::mem::take(&mut self.ops);
        let tables = std::mem::take(&mut self.tables);
        let version = self
            .store
            .commit_unit(&self.label, self.base_version, ops, tables)
            .await;
        self.state = match version {
            Ok(_) => UnitState::Committed,
            Err(_) => UnitState::RolledBack,
        };
        version
    }

    pub fn rollback(mut self) {
        self.ops.clear();
        self.state = UnitState::RolledBack;
    }
}

impl<B: StorageBackend> StoreView for UnitOfWork<'_, B> {
    fn tables(&self) -> &StoreTables {
        &self.tables
    }
}
