use super::tables::StoreTables;
use crate::core::Result;
use crate::transaction::StoreOp;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One committed unit of work as it is written to durable storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    pub seq: u64,
    pub ts_unix_ms: i64,
    pub label: String,
    pub ops: Vec<StoreOp>,
}

/// State recovered by a backend at startup.
#[derive(Debug, Clone, Default)]
pub struct LoadedState {
    pub tables: StoreTables,
    pub last_seq: u64,
}

/// Storage backend trait - allows pluggable durability for the state store
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Recover the tables and the last committed sequence number.
    async fn load(&self) -> Result<LoadedState>;

    /// Make a commit durable. `tables` is the state after applying `record`.
    async fn persist(&self, record: &JournalRecord, tables: &StoreTables) -> Result<()>;

    fn name(&self) -> &'static str;
}
