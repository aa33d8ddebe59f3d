use super::engine::{JournalRecord, LoadedState, StorageBackend};
use super::tables::StoreTables;
use crate::core::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

/// Volatile backend: state lives only in the store's tables.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    commits: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commits that carried at least one operation.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn load(&self) -> Result<LoadedState> {
        Ok(LoadedState::default())
    }

    async fn persist(&self, _record: &JournalRecord, _tables: &StoreTables) -> Result<()> {
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
