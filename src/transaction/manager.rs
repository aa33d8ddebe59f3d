// ============================================================================
// State Store
// ============================================================================

use super::StoreOp;
use super::state::UnitOfWork;
use crate::config::StoreRetryPolicy;
use crate::core::{Result, RmError, now_ms};
use crate::storage::{JournalRecord, StorageBackend, StoreTables};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::time::{Duration as TokioDuration, sleep};
use tracing::{Level, event};

struct StoreInner {
    tables: StoreTables,
    version: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub version: u64,
    pub commits: u64,
    pub conflicts: u64,
    pub retries: u64,
}

/// Transactional store for sequence, send and invoke records.
///
/// Units of work run against private snapshots. Commits are serialized; a
/// unit whose base version is stale has its ops re-applied on top of the
/// latest tables, and revision checks turn lost updates into conflicts.
pub struct StateStore<B: StorageBackend> {
    backend: B,
    inner: Mutex<StoreInner>,
    retry: StoreRetryPolicy,
    commits: AtomicU64,
    conflicts: AtomicU64,
    retries: AtomicU64,
}

impl<B: StorageBackend> StateStore<B> {
    pub async fn open(backend: B, retry: StoreRetryPolicy) -> Result<Self> {
        let loaded = backend.load().await?;
        event!(
            Level::DEBUG,
            backend = backend.name(),
            version = loaded.last_seq,
            "state store opened"
        );
        Ok(Self {
            backend,
            inner: Mutex::new(StoreInner {
                tables: loaded.tables,
                version: loaded.last_seq,
            }),
            retry,
            commits: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn begin(&self, label: impl Into<String>) -> UnitOfWork<'_, B> {
        let inner = self.inner.lock().await;
        UnitOfWork::new(self, label, inner.version, inner.tables.clone())
    }

    /// Consistent read-only copy of the current tables.
    pub async fn snapshot(&self) -> StoreTables {
        self.inner.lock().await.tables.clone()
    }

    pub async fn stats(&self) -> StoreStats {
        StoreStats {
            version: self.inner.lock().await.version,
            commits: self.commits.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }

    pub(crate) async fn commit_unit(
        &self,
        label: &str,
        base_version: u64,
        ops: Vec<StoreOp>,
        local_tables: StoreTables,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        if ops.is_empty() {
            return Ok(inner.version);
        }

        let next_tables = if inner.version == base_version {
            local_tables
        } else {
            let mut rebased = inner.tables.clone();
            for op in &ops {
                if let Err(err) = op.apply_to(&mut rebased) {
                    self.conflicts.fetch_add(1, Ordering::Relaxed);
                    event!(Level::DEBUG, unit = label, error = %err, "unit of work conflicted");
                    return Err(err);
                }
            }
            rebased
        };

        let record = JournalRecord {
            seq: inner.version + 1,
            ts_unix_ms: now_ms(),
            label: label.to_string(),
            ops,
        };
        self.backend.persist(&record, &next_tables).await?;

        inner.tables = next_tables;
        inner.version = record.seq;
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(record.seq)
    }

    /// Runs `work` in a unit of work and commits it, retrying conflicts and
    /// storage failures with exponential backoff up to the configured budget.
    pub async fn transact<T, F>(&self, label: &str, mut work: F) -> Result<T>
    where
        F: FnMut(&mut UnitOfWork<'_, B>) -> Result<T> + Send,
        T: Send,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_err: Option<RmError> = None;

        for attempt in 1..=max_attempts {
            let mut unit = self.begin(label).await;
            let outcome = match work(&mut unit) {
                Ok(value) => unit.commit().await.map(|_| value),
                Err(err) => {
                    unit.rollback();
                    Err(err)
                }
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    event!(
                        Level::DEBUG,
                        unit = label,
                        attempt,
                        error = %err,
                        "unit of work will be retried"
                    );
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }

            if attempt < max_attempts {
                self.retries.fetch_add(1, Ordering::Relaxed);
                sleep(TokioDuration::from_millis(self.retry.backoff_ms(attempt))).await;
            }
        }

        let reason = last_err
            .map(|err| err.to_string())
            .unwrap_or_else(|| "no attempt made".to_string());
        event!(Level::WARN, unit = label, reason = %reason, "unit of work retries exhausted");
        Err(RmError::RetriesExhausted(format!("{}: {}", label, reason)))
    }
}
