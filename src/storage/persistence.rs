//! Journal and snapshot persistence for the reliable-messaging state store

use super::engine::{JournalRecord, LoadedState, StorageBackend};
use super::tables::StoreTables;
use crate::config::{DurabilityMode, JournalConfig};
use crate::core::{Result, RmError, now_ms};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{Level, event};

pub const SNAPSHOT_FILE: &str = "rm_snapshot.msgpack";
pub const JOURNAL_FILE: &str = "rm_journal.jsonl";
const SNAPSHOT_FORMAT_VERSION: u32 = 1;

// ============================================================================
// Snapshot file
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSnapshotFile {
    pub format_version: u32,
    pub last_seq: u64,
    pub metadata: SnapshotMetadata,
    pub tables: StoreTables,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at_unix_ms: i64,
    pub sending_sequences: usize,
    pub receiving_sequences: usize,
    pub pending_sends: usize,
}

impl StoreSnapshotFile {
    pub fn new(tables: StoreTables, last_seq: u64) -> Self {
        let metadata = SnapshotMetadata {
            created_at_unix_ms: now_ms(),
            sending_sequences: tables.sending.len(),
            receiving_sequences: tables.receiving.len(),
            pending_sends: tables.sends.len(),
        };
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            last_seq,
            metadata,
            tables,
        }
    }
}

// ============================================================================
// Journal backend
// ============================================================================

#[derive(Debug, Default)]
struct JournalState {
    commits_since_snapshot: usize,
    last_sync_unix_ms: i64,
}

/// Durable backend: JSON-lines journal of commits plus periodic MessagePack snapshots.
pub struct JournalBackend {
    root_dir: PathBuf,
    config: JournalConfig,
    state: Mutex<JournalState>,
}

impl JournalBackend {
    pub async fn open(root_dir: impl AsRef<Path>, config: JournalConfig) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();
        fs::create_dir_all(&root_dir)
            .await
            .map_err(|err| RmError::IoError(err.to_string()))?;

        Ok(Self {
            root_dir,
            config,
            state: Mutex::new(JournalState::default()),
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.root_dir.join(SNAPSHOT_FILE)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.root_dir.join(JOURNAL_FILE)
    }

    /// Appends one commit to the journal and syncs according to the durability mode.
    async fn append_record(&self, state: &mut JournalState, record: &JournalRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)
            .map_err(|err| RmError::Serialization(format!("serialize journal record: {}", err)))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path())
            .await
            .map_err(|err| RmError::IoError(err.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|err| RmError::IoError(err.to_string()))?;
        file.flush()
            .await
            .map_err(|err| RmError::IoError(err.to_string()))?;

        let now = now_ms();
        let must_sync = match self.config.durability {
            DurabilityMode::Strict => true,
            DurabilityMode::Eventual { sync_interval_ms } => {
                now - state.last_sync_unix_ms >= sync_interval_ms as i64
            }
        };
        if must_sync {
            file.sync_data()
                .await
                .map_err(|err| RmError::IoError(err.to_string()))?;
            state.last_sync_unix_ms = now;
        }
        Ok(())
    }

    /// Writes the snapshot to a temporary file and atomically renames it into place.
    async fn write_snapshot(&self, tables: &StoreTables, last_seq: u64) -> Result<()> {
        let snapshot = StoreSnapshotFile::new(tables.clone(), last_seq);
        let bytes = rmp_serde::to_vec_named(&snapshot)
            .map_err(|err| RmError::Serialization(format!("serialize snapshot: {}", err)))?;

        let path = self.snapshot_path();
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, bytes)
            .await
            .map_err(|err| RmError::IoError(err.to_string()))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|err| RmError::IoError(err.to_string()))?;
        Ok(())
    }

    /// Drops journal records already contained in the snapshot.
    async fn compact_journal(&self, keep_after_seq: u64) -> Result<()> {
        let retained = self
            .read_journal_records(keep_after_seq)
            .await?
            .into_iter()
            .map(|record| serde_json::to_string(&record))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| RmError::Serialization(format!("serialize journal record: {}", err)))?;

        let journal_path = self.journal_path();
        let tmp_path = journal_path.with_extension("tmp");
        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await
            .map_err(|err| RmError::IoError(err.to_string()))?;
        for line in retained {
            tmp.write_all(line.as_bytes())
                .await
                .map_err(|err| RmError::IoError(err.to_string()))?;
            tmp.write_all(b"\n")
                .await
                .map_err(|err| RmError::IoError(err.to_string()))?;
        }
        tmp.flush()
            .await
            .map_err(|err| RmError::IoError(err.to_string()))?;

        fs::rename(&tmp_path, &journal_path)
            .await
            .map_err(|err| RmError::IoError(err.to_string()))?;
        Ok(())
    }

    pub async fn read_snapshot(&self) -> Result<Option<StoreSnapshotFile>> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&path)
            .await
            .map_err(|err| RmError::IoError(err.to_string()))?;
        let snapshot = rmp_serde::from_slice::<StoreSnapshotFile>(&bytes)
            .map_err(|err| RmError::Serialization(format!("parse snapshot: {}", err)))?;
        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(RmError::Serialization(format!(
                "snapshot format {} is newer than supported {}",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        Ok(Some(snapshot))
    }

    /// Journal records with `seq > greater_than_seq`, in commit order.
    pub async fn read_journal_records(&self, greater_than_seq: u64) -> Result<Vec<JournalRecord>> {
        let path = self.journal_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .await
            .map_err(|err| RmError::IoError(err.to_string()))?;

        let mut records = Vec::new();
        let mut lines = BufReader::new(file).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|err| RmError::IoError(err.to_string()))?
        {
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str::<JournalRecord>(&line)
                .map_err(|err| RmError::Serialization(format!("parse journal record: {}", err)))?;
            if record.seq > greater_than_seq {
                records.push(record);
            }
        }

        records.sort_by(|a, b| a.seq.cmp(&b.seq));
        Ok(records)
    }
}

#[async_trait]
impl StorageBackend for JournalBackend {
    async fn load(&self) -> Result<LoadedState> {
        let (mut tables, snapshot_seq) = match self.read_snapshot().await? {
            Some(snapshot) => (snapshot.tables, snapshot.last_seq),
            None => (StoreTables::default(), 0),
        };

        let records = self.read_journal_records(snapshot_seq).await?;
        let mut last_seq = snapshot_seq;
        for record in &records {
            for op in &record.ops {
                op.apply_to(&mut tables).map_err(|err| {
                    RmError::Serialization(format!(
                        "journal record {} ({}) does not replay: {}",
                        record.seq,
                        op.label(),
                        err
                    ))
                })?;
            }
            last_seq = record.seq;
        }

        event!(
            Level::INFO,
            snapshot_seq,
            replayed = records.len(),
            last_seq,
            "journal store recovered"
        );
        Ok(LoadedState { tables, last_seq })
    }

    async fn persist(&self, record: &JournalRecord, tables: &StoreTables) -> Result<()> {
        let mut state = self.state.lock().await;
        self.append_record(&mut state, record).await?;

        state.commits_since_snapshot = state.commits_since_snapshot.saturating_add(1);
        if state.commits_since_snapshot >= self.config.snapshot_every_commits.max(1) {
            self.write_snapshot(tables, record.seq).await?;
            self.compact_journal(record.seq).await?;
            state.commits_since_snapshot = 0;
            event!(Level::DEBUG, seq = record.seq, "journal store snapshot written");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "journal"
    }
}
