pub mod engine;
pub mod memory;
pub mod persistence;
pub mod records;
pub mod tables;

pub use engine::{JournalRecord, LoadedState, StorageBackend};
pub use memory::MemoryBackend;
pub use persistence::{JOURNAL_FILE, JournalBackend, SNAPSHOT_FILE, StoreSnapshotFile};
pub use records::{
    InvokeRecord, ReplyCorrelation, SendRecord, SequenceRecord, SequenceSide, SequenceState,
    StoredMessage,
};
pub use tables::{
    InvokeRepository, SendRepository, SequenceRepository, StoreTables, StoreView, invoke_key,
};
