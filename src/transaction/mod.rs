// ============================================================================
// Transaction Module
// ============================================================================
//
// Units of work over the state store, commit/rollback boundaries, bounded
// retry at the transaction boundary, and per-key work locks.
//
// Design Patterns Used:
// - Command Pattern: every mutation is a replayable StoreOp
// - Optimistic concurrency: record revisions checked at commit
// - Copy-on-Write: persistent maps give each unit a cheap snapshot
//
// ============================================================================

pub mod change;
pub mod locks;
pub mod manager;
pub mod state;

pub use change::StoreOp;
pub use locks::{WorkGuard, WorkLocks};
pub use manager::{StateStore, StoreStats};
pub use state::{UnitOfWork, UnitState};
