// ============================================================================
// seqrelay Library
// ============================================================================
//
// Reliable, ordered, exactly-once message exchange between two endpoints
// over an unreliable transport: sequences, acknowledgement ranges,
// retransmission with backoff, in-order delivery and MakeConnection polling
// for endpoints that cannot be reached directly.
//
// ============================================================================

pub mod client;
pub mod config;
pub mod core;
pub mod engine;
pub mod interface;
pub mod ledger;
pub mod protocol;
pub mod storage;
pub mod transaction;
pub mod worker;

// Re-export main types for convenience
pub use client::{RmClient, SequenceReport};
pub use config::{DurabilityMode, JournalConfig, RmPolicy, StoreRetryPolicy};
pub use core::{FaultCode, MessageKind, ProtocolFault, Result, RmError, SpecVersion};
pub use engine::{
    DeliveryFailure, DispatchResult, EngineBuilder, EngineStats, RmEngine, SendOptions,
    SendTicket, SequenceOptions,
};
pub use interface::{
    Application, NoSecurity, NullApplication, SecurityManager, TokenMatchSecurity, Transport,
};
pub use ledger::{AckRange, RangeSet};
pub use protocol::{Envelope, ProtocolBody};
pub use storage::{JournalBackend, MemoryBackend, SequenceState, StorageBackend};
pub use transaction::StateStore;
pub use worker::{EngineWorker, WorkerKind, WorkerSet};
