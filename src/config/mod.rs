pub mod policy;

pub use policy::{DurabilityMode, JournalConfig, RmPolicy, StoreRetryPolicy};
