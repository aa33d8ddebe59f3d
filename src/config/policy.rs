use crate::core::{MessageKind, Result, RmError, SpecVersion};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Durability mode for the journal backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// Every commit is fsynced before it is acknowledged.
    #[default]
    Strict,
    /// Commits are flushed, and fsynced at most every `sync_interval_ms`.
    Eventual { sync_interval_ms: u64 },
}

/// Settings for the journal-backed store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    pub durability: DurabilityMode,
    /// Write a snapshot and compact the journal after this many commits.
    pub snapshot_every_commits: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            durability: DurabilityMode::Strict,
            snapshot_every_commits: 256,
        }
    }
}

/// Bounded retry of a unit of work that hit a storage conflict or I/O failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Initial backoff duration in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff duration in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for StoreRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 5,
            max_backoff_ms: 250,
        }
    }
}

impl StoreRetryPolicy {
    /// Exponential backoff for the given (1-based) attempt.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let base = self.initial_backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor).min(max)
    }
}

/// Reliable-messaging policy shared by every sequence an engine owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RmPolicy {
    pub spec_version: SpecVersion,
    /// Invoke the application in ascending message-number order.
    pub in_order: bool,
    /// Replay a recorded reply instead of re-invoking on duplicates.
    pub exactly_once: bool,
    pub acknowledgement_interval_ms: u64,
    pub retransmission_interval_ms: u64,
    pub max_retransmission_interval_ms: u64,
    pub exponential_backoff: bool,
    /// `None` retries forever.
    pub max_retransmissions: Option<u32>,
    pub inactivity_timeout_ms: Option<u64>,
    pub make_connection_enabled: bool,
    pub polling_wait_ms: u64,
    pub terminate_delay_ms: u64,
    /// Kinds the sender treats as lost in transit; each attempt still counts.
    pub msg_types_to_drop: Vec<MessageKind>,
    pub sender_interval_ms: u64,
    pub invoker_interval_ms: u64,
    pub store_retry: StoreRetryPolicy,
}

impl Default for RmPolicy {
    fn default() -> Self {
        Self {
            spec_version: SpecVersion::V1_1,
            in_order: true,
            exactly_once: true,
            acknowledgement_interval_ms: 3_000,
            retransmission_interval_ms: 6_000,
            max_retransmission_interval_ms: 60_000,
            exponential_backoff: true,
            max_retransmissions: Some(10),
            inactivity_timeout_ms: None,
            make_connection_enabled: true,
            polling_wait_ms: 3_000,
            terminate_delay_ms: 100,
            msg_types_to_drop: Vec::new(),
            sender_interval_ms: 200,
            invoker_interval_ms: 500,
            store_retry: StoreRetryPolicy::default(),
        }
    }
}

impl RmPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spec_version(mut self, version: SpecVersion) -> Self {
        self.spec_version = version;
        self
    }

    pub fn in_order(mut self, in_order: bool) -> Self {
        self.in_order = in_order;
        self
    }

    pub fn exactly_once(mut self, exactly_once: bool) -> Self {
        self.exactly_once = exactly_once;
        self
    }

    pub fn acknowledgement_interval_ms(mut self, interval: u64) -> Self {
        self.acknowledgement_interval_ms = interval;
        self
    }

    pub fn retransmission_interval_ms(mut self, interval: u64) -> Self {
        self.retransmission_interval_ms = interval;
        self
    }

    pub fn exponential_backoff(mut self, enabled: bool) -> Self {
        self.exponential_backoff = enabled;
        self
    }

    pub fn max_retransmissions(mut self, max: Option<u32>) -> Self {
        self.max_retransmissions = max;
        self
    }

    pub fn inactivity_timeout_ms(mut self, timeout: Option<u64>) -> Self {
        self.inactivity_timeout_ms = timeout;
        self
    }

    pub fn make_connection_enabled(mut self, enabled: bool) -> Self {
        self.make_connection_enabled = enabled;
        self
    }

    pub fn max_retransmission_interval_ms(mut self, interval: u64) -> Self {
        self.max_retransmission_interval_ms = interval;
        self
    }

    pub fn polling_wait_ms(mut self, wait: u64) -> Self {
        self.polling_wait_ms = wait;
        self
    }

    pub fn worker_intervals_ms(mut self, sender: u64, invoker: u64) -> Self {
        self.sender_interval_ms = sender;
        self.invoker_interval_ms = invoker;
        self
    }

    pub fn terminate_delay_ms(mut self, delay: u64) -> Self {
        self.terminate_delay_ms = delay;
        self
    }

    pub fn drop_message_kind(mut self, kind: MessageKind) -> Self {
        if !self.msg_types_to_drop.contains(&kind) {
            self.msg_types_to_drop.push(kind);
        }
        self
    }

    pub fn store_retry(mut self, retry: StoreRetryPolicy) -> Self {
        self.store_retry = retry;
        self
    }

    /// Delay before the next transmission after `attempt` sends (1-based).
    pub fn retransmission_delay_ms(&self, attempt: u32) -> u64 {
        let base = self.retransmission_interval_ms.max(1);
        if !self.exponential_backoff {
            return base;
        }
        let max = self.max_retransmission_interval_ms.max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor).min(max)
    }

    pub fn drops(&self, kind: MessageKind) -> bool {
        self.msg_types_to_drop.contains(&kind)
    }

    /// Whether a sequence that has made `attempts` transmissions may make another.
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        match self.max_retransmissions {
            Some(max) => attempts < max,
            None => true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.retransmission_interval_ms == 0 {
            return Err(RmError::Config(
                "retransmission_interval_ms must be > 0".to_string(),
            ));
        }
        if self.max_retransmission_interval_ms < self.retransmission_interval_ms {
            return Err(RmError::Config(
                "max_retransmission_interval_ms cannot be below retransmission_interval_ms"
                    .to_string(),
            ));
        }
        if self.max_retransmissions == Some(0) {
            return Err(RmError::Config(
                "max_retransmissions must allow at least one attempt".to_string(),
            ));
        }
        if self.store_retry.max_attempts == 0 {
            return Err(RmError::Config(
                "store_retry.max_attempts must be > 0".to_string(),
            ));
        }
        if self.msg_types_to_drop.contains(&MessageKind::CreateSequence) {
            return Err(RmError::Config(
                "CreateSequence cannot be dropped; no sequence could ever be established"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let policy: RmPolicy = serde_json::from_str(json)?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }
}
