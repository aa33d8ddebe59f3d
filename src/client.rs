use crate::core::{Result, RmError};
use crate::engine::{DeliveryFailure, RmEngine, SendOptions, SendTicket, SequenceOptions};
use crate::storage::{
    InvokeRepository, SendRepository, SequenceRecord, SequenceRepository, SequenceSide,
    SequenceState, StorageBackend, StoreTables,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{Duration as TokioDuration, Instant, sleep};

/// Point-in-time view of one sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceReport {
    pub internal_id: String,
    pub sequence_id: Option<String>,
    pub side: SequenceSide,
    pub state: SequenceState,
    /// Acknowledged (sending) or received (receiving) ranges, e.g. "[1,3][5,5]".
    pub ranges: String,
    pub completed_messages: u64,
    pub last_message_number: Option<u64>,
    pub fully_acknowledged: bool,
    pub expected_replies: u64,
    pub pending_sends: usize,
    pub queued_invocations: usize,
    pub last_send_error: Option<String>,
}

impl SequenceReport {
    fn from_record(record: &SequenceRecord, tables: &StoreTables) -> Self {
        Self {
            internal_id: record.internal_id.clone(),
            sequence_id: record.sequence_id.clone(),
            side: record.side,
            state: record.state(),
            ranges: record.acked.to_string(),
            completed_messages: record.acked.covered_count(),
            last_message_number: record.last_message_number,
            fully_acknowledged: record.is_fully_acknowledged(),
            expected_replies: record.expected_replies,
            pending_sends: tables.sends_for_sequence(&record.internal_id).len(),
            queued_invocations: tables.invokes_for_sequence(&record.internal_id).len(),
            last_send_error: record.last_send_error.clone(),
        }
    }

    /// Terminated, or every message up to the last one acknowledged.
    pub fn is_complete(&self) -> bool {
        match self.state {
            SequenceState::Terminated => true,
            SequenceState::Failed => false,
            _ => self.fully_acknowledged,
        }
    }
}

/// Caller-facing API over an engine.
pub struct RmClient<B: StorageBackend> {
    engine: Arc<RmEngine<B>>,
}

impl<B: StorageBackend> Clone for RmClient<B> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<B: StorageBackend> RmClient<B> {
    pub fn new(engine: Arc<RmEngine<B>>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<RmEngine<B>> {
        &self.engine
    }

    /// Creates the sending sequence ahead of the first message.
    pub async fn create_sequence(
        &self,
        internal_id: &str,
        target: &str,
        options: SequenceOptions,
    ) -> Result<SequenceReport> {
        self.engine
            .establish_sending_sequence(internal_id, target, &options)
            .await?;
        self.outgoing_report(internal_id).await
    }

    pub async fn send(&self, internal_id: &str, target: &str, payload: Value) -> Result<SendTicket> {
        self.send_with(internal_id, target, payload, SendOptions::default())
            .await
    }

    pub async fn send_with(
        &self,
        internal_id: &str,
        target: &str,
        payload: Value,
        options: SendOptions,
    ) -> Result<SendTicket> {
        self.engine
            .send_application(internal_id, target, payload, &options)
            .await
    }

    pub async fn close_sequence(&self, internal_id: &str) -> Result<()> {
        self.engine.close_sequence(internal_id).await
    }

    pub async fn terminate_sequence(&self, internal_id: &str) -> Result<()> {
        self.engine.terminate_sequence(internal_id).await
    }

    pub async fn send_ack_request(&self, internal_id: &str) -> Result<()> {
        self.engine.request_acknowledgement(internal_id).await
    }

    /// Wire id of the sending sequence, once the peer has assigned it.
    pub async fn sequence_id(&self, internal_id: &str) -> Result<Option<String>> {
        let record = self.sending(internal_id).await?;
        Ok(record.sequence_id)
    }

    pub async fn last_send_error(&self, internal_id: &str) -> Result<Option<(String, i64)>> {
        let record = self.sending(internal_id).await?;
        Ok(record.last_send_error.zip(record.last_send_error_ms))
    }

    pub async fn outgoing_report(&self, internal_id: &str) -> Result<SequenceReport> {
        let tables = self.engine.store().snapshot().await;
        let record = tables
            .sending_by_internal_id(internal_id)
            .ok_or_else(|| RmError::SequenceNotFound(internal_id.to_string()))?;
        Ok(SequenceReport::from_record(&record, &tables))
    }

    pub async fn incoming_report(&self, sequence_id: &str) -> Result<SequenceReport> {
        let tables = self.engine.store().snapshot().await;
        let record = tables
            .receiving_by_sequence_id(sequence_id)
            .ok_or_else(|| RmError::SequenceNotFound(sequence_id.to_string()))?;
        Ok(SequenceReport::from_record(&record, &tables))
    }

    pub async fn outgoing_reports(&self) -> Vec<SequenceReport> {
        let tables = self.engine.store().snapshot().await;
        tables
            .sending_sequences()
            .iter()
            .map(|record| SequenceReport::from_record(record, &tables))
            .collect()
    }

    pub async fn incoming_reports(&self) -> Vec<SequenceReport> {
        let tables = self.engine.store().snapshot().await;
        tables
            .receiving_sequences()
            .iter()
            .map(|record| SequenceReport::from_record(record, &tables))
            .collect()
    }

    /// Waits until the sending sequence terminates or is fully acknowledged.
    pub async fn wait_until_sequence_completed(
        &self,
        internal_id: &str,
        max_wait: TokioDuration,
    ) -> Result<SequenceReport> {
        let deadline = Instant::now() + max_wait;
        loop {
            let report = self.outgoing_report(internal_id).await?;
            if report.state == SequenceState::Failed {
                return Err(RmError::DeliveryFailed(
                    internal_id.to_string(),
                    report
                        .last_send_error
                        .unwrap_or_else(|| "sequence failed".to_string()),
                ));
            }
            if report.is_complete() {
                return Ok(report);
            }
            if Instant::now() >= deadline {
                return Err(RmError::Timeout(format!(
                    "sequence '{}' not completed within {:?}",
                    internal_id, max_wait
                )));
            }
            sleep(TokioDuration::from_millis(20)).await;
        }
    }

    /// Invokes stored inbound messages even if earlier ones are missing.
    pub async fn force_dispatch_of_inbound(&self, sequence_id: &str) -> Result<usize> {
        self.engine.force_dispatch(sequence_id).await
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<DeliveryFailure> {
        self.engine.subscribe_failures()
    }

    async fn sending(&self, internal_id: &str) -> Result<SequenceRecord> {
        self.engine
            .store()
            .snapshot()
            .await
            .sending_by_internal_id(internal_id)
            .ok_or_else(|| RmError::SequenceNotFound(internal_id.to_string()))
    }
}
