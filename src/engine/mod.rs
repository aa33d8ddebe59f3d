// ============================================================================
// Reliable-messaging engine
// ============================================================================
//
// One engine owns the state store of an endpoint and implements both the
// sending and the receiving side of the protocol. The behavior is split by
// concern across the submodules, all extending `RmEngine`.
//
// ============================================================================

mod ack;
mod faults;
mod inbound;
mod invoker;
mod lifecycle;
mod polling;
mod sender;

pub use inbound::InboundDisposition;
pub use lifecycle::{SendOptions, SendTicket, SequenceOptions};
pub use sender::DispatchResult;

use crate::config::RmPolicy;
use crate::core::{
    ANONYMOUS_ADDRESS, MessageKind, Result, RmError, is_anonymous, is_plain_anonymous,
    new_rm_anonymous_address, now_ms,
};
use crate::interface::{Application, NoSecurity, NullApplication, SecurityManager, Transport};
use crate::protocol::{Envelope, ProtocolBody};
use crate::storage::{
    SendRecord, SequenceRecord, SequenceRepository, StorageBackend, StoredMessage,
};
use crate::transaction::{StateStore, UnitOfWork, WorkGuard, WorkLocks};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Notify, broadcast};
use tracing::{Instrument, Level, event, info_span};

/// Surfaced to the caller when a sending sequence gives up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    pub internal_id: String,
    pub sequence_id: Option<String>,
    pub reason: String,
    pub failed_at_ms: i64,
}

#[derive(Debug, Default)]
struct EngineCounters {
    transmissions: AtomicU64,
    transport_failures: AtomicU64,
    invocations: AtomicU64,
    duplicates: AtomicU64,
    faults_returned: AtomicU64,
    polls_served: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub transmissions: u64,
    pub transport_failures: u64,
    pub invocations: u64,
    pub duplicates: u64,
    pub faults_returned: u64,
    pub polls_served: u64,
}

pub struct RmEngine<B: StorageBackend> {
    store: StateStore<B>,
    locks: Arc<WorkLocks>,
    policy: RmPolicy,
    transport: Arc<dyn Transport>,
    application: Arc<dyn Application>,
    security: Arc<dyn SecurityManager>,
    endpoint: String,
    failures: broadcast::Sender<DeliveryFailure>,
    sender_wake: Notify,
    invoker_wake: Notify,
    counters: EngineCounters,
}

pub struct EngineBuilder<B: StorageBackend> {
    store: StateStore<B>,
    policy: RmPolicy,
    transport: Option<Arc<dyn Transport>>,
    application: Arc<dyn Application>,
    security: Arc<dyn SecurityManager>,
    local_address: Option<String>,
}

impl<B: StorageBackend> EngineBuilder<B> {
    pub fn policy(mut self, policy: RmPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn application(mut self, application: Arc<dyn Application>) -> Self {
        self.application = application;
        self
    }

    pub fn security(mut self, security: Arc<dyn SecurityManager>) -> Self {
        self.security = security;
        self
    }

    /// Addressable endpoint for replies and acknowledgements. Without one the
    /// engine is anonymous and, if MakeConnection is enabled, polls for them.
    pub fn local_address(mut self, address: impl Into<String>) -> Self {
        self.local_address = Some(address.into());
        self
    }

    pub fn build(self) -> Result<Arc<RmEngine<B>>> {
        self.policy.validate()?;
        let transport = self
            .transport
            .ok_or_else(|| RmError::Config("a transport must be configured".to_string()))?;

        let endpoint = match self.local_address {
            Some(address) => address,
            None if self.policy.make_connection_enabled => new_rm_anonymous_address(),
            None => ANONYMOUS_ADDRESS.to_string(),
        };
        let (failures, _) = broadcast::channel(64);

        Ok(Arc::new(RmEngine {
            store: self.store,
            locks: WorkLocks::new(),
            policy: self.policy,
            transport,
            application: self.application,
            security: self.security,
            endpoint,
            failures,
            sender_wake: Notify::new(),
            invoker_wake: Notify::new(),
            counters: EngineCounters::default(),
        }))
    }
}

impl<B: StorageBackend> RmEngine<B> {
    pub fn builder(store: StateStore<B>) -> EngineBuilder<B> {
        EngineBuilder {
            store,
            policy: RmPolicy::default(),
            transport: None,
            application: Arc::new(NullApplication),
            security: Arc::new(NoSecurity),
            local_address: None,
        }
    }

    pub fn policy(&self) -> &RmPolicy {
        &self.policy
    }

    pub fn store(&self) -> &StateStore<B> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<WorkLocks> {
        &self.locks
    }

    /// Address peers use for replies and acknowledgements to this engine.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// True when peers cannot push to this engine and it must poll.
    pub fn is_polling_endpoint(&self) -> bool {
        self.policy.make_connection_enabled
            && is_anonymous(Some(&self.endpoint))
            && !is_plain_anonymous(Some(&self.endpoint))
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<DeliveryFailure> {
        self.failures.subscribe()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            transmissions: self.counters.transmissions.load(Ordering::Relaxed),
            transport_failures: self.counters.transport_failures.load(Ordering::Relaxed),
            invocations: self.counters.invocations.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            faults_returned: self.counters.faults_returned.load(Ordering::Relaxed),
            polls_served: self.counters.polls_served.load(Ordering::Relaxed),
        }
    }

    pub(crate) async fn sender_notified(&self) {
        self.sender_wake.notified().await;
    }

    pub(crate) async fn invoker_notified(&self) {
        self.invoker_wake.notified().await;
    }

    /// Waits for exclusive use of one sequence. Keyed like
    /// `SendRecord::internal_id`: the internal id of a sending sequence, the
    /// wire id of a receiving one. Holders never take a second lock.
    pub(crate) async fn lock_sequence(&self, owner_id: &str) -> WorkGuard {
        self.locks.acquire(format!("seq:{}", owner_id)).await
    }

    /// Locks the sending sequence bound to wire id `sequence_id`, if any.
    pub(crate) async fn lock_sending_by_wire_id(&self, sequence_id: &str) -> Option<WorkGuard> {
        let internal_id = self
            .store
            .snapshot()
            .await
            .sending_by_sequence_id(sequence_id)?
            .internal_id;
        Some(self.lock_sequence(&internal_id).await)
    }

    fn wake_sender(&self) {
        self.sender_wake.notify_one();
    }

    fn wake_invoker(&self) {
        self.invoker_wake.notify_one();
    }

    fn publish_failure(&self, failure: DeliveryFailure) {
        event!(
            Level::WARN,
            internal_id = %failure.internal_id,
            reason = %failure.reason,
            "sequence failed"
        );
        let _ = self.failures.send(failure);
    }

    /// Stores `envelope` as the body of `record` and queues the record.
    fn enqueue(
        &self,
        unit: &mut UnitOfWork<'_, B>,
        record: SendRecord,
        envelope: Envelope,
    ) -> Result<SendRecord> {
        unit.put_message(StoredMessage {
            key: record.body_key.clone(),
            envelope,
            stored_ms: now_ms(),
        })?;
        unit.insert_send(record)
    }

    /// Sending or receiving sequence that owns a send record.
    fn owner_of(&self, unit: &UnitOfWork<'_, B>, record: &SendRecord) -> Option<SequenceRecord> {
        unit.sending_by_internal_id(&record.internal_id)
            .or_else(|| unit.receiving_by_sequence_id(&record.internal_id))
    }

    // ========================================================================
    // Inbound entry points
    // ========================================================================

    /// Handles a message that arrived with a free back channel. The returned
    /// envelope, if any, is the synchronous response.
    pub async fn deliver(&self, envelope: Envelope) -> Result<Option<Envelope>> {
        self.process(envelope, true).await
    }

    /// Handles a message that arrived without a back channel.
    pub async fn deliver_one_way(&self, envelope: Envelope) -> Result<()> {
        self.process(envelope, false).await.map(|_| ())
    }

    async fn process(&self, envelope: Envelope, back_channel: bool) -> Result<Option<Envelope>> {
        let kind = envelope.kind();
        let span = info_span!(
            "rm.deliver",
            kind = %kind,
            message_id = %envelope.message_id,
            back_channel
        );

        async move {
            let request_id = envelope.message_id.clone();
            let reply_to = envelope.reply_to.clone();
            match self.route(kind, envelope, back_channel).await {
                Ok(response) => Ok(response),
                Err(RmError::Fault(fault)) => {
                    self.counters.faults_returned.fetch_add(1, Ordering::Relaxed);
                    event!(Level::WARN, fault = %fault, "inbound message faulted");
                    let response = Envelope::fault(fault)
                        .with_relates_to(request_id)
                        .with_to(reply_to.clone());
                    if back_channel {
                        return Ok(Some(response));
                    }
                    self.send_out_of_band(response, reply_to.as_deref()).await;
                    Ok(None)
                }
                Err(err) => Err(err),
            }
        }
        .instrument(span)
        .await
    }

    /// Exhaustive message-kind table.
    async fn route(
        &self,
        kind: MessageKind,
        envelope: Envelope,
        back_channel: bool,
    ) -> Result<Option<Envelope>> {
        for ack in &envelope.acknowledgements {
            self.process_acknowledgement(ack, &envelope).await?;
        }

        let response = match kind {
            MessageKind::CreateSequence => Some(self.accept_create_sequence(&envelope).await?),
            MessageKind::CreateSequenceResponse => {
                self.handle_create_sequence_response(&envelope).await?;
                None
            }
            MessageKind::CloseSequence => self.accept_close(&envelope).await?,
            MessageKind::CloseSequenceResponse => {
                self.handle_close_response(&envelope).await?;
                None
            }
            MessageKind::TerminateSequence => self.accept_terminate(&envelope).await?,
            MessageKind::TerminateSequenceResponse => {
                self.handle_terminate_response(&envelope).await?;
                None
            }
            MessageKind::Application => {
                self.process_sequence_message(&envelope, back_channel).await?
            }
            MessageKind::Acknowledgement | MessageKind::AckRequest => None,
            MessageKind::MakeConnection => self.handle_make_connection(&envelope).await?,
            MessageKind::Fault => {
                self.handle_peer_fault(&envelope).await?;
                None
            }
        };

        let response = if envelope.ack_requested.is_empty() {
            response
        } else {
            self.answer_ack_requests(&envelope, response, back_channel)
                .await?
        };

        if !back_channel {
            if let Some(response) = response {
                self.send_out_of_band(response, envelope.reply_to.as_deref())
                    .await;
            }
            return Ok(None);
        }
        Ok(response)
    }

    /// Best-effort push of a response that has no back channel to travel on.
    async fn send_out_of_band(&self, response: Envelope, destination: Option<&str>) {
        let Some(destination) = destination.filter(|addr| !is_anonymous(Some(addr))) else {
            event!(
                Level::DEBUG,
                kind = %response.kind(),
                "response dropped: no back channel and no addressable destination"
            );
            return;
        };
        if let Err(err) = self.transport.send(response, destination).await {
            event!(Level::WARN, error = %err, destination, "out-of-band response not sent");
        }
    }

    pub(crate) fn body_sequence_id(envelope: &Envelope) -> Option<&str> {
        match &envelope.body {
            ProtocolBody::CreateSequenceResponse { sequence_id, .. }
            | ProtocolBody::CloseSequence { sequence_id, .. }
            | ProtocolBody::CloseSequenceResponse { sequence_id }
            | ProtocolBody::TerminateSequence { sequence_id, .. }
            | ProtocolBody::TerminateSequenceResponse { sequence_id } => Some(sequence_id),
            _ => None,
        }
    }
}
