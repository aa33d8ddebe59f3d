//! Shared fixtures for the integration tests: in-process transports, a
//! recording application and helpers that play the remote peer by hand.

#![allow(dead_code)]

use async_trait::async_trait;
use seqrelay::core::{FaultCode, MessageKind, SpecVersion};
use seqrelay::ledger::AckRange;
use seqrelay::protocol::{
    Envelope, MakeConnection, Offer, ProtocolBody, SequenceAcknowledgement, SequenceHeader,
};
use seqrelay::{
    Application, JournalBackend, JournalConfig, MemoryBackend, Result, RmEngine, RmError,
    RmPolicy, StateStore, StoreRetryPolicy, Transport,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

pub const CLIENT: &str = "mem://client";
pub const SERVER: &str = "mem://server";

pub type Engine = Arc<RmEngine<MemoryBackend>>;

/// Records every transmission and answers nothing, or fails every attempt.
#[derive(Default)]
pub struct CaptureTransport {
    sent: Mutex<Vec<(String, Envelope)>>,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl CaptureTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn unreachable() -> Arc<Self> {
        let transport = Self::default();
        transport.failing.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(String, Envelope)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_of(&self, kind: MessageKind) -> Vec<Envelope> {
        self.sent()
            .into_iter()
            .filter(|(_, envelope)| envelope.kind() == kind)
            .map(|(_, envelope)| envelope)
            .collect()
    }

    pub fn last_of(&self, kind: MessageKind) -> Option<Envelope> {
        self.sent_of(kind).pop()
    }
}

#[async_trait]
impl Transport for CaptureTransport {
    async fn send(&self, envelope: Envelope, destination: &str) -> Result<Option<Envelope>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(RmError::Transport(format!("{} unreachable", destination)));
        }
        self.sent
            .lock()
            .unwrap()
            .push((destination.to_string(), envelope));
        Ok(None)
    }
}

/// Routes envelopes to registered engines, using the back channel.
#[derive(Default)]
pub struct Loopback {
    routes: RwLock<HashMap<String, Engine>>,
}

impl Loopback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, address: &str, engine: Engine) {
        self.routes.write().await.insert(address.to_string(), engine);
    }
}

#[async_trait]
impl Transport for Loopback {
    async fn send(&self, envelope: Envelope, destination: &str) -> Result<Option<Envelope>> {
        let engine = self
            .routes
            .read()
            .await
            .get(destination)
            .cloned()
            .ok_or_else(|| RmError::Transport(format!("no route to {}", destination)))?;
        engine.deliver(envelope).await
    }
}

/// Remembers what it was handed; optionally answers with an echo.
#[derive(Default)]
pub struct Recorder {
    received: Mutex<Vec<(String, u64, Value)>>,
    echo: bool,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn echoing() -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
            echo: true,
        })
    }

    pub fn numbers(&self) -> Vec<u64> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|(_, number, _)| *number)
            .collect()
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl Application for Recorder {
    async fn invoke(
        &self,
        sequence_id: &str,
        message_number: u64,
        payload: Value,
    ) -> Result<Option<Value>> {
        self.received
            .lock()
            .unwrap()
            .push((sequence_id.to_string(), message_number, payload.clone()));
        if self.echo {
            return Ok(Some(json!({ "echo": payload })));
        }
        Ok(None)
    }
}

/// Immediate acknowledgements and termination; retransmission far enough
/// out that tests driving the sender by hand never see a resend.
pub fn quiet_policy() -> RmPolicy {
    RmPolicy::default()
        .retransmission_interval_ms(60_000)
        .acknowledgement_interval_ms(0)
        .terminate_delay_ms(0)
}

pub async fn engine_with(
    transport: Arc<dyn Transport>,
    address: Option<&str>,
    application: Arc<dyn Application>,
    policy: RmPolicy,
) -> Engine {
    let store = StateStore::open(MemoryBackend::new(), StoreRetryPolicy::default())
        .await
        .unwrap();
    let mut builder = RmEngine::builder(store)
        .policy(policy)
        .transport(transport)
        .application(application);
    if let Some(address) = address {
        builder = builder.local_address(address);
    }
    builder.build().unwrap()
}

/// An engine over the journal-backed store rooted at `dir`.
pub async fn journal_engine(
    dir: &Path,
    config: JournalConfig,
    transport: Arc<dyn Transport>,
    application: Arc<dyn Application>,
    address: &str,
) -> Arc<RmEngine<JournalBackend>> {
    let backend = JournalBackend::open(dir, config).await.unwrap();
    let store = StateStore::open(backend, StoreRetryPolicy::default()).await.unwrap();
    RmEngine::builder(store)
        .policy(quiet_policy())
        .transport(transport)
        .application(application)
        .local_address(address)
        .build()
        .unwrap()
}

pub fn create_sequence(acks_to: &str, offer: Option<Offer>, version: SpecVersion) -> Envelope {
    Envelope::new(ProtocolBody::CreateSequence {
        acks_to: Some(acks_to.to_string()),
        offer,
        spec_version: version,
    })
    .with_to(Some(SERVER.to_string()))
    .with_reply_to(Some(acks_to.to_string()))
}

/// Opens an inbound sequence on `server` as a peer would and returns its id.
pub async fn open_inbound(server: &Engine, acks_to: &str, offer: Option<Offer>) -> String {
    let response = server
        .deliver(create_sequence(acks_to, offer, SpecVersion::V1_1))
        .await
        .unwrap()
        .expect("CreateSequence is answered on the back channel");
    match response.body {
        ProtocolBody::CreateSequenceResponse { sequence_id, .. } => sequence_id,
        other => panic!("unexpected CreateSequence answer: {:?}", other),
    }
}

pub fn sequence_message(sequence_id: &str, number: u64, last: bool) -> Envelope {
    Envelope::application(json!({ "n": number }))
        .with_to(Some(SERVER.to_string()))
        .with_reply_to(Some(CLIENT.to_string()))
        .with_sequence(SequenceHeader {
            sequence_id: sequence_id.to_string(),
            message_number: number,
            last_message: last,
        })
}

pub fn ack(sequence_id: &str, ranges: &[(u64, u64)]) -> Envelope {
    Envelope::acknowledgement(SequenceAcknowledgement {
        sequence_id: sequence_id.to_string(),
        ranges: ranges
            .iter()
            .map(|(lower, upper)| AckRange::new(*lower, *upper).unwrap())
            .collect(),
        nacks: Vec::new(),
        final_ack: false,
    })
}

pub fn make_connection(address: Option<&str>, sequence_id: Option<&str>) -> Envelope {
    Envelope::new(ProtocolBody::MakeConnection(MakeConnection {
        address: address.map(str::to_string),
        sequence_id: sequence_id.map(str::to_string),
    }))
}

/// The CreateSequenceResponse a peer would send for the captured request.
pub fn create_response(request: &Envelope, sequence_id: &str, accept_acks_to: Option<&str>) -> Envelope {
    Envelope::new(ProtocolBody::CreateSequenceResponse {
        sequence_id: sequence_id.to_string(),
        accept: accept_acks_to.map(|acks_to| seqrelay::protocol::Accept {
            acks_to: Some(acks_to.to_string()),
        }),
    })
    .with_relates_to(request.message_id.clone())
}

pub fn fault_code(envelope: &Envelope) -> Option<FaultCode> {
    match &envelope.body {
        ProtocolBody::Fault(fault) => Some(fault.code),
        _ => None,
    }
}

pub fn offered_id(create: &Envelope) -> Option<String> {
    match &create.body {
        ProtocolBody::CreateSequence {
            offer: Some(offer), ..
        } => Some(offer.sequence_id.clone()),
        _ => None,
    }
}

pub async fn pause() {
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
}
