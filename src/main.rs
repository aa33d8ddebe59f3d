use async_trait::async_trait;
use seqrelay::{
    Application, Envelope, MemoryBackend, Result, RmClient, RmEngine, RmError, RmPolicy,
    SendOptions, StateStore, StoreRetryPolicy, Transport, WorkerSet,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio::time::Duration as TokioDuration;
use tracing::{Level, event};

const CLIENT: &str = "mem://client";
const SERVER: &str = "mem://server";

/// In-process transport that loses every third transmission.
#[derive(Default)]
struct LossyLoopback {
    routes: RwLock<HashMap<String, Arc<RmEngine<MemoryBackend>>>>,
    transmissions: AtomicU64,
}

impl LossyLoopback {
    async fn register(&self, address: &str, engine: Arc<RmEngine<MemoryBackend>>) {
        self.routes.write().await.insert(address.to_string(), engine);
    }
}

#[async_trait]
impl Transport for LossyLoopback {
    async fn send(&self, envelope: Envelope, destination: &str) -> Result<Option<Envelope>> {
        let attempt = self.transmissions.fetch_add(1, Ordering::Relaxed) + 1;
        if attempt % 3 == 0 {
            event!(Level::INFO, kind = %envelope.kind(), destination, "transmission lost");
            return Ok(None);
        }
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

struct Echo;

#[async_trait]
impl Application for Echo {
    async fn invoke(&self, sequence_id: &str, message_number: u64, payload: Value) -> Result<Option<Value>> {
        event!(Level::INFO, sequence_id, message_number, payload = %payload, "server received");
        Ok(Some(json!({ "echo": payload, "number": message_number })))
    }
}

struct Printer;

#[async_trait]
impl Application for Printer {
    async fn invoke(&self, _sequence_id: &str, message_number: u64, payload: Value) -> Result<Option<Value>> {
        println!("reply {}: {}", message_number, payload);
        Ok(None)
    }
}

async fn engine(
    transport: Arc<LossyLoopback>,
    address: &str,
    application: Arc<dyn Application>,
) -> Result<Arc<RmEngine<MemoryBackend>>> {
    let policy = RmPolicy::default()
        .retransmission_interval_ms(300)
        .acknowledgement_interval_ms(100)
        .exponential_backoff(false)
        .worker_intervals_ms(50, 50);
    let store = StateStore::open(MemoryBackend::new(), StoreRetryPolicy::default()).await?;
    RmEngine::builder(store)
        .policy(policy)
        .transport(transport)
        .application(application)
        .local_address(address)
        .build()
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn Error>> {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .try_init();

    let transport = Arc::new(LossyLoopback::default());
    let server = engine(transport.clone(), SERVER, Arc::new(Echo)).await?;
    let client_engine = engine(transport.clone(), CLIENT, Arc::new(Printer)).await?;
    transport.register(SERVER, server.clone()).await;
    transport.register(CLIENT, client_engine.clone()).await;

    let server_workers = WorkerSet::start(server.clone(), 1);
    let client_workers = WorkerSet::start(client_engine.clone(), 1);

    let client = RmClient::new(client_engine);
    let total = 5;
    for n in 1..=total {
        let mut options = SendOptions::default().with_offer().expecting_reply();
        if n == total {
            options = options.last();
        }
        client
            .send_with("demo", SERVER, json!({ "greeting": format!("hello #{}", n) }), options)
            .await?;
    }

    let report = client
        .wait_until_sequence_completed("demo", TokioDuration::from_secs(20))
        .await?;
    println!(
        "sequence {} acknowledged {} ({:?})",
        report.sequence_id.unwrap_or_default(),
        report.ranges,
        report.state
    );
    println!("client stats: {:?}", client.engine().stats());
    println!("server stats: {:?}", server.stats());

    client_workers.stop().await?;
    server_workers.stop().await?;
    Ok(())
}
