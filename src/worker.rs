// ============================================================================
// Background workers
// ============================================================================
//
// Each worker is a tokio task looping on a timer, a wake-up from the engine,
// and a stop signal. Stopping waits for the current tick to finish; dropping
// a worker aborts it.
//
// ============================================================================

use crate::core::{Result, RmError};
use crate::engine::RmEngine;
use crate::storage::StorageBackend;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Duration as TokioDuration, sleep};
use tracing::{Level, event};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// Transmits due messages and sweeps inactive sequences.
    Sender,
    /// Hands stored inbound messages to the application.
    Invoker,
    /// Sends MakeConnection polls from an anonymous endpoint.
    Poller,
}

impl WorkerKind {
    pub fn name(self) -> &'static str {
        match self {
            WorkerKind::Sender => "sender",
            WorkerKind::Invoker => "invoker",
            WorkerKind::Poller => "poller",
        }
    }
}

pub struct EngineWorker {
    kind: WorkerKind,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl EngineWorker {
    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Signals the worker to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.await.map_err(|err| {
                RmError::LockError(format!("{} worker join: {}", self.kind.name(), err))
            })?;
        }
        Ok(())
    }
}

impl Drop for EngineWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

async fn run_tick<B: StorageBackend>(engine: &RmEngine<B>, kind: WorkerKind) -> Result<usize> {
    match kind {
        WorkerKind::Sender => {
            let swept = engine.sweep_inactive().await?;
            let sent = engine.dispatch_due().await?;
            Ok(swept + sent)
        }
        WorkerKind::Invoker => engine.invoke_pending().await,
        WorkerKind::Poller => engine.poll_once().await,
    }
}

fn interval_for<B: StorageBackend>(engine: &RmEngine<B>, kind: WorkerKind) -> u64 {
    let policy = engine.policy();
    let interval = match kind {
        WorkerKind::Sender => policy.sender_interval_ms,
        WorkerKind::Invoker => policy.invoker_interval_ms,
        WorkerKind::Poller => policy.polling_wait_ms,
    };
    interval.max(10)
}

async fn woken<B: StorageBackend>(engine: &RmEngine<B>, kind: WorkerKind) {
    match kind {
        WorkerKind::Sender => engine.sender_notified().await,
        WorkerKind::Invoker => engine.invoker_notified().await,
        WorkerKind::Poller => std::future::pending::<()>().await,
    }
}

pub fn spawn_worker<B: StorageBackend>(engine: Arc<RmEngine<B>>, kind: WorkerKind) -> EngineWorker {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let interval_ms = interval_for(&engine, kind);

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(TokioDuration::from_millis(interval_ms)) => {}
                _ = woken(&engine, kind) => {}
            }
            if let Err(err) = run_tick(&engine, kind).await {
                event!(Level::WARN, worker = kind.name(), error = %err, "worker tick failed");
            }
        }
        event!(Level::DEBUG, worker = kind.name(), "worker stopped");
    });

    EngineWorker {
        kind,
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}

pub fn spawn_sender_worker<B: StorageBackend>(engine: Arc<RmEngine<B>>) -> EngineWorker {
    spawn_worker(engine, WorkerKind::Sender)
}

pub fn spawn_invoker_worker<B: StorageBackend>(engine: Arc<RmEngine<B>>) -> EngineWorker {
    spawn_worker(engine, WorkerKind::Invoker)
}

pub fn spawn_polling_worker<B: StorageBackend>(engine: Arc<RmEngine<B>>) -> EngineWorker {
    spawn_worker(engine, WorkerKind::Poller)
}

/// The workers serving one engine.
pub struct WorkerSet {
    workers: Vec<EngineWorker>,
}

impl WorkerSet {
    /// Starts `senders` sender workers, one invoker, and a poller when the
    /// engine's endpoint is anonymous.
    pub fn start<B: StorageBackend>(engine: Arc<RmEngine<B>>, senders: usize) -> Self {
        let mut workers = Vec::new();
        for _ in 0..senders.max(1) {
            workers.push(spawn_sender_worker(engine.clone()));
        }
        workers.push(spawn_invoker_worker(engine.clone()));
        if engine.is_polling_endpoint() {
            workers.push(spawn_polling_worker(engine));
        }
        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub async fn stop(self) -> Result<()> {
        let results = join_all(self.workers.into_iter().map(EngineWorker::stop)).await;
        results.into_iter().collect()
    }
}
