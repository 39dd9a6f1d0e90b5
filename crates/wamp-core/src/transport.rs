//! Transport contracts and in-process channel implementations.
//!
//! The protocol never owns sockets. It is handed a [`Connection`] per client
//! socket and, in cluster mode, a [`CoordinatorLink`] (worker side) or a
//! [`WorkerLink`] (coordinator side). Sends are non-blocking: implementations
//! enqueue onto a writer task and report only whether the peer is still
//! reachable.
//!
//! The channel implementations here stand in for OS process boundaries in
//! tests and single-binary deployments; [`crate::ipc`] provides the TCP ones.

use crate::envelope::{Envelope, WorkerId};
use crate::{Result, WampError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

/// One client connection.
pub trait Connection: Send + Sync + 'static {
    /// Stable identity of this connection.
    fn id(&self) -> &str;

    /// Queue an envelope for delivery to the peer.
    fn send(&self, envelope: &Envelope) -> Result<()>;
}

/// Worker-side handle to the coordinator.
pub trait CoordinatorLink: Send + Sync + 'static {
    fn worker_id(&self) -> WorkerId;

    /// Queue an envelope for the coordinator. `Ok` acknowledges the hand-off.
    fn send_to_coordinator(&self, envelope: &Envelope) -> Result<()>;
}

/// Coordinator-side handle to the worker pool.
pub trait WorkerLink: Send + Sync + 'static {
    fn send_to_worker(&self, worker_id: WorkerId, envelope: &Envelope) -> Result<()>;
}

/// Worker lifecycle notifications delivered to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    WorkerStart(WorkerId),
    WorkerMessage(WorkerId, Value),
    WorkerExit(WorkerId),
}

/// A [`Connection`] backed by an unbounded channel of raw JSON values.
#[derive(Debug, Clone)]
pub struct ChannelConnection {
    id: String,
    tx: mpsc::UnboundedSender<Value>,
}

impl ChannelConnection {
    /// Create a connection and the receiver its peer reads from.
    pub fn new(id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id: id.into(), tx }, rx)
    }

    /// Create a connection with a random UUID identity.
    pub fn with_random_id() -> (Self, mpsc::UnboundedReceiver<Value>) {
        Self::new(uuid::Uuid::new_v4().to_string())
    }
}

impl Connection for ChannelConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, envelope: &Envelope) -> Result<()> {
        let value = envelope.to_value()?;
        self.tx
            .send(value)
            .map_err(|_| WampError::transport(format!("connection {} closed", self.id)))
    }
}

/// Worker's channel to an in-process coordinator.
#[derive(Debug, Clone)]
pub struct LocalCoordinatorLink {
    worker_id: WorkerId,
    events: mpsc::UnboundedSender<ClusterEvent>,
}

impl CoordinatorLink for LocalCoordinatorLink {
    fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    fn send_to_coordinator(&self, envelope: &Envelope) -> Result<()> {
        let value = envelope.to_value()?;
        self.events
            .send(ClusterEvent::WorkerMessage(self.worker_id, value))
            .map_err(|_| WampError::transport("coordinator channel closed"))
    }
}

/// Coordinator's channels to in-process workers.
///
/// Doubles as the supervisor for tests: `spawn_worker` wires a new worker and
/// announces it, `exit_worker` tears it down and announces the exit.
#[derive(Debug)]
pub struct LocalWorkerLink {
    events: mpsc::UnboundedSender<ClusterEvent>,
    workers: Mutex<HashMap<WorkerId, mpsc::UnboundedSender<Value>>>,
}

impl LocalWorkerLink {
    /// Create the link and the lifecycle event stream the coordinator drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClusterEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                events,
                workers: Mutex::new(HashMap::new()),
            },
            rx,
        )
    }

    /// Register a worker and emit `WorkerStart` for it.
    ///
    /// Returns the worker's coordinator link and the receiver of messages the
    /// coordinator addresses to it.
    pub fn spawn_worker(
        &self,
        worker_id: WorkerId,
    ) -> Result<(LocalCoordinatorLink, mpsc::UnboundedReceiver<Value>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(worker_id, tx);

        self.events
            .send(ClusterEvent::WorkerStart(worker_id))
            .map_err(|_| WampError::transport("coordinator channel closed"))?;

        debug!("Local worker {} started", worker_id);
        Ok((
            LocalCoordinatorLink {
                worker_id,
                events: self.events.clone(),
            },
            rx,
        ))
    }

    /// Drop a worker's channel and emit `WorkerExit` for it.
    pub fn exit_worker(&self, worker_id: WorkerId) -> Result<()> {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&worker_id);

        debug!("Local worker {} exited", worker_id);
        self.events
            .send(ClusterEvent::WorkerExit(worker_id))
            .map_err(|_| WampError::transport("coordinator channel closed"))
    }
}

impl WorkerLink for LocalWorkerLink {
    fn send_to_worker(&self, worker_id: WorkerId, envelope: &Envelope) -> Result<()> {
        let value = envelope.to_value()?;
        let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = workers
            .get(&worker_id)
            .ok_or(WampError::UnknownWorker(worker_id))?;
        tx.send(value)
            .map_err(|_| WampError::UnknownWorker(worker_id))
    }
}
