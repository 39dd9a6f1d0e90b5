//! TCP listener for worker processes on the coordinator side.
//!
//! Each worker opens one connection and must send a ConfigRequest carrying its
//! `workerId` as the first frame. After that handshake the connection is
//! announced as [`ClusterEvent::WorkerStart`], every later frame is delivered
//! as [`ClusterEvent::WorkerMessage`], and the close is announced as
//! [`ClusterEvent::WorkerExit`]. The returned handle routes coordinator
//! messages back to workers by id.
//!
//! # Thread Safety
//!
//! The server runs on the tokio runtime. Each connection is handled in its own
//! spawned task. The worker table is shared via `Arc` behind a std `Mutex`
//! that is never held across an await.

use super::protocol::read_value;
use super::socket::spawn_framed;
use crate::config::IpcConfig;
use crate::envelope::{Envelope, MessageType, WorkerId};
use crate::transport::{ClusterEvent, WorkerLink};
use crate::{Result, WampError};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

type WorkerTable = Arc<Mutex<HashMap<WorkerId, mpsc::UnboundedSender<Value>>>>;

fn table(workers: &WorkerTable) -> MutexGuard<'_, HashMap<WorkerId, mpsc::UnboundedSender<Value>>> {
    workers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a running worker listener. Dropping shuts down the server.
pub struct IpcServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    workers: WorkerTable,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl IpcServerHandle {
    /// Get the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Ids of the workers currently connected, sorted.
    pub fn connected_workers(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = table(&self.workers).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Stop accepting workers and close every worker connection.
    pub fn shutdown(&self) {
        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for IpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self
            .task_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl WorkerLink for IpcServerHandle {
    fn send_to_worker(&self, worker_id: WorkerId, envelope: &Envelope) -> Result<()> {
        let value = envelope.to_value()?;
        let workers = table(&self.workers);
        let tx = workers
            .get(&worker_id)
            .ok_or(WampError::UnknownWorker(worker_id))?;
        tx.send(value)
            .map_err(|_| WampError::UnknownWorker(worker_id))
    }
}

/// Coordinator-side listener for worker connections.
pub struct IpcServer;

impl IpcServer {
    /// Start listening on `addr` (port 0 picks a free port).
    ///
    /// Lifecycle events for every worker are sent on `events`.
    pub async fn start(
        addr: impl ToSocketAddrs,
        events: mpsc::UnboundedSender<ClusterEvent>,
    ) -> Result<IpcServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let port = addr.port();

        info!("IPC server listening on {}", addr);

        let workers: WorkerTable = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            workers.clone(),
            events,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        Ok(IpcServerHandle {
            addr,
            port,
            workers,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            conn_shutdown_tx,
            task_handle: Mutex::new(Some(task_handle)),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        workers: WorkerTable,
        events: mpsc::UnboundedSender<ClusterEvent>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("IPC server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= IpcConfig::MAX_WORKER_CONNECTIONS {
                                warn!(
                                    "Rejecting IPC connection from {}: at max capacity ({})",
                                    peer_addr,
                                    IpcConfig::MAX_WORKER_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let workers = workers.clone();
                            let events = events.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("IPC connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(stream, workers, events, &mut conn_shutdown).await {
                                    debug!("IPC connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("IPC accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handshake(stream: &mut TcpStream) -> Result<WorkerId> {
        let hello = tokio::time::timeout(IpcConfig::HANDSHAKE_TIMEOUT, read_value(stream))
            .await
            .map_err(|_| WampError::Validation {
                field: "handshake".to_string(),
                message: "worker sent nothing before the handshake timeout".to_string(),
            })??
            .ok_or_else(|| WampError::transport("worker closed before the handshake"))?;

        Envelope::validate(&hello, MessageType::ConfigRequest)
            .and_then(|request| request.worker_id)
            .ok_or_else(|| WampError::Validation {
                field: "handshake".to_string(),
                message: "first frame must be a ConfigRequest carrying workerId".to_string(),
            })
    }

    async fn handle_connection(
        mut stream: TcpStream,
        workers: WorkerTable,
        events: mpsc::UnboundedSender<ClusterEvent>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let worker_id = Self::handshake(&mut stream).await?;

        let (outbound, mut inbound) = spawn_framed(stream, format!("worker {}", worker_id));
        {
            let mut table = table(&workers);
            if table.contains_key(&worker_id) {
                return Err(WampError::Validation {
                    field: "workerId".to_string(),
                    message: format!("worker {} is already connected", worker_id),
                });
            }
            table.insert(worker_id, outbound);
        }

        info!("Worker {} connected", worker_id);
        let _ = events.send(ClusterEvent::WorkerStart(worker_id));

        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(value) => {
                        if events.send(ClusterEvent::WorkerMessage(worker_id, value)).is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = shutdown_rx.changed() => break,
            }
        }

        table(&workers).remove(&worker_id);
        info!("Worker {} disconnected", worker_id);
        let _ = events.send(ClusterEvent::WorkerExit(worker_id));
        Ok(())
    }
}
