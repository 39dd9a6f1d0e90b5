//! Role runners: coordinator, worker and one-shot caller.

use crate::endpoints;
use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use wamp_core::{
    Connection, Coordinator, ForwardedLedger, FramedConnection, IpcConfig, IpcCoordinatorLink, IpcServer,
    IpcServerHandle, ProtocolConfig, ReaperConfig, RequestReaper, WampClient, WorkerServer,
};

/// A running coordinator. Dropping it stops the worker listener.
pub struct CoordinatorNode {
    pub addr: SocketAddr,
    pub coordinator: Arc<Coordinator>,
    server: Arc<IpcServerHandle>,
    task: JoinHandle<()>,
}

impl CoordinatorNode {
    pub fn shutdown(&self) {
        self.server.shutdown();
        self.task.abort();
    }
}

impl Drop for CoordinatorNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Start a coordinator listening for workers on `host:port`.
pub async fn start_coordinator(host: &str, port: u16) -> Result<CoordinatorNode> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let server = Arc::new(
        IpcServer::start((host, port), events_tx)
            .await
            .with_context(|| format!("binding coordinator on {}:{}", host, port))?,
    );

    let coordinator = Arc::new(Coordinator::new(server.clone()));
    endpoints::register_coordinator(&coordinator);

    let runner = coordinator.clone();
    let task = tokio::spawn(async move { runner.run(events_rx).await });

    Ok(CoordinatorNode {
        addr: server.addr(),
        coordinator,
        server,
        task,
    })
}

/// Worker settings taken from the command line.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub coordinator: SocketAddr,
    pub id: u32,
    pub host: String,
    pub port: u16,
    pub reaper: ReaperConfig,
}

/// A running worker. Dropping it stops accepting clients.
pub struct WorkerNode {
    pub addr: SocketAddr,
    pub worker: Arc<WorkerServer>,
    reaper: RequestReaper<ForwardedLedger>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerNode {
    pub fn shutdown(&self) {
        self.reaper.stop();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for WorkerNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Connect to the coordinator, then accept client sockets on `host:port`.
pub async fn start_worker(options: WorkerOptions) -> Result<WorkerNode> {
    let (link, inbound) = IpcCoordinatorLink::connect(options.coordinator, options.id)
        .await
        .with_context(|| format!("worker {} joining coordinator", options.id))?;

    let worker = Arc::new(WorkerServer::new(Arc::new(link)));
    endpoints::register_worker(&worker);

    let reaper = RequestReaper::new(worker.forwarded_ledger(), options.reaper.clone());
    reaper.start()?;

    let listener = TcpListener::bind((options.host.as_str(), options.port))
        .await
        .with_context(|| format!("binding worker on {}:{}", options.host, options.port))?;
    let addr = listener.local_addr()?;
    info!("Worker {} accepting clients on {}", options.id, addr);

    let from_coordinator = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run(inbound).await })
    };
    let accept = tokio::spawn(accept_clients(listener, worker.clone()));

    Ok(WorkerNode {
        addr,
        worker,
        reaper,
        tasks: vec![from_coordinator, accept],
    })
}

async fn accept_clients(listener: TcpListener, worker: Arc<WorkerServer>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let (connection, inbound) = FramedConnection::spawn(stream);
                debug!("Client {} connected as {}", peer_addr, connection.id());
                let worker = worker.clone();
                tokio::spawn(async move {
                    worker.serve_socket(Arc::new(connection), inbound).await;
                });
            }
            Err(e) => {
                error!("Client accept error: {}", e);
            }
        }
    }
}

/// Place a single call against a worker and wait for its outcome.
pub async fn call(addr: SocketAddr, procedure: &str, data: Value, timeout: Duration) -> Result<Value> {
    let stream = tokio::time::timeout(IpcConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| anyhow!("timed out connecting to {}", addr))?
        .with_context(|| format!("connecting to {}", addr))?;
    let (connection, inbound) = FramedConnection::spawn(stream);

    let client = WampClient::new();
    let reaper = RequestReaper::new(
        client.ledger(),
        ReaperConfig::new(timeout.min(ProtocolConfig::REAPER_INTERVAL), timeout),
    );
    reaper.start()?;

    let socket = Arc::new(client.upgrade(connection));
    let reader = socket.clone();
    let reading = tokio::spawn(async move {
        if let Err(e) = reader.run(inbound).await {
            error!("Call socket failed: {}", e);
        }
    });

    let outcome = socket.call(procedure, data).await;
    reaper.stop();
    reading.abort();
    Ok(outcome?)
}
