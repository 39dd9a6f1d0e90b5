//! Worker-side TCP link to the coordinator.
//!
//! Connects, sends the ConfigRequest handshake carrying the worker id, then
//! hands back a [`CoordinatorLink`] for outbound messages and a receiver for
//! everything the coordinator addresses to this worker.

use super::protocol::write_value;
use super::socket::spawn_framed;
use crate::config::IpcConfig;
use crate::envelope::{Envelope, WorkerId};
use crate::transport::CoordinatorLink;
use crate::{Result, WampError};
use serde_json::Value;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

/// TCP connection from a worker to its coordinator.
#[derive(Debug, Clone)]
pub struct IpcCoordinatorLink {
    worker_id: WorkerId,
    addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Value>,
}

impl IpcCoordinatorLink {
    /// Connect to the coordinator at `addr` as `worker_id`.
    ///
    /// Uses the configured connection timeout from `IpcConfig`.
    pub async fn connect(
        addr: SocketAddr,
        worker_id: WorkerId,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Value>)> {
        let mut stream = tokio::time::timeout(IpcConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| WampError::transport(format!("timed out connecting to coordinator at {}", addr)))?
            .map_err(|e| WampError::transport(format!("cannot reach coordinator at {}: {}", addr, e)))?;

        let hello = Envelope::config_request(Some(worker_id)).to_value()?;
        write_value(&mut stream, &hello).await?;

        debug!("Worker {} connected to coordinator at {}", worker_id, addr);

        let (outbound, inbound) = spawn_framed(stream, "coordinator link".to_string());
        Ok((
            Self {
                worker_id,
                addr,
                outbound,
            },
            inbound,
        ))
    }

    /// Get the address of the coordinator.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl CoordinatorLink for IpcCoordinatorLink {
    fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    fn send_to_coordinator(&self, envelope: &Envelope) -> Result<()> {
        let value = envelope.to_value()?;
        self.outbound
            .send(value)
            .map_err(|_| WampError::transport("coordinator connection closed"))
    }
}
