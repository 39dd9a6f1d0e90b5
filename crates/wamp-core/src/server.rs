//! Single-process server: sockets in, registry dispatch, responses out.

use crate::envelope::{Envelope, MessageType, SocketId};
use crate::registry::{ReplySink, Registry};
use crate::transport::Connection;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Sink that delivers a response to `connection`, logging if it is gone.
pub(crate) fn reply_to(connection: Arc<dyn Connection>) -> ReplySink {
    Box::new(move |response: Envelope| {
        if let Err(e) = connection.send(&response) {
            debug!(
                "Dropping response for {} on {}: {}",
                response.procedure_name(),
                connection.id(),
                e
            );
        }
    })
}

/// Registry-backed server for clients connected to this process.
#[derive(Default)]
pub struct WampServer {
    registry: Arc<Registry>,
    sockets: Mutex<HashMap<SocketId, Arc<dyn Connection>>>,
}

impl WampServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            sockets: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Start serving a connection.
    pub fn attach(&self, connection: Arc<dyn Connection>) -> SocketId {
        let id = connection.id().to_string();
        debug!("Socket {} attached", id);
        self.sockets().insert(id.clone(), connection);
        id
    }

    /// Stop serving a connection.
    pub fn detach(&self, socket_id: &str) -> bool {
        debug!("Socket {} detached", socket_id);
        self.sockets().remove(socket_id).is_some()
    }

    pub fn socket_count(&self) -> usize {
        self.sockets().len()
    }

    /// Process one inbound message from `socket_id`.
    ///
    /// Returns false when the message was dropped: unknown socket, or not a
    /// valid call or event.
    pub fn handle_message(&self, socket_id: &str, raw: &Value) -> bool {
        let Some(connection) = self.sockets().get(socket_id).cloned() else {
            warn!("Message from unknown socket {}", socket_id);
            return false;
        };

        if let Some(call) = Envelope::validate(raw, MessageType::Call) {
            self.registry.dispatch(call, reply_to(connection));
            return true;
        }

        if let Some(event) = Envelope::validate(raw, MessageType::Event) {
            let procedure = event.procedure_name().to_string();
            if !self.registry.notify(&procedure, event.data) {
                debug!("No handler for event {}", procedure);
            }
            return true;
        }

        trace!("Dropping invalid message from {}", socket_id);
        false
    }

    /// Serve `connection` until its inbound channel closes.
    pub async fn serve(&self, connection: Arc<dyn Connection>, mut inbound: mpsc::UnboundedReceiver<Value>) {
        let socket_id = self.attach(connection);
        while let Some(raw) = inbound.recv().await {
            self.handle_message(&socket_id, &raw);
        }
        self.detach(&socket_id);
    }

    fn sockets(&self) -> MutexGuard<'_, HashMap<SocketId, Arc<dyn Connection>>> {
        self.sockets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
