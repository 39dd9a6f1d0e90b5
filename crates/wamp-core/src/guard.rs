//! At-most-once admission for forwarded calls.
//!
//! A forwarded call may reach the coordinator more than once. The guard keeps
//! an in-flight marker per `(socketId, procedure, signature)` from the moment
//! processing starts until its single reply has gone out; deliveries seen
//! while the marker is set are duplicates.

use crate::envelope::{Envelope, SocketId};
use crate::signature::Signature;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Composite key of a call routed on behalf of a client socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallKey {
    pub socket_id: SocketId,
    pub procedure: String,
    pub signature: Signature,
}

impl CallKey {
    pub fn new(
        socket_id: impl Into<SocketId>,
        procedure: impl Into<String>,
        signature: Signature,
    ) -> Self {
        Self {
            socket_id: socket_id.into(),
            procedure: procedure.into(),
            signature,
        }
    }

    /// Key of an envelope carrying `socketId`, `procedure` and `signature`.
    pub fn from_envelope(envelope: &Envelope) -> Option<Self> {
        Some(Self::new(
            envelope.socket_id.clone()?,
            envelope.procedure.clone()?,
            envelope.signature.clone()?,
        ))
    }

    /// Key of a client call arriving on `socket_id`.
    pub fn for_socket(socket_id: &str, envelope: &Envelope) -> Option<Self> {
        Some(Self::new(
            socket_id,
            envelope.procedure.clone()?,
            envelope.signature.clone()?,
        ))
    }
}

impl std::fmt::Display for CallKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.socket_id, self.procedure, self.signature)
    }
}

/// In-flight markers for forwarded calls.
#[derive(Debug, Default)]
pub struct ConcurrencyGuard {
    in_flight: Mutex<HashSet<CallKey>>,
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is currently in flight.
    pub fn check_call(&self, key: &CallKey) -> bool {
        self.markers().contains(key)
    }

    /// Mark `key` as in flight. Returns false if it already was.
    pub fn save_call(&self, key: CallKey) -> bool {
        self.markers().insert(key)
    }

    /// Clear the marker once the reply has been produced.
    pub fn delete_call(&self, key: &CallKey) -> bool {
        self.markers().remove(key)
    }

    /// Check and mark in one step. False means `key` is a duplicate.
    pub fn try_admit(&self, key: &CallKey) -> bool {
        let admitted = self.markers().insert(key.clone());
        if !admitted {
            trace!("Duplicate delivery of {}", key);
        }
        admitted
    }

    /// Drop every marker belonging to `socket_id`.
    pub fn clear_socket(&self, socket_id: &str) -> usize {
        let mut markers = self.markers();
        let before = markers.len();
        markers.retain(|key| key.socket_id != socket_id);
        before - markers.len()
    }

    /// Whether any marker belonging to `socket_id` is set.
    pub fn has_socket(&self, socket_id: &str) -> bool {
        self.markers().iter().any(|key| key.socket_id == socket_id)
    }

    pub fn len(&self) -> usize {
        self.markers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn markers(&self) -> MutexGuard<'_, HashSet<CallKey>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
