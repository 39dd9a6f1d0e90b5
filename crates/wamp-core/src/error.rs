//! Error types for wamp-core.
//!
//! Two families live in one enum. Expected runtime outcomes (admission
//! rejected, timeouts, remote handler failures) are handed back to the caller
//! of a pending call. Protocol integrity violations (orphaned responses,
//! corrupt ledger signatures, double-started reapers) are raised to whoever
//! drives the component, because they mean the peers are out of sync.

use crate::envelope::WorkerId;
use thiserror::Error;

/// Main error type for wamp-core.
#[derive(Debug, Error)]
pub enum WampError {
    // Dispatch outcomes
    #[error("procedure {procedure} not registered")]
    ProcedureNotFound { procedure: String },

    #[error("Remote procedure failed: {}", describe_remote(.error))]
    Remote { error: serde_json::Value },

    // Ledger admission
    #[error("No more than {max} calls allowed")]
    AdmissionRejected { max: usize },

    #[error("Failed to generate proper signature {attempts} times")]
    SignatureSpaceExhausted { attempts: usize },

    #[error("RPC response timeout exceeded")]
    ResponseTimeout,

    // Protocol integrity
    #[error("Unable to find resolving function for procedure {procedure} with signature {signature}")]
    OrphanedResponse { procedure: String, signature: String },

    #[error("Wrong signature stored in internal RPC calls: {signature}")]
    LedgerCorruption { signature: String },

    #[error("Requests cleaner is already running")]
    ReaperAlreadyRunning,

    // Routing
    #[error("socket {socket_id} is no longer connected")]
    DisconnectedTarget { socket_id: String },

    #[error("connection closed before a response arrived")]
    Disconnected,

    #[error("worker {0} is not connected")]
    UnknownWorker(WorkerId),

    #[error("Transport error: {message}")]
    Transport { message: String },

    // IO and serialization
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },
}

/// Result type alias for wamp-core operations.
pub type Result<T> = std::result::Result<T, WampError>;

fn describe_remote(error: &serde_json::Value) -> String {
    match error {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl From<std::io::Error> for WampError {
    fn from(err: std::io::Error) -> Self {
        WampError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for WampError {
    fn from(err: serde_json::Error) -> Self {
        WampError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl WampError {
    /// Build a transport error from anything printable.
    pub fn transport(message: impl Into<String>) -> Self {
        WampError::Transport {
            message: message.into(),
        }
    }

    /// Whether this error signals a broken protocol invariant rather than an
    /// expected runtime condition.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            WampError::OrphanedResponse { .. }
                | WampError::LedgerCorruption { .. }
                | WampError::ReaperAlreadyRunning
        )
    }

    /// The JSON payload placed in the `error` field of a failed response.
    ///
    /// Remote errors are passed through untouched so a failure relayed by a
    /// worker reaches the client exactly as the coordinator produced it.
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            WampError::Remote { error } => error.clone(),
            other => serde_json::Value::String(other.to_string()),
        }
    }
}
