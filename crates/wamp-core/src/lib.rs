//! WAMP Core - RPC and event protocol over message-passing sockets.
//!
//! Peers exchange JSON envelopes. A caller's [`WampSocket`] stamps every call
//! with a unique signature and parks it in a [`CallLedger`] until the matching
//! response arrives or the [`RequestReaper`] times it out. The receiving side
//! dispatches through a [`Registry`] of RPC and event endpoints.
//!
//! In cluster mode client sockets attach to [`WorkerServer`]s, which forward
//! whatever they cannot serve to a single [`Coordinator`] over a process
//! channel and route the reply back to the right socket.
//!
//! # Example
//!
//! ```rust,ignore
//! use wamp_core::{rpc_handler, ChannelConnection, WampClient, WampServer};
//!
//! let server = std::sync::Arc::new(WampServer::new());
//! server.registry().register_rpc([(
//!     "multiplyByTwo".to_string(),
//!     rpc_handler(|data, reply| reply.ok((data.as_i64().unwrap_or(0) * 2).into())),
//! )]);
//!
//! let (conn, _wire) = ChannelConnection::with_random_id();
//! let socket = WampClient::new().upgrade(conn);
//! let eight = socket.call("multiplyByTwo", 4.into()).await?;
//! ```

pub mod bridge;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod guard;
pub mod ipc;
pub mod ledger;
pub mod reaper;
pub mod registry;
pub mod server;
pub mod signature;
pub mod transport;

// Re-export commonly used types
pub use bridge::{Coordinator, ForwardedLedger, WorkerServer, WorkerSet};
pub use client::{PendingReply, WampClient, WampSocket};
pub use config::{IpcConfig, LedgerConfig, ProtocolConfig, ReaperConfig};
pub use envelope::{Envelope, MessageType, SocketId, WorkerId};
pub use error::{Result, WampError};
pub use guard::{CallKey, ConcurrencyGuard};
pub use ipc::{FramedConnection, IpcCoordinatorLink, IpcServer, IpcServerHandle};
pub use ledger::{CallLedger, LedgerKey};
pub use reaper::{ExpiringLedger, RequestReaper};
pub use registry::{event_handler, rpc_handler, Endpoint, EventHandler, Registry, Reply, RpcHandler};
pub use server::WampServer;
pub use signature::Signature;
pub use transport::{
    ChannelConnection, ClusterEvent, Connection, CoordinatorLink, LocalCoordinatorLink,
    LocalWorkerLink, WorkerLink,
};
