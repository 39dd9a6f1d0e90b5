//! Worker to coordinator bridge.
//!
//! A cluster runs one [`Coordinator`] and any number of [`WorkerServer`]s.
//! Workers accept client sockets and forward whatever they cannot serve;
//! the coordinator hosts the authoritative endpoints and answers over the
//! process channel.

pub mod coordinator;
pub mod forwarded;
pub mod worker;
pub mod worker_set;

pub use coordinator::Coordinator;
pub use forwarded::ForwardedLedger;
pub use worker::WorkerServer;
pub use worker_set::WorkerSet;
