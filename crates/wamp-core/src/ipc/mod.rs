//! Framed TCP transport.
//!
//! Carries envelopes between processes as length-prefixed JSON over TCP.
//!
//! # Architecture
//!
//! - **Protocol**: shared framing used by every connection
//! - **Socket**: adapts a client's TCP stream to a [`crate::transport::Connection`]
//! - **Server**: coordinator-side listener for workers, a [`crate::transport::WorkerLink`]
//! - **Client**: worker-side [`crate::transport::CoordinatorLink`]

pub mod client;
pub mod protocol;
pub mod server;
pub mod socket;

pub use client::IpcCoordinatorLink;
pub use server::{IpcServer, IpcServerHandle};
pub use socket::FramedConnection;
