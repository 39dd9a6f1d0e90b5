//! WAMP Node - runs one role of a wamp-core cluster.
//!
//! `coordinator` hosts the authoritative endpoints and listens for workers,
//! `worker` joins a coordinator and accepts client sockets, and `call` places
//! a single call against a worker and prints the result.

mod endpoints;
mod node;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use wamp_core::ReaperConfig;

#[derive(Parser, Debug)]
#[command(name = "wamp-node")]
#[command(about = "Coordinator, worker and caller for a WAMP cluster")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host the authoritative registry and accept workers
    Coordinator {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: u16,
    },

    /// Join a coordinator and serve client sockets
    Worker {
        /// Address of the coordinator's worker listener
        #[arg(long)]
        coordinator: SocketAddr,

        /// Worker id, unique within the cluster
        #[arg(long)]
        id: u32,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Milliseconds between sweeps of forwarded calls
        #[arg(long, default_value = "1000")]
        reap_interval_ms: u64,

        /// Milliseconds before a forwarded call is answered with a timeout
        #[arg(long, default_value = "10000")]
        call_timeout_ms: u64,
    },

    /// Call a procedure on a worker and print the result
    Call {
        /// Address of the worker's client listener
        #[arg(long)]
        addr: SocketAddr,

        /// Procedure to call
        #[arg(long)]
        procedure: String,

        /// JSON payload
        #[arg(long, default_value = "null")]
        data: String,

        /// Milliseconds to wait for the response
        #[arg(long, default_value = "10000")]
        call_timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match args.command {
        Command::Coordinator { host, port } => {
            info!("Starting coordinator");
            let node = node::start_coordinator(&host, port).await?;
            info!(
                "Coordinator serving {}",
                node.coordinator.registry().procedures().join(", ")
            );

            // Print port for launchers to read (intentional stdout)
            println!("COORDINATOR_PORT={}", node.addr.port());

            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received, exiting");
            node.shutdown();
        }
        Command::Worker {
            coordinator,
            id,
            host,
            port,
            reap_interval_ms,
            call_timeout_ms,
        } => {
            info!("Starting worker {}", id);
            let node = node::start_worker(node::WorkerOptions {
                coordinator,
                id,
                host,
                port,
                reaper: ReaperConfig::new(
                    Duration::from_millis(reap_interval_ms),
                    Duration::from_millis(call_timeout_ms),
                ),
            })
            .await?;
            info!(
                "Worker {} serving {} locally",
                node.worker.worker_id(),
                node.worker.registry().procedures().join(", ")
            );

            println!("WORKER_PORT={}", node.addr.port());

            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received, exiting");
            node.shutdown();
        }
        Command::Call {
            addr,
            procedure,
            data,
            call_timeout_ms,
        } => {
            let data = serde_json::from_str(&data).context("--data must be valid JSON")?;
            let result = node::call(
                addr,
                &procedure,
                data,
                Duration::from_millis(call_timeout_ms),
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}
