//! TCP stream adapters.
//!
//! A framed stream is split into a reader task and a writer task joined to the
//! rest of the process by unbounded channels of JSON values. Frames that are
//! not valid JSON are dropped; a framing error or EOF ends the reader, and
//! dropping every sender ends the writer.

use super::protocol::{decode_payload, read_frame, write_value};
use crate::envelope::Envelope;
use crate::transport::Connection;
use crate::{Result, WampError};
use serde_json::Value;
use std::net::SocketAddr;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Split `stream` into an outbound sender and an inbound receiver.
pub(crate) fn spawn_framed(
    stream: TcpStream,
    label: String,
) -> (mpsc::UnboundedSender<Value>, mpsc::UnboundedReceiver<Value>) {
    let (reader, writer) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();

    tokio::spawn(write_loop(writer, out_rx, label.clone()));
    tokio::spawn(read_loop(reader, in_tx, label));

    (out_tx, in_rx)
}

async fn read_loop(mut reader: OwnedReadHalf, inbound: mpsc::UnboundedSender<Value>, label: String) {
    loop {
        let frame = tokio::select! {
            result = read_frame(&mut reader) => match result {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("{}: peer closed", label);
                    break;
                }
                Err(e) => {
                    debug!("{}: read failed: {}", label, e);
                    break;
                }
            },
            _ = inbound.closed() => break,
        };

        match decode_payload(frame) {
            Ok(value) => {
                if inbound.send(value).is_err() {
                    break;
                }
            }
            Err(e) => trace!("{}: dropping undecodable frame: {}", label, e),
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Value>,
    label: String,
) {
    while let Some(value) = outbound.recv().await {
        if let Err(e) = write_value(&mut writer, &value).await {
            debug!("{}: write failed: {}", label, e);
            break;
        }
    }
}

/// A client TCP socket adapted to [`Connection`].
#[derive(Debug, Clone)]
pub struct FramedConnection {
    id: String,
    peer: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<Value>,
}

impl FramedConnection {
    /// Adapt `stream` under a fresh UUID identity.
    ///
    /// Returns the connection and the receiver of the values the peer sends.
    pub fn spawn(stream: TcpStream) -> (Self, mpsc::UnboundedReceiver<Value>) {
        Self::spawn_with_id(uuid::Uuid::new_v4().to_string(), stream)
    }

    pub fn spawn_with_id(
        id: impl Into<String>,
        stream: TcpStream,
    ) -> (Self, mpsc::UnboundedReceiver<Value>) {
        let id = id.into();
        let peer = stream.peer_addr().ok();
        let (outbound, inbound) = spawn_framed(stream, format!("socket {}", id));
        (Self { id, peer, outbound }, inbound)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl Connection for FramedConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, envelope: &Envelope) -> Result<()> {
        let value = envelope.to_value()?;
        self.outbound
            .send(value)
            .map_err(|_| WampError::transport(format!("socket {} closed", self.id)))
    }
}
