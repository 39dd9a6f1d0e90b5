//! Calling side of the protocol.
//!
//! [`WampClient`] owns one [`CallLedger`] and upgrades raw connections into
//! [`WampSocket`]s that share it. The socket is an adapter around the
//! connection, not a mutation of it: calls go out through `Connection::send`
//! and responses come back through [`WampSocket::handle_message`].

use crate::config::LedgerConfig;
use crate::envelope::{Envelope, MessageType};
use crate::ledger::{CallLedger, CallReceiver};
use crate::signature::Signature;
use crate::transport::Connection;
use crate::{Result, WampError};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

/// Owner of the call ledger shared by every upgraded socket.
#[derive(Clone, Default)]
pub struct WampClient {
    ledger: Arc<CallLedger>,
}

impl WampClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: LedgerConfig) -> Self {
        Self {
            ledger: Arc::new(CallLedger::new(config)),
        }
    }

    /// The shared ledger, e.g. to hand to a reaper.
    pub fn ledger(&self) -> Arc<CallLedger> {
        self.ledger.clone()
    }

    /// Wrap a connection so it can place calls.
    pub fn upgrade<C: Connection>(&self, connection: C) -> WampSocket<C> {
        WampSocket {
            connection,
            ledger: self.ledger.clone(),
        }
    }
}

/// A connection that can place calls and emit events.
pub struct WampSocket<C: Connection> {
    connection: C,
    ledger: Arc<CallLedger>,
}

impl<C: Connection> WampSocket<C> {
    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Call `procedure` on the peer.
    ///
    /// Admission, signature allocation and the send happen before this
    /// returns; the returned future only waits for the outcome.
    pub fn call(&self, procedure: &str, data: Value) -> PendingReply {
        let (signature, rx) = match self.ledger.reserve(procedure) {
            Ok(reserved) => reserved,
            Err(e) => {
                debug!("Call to {} refused: {}", procedure, e);
                return PendingReply::failed(e);
            }
        };

        let envelope = Envelope::call(procedure, data, signature.clone());
        if let Err(e) = self.connection.send(&envelope) {
            self.ledger.cancel(procedure, &signature);
            return PendingReply::failed(e);
        }

        trace!("Call {} sent with signature {}", procedure, signature);
        PendingReply {
            signature: Some(signature),
            state: ReplyState::Waiting(rx),
        }
    }

    /// Fire an event at the peer.
    pub fn emit(&self, procedure: &str, data: Value) -> Result<()> {
        self.connection.send(&Envelope::event(procedure, data))
    }

    /// Feed one inbound message to the socket.
    ///
    /// Anything that is not a valid response is ignored. A response that
    /// matches no outstanding call is returned as `OrphanedResponse`.
    pub fn handle_message(&self, raw: &Value) -> Result<()> {
        match Envelope::validate(raw, MessageType::Response) {
            Some(response) => self.ledger.resolve(&response),
            None => {
                trace!("Ignoring non-response message on {}", self.connection.id());
                Ok(())
            }
        }
    }

    /// Drain inbound messages until the channel closes.
    ///
    /// Stops early on a protocol violation and returns it.
    pub async fn run(&self, mut inbound: mpsc::UnboundedReceiver<Value>) -> Result<()> {
        while let Some(raw) = inbound.recv().await {
            if let Err(e) = self.handle_message(&raw) {
                error!("Protocol violation on {}: {}", self.connection.id(), e);
                return Err(e);
            }
        }
        debug!("Socket {} inbound closed", self.connection.id());
        Ok(())
    }
}

enum ReplyState {
    Failed(Option<WampError>),
    Waiting(CallReceiver),
}

/// Future of one call's outcome.
pub struct PendingReply {
    signature: Option<Signature>,
    state: ReplyState,
}

impl PendingReply {
    fn failed(error: WampError) -> Self {
        Self {
            signature: None,
            state: ReplyState::Failed(Some(error)),
        }
    }

    /// Signature allocated for the call, if it was admitted.
    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    /// Whether the call was refused before anything was sent.
    pub fn is_rejected(&self) -> bool {
        matches!(self.state, ReplyState::Failed(_))
    }
}

impl Future for PendingReply {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            ReplyState::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(WampError::Disconnected)))
            }
            ReplyState::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or_else(|_| Err(WampError::Disconnected))),
        }
    }
}
