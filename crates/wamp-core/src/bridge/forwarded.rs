//! Worker-side ledger of calls forwarded to the coordinator.
//!
//! Keyed by `(socketId, procedure, signature)`. Each entry remembers the
//! client connection and the forwarded request so the eventual reply, or the
//! timeout produced by the reaper, can be sent back on the right socket.

use crate::envelope::Envelope;
use crate::guard::CallKey;
use crate::reaper::ExpiringLedger;
use crate::server::reply_to;
use crate::transport::Connection;
use crate::{Result, WampError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

struct ForwardedCall {
    origin: Arc<dyn Connection>,
    request: Envelope,
    created_at: DateTime<Utc>,
}

/// Forwarded calls awaiting a coordinator reply.
#[derive(Default)]
pub struct ForwardedLedger {
    calls: Mutex<HashMap<CallKey, ForwardedCall>>,
}

impl ForwardedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a call forwarded on behalf of `origin`.
    ///
    /// Returns false if the same call is already outstanding.
    pub fn record(&self, key: CallKey, origin: Arc<dyn Connection>, request: Envelope) -> bool {
        let mut calls = self.lock();
        if calls.contains_key(&key) {
            return false;
        }
        calls.insert(
            key,
            ForwardedCall {
                origin,
                request,
                created_at: Utc::now(),
            },
        );
        true
    }

    /// Forget a call without answering it.
    pub fn discard(&self, key: &CallKey) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Hand a coordinator reply to the client that placed the call.
    ///
    /// Fails with `DisconnectedTarget` when the entry is gone, which happens
    /// once the socket has disconnected or the call has already timed out.
    pub fn complete(&self, key: &CallKey, response: Envelope) -> Result<()> {
        let call = self
            .lock()
            .remove(key)
            .ok_or_else(|| WampError::DisconnectedTarget {
                socket_id: key.socket_id.clone(),
            })?;
        call.origin.send(&response.into_client_response())
    }

    /// Drop every entry of a disconnected socket.
    pub fn purge_socket(&self, socket_id: &str) -> usize {
        let mut calls = self.lock();
        let before = calls.len();
        calls.retain(|key, _| key.socket_id != socket_id);
        before - calls.len()
    }

    pub fn contains(&self, key: &CallKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CallKey, ForwardedCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ExpiringLedger for ForwardedLedger {
    fn evict_outdated(&self, timeout: Duration, now_ms: i64) -> Result<usize> {
        let expired: Vec<ForwardedCall> = {
            let mut calls = self.lock();

            let mut outdated = Vec::new();
            for key in calls.keys() {
                if key.signature.is_outdated(timeout, now_ms)? {
                    outdated.push(key.clone());
                }
            }
            outdated
                .iter()
                .filter_map(|key| calls.remove(key))
                .collect()
        };

        // Replies go out after the lock is released.
        for call in &expired {
            debug!(
                "Forwarded call {} timed out (pending since {})",
                call.request.procedure_name(),
                call.created_at
            );
            let response = Envelope::response_to(
                &call.request,
                Err(WampError::ResponseTimeout.to_wire()),
            );
            reply_to(call.origin.clone())(response);
        }

        if !expired.is_empty() {
            warn!("{} forwarded call(s) timed out", expired.len());
        }
        Ok(expired.len())
    }

    fn pending(&self) -> usize {
        self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageType;
    use crate::signature::{now_ms, Signature};
    use crate::transport::ChannelConnection;
    use serde_json::json;

    fn call(signature: &Signature) -> Envelope {
        Envelope::call("slow", json!(1), signature.clone())
    }

    #[tokio::test]
    async fn test_record_rejects_duplicates() {
        let ledger = ForwardedLedger::new();
        let (conn, _rx) = ChannelConnection::new("s1");
        let origin: Arc<dyn Connection> = Arc::new(conn);
        let signature = Signature::from_parts(now_ms(), 1);
        let key = CallKey::new("s1", "slow", signature.clone());

        assert!(ledger.record(key.clone(), origin.clone(), call(&signature)));
        assert!(!ledger.record(key.clone(), origin, call(&signature)));
        assert_eq!(ledger.len(), 1);
        assert!(ledger.discard(&key));
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_complete_delivers_client_response() {
        let ledger = ForwardedLedger::new();
        let (conn, mut rx) = ChannelConnection::new("s1");
        let signature = Signature::from_parts(now_ms(), 2);
        let key = CallKey::new("s1", "slow", signature.clone());
        ledger.record(key.clone(), Arc::new(conn), call(&signature));

        let forwarded = Envelope::forwarded_call(&call(&signature), 1, "s1");
        let response = Envelope::forwarded_response(
            Envelope::response_to(&forwarded, Ok(json!(2))),
            1,
            "s1",
        );
        ledger.complete(&key, response.clone()).unwrap();

        let delivered = rx.recv().await.unwrap();
        assert_eq!(Envelope::peek_kind(&delivered), Some(MessageType::Response));
        assert!(delivered.get("socketId").is_none());
        assert_eq!(delivered["data"], json!(2));

        match ledger.complete(&key, response) {
            Err(WampError::DisconnectedTarget { socket_id }) => assert_eq!(socket_id, "s1"),
            other => panic!("Expected DisconnectedTarget, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_purge_socket_only_touches_that_socket() {
        let ledger = ForwardedLedger::new();
        let (a, _ra) = ChannelConnection::new("a");
        let (b, _rb) = ChannelConnection::new("b");
        let a: Arc<dyn Connection> = Arc::new(a);
        let b: Arc<dyn Connection> = Arc::new(b);

        for nonce in 0..3 {
            let signature = Signature::from_parts(now_ms(), nonce);
            ledger.record(CallKey::new("a", "slow", signature.clone()), a.clone(), call(&signature));
        }
        let signature = Signature::from_parts(now_ms(), 9);
        ledger.record(CallKey::new("b", "slow", signature.clone()), b, call(&signature));

        assert_eq!(ledger.purge_socket("a"), 3);
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_eviction_replies_timeout_to_origin() {
        let ledger = ForwardedLedger::new();
        let (conn, mut rx) = ChannelConnection::new("s1");
        let now = now_ms();
        let stale = Signature::from_parts(now - 20_000, 1);
        let fresh = Signature::from_parts(now, 2);
        let origin: Arc<dyn Connection> = Arc::new(conn);
        ledger.record(CallKey::new("s1", "slow", stale.clone()), origin.clone(), call(&stale));
        ledger.record(CallKey::new("s1", "slow", fresh.clone()), origin, call(&fresh));

        assert_eq!(ledger.evict_outdated(Duration::from_secs(10), now).unwrap(), 1);
        assert_eq!(ledger.pending(), 1);

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply["success"], json!(false));
        assert_eq!(reply["error"], json!("RPC response timeout exceeded"));
        assert_eq!(reply["signature"], json!(stale.as_str()));
    }

    #[tokio::test]
    async fn test_corrupt_signature_aborts_before_evicting() {
        let ledger = ForwardedLedger::new();
        let (conn, mut rx) = ChannelConnection::new("s1");
        let origin: Arc<dyn Connection> = Arc::new(conn);
        let stale = Signature::from_parts(now_ms() - 20_000, 1);
        let corrupt = Signature::from("invalidSignature");
        ledger.record(CallKey::new("s1", "slow", stale.clone()), origin.clone(), call(&stale));
        ledger.record(CallKey::new("s1", "slow", corrupt.clone()), origin, call(&corrupt));

        assert!(matches!(
            ledger.evict_outdated(Duration::from_secs(10), now_ms()),
            Err(WampError::LedgerCorruption { .. })
        ));
        assert_eq!(ledger.len(), 2);
        assert!(rx.try_recv().is_err());
    }
}
