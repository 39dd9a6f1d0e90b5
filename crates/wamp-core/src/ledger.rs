//! Client-side ledger of outstanding calls.
//!
//! Entries are keyed by the flat pair `(procedure, signature)`. Each holds the
//! one-shot resolver of the caller's future, which is consumed exactly once:
//! by a matching response, by reaper eviction, or by being dropped when the
//! ledger is cleared (the caller then sees `Disconnected`).

use crate::config::LedgerConfig;
use crate::envelope::Envelope;
use crate::reaper::ExpiringLedger;
use crate::signature::Signature;
use crate::{Result, WampError};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Receiving half of a pending call.
pub type CallReceiver = oneshot::Receiver<Result<Value>>;

/// Ledger key of one outstanding call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LedgerKey {
    pub procedure: String,
    pub signature: Signature,
}

impl LedgerKey {
    pub fn new(procedure: impl Into<String>, signature: Signature) -> Self {
        Self {
            procedure: procedure.into(),
            signature,
        }
    }
}

struct PendingCall {
    created_at: DateTime<Utc>,
    resolver: oneshot::Sender<Result<Value>>,
}

impl PendingCall {
    fn resolve(self, outcome: Result<Value>) {
        // The caller may have stopped waiting; that is not our concern.
        let _ = self.resolver.send(outcome);
    }
}

#[derive(Default)]
struct LedgerState {
    calls: HashMap<LedgerKey, PendingCall>,
    per_procedure: HashMap<String, usize>,
}

impl LedgerState {
    fn outstanding(&self, procedure: &str) -> usize {
        self.per_procedure.get(procedure).copied().unwrap_or(0)
    }

    fn insert(&mut self, key: LedgerKey, call: PendingCall) {
        *self.per_procedure.entry(key.procedure.clone()).or_insert(0) += 1;
        self.calls.insert(key, call);
    }

    fn remove(&mut self, key: &LedgerKey) -> Option<PendingCall> {
        let call = self.calls.remove(key)?;
        if let Some(count) = self.per_procedure.get_mut(&key.procedure) {
            *count -= 1;
            if *count == 0 {
                self.per_procedure.remove(&key.procedure);
            }
        }
        Some(call)
    }
}

/// Store of outstanding client calls.
pub struct CallLedger {
    config: LedgerConfig,
    state: Mutex<LedgerState>,
}

impl Default for CallLedger {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}

impl CallLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Admit a new call to `procedure` and allocate its signature.
    ///
    /// Refuses once `max_calls` are outstanding for the procedure and fails
    /// if no free signature turns up within the attempt budget. Neither
    /// failure leaves anything behind.
    pub fn reserve(&self, procedure: &str) -> Result<(Signature, CallReceiver)> {
        let mut state = self.lock();

        if state.outstanding(procedure) >= self.config.max_calls {
            return Err(WampError::AdmissionRejected {
                max: self.config.max_calls,
            });
        }

        let signature = Signature::generate(
            |candidate| {
                state
                    .calls
                    .contains_key(&LedgerKey::new(procedure, candidate.clone()))
            },
            self.config.max_generate_attempts,
        )?;

        let (tx, rx) = oneshot::channel();
        state.insert(
            LedgerKey::new(procedure, signature.clone()),
            PendingCall {
                created_at: Utc::now(),
                resolver: tx,
            },
        );
        Ok((signature, rx))
    }

    /// Withdraw a reservation without resolving it.
    pub fn cancel(&self, procedure: &str, signature: &Signature) -> bool {
        self.lock()
            .remove(&LedgerKey::new(procedure, signature.clone()))
            .is_some()
    }

    /// Settle the call a response answers.
    ///
    /// A response that matches no entry is a protocol violation: it answers a
    /// call that was never made or was already settled.
    pub fn resolve(&self, response: &Envelope) -> Result<()> {
        let procedure = response.procedure_name().to_string();
        let signature = response.signature.clone().unwrap_or_else(|| Signature::from(""));
        let key = LedgerKey::new(procedure, signature);

        let call = self.lock().remove(&key);
        let Some(call) = call else {
            return Err(WampError::OrphanedResponse {
                procedure: key.procedure,
                signature: key.signature.to_string(),
            });
        };

        let outcome = if response.success == Some(true) {
            Ok(response.data.clone())
        } else {
            Err(WampError::Remote {
                error: response.error.clone().unwrap_or(Value::Null),
            })
        };
        call.resolve(outcome);
        Ok(())
    }

    /// Number of outstanding calls to `procedure`.
    pub fn outstanding(&self, procedure: &str) -> usize {
        self.lock().outstanding(procedure)
    }

    /// Signatures currently outstanding for `procedure`.
    pub fn signatures(&self, procedure: &str) -> Vec<Signature> {
        self.lock()
            .calls
            .keys()
            .filter(|key| key.procedure == procedure)
            .map(|key| key.signature.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry; waiting callers observe `Disconnected`.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.calls.len();
        state.calls.clear();
        state.per_procedure.clear();
        dropped
    }

    #[cfg(test)]
    pub(crate) fn insert_with_signature(&self, procedure: &str, signature: Signature) -> CallReceiver {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(
            LedgerKey::new(procedure, signature),
            PendingCall {
                created_at: Utc::now(),
                resolver: tx,
            },
        );
        rx
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ExpiringLedger for CallLedger {
    fn evict_outdated(&self, timeout: Duration, now_ms: i64) -> Result<usize> {
        let mut state = self.lock();

        let mut outdated = Vec::new();
        for key in state.calls.keys() {
            if key.signature.is_outdated(timeout, now_ms)? {
                outdated.push(key.clone());
            }
        }

        for key in &outdated {
            if let Some(call) = state.remove(key) {
                debug!(
                    "Evicting call {} {} pending since {}",
                    key.procedure, key.signature, call.created_at
                );
                call.resolve(Err(WampError::ResponseTimeout));
            }
        }

        if !outdated.is_empty() {
            warn!("{} client call(s) timed out", outdated.len());
        }
        Ok(outdated.len())
    }

    fn pending(&self) -> usize {
        self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::now_ms;
    use serde_json::json;
    use std::collections::HashSet;

    fn response(procedure: &str, signature: &Signature, success: bool, payload: Value) -> Envelope {
        let call = Envelope::call(procedure, Value::Null, signature.clone());
        if success {
            Envelope::response_to(&call, Ok(payload))
        } else {
            Envelope::response_to(&call, Err(payload))
        }
    }

    #[test]
    fn test_reserve_creates_distinct_entries() {
        let ledger = CallLedger::default();
        let (a, _rx_a) = ledger.reserve("procedureA").unwrap();
        let (b, _rx_b) = ledger.reserve("procedureA").unwrap();
        let (_c, _rx_c) = ledger.reserve("procedureB").unwrap();

        assert_ne!(a, b);
        assert_eq!(ledger.outstanding("procedureA"), 2);
        assert_eq!(ledger.outstanding("procedureB"), 1);
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn test_cap_rejects_without_allocating() {
        let ledger = CallLedger::default();
        let mut receivers = Vec::new();
        for _ in 0..100 {
            receivers.push(ledger.reserve("p").unwrap());
        }

        match ledger.reserve("p") {
            Err(WampError::AdmissionRejected { max }) => assert_eq!(max, 100),
            other => panic!("Expected AdmissionRejected, got: {:?}", other.map(|(s, _)| s)),
        }
        assert_eq!(ledger.outstanding("p"), 100);

        let distinct: HashSet<_> = receivers.iter().map(|(sig, _)| sig.clone()).collect();
        assert_eq!(distinct.len(), 100);

        // other procedures are unaffected
        assert!(ledger.reserve("q").is_ok());
    }

    #[test]
    fn test_exhausted_signature_space_allocates_nothing() {
        let ledger = CallLedger::new(LedgerConfig {
            max_calls: 100,
            max_generate_attempts: 0,
        });
        match ledger.reserve("p") {
            Err(WampError::SignatureSpaceExhausted { attempts }) => assert_eq!(attempts, 0),
            other => panic!("Expected SignatureSpaceExhausted, got: {:?}", other.map(|(s, _)| s)),
        }
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_success_and_failure() {
        let ledger = CallLedger::default();
        let (ok_sig, ok_rx) = ledger.reserve("p").unwrap();
        let (err_sig, err_rx) = ledger.reserve("p").unwrap();

        ledger.resolve(&response("p", &ok_sig, true, json!(8))).unwrap();
        ledger
            .resolve(&response("p", &err_sig, false, json!("bad input")))
            .unwrap();

        assert_eq!(ok_rx.await.unwrap().unwrap(), json!(8));
        match err_rx.await.unwrap() {
            Err(WampError::Remote { error }) => assert_eq!(error, json!("bad input")),
            other => panic!("Expected Remote error, got: {:?}", other),
        }
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_orphaned_response_is_hard_error() {
        let ledger = CallLedger::default();
        let (sig, _rx) = ledger.reserve("p").unwrap();
        ledger.resolve(&response("p", &sig, true, json!(1))).unwrap();

        match ledger.resolve(&response("p", &sig, true, json!(1))) {
            Err(WampError::OrphanedResponse { procedure, signature }) => {
                assert_eq!(procedure, "p");
                assert_eq!(signature, sig.to_string());
            }
            other => panic!("Expected OrphanedResponse, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_evict_outdated_fails_only_stale_calls() {
        let ledger = CallLedger::default();
        let now = now_ms();
        let stale = ledger.insert_with_signature("p", Signature::from_parts(now - 60_000, 0));
        let (_fresh_sig, mut fresh) = ledger.reserve("p").unwrap();

        let evicted = ledger.evict_outdated(Duration::from_secs(10), now).unwrap();

        assert_eq!(evicted, 1);
        assert!(matches!(stale.await.unwrap(), Err(WampError::ResponseTimeout)));
        assert!(fresh.try_recv().is_err());
        assert_eq!(ledger.outstanding("p"), 1);
    }

    #[test]
    fn test_corrupt_signature_aborts_sweep() {
        let ledger = CallLedger::default();
        let now = now_ms();
        let _stale = ledger.insert_with_signature("p", Signature::from_parts(now - 60_000, 0));
        let _bad = ledger.insert_with_signature("p", Signature::from("garbage"));

        let result = ledger.evict_outdated(Duration::from_secs(10), now);
        assert!(matches!(result, Err(WampError::LedgerCorruption { .. })));
        assert_eq!(ledger.len(), 2);
    }

    #[tokio::test]
    async fn test_clear_disconnects_waiters() {
        let ledger = CallLedger::default();
        let (_sig, rx) = ledger.reserve("p").unwrap();
        assert_eq!(ledger.clear(), 1);
        assert!(rx.await.is_err());
        assert_eq!(ledger.outstanding("p"), 0);
    }
}
