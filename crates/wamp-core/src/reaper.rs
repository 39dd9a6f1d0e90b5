//! Stale request reaper.
//!
//! A periodic tokio task that sweeps a ledger and evicts every entry whose
//! signature timestamp is older than the configured timeout. The ledger shape
//! does not matter to the reaper; anything implementing [`ExpiringLedger`]
//! can be swept.

use crate::config::ReaperConfig;
use crate::signature::{now_ms, Signature};
use crate::{Result, WampError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// A ledger whose entries can go stale.
pub trait ExpiringLedger: Send + Sync + 'static {
    /// Evict every entry older than `timeout` at `now_ms`, running each
    /// entry's failure path with `ResponseTimeout`.
    ///
    /// A signature that cannot be parsed aborts the sweep with
    /// `LedgerCorruption` before anything is evicted.
    fn evict_outdated(&self, timeout: Duration, now_ms: i64) -> Result<usize>;

    /// Number of live entries.
    fn pending(&self) -> usize;
}

/// Periodic sweeper over one ledger.
pub struct RequestReaper<L: ExpiringLedger> {
    ledger: Arc<L>,
    config: ReaperConfig,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<L: ExpiringLedger> RequestReaper<L> {
    pub fn new(ledger: Arc<L>, config: ReaperConfig) -> Self {
        Self {
            ledger,
            config,
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Start sweeping every `interval`. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut task = self.task_slot();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(WampError::ReaperAlreadyRunning);
        }

        let ledger = self.ledger.clone();
        let ReaperConfig { interval, timeout } = self.config.clone();

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match ledger.evict_outdated(timeout, now_ms()) {
                    Ok(0) => {}
                    Ok(evicted) => debug!("Reaper evicted {} stale request(s)", evicted),
                    Err(e) => {
                        error!("Reaper stopped: {}", e);
                        break;
                    }
                }
            }
        }));

        info!(
            "Requests cleaner started (interval {:?}, timeout {:?})",
            interval, timeout
        );
        Ok(())
    }

    /// Stop sweeping. Does nothing when already stopped.
    pub fn stop(&self) {
        if let Some(handle) = self.task_slot().take() {
            handle.abort();
            debug!("Requests cleaner stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task_slot()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Run one sweep against the wall clock.
    pub fn sweep(&self) -> Result<usize> {
        self.sweep_at(now_ms())
    }

    /// Run one sweep as if the clock read `now_ms`.
    pub fn sweep_at(&self, now_ms: i64) -> Result<usize> {
        self.ledger.evict_outdated(self.config.timeout, now_ms)
    }

    /// Whether `signature` is older than this reaper's timeout.
    pub fn is_outdated(&self, signature: &Signature) -> Result<bool> {
        signature.is_outdated(self.config.timeout, now_ms())
    }

    fn task_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<L: ExpiringLedger> Drop for RequestReaper<L> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::CallLedger;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLedger {
        sweeps: AtomicUsize,
    }

    impl ExpiringLedger for CountingLedger {
        fn evict_outdated(&self, _timeout: Duration, _now_ms: i64) -> Result<usize> {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }

        fn pending(&self) -> usize {
            0
        }
    }

    struct CorruptLedger;

    impl ExpiringLedger for CorruptLedger {
        fn evict_outdated(&self, _timeout: Duration, _now_ms: i64) -> Result<usize> {
            Err(WampError::LedgerCorruption {
                signature: "invalidSignature".into(),
            })
        }

        fn pending(&self) -> usize {
            1
        }
    }

    fn fast() -> ReaperConfig {
        ReaperConfig::new(Duration::from_millis(1), Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_start_keeps_sweeping() {
        let ledger = Arc::new(CountingLedger {
            sweeps: AtomicUsize::new(0),
        });
        let reaper = RequestReaper::new(ledger.clone(), fast());

        reaper.start().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(ledger.sweeps.load(Ordering::SeqCst) > 1);
        assert!(reaper.is_running());
        reaper.stop();
    }

    #[tokio::test]
    async fn test_double_start_is_an_error() {
        let ledger = Arc::new(CountingLedger {
            sweeps: AtomicUsize::new(0),
        });
        let reaper = RequestReaper::new(ledger, fast());

        reaper.start().unwrap();
        match reaper.start() {
            Err(WampError::ReaperAlreadyRunning) => {}
            other => panic!("Expected ReaperAlreadyRunning, got: {:?}", other),
        }
        reaper.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_allows_restart() {
        let ledger = Arc::new(CountingLedger {
            sweeps: AtomicUsize::new(0),
        });
        let reaper = RequestReaper::new(ledger, fast());

        reaper.stop();
        reaper.start().unwrap();
        reaper.stop();
        reaper.stop();
        assert!(!reaper.is_running());
        assert!(reaper.start().is_ok());
    }

    #[tokio::test]
    async fn test_corruption_stops_periodic_sweep() {
        let reaper = RequestReaper::new(Arc::new(CorruptLedger), fast());
        reaper.start().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(!reaper.is_running());
        assert!(matches!(
            reaper.sweep(),
            Err(WampError::LedgerCorruption { .. })
        ));
    }

    #[tokio::test]
    async fn test_reaper_times_out_pending_client_call_once() {
        let ledger = Arc::new(CallLedger::default());
        let now = now_ms();
        let rx = ledger.insert_with_signature("slow", Signature::from_parts(now - 5_000, 0));

        let reaper = RequestReaper::new(
            ledger.clone(),
            ReaperConfig::new(Duration::from_millis(5), Duration::from_secs(1)),
        );
        reaper.start().unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("reaper should evict the stale call")
            .unwrap();
        match outcome {
            Err(e) => assert_eq!(e.to_string(), "RPC response timeout exceeded"),
            Ok(v) => panic!("Expected timeout, got: {:?}", v),
        }
        assert_eq!(ledger.pending(), 0);
        assert_eq!(reaper.sweep().unwrap(), 0);
        reaper.stop();
    }

    #[test]
    fn test_is_outdated_uses_configured_timeout() {
        let reaper = RequestReaper::new(
            Arc::new(CallLedger::default()),
            ReaperConfig::new(Duration::from_secs(1), Duration::from_secs(10)),
        );
        let old = Signature::from_parts(now_ms() - 60_000, 0);
        let fresh = Signature::from_parts(now_ms(), 0);

        assert!(reaper.is_outdated(&old).unwrap());
        assert!(!reaper.is_outdated(&fresh).unwrap());
        assert!(reaper.is_outdated(&Signature::from("invalidSignature")).is_err());
    }
}
