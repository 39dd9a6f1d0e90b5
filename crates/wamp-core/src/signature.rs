//! Call signatures: `<epoch_ms>_<nonce>` correlation tokens.
//!
//! The millisecond prefix doubles as the creation time of the call, which is
//! what the reaper reads to decide staleness.

use crate::config::ProtocolConfig;
use crate::{Result, WampError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Correlation token for one outstanding call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(String);

impl Signature {
    /// Build a signature from its two halves.
    pub fn from_parts(timestamp_ms: i64, nonce: u32) -> Self {
        Signature(format!("{}_{}", timestamp_ms, nonce))
    }

    /// Generate a signature not rejected by `is_taken`, stamped with the
    /// current wall clock.
    pub fn generate(is_taken: impl Fn(&Signature) -> bool, max_attempts: usize) -> Result<Self> {
        let mut rng = rand::rng();
        Self::generate_with(
            is_taken,
            max_attempts,
            now_ms(),
            || rng.random_range(0..ProtocolConfig::NONCE_RANGE),
        )
    }

    /// Generation loop with an injectable timestamp and nonce source.
    ///
    /// Tries at most `max_attempts` candidates and fails with
    /// `SignatureSpaceExhausted` once they are all taken.
    pub fn generate_with(
        is_taken: impl Fn(&Signature) -> bool,
        max_attempts: usize,
        timestamp_ms: i64,
        mut next_nonce: impl FnMut() -> u32,
    ) -> Result<Self> {
        for _ in 0..max_attempts {
            let candidate = Signature::from_parts(timestamp_ms, next_nonce());
            if !is_taken(&candidate) {
                return Ok(candidate);
            }
        }
        Err(WampError::SignatureSpaceExhausted {
            attempts: max_attempts,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Creation time embedded in the signature.
    ///
    /// Only the leading 13 characters are read; anything that does not parse
    /// as an integer is ledger corruption.
    pub fn timestamp_ms(&self) -> Result<i64> {
        let prefix = self
            .0
            .get(..ProtocolConfig::SIGNATURE_TIMESTAMP_LEN)
            .unwrap_or(&self.0);
        prefix
            .parse::<i64>()
            .map_err(|_| WampError::LedgerCorruption {
                signature: self.0.clone(),
            })
    }

    /// Whether more than `timeout` has elapsed between creation and `now_ms`.
    pub fn is_outdated(&self, timeout: Duration, now_ms: i64) -> Result<bool> {
        let elapsed = now_ms - self.timestamp_ms()?;
        Ok(elapsed > i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Signature {
    fn from(s: String) -> Self {
        Signature(s)
    }
}

impl From<&str> for Signature {
    fn from(s: &str) -> Self {
        Signature(s.to_string())
    }
}

/// Current wall clock in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
