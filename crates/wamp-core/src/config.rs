//! Centralized configuration for wamp-core.
//!
//! Protocol constants live on unit structs; the knobs a deployment may want to
//! tune are plain structs with `Default` impls built from those constants.

use std::time::Duration;

/// Call ledger and signature constants.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Outstanding calls allowed per procedure before admission is refused.
    pub const MAX_CALLS_ALLOWED: usize = 100;
    /// Nonce draws attempted before signature generation gives up.
    pub const MAX_GENERATE_ATTEMPTS: usize = 10_000;
    /// Exclusive upper bound of a signature nonce.
    pub const NONCE_RANGE: u32 = 100_000;
    /// Width of the millisecond timestamp that prefixes every signature.
    pub const SIGNATURE_TIMESTAMP_LEN: usize = 13;

    pub const REAPER_INTERVAL: Duration = Duration::from_secs(1);
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Framed TCP transport constants.
pub struct IpcConfig;

impl IpcConfig {
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_WORKER_CONNECTIONS: usize = 64;
}

/// Tunables for a client call ledger.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Outstanding calls allowed per procedure.
    pub max_calls: usize,
    /// Signature generation attempts before failing the call.
    pub max_generate_attempts: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_calls: ProtocolConfig::MAX_CALLS_ALLOWED,
            max_generate_attempts: ProtocolConfig::MAX_GENERATE_ATTEMPTS,
        }
    }
}

/// Tunables for a stale request reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Age after which a pending call is evicted.
    pub timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: ProtocolConfig::REAPER_INTERVAL,
            timeout: ProtocolConfig::CALL_TIMEOUT,
        }
    }
}

impl ReaperConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}
