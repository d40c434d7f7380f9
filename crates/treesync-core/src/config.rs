//! Tunables for the sync engine and the syncing guard.

use std::time::Duration;

/// Bounded retry used while waiting for a writer to release a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRetry {
    /// Number of open attempts before the transfer is abandoned
    pub attempts: u32,
    /// Delay between attempts
    pub interval: Duration,
}

impl Default for AccessRetry {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_millis(500),
        }
    }
}

/// Engine configuration shared by both roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Retry policy applied before every outbound file transfer
    pub access_retry: AccessRetry,
    /// How long after an inbound command finishes that watcher
    /// notifications are still treated as echoes of it
    pub settle: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            access_retry: AccessRetry::default(),
            settle: Duration::from_millis(300),
        }
    }
}
