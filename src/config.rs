//! Kernel configuration

use std::time::Duration;

/// Configuration for the user types cache
///
/// Entry bounds are clamped to a minimum of one: a configured capacity of
/// zero behaves as a single-entry cache, not as a disabled one.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries in the global cache
    pub global_max_entries: usize,

    /// Access-based expiry window for global cache entries
    pub global_expiry: Duration,

    /// Maximum number of entries in each per-transaction session cache
    pub session_max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            global_max_entries: 1024,
            global_expiry: Duration::from_secs(10 * 60),
            session_max_entries: 512,
        }
    }
}

impl CacheConfig {
    /// Set the global cache entry bound
    pub fn with_global_max_entries(mut self, max: usize) -> Self {
        self.global_max_entries = max;
        self
    }

    /// Set the global cache access-expiry window
    pub fn with_global_expiry(mut self, expiry: Duration) -> Self {
        self.global_expiry = expiry;
        self
    }

    /// Set the per-session cache entry bound
    pub fn with_session_max_entries(mut self, max: usize) -> Self {
        self.session_max_entries = max;
        self
    }
}

/// Configuration for transaction lifecycle management
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// How long an idle transaction stays open before it is considered
    /// expired and rolled back by cleanup
    pub session_timeout: Duration,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(3 * 60),
        }
    }
}

impl TransactionConfig {
    /// Set the idle session timeout
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }
}
