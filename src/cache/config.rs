/**
 * Configuration constants for the request cache
 */
use std::time::Duration;

/// Default TTL for trip report results in seconds (2 minutes)
pub const DEFAULT_TRIP_TTL_SECONDS: u64 = 120;

/// Default interval between expired-entry sweeps in seconds
pub const DEFAULT_PRUNE_INTERVAL_SECONDS: u64 = 300;

/// Configuration for a `RequestCache` and its background pruner
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied by callers that do not choose their own
    pub default_ttl: Duration,
    /// How often the background pruner sweeps expired entries
    pub prune_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(DEFAULT_TRIP_TTL_SECONDS),
            prune_interval: Duration::from_secs(DEFAULT_PRUNE_INTERVAL_SECONDS),
        }
    }
}

/// Validate configuration constants at compile time
const _: () = {
    assert!(DEFAULT_TRIP_TTL_SECONDS > 0, "DEFAULT_TRIP_TTL_SECONDS must be greater than 0");
    assert!(
        DEFAULT_PRUNE_INTERVAL_SECONDS >= DEFAULT_TRIP_TTL_SECONDS,
        "DEFAULT_PRUNE_INTERVAL_SECONDS should not sweep faster than entries expire"
    );
};
