/**
 * Configuration constants for the connection supervisor
 */
use super::policy::ReconnectPolicy;
use crate::error::{Error, Result};
use std::num::NonZeroU32;
use std::time::Duration;

/// Initial backoff time in seconds
pub const INITIAL_BACKOFF_SECONDS: u64 = 1;

/// Maximum backoff time in seconds between reconnect attempts
pub const MAX_BACKOFF_SECONDS: u64 = 60;

/// Growth factor applied to the backoff after each failed attempt
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Uniform jitter applied to each waited delay (±20%)
pub const DEFAULT_JITTER_FRACTION: f64 = 0.2;

/// A connected stream with no inbound frame for this long is treated as dead
pub const DEFAULT_SILENCE_TIMEOUT_SECONDS: u64 = 25;

/// Upper bound on a single transport handshake
pub const DEFAULT_CONNECT_TIMEOUT_SECONDS: u64 = 10;

/// Capacity of the outbound frame queue for a live session
pub const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// Configuration for a `ConnectionSupervisor`
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub policy: ReconnectPolicy,
    /// Force a reconnect when nothing arrives for this long while connected
    pub silence_timeout: Duration,
    pub connect_timeout: Duration,
    /// Send a transport-level ping at this interval while connected
    pub ping_interval: Option<Duration>,
    /// Give up and go `Disconnected` after this many consecutive failed attempts
    pub max_attempts: Option<NonZeroU32>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicy::default(),
            silence_timeout: Duration::from_secs(DEFAULT_SILENCE_TIMEOUT_SECONDS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECONDS),
            ping_interval: None,
            max_attempts: None,
        }
    }
}

impl SupervisorConfig {
    /// Caps consecutive failed connect attempts
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` for zero, which would never reconnect
    pub fn with_max_attempts(mut self, attempts: u32) -> Result<Self> {
        let attempts = NonZeroU32::new(attempts)
            .ok_or_else(|| Error::InvalidConfig("max_attempts must be at least 1".to_string()))?;
        self.max_attempts = Some(attempts);
        Ok(self)
    }
}

/// Validate configuration constants at compile time
const _: () = {
    assert!(INITIAL_BACKOFF_SECONDS > 0, "INITIAL_BACKOFF_SECONDS must be greater than 0");
    assert!(
        MAX_BACKOFF_SECONDS >= INITIAL_BACKOFF_SECONDS,
        "MAX_BACKOFF_SECONDS must be at least INITIAL_BACKOFF_SECONDS"
    );
    assert!(DEFAULT_BACKOFF_MULTIPLIER >= 1.0, "DEFAULT_BACKOFF_MULTIPLIER must be at least 1");
    assert!(
        DEFAULT_JITTER_FRACTION >= 0.0 && DEFAULT_JITTER_FRACTION < 1.0,
        "DEFAULT_JITTER_FRACTION must be in [0, 1)"
    );
    assert!(DEFAULT_SILENCE_TIMEOUT_SECONDS > 0, "DEFAULT_SILENCE_TIMEOUT_SECONDS must be greater than 0");
    assert!(DEFAULT_CONNECT_TIMEOUT_SECONDS > 0, "DEFAULT_CONNECT_TIMEOUT_SECONDS must be greater than 0");
    assert!(OUTBOUND_CHANNEL_CAPACITY > 0, "OUTBOUND_CHANNEL_CAPACITY must be greater than 0");
};
