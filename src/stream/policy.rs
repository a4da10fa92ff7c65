use crate::error::{Error, Result};
use rand::Rng;
use std::time::Duration;

use super::config::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_JITTER_FRACTION, INITIAL_BACKOFF_SECONDS,
    MAX_BACKOFF_SECONDS,
};

/// Immutable reconnect timing: capped exponential growth with uniform jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_fraction: f64,
}

impl ReconnectPolicy {
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` unless `0 < initial_delay <= max_delay`,
    /// `multiplier >= 1` and `0 <= jitter_fraction < 1`.
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter_fraction: f64,
    ) -> Result<Self> {
        if initial_delay.is_zero() {
            return Err(Error::InvalidConfig("initial_delay must be non-zero".to_string()));
        }
        if initial_delay > max_delay {
            return Err(Error::InvalidConfig(format!(
                "initial_delay {initial_delay:?} exceeds max_delay {max_delay:?}"
            )));
        }
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "multiplier must be at least 1.0, got {multiplier}"
            )));
        }
        if !(0.0..1.0).contains(&jitter_fraction) {
            return Err(Error::InvalidConfig(format!(
                "jitter_fraction must be in [0, 1), got {jitter_fraction}"
            )));
        }

        Ok(Self {
            initial_delay,
            max_delay,
            multiplier,
            jitter_fraction,
        })
    }

    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        self.max_delay
    }

    #[must_use]
    pub const fn multiplier(&self) -> f64 {
        self.multiplier
    }

    #[must_use]
    pub const fn jitter_fraction(&self) -> f64 {
        self.jitter_fraction
    }

    /// Fresh backoff cursor starting at `initial_delay`
    #[must_use]
    pub const fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            current: self.initial_delay,
            attempt: 0,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(INITIAL_BACKOFF_SECONDS),
            max_delay: Duration::from_secs(MAX_BACKOFF_SECONDS),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
        }
    }
}

/// Position in a backoff sequence
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    /// Base (pre-jitter) delay for this failure, then advance the sequence
    pub fn next_base(&mut self) -> Duration {
        let base = self.current;
        self.current = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.policy.multiplier)
            .map_or(self.policy.max_delay, |next| next.min(self.policy.max_delay));
        self.attempt = self.attempt.saturating_add(1);
        base
    }

    /// Delay to actually wait for this failure: `base * (1 ± jitter)`
    pub fn next_delay<R: Rng>(&mut self, rng: &mut R) -> Duration {
        let base = self.next_base();
        let jitter = self.policy.jitter_fraction;
        if jitter == 0.0 {
            return base;
        }
        base.mul_f64(1.0 + rng.gen_range(-jitter..=jitter))
    }

    /// Back to `initial_delay`, after a successful connect
    pub fn reset(&mut self) {
        self.current = self.policy.initial_delay;
        self.attempt = 0;
    }

    /// Delays drawn since the last reset
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }
}
