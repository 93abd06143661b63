//! Exponential backoff for Tablelink reconnection.
//!
//! Both the signaling client (rendezvous link) and the peer connection
//! manager (peer links) retry with the same policy shape, configured per
//! use site:
//!
//! ```text
//! delay(n) = min(base_delay × multiplierⁿ⁻¹, max_delay) − jitter
//! ```
//!
//! for attempts `n = 1..=max_attempts`. After the last attempt the policy
//! is exhausted and the caller escalates (the session goes `Offline`, or
//! the participant is marked failed).
//!
//! # Integration
//!
//! A [`Backoff`] sits inside a retry loop:
//!
//! ```ignore
//! let mut backoff = Backoff::new(config.retry.clone());
//! loop {
//!     match dial().await {
//!         Ok(conn) => { backoff.reset(); pump(conn).await; }
//!         Err(e) => warn!(error = %e, "dial failed"),
//!     }
//!     if backoff.wait().await.is_none() {
//!         break; // exhausted
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Retry policy parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor between consecutive delays. Values below 1.0 are
    /// clamped to 1.0 (constant delay).
    pub multiplier: f64,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Retries allowed before the policy is exhausted. 0 disables retries.
    pub max_attempts: u32,
    /// Fraction (0.0–1.0) of each delay that may be randomly shaved off,
    /// so a whole party dropped by the same outage does not retry in
    /// lockstep.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(8),
            max_attempts: 5,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// A deterministic policy (no jitter) with a constant delay.
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            max_attempts,
            jitter: 0.0,
        }
    }

    /// Clamp and fix any out-of-range values so the config is safe to use.
    ///
    /// Called automatically by [`Backoff::new`]. Rules:
    /// - `multiplier` at least 1.0 (NaN becomes 1.0).
    /// - `jitter` clamped to `0.0..=1.0`.
    /// - `max_delay` at least `base_delay`.
    pub fn validated(mut self) -> Self {
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            warn!(
                multiplier = self.multiplier,
                "backoff multiplier below 1.0, clamping to 1.0"
            );
            self.multiplier = 1.0;
        }
        self.jitter = if self.jitter.is_nan() {
            0.0
        } else {
            self.jitter.clamp(0.0, 1.0)
        };
        if self.max_delay < self.base_delay {
            self.max_delay = self.base_delay;
        }
        self
    }

    /// The un-jittered delay before retry number `attempt` (1-based).
    ///
    /// Attempt 0 is "no retry yet" and maps to zero.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Worst-case total time spent waiting before the policy gives up.
    pub fn total_budget(&self) -> Duration {
        (1..=self.max_attempts).map(|n| self.delay_for(n)).sum()
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Stateful retry counter for one retry loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Creates a fresh policy (no attempts consumed).
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config: config.validated(),
            attempt: 0,
        }
    }

    /// Consumes one attempt and returns how long to wait before it, or
    /// `None` once `max_attempts` retries have been handed out.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempt += 1;
        let delay = self.config.delay_for(self.attempt);
        let delay = if self.config.jitter > 0.0 {
            let shave = rand::rng().random_range(0.0..self.config.jitter);
            delay.mul_f64(1.0 - shave)
        } else {
            delay
        };
        trace!(attempt = self.attempt, ?delay, "backoff scheduled");
        Some(delay)
    }

    /// Sleeps for the next delay and returns the attempt number, or
    /// returns `None` immediately when exhausted.
    pub async fn wait(&mut self) -> Option<u32> {
        let delay = self.next_delay()?;
        tokio::time::sleep(delay).await;
        Some(self.attempt)
    }

    /// Forgets all consumed attempts. Call after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts consumed so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// `true` once no retries remain.
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }

    /// The validated configuration in use.
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_for_grows_exponentially_until_cap() {
        let cfg = BackoffConfig {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(500),
            max_attempts: 10,
            jitter: 0.0,
        };
        assert_eq!(cfg.delay_for(0), Duration::ZERO);
        assert_eq!(cfg.delay_for(1), Duration::from_millis(100));
        assert_eq!(cfg.delay_for(2), Duration::from_millis(200));
        assert_eq!(cfg.delay_for(3), Duration::from_millis(400));
        assert_eq!(cfg.delay_for(4), Duration::from_millis(500));
        assert_eq!(cfg.delay_for(9), Duration::from_millis(500));
    }

    #[test]
    fn test_validated_clamps_bad_values() {
        let cfg = BackoffConfig {
            base_delay: Duration::from_secs(2),
            multiplier: 0.5,
            max_delay: Duration::from_secs(1),
            max_attempts: 3,
            jitter: 4.0,
        }
        .validated();
        assert_eq!(cfg.multiplier, 1.0);
        assert_eq!(cfg.jitter, 1.0);
        assert_eq!(cfg.max_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_total_budget_sums_all_delays() {
        let cfg = BackoffConfig::fixed(Duration::from_millis(250), 4);
        assert_eq!(cfg.total_budget(), Duration::from_secs(1));
        assert_eq!(BackoffConfig::no_retry().total_budget(), Duration::ZERO);
    }

    #[test]
    fn test_next_delay_exhausts_after_max_attempts() {
        let mut b = Backoff::new(BackoffConfig::fixed(Duration::from_millis(10), 2));
        assert_eq!(b.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(b.next_delay(), Some(Duration::from_millis(10)));
        assert!(b.is_exhausted());
        assert_eq!(b.next_delay(), None);
        assert_eq!(b.attempt(), 2);
    }

    #[test]
    fn test_jitter_only_shortens_delays() {
        let cfg = BackoffConfig {
            jitter: 0.5,
            max_attempts: 50,
            ..BackoffConfig::default()
        };
        let mut b = Backoff::new(cfg.clone());
        for n in 1..=50 {
            let d = b.next_delay().unwrap();
            let ceiling = cfg.delay_for(n);
            assert!(d <= ceiling, "attempt {n}: {d:?} > {ceiling:?}");
            assert!(d >= ceiling.mul_f64(0.5));
        }
    }

    #[test]
    fn test_reset_restores_full_budget() {
        let mut b = Backoff::new(BackoffConfig::fixed(Duration::from_millis(1), 1));
        b.next_delay();
        assert!(b.is_exhausted());

        b.reset();

        assert!(!b.is_exhausted());
        assert_eq!(b.attempt(), 0);
    }

    #[test]
    fn test_no_retry_is_exhausted_immediately() {
        let b = Backoff::new(BackoffConfig::no_retry());
        assert!(b.is_exhausted());
    }
}
