//! # Retry delay for watchers waiting on a target process.
//!
//! [`BackoffPolicy`] decides how long a [`TargetWatcher`](crate::TargetWatcher)
//! waits after an attach attempt found no process. The default is a **fixed**
//! 15 second interval; a growth factor and jitter are available for fleets
//! of watchers that should not hammer the backend in lockstep.
//!
//! The delay for failure `n` (0-indexed) is `first × factor^n`, clamped to `max`,
//! then jitter is applied. The base is derived from `n` only, so jitter never
//! feeds back into later delays.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use patchvisor::BackoffPolicy;
//!
//! let fixed = BackoffPolicy::default();
//! assert_eq!(fixed.next(0), Duration::from_secs(15));
//! assert_eq!(fixed.next(7), Duration::from_secs(15));
//!
//! let growing = BackoffPolicy::fixed(Duration::from_secs(1))
//!     .with_factor(2.0)
//!     .with_max(Duration::from_secs(5));
//! assert_eq!(growing.next(2), Duration::from_secs(4));
//! assert_eq!(growing.next(3), Duration::from_secs(5));
//! ```

use std::time::Duration;

use crate::policies::jitter::JitterPolicy;

/// Interval between attach attempts when the target process is absent.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(15);

/// Retry backoff policy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub first: Duration,
    /// Maximum delay cap.
    pub max: Duration,
    /// Multiplicative growth factor (`1.0` = fixed interval).
    pub factor: f64,
    /// Randomization applied on top of the base delay.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// Fixed [`DEFAULT_RETRY_INTERVAL`], no jitter.
    fn default() -> Self {
        Self::fixed(DEFAULT_RETRY_INTERVAL)
    }
}

impl BackoffPolicy {
    /// Constant delay `interval` after every failure.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            first: interval,
            max: interval,
            factor: 1.0,
            jitter: JitterPolicy::None,
        }
    }

    /// Sets the growth factor. `max` is unchanged, so raise it as well.
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    pub fn with_jitter(mut self, jitter: JitterPolicy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Computes the delay after failure number `failure` (0-indexed).
    pub fn next(&self, failure: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exp = failure.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        let base = if !secs.is_finite() || secs < 0.0 || secs > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        };
        self.jitter.apply(base)
    }
}
