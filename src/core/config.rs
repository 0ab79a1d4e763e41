//! # Global runtime configuration.
//!
//! Provides [`Config`], the settings shared by the supervisor, the registry and
//! every session it creates.
//!
//! ## Sentinel values
//! - `max_blocking = 0` → no cap on concurrent offloaded backend calls
//! - `grace = 0s` → don't wait for tasks after cancelling them

use std::path::PathBuf;
use std::time::Duration;

use crate::policies::BackoffPolicy;

/// Global configuration for the patchvisor runtime.
///
/// ## Field semantics
/// - `grace`: maximum wait for tasks to stop after shutdown was requested
/// - `bus_capacity`: event bus ring buffer size (min 1; clamped by Bus)
/// - `max_blocking`: concurrent blocking backend calls (`0` = unlimited)
/// - `retry`: watcher wait between attach attempts while the target is absent
/// - `utility_script` / `utility_name`: where the per-session utility script is read
///   from and the name it gets inside the target
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum time to wait for graceful shutdown before giving up.
    ///
    /// Watchers use this window to clear applied patches, so keep it larger
    /// than one round of remote calls.
    pub grace: Duration,

    /// Capacity of the event bus broadcast channel ring buffer.
    pub bus_capacity: usize,

    /// Maximum number of backend calls running on the blocking pool at once.
    ///
    /// - `0` = unlimited (no semaphore)
    /// - `n > 0` = at most `n` calls in flight
    pub max_blocking: usize,

    /// Retry policy used by watchers after `AttachFailure`.
    pub retry: BackoffPolicy,

    /// Filesystem path of the utility script source loaded by `Session::init`.
    pub utility_script: PathBuf,

    /// Script name the utility script is created under.
    pub utility_name: String,
}

impl Config {
    /// Returns the offload concurrency limit as an `Option`.
    #[inline]
    pub fn blocking_limit(&self) -> Option<usize> {
        match self.max_blocking {
            0 => None,
            n => Some(n),
        }
    }

    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `grace = 60s`
    /// - `bus_capacity = 1024`
    /// - `max_blocking = 4`
    /// - `retry = BackoffPolicy::default()` (fixed 15s)
    /// - `utility_script = "scripts/_patchvisor.js"`, `utility_name = "_patchvisor.js"`
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(60),
            bus_capacity: 1024,
            max_blocking: 4,
            retry: BackoffPolicy::default(),
            utility_script: PathBuf::from("scripts/_patchvisor.js"),
            utility_name: "_patchvisor.js".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_blocking_means_unlimited() {
        let cfg = Config {
            max_blocking: 0,
            bus_capacity: 0,
            ..Config::default()
        };
        assert_eq!(cfg.blocking_limit(), None);
        assert_eq!(cfg.bus_capacity_clamped(), 1);
        assert_eq!(Config::default().blocking_limit(), Some(4));
    }
}
