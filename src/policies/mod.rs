//! Retry policies.
//!
//! - [`BackoffPolicy`] how long a watcher waits before the next attach attempt
//! - [`JitterPolicy`]  randomization on top of the base delay
//!
//! ## Defaults
//! - `BackoffPolicy::default()` → fixed 15s, jitter=None.

mod backoff;
mod jitter;

pub use backoff::{BackoffPolicy, DEFAULT_RETRY_INTERVAL};
pub use jitter::JitterPolicy;
