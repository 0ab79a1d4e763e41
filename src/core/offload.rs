//! # Gate in front of the blocking pool.
//!
//! Every backend call (attach, script creation, load, remote calls, detach) blocks
//! its thread. [`Offload`] runs such calls through [`tokio::task::spawn_blocking`]
//! behind an optional semaphore sized by [`Config::max_blocking`](crate::Config).
//!
//! ## Rules
//! - The permit moves into the blocking closure, so the cap holds even when the
//!   awaiting future is dropped and the call keeps running.
//! - A dropped future abandons the result; the closure still runs to completion.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::SessionError;

/// Bounded access to the blocking pool.
///
/// Cheap to clone; clones share the semaphore.
#[derive(Clone, Debug)]
pub struct Offload {
    semaphore: Option<Arc<Semaphore>>,
}

impl Offload {
    /// `None` = no cap.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            semaphore: limit.map(|n| Arc::new(Semaphore::new(n))),
        }
    }

    /// Runs `f` on the blocking pool and waits for its result.
    pub async fn run<F, T>(&self, f: F) -> Result<T, SessionError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = match &self.semaphore {
            Some(sem) => Some(Arc::clone(sem).acquire_owned().await.map_err(|_| {
                SessionError::Offload {
                    reason: "blocking gate closed".into(),
                }
            })?),
            None => None,
        };

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .map_err(|e| SessionError::Offload {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cap_limits_concurrent_calls() {
        let gate = Offload::new(Some(1));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut calls = Vec::new();
        for _ in 0..4 {
            let gate = gate.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            calls.push(tokio::spawn(async move {
                gate.run(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        for c in calls {
            c.await.expect("join").expect("offload");
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panic_in_call_is_offload_error() {
        let gate = Offload::new(None);
        let err = gate
            .run(|| -> u32 { panic!("backend crashed") })
            .await
            .expect_err("panic");
        assert_eq!(err.as_label(), "offload_failure");
    }
}
