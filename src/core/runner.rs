//! # Run one supervised task to completion.
//!
//! Wraps [`Task::run`] with lifecycle events and alive tracking.
//!
//! ## Event flow
//! ```text
//! TaskStarting ─► task.run(token)
//!                   ├─ Ok(())          → TaskStopped
//!                   ├─ Err(Canceled)   → TaskStopped (reason "canceled")
//!                   └─ Err(Fatal/Fail) → TaskFailed
//! ```
//!
//! ## Rules
//! - Always publishes **exactly one** terminal event.
//! - `Canceled` is a graceful exit, not a failure.
//! - The task name stays in [`AliveSet`] until `run` returns; shutdown reports
//!   the leftovers as stuck.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::events::{Bus, Event, EventKind};
use crate::tasks::TaskRef;

/// Names of tasks that have not returned yet.
#[derive(Default)]
pub(crate) struct AliveSet {
    names: Mutex<HashMap<String, usize>>,
}

impl AliveSet {
    fn enter(&self, name: &str) {
        *self.names.lock().entry(name.to_string()).or_insert(0) += 1;
    }

    fn leave(&self, name: &str) {
        let mut names = self.names.lock();
        if let Some(n) = names.get_mut(name) {
            *n -= 1;
            if *n == 0 {
                names.remove(name);
            }
        }
    }

    /// Sorted names of tasks still running.
    pub(crate) fn snapshot(&self) -> Vec<String> {
        let mut names: Vec<String> = self.names.lock().keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

/// Runs `task` until it returns, publishing lifecycle events to `bus`.
pub(crate) async fn run_task(
    task: TaskRef,
    token: CancellationToken,
    bus: Bus,
    alive: Arc<AliveSet>,
) {
    let name = task.name().to_string();
    alive.enter(&name);
    bus.publish(Event::new(EventKind::TaskStarting).with_task(name.as_str()));

    match task.run(token).await {
        Ok(()) => {
            bus.publish(Event::new(EventKind::TaskStopped).with_task(name.as_str()));
        }
        Err(TaskError::Canceled) => {
            bus.publish(
                Event::new(EventKind::TaskStopped)
                    .with_task(name.as_str())
                    .with_reason("canceled"),
            );
        }
        Err(e) => {
            bus.publish(
                Event::new(EventKind::TaskFailed)
                    .with_task(name.as_str())
                    .with_reason(e.to_string()),
            );
        }
    }
    alive.leave(&name);
}
