//! # Task abstraction.
//!
//! [`Task`] is the unit the [`Supervisor`](crate::Supervisor) runs: a watcher, a
//! serving loop supplied by the embedding application, anything long-running.
//! A task receives a [`CancellationToken`] and must stop promptly once it fires,
//! after any cleanup it owes.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;

/// # Asynchronous, cancelable unit.
///
/// # Example
/// ```
/// use tokio_util::sync::CancellationToken;
/// use async_trait::async_trait;
/// use patchvisor::{Task, TaskError};
///
/// struct Heartbeat;
///
/// #[async_trait]
/// impl Task for Heartbeat {
///     fn name(&self) -> &str { "heartbeat" }
///
///     async fn run(&self, ctx: CancellationToken) -> Result<(), TaskError> {
///         ctx.cancelled().await;
///         Err(TaskError::Canceled)
///     }
/// }
/// ```
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// Returns a stable, human-readable task name.
    fn name(&self) -> &str;

    /// Executes the task until completion or cancellation.
    ///
    /// Return `Err(TaskError::Canceled)` when stopping because `ctx` fired.
    async fn run(&self, ctx: CancellationToken) -> Result<(), TaskError>;
}
