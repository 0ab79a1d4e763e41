//! # Function-backed task (`TaskFn`)
//!
//! [`TaskFn`] wraps a closure `F: Fn(CancellationToken) -> Fut`. Embedders use it
//! to run their own loops (an HTTP front end, a status poller) next to the
//! watchers, under the same shutdown.
//!
//! ## Example
//! ```rust
//! use tokio_util::sync::CancellationToken;
//! use patchvisor::{TaskFn, TaskRef, TaskError};
//!
//! let t: TaskRef = TaskFn::arc("status-page", |ctx: CancellationToken| async move {
//!     ctx.cancelled().await;
//!     Err::<(), _>(TaskError::Canceled)
//! });
//!
//! assert_eq!(t.name(), "status-page");
//! ```

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::tasks::task::Task;

/// Shared handle to a task.
pub type TaskRef = Arc<dyn Task>;

/// Function-backed task implementation.
#[derive(Debug)]
pub struct TaskFn<F> {
    name: Cow<'static, str>,
    f: F,
}

impl<F> TaskFn<F> {
    pub fn new(name: impl Into<Cow<'static, str>>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }

    /// Creates the task and returns it as a shared handle.
    pub fn arc(name: impl Into<Cow<'static, str>>, f: F) -> Arc<Self> {
        Arc::new(Self::new(name, f))
    }
}

#[async_trait]
impl<F, Fut> Task for TaskFn<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: CancellationToken) -> Result<(), TaskError> {
        (self.f)(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closure_sees_cancellation() {
        let t = TaskFn::arc("loop", |ctx: CancellationToken| async move {
            ctx.cancelled().await;
            Err(TaskError::Canceled)
        });
        let token = CancellationToken::new();
        token.cancel();
        let res = t.run(token).await;
        assert!(matches!(res, Err(TaskError::Canceled)));
    }
}
