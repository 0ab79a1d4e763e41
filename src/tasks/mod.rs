//! # Task abstractions.
//!
//! - [`Task`] - trait for async cancelable tasks run by the supervisor
//! - [`TaskFn`] - function-based task implementation
//! - [`TaskRef`] - shared reference to a task (`Arc<dyn Task>`)

mod task;
mod task_fn;

pub use task::Task;
pub use task_fn::{TaskFn, TaskRef};
