//! Error types used by the patchvisor runtime, sessions and tasks.
//!
//! This module defines three error enums:
//!
//! - [`SessionError`]: errors raised by the registry, sessions, scripts and patches.
//! - [`RuntimeError`]: errors raised by the supervision scope itself.
//! - [`TaskError`]: outcomes of individual supervised tasks (watchers, serving loops).
//!
//! All of them provide `as_label` for logs; [`SessionError::is_retryable`] tells the
//! watcher which failures are worth another attach attempt.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendError;

/// # Errors produced by attachments, sessions, scripts and patches.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The target process does not exist (yet).
    #[error("attach to '{target}' failed: {reason}")]
    AttachFailure {
        /// Target identifier passed to attach.
        target: String,
        /// Backend message.
        reason: String,
    },

    /// A session for this target is already registered.
    #[error("session '{pid}' already targeting '{target}'")]
    DuplicateSession {
        /// Target identifier.
        target: String,
        /// Process id of the existing session.
        pid: u32,
    },

    /// Another attach for this target has not finished yet.
    #[error("attach to '{target}' already in progress")]
    AttachInProgress {
        /// Target identifier.
        target: String,
    },

    /// The backend refused to create a script.
    #[error("creating script '{script}' failed: {reason}")]
    ScriptCreationFailure {
        /// Script name.
        script: String,
        /// Backend message.
        reason: String,
    },

    /// The attachment (or script) can no longer be used, usually because it detached.
    #[error("invalid operation: {reason}")]
    InvalidOperation {
        /// Backend message.
        reason: String,
    },

    /// The utility script source could not be read.
    #[error("can't load script source from non-existent path '{}'", .path.display())]
    ResourceMissing {
        /// Path that was looked up.
        path: PathBuf,
    },

    /// Patch is not in the state the operation requires.
    #[error("patch '{patch}' is {}", patch_state(.applied))]
    InvalidPatchState {
        /// Logical patch name.
        patch: String,
        /// Observed `applied` flag.
        applied: bool,
    },

    /// The remote side of a patch reported failure for apply/clear.
    #[error("patch '{patch}' rejected {op}")]
    PatchRejected {
        /// Logical patch name.
        patch: String,
        /// `"apply"` or `"clear"`.
        op: &'static str,
    },

    /// A script or patch with this name already exists in the session.
    #[error("name '{name}' already in use in session for '{target}'")]
    NameInUse {
        /// Target identifier.
        target: String,
        /// Conflicting name.
        name: String,
    },

    /// `load()` called on a script that is loaded or loading.
    #[error("script '{script}' already loaded")]
    ScriptAlreadyLoaded {
        /// Script name.
        script: String,
    },

    /// `init()` called twice on one session.
    #[error("session for '{target}' already initialised")]
    AlreadyInitialized {
        /// Target identifier.
        target: String,
    },

    /// The patch compiler could not produce a script.
    #[error("compiling patch '{patch}' failed: {reason}")]
    CompileFailure {
        /// Logical patch name.
        patch: String,
        /// Compiler message.
        reason: String,
    },

    /// A remote call returned a value of the wrong shape.
    #[error("remote call '{call}' returned unexpected value: {got}")]
    UnexpectedReply {
        /// Remote call name.
        call: &'static str,
        /// Debug rendering of the reply.
        got: String,
    },

    /// The blocking worker pool failed (closed or the blocking call panicked).
    #[error("offloaded call failed: {reason}")]
    Offload {
        /// Join/semaphore failure description.
        reason: String,
    },
}

fn patch_state(applied: &bool) -> &'static str {
    if *applied { "already applied" } else { "not applied" }
}

impl SessionError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use patchvisor::SessionError;
    ///
    /// let err = SessionError::DuplicateSession { target: "proc.exe".into(), pid: 42 };
    /// assert_eq!(err.as_label(), "duplicate_session");
    /// assert!(err.to_string().contains("42"));
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            SessionError::AttachFailure { .. } => "attach_failure",
            SessionError::DuplicateSession { .. } => "duplicate_session",
            SessionError::AttachInProgress { .. } => "attach_in_progress",
            SessionError::ScriptCreationFailure { .. } => "script_creation_failure",
            SessionError::InvalidOperation { .. } => "invalid_operation",
            SessionError::ResourceMissing { .. } => "resource_missing",
            SessionError::InvalidPatchState { .. } => "invalid_patch_state",
            SessionError::PatchRejected { .. } => "patch_rejected",
            SessionError::NameInUse { .. } => "name_in_use",
            SessionError::ScriptAlreadyLoaded { .. } => "script_already_loaded",
            SessionError::AlreadyInitialized { .. } => "already_initialized",
            SessionError::CompileFailure { .. } => "compile_failure",
            SessionError::UnexpectedReply { .. } => "unexpected_reply",
            SessionError::Offload { .. } => "offload_failure",
        }
    }

    /// Indicates whether a watcher should wait and attach again.
    ///
    /// Only [`SessionError::AttachFailure`] is retryable; everything else is
    /// either a caller error or a backend state the watcher can't fix.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::AttachFailure { .. })
    }

    /// Maps a backend error raised while talking to an existing attachment.
    pub(crate) fn from_backend(err: BackendError) -> Self {
        match err {
            BackendError::ProcessNotFound(reason) => SessionError::AttachFailure {
                target: String::new(),
                reason,
            },
            BackendError::InvalidOperation(reason) | BackendError::Transport(reason) => {
                SessionError::InvalidOperation { reason }
            }
        }
    }
}

/// # Errors produced by the supervision scope.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Shutdown grace period was exceeded; some tasks remained stuck.
    #[error("shutdown timeout {grace:?} exceeded; stuck: {stuck:?}; forcing termination")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Names of tasks that did not stop in time.
        stuck: Vec<String>,
    },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
        }
    }
}

/// # Outcome of a supervised task.
///
/// `Canceled` is not a failure: it is how a task reports that it stopped
/// because its token was cancelled (after any cleanup it owes).
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TaskError {
    /// Non-recoverable error; the task has stopped for good.
    #[error("fatal error (no retry): {error}")]
    Fatal {
        /// The underlying error.
        error: String,
    },

    /// Task execution failed.
    #[error("execution failed: {error}")]
    Fail {
        /// The underlying error.
        error: String,
    },

    /// Task was cancelled due to parent context shutdown.
    #[error("context cancelled")]
    Canceled,
}

impl TaskError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use patchvisor::TaskError;
    ///
    /// assert_eq!(TaskError::Canceled.as_label(), "task_canceled");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::Fatal { .. } => "task_fatal",
            TaskError::Fail { .. } => "task_failed",
            TaskError::Canceled => "task_canceled",
        }
    }

    /// True for [`TaskError::Canceled`].
    pub fn is_canceled(&self) -> bool {
        matches!(self, TaskError::Canceled)
    }
}

impl From<SessionError> for TaskError {
    fn from(err: SessionError) -> Self {
        TaskError::Fatal {
            error: err.to_string(),
        }
    }
}
