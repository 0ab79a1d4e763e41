//! # Instrumentation backend seam.
//!
//! patchvisor never talks to a target process directly. Everything that touches
//! the target goes through three traits implemented by an instrumentation backend:
//!
//! ```text
//! Attacher ──attach(target)──► Attachment ──create_script(name, src)──► ScriptHandle
//!                                 │                                      ├─ load()/unload()
//!                                 ├─ pid()                               ├─ set_log_handler()
//!                                 ├─ observe_detach(DetachObserver)      ├─ on(signal, handler)
//!                                 └─ detach()                            └─ call(&RemoteCall)
//! ```
//!
//! ## Rules
//! - All trait methods are **blocking**. The core never calls them on the async
//!   scheduler; it routes them through [`Offload`](crate::core::Offload).
//! - Dropping the last handle to an [`Attachment`] must detach it. An attach that
//!   completes after its caller gave up is released this way.
//! - Handlers registered on a [`ScriptHandle`] run on backend threads and must not block.
//! - Remote calls are typed: one [`RemoteCall`] variant per export the core uses.

mod remote;

#[cfg(test)]
pub(crate) mod fake;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

pub use remote::{RemoteCall, RemoteValue};

/// Errors reported by a backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// No process matches the requested target.
    #[error("process not found: {0}")]
    ProcessNotFound(String),
    /// Operation on a detached attachment, unloaded script, etc.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// Any other failure talking to the target.
    #[error("transport: {0}")]
    Transport(String),
}

/// Severity of a log line emitted by an injected script.
///
/// The five categories a script can emit; `ProcessException` is raised by the
/// target-side exception handler rather than by a log call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    ProcessException,
}

impl LogLevel {
    /// Parses the wire spelling used by script runtimes.
    ///
    /// Returns `None` for levels the core doesn't know; backends should
    /// forward those as [`LogLevel::Error`] with the original level in the text.
    pub fn parse(level: &str) -> Option<Self> {
        match level {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warning" | "warn" => Some(LogLevel::Warning),
            "error" => Some(LogLevel::Error),
            "process_exception" => Some(LogLevel::ProcessException),
            _ => None,
        }
    }

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::ProcessException => "process_exception",
        }
    }
}

/// Signals a script can deliver besides log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptSignal {
    /// `send()` from the injected script: a text payload plus optional binary data.
    Message,
    /// The script was destroyed on the target side.
    Destroyed,
}

/// Handler for script log lines.
pub type LogHandler = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Handler for script signals. `data` is only present for [`ScriptSignal::Message`].
pub type MessageHandler = Arc<dyn Fn(&str, Option<&[u8]>) + Send + Sync>;

/// Why an attachment went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetachReason {
    /// [`Attachment::detach`] was called.
    ApplicationRequested,
    /// The target process exited or was killed.
    ProcessTerminated,
    /// The target replaced its image (exec).
    ProcessReplaced,
    /// Connection to the backend agent was lost.
    ConnectionTerminated,
    /// The device hosting the target disappeared.
    DeviceLost,
}

impl DetachReason {
    /// Stable snake_case name for events.
    pub fn as_str(&self) -> &'static str {
        match self {
            DetachReason::ApplicationRequested => "application_requested",
            DetachReason::ProcessTerminated => "process_terminated",
            DetachReason::ProcessReplaced => "process_replaced",
            DetachReason::ConnectionTerminated => "connection_terminated",
            DetachReason::DeviceLost => "device_lost",
        }
    }
}

/// Process-unique identity of one session (one successful attach).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub(crate) u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Detach notice delivered to the registry listener.
#[derive(Debug, Clone)]
pub(crate) struct DetachNotice {
    pub target: Arc<str>,
    pub session: SessionId,
    pub reason: DetachReason,
}

/// Observer handed to [`Attachment::observe_detach`].
///
/// The backend calls [`DetachObserver::notify`] from any thread when the
/// attachment goes away. Notifying more than once is harmless; notifying after
/// the registry stopped listening is a no-op.
#[derive(Debug, Clone)]
pub struct DetachObserver {
    target: Arc<str>,
    session: SessionId,
    tx: mpsc::UnboundedSender<DetachNotice>,
}

impl DetachObserver {
    pub(crate) fn new(
        target: Arc<str>,
        session: SessionId,
        tx: mpsc::UnboundedSender<DetachNotice>,
    ) -> Self {
        Self {
            target,
            session,
            tx,
        }
    }

    /// Reports that the attachment detached.
    pub fn notify(&self, reason: DetachReason) {
        let _ = self.tx.send(DetachNotice {
            target: Arc::clone(&self.target),
            session: self.session,
            reason,
        });
    }
}

/// Entry point of a backend: turns a target name into a live attachment.
pub trait Attacher: Send + Sync + 'static {
    /// Attaches to the process identified by `target`.
    ///
    /// Returns [`BackendError::ProcessNotFound`] when no such process exists.
    fn attach(&self, target: &str) -> Result<Arc<dyn Attachment>, BackendError>;
}

/// One live attachment to a target process.
pub trait Attachment: Send + Sync + 'static {
    /// Process id of the attached target.
    fn pid(&self) -> u32;

    /// Creates (but does not load) a script inside the target.
    fn create_script(&self, name: &str, source: &str)
    -> Result<Arc<dyn ScriptHandle>, BackendError>;

    /// Registers the observer fired when this attachment detaches.
    ///
    /// Only one observer is kept; a new one replaces the previous.
    fn observe_detach(&self, observer: DetachObserver);

    /// Detaches from the target. The observer fires with
    /// [`DetachReason::ApplicationRequested`].
    fn detach(&self) -> Result<(), BackendError>;
}

/// One script created inside an attachment.
pub trait ScriptHandle: Send + Sync + 'static {
    /// Loads the script in the target. Blocks until the script's top level ran.
    fn load(&self) -> Result<(), BackendError>;

    /// Unloads the script from the target.
    fn unload(&self) -> Result<(), BackendError>;

    /// Installs (`Some`) or removes (`None`) the log handler.
    fn set_log_handler(&self, handler: Option<LogHandler>);

    /// Installs (`Some`) or removes (`None`) the handler for `signal`.
    fn on(&self, signal: ScriptSignal, handler: Option<MessageHandler>);

    /// Invokes an exported remote function and waits for its reply.
    fn call(&self, call: &RemoteCall) -> Result<RemoteValue, BackendError>;
}
