//! # Runtime events emitted by the registry, sessions, watchers and supervisor.
//!
//! The [`EventKind`] enum classifies event types across five categories:
//! - **Attachment events**: attach attempts, sessions attached/initialised/detached
//! - **Script events**: scripts created/loaded, script log lines and messages
//! - **Patch events**: patches created/applied/cleared, rollbacks
//! - **Supervision events**: task lifecycle, watcher state, shutdown
//! - **Subscriber events**: overflow and panics inside subscribers
//!
//! The [`Event`] struct carries optional metadata: target, script, pid, log level,
//! reason, backoff delay, attempt and task name.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//! Use `seq` to restore the exact order when events are delivered out of order.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use patchvisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::BackoffScheduled)
//!     .with_target("proc.exe")
//!     .with_reason("process not found")
//!     .with_attempt(3)
//!     .with_delay(Duration::from_secs(15));
//!
//! assert_eq!(ev.kind, EventKind::BackoffScheduled);
//! assert_eq!(ev.target.as_deref(), Some("proc.exe"));
//! assert_eq!(ev.delay_ms, Some(15_000));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

use crate::backend::LogLevel;
use crate::core::WatchState;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets: `task` (subscriber name), `reason` (panic message).
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets: `task` (subscriber name), `reason` (`"full"` / `"closed"`).
    SubscriberOverflow,

    // === Shutdown events ===
    /// Shutdown requested (OS signal or explicit cancel).
    ShutdownRequested,

    /// All tasks stopped within the configured grace period.
    AllStoppedWithin,

    /// Grace period exceeded; some tasks did not stop in time.
    GraceExceeded,

    // === Task lifecycle events ===
    /// Supervised task started.
    ///
    /// Sets: `task`.
    TaskStarting,

    /// Supervised task finished (successfully or after cancellation).
    ///
    /// Sets: `task`, optional `reason` (`"canceled"`).
    TaskStopped,

    /// Supervised task returned an error.
    ///
    /// Sets: `task`, `reason`.
    TaskFailed,

    // === Attachment events ===
    /// An attach attempt is starting.
    ///
    /// Sets: `target`.
    AttachStarting,

    /// An attach attempt failed.
    ///
    /// Sets: `target`, `reason`.
    AttachFailed,

    /// Attach succeeded and the session is registered.
    ///
    /// Sets: `target`, `pid`.
    SessionAttached,

    /// Session finished init (utility loaded, facts queried).
    ///
    /// Sets: `target`, `pid`, `reason` (facts summary).
    SessionInitialized,

    /// Session detached and was removed from the registry.
    ///
    /// Sets: `target`, `pid`, `reason` (detach reason).
    SessionDetached,

    /// A watcher scheduled the next attach attempt.
    ///
    /// Sets: `target`, `delay_ms`, `attempt`, `reason` (last failure).
    BackoffScheduled,

    // === Script events ===
    /// Script created inside a session.
    ///
    /// Sets: `target`, `script`.
    ScriptCreated,

    /// Script loaded.
    ///
    /// Sets: `target`, `script`.
    ScriptLoaded,

    /// Script unloaded (rollback or explicit).
    ///
    /// Sets: `target`, `script`.
    ScriptUnloaded,

    /// Log line emitted by an injected script.
    ///
    /// Sets: `target`, `script`, `level`, `reason` (the text).
    ScriptLog,

    /// Message sent by an injected script.
    ///
    /// Sets: `target`, `script`, `reason` (payload text).
    ScriptMessage,

    // === Patch events ===
    /// Patch script created and loaded, filed under its logical name.
    ///
    /// Sets: `target`, `script` (logical patch name), `reason` (patch kind).
    PatchCreated,

    /// Patch applied.
    ///
    /// Sets: `target`, `script` (logical patch name).
    PatchApplied,

    /// Patch cleared.
    ///
    /// Sets: `target`, `script` (logical patch name).
    PatchCleared,

    /// A session operation failed and was surfaced to the caller.
    ///
    /// Sets: `target`, optional `script`, `reason`.
    OperationFailed,

    /// An informational read failed and a default was returned instead.
    ///
    /// Sets: `target`, `script`, `reason`.
    TelemetryDegraded,

    // === Watcher events ===
    /// Watcher moved to a new state.
    ///
    /// Sets: `target`, `task`, `state`.
    WatchStateChanged,

    /// Watcher is clearing applied patches before stopping.
    ///
    /// Sets: `target`, `task`.
    CleanupStarted,
}

/// Runtime event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Target identifier, if applicable.
    pub target: Option<Arc<str>>,
    /// Script or logical patch name, if applicable.
    pub script: Option<Arc<str>>,
    /// Target process id, if known.
    pub pid: Option<u32>,
    /// Script log level (only for `ScriptLog`).
    pub level: Option<LogLevel>,
    /// Human-readable reason (errors, log text, overflow details...).
    pub reason: Option<Arc<str>>,
    /// Backoff delay before next attempt in milliseconds (compact).
    pub delay_ms: Option<u32>,
    /// Attempt count (starting from 1).
    pub attempt: Option<u32>,
    /// Name of the supervised task or subscriber, if applicable.
    pub task: Option<Arc<str>>,
    /// New watcher state (only for `WatchStateChanged`).
    pub state: Option<WatchState>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            target: None,
            script: None,
            pid: None,
            level: None,
            reason: None,
            delay_ms: None,
            attempt: None,
            task: None,
            state: None,
        }
    }

    #[inline]
    pub fn with_target(mut self, target: impl Into<Arc<str>>) -> Self {
        self.target = Some(target.into());
        self
    }

    #[inline]
    pub fn with_script(mut self, script: impl Into<Arc<str>>) -> Self {
        self.script = Some(script.into());
        self
    }

    #[inline]
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    #[inline]
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = Some(level);
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches a backoff delay (stored as milliseconds).
    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        let ms = d.as_millis().min(u128::from(u32::MAX)) as u32;
        self.delay_ms = Some(ms);
        self
    }

    /// Attaches an attempt count.
    #[inline]
    pub fn with_attempt(mut self, n: u32) -> Self {
        self.attempt = Some(n);
        self
    }

    /// Attaches a task (or subscriber) name.
    #[inline]
    pub fn with_task(mut self, task: impl Into<Arc<str>>) -> Self {
        self.task = Some(task.into());
        self
    }

    #[inline]
    pub fn with_state(mut self, state: WatchState) -> Self {
        self.state = Some(state);
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_task(subscriber)
            .with_reason(format!("subscriber={subscriber} reason={reason}"))
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_task(subscriber)
            .with_reason(info)
    }

    #[inline]
    pub fn is_subscriber_overflow(&self) -> bool {
        matches!(self.kind, EventKind::SubscriberOverflow)
    }
}
