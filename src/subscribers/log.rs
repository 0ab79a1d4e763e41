//! # LogWriter: renders events through `tracing`.
//!
//! Script log lines keep their category: `debug`, `info`, `warning` and `error`
//! map onto the matching tracing level; `process_exception` is an `error` with
//! `category = "process_exception"`. Every script line is tagged
//! `[target:script]` like the rest of the session output.
//!
//! ## Example output (with a fmt subscriber installed)
//! ```text
//! INFO  patchvisor: session attached process="rwr_game.exe" pid=4242
//! WARN  patchvisor: target process not found, retrying process="rwr_game.exe" delay_ms=Some(15000) after_attempt=Some(3)
//! ERROR patchvisor: [rwr_game.exe:anti_fog_jmp_patch_0.js] access violation category="process_exception"
//! ```

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::backend::LogLevel;
use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Event writer subscriber.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    /// Construct a new [`LogWriter`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn scope(e: &Event) -> String {
    format!(
        "[{}:{}]",
        e.target.as_deref().unwrap_or("?"),
        e.script.as_deref().unwrap_or("?")
    )
}

fn script_log(e: &Event) {
    let sctx = scope(e);
    let text = e.reason.as_deref().unwrap_or("");
    match e.level {
        Some(LogLevel::Debug) => debug!("{sctx} {text}"),
        Some(LogLevel::Info) => info!("{sctx} {text}"),
        Some(LogLevel::Warning) => warn!("{sctx} {text}"),
        Some(LogLevel::Error) => error!("{sctx} {text}"),
        Some(LogLevel::ProcessException) => {
            error!(category = "process_exception", "{sctx} {text}")
        }
        None => error!("{sctx} log line without level: {text}"),
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let process = e.target.as_deref().unwrap_or("");
        match e.kind {
            EventKind::ScriptLog => script_log(e),
            EventKind::ScriptMessage => {
                info!("{}: {}", scope(e), e.reason.as_deref().unwrap_or(""));
            }
            EventKind::AttachStarting => {
                debug!(process, "creating session");
            }
            EventKind::AttachFailed => {
                warn!(process, err = ?e.reason, "attach failed");
            }
            EventKind::BackoffScheduled => {
                warn!(
                    process,
                    delay_ms = ?e.delay_ms,
                    after_attempt = ?e.attempt,
                    "target process not found, retrying"
                );
            }
            EventKind::SessionAttached => info!(process, pid = ?e.pid, "session attached"),
            EventKind::SessionInitialized => {
                debug!(process, pid = ?e.pid, facts = ?e.reason, "session initialised");
            }
            EventKind::SessionDetached => {
                info!(process, pid = ?e.pid, reason = ?e.reason, "session detached");
            }
            EventKind::ScriptCreated => debug!(process, script = ?e.script, "script created"),
            EventKind::ScriptLoaded => debug!(process, script = ?e.script, "script loaded"),
            EventKind::ScriptUnloaded => {
                debug!(process, script = ?e.script, reason = ?e.reason, "script unloaded");
            }
            EventKind::PatchCreated => {
                info!(process, patch = ?e.script, kind = ?e.reason, "patch created");
            }
            EventKind::PatchApplied => info!(process, patch = ?e.script, "patch applied"),
            EventKind::PatchCleared => info!(process, patch = ?e.script, "patch cleared"),
            EventKind::OperationFailed => {
                error!(process, script = ?e.script, err = ?e.reason, "operation failed");
            }
            EventKind::TelemetryDegraded => {
                error!(process, script = ?e.script, err = ?e.reason, "telemetry read failed");
            }
            EventKind::WatchStateChanged => {
                debug!(process, task = ?e.task, state = ?e.state, "watcher state");
            }
            EventKind::CleanupStarted => {
                info!(process, task = ?e.task, "cancelled, clearing applied patches");
            }
            EventKind::TaskStarting => debug!(task = ?e.task, "task starting"),
            EventKind::TaskStopped => debug!(task = ?e.task, reason = ?e.reason, "task stopped"),
            EventKind::TaskFailed => error!(task = ?e.task, err = ?e.reason, "task failed"),
            EventKind::ShutdownRequested => info!("shutdown requested"),
            EventKind::AllStoppedWithin => info!("all tasks stopped within grace"),
            EventKind::GraceExceeded => error!("grace exceeded"),
            EventKind::SubscriberOverflow => {
                warn!(subscriber = ?e.task, reason = ?e.reason, "subscriber overflow");
            }
            EventKind::SubscriberPanicked => {
                error!(subscriber = ?e.task, info = ?e.reason, "subscriber panicked");
            }
        }
    }

    fn name(&self) -> &'static str {
        "LogWriter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn renders_every_script_category() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
        let w = LogWriter::new();
        for level in [
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warning,
            LogLevel::Error,
            LogLevel::ProcessException,
        ] {
            let ev = Event::new(EventKind::ScriptLog)
                .with_target("proc.exe")
                .with_script("a.js")
                .with_level(level)
                .with_reason("hello");
            w.on_event(&ev).await;
        }
        assert_eq!(scope(&Event::new(EventKind::ScriptLog)), "[?:?]");
    }
}
