//! # Script: one named unit of injected logic.
//!
//! A [`Script`] wraps a backend [`ScriptHandle`] with load-state tracking and
//! event-bus bindings. Created through [`Session::create_script`](crate::Session::create_script).
//!
//! ## State
//! ```text
//! Unloaded ──load()──► Loading ──ok──► Loaded ──unload()──► Unloaded
//!                         └──err──► Unloaded
//! ```
//! A second `load()` while Loading or Loaded fails with `ScriptAlreadyLoaded`.
//! A bound script that the backend destroys goes back to Unloaded.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::backend::{
    LogHandler, LogLevel, MessageHandler, RemoteCall, RemoteValue, ScriptHandle, ScriptSignal,
};
use crate::core::offload::Offload;
use crate::error::SessionError;
use crate::events::{Bus, Event, EventKind};

const UNLOADED: u8 = 0;
const LOADING: u8 = 1;
const LOADED: u8 = 2;

/// Read-only view of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptInfo {
    pub name: String,
    pub loaded: bool,
}

/// Script created inside a session.
pub struct Script {
    name: Arc<str>,
    source: Arc<str>,
    target: Arc<str>,
    handle: Arc<dyn ScriptHandle>,
    state: Arc<AtomicU8>,
    offload: Offload,
    bus: Bus,
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}

/// Returns the state to `Unloaded` unless the load committed.
struct LoadAttempt<'a> {
    state: &'a AtomicU8,
    done: bool,
}

impl Drop for LoadAttempt<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.state.store(UNLOADED, Ordering::SeqCst);
        }
    }
}

impl Script {
    pub(crate) fn new(
        name: &str,
        source: &str,
        target: Arc<str>,
        handle: Arc<dyn ScriptHandle>,
        offload: Offload,
        bus: Bus,
    ) -> Self {
        Self {
            name: Arc::from(name),
            source: Arc::from(source),
            target,
            handle,
            state: Arc::new(AtomicU8::new(UNLOADED)),
            offload,
            bus,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_loaded(&self) -> bool {
        self.state.load(Ordering::SeqCst) == LOADED
    }

    pub fn info(&self) -> ScriptInfo {
        ScriptInfo {
            name: self.name.to_string(),
            loaded: self.is_loaded(),
        }
    }

    /// Loads the script in the target.
    pub async fn load(&self) -> Result<(), SessionError> {
        if self
            .state
            .compare_exchange(UNLOADED, LOADING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SessionError::ScriptAlreadyLoaded {
                script: self.name.to_string(),
            });
        }
        let mut attempt = LoadAttempt {
            state: &self.state,
            done: false,
        };

        let handle = Arc::clone(&self.handle);
        self.offload
            .run(move || handle.load())
            .await?
            .map_err(SessionError::from_backend)?;

        self.state.store(LOADED, Ordering::SeqCst);
        attempt.done = true;
        self.bus.publish(
            Event::new(EventKind::ScriptLoaded)
                .with_target(Arc::clone(&self.target))
                .with_script(Arc::clone(&self.name)),
        );
        Ok(())
    }

    /// Unloads the script. No-op unless loaded.
    pub async fn unload(&self) -> Result<(), SessionError> {
        if !self.is_loaded() {
            return Ok(());
        }
        let handle = Arc::clone(&self.handle);
        self.offload
            .run(move || handle.unload())
            .await?
            .map_err(SessionError::from_backend)?;

        self.state.store(UNLOADED, Ordering::SeqCst);
        self.bus.publish(
            Event::new(EventKind::ScriptUnloaded)
                .with_target(Arc::clone(&self.target))
                .with_script(Arc::clone(&self.name)),
        );
        Ok(())
    }

    /// Drops a script that never became usable: handlers off, backend unload best-effort.
    pub(crate) async fn discard(&self) {
        self.set_log_handler(None);
        self.on(ScriptSignal::Message, None);
        self.on(ScriptSignal::Destroyed, None);
        let handle = Arc::clone(&self.handle);
        let _ = self.offload.run(move || handle.unload()).await;
        self.state.store(UNLOADED, Ordering::SeqCst);
    }

    /// Installs or removes (`None`) the log handler.
    pub fn set_log_handler(&self, handler: Option<LogHandler>) {
        self.handle.set_log_handler(handler);
    }

    /// Installs or removes (`None`) the handler for `signal`.
    pub fn on(&self, signal: ScriptSignal, handler: Option<MessageHandler>) {
        self.handle.on(signal, handler);
    }

    /// Forwards log lines and messages to `bus` tagged with this script's identity.
    ///
    /// Also tracks backend-side destruction: the script is marked unloaded and
    /// `ScriptUnloaded` is published with reason `"destroyed"`.
    pub fn bind_to_bus(&self, bus: &Bus) {
        let (b, target, script) = (bus.clone(), Arc::clone(&self.target), Arc::clone(&self.name));
        self.set_log_handler(Some(Arc::new(move |level: LogLevel, text: &str| {
            b.publish(
                Event::new(EventKind::ScriptLog)
                    .with_target(Arc::clone(&target))
                    .with_script(Arc::clone(&script))
                    .with_level(level)
                    .with_reason(text),
            );
        })));

        let (b, target, script) = (bus.clone(), Arc::clone(&self.target), Arc::clone(&self.name));
        self.on(
            ScriptSignal::Message,
            Some(Arc::new(move |payload: &str, data: Option<&[u8]>| {
                let reason = match data {
                    Some(bytes) => format!("{payload} data={}", data_preview(bytes)),
                    None => payload.to_string(),
                };
                b.publish(
                    Event::new(EventKind::ScriptMessage)
                        .with_target(Arc::clone(&target))
                        .with_script(Arc::clone(&script))
                        .with_reason(reason),
                );
            })),
        );

        let (b, target, script) = (bus.clone(), Arc::clone(&self.target), Arc::clone(&self.name));
        let state = Arc::clone(&self.state);
        self.on(
            ScriptSignal::Destroyed,
            Some(Arc::new(move |reason: &str, _data: Option<&[u8]>| {
                if state.swap(UNLOADED, Ordering::SeqCst) != UNLOADED {
                    b.publish(
                        Event::new(EventKind::ScriptUnloaded)
                            .with_target(Arc::clone(&target))
                            .with_script(Arc::clone(&script))
                            .with_reason(reason),
                    );
                }
            })),
        );
    }

    /// Invokes a remote export and waits for the reply.
    pub async fn call(&self, call: RemoteCall) -> Result<RemoteValue, SessionError> {
        let handle = Arc::clone(&self.handle);
        self.offload
            .run(move || handle.call(&call))
            .await?
            .map_err(SessionError::from_backend)
    }

    pub(crate) fn handle(&self) -> &Arc<dyn ScriptHandle> {
        &self.handle
    }

    pub(crate) fn offload(&self) -> &Offload {
        &self.offload
    }
}

/// Number of bytes shown in a message data preview.
const PREVIEW_BYTES: usize = 16;

/// `"<len>B <hex of the first bytes>"`, with `..` when truncated.
fn data_preview(data: &[u8]) -> String {
    let mut out = format!("{}B", data.len());
    if !data.is_empty() {
        out.push(' ');
    }
    for b in data.iter().take(PREVIEW_BYTES) {
        out.push_str(&format!("{b:02x}"));
    }
    if data.len() > PREVIEW_BYTES {
        out.push_str("..");
    }
    out
}
