//! # Patch: a script that can modify and restore target memory.
//!
//! A [`Patch`] is a loaded [`Script`] filed under a logical name, plus an
//! `applied` flag driven by the script's `apply` / `clear` exports.
//!
//! ## Rules
//! - `apply()` requires `applied == false`, `clear()` requires `applied == true`;
//!   otherwise `InvalidPatchState`.
//! - A remote reply of `false` is `PatchRejected` and leaves the flag unchanged.
//! - Operations on one patch are serialized.
//! - The flag is written on the blocking thread together with the remote reply,
//!   so it tracks target memory even when the awaiting future is dropped.
//!
//! [`PatchGuard`] ties an applied patch to a scope: `release().await` clears it,
//! dropping an unreleased guard spawns the clear.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendError, RemoteCall, RemoteValue};
use crate::core::script::Script;
use crate::error::SessionError;
use crate::events::{Bus, Event, EventKind};
use crate::patches::PatchKind;

/// Read-only view of a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchInfo {
    /// Logical name.
    pub name: String,
    /// Name of the backing script.
    pub script: String,
    /// `"jmp"` or `"nop"`.
    pub kind: &'static str,
    pub module: String,
    pub applied: bool,
}

/// Patch created inside a session.
pub struct Patch {
    name: Arc<str>,
    target: Arc<str>,
    script: Arc<Script>,
    kind: PatchKind,
    applied: Arc<AtomicBool>,
    op: Mutex<()>,
    session_gone: CancellationToken,
    bus: Bus,
}

impl fmt::Debug for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Patch")
            .field("name", &self.name)
            .field("script", &self.script.name())
            .field("kind", &self.kind.as_str())
            .field("applied", &self.is_applied())
            .finish_non_exhaustive()
    }
}

impl Patch {
    pub(crate) fn new(
        name: &str,
        target: Arc<str>,
        script: Arc<Script>,
        kind: PatchKind,
        session_gone: CancellationToken,
        bus: Bus,
    ) -> Self {
        Self {
            name: Arc::from(name),
            target,
            script,
            kind,
            applied: Arc::new(AtomicBool::new(false)),
            op: Mutex::new(()),
            session_gone,
            bus,
        }
    }

    /// Logical name given at creation.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn script(&self) -> &Arc<Script> {
        &self.script
    }

    pub fn kind(&self) -> &PatchKind {
        &self.kind
    }

    pub fn is_applied(&self) -> bool {
        self.applied.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> PatchInfo {
        PatchInfo {
            name: self.name.to_string(),
            script: self.script.name().to_string(),
            kind: self.kind.as_str(),
            module: self.kind.module().to_string(),
            applied: self.is_applied(),
        }
    }

    /// Installs the patch in target memory.
    pub async fn apply(&self) -> Result<(), SessionError> {
        let _op = self.op.lock().await;
        if self.is_applied() {
            return Err(self.state_error());
        }
        self.flip(RemoteCall::Apply, true).await?;
        self.publish(EventKind::PatchApplied);
        Ok(())
    }

    /// Reverts target memory at the patch point.
    pub async fn clear(&self) -> Result<(), SessionError> {
        let _op = self.op.lock().await;
        if !self.is_applied() {
            return Err(self.state_error());
        }
        self.flip(RemoteCall::Clear, false).await?;
        self.publish(EventKind::PatchCleared);
        Ok(())
    }

    /// Applies the patch and returns a guard that clears it.
    pub async fn apply_scoped(self: &Arc<Self>) -> Result<PatchGuard, SessionError> {
        self.apply().await?;
        Ok(PatchGuard {
            patch: Some(Arc::clone(self)),
        })
    }

    async fn flip(&self, call: RemoteCall, to: bool) -> Result<(), SessionError> {
        let export = call.export_name();
        let handle = Arc::clone(self.script.handle());
        let applied = Arc::clone(&self.applied);
        let reply = self
            .script
            .offload()
            .run(move || -> Result<RemoteValue, BackendError> {
                let reply = handle.call(&call)?;
                if reply == RemoteValue::Bool(true) {
                    applied.store(to, Ordering::SeqCst);
                }
                Ok(reply)
            })
            .await?
            .map_err(SessionError::from_backend)?;

        match reply.as_bool() {
            Some(true) => Ok(()),
            Some(false) => Err(SessionError::PatchRejected {
                patch: self.name.to_string(),
                op: export,
            }),
            None => Err(SessionError::UnexpectedReply {
                call: export,
                got: format!("{reply:?}"),
            }),
        }
    }

    fn state_error(&self) -> SessionError {
        SessionError::InvalidPatchState {
            patch: self.name.to_string(),
            applied: self.is_applied(),
        }
    }

    fn publish(&self, kind: EventKind) {
        self.bus.publish(
            Event::new(kind)
                .with_target(Arc::clone(&self.target))
                .with_script(Arc::clone(&self.name)),
        );
    }
}

/// Scope of one applied patch.
///
/// Prefer [`PatchGuard::release`]; the drop path can't report errors except as
/// `OperationFailed` events, and needs a tokio runtime to run on.
#[must_use = "dropping the guard clears the patch"]
#[derive(Debug)]
pub struct PatchGuard {
    patch: Option<Arc<Patch>>,
}

impl PatchGuard {
    /// The guarded patch.
    pub fn patch(&self) -> Option<&Arc<Patch>> {
        self.patch.as_ref()
    }

    /// Clears the patch if it is still applied.
    pub async fn release(mut self) -> Result<(), SessionError> {
        match self.patch.take() {
            Some(p) if p.is_applied() => match p.clear().await {
                Err(SessionError::InvalidPatchState { applied: false, .. }) => Ok(()),
                other => other,
            },
            _ => Ok(()),
        }
    }
}

impl Drop for PatchGuard {
    fn drop(&mut self) {
        let Some(patch) = self.patch.take() else {
            return;
        };
        if !patch.is_applied() || patch.session_gone.is_cancelled() {
            return;
        }
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            return;
        };
        rt.spawn(async move {
            match patch.clear().await {
                Ok(()) | Err(SessionError::InvalidPatchState { applied: false, .. }) => {}
                Err(e) => patch.bus.publish(
                    Event::new(EventKind::OperationFailed)
                        .with_target(Arc::clone(&patch.target))
                        .with_script(Arc::clone(&patch.name))
                        .with_reason(e.to_string()),
                ),
            }
        });
    }
}
