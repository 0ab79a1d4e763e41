//! # Session: one live attachment and everything injected through it.
//!
//! A [`Session`] is created by [`Registry::attach`](crate::Registry::attach) and
//! owns:
//! - the backend attachment,
//! - a map of [`Script`]s and a map of [`Patch`]es (names unique per map),
//! - the utility script client and the [`SessionFacts`] it reported during init.
//!
//! ## Init sequence
//! ```text
//! read utility source ──► create_script ──► bind to bus ──► load ──► query 7 facts
//!   (ResourceMissing)                                                 └─► SessionInitialized
//! ```
//!
//! ## Patch creation
//! ```text
//! name free? ──► compiler.gen_*_patch ──► create_script ──► bind ──► load ──► file under name
//!  (NameInUse)       (CompileFailure)                                 └─ err: discard script
//! ```
//!
//! The session never removes itself from the registry: detach notices do.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::backend::{Attachment, SessionId};
use crate::core::offload::Offload;
use crate::core::patch::{Patch, PatchInfo};
use crate::core::script::{Script, ScriptInfo};
use crate::core::utility::{SessionFacts, UtilityClient};
use crate::error::SessionError;
use crate::events::{Bus, Event, EventKind};
use crate::patches::{CompiledPatch, JmpPatchSpec, NopPatchSpec, PatchCompiler, PatchKind};

/// Shared collaborators every session of one registry uses.
#[derive(Clone)]
pub(crate) struct SessionEnv {
    pub compiler: Arc<dyn PatchCompiler>,
    pub offload: Offload,
    pub bus: Bus,
    pub utility_script: PathBuf,
    pub utility_name: String,
}

/// Read-only snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub target: String,
    pub pid: u32,
    pub id: SessionId,
    pub facts: Option<SessionFacts>,
    pub scripts: Vec<ScriptInfo>,
    pub patches: Vec<PatchInfo>,
}

/// One live attachment to a target process.
pub struct Session {
    target: Arc<str>,
    id: SessionId,
    pid: u32,
    attachment: Arc<dyn Attachment>,
    env: SessionEnv,
    init_started: AtomicBool,
    utility: OnceLock<UtilityClient>,
    facts: OnceLock<SessionFacts>,
    scripts: RwLock<HashMap<String, Arc<Script>>>,
    patches: RwLock<HashMap<String, Arc<Patch>>>,
    detached: CancellationToken,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("target", &self.target)
            .field("pid", &self.pid)
            .field("id", &self.id)
            .field("initialized", &self.is_initialized())
            .field("detached", &self.detached.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        target: Arc<str>,
        id: SessionId,
        pid: u32,
        attachment: Arc<dyn Attachment>,
        env: SessionEnv,
    ) -> Self {
        Self {
            target,
            id,
            pid,
            attachment,
            env,
            init_started: AtomicBool::new(false),
            utility: OnceLock::new(),
            facts: OnceLock::new(),
            scripts: RwLock::new(HashMap::new()),
            patches: RwLock::new(HashMap::new()),
            detached: CancellationToken::new(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Facts reported by the utility script; `None` until init completed.
    pub fn facts(&self) -> Option<&SessionFacts> {
        self.facts.get()
    }

    pub fn is_initialized(&self) -> bool {
        self.facts.get().is_some()
    }

    /// Loads the utility script and queries the static facts. Runs once.
    pub async fn init(&self) -> Result<(), SessionError> {
        if self.init_started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyInitialized {
                target: self.target.to_string(),
            });
        }

        let path = &self.env.utility_script;
        let source = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SessionError::ResourceMissing { path: path.clone() }
            } else {
                SessionError::ScriptCreationFailure {
                    script: self.env.utility_name.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let script = self.create_script(&self.env.utility_name, &source).await?;
        script.bind_to_bus(&self.env.bus);
        script.load().await?;

        let client = UtilityClient::new(script);
        let facts = SessionFacts::fetch(&client).await?;
        let summary = facts.to_string();

        let _ = self.utility.set(client);
        let _ = self.facts.set(facts);
        self.env.bus.publish(
            Event::new(EventKind::SessionInitialized)
                .with_target(Arc::clone(&self.target))
                .with_pid(self.pid)
                .with_reason(summary),
        );
        Ok(())
    }

    /// Creates (but does not load) a script and files it under `name`.
    pub async fn create_script(
        &self,
        name: &str,
        source: &str,
    ) -> Result<Arc<Script>, SessionError> {
        if self.scripts.read().contains_key(name) {
            return Err(self.name_in_use(name));
        }

        let attachment = Arc::clone(&self.attachment);
        let (n, src) = (name.to_string(), source.to_string());
        let created = self
            .env
            .offload
            .run(move || attachment.create_script(&n, &src))
            .await
            .and_then(|r| {
                r.map_err(|e| SessionError::ScriptCreationFailure {
                    script: name.to_string(),
                    reason: e.to_string(),
                })
            });
        let handle = match created {
            Ok(h) => h,
            Err(e) => return Err(self.failed(Some(name), e)),
        };

        let script = Arc::new(Script::new(
            name,
            source,
            Arc::clone(&self.target),
            handle,
            self.env.offload.clone(),
            self.env.bus.clone(),
        ));
        {
            let mut scripts = self.scripts.write();
            if scripts.contains_key(name) {
                return Err(self.name_in_use(name));
            }
            scripts.insert(name.to_string(), Arc::clone(&script));
        }
        self.env.bus.publish(
            Event::new(EventKind::ScriptCreated)
                .with_target(Arc::clone(&self.target))
                .with_script(name),
        );
        Ok(script)
    }

    /// Compiles, creates and loads a jump patch. Applying it is up to the caller.
    pub async fn create_jmp_patch(&self, spec: &JmpPatchSpec) -> Result<Arc<Patch>, SessionError> {
        self.ensure_patch_name_free(&spec.name)?;
        let compiled = self
            .env
            .compiler
            .gen_jmp_patch(spec)
            .map_err(|e| self.compile_failed(&spec.name, e.0))?;
        self.install_patch(&spec.name, PatchKind::from(spec), compiled)
            .await
    }

    /// Compiles, creates and loads a nop patch. Applying it is up to the caller.
    pub async fn create_nop_patch(&self, spec: &NopPatchSpec) -> Result<Arc<Patch>, SessionError> {
        self.ensure_patch_name_free(&spec.name)?;
        let compiled = self
            .env
            .compiler
            .gen_nop_patch(spec)
            .map_err(|e| self.compile_failed(&spec.name, e.0))?;
        self.install_patch(&spec.name, PatchKind::from(spec), compiled)
            .await
    }

    async fn install_patch(
        &self,
        name: &str,
        kind: PatchKind,
        compiled: CompiledPatch,
    ) -> Result<Arc<Patch>, SessionError> {
        let script = self
            .create_script(&compiled.script_name, &compiled.source)
            .await?;
        script.bind_to_bus(&self.env.bus);

        if let Err(e) = script.load().await {
            self.drop_script(&script).await;
            return Err(self.failed(Some(name), e));
        }

        let kind_label = kind.as_str();
        let patch = Arc::new(Patch::new(
            name,
            Arc::clone(&self.target),
            Arc::clone(&script),
            kind,
            self.detached.clone(),
            self.env.bus.clone(),
        ));
        {
            let mut patches = self.patches.write();
            if !patches.contains_key(name) {
                patches.insert(name.to_string(), Arc::clone(&patch));
                drop(patches);
                self.env.bus.publish(
                    Event::new(EventKind::PatchCreated)
                        .with_target(Arc::clone(&self.target))
                        .with_script(name)
                        .with_reason(kind_label),
                );
                return Ok(patch);
            }
        }
        self.drop_script(&script).await;
        Err(self.name_in_use(name))
    }

    /// Clears every applied patch; unapplied ones are skipped.
    ///
    /// Keeps going after a failure and returns the first error. On success
    /// returns how many patches were cleared.
    pub async fn clear_all_patches(&self) -> Result<usize, SessionError> {
        let mut patches: Vec<Arc<Patch>> = self.patches.read().values().cloned().collect();
        patches.sort_unstable_by(|a, b| a.name().cmp(b.name()));

        let mut cleared = 0;
        let mut first_err = None;
        for patch in patches.iter().filter(|p| p.is_applied()) {
            match patch.clear().await {
                Ok(()) => cleared += 1,
                Err(e) => {
                    let e = self.failed(Some(patch.name()), e);
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(cleared),
        }
    }

    /// Engine heap size in bytes; `0` when the target can't be asked anymore.
    pub async fn heap_size(&self) -> Result<u64, SessionError> {
        let res = match self.utility() {
            Ok(u) => u.heap_size().await,
            Err(e) => Err(e),
        };
        self.degraded(res, 0)
    }

    /// Whether a debugger is attached; `false` when the target can't be asked anymore.
    pub async fn debugger_attached(&self) -> Result<bool, SessionError> {
        let res = match self.utility() {
            Ok(u) => u.is_debugger_attached().await,
            Err(e) => Err(e),
        };
        self.degraded(res, false)
    }

    /// Id of the target thread that served the call.
    pub async fn current_thread_id(&self) -> Result<u64, SessionError> {
        self.utility()?.current_thread_id().await
    }

    /// Typed client of the utility script, once init loaded it.
    pub fn utility(&self) -> Result<&UtilityClient, SessionError> {
        self.utility.get().ok_or_else(|| SessionError::InvalidOperation {
            reason: format!("session for '{}' is not initialised", self.target),
        })
    }

    /// Detaches from the target. The registry drops the session when the
    /// detach notice arrives.
    pub async fn detach(&self) -> Result<(), SessionError> {
        let attachment = Arc::clone(&self.attachment);
        self.env
            .offload
            .run(move || attachment.detach())
            .await?
            .map_err(SessionError::from_backend)
    }

    /// Resolves once the attachment is gone.
    pub async fn detached(&self) {
        self.detached.cancelled().await
    }

    pub fn is_detached(&self) -> bool {
        self.detached.is_cancelled()
    }

    pub(crate) fn mark_detached(&self) {
        self.detached.cancel();
    }

    pub fn script(&self, name: &str) -> Option<Arc<Script>> {
        self.scripts.read().get(name).cloned()
    }

    pub fn patch(&self, name: &str) -> Option<Arc<Patch>> {
        self.patches.read().get(name).cloned()
    }

    pub fn script_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scripts.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn patch_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.patches.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn info(&self) -> SessionInfo {
        let mut scripts: Vec<ScriptInfo> = self.scripts.read().values().map(|s| s.info()).collect();
        scripts.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        let mut patches: Vec<PatchInfo> = self.patches.read().values().map(|p| p.info()).collect();
        patches.sort_unstable_by(|a, b| a.name.cmp(&b.name));

        SessionInfo {
            target: self.target.to_string(),
            pid: self.pid,
            id: self.id,
            facts: self.facts.get().cloned(),
            scripts,
            patches,
        }
    }

    async fn drop_script(&self, script: &Arc<Script>) {
        script.discard().await;
        self.scripts.write().remove(script.name());
    }

    fn ensure_patch_name_free(&self, name: &str) -> Result<(), SessionError> {
        if self.patches.read().contains_key(name) {
            return Err(self.name_in_use(name));
        }
        Ok(())
    }

    fn name_in_use(&self, name: &str) -> SessionError {
        SessionError::NameInUse {
            target: self.target.to_string(),
            name: name.to_string(),
        }
    }

    fn compile_failed(&self, patch: &str, reason: String) -> SessionError {
        let err = SessionError::CompileFailure {
            patch: patch.to_string(),
            reason,
        };
        self.failed(Some(patch), err)
    }

    /// Publishes `OperationFailed` and hands the error back.
    fn failed(&self, script: Option<&str>, err: SessionError) -> SessionError {
        let mut ev = Event::new(EventKind::OperationFailed)
            .with_target(Arc::clone(&self.target))
            .with_reason(err.to_string());
        if let Some(s) = script {
            ev = ev.with_script(s);
        }
        self.env.bus.publish(ev);
        err
    }

    fn degraded<T>(&self, res: Result<T, SessionError>, fallback: T) -> Result<T, SessionError> {
        match res {
            Err(SessionError::InvalidOperation { reason }) => {
                self.env.bus.publish(
                    Event::new(EventKind::TelemetryDegraded)
                        .with_target(Arc::clone(&self.target))
                        .with_script(self.env.utility_name.as_str())
                        .with_reason(reason),
                );
                Ok(fallback)
            }
            other => other,
        }
    }
}
