//! # patchvisor
//!
//! **Patchvisor** attaches to running processes by name, injects scripts into
//! them and applies in-memory code patches (jump hooks and NOP fills) that are
//! cleared again on shutdown or when the process goes away.
//!
//! The crate does not talk to a process itself. An instrumentation backend is
//! plugged in through the [`Attacher`] / [`Attachment`] / [`ScriptHandle`]
//! traits, and patch sources come from a [`PatchCompiler`]. Everything else
//! (sessions, scripts, patches, retries, cleanup, events) lives here.
//!
//! ## Architecture
//! ```text
//!     ┌────────────────┐   ┌────────────────┐   ┌────────────────┐
//!     │ TargetWatcher  │   │ TargetWatcher  │   │  embedder task │
//!     │ ("game.exe")   │   │ ("tool.exe")   │   │   (TaskFn)     │
//!     └───────┬────────┘   └───────┬────────┘   └───────┬────────┘
//!             ▼                    ▼                    ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Supervisor                                                       │
//! │  - Bus (broadcast events)                                         │
//! │  - SubscriberSet (fans out to user subscribers)                   │
//! │  - Registry (one Session per target, detach listener)             │
//! │  - Offload (bounded gate in front of blocking backend calls)      │
//! └──────┬────────────────────────────────────────────────────────────┘
//!        ▼
//!   Registry ──► Session ──┬─► utility Script ──► UtilityClient / SessionFacts
//!                          ├─► Scripts  (create_script)
//!                          └─► Patches  (create_jmp_patch / create_nop_patch)
//!                                 └─► apply / clear / apply_scoped → PatchGuard
//! ```
//!
//! ### Watcher lifecycle
//! ```text
//! Searching ──attach ok──► setup (DefaultPatches) ──► Managed
//!    ▲   │                                               │
//!    │   └─ process not found → BackoffScheduled, sleep  │
//!    └────────────────── session detached ◄──────────────┘
//!
//! cancel (any state) ──► Cancelled: clear applied patches, return
//! ```
//!
//! ## Features
//! | Area              | Description                                                   | Key types / traits                          |
//! |-------------------|---------------------------------------------------------------|---------------------------------------------|
//! | **Backend**       | Pluggable attach/script transport.                            | [`Attacher`], [`Attachment`], [`ScriptHandle`] |
//! | **Sessions**      | Per-process scripts, patches and facts.                       | [`Registry`], [`Session`], [`Script`]       |
//! | **Patches**       | Jump hooks and NOP fills with scoped application.             | [`Patch`], [`PatchGuard`], [`JmpPatchSpec`] |
//! | **Supervision**   | Watch targets, retry attaches, clear on shutdown.             | [`Supervisor`], [`TargetWatcher`]           |
//! | **Subscriber API**| Hook into runtime events (logging, custom subscribers).       | [`Subscribe`], [`Event`]                    |
//! | **Errors**        | Typed errors for sessions, tasks and the runtime.             | [`SessionError`], [`TaskError`], [`RuntimeError`] |
//! | **Configuration** | Centralize runtime settings.                                  | [`Config`], [`BackoffPolicy`]               |
//!
//! ## Optional features
//! - `logging`: exports [`LogWriter`], a subscriber that renders events
//!   through `tracing` (enabled by default).
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use patchvisor::{Config, TaskFn, TaskRef};
//!
//! # use std::sync::Arc;
//! # use patchvisor::{Attacher, PatchCompiler};
//! # async fn demo(attacher: Arc<dyn Attacher>, compiler: Arc<dyn PatchCompiler>) -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = Config {
//!     grace: Duration::from_secs(10),
//!     ..Config::default()
//! };
//! let sup = patchvisor::Supervisor::builder(cfg, attacher, compiler).build();
//!
//! let hello: TaskRef = TaskFn::arc("hello", |ctx: CancellationToken| async move {
//!     if ctx.is_cancelled() {
//!         return Ok(());
//!     }
//!     println!("Hello from task!");
//!     Ok(())
//! });
//!
//! sup.run(vec![hello]).await?;
//! # Ok(())
//! # }
//! ```
mod backend;
mod core;
mod error;
mod events;
mod patches;
mod policies;
mod subscribers;
mod tasks;

// ---- Public re-exports ----

pub use backend::{
    Attacher, Attachment, BackendError, DetachObserver, DetachReason, LogHandler, LogLevel,
    MessageHandler, RemoteCall, RemoteValue, ScriptHandle, ScriptSignal, SessionId,
};
pub use core::{
    Config, DefaultPatches, ModuleInfo, Offload, Patch, PatchGuard, PatchInfo, Registry,
    ScanMatch, Script, ScriptInfo, Session, SessionFacts, SessionInfo, SessionSetup, Supervisor,
    SupervisorBuilder, TargetWatcher, ThreadInfo, UtilityClient, WatchState,
};
pub use error::{RuntimeError, SessionError, TaskError};
pub use events::{Bus, Event, EventKind};
pub use patches::{
    CompileError, CompiledPatch, JmpPatchSpec, NopPatchSpec, PatchCompiler, PatchKind,
    PatchVarSpec,
};
pub use policies::{BackoffPolicy, DEFAULT_RETRY_INTERVAL, JitterPolicy};
pub use subscribers::{Subscribe, SubscriberSet};
pub use tasks::{Task, TaskFn, TaskRef};

// Optional: expose the tracing-backed subscriber.
// Enable with: `--features logging`
#[cfg(feature = "logging")]
pub use subscribers::LogWriter;
