//! # Supervisor: the supervision scope for watchers and embedder tasks.
//!
//! The [`Supervisor`] owns the event bus, the [`SubscriberSet`], the session
//! [`Registry`] and a runtime [`CancellationToken`]. It runs tasks (usually
//! [`TargetWatcher`]s plus whatever loops the embedding application adds) under
//! one shutdown.
//!
//! ## Architecture
//! ```text
//! run(Vec<TaskRef>)
//!   ├─► per task: child token = runtime_token.child_token()
//!   │             JoinSet.spawn(run_task(task, child))
//!   │
//!   ├─► select:
//!   │     ├─ every task returned                 → Ok
//!   │     └─ OS signal or Supervisor::shutdown()
//!   │           └─► ShutdownRequested
//!   │               runtime_token.cancel()       → watchers clear their patches
//!   │               wait_all_with_grace(cfg.grace):
//!   │                 ├─ all joined  → AllStoppedWithin
//!   │                 └─ timeout     → GraceExceeded, RuntimeError::GraceExceeded { stuck }
//!   │
//!   └─► registry.detach_all()
//!
//! Event flow:
//!   Registry / Session / Watcher ── publish ──► Bus ──► subscriber_listener ──► SubscriberSet
//! ```
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use patchvisor::{
//!     Attacher, Config, DefaultPatches, JmpPatchSpec, LogWriter, PatchCompiler, Subscribe,
//!     Supervisor, TaskRef,
//! };
//!
//! async fn serve(attacher: Arc<dyn Attacher>, compiler: Arc<dyn PatchCompiler>) -> anyhow::Result<()> {
//!     let subs: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter::new())];
//!     let sup = Supervisor::builder(Config::default(), attacher, compiler)
//!         .with_subscribers(subs)
//!         .build();
//!
//!     let setup = DefaultPatches::new().with_jmp(
//!         JmpPatchSpec::new("anti_fog", "rwr_game.exe", "D9 44 24 08 D9 59 4C D9 44 24 04 D9 59 50")
//!             .with_patch_size(32)
//!             .with_return_offset(14),
//!     );
//!     let watcher: TaskRef = sup.watcher("rwr_game.exe", Arc::new(setup));
//!     sup.run(vec![watcher]).await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backend::Attacher;
use crate::core::builder::SupervisorBuilder;
use crate::core::config::Config;
use crate::core::registry::Registry;
use crate::core::runner::{AliveSet, run_task};
use crate::core::shutdown;
use crate::core::watcher::{SessionSetup, TargetWatcher};
use crate::error::RuntimeError;
use crate::events::{Bus, Event, EventKind};
use crate::patches::PatchCompiler;
use crate::subscribers::SubscriberSet;
use crate::tasks::TaskRef;

/// Coordinates tasks, event delivery and graceful shutdown.
pub struct Supervisor {
    cfg: Config,
    bus: Bus,
    subs: Arc<SubscriberSet>,
    registry: Arc<Registry>,
    runtime_token: CancellationToken,
    listener_token: CancellationToken,
    alive: Arc<AliveSet>,
}

impl Supervisor {
    /// Starts building a supervisor around a backend and a patch compiler.
    pub fn builder(
        cfg: Config,
        attacher: Arc<dyn Attacher>,
        compiler: Arc<dyn PatchCompiler>,
    ) -> SupervisorBuilder {
        SupervisorBuilder::new(cfg, attacher, compiler)
    }

    pub(crate) fn new_internal(
        cfg: Config,
        bus: Bus,
        subs: Arc<SubscriberSet>,
        registry: Arc<Registry>,
    ) -> Self {
        let listener_token = CancellationToken::new();
        registry.spawn_listener(listener_token.clone());
        let sup = Self {
            cfg,
            bus,
            subs,
            registry,
            runtime_token: CancellationToken::new(),
            listener_token,
            alive: Arc::new(AliveSet::default()),
        };
        sup.subscriber_listener();
        sup
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Builds a watcher for `target` using this supervisor's registry and retry policy.
    pub fn watcher(
        &self,
        target: impl Into<String>,
        setup: Arc<dyn SessionSetup>,
    ) -> Arc<TargetWatcher> {
        Arc::new(
            TargetWatcher::new(target, Arc::clone(&self.registry), setup)
                .with_retry(self.cfg.retry),
        )
    }

    /// Requests shutdown, same as an OS termination signal.
    pub fn shutdown(&self) {
        self.runtime_token.cancel();
    }

    /// Runs `tasks` until they all return, or until shutdown is requested
    /// (may end with `GraceExceeded`). Live sessions are detached afterwards.
    pub async fn run(&self, tasks: Vec<TaskRef>) -> Result<(), RuntimeError> {
        let mut set = JoinSet::new();
        for task in tasks {
            set.spawn(run_task(
                task,
                self.runtime_token.child_token(),
                self.bus.clone(),
                Arc::clone(&self.alive),
            ));
        }

        let res = self.drive_shutdown(&mut set).await;
        set.abort_all();
        self.registry.detach_all().await;
        res
    }

    /// Subscribes to the bus and forwards events to the subscriber set.
    fn subscriber_listener(&self) {
        let mut rx = self.bus.subscribe();
        let set = Arc::clone(&self.subs);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => set.emit(&ev),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    async fn drive_shutdown(&self, set: &mut JoinSet<()>) -> Result<(), RuntimeError> {
        tokio::select! {
            _ = self.shutdown_requested() => {
                self.bus.publish(Event::new(EventKind::ShutdownRequested));
                self.runtime_token.cancel();
                self.wait_all_with_grace(set).await
            }
            _ = async { while set.join_next().await.is_some() {} } => Ok(()),
        }
    }

    /// Resolves on an OS signal or [`Supervisor::shutdown`].
    async fn shutdown_requested(&self) {
        let signal = async {
            if let Err(e) = shutdown::wait_for_shutdown_signal().await {
                self.bus.publish(
                    Event::new(EventKind::OperationFailed)
                        .with_reason(format!("signal listener failed: {e}")),
                );
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            _ = signal => {}
            _ = self.runtime_token.cancelled() => {}
        }
    }

    /// Waits for all tasks to finish within the configured grace period.
    async fn wait_all_with_grace(&self, set: &mut JoinSet<()>) -> Result<(), RuntimeError> {
        let grace = self.cfg.grace;
        let done = async { while set.join_next().await.is_some() {} };

        match tokio::time::timeout(grace, done).await {
            Ok(()) => {
                self.bus.publish(Event::new(EventKind::AllStoppedWithin));
                Ok(())
            }
            Err(_) => {
                self.bus.publish(Event::new(EventKind::GraceExceeded));
                let stuck = self.alive.snapshot();
                Err(RuntimeError::GraceExceeded { grace, stuck })
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.listener_token.cancel();
    }
}
