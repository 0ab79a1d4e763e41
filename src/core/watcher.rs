//! # TargetWatcher: keeps one target attached and patched.
//!
//! ## State machine
//! ```text
//!            ┌──────────── AttachFailure: sleep(retry) ───────────┐
//!            ▼                                                     │
//!   ┌──► SEARCHING ── registry.attach(target) ─────────────────────┘
//!   │        │ ok
//!   │        ▼
//!   │   setup.setup(session) ── Vec<PatchGuard>
//!   │        ▼
//!   └── MANAGED ── waits on session.detached() or the token
//!          detach
//!
//! token cancelled (any state) ──► CANCELLED:
//!     session registered? ── yes ─► clear_all_patches() ─► Err(Canceled)
//!                         └─ no ──────────────────────────► Err(Canceled)
//! ```
//!
//! ## Rules
//! - Only `AttachFailure` is retried; any other attach error ends the task as `Fatal`.
//! - Setup runs to completion even if cancellation arrives meanwhile, so every
//!   patch it applied is known to the session before the cleanup sweep.
//! - A setup error on a session that detached meanwhile goes back to SEARCHING.
//! - The cleanup sweep runs even when the setup holds guards: guards only cover
//!   patches applied through them.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::patch::PatchGuard;
use crate::core::registry::Registry;
use crate::core::session::Session;
use crate::error::{SessionError, TaskError};
use crate::events::{Event, EventKind};
use crate::patches::{JmpPatchSpec, NopPatchSpec};
use crate::policies::BackoffPolicy;
use crate::tasks::Task;

/// Watcher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// No session for the target; attach attempts are running.
    Searching,
    /// Session exists and the setup routine ran.
    Managed,
    /// Terminal.
    Cancelled,
}

impl WatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchState::Searching => "searching",
            WatchState::Managed => "managed",
            WatchState::Cancelled => "cancelled",
        }
    }
}

/// Target-specific work done once per fresh session.
///
/// Return guards for the patches applied; the watcher holds them while the
/// session is managed.
#[async_trait]
pub trait SessionSetup: Send + Sync + 'static {
    async fn setup(&self, session: &Arc<Session>) -> Result<Vec<PatchGuard>, SessionError>;
}

/// Setup that creates and applies a fixed set of patches, in order.
///
/// # Example
/// ```rust
/// use patchvisor::{DefaultPatches, JmpPatchSpec, PatchVarSpec};
///
/// let setup = DefaultPatches::new().with_jmp(
///     JmpPatchSpec::new("anti_fog", "rwr_game.exe", "D9 44 24 08 D9 59 4C D9 44 24 04 D9 59 50")
///         .with_var(PatchVarSpec::new("range", "float", 4, "600.0"))
///         .with_var(PatchVarSpec::new("offset", "float", 4, "-100.0"))
///         .with_patch_size(32)
///         .with_return_offset(14),
/// );
/// assert_eq!(setup.len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct DefaultPatches {
    jmp: Vec<JmpPatchSpec>,
    nop: Vec<NopPatchSpec>,
}

impl DefaultPatches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_jmp(mut self, spec: JmpPatchSpec) -> Self {
        self.jmp.push(spec);
        self
    }

    pub fn with_nop(mut self, spec: NopPatchSpec) -> Self {
        self.nop.push(spec);
        self
    }

    pub fn len(&self) -> usize {
        self.jmp.len() + self.nop.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionSetup for DefaultPatches {
    async fn setup(&self, session: &Arc<Session>) -> Result<Vec<PatchGuard>, SessionError> {
        let mut guards = Vec::with_capacity(self.len());
        for spec in &self.jmp {
            let patch = session.create_jmp_patch(spec).await?;
            guards.push(patch.apply_scoped().await?);
        }
        for spec in &self.nop {
            let patch = session.create_nop_patch(spec).await?;
            guards.push(patch.apply_scoped().await?);
        }
        Ok(guards)
    }
}

/// Supervised loop for one target.
pub struct TargetWatcher {
    name: String,
    target: String,
    registry: Arc<Registry>,
    setup: Arc<dyn SessionSetup>,
    retry: BackoffPolicy,
    state: Mutex<WatchState>,
}

impl TargetWatcher {
    /// Creates a watcher named `watch:<target>` with the default retry policy.
    pub fn new(
        target: impl Into<String>,
        registry: Arc<Registry>,
        setup: Arc<dyn SessionSetup>,
    ) -> Self {
        let target = target.into();
        Self {
            name: format!("watch:{target}"),
            target,
            registry,
            setup,
            retry: BackoffPolicy::default(),
            state: Mutex::new(WatchState::Searching),
        }
    }

    pub fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> WatchState {
        *self.state.lock()
    }

    fn set_state(&self, next: WatchState) {
        {
            let mut state = self.state.lock();
            if *state == next {
                return;
            }
            *state = next;
        }
        self.registry.bus().publish(
            Event::new(EventKind::WatchStateChanged)
                .with_target(self.target.as_str())
                .with_task(self.name.as_str())
                .with_state(next),
        );
    }

    async fn cancelled(&self) -> Result<(), TaskError> {
        self.set_state(WatchState::Cancelled);
        if let Some(session) = self.registry.get(&self.target) {
            self.registry.bus().publish(
                Event::new(EventKind::CleanupStarted)
                    .with_target(self.target.as_str())
                    .with_task(self.name.as_str()),
            );
            // failures are already published by the session
            let _ = session.clear_all_patches().await;
        }
        Err(TaskError::Canceled)
    }
}

#[async_trait]
impl Task for TargetWatcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: CancellationToken) -> Result<(), TaskError> {
        let mut failures: u32 = 0;
        loop {
            self.set_state(WatchState::Searching);
            let attached = tokio::select! {
                biased;
                _ = ctx.cancelled() => return self.cancelled().await,
                res = self.registry.attach(&self.target) => res,
            };

            let session = match attached {
                Ok(session) => {
                    failures = 0;
                    session
                }
                Err(e) if e.is_retryable() => {
                    let delay = self.retry.next(failures);
                    failures = failures.saturating_add(1);
                    self.registry.bus().publish(
                        Event::new(EventKind::BackoffScheduled)
                            .with_target(self.target.as_str())
                            .with_task(self.name.as_str())
                            .with_attempt(failures)
                            .with_delay(delay)
                            .with_reason(e.to_string()),
                    );
                    tokio::select! {
                        biased;
                        _ = ctx.cancelled() => return self.cancelled().await,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
                Err(e) => return Err(e.into()),
            };

            let guards = match self.setup.setup(&session).await {
                Ok(guards) => guards,
                Err(_) if session.is_detached() => continue,
                Err(e) => {
                    if ctx.is_cancelled() {
                        return self.cancelled().await;
                    }
                    let _ = session.clear_all_patches().await;
                    return Err(e.into());
                }
            };
            if ctx.is_cancelled() {
                let res = self.cancelled().await;
                drop(guards);
                return res;
            }

            self.set_state(WatchState::Managed);
            tokio::select! {
                _ = ctx.cancelled() => {
                    let res = self.cancelled().await;
                    drop(guards);
                    return res;
                }
                _ = session.detached() => drop(guards),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{FakeAttacher, FakeCompiler, utility_script};
    use crate::backend::{BackendError, RemoteCall};
    use crate::core::config::Config;
    use crate::events::Bus;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn anti_fog() -> JmpPatchSpec {
        JmpPatchSpec::new(
            "anti_fog",
            "rwr_game.exe",
            "D9 44 24 08 D9 59 4C D9 44 24 04 D9 59 50",
        )
        .with_patch_size(32)
        .with_return_offset(14)
    }

    struct Fixture {
        registry: Arc<Registry>,
        attacher: Arc<FakeAttacher>,
        listener: CancellationToken,
        _utility: NamedTempFile,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.listener.cancel();
        }
    }

    fn fixture() -> Fixture {
        let utility = utility_script();
        let cfg = Config {
            utility_script: utility.path().to_path_buf(),
            ..Config::default()
        };
        let attacher = FakeAttacher::new();
        let registry = Registry::new(attacher.clone(), FakeCompiler::new(), Bus::new(1024), &cfg);
        let listener = CancellationToken::new();
        registry.spawn_listener(listener.clone());
        Fixture {
            registry,
            attacher,
            listener,
            _utility: utility,
        }
    }

    fn watcher(f: &Fixture, retry: Duration) -> Arc<TargetWatcher> {
        Arc::new(
            TargetWatcher::new(
                "rwr_game.exe",
                Arc::clone(&f.registry),
                Arc::new(DefaultPatches::new().with_jmp(anti_fog())),
            )
            .with_retry(BackoffPolicy::fixed(retry)),
        )
    }

    async fn wait_for(w: &TargetWatcher, state: WatchState) {
        for _ in 0..400 {
            if w.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("watcher never reached {state:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_clears_applied_patch_before_returning() {
        let f = fixture();
        f.attacher.spawn_process("rwr_game.exe", 4242);
        let w = watcher(&f, Duration::from_millis(10));
        let token = CancellationToken::new();
        let run = tokio::spawn({
            let w = Arc::clone(&w);
            let token = token.clone();
            async move { w.run(token).await }
        });

        wait_for(&w, WatchState::Managed).await;
        let session = f.registry.get("rwr_game.exe").expect("session");
        let patch = session.patch("anti_fog").expect("default patch");
        assert!(patch.is_applied());

        token.cancel();
        let res = run.await.expect("join");
        assert!(matches!(res, Err(TaskError::Canceled)));
        assert!(!patch.is_applied());

        let script = f
            .attacher
            .last_attachment()
            .and_then(|a| a.script(patch.script().name()))
            .expect("patch script");
        assert_eq!(script.count(RemoteCall::Apply), 1);
        assert_eq!(script.count(RemoteCall::Clear), 1);
        assert_eq!(w.state(), WatchState::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_without_session_makes_no_calls() {
        let f = fixture();
        let w = watcher(&f, Duration::from_secs(15));
        let token = CancellationToken::new();
        let run = tokio::spawn({
            let w = Arc::clone(&w);
            let token = token.clone();
            async move { w.run(token).await }
        });

        for _ in 0..200 {
            if f.attacher.attempts() >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        token.cancel();
        let res = run.await.expect("join");
        assert!(matches!(res, Err(TaskError::Canceled)));
        assert!(f.attacher.attachments().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_during_init_leaves_target_attachable() {
        let f = fixture();
        f.attacher.spawn_process("rwr_game.exe", 4242);
        f.attacher.slow_loads(Duration::from_millis(200));
        let w = watcher(&f, Duration::from_millis(10));
        let token = CancellationToken::new();
        let run = tokio::spawn({
            let w = Arc::clone(&w);
            let token = token.clone();
            async move { w.run(token).await }
        });

        for _ in 0..200 {
            if f.attacher
                .last_attachment()
                .is_some_and(|a| !a.scripts().is_empty())
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        token.cancel();
        let res = run.await.expect("join");
        assert!(matches!(res, Err(TaskError::Canceled)));

        let first = f.attacher.last_attachment().expect("attachment");
        for _ in 0..200 {
            if first.is_detached() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(first.is_detached());

        let next = watcher(&f, Duration::from_millis(10));
        let token = CancellationToken::new();
        let run = tokio::spawn({
            let w = Arc::clone(&next);
            let token = token.clone();
            async move { w.run(token).await }
        });
        wait_for(&next, WatchState::Managed).await;
        assert_eq!(f.registry.list(), vec!["rwr_game.exe".to_string()]);

        token.cancel();
        let _ = run.await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn retries_until_process_appears() {
        let f = fixture();
        let w = watcher(&f, Duration::from_millis(20));
        let token = CancellationToken::new();
        let run = tokio::spawn({
            let w = Arc::clone(&w);
            let token = token.clone();
            async move { w.run(token).await }
        });

        for _ in 0..200 {
            if f.attacher.attempts() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(w.state(), WatchState::Searching);
        f.attacher.spawn_process("rwr_game.exe", 99);
        wait_for(&w, WatchState::Managed).await;

        token.cancel();
        let _ = run.await;
    }

    #[tokio::test(start_paused = true)]
    async fn waits_fixed_interval_between_attempts() {
        let f = fixture();
        let w = watcher(&f, Duration::from_secs(15));
        let mut rx = f.registry.bus().subscribe();
        let token = CancellationToken::new();
        let run = tokio::spawn({
            let w = Arc::clone(&w);
            let token = token.clone();
            async move { w.run(token).await }
        });

        let mut seen = Vec::new();
        while seen.len() < 3 {
            let ev = rx.recv().await.expect("event");
            if ev.kind == EventKind::BackoffScheduled {
                seen.push((tokio::time::Instant::now(), ev.delay_ms, ev.attempt));
            }
        }
        assert_eq!(seen[0].1, Some(15_000));
        assert_eq!(seen[2].2, Some(3));
        assert!(seen[1].0 - seen[0].0 >= Duration::from_secs(15));
        assert!(seen[2].0 - seen[1].0 >= Duration::from_secs(15));

        token.cancel();
        let res = run.await.expect("join");
        assert!(matches!(res, Err(TaskError::Canceled)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn non_retryable_attach_error_is_fatal() {
        let f = fixture();
        f.attacher
            .fail_attach_with(BackendError::Transport("agent crashed".into()));
        let w = watcher(&f, Duration::from_millis(10));
        let res = w.run(CancellationToken::new()).await;
        assert!(matches!(res, Err(TaskError::Fatal { .. })));
        assert_eq!(f.attacher.attempts(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn detach_returns_to_searching_and_reattaches() -> anyhow::Result<()> {
        let f = fixture();
        f.attacher.spawn_process("rwr_game.exe", 1);
        let w = watcher(&f, Duration::from_millis(10));
        let token = CancellationToken::new();
        let run = tokio::spawn({
            let w = Arc::clone(&w);
            let token = token.clone();
            async move { w.run(token).await }
        });

        wait_for(&w, WatchState::Managed).await;
        let first = f.registry.get("rwr_game.exe").expect("first session");

        f.attacher.kill_process("rwr_game.exe");
        first.detached().await;
        f.attacher.spawn_process("rwr_game.exe", 2);

        for _ in 0..400 {
            if f.registry.get("rwr_game.exe").is_some_and(|s| s.pid() == 2)
                && w.state() == WatchState::Managed
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let second = f.registry.get("rwr_game.exe").expect("second session");
        assert_eq!(second.pid(), 2);
        assert!(second.patch("anti_fog").is_some_and(|p| p.is_applied()));

        token.cancel();
        let res = run.await?;
        assert!(matches!(res, Err(TaskError::Canceled)));
        Ok(())
    }
}
