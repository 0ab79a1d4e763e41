//! # Session registry - event-driven attachment lifecycle manager.
//!
//! Process-wide map from target identifier to [`Session`]. At most one session
//! exists per target; entries are removed by detach notices, never by callers.
//!
//! ## Architecture
//! ```text
//! attach(target)
//!   ├─► reserve slot (Attaching)      ── DuplicateSession / AttachInProgress
//!   ├─► offload: attacher.attach ─► pid ─► observe_detach(observer)
//!   ├─► SessionAttached
//!   ├─► session.init()                ── err → release + detach, return err
//!   └─► commit slot (Live)            ── detached meanwhile → InvalidOperation
//!
//! backend thread ── observer.notify(reason) ──► mpsc ──► Registry listener
//!                                                           ├─ Live with same SessionId → remove,
//!                                                           │    mark detached, SessionDetached
//!                                                           ├─ Attaching with same id → remember
//!                                                           └─ anything else → ignored (stale)
//! ```
//!
//! ## Rules
//! - The slot map lock is never held across `.await`.
//! - A dropped `attach` future releases its reservation and detaches whatever
//!   it attached, even when the backend call finishes after the drop.
//! - A session is visible through [`Registry::get`] only once initialised.
//! - A notice carrying an older `SessionId` never removes a newer session.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::{
    Attacher, Attachment, BackendError, DetachNotice, DetachObserver, DetachReason, SessionId,
};
use crate::core::config::Config;
use crate::core::offload::Offload;
use crate::core::session::{Session, SessionEnv, SessionInfo};
use crate::error::SessionError;
use crate::events::{Bus, Event, EventKind};
use crate::patches::PatchCompiler;

enum Slot {
    /// Attach in flight; `detached` records a notice that beat the commit.
    Attaching {
        id: SessionId,
        detached: Option<DetachReason>,
    },
    Live(Arc<Session>),
}

/// Registry of live sessions, one per target.
pub struct Registry {
    slots: RwLock<HashMap<String, Slot>>,
    attacher: Arc<dyn Attacher>,
    env: SessionEnv,
    next_id: AtomicU64,
    detach_tx: mpsc::UnboundedSender<DetachNotice>,
    detach_rx: Mutex<Option<mpsc::UnboundedReceiver<DetachNotice>>>,
}

/// Hands the backend attachment from the blocking attach call to its caller.
///
/// If the caller is gone by the time the attach returns, the blocking side
/// detaches on its own.
#[derive(Default)]
struct Handoff {
    abandoned: bool,
    attachment: Option<Arc<dyn Attachment>>,
}

/// Reserved slot; removed on drop unless committed.
///
/// An armed reservation dropped mid-attach detaches what was attached so far:
/// the session if one was built, the bare attachment otherwise.
struct Reservation<'a> {
    registry: &'a Registry,
    target: &'a str,
    id: SessionId,
    armed: bool,
    handoff: Arc<Mutex<Handoff>>,
    session: Option<Arc<Session>>,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.unslot();
        let stray = {
            let mut handoff = self.handoff.lock();
            handoff.abandoned = true;
            handoff.attachment.take()
        };
        let session = self.session.take();
        if let Some(s) = &session {
            s.mark_detached();
        }
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let env = self.registry.env.clone();
        let target: Arc<str> = Arc::from(self.target);
        match (session, stray) {
            (Some(session), _) => {
                rt.spawn(async move {
                    let res = session.detach().await;
                    publish_abandoned(&env.bus, target, session.pid(), res);
                });
            }
            (None, Some(attachment)) => {
                rt.spawn(async move {
                    let pid = attachment.pid();
                    let res = match env.offload.run(move || attachment.detach()).await {
                        Ok(done) => done.map_err(SessionError::from_backend),
                        Err(e) => Err(e),
                    };
                    publish_abandoned(&env.bus, target, pid, res);
                });
            }
            (None, None) => {}
        }
    }
}

impl Reservation<'_> {
    /// Hands the built session to the reservation until commit.
    fn hold(&mut self, session: Arc<Session>) {
        self.handoff.lock().attachment = None;
        self.session = Some(session);
    }

    /// Frees the slot without detaching; the caller handles the session.
    fn release(mut self) {
        self.armed = false;
        self.unslot();
    }

    /// Swaps the reservation for the live session.
    fn commit(mut self) -> Result<Arc<Session>, SessionError> {
        let Some(session) = self.session.clone() else {
            return Err(SessionError::InvalidOperation {
                reason: format!("no session built for '{}'", self.target),
            });
        };
        let mut slots = self.registry.slots.write();
        let early = match slots.get_mut(self.target) {
            Some(Slot::Attaching { id, detached }) if *id == self.id => detached.take(),
            _ => {
                // armed: the drop detaches the orphaned session
                return Err(SessionError::InvalidOperation {
                    reason: format!("reservation for '{}' was lost", self.target),
                });
            }
        };
        self.armed = false;
        match early {
            None => {
                slots.insert(self.target.to_string(), Slot::Live(Arc::clone(&session)));
                Ok(session)
            }
            Some(reason) => {
                slots.remove(self.target);
                drop(slots);
                session.mark_detached();
                Err(SessionError::InvalidOperation {
                    reason: format!("'{}' detached during attach: {}", self.target, reason.as_str()),
                })
            }
        }
    }

    fn unslot(&self) {
        let mut slots = self.registry.slots.write();
        if matches!(slots.get(self.target), Some(Slot::Attaching { id, .. }) if *id == self.id) {
            slots.remove(self.target);
        }
    }
}

/// Reports the detach of an attach whose caller went away.
fn publish_abandoned(bus: &Bus, target: Arc<str>, pid: u32, res: Result<(), SessionError>) {
    let ev = match res {
        Ok(()) => Event::new(EventKind::SessionDetached)
            .with_reason(DetachReason::ApplicationRequested.as_str()),
        Err(e) => Event::new(EventKind::OperationFailed).with_reason(e.to_string()),
    };
    bus.publish(ev.with_target(target).with_pid(pid));
}

impl Registry {
    /// Creates a new registry. Call [`Registry::spawn_listener`] before attaching.
    pub fn new(
        attacher: Arc<dyn Attacher>,
        compiler: Arc<dyn PatchCompiler>,
        bus: Bus,
        cfg: &Config,
    ) -> Arc<Self> {
        let (detach_tx, detach_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            slots: RwLock::new(HashMap::new()),
            attacher,
            env: SessionEnv {
                compiler,
                offload: Offload::new(cfg.blocking_limit()),
                bus,
                utility_script: cfg.utility_script.clone(),
                utility_name: cfg.utility_name.clone(),
            },
            next_id: AtomicU64::new(1),
            detach_tx,
            detach_rx: Mutex::new(Some(detach_rx)),
        })
    }

    /// Spawns the task that applies detach notices until `token` is cancelled.
    ///
    /// Only the first call spawns; later calls are no-ops.
    pub fn spawn_listener(self: &Arc<Self>, token: CancellationToken) {
        let Some(mut rx) = self.detach_rx.lock().take() else {
            return;
        };
        let me = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    notice = rx.recv() => match notice {
                        Some(n) => me.handle_notice(n),
                        None => break,
                    }
                }
            }
        });
    }

    pub fn bus(&self) -> &Bus {
        &self.env.bus
    }

    /// Attaches to `target`, initialises the session and registers it.
    ///
    /// The target stays reserved until init finished: a concurrent attach gets
    /// `AttachInProgress`. Dropping the returned future detaches the target.
    pub async fn attach(&self, target: &str) -> Result<Arc<Session>, SessionError> {
        let mut reservation = self.reserve(target)?;
        let id = reservation.id;
        let target_arc: Arc<str> = Arc::from(target);
        self.bus()
            .publish(Event::new(EventKind::AttachStarting).with_target(Arc::clone(&target_arc)));

        let attacher = Arc::clone(&self.attacher);
        let observer = DetachObserver::new(Arc::clone(&target_arc), id, self.detach_tx.clone());
        let name = target.to_string();
        let handoff = Arc::clone(&reservation.handoff);
        let attached = self
            .env
            .offload
            .run(move || -> Result<(Arc<dyn Attachment>, u32), BackendError> {
                let attachment = attacher.attach(&name)?;
                let pid = attachment.pid();
                attachment.observe_detach(observer);
                let mut handoff = handoff.lock();
                if handoff.abandoned {
                    drop(handoff);
                    attachment.detach()?;
                    return Err(BackendError::InvalidOperation(format!(
                        "attach to '{name}' abandoned"
                    )));
                }
                handoff.attachment = Some(Arc::clone(&attachment));
                Ok((attachment, pid))
            })
            .await?;

        let (attachment, pid) = match attached {
            Ok(ok) => ok,
            Err(e) => {
                let err = match e {
                    BackendError::ProcessNotFound(reason) => SessionError::AttachFailure {
                        target: target.to_string(),
                        reason,
                    },
                    other => SessionError::from_backend(other),
                };
                self.bus().publish(
                    Event::new(EventKind::AttachFailed)
                        .with_target(target_arc)
                        .with_reason(err.to_string()),
                );
                return Err(err);
            }
        };

        let session = Arc::new(Session::new(
            Arc::clone(&target_arc),
            id,
            pid,
            attachment,
            self.env.clone(),
        ));
        reservation.hold(Arc::clone(&session));
        self.bus().publish(
            Event::new(EventKind::SessionAttached)
                .with_target(Arc::clone(&target_arc))
                .with_pid(pid),
        );

        if let Err(e) = session.init().await {
            reservation.release();
            session.mark_detached();
            if let Err(detach) = session.detach().await {
                self.bus().publish(
                    Event::new(EventKind::OperationFailed)
                        .with_target(Arc::clone(&target_arc))
                        .with_pid(pid)
                        .with_reason(detach.to_string()),
                );
            }
            self.bus().publish(
                Event::new(EventKind::OperationFailed)
                    .with_target(target_arc)
                    .with_pid(pid)
                    .with_reason(e.to_string()),
            );
            return Err(e);
        }
        reservation.commit()
    }

    /// Live session for `target`.
    pub fn get(&self, target: &str) -> Option<Arc<Session>> {
        match self.slots.read().get(target) {
            Some(Slot::Live(s)) => Some(Arc::clone(s)),
            _ => None,
        }
    }

    /// Returns sorted list of targets with a live session.
    pub fn list(&self) -> Vec<String> {
        let slots = self.slots.read();
        let mut names: Vec<String> = slots
            .iter()
            .filter(|(_, s)| matches!(s, Slot::Live(_)))
            .map(|(k, _)| k.clone())
            .collect();
        names.sort_unstable();
        names
    }

    /// Returns true if no session is live.
    pub fn is_empty(&self) -> bool {
        !self
            .slots
            .read()
            .values()
            .any(|s| matches!(s, Slot::Live(_)))
    }

    /// Snapshots of all live sessions, sorted by target.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.live();
        let mut infos: Vec<SessionInfo> = sessions.iter().map(|s| s.info()).collect();
        infos.sort_unstable_by(|a, b| a.target.cmp(&b.target));
        infos
    }

    /// Removes every live session and detaches it.
    pub async fn detach_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut slots = self.slots.write();
            let live: Vec<String> = slots
                .iter()
                .filter(|(_, s)| matches!(s, Slot::Live(_)))
                .map(|(k, _)| k.clone())
                .collect();
            live.into_iter()
                .filter_map(|k| match slots.remove(&k) {
                    Some(Slot::Live(s)) => Some(s),
                    _ => None,
                })
                .collect()
        };

        for session in sessions {
            session.mark_detached();
            if let Err(e) = session.detach().await {
                self.bus().publish(
                    Event::new(EventKind::OperationFailed)
                        .with_target(session.target())
                        .with_reason(e.to_string()),
                );
            }
            self.publish_detached(&session, DetachReason::ApplicationRequested.as_str());
        }
    }

    fn reserve<'a>(&'a self, target: &'a str) -> Result<Reservation<'a>, SessionError> {
        let mut slots = self.slots.write();
        match slots.get(target) {
            Some(Slot::Live(s)) => Err(SessionError::DuplicateSession {
                target: target.to_string(),
                pid: s.pid(),
            }),
            Some(Slot::Attaching { .. }) => Err(SessionError::AttachInProgress {
                target: target.to_string(),
            }),
            None => {
                let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
                slots.insert(
                    target.to_string(),
                    Slot::Attaching { id, detached: None },
                );
                Ok(Reservation {
                    registry: self,
                    target,
                    id,
                    armed: true,
                    handoff: Arc::new(Mutex::new(Handoff::default())),
                    session: None,
                })
            }
        }
    }

    fn handle_notice(&self, notice: DetachNotice) {
        let target: &str = &notice.target;
        let removed = {
            let mut slots = self.slots.write();
            let live = match slots.get_mut(target) {
                Some(Slot::Live(s)) => s.id() == notice.session,
                Some(Slot::Attaching { id, detached }) => {
                    if *id == notice.session {
                        *detached = Some(notice.reason.clone());
                    }
                    false
                }
                None => false,
            };
            if live { slots.remove(target) } else { None }
        };

        if let Some(Slot::Live(session)) = removed {
            session.mark_detached();
            self.publish_detached(&session, notice.reason.as_str());
        }
    }

    fn live(&self) -> Vec<Arc<Session>> {
        self.slots
            .read()
            .values()
            .filter_map(|s| match s {
                Slot::Live(s) => Some(Arc::clone(s)),
                Slot::Attaching { .. } => None,
            })
            .collect()
    }

    fn publish_detached(&self, session: &Session, reason: &str) {
        self.bus().publish(
            Event::new(EventKind::SessionDetached)
                .with_target(session.target())
                .with_pid(session.pid())
                .with_reason(reason),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{FakeAttacher, FakeCompiler, utility_script};
    use std::time::Duration;
    use tempfile::NamedTempFile;

    struct Fixture {
        registry: Arc<Registry>,
        attacher: Arc<FakeAttacher>,
        token: CancellationToken,
        _utility: NamedTempFile,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.token.cancel();
        }
    }

    fn fixture() -> Fixture {
        let utility = utility_script();
        let cfg = Config {
            utility_script: utility.path().to_path_buf(),
            ..Config::default()
        };
        let attacher = FakeAttacher::new();
        let registry = Registry::new(attacher.clone(), FakeCompiler::new(), Bus::new(256), &cfg);
        let token = CancellationToken::new();
        registry.spawn_listener(token.clone());
        Fixture {
            registry,
            attacher,
            token,
            _utility: utility,
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn attach_registers_and_initialises() {
        let f = fixture();
        f.attacher.spawn_process("rwr_game.exe", 4242);

        let session = f.registry.attach("rwr_game.exe").await.expect("attach");
        assert_eq!(session.pid(), 4242);
        assert!(session.is_initialized());
        assert_eq!(f.registry.list(), vec!["rwr_game.exe".to_string()]);
        assert!(Arc::ptr_eq(
            &f.registry.get("rwr_game.exe").expect("registered"),
            &session
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_attach_is_duplicate_and_keeps_first() {
        let f = fixture();
        f.attacher.spawn_process("rwr_game.exe", 4242);
        let first = f.registry.attach("rwr_game.exe").await.expect("attach");

        let err = f.registry.attach("rwr_game.exe").await.expect_err("dup");
        assert!(err.to_string().contains("4242"));
        assert_eq!(
            err,
            SessionError::DuplicateSession {
                target: "rwr_game.exe".into(),
                pid: 4242
            }
        );
        assert_eq!(f.attacher.attempts(), 1);
        assert!(Arc::ptr_eq(&f.registry.get("rwr_game.exe").expect("kept"), &first));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn absent_process_is_attach_failure() {
        let f = fixture();
        let err = f.registry.attach("ghost.exe").await.expect_err("absent");
        assert!(err.is_retryable());
        assert!(matches!(err, SessionError::AttachFailure { ref target, .. } if target == "ghost.exe"));
        assert!(f.registry.is_empty());
        // reservation released
        assert!(matches!(
            f.registry.attach("ghost.exe").await,
            Err(SessionError::AttachFailure { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn detach_removes_only_that_target() {
        let f = fixture();
        f.attacher.spawn_process("a.exe", 1);
        f.attacher.spawn_process("b.exe", 2);
        let a = f.registry.attach("a.exe").await.expect("a");
        f.registry.attach("b.exe").await.expect("b");

        f.attacher.kill_process("a.exe");
        a.detached().await;
        wait_until(|| f.registry.get("a.exe").is_none()).await;
        assert_eq!(f.registry.list(), vec!["b.exe".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_notice_keeps_newer_session() {
        let f = fixture();
        f.attacher.spawn_process("rwr_game.exe", 10);
        let old = f.registry.attach("rwr_game.exe").await.expect("old");
        old.detach().await.expect("detach");
        wait_until(|| f.registry.get("rwr_game.exe").is_none()).await;

        let newer = f.registry.attach("rwr_game.exe").await.expect("newer");
        // a late duplicate notice for the old session
        f.registry.handle_notice(DetachNotice {
            target: Arc::from("rwr_game.exe"),
            session: old.id(),
            reason: DetachReason::ProcessTerminated,
        });
        assert!(Arc::ptr_eq(
            &f.registry.get("rwr_game.exe").expect("still there"),
            &newer
        ));
        assert!(!newer.is_detached());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn in_flight_attach_blocks_concurrent_attach() {
        let f = fixture();
        f.attacher.spawn_process("rwr_game.exe", 5);
        f.attacher.hold();

        let registry = Arc::clone(&f.registry);
        let first = tokio::spawn(async move { registry.attach("rwr_game.exe").await });
        wait_until(|| f.attacher.attempts() == 1).await;

        let err = f.registry.attach("rwr_game.exe").await.expect_err("in progress");
        assert!(matches!(err, SessionError::AttachInProgress { .. }));

        f.attacher.release();
        let session = first.await.expect("join").expect("attach");
        assert_eq!(session.pid(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_attach_releases_reservation() {
        let f = fixture();
        f.attacher.spawn_process("rwr_game.exe", 5);
        f.attacher.hold();

        let registry = Arc::clone(&f.registry);
        let pending = tokio::spawn(async move { registry.attach("rwr_game.exe").await });
        wait_until(|| f.attacher.attempts() == 1).await;
        pending.abort();
        let _ = pending.await;

        f.attacher.release();
        // the attach finished after its caller left; nothing keeps it alive
        wait_until(|| f.attacher.last_attachment().is_some_and(|a| a.is_detached())).await;

        let session = f.registry.attach("rwr_game.exe").await.expect("attach again");
        assert_eq!(session.pid(), 5);
        assert!(!session.is_detached());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_attach_during_init_detaches_session() {
        let f = fixture();
        f.attacher.spawn_process("rwr_game.exe", 5);
        f.attacher.slow_loads(Duration::from_millis(300));
        let mut rx = f.registry.bus().subscribe();

        let registry = Arc::clone(&f.registry);
        let pending = tokio::spawn(async move { registry.attach("rwr_game.exe").await });
        wait_until(|| {
            f.attacher
                .last_attachment()
                .is_some_and(|a| !a.scripts().is_empty())
        })
        .await;

        // still initialising: neither visible nor attachable twice
        assert!(f.registry.get("rwr_game.exe").is_none());
        assert!(matches!(
            f.registry.attach("rwr_game.exe").await,
            Err(SessionError::AttachInProgress { .. })
        ));

        pending.abort();
        let _ = pending.await;

        let orphan = f.attacher.last_attachment().expect("attachment");
        wait_until(|| orphan.is_detached()).await;
        loop {
            let ev = rx.recv().await.expect("event");
            if ev.kind == EventKind::SessionDetached {
                assert_eq!(ev.pid, Some(5));
                break;
            }
        }

        let session = f.registry.attach("rwr_game.exe").await.expect("attach again");
        assert!(session.is_initialized());
        assert_eq!(f.attacher.attachments().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn init_failure_unregisters_and_detaches() {
        let f = fixture();
        f.attacher.spawn_process("rwr_game.exe", 5);
        f.attacher.fail_load_of("_patchvisor");

        let err = f.registry.attach("rwr_game.exe").await.expect_err("init");
        assert!(matches!(err, SessionError::InvalidOperation { .. }));
        assert!(f.registry.is_empty());
        assert!(f.attacher.last_attachment().expect("attachment").is_detached());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn init_failure_reports_refused_detach() {
        let f = fixture();
        f.attacher.spawn_process("rwr_game.exe", 5);
        f.attacher.fail_load_of("_patchvisor");
        f.attacher.fail_detaches();
        let mut rx = f.registry.bus().subscribe();

        let err = f.registry.attach("rwr_game.exe").await.expect_err("init");
        assert!(f.registry.is_empty());

        let mut failures = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if ev.kind == EventKind::OperationFailed {
                failures.push(ev.reason.as_deref().unwrap_or_default().to_string());
            }
        }
        assert!(failures.iter().any(|r| r.contains("detach refused")));
        assert!(failures.contains(&err.to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn detach_all_empties_registry() {
        let f = fixture();
        f.attacher.spawn_process("a.exe", 1);
        f.attacher.spawn_process("b.exe", 2);
        f.registry.attach("a.exe").await.expect("a");
        f.registry.attach("b.exe").await.expect("b");
        assert_eq!(f.registry.snapshot().len(), 2);

        f.registry.detach_all().await;
        assert!(f.registry.is_empty());
        assert!(f.attacher.attachments().iter().all(|a| a.is_detached()));
    }
}
