//! In-memory backend used by the unit tests.
//!
//! Processes are plain `(target, pid)` entries. Attachments record every script
//! they create; scripts record every remote call and answer the utility calls
//! with fixed facts. Failure points are switched on per test.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use std::io::Write;
use tempfile::NamedTempFile;

use super::{
    Attacher, Attachment, BackendError, DetachObserver, DetachReason, LogHandler, LogLevel,
    MessageHandler, RemoteCall, RemoteValue, ScriptHandle, ScriptSignal,
};
use crate::patches::{
    CompileError, CompiledPatch, JmpPatchSpec, NopPatchSpec, PatchCompiler,
};

pub(crate) const ENGINE_VERSION: &str = "16.1.4";
pub(crate) const PAGE_SIZE: i64 = 4096;
pub(crate) const FAKE_MODULE_BASE: u64 = 0x40_0000;

/// Utility script source on disk; removed when dropped.
pub(crate) fn utility_script() -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp utility script");
    file.write_all(b"rpc.exports = {};\n")
        .expect("write utility script");
    file
}

#[derive(Default)]
pub(crate) struct FakeAttacher {
    processes: Mutex<HashMap<String, u32>>,
    attachments: Mutex<Vec<Arc<FakeAttachment>>>,
    attempts: AtomicUsize,
    fatal: Mutex<Option<BackendError>>,
    held: Mutex<bool>,
    held_cv: Condvar,
    fail_load: Mutex<Option<String>>,
    load_delay: Mutex<Option<Duration>>,
    fail_detach: AtomicBool,
}

impl FakeAttacher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spawn_process(&self, target: &str, pid: u32) {
        self.processes.lock().insert(target.to_string(), pid);
    }

    /// Removes the process and terminates its live attachments.
    pub fn kill_process(&self, target: &str) {
        let pid = self.processes.lock().remove(target);
        if let Some(pid) = pid {
            for att in self.attachments.lock().iter().filter(|a| a.pid == pid) {
                att.terminate(DetachReason::ProcessTerminated);
            }
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn attachments(&self) -> Vec<Arc<FakeAttachment>> {
        self.attachments.lock().clone()
    }

    pub fn last_attachment(&self) -> Option<Arc<FakeAttachment>> {
        self.attachments.lock().last().cloned()
    }

    /// Every following attach fails with `err`.
    pub fn fail_attach_with(&self, err: BackendError) {
        *self.fatal.lock() = Some(err);
    }

    /// Attaches block until [`FakeAttacher::release`].
    pub fn hold(&self) {
        *self.held.lock() = true;
    }

    pub fn release(&self) {
        *self.held.lock() = false;
        self.held_cv.notify_all();
    }

    /// Scripts whose name contains `fragment` fail to load in new attachments.
    pub fn fail_load_of(&self, fragment: &str) {
        *self.fail_load.lock() = Some(fragment.to_string());
    }

    /// Script loads in new attachments block for `delay`.
    pub fn slow_loads(&self, delay: Duration) {
        *self.load_delay.lock() = Some(delay);
    }

    /// New attachments refuse to detach.
    pub fn fail_detaches(&self) {
        self.fail_detach.store(true, Ordering::SeqCst);
    }
}

impl Attacher for FakeAttacher {
    fn attach(&self, target: &str) -> Result<Arc<dyn Attachment>, BackendError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut held = self.held.lock();
            while *held {
                self.held_cv.wait(&mut held);
            }
        }
        if let Some(err) = self.fatal.lock().clone() {
            return Err(err);
        }
        let pid = self
            .processes
            .lock()
            .get(target)
            .copied()
            .ok_or_else(|| BackendError::ProcessNotFound(format!("unable to find process '{target}'")))?;

        let att = Arc::new(FakeAttachment::new(
            pid,
            self.fail_load.lock().clone(),
            *self.load_delay.lock(),
            self.fail_detach.load(Ordering::SeqCst),
        ));
        self.attachments.lock().push(Arc::clone(&att));
        Ok(att)
    }
}

pub(crate) struct FakeAttachment {
    pub pid: u32,
    detached: Arc<AtomicBool>,
    observer: Mutex<Option<DetachObserver>>,
    scripts: Mutex<Vec<Arc<FakeScript>>>,
    fail_load: Option<String>,
    load_delay: Option<Duration>,
    fail_detach: bool,
}

impl FakeAttachment {
    fn new(
        pid: u32,
        fail_load: Option<String>,
        load_delay: Option<Duration>,
        fail_detach: bool,
    ) -> Self {
        Self {
            pid,
            detached: Arc::new(AtomicBool::new(false)),
            observer: Mutex::new(None),
            scripts: Mutex::new(Vec::new()),
            fail_load,
            load_delay,
            fail_detach,
        }
    }

    pub fn terminate(&self, reason: DetachReason) {
        self.detached.store(true, Ordering::SeqCst);
        if let Some(obs) = self.observer.lock().as_ref() {
            obs.notify(reason);
        }
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    pub fn scripts(&self) -> Vec<Arc<FakeScript>> {
        self.scripts.lock().clone()
    }

    pub fn script(&self, name: &str) -> Option<Arc<FakeScript>> {
        self.scripts.lock().iter().find(|s| s.name == name).cloned()
    }

    /// Marks the attachment detached without notifying anyone.
    pub fn break_silently(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }
}

impl Attachment for FakeAttachment {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn create_script(
        &self,
        name: &str,
        source: &str,
    ) -> Result<Arc<dyn ScriptHandle>, BackendError> {
        if self.is_detached() {
            return Err(BackendError::InvalidOperation("session is gone".into()));
        }
        let fail_load = self
            .fail_load
            .as_deref()
            .is_some_and(|frag| name.contains(frag));
        let script = Arc::new(FakeScript {
            name: name.to_string(),
            source: source.to_string(),
            pid: self.pid,
            detached: Arc::clone(&self.detached),
            loaded: AtomicBool::new(false),
            unloaded: AtomicBool::new(false),
            fail_load,
            load_delay: self.load_delay,
            reject_apply: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            log_handler: Mutex::new(None),
            message_handler: Mutex::new(None),
            destroyed_handler: Mutex::new(None),
        });
        self.scripts.lock().push(Arc::clone(&script));
        Ok(script)
    }

    fn observe_detach(&self, observer: DetachObserver) {
        *self.observer.lock() = Some(observer);
    }

    fn detach(&self) -> Result<(), BackendError> {
        if self.fail_detach {
            return Err(BackendError::Transport("detach refused".into()));
        }
        if self.detached.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(obs) = self.observer.lock().as_ref() {
            obs.notify(DetachReason::ApplicationRequested);
        }
        Ok(())
    }
}

pub(crate) struct FakeScript {
    pub name: String,
    pub source: String,
    pid: u32,
    detached: Arc<AtomicBool>,
    loaded: AtomicBool,
    unloaded: AtomicBool,
    fail_load: bool,
    load_delay: Option<Duration>,
    reject_apply: AtomicBool,
    calls: Mutex<Vec<RemoteCall>>,
    replies: Mutex<HashMap<&'static str, RemoteValue>>,
    log_handler: Mutex<Option<LogHandler>>,
    message_handler: Mutex<Option<MessageHandler>>,
    destroyed_handler: Mutex<Option<MessageHandler>>,
}

impl FakeScript {
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: RemoteCall) -> usize {
        self.calls.lock().iter().filter(|c| **c == call).count()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::SeqCst)
    }

    pub fn has_log_handler(&self) -> bool {
        self.log_handler.lock().is_some()
    }

    pub fn has_message_handler(&self) -> bool {
        self.message_handler.lock().is_some()
    }

    pub fn reject_apply(&self) {
        self.reject_apply.store(true, Ordering::SeqCst);
    }

    pub fn emit_log(&self, level: LogLevel, text: &str) {
        if let Some(h) = self.log_handler.lock().clone() {
            h(level, text);
        }
    }

    pub fn emit_message(&self, text: &str) {
        self.emit_message_with(text, None);
    }

    pub fn emit_message_with(&self, text: &str, data: Option<&[u8]>) {
        if let Some(h) = self.message_handler.lock().clone() {
            h(text, data);
        }
    }

    pub fn has_destroyed_handler(&self) -> bool {
        self.destroyed_handler.lock().is_some()
    }

    /// Target-side destruction: the script stops being loaded.
    pub fn destroy(&self) {
        self.loaded.store(false, Ordering::SeqCst);
        if let Some(h) = self.destroyed_handler.lock().clone() {
            h("destroyed", None);
        }
    }

    /// Replaces the reply to every call with the export name of `call`.
    pub fn reply_with(&self, call: RemoteCall, value: RemoteValue) {
        self.replies.lock().insert(call.export_name(), value);
    }

    fn gone(&self) -> Result<(), BackendError> {
        if self.detached.load(Ordering::SeqCst) {
            Err(BackendError::InvalidOperation("script is destroyed".into()))
        } else {
            Ok(())
        }
    }
}

impl ScriptHandle for FakeScript {
    fn load(&self) -> Result<(), BackendError> {
        self.gone()?;
        if let Some(delay) = self.load_delay {
            std::thread::sleep(delay);
        }
        if self.fail_load {
            return Err(BackendError::Transport(format!(
                "script '{}' threw during load",
                self.name
            )));
        }
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn unload(&self) -> Result<(), BackendError> {
        self.gone()?;
        self.unloaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_log_handler(&self, handler: Option<LogHandler>) {
        *self.log_handler.lock() = handler;
    }

    fn on(&self, signal: ScriptSignal, handler: Option<MessageHandler>) {
        match signal {
            ScriptSignal::Message => *self.message_handler.lock() = handler,
            ScriptSignal::Destroyed => *self.destroyed_handler.lock() = handler,
        }
    }

    fn call(&self, call: &RemoteCall) -> Result<RemoteValue, BackendError> {
        self.gone()?;
        if !self.loaded.load(Ordering::SeqCst) {
            return Err(BackendError::InvalidOperation("script not loaded".into()));
        }
        self.calls.lock().push(call.clone());
        if let Some(v) = self.replies.lock().get(call.export_name()) {
            return Ok(v.clone());
        }
        let reply = match call {
            RemoteCall::EngineVersion => RemoteValue::Str(ENGINE_VERSION.into()),
            RemoteCall::ScriptRuntime => RemoteValue::Str("QJS".into()),
            RemoteCall::Arch => RemoteValue::Str("ia32".into()),
            RemoteCall::Platform => RemoteValue::Str("windows".into()),
            RemoteCall::PageSize => RemoteValue::Int(PAGE_SIZE),
            RemoteCall::PointerSize => RemoteValue::Int(4),
            RemoteCall::CodeSigningPolicy => RemoteValue::Str("optional".into()),
            RemoteCall::HeapSize => RemoteValue::Int(1 << 20),
            RemoteCall::IsDebuggerAttached => RemoteValue::Bool(false),
            RemoteCall::Pid => RemoteValue::Int(i64::from(self.pid)),
            RemoteCall::CurrentThreadId => RemoteValue::Int(7312),
            RemoteCall::EnumerateThreads => RemoteValue::List(vec![
                object([("id", RemoteValue::Int(7312)), ("state", "running".into())]),
                object([("id", RemoteValue::Int(7313)), ("state", "waiting".into())]),
            ]),
            RemoteCall::EnumerateModules => {
                RemoteValue::List(MODULES.iter().map(module).collect())
            }
            RemoteCall::GetModuleByName { name } => match MODULES.iter().find(|m| m.0 == name.as_str()) {
                Some(m) => module(m),
                None => {
                    return Err(BackendError::InvalidOperation(format!(
                        "unable to find module '{name}'"
                    )));
                }
            },
            RemoteCall::ScanSync { address, .. } => RemoteValue::List(vec![object([
                ("address", format!("{:#x}", address + 0x10).into()),
                ("size", RemoteValue::Int(4)),
            ])]),
            RemoteCall::Apply => RemoteValue::Bool(!self.reject_apply.load(Ordering::SeqCst)),
            RemoteCall::Clear => RemoteValue::Bool(true),
        };
        Ok(reply)
    }
}

/// `(name, base, size, path)` of the fake target's modules.
const MODULES: [(&str, u64, i64, &str); 2] = [
    ("rwr_game.exe", FAKE_MODULE_BASE, 0x2f_0000, "C:\\rwr\\rwr_game.exe"),
    ("kernel32.dll", 0x7700_0000, 0xd_0000, "C:\\Windows\\kernel32.dll"),
];

fn module(m: &(&str, u64, i64, &str)) -> RemoteValue {
    object([
        ("name", m.0.into()),
        ("base", format!("{:#x}", m.1).into()),
        ("size", RemoteValue::Int(m.2)),
        ("path", m.3.into()),
    ])
}

fn object<const N: usize>(fields: [(&str, RemoteValue); N]) -> RemoteValue {
    RemoteValue::Object(
        fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    )
}

#[derive(Default)]
pub(crate) struct FakeCompiler {
    seq: AtomicUsize,
    fail: AtomicBool,
}

impl FakeCompiler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    fn compile(&self, name: &str, kind: &str) -> Result<CompiledPatch, CompileError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CompileError(format!("bad pattern for '{name}'")));
        }
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        Ok(CompiledPatch {
            script_name: format!("{name}_{kind}_patch_{n}.js"),
            source: format!("// {kind} patch {name}\nrpc.exports.apply = () => true;"),
        })
    }
}

impl PatchCompiler for FakeCompiler {
    fn gen_jmp_patch(&self, spec: &JmpPatchSpec) -> Result<CompiledPatch, CompileError> {
        self.compile(&spec.name, "jmp")
    }

    fn gen_nop_patch(&self, spec: &NopPatchSpec) -> Result<CompiledPatch, CompileError> {
        self.compile(&spec.name, "nop")
    }
}
