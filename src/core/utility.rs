//! Typed client for the per-session utility script.
//!
//! The utility script is loaded by `Session::init` and exports the informational
//! calls. [`UtilityClient`] turns each export into a typed method and rejects
//! replies of the wrong shape with `UnexpectedReply`.
//!
//! Besides the seven static facts it covers live inspection of the target:
//! threads, modules and synchronous pattern scans. Those return typed records
//! ([`ThreadInfo`], [`ModuleInfo`], [`ScanMatch`]).

use std::fmt;
use std::sync::Arc;

use crate::backend::{RemoteCall, RemoteValue};
use crate::core::script::Script;
use crate::error::SessionError;

/// Static facts about the attached target, queried once during init.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFacts {
    pub engine_version: String,
    pub script_runtime: String,
    pub arch: String,
    pub platform: String,
    pub page_size: u64,
    pub pointer_size: u64,
    pub code_signing_policy: String,
}

impl SessionFacts {
    /// Queries the seven facts one after another.
    pub(crate) async fn fetch(client: &UtilityClient) -> Result<Self, SessionError> {
        Ok(Self {
            engine_version: client.engine_version().await?,
            script_runtime: client.script_runtime().await?,
            arch: client.arch().await?,
            platform: client.platform().await?,
            page_size: client.page_size().await?,
            pointer_size: client.pointer_size().await?,
            code_signing_policy: client.code_signing_policy().await?,
        })
    }
}

impl fmt::Display for SessionFacts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "engine={} runtime={} {}/{} page={} ptr={} signing={}",
            self.engine_version,
            self.script_runtime,
            self.platform,
            self.arch,
            self.page_size,
            self.pointer_size,
            self.code_signing_policy
        )
    }
}

/// One thread of the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: u64,
    /// `"running"`, `"stopped"`, `"waiting"`, ...
    pub state: String,
}

/// One module loaded in the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub base: u64,
    pub size: u64,
    pub path: String,
}

/// One hit of a pattern scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanMatch {
    pub address: u64,
    pub size: u64,
}

impl ThreadInfo {
    fn from_remote(v: &RemoteValue) -> Option<Self> {
        Some(Self {
            id: v.get("id")?.as_u64()?,
            state: v.get("state")?.as_str()?.to_string(),
        })
    }
}

impl ModuleInfo {
    fn from_remote(v: &RemoteValue) -> Option<Self> {
        Some(Self {
            name: v.get("name")?.as_str()?.to_string(),
            base: v.get("base")?.as_address()?,
            size: v.get("size")?.as_u64()?,
            path: v.get("path")?.as_str()?.to_string(),
        })
    }
}

impl ScanMatch {
    fn from_remote(v: &RemoteValue) -> Option<Self> {
        Some(Self {
            address: v.get("address")?.as_address()?,
            size: v.get("size")?.as_u64()?,
        })
    }
}

/// Typed remote calls against a loaded utility script.
#[derive(Debug, Clone)]
pub struct UtilityClient {
    script: Arc<Script>,
}

impl UtilityClient {
    pub(crate) fn new(script: Arc<Script>) -> Self {
        Self { script }
    }

    pub fn script(&self) -> &Arc<Script> {
        &self.script
    }

    pub async fn engine_version(&self) -> Result<String, SessionError> {
        self.text(RemoteCall::EngineVersion).await
    }

    pub async fn script_runtime(&self) -> Result<String, SessionError> {
        self.text(RemoteCall::ScriptRuntime).await
    }

    pub async fn arch(&self) -> Result<String, SessionError> {
        self.text(RemoteCall::Arch).await
    }

    pub async fn platform(&self) -> Result<String, SessionError> {
        self.text(RemoteCall::Platform).await
    }

    pub async fn page_size(&self) -> Result<u64, SessionError> {
        self.number(RemoteCall::PageSize).await
    }

    pub async fn pointer_size(&self) -> Result<u64, SessionError> {
        self.number(RemoteCall::PointerSize).await
    }

    pub async fn code_signing_policy(&self) -> Result<String, SessionError> {
        self.text(RemoteCall::CodeSigningPolicy).await
    }

    pub async fn heap_size(&self) -> Result<u64, SessionError> {
        self.number(RemoteCall::HeapSize).await
    }

    pub async fn is_debugger_attached(&self) -> Result<bool, SessionError> {
        let export = RemoteCall::IsDebuggerAttached.export_name();
        let v = self.script.call(RemoteCall::IsDebuggerAttached).await?;
        v.as_bool().ok_or_else(|| unexpected(export, &v))
    }

    /// Process id as the target reports it; matches [`Session::pid`](crate::Session::pid).
    pub async fn pid(&self) -> Result<u32, SessionError> {
        let n = self.number(RemoteCall::Pid).await?;
        u32::try_from(n).map_err(|_| SessionError::UnexpectedReply {
            call: RemoteCall::Pid.export_name(),
            got: n.to_string(),
        })
    }

    pub async fn current_thread_id(&self) -> Result<u64, SessionError> {
        self.number(RemoteCall::CurrentThreadId).await
    }

    pub async fn enumerate_threads(&self) -> Result<Vec<ThreadInfo>, SessionError> {
        self.records(RemoteCall::EnumerateThreads, ThreadInfo::from_remote)
            .await
    }

    pub async fn enumerate_modules(&self) -> Result<Vec<ModuleInfo>, SessionError> {
        self.records(RemoteCall::EnumerateModules, ModuleInfo::from_remote)
            .await
    }

    /// Module called `name`. A module that isn't loaded fails on the target side.
    pub async fn module_by_name(&self, name: &str) -> Result<ModuleInfo, SessionError> {
        let call = RemoteCall::GetModuleByName {
            name: name.to_string(),
        };
        let export = call.export_name();
        let v = self.script.call(call).await?;
        ModuleInfo::from_remote(&v).ok_or_else(|| unexpected(export, &v))
    }

    /// Scans `[address, address + size)` for `pattern` (`"D9 44 ?? 08"` style).
    pub async fn scan_sync(
        &self,
        address: u64,
        size: u64,
        pattern: &str,
    ) -> Result<Vec<ScanMatch>, SessionError> {
        let call = RemoteCall::ScanSync {
            address,
            size,
            pattern: pattern.to_string(),
        };
        self.records(call, ScanMatch::from_remote).await
    }

    async fn text(&self, call: RemoteCall) -> Result<String, SessionError> {
        let export = call.export_name();
        let v = self.script.call(call).await?;
        match v {
            RemoteValue::Str(s) => Ok(s),
            other => Err(unexpected(export, &other)),
        }
    }

    async fn number(&self, call: RemoteCall) -> Result<u64, SessionError> {
        let export = call.export_name();
        let v = self.script.call(call).await?;
        v.as_u64().ok_or_else(|| unexpected(export, &v))
    }

    /// List reply where every item must parse; one bad item rejects the reply.
    async fn records<T>(
        &self,
        call: RemoteCall,
        parse: fn(&RemoteValue) -> Option<T>,
    ) -> Result<Vec<T>, SessionError> {
        let export = call.export_name();
        let v = self.script.call(call).await?;
        v.as_list()
            .and_then(|items| items.iter().map(parse).collect::<Option<Vec<T>>>())
            .ok_or_else(|| unexpected(export, &v))
    }
}

fn unexpected(call: &'static str, got: &RemoteValue) -> SessionError {
    SessionError::UnexpectedReply {
        call,
        got: format!("{got:?}"),
    }
}
