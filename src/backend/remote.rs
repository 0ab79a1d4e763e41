//! Typed remote calls exported by injected scripts.

use std::collections::BTreeMap;

/// A remote function exported by an injected script.
///
/// The utility script exports the informational calls; every patch script
/// exports [`RemoteCall::Apply`] and [`RemoteCall::Clear`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemoteCall {
    /// Instrumentation engine version string.
    EngineVersion,
    /// Script runtime identifier (e.g. `"QJS"`).
    ScriptRuntime,
    /// Target architecture (e.g. `"ia32"`).
    Arch,
    /// Target platform (e.g. `"windows"`).
    Platform,
    /// Target page size in bytes.
    PageSize,
    /// Target pointer size in bytes.
    PointerSize,
    /// Target code-signing policy (`"optional"` / `"required"`).
    CodeSigningPolicy,
    /// Engine heap size inside the target, in bytes.
    HeapSize,
    /// Whether a debugger is attached to the target.
    IsDebuggerAttached,
    /// Target process id as seen from inside.
    Pid,
    /// Id of the thread running the call.
    CurrentThreadId,
    /// Threads of the target.
    EnumerateThreads,
    /// Modules loaded in the target.
    EnumerateModules,
    /// One loaded module, by name. Fails remotely if it isn't loaded.
    GetModuleByName { name: String },
    /// Synchronous pattern scan over `[address, address + size)`.
    ScanSync {
        address: u64,
        size: u64,
        pattern: String,
    },
    /// Install the patch; replies `true` on success.
    Apply,
    /// Revert the patch; replies `true` on success.
    Clear,
}

impl RemoteCall {
    /// Name of the exported function on the script side.
    pub fn export_name(&self) -> &'static str {
        match self {
            RemoteCall::EngineVersion => "engineVersion",
            RemoteCall::ScriptRuntime => "scriptRuntime",
            RemoteCall::Arch => "arch",
            RemoteCall::Platform => "platform",
            RemoteCall::PageSize => "pageSize",
            RemoteCall::PointerSize => "pointerSize",
            RemoteCall::CodeSigningPolicy => "codeSigningPolicy",
            RemoteCall::HeapSize => "heapSize",
            RemoteCall::IsDebuggerAttached => "isDebuggerAttached",
            RemoteCall::Pid => "pid",
            RemoteCall::CurrentThreadId => "getCurrentThreadId",
            RemoteCall::EnumerateThreads => "enumerateThreads",
            RemoteCall::EnumerateModules => "enumerateModules",
            RemoteCall::GetModuleByName { .. } => "getModuleByName",
            RemoteCall::ScanSync { .. } => "scanSync",
            RemoteCall::Apply => "apply",
            RemoteCall::Clear => "clear",
        }
    }
}

/// Reply of a remote call.
///
/// Objects keep their keys sorted; pointers usually arrive as `"0x..."` strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<RemoteValue>),
    Object(BTreeMap<String, RemoteValue>),
}

impl RemoteValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RemoteValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Non-negative integers only.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            RemoteValue::Int(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RemoteValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            RemoteValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[RemoteValue]> {
        match self {
            RemoteValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Field of an object reply.
    pub fn get(&self, key: &str) -> Option<&RemoteValue> {
        match self {
            RemoteValue::Object(fields) => fields.get(key),
            _ => None,
        }
    }

    /// Address as a `"0x..."` string or a non-negative integer.
    pub fn as_address(&self) -> Option<u64> {
        match self {
            RemoteValue::Int(_) => self.as_u64(),
            RemoteValue::Str(s) => {
                let hex = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
                u64::from_str_radix(hex, 16).ok()
            }
            _ => None,
        }
    }
}

impl From<&str> for RemoteValue {
    fn from(s: &str) -> Self {
        RemoteValue::Str(s.to_string())
    }
}

impl From<String> for RemoteValue {
    fn from(s: String) -> Self {
        RemoteValue::Str(s)
    }
}
