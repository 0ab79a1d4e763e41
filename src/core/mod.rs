//! Runtime core: sessions, patches and the supervision scope.
//!
//! Internal modules:
//! - [`offload`]: bounded gate in front of the blocking pool;
//! - [`script`] / [`patch`] / [`utility`]: injected scripts and their typed calls;
//! - [`session`]: one attachment with its scripts, patches and facts;
//! - [`registry`]: at most one session per target, detach-driven cleanup;
//! - [`watcher`]: retry-and-cleanup loop for one target;
//! - [`runner`] / [`supervisor`] / [`shutdown`]: running tasks under one shutdown.

mod builder;
mod config;
mod offload;
mod patch;
mod registry;
mod runner;
mod script;
mod session;
mod shutdown;
mod supervisor;
mod utility;
mod watcher;

pub use builder::SupervisorBuilder;
pub use config::Config;
pub use offload::Offload;
pub use patch::{Patch, PatchGuard, PatchInfo};
pub use registry::Registry;
pub use script::{Script, ScriptInfo};
pub use session::{Session, SessionInfo};
pub use supervisor::Supervisor;
pub use utility::{ModuleInfo, ScanMatch, SessionFacts, ThreadInfo, UtilityClient};
pub use watcher::{DefaultPatches, SessionSetup, TargetWatcher, WatchState};
