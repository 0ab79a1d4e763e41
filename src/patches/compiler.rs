//! Patch compiler contract.

use thiserror::Error;

use super::spec::{JmpPatchSpec, NopPatchSpec};

/// Output of a [`PatchCompiler`]: a script ready to be created in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPatch {
    /// Script name, unique per compiler instance.
    pub script_name: String,
    /// Script source text.
    pub source: String,
}

/// Compiler failure (bad pattern, unknown var type, template error...).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CompileError(pub String);

/// Turns declarative patch specs into injectable scripts.
///
/// Generated scripts must export [`RemoteCall::Apply`](crate::RemoteCall::Apply)
/// and [`RemoteCall::Clear`](crate::RemoteCall::Clear), each replying with a bool.
pub trait PatchCompiler: Send + Sync + 'static {
    fn gen_jmp_patch(&self, spec: &JmpPatchSpec) -> Result<CompiledPatch, CompileError>;

    fn gen_nop_patch(&self, spec: &NopPatchSpec) -> Result<CompiledPatch, CompileError>;
}
