//! # Declarative patch specifications and the compiler seam.
//!
//! A patch is described declaratively ([`JmpPatchSpec`], [`NopPatchSpec`]) and
//! turned into an injectable script by a [`PatchCompiler`]. The compiler is an
//! external collaborator: patchvisor only needs a unique script name and the
//! script source back.
//!
//! - [`PatchVarSpec`] one runtime-mutable constant embedded in a jmp patch
//! - [`PatchKind`] metadata kept on the [`Patch`](crate::Patch) after creation

mod compiler;
mod spec;

pub use compiler::{CompileError, CompiledPatch, PatchCompiler};
pub use spec::{JmpPatchSpec, NopPatchSpec, PatchKind, PatchVarSpec};
