//! Patch specifications.
//!
//! ## Example
//! ```rust
//! use patchvisor::{JmpPatchSpec, PatchVarSpec};
//!
//! let spec = JmpPatchSpec::new("anti_fog", "rwr_game.exe", "D9 44 24 08 D9 59 4C")
//!     .with_var(PatchVarSpec::new("range", "float", 4, "600.0"))
//!     .with_var(PatchVarSpec::new("offset", "float", 4, "-100.0"))
//!     .with_patch_size(32)
//!     .with_return_offset(14)
//!     .with_write_callback("cw.flush();");
//!
//! assert_eq!(spec.vars.len(), 2);
//! assert!(!spec.relocate);
//! ```

use std::borrow::Cow;

/// One runtime-mutable constant embedded in a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchVarSpec {
    /// Variable name, unique within the patch.
    pub name: Cow<'static, str>,
    /// Semantic type tag understood by the compiler (`"float"`, `"u32"`, ...).
    pub ty: Cow<'static, str>,
    /// Size in bytes.
    pub size: usize,
    /// Initial value as a source literal.
    pub initial: Cow<'static, str>,
}

impl PatchVarSpec {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        ty: impl Into<Cow<'static, str>>,
        size: usize,
        initial: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            size,
            initial: initial.into(),
        }
    }
}

/// Jump-to-trampoline patch: redirects the located code to freshly written code
/// that returns to `return_offset` bytes past the patch point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JmpPatchSpec {
    /// Logical name the session files the patch under.
    pub name: String,
    /// Module whose memory is scanned for `pattern`.
    pub module: String,
    /// Byte pattern locating the patch point (`"D9 44 ?? 08"`).
    pub pattern: String,
    /// Variables the patch allocates and initialises.
    pub vars: Vec<PatchVarSpec>,
    /// Relocate the overwritten instructions into the trampoline.
    pub relocate: bool,
    /// Bytes allocated for the trampoline.
    pub patch_size: usize,
    /// Return offset from the patch point.
    pub return_offset: usize,
    /// Code-writer body inserted into the trampoline.
    pub write_callback: String,
}

impl JmpPatchSpec {
    /// Creates a spec with no vars, no relocation and zero sizes.
    pub fn new(
        name: impl Into<String>,
        module: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            pattern: pattern.into(),
            vars: Vec::new(),
            relocate: false,
            patch_size: 0,
            return_offset: 0,
            write_callback: String::new(),
        }
    }

    pub fn with_var(mut self, var: PatchVarSpec) -> Self {
        self.vars.push(var);
        self
    }

    pub fn with_relocate(mut self, relocate: bool) -> Self {
        self.relocate = relocate;
        self
    }

    pub fn with_patch_size(mut self, size: usize) -> Self {
        self.patch_size = size;
        self
    }

    pub fn with_return_offset(mut self, offset: usize) -> Self {
        self.return_offset = offset;
        self
    }

    pub fn with_write_callback(mut self, code: impl Into<String>) -> Self {
        self.write_callback = code.into();
        self
    }
}

/// Nop patch: overwrites `length` bytes at `offset` past the patch point with nops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NopPatchSpec {
    pub name: String,
    pub module: String,
    pub pattern: String,
    pub offset: usize,
    pub length: usize,
}

impl NopPatchSpec {
    pub fn new(
        name: impl Into<String>,
        module: impl Into<String>,
        pattern: impl Into<String>,
        offset: usize,
        length: usize,
    ) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            pattern: pattern.into(),
            offset,
            length,
        }
    }
}

/// Compiler-facing metadata kept on a created patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchKind {
    Jmp {
        module: String,
        pattern: String,
        vars: Vec<PatchVarSpec>,
        relocate: bool,
        patch_size: usize,
        return_offset: usize,
    },
    Nop {
        module: String,
        pattern: String,
        offset: usize,
        length: usize,
    },
}

impl PatchKind {
    pub fn module(&self) -> &str {
        match self {
            PatchKind::Jmp { module, .. } | PatchKind::Nop { module, .. } => module,
        }
    }

    pub fn pattern(&self) -> &str {
        match self {
            PatchKind::Jmp { pattern, .. } | PatchKind::Nop { pattern, .. } => pattern,
        }
    }

    /// `"jmp"` or `"nop"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchKind::Jmp { .. } => "jmp",
            PatchKind::Nop { .. } => "nop",
        }
    }
}

impl From<&JmpPatchSpec> for PatchKind {
    fn from(spec: &JmpPatchSpec) -> Self {
        PatchKind::Jmp {
            module: spec.module.clone(),
            pattern: spec.pattern.clone(),
            vars: spec.vars.clone(),
            relocate: spec.relocate,
            patch_size: spec.patch_size,
            return_offset: spec.return_offset,
        }
    }
}

impl From<&NopPatchSpec> for PatchKind {
    fn from(spec: &NopPatchSpec) -> Self {
        PatchKind::Nop {
            module: spec.module.clone(),
            pattern: spec.pattern.clone(),
            offset: spec.offset,
            length: spec.length,
        }
    }
}
