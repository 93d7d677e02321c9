//! A compilation context holding the module, the flags, and the diagnostics sink.
//!
//! The context is the owner the whole pipeline borrows from: the optimizer mutates the module
//! in place, the calling-convention selector freezes its signatures, and the backend reads the
//! result. One compilation is strictly serial; given the same module and flags, the produced
//! bytes are identical.

use crate::diagnostic::Diagnostics;
use crate::isa::{self, TargetIsa};
use crate::mir::Module;
use crate::opt;
use crate::result::CodegenResult;
use crate::settings::Flags;
use crate::verifier::verify_module;

/// Persistent state for compiling one module.
pub struct Context {
    /// The module being compiled.
    pub module: Module,
    /// Compilation flags.
    pub flags: Flags,
    /// Structured records of every optimization decision.
    pub diagnostics: Diagnostics,
}

impl Context {
    /// Create a context for `module` with `flags`.
    pub fn new(module: Module, flags: Flags) -> Self {
        Self {
            module,
            flags,
            diagnostics: Diagnostics::new(),
        }
    }

    /// Run the whole pipeline for `isa` and return the assembly text.
    ///
    /// The module is verified before and after optimization; a fatal error leaves no partial
    /// output behind.
    pub fn compile(&mut self, isa: &dyn TargetIsa) -> CodegenResult<String> {
        verify_module(&self.module, &self.flags)?;
        opt::optimize(
            &mut self.module,
            &self.flags,
            isa.capabilities().supports_smc,
            &mut self.diagnostics,
        )?;
        verify_module(&self.module, &self.flags)?;
        log::debug!(
            "optimized {} ({} diagnostics), lowering for {}",
            self.module.name,
            self.diagnostics.len(),
            isa.name()
        );
        isa.compile_module(&self.module, &self.flags, &mut self.diagnostics)
    }

    /// Look up a backend by name and compile for it.
    pub fn compile_for(&mut self, backend: &str) -> CodegenResult<String> {
        let isa = isa::lookup(backend)?;
        self.compile(&*isa)
    }
}
