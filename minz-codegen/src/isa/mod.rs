//! Target backend support.
//!
//! Every backend implements the `TargetIsa` trait: a name, a file extension, a set of
//! capability flags, and a lowering entry point from an optimized MIR module to assembly text.
//! Backends are looked up by name in a static registry; the calling-convention selector
//! consults the capability flags, so a target without SMC support silently downgrades TSMC
//! rather than emitting code it cannot honor.

pub mod cback;
pub mod i8080;
pub mod llvm;
pub mod m68k;
pub mod mos6502;
pub mod sm83;
pub mod wasm;
pub mod z80;

use crate::diagnostic::Diagnostics;
use crate::mir::Module;
use crate::result::{CodegenError, CodegenResult};
use crate::settings::Flags;
use core::fmt;

/// Feature flags a backend declares.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// Code may patch its own immediates; SMC conventions are usable.
    pub supports_smc: bool,
    /// An alternate register bank exists (`EXX` on the Z80).
    pub shadow_registers: bool,
    /// Indexed addressing (`IX+d` style) exists.
    pub indexed_addressing: bool,
    /// 16-bit arithmetic is native rather than synthesized.
    pub native_16bit: bool,
}

/// Methods that all target backends provide.
pub trait TargetIsa {
    /// The backend name used for lookup, e.g. `"z80"`.
    fn name(&self) -> &'static str;

    /// File extension of the produced artifact, without the dot.
    fn extension(&self) -> &'static str;

    /// The backend's capability flags.
    fn capabilities(&self) -> Capabilities;

    /// Default base address for the fixed low-memory register tier.
    fn default_lowmem(&self) -> u16;

    /// Lower an optimized module to assembly text.
    fn compile_module(
        &self,
        module: &Module,
        flags: &Flags,
        diag: &mut Diagnostics,
    ) -> CodegenResult<String>;
}

impl fmt::Debug for dyn TargetIsa {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TargetIsa {{ {} }}", self.name())
    }
}

/// Names of all registered backends, in lookup order.
pub const BACKEND_NAMES: [&str; 8] = [
    "z80", "6502", "8080", "68000", "sm83", "c", "llvm", "wasm",
];

/// Look up a backend by name.
pub fn lookup(name: &str) -> CodegenResult<Box<dyn TargetIsa>> {
    match name {
        "z80" => Ok(Box::new(z80::Z80Backend)),
        "6502" => Ok(Box::new(mos6502::Mos6502Backend)),
        "8080" => Ok(Box::new(i8080::I8080Backend)),
        "68000" | "m68k" => Ok(Box::new(m68k::M68kBackend)),
        "sm83" | "gb" => Ok(Box::new(sm83::Sm83Backend)),
        "c" => Ok(Box::new(cback::CBackend)),
        "llvm" => Ok(Box::new(llvm::LlvmBackend)),
        "wasm" => Ok(Box::new(wasm::WasmBackend)),
        _ => Err(CodegenError::BackendUnavailable(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name_and_alias() {
        assert_eq!(lookup("z80").unwrap().name(), "z80");
        assert_eq!(lookup("gb").unwrap().name(), "sm83");
        assert!(matches!(
            lookup("pdp11"),
            Err(CodegenError::BackendUnavailable(_))
        ));
    }

    #[test]
    fn capability_flags_gate_smc() {
        assert!(lookup("z80").unwrap().capabilities().supports_smc);
        assert!(!lookup("wasm").unwrap().capabilities().supports_smc);
        assert!(!lookup("sm83").unwrap().capabilities().shadow_registers);
    }

    #[test]
    fn every_backend_is_registered() {
        for name in BACKEND_NAMES {
            let isa = lookup(name).unwrap();
            assert_eq!(isa.name(), name);
            assert!(!isa.extension().is_empty());
        }
    }
}
