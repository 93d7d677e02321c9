//! Calling convention identifiers and the per-function selection rules.
//!
//! Exactly one convention is selected per function, after optimization has settled recursion
//! facts, and frozen from then on. The decision table lives in `select_conventions`; backends
//! that lack SMC support see TSMC downgraded before they run.

use crate::diagnostic::{Diagnostics, OptRecord};
use crate::mir::{Function, Module, Signature, Type};
use crate::result::{CodegenError, CodegenResult};
use crate::settings::{Flags, OptLevel};
use core::fmt;
use core::str;

/// Calling convention identifiers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CallConv {
    /// Parameters in registers, result in A or HL. Preferred for small leaf signatures.
    Register,
    /// True SMC: parameters patched into labeled immediates in the callee's body.
    Tsmc,
    /// IX-based stack frame. The universal fallback, and mandatory in ROM.
    StackFrame,
}

impl CallConv {
    /// Does this convention require writable code memory?
    pub fn needs_ram_code(self) -> bool {
        self == CallConv::Tsmc
    }
}

impl fmt::Display for CallConv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            CallConv::Register => "register",
            CallConv::Tsmc => "smc",
            CallConv::StackFrame => "stack",
        })
    }
}

impl str::FromStr for CallConv {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "register" => Ok(CallConv::Register),
            "smc" | "tsmc" => Ok(CallConv::Tsmc),
            "stack" => Ok(CallConv::StackFrame),
            _ => Err(()),
        }
    }
}

/// The convention a signature's shape alone selects: registers for small signatures, the
/// stack frame otherwise.
///
/// This is the width half of the decision table. Call sites use it for externally defined and
/// unresolved callees, which never pass through `select_conventions`; without it a wide extern
/// would be called as if its parameters fit the register budget.
pub fn default_for_signature(sig: &Signature) -> CallConv {
    let params = &sig.params;
    if params.is_empty() {
        return CallConv::Register;
    }
    let total_bytes: u16 = params
        .iter()
        .map(|p| if p.ty.is_byte() { 1 } else { 2 })
        .sum();
    if params.len() <= 3 && total_bytes <= 4 {
        CallConv::Register
    } else {
        CallConv::StackFrame
    }
}

/// Is `func` within the structural limits of the TSMC convention?
///
/// At most 3 scalar parameters of at most 2 bytes each, 6 bytes total, never in ROM.
/// Reference parameters only qualify under the experimental flag.
pub fn tsmc_limits_ok(func: &Function, flags: &Flags) -> bool {
    if func.in_rom || func.signature.params.len() > 3 {
        return false;
    }
    let mut total = 0;
    for param in &func.signature.params {
        let size = match param.ty {
            Type::U8 | Type::I8 | Type::Bool => 1,
            Type::U16 | Type::I16 => 2,
            Type::Ref => {
                if !flags.experimental_ref_tsmc {
                    return false;
                }
                2
            }
            _ => return false,
        };
        total += size;
    }
    total <= 6
}

/// Would the selection table pick TSMC for `func`?
///
/// Shared with the tail-call rewrite, which runs before selection but must know whether the
/// rewritten self-call will patch anchors or store parameters.
pub fn would_use_tsmc(func: &Function, flags: &Flags, target_supports_smc: bool) -> bool {
    if let Some(forced) = func.forced_conv {
        return forced == CallConv::Tsmc && target_supports_smc && tsmc_limits_ok(func, flags);
    }
    target_supports_smc
        && flags.enable_smc
        && flags.opt_level >= OptLevel::Full
        && func.is_recursive()
        && tsmc_limits_ok(func, flags)
}

/// Select and freeze a calling convention for every function in the module.
///
/// Runs after recursion detection. A forced `smc` on a ROM-resident function is an
/// `AbiConflict`; an unsupported forced choice on the active target downgrades to the inferred
/// convention with a diagnostic.
pub fn select_conventions(
    module: &mut Module,
    flags: &Flags,
    target_supports_smc: bool,
    diag: &mut Diagnostics,
) -> CodegenResult<()> {
    let mut selections = Vec::new();
    for (id, func) in module.funcs.iter() {
        if func.is_extern {
            continue;
        }
        let conv = select_one(func, flags, target_supports_smc)?;
        selections.push((id, conv));
    }

    for (id, conv) in selections {
        let func = &mut module.funcs[id];
        func.signature.conv = Some(conv);
        func.smc_anchors.clear();
        if conv == CallConv::Tsmc {
            for param in &func.signature.params {
                func.smc_anchors
                    .insert(param.name.clone(), format!("{}$imm0", param.name));
            }
        }
        diag.record(OptRecord {
            pass: "callconv",
            function: func.qualified_name(),
            site: None,
            rationale: rationale_for(func, conv),
            before: String::new(),
            after: conv.to_string(),
            saved_tstates: 0,
            saved_bytes: 0,
        });
        log::debug!("{}: calling convention {}", func.qualified_name(), conv);
    }
    Ok(())
}

fn select_one(
    func: &Function,
    flags: &Flags,
    target_supports_smc: bool,
) -> CodegenResult<CallConv> {
    if let Some(forced) = func.forced_conv {
        if forced == CallConv::Tsmc {
            if func.in_rom {
                return Err(CodegenError::AbiConflict {
                    function: func.qualified_name(),
                    reason: "smc convention requested for ROM-resident code".to_string(),
                });
            }
            if !target_supports_smc || !tsmc_limits_ok(func, flags) {
                // Downgrade an unsupported forced choice to the inferred one.
                return select_inferred(func, flags, target_supports_smc);
            }
        }
        return Ok(forced);
    }
    select_inferred(func, flags, target_supports_smc)
}

fn select_inferred(
    func: &Function,
    flags: &Flags,
    target_supports_smc: bool,
) -> CodegenResult<CallConv> {
    if func.in_rom {
        return Ok(CallConv::StackFrame);
    }
    if would_use_tsmc(func, flags, target_supports_smc) {
        return Ok(CallConv::Tsmc);
    }
    Ok(default_for_signature(&func.signature))
}

fn rationale_for(func: &Function, conv: CallConv) -> String {
    match conv {
        CallConv::Tsmc => format!(
            "recursive with {} small parameters; immediate reads amortize patching",
            func.signature.params.len()
        ),
        CallConv::Register => "small signature fits the register convention".to_string(),
        CallConv::StackFrame => {
            if func.in_rom {
                "ROM-resident code must not self-modify".to_string()
            } else {
                "signature too wide for registers".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{AbiParam, FuncName, Recursion, Signature};

    fn func_with_params(params: Vec<AbiParam>) -> Function {
        let mut sig = Signature::new();
        sig.params = params;
        Function::with_name_signature(FuncName::new("m", "f"), sig)
    }

    fn full_flags() -> Flags {
        Flags::builder().opt_level(OptLevel::Full).build()
    }

    #[test]
    fn conv_round_trip() {
        for conv in [CallConv::Register, CallConv::Tsmc, CallConv::StackFrame] {
            assert_eq!(conv.to_string().parse::<CallConv>(), Ok(conv));
        }
        assert_eq!("tsmc".parse::<CallConv>(), Ok(CallConv::Tsmc));
        assert!("fastcall".parse::<CallConv>().is_err());
    }

    #[test]
    fn zero_params_take_registers() {
        let func = func_with_params(vec![]);
        assert_eq!(
            select_one(&func, &full_flags(), true).unwrap(),
            CallConv::Register
        );
    }

    #[test]
    fn recursive_small_signature_takes_tsmc() {
        let mut func = func_with_params(vec![
            AbiParam::new("n", Type::U8),
            AbiParam::new("acc", Type::U16),
        ]);
        func.recursion = Recursion::Direct;
        assert_eq!(
            select_one(&func, &full_flags(), true).unwrap(),
            CallConv::Tsmc
        );
        // Without optimization the same function stays off SMC.
        let flags = Flags::builder().opt_level(OptLevel::None).build();
        assert_ne!(select_one(&func, &flags, true).unwrap(), CallConv::Tsmc);
        // A target without SMC support downgrades too.
        assert_ne!(
            select_one(&func, &full_flags(), false).unwrap(),
            CallConv::Tsmc
        );
    }

    #[test]
    fn rom_forces_stack_frame() {
        let mut func = func_with_params(vec![AbiParam::new("n", Type::U8)]);
        func.recursion = Recursion::Direct;
        func.in_rom = true;
        assert_eq!(
            select_one(&func, &full_flags(), true).unwrap(),
            CallConv::StackFrame
        );
    }

    #[test]
    fn forced_smc_in_rom_is_a_conflict() {
        let mut func = func_with_params(vec![AbiParam::new("n", Type::U8)]);
        func.in_rom = true;
        func.forced_conv = Some(CallConv::Tsmc);
        assert!(matches!(
            select_one(&func, &full_flags(), true),
            Err(CodegenError::AbiConflict { .. })
        ));
    }

    #[test]
    fn signature_shape_alone_routes_wide_callees_to_the_stack() {
        let mut sig = Signature::new();
        for name in ["a", "b", "c", "d"] {
            sig.params.push(AbiParam::new(name, Type::U8));
        }
        // Four parameters overflow the register budget even at four total bytes.
        assert_eq!(default_for_signature(&sig), CallConv::StackFrame);

        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("n", Type::U16));
        sig.params.push(AbiParam::new("m", Type::U16));
        assert_eq!(default_for_signature(&sig), CallConv::Register);

        sig.params.push(AbiParam::new("o", Type::U16));
        assert_eq!(default_for_signature(&sig), CallConv::StackFrame);
    }

    #[test]
    fn wide_signatures_fall_back_to_stack() {
        let func = func_with_params(vec![
            AbiParam::new("a", Type::U16),
            AbiParam::new("b", Type::U16),
            AbiParam::new("c", Type::U16),
        ]);
        assert_eq!(
            select_one(&func, &full_flags(), true).unwrap(),
            CallConv::StackFrame
        );
    }

    #[test]
    fn ref_params_need_the_experimental_flag() {
        let mut func = func_with_params(vec![AbiParam::new("p", Type::Ref)]);
        func.recursion = Recursion::Direct;
        assert!(!would_use_tsmc(&func, &full_flags(), true));
        let flags = Flags::builder()
            .opt_level(OptLevel::Full)
            .experimental_ref_tsmc(true)
            .build();
        assert!(would_use_tsmc(&func, &flags, true));
    }
}
