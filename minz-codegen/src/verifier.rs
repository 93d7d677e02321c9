//! A verifier for the structural invariants of MIR.
//!
//! The builder rejects most malformed constructions up front; the verifier re-checks the same
//! properties over whole functions and modules, so that the optimizer can be audited after each
//! pass in debug builds and the reader's output can be validated before compilation starts.
//!
//! Checked per function:
//!
//! - every branch targets a label of this function, placed exactly once;
//! - every value has exactly one defining instruction, placed above all uses;
//! - named storage accesses carry a non-empty symbol;
//! - SMC anchors and loads reference valid parameter indices.
//!
//! Checked per module:
//!
//! - `SmcPatch` targets an existing function and a valid parameter, and (once conventions are
//!   frozen) only a TSMC callee;
//! - a function frozen as TSMC is within the structural limits and not ROM-resident.

use crate::callconv::{tsmc_limits_ok, CallConv};
use crate::entity::SecondaryMap;
use crate::mir::{Function, InstructionData, Module, Value};
use crate::result::{CodegenError, CodegenResult, InvariantCode};
use crate::settings::Flags;

/// Verify a single function's local invariants.
pub fn verify_function(func: &Function) -> CodegenResult<()> {
    let context = |site: &str| format!("{} {}", func.qualified_name(), site);

    // Label placement counts.
    let mut placements: SecondaryMap<crate::mir::Label, u32> = SecondaryMap::new();
    for &inst in &func.layout {
        if let InstructionData::LabelMark { label } = func.insts[inst] {
            if func.labels.get(label).is_none() {
                return Err(CodegenError::invariant(
                    InvariantCode::ForeignLabel,
                    context(&format!("{}", inst)),
                ));
            }
            placements[label] += 1;
        }
    }
    for (label, _) in func.labels.iter() {
        if placements[label] > 1 {
            return Err(CodegenError::invariant(
                InvariantCode::DuplicateLabel,
                context(&func.labels[label].name),
            ));
        }
    }

    let mut defined: SecondaryMap<Value, bool> = SecondaryMap::new();
    let mut seen_def: SecondaryMap<Value, bool> = SecondaryMap::new();

    for (pos, inst) in func.layout_iter() {
        let data = &func.insts[inst];

        if let Some(label) = data.branch_destination() {
            if func.labels.get(label).is_none() {
                return Err(CodegenError::invariant(
                    InvariantCode::ForeignLabel,
                    context(&format!("{}", inst)),
                ));
            }
            if func.label_position(label).is_none() {
                return Err(CodegenError::invariant(
                    InvariantCode::UnplacedLabel,
                    context(&func.labels[label].name),
                ));
            }
        }

        if let Some(symbol) = data.touched_symbol() {
            if symbol.is_empty() {
                return Err(CodegenError::invariant(
                    InvariantCode::EmptySymbol,
                    context(&format!("{} at position {}", data.opcode(), pos)),
                ));
            }
        }

        match *data {
            InstructionData::SmcAnchor { param } | InstructionData::TsmcLoad { param } => {
                if (param as usize) >= func.signature.params.len() {
                    return Err(CodegenError::invariant(
                        InvariantCode::BadParamIndex,
                        context(&format!("{}", inst)),
                    ));
                }
            }
            _ => {}
        }

        for arg in data.arguments() {
            if func.values.get(arg).is_none() {
                return Err(CodegenError::invariant(
                    InvariantCode::UseBeforeDef,
                    context(&format!("{} in {}", arg, inst)),
                ));
            }
            if !defined[arg] {
                return Err(CodegenError::invariant(
                    InvariantCode::UseBeforeDef,
                    context(&format!("{} in {}", arg, inst)),
                ));
            }
        }

        if let Some(result) = func.inst_result(inst) {
            if seen_def[result] || func.value_def(result) != Some(inst) {
                return Err(CodegenError::invariant(
                    InvariantCode::MultipleDefinition,
                    context(&format!("{}", result)),
                ));
            }
            seen_def[result] = true;
            defined[result] = true;
        }
    }

    Ok(())
}

/// Verify every function in `module`, plus the cross-function SMC invariants.
pub fn verify_module(module: &Module, flags: &Flags) -> CodegenResult<()> {
    for (_, func) in module.funcs.iter() {
        if func.is_extern {
            continue;
        }
        verify_function(func)?;

        if func.signature.conv == Some(CallConv::Tsmc) && !tsmc_limits_ok(func, flags) {
            return Err(CodegenError::invariant(
                InvariantCode::TsmcLimits,
                func.qualified_name(),
            ));
        }

        for &inst in &func.layout {
            if let InstructionData::SmcPatch {
                func: ref callee,
                param,
                ..
            } = func.insts[inst]
            {
                let callee_id = module.find_function(callee).ok_or_else(|| {
                    CodegenError::invariant(
                        InvariantCode::AnchorMismatch,
                        format!("{}: unknown callee {}", func.qualified_name(), callee),
                    )
                })?;
                let callee_func = &module.funcs[callee_id];
                if (param as usize) >= callee_func.signature.params.len() {
                    return Err(CodegenError::invariant(
                        InvariantCode::BadParamIndex,
                        format!("{}: patch into {}", func.qualified_name(), callee),
                    ));
                }
                if let Some(conv) = callee_func.signature.conv {
                    if conv != CallConv::Tsmc {
                        return Err(CodegenError::invariant(
                            InvariantCode::AnchorMismatch,
                            format!(
                                "{}: patch into non-SMC callee {}",
                                func.qualified_name(),
                                callee
                            ),
                        ));
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{AbiParam, FuncName, FunctionBuilder, Signature, Type};

    fn small_func() -> Function {
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("n", Type::U8));
        sig.ret = Some(Type::U8);
        let mut b = FunctionBuilder::new(FuncName::new("m", "f"), sig);
        let v = b.load_var("n", Type::U8).unwrap();
        b.ret(Some(v));
        b.finish().unwrap()
    }

    #[test]
    fn well_formed_function_passes() {
        assert!(verify_function(&small_func()).is_ok());
    }

    #[test]
    fn use_before_def_is_caught() {
        let mut func = small_func();
        // Move the return above the load.
        func.layout.swap(0, 1);
        assert!(matches!(
            verify_function(&func),
            Err(CodegenError::Invariant {
                code: InvariantCode::UseBeforeDef,
                ..
            })
        ));
    }

    #[test]
    fn patch_into_register_callee_is_rejected() {
        let mut module = Module::new("m");
        let mut callee = small_func();
        callee.signature.conv = Some(CallConv::Register);
        module.add_function(callee);

        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("x", Type::U8));
        let mut b = FunctionBuilder::new(FuncName::new("m", "g"), sig);
        let v = b.load_var("x", Type::U8).unwrap();
        b.smc_patch("m.f", 0, v).unwrap();
        b.ret(None);
        module.add_function(b.finish().unwrap());

        assert!(matches!(
            verify_module(&module, &Flags::default()),
            Err(CodegenError::Invariant {
                code: InvariantCode::AnchorMismatch,
                ..
            })
        ));
    }
}
