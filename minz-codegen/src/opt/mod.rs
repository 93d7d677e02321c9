//! The MIR optimizer.
//!
//! Passes run in a static phase order. The cheap cleanup passes (copy propagation, constant
//! folding, dead code elimination, strength reduction) iterate to a fixed point under a
//! cycle-weighted cost metric; the structural passes (inlining, tail-call rewriting, reordering)
//! run once, between the cleanup rounds, at the positions the phase order gives them.
//!
//! Each rewrite appends an `OptRecord` to the diagnostics sink, so the verbose mode and the
//! test suite can observe exactly which rewrites fired.

pub mod constant_fold;
pub mod copy_prop;
pub mod dce;
pub mod inline;
pub mod peephole;
pub mod reorder;
pub mod tailcall;

use crate::callconv;
use crate::callgraph;
use crate::diagnostic::{Diagnostics, OptRecord};
use crate::mir::{Function, InstructionData, Module, Opcode, Type};
use crate::regalloc::liveness::Liveness;
use crate::result::CodegenResult;
use crate::settings::{Flags, OptLevel};

/// Iteration bound for the fixed-point cleanup rounds.
const MAX_ROUNDS: u32 = 4;

/// Minimum cost improvement that justifies another round.
const EPSILON: u32 = 1;

/// Estimated execution cost of one instruction, in Z80 T-states.
///
/// The numbers are coarse. They only need to rank rewrites consistently, and they must be
/// deterministic so that repeated optimization of the same input converges identically.
pub fn inst_cost(func: &Function, data: &InstructionData) -> u32 {
    let wide = |ty: Type| !ty.is_byte();
    match *data {
        InstructionData::UnaryImm { ty, .. } => {
            if wide(ty) {
                10
            } else {
                7
            }
        }
        InstructionData::SymbolAddr { .. } => 10,
        InstructionData::Unary { opcode, arg } => match opcode {
            Opcode::Move => 4,
            Opcode::Inc | Opcode::Dec => {
                if wide(func.value_type(arg)) {
                    6
                } else {
                    4
                }
            }
            Opcode::Test => 7,
            _ => 8,
        },
        InstructionData::Binary { opcode, args } => match opcode {
            Opcode::Mul => 150,
            Opcode::Div | Opcode::Mod => 200,
            Opcode::Shl | Opcode::Shr => {
                if wide(func.value_type(args[0])) {
                    16
                } else {
                    8
                }
            }
            _ => {
                if wide(func.value_type(args[0])) {
                    11
                } else {
                    4
                }
            }
        },
        InstructionData::IntCompare { .. } => 7,
        InstructionData::LoadVar { .. } | InstructionData::StoreVar { .. } => 13,
        InstructionData::LoadIndex { .. } | InstructionData::StoreIndex { .. } => 21,
        InstructionData::LoadField { .. } | InstructionData::StoreField { .. } => 19,
        InstructionData::LoadBitField { .. } | InstructionData::StoreBitField { .. } => 30,
        InstructionData::Jump { .. } => 10,
        InstructionData::Branch { .. } | InstructionData::BranchCompare { .. } => 10,
        InstructionData::Call { .. } => 17,
        InstructionData::Return { .. } => 10,
        InstructionData::LabelMark { .. } => 0,
        InstructionData::SmcAnchor { .. } => 0,
        InstructionData::SmcPatch { .. } => 13,
        InstructionData::TsmcLoad { .. } => 13,
        InstructionData::IterBegin { .. } => 7,
        InstructionData::IterStep { .. } => 13,
        InstructionData::IterEnd => 0,
    }
}

/// Estimated execution cost of a whole function.
pub fn function_cost(func: &Function) -> u32 {
    func.layout
        .iter()
        .map(|&inst| inst_cost(func, &func.insts[inst]))
        .sum()
}

/// Estimated execution cost of a whole module.
pub fn module_cost(module: &Module) -> u32 {
    module.funcs.iter().map(|(_, f)| function_cost(f)).sum()
}

/// Run the optimization pipeline over `module` and freeze calling conventions.
///
/// `target_supports_smc` comes from the active backend's capability flags; without it, the
/// TSMC convention is never selected and tail calls rewrite to plain parameter stores.
///
/// A pass that reports an invariant violation aborts for that function and the function is left
/// as the previous pass saw it; see the per-pass entry points.
pub fn optimize(
    module: &mut Module,
    flags: &Flags,
    target_supports_smc: bool,
    diag: &mut Diagnostics,
) -> CodegenResult<()> {
    // Recursion facts are needed even when not optimizing: convention selection depends on
    // them, and the front-end's hints are only hints.
    callgraph::analyze_recursion(module, diag);

    if flags.opt_level >= OptLevel::Basic {
        copy_prop::run(module, diag);

        if flags.opt_level >= OptLevel::Full {
            inline::run(module, flags, diag);
            // Inlining invalidates the call graph; recursion classes are unaffected because
            // recursive callees are never inlined.
        }

        let mut cost = module_cost(module);
        for round in 0..MAX_ROUNDS {
            constant_fold::run(module, diag);
            dce::run(module, diag);
            copy_prop::run(module, diag);
            peephole::run(module, diag);
            let new_cost = module_cost(module);
            log::debug!("cleanup round {}: cost {} -> {}", round, cost, new_cost);
            if cost.saturating_sub(new_cost) < EPSILON {
                break;
            }
            cost = new_cost;
        }

        if flags.opt_level >= OptLevel::Full {
            tailcall::run(module, flags, target_supports_smc, diag);
            dce::run(module, diag);
        }
    }

    callconv::select_conventions(module, flags, target_supports_smc, diag)?;

    // Allocation preparation: compute the liveness skeleton once so pathological functions
    // surface here rather than in the middle of emission.
    for (_, func) in module.funcs.iter() {
        if func.is_extern {
            continue;
        }
        let liveness = Liveness::compute(func);
        diag.record(OptRecord {
            pass: "liveness",
            function: func.qualified_name(),
            site: None,
            rationale: format!("{} live intervals", liveness.intervals().len()),
            before: String::new(),
            after: String::new(),
            saved_tstates: 0,
            saved_bytes: 0,
        });
    }

    if flags.opt_level >= OptLevel::Full {
        reorder::run(module, diag);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{AbiParam, CondCode, FuncName, FunctionBuilder, Signature};

    /// Optimizing an already-optimized module must not change the cost metric.
    #[test]
    fn optimization_is_idempotent() {
        let mut module = Module::new("m");
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("n", Type::U8));
        sig.ret = Some(Type::U16);
        let mut b = FunctionBuilder::new(FuncName::new("m", "f"), sig);
        let entry = b.create_label("entry");
        let done = b.create_label("done");
        b.place_label(entry).unwrap();
        let n = b.load_var("n", Type::U8).unwrap();
        let zero = b.load_const(0, Type::U8);
        b.br_cmp(CondCode::Eq, n, zero, done).unwrap();
        let one = b.load_const(1, Type::U8);
        let m = b.binary(Opcode::Sub, n, one).unwrap();
        b.store_var("n", m).unwrap();
        b.jump(entry);
        b.place_label(done).unwrap();
        let wide = b.load_const(300, Type::U16);
        b.ret(Some(wide));
        module.add_function(b.finish().unwrap());

        let flags = Flags::default();
        let mut diag = Diagnostics::new();
        optimize(&mut module, &flags, true, &mut diag).unwrap();
        let cost_once = module_cost(&module);
        optimize(&mut module, &flags, true, &mut diag).unwrap();
        assert_eq!(module_cost(&module), cost_once);
    }
}
