//! Strength reduction on MIR.
//!
//! Local rewrites that trade expensive operations for cheap ones before lowering: additive
//! identities become moves, multiplication by two becomes a shift, off-by-one arithmetic becomes
//! `Inc`/`Dec`, and comparisons against zero become `Test`.

use crate::diagnostic::{Diagnostics, OptRecord};
use crate::entity::SecondaryMap;
use crate::mir::{CondCode, Function, Inst, InstructionData, Module, Opcode, Value};

/// Run strength reduction over every function in the module.
pub fn run(module: &mut Module, diag: &mut Diagnostics) {
    for (_, func) in module.funcs.iter_mut() {
        if func.is_extern {
            continue;
        }
        run_function(func, diag);
    }
}

struct Reduction {
    pos: usize,
    data: InstructionData,
    /// An instruction to splice in immediately before `pos`.
    prelude: Option<Inst>,
    rationale: &'static str,
    saved_tstates: i32,
}

fn run_function(func: &mut Function, diag: &mut Diagnostics) {
    let mut consts: SecondaryMap<Value, Option<i64>> = SecondaryMap::new();
    for &inst in &func.layout {
        if let InstructionData::UnaryImm { imm, .. } = func.insts[inst] {
            if let Some(result) = func.inst_result(inst) {
                consts[result] = Some(imm);
            }
        }
    }

    let mut reductions: Vec<Reduction> = Vec::new();
    let layout_snapshot: Vec<(usize, Inst)> = func.layout_iter().collect();
    for (pos, inst) in layout_snapshot {
        let (opcode, args) = match func.insts[inst] {
            InstructionData::Binary { opcode, args } => (opcode, args),
            InstructionData::IntCompare { cond, args } => {
                // `x == 0` folds into `Test`.
                if cond == CondCode::Eq {
                    let tested = if consts[args[1]] == Some(0) {
                        Some(args[0])
                    } else if consts[args[0]] == Some(0) {
                        Some(args[1])
                    } else {
                        None
                    };
                    if let Some(arg) = tested {
                        reductions.push(Reduction {
                            pos,
                            data: InstructionData::Unary {
                                opcode: Opcode::Test,
                                arg,
                            },
                            prelude: None,
                            rationale: "comparison against zero",
                            saved_tstates: 0,
                        });
                    }
                }
                continue;
            }
            _ => continue,
        };

        let rhs = consts[args[1]];
        let reduction = match (opcode, rhs) {
            (Opcode::Add, Some(0)) | (Opcode::Sub, Some(0)) | (Opcode::Or, Some(0)) => {
                Some((Opcode::Move, "identity operand", 4))
            }
            (Opcode::Add, Some(1)) => Some((Opcode::Inc, "add of one", 3)),
            (Opcode::Sub, Some(1)) => Some((Opcode::Dec, "subtract of one", 3)),
            (Opcode::Mul, Some(1)) | (Opcode::Div, Some(1)) => {
                Some((Opcode::Move, "identity operand", 146))
            }
            (Opcode::Shl, Some(0)) | (Opcode::Shr, Some(0)) => {
                Some((Opcode::Move, "shift by zero", 4))
            }
            _ => None,
        };
        if let Some((unary, rationale, saved)) = reduction {
            reductions.push(Reduction {
                pos,
                data: InstructionData::Unary {
                    opcode: unary,
                    arg: args[0],
                },
                prelude: None,
                rationale,
                saved_tstates: saved,
            });
            continue;
        }

        if opcode == Opcode::Mul && rhs == Some(2) {
            // `x * 2` becomes `x << 1`; the shift amount needs its own constant.
            let ty = func.value_type(args[0]);
            let one = func.insts.push(InstructionData::UnaryImm { imm: 1, ty });
            let one_value = func.make_result(one, ty);
            reductions.push(Reduction {
                pos,
                data: InstructionData::Binary {
                    opcode: Opcode::Shl,
                    args: [args[0], one_value],
                },
                prelude: Some(one),
                rationale: "multiply by two",
                saved_tstates: 134,
            });
        }
    }

    if reductions.is_empty() {
        return;
    }

    // Apply back to front so prelude insertions keep earlier positions valid.
    reductions.sort_unstable_by(|a, b| b.pos.cmp(&a.pos));
    for reduction in reductions {
        let inst = func.layout[reduction.pos];
        let before = func.insts[inst].opcode().to_string();
        let after = reduction.data.opcode().to_string();
        func.insts[inst] = reduction.data;
        if let Some(prelude) = reduction.prelude {
            func.layout.insert(reduction.pos, prelude);
        }
        diag.record(OptRecord {
            pass: "peephole",
            function: func.qualified_name(),
            site: Some(inst.to_string()),
            rationale: reduction.rationale.to_string(),
            before,
            after,
            saved_tstates: reduction.saved_tstates,
            saved_bytes: 0,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::Diagnostics;
    use crate::mir::{FuncName, FunctionBuilder, Signature, Type};

    fn reduce(build: impl FnOnce(&mut FunctionBuilder)) -> (Module, crate::mir::FuncId) {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::new(FuncName::new("m", "f"), {
            let mut sig = Signature::new();
            sig.params.push(crate::mir::AbiParam::new("x", Type::U8));
            sig.ret = Some(Type::U8);
            sig
        });
        build(&mut b);
        let id = module.add_function(b.finish().unwrap());
        let mut diag = Diagnostics::new();
        run(&mut module, &mut diag);
        (module, id)
    }

    #[test]
    fn add_zero_becomes_move() {
        let (module, id) = reduce(|b| {
            let x = b.load_var("x", Type::U8).unwrap();
            let zero = b.load_const(0, Type::U8);
            let sum = b.binary(Opcode::Add, x, zero).unwrap();
            b.ret(Some(sum));
        });
        let func = &module.funcs[id];
        assert_eq!(func.insts[func.layout[2]].opcode(), Opcode::Move);
    }

    #[test]
    fn multiply_by_two_becomes_shift() {
        let (module, id) = reduce(|b| {
            let x = b.load_var("x", Type::U8).unwrap();
            let two = b.load_const(2, Type::U8);
            let doubled = b.binary(Opcode::Mul, x, two).unwrap();
            b.ret(Some(doubled));
        });
        let func = &module.funcs[id];
        // The shift amount is spliced in before the reduced instruction.
        assert_eq!(func.insts[func.layout[2]].opcode(), Opcode::LoadConst);
        match func.insts[func.layout[3]] {
            InstructionData::Binary {
                opcode: Opcode::Shl,
                ..
            } => {}
            ref other => panic!("expected shift, got {:?}", other),
        }
    }

    #[test]
    fn increments_and_decrements() {
        let (module, id) = reduce(|b| {
            let x = b.load_var("x", Type::U8).unwrap();
            let one = b.load_const(1, Type::U8);
            let up = b.binary(Opcode::Add, x, one).unwrap();
            let down = b.binary(Opcode::Sub, up, one).unwrap();
            b.ret(Some(down));
        });
        let func = &module.funcs[id];
        assert_eq!(func.insts[func.layout[2]].opcode(), Opcode::Inc);
        assert_eq!(func.insts[func.layout[3]].opcode(), Opcode::Dec);
    }

    #[test]
    fn compare_zero_becomes_test() {
        let (module, id) = reduce(|b| {
            let x = b.load_var("x", Type::U8).unwrap();
            let zero = b.load_const(0, Type::U8);
            let is_zero = b.cmp(CondCode::Eq, x, zero).unwrap();
            b.store_var("flag", is_zero).unwrap();
            b.ret(Some(x));
        });
        let func = &module.funcs[id];
        assert_eq!(func.insts[func.layout[2]].opcode(), Opcode::Test);
    }
}
