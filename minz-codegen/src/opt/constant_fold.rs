//! Constant folding.
//!
//! Folds arithmetic whose operands are all `LoadConst` results, evaluates constant comparisons,
//! and resolves branches on constant conditions. Arithmetic wraps to the instruction type's
//! width; signed comparisons sign-extend before evaluating. Division by a constant zero is left
//! alone for the target to trap or wrap as it sees fit.

use crate::diagnostic::{Diagnostics, OptRecord};
use crate::entity::SecondaryMap;
use crate::mir::{Function, InstructionData, Module, Opcode, Type, Value};

/// Run constant folding over every function in the module.
pub fn run(module: &mut Module, diag: &mut Diagnostics) {
    for (_, func) in module.funcs.iter_mut() {
        if func.is_extern {
            continue;
        }
        run_function(func, diag);
    }
}

fn mask(value: i64, ty: Type) -> i64 {
    match ty.mask() {
        Some(m) => value & m,
        None => value,
    }
}

fn to_signed(value: i64, ty: Type) -> i64 {
    match ty {
        Type::I8 => value as u8 as i8 as i64,
        Type::I16 => value as u16 as i16 as i64,
        _ => value,
    }
}

fn fold_binary(opcode: Opcode, lhs: i64, rhs: i64, ty: Type) -> Option<i64> {
    let folded = match opcode {
        Opcode::Add => lhs.wrapping_add(rhs),
        Opcode::Sub => lhs.wrapping_sub(rhs),
        Opcode::Mul => lhs.wrapping_mul(rhs),
        Opcode::Div => {
            if rhs == 0 {
                return None;
            }
            lhs / rhs
        }
        Opcode::Mod => {
            if rhs == 0 {
                return None;
            }
            lhs % rhs
        }
        Opcode::And => lhs & rhs,
        Opcode::Or => lhs | rhs,
        Opcode::Xor => lhs ^ rhs,
        Opcode::Shl => lhs.wrapping_shl((rhs & 15) as u32),
        Opcode::Shr => mask(lhs, ty).wrapping_shr((rhs & 15) as u32),
        _ => return None,
    };
    Some(mask(folded, ty))
}

fn fold_unary(opcode: Opcode, value: i64, ty: Type) -> Option<i64> {
    let folded = match opcode {
        Opcode::Move => value,
        Opcode::Not => !value,
        Opcode::Neg => value.wrapping_neg(),
        Opcode::Inc => value.wrapping_add(1),
        Opcode::Dec => value.wrapping_sub(1),
        Opcode::Test => return Some((mask(value, ty) == 0) as i64),
        _ => return None,
    };
    Some(mask(folded, ty))
}

enum Rewrite {
    Replace(InstructionData),
    DropBranch,
}

fn run_function(func: &mut Function, diag: &mut Diagnostics) {
    let mut consts: SecondaryMap<Value, Option<i64>> = SecondaryMap::new();
    let mut rewrites: Vec<(usize, Rewrite, &'static str)> = Vec::new();

    for (pos, inst) in func.layout_iter() {
        let data = func.insts[inst].clone();
        let result = func.inst_result(inst);
        match data {
            InstructionData::UnaryImm { imm, ty } => {
                if let Some(result) = result {
                    consts[result] = Some(mask(imm, ty));
                }
            }
            InstructionData::Unary { opcode, arg } => {
                let result = match result {
                    Some(r) => r,
                    None => continue,
                };
                let ty = func.value_type(result);
                if let Some(value) = consts[arg] {
                    if let Some(folded) = fold_unary(opcode, value, ty) {
                        consts[result] = Some(folded);
                        rewrites.push((
                            pos,
                            Rewrite::Replace(InstructionData::UnaryImm { imm: folded, ty }),
                            "unary on constant",
                        ));
                    }
                }
            }
            InstructionData::Binary { opcode, args } => {
                let result = match result {
                    Some(r) => r,
                    None => continue,
                };
                let ty = func.value_type(result);
                if let (Some(lhs), Some(rhs)) = (consts[args[0]], consts[args[1]]) {
                    if let Some(folded) = fold_binary(opcode, lhs, rhs, ty) {
                        consts[result] = Some(folded);
                        rewrites.push((
                            pos,
                            Rewrite::Replace(InstructionData::UnaryImm { imm: folded, ty }),
                            "arithmetic on constants",
                        ));
                    }
                }
            }
            InstructionData::IntCompare { cond, args } => {
                let result = match result {
                    Some(r) => r,
                    None => continue,
                };
                if let (Some(lhs), Some(rhs)) = (consts[args[0]], consts[args[1]]) {
                    let ty = func.value_type(args[0]);
                    let taken = cond.eval(to_signed(lhs, ty), to_signed(rhs, ty));
                    consts[result] = Some(taken as i64);
                    rewrites.push((
                        pos,
                        Rewrite::Replace(InstructionData::UnaryImm {
                            imm: taken as i64,
                            ty: Type::Bool,
                        }),
                        "comparison of constants",
                    ));
                }
            }
            InstructionData::Branch {
                opcode,
                arg,
                destination,
            } => {
                if let Some(value) = consts[arg] {
                    let taken = match opcode {
                        Opcode::JumpIfZero => value == 0,
                        Opcode::JumpIfNotZero => value != 0,
                        _ => unreachable!(),
                    };
                    if taken {
                        rewrites.push((
                            pos,
                            Rewrite::Replace(InstructionData::Jump { destination }),
                            "branch always taken",
                        ));
                    } else {
                        rewrites.push((pos, Rewrite::DropBranch, "branch never taken"));
                    }
                }
            }
            InstructionData::BranchCompare {
                cond,
                args,
                destination,
            } => {
                if let (Some(lhs), Some(rhs)) = (consts[args[0]], consts[args[1]]) {
                    let ty = func.value_type(args[0]);
                    if cond.eval(to_signed(lhs, ty), to_signed(rhs, ty)) {
                        rewrites.push((
                            pos,
                            Rewrite::Replace(InstructionData::Jump { destination }),
                            "comparison branch always taken",
                        ));
                    } else {
                        rewrites.push((pos, Rewrite::DropBranch, "comparison branch never taken"));
                    }
                }
            }
            _ => {}
        }
    }

    if rewrites.is_empty() {
        return;
    }

    let mut dropped = Vec::new();
    for (pos, rewrite, rationale) in rewrites {
        let inst = func.layout[pos];
        let before = func.insts[inst].opcode().to_string();
        match rewrite {
            Rewrite::Replace(data) => {
                let after = data.opcode().to_string();
                let saved =
                    super::inst_cost(func, &func.insts[inst]) as i32 - super::inst_cost(func, &data) as i32;
                func.insts[inst] = data;
                diag.record(OptRecord {
                    pass: "fold",
                    function: func.qualified_name(),
                    site: Some(inst.to_string()),
                    rationale: rationale.to_string(),
                    before,
                    after,
                    saved_tstates: saved,
                    saved_bytes: 0,
                });
            }
            Rewrite::DropBranch => {
                dropped.push(pos);
                diag.record(OptRecord {
                    pass: "fold",
                    function: func.qualified_name(),
                    site: Some(inst.to_string()),
                    rationale: rationale.to_string(),
                    before,
                    after: String::new(),
                    saved_tstates: 10,
                    saved_bytes: 3,
                });
            }
        }
    }

    // Drop never-taken branches, highest position first so indices stay valid.
    dropped.sort_unstable_by(|a, b| b.cmp(a));
    for pos in dropped {
        func.layout.remove(pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::Diagnostics;
    use crate::mir::{FuncName, FunctionBuilder, Signature};

    fn fold_one(build: impl FnOnce(&mut FunctionBuilder)) -> (Module, crate::mir::FuncId, Diagnostics) {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::new(FuncName::new("m", "f"), {
            let mut sig = Signature::new();
            sig.ret = Some(Type::U8);
            sig
        });
        build(&mut b);
        let id = module.add_function(b.finish().unwrap());
        let mut diag = Diagnostics::new();
        run(&mut module, &mut diag);
        (module, id, diag)
    }

    #[test]
    fn adds_fold_and_wrap() {
        let (module, id, diag) = fold_one(|b| {
            let x = b.load_const(200, Type::U8);
            let y = b.load_const(100, Type::U8);
            let sum = b.binary(Opcode::Add, x, y).unwrap();
            b.ret(Some(sum));
        });
        let func = &module.funcs[id];
        let folded = func.layout[2];
        assert_eq!(
            func.insts[folded],
            InstructionData::UnaryImm {
                imm: 44,
                ty: Type::U8
            }
        );
        assert_eq!(diag.by_pass("fold").count(), 1);
    }

    #[test]
    fn folding_propagates_through_moves() {
        let (module, id, _) = fold_one(|b| {
            let x = b.load_const(6, Type::U8);
            let m = b.unary(Opcode::Move, x).unwrap();
            let y = b.load_const(7, Type::U8);
            let product = b.binary(Opcode::Mul, m, y).unwrap();
            b.ret(Some(product));
        });
        let func = &module.funcs[id];
        let folded = func.layout[3];
        assert_eq!(
            func.insts[folded],
            InstructionData::UnaryImm {
                imm: 42,
                ty: Type::U8
            }
        );
    }

    #[test]
    fn never_taken_branch_disappears() {
        let (module, id, _) = fold_one(|b| {
            let zero = b.load_const(0, Type::U8);
            let out = b.create_label("out");
            b.brnz(zero, out);
            b.place_label(out).unwrap();
            b.ret(Some(zero));
        });
        let func = &module.funcs[id];
        assert!(func
            .layout
            .iter()
            .all(|&inst| !func.insts[inst].opcode().is_branch()));
    }

    #[test]
    fn signed_compare_sign_extends() {
        let (module, id, _) = fold_one(|b| {
            let neg = b.load_const(-1, Type::I8);
            let zero = b.load_const(0, Type::I8);
            let lt = b.cmp(CondCode::Lt, neg, zero).unwrap();
            // Keep the comparison alive.
            b.store_var("flag", lt).unwrap();
            b.ret(Some(neg));
        });
        let func = &module.funcs[id];
        let folded = func.layout[2];
        assert_eq!(
            func.insts[folded],
            InstructionData::UnaryImm {
                imm: 1,
                ty: Type::Bool
            }
        );
    }

    #[test]
    fn division_by_zero_is_left_alone() {
        let (module, id, _) = fold_one(|b| {
            let x = b.load_const(10, Type::U8);
            let zero = b.load_const(0, Type::U8);
            let q = b.binary(Opcode::Div, x, zero).unwrap();
            b.ret(Some(q));
        });
        let func = &module.funcs[id];
        assert_eq!(func.insts[func.layout[2]].opcode(), Opcode::Div);
    }
}
