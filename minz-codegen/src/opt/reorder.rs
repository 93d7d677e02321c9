//! Instruction reordering.
//!
//! Two conservative transformations inside a function's linear layout:
//!
//! - loop-invariant hoisting: an effect-free instruction inside a single-label loop whose
//!   operands are all defined before the loop head moves above the head;
//! - definition sinking: an effect-free, single-use definition moves down to sit just before
//!   its only use, provided nothing it may depend on intervenes.
//!
//! The alias rule is the blunt one: a named load may not cross a store, call or SMC patch
//! unless the store names a different symbol; all addressed memory operations are treated as
//! mutually dependent.

use crate::diagnostic::{Diagnostics, OptRecord};
use crate::entity::SecondaryMap;
use crate::mir::{Function, InstructionData, Module, Opcode, Value};

/// Run reordering over every function in the module.
pub fn run(module: &mut Module, diag: &mut Diagnostics) {
    for (_, func) in module.funcs.iter_mut() {
        if func.is_extern {
            continue;
        }
        hoist_invariants(func, diag);
        sink_definitions(func, diag);
    }
}

/// May `moved` cross `fixed` without changing behavior?
fn may_cross(moved: &InstructionData, fixed: &InstructionData) -> bool {
    if moved.has_side_effects() {
        return false;
    }
    let moved_reads_memory = match moved {
        InstructionData::LoadVar { .. }
        | InstructionData::LoadIndex { .. }
        | InstructionData::LoadField { .. }
        | InstructionData::LoadBitField { .. }
        | InstructionData::TsmcLoad { .. } => true,
        _ => false,
    };
    if !moved_reads_memory {
        return true;
    }
    match fixed {
        InstructionData::StoreVar { symbol, .. } => {
            // Distinct named slots never alias; an addressed read might.
            match moved.touched_symbol() {
                Some(read) => read != symbol,
                None => false,
            }
        }
        InstructionData::StoreIndex { .. }
        | InstructionData::StoreField { .. }
        | InstructionData::StoreBitField { .. }
        | InstructionData::Call { .. }
        | InstructionData::SmcPatch { .. } => false,
        _ => true,
    }
}

/// Find `(head, back_edge)` position pairs for single-label loops.
fn find_loops(func: &Function) -> Vec<(usize, usize)> {
    let mut loops = Vec::new();
    for (pos, inst) in func.layout_iter() {
        if let Some(dest) = func.insts[inst].branch_destination() {
            if let Some(head) = func.label_position(dest) {
                if head < pos {
                    loops.push((head, pos));
                }
            }
        }
    }
    loops
}

fn hoist_invariants(func: &mut Function, diag: &mut Diagnostics) {
    loop {
        let mut moved = None;
        'search: for (head, back) in find_loops(func) {
            let mut def_positions: SecondaryMap<Value, u32> =
                SecondaryMap::with_default(u32::max_value());
            for (pos, inst) in func.layout_iter() {
                if let Some(result) = func.inst_result(inst) {
                    def_positions[result] = pos as u32;
                }
            }
            for pos in head + 1..back {
                let inst = func.layout[pos];
                let data = &func.insts[inst];
                if data.has_side_effects() || func.inst_result(inst).is_none() {
                    continue;
                }
                // Every operand must come from outside the loop body.
                if !data
                    .arguments()
                    .iter()
                    .all(|&arg| (def_positions[arg] as usize) < head + 1)
                {
                    continue;
                }
                // A memory read only hoists out of a loop that cannot write memory.
                if !(head + 1..back)
                    .filter(|&other| other != pos)
                    .all(|other| may_cross(data, &func.insts[func.layout[other]]))
                {
                    continue;
                }
                moved = Some((pos, head));
                break 'search;
            }
        }

        match moved {
            None => return,
            Some((pos, head)) => {
                let inst = func.layout.remove(pos);
                func.layout.insert(head, inst);
                diag.record(OptRecord {
                    pass: "reorder",
                    function: func.qualified_name(),
                    site: Some(inst.to_string()),
                    rationale: "hoisted loop-invariant computation".to_string(),
                    before: String::new(),
                    after: String::new(),
                    saved_tstates: super::inst_cost(func, &func.insts[inst]) as i32,
                    saved_bytes: 0,
                });
            }
        }
    }
}

fn sink_definitions(func: &mut Function, diag: &mut Diagnostics) {
    // One pass, front to back; a sunk definition never needs revisiting.
    let mut pos = 0;
    let mut sunk = 0u32;
    while pos < func.layout.len() {
        let inst = func.layout[pos];
        let data = func.insts[inst].clone();
        let result = match func.inst_result(inst) {
            Some(result) if !data.has_side_effects() => result,
            _ => {
                pos += 1;
                continue;
            }
        };

        // Count uses and find the single use position.
        let mut uses = 0;
        let mut use_pos = None;
        for (other_pos, other) in func.layout_iter() {
            let count = func.insts[other]
                .arguments()
                .iter()
                .filter(|&&arg| arg == result)
                .count();
            if count > 0 {
                uses += count;
                use_pos = Some(other_pos);
            }
        }
        let use_pos = match (uses, use_pos) {
            (1, Some(p)) if p > pos + 1 => p,
            _ => {
                pos += 1;
                continue;
            }
        };

        // The definition may not cross a label, branch, or anything it could depend on.
        let crossable = (pos + 1..use_pos).all(|between| {
            let fixed = &func.insts[func.layout[between]];
            !matches!(fixed.opcode(), Opcode::Label) && !fixed.opcode().is_branch()
                && may_cross(&data, fixed)
        });
        if !crossable {
            pos += 1;
            continue;
        }

        let inst = func.layout.remove(pos);
        func.layout.insert(use_pos - 1, inst);
        sunk += 1;
        // Do not advance: the next instruction shifted into this slot.
    }

    if sunk > 0 {
        diag.record(OptRecord {
            pass: "reorder",
            function: func.qualified_name(),
            site: None,
            rationale: format!("sank {} single-use definitions to their use", sunk),
            before: String::new(),
            after: String::new(),
            saved_tstates: 0,
            saved_bytes: 0,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::Diagnostics;
    use crate::mir::{AbiParam, CondCode, FuncName, FunctionBuilder, Signature, Type};

    #[test]
    fn invariant_load_is_hoisted() {
        let mut module = Module::new("m");
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("n", Type::U8));
        sig.ret = Some(Type::U8);
        let mut b = FunctionBuilder::new(FuncName::new("m", "f"), sig);
        b.declare_local("i", Type::U8).unwrap();
        let bound = b.load_const(10, Type::U8);
        let head = b.create_label("head");
        b.place_label(head).unwrap();
        let i = b.load_var("i", Type::U8).unwrap();
        // Invariant: both operands defined outside the loop.
        let invariant = b.binary(Opcode::Add, bound, bound).unwrap();
        let next = b.binary(Opcode::Add, i, invariant).unwrap();
        b.store_var("i", next).unwrap();
        b.br_cmp(CondCode::Lt, next, bound, head).unwrap();
        b.ret(Some(next));
        let id = module.add_function(b.finish().unwrap());

        let mut diag = Diagnostics::new();
        run(&mut module, &mut diag);

        let func = &module.funcs[id];
        let head_pos = func.label_position(func.find_label("head").unwrap()).unwrap();
        let invariant_pos = func
            .layout_iter()
            .find(|&(_, inst)| {
                matches!(
                    func.insts[inst],
                    InstructionData::Binary { opcode: Opcode::Add, args } if args[0] == args[1]
                )
            })
            .map(|(p, _)| p)
            .unwrap();
        assert!(
            invariant_pos < head_pos,
            "invariant add should sit above the loop head:\n{}",
            func
        );
        assert!(diag.by_pass("reorder").count() >= 1);
    }

    #[test]
    fn loads_do_not_cross_stores_to_the_same_symbol() {
        let load = InstructionData::LoadVar {
            symbol: "x".to_string(),
            ty: Type::U8,
        };
        let store_same = InstructionData::StoreVar {
            symbol: "x".to_string(),
            arg: Value::with_number(0).unwrap(),
        };
        let store_other = InstructionData::StoreVar {
            symbol: "y".to_string(),
            arg: Value::with_number(0).unwrap(),
        };
        assert!(!may_cross(&load, &store_same));
        assert!(may_cross(&load, &store_other));
        // Addressed stores could overlap anything.
        let store_indexed = InstructionData::StoreIndex {
            base: Value::with_number(0).unwrap(),
            index: Value::with_number(1).unwrap(),
            arg: Value::with_number(2).unwrap(),
            elem: Type::U8,
        };
        assert!(!may_cross(&load, &store_indexed));
    }
}
