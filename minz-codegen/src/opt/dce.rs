//! Dead code elimination.
//!
//! Removes instructions whose result is unused and which have no side effects, plus code that
//! can never execute because it follows a terminator with no intervening label. The side-effect
//! set is the enumerated one on `InstructionData::has_side_effects`; anything producing a named
//! observable stays.

use crate::diagnostic::{Diagnostics, OptRecord};
use crate::entity::SecondaryMap;
use crate::mir::{Function, InstructionData, Module, Value};

/// Run dead code elimination over every function in the module.
pub fn run(module: &mut Module, diag: &mut Diagnostics) {
    for (_, func) in module.funcs.iter_mut() {
        if func.is_extern {
            continue;
        }
        run_function(func, diag);
    }
}

fn run_function(func: &mut Function, diag: &mut Diagnostics) {
    let mut removed_total = 0u32;

    loop {
        let mut removed = sweep_unreachable(func);
        removed += sweep_unused(func);
        removed_total += removed;
        if removed == 0 {
            break;
        }
    }

    if removed_total > 0 {
        diag.record(OptRecord {
            pass: "dce",
            function: func.qualified_name(),
            site: None,
            rationale: format!("removed {} dead instructions", removed_total),
            before: String::new(),
            after: String::new(),
            saved_tstates: 0,
            saved_bytes: removed_total as i32,
        });
    }
}

/// Drop instructions between a terminator and the next label.
fn sweep_unreachable(func: &mut Function) -> u32 {
    let mut keep = Vec::with_capacity(func.layout.len());
    let mut reachable = true;
    let mut removed = 0u32;
    for &inst in &func.layout {
        let data = &func.insts[inst];
        if let InstructionData::LabelMark { .. } = data {
            reachable = true;
        }
        if reachable {
            keep.push(inst);
        } else {
            removed += 1;
        }
        if data.opcode().is_terminator() {
            reachable = false;
        }
    }
    func.layout = keep;
    removed
}

/// Drop effect-free instructions whose results have no remaining uses.
fn sweep_unused(func: &mut Function) -> u32 {
    let mut uses: SecondaryMap<Value, u32> = SecondaryMap::new();
    for &inst in &func.layout {
        for arg in func.insts[inst].arguments() {
            uses[arg] += 1;
        }
    }

    let mut keep = Vec::with_capacity(func.layout.len());
    let mut removed = 0u32;
    for &inst in &func.layout {
        let data = &func.insts[inst];
        let live = data.has_side_effects()
            || match func.inst_result(inst) {
                Some(result) => uses[result] > 0,
                None => true,
            };
        if live {
            keep.push(inst);
        } else {
            removed += 1;
        }
    }
    func.layout = keep;
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::Diagnostics;
    use crate::mir::{FuncName, FunctionBuilder, Opcode, Signature, Type};

    #[test]
    fn unused_chain_is_removed() {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::new(FuncName::new("m", "f"), {
            let mut sig = Signature::new();
            sig.ret = Some(Type::U8);
            sig
        });
        let kept = b.load_const(1, Type::U8);
        let dead1 = b.load_const(2, Type::U8);
        let _dead2 = b.binary(Opcode::Add, dead1, dead1).unwrap();
        b.ret(Some(kept));
        let id = module.add_function(b.finish().unwrap());

        let mut diag = Diagnostics::new();
        run(&mut module, &mut diag);

        // Only the kept constant and the return survive. Removing the add exposes the second
        // constant, so the pass has to iterate.
        assert_eq!(module.funcs[id].layout.len(), 2);
        assert_eq!(diag.by_pass("dce").count(), 1);
    }

    #[test]
    fn stores_and_calls_survive() {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::new(FuncName::new("m", "f"), Signature::new());
        b.declare_local("x", Type::U8).unwrap();
        let v = b.load_const(3, Type::U8);
        b.store_var("x", v).unwrap();
        let unused = b.call("m.effectful", &[], Some(Type::U8)).unwrap();
        assert!(unused.is_some());
        b.ret(None);
        let id = module.add_function(b.finish().unwrap());

        let mut diag = Diagnostics::new();
        run(&mut module, &mut diag);
        assert_eq!(module.funcs[id].layout.len(), 4);
    }

    #[test]
    fn code_after_a_jump_is_unreachable() {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::new(FuncName::new("m", "f"), Signature::new());
        let out = b.create_label("out");
        b.jump(out);
        let dead = b.load_const(1, Type::U8);
        b.store_var("x", dead).unwrap();
        b.place_label(out).unwrap();
        b.ret(None);
        let id = module.add_function(b.finish().unwrap());

        let mut diag = Diagnostics::new();
        run(&mut module, &mut diag);
        let func = &module.funcs[id];
        assert!(func
            .layout
            .iter()
            .all(|&inst| func.insts[inst].opcode() != Opcode::StoreVar));
    }
}
