//! Copy propagation.
//!
//! Forwards the operand of every `Move` to the uses of its result, following chains. The moves
//! themselves stay behind for dead code elimination to collect once their results have no uses
//! left.

use crate::diagnostic::{Diagnostics, OptRecord};
use crate::entity::SecondaryMap;
use crate::mir::{Function, InstructionData, Module, Opcode, Value};
use crate::packed_option::PackedOption;

/// Run copy propagation over every function in the module.
pub fn run(module: &mut Module, diag: &mut Diagnostics) {
    for (_, func) in module.funcs.iter_mut() {
        if func.is_extern {
            continue;
        }
        run_function(func, diag);
    }
}

fn resolve(subst: &SecondaryMap<Value, PackedOption<Value>>, value: Value) -> Value {
    let mut current = value;
    while let Some(next) = subst[current].expand() {
        current = next;
    }
    current
}

fn run_function(func: &mut Function, diag: &mut Diagnostics) {
    let mut subst: SecondaryMap<Value, PackedOption<Value>> = SecondaryMap::new();
    for &inst in &func.layout {
        if let InstructionData::Unary {
            opcode: Opcode::Move,
            arg,
        } = func.insts[inst]
        {
            if let Some(result) = func.inst_result(inst) {
                let root = resolve(&subst, arg);
                subst[result] = root.into();
            }
        }
    }

    let mut replaced = 0u32;
    let layout = func.layout.clone();
    for inst in layout {
        func.insts[inst].map_arguments(|arg| {
            let root = resolve(&subst, arg);
            if root != arg {
                replaced += 1;
            }
            root
        });
    }

    if replaced > 0 {
        diag.record(OptRecord {
            pass: "copy_prop",
            function: func.qualified_name(),
            site: None,
            rationale: format!("forwarded {} copied operands", replaced),
            before: String::new(),
            after: String::new(),
            saved_tstates: 4 * replaced as i32,
            saved_bytes: replaced as i32,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{FuncName, FunctionBuilder, Signature, Type};

    #[test]
    fn chains_are_followed() {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::new(FuncName::new("m", "f"), {
            let mut sig = Signature::new();
            sig.ret = Some(Type::U8);
            sig
        });
        let c = b.load_const(9, Type::U8);
        let m1 = b.unary(Opcode::Move, c).unwrap();
        let m2 = b.unary(Opcode::Move, m1).unwrap();
        b.ret(Some(m2));
        let id = module.add_function(b.finish().unwrap());

        let mut diag = Diagnostics::new();
        run(&mut module, &mut diag);

        let func = &module.funcs[id];
        let last = *func.layout.last().unwrap();
        assert_eq!(func.insts[last], InstructionData::Return { arg: Some(c) });
        assert_eq!(diag.by_pass("copy_prop").count(), 1);
    }
}
