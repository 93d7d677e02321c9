//! Size-budgeted inlining.
//!
//! A call site is inlined when the callee's body cost fits the budget and the callee is neither
//! recursive, nor externally defined, nor annotated no-inline, nor carrying SMC anchors (an
//! anchor is an address identity; cloning it would fork the patch target). Arguments become
//! stores into fresh locals standing in for the callee's parameters, the body is cloned with
//! its values, labels and storage names remapped, and returns re-route to a continuation label.
//!
//! With a single trailing return the call's result is re-defined by a plain `Move`; multiple
//! returns route the result through a fresh local so every value keeps exactly one definition.

use crate::diagnostic::{Diagnostics, OptRecord};
use crate::entity::SecondaryMap;
use crate::mir::{
    Function, InstructionData, Label, LabelData, LocalData, Module, Opcode, Value, ValueList,
};
use crate::packed_option::PackedOption;
use crate::settings::Flags;
use std::collections::HashMap;

/// Run the inliner over every function in the module.
pub fn run(module: &mut Module, flags: &Flags, diag: &mut Diagnostics) {
    let caller_ids: Vec<_> = module.funcs.iter().map(|(id, _)| id).collect();
    for caller_id in caller_ids {
        // Bound the splices per caller; inlined bodies may expose further candidates.
        for _ in 0..8 {
            let candidate = find_candidate(module, caller_id, flags);
            let (pos, callee_id, args) = match candidate {
                Some(c) => c,
                None => break,
            };
            let callee = module.funcs[callee_id].clone();
            inline_site(&mut module.funcs[caller_id], pos, &callee, &args, diag);
        }
    }
}

fn body_cost(func: &Function) -> u32 {
    func.layout
        .iter()
        .filter(|&&inst| func.insts[inst].opcode() != Opcode::Label)
        .count() as u32
}

fn has_anchors(func: &Function) -> bool {
    func.layout.iter().any(|&inst| {
        matches!(
            func.insts[inst].opcode(),
            Opcode::SmcAnchor | Opcode::SmcPatch | Opcode::TsmcLoad
        )
    })
}

fn find_candidate(
    module: &Module,
    caller_id: crate::mir::FuncId,
    flags: &Flags,
) -> Option<(usize, crate::mir::FuncId, ValueList)> {
    let caller = &module.funcs[caller_id];
    for (pos, inst) in caller.layout_iter() {
        let (callee_name, args) = match caller.insts[inst] {
            InstructionData::Call {
                func: ref callee,
                ref args,
            } => (callee, args),
            _ => continue,
        };
        let callee_id = match module.find_function(callee_name) {
            Some(id) => id,
            None => continue,
        };
        if callee_id == caller_id {
            continue;
        }
        let callee = &module.funcs[callee_id];
        if callee.is_extern
            || callee.no_inline
            || callee.is_recursive()
            || has_anchors(callee)
            || body_cost(callee) > flags.inline_budget
        {
            continue;
        }
        return Some((pos, callee_id, args.clone()));
    }
    None
}

fn rename_storage(data: &mut InstructionData, renames: &HashMap<String, String>) {
    let symbol = match data {
        InstructionData::LoadVar { symbol, .. }
        | InstructionData::StoreVar { symbol, .. }
        | InstructionData::LoadBitField { symbol, .. }
        | InstructionData::StoreBitField { symbol, .. }
        | InstructionData::SymbolAddr { symbol } => symbol,
        _ => return,
    };
    if let Some(fresh) = renames.get(symbol.as_str()) {
        *symbol = fresh.clone();
    }
}

fn inline_site(
    caller: &mut Function,
    pos: usize,
    callee: &Function,
    args: &ValueList,
    diag: &mut Diagnostics,
) {
    let suffix = format!("_i{}", caller.insts.len());
    let call_inst = caller.layout[pos];
    let call_result = caller.inst_result(call_inst);

    // Fresh locals stand in for the callee's parameters and locals.
    let mut renames: HashMap<String, String> = HashMap::new();
    for param in &callee.signature.params {
        let fresh = format!("{}_{}{}", callee.name.name, param.name, suffix);
        let slot = caller.locals.len() as u32;
        caller.locals.push(LocalData {
            name: fresh.clone(),
            ty: param.ty,
            slot,
        });
        renames.insert(param.name.clone(), fresh);
    }
    for (_, local) in callee.locals.iter() {
        let fresh = format!("{}_{}{}", callee.name.name, local.name, suffix);
        let slot = caller.locals.len() as u32;
        caller.locals.push(LocalData {
            name: fresh.clone(),
            ty: local.ty,
            slot,
        });
        renames.insert(local.name.clone(), fresh);
    }

    let mut label_map: SecondaryMap<Label, PackedOption<Label>> = SecondaryMap::new();
    for (label, data) in callee.labels.iter() {
        let fresh = caller.labels.push(LabelData {
            name: format!("{}_{}{}", callee.name.name, data.name, suffix),
        });
        label_map[label] = fresh.into();
    }
    let cont_label = caller.labels.push(LabelData {
        name: format!("{}_done{}", callee.name.name, suffix),
    });

    let returns = callee
        .layout
        .iter()
        .filter(|&&inst| callee.insts[inst].opcode() == Opcode::Return)
        .count();
    let single_trailing_return = returns == 1
        && callee
            .layout
            .last()
            .map_or(false, |&inst| callee.insts[inst].opcode() == Opcode::Return);
    let ret_local = if !single_trailing_return && call_result.is_some() {
        let name = format!("{}_ret{}", callee.name.name, suffix);
        let slot = caller.locals.len() as u32;
        caller.locals.push(LocalData {
            name: name.clone(),
            ty: callee.signature.ret.expect("call has a result"),
            slot,
        });
        Some(name)
    } else {
        None
    };

    let mut value_map: SecondaryMap<Value, PackedOption<Value>> = SecondaryMap::new();
    let mut new_insts = Vec::new();

    // Arguments become moves into the parameter stand-ins.
    for (index, &arg) in args.iter().enumerate() {
        let symbol = renames[&callee.signature.params[index].name].clone();
        new_insts.push(caller.insts.push(InstructionData::StoreVar { symbol, arg }));
    }

    for &callee_inst in &callee.layout {
        let mut data = callee.insts[callee_inst].clone();

        if let InstructionData::Return { arg } = data {
            let mapped = arg.map(|v| value_map[v].expand().expect("return value is defined"));
            if single_trailing_return {
                if let (Some(result), Some(value)) = (call_result, mapped) {
                    let mv = caller.insts.push(InstructionData::Unary {
                        opcode: Opcode::Move,
                        arg: value,
                    });
                    caller.results[mv] = result.into();
                    caller.values[result].def = mv.into();
                    new_insts.push(mv);
                }
            } else {
                if let (Some(local), Some(value)) = (&ret_local, mapped) {
                    new_insts.push(caller.insts.push(InstructionData::StoreVar {
                        symbol: local.clone(),
                        arg: value,
                    }));
                }
                new_insts.push(caller.insts.push(InstructionData::Jump {
                    destination: cont_label,
                }));
            }
            continue;
        }

        if let InstructionData::LabelMark { label } = data {
            data = InstructionData::LabelMark {
                label: label_map[label].expand().expect("label cloned"),
            };
        } else {
            if let Some(dest) = data.branch_destination_mut() {
                *dest = label_map[*dest].expand().expect("label cloned");
            }
            rename_storage(&mut data, &renames);
            data.map_arguments(|v| value_map[v].expand().expect("operand is defined"));
        }

        let new_inst = caller.insts.push(data);
        if let Some(old_result) = callee.inst_result(callee_inst) {
            let new_value = caller.make_result(new_inst, callee.value_type(old_result));
            value_map[old_result] = new_value.into();
        }
        new_insts.push(new_inst);
    }

    new_insts.push(caller.insts.push(InstructionData::LabelMark { label: cont_label }));

    if let (Some(result), Some(local)) = (call_result, &ret_local) {
        let load = caller.insts.push(InstructionData::LoadVar {
            symbol: local.clone(),
            ty: callee.signature.ret.expect("call has a result"),
        });
        caller.results[load] = result.into();
        caller.values[result].def = load.into();
        new_insts.push(load);
    }

    caller.layout.splice(pos..pos + 1, new_insts);
    caller.update_leaf_flag();

    diag.record(OptRecord {
        pass: "inline",
        function: caller.qualified_name(),
        site: Some(call_inst.to_string()),
        rationale: format!(
            "inlined {} ({} instructions)",
            callee.qualified_name(),
            body_cost(callee)
        ),
        before: "call".to_string(),
        after: "body".to_string(),
        saved_tstates: 17,
        saved_bytes: -(body_cost(callee) as i32),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::Diagnostics;
    use crate::mir::{AbiParam, FuncName, FunctionBuilder, Recursion, Signature, Type};
    use crate::verifier::verify_function;

    fn double_fn(module: &mut Module) {
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("x", Type::U8));
        sig.ret = Some(Type::U8);
        let mut b = FunctionBuilder::new(FuncName::new("m", "double"), sig);
        let x = b.load_var("x", Type::U8).unwrap();
        let sum = b.binary(Opcode::Add, x, x).unwrap();
        b.ret(Some(sum));
        module.add_function(b.finish().unwrap());
    }

    fn caller_fn(module: &mut Module) -> crate::mir::FuncId {
        let mut sig = Signature::new();
        sig.ret = Some(Type::U8);
        let mut b = FunctionBuilder::new(FuncName::new("m", "main"), sig);
        let c = b.load_const(21, Type::U8);
        let r = b.call("double", &[c], Some(Type::U8)).unwrap().unwrap();
        b.ret(Some(r));
        module.add_function(b.finish().unwrap())
    }

    #[test]
    fn small_leaf_is_inlined() {
        let mut module = Module::new("m");
        double_fn(&mut module);
        let main = caller_fn(&mut module);

        let mut diag = Diagnostics::new();
        run(&mut module, &Flags::default(), &mut diag);

        let func = &module.funcs[main];
        assert!(
            func.layout
                .iter()
                .all(|&inst| !func.insts[inst].opcode().is_call()),
            "call should be gone:\n{}",
            func
        );
        assert!(func.is_leaf);
        // The cloned body still verifies: one definition per value, labels placed.
        verify_function(func).unwrap();
        assert_eq!(diag.by_pass("inline").count(), 1);
    }

    #[test]
    fn recursive_callees_are_not_inlined() {
        let mut module = Module::new("m");
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("n", Type::U8));
        sig.ret = Some(Type::U8);
        let mut b = FunctionBuilder::new(FuncName::new("m", "fact"), sig);
        let n = b.load_var("n", Type::U8).unwrap();
        let r = b.call("fact", &[n], Some(Type::U8)).unwrap().unwrap();
        b.ret(Some(r));
        let fact = module.add_function(b.finish().unwrap());
        module.funcs[fact].recursion = Recursion::Direct;

        let mut sig = Signature::new();
        sig.ret = Some(Type::U8);
        let mut b = FunctionBuilder::new(FuncName::new("m", "main"), sig);
        let c = b.load_const(5, Type::U8);
        let r = b.call("fact", &[c], Some(Type::U8)).unwrap().unwrap();
        b.ret(Some(r));
        let main = module.add_function(b.finish().unwrap());

        let mut diag = Diagnostics::new();
        run(&mut module, &Flags::default(), &mut diag);
        assert!(module.funcs[main]
            .layout
            .iter()
            .any(|&inst| module.funcs[main].insts[inst].opcode().is_call()));
    }

    #[test]
    fn oversized_callees_are_not_inlined() {
        let mut module = Module::new("m");
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("x", Type::U8));
        sig.ret = Some(Type::U8);
        let mut b = FunctionBuilder::new(FuncName::new("m", "big"), sig);
        let mut acc = b.load_var("x", Type::U8).unwrap();
        for _ in 0..20 {
            acc = b.binary(Opcode::Add, acc, acc).unwrap();
        }
        b.ret(Some(acc));
        module.add_function(b.finish().unwrap());

        let mut sig = Signature::new();
        sig.ret = Some(Type::U8);
        let mut b = FunctionBuilder::new(FuncName::new("m", "main"), sig);
        let c = b.load_const(1, Type::U8);
        let r = b.call("big", &[c], Some(Type::U8)).unwrap().unwrap();
        b.ret(Some(r));
        let main = module.add_function(b.finish().unwrap());

        let mut diag = Diagnostics::new();
        run(&mut module, &Flags::default(), &mut diag);
        assert!(module.funcs[main]
            .layout
            .iter()
            .any(|&inst| module.funcs[main].insts[inst].opcode().is_call()));
    }

    #[test]
    fn multiple_returns_route_through_a_local() {
        let mut module = Module::new("m");
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("x", Type::U8));
        sig.ret = Some(Type::U8);
        let mut b = FunctionBuilder::new(FuncName::new("m", "clamp"), sig);
        let big = b.create_label("big");
        let x = b.load_var("x", Type::U8).unwrap();
        let limit = b.load_const(100, Type::U8);
        b.br_cmp(crate::mir::CondCode::Gt, x, limit, big).unwrap();
        b.ret(Some(x));
        b.place_label(big).unwrap();
        b.ret(Some(limit));
        module.add_function(b.finish().unwrap());

        let main = caller_fn(&mut module);
        // caller_fn calls `double`; repoint it at `clamp`.
        let func = &mut module.funcs[main];
        let layout = func.layout.clone();
        for inst in layout {
            if let InstructionData::Call { func: callee, .. } = &mut func.insts[inst] {
                *callee = "clamp".to_string();
            }
        }

        let mut diag = Diagnostics::new();
        run(&mut module, &Flags::default(), &mut diag);

        let func = &module.funcs[main];
        verify_function(func).unwrap();
        assert!(func
            .layout
            .iter()
            .all(|&inst| !func.insts[inst].opcode().is_call()));
        // The continuation reads the routed result back out of the fresh local.
        assert!(func.layout.iter().any(|&inst| matches!(
            &func.insts[inst],
            InstructionData::LoadVar { symbol, .. } if symbol.starts_with("clamp_ret")
        )));
    }
}
