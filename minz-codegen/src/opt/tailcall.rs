//! Rewriting self tail-calls into loops.
//!
//! A call to the enclosing function whose result feeds straight into the following `Return`
//! re-enters through the entry label instead: the arguments land in the parameter slots and a
//! `Jump` replaces the call. For a function that will take the TSMC convention the arguments
//! are written with `SmcPatch`, so the loop re-patches the anchors exactly as an out-of-line
//! recursive call would; stack depth stays flat either way.

use crate::callconv::would_use_tsmc;
use crate::diagnostic::{Diagnostics, OptRecord};
use crate::mir::{Function, InstructionData, Label, LabelData, Module};
use crate::settings::Flags;

/// Rewrite self tail-calls across the module.
pub fn run(
    module: &mut Module,
    flags: &Flags,
    target_supports_smc: bool,
    diag: &mut Diagnostics,
) {
    for (_, func) in module.funcs.iter_mut() {
        if func.is_extern {
            continue;
        }
        run_function(func, flags, target_supports_smc, diag);
    }
}

/// The label at the very start of the function, creating and placing one when missing.
fn entry_label(func: &mut Function) -> Label {
    if let Some(&first) = func.layout.first() {
        if let InstructionData::LabelMark { label } = func.insts[first] {
            return label;
        }
    }
    let mut name = "entry".to_string();
    while func.find_label(&name).is_some() {
        name.push('_');
    }
    let label = func.labels.push(LabelData { name });
    let mark = func.insts.push(InstructionData::LabelMark { label });
    func.layout.insert(0, mark);
    label
}

fn run_function(
    func: &mut Function,
    flags: &Flags,
    target_supports_smc: bool,
    diag: &mut Diagnostics,
) {
    let use_tsmc = would_use_tsmc(func, flags, target_supports_smc);

    loop {
        let mut site = None;
        for (pos, inst) in func.layout_iter() {
            let call = match func.insts[inst] {
                InstructionData::Call {
                    func: ref callee,
                    ref args,
                } if func.is_called_as(callee) => args.clone(),
                _ => continue,
            };
            let next = match func.layout.get(pos + 1) {
                Some(&next) => next,
                None => continue,
            };
            let returned = match func.insts[next] {
                InstructionData::Return { arg } => arg,
                _ => continue,
            };
            // The return must yield the call's own result (or both must be void).
            if returned != func.inst_result(inst) {
                continue;
            }
            site = Some((pos, call));
            break;
        }

        let (pos, args) = match site {
            Some(site) => site,
            None => return,
        };

        // Creating the entry label inserts a mark at the front and shifts the site by one.
        let len_before = func.layout.len();
        let entry = entry_label(func);
        let pos = pos + (func.layout.len() - len_before);

        let qualified = func.qualified_name();
        let mut replacement = Vec::new();
        for (index, &arg) in args.iter().enumerate() {
            let data = if use_tsmc {
                InstructionData::SmcPatch {
                    func: qualified.clone(),
                    param: index as u8,
                    arg,
                }
            } else {
                InstructionData::StoreVar {
                    symbol: func.signature.params[index].name.clone(),
                    arg,
                }
            };
            replacement.push(func.insts.push(data));
        }
        replacement.push(func.insts.push(InstructionData::Jump { destination: entry }));

        // Replace the call and the return with the patch sequence and the jump.
        func.layout.splice(pos..pos + 2, replacement);
        func.update_leaf_flag();

        diag.record(OptRecord {
            pass: "tailcall",
            function: qualified,
            site: None,
            rationale: if use_tsmc {
                "self tail-call re-patches anchors and loops".to_string()
            } else {
                "self tail-call becomes a loop".to_string()
            },
            before: "call".to_string(),
            after: "jmp".to_string(),
            saved_tstates: 27,
            saved_bytes: 1,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::Diagnostics;
    use crate::mir::{AbiParam, CondCode, FuncId, FunctionBuilder, FuncName, Recursion, Signature, Type};
    use crate::settings::OptLevel;

    fn sum_tail(module: &mut Module) -> FuncId {
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("n", Type::U16));
        sig.params.push(AbiParam::new("acc", Type::U16));
        sig.ret = Some(Type::U16);
        let mut b = FunctionBuilder::new(FuncName::new("m", "sum_tail"), sig);
        let entry = b.create_label("entry");
        let rec = b.create_label("rec");
        b.place_label(entry).unwrap();
        let n = b.load_var("n", Type::U16).unwrap();
        let zero = b.load_const(0, Type::U16);
        b.br_cmp(CondCode::Ne, n, zero, rec).unwrap();
        let acc = b.load_var("acc", Type::U16).unwrap();
        b.ret(Some(acc));
        b.place_label(rec).unwrap();
        let one = b.load_const(1, Type::U16);
        let n1 = b.binary(Opcode::Sub, n, one).unwrap();
        let acc0 = b.load_var("acc", Type::U16).unwrap();
        let acc1 = b.binary(Opcode::Add, acc0, n).unwrap();
        let result = b
            .call("sum_tail", &[n1, acc1], Some(Type::U16))
            .unwrap()
            .unwrap();
        b.ret(Some(result));
        let id = module.add_function(b.finish().unwrap());
        module.funcs[id].recursion = Recursion::Direct;
        id
    }

    #[test]
    fn self_tail_call_becomes_a_loop() {
        let mut module = Module::new("m");
        let id = sum_tail(&mut module);
        let mut diag = Diagnostics::new();
        let flags = Flags::builder().enable_smc(false).build();
        run(&mut module, &flags, true, &mut diag);

        let func = &module.funcs[id];
        assert!(
            func.layout
                .iter()
                .all(|&inst| !func.insts[inst].opcode().is_call()),
            "no call survives:\n{}",
            func
        );
        // Two parameter stores and the back-jump replaced the call and return.
        let stores = func
            .layout
            .iter()
            .filter(|&&inst| func.insts[inst].opcode() == Opcode::StoreVar)
            .count();
        assert_eq!(stores, 2);
        assert!(func.is_leaf);
        assert_eq!(diag.by_pass("tailcall").count(), 1);
    }

    #[test]
    fn tsmc_functions_patch_anchors_instead() {
        let mut module = Module::new("m");
        let id = sum_tail(&mut module);
        let mut diag = Diagnostics::new();
        let flags = Flags::builder().opt_level(OptLevel::Full).build();
        run(&mut module, &flags, true, &mut diag);

        let func = &module.funcs[id];
        let patches = func
            .layout
            .iter()
            .filter(|&&inst| func.insts[inst].opcode() == Opcode::SmcPatch)
            .count();
        assert_eq!(patches, 2);
    }

    #[test]
    fn non_tail_calls_are_untouched() {
        let mut module = Module::new("m");
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("n", Type::U8));
        sig.ret = Some(Type::U8);
        let mut b = FunctionBuilder::new(FuncName::new("m", "f"), sig);
        let n = b.load_var("n", Type::U8).unwrap();
        let r = b.call("f", &[n], Some(Type::U8)).unwrap().unwrap();
        let one = b.load_const(1, Type::U8);
        let sum = b.binary(Opcode::Add, r, one).unwrap();
        b.ret(Some(sum));
        let id = module.add_function(b.finish().unwrap());
        module.funcs[id].recursion = Recursion::Direct;

        let mut diag = Diagnostics::new();
        run(&mut module, &Flags::default(), true, &mut diag);
        assert!(module.funcs[id]
            .layout
            .iter()
            .any(|&inst| module.funcs[id].insts[inst].opcode().is_call()));
    }
}
