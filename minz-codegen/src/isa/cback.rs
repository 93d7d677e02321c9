//! Portable C backend.
//!
//! Emits each function as C with labels and `goto` mirroring the linear MIR layout. This
//! backend is one of the textual consumers that depend on the symbol-completeness invariant:
//! parameters and locals appear under their own names, so a `StoreVar` with an empty symbol
//! would have nowhere to go.
//!
//! Arithmetic is done in `unsigned` width and masked back to the storage width on assignment,
//! which matches the wrapping semantics of the 8-bit targets.

use crate::diagnostic::Diagnostics;
use crate::isa::{Capabilities, TargetIsa};
use crate::mir::{
    CondCode, DataPayload, Function, InstructionData, Module, Opcode, Type, Value,
};
use crate::result::{CodegenError, CodegenResult};
use crate::settings::Flags;
use core::fmt::Write;

/// The C code generator.
pub struct CBackend;

impl TargetIsa for CBackend {
    fn name(&self) -> &'static str {
        "c"
    }

    fn extension(&self) -> &'static str {
        "c"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_smc: false,
            shadow_registers: false,
            indexed_addressing: true,
            native_16bit: true,
        }
    }

    fn default_lowmem(&self) -> u16 {
        0
    }

    fn compile_module(
        &self,
        module: &Module,
        flags: &Flags,
        diag: &mut Diagnostics,
    ) -> CodegenResult<String> {
        let mut out = String::new();
        writeln!(out, "/* module {} */", module.name).unwrap();
        writeln!(out, "#include <stdint.h>").unwrap();
        writeln!(out).unwrap();

        for (_, decl) in module.data.iter() {
            emit_data(&mut out, &decl.symbol, &decl.payload);
        }
        if module.data.len() > 0 {
            writeln!(out).unwrap();
        }

        // Prototypes first so declaration order never matters.
        for (_, func) in module.funcs.iter() {
            if func.is_extern {
                writeln!(out, "extern {};", signature_of(func)).unwrap();
            } else {
                writeln!(out, "{};", signature_of(func)).unwrap();
            }
        }
        writeln!(out).unwrap();

        for (_, func) in module.funcs.iter() {
            if func.is_extern {
                continue;
            }
            emit_function(&mut out, module, func)?;
            writeln!(out).unwrap();
        }

        let _ = (flags, diag);
        Ok(out)
    }
}

fn mangle(name: &str) -> String {
    name.replace('.', "_")
}

fn c_type(ty: Type) -> &'static str {
    match ty {
        Type::U8 | Type::Bool => "uint8_t",
        Type::I8 => "int8_t",
        Type::U16 | Type::Ptr | Type::Ref | Type::FuncPtr => "uint16_t",
        Type::I16 => "int16_t",
        Type::Compound(_) => "uint16_t",
    }
}

fn signature_of(func: &Function) -> String {
    let ret = match func.signature.ret {
        Some(ty) => c_type(ty),
        None => "void",
    };
    let params = if func.signature.params.is_empty() {
        "void".to_string()
    } else {
        func.signature
            .params
            .iter()
            .map(|p| format!("{} {}", c_type(p.ty), p.name))
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!("{} {}({})", ret, mangle(&func.qualified_name()), params)
}

fn emit_data(out: &mut String, symbol: &str, payload: &DataPayload) {
    match payload {
        DataPayload::Str(bytes) => {
            let mut items: Vec<String> = Vec::new();
            if bytes.len() > 255 {
                items.push((bytes.len() & 0xFF).to_string());
                items.push((bytes.len() >> 8).to_string());
            } else {
                items.push(bytes.len().to_string());
            }
            items.extend(bytes.iter().map(|b| b.to_string()));
            writeln!(
                out,
                "static const uint8_t {}[] = {{{}}};",
                symbol,
                items.join(", ")
            )
            .unwrap();
        }
        DataPayload::Bytes(bytes) => {
            let items: Vec<String> = bytes.iter().map(|b| b.to_string()).collect();
            writeln!(
                out,
                "static const uint8_t {}[] = {{{}}};",
                symbol,
                items.join(", ")
            )
            .unwrap();
        }
        DataPayload::Words(words) => {
            let items: Vec<String> = words.iter().map(|w| w.to_string()).collect();
            writeln!(
                out,
                "static const uint16_t {}[] = {{{}}};",
                symbol,
                items.join(", ")
            )
            .unwrap();
        }
    }
}

fn value_name(value: Value) -> String {
    format!("{}", value)
}

fn emit_function(out: &mut String, module: &Module, func: &Function) -> CodegenResult<()> {
    writeln!(out, "{} {{", signature_of(func)).unwrap();

    for (_, local) in func.locals.iter() {
        writeln!(out, "    {} {} = 0;", c_type(local.ty), local.name).unwrap();
    }
    for (value, data) in func.values.iter() {
        if data.def.is_none() {
            continue;
        }
        writeln!(
            out,
            "    {} {} = 0;",
            c_type(func.value_type(value)),
            value_name(value)
        )
        .unwrap();
    }

    for &inst in &func.layout {
        emit_inst(out, module, func, inst)?;
    }

    // A function that falls off the end still has to satisfy the C compiler.
    if func.signature.ret.is_some() {
        writeln!(out, "    return 0;").unwrap();
    }
    writeln!(out, "}}").unwrap();
    Ok(())
}

fn cond_op(cond: CondCode) -> &'static str {
    match cond {
        CondCode::Eq => "==",
        CondCode::Ne => "!=",
        CondCode::Lt => "<",
        CondCode::Le => "<=",
        CondCode::Gt => ">",
        CondCode::Ge => ">=",
    }
}

fn emit_inst(
    out: &mut String,
    module: &Module,
    func: &Function,
    inst: crate::mir::Inst,
) -> CodegenResult<()> {
    let unsupported = |opcode: Opcode| CodegenError::UnsupportedOpcode {
        opcode: opcode.mnemonic(),
        function: func.qualified_name(),
        target: "c",
    };
    let result = |inst| value_name(func.inst_result(inst).expect("instruction has a result"));

    match func.insts[inst].clone() {
        InstructionData::UnaryImm { imm, ty } => {
            writeln!(
                out,
                "    {} = ({}){};",
                result(inst),
                c_type(ty),
                imm
            )
            .unwrap();
        }
        InstructionData::SymbolAddr { symbol } => {
            writeln!(
                out,
                "    {} = (uint16_t)(uintptr_t){};",
                result(inst),
                symbol
            )
            .unwrap();
        }
        InstructionData::Unary { opcode, arg } => {
            let arg = value_name(arg);
            let expr = match opcode {
                Opcode::Move => arg,
                Opcode::Not => format!("~{}", arg),
                Opcode::Neg => format!("-{}", arg),
                Opcode::Inc => format!("{} + 1", arg),
                Opcode::Dec => format!("{} - 1", arg),
                Opcode::Test => format!("{} == 0", arg),
                _ => return Err(unsupported(opcode)),
            };
            let r = func.inst_result(inst).expect("result");
            writeln!(
                out,
                "    {} = ({})({});",
                value_name(r),
                c_type(func.value_type(r)),
                expr
            )
            .unwrap();
        }
        InstructionData::Binary { opcode, args } => {
            let op = match opcode {
                Opcode::Add => "+",
                Opcode::Sub => "-",
                Opcode::Mul => "*",
                Opcode::Div => "/",
                Opcode::Mod => "%",
                Opcode::And => "&",
                Opcode::Or => "|",
                Opcode::Xor => "^",
                Opcode::Shl => "<<",
                Opcode::Shr => ">>",
                _ => return Err(unsupported(opcode)),
            };
            let r = func.inst_result(inst).expect("result");
            writeln!(
                out,
                "    {} = ({})({} {} {});",
                value_name(r),
                c_type(func.value_type(r)),
                value_name(args[0]),
                op,
                value_name(args[1])
            )
            .unwrap();
        }
        InstructionData::IntCompare { cond, args } => {
            writeln!(
                out,
                "    {} = {} {} {};",
                result(inst),
                value_name(args[0]),
                cond_op(cond),
                value_name(args[1])
            )
            .unwrap();
        }
        InstructionData::LoadVar { symbol, .. } => {
            writeln!(out, "    {} = {};", result(inst), symbol).unwrap();
        }
        InstructionData::StoreVar { symbol, arg } => {
            writeln!(out, "    {} = {};", symbol, value_name(arg)).unwrap();
        }
        InstructionData::Jump { destination } => {
            writeln!(out, "    goto {};", func.labels[destination].name).unwrap();
        }
        InstructionData::Branch {
            opcode,
            arg,
            destination,
        } => {
            let test = match opcode {
                Opcode::JumpIfZero => format!("{} == 0", value_name(arg)),
                Opcode::JumpIfNotZero => format!("{} != 0", value_name(arg)),
                _ => unreachable!(),
            };
            writeln!(
                out,
                "    if ({}) goto {};",
                test, func.labels[destination].name
            )
            .unwrap();
        }
        InstructionData::BranchCompare {
            cond,
            args,
            destination,
        } => {
            writeln!(
                out,
                "    if ({} {} {}) goto {};",
                value_name(args[0]),
                cond_op(cond),
                value_name(args[1]),
                func.labels[destination].name
            )
            .unwrap();
        }
        InstructionData::Call { func: callee, args } => {
            let target = module
                .find_function(&callee)
                .map(|id| mangle(&module.funcs[id].qualified_name()))
                .unwrap_or_else(|| mangle(&callee));
            let arg_list = args
                .iter()
                .map(|&a| value_name(a))
                .collect::<Vec<_>>()
                .join(", ");
            match func.inst_result(inst) {
                Some(r) => {
                    writeln!(out, "    {} = {}({});", value_name(r), target, arg_list).unwrap()
                }
                None => writeln!(out, "    {}({});", target, arg_list).unwrap(),
            }
        }
        InstructionData::Return { arg } => match arg {
            Some(arg) => writeln!(out, "    return {};", value_name(arg)).unwrap(),
            None => writeln!(out, "    return;").unwrap(),
        },
        InstructionData::LabelMark { label } => {
            writeln!(out, "{}:;", func.labels[label].name).unwrap();
        }
        ref other => return Err(unsupported(other.opcode())),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{AbiParam, FuncName, FunctionBuilder, Signature};
    use crate::opt;

    #[test]
    fn variables_keep_their_names() {
        let mut module = Module::new("m");
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("n", Type::U8));
        sig.ret = Some(Type::U8);
        let mut b = FunctionBuilder::new(FuncName::new("m", "twice"), sig);
        b.declare_local("tmp", Type::U8).unwrap();
        let n = b.load_var("n", Type::U8).unwrap();
        let sum = b.binary(Opcode::Add, n, n).unwrap();
        b.store_var("tmp", sum).unwrap();
        let t = b.load_var("tmp", Type::U8).unwrap();
        b.ret(Some(t));
        module.add_function(b.finish().unwrap());

        let flags = Flags::default();
        let mut diag = Diagnostics::new();
        opt::optimize(&mut module, &flags, false, &mut diag).unwrap();
        let text = CBackend.compile_module(&module, &flags, &mut diag).unwrap();
        assert!(text.contains("uint8_t m_twice(uint8_t n)"), "{}", text);
        assert!(text.contains("tmp ="), "{}", text);
        assert!(text.contains("= tmp;"), "{}", text);
        assert!(text.contains("#include <stdint.h>"), "{}", text);
    }

    #[test]
    fn string_data_is_length_prefixed() {
        let mut module = Module::new("m");
        module.add_data("msg", DataPayload::Str(b"Hi".to_vec()));
        let mut b = FunctionBuilder::new(FuncName::new("m", "nop"), Signature::new());
        b.ret(None);
        module.add_function(b.finish().unwrap());

        let flags = Flags::default();
        let mut diag = Diagnostics::new();
        let text = CBackend.compile_module(&module, &flags, &mut diag).unwrap();
        assert!(
            text.contains("static const uint8_t msg[] = {2, 72, 105};"),
            "{}",
            text
        );
    }
}
