//! Converting MIR to text.
//!
//! The `write_module` and `write_function` functions produce the stable textual MIR form: one
//! instruction per line, the result register on the left, symbols spelled by name. The form is
//! parseable by `minz-reader`, printable for `Display`, and stable enough for golden tests.
//!
//! `anchor` and `tsmcld` print their parameter by name (the signature is at hand); `patch`
//! prints the callee's parameter by index, since the callee may not be parsed yet when the
//! reader sees the line.

use crate::mir::{
    DataPayload, Function, InstructionData, Module, Type, TypeData, TypeStore,
};
use core::fmt::{self, Write};

/// Write `func` in the textual MIR format.
pub fn write_function<W: Write>(w: &mut W, func: &Function) -> fmt::Result {
    write_function_with(w, func, None)
}

/// Write `func`, resolving compound type names through `types` when available.
pub fn write_function_with<W: Write>(
    w: &mut W,
    func: &Function,
    types: Option<&TypeStore>,
) -> fmt::Result {
    write!(w, "fn {}(", func.name)?;
    for (i, param) in func.signature.params.iter().enumerate() {
        if i > 0 {
            write!(w, ", ")?;
        }
        write!(w, "{}: {}", param.name, type_name(param.ty, types))?;
    }
    write!(w, ")")?;
    if let Some(ret) = func.signature.ret {
        write!(w, " -> {}", type_name(ret, types))?;
    }
    writeln!(w, " {{")?;

    write_annotations(w, func)?;

    for (_, inst) in func.layout_iter() {
        write_inst(w, func, &func.insts[inst], inst, types)?;
    }
    writeln!(w, "}}")
}

fn write_annotations<W: Write>(w: &mut W, func: &Function) -> fmt::Result {
    if func.is_extern {
        writeln!(w, "    extern")?;
    }
    if func.in_rom {
        writeln!(w, "    in_rom")?;
    }
    if func.interrupt {
        writeln!(w, "    interrupt")?;
    }
    if func.no_inline {
        writeln!(w, "    no_inline")?;
    }
    if func.naked {
        writeln!(w, "    naked")?;
    }
    if func.is_recursive() {
        writeln!(w, "    recursive")?;
    }
    if let Some(conv) = func.forced_conv {
        writeln!(w, "    abi \"{}\"", conv)?;
    }
    for (_, local) in func.locals.iter() {
        writeln!(w, "    local {}: {}", local.name, local.ty)?;
    }
    Ok(())
}

fn type_name(ty: Type, types: Option<&TypeStore>) -> String {
    match (ty, types) {
        (Type::Compound(id), Some(store)) => match store.get(id).name() {
            Some(name) => name.to_string(),
            None => id.to_string(),
        },
        _ => ty.to_string(),
    }
}

fn write_inst<W: Write>(
    w: &mut W,
    func: &Function,
    data: &InstructionData,
    inst: crate::mir::Inst,
    types: Option<&TypeStore>,
) -> fmt::Result {
    // Labels sit at column 0; everything else is indented.
    if let InstructionData::LabelMark { label } = data {
        return writeln!(w, "{}:", func.labels[*label].name);
    }
    write!(w, "    ")?;
    if let Some(result) = func.inst_result(inst) {
        write!(w, "{} = ", result)?;
    }
    match data {
        InstructionData::UnaryImm { imm, ty } => writeln!(w, "ldc.{} {}", ty, imm),
        InstructionData::SymbolAddr { symbol } => writeln!(w, "lda {}", symbol),
        InstructionData::Unary { opcode, arg } => writeln!(w, "{} {}", opcode, arg),
        InstructionData::Binary { opcode, args } => {
            let ty = func.value_type(args[0]);
            writeln!(w, "{}.{} {}, {}", opcode, ty, args[0], args[1])
        }
        InstructionData::IntCompare { cond, args } => {
            writeln!(w, "cmp {} {}, {}", cond, args[0], args[1])
        }
        InstructionData::LoadVar { symbol, ty } => writeln!(w, "ldvar.{} {}", ty, symbol),
        InstructionData::StoreVar { symbol, arg } => writeln!(w, "stvar {}, {}", symbol, arg),
        InstructionData::LoadIndex { base, index, elem } => {
            writeln!(w, "ldidx.{} {}, {}", elem, base, index)
        }
        InstructionData::StoreIndex {
            base,
            index,
            arg,
            elem,
        } => writeln!(w, "stidx.{} {}, {}, {}", elem, base, index, arg),
        InstructionData::LoadField { base, strct, field } => writeln!(
            w,
            "ldfld {}, {}.{}",
            base,
            type_name(Type::Compound(*strct), types),
            field
        ),
        InstructionData::StoreField {
            base,
            strct,
            field,
            arg,
        } => writeln!(
            w,
            "stfld {}, {}.{}, {}",
            base,
            type_name(Type::Compound(*strct), types),
            field,
            arg
        ),
        InstructionData::LoadBitField {
            symbol,
            bits,
            field,
        } => writeln!(
            w,
            "ldbit {}, {}.{}",
            symbol,
            type_name(Type::Compound(*bits), types),
            field
        ),
        InstructionData::StoreBitField {
            symbol,
            bits,
            field,
            arg,
        } => writeln!(
            w,
            "stbit {}, {}.{}, {}",
            symbol,
            type_name(Type::Compound(*bits), types),
            field,
            arg
        ),
        InstructionData::Jump { destination } => {
            writeln!(w, "jmp {}", func.labels[*destination].name)
        }
        InstructionData::Branch {
            opcode,
            arg,
            destination,
        } => writeln!(w, "{} {}, {}", opcode, arg, func.labels[*destination].name),
        InstructionData::BranchCompare {
            cond,
            args,
            destination,
        } => writeln!(
            w,
            "jcc {} {}, {}, {}",
            cond, args[0], args[1], func.labels[*destination].name
        ),
        InstructionData::Call { func: callee, args } => {
            write!(w, "call {}(", callee)?;
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    write!(w, ", ")?;
                }
                write!(w, "{}", arg)?;
            }
            writeln!(w, ")")
        }
        InstructionData::Return { arg } => match arg {
            Some(arg) => writeln!(w, "ret {}", arg),
            None => writeln!(w, "ret"),
        },
        InstructionData::LabelMark { .. } => unreachable!("labels handled above"),
        InstructionData::SmcAnchor { param } => writeln!(
            w,
            "anchor {}",
            func.signature.params[*param as usize].name
        ),
        InstructionData::SmcPatch { func: callee, param, arg } => {
            writeln!(w, "patch {}:{}, {}", callee, param, arg)
        }
        InstructionData::TsmcLoad { param } => writeln!(
            w,
            "tsmcld {}",
            func.signature.params[*param as usize].name
        ),
        InstructionData::IterBegin { count } => writeln!(w, "iterb {}", count),
        InstructionData::IterStep { destination } => {
            writeln!(w, "iters {}", func.labels[*destination].name)
        }
        InstructionData::IterEnd => writeln!(w, "itere"),
    }
}

/// Render a whole module in the textual MIR format.
pub fn write_module(module: &Module) -> String {
    let mut text = String::new();
    let w = &mut text;
    writeln!(w, "module {}", module.name).unwrap();
    for import in &module.imports {
        writeln!(w, "import {}", import).unwrap();
    }

    for (id, _) in module.types.iter() {
        writeln!(w).unwrap();
        write_type_decl(w, module, id).unwrap();
    }

    for (_, decl) in module.data.iter() {
        writeln!(w).unwrap();
        write_data_decl(w, &decl.symbol, &decl.payload).unwrap();
    }

    for (_, func) in module.funcs.iter() {
        writeln!(w).unwrap();
        write_function_with(w, func, Some(&module.types)).unwrap();
    }
    text
}

fn write_type_decl<W: Write>(w: &mut W, module: &Module, id: crate::mir::TypeId) -> fmt::Result {
    let name = type_name(Type::Compound(id), Some(&module.types));
    match module.types.get(id) {
        TypeData::Array { elem, len } => writeln!(w, "type {} = array [{}, {}]", name, elem, len),
        TypeData::Struct { fields, .. } => {
            write!(w, "type {} = struct {{ ", name)?;
            for (i, field) in fields.iter().enumerate() {
                if i > 0 {
                    write!(w, ", ")?;
                }
                write!(w, "{}: {}", field.name, field.ty)?;
            }
            writeln!(w, " }}")
        }
        TypeData::Enum { variants, .. } => {
            write!(w, "type {} = enum {{ ", name)?;
            for (i, (vname, tag)) in variants.iter().enumerate() {
                if i > 0 {
                    write!(w, ", ")?;
                }
                write!(w, "{} = {}", vname, tag)?;
            }
            writeln!(w, " }}")
        }
        TypeData::BitStruct { cell, fields, .. } => {
            write!(w, "type {} = bits {} {{ ", name, cell)?;
            for (i, field) in fields.iter().enumerate() {
                if i > 0 {
                    write!(w, ", ")?;
                }
                write!(w, "{}: {}:{}", field.name, field.offset, field.width)?;
            }
            writeln!(w, " }}")
        }
    }
}

fn write_data_decl<W: Write>(w: &mut W, symbol: &str, payload: &DataPayload) -> fmt::Result {
    match payload {
        DataPayload::Str(bytes) => {
            write!(w, "data {} = str \"", symbol)?;
            for &b in bytes {
                match b {
                    b'"' => write!(w, "\\\"")?,
                    b'\\' => write!(w, "\\\\")?,
                    0x20..=0x7E => write!(w, "{}", b as char)?,
                    _ => write!(w, "\\x{:02X}", b)?,
                }
            }
            writeln!(w, "\"")
        }
        DataPayload::Bytes(bytes) => {
            write!(w, "data {} = bytes [", symbol)?;
            for (i, b) in bytes.iter().enumerate() {
                if i > 0 {
                    write!(w, ", ")?;
                }
                write!(w, "{}", b)?;
            }
            writeln!(w, "]")
        }
        DataPayload::Words(words) => {
            write!(w, "data {} = words [", symbol)?;
            for (i, word) in words.iter().enumerate() {
                if i > 0 {
                    write!(w, ", ")?;
                }
                write!(w, "{}", word)?;
            }
            writeln!(w, "]")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{AbiParam, CondCode, FuncName, FunctionBuilder, Opcode, Signature};

    #[test]
    fn golden_function_text() {
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("a", Type::U8));
        sig.params.push(AbiParam::new("b", Type::U8));
        sig.ret = Some(Type::U8);
        let mut b = FunctionBuilder::new(FuncName::new("math", "add"), sig);
        let entry = b.create_label("entry");
        b.place_label(entry).unwrap();
        let v0 = b.load_var("a", Type::U8).unwrap();
        let v1 = b.load_var("b", Type::U8).unwrap();
        let v2 = b.binary(Opcode::Add, v0, v1).unwrap();
        b.ret(Some(v2));
        let func = b.finish().unwrap();

        let expected = "\
fn math.add(a: u8, b: u8) -> u8 {
entry:
    v0 = ldvar.u8 a
    v1 = ldvar.u8 b
    v2 = add.u8 v0, v1
    ret v2
}
";
        assert_eq!(func.to_string(), expected);
    }

    #[test]
    fn branches_print_label_names() {
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("n", Type::U16));
        sig.ret = Some(Type::U16);
        let mut b = FunctionBuilder::new(FuncName::new("m", "f"), sig);
        let entry = b.create_label("entry");
        let done = b.create_label("done");
        b.place_label(entry).unwrap();
        let v0 = b.load_var("n", Type::U16).unwrap();
        let zero = b.load_const(0, Type::U16);
        b.br_cmp(CondCode::Eq, v0, zero, done).unwrap();
        b.jump(entry);
        b.place_label(done).unwrap();
        b.ret(Some(v0));
        let func = b.finish().unwrap();
        let text = func.to_string();
        assert!(text.contains("jcc eq v0, v1, done"));
        assert!(text.contains("jmp entry"));
        assert!(text.contains("done:"));
    }

    #[test]
    fn data_escapes() {
        let mut text = String::new();
        write_data_decl(
            &mut text,
            "msg",
            &DataPayload::Str(b"a\"\\\x01".to_vec()),
        )
        .unwrap();
        assert_eq!(text, "data msg = str \"a\\\"\\\\\\x01\"\n");
    }
}
