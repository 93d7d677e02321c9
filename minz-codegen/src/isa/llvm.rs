//! LLVM IR backend.
//!
//! Emits textual LLVM IR. Named storage becomes `alloca` slots loaded and stored under their
//! MIR names (another consumer of the symbol-completeness invariant), values stay in SSA
//! registers, and the linear label layout is rebuilt into properly terminated basic blocks:
//! a label starting a block receives a `br` from its fall-through predecessor, and every
//! conditional branch gets a synthetic continuation block for its false edge.

use crate::diagnostic::Diagnostics;
use crate::isa::{Capabilities, TargetIsa};
use crate::mir::{
    CondCode, DataPayload, Function, InstructionData, Module, Opcode, Type, Value,
};
use crate::result::{CodegenError, CodegenResult};
use crate::settings::Flags;
use core::fmt::Write;

/// The LLVM IR generator.
pub struct LlvmBackend;

impl TargetIsa for LlvmBackend {
    fn name(&self) -> &'static str {
        "llvm"
    }

    fn extension(&self) -> &'static str {
        "ll"
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
        writeln!(out, "; module {}", module.name).unwrap();
        writeln!(out, "target datalayout = \"e\"").unwrap();
        writeln!(out).unwrap();

        for (_, decl) in module.data.iter() {
            emit_data(&mut out, &decl.symbol, &decl.payload);
        }
        if module.data.len() > 0 {
            writeln!(out).unwrap();
        }

        for (_, func) in module.funcs.iter() {
            if func.is_extern {
                writeln!(out, "declare {}", header_of(func, false)).unwrap();
                continue;
            }
            emit_function(&mut out, module, func)?;
            writeln!(out).unwrap();
        }

        let _ = (flags, diag);
        Ok(out)
    }
}

fn ll_type(ty: Type) -> &'static str {
    match ty {
        Type::U8 | Type::I8 | Type::Bool => "i8",
        _ => "i16",
    }
}

fn header_of(func: &Function, define: bool) -> String {
    let ret = match func.signature.ret {
        Some(ty) => ll_type(ty),
        None => "void",
    };
    let params = func
        .signature
        .params
        .iter()
        .map(|p| {
            if define {
                format!("{} %arg.{}", ll_type(p.ty), p.name)
            } else {
                ll_type(p.ty).to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("{} @{}({})", ret, func.qualified_name(), params)
}

fn emit_data(out: &mut String, symbol: &str, payload: &DataPayload) {
    let bytes: Vec<u8> = match payload {
        DataPayload::Str(bytes) => {
            let mut all = Vec::new();
            if bytes.len() > 255 {
                all.push((bytes.len() & 0xFF) as u8);
                all.push((bytes.len() >> 8) as u8);
            } else {
                all.push(bytes.len() as u8);
            }
            all.extend_from_slice(bytes);
            all
        }
        DataPayload::Bytes(bytes) => bytes.clone(),
        DataPayload::Words(words) => words
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect(),
    };
    let mut escaped = String::new();
    for b in &bytes {
        write!(escaped, "\\{:02X}", b).unwrap();
    }
    writeln!(
        out,
        "@{} = private constant [{} x i8] c\"{}\"",
        symbol,
        bytes.len(),
        escaped
    )
    .unwrap();
}

fn icmp_cond(cond: CondCode, signed: bool) -> &'static str {
    match (cond, signed) {
        (CondCode::Eq, _) => "eq",
        (CondCode::Ne, _) => "ne",
        (CondCode::Lt, false) => "ult",
        (CondCode::Le, false) => "ule",
        (CondCode::Gt, false) => "ugt",
        (CondCode::Ge, false) => "uge",
        (CondCode::Lt, true) => "slt",
        (CondCode::Le, true) => "sle",
        (CondCode::Gt, true) => "sgt",
        (CondCode::Ge, true) => "sge",
    }
}

struct LlvmEmitter<'a> {
    module: &'a Module,
    func: &'a Function,
    out: &'a mut String,
    /// True while the current block lacks a terminator.
    open: bool,
    tmp: u32,
}

impl<'a> LlvmEmitter<'a> {
    fn tmp_name(&mut self, stem: &str) -> String {
        self.tmp += 1;
        format!("%{}.{}", stem, self.tmp)
    }

    fn v(&self, value: Value) -> String {
        format!("%{}", value)
    }

    fn slot(&self, symbol: &str) -> String {
        format!("%slot.{}", symbol)
    }

    fn begin_block(&mut self, name: &str) {
        if self.open {
            writeln!(self.out, "  br label %{}", name).unwrap();
        }
        writeln!(self.out, "{}:", name).unwrap();
        self.open = true;
    }

    fn terminate(&mut self, text: String) {
        writeln!(self.out, "  {}", text).unwrap();
        self.open = false;
    }

    fn emit_inst(&mut self, inst: crate::mir::Inst) -> CodegenResult<()> {
        let func_name = self.func.qualified_name();
        let unsupported = |opcode: Opcode| CodegenError::UnsupportedOpcode {
            opcode: opcode.mnemonic(),
            function: func_name.clone(),
            target: "llvm",
        };
        let func = self.func;
        match func.insts[inst].clone() {
            InstructionData::LabelMark { label } => {
                let name = func.labels[label].name.clone();
                self.begin_block(&name);
                return Ok(());
            }
            _ => {}
        }
        if !self.open {
            // Unreachable tail after a terminator; give it an anonymous block.
            let name = self.tmp_name("dead");
            writeln!(self.out, "{}:", &name[1..]).unwrap();
            self.open = true;
        }
        match func.insts[inst].clone() {
            InstructionData::UnaryImm { imm, ty } => {
                let r = func.inst_result(inst).expect("result");
                writeln!(
                    self.out,
                    "  {} = add {} {}, 0",
                    self.v(r),
                    ll_type(ty),
                    imm & ty.mask().unwrap_or(0xFFFF)
                )
                .unwrap();
            }
            InstructionData::SymbolAddr { symbol } => {
                let r = func.inst_result(inst).expect("result");
                writeln!(
                    self.out,
                    "  {} = ptrtoint ptr @{} to i16",
                    self.v(r),
                    symbol
                )
                .unwrap();
            }
            InstructionData::Unary { opcode, arg } => {
                let r = func.inst_result(inst).expect("result");
                let ty = ll_type(func.value_type(arg));
                let text = match opcode {
                    Opcode::Move => format!("{} = add {} {}, 0", self.v(r), ty, self.v(arg)),
                    Opcode::Not => format!("{} = xor {} {}, -1", self.v(r), ty, self.v(arg)),
                    Opcode::Neg => format!("{} = sub {} 0, {}", self.v(r), ty, self.v(arg)),
                    Opcode::Inc => format!("{} = add {} {}, 1", self.v(r), ty, self.v(arg)),
                    Opcode::Dec => format!("{} = sub {} {}, 1", self.v(r), ty, self.v(arg)),
                    Opcode::Test => {
                        let flag = self.tmp_name("t");
                        writeln!(
                            self.out,
                            "  {} = icmp eq {} {}, 0",
                            flag,
                            ty,
                            self.v(arg)
                        )
                        .unwrap();
                        format!("{} = zext i1 {} to i8", self.v(r), flag)
                    }
                    _ => return Err(unsupported(opcode)),
                };
                writeln!(self.out, "  {}", text).unwrap();
            }
            InstructionData::Binary { opcode, args } => {
                let r = func.inst_result(inst).expect("result");
                let ty = ll_type(func.value_type(args[0]));
                let op = match opcode {
                    Opcode::Add => "add",
                    Opcode::Sub => "sub",
                    Opcode::Mul => "mul",
                    Opcode::Div => "udiv",
                    Opcode::Mod => "urem",
                    Opcode::And => "and",
                    Opcode::Or => "or",
                    Opcode::Xor => "xor",
                    Opcode::Shl => "shl",
                    Opcode::Shr => "lshr",
                    _ => return Err(unsupported(opcode)),
                };
                writeln!(
                    self.out,
                    "  {} = {} {} {}, {}",
                    self.v(r),
                    op,
                    ty,
                    self.v(args[0]),
                    self.v(args[1])
                )
                .unwrap();
            }
            InstructionData::IntCompare { cond, args } => {
                let r = func.inst_result(inst).expect("result");
                let ty = func.value_type(args[0]);
                let flag = self.tmp_name("c");
                writeln!(
                    self.out,
                    "  {} = icmp {} {} {}, {}",
                    flag,
                    icmp_cond(cond, ty.is_signed()),
                    ll_type(ty),
                    self.v(args[0]),
                    self.v(args[1])
                )
                .unwrap();
                writeln!(self.out, "  {} = zext i1 {} to i8", self.v(r), flag).unwrap();
            }
            InstructionData::LoadVar { symbol, ty } => {
                let r = func.inst_result(inst).expect("result");
                writeln!(
                    self.out,
                    "  {} = load {}, ptr {}",
                    self.v(r),
                    ll_type(ty),
                    self.slot(&symbol)
                )
                .unwrap();
            }
            InstructionData::StoreVar { symbol, arg } => {
                writeln!(
                    self.out,
                    "  store {} {}, ptr {}",
                    ll_type(func.value_type(arg)),
                    self.v(arg),
                    self.slot(&symbol)
                )
                .unwrap();
            }
            InstructionData::Jump { destination } => {
                let name = func.labels[destination].name.clone();
                self.terminate(format!("br label %{}", name));
            }
            InstructionData::Branch {
                opcode,
                arg,
                destination,
            } => {
                let name = func.labels[destination].name.clone();
                let flag = self.tmp_name("b");
                let fall = self.tmp_name("fall");
                let cmp = match opcode {
                    Opcode::JumpIfZero => "eq",
                    Opcode::JumpIfNotZero => "ne",
                    _ => unreachable!(),
                };
                writeln!(
                    self.out,
                    "  {} = icmp {} {} {}, 0",
                    flag,
                    cmp,
                    ll_type(func.value_type(arg)),
                    self.v(arg)
                )
                .unwrap();
                self.terminate(format!(
                    "br i1 {}, label %{}, label %{}",
                    flag,
                    name,
                    &fall[1..]
                ));
                self.begin_block(&fall[1..]);
            }
            InstructionData::BranchCompare {
                cond,
                args,
                destination,
            } => {
                let name = func.labels[destination].name.clone();
                let ty = func.value_type(args[0]);
                let flag = self.tmp_name("b");
                let fall = self.tmp_name("fall");
                writeln!(
                    self.out,
                    "  {} = icmp {} {} {}, {}",
                    flag,
                    icmp_cond(cond, ty.is_signed()),
                    ll_type(ty),
                    self.v(args[0]),
                    self.v(args[1])
                )
                .unwrap();
                self.terminate(format!(
                    "br i1 {}, label %{}, label %{}",
                    flag,
                    name,
                    &fall[1..]
                ));
                self.begin_block(&fall[1..]);
            }
            InstructionData::Call { func: callee, args } => {
                let callee_id = self.module.find_function(&callee);
                let target = callee_id
                    .map(|id| self.module.funcs[id].qualified_name())
                    .unwrap_or_else(|| callee.clone());
                let arg_list = args
                    .iter()
                    .map(|&a| format!("{} {}", ll_type(func.value_type(a)), self.v(a)))
                    .collect::<Vec<_>>()
                    .join(", ");
                match func.inst_result(inst) {
                    Some(r) => writeln!(
                        self.out,
                        "  {} = call {} @{}({})",
                        self.v(r),
                        ll_type(func.value_type(r)),
                        target,
                        arg_list
                    )
                    .unwrap(),
                    None => {
                        writeln!(self.out, "  call void @{}({})", target, arg_list).unwrap()
                    }
                }
            }
            InstructionData::Return { arg } => match arg {
                Some(arg) => {
                    let ty = ll_type(func.value_type(arg));
                    self.terminate(format!("ret {} {}", ty, self.v(arg)));
                }
                None => self.terminate("ret void".to_string()),
            },
            InstructionData::LabelMark { .. } => unreachable!("handled above"),
            ref other => return Err(unsupported(other.opcode())),
        }
        Ok(())
    }
}

fn emit_function(out: &mut String, module: &Module, func: &Function) -> CodegenResult<()> {
    writeln!(out, "define {} {{", header_of(func, true)).unwrap();
    writeln!(out, "entry.0:").unwrap();
    // Named storage: one alloca per parameter and local, stores of the incoming arguments.
    for param in &func.signature.params {
        writeln!(out, "  %slot.{} = alloca {}", param.name, ll_type(param.ty)).unwrap();
        writeln!(
            out,
            "  store {} %arg.{}, ptr %slot.{}",
            ll_type(param.ty),
            param.name,
            param.name
        )
        .unwrap();
    }
    for (_, local) in func.locals.iter() {
        writeln!(out, "  %slot.{} = alloca {}", local.name, ll_type(local.ty)).unwrap();
        writeln!(
            out,
            "  store {} 0, ptr %slot.{}",
            ll_type(local.ty),
            local.name
        )
        .unwrap();
    }

    let mut emitter = LlvmEmitter {
        module,
        func,
        out,
        open: true,
        tmp: 0,
    };
    for &inst in &func.layout {
        emitter.emit_inst(inst)?;
    }
    if emitter.open {
        match func.signature.ret {
            Some(ty) => writeln!(emitter.out, "  ret {} 0", ll_type(ty)).unwrap(),
            None => writeln!(emitter.out, "  ret void").unwrap(),
        }
    }
    writeln!(emitter.out, "}}").unwrap();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{AbiParam, FuncName, FunctionBuilder, Signature};
    use crate::opt;

    #[test]
    fn blocks_are_terminated_and_slots_named() {
        let mut module = Module::new("m");
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("n", Type::U8));
        sig.ret = Some(Type::U8);
        let mut b = FunctionBuilder::new(FuncName::new("m", "f"), sig);
        let done = b.create_label("done");
        let n = b.load_var("n", Type::U8).unwrap();
        let zero = b.load_const(0, Type::U8);
        b.br_cmp(CondCode::Eq, n, zero, done).unwrap();
        let one = b.load_const(1, Type::U8);
        let m = b.binary(Opcode::Add, n, one).unwrap();
        b.ret(Some(m));
        b.place_label(done).unwrap();
        b.ret(Some(n));
        module.add_function(b.finish().unwrap());

        let flags = Flags::default();
        let mut diag = Diagnostics::new();
        opt::optimize(&mut module, &flags, false, &mut diag).unwrap();
        let text = LlvmBackend
            .compile_module(&module, &flags, &mut diag)
            .unwrap();
        assert!(text.contains("define i8 @m.f(i8 %arg.n)"), "{}", text);
        assert!(text.contains("%slot.n = alloca i8"), "{}", text);
        assert!(text.contains("icmp eq i8"), "{}", text);
        assert!(text.contains("done:"), "{}", text);
        // The false edge of the compare lands in a synthetic block.
        assert!(text.contains("label %fall."), "{}", text);
    }

    #[test]
    fn data_is_a_byte_constant() {
        let mut module = Module::new("m");
        module.add_data("msg", DataPayload::Str(b"Hi".to_vec()));
        let mut b = FunctionBuilder::new(FuncName::new("m", "nop"), Signature::new());
        b.ret(None);
        module.add_function(b.finish().unwrap());

        let flags = Flags::default();
        let mut diag = Diagnostics::new();
        let text = LlvmBackend
            .compile_module(&module, &flags, &mut diag)
            .unwrap();
        assert!(
            text.contains("@msg = private constant [3 x i8] c\"\\02\\48\\69\""),
            "{}",
            text
        );
    }
}
