//! Intel 8080 backend.
//!
//! The 8080 is the Z80's ancestor: no shadow bank, no index registers, no `DJNZ`, no
//! `SBC HL`, and the classic mnemonics (`MVI`, `LXI`, `DAD`, `SHLD`). Values and named slots
//! live at fixed addresses assigned module-wide, and calls use the same static memory
//! convention as the 6502 backend: arguments are stored into the callee's parameter slots
//! before `CALL`; results return in A or HL.
//!
//! Multiplication and division have no helper library here yet; they surface as unsupported
//! opcodes rather than silently wrong code.

use crate::asm::{join_lines, AsmBuilder};
use crate::diagnostic::Diagnostics;
use crate::entity::EntityRef;
use crate::isa::{Capabilities, TargetIsa};
use crate::mir::{
    CondCode, DataPayload, FuncId, Function, InstructionData, Module, Opcode, Value,
};
use crate::result::{CodegenError, CodegenResult};
use crate::settings::Flags;
use std::collections::BTreeMap;

/// The Intel 8080 code generator.
pub struct I8080Backend;

impl TargetIsa for I8080Backend {
    fn name(&self) -> &'static str {
        "8080"
    }

    fn extension(&self) -> &'static str {
        "asm"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_smc: false,
            shadow_registers: false,
            indexed_addressing: false,
            native_16bit: false,
        }
    }

    fn default_lowmem(&self) -> u16 {
        0xF000
    }

    fn compile_module(
        &self,
        module: &Module,
        flags: &Flags,
        diag: &mut Diagnostics,
    ) -> CodegenResult<String> {
        let base = flags.lowmem_base.unwrap_or_else(|| self.default_lowmem());
        let slots = Slots::compute(module, base);
        let mut asm = AsmBuilder::new();
        asm.emit_comment(format!("module {}", module.name));
        asm.emit("ORG 0100H");

        if let Some(main) = module.find_function("main") {
            asm.emit(format!("CALL {}", module.funcs[main].qualified_name()));
            asm.emit("HLT");
        }

        for (id, func) in module.funcs.iter() {
            if func.is_extern {
                continue;
            }
            FuncEmitter {
                module,
                func,
                slots: &slots,
                id,
                label_counter: 0,
            }
            .emit(&mut asm)?;
        }

        if module.data.len() > 0 {
            asm.emit_blank();
            for (_, decl) in module.data.iter() {
                asm.emit_label(&decl.symbol)?;
                emit_data(&mut asm, &decl.payload);
            }
        }

        let _ = diag;
        Ok(join_lines(&asm.into_lines()))
    }
}

fn emit_data(asm: &mut AsmBuilder, payload: &DataPayload) {
    match payload {
        DataPayload::Str(bytes) => {
            if bytes.len() > 255 {
                asm.emit(format!("DW {}", bytes.len()));
            } else {
                asm.emit(format!("DB {}", bytes.len()));
            }
            for chunk in bytes.chunks(16) {
                let items: Vec<String> = chunk.iter().map(|b| b.to_string()).collect();
                asm.emit(format!("DB {}", items.join(", ")));
            }
        }
        DataPayload::Bytes(bytes) => {
            for chunk in bytes.chunks(16) {
                let items: Vec<String> = chunk.iter().map(|b| b.to_string()).collect();
                asm.emit(format!("DB {}", items.join(", ")));
            }
        }
        DataPayload::Words(words) => {
            for chunk in words.chunks(8) {
                let items: Vec<String> = chunk.iter().map(|w| w.to_string()).collect();
                asm.emit(format!("DW {}", items.join(", ")));
            }
        }
    }
}

/// Module-wide fixed addresses for named slots and values.
struct Slots {
    named: BTreeMap<(u32, String), u16>,
    values: BTreeMap<(u32, u32), u16>,
}

impl Slots {
    fn compute(module: &Module, base: u16) -> Self {
        let mut next = base;
        let mut take = |size: u16| {
            let addr = next;
            next += size;
            addr
        };
        let mut named = BTreeMap::new();
        let mut values = BTreeMap::new();
        for (id, func) in module.funcs.iter() {
            if func.is_extern {
                continue;
            }
            for param in &func.signature.params {
                let size = module.types.size_of(param.ty).max(1);
                named.insert((id.index() as u32, param.name.clone()), take(size));
            }
            for (_, local) in func.locals.iter() {
                let size = module.types.size_of(local.ty).max(1);
                named.insert((id.index() as u32, local.name.clone()), take(size));
            }
            for (value, data) in func.values.iter() {
                if data.def.is_none() {
                    continue;
                }
                let size = if func.value_type(value).is_byte() { 1 } else { 2 };
                values.insert((id.index() as u32, value.index() as u32), take(size));
            }
        }
        Self { named, values }
    }
}

struct FuncEmitter<'a> {
    module: &'a Module,
    func: &'a Function,
    slots: &'a Slots,
    id: FuncId,
    label_counter: u32,
}

impl<'a> FuncEmitter<'a> {
    fn value_addr(&self, value: Value) -> u16 {
        self.slots.values[&(self.id.index() as u32, value.index() as u32)]
    }

    fn named_addr(&self, name: &str) -> Option<u16> {
        self.slots
            .named
            .get(&(self.id.index() as u32, name.to_string()))
            .copied()
    }

    fn wide(&self, value: Value) -> bool {
        !self.func.value_type(value).is_byte()
    }

    fn local_label(&self, name: &str) -> String {
        format!("{}${}", self.func.name.name, name)
    }

    fn fresh_label(&mut self, stem: &str) -> String {
        self.label_counter += 1;
        format!("{}${}{}", self.func.name.name, stem, self.label_counter)
    }

    fn unsupported(&self, opcode: Opcode) -> CodegenError {
        CodegenError::UnsupportedOpcode {
            opcode: opcode.mnemonic(),
            function: self.func.qualified_name(),
            target: "8080",
        }
    }

    /// Copy 1 or 2 bytes from a value slot to an address.
    fn copy_to(&self, asm: &mut AsmBuilder, value: Value, dst: u16) {
        if self.wide(value) {
            asm.emit(format!("LHLD {:04X}H", self.value_addr(value)));
            asm.emit(format!("SHLD {:04X}H", dst));
        } else {
            asm.emit(format!("LDA {:04X}H", self.value_addr(value)));
            asm.emit(format!("STA {:04X}H", dst));
        }
    }

    fn emit(mut self, asm: &mut AsmBuilder) -> CodegenResult<()> {
        asm.emit_blank();
        asm.emit_label(self.func.qualified_name())?;
        let layout = self.func.layout.clone();
        for inst in layout {
            let data = self.func.insts[inst].clone();
            self.emit_inst(asm, inst, &data)?;
        }
        Ok(())
    }

    fn emit_inst(
        &mut self,
        asm: &mut AsmBuilder,
        inst: crate::mir::Inst,
        data: &InstructionData,
    ) -> CodegenResult<()> {
        match data.clone() {
            InstructionData::UnaryImm { imm, ty } => {
                let dst = self.value_addr(self.func.inst_result(inst).expect("result"));
                if ty.is_byte() {
                    asm.emit(format!("MVI A, {}", imm & 0xFF));
                    asm.emit(format!("STA {:04X}H", dst));
                } else {
                    asm.emit(format!("LXI H, {}", imm & 0xFFFF));
                    asm.emit(format!("SHLD {:04X}H", dst));
                }
            }
            InstructionData::SymbolAddr { symbol } => {
                let dst = self.value_addr(self.func.inst_result(inst).expect("result"));
                match self.named_addr(&symbol) {
                    Some(addr) => asm.emit(format!("LXI H, {:04X}H", addr)),
                    None => asm.emit(format!("LXI H, {}", symbol)),
                }
                asm.emit(format!("SHLD {:04X}H", dst));
            }
            InstructionData::Unary { opcode, arg } => {
                let result = self.func.inst_result(inst).expect("result");
                self.emit_unary(asm, opcode, arg, result)?;
            }
            InstructionData::Binary { opcode, args } => {
                let result = self.func.inst_result(inst).expect("result");
                self.emit_binary(asm, opcode, args, result)?;
            }
            InstructionData::IntCompare { cond, args } => {
                let result = self.func.inst_result(inst).expect("result");
                let dst = self.value_addr(result);
                let yes = self.fresh_label("cc");
                let done = self.fresh_label("ccd");
                self.emit_branch_compare(asm, cond, args, &yes)?;
                asm.emit("MVI A, 0");
                asm.emit(format!("JMP {}", done));
                asm.emit_label(&yes)?;
                asm.emit("MVI A, 1");
                asm.emit_label(&done)?;
                asm.emit(format!("STA {:04X}H", dst));
            }
            InstructionData::LoadVar { symbol, ty } => {
                let dst = self.value_addr(self.func.inst_result(inst).expect("result"));
                let src = self.named_addr(&symbol);
                if ty.is_byte() {
                    match src {
                        Some(addr) => asm.emit(format!("LDA {:04X}H", addr)),
                        None => asm.emit(format!("LDA {}", symbol)),
                    }
                    asm.emit(format!("STA {:04X}H", dst));
                } else {
                    match src {
                        Some(addr) => asm.emit(format!("LHLD {:04X}H", addr)),
                        None => asm.emit(format!("LHLD {}", symbol)),
                    }
                    asm.emit(format!("SHLD {:04X}H", dst));
                }
            }
            InstructionData::StoreVar { symbol, arg } => {
                let dst = self.named_addr(&symbol);
                if self.wide(arg) {
                    asm.emit(format!("LHLD {:04X}H", self.value_addr(arg)));
                    match dst {
                        Some(addr) => asm.emit(format!("SHLD {:04X}H", addr)),
                        None => asm.emit(format!("SHLD {}", symbol)),
                    }
                } else {
                    asm.emit(format!("LDA {:04X}H", self.value_addr(arg)));
                    match dst {
                        Some(addr) => asm.emit(format!("STA {:04X}H", addr)),
                        None => asm.emit(format!("STA {}", symbol)),
                    }
                }
            }
            InstructionData::Jump { destination } => {
                asm.emit(format!(
                    "JMP {}",
                    self.local_label(&self.func.labels[destination].name)
                ));
            }
            InstructionData::Branch {
                opcode,
                arg,
                destination,
            } => {
                let target = self.local_label(&self.func.labels[destination].name);
                if self.wide(arg) {
                    asm.emit(format!("LHLD {:04X}H", self.value_addr(arg)));
                    asm.emit("MOV A, H");
                    asm.emit("ORA L");
                } else {
                    asm.emit(format!("LDA {:04X}H", self.value_addr(arg)));
                    asm.emit("ORA A");
                }
                match opcode {
                    Opcode::JumpIfZero => asm.emit(format!("JZ {}", target)),
                    Opcode::JumpIfNotZero => asm.emit(format!("JNZ {}", target)),
                    _ => unreachable!(),
                }
            }
            InstructionData::BranchCompare {
                cond,
                args,
                destination,
            } => {
                let target = self.local_label(&self.func.labels[destination].name);
                self.emit_branch_compare(asm, cond, args, &target)?;
            }
            InstructionData::Call { func, args } => {
                let callee_id = self.module.find_function(&func);
                let target = callee_id
                    .map(|id| self.module.funcs[id].qualified_name())
                    .unwrap_or_else(|| func.clone());
                if let Some(callee_id) = callee_id {
                    let callee = &self.module.funcs[callee_id];
                    // Externs have no slots in this module.
                    if !callee.is_extern {
                        for (param, &arg) in callee.signature.params.iter().zip(args.iter()) {
                            let dst = self.slots.named
                                [&(callee_id.index() as u32, param.name.clone())];
                            self.copy_to(asm, arg, dst);
                        }
                    }
                }
                asm.emit(format!("CALL {}", target));
                if let Some(result) = self.func.inst_result(inst) {
                    if self.wide(result) {
                        asm.emit(format!("SHLD {:04X}H", self.value_addr(result)));
                    } else {
                        asm.emit(format!("STA {:04X}H", self.value_addr(result)));
                    }
                }
            }
            InstructionData::Return { arg } => {
                if let Some(arg) = arg {
                    if self.wide(arg) {
                        asm.emit(format!("LHLD {:04X}H", self.value_addr(arg)));
                    } else {
                        asm.emit(format!("LDA {:04X}H", self.value_addr(arg)));
                    }
                }
                asm.emit("RET");
            }
            InstructionData::LabelMark { label } => {
                let name = self.local_label(&self.func.labels[label].name);
                asm.emit_label(name)?;
            }
            InstructionData::IterBegin { count } => {
                // No DJNZ on the 8080; the counter lives in a slot of its own and the step
                // decrements it by hand.
                asm.emit(format!("LDA {:04X}H", self.value_addr(count)));
                asm.emit("MOV B, A");
            }
            InstructionData::IterStep { destination } => {
                let target = self.local_label(&self.func.labels[destination].name);
                asm.emit("DCR B");
                asm.emit(format!("JNZ {}", target));
            }
            InstructionData::IterEnd => {}
            ref other => return Err(self.unsupported(other.opcode())),
        }
        Ok(())
    }

    fn emit_unary(
        &mut self,
        asm: &mut AsmBuilder,
        opcode: Opcode,
        arg: Value,
        result: Value,
    ) -> CodegenResult<()> {
        let dst = self.value_addr(result);
        if self.wide(arg) {
            asm.emit(format!("LHLD {:04X}H", self.value_addr(arg)));
            match opcode {
                Opcode::Move => {}
                Opcode::Inc => asm.emit("INX H"),
                Opcode::Dec => asm.emit("DCX H"),
                Opcode::Not => {
                    asm.emit("MOV A, H");
                    asm.emit("CMA");
                    asm.emit("MOV H, A");
                    asm.emit("MOV A, L");
                    asm.emit("CMA");
                    asm.emit("MOV L, A");
                }
                Opcode::Neg => {
                    asm.emit("MOV A, H");
                    asm.emit("CMA");
                    asm.emit("MOV H, A");
                    asm.emit("MOV A, L");
                    asm.emit("CMA");
                    asm.emit("MOV L, A");
                    asm.emit("INX H");
                }
                Opcode::Test => {
                    let yes = self.fresh_label("tz");
                    let done = self.fresh_label("tzd");
                    asm.emit("MOV A, H");
                    asm.emit("ORA L");
                    asm.emit(format!("JZ {}", yes));
                    asm.emit("MVI A, 0");
                    asm.emit(format!("JMP {}", done));
                    asm.emit_label(&yes)?;
                    asm.emit("MVI A, 1");
                    asm.emit_label(&done)?;
                    asm.emit(format!("STA {:04X}H", dst));
                    return Ok(());
                }
                _ => return Err(self.unsupported(opcode)),
            }
            asm.emit(format!("SHLD {:04X}H", dst));
            return Ok(());
        }

        asm.emit(format!("LDA {:04X}H", self.value_addr(arg)));
        match opcode {
            Opcode::Move => {}
            Opcode::Inc => asm.emit("INR A"),
            Opcode::Dec => asm.emit("DCR A"),
            Opcode::Not => asm.emit("CMA"),
            Opcode::Neg => {
                asm.emit("CMA");
                asm.emit("INR A");
            }
            Opcode::Test => {
                let yes = self.fresh_label("tz");
                let done = self.fresh_label("tzd");
                asm.emit("ORA A");
                asm.emit(format!("JZ {}", yes));
                asm.emit("MVI A, 0");
                asm.emit(format!("JMP {}", done));
                asm.emit_label(&yes)?;
                asm.emit("MVI A, 1");
                asm.emit_label(&done)?;
            }
            _ => return Err(self.unsupported(opcode)),
        }
        asm.emit(format!("STA {:04X}H", dst));
        Ok(())
    }

    fn emit_binary(
        &mut self,
        asm: &mut AsmBuilder,
        opcode: Opcode,
        args: [Value; 2],
        result: Value,
    ) -> CodegenResult<()> {
        let dst = self.value_addr(result);
        let lhs = self.value_addr(args[0]);
        let rhs = self.value_addr(args[1]);
        if self.wide(args[0]) {
            match opcode {
                Opcode::Add => {
                    asm.emit(format!("LHLD {:04X}H", rhs));
                    asm.emit("XCHG");
                    asm.emit(format!("LHLD {:04X}H", lhs));
                    asm.emit("DAD D");
                    asm.emit(format!("SHLD {:04X}H", dst));
                }
                Opcode::Sub => {
                    // No SBC HL here; subtract byte-wise through borrow.
                    asm.emit(format!("LDA {:04X}H", rhs));
                    asm.emit("MOV B, A");
                    asm.emit(format!("LDA {:04X}H", lhs));
                    asm.emit("SUB B");
                    asm.emit(format!("STA {:04X}H", dst));
                    asm.emit(format!("LDA {:04X}H", rhs + 1));
                    asm.emit("MOV B, A");
                    asm.emit(format!("LDA {:04X}H", lhs + 1));
                    asm.emit("SBB B");
                    asm.emit(format!("STA {:04X}H", dst + 1));
                }
                Opcode::And | Opcode::Or | Opcode::Xor => {
                    let mnemonic = match opcode {
                        Opcode::And => "ANA",
                        Opcode::Or => "ORA",
                        _ => "XRA",
                    };
                    for offset in 0..2u16 {
                        asm.emit(format!("LDA {:04X}H", rhs + offset));
                        asm.emit("MOV B, A");
                        asm.emit(format!("LDA {:04X}H", lhs + offset));
                        asm.emit(format!("{} B", mnemonic));
                        asm.emit(format!("STA {:04X}H", dst + offset));
                    }
                }
                _ => return Err(self.unsupported(opcode)),
            }
            return Ok(());
        }

        let mnemonic = match opcode {
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::And => "ANA",
            Opcode::Or => "ORA",
            Opcode::Xor => "XRA",
            _ => return Err(self.unsupported(opcode)),
        };
        asm.emit(format!("LDA {:04X}H", rhs));
        asm.emit("MOV B, A");
        asm.emit(format!("LDA {:04X}H", lhs));
        asm.emit(format!("{} B", mnemonic));
        asm.emit(format!("STA {:04X}H", dst));
        Ok(())
    }

    fn emit_branch_compare(
        &mut self,
        asm: &mut AsmBuilder,
        cond: CondCode,
        args: [Value; 2],
        target: &str,
    ) -> CodegenResult<()> {
        let (cond, lhs, rhs) = match cond {
            CondCode::Gt => (CondCode::Lt, args[1], args[0]),
            CondCode::Le => (CondCode::Ge, args[1], args[0]),
            other => (other, args[0], args[1]),
        };
        if self.wide(lhs) {
            // Subtract and branch on the resulting flags.
            asm.emit(format!("LDA {:04X}H", self.value_addr(rhs)));
            asm.emit("MOV B, A");
            asm.emit(format!("LDA {:04X}H", self.value_addr(lhs)));
            asm.emit("SUB B");
            asm.emit("MOV C, A");
            asm.emit(format!("LDA {:04X}H", self.value_addr(rhs) + 1));
            asm.emit("MOV B, A");
            asm.emit(format!("LDA {:04X}H", self.value_addr(lhs) + 1));
            asm.emit("SBB B");
            match cond {
                CondCode::Eq => {
                    asm.emit("ORA C");
                    asm.emit(format!("JZ {}", target));
                }
                CondCode::Ne => {
                    asm.emit("ORA C");
                    asm.emit(format!("JNZ {}", target));
                }
                CondCode::Lt => asm.emit(format!("JC {}", target)),
                CondCode::Ge => asm.emit(format!("JNC {}", target)),
                _ => unreachable!(),
            }
        } else {
            asm.emit(format!("LDA {:04X}H", self.value_addr(rhs)));
            asm.emit("MOV B, A");
            asm.emit(format!("LDA {:04X}H", self.value_addr(lhs)));
            asm.emit("CMP B");
            match cond {
                CondCode::Eq => asm.emit(format!("JZ {}", target)),
                CondCode::Ne => asm.emit(format!("JNZ {}", target)),
                CondCode::Lt => asm.emit(format!("JC {}", target)),
                CondCode::Ge => asm.emit(format!("JNC {}", target)),
                _ => unreachable!(),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{AbiParam, FuncName, FunctionBuilder, Signature, Type};
    use crate::opt;

    #[test]
    fn eight_bit_add_uses_classic_mnemonics() {
        let mut module = Module::new("m");
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("a", Type::U8));
        sig.params.push(AbiParam::new("b", Type::U8));
        sig.ret = Some(Type::U8);
        let mut b = FunctionBuilder::new(FuncName::new("m", "add"), sig);
        let x = b.load_var("a", Type::U8).unwrap();
        let y = b.load_var("b", Type::U8).unwrap();
        let sum = b.binary(Opcode::Add, x, y).unwrap();
        b.ret(Some(sum));
        module.add_function(b.finish().unwrap());

        let flags = Flags::default();
        let mut diag = Diagnostics::new();
        opt::optimize(&mut module, &flags, false, &mut diag).unwrap();
        let text = I8080Backend
            .compile_module(&module, &flags, &mut diag)
            .unwrap();
        assert!(text.contains("MOV B, A"), "{}", text);
        assert!(text.contains("ADD B"), "{}", text);
        assert!(!text.contains("EXX"), "{}", text);
        assert!(!text.contains("DJNZ"), "{}", text);
    }

    #[test]
    fn wide_add_goes_through_dad() {
        let mut module = Module::new("m");
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("a", Type::U16));
        sig.params.push(AbiParam::new("b", Type::U16));
        sig.ret = Some(Type::U16);
        let mut b = FunctionBuilder::new(FuncName::new("m", "add16"), sig);
        let x = b.load_var("a", Type::U16).unwrap();
        let y = b.load_var("b", Type::U16).unwrap();
        let sum = b.binary(Opcode::Add, x, y).unwrap();
        b.ret(Some(sum));
        module.add_function(b.finish().unwrap());

        let flags = Flags::default();
        let mut diag = Diagnostics::new();
        opt::optimize(&mut module, &flags, false, &mut diag).unwrap();
        let text = I8080Backend
            .compile_module(&module, &flags, &mut diag)
            .unwrap();
        assert!(text.contains("XCHG"), "{}", text);
        assert!(text.contains("DAD D"), "{}", text);
    }
}
