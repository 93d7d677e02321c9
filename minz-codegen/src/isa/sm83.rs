//! SM83 (Game Boy) backend.
//!
//! The SM83 looks like a Z80 but drops the pieces the Z80 backend leans on: no shadow bank, no
//! IX/IY, no `DJNZ`, and crucially no `LD HL, (nn)` or `SBC HL, rr`, so wide values move byte
//! by byte through A. Cartridge code runs from ROM, which also rules the SMC conventions out
//! at the capability level. Named slots and values live in work RAM from `$C000`, assigned
//! module-wide, with the same static call convention as the other memory-file backends.

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

/// The SM83 code generator.
pub struct Sm83Backend;

impl TargetIsa for Sm83Backend {
    fn name(&self) -> &'static str {
        "sm83"
    }

    fn extension(&self) -> &'static str {
        "gb.s"
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
        0xC000
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
        asm.emit("ORG $0150");

        if let Some(main) = module.find_function("main") {
            asm.emit(format!("CALL {}", module.funcs[main].qualified_name()));
            asm.emit("STOP");
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
            target: "sm83",
        }
    }

    /// Wide loads go byte by byte; there is no `LD HL, (nn)` on this core.
    fn load_wide(&self, asm: &mut AsmBuilder, addr: u16) {
        asm.emit(format!("LD A, (${:04X})", addr));
        asm.emit("LD L, A");
        asm.emit(format!("LD A, (${:04X})", addr + 1));
        asm.emit("LD H, A");
    }

    fn store_wide(&self, asm: &mut AsmBuilder, addr: u16) {
        asm.emit("LD A, L");
        asm.emit(format!("LD (${:04X}), A", addr));
        asm.emit("LD A, H");
        asm.emit(format!("LD (${:04X}), A", addr + 1));
    }

    fn copy_to(&self, asm: &mut AsmBuilder, value: Value, dst: u16) {
        let src = self.value_addr(value);
        asm.emit(format!("LD A, (${:04X})", src));
        asm.emit(format!("LD (${:04X}), A", dst));
        if self.wide(value) {
            asm.emit(format!("LD A, (${:04X})", src + 1));
            asm.emit(format!("LD (${:04X}), A", dst + 1));
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
                asm.emit(format!("LD A, {}", imm & 0xFF));
                asm.emit(format!("LD (${:04X}), A", dst));
                if !ty.is_byte() {
                    asm.emit(format!("LD A, {}", (imm >> 8) & 0xFF));
                    asm.emit(format!("LD (${:04X}), A", dst + 1));
                }
            }
            InstructionData::SymbolAddr { symbol } => {
                let dst = self.value_addr(self.func.inst_result(inst).expect("result"));
                match self.named_addr(&symbol) {
                    Some(addr) => asm.emit(format!("LD HL, ${:04X}", addr)),
                    None => asm.emit(format!("LD HL, {}", symbol)),
                }
                self.store_wide(asm, dst);
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
                asm.emit("XOR A");
                asm.emit(format!("JP {}", done));
                asm.emit_label(&yes)?;
                asm.emit("LD A, 1");
                asm.emit_label(&done)?;
                asm.emit(format!("LD (${:04X}), A", dst));
            }
            InstructionData::LoadVar { symbol, ty } => {
                let dst = self.value_addr(self.func.inst_result(inst).expect("result"));
                match (self.named_addr(&symbol), ty.is_byte()) {
                    (Some(addr), true) => {
                        asm.emit(format!("LD A, (${:04X})", addr));
                        asm.emit(format!("LD (${:04X}), A", dst));
                    }
                    (Some(addr), false) => {
                        self.load_wide(asm, addr);
                        self.store_wide(asm, dst);
                    }
                    (None, true) => {
                        asm.emit(format!("LD A, ({})", symbol));
                        asm.emit(format!("LD (${:04X}), A", dst));
                    }
                    (None, false) => {
                        asm.emit(format!("LD A, ({})", symbol));
                        asm.emit(format!("LD (${:04X}), A", dst));
                        asm.emit(format!("LD A, ({} + 1)", symbol));
                        asm.emit(format!("LD (${:04X}), A", dst + 1));
                    }
                }
            }
            InstructionData::StoreVar { symbol, arg } => match self.named_addr(&symbol) {
                Some(addr) => self.copy_to(asm, arg, addr),
                None => {
                    asm.emit(format!("LD A, (${:04X})", self.value_addr(arg)));
                    asm.emit(format!("LD ({}), A", symbol));
                    if self.wide(arg) {
                        asm.emit(format!("LD A, (${:04X})", self.value_addr(arg) + 1));
                        asm.emit(format!("LD ({} + 1), A", symbol));
                    }
                }
            },
            InstructionData::Jump { destination } => {
                asm.emit(format!(
                    "JP {}",
                    self.local_label(&self.func.labels[destination].name)
                ));
            }
            InstructionData::Branch {
                opcode,
                arg,
                destination,
            } => {
                let target = self.local_label(&self.func.labels[destination].name);
                asm.emit(format!("LD A, (${:04X})", self.value_addr(arg)));
                if self.wide(arg) {
                    asm.emit("LD L, A");
                    asm.emit(format!("LD A, (${:04X})", self.value_addr(arg) + 1));
                    asm.emit("OR L");
                } else {
                    asm.emit("OR A");
                }
                match opcode {
                    Opcode::JumpIfZero => asm.emit(format!("JP Z, {}", target)),
                    Opcode::JumpIfNotZero => asm.emit(format!("JP NZ, {}", target)),
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
                        self.store_wide(asm, self.value_addr(result));
                    } else {
                        asm.emit(format!("LD (${:04X}), A", self.value_addr(result)));
                    }
                }
            }
            InstructionData::Return { arg } => {
                if let Some(arg) = arg {
                    if self.wide(arg) {
                        self.load_wide(asm, self.value_addr(arg));
                    } else {
                        asm.emit(format!("LD A, (${:04X})", self.value_addr(arg)));
                    }
                }
                asm.emit("RET");
            }
            InstructionData::LabelMark { label } => {
                let name = self.local_label(&self.func.labels[label].name);
                asm.emit_label(name)?;
            }
            InstructionData::IterBegin { count } => {
                asm.emit(format!("LD A, (${:04X})", self.value_addr(count)));
                asm.emit("LD B, A");
            }
            InstructionData::IterStep { destination } => {
                // No DJNZ on the SM83.
                let target = self.local_label(&self.func.labels[destination].name);
                asm.emit("DEC B");
                asm.emit(format!("JP NZ, {}", target));
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
        let src = self.value_addr(arg);
        if self.wide(arg) && opcode != Opcode::Test {
            self.load_wide(asm, src);
            match opcode {
                Opcode::Move => {}
                Opcode::Inc => asm.emit("INC HL"),
                Opcode::Dec => asm.emit("DEC HL"),
                Opcode::Not => {
                    asm.emit("LD A, H");
                    asm.emit("CPL");
                    asm.emit("LD H, A");
                    asm.emit("LD A, L");
                    asm.emit("CPL");
                    asm.emit("LD L, A");
                }
                Opcode::Neg => {
                    asm.emit("LD A, H");
                    asm.emit("CPL");
                    asm.emit("LD H, A");
                    asm.emit("LD A, L");
                    asm.emit("CPL");
                    asm.emit("LD L, A");
                    asm.emit("INC HL");
                }
                _ => return Err(self.unsupported(opcode)),
            }
            self.store_wide(asm, dst);
            return Ok(());
        }

        match opcode {
            Opcode::Test => {
                let yes = self.fresh_label("tz");
                let done = self.fresh_label("tzd");
                asm.emit(format!("LD A, (${:04X})", src));
                if self.wide(arg) {
                    asm.emit("LD L, A");
                    asm.emit(format!("LD A, (${:04X})", src + 1));
                    asm.emit("OR L");
                } else {
                    asm.emit("OR A");
                }
                asm.emit(format!("JP Z, {}", yes));
                asm.emit("XOR A");
                asm.emit(format!("JP {}", done));
                asm.emit_label(&yes)?;
                asm.emit("LD A, 1");
                asm.emit_label(&done)?;
                asm.emit(format!("LD (${:04X}), A", dst));
            }
            Opcode::Move => {
                asm.emit(format!("LD A, (${:04X})", src));
                asm.emit(format!("LD (${:04X}), A", dst));
            }
            Opcode::Not => {
                asm.emit(format!("LD A, (${:04X})", src));
                asm.emit("CPL");
                asm.emit(format!("LD (${:04X}), A", dst));
            }
            Opcode::Neg => {
                asm.emit(format!("LD A, (${:04X})", src));
                asm.emit("CPL");
                asm.emit("INC A");
                asm.emit(format!("LD (${:04X}), A", dst));
            }
            Opcode::Inc | Opcode::Dec => {
                asm.emit(format!("LD A, (${:04X})", src));
                asm.emit(if opcode == Opcode::Inc { "INC A" } else { "DEC A" });
                asm.emit(format!("LD (${:04X}), A", dst));
            }
            _ => return Err(self.unsupported(opcode)),
        }
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
        let (first, second) = match opcode {
            Opcode::Add => ("ADD A, B", "ADC A, B"),
            Opcode::Sub => ("SUB B", "SBC A, B"),
            Opcode::And => ("AND B", "AND B"),
            Opcode::Or => ("OR B", "OR B"),
            Opcode::Xor => ("XOR B", "XOR B"),
            _ => return Err(self.unsupported(opcode)),
        };
        asm.emit(format!("LD A, (${:04X})", rhs));
        asm.emit("LD B, A");
        asm.emit(format!("LD A, (${:04X})", lhs));
        asm.emit(first);
        asm.emit(format!("LD (${:04X}), A", dst));
        if self.wide(args[0]) {
            asm.emit(format!("LD A, (${:04X})", rhs + 1));
            asm.emit("LD B, A");
            asm.emit(format!("LD A, (${:04X})", lhs + 1));
            asm.emit(second);
            asm.emit(format!("LD (${:04X}), A", dst + 1));
        }
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
        let lhs_addr = self.value_addr(lhs);
        let rhs_addr = self.value_addr(rhs);
        if self.wide(lhs) {
            asm.emit(format!("LD A, (${:04X})", rhs_addr));
            asm.emit("LD B, A");
            asm.emit(format!("LD A, (${:04X})", lhs_addr));
            asm.emit("SUB B");
            asm.emit("LD C, A");
            asm.emit(format!("LD A, (${:04X})", rhs_addr + 1));
            asm.emit("LD B, A");
            asm.emit(format!("LD A, (${:04X})", lhs_addr + 1));
            asm.emit("SBC A, B");
            match cond {
                CondCode::Eq => {
                    asm.emit("OR C");
                    asm.emit(format!("JP Z, {}", target));
                }
                CondCode::Ne => {
                    asm.emit("OR C");
                    asm.emit(format!("JP NZ, {}", target));
                }
                CondCode::Lt => asm.emit(format!("JP C, {}", target)),
                CondCode::Ge => asm.emit(format!("JP NC, {}", target)),
                _ => unreachable!(),
            }
        } else {
            asm.emit(format!("LD A, (${:04X})", rhs_addr));
            asm.emit("LD B, A");
            asm.emit(format!("LD A, (${:04X})", lhs_addr));
            asm.emit("CP B");
            match cond {
                CondCode::Eq => asm.emit(format!("JP Z, {}", target)),
                CondCode::Ne => asm.emit(format!("JP NZ, {}", target)),
                CondCode::Lt => asm.emit(format!("JP C, {}", target)),
                CondCode::Ge => asm.emit(format!("JP NC, {}", target)),
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
    fn wide_values_move_byte_by_byte() {
        let mut module = Module::new("m");
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("w", Type::U16));
        sig.ret = Some(Type::U16);
        let mut b = FunctionBuilder::new(FuncName::new("m", "id"), sig);
        let w = b.load_var("w", Type::U16).unwrap();
        b.ret(Some(w));
        module.add_function(b.finish().unwrap());

        let flags = Flags::default();
        let mut diag = Diagnostics::new();
        opt::optimize(&mut module, &flags, false, &mut diag).unwrap();
        let text = Sm83Backend
            .compile_module(&module, &flags, &mut diag)
            .unwrap();
        // Work RAM base, no `LD HL, (nn)`, no shadow, no DJNZ.
        assert!(text.contains("LD A, ($C000)"), "{}", text);
        assert!(!text.contains("LD HL, ("), "{}", text);
        assert!(!text.contains("EXX"), "{}", text);
        assert!(!text.contains("DJNZ"), "{}", text);
    }
}
