//! MOS 6502 backend.
//!
//! The 6502 has one true accumulator and no register pairs, so the zero page becomes the
//! register file: every named slot and every virtual register gets a fixed address handed out
//! from the configurable zero-page base. Calls follow a static memory convention: the caller
//! stores arguments straight into the callee's parameter slots and issues `JSR`; byte results
//! come back in A, word results in A (low) and X (high).
//!
//! Addresses are assigned module-wide in declaration order, so layouts are deterministic and
//! two distinct slots can never collide. Past `$FF` the assignment spills into absolute
//! memory, which only costs the longer addressing mode.
//!
//! Word values live as little-endian byte pairs; arithmetic runs low byte then high byte
//! through carry. Conditional branches pair an inverted short branch with a `JMP` so targets
//! are never out of range.

use crate::asm::{join_lines, AsmBuilder};
use crate::diagnostic::Diagnostics;
use crate::isa::{Capabilities, TargetIsa};
use crate::mir::{
    CondCode, DataPayload, FuncId, Function, InstructionData, Module, Opcode, Value,
};
use crate::result::{CodegenError, CodegenResult};
use crate::settings::Flags;
use std::collections::BTreeMap;

/// The MOS 6502 code generator.
pub struct Mos6502Backend;

impl TargetIsa for Mos6502Backend {
    fn name(&self) -> &'static str {
        "6502"
    }

    fn extension(&self) -> &'static str {
        "s"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_smc: false,
            shadow_registers: false,
            indexed_addressing: true,
            native_16bit: false,
        }
    }

    fn default_lowmem(&self) -> u16 {
        0x0010
    }

    fn compile_module(
        &self,
        module: &Module,
        flags: &Flags,
        diag: &mut Diagnostics,
    ) -> CodegenResult<String> {
        let base = flags.lowmem_base.unwrap_or_else(|| self.default_lowmem());
        let layout = MemLayout::compute(module, base);
        let mut asm = AsmBuilder::new();
        asm.emit_comment(format!("module {}", module.name));
        asm.emit("ORG $0800");

        if let Some(main) = module.find_function("main") {
            asm.emit(format!("JSR {}", module.funcs[main].qualified_name()));
            asm.emit("BRK");
        }

        for (id, func) in module.funcs.iter() {
            if func.is_extern {
                continue;
            }
            FuncEmitter {
                module,
                func,
                layout: &layout,
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

        let lines = asm.into_lines();
        let _ = diag;
        Ok(join_lines(&lines))
    }
}

fn emit_data(asm: &mut AsmBuilder, payload: &DataPayload) {
    match payload {
        DataPayload::Str(bytes) => {
            if bytes.len() > 255 {
                asm.emit(format!(".WORD {}", bytes.len()));
            } else {
                asm.emit(format!(".BYTE {}", bytes.len()));
            }
            for chunk in bytes.chunks(16) {
                let items: Vec<String> = chunk.iter().map(|b| b.to_string()).collect();
                asm.emit(format!(".BYTE {}", items.join(", ")));
            }
        }
        DataPayload::Bytes(bytes) => {
            for chunk in bytes.chunks(16) {
                let items: Vec<String> = chunk.iter().map(|b| b.to_string()).collect();
                asm.emit(format!(".BYTE {}", items.join(", ")));
            }
        }
        DataPayload::Words(words) => {
            for chunk in words.chunks(8) {
                let items: Vec<String> = chunk.iter().map(|w| w.to_string()).collect();
                asm.emit(format!(".WORD {}", items.join(", ")));
            }
        }
    }
}

/// Module-wide slot assignment: named storage first, then each function's values.
struct MemLayout {
    named: BTreeMap<(u32, String), u16>,
    values: BTreeMap<(u32, u32), u16>,
    /// Scratch pointer pair for indexed access.
    ptr: u16,
}

impl MemLayout {
    fn compute(module: &Module, base: u16) -> Self {
        use crate::entity::EntityRef;
        let mut next = base;
        let mut take = |size: u16| {
            let addr = next;
            next += size;
            addr
        };
        let ptr = take(2);

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
        Self { named, values, ptr }
    }

    fn named_addr(&self, func: u32, name: &str) -> Option<u16> {
        self.named.get(&(func, name.to_string())).copied()
    }

    fn value_addr(&self, func: u32, value: Value) -> u16 {
        use crate::entity::EntityRef;
        self.values[&(func, value.index() as u32)]
    }
}

struct FuncEmitter<'a> {
    module: &'a Module,
    func: &'a Function,
    layout: &'a MemLayout,
    id: FuncId,
    label_counter: u32,
}

impl<'a> FuncEmitter<'a> {
    fn fid(&self) -> u32 {
        use crate::entity::EntityRef;
        self.id.index() as u32
    }

    fn value_addr(&self, value: Value) -> u16 {
        self.layout.value_addr(self.fid(), value)
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
            target: "6502",
        }
    }

    fn symbol_addr(&self, symbol: &str) -> Option<u16> {
        self.layout.named_addr(self.fid(), symbol)
    }

    /// Copy a value (1 or 2 bytes) from its slot to a destination slot.
    fn copy_value(&self, asm: &mut AsmBuilder, value: Value, dst: u16) {
        let src = self.value_addr(value);
        asm.emit(format!("LDA {}", src));
        asm.emit(format!("STA {}", dst));
        if self.wide(value) {
            asm.emit(format!("LDA {}", src + 1));
            asm.emit(format!("STA {}", dst + 1));
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
                let result = self.func.inst_result(inst).expect("constant has a result");
                let dst = self.value_addr(result);
                asm.emit(format!("LDA #{}", imm & 0xFF));
                asm.emit(format!("STA {}", dst));
                if !ty.is_byte() {
                    asm.emit(format!("LDA #{}", (imm >> 8) & 0xFF));
                    asm.emit(format!("STA {}", dst + 1));
                }
            }
            InstructionData::SymbolAddr { symbol } => {
                let result = self.func.inst_result(inst).expect("address has a result");
                let dst = self.value_addr(result);
                match self.symbol_addr(&symbol) {
                    Some(addr) => {
                        asm.emit(format!("LDA #{}", addr & 0xFF));
                        asm.emit(format!("STA {}", dst));
                        asm.emit(format!("LDA #{}", addr >> 8));
                        asm.emit(format!("STA {}", dst + 1));
                    }
                    None => {
                        asm.emit(format!("LDA #<{}", symbol));
                        asm.emit(format!("STA {}", dst));
                        asm.emit(format!("LDA #>{}", symbol));
                        asm.emit(format!("STA {}", dst + 1));
                    }
                }
            }
            InstructionData::Unary { opcode, arg } => {
                let result = self.func.inst_result(inst).expect("unary has a result");
                self.emit_unary(asm, opcode, arg, result)?;
            }
            InstructionData::Binary { opcode, args } => {
                let result = self.func.inst_result(inst).expect("binary has a result");
                self.emit_binary(asm, opcode, args, result)?;
            }
            InstructionData::IntCompare { cond, args } => {
                let result = self.func.inst_result(inst).expect("compare has a result");
                let dst = self.value_addr(result);
                let yes = self.fresh_label("cc");
                let done = self.fresh_label("ccd");
                self.emit_branch_compare(asm, cond, args, &yes)?;
                asm.emit("LDA #0");
                asm.emit(format!("JMP {}", done));
                asm.emit_label(&yes)?;
                asm.emit("LDA #1");
                asm.emit_label(&done)?;
                asm.emit(format!("STA {}", dst));
            }
            InstructionData::LoadVar { symbol, ty } => {
                let result = self.func.inst_result(inst).expect("load has a result");
                let dst = self.value_addr(result);
                match self.symbol_addr(&symbol) {
                    Some(addr) => {
                        asm.emit(format!("LDA {}", addr));
                        asm.emit(format!("STA {}", dst));
                        if !ty.is_byte() {
                            asm.emit(format!("LDA {}", addr + 1));
                            asm.emit(format!("STA {}", dst + 1));
                        }
                    }
                    None => {
                        asm.emit(format!("LDA {}", symbol));
                        asm.emit(format!("STA {}", dst));
                        if !ty.is_byte() {
                            asm.emit(format!("LDA {} + 1", symbol));
                            asm.emit(format!("STA {}", dst + 1));
                        }
                    }
                }
            }
            InstructionData::StoreVar { symbol, arg } => {
                let src = self.value_addr(arg);
                match self.symbol_addr(&symbol) {
                    Some(addr) => {
                        asm.emit(format!("LDA {}", src));
                        asm.emit(format!("STA {}", addr));
                        if self.wide(arg) {
                            asm.emit(format!("LDA {}", src + 1));
                            asm.emit(format!("STA {}", addr + 1));
                        }
                    }
                    None => {
                        asm.emit(format!("LDA {}", src));
                        asm.emit(format!("STA {}", symbol));
                        if self.wide(arg) {
                            asm.emit(format!("LDA {}", src + 1));
                            asm.emit(format!("STA {} + 1", symbol));
                        }
                    }
                }
            }
            InstructionData::LoadIndex { base, index, elem } => {
                let result = self.func.inst_result(inst).expect("load has a result");
                self.emit_pointer(asm, base, index, self.module.types.size_of(elem));
                asm.emit("LDY #0");
                asm.emit(format!("LDA ({}), Y", self.layout.ptr));
                asm.emit(format!("STA {}", self.value_addr(result)));
                if !elem.is_byte() {
                    asm.emit("INY");
                    asm.emit(format!("LDA ({}), Y", self.layout.ptr));
                    asm.emit(format!("STA {}", self.value_addr(result) + 1));
                }
            }
            InstructionData::StoreIndex {
                base,
                index,
                arg,
                elem,
            } => {
                self.emit_pointer(asm, base, index, self.module.types.size_of(elem));
                asm.emit("LDY #0");
                asm.emit(format!("LDA {}", self.value_addr(arg)));
                asm.emit(format!("STA ({}), Y", self.layout.ptr));
                if !elem.is_byte() {
                    asm.emit("INY");
                    asm.emit(format!("LDA {}", self.value_addr(arg) + 1));
                    asm.emit(format!("STA ({}), Y", self.layout.ptr));
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
                let skip = self.fresh_label("sk");
                asm.emit(format!("LDA {}", self.value_addr(arg)));
                if self.wide(arg) {
                    asm.emit(format!("ORA {}", self.value_addr(arg) + 1));
                }
                match opcode {
                    Opcode::JumpIfZero => asm.emit(format!("BNE {}", skip)),
                    Opcode::JumpIfNotZero => asm.emit(format!("BEQ {}", skip)),
                    _ => unreachable!(),
                }
                asm.emit(format!("JMP {}", target));
                asm.emit_label(&skip)?;
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
                    use crate::entity::EntityRef;
                    let callee = &self.module.funcs[callee_id];
                    // Externs have no slots in this module; their arguments are their own
                    // business.
                    if !callee.is_extern {
                        for (param, &arg) in callee.signature.params.iter().zip(args.iter()) {
                            let dst = self
                                .layout
                                .named_addr(callee_id.index() as u32, &param.name)
                                .expect("parameter slot assigned");
                            self.copy_value(asm, arg, dst);
                        }
                    }
                }
                asm.emit(format!("JSR {}", target));
                if let Some(result) = self.func.inst_result(inst) {
                    asm.emit(format!("STA {}", self.value_addr(result)));
                    if self.wide(result) {
                        asm.emit(format!("STX {}", self.value_addr(result) + 1));
                    }
                }
            }
            InstructionData::Return { arg } => {
                if let Some(arg) = arg {
                    let src = self.value_addr(arg);
                    if self.wide(arg) {
                        asm.emit(format!("LDX {}", src + 1));
                    }
                    asm.emit(format!("LDA {}", src));
                }
                asm.emit("RTS");
            }
            InstructionData::LabelMark { label } => {
                let name = self.local_label(&self.func.labels[label].name);
                asm.emit_label(name)?;
            }
            InstructionData::IterBegin { count } => {
                asm.emit(format!("LDX {}", self.value_addr(count)));
            }
            InstructionData::IterStep { destination } => {
                let target = self.local_label(&self.func.labels[destination].name);
                asm.emit("DEX");
                let skip = self.fresh_label("sk");
                asm.emit(format!("BEQ {}", skip));
                asm.emit(format!("JMP {}", target));
                asm.emit_label(&skip)?;
            }
            InstructionData::IterEnd => {}
            ref other => return Err(self.unsupported(other.opcode())),
        }
        Ok(())
    }

    /// `ptr = base + index * elem_size`.
    fn emit_pointer(&mut self, asm: &mut AsmBuilder, base: Value, index: Value, elem_size: u16) {
        let ptr = self.layout.ptr;
        let base_addr = self.value_addr(base);
        asm.emit(format!("LDA {}", base_addr));
        asm.emit(format!("STA {}", ptr));
        asm.emit(format!("LDA {}", base_addr + 1));
        asm.emit(format!("STA {}", ptr + 1));
        for _ in 0..elem_size.max(1) {
            asm.emit("CLC");
            asm.emit(format!("LDA {}", ptr));
            asm.emit(format!("ADC {}", self.value_addr(index)));
            asm.emit(format!("STA {}", ptr));
            if self.wide(index) {
                asm.emit(format!("LDA {}", ptr + 1));
                asm.emit(format!("ADC {}", self.value_addr(index) + 1));
                asm.emit(format!("STA {}", ptr + 1));
            } else {
                asm.emit(format!("LDA {}", ptr + 1));
                asm.emit("ADC #0");
                asm.emit(format!("STA {}", ptr + 1));
            }
        }
    }

    fn emit_unary(
        &mut self,
        asm: &mut AsmBuilder,
        opcode: Opcode,
        arg: Value,
        result: Value,
    ) -> CodegenResult<()> {
        let src = self.value_addr(arg);
        let dst = self.value_addr(result);
        match opcode {
            Opcode::Move => self.copy_value(asm, arg, dst),
            Opcode::Inc | Opcode::Dec => {
                let op = if opcode == Opcode::Inc { "ADC #1" } else { "SBC #1" };
                asm.emit(if opcode == Opcode::Inc { "CLC" } else { "SEC" });
                asm.emit(format!("LDA {}", src));
                asm.emit(op);
                asm.emit(format!("STA {}", dst));
                if self.wide(arg) {
                    asm.emit(format!("LDA {}", src + 1));
                    asm.emit(if opcode == Opcode::Inc { "ADC #0" } else { "SBC #0" });
                    asm.emit(format!("STA {}", dst + 1));
                }
            }
            Opcode::Not => {
                asm.emit(format!("LDA {}", src));
                asm.emit("EOR #255");
                asm.emit(format!("STA {}", dst));
                if self.wide(arg) {
                    asm.emit(format!("LDA {}", src + 1));
                    asm.emit("EOR #255");
                    asm.emit(format!("STA {}", dst + 1));
                }
            }
            Opcode::Neg => {
                asm.emit("SEC");
                asm.emit("LDA #0");
                asm.emit(format!("SBC {}", src));
                asm.emit(format!("STA {}", dst));
                if self.wide(arg) {
                    asm.emit("LDA #0");
                    asm.emit(format!("SBC {}", src + 1));
                    asm.emit(format!("STA {}", dst + 1));
                }
            }
            Opcode::Test => {
                let yes = self.fresh_label("tz");
                let done = self.fresh_label("tzd");
                asm.emit(format!("LDA {}", src));
                if self.wide(arg) {
                    asm.emit(format!("ORA {}", src + 1));
                }
                asm.emit(format!("BEQ {}", yes));
                asm.emit("LDA #0");
                asm.emit(format!("JMP {}", done));
                asm.emit_label(&yes)?;
                asm.emit("LDA #1");
                asm.emit_label(&done)?;
                asm.emit(format!("STA {}", dst));
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
        let lhs = self.value_addr(args[0]);
        let rhs = self.value_addr(args[1]);
        let dst = self.value_addr(result);
        let wide = self.wide(args[0]);
        let mnemonic = match opcode {
            Opcode::Add => "ADC",
            Opcode::Sub => "SBC",
            Opcode::And => "AND",
            Opcode::Or => "ORA",
            Opcode::Xor => "EOR",
            _ => return Err(self.unsupported(opcode)),
        };
        match opcode {
            Opcode::Add => asm.emit("CLC"),
            Opcode::Sub => asm.emit("SEC"),
            _ => {}
        }
        asm.emit(format!("LDA {}", lhs));
        asm.emit(format!("{} {}", mnemonic, rhs));
        asm.emit(format!("STA {}", dst));
        if wide {
            asm.emit(format!("LDA {}", lhs + 1));
            asm.emit(format!("{} {}", mnemonic, rhs + 1));
            asm.emit(format!("STA {}", dst + 1));
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
        // Reduce to Eq/Ne/Lt/Ge by swapping.
        let (cond, lhs, rhs) = match cond {
            CondCode::Gt => (CondCode::Lt, args[1], args[0]),
            CondCode::Le => (CondCode::Ge, args[1], args[0]),
            other => (other, args[0], args[1]),
        };
        let lhs_addr = self.value_addr(lhs);
        let rhs_addr = self.value_addr(rhs);
        let skip = self.fresh_label("sk");
        if self.wide(lhs) {
            // 16-bit compare by subtraction; carry clear means less-than.
            asm.emit("SEC");
            asm.emit(format!("LDA {}", lhs_addr));
            asm.emit(format!("SBC {}", rhs_addr));
            asm.emit(format!("STA {}", self.layout.ptr));
            asm.emit(format!("LDA {}", lhs_addr + 1));
            asm.emit(format!("SBC {}", rhs_addr + 1));
            match cond {
                CondCode::Eq => {
                    asm.emit(format!("ORA {}", self.layout.ptr));
                    asm.emit(format!("BNE {}", skip));
                }
                CondCode::Ne => {
                    asm.emit(format!("ORA {}", self.layout.ptr));
                    asm.emit(format!("BEQ {}", skip));
                }
                CondCode::Lt => asm.emit(format!("BCS {}", skip)),
                CondCode::Ge => asm.emit(format!("BCC {}", skip)),
                _ => unreachable!(),
            }
        } else {
            asm.emit(format!("LDA {}", lhs_addr));
            asm.emit(format!("CMP {}", rhs_addr));
            match cond {
                CondCode::Eq => asm.emit(format!("BNE {}", skip)),
                CondCode::Ne => asm.emit(format!("BEQ {}", skip)),
                CondCode::Lt => asm.emit(format!("BCS {}", skip)),
                CondCode::Ge => asm.emit(format!("BCC {}", skip)),
                _ => unreachable!(),
            }
        }
        asm.emit(format!("JMP {}", target));
        asm.emit_label(&skip)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{AbiParam, FuncName, FunctionBuilder, Signature, Type};
    use crate::opt;

    #[test]
    fn zero_page_slots_start_at_the_base() {
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
        let text = Mos6502Backend
            .compile_module(&module, &flags, &mut diag)
            .unwrap();
        // Pointer pair at $10-$11, then `a` at $12 and `b` at $13, values after.
        assert!(text.contains("LDA 18"), "{}", text);
        assert!(text.contains("LDA 19"), "{}", text);
        assert!(text.contains("ADC 21"), "{}", text);
        assert!(text.contains("RTS"), "{}", text);
        assert!(text.contains("CLC"), "{}", text);
    }

    #[test]
    fn calls_fill_the_callee_parameter_slots() {
        let mut module = Module::new("m");
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("n", Type::U8));
        sig.ret = Some(Type::U8);
        let mut b = FunctionBuilder::new(FuncName::new("m", "id"), sig);
        let n = b.load_var("n", Type::U8).unwrap();
        b.ret(Some(n));
        module.add_function(b.finish().unwrap());

        let mut sig = Signature::new();
        sig.ret = Some(Type::U8);
        let mut b = FunctionBuilder::new(FuncName::new("m", "main"), sig);
        let c = b.load_const(7, Type::U8);
        let r = b.call("id", &[c], Some(Type::U8)).unwrap().unwrap();
        b.ret(Some(r));
        module.add_function(b.finish().unwrap());

        let flags = Flags::builder().inline_budget(0).build();
        let mut diag = Diagnostics::new();
        opt::optimize(&mut module, &flags, false, &mut diag).unwrap();
        let text = Mos6502Backend
            .compile_module(&module, &flags, &mut diag)
            .unwrap();
        // `n` sits at $12; the call site stores the argument there before JSR.
        assert!(text.contains("STA 18"), "{}", text);
        assert!(text.contains("JSR m.id"), "{}", text);
    }
}
