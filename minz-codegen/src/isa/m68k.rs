//! Motorola 68000 backend.
//!
//! Register-rich and natively 16-bit, the 68000 needs none of the low-memory gymnastics of the
//! 8-bit targets: every named slot and value gets a labeled `DS` cell in a variables section
//! and the instructions operate memory-to-register through D0/D1. `MULU` and `DIVU` make
//! multiplication and division one-instruction affairs. Calls use the static memory
//! convention; results return in D0.

use crate::asm::{join_lines, AsmBuilder};
use crate::diagnostic::Diagnostics;
use crate::entity::EntityRef;
use crate::isa::{Capabilities, TargetIsa};
use crate::mir::{
    CondCode, DataPayload, FuncId, Function, InstructionData, Module, Opcode, Value,
};
use crate::result::{CodegenError, CodegenResult};
use crate::settings::Flags;

/// The Motorola 68000 code generator.
pub struct M68kBackend;

impl TargetIsa for M68kBackend {
    fn name(&self) -> &'static str {
        "68000"
    }

    fn extension(&self) -> &'static str {
        "s68"
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
        let mut asm = AsmBuilder::new();
        asm.emit_comment(format!("module {}", module.name));
        asm.emit("ORG $1000");

        if let Some(main) = module.find_function("main") {
            asm.emit(format!("JSR {}", module.funcs[main].qualified_name()));
            asm.emit("STOP #$2700");
        }

        for (id, func) in module.funcs.iter() {
            if func.is_extern {
                continue;
            }
            FuncEmitter {
                module,
                func,
                id,
                label_counter: 0,
            }
            .emit(&mut asm)?;
        }

        // Variables section: one labeled cell per named slot and per value.
        asm.emit_blank();
        for (id, func) in module.funcs.iter() {
            if func.is_extern {
                continue;
            }
            for param in &func.signature.params {
                asm.emit_label(slot_label(id, &func.name.name, &param.name))?;
                asm.emit("DS.W 1");
            }
            for (_, local) in func.locals.iter() {
                asm.emit_label(slot_label(id, &func.name.name, &local.name))?;
                asm.emit("DS.W 1");
            }
            for (value, data) in func.values.iter() {
                if data.def.is_none() {
                    continue;
                }
                asm.emit_label(value_label(&func.name.name, value))?;
                asm.emit("DS.W 1");
            }
        }

        if module.data.len() > 0 {
            asm.emit_blank();
            for (_, decl) in module.data.iter() {
                asm.emit_label(&decl.symbol)?;
                emit_data(&mut asm, &decl.payload);
            }
        }

        let _ = (flags, diag);
        Ok(join_lines(&asm.into_lines()))
    }
}

fn slot_label(_id: FuncId, func: &str, name: &str) -> String {
    format!("{}_{}", func, name)
}

fn value_label(func: &str, value: Value) -> String {
    format!("{}_v{}", func, value.index())
}

fn emit_data(asm: &mut AsmBuilder, payload: &DataPayload) {
    match payload {
        DataPayload::Str(bytes) => {
            if bytes.len() > 255 {
                asm.emit(format!("DC.W {}", bytes.len()));
            } else {
                asm.emit(format!("DC.B {}", bytes.len()));
            }
            for chunk in bytes.chunks(16) {
                let items: Vec<String> = chunk.iter().map(|b| b.to_string()).collect();
                asm.emit(format!("DC.B {}", items.join(", ")));
            }
        }
        DataPayload::Bytes(bytes) => {
            for chunk in bytes.chunks(16) {
                let items: Vec<String> = chunk.iter().map(|b| b.to_string()).collect();
                asm.emit(format!("DC.B {}", items.join(", ")));
            }
        }
        DataPayload::Words(words) => {
            for chunk in words.chunks(8) {
                let items: Vec<String> = chunk.iter().map(|w| w.to_string()).collect();
                asm.emit(format!("DC.W {}", items.join(", ")));
            }
        }
    }
}

struct FuncEmitter<'a> {
    module: &'a Module,
    func: &'a Function,
    id: FuncId,
    label_counter: u32,
}

impl<'a> FuncEmitter<'a> {
    fn value_cell(&self, value: Value) -> String {
        value_label(&self.func.name.name, value)
    }

    fn size_suffix(&self, value: Value) -> &'static str {
        if self.func.value_type(value).is_byte() {
            ".B"
        } else {
            ".W"
        }
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
            target: "68000",
        }
    }

    fn named_cell(&self, symbol: &str) -> String {
        if self.func.signature.param_index(symbol).is_some()
            || self.func.find_local(symbol).is_some()
        {
            slot_label(self.id, &self.func.name.name, symbol)
        } else {
            symbol.to_string()
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
            InstructionData::UnaryImm { imm, .. } => {
                let result = self.func.inst_result(inst).expect("result");
                let suffix = self.size_suffix(result);
                asm.emit(format!(
                    "MOVE{} #{}, {}",
                    suffix,
                    imm & 0xFFFF,
                    self.value_cell(result)
                ));
            }
            InstructionData::SymbolAddr { symbol } => {
                let result = self.func.inst_result(inst).expect("result");
                asm.emit(format!("MOVE.W #{}, {}", symbol, self.value_cell(result)));
            }
            InstructionData::Unary { opcode, arg } => {
                let result = self.func.inst_result(inst).expect("result");
                let suffix = self.size_suffix(arg);
                asm.emit(format!("MOVE{} {}, D0", suffix, self.value_cell(arg)));
                match opcode {
                    Opcode::Move => {}
                    Opcode::Inc => asm.emit(format!("ADDQ{} #1, D0", suffix)),
                    Opcode::Dec => asm.emit(format!("SUBQ{} #1, D0", suffix)),
                    Opcode::Not => asm.emit(format!("NOT{} D0", suffix)),
                    Opcode::Neg => asm.emit(format!("NEG{} D0", suffix)),
                    Opcode::Test => {
                        let yes = self.fresh_label("tz");
                        let done = self.fresh_label("tzd");
                        asm.emit(format!("TST{} D0", suffix));
                        asm.emit(format!("BEQ {}", yes));
                        asm.emit("MOVEQ #0, D0");
                        asm.emit(format!("BRA {}", done));
                        asm.emit_label(&yes)?;
                        asm.emit("MOVEQ #1, D0");
                        asm.emit_label(&done)?;
                    }
                    _ => return Err(self.unsupported(opcode)),
                }
                let result_suffix = self.size_suffix(result);
                asm.emit(format!(
                    "MOVE{} D0, {}",
                    result_suffix,
                    self.value_cell(result)
                ));
            }
            InstructionData::Binary { opcode, args } => {
                let result = self.func.inst_result(inst).expect("result");
                let suffix = self.size_suffix(args[0]);
                asm.emit(format!("MOVE{} {}, D0", suffix, self.value_cell(args[0])));
                asm.emit(format!("MOVE{} {}, D1", suffix, self.value_cell(args[1])));
                match opcode {
                    Opcode::Add => asm.emit(format!("ADD{} D1, D0", suffix)),
                    Opcode::Sub => asm.emit(format!("SUB{} D1, D0", suffix)),
                    Opcode::And => asm.emit(format!("AND{} D1, D0", suffix)),
                    Opcode::Or => asm.emit(format!("OR{} D1, D0", suffix)),
                    Opcode::Xor => asm.emit(format!("EOR{} D1, D0", suffix)),
                    Opcode::Shl => asm.emit(format!("LSL{} D1, D0", suffix)),
                    Opcode::Shr => asm.emit(format!("LSR{} D1, D0", suffix)),
                    Opcode::Mul => asm.emit("MULU D1, D0"),
                    Opcode::Div => asm.emit("DIVU D1, D0"),
                    Opcode::Mod => {
                        // DIVU leaves the remainder in the upper word.
                        asm.emit("DIVU D1, D0");
                        asm.emit("SWAP D0");
                    }
                    _ => return Err(self.unsupported(opcode)),
                }
                asm.emit(format!("MOVE{} D0, {}", suffix, self.value_cell(result)));
            }
            InstructionData::IntCompare { cond, args } => {
                let result = self.func.inst_result(inst).expect("result");
                let yes = self.fresh_label("cc");
                let done = self.fresh_label("ccd");
                self.emit_branch_compare(asm, cond, args, &yes)?;
                asm.emit("MOVEQ #0, D0");
                asm.emit(format!("BRA {}", done));
                asm.emit_label(&yes)?;
                asm.emit("MOVEQ #1, D0");
                asm.emit_label(&done)?;
                asm.emit(format!("MOVE.B D0, {}", self.value_cell(result)));
            }
            InstructionData::LoadVar { symbol, ty } => {
                let result = self.func.inst_result(inst).expect("result");
                let suffix = if ty.is_byte() { ".B" } else { ".W" };
                asm.emit(format!("MOVE{} {}, D0", suffix, self.named_cell(&symbol)));
                asm.emit(format!("MOVE{} D0, {}", suffix, self.value_cell(result)));
            }
            InstructionData::StoreVar { symbol, arg } => {
                let suffix = self.size_suffix(arg);
                asm.emit(format!("MOVE{} {}, D0", suffix, self.value_cell(arg)));
                asm.emit(format!("MOVE{} D0, {}", suffix, self.named_cell(&symbol)));
            }
            InstructionData::Jump { destination } => {
                asm.emit(format!(
                    "BRA {}",
                    self.local_label(&self.func.labels[destination].name)
                ));
            }
            InstructionData::Branch {
                opcode,
                arg,
                destination,
            } => {
                let target = self.local_label(&self.func.labels[destination].name);
                asm.emit(format!(
                    "TST{} {}",
                    self.size_suffix(arg),
                    self.value_cell(arg)
                ));
                match opcode {
                    Opcode::JumpIfZero => asm.emit(format!("BEQ {}", target)),
                    Opcode::JumpIfNotZero => asm.emit(format!("BNE {}", target)),
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
                    // Externs have no slot cells in this module.
                    if !callee.is_extern {
                        for (param, &arg) in callee.signature.params.iter().zip(args.iter()) {
                            let suffix = self.size_suffix(arg);
                            asm.emit(format!("MOVE{} {}, D0", suffix, self.value_cell(arg)));
                            asm.emit(format!(
                                "MOVE{} D0, {}",
                                suffix,
                                slot_label(callee_id, &callee.name.name, &param.name)
                            ));
                        }
                    }
                }
                asm.emit(format!("JSR {}", target));
                if let Some(result) = self.func.inst_result(inst) {
                    asm.emit(format!(
                        "MOVE{} D0, {}",
                        self.size_suffix(result),
                        self.value_cell(result)
                    ));
                }
            }
            InstructionData::Return { arg } => {
                if let Some(arg) = arg {
                    asm.emit(format!(
                        "MOVE{} {}, D0",
                        self.size_suffix(arg),
                        self.value_cell(arg)
                    ));
                }
                asm.emit("RTS");
            }
            InstructionData::LabelMark { label } => {
                let name = self.local_label(&self.func.labels[label].name);
                asm.emit_label(name)?;
            }
            InstructionData::IterBegin { count } => {
                asm.emit(format!("MOVE.B {}, D7", self.value_cell(count)));
            }
            InstructionData::IterStep { destination } => {
                let target = self.local_label(&self.func.labels[destination].name);
                // DBRA counts through -1; adjust by testing explicitly instead.
                asm.emit("SUBQ.B #1, D7");
                asm.emit(format!("BNE {}", target));
            }
            InstructionData::IterEnd => {}
            ref other => return Err(self.unsupported(other.opcode())),
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
        let suffix = self.size_suffix(args[0]);
        asm.emit(format!("MOVE{} {}, D0", suffix, self.value_cell(args[0])));
        asm.emit(format!("MOVE{} {}, D1", suffix, self.value_cell(args[1])));
        asm.emit(format!("CMP{} D1, D0", suffix));
        let signed = self.func.value_type(args[0]).is_signed();
        let branch = match (cond, signed) {
            (CondCode::Eq, _) => "BEQ",
            (CondCode::Ne, _) => "BNE",
            (CondCode::Lt, false) => "BCS",
            (CondCode::Ge, false) => "BCC",
            (CondCode::Gt, false) => "BHI",
            (CondCode::Le, false) => "BLS",
            (CondCode::Lt, true) => "BLT",
            (CondCode::Ge, true) => "BGE",
            (CondCode::Gt, true) => "BGT",
            (CondCode::Le, true) => "BLE",
        };
        asm.emit(format!("{} {}", branch, target));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{AbiParam, FuncName, FunctionBuilder, Signature, Type};
    use crate::opt;

    #[test]
    fn native_multiply_uses_mulu() {
        let mut module = Module::new("m");
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("a", Type::U16));
        sig.params.push(AbiParam::new("b", Type::U16));
        sig.ret = Some(Type::U16);
        let mut b = FunctionBuilder::new(FuncName::new("m", "area"), sig);
        let x = b.load_var("a", Type::U16).unwrap();
        let y = b.load_var("b", Type::U16).unwrap();
        let p = b.binary(Opcode::Mul, x, y).unwrap();
        b.ret(Some(p));
        module.add_function(b.finish().unwrap());

        let flags = Flags::default();
        let mut diag = Diagnostics::new();
        opt::optimize(&mut module, &flags, false, &mut diag).unwrap();
        let text = M68kBackend
            .compile_module(&module, &flags, &mut diag)
            .unwrap();
        assert!(text.contains("MULU D1, D0"), "{}", text);
        assert!(text.contains("area_a:"), "{}", text);
        assert!(text.contains("DS.W 1"), "{}", text);
        assert!(text.contains("RTS"), "{}", text);
    }
}
