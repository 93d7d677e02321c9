//! Lowering MIR to Z80 assembly.
//!
//! The emitter streams over a function's layout once, consulting the allocation for every value
//! it touches. `A` and `HL` are the staging accumulators and are never handed out by the
//! allocator; `H` and `L` double as 8-bit scratch, and `DE` is the 16-bit secondary, saved
//! around clobbers when a pinned parameter lives there. Constants are rematerialized at each
//! use instead of being stored anywhere.
//!
//! Cleanups that need cross-instruction knowledge (redundant loads, dead copies, small-offset
//! address arithmetic) are left to the assembly peephole; this file prefers being obviously
//! correct over being clever.

use crate::asm::AsmBuilder;
use crate::callconv::{default_for_signature, CallConv};
use crate::entity::SecondaryMap;
use crate::isa::z80::registers::{param_assignment, ParamPlace, Reg, Reg16, Reg8};
use crate::isa::z80::AnchorTable;
use crate::mir::{
    CondCode, Function, InstructionData, Module, Opcode, Type, Value,
};
use crate::regalloc::{allocate, Allocation, Location};
use crate::result::{CodegenError, CodegenResult};
use crate::settings::Flags;
use std::collections::{BTreeMap, BTreeSet};

/// Where a named storage symbol lives for the current function.
enum Slot {
    /// Absolute low-memory address.
    Abs(u16),
    /// IX-relative frame offset.
    Frame(i16),
    /// Module-level symbol, addressed by label.
    Global(String),
    /// A TSMC anchor; reads and writes go through `name$imm0`.
    Anchor(String),
}

/// Emits one function.
pub struct FuncEmitter<'a> {
    module: &'a Module,
    func: &'a Function,
    conv: CallConv,
    allocation: Allocation,
    consts: SecondaryMap<Value, Option<i64>>,
    /// Pinned incoming registers for direct-mode parameter reads.
    pinned: BTreeMap<String, Reg>,
    param_places: Vec<ParamPlace>,
    frame_offsets: BTreeMap<String, i16>,
    frame_locals: u16,
    anchors: &'a AnchorTable,
    helpers: &'a mut BTreeSet<&'static str>,
    label_counter: u32,
}

impl<'a> FuncEmitter<'a> {
    /// Prepare emission state for `func`: allocation, parameter placement, frame layout.
    pub fn new(
        module: &'a Module,
        func: &'a Function,
        flags: &'a Flags,
        base: u16,
        anchors: &'a AnchorTable,
        helpers: &'a mut BTreeSet<&'static str>,
        diag: &mut crate::diagnostic::Diagnostics,
    ) -> Self {
        let conv = func.conv();
        let param_places = if conv == CallConv::Register {
            param_assignment(&func.signature)
        } else {
            Vec::new()
        };

        // DJNZ owns B whenever the iterator idioms appear.
        let uses_iter = func.layout.iter().any(|&inst| {
            matches!(
                func.insts[inst].opcode(),
                Opcode::IterBegin | Opcode::IterStep
            )
        });
        let reserved = if uses_iter { Reg8::B.mask() } else { 0 };

        let allocation = allocate(func, &module.types, base, reserved, flags, diag);

        let mut consts: SecondaryMap<Value, Option<i64>> = SecondaryMap::new();
        for &inst in &func.layout {
            if let InstructionData::UnaryImm { imm, ty } = func.insts[inst] {
                if let Some(result) = func.inst_result(inst) {
                    consts[result] = Some(imm & ty.mask().unwrap_or(-1));
                }
            }
        }

        let mut emitter = Self {
            module,
            func,
            conv,
            allocation,
            consts,
            pinned: BTreeMap::new(),
            param_places,
            frame_offsets: BTreeMap::new(),
            frame_locals: 0,
            anchors,
            helpers,
            label_counter: 0,
        };

        if emitter.conv == CallConv::StackFrame {
            // Pushed right-to-left, each argument one word: first parameter at IX+4.
            let mut offset = 4i16;
            for param in &emitter.func.signature.params {
                emitter.frame_offsets.insert(param.name.clone(), offset);
                offset += 2;
            }
            let mut below = 0i16;
            for (_, local) in emitter.func.locals.iter() {
                let size = emitter.module.types.size_of(local.ty).max(1) as i16;
                below -= size;
                emitter.frame_offsets.insert(local.name.clone(), below);
            }
            emitter.frame_locals = (-below) as u16;
        }

        if emitter.direct_mode_ok() {
            for (index, param) in emitter.func.signature.params.iter().enumerate() {
                if let ParamPlace::Reg(reg) = emitter.param_places[index] {
                    emitter.pinned.insert(param.name.clone(), reg);
                }
            }
            // Pin every parameter read to its incoming register.
            let layout = emitter.func.layout.clone();
            for inst in layout {
                if let InstructionData::LoadVar { ref symbol, .. } = emitter.func.insts[inst] {
                    if let Some(&reg) = emitter.pinned.get(symbol.as_str()) {
                        if let Some(result) = emitter.func.inst_result(inst) {
                            emitter.allocation.set_location(result, Location::Phys(reg));
                        }
                    }
                }
            }
        }

        emitter
    }

    /// Can parameters be read straight out of their incoming registers?
    ///
    /// True only for leaf register-convention functions whose bodies stay inside the operations
    /// the staging discipline cannot clobber: parameter loads up front, unsigned ALU work,
    /// compares, branches, and the return. Anything else falls back to spilling the incoming
    /// registers to their homes, which is always correct, just slower.
    fn direct_mode_ok(&self) -> bool {
        if self.conv != CallConv::Register || !self.func.is_leaf || self.func.interrupt {
            return false;
        }
        let params = &self.func.signature.params;
        if params.is_empty() {
            return false;
        }
        if !self
            .param_places
            .iter()
            .all(|place| matches!(place, ParamPlace::Reg(_)))
        {
            return false;
        }

        let param_names: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
        let any_wide_param = params.iter().any(|p| !p.ty.is_byte());

        // The register a value would sit in after pinning.
        let pinned_reg = |value: Value| -> Option<Reg> {
            let inst = self.func.value_def(value)?;
            match self.func.insts[inst] {
                InstructionData::LoadVar { ref symbol, .. } => self.param_place_of(symbol),
                _ => None,
            }
        };
        let effectively_phys = |value: Value| {
            self.consts[value].is_some()
                || pinned_reg(value).is_some()
                || matches!(self.allocation.try_location(value), Some(Location::Phys(_)))
        };

        let mut loads_done = false;
        let mut a_param_value: Option<Value> = None;
        let mut first_emitting_pos = None;
        for (pos, inst) in self.func.layout_iter() {
            match self.func.insts[inst] {
                InstructionData::LabelMark { .. } => continue,
                InstructionData::LoadVar { ref symbol, .. }
                    if param_names.contains(&symbol.as_str()) =>
                {
                    if loads_done {
                        // Parameter reads after real work has used the staging registers.
                        return false;
                    }
                    if self.param_place_of(symbol) == Some(Reg::R8(Reg8::A)) {
                        a_param_value = self.func.inst_result(inst);
                    }
                    continue;
                }
                InstructionData::StoreVar { ref symbol, .. }
                    if param_names.contains(&symbol.as_str()) =>
                {
                    return false;
                }
                InstructionData::UnaryImm { .. } => continue,
                InstructionData::Unary { opcode, .. } => {
                    loads_done = true;
                    first_emitting_pos.get_or_insert(pos);
                    if !opcode.is_unary() {
                        return false;
                    }
                }
                InstructionData::Binary { opcode, args } => {
                    loads_done = true;
                    first_emitting_pos.get_or_insert(pos);
                    match opcode {
                        Opcode::Add | Opcode::Sub | Opcode::And | Opcode::Or | Opcode::Xor => {}
                        Opcode::Shl | Opcode::Shr if self.consts[args[1]].is_some() => {}
                        _ => return false,
                    }
                    // 8-bit memory staging runs through H and L, which a wide pinned
                    // parameter may own.
                    if any_wide_param && !effectively_phys(args[1]) {
                        return false;
                    }
                    // A wide binary must sit exactly on HL with a DE/BC/immediate right side;
                    // anything else would shuffle the pinned pairs.
                    if !self.func.value_type(args[0]).is_byte() {
                        let lhs_on_hl = pinned_reg(args[0]) == Some(Reg::R16(Reg16::HL));
                        let rhs_ok = self.consts[args[1]].is_some()
                            || pinned_reg(args[1]) == Some(Reg::R16(Reg16::DE))
                            || matches!(
                                self.allocation.try_location(args[1]),
                                Some(Location::Phys(Reg::R16(Reg16::BC)))
                            );
                        if !lhs_on_hl || !rhs_ok {
                            return false;
                        }
                    }
                }
                InstructionData::IntCompare { args, .. }
                | InstructionData::BranchCompare { args, .. } => {
                    loads_done = true;
                    first_emitting_pos.get_or_insert(pos);
                    // Signed compares bias through H; wide compares stage through DE.
                    if self.func.value_type(args[0]).is_signed() {
                        return false;
                    }
                    if !self.func.value_type(args[0]).is_byte() {
                        return false;
                    }
                    if any_wide_param && !effectively_phys(args[1]) {
                        return false;
                    }
                }
                InstructionData::Branch { .. }
                | InstructionData::Jump { .. }
                | InstructionData::Return { .. } => {
                    loads_done = true;
                    first_emitting_pos.get_or_insert(pos);
                }
                _ => return false,
            }
        }

        // The first real emission overwrites A; the A parameter must not be needed after it.
        if let (Some(a_value), Some(first)) = (a_param_value, first_emitting_pos) {
            for (pos, inst) in self.func.layout_iter() {
                if pos > first
                    && self.func.insts[inst]
                        .arguments()
                        .iter()
                        .any(|&arg| arg == a_value)
                {
                    return false;
                }
            }
        }
        true
    }

    fn param_place_of(&self, name: &str) -> Option<Reg> {
        let index = self.func.signature.param_index(name)?;
        match self.param_places.get(index) {
            Some(ParamPlace::Reg(reg)) => Some(*reg),
            _ => None,
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
            target: "z80",
        }
    }

    fn resolve_slot(&self, symbol: &str) -> Slot {
        if self.conv == CallConv::Tsmc {
            if let Some(index) = self.func.signature.param_index(symbol) {
                let name = self
                    .anchors
                    .anchor(&self.func.qualified_name(), index as u8)
                    .expect("anchor named for every TSMC parameter");
                return Slot::Anchor(name.to_string());
            }
        }
        if let Some(&offset) = self.frame_offsets.get(symbol) {
            return Slot::Frame(offset);
        }
        if let Some(addr) = self.allocation.local_addr(symbol) {
            return Slot::Abs(addr);
        }
        Slot::Global(symbol.to_string())
    }

    fn wide(&self, value: Value) -> bool {
        !self.func.value_type(value).is_byte()
    }

    // --- value movement -------------------------------------------------------------------

    /// Bring an 8-bit value into A.
    fn load_a(&mut self, asm: &mut AsmBuilder, value: Value) {
        if let Some(imm) = self.consts[value] {
            asm.emit(format!("LD A, {}", imm & 0xFF));
            return;
        }
        match self.allocation.location(value) {
            Location::Phys(Reg::R8(Reg8::A)) => {}
            Location::Phys(Reg::R8(r)) => asm.emit(format!("LD A, {}", r)),
            Location::Shadow(Reg::R8(r)) => {
                asm.emit("EXX");
                asm.emit(format!("LD A, {}", r));
                asm.emit("EXX");
            }
            Location::Mem(addr) => asm.emit(format!("LD A, (${:04X})", addr)),
            other => panic!("8-bit value in 16-bit location {:?}", other),
        }
    }

    /// Store A into an 8-bit value's location.
    fn store_a(&mut self, asm: &mut AsmBuilder, value: Value) {
        match self.allocation.location(value) {
            Location::Phys(Reg::R8(Reg8::A)) => {}
            Location::Phys(Reg::R8(r)) => asm.emit(format!("LD {}, A", r)),
            Location::Shadow(Reg::R8(r)) => {
                asm.emit("EXX");
                asm.emit(format!("LD {}, A", r));
                asm.emit("EXX");
            }
            Location::Mem(addr) => asm.emit(format!("LD (${:04X}), A", addr)),
            other => panic!("8-bit value in 16-bit location {:?}", other),
        }
    }

    /// Bring a 16-bit value into HL.
    fn load_hl(&mut self, asm: &mut AsmBuilder, value: Value) {
        if let Some(imm) = self.consts[value] {
            asm.emit(format!("LD HL, {}", imm & 0xFFFF));
            return;
        }
        match self.allocation.location(value) {
            Location::Phys(Reg::R16(Reg16::HL)) => {}
            Location::Phys(Reg::R16(pair)) => {
                let high = pair.high().expect("allocatable pair");
                let low = pair.low().expect("allocatable pair");
                asm.emit(format!("LD H, {}", high));
                asm.emit(format!("LD L, {}", low));
            }
            Location::Shadow(Reg::R16(_)) => {
                asm.emit("EXX");
                asm.emit("PUSH BC");
                asm.emit("EXX");
                asm.emit("POP HL");
            }
            Location::Mem(addr) => asm.emit(format!("LD HL, (${:04X})", addr)),
            other => panic!("16-bit value in 8-bit location {:?}", other),
        }
    }

    /// Store HL into a 16-bit value's location.
    fn store_hl(&mut self, asm: &mut AsmBuilder, value: Value) {
        match self.allocation.location(value) {
            Location::Phys(Reg::R16(Reg16::HL)) => {}
            Location::Phys(Reg::R16(pair)) => {
                let high = pair.high().expect("allocatable pair");
                let low = pair.low().expect("allocatable pair");
                asm.emit(format!("LD {}, H", high));
                asm.emit(format!("LD {}, L", low));
            }
            Location::Shadow(Reg::R16(_)) => {
                asm.emit("PUSH HL");
                asm.emit("EXX");
                asm.emit("POP BC");
                asm.emit("EXX");
            }
            Location::Mem(addr) => asm.emit(format!("LD (${:04X}), HL", addr)),
            other => panic!("16-bit value in 8-bit location {:?}", other),
        }
    }

    /// Does a pinned direct-mode parameter live in D, E or DE?
    fn de_is_pinned(&self) -> bool {
        self.pinned.values().any(|&reg| {
            reg.mask() & (Reg8::D.mask() | Reg8::E.mask()) != 0
        })
    }

    /// Bring a 16-bit value into DE, preserving a pinned DE when asked.
    ///
    /// Returns `true` when a `POP DE` must follow the consuming instruction.
    fn stage_de(&mut self, asm: &mut AsmBuilder, value: Value) -> bool {
        let guard = self.de_is_pinned()
            && self.allocation.try_location(value) != Some(Location::Phys(Reg::R16(Reg16::DE)));
        if guard {
            asm.emit("PUSH DE");
        }
        if let Some(imm) = self.consts[value] {
            asm.emit(format!("LD DE, {}", imm & 0xFFFF));
            return guard;
        }
        match self.allocation.location(value) {
            Location::Phys(Reg::R16(Reg16::DE)) => {}
            Location::Phys(Reg::R16(Reg16::HL)) => {
                asm.emit("LD D, H");
                asm.emit("LD E, L");
            }
            Location::Phys(Reg::R16(Reg16::BC)) => {
                asm.emit("LD D, B");
                asm.emit("LD E, C");
            }
            Location::Shadow(Reg::R16(_)) => {
                asm.emit("EXX");
                asm.emit("PUSH BC");
                asm.emit("EXX");
                asm.emit("POP DE");
            }
            Location::Mem(addr) => asm.emit(format!("LD DE, (${:04X})", addr)),
            other => panic!("16-bit value in bad location {:?}", other),
        }
        guard
    }

    // --- instruction emission -------------------------------------------------------------

    /// Emit the whole function.
    pub fn emit(mut self, asm: &mut AsmBuilder) -> CodegenResult<()> {
        asm.emit_blank();
        asm.emit_label(self.func.qualified_name())?;
        self.emit_prologue(asm)?;

        let layout = self.func.layout.clone();
        for inst in layout {
            let data = self.func.insts[inst].clone();
            self.emit_inst(asm, inst, &data)?;
        }
        Ok(())
    }

    fn emit_prologue(&mut self, asm: &mut AsmBuilder) -> CodegenResult<()> {
        if self.func.naked {
            return Ok(());
        }
        if self.func.interrupt {
            asm.emit("EX AF, AF'");
            asm.emit("EXX");
        }
        match self.conv {
            CallConv::Register => {
                if self.pinned.is_empty() {
                    self.spill_incoming_params(asm);
                }
            }
            CallConv::Tsmc => {
                // One labeled immediate slot per parameter. The anchors also serve as the
                // entry loads, so right after them each parameter sits in its register too.
                let places = param_assignment(&self.func.signature);
                for (index, param) in self.func.signature.params.iter().enumerate() {
                    let anchor = self
                        .anchors
                        .anchor(&self.func.qualified_name(), index as u8)
                        .expect("anchor named for every TSMC parameter")
                        .to_string();
                    let reg = match places.get(index) {
                        Some(ParamPlace::Reg(reg)) => *reg,
                        _ => Reg::R8(Reg8::A),
                    };
                    let text = if param.ty.is_byte() {
                        match reg {
                            Reg::R8(r) => format!("LD {}, 0", r),
                            Reg::R16(_) => "LD A, 0".to_string(),
                        }
                    } else {
                        match reg {
                            Reg::R16(pair) => format!("LD {}, 0", pair),
                            Reg::R8(_) => "LD HL, 0".to_string(),
                        }
                    };
                    asm.emit_anchor(&anchor, &text, 1)?;
                }
            }
            CallConv::StackFrame => {
                asm.emit("PUSH IX");
                asm.emit("LD IX, 0");
                asm.emit("ADD IX, SP");
                if self.frame_locals > 0 {
                    asm.emit(format!(
                        "LD HL, {}",
                        (self.frame_locals as i32).wrapping_neg() as u16
                    ));
                    asm.emit("ADD HL, SP");
                    asm.emit("LD SP, HL");
                }
            }
        }
        Ok(())
    }

    /// Store the incoming register parameters to their low-memory homes.
    fn spill_incoming_params(&mut self, asm: &mut AsmBuilder) {
        // A's parameter first, before A is used to ferry the rest.
        let mut deferred = Vec::new();
        for (index, param) in self.func.signature.params.iter().enumerate() {
            let place = match self.param_places.get(index) {
                Some(ParamPlace::Reg(reg)) => *reg,
                _ => continue,
            };
            let addr = self
                .allocation
                .local_addr(&param.name)
                .expect("parameter has a home");
            match place {
                Reg::R8(Reg8::A) => asm.emit(format!("LD (${:04X}), A", addr)),
                Reg::R8(r) => deferred.push((r, addr)),
                Reg::R16(pair) => asm.emit(format!("LD (${:04X}), {}", addr, pair)),
            }
        }
        for (r, addr) in deferred {
            asm.emit(format!("LD A, {}", r));
            asm.emit(format!("LD (${:04X}), A", addr));
        }
    }

    fn emit_epilogue(&mut self, asm: &mut AsmBuilder) {
        if self.func.naked {
            return;
        }
        match self.conv {
            CallConv::StackFrame => {
                asm.emit("LD SP, IX");
                asm.emit("POP IX");
            }
            CallConv::Register | CallConv::Tsmc => {}
        }
        if self.func.interrupt {
            asm.emit("EXX");
            asm.emit("EX AF, AF'");
            asm.emit("EI");
            asm.emit("RETI");
        } else {
            asm.emit("RET");
        }
    }

    fn emit_inst(
        &mut self,
        asm: &mut AsmBuilder,
        inst: crate::mir::Inst,
        data: &InstructionData,
    ) -> CodegenResult<()> {
        match data.clone() {
            InstructionData::UnaryImm { .. } => {
                // Constants are rematerialized at their uses.
            }
            InstructionData::SymbolAddr { symbol } => {
                let result = self.result_of(inst);
                match self.resolve_slot(&symbol) {
                    Slot::Abs(addr) => asm.emit(format!("LD HL, ${:04X}", addr)),
                    Slot::Global(name) => asm.emit(format!("LD HL, {}", name)),
                    Slot::Frame(offset) => {
                        asm.emit("PUSH IX");
                        asm.emit("POP HL");
                        asm.emit(format!("LD DE, {}", offset as u16));
                        asm.emit("ADD HL, DE");
                    }
                    Slot::Anchor(name) => asm.emit(format!("LD HL, {}$imm0", name)),
                }
                self.store_hl(asm, result);
            }
            InstructionData::Unary { opcode, arg } => self.emit_unary(asm, inst, opcode, arg)?,
            InstructionData::Binary { opcode, args } => {
                self.emit_binary(asm, inst, opcode, args)?
            }
            InstructionData::IntCompare { cond, args } => {
                let result = self.result_of(inst);
                self.emit_compare(asm, cond, args)?;
                let (jump, _) = flag_for(cond);
                let done = self.fresh_label("cc");
                asm.emit("LD A, 1");
                asm.emit(format!("JR {}, {}", jump, done));
                asm.emit("XOR A");
                asm.emit_label(&done)?;
                self.store_a(asm, result);
            }
            InstructionData::LoadVar { symbol, ty } => self.emit_load_var(asm, inst, &symbol, ty)?,
            InstructionData::StoreVar { symbol, arg } => self.emit_store_var(asm, &symbol, arg)?,
            InstructionData::LoadIndex { base, index, elem } => {
                let result = self.result_of(inst);
                self.emit_address(asm, base, index, self.module.types.size_of(elem))?;
                if elem.is_byte() {
                    asm.emit("LD A, (HL)");
                    self.store_a(asm, result);
                } else {
                    asm.emit("LD A, (HL)");
                    asm.emit("INC HL");
                    asm.emit("LD H, (HL)");
                    asm.emit("LD L, A");
                    self.store_hl(asm, result);
                }
            }
            InstructionData::StoreIndex {
                base,
                index,
                arg,
                elem,
            } => {
                self.emit_address(asm, base, index, self.module.types.size_of(elem))?;
                if elem.is_byte() {
                    asm.emit("PUSH HL");
                    self.load_a(asm, arg);
                    asm.emit("POP HL");
                    asm.emit("LD (HL), A");
                } else {
                    asm.emit("PUSH HL");
                    self.load_hl(asm, arg);
                    asm.emit("POP DE");
                    asm.emit("EX DE, HL");
                    asm.emit("LD (HL), E");
                    asm.emit("INC HL");
                    asm.emit("LD (HL), D");
                }
            }
            InstructionData::LoadField { base, strct, field } => {
                let result = self.result_of(inst);
                let offset = self
                    .module
                    .types
                    .field_offset(strct, &field)
                    .expect("field exists");
                let ty = self
                    .module
                    .types
                    .field_type(strct, &field)
                    .expect("field exists");
                self.load_hl(asm, base);
                if offset > 0 {
                    asm.emit(format!("LD DE, {}", offset));
                    asm.emit("ADD HL, DE");
                }
                if ty.is_byte() {
                    asm.emit("LD A, (HL)");
                    self.store_a(asm, result);
                } else {
                    asm.emit("LD A, (HL)");
                    asm.emit("INC HL");
                    asm.emit("LD H, (HL)");
                    asm.emit("LD L, A");
                    self.store_hl(asm, result);
                }
            }
            InstructionData::StoreField {
                base,
                strct,
                field,
                arg,
            } => {
                let offset = self
                    .module
                    .types
                    .field_offset(strct, &field)
                    .expect("field exists");
                let ty = self
                    .module
                    .types
                    .field_type(strct, &field)
                    .expect("field exists");
                self.load_hl(asm, base);
                if offset > 0 {
                    asm.emit(format!("LD DE, {}", offset));
                    asm.emit("ADD HL, DE");
                }
                if ty.is_byte() {
                    asm.emit("PUSH HL");
                    self.load_a(asm, arg);
                    asm.emit("POP HL");
                    asm.emit("LD (HL), A");
                } else {
                    asm.emit("PUSH HL");
                    self.load_hl(asm, arg);
                    asm.emit("POP DE");
                    asm.emit("EX DE, HL");
                    asm.emit("LD (HL), E");
                    asm.emit("INC HL");
                    asm.emit("LD (HL), D");
                }
            }
            InstructionData::LoadBitField {
                symbol,
                bits,
                field,
            } => {
                let result = self.result_of(inst);
                let layout = self
                    .module
                    .types
                    .bit_field_layout(bits, &field)
                    .expect("bit field exists");
                self.load_cell(asm, &symbol, layout.byte_offset);
                for _ in 0..layout.bit_offset {
                    asm.emit("SRL A");
                }
                asm.emit(format!("AND {}", (1u16 << layout.width) - 1));
                self.store_a(asm, result);
            }
            InstructionData::StoreBitField {
                symbol,
                bits,
                field,
                arg,
            } => {
                let layout = self
                    .module
                    .types
                    .bit_field_layout(bits, &field)
                    .expect("bit field exists");
                let field_mask = ((1u16 << layout.width) - 1) << layout.bit_offset;
                self.load_a(asm, arg);
                for _ in 0..layout.bit_offset {
                    asm.emit("ADD A, A");
                }
                asm.emit(format!("AND {}", field_mask));
                asm.emit("LD H, A");
                self.load_cell(asm, &symbol, layout.byte_offset);
                asm.emit(format!("AND {}", !field_mask & 0xFF));
                asm.emit("OR H");
                self.store_cell(asm, &symbol, layout.byte_offset);
            }
            InstructionData::Jump { destination } => {
                let name = self.local_label(&self.func.labels[destination].name);
                asm.emit(format!("JP {}", name));
            }
            InstructionData::Branch {
                opcode,
                arg,
                destination,
            } => {
                if self.wide(arg) {
                    self.load_hl(asm, arg);
                    asm.emit("LD A, H");
                    asm.emit("OR L");
                } else {
                    self.load_a(asm, arg);
                    asm.emit("OR A");
                }
                let name = self.local_label(&self.func.labels[destination].name);
                match opcode {
                    Opcode::JumpIfZero => asm.emit(format!("JP Z, {}", name)),
                    Opcode::JumpIfNotZero => asm.emit(format!("JP NZ, {}", name)),
                    _ => unreachable!(),
                }
            }
            InstructionData::BranchCompare {
                cond,
                args,
                destination,
            } => {
                self.emit_compare(asm, cond, args)?;
                let (jump, _) = flag_for(cond);
                let name = self.local_label(&self.func.labels[destination].name);
                asm.emit(format!("JP {}, {}", jump, name));
            }
            InstructionData::Call { func, args } => self.emit_call(asm, inst, &func, &args)?,
            InstructionData::Return { arg } => {
                if let Some(arg) = arg {
                    if self.wide(arg) {
                        self.load_hl(asm, arg);
                    } else {
                        self.load_a(asm, arg);
                    }
                }
                self.emit_epilogue(asm);
            }
            InstructionData::LabelMark { label } => {
                let name = self.local_label(&self.func.labels[label].name);
                asm.emit_label(name)?;
            }
            InstructionData::SmcAnchor { .. } => {
                // Anchors are emitted by the TSMC prologue, which covers every parameter.
            }
            InstructionData::SmcPatch { func, param, arg } => {
                self.emit_patch(asm, &func, param, arg)?;
            }
            InstructionData::TsmcLoad { param } => {
                let result = self.result_of(inst);
                let anchor = self
                    .anchors
                    .anchor(&self.func.qualified_name(), param)
                    .ok_or_else(|| self.unsupported(Opcode::TsmcLoad))?
                    .to_string();
                if self.func.signature.params[param as usize].ty.is_byte() {
                    asm.emit(format!("LD A, ({}$imm0)", anchor));
                    self.store_a(asm, result);
                } else {
                    asm.emit(format!("LD HL, ({}$imm0)", anchor));
                    self.store_hl(asm, result);
                }
            }
            InstructionData::IterBegin { count } => {
                self.load_a(asm, count);
                asm.emit("LD B, A");
            }
            InstructionData::IterStep { destination } => {
                let name = self.local_label(&self.func.labels[destination].name);
                asm.emit(format!("DJNZ {}", name));
            }
            InstructionData::IterEnd => {}
        }
        Ok(())
    }

    fn result_of(&self, inst: crate::mir::Inst) -> Value {
        self.func.inst_result(inst).expect("instruction has a result")
    }

    fn load_cell(&mut self, asm: &mut AsmBuilder, symbol: &str, byte_offset: u16) {
        match self.resolve_slot(symbol) {
            Slot::Abs(addr) => asm.emit(format!("LD A, (${:04X})", addr + byte_offset)),
            Slot::Global(name) => {
                if byte_offset == 0 {
                    asm.emit(format!("LD A, ({})", name))
                } else {
                    asm.emit(format!("LD A, ({} + {})", name, byte_offset))
                }
            }
            Slot::Frame(offset) => {
                asm.emit(format!("LD A, (IX{:+})", offset + byte_offset as i16))
            }
            Slot::Anchor(name) => asm.emit(format!("LD A, ({}$imm0)", name)),
        }
    }

    fn store_cell(&mut self, asm: &mut AsmBuilder, symbol: &str, byte_offset: u16) {
        match self.resolve_slot(symbol) {
            Slot::Abs(addr) => asm.emit(format!("LD (${:04X}), A", addr + byte_offset)),
            Slot::Global(name) => {
                if byte_offset == 0 {
                    asm.emit(format!("LD ({}), A", name))
                } else {
                    asm.emit(format!("LD ({} + {}), A", name, byte_offset))
                }
            }
            Slot::Frame(offset) => {
                asm.emit(format!("LD (IX{:+}), A", offset + byte_offset as i16))
            }
            Slot::Anchor(name) => asm.emit(format!("LD ({}$imm0), A", name)),
        }
    }

    /// The declared width of a named slot, when the function declares it.
    fn slot_is_byte(&self, symbol: &str) -> Option<bool> {
        if let Some(index) = self.func.signature.param_index(symbol) {
            return Some(self.func.signature.params[index].ty.is_byte());
        }
        self.func
            .find_local(symbol)
            .map(|local| self.func.locals[local].ty.is_byte())
    }

    fn emit_load_var(
        &mut self,
        asm: &mut AsmBuilder,
        inst: crate::mir::Inst,
        symbol: &str,
        ty: Type,
    ) -> CodegenResult<()> {
        let result = self.result_of(inst);
        if self.pinned.contains_key(symbol) {
            // Direct mode: the value is its incoming register; nothing to emit.
            return Ok(());
        }
        // Reading a byte slot at word width zero-extends; the other direction reads the
        // low byte, which little-endian storage gives for free.
        let narrow_source = !ty.is_byte() && self.slot_is_byte(symbol) == Some(true);
        let byte_read = ty.is_byte() || narrow_source;
        match self.resolve_slot(symbol) {
            Slot::Anchor(name) => {
                if byte_read {
                    asm.emit(format!("LD A, ({}$imm0)", name));
                } else {
                    asm.emit(format!("LD HL, ({}$imm0)", name));
                }
            }
            Slot::Abs(addr) => {
                if byte_read {
                    asm.emit(format!("LD A, (${:04X})", addr));
                } else {
                    asm.emit(format!("LD HL, (${:04X})", addr));
                }
            }
            Slot::Global(name) => {
                if byte_read {
                    asm.emit(format!("LD A, ({})", name));
                } else {
                    asm.emit(format!("LD HL, ({})", name));
                }
            }
            Slot::Frame(offset) => {
                if byte_read {
                    asm.emit(format!("LD A, (IX{:+})", offset));
                } else {
                    asm.emit(format!("LD L, (IX{:+})", offset));
                    asm.emit(format!("LD H, (IX{:+})", offset + 1));
                }
            }
        }
        if ty.is_byte() {
            self.store_a(asm, result);
        } else {
            if narrow_source {
                asm.emit("LD L, A");
                asm.emit("LD H, 0");
            }
            self.store_hl(asm, result);
        }
        Ok(())
    }

    fn emit_store_var(
        &mut self,
        asm: &mut AsmBuilder,
        symbol: &str,
        arg: Value,
    ) -> CodegenResult<()> {
        // The slot's declared width wins over the stored value's width: a wide value going
        // into a byte slot stores its low byte, a byte value going into a wide slot is
        // zero-extended.
        let wide = match self.slot_is_byte(symbol) {
            Some(is_byte) => !is_byte,
            None => self.wide(arg),
        };
        if wide && !self.wide(arg) {
            self.load_a(asm, arg);
            asm.emit("LD L, A");
            asm.emit("LD H, 0");
            return self.finish_wide_store(asm, symbol);
        }
        if !wide && self.wide(arg) {
            self.load_hl(asm, arg);
            asm.emit("LD A, L");
            return self.finish_byte_store(asm, symbol);
        }
        if wide {
            self.load_hl(asm, arg);
            self.finish_wide_store(asm, symbol)
        } else {
            self.load_a(asm, arg);
            self.finish_byte_store(asm, symbol)
        }
    }

    /// Store HL into the named slot.
    fn finish_wide_store(&mut self, asm: &mut AsmBuilder, symbol: &str) -> CodegenResult<()> {
        match self.resolve_slot(symbol) {
            Slot::Anchor(name) => asm.emit(format!("LD ({}$imm0), HL", name)),
            Slot::Abs(addr) => asm.emit(format!("LD (${:04X}), HL", addr)),
            Slot::Global(name) => asm.emit(format!("LD ({}), HL", name)),
            Slot::Frame(offset) => {
                asm.emit(format!("LD (IX{:+}), L", offset));
                asm.emit(format!("LD (IX{:+}), H", offset + 1));
            }
        }
        Ok(())
    }

    /// Store A into the named slot.
    fn finish_byte_store(&mut self, asm: &mut AsmBuilder, symbol: &str) -> CodegenResult<()> {
        match self.resolve_slot(symbol) {
            Slot::Anchor(name) => asm.emit(format!("LD ({}$imm0), A", name)),
            Slot::Abs(addr) => asm.emit(format!("LD (${:04X}), A", addr)),
            Slot::Global(name) => asm.emit(format!("LD ({}), A", name)),
            Slot::Frame(offset) => asm.emit(format!("LD (IX{:+}), A", offset)),
        }
        Ok(())
    }

    fn emit_unary(
        &mut self,
        asm: &mut AsmBuilder,
        inst: crate::mir::Inst,
        opcode: Opcode,
        arg: Value,
    ) -> CodegenResult<()> {
        let result = self.result_of(inst);
        if self.wide(arg) && opcode != Opcode::Test {
            self.load_hl(asm, arg);
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
            self.store_hl(asm, result);
            return Ok(());
        }

        match opcode {
            Opcode::Test => {
                if self.wide(arg) {
                    self.load_hl(asm, arg);
                    asm.emit("LD A, H");
                    asm.emit("OR L");
                } else {
                    self.load_a(asm, arg);
                    asm.emit("OR A");
                }
                let done = self.fresh_label("tz");
                asm.emit("LD A, 1");
                asm.emit(format!("JR Z, {}", done));
                asm.emit("XOR A");
                asm.emit_label(&done)?;
                self.store_a(asm, result);
            }
            Opcode::Move => {
                self.load_a(asm, arg);
                self.store_a(asm, result);
            }
            Opcode::Not => {
                self.load_a(asm, arg);
                asm.emit("CPL");
                self.store_a(asm, result);
            }
            Opcode::Neg => {
                self.load_a(asm, arg);
                asm.emit("NEG");
                self.store_a(asm, result);
            }
            Opcode::Inc => {
                self.load_a(asm, arg);
                asm.emit("INC A");
                self.store_a(asm, result);
            }
            Opcode::Dec => {
                self.load_a(asm, arg);
                asm.emit("DEC A");
                self.store_a(asm, result);
            }
            _ => return Err(self.unsupported(opcode)),
        }
        Ok(())
    }

    /// The text of an 8-bit right operand, staging through H when it is not directly usable.
    ///
    /// When the left operand lives in A, it is parked in L first so the staging loads cannot
    /// clobber it; the returned flag says the caller should fetch it back with `LD A, L`.
    fn rhs_operand8(
        &mut self,
        asm: &mut AsmBuilder,
        lhs: Value,
        rhs: Value,
    ) -> (String, bool) {
        if let Some(imm) = self.consts[rhs] {
            return (format!("{}", imm & 0xFF), false);
        }
        match self.allocation.location(rhs) {
            Location::Phys(Reg::R8(Reg8::A)) => {
                asm.emit("LD L, A");
                ("L".to_string(), false)
            }
            Location::Phys(Reg::R8(r)) => (r.to_string(), false),
            Location::Mem(addr) => {
                let lhs_in_a =
                    self.consts[lhs].is_none()
                        && self.allocation.location(lhs) == Location::Phys(Reg::R8(Reg8::A));
                if lhs_in_a {
                    asm.emit("LD L, A");
                }
                asm.emit(format!("LD A, (${:04X})", addr));
                asm.emit("LD H, A");
                ("H".to_string(), lhs_in_a)
            }
            Location::Shadow(Reg::R8(r)) => {
                let lhs_in_a =
                    self.consts[lhs].is_none()
                        && self.allocation.location(lhs) == Location::Phys(Reg::R8(Reg8::A));
                if lhs_in_a {
                    asm.emit("LD L, A");
                }
                asm.emit("EXX");
                asm.emit(format!("LD A, {}", r));
                asm.emit("EXX");
                asm.emit("LD H, A");
                ("H".to_string(), lhs_in_a)
            }
            other => panic!("8-bit operand in bad location {:?}", other),
        }
    }

    fn emit_binary(
        &mut self,
        asm: &mut AsmBuilder,
        inst: crate::mir::Inst,
        opcode: Opcode,
        args: [Value; 2],
    ) -> CodegenResult<()> {
        let result = self.result_of(inst);
        if self.wide(args[0]) {
            return self.emit_binary16(asm, inst, opcode, args);
        }
        let [lhs, rhs] = args;

        // Helper-backed operations use the A/L convention.
        let helper = match opcode {
            Opcode::Mul => Some("__mul8"),
            Opcode::Div => Some("__div8"),
            Opcode::Mod => Some("__mod8"),
            Opcode::Shl if self.consts[rhs].is_none() => Some("__shl8"),
            Opcode::Shr if self.consts[rhs].is_none() => Some("__shr8"),
            _ => None,
        };
        if let Some(helper) = helper {
            let lhs_in_a = self.consts[lhs].is_none()
                && self.allocation.location(lhs) == Location::Phys(Reg::R8(Reg8::A));
            if lhs_in_a {
                asm.emit("LD H, A");
            }
            self.load_a(asm, rhs);
            asm.emit("LD L, A");
            if lhs_in_a {
                asm.emit("LD A, H");
            } else {
                self.load_a(asm, lhs);
            }
            asm.emit(format!("CALL {}", helper));
            self.helpers.insert(helper_name(helper));
            self.store_a(asm, result);
            return Ok(());
        }

        // Constant-count shifts unroll.
        if let (Opcode::Shl, Some(n)) | (Opcode::Shr, Some(n)) = (opcode, self.consts[rhs]) {
            self.load_a(asm, lhs);
            let n = (n & 15) as u16;
            if n >= 8 {
                asm.emit("XOR A");
            } else {
                for _ in 0..n {
                    asm.emit(if opcode == Opcode::Shl { "ADD A, A" } else { "SRL A" });
                }
            }
            self.store_a(asm, result);
            return Ok(());
        }

        let (operand, lhs_parked) = self.rhs_operand8(asm, lhs, rhs);
        if lhs_parked {
            asm.emit("LD A, L");
        } else {
            self.load_a(asm, lhs);
        }
        match opcode {
            Opcode::Add => asm.emit(format!("ADD A, {}", operand)),
            Opcode::Sub => asm.emit(format!("SUB {}", operand)),
            Opcode::And => asm.emit(format!("AND {}", operand)),
            Opcode::Or => asm.emit(format!("OR {}", operand)),
            Opcode::Xor => asm.emit(format!("XOR {}", operand)),
            _ => return Err(self.unsupported(opcode)),
        }
        self.store_a(asm, result);
        Ok(())
    }

    fn emit_binary16(
        &mut self,
        asm: &mut AsmBuilder,
        inst: crate::mir::Inst,
        opcode: Opcode,
        args: [Value; 2],
    ) -> CodegenResult<()> {
        let result = self.result_of(inst);
        let [lhs, rhs] = args;

        match opcode {
            Opcode::Add | Opcode::Sub => {
                // `EX DE, HL` handles the crossed case in one instruction.
                let lhs_in_de = self.consts[lhs].is_none()
                    && self.allocation.location(lhs) == Location::Phys(Reg::R16(Reg16::DE));
                let rhs_in_hl = self.consts[rhs].is_none()
                    && self.allocation.location(rhs) == Location::Phys(Reg::R16(Reg16::HL));
                let rhs_in_bc = self.consts[rhs].is_none()
                    && self.allocation.location(rhs) == Location::Phys(Reg::R16(Reg16::BC));

                let (operand, pop_de) = if rhs_in_bc {
                    self.load_hl(asm, lhs);
                    ("BC", false)
                } else if lhs_in_de && rhs_in_hl {
                    asm.emit("EX DE, HL");
                    ("DE", false)
                } else if lhs_in_de {
                    asm.emit("LD H, D");
                    asm.emit("LD L, E");
                    let pop = self.stage_de(asm, rhs);
                    ("DE", pop)
                } else {
                    let pop = self.stage_de(asm, rhs);
                    self.load_hl(asm, lhs);
                    ("DE", pop)
                };
                match opcode {
                    Opcode::Add => asm.emit(format!("ADD HL, {}", operand)),
                    Opcode::Sub => {
                        asm.emit("OR A");
                        asm.emit(format!("SBC HL, {}", operand));
                    }
                    _ => unreachable!(),
                }
                if pop_de {
                    asm.emit("POP DE");
                }
                self.store_hl(asm, result);
            }
            Opcode::And | Opcode::Or | Opcode::Xor => {
                let mnemonic = match opcode {
                    Opcode::And => "AND",
                    Opcode::Or => "OR",
                    _ => "XOR",
                };
                let pop = self.stage_de(asm, rhs);
                self.load_hl(asm, lhs);
                asm.emit("LD A, H");
                asm.emit(format!("{} D", mnemonic));
                asm.emit("LD H, A");
                asm.emit("LD A, L");
                asm.emit(format!("{} E", mnemonic));
                asm.emit("LD L, A");
                if pop {
                    asm.emit("POP DE");
                }
                self.store_hl(asm, result);
            }
            Opcode::Shl | Opcode::Shr => {
                if let Some(n) = self.consts[rhs] {
                    self.load_hl(asm, lhs);
                    let n = (n & 15) as u16;
                    for _ in 0..n {
                        if opcode == Opcode::Shl {
                            asm.emit("ADD HL, HL");
                        } else {
                            asm.emit("SRL H");
                            asm.emit("RR L");
                        }
                    }
                    self.store_hl(asm, result);
                } else {
                    let helper = if opcode == Opcode::Shl {
                        "__shl16"
                    } else {
                        "__shr16"
                    };
                    // Count rides in A; none of the HL load paths touch A.
                    self.load_hl(asm, rhs);
                    asm.emit("LD A, L");
                    self.load_hl(asm, lhs);
                    asm.emit(format!("CALL {}", helper));
                    self.helpers.insert(helper_name(helper));
                    self.store_hl(asm, result);
                }
            }
            Opcode::Mul | Opcode::Div | Opcode::Mod => {
                let helper = match opcode {
                    Opcode::Mul => "__mul16",
                    Opcode::Div => "__div16",
                    _ => "__mod16",
                };
                let pop = self.stage_de(asm, rhs);
                self.load_hl(asm, lhs);
                asm.emit(format!("CALL {}", helper));
                self.helpers.insert(helper_name(helper));
                if pop {
                    asm.emit("POP DE");
                }
                self.store_hl(asm, result);
            }
            _ => return Err(self.unsupported(opcode)),
        }
        Ok(())
    }

    /// Compare `args[0]` against `args[1]`, leaving the flags set for `flag_for(cond)`.
    ///
    /// `Gt` and `Le` swap the operands so every condition reduces to Z or C tests. Signed
    /// comparisons bias both operands by `$80` first, which maps them onto the unsigned order.
    fn emit_compare(
        &mut self,
        asm: &mut AsmBuilder,
        cond: CondCode,
        args: [Value; 2],
    ) -> CodegenResult<()> {
        let (_, swap) = flag_for(cond);
        let (lhs, rhs) = if swap {
            (args[1], args[0])
        } else {
            (args[0], args[1])
        };
        let signed = self.func.value_type(args[0]).is_signed();

        if self.wide(args[0]) {
            let pop = self.stage_de(asm, rhs);
            self.load_hl(asm, lhs);
            if signed {
                asm.emit("LD A, H");
                asm.emit("XOR $80");
                asm.emit("LD H, A");
                asm.emit("LD A, D");
                asm.emit("XOR $80");
                asm.emit("LD D, A");
            }
            asm.emit("OR A");
            asm.emit("SBC HL, DE");
            if pop {
                asm.emit("POP DE");
            }
        } else {
            let (operand, mut lhs_parked) = self.rhs_operand8(asm, lhs, rhs);
            if signed {
                // Immediates fold their bias; register operands are biased in a copy in H so
                // whatever value owns that register is untouched.
                if let Ok(imm) = operand.parse::<i64>() {
                    if lhs_parked {
                        asm.emit("LD A, L");
                    } else {
                        self.load_a(asm, lhs);
                    }
                    asm.emit("XOR $80");
                    asm.emit(format!("CP {}", (imm ^ 0x80) & 0xFF));
                    return Ok(());
                }
                if !lhs_parked
                    && self.consts[lhs].is_none()
                    && self.allocation.location(lhs) == Location::Phys(Reg::R8(Reg8::A))
                {
                    asm.emit("LD L, A");
                    lhs_parked = true;
                }
                asm.emit(format!("LD A, {}", operand));
                asm.emit("XOR $80");
                asm.emit("LD H, A");
                if lhs_parked {
                    asm.emit("LD A, L");
                } else {
                    self.load_a(asm, lhs);
                }
                asm.emit("XOR $80");
                asm.emit("CP H");
                return Ok(());
            }
            if lhs_parked {
                asm.emit("LD A, L");
            } else {
                self.load_a(asm, lhs);
            }
            asm.emit(format!("CP {}", operand));
        }
        Ok(())
    }

    fn emit_address(
        &mut self,
        asm: &mut AsmBuilder,
        base: Value,
        index: Value,
        elem_size: u16,
    ) -> CodegenResult<()> {
        // Scale the index first so the base load cannot be clobbered.
        if let Some(imm) = self.consts[index] {
            self.load_hl(asm, base);
            let offset = imm as u16 * elem_size;
            if offset > 0 {
                asm.emit(format!("LD DE, {}", offset));
                asm.emit("ADD HL, DE");
            }
            return Ok(());
        }
        if self.wide(index) {
            self.load_hl(asm, index);
        } else {
            self.load_a(asm, index);
            asm.emit("LD L, A");
            asm.emit("LD H, 0");
        }
        asm.emit("EX DE, HL");
        self.load_hl(asm, base);
        for _ in 0..elem_size.max(1) {
            asm.emit("ADD HL, DE");
        }
        Ok(())
    }

    /// Write `arg` into the callee's anchor for `param`.
    ///
    /// The write width follows the callee's parameter type, never the argument's: an anchor is
    /// exactly as wide as the immediate slot it labels, and writing past a one-byte slot would
    /// stamp on the following opcode.
    fn emit_patch(
        &mut self,
        asm: &mut AsmBuilder,
        callee_name: &str,
        param: u8,
        arg: Value,
    ) -> CodegenResult<()> {
        let callee_id = self.module.find_function(callee_name);
        let qualified = callee_id
            .map(|id| self.module.funcs[id].qualified_name())
            .unwrap_or_else(|| callee_name.to_string());
        let anchor = self
            .anchors
            .anchor(&qualified, param)
            .ok_or_else(|| self.unsupported(Opcode::SmcPatch))?
            .to_string();
        let param_is_byte = callee_id
            .and_then(|id| {
                self.module.funcs[id]
                    .signature
                    .params
                    .get(param as usize)
                    .map(|p| p.ty.is_byte())
            })
            .unwrap_or(!self.wide(arg));
        if param_is_byte {
            if self.wide(arg) {
                self.load_hl(asm, arg);
                asm.emit("LD A, L");
            } else {
                self.load_a(asm, arg);
            }
            asm.emit(format!("LD ({}$imm0), A", anchor));
        } else {
            if self.wide(arg) {
                self.load_hl(asm, arg);
            } else {
                self.load_a(asm, arg);
                asm.emit("LD L, A");
                asm.emit("LD H, 0");
            }
            asm.emit(format!("LD ({}$imm0), HL", anchor));
        }
        Ok(())
    }

    fn emit_call(
        &mut self,
        asm: &mut AsmBuilder,
        inst: crate::mir::Inst,
        callee_name: &str,
        args: &[Value],
    ) -> CodegenResult<()> {
        let callee_id = self.module.find_function(callee_name);
        // Externs are skipped by convention selection and unresolved targets have no function
        // at all; both take the convention the decision table assigns to their signature's
        // shape, so a wide extern is called through the stack frame like any other wide callee.
        let (target, sig, conv) = match callee_id {
            Some(id) => {
                let callee = &self.module.funcs[id];
                let conv = callee
                    .signature
                    .conv
                    .or(callee.forced_conv)
                    .unwrap_or_else(|| default_for_signature(&callee.signature));
                (callee.qualified_name(), callee.signature.clone(), conv)
            }
            None => {
                let mut synthetic = crate::mir::Signature::new();
                for (i, &arg) in args.iter().enumerate() {
                    synthetic.params.push(crate::mir::AbiParam::new(
                        format!("p{}", i),
                        self.func.value_type(arg),
                    ));
                }
                let conv = default_for_signature(&synthetic);
                (callee_name.to_string(), synthetic, conv)
            }
        };

        match conv {
            CallConv::Register => {
                let places = param_assignment(&sig);
                // DE-pair arguments first, then HL, then the other 8-bit registers, A last:
                // each later stage must not disturb an earlier one.
                let mut order: Vec<usize> = (0..args.len()).collect();
                order.sort_by_key(|&i| match places.get(i) {
                    Some(ParamPlace::Reg(Reg::R16(Reg16::DE))) => 0,
                    Some(ParamPlace::Reg(Reg::R16(_))) => 1,
                    Some(ParamPlace::Reg(Reg::R8(Reg8::A))) => 3,
                    _ => 2,
                });
                let mut pushed = 0usize;
                for &i in &order {
                    let arg = args[i];
                    match places.get(i) {
                        Some(ParamPlace::Reg(Reg::R16(pair))) => {
                            self.load_hl(asm, arg);
                            if *pair == Reg16::DE {
                                asm.emit("EX DE, HL");
                            } else if *pair == Reg16::BC {
                                asm.emit("LD B, H");
                                asm.emit("LD C, L");
                            }
                        }
                        Some(ParamPlace::Reg(Reg::R8(Reg8::A))) => {
                            self.load_a(asm, arg);
                        }
                        Some(ParamPlace::Reg(Reg::R8(r))) => {
                            if let Some(imm) = self.consts[arg] {
                                asm.emit(format!("LD {}, {}", r, imm & 0xFF));
                            } else {
                                self.load_a(asm, arg);
                                asm.emit(format!("LD {}, A", r));
                            }
                        }
                        _ => {
                            // Overflow beyond the register budget (a forced register
                            // convention can still have one) rides the stack for the call
                            // and is popped again below.
                            if self.wide(arg) {
                                self.load_hl(asm, arg);
                            } else {
                                self.load_a(asm, arg);
                                asm.emit("LD L, A");
                                asm.emit("LD H, 0");
                            }
                            asm.emit("PUSH HL");
                            pushed += 1;
                        }
                    }
                }
                asm.emit(format!("CALL {}", target));
                // The caller owns the overflow words; drop them so SP stays balanced.
                let ret_wide = self
                    .func
                    .inst_result(inst)
                    .map_or(false, |r| self.wide(r));
                for _ in 0..pushed {
                    if ret_wide {
                        asm.emit("INC SP");
                        asm.emit("INC SP");
                    } else {
                        asm.emit("POP HL");
                    }
                }
            }
            CallConv::Tsmc => {
                for (i, &arg) in args.iter().enumerate() {
                    self.emit_patch(asm, &target, i as u8, arg)?;
                }
                asm.emit(format!("CALL {}", target));
            }
            CallConv::StackFrame => {
                for &arg in args.iter().rev() {
                    if self.wide(arg) {
                        self.load_hl(asm, arg);
                    } else {
                        self.load_a(asm, arg);
                        asm.emit("LD L, A");
                        asm.emit("LD H, 0");
                    }
                    asm.emit("PUSH HL");
                }
                asm.emit(format!("CALL {}", target));
                let ret_wide = self
                    .func
                    .inst_result(inst)
                    .map_or(false, |r| self.wide(r));
                for _ in 0..args.len() {
                    if ret_wide {
                        asm.emit("INC SP");
                        asm.emit("INC SP");
                    } else {
                        asm.emit("POP HL");
                    }
                }
            }
        }

        if let Some(result) = self.func.inst_result(inst) {
            if self.wide(result) {
                self.store_hl(asm, result);
            } else {
                self.store_a(asm, result);
            }
        }
        Ok(())
    }
}

/// The jump condition implementing `cond` after a compare, plus whether the compare must swap
/// its operands first.
fn flag_for(cond: CondCode) -> (&'static str, bool) {
    match cond {
        CondCode::Eq => ("Z", false),
        CondCode::Ne => ("NZ", false),
        CondCode::Lt => ("C", false),
        CondCode::Ge => ("NC", false),
        CondCode::Gt => ("C", true),
        CondCode::Le => ("NC", true),
    }
}

fn helper_name(name: &str) -> &'static str {
    crate::isa::z80::helpers::ALL_HELPERS
        .iter()
        .find(|&&h| h == name)
        .expect("known helper")
}
