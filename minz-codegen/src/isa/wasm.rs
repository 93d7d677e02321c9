//! WebAssembly text backend.
//!
//! WebAssembly only has structured control flow, so the linear label-and-jump layout is
//! rebuilt as a dispatch loop: the body is cut into segments at the labels, the segments
//! become nested blocks selected by `br_table` on a program-counter local, and every jump
//! sets the counter and restarts the loop. Falling off a segment continues into the next
//! one, which matches the fall-through semantics of the layout exactly.
//!
//! Parameters and locals keep their MIR names as wasm locals, which makes this the third
//! backend that consumes the symbol-completeness invariant. Arithmetic runs in i32 and is
//! masked back to the storage width after every wrapping operation.

use crate::diagnostic::Diagnostics;
use crate::isa::{Capabilities, TargetIsa};
use crate::mir::{
    CondCode, DataPayload, Function, InstructionData, Module, Opcode, Type, Value,
};
use crate::result::{CodegenError, CodegenResult};
use crate::settings::Flags;
use core::fmt::Write;

/// The WebAssembly text generator.
pub struct WasmBackend;

impl TargetIsa for WasmBackend {
    fn name(&self) -> &'static str {
        "wasm"
    }

    fn extension(&self) -> &'static str {
        "wat"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_smc: false,
            shadow_registers: false,
            indexed_addressing: false,
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
        writeln!(out, "(module ;; {}", module.name).unwrap();
        writeln!(out, "  (memory (export \"memory\") 1)").unwrap();

        let mut offset = 0usize;
        for (_, decl) in module.data.iter() {
            let bytes = serialize_data(&decl.payload);
            let mut escaped = String::new();
            for b in &bytes {
                write!(escaped, "\\{:02x}", b).unwrap();
            }
            writeln!(
                out,
                "  (data (i32.const {}) \"{}\") ;; {}",
                offset, escaped, decl.symbol
            )
            .unwrap();
            offset += bytes.len();
        }

        for (_, func) in module.funcs.iter() {
            if func.is_extern {
                continue;
            }
            emit_function(&mut out, module, func)?;
        }
        writeln!(out, ")").unwrap();

        let _ = (flags, diag);
        Ok(out)
    }
}

fn serialize_data(payload: &DataPayload) -> Vec<u8> {
    match payload {
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
        DataPayload::Words(words) => words.iter().flat_map(|w| w.to_le_bytes()).collect(),
    }
}

fn mask_of(ty: Type) -> Option<u32> {
    match ty {
        Type::U8 | Type::I8 | Type::Bool => Some(0xFF),
        Type::U16 | Type::I16 | Type::Ptr | Type::Ref | Type::FuncPtr => Some(0xFFFF),
        Type::Compound(_) => None,
    }
}

struct WasmEmitter<'a> {
    module: &'a Module,
    func: &'a Function,
    out: &'a mut String,
    /// Layout position of each label's segment start.
    segment_of_label: Vec<(crate::mir::Label, usize)>,
}

impl<'a> WasmEmitter<'a> {
    fn v(&self, value: Value) -> String {
        format!("${}", value)
    }

    fn segment_index(&self, label: crate::mir::Label) -> usize {
        self.segment_of_label
            .iter()
            .find(|(l, _)| *l == label)
            .map(|(_, seg)| *seg)
            .expect("label has a segment")
    }

    fn line(&mut self, depth: usize, text: &str) {
        for _ in 0..depth {
            self.out.push_str("  ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn mask_result(&mut self, depth: usize, value: Value) {
        if let Some(mask) = mask_of(self.func.value_type(value)) {
            self.line(depth, &format!("i32.const {}", mask));
            self.line(depth, "i32.and");
        }
    }

    fn jump_to(&mut self, depth: usize, segment: usize) {
        self.line(depth, &format!("i32.const {}", segment));
        self.line(depth, "local.set $pc");
        self.line(depth, "br $dispatch");
    }

    fn emit_inst(&mut self, depth: usize, inst: crate::mir::Inst) -> CodegenResult<()> {
        let func_name = self.func.qualified_name();
        let unsupported = |opcode: Opcode| CodegenError::UnsupportedOpcode {
            opcode: opcode.mnemonic(),
            function: func_name.clone(),
            target: "wasm",
        };
        let func = self.func;
        match func.insts[inst].clone() {
            InstructionData::UnaryImm { imm, ty } => {
                let r = func.inst_result(inst).expect("result");
                self.line(
                    depth,
                    &format!("i32.const {}", imm & ty.mask().unwrap_or(0xFFFF)),
                );
                self.line(depth, &format!("local.set {}", self.v(r)));
            }
            InstructionData::Unary { opcode, arg } => {
                let r = func.inst_result(inst).expect("result");
                self.line(depth, &format!("local.get {}", self.v(arg)));
                match opcode {
                    Opcode::Move => {}
                    Opcode::Not => {
                        self.line(depth, "i32.const -1");
                        self.line(depth, "i32.xor");
                        self.mask_result(depth, r);
                    }
                    Opcode::Neg => {
                        // 0 - x, rebuilt because wasm has no negate.
                        self.line(depth, &format!("local.set {}", self.v(r)));
                        self.line(depth, "i32.const 0");
                        self.line(depth, &format!("local.get {}", self.v(r)));
                        self.line(depth, "i32.sub");
                        self.mask_result(depth, r);
                    }
                    Opcode::Inc => {
                        self.line(depth, "i32.const 1");
                        self.line(depth, "i32.add");
                        self.mask_result(depth, r);
                    }
                    Opcode::Dec => {
                        self.line(depth, "i32.const 1");
                        self.line(depth, "i32.sub");
                        self.mask_result(depth, r);
                    }
                    Opcode::Test => self.line(depth, "i32.eqz"),
                    _ => return Err(unsupported(opcode)),
                }
                self.line(depth, &format!("local.set {}", self.v(r)));
            }
            InstructionData::Binary { opcode, args } => {
                let r = func.inst_result(inst).expect("result");
                self.line(depth, &format!("local.get {}", self.v(args[0])));
                self.line(depth, &format!("local.get {}", self.v(args[1])));
                let (op, wraps) = match opcode {
                    Opcode::Add => ("i32.add", true),
                    Opcode::Sub => ("i32.sub", true),
                    Opcode::Mul => ("i32.mul", true),
                    Opcode::Div => ("i32.div_u", false),
                    Opcode::Mod => ("i32.rem_u", false),
                    Opcode::And => ("i32.and", false),
                    Opcode::Or => ("i32.or", false),
                    Opcode::Xor => ("i32.xor", false),
                    Opcode::Shl => ("i32.shl", true),
                    Opcode::Shr => ("i32.shr_u", false),
                    _ => return Err(unsupported(opcode)),
                };
                self.line(depth, op);
                if wraps {
                    self.mask_result(depth, r);
                }
                self.line(depth, &format!("local.set {}", self.v(r)));
            }
            InstructionData::IntCompare { cond, args } => {
                let r = func.inst_result(inst).expect("result");
                let signed = func.value_type(args[0]).is_signed();
                self.line(depth, &format!("local.get {}", self.v(args[0])));
                self.line(depth, &format!("local.get {}", self.v(args[1])));
                self.line(depth, wasm_cmp(cond, signed));
                self.line(depth, &format!("local.set {}", self.v(r)));
            }
            InstructionData::LoadVar { symbol, .. } => {
                let r = func.inst_result(inst).expect("result");
                self.line(depth, &format!("local.get ${}", symbol));
                self.line(depth, &format!("local.set {}", self.v(r)));
            }
            InstructionData::StoreVar { symbol, arg } => {
                self.line(depth, &format!("local.get {}", self.v(arg)));
                self.line(depth, &format!("local.set ${}", symbol));
            }
            InstructionData::Jump { destination } => {
                let segment = self.segment_index(destination);
                self.jump_to(depth, segment);
            }
            InstructionData::Branch {
                opcode,
                arg,
                destination,
            } => {
                let segment = self.segment_index(destination);
                self.line(depth, &format!("local.get {}", self.v(arg)));
                if opcode == Opcode::JumpIfZero {
                    self.line(depth, "i32.eqz");
                }
                self.line(depth, "if");
                self.jump_to(depth + 1, segment);
                self.line(depth, "end");
            }
            InstructionData::BranchCompare {
                cond,
                args,
                destination,
            } => {
                let segment = self.segment_index(destination);
                let signed = func.value_type(args[0]).is_signed();
                self.line(depth, &format!("local.get {}", self.v(args[0])));
                self.line(depth, &format!("local.get {}", self.v(args[1])));
                self.line(depth, wasm_cmp(cond, signed));
                self.line(depth, "if");
                self.jump_to(depth + 1, segment);
                self.line(depth, "end");
            }
            InstructionData::Call { func: callee, args } => {
                let target = self
                    .module
                    .find_function(&callee)
                    .map(|id| self.module.funcs[id].qualified_name())
                    .unwrap_or_else(|| callee.clone());
                for &arg in args.iter() {
                    self.line(depth, &format!("local.get {}", self.v(arg)));
                }
                self.line(depth, &format!("call ${}", target));
                if let Some(r) = func.inst_result(inst) {
                    self.line(depth, &format!("local.set {}", self.v(r)));
                }
            }
            InstructionData::Return { arg } => {
                if let Some(arg) = arg {
                    self.line(depth, &format!("local.get {}", self.v(arg)));
                    self.line(depth, "local.set $retval");
                }
                self.line(depth, "br $exit");
            }
            InstructionData::LabelMark { .. } => {
                // Segment boundaries are handled by the dispatch structure.
            }
            ref other => return Err(unsupported(other.opcode())),
        }
        Ok(())
    }
}

fn wasm_cmp(cond: CondCode, signed: bool) -> &'static str {
    match (cond, signed) {
        (CondCode::Eq, _) => "i32.eq",
        (CondCode::Ne, _) => "i32.ne",
        (CondCode::Lt, false) => "i32.lt_u",
        (CondCode::Le, false) => "i32.le_u",
        (CondCode::Gt, false) => "i32.gt_u",
        (CondCode::Ge, false) => "i32.ge_u",
        (CondCode::Lt, true) => "i32.lt_s",
        (CondCode::Le, true) => "i32.le_s",
        (CondCode::Gt, true) => "i32.gt_s",
        (CondCode::Ge, true) => "i32.ge_s",
    }
}

fn emit_function(out: &mut String, module: &Module, func: &Function) -> CodegenResult<()> {
    // Cut the layout into segments at the labels.
    let mut segments: Vec<usize> = vec![0];
    let mut segment_of_label = Vec::new();
    for (pos, inst) in func.layout_iter() {
        if let InstructionData::LabelMark { label } = func.insts[inst] {
            if pos != 0 {
                segments.push(pos);
            }
            segment_of_label.push((label, segments.len() - 1));
        }
    }

    write!(out, "  (func ${}", func.qualified_name()).unwrap();
    for param in &func.signature.params {
        write!(out, " (param ${} i32)", param.name).unwrap();
    }
    if func.signature.ret.is_some() {
        write!(out, " (result i32)").unwrap();
    }
    writeln!(out).unwrap();
    for (_, local) in func.locals.iter() {
        writeln!(out, "    (local ${} i32)", local.name).unwrap();
    }
    for (value, data) in func.values.iter() {
        if data.def.is_none() {
            continue;
        }
        writeln!(out, "    (local ${} i32)", value).unwrap();
    }
    writeln!(out, "    (local $pc i32)").unwrap();
    if func.signature.ret.is_some() {
        writeln!(out, "    (local $retval i32)").unwrap();
    }

    let mut emitter = WasmEmitter {
        module,
        func,
        out,
        segment_of_label,
    };
    let n = segments.len();
    emitter.line(2, "block $exit");
    emitter.line(3, "loop $dispatch");
    // Segment 0 is the innermost block: a branch to a block lands at its end, and the
    // segment's code sits right after the end that closes it.
    for (nesting, i) in (0..n).rev().enumerate() {
        emitter.line(3 + nesting, &format!("block $seg{}", i));
    }
    let table: Vec<String> = (0..n).map(|i| format!("$seg{}", i)).collect();
    emitter.line(3 + n, "local.get $pc");
    emitter.line(3 + n, &format!("br_table {}", table.join(" ")));
    // Close the innermost block, then interleave segment code and closers.
    for i in 0..n {
        let depth = 3 + n - 1 - i;
        emitter.line(depth, "end");
        let start = segments[i];
        let end = if i + 1 < n {
            segments[i + 1]
        } else {
            func.layout.len()
        };
        for pos in start..end {
            emitter.emit_inst(depth, func.layout[pos])?;
        }
    }
    emitter.line(3, "br $exit");
    emitter.line(3, "end ;; dispatch");
    emitter.line(2, "end ;; exit");
    if func.signature.ret.is_some() {
        emitter.line(2, "local.get $retval");
    }
    emitter.line(1, ")");
    Ok(())
}
