//! The Z80 backend.
//!
//! Lowering order per module: an `ORG` header, a startup stub when the module has a `main`,
//! each function in declaration order, the data section, then any runtime helpers the emitter
//! requested. The whole line vector then goes through the assembly peephole before joining
//! into the final artifact.

pub mod emit;
pub mod helpers;
pub mod peephole;
pub mod registers;

use crate::asm::{join_lines, AsmBuilder};
use crate::callconv::CallConv;
use crate::diagnostic::Diagnostics;
use crate::isa::{Capabilities, TargetIsa};
use crate::mir::{DataPayload, Module};
use crate::result::CodegenResult;
use crate::settings::Flags;
use std::collections::{BTreeMap, BTreeSet};

/// Module-wide table of SMC anchor names.
///
/// An anchor is exported as `name$immOP` / `name$imm0`, with `name` normally just the
/// parameter name. When two TSMC functions share a parameter name, the later ones are
/// disambiguated with their function name, deterministically, so call sites and prologues
/// agree without coordination.
pub struct AnchorTable {
    names: BTreeMap<(String, u8), String>,
}

impl AnchorTable {
    /// Compute anchor names for every TSMC function in the module.
    pub fn compute(module: &Module) -> Self {
        let mut seen: BTreeMap<&str, u32> = BTreeMap::new();
        for (_, func) in module.funcs.iter() {
            if func.signature.conv == Some(CallConv::Tsmc) {
                for param in &func.signature.params {
                    *seen.entry(param.name.as_str()).or_insert(0) += 1;
                }
            }
        }
        let mut names = BTreeMap::new();
        for (_, func) in module.funcs.iter() {
            if func.signature.conv != Some(CallConv::Tsmc) {
                continue;
            }
            for (index, param) in func.signature.params.iter().enumerate() {
                let name = if seen[param.name.as_str()] == 1 {
                    param.name.clone()
                } else {
                    format!("{}_{}", func.name.name, param.name)
                };
                names.insert((func.qualified_name(), index as u8), name);
            }
        }
        Self { names }
    }

    /// The anchor base name for `param` of the function named `qualified`.
    pub fn anchor(&self, qualified: &str, param: u8) -> Option<&str> {
        self.names
            .get(&(qualified.to_string(), param))
            .map(|s| s.as_str())
    }
}

/// The Z80 code generator.
pub struct Z80Backend;

impl TargetIsa for Z80Backend {
    fn name(&self) -> &'static str {
        "z80"
    }

    fn extension(&self) -> &'static str {
        "a80"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_smc: true,
            shadow_registers: true,
            indexed_addressing: true,
            native_16bit: true,
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
        let anchors = AnchorTable::compute(module);
        let mut helpers_used: BTreeSet<&'static str> = BTreeSet::new();
        let mut asm = AsmBuilder::new();

        asm.emit_comment(format!("module {}", module.name));
        asm.emit("ORG $8000");

        if let Some(main) = module.find_function("main") {
            asm.emit(format!("CALL {}", module.funcs[main].qualified_name()));
            asm.emit("HALT");
        }

        for (_, func) in module.funcs.iter() {
            if func.is_extern {
                continue;
            }
            emit::FuncEmitter::new(module, func, flags, base, &anchors, &mut helpers_used, diag)
                .emit(&mut asm)?;
        }

        if module.data.len() > 0 {
            asm.emit_blank();
            asm.emit_comment("data");
            for (_, decl) in module.data.iter() {
                emit_data(&mut asm, &decl.symbol, &decl.payload)?;
            }
        }

        if !helpers_used.is_empty() {
            asm.emit_blank();
            for name in &helpers_used {
                helpers::emit_helper(&mut asm, name)?;
            }
        }

        let mut lines = asm.into_lines();
        peephole::optimize(&mut lines, &module.name, diag);
        Ok(join_lines(&lines))
    }
}

fn emit_data(asm: &mut AsmBuilder, symbol: &str, payload: &DataPayload) -> CodegenResult<()> {
    asm.emit_label(symbol)?;
    match payload {
        DataPayload::Str(bytes) => {
            // Length prefix: one byte, widening to a word past 255. No NUL terminator.
            if bytes.len() > 255 {
                asm.emit(format!("DW {}", bytes.len()));
            } else {
                asm.emit(format!("DB {}", bytes.len()));
            }
            emit_byte_runs(asm, bytes);
        }
        DataPayload::Bytes(bytes) => emit_byte_runs(asm, bytes),
        DataPayload::Words(words) => {
            for chunk in words.chunks(8) {
                let items: Vec<String> = chunk.iter().map(|w| w.to_string()).collect();
                asm.emit(format!("DW {}", items.join(", ")));
            }
        }
    }
    Ok(())
}

/// Emit bytes as `DB` lines, quoting printable runs.
fn emit_byte_runs(asm: &mut AsmBuilder, bytes: &[u8]) {
    for chunk in bytes.chunks(16) {
        let mut items: Vec<String> = Vec::new();
        let mut run = String::new();
        for &b in chunk {
            if (0x20..=0x7E).contains(&b) && b != b'"' {
                run.push(b as char);
            } else {
                if !run.is_empty() {
                    items.push(format!("\"{}\"", run));
                    run.clear();
                }
                items.push(b.to_string());
            }
        }
        if !run.is_empty() {
            items.push(format!("\"{}\"", run));
        }
        if !items.is_empty() {
            asm.emit(format!("DB {}", items.join(", ")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callgraph;
    use crate::mir::{
        AbiParam, CondCode, FuncName, FunctionBuilder, Opcode, Signature, Type,
    };
    use crate::opt;
    use crate::settings::OptLevel;

    fn compile(module: &mut Module, flags: &Flags) -> (String, Diagnostics) {
        let mut diag = Diagnostics::new();
        opt::optimize(module, flags, true, &mut diag).unwrap();
        let text = Z80Backend
            .compile_module(module, flags, &mut diag)
            .unwrap();
        (text, diag)
    }

    /// A leaf with two byte parameters takes them in A and E and adds them in place.
    #[test]
    fn register_convention_leaf_add() {
        let mut module = Module::new("math");
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("a", Type::U8));
        sig.params.push(AbiParam::new("b", Type::U8));
        sig.ret = Some(Type::U8);
        let mut b = FunctionBuilder::new(FuncName::new("math", "add"), sig);
        let a = b.load_var("a", Type::U8).unwrap();
        let v = b.load_var("b", Type::U8).unwrap();
        let sum = b.binary(Opcode::Add, a, v).unwrap();
        b.ret(Some(sum));
        module.add_function(b.finish().unwrap());

        let mut sig = Signature::new();
        sig.ret = Some(Type::U8);
        let mut b = FunctionBuilder::new(FuncName::new("math", "main"), sig);
        let x = b.load_const(10, Type::U8);
        let y = b.load_const(20, Type::U8);
        let r = b.call("add", &[x, y], Some(Type::U8)).unwrap().unwrap();
        b.ret(Some(r));
        module.add_function(b.finish().unwrap());

        // Keep the call observable; the default budget would inline `add` away.
        let flags = Flags::builder().inline_budget(0).build();
        let (text, _) = compile(&mut module, &flags);
        assert!(text.contains("math.add:"), "{}", text);
        assert!(text.contains("ADD A, E"), "{}", text);
        // The argument setup loads the immediates into the parameter registers.
        assert!(text.contains("LD E, 20"), "{}", text);
        assert!(text.contains("LD A, 10"), "{}", text);
        assert!(text.contains("CALL math.add"), "{}", text);
        assert!(text.contains("HALT"), "{}", text);
    }

    /// A recursive function within the TSMC limits exposes patchable anchors, and its call
    /// sites write the anchors before the call or jump.
    #[test]
    fn tsmc_recursion_exposes_anchors() {
        let mut module = Module::new("math");
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("n", Type::U8));
        sig.params.push(AbiParam::new("acc", Type::U16));
        sig.ret = Some(Type::U16);
        let mut b = FunctionBuilder::new(FuncName::new("math", "factorial"), sig);
        let base = b.create_label("base");
        let n = b.load_var("n", Type::U8).unwrap();
        let zero = b.load_const(0, Type::U8);
        b.br_cmp(CondCode::Eq, n, zero, base).unwrap();
        let one = b.load_const(1, Type::U8);
        let n1 = b.binary(Opcode::Sub, n, one).unwrap();
        let acc = b.load_var("acc", Type::U16).unwrap();
        let wide_n = b.load_var("n", Type::U16).unwrap();
        let next = b.binary(Opcode::Mul, wide_n, acc).unwrap();
        let r = b
            .call("factorial", &[n1, next], Some(Type::U16))
            .unwrap()
            .unwrap();
        b.ret(Some(r));
        b.place_label(base).unwrap();
        let out = b.load_var("acc", Type::U16).unwrap();
        b.ret(Some(out));
        module.add_function(b.finish().unwrap());

        let mut sig = Signature::new();
        sig.ret = Some(Type::U16);
        let mut b = FunctionBuilder::new(FuncName::new("math", "main"), sig);
        let five = b.load_const(5, Type::U8);
        let one = b.load_const(1, Type::U16);
        let r = b
            .call("factorial", &[five, one], Some(Type::U16))
            .unwrap()
            .unwrap();
        b.ret(Some(r));
        module.add_function(b.finish().unwrap());

        let (text, _) = compile(&mut module, &Flags::default());
        assert!(text.contains("n$immOP:"), "{}", text);
        assert!(text.contains("n$imm0 EQU n$immOP + 1"), "{}", text);
        assert!(text.contains("acc$immOP:"), "{}", text);
        assert!(text.contains("LD (n$imm0), A"), "{}", text);
        assert!(text.contains("LD (acc$imm0), HL"), "{}", text);
    }

    /// A self tail-call leaves no `CALL` behind, only anchor patches and a jump to the entry.
    #[test]
    fn tail_recursion_compiles_to_a_loop() {
        let mut module = Module::new("m");
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("n", Type::U16));
        sig.params.push(AbiParam::new("acc", Type::U16));
        sig.ret = Some(Type::U16);
        let mut b = FunctionBuilder::new(FuncName::new("m", "sum_tail"), sig);
        let rec = b.create_label("rec");
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
        let r = b
            .call("sum_tail", &[n1, acc1], Some(Type::U16))
            .unwrap()
            .unwrap();
        b.ret(Some(r));
        module.add_function(b.finish().unwrap());

        let (text, _) = compile(&mut module, &Flags::default());
        assert!(
            !text.contains("CALL m.sum_tail"),
            "tail call must be rewritten:\n{}",
            text
        );
        assert!(text.contains("JP sum_tail$entry"), "{}", text);
    }

    /// Three locals land on three distinct addresses.
    #[test]
    fn locals_get_distinct_slots() {
        let mut module = Module::new("m");
        let mut sig = Signature::new();
        sig.ret = Some(Type::U8);
        let mut b = FunctionBuilder::new(FuncName::new("m", "three"), sig);
        b.declare_local("a", Type::U8).unwrap();
        b.declare_local("b", Type::U8).unwrap();
        b.declare_local("c", Type::U8).unwrap();
        let x = b.load_const(10, Type::U8);
        b.store_var("a", x).unwrap();
        let y = b.load_const(20, Type::U8);
        b.store_var("b", y).unwrap();
        let z = b.load_const(30, Type::U8);
        b.store_var("c", z).unwrap();
        let a = b.load_var("a", Type::U8).unwrap();
        let bb = b.load_var("b", Type::U8).unwrap();
        let cc = b.load_var("c", Type::U8).unwrap();
        let ab = b.binary(Opcode::Add, a, bb).unwrap();
        let abc = b.binary(Opcode::Add, ab, cc).unwrap();
        b.ret(Some(abc));
        module.add_function(b.finish().unwrap());

        let flags = Flags::builder().opt_level(OptLevel::None).build();
        let (text, _) = compile(&mut module, &flags);
        assert!(text.contains("LD ($F000), A"), "{}", text);
        assert!(text.contains("LD ($F001), A"), "{}", text);
        assert!(text.contains("LD ($F002), A"), "{}", text);
    }

    /// Field access at small offsets collapses to `INC HL`.
    #[test]
    fn small_field_offset_collapses() {
        let mut module = Module::new("m");
        let strct = module.types.declare(crate::mir::TypeData::Struct {
            name: "Pair".to_string(),
            fields: vec![
                crate::mir::Field {
                    name: "first".to_string(),
                    ty: Type::U8,
                },
                crate::mir::Field {
                    name: "second".to_string(),
                    ty: Type::U8,
                },
            ],
        });
        module.add_data("pair_cell", DataPayload::Bytes(vec![0, 0]));

        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("value", Type::U8));
        let mut b = FunctionBuilder::new(FuncName::new("m", "poke"), sig);
        let base = b.load_addr("pair_cell").unwrap();
        let v = b.load_var("value", Type::U8).unwrap();
        b.store_field(base, strct, "second", v).unwrap();
        b.ret(None);
        module.add_function(b.finish().unwrap());

        let (text, diag) = compile(&mut module, &Flags::default());
        assert!(text.contains("INC HL"), "{}", text);
        assert!(!text.contains("LD DE, 1"), "{}", text);
        assert!(diag.by_pass("z80-peephole").count() >= 1);
    }

    /// String data is length-prefixed with no terminator; long strings take a word prefix.
    #[test]
    fn strings_are_length_prefixed() {
        let mut module = Module::new("m");
        module.add_data("greeting", DataPayload::Str(b"Hello".to_vec()));
        module.add_data("novel", DataPayload::Str(vec![b'x'; 300]));
        let mut b = FunctionBuilder::new(FuncName::new("m", "nop"), Signature::new());
        b.ret(None);
        module.add_function(b.finish().unwrap());

        let (text, _) = compile(&mut module, &Flags::default());
        assert!(text.contains("greeting:"), "{}", text);
        assert!(text.contains("DB 5"), "{}", text);
        assert!(text.contains("DB \"Hello\""), "{}", text);
        assert!(!text.contains("DB \"Hello\", 0"), "{}", text);
        assert!(text.contains("DW 300"), "{}", text);
    }

    /// Same module, same flags: byte-identical output.
    #[test]
    fn output_is_deterministic() {
        let build = || {
            let mut module = Module::new("m");
            let mut sig = Signature::new();
            sig.params.push(AbiParam::new("n", Type::U8));
            sig.ret = Some(Type::U8);
            let mut b = FunctionBuilder::new(FuncName::new("m", "f"), sig);
            let n = b.load_var("n", Type::U8).unwrap();
            let two = b.load_const(2, Type::U8);
            let d = b.binary(Opcode::Mul, n, two).unwrap();
            b.ret(Some(d));
            module.add_function(b.finish().unwrap());
            module
        };
        let (text1, _) = compile(&mut build(), &Flags::default());
        let (text2, _) = compile(&mut build(), &Flags::default());
        assert_eq!(text1, text2);
    }

    /// Recursion facts feed convention selection end to end.
    #[test]
    fn recursion_analysis_feeds_selection() {
        let mut module = Module::new("m");
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("n", Type::U8));
        sig.ret = Some(Type::U8);
        let mut b = FunctionBuilder::new(FuncName::new("m", "countdown"), sig);
        let n = b.load_var("n", Type::U8).unwrap();
        let r = b.call("countdown", &[n], Some(Type::U8)).unwrap().unwrap();
        b.ret(Some(r));
        module.add_function(b.finish().unwrap());

        let mut diag = Diagnostics::new();
        let graph = callgraph::analyze_recursion(&mut module, &mut diag);
        let id = module.find_function("countdown").unwrap();
        assert!(module.funcs[id].is_recursive());
        assert_eq!(graph.shortest_cycle(id), Some(1));
    }
}
