//! End-to-end scenarios through the public API: build MIR, run the whole pipeline, inspect
//! the emitted Z80 text.

use minz_codegen::callconv::CallConv;
use minz_codegen::mir::{
    AbiParam, CondCode, DataPayload, FuncName, FunctionBuilder, Module, Opcode, Signature, Type,
};
use minz_codegen::settings::{Flags, OptLevel};
use minz_codegen::{isa, Context};
use pretty_assertions::assert_eq;

fn compile(module: Module, flags: Flags) -> (String, Context) {
    let mut ctx = Context::new(module, flags);
    let isa = isa::lookup("z80").unwrap();
    let text = ctx.compile(&*isa).unwrap();
    (text, ctx)
}

fn count(text: &str, needle: &str) -> usize {
    text.matches(needle).count()
}

/// Words dropped from the stack after a call: explicit pops plus `INC SP` pairs (the peephole
/// rewrites a pop of a dead register into the latter).
fn words_dropped(text: &str) -> usize {
    count(text, "POP HL") + count(text, "INC SP") / 2
}

fn leaf_add_module() -> Module {
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
    module
}

/// A register-convention leaf takes its bytes in A and E and adds them in place.
#[test]
fn register_abi_leaf_function() {
    let flags = Flags::builder().inline_budget(0).build();
    let (text, ctx) = compile(leaf_add_module(), flags);

    let id = ctx.module.find_function("add").unwrap();
    assert_eq!(ctx.module.funcs[id].signature.conv, Some(CallConv::Register));
    assert!(text.contains("ADD A, E"), "{}", text);
    assert!(text.contains("CALL math.add"), "{}", text);
    assert!(text.contains("HALT"), "{}", text);
}

fn factorial_module() -> Module {
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
    let wide_n = b.load_var("n", Type::U16).unwrap();
    let acc = b.load_var("acc", Type::U16).unwrap();
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
    module
}

/// Recursive factorial lands on the TSMC convention, exposes its anchors, and every call
/// site patches them before transferring control.
#[test]
fn tsmc_recursive_factorial() {
    let (text, ctx) = compile(factorial_module(), Flags::default());

    let id = ctx.module.find_function("factorial").unwrap();
    let func = &ctx.module.funcs[id];
    assert_eq!(func.signature.conv, Some(CallConv::Tsmc));
    assert_eq!(func.smc_anchors.get("n").map(String::as_str), Some("n$imm0"));
    assert_eq!(
        func.smc_anchors.get("acc").map(String::as_str),
        Some("acc$imm0")
    );

    assert!(text.contains("n$immOP:"), "{}", text);
    assert!(text.contains("n$imm0 EQU n$immOP + 1"), "{}", text);
    assert!(text.contains("acc$immOP:"), "{}", text);
    assert!(text.contains("acc$imm0 EQU acc$immOP + 1"), "{}", text);
    assert!(text.contains("LD (n$imm0), A"), "{}", text);
    assert!(text.contains("LD (acc$imm0), HL"), "{}", text);
}

/// Without SMC support on the target, the same shape downgrades and still compiles.
#[test]
fn tsmc_downgrades_without_target_support() {
    let mut module = Module::new("m");
    let mut sig = Signature::new();
    sig.params.push(AbiParam::new("n", Type::U8));
    sig.ret = Some(Type::U8);
    let mut b = FunctionBuilder::new(FuncName::new("m", "countdown"), sig);
    let done = b.create_label("done");
    let n = b.load_var("n", Type::U8).unwrap();
    let zero = b.load_const(0, Type::U8);
    b.br_cmp(CondCode::Eq, n, zero, done).unwrap();
    let one = b.load_const(1, Type::U8);
    let n1 = b.binary(Opcode::Sub, n, one).unwrap();
    let r = b.call("countdown", &[n1], Some(Type::U8)).unwrap().unwrap();
    b.ret(Some(r));
    b.place_label(done).unwrap();
    b.ret(Some(n));
    module.add_function(b.finish().unwrap());

    let mut ctx = Context::new(module, Flags::default());
    let isa = isa::lookup("8080").unwrap();
    ctx.compile(&*isa).unwrap();
    let id = ctx.module.find_function("countdown").unwrap();
    assert!(ctx.module.funcs[id].is_recursive());
    assert_ne!(ctx.module.funcs[id].signature.conv, Some(CallConv::Tsmc));
}

/// A self tail-call compiles to patch-and-jump; no `CALL` back into the function remains.
#[test]
fn tail_call_becomes_loop() {
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

    let (text, ctx) = compile(module, Flags::default());
    assert!(!text.contains("CALL m.sum_tail"), "{}", text);
    assert!(text.contains("JP sum_tail$entry"), "{}", text);

    // The rewrite also fired on record.
    assert!(ctx.diagnostics.by_pass("tailcall").count() >= 1);
}

/// A callee too wide for the register budget takes an IX frame; its call site pushes one word
/// per argument and drops exactly that many afterwards, so SP ends where it started.
#[test]
fn stack_frame_call_balances_the_stack() {
    let mut module = Module::new("m");
    let mut sig = Signature::new();
    for name in ["a", "b", "c", "d"] {
        sig.params.push(AbiParam::new(name, Type::U8));
    }
    sig.ret = Some(Type::U8);
    let mut b = FunctionBuilder::new(FuncName::new("m", "pick"), sig);
    b.set_no_inline(true);
    let a = b.load_var("a", Type::U8).unwrap();
    b.ret(Some(a));
    module.add_function(b.finish().unwrap());

    let mut sig = Signature::new();
    sig.ret = Some(Type::U8);
    let mut b = FunctionBuilder::new(FuncName::new("m", "main"), sig);
    let args: Vec<_> = [10, 20, 30, 40]
        .iter()
        .map(|&n| b.load_const(n, Type::U8))
        .collect();
    let r = b.call("pick", &args, Some(Type::U8)).unwrap().unwrap();
    b.ret(Some(r));
    module.add_function(b.finish().unwrap());

    let (text, ctx) = compile(module, Flags::default());
    let id = ctx.module.find_function("pick").unwrap();
    assert_eq!(
        ctx.module.funcs[id].signature.conv,
        Some(CallConv::StackFrame)
    );
    // Frame discipline in the callee.
    assert!(text.contains("PUSH IX"), "{}", text);
    assert!(text.contains("ADD IX, SP"), "{}", text);
    assert!(text.contains("(IX+4)"), "{}", text);
    assert!(text.contains("LD SP, IX"), "{}", text);
    assert!(text.contains("POP IX"), "{}", text);
    // Stack balance at the call site.
    assert_eq!(count(&text, "PUSH HL"), 4, "{}", text);
    assert_eq!(words_dropped(&text), 4, "{}", text);
}

/// An extern with more parameters than the register budget never passes through convention
/// selection; the call site still routes it through the stack frame and stays balanced.
#[test]
fn wide_extern_call_balances_the_stack() {
    let mut module = Module::new("m");
    let mut sig = Signature::new();
    for name in ["a", "b", "c", "d"] {
        sig.params.push(AbiParam::new(name, Type::U8));
    }
    sig.ret = Some(Type::U8);
    let mut b = FunctionBuilder::new(FuncName::new("m", "rom_put"), sig);
    b.set_extern(true);
    module.add_function(b.finish().unwrap());

    let mut sig = Signature::new();
    sig.ret = Some(Type::U8);
    let mut b = FunctionBuilder::new(FuncName::new("m", "main"), sig);
    let args: Vec<_> = [1, 2, 3, 4]
        .iter()
        .map(|&n| b.load_const(n, Type::U8))
        .collect();
    let r = b.call("rom_put", &args, Some(Type::U8)).unwrap().unwrap();
    b.ret(Some(r));
    module.add_function(b.finish().unwrap());

    let (text, ctx) = compile(module, Flags::default());
    // Selection skipped the extern; its convention is still unassigned.
    let id = ctx.module.find_function("rom_put").unwrap();
    assert_eq!(ctx.module.funcs[id].signature.conv, None);
    assert!(text.contains("CALL m.rom_put"), "{}", text);
    // Four words pushed, four dropped: no leak per call.
    assert_eq!(count(&text, "PUSH HL"), 4, "{}", text);
    assert_eq!(words_dropped(&text), 4, "{}", text);
}

/// Three locals, three distinct addresses.
#[test]
fn unique_local_addresses() {
    let mut module = Module::new("m");
    let mut sig = Signature::new();
    sig.ret = Some(Type::U8);
    let mut b = FunctionBuilder::new(FuncName::new("m", "three"), sig);
    for (name, value) in [("a", 10), ("b", 20), ("c", 30)] {
        b.declare_local(name, Type::U8).unwrap();
        let v = b.load_const(value, Type::U8);
        b.store_var(name, v).unwrap();
    }
    let a = b.load_var("a", Type::U8).unwrap();
    let bb = b.load_var("b", Type::U8).unwrap();
    let cc = b.load_var("c", Type::U8).unwrap();
    let ab = b.binary(Opcode::Add, a, bb).unwrap();
    let abc = b.binary(Opcode::Add, ab, cc).unwrap();
    b.ret(Some(abc));
    module.add_function(b.finish().unwrap());

    let flags = Flags::builder().opt_level(OptLevel::None).build();
    let (text, _) = compile(module, flags);
    for addr in ["$F000", "$F001", "$F002"] {
        assert!(text.contains(addr), "missing {}:\n{}", addr, text);
    }
}

/// `LD DE, 1; ADD HL, DE` collapses to `INC HL` in the emitted text.
#[test]
fn peephole_small_offset_collapse() {
    let mut module = Module::new("m");
    let strct = module.types.declare(minz_codegen::mir::TypeData::Struct {
        name: "Pair".to_string(),
        fields: vec![
            minz_codegen::mir::Field {
                name: "first".to_string(),
                ty: Type::U8,
            },
            minz_codegen::mir::Field {
                name: "second".to_string(),
                ty: Type::U8,
            },
        ],
    });
    module.add_data("cell", DataPayload::Bytes(vec![0, 0]));

    let mut sig = Signature::new();
    sig.params.push(AbiParam::new("value", Type::U8));
    let mut b = FunctionBuilder::new(FuncName::new("m", "poke"), sig);
    let base = b.load_addr("cell").unwrap();
    let v = b.load_var("value", Type::U8).unwrap();
    b.store_field(base, strct, "second", v).unwrap();
    b.ret(None);
    module.add_function(b.finish().unwrap());

    let (text, _) = compile(module, Flags::default());
    assert!(text.contains("INC HL"), "{}", text);
    assert!(!text.contains("LD DE, 1"), "{}", text);
}

/// Short strings take a byte prefix, long ones a word; neither is NUL-terminated.
#[test]
fn length_prefixed_strings() {
    let mut module = Module::new("m");
    module.add_data("hello", DataPayload::Str(b"Hello".to_vec()));
    module.add_data("long", DataPayload::Str(vec![b'a'; 300]));
    let mut b = FunctionBuilder::new(FuncName::new("m", "nop"), Signature::new());
    b.ret(None);
    module.add_function(b.finish().unwrap());

    let (text, _) = compile(module, Flags::default());
    let hello_at = text.find("hello:").expect("hello label");
    let after = &text[hello_at..];
    assert!(after.contains("DB 5"), "{}", after);
    assert!(after.contains("DB \"Hello\""), "{}", after);
    assert!(text.contains("DW 300"), "{}", text);
}

/// Same module and flags in, byte-identical assembly out.
#[test]
fn deterministic_output() {
    let (text1, _) = compile(factorial_module(), Flags::default());
    let (text2, _) = compile(factorial_module(), Flags::default());
    assert_eq!(text1, text2);
}

/// A second optimization pass over already-optimized MIR changes nothing.
#[test]
fn optimization_is_idempotent() {
    let mut ctx = Context::new(factorial_module(), Flags::default());
    let isa = isa::lookup("z80").unwrap();
    minz_codegen::opt::optimize(&mut ctx.module, &ctx.flags, true, &mut ctx.diagnostics).unwrap();
    let cost_once = minz_codegen::opt::module_cost(&ctx.module);
    minz_codegen::opt::optimize(&mut ctx.module, &ctx.flags, true, &mut ctx.diagnostics).unwrap();
    assert_eq!(minz_codegen::opt::module_cost(&ctx.module), cost_once);
    let _ = isa;
}

/// Every secondary backend consumes the same module.
#[test]
fn all_backends_accept_the_module() {
    for name in isa::BACKEND_NAMES {
        let mut ctx = Context::new(leaf_add_module(), Flags::default());
        let text = ctx.compile_for(name).unwrap();
        assert!(!text.is_empty(), "{} produced nothing", name);
    }
}
