//! Driving the code generator from the textual MIR form, the way the CLI does.

use minz_codegen::settings::Flags;
use minz_codegen::{isa, write_module, Context};
use minz_reader::parse_module;

const FACTORIAL: &str = "\
module math

fn math.factorial(n: u8, acc: u16) -> u16 {
    recursive
    v0 = ldvar.u8 n
    v1 = ldc.u8 0
    jcc eq v0, v1, base
    v2 = ldc.u8 1
    v3 = sub.u8 v0, v2
    v4 = ldvar.u16 n
    v5 = ldvar.u16 acc
    v6 = mul.u16 v4, v5
    v7 = call math.factorial(v3, v6)
    ret v7
base:
    v8 = ldvar.u16 acc
    ret v8
}

fn math.main() -> u16 {
    v0 = ldc.u8 5
    v1 = ldc.u16 1
    v2 = call math.factorial(v0, v1)
    ret v2
}
";

#[test]
fn textual_factorial_compiles_with_anchors() {
    let module = parse_module(FACTORIAL).unwrap();
    let mut ctx = Context::new(module, Flags::default());
    let isa = isa::lookup("z80").unwrap();
    let text = ctx.compile(&*isa).unwrap();

    assert!(text.contains("math.factorial:"), "{}", text);
    assert!(text.contains("n$imm0 EQU n$immOP + 1"), "{}", text);
    assert!(text.contains("acc$imm0 EQU acc$immOP + 1"), "{}", text);
    assert!(text.contains("CALL math.factorial"), "{}", text);
}

#[test]
fn parse_then_print_is_stable() {
    let module = parse_module(FACTORIAL).unwrap();
    let printed = write_module(&module);
    // The printed form parses back to the same text.
    let reparsed = parse_module(&printed).unwrap();
    assert_eq!(write_module(&reparsed), printed);
}

#[test]
fn verifier_runs_on_parsed_modules() {
    let module = parse_module(FACTORIAL).unwrap();
    minz_codegen::verify_module(&module, &Flags::default()).unwrap();
}

#[test]
fn every_backend_consumes_parsed_mir() {
    for name in isa::BACKEND_NAMES {
        // Multiplication needs a helper some secondary backends do not carry.
        let source = "\
module m

fn m.main() -> u8 {
    v0 = ldc.u8 40
    v1 = ldc.u8 2
    v2 = add.u8 v0, v1
    ret v2
}
";
        let module = parse_module(source).unwrap();
        let mut ctx = Context::new(module, Flags::default());
        let text = ctx.compile_for(name).unwrap();
        assert!(!text.is_empty(), "{} produced nothing", name);
    }
}

#[test]
fn missing_module_header_is_an_error() {
    let err = parse_module("fn m.f() {\n}\n").unwrap_err();
    assert!(err.to_string().contains("module"));
}
