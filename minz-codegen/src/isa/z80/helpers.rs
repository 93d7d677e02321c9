//! Runtime helper routines for operations the Z80 has no native instruction for.
//!
//! The emitter requests helpers by name as it lowers `Mul`, `Div`, `Mod` and variable-count
//! shifts; each requested routine is appended once, after the module's functions. All helpers
//! preserve BC and take their operands in the staging registers the emitter already uses:
//! `A`/`L` for 8-bit operations, `HL`/`DE` (count in `A`) for 16-bit ones.

use crate::asm::AsmBuilder;
use crate::result::CodegenResult;

/// Names of every helper, in emission order.
pub const ALL_HELPERS: [&str; 10] = [
    "__mul8", "__div8", "__mod8", "__shl8", "__shr8", "__mul16", "__div16", "__mod16",
    "__shl16", "__shr16",
];

/// Append the body of the named helper to `asm`.
pub fn emit_helper(asm: &mut AsmBuilder, name: &str) -> CodegenResult<()> {
    match name {
        "__mul8" => mul8(asm),
        "__div8" => div8(asm),
        "__mod8" => mod8(asm),
        "__shl8" => shl8(asm),
        "__shr8" => shr8(asm),
        "__mul16" => mul16(asm),
        "__div16" => div16(asm),
        "__mod16" => mod16(asm),
        "__shl16" => shl16(asm),
        "__shr16" => shr16(asm),
        _ => unreachable!("unknown helper {}", name),
    }
}

/// A = A * L, wrapping.
fn mul8(asm: &mut AsmBuilder) -> CodegenResult<()> {
    asm.emit_label("__mul8")?;
    asm.emit("PUSH BC");
    asm.emit("LD C, A");
    asm.emit("XOR A");
    asm.emit("LD B, 8");
    asm.emit_label("__mul8_loop")?;
    asm.emit("SRL L");
    asm.emit("JR NC, __mul8_skip");
    asm.emit("ADD A, C");
    asm.emit_label("__mul8_skip")?;
    asm.emit("SLA C");
    asm.emit("DJNZ __mul8_loop");
    asm.emit("POP BC");
    asm.emit("RET");
    Ok(())
}

// Restoring division; quotient collects in L, remainder in H.
fn div8_core(asm: &mut AsmBuilder, entry: &str) -> CodegenResult<()> {
    asm.emit_label(entry)?;
    asm.emit("PUSH BC");
    asm.emit("LD C, L");
    asm.emit("LD L, A");
    asm.emit("LD H, 0");
    asm.emit("LD B, 8");
    asm.emit_label(&format!("{}_loop", entry))?;
    asm.emit("SLA L");
    asm.emit("RL H");
    asm.emit("LD A, H");
    asm.emit("SUB C");
    asm.emit(format!("JR C, {}_skip", entry));
    asm.emit("LD H, A");
    asm.emit("INC L");
    asm.emit_label(&format!("{}_skip", entry))?;
    asm.emit(format!("DJNZ {}_loop", entry));
    Ok(())
}

/// A = A / L, unsigned.
fn div8(asm: &mut AsmBuilder) -> CodegenResult<()> {
    div8_core(asm, "__div8")?;
    asm.emit("LD A, L");
    asm.emit("POP BC");
    asm.emit("RET");
    Ok(())
}

/// A = A % L, unsigned.
fn mod8(asm: &mut AsmBuilder) -> CodegenResult<()> {
    div8_core(asm, "__mod8")?;
    asm.emit("LD A, H");
    asm.emit("POP BC");
    asm.emit("RET");
    Ok(())
}

/// A = A << L.
fn shl8(asm: &mut AsmBuilder) -> CodegenResult<()> {
    asm.emit_label("__shl8")?;
    asm.emit("PUSH BC");
    asm.emit("LD B, L");
    asm.emit("INC B");
    asm.emit("DEC B");
    asm.emit("JR Z, __shl8_done");
    asm.emit_label("__shl8_loop")?;
    asm.emit("ADD A, A");
    asm.emit("DJNZ __shl8_loop");
    asm.emit_label("__shl8_done")?;
    asm.emit("POP BC");
    asm.emit("RET");
    Ok(())
}

/// A = A >> L, logical.
fn shr8(asm: &mut AsmBuilder) -> CodegenResult<()> {
    asm.emit_label("__shr8")?;
    asm.emit("PUSH BC");
    asm.emit("LD B, L");
    asm.emit("INC B");
    asm.emit("DEC B");
    asm.emit("JR Z, __shr8_done");
    asm.emit_label("__shr8_loop")?;
    asm.emit("SRL A");
    asm.emit("DJNZ __shr8_loop");
    asm.emit_label("__shr8_done")?;
    asm.emit("POP BC");
    asm.emit("RET");
    Ok(())
}

/// HL = HL * DE, wrapping.
fn mul16(asm: &mut AsmBuilder) -> CodegenResult<()> {
    asm.emit_label("__mul16")?;
    asm.emit("PUSH BC");
    asm.emit("LD B, H");
    asm.emit("LD C, L");
    asm.emit("LD HL, 0");
    asm.emit("LD A, 16");
    asm.emit_label("__mul16_loop")?;
    asm.emit("ADD HL, HL");
    asm.emit("SLA E");
    asm.emit("RL D");
    asm.emit("JR NC, __mul16_skip");
    asm.emit("ADD HL, BC");
    asm.emit_label("__mul16_skip")?;
    asm.emit("DEC A");
    asm.emit("JR NZ, __mul16_loop");
    asm.emit("POP BC");
    asm.emit("RET");
    Ok(())
}

// 16-bit restoring division; quotient in BC, remainder in HL.
fn div16_core(asm: &mut AsmBuilder, entry: &str) -> CodegenResult<()> {
    asm.emit_label(entry)?;
    asm.emit("PUSH BC");
    asm.emit("LD B, H");
    asm.emit("LD C, L");
    asm.emit("LD HL, 0");
    asm.emit("LD A, 16");
    asm.emit_label(&format!("{}_loop", entry))?;
    asm.emit("SLA C");
    asm.emit("RL B");
    asm.emit("ADC HL, HL");
    asm.emit("OR A");
    asm.emit("SBC HL, DE");
    asm.emit(format!("JR NC, {}_keep", entry));
    asm.emit("ADD HL, DE");
    asm.emit(format!("JR {}_next", entry));
    asm.emit_label(&format!("{}_keep", entry))?;
    asm.emit("INC C");
    asm.emit_label(&format!("{}_next", entry))?;
    asm.emit("DEC A");
    asm.emit(format!("JR NZ, {}_loop", entry));
    Ok(())
}

/// HL = HL / DE, unsigned.
fn div16(asm: &mut AsmBuilder) -> CodegenResult<()> {
    div16_core(asm, "__div16")?;
    asm.emit("LD H, B");
    asm.emit("LD L, C");
    asm.emit("POP BC");
    asm.emit("RET");
    Ok(())
}

/// HL = HL % DE, unsigned.
fn mod16(asm: &mut AsmBuilder) -> CodegenResult<()> {
    div16_core(asm, "__mod16")?;
    asm.emit("POP BC");
    asm.emit("RET");
    Ok(())
}

/// HL = HL << A.
fn shl16(asm: &mut AsmBuilder) -> CodegenResult<()> {
    asm.emit_label("__shl16")?;
    asm.emit("PUSH BC");
    asm.emit("LD B, A");
    asm.emit("INC B");
    asm.emit("DEC B");
    asm.emit("JR Z, __shl16_done");
    asm.emit_label("__shl16_loop")?;
    asm.emit("ADD HL, HL");
    asm.emit("DJNZ __shl16_loop");
    asm.emit_label("__shl16_done")?;
    asm.emit("POP BC");
    asm.emit("RET");
    Ok(())
}

/// HL = HL >> A, logical.
fn shr16(asm: &mut AsmBuilder) -> CodegenResult<()> {
    asm.emit_label("__shr16")?;
    asm.emit("PUSH BC");
    asm.emit("LD B, A");
    asm.emit("INC B");
    asm.emit("DEC B");
    asm.emit("JR Z, __shr16_done");
    asm.emit_label("__shr16_loop")?;
    asm.emit("SRL H");
    asm.emit("RR L");
    asm.emit("DJNZ __shr16_loop");
    asm.emit_label("__shr16_done")?;
    asm.emit("POP BC");
    asm.emit("RET");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helpers_emit_and_return() {
        for name in ALL_HELPERS {
            let mut asm = AsmBuilder::new();
            emit_helper(&mut asm, name).unwrap();
            let lines = asm.into_lines();
            assert_eq!(lines[0], format!("{}:", name));
            assert_eq!(lines.last().unwrap(), "    RET");
            // Every helper preserves BC.
            assert!(lines.iter().any(|l| l.trim() == "PUSH BC"));
            assert!(lines.iter().any(|l| l.trim() == "POP BC"));
        }
    }
}
