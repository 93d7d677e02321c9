//! A builder for assembly text.
//!
//! Every emitted line passes through here: labels at column 0, instructions indented, `EQU`
//! equates flush left. The builder checks label uniqueness on the way through, which is what
//! keeps SMC anchor exports from colliding across a module, and it pairs with the peephole
//! pass by handing the raw line vector over for rewriting before the final join.

use crate::result::{CodegenError, CodegenResult, InvariantCode};
use std::collections::HashSet;

/// Accumulates the assembly output of one module.
pub struct AsmBuilder {
    lines: Vec<String>,
    labels: HashSet<String>,
}

impl AsmBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self {
            lines: Vec::new(),
            labels: HashSet::new(),
        }
    }

    /// Emit one indented instruction.
    pub fn emit(&mut self, text: impl Into<String>) {
        self.lines.push(format!("    {}", text.into()));
    }

    /// Emit a label at column 0. Labels must be unique within the module.
    pub fn emit_label(&mut self, name: impl Into<String>) -> CodegenResult<()> {
        let name = name.into();
        if !self.labels.insert(name.clone()) {
            return Err(CodegenError::invariant(
                InvariantCode::DuplicateLabel,
                format!("assembly label {}", name),
            ));
        }
        self.lines.push(format!("{}:", name));
        Ok(())
    }

    /// Emit an `EQU` equate at column 0.
    pub fn emit_equ(&mut self, name: impl Into<String>, expr: impl Into<String>) {
        self.lines.push(format!("{} EQU {}", name.into(), expr.into()));
    }

    /// Emit a comment line.
    pub fn emit_comment(&mut self, text: impl Into<String>) {
        self.lines.push(format!("; {}", text.into()));
    }

    /// Emit a blank separator line.
    pub fn emit_blank(&mut self) {
        self.lines.push(String::new());
    }

    /// Emit an SMC anchor: the labeled immediate-bearing instruction plus the operand equate.
    ///
    /// `imm_offset` is the byte offset of the immediate within the instruction encoding.
    pub fn emit_anchor(
        &mut self,
        name: &str,
        instruction: &str,
        imm_offset: u8,
    ) -> CodegenResult<()> {
        self.emit_label(format!("{}$immOP", name))?;
        self.emit(instruction);
        self.emit_equ(
            format!("{}$imm0", name),
            format!("{}$immOP + {}", name, imm_offset),
        );
        Ok(())
    }

    /// Number of lines so far.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Is the builder empty?
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Hand the raw lines over, for the peephole pass.
    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

/// Join rewritten lines back into the final text artifact.
pub fn join_lines(lines: &[String]) -> String {
    let mut text = lines.join("\n");
    text.push('\n');
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_of_emitted_lines() {
        let mut asm = AsmBuilder::new();
        asm.emit_label("main.start").unwrap();
        asm.emit("LD A, 1");
        asm.emit_equ("limit", "42");
        let lines = asm.into_lines();
        assert_eq!(lines[0], "main.start:");
        assert_eq!(lines[1], "    LD A, 1");
        assert_eq!(lines[2], "limit EQU 42");
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let mut asm = AsmBuilder::new();
        asm.emit_label("twice").unwrap();
        assert!(matches!(
            asm.emit_label("twice"),
            Err(CodegenError::Invariant {
                code: InvariantCode::DuplicateLabel,
                ..
            })
        ));
    }

    #[test]
    fn anchors_pair_the_op_and_operand_labels() {
        let mut asm = AsmBuilder::new();
        asm.emit_anchor("n", "LD A, 0", 1).unwrap();
        let lines = asm.into_lines();
        assert_eq!(lines[0], "n$immOP:");
        assert_eq!(lines[1], "    LD A, 0");
        assert_eq!(lines[2], "n$imm0 EQU n$immOP + 1");
    }
}
