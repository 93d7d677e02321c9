//! Pattern rewrites over emitted Z80 assembly.
//!
//! The pass runs over the raw line vector produced by the emitter and applies the rewrites
//! iteratively until nothing changes. Every rewrite must hold three things: it may not cross a
//! label, call, or other control boundary; it may not change a register another instruction
//! still reads; and it may not disturb flags an instruction downstream depends on before the
//! next flag writer. When any of those cannot be shown from the surrounding text, the pattern
//! simply does not fire.
//!
//! A small register-value tracker runs over straight-line stretches to kill loads of values a
//! register is already known to hold. It is invalidated at labels, calls, stores through
//! unknown pointers, and SMC patches.

use crate::diagnostic::{Diagnostics, OptRecord};
use std::collections::BTreeMap;

/// Rewrite `lines` in place until no pattern fires.
pub fn optimize(lines: &mut Vec<String>, function: &str, diag: &mut Diagnostics) {
    let mut fired = 0u32;
    loop {
        let before = fired;
        fired += small_offset_collapse(lines, diag, function);
        fired += pair_rewrites(lines, diag, function);
        fired += branch_inversion(lines, diag, function);
        fired += single_rewrites(lines, diag, function);
        fired += redundant_loads(lines, diag, function);
        fired += dead_copies(lines, diag, function);
        if fired == before {
            break;
        }
    }
}

/// The instruction text of a line, if it is an instruction.
fn instr(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(';') {
        return None;
    }
    if !line.starts_with(' ') {
        // Labels and EQU lines sit at column 0.
        return None;
    }
    Some(trimmed)
}

/// Is this line a control boundary for pattern matching?
fn is_boundary(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.ends_with(':') && !line.starts_with(' ') {
        return true;
    }
    match instr(line) {
        Some(text) => {
            text.starts_with("CALL")
                || text.starts_with("JP")
                || text.starts_with("JR")
                || text.starts_with("DJNZ")
                || text.starts_with("RET")
                || text.starts_with("HALT")
        }
        None => !trimmed.is_empty() && !trimmed.starts_with(';'),
    }
}

/// Index of the next instruction line at or after `from`, stopping at boundaries.
fn next_instr(lines: &[String], from: usize) -> Option<usize> {
    let mut i = from;
    while i < lines.len() {
        if instr(&lines[i]).is_some() {
            return Some(i);
        }
        if is_boundary(&lines[i]) {
            return None;
        }
        i += 1;
    }
    None
}

/// Does `text` read any register named in `regs` (single letters or pairs)?
fn reads_reg(text: &str, regs: &[&str]) -> bool {
    let (mnemonic, operands) = split_instr(text);
    let mentions = |name: &str| operand_mentions(operands, name);
    match mnemonic {
        // The destination of a plain load is written, not read.
        "LD" => {
            let mut parts = operands.splitn(2, ',');
            let dst = parts.next().unwrap_or("").trim();
            let src = parts.next().unwrap_or("").trim();
            regs.iter().any(|r| {
                piece_mentions(src, r) || (dst.starts_with('(') && piece_mentions(dst, r))
            })
        }
        "POP" => false,
        _ => regs.iter().any(|r| mentions(r)),
    }
}

/// Does `text` overwrite every register in `regs`?
fn writes_all(text: &str, regs: &[&str]) -> bool {
    regs.iter().all(|r| writes_reg(text, r))
}

fn writes_reg(text: &str, reg: &str) -> bool {
    let (mnemonic, operands) = split_instr(text);
    match mnemonic {
        "LD" => {
            let dst = operands.splitn(2, ',').next().unwrap_or("").trim();
            covers(dst, reg)
        }
        "POP" => covers(operands.trim(), reg),
        "INC" | "DEC" => covers(operands.trim(), reg),
        "XOR" | "OR" | "AND" | "ADD" | "SUB" | "SBC" | "ADC" | "CPL" | "NEG" | "RLA" | "RRA"
        | "DAA" => {
            // These write A (and ADD HL / ADC HL / SBC HL write HL).
            if operands.trim_start().starts_with("HL") {
                covers("HL", reg)
            } else {
                covers("A", reg)
            }
        }
        "SLA" | "SRL" | "RL" | "RR" => covers(operands.trim(), reg),
        "EX" => covers("DE", reg) || covers("HL", reg) || covers("AF", reg),
        "EXX" => covers("BC", reg) || covers("DE", reg) || covers("HL", reg),
        _ => false,
    }
}

/// Does register spec `dst` cover `reg` (a pair covers its halves and vice versa)?
fn covers(dst: &str, reg: &str) -> bool {
    if dst == reg {
        return true;
    }
    let halves = |pair: &str| -> &'static [&'static str] {
        match pair {
            "BC" => &["B", "C"],
            "DE" => &["D", "E"],
            "HL" => &["H", "L"],
            "AF" => &["A"],
            _ => &[],
        }
    };
    halves(dst).contains(&reg) || halves(reg).contains(&dst)
}

fn operand_mentions(operands: &str, reg: &str) -> bool {
    operands.split(',').any(|piece| piece_mentions(piece, reg))
}

fn piece_mentions(piece: &str, reg: &str) -> bool {
    let cleaned = piece.trim().trim_start_matches('(').trim_end_matches(')');
    cleaned == reg
        || match reg {
            "BC" => cleaned == "B" || cleaned == "C" || cleaned == "BC",
            "DE" => cleaned == "D" || cleaned == "E" || cleaned == "DE",
            "HL" => cleaned == "H" || cleaned == "L" || cleaned == "HL",
            _ => {
                (reg == "B" || reg == "C") && cleaned == "BC"
                    || (reg == "D" || reg == "E") && cleaned == "DE"
                    || (reg == "H" || reg == "L") && cleaned == "HL"
            }
        }
}

fn split_instr(text: &str) -> (&str, &str) {
    match text.find(' ') {
        Some(pos) => (&text[..pos], text[pos + 1..].trim()),
        None => (text, ""),
    }
}

/// Is `reg` dead from `start` on: overwritten before any read, boundary-conservative?
fn reg_dead_after(lines: &[String], start: usize, reg: &str) -> bool {
    let mut i = start;
    while i < lines.len() {
        let line = &lines[i];
        if let Some(text) = instr(line) {
            if text == "RET" || text == "RETI" {
                // Only the result registers survive a return.
                return reg != "A" && reg != "H" && reg != "L" && reg != "HL";
            }
            if reads_reg(text, &[reg]) {
                return false;
            }
            if writes_all(text, &[reg]) {
                return true;
            }
            if is_boundary(line) {
                return false;
            }
        } else if is_boundary(line) {
            return false;
        }
        i += 1;
    }
    false
}

/// Would changing the flags at `start` be observable before the next flag writer?
fn flags_dead_after(lines: &[String], start: usize) -> bool {
    let mut i = start;
    while i < lines.len() {
        let line = &lines[i];
        if let Some(text) = instr(line) {
            // Flags are dead at an unconditional return; nothing in these conventions passes
            // them across a call boundary.
            if text == "RET" || text == "RETI" || text == "HALT" {
                return true;
            }
            let (mnemonic, operands) = split_instr(text);
            let conditional = matches!(mnemonic, "JP" | "JR" | "RET" | "CALL")
                && operands
                    .split(',')
                    .next()
                    .map_or(false, |c| {
                        matches!(c.trim(), "Z" | "NZ" | "C" | "NC" | "PE" | "PO" | "M" | "P")
                    });
            if conditional || matches!(mnemonic, "ADC" | "SBC" | "RLA" | "RRA" | "RL" | "RR" | "CCF" | "DAA") {
                return false;
            }
            // A full flag writer before any reader makes the change invisible. INC and DEC
            // stay out of this list: they leave carry alone.
            if matches!(
                mnemonic,
                "ADD" | "SUB" | "AND" | "OR" | "XOR" | "CP" | "NEG" | "SLA" | "SRL"
            ) {
                return true;
            }
            if is_boundary(line) {
                return false;
            }
        } else if is_boundary(line) {
            return false;
        }
        i += 1;
    }
    false
}

fn record(diag: &mut Diagnostics, function: &str, before: &str, after: &str, t: i32, b: i32) {
    diag.record(OptRecord {
        pass: "z80-peephole",
        function: function.to_string(),
        site: None,
        rationale: String::new(),
        before: before.to_string(),
        after: after.to_string(),
        saved_tstates: t,
        saved_bytes: b,
    });
}

/// `LD DE, n; ADD HL, DE` with n in 1..=3 becomes `INC HL` repeated, when DE is dead after.
/// At n = 4 the replacement is no shorter but slower, so 3 is the cutoff.
fn small_offset_collapse(lines: &mut Vec<String>, diag: &mut Diagnostics, function: &str) -> u32 {
    let mut i = 0;
    let mut fired = 0;
    while i < lines.len() {
        let n = match instr(&lines[i]).and_then(|t| t.strip_prefix("LD DE, ")) {
            Some(rest) => match rest.parse::<u32>() {
                Ok(n) if (1..=3).contains(&n) => n,
                _ => {
                    i += 1;
                    continue;
                }
            },
            None => {
                i += 1;
                continue;
            }
        };
        let add_at = match next_instr(lines, i + 1) {
            Some(j) if j == i + 1 && instr(&lines[j]) == Some("ADD HL, DE") => j,
            _ => {
                i += 1;
                continue;
            }
        };
        if !reg_dead_after(lines, add_at + 1, "DE") || !flags_dead_after(lines, add_at + 1) {
            i += 1;
            continue;
        }
        let replacement: Vec<String> = (0..n).map(|_| "    INC HL".to_string()).collect();
        lines.splice(i..=add_at, replacement);
        record(diag, function, "LD DE, n + ADD HL, DE", "INC HL", 21 - 6 * n as i32, 4 - n as i32);
        fired += 1;
        i += 1;
    }
    fired
}

/// Adjacent-instruction pair rewrites: double `EX DE, HL`, `NEG; NEG`, `SCF; CCF`, and
/// `POP r` whose register is dead.
fn pair_rewrites(lines: &mut Vec<String>, diag: &mut Diagnostics, function: &str) -> u32 {
    let mut fired = 0;
    let mut i = 0;
    while i < lines.len() {
        let here = match instr(&lines[i]) {
            Some(text) => text.to_string(),
            None => {
                i += 1;
                continue;
            }
        };
        let next = next_instr(lines, i + 1).filter(|&j| j == i + 1);

        if let Some(j) = next {
            let there = instr(&lines[j]).unwrap_or("").to_string();
            if (here == "EX DE, HL" && there == "EX DE, HL")
                || (here == "NEG" && there == "NEG" && flags_dead_after(lines, j + 1))
            {
                lines.drain(i..=j);
                record(diag, function, &here, "", 8, 2);
                fired += 1;
                continue;
            }
            if here == "SCF" && there == "CCF" {
                lines.splice(i..=j, vec!["    OR A".to_string()]);
                record(diag, function, "SCF + CCF", "OR A", 4, 1);
                fired += 1;
                continue;
            }
        }

        if let Some(popped) = here.strip_prefix("POP ") {
            let popped = popped.trim().to_string();
            if popped != "IX" && reg_dead_after(lines, i + 1, &popped) {
                lines.splice(
                    i..=i,
                    vec!["    INC SP".to_string(), "    INC SP".to_string()],
                );
                record(diag, function, "POP of dead register", "INC SP x2", -2, -1);
                fired += 1;
                i += 2;
                continue;
            }
        }
        i += 1;
    }
    fired
}

/// `JP cc, L1; JP L2; L1:` becomes `JP !cc, L2; L1:`.
fn branch_inversion(lines: &mut Vec<String>, diag: &mut Diagnostics, function: &str) -> u32 {
    let mut fired = 0;
    let mut i = 0;
    while i + 2 < lines.len() {
        let (cond, skip_label) = match instr(&lines[i]).map(split_instr) {
            Some(("JP", operands)) => {
                let mut parts = operands.splitn(2, ',');
                let cond = parts.next().unwrap_or("").trim().to_string();
                let label = parts.next().unwrap_or("").trim().to_string();
                if label.is_empty() {
                    i += 1;
                    continue;
                }
                (cond, label)
            }
            _ => {
                i += 1;
                continue;
            }
        };
        let inverse = match cond.as_str() {
            "Z" => "NZ",
            "NZ" => "Z",
            "C" => "NC",
            "NC" => "C",
            _ => {
                i += 1;
                continue;
            }
        };
        let target = match instr(&lines[i + 1]).map(split_instr) {
            Some(("JP", operands)) if !operands.contains(',') => operands.to_string(),
            _ => {
                i += 1;
                continue;
            }
        };
        if lines[i + 2].trim() != format!("{}:", skip_label) {
            i += 1;
            continue;
        }
        lines[i] = format!("    JP {}, {}", inverse, target);
        lines.remove(i + 1);
        record(diag, function, "JP cc over JP", "inverted JP", 10, 3);
        fired += 1;
    }
    fired
}

/// Single-instruction strength rewrites, each guarded by the flag-liveness check it needs.
fn single_rewrites(lines: &mut Vec<String>, diag: &mut Diagnostics, function: &str) -> u32 {
    let mut fired = 0;
    for i in 0..lines.len() {
        let text = match instr(&lines[i]) {
            Some(text) => text.to_string(),
            None => continue,
        };
        let rewrite = match text.as_str() {
            // XOR A is one byte shorter and faster, but it writes the flags.
            "LD A, 0" if flags_dead_after(lines, i + 1) => Some(("XOR A", 3, 1)),
            // INC and DEC leave carry alone where ADD and SUB write it.
            "ADD A, 1" if flags_dead_after(lines, i + 1) => Some(("INC A", 3, 1)),
            "SUB 1" if flags_dead_after(lines, i + 1) => Some(("DEC A", 3, 1)),
            "CP 0" => Some(("OR A", 3, 1)),
            _ => None,
        };
        if let Some((replacement, t, b)) = rewrite {
            record(diag, function, &text, replacement, t, b);
            lines[i] = format!("    {}", replacement);
            fired += 1;
        }
    }
    fired
}

/// What a register is known to hold, for the straight-line tracker.
#[derive(Clone, PartialEq, Eq, Debug)]
enum Known {
    Const(i64),
    /// Same contents as another snapshot; tokens compare equal only within one block.
    Token(u32),
    /// Loaded from a named or absolute memory cell.
    Cell(String),
}

#[derive(Default)]
struct RegState {
    regs: BTreeMap<&'static str, Known>,
    cells: BTreeMap<String, Known>,
    next_token: u32,
}

const TRACKED: [&str; 7] = ["A", "B", "C", "D", "E", "H", "L"];

impl RegState {
    fn reset(&mut self) {
        self.regs.clear();
        self.cells.clear();
    }

    fn fresh(&mut self) -> Known {
        self.next_token += 1;
        Known::Token(self.next_token)
    }

    fn invalidate(&mut self, reg: &str) {
        let value = self.fresh();
        for name in TRACKED {
            if covers(reg, name) {
                self.regs.insert(name, value.clone());
            }
        }
    }

    fn get(&self, reg: &str) -> Option<&Known> {
        self.regs.get(reg)
    }

    fn set(&mut self, reg: &'static str, value: Known) {
        self.regs.insert(reg, value);
    }

    fn reg_name(name: &str) -> Option<&'static str> {
        TRACKED.iter().find(|&&r| r == name).copied()
    }

    /// Apply one instruction. Returns `true` when the load is redundant and can go.
    fn apply(&mut self, text: &str) -> bool {
        let (mnemonic, operands) = split_instr(text);
        match mnemonic {
            "LD" => {
                let mut parts = operands.splitn(2, ',');
                let dst = parts.next().unwrap_or("").trim().to_string();
                let src = parts.next().unwrap_or("").trim().to_string();
                self.apply_ld(&dst, &src)
            }
            "XOR" if operands == "A" => {
                let redundant = self.get("A") == Some(&Known::Const(0));
                self.set("A", Known::Const(0));
                // Even when A already holds zero the flags change, so never remove it.
                let _ = redundant;
                false
            }
            "EXX" => {
                for reg in ["B", "C", "D", "E", "H", "L"] {
                    self.invalidate(reg);
                }
                false
            }
            "EX" if operands == "DE, HL" => {
                let d = self.regs.get("D").cloned();
                let e = self.regs.get("E").cloned();
                let h = self.regs.get("H").cloned();
                let l = self.regs.get("L").cloned();
                for (reg, value) in [("D", h), ("E", l), ("H", d), ("L", e)] {
                    match value {
                        Some(value) => self.regs.insert(reg, value),
                        None => self.regs.remove(reg),
                    };
                }
                false
            }
            "CALL" | "RST" => {
                self.reset();
                false
            }
            _ => {
                // Anything else: clobber whatever it writes.
                for reg in TRACKED {
                    if writes_reg(text, reg) {
                        self.invalidate(reg);
                    }
                }
                false
            }
        }
    }

    fn apply_ld(&mut self, dst: &str, src: &str) -> bool {
        let known_src = if let Ok(imm) = src.parse::<i64>() {
            Some(Known::Const(imm))
        } else if let Some(name) = Self::reg_name(src) {
            self.get(name).cloned().or_else(|| {
                let value = self.fresh();
                self.regs.insert(name, value.clone());
                Some(value)
            })
        } else if src.starts_with('(') && src.ends_with(')') {
            let cell = src[1..src.len() - 1].to_string();
            Some(self.cells.get(&cell).cloned().unwrap_or_else(|| {
                let value = self.fresh();
                self.cells.insert(cell, value.clone());
                value
            }))
        } else {
            None
        };

        if let Some(dst_name) = Self::reg_name(dst) {
            match known_src {
                Some(value) => {
                    if self.get(dst_name) == Some(&value) {
                        return true;
                    }
                    self.set(dst_name, value);
                }
                None => self.invalidate(dst_name),
            }
            return false;
        }

        if dst.starts_with('(') && dst.ends_with(')') {
            let cell = dst[1..dst.len() - 1].to_string();
            if cell == "HL" || cell == "DE" || cell == "BC" {
                // A store through a pointer could hit any tracked cell.
                self.cells.clear();
                return false;
            }
            // An SMC patch target or a plain cell; either way remember what it holds now.
            match Self::reg_name(src) {
                Some(name) => {
                    let value = self.get(name).cloned().unwrap_or_else(|| {
                        let value = self.fresh();
                        self.regs.insert(name, value.clone());
                        value
                    });
                    self.cells.insert(cell, value);
                }
                None => {
                    self.cells.remove(&cell);
                }
            }
            return false;
        }

        // 16-bit forms and everything else.
        for reg in TRACKED {
            if covers(dst, reg) {
                self.invalidate(reg);
            }
        }
        false
    }
}

/// Remove loads of values a register is already known to hold.
fn redundant_loads(lines: &mut Vec<String>, diag: &mut Diagnostics, function: &str) -> u32 {
    let mut fired = 0;
    let mut state = RegState::default();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i].clone();
        match instr(&line) {
            None => {
                state.reset();
                i += 1;
            }
            Some(text) => {
                let boundary = is_boundary(&line);
                if state.apply(text) {
                    record(diag, function, text, "", 4, 1);
                    lines.remove(i);
                    fired += 1;
                    continue;
                }
                if boundary {
                    state.reset();
                }
                i += 1;
            }
        }
    }
    fired
}

/// Remove copies out of A into a register nothing reads.
fn dead_copies(lines: &mut Vec<String>, diag: &mut Diagnostics, function: &str) -> u32 {
    let mut fired = 0;
    let mut i = 0;
    while i < lines.len() {
        let dst = match instr(&lines[i]).map(split_instr) {
            Some(("LD", operands)) => {
                let mut parts = operands.splitn(2, ',');
                let dst = parts.next().unwrap_or("").trim().to_string();
                let src = parts.next().unwrap_or("").trim();
                if src != "A" || !matches!(dst.as_str(), "B" | "C" | "D" | "E" | "H" | "L") {
                    i += 1;
                    continue;
                }
                dst
            }
            _ => {
                i += 1;
                continue;
            }
        };
        if reg_dead_after(lines, i + 1, &dst) {
            record(diag, function, &format!("LD {}, A", dst), "", 4, 1);
            lines.remove(i);
            fired += 1;
            continue;
        }
        i += 1;
    }
    fired
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(input: &[&str]) -> Vec<String> {
        let mut lines: Vec<String> = input.iter().map(|s| s.to_string()).collect();
        let mut diag = Diagnostics::new();
        optimize(&mut lines, "t", &mut diag);
        lines
    }

    #[test]
    fn xor_a_replaces_clear() {
        let lines = run(&["    LD A, 0", "    LD (16384), A", "    RET"]);
        assert_eq!(lines[0], "    XOR A");
    }

    #[test]
    fn clear_is_kept_when_flags_are_live() {
        // The conditional jump consumes the flags from the CP; LD must not disturb them.
        let lines = run(&["    CP 5", "    LD A, 0", "    JP Z, out", "    RET"]);
        assert_eq!(lines[1], "    LD A, 0");
    }

    #[test]
    fn small_offsets_collapse_up_to_three() {
        let lines = run(&["    LD DE, 2", "    ADD HL, DE", "    LD (HL), A", "    RET"]);
        assert_eq!(lines[0], "    INC HL");
        assert_eq!(lines[1], "    INC HL");
        assert_eq!(lines[2], "    LD (HL), A");

        // Four stays as-is.
        let lines = run(&["    LD DE, 4", "    ADD HL, DE", "    LD (HL), A", "    RET"]);
        assert_eq!(lines[0], "    LD DE, 4");
    }

    #[test]
    fn collapse_needs_a_dead_de() {
        let lines = run(&[
            "    LD DE, 1",
            "    ADD HL, DE",
            "    LD A, E",
            "    RET",
        ]);
        assert_eq!(lines[0], "    LD DE, 1");
    }

    #[test]
    fn double_exchange_vanishes() {
        let lines = run(&["    EX DE, HL", "    EX DE, HL", "    RET"]);
        assert_eq!(lines[0], "    RET");
    }

    #[test]
    fn branch_over_jump_inverts() {
        let lines = run(&[
            "    JP Z, skip",
            "    JP target",
            "skip:",
            "    RET",
        ]);
        assert_eq!(lines[0], "    JP NZ, target");
        assert_eq!(lines[1], "skip:");
    }

    #[test]
    fn redundant_reload_is_removed() {
        let lines = run(&["    LD B, A", "    LD A, B", "    ADD A, C", "    LD C, A", "    RET"]);
        // `LD A, B` reloads what A already holds; `LD B, A` then feeds nothing and dies too.
        assert!(lines.iter().all(|l| l.trim() != "LD A, B"));
        assert!(lines.iter().all(|l| l.trim() != "LD B, A"));
    }

    #[test]
    fn tracker_resets_at_labels() {
        let lines = run(&[
            "    LD A, (state)",
            "loop:",
            "    LD A, (state)",
            "    LD (out), A",
            "    RET",
        ]);
        // The second load sits after a label reachable from elsewhere; it must stay.
        assert_eq!(lines[2], "    LD A, (state)");
    }

    #[test]
    fn store_then_reload_is_removed() {
        let lines = run(&[
            "    LD ($F000), A",
            "    LD A, ($F000)",
            "    LD ($F001), A",
            "    RET",
        ]);
        assert!(lines.iter().filter(|l| l.trim() == "LD A, ($F000)").count() == 0);
    }

    #[test]
    fn dead_copy_before_return_is_removed() {
        let lines = run(&["    ADD A, E", "    LD B, A", "    RET"]);
        assert_eq!(lines, vec!["    ADD A, E", "    RET"]);
    }
}
