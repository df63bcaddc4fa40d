//! Textual disassembly of built functions
//!
//! Dump text is captured at function close (the serialized record can't be
//! disassembled back without a loader) and retrieved per function or for the
//! whole unit afterwards.

use std::fmt::Write as _;

use ferret_bytecode::{CaptureKind, Opcode, decompose_import_id, word};

use crate::builder::BytecodeBuilder;
use crate::constant::Constant;

fn printable_string_constant(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b >= b' ')
}

impl BytecodeBuilder {
    fn dump_constant(&self, result: &mut String, k: usize) {
        debug_assert!(k < self.constants.len());

        match self.constants[k] {
            Constant::Nil => result.push_str("nil"),
            Constant::Boolean(value) => {
                result.push_str(if value { "true" } else { "false" });
            }
            Constant::Number(value) => {
                _ = write!(result, "{value}");
            }
            Constant::Vector([x, y, z, w]) => {
                // 3-vectors are the most common configuration, so truncate
                // to three components if possible
                if w == 0.0 {
                    _ = write!(result, "{x}, {y}, {z}");
                } else {
                    _ = write!(result, "{x}, {y}, {z}, {w}");
                }
            }
            Constant::String(index) => {
                let bytes = &self.debug_strings[index as usize - 1];

                if printable_string_constant(bytes) {
                    if bytes.len() < 32 {
                        _ = write!(result, "'{}'", String::from_utf8_lossy(bytes));
                    } else {
                        _ = write!(result, "'{}'...", String::from_utf8_lossy(&bytes[..32]));
                    }
                }
            }
            Constant::Import(iid) => {
                let (count, ids) = decompose_import_id(iid);

                for (j, id) in ids.iter().take(count).flatten().enumerate() {
                    let Constant::String(index) = self.constants[*id as usize] else {
                        unreachable!("import chain refers to a non-string constant")
                    };

                    let bytes = &self.debug_strings[index as usize - 1];

                    if j > 0 {
                        result.push('.');
                    }
                    _ = write!(result, "{}", String::from_utf8_lossy(bytes));
                }
            }
            Constant::Table(_) => result.push_str("{...}"),
            Constant::Closure(fid) => {
                let name = &self.function_record(fid).dump_name;

                if !name.is_empty() {
                    _ = write!(result, "'{name}'");
                }
            }
        }
    }

    fn dump_instruction(&self, i: usize, result: &mut String, target_label: i32) {
        let insn = self.insns[i];
        let op = self.opcode_at(i);

        let a = word::a(insn);
        let b = word::b(insn);
        let c = word::c(insn);
        let d = word::d(insn);
        let name = op.name();

        match op {
            Opcode::Nop | Opcode::Break | Opcode::Coverage => {
                _ = writeln!(result, "{name}");
            }

            Opcode::LoadNil | Opcode::CloseUpvals => {
                _ = writeln!(result, "{name} R{a}");
            }

            Opcode::LoadB => {
                if c != 0 {
                    _ = writeln!(result, "LOADB R{a} {b} +{c}");
                } else {
                    _ = writeln!(result, "LOADB R{a} {b}");
                }
            }

            Opcode::LoadN => {
                _ = writeln!(result, "LOADN R{a} {d}");
            }

            Opcode::LoadK | Opcode::DupClosure => {
                _ = write!(result, "{name} R{a} K{d} [");
                self.dump_constant(result, d as usize);
                result.push_str("]\n");
            }

            Opcode::Move | Opcode::Not | Opcode::Minus | Opcode::Length => {
                _ = writeln!(result, "{name} R{a} R{b}");
            }

            Opcode::GetGlobal | Opcode::SetGlobal => {
                let aux = self.insns[i + 1];
                _ = write!(result, "{name} R{a} K{aux} [");
                self.dump_constant(result, aux as usize);
                result.push_str("]\n");
            }

            Opcode::GetUpval | Opcode::SetUpval => {
                _ = writeln!(result, "{name} R{a} {b}");
            }

            Opcode::GetImport => {
                _ = write!(result, "GETIMPORT R{a} {d} [");
                self.dump_constant(result, d as usize);
                result.push_str("]\n");
            }

            Opcode::GetTable
            | Opcode::SetTable
            | Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::IDiv
            | Opcode::Mod
            | Opcode::Pow
            | Opcode::And
            | Opcode::Or
            | Opcode::Concat => {
                _ = writeln!(result, "{name} R{a} R{b} R{c}");
            }

            Opcode::GetTableKS | Opcode::SetTableKS | Opcode::NameCall => {
                let aux = self.insns[i + 1];
                _ = write!(result, "{name} R{a} R{b} K{aux} [");
                self.dump_constant(result, aux as usize);
                result.push_str("]\n");
            }

            Opcode::GetTableN | Opcode::SetTableN => {
                _ = writeln!(result, "{name} R{a} R{b} {}", c + 1);
            }

            Opcode::NewClosure => {
                _ = writeln!(result, "NEWCLOSURE R{a} P{d}");
            }

            Opcode::Call => {
                _ = writeln!(result, "CALL R{a} {} {}", b as i32 - 1, c as i32 - 1);
            }

            Opcode::Return => {
                _ = writeln!(result, "RETURN R{a} {}", b as i32 - 1);
            }

            Opcode::Jump | Opcode::JumpBack | Opcode::JumpX => {
                _ = writeln!(result, "{name} L{target_label}");
            }

            Opcode::JumpIf
            | Opcode::JumpIfNot
            | Opcode::ForNPrep
            | Opcode::ForNLoop
            | Opcode::ForGPrep
            | Opcode::ForGPrepINext
            | Opcode::ForGPrepNext => {
                _ = writeln!(result, "{name} R{a} L{target_label}");
            }

            Opcode::JumpIfEq
            | Opcode::JumpIfLe
            | Opcode::JumpIfLt
            | Opcode::JumpIfNotEq
            | Opcode::JumpIfNotLe
            | Opcode::JumpIfNotLt => {
                _ = writeln!(result, "{name} R{a} R{} L{target_label}", self.insns[i + 1]);
            }

            Opcode::AddK
            | Opcode::SubK
            | Opcode::MulK
            | Opcode::DivK
            | Opcode::IDivK
            | Opcode::ModK
            | Opcode::PowK
            | Opcode::AndK
            | Opcode::OrK => {
                _ = write!(result, "{name} R{a} R{b} K{c} [");
                self.dump_constant(result, c as usize);
                result.push_str("]\n");
            }

            Opcode::SubRK | Opcode::DivRK => {
                _ = write!(result, "{name} R{a} K{b} [");
                self.dump_constant(result, b as usize);
                _ = writeln!(result, "] R{c}");
            }

            Opcode::NewTable => {
                let array_hint = if b == 0 { 0 } else { 1 << (b - 1) };
                _ = writeln!(result, "NEWTABLE R{a} {array_hint} {}", self.insns[i + 1]);
            }

            Opcode::DupTable => {
                _ = writeln!(result, "DUPTABLE R{a} {d}");
            }

            Opcode::SetList => {
                _ = writeln!(result, "SETLIST R{a} R{b} {} [{}]", c as i32 - 1, self.insns[i + 1]);
            }

            Opcode::ForGLoop => {
                let aux = self.insns[i + 1];
                _ = writeln!(
                    result,
                    "FORGLOOP R{a} L{target_label} {}{}",
                    aux as u8,
                    if (aux as i32) < 0 { " [inext]" } else { "" }
                );
            }

            Opcode::GetVarargs => {
                _ = writeln!(result, "GETVARARGS R{a} {}", b as i32 - 1);
            }

            // the vararg prologue is call-dispatch plumbing, nothing to show
            Opcode::PrepVarargs => {}

            Opcode::LoadKX => {
                let aux = self.insns[i + 1];
                _ = write!(result, "LOADKX R{a} K{aux} [");
                self.dump_constant(result, aux as usize);
                result.push_str("]\n");
            }

            Opcode::FastCall => {
                _ = writeln!(result, "FASTCALL {a} L{target_label}");
            }

            Opcode::FastCall1 => {
                _ = writeln!(result, "FASTCALL1 {a} R{b} L{target_label}");
            }

            Opcode::FastCall2 => {
                _ = writeln!(result, "FASTCALL2 {a} R{b} R{} L{target_label}", self.insns[i + 1]);
            }

            Opcode::FastCall2K => {
                let aux = self.insns[i + 1];
                _ = write!(result, "FASTCALL2K {a} R{b} K{aux} L{target_label} [");
                self.dump_constant(result, aux as usize);
                result.push_str("]\n");
            }

            Opcode::FastCall3 => {
                let aux = self.insns[i + 1];
                _ = writeln!(
                    result,
                    "FASTCALL3 {a} R{b} R{} R{} L{target_label}",
                    aux & 0xff,
                    (aux >> 8) & 0xff
                );
            }

            Opcode::Capture => {
                let (kind, prefix) = match CaptureKind::from_byte(a) {
                    Some(CaptureKind::Val) => ("VAL", 'R'),
                    Some(CaptureKind::Ref) => ("REF", 'R'),
                    Some(CaptureKind::Upval) => ("UPVAL", 'U'),
                    None => ("", 'R'),
                };
                _ = writeln!(result, "CAPTURE {kind} {prefix}{b}");
            }

            Opcode::JumpXEqKNil => {
                let not = if self.insns[i + 1] >> 31 != 0 { " NOT" } else { "" };
                _ = writeln!(result, "JUMPXEQKNIL R{a} L{target_label}{not}");
            }

            Opcode::JumpXEqKB => {
                let aux = self.insns[i + 1];
                let not = if aux >> 31 != 0 { " NOT" } else { "" };
                _ = writeln!(result, "JUMPXEQKB R{a} {} L{target_label}{not}", aux & 1);
            }

            Opcode::JumpXEqKN | Opcode::JumpXEqKS => {
                let aux = self.insns[i + 1];
                let not = if aux >> 31 != 0 { " NOT" } else { "" };
                _ = write!(result, "{name} R{a} K{} L{target_label}{not} [", aux & 0xffffff);
                self.dump_constant(result, (aux & 0xffffff) as usize);
                result.push_str("]\n");
            }
        }
    }

    pub(crate) fn dump_current_function(&self) -> String {
        if !self.dump_flags.code {
            return String::new();
        }

        let mut result = String::new();

        if self.dump_flags.locals {
            for (i, local) in self.debug_locals.iter().enumerate() {
                // names would need a reverse lookup through the string table,
                // so only registers and ranges are shown
                if local.start_pc == local.end_pc {
                    debug_assert!((local.start_pc as usize) < self.lines.len());

                    _ = writeln!(
                        result,
                        "local {i}: reg {}, start pc {} line {}, no live range",
                        local.reg,
                        local.start_pc,
                        self.lines[local.start_pc as usize]
                    );
                } else {
                    // endpc is exclusive in the debug info, but inclusive
                    // bounds are easier to read
                    debug_assert!(local.start_pc < local.end_pc);
                    debug_assert!((local.end_pc as usize) <= self.lines.len());

                    _ = writeln!(
                        result,
                        "local {i}: reg {}, start pc {} line {}, end pc {} line {}",
                        local.reg,
                        local.start_pc,
                        self.lines[local.start_pc as usize],
                        local.end_pc - 1,
                        self.lines[local.end_pc as usize - 1]
                    );
                }
            }
        }

        // assign sequential label ids to every jump target
        let mut labels = vec![-1i32; self.insns.len()];

        let mut i = 0;
        while i < self.insns.len() {
            if let Some(target) = word::jump_target(self.insns[i], i as u32) {
                debug_assert!((target as usize) < self.insns.len());
                labels[target as usize] = 0;
            }

            i += self.opcode_at(i).length();
        }

        let mut next_label = 0;
        for label in &mut labels {
            if *label == 0 {
                *label = next_label;
                next_label += 1;
            }
        }

        let mut last_line = -1;
        let mut next_remark = 0;

        let mut i = 0;
        while i < self.insns.len() {
            let op = self.opcode_at(i);

            if op == Opcode::PrepVarargs {
                // call dispatch header, doesn't carry interesting information
                i += 1;
                continue;
            }

            if self.dump_flags.remarks {
                while next_remark < self.debug_remarks.len()
                    && self.debug_remarks[next_remark].0 as usize == i
                {
                    _ = writeln!(result, "REMARK {}", self.debug_remarks[next_remark].1);
                    next_remark += 1;
                }
            }

            if self.dump_flags.source {
                let line = self.lines[i];

                if line > 0 && line != last_line {
                    debug_assert!((line as usize) <= self.dump_source.len());
                    _ = writeln!(result, "{line:5}: {}", self.dump_source[line as usize - 1]);
                    last_line = line;
                }
            }

            if self.dump_flags.lines {
                _ = write!(result, "{}: ", self.lines[i]);
            }

            if labels[i] != -1 {
                _ = write!(result, "L{}: ", labels[i]);
            }

            let target_label = word::jump_target(self.insns[i], i as u32)
                .map_or(-1, |target| labels[target as usize]);

            self.dump_instruction(i, &mut result, target_label);

            i += op.length();
            debug_assert!(i <= self.insns.len());
        }

        result
    }

    /// Provide the source text for source-interleaved dumps.
    pub fn set_dump_source(&mut self, source: &str) {
        self.dump_source.clear();

        for line in source.split('\n') {
            self.dump_source.push(line.strip_suffix('\r').unwrap_or(line).to_owned());
        }
    }

    /// Dump text of a closed function; empty unless code dumps are enabled.
    pub fn dump_function(&self, id: u32) -> &str {
        &self.function_record(id).dump
    }

    /// Dump text of every closed function, with per-function headers.
    pub fn dump_everything(&self) -> String {
        let mut result = String::new();

        for id in 0..self.function_count() as u32 {
            let func = self.function_record(id);
            let name = if func.dump_name.is_empty() { "??" } else { &func.dump_name };

            _ = writeln!(result, "Function {id} ({name}):");

            result.push_str(&func.dump);
            result.push('\n');
        }

        result
    }

    /// The dump source re-printed with `-- remark:` annotations above the
    /// lines that produced them.
    pub fn dump_source_remarks(&self) -> String {
        let mut result = String::new();

        let mut remarks = self.dump_remarks.clone();
        remarks.sort();

        let mut next_remark = 0;

        for (i, line) in self.dump_source.iter().enumerate() {
            let indent: String =
                line.chars().take_while(|&ch| ch == ' ' || ch == '\t').collect();

            while next_remark < remarks.len() && remarks[next_remark].0 as usize == i + 1 {
                _ = writeln!(result, "{indent}-- remark: {}", remarks[next_remark].1);
                next_remark += 1;

                // skip duplicate remarks (due to inlining/unrolling)
                while next_remark < remarks.len()
                    && remarks[next_remark] == remarks[next_remark - 1]
                {
                    next_remark += 1;
                }
            }

            result.push_str(line);

            if i + 1 < self.dump_source.len() {
                result.push('\n');
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::DumpFlags;

    fn code_dump_builder() -> BytecodeBuilder {
        let mut bc = BytecodeBuilder::new();
        bc.set_dump_flags(DumpFlags { code: true, ..DumpFlags::default() });
        bc
    }

    #[test]
    fn test_dump_arithmetic() {
        let mut bc = code_dump_builder();
        bc.begin_function(0, false);

        let k0 = bc.add_constant_number(1.0).unwrap();
        let k1 = bc.add_constant_number(2.0).unwrap();

        bc.emit_ad(Opcode::LoadK, 0, k0 as i16);
        bc.emit_ad(Opcode::LoadK, 1, k1 as i16);
        bc.emit_abc(Opcode::Add, 2, 0, 1);
        bc.emit_abc(Opcode::Return, 2, 2, 0);

        bc.end_function(3, 0, 0);

        let dump = bc.dump_function(0);
        assert_eq!(dump, "LOADK R0 K0 [1]\nLOADK R1 K1 [2]\nADD R2 R0 R1\nRETURN R2 1\n");
    }

    #[test]
    fn test_dump_jump_labels() {
        let mut bc = code_dump_builder();
        bc.begin_function(1, false);

        let jump = bc.emit_label();
        bc.emit_ad(Opcode::JumpIf, 0, 0);
        bc.emit_abc(Opcode::LoadNil, 0, 0, 0);
        let target = bc.emit_label();
        bc.emit_abc(Opcode::Return, 0, 1, 0);

        bc.patch_jump_d(jump, target).unwrap();
        bc.end_function(1, 0, 0);

        let dump = bc.dump_function(0);
        assert!(dump.contains("JUMPIF R0 L0\n"));
        assert!(dump.contains("L0: RETURN R0 0\n"));
    }

    #[test]
    fn test_dump_string_truncation() {
        let mut bc = code_dump_builder();
        bc.begin_function(0, false);

        let long = "a".repeat(40);
        let short = bc.add_constant_string("hi").unwrap();
        let k = bc.add_constant_string(long.as_str()).unwrap();

        bc.emit_ad(Opcode::LoadK, 0, short as i16);
        bc.emit_ad(Opcode::LoadK, 0, k as i16);
        bc.emit_abc(Opcode::Return, 0, 1, 0);

        bc.end_function(1, 0, 0);

        let dump = bc.dump_function(0);
        assert!(dump.contains("LOADK R0 K0 ['hi']\n"));
        assert!(dump.contains(&format!("LOADK R0 K1 ['{}'...]\n", "a".repeat(32))));
    }

    #[test]
    fn test_dump_import_chain() {
        let mut bc = code_dump_builder();
        bc.begin_function(0, false);

        let math = bc.add_constant_string("math").unwrap();
        let pi = bc.add_constant_string("pi").unwrap();
        let iid = ferret_bytecode::import_id_2(math, pi);
        let import = bc.add_import(iid).unwrap();

        bc.emit_ad(Opcode::GetImport, 0, import as i16);
        bc.emit_aux(iid);
        bc.emit_abc(Opcode::Return, 0, 2, 0);

        bc.end_function(1, 0, 0);

        let dump = bc.dump_function(0);
        assert!(dump.contains("GETIMPORT R0 2 [math.pi]\n"));
    }

    #[test]
    fn test_dump_everything_headers() {
        let mut bc = code_dump_builder();

        bc.begin_function(0, false);
        bc.set_debug_function_name("helper");
        bc.emit_abc(Opcode::Return, 0, 1, 0);
        bc.end_function(1, 0, 0);

        bc.begin_function(0, false);
        bc.emit_abc(Opcode::Return, 0, 1, 0);
        bc.end_function(1, 0, 0);

        let dump = bc.dump_everything();
        assert!(dump.contains("Function 0 (helper):\n"));
        assert!(dump.contains("Function 1 (??):\n"));
    }

    #[test]
    fn test_dump_remarks() {
        let mut bc = BytecodeBuilder::new();
        bc.set_dump_flags(DumpFlags { code: true, remarks: true, ..DumpFlags::default() });

        bc.begin_function(0, false);
        bc.add_debug_remark(format_args!("builtin fold: {}", "math.pi"));
        bc.emit_abc(Opcode::Return, 0, 1, 0);
        bc.end_function(1, 0, 0);

        let dump = bc.dump_function(0);
        assert!(dump.starts_with("REMARK builtin fold: math.pi\n"));
    }

    #[test]
    fn test_source_remarks() {
        let mut bc = BytecodeBuilder::new();
        bc.set_dump_flags(DumpFlags { code: true, remarks: true, ..DumpFlags::default() });
        bc.set_dump_source("local x = 1\n  local y = x + 1");

        bc.begin_function(0, false);
        bc.set_debug_line(2);
        bc.add_debug_remark(format_args!("constant folded"));
        bc.emit_abc(Opcode::Return, 0, 1, 0);
        bc.end_function(1, 0, 0);

        let text = bc.dump_source_remarks();
        assert_eq!(text, "local x = 1\n  -- remark: constant folded\n  local y = x + 1");
    }
}
