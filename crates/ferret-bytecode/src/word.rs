//! Instruction word packing and unpacking
//!
//! Layout of a 32-bit instruction word:
//!
//! ```text
//! | C: 8 bits | B: 8 bits | A: 8 bits | opcode: 8 bits |
//! |   D: signed 16 bits   | A: 8 bits | opcode: 8 bits |
//! |         E: signed 24 bits         | opcode: 8 bits |
//! ```

use crate::opcode::Opcode;

/// Pack an opcode with three 8-bit operands.
#[inline]
pub const fn abc(op: Opcode, a: u8, b: u8, c: u8) -> u32 {
    op as u32 | ((a as u32) << 8) | ((b as u32) << 16) | ((c as u32) << 24)
}

/// Pack an opcode with an 8-bit operand and a signed 16-bit operand.
#[inline]
pub const fn ad(op: Opcode, a: u8, d: i16) -> u32 {
    op as u32 | ((a as u32) << 8) | ((d as u16 as u32) << 16)
}

/// Pack an opcode with a signed 24-bit operand.
#[inline]
pub const fn e(op: Opcode, e: i32) -> u32 {
    op as u32 | ((e as u32) << 8)
}

/// Raw opcode byte of an instruction word.
#[inline]
pub const fn op(insn: u32) -> u8 {
    insn as u8
}

/// A field (bits 8..16).
#[inline]
pub const fn a(insn: u32) -> u8 {
    (insn >> 8) as u8
}

/// B field (bits 16..24).
#[inline]
pub const fn b(insn: u32) -> u8 {
    (insn >> 16) as u8
}

/// C field (bits 24..32).
#[inline]
pub const fn c(insn: u32) -> u8 {
    (insn >> 24) as u8
}

/// D field: signed 16-bit operand in the high half.
#[inline]
pub const fn d(insn: u32) -> i32 {
    (insn as i32) >> 16
}

/// E field: signed 24-bit operand above the opcode byte.
#[inline]
pub const fn e_field(insn: u32) -> i32 {
    (insn as i32) >> 8
}

/// Rewrite the D field in place, preserving opcode and A.
#[inline]
pub fn patch_d(insn: &mut u32, d: i16) {
    *insn = (*insn & 0xffff) | ((d as u16 as u32) << 16);
}

/// Rewrite the C field in place.
#[inline]
pub fn patch_c(insn: &mut u32, c: u8) {
    *insn = (*insn & 0x00ff_ffff) | ((c as u32) << 24);
}

/// Rewrite the E field in place, preserving the opcode byte.
#[inline]
pub fn patch_e(insn: &mut u32, e: i32) {
    *insn = (*insn & 0xff) | ((e as u32) << 8);
}

/// Branch target of the instruction at `pc`, if it is a branch.
///
/// Resolves D-field jumps, fast-call fallthrough targets, LoadB skips with a
/// non-zero count, and the wide JumpX form. Offsets are relative to the
/// instruction following the branch.
pub fn jump_target(insn: u32, pc: u32) -> Option<u32> {
    let opcode = Opcode::from_byte(op(insn))?;

    if opcode.is_jump_d() {
        Some((pc as i64 + d(insn) as i64 + 1) as u32)
    } else if opcode.is_fast_call() {
        Some(pc + c(insn) as u32 + 2)
    } else if opcode.is_skip_c() && c(insn) != 0 {
        Some(pc + c(insn) as u32 + 1)
    } else if opcode == Opcode::JumpX {
        Some((pc as i64 + e_field(insn) as i64 + 1) as u32)
    } else {
        None
    }
}
