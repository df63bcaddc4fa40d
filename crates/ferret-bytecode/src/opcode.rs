//! Bytecode instructions (opcodes)

use serde::{Deserialize, Serialize};

/// Bytecode opcodes
///
/// Register-based instruction set. Every instruction occupies one 32-bit word
/// (opcode in the low byte, operands in the A/B/C, A/D or E fields) plus zero
/// or one auxiliary words; the auxiliary word count is fixed per opcode and
/// reported by [`Opcode::length`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    // ==================== Misc ====================
    /// No operation
    Nop = 0x00,
    /// Debugger breakpoint placeholder; replaces another instruction at runtime
    Break = 0x01,

    // ==================== Loads / moves ====================
    /// A = nil
    LoadNil = 0x02,
    /// A = boolean B; then skip C instructions (C is an unsigned skip count)
    LoadB = 0x03,
    /// A = number D (small integer immediate)
    LoadN = 0x04,
    /// A = constants\[D\]
    LoadK = 0x05,
    /// A = B (register copy)
    Move = 0x06,

    // ==================== Globals / upvalues ====================
    /// A = globals\[aux string constant\]
    GetGlobal = 0x07,
    /// globals\[aux string constant\] = A
    SetGlobal = 0x08,
    /// A = upvalues\[B\]
    GetUpval = 0x09,
    /// upvalues\[B\] = A
    SetUpval = 0x0A,
    /// close all upvalues referring to registers >= A
    CloseUpvals = 0x0B,
    /// A = resolved import chain; D is an import constant, aux the packed id
    GetImport = 0x0C,

    // ==================== Table access ====================
    /// A = B\[C\]
    GetTable = 0x0D,
    /// B\[C\] = A
    SetTable = 0x0E,
    /// A = B\[aux string constant\]
    GetTableKS = 0x0F,
    /// B\[aux string constant\] = A
    SetTableKS = 0x10,
    /// A = B\[C + 1\] (small integer index)
    GetTableN = 0x11,
    /// B\[C + 1\] = A
    SetTableN = 0x12,

    // ==================== Closures / calls ====================
    /// A = closure over child function D; followed by Capture instructions
    NewClosure = 0x13,
    /// method call setup: A/A+1 = B\[aux string constant\], B; followed by Call
    NameCall = 0x14,
    /// call A with B-1 arguments expecting C-1 results (0 means multret)
    Call = 0x15,
    /// return B-1 values starting at A (0 means multret)
    Return = 0x16,

    // ==================== Jumps ====================
    /// unconditional jump by D
    Jump = 0x17,
    /// unconditional backward jump by D; interruptible loop back-edge
    JumpBack = 0x18,
    /// jump by D if A is truthy
    JumpIf = 0x19,
    /// jump by D if A is falsy
    JumpIfNot = 0x1A,
    /// jump by D if A == aux register
    JumpIfEq = 0x1B,
    /// jump by D if A <= aux register
    JumpIfLe = 0x1C,
    /// jump by D if A < aux register
    JumpIfLt = 0x1D,
    /// jump by D if A != aux register
    JumpIfNotEq = 0x1E,
    /// jump by D if not (A <= aux register)
    JumpIfNotLe = 0x1F,
    /// jump by D if not (A < aux register)
    JumpIfNotLt = 0x20,

    // ==================== Arithmetic ====================
    /// A = B + C
    Add = 0x21,
    /// A = B - C
    Sub = 0x22,
    /// A = B * C
    Mul = 0x23,
    /// A = B / C
    Div = 0x24,
    /// A = B % C
    Mod = 0x25,
    /// A = B ^ C
    Pow = 0x26,
    /// A = B + number constant C
    AddK = 0x27,
    /// A = B - number constant C
    SubK = 0x28,
    /// A = B * number constant C
    MulK = 0x29,
    /// A = B / number constant C
    DivK = 0x2A,
    /// A = B % number constant C
    ModK = 0x2B,
    /// A = B ^ number constant C
    PowK = 0x2C,

    // ==================== Logic ====================
    /// A = B and C
    And = 0x2D,
    /// A = B or C
    Or = 0x2E,
    /// A = B and constant C
    AndK = 0x2F,
    /// A = B or constant C
    OrK = 0x30,

    // ==================== String / unary ====================
    /// A = concat(B..C) over a contiguous register range
    Concat = 0x31,
    /// A = not B
    Not = 0x32,
    /// A = -B
    Minus = 0x33,
    /// A = #B
    Length = 0x34,

    // ==================== Table constructors ====================
    /// A = new table; B encodes array size hint, aux the node count hint
    NewTable = 0x35,
    /// A = shallow copy of table-shape constant D
    DupTable = 0x36,
    /// set list elements A\[aux..\] = B..B+C-2 (C = 0 means multret)
    SetList = 0x37,

    // ==================== Loops ====================
    /// numeric for loop setup; jumps by D past the loop if not taken
    ForNPrep = 0x38,
    /// numeric for loop iteration; jumps back by D while running
    ForNLoop = 0x39,
    /// generic for loop setup; jumps by D to the loop condition
    ForGPrep = 0x3A,
    /// generic for loop iteration; aux holds the variable count
    ForGLoop = 0x3B,
    /// specialized ForGPrep for `ipairs`-style iteration
    ForGPrepINext = 0x3C,
    /// specialized ForGPrep for `pairs`-style iteration
    ForGPrepNext = 0x3D,

    // ==================== Varargs / closures ====================
    /// A.. = ... with B-1 results (0 means multret)
    GetVarargs = 0x3E,
    /// A = cached closure constant D (no captured mutable state)
    DupClosure = 0x3F,
    /// vararg function prologue; A is the declared parameter count
    PrepVarargs = 0x40,

    // ==================== Extended forms ====================
    /// A = constants\[aux\] (wide constant index)
    LoadKX = 0x41,
    /// unconditional jump by E (24-bit offset); trampoline target
    JumpX = 0x42,

    // ==================== Builtin fast calls ====================
    /// fast-call builtin A, falling through C instructions to the Call on miss
    FastCall = 0x43,
    /// fast-call builtin A with one argument in B
    FastCall1 = 0x44,
    /// fast-call builtin A with arguments B and aux register
    FastCall2 = 0x45,
    /// fast-call builtin A with argument B and aux constant
    FastCall2K = 0x46,
    /// fast-call builtin A with argument B and two aux-packed registers
    FastCall3 = 0x47,

    // ==================== Instrumentation / captures ====================
    /// coverage counter bump
    Coverage = 0x48,
    /// upvalue capture descriptor following NewClosure/DupClosure
    Capture = 0x49,

    // ==================== Mixed-operand arithmetic ====================
    /// A = number constant B - C
    SubRK = 0x4A,
    /// A = number constant B / C
    DivRK = 0x4B,
    /// A = B // C
    IDiv = 0x4C,
    /// A = B // number constant C
    IDivK = 0x4D,

    // ==================== Constant-compare jumps ====================
    /// jump by D if A is (not, per aux sign bit) nil
    JumpXEqKNil = 0x4E,
    /// jump by D if A is (not) the boolean in aux
    JumpXEqKB = 0x4F,
    /// jump by D if A is (not) the number constant in aux
    JumpXEqKN = 0x50,
    /// jump by D if A is (not) the string constant in aux
    JumpXEqKS = 0x51,
}

impl Opcode {
    /// Convert from raw byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        // Use a match to ensure safety
        match byte {
            0x00 => Some(Self::Nop),
            0x01 => Some(Self::Break),

            0x02 => Some(Self::LoadNil),
            0x03 => Some(Self::LoadB),
            0x04 => Some(Self::LoadN),
            0x05 => Some(Self::LoadK),
            0x06 => Some(Self::Move),

            0x07 => Some(Self::GetGlobal),
            0x08 => Some(Self::SetGlobal),
            0x09 => Some(Self::GetUpval),
            0x0A => Some(Self::SetUpval),
            0x0B => Some(Self::CloseUpvals),
            0x0C => Some(Self::GetImport),

            0x0D => Some(Self::GetTable),
            0x0E => Some(Self::SetTable),
            0x0F => Some(Self::GetTableKS),
            0x10 => Some(Self::SetTableKS),
            0x11 => Some(Self::GetTableN),
            0x12 => Some(Self::SetTableN),

            0x13 => Some(Self::NewClosure),
            0x14 => Some(Self::NameCall),
            0x15 => Some(Self::Call),
            0x16 => Some(Self::Return),

            0x17 => Some(Self::Jump),
            0x18 => Some(Self::JumpBack),
            0x19 => Some(Self::JumpIf),
            0x1A => Some(Self::JumpIfNot),
            0x1B => Some(Self::JumpIfEq),
            0x1C => Some(Self::JumpIfLe),
            0x1D => Some(Self::JumpIfLt),
            0x1E => Some(Self::JumpIfNotEq),
            0x1F => Some(Self::JumpIfNotLe),
            0x20 => Some(Self::JumpIfNotLt),

            0x21 => Some(Self::Add),
            0x22 => Some(Self::Sub),
            0x23 => Some(Self::Mul),
            0x24 => Some(Self::Div),
            0x25 => Some(Self::Mod),
            0x26 => Some(Self::Pow),
            0x27 => Some(Self::AddK),
            0x28 => Some(Self::SubK),
            0x29 => Some(Self::MulK),
            0x2A => Some(Self::DivK),
            0x2B => Some(Self::ModK),
            0x2C => Some(Self::PowK),

            0x2D => Some(Self::And),
            0x2E => Some(Self::Or),
            0x2F => Some(Self::AndK),
            0x30 => Some(Self::OrK),

            0x31 => Some(Self::Concat),
            0x32 => Some(Self::Not),
            0x33 => Some(Self::Minus),
            0x34 => Some(Self::Length),

            0x35 => Some(Self::NewTable),
            0x36 => Some(Self::DupTable),
            0x37 => Some(Self::SetList),

            0x38 => Some(Self::ForNPrep),
            0x39 => Some(Self::ForNLoop),
            0x3A => Some(Self::ForGPrep),
            0x3B => Some(Self::ForGLoop),
            0x3C => Some(Self::ForGPrepINext),
            0x3D => Some(Self::ForGPrepNext),

            0x3E => Some(Self::GetVarargs),
            0x3F => Some(Self::DupClosure),
            0x40 => Some(Self::PrepVarargs),

            0x41 => Some(Self::LoadKX),
            0x42 => Some(Self::JumpX),

            0x43 => Some(Self::FastCall),
            0x44 => Some(Self::FastCall1),
            0x45 => Some(Self::FastCall2),
            0x46 => Some(Self::FastCall2K),
            0x47 => Some(Self::FastCall3),

            0x48 => Some(Self::Coverage),
            0x49 => Some(Self::Capture),

            0x4A => Some(Self::SubRK),
            0x4B => Some(Self::DivRK),
            0x4C => Some(Self::IDiv),
            0x4D => Some(Self::IDivK),

            0x4E => Some(Self::JumpXEqKNil),
            0x4F => Some(Self::JumpXEqKB),
            0x50 => Some(Self::JumpXEqKN),
            0x51 => Some(Self::JumpXEqKS),

            _ => None,
        }
    }

    /// Convert to raw byte
    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Instruction length in 32-bit words, including auxiliary words.
    ///
    /// The auxiliary word count is a static property of the opcode; jump and
    /// skip targets must land on instruction starts, never on aux words.
    pub const fn length(self) -> usize {
        match self {
            Self::GetGlobal
            | Self::SetGlobal
            | Self::GetImport
            | Self::GetTableKS
            | Self::SetTableKS
            | Self::NameCall
            | Self::JumpIfEq
            | Self::JumpIfLe
            | Self::JumpIfLt
            | Self::JumpIfNotEq
            | Self::JumpIfNotLe
            | Self::JumpIfNotLt
            | Self::NewTable
            | Self::SetList
            | Self::ForGLoop
            | Self::LoadKX
            | Self::FastCall2
            | Self::FastCall2K
            | Self::FastCall3
            | Self::JumpXEqKNil
            | Self::JumpXEqKB
            | Self::JumpXEqKN
            | Self::JumpXEqKS => 2,
            _ => 1,
        }
    }

    /// Does this opcode carry a signed 16-bit branch offset in the D field?
    pub const fn is_jump_d(self) -> bool {
        matches!(
            self,
            Self::Jump
                | Self::JumpBack
                | Self::JumpIf
                | Self::JumpIfNot
                | Self::JumpIfEq
                | Self::JumpIfLe
                | Self::JumpIfLt
                | Self::JumpIfNotEq
                | Self::JumpIfNotLe
                | Self::JumpIfNotLt
                | Self::ForNPrep
                | Self::ForNLoop
                | Self::ForGPrep
                | Self::ForGLoop
                | Self::ForGPrepINext
                | Self::ForGPrepNext
                | Self::JumpXEqKNil
                | Self::JumpXEqKB
                | Self::JumpXEqKN
                | Self::JumpXEqKS
        )
    }

    /// Does this opcode carry an unsigned 8-bit skip count in the C field?
    pub const fn is_skip_c(self) -> bool {
        matches!(self, Self::LoadB)
    }

    /// Is this one of the builtin fast-call forms?
    pub const fn is_fast_call(self) -> bool {
        matches!(
            self,
            Self::FastCall | Self::FastCall1 | Self::FastCall2 | Self::FastCall2K | Self::FastCall3
        )
    }

    /// Get the dump mnemonic of this opcode
    pub const fn name(self) -> &'static str {
        match self {
            Self::Nop => "NOP",
            Self::Break => "BREAK",
            Self::LoadNil => "LOADNIL",
            Self::LoadB => "LOADB",
            Self::LoadN => "LOADN",
            Self::LoadK => "LOADK",
            Self::Move => "MOVE",
            Self::GetGlobal => "GETGLOBAL",
            Self::SetGlobal => "SETGLOBAL",
            Self::GetUpval => "GETUPVAL",
            Self::SetUpval => "SETUPVAL",
            Self::CloseUpvals => "CLOSEUPVALS",
            Self::GetImport => "GETIMPORT",
            Self::GetTable => "GETTABLE",
            Self::SetTable => "SETTABLE",
            Self::GetTableKS => "GETTABLEKS",
            Self::SetTableKS => "SETTABLEKS",
            Self::GetTableN => "GETTABLEN",
            Self::SetTableN => "SETTABLEN",
            Self::NewClosure => "NEWCLOSURE",
            Self::NameCall => "NAMECALL",
            Self::Call => "CALL",
            Self::Return => "RETURN",
            Self::Jump => "JUMP",
            Self::JumpBack => "JUMPBACK",
            Self::JumpIf => "JUMPIF",
            Self::JumpIfNot => "JUMPIFNOT",
            Self::JumpIfEq => "JUMPIFEQ",
            Self::JumpIfLe => "JUMPIFLE",
            Self::JumpIfLt => "JUMPIFLT",
            Self::JumpIfNotEq => "JUMPIFNOTEQ",
            Self::JumpIfNotLe => "JUMPIFNOTLE",
            Self::JumpIfNotLt => "JUMPIFNOTLT",
            Self::Add => "ADD",
            Self::Sub => "SUB",
            Self::Mul => "MUL",
            Self::Div => "DIV",
            Self::Mod => "MOD",
            Self::Pow => "POW",
            Self::AddK => "ADDK",
            Self::SubK => "SUBK",
            Self::MulK => "MULK",
            Self::DivK => "DIVK",
            Self::ModK => "MODK",
            Self::PowK => "POWK",
            Self::And => "AND",
            Self::Or => "OR",
            Self::AndK => "ANDK",
            Self::OrK => "ORK",
            Self::Concat => "CONCAT",
            Self::Not => "NOT",
            Self::Minus => "MINUS",
            Self::Length => "LENGTH",
            Self::NewTable => "NEWTABLE",
            Self::DupTable => "DUPTABLE",
            Self::SetList => "SETLIST",
            Self::ForNPrep => "FORNPREP",
            Self::ForNLoop => "FORNLOOP",
            Self::ForGPrep => "FORGPREP",
            Self::ForGLoop => "FORGLOOP",
            Self::ForGPrepINext => "FORGPREP_INEXT",
            Self::ForGPrepNext => "FORGPREP_NEXT",
            Self::GetVarargs => "GETVARARGS",
            Self::DupClosure => "DUPCLOSURE",
            Self::PrepVarargs => "PREPVARARGS",
            Self::LoadKX => "LOADKX",
            Self::JumpX => "JUMPX",
            Self::FastCall => "FASTCALL",
            Self::FastCall1 => "FASTCALL1",
            Self::FastCall2 => "FASTCALL2",
            Self::FastCall2K => "FASTCALL2K",
            Self::FastCall3 => "FASTCALL3",
            Self::Coverage => "COVERAGE",
            Self::Capture => "CAPTURE",
            Self::SubRK => "SUBRK",
            Self::DivRK => "DIVRK",
            Self::IDiv => "IDIV",
            Self::IDivK => "IDIVK",
            Self::JumpXEqKNil => "JUMPXEQKNIL",
            Self::JumpXEqKB => "JUMPXEQKB",
            Self::JumpXEqKN => "JUMPXEQKN",
            Self::JumpXEqKS => "JUMPXEQKS",
        }
    }
}

/// Capture modes carried in the A field of a [`Opcode::Capture`] instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CaptureKind {
    /// Capture the parent's register by value
    Val = 0,
    /// Capture the parent's register by reference (must be closed later)
    Ref = 1,
    /// Capture one of the parent's upvalues
    Upval = 2,
}

impl CaptureKind {
    /// Convert from raw byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Val),
            1 => Some(Self::Ref),
            2 => Some(Self::Upval),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        let ops = [
            Opcode::LoadNil,
            Opcode::Add,
            Opcode::Call,
            Opcode::Jump,
            Opcode::Return,
            Opcode::JumpXEqKS,
        ];

        for op in ops {
            let byte = op.to_byte();
            let decoded = Opcode::from_byte(byte);
            assert_eq!(decoded, Some(op));
        }
    }

    #[test]
    fn test_invalid_opcode() {
        assert_eq!(Opcode::from_byte(0xFF), None);
    }

    #[test]
    fn test_opcode_name() {
        assert_eq!(Opcode::Add.name(), "ADD");
        assert_eq!(Opcode::LoadK.name(), "LOADK");
        assert_eq!(Opcode::Return.name(), "RETURN");
        assert_eq!(Opcode::ForGPrepINext.name(), "FORGPREP_INEXT");
    }

    #[test]
    fn test_opcode_length() {
        assert_eq!(Opcode::Add.length(), 1);
        assert_eq!(Opcode::GetGlobal.length(), 2);
        assert_eq!(Opcode::JumpIfEq.length(), 2);
        assert_eq!(Opcode::Jump.length(), 1);
        assert_eq!(Opcode::SetList.length(), 2);
    }

    #[test]
    fn test_jump_classification() {
        assert!(Opcode::Jump.is_jump_d());
        assert!(Opcode::ForNLoop.is_jump_d());
        assert!(!Opcode::JumpX.is_jump_d());
        assert!(Opcode::LoadB.is_skip_c());
        assert!(Opcode::FastCall2K.is_fast_call());
        assert!(!Opcode::Call.is_fast_call());
    }
}
