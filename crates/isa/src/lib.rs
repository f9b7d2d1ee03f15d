//! NotSoTiny instruction set definition.
//!
//! Encoding layout: one opcode byte, followed by operand bytes determined by
//! the opcode's [`OperandForm`]:
//!
//! - `Reg`:        one register byte
//! - `RegReg`:     one byte, destination in the high nibble, source in the low
//! - `RegImm(w)`:  register byte, then a `w`-byte little-endian immediate
//! - `RegMem`/`MemReg`/`MemImm(w)`: register/immediate plus a memory operand
//! - `Imm(w)`/`Rel(w)`: a bare `w`-byte little-endian immediate/displacement
//! - `Rim`:        a prefix byte selecting register, memory, or a 4-byte
//!   immediate operand
//!
//! A memory operand is two header bytes (base and index register nibbles,
//! `0xF` meaning absent, then the literal scale factor) followed by a 4-byte
//! little-endian displacement. Relative displacements are measured from the
//! address of the byte immediately after the instruction.

use thiserror::Error;

/// Field widths for immediates, data words and relative displacements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Width {
    Byte,
    Word,
    Double,
}

impl Width {
    pub const fn bytes(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Double => 4,
        }
    }
}

/// How an opcode family interprets a narrowed immediate field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extend {
    Sign,
    Zero,
}

/// Returns `true` if `value` survives a round trip through a `width`-byte
/// field under the given extension rule.
pub fn immediate_fits(width: Width, extend: Extend, value: i64) -> bool {
    match (extend, width) {
        (Extend::Sign, Width::Byte) => i8::try_from(value).is_ok(),
        (Extend::Sign, Width::Word) => i16::try_from(value).is_ok(),
        (Extend::Sign, Width::Double) => i32::try_from(value).is_ok(),
        (Extend::Zero, Width::Byte) => (0..=0xFF).contains(&value),
        (Extend::Zero, Width::Word) => (0..=0xFFFF).contains(&value),
        (Extend::Zero, Width::Double) => (0..=0xFFFF_FFFF).contains(&value),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    A,
    B,
    C,
    D,
    I,
    J,
    K,
    L,
    Bp,
    Sp,
}

impl Register {
    pub const fn encode(self) -> u8 {
        match self {
            Self::A => 0,
            Self::B => 1,
            Self::C => 2,
            Self::D => 3,
            Self::I => 4,
            Self::J => 5,
            Self::K => 6,
            Self::L => 7,
            Self::Bp => 8,
            Self::Sp => 9,
        }
    }

    pub const fn from_encoding(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::A),
            1 => Some(Self::B),
            2 => Some(Self::C),
            3 => Some(Self::D),
            4 => Some(Self::I),
            5 => Some(Self::J),
            6 => Some(Self::K),
            7 => Some(Self::L),
            8 => Some(Self::Bp),
            9 => Some(Self::Sp),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
            Self::C => "c",
            Self::D => "d",
            Self::I => "i",
            Self::J => "j",
            Self::K => "k",
            Self::L => "l",
            Self::Bp => "bp",
            Self::Sp => "sp",
        }
    }

    pub const fn is_index(self) -> bool {
        matches!(self, Self::I | Self::J | Self::K | Self::L)
    }
}

/// Operand byte layout of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandForm {
    None,
    Reg,
    RegReg,
    RegImm(Width),
    RegMem,
    MemReg,
    MemImm(Width),
    Imm(Width),
    Rel(Width),
    Rim,
}

/// Encoded byte count of a memory operand (two header bytes + displacement).
pub const MEM_OPERAND_SIZE: usize = 6;

/// Rim prefix byte values. Register selection uses the low nibble.
pub const RIM_REGISTER: u8 = 0x00;
pub const RIM_MEMORY: u8 = 0x10;
pub const RIM_IMMEDIATE: u8 = 0x20;

/// Nibble marking an absent base or index register in a memory header.
pub const MEM_NO_REGISTER: u8 = 0xF;

macro_rules! opcodes {
    ($(($byte:literal, $variant:ident, $mnemonic:literal, $form:expr)),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($variant = $byte),*
        }

        impl Opcode {
            pub const fn from_byte(byte: u8) -> Option<Self> {
                match byte {
                    $($byte => Some(Self::$variant),)*
                    _ => None,
                }
            }

            pub const fn byte(self) -> u8 {
                self as u8
            }

            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $(Self::$variant => $mnemonic),*
                }
            }

            pub const fn form(self) -> OperandForm {
                match self {
                    $(Self::$variant => $form),*
                }
            }
        }
    };
}

opcodes![
    (0x00, Nop, "nop", OperandForm::None),
    (0x01, Hlt, "hlt", OperandForm::None),
    // moves
    (0x10, MovRegReg, "mov", OperandForm::RegReg),
    (0x11, MovRegImm, "mov", OperandForm::RegImm(Width::Double)),
    (0x12, MovRegImm16, "mov", OperandForm::RegImm(Width::Word)),
    (0x13, MovRegImm8, "mov", OperandForm::RegImm(Width::Byte)),
    (0x14, MovRegMem, "mov", OperandForm::RegMem),
    (0x15, MovMemReg, "mov", OperandForm::MemReg),
    (0x16, MovMemImm, "mov", OperandForm::MemImm(Width::Double)),
    // stack
    (0x20, Push, "push", OperandForm::Rim),
    (0x21, PushA, "push", OperandForm::None),
    (0x22, PushB, "push", OperandForm::None),
    (0x23, PushC, "push", OperandForm::None),
    (0x24, PushD, "push", OperandForm::None),
    (0x25, PushBp, "push", OperandForm::None),
    (0x26, PushImm, "push", OperandForm::Imm(Width::Double)),
    (0x28, Pop, "pop", OperandForm::Rim),
    (0x29, PopA, "pop", OperandForm::None),
    (0x2A, PopB, "pop", OperandForm::None),
    (0x2B, PopC, "pop", OperandForm::None),
    (0x2C, PopD, "pop", OperandForm::None),
    (0x2D, PopBp, "pop", OperandForm::None),
    // arithmetic and comparison
    (0x30, AddRegReg, "add", OperandForm::RegReg),
    (0x31, AddRegImm, "add", OperandForm::RegImm(Width::Double)),
    (0x32, AddRegImm8, "add", OperandForm::RegImm(Width::Byte)),
    (0x33, AddRegMem, "add", OperandForm::RegMem),
    (0x34, SubRegReg, "sub", OperandForm::RegReg),
    (0x35, SubRegImm, "sub", OperandForm::RegImm(Width::Double)),
    (0x36, SubRegImm8, "sub", OperandForm::RegImm(Width::Byte)),
    (0x37, SubRegMem, "sub", OperandForm::RegMem),
    (0x38, CmpRegReg, "cmp", OperandForm::RegReg),
    (0x39, CmpRegImm, "cmp", OperandForm::RegImm(Width::Double)),
    (0x3A, CmpRegImm8, "cmp", OperandForm::RegImm(Width::Byte)),
    (0x3B, CmpZ, "cmp", OperandForm::Reg),
    // bitwise
    (0x40, AndRegReg, "and", OperandForm::RegReg),
    (0x41, AndRegImm, "and", OperandForm::RegImm(Width::Double)),
    (0x42, AndRegImm8, "and", OperandForm::RegImm(Width::Byte)),
    (0x43, OrRegReg, "or", OperandForm::RegReg),
    (0x44, OrRegImm, "or", OperandForm::RegImm(Width::Double)),
    (0x45, OrRegImm8, "or", OperandForm::RegImm(Width::Byte)),
    (0x46, XorRegReg, "xor", OperandForm::RegReg),
    (0x47, XorRegImm, "xor", OperandForm::RegImm(Width::Double)),
    (0x48, XorRegImm8, "xor", OperandForm::RegImm(Width::Byte)),
    // increment/decrement, with and without carry
    (0x50, Inc, "inc", OperandForm::Reg),
    (0x51, IncI, "inc", OperandForm::None),
    (0x52, IncJ, "inc", OperandForm::None),
    (0x53, IncK, "inc", OperandForm::None),
    (0x54, IncL, "inc", OperandForm::None),
    (0x55, Icc, "icc", OperandForm::Reg),
    (0x56, IccI, "icc", OperandForm::None),
    (0x57, IccJ, "icc", OperandForm::None),
    (0x58, IccK, "icc", OperandForm::None),
    (0x59, IccL, "icc", OperandForm::None),
    (0x5A, Dec, "dec", OperandForm::Reg),
    (0x5B, DecI, "dec", OperandForm::None),
    (0x5C, DecJ, "dec", OperandForm::None),
    (0x5D, DecK, "dec", OperandForm::None),
    (0x5E, DecL, "dec", OperandForm::None),
    (0x60, Dcc, "dcc", OperandForm::Reg),
    (0x61, DccI, "dcc", OperandForm::None),
    (0x62, DccJ, "dcc", OperandForm::None),
    (0x63, DccK, "dcc", OperandForm::None),
    (0x64, DccL, "dcc", OperandForm::None),
    // control flow
    (0x70, JmpRel8, "jmp", OperandForm::Rel(Width::Byte)),
    (0x71, JmpRel16, "jmp", OperandForm::Rel(Width::Word)),
    (0x72, JmpRel32, "jmp", OperandForm::Rel(Width::Double)),
    (0x73, JmpAbs, "jmpa", OperandForm::Imm(Width::Double)),
    (0x74, JmpAbsRim, "jmpa", OperandForm::Rim),
    (0x75, CallRel16, "call", OperandForm::Rel(Width::Word)),
    (0x76, CallRel32, "call", OperandForm::Rel(Width::Double)),
    (0x77, CallAbs, "calla", OperandForm::Imm(Width::Double)),
    (0x78, CallAbsRim, "calla", OperandForm::Rim),
    (0x79, Ret, "ret", OperandForm::None),
    // conditional branches (relative only; no absolute forms exist)
    (0x80, JzRel8, "jz", OperandForm::Rel(Width::Byte)),
    (0x81, JzRel16, "jz", OperandForm::Rel(Width::Word)),
    (0x82, JzRel32, "jz", OperandForm::Rel(Width::Double)),
    (0x83, JnzRel8, "jnz", OperandForm::Rel(Width::Byte)),
    (0x84, JnzRel16, "jnz", OperandForm::Rel(Width::Word)),
    (0x85, JnzRel32, "jnz", OperandForm::Rel(Width::Double)),
    (0x86, JcRel8, "jc", OperandForm::Rel(Width::Byte)),
    (0x87, JcRel16, "jc", OperandForm::Rel(Width::Word)),
    (0x88, JcRel32, "jc", OperandForm::Rel(Width::Double)),
    (0x89, JncRel8, "jnc", OperandForm::Rel(Width::Byte)),
    (0x8A, JncRel16, "jnc", OperandForm::Rel(Width::Word)),
    (0x8B, JncRel32, "jnc", OperandForm::Rel(Width::Double)),
];

impl Opcode {
    /// The register a zero-operand alias stands for, if any.
    pub const fn implied_register(self) -> Option<Register> {
        match self {
            Self::PushA | Self::PopA => Some(Register::A),
            Self::PushB | Self::PopB => Some(Register::B),
            Self::PushC | Self::PopC => Some(Register::C),
            Self::PushD | Self::PopD => Some(Register::D),
            Self::PushBp | Self::PopBp => Some(Register::Bp),
            Self::IccI | Self::IncI | Self::DecI | Self::DccI => Some(Register::I),
            Self::IccJ | Self::IncJ | Self::DecJ | Self::DccJ => Some(Register::J),
            Self::IccK | Self::IncK | Self::DecK | Self::DccK => Some(Register::K),
            Self::IccL | Self::IncL | Self::DecL | Self::DccL => Some(Register::L),
            _ => None,
        }
    }
}

/// Extension rule applied to immediate operands of an opcode's family.
pub fn immediate_extend(op: Opcode) -> Extend {
    match op {
        Opcode::AddRegImm
        | Opcode::AddRegImm8
        | Opcode::SubRegImm
        | Opcode::SubRegImm8
        | Opcode::CmpRegImm
        | Opcode::CmpRegImm8
        | Opcode::AndRegImm
        | Opcode::AndRegImm8
        | Opcode::OrRegImm
        | Opcode::OrRegImm8
        | Opcode::XorRegImm
        | Opcode::XorRegImm8 => Extend::Sign,
        _ => Extend::Zero,
    }
}

/// Shorter same-family immediate encodings for a generic opcode, narrowest
/// first. Only the full-width (4-byte) family members have aliases.
pub fn immediate_aliases(op: Opcode) -> &'static [(Opcode, Width)] {
    match op {
        Opcode::MovRegImm => &[
            (Opcode::MovRegImm8, Width::Byte),
            (Opcode::MovRegImm16, Width::Word),
        ],
        Opcode::AddRegImm => &[(Opcode::AddRegImm8, Width::Byte)],
        Opcode::SubRegImm => &[(Opcode::SubRegImm8, Width::Byte)],
        Opcode::CmpRegImm => &[(Opcode::CmpRegImm8, Width::Byte)],
        Opcode::AndRegImm => &[(Opcode::AndRegImm8, Width::Byte)],
        Opcode::OrRegImm => &[(Opcode::OrRegImm8, Width::Byte)],
        Opcode::XorRegImm => &[(Opcode::XorRegImm8, Width::Byte)],
        _ => &[],
    }
}

/// Dedicated zero-comparison form for the compare-immediate family.
pub fn zero_compare_alias(op: Opcode) -> Option<Opcode> {
    match op {
        Opcode::CmpRegImm | Opcode::CmpRegImm8 => Some(Opcode::CmpZ),
        _ => None,
    }
}

/// One-byte alias for a register-operand opcode applied to a specific
/// register, if the instruction set defines one.
pub fn register_alias(op: Opcode, reg: Register) -> Option<Opcode> {
    match (op, reg) {
        (Opcode::Push, Register::A) => Some(Opcode::PushA),
        (Opcode::Push, Register::B) => Some(Opcode::PushB),
        (Opcode::Push, Register::C) => Some(Opcode::PushC),
        (Opcode::Push, Register::D) => Some(Opcode::PushD),
        (Opcode::Push, Register::Bp) => Some(Opcode::PushBp),
        (Opcode::Pop, Register::A) => Some(Opcode::PopA),
        (Opcode::Pop, Register::B) => Some(Opcode::PopB),
        (Opcode::Pop, Register::C) => Some(Opcode::PopC),
        (Opcode::Pop, Register::D) => Some(Opcode::PopD),
        (Opcode::Pop, Register::Bp) => Some(Opcode::PopBp),
        (Opcode::Inc, Register::I) => Some(Opcode::IncI),
        (Opcode::Inc, Register::J) => Some(Opcode::IncJ),
        (Opcode::Inc, Register::K) => Some(Opcode::IncK),
        (Opcode::Inc, Register::L) => Some(Opcode::IncL),
        (Opcode::Icc, Register::I) => Some(Opcode::IccI),
        (Opcode::Icc, Register::J) => Some(Opcode::IccJ),
        (Opcode::Icc, Register::K) => Some(Opcode::IccK),
        (Opcode::Icc, Register::L) => Some(Opcode::IccL),
        (Opcode::Dec, Register::I) => Some(Opcode::DecI),
        (Opcode::Dec, Register::J) => Some(Opcode::DecJ),
        (Opcode::Dec, Register::K) => Some(Opcode::DecK),
        (Opcode::Dec, Register::L) => Some(Opcode::DecL),
        (Opcode::Dcc, Register::I) => Some(Opcode::DccI),
        (Opcode::Dcc, Register::J) => Some(Opcode::DccJ),
        (Opcode::Dcc, Register::K) => Some(Opcode::DccK),
        (Opcode::Dcc, Register::L) => Some(Opcode::DccL),
        _ => None,
    }
}

/// Direct-immediate counterpart of a rim-form opcode, used when the operand
/// turned out not to need register or memory indirection.
pub fn direct_alias(op: Opcode) -> Option<Opcode> {
    match op {
        Opcode::JmpAbsRim => Some(Opcode::JmpAbs),
        Opcode::CallAbsRim => Some(Opcode::CallAbs),
        Opcode::Push => Some(Opcode::PushImm),
        _ => None,
    }
}

/// Absolute-addressing promotion target for a worst-case-width relative
/// control-flow opcode. Conditional branches have none.
pub fn absolute_alias(op: Opcode) -> Option<Opcode> {
    match op {
        Opcode::JmpRel32 => Some(Opcode::JmpAbs),
        Opcode::CallRel32 => Some(Opcode::CallAbs),
        _ => None,
    }
}

/// All relative encodings of the op's branch family, narrowest first.
pub fn relative_aliases(op: Opcode) -> &'static [(Opcode, Width)] {
    match op {
        Opcode::JmpRel8 | Opcode::JmpRel16 | Opcode::JmpRel32 => &[
            (Opcode::JmpRel8, Width::Byte),
            (Opcode::JmpRel16, Width::Word),
            (Opcode::JmpRel32, Width::Double),
        ],
        Opcode::CallRel16 | Opcode::CallRel32 => &[
            (Opcode::CallRel16, Width::Word),
            (Opcode::CallRel32, Width::Double),
        ],
        Opcode::JzRel8 | Opcode::JzRel16 | Opcode::JzRel32 => &[
            (Opcode::JzRel8, Width::Byte),
            (Opcode::JzRel16, Width::Word),
            (Opcode::JzRel32, Width::Double),
        ],
        Opcode::JnzRel8 | Opcode::JnzRel16 | Opcode::JnzRel32 => &[
            (Opcode::JnzRel8, Width::Byte),
            (Opcode::JnzRel16, Width::Word),
            (Opcode::JnzRel32, Width::Double),
        ],
        Opcode::JcRel8 | Opcode::JcRel16 | Opcode::JcRel32 => &[
            (Opcode::JcRel8, Width::Byte),
            (Opcode::JcRel16, Width::Word),
            (Opcode::JcRel32, Width::Double),
        ],
        Opcode::JncRel8 | Opcode::JncRel16 | Opcode::JncRel32 => &[
            (Opcode::JncRel8, Width::Byte),
            (Opcode::JncRel16, Width::Word),
            (Opcode::JncRel32, Width::Double),
        ],
        _ => &[],
    }
}

pub fn is_conditional_branch(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::JzRel8
            | Opcode::JzRel16
            | Opcode::JzRel32
            | Opcode::JnzRel8
            | Opcode::JnzRel16
            | Opcode::JnzRel32
            | Opcode::JcRel8
            | Opcode::JcRel16
            | Opcode::JcRel32
            | Opcode::JncRel8
            | Opcode::JncRel16
            | Opcode::JncRel32
    )
}

pub fn is_relative(op: Opcode) -> bool {
    matches!(op.form(), OperandForm::Rel(_))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedOperand {
    Register(Register),
    Immediate(i64),
    Relative(i32),
    Memory {
        base: Option<Register>,
        index: Option<Register>,
        scale: u8,
        displacement: i32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub opcode: Opcode,
    pub size: usize,
    pub dst: Option<DecodedOperand>,
    pub src: Option<DecodedOperand>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("cannot decode instruction from empty byte slice")]
    EmptyInput,
    #[error("unknown opcode {opcode:#04X}")]
    UnknownOpcode { opcode: u8 },
    #[error("truncated instruction for opcode {opcode:#04X}")]
    Truncated { opcode: u8 },
    #[error("invalid register encoding {value:#X}")]
    InvalidRegister { value: u8 },
    #[error("invalid memory scale {scale}")]
    InvalidScale { scale: u8 },
    #[error("invalid rim prefix byte {prefix:#04X}")]
    InvalidRim { prefix: u8 },
}

struct Cursor<'a> {
    opcode: u8,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.saturating_add(len);
        if end > self.bytes.len() {
            return Err(DecodeError::Truncated {
                opcode: self.opcode,
            });
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn register(&mut self) -> Result<Register, DecodeError> {
        let value = self.byte()?;
        Register::from_encoding(value).ok_or(DecodeError::InvalidRegister { value })
    }

    fn immediate(&mut self, width: Width, extend: Extend) -> Result<i64, DecodeError> {
        let raw = self.take(width.bytes())?;
        let mut value: u64 = 0;
        for (i, byte) in raw.iter().enumerate() {
            value |= u64::from(*byte) << (8 * i);
        }
        Ok(match (extend, width) {
            (Extend::Zero, _) => value as i64,
            (Extend::Sign, Width::Byte) => value as u8 as i8 as i64,
            (Extend::Sign, Width::Word) => value as u16 as i16 as i64,
            (Extend::Sign, Width::Double) => value as u32 as i32 as i64,
        })
    }

    fn memory(&mut self) -> Result<DecodedOperand, DecodeError> {
        let regs = self.byte()?;
        let base = decode_mem_register(regs >> 4)?;
        let index = decode_mem_register(regs & 0x0F)?;
        let scale = self.byte()?;
        if !matches!(scale, 1 | 2 | 4 | 8) {
            return Err(DecodeError::InvalidScale { scale });
        }
        let displacement = self.immediate(Width::Double, Extend::Sign)? as i32;
        Ok(DecodedOperand::Memory {
            base,
            index,
            scale,
            displacement,
        })
    }
}

fn decode_mem_register(nibble: u8) -> Result<Option<Register>, DecodeError> {
    if nibble == MEM_NO_REGISTER {
        return Ok(None);
    }
    Register::from_encoding(nibble)
        .map(Some)
        .ok_or(DecodeError::InvalidRegister { value: nibble })
}

/// Decodes one instruction from the front of `bytes`, mirroring the operand
/// rules the assembler encodes with.
pub fn decode_instruction(bytes: &[u8]) -> Result<DecodedInstruction, DecodeError> {
    let (&first, rest) = bytes.split_first().ok_or(DecodeError::EmptyInput)?;
    let opcode = Opcode::from_byte(first).ok_or(DecodeError::UnknownOpcode { opcode: first })?;
    let mut cursor = Cursor {
        opcode: first,
        bytes: rest,
        pos: 0,
    };

    let extend = immediate_extend(opcode);
    let (dst, src) = match opcode.form() {
        OperandForm::None => {
            let implied = opcode.implied_register().map(DecodedOperand::Register);
            (implied, None)
        }
        OperandForm::Reg => {
            let reg = DecodedOperand::Register(cursor.register()?);
            // The dedicated zero-compare form carries an implied zero.
            let src = (opcode == Opcode::CmpZ).then_some(DecodedOperand::Immediate(0));
            (Some(reg), src)
        }
        OperandForm::RegReg => {
            let packed = cursor.byte()?;
            let dst = Register::from_encoding(packed >> 4)
                .ok_or(DecodeError::InvalidRegister { value: packed >> 4 })?;
            let src = Register::from_encoding(packed & 0x0F).ok_or(DecodeError::InvalidRegister {
                value: packed & 0x0F,
            })?;
            (
                Some(DecodedOperand::Register(dst)),
                Some(DecodedOperand::Register(src)),
            )
        }
        OperandForm::RegImm(width) => {
            let reg = DecodedOperand::Register(cursor.register()?);
            let imm = DecodedOperand::Immediate(cursor.immediate(width, extend)?);
            (Some(reg), Some(imm))
        }
        OperandForm::RegMem => {
            let reg = DecodedOperand::Register(cursor.register()?);
            let mem = cursor.memory()?;
            (Some(reg), Some(mem))
        }
        OperandForm::MemReg => {
            let mem = cursor.memory()?;
            let reg = DecodedOperand::Register(cursor.register()?);
            (Some(mem), Some(reg))
        }
        OperandForm::MemImm(width) => {
            let mem = cursor.memory()?;
            let imm = DecodedOperand::Immediate(cursor.immediate(width, extend)?);
            (Some(mem), Some(imm))
        }
        OperandForm::Imm(width) => {
            let imm = DecodedOperand::Immediate(cursor.immediate(width, extend)?);
            (Some(imm), None)
        }
        OperandForm::Rel(width) => {
            let disp = cursor.immediate(width, Extend::Sign)? as i32;
            (Some(DecodedOperand::Relative(disp)), None)
        }
        OperandForm::Rim => {
            let prefix = cursor.byte()?;
            let operand = if prefix & 0xF0 == RIM_REGISTER {
                DecodedOperand::Register(
                    Register::from_encoding(prefix & 0x0F)
                        .ok_or(DecodeError::InvalidRim { prefix })?,
                )
            } else if prefix == RIM_MEMORY {
                cursor.memory()?
            } else if prefix == RIM_IMMEDIATE {
                DecodedOperand::Immediate(cursor.immediate(Width::Double, Extend::Zero)?)
            } else {
                return Err(DecodeError::InvalidRim { prefix });
            };
            (Some(operand), None)
        }
    };

    Ok(DecodedInstruction {
        opcode,
        size: 1 + cursor.pos,
        dst,
        src,
    })
}

/// Renders a decoded instruction, resolving relative displacements against
/// the instruction's own address.
pub fn format_instruction(decoded: &DecodedInstruction, address: u32) -> String {
    let mnemonic = decoded.opcode.mnemonic();
    let mut operands = Vec::new();
    for operand in [decoded.dst.as_ref(), decoded.src.as_ref()].into_iter().flatten() {
        operands.push(format_operand(operand, decoded, address));
    }
    if operands.is_empty() {
        mnemonic.to_string()
    } else {
        format!("{mnemonic} {}", operands.join(", "))
    }
}

fn format_operand(operand: &DecodedOperand, decoded: &DecodedInstruction, address: u32) -> String {
    match operand {
        DecodedOperand::Register(reg) => reg.name().to_string(),
        DecodedOperand::Immediate(value) => format!("{value}"),
        DecodedOperand::Relative(disp) => {
            let target = address
                .wrapping_add(decoded.size as u32)
                .wrapping_add_signed(*disp);
            format!("${target:08X}")
        }
        DecodedOperand::Memory {
            base,
            index,
            scale,
            displacement,
        } => {
            let mut parts = Vec::new();
            if let Some(base) = base {
                parts.push(base.name().to_string());
            }
            if let Some(index) = index {
                if *scale == 1 {
                    parts.push(index.name().to_string());
                } else {
                    parts.push(format!("{}*{scale}", index.name()));
                }
            }
            if *displacement != 0 || parts.is_empty() {
                parts.push(format!("{displacement}"));
            }
            format!("[{}]", parts.join(" + "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_register_immediate() {
        let decoded = decode_instruction(&[0x32, 0x00, 100]).expect("decode");
        assert_eq!(decoded.opcode, Opcode::AddRegImm8);
        assert_eq!(decoded.size, 3);
        assert_eq!(decoded.dst, Some(DecodedOperand::Register(Register::A)));
        assert_eq!(decoded.src, Some(DecodedOperand::Immediate(100)));
        assert_eq!(format_instruction(&decoded, 0), "add a, 100");
    }

    #[test]
    fn sign_extends_narrow_arithmetic_immediates() {
        let decoded = decode_instruction(&[0x32, 0x01, 0x9C]).expect("decode");
        assert_eq!(decoded.src, Some(DecodedOperand::Immediate(-100)));
    }

    #[test]
    fn zero_extends_narrow_mov_immediates() {
        let decoded = decode_instruction(&[0x13, 0x01, 0x9C]).expect("decode");
        assert_eq!(decoded.src, Some(DecodedOperand::Immediate(0x9C)));
    }

    #[test]
    fn decodes_implied_register_aliases() {
        let decoded = decode_instruction(&[0x51]).expect("decode");
        assert_eq!(decoded.opcode, Opcode::IncI);
        assert_eq!(decoded.size, 1);
        assert_eq!(format_instruction(&decoded, 0), "inc i");
    }

    #[test]
    fn zero_compare_carries_implied_zero() {
        let decoded = decode_instruction(&[0x3B, 0x02]).expect("decode");
        assert_eq!(decoded.dst, Some(DecodedOperand::Register(Register::C)));
        assert_eq!(decoded.src, Some(DecodedOperand::Immediate(0)));
        assert_eq!(format_instruction(&decoded, 0), "cmp c, 0");
    }

    #[test]
    fn decodes_memory_operand() {
        // mov a, [bp + i*4 + 8]
        let decoded =
            decode_instruction(&[0x14, 0x00, 0x84, 0x04, 0x08, 0x00, 0x00, 0x00]).expect("decode");
        assert_eq!(decoded.size, 8);
        assert_eq!(
            decoded.src,
            Some(DecodedOperand::Memory {
                base: Some(Register::Bp),
                index: Some(Register::I),
                scale: 4,
                displacement: 8,
            })
        );
        assert_eq!(format_instruction(&decoded, 0), "mov a, [bp + i*4 + 8]");
    }

    #[test]
    fn formats_relative_branch_target() {
        let decoded = decode_instruction(&[0x70, 0xFC]).expect("decode");
        assert_eq!(decoded.dst, Some(DecodedOperand::Relative(-4)));
        assert_eq!(format_instruction(&decoded, 0x10), "jmp $0000000E");
    }

    #[test]
    fn decodes_rim_variants() {
        let reg = decode_instruction(&[0x74, 0x03]).expect("decode");
        assert_eq!(reg.dst, Some(DecodedOperand::Register(Register::D)));

        let imm = decode_instruction(&[0x74, 0x20, 0x10, 0x00, 0x00, 0x00]).expect("decode");
        assert_eq!(imm.dst, Some(DecodedOperand::Immediate(0x10)));
        assert_eq!(imm.size, 6);

        let err = decode_instruction(&[0x74, 0x42]).expect_err("must fail");
        assert_eq!(err, DecodeError::InvalidRim { prefix: 0x42 });
    }

    #[test]
    fn rejects_unknown_opcode_and_truncation() {
        assert_eq!(
            decode_instruction(&[0xFF]),
            Err(DecodeError::UnknownOpcode { opcode: 0xFF })
        );
        assert_eq!(
            decode_instruction(&[0x31, 0x00, 0x01]),
            Err(DecodeError::Truncated { opcode: 0x31 })
        );
    }

    #[test]
    fn opcode_bytes_round_trip() {
        for byte in 0..=255u8 {
            if let Some(op) = Opcode::from_byte(byte) {
                assert_eq!(op.byte(), byte);
                assert!(!op.mnemonic().is_empty());
            }
        }
    }

    #[test]
    fn narrowing_alias_tables_shrink() {
        for (generic, aliases) in [
            (Opcode::MovRegImm, immediate_aliases(Opcode::MovRegImm)),
            (Opcode::AddRegImm, immediate_aliases(Opcode::AddRegImm)),
        ] {
            let OperandForm::RegImm(full) = generic.form() else {
                panic!("generic must be reg/imm");
            };
            for (alias, width) in aliases {
                assert!(*width < full);
                assert_eq!(alias.form(), OperandForm::RegImm(*width));
                assert_eq!(alias.mnemonic(), generic.mnemonic());
            }
        }
    }

    #[test]
    fn conditional_branches_have_no_absolute_alias() {
        assert_eq!(absolute_alias(Opcode::JzRel32), None);
        assert_eq!(absolute_alias(Opcode::JmpRel32), Some(Opcode::JmpAbs));
        assert!(is_conditional_branch(Opcode::JncRel16));
        assert!(!is_conditional_branch(Opcode::JmpRel16));
    }
}
