use num_derive::FromPrimitive;

use crate::vm::flags::Width;
use crate::vm::registers::SegReg;

/// Where a ModR/M r/m operand lives: a register of the current bank, or a
/// (segment, offset) location resolved by the decoder.
#[derive(Debug, Clone, Copy)]
pub enum Operand {
    Reg(u8),
    Mem { seg: SegReg, offset: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum RepKind {
    /// F2: REPNE/REPNZ
    RepNe = 0,
    /// F3: REP/REPE/REPZ
    Rep = 1,
}

/// One decoded instruction. The decoder has already consumed prefixes,
/// opcode bytes, ModR/M + SIB + displacement and immediates; EIP points
/// past the instruction when a handler runs.
#[derive(Debug, Clone, Copy)]
pub struct Instruction {
    pub opcode: u8,
    /// Second-byte (0F-prefixed) opcode table.
    pub two_byte: bool,
    /// Effective operand size after the CS default and any 0x66 prefix.
    pub op32: bool,
    /// Effective address size after the CS default and any 0x67 prefix.
    pub a32: bool,
    pub modrm: Option<u8>,
    pub operand: Option<Operand>,
    pub seg_override: Option<SegReg>,
    pub rep: Option<RepKind>,
    pub lock: bool,
    pub imm: u32,
    /// Far-pointer selector, ENTER nesting level, 3-operand IMUL factor.
    pub imm2: u32,
    /// Undefined opcode or malformed encoding; dispatch raises #UD.
    pub invalid: bool,
}

impl Instruction {
    /// The reg field of the ModR/M byte (register index or group opcode).
    #[inline]
    pub fn reg(&self) -> u8 {
        (self.modrm.expect("instruction has no ModR/M") >> 3) & 0b111
    }

    #[inline]
    pub fn rm_operand(&self) -> Operand {
        self.operand.expect("instruction has no r/m operand")
    }

    /// Width of the v-sized operand (16 or 32 bits per the operand size).
    #[inline]
    pub fn width(&self) -> Width {
        Width::from_op32(self.op32)
    }

    #[inline]
    pub fn imm8(&self) -> u8 {
        self.imm as u8
    }

    #[inline]
    pub fn imm16(&self) -> u16 {
        self.imm as u16
    }

    /// The immediate masked to the operand size.
    #[inline]
    pub fn imm_sized(&self) -> u32 {
        if self.op32 {
            self.imm
        } else {
            self.imm & 0xFFFF
        }
    }

    /// Default data segment for non-ModR/M memory references, honoring the
    /// segment override.
    #[inline]
    pub fn data_segment(&self) -> SegReg {
        self.seg_override.unwrap_or(SegReg::DS)
    }
}
