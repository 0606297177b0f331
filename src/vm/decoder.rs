use crate::vm::cpu::Cpu;
use crate::vm::exception::Exception;
use crate::vm::instr::{Instruction, Operand, RepKind};
use crate::vm::registers::SegReg;
use crate::utils::number::extend_sign32;

/// Immediate bytes following the opcode (and ModR/M, when present).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImmKind {
    None,
    /// One byte.
    Ib,
    /// One word regardless of operand size (RET imm16).
    Iw,
    /// Word or dword per the operand size.
    Iv,
    /// Far pointer: v-sized offset then a word selector.
    Ptr,
    /// a-sized direct offset (MOV moffs forms).
    Moffs,
    /// ENTER: word frame size then byte nesting level.
    Enter,
}

fn one_byte_has_modrm(opcode: u8) -> bool {
    matches!(opcode,
        0x00..=0x03 | 0x08..=0x0B | 0x10..=0x13 | 0x18..=0x1B
        | 0x20..=0x23 | 0x28..=0x2B | 0x30..=0x33 | 0x38..=0x3B
        | 0x62 | 0x63 | 0x69 | 0x6B
        | 0x80..=0x8F
        | 0xC0 | 0xC1 | 0xC4..=0xC7
        | 0xD0..=0xD3 | 0xD8..=0xDF
        | 0xF6 | 0xF7 | 0xFE | 0xFF)
}

fn two_byte_has_modrm(opcode: u8) -> bool {
    matches!(opcode,
        0x00..=0x03 | 0x20..=0x23
        | 0x90..=0x9F
        | 0xA3 | 0xA4 | 0xA5 | 0xAB | 0xAC | 0xAD | 0xAF
        | 0xB2..=0xB7 | 0xBA..=0xBF)
}

fn one_byte_imm(opcode: u8) -> ImmKind {
    match opcode {
        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => ImmKind::Ib,
        0x6A | 0x6B => ImmKind::Ib,
        0x70..=0x7F => ImmKind::Ib,
        0x80 | 0x82 | 0x83 => ImmKind::Ib,
        0xA8 => ImmKind::Ib,
        0xB0..=0xB7 => ImmKind::Ib,
        0xC0 | 0xC1 | 0xC6 => ImmKind::Ib,
        0xCD => ImmKind::Ib,
        0xD4 | 0xD5 => ImmKind::Ib,
        0xE0..=0xE7 => ImmKind::Ib,
        0xEB => ImmKind::Ib,

        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => ImmKind::Iv,
        0x68 | 0x69 | 0x81 | 0xA9 => ImmKind::Iv,
        0xB8..=0xBF | 0xC7 | 0xE8 | 0xE9 => ImmKind::Iv,

        0xC2 | 0xCA => ImmKind::Iw,
        0x9A | 0xEA => ImmKind::Ptr,
        0xA0..=0xA3 => ImmKind::Moffs,
        0xC8 => ImmKind::Enter,
        _ => ImmKind::None,
    }
}

fn two_byte_imm(opcode: u8) -> ImmKind {
    match opcode {
        0x80..=0x8F => ImmKind::Iv,
        0xA4 | 0xAC | 0xBA => ImmKind::Ib,
        _ => ImmKind::None,
    }
}

impl Cpu {
    /// Consume one instruction from CS:EIP. Fetch faults propagate; an
    /// unknown opcode still yields an Instruction (marked through the
    /// dispatch table) so the dispatcher can raise #UD with EIP rewound.
    pub fn decode(&mut self) -> Result<Instruction, Exception> {
        let default_32 = self.code_32();
        let mut seg_override: Option<SegReg> = None;
        let mut rep: Option<RepKind> = None;
        let mut lock = false;
        let mut op_override = false;
        let mut a_override = false;

        let opcode = loop {
            let byte = self.fetch8()?;
            match byte {
                0x26 => seg_override = Some(SegReg::ES),
                0x2E => seg_override = Some(SegReg::CS),
                0x36 => seg_override = Some(SegReg::SS),
                0x3E => seg_override = Some(SegReg::DS),
                0x64 => seg_override = Some(SegReg::FS),
                0x65 => seg_override = Some(SegReg::GS),
                0x66 => op_override = true,
                0x67 => a_override = true,
                0xF0 => lock = true,
                0xF2 => rep = Some(RepKind::RepNe),
                0xF3 => rep = Some(RepKind::Rep),
                _ => break byte,
            }
        };

        let op32 = default_32 ^ op_override;
        let a32 = default_32 ^ a_override;

        let (opcode, two_byte) = if opcode == 0x0F {
            (self.fetch8()?, true)
        } else {
            (opcode, false)
        };

        let mut insn = Instruction {
            opcode,
            two_byte,
            op32,
            a32,
            modrm: None,
            operand: None,
            seg_override,
            rep,
            lock,
            imm: 0,
            imm2: 0,
            invalid: false,
        };

        let has_modrm = if two_byte {
            two_byte_has_modrm(opcode)
        } else {
            one_byte_has_modrm(opcode)
        };
        if has_modrm {
            let (modrm, operand) = self.decode_modrm(a32, seg_override)?;
            insn.modrm = Some(modrm);
            insn.operand = Some(operand);
        }

        let imm_kind = if two_byte {
            two_byte_imm(opcode)
        } else {
            match opcode {
                // Group 3: only TEST (reg 0/1) takes an immediate.
                0xF6 => {
                    if insn.reg() < 2 {
                        ImmKind::Ib
                    } else {
                        ImmKind::None
                    }
                }
                0xF7 => {
                    if insn.reg() < 2 {
                        ImmKind::Iv
                    } else {
                        ImmKind::None
                    }
                }
                _ => one_byte_imm(opcode),
            }
        };

        match imm_kind {
            ImmKind::None => {}
            ImmKind::Ib => insn.imm = self.fetch8()? as u32,
            ImmKind::Iw => insn.imm = self.fetch16()? as u32,
            ImmKind::Iv => {
                insn.imm = if op32 {
                    self.fetch32()?
                } else {
                    self.fetch16()? as u32
                };
            }
            ImmKind::Ptr => {
                insn.imm = if op32 {
                    self.fetch32()?
                } else {
                    self.fetch16()? as u32
                };
                insn.imm2 = self.fetch16()? as u32;
            }
            ImmKind::Moffs => {
                let offset = if a32 {
                    self.fetch32()?
                } else {
                    self.fetch16()? as u32
                };
                insn.operand = Some(Operand::Mem {
                    seg: seg_override.unwrap_or(SegReg::DS),
                    offset,
                });
            }
            ImmKind::Enter => {
                insn.imm = self.fetch16()? as u32;
                insn.imm2 = self.fetch8()? as u32;
            }
        }

        Ok(insn)
    }

    fn decode_modrm(
        &mut self,
        a32: bool,
        seg_override: Option<SegReg>,
    ) -> Result<(u8, Operand), Exception> {
        let modrm = self.fetch8()?;
        let mode = modrm >> 6;
        let rm = modrm & 0b111;

        if mode == 0b11 {
            return Ok((modrm, Operand::Reg(rm)));
        }

        let (offset, default_seg) = if a32 {
            self.effective_address32(mode, rm)?
        } else {
            self.effective_address16(mode, rm)?
        };

        let seg = seg_override.unwrap_or(default_seg);
        Ok((modrm, Operand::Mem { seg, offset }))
    }

    /// 16-bit effective-address formulas: BX+SI, BX+DI, BP+SI, BP+DI, SI,
    /// DI, disp16/BP, BX. BP-based forms default to SS.
    fn effective_address16(
        &mut self,
        mode: u8,
        rm: u8,
    ) -> Result<(u32, SegReg), Exception> {
        let regs = &self.registers;
        let bx = regs.read_reg16(3);
        let bp = regs.read_reg16(5);
        let si = regs.read_reg16(6);
        let di = regs.read_reg16(7);

        let (base, default_seg) = match rm {
            0b000 => (bx.wrapping_add(si), SegReg::DS),
            0b001 => (bx.wrapping_add(di), SegReg::DS),
            0b010 => (bp.wrapping_add(si), SegReg::SS),
            0b011 => (bp.wrapping_add(di), SegReg::SS),
            0b100 => (si, SegReg::DS),
            0b101 => (di, SegReg::DS),
            0b110 => {
                if mode == 0b00 {
                    let disp = self.fetch16()?;
                    return Ok((disp as u32, SegReg::DS));
                }
                (bp, SegReg::SS)
            }
            0b111 => (bx, SegReg::DS),
            _ => unreachable!(),
        };

        let offset = match mode {
            0b00 => base,
            0b01 => base.wrapping_add(self.fetch8()? as i8 as i16 as u16),
            0b10 => base.wrapping_add(self.fetch16()?),
            _ => unreachable!(),
        };
        Ok((offset as u32, default_seg))
    }

    /// 32-bit effective addresses with the SIB byte. SS is the default
    /// segment when EBP or ESP supplies the base.
    fn effective_address32(
        &mut self,
        mode: u8,
        rm: u8,
    ) -> Result<(u32, SegReg), Exception> {
        let (base, default_seg) = match rm {
            0b100 => {
                let sib = self.fetch8()?;
                let scale = sib >> 6;
                let index = (sib >> 3) & 0b111;
                let base_reg = sib & 0b111;

                let index_part = if index == 0b100 {
                    0
                } else {
                    self.registers.read_reg32(index) << scale
                };

                if base_reg == 0b101 && mode == 0b00 {
                    let disp = self.fetch32()?;
                    (disp.wrapping_add(index_part), SegReg::DS)
                } else {
                    let seg = if base_reg == 0b100 || base_reg == 0b101 {
                        SegReg::SS
                    } else {
                        SegReg::DS
                    };
                    (
                        self.registers.read_reg32(base_reg).wrapping_add(index_part),
                        seg,
                    )
                }
            }
            0b101 => {
                if mode == 0b00 {
                    let disp = self.fetch32()?;
                    return Ok((disp, SegReg::DS));
                }
                (self.registers.read_reg32(rm), SegReg::SS)
            }
            _ => (self.registers.read_reg32(rm), SegReg::DS),
        };

        let offset = match mode {
            0b00 => base,
            0b01 => base.wrapping_add(extend_sign32(self.fetch8()?)),
            0b10 => base.wrapping_add(self.fetch32()?),
            _ => unreachable!(),
        };
        Ok((offset, default_seg))
    }
}
