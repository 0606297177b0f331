use num_traits::FromPrimitive;

use crate::vm::cpu::Cpu;
use crate::vm::exception::Exception;
use crate::vm::flags::Width;
use crate::vm::instr::{Instruction, Operand};
use crate::vm::registers::{SegReg, EAX, EBX};

/// 88-8B: MOV between r/m and reg, direction and width from the opcode.
pub fn mov_rm_reg(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let width = if insn.opcode & 1 == 0 { Width::Byte } else { insn.width() };
    if insn.opcode & 2 == 0 {
        let value = cpu.registers.read_reg(insn.reg(), width);
        cpu.write_operand(insn.rm_operand(), width, value)
    } else {
        let value = cpu.read_operand(insn.rm_operand(), width)?;
        cpu.registers.write_reg(insn.reg(), width, value);
        Ok(())
    }
}

/// 8C: MOV r/m16, Sreg. Register destinations zero-extend to the operand
/// size; memory destinations always store 16 bits.
pub fn mov_rm_sreg(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let Some(seg) = SegReg::from_u8(insn.reg()) else {
        return Err(Exception::InvalidOpcode);
    };
    let selector = cpu.registers.seg(seg).selector;
    match insn.rm_operand() {
        Operand::Reg(reg) => {
            cpu.registers.write_reg(reg, insn.width(), selector as u32);
            Ok(())
        }
        mem => cpu.write_operand(mem, Width::Word, selector as u32),
    }
}

/// 8E: MOV Sreg, r/m16. CS is not a valid destination; SS loads inhibit
/// interrupts for one instruction.
pub fn mov_sreg_rm(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let seg = match SegReg::from_u8(insn.reg()) {
        Some(SegReg::CS) | None => return Err(Exception::InvalidOpcode),
        Some(seg) => seg,
    };
    let selector = cpu.read_rm16(insn)?;
    cpu.write_segment_register(seg, selector)?;
    if seg == SegReg::SS {
        cpu.interrupt_inhibit = true;
    }
    Ok(())
}

/// A0-A3: accumulator to/from direct offset.
pub fn mov_moffs(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let width = if insn.opcode & 1 == 0 { Width::Byte } else { insn.width() };
    if insn.opcode & 2 == 0 {
        let value = cpu.read_operand(insn.rm_operand(), width)?;
        cpu.registers.write_reg(EAX, width, value);
        Ok(())
    } else {
        let value = cpu.registers.read_reg(EAX, width);
        cpu.write_operand(insn.rm_operand(), width, value)
    }
}

/// B0-BF: MOV reg, imm.
pub fn mov_reg_imm(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let reg = insn.opcode & 0b111;
    if insn.opcode & 0x08 == 0 {
        cpu.registers.write_reg8(reg, insn.imm8());
    } else {
        cpu.registers.write_reg(reg, insn.width(), insn.imm_sized());
    }
    Ok(())
}

/// C6/C7: MOV r/m, imm. Only reg=0 is defined.
pub fn mov_rm_imm(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    if insn.reg() != 0 {
        return Err(Exception::InvalidOpcode);
    }
    let width = if insn.opcode & 1 == 0 { Width::Byte } else { insn.width() };
    cpu.write_operand(insn.rm_operand(), width, insn.imm & width.mask())
}

/// 8D: LEA reg, mem. A register operand has no address to take.
pub fn lea(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let Operand::Mem { offset, .. } = insn.rm_operand() else {
        return Err(Exception::InvalidOpcode);
    };
    cpu.registers.write_reg(insn.reg(), insn.width(), offset);
    Ok(())
}

/// 86/87: XCHG r/m, reg.
pub fn xchg_rm_reg(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let width = if insn.opcode & 1 == 0 { Width::Byte } else { insn.width() };
    let op = insn.rm_operand();
    let rm_value = cpu.read_operand(op, width)?;
    let reg_value = cpu.registers.read_reg(insn.reg(), width);
    cpu.write_operand(op, width, reg_value)?;
    cpu.registers.write_reg(insn.reg(), width, rm_value);
    Ok(())
}

/// 91-97: XCHG accumulator, reg.
pub fn xchg_acc_reg(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let width = insn.width();
    let reg = insn.opcode & 0b111;
    let acc = cpu.registers.read_reg(EAX, width);
    let other = cpu.registers.read_reg(reg, width);
    cpu.registers.write_reg(EAX, width, other);
    cpu.registers.write_reg(reg, width, acc);
    Ok(())
}

/// 90: NOP (XCHG eAX, eAX).
pub fn nop(_cpu: &mut Cpu, _insn: &Instruction) -> Result<(), Exception> {
    Ok(())
}

/// D7: XLAT: AL = [(E)BX + AL].
pub fn xlat(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let al = cpu.registers.read_reg8(0) as u32;
    let offset = if insn.a32 {
        cpu.registers.read_reg32(EBX).wrapping_add(al)
    } else {
        (cpu.registers.read_reg16(EBX).wrapping_add(al as u16)) as u32
    };
    let value = cpu.read_mem8(insn.data_segment(), offset)?;
    cpu.registers.write_reg8(0, value);
    Ok(())
}

/// C4 LES / C5 LDS and 0F B2/B4/B5 LSS/LFS/LGS: load a far pointer from
/// memory into a segment:register pair.
pub fn load_far_pointer(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let seg = if insn.two_byte {
        match insn.opcode {
            0xB2 => SegReg::SS,
            0xB4 => SegReg::FS,
            0xB5 => SegReg::GS,
            _ => unreachable!(),
        }
    } else {
        match insn.opcode {
            0xC4 => SegReg::ES,
            0xC5 => SegReg::DS,
            _ => unreachable!(),
        }
    };

    let Operand::Mem { seg: mem_seg, offset } = insn.rm_operand() else {
        return Err(Exception::InvalidOpcode);
    };

    let (value, selector) = if insn.op32 {
        let value = cpu.read_mem32(mem_seg, offset)?;
        let selector = cpu.read_mem16(mem_seg, offset.wrapping_add(4))?;
        (value, selector)
    } else {
        let value = cpu.read_mem16(mem_seg, offset)? as u32;
        let selector = cpu.read_mem16(mem_seg, offset.wrapping_add(2))?;
        (value, selector)
    };

    cpu.write_segment_register(seg, selector)?;
    cpu.registers.write_reg(insn.reg(), insn.width(), value);
    Ok(())
}

/// 0F B6/B7: MOVZX, 0F BE/BF: MOVSX.
pub fn mov_extend(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let src_width = if insn.opcode & 1 == 0 { Width::Byte } else { Width::Word };
    let value = cpu.read_operand(insn.rm_operand(), src_width)?;
    let extended = if insn.opcode & 0x08 == 0 {
        value
    } else {
        match src_width {
            Width::Byte => value as u8 as i8 as i32 as u32,
            _ => value as u16 as i16 as i32 as u32,
        }
    };
    cpu.registers.write_reg(insn.reg(), insn.width(), extended);
    Ok(())
}

/// 0F 90-9F: SETcc r/m8.
pub fn setcc(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let value = cpu.condition(insn.opcode & 0x0F) as u32;
    cpu.write_operand(insn.rm_operand(), Width::Byte, value)
}
