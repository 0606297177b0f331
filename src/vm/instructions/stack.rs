use num_traits::FromPrimitive;

use crate::vm::cpu::Cpu;
use crate::vm::exception::Exception;
use crate::vm::flags::{CpuFlag, IOPL_MASK};
use crate::vm::instr::Instruction;
use crate::vm::registers::{SegReg, EBP, ESP};
use crate::vm::stack::Popper;

/// 50-57: PUSH reg. The 386 pushes the pre-decrement value even for ESP.
pub fn push_reg(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let value = cpu.registers.read_reg(insn.opcode & 0b111, insn.width());
    cpu.push_sized(value, insn.op32)
}

/// 58-5F: POP reg.
pub fn pop_reg(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let value = cpu.pop_sized(insn.op32)?;
    cpu.registers
        .write_reg(insn.opcode & 0b111, insn.width(), value);
    Ok(())
}

/// 68 / 6A: PUSH imm (6A sign-extends a byte).
pub fn push_imm(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let value = if insn.opcode == 0x6A {
        insn.imm8() as i8 as i32 as u32
    } else {
        insn.imm
    };
    cpu.push_sized(value, insn.op32)
}

/// 8F: POP r/m (reg field must be 0).
pub fn pop_rm(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    if insn.reg() != 0 {
        return Err(Exception::InvalidOpcode);
    }
    let value = cpu.pop_sized(insn.op32)?;
    cpu.write_rm(insn, value)
}

fn sreg_of(insn: &Instruction) -> SegReg {
    if insn.two_byte {
        match insn.opcode {
            0xA0 | 0xA1 => SegReg::FS,
            _ => SegReg::GS,
        }
    } else {
        SegReg::from_u8((insn.opcode >> 3) & 0b11).unwrap()
    }
}

/// 06/0E/16/1E, 0F A0/A8: PUSH Sreg.
pub fn push_sreg(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let selector = cpu.registers.seg(sreg_of(insn)).selector;
    cpu.push_sized(selector as u32, insn.op32)
}

/// 07/17/1F, 0F A1/A9: POP Sreg. POP SS inhibits interrupts once.
pub fn pop_sreg(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let seg = sreg_of(insn);
    let mut popper = Popper::new();
    let selector = popper.pop_sized(cpu, insn.op32)? as u16;
    cpu.write_segment_register(seg, selector)?;
    popper.commit(cpu);
    if seg == SegReg::SS {
        cpu.interrupt_inhibit = true;
    }
    Ok(())
}

/// 60: PUSHA(D). The saved SP slot holds the value before the first push.
pub fn pusha(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let original_sp = cpu.registers.read_reg(ESP, insn.width());
    for reg in 0..8u8 {
        let value = if reg == ESP {
            original_sp
        } else {
            cpu.registers.read_reg(reg, insn.width())
        };
        cpu.push_sized(value, insn.op32)?;
    }
    Ok(())
}

/// 61: POPA(D). The SP slot is discarded.
pub fn popa(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    for reg in (0..8u8).rev() {
        let value = cpu.pop_sized(insn.op32)?;
        if reg != ESP {
            cpu.registers.write_reg(reg, insn.width(), value);
        }
    }
    Ok(())
}

/// 9C: PUSHF(D). VM86 with IOPL < 3 may not read the real flags.
pub fn pushf(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    if cpu.vm86() && cpu.flags.iopl() < 3 {
        return Err(Exception::gp0());
    }
    // VM and RF never appear on the stack.
    let value = cpu.flags.eflags() & !0x0003_0000;
    cpu.push_sized(value, insn.op32)
}

/// 9D: POPF(D). IOPL changes only at CPL 0; IF only when CPL <= IOPL.
pub fn popf(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    if cpu.vm86() && cpu.flags.iopl() < 3 {
        return Err(Exception::gp0());
    }
    let value = cpu.pop_sized(insn.op32)?;

    let mut mask: u32 = if insn.op32 { 0x0024_7FD7 } else { 0x0000_7FD7 };
    // VM and RF are never touched by POPF.
    mask &= !0x0003_0000;
    if cpu.protected_mode() {
        if cpu.cpl > 0 {
            mask &= !IOPL_MASK;
        }
        if cpu.cpl > cpu.flags.iopl() {
            mask &= !(1 << CpuFlag::Interrupt as u8);
        }
    }
    cpu.flags.set_eflags_masked(value, mask);
    Ok(())
}

/// C8: ENTER imm16, imm8.
pub fn enter(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let frame_size = insn.imm16() as u32;
    let nesting = (insn.imm2 & 0x1F) as u32;
    let op_bytes: u32 = if insn.op32 { 4 } else { 2 };

    let ebp = cpu.registers.read_reg32(EBP);
    cpu.push_sized(ebp, insn.op32)?;
    let frame = cpu.registers.esp();

    if nesting > 0 {
        let mask = cpu.stack_mask();
        let mut display = ebp;
        for _ in 1..nesting {
            display = display.wrapping_sub(op_bytes) & mask;
            let value = if insn.op32 {
                cpu.read_mem32(SegReg::SS, display)?
            } else {
                cpu.read_mem16(SegReg::SS, display)? as u32
            };
            cpu.push_sized(value, insn.op32)?;
        }
        cpu.push_sized(frame, insn.op32)?;
    }

    let mask = cpu.stack_mask();
    cpu.registers
        .write_reg32(EBP, (ebp & !mask) | (frame & mask));
    let esp = cpu.registers.esp();
    let new_esp = esp.wrapping_sub(frame_size) & mask;
    cpu.registers.set_esp((esp & !mask) | new_esp);
    Ok(())
}

/// C9: LEAVE.
pub fn leave(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let mask = cpu.stack_mask();
    let ebp = cpu.registers.read_reg32(EBP);
    let esp = cpu.registers.esp();
    cpu.registers.set_esp((esp & !mask) | (ebp & mask));
    let value = cpu.pop_sized(insn.op32)?;
    cpu.registers.write_reg(EBP, insn.width(), value);
    Ok(())
}
