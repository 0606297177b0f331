use crate::vm::cpu::Cpu;
use crate::vm::exception::Exception;
use crate::vm::flags::{CpuFlag::*, Width};
use crate::vm::instr::{Instruction, RepKind};
use crate::vm::instructions::alu::oc_sub_w;
use crate::vm::instructions::aux_carry;
use crate::vm::registers::{SegReg, EAX, ECX, EDI, EDX, ESI};

fn width_of(insn: &Instruction) -> Width {
    if insn.opcode & 1 == 0 {
        Width::Byte
    } else {
        insn.width()
    }
}

/// Read an index register at the address size.
fn index(cpu: &Cpu, insn: &Instruction, reg: u8) -> u32 {
    if insn.a32 {
        cpu.registers.read_reg32(reg)
    } else {
        cpu.registers.read_reg16(reg) as u32
    }
}

/// Step SI/DI by the element size in the DF direction.
fn step_index(cpu: &mut Cpu, insn: &Instruction, reg: u8, width: Width) {
    let step = width.bits() / 8;
    let down = cpu.flags.check(Directional);
    if insn.a32 {
        let value = cpu.registers.read_reg32(reg);
        let new = if down {
            value.wrapping_sub(step)
        } else {
            value.wrapping_add(step)
        };
        cpu.registers.write_reg32(reg, new);
    } else {
        let value = cpu.registers.read_reg16(reg);
        let new = if down {
            value.wrapping_sub(step as u16)
        } else {
            value.wrapping_add(step as u16)
        };
        cpu.registers.write_reg16(reg, new);
    }
}

fn rep_count(cpu: &Cpu, insn: &Instruction) -> u32 {
    index(cpu, insn, ECX)
}

fn dec_rep_count(cpu: &mut Cpu, insn: &Instruction) {
    if insn.a32 {
        let value = cpu.registers.read_reg32(ECX).wrapping_sub(1);
        cpu.registers.write_reg32(ECX, value);
    } else {
        let value = cpu.registers.read_reg16(ECX).wrapping_sub(1);
        cpu.registers.write_reg16(ECX, value);
    }
}

fn read_element(cpu: &mut Cpu, seg: SegReg, offset: u32, width: Width) -> Result<u32, Exception> {
    match width {
        Width::Byte => cpu.read_mem8(seg, offset).map(u32::from),
        Width::Word => cpu.read_mem16(seg, offset).map(u32::from),
        Width::Dword => cpu.read_mem32(seg, offset),
    }
}

fn write_element(
    cpu: &mut Cpu,
    seg: SegReg,
    offset: u32,
    width: Width,
    value: u32,
) -> Result<(), Exception> {
    match width {
        Width::Byte => cpu.write_mem8(seg, offset, value as u8),
        Width::Word => cpu.write_mem16(seg, offset, value as u16),
        Width::Dword => cpu.write_mem32(seg, offset, value),
    }
}

fn compare_elements(cpu: &mut Cpu, a: u32, b: u32, width: Width) {
    let (result, of, cf) = oc_sub_w(a, b, width);
    cpu.set_arith_flags(result, width, of, cf, aux_carry(a, b, result));
}

/// A4/A5: MOVS.
pub fn movs(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let width = width_of(insn);
    let rep = insn.rep.is_some();
    loop {
        if rep && rep_count(cpu, insn) == 0 {
            break;
        }
        let src = index(cpu, insn, ESI);
        let value = read_element(cpu, insn.data_segment(), src, width)?;
        let dst = index(cpu, insn, EDI);
        write_element(cpu, SegReg::ES, dst, width, value)?;
        step_index(cpu, insn, ESI, width);
        step_index(cpu, insn, EDI, width);
        if !rep {
            break;
        }
        dec_rep_count(cpu, insn);
    }
    Ok(())
}

/// AA/AB: STOS.
pub fn stos(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let width = width_of(insn);
    let rep = insn.rep.is_some();
    loop {
        if rep && rep_count(cpu, insn) == 0 {
            break;
        }
        let value = cpu.registers.read_reg(EAX, width);
        let dst = index(cpu, insn, EDI);
        write_element(cpu, SegReg::ES, dst, width, value)?;
        step_index(cpu, insn, EDI, width);
        if !rep {
            break;
        }
        dec_rep_count(cpu, insn);
    }
    Ok(())
}

/// AC/AD: LODS.
pub fn lods(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let width = width_of(insn);
    let rep = insn.rep.is_some();
    loop {
        if rep && rep_count(cpu, insn) == 0 {
            break;
        }
        let src = index(cpu, insn, ESI);
        let value = read_element(cpu, insn.data_segment(), src, width)?;
        cpu.registers.write_reg(EAX, width, value);
        step_index(cpu, insn, ESI, width);
        if !rep {
            break;
        }
        dec_rep_count(cpu, insn);
    }
    Ok(())
}

/// A6/A7: CMPS. REPE continues on equal, REPNE on not-equal.
pub fn cmps(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let width = width_of(insn);
    let rep = insn.rep;
    loop {
        if rep.is_some() && rep_count(cpu, insn) == 0 {
            break;
        }
        let src = index(cpu, insn, ESI);
        let a = read_element(cpu, insn.data_segment(), src, width)?;
        let dst = index(cpu, insn, EDI);
        let b = read_element(cpu, SegReg::ES, dst, width)?;
        compare_elements(cpu, a, b, width);
        step_index(cpu, insn, ESI, width);
        step_index(cpu, insn, EDI, width);
        match rep {
            None => break,
            Some(kind) => {
                dec_rep_count(cpu, insn);
                let zero = cpu.flags.check(Zero);
                if (kind == RepKind::Rep) != zero {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// AE/AF: SCAS.
pub fn scas(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let width = width_of(insn);
    let rep = insn.rep;
    loop {
        if rep.is_some() && rep_count(cpu, insn) == 0 {
            break;
        }
        let acc = cpu.registers.read_reg(EAX, width);
        let dst = index(cpu, insn, EDI);
        let value = read_element(cpu, SegReg::ES, dst, width)?;
        compare_elements(cpu, acc, value, width);
        step_index(cpu, insn, EDI, width);
        match rep {
            None => break,
            Some(kind) => {
                dec_rep_count(cpu, insn);
                let zero = cpu.flags.check(Zero);
                if (kind == RepKind::Rep) != zero {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// 6C/6D: INS: port [DX] to ES:[DI].
pub fn ins(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let width = width_of(insn);
    let rep = insn.rep.is_some();
    let port = cpu.registers.read_reg16(EDX);
    loop {
        if rep && rep_count(cpu, insn) == 0 {
            break;
        }
        let value = cpu.io_in(port, width)?;
        let dst = index(cpu, insn, EDI);
        write_element(cpu, SegReg::ES, dst, width, value)?;
        step_index(cpu, insn, EDI, width);
        if !rep {
            break;
        }
        dec_rep_count(cpu, insn);
    }
    Ok(())
}

/// 6E/6F: OUTS: DS:[SI] to port [DX].
pub fn outs(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let width = width_of(insn);
    let rep = insn.rep.is_some();
    let port = cpu.registers.read_reg16(EDX);
    loop {
        if rep && rep_count(cpu, insn) == 0 {
            break;
        }
        let src = index(cpu, insn, ESI);
        let value = read_element(cpu, insn.data_segment(), src, width)?;
        cpu.io_out(port, width, value)?;
        step_index(cpu, insn, ESI, width);
        if !rep {
            break;
        }
        dec_rep_count(cpu, insn);
    }
    Ok(())
}
