use crate::utils::number::SpecialOps;
use crate::vm::cpu::Cpu;
use crate::vm::exception::Exception;
use crate::vm::flags::{CpuFlag::*, Width};
use crate::vm::instr::Instruction;

/// Group 2 (C0/C1, D0-D3): ROL/ROR/RCL/RCR/SHL/SHR/SAL/SAR with the count
/// from an immediate, 1, or CL. The 386 masks the count to 5 bits; a masked
/// count of zero changes nothing, flags included.
pub fn group2(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let width = if insn.opcode & 1 == 0 { Width::Byte } else { insn.width() };
    let count = match insn.opcode {
        0xC0 | 0xC1 => insn.imm8() as u32,
        0xD0 | 0xD1 => 1,
        0xD2 | 0xD3 => cpu.registers.read_reg8(1) as u32, // CL
        _ => unreachable!(),
    } & 0x1F;

    if count == 0 {
        // Still touches memory operands for the fault semantics.
        let op = insn.rm_operand();
        let _ = cpu.read_operand(op, width)?;
        return Ok(());
    }

    let op = insn.rm_operand();
    let value = cpu.read_operand(op, width)?;
    let bits = width.bits();

    let (result, carry) = match insn.reg() {
        // ROL
        0b000 => {
            let c = count % bits;
            let result = if c == 0 {
                value
            } else {
                ((value << c) | (value >> (bits - c))) & width.mask()
            };
            (result, result & 1 != 0)
        }
        // ROR
        0b001 => {
            let c = count % bits;
            let result = if c == 0 {
                value
            } else {
                ((value >> c) | (value << (bits - c))) & width.mask()
            };
            (result, result & width.sign_bit() != 0)
        }
        // RCL
        0b010 => rotate_carry_left_w(value, count, cpu.flags.check(Carry), width),
        // RCR
        0b011 => rotate_carry_right_w(value, count, cpu.flags.check(Carry), width),
        // SHL/SAL
        0b100 | 0b110 => {
            let wide = (value as u64) << count;
            ((wide as u32) & width.mask(), (wide >> bits) & 1 != 0)
        }
        // SHR
        0b101 => {
            let result = ((value as u64) >> count) as u32;
            let carry = ((value as u64) >> (count - 1)) & 1 != 0;
            (result, carry)
        }
        // SAR
        0b111 => {
            let extended = match width {
                Width::Byte => value as u8 as i8 as i64,
                Width::Word => value as u16 as i16 as i64,
                Width::Dword => value as i32 as i64,
            };
            let result = ((extended >> count) as u32) & width.mask();
            let carry = (extended >> (count - 1)) & 1 != 0;
            (result, carry)
        }
        _ => unreachable!(),
    };

    let is_shift = insn.reg() & 0b100 != 0;
    cpu.flags.update(Carry, carry);
    if count == 1 {
        let overflow = match insn.reg() {
            // ROL/RCL: MSB(result) XOR CF
            0b000 | 0b010 => (result & width.sign_bit() != 0) != carry,
            // ROR/RCR: MSB XOR next-MSB of the result
            0b001 | 0b011 => {
                ((result >> (bits - 1)) ^ (result >> (bits - 2))) & 1 != 0
            }
            // SHL: MSB(result) XOR CF
            0b100 | 0b110 => (result & width.sign_bit() != 0) != carry,
            // SHR: MSB of the original value
            0b101 => value & width.sign_bit() != 0,
            // SAR: cleared
            0b111 => false,
            _ => unreachable!(),
        };
        cpu.flags.update(Overflow, overflow);
    }
    if is_shift {
        cpu.flags.set_result(result, width);
    }

    cpu.write_operand(op, width, result)
}

fn rotate_carry_left_w(value: u32, count: u32, carry: bool, width: Width) -> (u32, bool) {
    match width {
        Width::Byte => {
            let (r, c) = (value as u8).rotate_carry_left(count, carry);
            (r as u32, c)
        }
        Width::Word => {
            let (r, c) = (value as u16).rotate_carry_left(count, carry);
            (r as u32, c)
        }
        Width::Dword => value.rotate_carry_left(count, carry),
    }
}

fn rotate_carry_right_w(value: u32, count: u32, carry: bool, width: Width) -> (u32, bool) {
    match width {
        Width::Byte => {
            let (r, c) = (value as u8).rotate_carry_right(count, carry);
            (r as u32, c)
        }
        Width::Word => {
            let (r, c) = (value as u16).rotate_carry_right(count, carry);
            (r as u32, c)
        }
        Width::Dword => value.rotate_carry_right(count, carry),
    }
}

/// 0F A4/A5, AC/AD: SHLD/SHRD double-precision shifts.
pub fn shift_double(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let width = insn.width();
    let bits = width.bits();
    let count = match insn.opcode {
        0xA4 | 0xAC => insn.imm8() as u32,
        0xA5 | 0xAD => cpu.registers.read_reg8(1) as u32, // CL
        _ => unreachable!(),
    } & 0x1F;

    let op = insn.rm_operand();
    let value = cpu.read_operand(op, width)?;
    if count == 0 {
        return Ok(());
    }
    let filler = cpu.registers.read_reg(insn.reg(), width);
    let left = matches!(insn.opcode, 0xA4 | 0xA5);

    let (result, carry) = if left {
        let wide = (((value as u128) << bits) | filler as u128) << count;
        (
            ((wide >> bits) as u32) & width.mask(),
            (wide >> (2 * bits)) & 1 != 0,
        )
    } else {
        let wide = ((filler as u64) << bits) | value as u64;
        (
            ((wide >> count) as u32) & width.mask(),
            (wide >> (count - 1)) & 1 != 0,
        )
    };

    cpu.flags.update(Carry, carry);
    if count == 1 {
        cpu.flags
            .update(Overflow, (value ^ result) & width.sign_bit() != 0);
    }
    cpu.flags.set_result(result, width);
    cpu.write_operand(op, width, result)
}
