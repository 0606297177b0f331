use crate::utils::number::SpecialOps;
use crate::vm::cpu::Cpu;
use crate::vm::exception::Exception;
use crate::vm::flags::{CpuFlag::*, Width};
use crate::vm::instr::{Instruction, Operand};
use crate::vm::instructions::aux_carry;
use crate::vm::registers::{EAX, EDX};

// ── Width-dispatched kernel wrappers ────────────────────────────────────

pub(super) fn oc_add_w(a: u32, b: u32, width: Width) -> (u32, bool, bool) {
    match width {
        Width::Byte => {
            let (r, o, c) = (a as u8).oc_add(b as u8);
            (r as u32, o, c)
        }
        Width::Word => {
            let (r, o, c) = (a as u16).oc_add(b as u16);
            (r as u32, o, c)
        }
        Width::Dword => a.oc_add(b),
    }
}

pub(super) fn oc_sub_w(a: u32, b: u32, width: Width) -> (u32, bool, bool) {
    match width {
        Width::Byte => {
            let (r, o, c) = (a as u8).oc_sub(b as u8);
            (r as u32, o, c)
        }
        Width::Word => {
            let (r, o, c) = (a as u16).oc_sub(b as u16);
            (r as u32, o, c)
        }
        Width::Dword => a.oc_sub(b),
    }
}

fn oc_adc_w(a: u32, b: u32, carry: bool, width: Width) -> (u32, bool, bool) {
    match width {
        Width::Byte => {
            let (r, o, c) = (a as u8).oc_carry_add(b as u8, carry);
            (r as u32, o, c)
        }
        Width::Word => {
            let (r, o, c) = (a as u16).oc_carry_add(b as u16, carry);
            (r as u32, o, c)
        }
        Width::Dword => a.oc_carry_add(b, carry),
    }
}

fn oc_sbb_w(a: u32, b: u32, carry: bool, width: Width) -> (u32, bool, bool) {
    match width {
        Width::Byte => {
            let (r, o, c) = (a as u8).oc_carry_sub(b as u8, carry);
            (r as u32, o, c)
        }
        Width::Word => {
            let (r, o, c) = (a as u16).oc_carry_sub(b as u16, carry);
            (r as u32, o, c)
        }
        Width::Dword => a.oc_carry_sub(b, carry),
    }
}

/// One step of the ADD/OR/ADC/SBB/AND/SUB/XOR/CMP family. Sets flags,
/// returns the result and whether it should be written back.
fn alu_compute(cpu: &mut Cpu, family: u8, a: u32, b: u32, width: Width) -> (u32, bool) {
    match family {
        0b000 => {
            let (result, of, cf) = oc_add_w(a, b, width);
            cpu.set_arith_flags(result, width, of, cf, aux_carry(a, b, result));
            (result, true)
        }
        0b001 => {
            let result = (a | b) & width.mask();
            cpu.set_logic_flags(result, width);
            (result, true)
        }
        0b010 => {
            let carry = cpu.flags.check(Carry);
            let (result, of, cf) = oc_adc_w(a, b, carry, width);
            cpu.set_arith_flags(result, width, of, cf, aux_carry(a, b, result));
            (result, true)
        }
        0b011 => {
            let carry = cpu.flags.check(Carry);
            let (result, of, cf) = oc_sbb_w(a, b, carry, width);
            cpu.set_arith_flags(result, width, of, cf, aux_carry(a, b, result));
            (result, true)
        }
        0b100 => {
            let result = a & b & width.mask();
            cpu.set_logic_flags(result, width);
            (result, true)
        }
        0b101 => {
            let (result, of, cf) = oc_sub_w(a, b, width);
            cpu.set_arith_flags(result, width, of, cf, aux_carry(a, b, result));
            (result, true)
        }
        0b110 => {
            let result = (a ^ b) & width.mask();
            cpu.set_logic_flags(result, width);
            (result, true)
        }
        0b111 => {
            let (result, of, cf) = oc_sub_w(a, b, width);
            cpu.set_arith_flags(result, width, of, cf, aux_carry(a, b, result));
            (result, false)
        }
        _ => unreachable!(),
    }
}

/// Opcodes 0x00-0x3D (excluding the segment push/pop and BCD slots):
/// the eight two-operand ALU families in their six encoding modes.
pub fn arith(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let family = (insn.opcode >> 3) & 0b111;
    let mode = insn.opcode & 0b111;
    let width = if mode & 1 == 0 { Width::Byte } else { insn.width() };

    let (dst, a, b) = match mode {
        // r/m = r/m op reg
        0b000 | 0b001 => {
            let dst = insn.rm_operand();
            let a = cpu.read_operand(dst, width)?;
            let b = cpu.registers.read_reg(insn.reg(), width);
            (dst, a, b)
        }
        // reg = reg op r/m
        0b010 | 0b011 => {
            let dst = Operand::Reg(insn.reg());
            let a = cpu.registers.read_reg(insn.reg(), width);
            let b = cpu.read_operand(insn.rm_operand(), width)?;
            (dst, a, b)
        }
        // accumulator = accumulator op imm
        0b100 | 0b101 => {
            let dst = Operand::Reg(EAX);
            let a = cpu.registers.read_reg(EAX, width);
            (dst, a, insn.imm & width.mask())
        }
        _ => unreachable!(),
    };

    let (result, writeback) = alu_compute(cpu, family, a, b, width);
    if writeback {
        cpu.write_operand(dst, width, result)?;
    }
    Ok(())
}

/// Group 1 (80/81/82/83): ALU family selected by the reg field, immediate
/// operand. 0x82 aliases 0x80; 0x83 sign-extends a byte immediate.
pub fn group1(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let width = if insn.opcode & 1 == 0 || insn.opcode == 0x82 {
        Width::Byte
    } else {
        insn.width()
    };
    let imm = if insn.opcode == 0x83 {
        (insn.imm8() as i8 as i32 as u32) & width.mask()
    } else {
        insn.imm & width.mask()
    };

    let dst = insn.rm_operand();
    let a = cpu.read_operand(dst, width)?;
    let (result, writeback) = alu_compute(cpu, insn.reg(), a, imm, width);
    if writeback {
        cpu.write_operand(dst, width, result)?;
    }
    Ok(())
}

// ── TEST ────────────────────────────────────────────────────────────────

pub fn test_rm_reg(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let width = if insn.opcode & 1 == 0 { Width::Byte } else { insn.width() };
    let a = cpu.read_operand(insn.rm_operand(), width)?;
    let b = cpu.registers.read_reg(insn.reg(), width);
    cpu.set_logic_flags(a & b, width);
    Ok(())
}

pub fn test_acc_imm(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let width = if insn.opcode & 1 == 0 { Width::Byte } else { insn.width() };
    let a = cpu.registers.read_reg(EAX, width);
    cpu.set_logic_flags(a & insn.imm & width.mask(), width);
    Ok(())
}

// ── INC/DEC ─────────────────────────────────────────────────────────────

/// INC/DEC leave CF alone.
pub(super) fn inc_value(cpu: &mut Cpu, value: u32, width: Width) -> u32 {
    let carry = cpu.flags.check(Carry);
    let (result, of, _) = oc_add_w(value, 1, width);
    cpu.set_arith_flags(result, width, of, carry, aux_carry(value, 1, result));
    result
}

pub(super) fn dec_value(cpu: &mut Cpu, value: u32, width: Width) -> u32 {
    let carry = cpu.flags.check(Carry);
    let (result, of, _) = oc_sub_w(value, 1, width);
    cpu.set_arith_flags(result, width, of, carry, aux_carry(value, 1, result));
    result
}

/// 40-47 / 48-4F: INC/DEC of a v-sized register encoded in the opcode.
pub fn inc_dec_reg(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let reg = insn.opcode & 0b111;
    let width = insn.width();
    let value = cpu.registers.read_reg(reg, width);
    let result = if insn.opcode & 0x08 == 0 {
        inc_value(cpu, value, width)
    } else {
        dec_value(cpu, value, width)
    };
    cpu.registers.write_reg(reg, width, result);
    Ok(())
}

/// Group 4 (FE): INC/DEC r/m8. Other reg encodings are undefined.
pub fn group4(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let dst = insn.rm_operand();
    let value = cpu.read_operand(dst, Width::Byte)?;
    let result = match insn.reg() {
        0b000 => inc_value(cpu, value, Width::Byte),
        0b001 => dec_value(cpu, value, Width::Byte),
        _ => return Err(Exception::InvalidOpcode),
    };
    cpu.write_operand(dst, Width::Byte, result)
}

// ── Group 3: TEST/NOT/NEG/MUL/IMUL/DIV/IDIV ─────────────────────────────

pub fn group3(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let width = if insn.opcode & 1 == 0 { Width::Byte } else { insn.width() };
    let op = insn.rm_operand();

    match insn.reg() {
        // TEST r/m, imm (reg 1 is an undocumented alias)
        0b000 | 0b001 => {
            let value = cpu.read_operand(op, width)?;
            cpu.set_logic_flags(value & insn.imm & width.mask(), width);
            Ok(())
        }
        // NOT: no flags
        0b010 => {
            let value = cpu.read_operand(op, width)?;
            cpu.write_operand(op, width, !value & width.mask())
        }
        // NEG
        0b011 => {
            let value = cpu.read_operand(op, width)?;
            let (result, of, _) = oc_sub_w(0, value, width);
            cpu.set_arith_flags(result, width, of, value != 0, aux_carry(0, value, result));
            cpu.write_operand(op, width, result)
        }
        0b100 => {
            let value = cpu.read_operand(op, width)?;
            mul(cpu, value, width);
            Ok(())
        }
        0b101 => {
            let value = cpu.read_operand(op, width)?;
            imul_one(cpu, value, width);
            Ok(())
        }
        0b110 => {
            let value = cpu.read_operand(op, width)?;
            div(cpu, value, width)
        }
        0b111 => {
            let value = cpu.read_operand(op, width)?;
            idiv(cpu, value, width)
        }
        _ => unreachable!(),
    }
}

/// Unsigned multiply into the double-width accumulator pair.
/// CF=OF=1 iff the high half is non-zero.
fn mul(cpu: &mut Cpu, value: u32, width: Width) {
    match width {
        Width::Byte => {
            let product = cpu.registers.read_reg8(0) as u16 * value as u16;
            cpu.registers.write_reg16(EAX, product);
            let high = product >> 8;
            set_mul_flags(cpu, product as u32, width, high != 0);
        }
        Width::Word => {
            let product = cpu.registers.read_reg16(EAX) as u32 * value;
            cpu.registers.write_reg16(EAX, product as u16);
            cpu.registers.write_reg16(EDX, (product >> 16) as u16);
            set_mul_flags(cpu, product & 0xFFFF, width, product >> 16 != 0);
        }
        Width::Dword => {
            let product = cpu.registers.read_reg32(EAX) as u64 * value as u64;
            cpu.registers.write_reg32(EAX, product as u32);
            cpu.registers.write_reg32(EDX, (product >> 32) as u32);
            set_mul_flags(cpu, product as u32, width, product >> 32 != 0);
        }
    }
}

/// One-operand IMUL. CF=OF=1 iff the high half is not a sign extension of
/// the low half.
fn imul_one(cpu: &mut Cpu, value: u32, width: Width) {
    match width {
        Width::Byte => {
            let product = (cpu.registers.read_reg8(0) as i8 as i16) * (value as u8 as i8 as i16);
            cpu.registers.write_reg16(EAX, product as u16);
            let overflow = product != product as i8 as i16;
            set_mul_flags(cpu, product as u16 as u32 & 0xFF, width, overflow);
        }
        Width::Word => {
            let product =
                (cpu.registers.read_reg16(EAX) as i16 as i32) * (value as u16 as i16 as i32);
            cpu.registers.write_reg16(EAX, product as u16);
            cpu.registers.write_reg16(EDX, (product >> 16) as u16);
            let overflow = product != product as i16 as i32;
            set_mul_flags(cpu, product as u16 as u32, width, overflow);
        }
        Width::Dword => {
            let product = (cpu.registers.read_reg32(EAX) as i32 as i64) * (value as i32 as i64);
            cpu.registers.write_reg32(EAX, product as u32);
            cpu.registers.write_reg32(EDX, (product >> 32) as u32);
            let overflow = product != product as i32 as i64;
            set_mul_flags(cpu, product as u32, width, overflow);
        }
    }
}

fn set_mul_flags(cpu: &mut Cpu, low: u32, width: Width, overflow: bool) {
    cpu.flags.update(Carry, overflow);
    cpu.flags.update(Overflow, overflow);
    cpu.flags.set_result(low, width);
}

fn div(cpu: &mut Cpu, value: u32, width: Width) -> Result<(), Exception> {
    if value == 0 {
        return Err(Exception::DivideError);
    }
    match width {
        Width::Byte => {
            let dividend = cpu.registers.read_reg16(EAX) as u32;
            let quot = dividend / value;
            if quot > 0xFF {
                return Err(Exception::DivideError);
            }
            cpu.registers.write_reg8(0, quot as u8);
            cpu.registers.write_reg8(4, (dividend % value) as u8);
        }
        Width::Word => {
            let dividend = ((cpu.registers.read_reg16(EDX) as u32) << 16)
                | cpu.registers.read_reg16(EAX) as u32;
            let quot = dividend / value;
            if quot > 0xFFFF {
                return Err(Exception::DivideError);
            }
            cpu.registers.write_reg16(EAX, quot as u16);
            cpu.registers.write_reg16(EDX, (dividend % value) as u16);
        }
        Width::Dword => {
            let dividend = ((cpu.registers.read_reg32(EDX) as u64) << 32)
                | cpu.registers.read_reg32(EAX) as u64;
            let quot = dividend / value as u64;
            if quot > 0xFFFF_FFFF {
                return Err(Exception::DivideError);
            }
            cpu.registers.write_reg32(EAX, quot as u32);
            cpu.registers.write_reg32(EDX, (dividend % value as u64) as u32);
        }
    }
    Ok(())
}

/// Signed divide, truncating toward zero; quotient overflow raises #DE.
fn idiv(cpu: &mut Cpu, value: u32, width: Width) -> Result<(), Exception> {
    match width {
        Width::Byte => {
            let divisor = value as u8 as i8 as i16;
            if divisor == 0 {
                return Err(Exception::DivideError);
            }
            let dividend = cpu.registers.read_reg16(EAX) as i16;
            let quot = dividend / divisor;
            if quot != quot as i8 as i16 {
                return Err(Exception::DivideError);
            }
            cpu.registers.write_reg8(0, quot as u8);
            cpu.registers.write_reg8(4, (dividend % divisor) as u8);
        }
        Width::Word => {
            let divisor = value as u16 as i16 as i32;
            if divisor == 0 {
                return Err(Exception::DivideError);
            }
            let dividend = (((cpu.registers.read_reg16(EDX) as u32) << 16)
                | cpu.registers.read_reg16(EAX) as u32) as i32;
            let quot = dividend / divisor;
            if quot != quot as i16 as i32 {
                return Err(Exception::DivideError);
            }
            cpu.registers.write_reg16(EAX, quot as u16);
            cpu.registers.write_reg16(EDX, (dividend % divisor) as u16);
        }
        Width::Dword => {
            let divisor = value as i32 as i64;
            if divisor == 0 {
                return Err(Exception::DivideError);
            }
            let dividend = (((cpu.registers.read_reg32(EDX) as u64) << 32)
                | cpu.registers.read_reg32(EAX) as u64) as i64;
            let quot = dividend / divisor;
            if quot != quot as i32 as i64 {
                return Err(Exception::DivideError);
            }
            cpu.registers.write_reg32(EAX, quot as u32);
            cpu.registers.write_reg32(EDX, (dividend % divisor) as u32);
        }
    }
    Ok(())
}

// ── Two- and three-operand IMUL ─────────────────────────────────────────

/// 69/6B: reg = r/m * imm (6B sign-extends a byte immediate).
pub fn imul_imm(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let width = insn.width();
    let src = cpu.read_rm(insn)?;
    let factor = if insn.opcode == 0x6B {
        insn.imm8() as i8 as i32 as u32
    } else {
        insn.imm
    };
    let result = imul_flags(cpu, src, factor, width);
    cpu.registers.write_reg(insn.reg(), width, result);
    Ok(())
}

/// 0F AF: reg = reg * r/m.
pub fn imul_reg_rm(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let width = insn.width();
    let a = cpu.registers.read_reg(insn.reg(), width);
    let b = cpu.read_rm(insn)?;
    let result = imul_flags(cpu, a, b, width);
    cpu.registers.write_reg(insn.reg(), width, result);
    Ok(())
}

fn imul_flags(cpu: &mut Cpu, a: u32, b: u32, width: Width) -> u32 {
    let (result, overflow) = match width {
        Width::Word => {
            let product = (a as u16 as i16 as i32) * (b as u16 as i16 as i32);
            (product as u32 & 0xFFFF, product != product as i16 as i32)
        }
        _ => {
            let product = (a as i32 as i64) * (b as i32 as i64);
            (product as u32, product != product as i32 as i64)
        }
    };
    cpu.flags.update(Carry, overflow);
    cpu.flags.update(Overflow, overflow);
    cpu.flags.set_result(result, width);
    result
}

// ── Sign/zero extension of the accumulator ──────────────────────────────

/// 98: CBW / CWDE.
pub fn cbw(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    if insn.op32 {
        let value = cpu.registers.read_reg16(EAX) as i16 as i32 as u32;
        cpu.registers.write_reg32(EAX, value);
    } else {
        let value = cpu.registers.read_reg8(0) as i8 as i16 as u16;
        cpu.registers.write_reg16(EAX, value);
    }
    Ok(())
}

/// 99: CWD / CDQ.
pub fn cwd(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    if insn.op32 {
        let fill = if cpu.registers.read_reg32(EAX) & 0x8000_0000 != 0 {
            !0
        } else {
            0
        };
        cpu.registers.write_reg32(EDX, fill);
    } else {
        let fill = if cpu.registers.read_reg16(EAX) & 0x8000 != 0 {
            0xFFFF
        } else {
            0
        };
        cpu.registers.write_reg16(EDX, fill);
    }
    Ok(())
}

// ── BCD adjust ──────────────────────────────────────────────────────────

pub fn daa(cpu: &mut Cpu, _insn: &Instruction) -> Result<(), Exception> {
    let old_al = cpu.registers.read_reg8(0);
    let old_cf = cpu.flags.check(Carry);
    let mut al = old_al;
    let mut cf = false;

    if (old_al & 0x0F) > 9 || cpu.flags.check(AuxCarry) {
        let (adjusted, carry) = al.overflowing_add(6);
        al = adjusted;
        cf = old_cf || carry;
        cpu.flags.set(AuxCarry);
    } else {
        cpu.flags.unset(AuxCarry);
    }
    if old_al > 0x99 || old_cf {
        al = al.wrapping_add(0x60);
        cf = true;
    }

    cpu.registers.write_reg8(0, al);
    cpu.flags.update(Carry, cf);
    cpu.flags.set_result(al as u32, Width::Byte);
    Ok(())
}

pub fn das(cpu: &mut Cpu, _insn: &Instruction) -> Result<(), Exception> {
    let old_al = cpu.registers.read_reg8(0);
    let old_cf = cpu.flags.check(Carry);
    let mut al = old_al;
    let mut cf = false;

    if (old_al & 0x0F) > 9 || cpu.flags.check(AuxCarry) {
        let (adjusted, borrow) = al.overflowing_sub(6);
        al = adjusted;
        cf = old_cf || borrow;
        cpu.flags.set(AuxCarry);
    } else {
        cpu.flags.unset(AuxCarry);
    }
    if old_al > 0x99 || old_cf {
        al = al.wrapping_sub(0x60);
        cf = true;
    }

    cpu.registers.write_reg8(0, al);
    cpu.flags.update(Carry, cf);
    cpu.flags.set_result(al as u32, Width::Byte);
    Ok(())
}

pub fn aaa(cpu: &mut Cpu, _insn: &Instruction) -> Result<(), Exception> {
    let al = cpu.registers.read_reg8(0);
    if (al & 0x0F) > 9 || cpu.flags.check(AuxCarry) {
        let ax = cpu.registers.read_reg16(EAX).wrapping_add(0x106);
        cpu.registers.write_reg16(EAX, ax);
        cpu.flags.set(AuxCarry);
        cpu.flags.set(Carry);
    } else {
        cpu.flags.unset(AuxCarry);
        cpu.flags.unset(Carry);
    }
    let masked = cpu.registers.read_reg8(0) & 0x0F;
    cpu.registers.write_reg8(0, masked);
    cpu.flags.set_result(masked as u32, Width::Byte);
    Ok(())
}

pub fn aas(cpu: &mut Cpu, _insn: &Instruction) -> Result<(), Exception> {
    let al = cpu.registers.read_reg8(0);
    if (al & 0x0F) > 9 || cpu.flags.check(AuxCarry) {
        let ax = cpu.registers.read_reg16(EAX).wrapping_sub(6);
        cpu.registers.write_reg16(EAX, ax);
        let ah = cpu.registers.read_reg8(4).wrapping_sub(1);
        cpu.registers.write_reg8(4, ah);
        cpu.flags.set(AuxCarry);
        cpu.flags.set(Carry);
    } else {
        cpu.flags.unset(AuxCarry);
        cpu.flags.unset(Carry);
    }
    let masked = cpu.registers.read_reg8(0) & 0x0F;
    cpu.registers.write_reg8(0, masked);
    cpu.flags.set_result(masked as u32, Width::Byte);
    Ok(())
}

/// D4: AAM imm. Divide of AL by the (usually 10) immediate; zero raises #DE.
pub fn aam(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let base = insn.imm8();
    if base == 0 {
        return Err(Exception::DivideError);
    }
    let al = cpu.registers.read_reg8(0);
    cpu.registers.write_reg8(4, al / base);
    let al = al % base;
    cpu.registers.write_reg8(0, al);
    cpu.flags.set_result(al as u32, Width::Byte);
    Ok(())
}

/// D5: AAD imm.
pub fn aad(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let base = insn.imm8();
    let al = cpu
        .registers
        .read_reg8(0)
        .wrapping_add(cpu.registers.read_reg8(4).wrapping_mul(base));
    cpu.registers.write_reg8(0, al);
    cpu.registers.write_reg8(4, 0);
    cpu.flags.set_result(al as u32, Width::Byte);
    Ok(())
}

// ── Bit tests and scans (386) ───────────────────────────────────────────

/// Resolve a BT/BTS/BTR/BTC operand. Register-sourced bit offsets into
/// memory index beyond the addressed word (bit-string semantics); immediate
/// offsets are taken modulo the operand width.
fn bit_operand(
    cpu: &mut Cpu,
    insn: &Instruction,
    bit_offset: u32,
    from_reg: bool,
) -> Result<(Operand, u32, u32), Exception> {
    let width = insn.width();
    let bits = width.bits() as i32;

    let (op, bit) = match insn.rm_operand() {
        Operand::Reg(reg) => (Operand::Reg(reg), bit_offset & (bits as u32 - 1)),
        Operand::Mem { seg, offset } if from_reg => {
            let signed = bit_offset as i32;
            let element = signed.div_euclid(bits);
            let bit = signed.rem_euclid(bits) as u32;
            let byte_step = (bits / 8) as i32;
            (
                Operand::Mem {
                    seg,
                    offset: offset.wrapping_add_signed(element * byte_step),
                },
                bit,
            )
        }
        mem => (mem, bit_offset & (bits as u32 - 1)),
    };

    let value = cpu.read_operand(op, width)?;
    Ok((op, value, bit))
}

fn bit_test(
    cpu: &mut Cpu,
    insn: &Instruction,
    bit_offset: u32,
    from_reg: bool,
    action: u8, // 0 BT, 1 BTS, 2 BTR, 3 BTC
) -> Result<(), Exception> {
    let width = insn.width();
    let (op, value, bit) = bit_operand(cpu, insn, bit_offset, from_reg)?;
    cpu.flags.update(Carry, (value >> bit) & 1 != 0);
    let new = match action {
        0 => return Ok(()),
        1 => value | (1 << bit),
        2 => value & !(1 << bit),
        3 => value ^ (1 << bit),
        _ => unreachable!(),
    };
    cpu.write_operand(op, width, new & width.mask())
}

/// 0F A3/AB/B3/BB: BT/BTS/BTR/BTC r/m, reg.
pub fn bt_reg(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let offset = cpu.registers.read_reg(insn.reg(), insn.width());
    let action = match insn.opcode {
        0xA3 => 0,
        0xAB => 1,
        0xB3 => 2,
        0xBB => 3,
        _ => unreachable!(),
    };
    bit_test(cpu, insn, offset, true, action)
}

/// Group 8 (0F BA): BT/BTS/BTR/BTC r/m, imm8.
pub fn group8(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let action = match insn.reg() {
        0b100 => 0,
        0b101 => 1,
        0b110 => 2,
        0b111 => 3,
        _ => return Err(Exception::InvalidOpcode),
    };
    bit_test(cpu, insn, insn.imm8() as u32, false, action)
}

/// 0F BC/BD: BSF/BSR. A zero source sets ZF and leaves the destination
/// unchanged.
pub fn bit_scan(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let width = insn.width();
    let value = cpu.read_rm(insn)?;
    if value == 0 {
        cpu.flags.set(Zero);
        return Ok(());
    }
    let index = if insn.opcode == 0xBC {
        value.trailing_zeros()
    } else {
        31 - value.leading_zeros()
    };
    cpu.registers.write_reg(insn.reg(), width, index);
    cpu.flags.unset(Zero);
    Ok(())
}
