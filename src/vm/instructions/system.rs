use log::{debug, warn};

use crate::vm::cpu::Cpu;
use crate::vm::descriptor::Descriptor;
use crate::vm::exception::Exception;
use crate::vm::flags::{CpuFlag::*, Width};
use crate::vm::instr::{Instruction, Operand};
use crate::vm::paging::AccessKind;
use crate::vm::registers::{CR0_EM, CR0_MP, CR0_PE, CR0_TS, EAX, EBX, ECX, EDX};
use crate::vm::segment::selector_error;
use crate::vm::tasking::TSS32_IOMAP_BASE;

// ── I/O port access with permission checks ──────────────────────────────

impl Cpu {
    /// IOPL and, past it, the TSS I/O permission bitmap gate port access in
    /// protected and VM86 mode.
    fn check_io(&mut self, port: u16, bytes: u32) -> Result<(), Exception> {
        if !self.pe() {
            return Ok(());
        }
        if !self.vm86() && self.cpl <= self.flags.iopl() {
            return Ok(());
        }

        let tr = self.registers.tr;
        if !tr.size32 {
            return Err(Exception::gp0());
        }
        if TSS32_IOMAP_BASE as u64 + 1 > tr.limit as u64 {
            return Err(Exception::gp0());
        }
        let iomap_base =
            self.read_linear16_as(tr.base + TSS32_IOMAP_BASE, AccessKind::Read, false)? as u32;

        let first = iomap_base + port as u32 / 8;
        let last = iomap_base + (port as u32 + bytes - 1) / 8;
        if last as u64 > tr.limit as u64 {
            return Err(Exception::gp0());
        }
        let mut bits = 0u32;
        for (i, addr) in (first..=last).enumerate() {
            let byte = self.read_linear8_as(tr.base + addr, AccessKind::Read, false)?;
            bits |= (byte as u32) << (i * 8);
        }
        let mask = ((1u32 << bytes) - 1) << (port as u32 % 8);
        if bits & mask != 0 {
            return Err(Exception::gp0());
        }
        Ok(())
    }

    pub fn io_in(&mut self, port: u16, width: Width) -> Result<u32, Exception> {
        let bytes = width.bits() / 8;
        self.check_io(port, bytes)?;
        // The PIC lives on the CPU for IRQ polling, so its ports are
        // routed here instead of through the bus. Same for the fast A20
        // gate, which is a mask inside the memory subsystem.
        if matches!(port, 0x20 | 0x21) && width == Width::Byte {
            return Ok(self.pic.handle_port_in(port) as u32);
        }
        if port == 0x92 && width == Width::Byte {
            return Ok((self.memory.a20_enabled() as u32) << 1);
        }
        Ok(match width {
            Width::Byte => self.bus.port_in8(port) as u32,
            Width::Word => self.bus.port_in16(port) as u32,
            Width::Dword => self.bus.port_in32(port),
        })
    }

    pub fn io_out(&mut self, port: u16, width: Width, value: u32) -> Result<(), Exception> {
        let bytes = width.bits() / 8;
        self.check_io(port, bytes)?;
        if matches!(port, 0x20 | 0x21) && width == Width::Byte {
            self.pic.handle_port_out(port, value as u8);
            return Ok(());
        }
        if port == 0x92 && width == Width::Byte {
            self.memory.set_a20_enabled(value & 0x02 != 0);
            return Ok(());
        }
        match width {
            Width::Byte => self.bus.port_out8(port, value as u8),
            Width::Word => self.bus.port_out16(port, value as u16),
            Width::Dword => self.bus.port_out32(port, value),
        }
        Ok(())
    }
}

/// E4/E5/EC/ED: IN.
pub fn in_port(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let width = if insn.opcode & 1 == 0 { Width::Byte } else { insn.width() };
    let port = match insn.opcode {
        0xE4 | 0xE5 => insn.imm8() as u16,
        _ => cpu.registers.read_reg16(EDX),
    };
    let value = cpu.io_in(port, width)?;
    cpu.registers.write_reg(EAX, width, value);
    Ok(())
}

/// E6/E7/EE/EF: OUT.
pub fn out_port(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let width = if insn.opcode & 1 == 0 { Width::Byte } else { insn.width() };
    let port = match insn.opcode {
        0xE6 | 0xE7 => insn.imm8() as u16,
        _ => cpu.registers.read_reg16(EDX),
    };
    let value = cpu.registers.read_reg(EAX, width);
    cpu.io_out(port, width, value)
}

// ── Flag instructions ───────────────────────────────────────────────────

/// F5: CMC.
pub fn cmc(cpu: &mut Cpu, _insn: &Instruction) -> Result<(), Exception> {
    cpu.flags.flip(Carry);
    Ok(())
}

/// F8/F9: CLC/STC.
pub fn clc_stc(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    cpu.flags.update(Carry, insn.opcode & 1 != 0);
    Ok(())
}

/// FC/FD: CLD/STD.
pub fn cld_std(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    cpu.flags.update(Directional, insn.opcode & 1 != 0);
    Ok(())
}

fn check_if_access(cpu: &Cpu) -> Result<(), Exception> {
    if cpu.pe() && cpu.flags.iopl() < if cpu.vm86() { 3 } else { cpu.cpl } {
        return Err(Exception::gp0());
    }
    Ok(())
}

/// FA: CLI.
pub fn cli(cpu: &mut Cpu, _insn: &Instruction) -> Result<(), Exception> {
    check_if_access(cpu)?;
    cpu.flags.unset(Interrupt);
    Ok(())
}

/// FB: STI. A pending IRQ is not taken until after the next instruction.
pub fn sti(cpu: &mut Cpu, _insn: &Instruction) -> Result<(), Exception> {
    check_if_access(cpu)?;
    if !cpu.flags.check(Interrupt) {
        cpu.interrupt_inhibit = true;
    }
    cpu.flags.set(Interrupt);
    Ok(())
}

/// 9F: LAHF.
pub fn lahf(cpu: &mut Cpu, _insn: &Instruction) -> Result<(), Exception> {
    cpu.registers.write_reg8(4, cpu.flags.eflags() as u8);
    Ok(())
}

/// 9E: SAHF.
pub fn sahf(cpu: &mut Cpu, _insn: &Instruction) -> Result<(), Exception> {
    let ah = cpu.registers.read_reg8(4) as u32;
    cpu.flags.set_eflags_masked(ah, 0xD5);
    Ok(())
}

/// D6: SALC (undocumented): AL = CF ? FF : 00.
pub fn salc(cpu: &mut Cpu, _insn: &Instruction) -> Result<(), Exception> {
    let value = if cpu.flags.check(Carry) { 0xFF } else { 0x00 };
    cpu.registers.write_reg8(0, value);
    Ok(())
}

// ── HLT / WAIT / FPU ────────────────────────────────────────────────────

/// F4: HLT, privileged.
pub fn hlt(cpu: &mut Cpu, _insn: &Instruction) -> Result<(), Exception> {
    if cpu.protected_mode() && cpu.cpl != 0 {
        return Err(Exception::gp0());
    }
    cpu.halted = true;
    Ok(())
}

/// 9B: WAIT/FWAIT.
pub fn wait(cpu: &mut Cpu, _insn: &Instruction) -> Result<(), Exception> {
    let cr0 = cpu.registers.cr0;
    if cr0 & CR0_TS != 0 && cr0 & CR0_MP != 0 {
        return Err(Exception::NoMathUnit);
    }
    Ok(())
}

/// D8-DF: x87 escape. No coprocessor state is modeled; the ModR/M operand
/// was consumed by the decoder and EM/TS raise #NM as a real 386 would.
pub fn fpu_escape(cpu: &mut Cpu, _insn: &Instruction) -> Result<(), Exception> {
    let cr0 = cpu.registers.cr0;
    if cr0 & CR0_EM != 0 || cr0 & CR0_TS != 0 {
        return Err(Exception::NoMathUnit);
    }
    Ok(())
}

// ── Protected-mode system instructions ──────────────────────────────────

/// 63: ARPL r/m16, r16.
pub fn arpl(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    if !cpu.protected_mode() {
        return Err(Exception::InvalidOpcode);
    }
    let op = insn.rm_operand();
    let dst = cpu.read_operand(op, Width::Word)? as u16;
    let src = cpu.registers.read_reg16(insn.reg());
    if dst & 3 < src & 3 {
        let adjusted = (dst & !3) | (src & 3);
        cpu.write_operand(op, Width::Word, adjusted as u32)?;
        cpu.flags.set(Zero);
    } else {
        cpu.flags.unset(Zero);
    }
    Ok(())
}

/// Group 6 (0F 00): SLDT/STR/LLDT/LTR/VERR/VERW.
pub fn group6(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    if !cpu.protected_mode() {
        return Err(Exception::InvalidOpcode);
    }
    match insn.reg() {
        // SLDT
        0b000 => {
            let selector = cpu.registers.ldtr.selector;
            store_selector(cpu, insn, selector)
        }
        // STR
        0b001 => {
            let selector = cpu.registers.tr.selector;
            store_selector(cpu, insn, selector)
        }
        // LLDT
        0b010 => {
            if cpu.cpl != 0 {
                return Err(Exception::gp0());
            }
            let selector = cpu.read_rm16(insn)?;
            lldt(cpu, selector)
        }
        // LTR
        0b011 => {
            if cpu.cpl != 0 {
                return Err(Exception::gp0());
            }
            let selector = cpu.read_rm16(insn)?;
            ltr(cpu, selector)
        }
        // VERR/VERW
        0b100 | 0b101 => {
            let selector = cpu.read_rm16(insn)?;
            let accessible = selector_verified(cpu, selector, insn.reg() == 0b101);
            cpu.flags.update(Zero, accessible);
            Ok(())
        }
        _ => Err(Exception::InvalidOpcode),
    }
}

fn store_selector(cpu: &mut Cpu, insn: &Instruction, selector: u16) -> Result<(), Exception> {
    match insn.rm_operand() {
        Operand::Reg(reg) => {
            cpu.registers.write_reg(reg, insn.width(), selector as u32);
            Ok(())
        }
        mem => cpu.write_operand(mem, Width::Word, selector as u32),
    }
}

fn lldt(cpu: &mut Cpu, selector: u16) -> Result<(), Exception> {
    if selector & !3 == 0 {
        cpu.registers.ldtr.selector = selector;
        cpu.registers.ldtr.base = 0;
        cpu.registers.ldtr.limit = 0;
        return Ok(());
    }
    let error = selector_error(selector);
    if selector & 4 != 0 {
        return Err(Exception::GeneralProtection(error));
    }
    match cpu.read_descriptor(selector)? {
        Descriptor::Ldt(ldt) => {
            if !ldt.present {
                return Err(Exception::NotPresent(error));
            }
            cpu.registers.ldtr.selector = selector;
            cpu.registers.ldtr.base = ldt.base;
            cpu.registers.ldtr.limit = ldt.limit;
            Ok(())
        }
        _ => Err(Exception::GeneralProtection(error)),
    }
}

fn ltr(cpu: &mut Cpu, selector: u16) -> Result<(), Exception> {
    let error = selector_error(selector);
    if selector & !3 == 0 || selector & 4 != 0 {
        return Err(Exception::GeneralProtection(error));
    }
    match cpu.read_descriptor(selector)? {
        Descriptor::Tss(tss) if !tss.busy => {
            if !tss.present {
                return Err(Exception::NotPresent(error));
            }
            // Mark busy in the GDT.
            let addr = cpu.descriptor_address(selector)?;
            let byte = cpu.read_linear8_as(addr + 5, AccessKind::Read, false)?;
            cpu.write_linear8_as(addr + 5, byte | 0x02, false)?;

            cpu.registers.tr.selector = selector;
            cpu.registers.tr.base = tss.base;
            cpu.registers.tr.limit = tss.limit;
            cpu.registers.tr.size32 = tss.size32;
            Ok(())
        }
        _ => Err(Exception::GeneralProtection(error)),
    }
}

/// Is `selector` readable (VERR) / writable (VERW) from the current CPL?
fn selector_verified(cpu: &mut Cpu, selector: u16, write: bool) -> bool {
    let rpl = (selector & 3) as u8;
    let Some((descriptor, _)) = cpu.probe_descriptor(selector) else {
        return false;
    };
    match descriptor {
        Descriptor::Data(data) => {
            if data.dpl < cpu.cpl.max(rpl) {
                return false;
            }
            !write || data.writable
        }
        Descriptor::Code(code) => {
            if write {
                return false;
            }
            if !code.readable {
                return false;
            }
            code.conforming || code.dpl >= cpu.cpl.max(rpl)
        }
        _ => false,
    }
}

/// Group 7 (0F 01): SGDT/SIDT/LGDT/LIDT/SMSW/LMSW/INVLPG.
pub fn group7(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    match insn.reg() {
        // SGDT/SIDT
        0b000 | 0b001 => {
            let Operand::Mem { seg, offset } = insn.rm_operand() else {
                return Err(Exception::InvalidOpcode);
            };
            let table = if insn.reg() == 0 {
                cpu.registers.gdtr
            } else {
                cpu.registers.idtr
            };
            let base = if insn.op32 {
                table.base
            } else {
                table.base & 0x00FF_FFFF
            };
            cpu.write_mem16(seg, offset, table.limit)?;
            cpu.write_mem32(seg, offset.wrapping_add(2), base)
        }
        // LGDT/LIDT
        0b010 | 0b011 => {
            if cpu.protected_mode() && cpu.cpl != 0 {
                return Err(Exception::gp0());
            }
            let Operand::Mem { seg, offset } = insn.rm_operand() else {
                return Err(Exception::InvalidOpcode);
            };
            let limit = cpu.read_mem16(seg, offset)?;
            let mut base = cpu.read_mem32(seg, offset.wrapping_add(2))?;
            if !insn.op32 {
                base &= 0x00FF_FFFF;
            }
            let table = if insn.reg() == 0b010 {
                &mut cpu.registers.gdtr
            } else {
                &mut cpu.registers.idtr
            };
            table.base = base;
            table.limit = limit;
            debug!(
                "[cpu] {} base={base:#010x} limit={limit:#06x}",
                if insn.reg() == 0b010 { "lgdt" } else { "lidt" }
            );
            Ok(())
        }
        // SMSW
        0b100 => {
            let value = cpu.registers.cr0 & 0xFFFF;
            match insn.rm_operand() {
                Operand::Reg(reg) => {
                    cpu.registers.write_reg(reg, insn.width(), value);
                    Ok(())
                }
                mem => cpu.write_operand(mem, Width::Word, value),
            }
        }
        // LMSW: low machine-status bits; cannot clear PE.
        0b110 => {
            if cpu.protected_mode() && cpu.cpl != 0 {
                return Err(Exception::gp0());
            }
            let value = cpu.read_rm16(insn)? as u32;
            let keep_pe = cpu.registers.cr0 & CR0_PE;
            cpu.registers.cr0 =
                (cpu.registers.cr0 & !0xE) | (value & 0xF) | keep_pe;
            Ok(())
        }
        // INVLPG: no TLB is modeled.
        0b111 => {
            if matches!(insn.rm_operand(), Operand::Reg(_)) {
                return Err(Exception::InvalidOpcode);
            }
            Ok(())
        }
        _ => Err(Exception::InvalidOpcode),
    }
}

/// 0F 02 LAR / 0F 03 LSL.
pub fn lar_lsl(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    if !cpu.protected_mode() {
        return Err(Exception::InvalidOpcode);
    }
    let selector = cpu.read_rm16(insn)?;
    let rpl = (selector & 3) as u8;

    let Some((descriptor, raw)) = cpu.probe_descriptor(selector) else {
        cpu.flags.unset(Zero);
        return Ok(());
    };

    let visible = match &descriptor {
        Descriptor::Code(code) => {
            code.conforming || code.dpl >= cpu.cpl.max(rpl)
        }
        Descriptor::Data(data) => data.dpl >= cpu.cpl.max(rpl),
        Descriptor::Tss(tss) => tss.dpl >= cpu.cpl.max(rpl),
        Descriptor::Ldt(_) => true,
        Descriptor::Gate(gate) if insn.opcode == 0x02 => {
            gate.kind == crate::vm::descriptor::GateKind::Call
                && gate.dpl >= cpu.cpl.max(rpl)
        }
        Descriptor::TaskGate(gate) if insn.opcode == 0x02 => {
            gate.dpl >= cpu.cpl.max(rpl)
        }
        _ => false,
    };
    // LSL only applies to descriptors that have a limit.
    let visible = visible
        && (insn.opcode == 0x02
            || matches!(
                descriptor,
                Descriptor::Code(_)
                    | Descriptor::Data(_)
                    | Descriptor::Tss(_)
                    | Descriptor::Ldt(_)
            ));

    if !visible {
        cpu.flags.unset(Zero);
        return Ok(());
    }

    let value = if insn.opcode == 0x02 {
        let rights = ((raw >> 32) & 0x00F0_FF00) as u32;
        if insn.op32 {
            rights
        } else {
            rights & 0xFF00
        }
    } else {
        match descriptor {
            Descriptor::Code(code) => code.limit,
            Descriptor::Data(data) => data.limit,
            Descriptor::Tss(tss) => tss.limit,
            Descriptor::Ldt(ldt) => ldt.limit,
            _ => unreachable!(),
        }
    };
    cpu.registers.write_reg(insn.reg(), insn.width(), value);
    cpu.flags.set(Zero);
    Ok(())
}

/// 0F 06: CLTS.
pub fn clts(cpu: &mut Cpu, _insn: &Instruction) -> Result<(), Exception> {
    if cpu.protected_mode() && cpu.cpl != 0 {
        return Err(Exception::gp0());
    }
    cpu.registers.cr0 &= !CR0_TS;
    Ok(())
}

/// 0F 08/09: INVD/WBINVD: no caches modeled.
pub fn invd(cpu: &mut Cpu, _insn: &Instruction) -> Result<(), Exception> {
    if cpu.protected_mode() && cpu.cpl != 0 {
        return Err(Exception::gp0());
    }
    Ok(())
}

/// 0F 0B: UD2.
pub fn ud2(_cpu: &mut Cpu, _insn: &Instruction) -> Result<(), Exception> {
    Err(Exception::InvalidOpcode)
}

/// 0F 20-23: MOV to/from control and debug registers. The r/m field always
/// names a register, whatever the mod bits say.
pub fn mov_cr_dr(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    if cpu.protected_mode() && cpu.cpl != 0 {
        return Err(Exception::gp0());
    }
    let modrm = insn.modrm.unwrap_or(0);
    let gpr = modrm & 0b111;
    let index = (modrm >> 3) & 0b111;
    let debug_reg = insn.opcode & 1 != 0;
    let to_special = insn.opcode & 2 != 0;

    if !debug_reg && !matches!(index, 0 | 2 | 3 | 4) {
        return Err(Exception::InvalidOpcode);
    }

    if to_special {
        let value = cpu.registers.read_reg32(gpr);
        if debug_reg {
            cpu.registers.dr[index as usize] = value;
        } else {
            match index {
                0 => {
                    let old = cpu.registers.cr0;
                    cpu.registers.cr0 = value;
                    if (old ^ value) & (CR0_PE | crate::vm::registers::CR0_PG) != 0 {
                        debug!("[cpu] cr0 {old:#010x} -> {value:#010x}");
                    }
                }
                2 => cpu.registers.cr2 = value,
                3 => cpu.registers.cr3 = value,
                4 => cpu.registers.cr4 = value,
                _ => unreachable!(),
            }
        }
    } else {
        let value = if debug_reg {
            cpu.registers.dr[index as usize]
        } else {
            match index {
                0 => cpu.registers.cr0,
                2 => cpu.registers.cr2,
                3 => cpu.registers.cr3,
                4 => cpu.registers.cr4,
                _ => unreachable!(),
            }
        };
        cpu.registers.write_reg32(gpr, value);
    }
    Ok(())
}

/// 0F A2: CPUID, stubbed with a fixed 386-class identification.
pub fn cpuid(cpu: &mut Cpu, _insn: &Instruction) -> Result<(), Exception> {
    let leaf = cpu.registers.read_reg32(EAX);
    match leaf {
        0 => {
            cpu.registers.write_reg32(EAX, 1);
            // "GenuineIntel" in the EBX:EDX:ECX order the convention wants.
            cpu.registers.write_reg32(EBX, u32::from_le_bytes(*b"Genu"));
            cpu.registers.write_reg32(EDX, u32::from_le_bytes(*b"ineI"));
            cpu.registers.write_reg32(ECX, u32::from_le_bytes(*b"ntel"));
        }
        _ => {
            // Family 3, no feature bits: a 386 wearing a CPUID badge.
            cpu.registers.write_reg32(EAX, 0x0000_0300);
            cpu.registers.write_reg32(EBX, 0);
            cpu.registers.write_reg32(ECX, 0);
            cpu.registers.write_reg32(EDX, 0);
        }
    }
    Ok(())
}

/// Unknown encodings land here via the dispatch table.
pub fn invalid(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    warn!(
        "[cpu] invalid opcode {}{:02x} at {:04x}:{:08x}",
        if insn.two_byte { "0f " } else { "" },
        insn.opcode,
        cpu.base_cs,
        cpu.base_eip,
    );
    Err(Exception::InvalidOpcode)
}
