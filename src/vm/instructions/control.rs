use log::debug;

use crate::utils::number::extend_sign32;
use crate::vm::cpu::Cpu;
use crate::vm::descriptor::{CodeSegment, Descriptor, Gate, GateKind};
use crate::vm::exception::Exception;
use crate::vm::flags::{CpuFlag::*, IOPL_MASK};
use crate::vm::instr::{Instruction, Operand};
use crate::vm::instructions::alu::{dec_value, inc_value};
use crate::vm::registers::{SegReg, ECX};
use crate::vm::segment::selector_error;
use crate::vm::stack::Popper;
use crate::vm::tasking;

/// What kind of control transfer is driving a far branch; picks the
/// privilege rules and whether a task switch records a back-link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpType {
    Jmp,
    Call,
    Int,
    Iret,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSource {
    /// Software INT n / INT3 / INTO.
    Internal,
    /// Hardware IRQ vectored by the PIC.
    External,
    /// CPU-generated exception.
    Exception,
}

/// Error code for faults during interrupt delivery:
/// `(vector << 3) | IDT | EXT` for IDT-relative errors, `selector & ~3 | EXT`
/// for selector-relative ones.
fn idt_error(vector: u8, source: InterruptSource) -> u16 {
    ((vector as u16) << 3) | 2 | (source == InterruptSource::External) as u16
}

fn gate_selector_error(selector: u16, source: InterruptSource) -> u16 {
    selector_error(selector) | (source == InterruptSource::External) as u16
}

// ── Relative jumps, loops ───────────────────────────────────────────────

fn branch_rel8(cpu: &mut Cpu, insn: &Instruction) {
    let target = cpu.registers.eip.wrapping_add(extend_sign32(insn.imm8()));
    cpu.set_ip(target, insn.op32);
}

/// 70-7F: Jcc rel8.
pub fn jcc_rel8(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    if cpu.condition(insn.opcode & 0x0F) {
        branch_rel8(cpu, insn);
    }
    Ok(())
}

/// 0F 80-8F: Jcc rel16/32.
pub fn jcc_rel(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    if cpu.condition(insn.opcode & 0x0F) {
        let target = cpu.registers.eip.wrapping_add(insn.imm);
        cpu.set_ip(target, insn.op32);
    }
    Ok(())
}

/// E3: JCXZ/JECXZ (tests the address-size counter).
pub fn jcxz(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let count = if insn.a32 {
        cpu.registers.read_reg32(ECX)
    } else {
        cpu.registers.read_reg16(ECX) as u32
    };
    if count == 0 {
        branch_rel8(cpu, insn);
    }
    Ok(())
}

/// E0/E1/E2: LOOPNZ/LOOPZ/LOOP.
pub fn loop_rel8(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let count = if insn.a32 {
        let value = cpu.registers.read_reg32(ECX).wrapping_sub(1);
        cpu.registers.write_reg32(ECX, value);
        value
    } else {
        let value = cpu.registers.read_reg16(ECX).wrapping_sub(1);
        cpu.registers.write_reg16(ECX, value);
        value as u32
    };
    let zero = cpu.flags.check(Zero);
    let taken = match insn.opcode {
        0xE0 => count != 0 && !zero,
        0xE1 => count != 0 && zero,
        0xE2 => count != 0,
        _ => unreachable!(),
    };
    if taken {
        branch_rel8(cpu, insn);
    }
    Ok(())
}

/// E8: CALL rel16/32.
pub fn call_rel(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let return_ip = cpu.registers.eip;
    cpu.push_sized(return_ip, insn.op32)?;
    let target = return_ip.wrapping_add(insn.imm);
    cpu.set_ip(target, insn.op32);
    Ok(())
}

/// E9: JMP rel16/32.
pub fn jmp_rel(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let target = cpu.registers.eip.wrapping_add(insn.imm);
    cpu.set_ip(target, insn.op32);
    Ok(())
}

/// EB: JMP rel8.
pub fn jmp_rel8(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    branch_rel8(cpu, insn);
    Ok(())
}

// ── Near returns ────────────────────────────────────────────────────────

/// C3/C2: RET near [imm16].
pub fn ret_near(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let mut popper = Popper::new();
    let target = popper.pop_sized(cpu, insn.op32)?;
    if insn.opcode == 0xC2 {
        popper.skip(insn.imm16() as u32);
    }
    popper.commit(cpu);
    cpu.set_ip(target, insn.op32);
    Ok(())
}

// ── Group 5 (FF): INC/DEC/CALL/JMP/PUSH on r/m ──────────────────────────

pub fn group5(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    match insn.reg() {
        0b000 => {
            let op = insn.rm_operand();
            let value = cpu.read_operand(op, insn.width())?;
            let result = inc_value(cpu, value, insn.width());
            cpu.write_operand(op, insn.width(), result)
        }
        0b001 => {
            let op = insn.rm_operand();
            let value = cpu.read_operand(op, insn.width())?;
            let result = dec_value(cpu, value, insn.width());
            cpu.write_operand(op, insn.width(), result)
        }
        // CALL near r/m
        0b010 => {
            let target = cpu.read_rm(insn)?;
            cpu.push_sized(cpu.registers.eip, insn.op32)?;
            cpu.set_ip(target, insn.op32);
            Ok(())
        }
        // CALL far m16:v
        0b011 => {
            let (selector, offset) = read_far_pointer(cpu, insn)?;
            far_call(cpu, selector, offset, insn.op32)
        }
        // JMP near r/m
        0b100 => {
            let target = cpu.read_rm(insn)?;
            cpu.set_ip(target, insn.op32);
            Ok(())
        }
        // JMP far m16:v
        0b101 => {
            let (selector, offset) = read_far_pointer(cpu, insn)?;
            far_jump(cpu, selector, offset, insn.op32)
        }
        // PUSH r/m
        0b110 => {
            let value = cpu.read_rm(insn)?;
            cpu.push_sized(value, insn.op32)
        }
        _ => Err(Exception::InvalidOpcode),
    }
}

fn read_far_pointer(cpu: &mut Cpu, insn: &Instruction) -> Result<(u16, u32), Exception> {
    let Operand::Mem { seg, offset } = insn.rm_operand() else {
        return Err(Exception::InvalidOpcode);
    };
    let (target, sel_offset) = if insn.op32 {
        (cpu.read_mem32(seg, offset)?, 4)
    } else {
        (cpu.read_mem16(seg, offset)? as u32, 2)
    };
    let selector = cpu.read_mem16(seg, offset.wrapping_add(sel_offset))?;
    Ok((selector, target))
}

// ── Far transfers ───────────────────────────────────────────────────────

/// EA: JMP ptr16:16/32.
pub fn jmp_far_direct(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    far_jump(cpu, insn.imm2 as u16, insn.imm, insn.op32)
}

/// 9A: CALL ptr16:16/32.
pub fn call_far_direct(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    far_call(cpu, insn.imm2 as u16, insn.imm, insn.op32)
}

/// Validate a far-branch code-segment target against the privilege rules.
/// `through_gate` relaxes the RPL test (the gate supplied the selector).
fn check_code_target(
    cpu: &Cpu,
    selector: u16,
    descriptor: &CodeSegment,
    through_gate: bool,
) -> Result<(), Exception> {
    let error = selector_error(selector);
    let rpl = (selector & 3) as u8;
    if descriptor.conforming {
        if descriptor.dpl > cpu.cpl {
            return Err(Exception::GeneralProtection(error));
        }
    } else if through_gate {
        if descriptor.dpl > cpu.cpl {
            return Err(Exception::GeneralProtection(error));
        }
    } else {
        if rpl > cpu.cpl || descriptor.dpl != cpu.cpl {
            return Err(Exception::GeneralProtection(error));
        }
    }
    if !descriptor.present {
        return Err(Exception::NotPresent(error));
    }
    Ok(())
}

pub fn far_jump(cpu: &mut Cpu, selector: u16, offset: u32, op32: bool) -> Result<(), Exception> {
    if !cpu.protected_mode() {
        cpu.load_real_mode_segment(SegReg::CS, selector);
        cpu.set_ip(offset, op32);
        return Ok(());
    }

    if selector & !3 == 0 {
        return Err(Exception::gp0());
    }
    match cpu.read_descriptor(selector)? {
        Descriptor::Code(code) => {
            check_code_target(cpu, selector, &code, false)?;
            let offset = if op32 { offset } else { offset & 0xFFFF };
            if offset > code.limit {
                return Err(Exception::gp0());
            }
            cpu.set_cs(selector, code, cpu.cpl);
            cpu.registers.eip = offset;
            Ok(())
        }
        Descriptor::Gate(gate) if gate.kind == GateKind::Call => {
            through_call_gate(cpu, selector, gate, JumpType::Jmp)
        }
        Descriptor::Tss(tss) => {
            if tss.busy {
                return Err(Exception::GeneralProtection(selector_error(selector)));
            }
            tasking::task_switch(cpu, selector, tss, JumpType::Jmp)
        }
        Descriptor::TaskGate(gate) => through_task_gate(cpu, gate.selector, JumpType::Jmp),
        _ => Err(Exception::GeneralProtection(selector_error(selector))),
    }
}

pub fn far_call(cpu: &mut Cpu, selector: u16, offset: u32, op32: bool) -> Result<(), Exception> {
    if !cpu.protected_mode() {
        let return_cs = cpu.registers.seg(SegReg::CS).selector;
        let return_ip = cpu.registers.eip;
        cpu.push_sized(return_cs as u32, op32)?;
        cpu.push_sized(return_ip, op32)?;
        cpu.load_real_mode_segment(SegReg::CS, selector);
        cpu.set_ip(offset, op32);
        return Ok(());
    }

    if selector & !3 == 0 {
        return Err(Exception::gp0());
    }
    match cpu.read_descriptor(selector)? {
        Descriptor::Code(code) => {
            check_code_target(cpu, selector, &code, false)?;
            let offset = if op32 { offset } else { offset & 0xFFFF };
            if offset > code.limit {
                return Err(Exception::gp0());
            }
            let return_cs = cpu.registers.seg(SegReg::CS).selector;
            let return_ip = cpu.registers.eip;
            cpu.push_sized(return_cs as u32, op32)?;
            cpu.push_sized(return_ip, op32)?;
            cpu.set_cs(selector, code, cpu.cpl);
            cpu.registers.eip = offset;
            Ok(())
        }
        Descriptor::Gate(gate) if gate.kind == GateKind::Call => {
            through_call_gate(cpu, selector, gate, JumpType::Call)
        }
        Descriptor::Tss(tss) => {
            if tss.busy {
                return Err(Exception::GeneralProtection(selector_error(selector)));
            }
            tasking::task_switch(cpu, selector, tss, JumpType::Call)
        }
        Descriptor::TaskGate(gate) => through_task_gate(cpu, gate.selector, JumpType::Call),
        _ => Err(Exception::GeneralProtection(selector_error(selector))),
    }
}

fn through_task_gate(cpu: &mut Cpu, tss_selector: u16, kind: JumpType) -> Result<(), Exception> {
    let error = selector_error(tss_selector);
    if tss_selector & 4 != 0 {
        return Err(Exception::GeneralProtection(error));
    }
    match cpu.read_descriptor(tss_selector)? {
        Descriptor::Tss(tss) if !tss.busy => tasking::task_switch(cpu, tss_selector, tss, kind),
        Descriptor::Tss(_) => Err(Exception::GeneralProtection(error)),
        _ => Err(Exception::GeneralProtection(error)),
    }
}

/// JMP/CALL through a call gate, switching to the inner-ring stack when the
/// target is more privileged. Far CALL does not push flags; only INT does.
fn through_call_gate(
    cpu: &mut Cpu,
    gate_selector: u16,
    gate: Gate,
    kind: JumpType,
) -> Result<(), Exception> {
    let error = selector_error(gate_selector);
    let rpl = (gate_selector & 3) as u8;
    if gate.dpl < cpu.cpl || gate.dpl < rpl {
        return Err(Exception::GeneralProtection(error));
    }
    if !gate.present {
        return Err(Exception::NotPresent(error));
    }

    let target = gate.selector;
    if target & !3 == 0 {
        return Err(Exception::gp0());
    }
    let code = match cpu.read_descriptor(target)? {
        Descriptor::Code(code) => code,
        _ => return Err(Exception::GeneralProtection(selector_error(target))),
    };
    check_code_target(cpu, target, &code, true)?;

    let offset = if gate.size32 {
        gate.offset
    } else {
        gate.offset & 0xFFFF
    };
    if offset > code.limit {
        return Err(Exception::gp0());
    }

    let escalate =
        kind == JumpType::Call && !code.conforming && code.dpl < cpu.cpl;

    if escalate {
        let new_cpl = code.dpl;
        let (new_ss, new_esp) = tasking::ring_stack(cpu, new_cpl)?;
        let ss_data = tasking::check_inner_stack(cpu, new_ss, new_cpl)?;

        let old_ss = cpu.registers.seg(SegReg::SS).selector;
        let old_esp = cpu.registers.esp();
        let old_cs = cpu.registers.seg(SegReg::CS).selector;
        let old_eip = cpu.registers.eip;

        // Parameter words travel from the outer stack to the inner one.
        let mut params = Vec::with_capacity(gate.param_count as usize);
        let mut reader = Popper::new();
        for _ in 0..gate.param_count {
            params.push(reader.pop_sized(cpu, gate.size32)?);
        }

        debug!(
            "[cpu] call gate ring{} -> ring{}, ss:esp {:04x}:{:08x} -> {:04x}:{:08x}",
            cpu.cpl, new_cpl, old_ss, old_esp, new_ss, new_esp
        );

        cpu.set_ss(new_ss, ss_data, new_cpl);
        cpu.registers.set_esp(new_esp);

        cpu.push_sized(old_ss as u32, gate.size32)?;
        cpu.push_sized(old_esp, gate.size32)?;
        for value in params.iter().rev() {
            cpu.push_sized(*value, gate.size32)?;
        }
        cpu.push_sized(old_cs as u32, gate.size32)?;
        cpu.push_sized(old_eip, gate.size32)?;

        cpu.set_cs(target, code, new_cpl);
        cpu.registers.eip = offset;
        return Ok(());
    }

    if kind == JumpType::Call {
        let return_cs = cpu.registers.seg(SegReg::CS).selector;
        let return_ip = cpu.registers.eip;
        cpu.push_sized(return_cs as u32, gate.size32)?;
        cpu.push_sized(return_ip, gate.size32)?;
    }
    cpu.set_cs(target, code, cpu.cpl);
    cpu.registers.eip = offset;
    Ok(())
}

// ── Far returns ─────────────────────────────────────────────────────────

/// CB/CA: RET far [imm16].
pub fn ret_far(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let release = if insn.opcode == 0xCA {
        insn.imm16() as u32
    } else {
        0
    };
    far_return(cpu, insn.op32, release)
}

pub fn far_return(cpu: &mut Cpu, op32: bool, release: u32) -> Result<(), Exception> {
    if !cpu.protected_mode() {
        let mut popper = Popper::new();
        let target = popper.pop_sized(cpu, op32)?;
        let selector = popper.pop_sized(cpu, op32)? as u16;
        popper.skip(release);
        popper.commit(cpu);
        cpu.load_real_mode_segment(SegReg::CS, selector);
        cpu.set_ip(target, op32);
        return Ok(());
    }

    let mut popper = Popper::new();
    let target = popper.pop_sized(cpu, op32)?;
    let selector = popper.pop_sized(cpu, op32)? as u16;
    popper.skip(release);

    let rpl = (selector & 3) as u8;
    if rpl < cpu.cpl {
        return Err(Exception::GeneralProtection(selector_error(selector)));
    }
    if selector & !3 == 0 {
        return Err(Exception::gp0());
    }
    let code = match cpu.read_descriptor(selector)? {
        Descriptor::Code(code) => code,
        _ => return Err(Exception::GeneralProtection(selector_error(selector))),
    };
    if code.conforming {
        if code.dpl > rpl {
            return Err(Exception::GeneralProtection(selector_error(selector)));
        }
    } else if code.dpl != rpl {
        return Err(Exception::GeneralProtection(selector_error(selector)));
    }
    if !code.present {
        return Err(Exception::NotPresent(selector_error(selector)));
    }

    let offset = if op32 { target } else { target & 0xFFFF };
    if offset > code.limit {
        return Err(Exception::gp0());
    }

    if rpl > cpu.cpl {
        // Outward return: the caller's SS:ESP comes off this stack too.
        let new_esp = popper.pop_sized(cpu, op32)?;
        let new_ss = popper.pop_sized(cpu, op32)? as u16;
        let ss_data = tasking::check_outer_stack(cpu, new_ss, rpl)?;

        cpu.set_cs(selector, code, rpl);
        cpu.registers.eip = offset;
        cpu.set_ss(new_ss, ss_data, rpl);
        cpu.registers
            .set_esp(new_esp.wrapping_add(release));
        cpu.zero_stale_segments();
        return Ok(());
    }

    popper.commit(cpu);
    cpu.set_cs(selector, code, rpl);
    cpu.registers.eip = offset;
    Ok(())
}

// ── INT / INTO / IRET ───────────────────────────────────────────────────

/// CC: INT3.
pub fn int3(cpu: &mut Cpu, _insn: &Instruction) -> Result<(), Exception> {
    interrupt(cpu, 3, InterruptSource::Internal, None)
}

/// CD: INT imm8.
pub fn int_imm(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    if cpu.vm86() && cpu.flags.iopl() < 3 {
        return Err(Exception::gp0());
    }
    interrupt(cpu, insn.imm8(), InterruptSource::Internal, None)
}

/// CE: INTO.
pub fn into(cpu: &mut Cpu, _insn: &Instruction) -> Result<(), Exception> {
    if cpu.flags.check(Overflow) {
        interrupt(cpu, 4, InterruptSource::Internal, None)?;
    }
    Ok(())
}

/// CF: IRET.
pub fn iret(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    if cpu.protected_mode() && cpu.flags.check(NestedTask) {
        // Task return through the back-link of the current TSS.
        let link = tasking::read_back_link(cpu)?;
        return through_task_gate_for_iret(cpu, link);
    }
    iret_stack(cpu, insn.op32)
}

fn through_task_gate_for_iret(cpu: &mut Cpu, tss_selector: u16) -> Result<(), Exception> {
    let error = selector_error(tss_selector);
    match cpu.read_descriptor(tss_selector)? {
        Descriptor::Tss(tss) if tss.busy => {
            tasking::task_switch(cpu, tss_selector, tss, JumpType::Iret)
        }
        Descriptor::Tss(_) => Err(Exception::InvalidTss(error)),
        _ => Err(Exception::InvalidTss(error)),
    }
}

fn iret_stack(cpu: &mut Cpu, op32: bool) -> Result<(), Exception> {
    if !cpu.protected_mode() {
        if cpu.vm86() && cpu.flags.iopl() < 3 {
            return Err(Exception::gp0());
        }
        let mut popper = Popper::new();
        let target = popper.pop_sized(cpu, op32)?;
        let selector = popper.pop_sized(cpu, op32)? as u16;
        let flags = popper.pop_sized(cpu, op32)?;
        popper.commit(cpu);
        cpu.load_real_mode_segment(SegReg::CS, selector);
        cpu.set_ip(target, op32);
        let mask: u32 = if op32 { 0x0024_7FD7 } else { 0x0000_7FD7 };
        // VM86 IRET may not touch IOPL or VM.
        let mask = if cpu.vm86() {
            mask & !(IOPL_MASK | 0x0002_0000)
        } else {
            mask & !0x0002_0000
        };
        cpu.flags.set_eflags_masked(flags, mask);
        return Ok(());
    }

    let mut popper = Popper::new();
    let target = popper.pop_sized(cpu, op32)?;
    let selector = popper.pop_sized(cpu, op32)? as u16;
    let flags = popper.pop_sized(cpu, op32)?;

    // 32-bit IRET at CPL 0 with VM set in the image returns to VM86.
    if op32 && cpu.cpl == 0 && flags & 0x0002_0000 != 0 {
        let new_esp = popper.pop32(cpu)?;
        let new_ss = popper.pop32(cpu)? as u16;
        let new_es = popper.pop32(cpu)? as u16;
        let new_ds = popper.pop32(cpu)? as u16;
        let new_fs = popper.pop32(cpu)? as u16;
        let new_gs = popper.pop32(cpu)? as u16;

        cpu.flags.set_eflags(flags | 0x0002_0000);
        cpu.load_real_mode_segment(SegReg::CS, selector);
        cpu.load_real_mode_segment(SegReg::SS, new_ss);
        cpu.load_real_mode_segment(SegReg::ES, new_es);
        cpu.load_real_mode_segment(SegReg::DS, new_ds);
        cpu.load_real_mode_segment(SegReg::FS, new_fs);
        cpu.load_real_mode_segment(SegReg::GS, new_gs);
        cpu.registers.set_esp(new_esp);
        cpu.set_ip(target, true);
        cpu.cpl = 3;
        return Ok(());
    }

    let rpl = (selector & 3) as u8;
    if rpl < cpu.cpl {
        return Err(Exception::GeneralProtection(selector_error(selector)));
    }
    if selector & !3 == 0 {
        return Err(Exception::gp0());
    }
    let code = match cpu.read_descriptor(selector)? {
        Descriptor::Code(code) => code,
        _ => return Err(Exception::GeneralProtection(selector_error(selector))),
    };
    if code.conforming {
        if code.dpl > rpl {
            return Err(Exception::GeneralProtection(selector_error(selector)));
        }
    } else if code.dpl != rpl {
        return Err(Exception::GeneralProtection(selector_error(selector)));
    }
    if !code.present {
        return Err(Exception::NotPresent(selector_error(selector)));
    }

    let offset = if op32 { target } else { target & 0xFFFF };
    if offset > code.limit {
        return Err(Exception::gp0());
    }

    let old_cpl = cpu.cpl;
    if rpl > old_cpl {
        let new_esp = popper.pop_sized(cpu, op32)?;
        let new_ss = popper.pop_sized(cpu, op32)? as u16;
        let ss_data = tasking::check_outer_stack(cpu, new_ss, rpl)?;

        apply_iret_flags(cpu, flags, op32, old_cpl);
        cpu.set_cs(selector, code, rpl);
        cpu.registers.eip = offset;
        cpu.set_ss(new_ss, ss_data, rpl);
        cpu.registers.set_esp(new_esp);
        cpu.zero_stale_segments();
        return Ok(());
    }

    popper.commit(cpu);
    apply_iret_flags(cpu, flags, op32, old_cpl);
    cpu.set_cs(selector, code, rpl);
    cpu.registers.eip = offset;
    Ok(())
}

/// EFLAGS filtering on IRET: IOPL changes only at CPL 0; IF only when
/// CPL <= IOPL; VM is never set this way (the VM86 path handled it already).
fn apply_iret_flags(cpu: &mut Cpu, flags: u32, op32: bool, cpl: u8) {
    let mut mask: u32 = if op32 { 0x0024_7FD7 } else { 0x0000_7FD7 };
    mask &= !0x0003_0000; // VM, RF
    if cpl > 0 {
        mask &= !IOPL_MASK;
    }
    if cpl > cpu.flags.iopl() {
        mask &= !(1 << Interrupt as u8);
    }
    cpu.flags.set_eflags_masked(flags, mask);
}

// ── Interrupt/exception delivery ────────────────────────────────────────

/// Deliver vector `vector` through the IVT (real mode) or IDT (protected
/// mode), pushing the error code for exceptions that carry one.
pub fn interrupt(
    cpu: &mut Cpu,
    vector: u8,
    source: InterruptSource,
    error_code: Option<u16>,
) -> Result<(), Exception> {
    if cpu.pe() {
        protected_mode_interrupt(cpu, vector, source, error_code)
    } else {
        real_mode_interrupt(cpu, vector)
    }
}

fn real_mode_interrupt(cpu: &mut Cpu, vector: u8) -> Result<(), Exception> {
    let entry = vector as u32 * 4;
    let offset = cpu.memory.read_phys16(entry);
    let selector = cpu.memory.read_phys16(entry + 2);

    let flags = cpu.flags.eflags() as u16;
    let return_cs = cpu.registers.seg(SegReg::CS).selector;
    let return_ip = cpu.registers.eip;

    cpu.push16(flags)?;
    cpu.push16(return_cs)?;
    cpu.push16(return_ip as u16)?;

    cpu.flags.unset(Interrupt);
    cpu.flags.unset(Trap);

    cpu.load_real_mode_segment(SegReg::CS, selector);
    cpu.registers.eip = offset as u32;
    Ok(())
}

fn protected_mode_interrupt(
    cpu: &mut Cpu,
    vector: u8,
    source: InterruptSource,
    error_code: Option<u16>,
) -> Result<(), Exception> {
    let idtr = cpu.registers.idtr;
    let entry_offset = vector as u32 * 8;
    if entry_offset as u64 + 7 > idtr.limit as u64 {
        return Err(Exception::GeneralProtection(idt_error(vector, source)));
    }
    let entry_addr = idtr.base.wrapping_add(entry_offset);
    let lo = cpu.read_linear32_as(entry_addr, crate::vm::paging::AccessKind::Read, false)?;
    let hi = cpu.read_linear32_as(
        entry_addr.wrapping_add(4),
        crate::vm::paging::AccessKind::Read,
        false,
    )?;
    let raw = lo as u64 | ((hi as u64) << 32);

    let gate = match Descriptor::parse(raw) {
        Descriptor::Gate(gate) => gate,
        Descriptor::TaskGate(task_gate) => {
            if source == InterruptSource::Internal && task_gate.dpl < cpu.cpl {
                return Err(Exception::GeneralProtection(idt_error(vector, source)));
            }
            if !task_gate.present {
                return Err(Exception::NotPresent(idt_error(vector, source)));
            }
            return interrupt_to_task_gate(cpu, task_gate.selector, source, error_code);
        }
        _ => return Err(Exception::GeneralProtection(idt_error(vector, source))),
    };
    if gate.kind == GateKind::Call {
        return Err(Exception::GeneralProtection(idt_error(vector, source)));
    }

    // Software interrupts may not escalate through a high-DPL gate.
    if source == InterruptSource::Internal && gate.dpl < cpu.cpl {
        return Err(Exception::GeneralProtection(idt_error(vector, source)));
    }
    if !gate.present {
        return Err(Exception::NotPresent(idt_error(vector, source)));
    }
    if gate.selector & !3 == 0 {
        return Err(Exception::GeneralProtection(
            (source == InterruptSource::External) as u16,
        ));
    }

    let code = match cpu.read_descriptor(gate.selector)? {
        Descriptor::Code(code) => code,
        _ => {
            return Err(Exception::GeneralProtection(gate_selector_error(
                gate.selector,
                source,
            )))
        }
    };
    if code.dpl > cpu.cpl {
        return Err(Exception::GeneralProtection(gate_selector_error(
            gate.selector,
            source,
        )));
    }
    if !code.present {
        return Err(Exception::NotPresent(gate_selector_error(
            gate.selector,
            source,
        )));
    }

    let mut offset = gate.offset;
    if !gate.size32 || !code.default_32 {
        offset &= 0xFFFF;
    }
    if offset > code.limit {
        return Err(Exception::gp0());
    }

    let flags = cpu.flags.eflags();
    let old_ss = cpu.registers.seg(SegReg::SS).selector;
    let old_esp = cpu.registers.esp();
    let old_cs = cpu.registers.seg(SegReg::CS).selector;
    let old_eip = cpu.registers.eip;
    let old_cpl = cpu.cpl;

    let from_vm86 = cpu.vm86();
    if from_vm86 {
        // Leaving VM86 is only defined toward ring 0.
        if code.dpl != 0 {
            return Err(Exception::GeneralProtection(gate_selector_error(
                gate.selector,
                source,
            )));
        }
        let (new_ss, new_esp) = tasking::ring_stack(cpu, 0)?;
        let ss_data = tasking::check_inner_stack(cpu, new_ss, 0)?;

        let old_gs = cpu.registers.seg(SegReg::GS).selector;
        let old_fs = cpu.registers.seg(SegReg::FS).selector;
        let old_ds = cpu.registers.seg(SegReg::DS).selector;
        let old_es = cpu.registers.seg(SegReg::ES).selector;

        cpu.flags.unset(Vm86);
        cpu.cpl = 0;
        cpu.set_ss(new_ss, ss_data, 0);
        cpu.registers.set_esp(new_esp);

        cpu.push_sized(old_gs as u32, gate.size32)?;
        cpu.push_sized(old_fs as u32, gate.size32)?;
        cpu.push_sized(old_ds as u32, gate.size32)?;
        cpu.push_sized(old_es as u32, gate.size32)?;
        for seg in [SegReg::GS, SegReg::FS, SegReg::DS, SegReg::ES] {
            cpu.write_segment_register(seg, 0)?;
        }
        cpu.push_sized(old_ss as u32, gate.size32)?;
        cpu.push_sized(old_esp, gate.size32)?;
    } else if !code.conforming && code.dpl < old_cpl {
        // Inner-ring delivery: stack comes from the TSS.
        let new_cpl = code.dpl;
        let (new_ss, new_esp) = tasking::ring_stack(cpu, new_cpl)?;
        let ss_data = tasking::check_inner_stack(cpu, new_ss, new_cpl)?;

        debug!(
            "[cpu] int {vector:#04x} escalating ring{old_cpl} -> ring{new_cpl}, \
             ss:esp {old_ss:04x}:{old_esp:08x} -> {new_ss:04x}:{new_esp:08x}"
        );

        cpu.cpl = new_cpl;
        cpu.set_ss(new_ss, ss_data, new_cpl);
        cpu.registers.set_esp(new_esp);

        cpu.push_sized(old_ss as u32, gate.size32)?;
        cpu.push_sized(old_esp, gate.size32)?;
    }

    cpu.push_sized(flags, gate.size32)?;
    cpu.push_sized(old_cs as u32, gate.size32)?;
    cpu.push_sized(old_eip, gate.size32)?;
    if let Some(code_value) = error_code {
        cpu.push_sized(code_value as u32, gate.size32)?;
    }

    if gate.kind == GateKind::Interrupt {
        cpu.flags.unset(Interrupt);
    }
    cpu.flags.unset(Trap);
    cpu.flags.unset(Resume);
    cpu.flags.unset(NestedTask);

    cpu.set_cs(gate.selector, code, cpu.cpl);
    cpu.registers.eip = offset;
    Ok(())
}

fn interrupt_to_task_gate(
    cpu: &mut Cpu,
    tss_selector: u16,
    source: InterruptSource,
    error_code: Option<u16>,
) -> Result<(), Exception> {
    let error = gate_selector_error(tss_selector, source);
    if tss_selector & 4 != 0 {
        return Err(Exception::GeneralProtection(error));
    }
    let tss = match cpu.read_descriptor(tss_selector)? {
        Descriptor::Tss(tss) if !tss.busy && tss.present => tss,
        _ => return Err(Exception::GeneralProtection(error)),
    };
    tasking::task_switch(cpu, tss_selector, tss, JumpType::Int)?;
    if let Some(code_value) = error_code {
        cpu.push_sized(code_value as u32, tss.size32)?;
    }
    Ok(())
}

// ── BOUND ───────────────────────────────────────────────────────────────

/// 62: BOUND reg, mem: signed range check against a two-element bounds
/// block; out of range raises #BR.
pub fn bound(cpu: &mut Cpu, insn: &Instruction) -> Result<(), Exception> {
    let Operand::Mem { seg, offset } = insn.rm_operand() else {
        return Err(Exception::InvalidOpcode);
    };
    if insn.op32 {
        let index = cpu.registers.read_reg32(insn.reg()) as i32;
        let lower = cpu.read_mem32(seg, offset)? as i32;
        let upper = cpu.read_mem32(seg, offset.wrapping_add(4))? as i32;
        if index < lower || index > upper {
            return Err(Exception::BoundRange);
        }
    } else {
        let index = cpu.registers.read_reg16(insn.reg()) as i16;
        let lower = cpu.read_mem16(seg, offset)? as i16;
        let upper = cpu.read_mem16(seg, offset.wrapping_add(2))? as i16;
        if index < lower || index > upper {
            return Err(Exception::BoundRange);
        }
    }
    Ok(())
}
