//! Hardware task switching through the TSS.

use log::debug;

use crate::vm::cpu::Cpu;
use crate::vm::descriptor::{DataSegment, Descriptor, TssDescriptor};
use crate::vm::exception::Exception;
use crate::vm::flags::CpuFlag;
use crate::vm::instructions::control::JumpType;
use crate::vm::paging::AccessKind;
use crate::vm::registers::{SegReg, CR0_TS};
use crate::vm::segment::selector_error;

// 32-bit TSS field offsets.
const TSS32_BACKLINK: u32 = 0x00;
const TSS32_ESP0: u32 = 0x04;
const TSS32_CR3: u32 = 0x1C;
const TSS32_EIP: u32 = 0x20;
const TSS32_EFLAGS: u32 = 0x24;
const TSS32_GPR: u32 = 0x28;
const TSS32_SEGS: u32 = 0x48;
const TSS32_LDT: u32 = 0x60;
const TSS32_MIN_LIMIT: u32 = 0x67;

// 16-bit TSS field offsets.
const TSS16_BACKLINK: u32 = 0x00;
const TSS16_SP0: u32 = 0x02;
const TSS16_IP: u32 = 0x0E;
const TSS16_FLAGS: u32 = 0x10;
const TSS16_GPR: u32 = 0x12;
const TSS16_SEGS: u32 = 0x22;
const TSS16_LDT: u32 = 0x2A;
const TSS16_MIN_LIMIT: u32 = 0x2B;

/// Offset of the I/O permission bitmap base word in a 32-bit TSS.
pub const TSS32_IOMAP_BASE: u32 = 0x66;

fn tss_read16(cpu: &mut Cpu, base: u32, offset: u32) -> Result<u16, Exception> {
    cpu.read_linear16_as(base.wrapping_add(offset), AccessKind::Read, false)
}

fn tss_read32(cpu: &mut Cpu, base: u32, offset: u32) -> Result<u32, Exception> {
    cpu.read_linear32_as(base.wrapping_add(offset), AccessKind::Read, false)
}

fn tss_write16(cpu: &mut Cpu, base: u32, offset: u32, value: u16) -> Result<(), Exception> {
    cpu.write_linear16_as(base.wrapping_add(offset), value, false)
}

fn tss_write32(cpu: &mut Cpu, base: u32, offset: u32, value: u32) -> Result<(), Exception> {
    cpu.write_linear32_as(base.wrapping_add(offset), value, false)
}

/// The inner-ring SS:ESP pair stored in the current TSS for `dpl`.
pub fn ring_stack(cpu: &mut Cpu, dpl: u8) -> Result<(u16, u32), Exception> {
    let tr = cpu.registers.tr;
    let error = selector_error(tr.selector);
    if tr.size32 {
        let offset = TSS32_ESP0 + dpl as u32 * 8;
        if offset as u64 + 7 > tr.limit as u64 {
            return Err(Exception::InvalidTss(error));
        }
        let esp = tss_read32(cpu, tr.base, offset)?;
        let ss = tss_read16(cpu, tr.base, offset + 4)?;
        Ok((ss, esp))
    } else {
        let offset = TSS16_SP0 + dpl as u32 * 4;
        if offset as u64 + 3 > tr.limit as u64 {
            return Err(Exception::InvalidTss(error));
        }
        let sp = tss_read16(cpu, tr.base, offset)?;
        let ss = tss_read16(cpu, tr.base, offset + 2)?;
        Ok((ss, sp as u32))
    }
}

/// Back-link selector of the current task (IRET with NT set).
pub fn read_back_link(cpu: &mut Cpu) -> Result<u16, Exception> {
    let tr = cpu.registers.tr;
    if tr.limit < 2 {
        return Err(Exception::InvalidTss(selector_error(tr.selector)));
    }
    let offset = if tr.size32 { TSS32_BACKLINK } else { TSS16_BACKLINK };
    tss_read16(cpu, tr.base, offset)
}

/// Validate the TSS-supplied stack segment for an inward transition.
/// Failures here are #TS faults (#SS only for a missing segment).
pub fn check_inner_stack(
    cpu: &mut Cpu,
    selector: u16,
    dpl: u8,
) -> Result<DataSegment, Exception> {
    let error = selector_error(selector);
    if selector & !3 == 0 {
        return Err(Exception::InvalidTss(error));
    }
    let data = match cpu.read_descriptor(selector) {
        Ok(Descriptor::Data(data)) if data.writable => data,
        Ok(_) => return Err(Exception::InvalidTss(error)),
        Err(_) => return Err(Exception::InvalidTss(error)),
    };
    if data.dpl != dpl || (selector & 3) as u8 != dpl {
        return Err(Exception::InvalidTss(error));
    }
    if !data.present {
        return Err(Exception::StackFault(error));
    }
    Ok(data)
}

/// Validate the popped stack segment for an outward return (RET far/IRET).
pub fn check_outer_stack(
    cpu: &mut Cpu,
    selector: u16,
    rpl: u8,
) -> Result<DataSegment, Exception> {
    let error = selector_error(selector);
    if selector & !3 == 0 {
        return Err(Exception::gp0());
    }
    let data = match cpu.read_descriptor(selector)? {
        Descriptor::Data(data) if data.writable => data,
        _ => return Err(Exception::GeneralProtection(error)),
    };
    if data.dpl != rpl || (selector & 3) as u8 != rpl {
        return Err(Exception::GeneralProtection(error));
    }
    if !data.present {
        return Err(Exception::StackFault(error));
    }
    Ok(data)
}

/// Flip the busy bit of a TSS descriptor in the GDT.
fn set_tss_busy(cpu: &mut Cpu, selector: u16, busy: bool) -> Result<(), Exception> {
    let addr = cpu.descriptor_address(selector)?;
    let type_byte_addr = addr.wrapping_add(5);
    let byte = cpu.read_linear8_as(type_byte_addr, AccessKind::Read, false)?;
    let new = if busy { byte | 0x02 } else { byte & !0x02 };
    cpu.write_linear8_as(type_byte_addr, new, false)
}

/// Save outgoing state, load the incoming task, maintain busy bits and the
/// back-link, and set CR0.TS. Selectors from the incoming TSS are
/// re-validated and fault with #TS.
pub fn task_switch(
    cpu: &mut Cpu,
    selector: u16,
    tss: TssDescriptor,
    kind: JumpType,
) -> Result<(), Exception> {
    let error = selector_error(selector);
    let min_limit = if tss.size32 { TSS32_MIN_LIMIT } else { TSS16_MIN_LIMIT };
    if tss.limit < min_limit {
        return Err(Exception::InvalidTss(error));
    }

    debug!(
        "[cpu] task switch {:?} from {:04x} to {selector:04x} (tss32={})",
        kind, cpu.registers.tr.selector, tss.size32
    );

    // Store the outgoing context into the current TSS.
    let old_tr = cpu.registers.tr;
    let eflags_out = {
        let mut value = cpu.flags.eflags();
        if kind == JumpType::Iret {
            value &= !(1 << CpuFlag::NestedTask as u8);
        }
        value
    };
    if old_tr.size32 {
        let cr3 = cpu.registers.cr3;
        let eip = cpu.registers.eip;
        tss_write32(cpu, old_tr.base, TSS32_CR3, cr3)?;
        tss_write32(cpu, old_tr.base, TSS32_EIP, eip)?;
        tss_write32(cpu, old_tr.base, TSS32_EFLAGS, eflags_out)?;
        for reg in 0..8u8 {
            let value = cpu.registers.read_reg32(reg);
            tss_write32(cpu, old_tr.base, TSS32_GPR + reg as u32 * 4, value)?;
        }
        for (slot, seg) in [
            SegReg::ES,
            SegReg::CS,
            SegReg::SS,
            SegReg::DS,
            SegReg::FS,
            SegReg::GS,
        ]
        .into_iter()
        .enumerate()
        {
            let selector = cpu.registers.seg(seg).selector;
            tss_write16(cpu, old_tr.base, TSS32_SEGS + slot as u32 * 4, selector)?;
        }
    } else {
        let ip = cpu.registers.eip as u16;
        tss_write16(cpu, old_tr.base, TSS16_IP, ip)?;
        tss_write16(cpu, old_tr.base, TSS16_FLAGS, eflags_out as u16)?;
        for reg in 0..8u8 {
            let value = cpu.registers.read_reg16(reg);
            tss_write16(cpu, old_tr.base, TSS16_GPR + reg as u32 * 2, value)?;
        }
        for (slot, seg) in [SegReg::ES, SegReg::CS, SegReg::SS, SegReg::DS]
            .into_iter()
            .enumerate()
        {
            let selector = cpu.registers.seg(seg).selector;
            tss_write16(cpu, old_tr.base, TSS16_SEGS + slot as u32 * 2, selector)?;
        }
    }

    // Busy-bit bookkeeping: JMP and IRET leave the old task free; CALL/INT
    // keep it busy and record the link for the eventual IRET.
    match kind {
        JumpType::Jmp | JumpType::Iret => {
            if old_tr.selector & !3 != 0 {
                set_tss_busy(cpu, old_tr.selector, false)?;
            }
        }
        _ => {}
    }
    if kind != JumpType::Iret {
        set_tss_busy(cpu, selector, true)?;
    }
    if matches!(kind, JumpType::Call | JumpType::Int) {
        let offset = if tss.size32 { TSS32_BACKLINK } else { TSS16_BACKLINK };
        tss_write16(cpu, tss.base, offset, old_tr.selector)?;
    }

    cpu.registers.tr.selector = selector;
    cpu.registers.tr.base = tss.base;
    cpu.registers.tr.limit = tss.limit;
    cpu.registers.tr.size32 = tss.size32;
    cpu.registers.cr0 |= CR0_TS;

    // Load the incoming context.
    let (eip, eflags, ldt_selector);
    let mut selectors = [0u16; 6];
    if tss.size32 {
        cpu.registers.cr3 = tss_read32(cpu, tss.base, TSS32_CR3)?;
        eip = tss_read32(cpu, tss.base, TSS32_EIP)?;
        eflags = tss_read32(cpu, tss.base, TSS32_EFLAGS)?;
        for reg in 0..8u8 {
            let value = tss_read32(cpu, tss.base, TSS32_GPR + reg as u32 * 4)?;
            cpu.registers.write_reg32(reg, value);
        }
        for (slot, value) in selectors.iter_mut().enumerate() {
            *value = tss_read16(cpu, tss.base, TSS32_SEGS + slot as u32 * 4)?;
        }
        ldt_selector = tss_read16(cpu, tss.base, TSS32_LDT)?;
    } else {
        eip = tss_read16(cpu, tss.base, TSS16_IP)? as u32;
        eflags = tss_read16(cpu, tss.base, TSS16_FLAGS)? as u32;
        for reg in 0..8u8 {
            let value = tss_read16(cpu, tss.base, TSS16_GPR + reg as u32 * 2)?;
            cpu.registers.write_reg16(reg, value);
        }
        for (slot, value) in selectors.iter_mut().enumerate().take(4) {
            *value = tss_read16(cpu, tss.base, TSS16_SEGS + slot as u32 * 2)?;
        }
        ldt_selector = tss_read16(cpu, tss.base, TSS16_LDT)?;
    }

    let mut new_eflags = eflags;
    if matches!(kind, JumpType::Call | JumpType::Int) {
        new_eflags |= 1 << CpuFlag::NestedTask as u8;
    }
    cpu.flags.set_eflags(new_eflags);
    cpu.registers.eip = eip;

    // LDT first, the data segments resolve through it.
    load_task_ldt(cpu, ldt_selector)?;

    let [es, cs, ss, ds, fs, gs] = selectors;
    let cpl = (cs & 3) as u8;
    cpu.cpl = cpl;
    load_task_cs(cpu, cs)?;
    for (seg, value) in [
        (SegReg::SS, ss),
        (SegReg::DS, ds),
        (SegReg::ES, es),
        (SegReg::FS, fs),
        (SegReg::GS, gs),
    ] {
        cpu.write_segment_register(seg, value).map_err(|exc| match exc {
            Exception::GeneralProtection(code) | Exception::NotPresent(code) => {
                Exception::InvalidTss(code)
            }
            other => other,
        })?;
    }

    Ok(())
}

fn load_task_ldt(cpu: &mut Cpu, selector: u16) -> Result<(), Exception> {
    if selector & !3 == 0 {
        cpu.registers.ldtr.selector = selector;
        cpu.registers.ldtr.base = 0;
        cpu.registers.ldtr.limit = 0;
        return Ok(());
    }
    let error = selector_error(selector);
    if selector & 4 != 0 {
        return Err(Exception::InvalidTss(error));
    }
    match cpu.read_descriptor(selector) {
        Ok(Descriptor::Ldt(ldt)) if ldt.present => {
            cpu.registers.ldtr.selector = selector;
            cpu.registers.ldtr.base = ldt.base;
            cpu.registers.ldtr.limit = ldt.limit;
            Ok(())
        }
        _ => Err(Exception::InvalidTss(error)),
    }
}

fn load_task_cs(cpu: &mut Cpu, selector: u16) -> Result<(), Exception> {
    let error = selector_error(selector);
    if selector & !3 == 0 {
        return Err(Exception::InvalidTss(error));
    }
    match cpu.read_descriptor(selector) {
        Ok(Descriptor::Code(code)) => {
            let rpl = (selector & 3) as u8;
            if code.conforming {
                if code.dpl > rpl {
                    return Err(Exception::InvalidTss(error));
                }
            } else if code.dpl != rpl {
                return Err(Exception::InvalidTss(error));
            }
            if !code.present {
                return Err(Exception::NotPresent(error));
            }
            cpu.set_cs(selector, code, rpl);
            Ok(())
        }
        _ => Err(Exception::InvalidTss(error)),
    }
}
