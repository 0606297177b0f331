use crate::vm::cpu::Cpu;
use crate::vm::descriptor::{CodeSegment, DataSegment, Descriptor, SegKind, SegmentCache};
use crate::vm::exception::Exception;
use crate::vm::paging::AccessKind;
use crate::vm::registers::SegReg;

/// Selector-error code: index and TI, RPL cleared.
#[inline]
pub fn selector_error(selector: u16) -> u16 {
    selector & !3
}

impl Cpu {
    // ── Segmented access ────────────────────────────────────────────────

    /// Segmentation step of the address pipeline: rights and limit checks,
    /// then `descriptor.base + offset`. The fault is #SS instead of #GP
    /// when the descriptor was loaded into SS.
    pub fn linear_address(
        &self,
        seg: SegReg,
        offset: u32,
        size: u32,
        kind: AccessKind,
    ) -> Result<u32, Exception> {
        let cache = &self.registers.seg(seg).cache;

        if self.protected_mode() {
            let fault = || {
                if cache.loaded_in_ss {
                    Exception::ss0()
                } else {
                    Exception::gp0()
                }
            };
            if cache.is_null() {
                return Err(fault());
            }
            match kind {
                AccessKind::Read => {
                    if !cache.readable() {
                        return Err(Exception::gp0());
                    }
                }
                AccessKind::Write => {
                    if !cache.writable() {
                        return Err(fault());
                    }
                }
                AccessKind::Execute => {
                    if !cache.is_code() {
                        return Err(Exception::gp0());
                    }
                }
            }
            if !cache.covers(offset, size) {
                return Err(fault());
            }
        }

        Ok(cache.base.wrapping_add(offset))
    }

    pub fn read_mem8(&mut self, seg: SegReg, offset: u32) -> Result<u8, Exception> {
        let laddr = self.linear_address(seg, offset, 1, AccessKind::Read)?;
        self.read_linear8(laddr, AccessKind::Read)
    }

    pub fn read_mem16(&mut self, seg: SegReg, offset: u32) -> Result<u16, Exception> {
        let laddr = self.linear_address(seg, offset, 2, AccessKind::Read)?;
        self.read_linear16(laddr, AccessKind::Read)
    }

    pub fn read_mem32(&mut self, seg: SegReg, offset: u32) -> Result<u32, Exception> {
        let laddr = self.linear_address(seg, offset, 4, AccessKind::Read)?;
        self.read_linear32(laddr, AccessKind::Read)
    }

    pub fn write_mem8(&mut self, seg: SegReg, offset: u32, value: u8) -> Result<(), Exception> {
        let laddr = self.linear_address(seg, offset, 1, AccessKind::Write)?;
        self.write_linear8(laddr, value)
    }

    pub fn write_mem16(&mut self, seg: SegReg, offset: u32, value: u16) -> Result<(), Exception> {
        let laddr = self.linear_address(seg, offset, 2, AccessKind::Write)?;
        self.write_linear16(laddr, value)
    }

    pub fn write_mem32(&mut self, seg: SegReg, offset: u32, value: u32) -> Result<(), Exception> {
        let laddr = self.linear_address(seg, offset, 4, AccessKind::Write)?;
        self.write_linear32(laddr, value)
    }

    pub fn read_code8(&mut self, offset: u32) -> Result<u8, Exception> {
        let laddr = self.linear_address(SegReg::CS, offset, 1, AccessKind::Execute)?;
        self.read_linear8(laddr, AccessKind::Execute)
    }

    pub fn read_code16(&mut self, offset: u32) -> Result<u16, Exception> {
        let laddr = self.linear_address(SegReg::CS, offset, 2, AccessKind::Execute)?;
        self.read_linear16(laddr, AccessKind::Execute)
    }

    pub fn read_code32(&mut self, offset: u32) -> Result<u32, Exception> {
        let laddr = self.linear_address(SegReg::CS, offset, 4, AccessKind::Execute)?;
        self.read_linear32(laddr, AccessKind::Execute)
    }

    // ── Descriptor table access ─────────────────────────────────────────

    /// Linear address of a selector's 8-byte table entry; checks the table
    /// limit. `error_code` extra bits (EXT) are the caller's business.
    pub fn descriptor_address(&self, selector: u16) -> Result<u32, Exception> {
        let index = (selector & !7) as u32;
        if selector & 4 != 0 {
            let ldtr = self.registers.ldtr;
            if ldtr.selector & !3 == 0 {
                return Err(Exception::GeneralProtection(selector_error(selector)));
            }
            if index as u64 + 7 > ldtr.limit as u64 {
                return Err(Exception::GeneralProtection(selector_error(selector)));
            }
            Ok(ldtr.base.wrapping_add(index))
        } else {
            let gdtr = self.registers.gdtr;
            if index as u64 + 7 > gdtr.limit as u64 {
                return Err(Exception::GeneralProtection(selector_error(selector)));
            }
            Ok(gdtr.base.wrapping_add(index))
        }
    }

    /// Read a selector's raw descriptor words (supervisor access).
    pub fn read_descriptor_raw(&mut self, selector: u16) -> Result<u64, Exception> {
        let addr = self.descriptor_address(selector)?;
        let lo = self.read_linear32_as(addr, AccessKind::Read, false)?;
        let hi = self.read_linear32_as(addr.wrapping_add(4), AccessKind::Read, false)?;
        Ok(lo as u64 | ((hi as u64) << 32))
    }

    pub fn read_descriptor(&mut self, selector: u16) -> Result<Descriptor, Exception> {
        let raw = self.read_descriptor_raw(selector)?;
        Ok(Descriptor::parse(raw))
    }

    /// Non-faulting descriptor lookup used by LAR/LSL/VERR/VERW.
    pub fn probe_descriptor(&mut self, selector: u16) -> Option<(Descriptor, u64)> {
        if selector & !3 == 0 {
            return None;
        }
        let raw = self.read_descriptor_raw(selector).ok()?;
        Some((Descriptor::parse(raw), raw))
    }

    // ── Segment register loads ──────────────────────────────────────────

    pub fn load_real_mode_segment(&mut self, seg: SegReg, selector: u16) {
        let mut cache = SegmentCache::real_mode(selector, seg == SegReg::CS);
        cache.loaded_in_ss = seg == SegReg::SS;
        let reg = self.registers.seg_mut(seg);
        reg.selector = selector;
        reg.cache = cache;
    }

    /// Protected-mode CS load. All type/DPL checks are done by the control
    /// transfer before calling this; the cache RPL is forced to the new CPL
    /// so `CPL == CS.RPL` holds.
    pub fn set_cs(&mut self, selector: u16, descriptor: CodeSegment, cpl: u8) {
        let mut cache = descriptor.cache(cpl);
        cache.rpl = cpl;
        let reg = self.registers.seg_mut(SegReg::CS);
        reg.selector = (selector & !3) | cpl as u16;
        reg.cache = cache;
        self.cpl = cpl;
    }

    pub fn set_ss(&mut self, selector: u16, descriptor: DataSegment, cpl: u8) {
        let mut cache = descriptor.cache(cpl, true);
        cache.rpl = cpl;
        let reg = self.registers.seg_mut(SegReg::SS);
        reg.selector = (selector & !3) | cpl as u16;
        reg.cache = cache;
    }

    /// Selector load for SS/DS/ES/FS/GS (MOV sreg / POP sreg / LxS /
    /// task-switch reload). CS goes through the control-flow protocol.
    pub fn write_segment_register(
        &mut self,
        seg: SegReg,
        selector: u16,
    ) -> Result<(), Exception> {
        debug_assert!(seg != SegReg::CS);

        if !self.protected_mode() {
            self.load_real_mode_segment(seg, selector);
            return Ok(());
        }

        let rpl = (selector & 3) as u8;
        let error = selector_error(selector);

        if seg == SegReg::SS {
            if selector & !3 == 0 {
                return Err(Exception::gp0());
            }
            let descriptor = self.read_descriptor(selector)?;
            let data = match descriptor {
                Descriptor::Data(data) if data.writable => data,
                _ => return Err(Exception::GeneralProtection(error)),
            };
            if data.dpl != self.cpl || rpl != self.cpl {
                return Err(Exception::GeneralProtection(error));
            }
            if !data.present {
                return Err(Exception::StackFault(error));
            }
            let reg = self.registers.seg_mut(SegReg::SS);
            reg.selector = selector;
            reg.cache = data.cache(rpl, true);
            return Ok(());
        }

        // Null selector is legal in a data segment register; the cache goes
        // null and any access through it faults.
        if selector & !3 == 0 {
            let reg = self.registers.seg_mut(seg);
            reg.selector = selector;
            reg.cache = SegmentCache::null();
            return Ok(());
        }

        let descriptor = self.read_descriptor(selector)?;
        let cache = match descriptor {
            Descriptor::Data(data) => {
                if data.dpl < self.cpl.max(rpl) {
                    return Err(Exception::GeneralProtection(error));
                }
                if !data.present {
                    return Err(Exception::NotPresent(error));
                }
                data.cache(rpl, false)
            }
            Descriptor::Code(code) if code.readable => {
                if !code.conforming && code.dpl < self.cpl.max(rpl) {
                    return Err(Exception::GeneralProtection(error));
                }
                if !code.present {
                    return Err(Exception::NotPresent(error));
                }
                code.cache(rpl)
            }
            _ => return Err(Exception::GeneralProtection(error)),
        };

        let reg = self.registers.seg_mut(seg);
        reg.selector = selector;
        reg.cache = cache;
        Ok(())
    }

    /// After an outward privilege transition, data segment registers whose
    /// descriptor is not reachable from the new CPL are force-nulled.
    pub fn zero_stale_segments(&mut self) {
        for seg in [SegReg::DS, SegReg::ES, SegReg::FS, SegReg::GS] {
            let cache = &self.registers.seg(seg).cache;
            let stale = match cache.kind {
                SegKind::Null => false,
                SegKind::Code { conforming: true, .. } => false,
                _ => cache.dpl < self.cpl,
            };
            if stale {
                let reg = self.registers.seg_mut(seg);
                reg.selector = 0;
                reg.cache = SegmentCache::null();
            }
        }
    }
}
