//! GDT/LDT/IDT entry decoding.
//!
//! Raw 8-byte table entries decode into tagged variants so that every
//! selector-load and control-transfer path can match exhaustively on what it
//! found instead of downcasting.

/// What a segment register's shadow cache currently describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegKind {
    Null,
    Code { conforming: bool, readable: bool },
    Data { writable: bool, expand_down: bool },
}

/// Cached (shadow) segment descriptor, refreshed on every segment register
/// write. `loaded_in_ss` picks #SS over #GP for faults through this segment;
/// `rpl` is carried from the selector that loaded it.
#[derive(Debug, Clone, Copy)]
pub struct SegmentCache {
    pub base: u32,
    pub limit: u32, // granularity-expanded
    pub kind: SegKind,
    pub dpl: u8,
    pub present: bool,
    pub default_32: bool,
    pub granularity: bool,
    pub rpl: u8,
    pub loaded_in_ss: bool,
}

impl SegmentCache {
    pub fn null() -> Self {
        Self {
            base: 0,
            limit: 0,
            kind: SegKind::Null,
            dpl: 0,
            present: false,
            default_32: false,
            granularity: false,
            rpl: 0,
            loaded_in_ss: false,
        }
    }

    /// Real-mode/VM86 segment: base = selector << 4, 64 KiB limit, always
    /// present and writable.
    pub fn real_mode(selector: u16, code: bool) -> Self {
        Self {
            base: (selector as u32) << 4,
            limit: 0xFFFF,
            kind: if code {
                SegKind::Code {
                    conforming: false,
                    readable: true,
                }
            } else {
                SegKind::Data {
                    writable: true,
                    expand_down: false,
                }
            },
            dpl: 0,
            present: true,
            default_32: false,
            granularity: false,
            rpl: 0,
            loaded_in_ss: false,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self.kind, SegKind::Null)
    }

    #[inline]
    pub fn is_code(&self) -> bool {
        matches!(self.kind, SegKind::Code { .. })
    }

    #[inline]
    pub fn readable(&self) -> bool {
        match self.kind {
            SegKind::Null => false,
            SegKind::Code { readable, .. } => readable,
            SegKind::Data { .. } => true,
        }
    }

    #[inline]
    pub fn writable(&self) -> bool {
        matches!(self.kind, SegKind::Data { writable: true, .. })
    }

    /// Limit check for an access of `size` bytes at `offset`. Expand-down
    /// data segments invert the test: valid offsets lie above the limit up
    /// to the segment ceiling (64K or 4G per the B bit).
    pub fn covers(&self, offset: u32, size: u32) -> bool {
        let last = offset as u64 + size as u64 - 1;
        match self.kind {
            SegKind::Data { expand_down: true, .. } => {
                let ceiling: u64 = if self.default_32 { 0xFFFF_FFFF } else { 0xFFFF };
                offset as u64 > self.limit as u64 && last <= ceiling
            }
            _ => last <= self.limit as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    Call,
    Interrupt,
    Trap,
}

#[derive(Debug, Clone, Copy)]
pub struct Gate {
    pub kind: GateKind,
    pub selector: u16,
    pub offset: u32,
    pub param_count: u8,
    pub dpl: u8,
    pub present: bool,
    pub size32: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TssDescriptor {
    pub base: u32,
    pub limit: u32, // granularity-expanded
    pub dpl: u8,
    pub present: bool,
    pub busy: bool,
    pub size32: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct LdtDescriptor {
    pub base: u32,
    pub limit: u32,
    pub present: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TaskGate {
    pub selector: u16,
    pub dpl: u8,
    pub present: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct CodeSegment {
    pub base: u32,
    pub limit: u32, // granularity-expanded
    pub conforming: bool,
    pub readable: bool,
    pub dpl: u8,
    pub present: bool,
    pub default_32: bool,
    pub granularity: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct DataSegment {
    pub base: u32,
    pub limit: u32, // granularity-expanded
    pub writable: bool,
    pub expand_down: bool,
    pub dpl: u8,
    pub present: bool,
    pub default_32: bool,
    pub granularity: bool,
}

/// A decoded descriptor-table entry.
#[derive(Debug, Clone, Copy)]
pub enum Descriptor {
    Null,
    Code(CodeSegment),
    Data(DataSegment),
    Gate(Gate),
    Tss(TssDescriptor),
    Ldt(LdtDescriptor),
    TaskGate(TaskGate),
    Invalid { type_bits: u8 },
}

impl Descriptor {
    /// Decode the raw 8-byte table entry.
    pub fn parse(raw: u64) -> Self {
        if raw == 0 {
            return Descriptor::Null;
        }

        let type_bits = ((raw >> 40) & 0xF) as u8;
        let s = raw & (1 << 44) != 0;
        let dpl = ((raw >> 45) & 3) as u8;
        let present = raw & (1 << 47) != 0;

        if s {
            let base =
                ((raw >> 16) & 0xFF_FFFF) as u32 | ((((raw >> 56) & 0xFF) as u32) << 24);
            let raw_limit = (raw & 0xFFFF) as u32 | (((raw >> 48) & 0xF) as u32) << 16;
            let granularity = raw & (1 << 55) != 0;
            let limit = if granularity {
                (raw_limit << 12) | 0xFFF
            } else {
                raw_limit
            };
            let default_32 = raw & (1 << 54) != 0;

            if type_bits & 0x8 != 0 {
                Descriptor::Code(CodeSegment {
                    base,
                    limit,
                    conforming: type_bits & 0x4 != 0,
                    readable: type_bits & 0x2 != 0,
                    dpl,
                    present,
                    default_32,
                    granularity,
                })
            } else {
                Descriptor::Data(DataSegment {
                    base,
                    limit,
                    writable: type_bits & 0x2 != 0,
                    expand_down: type_bits & 0x4 != 0,
                    dpl,
                    present,
                    default_32,
                    granularity,
                })
            }
        } else {
            let selector = ((raw >> 16) & 0xFFFF) as u16;
            let gate_offset = (raw & 0xFFFF) as u32 | (((raw >> 48) & 0xFFFF) as u32) << 16;
            let base =
                ((raw >> 16) & 0xFF_FFFF) as u32 | ((((raw >> 56) & 0xFF) as u32) << 24);
            let raw_limit = (raw & 0xFFFF) as u32 | (((raw >> 48) & 0xF) as u32) << 16;
            let granularity = raw & (1 << 55) != 0;
            let limit = if granularity {
                (raw_limit << 12) | 0xFFF
            } else {
                raw_limit
            };

            match type_bits {
                0x1 | 0x3 | 0x9 | 0xB => Descriptor::Tss(TssDescriptor {
                    base,
                    limit,
                    dpl,
                    present,
                    busy: type_bits & 0x2 != 0,
                    size32: type_bits & 0x8 != 0,
                }),
                0x2 => Descriptor::Ldt(LdtDescriptor {
                    base,
                    limit,
                    present,
                }),
                0x4 | 0xC => Descriptor::Gate(Gate {
                    kind: GateKind::Call,
                    selector,
                    offset: gate_offset,
                    param_count: ((raw >> 32) & 0x1F) as u8,
                    dpl,
                    present,
                    size32: type_bits == 0xC,
                }),
                0x5 => Descriptor::TaskGate(TaskGate {
                    selector,
                    dpl,
                    present,
                }),
                0x6 | 0xE => Descriptor::Gate(Gate {
                    kind: GateKind::Interrupt,
                    selector,
                    offset: gate_offset,
                    param_count: 0,
                    dpl,
                    present,
                    size32: type_bits == 0xE,
                }),
                0x7 | 0xF => Descriptor::Gate(Gate {
                    kind: GateKind::Trap,
                    selector,
                    offset: gate_offset,
                    param_count: 0,
                    dpl,
                    present,
                    size32: type_bits == 0xF,
                }),
                _ => Descriptor::Invalid { type_bits },
            }
        }
    }

    pub fn dpl(&self) -> u8 {
        match self {
            Descriptor::Null | Descriptor::Invalid { .. } => 0,
            Descriptor::Code(seg) => seg.dpl,
            Descriptor::Data(seg) => seg.dpl,
            Descriptor::Gate(gate) => gate.dpl,
            Descriptor::Tss(tss) => tss.dpl,
            Descriptor::Ldt(_) => 0,
            Descriptor::TaskGate(gate) => gate.dpl,
        }
    }

    pub fn present(&self) -> bool {
        match self {
            Descriptor::Null | Descriptor::Invalid { .. } => false,
            Descriptor::Code(seg) => seg.present,
            Descriptor::Data(seg) => seg.present,
            Descriptor::Gate(gate) => gate.present,
            Descriptor::Tss(tss) => tss.present,
            Descriptor::Ldt(ldt) => ldt.present,
            Descriptor::TaskGate(gate) => gate.present,
        }
    }
}

impl CodeSegment {
    pub fn cache(&self, rpl: u8) -> SegmentCache {
        SegmentCache {
            base: self.base,
            limit: self.limit,
            kind: SegKind::Code {
                conforming: self.conforming,
                readable: self.readable,
            },
            dpl: self.dpl,
            present: self.present,
            default_32: self.default_32,
            granularity: self.granularity,
            rpl,
            loaded_in_ss: false,
        }
    }
}

impl DataSegment {
    pub fn cache(&self, rpl: u8, loaded_in_ss: bool) -> SegmentCache {
        SegmentCache {
            base: self.base,
            limit: self.limit,
            kind: SegKind::Data {
                writable: self.writable,
                expand_down: self.expand_down,
            },
            dpl: self.dpl,
            present: self.present,
            default_32: self.default_32,
            granularity: self.granularity,
            rpl,
            loaded_in_ss,
        }
    }
}
