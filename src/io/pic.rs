use log::debug;

/// Where the ICW1..ICW4 programming handshake currently stands. Command
/// writes with bit 4 set restart it; data-port writes advance it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitSequence {
    Idle,
    AwaitVector,
    AwaitCascade,
    AwaitMode,
}

/// 8259A interrupt controller. Device models raise IRQ lines here; the CPU
/// polls `has_interrupt` between instructions and calls `acknowledge` to
/// vector the highest-priority pending request. The CPU owns this model
/// directly and routes ports 0x20/0x21 to it ahead of the I/O bus.
pub struct Pic {
    irr: u8,
    isr: u8,
    imr: u8,
    /// Programmed by ICW2; the low three bits come from the IRQ number.
    vector_base: u8,
    init: InitSequence,
    expect_icw4: bool,
    cascaded: bool,
    level_triggered: bool,
    auto_eoi: bool,
    /// OCW3 picks which register the command port reads back.
    report_isr: bool,
    /// Line levels, for edge detection.
    lines: u8,
}

impl Pic {
    pub fn new() -> Self {
        Self {
            irr: 0,
            isr: 0,
            imr: 0xFF,
            vector_base: 8,
            init: InitSequence::Idle,
            expect_icw4: false,
            cascaded: false,
            level_triggered: false,
            auto_eoi: false,
            report_isr: false,
            lines: 0,
        }
    }

    /// Set a physical IRQ line level. Edge-triggered mode latches IRR on
    /// the rising edge only; level-triggered mode follows the line.
    pub fn set_irq_line(&mut self, irq: u8, level: bool) {
        let bit = 1u8 << irq;
        if level {
            let rising = self.lines & bit == 0;
            self.lines |= bit;
            if rising || self.level_triggered {
                self.irr |= bit;
            }
        } else {
            self.lines &= !bit;
        }
    }

    /// Convenience: pulse an IRQ line (rising edge then deassert).
    pub fn raise_irq(&mut self, irq: u8) {
        self.set_irq_line(irq, true);
        self.set_irq_line(irq, false);
    }

    /// The IRQ an INTA cycle would take right now: unmasked, requested,
    /// and of higher priority (lower number) than anything in service.
    fn serviceable(&self) -> Option<u8> {
        let candidates = self.irr & !self.imr;
        if candidates == 0 {
            return None;
        }
        let irq = candidates.trailing_zeros() as u8;
        if self.isr != 0 && irq >= self.isr.trailing_zeros() as u8 {
            return None;
        }
        Some(irq)
    }

    pub fn has_interrupt(&self) -> bool {
        self.serviceable().is_some()
    }

    /// Acknowledge the winning request and return its vector. An INTA with
    /// nothing requested anymore yields the spurious IRQ7 vector without
    /// marking anything in service.
    pub fn acknowledge(&mut self) -> Option<u8> {
        if self.irr & !self.imr == 0 {
            debug!(
                "[pic] ack with empty request register (IRR={:02X} IMR={:02X}), spurious IRQ7",
                self.irr, self.imr
            );
            return Some(self.vector_base + 7);
        }
        let irq = self.serviceable()?;
        self.irr &= !(1 << irq);
        if !self.auto_eoi {
            self.isr |= 1 << irq;
        }
        Some(self.vector_base + irq)
    }

    /// Drop an IRQ from service: the named one (specific EOI), or the
    /// highest-priority one in service (non-specific EOI).
    fn clear_in_service(&mut self, irq: Option<u8>) {
        let bit = match irq {
            Some(irq) => 1u8 << irq,
            None if self.isr != 0 => 1u8 << self.isr.trailing_zeros(),
            None => return,
        };
        self.isr &= !bit;
    }

    /// Non-specific EOI, for callers that bypass the port interface.
    pub fn eoi(&mut self) {
        self.clear_in_service(None);
    }

    pub fn set_imr(&mut self, value: u8) {
        self.imr = value;
    }

    pub fn handle_port_in(&mut self, port: u16) -> u8 {
        match port {
            0x20 => {
                if self.report_isr {
                    self.isr
                } else {
                    self.irr
                }
            }
            0x21 => self.imr,
            _ => 0xFF,
        }
    }

    pub fn handle_port_out(&mut self, port: u16, value: u8) {
        match port {
            0x20 if value & 0x10 != 0 => self.start_init(value),
            // OCW3: register read-back select
            0x20 if value & 0x08 != 0 => self.report_isr = value & 0x01 != 0,
            0x20 => self.ocw2(value),
            0x21 => self.data_write(value),
            _ => {}
        }
    }

    /// ICW1: reset the controller state and open the handshake.
    fn start_init(&mut self, icw1: u8) {
        self.expect_icw4 = icw1 & 0x01 != 0;
        self.cascaded = icw1 & 0x02 == 0;
        self.level_triggered = icw1 & 0x08 != 0;
        self.irr = 0;
        self.isr = 0;
        self.imr = 0;
        self.lines = 0;
        self.auto_eoi = false;
        self.report_isr = false;
        self.init = InitSequence::AwaitVector;
        debug!("[pic] ICW1={icw1:02X} cascaded={} icw4={}", self.cascaded, self.expect_icw4);
    }

    fn ocw2(&mut self, value: u8) {
        match value & 0xE0 {
            // non-specific EOI
            0x20 => self.clear_in_service(None),
            // specific EOI
            0x60 => self.clear_in_service(Some(value & 0x07)),
            other => debug!("[pic] unhandled OCW2 {other:#04x}"),
        }
    }

    /// Data-port writes are ICW2..ICW4 while the handshake runs, OCW1
    /// (the mask) once it is done.
    fn data_write(&mut self, value: u8) {
        self.init = match self.init {
            InitSequence::AwaitVector => {
                self.vector_base = value & 0xF8;
                if self.cascaded {
                    InitSequence::AwaitCascade
                } else if self.expect_icw4 {
                    InitSequence::AwaitMode
                } else {
                    InitSequence::Idle
                }
            }
            // Slave wiring is not modeled; the handshake just advances.
            InitSequence::AwaitCascade => {
                if self.expect_icw4 {
                    InitSequence::AwaitMode
                } else {
                    InitSequence::Idle
                }
            }
            InitSequence::AwaitMode => {
                self.auto_eoi = value & 0x02 != 0;
                InitSequence::Idle
            }
            InitSequence::Idle => {
                if self.imr != value {
                    debug!("[pic] mask {:02X} -> {value:02X}", self.imr);
                }
                self.imr = value;
                InitSequence::Idle
            }
        };
    }
}

impl Default for Pic {
    fn default() -> Self {
        Self::new()
    }
}
