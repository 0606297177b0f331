use std::collections::VecDeque;
use std::time::Duration;

use log::{debug, error, warn};

use crate::io::bus::IoBus;
use crate::io::pic::Pic;
use crate::vm::exception::Exception;
use crate::vm::flags::{CpuFlag, Flags};
use crate::vm::instructions::control::{self, InterruptSource};
use crate::vm::memory::Memory;
use crate::vm::registers::{Registers, SegReg, CR0_PE, CR0_PG};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuState {
    Alive,
    Dead,
}

/// Externally queued requests, latched and serviced at the slow-path check
/// between instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    EnterDebugger,
    ExitDebugger,
    HardReboot,
}

/// The whole machine state owned by one execution thread: register file,
/// flags, memory, I/O dispatch and the PIC the main loop polls.
pub struct Cpu {
    pub registers: Registers,
    pub flags: Flags,
    pub memory: Memory,
    pub bus: IoBus,
    pub pic: Pic,
    pub cpl: u8,
    pub halted: bool,
    pub state: CpuState,
    pub cycle: u64,
    /// CS:EIP at the start of the current instruction, restored before an
    /// exception is delivered.
    pub base_cs: u16,
    pub base_eip: u32,
    /// Set by MOV SS / POP SS / STI: skip the IRQ and trap checks once.
    pub interrupt_inhibit: bool,
    /// Nesting depth of exception delivery, for #DF escalation.
    exception_depth: u32,
    commands: VecDeque<Command>,
    in_debugger: bool,
    /// Instruction budget for autotest runs; `None` means run forever.
    pub cycle_limit: Option<u64>,
    /// Entry point override used instead of the BIOS vector.
    pub autotest_entry: Option<(u16, u32)>,
}

impl Cpu {
    pub fn new(memory: Memory) -> Self {
        let mut cpu = Self {
            registers: Registers::new(),
            flags: Flags::new(),
            memory,
            bus: IoBus::new(),
            pic: Pic::new(),
            cpl: 0,
            halted: false,
            state: CpuState::Alive,
            cycle: 0,
            base_cs: 0,
            base_eip: 0,
            interrupt_inhibit: false,
            exception_depth: 0,
            commands: VecDeque::new(),
            in_debugger: false,
            cycle_limit: None,
            autotest_entry: None,
        };
        cpu.reset();
        cpu
    }

    /// Power-on / hard-reboot state: zeroed registers, empty descriptor
    /// tables, IF set with IOPL 3, execution resuming at the BIOS entry
    /// (or the autotest entry when configured).
    pub fn reset(&mut self) {
        let entry = self.autotest_entry;
        self.registers = Registers::new();
        self.flags = Flags::new();
        self.flags.set(CpuFlag::Interrupt);
        self.flags.set_iopl(3);
        self.cpl = 0;
        self.halted = false;
        self.state = CpuState::Alive;
        self.interrupt_inhibit = false;
        self.exception_depth = 0;

        let (cs, eip) = entry.unwrap_or((0xF000, 0));
        self.load_real_mode_segment(SegReg::CS, cs);
        self.registers.eip = eip;
        for seg in [SegReg::DS, SegReg::ES, SegReg::SS, SegReg::FS, SegReg::GS] {
            self.load_real_mode_segment(seg, 0);
        }
    }

    // ── Mode predicates ─────────────────────────────────────────────────

    #[inline(always)]
    pub fn pe(&self) -> bool {
        self.registers.cr0 & CR0_PE != 0
    }

    #[inline(always)]
    pub fn paging_enabled(&self) -> bool {
        self.registers.cr0 & CR0_PG != 0
    }

    #[inline(always)]
    pub fn vm86(&self) -> bool {
        self.flags.check(CpuFlag::Vm86)
    }

    /// Protected mode proper: PE set and not in VM86.
    #[inline(always)]
    pub fn protected_mode(&self) -> bool {
        self.pe() && !self.vm86()
    }

    /// Default operand/address size from the current CS descriptor.
    #[inline(always)]
    pub fn code_32(&self) -> bool {
        self.registers.seg(SegReg::CS).cache.default_32
    }

    // ── Instruction stream ──────────────────────────────────────────────

    #[inline]
    pub fn fetch8(&mut self) -> Result<u8, Exception> {
        let eip = self.registers.eip;
        let byte = self.read_code8(eip)?;
        self.registers.eip = eip.wrapping_add(1);
        Ok(byte)
    }

    #[inline]
    pub fn fetch16(&mut self) -> Result<u16, Exception> {
        let eip = self.registers.eip;
        let word = self.read_code16(eip)?;
        self.registers.eip = eip.wrapping_add(2);
        Ok(word)
    }

    #[inline]
    pub fn fetch32(&mut self) -> Result<u32, Exception> {
        let eip = self.registers.eip;
        let dword = self.read_code32(eip)?;
        self.registers.eip = eip.wrapping_add(4);
        Ok(dword)
    }

    /// Set EIP from a control transfer, truncating to 16 bits for 16-bit
    /// operand size.
    #[inline]
    pub fn set_ip(&mut self, eip: u32, op32: bool) {
        self.registers.eip = if op32 { eip } else { eip & 0xFFFF };
    }

    // ── Exception delivery ──────────────────────────────────────────────

    /// Deliver `exc` through the interrupt protocol. EIP has already been
    /// rewound to the faulting instruction by the caller (the main loop).
    /// Nested faults escalate to #DF and then to a triple-fault shutdown.
    pub fn raise_exception(&mut self, exc: Exception) {
        if let Exception::PageFault { address, .. } = exc {
            self.registers.cr2 = address;
        }
        debug!(
            "[cpu] {} at {:04x}:{:08x} (cycle {})",
            exc, self.base_cs, self.base_eip, self.cycle
        );

        self.exception_depth += 1;
        let result = control::interrupt(
            self,
            exc.vector(),
            InterruptSource::Exception,
            exc.error_code(),
        );
        self.exception_depth -= 1;

        if let Err(nested) = result {
            if matches!(exc, Exception::DoubleFault) || self.exception_depth > 0 {
                error!(
                    "[cpu] triple fault ({nested} while delivering {exc}), shutting down"
                );
                self.state = CpuState::Dead;
            } else if exc.is_contributory()
                && (nested.is_contributory() || matches!(nested, Exception::PageFault { .. }))
            {
                self.raise_exception(Exception::DoubleFault);
            } else if matches!(exc, Exception::PageFault { .. })
                && (nested.is_contributory() || matches!(nested, Exception::PageFault { .. }))
            {
                self.raise_exception(Exception::DoubleFault);
            } else {
                self.raise_exception(nested);
            }
        }
    }

    // ── Main loop ───────────────────────────────────────────────────────

    /// Decode and execute exactly one instruction. Faults propagate to the
    /// caller with EIP still advanced; the caller rewinds to `base_eip`.
    pub fn step(&mut self) -> Result<(), Exception> {
        self.base_cs = self.registers.seg(SegReg::CS).selector;
        self.base_eip = self.registers.eip;
        let insn = self.decode()?;
        self.execute(&insn)
    }

    pub fn queue_command(&mut self, command: Command) {
        self.commands.push_back(command);
    }

    fn service_commands(&mut self) {
        while let Some(command) = self.commands.pop_front() {
            match command {
                Command::EnterDebugger => {
                    self.in_debugger = true;
                    self.halted = false;
                }
                Command::ExitDebugger => self.in_debugger = false,
                Command::HardReboot => {
                    warn!("[cpu] hard reboot");
                    self.memory.reset();
                    self.reset();
                }
            }
        }
    }

    /// The fetch-decode-execute forever loop.
    pub fn run(&mut self) {
        while self.state == CpuState::Alive {
            if !self.commands.is_empty() {
                self.service_commands();
            }
            if self.in_debugger {
                // Debugger console is external; just idle until released.
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
            if let Some(limit) = self.cycle_limit {
                if self.cycle >= limit {
                    debug!("[cpu] cycle limit {limit} reached");
                    return;
                }
            }
            if self.halted {
                self.idle();
                continue;
            }

            self.run_one();
        }
    }

    /// One iteration of the hot loop: instruction, then trap/IRQ servicing.
    fn run_one(&mut self) {
        if let Err(exc) = self.step() {
            self.registers.eip = self.base_eip;
            self.raise_exception(exc);
            return;
        }

        // MOV SS / POP SS / STI shadow: the next instruction runs with
        // traps and IRQs held off.
        if std::mem::take(&mut self.interrupt_inhibit) {
            return;
        }

        if self.flags.check(CpuFlag::Trap) {
            self.base_cs = self.registers.seg(SegReg::CS).selector;
            self.base_eip = self.registers.eip;
            self.raise_exception(Exception::Debug);
            return;
        }

        self.poll_irq();
    }

    /// Service a pending PIC interrupt when IF allows it.
    fn poll_irq(&mut self) {
        if !self.flags.check(CpuFlag::Interrupt) || !self.pic.has_interrupt() {
            return;
        }
        let Some(vector) = self.pic.acknowledge() else {
            return;
        };
        self.halted = false;
        self.base_cs = self.registers.seg(SegReg::CS).selector;
        self.base_eip = self.registers.eip;
        if let Err(exc) = control::interrupt(self, vector, InterruptSource::External, None) {
            self.registers.eip = self.base_eip;
            self.raise_exception(exc);
        }
    }

    /// HLT idle loop: sleep at low frequency until an IRQ, a queued
    /// command, or shutdown wakes us.
    fn idle(&mut self) {
        if self.flags.check(CpuFlag::Interrupt) && self.pic.has_interrupt() {
            self.poll_irq();
            return;
        }
        if !self.flags.check(CpuFlag::Interrupt) {
            // IF=0 with no NMI source modeled: the guest has stopped.
            warn!("[cpu] HLT with IF=0, shutting down");
            self.state = CpuState::Dead;
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Non-architectural fatal condition (host OOM, corrupt configuration).
pub fn hard_exit(message: &str) -> ! {
    error!("[cpu] fatal: {message}");
    std::process::exit(1);
}
