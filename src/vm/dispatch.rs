//! Table-driven opcode dispatch.
//!
//! Both opcode pages are built once, at first use, from the declarative
//! lists below. The hot path is a single indirect call through the table;
//! the mnemonic rides along for trace logging.

use std::sync::OnceLock;

use crate::vm::cpu::Cpu;
use crate::vm::exception::Exception;
use crate::vm::instr::Instruction;
use crate::vm::instructions::{alu, control, mov, shift, stack, string, system};

pub type Handler = fn(&mut Cpu, &Instruction) -> Result<(), Exception>;

#[derive(Clone, Copy)]
pub struct OpcodeEntry {
    pub mnemonic: &'static str,
    pub handler: Handler,
}

struct Tables {
    one: [OpcodeEntry; 256],
    two: [OpcodeEntry; 256],
}

/// (first opcode, last opcode, mnemonic, handler): inclusive ranges.
type Row = (u8, u8, &'static str, Handler);

const ONE_BYTE: &[Row] = &[
    (0x00, 0x05, "add", alu::arith),
    (0x06, 0x06, "push es", stack::push_sreg),
    (0x07, 0x07, "pop es", stack::pop_sreg),
    (0x08, 0x0D, "or", alu::arith),
    (0x0E, 0x0E, "push cs", stack::push_sreg),
    (0x10, 0x15, "adc", alu::arith),
    (0x16, 0x16, "push ss", stack::push_sreg),
    (0x17, 0x17, "pop ss", stack::pop_sreg),
    (0x18, 0x1D, "sbb", alu::arith),
    (0x1E, 0x1E, "push ds", stack::push_sreg),
    (0x1F, 0x1F, "pop ds", stack::pop_sreg),
    (0x20, 0x25, "and", alu::arith),
    (0x27, 0x27, "daa", alu::daa),
    (0x28, 0x2D, "sub", alu::arith),
    (0x2F, 0x2F, "das", alu::das),
    (0x30, 0x35, "xor", alu::arith),
    (0x37, 0x37, "aaa", alu::aaa),
    (0x38, 0x3D, "cmp", alu::arith),
    (0x3F, 0x3F, "aas", alu::aas),
    (0x40, 0x4F, "inc/dec", alu::inc_dec_reg),
    (0x50, 0x57, "push", stack::push_reg),
    (0x58, 0x5F, "pop", stack::pop_reg),
    (0x60, 0x60, "pusha", stack::pusha),
    (0x61, 0x61, "popa", stack::popa),
    (0x62, 0x62, "bound", control::bound),
    (0x63, 0x63, "arpl", system::arpl),
    (0x68, 0x68, "push", stack::push_imm),
    (0x69, 0x69, "imul", alu::imul_imm),
    (0x6A, 0x6A, "push", stack::push_imm),
    (0x6B, 0x6B, "imul", alu::imul_imm),
    (0x6C, 0x6D, "ins", string::ins),
    (0x6E, 0x6F, "outs", string::outs),
    (0x70, 0x7F, "jcc", control::jcc_rel8),
    (0x80, 0x83, "grp1", alu::group1),
    (0x84, 0x85, "test", alu::test_rm_reg),
    (0x86, 0x87, "xchg", mov::xchg_rm_reg),
    (0x88, 0x8B, "mov", mov::mov_rm_reg),
    (0x8C, 0x8C, "mov", mov::mov_rm_sreg),
    (0x8D, 0x8D, "lea", mov::lea),
    (0x8E, 0x8E, "mov", mov::mov_sreg_rm),
    (0x8F, 0x8F, "pop", stack::pop_rm),
    (0x90, 0x90, "nop", mov::nop),
    (0x91, 0x97, "xchg", mov::xchg_acc_reg),
    (0x98, 0x98, "cbw", alu::cbw),
    (0x99, 0x99, "cwd", alu::cwd),
    (0x9A, 0x9A, "call far", control::call_far_direct),
    (0x9B, 0x9B, "wait", system::wait),
    (0x9C, 0x9C, "pushf", stack::pushf),
    (0x9D, 0x9D, "popf", stack::popf),
    (0x9E, 0x9E, "sahf", system::sahf),
    (0x9F, 0x9F, "lahf", system::lahf),
    (0xA0, 0xA3, "mov", mov::mov_moffs),
    (0xA4, 0xA5, "movs", string::movs),
    (0xA6, 0xA7, "cmps", string::cmps),
    (0xA8, 0xA9, "test", alu::test_acc_imm),
    (0xAA, 0xAB, "stos", string::stos),
    (0xAC, 0xAD, "lods", string::lods),
    (0xAE, 0xAF, "scas", string::scas),
    (0xB0, 0xBF, "mov", mov::mov_reg_imm),
    (0xC0, 0xC1, "grp2", shift::group2),
    (0xC2, 0xC3, "ret", control::ret_near),
    (0xC4, 0xC4, "les", mov::load_far_pointer),
    (0xC5, 0xC5, "lds", mov::load_far_pointer),
    (0xC6, 0xC7, "mov", mov::mov_rm_imm),
    (0xC8, 0xC8, "enter", stack::enter),
    (0xC9, 0xC9, "leave", stack::leave),
    (0xCA, 0xCB, "retf", control::ret_far),
    (0xCC, 0xCC, "int3", control::int3),
    (0xCD, 0xCD, "int", control::int_imm),
    (0xCE, 0xCE, "into", control::into),
    (0xCF, 0xCF, "iret", control::iret),
    (0xD0, 0xD3, "grp2", shift::group2),
    (0xD4, 0xD4, "aam", alu::aam),
    (0xD5, 0xD5, "aad", alu::aad),
    (0xD6, 0xD6, "salc", system::salc),
    (0xD7, 0xD7, "xlat", mov::xlat),
    (0xD8, 0xDF, "esc", system::fpu_escape),
    (0xE0, 0xE2, "loop", control::loop_rel8),
    (0xE3, 0xE3, "jcxz", control::jcxz),
    (0xE4, 0xE5, "in", system::in_port),
    (0xE6, 0xE7, "out", system::out_port),
    (0xE8, 0xE8, "call", control::call_rel),
    (0xE9, 0xE9, "jmp", control::jmp_rel),
    (0xEA, 0xEA, "jmp far", control::jmp_far_direct),
    (0xEB, 0xEB, "jmp", control::jmp_rel8),
    (0xEC, 0xED, "in", system::in_port),
    (0xEE, 0xEF, "out", system::out_port),
    (0xF4, 0xF4, "hlt", system::hlt),
    (0xF5, 0xF5, "cmc", system::cmc),
    (0xF6, 0xF7, "grp3", alu::group3),
    (0xF8, 0xF9, "clc/stc", system::clc_stc),
    (0xFA, 0xFA, "cli", system::cli),
    (0xFB, 0xFB, "sti", system::sti),
    (0xFC, 0xFD, "cld/std", system::cld_std),
    (0xFE, 0xFE, "grp4", alu::group4),
    (0xFF, 0xFF, "grp5", control::group5),
];

const TWO_BYTE: &[Row] = &[
    (0x00, 0x00, "grp6", system::group6),
    (0x01, 0x01, "grp7", system::group7),
    (0x02, 0x02, "lar", system::lar_lsl),
    (0x03, 0x03, "lsl", system::lar_lsl),
    (0x06, 0x06, "clts", system::clts),
    (0x08, 0x09, "invd", system::invd),
    (0x0B, 0x0B, "ud2", system::ud2),
    (0x20, 0x23, "mov cr/dr", system::mov_cr_dr),
    (0x80, 0x8F, "jcc", control::jcc_rel),
    (0x90, 0x9F, "setcc", mov::setcc),
    (0xA0, 0xA0, "push fs", stack::push_sreg),
    (0xA1, 0xA1, "pop fs", stack::pop_sreg),
    (0xA2, 0xA2, "cpuid", system::cpuid),
    (0xA3, 0xA3, "bt", alu::bt_reg),
    (0xA4, 0xA5, "shld", shift::shift_double),
    (0xA8, 0xA8, "push gs", stack::push_sreg),
    (0xA9, 0xA9, "pop gs", stack::pop_sreg),
    (0xAB, 0xAB, "bts", alu::bt_reg),
    (0xAC, 0xAD, "shrd", shift::shift_double),
    (0xAF, 0xAF, "imul", alu::imul_reg_rm),
    (0xB2, 0xB2, "lss", mov::load_far_pointer),
    (0xB3, 0xB3, "btr", alu::bt_reg),
    (0xB4, 0xB4, "lfs", mov::load_far_pointer),
    (0xB5, 0xB5, "lgs", mov::load_far_pointer),
    (0xB6, 0xB7, "movzx", mov::mov_extend),
    (0xBA, 0xBA, "grp8", alu::group8),
    (0xBB, 0xBB, "btc", alu::bt_reg),
    (0xBC, 0xBD, "bsf/bsr", alu::bit_scan),
    (0xBE, 0xBF, "movsx", mov::mov_extend),
];

fn build() -> Tables {
    let undefined = OpcodeEntry {
        mnemonic: "(bad)",
        handler: system::invalid,
    };
    let mut tables = Tables {
        one: [undefined; 256],
        two: [undefined; 256],
    };
    for &(first, last, mnemonic, handler) in ONE_BYTE {
        for opcode in first..=last {
            tables.one[opcode as usize] = OpcodeEntry { mnemonic, handler };
        }
    }
    for &(first, last, mnemonic, handler) in TWO_BYTE {
        for opcode in first..=last {
            tables.two[opcode as usize] = OpcodeEntry { mnemonic, handler };
        }
    }
    tables
}

fn tables() -> &'static Tables {
    static TABLES: OnceLock<Tables> = OnceLock::new();
    TABLES.get_or_init(build)
}

/// Table entry for an opcode; the disassembler side shares this lookup.
pub fn entry(opcode: u8, two_byte: bool) -> &'static OpcodeEntry {
    let tables = tables();
    if two_byte {
        &tables.two[opcode as usize]
    } else {
        &tables.one[opcode as usize]
    }
}

impl Cpu {
    /// Run one decoded instruction through the handler table.
    pub fn execute(&mut self, insn: &Instruction) -> Result<(), Exception> {
        if insn.invalid {
            return Err(Exception::InvalidOpcode);
        }
        (entry(insn.opcode, insn.two_byte).handler)(self, insn)?;
        self.cycle = self.cycle.wrapping_add(1);
        Ok(())
    }
}
