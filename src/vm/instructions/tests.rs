use crate::vm::cpu::{Cpu, CpuState};
use crate::vm::exception::Exception;
use crate::vm::flags::CpuFlag::*;
use crate::vm::memory::Memory;
use crate::vm::registers::{CR0_PE, CR0_PG, EAX, EBP, EBX, ECX, EDI, EDX, ESI, ESP, SegReg};

fn setup(code: &[u8]) -> Cpu {
    let memory = Memory::new(8 * 1024 * 1024);
    let mut cpu = Cpu::new(memory);
    // Run from 0000:0000 with stack room below 0000:FFFE.
    cpu.autotest_entry = Some((0, 0));
    cpu.reset();
    cpu.registers.write_reg16(ESP, 0xFFFE);
    cpu.memory.copy_data(0, code);
    cpu
}

fn exec(cpu: &mut Cpu) {
    cpu.step().expect("instruction faulted");
}

fn exec_n(cpu: &mut Cpu, n: usize) {
    for _ in 0..n {
        exec(cpu);
    }
}

fn exec_err(cpu: &mut Cpu) -> Exception {
    cpu.step().expect_err("instruction should have faulted")
}

// ========================================================================
// DATA TRANSFER
// ========================================================================

#[test]
fn mov_reg16_imm16() {
    // MOV AX,0x1234: the flags must survive untouched and EIP lands at 3.
    let mut cpu = setup(&[0xB8, 0x34, 0x12]);
    let flags_before = cpu.flags.eflags();
    exec(&mut cpu);
    assert_eq!(cpu.registers.read_reg16(EAX), 0x1234);
    assert_eq!(cpu.registers.eip, 3);
    assert_eq!(cpu.flags.eflags(), flags_before);
}

#[test]
fn mov_reg8_imm8_views() {
    // MOV AL,0x42; MOV AH,0xAB
    let mut cpu = setup(&[0xB0, 0x42, 0xB4, 0xAB]);
    exec_n(&mut cpu, 2);
    assert_eq!(cpu.registers.read_reg16(EAX), 0xAB42);
}

#[test]
fn mov_reg_reg_word() {
    // MOV AX,0x1234; MOV BX,AX  (89 C3)
    let mut cpu = setup(&[0xB8, 0x34, 0x12, 0x89, 0xC3]);
    exec_n(&mut cpu, 2);
    assert_eq!(cpu.registers.read_reg16(EBX), 0x1234);
}

#[test]
fn mov_mem_reg_word() {
    // MOV AX,0xABCD; MOV [0x100],AX  (A3 00 01)
    let mut cpu = setup(&[0xB8, 0xCD, 0xAB, 0xA3, 0x00, 0x01]);
    exec_n(&mut cpu, 2);
    assert_eq!(cpu.memory.read_phys16(0x100), 0xABCD);
}

#[test]
fn mov_al_moffs() {
    let mut cpu = setup(&[0xA0, 0x00, 0x02]);
    cpu.memory.write_phys8(0x200, 0x77);
    exec(&mut cpu);
    assert_eq!(cpu.registers.read_reg8(0), 0x77);
}

#[test]
fn mov_rm_imm_word() {
    // MOV WORD [0x100],0x5678  (C7 06 00 01 78 56)
    let mut cpu = setup(&[0xC7, 0x06, 0x00, 0x01, 0x78, 0x56]);
    exec(&mut cpu);
    assert_eq!(cpu.memory.read_phys16(0x100), 0x5678);
}

#[test]
fn operand_size_override_in_real_mode() {
    // 66 B8 78 56 34 12: MOV EAX,imm32 under a 16-bit default.
    let mut cpu = setup(&[0x66, 0xB8, 0x78, 0x56, 0x34, 0x12]);
    exec(&mut cpu);
    assert_eq!(cpu.registers.read_reg32(EAX), 0x1234_5678);
}

#[test]
fn xchg_reg_reg() {
    // MOV AX,1; MOV BX,2; XCHG AX,BX (93)
    let mut cpu = setup(&[0xB8, 0x01, 0x00, 0xBB, 0x02, 0x00, 0x93]);
    exec_n(&mut cpu, 3);
    assert_eq!(cpu.registers.read_reg16(EAX), 2);
    assert_eq!(cpu.registers.read_reg16(EBX), 1);
}

#[test]
fn xlat_translates() {
    // MOV BX,0x300; MOV AL,5; XLAT
    let mut cpu = setup(&[0xBB, 0x00, 0x03, 0xB0, 0x05, 0xD7]);
    cpu.memory.write_phys8(0x305, 0x99);
    exec_n(&mut cpu, 3);
    assert_eq!(cpu.registers.read_reg8(0), 0x99);
}

#[test]
fn lea_16bit_formula() {
    // MOV BX,0x10; MOV SI,0x20; LEA AX,[BX+SI+5]  (8D 40 05)
    let mut cpu = setup(&[0xBB, 0x10, 0x00, 0xBE, 0x20, 0x00, 0x8D, 0x40, 0x05]);
    exec_n(&mut cpu, 3);
    assert_eq!(cpu.registers.read_reg16(EAX), 0x35);
}

#[test]
fn movzx_movsx() {
    // MOV AL,0x80; MOVZX BX,AL (0F B6 D8); MOVSX CX,AL (0F BE C8)
    let mut cpu = setup(&[0xB0, 0x80, 0x0F, 0xB6, 0xD8, 0x0F, 0xBE, 0xC8]);
    exec_n(&mut cpu, 3);
    assert_eq!(cpu.registers.read_reg16(EBX), 0x0080);
    assert_eq!(cpu.registers.read_reg16(ECX), 0xFF80);
}

// ========================================================================
// ARITHMETIC & FLAGS
// ========================================================================

#[test]
fn add_al_wraps_with_flags() {
    // MOV AL,0xFF; ADD AL,1 wraps to zero with carry and aux carry.
    let mut cpu = setup(&[0xB0, 0xFF, 0x04, 0x01]);
    exec_n(&mut cpu, 2);
    assert_eq!(cpu.registers.read_reg8(0), 0);
    assert!(cpu.flags.check(Carry));
    assert!(cpu.flags.check(Zero));
    assert!(cpu.flags.check(AuxCarry));
    assert!(cpu.flags.check(Parity));
    assert!(!cpu.flags.check(Overflow));
    assert!(!cpu.flags.check(Sign));
}

#[test]
fn add_signed_overflow() {
    // MOV AL,0x7F; ADD AL,1 → 0x80, OF=1, SF=1, CF=0
    let mut cpu = setup(&[0xB0, 0x7F, 0x04, 0x01]);
    exec_n(&mut cpu, 2);
    assert_eq!(cpu.registers.read_reg8(0), 0x80);
    assert!(cpu.flags.check(Overflow));
    assert!(cpu.flags.check(Sign));
    assert!(!cpu.flags.check(Carry));
}

#[test]
fn add_then_sub_restores() {
    // MOV AL,0x5A; ADD AL,0x33; SUB AL,0x33
    let mut cpu = setup(&[0xB0, 0x5A, 0x04, 0x33, 0x2C, 0x33]);
    exec_n(&mut cpu, 3);
    assert_eq!(cpu.registers.read_reg8(0), 0x5A);
}

#[test]
fn sub_borrow_flags() {
    // MOV AL,0; SUB AL,1 → 0xFF, CF=1, SF=1
    let mut cpu = setup(&[0xB0, 0x00, 0x2C, 0x01]);
    exec_n(&mut cpu, 2);
    assert_eq!(cpu.registers.read_reg8(0), 0xFF);
    assert!(cpu.flags.check(Carry));
    assert!(cpu.flags.check(Sign));
    assert!(cpu.flags.check(AuxCarry));
}

#[test]
fn adc_uses_carry_in() {
    // STC; MOV AL,1; ADC AL,1 → 3
    let mut cpu = setup(&[0xF9, 0xB0, 0x01, 0x14, 0x01]);
    exec_n(&mut cpu, 3);
    assert_eq!(cpu.registers.read_reg8(0), 3);
    assert!(!cpu.flags.check(Carry));
}

#[test]
fn inc_preserves_carry() {
    // STC; MOV AX,0xFFFF; INC AX → 0, ZF=1, CF still 1
    let mut cpu = setup(&[0xF9, 0xB8, 0xFF, 0xFF, 0x40]);
    exec_n(&mut cpu, 3);
    assert_eq!(cpu.registers.read_reg16(EAX), 0);
    assert!(cpu.flags.check(Zero));
    assert!(cpu.flags.check(Carry));
    assert!(cpu.flags.check(AuxCarry));
}

#[test]
fn cmp_does_not_write() {
    // MOV AX,5; CMP AX,9: AX keeps 5, CF set
    let mut cpu = setup(&[0xB8, 0x05, 0x00, 0x3D, 0x09, 0x00]);
    exec_n(&mut cpu, 2);
    assert_eq!(cpu.registers.read_reg16(EAX), 5);
    assert!(cpu.flags.check(Carry));
}

#[test]
fn logic_clears_carry_overflow() {
    // STC; MOV AL,0xF0; AND AL,0x0F → 0, ZF=1, CF=0, OF=0
    let mut cpu = setup(&[0xF9, 0xB0, 0xF0, 0x24, 0x0F]);
    exec_n(&mut cpu, 3);
    assert_eq!(cpu.registers.read_reg8(0), 0);
    assert!(cpu.flags.check(Zero));
    assert!(!cpu.flags.check(Carry));
    assert!(!cpu.flags.check(Overflow));
}

#[test]
fn neg_sets_carry_for_nonzero() {
    // MOV AL,1; NEG AL (F6 D8)
    let mut cpu = setup(&[0xB0, 0x01, 0xF6, 0xD8]);
    exec_n(&mut cpu, 2);
    assert_eq!(cpu.registers.read_reg8(0), 0xFF);
    assert!(cpu.flags.check(Carry));
}

#[test]
fn mul_wide_result_sets_cf_of() {
    // MOV AX,0x100; MOV BX,0x100; MUL BX → DX:AX = 0x0001_0000
    let mut cpu = setup(&[0xB8, 0x00, 0x01, 0xBB, 0x00, 0x01, 0xF7, 0xE3]);
    exec_n(&mut cpu, 3);
    assert_eq!(cpu.registers.read_reg16(EAX), 0);
    assert_eq!(cpu.registers.read_reg16(EDX), 1);
    assert!(cpu.flags.check(Carry));
    assert!(cpu.flags.check(Overflow));
}

#[test]
fn mul_narrow_result_clears_cf_of() {
    // MOV AL,3; MOV BL,4; MUL BL → AX=12, high half zero
    let mut cpu = setup(&[0xB0, 0x03, 0xB3, 0x04, 0xF6, 0xE3]);
    exec_n(&mut cpu, 3);
    assert_eq!(cpu.registers.read_reg16(EAX), 12);
    assert!(!cpu.flags.check(Carry));
    assert!(!cpu.flags.check(Overflow));
}

#[test]
fn imul_sign_extension_rule() {
    // MOV AL,0xFF (-1); MOV BL,2; IMUL BL → AX=0xFFFE, high half is the
    // sign extension, so CF=OF=0.
    let mut cpu = setup(&[0xB0, 0xFF, 0xB3, 0x02, 0xF6, 0xEB]);
    exec_n(&mut cpu, 3);
    assert_eq!(cpu.registers.read_reg16(EAX), 0xFFFE);
    assert!(!cpu.flags.check(Carry));
    assert!(!cpu.flags.check(Overflow));
}

#[test]
fn div_word() {
    // DX:AX = 0x0001_0005, BX = 0x10 → quot 0x1000, rem 5
    let mut cpu = setup(&[0xF7, 0xF3]);
    cpu.registers.write_reg16(EAX, 0x0005);
    cpu.registers.write_reg16(EDX, 0x0001);
    cpu.registers.write_reg16(EBX, 0x0010);
    exec(&mut cpu);
    assert_eq!(cpu.registers.read_reg16(EAX), 0x1000);
    assert_eq!(cpu.registers.read_reg16(EDX), 0x0005);
}

#[test]
fn div_by_zero_faults() {
    // XOR BX,BX; DIV BX
    let mut cpu = setup(&[0x31, 0xDB, 0xF7, 0xF3]);
    exec(&mut cpu);
    assert_eq!(exec_err(&mut cpu), Exception::DivideError);
}

#[test]
fn idiv_truncates_toward_zero() {
    // AX = -7, BL = 2 → quot -3, rem -1
    let mut cpu = setup(&[0xF6, 0xFB]);
    cpu.registers.write_reg16(EAX, (-7i16) as u16);
    cpu.registers.write_reg8(3, 2); // BL
    exec(&mut cpu);
    assert_eq!(cpu.registers.read_reg8(0) as i8, -3);
    assert_eq!(cpu.registers.read_reg8(4) as i8, -1);
}

#[test]
fn aam_zero_faults() {
    let mut cpu = setup(&[0xD4, 0x00]);
    assert_eq!(exec_err(&mut cpu), Exception::DivideError);
}

#[test]
fn daa_adjusts_packed_bcd() {
    // MOV AL,0x15; ADD AL,0x27; DAA → 0x42
    let mut cpu = setup(&[0xB0, 0x15, 0x04, 0x27, 0x27]);
    exec_n(&mut cpu, 3);
    assert_eq!(cpu.registers.read_reg8(0), 0x42);
    assert!(!cpu.flags.check(Carry));
}

#[test]
fn cbw_cwd() {
    // MOV AL,0x80; CBW; CWD → AX=0xFF80, DX=0xFFFF
    let mut cpu = setup(&[0xB0, 0x80, 0x98, 0x99]);
    exec_n(&mut cpu, 3);
    assert_eq!(cpu.registers.read_reg16(EAX), 0xFF80);
    assert_eq!(cpu.registers.read_reg16(EDX), 0xFFFF);
}

#[test]
fn imul_three_operand() {
    // MOV BX,200; IMUL AX,BX,500 (69 C3 F4 01) → 100000 truncated: OF/CF set
    let mut cpu = setup(&[0xBB, 0xC8, 0x00, 0x69, 0xC3, 0xF4, 0x01]);
    exec_n(&mut cpu, 2);
    assert_eq!(cpu.registers.read_reg16(EAX), (100_000u32 & 0xFFFF) as u16);
    assert!(cpu.flags.check(Carry));
    assert!(cpu.flags.check(Overflow));
}

// ========================================================================
// SHIFTS & ROTATES
// ========================================================================

#[test]
fn shl_then_shr_masks_low_bits() {
    // MOV AX,0xABCD; MOV CL,4; SHL AX,CL; SHR AX,CL
    let mut cpu = setup(&[0xB8, 0xCD, 0xAB, 0xB1, 0x04, 0xD3, 0xE0, 0xD3, 0xE8]);
    exec_n(&mut cpu, 4);
    assert_eq!(cpu.registers.read_reg16(EAX), 0x0BCD);
}

#[test]
fn shl_carry_is_last_bit_out() {
    // MOV AL,0x80; SHL AL,1 (D0 E0) → 0, CF=1, OF = MSB^CF = 1
    let mut cpu = setup(&[0xB0, 0x80, 0xD0, 0xE0]);
    exec_n(&mut cpu, 2);
    assert_eq!(cpu.registers.read_reg8(0), 0);
    assert!(cpu.flags.check(Carry));
    assert!(cpu.flags.check(Overflow));
    assert!(cpu.flags.check(Zero));
}

#[test]
fn shift_count_zero_touches_nothing() {
    // STC; MOV AL,0xFF; SHL AL,0 (C0 E0 00): CF survives
    let mut cpu = setup(&[0xF9, 0xB0, 0xFF, 0xC0, 0xE0, 0x00]);
    exec_n(&mut cpu, 3);
    assert_eq!(cpu.registers.read_reg8(0), 0xFF);
    assert!(cpu.flags.check(Carry));
}

#[test]
fn shift_count_masked_to_5_bits() {
    // MOV AX,1; MOV CL,33; SHL AX,CL: count 33 & 0x1F = 1
    let mut cpu = setup(&[0xB8, 0x01, 0x00, 0xB1, 0x21, 0xD3, 0xE0]);
    exec_n(&mut cpu, 3);
    assert_eq!(cpu.registers.read_reg16(EAX), 2);
}

#[test]
fn rcl_rcr_round_trip() {
    // STC; MOV AX,0x8421; RCL AX,1; RCR AX,1: value and CF restored
    let mut cpu = setup(&[0xF9, 0xB8, 0x21, 0x84, 0xD1, 0xD0, 0xD1, 0xD8]);
    exec_n(&mut cpu, 4);
    assert_eq!(cpu.registers.read_reg16(EAX), 0x8421);
    assert!(cpu.flags.check(Carry));
}

#[test]
fn sar_keeps_sign() {
    // MOV AL,0xF0; SAR AL,1 (D0 F8) → 0xF8
    let mut cpu = setup(&[0xB0, 0xF0, 0xD0, 0xF8]);
    exec_n(&mut cpu, 2);
    assert_eq!(cpu.registers.read_reg8(0), 0xF8);
}

#[test]
fn shld_shifts_in_from_source() {
    // MOV AX,0x8000; MOV BX,0xC000; SHLD AX,BX,2 (0F A4 D8 02)
    let mut cpu = setup(&[0xB8, 0x00, 0x80, 0xBB, 0x00, 0xC0, 0x0F, 0xA4, 0xD8, 0x02]);
    exec_n(&mut cpu, 3);
    assert_eq!(cpu.registers.read_reg16(EAX), 0x0003);
    assert!(!cpu.flags.check(Carry)); // bit 14 of 0x8000 was the last out
}

#[test]
fn bt_and_btc() {
    // MOV AX,0b100; BT AX,2 (0F A3 with CX=2) → CF=1; BTC clears it.
    let mut cpu = setup(&[
        0xB8, 0x04, 0x00, // MOV AX,4
        0xB9, 0x02, 0x00, // MOV CX,2
        0x0F, 0xA3, 0xC8, // BT AX,CX
        0x0F, 0xBB, 0xC8, // BTC AX,CX
    ]);
    exec_n(&mut cpu, 3);
    assert!(cpu.flags.check(Carry));
    exec(&mut cpu);
    assert_eq!(cpu.registers.read_reg16(EAX), 0);
}

#[test]
fn bsf_finds_lowest_bit() {
    // MOV BX,0x0050; BSF AX,BX (0F BC C3)
    let mut cpu = setup(&[0xBB, 0x50, 0x00, 0x0F, 0xBC, 0xC3]);
    exec_n(&mut cpu, 2);
    assert_eq!(cpu.registers.read_reg16(EAX), 4);
    assert!(!cpu.flags.check(Zero));
}

// ========================================================================
// STACK
// ========================================================================

#[test]
fn push_pop_round_trip() {
    // MOV AX,0xBEEF; PUSH AX; POP BX
    let mut cpu = setup(&[0xB8, 0xEF, 0xBE, 0x50, 0x5B]);
    exec_n(&mut cpu, 3);
    assert_eq!(cpu.registers.read_reg16(EBX), 0xBEEF);
    assert_eq!(cpu.registers.read_reg16(ESP), 0xFFFE);
}

#[test]
fn push_sp_386_semantics() {
    // PUSH SP pushes the value before the decrement on 286+.
    let mut cpu = setup(&[0x54]);
    cpu.registers.write_reg16(ESP, 0x1000);
    exec(&mut cpu);
    assert_eq!(cpu.registers.read_reg16(ESP), 0x0FFE);
    assert_eq!(cpu.memory.read_phys16(0x0FFE), 0x1000);
}

#[test]
fn pusha_layout() {
    let mut cpu = setup(&[0x60]);
    for (reg, value) in (0..8u8).zip(1u16..=8) {
        cpu.registers.write_reg16(reg, value);
    }
    cpu.registers.write_reg16(ESP, 0x1000);
    exec(&mut cpu);
    assert_eq!(cpu.registers.read_reg16(ESP), 0x0FF0);
    // AX CX DX BX SP BP SI DI, pushed in that order.
    assert_eq!(cpu.memory.read_phys16(0x0FFE), 1);
    assert_eq!(cpu.memory.read_phys16(0x0FFC), 2);
    assert_eq!(cpu.memory.read_phys16(0x0FFA), 3);
    assert_eq!(cpu.memory.read_phys16(0x0FF8), 4);
    assert_eq!(cpu.memory.read_phys16(0x0FF6), 0x1000);
    assert_eq!(cpu.memory.read_phys16(0x0FF4), 6);
    assert_eq!(cpu.memory.read_phys16(0x0FF2), 7);
    assert_eq!(cpu.memory.read_phys16(0x0FF0), 8);
}

#[test]
fn popa_restores_all_but_sp() {
    let mut cpu = setup(&[0x60, 0x61]);
    for (reg, value) in (0..8u8).zip(0x11u16..) {
        cpu.registers.write_reg16(reg, value);
    }
    cpu.registers.write_reg16(ESP, 0x1000);
    exec(&mut cpu);
    for reg in 0..8u8 {
        cpu.registers.write_reg16(reg, 0);
    }
    cpu.registers.write_reg16(ESP, 0x0FF0);
    exec(&mut cpu);
    assert_eq!(cpu.registers.read_reg16(EAX), 0x11);
    assert_eq!(cpu.registers.read_reg16(EDI), 0x18);
    assert_eq!(cpu.registers.read_reg16(ESP), 0x1000);
}

#[test]
fn enter_leave_frame() {
    // ENTER 8,0; LEAVE
    let mut cpu = setup(&[0xC8, 0x08, 0x00, 0xC9]);
    cpu.registers.write_reg16(ESP, 0x1000);
    cpu.registers.write_reg16(EBP, 0x2222);
    exec(&mut cpu);
    assert_eq!(cpu.registers.read_reg16(EBP), 0x0FFE);
    assert_eq!(cpu.registers.read_reg16(ESP), 0x0FF6);
    exec(&mut cpu);
    assert_eq!(cpu.registers.read_reg16(EBP), 0x2222);
    assert_eq!(cpu.registers.read_reg16(ESP), 0x1000);
}

#[test]
fn pushf_popf_round_trip() {
    // STC; PUSHF; CLC; POPF: CF comes back
    let mut cpu = setup(&[0xF9, 0x9C, 0xF8, 0x9D]);
    exec_n(&mut cpu, 4);
    assert!(cpu.flags.check(Carry));
}

// ========================================================================
// CONTROL FLOW (REAL MODE)
// ========================================================================

#[test]
fn call_then_ret_restores() {
    // CALL +1 (E8 01 00); NOP; RET at 4
    let mut cpu = setup(&[0xE8, 0x01, 0x00, 0x90, 0xC3]);
    let sp = cpu.registers.read_reg16(ESP);
    exec(&mut cpu); // call → 4
    assert_eq!(cpu.registers.eip, 4);
    exec(&mut cpu); // ret → 3
    assert_eq!(cpu.registers.eip, 3);
    assert_eq!(cpu.registers.read_reg16(ESP), sp);
}

#[test]
fn far_call_and_retf_restore_cs() {
    // CALL 0100:0005: handler at linear 0x1005 does RETF.
    let mut cpu = setup(&[0x9A, 0x05, 0x00, 0x00, 0x01]);
    cpu.memory.write_phys8(0x1005, 0xCB);
    let sp = cpu.registers.read_reg16(ESP);
    exec(&mut cpu);
    assert_eq!(cpu.registers.seg(SegReg::CS).selector, 0x0100);
    assert_eq!(cpu.registers.eip, 5);
    exec(&mut cpu);
    assert_eq!(cpu.registers.seg(SegReg::CS).selector, 0);
    assert_eq!(cpu.registers.eip, 5);
    assert_eq!(cpu.registers.read_reg16(ESP), sp);
}

#[test]
fn jcc_taken_and_not_taken() {
    // XOR AX,AX (ZF=1); JZ +2; MOV AL,1 (skipped); MOV BL,2
    let mut cpu = setup(&[0x31, 0xC0, 0x74, 0x02, 0xB0, 0x01, 0xB3, 0x02]);
    exec_n(&mut cpu, 3);
    assert_eq!(cpu.registers.read_reg8(0), 0);
    assert_eq!(cpu.registers.read_reg8(3), 2);
}

#[test]
fn loop_decrements_cx() {
    // MOV CX,3; label: LOOP label
    let mut cpu = setup(&[0xB9, 0x03, 0x00, 0xE2, 0xFE]);
    exec(&mut cpu);
    exec_n(&mut cpu, 3);
    assert_eq!(cpu.registers.read_reg16(ECX), 0);
    assert_eq!(cpu.registers.eip, 5);
}

#[test]
fn jcxz_when_zero() {
    // XOR CX,CX; JCXZ +2; INT3; INT3; target NOP
    let mut cpu = setup(&[0x31, 0xC9, 0xE3, 0x02, 0xCC, 0xCC, 0x90]);
    exec_n(&mut cpu, 2);
    assert_eq!(cpu.registers.eip, 6);
}

#[test]
fn int_pushes_frame_and_clears_if_tf() {
    // IVT vector 0x21 → F000:1234, execute INT 21h.
    let mut cpu = setup(&[0xCD, 0x21]);
    cpu.memory.write_phys16(0x21 * 4, 0x1234);
    cpu.memory.write_phys16(0x21 * 4 + 2, 0xF000);
    let flags_before = cpu.flags.eflags() as u16;
    exec(&mut cpu);

    assert_eq!(cpu.registers.seg(SegReg::CS).selector, 0xF000);
    assert_eq!(cpu.registers.eip, 0x1234);
    assert!(!cpu.flags.check(Interrupt));
    assert!(!cpu.flags.check(Trap));

    let sp = cpu.registers.read_reg16(ESP) as u32;
    assert_eq!(cpu.memory.read_phys16(sp), 2); // return IP
    assert_eq!(cpu.memory.read_phys16(sp + 2), 0); // return CS
    assert_eq!(cpu.memory.read_phys16(sp + 4), flags_before);
}

#[test]
fn iret_reproduces_pre_int_state() {
    // INT 0x21 to a handler that immediately IRETs.
    let mut cpu = setup(&[0xCD, 0x21, 0x90]);
    cpu.memory.write_phys16(0x21 * 4, 0x0100);
    cpu.memory.write_phys16(0x21 * 4 + 2, 0x0000);
    cpu.memory.write_phys8(0x100, 0xCF); // IRET
    let flags_before = cpu.flags.eflags();
    let sp_before = cpu.registers.read_reg16(ESP);

    exec_n(&mut cpu, 2);
    assert_eq!(cpu.registers.seg(SegReg::CS).selector, 0);
    assert_eq!(cpu.registers.eip, 2);
    assert_eq!(cpu.flags.eflags(), flags_before);
    assert_eq!(cpu.registers.read_reg16(ESP), sp_before);
}

#[test]
fn into_only_on_overflow() {
    let mut cpu = setup(&[0xCE, 0xCE]);
    cpu.memory.write_phys16(4 * 4, 0x0200);
    cpu.memory.write_phys16(4 * 4 + 2, 0x0000);
    exec(&mut cpu);
    assert_eq!(cpu.registers.eip, 1); // OF clear: fell through
    cpu.flags.set(Overflow);
    exec(&mut cpu);
    assert_eq!(cpu.registers.eip, 0x200);
}

#[test]
fn bound_in_and_out_of_range() {
    // Bounds block at 0x200: [10, 20]
    let mut cpu = setup(&[0x62, 0x06, 0x00, 0x02, 0x62, 0x06, 0x00, 0x02]);
    cpu.memory.write_phys16(0x200, 10);
    cpu.memory.write_phys16(0x202, 20);
    cpu.registers.write_reg16(EAX, 15);
    exec(&mut cpu);
    cpu.registers.write_reg16(EAX, 21);
    assert_eq!(exec_err(&mut cpu), Exception::BoundRange);
}

#[test]
fn invalid_opcode_raises_ud() {
    let mut cpu = setup(&[0xF1]);
    assert_eq!(exec_err(&mut cpu), Exception::InvalidOpcode);
}

#[test]
fn mov_cs_raises_ud() {
    // MOV CS,AX (8E C8) is not a thing on 286+.
    let mut cpu = setup(&[0x8E, 0xC8]);
    assert_eq!(exec_err(&mut cpu), Exception::InvalidOpcode);
}

// ========================================================================
// STRING OPS
// ========================================================================

#[test]
fn rep_movsb_copies() {
    // Source at 0x100, dest at 0x200, CX=4
    let mut cpu = setup(&[0xF3, 0xA4]);
    cpu.memory.copy_data(0x100, b"abcd");
    cpu.registers.write_reg16(ESI, 0x100);
    cpu.registers.write_reg16(EDI, 0x200);
    cpu.registers.write_reg16(ECX, 4);
    exec(&mut cpu);
    assert_eq!(cpu.memory.read_phys8(0x200), b'a');
    assert_eq!(cpu.memory.read_phys8(0x203), b'd');
    assert_eq!(cpu.registers.read_reg16(ECX), 0);
    assert_eq!(cpu.registers.read_reg16(ESI), 0x104);
}

#[test]
fn rep_stosw_fills() {
    let mut cpu = setup(&[0xF3, 0xAB]);
    cpu.registers.write_reg16(EAX, 0x5A5A);
    cpu.registers.write_reg16(EDI, 0x300);
    cpu.registers.write_reg16(ECX, 3);
    exec(&mut cpu);
    assert_eq!(cpu.memory.read_phys16(0x300), 0x5A5A);
    assert_eq!(cpu.memory.read_phys16(0x304), 0x5A5A);
    assert_eq!(cpu.registers.read_reg16(EDI), 0x306);
}

#[test]
fn repne_scasb_finds_byte() {
    let mut cpu = setup(&[0xF2, 0xAE]);
    cpu.memory.copy_data(0x400, b"xxxz");
    cpu.registers.write_reg8(0, b'z');
    cpu.registers.write_reg16(EDI, 0x400);
    cpu.registers.write_reg16(ECX, 10);
    exec(&mut cpu);
    assert!(cpu.flags.check(Zero));
    assert_eq!(cpu.registers.read_reg16(EDI), 0x404);
    assert_eq!(cpu.registers.read_reg16(ECX), 6);
}

#[test]
fn std_reverses_direction() {
    // STD; MOVSB moves SI/DI down
    let mut cpu = setup(&[0xFD, 0xA4]);
    cpu.memory.write_phys8(0x100, 0x42);
    cpu.registers.write_reg16(ESI, 0x100);
    cpu.registers.write_reg16(EDI, 0x200);
    exec_n(&mut cpu, 2);
    assert_eq!(cpu.memory.read_phys8(0x200), 0x42);
    assert_eq!(cpu.registers.read_reg16(ESI), 0x0FF);
    assert_eq!(cpu.registers.read_reg16(EDI), 0x1FF);
}

#[test]
fn segment_override_on_lods() {
    // ES:LODSB (26 AC) reads through ES instead of DS.
    let mut cpu = setup(&[0x26, 0xAC]);
    cpu.load_real_mode_segment(SegReg::ES, 0x0050);
    cpu.memory.write_phys8(0x0500 + 0x10, 0x7E);
    cpu.registers.write_reg16(ESI, 0x10);
    exec(&mut cpu);
    assert_eq!(cpu.registers.read_reg8(0), 0x7E);
}

// ========================================================================
// PROTECTED MODE
// ========================================================================

// Flat 4 GiB ring-0 segments.
const GDT_CODE32: u64 = 0x00CF_9A00_0000_FFFF;
const GDT_DATA32: u64 = 0x00CF_9200_0000_FFFF;

fn write_gdt_entry(cpu: &mut Cpu, base: u32, index: u32, raw: u64) {
    for (i, byte) in raw.to_le_bytes().iter().enumerate() {
        cpu.memory.write_phys8(base + index * 8 + i as u32, *byte);
    }
}

/// LGDT, set CR0.PE, far-jump into a 32-bit code
/// segment, load SS, and run a 32-bit instruction.
#[test]
fn enter_protected_mode() {
    let mut cpu = setup(&[
        0x0F, 0x01, 0x16, 0x00, 0x06, // lgdt [0x0600]
        0x0F, 0x20, 0xC0, // mov eax,cr0
        0x66, 0x83, 0xC8, 0x01, // or eax,1
        0x0F, 0x22, 0xC0, // mov cr0,eax
        0xEA, 0x14, 0x00, 0x08, 0x00, // jmp 0008:0014
        // 32-bit code from here (offset 0x14)
        0x66, 0xB8, 0x10, 0x00, // mov ax,0x10
        0x8E, 0xD0, // mov ss,ax
        0xB8, 0x78, 0x56, 0x34, 0x12, // mov eax,0x12345678
    ]);
    write_gdt_entry(&mut cpu, 0x500, 1, GDT_CODE32);
    write_gdt_entry(&mut cpu, 0x500, 2, GDT_DATA32);
    cpu.memory.write_phys16(0x600, 0x17); // GDT limit
    cpu.memory.write_phys32(0x602, 0x500); // GDT base

    exec_n(&mut cpu, 5);
    assert!(cpu.protected_mode());
    assert_eq!(cpu.cpl, 0);
    assert_eq!(cpu.registers.seg(SegReg::CS).selector, 0x08);
    assert!(cpu.registers.seg(SegReg::CS).cache.default_32);

    exec_n(&mut cpu, 2);
    assert!(cpu.registers.seg(SegReg::SS).cache.writable());
    assert_eq!(cpu.registers.seg(SegReg::SS).cache.limit, 0xFFFF_FFFF);

    cpu.registers.write_reg32(ESP, 0x8000);
    exec(&mut cpu);
    assert_eq!(cpu.registers.read_reg32(EAX), 0x1234_5678);
}

/// Minimal protected-mode machine with flat ring-0 segments, built by
/// poking registers directly; the code bytes land at linear `0`.
fn setup_protected(code: &[u8]) -> Cpu {
    let mut cpu = setup(&[]);
    write_gdt_entry(&mut cpu, 0x500, 1, GDT_CODE32);
    write_gdt_entry(&mut cpu, 0x500, 2, GDT_DATA32);
    cpu.registers.gdtr.base = 0x500;
    cpu.registers.gdtr.limit = 0x17;
    cpu.registers.cr0 |= CR0_PE;
    cpu.write_segment_register(SegReg::SS, 0x10).unwrap();
    cpu.write_segment_register(SegReg::DS, 0x10).unwrap();
    let code_desc = match crate::vm::descriptor::Descriptor::parse(GDT_CODE32) {
        crate::vm::descriptor::Descriptor::Code(seg) => seg,
        _ => unreachable!(),
    };
    cpu.set_cs(0x08, code_desc, 0);
    cpu.registers.eip = 0;
    cpu.registers.write_reg32(ESP, 0x8000);
    cpu.memory.copy_data(0, code);
    cpu
}

#[test]
fn null_selector_access_faults() {
    // MOV DS,AX with AX=0 loads a null cache; the next DS read faults.
    let mut cpu = setup_protected(&[
        0x31, 0xC0, // xor eax,eax
        0x8E, 0xD8, // mov ds,ax
        0x8B, 0x05, 0x00, 0x02, 0x00, 0x00, // mov eax,[0x200]
    ]);
    exec_n(&mut cpu, 2);
    assert_eq!(exec_err(&mut cpu), Exception::GeneralProtection(0));
}

#[test]
fn selector_beyond_gdt_limit_faults() {
    // MOV DS,0x28: index 5 is past a 3-entry table.
    let mut cpu = setup_protected(&[
        0x66, 0xB8, 0x28, 0x00, // mov ax,0x28
        0x8E, 0xD8, // mov ds,ax
    ]);
    exec(&mut cpu);
    assert_eq!(exec_err(&mut cpu), Exception::GeneralProtection(0x28));
}

#[test]
fn ss_null_load_faults() {
    let mut cpu = setup_protected(&[
        0x66, 0x31, 0xC0, // xor ax,ax
        0x8E, 0xD0, // mov ss,ax
    ]);
    exec(&mut cpu);
    assert_eq!(exec_err(&mut cpu), Exception::GeneralProtection(0));
}

#[test]
fn segment_limit_check() {
    // Data segment with a 0xFFF limit at selector 0x18; access beyond it.
    let mut cpu = setup_protected(&[
        0x66, 0xB8, 0x18, 0x00, // mov ax,0x18
        0x8E, 0xC0, // mov es,ax
        0x26, 0x8B, 0x05, 0x00, 0x20, 0x00, 0x00, // mov eax,es:[0x2000]
    ]);
    // base 0, limit 0xFFF, byte granular, writable data
    write_gdt_entry(&mut cpu, 0x500, 3, 0x0040_9200_0000_0FFF);
    cpu.registers.gdtr.limit = 0x1F;
    exec_n(&mut cpu, 2);
    assert_eq!(exec_err(&mut cpu), Exception::GeneralProtection(0));
}

#[test]
fn protected_int_through_gate() {
    // IDT entry 0x40: 32-bit interrupt gate to 0x08:0x800. The handler
    // IRETs back; IF must drop across delivery and return.
    let mut cpu = setup_protected(&[0xCD, 0x40, 0x90]);
    let idt_base = 0x700u32;
    // gate: offset 0x800, selector 0x08, type 0xE (32-bit interrupt gate)
    let gate: u64 = 0x0000_8E00_0008_0800;
    for (i, byte) in gate.to_le_bytes().iter().enumerate() {
        cpu.memory.write_phys8(idt_base + 0x40 * 8 + i as u32, *byte);
    }
    cpu.registers.idtr.base = idt_base;
    cpu.registers.idtr.limit = 0xFFF;
    cpu.memory.write_phys8(0x800, 0xCF); // IRET

    let sp_before = cpu.registers.read_reg32(ESP);
    exec(&mut cpu);
    assert_eq!(cpu.registers.eip, 0x800);
    assert!(!cpu.flags.check(Interrupt));

    exec(&mut cpu);
    assert_eq!(cpu.registers.eip, 2);
    assert!(cpu.flags.check(Interrupt));
    assert_eq!(cpu.registers.read_reg32(ESP), sp_before);
}

#[test]
fn lar_lsl_report_descriptor() {
    let mut cpu = setup_protected(&[
        0x66, 0xB8, 0x08, 0x00, // mov ax,0x08
        0x0F, 0x02, 0xC8, // lar cx,ax
        0x0F, 0x03, 0xD8, // lsl bx,ax
    ]);
    exec_n(&mut cpu, 2);
    assert!(cpu.flags.check(Zero));
    assert_eq!(cpu.registers.read_reg16(ECX) & 0xFF00, 0x9A00);
    exec(&mut cpu);
    assert!(cpu.flags.check(Zero));
    assert_eq!(cpu.registers.read_reg32(EBX), 0xFFFF_FFFF);
}

/// Privilege escalation through a call gate pushes exactly (old SS,
/// old ESP, old CS, old EIP) on the TSS-supplied inner stack: no flags.
/// The matching far RET drops back to ring 3 and zeroes stale segments.
#[test]
fn call_gate_escalation_and_return() {
    let mut cpu = setup_protected(&[]);
    // Ring-3 flat code/data, an available 32-bit TSS and a DPL-3 call
    // gate into the ring-0 code segment at offset 0x900.
    write_gdt_entry(&mut cpu, 0x500, 3, 0x00CF_FA00_0000_FFFF);
    write_gdt_entry(&mut cpu, 0x500, 4, 0x00CF_F200_0000_FFFF);
    write_gdt_entry(&mut cpu, 0x500, 5, 0x0000_8900_4000_0067);
    write_gdt_entry(&mut cpu, 0x500, 6, 0x0000_EC00_0008_0900);
    cpu.registers.gdtr.limit = 0x37;

    // TSS at 0x4000: ring-0 stack is 0010:00007000.
    cpu.memory.write_phys32(0x4004, 0x7000);
    cpu.memory.write_phys32(0x4008, 0x0010);
    cpu.registers.tr.selector = 0x28;
    cpu.registers.tr.base = 0x4000;
    cpu.registers.tr.limit = 0x67;
    cpu.registers.tr.size32 = true;

    // Drop to ring 3.
    let user_code = match crate::vm::descriptor::Descriptor::parse(0x00CF_FA00_0000_FFFF) {
        crate::vm::descriptor::Descriptor::Code(seg) => seg,
        _ => unreachable!(),
    };
    cpu.set_cs(0x1B, user_code, 3);
    cpu.write_segment_register(SegReg::SS, 0x23).unwrap();
    cpu.registers.write_reg32(ESP, 0x6000);
    cpu.registers.eip = 0x100;

    // call far 0033:00000000 (the gate supplies the real entry point)
    cpu.memory
        .copy_data(0x100, &[0x9A, 0x00, 0x00, 0x00, 0x00, 0x33, 0x00]);
    cpu.memory.write_phys8(0x900, 0xCB); // retf

    exec(&mut cpu);
    assert_eq!(cpu.cpl, 0);
    assert_eq!(cpu.registers.seg(SegReg::CS).selector, 0x08);
    assert_eq!(cpu.registers.eip, 0x900);
    assert_eq!(cpu.registers.seg(SegReg::SS).selector, 0x10);
    assert_eq!(cpu.registers.read_reg32(ESP), 0x6FF0);
    assert_eq!(cpu.memory.read_phys32(0x6FFC), 0x23); // old SS
    assert_eq!(cpu.memory.read_phys32(0x6FF8), 0x6000); // old ESP
    assert_eq!(cpu.memory.read_phys32(0x6FF4), 0x1B); // old CS
    assert_eq!(cpu.memory.read_phys32(0x6FF0), 0x107); // old EIP

    exec(&mut cpu);
    assert_eq!(cpu.cpl, 3);
    assert_eq!(cpu.registers.seg(SegReg::CS).selector, 0x1B);
    assert_eq!(cpu.registers.eip, 0x107);
    assert_eq!(cpu.registers.seg(SegReg::SS).selector, 0x23);
    assert_eq!(cpu.registers.read_reg32(ESP), 0x6000);
    // DS held a ring-0 descriptor; the outward return nulls it.
    assert_eq!(cpu.registers.seg(SegReg::DS).selector, 0);
}

// ========================================================================
// PAGING
// ========================================================================

const PAGE_P: u32 = 1;
const PAGE_RW: u32 = 2;
const PAGE_US: u32 = 4;

/// Identity-map the first 4 MiB and map linear 0x0040_0000 to physical
/// 0x0010_0000; page directory at 0x1000, tables at 0x2000/0x3000.
fn setup_paged() -> Cpu {
    let mut cpu = setup_protected(&[]);
    cpu.memory.write_phys32(0x1000, 0x2000 | PAGE_P | PAGE_RW | PAGE_US);
    cpu.memory.write_phys32(0x1004, 0x3000 | PAGE_P | PAGE_RW | PAGE_US);
    for page in 0..1024u32 {
        cpu.memory
            .write_phys32(0x2000 + page * 4, (page << 12) | PAGE_P | PAGE_RW | PAGE_US);
    }
    cpu.memory
        .write_phys32(0x3000, 0x0010_0000 | PAGE_P | PAGE_RW | PAGE_US);
    cpu.registers.cr3 = 0x1000;
    cpu.registers.cr0 |= CR0_PG;
    cpu
}

#[test]
fn paged_read_remaps() {
    let mut cpu = setup_paged();
    cpu.memory.write_phys32(0x0010_0000, 0xCAFE_F00D);
    // mov eax,[0x00400000]
    cpu.memory
        .copy_data(0, &[0x8B, 0x05, 0x00, 0x00, 0x40, 0x00]);
    exec(&mut cpu);
    assert_eq!(cpu.registers.read_reg32(EAX), 0xCAFE_F00D);
}

#[test]
fn non_present_pte_raises_pf() {
    let mut cpu = setup_paged();
    cpu.memory
        .copy_data(0, &[0x8B, 0x05, 0x00, 0x00, 0x40, 0x00]);
    // Clear the Present bit of the PTE backing 0x00400000.
    cpu.memory.write_phys32(0x3000, 0x0010_0000 | PAGE_RW | PAGE_US);
    let exc = exec_err(&mut cpu);
    assert_eq!(
        exc,
        Exception::PageFault {
            code: 0,
            address: 0x0040_0000
        }
    );
}

#[test]
fn straddling_read_reports_second_page() {
    let mut cpu = setup_paged();
    // 4-byte read at 0x00400FFD; the next page (PTE 1 of table 0x3000)
    // is not present.
    cpu.memory
        .copy_data(0, &[0x8B, 0x05, 0xFD, 0x0F, 0x40, 0x00]);
    let exc = exec_err(&mut cpu);
    assert_eq!(
        exc,
        Exception::PageFault {
            code: 0,
            address: 0x0040_1000
        }
    );
}

#[test]
fn accessed_and_dirty_bits() {
    let mut cpu = setup_paged();
    // mov [0x00400000],eax
    cpu.memory
        .copy_data(0, &[0x89, 0x05, 0x00, 0x00, 0x40, 0x00]);
    cpu.registers.write_reg32(EAX, 0x1111_2222);
    exec(&mut cpu);
    assert_eq!(cpu.memory.read_phys32(0x0010_0000), 0x1111_2222);
    let pde = cpu.memory.read_phys32(0x1004);
    let pte = cpu.memory.read_phys32(0x3000);
    assert_ne!(pde & 0x20, 0, "PDE accessed");
    assert_ne!(pte & 0x20, 0, "PTE accessed");
    assert_ne!(pte & 0x40, 0, "PTE dirty");
    // The read-only path must not set Dirty.
    let pte_before = cpu.memory.read_phys32(0x2000);
    assert_eq!(pte_before & 0x40, 0);
}

#[test]
fn write_protect_honors_wp() {
    let mut cpu = setup_paged();
    // Make the mapping read-only, then write with CR0.WP set.
    cpu.memory.write_phys32(0x3000, 0x0010_0000 | PAGE_P | PAGE_US);
    cpu.registers.cr0 |= crate::vm::registers::CR0_WP;
    cpu.memory
        .copy_data(0, &[0x89, 0x05, 0x00, 0x00, 0x40, 0x00]);
    let exc = exec_err(&mut cpu);
    assert_eq!(
        exc,
        Exception::PageFault {
            code: 3, // present + write
            address: 0x0040_0000
        }
    );
}

// ========================================================================
// MAIN LOOP
// ========================================================================

#[test]
fn hlt_wakes_on_irq() {
    // STI; HLT: the PIC then vectors IRQ0 to a handler that CLIs and
    // HLTs, which shuts the machine down.
    let mut cpu = setup(&[0xFB, 0xF4]);
    cpu.memory.write_phys16(8 * 4, 0x0100);
    cpu.memory.write_phys16(8 * 4 + 2, 0x0000);
    cpu.memory.copy_data(0x100, &[0xFA, 0xF4]); // CLI; HLT
    cpu.pic.set_imr(0x00);
    cpu.pic.raise_irq(0);
    cpu.run();
    assert_eq!(cpu.state, CpuState::Dead);
    assert_eq!(cpu.registers.eip, 0x102);
}

#[test]
fn trap_flag_single_steps() {
    // #DB after the first instruction; the handler halts the machine.
    let mut cpu = setup(&[0x90, 0x90]);
    cpu.memory.write_phys16(1 * 4, 0x0100);
    cpu.memory.write_phys16(1 * 4 + 2, 0x0000);
    cpu.memory.copy_data(0x100, &[0xFA, 0xF4]); // CLI; HLT
    cpu.flags.set(Trap);
    cpu.run();
    assert_eq!(cpu.state, CpuState::Dead);
    // The pushed return IP points past the first NOP only.
    let sp = cpu.registers.read_reg16(ESP) as u32;
    assert_eq!(cpu.memory.read_phys16(sp), 1);
}

#[test]
fn sti_shadow_delays_irq() {
    // CLI; STI; HLT: the IRQ pending during STI must not preempt the
    // instruction in the shadow; it is taken at the HLT.
    let mut cpu = setup(&[0xFA, 0xFB, 0xF4]);
    cpu.memory.write_phys16(8 * 4, 0x0100);
    cpu.memory.write_phys16(8 * 4 + 2, 0x0000);
    cpu.memory.copy_data(0x100, &[0xFA, 0xF4]);
    cpu.pic.set_imr(0x00);
    cpu.pic.raise_irq(0);
    cpu.run();
    assert_eq!(cpu.state, CpuState::Dead);
    // Return address on the handler stack is 3 (after HLT), not 2.
    let sp = cpu.registers.read_reg16(ESP) as u32;
    assert_eq!(cpu.memory.read_phys16(sp), 3);
}

#[test]
fn a20_gate_via_port_92() {
    // OUT 0x92,AL toggles the A20 mask from guest code.
    let mut cpu = setup(&[0xB0, 0x00, 0xE6, 0x92, 0xB0, 0x02, 0xE6, 0x92]);
    exec_n(&mut cpu, 2);
    assert!(!cpu.memory.a20_enabled());
    exec_n(&mut cpu, 2);
    assert!(cpu.memory.a20_enabled());
}

#[test]
fn cycle_limit_stops_run() {
    let mut cpu = setup(&[0xEB, 0xFE]); // JMP $
    cpu.cycle_limit = Some(10);
    cpu.run();
    assert_eq!(cpu.cycle, 10);
}
