use super::*;
use crate::constants::FILLER_INSTRUCTION;
use crate::instructions::*;
use byteorder::ByteOrder;
use util::Endian;

fn machine_with_code(words: &[u32]) -> Machine {
    let mut mem = Memory::new(0x1000);
    mem.map_range(0, 0x800, ACCESS_READ | ACCESS_EXEC);
    mem.map_range(0x800, 0x1000, ACCESS_READ | ACCESS_WRITE);
    let mut bytes = vec![0u8; words.len() * 4];
    for (i, &w) in words.iter().enumerate() {
        Endian::write_u32(&mut bytes[i * 4..i * 4 + 4], w);
    }
    mem.load(0, &bytes);
    Machine::new(mem)
}

fn jump_rr(opj: u32, rd: u32, rs: u32, ot: u32, offset: i8) -> u32 {
    let mut t = Template::new();
    t.set_il(1);
    t.set_mode(6);
    t.set_op1(opj);
    t.set_rd(rd);
    t.set_rs(rs);
    t.set_ot(ot);
    t.write_bytes(0, 1, offset as u8 as u64);
    t.w[0]
}

fn move_imm(rd: u32, ot: u32, imm: i8) -> u32 {
    let mut t = Template::new();
    t.set_il(1);
    t.set_mode(4);
    t.set_op1(II_MOVE);
    t.set_rd(rd);
    t.set_ot(ot);
    t.write_bytes(0, 1, imm as u8 as u64);
    t.w[0]
}

fn alu_rrr(op: u32, rd: u32, rs: u32, rt: u32, ot: u32) -> u32 {
    let mut t = Template::new();
    t.set_il(1);
    t.set_mode(0);
    t.set_op1(op);
    t.set_rd(rd);
    t.set_rs(rs);
    t.set_rt(rt);
    t.set_ot(ot);
    t.w[0]
}

fn ret() -> u32 {
    let mut t = Template::new();
    t.set_il(1);
    t.set_mode(6);
    t.set_op1(OPJ_RETURN);
    t.w[0]
}

#[test]
fn conditional_branch_taken() {
    // sub_jump_neg with a = 2, b = 5: result negative, branch taken
    let code = jump_rr(OPJ_SUB_JNEG, 1, 2, 2, 3);
    let mut m = machine_with_code(&[code, 0, 0, 0, 0]);
    m.registers[1] = 2;
    m.registers[2] = 5;
    m.step().unwrap();
    assert_eq!(m.ip, 4 + 3 * 4);
    assert_ne!(m.return_type & RT_TAKEN, 0);
    assert_eq!(m.registers[1], 0xFFFF_FFFD); // 2 - 5 as int32
}

#[test]
fn conditional_branch_not_taken_and_inverted() {
    let code = jump_rr(OPJ_SUB_JNEG, 1, 2, 2, 3);
    let mut m = machine_with_code(&[code, 0, 0, 0, 0]);
    m.registers[1] = 9;
    m.registers[2] = 5;
    m.step().unwrap();
    assert_eq!(m.ip, 4);
    assert_ne!(m.return_type & RT_NOT_TAKEN, 0);

    // odd operation code inverts the condition
    let code = jump_rr(OPJ_SUB_JNEG | 1, 1, 2, 2, 3);
    let mut m = machine_with_code(&[code, 0, 0, 0, 0]);
    m.registers[1] = 9;
    m.registers[2] = 5;
    m.step().unwrap();
    assert_eq!(m.ip, 16);
}

#[test]
fn integer_compare_is_size_masked() {
    // int8 compare: 0x180 and 0x80 are equal in 8 bits
    let code = jump_rr(OPJ_CMP_JEQ, 1, 2, 0, 1);
    let mut m = machine_with_code(&[code, 0, 0]);
    m.registers[1] = 0x180;
    m.registers[2] = 0x80;
    m.step().unwrap();
    assert_ne!(m.return_type & RT_TAKEN, 0);
}

#[test]
fn float_compare_never_takes_ordered_branch_on_nan() {
    // compare_jump_equal on doubles where one operand is nan: not taken
    let code = jump_rr(OPJ_CMP_JEQ, 1, 2, 6, 2);
    let mut m = machine_with_code(&[code, 0, 0, 0]);
    m.registers[1] = f64::NAN.to_bits();
    m.registers[2] = 1.0f64.to_bits();
    m.step().unwrap();
    assert_eq!(m.ip, 4);

    // the inverted variant (not equal) does branch on nan
    let code = jump_rr(OPJ_CMP_JEQ | 1, 1, 2, 6, 2);
    let mut m = machine_with_code(&[code, 0, 0, 0]);
    m.registers[1] = f64::NAN.to_bits();
    m.registers[2] = 1.0f64.to_bits();
    m.step().unwrap();
    assert_eq!(m.ip, 12);
}

#[test]
fn test_bit_and_mask_jumps() {
    let code = jump_rr(OPJ_TEST_BIT_JTRUE, 1, 2, 2, 1);
    let mut m = machine_with_code(&[code, 0, 0]);
    m.registers[1] = 0b100;
    m.registers[2] = 2;
    m.step().unwrap();
    assert_ne!(m.return_type & RT_TAKEN, 0);

    let code = jump_rr(OPJ_TEST_BITS_AND_JTRUE, 1, 2, 2, 1);
    let mut m = machine_with_code(&[code, 0, 0]);
    m.registers[1] = 0b1110;
    m.registers[2] = 0b0110;
    m.step().unwrap();
    assert_ne!(m.return_type & RT_TAKEN, 0);
}

#[test]
fn increment_compare_loop() {
    // r1 = 0; loop: r1 += 1 while r1 < 3 (backward branch of -1 words)
    let code = jump_rr(OPJ_INC_CMP_JBELOW, 1, 2, 3, -1);
    let mut m = machine_with_code(&[code, ret()]);
    m.registers[1] = 0;
    m.registers[2] = 3;
    let mut steps = 0;
    while m.ip == 0 && steps < 10 {
        m.step().unwrap();
        steps += 1;
    }
    // taken at 0, 1 and 2; the final increment leaves 4 and falls through
    assert_eq!(m.registers[1], 4);
    assert_eq!(steps, 4);
    assert_eq!(m.ip, 4);
}

#[test]
fn call_and_return() {
    // 0: call +2 (to word 3)   (D format, offset counts from next word)
    // 1: return                (ends the program)
    // 2: unreachable trap
    // 3: move r3 = 7; return
    let mut call = Template::new();
    call.set_il(1);
    call.set_mode(7);
    call.set_op1d(1);
    call.set_im2d(2);
    let code = [
        call.w[0],
        ret(),
        FILLER_INSTRUCTION,
        move_imm(3, 3, 7),
        ret(),
    ];
    let mut m = machine_with_code(&code);
    let r = m.run(100).unwrap();
    assert_eq!(r, StepResult::Finished);
    assert_eq!(m.registers[3], 7);
    assert_eq!(m.call_depth_max, 1);
}

#[test]
fn filler_word_traps() {
    let mut m = machine_with_code(&[FILLER_INSTRUCTION]);
    assert_eq!(m.step(), Err(Interrupt::Trap(0xFFFF)));
}

#[test]
fn small_program_executes() {
    let code = [
        move_imm(1, 2, 42),
        move_imm(2, 2, 64),
        alu_rrr(II_ADD, 3, 1, 2, 2),
        ret(),
    ];
    let mut m = machine_with_code(&code);
    let r = m.run(100).unwrap();
    assert_eq!(r, StepResult::Finished);
    assert_eq!(m.registers[3], 106);
}
