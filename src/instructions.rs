//! The instruction list: one record per instruction, carrying the encoding
//! constraints the assembler's fitter and the disassembler need.
//!
//! Multiformat instructions (category 3) may be encoded in any catalog
//! format whose index bit is set in `format`; single format instructions
//! (category 1) name one catalog entry by its `format2` value; jump
//! instructions (category 4) choose from the jump formats. Jump operation
//! codes use the low six bits of the first word's OP1 field; an odd
//! operation code inverts the branch condition.

/// Flag bit distinguishing jump-family instruction ids.
pub const II_JUMP_INSTR: u32 = 0x1000;

// multiformat operations. The id doubles as the OP1 field value.
pub const II_NOP: u32 = 0;
pub const II_MOVE: u32 = 1;
pub const II_STORE: u32 = 2;
pub const II_ADD: u32 = 4;
pub const II_SUB: u32 = 5;
pub const II_SUB_REV: u32 = 6;
pub const II_MUL: u32 = 7;
pub const II_MUL_HI: u32 = 8;
pub const II_MUL_HI_U: u32 = 9;
pub const II_DIV: u32 = 10;
pub const II_DIV_U: u32 = 11;
pub const II_DIV_REV: u32 = 12;
pub const II_DIV_REV_U: u32 = 13;
pub const II_REM: u32 = 14;
pub const II_REM_U: u32 = 15;
pub const II_MIN: u32 = 16;
pub const II_MIN_U: u32 = 17;
pub const II_MAX: u32 = 18;
pub const II_MAX_U: u32 = 19;
pub const II_AND: u32 = 20;
pub const II_OR: u32 = 21;
pub const II_XOR: u32 = 22;
pub const II_SHIFT_LEFT: u32 = 24;
pub const II_SHIFT_RIGHT_S: u32 = 26;
pub const II_SHIFT_RIGHT_U: u32 = 27;
pub const II_COMPARE: u32 = 32;
pub const II_MUL_ADD: u32 = 34;
pub const II_MUL_ADD2: u32 = 35;
pub const II_ADD_ADD: u32 = 36;
pub const II_ADDRESS: u32 = 37;
pub const II_TEST_BIT: u32 = 38;
pub const II_TEST_BITS_AND: u32 = 39;
pub const II_TEST_BITS_OR: u32 = 40;

// pseudo-instructions that never reach the emitter as code
pub const II_ALIGN: u32 = 0x100;

// jump operation codes (low 6 bits of the id). Even = condition as named,
// odd = inverted condition.
pub const OPJ_SUB_JZ: u32 = 0;
pub const OPJ_SUB_JNEG: u32 = 2;
pub const OPJ_SUB_JPOS: u32 = 4;
pub const OPJ_SUB_JOVFL: u32 = 6;
pub const OPJ_SUB_JBORROW: u32 = 8;
pub const OPJ_AND_JZ: u32 = 10;
pub const OPJ_OR_JZ: u32 = 12;
pub const OPJ_XOR_JZ: u32 = 14;
pub const OPJ_ADD_JZ: u32 = 16;
pub const OPJ_ADD_JNEG: u32 = 18;
pub const OPJ_ADD_JPOS: u32 = 20;
pub const OPJ_ADD_JOVFL: u32 = 22;
pub const OPJ_FP_CATEGORY: u32 = 24;
pub const OPJ_TEST_BIT_JTRUE: u32 = 26;
pub const OPJ_TEST_BITS_AND_JTRUE: u32 = 28;
pub const OPJ_TEST_BITS_OR_JTRUE: u32 = 30;
pub const OPJ_CMP_JEQ: u32 = 32;
pub const OPJ_CMP_JSB: u32 = 34;
pub const OPJ_CMP_JSA: u32 = 36;
pub const OPJ_CMP_JUB: u32 = 38;
pub const OPJ_CMP_JUA: u32 = 40;
pub const OPJ_INC_CMP_JBELOW: u32 = 48;
pub const OPJ_INC_CMP_JABOVE: u32 = 50;
pub const OPJ_SUB_MAXLEN_JPOS: u32 = 52;
pub const OPJ_JUMP: u32 = 58;
pub const OPJ_CALL: u32 = 59;
pub const OPJ_MULTIWAY_JUMP: u32 = 60;
pub const OPJ_MULTIWAY_CALL: u32 = 61;
pub const OPJ_RETURN: u32 = 62;
pub const OPJ_SYSCALL: u32 = 63;

pub const II_JUMP: u32 = II_JUMP_INSTR | OPJ_JUMP;
pub const II_CALL: u32 = II_JUMP_INSTR | OPJ_CALL;
pub const II_RETURN: u32 = II_JUMP_INSTR | OPJ_RETURN;
pub const II_SYSCALL: u32 = II_JUMP_INSTR | OPJ_SYSCALL;
pub const II_TRAP: u32 = II_JUMP_INSTR | 0x40;

// kinds of immediate operand handling
pub const OPI_NONE: u8 = 0;
pub const OPI_IMPLICIT: u8 = 1;
pub const OPI_INT8SH: u8 = 2;
pub const OPI_INT16SH16: u8 = 3;
pub const OPI_INT32SH32: u8 = 4;
pub const OPI_UINT8: u8 = 5;
pub const OPI_UINT16: u8 = 6;
pub const OPI_UINT32: u8 = 7;
pub const OPI_2INT16: u8 = 8;
pub const OPI_INT1632: u8 = 9;
pub const OPI_SYSID: u8 = 10;
pub const OPI_OT: u8 = 11;

// template variant flags
pub const VARIANT_D0: u32 = 0x01; // no destination, no operand type
pub const VARIANT_D1: u32 = 0x02; // no destination, but operand type given
pub const VARIANT_D2: u32 = 0x04; // operand type ignored
pub const VARIANT_D3: u32 = 0x08; // RD used for another purpose
pub const VARIANT_M0: u32 = 0x10; // memory operand is the destination
pub const VARIANT_R0: u32 = 0x100; // destination is a general purpose register
pub const VARIANT_F0: u32 = 0x4000; // mask allowed, fallback not
pub const VARIANT_F1: u32 = 0x8000; // fallback without mask allowed
pub const VARIANT_I2: u32 = 0x10000; // immediate operand is an integer
pub const VARIANT_U0: u32 = 0x40000; // integer operands are unsigned
pub const VARIANT_U3: u32 = 0x80000; // unsigned if option bit 3 set
pub const VARIANT_H0: u32 = 0x100000; // half precision operands

/// Number of IM3 bits available for option bits, 0-7.
pub const fn variant_options(v: u32) -> u32 {
    (v >> 24) & 7
}
const fn opt(n: u32) -> u32 {
    n << 24
}

// operand type support masks, one bit per operand type index
const OT_NONE: u32 = 0;
const OT_GP_INT: u32 = 0x0F;
const OT_GP_64: u32 = 0x08;
const OT_VEC_INT: u32 = 0x0F;
const OT_VEC_FLOAT: u32 = 0x60;
const OT_VEC_ALL: u32 = 0x6F;

/// One record of the instruction list.
#[derive(Clone, Copy, Debug)]
pub struct Instruction {
    pub name: &'static str,
    pub id: u32,
    pub category: u8,
    /// Category 1: the `format2` value of the single legal format.
    /// Categories 3 and 4: one bit per `format_index` of the catalog.
    pub format: u64,
    pub op1: u8,
    pub op2: u8,
    pub source_operands: u8,
    pub op_immediate: u8,
    pub implicit_imm: u32,
    pub optypes_gp: u32,
    pub optypes_scalar: u32,
    pub optypes_vector: u32,
    pub variant: u32,
}

const fn bits(list: &[u8]) -> u64 {
    let mut v = 0u64;
    let mut i = 0;
    while i < list.len() {
        v |= 1 << list[i];
        i += 1;
    }
    v
}

// format index groups
const F_GP_REG: u64 = bits(&[0, 6]); // register-only forms
const F_GP_IMM: u64 = bits(&[4, 7, 15, 19]); // immediate forms by size
const F_GP_MEM: u64 = bits(&[2, 8, 9, 16, 23]); // memory forms
const F_GP_MEM_IMM: u64 = bits(&[10, 20]); // memory and immediate
const F_VEC_REG: u64 = bits(&[1, 11]);
const F_VEC_IMM: u64 = bits(&[5, 12, 17, 21]);
const F_VEC_MEM: u64 = bits(&[3, 13, 14, 18]);
const F_VEC_MEM_IMM: u64 = bits(&[22]);

const F_ALL: u64 = F_GP_REG | F_GP_IMM | F_GP_MEM | F_GP_MEM_IMM
    | F_VEC_REG | F_VEC_IMM | F_VEC_MEM | F_VEC_MEM_IMM;
const F_INT_ONLY: u64 = F_ALL; // vector forms filtered by optypes
const F_JCOND: u64 = bits(&[24, 29, 30, 31, 34]);
const F_JCOND_IMM: u64 = bits(&[30, 31, 34]);
const F_JUMP_DIRECT: u64 = bits(&[26, 32, 34]);
const F_CALL_DIRECT: u64 = bits(&[27, 32, 34]);
const F_MULTIWAY: u64 = bits(&[32]);

macro_rules! ins {
    ($name:expr, $id:expr, $cat:expr, $format:expr, $op1:expr, $src:expr,
     $opi:expr, $gp:expr, $sc:expr, $vec:expr, $var:expr) => {
        Instruction {
            name: $name,
            id: $id,
            category: $cat,
            format: $format,
            op1: $op1,
            op2: 0,
            source_operands: $src,
            op_immediate: $opi,
            implicit_imm: 0,
            optypes_gp: $gp,
            optypes_scalar: $sc,
            optypes_vector: $vec,
            variant: $var,
        }
    };
}

macro_rules! jmp {
    ($name:expr, $opj:expr, $format:expr, $src:expr, $gp:expr, $vec:expr) => {
        ins!(
            $name,
            II_JUMP_INSTR | $opj,
            4,
            $format,
            $opj as u8,
            $src,
            OPI_NONE,
            $gp,
            $vec,
            $vec,
            0
        )
    };
}

/// The instruction list, sorted by id.
pub static INSTRUCTION_LIST: [Instruction; 79] = [
    ins!("nop", II_NOP, 3, bits(&[0]), 0, 0, OPI_NONE, OT_GP_INT, OT_NONE, OT_NONE,
         VARIANT_D0 | VARIANT_D2),
    ins!("move", II_MOVE, 3, F_ALL, 1, 1, OPI_NONE, OT_GP_INT, OT_VEC_ALL, OT_VEC_ALL, 0),
    ins!("store", II_STORE, 3, F_GP_MEM | F_GP_MEM_IMM | F_VEC_MEM | F_VEC_MEM_IMM, 2, 1,
         OPI_NONE, OT_GP_INT, OT_VEC_ALL, OT_VEC_ALL, VARIANT_M0),
    ins!("add", II_ADD, 3, F_ALL, 4, 2, OPI_NONE, OT_GP_INT, OT_VEC_ALL, OT_VEC_ALL, 0),
    ins!("sub", II_SUB, 3, F_ALL, 5, 2, OPI_NONE, OT_GP_INT, OT_VEC_ALL, OT_VEC_ALL, 0),
    ins!("sub_rev", II_SUB_REV, 3, F_ALL, 6, 2, OPI_NONE, OT_GP_INT, OT_VEC_ALL, OT_VEC_ALL, 0),
    ins!("mul", II_MUL, 3, F_ALL, 7, 2, OPI_NONE, OT_GP_INT, OT_VEC_ALL, OT_VEC_ALL, 0),
    ins!("mul_hi", II_MUL_HI, 3, F_INT_ONLY, 8, 2, OPI_NONE, OT_GP_INT, OT_VEC_INT, OT_VEC_INT, 0),
    ins!("mul_hi_u", II_MUL_HI_U, 3, F_INT_ONLY, 9, 2, OPI_NONE, OT_GP_INT, OT_VEC_INT,
         OT_VEC_INT, VARIANT_U0),
    ins!("div", II_DIV, 3, F_ALL, 10, 2, OPI_NONE, OT_GP_INT, OT_VEC_ALL, OT_VEC_ALL, 0),
    ins!("div_u", II_DIV_U, 3, F_INT_ONLY, 11, 2, OPI_NONE, OT_GP_INT, OT_VEC_INT, OT_VEC_INT,
         VARIANT_U0),
    ins!("div_rev", II_DIV_REV, 3, F_ALL, 12, 2, OPI_NONE, OT_GP_INT, OT_VEC_ALL, OT_VEC_ALL, 0),
    ins!("div_rev_u", II_DIV_REV_U, 3, F_INT_ONLY, 13, 2, OPI_NONE, OT_GP_INT, OT_VEC_INT,
         OT_VEC_INT, VARIANT_U0),
    ins!("rem", II_REM, 3, F_INT_ONLY, 14, 2, OPI_NONE, OT_GP_INT, OT_VEC_INT, OT_VEC_INT, 0),
    ins!("rem_u", II_REM_U, 3, F_INT_ONLY, 15, 2, OPI_NONE, OT_GP_INT, OT_VEC_INT, OT_VEC_INT,
         VARIANT_U0),
    ins!("min", II_MIN, 3, F_ALL, 16, 2, OPI_NONE, OT_GP_INT, OT_VEC_ALL, OT_VEC_ALL, VARIANT_U3),
    ins!("min_u", II_MIN_U, 3, F_INT_ONLY, 17, 2, OPI_NONE, OT_GP_INT, OT_VEC_INT, OT_VEC_INT,
         VARIANT_U0),
    ins!("max", II_MAX, 3, F_ALL, 18, 2, OPI_NONE, OT_GP_INT, OT_VEC_ALL, OT_VEC_ALL, VARIANT_U3),
    ins!("max_u", II_MAX_U, 3, F_INT_ONLY, 19, 2, OPI_NONE, OT_GP_INT, OT_VEC_INT, OT_VEC_INT,
         VARIANT_U0),
    ins!("and", II_AND, 3, F_INT_ONLY, 20, 2, OPI_NONE, OT_GP_INT, OT_VEC_ALL, OT_VEC_ALL, 0),
    ins!("or", II_OR, 3, F_INT_ONLY, 21, 2, OPI_NONE, OT_GP_INT, OT_VEC_ALL, OT_VEC_ALL, 0),
    ins!("xor", II_XOR, 3, F_INT_ONLY, 22, 2, OPI_NONE, OT_GP_INT, OT_VEC_ALL, OT_VEC_ALL, 0),
    ins!("shift_left", II_SHIFT_LEFT, 3, F_INT_ONLY, 24, 2, OPI_NONE, OT_GP_INT, OT_VEC_INT,
         OT_VEC_INT, VARIANT_I2),
    ins!("shift_right_s", II_SHIFT_RIGHT_S, 3, F_INT_ONLY, 26, 2, OPI_NONE, OT_GP_INT,
         OT_VEC_INT, OT_VEC_INT, VARIANT_I2),
    ins!("shift_right_u", II_SHIFT_RIGHT_U, 3, F_INT_ONLY, 27, 2, OPI_NONE, OT_GP_INT,
         OT_VEC_INT, OT_VEC_INT, VARIANT_I2 | VARIANT_U0),
    ins!("compare", II_COMPARE, 3, F_ALL, 32, 2, OPI_NONE, OT_GP_INT, OT_VEC_ALL, OT_VEC_ALL,
         opt(4) | VARIANT_F1),
    ins!("mul_add", II_MUL_ADD, 3, F_ALL, 34, 3, OPI_NONE, OT_GP_INT, OT_VEC_ALL, OT_VEC_ALL,
         opt(4)),
    ins!("mul_add2", II_MUL_ADD2, 3, F_ALL, 35, 3, OPI_NONE, OT_GP_INT, OT_VEC_ALL, OT_VEC_ALL,
         opt(4)),
    ins!("add_add", II_ADD_ADD, 3, F_ALL, 36, 3, OPI_NONE, OT_GP_INT, OT_VEC_ALL, OT_VEC_ALL,
         opt(3)),
    ins!("address", II_ADDRESS, 1, 0x231, 37, 1, OPI_NONE, OT_GP_64, OT_NONE, OT_NONE,
         VARIANT_R0),
    ins!("test_bit", II_TEST_BIT, 3, F_INT_ONLY, 38, 2, OPI_NONE, OT_GP_INT, OT_VEC_INT,
         OT_VEC_INT, opt(2) | VARIANT_F1),
    ins!("test_bits_and", II_TEST_BITS_AND, 3, F_INT_ONLY, 39, 2, OPI_NONE, OT_GP_INT,
         OT_VEC_INT, OT_VEC_INT, opt(2) | VARIANT_F1),
    ins!("test_bits_or", II_TEST_BITS_OR, 3, F_INT_ONLY, 40, 2, OPI_NONE, OT_GP_INT,
         OT_VEC_INT, OT_VEC_INT, opt(2) | VARIANT_F1),
    // jump family
    jmp!("sub_jump_zero", OPJ_SUB_JZ, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("sub_jump_nzero", OPJ_SUB_JZ | 1, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("sub_jump_neg", OPJ_SUB_JNEG, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("sub_jump_nneg", OPJ_SUB_JNEG | 1, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("sub_jump_pos", OPJ_SUB_JPOS, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("sub_jump_npos", OPJ_SUB_JPOS | 1, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("sub_jump_overfl", OPJ_SUB_JOVFL, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("sub_jump_noverfl", OPJ_SUB_JOVFL | 1, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("sub_jump_borrow", OPJ_SUB_JBORROW, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("sub_jump_nborrow", OPJ_SUB_JBORROW | 1, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("and_jump_zero", OPJ_AND_JZ, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("and_jump_nzero", OPJ_AND_JZ | 1, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("or_jump_zero", OPJ_OR_JZ, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("or_jump_nzero", OPJ_OR_JZ | 1, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("xor_jump_zero", OPJ_XOR_JZ, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("xor_jump_nzero", OPJ_XOR_JZ | 1, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("add_jump_zero", OPJ_ADD_JZ, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("add_jump_nzero", OPJ_ADD_JZ | 1, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("add_jump_neg", OPJ_ADD_JNEG, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("add_jump_nneg", OPJ_ADD_JNEG | 1, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("add_jump_pos", OPJ_ADD_JPOS, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("add_jump_npos", OPJ_ADD_JPOS | 1, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("add_jump_overfl", OPJ_ADD_JOVFL, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("add_jump_noverfl", OPJ_ADD_JOVFL | 1, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("fp_category_jump_true", OPJ_FP_CATEGORY, F_JCOND_IMM, 2, OT_NONE, OT_VEC_FLOAT),
    jmp!("fp_category_jump_false", OPJ_FP_CATEGORY | 1, F_JCOND_IMM, 2, OT_NONE, OT_VEC_FLOAT),
    jmp!("test_bit_jump_true", OPJ_TEST_BIT_JTRUE, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("test_bit_jump_false", OPJ_TEST_BIT_JTRUE | 1, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("test_bits_and_jump_true", OPJ_TEST_BITS_AND_JTRUE, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("test_bits_and_jump_false", OPJ_TEST_BITS_AND_JTRUE | 1, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("test_bits_or_jump_true", OPJ_TEST_BITS_OR_JTRUE, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("test_bits_or_jump_false", OPJ_TEST_BITS_OR_JTRUE | 1, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("compare_jump_equal", OPJ_CMP_JEQ, F_JCOND, 2, OT_GP_INT, OT_VEC_ALL),
    jmp!("compare_jump_nequal", OPJ_CMP_JEQ | 1, F_JCOND, 2, OT_GP_INT, OT_VEC_ALL),
    jmp!("compare_jump_sbelow", OPJ_CMP_JSB, F_JCOND, 2, OT_GP_INT, OT_VEC_ALL),
    jmp!("compare_jump_saboveeq", OPJ_CMP_JSB | 1, F_JCOND, 2, OT_GP_INT, OT_VEC_ALL),
    jmp!("compare_jump_sabove", OPJ_CMP_JSA, F_JCOND, 2, OT_GP_INT, OT_VEC_ALL),
    jmp!("compare_jump_sbeloweq", OPJ_CMP_JSA | 1, F_JCOND, 2, OT_GP_INT, OT_VEC_ALL),
    jmp!("compare_jump_ubelow", OPJ_CMP_JUB, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("compare_jump_uaboveeq", OPJ_CMP_JUB | 1, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("compare_jump_uabove", OPJ_CMP_JUA, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("compare_jump_ubeloweq", OPJ_CMP_JUA | 1, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("increment_compare_jump_below", OPJ_INC_CMP_JBELOW, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("increment_compare_jump_aboveeq", OPJ_INC_CMP_JBELOW | 1, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("increment_compare_jump_above", OPJ_INC_CMP_JABOVE, F_JCOND, 2, OT_GP_INT, OT_NONE),
    jmp!("increment_compare_jump_beloweq", OPJ_INC_CMP_JABOVE | 1, F_JCOND, 2, OT_GP_INT, OT_NONE),
];

/// Jump and system instructions that do not follow the generic two-operand
/// shape, appended after the sorted main list.
pub static INSTRUCTION_LIST_TAIL: [Instruction; 9] = [
    jmp!("sub_maxlen_jump_pos", OPJ_SUB_MAXLEN_JPOS, F_JCOND, 2, OT_GP_64, OT_NONE),
    jmp!("sub_maxlen_jump_npos", OPJ_SUB_MAXLEN_JPOS | 1, F_JCOND, 2, OT_GP_64, OT_NONE),
    jmp!("jump", OPJ_JUMP, F_JUMP_DIRECT, 0, OT_GP_INT, OT_NONE),
    jmp!("call", OPJ_CALL, F_CALL_DIRECT, 0, OT_GP_INT, OT_NONE),
    jmp!("multiway_jump", OPJ_MULTIWAY_JUMP, F_MULTIWAY, 1, OT_GP_INT, OT_NONE),
    jmp!("multiway_call", OPJ_MULTIWAY_CALL, F_MULTIWAY, 1, OT_GP_INT, OT_NONE),
    ins!("return", II_RETURN, 1, 0x161, OPJ_RETURN as u8, 0, OPI_NONE, OT_GP_INT, OT_NONE,
         OT_NONE, VARIANT_D0 | VARIANT_D2),
    ins!("syscall", II_SYSCALL, 1, 0x264, OPJ_SYSCALL as u8, 1, OPI_SYSID, OT_GP_INT,
         OT_NONE, OT_NONE, VARIANT_D0 | VARIANT_D2),
    ins!("trap", II_TRAP, 1, 0x177, 7, 1, OPI_UINT16, OT_GP_INT, OT_NONE, OT_NONE,
         VARIANT_D0 | VARIANT_D2),
];

/// All instruction records with the given id.
pub fn instructions_by_id(id: u32) -> impl Iterator<Item = &'static Instruction> {
    INSTRUCTION_LIST
        .iter()
        .chain(INSTRUCTION_LIST_TAIL.iter())
        .filter(move |i| i.id == id)
}

/// Look up an instruction by its mnemonic.
pub fn instruction_by_name(name: &str) -> Option<&'static Instruction> {
    INSTRUCTION_LIST
        .iter()
        .chain(INSTRUCTION_LIST_TAIL.iter())
        .find(|i| i.name == name)
}

/// Find the record matching a decoded instruction, for the disassembler:
/// category and op1 (and the concrete format for single format entries).
pub fn instruction_by_op(category: u8, format2: u16, op1: u8) -> Option<&'static Instruction> {
    INSTRUCTION_LIST
        .iter()
        .chain(INSTRUCTION_LIST_TAIL.iter())
        .find(|i| {
            if category == 1 {
                i.category == 1 && i.format == format2 as u64
            } else {
                i.category == category && i.op1 == op1
            }
        })
}

/// Map a base operation to the jump operation code testing the result,
/// used when an arithmetic instruction is merged with a conditional jump.
/// `cond` is one of the `OPJ_*` condition groups of the sub family; the
/// function translates it to the group of the base operation.
pub fn combine_jump(base: u32, sub_opj: u32) -> Option<u32> {
    let opj = match (base, sub_opj & !1) {
        (II_SUB, c) if c <= OPJ_SUB_JBORROW => c,
        (II_ADD, OPJ_SUB_JZ) => OPJ_ADD_JZ,
        (II_ADD, OPJ_SUB_JNEG) => OPJ_ADD_JNEG,
        (II_ADD, OPJ_SUB_JPOS) => OPJ_ADD_JPOS,
        (II_ADD, OPJ_SUB_JOVFL) => OPJ_ADD_JOVFL,
        (II_AND, OPJ_SUB_JZ) => OPJ_AND_JZ,
        (II_OR, OPJ_SUB_JZ) => OPJ_OR_JZ,
        (II_XOR, OPJ_SUB_JZ) => OPJ_XOR_JZ,
        (II_TEST_BIT, OPJ_SUB_JZ) => OPJ_TEST_BIT_JTRUE | 1,
        (II_TEST_BITS_AND, OPJ_SUB_JZ) => OPJ_TEST_BITS_AND_JTRUE | 1,
        (II_TEST_BITS_OR, OPJ_SUB_JZ) => OPJ_TEST_BITS_OR_JTRUE | 1,
        _ => return None,
    };
    Some(II_JUMP_INSTR | (opj ^ (sub_opj & 1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_sorted_by_id() {
        for w in INSTRUCTION_LIST.windows(2) {
            assert!(w[0].id <= w[1].id, "{} out of order", w[1].name);
        }
    }

    #[test]
    fn lookup_by_name_and_id() {
        let add = instruction_by_name("add").unwrap();
        assert_eq!(add.id, II_ADD);
        assert_eq!(instructions_by_id(II_ADD).count(), 1);
        let jz = instruction_by_name("sub_jump_zero").unwrap();
        assert_eq!(jz.id, II_JUMP_INSTR | OPJ_SUB_JZ);
        assert_eq!(jz.category, 4);
    }

    #[test]
    fn jump_combination() {
        assert_eq!(
            combine_jump(II_SUB, OPJ_SUB_JZ | 1),
            Some(II_JUMP_INSTR | OPJ_SUB_JZ | 1)
        );
        assert_eq!(
            combine_jump(II_AND, OPJ_SUB_JZ),
            Some(II_JUMP_INSTR | OPJ_AND_JZ)
        );
        assert_eq!(combine_jump(II_MUL, OPJ_SUB_JZ), None);
    }
}
