//! Handlers for the jump instruction family.
//!
//! All handlers share the same shape: read the two parameters, evaluate the
//! branch condition, invert it if the operation code is odd, and advance the
//! instruction pointer by `addr_operand * 4` when taken. Handlers that
//! compute an arithmetic result return it for write-back; the others set
//! `running = 2` to discard it.

use super::{Interrupt, Machine, MSK_OVERFL_SIGN, MSK_OVERFL_UNSIGN, RT_NOT_TAKEN, RT_TAKEN};
use crate::instructions::*;

pub type JumpHandler = fn(&mut Machine) -> Result<Option<u64>, Interrupt>;

fn take_branch(t: &mut Machine, branch: u32) {
    // invert the condition if the operation code is odd
    if (branch ^ t.op) & 1 != 0 {
        t.ip = (t.ip as i64 + t.addr_operand * 4) as u64;
        t.return_type |= RT_TAKEN;
    } else {
        t.return_type |= RT_NOT_TAKEN;
    }
}

fn sub_jump_generic(t: &mut Machine) -> Result<Option<u64>, Interrupt> {
    let a = t.parm[1];
    let b = t.parm[2];
    let size_mask = t.size_mask();
    let sign_bit = (size_mask >> 1) + 1;
    let result = a.wrapping_sub(b);
    let op1 = (t.op & !1) as u32;

    let mut signed_overflow = false;
    let mut unsigned_overflow = false;
    if t.num_contr & MSK_OVERFL_SIGN != 0 || op1 == OPJ_SUB_JOVFL {
        // overflow if a and b have opposite sign and the result has the
        // opposite sign of a
        signed_overflow = (a ^ b) & (a ^ result) & sign_bit != 0;
    }
    if t.num_contr & MSK_OVERFL_UNSIGN != 0 || op1 == OPJ_SUB_JBORROW {
        unsigned_overflow = result & size_mask > a & size_mask;
    }

    let branch = match op1 {
        OPJ_SUB_JZ => result & size_mask == 0,
        OPJ_SUB_JNEG => result & sign_bit != 0,
        OPJ_SUB_JPOS => result & sign_bit == 0 && result & size_mask != 0,
        OPJ_SUB_JOVFL => {
            let b = signed_overflow;
            signed_overflow = false;
            b
        }
        OPJ_SUB_JBORROW => {
            let b = unsigned_overflow;
            unsigned_overflow = false;
            b
        }
        _ => return Err(Interrupt::InstIllegal),
    };
    if t.operand_type > 3 {
        return Err(Interrupt::InstIllegal); // integer types only
    }
    if signed_overflow {
        return Err(Interrupt::OverflSign);
    }
    if unsigned_overflow {
        return Err(Interrupt::OverflUnsign);
    }
    take_branch(t, branch as u32);
    Ok(Some(result & size_mask))
}

fn add_jump_generic(t: &mut Machine) -> Result<Option<u64>, Interrupt> {
    if t.operand_type > 4 {
        // the operation codes above the add group are reused for floating
        // point category tests
        return fp_category_jump(t);
    }
    let a = t.parm[1];
    let b = t.parm[2];
    let size_mask = t.size_mask();
    let sign_bit = (size_mask >> 1) + 1;
    let result = a.wrapping_add(b);
    let op1 = (t.op & !1) as u32;

    let mut signed_overflow = false;
    if t.num_contr & MSK_OVERFL_SIGN != 0 || op1 == OPJ_ADD_JOVFL {
        // overflow if a and b have the same sign and the result has the
        // opposite sign of a
        signed_overflow = !(a ^ b) & (a ^ result) & sign_bit != 0;
    }

    let branch = match op1 {
        OPJ_ADD_JZ => result & size_mask == 0,
        OPJ_ADD_JNEG => result & sign_bit != 0,
        OPJ_ADD_JPOS => result & sign_bit == 0 && result & size_mask != 0,
        OPJ_ADD_JOVFL => {
            let b = signed_overflow;
            signed_overflow = false;
            b
        }
        _ => return Err(Interrupt::InstIllegal),
    };
    if signed_overflow {
        return Err(Interrupt::OverflSign);
    }
    take_branch(t, branch as u32);
    Ok(Some(result & size_mask))
}

fn fp_category_jump(t: &mut Machine) -> Result<Option<u64>, Interrupt> {
    // jump if the operand belongs to one of the categories selected by the
    // immediate bit mask: 1 = nan, 2 = zero, 4 = subnormal, 8 = normal,
    // 0x10 = infinite
    let a = t.parm[1];
    let mask = t.parm[2] as u32;
    let (exp_zero, exp_all, mant_zero) = match t.operand_type {
        5 => {
            let v = a as u32;
            ((v >> 23) & 0xFF == 0, (v >> 23) & 0xFF == 0xFF, v & 0x7F_FFFF == 0)
        }
        6 => ((a >> 52) & 0x7FF == 0, (a >> 52) & 0x7FF == 0x7FF, a & 0xF_FFFF_FFFF_FFFF == 0),
        _ => return Err(Interrupt::InstIllegal),
    };
    let category = if exp_all {
        if mant_zero {
            0x10 // infinite
        } else {
            1 // nan
        }
    } else if exp_zero {
        if mant_zero {
            2 // zero
        } else {
            4 // subnormal
        }
    } else {
        8 // normal
    };
    take_branch(t, (mask & category != 0) as u32);
    t.running = 2;
    Ok(None)
}

fn and_jump_zero(t: &mut Machine) -> Result<Option<u64>, Interrupt> {
    let size_mask = t.size_mask();
    let result = t.parm[1] & t.parm[2] & size_mask;
    if t.operand_type > 3 {
        return Err(Interrupt::InstIllegal);
    }
    take_branch(t, (result == 0) as u32);
    Ok(Some(result))
}

fn or_jump_zero(t: &mut Machine) -> Result<Option<u64>, Interrupt> {
    let size_mask = t.size_mask();
    let result = (t.parm[1] | t.parm[2]) & size_mask;
    if t.operand_type > 3 {
        return Err(Interrupt::InstIllegal);
    }
    take_branch(t, (result == 0) as u32);
    Ok(Some(result))
}

fn xor_jump_zero(t: &mut Machine) -> Result<Option<u64>, Interrupt> {
    let size_mask = t.size_mask();
    let result = (t.parm[1] ^ t.parm[2]) & size_mask;
    if t.operand_type > 3 {
        return Err(Interrupt::InstIllegal);
    }
    take_branch(t, (result == 0) as u32);
    Ok(Some(result))
}

fn test_bit_jump_true(t: &mut Machine) -> Result<Option<u64>, Interrupt> {
    let a = t.parm[1];
    let b = t.parm[2];
    let bits = 8u64 << (crate::types::DATA_SIZE_LOG[(t.operand_type & 7) as usize]);
    // bits out of range test as zero
    let branch = if b < bits { (a >> b) & 1 } else { 0 };
    take_branch(t, branch as u32);
    t.running = 2;
    Ok(None)
}

fn test_bits_and_jump_true(t: &mut Machine) -> Result<Option<u64>, Interrupt> {
    let size_mask = t.size_mask();
    let a = t.parm[1] & size_mask;
    let b = t.parm[2] & size_mask;
    take_branch(t, (a & b == b) as u32);
    t.running = 2;
    Ok(None)
}

fn test_bits_or_jump_true(t: &mut Machine) -> Result<Option<u64>, Interrupt> {
    let size_mask = t.size_mask();
    let a = t.parm[1] & size_mask;
    let b = t.parm[2] & size_mask;
    take_branch(t, (a & b != 0) as u32);
    t.running = 2;
    Ok(None)
}

fn is_nan_f(v: u32) -> bool {
    v & 0x7FFF_FFFF > 0x7F80_0000
}
fn is_nan_d(v: u64) -> bool {
    v & 0x7FFF_FFFF_FFFF_FFFF > 0x7FF0_0000_0000_0000
}

fn compare_jump_generic(t: &mut Machine) -> Result<Option<u64>, Interrupt> {
    let a = t.parm[1];
    let b = t.parm[2];
    let branch: u32;
    if t.operand_type < 4 {
        // integer types. signed order by flipping the sign bit
        let size_mask = t.size_mask();
        let sign_bit = (size_mask >> 1) + 1;
        let au = a & size_mask;
        let bu = b & size_mask;
        branch = match t.op & 0xE {
            0 => (au == bu) as u32,                            // equal
            2 => ((au ^ sign_bit) < (bu ^ sign_bit)) as u32,   // signed below
            4 => ((au ^ sign_bit) > (bu ^ sign_bit)) as u32,   // signed above
            6 => (au < bu) as u32,                             // unsigned below
            8 => (au > bu) as u32,                             // unsigned above
            _ => return Err(Interrupt::InstIllegal),
        };
    } else {
        // floating point compare in vector registers. Ordered variants
        // (operation codes below the ordered-test pair) never branch on nan;
        // the inverted variants do.
        let (unordered, af, bf): (bool, f64, f64) = match t.operand_type {
            5 => (
                is_nan_f(a as u32) || is_nan_f(b as u32),
                f32::from_bits(a as u32) as f64,
                f32::from_bits(b as u32) as f64,
            ),
            6 => (
                is_nan_d(a) || is_nan_d(b),
                f64::from_bits(a),
                f64::from_bits(b),
            ),
            _ => return Err(Interrupt::InstIllegal),
        };
        if unordered && t.op < OPJ_CMP_JUA {
            // don't evaluate the condition; only inverted variants branch
            branch = 0;
        } else {
            branch = match t.op & 0xE {
                0 => (af == bf) as u32,             // equal
                2 => (af < bf) as u32,              // below
                4 => (af > bf) as u32,              // above
                6 => (af.abs() < bf.abs()) as u32,  // absolute below
                8 => (!unordered) as u32,           // ordered
                _ => return Err(Interrupt::InstIllegal),
            };
        }
    }
    take_branch(t, branch);
    t.running = 2;
    Ok(None)
}

fn increment_compare_jump(t: &mut Machine) -> Result<Option<u64>, Interrupt> {
    let size_mask = t.size_mask();
    let sign_bit = (size_mask >> 1) + 1;
    let a = t.parm[1];
    let b = t.parm[2];
    if t.operand_type > 3 {
        return Err(Interrupt::InstIllegal);
    }
    let result = a.wrapping_add(1);
    let below = ((a & size_mask) ^ sign_bit) < ((b & size_mask) ^ sign_bit);
    let branch = if (t.op & !1) as u32 == OPJ_INC_CMP_JBELOW {
        below
    } else {
        !below
    };
    take_branch(t, branch as u32);
    Ok(Some(result & size_mask))
}

fn sub_maxlen_jump_pos(t: &mut Machine) -> Result<Option<u64>, Interrupt> {
    // subtract the maximum vector length and jump while the remaining
    // length is positive. The immediate selects the operand type whose
    // maximum length applies.
    if t.parm[2] > 7 {
        return Err(Interrupt::InstIllegal);
    }
    if t.operand_type != 3 {
        return Err(Interrupt::InstIllegal); // requires a 64-bit register
    }
    let result = t.parm[1].wrapping_sub(t.max_vector_length);
    take_branch(t, ((result as i64) > 0) as u32);
    Ok(Some(result))
}

fn jump_call_58(t: &mut Machine) -> Result<Option<u64>, Interrupt> {
    let target = match t.fmt.format2 {
        0x170 | 0x171 | 0x260 | 0x360 => (t.ip as i64 + t.addr_operand * 4) as u64,
        0x263 => t.read_memory_operand(t.mem_address)?,
        _ => return Err(Interrupt::InstIllegal),
    };
    if t.op & 1 != 0 {
        t.call_stack.push(t.ip);
        if t.call_stack.len() > t.call_depth_max {
            t.call_depth_max = t.call_stack.len();
        }
    }
    t.ip = target;
    t.return_type = RT_TAKEN;
    t.running = 2;
    Ok(None)
}

fn multiway_and_indirect(t: &mut Machine) -> Result<Option<u64>, Interrupt> {
    // jump through a table of self-relative offsets, scaled by 4 and
    // relative to the reference point in the first operand
    let mut offset = t.read_memory_operand(t.mem_address)? as i64;
    let bits = 8 * crate::types::DATA_SIZE[(t.operand_type & 7) as usize].min(8);
    offset = (offset << (64 - bits)) >> (64 - bits); // sign extend table entry
    let target = t.parm[1].wrapping_add((offset << 2) as u64);
    if t.op & 1 != 0 {
        t.call_stack.push(t.ip);
        if t.call_stack.len() > t.call_depth_max {
            t.call_depth_max = t.call_stack.len();
        }
    }
    t.ip = target;
    t.return_type = RT_TAKEN;
    t.running = 2;
    Ok(None)
}

fn return_62(t: &mut Machine) -> Result<Option<u64>, Interrupt> {
    match t.call_stack.pop() {
        Some(target) => {
            t.ip = target;
            t.return_type = RT_TAKEN;
        }
        None => {
            // returning with an empty call stack ends the program
            t.ip = t.entry_point;
            t.return_type = 0;
        }
    }
    t.running = 2;
    Ok(None)
}

fn syscall_63(t: &mut Machine) -> Result<Option<u64>, Interrupt> {
    // module id in IM3 extended by OP2, function id in the immediate field
    let module = t.instr.im3() | t.instr.op2() << 6;
    let function = t.parm[2] as u32;
    match (module, function) {
        (0, 0) => {
            // terminate with the status in r0
            t.exit_status = Some(t.registers[0]);
        }
        _ => return Err(Interrupt::WrongParameters),
    }
    t.running = 2;
    t.return_type = 0;
    Ok(None)
}

/// Dispatch table for the jump family, indexed by the low six bits of the
/// operation code.
pub static JUMP_TABLE: [Option<JumpHandler>; 64] = [
    Some(sub_jump_generic),           // 0
    Some(sub_jump_generic),
    Some(sub_jump_generic),
    Some(sub_jump_generic),
    Some(sub_jump_generic),           // 4
    Some(sub_jump_generic),
    Some(sub_jump_generic),
    Some(sub_jump_generic),
    Some(sub_jump_generic),           // 8
    Some(sub_jump_generic),
    Some(and_jump_zero),              // 10
    Some(and_jump_zero),
    Some(or_jump_zero),               // 12
    Some(or_jump_zero),
    Some(xor_jump_zero),              // 14
    Some(xor_jump_zero),
    Some(add_jump_generic),           // 16
    Some(add_jump_generic),
    Some(add_jump_generic),
    Some(add_jump_generic),
    Some(add_jump_generic),           // 20
    Some(add_jump_generic),
    Some(add_jump_generic),
    Some(add_jump_generic),
    Some(fp_category_jump),           // 24
    Some(fp_category_jump),
    Some(test_bit_jump_true),         // 26
    Some(test_bit_jump_true),
    Some(test_bits_and_jump_true),    // 28
    Some(test_bits_and_jump_true),
    Some(test_bits_or_jump_true),     // 30
    Some(test_bits_or_jump_true),
    Some(compare_jump_generic),       // 32
    Some(compare_jump_generic),
    Some(compare_jump_generic),
    Some(compare_jump_generic),
    Some(compare_jump_generic),       // 36
    Some(compare_jump_generic),
    Some(compare_jump_generic),
    Some(compare_jump_generic),
    Some(compare_jump_generic),       // 40
    Some(compare_jump_generic),
    None,                             // 42
    None,
    None,                             // 44
    None,
    None,                             // 46
    None,
    Some(increment_compare_jump),     // 48
    Some(increment_compare_jump),
    Some(increment_compare_jump),     // 50
    Some(increment_compare_jump),
    Some(sub_maxlen_jump_pos),        // 52
    Some(sub_maxlen_jump_pos),
    None,                             // 54
    None,
    None,                             // 56
    None,
    Some(jump_call_58),               // 58
    Some(jump_call_58),
    Some(multiway_and_indirect),      // 60
    Some(multiway_and_indirect),
    Some(return_62),                  // 62
    Some(syscall_63),                 // 63
];

/// Handler for a jump operation code, if the code is assigned.
pub fn jump_handler(op: u32) -> Option<JumpHandler> {
    JUMP_TABLE[(op & 63) as usize]
}
