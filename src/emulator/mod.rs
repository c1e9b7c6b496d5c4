//! Step-by-step instruction emulator.
//!
//! The emulator exists to test generated code: it executes the jump and
//! compare families in full, plus the small arithmetic subset needed to
//! drive them. It is not a complete implementation of the ALU.

mod jump;
mod memory;

pub use self::jump::{jump_handler, JUMP_TABLE};
pub use self::memory::{Memory, ACCESS_EXEC, ACCESS_READ, ACCESS_WRITE};

use crate::constants;
use crate::format::{self, Format, FORMAT_LIST};
use crate::instructions::{self, Instruction};
use crate::registers::REG_INDEX;
use crate::template::Template;
use crate::types::{DATA_SIZE, DATA_SIZE_MASK};
use std::fmt;

/// Reasons for stopping or trapping. The numeric payloads carry the code
/// address where the condition was detected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interrupt {
    UnknownInst,
    InstIllegal,
    AccessRead,
    AccessWrite,
    AccessExe,
    CallStackEmpty,
    ArrayBounds,
    OverflSign,
    OverflUnsign,
    OverflFloat,
    WrongParameters,
    MisalignedJump,
    Trap(u16),
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Interrupt::Trap(code) => write!(f, "trap {:#X}", code),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Result of executing one instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepResult {
    Running,
    /// The program returned to its entry point with an empty call stack.
    Finished,
    /// A syscall requested termination with this status.
    Exit(u64),
}

// return_type bits for the trace output
pub const RT_TAKEN: u32 = 0x2000;
pub const RT_NOT_TAKEN: u32 = 0x1000;

/// Machine state of one emulated thread.
pub struct Machine {
    pub registers: [u64; 32],
    /// First element of each vector register. Vector emulation is limited
    /// to one element, which is all the jump family needs.
    pub vectors: [u64; 32],
    pub vector_length: [u32; 32],
    pub memory: Memory,
    pub call_stack: Vec<u64>,
    pub ip: u64,
    pub entry_point: u64,
    pub max_vector_length: u64,
    /// Overflow interrupt enable bits, `MSK_OVERFL_*`.
    pub num_contr: u32,

    // decoded state of the current instruction
    pub op: u32,
    pub operand_type: u32,
    pub vect: bool,
    pub parm: [u64; 3],
    pub addr_operand: i64,
    pub mem_address: u64,
    pub dest: usize,
    pub fmt: &'static Format,
    pub instr: Template,
    pub return_type: u32,
    /// 0 = write result to destination, 2 = discard result.
    pub running: u8,
    pub call_depth_max: usize,
    /// Set by a terminating system call.
    pub exit_status: Option<u64>,
}

pub const MSK_OVERFL_SIGN: u32 = 1;
pub const MSK_OVERFL_UNSIGN: u32 = 2;

impl Machine {
    pub fn new(memory: Memory) -> Machine {
        Machine {
            registers: [0; 32],
            vectors: [0; 32],
            vector_length: [0; 32],
            memory,
            call_stack: Vec::new(),
            ip: 0,
            entry_point: 0,
            max_vector_length: constants::MAX_VECTOR_LENGTH,
            num_contr: 0,
            op: 0,
            operand_type: 3,
            vect: false,
            parm: [0; 3],
            addr_operand: 0,
            mem_address: 0,
            dest: 0,
            fmt: &FORMAT_LIST[0],
            instr: Template::new(),
            return_type: 0,
            running: 0,
            call_depth_max: 0,
            exit_status: None,
        }
    }

    /// Size mask for the current operand type.
    pub fn size_mask(&self) -> u64 {
        DATA_SIZE_MASK[(self.operand_type & 7) as usize]
    }

    /// Read a register as source operand, honouring the vector flag.
    fn read_reg(&self, r: usize) -> u64 {
        if self.vect {
            self.vectors[r]
        } else {
            self.registers[r]
        }
    }

    fn write_dest(&mut self, value: u64) {
        if self.vect {
            self.vectors[self.dest] = value;
            self.vector_length[self.dest] = DATA_SIZE[(self.operand_type & 7) as usize];
        } else {
            self.registers[self.dest] = value;
        }
    }

    /// Read the memory operand of the current instruction.
    pub fn read_memory_operand(&self, address: u64) -> Result<u64, Interrupt> {
        let size = DATA_SIZE[(self.operand_type & 7) as usize].min(8);
        self.memory.read(address, size)
    }

    /// Execute one instruction at the current instruction pointer.
    pub fn step(&mut self) -> Result<StepResult, Interrupt> {
        if self.ip % constants::WORD_BYTES as u64 != 0 {
            return Err(Interrupt::MisalignedJump);
        }
        let w0 = self.memory.read_code(self.ip)?;
        let mut t = Template::from_words(&[w0]);
        let length = if t.il() == 0 { 1 } else { t.il() };
        for i in 1..length {
            t.w[i as usize] = self.memory.read_code(self.ip + i as u64 * 4)?;
        }
        let fmt_ix = format::lookup_format(&t).ok_or(Interrupt::UnknownInst)?;
        let f = &FORMAT_LIST[fmt_ix];
        self.fmt = f;
        self.instr = t;
        self.running = 0;
        self.return_type = 0;
        self.ip += length as u64 * 4; // ip points past the instruction

        // operand type
        self.operand_type = match f.ot {
            format::OT_FIELD => t.ot(),
            format::OT_INT_PARITY => 2 + (t.op1() & 1),
            format::OT_FLOAT_PARITY => 5 + (t.op1() & 1),
            fixed => (fixed & 7) as u32,
        };
        self.vect = f.vect & format::VECT_REGS != 0;
        self.dest = (t.rd() & REG_INDEX as u32) as usize;

        // memory operand address
        self.mem_address = 0;
        if f.mem != 0 {
            let base = self.registers[t.rs() as usize];
            let mut addr = base;
            if f.mem & format::MEM_INDEX_RT != 0 {
                let index = t.rt() as usize;
                if index != 0x1F {
                    let scale = if f.scale & format::SCALE_INDEX_OS != 0 {
                        DATA_SIZE[(self.operand_type & 7) as usize].min(8) as i64
                    } else if f.scale & format::SCALE_MINUS1 != 0 {
                        -1
                    } else {
                        1
                    };
                    addr = addr.wrapping_add((self.registers[index] as i64 * scale) as u64);
                }
            }
            if f.addr_size != 0 && f.mem & format::MEM_OFFSET != 0 {
                let mut offset = t.read_bytes_signed(f.addr_pos as u32, f.addr_size as u32);
                if f.scale & format::SCALE_OFFSET_OS != 0 {
                    offset <<= crate::types::DATA_SIZE_LOG[(self.operand_type & 7) as usize];
                }
                addr = addr.wrapping_add(offset as u64);
            }
            if f.mem & format::MEM_LIMIT != 0 {
                let limit = t.read_bytes(f.addr_pos as u32, f.addr_size as u32);
                let index = self.registers[t.rt() as usize];
                if index > limit {
                    return Err(Interrupt::ArrayBounds);
                }
            }
            self.mem_address = addr;
        }

        match f.exe_table {
            format::XT_TRAP => {
                let code = t.read_bytes(f.imm_pos as u32, f.imm_size as u32) as u16;
                Err(Interrupt::Trap(code))
            }
            format::XT_JUMP => self.step_jump(),
            _ => self.step_multi(),
        }
    }

    /// Execute a jump-family instruction.
    fn step_jump(&mut self) -> Result<StepResult, Interrupt> {
        let f = self.fmt;
        let t = self.instr;
        self.op = if f.imm2 & 0xC0 == format::IMM2_JUMP_NO_OPJ {
            // template D: unconditional jump or call
            match f.format2 & 7 {
                0 => instructions::OPJ_JUMP,
                1 => instructions::OPJ_CALL,
                _ => return Err(Interrupt::UnknownInst),
            }
        } else {
            t.op1()
        };

        // jump offset operand
        self.addr_operand = if f.tmpl == 0xD {
            t.im2d() as i64
        } else if f.jump_size != 0 {
            t.read_bytes_signed(f.jump_pos as u32, f.jump_size as u32)
        } else {
            0
        };

        // first and second parameter
        let a = self.read_reg((t.rd() & 0x1F) as usize);
        let b = if f.imm_size != 0 {
            if self.op == instructions::OPJ_SYSCALL {
                t.read_bytes(f.imm_pos as u32, f.imm_size as u32)
            } else {
                t.read_bytes_signed(f.imm_pos as u32, f.imm_size as u32) as u64
            }
        } else if f.op_avail & format::OPA_RS != 0 {
            self.read_reg(t.rs() as usize)
        } else {
            0
        };
        self.parm = [0, a, b];

        let handler = jump_handler(self.op).ok_or(Interrupt::UnknownInst)?;
        let result = handler(self)?;
        if self.running == 0 {
            if let Some(v) = result {
                self.write_dest(v);
            }
        }
        if let Some(status) = self.exit_status.take() {
            return Ok(StepResult::Exit(status));
        }
        // a return to the entry point with an empty call stack ends the run
        if self.ip == self.entry_point && self.call_stack.is_empty() && self.return_type == 0 {
            return Ok(StepResult::Finished);
        }
        Ok(StepResult::Running)
    }

    /// Execute a multiformat instruction. Only the arithmetic subset used
    /// by the tests is covered; everything else reports `UnknownInst`.
    fn step_multi(&mut self) -> Result<StepResult, Interrupt> {
        let f = self.fmt;
        let t = self.instr;
        let op = t.op1();
        let mask = self.size_mask();

        // gather source operands: last operand is immediate, memory, or RT;
        // first is RS or RD
        let imm = if f.imm_size != 0 {
            Some(t.read_bytes_signed(f.imm_pos as u32, f.imm_size as u32) as u64)
        } else {
            None
        };
        let mem = if f.mem != 0 {
            Some(self.read_memory_operand(self.mem_address)?)
        } else {
            None
        };
        let a;
        let b;
        if let Some(v) = imm.or(mem) {
            b = v;
            a = if f.op_avail & format::OPA_RS != 0 && f.mem == 0 {
                self.read_reg(t.rs() as usize)
            } else if f.mem != 0 && f.op_avail & format::OPA_RU != 0 {
                self.read_reg(t.ru() as usize)
            } else {
                self.read_reg(self.dest)
            };
        } else {
            a = self.read_reg(t.rs() as usize);
            b = self.read_reg(t.rt() as usize);
        }

        let result: u64 = match op {
            instructions::II_NOP => return Ok(StepResult::Running),
            instructions::II_MOVE => imm.or(mem).unwrap_or(b),
            instructions::II_STORE => {
                let value = imm.unwrap_or_else(|| self.read_reg(self.dest));
                let size = DATA_SIZE[(self.operand_type & 7) as usize].min(8);
                self.memory.write(self.mem_address, size, value)?;
                return Ok(StepResult::Running);
            }
            instructions::II_ADD => a.wrapping_add(b),
            instructions::II_SUB => a.wrapping_sub(b),
            instructions::II_SUB_REV => b.wrapping_sub(a),
            instructions::II_MUL => a.wrapping_mul(b),
            instructions::II_DIV | instructions::II_DIV_U => {
                if b & mask == 0 {
                    return Err(Interrupt::OverflSign);
                }
                if op == instructions::II_DIV_U {
                    (a & mask) / (b & mask)
                } else {
                    ((a as i64) / (b as i64)) as u64
                }
            }
            instructions::II_AND => a & b,
            instructions::II_OR => a | b,
            instructions::II_XOR => a ^ b,
            instructions::II_SHIFT_LEFT => a.wrapping_shl(b as u32),
            instructions::II_SHIFT_RIGHT_S => ((a as i64) >> (b & 63)) as u64,
            instructions::II_SHIFT_RIGHT_U => (a & mask) >> (b & 63),
            instructions::II_COMPARE => {
                let opt = t.im3();
                let sign_bit = (mask >> 1) + 1;
                let (x, y) = if opt & 8 != 0 {
                    (a & mask, b & mask)
                } else {
                    ((a & mask) ^ sign_bit, (b & mask) ^ sign_bit)
                };
                let r = match opt & 6 {
                    0 => x == y,
                    2 => x < y,
                    4 => x > y,
                    _ => return Err(Interrupt::InstIllegal),
                };
                (r ^ (opt & 1 != 0)) as u64
            }
            _ => return Err(Interrupt::UnknownInst),
        };
        self.write_dest(result & mask);
        Ok(StepResult::Running)
    }

    /// Run until the program finishes, traps, or `max_steps` is exceeded.
    pub fn run(&mut self, max_steps: u64) -> Result<StepResult, Interrupt> {
        for _ in 0..max_steps {
            match self.step()? {
                StepResult::Running => {}
                done => return Ok(done),
            }
        }
        Err(Interrupt::WrongParameters)
    }
}

#[cfg(test)]
mod tests;
