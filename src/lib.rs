//! Core definitions for the ForwardCom instruction set architecture.
//!
//! This crate is the common ground of the binary tools: the assembler
//! ([fasm](../fasm/index.html)), the linker ([flink](../flink/index.html)) and
//! the emulator driver ([femu](../femu/index.html)) all work on the data
//! defined here.
//!
//! The crate contains:
//!
//! * operand types and register identifiers ([`types`], [`registers`]),
//! * the bit layout of encoded instructions ([`template`]),
//! * the catalog of legal instruction formats ([`format`]),
//! * the instruction list with per-instruction constraints ([`instructions`]),
//! * half precision floating point conversion ([`float16`]),
//! * a step-by-step instruction [`emulator`] used for testing generated code.
//!
//! Instructions are little endian and consist of one, two or three 32-bit
//! words. The first word always carries the `il` (instruction length), `mode`
//! and `op1` fields; the meaning of the remaining bits depends on the format
//! template (A, B, C, D or E).

pub mod constants;
pub mod emulator;
pub mod float16;
pub mod format;
pub mod instructions;
pub mod registers;
pub mod template;
pub mod types;

/// One 32-bit code word.
pub type Word = u32;
