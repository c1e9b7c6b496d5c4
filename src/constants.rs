/// Bytes per code word.
pub const WORD_BYTES: u32 = 4;

/// Number of general purpose and vector registers.
pub const REGISTER_COUNT: usize = 32;

/// Filler word used for alignment space between executable sections.
/// Encodes an unconditional trap so that execution never falls through
/// into padding unnoticed.
pub const FILLER_INSTRUCTION: u32 = 0x7FFF_FFFF;

/// log2 of the minimum alignment of memory map entries. Program segments
/// with a new base pointer or new access permissions start at a multiple of
/// `1 << MEMORY_MAP_ALIGN`.
pub const MEMORY_MAP_ALIGN: u8 = 12;

/// Maximum alignment of a section or an `align` directive, in bytes.
pub const MAX_ALIGN: u64 = 0x1000;

/// Maximum number of size-optimization passes in the assembler.
pub const MAX_OPTI_PASS: u32 = 10;

/// Default maximum vector length in bytes.
pub const MAX_VECTOR_LENGTH: u64 = 128;
