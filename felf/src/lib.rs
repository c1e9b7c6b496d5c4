//! Object and executable file container for the ForwardCom binary tools.
//!
//! The [`Container`](container/struct.Container.html) type owns one object or
//! executable file split into typed arrays: section headers, program headers,
//! symbols, relocations, two string tables and the raw section data. The
//! assembler fills a container and serializes it with
//! [`Container::join`](container/struct.Container.html#method.join); the
//! linker reads many containers, lays them out and joins the result; the
//! disassembler reads one and sorts its symbols by address.
//!
//! [`library`](library/index.html) reads and writes UNIX `ar` archives of
//! ForwardCom objects.

pub mod container;
pub mod elf;
pub mod error;
pub mod library;
pub mod strings;

pub use container::Container;
pub use error::ElfError;
pub use library::Library;
pub use strings::StringBuffer;

use std::fs::File;
use std::io::prelude::*;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Read and parse a container file.
pub fn read_file<P: AsRef<Path>>(path: P) -> std::io::Result<Result<Container, ElfError>> {
    let mut bytes = Vec::new();
    BufReader::new(File::open(path)?).read_to_end(&mut bytes)?;
    Ok(Container::read(&bytes))
}

/// Write a serialized container file.
pub fn write_file<P: AsRef<Path>>(path: P, bytes: &[u8]) -> std::io::Result<()> {
    BufWriter::new(File::create(path)?).write_all(bytes)
}
