//! Assembler and disassembler for the ForwardCom instruction set.
//!
//! The main entry point is [`assemble`], which takes assembly source text
//! and produces a relocatable object file in the ForwardCom ELF dialect of
//! the [felf](../felf/index.html) crate.
//!
//! The assembler works in stages:
//!
//! 1. the [`lexer`] tokenizes the source with a [pest] grammar,
//! 2. the [`expression`] evaluator turns token ranges into typed operand
//!    expressions,
//! 3. the [`fit`] pass chooses the smallest instruction format that holds
//!    every operand,
//! 4. the size/address iteration in [`assembler`] repeats the fit until no
//!    instruction changes size,
//! 5. [`emit`] encodes the instructions, writes data sections and emits
//!    relocation records.
//!
//! The [`disassembler`] reads a container back into a listing that can be
//! fed to the assembler again.
//!
//! [pest]: https://docs.rs/pest/

pub mod assembler;
pub mod disassembler;
pub mod emit;
pub mod error;
pub mod expression;
pub mod fit;
pub mod lexer;

#[cfg(test)]
mod test;

pub use assembler::{Assembler, Options};
pub use disassembler::Disassembler;
pub use error::ErrorReporter;

use felf::Container;

/// Assemble source text into an object container.
///
/// Returns the container and the error reporter; the caller decides whether
/// warnings allow the output to be written.
pub fn assemble_with(source: &str, options: &Options) -> Result<(Container, ErrorReporter), String> {
    let mut a = Assembler::new(source, options)?;
    let container = a.assemble();
    let errors = std::mem::replace(&mut a.errors, ErrorReporter::new());
    Ok((container, errors))
}

/// Assemble with default options; errors are rendered as text.
pub fn assemble(source: &str) -> Result<Container, String> {
    let (container, errors) = assemble_with(source, &Options::default())?;
    if errors.has_errors() {
        return Err(errors.to_string());
    }
    Ok(container)
}

/// Disassemble an object or executable file into listing text.
pub fn disassemble(bytes: &[u8]) -> Result<String, String> {
    let container = Container::read(bytes).map_err(|e| e.to_string())?;
    Disassembler::new(container).go()
}
