//! Linker for ForwardCom object files and library archives.
//!
//! The linker loads object files and libraries, resolves symbols with a
//! fixed-point library search, merges communal sections, lays out sections
//! grouped by base pointer and access rights, patches all relocations and
//! writes an executable container. With the relinkable option the output
//! keeps enough symbol and relocation records that a later link can replace
//! its relinkable parts.

pub mod error;
pub mod front;
pub mod layout;
pub mod relocate;

pub use error::LinkError;
pub use front::Input;

use felf::elf::{Event, Relocation, ET_EXEC, STB_LOCAL, STT_CONSTANT};
use felf::{Container, Library};
use front::{LinkSection, SymbolEntry};

/// Linker options.
#[derive(Clone, Copy, Debug, Default)]
pub struct Options {
    /// Mark the output as relinkable.
    pub relinkable: bool,
    /// Allow unresolved symbols; they are reported as warnings and the
    /// output is flagged incomplete.
    pub incomplete_allowed: bool,
    /// 0 = strip, 1 = keep local symbols, 2 = keep unused communals too.
    pub debug: u32,
}

pub struct Linker {
    pub modules: Vec<Container>,
    pub libraries: Vec<Library>,
    pub exports: Vec<SymbolEntry>,
    pub imports: Vec<SymbolEntry>,
    pub sections: Vec<LinkSection>,
    pub out: Container,
    pub errors: Vec<LinkError>,
    error_count: u32,

    pub relinkable: bool,
    pub relinking: bool,
    pub incomplete_allowed: bool,
    pub debug: u32,

    pub ip_base: u64,
    pub datap_base: u64,
    pub threadp_base: u64,
    pub entry_point: u64,
    pub event_table: u64,
    pub event_table_num: u32,
    pub event_data: Vec<Event>,
    pub event_data_size: u64,

    pub dummy_const: u64,
    pub dummy_data: u64,
    pub dummy_thread_data: u64,
    pub dummy_func: u64,
    next_dummy_data_slot: u32,
    pub unresolved_weak: u32,
    pub unresolved_weak_num: u32,

    kept_relocations: Vec<(u32, u32, Relocation)>,
    section_output_index: Vec<(u32, u32, u32)>,
}

impl Linker {
    pub fn new(options: &Options) -> Linker {
        Linker {
            modules: Vec::new(),
            libraries: Vec::new(),
            exports: Vec::new(),
            imports: Vec::new(),
            sections: Vec::new(),
            out: Container::new(),
            errors: Vec::new(),
            error_count: 0,
            relinkable: options.relinkable,
            relinking: false,
            incomplete_allowed: options.incomplete_allowed,
            debug: options.debug,
            ip_base: 0,
            datap_base: 0,
            threadp_base: 0,
            entry_point: 0,
            event_table: 0,
            event_table_num: 0,
            event_data: Vec::new(),
            event_data_size: 0,
            dummy_const: 0,
            dummy_data: 0,
            dummy_thread_data: 0,
            dummy_func: 0,
            next_dummy_data_slot: 0,
            unresolved_weak: 0,
            unresolved_weak_num: 0,
            kept_relocations: Vec::new(),
            section_output_index: Vec::new(),
        }
    }

    pub(crate) fn error(&mut self, e: LinkError) {
        if !self.errors.contains(&e) {
            if !e.is_warning() {
                self.error_count += 1;
            }
            self.errors.push(e);
        }
    }

    pub fn has_errors(&self) -> bool {
        self.error_count != 0
    }

    /// Run the whole link. Returns the executable file image unless a
    /// non-warning error occurred.
    pub fn link(&mut self, inputs: Vec<Input>) -> Option<Vec<u8>> {
        self.fill_buffers(inputs);
        if self.has_errors() {
            return None;
        }
        self.make_symbol_list();
        self.match_symbols();
        self.library_search();
        self.check_duplicate_symbols();
        if self.has_errors() {
            return None;
        }
        self.make_section_list();
        self.make_event_list();
        self.make_program_headers();
        if self.has_errors() {
            return None;
        }
        self.relocate();
        self.make_output();
        if self.has_errors() {
            return None;
        }
        Some(self.out.join(ET_EXEC))
    }
}

/// Build a library archive from object files. Each member contributes its
/// exported symbol names to the archive index.
pub fn build_library_from_objects(inputs: Vec<Input>) -> Result<Vec<u8>, LinkError> {
    let mut members = Vec::new();
    for input in inputs {
        let c = Container::read(&input.bytes)
            .map_err(|e| LinkError::FileType(format!("{}: {}", input.name, e)))?;
        let mut symbols = Vec::new();
        for sym in c.symbols.iter().skip(1) {
            if sym.st_bind != STB_LOCAL && (sym.st_section != 0 || sym.st_type == STT_CONSTANT) {
                symbols.push(c.sym_strings.get(sym.st_name).to_string());
            }
        }
        members.push((input.name, input.bytes, symbols));
    }
    Ok(felf::library::build_library(&members))
}

#[cfg(test)]
mod test;
