//! Linker front end: load inputs, build symbol tables, search libraries to
//! a fixed point, detect duplicates and merge communal sections.

use crate::error::LinkError;
use crate::Linker;
use felf::elf::*;
use felf::{Container, Library};

// pseudo module numbers for autogenerated sections
pub const MODULE_DUMMY_CONST: u32 = 0xFFFF_FFF1;
pub const MODULE_DUMMY_DATA: u32 = 0xFFFF_FFF2;
pub const MODULE_DUMMY_THREAD: u32 = 0xFFFF_FFF3;
pub const MODULE_DUMMY_FUNC: u32 = 0xFFFF_FFF4;
pub const MODULE_EVENT_TABLE: u32 = 0xFFFF_FFF8;
/// Library number of the linker's own special symbols.
pub const LIBRARY_SPECIAL: u32 = 0xFFFF_FFFE;

// special symbol ids
pub const SPECIAL_IP_BASE: u32 = 1;
pub const SPECIAL_DATAP_BASE: u32 = 2;
pub const SPECIAL_THREADP_BASE: u32 = 3;
pub const SPECIAL_EVENT_TABLE: u32 = 4;
pub const SPECIAL_EVENT_TABLE_NUM: u32 = 5;

// unresolved weak import classes
pub const UNRESOLVED_CONSTANT: u32 = 1;
pub const UNRESOLVED_IP_DATA: u32 = 2;
pub const UNRESOLVED_DATAP_DATA: u32 = 4;
pub const UNRESOLVED_THREADP_DATA: u32 = 8;
pub const UNRESOLVED_FUNCTION: u32 = 0x10;

/// One entry of the export or import table.
#[derive(Clone, Debug)]
pub struct SymbolEntry {
    pub name: String,
    pub st_bind: u8,
    pub st_other: u32,
    /// Module index, for symbols in loaded modules.
    pub module: u32,
    /// 0 for object files; library index + 1; `LIBRARY_SPECIAL`.
    pub library: u32,
    /// Member header offset for symbols found in a library index.
    pub member_offset: u32,
    /// Symbol index in the module, or the special symbol id.
    pub symindex: u32,
    /// Bit 1: resolved, bit 2: reported unresolved, bit 0: dummy assigned.
    pub status: u32,
}

/// One section collected for layout.
#[derive(Clone, Debug)]
pub struct LinkSection {
    pub name: String,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_size: u64,
    pub sh_align: u32,
    pub module: u32,
    pub sectioni: u32,
    pub order: u32,
    pub addr: u64,
}

/// An input file for the linker.
pub struct Input {
    pub name: String,
    pub bytes: Vec<u8>,
}

fn module_name(file_name: &str) -> String {
    file_name
        .chars()
        .map(|c| if c == ':' || c.is_whitespace() { '_' } else { c })
        .collect()
}

impl Linker {
    /// Classify and load the input files.
    pub(crate) fn fill_buffers(&mut self, inputs: Vec<Input>) {
        for input in inputs {
            let lower = input.name.to_lowercase();
            let is_library = lower.ends_with(".a") || lower.rsplit('.').next().map_or(false, |e| e.starts_with("li"));
            if is_library || Library::has_magic(&input.bytes) {
                match Library::read(input.bytes, &input.name) {
                    Ok(lib) => {
                        if let Err(e) = lib.check_members() {
                            self.error(LinkError::FileTypeLib(format!("{}: {}", input.name, e)));
                        }
                        self.libraries.push(lib);
                    }
                    Err(_) => self.error(LinkError::FileTypeLib(input.name)),
                }
            } else {
                match Container::read(&input.bytes) {
                    Ok(mut c) => {
                        c.module_name = module_name(&input.name);
                        if c.file_header.e_flags & EF_RELINKABLE != 0 {
                            c.relinkable = true;
                            self.relinking = true;
                        }
                        self.modules.push(c);
                    }
                    Err(_) => self.error(LinkError::FileType(input.name)),
                }
            }
        }
    }

    /// List the exported and imported symbols of one module. A `Weak2`
    /// symbol counts as both: it is exported, and its own module imports it
    /// so that another definition may replace it.
    fn list_symbols(&mut self, module: u32, library: u32, member_offset: u32) {
        let m = &self.modules[module as usize];
        for (symindex, sym) in m.symbols.iter().enumerate().skip(1) {
            if sym.st_bind == STB_LOCAL {
                continue;
            }
            let weak2 = sym.st_bind & STB_WEAK2 != 0;
            let bind = if weak2 {
                STB_WEAK
            } else {
                sym.st_bind & (STB_GLOBAL | STB_WEAK)
            };
            let entry = SymbolEntry {
                name: m.sym_strings.get(sym.st_name).to_string(),
                st_bind: bind,
                st_other: sym.st_other,
                module,
                library,
                member_offset,
                symindex: symindex as u32,
                status: 0,
            };
            if sym.st_section != 0 || sym.st_type == STT_CONSTANT {
                if weak2 {
                    self.imports.push(entry.clone());
                }
                self.exports.push(entry);
            } else {
                self.imports.push(entry);
            }
        }
    }

    /// Build the initial export and import lists, including the linker's
    /// special symbols.
    pub(crate) fn make_symbol_list(&mut self) {
        for m in 0..self.modules.len() {
            let lib = self.modules[m].library;
            self.list_symbols(m as u32, lib, 0);
        }
        for (id, name, other) in &[
            (SPECIAL_IP_BASE, "__ip_base", STV_IP),
            (SPECIAL_DATAP_BASE, "__datap_base", STV_DATAP),
            (SPECIAL_THREADP_BASE, "__threadp_base", STV_THREADP),
            (SPECIAL_EVENT_TABLE, "__event_table", STV_IP),
            (SPECIAL_EVENT_TABLE_NUM, "__event_table_num", 0),
        ] {
            self.exports.push(SymbolEntry {
                name: (*name).to_string(),
                st_bind: STB_WEAK,
                st_other: *other,
                module: 0,
                library: LIBRARY_SPECIAL,
                member_offset: 0,
                symindex: *id,
                status: 3,
            });
        }
        // the entry point is always needed
        self.imports.push(SymbolEntry {
            name: "__entry_point".to_string(),
            st_bind: STB_GLOBAL,
            st_other: STV_IP | STV_EXEC,
            module: 0,
            library: 0,
            member_offset: 0,
            symindex: 0,
            status: 0,
        });
        self.sort_exports();
    }

    pub(crate) fn sort_exports(&mut self) {
        // strong symbols sort before weak ones with the same name, so the
        // first match wins the strong-vs-weak race
        self.exports
            .sort_by(|a, b| (a.name.as_str(), a.st_bind & STB_WEAK)
                .cmp(&(b.name.as_str(), b.st_bind & STB_WEAK)));
    }

    /// First export with the given name, strong before weak.
    pub(crate) fn find_export(&self, name: &str) -> Option<usize> {
        let i = self
            .exports
            .partition_point(|e| e.name.as_str() < name);
        if i < self.exports.len() && self.exports[i].name == name {
            Some(i)
        } else {
            None
        }
    }

    /// Mark imports that are satisfied by an export.
    pub(crate) fn match_symbols(&mut self) {
        for i in 0..self.imports.len() {
            if self.imports[i].status & 2 == 0 {
                if self.find_export(&self.imports[i].name).is_some() {
                    self.imports[i].status |= 2;
                }
            }
        }
    }

    /// Search the libraries for unresolved strong imports until no new
    /// members are pulled in.
    pub(crate) fn library_search(&mut self) {
        let mut scheduled: Vec<(u32, u32)> = Vec::new(); // (library, member offset)
        let mut new_imports = true;
        while new_imports {
            new_imports = false;
            for i in 0..self.imports.len() {
                let entry = self.imports[i].clone();
                if entry.status & 6 != 0 || entry.st_bind & STB_WEAK != 0 {
                    continue;
                }
                let mut found = false;
                for lib in 0..self.libraries.len() {
                    let member = self.libraries[lib].find_symbol(&entry.name);
                    if member != 0 {
                        self.imports[i].status |= 2;
                        if !scheduled.contains(&(lib as u32, member)) {
                            scheduled.push((lib as u32, member));
                            // load the member and scan its symbols
                            let data = self.libraries[lib].member_data(member).to_vec();
                            let name =
                                self.libraries[lib].member_name(member).to_string();
                            match Container::read(&data) {
                                Ok(mut c) => {
                                    c.module_name = module_name(&name);
                                    c.library = lib as u32 + 1;
                                    c.relinkable = self.libraries[lib].relinkable;
                                    self.modules.push(c);
                                    let module = self.modules.len() as u32 - 1;
                                    let imports_before = self.imports.len();
                                    self.list_symbols(module, lib as u32 + 1, member);
                                    if self.imports.len() > imports_before {
                                        new_imports = true;
                                    }
                                }
                                Err(e) => {
                                    self.error(LinkError::FileTypeLib(format!(
                                        "{}: {}",
                                        name, e
                                    )));
                                }
                            }
                        }
                        found = true;
                        break;
                    }
                }
                if !found && entry.name != "__entry_point" {
                    // report each unresolved strong import exactly once
                    self.imports[i].status |= 4;
                    self.out.file_header.e_flags |= EF_INCOMPLETE;
                    let module = self
                        .modules
                        .get(entry.module as usize)
                        .map(|m| m.module_name.clone())
                        .unwrap_or_else(|| "[fixed]".to_string());
                    if self.incomplete_allowed {
                        self.error(LinkError::UnresolvedWarn {
                            symbol: entry.name.clone(),
                            module,
                        });
                    } else {
                        self.error(LinkError::Unresolved {
                            symbol: entry.name.clone(),
                            module,
                        });
                    }
                }
            }
            self.sort_exports();
            self.match_symbols();
        }

        // classify unresolved weak imports; each class gets one dummy
        for i in 0..self.imports.len() {
            let entry = &self.imports[i];
            if entry.status & 3 != 0 || entry.st_bind & STB_WEAK == 0 {
                continue;
            }
            self.imports[i].status |= 1;
            let class = self.imports[i].st_other & (STV_BASEPOINTER | STV_EXEC);
            let class = match class {
                0 => UNRESOLVED_CONSTANT,
                STV_IP => UNRESOLVED_IP_DATA,
                STV_DATAP => {
                    self.unresolved_weak_num += 1;
                    UNRESOLVED_DATAP_DATA
                }
                STV_THREADP => UNRESOLVED_THREADP_DATA,
                _ => UNRESOLVED_FUNCTION,
            };
            self.unresolved_weak |= class;
        }
    }

    /// Two strong exports with the same name are an error; only the first
    /// clash of each name is reported.
    pub(crate) fn check_duplicate_symbols(&mut self) {
        let mut i = 0;
        while i < self.exports.len() {
            let mut j = i + 1;
            let mut strong = (self.exports[i].st_bind & STB_WEAK == 0) as u32;
            while j < self.exports.len() && self.exports[j].name == self.exports[i].name {
                if self.exports[j].st_bind & STB_WEAK == 0 {
                    strong += 1;
                }
                j += 1;
            }
            if strong > 1 {
                let modules: Vec<String> = self.exports[i..j]
                    .iter()
                    .filter(|e| e.st_bind & STB_WEAK == 0)
                    .map(|e| {
                        if e.library != 0 && e.library != LIBRARY_SPECIAL {
                            format!(
                                "{}:{}",
                                self.libraries[(e.library - 1) as usize].name,
                                self.modules[e.module as usize].module_name
                            )
                        } else {
                            self.modules[e.module as usize].module_name.clone()
                        }
                    })
                    .collect();
                self.error(LinkError::DuplicateSymbol {
                    symbol: self.exports[i].name.clone(),
                    modules: modules.join(", "),
                });
            }
            i = j;
        }
    }

    /// Collect every allocatable section of every module.
    pub(crate) fn make_section_list(&mut self) {
        let mut communal: Vec<LinkSection> = Vec::new();
        for m in 0..self.modules.len() {
            let relinkable = self.modules[m].relinkable;
            for sh in 1..self.modules[m].section_headers.len() {
                let header = self.modules[m].section_headers[sh];
                if !section_type_allocated(header.sh_type) {
                    continue;
                }
                let mut section = LinkSection {
                    name: self.modules[m]
                        .sh_strings
                        .get(header.sh_name)
                        .to_string(),
                    sh_type: header.sh_type,
                    sh_flags: header.sh_flags,
                    sh_size: header.sh_size,
                    sh_align: header.sh_align,
                    module: m as u32,
                    sectioni: sh as u32,
                    order: 0,
                    addr: 0,
                };
                if relinkable || self.relinkable {
                    section.sh_flags |= SHF_RELINK;
                }
                if section.sh_flags & SHF_EVENT_HND != 0 {
                    // the unsorted event lists stay in the file but are not
                    // loaded; the sorted copy is autogenerated below
                    self.event_data_size += section.sh_size;
                    section.sh_type = SHT_LIST;
                }
                if header.sh_type == SHT_COMDAT {
                    communal.push(section);
                } else {
                    self.sections.push(section);
                }
            }
        }
        self.join_communal_sections(communal);
        self.make_dummy_sections();
        self.sort_sections();
    }

    /// Keep one instance of each communal name; the largest wins and the
    /// rest are dropped along with their symbols and relocations.
    fn join_communal_sections(&mut self, mut communal: Vec<LinkSection>) {
        communal.sort_by(|a, b| a.name.cmp(&b.name));
        let mut s1 = 0;
        while s1 < communal.len() {
            let mut s2 = s1;
            while s2 + 1 < communal.len() && communal[s2 + 1].name == communal[s1].name {
                s2 += 1;
            }
            // pick the survivor: non-relinkable beats relinkable, then the
            // largest
            let mut s4 = s1;
            let mut different_size = false;
            for s3 in s1 + 1..=s2 {
                if communal[s3].sh_flags & SHF_RELINK == 0
                    && communal[s4].sh_flags & SHF_RELINK != 0
                {
                    s4 = s3;
                } else if communal[s3].sh_size != communal[s1].sh_size {
                    different_size = true;
                    if communal[s3].sh_size > communal[s4].sh_size {
                        s4 = s3;
                    }
                }
            }
            if different_size {
                let names: Vec<String> = communal[s1..=s2]
                    .iter()
                    .map(|s| self.modules[s.module as usize].module_name.clone())
                    .collect();
                self.error(LinkError::Communal {
                    section: communal[s1].name.clone(),
                    modules: names.join(", "),
                });
            }
            // drop the whole group when nothing imports its symbols, unless
            // full debug output is requested
            let mut keep = true;
            if self.debug < 2 {
                keep = false;
                let m = communal[s4].module as usize;
                for sym in &self.modules[m].symbols {
                    if sym.st_section == communal[s4].sectioni {
                        let name = self.modules[m].sym_strings.get(sym.st_name);
                        if self.imports.iter().any(|imp| imp.name == name) {
                            keep = true;
                            break;
                        }
                    }
                }
            }
            if keep {
                self.sections.push(communal[s4].clone());
                if communal[s4].sh_flags & SHF_RELINK != 0 {
                    // symbols into a surviving relinkable communal inherit
                    // the relink attribute
                    let m = communal[s4].module as usize;
                    let sect = communal[s4].sectioni;
                    for sym in &mut self.modules[m].symbols {
                        if sym.st_section == sect {
                            sym.st_other |= STV_RELINK;
                        }
                    }
                }
            }
            // remove symbols and relocations of the dropped instances
            for s3 in s1..=s2 {
                if s3 == s4 && keep {
                    continue;
                }
                let m = communal[s3].module as usize;
                let sect = communal[s3].sectioni;
                let mut removed_names: Vec<String> = Vec::new();
                let module = &mut self.modules[m];
                for sym in &mut module.symbols {
                    if sym.st_section == sect {
                        removed_names.push(module.sym_strings.get(sym.st_name).to_string());
                        sym.st_section = 0;
                        sym.st_bind = STB_LOCAL;
                    }
                }
                for name in removed_names {
                    if let Some(e) = self
                        .exports
                        .iter()
                        .position(|e| e.module == m as u32 && e.name == name)
                    {
                        self.exports.remove(e);
                    }
                }
                for rel in &mut self.modules[m].relocations {
                    if rel.r_section == sect {
                        rel.r_type = 0; // removed
                    }
                }
            }
            s1 = s2 + 1;
        }
        self.sort_exports();
    }

    /// Synthesize the sorted event table and the dummy sections backing
    /// unresolved weak imports.
    fn make_dummy_sections(&mut self) {
        let template = LinkSection {
            name: String::new(),
            sh_type: SHT_PROGBITS,
            sh_flags: 0,
            sh_size: 8,
            sh_align: 3,
            module: 0,
            sectioni: 0,
            order: 0,
            addr: 0,
        };
        if self.event_data_size != 0 {
            self.sections.push(LinkSection {
                name: "eventhandlers_sorted".to_string(),
                sh_flags: SHF_READ | SHF_IP | SHF_ALLOC | SHF_EVENT_HND | SHF_RELINK | SHF_AUTOGEN,
                sh_size: self.event_data_size,
                module: MODULE_EVENT_TABLE,
                ..template.clone()
            });
        }
        if self.unresolved_weak & UNRESOLVED_IP_DATA != 0 {
            self.sections.push(LinkSection {
                name: "zdummyconst".to_string(),
                sh_flags: SHF_READ | SHF_IP | SHF_ALLOC | SHF_RELINK | SHF_AUTOGEN,
                module: MODULE_DUMMY_CONST,
                ..template.clone()
            });
        }
        if self.unresolved_weak & UNRESOLVED_DATAP_DATA != 0 {
            self.sections.push(LinkSection {
                name: "zdummydata".to_string(),
                sh_flags: SHF_READ | SHF_WRITE | SHF_DATAP | SHF_ALLOC | SHF_RELINK | SHF_AUTOGEN,
                sh_size: 8 * self.unresolved_weak_num as u64,
                module: MODULE_DUMMY_DATA,
                ..template.clone()
            });
        }
        if self.unresolved_weak & UNRESOLVED_THREADP_DATA != 0 {
            self.sections.push(LinkSection {
                name: "zdummythreaddata".to_string(),
                sh_flags: SHF_READ | SHF_WRITE | SHF_THREADP | SHF_ALLOC | SHF_RELINK | SHF_AUTOGEN,
                module: MODULE_DUMMY_THREAD,
                ..template.clone()
            });
        }
        if self.unresolved_weak & UNRESOLVED_FUNCTION != 0 {
            self.sections.push(LinkSection {
                name: "zdummyfunc".to_string(),
                sh_flags: SHF_EXEC | SHF_IP | SHF_ALLOC | SHF_RELINK | SHF_AUTOGEN,
                module: MODULE_DUMMY_FUNC,
                ..template
            });
        }
    }

    /// Concatenate and stable-sort all event records.
    pub(crate) fn make_event_list(&mut self) {
        for s in 0..self.sections.len() {
            if self.sections[s].sh_flags & SHF_EVENT_HND == 0
                || self.sections[s].module >= MODULE_DUMMY_CONST
            {
                continue;
            }
            let m = self.sections[s].module as usize;
            let header = self.modules[m].section_headers[self.sections[s].sectioni as usize];
            if header.sh_size % EVENT_SIZE as u64 != 0 {
                let name = self.modules[m].module_name.clone();
                self.error(LinkError::EventSize(name));
                return;
            }
            let start = header.sh_offset as usize;
            for off in (0..header.sh_size as usize).step_by(EVENT_SIZE as usize) {
                if let Some(ev) = Event::read(&self.modules[m].data[start + off..]) {
                    self.event_data.push(ev);
                }
            }
        }
        self.event_data.sort_by_key(|e| e.key);
    }
}
