//! The relocator: patch every cross reference with its final value, honour
//! the relocation kind, scale and addend, keep load-time relocations for the
//! executable file, and build the output container.

use crate::error::LinkError;
use crate::front::*;
use crate::Linker;
use felf::elf::*;
use felf::strings::StringBuffer;
use util::Endian;

use byteorder::ByteOrder;

/// The body of the dummy function backing unresolved weak function calls:
/// clear r0 and v0, then return.
fn dummy_function_body() -> [u32; 2] {
    let mut clear = fcpu::template::Template::new();
    clear.set_il(1);
    clear.set_mode(4); // 8-bit immediate form
    clear.set_op1(fcpu::instructions::II_MOVE);
    clear.set_ot(3);
    let mut ret = fcpu::template::Template::new();
    ret.set_il(1);
    ret.set_mode(6);
    ret.set_op1(fcpu::instructions::OPJ_RETURN);
    [clear.w[0], ret.w[0]]
}

impl Linker {
    /// Resolve the final address of a module's symbol. Local symbols follow
    /// their section; externals go through the export table and may land on
    /// a dummy. Returns `(address, target_module, resolved symbol copy)`.
    pub(crate) fn find_symbol_address(
        &mut self,
        module: u32,
        symindex: u32,
    ) -> Option<(u64, u32, Symbol)> {
        let sym = self.modules[module as usize].symbols[symindex as usize];
        if sym.st_section != 0 && sym.st_bind & !STB_EXE != STB_WEAK2 {
            // local to this module
            if sym.st_type == STT_CONSTANT {
                return Some((sym.st_value, module, sym));
            }
            let sect = sym.st_section as usize;
            if sect >= self.modules[module as usize].section_headers.len() {
                return None;
            }
            let addr =
                self.modules[module as usize].section_headers[sect].sh_addr + sym.st_value;
            return Some((addr, module, sym));
        }
        // external: search the exports
        let name = self.modules[module as usize]
            .sym_strings
            .get(sym.st_name)
            .to_string();
        match self.find_export(&name) {
            None => {
                // unresolved: point it at the matching dummy
                let addr = match sym.st_other & (STV_BASEPOINTER | STV_EXEC) {
                    0 => 0,
                    STV_IP => self.dummy_const,
                    STV_DATAP => {
                        // each writable dummy reference gets its own slot
                        let slot = self.next_dummy_data_slot;
                        self.next_dummy_data_slot += 1;
                        self.dummy_data + slot as u64 * 8
                    }
                    STV_THREADP => self.dummy_thread_data,
                    _ => self.dummy_func,
                };
                Some((addr, module, sym))
            }
            Some(e) => {
                let entry = self.exports[e].clone();
                if entry.library == LIBRARY_SPECIAL {
                    let addr = match entry.symindex {
                        SPECIAL_IP_BASE => self.ip_base,
                        SPECIAL_DATAP_BASE => self.datap_base,
                        SPECIAL_THREADP_BASE => self.threadp_base,
                        SPECIAL_EVENT_TABLE => self.event_table,
                        SPECIAL_EVENT_TABLE_NUM => self.event_table_num as u64,
                        _ => return None,
                    };
                    let mut s = sym;
                    s.st_other |= STV_AUTOGEN;
                    return Some((addr, module, s));
                }
                let tm = entry.module as usize;
                let target = self.modules[tm].symbols[entry.symindex as usize];
                if self.modules[tm].relinkable {
                    self.modules[tm].symbols[entry.symindex as usize].st_other |= STV_RELINK;
                }
                if target.st_type == STT_CONSTANT {
                    return Some((target.st_value, entry.module, target));
                }
                let sect = target.st_section as usize;
                if sect == 0 || sect >= self.modules[tm].section_headers.len() {
                    self.error(LinkError::Unresolved {
                        symbol: name,
                        module: self.modules[module as usize].module_name.clone(),
                    });
                    return None;
                }
                let addr = self.modules[tm].section_headers[sect].sh_addr + target.st_value;
                Some((addr, entry.module, target))
            }
        }
    }

    /// Warn when a call reaches a function whose declared register use
    /// exceeds what the caller expects.
    fn check_register_use(&mut self, module: u32, caller: &Symbol, callee: &Symbol) {
        if (caller.st_other | callee.st_other) & STV_REGUSE == 0 {
            return;
        }
        let (mut use_a1, mut use_a2) = (caller.st_reguse1, caller.st_reguse2);
        if caller.st_other & STV_REGUSE == 0 {
            use_a1 = 0x0000_FFFF;
            use_a2 = 0x0000_FFFF;
        }
        let (mut use_b1, mut use_b2) = (callee.st_reguse1, callee.st_reguse2);
        if callee.st_other & STV_REGUSE == 0 {
            use_b1 = 0x0000_FFFF;
            use_b2 = 0x0000_FFFF;
        }
        let excess1 = use_b1 & !use_a1;
        let excess2 = use_b2 & !use_a2;
        if excess1 | excess2 != 0 {
            let symbol = self.modules[module as usize]
                .sym_strings
                .get(callee.st_name)
                .to_string();
            let name = self.modules[module as usize].module_name.clone();
            self.error(LinkError::RegisterUse {
                module: name,
                symbol,
                excess: (excess1, excess2),
            });
        }
    }

    /// Patch every relocation of every module.
    pub(crate) fn relocate(&mut self) {
        for modu in 0..self.modules.len() {
            let n_relocs = self.modules[modu].relocations.len();
            for r in 0..n_relocs {
                let reloc = self.modules[modu].relocations[r];
                if reloc.r_type == 0 {
                    continue; // removed with a communal section
                }
                let mut relink = self.modules[modu].relinkable;
                let sect = reloc.r_section as usize;
                if sect >= self.modules[modu].section_headers.len() {
                    self.error(LinkError::Container("relocation section out of range".into()));
                    continue;
                }
                let source_pos = (self.modules[modu].section_headers[sect].sh_offset
                    + reloc.r_offset) as usize;
                let source_addr =
                    self.modules[modu].section_headers[sect].sh_addr + reloc.r_offset;

                let caller = self.modules[modu].symbols[reloc.r_sym as usize];
                let (target_addr, target_module, target_sym) =
                    match self.find_symbol_address(modu as u32, reloc.r_sym) {
                        Some(t) => t,
                        None => continue,
                    };
                if target_sym.st_other & STV_RELINK != 0 {
                    relink = true;
                }
                self.check_register_use(modu as u32, &caller, &target_sym);

                // reference point
                let mut ref_addr = 0u64;
                let mut ref_sym: Option<Symbol> = None;
                if reloc.r_refsym != 0 && reloc.r_type & R_FORW_RELTYPEMASK == R_FORW_REFP {
                    if let Some((a, _, s)) =
                        self.find_symbol_address(modu as u32, reloc.r_refsym)
                    {
                        ref_addr = a;
                        if s.st_other & STV_RELINK != 0 {
                            relink = true;
                        }
                        ref_sym = Some(s);
                    }
                }

                let mut value = target_addr.wrapping_sub(ref_addr) as i64;
                let mut r_type = reloc.r_type;
                let module_name = self.modules[modu].module_name.clone();
                let symbol_name = self.modules[modu]
                    .sym_strings
                    .get(caller.st_name)
                    .to_string();
                let source_flags = self.modules[modu].section_headers[sect].sh_flags;

                match r_type & R_FORW_RELTYPEMASK {
                    R_FORW_ABS => {
                        if target_sym.st_type != STT_CONSTANT && target_sym.st_type != 0 {
                            // an absolute address patched at load time
                            r_type |= R_FORW_LOADTIME;
                            self.out.file_header.e_flags |=
                                EF_RELOCATE | EF_POSITION_DEPENDENT;
                            value = target_addr as i64;
                        }
                    }
                    R_FORW_SELFREL => {
                        value = target_addr.wrapping_sub(source_addr) as i64;
                        if (source_flags ^ target_sym.st_other as u64) & SHF_BASEPOINTER != 0 {
                            self.error(LinkError::DifferentBase {
                                module: module_name.clone(),
                                symbol: symbol_name.clone(),
                            });
                        }
                    }
                    R_FORW_IP_BASE => {
                        value = target_addr.wrapping_sub(self.ip_base) as i64;
                        if target_sym.st_other & STV_IP == 0 {
                            self.error(LinkError::DifferentBase {
                                module: module_name.clone(),
                                symbol: symbol_name.clone(),
                            });
                        }
                    }
                    R_FORW_DATAP => {
                        value = target_addr.wrapping_sub(self.datap_base) as i64;
                        if target_sym.st_other & STV_DATAP == 0 {
                            self.error(LinkError::DifferentBase {
                                module: module_name.clone(),
                                symbol: symbol_name.clone(),
                            });
                        }
                    }
                    R_FORW_THREADP => {
                        value = target_addr.wrapping_sub(self.threadp_base) as i64;
                        if target_sym.st_other & STV_THREADP == 0 {
                            self.error(LinkError::DifferentBase {
                                module: module_name.clone(),
                                symbol: symbol_name.clone(),
                            });
                        }
                    }
                    R_FORW_REFP => {
                        let domains_differ = match &ref_sym {
                            Some(rs) => {
                                (target_sym.st_other ^ rs.st_other) & STV_BASEPOINTER as u32
                                    != 0
                            }
                            None => true,
                        };
                        if domains_differ {
                            self.error(LinkError::DifferentBase {
                                module: module_name.clone(),
                                symbol: symbol_name.clone(),
                            });
                        }
                    }
                    R_FORW_SYSFUNC | R_FORW_SYSMODUL | R_FORW_SYSCALL => {
                        // system ids are assigned by the loader
                        r_type |= R_FORW_LOADTIME;
                        self.out.file_header.e_flags |= EF_RELOCATE;
                        value = 0;
                    }
                    _ => {}
                }

                // addend, then scale with a divisibility check
                value = value.wrapping_add(reloc.r_addend as i64);
                let scale = r_type & R_FORW_RELSCALEMASK;
                if value & ((1 << scale) - 1) != 0 {
                    self.error(LinkError::MisalignedTarget {
                        module: module_name.clone(),
                        symbol: symbol_name.clone(),
                    });
                }
                value >>= scale;

                // write the bytes, checking the size class
                let data = &mut self.modules[modu].data;
                let mut overflow = false;
                match r_type & R_FORW_RELSIZEMASK {
                    R_FORW_8 => {
                        data[source_pos] = value as u8;
                        overflow = value > 0x7F || value < -0x80;
                    }
                    R_FORW_16 => {
                        Endian::write_i16(&mut data[source_pos..], value as i16);
                        overflow = value > 0x7FFF || value < -0x8000;
                    }
                    R_FORW_24 => {
                        Endian::write_i16(&mut data[source_pos..], value as i16);
                        data[source_pos + 2] = (value >> 16) as u8;
                        overflow = value > 0x7F_FFFF || value < -0x80_0000;
                    }
                    R_FORW_32 => {
                        Endian::write_i32(&mut data[source_pos..], value as i32);
                        overflow = value > 0x7FFF_FFFF || value < -0x8000_0000;
                    }
                    R_FORW_32LO => {
                        Endian::write_i16(&mut data[source_pos..], value as i16);
                        overflow = value > 0x7FFF_FFFF || value < -0x8000_0000;
                    }
                    R_FORW_32HI => {
                        Endian::write_i16(&mut data[source_pos..], (value >> 16) as i16);
                        overflow = value > 0x7FFF_FFFF || value < -0x8000_0000;
                    }
                    R_FORW_64 => {
                        Endian::write_i64(&mut data[source_pos..], value);
                    }
                    R_FORW_64LO => {
                        Endian::write_i32(&mut data[source_pos..], value as i32);
                    }
                    R_FORW_64HI => {
                        Endian::write_i32(&mut data[source_pos..], (value >> 32) as i32);
                    }
                    _ => {}
                }
                if overflow {
                    self.error(LinkError::Overflow {
                        module: module_name,
                        symbol: symbol_name,
                    });
                }

                // keep the record for relinkable or load-time references
                if self.relinkable {
                    if target_sym.st_section == 0 && target_sym.st_bind & STB_WEAK != 0 {
                        relink = true;
                    }
                    if target_sym.st_other & STV_AUTOGEN != 0 {
                        relink = true;
                    }
                }
                if relink || r_type & R_FORW_LOADTIME != 0 {
                    let mut kept = reloc;
                    kept.r_type = r_type;
                    self.kept_relocations
                        .push((modu as u32, target_module, kept));
                }
            }
        }
    }

    /// Build the executable container from the laid-out sections.
    pub(crate) fn make_output(&mut self) {
        let mut dummy_buffer: Vec<u8> = Vec::new();
        let mut dummy_strings = StringBuffer::new();
        let mut event_bytes: Vec<u8> = Vec::new();
        for ev in &self.event_data {
            ev.write(&mut event_bytes);
        }

        // map (module, input section) -> output section index
        for s in 0..self.sections.len() {
            let section = self.sections[s].clone();
            if section.order >= 0x0800_0000 && section.sh_type != SHT_LIST {
                continue; // symbol and string tables are rebuilt by join
            }
            let module = section.module;
            let out_index;
            if module < MODULE_DUMMY_CONST {
                let m = &self.modules[module as usize];
                let mut header = m.section_headers[section.sectioni as usize];
                header.sh_flags = section.sh_flags;
                header.sh_addr = section.addr;
                header.sh_module = self.out.sh_strings.add(&m.module_name);
                if m.library != 0 && m.library != LIBRARY_SPECIAL {
                    let lib_name = self.libraries[(m.library - 1) as usize].name.clone();
                    header.sh_library = self.out.sh_strings.add(&lib_name);
                }
                let names = &m.sh_strings;
                out_index = self.out.add_section(&header, names, &m.data);
                self.out.section_headers[out_index as usize].sh_module = header.sh_module;
                self.out.section_headers[out_index as usize].sh_library = header.sh_library;
            } else {
                // autogenerated sections
                let name_offset = dummy_strings.add(&section.name);
                let data_start = dummy_buffer.len();
                match module {
                    MODULE_EVENT_TABLE => dummy_buffer.extend_from_slice(&event_bytes),
                    MODULE_DUMMY_FUNC => {
                        for w in dummy_function_body().iter() {
                            dummy_buffer.extend_from_slice(&w.to_le_bytes());
                        }
                    }
                    _ => {
                        dummy_buffer
                            .extend(std::iter::repeat(0).take(section.sh_size as usize));
                    }
                }
                let header = SectionHeader {
                    sh_name: name_offset,
                    sh_type: section.sh_type,
                    sh_flags: section.sh_flags,
                    sh_addr: section.addr,
                    sh_offset: data_start as u64,
                    sh_size: (dummy_buffer.len() - data_start) as u64,
                    sh_align: section.sh_align,
                    ..SectionHeader::default()
                };
                out_index = self.out.add_section(&header, &dummy_strings, &dummy_buffer);
            }
            self.section_output_index
                .push((module, section.sectioni, out_index));
        }

        // rewrite the program header section coverage to output indexes
        for ph in &mut self.out.program_headers {
            let first = ph.p_paddr as u32;
            let count = (ph.p_paddr >> 32) as u32;
            let mut out_first = 0u32;
            let mut n = 0u32;
            for sec in first..first + count {
                let s = &self.sections[sec as usize];
                if let Some(&(_, _, oi)) = self
                    .section_output_index
                    .iter()
                    .find(|&&(m, si, _)| m == s.module && si == s.sectioni)
                {
                    if n == 0 {
                        out_first = oi;
                    }
                    n += 1;
                }
            }
            ph.p_paddr = out_first as u64 | (n as u64) << 32;
        }

        // copy symbols needed in the executable: exported symbols, symbols
        // used by kept relocations, and the automatic symbols
        let mut symbol_map: Vec<((u32, u32), u32)> = Vec::new(); // (module, symindex) -> out
        let specials = [
            ("__ip_base", self.ip_base, STV_IP),
            ("__datap_base", self.datap_base, STV_DATAP),
            ("__threadp_base", self.threadp_base, STV_THREADP),
            ("__event_table", self.event_table, STV_IP),
            ("__event_table_num", self.event_table_num as u64, 0),
            ("__entry_point", self.entry_point, STV_IP | STV_EXEC),
        ];
        let mut names = StringBuffer::new();
        for (name, value, other) in &specials {
            let n = names.add(name);
            let sym = Symbol {
                st_name: n,
                st_type: STT_CONSTANT,
                st_bind: STB_GLOBAL,
                st_other: *other | STV_AUTOGEN,
                st_value: *value,
                ..Symbol::default()
            };
            self.out.add_symbol(&sym, &names);
        }
        for (modu, target_module, kept) in &self.kept_relocations {
            for (module, symindex) in &[(*modu, kept.r_sym), (*target_module, kept.r_refsym)] {
                if *symindex == 0 {
                    continue;
                }
                if symbol_map
                    .iter()
                    .any(|&((m, s), _)| m == *module && s == *symindex)
                {
                    continue;
                }
                let m = &self.modules[*module as usize];
                let mut sym = m.symbols[*symindex as usize];
                // translate the section reference to the output file
                if sym.st_section != 0 {
                    if let Some(&(_, _, oi)) = self
                        .section_output_index
                        .iter()
                        .find(|&&(mm, si, _)| mm == *module && si == sym.st_section)
                    {
                        sym.st_section = oi;
                    }
                }
                let new_index = self.out.add_symbol(&sym, &m.sym_strings);
                symbol_map.push(((*module, *symindex), new_index));
            }
        }

        // relocation records, load-time first
        let mut kept = std::mem::replace(&mut self.kept_relocations, Vec::new());
        kept.sort_by_key(|(_, _, r)| r.r_type & R_FORW_LOADTIME == 0);
        for (modu, target_module, mut rel) in kept {
            if let Some(&((_, _), new)) = symbol_map
                .iter()
                .find(|&&((m, s), _)| m == modu && s == rel.r_sym)
            {
                rel.r_sym = new;
            }
            if rel.r_refsym != 0 {
                if let Some(&((_, _), new)) = symbol_map
                    .iter()
                    .find(|&&((m, s), _)| m == target_module && s == rel.r_refsym)
                {
                    rel.r_refsym = new;
                }
            }
            // the section index in the executable file
            if let Some(&(_, _, oi)) = self
                .section_output_index
                .iter()
                .find(|&&(m, si, _)| m == modu && si == rel.r_section)
            {
                rel.r_section = oi;
            }
            self.out.add_relocation(&rel);
        }

        // file header
        self.out.file_header.e_entry = self.entry_point;
        self.out.file_header.e_ip_base = self.ip_base;
        self.out.file_header.e_datap_base = self.datap_base;
        self.out.file_header.e_threadp_base = self.threadp_base;
        if self.relinkable {
            self.out.file_header.e_flags |= EF_RELINKABLE;
        }
    }
}
