use crate::elf::*;
use crate::error::ElfError;
use crate::strings::StringBuffer;
use fcpu::constants::FILLER_INSTRUCTION;
use util::Endian;

use byteorder::ByteOrder;

/// log2 of the alignment of raw data in the file.
const FILE_DATA_ALIGN: u32 = 2;

/// One object or executable file, split into typed arrays.
///
/// All cross references between sections, symbols and relocations are by
/// numeric index. The arrays may grow; nothing holds a reference into them
/// across a mutation.
#[derive(Default)]
pub struct Container {
    pub file_header: FileHeader,
    /// Section 0 is the mandatory empty section.
    pub section_headers: Vec<SectionHeader>,
    pub program_headers: Vec<ProgramHeader>,
    /// Symbol 0 is the mandatory empty symbol.
    pub symbols: Vec<Symbol>,
    pub relocations: Vec<Relocation>,
    /// Section names.
    pub sh_strings: StringBuffer,
    /// Symbol names.
    pub sym_strings: StringBuffer,
    /// Raw data of all sections, addressed by `sh_offset`.
    pub data: Vec<u8>,

    // linker bookkeeping
    pub module_name: String,
    pub library: u32,
    pub relinkable: bool,
}

impl Container {
    pub fn new() -> Container {
        Container {
            sh_strings: StringBuffer::new(),
            sym_strings: StringBuffer::new(),
            section_headers: vec![SectionHeader::default()],
            symbols: vec![Symbol::default()],
            ..Container::default()
        }
    }

    /// Check whether a byte buffer looks like a ForwardCom ELF file.
    pub fn has_magic(bytes: &[u8]) -> bool {
        FileHeader::read(bytes).is_some()
    }

    /// Parse a file and split it into typed arrays.
    ///
    /// Validates header integrity first; on any error the container stays
    /// empty and the error describes the first problem found.
    pub fn read(bytes: &[u8]) -> Result<Container, ElfError> {
        let header = FileHeader::read(bytes).ok_or(ElfError::FileType)?;
        let mut c = Container::new();
        c.file_header = header;

        // validate table placement
        let len = bytes.len() as u64;
        let sh_end = header.e_shoff + header.e_shnum as u64 * SECTION_HEADER_SIZE as u64;
        let ph_end = header.e_phoff + header.e_phnum as u64 * PROGRAM_HEADER_SIZE as u64;
        if (header.e_shnum != 0 && (header.e_shoff >= len || sh_end > len))
            || (header.e_phnum != 0 && (header.e_phoff >= len || ph_end > len))
        {
            return Err(ElfError::IndexRange);
        }
        if header.e_shstrndx >= header.e_shnum && header.e_shnum != 0 {
            return Err(ElfError::IndexRange);
        }

        // program headers
        for i in 0..header.e_phnum as u64 {
            let off = (header.e_phoff + i * PROGRAM_HEADER_SIZE as u64) as usize;
            let ph = ProgramHeader::read(&bytes[off..]).ok_or(ElfError::RecordSize)?;
            if ph.p_filesz != 0 && ph.p_offset + ph.p_filesz > len {
                return Err(ElfError::IndexRange);
            }
            c.program_headers.push(ph);
        }

        // raw section headers
        let mut raw_sections = Vec::new();
        for i in 0..header.e_shnum as u64 {
            let off = (header.e_shoff + i * SECTION_HEADER_SIZE as u64) as usize;
            let sh = SectionHeader::read(&bytes[off..]).ok_or(ElfError::RecordSize)?;
            if sh.sh_type != SHT_NOBITS && sh.sh_type != SHT_NULL && sh.sh_offset + sh.sh_size > len
            {
                return Err(ElfError::IndexRange);
            }
            raw_sections.push(sh);
        }

        // section name table
        let shstr = raw_sections
            .get(header.e_shstrndx as usize)
            .map(|sh| &bytes[sh.sh_offset as usize..(sh.sh_offset + sh.sh_size) as usize])
            .unwrap_or(&[]);
        let shstr_table = StringBuffer::from_bytes(shstr);
        for sh in &raw_sections {
            if sh.sh_type != SHT_NULL && sh.sh_name != 0 && sh.sh_name >= shstr_table.len() {
                return Err(ElfError::StringTable);
            }
        }

        // data sections, with index translation for symbols and relocations
        let mut index_trans = vec![0u32; raw_sections.len() + 1];
        for (i, sh) in raw_sections.iter().enumerate() {
            match sh.sh_type {
                SHT_NULL | SHT_SYMTAB | SHT_STRTAB | SHT_RELA => continue,
                _ => {}
            }
            let mut sh2 = *sh;
            sh2.sh_name = c.sh_strings.add(shstr_table.get(sh.sh_name));
            if sh.sh_type != SHT_NOBITS && sh.sh_size != 0 {
                align_to(&mut c.data, 1 << FILE_DATA_ALIGN, 0);
                let start = sh.sh_offset as usize;
                sh2.sh_offset = c.data.len() as u64;
                c.data
                    .extend_from_slice(&bytes[start..start + sh.sh_size as usize]);
            } else {
                sh2.sh_offset = c.data.len() as u64;
            }
            index_trans[i] = c.section_headers.len() as u32;
            c.section_headers.push(sh2);
        }

        // symbol tables (joined into one)
        let mut symtab_found = false;
        for sh in &raw_sections {
            if sh.sh_type != SHT_SYMTAB {
                continue;
            }
            symtab_found = true;
            if sh.sh_entsize as u64 != SYMBOL_SIZE as u64 {
                return Err(ElfError::RecordSize);
            }
            let strtab = raw_sections
                .get(sh.sh_link as usize)
                .filter(|s| s.sh_type == SHT_STRTAB)
                .ok_or(ElfError::SymtabMissing)?;
            let names = StringBuffer::from_bytes(
                &bytes[strtab.sh_offset as usize..(strtab.sh_offset + strtab.sh_size) as usize],
            );
            let count = sh.sh_size / SYMBOL_SIZE as u64;
            for i in 0..count {
                let off = (sh.sh_offset + i * SYMBOL_SIZE as u64) as usize;
                let mut sym = Symbol::read(&bytes[off..]).ok_or(ElfError::RecordSize)?;
                if sym.st_name >= names.len() && sym.st_name != 0 {
                    return Err(ElfError::StringTable);
                }
                sym.st_name = c.sym_strings.add(names.get(sym.st_name));
                if sym.st_section != 0 && sym.st_type != STT_CONSTANT {
                    if sym.st_section as usize >= index_trans.len() {
                        return Err(ElfError::IndexRange);
                    }
                    sym.st_section = index_trans[sym.st_section as usize];
                }
                if i == 0 {
                    continue; // empty symbol 0 already present
                }
                c.symbols.push(sym);
            }
        }
        if !symtab_found && header.e_type == ET_REL {
            return Err(ElfError::SymtabMissing);
        }

        // relocations
        for sh in &raw_sections {
            if sh.sh_type != SHT_RELA {
                continue;
            }
            if sh.sh_entsize as u64 != RELOCATION_SIZE as u64 {
                return Err(ElfError::RecordSize);
            }
            let count = sh.sh_size / RELOCATION_SIZE as u64;
            for i in 0..count {
                let off = (sh.sh_offset + i * RELOCATION_SIZE as u64) as usize;
                let mut rel = Relocation::read(&bytes[off..]).ok_or(ElfError::RecordSize)?;
                if rel.r_sym as usize >= c.symbols.len()
                    || (rel.r_type & R_FORW_RELTYPEMASK == R_FORW_REFP
                        && rel.r_refsym as usize >= c.symbols.len())
                {
                    return Err(ElfError::IndexRange);
                }
                if (rel.r_section as usize) < index_trans.len() {
                    rel.r_section = index_trans[rel.r_section as usize];
                }
                c.relocations.push(rel);
            }
        }
        Ok(c)
    }

    /// Add a section header and its data; returns the new section index.
    /// `strings` is the name table the header's `sh_name` refers to, `data`
    /// the buffer its `sh_offset` refers to.
    pub fn add_section(
        &mut self,
        section: &SectionHeader,
        strings: &StringBuffer,
        data: &[u8],
    ) -> u32 {
        let mut sh2 = *section;
        sh2.sh_name = self.sh_strings.add(strings.get(section.sh_name));
        align_to(&mut self.data, 1 << FILE_DATA_ALIGN, 0);
        if section.sh_type != SHT_NOBITS {
            sh2.sh_offset = self.data.len() as u64;
            let start = section.sh_offset as usize;
            self.data
                .extend_from_slice(&data[start..start + section.sh_size as usize]);
        } else {
            sh2.sh_offset = self.data.len() as u64;
        }
        self.section_headers.push(sh2);
        self.section_headers.len() as u32 - 1
    }

    /// Append more data to the most recently added section.
    pub fn extend_section(&mut self, section: &SectionHeader, data: &[u8]) {
        let last = self.section_headers.len() - 1;
        align_to(&mut self.data, 1 << FILE_DATA_ALIGN, 0);
        if section.sh_type != SHT_NOBITS {
            let start = section.sh_offset as usize;
            self.data
                .extend_from_slice(&data[start..start + section.sh_size as usize]);
            self.section_headers[last].sh_size =
                self.data.len() as u64 - self.section_headers[last].sh_offset;
        } else {
            self.section_headers[last].sh_size += section.sh_size;
        }
    }

    /// Insert alignment filler after the most recently added section.
    /// Executable sections are padded with the filler instruction.
    pub fn insert_filler(&mut self, num_bytes: u64) {
        let last = self.section_headers.len() - 1;
        let exec = self.section_headers[last].sh_flags & SHF_EXEC != 0;
        let mut n = num_bytes;
        while n >= 4 && exec {
            let mut w = [0u8; 4];
            Endian::write_u32(&mut w, FILLER_INSTRUCTION);
            self.data.extend_from_slice(&w);
            n -= 4;
        }
        self.data.extend(std::iter::repeat(0).take(n as usize));
    }

    /// Add a symbol whose name lives in `strings`; returns the new index.
    pub fn add_symbol(&mut self, symbol: &Symbol, strings: &StringBuffer) -> u32 {
        let mut sym = *symbol;
        sym.st_name = self.sym_strings.add(strings.get(symbol.st_name));
        self.symbols.push(sym);
        self.symbols.len() as u32 - 1
    }

    pub fn add_relocation(&mut self, relocation: &Relocation) {
        self.relocations.push(*relocation);
    }

    /// Serialize the container into a file image.
    ///
    /// Layout: file header, program headers (executables), section data with
    /// alignment filler, symbol table, one relocation section, `shstrtab`,
    /// `strtab`, then the section header table starting with the empty
    /// header.
    pub fn join(&mut self, file_type: u16) -> Vec<u8> {
        let mut out: Vec<u8> = Vec::new();
        let mut header = self.file_header;
        header.e_type = file_type;
        header.e_phnum = if file_type == ET_EXEC {
            self.program_headers.len() as u16
        } else {
            0
        };
        // reserve space for the file header
        header.write(&mut out);

        // program headers are fixed up after section data is placed
        let phoff = out.len() as u64;
        if file_type == ET_EXEC {
            header.e_phoff = phoff;
            for ph in &self.program_headers {
                ph.write(&mut out);
            }
        }

        let mut new_shstr = StringBuffer::new();
        let mut new_str = StringBuffer::new();
        let mut new_sections: Vec<SectionHeader> = Vec::new();

        // map from section index to (first, count) program header coverage
        let coverage: Vec<(u32, u32)> = self
            .program_headers
            .iter()
            .map(|ph| (ph.p_paddr as u32, (ph.p_paddr >> 32) as u32))
            .collect();
        let mut ph_file_start: Vec<u64> = vec![0; self.program_headers.len()];

        for sc in 1..self.section_headers.len() {
            let mut sh = self.section_headers[sc];
            if matches!(sh.sh_type, SHT_NULL | SHT_RELA | SHT_STRTAB) {
                continue;
            }
            // the program header covering this section, if any
            let ph_ix = coverage
                .iter()
                .position(|&(first, count)| sc as u32 >= first && (sc as u32) < first + count);
            if sh.sh_type != SHT_NOBITS && sh.sh_size != 0 {
                align_to(&mut out, 1 << FILE_DATA_ALIGN, 0);
                if let Some(p) = ph_ix {
                    let ph = &self.program_headers[p];
                    if ph_file_start[p] == 0 {
                        ph_file_start[p] = out.len() as u64;
                    } else {
                        // keep file offsets in step with addresses inside
                        // one segment
                        let want = ph_file_start[p] + (sh.sh_addr - ph.p_vaddr);
                        let exec = sh.sh_flags & SHF_EXEC != 0;
                        while (out.len() as u64) < want {
                            if exec && want - (out.len() as u64) >= 4 {
                                let mut w = [0u8; 4];
                                Endian::write_u32(&mut w, FILLER_INSTRUCTION);
                                out.extend_from_slice(&w);
                            } else {
                                out.push(0);
                            }
                        }
                    }
                }
                let start = sh.sh_offset as usize;
                sh.sh_offset = out.len() as u64;
                out.extend_from_slice(&self.data[start..start + sh.sh_size as usize]);
            } else {
                sh.sh_offset = out.len() as u64;
                if let Some(p) = ph_ix {
                    if ph_file_start[p] == 0 {
                        ph_file_start[p] = out.len() as u64;
                    }
                }
            }
            sh.sh_name = new_shstr.add(self.sh_strings.get(sh.sh_name));
            new_sections.push(sh);
        }
        let num_data_sections = new_sections.len() as u16;

        // fix program header file offsets and sizes
        if file_type == ET_EXEC {
            for (p, ph) in self.program_headers.iter().enumerate() {
                let mut ph2 = *ph;
                ph2.p_offset = ph_file_start[p];
                ph2.p_paddr = 0; // internal section coverage is not preserved
                let mut b = Vec::new();
                ph2.write(&mut b);
                let off = (phoff + p as u64 * PROGRAM_HEADER_SIZE as u64) as usize;
                out[off..off + PROGRAM_HEADER_SIZE as usize].copy_from_slice(&b);
            }
        }

        // symbol table
        align_to(&mut out, 1 << FILE_DATA_ALIGN, 0);
        let mut symtab = SectionHeader {
            sh_type: SHT_SYMTAB,
            sh_entsize: SYMBOL_SIZE,
            sh_align: 3,
            sh_offset: out.len() as u64,
            ..SectionHeader::default()
        };
        for sym in &self.symbols {
            let mut s = *sym;
            s.st_name = new_str.add(self.sym_strings.get(sym.st_name));
            s.write(&mut out);
        }
        symtab.sh_size = out.len() as u64 - symtab.sh_offset;
        symtab.sh_name = new_shstr.add("symtab");

        // relocation table
        let mut reltab = SectionHeader {
            sh_type: SHT_RELA,
            sh_flags: SHF_INFO_LINK,
            sh_entsize: RELOCATION_SIZE,
            sh_offset: out.len() as u64,
            ..SectionHeader::default()
        };
        for rel in &self.relocations {
            rel.write(&mut out);
        }
        reltab.sh_size = out.len() as u64 - reltab.sh_offset;
        reltab.sh_name = new_shstr.add("relocations");

        // string tables
        let mut shstrtab = SectionHeader {
            sh_type: SHT_STRTAB,
            sh_entsize: 1,
            ..SectionHeader::default()
        };
        let mut strtab = shstrtab;
        shstrtab.sh_name = new_shstr.add("shstrtab");
        strtab.sh_name = new_shstr.add("strtab");
        shstrtab.sh_offset = out.len() as u64;
        out.extend_from_slice(new_shstr.as_bytes());
        shstrtab.sh_size = out.len() as u64 - shstrtab.sh_offset;
        strtab.sh_offset = out.len() as u64;
        out.extend_from_slice(new_str.as_bytes());
        strtab.sh_size = out.len() as u64 - strtab.sh_offset;

        // section header table
        align_to(&mut out, 1 << FILE_DATA_ALIGN, 0);
        header.e_shoff = out.len() as u64;
        let symbol_section = num_data_sections + 1;
        header.e_shnum = num_data_sections + 5;
        header.e_shstrndx = symbol_section + 2;
        symtab.sh_link = (symbol_section + 3) as u32; // strtab
        reltab.sh_link = symbol_section as u32;
        SectionHeader::default().write(&mut out);
        for sh in &new_sections {
            sh.write(&mut out);
        }
        symtab.write(&mut out);
        reltab.write(&mut out);
        shstrtab.write(&mut out);
        strtab.write(&mut out);

        // final file header
        let mut hbytes = Vec::new();
        header.write(&mut hbytes);
        out[..hbytes.len()].copy_from_slice(&hbytes);
        self.file_header = header;
        out
    }

    /// Remove local symbols that are not referenced by any relocation and
    /// renumber the relocation records. Keeps everything at debug level 1+.
    pub fn remove_private_symbols(&mut self, debug_level: u32) {
        if debug_level >= 1 {
            return;
        }
        let mut used = vec![false; self.symbols.len()];
        used[0] = true;
        for rel in &self.relocations {
            used[rel.r_sym as usize] = true;
            if rel.r_type & R_FORW_RELTYPEMASK == R_FORW_REFP {
                used[rel.r_refsym as usize] = true;
            }
        }
        let mut old2new = vec![0u32; self.symbols.len()];
        let mut kept = Vec::with_capacity(self.symbols.len());
        for (i, sym) in self.symbols.iter().enumerate() {
            let keep = used[i] || sym.st_bind != STB_LOCAL || sym.st_type == STT_SECTION;
            if keep {
                old2new[i] = kept.len() as u32;
                kept.push(*sym);
            }
        }
        self.symbols = kept;
        for rel in &mut self.relocations {
            rel.r_sym = old2new[rel.r_sym as usize];
            if rel.r_type & R_FORW_RELTYPEMASK == R_FORW_REFP {
                rel.r_refsym = old2new[rel.r_refsym as usize];
            }
        }
    }

    /// Sort symbols by `(section, address)` and relocations by
    /// `(section, offset)`, rewriting all relocation symbol indexes through
    /// the sort permutation. The old index of each symbol is parked in
    /// `st_reguse1` while sorting; `st_reguse2` is cleared for later use.
    ///
    /// For executable files, symbol addresses are first translated from
    /// `section:offset` form to a pointer-base domain: section 1 = ip,
    /// 2 = datap, 3 = threadp.
    pub fn sort_symbols_and_relocations(&mut self, executable: bool) {
        for (i, sym) in self.symbols.iter_mut().enumerate() {
            sym.st_reguse1 = i as u32;
            sym.st_reguse2 = 0;
        }
        if executable {
            for i in 0..self.symbols.len() {
                let sec = self.symbols[i].st_section;
                if sec != 0 && (sec as usize) < self.section_headers.len() {
                    let sh = &self.section_headers[sec as usize];
                    self.symbols[i].st_section = match sh.sh_flags & SHF_BASEPOINTER {
                        SHF_IP => 1,
                        SHF_DATAP => 2,
                        SHF_THREADP => 3,
                        _ => 0,
                    };
                    self.symbols[i].st_value =
                        self.symbols[i].st_value.wrapping_add(sh.sh_addr);
                }
            }
        }
        self.symbols
            .sort_by_key(|s| (s.st_section, s.st_value, s.st_reguse1));

        let mut old2new = vec![0u32; self.symbols.len()];
        for (new, sym) in self.symbols.iter().enumerate() {
            old2new[sym.st_reguse1 as usize] = new as u32;
        }
        for rel in &mut self.relocations {
            if (rel.r_sym as usize) < old2new.len() {
                rel.r_sym = old2new[rel.r_sym as usize];
            } else {
                rel.r_sym = 0;
            }
            if rel.r_type & R_FORW_RELTYPEMASK == R_FORW_REFP {
                if (rel.r_refsym as usize) < old2new.len() {
                    rel.r_refsym = old2new[rel.r_refsym as usize];
                } else {
                    rel.r_refsym = 0;
                }
            }
        }
        self.relocations.sort_by_key(|r| (r.r_section, r.r_offset));
    }

    /// Hex file for a loader ROM: executable sections as 32-bit words,
    /// `words_per_line` words per line with the highest address leftmost.
    pub fn make_hex_buffer(&self, words_per_line: usize) -> String {
        let mut text = String::new();
        let n = if words_per_line == 0 { 4 } else { words_per_line };
        for (i, sh) in self.section_headers.iter().enumerate() {
            if sh.sh_flags & SHF_EXEC == 0 || sh.sh_type == SHT_NOBITS || sh.sh_size == 0 {
                continue;
            }
            text.push_str(&format!("// Section {}, size {}\n", i, sh.sh_size));
            let start = sh.sh_offset as usize;
            let bytes = &self.data[start..start + sh.sh_size as usize];
            for chunk in bytes.chunks(4 * n) {
                let mut words: Vec<String> = chunk
                    .chunks(4)
                    .map(|w| {
                        let mut v = [0u8; 4];
                        v[..w.len()].copy_from_slice(w);
                        format!("{:08X}", Endian::read_u32(&v))
                    })
                    .collect();
                words.reverse();
                text.push_str(&words.join(""));
                text.push('\n');
            }
        }
        text
    }
}

/// Pad a buffer to a multiple of `align` with `fill` bytes.
pub fn align_to(buf: &mut Vec<u8>, align: usize, fill: u8) {
    while buf.len() % align != 0 {
        buf.push(fill);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_container() -> Container {
        let mut c = Container::new();
        let mut strings = StringBuffer::new();
        let name = strings.add("code");
        let data: Vec<u8> = (0u8..16).collect();
        let sh = SectionHeader {
            sh_name: name,
            sh_type: SHT_PROGBITS,
            sh_flags: SHF_EXEC | SHF_READ | SHF_ALLOC | SHF_IP,
            sh_size: 16,
            sh_align: 2,
            ..SectionHeader::default()
        };
        let sec = c.add_section(&sh, &strings, &data);

        let dname = strings.add("data");
        let dh = SectionHeader {
            sh_name: dname,
            sh_type: SHT_PROGBITS,
            sh_flags: SHF_READ | SHF_WRITE | SHF_ALLOC | SHF_DATAP,
            sh_size: 8,
            sh_align: 3,
            ..SectionHeader::default()
        };
        c.add_section(&dh, &strings, &[1, 2, 3, 4, 5, 6, 7, 8]);

        let mut syms = StringBuffer::new();
        let sname = syms.add("start");
        c.add_symbol(
            &Symbol {
                st_name: sname,
                st_type: STT_FUNC,
                st_bind: STB_GLOBAL,
                st_other: STV_IP | STV_EXEC,
                st_section: sec,
                st_value: 0,
                ..Symbol::default()
            },
            &syms,
        );
        c.add_relocation(&Relocation {
            r_section: sec,
            r_offset: 4,
            r_type: R_FORW_SELFREL | R_FORW_24 | R_FORW_SCALE4,
            r_sym: 1,
            r_refsym: 0,
            r_addend: -4,
        });
        c
    }

    #[test]
    fn join_and_read_round_trip() {
        let mut c = sample_container();
        let bytes = c.join(ET_REL);
        let c2 = Container::read(&bytes).unwrap();
        assert_eq!(c2.section_headers.len(), 3); // null + code + data
        assert_eq!(c2.sh_strings.get(c2.section_headers[1].sh_name), "code");
        assert_eq!(c2.symbols.len(), 2);
        assert_eq!(c2.sym_strings.get(c2.symbols[1].st_name), "start");
        assert_eq!(c2.relocations.len(), 1);
        assert_eq!(c2.relocations[0].r_addend, -4);
        let off = c2.section_headers[1].sh_offset as usize;
        assert_eq!(&c2.data[off..off + 4], &[0, 1, 2, 3]);
    }

    #[test]
    fn truncated_file_is_rejected() {
        let mut c = sample_container();
        let bytes = c.join(ET_REL);
        assert!(Container::read(&bytes[..40]).is_err());
        let mut bad = bytes.clone();
        // destroy the section header offset
        let mut h = FileHeader::read(&bad).unwrap();
        h.e_shoff = bad.len() as u64 + 100;
        let mut hb = Vec::new();
        h.write(&mut hb);
        bad[..hb.len()].copy_from_slice(&hb);
        assert!(matches!(Container::read(&bad), Err(ElfError::IndexRange)));
    }

    #[test]
    fn extend_and_fill_sections() {
        let mut c = Container::new();
        let mut strings = StringBuffer::new();
        let name = strings.add("code");
        let sh = SectionHeader {
            sh_name: name,
            sh_type: SHT_PROGBITS,
            sh_flags: SHF_EXEC,
            sh_size: 4,
            ..SectionHeader::default()
        };
        let sec = c.add_section(&sh, &strings, &[1, 2, 3, 4]);
        // executable filler is whole filler instructions
        c.insert_filler(8);
        let mut more = sh;
        more.sh_offset = 0;
        c.extend_section(&more, &[5, 6, 7, 8]);
        assert_eq!(c.section_headers[sec as usize].sh_size, 16);
        let off = c.section_headers[sec as usize].sh_offset as usize;
        assert_eq!(&c.data[off..off + 4], &[1, 2, 3, 4]);
        assert_eq!(
            u32::from_le_bytes([c.data[off + 4], c.data[off + 5], c.data[off + 6], c.data[off + 7]]),
            FILLER_INSTRUCTION
        );
        assert_eq!(&c.data[off + 12..off + 16], &[5, 6, 7, 8]);
    }

    #[test]
    fn symbol_sort_permutes_relocations() {
        let mut c = Container::new();
        let mut syms = StringBuffer::new();
        let n1 = syms.add("late");
        let n2 = syms.add("early");
        // two symbols in reverse address order
        c.add_symbol(
            &Symbol {
                st_name: n1,
                st_section: 1,
                st_value: 0x100,
                ..Symbol::default()
            },
            &syms,
        );
        c.add_symbol(
            &Symbol {
                st_name: n2,
                st_section: 1,
                st_value: 0x10,
                ..Symbol::default()
            },
            &syms,
        );
        c.add_relocation(&Relocation {
            r_section: 1,
            r_offset: 8,
            r_type: R_FORW_SELFREL | R_FORW_32,
            r_sym: 1, // "late"
            ..Relocation::default()
        });
        c.sort_symbols_and_relocations(false);
        let r = c.relocations[0];
        assert_eq!(c.sym_strings.get(c.symbols[r.r_sym as usize].st_name), "late");
        assert_eq!(c.symbols[r.r_sym as usize].st_value, 0x100);
        // symbols now in address order
        assert!(c.symbols[1].st_value <= c.symbols[2].st_value);
    }

    #[test]
    fn hex_buffer_format() {
        let mut c = Container::new();
        let mut strings = StringBuffer::new();
        let name = strings.add("code");
        let sh = SectionHeader {
            sh_name: name,
            sh_type: SHT_PROGBITS,
            sh_flags: SHF_EXEC,
            sh_size: 8,
            ..SectionHeader::default()
        };
        c.add_section(&sh, &strings, &[0x78, 0x56, 0x34, 0x12, 0xF0, 0xDE, 0xBC, 0x9A]);
        let hex = c.make_hex_buffer(2);
        assert!(hex.starts_with("// Section 1, size 8\n"));
        assert!(hex.contains("9ABCDEF012345678"));
    }
}
