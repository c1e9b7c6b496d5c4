//! Section order, program headers, address assignment and base pointer
//! placement.
//!
//! Sections are given a 32-bit order key layered so that all ip-addressed
//! read-only sections come before the executable ones, data before bss for
//! each of datap and threadp, and relinkable material groups together. Bit 0
//! of the key flips exactly where a base pointer belongs: everything below
//! the pointer has an even key, everything at or above it an odd key.

use crate::error::LinkError;
use crate::front::*;
use crate::Linker;
use fcpu::constants::MEMORY_MAP_ALIGN;
use felf::elf::*;

/// Extra space left after readable data so that reads past the end of an
/// array stay inside mapped memory.
const DATA_EXTRA_SPACE: u64 = 8;

fn section_order(sh_type: u32, flags: u64) -> u32 {
    if flags & SHF_ALLOC == 0 || !section_type_allocated(sh_type) || sh_type == SHT_LIST {
        // relocations, symbols, strings, unsorted event lists
        return match sh_type {
            SHT_RELA => 0x0811_0000,
            SHT_SYMTAB => 0x0812_0000,
            SHT_STRTAB => 0x0813_0000,
            _ => 0x0816_0000,
        };
    }
    if flags & SHF_IP != 0 {
        if flags & SHF_EVENT_HND != 0 {
            0x0210_1002
        } else if flags & SHF_EXCEPTION_HND != 0 {
            0x0220_2002
        } else if flags & SHF_DEBUG_INFO != 0 {
            0x0230_3002
        } else if flags & SHF_COMMENT != 0 {
            0x0240_4002
        } else if flags & SHF_WRITE != 0 {
            0x0250_0002
        } else if flags & SHF_EXEC == 0 {
            // read-only const, below the ip base
            if flags & SHF_AUTOGEN != 0 {
                0x0260_1002
            } else if flags & SHF_RELINK != 0 {
                0x0260_2002
            } else if flags & SHF_FIXED == 0 {
                0x0260_3002
            } else {
                0x0260_4002
            }
        } else {
            // executable, at or above the ip base: odd key
            if flags & SHF_AUTOGEN != 0 {
                0x0270_4003
            } else if flags & SHF_FIXED != 0 {
                0x0270_1003
            } else if flags & SHF_RELINK == 0 {
                0x0270_2003
            } else {
                0x0270_3003
            }
        }
    } else if flags & (SHF_DATAP | SHF_THREADP) != 0 {
        let mut order = if flags & SHF_THREADP != 0 {
            0x02A0_0006
        } else {
            0x0280_0004
        };
        if sh_type != SHT_NOBITS {
            // data, below the base pointer
            order |= if flags & SHF_RELINK != 0 {
                0x1000
            } else if flags & SHF_FIXED == 0 {
                0x2000
            } else {
                0x3000
            };
        } else {
            // bss, at or above the base pointer: odd key
            order |= 1;
            order |= if flags & SHF_AUTOGEN != 0 {
                0x9000
            } else if flags & SHF_FIXED != 0 {
                0x6000
            } else if flags & SHF_RELINK == 0 {
                0x7000
            } else {
                0x8000
            };
        }
        order
    } else {
        0x0200_0000
    }
}

impl Linker {
    /// Assign order keys and sort.
    pub(crate) fn sort_sections(&mut self) {
        for s in &mut self.sections {
            s.order = section_order(s.sh_type, s.sh_flags);
        }
        self.sections.sort_by_key(|s| s.order);
    }

    /// Group adjacent sections into program headers, assign addresses and
    /// place the base pointers.
    pub(crate) fn make_program_headers(&mut self) {
        self.ip_base = 0;
        self.datap_base = 0;
        self.threadp_base = 0;
        self.event_table = 0;
        self.event_table_num = 0;

        // group sections into headers; p_paddr carries (first, count)
        let mut headers: Vec<ProgramHeader> = Vec::new();
        let mut last_order = 0u32;
        let mut last_flags = 0u64;
        let mut max_align = 0u32;
        let mut current: Option<ProgramHeader> = None;
        for (sec, s) in self.sections.iter().enumerate() {
            if s.order == 0 || s.order >= 0x0800_0000 {
                continue; // not loaded
            }
            if s.order & 0xF0_0000 != last_order & 0xF0_0000 || current.is_none() {
                if let Some(mut ph) = current.take() {
                    if max_align > ph.p_align {
                        ph.p_align = max_align;
                    }
                    headers.push(ph);
                }
                let mut ph = ProgramHeader {
                    p_type: PT_LOAD,
                    p_flags: (s.sh_flags & 0xFFFF_FFFF) as u32,
                    p_paddr: sec as u64,
                    p_align: 0,
                    ..ProgramHeader::default()
                };
                max_align = s.sh_align;
                if s.order >> 1 != last_order >> 1 {
                    // a new pointer base must start on a map boundary
                    max_align = MEMORY_MAP_ALIGN as u32;
                } else if (s.sh_flags ^ last_flags) & SHF_PERMISSIONS != 0 {
                    max_align = max_align.max(MEMORY_MAP_ALIGN as u32);
                }
                ph.p_align = 0;
                current = Some(ph);
            }
            last_order = s.order;
            last_flags = s.sh_flags;
            max_align = max_align.max(s.sh_align);
            if let Some(ph) = current.as_mut() {
                ph.p_paddr += 1 << 32;
            }
        }
        if let Some(mut ph) = current.take() {
            if max_align > ph.p_align {
                ph.p_align = max_align;
            }
            headers.push(ph);
        }

        // assign addresses within each header
        let mut offset: u64 = 0;
        let mut last_flags = 0u32;
        let mut base_assigned = false;
        for ph_ix in 0..headers.len() {
            let first = headers[ph_ix].p_paddr as u32 as usize;
            let count = (headers[ph_ix].p_paddr >> 32) as usize;
            let flags = headers[ph_ix].p_flags;
            if (flags ^ last_flags) & (SHF_BASEPOINTER as u32) != 0 {
                // a new pointer domain starts on its own map page; addresses
                // keep growing so the whole image loads as one flat memory
                base_assigned = false;
            }
            let align = 1u64 << headers[ph_ix].p_align.max(2);
            offset = (offset + align - 1) & !(align - 1);
            headers[ph_ix].p_vaddr = offset;

            if flags & (SHF_EVENT_HND as u32) != 0 && last_flags & (SHF_EVENT_HND as u32) == 0 {
                self.event_table = offset;
                self.event_table_num =
                    (self.sections[first].sh_size / EVENT_SIZE as u64) as u32;
            }

            for sec in first..first + count {
                let fixed = self.relinking && self.sections[sec].sh_flags & SHF_FIXED != 0;
                if fixed && base_assigned {
                    // a fixed section keeps its address relative to its base
                    let base = self.base_for(flags);
                    let want = self.sections[sec].addr_in_input(&self.modules) + base;
                    if want < offset {
                        self.error(LinkError::LayoutImpossible(
                            self.sections[sec].name.clone(),
                        ));
                        return;
                    }
                    offset = want;
                } else {
                    let a = 1u64 << self.sections[sec].sh_align.max(2);
                    offset = (offset + a - 1) & !(a - 1);
                }
                if !base_assigned {
                    let map_align = 1u64 << MEMORY_MAP_ALIGN;
                    if fixed {
                        // the base pointer sits where the input file put it
                        let input_addr = self.sections[sec].addr_in_input(&self.modules);
                        if offset < input_addr {
                            self.error(LinkError::LayoutImpossible(
                                self.sections[sec].name.clone(),
                            ));
                            return;
                        }
                        self.set_base_for(flags, offset - input_addr);
                        base_assigned = true;
                    } else if self.sections[sec].order & 1 != 0 {
                        // the boundary from const to code, or data to bss
                        offset = (offset + map_align - 1) & !(map_align - 1);
                        self.set_base_for(flags, offset);
                        base_assigned = true;
                    } else if sec + 1 >= self.sections.len()
                        || (self.sections[sec + 1].order as u8) >> 1
                            != (self.sections[sec].order as u8) >> 1
                    {
                        // the last section under this base pointer
                        offset = (offset + map_align - 1) & !(map_align - 1);
                        self.set_base_for(flags, offset);
                        base_assigned = true;
                    }
                }
                self.sections[sec].addr = offset;
                let module = self.sections[sec].module;
                if module < MODULE_DUMMY_CONST {
                    let sh = self.sections[sec].sectioni as usize;
                    self.modules[module as usize].section_headers[sh].sh_addr = offset;
                } else {
                    match module {
                        MODULE_DUMMY_CONST => self.dummy_const = offset,
                        MODULE_DUMMY_DATA => self.dummy_data = offset,
                        MODULE_DUMMY_THREAD => self.dummy_thread_data = offset,
                        MODULE_DUMMY_FUNC => self.dummy_func = offset,
                        _ => {}
                    }
                }
                offset += self.sections[sec].sh_size;
                if flags & (SHF_READ as u32) != 0
                    && ph_ix + 1 < headers.len()
                    && headers[ph_ix + 1].p_flags & (SHF_READ as u32) == 0
                {
                    offset += DATA_EXTRA_SPACE;
                }
                headers[ph_ix].p_memsz = offset - headers[ph_ix].p_vaddr;
                if self.sections[sec].sh_type != SHT_NOBITS {
                    headers[ph_ix].p_filesz = headers[ph_ix].p_memsz;
                }
            }
            last_flags = flags;
        }
        self.out.program_headers = headers;

        self.special_symbols_override();
    }

    fn base_for(&self, flags: u32) -> u64 {
        match flags as u64 & SHF_BASEPOINTER {
            SHF_IP => self.ip_base,
            SHF_DATAP => self.datap_base,
            _ => self.threadp_base,
        }
    }

    fn set_base_for(&mut self, flags: u32, value: u64) {
        match flags as u64 & SHF_BASEPOINTER {
            SHF_IP => self.ip_base = value,
            SHF_DATAP => self.datap_base = value,
            SHF_THREADP => self.threadp_base = value,
            _ => {}
        }
    }

    /// A strong user-defined symbol may override the automatic base
    /// pointers; during relinking with fixed sections that is an error
    /// because baked-in deltas may rely on the old value.
    fn special_symbols_override(&mut self) {
        let mut changed = false;
        for (name, which) in &[("__ip_base", 0u8), ("__datap_base", 1), ("__threadp_base", 2)]
        {
            if let Some(addr) = self.strong_symbol_address(name) {
                let current = match which {
                    0 => self.ip_base,
                    1 => self.datap_base,
                    _ => self.threadp_base,
                };
                if addr != current {
                    changed = true;
                }
                match which {
                    0 => self.ip_base = addr,
                    1 => self.datap_base = addr,
                    _ => self.threadp_base = addr,
                }
            }
        }
        if self.relinking && changed && self.has_fixed_sections() {
            self.error(LinkError::RelinkBasePointerMod);
        }
        self.entry_point = self
            .strong_symbol_address("__entry_point")
            .unwrap_or(self.ip_base);
    }

    fn has_fixed_sections(&self) -> bool {
        self.sections.iter().any(|s| s.sh_flags & SHF_FIXED != 0)
    }

    /// Final address of a strong exported symbol.
    fn strong_symbol_address(&self, name: &str) -> Option<u64> {
        let e = self.find_export(name)?;
        let entry = &self.exports[e];
        if entry.st_bind & STB_WEAK != 0 || entry.library == LIBRARY_SPECIAL {
            return None;
        }
        let m = entry.module as usize;
        let sym = &self.modules[m].symbols[entry.symindex as usize];
        if sym.st_type == STT_CONSTANT {
            return Some(sym.st_value);
        }
        let sect = sym.st_section as usize;
        if sect == 0 || sect >= self.modules[m].section_headers.len() {
            return None;
        }
        Some(self.modules[m].section_headers[sect].sh_addr + sym.st_value)
    }
}

impl LinkSection {
    /// Address this section had in its input file, used to preserve fixed
    /// placements during relinking.
    fn addr_in_input(&self, modules: &[felf::Container]) -> u64 {
        if (self.module as usize) < modules.len() {
            modules[self.module as usize].section_headers[self.sectioni as usize].sh_addr
        } else {
            0
        }
    }
}
