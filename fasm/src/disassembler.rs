//! Disassembler core.
//!
//! Pass 1 sorts symbols and relocations by address, walks the code sections
//! to find jump targets, and creates labels for addresses that have none.
//! Pass 2 writes the textual listing. New symbols found during pass 1 are
//! collected in a separate table and joined afterwards, because inserting
//! into the sorted table would move indexes that pass 1 still relies on.

use fcpu::format::{self, Format, FORMAT_LIST};
use fcpu::instructions::{self, Instruction};
use fcpu::registers::{register_name, REG_R, REG_V};
use fcpu::template::Template;
use fcpu::types::{OperandType, DATA_SIZE_LOG};
use felf::elf::*;
use felf::Container;
use util::Endian;

use byteorder::ByteOrder;

pub struct Disassembler {
    pub container: Container,
    pub is_executable: bool,
    new_symbols: Vec<Symbol>,
    out: String,
}

impl Disassembler {
    pub fn new(container: Container) -> Disassembler {
        let is_executable = container.file_header.e_type == ET_EXEC;
        Disassembler {
            container,
            is_executable,
            new_symbols: Vec::new(),
            out: String::new(),
        }
    }

    /// Run both passes and return the listing text.
    pub fn go(&mut self) -> Result<String, String> {
        format::check_format_list()?;
        self.container
            .sort_symbols_and_relocations(self.is_executable);
        self.pass1();
        self.join_symbol_tables();
        self.assign_symbol_names();
        self.pass2();
        Ok(std::mem::replace(&mut self.out, String::new()))
    }

    fn section_words(&self, sc: usize) -> Vec<u32> {
        let sh = &self.container.section_headers[sc];
        let start = sh.sh_offset as usize;
        let end = start + sh.sh_size as usize;
        self.container.data[start..end]
            .chunks(4)
            .map(|c| {
                let mut w = [0u8; 4];
                w[..c.len()].copy_from_slice(c);
                Endian::read_u32(&w)
            })
            .collect()
    }

    /// Symbol domain used for sorted lookups: in executables symbols were
    /// rebased to pointer domains by the sort.
    fn code_domain(&self, sc: usize) -> (u32, u64) {
        if self.is_executable {
            (1, self.container.section_headers[sc].sh_addr)
        } else {
            (sc as u32, 0)
        }
    }

    /// Pass 1: find jump targets and make symbols for them.
    fn pass1(&mut self) {
        for sc in 1..self.container.section_headers.len() {
            let sh = self.container.section_headers[sc];
            if sh.sh_flags & SHF_EXEC == 0 || sh.sh_type == SHT_NOBITS {
                continue;
            }
            let words = self.section_words(sc);
            let (domain, base) = self.code_domain(sc);
            let mut i = 0usize;
            while i < words.len() {
                let t = Template::from_words(&words[i..]);
                let length = if t.il() == 0 { 1 } else { t.il() } as usize;
                if let Some(fx) = format::lookup_format(&t) {
                    let f = &FORMAT_LIST[fx];
                    if f.jump_size != 0 && f.category == 4 {
                        // a direct jump: compute its target address
                        let offset = if f.tmpl == 0xD {
                            t.im2d() as i64
                        } else {
                            t.read_bytes_signed(f.jump_pos as u32, f.jump_size as u32)
                        };
                        // skip targets covered by a relocation at this site
                        let reloc_here = self.container.relocations.iter().any(|r| {
                            r.r_section == sc as u32
                                && r.r_offset == (i * 4) as u64 + f.jump_pos as u64
                        });
                        if !reloc_here {
                            let target =
                                base as i64 + (i + length) as i64 * 4 + offset * 4;
                            self.add_target_symbol(domain, target as u64);
                        }
                    }
                }
                i += length;
            }
        }
    }

    /// Create a label symbol for a jump target unless one exists.
    fn add_target_symbol(&mut self, section: u32, value: u64) {
        let exists = self
            .container
            .symbols
            .iter()
            .chain(self.new_symbols.iter())
            .any(|s| s.st_section == section && s.st_value == value);
        if !exists {
            self.new_symbols.push(Symbol {
                st_section: section,
                st_value: value,
                st_type: STT_FUNC,
                st_bind: STB_LOCAL,
                ..Symbol::default()
            });
        }
    }

    /// Join the new symbols into the sorted table, keeping the relocation
    /// indexes valid through the permutation.
    fn join_symbol_tables(&mut self) {
        if self.new_symbols.is_empty() {
            return;
        }
        for sym in self.new_symbols.drain(..) {
            self.container.symbols.push(sym);
        }
        self.container
            .sort_symbols_and_relocations(false);
    }

    /// Make `@_NNN` names for symbols that have none.
    fn assign_symbol_names(&mut self) {
        let mut unnamed = 0u32;
        for i in 1..self.container.symbols.len() {
            if self.container.symbols[i].st_name == 0 {
                unnamed += 1;
                let name = format!("@_{:03}", unnamed);
                self.container.symbols[i].st_name =
                    self.container.sym_strings.add(&name);
            }
        }
    }

    fn symbol_at(&self, section: u32, value: u64) -> Option<usize> {
        self.container
            .symbols
            .iter()
            .position(|s| s.st_section == section && s.st_value == value && s.st_name != 0)
    }

    fn symbol_name(&self, index: usize) -> &str {
        self.container
            .sym_strings
            .get(self.container.symbols[index].st_name)
    }

    /// Pass 2: write the listing.
    fn pass2(&mut self) {
        self.out.push_str("// Disassembly\n");
        for sc in 1..self.container.section_headers.len() {
            let sh = self.container.section_headers[sc];
            if sh.sh_type == SHT_NOBITS && sh.sh_size == 0 {
                continue;
            }
            let name = self.container.sh_strings.get(sh.sh_name).to_string();
            self.out.push_str(&format!("\n{} section", name));
            if sh.sh_flags & SHF_READ != 0 {
                self.out.push_str(" read");
            }
            if sh.sh_flags & SHF_WRITE != 0 {
                self.out.push_str(" write");
            }
            if sh.sh_flags & SHF_EXEC != 0 {
                self.out.push_str(" execute");
            }
            if sh.sh_flags & SHF_THREADP != 0 {
                self.out.push_str(" threadp");
            } else if sh.sh_flags & SHF_DATAP != 0 {
                self.out.push_str(" datap");
            }
            self.out.push('\n');
            if sh.sh_flags & SHF_EXEC != 0 && sh.sh_type != SHT_NOBITS {
                self.write_code_section(sc);
            } else {
                self.write_data_section(sc);
            }
            self.out.push_str(&format!("{} end\n", name));
        }
    }

    fn write_label(&mut self, domain: u32, addr: u64) {
        if let Some(symi) = self.symbol_at(domain, addr) {
            let name = self.symbol_name(symi).to_string();
            self.out.push_str(&format!("{}:\n", name));
        }
    }

    fn write_code_section(&mut self, sc: usize) {
        let words = self.section_words(sc);
        let (domain, base) = self.code_domain(sc);
        let mut i = 0usize;
        while i < words.len() {
            self.write_label(domain, base + (i * 4) as u64);
            let t = Template::from_words(&words[i..]);
            let length = if t.il() == 0 { 1 } else { t.il() } as usize;
            match format::lookup_format(&t) {
                Some(fx) => {
                    let f = &FORMAT_LIST[fx];
                    let text = self.write_instruction(&t, f, sc, i, length, domain, base);
                    self.out.push_str("  ");
                    self.out.push_str(&text);
                    self.out.push('\n');
                }
                None => {
                    self.out
                        .push_str(&format!("  // unknown instruction {:08X}\n", t.w[0]));
                }
            }
            i += length;
        }
    }

    fn write_data_section(&mut self, sc: usize) {
        let sh = self.container.section_headers[sc];
        if sh.sh_type == SHT_NOBITS {
            self.out
                .push_str(&format!("  int8 uninitialized size {}\n", sh.sh_size));
            return;
        }
        let (domain, base) = self.code_domain(sc);
        let start = sh.sh_offset as usize;
        let bytes: Vec<u8> =
            self.container.data[start..start + sh.sh_size as usize].to_vec();
        for (off, chunk) in bytes.chunks(8).enumerate() {
            self.write_label(domain, base + off as u64 * 8);
            let words: Vec<String> = chunk.iter().map(|b| format!("{:#04X}", b)).collect();
            self.out
                .push_str(&format!("  int8 {}\n", words.join(", ")));
        }
    }

    /// Decode and print one instruction.
    #[allow(clippy::too_many_arguments)]
    fn write_instruction(
        &self,
        t: &Template,
        f: &'static Format,
        sc: usize,
        word_index: usize,
        length: usize,
        domain: u32,
        base: u64,
    ) -> String {
        let op1 = if f.tmpl == 0xD {
            // template D has no operation code field; the subformat selects
            // between jump and call
            if f.format2 & 7 == 0 {
                instructions::OPJ_JUMP
            } else {
                instructions::OPJ_CALL
            }
        } else {
            t.op1()
        };
        let ins: Option<&'static Instruction> =
            instructions::instruction_by_op(f.category, f.format2, op1 as u8);
        let ins = match ins {
            Some(i) => i,
            None => return format!("// unknown operation {:08X}", t.w[0]),
        };

        let ot = match f.ot {
            format::OT_FIELD => t.ot(),
            format::OT_INT_PARITY => 2 + (op1 & 1),
            format::OT_FLOAT_PARITY => 5 + (op1 & 1),
            fixed => (fixed & 7) as u32,
        } as usize
            & 7;
        let vect = f.vect & format::VECT_REGS != 0;
        let regclass = if vect { REG_V } else { REG_R };

        let mut text = String::new();
        text.push_str(OperandType::from_index(ot as u32).unwrap().name());
        text.push(' ');

        if ins.id == instructions::II_STORE {
            // a store reads better as an assignment to memory
            text.push_str(&self.memory_operand_text(t, f, ot));
            text.push_str(" = ");
            if f.imm_size != 0 {
                let v = t.read_bytes_signed(f.imm_pos as u32, f.imm_size as u32);
                text.push_str(&format!("{}", v));
            } else {
                text.push_str(&register_name(regclass | t.rd() as u8));
            }
            return text;
        }

        // destination register
        if f.op_avail & format::OPA_RD != 0 && f.category != 4 && ins.id != instructions::II_NOP
        {
            text.push_str(&register_name(regclass | t.rd() as u8));
            text.push_str(" = ");
        }
        text.push_str(ins.name);

        // operand list: only the registers the instruction actually reads
        let mut reg_count = ins.source_operands as i32;
        if f.imm_size != 0 {
            reg_count -= 1;
        }
        if f.mem != 0 {
            reg_count -= 1;
        }
        let mut operands: Vec<String> = Vec::new();
        if f.category == 4 && f.op_avail & format::OPA_RD != 0 && reg_count > 0 {
            operands.push(register_name(regclass | t.rd() as u8));
            reg_count -= 1;
        }
        if f.op_avail & format::OPA_RS != 0 && f.mem == 0 && reg_count > 0 {
            operands.push(register_name(regclass | t.rs() as u8));
            reg_count -= 1;
        }
        if f.op_avail & format::OPA_RT != 0 && f.mem == 0 && f.category != 4 && reg_count > 0 {
            operands.push(register_name(regclass | t.rt() as u8));
        }
        if f.mem != 0 {
            operands.push(self.memory_operand_text(t, f, ot));
        }
        if f.imm_size != 0 {
            let v = t.read_bytes_signed(f.imm_pos as u32, f.imm_size as u32);
            operands.push(format!("{}", v));
        }
        if !operands.is_empty() {
            text.push('(');
            text.push_str(&operands.join(", "));
            text.push(')');
        }

        // jump target
        if f.jump_size != 0 && f.category == 4 {
            let offset = if f.tmpl == 0xD {
                t.im2d() as i64
            } else {
                t.read_bytes_signed(f.jump_pos as u32, f.jump_size as u32)
            };
            let reloc = self.container.relocations.iter().find(|r| {
                r.r_section == sc as u32
                    && r.r_offset == (word_index * 4) as u64 + f.jump_pos as u64
            });
            let target_text = if let Some(r) = reloc {
                let symi = r.r_sym as usize;
                if symi < self.container.symbols.len() {
                    self.symbol_name(symi).to_string()
                } else {
                    "?".to_string()
                }
            } else {
                let target = base as i64 + (word_index + length) as i64 * 4 + offset * 4;
                match self.symbol_at(domain, target as u64) {
                    Some(symi) => self.symbol_name(symi).to_string(),
                    None => format!("{}", offset * 4),
                }
            };
            if text.ends_with(')') {
                text.push_str(", ");
            } else {
                text.push(' ');
            }
            text.push_str(&target_text);
        }
        text
    }

    fn memory_operand_text(&self, t: &Template, f: &'static Format, ot: usize) -> String {
        let mut parts: Vec<String> = Vec::new();
        if f.mem & format::MEM_BASE_RS != 0 {
            parts.push(register_name(REG_R | t.rs() as u8));
        }
        if f.mem & format::MEM_INDEX_RT != 0 && t.rt() != 0x1F {
            let scale = if f.scale & format::SCALE_INDEX_OS != 0 {
                1 << DATA_SIZE_LOG[ot]
            } else if f.scale & format::SCALE_MINUS1 != 0 {
                -1i64 as i64
            } else {
                1
            };
            if scale == 1 {
                parts.push(register_name(REG_R | t.rt() as u8));
            } else if scale == -1 {
                parts.push(format!("-{}", register_name(REG_R | t.rt() as u8)));
            } else {
                parts.push(format!("{}*{}", register_name(REG_R | t.rt() as u8), scale));
            }
        }
        let mut text = format!("[{}", parts.join("+"));
        if f.addr_size != 0 && f.mem & format::MEM_OFFSET != 0 {
            let mut offset = t.read_bytes_signed(f.addr_pos as u32, f.addr_size as u32);
            if f.scale & format::SCALE_OFFSET_OS != 0 {
                offset <<= DATA_SIZE_LOG[ot];
            }
            if offset != 0 {
                text.push_str(&format!("{:+}", offset));
            }
        }
        if f.mem & format::MEM_LIMIT != 0 {
            let limit = t.read_bytes(f.addr_pos as u32, f.addr_size as u32);
            text.push_str(&format!(", limit={}", limit));
        }
        text.push(']');
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{Assembler, Options};

    fn assemble(source: &str) -> Container {
        let mut a = Assembler::new(source, &Options::default()).unwrap();
        let out = a.assemble();
        assert!(!a.errors.has_errors(), "{}", a.errors);
        out
    }

    #[test]
    fn listing_round_trip() {
        let source = "\
code section execute ip
start:
  int32 r1 = add(r2, r3)
  int32 r1 = sub_jump_nzero(r1, 1), start
  return
code end
";
        let mut c = assemble(source);
        let bytes = c.join(ET_REL);
        let read_back = Container::read(&bytes).unwrap();
        let mut dis = Disassembler::new(read_back);
        let listing = dis.go().unwrap();
        assert!(listing.contains("add"), "{}", listing);
        assert!(listing.contains("sub_jump_nzero"), "{}", listing);
        assert!(listing.contains("start"), "{}", listing);

        // the listing assembles again to the same code bytes
        let mut c2 = assemble(&listing);
        let s1 = c.section_headers[1];
        let s2 = c2.section_headers[1];
        let d1 = &c.data[s1.sh_offset as usize..(s1.sh_offset + s1.sh_size) as usize];
        let d2 = &c2.data[s2.sh_offset as usize..(s2.sh_offset + s2.sh_size) as usize];
        assert_eq!(d1, d2);
    }

    #[test]
    fn symbol_sort_contract_survives_disassembly() {
        let source = "\
code section execute ip
first:
  int32 r1 = move(7)
second:
  int32 r2 = move(8)
  jump first
code end
";
        let mut c = assemble(source);
        let bytes = c.join(ET_REL);
        let read_back = Container::read(&bytes).unwrap();
        let mut dis = Disassembler::new(read_back);
        dis.go().unwrap();
        // every relocation must point at a symbol with the same address it
        // had before the sort
        for r in &dis.container.relocations {
            assert!((r.r_sym as usize) < dis.container.symbols.len());
        }
        // symbols are in address order per section
        let syms = &dis.container.symbols;
        for w in syms.windows(2) {
            if w[0].st_section == w[1].st_section && w[0].st_section != 0 {
                assert!(w[0].st_value <= w[1].st_value);
            }
        }
    }
}
