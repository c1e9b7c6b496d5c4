//! Binary emission: convert fitted code records into encoded words, write
//! data sections, generate relocation records, and assemble the output
//! container.

use crate::assembler::{Assembler, CodeRec};
use crate::error::Code;
use crate::expression::*;
use fcpu::float16::double_to_half;
use fcpu::format::{self, Format};
use fcpu::instructions::*;
use fcpu::registers::{REG_DATAP, REG_INDEX, REG_IP, REG_THREADP};
use fcpu::template::Template;
use fcpu::types::*;
use felf::elf::*;
use felf::Container;
use util::bit_scan_reverse;

impl<'a> Assembler<'a> {
    /// Pass 5: emit all code and data and build the output file.
    pub fn pass5(&mut self) -> Container {
        self.make_binary_code();

        let mut out = Container::new();
        out.file_header.e_type = ET_REL;

        // sections
        for i in 1..self.sections.len() {
            let mut sh = self.sections[i];
            sh.sh_link = 0; // clear iteration scratch
            if sh.sh_size < self.data_buffers[i].len() as u64 {
                sh.sh_size = self.data_buffers[i].len() as u64;
            }
            out.add_section(&sh, &self.section_names, &self.data_buffers[i]);
        }

        // symbols, skipping local constants and expression aliases; the new
        // index is parked in st_unitnum for relocation renumbering
        let mut old2new = vec![0u32; self.symbols.len()];
        for i in 1..self.symbols.len() {
            let sym = self.symbols[i];
            if sym.st_type == STT_SECTION || sym.st_type >= STT_VARIABLE {
                continue;
            }
            if sym.st_type == STT_CONSTANT && sym.st_bind == STB_LOCAL {
                continue;
            }
            let mut s = sym;
            // public symbols in a communal section must be weak
            let sect = sym.st_section as usize;
            if sect != 0
                && sect < self.sections.len()
                && self.sections[sect].sh_type == SHT_COMDAT
                && s.st_bind == STB_GLOBAL
            {
                s.st_bind = STB_WEAK;
            }
            let new_index = out.add_symbol(&s, &self.sym_names);
            old2new[i] = new_index;
        }

        // relocations refer to symbols by name offset until now; translate
        // to output symbol indexes
        for r in 0..self.relocations.len() {
            let mut rel = self.relocations[r];
            if rel.r_sym != 0 {
                match self.find_symbol(rel.r_sym) {
                    Some(symi) if old2new[symi] != 0 => {
                        rel.r_sym = old2new[symi];
                        let s = &self.symbols[symi];
                        // a local reference to a weak public symbol or into
                        // a communal section makes it both import and export
                        let comdat = s.st_section != 0
                            && (s.st_section as usize) < self.sections.len()
                            && self.sections[s.st_section as usize].sh_type == SHT_COMDAT;
                        if s.st_section != 0
                            && (s.st_bind == STB_WEAK || (comdat && s.st_bind != STB_LOCAL))
                        {
                            out.symbols[rel.r_sym as usize].st_bind = STB_WEAK2;
                        }
                    }
                    _ => rel.r_sym = 0,
                }
            }
            if rel.r_refsym != 0 && rel.r_type & R_FORW_RELTYPEMASK == R_FORW_REFP {
                match self.find_symbol(rel.r_refsym) {
                    Some(symi) if old2new[symi] != 0 => {
                        rel.r_refsym = old2new[symi];
                    }
                    _ => rel.r_refsym = 0,
                }
            }
            out.add_relocation(&rel);
        }

        if self.debug == 0 {
            out.remove_private_symbols(self.debug);
        }
        out
    }

    /// Encode every code record into its section buffer.
    fn make_binary_code(&mut self) {
        for i in 0..self.code_buffer.len() {
            let code = self.code_buffer[i].clone();
            let section = code.section as usize;
            if section == 0 || section >= self.sections.len() {
                continue;
            }
            self.line_index = code.line;
            if code.instr1.is_none() {
                if code.e.instruction == II_ALIGN {
                    // alignment emitted as one- and two-word no-ops
                    let mut nops = code.size as i32;
                    let mut nop1 = Template::new();
                    nop1.set_il(1);
                    if nops & 1 != 0 {
                        self.push_words(section, &nop1.w[..1]);
                        nops -= 1;
                    }
                    let mut nop2 = Template::new();
                    nop2.set_il(2);
                    while nops >= 2 {
                        self.push_words(section, &nop2.w[..2]);
                        nops -= 2;
                    }
                }
                continue;
            }
            let words = self.encode(&code);
            self.push_words(section, &words.w[..code.size as usize]);
        }
        for i in 1..self.sections.len() {
            if self.sections[i].sh_flags & SHF_EXEC != 0 {
                self.sections[i].sh_size = self.data_buffers[i].len() as u64;
            }
        }
    }

    fn push_words(&mut self, section: usize, words: &[u32]) {
        for &w in words {
            self.data_buffers[section].extend_from_slice(&w.to_le_bytes());
        }
    }

    /// Encode one fitted code record.
    fn encode(&mut self, code: &CodeRec) -> Template {
        let ins = code.instr1.unwrap();
        let f = code.formatp.unwrap();
        let mut t = Template::new();
        let format2 = f.format2;

        // register slot assignment: distribute reg3, reg2, reg1 and the
        // fallback over the available slots in priority order, filling
        // unused slots with the fallback or the first source register to
        // avoid false dependencies
        let mut op_avail = f.op_avail;
        if ins.source_operands > 3 && ins.op_immediate != OPI_NONE {
            op_avail |= format::OPA_IMM;
        }
        let mut slots: [u8; 4] = [0; 4];
        let mut j = 3i32;
        for a in 0..8 {
            if op_avail & (1 << a) != 0 && j >= 0 {
                slots[j as usize] = 1 << a;
                j -= 1;
            }
        }
        let mut registers: [u8; 4] = [0; 4];
        let mut a = 3i32;
        if code.e.etype & XPR_REG3 != 0 {
            registers[a as usize] = code.e.reg3;
            a -= 1;
        }
        if code.e.etype & XPR_REG2 != 0 {
            registers[a as usize] = code.e.reg2;
            a -= 1;
        }
        if code.e.etype & XPR_REG1 != 0 {
            registers[a as usize] = code.e.reg1;
            a -= 1;
        }
        while a >= 0 {
            registers[a as usize] = if code.e.etype & (XPR_MASK | XPR_FALLBACK) != 0 {
                code.e.fallback
            } else {
                code.e.reg1
            };
            a -= 1;
        }
        let mut a = 3usize;
        for j in (0..4).rev() {
            match slots[j] {
                format::OPA_RT => {
                    t.set_rt((registers[a] & REG_INDEX) as u32);
                    a = a.wrapping_sub(1);
                }
                format::OPA_RS => {
                    t.set_rs((registers[a] & REG_INDEX) as u32);
                    a = a.wrapping_sub(1);
                }
                format::OPA_RU => {
                    t.set_ru((registers[a] & REG_INDEX) as u32);
                    a = a.wrapping_sub(1);
                }
                format::OPA_RD => {
                    t.set_rd((registers[a] & REG_INDEX) as u32);
                    a = a.wrapping_sub(1);
                }
                _ => {} // memory, immediate, or nothing
            }
            if a > 3 {
                break;
            }
        }

        // common fields
        t.set_il((format2 >> 8) as u32 & 3);
        if f.tmpl == 0xD {
            t.set_mode((format2 >> 4) as u32 & 7);
            t.set_op1d(format2 as u32 & 7);
        } else {
            t.set_mode((format2 >> 4) as u32 & 7);
            t.set_op1(ins.op1 as u32 & 63);
            // two-word formats discriminated by the mode2 field
            if format2 >> 8 & 3 == 2 && matches!(format2 >> 4 & 7, 0 | 1 | 6) {
                t.set_mode2(format2 as u32 & 7);
            }
        }
        if f.tmpl != 0xD {
            if code.dest != 2 && code.dest != 0 {
                t.set_rd((code.dest & REG_INDEX) as u32);
            }
            if f.tmpl != 0xC {
                t.set_ot((code.dtype & 7) as u32);
                if f.tmpl == 0xA || f.tmpl == 0xE {
                    if code.e.etype & XPR_MASK != 0 {
                        t.set_mask((code.e.mask & 7) as u32);
                    } else {
                        t.set_mask(7); // no mask
                    }
                }
            }
        }

        // memory operand
        if f.mem != 0 {
            let mut code2 = code.clone();
            if f.mem & format::MEM_BASE_RS != 0 {
                t.set_rs((code.e.base & REG_INDEX) as u32);
            }
            if f.mem & format::MEM_INDEX_RT != 0 {
                t.set_rt((code2.e.index & REG_INDEX) as u32);
            }
            let offset = self.calculate_memory_offset(&mut code2);
            if code2.e.base != code.e.base {
                // the base pointer was assigned from the symbol's section
                t.set_rs((code2.e.base & REG_INDEX) as u32);
            }
            match f.addr_size {
                0 => {}
                size => t.write_bytes(f.addr_pos as u32, size as u32, offset as u64),
            }
            if f.mem & format::MEM_LIMIT != 0 {
                t.write_bytes(f.addr_pos as u32, f.addr_size as u32, code.e.value.u());
            }
            if f.vect & (format::VECT_LENGTH_RT | format::VECT_BROADCAST_RT) != 0
                && code.e.length != 0
            {
                t.set_rt((code.e.length & REG_INDEX) as u32);
            }
        }

        // immediate operand
        if f.imm_size != 0 && f.mem & format::MEM_LIMIT == 0 {
            let mut value = code.e.value.i();
            if code.e.sym3 != 0 && code.e.etype & XPR_JUMPOS == 0 {
                let mut e = code.e;
                value = self.calculate_constant_operand(
                    &mut e,
                    code.address as u64 + f.imm_pos as u64,
                    f.imm_size as u32,
                    code.section,
                );
                if e.etype & XPR_ERROR != 0 {
                    self.report_line(e.error_code());
                }
            }
            match f.imm_size {
                1 => {
                    if code.e.etype & XPR_IMMEDIATE == XPR_FLT {
                        t.write_bytes(f.imm_pos as u32, 1, code.e.value.d() as i64 as u64);
                    } else {
                        t.write_bytes(f.imm_pos as u32, 1, value as u64);
                    }
                }
                2 => {
                    if ins.op_immediate == OPI_SYSID {
                        // function id in IM2, module id in IM3 and OP2
                        let (module, function) = if code.e.etype & XPR_INT2 != 0 {
                            ((value as u64 >> 32) as u32, value as u32 & 0xFFFF)
                        } else {
                            ((value >> 16) as u32 & 0xFF, value as u32 & 0xFFFF)
                        };
                        t.set_im2(function);
                        t.set_im3(module & 0x3F);
                        t.set_op2((module >> 6) & 3);
                    } else if code.e.etype & XPR_IMMEDIATE == XPR_FLT {
                        t.write_bytes(
                            f.imm_pos as u32,
                            2,
                            double_to_half(code.e.value.d()) as u64,
                        );
                    } else {
                        t.write_bytes(f.imm_pos as u32, 2, value as u64);
                    }
                }
                4 => {
                    if ins.op_immediate == OPI_2INT16 {
                        let v = (value as u64) << 16 | (value as u64) >> 32;
                        t.write_bytes(f.imm_pos as u32, 4, v);
                    } else if code.e.etype & XPR_IMMEDIATE == XPR_FLT {
                        t.write_bytes(
                            f.imm_pos as u32,
                            4,
                            (code.e.value.d() as f32).to_bits() as u64,
                        );
                    } else {
                        t.write_bytes(f.imm_pos as u32, 4, value as u64);
                    }
                }
                8 => {
                    t.write_bytes(f.imm_pos as u32, 8, value as u64);
                }
                _ => {}
            }
        }

        // jump offset
        if f.jump_size != 0 {
            let offset = self.calculate_jump_offset(code, f);
            if f.tmpl == 0xD {
                t.set_im2d(offset as i32);
            } else {
                t.write_bytes(f.jump_pos as u32, f.jump_size as u32, offset as u64);
            }
        }

        // template E extras
        if f.tmpl == 0xE {
            if f.imm2 & format::IMM2_IM3_OPTIONS != 0
                && (code.e.etype & XPR_OPTIONS != 0 || code.e.optionbits != 0)
            {
                t.set_im3(code.e.optionbits as u32 & 0x3F);
            } else if f.imm2 & format::IMM2_IM3_SHIFT != 0 && code.e.optionbits != 0 {
                t.set_im3(code.e.optionbits as u32 & 0x3F);
            }
            t.set_op2(ins.op2 as u32 | t.op2());
        }

        // simplify a NOP: clear mask and operand type bits
        if f.category == 3 && ins.op1 == 0 {
            t.set_mask(0);
            t.set_ot(0);
            if t.il() > 1 {
                t.w[1] = 0;
            }
        }
        t
    }

    /// Compute the memory offset field, adding a relocation when the target
    /// is not a local delta.
    fn calculate_memory_offset(&mut self, code: &mut CodeRec) -> i64 {
        let f = code.formatp.unwrap();
        let field_pos = f.addr_pos as u32;
        let field_size = f.addr_size as u32;
        let mut scale: u32 = 0;
        if code.e.etype & XPR_JUMPOS != 0 {
            scale = 2; // jump offsets are scaled by 4
        } else if field_size == 1 && f.scale & format::SCALE_OFFSET_OS != 0 {
            scale = DATA_SIZE_LOG[(code.dtype & 7) as usize];
        }

        let symi1 = if code.e.sym1 != 0 {
            self.find_symbol(code.e.sym1)
        } else {
            None
        };
        let symi2 = if code.e.sym2 != 0 {
            self.find_symbol(code.e.sym2)
        } else {
            None
        };

        let mut relocation: Option<Relocation> = None;
        let mut value: i64 = 0;

        if let Some(s1) = symi1 {
            if let Some(s2) = symi2 {
                let symscale = code.e.symscale1.max(1);
                let sym1 = self.symbols[s1];
                let sym2 = self.symbols[s2];
                if sym1.st_section == sym2.st_section
                    && sym1.st_bind == STB_LOCAL
                    && sym2.st_bind == STB_LOCAL
                {
                    // both local in the same section: a plain constant
                    value = (sym1.st_value as i64 - sym2.st_value as i64) / symscale as i64;
                    value = (value + code.e.offset_mem as i64) >> scale;
                } else {
                    relocation = Some(Relocation {
                        r_section: code.section,
                        r_offset: 0,
                        r_type: R_FORW_REFP
                            | (bit_scan_reverse(symscale as u64) + scale),
                        r_sym: code.e.sym1,
                        r_refsym: code.e.sym2,
                        r_addend: code.e.offset_mem,
                    });
                }
            } else {
                let sym1 = self.symbols[s1];
                let symsection = sym1.st_section as usize;
                if sym1.st_type == STT_CONSTANT {
                    relocation = Some(Relocation {
                        r_section: code.section,
                        r_offset: 0,
                        r_type: R_FORW_ABS | scale,
                        r_sym: code.e.sym1,
                        r_refsym: 0,
                        r_addend: code.e.offset_mem,
                    });
                } else if symsection != 0 && symsection < self.sections.len() {
                    let flags = self.sections[symsection].sh_flags;
                    if flags & (SHF_IP | SHF_EXEC) != 0 {
                        code.e.base = REG_IP;
                        if symsection as u32 == code.section && sym1.st_bind == STB_LOCAL {
                            // a local delta; no relocation
                            value = sym1.st_value as i64
                                - (code.address + code.size as u32 * 4) as i64;
                            value = (value + code.e.offset_mem as i64) >> scale;
                        } else {
                            let mut r_type = R_FORW_SELFREL;
                            if code.e.instruction & II_JUMP_INSTR != 0 {
                                r_type |= R_FORW_SCALE4;
                            }
                            relocation = Some(Relocation {
                                r_section: code.section,
                                r_offset: 0,
                                r_type,
                                r_sym: code.e.sym1,
                                r_refsym: 0,
                                r_addend: field_pos as i32 - code.size as i32 * 4
                                    + code.e.offset_mem,
                            });
                        }
                    } else {
                        let r_type = if flags & SHF_THREADP != 0 {
                            code.e.base = REG_THREADP;
                            R_FORW_THREADP
                        } else {
                            code.e.base = REG_DATAP;
                            R_FORW_DATAP
                        };
                        relocation = Some(Relocation {
                            r_section: code.section,
                            r_offset: 0,
                            r_type: r_type | scale,
                            r_sym: code.e.sym1,
                            r_refsym: 0,
                            r_addend: code.e.offset_mem,
                        });
                    }
                } else {
                    // external symbol: base pointer from its attributes
                    let (r_type, addend) = if sym1.st_other & (STV_IP | STV_EXEC) != 0 {
                        code.e.base = REG_IP;
                        let mut rt = R_FORW_SELFREL;
                        if code.e.instruction & II_JUMP_INSTR != 0 {
                            rt |= R_FORW_SCALE4;
                        }
                        (rt, field_pos as i32 - code.size as i32 * 4)
                    } else if sym1.st_other & STV_THREADP != 0 {
                        code.e.base = REG_THREADP;
                        (R_FORW_THREADP, 0)
                    } else {
                        code.e.base = REG_DATAP;
                        (R_FORW_DATAP, 0)
                    };
                    let mut r_type = r_type;
                    if field_size == 1 && r_type & R_FORW_RELSCALEMASK == 0 {
                        r_type |= scale;
                    }
                    relocation = Some(Relocation {
                        r_section: code.section,
                        r_offset: 0,
                        r_type,
                        r_sym: code.e.sym1,
                        r_refsym: 0,
                        r_addend: addend + code.e.offset_mem,
                    });
                }
            }
        } else {
            value = (code.e.offset_mem >> scale) as i64;
        }

        if let Some(mut rel) = relocation {
            rel.r_type |= match field_size {
                1 => R_FORW_8,
                2 => R_FORW_16,
                3 => R_FORW_24,
                4 => R_FORW_32,
                _ => R_FORW_64,
            };
            rel.r_offset = code.address as u64 + field_pos as u64;
            self.relocations.push(rel);
            value = 0; // the value lives in the relocation addend
        }
        value
    }

    /// Compute an immediate field involving a symbol, adding a relocation
    /// when the value cannot be resolved locally.
    pub fn calculate_constant_operand(
        &mut self,
        expr: &mut Expression,
        address: u64,
        field_size: u32,
        section: u32,
    ) -> i64 {
        let symi1 = match self.find_symbol(expr.sym3) {
            Some(i) => i,
            None => {
                expr.etype |= XPR_ERROR;
                expr.value = Value(Code::SymbolUndefined as u64);
                return 0;
            }
        };
        let symi2 = if expr.sym4 != 0 {
            match self.find_symbol(expr.sym4) {
                Some(i) => Some(i),
                None => {
                    expr.etype |= XPR_ERROR;
                    expr.value = Value(Code::SymbolUndefined as u64);
                    return 0;
                }
            }
        } else {
            None
        };

        let mut relocation: Option<Relocation> = None;
        let mut value: i64 = 0;

        if let Some(s2) = symi2 {
            let sym1 = self.symbols[symi1];
            let sym2 = self.symbols[s2];
            if sym1.st_section == sym2.st_section
                && sym1.st_bind == STB_LOCAL
                && sym2.st_bind == STB_LOCAL
            {
                value = sym1.st_value as i64 - sym2.st_value as i64;
                if expr.symscale3 > 1 {
                    value /= expr.symscale3 as i64;
                }
                value += expr.value.i();
            } else {
                let mut r_type = R_FORW_REFP;
                if expr.symscale3 > 1 {
                    r_type |= bit_scan_reverse(expr.symscale3 as u64);
                }
                relocation = Some(Relocation {
                    r_section: section,
                    r_offset: address,
                    r_type,
                    r_sym: expr.sym3,
                    r_refsym: expr.sym4,
                    r_addend: expr.value.i() as i32,
                });
            }
        } else {
            let sym1 = self.symbols[symi1];
            if sym1.st_type == STT_CONSTANT {
                let mut r_type = R_FORW_ABS;
                if expr.symscale3 > 1 {
                    r_type |= bit_scan_reverse(expr.symscale3 as u64);
                }
                relocation = Some(Relocation {
                    r_section: section,
                    r_offset: address,
                    r_type,
                    r_sym: expr.sym3,
                    r_refsym: 0,
                    r_addend: expr.value.i() as i32,
                });
            } else if section != 0
                && self.sections[section as usize].sh_flags & (SHF_WRITE | SHF_DATAP) != 0
                && field_size >= 4
            {
                // an absolute address is only allowed in writeable data
                relocation = Some(Relocation {
                    r_section: section,
                    r_offset: address,
                    r_type: R_FORW_ABS,
                    r_sym: expr.sym3,
                    r_refsym: 0,
                    r_addend: expr.value.i() as i32,
                });
            } else {
                expr.etype |= XPR_ERROR;
                expr.value = Value(Code::AbsRelocation as u64);
            }
        }
        if let Some(mut rel) = relocation {
            rel.r_type |= match field_size {
                1 => R_FORW_8,
                2 => R_FORW_16,
                4 => R_FORW_32,
                _ => R_FORW_64,
            };
            self.relocations.push(rel);
            value = 0;
        }
        value
    }

    /// Compute the jump offset field, adding a relocation for non-local
    /// targets.
    fn calculate_jump_offset(&mut self, code: &CodeRec, f: &'static Format) -> i64 {
        if code.sym5 == 0 {
            return code.e.offset_jump as i64;
        }
        let symi = match self.find_symbol(code.sym5) {
            Some(i) => i,
            None => return 0,
        };
        let sym = self.symbols[symi];
        if sym.st_section == code.section && sym.st_bind == STB_LOCAL {
            let delta =
                sym.st_value as i64 - (code.address + code.size as u32 * 4) as i64;
            (delta >> 2) + code.e.offset_jump as i64
        } else {
            self.relocations.push(Relocation {
                r_section: code.section,
                r_offset: code.address as u64 + f.jump_pos as u64,
                r_type: R_FORW_SELFREL
                    | R_FORW_SCALE4
                    | match f.jump_size {
                        1 => R_FORW_8,
                        2 => R_FORW_16,
                        3 => R_FORW_24,
                        _ => R_FORW_32,
                    },
                r_sym: code.sym5,
                r_refsym: 0,
                // the addend is in bytes; the loader divides by the scale
                r_addend: f.jump_pos as i32 - code.size as i32 * 4
                    + (code.e.offset_jump << 2),
            });
            0
        }
    }
}
