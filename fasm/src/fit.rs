//! The code fitter: given an evaluated expression and an instruction id,
//! try every format the instruction allows and keep the smallest encoding
//! that satisfies all operand constraints.

use crate::assembler::{Assembler, CodeRec};
use crate::error::Code;
use crate::expression::*;
use fcpu::format::{self, Format};
use fcpu::instructions::*;
use fcpu::registers::{REG_CLASS, REG_INDEX, REG_R, REG_V};
use fcpu::types::*;
use felf::elf::*;
use util::{bit_scan_forward, bit_scan_reverse};

// admissible-width bit sets. A J bit means the value is a power of two and
// fits the width after sign inversion; SHIFT bits mean the value fits after
// shifting out trailing zero bits.
pub const FIT_I8: u32 = 0x0001;
pub const FIT_J8: u32 = 0x0002;
pub const FIT_U8: u32 = 0x0004;
pub const FIT_I8SHIFT: u32 = 0x0008;
pub const FIT_I16: u32 = 0x0010;
pub const FIT_J16: u32 = 0x0020;
pub const FIT_U16: u32 = 0x0040;
pub const FIT_I16SHIFT: u32 = 0x0080;
pub const FIT_I16SH16: u32 = 0x0100;
pub const FIT_I32: u32 = 0x0200;
pub const FIT_J32: u32 = 0x0400;
pub const FIT_U32: u32 = 0x0800;
pub const FIT_I32SHIFT: u32 = 0x1000;
pub const FIT_I32SH32: u32 = 0x2000;
pub const FIT_I24: u32 = 0x4000;
pub const FFIT_16: u32 = 0x0001_0000;
pub const FFIT_32: u32 = 0x0002_0000;
pub const FFIT_64: u32 = 0x0004_0000;
/// The operand needs a relocation; the bits below FIT_RELOC then give the
/// necessary relocation field size.
pub const FIT_RELOC: u32 = 0x0010_0000;
/// Freeze to the larger form to guarantee convergence of the size iteration.
pub const FIT_LARGE: u32 = 0x0020_0000;

/// Widths an integer constant fits into.
pub fn fit_int(value: i64) -> u32 {
    let mut fit = 0;
    if value == i64::min_value() {
        return 0;
    }
    let magnitude = if value >= 0 { value } else { -value };
    let low = bit_scan_forward(magnitude as u64);
    let high = bit_scan_reverse(magnitude as u64);
    let nbits = high - low + 1;
    if value >= 0 {
        if value < 0x80 {
            fit |= FIT_I8;
        }
        if value == 0x80 {
            fit |= FIT_J8;
        }
        if value <= 0xFF {
            fit |= FIT_U8;
        }
        if value < 0x8000 {
            fit |= FIT_I16;
        }
        if value == 0x8000 {
            fit |= FIT_J16;
        }
        if value <= 0xFFFF {
            fit |= FIT_U16;
        }
        if high < 31 {
            fit |= FIT_I32;
        }
        if high < 32 {
            fit |= FIT_U32;
        }
        if value == 0x8000_0000 {
            fit |= FIT_J32;
        }
    } else {
        if value >= -0x80 {
            fit |= FIT_I8;
        }
        if value >= -0x8000 {
            fit |= FIT_I16;
        }
        if value >= -0x8000_0000 {
            fit |= FIT_I32;
        }
    }
    if nbits < 8 {
        fit |= FIT_I8SHIFT;
    }
    if nbits < 16 {
        fit |= FIT_I16SHIFT;
        if low >= 16 && high < 31 + (value < 0) as u32 {
            fit |= FIT_I16SH16;
        }
    }
    if nbits < 32 {
        fit |= FIT_I32SHIFT;
    }
    if low >= 32 {
        fit |= FIT_I32SH32;
    }
    fit
}

/// Smallest floating point representations a value fits into.
pub fn fit_float(x: f64) -> u32 {
    if x == 0.0 {
        return FIT_I8 | FFIT_16 | FFIT_32 | FFIT_64;
    }
    let bits = x.to_bits();
    let mantissa = bits & 0xF_FFFF_FFFF_FFFF;
    let exponent = (bits >> 52) as i32 & 0x7FF;
    let mut fit = FFIT_64;
    if mantissa & ((1 << 42) - 1) == 0 {
        fit |= FFIT_16;
    }
    if mantissa & ((1 << 29) - 1) == 0 {
        fit |= FFIT_32;
    }
    if exponent != 0x7FF {
        let e = exponent - 0x3FF;
        if e < -14 || e > 15 {
            fit &= !FFIT_16;
        }
        if e < -126 || e > 127 {
            fit &= !FFIT_32;
        }
    }
    if fit & FFIT_16 != 0 {
        let i = x as i64;
        if i as f64 == x && i >= -128 && i < 128 {
            fit |= FIT_I8;
        }
    }
    fit
}

fn fits_widths(value: i64, uncertainty: i64, with_i24: bool) -> (u32, bool) {
    let mut fit = 0;
    let mut uncertain = false;
    if value >= -0x80 && value < 0x80 {
        fit |= FIT_I8;
    }
    if value >= -0x8000 && value < 0x8000 {
        fit |= FIT_I16;
    }
    if with_i24 && value >= -0x80_0000 && value < 0x80_0000 {
        fit |= FIT_I24;
    }
    if value >= -0x8000_0000 && value < 0x8000_0000 {
        fit |= FIT_I32;
    }
    if uncertainty != 0 {
        let v = value + uncertainty;
        if fit & FIT_I8 != 0 && !(v >= -0x80 && v < 0x80) {
            uncertain = true;
        }
        if fit & FIT_I16 != 0 && !(v >= -0x8000 && v < 0x8000) {
            uncertain = true;
        }
        if fit & FIT_I24 != 0 && !(v >= -0x80_0000 && v < 0x80_0000) {
            uncertain = true;
        }
        if fit & FIT_I32 != 0 && !(v >= -0x8000_0000 && v < 0x8000_0000) {
            uncertain = true;
        }
    }
    (fit, uncertain)
}

/// Widths needed for a relocated reference of at most `rel_size` bytes span.
fn reloc_widths(rel_size: u64, with_i24: bool) -> u32 {
    let mut fit = FIT_RELOC;
    if rel_size <= 1 << 7 {
        fit |= FIT_I8;
    }
    if rel_size <= 1 << 15 {
        fit |= FIT_I16;
    }
    if with_i24 && rel_size <= 1 << 23 {
        fit |= FIT_I24;
    }
    if rel_size <= 1 << 31 {
        fit |= FIT_I32;
    }
    fit
}

impl<'a> Assembler<'a> {
    /// Maximum reach of a relocated reference to the given symbol.
    fn relocation_span(&self, symi: usize) -> u64 {
        let sym = &self.symbols[symi];
        if sym.st_type == STT_CONSTANT {
            return self.data_size_default;
        }
        let sect = sym.st_section as usize;
        if sect != 0 && sect < self.sections.len() {
            if self.sections[sect].sh_flags & (SHF_EXEC | SHF_IP) != 0 {
                self.code_size_default
            } else {
                self.data_size_default
            }
        } else if sym.st_other & (STV_EXEC | STV_IP) != 0 {
            self.code_size_default
        } else {
            self.data_size_default
        }
    }

    /// How many bits the immediate constant of an instruction needs.
    /// Returns nonzero when the size cannot be resolved in this pass.
    pub fn fit_constant(&mut self, code: &mut CodeRec) -> u32 {
        if code.e.instruction == II_ALIGN {
            return 0;
        }
        if code.e.etype & (XPR_IMMEDIATE | XPR_SYM1) == 0 {
            return 0;
        }
        if code.e.etype & XPR_IMMEDIATE == 0 && code.e.sym3 == 0 {
            return 0; // the symbol belongs to the memory operand
        }
        let mut value = code.e.value.i();
        code.value0 = value;
        let float_type = (code.dtype as u8) >= TYP_FLOAT16 as u8;
        let mut uncertain = 0u32;

        if float_type {
            if code.e.etype & XPR_INT != 0 {
                // convert an integer constant to float; the original integer
                // is kept in value0 in case the chosen form wants an integer
                code.e.value = Value::from_d(value as f64);
                code.e.etype = (code.e.etype & !XPR_IMMEDIATE) | XPR_FLT;
            }
            let dvalue = code.e.value.d();
            if code.dtype as u8 == TYP_FLOAT32 as u8
                && dvalue.is_finite()
                && (dvalue as f32).is_infinite()
            {
                self.report_line(Code::ConstantTooLarge);
            }
            if code.dtype as u8 == TYP_FLOAT16 as u8
                && dvalue.is_finite()
                && fcpu::float16::is_inf_half(fcpu::float16::double_to_half(dvalue))
            {
                self.report_line(Code::ConstantTooLarge);
            }
        }

        // symbol used as immediate
        if code.e.sym3 != 0 {
            let isym3 = match self.find_symbol(code.e.sym3) {
                Some(i) => i,
                None => {
                    code.size_unknown = 2;
                    return 2;
                }
            };
            if self.symbols[isym3].st_bind == STB_LOCAL
                && self.symbols[isym3].st_type == STT_CONSTANT
            {
                // inline a local constant
                value = self.symbols[isym3].st_value as i64;
                code.e.value = Value::from_i(value);
                code.value0 = value;
                code.e.sym3 = 0;
                if self.optimize != 0
                    && value >= 0
                    && code.dtype & TYP_INT != 0
                    && code.dest & REG_R != 0
                {
                    code.dtype |= TYP_PLUS;
                }
            } else {
                if self.symbols[isym3].st_unitsize == 0 {
                    uncertain = 2;
                }
                let rel_size = self.relocation_span(isym3);
                if code.e.sym4 != 0 {
                    // value is (sym3 - sym4) / scale
                    let isym4 = match self.find_symbol(code.e.sym4) {
                        Some(i) => i,
                        None => {
                            code.size_unknown = 2;
                            return 2;
                        }
                    };
                    code.e.etype |= XPR_INT;
                    let s3 = &self.symbols[isym3];
                    let s4 = &self.symbols[isym4];
                    if s3.st_section != s4.st_section
                        || s3.st_bind != STB_LOCAL
                        || s4.st_bind != STB_LOCAL
                    {
                        let mut span = rel_size;
                        if code.e.symscale3 > 1 {
                            span /= code.e.symscale3 as u64;
                        }
                        code.fit_num = reloc_widths(span, false);
                        code.size_unknown = uncertain as u8;
                        return uncertain;
                    }
                    if self.pass < 4 || uncertain == 2 {
                        code.fit_num = FIT_I8 | FIT_I16 | FIT_I32;
                        code.size_unknown = 1;
                        return 1;
                    }
                    let symscale = code.e.symscale3.max(1) as i64;
                    value += (s3.st_value as u32).wrapping_sub(s4.st_value as u32) as i32 as i64;
                    let scaled = value / symscale;
                    let uncertainty =
                        (s3.st_value >> 32) as i64 - (s4.st_value >> 32) as i64;
                    let (mut fit, unc) = fits_widths(scaled, uncertainty / symscale, false);
                    if unc {
                        uncertain |= 1;
                    }
                    if uncertain & 1 != 0 && code.fit_num & FIT_LARGE != 0 {
                        fit = (fit & (fit - 1)) | FIT_I32;
                        uncertain &= !1;
                    }
                    code.fit_num = fit | (code.fit_num & FIT_LARGE);
                    code.size_unknown = uncertain as u8;
                    return uncertain;
                }
                // single symbol as immediate: relocation needed
                if self.symbols[isym3].st_section != 0
                    && self.symbols[isym3].st_type != STT_CONSTANT
                    && code.e.etype & XPR_MEM == 0
                    && code.e.etype & XPR_SYM2 == 0
                {
                    // an address constant; assume full pointer width
                    code.fit_num = reloc_widths(self.data_size_default, false);
                    code.size_unknown = uncertain as u8;
                    return uncertain;
                }
                code.fit_num = reloc_widths(rel_size, false);
                code.size_unknown = uncertain as u8;
                return uncertain;
            }
        }

        // plain constant
        if float_type {
            let mut fit = fit_float(code.e.value.d());
            if (code.dtype as u8) < TYP_FLOAT64 as u8 {
                fit |= FFIT_32;
            }
            code.fit_num = fit;
            code.size_unknown = 0;
            return 0;
        }
        code.fit_num = fit_int(value) | (code.fit_num & FIT_LARGE);
        code.size_unknown = 0;
        0
    }

    /// How many bits the memory offset and the jump offset need. Returns
    /// nonzero when the size cannot be resolved in this pass.
    pub fn fit_address(&mut self, code: &mut CodeRec) -> u32 {
        if code.e.instruction == II_ALIGN {
            return 0;
        }
        if code.e.etype & (XPR_OFFSET | XPR_JUMPOS | XPR_MEM) == 0 {
            return 0;
        }
        let mut uncertain = 0u32;

        if code.e.sym1 != 0 {
            // memory operand with symbol
            code.e.etype |= XPR_OFFSET;
            let value = code.e.offset_mem as i64;
            let isym1 = match self.find_symbol(code.e.sym1) {
                Some(i) => i,
                None => {
                    code.size_unknown = 2;
                    return 2;
                }
            };
            if self.symbols[isym1].st_unitsize == 0 {
                uncertain = 2;
            }
            let rel_size = self.relocation_span(isym1);
            if code.e.sym2 != 0 {
                let isym2 = match self.find_symbol(code.e.sym2) {
                    Some(i) => i,
                    None => {
                        code.size_unknown = 2;
                        return 2;
                    }
                };
                let s1 = &self.symbols[isym1];
                let s2 = &self.symbols[isym2];
                if s1.st_section != s2.st_section
                    || s1.st_bind != STB_LOCAL
                    || s2.st_bind != STB_LOCAL
                {
                    let mut span = rel_size;
                    if code.e.symscale1 > 1 {
                        span /= code.e.symscale1 as u64;
                    }
                    code.fit_addr = reloc_widths(span, false);
                    code.size_unknown += uncertain as u8;
                } else if self.pass < 4 || uncertain == 2 {
                    code.fit_addr = FIT_I8 | FIT_I16 | FIT_I32;
                    code.size_unknown += 1;
                    uncertain += 1;
                } else {
                    let scale = code.e.symscale1.max(1) as i64;
                    let v = value
                        + ((s1.st_value as u32).wrapping_sub(s2.st_value as u32) as i32 as i64);
                    let uncertainty = (s1.st_value >> 32) as i64 - (s2.st_value >> 32) as i64;
                    let (mut fit, unc) = fits_widths(v / scale, uncertainty / scale, false);
                    if unc {
                        uncertain |= 1;
                    }
                    if uncertain & 1 != 0 && code.fit_addr & FIT_LARGE != 0 {
                        fit = (fit & (fit - 1)) | FIT_I32;
                        uncertain &= !1;
                    }
                    code.fit_addr = fit | (code.fit_addr & FIT_LARGE);
                    code.size_unknown += uncertain as u8;
                }
            } else {
                let sym_section = self.symbols[isym1].st_section as usize;
                let in_ip = sym_section != 0
                    && sym_section < self.sections.len()
                    && self.sections[sym_section].sh_flags & SHF_IP != 0;
                if in_ip {
                    // self-relative data address
                    if sym_section as u32 != code.section
                        || self.symbols[isym1].st_bind != STB_LOCAL
                    {
                        code.fit_addr = reloc_widths(rel_size, false);
                        code.size_unknown += uncertain as u8;
                    } else if self.pass < 4 || uncertain == 2 {
                        code.fit_addr = FIT_I16 | FIT_I32;
                        code.size_unknown += 1;
                        uncertain |= 1;
                    } else {
                        let s1 = &self.symbols[isym1];
                        let v = (s1.st_value as u32)
                            .wrapping_sub(code.address + code.size as u32 * 4)
                            as i32 as i64
                            + value;
                        let uncertainty = (s1.st_value >> 32) as i64
                            - self.sections[code.section as usize].sh_link as i64;
                        let (mut fit, unc) = fits_widths(v, uncertainty, false);
                        if unc {
                            uncertain |= 1;
                        }
                        if uncertain & 1 != 0 && code.fit_addr & FIT_LARGE != 0 {
                            fit = (fit & (fit - 1)) | FIT_I32;
                            uncertain &= !1;
                        }
                        code.fit_addr = fit | (code.fit_addr & FIT_LARGE);
                        code.size_unknown += uncertain as u8;
                    }
                } else {
                    // relative to datap or threadp: relocation needed
                    code.fit_addr = reloc_widths(rel_size, false);
                    code.size_unknown += uncertain as u8;
                }
            }
        } else {
            // no symbol, plain offset
            let (fit, _) = fits_widths(code.e.offset_mem as i64, 0, false);
            code.fit_addr = fit | (code.fit_addr & FIT_LARGE);
        }

        // jump target
        if code.sym5 != 0 {
            let isym = match self.find_symbol(code.sym5) {
                Some(i) => i,
                None => {
                    code.size_unknown = 2;
                    return 2;
                }
            };
            if self.symbols[isym].st_unitsize == 0 {
                uncertain = 2;
            }
            let rel_size = self.code_size_default >> 2; // jumps are scaled by 4
            let sym_section = self.symbols[isym].st_section;
            if sym_section != code.section || self.symbols[isym].st_bind != STB_LOCAL {
                code.fit_jump = reloc_widths(rel_size, true);
                code.size_unknown += uncertain as u8;
            } else if self.pass < 4 || uncertain == 2 {
                code.fit_jump = FIT_I16 | FIT_I24 | FIT_I32;
                code.size_unknown += 1;
                uncertain = 1;
            } else {
                let s = &self.symbols[isym];
                let v = (s.st_value as u32).wrapping_sub(code.address + code.size as u32 * 4)
                    as i32 as i64;
                let scaled = (v >> 2) + code.e.offset_jump as i64;
                let uncertainty = (s.st_value >> 32) as i64
                    - self.sections[code.section as usize].sh_link as i64;
                let (mut fit, unc) = fits_widths(scaled, uncertainty >> 2, true);
                if unc {
                    uncertain |= 1;
                }
                if uncertain & 1 != 0 && code.fit_jump & FIT_LARGE != 0 {
                    fit = (fit & (fit - 1)) | FIT_I32;
                    uncertain &= !1;
                }
                code.fit_jump = fit | (code.fit_jump & FIT_LARGE);
                code.size_unknown += uncertain as u8;
            }
        } else if code.e.etype & XPR_JUMPOS != 0 {
            let (fit, _) = fits_widths(code.e.offset_jump as i64, 0, true);
            code.fit_jump = fit | (code.fit_jump & FIT_LARGE);
        }
        uncertain
    }

    /// Select the smallest format that fits the code record. Returns false
    /// and reports a diagnostic when nothing fits.
    pub fn fit_code(&mut self, code: &mut CodeRec) -> bool {
        if code.e.instruction == II_ALIGN {
            return true;
        }
        let mut best: Option<CodeRec> = None;
        let mut best_size = 99u32;

        if code.e.etype & XPR_OFFSET != 0
            && code.e.etype & XPR_IMMEDIATE == 0
            && code.fit_addr & FIT_I32 == 0
        {
            self.report_line(Code::OffsetTooLarge);
            return false;
        }

        let candidates: Vec<&'static Instruction> =
            instructions_by_id(code.e.instruction).collect();
        if candidates.is_empty() {
            self.report_line(Code::NoInstructionFit);
            return false;
        }
        for ins in candidates {
            code.category = ins.category;
            match ins.category {
                1 => {
                    if let Some(ix) = format::format_by_format2(ins.format as u16) {
                        let f = &format::FORMAT_LIST[ix];
                        if let Some(fitted) = self.instruction_fits(code, ins, f) {
                            if (fitted.size as u32) < best_size {
                                best_size = fitted.size as u32;
                                best = Some(fitted);
                            }
                        }
                    }
                }
                3 => {
                    for f in format::formats_for_multiformat() {
                        if ins.format & (1u64 << f.format_index) == 0 {
                            continue;
                        }
                        if let Some(fitted) = self.instruction_fits(code, ins, f) {
                            let better = (fitted.size as u32) < best_size
                                || (fitted.size as u32 == best_size
                                    && best.as_ref().map_or(false, |b| b.category != 3));
                            if better {
                                best_size = fitted.size as u32;
                                best = Some(fitted);
                            }
                        }
                    }
                }
                4 => {
                    for f in format::formats_for_jump() {
                        if ins.format & (1u64 << f.format_index) == 0 {
                            continue;
                        }
                        if let Some(fitted) = self.jump_instruction_fits(code, ins, f) {
                            if (fitted.size as u32) < best_size {
                                best_size = fitted.size as u32;
                                best = Some(fitted);
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        match best {
            Some(b) if best_size <= 4 => {
                *code = b;
                true
            }
            _ => {
                let e = self.explain_no_fit(code);
                self.report_line(e);
                false
            }
        }
    }

    /// Check one multiformat or single-format candidate.
    fn instruction_fits(
        &self,
        code: &CodeRec,
        ins: &'static Instruction,
        f: &'static Format,
    ) -> Option<CodeRec> {
        let mut fitted = code.clone();
        fitted.category = f.category;
        fitted.size = f.size() as u8;
        fitted.instr1 = Some(ins);
        fitted.formatp = Some(f);
        let variant = ins.variant;

        if ins.op_immediate == OPI_IMPLICIT && code.e.etype & XPR_IMMEDIATE == 0 {
            fitted.e.value = Value(ins.implicit_imm as u64);
            fitted.e.etype |= XPR_INT;
            fitted.fit_num = !0;
        }

        // vector use
        let use_vectors = code.dtype & TYP_FLOAT != 0
            || code.dest & REG_CLASS == REG_V
            || code.e.reg1 & REG_CLASS == REG_V
            || code.e.reg2 & REG_CLASS == REG_V;
        if use_vectors {
            if f.vect & format::VECT_REGS == 0 {
                return None;
            }
        } else if f.vect & format::VECT_REGS != 0 {
            return None;
        }

        // operand type
        let mut request_ot = (code.dtype & 7) as u32;
        if code.dtype as u8 == TYP_FLOAT16 as u8 {
            request_ot = (TYP_INT16 & 7) as u32;
            fitted.dtype = TYP_INT16;
        }
        let mut format_ot = f.ot as u32;
        if format_ot == format::OT_INT_PARITY as u32 {
            format_ot = 0x12 + (ins.op1 & 1) as u32;
        }
        if format_ot == format::OT_FLOAT_PARITY as u32 {
            format_ot = 0x15 + (ins.op1 & 1) as u32;
        }
        if format_ot == 0 {
            format_ot = request_ot;
        }
        format_ot &= 7;
        let scale2 = DATA_SIZE_LOG[format_ot as usize & 7];

        if variant & (VARIANT_D0 | VARIANT_D2) != 0 {
            if code.dtype == 0 && code.e.instruction != II_NOP {
                fitted.dtype = if format_ot != 0 { format_ot as u16 } else { 3 };
            }
        } else {
            if format_ot <= 3 && request_ot < format_ot && code.dtype & TYP_PLUS != 0 {
                request_ot = format_ot;
            }
            if request_ot != format_ot && code.dtype != 0 {
                return None;
            }
            let mut support = if use_vectors {
                ins.optypes_scalar | ins.optypes_vector
            } else {
                ins.optypes_gp
            };
            support |= support >> 8;
            if support & (1 << request_ot) == 0 {
                return None;
            }
        }

        // register slots
        let op_avail = f.op_avail;
        let num_reg = (op_avail >> 4 & 1) + (op_avail >> 5 & 1) + (op_avail >> 6 & 1)
            + (op_avail >> 7 & 1);
        let mut num_req = ins.source_operands;
        fitted.num_op = ins.source_operands;
        if code.e.etype & XPR_IMMEDIATE != 0 && num_req > 0 {
            num_req -= 1;
        }
        if code.e.etype & XPR_MEM != 0 && num_req > 0 {
            num_req -= 1;
        }
        if code.e.etype & (XPR_MASK | XPR_FALLBACK) != 0
            && (code.e.fallback & REG_INDEX != code.e.reg1 & REG_INDEX
                || code.e.reg1 & REG_INDEX == REG_INDEX)
        {
            num_req += 2; // a distinct fallback needs its own slot and rd
        } else if code.e.etype & XPR_REG1 != 0
            && code.dest != 0
            && code.e.reg1 != code.dest
            && variant & VARIANT_D3 == 0
        {
            num_req += 1;
        }
        if num_req > num_reg {
            return None;
        }

        // mask field
        if code.e.etype & XPR_MASK != 0 && !matches!(f.tmpl, 0xA | 0xE) {
            return None;
        }

        // option bits need the IM3 field of template E
        if code.e.etype & XPR_OPTIONS != 0
            && code.e.optionbits != 0
            && (f.tmpl != 0xE || f.imm2 & format::IMM2_IM3_OPTIONS == 0)
            && variant_options(variant) != 0
        {
            return None;
        }

        // memory operand
        if code.e.etype & XPR_MEM != 0 {
            if f.mem == 0 {
                return None;
            }
            if code.e.etype & XPR_SYM2 != 0 {
                fitted.size_unknown = 1;
            }
            if code.e.etype & XPR_INDEX != 0 {
                if f.mem & format::MEM_INDEX_RT == 0 {
                    return None;
                }
                if f.scale & format::SCALE_MINUS1 != 0 && code.e.scale != -1 {
                    return None;
                }
                if f.scale & format::SCALE_INDEX_OS != 0 && code.e.scale != 1 << scale2 {
                    return None;
                }
                if f.scale & (format::SCALE_MINUS1 | format::SCALE_INDEX_OS) == 0
                    && code.e.scale != 1
                {
                    return None;
                }
            } else if f.mem & format::MEM_INDEX_RT != 0 {
                fitted.e.index = 0x1F; // no index
                fitted.e.scale = 1 << scale2;
            }

            if code.e.etype & (XPR_OFFSET | XPR_SYM1) != 0 {
                if f.mem & format::MEM_OFFSET == 0 {
                    return None;
                }
                match f.addr_size {
                    1 => {
                        if code.e.sym1 != 0 && code.fit_addr & FIT_I8 == 0 {
                            return None;
                        }
                        if code.e.base & REG_INDEX >= 0x1C && code.e.base & REG_INDEX != 0x1F {
                            return None; // pointer bases need 16-bit offsets
                        }
                        if code.e.offset_mem & ((1 << scale2) - 1) != 0 {
                            return None;
                        }
                        let scaled = code.e.offset_mem >> scale2;
                        if code.e.sym1 == 0 && !(-0x80..0x80).contains(&scaled) {
                            return None;
                        }
                    }
                    2 => {
                        if code.fit_addr & FIT_I16 == 0 {
                            return None;
                        }
                    }
                    4 => {
                        if code.fit_addr & FIT_I32 == 0 {
                            return None;
                        }
                    }
                    _ => return None,
                }
            } else if f.addr_size < 2
                && code.e.base & REG_INDEX >= 0x1C
                && code.e.base & REG_INDEX != 0x1F
            {
                return None;
            }

            if code.e.etype & XPR_LIMIT != 0 {
                if f.mem & format::MEM_LIMIT == 0 {
                    return None;
                }
                let limit = code.e.value.u();
                match f.addr_size {
                    1 if limit >= 0x100 => return None,
                    2 if limit >= 0x1_0000 => return None,
                    4 if limit >= 0x1_0000_0000 => return None,
                    _ => {}
                }
            } else if f.mem & format::MEM_LIMIT != 0 {
                return None;
            }

            if code.e.etype & XPR_SCALAR != 0 {
                if f.vect & (format::VECT_LENGTH_RT | format::VECT_BROADCAST_RT) != 0 {
                    fitted.e.length = 31; // scalar disables the length option
                }
            } else if code.e.etype & XPR_LENGTH != 0 {
                if f.vect & format::VECT_LENGTH_RT == 0 {
                    return None;
                }
            } else if code.e.etype & XPR_BROADC != 0 {
                if f.vect & format::VECT_BROADCAST_RT == 0 {
                    return None;
                }
            }
        } else if f.mem != 0 {
            return None;
        }

        // immediate operand
        let has_immediate = fitted.e.etype & XPR_IMMEDIATE != 0;
        if has_immediate {
            if f.imm_size == 0 && ins.source_operands < 4 {
                return None;
            }
            match ins.op_immediate {
                OPI_IMPLICIT => {
                    if fitted.e.value.u() != ins.implicit_imm as u64 {
                        return None;
                    }
                }
                OPI_UINT8 => {
                    return if code.value0 < 0x100 && code.value0 > -0x80 {
                        Some(fitted)
                    } else {
                        None
                    };
                }
                OPI_UINT16 => {
                    return if code.value0 < 0x1_0000 && code.value0 > -0x8000 {
                        Some(fitted)
                    } else {
                        None
                    };
                }
                OPI_UINT32 => {
                    return if code.value0 < 0x1_0000_0000 && code.value0 > -0x8000_0000 {
                        Some(fitted)
                    } else {
                        None
                    };
                }
                OPI_SYSID => return Some(fitted),
                _ => {}
            }
            match f.imm_size {
                1 => {
                    let ok = fitted.fit_num & FIT_I8 != 0
                        || (variant & VARIANT_U0 != 0 && fitted.fit_num & FIT_U8 != 0)
                        || (fitted.dtype & 0x1F == TYP_INT8 & 0x1F
                            && fitted.fit_num & FIT_U8 != 0);
                    if !ok {
                        return None;
                    }
                }
                2 => {
                    let plain = fitted.fit_num & (FIT_I16 | FFIT_16) != 0
                        || (variant & VARIANT_U0 != 0 && fitted.fit_num & FIT_U16 != 0)
                        || (fitted.dtype & 0x1F == TYP_INT16 & 0x1F
                            && f.tmpl != 0xC
                            && fitted.fit_num & FIT_U16 != 0);
                    if !plain {
                        if f.imm2 & format::IMM2_IM3_SHIFT != 0
                            && variant_options(variant) == 0
                            && fitted.fit_num & FIT_I16SHIFT != 0
                        {
                            // value << im3 form
                            let shift = bit_scan_forward(fitted.e.value.u());
                            fitted.e.value = Value(fitted.e.value.u() >> shift);
                            fitted.e.optionbits = shift as u8;
                        } else if variant & VARIANT_H0 != 0 {
                            // half precision always fits 16 bits
                        } else {
                            return None;
                        }
                    }
                }
                4 => {
                    let ok = (code.dtype & 0xFF) as u8 == TYP_FLOAT32 as u8
                        || fitted.fit_num & (FIT_I32 | FFIT_32) != 0
                        || (fitted.fit_num & FIT_U32 != 0
                            && fitted.dtype & 0x1F == TYP_INT32 & 0x1F)
                        || (variant & VARIANT_U0 != 0 && fitted.fit_num & FIT_U32 != 0)
                        || variant & VARIANT_H0 != 0;
                    if !ok {
                        return None;
                    }
                }
                8 => {}
                _ => return None,
            }
        } else if f.imm_size != 0
            && code.e.etype & (XPR_OFFSET | XPR_LIMIT) == 0
            && ins.source_operands != 0
            && f.category != 1
        {
            return None;
        }
        Some(fitted)
    }

    /// Check one jump-format candidate.
    fn jump_instruction_fits(
        &self,
        code: &CodeRec,
        ins: &'static Instruction,
        f: &'static Format,
    ) -> Option<CodeRec> {
        let mut fitted = code.clone();
        fitted.category = f.category;
        fitted.size = f.size() as u8;
        fitted.instr1 = Some(ins);
        fitted.formatp = Some(f);

        let use_vectors = code.dtype & TYP_FLOAT != 0
            || code.dest & REG_CLASS == REG_V
            || code.e.reg1 & REG_CLASS == REG_V;
        if use_vectors && f.vect & format::VECT_REGS == 0 {
            return None;
        }

        let mut format_ot = f.ot as u32;
        if format_ot == 0 {
            format_ot = (code.dtype & 7) as u32;
        }
        format_ot &= 7;
        let mut request_ot = (code.dtype & 7) as u32;
        if format_ot <= 3 && request_ot < format_ot && code.dtype & TYP_PLUS != 0 {
            request_ot = format_ot;
            fitted.dtype = format_ot as u16;
        }
        if request_ot != format_ot && code.dtype != 0 {
            return None;
        }
        let mut support = if use_vectors {
            ins.optypes_scalar | ins.optypes_vector
        } else {
            ins.optypes_gp
        };
        support |= support >> 8;
        if code.dtype != 0 && support & (1 << request_ot) == 0 {
            return None;
        }

        // register count. The jump target is not a register operand.
        let op_avail = f.op_avail;
        let num_reg = (op_avail >> 4 & 1) + (op_avail >> 5 & 1) + (op_avail >> 7 & 1);
        let n_reg_provided = (code.e.etype & XPR_REG1 != 0) as u8
            + (code.e.etype & XPR_REG2 != 0) as u8
            + (code.e.etype & XPR_REG3 != 0) as u8;
        if n_reg_provided > num_reg {
            return None;
        }
        let mut num_req = ins.source_operands;
        if code.e.etype & XPR_REG1 != 0 && code.dest != 0 && code.e.reg1 != code.dest && num_req > 2
        {
            num_req += 1;
        }
        if code.e.etype & (XPR_IMMEDIATE | XPR_MEM) != 0 && num_req > 0 {
            num_req -= 1;
        }
        if code.e.etype & XPR_INT2 != 0 && num_req > 0 {
            num_req -= 1;
        }
        if num_req > num_reg {
            return None;
        }

        if code.e.etype & XPR_MASK != 0 && !matches!(f.tmpl, 0xA | 0xE) {
            return None;
        }

        // self-relative jump offset
        if code.e.etype & XPR_JUMPOS != 0 {
            match f.jump_size {
                0 => return None,
                1 => {
                    if code.fit_jump & FIT_I8 == 0 {
                        return None;
                    }
                }
                2 => {
                    if code.fit_jump & FIT_I16 == 0 {
                        return None;
                    }
                }
                3 => {
                    if code.fit_jump & FIT_I24 == 0 {
                        return None;
                    }
                }
                4 => {
                    if code.fit_jump & FIT_I32 == 0 {
                        return None;
                    }
                }
                _ => return None,
            }
        } else if f.jump_size != 0
            && code.e.instruction != II_JUMP
            && code.e.instruction != II_CALL
        {
            return None;
        }

        // immediate operand
        if code.e.etype & XPR_IMMEDIATE != 0 {
            if code.dtype & TYP_FLOAT != 0 && ins.variant & VARIANT_I2 == 0 {
                let mut fit = code.fit_num;
                if (code.dtype & 0xFF) as u8 <= TYP_FLOAT32 as u8 {
                    fit |= FFIT_32;
                }
                match f.imm_size {
                    0 => return None,
                    1 => {
                        if fit & FIT_I8 == 0 {
                            return None;
                        }
                    }
                    2 => {
                        if fit & FFIT_16 == 0 {
                            return None;
                        }
                    }
                    4 => {
                        if fit & FFIT_32 == 0 {
                            return None;
                        }
                    }
                    _ => {}
                }
            } else {
                match f.imm_size {
                    0 => return None,
                    1 => {
                        if fitted.fit_num & FIT_I8 == 0 {
                            return None;
                        }
                    }
                    2 => {
                        if fitted.fit_num & FIT_I16 == 0
                            && !(fitted.dtype & 0x1F == TYP_INT16 & 0x1F
                                && fitted.fit_num & FIT_U16 != 0)
                        {
                            return None;
                        }
                    }
                    4 => {
                        if fitted.fit_num & FIT_I32 == 0
                            && !(fitted.dtype & 0x1F == TYP_INT32 & 0x1F
                                && fitted.fit_num & FIT_U32 != 0)
                        {
                            return None;
                        }
                    }
                    8 => {}
                    _ => return None,
                }
            }
        } else if f.imm_size != 0
            && code.e.instruction != II_JUMP
            && code.e.instruction != II_CALL
            && ins.op_immediate == OPI_NONE
            && ins.category != 1
        {
            return None;
        }

        // memory operand (indirect and multiway jumps)
        if code.e.etype & XPR_MEM != 0 {
            if f.mem == 0 {
                return None;
            }
            if code.e.etype & XPR_INDEX != 0 && f.mem & format::MEM_INDEX_RT == 0 {
                return None;
            }
            if code.e.etype & XPR_INDEX == 0 && f.mem & format::MEM_INDEX_RT != 0 {
                fitted.e.index = 0x1F;
            }
            if code.e.etype & XPR_OFFSET != 0 {
                if f.mem & format::MEM_OFFSET == 0 {
                    return None;
                }
                if f.addr_size == 2 && code.fit_addr & FIT_I16 == 0 {
                    return None;
                }
            }
        } else if f.mem != 0 {
            return None;
        }

        Some(fitted)
    }

    /// Peephole rewrites that never change semantics: replace an
    /// instruction with an equivalent whose immediate fits a smaller
    /// encoding, e.g. `sub r, 0x80` becomes `add r, -0x80`.
    pub fn optimize_code(&mut self, code: &mut CodeRec) {
        if self.optimize == 0 {
            return;
        }
        if code.e.etype & 0xF != XPR_INT
            || code.e.etype & (XPR_MEM | XPR_SYM1 | XPR_SYM2) != 0
            || code.e.sym3 != 0
        {
            return;
        }
        fn rank(fit: u32) -> u32 {
            if fit & FIT_I8 != 0 {
                1
            } else if fit & FIT_I16 != 0 {
                2
            } else if fit & FIT_I32 != 0 {
                4
            } else {
                8
            }
        }
        let v = code.e.value.i();
        let other = match code.e.instruction {
            II_SUB => II_ADD,
            II_ADD => II_SUB,
            _ => return,
        };
        if rank(fit_int(v.wrapping_neg())) < rank(fit_int(v)) {
            code.e.instruction = other;
            code.e.value = Value::from_i(v.wrapping_neg());
        }
    }

    /// Pick the most specific reason why no format fitted.
    fn explain_no_fit(&self, code: &CodeRec) -> Code {
        let e = &code.e;
        if e.etype & XPR_MEM != 0 && e.etype & XPR_BASE == 0 && e.sym1 == 0 {
            return Code::NoBase;
        }
        if e.etype & XPR_JUMPOS != 0 && code.fit_jump & (FIT_I24 | FIT_I32) == 0 {
            return Code::TooLargeForJump;
        }
        if e.etype & XPR_IMMEDIATE != 0 && code.fit_num & (FIT_I32 | FFIT_32 | FFIT_64) == 0 {
            return Code::ImmediateTooLarge;
        }
        if e.etype & XPR_LIMIT != 0 {
            return Code::LimitTooLarge;
        }
        if e.etype & (XPR_REG3 | XPR_FALLBACK) != 0 && e.etype & XPR_MEM != 0 {
            return Code::ThreeOpAndMem;
        }
        if e.etype & XPR_OPTIONS != 0 {
            return Code::CannotHaveOption;
        }
        Code::NoInstructionFit
    }
}
