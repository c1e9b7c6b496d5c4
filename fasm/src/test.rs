use crate::assembler::{Assembler, Options};
use crate::expression::*;
use crate::fit::*;
use fcpu::instructions::*;
use fcpu::registers::{REG_R, REG_V};
use fcpu::template::Template;
use felf::elf::*;
use felf::Container;
use matches::assert_matches;
use util::Endian;

use byteorder::ByteOrder;

fn evaluator(source: &str) -> Assembler {
    Assembler::new(source, &Options::default()).unwrap()
}

fn eval(source: &str) -> Expression {
    let mut a = evaluator(source);
    let n = a.lines[0].n;
    let e = a.expression(0, n, 0);
    assert!(!a.errors.has_errors(), "{}", a.errors);
    e
}

fn assemble_ok(source: &str) -> Container {
    let mut a = Assembler::new(source, &Options::default()).unwrap();
    let c = a.assemble();
    assert!(!a.errors.has_errors(), "{}", a.errors);
    c
}

fn section_words(c: &Container, index: usize) -> Vec<u32> {
    let sh = &c.section_headers[index];
    let start = sh.sh_offset as usize;
    c.data[start..start + sh.sh_size as usize]
        .chunks(4)
        .map(Endian::read_u32)
        .collect()
}

#[test]
fn operator_precedence() {
    // 1 + 2 * 3 evaluates the product first
    let e = eval("1 + 2 * 3");
    assert_eq!(e.etype & 0xF, XPR_INT);
    assert_eq!(e.value.i(), 7);
    assert_eq!(e.tokens, 5);
}

#[test]
fn more_constant_folding() {
    assert_eq!(eval("(1 + 2) * 3").value.i(), 9);
    assert_eq!(eval("7 & 12 | 1").value.i(), 5);
    assert_eq!(eval("1 << 10").value.i(), 1024);
    assert_eq!(eval("-5 + 2").value.i(), -3);
    assert_eq!(eval("~0").value.i(), -1);
    assert_eq!(eval("10 % 4 == 2 ? 42 : 13").value.i(), 42);
    assert_eq!(eval("2.5 * 4.0").value.d(), 10.0);
    assert_eq!(eval("3 < 4").value.i(), 1);
}

#[test]
fn memory_operand_with_index_and_scale() {
    let e = eval("[r1 + r2*4 + 16]");
    assert_eq!(
        e.etype & (XPR_MEM | XPR_BASE | XPR_INDEX | XPR_OFFSET),
        XPR_MEM | XPR_BASE | XPR_INDEX | XPR_OFFSET
    );
    assert_eq!(e.base, REG_R | 1);
    assert_eq!(e.index, REG_R | 2);
    assert_eq!(e.scale, 4);
    assert_eq!(e.offset_mem, 16);
}

#[test]
fn memory_operand_options() {
    let e = eval("[r1 + 8, mask = r3, fallback = r4]");
    assert_ne!(e.etype & XPR_MASK, 0);
    assert_ne!(e.etype & XPR_FALLBACK, 0);
    assert_eq!(e.mask, REG_R | 3);
    assert_eq!(e.fallback, REG_R | 4);

    let e = eval("[r1, limit = 100]");
    assert_ne!(e.etype & XPR_LIMIT, 0);
    assert_eq!(e.value.u(), 100);
}

#[test]
fn register_expression_builds_instruction() {
    let e = eval("r1 + r2");
    assert_eq!(e.instruction, II_ADD);
    assert_eq!(e.reg1, REG_R | 1);
    assert_eq!(e.reg2, REG_R | 2);

    let e = eval("r1 - r2");
    assert_eq!(e.instruction, II_SUB);

    let e = eval("r1 * r2 + r3");
    assert_eq!(e.instruction, II_MUL_ADD);
    assert_eq!(e.reg3, REG_R | 3);

    // subtraction with a constant first swaps and flips the sign
    let e = eval("5 - r1");
    assert_eq!(e.instruction, II_SUB_REV);
}

#[test]
fn compare_inversion() {
    let mut a = evaluator("!(r1 == r2)");
    let n = a.lines[0].n;
    let e = a.expression(0, n, 0);
    assert_eq!(e.instruction, II_COMPARE);
    assert_eq!(e.optionbits & 1, 1);
}

#[test]
fn mask_and_fallback_from_ternary() {
    let e = eval("r3 ? r1 + r2 : r4");
    assert_eq!(e.instruction, II_ADD);
    assert_eq!(e.mask, REG_R | 3);
    assert_eq!(e.fallback, REG_R | 4);
    assert_ne!(e.etype & (XPR_MASK | XPR_FALLBACK), 0);
}

#[test]
fn fit_bitsets() {
    assert_ne!(fit_int(127) & FIT_I8, 0);
    assert_eq!(fit_int(128) & FIT_I8, 0);
    assert_ne!(fit_int(128) & FIT_J8, 0);
    assert_ne!(fit_int(-128) & FIT_I8, 0);
    assert_ne!(fit_int(255) & FIT_U8, 0);
    assert_ne!(fit_int(0x7FFF_FFFF) & FIT_I32, 0);
    assert_eq!(fit_int(0x8000_0000) & FIT_I32, 0);
    assert_ne!(fit_int(0x12_0000) & FIT_I16SHIFT, 0);
    assert_ne!(fit_int(0x5555_0000_0000) & FIT_I32SH32, 0);
    assert_ne!(fit_float(1.5) & FFIT_16, 0);
    assert_eq!(fit_float(1.0e40) & FFIT_32, 0);
    assert_ne!(fit_float(3.0) & FIT_I8, 0);
}

#[test]
fn smallest_format_is_chosen() {
    let c = assemble_ok(
        "code section execute ip\n int32 r1 = add(r2, r3)\n int32 r1 = add(r2, 5)\n code end\n",
    );
    let words = section_words(&c, 1);
    assert_eq!(words.len(), 2); // both single word
    let t0 = Template::from_words(&words[..1]);
    assert_eq!(t0.il(), 1);
    assert_eq!(t0.mode(), 0); // three registers
    assert_eq!(t0.op1(), II_ADD);
    let t1 = Template::from_words(&words[1..]);
    assert_eq!(t1.mode(), 4); // 8-bit immediate form
    assert_eq!(t1.im1b(), 5);
}

#[test]
fn sub_large_constant_becomes_add() {
    // -0x80 fits 8 bits where +0x80 does not
    let c = assemble_ok("code section execute ip\n int32 r0 = r0 - 0x80\n code end\n");
    let words = section_words(&c, 1);
    assert_eq!(words.len(), 1);
    let t = Template::from_words(&words);
    assert_eq!(t.op1(), II_ADD);
    assert_eq!(t.im1b(), 0x80); // -0x80 as a byte
}

#[test]
fn large_immediate_grows_the_instruction() {
    let c = assemble_ok("code section execute ip\n int32 r1 = add(r2, 0x12345)\n code end\n");
    let words = section_words(&c, 1);
    assert_eq!(words.len(), 2); // needs the 32-bit immediate form
    let t = Template::from_words(&words);
    assert_eq!(t.il(), 2);
    assert_eq!(t.w[1], 0x12345);
}

#[test]
fn vector_registers_select_vector_formats() {
    let c = assemble_ok("code section execute ip\n float v1 = add(v2, v3)\n code end\n");
    let words = section_words(&c, 1);
    let t = Template::from_words(&words);
    assert_eq!(t.mode(), 1); // vector register form
    assert_eq!(t.ot(), 5); // float
}

#[test]
fn inter_symbol_difference_needs_no_relocation() {
    let c = assemble_ok(
        "code section execute ip
L1:
 int32 r1 = add(r2, r3)
 int32 r2 = add(r3, r4)
 nop
L2:
 int64 r1 = move((L2 - L1) / 4)
code end
",
    );
    let words = section_words(&c, 1);
    // the move is the last instruction; its immediate is the word distance
    let t = Template::from_words(&words[3..]);
    assert_eq!(t.im1b(), 3);
    assert_eq!(c.relocations.len(), 0);
}

#[test]
fn external_symbol_reference_emits_relocation() {
    let c = assemble_ok(
        "extern remote_data: datap
code section execute ip
 int32 r1 = move([remote_data])
code end
",
    );
    assert_eq!(c.relocations.len(), 1);
    let r = c.relocations[0];
    assert_eq!(r.r_type & R_FORW_RELTYPEMASK, R_FORW_DATAP);
    assert_matches!(relocation_size_bytes(r.r_type), 1..=4);
    let name = c.sym_strings.get(c.symbols[r.r_sym as usize].st_name);
    assert_eq!(name, "remote_data");
}

#[test]
fn jump_offsets_and_backward_branches() {
    let c = assemble_ok(
        "code section execute ip
start:
 int32 r1 = add(r1, r2)
 int32 r1 = sub_jump_nzero(r1, 1), start
code end
",
    );
    let words = section_words(&c, 1);
    // the conditional jump carries a negative scaled offset back to start
    let t = Template::from_words(&words[1..]);
    let f = &fcpu::format::FORMAT_LIST[fcpu::format::lookup_format(&t).unwrap()];
    assert_eq!(f.category, 4);
    let offset = t.read_bytes_signed(f.jump_pos as u32, f.jump_size as u32);
    // target = end of jump + offset*4 = start
    let jump_end = (1 + f.size() as usize) * 4;
    assert_eq!(jump_end as i64 + offset * 4, 0);
}

#[test]
fn size_iteration_reaches_fixed_point() {
    // a forward jump across a large block: the first pass cannot know the
    // distance, later passes must settle without oscillating
    let mut source = String::from("code section execute ip\nbegin:\n jump finish\n");
    for _ in 0..64 {
        source.push_str(" int32 r1 = add(r1, 0x12345)\n"); // two words each
    }
    source.push_str("finish:\n return\ncode end\n");
    let c = assemble_ok(&source);
    let words = section_words(&c, 1);
    // jump (1 word) + 64 * 2 words + return (1 word)
    assert_eq!(words.len(), 1 + 128 + 1);
    let t = Template::from_words(&words[..1]);
    // direct 24-bit jump, scaled target = distance to `finish`
    assert_eq!(t.im2d(), 128);
}

#[test]
fn align_directive_pads_with_nops() {
    let c = assemble_ok(
        "code section execute ip
 nop
 align 16
 return
code end
",
    );
    let words = section_words(&c, 1);
    assert_eq!(words.len(), 5); // nop + 3 words padding + return
    let t = Template::from_words(&words[4..]);
    assert_eq!(t.op1(), OPJ_RETURN);
}

#[test]
fn data_section_and_labels() {
    let c = assemble_ok(
        "data section read write datap
values: int32 1, 2, 3, 4
byte_data: int8 0x11, 0x22
data end
",
    );
    let sh = c.section_headers[1];
    assert_eq!(sh.sh_size, 18);
    let start = sh.sh_offset as usize;
    assert_eq!(&c.data[start..start + 4], &[1, 0, 0, 0]);
    assert_eq!(c.data[start + 16], 0x11);
    // symbols carry element size and count
    let values = c
        .symbols
        .iter()
        .position(|s| c.sym_strings.get(s.st_name) == "values")
        .unwrap();
    assert_eq!(c.symbols[values].st_unitsize, 4);
    assert_eq!(c.symbols[values].st_unitnum, 4);
}

#[test]
fn public_symbols_are_global() {
    let c = assemble_ok(
        "code section execute ip
entry:
 return
code end
public entry: function
",
    );
    let i = c
        .symbols
        .iter()
        .position(|s| c.sym_strings.get(s.st_name) == "entry")
        .unwrap();
    assert_eq!(c.symbols[i].st_bind, STB_GLOBAL);
    assert_eq!(c.symbols[i].st_type, STT_FUNC);
}

#[test]
fn weak_public_symbols() {
    let c = assemble_ok(
        "code section execute ip
helper:
 return
code end
public helper: weak, function
",
    );
    let i = c
        .symbols
        .iter()
        .position(|s| c.sym_strings.get(s.st_name) == "helper")
        .unwrap();
    assert_eq!(c.symbols[i].st_bind, STB_WEAK);
}

#[test]
fn error_reporting() {
    let mut a = Assembler::new(
        "code section execute ip\n int32 r1 = add(r2\n code end\n",
        &Options::default(),
    )
    .unwrap();
    a.assemble();
    assert!(a.errors.has_errors());

    // an error line emits nothing, later lines are still processed
    let mut a = Assembler::new(
        "code section execute ip
 int32 r1 = add(
 int32 r1 = add(r2, r3)
code end
",
        &Options::default(),
    )
    .unwrap();
    let c = a.assemble();
    assert!(a.errors.has_errors());
    let words = section_words(&c, 1);
    assert_eq!(words.len(), 1);
}

#[test]
fn local_constants_are_inlined() {
    let c = assemble_ok(
        "count = 12
code section execute ip
 int32 r1 = move(count + 1)
code end
",
    );
    let words = section_words(&c, 1);
    let t = Template::from_words(&words);
    assert_eq!(t.im1b(), 13);
    // the local constant does not appear in the symbol table
    assert!(c
        .symbols
        .iter()
        .all(|s| c.sym_strings.get(s.st_name) != "count"));
}

#[test]
fn syscall_and_trap_encode() {
    let c = assemble_ok("code section execute ip\n syscall(1, 2)\n trap(3)\n code end\n");
    let words = section_words(&c, 1);
    let t = Template::from_words(&words[..2]);
    assert_eq!(t.il(), 2);
    assert_eq!(t.op1(), OPJ_SYSCALL);
    assert_eq!(t.im2(), 1); // function id
    assert_eq!(t.im3(), 2); // module id
    let trap = Template::from_words(&words[2..]);
    assert_eq!(trap.op1d(), 7);
    assert_eq!(trap.im1c(), 3);
}
