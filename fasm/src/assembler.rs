//! The assembler driver: line classification, the code line state machine,
//! symbol and section bookkeeping, and the size/address iteration that runs
//! until every instruction size is stable.

use crate::error::{Code, ErrorReporter};
use crate::expression::*;
use crate::fit::FIT_LARGE;
use crate::lexer::{self, Token, TokenKind, D2, EQ};
use fcpu::constants::{MAX_ALIGN, MAX_OPTI_PASS};
use fcpu::format::Format;
use fcpu::instructions::*;
use fcpu::registers::{REG_DATAP, REG_IP, REG_R, REG_THREADP};
use fcpu::types::*;
use felf::elf::*;
use felf::strings::StringBuffer;
use felf::Container;
use std::collections::HashMap;
use util::bit_scan_reverse;

/// One source line.
#[derive(Clone, Copy, Debug)]
pub struct Line {
    pub first: usize,
    pub n: usize,
    pub number: u32,
}

/// One code record: an evaluated instruction line waiting for format
/// selection and emission.
#[derive(Clone, Debug, Default)]
pub struct CodeRec {
    pub e: Expression,
    /// Destination register, or 2 for a memory destination.
    pub dest: u8,
    pub dtype: u16,
    /// Label defined on this line, as a name offset.
    pub label: u32,
    /// Jump target symbol, as a name offset.
    pub sym5: u32,
    pub instr1: Option<&'static Instruction>,
    pub formatp: Option<&'static Format>,
    pub category: u8,
    pub address: u32,
    pub section: u32,
    /// Size in words.
    pub size: u8,
    /// 0 = certain, 1 = may change, 2 = unresolvable in this pass.
    pub size_unknown: u8,
    pub fit_num: u32,
    pub fit_addr: u32,
    pub fit_jump: u32,
    /// Original integer value before any conversion to float.
    pub value0: i64,
    pub num_op: u8,
    pub line: u32,
}

/// Assembler options from the command line.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    pub optimize: u32,
    pub debug: u32,
    /// Worst-case distance of code references, for relocation sizing.
    pub code_size: u64,
    /// Worst-case distance of data references.
    pub data_size: u64,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            optimize: 1,
            debug: 0,
            code_size: 1 << 23,
            data_size: 1 << 31,
        }
    }
}

pub struct Assembler<'a> {
    pub source: &'a str,
    pub tokens: Vec<Token>,
    pub lines: Vec<Line>,
    pub errors: ErrorReporter,
    pub symbols: Vec<Symbol>,
    pub sym_names: StringBuffer,
    pub string_buffer: Vec<u8>,
    pub sections: Vec<SectionHeader>,
    pub section_names: StringBuffer,
    pub relocations: Vec<Relocation>,
    pub code_buffer: Vec<CodeRec>,
    pub data_buffers: Vec<Vec<u8>>,
    pub current_section: u32,
    pub data_type: u16,
    pub line_index: u32,
    pub pass: u32,
    pub optimize: u32,
    pub debug: u32,
    pub code_size_default: u64,
    pub data_size_default: u64,
    name_intern: HashMap<String, u32>,
    symbol_index: HashMap<u32, usize>,
}

impl<'a> Assembler<'a> {
    pub fn new(source: &'a str, options: &Options) -> Result<Assembler<'a>, String> {
        let tokens = lexer::tokenize(source).map_err(|e| e.to_string())?;
        let mut lines = Vec::new();
        let mut first = 0usize;
        let mut number = 1u32;
        for (i, t) in tokens.iter().enumerate() {
            if t.kind == TokenKind::Newline || t.kind == TokenKind::End {
                if i > first {
                    lines.push(Line {
                        first,
                        n: i - first,
                        number,
                    });
                }
                first = i + 1;
                number += 1;
            }
        }
        Ok(Assembler {
            source,
            tokens,
            lines,
            errors: ErrorReporter::new(),
            symbols: vec![Symbol::default()],
            sym_names: StringBuffer::new(),
            string_buffer: vec![0],
            sections: vec![SectionHeader::default()],
            section_names: StringBuffer::new(),
            relocations: Vec::new(),
            code_buffer: Vec::new(),
            data_buffers: vec![Vec::new()],
            current_section: 0,
            data_type: 0,
            line_index: 0,
            pass: 0,
            optimize: options.optimize,
            debug: options.debug,
            code_size_default: options.code_size,
            data_size_default: options.data_size,
            name_intern: HashMap::new(),
            symbol_index: HashMap::new(),
        })
    }

    pub fn report_line(&mut self, code: Code) {
        let line = self.lines.get(self.line_index as usize).copied();
        let (pos, len) = line
            .map(|l| {
                let t = self.tokens[l.first];
                (t.pos, t.len)
            })
            .unwrap_or((0, 0));
        let number = line.map(|l| l.number).unwrap_or(0);
        self.errors.report(pos, len, number, code);
    }

    fn token_text(&self, token: &Token) -> &'a str {
        &self.source[token.pos..token.pos + token.len]
    }

    /// Intern a name and return its string offset.
    pub fn intern(&mut self, name: &str) -> u32 {
        if let Some(&o) = self.name_intern.get(name) {
            return o;
        }
        let o = self.sym_names.add(name);
        self.name_intern.insert(name.to_string(), o);
        o
    }

    /// Symbol index for a name offset.
    pub fn find_symbol(&self, name_offset: u32) -> Option<usize> {
        self.symbol_index.get(&name_offset).copied()
    }

    fn add_symbol(&mut self, name_offset: u32) -> usize {
        if let Some(i) = self.find_symbol(name_offset) {
            return i;
        }
        let mut sym = Symbol::default();
        sym.st_name = name_offset;
        self.symbols.push(sym);
        let i = self.symbols.len() - 1;
        self.symbol_index.insert(name_offset, i);
        i
    }

    /// Pass 1: define section names, labels, constants and externals, and
    /// turn name tokens that refer to known symbols into symbol tokens.
    fn pass1(&mut self) {
        // collect definitions
        for li in 0..self.lines.len() {
            let line = self.lines[li];
            let t0 = self.tokens[line.first];
            match t0.kind {
                TokenKind::Name => {
                    let text = self.token_text(&t0).to_string();
                    let next = if line.n > 1 {
                        Some(self.tokens[line.first + 1])
                    } else {
                        None
                    };
                    match next {
                        Some(t1)
                            if t1.kind == TokenKind::Operator && t1.id == ':' as u32 =>
                        {
                            // a label
                            let name = self.intern(&text);
                            let i = self.add_symbol(name);
                            if self.symbols[i].st_type == STT_NOTYPE {
                                self.symbols[i].st_bind = STB_LOCAL;
                            }
                        }
                        Some(t1)
                            if t1.kind == TokenKind::Operator && t1.id == '=' as u32 =>
                        {
                            // a constant definition; evaluated in pass 2
                            let name = self.intern(&text);
                            let i = self.add_symbol(name);
                            self.symbols[i].st_type = STT_CONSTANT;
                            self.symbols[i].st_bind = STB_LOCAL;
                            self.symbols[i].st_section = 0;
                        }
                        Some(t1) if t1.kind == TokenKind::Directive => {
                            // a section name
                            let name = self.intern(&text);
                            let i = self.add_symbol(name);
                            if t1.id == lexer::DIR_SECTION {
                                self.symbols[i].st_type = STT_SECTION;
                            }
                        }
                        _ => {}
                    }
                }
                TokenKind::Directive if t0.id == lexer::DIR_EXTERN => {
                    self.line_index = li as u32;
                    self.interpret_extern(&line);
                }
                _ => {}
            }
        }
        // classify name tokens that refer to defined symbols
        for i in 0..self.tokens.len() {
            if self.tokens[i].kind == TokenKind::Name {
                let text = &self.source
                    [self.tokens[i].pos..self.tokens[i].pos + self.tokens[i].len];
                if let Some(&name) = self.name_intern.get(text) {
                    if self.symbol_index.contains_key(&name) {
                        self.tokens[i].kind = TokenKind::Symbol;
                        self.tokens[i].id = name;
                    }
                }
            }
        }
    }

    /// `extern name: attributes {, name: attributes}`
    fn interpret_extern(&mut self, line: &Line) {
        let mut tok = line.first + 1;
        let end = line.first + line.n;
        while tok < end {
            let t = self.tokens[tok];
            if t.kind != TokenKind::Name && t.kind != TokenKind::Symbol {
                self.errors
                    .report(t.pos, t.len, line.number, Code::UnexpectedToken);
                return;
            }
            let text = self.token_text(&t).to_string();
            let name = self.intern(&text);
            let i = self.add_symbol(name);
            self.symbols[i].st_section = 0;
            if self.symbols[i].st_bind == STB_LOCAL {
                self.symbols[i].st_bind = STB_GLOBAL;
            }
            tok += 1;
            // attributes up to the next comma
            if tok < end
                && self.tokens[tok].kind == TokenKind::Operator
                && self.tokens[tok].id == ':' as u32
            {
                tok += 1;
                while tok < end {
                    let a = self.tokens[tok];
                    match a.kind {
                        TokenKind::Attribute => match a.id {
                            lexer::ATT_WEAK => self.symbols[i].st_bind = STB_WEAK,
                            lexer::ATT_CONSTANT => self.symbols[i].st_type = STT_CONSTANT,
                            lexer::ATT_FUNCTION => {
                                self.symbols[i].st_type = STT_FUNC;
                                self.symbols[i].st_other |= STV_EXEC | STV_IP;
                            }
                            lexer::ATT_READ => self.symbols[i].st_other |= STV_READ,
                            lexer::ATT_WRITE => self.symbols[i].st_other |= STV_WRITE,
                            lexer::ATT_EXEC => self.symbols[i].st_other |= STV_EXEC,
                            _ => self.report_line(Code::UnknownOption),
                        },
                        TokenKind::Register => match a.id as u8 {
                            REG_IP => self.symbols[i].st_other |= STV_IP,
                            REG_DATAP => self.symbols[i].st_other |= STV_DATAP,
                            REG_THREADP => self.symbols[i].st_other |= STV_THREADP,
                            _ => self.report_line(Code::UnknownOption),
                        },
                        TokenKind::Operator if a.id == ',' as u32 => {
                            tok += 1;
                            break;
                        }
                        _ => {
                            self.errors
                                .report(a.pos, a.len, line.number, Code::UnexpectedToken);
                            return;
                        }
                    }
                    tok += 1;
                }
            } else if tok < end
                && self.tokens[tok].kind == TokenKind::Operator
                && self.tokens[tok].id == ',' as u32
            {
                tok += 1;
            }
        }
    }

    /// `name section attributes`
    fn interpret_section_directive(&mut self, line: &Line) {
        let t0 = self.tokens[line.first];
        let text = self.token_text(&t0).to_string();
        let name_offset = self.section_names.add(&text);
        let mut sh = SectionHeader {
            sh_name: name_offset,
            sh_type: SHT_PROGBITS,
            sh_align: 2,
            ..SectionHeader::default()
        };
        let mut tok = line.first + 2;
        let end = line.first + line.n;
        while tok < end {
            let a = self.tokens[tok];
            match a.kind {
                TokenKind::Attribute => match a.id {
                    lexer::ATT_READ => sh.sh_flags |= SHF_READ | SHF_ALLOC,
                    lexer::ATT_WRITE => sh.sh_flags |= SHF_WRITE | SHF_ALLOC,
                    lexer::ATT_EXEC => sh.sh_flags |= SHF_EXEC | SHF_IP | SHF_ALLOC,
                    lexer::ATT_UNINIT => sh.sh_type = SHT_NOBITS,
                    lexer::ATT_COMMUNAL => sh.sh_type = SHT_COMDAT,
                    lexer::ATT_ALIGN => {
                        // align = n
                        if tok + 2 < end && self.tokens[tok + 2].kind == TokenKind::Number {
                            let n = self.tokens[tok + 2].value;
                            if n & (n - 1) != 0 || n > MAX_ALIGN {
                                self.report_line(Code::AlignmentError);
                            } else {
                                sh.sh_align = bit_scan_reverse(n);
                            }
                            tok += 2;
                        } else {
                            self.report_line(Code::AlignmentError);
                        }
                    }
                    lexer::ATT_RELINK => sh.sh_flags |= SHF_RELINK,
                    _ => self.report_line(Code::UnknownOption),
                },
                TokenKind::Register => match a.id as u8 {
                    REG_IP => sh.sh_flags |= SHF_IP | SHF_ALLOC,
                    REG_DATAP => sh.sh_flags |= SHF_DATAP | SHF_ALLOC,
                    REG_THREADP => sh.sh_flags |= SHF_THREADP | SHF_ALLOC,
                    _ => self.report_line(Code::UnknownOption),
                },
                TokenKind::Operator if a.id == ',' as u32 => {}
                _ => {
                    self.errors
                        .report(a.pos, a.len, line.number, Code::UnexpectedToken);
                    break;
                }
            }
            tok += 1;
        }
        // default base pointer: executable and read-only sections are
        // ip-addressed, writeable data is datap-addressed
        if sh.sh_flags & SHF_BASEPOINTER == 0 {
            if sh.sh_flags & SHF_EXEC != 0 || sh.sh_flags & SHF_WRITE == 0 {
                sh.sh_flags |= SHF_IP;
            } else {
                sh.sh_flags |= SHF_DATAP;
            }
        }
        // reopening a section with the same name continues it
        for (i, existing) in self.sections.iter().enumerate().skip(1) {
            if self.section_names.get(existing.sh_name) == text {
                self.current_section = i as u32;
                return;
            }
        }
        self.sections.push(sh);
        self.data_buffers.push(Vec::new());
        self.current_section = self.sections.len() as u32 - 1;
        // the section symbol tracks the section index
        let sname = self.intern(&text);
        let i = self.add_symbol(sname);
        self.symbols[i].st_type = STT_SECTION;
        self.symbols[i].st_section = self.current_section;
    }

    /// `name end` closes the current section.
    fn interpret_end_directive(&mut self) {
        self.current_section = 0;
    }

    /// `public name: attributes {, ...}`
    fn interpret_public_directive(&mut self, line: &Line) {
        let mut tok = line.first + 1;
        let end = line.first + line.n;
        let mut symi: Option<usize> = None;
        while tok < end {
            let t = self.tokens[tok];
            match t.kind {
                TokenKind::Symbol | TokenKind::Name => {
                    let text = self.token_text(&t).to_string();
                    let name = self.intern(&text);
                    match self.find_symbol(name) {
                        Some(i) => {
                            symi = Some(i);
                            if self.symbols[i].st_section == 0
                                && self.symbols[i].st_type != STT_CONSTANT
                            {
                                self.errors
                                    .report(t.pos, t.len, line.number, Code::CannotExport);
                            } else {
                                if self.symbols[i].st_type == STT_NOTYPE {
                                    self.symbols[i].st_type =
                                        if self.symbols[i].st_other & STV_EXEC != 0 {
                                            STT_FUNC
                                        } else {
                                            STT_OBJECT
                                        };
                                }
                                if self.symbols[i].st_bind != STB_WEAK {
                                    self.symbols[i].st_bind = STB_GLOBAL;
                                }
                            }
                        }
                        None => {
                            self.errors
                                .report(t.pos, t.len, line.number, Code::SymbolUndefined);
                            return;
                        }
                    }
                }
                TokenKind::Attribute => {
                    if let Some(i) = symi {
                        match t.id {
                            lexer::ATT_WEAK => self.symbols[i].st_bind = STB_WEAK,
                            lexer::ATT_CONSTANT => {
                                if !matches!(self.symbols[i].st_type, STT_OBJECT | STT_FUNC) {
                                    self.symbols[i].st_type = STT_CONSTANT;
                                }
                            }
                            lexer::ATT_FUNCTION => self.symbols[i].st_type = STT_FUNC,
                            lexer::ATT_REGUSE => {
                                // reguse = n {, n}
                                if tok + 2 < end
                                    && self.tokens[tok + 2].kind == TokenKind::Number
                                {
                                    self.symbols[i].st_reguse1 =
                                        self.tokens[tok + 2].value as u32;
                                    self.symbols[i].st_other |= STV_REGUSE;
                                    tok += 2;
                                    if tok + 2 < end
                                        && self.tokens[tok + 1].id == ',' as u32
                                        && self.tokens[tok + 2].kind == TokenKind::Number
                                    {
                                        self.symbols[i].st_reguse2 =
                                            self.tokens[tok + 2].value as u32;
                                        tok += 2;
                                    }
                                }
                            }
                            _ => self.report_line(Code::UnknownOption),
                        }
                    }
                }
                TokenKind::Register => {
                    if let Some(i) = symi {
                        match t.id as u8 {
                            REG_IP => self.symbols[i].st_other |= STV_IP,
                            REG_DATAP => self.symbols[i].st_other |= STV_DATAP,
                            REG_THREADP => self.symbols[i].st_other |= STV_THREADP,
                            _ => self.report_line(Code::UnknownOption),
                        }
                    }
                }
                TokenKind::Operator if t.id == ':' as u32 || t.id == ',' as u32 => {}
                _ => {
                    self.errors
                        .report(t.pos, t.len, line.number, Code::UnexpectedToken);
                    return;
                }
            }
            tok += 1;
        }
    }

    /// Interpret one code line by the operand state machine.
    fn interpret_code_line(&mut self, line: &Line) {
        self.data_type = 0;
        let mut n_reg = 0usize;
        let mut state = 0u32;
        // states:
        //  0 start, 1 after label, 2 after "label:", 3 after type,
        //  4 after destination, 5 after "=", 6 after expression,
        //  7 after instruction, 8 after "(", 9 after operand,
        // 10 after ",", 11 expecting jump target
        let mut code = CodeRec::default();
        code.line = self.line_index;
        code.section = self.current_section;

        if self.current_section == 0
            || self.sections[self.current_section as usize].sh_flags & SHF_EXEC == 0
        {
            self.report_line(Code::CodeOutsideSection);
            return;
        }

        let end = line.first + line.n;
        let mut tok = line.first;
        while tok < end {
            if self.errors.line_error {
                return;
            }
            let token = self.tokens[tok];
            if state == 10
                && code.e.instruction & II_JUMP_INSTR != 0
                && token.kind != TokenKind::Instruction
            {
                // the operand after the comma is the jump target
                state = 11;
            }
            if state == 5 {
                if token.kind == TokenKind::Instruction {
                    if code.e.instruction != 0 {
                        self.errors
                            .report(token.pos, token.len, line.number, Code::UnexpectedToken);
                    }
                    code.e.instruction = token.id;
                    state = 7;
                } else {
                    // expression after '='
                    let uns = if self.data_type & TYP_UNS != 0 {
                        EOPT_UNSIGNED
                    } else {
                        0
                    };
                    let expr = self.expression(tok, end - tok, uns);
                    if self.errors.line_error {
                        return;
                    }
                    let expr = if code.e.instruction != 0 {
                        // a combined operator assignment like +=
                        let op = code.e.instruction;
                        code.e.instruction = 0;
                        let mut left = Expression::default();
                        left.etype = XPR_REG | XPR_REG1;
                        left.reg1 = code.dest;
                        self.op2(op, left, expr)
                    } else {
                        expr
                    };
                    if expr.etype & XPR_ERROR != 0 {
                        self.report_line(expr.error_code());
                        return;
                    }
                    tok += expr.tokens as usize - 1;
                    self.insert_all(&mut code, &expr);
                    state = 6;
                }
            } else if state == 11 {
                // jump target
                let expr = self.expression(tok, end - tok, 0);
                state = 6;
                if expr.etype & XPR_REG != 0 {
                    code.e = merge(&code.e, &expr);
                    code.e.reg1 = expr.reg1;
                    code.e.etype |= XPR_REG1;
                    tok += expr.tokens as usize - 1;
                } else if expr.etype & (XPR_INT | XPR_SYM1) != 0 {
                    code.sym5 = if expr.sym3 != 0 { expr.sym3 } else { expr.sym1 };
                    if code.sym5 == 0 {
                        // numeric jump offset in bytes
                        if expr.value.w() & 3 != 0 {
                            self.errors.report(
                                token.pos,
                                token.len,
                                line.number,
                                Code::JumpTargetMisalign,
                            );
                        }
                        code.e.offset_jump = (expr.value.i() >> 2) as i32;
                    }
                    tok += expr.tokens as usize - 1;
                    code.e.etype |= XPR_JUMPOS | (expr.etype & !XPR_IMMEDIATE & !XPR_SYM1);
                } else {
                    self.errors
                        .report(token.pos, token.len, line.number, Code::ExpectJumpTarget);
                    return;
                }
            } else if state == 8
                && token.kind != TokenKind::Option
                && token.kind != TokenKind::Register
            {
                if token.kind == TokenKind::Operator && token.id == ')' as u32 {
                    state = 6;
                    tok += 1;
                    continue;
                }
                // expression in a parameter list
                let expr = self.expression(tok, end - tok, 0);
                if self.errors.line_error {
                    return;
                }
                tok += expr.tokens as usize - 1;
                let mut expr = expr;
                if code.e.etype & expr.etype & XPR_INT != 0 {
                    // several integer operands
                    if code.e.etype & XPR_INT2 != 0 {
                        if code.e.etype & XPR_OPTIONS != 0 {
                            self.errors.report(
                                token.pos,
                                token.len,
                                line.number,
                                Code::TooManyOperands,
                            );
                        }
                        code.e.optionbits = expr.value.0 as u8;
                        code.e.etype |= XPR_OPTIONS;
                        expr.value = Value(0);
                    } else {
                        if code.e.value.0 >> 32 != 0 {
                            self.errors.report(
                                token.pos,
                                token.len,
                                line.number,
                                Code::TooManyOperands,
                            );
                        }
                        code.e.value =
                            Value(code.e.value.w() as u64 | expr.value.0 << 32);
                        code.e.etype |= XPR_INT2;
                        expr.value = Value(0);
                    }
                } else if expr.etype & XPR_MEM != 0 {
                    if expr.etype & XPR_OFFSET != 0 {
                        code.e.offset_mem = code.e.offset_mem.wrapping_add(expr.offset_mem);
                    }
                    if expr.etype & XPR_IMMEDIATE != 0 {
                        code.e.value = expr.value;
                    }
                } else if expr.etype & XPR_IMMEDIATE != 0 {
                    code.e.value = expr.value;
                }
                let mut e2 = expr;
                e2.value = Value(0);
                e2.offset_mem = 0;
                let had_reg1 = code.e.etype & XPR_REG1 != 0;
                let had_reg2 = code.e.etype & XPR_REG2 != 0;
                code.e = merge(&code.e, &e2);
                // registers collected through the expression
                if e2.etype & XPR_REG1 != 0 {
                    if !had_reg1 {
                        code.e.reg1 = e2.reg1;
                    } else if !had_reg2 {
                        code.e.reg2 = e2.reg1;
                        code.e.etype |= XPR_REG2;
                    }
                }
                state = 9;
            } else {
                match token.kind {
                    TokenKind::Symbol => {
                        if state == 0 {
                            code.label = token.id;
                            if let Some(symi) = self.find_symbol(token.id) {
                                self.symbols[symi].st_section = self.current_section;
                                self.symbols[symi].st_other |=
                                    (self.sections[self.current_section as usize].sh_flags
                                        & (SHF_IP | SHF_EXEC))
                                        as u32;
                            }
                            state = 1;
                        } else {
                            self.errors.report(
                                token.pos,
                                token.len,
                                line.number,
                                Code::UnexpectedToken,
                            );
                            return;
                        }
                    }
                    TokenKind::Operator => {
                        let id = token.id;
                        if id == ':' as u32 && state == 1 {
                            state = 2;
                        } else if id == '+' as u32 && state == 3 {
                            code.dtype |= TYP_PLUS;
                            self.data_type |= TYP_PLUS;
                        } else if token.priority == 15 && state == 4 {
                            state = 5;
                            if id & EQ != 0 {
                                // combined operator and assignment
                                code.e.reg1 = code.dest;
                                code.e.etype |= XPR_REG | XPR_REG1;
                                code.e.instruction = id & !EQ;
                            } else if id != '=' as u32 {
                                self.errors.report(
                                    token.pos,
                                    token.len,
                                    line.number,
                                    Code::UnexpectedToken,
                                );
                            }
                        } else if id == ',' as u32 && state == 6 {
                            state = 10;
                        } else if id == ',' as u32 && state == 9 {
                            state = 8;
                        } else if id == '(' as u32 && state == 7 {
                            state = 8;
                        } else if id == ')' as u32 && (state == 8 || state == 9) {
                            state = 6;
                        } else if id == '[' as u32 && matches!(state, 0 | 2 | 3) {
                            // memory destination
                            let expr = self.expression(tok, end - tok, 0);
                            tok += expr.tokens as usize - 1;
                            self.insert_mem(&mut code, &expr);
                            code.dest = 2;
                            state = 4;
                        } else if id == '[' as u32
                            && state == 7
                            && code.e.instruction == II_ADDRESS
                        {
                            let expr = self.expression(tok, end - tok, 0);
                            tok += expr.tokens as usize - 1;
                            self.insert_mem(&mut code, &expr);
                            state = 6;
                        } else if (id == ('+' as u32 | D2) || id == ('-' as u32 | D2))
                            && (state == 3 || state == 4)
                        {
                            // ++ and --
                            code.e.instruction = if id == ('+' as u32 | D2) {
                                II_ADD
                            } else {
                                II_SUB
                            };
                            if self.data_type & TYP_FLOAT != 0 {
                                code.e.value = Value::from_d(1.0);
                                code.e.etype |= XPR_FLT;
                            } else {
                                code.e.value = Value::from_i(1);
                                code.e.etype |= XPR_INT;
                            }
                            if state == 3 {
                                tok += 1;
                                if tok < end && self.tokens[tok].kind == TokenKind::Register {
                                    code.dest = self.tokens[tok].id as u8;
                                } else {
                                    self.report_line(Code::MissingDestination);
                                }
                            }
                            code.e.reg1 = code.dest;
                            code.e.etype |= XPR_REG1;
                            state = 6;
                        } else if id == ';' as u32 {
                            // ignore a terminating semicolon
                        } else {
                            self.errors.report(
                                token.pos,
                                token.len,
                                line.number,
                                Code::UnexpectedToken,
                            );
                            return;
                        }
                    }
                    TokenKind::Type => {
                        if state == 0 || state == 2 {
                            code.dtype = token.id as u16;
                            self.data_type = token.id as u16;
                            state = 3;
                        } else {
                            self.errors.report(
                                token.pos,
                                token.len,
                                line.number,
                                Code::UnexpectedToken,
                            );
                            return;
                        }
                    }
                    TokenKind::Register => {
                        if matches!(state, 0 | 2 | 3) {
                            code.dest = token.id as u8;
                            state = 4;
                        } else if state == 8 {
                            if n_reg < 3 {
                                match n_reg {
                                    0 => code.e.reg1 = token.id as u8,
                                    1 => code.e.reg2 = token.id as u8,
                                    _ => code.e.reg3 = token.id as u8,
                                }
                                code.e.etype |= XPR_REG1 << n_reg;
                                n_reg += 1;
                                if code.e.etype & (XPR_INT | XPR_FLT | XPR_MEM) != 0
                                    && code.dest != 2
                                {
                                    self.errors.report(
                                        token.pos,
                                        token.len,
                                        line.number,
                                        Code::OperandsWrongOrder,
                                    );
                                }
                            } else {
                                self.errors.report(
                                    token.pos,
                                    token.len,
                                    line.number,
                                    Code::TooManyOperands,
                                );
                            }
                            state = 9;
                        } else {
                            self.errors.report(
                                token.pos,
                                token.len,
                                line.number,
                                Code::UnexpectedToken,
                            );
                            return;
                        }
                    }
                    TokenKind::Instruction => {
                        if matches!(state, 0 | 2 | 3) {
                            code.e.instruction = token.id;
                            state = 7;
                            if token.id & II_JUMP_INSTR != 0 {
                                // jump or call: the next token may be a jump
                                // target unless an operand list or a memory
                                // operand follows
                                state = 11;
                                for t2 in tok + 1..end {
                                    if self.tokens[t2].kind == TokenKind::Operator
                                        && (self.tokens[t2].id == '[' as u32
                                            || (t2 == tok + 1
                                                && self.tokens[t2].id == '(' as u32))
                                    {
                                        state = 7;
                                        break;
                                    }
                                }
                            }
                        } else if (state == 6 || state == 10) && token.id & II_JUMP_INSTR != 0
                        {
                            // second half of a merged jump instruction
                            match combine_jump(code.e.instruction, token.id & 63) {
                                Some(id) => code.e.instruction = id,
                                None => {
                                    self.errors.report(
                                        token.pos,
                                        token.len,
                                        line.number,
                                        Code::WrongOperands,
                                    );
                                    return;
                                }
                            }
                            state = 11;
                        } else {
                            self.errors.report(
                                token.pos,
                                token.len,
                                line.number,
                                Code::UnexpectedToken,
                            );
                            return;
                        }
                    }
                    TokenKind::Option => {
                        let expr = self.expression(tok, end - tok, EOPT_OPTION_EQ);
                        tok += expr.tokens as usize - 1;
                        code.e.etype |= expr.etype;
                        if expr.etype & XPR_LIMIT != 0 {
                            code.e.value = expr.value;
                            if expr.value.u() >= 0x1_0000_0000 {
                                self.report_line(Code::LimitTooLarge);
                            }
                        }
                        if expr.etype & (XPR_LENGTH | XPR_BROADC) != 0 {
                            code.e.length = expr.length;
                        }
                        if expr.etype & XPR_MASK != 0 {
                            code.e.mask = expr.mask;
                        }
                        if expr.etype & XPR_FALLBACK != 0 {
                            code.e.fallback = expr.fallback;
                        }
                        if expr.etype & XPR_OPTIONS != 0 {
                            code.e.optionbits = expr.optionbits;
                        }
                        if state == 8 {
                            state = 9;
                        } else if state == 6 || state == 10 {
                            state = 6;
                        } else {
                            self.errors.report(
                                token.pos,
                                token.len,
                                line.number,
                                Code::UnexpectedToken,
                            );
                            return;
                        }
                    }
                    TokenKind::Attribute if token.id == lexer::ATT_ALIGN && state == 0 => {
                        // align n
                        let expr = self.expression(tok + 1, end - tok - 1, 0);
                        code.e.instruction = II_ALIGN;
                        code.e.value = expr.value;
                        code.size_unknown = 0x80;
                        let v = expr.value.u();
                        if v & (v - 1) != 0
                            || v > MAX_ALIGN
                            || expr.etype & XPR_IMMEDIATE != XPR_INT
                            || expr.etype & (XPR_REG | XPR_OPTION | XPR_MEM) != 0
                        {
                            self.report_line(Code::AlignmentError);
                        }
                        tok = end;
                        state = 6;
                        break;
                    }
                    _ => {
                        self.errors
                            .report(token.pos, token.len, line.number, Code::UnexpectedToken);
                        return;
                    }
                }
            }
            tok += 1;
        }

        if self.errors.line_error {
            return;
        }
        if !matches!(state, 0 | 2 | 6 | 7 | 11) {
            let t = self.tokens[end - 1];
            self.errors
                .report(t.pos, t.len, line.number, Code::UnfinishedInstruction);
            return;
        }

        // a line with operands but no operator is a move or a store
        if code.e.instruction == 0 && code.e.etype != 0 {
            if code.dest == 2 {
                code.e.instruction = II_STORE;
            } else {
                code.e.instruction = II_MOVE;
                if self.optimize != 0
                    && code.e.etype & XPR_INT != 0
                    && code.e.value.i() >= 0
                    && code.e.sym3 == 0
                    && code.dtype & TYP_INT != 0
                    && code.dest & REG_R != 0
                {
                    // positive constants are zero extended anyway
                    code.dtype |= TYP_PLUS;
                }
            }
        }

        if code.e.instruction != 0 {
            self.optimize_code(&mut code);
            self.check_code1(&mut code);
            if self.errors.line_error {
                return;
            }
            self.fit_constant(&mut code);
            self.fit_address(&mut code);
            if !self.fit_code(&mut code) {
                return;
            }
        }
        self.code_buffer.push(code);
    }

    /// Copy the evaluated operand expression into the code record.
    fn insert_all(&mut self, code: &mut CodeRec, expr: &Expression) {
        let reg1 = code.e.reg1;
        code.e = merge(&code.e, expr);
        code.e.reg1 = if expr.etype & XPR_REG1 != 0 {
            expr.reg1
        } else {
            reg1
        };
        code.e.reg2 = expr.reg2;
        code.e.reg3 = expr.reg3;
        code.e.value = expr.value;
        code.e.offset_mem = expr.offset_mem;
        code.e.offset_jump = expr.offset_jump;
    }

    /// Copy a memory operand expression into the code record.
    fn insert_mem(&mut self, code: &mut CodeRec, expr: &Expression) {
        if expr.etype & XPR_ERROR != 0 {
            self.report_line(expr.error_code());
            return;
        }
        code.e = merge(&code.e, expr);
        code.e.offset_mem = expr.offset_mem;
    }

    /// Pre-fit checks and fixes.
    fn check_code1(&mut self, code: &mut CodeRec) {
        if code.e.etype & XPR_MEM != 0 {
            let use_vectors = code.dtype & TYP_FLOAT != 0
                || code.dest & 0xE0 == fcpu::registers::REG_V
                || code.e.reg1 & 0xE0 == fcpu::registers::REG_V;
            if use_vectors && code.e.scale == -1 {
                code.e.etype |= XPR_LENGTH;
                code.e.length = code.e.index;
            }
            let num_opt = (code.e.etype & XPR_SCALAR != 0) as u32
                + (code.e.etype & XPR_LENGTH != 0) as u32
                + (code.e.etype & XPR_BROADC != 0) as u32;
            if num_opt > 1 {
                self.report_line(Code::ConflictOptions);
                return;
            }
            if num_opt != 0 && !use_vectors && code.e.etype & XPR_SCALAR == 0 {
                self.report_line(Code::VectorOption);
                return;
            }
            if code.e.etype & XPR_INDEX != 0 {
                let scale = code.e.scale;
                if scale != 1
                    && scale != -1
                    && scale as i32 != DATA_SIZE_MAX8[(code.dtype & 7) as usize] as i32
                {
                    self.report_line(Code::ScaleFactor);
                }
                if scale == -1 && code.e.length != 0 && code.e.length != code.e.index {
                    self.report_line(Code::NegIndexLength);
                    return;
                }
            }
            if code.e.etype & XPR_BASE == 0 {
                // a symbol with an implicit base pointer is required
                let symi = if code.e.etype & XPR_SYM1 != 0 {
                    self.find_symbol(code.e.sym1)
                } else {
                    None
                };
                let ok = code.e.etype & XPR_SYM2 == 0
                    && symi.map_or(false, |i| {
                        self.symbols[i].st_other & STV_SECT_ATTR != 0
                            || self.symbols[i].st_section != 0
                    });
                if !ok {
                    self.report_line(Code::NoBase);
                }
            }
        }
        if code.e.etype & XPR_MASK != 0 && code.e.mask & 0x1F > 6 {
            self.report_line(Code::MaskRegister);
        }
        if code.e.etype & XPR_MASK != 0 {
            if code.e.fallback == 0 {
                code.e.fallback = if code.e.reg1 != 0 { code.e.reg1 } else { 0x1F };
            }
            if code.e.fallback & 0xE0 == 0 {
                code.e.fallback |= code.dest & 0xE0;
            }
        }
        // unsigned types select the unsigned instruction variant
        if code.dtype & TYP_UNS != 0 {
            match code.e.instruction {
                II_DIV | II_DIV_REV | II_MUL_HI | II_REM | II_SHIFT_RIGHT_S | II_MIN | II_MAX => {
                    code.e.instruction |= 1;
                }
                _ => {}
            }
        }
    }

    /// Pass 4: iterate sizes and addresses until nothing changes.
    fn pass4(&mut self) {
        let n_sections = self.sections.len();
        let mut changes = 1u32;
        let mut tot_uncertain = 0u32;
        for opti_pass in 1..=MAX_OPTI_PASS {
            self.pass = opti_pass.max(4); // symbol values exist from the first pass here
            if changes == 0 && (tot_uncertain == 0 || opti_pass > 2) {
                break;
            }
            changes = 0;
            tot_uncertain = 0;
            for i in 1..n_sections {
                self.sections[i].sh_link = 0; // scratch: uncertain count
                if self.sections[i].sh_flags & SHF_EXEC != 0 {
                    self.sections[i].sh_size = 0;
                }
            }
            let mut section = 0u32;
            let mut addr = 0u32;
            let mut num_uncertain = 0u32;
            for i in 0..self.code_buffer.len() {
                let code_section = self.code_buffer[i].section;
                if code_section == 0 || code_section as usize >= n_sections {
                    continue;
                }
                if code_section != section {
                    if section != 0 {
                        self.sections[section as usize].sh_size = addr as u64;
                        self.sections[section as usize].sh_link = num_uncertain;
                        tot_uncertain += num_uncertain;
                    }
                    section = code_section;
                    addr = self.sections[section as usize].sh_size as u32;
                    num_uncertain = self.sections[section as usize].sh_link;
                }
                self.code_buffer[i].address = addr;
                if self.code_buffer[i].label != 0 {
                    // record the label address with its uncertainty in the
                    // high half
                    if let Some(symi) = self.find_symbol(self.code_buffer[i].label) {
                        self.symbols[symi].st_value =
                            addr as u64 | (num_uncertain as u64) << 32;
                        self.symbols[symi].st_unitsize = 1;
                    }
                }
                if self.code_buffer[i].size_unknown != 0 {
                    let last_size = self.code_buffer[i].size;
                    if self.code_buffer[i].instr1.is_some() {
                        if opti_pass >= MAX_OPTI_PASS - 1 {
                            // slow convergence: freeze to the larger form
                            self.code_buffer[i].fit_addr |= FIT_LARGE;
                            self.code_buffer[i].fit_num |= FIT_LARGE;
                            self.code_buffer[i].fit_jump |= FIT_LARGE;
                        }
                        self.sections[section as usize].sh_link = num_uncertain;
                        self.line_index = self.code_buffer[i].line;
                        let mut code = self.code_buffer[i].clone();
                        code.size_unknown = 0;
                        self.fit_constant(&mut code);
                        self.fit_address(&mut code);
                        self.fit_code(&mut code);
                        if code.size != last_size {
                            changes += 1;
                        }
                        self.code_buffer[i] = code;
                    } else if self.code_buffer[i].instruction_is_align() {
                        let ali = (self.code_buffer[i].e.value.u() as u32).max(4);
                        let new_address = (addr + ali - 1) & !(ali - 1);
                        let size = ((new_address - addr) >> 2) as u8;
                        if size != last_size {
                            changes += 1;
                        }
                        self.code_buffer[i].size = size;
                        if num_uncertain != 0 {
                            num_uncertain += (ali >> 2).saturating_sub(1 + size as u32);
                        }
                        let align_log = bit_scan_reverse(ali as u64);
                        if self.sections[section as usize].sh_align < align_log {
                            self.sections[section as usize].sh_align = align_log;
                        }
                    }
                }
                addr += self.code_buffer[i].size as u32 * 4;
                num_uncertain += (self.code_buffer[i].size_unknown & 0x7F) as u32;
            }
            if section != 0 {
                self.sections[section as usize].sh_size = addr as u64;
                self.sections[section as usize].sh_link = num_uncertain;
                tot_uncertain += num_uncertain;
            }
        }
        // strip the uncertainty information from the symbol records
        for sym in &mut self.symbols {
            if matches!(sym.st_type, STT_OBJECT | STT_FUNC | STT_NOTYPE) {
                sym.st_value &= 0xFFFF_FFFF;
            }
        }
    }

    /// Run all passes over the source and produce the object file.
    pub fn assemble(&mut self) -> Container {
        self.pass1();
        self.pass = 3;
        // interpret all lines
        for li in 0..self.lines.len() {
            let line = self.lines[li];
            self.line_index = li as u32;
            self.errors.line_error = false;
            let t0 = self.tokens[line.first];
            let t1 = if line.n > 1 {
                Some(self.tokens[line.first + 1])
            } else {
                None
            };
            match (t0.kind, t1.map(|t| t.kind)) {
                (TokenKind::Directive, _) if t0.id == lexer::DIR_PUBLIC => {
                    // public symbols are finalized after addresses settle
                }
                (TokenKind::Directive, _) if t0.id == lexer::DIR_EXTERN => {}
                (TokenKind::Symbol, Some(TokenKind::Directive))
                | (TokenKind::Name, Some(TokenKind::Directive)) => {
                    match t1.unwrap().id {
                        lexer::DIR_SECTION => self.interpret_section_directive(&line),
                        lexer::DIR_END => self.interpret_end_directive(),
                        _ => self.report_line(Code::UnexpectedToken),
                    }
                }
                (TokenKind::Symbol, Some(TokenKind::Operator))
                    if t1.unwrap().id == '=' as u32 && !self.in_code_section() =>
                {
                    self.interpret_constant_definition(&line);
                }
                _ if self.in_code_section() => self.interpret_code_line(&line),
                _ => self.interpret_data_line(&line),
            }
        }
        // resolve addresses
        self.pass4();
        // export directives need final symbol values
        for li in 0..self.lines.len() {
            let line = self.lines[li];
            self.line_index = li as u32;
            let t0 = self.tokens[line.first];
            if t0.kind == TokenKind::Directive && t0.id == lexer::DIR_PUBLIC {
                self.interpret_public_directive(&line);
            }
        }
        // emit binary code, data and relocations
        self.pass5()
    }

    fn in_code_section(&self) -> bool {
        self.current_section != 0
            && self.sections[self.current_section as usize].sh_flags & SHF_EXEC != 0
    }

    /// `name = expression` defines a local constant.
    fn interpret_constant_definition(&mut self, line: &Line) {
        let t0 = self.tokens[line.first];
        let expr = self.expression(line.first + 2, line.n - 2, 0);
        if expr.etype & XPR_ERROR != 0 {
            self.report_line(expr.error_code());
            return;
        }
        let name = t0.id;
        let i = self.add_symbol(name);
        self.symbols[i].st_type = STT_CONSTANT;
        self.symbols[i].st_bind = STB_LOCAL;
        self.symbols[i].st_value = expr.value.0;
        self.symbols[i].st_unitsize = 8;
        if expr.etype & XPR_FLT != 0 {
            self.symbols[i].st_other |= STV_FLOAT;
        }
        if expr.etype & XPR_STRING != 0 {
            self.symbols[i].st_other |= STV_STRING;
            self.symbols[i].st_unitnum = expr.sym2;
        }
    }

    /// Data definition lines: `[label :] type value {, value}` or
    /// `align n`.
    fn interpret_data_line(&mut self, line: &Line) {
        if self.current_section == 0 {
            // outside any section only constant definitions are allowed
            self.report_line(Code::CodeOutsideSection);
            return;
        }
        let end = line.first + line.n;
        let mut tok = line.first;
        let mut label: Option<u32> = None;

        let t0 = self.tokens[tok];
        if t0.kind == TokenKind::Symbol
            && line.n > 1
            && self.tokens[tok + 1].kind == TokenKind::Operator
            && self.tokens[tok + 1].id == ':' as u32
        {
            label = Some(t0.id);
            tok += 2;
        }
        if tok >= end {
            // a bare label
            if let Some(name) = label {
                self.define_data_label(name, 0, 0);
            }
            return;
        }
        let t = self.tokens[tok];
        if t.kind == TokenKind::Attribute && t.id == lexer::ATT_ALIGN {
            let expr = self.expression(tok + 1, end - tok - 1, 0);
            let v = expr.value.u();
            if v & (v - 1) != 0 || v > MAX_ALIGN || expr.etype & XPR_IMMEDIATE != XPR_INT {
                self.report_line(Code::AlignmentError);
                return;
            }
            let sect = self.current_section as usize;
            let buf = &mut self.data_buffers[sect];
            while buf.len() as u64 % v != 0 {
                buf.push(0);
            }
            self.sections[sect].sh_size = buf.len() as u64;
            if self.sections[sect].sh_align < bit_scan_reverse(v) {
                self.sections[sect].sh_align = bit_scan_reverse(v);
            }
            return;
        }
        if t.kind != TokenKind::Type {
            self.errors
                .report(t.pos, t.len, line.number, Code::UnexpectedToken);
            return;
        }
        let dtype = t.id as u16;
        self.data_type = dtype;
        tok += 1;
        let unit = DATA_SIZE[(dtype & 7) as usize].min(8) as usize;
        let sect = self.current_section as usize;
        let start = self.data_buffers[sect].len();
        let mut count = 0u32;

        while tok < end {
            let expr = self.expression(tok, end - tok, 0);
            if expr.etype & XPR_ERROR != 0 {
                self.report_line(expr.error_code());
                return;
            }
            tok += expr.tokens as usize;
            let mut bytes = [0u8; 8];
            let v = if expr.etype & XPR_FLT != 0 {
                match unit {
                    2 => fcpu::float16::double_to_half(expr.value.d()) as u64,
                    4 => (expr.value.d() as f32).to_bits() as u64,
                    _ => expr.value.0,
                }
            } else {
                if expr.sym3 != 0 {
                    // a data item referring to a symbol needs a relocation
                    self.relocations.push(Relocation {
                        r_section: self.current_section,
                        r_offset: self.data_buffers[sect].len() as u64,
                        r_type: R_FORW_ABS
                            | match unit {
                                1 => R_FORW_8,
                                2 => R_FORW_16,
                                4 => R_FORW_32,
                                _ => R_FORW_64,
                            },
                        r_sym: expr.sym3,
                        r_refsym: 0,
                        r_addend: expr.value.i() as i32,
                    });
                    0
                } else {
                    expr.value.0
                }
            };
            bytes[..8].copy_from_slice(&v.to_le_bytes());
            self.data_buffers[sect].extend_from_slice(&bytes[..unit]);
            count += 1;
            if tok < end {
                let sep = self.tokens[tok];
                if sep.kind == TokenKind::Operator && sep.id == ',' as u32 {
                    tok += 1;
                } else {
                    self.errors
                        .report(sep.pos, sep.len, line.number, Code::UnexpectedToken);
                    return;
                }
            }
        }
        self.sections[sect].sh_size = self.data_buffers[sect].len() as u64;
        if let Some(name) = label {
            self.define_data_label(name, start as u64, count);
            if let Some(i) = self.find_symbol(name) {
                self.symbols[i].st_unitsize = unit as u32;
                if dtype & TYP_FLOAT != 0 {
                    self.symbols[i].st_other |= STV_FLOAT;
                }
            }
        }
    }

    fn define_data_label(&mut self, name: u32, offset: u64, count: u32) {
        let i = self.add_symbol(name);
        self.symbols[i].st_section = self.current_section;
        self.symbols[i].st_value = offset;
        self.symbols[i].st_type = STT_OBJECT;
        self.symbols[i].st_unitnum = count.max(1);
        if self.symbols[i].st_unitsize == 0 {
            self.symbols[i].st_unitsize = 1;
        }
        let flags = self.sections[self.current_section as usize].sh_flags;
        self.symbols[i].st_other |= (flags & SHF_BASEPOINTER) as u32;
    }
}

impl CodeRec {
    fn instruction_is_align(&self) -> bool {
        self.e.instruction == II_ALIGN
    }
}
