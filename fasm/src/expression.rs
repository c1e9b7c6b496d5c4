//! The expression evaluator.
//!
//! [`Assembler::expression`] turns a token range into a typed [`Expression`]
//! carrying registers, memory operand components, immediates, symbols and a
//! pending instruction. The evaluator scans the range once for the operator
//! binding loosest at bracket depth zero, then recurses into the operand
//! ranges and combines the partial results.

use crate::assembler::Assembler;
use crate::error::Code;
use crate::lexer::{Token, TokenKind, D2, D3, EQ};
use crate::lexer::{
    OPT_BROADCAST, OPT_FALLBACK, OPT_LENGTH, OPT_LIMIT, OPT_MASK, OPT_OPTIONS, OPT_SCALAR,
};
use fcpu::instructions::*;
use fcpu::registers::{REG_CLASS, REG_INDEX, REG_R, REG_V};
use fcpu::types::TYP_FLOAT;
use felf::elf::{STB_LOCAL, STT_CONSTANT, STT_VARIABLE, STV_FLOAT, STV_STRING};

// etype bits. The low nibble is the value kind.
pub const XPR_INT: u32 = 0x0000_0001;
pub const XPR_FLT: u32 = 0x0000_0002;
pub const XPR_STRING: u32 = 0x0000_0004;
pub const XPR_IMMEDIATE: u32 = 0x0000_0007;
pub const XPR_INT2: u32 = 0x0000_0008;
pub const XPR_REG: u32 = 0x0000_0010;
pub const XPR_REG1: u32 = 0x0000_0020;
pub const XPR_REG2: u32 = 0x0000_0040;
pub const XPR_REG3: u32 = 0x0000_0080;
pub const XPR_MEM: u32 = 0x0000_0100;
pub const XPR_BASE: u32 = 0x0000_0200;
pub const XPR_INDEX: u32 = 0x0000_0400;
pub const XPR_OFFSET: u32 = 0x0000_0800;
pub const XPR_OPTION: u32 = 0x0000_1000;
pub const XPR_OPTIONS: u32 = 0x0000_2000;
pub const XPR_SCALAR: u32 = 0x0000_4000;
pub const XPR_MASK: u32 = 0x0000_8000;
pub const XPR_FALLBACK: u32 = 0x0001_0000;
pub const XPR_SYM1: u32 = 0x0002_0000;
pub const XPR_SYM2: u32 = 0x0004_0000;
pub const XPR_SYMSCALE: u32 = 0x0008_0000;
pub const XPR_LIMIT: u32 = 0x0010_0000;
pub const XPR_LENGTH: u32 = 0x0020_0000;
pub const XPR_BROADC: u32 = 0x0040_0000;
pub const XPR_JUMPOS: u32 = 0x0080_0000;
pub const XPR_UNRESOLV: u32 = 0x0100_0000;
pub const XPR_OP: u32 = 0x0200_0000;
pub const XPR_TYPENAME: u32 = 0x0400_0000;
pub const XPR_ERROR: u32 = 0x8000_0000;

// evaluator options
pub const EOPT_UNSIGNED: u32 = 1;
pub const EOPT_INSIDE_MEM: u32 = 2;
pub const EOPT_OPTION_EQ: u32 = 4;
pub const EOPT_INSIDE_CURLY: u32 = 8;
pub const EOPT_SYNTAX_CHECK: u32 = 0x10;

/// Unsigned variant marker on an operator id.
pub const OP_UNS: u32 = 0x800;

/// Tagged 64-bit value: integer, float bits, or a string buffer offset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Value(pub u64);

impl Value {
    pub fn from_i(v: i64) -> Value {
        Value(v as u64)
    }
    pub fn from_u(v: u64) -> Value {
        Value(v)
    }
    pub fn from_d(v: f64) -> Value {
        Value(v.to_bits())
    }
    pub fn i(self) -> i64 {
        self.0 as i64
    }
    pub fn u(self) -> u64 {
        self.0
    }
    pub fn w(self) -> u32 {
        self.0 as u32
    }
    pub fn d(self) -> f64 {
        f64::from_bits(self.0)
    }
}

/// The typed result of evaluating an expression.
#[derive(Clone, Copy, Debug, Default)]
pub struct Expression {
    pub etype: u32,
    pub value: Value,
    /// Pending instruction id while building a compound expression.
    pub instruction: u32,
    /// Sign bits of the operands, compare condition, and unsigned flag.
    pub optionbits: u8,
    pub reg1: u8,
    pub reg2: u8,
    pub reg3: u8,
    pub base: u8,
    pub index: u8,
    pub scale: i8,
    /// Scale factor of a symbol difference used as memory address.
    pub symscale1: u8,
    /// Scale factor of a symbol difference used as immediate.
    pub symscale3: u8,
    pub length: u8,
    pub mask: u8,
    pub fallback: u8,
    pub offset_mem: i32,
    pub offset_jump: i32,
    /// Memory operand symbol and its reference symbol, as name offsets.
    pub sym1: u32,
    pub sym2: u32,
    /// Immediate symbol and its reference symbol, as name offsets.
    pub sym3: u32,
    pub sym4: u32,
    /// Number of tokens consumed.
    pub tokens: u32,
}

impl Expression {
    pub fn error(code: Code) -> Expression {
        Expression {
            etype: XPR_ERROR,
            value: Value(code as u64),
            ..Expression::default()
        }
    }

    pub fn error_code(&self) -> Code {
        // the error code is stored in the value field
        crate::error::ALL_CODES
            .iter()
            .copied()
            .find(|&c| c as u64 == self.value.0)
            .unwrap_or(Code::WrongType)
    }

    fn set_error(&mut self, code: Code) {
        self.etype |= XPR_ERROR;
        self.value = Value(code as u64);
    }
}

/// Merge the components of two partial expressions. Flag words are ORed;
/// single-value fields are taken from whichever side defines them. Register
/// fields are not merged here: the callers assign them explicitly because
/// their placement depends on the operator.
pub fn merge(a: &Expression, b: &Expression) -> Expression {
    let mut r = *a;
    r.etype = a.etype | b.etype;
    if r.value.0 == 0 {
        r.value = b.value;
    }
    if r.base == 0 {
        r.base = b.base;
    }
    if r.index == 0 {
        r.index = b.index;
        if r.scale == 0 {
            r.scale = b.scale;
        }
    }
    if r.symscale1 == 0 {
        r.symscale1 = b.symscale1;
    }
    if r.symscale3 == 0 {
        r.symscale3 = b.symscale3;
    }
    if r.length == 0 {
        r.length = b.length;
    }
    if r.mask == 0 {
        r.mask = b.mask;
    }
    if r.fallback == 0 {
        r.fallback = b.fallback;
    }
    if r.sym1 == 0 {
        r.sym1 = b.sym1;
    }
    if r.sym2 == 0 {
        r.sym2 = b.sym2;
    }
    if r.sym3 == 0 {
        r.sym3 = b.sym3;
    }
    if r.sym4 == 0 {
        r.sym4 = b.sym4;
    }
    if r.instruction == 0 {
        r.instruction = b.instruction;
    }
    r.optionbits |= b.optionbits;
    if r.offset_mem == 0 {
        r.offset_mem = b.offset_mem;
    }
    if r.offset_jump == 0 {
        r.offset_jump = b.offset_jump;
    }
    r
}

impl<'a> Assembler<'a> {
    /// Evaluate the expression starting at token `tok1`, using at most
    /// `maxtok` tokens. See the `EOPT_*` flags for `options`.
    pub fn expression(&mut self, tok1: usize, maxtok: usize, options: u32) -> Expression {
        let mut toklow = tok1; // operator binding loosest
        let mut tokcolon = 0usize; // ':' matching the loosest '?'
        let mut priority: u8 = 0;
        let mut brackets: Vec<u8> = Vec::new();
        let mut state = 0; // 0 = expecting value, 1 = after value
        let mut exp1 = Expression::default();
        exp1.tokens = 1;

        let mut tok = tok1;
        while tok < tok1 + maxtok {
            if self.errors.line_error {
                exp1.etype = 0;
                return exp1;
            }
            let token = self.tokens[tok];
            if token.kind == TokenKind::Operator {
                if token.priority == 1 || token.priority == 14 {
                    // bracket; the '?' of '?:' is treated like a bracket
                    match token.id {
                        x if x == '?' as u32 => {
                            if token.priority > priority && brackets.is_empty() {
                                priority = token.priority;
                                toklow = tok;
                            }
                            brackets.push(b'?');
                            state = 0;
                        }
                        x if x == '(' as u32 || x == '[' as u32 || x == '{' as u32 => {
                            brackets.push(token.id as u8);
                            state = 0;
                        }
                        x if x == ')' as u32
                            || x == ']' as u32
                            || x == '}' as u32
                            || x == ':' as u32 =>
                        {
                            if brackets.is_empty() {
                                break; // this end bracket is not part of the expression
                            }
                            let open = brackets.pop().unwrap();
                            let want = match open {
                                b'(' => ')',
                                b'[' => ']',
                                b'{' => '}',
                                _ => ':',
                            } as u32;
                            if want != token.id {
                                self.report_token(&token, Code::BracketEnd);
                                break;
                            }
                            if token.id == ':' as u32 {
                                if brackets.is_empty() && priority == 14 && tokcolon == 0 {
                                    tokcolon = tok;
                                }
                                state = 0;
                                tok += 1;
                                continue;
                            }
                            state = 1;
                            tok += 1;
                            continue;
                        }
                        _ => {}
                    }
                    tok += 1;
                    continue;
                }
                if !brackets.is_empty() {
                    tok += 1;
                    continue; // only match brackets inside brackets
                }
                if state == 1 {
                    if token.id == ';' as u32 {
                        break;
                    }
                    if token.id == ',' as u32 && options & EOPT_INSIDE_MEM == 0 {
                        break;
                    }
                    if token.id == '=' as u32
                        && options & (EOPT_INSIDE_MEM | EOPT_OPTION_EQ) == 0
                    {
                        break;
                    }
                    if token.priority >= priority {
                        // ties split at the rightmost occurrence so the left
                        // subexpression is evaluated first
                        priority = token.priority;
                        toklow = tok;
                    }
                    state = if token.priority == 3 { 1 } else { 0 };
                } else if state == 0
                    && (token.id == '-' as u32 || token.id == '+' as u32 || token.priority == 3)
                {
                    // monadic operator
                    if priority < 3 {
                        priority = 3;
                        toklow = tok;
                    }
                } else {
                    self.report_token(&token, Code::UnexpectedToken);
                    break;
                }
            } else {
                if !brackets.is_empty() {
                    tok += 1;
                    continue;
                }
                if state == 0 {
                    match token.kind {
                        TokenKind::Name
                        | TokenKind::Symbol
                        | TokenKind::Number
                        | TokenKind::Float
                        | TokenKind::Char
                        | TokenKind::String
                        | TokenKind::Register
                        | TokenKind::Option
                        | TokenKind::Type
                        | TokenKind::HllKeyword => state = 1,
                        _ => {
                            self.report_token(&token, Code::UnexpectedToken);
                            break;
                        }
                    }
                } else {
                    break; // no operator after a value ends the expression
                }
            }
            tok += 1;
        }

        if self.errors.line_error {
            exp1.etype = 0;
            return exp1;
        }
        let ntok = tok - tok1;
        exp1.tokens = ntok as u32;
        if !brackets.is_empty() {
            let open = *brackets.last().unwrap();
            let code = if open == b'?' {
                Code::QuestionMark
            } else {
                Code::BracketBegin
            };
            let t0 = self.tokens[tok1];
            self.errors.report(t0.pos, t0.len, self.line_index, code);
            if exp1.etype == 0 {
                exp1.etype = XPR_INT;
            }
            return exp1;
        }
        if ntok == 0 {
            let t = self.tokens[tok.min(self.tokens.len() - 1)];
            self.errors
                .report(t.pos, t.len, self.line_index, Code::MissingExpression);
            return exp1;
        }

        match priority {
            0 => {
                // no operator: brackets around an expression or a single token
                let first = self.tokens[tok1];
                if ntok > 2 && first.kind == TokenKind::Operator && first.priority == 1 {
                    let mut option1 = options;
                    if first.id == '[' as u32 {
                        if options & EOPT_INSIDE_MEM != 0 {
                            self.report_token(&first, Code::UnexpectedToken);
                        }
                        option1 |= EOPT_INSIDE_MEM;
                    }
                    if first.id == '{' as u32 {
                        option1 |= EOPT_INSIDE_CURLY;
                    }
                    exp1 = self.expression(tok1 + 1, ntok - 2, option1);
                    exp1.tokens += 2;
                    return self.finish(exp1, toklow);
                } else if ntok == 1 {
                    exp1 = self.single_token(tok1, options);
                    exp1.tokens = 1;
                    if options & EOPT_INSIDE_MEM != 0 {
                        exp1.etype |= XPR_MEM;
                    }
                    return self.finish(exp1, toklow);
                } else {
                    self.report_token(&first, Code::UnexpectedToken);
                }
                exp1
            }
            3 => {
                // monadic operator
                if toklow != tok1 {
                    // postfix ++ and -- are not expressions
                    let t = self.tokens[tok1 + 1];
                    self.report_token(&t, Code::UnexpectedToken);
                    return exp1;
                }
                let opid = self.tokens[toklow].id;
                let mut inner = self.expression(toklow + 1, maxtok - 1, options);
                if inner.etype & XPR_UNRESOLV != 0 {
                    inner.tokens += 1;
                    return self.finish(inner, toklow);
                }
                let mut exp2 = Expression::default();
                let op2id: u32;
                match opid {
                    x if x == '+' as u32 => {
                        inner.tokens += 1;
                        return self.finish(inner, toklow);
                    }
                    x if x == '-' as u32 => {
                        if inner.etype & (XPR_OP | XPR_REG | XPR_MEM) != 0 {
                            let r = self.op1_minus(inner);
                            return self.finish(r, toklow);
                        }
                        // convert -A to 0 - A
                        exp2 = inner;
                        inner = Expression::default();
                        inner.etype = XPR_INT;
                        op2id = '-' as u32;
                    }
                    x if x == '!' as u32 => {
                        inner.tokens += 1;
                        if inner.instruction == II_COMPARE
                            && inner.etype & XPR_REG1 != 0
                            && inner.etype & (XPR_REG2 | XPR_INT | XPR_IMMEDIATE) != 0
                        {
                            // invert the compare condition
                            inner.optionbits ^= 1;
                            inner.etype |= XPR_OPTIONS;
                            if inner.reg1 & REG_V != 0 && self.data_type & TYP_FLOAT != 0 {
                                inner.optionbits ^= 8; // inverted float compare is unordered
                            }
                            return self.finish(inner, toklow);
                        }
                        if inner.instruction == II_AND
                            && inner.etype & XPR_REG1 != 0
                            && inner.etype & XPR_INT != 0
                        {
                            inner.optionbits ^= 4;
                            inner.etype |= XPR_OPTIONS;
                            return self.finish(inner, toklow);
                        }
                        if inner.instruction == II_TEST_BITS_AND
                            && inner.etype & XPR_REG1 != 0
                            && inner.etype & XPR_INT != 0
                        {
                            inner.optionbits ^= 1;
                            inner.etype |= XPR_OPTIONS;
                            return self.finish(inner, toklow);
                        }
                        if inner.etype & (XPR_MEM | XPR_REG) != 0 {
                            let t = self.tokens[toklow];
                            self.errors
                                .report(t.pos, t.len, self.line_index, Code::NotOpAmbiguous);
                        }
                        // !A becomes A == 0
                        exp2 = inner;
                        exp2.tokens -= 1;
                        inner = Expression::default();
                        inner.etype = XPR_INT;
                        let r = self.op2('=' as u32 | D2, exp2, inner);
                        return self.finish(r, toklow);
                    }
                    x if x == '~' as u32 => {
                        // ~A becomes A ^ -1
                        exp2.etype = XPR_INT;
                        exp2.value = Value::from_i(-1);
                        op2id = '^' as u32;
                        let r = self.op2(op2id, inner, exp2);
                        return self.finish(r, toklow);
                    }
                    _ => {
                        let t = self.tokens[tok1];
                        self.report_token(&t, Code::UnexpectedToken);
                        return exp1;
                    }
                }
                let r = self.op2(op2id, inner, exp2);
                self.finish(r, toklow)
            }
            14 => self.op3(tok1, toklow, tokcolon, maxtok, options),
            _ => {
                // dyadic operator: evaluate both operand ranges
                let e1 = self.expression(tok1, toklow - tok1, options);
                if e1.tokens as usize != toklow - tok1 {
                    let t = self.tokens[tok1 + e1.tokens as usize];
                    self.report_token(&t, Code::UnexpectedToken);
                }
                if self.errors.line_error {
                    return e1;
                }
                let e2 = self.expression(toklow + 1, tok1 + maxtok - (toklow + 1), options);
                if self.errors.line_error {
                    return e1;
                }
                let mut opid = self.tokens[toklow].id;
                if options & EOPT_UNSIGNED != 0 {
                    opid |= OP_UNS;
                }
                let mut r = self.op2(opid, e1, e2);
                r.tokens = (toklow - tok1 + 1) as u32 + e2.tokens;
                self.finish(r, toklow)
            }
        }
    }

    fn finish(&mut self, exp: Expression, toklow: usize) -> Expression {
        if !self.errors.line_error && exp.etype & XPR_ERROR != 0 {
            let t = self.tokens[toklow];
            self.errors
                .report(t.pos, t.len, self.line_index, exp.error_code());
        }
        exp
    }

    fn report_token(&mut self, token: &Token, code: Code) {
        self.errors.report(token.pos, token.len, self.line_index, code);
    }

    /// Interpret one value token.
    fn single_token(&mut self, tok1: usize, options: u32) -> Expression {
        let token = self.tokens[tok1];
        let mut exp = Expression::default();
        match token.kind {
            TokenKind::Symbol => {
                exp.etype = XPR_SYM1;
                exp.sym3 = token.id;
                let symi = self.find_symbol(token.id);
                let is_local = symi.map_or(false, |i| {
                    self.symbols[i].st_bind == STB_LOCAL
                        && matches!(self.symbols[i].st_type, STT_CONSTANT | STT_VARIABLE)
                });
                if options & EOPT_INSIDE_MEM != 0 {
                    exp.etype |= XPR_MEM;
                    exp.sym3 = 0;
                    if is_local {
                        exp.offset_mem = self.symbols[symi.unwrap()].st_value as i32;
                    } else {
                        exp.sym1 = token.id;
                    }
                } else if is_local {
                    let sym = &self.symbols[symi.unwrap()];
                    if sym.st_other & STV_FLOAT != 0 {
                        exp.etype |= XPR_FLT;
                    } else {
                        exp.etype |= XPR_INT;
                    }
                    exp.value = Value(sym.st_value);
                    if sym.st_other & STV_STRING != 0 {
                        exp.etype = XPR_STRING;
                        exp.sym2 = sym.st_unitnum; // string length
                    } else {
                        exp.etype &= !XPR_SYM1;
                        exp.sym3 = 0;
                    }
                } else {
                    exp.etype |= XPR_INT; // type not known yet
                    exp.sym3 = token.id;
                }
            }
            TokenKind::Number => {
                if options & EOPT_INSIDE_MEM != 0 {
                    exp.etype = XPR_OFFSET;
                    exp.offset_mem = token.value as i32;
                } else {
                    exp.etype = XPR_INT;
                    exp.value = Value(token.value);
                }
            }
            TokenKind::Float => {
                exp.etype = XPR_FLT;
                exp.value = Value(token.value);
                if options & EOPT_INSIDE_MEM != 0 {
                    self.report_token(&token, Code::WrongType);
                }
            }
            TokenKind::Char => {
                exp.etype = XPR_INT;
                exp.value = Value(token.value);
                if options & EOPT_INSIDE_MEM != 0 {
                    self.report_token(&token, Code::WrongType);
                }
            }
            TokenKind::String => {
                exp.etype = XPR_STRING;
                let body = &self.source[token.pos..token.pos + token.len];
                let text = crate::lexer::unescape_string(body);
                exp.value = Value(self.string_buffer.len() as u64);
                exp.sym2 = text.len() as u32;
                self.string_buffer.extend_from_slice(text.as_bytes());
                self.string_buffer.push(0);
                if options & EOPT_INSIDE_MEM != 0 {
                    self.report_token(&token, Code::WrongType);
                }
            }
            TokenKind::Register => {
                if options & EOPT_INSIDE_MEM != 0 {
                    exp.etype = XPR_BASE | XPR_MEM;
                    exp.base = token.id as u8;
                } else {
                    exp.etype = XPR_REG | XPR_REG1;
                    exp.reg1 = token.id as u8;
                }
            }
            TokenKind::Name => {
                if options & EOPT_SYNTAX_CHECK == 0 {
                    self.report_token(&token, Code::SymbolUndefined);
                }
                exp.etype |= XPR_UNRESOLV;
            }
            TokenKind::Option => {
                exp.etype = XPR_OPTION;
                if token.id == OPT_SCALAR {
                    exp.etype |= XPR_SCALAR;
                } else {
                    exp.value = Value(token.id as u64);
                }
            }
            TokenKind::Type => {
                exp.etype = XPR_TYPENAME;
                exp.value = Value(token.id as u64);
            }
            TokenKind::HllKeyword => {
                exp.etype = XPR_INT;
                exp.value = Value(token.id as u64 & 1);
            }
            _ => {
                self.report_token(&token, Code::UnexpectedToken);
            }
        }
        exp
    }

    /// Dispatch a dyadic operator on two evaluated operands.
    pub fn op2(&mut self, op: u32, exp1: Expression, exp2: Expression) -> Expression {
        if (exp1.etype | exp2.etype) & XPR_UNRESOLV != 0 {
            let mut r = exp1;
            r.etype = XPR_UNRESOLV;
            r.tokens = exp1.tokens + exp2.tokens + 1;
            return r;
        }
        if exp1.etype & exp2.etype & XPR_MEM != 0 {
            return self.op2_memory(op, exp1, exp2);
        }
        if exp1.etype == XPR_OPTION && op == '=' as u32 {
            return self.op2_memory(op, exp1, exp2);
        }
        if exp1.etype & exp2.etype & XPR_SYM1 != 0 {
            // adding or subtracting symbols
            return self.op2_memory(op, exp1, exp2);
        }
        if exp1.etype & XPR_SYM2 != 0 && exp2.etype & XPR_INT != 0 {
            // (sym1 - sym2) / constant
            return self.op2_memory(op, exp1, exp2);
        }
        if (exp1.etype | exp2.etype) & (XPR_REG | XPR_BASE) != 0 || exp1.sym1 != 0 || exp2.sym1 != 0
        {
            return self.op2_registers(op, exp1, exp2);
        }
        if (exp1.etype | exp2.etype) & XPR_STRING != 0 {
            return self.op2_string(op, exp1, exp2);
        }
        if exp1.etype & 0xF == XPR_FLT || exp2.etype & 0xF == XPR_FLT {
            return op2_float(op, exp1, exp2);
        }
        if exp1.etype & 0xF == XPR_INT && exp2.etype & 0xF == XPR_INT {
            return op2_int(op, exp1, exp2);
        }
        Expression::error(Code::WrongType)
    }

    /// Triadic `cond ? value : fallback`.
    fn op3(
        &mut self,
        tok1: usize,
        toklow: usize,
        tokcolon: usize,
        maxtok: usize,
        options: u32,
    ) -> Expression {
        let exp1 = self.expression(tok1, toklow - tok1, options);
        if exp1.tokens as usize != toklow - tok1 {
            let t = self.tokens[tok1 + exp1.tokens as usize];
            self.report_token(&t, Code::UnexpectedToken);
        }
        if tokcolon == 0 {
            let t = self.tokens[toklow];
            self.errors
                .report(t.pos, t.len, self.line_index, Code::QuestionMark);
            return exp1;
        }

        if exp1.etype & XPR_REG == 0 && exp1.etype & (XPR_INT | XPR_FLT | XPR_STRING) != 0 {
            // constant condition: choose one branch, syntax-check the other
            let cond = if exp1.etype & 0xF == XPR_FLT {
                exp1.value.d() != 0.0
            } else if exp1.etype & 0xF == XPR_STRING {
                exp1.sym2 != 0
                    && (exp1.sym2 > 1 || self.string_buffer.get(exp1.value.0 as usize) != Some(&b'0'))
            } else {
                exp1.value.i() != 0
            };
            let skip = if cond { 0 } else { EOPT_SYNTAX_CHECK };
            let mut e1 = self.expression(toklow + 1, tokcolon - (toklow + 1), options | skip);
            if e1.tokens as usize != tokcolon - (toklow + 1) {
                let t = self.tokens[toklow + 1 + e1.tokens as usize];
                self.report_token(&t, Code::UnexpectedToken);
            }
            let skip2 = if cond { EOPT_SYNTAX_CHECK } else { 0 };
            let mut e2 =
                self.expression(tokcolon + 1, tok1 + maxtok - (tokcolon + 1), options | skip2);
            let total = (tokcolon - tok1 + 1) as u32 + e2.tokens;
            e1.tokens = total;
            e2.tokens = total;
            return if cond { e1 } else { e2 };
        }

        // condition is a mask register
        if exp1.etype & XPR_REG == 0
            || exp1.reg1 == 0
            || exp1.etype & (XPR_OP | XPR_OPTION | XPR_MEM | XPR_SYM1 | XPR_MASK | XPR_UNRESOLV)
                != 0
        {
            let t = self.tokens[tok1];
            self.errors
                .report(t.pos, t.len, self.line_index, Code::MaskNotRegister);
        }
        let maskreg = exp1.reg1;

        let mut e1 = self.expression(toklow + 1, tokcolon - (toklow + 1), options);
        if e1.tokens as usize != tokcolon - (toklow + 1) {
            let t = self.tokens[toklow + 1 + e1.tokens as usize];
            self.report_token(&t, Code::UnexpectedToken);
        }

        // the third expression is the fallback
        let e2 = self.expression(tokcolon + 1, tok1 + maxtok - (tokcolon + 1), options);
        let mut fallbackreg = 0u8;
        if e2.etype & XPR_REG != 0 {
            fallbackreg = e2.reg1;
            e1.etype |= XPR_FALLBACK;
        } else if e2.etype & (XPR_INT | XPR_FLT) != 0 && e2.value.i() == 0 {
            fallbackreg = maskreg | REG_INDEX; // register 31 in the mask's class
            e1.etype |= XPR_FALLBACK;
        }
        if e2.etype & (XPR_STRING | XPR_OP | XPR_OPTION | XPR_MEM | XPR_SYM1 | XPR_MASK) != 0
            || e2.value.i() != 0 && e2.etype & XPR_REG == 0
        {
            let t = self.tokens[tokcolon + 1];
            self.errors
                .report(t.pos, t.len, self.line_index, Code::FallbackWrong);
        }
        e1.etype |= XPR_MASK;
        e1.mask = maskreg;
        e1.fallback = fallbackreg;
        e1.tokens = (tokcolon - tok1 + 1) as u32 + e2.tokens;
        e1
    }

    /// Apply monadic minus to a composite expression, e.g. `-(A+B)`.
    fn op1_minus(&mut self, mut exp1: Expression) -> Expression {
        exp1.tokens += 1;
        if exp1.etype & (XPR_REG | XPR_MEM) != 0
            && exp1.etype & XPR_OP == 0
            && exp1.value.i() == 0
        {
            exp1.etype |= XPR_OP | XPR_INT;
            exp1.instruction = II_SUB_REV; // 0 - expression
        } else if exp1.instruction == II_SUB {
            exp1.instruction = II_SUB_REV;
        } else if exp1.instruction == II_SUB_REV {
            exp1.instruction = II_SUB;
        } else if exp1.instruction == II_ADD_ADD {
            exp1.optionbits ^= 3;
        } else if exp1.instruction == II_MUL_ADD || exp1.instruction == II_MUL_ADD2 {
            exp1.optionbits ^= 0xF;
        } else if exp1.instruction == II_ADD
            && exp1.etype & (XPR_IMMEDIATE | XPR_MEM | XPR_SYM1) == 0
        {
            // -(R1+R2) = -R1 - R2 + 0
            exp1.instruction = II_ADD_ADD;
            exp1.value = Value(0);
            exp1.optionbits = 3;
            exp1.etype |= XPR_INT;
        } else if exp1.instruction == II_ADD && exp1.etype & XPR_IMMEDIATE != 0 {
            // -(R1+I) = -R1 + (-I)
            exp1.instruction = II_SUB_REV;
            if exp1.etype & XPR_IMMEDIATE == XPR_FLT {
                exp1.value = Value::from_d(-exp1.value.d());
            } else {
                exp1.value = Value::from_i(-exp1.value.i());
            }
        } else if (exp1.instruction == 0
            || exp1.instruction == II_MUL
            || exp1.instruction == II_DIV
            || exp1.instruction == II_DIV_REV)
            && exp1.etype & XPR_IMMEDIATE != 0
        {
            // -I or -(A*I)
            if exp1.etype & XPR_FLT != 0 {
                exp1.value = Value::from_d(-exp1.value.d());
            } else {
                exp1.value = Value::from_i(-exp1.value.i());
            }
        } else if exp1.instruction == II_MUL && exp1.etype & XPR_IMMEDIATE == 0 {
            exp1.instruction = II_MUL_ADD;
            exp1.optionbits ^= 3;
            exp1.etype |= XPR_INT;
        } else {
            exp1.set_error(Code::TooComplex);
        }
        exp1
    }

    /// String concatenation; numbers are converted to text.
    fn op2_string(&mut self, op: u32, exp1: Expression, exp2: Expression) -> Expression {
        if op != '+' as u32 {
            return Expression::error(Code::WrongType);
        }
        let start = self.string_buffer.len();
        for e in &[exp1, exp2] {
            match e.etype & 0xF {
                XPR_STRING => {
                    let p = e.value.0 as usize;
                    let text: Vec<u8> = self.string_buffer[p..p + e.sym2 as usize].to_vec();
                    self.string_buffer.extend_from_slice(&text);
                }
                XPR_INT => {
                    self.string_buffer
                        .extend_from_slice(format!("{}", e.value.i()).as_bytes());
                }
                XPR_FLT => {
                    self.string_buffer
                        .extend_from_slice(format!("{}", e.value.d()).as_bytes());
                }
                _ => {
                    self.string_buffer.extend_from_slice(b"-wrong type!-");
                }
            }
        }
        let len = self.string_buffer.len() - start;
        self.string_buffer.push(0);
        let mut r = Expression::default();
        r.etype = XPR_STRING;
        r.value = Value(start as u64);
        r.sym2 = len as u32;
        r.tokens = exp1.tokens + exp2.tokens + 1;
        r
    }

    /// Operands with registers or a pending instruction: build a compound
    /// instruction expression.
    fn op2_registers(&mut self, op: u32, ex1: Expression, ex2: Expression) -> Expression {
        let mut expr = Expression::default();
        let mut swapped = false;
        let mut cannot_swap = false;
        let numtokens = ex1.tokens + ex2.tokens + 1;
        expr.tokens = numtokens;

        let mut exp12 = [ex1, ex2];

        if (ex1.etype | ex2.etype) & XPR_OP != 0 {
            // simplify the halves where possible
            for e in exp12.iter_mut() {
                if e.etype & (XPR_REG | XPR_MEM) != 0
                    && e.etype & XPR_IMMEDIATE != 0
                    && e.value.i() == 0
                {
                    if e.instruction == II_SUB_REV {
                        // (0 - A): a register with a sign bit
                        e.etype &= !(XPR_OPTIONS | XPR_IMMEDIATE | XPR_OP);
                        e.instruction = 0;
                        e.optionbits = 1;
                    } else if e.instruction == II_MUL_ADD {
                        // (-A*B + 0): a product with a sign bit
                        e.instruction = II_MUL;
                        e.optionbits &= 1;
                        e.etype &= !(XPR_OPTIONS | XPR_IMMEDIATE);
                    } else if e.instruction == II_ADD_ADD
                        && e.etype & (XPR_INT | XPR_FLT) != 0
                        && e.optionbits & 3 == 3
                    {
                        // (-A-B + 0): a sum with sign bits
                        e.etype &= !(XPR_INT | XPR_FLT);
                        e.instruction = II_ADD;
                        e.optionbits ^= 3;
                        e.etype &= !(XPR_OPTIONS | XPR_IMMEDIATE);
                    }
                } else if e.instruction == II_SUB_REV {
                    // -A+B becomes -(A-B)
                    e.instruction = II_SUB;
                    e.optionbits ^= 3;
                }
            }

            if exp12[0].etype & XPR_IMMEDIATE != 0 && exp12[1].etype & XPR_IMMEDIATE != 0 {
                // both halves carry an immediate; fold them
                let mut isfloat = [
                    exp12[0].etype & XPR_IMMEDIATE == XPR_FLT,
                    exp12[1].etype & XPR_IMMEDIATE == XPR_FLT,
                ];
                for i in 0..2 {
                    if isfloat[1 - i] && !isfloat[i] {
                        exp12[i].value = Value::from_d(exp12[i].value.i() as f64);
                        isfloat[i] = true;
                    }
                }
                if op == '+' as u32 || op == '-' as u32 {
                    let mut sign = match exp12[0].instruction {
                        II_ADD | II_SUB_REV | 0 => exp12[0].optionbits >> 1 & 1,
                        II_SUB => (exp12[0].optionbits >> 1 & 1) ^ 1,
                        II_ADD_ADD => exp12[0].optionbits >> 2 & 1,
                        _ => {
                            expr.set_error(Code::WrongOperands);
                            return expr;
                        }
                    };
                    if op == '-' as u32 {
                        sign ^= 1;
                    }
                    if exp12[1].instruction == II_SUB {
                        sign ^= 1;
                    }
                    if sign != 0 {
                        if isfloat[1] {
                            exp12[1].value =
                                Value::from_d(exp12[1].value.d() - exp12[0].value.d());
                        } else {
                            exp12[1].value =
                                Value::from_i(exp12[1].value.i().wrapping_sub(exp12[0].value.i()));
                        }
                    } else if isfloat[1] {
                        exp12[1].value = Value::from_d(exp12[1].value.d() + exp12[0].value.d());
                    } else {
                        exp12[1].value =
                            Value::from_i(exp12[1].value.i().wrapping_add(exp12[0].value.i()));
                    }
                    exp12[0].value = Value(0);
                    exp12[0].etype &= !(XPR_INT | XPR_FLT);
                    if exp12[0].instruction == II_ADD_ADD {
                        exp12[0].instruction = II_ADD;
                        exp12[0].optionbits &= !4;
                    } else {
                        exp12[0].instruction = 0;
                    }
                } else if op == '*' as u32 && exp12[0].instruction == II_MUL {
                    if isfloat[0] {
                        exp12[1].value = Value::from_d(exp12[1].value.d() * exp12[0].value.d());
                    } else {
                        exp12[1].value =
                            Value::from_i(exp12[1].value.i().wrapping_mul(exp12[0].value.i()));
                    }
                    exp12[0].value = Value(0);
                    exp12[0].etype &= !(XPR_INT | XPR_FLT | XPR_OP);
                    exp12[0].instruction = 0;
                } else {
                    expr.set_error(Code::WrongOperands);
                    return expr;
                }
            }

            let etyp0 = exp12[0].etype;
            let etyp1 = exp12[1].etype;
            if etyp0 & etyp1 & XPR_MEM != 0 {
                expr.set_error(Code::WrongOperands);
                return expr;
            }
            // count operands
            let regs = (etyp0 & XPR_REG1 != 0) as u32
                + (etyp0 & XPR_REG2 != 0) as u32
                + (etyp0 & XPR_REG3 != 0) as u32
                + (etyp1 & XPR_REG1 != 0) as u32
                + (etyp1 & XPR_REG2 != 0) as u32
                + (etyp1 & XPR_REG3 != 0) as u32
                + ((etyp0 | etyp1) & XPR_MEM != 0) as u32
                + ((etyp0 | etyp1) & XPR_IMMEDIATE != 0) as u32;
            if regs > 3 {
                expr.set_error(Code::TooManyOperands);
                return expr;
            }

            if !matches!(op as u8 as char, '+' | '*' | '&' | '|' | '^' | '-') {
                cannot_swap = true;
            }

            // put operands in the order register, memory, immediate
            let mut op = op;
            if exp12[0].etype & (XPR_IMMEDIATE | XPR_MEM) != 0
                && exp12[1].etype & XPR_IMMEDIATE == 0
                && !cannot_swap
            {
                if exp12[0].reg1 & exp12[1].reg1 & REG_V != 0 {
                    cannot_swap = true;
                } else if exp12[1].etype & XPR_MEM != 0 && op == '*' as u32 {
                    cannot_swap = true;
                } else {
                    exp12.swap(0, 1);
                    if op == '-' as u32 {
                        op = '+' as u32;
                        exp12[0].optionbits ^= 1;
                    }
                    swapped = true;
                }
            }

            if op == '+' as u32 || op == '-' as u32 {
                if (exp12[0].etype | exp12[1].etype) & XPR_OP == 0 {
                    // +/-R1 +/-R2
                    if op == '-' as u32 {
                        exp12[1].optionbits ^= 1;
                    }
                    // fold the sign into a constant where possible
                    if exp12[1].etype & XPR_INT != 0 && exp12[1].optionbits & 1 != 0 {
                        exp12[1].value = Value::from_i(-exp12[1].value.i());
                        exp12[1].optionbits = 0;
                    } else if exp12[1].etype & XPR_FLT != 0 && exp12[1].optionbits & 1 != 0 {
                        exp12[1].value = Value::from_d(-exp12[1].value.d());
                        exp12[1].optionbits = 0;
                    }
                    let s = exp12[0].optionbits | exp12[1].optionbits << 1;
                    expr = exp12[1];
                    expr.tokens = numtokens;
                    expr.reg1 = exp12[0].reg1;
                    if exp12[1].etype & XPR_REG1 != 0 {
                        expr.reg2 = exp12[1].reg1;
                        expr.etype |= XPR_REG2;
                    }
                    expr.etype |= XPR_OP | XPR_REG1;
                    expr.optionbits = 0;
                    match s & 3 {
                        0 => expr.instruction = II_ADD,
                        1 => expr.instruction = II_SUB_REV,
                        2 => expr.instruction = II_SUB,
                        _ => {
                            expr.instruction = II_ADD_ADD;
                            expr.value = Value(0);
                            expr.optionbits = s;
                            expr.etype |= XPR_INT | XPR_OPTIONS;
                        }
                    }
                    return expr;
                }
                if exp12[0].instruction == II_MUL || exp12[1].instruction == II_MUL {
                    // (A*B) + C
                    if op == '-' as u32 {
                        exp12[1].optionbits ^= 1;
                    }
                    if exp12[1].instruction == II_MUL {
                        if exp12[0].reg1 & REG_V != 0 {
                            expr.set_error(Code::CannotSwapVect);
                            return expr;
                        }
                        exp12.swap(0, 1);
                    }
                    expr = merge(&exp12[0], &exp12[1]);
                    expr.tokens = numtokens;
                    if exp12[0].etype & exp12[1].etype & (XPR_MEM | XPR_IMMEDIATE) != 0
                        || exp12[0].etype & (XPR_MEM | XPR_IMMEDIATE)
                            == XPR_MEM | XPR_IMMEDIATE
                    {
                        expr.set_error(Code::TooComplex);
                        return expr;
                    }
                    expr.instruction = II_MUL_ADD;
                    if (exp12[0].etype & XPR_MEM != 0 && exp12[1].etype & XPR_IMMEDIATE == 0)
                        || exp12[0].etype & XPR_IMMEDIATE != 0
                    {
                        expr.instruction = II_MUL_ADD2;
                    }
                    expr.etype |= XPR_OP | XPR_OPTIONS;
                    expr.reg1 = exp12[0].reg1;
                    expr.reg2 = exp12[0].reg2;
                    if exp12[1].etype & XPR_REG != 0 {
                        if exp12[0].etype & XPR_REG2 != 0 {
                            expr.reg3 = exp12[1].reg1;
                            expr.etype |= XPR_REG3;
                        } else {
                            expr.reg2 = exp12[1].reg1;
                            expr.etype |= XPR_REG2;
                        }
                    }
                    // bits 0-1: sign of the product, bits 2-3: sign of the addend
                    expr.optionbits =
                        3 * (exp12[0].optionbits & 1) | 0xC * (exp12[1].optionbits & 1);
                    return expr;
                }
                if exp12[0].instruction == II_ADD || exp12[0].instruction == II_SUB {
                    // (A+B) + C
                    expr = merge(&exp12[0], &exp12[1]);
                    expr.tokens = numtokens;
                    expr.reg1 = exp12[0].reg1;
                    expr.etype |= XPR_OP;
                    expr.instruction = II_ADD_ADD;
                    if exp12[0].etype & XPR_IMMEDIATE != 0
                        || (exp12[0].etype & XPR_MEM != 0 && exp12[1].etype & XPR_IMMEDIATE == 0)
                    {
                        expr.set_error(if cannot_swap {
                            Code::CannotSwapVect
                        } else {
                            Code::TooComplex
                        });
                        return expr;
                    }
                    if exp12[1].etype & XPR_REG != 0 {
                        if exp12[0].etype & XPR_REG2 != 0 {
                            expr.reg3 = exp12[1].reg1;
                            expr.etype |= XPR_REG3;
                        } else if exp12[0].etype & XPR_REG1 != 0 {
                            expr.reg2 = exp12[1].reg1;
                            expr.etype |= XPR_REG2;
                        } else {
                            expr.reg1 = exp12[1].reg1;
                            expr.etype |= XPR_REG1;
                        }
                    }
                    expr.optionbits = (exp12[0].optionbits & 3)
                        | ((exp12[1].optionbits & 1) ^ (op == '-' as u32) as u8) << 2;
                    if exp12[0].instruction == II_SUB {
                        expr.optionbits ^= 2;
                    }
                    if swapped && op == '-' as u32 {
                        expr.optionbits ^= 7;
                    }
                    expr.etype |= XPR_OPTIONS;
                    return expr;
                }
                if exp12[1].instruction == II_ADD || exp12[1].instruction == II_SUB {
                    // A + (B+C)
                    expr = merge(&exp12[0], &exp12[1]);
                    expr.tokens = numtokens;
                    expr.reg1 = exp12[0].reg1;
                    expr.etype |= XPR_OP;
                    expr.instruction = II_ADD_ADD;
                    if exp12[0].etype & exp12[1].etype & (XPR_IMMEDIATE | XPR_MEM) != 0 {
                        expr.set_error(Code::TooComplex);
                        return expr;
                    }
                    if exp12[0].etype & XPR_MEM != 0 {
                        // A = memory, B = register, C = immediate
                        expr.optionbits = ((exp12[1].optionbits & 1)
                            ^ (op == '-' as u32) as u8)
                            | (exp12[0].optionbits & 1) << 1
                            | ((exp12[1].optionbits >> 1 & 1) ^ (op == '-' as u32) as u8) << 2;
                        if exp12[1].instruction == II_SUB {
                            expr.optionbits ^= 4;
                        }
                        if swapped && op == '-' as u32 {
                            expr.optionbits ^= 7;
                        }
                        expr.reg1 = exp12[1].reg1;
                        expr.etype |= XPR_OPTIONS;
                        return expr;
                    }
                    if exp12[1].etype & XPR_REG2 != 0 {
                        expr.reg2 = exp12[1].reg1;
                        expr.reg3 = exp12[1].reg2;
                        expr.etype |= XPR_REG2 | XPR_REG3;
                    } else if exp12[1].etype & XPR_REG1 != 0 {
                        expr.reg2 = exp12[1].reg1;
                        expr.etype |= XPR_REG2;
                    }
                    expr.optionbits = (exp12[0].optionbits & 1)
                        | 6 * ((exp12[1].optionbits & 1) ^ (op == '-' as u32) as u8);
                    if exp12[1].instruction == II_SUB {
                        expr.optionbits ^= 4;
                    }
                    if swapped && op == '-' as u32 {
                        expr.optionbits ^= 7;
                    }
                    expr.etype |= XPR_OPTIONS;
                    return expr;
                }
            } else if (exp12[0].etype | exp12[1].etype) & XPR_OP == 0
                && (op == '*' as u32 || (op == '/' as u32 && !swapped))
            {
                // (+/- a) * (+/- b)
                expr = merge(&exp12[0], &exp12[1]);
                expr.etype |= XPR_OP;
                expr.tokens = numtokens;
                expr.optionbits = exp12[0].optionbits ^ exp12[1].optionbits;
                if expr.optionbits & 1 != 0 {
                    if exp12[1].etype & 0xF == XPR_FLT {
                        expr.value = Value::from_d(-exp12[1].value.d());
                        expr.optionbits = 0;
                    } else if exp12[1].etype & 0xF == XPR_INT {
                        expr.value = Value::from_i(-exp12[1].value.i());
                        expr.optionbits = 0;
                    } else if op == '*' as u32 && expr.value.i() == 0 {
                        // -a*b becomes -a*b + 0
                        expr.instruction = II_MUL_ADD;
                        expr.optionbits = 3;
                        expr.reg1 = exp12[0].reg1;
                        if exp12[1].etype & XPR_REG1 != 0 {
                            expr.reg2 = exp12[1].reg1;
                            expr.etype |= XPR_REG2;
                        }
                        expr.etype |= XPR_INT | XPR_OPTIONS;
                        return expr;
                    } else {
                        expr.set_error(Code::TooComplex);
                        return expr;
                    }
                }
                expr.reg1 = exp12[0].reg1;
                if exp12[1].etype & XPR_REG1 != 0 {
                    expr.reg2 = exp12[1].reg1;
                    expr.etype |= XPR_REG2;
                }
                expr.instruction = if op == '*' as u32 { II_MUL } else { II_DIV };
                return expr;
            } else if exp12[0].etype & exp12[1].etype & XPR_INT != 0
                && (op == ('=' as u32 | D2) || op == ('!' as u32 | EQ))
                && exp12[0].value.i() == exp12[1].value.i()
                && (exp12[0].etype | exp12[1].etype) & (XPR_REG1 | XPR_REG2) == XPR_REG1
                && exp12[0].etype & exp12[1].etype & XPR_REG1 == 0
            {
                // (r1 & const) == const is a bit test
                expr = merge(&exp12[0], &exp12[1]);
                expr.etype |= XPR_OP | XPR_OPTIONS | XPR_REG1;
                expr.reg1 = exp12[0].reg1 | exp12[1].reg1;
                expr.tokens = numtokens;
                expr.instruction = II_TEST_BITS_AND;
                if op == ('!' as u32 | EQ) {
                    expr.optionbits ^= 1;
                }
                return expr;
            } else if op == ('&' as u32 | D2)
                || op == ('|' as u32 | D2)
                || op == '^' as u32
                || op == ('^' as u32 | D2)
            {
                // combine a compare with an extra boolean operand
                let swap = (exp12[1].instruction != 0) as usize;
                expr = exp12[swap];
                if expr.instruction == II_COMPARE
                    && exp12[1 - swap].etype == XPR_REG | XPR_REG1
                {
                    expr.optionbits |= match op & 0xFF {
                        x if x == '&' as u32 => 0x10,
                        x if x == '|' as u32 => 0x20,
                        _ => 0x30,
                    };
                    expr.etype |= XPR_OP | XPR_OPTIONS | XPR_FALLBACK;
                    expr.tokens = numtokens;
                    expr.fallback = exp12[1 - swap].reg1;
                    return expr;
                }
            }
        }

        // not a complex expression: a plain two-operand instruction
        let mut op = op;
        if ex1.etype & (XPR_IMMEDIATE | XPR_MEM) != 0
            && !(ex1.reg1 & REG_V != 0 || ex2.etype & XPR_IMMEDIATE != 0)
        {
            exp12 = [ex2, ex1];
            swapped = true;
        } else {
            exp12 = [ex1, ex2];
            swapped = false;
        }
        expr = merge(&exp12[0], &exp12[1]);
        expr.etype |= XPR_OP;
        expr.tokens = numtokens;
        expr.reg1 = exp12[0].reg1;
        expr.reg2 = exp12[1].reg1;
        if exp12[1].etype & XPR_REG1 != 0 {
            expr.etype |= XPR_REG2;
        }
        if expr.instruction != 0 {
            expr.set_error(Code::TooComplex);
            return expr;
        }
        let uns = op & OP_UNS != 0;
        op &= !OP_UNS;
        expr.instruction = match op {
            x if x == '+' as u32 => II_ADD,
            x if x == '-' as u32 => {
                if swapped {
                    II_SUB_REV
                } else {
                    II_SUB
                }
            }
            x if x == '*' as u32 => II_MUL,
            x if x == '/' as u32 => {
                let d = if swapped { II_DIV_REV } else { II_DIV };
                if uns {
                    d | 1
                } else {
                    d
                }
            }
            x if x == '%' as u32 => {
                if swapped {
                    expr.set_error(Code::WrongType);
                }
                if uns {
                    II_REM_U
                } else {
                    II_REM
                }
            }
            x if x == '&' as u32 || x == ('&' as u32 | D2) => II_AND,
            x if x == '|' as u32 || x == ('|' as u32 | D2) => II_OR,
            x if x == '^' as u32 || x == ('^' as u32 | D2) => II_XOR,
            x if x == '<' as u32 => {
                expr.optionbits = 2 ^ swapped as u8 | (uns as u8) << 3;
                expr.etype |= XPR_OPTIONS;
                II_COMPARE
            }
            x if x == ('<' as u32 | EQ) => {
                expr.optionbits = 5 ^ swapped as u8 | (uns as u8) << 3;
                expr.etype |= XPR_OPTIONS;
                II_COMPARE
            }
            x if x == '>' as u32 => {
                expr.optionbits = 4 ^ swapped as u8 | (uns as u8) << 3;
                expr.etype |= XPR_OPTIONS;
                II_COMPARE
            }
            x if x == ('>' as u32 | EQ) => {
                expr.optionbits = 3 ^ swapped as u8 | (uns as u8) << 3;
                expr.etype |= XPR_OPTIONS;
                II_COMPARE
            }
            x if x == ('=' as u32 | D2) => {
                expr.optionbits = 0;
                II_COMPARE
            }
            x if x == ('!' as u32 | EQ) => {
                expr.optionbits = 1;
                expr.etype |= XPR_OPTIONS;
                if expr.reg1 & REG_V != 0 && self.data_type & TYP_FLOAT != 0 {
                    expr.optionbits |= 8; // float not-equal includes unordered
                }
                II_COMPARE
            }
            x if x == ('<' as u32 | D2) => {
                if swapped {
                    expr.set_error(Code::WrongType);
                }
                II_SHIFT_LEFT
            }
            x if x == ('>' as u32 | D2) => {
                if swapped {
                    expr.set_error(Code::WrongType);
                }
                if uns {
                    II_SHIFT_RIGHT_U
                } else {
                    II_SHIFT_RIGHT_S
                }
            }
            x if x == ('>' as u32 | D3) => {
                if swapped {
                    expr.set_error(Code::WrongType);
                }
                II_SHIFT_RIGHT_U
            }
            _ => {
                expr.set_error(Code::WrongType);
                0
            }
        };
        expr
    }

    /// Both operands are inside brackets, or at least one is not a pure
    /// constant: accumulate a memory operand.
    fn op2_memory(&mut self, op: u32, mut exp1: Expression, mut exp2: Expression) -> Expression {
        let numtokens = exp1.tokens + exp2.tokens + 1;

        if (exp1.etype | exp2.etype)
            & (XPR_IMMEDIATE
                | XPR_BASE
                | XPR_INDEX
                | XPR_OPTION
                | XPR_SYM1
                | XPR_SYM2
                | XPR_LIMIT
                | XPR_LENGTH
                | XPR_BROADC)
            == 0
        {
            // only integer offsets inside the brackets
            let mut expr = merge(&exp1, &exp2);
            expr.tokens = numtokens;
            expr.etype &= !XPR_OP;
            expr.instruction = 0;
            expr.offset_mem = match op {
                x if x == '+' as u32 => exp1.offset_mem.wrapping_add(exp2.offset_mem),
                x if x == '-' as u32 => exp1.offset_mem.wrapping_sub(exp2.offset_mem),
                x if x == '*' as u32 => exp1.offset_mem.wrapping_mul(exp2.offset_mem),
                x if x == '/' as u32 => {
                    if exp2.offset_mem == 0 {
                        expr.set_error(Code::Overflow);
                        return expr;
                    }
                    exp1.offset_mem / exp2.offset_mem
                }
                x if x == ('<' as u32 | D2) => exp1.offset_mem << (exp2.offset_mem & 31),
                x if x == ('>' as u32 | D2) => exp1.offset_mem >> (exp2.offset_mem & 31),
                x if x == ('>' as u32 | D3) => {
                    (exp1.offset_mem as u32 >> (exp2.offset_mem & 31)) as i32
                }
                _ => {
                    expr.set_error(Code::WrongType);
                    return expr;
                }
            };
            return expr;
        }

        if exp2.etype & XPR_SYM1 != 0 && op == '-' as u32 {
            // subtracting two symbol addresses
            if exp1.sym1 != 0 {
                exp2.sym2 = exp2.sym1;
                exp2.sym1 = 0;
                exp2.etype = (exp2.etype & !XPR_SYM1) | XPR_SYM2;
                if exp1.symscale1 == 0 {
                    exp1.symscale1 = 1;
                }
                if exp2.symscale1 == 0 {
                    exp2.symscale1 = 1;
                }
                if exp1.symscale1 != exp2.symscale1 || exp2.sym2 == 0 {
                    exp1.set_error(Code::ConflictType);
                    return exp1;
                }
            } else if exp1.sym3 != 0 {
                exp2.sym4 = exp2.sym3;
                exp2.sym3 = 0;
                exp2.etype = (exp2.etype & !XPR_SYM1) | XPR_SYM2;
                if exp1.symscale3 == 0 {
                    exp1.symscale3 = 1;
                }
                if exp2.symscale3 == 0 {
                    exp2.symscale3 = 1;
                }
                if exp1.symscale3 != exp2.symscale3 || exp2.sym4 == 0 {
                    exp1.set_error(Code::ConflictType);
                    return exp1;
                }
            } else {
                exp1.set_error(Code::ConflictType);
                return exp1;
            }
        }
        if exp1.etype
            & exp2.etype
            & (XPR_SYM1 | XPR_SYM2 | XPR_SYMSCALE | XPR_INDEX | XPR_LIMIT | XPR_LENGTH | XPR_BROADC)
            != 0
        {
            exp1.set_error(Code::MemComponentTwice);
            return exp1;
        }
        if (exp1.etype | exp2.etype) & (XPR_LIMIT | XPR_OFFSET) == XPR_LIMIT | XPR_OFFSET {
            exp1.set_error(Code::LimitAndOffset);
            return exp1;
        }

        if exp2.etype & XPR_BASE != 0 && (exp1.etype & XPR_BASE != 0 || op == '-' as u32) {
            // two registers, or a subtracted register: one becomes the index
            if exp2.base & REG_INDEX == REG_INDEX
                && exp1.etype & XPR_BASE != 0
                && exp2.etype & XPR_INDEX == 0
            {
                // the stack pointer cannot be an index; swap
                exp1.index = exp1.base;
                exp1.base = 0;
                exp1.etype = (exp1.etype & !XPR_BASE) | XPR_INDEX;
                exp1.scale = 1;
            } else {
                exp2.index = exp2.base;
                exp2.base = 0;
                exp2.etype = (exp2.etype & !XPR_BASE) | XPR_INDEX;
                exp2.scale = 1;
            }
        }

        let mut expr = merge(&exp1, &exp2);
        expr.tokens = numtokens;
        expr.value = Value(exp1.value.0.wrapping_add(exp2.value.0));
        expr.offset_mem = exp1.offset_mem.wrapping_add(exp2.offset_mem);
        expr.offset_jump = exp1.offset_jump.wrapping_add(exp2.offset_jump);
        expr.etype &= !XPR_OP;
        expr.instruction = 0;

        match op {
            x if x == '+' as u32 => {}
            x if x == ',' as u32 => {
                if exp1.value.0 != 0 && exp2.value.0 != 0 {
                    expr.set_error(Code::WrongType);
                    return expr;
                }
                if expr.etype & XPR_INDEX != 0 && expr.etype & (XPR_LENGTH | XPR_BROADC) != 0 {
                    if expr.scale == -1 {
                        if expr.index != expr.length {
                            expr.set_error(Code::NegIndexLength);
                            return expr;
                        }
                    } else {
                        expr.set_error(Code::IndexAndLength);
                        return expr;
                    }
                }
            }
            x if x == '-' as u32 => {
                expr.offset_mem = exp1.offset_mem.wrapping_sub(exp2.offset_mem);
                expr.offset_jump = exp1.offset_jump.wrapping_sub(exp2.offset_jump);
                expr.value = Value(exp1.value.0.wrapping_sub(exp2.value.0));
                if exp2.etype & XPR_INDEX != 0 {
                    expr.scale = -exp2.scale;
                } else if exp1.etype & XPR_SYM1 != 0 && exp2.etype & XPR_SYM2 != 0 {
                    // relocation domains must match
                    let s1 = self.find_symbol(if exp1.sym1 != 0 { exp1.sym1 } else { exp1.sym3 });
                    let s2 = self.find_symbol(if exp2.sym2 != 0 { exp2.sym2 } else { exp2.sym4 });
                    if let (Some(i1), Some(i2)) = (s1, s2) {
                        let o1 = self.symbols[i1].st_other;
                        let o2 = self.symbols[i2].st_other;
                        let t1 = self.symbols[i1].st_type;
                        let t2 = self.symbols[i2].st_type;
                        if o1 & o2 & felf::elf::STV_BASEPOINTER == 0
                            && !(t1 == STT_CONSTANT && t2 == STT_CONSTANT)
                        {
                            self.report_line(Code::RelocationDomain);
                        }
                    }
                }
                if exp2.etype & (XPR_SYM1 | XPR_SYMSCALE) != 0 {
                    expr.set_error(Code::WrongType);
                    return expr;
                }
            }
            x if x == ('<' as u32 | D2) || x == '*' as u32 => {
                // index << s  or  index * scale
                if x == ('<' as u32 | D2) {
                    exp2.offset_mem = 1i32.wrapping_shl(exp2.offset_mem as u32);
                }
                if exp1.etype & (XPR_INT | XPR_OFFSET) != 0
                    && exp2.etype & (XPR_BASE | XPR_INDEX) != 0
                {
                    std::mem::swap(&mut exp1, &mut exp2);
                }
                if exp1.etype & XPR_BASE != 0 && exp1.etype & XPR_INDEX == 0 {
                    exp1.index = exp1.base;
                    exp1.base = 0;
                    exp1.scale = 1;
                    exp1.etype = (exp1.etype & !XPR_BASE) | XPR_INDEX;
                }
                if exp2.etype & XPR_INT != 0 {
                    exp2.offset_mem = exp2.value.w() as i32;
                    exp2.value = Value(0);
                    exp2.etype = (exp2.etype & !XPR_INT) | XPR_OFFSET;
                }
                if exp1.etype & XPR_INDEX == 0
                    || exp2.etype & XPR_OFFSET == 0
                    || (exp1.etype | exp2.etype)
                        & (XPR_OPTION | XPR_SYM1 | XPR_SYM2 | XPR_LIMIT | XPR_LENGTH | XPR_BROADC)
                        != 0
                {
                    expr.set_error(Code::WrongType);
                    return expr;
                }
                let f = exp2.offset_mem as i64 * exp1.scale as i64;
                if f & (f - 1) != 0 || f == 0 || f > 16 {
                    // -1 is also rejected here; a negative index comes from
                    // subtraction, not multiplication
                    expr.set_error(Code::ScaleFactor);
                    return expr;
                }
                expr.base = exp1.base;
                expr.index = exp1.index;
                expr.scale = f as i8;
                expr.etype = exp1.etype | (exp2.etype & !(XPR_INT | XPR_OFFSET));
                expr.value = Value(0);
                expr.offset_mem = exp1.offset_mem;
            }
            x if x == ('>' as u32 | D2) || x == '/' as u32 => {
                // (sym1 - sym2) / scale
                if x == ('>' as u32 | D2) {
                    exp2.value = Value(1u64.wrapping_shl(exp2.value.w()));
                    exp2.offset_mem = 1i32.wrapping_shl(exp2.offset_mem as u32);
                }
                if exp2.etype & XPR_OFFSET != 0
                    && exp2.etype & (XPR_REG | XPR_INT | XPR_BASE) == 0
                {
                    // a constant inside brackets was read as an offset
                    exp2.value = Value::from_i(exp2.offset_mem as i64);
                    exp2.offset_mem = 0;
                    exp2.etype = (exp2.etype & !XPR_OFFSET) | XPR_INT;
                    expr.offset_mem = exp1.offset_mem;
                }
                if exp1.etype & XPR_SYM1 == 0
                    || exp2.etype & 0xF != XPR_INT
                    || (exp1.etype | exp2.etype)
                        & (XPR_REG | XPR_OPTION | XPR_LIMIT | XPR_LENGTH | XPR_BROADC)
                        != 0
                {
                    expr.set_error(Code::WrongType);
                    return expr;
                }
                let mut f = exp2.value.u();
                let memsym = exp1.sym1 != 0;
                if memsym && exp1.symscale1 != 0 {
                    f *= exp1.symscale1 as u64;
                }
                if !memsym && exp1.symscale3 != 0 {
                    f *= exp1.symscale3 as u64;
                }
                if f & (f - 1) != 0 || f == 0 || f > 16 {
                    expr.set_error(Code::ScaleFactor);
                    return expr;
                }
                if memsym {
                    expr.symscale1 = f as u8;
                } else {
                    expr.symscale3 = f as u8;
                }
                expr.etype = exp1.etype | (exp2.etype & !XPR_INT) | XPR_SYMSCALE;
                expr.value = exp1.value;
            }
            x if x == '=' as u32 => {
                // option = value
                if exp1.etype & XPR_OPTION == 0
                    || exp2.etype & (XPR_INT | XPR_BASE | XPR_REG) == 0
                    || (exp1.etype | exp2.etype)
                        & (XPR_SYM1 | XPR_SYM2 | XPR_REG2 | XPR_INDEX | XPR_LIMIT | XPR_LENGTH
                            | XPR_BROADC)
                        != 0
                {
                    expr.set_error(Code::WrongType);
                    return expr;
                }
                match exp1.value.w() {
                    OPT_LENGTH => {
                        if exp2.etype & XPR_REG1 != 0 && exp2.reg1 & REG_R != 0 {
                            expr.etype = XPR_LENGTH | XPR_MEM;
                            expr.length = exp2.reg1;
                        } else if exp2.etype & XPR_BASE != 0 && exp2.base & REG_CLASS == REG_R {
                            expr.etype = XPR_LENGTH | XPR_MEM;
                            expr.length = exp2.base;
                        } else {
                            expr.set_error(Code::WrongType);
                            return expr;
                        }
                        expr.base = 0;
                        expr.value = Value(0);
                    }
                    OPT_BROADCAST => {
                        if exp2.etype & XPR_BASE == 0 || exp2.base & REG_CLASS != REG_R {
                            expr.set_error(Code::WrongType);
                            return expr;
                        }
                        expr.etype = XPR_BROADC | XPR_MEM;
                        expr.length = exp2.base;
                        expr.base = 0;
                        expr.value = Value(0);
                    }
                    OPT_LIMIT => {
                        // a number inside brackets arrives as an offset
                        let limit = if exp2.etype & XPR_INT != 0 {
                            exp2.value
                        } else if exp2.etype & XPR_OFFSET != 0 {
                            Value(exp2.offset_mem as u32 as u64)
                        } else {
                            expr.set_error(Code::WrongType);
                            return expr;
                        };
                        if exp1.etype & XPR_OFFSET != 0 {
                            expr.set_error(Code::LimitAndOffset);
                            return expr;
                        }
                        expr.etype = XPR_LIMIT | XPR_MEM;
                        expr.offset_mem = 0;
                        expr.value = limit;
                    }
                    OPT_MASK => {
                        let reg = if exp2.etype & XPR_REG1 != 0 {
                            exp2.reg1
                        } else if exp2.etype & XPR_BASE != 0 {
                            exp2.base
                        } else {
                            expr.set_error(Code::MaskNotRegister);
                            return expr;
                        };
                        expr.etype = XPR_MASK | (expr.etype & XPR_MEM);
                        expr.mask = reg;
                        expr.reg1 = 0;
                        expr.base = 0;
                        expr.value = Value(0);
                    }
                    OPT_FALLBACK => {
                        let reg = if exp2.etype & XPR_REG1 != 0 {
                            exp2.reg1
                        } else if exp2.etype & XPR_BASE != 0 {
                            exp2.base
                        } else {
                            0
                        };
                        if reg != 0 && reg & REG_INDEX != REG_INDEX {
                            expr.fallback = reg;
                            expr.etype = XPR_FALLBACK | (expr.etype & XPR_MEM);
                            expr.reg1 = 0;
                            expr.base = 0;
                        } else if exp2.etype & XPR_IMMEDIATE != 0 && exp2.value.i() == 0 {
                            expr.fallback = (expr.mask & 0xF0) | REG_INDEX;
                            expr.etype = XPR_FALLBACK | (expr.etype & XPR_MEM);
                        } else {
                            expr.set_error(Code::FallbackWrong);
                            return expr;
                        }
                        expr.value = Value(0);
                    }
                    OPT_OPTIONS => {
                        if exp2.etype & 0xF == XPR_INT {
                            expr.etype = (expr.etype & !(XPR_IMMEDIATE | XPR_OPTION)) | XPR_OPTIONS;
                            expr.optionbits = exp2.value.0 as u8;
                            expr.value = Value(0);
                            return expr;
                        }
                        expr.set_error(Code::WrongType);
                        return expr;
                    }
                    _ => {
                        expr.set_error(Code::NotInsideMem);
                        return expr;
                    }
                }
            }
            _ => {
                expr.set_error(Code::WrongType);
                return expr;
            }
        }
        if expr.etype & XPR_INT != 0 && expr.etype & (XPR_SYM1 | XPR_INDEX) == 0 {
            // a value not used otherwise is an offset
            expr.offset_mem = expr.offset_mem.wrapping_add(expr.value.i() as i32);
            expr.value = Value(0);
            expr.etype = (expr.etype & !XPR_INT) | XPR_OFFSET;
        }
        expr
    }
}

/// Dyadic operator on two integer constants.
fn op2_int(op: u32, exp1: Expression, exp2: Expression) -> Expression {
    let mut expr = exp1;
    expr.tokens = exp1.tokens + exp2.tokens + 1;
    let a = exp1.value;
    let b = exp2.value;
    let uns = op & OP_UNS != 0;
    let v: Value = match op & !OP_UNS {
        x if x == '+' as u32 => Value(a.0.wrapping_add(b.0)),
        x if x == '-' as u32 => Value(a.0.wrapping_sub(b.0)),
        x if x == '*' as u32 => Value::from_i(a.i().wrapping_mul(b.i())),
        x if x == '/' as u32 || x == '%' as u32 => {
            if b.i() == 0 {
                expr.set_error(Code::Overflow);
                return expr;
            }
            let div = x == '/' as u32;
            if uns {
                Value(if div { a.u() / b.u() } else { a.u() % b.u() })
            } else {
                Value::from_i(if div { a.i() / b.i() } else { a.i() % b.i() })
            }
        }
        x if x == ('<' as u32 | D2) => Value(a.u().wrapping_shl(b.u() as u32)),
        x if x == ('>' as u32 | D2) => {
            if uns {
                Value(a.u().wrapping_shr(b.u() as u32))
            } else {
                Value::from_i(a.i().wrapping_shr(b.u() as u32))
            }
        }
        x if x == ('>' as u32 | D3) => Value(a.u().wrapping_shr(b.u() as u32)),
        x if x == '<' as u32 => Value((if uns { a.u() < b.u() } else { a.i() < b.i() }) as u64),
        x if x == ('<' as u32 | EQ) => {
            Value((if uns { a.u() <= b.u() } else { a.i() <= b.i() }) as u64)
        }
        x if x == '>' as u32 => Value((if uns { a.u() > b.u() } else { a.i() > b.i() }) as u64),
        x if x == ('>' as u32 | EQ) => {
            Value((if uns { a.u() >= b.u() } else { a.i() >= b.i() }) as u64)
        }
        x if x == ('=' as u32 | D2) => Value((a.0 == b.0) as u64),
        x if x == ('!' as u32 | EQ) => Value((a.0 != b.0) as u64),
        x if x == '&' as u32 => Value(a.0 & b.0),
        x if x == '|' as u32 => Value(a.0 | b.0),
        x if x == '^' as u32 => Value(a.0 ^ b.0),
        x if x == ('&' as u32 | D2) => Value((a.0 != 0 && b.0 != 0) as u64),
        x if x == ('|' as u32 | D2) => Value((a.0 != 0 || b.0 != 0) as u64),
        x if x == ('^' as u32 | D2) => Value(((a.0 != 0) ^ (b.0 != 0)) as u64),
        _ => {
            expr.set_error(Code::WrongType);
            return expr;
        }
    };
    expr.value = v;
    expr
}

/// Dyadic operator on floating point constants. Integers are converted.
fn op2_float(op: u32, mut exp1: Expression, mut exp2: Expression) -> Expression {
    let mut expr = exp1;
    expr.tokens = exp1.tokens + exp2.tokens + 1;
    if exp1.etype & 0xF == XPR_INT {
        exp1.value = Value::from_d(exp1.value.i() as f64);
        expr.etype = (expr.etype & !XPR_INT) | XPR_FLT;
    }
    if exp2.etype & 0xF == XPR_INT {
        exp2.value = Value::from_d(exp2.value.i() as f64);
        expr.etype = (expr.etype & !XPR_INT) | XPR_FLT;
    }
    let a = exp1.value.d();
    let b = exp2.value.d();
    match op {
        x if x == '+' as u32 => expr.value = Value::from_d(a + b),
        x if x == '-' as u32 => expr.value = Value::from_d(a - b),
        x if x == '*' as u32 => expr.value = Value::from_d(a * b),
        x if x == '/' as u32 => {
            if b == 0.0 {
                expr.set_error(Code::Overflow);
                return expr;
            }
            expr.value = Value::from_d(a / b);
        }
        x if x == '<' as u32 => {
            expr.value = Value((a < b) as u64);
            expr.etype = XPR_INT;
        }
        x if x == ('<' as u32 | EQ) => {
            expr.value = Value((a <= b) as u64);
            expr.etype = XPR_INT;
        }
        x if x == '>' as u32 => {
            expr.value = Value((a > b) as u64);
            expr.etype = XPR_INT;
        }
        x if x == ('>' as u32 | EQ) => {
            expr.value = Value((a >= b) as u64);
            expr.etype = XPR_INT;
        }
        x if x == ('=' as u32 | D2) => {
            expr.value = Value((a == b) as u64);
            expr.etype = XPR_INT;
        }
        x if x == ('!' as u32 | EQ) => {
            expr.value = Value((a != b) as u64);
            expr.etype = XPR_INT;
        }
        x if x == ('&' as u32 | D2) => {
            expr.value = Value((a != 0.0 && b != 0.0) as u64);
            expr.etype = XPR_INT;
        }
        x if x == ('|' as u32 | D2) => {
            expr.value = Value((a != 0.0 || b != 0.0) as u64);
            expr.etype = XPR_INT;
        }
        _ => {
            expr.set_error(Code::WrongType);
        }
    }
    expr
}
