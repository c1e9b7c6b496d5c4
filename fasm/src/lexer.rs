//! Tokenizer. The pest grammar splits the source into raw lexemes; this
//! module classifies them into the token stream consumed by the expression
//! evaluator and the line interpreter.

use fcpu::instructions::{self, II_JUMP_INSTR};
use fcpu::registers::register_from_name;
use fcpu::types::type_from_keyword;
use pest::Parser;
use pest_derive::Parser;

#[derive(Parser)]
#[grammar = "fasm.pest"]
pub struct SourceParser;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TokenKind {
    Operator,
    Number,
    Float,
    String,
    Char,
    /// Unclassified name; becomes `Symbol` once defined.
    Name,
    Symbol,
    Register,
    Option,
    Type,
    Instruction,
    Attribute,
    Directive,
    HllKeyword,
    Newline,
    End,
}

// operator id modifier bits
pub const D2: u32 = 0x100; // doubled, e.g. <<
pub const D3: u32 = 0x200; // tripled, e.g. >>>
pub const EQ: u32 = 0x400; // with '=' suffix, e.g. +=

// option keyword ids
pub const OPT_MASK: u32 = 1;
pub const OPT_FALLBACK: u32 = 2;
pub const OPT_LENGTH: u32 = 3;
pub const OPT_BROADCAST: u32 = 4;
pub const OPT_LIMIT: u32 = 5;
pub const OPT_SCALAR: u32 = 6;
pub const OPT_OPTIONS: u32 = 7;

// directive ids
pub const DIR_SECTION: u32 = 1;
pub const DIR_END: u32 = 2;
pub const DIR_PUBLIC: u32 = 3;
pub const DIR_EXTERN: u32 = 4;

// attribute ids
pub const ATT_ALIGN: u32 = 1;
pub const ATT_WEAK: u32 = 2;
pub const ATT_CONSTANT: u32 = 3;
pub const ATT_REGUSE: u32 = 4;
pub const ATT_FUNCTION: u32 = 5;
pub const ATT_READ: u32 = 6;
pub const ATT_WRITE: u32 = 7;
pub const ATT_EXEC: u32 = 8;
pub const ATT_UNINIT: u32 = 9;
pub const ATT_COMMUNAL: u32 = 10;
pub const ATT_RELINK: u32 = 11;

/// One token. `id` holds the operator code, register id, instruction id,
/// type code or name-string offset depending on the kind; `value` holds the
/// numeric value of number, float and character tokens.
#[derive(Clone, Copy, Debug)]
pub struct Token {
    pub kind: TokenKind,
    pub id: u32,
    pub priority: u8,
    pub pos: usize,
    pub len: usize,
    pub value: u64,
}

impl Token {
    fn new(kind: TokenKind, id: u32, pos: usize, len: usize) -> Token {
        Token {
            kind,
            id,
            priority: 0,
            pos,
            len,
            value: 0,
        }
    }
}

/// Operator id and split priority. Higher priority binds looser; the
/// expression evaluator splits at the highest priority found at bracket
/// depth zero.
fn operator_id(text: &str) -> (u32, u8) {
    let id = match text {
        "<<" => '<' as u32 | D2,
        ">>" => '>' as u32 | D2,
        ">>>" => '>' as u32 | D3,
        "==" => '=' as u32 | D2,
        "!=" => '!' as u32 | EQ,
        "<=" => '<' as u32 | EQ,
        ">=" => '>' as u32 | EQ,
        "&&" => '&' as u32 | D2,
        "||" => '|' as u32 | D2,
        "^^" => '^' as u32 | D2,
        "++" => '+' as u32 | D2,
        "--" => '-' as u32 | D2,
        "+=" => '+' as u32 | EQ,
        "-=" => '-' as u32 | EQ,
        "*=" => '*' as u32 | EQ,
        "/=" => '/' as u32 | EQ,
        "%=" => '%' as u32 | EQ,
        "&=" => '&' as u32 | EQ,
        "|=" => '|' as u32 | EQ,
        "^=" => '^' as u32 | EQ,
        "<<=" => '<' as u32 | D2 | EQ,
        ">>=" => '>' as u32 | D2 | EQ,
        ">>>=" => '>' as u32 | D3 | EQ,
        single => single.chars().next().unwrap() as u32,
    };
    let priority = match id {
        x if x == '(' as u32
            || x == ')' as u32
            || x == '[' as u32
            || x == ']' as u32
            || x == '{' as u32
            || x == '}' as u32
            || x == ':' as u32 =>
        {
            1
        }
        x if x == '!' as u32 || x == '~' as u32 => 3,
        x if x == '*' as u32 || x == '/' as u32 || x == '%' as u32 => 4,
        x if x == '+' as u32 || x == '-' as u32 => 5,
        x if x == ('<' as u32 | D2) || x == ('>' as u32 | D2) || x == ('>' as u32 | D3) => 6,
        x if x == '<' as u32
            || x == '>' as u32
            || x == ('<' as u32 | EQ)
            || x == ('>' as u32 | EQ) =>
        {
            7
        }
        x if x == ('=' as u32 | D2) || x == ('!' as u32 | EQ) => 8,
        x if x == '&' as u32 => 9,
        x if x == '^' as u32 => 10,
        x if x == '|' as u32 => 11,
        x if x == ('&' as u32 | D2) || x == ('^' as u32 | D2) => 12,
        x if x == ('|' as u32 | D2) => 13,
        x if x == '?' as u32 => 14,
        x if x == '=' as u32 || x & EQ != 0 => 15,
        x if x == ',' as u32 => 16,
        _ => 0, // ';' and ++/--
    };
    (id, priority)
}

fn classify_name(text: &str, pos: usize) -> Token {
    let len = text.len();
    if let Some(reg) = register_from_name(text) {
        return Token::new(TokenKind::Register, reg as u32, pos, len);
    }
    if let Some(t) = type_from_keyword(text) {
        return Token::new(TokenKind::Type, t as u32, pos, len);
    }
    let opt = match text {
        "mask" => OPT_MASK,
        "fallback" => OPT_FALLBACK,
        "length" => OPT_LENGTH,
        "broadcast" => OPT_BROADCAST,
        "limit" => OPT_LIMIT,
        "scalar" => OPT_SCALAR,
        "options" => OPT_OPTIONS,
        _ => 0,
    };
    if opt != 0 {
        return Token::new(TokenKind::Option, opt, pos, len);
    }
    let dir = match text {
        "section" => DIR_SECTION,
        "end" => DIR_END,
        "public" => DIR_PUBLIC,
        "extern" => DIR_EXTERN,
        _ => 0,
    };
    if dir != 0 {
        return Token::new(TokenKind::Directive, dir, pos, len);
    }
    let att = match text {
        "align" => ATT_ALIGN,
        "weak" => ATT_WEAK,
        "constant" => ATT_CONSTANT,
        "reguse" => ATT_REGUSE,
        "function" => ATT_FUNCTION,
        "read" => ATT_READ,
        "write" => ATT_WRITE,
        "execute" => ATT_EXEC,
        "uninitialized" => ATT_UNINIT,
        "communal" => ATT_COMMUNAL,
        "relinkable" => ATT_RELINK,
        _ => 0,
    };
    if att != 0 {
        return Token::new(TokenKind::Attribute, att, pos, len);
    }
    if text == "true" || text == "false" {
        return Token::new(TokenKind::HllKeyword, (text == "true") as u32, pos, len);
    }
    if let Some(ins) = instructions::instruction_by_name(text) {
        return Token::new(TokenKind::Instruction, ins.id, pos, len);
    }
    // partial jump mnemonics that merge with a preceding operation
    let jump_cond = match text {
        "jump_zero" => Some(instructions::OPJ_SUB_JZ),
        "jump_nzero" => Some(instructions::OPJ_SUB_JZ | 1),
        "jump_neg" => Some(instructions::OPJ_SUB_JNEG),
        "jump_nneg" => Some(instructions::OPJ_SUB_JNEG | 1),
        "jump_pos" => Some(instructions::OPJ_SUB_JPOS),
        "jump_npos" => Some(instructions::OPJ_SUB_JPOS | 1),
        "jump_overfl" => Some(instructions::OPJ_SUB_JOVFL),
        "jump_noverfl" => Some(instructions::OPJ_SUB_JOVFL | 1),
        "jump_borrow" => Some(instructions::OPJ_SUB_JBORROW),
        "jump_nborrow" => Some(instructions::OPJ_SUB_JBORROW | 1),
        _ => None,
    };
    if let Some(c) = jump_cond {
        return Token::new(TokenKind::Instruction, II_JUMP_INSTR | c, pos, len);
    }
    Token::new(TokenKind::Name, 0, pos, len)
}

fn parse_number(text: &str) -> u64 {
    let clean: String = text.chars().filter(|&c| c != '_').collect();
    if let Some(hex) = clean.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).unwrap_or(0)
    } else if let Some(bin) = clean.strip_prefix("0b") {
        u64::from_str_radix(bin, 2).unwrap_or(0)
    } else if let Some(oct) = clean.strip_prefix("0o") {
        u64::from_str_radix(oct, 8).unwrap_or(0)
    } else {
        clean.parse().unwrap_or(0)
    }
}

/// Pack the characters of a character literal into an integer, low byte
/// first, with `\n \r \t \0 \\` escapes.
fn pack_chars(body: &str) -> u64 {
    let mut value: u64 = 0;
    let mut j = 0;
    let mut escape = false;
    for c in body.chars() {
        if c == '\\' && !escape {
            escape = true;
            continue;
        }
        let c = if escape {
            match c {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                '0' => '\0',
                other => other,
            }
        } else {
            c
        };
        escape = false;
        value |= (c as u64 & 0xFF) << (j * 8);
        j += 1;
        if j == 8 {
            break;
        }
    }
    value
}

/// Process the escapes of a string literal body.
pub fn unescape_string(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut escape = false;
    for c in body.chars() {
        if c == '\\' && !escape {
            escape = true;
            continue;
        }
        let c = if escape {
            match c {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                '0' => '\0',
                other => other,
            }
        } else {
            c
        };
        escape = false;
        out.push(c);
    }
    out
}

/// Tokenize a whole source file. The token stream contains `Newline` tokens
/// at line boundaries and a final `End` token.
pub fn tokenize(source: &str) -> Result<Vec<Token>, pest::error::Error<Rule>> {
    let parsed = SourceParser::parse(Rule::file, source)?.next().unwrap();
    let mut tokens = Vec::new();
    for pair in parsed.into_inner() {
        let text = pair.as_str();
        let pos = pair.as_span().start();
        let len = text.len();
        let token = match pair.as_rule() {
            Rule::newline => Token::new(TokenKind::Newline, 0, pos, len),
            Rule::float_number => {
                let mut t = Token::new(TokenKind::Float, 0, pos, len);
                t.value = text.parse::<f64>().unwrap_or(f64::NAN).to_bits();
                t
            }
            Rule::hex_number | Rule::bin_number | Rule::oct_number | Rule::dec_number => {
                let mut t = Token::new(TokenKind::Number, 0, pos, len);
                t.value = parse_number(text);
                t
            }
            Rule::string_lit => Token::new(TokenKind::String, 0, pos + 1, len - 2),
            Rule::char_lit => {
                let mut t = Token::new(TokenKind::Char, 0, pos + 1, len - 2);
                t.value = pack_chars(&text[1..len - 1]);
                t
            }
            Rule::name => classify_name(text, pos),
            Rule::operator => {
                let (id, priority) = operator_id(text);
                let mut t = Token::new(TokenKind::Operator, id, pos, len);
                t.priority = priority;
                t
            }
            Rule::EOI => break,
            _ => continue,
        };
        tokens.push(token);
    }
    tokens.push(Token::new(TokenKind::End, 0, source.len(), 0));
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcpu::registers::{REG_R, REG_V};

    #[test]
    fn classification() {
        let tokens = tokenize("int32 r1 = r2 + 0x10 // comment\nv3").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Type);
        assert_eq!(tokens[1].kind, TokenKind::Register);
        assert_eq!(tokens[1].id, (REG_R | 1) as u32);
        assert_eq!(tokens[2].kind, TokenKind::Operator);
        assert_eq!(tokens[4].kind, TokenKind::Operator);
        assert_eq!(tokens[4].id, '+' as u32);
        assert_eq!(tokens[5].kind, TokenKind::Number);
        assert_eq!(tokens[5].value, 0x10);
        assert_eq!(tokens[6].kind, TokenKind::Newline);
        assert_eq!(tokens[7].id, (REG_V | 3) as u32);
    }

    #[test]
    fn multi_char_operators() {
        let tokens = tokenize("a >>> b << c != d").unwrap();
        assert_eq!(tokens[1].id, '>' as u32 | D3);
        assert_eq!(tokens[3].id, '<' as u32 | D2);
        assert_eq!(tokens[5].id, '!' as u32 | EQ);
        assert_eq!(tokens[1].priority, 6);
        assert_eq!(tokens[5].priority, 8);
    }

    #[test]
    fn literals() {
        let tokens = tokenize("'ab' \"x\\ny\" 3.5 12").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Char);
        assert_eq!(tokens[0].value, 0x6261);
        assert_eq!(tokens[1].kind, TokenKind::String);
        assert_eq!(tokens[2].kind, TokenKind::Float);
        assert_eq!(f64::from_bits(tokens[2].value), 3.5);
        assert_eq!(tokens[3].value, 12);
    }

    #[test]
    fn mnemonics() {
        let tokens = tokenize("add compare jump_nzero sub_jump_zero").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Instruction);
        assert_eq!(tokens[0].id, fcpu::instructions::II_ADD);
        assert_eq!(tokens[1].id, fcpu::instructions::II_COMPARE);
        assert_eq!(tokens[2].id, II_JUMP_INSTR | 1);
        assert_eq!(tokens[3].id, II_JUMP_INSTR);
    }
}
