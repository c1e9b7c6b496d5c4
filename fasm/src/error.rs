//! Diagnostic codes and the error sink.
//!
//! Diagnostics are collected in report order; each carries the source
//! position of the offending token range. Reporting the same code at the
//! same position twice is idempotent.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Code {
    // syntax
    MissingExpression,
    BracketBegin,
    BracketEnd,
    QuestionMark,
    UnfinishedInstruction,
    WrongType,
    MemComponentTwice,
    LimitAndOffset,
    ScaleFactor,
    NegIndexLength,
    IndexAndLength,
    MaskNotRegister,
    FallbackWrong,
    NotInsideMem,
    UnexpectedToken,
    NotOpAmbiguous,
    ExpectJumpTarget,
    MixDataAndCode,
    CodeOutsideSection,
    SymbolRedefined,
    SymbolUndefined,
    CannotExport,

    // semantics
    TooComplex,
    TooManyOperands,
    TooFewOperands,
    CannotSwapVect,
    Overflow,
    ConflictType,
    ConflictOptions,
    WrongRegType,
    WrongOperands,
    OperandsWrongOrder,
    AlignmentError,
    JumpTargetMisalign,
    ConstantTooLarge,
    ImmediateTooLarge,
    OffsetTooLarge,
    LimitTooLarge,
    TooLargeForJump,
    PointerBase,
    LengthOptionMiss,
    MaskRegister,

    // fit
    NoInstructionFit,
    CannotHaveOption,
    CannotHaveFallback,
    ThreeOpAndFallback,
    ThreeOpAndMem,
    DestBroadcast,
    MissingDestination,
    NoDestination,
    VectorOption,
    MemWoBracket,
    NoBase,
    AbsRelocation,
    RelocationDomain,

    // warnings
    UnknownOption,
}

/// Every diagnostic code, for translating a code parked in an expression
/// value back to the enum.
pub const ALL_CODES: &[Code] = &[
    Code::MissingExpression,
    Code::BracketBegin,
    Code::BracketEnd,
    Code::QuestionMark,
    Code::UnfinishedInstruction,
    Code::WrongType,
    Code::MemComponentTwice,
    Code::LimitAndOffset,
    Code::ScaleFactor,
    Code::NegIndexLength,
    Code::IndexAndLength,
    Code::MaskNotRegister,
    Code::FallbackWrong,
    Code::NotInsideMem,
    Code::UnexpectedToken,
    Code::NotOpAmbiguous,
    Code::ExpectJumpTarget,
    Code::MixDataAndCode,
    Code::CodeOutsideSection,
    Code::SymbolRedefined,
    Code::SymbolUndefined,
    Code::CannotExport,
    Code::TooComplex,
    Code::TooManyOperands,
    Code::TooFewOperands,
    Code::CannotSwapVect,
    Code::Overflow,
    Code::ConflictType,
    Code::ConflictOptions,
    Code::WrongRegType,
    Code::WrongOperands,
    Code::OperandsWrongOrder,
    Code::AlignmentError,
    Code::JumpTargetMisalign,
    Code::ConstantTooLarge,
    Code::ImmediateTooLarge,
    Code::OffsetTooLarge,
    Code::LimitTooLarge,
    Code::TooLargeForJump,
    Code::PointerBase,
    Code::LengthOptionMiss,
    Code::MaskRegister,
    Code::NoInstructionFit,
    Code::CannotHaveOption,
    Code::CannotHaveFallback,
    Code::ThreeOpAndFallback,
    Code::ThreeOpAndMem,
    Code::DestBroadcast,
    Code::MissingDestination,
    Code::NoDestination,
    Code::VectorOption,
    Code::MemWoBracket,
    Code::NoBase,
    Code::AbsRelocation,
    Code::RelocationDomain,
    Code::UnknownOption,
];

impl Code {
    /// Diagnostics that never stop output generation.
    pub fn is_warning(self) -> bool {
        matches!(self, Code::UnknownOption)
    }

    pub fn text(self) -> &'static str {
        use Code::*;
        match self {
            MissingExpression => "expression expected",
            BracketBegin => "unmatched opening bracket",
            BracketEnd => "end bracket does not match begin bracket",
            QuestionMark => "'?' without matching ':'",
            UnfinishedInstruction => "unfinished instruction",
            WrongType => "wrong operand type",
            MemComponentTwice => "memory operand component specified twice",
            LimitAndOffset => "cannot have both offset and limit",
            ScaleFactor => "scale factor must be a power of 2, at most 16",
            NegIndexLength => "negative index and length must use the same register",
            IndexAndLength => "cannot have both index and vector length",
            MaskNotRegister => "mask must be a register",
            FallbackWrong => "fallback must be a register or zero",
            NotInsideMem => "option not allowed inside memory operand",
            UnexpectedToken => "unexpected token",
            NotOpAmbiguous => "'!' is ambiguous here",
            ExpectJumpTarget => "jump target expected",
            MixDataAndCode => "cannot mix code and data in one section",
            CodeOutsideSection => "code must be inside an executable section",
            SymbolRedefined => "symbol is already defined",
            SymbolUndefined => "symbol not defined",
            CannotExport => "symbol cannot be exported",
            TooComplex => "expression is too complex for a single instruction",
            TooManyOperands => "too many operands",
            TooFewOperands => "too few operands",
            CannotSwapVect => "cannot reorder vector operands",
            Overflow => "numeric overflow or division by zero",
            ConflictType => "conflicting types",
            ConflictOptions => "conflicting options",
            WrongRegType => "wrong register type",
            WrongOperands => "these operands cannot be combined",
            OperandsWrongOrder => "operands are in the wrong order",
            AlignmentError => "alignment must be a power of 2",
            JumpTargetMisalign => "jump target must be aligned to 4",
            ConstantTooLarge => "constant too large",
            ImmediateTooLarge => "immediate operand too large for any format",
            OffsetTooLarge => "address offset too large",
            LimitTooLarge => "limit too large",
            TooLargeForJump => "jump offset out of range",
            PointerBase => "r28-r30 as base need a 16-bit offset format",
            LengthOptionMiss => "vector memory operand needs a length option",
            MaskRegister => "mask must be register 0-6",
            NoInstructionFit => "no format of this instruction fits the operands",
            CannotHaveOption => "this instruction cannot have options",
            CannotHaveFallback => "this instruction cannot have a fallback",
            ThreeOpAndFallback => "three operands and a fallback do not fit",
            ThreeOpAndMem => "three registers and a memory operand do not fit",
            DestBroadcast => "destination cannot be a broadcast",
            MissingDestination => "destination expected",
            NoDestination => "this instruction has no destination",
            VectorOption => "vector option on non-vector operands",
            MemWoBracket => "memory reference needs brackets",
            NoBase => "memory operand has no base pointer",
            AbsRelocation => "absolute address not allowed here",
            RelocationDomain => "symbols belong to different relocation domains",
            UnknownOption => "unknown option ignored",
        }
    }
}

/// One reported diagnostic.
#[derive(Clone, Copy, Debug)]
pub struct Diagnostic {
    pub pos: usize,
    pub len: usize,
    pub line: u32,
    pub code: Code,
}

/// Collects diagnostics in report order.
#[derive(Default)]
pub struct ErrorReporter {
    pub diagnostics: Vec<Diagnostic>,
    errors: u32,
    warnings: u32,
    /// Set when the current source line has an error; the line then emits
    /// no bytes. Cleared by the pass driver at the start of each line.
    pub line_error: bool,
}

impl ErrorReporter {
    pub fn new() -> ErrorReporter {
        ErrorReporter::default()
    }

    pub fn report(&mut self, pos: usize, len: usize, line: u32, code: Code) {
        // idempotent per site
        if self
            .diagnostics
            .iter()
            .any(|d| d.pos == pos && d.code == code)
        {
            if !code.is_warning() {
                self.line_error = true;
            }
            return;
        }
        if code.is_warning() {
            self.warnings += 1;
        } else {
            self.errors += 1;
            self.line_error = true;
        }
        self.diagnostics.push(Diagnostic {
            pos,
            len,
            line,
            code,
        });
    }

    pub fn error_count(&self) -> u32 {
        self.errors
    }

    pub fn warning_count(&self) -> u32 {
        self.warnings
    }

    pub fn has_errors(&self) -> bool {
        self.errors != 0
    }
}

impl fmt::Display for ErrorReporter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for d in &self.diagnostics {
            writeln!(f, "line {}: {}", d.line, d.code.text())?;
        }
        Ok(())
    }
}
