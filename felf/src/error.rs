use std::error::Error as StdError;
use std::fmt;

/// Errors detected while reading or writing container files.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ElfError {
    /// Not a ForwardCom ELF file.
    FileType,
    /// A header record has an impossible size.
    RecordSize,
    /// An offset or index points outside the file.
    IndexRange,
    /// A name index points outside its string table.
    StringTable,
    /// The symbol table is missing or malformed.
    SymtabMissing,
    /// A library member is not a ForwardCom object file.
    LibraryMemberType(String),
    /// Not a library archive.
    LibraryFormat,
    /// An event handler section size is not a multiple of the record size.
    EventSize(String),
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ElfError::FileType => f.write_str("not a ForwardCom ELF file"),
            ElfError::RecordSize => f.write_str("invalid record size in file header"),
            ElfError::IndexRange => f.write_str("offset or index out of range"),
            ElfError::StringTable => f.write_str("string table index out of range"),
            ElfError::SymtabMissing => f.write_str("symbol table missing or malformed"),
            ElfError::LibraryMemberType(name) => {
                write!(f, "library member {} is not a ForwardCom object", name)
            }
            ElfError::LibraryFormat => f.write_str("not a library archive"),
            ElfError::EventSize(name) => {
                write!(f, "event section size not a multiple of the record size in {}", name)
            }
        }
    }
}

impl StdError for ElfError {}
