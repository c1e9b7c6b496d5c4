//! Record types and constants of the ForwardCom ELF dialect.
//!
//! The file format is 64-bit little endian ELF with a few extensions: the
//! file header carries the three base pointers, section headers carry module
//! and library name indexes, symbols carry register use and unit size
//! information, and relocations carry an explicit reference symbol and a
//! structured relocation type.

use byteorder::ByteOrder;
use util::Endian;

pub const ELF_MAGIC: u32 = 0x464C_457F; // "\x7FELF"
pub const EI_CLASS_64: u8 = 2;
pub const EI_DATA_LSB: u8 = 1;
pub const EI_VERSION_CURRENT: u8 = 1;
pub const EI_OSABI_FORWARDCOM: u8 = 0xFE;
pub const EI_ABIVERSION_FORWARDCOM: u8 = 1;

pub const ET_REL: u16 = 1;
pub const ET_EXEC: u16 = 2;
pub const EM_FORWARDCOM: u16 = 0x137;

// file header flags
pub const EF_INCOMPLETE: u32 = 0x01; // unresolved symbols allowed
pub const EF_RELOCATE: u32 = 0x02; // file has load-time relocations
pub const EF_POSITION_DEPENDENT: u32 = 0x04;
pub const EF_RELINKABLE: u32 = 0x10;

// section types
pub const SHT_NULL: u32 = 0;
pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_RELA: u32 = 4;
pub const SHT_NOBITS: u32 = 8;
pub const SHT_COMDAT: u32 = 0x12;
/// Preserved in the file but not loaded, e.g. unsorted event lists.
pub const SHT_LIST: u32 = 0x1001;

/// Section types that take part in linking.
pub fn section_type_allocated(sh_type: u32) -> bool {
    matches!(sh_type, SHT_PROGBITS | SHT_NOBITS | SHT_COMDAT | SHT_LIST)
}

// section flags
pub const SHF_EXEC: u64 = 0x0001;
pub const SHF_WRITE: u64 = 0x0002;
pub const SHF_READ: u64 = 0x0004;
pub const SHF_ALLOC: u64 = 0x0010;
pub const SHF_IP: u64 = 0x0010_0000;
pub const SHF_DATAP: u64 = 0x0020_0000;
pub const SHF_THREADP: u64 = 0x0040_0000;
pub const SHF_MERGE: u64 = 0x0100_0000;
pub const SHF_STRINGS: u64 = 0x0200_0000;
pub const SHF_INFO_LINK: u64 = 0x0400_0000;
pub const SHF_EVENT_HND: u64 = 0x0800_0000;
pub const SHF_EXCEPTION_HND: u64 = 0x1000_0000;
pub const SHF_DEBUG_INFO: u64 = 0x2000_0000;
pub const SHF_COMMENT: u64 = 0x4000_0000;
pub const SHF_RELINK: u64 = 0x1_0000_0000;
pub const SHF_FIXED: u64 = 0x2_0000_0000;
pub const SHF_AUTOGEN: u64 = 0x4_0000_0000;
pub const SHF_BASEPOINTER: u64 = SHF_IP | SHF_DATAP | SHF_THREADP;
pub const SHF_PERMISSIONS: u64 = SHF_EXEC | SHF_WRITE | SHF_READ;

// symbol types
pub const STT_NOTYPE: u8 = 0;
pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;
pub const STT_SECTION: u8 = 3;
pub const STT_FILE: u8 = 4;
pub const STT_CONSTANT: u8 = 10;
pub const STT_VARIABLE: u8 = 11;
pub const STT_EXPRESSION: u8 = 12;

// symbol binding
pub const STB_LOCAL: u8 = 0;
pub const STB_GLOBAL: u8 = 1;
pub const STB_WEAK: u8 = 2;
/// Weak symbol used as both import and export in a relinkable file.
pub const STB_WEAK2: u8 = 4;
/// Matches both weak and strong in symbol searches.
pub const STB_IGNORE: u8 = 0x0F;
/// Symbol record is copied to the executable file.
pub const STB_EXE: u8 = 0x10;
pub const STB_UNRESOLVED: u8 = 0x20;

// st_other attribute bits
pub const STV_EXEC: u32 = SHF_EXEC as u32;
pub const STV_READ: u32 = SHF_READ as u32;
pub const STV_WRITE: u32 = SHF_WRITE as u32;
pub const STV_IP: u32 = SHF_IP as u32;
pub const STV_DATAP: u32 = SHF_DATAP as u32;
pub const STV_THREADP: u32 = SHF_THREADP as u32;
pub const STV_REGUSE: u32 = 0x0001_0000;
pub const STV_FLOAT: u32 = 0x0002_0000;
pub const STV_STRING: u32 = 0x0004_0000;
pub const STV_RELINK: u32 = 0x0008_0000;
pub const STV_AUTOGEN: u32 = 0x0080_0000;
pub const STV_SECT_ATTR: u32 = STV_IP | STV_DATAP | STV_THREADP | STV_EXEC;
pub const STV_BASEPOINTER: u32 = STV_IP | STV_DATAP | STV_THREADP;

// relocation kinds, stored in bits 16-23 of r_type
pub const R_FORW_ABS: u32 = 0x00 << 16;
pub const R_FORW_SELFREL: u32 = 0x01 << 16;
pub const R_FORW_IP_BASE: u32 = 0x02 << 16;
pub const R_FORW_DATAP: u32 = 0x03 << 16;
pub const R_FORW_THREADP: u32 = 0x04 << 16;
pub const R_FORW_REFP: u32 = 0x05 << 16;
pub const R_FORW_SYSFUNC: u32 = 0x10 << 16;
pub const R_FORW_SYSMODUL: u32 = 0x11 << 16;
pub const R_FORW_SYSCALL: u32 = 0x12 << 16;
pub const R_FORW_DATASTACK: u32 = 0x20 << 16;
pub const R_FORW_CALLSTACK: u32 = 0x21 << 16;
pub const R_FORW_REGUSE: u32 = 0x30 << 16;
pub const R_FORW_RELTYPEMASK: u32 = 0xFF << 16;

// relocation sizes, stored in bits 8-15 of r_type
pub const R_FORW_NONE: u32 = 0x00 << 8;
pub const R_FORW_8: u32 = 0x01 << 8;
pub const R_FORW_16: u32 = 0x02 << 8;
pub const R_FORW_24: u32 = 0x03 << 8;
pub const R_FORW_32: u32 = 0x04 << 8;
pub const R_FORW_64: u32 = 0x08 << 8;
pub const R_FORW_32LO: u32 = 0x10 << 8;
pub const R_FORW_32HI: u32 = 0x11 << 8;
pub const R_FORW_64LO: u32 = 0x12 << 8;
pub const R_FORW_64HI: u32 = 0x13 << 8;
pub const R_FORW_RELSIZEMASK: u32 = 0xFF << 8;

/// Scale factor, log2, in bits 0-3 of r_type.
pub const R_FORW_RELSCALEMASK: u32 = 0x0F;
/// Jump offsets are scaled by 4.
pub const R_FORW_SCALE4: u32 = 2;
/// The relocation must be applied by the loader.
pub const R_FORW_LOADTIME: u32 = 0x80;

pub const PT_LOAD: u32 = 1;

/// Relocation size field in bytes, 0 for the split forms.
pub fn relocation_size_bytes(r_type: u32) -> u32 {
    match r_type & R_FORW_RELSIZEMASK {
        R_FORW_8 => 1,
        R_FORW_16 | R_FORW_32LO | R_FORW_32HI => 2,
        R_FORW_24 => 3,
        R_FORW_32 | R_FORW_64LO | R_FORW_64HI => 4,
        R_FORW_64 => 8,
        _ => 0,
    }
}

pub const FILE_HEADER_SIZE: u32 = 96;
pub const SECTION_HEADER_SIZE: u32 = 96;
pub const PROGRAM_HEADER_SIZE: u32 = 56;
pub const SYMBOL_SIZE: u32 = 40;
pub const RELOCATION_SIZE: u32 = 32;
pub const EVENT_SIZE: u32 = 16;

/// ForwardCom ELF file header.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FileHeader {
    pub e_type: u16,
    pub e_flags: u32,
    pub e_entry: u64,
    pub e_ip_base: u64,
    pub e_datap_base: u64,
    pub e_threadp_base: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_phnum: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl FileHeader {
    pub fn write(&self, out: &mut Vec<u8>) {
        let mut b = [0u8; FILE_HEADER_SIZE as usize];
        Endian::write_u32(&mut b[0..4], ELF_MAGIC);
        b[4] = EI_CLASS_64;
        b[5] = EI_DATA_LSB;
        b[6] = EI_VERSION_CURRENT;
        b[7] = EI_OSABI_FORWARDCOM;
        b[8] = EI_ABIVERSION_FORWARDCOM;
        Endian::write_u16(&mut b[16..18], self.e_type);
        Endian::write_u16(&mut b[18..20], EM_FORWARDCOM);
        Endian::write_u32(&mut b[20..24], EI_VERSION_CURRENT as u32);
        Endian::write_u64(&mut b[24..32], self.e_entry);
        Endian::write_u64(&mut b[32..40], self.e_phoff);
        Endian::write_u64(&mut b[40..48], self.e_shoff);
        Endian::write_u32(&mut b[48..52], self.e_flags);
        Endian::write_u16(&mut b[52..54], FILE_HEADER_SIZE as u16);
        Endian::write_u16(&mut b[54..56], PROGRAM_HEADER_SIZE as u16);
        Endian::write_u16(&mut b[56..58], self.e_phnum);
        Endian::write_u16(&mut b[58..60], SECTION_HEADER_SIZE as u16);
        Endian::write_u16(&mut b[60..62], self.e_shnum);
        Endian::write_u16(&mut b[62..64], self.e_shstrndx);
        Endian::write_u64(&mut b[64..72], self.e_ip_base);
        Endian::write_u64(&mut b[72..80], self.e_datap_base);
        Endian::write_u64(&mut b[80..88], self.e_threadp_base);
        out.extend_from_slice(&b);
    }

    pub fn read(b: &[u8]) -> Option<FileHeader> {
        if b.len() < FILE_HEADER_SIZE as usize {
            return None;
        }
        if Endian::read_u32(&b[0..4]) != ELF_MAGIC
            || b[4] != EI_CLASS_64
            || b[5] != EI_DATA_LSB
            || Endian::read_u16(&b[18..20]) != EM_FORWARDCOM
        {
            return None;
        }
        Some(FileHeader {
            e_type: Endian::read_u16(&b[16..18]),
            e_entry: Endian::read_u64(&b[24..32]),
            e_phoff: Endian::read_u64(&b[32..40]),
            e_shoff: Endian::read_u64(&b[40..48]),
            e_flags: Endian::read_u32(&b[48..52]),
            e_phnum: Endian::read_u16(&b[56..58]),
            e_shnum: Endian::read_u16(&b[60..62]),
            e_shstrndx: Endian::read_u16(&b[62..64]),
            e_ip_base: Endian::read_u64(&b[64..72]),
            e_datap_base: Endian::read_u64(&b[72..80]),
            e_threadp_base: Endian::read_u64(&b[80..88]),
        })
    }
}

/// Section header with the ForwardCom extras `sh_module` and `sh_library`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SectionHeader {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_entsize: u32,
    pub sh_align: u32,
    pub sh_module: u32,
    pub sh_library: u32,
}

impl SectionHeader {
    pub fn write(&self, out: &mut Vec<u8>) {
        let mut b = [0u8; SECTION_HEADER_SIZE as usize];
        Endian::write_u32(&mut b[0..4], self.sh_name);
        Endian::write_u32(&mut b[4..8], self.sh_type);
        Endian::write_u64(&mut b[8..16], self.sh_flags);
        Endian::write_u64(&mut b[16..24], self.sh_addr);
        Endian::write_u64(&mut b[24..32], self.sh_offset);
        Endian::write_u64(&mut b[32..40], self.sh_size);
        Endian::write_u32(&mut b[40..44], self.sh_link);
        Endian::write_u32(&mut b[44..48], self.sh_entsize);
        Endian::write_u32(&mut b[48..52], self.sh_align);
        Endian::write_u32(&mut b[52..56], self.sh_module);
        Endian::write_u32(&mut b[56..60], self.sh_library);
        out.extend_from_slice(&b);
    }

    pub fn read(b: &[u8]) -> Option<SectionHeader> {
        if b.len() < SECTION_HEADER_SIZE as usize {
            return None;
        }
        Some(SectionHeader {
            sh_name: Endian::read_u32(&b[0..4]),
            sh_type: Endian::read_u32(&b[4..8]),
            sh_flags: Endian::read_u64(&b[8..16]),
            sh_addr: Endian::read_u64(&b[16..24]),
            sh_offset: Endian::read_u64(&b[24..32]),
            sh_size: Endian::read_u64(&b[32..40]),
            sh_link: Endian::read_u32(&b[40..44]),
            sh_entsize: Endian::read_u32(&b[44..48]),
            sh_align: Endian::read_u32(&b[48..52]),
            sh_module: Endian::read_u32(&b[52..56]),
            sh_library: Endian::read_u32(&b[56..60]),
        })
    }
}

/// Program header. During linking `p_paddr` carries
/// `first_section | section_count << 32`; the file writer replaces it.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u32,
}

impl ProgramHeader {
    pub fn write(&self, out: &mut Vec<u8>) {
        let mut b = [0u8; PROGRAM_HEADER_SIZE as usize];
        Endian::write_u32(&mut b[0..4], self.p_type);
        Endian::write_u32(&mut b[4..8], self.p_flags);
        Endian::write_u64(&mut b[8..16], self.p_offset);
        Endian::write_u64(&mut b[16..24], self.p_vaddr);
        Endian::write_u64(&mut b[24..32], self.p_paddr);
        Endian::write_u64(&mut b[32..40], self.p_filesz);
        Endian::write_u64(&mut b[40..48], self.p_memsz);
        Endian::write_u32(&mut b[48..52], self.p_align);
        out.extend_from_slice(&b);
    }

    pub fn read(b: &[u8]) -> Option<ProgramHeader> {
        if b.len() < PROGRAM_HEADER_SIZE as usize {
            return None;
        }
        Some(ProgramHeader {
            p_type: Endian::read_u32(&b[0..4]),
            p_flags: Endian::read_u32(&b[4..8]),
            p_offset: Endian::read_u64(&b[8..16]),
            p_vaddr: Endian::read_u64(&b[16..24]),
            p_paddr: Endian::read_u64(&b[24..32]),
            p_filesz: Endian::read_u64(&b[32..40]),
            p_memsz: Endian::read_u64(&b[40..48]),
            p_align: Endian::read_u32(&b[48..52]),
        })
    }
}

/// Extended symbol record.
///
/// The low half of `st_value` is the address or value; during address
/// assignment the high half temporarily carries the uncertainty magnitude.
/// `st_reguse1` doubles as scratch storage for the old symbol index while
/// symbols are sorted by address.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Symbol {
    pub st_name: u32,
    pub st_type: u8,
    pub st_bind: u8,
    pub st_other: u32,
    pub st_section: u32,
    pub st_value: u64,
    pub st_unitsize: u32,
    pub st_unitnum: u32,
    pub st_reguse1: u32,
    pub st_reguse2: u32,
}

impl Symbol {
    pub fn write(&self, out: &mut Vec<u8>) {
        let mut b = [0u8; SYMBOL_SIZE as usize];
        Endian::write_u32(&mut b[0..4], self.st_name);
        b[4] = self.st_type;
        b[5] = self.st_bind;
        Endian::write_u32(&mut b[8..12], self.st_other);
        Endian::write_u32(&mut b[12..16], self.st_section);
        Endian::write_u64(&mut b[16..24], self.st_value);
        Endian::write_u32(&mut b[24..28], self.st_unitsize);
        Endian::write_u32(&mut b[28..32], self.st_unitnum);
        Endian::write_u32(&mut b[32..36], self.st_reguse1);
        Endian::write_u32(&mut b[36..40], self.st_reguse2);
        out.extend_from_slice(&b);
    }

    pub fn read(b: &[u8]) -> Option<Symbol> {
        if b.len() < SYMBOL_SIZE as usize {
            return None;
        }
        Some(Symbol {
            st_name: Endian::read_u32(&b[0..4]),
            st_type: b[4],
            st_bind: b[5],
            st_other: Endian::read_u32(&b[8..12]),
            st_section: Endian::read_u32(&b[12..16]),
            st_value: Endian::read_u64(&b[16..24]),
            st_unitsize: Endian::read_u32(&b[24..28]),
            st_unitnum: Endian::read_u32(&b[28..32]),
            st_reguse1: Endian::read_u32(&b[32..36]),
            st_reguse2: Endian::read_u32(&b[36..40]),
        })
    }
}

/// Relocation record. `r_type` is laid out as
/// `kind << 16 | size << 8 | loadtime << 7 | scale`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Relocation {
    pub r_section: u32,
    pub r_offset: u64,
    pub r_type: u32,
    pub r_sym: u32,
    pub r_refsym: u32,
    pub r_addend: i32,
}

impl Relocation {
    pub fn write(&self, out: &mut Vec<u8>) {
        let mut b = [0u8; RELOCATION_SIZE as usize];
        Endian::write_u32(&mut b[0..4], self.r_section);
        Endian::write_u64(&mut b[8..16], self.r_offset);
        Endian::write_u32(&mut b[16..20], self.r_type);
        Endian::write_u32(&mut b[20..24], self.r_sym);
        Endian::write_u32(&mut b[24..28], self.r_refsym);
        Endian::write_i32(&mut b[28..32], self.r_addend);
        out.extend_from_slice(&b);
    }

    pub fn read(b: &[u8]) -> Option<Relocation> {
        if b.len() < RELOCATION_SIZE as usize {
            return None;
        }
        Some(Relocation {
            r_section: Endian::read_u32(&b[0..4]),
            r_offset: Endian::read_u64(&b[8..16]),
            r_type: Endian::read_u32(&b[16..20]),
            r_sym: Endian::read_u32(&b[20..24]),
            r_refsym: Endian::read_u32(&b[24..28]),
            r_addend: Endian::read_i32(&b[28..32]),
        })
    }
}

/// One record of an event handler table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Event {
    pub key: u32,
    pub event_id: u32,
    pub priority: u32,
    pub functionp: u32,
}

impl Event {
    pub fn write(&self, out: &mut Vec<u8>) {
        let mut b = [0u8; EVENT_SIZE as usize];
        Endian::write_u32(&mut b[0..4], self.key);
        Endian::write_u32(&mut b[4..8], self.event_id);
        Endian::write_u32(&mut b[8..12], self.priority);
        Endian::write_u32(&mut b[12..16], self.functionp);
        out.extend_from_slice(&b);
    }

    pub fn read(b: &[u8]) -> Option<Event> {
        if b.len() < EVENT_SIZE as usize {
            return None;
        }
        Some(Event {
            key: Endian::read_u32(&b[0..4]),
            event_id: Endian::read_u32(&b[4..8]),
            priority: Endian::read_u32(&b[8..12]),
            functionp: Endian::read_u32(&b[12..16]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let h = FileHeader {
            e_type: ET_EXEC,
            e_flags: EF_RELINKABLE,
            e_entry: 0x1000,
            e_ip_base: 0x2000,
            e_datap_base: 0x3000,
            e_threadp_base: 0x4000,
            e_phoff: 96,
            e_shoff: 4096,
            e_phnum: 3,
            e_shnum: 9,
            e_shstrndx: 7,
        };
        let mut buf = Vec::new();
        h.write(&mut buf);
        assert_eq!(buf.len(), FILE_HEADER_SIZE as usize);
        assert_eq!(FileHeader::read(&buf), Some(h));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = Vec::new();
        FileHeader::default().write(&mut buf);
        buf[0] = b'M';
        assert_eq!(FileHeader::read(&buf), None);
    }

    #[test]
    fn record_round_trips() {
        let s = Symbol {
            st_name: 5,
            st_type: STT_FUNC,
            st_bind: STB_GLOBAL,
            st_other: STV_IP | STV_EXEC,
            st_section: 2,
            st_value: 0x40,
            st_unitsize: 4,
            st_unitnum: 1,
            st_reguse1: 0xF,
            st_reguse2: 0,
        };
        let mut buf = Vec::new();
        s.write(&mut buf);
        assert_eq!(Symbol::read(&buf), Some(s));

        let r = Relocation {
            r_section: 1,
            r_offset: 0x10,
            r_type: R_FORW_SELFREL | R_FORW_24 | R_FORW_SCALE4,
            r_sym: 3,
            r_refsym: 0,
            r_addend: -4,
        };
        let mut buf = Vec::new();
        r.write(&mut buf);
        assert_eq!(Relocation::read(&buf), Some(r));
        assert_eq!(relocation_size_bytes(r.r_type), 3);
    }
}
