//! UNIX `ar` style library archives.
//!
//! A library is an `ar` archive whose members are ForwardCom object files.
//! The first member may be a symbol index (name `/`), the long-names member
//! (`//`) holds member names longer than 15 characters. The symbol index
//! maps every exported symbol name to the file offset of its member.

use crate::container::Container;
use crate::error::ElfError;

const ARCHIVE_MAGIC: &[u8; 8] = b"!<arch>\n";
const MEMBER_HEADER_SIZE: usize = 60;

/// One member of an archive.
#[derive(Clone, Debug)]
pub struct Member {
    pub name: String,
    /// File offset of the member header.
    pub offset: u32,
    pub size: u32,
}

/// A loaded library archive with its symbol index.
pub struct Library {
    bytes: Vec<u8>,
    pub members: Vec<Member>,
    /// `(symbol name, member header offset)`, sorted by name.
    pub symbol_index: Vec<(String, u32)>,
    pub name: String,
    pub relinkable: bool,
}

fn parse_decimal(field: &[u8]) -> u32 {
    let s = std::str::from_utf8(field).unwrap_or("").trim();
    s.parse().unwrap_or(0)
}

impl Library {
    pub fn has_magic(bytes: &[u8]) -> bool {
        bytes.len() >= 8 && &bytes[..8] == ARCHIVE_MAGIC
    }

    /// Parse an archive, index its members and read the symbol table.
    pub fn read(bytes: Vec<u8>, name: &str) -> Result<Library, ElfError> {
        if !Library::has_magic(&bytes) {
            return Err(ElfError::LibraryFormat);
        }
        let mut lib = Library {
            bytes,
            members: Vec::new(),
            symbol_index: Vec::new(),
            name: name.to_string(),
            relinkable: false,
        };
        let mut long_names: Vec<u8> = Vec::new();
        let mut index_data: Vec<u8> = Vec::new();

        let mut pos = 8usize;
        while pos + MEMBER_HEADER_SIZE <= lib.bytes.len() {
            let header = &lib.bytes[pos..pos + MEMBER_HEADER_SIZE];
            if &header[58..60] != b"`\n" {
                return Err(ElfError::LibraryFormat);
            }
            let size = parse_decimal(&header[48..58]);
            let data_start = pos + MEMBER_HEADER_SIZE;
            if data_start + size as usize > lib.bytes.len() {
                return Err(ElfError::LibraryFormat);
            }
            let raw_name: Vec<u8> = header[0..16].to_vec();
            let name_field = String::from_utf8_lossy(&raw_name).trim_end().to_string();
            if name_field == "/" {
                index_data = lib.bytes[data_start..data_start + size as usize].to_vec();
            } else if name_field == "//" {
                long_names = lib.bytes[data_start..data_start + size as usize].to_vec();
            } else {
                let name = if let Some(rest) = name_field.strip_prefix('/') {
                    // long name: offset into the long-names member
                    let off: usize = rest.trim_end_matches('/').parse().unwrap_or(0);
                    let end = long_names[off..]
                        .iter()
                        .position(|&c| c == b'\n' || c == 0)
                        .map(|p| off + p)
                        .unwrap_or(long_names.len());
                    String::from_utf8_lossy(&long_names[off..end])
                        .trim_end_matches('/')
                        .to_string()
                } else {
                    name_field.trim_end_matches('/').to_string()
                };
                lib.members.push(Member {
                    name,
                    offset: pos as u32,
                    size,
                });
            }
            pos = data_start + size as usize;
            if pos % 2 != 0 {
                pos += 1; // members are 2-byte aligned
            }
        }

        // symbol index: count, offsets, then nul-terminated names
        if index_data.len() >= 4 {
            let count = u32::from_be_bytes([
                index_data[0],
                index_data[1],
                index_data[2],
                index_data[3],
            ]) as usize;
            let mut names_pos = 4 + count * 4;
            for i in 0..count {
                let o = 4 + i * 4;
                if o + 4 > index_data.len() {
                    break;
                }
                let member_offset = u32::from_be_bytes([
                    index_data[o],
                    index_data[o + 1],
                    index_data[o + 2],
                    index_data[o + 3],
                ]);
                let end = index_data[names_pos..]
                    .iter()
                    .position(|&c| c == 0)
                    .map(|p| names_pos + p)
                    .unwrap_or(index_data.len());
                let name = String::from_utf8_lossy(&index_data[names_pos..end]).to_string();
                names_pos = end + 1;
                lib.symbol_index.push((name, member_offset));
            }
        }
        lib.symbol_index.sort();
        Ok(lib)
    }

    /// Offset of the member exporting `name`, 0 if not found.
    pub fn find_symbol(&self, name: &str) -> u32 {
        match self
            .symbol_index
            .binary_search_by(|(n, _)| n.as_str().cmp(name))
        {
            Ok(i) => self.symbol_index[i].1,
            Err(_) => 0,
        }
    }

    /// Offset of the member with the given name, 0 if not found.
    pub fn find_member(&self, name: &str) -> u32 {
        self.members
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.offset)
            .unwrap_or(0)
    }

    pub fn member_name(&self, offset: u32) -> &str {
        self.members
            .iter()
            .find(|m| m.offset == offset)
            .map(|m| m.name.as_str())
            .unwrap_or("?")
    }

    pub fn member_data(&self, offset: u32) -> &[u8] {
        match self.members.iter().find(|m| m.offset == offset) {
            Some(m) => {
                let start = offset as usize + MEMBER_HEADER_SIZE;
                &self.bytes[start..start + m.size as usize]
            }
            None => &[],
        }
    }

    /// A library is a ForwardCom library iff every member is a ForwardCom
    /// object file.
    pub fn check_members(&self) -> Result<(), ElfError> {
        for m in &self.members {
            if !Container::has_magic(self.member_data(m.offset)) {
                return Err(ElfError::LibraryMemberType(m.name.clone()));
            }
        }
        Ok(())
    }
}

/// Build an archive from `(name, object bytes, exported symbol names)`
/// members. Produces a symbol index member and a long-names member when
/// needed.
pub fn build_library(members: &[(String, Vec<u8>, Vec<String>)]) -> Vec<u8> {
    // layout pass: compute member offsets to fill in the symbol index
    let mut long_names: Vec<u8> = Vec::new();
    let mut name_fields: Vec<String> = Vec::new();
    for (name, _, _) in members {
        let with_slash = format!("{}/", name);
        if with_slash.len() <= 16 {
            name_fields.push(with_slash);
        } else {
            name_fields.push(format!("/{}", long_names.len()));
            long_names.extend_from_slice(name.as_bytes());
            long_names.extend_from_slice(b"/\n");
        }
    }

    let mut index_names: Vec<u8> = Vec::new();
    let mut symbol_count = 0usize;
    for (_, _, symbols) in members {
        for s in symbols {
            index_names.extend_from_slice(s.as_bytes());
            index_names.push(0);
            symbol_count += 1;
        }
    }
    let mut index_size = 4 + symbol_count * 4 + index_names.len();
    if index_size % 2 != 0 {
        index_size += 1;
    }

    let mut offset = 8 + MEMBER_HEADER_SIZE + index_size;
    if !long_names.is_empty() {
        offset += MEMBER_HEADER_SIZE + long_names.len() + long_names.len() % 2;
    }
    let mut member_offsets = Vec::new();
    for (_, data, _) in members {
        member_offsets.push(offset as u32);
        offset += MEMBER_HEADER_SIZE + data.len() + data.len() % 2;
    }

    // emit
    let mut out = Vec::new();
    out.extend_from_slice(ARCHIVE_MAGIC);

    let mut index = Vec::new();
    index.extend_from_slice(&(symbol_count as u32).to_be_bytes());
    for ((_, _, symbols), &moff) in members.iter().zip(&member_offsets) {
        for _ in symbols {
            index.extend_from_slice(&moff.to_be_bytes());
        }
    }
    index.extend_from_slice(&index_names);
    if index.len() % 2 != 0 {
        index.push(b'\n');
    }
    write_member_header(&mut out, "/", index.len() as u32);
    out.extend_from_slice(&index);

    if !long_names.is_empty() {
        write_member_header(&mut out, "//", long_names.len() as u32);
        out.extend_from_slice(&long_names);
        if long_names.len() % 2 != 0 {
            out.push(b'\n');
        }
    }
    for ((_, data, _), field) in members.iter().zip(&name_fields) {
        write_member_header(&mut out, field, data.len() as u32);
        out.extend_from_slice(data);
        if data.len() % 2 != 0 {
            out.push(b'\n');
        }
    }
    out
}

fn write_member_header(out: &mut Vec<u8>, name: &str, size: u32) {
    let mut h = [b' '; MEMBER_HEADER_SIZE];
    h[..name.len().min(16)].copy_from_slice(&name.as_bytes()[..name.len().min(16)]);
    let date = b"0           ";
    h[16..28].copy_from_slice(date);
    h[28..34].copy_from_slice(b"0     ");
    h[34..40].copy_from_slice(b"0     ");
    h[40..48].copy_from_slice(b"100644  ");
    let size_field = format!("{:<10}", size);
    h[48..58].copy_from_slice(size_field.as_bytes());
    h[58..60].copy_from_slice(b"`\n");
    out.extend_from_slice(&h);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_read_archive() {
        let members = vec![
            (
                "alpha.ob".to_string(),
                vec![1u8, 2, 3],
                vec!["alpha_entry".to_string(), "alpha_helper".to_string()],
            ),
            (
                "a_member_with_a_long_name.ob".to_string(),
                vec![9u8, 8, 7, 6],
                vec!["beta_entry".to_string()],
            ),
        ];
        let bytes = build_library(&members);
        let lib = Library::read(bytes, "test.li").unwrap();
        assert_eq!(lib.members.len(), 2);
        assert_eq!(lib.members[0].name, "alpha.ob");
        assert_eq!(lib.members[1].name, "a_member_with_a_long_name.ob");

        let off = lib.find_symbol("beta_entry");
        assert_ne!(off, 0);
        assert_eq!(lib.member_name(off), "a_member_with_a_long_name.ob");
        assert_eq!(lib.member_data(off), &[9, 8, 7, 6]);
        assert_eq!(lib.find_symbol("gamma"), 0);
        let off1 = lib.find_symbol("alpha_helper");
        assert_eq!(lib.member_data(off1), &[1, 2, 3]);
    }
}
