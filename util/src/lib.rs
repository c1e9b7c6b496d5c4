use std::{error::Error, fmt};

pub type Endian = byteorder::LittleEndian;

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ParseEnumError {
    pub value: String,
    pub enum_name: &'static str,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Failed to parse \"{}\" as {}.",
            &self.value, &self.enum_name
        )
    }
}

impl Error for ParseEnumError {
    fn description(&self) -> &str {
        "Failed to parse enum."
    }
}

pub trait EnumFromStr: Sized {
    fn from_str(s: &str) -> Result<Self, ParseEnumError>;
}

/// Index of the highest set bit, i.e. floor(log2(x)). Returns 0 for x = 0.
#[inline]
pub fn bit_scan_reverse(x: u64) -> u32 {
    if x == 0 {
        0
    } else {
        63 - x.leading_zeros()
    }
}

/// Index of the lowest set bit. Returns 0 for x = 0.
#[inline]
pub fn bit_scan_forward(x: u64) -> u32 {
    if x == 0 {
        0
    } else {
        x.trailing_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_scans() {
        assert_eq!(bit_scan_reverse(0), 0);
        assert_eq!(bit_scan_reverse(1), 0);
        assert_eq!(bit_scan_reverse(0x8000), 15);
        assert_eq!(bit_scan_reverse(0x8001), 15);
        assert_eq!(bit_scan_forward(0), 0);
        assert_eq!(bit_scan_forward(0x80), 7);
        assert_eq!(bit_scan_forward(0xC000_0000_0000_0000), 62);
    }
}
