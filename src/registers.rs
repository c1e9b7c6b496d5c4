/// Register identifiers.
///
/// A register id is a single byte: a 5-bit register index plus a class bit.
/// General purpose registers are `r0`-`r31`, vector registers `v0`-`v31`.
/// The last four general purpose registers double as pointer registers when
/// used as a memory base: r28 = `threadp`, r29 = `datap`, r30 = `ip`,
/// r31 = `sp`.

/// Class bit for general purpose registers.
pub const REG_R: u8 = 0x20;
/// Class bit for vector registers.
pub const REG_V: u8 = 0x40;
/// Mask covering the class bits of a register id.
pub const REG_CLASS: u8 = 0xE0;
/// Mask covering the index bits of a register id.
pub const REG_INDEX: u8 = 0x1F;

pub const REG_THREADP: u8 = REG_R | 28;
pub const REG_DATAP: u8 = REG_R | 29;
pub const REG_IP: u8 = REG_R | 30;
pub const REG_SP: u8 = REG_R | 31;

/// Parse a register name. Accepts `r0`-`r31`, `v0`-`v31` and the pointer
/// register aliases `sp`, `ip`, `datap`, `threadp`.
pub fn register_from_name(name: &str) -> Option<u8> {
    match name {
        "sp" => return Some(REG_SP),
        "ip" => return Some(REG_IP),
        "datap" => return Some(REG_DATAP),
        "threadp" => return Some(REG_THREADP),
        _ => {}
    }
    let (class, digits) = if let Some(d) = name.strip_prefix('r') {
        (REG_R, d)
    } else if let Some(d) = name.strip_prefix('v') {
        (REG_V, d)
    } else {
        return None;
    };
    let index: u32 = digits.parse().ok()?;
    if index > 31 || (digits.len() > 1 && digits.starts_with('0')) {
        return None;
    }
    Some(class | index as u8)
}

/// Name of a register id, for listings and diagnostics.
pub fn register_name(reg: u8) -> String {
    let index = reg & REG_INDEX;
    match reg {
        REG_SP => "sp".to_string(),
        REG_IP => "ip".to_string(),
        REG_DATAP => "datap".to_string(),
        REG_THREADP => "threadp".to_string(),
        _ if reg & REG_CLASS == REG_V => format!("v{}", index),
        _ => format!("r{}", index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_names() {
        assert_eq!(register_from_name("r0"), Some(REG_R));
        assert_eq!(register_from_name("r31"), Some(REG_SP));
        assert_eq!(register_from_name("v17"), Some(REG_V | 17));
        assert_eq!(register_from_name("sp"), Some(REG_SP));
        assert_eq!(register_from_name("datap"), Some(REG_DATAP));
        assert_eq!(register_from_name("r32"), None);
        assert_eq!(register_from_name("r01"), None);
        assert_eq!(register_from_name("x1"), None);
    }

    #[test]
    fn names_round_trip() {
        assert_eq!(register_name(REG_R | 5), "r5");
        assert_eq!(register_name(REG_V | 5), "v5");
        assert_eq!(register_name(REG_IP), "ip");
    }
}
