//! Shared helpers for the command-line programs.

/// Parse an integer that may be given as decimal or `0x`-prefixed hex,
/// the way the drive manuals write object addresses.
pub fn parse_int(s: &str) -> Result<u32, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("invalid hex number `{s}`: {e}"))
    } else {
        s.parse()
            .map_err(|e| format!("invalid number `{s}`: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_and_hex() {
        assert_eq!(parse_int("42").unwrap(), 42);
        assert_eq!(parse_int("0x6040").unwrap(), 0x6040);
        assert_eq!(parse_int("0XD5").unwrap(), 0xD5);
        assert!(parse_int("zz").is_err());
        assert!(parse_int("0x").is_err());
    }
}
