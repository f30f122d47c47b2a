//! Address parsing for debugger output
//!
//! Debuggers print addresses in a handful of shapes and the decoders need all
//! of them to collapse into one `u64`:
//!
//! - `0x00007ff8a1b2c3d4` / `0X7FF8A1B2C3D4`
//! - bare hex (`00007FF8A1B2C3D4`), as SOS prints stack pointers
//! - WinDbg's backtick split (`00007ff8`a1b2c3d4`)
//! - type annotations (`(MyApp.Foo) 0x000001d4a1b2c3d0`, `0x1000 <int>`)
//! - bracketed locations (`[0x1000]`, `{0x1000}`)

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// An opaque fixed-width address (stack pointer, instruction pointer, object).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub u64);

impl Address {
    /// Parse an address leniently; returns `None` when nothing hex-like remains.
    pub fn parse(text: &str) -> Option<Self> {
        parse_address(text).map(Address)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// Absolute distance between two addresses
    pub fn distance(self, other: Address) -> u64 {
        self.0.abs_diff(other.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Address(value)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(u64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(Address(n)),
            Repr::Text(s) => Address::parse(&s)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid address: {s}"))),
        }
    }
}

/// Parse a hex address out of a token that may carry decorations.
///
/// Returns `None` for empty input, for tokens with no hex digits, and for
/// values that do not fit in 64 bits.
pub fn parse_address(text: &str) -> Option<u64> {
    let token = strip_decorations(text)?;
    let token = token.replace('`', "");
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(&token);

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    // Padding may exceed 16 digits; only significant digits must fit
    let significant = digits.trim_start_matches('0');
    if significant.is_empty() {
        return Some(0);
    }
    if significant.len() > 16 {
        return None;
    }
    u64::from_str_radix(significant, 16).ok()
}

/// Pick the hex-looking token out of `text`, dropping brackets and annotations.
fn strip_decorations(text: &str) -> Option<String> {
    let trimmed = text.trim().trim_matches(|c| matches!(c, '[' | ']' | '{' | '}' | ','));

    // "(Type) 0x1234" and "0x1234 <int>": keep the first token that looks numeric
    let tokens: Vec<&str> = trimmed
        .split_whitespace()
        .map(|t| t.trim_matches(|c| matches!(c, '[' | ']' | '{' | '}' | '(' | ')' | ',' | ':')))
        .collect();

    // An explicit 0x wins over words that merely happen to be hex ("Face", "add")
    let candidate = tokens
        .iter()
        .find(|t| (t.starts_with("0x") || t.starts_with("0X")) && looks_like_address(t))
        .or_else(|| tokens.iter().find(|t| looks_like_address(t)))?;

    // "0x1234+0x10" style offsets keep only the base
    let base = candidate.split('+').next().unwrap_or(*candidate);
    Some(base.to_string())
}

fn looks_like_address(token: &str) -> bool {
    let token = token.replace('`', "");
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(&token);
    let digits = digits.split('+').next().unwrap_or(digits);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_hexdigit())
}

/// Normalize an address token to lowercase hex without prefix or leading zeros.
///
/// Used as a set key (visited exception objects, lock owners) where two
/// sources may print the same address with different padding.
pub fn normalize_address(text: &str) -> Option<String> {
    parse_address(text).map(|v| format!("{v:x}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prefixed() {
        assert_eq!(parse_address("0x7ff8a1b2c3d4"), Some(0x7ff8a1b2c3d4));
        assert_eq!(parse_address("0X7FF8A1B2C3D4"), Some(0x7ff8a1b2c3d4));
    }

    #[test]
    fn test_parse_bare_and_padded() {
        assert_eq!(parse_address("00007FF8A1B2C3D4"), Some(0x7ff8a1b2c3d4));
        assert_eq!(parse_address("000000E51A7FE6C8"), Some(0xe51a7fe6c8));
    }

    #[test]
    fn test_parse_windbg_backtick() {
        assert_eq!(parse_address("00007ff8`a1b2c3d4"), Some(0x7ff8a1b2c3d4));
    }

    #[test]
    fn test_parse_annotated() {
        assert_eq!(
            parse_address("(MyApp.Foo) 0x000001d4a1b2c3d0"),
            Some(0x1d4a1b2c3d0)
        );
        assert_eq!(parse_address("0x1000 <int>"), Some(0x1000));
        assert_eq!(parse_address("[0x1000]"), Some(0x1000));
        assert_eq!(parse_address("{0x1000}"), Some(0x1000));
    }

    #[test]
    fn test_parse_offset_suffix() {
        assert_eq!(parse_address("0x1000+0x20"), Some(0x1000));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_address(""), None);
        assert_eq!(parse_address("   "), None);
        assert_eq!(parse_address("<none>"), None);
        assert_eq!(parse_address("0x"), None);
        assert_eq!(parse_address("0x11112222333344445"), None);
    }

    #[test]
    fn test_parse_overlong_zero_padding() {
        assert_eq!(
            parse_address("0x00000000000000007fff1234"),
            Some(0x7fff1234)
        );
        assert_eq!(parse_address("000000000000000000000000"), Some(0));
        assert_eq!(
            parse_address("0000ffffffffffffffff"),
            Some(u64::MAX)
        );
    }

    #[test]
    fn test_normalize_address_padding() {
        assert_eq!(
            normalize_address("000001D4A1B2C3D0"),
            normalize_address("0x1d4a1b2c3d0")
        );
    }

    #[test]
    fn test_address_serde_as_hex_string() {
        let json = serde_json::to_string(&Address(0x80)).unwrap();
        assert_eq!(json, "\"0x0000000000000080\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Address(0x80));
        let number: Address = serde_json::from_str("128").unwrap();
        assert_eq!(number, Address(0x80));
    }
}
