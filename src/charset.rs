//! Character-set bridge between hub-declared encodings and UTF-8.
//!
//! Every hub carries a configured encoding label (UTF-8 when unset).
//! Legacy-protocol values additionally need `$`/`|` escaping, and the
//! modern protocol escapes whitespace and backslash inside field
//! values. Escape failures are reported, never silently dropped.

use std::fmt;

use encoding_rs::{Encoding, UTF_8};

/// Error for a malformed modern-protocol escape sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscapeError {
    /// A backslash followed by anything other than `s`, `n` or `\`.
    InvalidBackslash,
}

impl fmt::Display for EscapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscapeError::InvalidBackslash => write!(f, "invalid backslash escape"),
        }
    }
}

impl std::error::Error for EscapeError {}

fn lookup(label: &str) -> &'static Encoding {
    Encoding::for_label(label.as_bytes()).unwrap_or(UTF_8)
}

/// Decode hub-encoded bytes to UTF-8. Undecodable bytes are replaced,
/// not dropped.
pub fn decode(label: &str, bytes: &[u8]) -> String {
    let (text, _, _) = lookup(label).decode(bytes);
    text.into_owned()
}

/// Encode UTF-8 text into the hub's encoding. Unmappable characters
/// are substituted by the encoder.
pub fn encode(label: &str, text: &str) -> Vec<u8> {
    let (bytes, _, _) = lookup(label).encode(text);
    bytes.into_owned()
}

/// Escape `$` and `|` for inclusion in a legacy-protocol value.
pub fn nmdc_escape(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    for &b in input {
        match b {
            b'$' => out.extend_from_slice(b"&#36;"),
            b'|' => out.extend_from_slice(b"&#124;"),
            _ => out.push(b),
        }
    }
    out
}

/// Undo [`nmdc_escape`]. Unknown `&#..;` sequences pass through
/// unchanged, matching what hubs actually send.
pub fn nmdc_unescape(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i..].starts_with(b"&#36;") {
            out.push(b'$');
            i += 5;
        } else if input[i..].starts_with(b"&#124;") {
            out.push(b'|');
            i += 6;
        } else {
            out.push(input[i]);
            i += 1;
        }
    }
    out
}

/// Encode UTF-8 to the hub encoding and escape it for the legacy wire.
pub fn encode_and_escape(label: &str, text: &str) -> Vec<u8> {
    nmdc_escape(&encode(label, text))
}

/// Unescape a legacy wire value and decode it from the hub encoding.
pub fn unescape_and_decode(label: &str, bytes: &[u8]) -> String {
    decode(label, &nmdc_unescape(bytes))
}

/// Escape a value for a modern-protocol field (`\s`, `\n`, `\\`).
pub fn adc_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            ' ' => out.push_str("\\s"),
            '\n' => out.push_str("\\n"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out
}

/// Unescape a modern-protocol field value.
pub fn adc_unescape(text: &str) -> Result<String, EscapeError> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('s') => out.push(' '),
                Some('n') => out.push('\n'),
                Some('\\') => out.push('\\'),
                _ => return Err(EscapeError::InvalidBackslash),
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_roundtrip() {
        let text = "héllo wörld — ☃";
        assert_eq!(decode("utf-8", &encode("utf-8", text)), text);
        // unknown labels fall back to UTF-8
        assert_eq!(decode("no-such-charset", text.as_bytes()), text);
    }

    #[test]
    fn test_cp1252_roundtrip() {
        let text = "héllo";
        let bytes = encode("windows-1252", text);
        assert_eq!(bytes, b"h\xe9llo");
        assert_eq!(decode("windows-1252", &bytes), text);
    }

    #[test]
    fn test_decode_replaces_bad_bytes() {
        // 0xfe is not valid UTF-8; it must be replaced, not dropped
        let out = decode("utf-8", b"a\xfeb");
        assert_eq!(out, "a\u{fffd}b");
    }

    #[test]
    fn test_nmdc_escape_roundtrip() {
        let esc = nmdc_escape(b"a$b|c");
        assert_eq!(esc, b"a&#36;b&#124;c".to_vec());
        assert_eq!(nmdc_unescape(&nmdc_escape(b"x$y|z")), b"x$y|z".to_vec());
    }

    #[test]
    fn test_nmdc_unescape_passthrough() {
        assert_eq!(nmdc_unescape(b"a&#99;b"), b"a&#99;b".to_vec());
        assert_eq!(nmdc_unescape(b"&#36;&#124;"), b"$|".to_vec());
    }

    #[test]
    fn test_adc_escape() {
        assert_eq!(adc_escape("a b\nc\\d"), "a\\sb\\nc\\\\d");
        assert_eq!(adc_unescape("a\\sb\\nc\\\\d").unwrap(), "a b\nc\\d");
    }

    #[test]
    fn test_adc_unescape_invalid() {
        assert_eq!(adc_unescape("a\\x"), Err(EscapeError::InvalidBackslash));
        assert_eq!(adc_unescape("trailing\\"), Err(EscapeError::InvalidBackslash));
    }
}
