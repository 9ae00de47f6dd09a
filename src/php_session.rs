//! PHP session-variable deserialization (spec §9 design note, §8
//! property 10).
//!
//! The web frontend stores its session state using PHP's
//! `session_encode` wire format, which a companion service reads back
//! in order to share login state with this crate's node sessions. The
//! grammar is a flat `key|type:value;` sequence at the top level, with
//! arrays recursing into `key;value;` pairs inside `{...}`. Every
//! length-prefixed field (string length, array element count) is
//! validated against the remaining buffer before any slice is taken —
//! the original C implementation calls out the unchecked version of
//! this as a Heartbleed-style bug, so this parser checks first.

use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq)]
pub enum PhpValue {
    Bool(bool),
    Number(i64),
    String(String),
    Array(Vec<(String, PhpValue)>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(pub String);

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "php session parse error: {}", self.0)
    }
}

impl std::error::Error for ParseError {}

fn err(msg: impl Into<String>) -> ParseError {
    ParseError(msg.into())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn expect(&mut self, want: u8) -> Result<(), ParseError> {
        match self.next() {
            Some(b) if b == want => Ok(()),
            Some(b) => Err(err(format!(
                "expected '{}' but found '{}' at position {}",
                want as char, b as char, self.pos - 1
            ))),
            None => Err(err(format!("expected '{}' but reached end of input", want as char))),
        }
    }

    /// Consumes a run of ASCII digits (with an optional leading `-`)
    /// and parses it as `i64`. Does not consume the terminator.
    fn take_int(&mut self) -> Result<i64, ParseError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(err("expected a number"));
        }
        std::str::from_utf8(&self.bytes[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| err("malformed integer"))
    }

    /// Consumes exactly one byte, interpreted as a boolean digit.
    fn take_bool_digit(&mut self) -> Result<bool, ParseError> {
        match self.next() {
            Some(b'0') => Ok(false),
            Some(b'1') => Ok(true),
            Some(b) => Err(err(format!("invalid boolean digit '{}'", b as char))),
            None => Err(err("expected a boolean digit, reached end of input")),
        }
    }

    /// Consumes a length-prefixed, quoted string: `N:"...."`. The
    /// length is validated against the remaining buffer before the
    /// slice is taken.
    fn take_length_prefixed_string(&mut self) -> Result<String, ParseError> {
        let len = self.take_int()?;
        if !(0..=65535).contains(&len) {
            return Err(err(format!("string length invalid or disallowed: {len}")));
        }
        let len = len as usize;
        self.expect(b':')?;
        self.expect(b'"')?;
        if len > self.remaining() {
            return Err(err(format!(
                "string length would take us out of bounds ({len} > {})",
                self.remaining()
            )));
        }
        let bytes = &self.bytes[self.pos..self.pos + len];
        let s = std::str::from_utf8(bytes).map_err(|_| err("string value is not valid UTF-8"))?.to_string();
        self.pos += len;
        self.expect(b'"')?;
        Ok(s)
    }

    /// Parses one `type:value` pair, common to both top-level entries
    /// and array elements. Does not consume a trailing separator.
    fn take_value(&mut self) -> Result<PhpValue, ParseError> {
        let vartype = self.next().ok_or_else(|| err("expected a type tag, reached end of input"))?;
        self.expect(b':')?;
        match vartype {
            b'b' => Ok(PhpValue::Bool(self.take_bool_digit()?)),
            b'i' => Ok(PhpValue::Number(self.take_int()?)),
            b's' => Ok(PhpValue::String(self.take_length_prefixed_string()?)),
            b'a' => {
                let count = self.take_int()?;
                if count < 0 {
                    return Err(err("array element count cannot be negative"));
                }
                self.expect(b':')?;
                self.expect(b'{')?;
                let entries = self.take_array_body(count as usize)?;
                self.expect(b'}')?;
                Ok(PhpValue::Array(entries))
            }
            other => Err(err(format!("unexpected type tag '{}'", other as char))),
        }
    }

    /// Array body: `count` key/value pairs, each `key;value;` with no
    /// `|` separator (unlike top-level entries). A key may itself be a
    /// bare number or string value rather than a dedicated key syntax;
    /// keys are always stringified (matching the original's choice to
    /// force array keys to strings).
    fn take_array_body(&mut self, count: usize) -> Result<Vec<(String, PhpValue)>, ParseError> {
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key_value = self.take_value()?;
            self.expect(b';')?;
            let key = match key_value {
                PhpValue::Number(n) => n.to_string(),
                PhpValue::String(s) => s,
                PhpValue::Bool(_) => return Err(err("boolean cannot be used for array key")),
                PhpValue::Array(_) => return Err(err("array cannot be used for array key")),
            };
            let value = self.take_value()?;
            self.expect(b';')?;
            entries.push((key, value));
        }
        Ok(entries)
    }
}

/// Parses a full session buffer: a flat sequence of `key|type:value;`
/// entries (spec §9 design note, §8 property 10).
pub fn deserialize(input: &str) -> Result<Vec<(String, PhpValue)>, ParseError> {
    let bytes = input.as_bytes();
    let mut entries = Vec::new();

    // Top-level keys are delimited by the first `|`, which cannot
    // appear inside a key itself.
    let mut start = 0usize;
    while start < bytes.len() {
        let Some(pipe_rel) = bytes[start..].iter().position(|&b| b == b'|') else {
            return Err(err("key has no value"));
        };
        let pipe = start + pipe_rel;
        let key = std::str::from_utf8(&bytes[start..pipe]).map_err(|_| err("key is not valid UTF-8"))?.to_string();
        if key.is_empty() {
            return Err(err("empty key"));
        }

        let mut cursor = Cursor { bytes, pos: pipe + 1 };
        let was_array = matches!(cursor.peek(), Some(b'a'));
        let value = cursor.take_value()?;
        // Arrays close with `}` and carry no trailing top-level `;`;
        // every other type requires one, though its absence at the
        // very end of the buffer is tolerated.
        if !was_array {
            match cursor.peek() {
                Some(b';') => {
                    cursor.pos += 1;
                }
                Some(_) => return Err(err("expected ';' after top-level value")),
                None => {}
            }
        }
        entries.push((key, value));
        start = cursor.pos;
    }

    Ok(entries)
}

fn serialize_value(out: &mut String, value: &PhpValue) {
    match value {
        PhpValue::Bool(b) => {
            let _ = write!(out, "b:{}", if *b { 1 } else { 0 });
        }
        PhpValue::Number(n) => {
            let _ = write!(out, "i:{n}");
        }
        PhpValue::String(s) => {
            let _ = write!(out, "s:{}:\"{s}\"", s.len());
        }
        PhpValue::Array(entries) => {
            let _ = write!(out, "a:{}:{{", entries.len());
            for (key, v) in entries {
                serialize_key(out, key);
                out.push(';');
                serialize_value(out, v);
                out.push(';');
            }
            out.push('}');
        }
    }
}

fn serialize_key(out: &mut String, key: &str) {
    match key.parse::<i64>() {
        Ok(n) if n.to_string() == key => {
            let _ = write!(out, "i:{n}");
        }
        _ => {
            let _ = write!(out, "s:{}:\"{key}\"", key.len());
        }
    }
}

/// Re-serializes a parsed variable list back to the same wire format
/// `deserialize` accepts (spec §8 property 10: round-trips byte-for-byte
/// for any input matching the documented grammar).
pub fn serialize(entries: &[(String, PhpValue)]) -> String {
    let mut out = String::new();
    for (key, value) in entries {
        out.push_str(key);
        out.push('|');
        serialize_value(&mut out, value);
        // Top-level arrays close with `}` and carry no trailing `;`
        // (mirrors `deserialize`'s top-level loop, which never consumes
        // one after an array either).
        if !matches!(value, PhpValue::Array(_)) {
            out.push(';');
        }
    }
    out
}

pub fn find<'a>(entries: &'a [(String, PhpValue)], name: &str) -> Option<&'a PhpValue> {
    entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scalar_entries() {
        let entries = deserialize("foo|b:1;string|s:3:\"123\";").unwrap();
        assert_eq!(find(&entries, "foo"), Some(&PhpValue::Bool(true)));
        assert_eq!(find(&entries, "string"), Some(&PhpValue::String("123".to_string())));
    }

    #[test]
    fn parses_nested_array() {
        let entries = deserialize("arr|a:3:{i:0;i:4;i:1;i:3;i:2;s:1:\"2\";}").unwrap();
        let PhpValue::Array(inner) = find(&entries, "arr").unwrap() else { panic!("expected array") };
        assert_eq!(find(inner, "0"), Some(&PhpValue::Number(4)));
        assert_eq!(find(inner, "2"), Some(&PhpValue::String("2".to_string())));
    }

    #[test]
    fn string_may_contain_pipe_and_quotes() {
        let entries = deserialize("testing|s:9:\"4|4test\"s\";").unwrap();
        // The length prefix governs the extent of the string, so embedded
        // `|` and `"` bytes inside it are not mistaken for delimiters.
        assert_eq!(entries.len(), 1);
        assert_eq!(find(&entries, "testing"), Some(&PhpValue::String("4|4test\"s".to_string())));
    }

    #[test]
    fn webmail_session_round_trips_shape() {
        let input = "webmail|a:3:{s:6:\"server\";s:9:\"localhost\";s:4:\"port\";i:143;s:6:\"secure\";b:0;}";
        let entries = deserialize(input).unwrap();
        let PhpValue::Array(inner) = find(&entries, "webmail").unwrap() else { panic!("expected array") };
        assert_eq!(find(inner, "port"), Some(&PhpValue::Number(143)));
        let reserialized = serialize(&entries);
        let reparsed = deserialize(&reserialized).unwrap();
        assert_eq!(entries, reparsed);
    }

    #[test]
    fn deserialize_then_serialize_is_byte_equal_for_canonical_input() {
        let input = "foo|b:1;string|s:3:\"123\";arr|a:3:{i:0;i:4;i:1;i:3;i:2;s:1:\"2\";}";
        let entries = deserialize(input).unwrap();
        assert_eq!(serialize(&entries), input);
    }

    #[test]
    fn oversized_string_length_is_rejected_without_overread() {
        let err = deserialize("x|s:9999:\"short\";").unwrap_err();
        assert!(err.0.contains("out of bounds"));
    }

    #[test]
    fn malformed_type_tag_errors_cleanly() {
        assert!(deserialize("x|z:1;").is_err());
    }

    #[test]
    fn missing_separator_errors_cleanly() {
        assert!(deserialize("x|b1;").is_err());
    }

    #[test]
    fn truncated_array_errors_instead_of_panicking() {
        assert!(deserialize("arr|a:5:{i:0;i:4;}").is_err());
    }
}
