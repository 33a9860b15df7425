//! Reader and writer for PHP's `serialize()` text format, the encoding WordPress
//! uses for structured post meta.
//!
//! Only the tags that can appear in post meta written by `update_post_meta` are
//! understood: `N`, `b`, `i`, `d`, `s`, `a` and `O`. References (`r`, `R`),
//! custom serializers (`C`) and enums (`E`) are rejected as malformed, which
//! callers treat as "leave this value alone".

use std::collections::HashMap;
use std::fmt::Write as _;

/// Maximum container nesting accepted by [`unserialize`]; PHP's default
/// `unserialize_max_depth`.
pub(crate) const MAX_DEPTH: usize = 4096;

// ── Value tree ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ArrayKey {
    Int(i64),
    Str(String),
}

impl ArrayKey {
    /// PHP array key semantics: `"12"` becomes `12`, while `"012"`, `"-0"` and
    /// `"1.5"` stay strings.
    pub(crate) fn from_str_key(key: &str) -> Self {
        if is_canonical_int(key) {
            if let Ok(n) = key.parse::<i64>() {
                return Self::Int(n);
            }
        }
        Self::Str(key.to_string())
    }
}

fn is_canonical_int(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return false;
    }
    !(s.starts_with('-') && digits == "0")
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<(ArrayKey, Value)>),
    Object {
        class: String,
        properties: Vec<(ArrayKey, Value)>,
    },
}

impl Value {
    /// Entries of an array. Objects are not arrays.
    pub(crate) fn entries(&self) -> Option<&[(ArrayKey, Value)]> {
        match self {
            Self::Array(entries) => Some(entries),
            _ => None,
        }
    }

    pub(crate) fn get(&self, key: &ArrayKey) -> Option<&Value> {
        self.entries()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}

// ── Errors ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum DecodeError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEnd(usize),
    #[error("unexpected {found:?} at byte {pos}")]
    Unexpected { pos: usize, found: char },
    #[error("invalid number at byte {0}")]
    InvalidNumber(usize),
    #[error("string at byte {0} is not valid UTF-8")]
    InvalidUtf8(usize),
    #[error("unsupported type tag {tag:?} at byte {pos}")]
    UnsupportedTag { pos: usize, tag: char },
    #[error("containers nested deeper than {0} levels")]
    TooDeep(usize),
    #[error("trailing data at byte {0}")]
    TrailingData(usize),
}

// ── Decoding ────────────────────────────────────────────────────────────

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn expect(&mut self, byte: u8) -> Result<(), DecodeError> {
        match self.bytes.get(self.pos) {
            Some(&b) if b == byte => {
                self.pos += 1;
                Ok(())
            }
            Some(&b) => Err(DecodeError::Unexpected {
                pos: self.pos,
                found: b as char,
            }),
            None => Err(DecodeError::UnexpectedEnd(self.pos)),
        }
    }

    /// Consume up to and including `stop`, returning the text before it.
    fn take_until(&mut self, stop: u8) -> Result<&'a str, DecodeError> {
        let start = self.pos;
        let rel = self.bytes[start..]
            .iter()
            .position(|&b| b == stop)
            .ok_or(DecodeError::UnexpectedEnd(self.bytes.len()))?;
        self.pos = start + rel + 1;
        std::str::from_utf8(&self.bytes[start..start + rel])
            .map_err(|_| DecodeError::InvalidUtf8(start))
    }

    fn read_int(&mut self, stop: u8) -> Result<i64, DecodeError> {
        let start = self.pos;
        let text = self.take_until(stop)?;
        text.parse().map_err(|_| DecodeError::InvalidNumber(start))
    }

    fn read_len(&mut self, stop: u8) -> Result<usize, DecodeError> {
        let start = self.pos;
        let text = self.take_until(stop)?;
        text.parse().map_err(|_| DecodeError::InvalidNumber(start))
    }

    /// `"<len bytes>"`; the length counts bytes, not characters.
    fn read_quoted(&mut self, len: usize) -> Result<String, DecodeError> {
        self.expect(b'"')?;
        let start = self.pos;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(DecodeError::UnexpectedEnd(self.bytes.len()))?;
        let text = std::str::from_utf8(&self.bytes[start..end])
            .map_err(|_| DecodeError::InvalidUtf8(start))?;
        self.pos = end;
        self.expect(b'"')?;
        Ok(text.to_string())
    }

    /// One scalar, or the header of a container up to and including `{`.
    fn token(&mut self) -> Result<Token, DecodeError> {
        let pos = self.pos;
        let tag = *self
            .bytes
            .get(pos)
            .ok_or(DecodeError::UnexpectedEnd(pos))?;
        self.pos += 1;
        if tag == b'N' {
            self.expect(b';')?;
            return Ok(Token::Scalar(Value::Null));
        }
        self.expect(b':')?;
        let scalar = match tag {
            b'b' => {
                let start = self.pos;
                match self.read_int(b';')? {
                    0 => Value::Bool(false),
                    1 => Value::Bool(true),
                    _ => return Err(DecodeError::InvalidNumber(start)),
                }
            }
            b'i' => Value::Int(self.read_int(b';')?),
            b'd' => {
                let start = self.pos;
                let text = self.take_until(b';')?;
                Value::Float(parse_float(text).ok_or(DecodeError::InvalidNumber(start))?)
            }
            b's' => {
                let len = self.read_len(b':')?;
                let text = self.read_quoted(len)?;
                self.expect(b';')?;
                Value::Str(text)
            }
            b'a' => {
                let count = self.read_len(b':')?;
                self.expect(b'{')?;
                return Ok(Token::Open { class: None, count });
            }
            b'O' => {
                let len = self.read_len(b':')?;
                let class = self.read_quoted(len)?;
                self.expect(b':')?;
                let count = self.read_len(b':')?;
                self.expect(b'{')?;
                return Ok(Token::Open {
                    class: Some(class),
                    count,
                });
            }
            other => {
                return Err(DecodeError::UnsupportedTag {
                    pos,
                    tag: other as char,
                });
            }
        };
        Ok(Token::Scalar(scalar))
    }

    fn key(&mut self) -> Result<ArrayKey, DecodeError> {
        let pos = self.pos;
        match self.bytes.get(pos) {
            Some(b'i') | Some(b's') => {}
            Some(&other) => {
                return Err(DecodeError::Unexpected {
                    pos,
                    found: other as char,
                });
            }
            None => return Err(DecodeError::UnexpectedEnd(pos)),
        }
        match self.token()? {
            Token::Scalar(Value::Int(n)) => Ok(ArrayKey::Int(n)),
            Token::Scalar(Value::Str(s)) => Ok(ArrayKey::from_str_key(&s)),
            _ => Err(DecodeError::Unexpected {
                pos,
                found: self.bytes[pos] as char,
            }),
        }
    }

    /// Decode one value with an explicit stack of open containers, so nesting
    /// depth costs heap, not call stack.
    fn parse(&mut self) -> Result<Value, DecodeError> {
        let mut open: Vec<Frame> = Vec::new();
        loop {
            let closed = match open.pop() {
                Some(frame) if frame.remaining == 0 => Some(frame),
                Some(frame) => {
                    open.push(frame);
                    None
                }
                None => None,
            };
            let (slot, value) = match closed {
                Some(frame) => {
                    self.expect(b'}')?;
                    frame.close()
                }
                None => {
                    let slot = match open.last_mut() {
                        Some(parent) => {
                            parent.remaining -= 1;
                            Some(self.key()?)
                        }
                        None => None,
                    };
                    match self.token()? {
                        Token::Scalar(value) => (slot, value),
                        Token::Open { class, count } => {
                            if open.len() >= MAX_DEPTH {
                                return Err(DecodeError::TooDeep(MAX_DEPTH));
                            }
                            // A declared count is untrusted; never reserve more than the input could hold.
                            let hint = count.min(self.bytes.len().saturating_sub(self.pos) / 4);
                            open.push(Frame {
                                slot,
                                class,
                                remaining: count,
                                entries: Vec::with_capacity(hint),
                                positions: HashMap::new(),
                            });
                            continue;
                        }
                    }
                }
            };
            match (open.last_mut(), slot) {
                (Some(parent), Some(key)) => parent.insert(key, value),
                _ => return Ok(value),
            }
        }
    }
}

enum Token {
    Scalar(Value),
    Open { class: Option<String>, count: usize },
}

/// A container whose entries are still being read.
struct Frame {
    /// Key under which the finished container lands in its parent.
    slot: Option<ArrayKey>,
    class: Option<String>,
    remaining: usize,
    entries: Vec<(ArrayKey, Value)>,
    positions: HashMap<ArrayKey, usize>,
}

impl Frame {
    fn insert(&mut self, key: ArrayKey, value: Value) {
        // Duplicate keys overwrite in place, as PHP does.
        match self.positions.get(&key).copied() {
            Some(idx) => self.entries[idx].1 = value,
            None => {
                self.positions.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    fn close(self) -> (Option<ArrayKey>, Value) {
        let value = match self.class {
            Some(class) => Value::Object {
                class,
                properties: self.entries,
            },
            None => Value::Array(self.entries),
        };
        (self.slot, value)
    }
}

fn parse_float(text: &str) -> Option<f64> {
    match text {
        "INF" => Some(f64::INFINITY),
        "-INF" => Some(f64::NEG_INFINITY),
        "NAN" => Some(f64::NAN),
        _ => text.parse().ok(),
    }
}

/// Decode one serialized value. Surrounding whitespace is ignored.
pub(crate) fn unserialize(input: &str) -> Result<Value, DecodeError> {
    let trimmed = input.trim();
    let mut parser = Parser {
        bytes: trimmed.as_bytes(),
        pos: 0,
    };
    let value = parser.parse()?;
    if parser.pos != parser.bytes.len() {
        return Err(DecodeError::TrailingData(parser.pos));
    }
    Ok(value)
}

/// WordPress `is_serialized()`: a cheap shape check, not a full parse.
pub(crate) fn is_serialized(data: &str, strict: bool) -> bool {
    let data = data.trim();
    if data == "N;" {
        return true;
    }
    let bytes = data.as_bytes();
    if bytes.len() < 4 || bytes[1] != b':' {
        return false;
    }
    if strict {
        let last = bytes[bytes.len() - 1];
        if last != b';' && last != b'}' {
            return false;
        }
    } else {
        let semicolon = data.find(';');
        let brace = data.find('}');
        if semicolon.is_none() && brace.is_none() {
            return false;
        }
        if semicolon.is_some_and(|i| i < 3) || brace.is_some_and(|i| i < 4) {
            return false;
        }
    }
    let rest = &bytes[2..];
    match bytes[0] {
        b's' => {
            let quoted = if strict {
                bytes[bytes.len() - 2] == b'"'
            } else {
                data.contains('"')
            };
            quoted && has_length_prefix(rest)
        }
        b'a' | b'O' | b'E' => has_length_prefix(rest),
        b'b' | b'i' | b'd' => is_scalar_body(rest, strict),
        _ => false,
    }
}

fn has_length_prefix(rest: &[u8]) -> bool {
    let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();
    digits > 0 && rest.get(digits) == Some(&b':')
}

fn is_scalar_body(rest: &[u8], strict: bool) -> bool {
    let len = rest
        .iter()
        .take_while(|b| b.is_ascii_digit() || matches!(b, b'.' | b'E' | b'+' | b'-'))
        .count();
    len > 0 && rest.get(len) == Some(&b';') && (!strict || len + 1 == rest.len())
}

/// WordPress `maybe_unserialize()`: serialized text is decoded, anything else
/// is a plain string value.
pub(crate) fn maybe_unserialize(raw: &str) -> Result<Value, DecodeError> {
    if is_serialized(raw, true) {
        unserialize(raw)
    } else {
        Ok(Value::Str(raw.to_string()))
    }
}

// ── Encoding ────────────────────────────────────────────────────────────

pub(crate) fn serialize(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("N;"),
        Value::Bool(b) => {
            let _ = write!(out, "b:{};", u8::from(*b));
        }
        Value::Int(n) => {
            let _ = write!(out, "i:{n};");
        }
        Value::Float(f) => {
            let _ = write!(out, "d:{};", format_float(*f));
        }
        Value::Str(s) => write_str(out, s),
        Value::Array(entries) => {
            let _ = write!(out, "a:{}:{{", entries.len());
            write_entries(out, entries);
            out.push('}');
        }
        Value::Object { class, properties } => {
            let _ = write!(
                out,
                "O:{}:\"{class}\":{}:{{",
                class.len(),
                properties.len()
            );
            write_entries(out, properties);
            out.push('}');
        }
    }
}

fn write_str(out: &mut String, s: &str) {
    let _ = write!(out, "s:{}:\"{s}\";", s.len());
}

fn write_entries(out: &mut String, entries: &[(ArrayKey, Value)]) {
    for (key, value) in entries {
        match key {
            ArrayKey::Int(n) => {
                let _ = write!(out, "i:{n};");
            }
            ArrayKey::Str(s) => write_str(out, s),
        }
        write_value(out, value);
    }
}

/// PHP's float text with `serialize_precision = -1`: shortest round-trip
/// digits, scientific notation outside `1e-4 ..= 1e15`.
pub(crate) fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "NAN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "INF" } else { "-INF" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }
    let exponent = value.abs().log10().floor() as i32;
    if (-4..15).contains(&exponent) {
        return format!("{value}");
    }
    let sci = format!("{value:e}");
    let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let mantissa = if mantissa.contains('.') {
        mantissa.to_string()
    } else {
        format!("{mantissa}.0")
    };
    let (sign, digits) = match exp.strip_prefix('-') {
        Some(digits) => ('-', digits),
        None => ('+', exp),
    };
    format!("{mantissa}E{sign}{digits}")
}

/// WordPress `maybe_serialize()` followed by the string cast `wpdb` applies
/// before writing. Strings that already look serialized are serialized again
/// so they survive the next `maybe_unserialize`.
pub(crate) fn maybe_serialize(value: &Value) -> String {
    match value {
        Value::Array(_) | Value::Object { .. } => serialize(value),
        Value::Str(s) if is_serialized(s, false) => serialize(value),
        Value::Str(s) => s.clone(),
        Value::Null | Value::Bool(false) => String::new(),
        Value::Bool(true) => "1".to_string(),
        Value::Int(n) => n.to_string(),
        Value::Float(f) => format_float(*f),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(text: &str) -> Value {
        Value::Str(text.to_string())
    }

    #[test]
    fn test_decodes_acf_repeater_value() {
        let value = unserialize(r#"a:2:{i:0;s:5:"field";s:5:"title";s:3:"abc";}"#).unwrap();
        assert_eq!(
            value,
            Value::Array(vec![
                (ArrayKey::Int(0), s("field")),
                (ArrayKey::Str("title".into()), s("abc")),
            ])
        );
    }

    #[test]
    fn test_decodes_scalars() {
        assert_eq!(unserialize("N;").unwrap(), Value::Null);
        assert_eq!(unserialize("b:1;").unwrap(), Value::Bool(true));
        assert_eq!(unserialize("i:-42;").unwrap(), Value::Int(-42));
        assert_eq!(unserialize("d:0.5;").unwrap(), Value::Float(0.5));
        assert_eq!(unserialize("d:1.0E+25;").unwrap(), Value::Float(1e25));
        assert_eq!(unserialize("d:INF;").unwrap(), Value::Float(f64::INFINITY));
    }

    #[test]
    fn test_string_length_counts_bytes() {
        assert_eq!(unserialize("s:5:\"caf\u{e9}\";").unwrap(), s("caf\u{e9}"));
        assert!(unserialize("s:4:\"caf\u{e9}\";").is_err());
    }

    #[test]
    fn test_numeric_string_keys_become_ints() {
        let value = unserialize(r#"a:3:{s:1:"7";i:1;s:2:"07";i:2;s:2:"-0";i:3;}"#).unwrap();
        let keys: Vec<_> = value.entries().unwrap().iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(
            keys,
            vec![
                ArrayKey::Int(7),
                ArrayKey::Str("07".into()),
                ArrayKey::Str("-0".into()),
            ]
        );
    }

    #[test]
    fn test_duplicate_keys_overwrite_in_place() {
        let value = unserialize(r#"a:3:{i:0;s:1:"a";i:1;s:1:"b";i:0;s:1:"c";}"#).unwrap();
        assert_eq!(
            value,
            Value::Array(vec![(ArrayKey::Int(0), s("c")), (ArrayKey::Int(1), s("b"))])
        );
    }

    #[test]
    fn test_decodes_objects_as_non_arrays() {
        let value = unserialize(r#"O:8:"stdClass":1:{s:1:"a";i:1;}"#).unwrap();
        assert!(value.entries().is_none());
        assert!(value.get(&ArrayKey::Str("a".into())).is_none());
    }

    #[test]
    fn test_rejects_malformed_input() {
        assert!(unserialize(r#"a:2:{i:0;s:1:"a";}"#).is_err());
        assert!(unserialize(r#"s:10:"short";"#).is_err());
        assert!(unserialize("i:abc;").is_err());
        assert!(unserialize("b:2;").is_err());
        assert!(unserialize(r#"a:1:{a:0:{}i:1;}"#).is_err());
        assert_eq!(
            unserialize("r:1;"),
            Err(DecodeError::UnsupportedTag { pos: 0, tag: 'r' })
        );
        assert!(matches!(
            unserialize("i:1;i:2;"),
            Err(DecodeError::TrailingData(4))
        ));
    }

    #[test]
    fn test_decodes_nesting_beyond_a_thousand_levels() {
        let depth = 1200;
        let mut text = String::new();
        for _ in 0..depth {
            text.push_str("a:1:{i:0;");
        }
        text.push_str("s:3:\"end\";");
        for _ in 0..depth {
            text.push('}');
        }
        let mut value = &unserialize(&text).unwrap();
        let mut levels = 0;
        while let Some(inner) = value.get(&ArrayKey::Int(0)) {
            value = inner;
            levels += 1;
        }
        assert_eq!(levels, depth);
        assert_eq!(*value, s("end"));
    }

    #[test]
    fn test_rejects_excessive_nesting() {
        let depth = MAX_DEPTH + 1;
        let mut text = String::new();
        for _ in 0..depth {
            text.push_str("a:1:{i:0;");
        }
        text.push_str("N;");
        for _ in 0..depth {
            text.push('}');
        }
        assert_eq!(unserialize(&text), Err(DecodeError::TooDeep(MAX_DEPTH)));
    }

    #[test]
    fn test_is_serialized_matches_wordpress() {
        assert!(is_serialized("N;", true));
        assert!(is_serialized(" a:0:{} ", true));
        assert!(is_serialized(r#"s:3:"abc";"#, true));
        assert!(is_serialized("i:12;", true));
        assert!(is_serialized("b:0;", true));
        assert!(!is_serialized("hello world", true));
        assert!(!is_serialized("12", true));
        assert!(!is_serialized("i:12;x", true));
        assert!(!is_serialized("a:b:{}", true));
        assert!(is_serialized("i:12;x", false));
    }

    #[test]
    fn test_maybe_unserialize_passes_plain_text_through() {
        assert_eq!(maybe_unserialize("plain").unwrap(), s("plain"));
        assert_eq!(maybe_unserialize("i:5;").unwrap(), Value::Int(5));
        assert!(maybe_unserialize("a:1:{broken}").is_err());
    }

    #[test]
    fn test_serialize_preserves_key_order_and_byte_lengths() {
        let value = Value::Array(vec![
            (ArrayKey::Str("b".into()), s("\u{e9}t\u{e9}")),
            (ArrayKey::Int(3), Value::Bool(false)),
            (ArrayKey::Int(4), Value::Null),
        ]);
        let text = serialize(&value);
        assert_eq!(
            text,
            "a:3:{s:1:\"b\";s:5:\"\u{e9}t\u{e9}\";i:3;b:0;i:4;N;}"
        );
        assert_eq!(unserialize(&text).unwrap(), value);
    }

    #[test]
    fn test_maybe_serialize_double_encodes_serialized_strings() {
        assert_eq!(maybe_serialize(&s("plain")), "plain");
        assert_eq!(maybe_serialize(&s("i:1;")), r#"s:4:"i:1;";"#);
        assert_eq!(maybe_serialize(&Value::Null), "");
        assert_eq!(maybe_serialize(&Value::Int(7)), "7");
        assert_eq!(maybe_serialize(&Value::Array(Vec::new())), "a:0:{}");
    }

    #[test]
    fn test_formats_floats_like_php() {
        assert_eq!(format_float(1.0), "1");
        assert_eq!(format_float(0.1), "0.1");
        assert_eq!(format_float(-2.5), "-2.5");
        assert_eq!(format_float(1e20), "1.0E+20");
        assert_eq!(format_float(1.5e-7), "1.5E-7");
        assert_eq!(format_float(0.00123), "0.00123");
        assert_eq!(format_float(f64::NEG_INFINITY), "-INF");
    }
}
