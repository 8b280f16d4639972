//! Merge-tolerant serialization of string mappings.
//!
//! Records are stored as plain text so that a version-control system can
//! three-way merge concurrent edits line by line. Two layouts exist:
//!
//! - **Format v1** surrounds every value with numbered context lines naming
//!   its key (`1:key`, `2:key`, ...). The value sits on its own `>` line.
//!   The strict numbering lets the parser notice when a merge has spliced
//!   two records together.
//! - **Format v2** is plain `key=value` lines padded with blank lines, so
//!   every value line is unique and appends never collide.
//!
//! ```text
//! v1:        v2:
//! 1:q
//! 2:q
//! 3:q
//! >p         q=p
//! 4:q
//! 5:q
//! 6:q
//! ```

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Marker that starts a v1 value line.
pub const VALUE_MARKER: char = '>';

/// Number of context lines written on each side of a value by default.
pub const DEFAULT_CONTEXT: usize = 3;

/// A decoded record. Keys iterate in sorted order, which is also the
/// order they are written in.
pub type Mapping = BTreeMap<String, String>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MapfileError {
    #[error("Illegal key {0:?}")]
    IllegalKey(String),

    #[error("Illegal value {0:?}")]
    IllegalValue(String),

    #[error("Context must be at least 1, got {0}")]
    InvalidContext(usize),

    #[error("Corrupt mapfile at line {line}: value with no preceding key")]
    ValueWithoutKey { line: usize },

    #[error("Corrupt mapfile at line {line}: duplicate value for key {key:?}")]
    DuplicateValue { line: usize, key: String },

    #[error("Corrupt mapfile at line {line}: malformed line {text:?}")]
    MalformedLine { line: usize, text: String },

    #[error("Corrupt mapfile at line {line}: expected {expected}:{key}, found {found}:{key}")]
    OutOfSequence {
        line: usize,
        key: String,
        expected: u64,
        found: u64,
    },

    #[error("Corrupt mapfile at line {line}: key {key:?} must restart numbering at 1, found {found}")]
    BadRestart { line: usize, key: String, found: u64 },

    #[error("Unknown mapfile format: {0}")]
    UnknownFormat(String),
}

impl MapfileError {
    /// True for errors that mean the stored record cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            MapfileError::ValueWithoutKey { .. }
                | MapfileError::DuplicateValue { .. }
                | MapfileError::MalformedLine { .. }
                | MapfileError::OutOfSequence { .. }
                | MapfileError::BadRestart { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, MapfileError>;

/// On-disk layout version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Format {
    V1,
    #[default]
    V2,
}

impl Format {
    pub fn encode(self, map: &Mapping, context: usize) -> Result<String> {
        match self {
            Format::V1 => generate(map, context),
            Format::V2 => generate2(map, context),
        }
    }

    pub fn decode(self, text: &str) -> Result<Mapping> {
        match self {
            Format::V1 => parse(text),
            Format::V2 => parse2(text),
        }
    }
}

impl TryFrom<u8> for Format {
    type Error = MapfileError;

    fn try_from(version: u8) -> Result<Self> {
        match version {
            1 => Ok(Format::V1),
            2 => Ok(Format::V2),
            other => Err(MapfileError::UnknownFormat(other.to_string())),
        }
    }
}

impl From<Format> for u8 {
    fn from(format: Format) -> u8 {
        match format {
            Format::V1 => 1,
            Format::V2 => 2,
        }
    }
}

impl FromStr for Format {
    type Err = MapfileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim_start_matches('v') {
            "1" => Ok(Format::V1),
            "2" => Ok(Format::V2),
            _ => Err(MapfileError::UnknownFormat(s.to_string())),
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", u8::from(*self))
    }
}

/// Parse a format-1 mapfile.
///
/// Context lines for one key must count up by one; when the key changes the
/// count restarts at 1. A key whose context lines survive without a value
/// line is simply absent from the result.
pub fn parse(text: &str) -> Result<Mapping> {
    let mut result = Mapping::new();
    let mut name: Option<String> = None;
    let mut prev_num: u64 = 0;

    for (idx, raw) in text.split_terminator('\n').enumerate() {
        let line = idx + 1;

        if let Some(value) = raw.strip_prefix(VALUE_MARKER) {
            let key = name.as_ref().ok_or(MapfileError::ValueWithoutKey { line })?;
            if result.contains_key(key) {
                return Err(MapfileError::DuplicateValue {
                    line,
                    key: key.clone(),
                });
            }
            result.insert(key.clone(), value.to_string());
            continue;
        }

        let (num, lname) = split_context_line(raw).ok_or_else(|| MapfileError::MalformedLine {
            line,
            text: raw.to_string(),
        })?;

        match name.as_deref() {
            None => name = Some(lname.to_string()),
            Some(current) if current == lname => {
                if num != prev_num + 1 {
                    return Err(MapfileError::OutOfSequence {
                        line,
                        key: lname.to_string(),
                        expected: prev_num + 1,
                        found: num,
                    });
                }
            }
            Some(_) => {
                if num != 1 {
                    return Err(MapfileError::BadRestart {
                        line,
                        key: lname.to_string(),
                        found: num,
                    });
                }
                name = Some(lname.to_string());
            }
        }
        prev_num = num;
    }

    Ok(result)
}

/// Split `12:key` into `(12, "key")`. Everything after the first colon is
/// the key, so keys may themselves contain colons.
fn split_context_line(line: &str) -> Option<(u64, &str)> {
    let (num, key) = line.split_once(':')?;
    if num.is_empty() || !num.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((num.parse().ok()?, key))
}

/// Generate a format-1 mapfile.
pub fn generate(map: &Mapping, context: usize) -> Result<String> {
    if context == 0 {
        return Err(MapfileError::InvalidContext(context));
    }
    validate(map, false)?;

    let mut out = String::new();
    for (key, value) in map {
        for i in 0..context {
            out.push_str(&format!("{}:{}\n", i + 1, key));
        }
        out.push(VALUE_MARKER);
        out.push_str(value);
        out.push('\n');
        for i in 0..context {
            out.push_str(&format!("{}:{}\n", i + context + 1, key));
        }
    }
    Ok(out)
}

/// Parse a format-2 mapfile. Blank lines are padding.
pub fn parse2(text: &str) -> Result<Mapping> {
    let mut result = Mapping::new();
    for (idx, raw) in text.split_terminator('\n').enumerate() {
        let line = idx + 1;
        if raw.is_empty() {
            continue;
        }
        let (key, value) = raw.split_once('=').ok_or_else(|| MapfileError::MalformedLine {
            line,
            text: raw.to_string(),
        })?;
        if key.is_empty() {
            return Err(MapfileError::MalformedLine {
                line,
                text: raw.to_string(),
            });
        }
        if result.insert(key.to_string(), value.to_string()).is_some() {
            return Err(MapfileError::DuplicateValue {
                line,
                key: key.to_string(),
            });
        }
    }
    Ok(result)
}

/// Generate a format-2 mapfile.
///
/// Every key and value is validated before anything is written, so an
/// illegal entry never leaves a half-written record behind.
pub fn generate2(map: &Mapping, context: usize) -> Result<String> {
    if context == 0 {
        return Err(MapfileError::InvalidContext(context));
    }
    validate(map, true)?;

    let padding = "\n".repeat(context);
    let mut out = String::new();
    for (key, value) in map {
        out.push_str(&padding);
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
        out.push_str(&padding);
    }
    Ok(out)
}

fn validate(map: &Mapping, forbid_equals: bool) -> Result<()> {
    for (key, value) in map {
        let illegal = key.is_empty()
            || key.starts_with(VALUE_MARKER)
            || key.contains('\n')
            || (forbid_equals && key.contains('='));
        if illegal {
            return Err(MapfileError::IllegalKey(key.clone()));
        }
        if value.contains('\n') {
            return Err(MapfileError::IllegalValue(value.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use similar_asserts::assert_eq;

    fn map(pairs: &[(&str, &str)]) -> Mapping {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_generate_single_key() {
        let text = generate(&map(&[("q", "p")]), 3).unwrap();
        assert_eq!(text, "1:q\n2:q\n3:q\n>p\n4:q\n5:q\n6:q\n");
        assert_eq!(parse(&text).unwrap()["q"], "p");
    }

    #[test]
    fn test_parse_key_with_colon() {
        let parsed = parse("1:q:5\n>s\n2:q:5\n").unwrap();
        assert_eq!(parsed["q:5"], "s");
    }

    #[test]
    fn test_parse_repeated_key_block_is_corrupt() {
        let err = parse("1:q\n>s\n2:q\n1:q\n>s\n2:q\n").unwrap_err();
        assert!(matches!(err, MapfileError::OutOfSequence { line: 4, .. }));
        assert!(err.is_corruption());
    }

    #[test]
    fn test_parse_key_returning_after_another() {
        // q, then l, then q again: the second q block restarts at 1 so it
        // passes sequencing, but carries a second value for q.
        let err = parse("1:q\n>s\n2:q\n1:l\n>s\n2:l\n1:q\n>s\n2:q\n").unwrap_err();
        assert!(matches!(err, MapfileError::DuplicateValue { line: 8, .. }));
    }

    #[test]
    fn test_parse_duplicate_value_line() {
        let err = parse("1:q\n>s\n>s\n2:q\n").unwrap_err();
        assert_eq!(
            err,
            MapfileError::DuplicateValue {
                line: 3,
                key: "q".to_string()
            }
        );
    }

    #[test]
    fn test_parse_value_before_any_key() {
        let err = parse(">orphan\n1:q\n").unwrap_err();
        assert_eq!(err, MapfileError::ValueWithoutKey { line: 1 });
    }

    #[test]
    fn test_parse_key_change_must_restart() {
        let err = parse("1:a\n>x\n2:a\n2:b\n>y\n").unwrap_err();
        assert!(matches!(err, MapfileError::BadRestart { found: 2, .. }));
    }

    #[test]
    fn test_parse_malformed_context_line() {
        let err = parse("1:a\n>x\nnot a context line\n").unwrap_err();
        assert!(matches!(err, MapfileError::MalformedLine { line: 3, .. }));
    }

    #[test]
    fn test_generate_multiple_keys_sorted() {
        let m = map(&[("e", "f"), ("a", "b"), ("c", "d")]);
        let text = generate(&m, 1).unwrap();
        assert_eq!(text, "1:a\n>b\n2:a\n1:c\n>d\n2:c\n1:e\n>f\n2:e\n");
        assert_eq!(parse(&text).unwrap(), m);
    }

    #[test]
    fn test_generate_rejects_zero_context() {
        assert_eq!(
            generate(&map(&[("q", "p")]), 0).unwrap_err(),
            MapfileError::InvalidContext(0)
        );
        assert_eq!(
            generate2(&map(&[("q", "p")]), 0).unwrap_err(),
            MapfileError::InvalidContext(0)
        );
    }

    #[test]
    fn test_generate2_single_key() {
        let text = generate2(&map(&[("q", "p")]), 3).unwrap();
        assert_eq!(text, "\n\n\nq=p\n\n\n\n");
    }

    #[test]
    fn test_generate2_illegal_keys() {
        for key in ["q=", "q\n", "", ">q"] {
            let err = generate2(&map(&[(key, "p")]), 3).unwrap_err();
            assert_eq!(err, MapfileError::IllegalKey(key.to_string()));
        }
    }

    #[test]
    fn test_generate2_illegal_value() {
        let err = generate2(&map(&[("q", "p\n")]), 3).unwrap_err();
        assert_eq!(err, MapfileError::IllegalValue("p\n".to_string()));
    }

    #[test]
    fn test_generate2_validates_before_writing() {
        // "a" sorts first and is fine; the bad "z" key must still abort.
        let err = generate2(&map(&[("a", "ok"), ("z", "bad\nvalue")]), 3).unwrap_err();
        assert!(matches!(err, MapfileError::IllegalValue(_)));
    }

    #[test]
    fn test_parse2_values() {
        assert_eq!(parse2("\n\n\nq=p\n\n\n\n").unwrap()["q"], "p");
        assert_eq!(parse2("\n\nq='p'\n\n\n\n").unwrap()["q"], "'p'");
        assert_eq!(parse2("k=a=b\n").unwrap()["k"], "a=b");
    }

    #[test]
    fn test_parse2_rejects_duplicates_and_garbage() {
        assert!(matches!(
            parse2("q=1\n\nq=2\n").unwrap_err(),
            MapfileError::DuplicateValue { line: 3, .. }
        ));
        assert!(matches!(
            parse2("no equals here\n").unwrap_err(),
            MapfileError::MalformedLine { line: 1, .. }
        ));
    }

    #[test]
    fn test_v1_survives_unconflicted_merge() {
        // Simulate a three-way merge where each side edited a different
        // value: the merged text must still parse with both edits.
        let base = map(&[("assigned", "alice"), ("status", "open")]);
        let ours = map(&[("assigned", "bob"), ("status", "open")]);
        let theirs = map(&[("assigned", "alice"), ("status", "closed")]);
        let base_text = generate(&base, 3).unwrap();
        let ours_text = generate(&ours, 3).unwrap();
        let theirs_text = generate(&theirs, 3).unwrap();

        let merged: Vec<&str> = base_text
            .lines()
            .zip(ours_text.lines().zip(theirs_text.lines()))
            .map(|(b, (o, t))| if o != b { o } else { t })
            .collect();
        let merged = merged.join("\n") + "\n";

        let parsed = parse(&merged).unwrap();
        assert_eq!(parsed["assigned"], "bob");
        assert_eq!(parsed["status"], "closed");
    }

    #[test]
    fn test_random_mappings_round_trip() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let alphabet: Vec<char> = "abcXYZ019 :=->_.'\"é\r\t".chars().collect();
        for _ in 0..200 {
            let mut m = Mapping::new();
            for _ in 0..rng.gen_range(0..6) {
                let key_len = rng.gen_range(1..8);
                let key: String = (0..key_len)
                    .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
                    .collect();
                let key = key.replace('=', "_").trim_start_matches('>').to_string();
                if key.is_empty() {
                    continue;
                }
                let value: String = (0..rng.gen_range(0..12))
                    .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
                    .collect();
                m.insert(key, value);
            }
            let context = rng.gen_range(1..5);
            for format in [Format::V1, Format::V2] {
                let text = format.encode(&m, context).unwrap();
                assert_eq!(format.decode(&text).unwrap(), m, "{format} context={context}");
            }
        }
    }

    #[test]
    fn test_carriage_returns_are_data() {
        let m = map(&[("q", "p\r"), ("line\r", "\r")]);
        for format in [Format::V1, Format::V2] {
            let text = format.encode(&m, 1).unwrap();
            assert_eq!(format.decode(&text).unwrap(), m, "{format}");
        }
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("1".parse::<Format>().unwrap(), Format::V1);
        assert_eq!("v2".parse::<Format>().unwrap(), Format::V2);
        assert!("3".parse::<Format>().is_err());
        assert_eq!(Format::default(), Format::V2);
    }
}
