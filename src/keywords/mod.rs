//! Keyword & telemetry pipeline.
//!
//! - [`format`]: printf-style format specs and their projection rules
//! - [`table`]: the declarative keyword table of a camera family
//! - [`wcs`]: generated world-coordinate keyword sets
//! - [`pipeline`]: formatted publication into the image-stream header
//! - [`store`]: mirror of short-keyed values into the external key-value store
//! - [`poller`]: the background polling task

pub mod format;
pub mod pipeline;
pub mod poller;
pub mod store;
pub mod table;
pub mod wcs;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use format::FormatSpec;
pub use pipeline::KeywordPipeline;
pub use store::{KeywordStore, MemoryStore, NullStore, RedisStore};
pub use table::{KeywordSpec, KeywordTable};

/// A header value as carried by the stream and the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeywordValue {
    /// FITS logical
    Bool(bool),
    /// Integer
    Int(i64),
    /// Floating point
    Float(f64),
    /// String
    Str(String),
}

impl KeywordValue {
    /// Numeric view; strings are parsed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            KeywordValue::Int(i) => Some(*i as f64),
            KeywordValue::Float(x) => Some(*x),
            KeywordValue::Bool(b) => Some(f64::from(u8::from(*b))),
            KeywordValue::Str(s) => s.trim().parse().ok(),
        }
    }

    /// Integer view; floats are truncated, strings parsed.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            KeywordValue::Int(i) => Some(*i),
            KeywordValue::Float(x) if x.is_finite() => Some(x.trunc() as i64),
            KeywordValue::Bool(b) => Some(i64::from(*b)),
            KeywordValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// The string, for string values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            KeywordValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Stored booleans are two-letter strings; accept both shapes.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            KeywordValue::Bool(b) => Some(*b),
            KeywordValue::Str(s) if s == format::BOOL_TRUE => Some(true),
            KeywordValue::Str(s) if s == format::BOOL_FALSE => Some(false),
            _ => None,
        }
    }

    /// Parse an operator-typed value: integer, then float, then boolean, then string.
    pub fn parse_loose(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Ok(i) = trimmed.parse::<i64>() {
            return KeywordValue::Int(i);
        }
        if let Ok(x) = trimmed.parse::<f64>() {
            return KeywordValue::Float(x);
        }
        match trimmed {
            "true" | "True" => KeywordValue::Bool(true),
            "false" | "False" => KeywordValue::Bool(false),
            _ => KeywordValue::Str(raw.to_string()),
        }
    }
}

impl fmt::Display for KeywordValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeywordValue::Bool(b) => write!(f, "{b}"),
            KeywordValue::Int(i) => write!(f, "{i}"),
            KeywordValue::Float(x) => write!(f, "{x}"),
            KeywordValue::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for KeywordValue {
    fn from(value: bool) -> Self {
        KeywordValue::Bool(value)
    }
}

impl From<i64> for KeywordValue {
    fn from(value: i64) -> Self {
        KeywordValue::Int(value)
    }
}

impl From<u32> for KeywordValue {
    fn from(value: u32) -> Self {
        KeywordValue::Int(i64::from(value))
    }
}

impl From<i32> for KeywordValue {
    fn from(value: i32) -> Self {
        KeywordValue::Int(i64::from(value))
    }
}

impl From<f64> for KeywordValue {
    fn from(value: f64) -> Self {
        KeywordValue::Float(value)
    }
}

impl From<&str> for KeywordValue {
    fn from(value: &str) -> Self {
        KeywordValue::Str(value.to_string())
    }
}

impl From<String> for KeywordValue {
    fn from(value: String) -> Self {
        KeywordValue::Str(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_shapes() {
        let v: Vec<KeywordValue> = serde_json::from_str(r#"[true, 3, 0.5, "ADU"]"#).unwrap();
        assert_eq!(
            v,
            vec![
                KeywordValue::Bool(true),
                KeywordValue::Int(3),
                KeywordValue::Float(0.5),
                KeywordValue::Str("ADU".into())
            ]
        );
    }

    #[test]
    fn loose_parsing() {
        assert_eq!(KeywordValue::parse_loose("42"), KeywordValue::Int(42));
        assert_eq!(KeywordValue::parse_loose("1e-3"), KeywordValue::Float(0.001));
        assert_eq!(KeywordValue::parse_loose("True"), KeywordValue::Bool(true));
        assert_eq!(KeywordValue::parse_loose("CMOS"), KeywordValue::Str("CMOS".into()));
    }

    #[test]
    fn stored_booleans_read_back() {
        assert_eq!(KeywordValue::Str("TT".into()).as_bool(), Some(true));
        assert_eq!(KeywordValue::Str("maybe".into()).as_bool(), None);
    }
}
