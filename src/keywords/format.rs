//! printf-style format specs attached to every keyword.
//!
//! A keyword's format decides the type and precision it is stored with:
//! `%<n>d` stores a truncated integer, `%<n>.<m>f` stores a double rounded to
//! `m` decimals, `%[-]<n>[.<m>]s` stores a padded string and `BOOLEAN` stores a
//! two-letter flag. Strings never exceed [`MAX_STRING_LEN`] characters.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::KeywordValue;
use crate::error::CamstackError;

/// Stored representation of `true` for `BOOLEAN` keywords.
pub const BOOL_TRUE: &str = "TT";
/// Stored representation of `false` for `BOOLEAN` keywords.
pub const BOOL_FALSE: &str = "FF";
/// Stream headers cap string values at this many characters.
pub const MAX_STRING_LEN: usize = 16;

static PRINTF_RE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^%(-)?(\d*)(?:\.(\d+))?([dfs])$").unwrap()
});

/// Parsed keyword format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FormatSpec {
    /// `%<n>d`
    Int {
        /// Minimum rendered width
        width: usize,
    },
    /// `%<n>.<m>f`
    Fixed {
        /// Minimum rendered width
        width: usize,
        /// Decimals kept
        precision: usize,
    },
    /// `%[-]<n>[.<m>]s`
    Str {
        /// Padded width, at most the header value length
        width: usize,
        /// Characters kept from the value
        precision: Option<usize>,
        /// Pad on the right
        left: bool,
    },
    /// `BOOLEAN`: `T` or `F`
    Boolean,
}

impl FromStr for FormatSpec {
    type Err = CamstackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "BOOLEAN" {
            return Ok(FormatSpec::Boolean);
        }
        let caps = PRINTF_RE
            .captures(s)
            .ok_or_else(|| CamstackError::Keyword(format!("unsupported format spec '{s}'")))?;
        let left = caps.get(1).is_some();
        let width = caps
            .get(2)
            .and_then(|m| m.as_str().parse::<usize>().ok())
            .unwrap_or(0);
        let precision = caps.get(3).and_then(|m| m.as_str().parse::<usize>().ok());

        match caps.get(4).map(|m| m.as_str()) {
            Some("d") => Ok(FormatSpec::Int { width }),
            Some("f") => Ok(FormatSpec::Fixed {
                width,
                precision: precision.unwrap_or(6),
            }),
            Some("s") => Ok(FormatSpec::Str {
                width,
                precision,
                left,
            }),
            _ => Err(CamstackError::Keyword(format!("unsupported format spec '{s}'"))),
        }
    }
}

impl TryFrom<String> for FormatSpec {
    type Error = CamstackError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FormatSpec> for String {
    fn from(value: FormatSpec) -> Self {
        value.to_string()
    }
}

impl fmt::Display for FormatSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatSpec::Int { width } => write!(f, "%{width}d"),
            FormatSpec::Fixed { width, precision } => write!(f, "%{width}.{precision}f"),
            FormatSpec::Str {
                width,
                precision,
                left,
            } => {
                write!(f, "%")?;
                if *left {
                    write!(f, "-")?;
                }
                write!(f, "{width}")?;
                if let Some(p) = precision {
                    write!(f, ".{p}")?;
                }
                write!(f, "s")
            }
            FormatSpec::Boolean => write!(f, "BOOLEAN"),
        }
    }
}

/// `%s` rendering of a value.
fn as_display_string(value: &KeywordValue) -> String {
    match value {
        KeywordValue::Str(s) => s.clone(),
        KeywordValue::Int(i) => i.to_string(),
        KeywordValue::Float(x) => {
            if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e16 {
                format!("{x:.1}")
            } else {
                x.to_string()
            }
        }
        KeywordValue::Bool(true) => "True".to_string(),
        KeywordValue::Bool(false) => "False".to_string(),
    }
}

fn clip(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

impl FormatSpec {
    /// Project `value` onto this format.
    ///
    /// Fails on values the format cannot represent (strings under a numeric
    /// format, non-finite numbers under `%d`, non-booleans under `BOOLEAN`).
    pub fn apply(&self, value: &KeywordValue) -> Result<KeywordValue, CamstackError> {
        let mismatch = || {
            CamstackError::Keyword(format!("cannot format {value:?} with '{self}'"))
        };
        match self {
            FormatSpec::Int { .. } => match value {
                KeywordValue::Int(i) => Ok(KeywordValue::Int(*i)),
                KeywordValue::Bool(b) => Ok(KeywordValue::Int(i64::from(*b))),
                KeywordValue::Float(x) if x.is_finite() => Ok(KeywordValue::Int(x.trunc() as i64)),
                _ => Err(mismatch()),
            },
            FormatSpec::Fixed { precision, .. } => {
                let x = match value {
                    KeywordValue::Float(x) => *x,
                    KeywordValue::Int(i) => *i as f64,
                    KeywordValue::Bool(b) => f64::from(u8::from(*b)),
                    KeywordValue::Str(_) => return Err(mismatch()),
                };
                if !x.is_finite() {
                    return Ok(KeywordValue::Float(x));
                }
                format!("{x:.precision$}")
                    .parse::<f64>()
                    .map(KeywordValue::Float)
                    .map_err(|_| mismatch())
            }
            FormatSpec::Str {
                width,
                precision,
                left,
            } => {
                let mut s = as_display_string(value);
                if let Some(p) = precision {
                    s = clip(&s, *p);
                }
                let width = (*width).min(MAX_STRING_LEN);
                let padded = if *left {
                    format!("{s:<width$}")
                } else {
                    format!("{s:>width$}")
                };
                Ok(KeywordValue::Str(clip(&padded, MAX_STRING_LEN)))
            }
            FormatSpec::Boolean => match value {
                KeywordValue::Bool(true) => Ok(KeywordValue::Str(BOOL_TRUE.to_string())),
                KeywordValue::Bool(false) => Ok(KeywordValue::Str(BOOL_FALSE.to_string())),
                KeywordValue::Str(s) if s == BOOL_TRUE || s == BOOL_FALSE => {
                    Ok(KeywordValue::Str(s.clone()))
                }
                _ => Err(mismatch()),
            },
        }
    }

    /// Human rendering of a stored value, as it would appear in a FITS card.
    pub fn render(&self, value: &KeywordValue) -> String {
        match (self, value) {
            (FormatSpec::Int { width }, KeywordValue::Int(i)) => format!("{i:>width$}"),
            (FormatSpec::Fixed { width, precision }, KeywordValue::Float(x)) => {
                format!("{x:>width$.precision$}")
            }
            (_, other) => as_display_string(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(s: &str) -> FormatSpec {
        s.parse().unwrap()
    }

    #[test]
    fn parses_supported_specs() {
        assert_eq!(spec("%20d"), FormatSpec::Int { width: 20 });
        assert_eq!(
            spec("%20.8f"),
            FormatSpec::Fixed {
                width: 20,
                precision: 8
            }
        );
        assert_eq!(
            spec("%-16.16s"),
            FormatSpec::Str {
                width: 16,
                precision: Some(16),
                left: true
            }
        );
        assert_eq!(spec("BOOLEAN"), FormatSpec::Boolean);
        assert!("%x".parse::<FormatSpec>().is_err());
        assert!("20d".parse::<FormatSpec>().is_err());
    }

    #[test]
    fn display_roundtrips_printf_syntax() {
        for s in ["%16d", "%20.3f", "%-10s", "%-16.16s", "%8s", "BOOLEAN"] {
            assert_eq!(spec(s).to_string(), s);
        }
    }

    #[test]
    fn integer_format_truncates() {
        let f = spec("%20d");
        assert_eq!(f.apply(&KeywordValue::Float(3.7)).unwrap(), KeywordValue::Int(3));
        assert_eq!(f.apply(&KeywordValue::Bool(true)).unwrap(), KeywordValue::Int(1));
        assert!(f.apply(&KeywordValue::Str("3".into())).is_err());
        assert!(f.apply(&KeywordValue::Float(f64::NAN)).is_err());
    }

    #[test]
    fn fixed_format_rounds() {
        let f = spec("%20.3f");
        assert_eq!(
            f.apply(&KeywordValue::Float(0.123456)).unwrap(),
            KeywordValue::Float(0.123)
        );
        assert_eq!(f.apply(&KeywordValue::Int(2)).unwrap(), KeywordValue::Float(2.0));
        assert!(f.apply(&KeywordValue::Str("x".into())).is_err());
    }

    #[test]
    fn string_format_pads_and_clips() {
        assert_eq!(
            spec("%-10s").apply(&"ADU".into()).unwrap(),
            KeywordValue::Str("ADU       ".into())
        );
        assert_eq!(
            spec("%-16s").apply(&"A rather long detector".into()).unwrap(),
            KeywordValue::Str("A rather long de".into())
        );
        assert_eq!(
            spec("%20s").apply(&"x".into()).unwrap(),
            KeywordValue::Str("               x".into())
        );
        assert_eq!(
            spec("%20s").apply(&"A rather long detector".into()).unwrap(),
            KeywordValue::Str("A rather long de".into())
        );
        assert_eq!(
            spec("%-16s").apply(&KeywordValue::Float(1.0)).unwrap(),
            KeywordValue::Str("1.0             ".into())
        );
    }

    #[test]
    fn boolean_format() {
        let f = FormatSpec::Boolean;
        assert_eq!(f.apply(&true.into()).unwrap(), KeywordValue::Str("TT".into()));
        assert_eq!(f.apply(&false.into()).unwrap(), KeywordValue::Str("FF".into()));
        assert_eq!(f.apply(&"FF".into()).unwrap(), KeywordValue::Str("FF".into()));
        assert!(f.apply(&KeywordValue::Int(1)).is_err());
    }

    #[test]
    fn formatting_is_idempotent() {
        let cases = [
            (spec("%20.8f"), KeywordValue::Float(0.0012345678912)),
            (spec("%16d"), KeywordValue::Float(41.9)),
            (spec("%-16s"), KeywordValue::Str("Simulated".into())),
            (FormatSpec::Boolean, KeywordValue::Bool(true)),
        ];
        for (f, v) in cases {
            let once = f.apply(&v).unwrap();
            assert_eq!(f.apply(&once).unwrap(), once);
        }
    }

    #[test]
    fn serde_uses_printf_strings() {
        let f: FormatSpec = serde_json::from_str("\"%20.2f\"").unwrap();
        assert_eq!(f, spec("%20.2f"));
        assert_eq!(serde_json::to_string(&f).unwrap(), "\"%20.2f\"");
    }
}
