//! Declarative keyword tables.
//!
//! Every camera family publishes the [`KeywordTable::base`] keywords. Families
//! extend the table the same way mode tables are extended: by merging their own
//! entries over the parent's.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::format::FormatSpec;
use super::wcs::wcs_dummy_keywords;
use super::KeywordValue;
use crate::error::{AppResult, CamstackError};

/// `(value, description, format, short key)` of one header keyword.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordSpec {
    /// Value written when the stream is published
    pub default: KeywordValue,
    /// FITS comment
    pub description: String,
    /// Rendering applied on every write
    pub format: FormatSpec,
    /// Suffix used when mirroring into the external store. `None` is never mirrored.
    #[serde(default)]
    pub short_key: Option<String>,
}

impl KeywordSpec {
    /// Spec with `format` parsed.
    pub fn new(
        default: impl Into<KeywordValue>,
        description: &str,
        format: &str,
        short_key: Option<&str>,
    ) -> AppResult<Self> {
        Ok(Self {
            default: default.into(),
            description: description.to_string(),
            format: format.parse()?,
            short_key: short_key.map(str::to_string),
        })
    }
}

/// Keyword name to spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeywordTable {
    entries: BTreeMap<String, KeywordSpec>,
}

macro_rules! kw {
    ($table:ident, $name:expr, $value:expr, $descr:expr, $fmt:expr, $short:expr) => {
        $table.insert($name, KeywordSpec::new($value, $descr, $fmt, Some($short))?);
    };
}

impl KeywordTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keywords every camera publishes.
    pub fn base() -> AppResult<Self> {
        let mut t = Self::new();
        kw!(t, "BIAS", 0.0, "[adu] Bias offset", "%20.3f", "BIAS");
        kw!(t, "BIN-FCT1", 1i64, "[pixel] Binning factor of X axis", "%20d", "BIN1");
        kw!(t, "BIN-FCT2", 1i64, "[pixel] Binning factor of Y axis", "%20d", "BIN2");
        kw!(t, "BSCALE", 1.0, "Real=fits-value*BSCALE+BZERO", "%20.8f", "BSCAL");
        kw!(t, "BUNIT", "ADU", "Unit of original values", "%-10s", "BUNIT");
        kw!(t, "BZERO", 0.0, "Real=fits-value*BSCALE+BZERO", "%20.8f", "BZERO");
        kw!(t, "CROPPED", false, "Partial Readout or cropped", "BOOLEAN", "CROPD");
        kw!(t, "DATA-TYP", "TEST", "Subaru-style exp. type", "%-16s", "DATA");
        kw!(t, "DET-NSMP", 1i64, "Number of non-destructive reads", "%20d", "NDR");
        kw!(t, "DET-SMPL", "base", "Sampling method", "%-16.16s", "SAMPL");
        kw!(t, "DET-TMP", 0.0, "[K] Detector temperature", "%20.2f", "TEMP");
        kw!(t, "DETECTOR", "DET", "Name of the detector", "%-16s", "NAME");
        kw!(t, "DETGAIN", 1i64, "Detector multiplication factor", "%16d", "GAIN");
        kw!(t, "DETPXSZ1", 0.0, "[mm] Detector pixel size in axis 1", "%20.6f", "PXSZ1");
        kw!(t, "DETPXSZ2", 0.0, "[mm] Detector pixel size in axis 2", "%20.6f", "PXSZ2");
        kw!(t, "EXPTIME", 0.001, "[s] Total integration time of the frame", "%20.8f", "EXPO");
        kw!(t, "EXTTRIG", false, "Exposure of detector by an external trigger", "BOOLEAN", "TRIG");
        kw!(t, "F-RATIO", 0.0, "Monochromatic F-ratio of the camera", "%20.2f", "FRTIO");
        kw!(t, "FRATE", 100.0, "[Hz] Frame rate of the acquisition", "%16.3f", "FRATE");
        kw!(t, "GAIN", -1.0, "[e/adu] AD conversion factor", "%20.3f", "GAIN");
        kw!(t, "INST-PA", -360.0, "[deg] PA offset of detector", "%20.3f", "INSPA");
        kw!(t, "OBS-MOD", "UNDEFINED", "Observation mode", "%-16s", "OBMOD");
        kw!(t, "PRD-MIN1", 0i64, "[pixel] Origin in X of the cropped window", "%16d", "MIN1");
        kw!(t, "PRD-MIN2", 0i64, "[pixel] Origin in Y of the cropped window", "%16d", "MIN2");
        kw!(t, "PRD-RNG1", 1i64, "[pixel] Range in X of the cropped window", "%16d", "RNG1");
        kw!(t, "PRD-RNG2", 1i64, "[pixel] Range in Y of the cropped window", "%16d", "RNG2");
        // Technical keywords, not allocated by the framegrabber
        kw!(t, "_LGSHSTP", -1i64, "N > 0 blocks logshim aft. N frs, -1 isgo", "%16d", "LGSTP");
        kw!(t, "_LGSHKIL", 0i64, " =/= 0 kills logshim", "%16d", "LGKIL");
        Ok(t)
    }

    /// Add or replace one keyword.
    pub fn insert(&mut self, name: &str, spec: KeywordSpec) {
        self.entries.insert(name.to_string(), spec);
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, name: &str, spec: KeywordSpec) -> Self {
        self.insert(name, spec);
        self
    }

    /// `self ⊕ overrides`: override entries win.
    pub fn merged(&self, overrides: &KeywordTable) -> KeywordTable {
        let mut entries = self.entries.clone();
        for (name, spec) in &overrides.entries {
            entries.insert(name.clone(), spec.clone());
        }
        KeywordTable { entries }
    }

    /// Append `n` placeholder WCS sets (unsuffixed, then `B`, `C`, ...).
    pub fn with_wcs_sets(mut self, n: usize) -> AppResult<Self> {
        for i in 0..n {
            for (name, spec) in wcs_dummy_keywords(i)? {
                self.entries.insert(name, spec);
            }
        }
        Ok(self)
    }

    /// Spec of `name`, if known.
    pub fn get(&self, name: &str) -> Option<&KeywordSpec> {
        self.entries.get(name)
    }

    /// Spec of `name`, or a keyword error.
    pub fn spec(&self, name: &str) -> AppResult<&KeywordSpec> {
        self.get(name)
            .ok_or_else(|| CamstackError::Keyword(format!("unknown keyword {name}")))
    }

    /// Whether `name` is known.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Specs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &KeywordSpec)> {
        self.entries.iter()
    }

    /// Names in order.
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Number of keywords.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_table_carries_published_keys() {
        let t = KeywordTable::base().unwrap();
        for name in [
            "BIN-FCT1", "BIN-FCT2", "PRD-MIN1", "PRD-MIN2", "PRD-RNG1", "PRD-RNG2", "CROPPED",
            "DETECTOR", "EXPTIME", "FRATE", "GAIN", "DETGAIN", "DET-TMP", "DET-NSMP",
            "DET-SMPL", "EXTTRIG", "DATA-TYP", "BSCALE", "BZERO", "BUNIT",
        ] {
            assert!(t.contains(name), "{name} missing");
        }
        assert_eq!(t.len(), 28);
        assert_eq!(t.get("EXPTIME").unwrap().short_key.as_deref(), Some("EXPO"));
    }

    #[test]
    fn short_keys_fit_the_store_budget() {
        for (_, spec) in KeywordTable::base().unwrap().iter() {
            assert!(spec.short_key.as_ref().map(|k| k.len() <= 5).unwrap_or(true));
        }
    }

    #[test]
    fn family_overrides_win() {
        let base = KeywordTable::base().unwrap();
        let family = KeywordTable::new().with(
            "DETECTOR",
            KeywordSpec::new("Simulated", "Name of the detector", "%-16s", Some("NAME")).unwrap(),
        );
        let merged = base.merged(&family);
        assert_eq!(merged.len(), base.len());
        assert_eq!(merged.get("DETECTOR").unwrap().default, "Simulated".into());
    }

    #[test]
    fn wcs_sets_extend_the_table() {
        let t = KeywordTable::base().unwrap().with_wcs_sets(2).unwrap();
        assert!(t.contains("CDELT1"));
        assert!(t.contains("CD2_2B"));
        assert!(t.contains("C22_2"));
        assert!(t.spec("NOPE").is_err());
    }
}
