//! Mode & geometry registry.
//!
//! A camera family declares a static table of named [`CameraMode`] presets.
//! Families that specialise another family build their table by merging the
//! parent's table with their own overrides ([`ModeTable::merged`]); child entries
//! win on duplicate identifiers. The only runtime mutation is the reserved
//! [`CUSTOM_MODE`] entry, inserted when an operator asks for an explicit
//! `(height, width, offsets)` window.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::{AppResult, CamstackError};

/// Identifier reserved for operator-supplied windows.
pub const CUSTOM_MODE: &str = "CUSTOM";

/// Mode identifier: mode tables are keyed either by name or by integer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModeId {
    /// Integer-keyed preset
    Index(i64),
    /// Named preset
    Name(String),
}

impl ModeId {
    /// Parse an operator-typed identifier. Pure integers become [`ModeId::Index`].
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<i64>() {
            Ok(idx) => ModeId::Index(idx),
            Err(_) => ModeId::Name(trimmed.to_string()),
        }
    }

    /// The reserved `CUSTOM` identifier.
    pub fn custom() -> Self {
        ModeId::Name(CUSTOM_MODE.to_string())
    }

    /// Whether this is the operator window slot.
    pub fn is_custom(&self) -> bool {
        matches!(self, ModeId::Name(name) if name == CUSTOM_MODE)
    }
}

impl fmt::Display for ModeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModeId::Index(idx) => write!(f, "{idx}"),
            ModeId::Name(name) => write!(f, "{name}"),
        }
    }
}

impl From<&str> for ModeId {
    fn from(value: &str) -> Self {
        ModeId::parse(value)
    }
}

impl From<String> for ModeId {
    fn from(value: String) -> Self {
        ModeId::parse(&value)
    }
}

impl From<i64> for ModeId {
    fn from(value: i64) -> Self {
        ModeId::Index(value)
    }
}

impl Serialize for ModeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ModeId::Index(idx) => serializer.serialize_i64(*idx),
            ModeId::Name(name) => serializer.serialize_str(name),
        }
    }
}

impl<'de> Deserialize<'de> for ModeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Str(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Int(idx) => ModeId::Index(idx),
            Raw::Str(name) => ModeId::parse(&name),
        })
    }
}

/// One region-of-interest preset. Rows and columns are inclusive, in unbinned pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraMode {
    /// First column
    pub x0: u32,
    /// Last column (inclusive)
    pub x1: u32,
    /// First row
    pub y0: u32,
    /// Last row (inclusive)
    pub y1: u32,
    /// Horizontal on-chip binning
    #[serde(default = "default_bin")]
    pub binx: u32,
    /// Vertical on-chip binning
    #[serde(default = "default_bin")]
    pub biny: u32,
    /// Nominal frame rate (Hz)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    /// Nominal exposure (s)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tint: Option<f64>,
    /// Raw framegrabber geometry `(cols, rows)` when it differs from the sensor window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fgsize: Option<(u32, u32)>,
    /// Named pixel positions of interest, in binned coordinates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hotspots: Option<BTreeMap<String, (f64, f64)>>,
}

fn default_bin() -> u32 {
    1
}

impl CameraMode {
    /// Unbinned window with no rate or exposure preset.
    pub fn new(x0: u32, x1: u32, y0: u32, y1: u32) -> Self {
        Self {
            x0,
            x1,
            y0,
            y1,
            binx: 1,
            biny: 1,
            fps: None,
            tint: None,
            fgsize: None,
            hotspots: None,
        }
    }

    /// On-chip binning factors.
    pub fn with_binning(mut self, binx: u32, biny: u32) -> Self {
        self.binx = binx;
        self.biny = biny;
        self
    }

    /// Nominal frame rate (Hz).
    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = Some(fps);
        self
    }

    /// Nominal exposure (s).
    pub fn with_tint(mut self, tint: f64) -> Self {
        self.tint = Some(tint);
        self
    }

    /// Raw framegrabber geometry when it differs from the window.
    pub fn with_fgsize(mut self, cols: u32, rows: u32) -> Self {
        self.fgsize = Some((cols, rows));
        self
    }

    /// Window spanning `width x height` pixels starting at the given offsets.
    pub fn from_window(height: u32, width: u32, h_offset: u32, w_offset: u32) -> AppResult<Self> {
        if height == 0 || width == 0 {
            return Err(CamstackError::InvalidMode(format!(
                "empty window {height}x{width}"
            )));
        }
        let last = |offset: u32, extent: u32| {
            offset.checked_add(extent - 1).ok_or_else(|| {
                CamstackError::InvalidMode(format!(
                    "window {height}x{width} at ({h_offset}, {w_offset}) overflows"
                ))
            })
        };
        let mode = Self::new(w_offset, last(w_offset, width)?, h_offset, last(h_offset, height)?);
        mode.validate()
            .map_err(|e| CamstackError::InvalidMode(e.to_string()))?;
        Ok(mode)
    }

    /// Unbinned columns.
    pub fn width(&self) -> u32 {
        self.x1 - self.x0 + 1
    }

    /// Unbinned rows.
    pub fn height(&self) -> u32 {
        self.y1 - self.y0 + 1
    }

    /// Output geometry after on-chip binning.
    pub fn binned_size(&self) -> (u32, u32) {
        (self.width() / self.binx.max(1), self.height() / self.biny.max(1))
    }

    /// Transport geometry `(width, height)`, honoring the raw framegrabber size.
    pub fn fg_size(&self) -> (u32, u32) {
        self.fgsize.unwrap_or((self.width(), self.height()))
    }

    /// Reject inverted windows and zero binning.
    pub fn validate(&self) -> AppResult<()> {
        if self.x0 > self.x1 || self.y0 > self.y1 {
            return Err(CamstackError::Configuration(format!(
                "mode window is inverted: {self}"
            )));
        }
        if self.binx == 0 || self.biny == 0 {
            return Err(CamstackError::Configuration(format!(
                "bin factors must be >= 1: {self}"
            )));
        }
        Ok(())
    }

    /// Load a single mode from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        let mode: CameraMode = toml::from_str(&raw).map_err(|e| {
            CamstackError::Configuration(format!("{}: {e}", path.as_ref().display()))
        })?;
        mode.validate()?;
        Ok(mode)
    }

    /// Serialize as a standalone TOML mode file.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string(self).map_err(|e| CamstackError::Configuration(e.to_string()))
    }

    /// Write [`to_toml`](Self::to_toml) to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> AppResult<()> {
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }
}

impl fmt::Display for CameraMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CameraMode: {}-{}, {}-{} ({} x {})",
            self.x0,
            self.x1,
            self.y0,
            self.y1,
            self.x1 as i64 - self.x0 as i64 + 1,
            self.y1 as i64 - self.y0 as i64 + 1
        )?;
        if let Some(fps) = self.fps {
            write!(f, " - {fps:.2} Hz")?;
        }
        if let Some(tint) = self.tint {
            write!(f, " - {:.1} ms", tint * 1e3)?;
        }
        let (cols, rows) = self
            .fgsize
            .unwrap_or((self.x1.wrapping_sub(self.x0) + 1, self.y1.wrapping_sub(self.y0) + 1));
        write!(
            f,
            " - bin {} x {} - FGsize ({cols}, {rows})",
            self.binx, self.biny
        )
    }
}

/// Mapping from mode identifier to preset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModeTable {
    modes: BTreeMap<ModeId, CameraMode>,
}

impl ModeTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, id: impl Into<ModeId>, mode: CameraMode) -> Self {
        self.modes.insert(id.into(), mode);
        self
    }

    /// Add or replace one preset.
    pub fn insert(&mut self, id: impl Into<ModeId>, mode: CameraMode) {
        self.modes.insert(id.into(), mode);
    }

    /// Preset for `id`, or `InvalidMode`.
    pub fn lookup(&self, id: &ModeId) -> AppResult<&CameraMode> {
        self.modes
            .get(id)
            .ok_or_else(|| CamstackError::InvalidMode(id.to_string()))
    }

    /// `(width, height)` of the transport, honoring the raw framegrabber geometry.
    pub fn size_of(&self, id: &ModeId) -> AppResult<(u32, u32)> {
        Ok(self.lookup(id)?.fg_size())
    }

    /// Whether `id` is in the table.
    pub fn contains(&self, id: &ModeId) -> bool {
        self.modes.contains_key(id)
    }

    /// `self ⊕ overrides`: the override entries win on duplicate identifiers.
    pub fn merged(&self, overrides: &ModeTable) -> ModeTable {
        let mut modes = self.modes.clone();
        for (id, mode) in &overrides.modes {
            modes.insert(id.clone(), mode.clone());
        }
        ModeTable { modes }
    }

    /// Insert (or replace) the `CUSTOM` window and return its identifier.
    /// The table is untouched if the window is invalid.
    pub fn insert_custom(
        &mut self,
        height: u32,
        width: u32,
        h_offset: u32,
        w_offset: u32,
    ) -> AppResult<ModeId> {
        let mode = CameraMode::from_window(height, width, h_offset, w_offset)?;
        let id = ModeId::custom();
        self.modes.insert(id.clone(), mode);
        Ok(id)
    }

    /// Identifiers in order.
    pub fn ids(&self) -> impl Iterator<Item = &ModeId> {
        self.modes.keys()
    }

    /// Presets in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = (&ModeId, &CameraMode)> {
        self.modes.iter()
    }

    /// Number of presets.
    pub fn len(&self) -> usize {
        self.modes.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    /// Validate every preset.
    pub fn validate(&self) -> AppResult<()> {
        for (id, mode) in &self.modes {
            mode.validate()
                .map_err(|e| CamstackError::Configuration(format!("mode {id}: {e}")))?;
        }
        Ok(())
    }
}
