//! Configuration for a camera supervisor, loaded with Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (`--config`, e.g. `config/simcam.toml`)
//! 2. environment variables prefixed with `CAMSTACK_`, nested with `__`
//!    (e.g. `CAMSTACK_APPLICATION__LOG_LEVEL=debug`)
//!
//! # Example
//! ```no_run
//! use camstack::config::CamstackConfig;
//!
//! let config = CamstackConfig::load_from("config/simcam.toml")?;
//! println!("Camera: {}", config.camera.name);
//! # Ok::<(), camstack::error::CamstackError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::camera::family_modes;
use crate::dependents::DependentProcess;
use crate::error::{AppResult, CamstackError};
use crate::modes::{ModeId, ModeTable};
use crate::shm::StreamDirectory;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CamstackConfig {
    /// Name, logging
    #[serde(default)]
    pub application: ApplicationConfig,
    /// The supervised camera
    pub camera: CameraConfig,
    /// Extra modes, merged over the family's built-in table
    #[serde(default)]
    pub modes: ModeTable,
    /// Processes coupled to the stream geometry
    #[serde(default)]
    pub dependents: Vec<DependentProcess>,
    /// Keyword mirror
    #[serde(default)]
    pub store: StoreConfig,
    /// TCP server and shell
    #[serde(default)]
    pub rpc: RpcConfig,
    /// Protocol delays and timeouts
    #[serde(default)]
    pub timing: TimingConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Label used in logs
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// pretty, compact or json
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Directory of the per-camera log file; no file logging when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            log_dir: None,
        }
    }
}

/// Camera families with built-in behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CameraFamily {
    /// Frame generator, no hardware
    #[default]
    Simulated,
    /// EDT framegrabber camera
    Edt,
    /// EDT framegrabber in dumb mode: geometry follows the detector
    AutoEdt,
    /// Hamamatsu DCAM, parameters through the control segment
    Dcam,
    /// Teledyne PVCAM, parameters through the control segment
    Pvcam,
}

impl CameraFamily {
    /// Whether parameters go through the control segment (else serial or none).
    pub fn uses_control_segment(self) -> bool {
        matches!(
            self,
            CameraFamily::Simulated | CameraFamily::Dcam | CameraFamily::Pvcam
        )
    }
}

impl std::fmt::Display for CameraFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CameraFamily::Simulated => "simulated",
            CameraFamily::Edt => "edt",
            CameraFamily::AutoEdt => "auto_edt",
            CameraFamily::Dcam => "dcam",
            CameraFamily::Pvcam => "pvcam",
        };
        f.write_str(name)
    }
}

/// Camera and acquisition-worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Camera name; the worker session is `<name>_fgrab`
    pub name: String,
    /// Name of the image stream the worker publishes
    pub stream_name: String,
    /// Built-in behavior and mode table
    #[serde(default)]
    pub family: CameraFamily,
    /// Mode used when `initialize` gets none
    #[serde(default)]
    pub initial_mode: Option<ModeId>,
    /// Stop after configuring the backend, without starting the worker
    #[serde(default)]
    pub no_start: bool,
    /// Framegrabber unit / camera index
    #[serde(default)]
    pub unit: u32,
    /// Framegrabber channel
    #[serde(default)]
    pub channel: u32,
    /// Sensor taps (EDT)
    #[serde(default = "default_taps")]
    pub taps: u32,
    /// Framegrabber base configuration (EDT families)
    #[serde(default)]
    pub base_config: Option<PathBuf>,
    /// EDT `initcam` executable
    #[serde(default = "default_initcam")]
    pub initcam: String,
    /// Acquisition worker executable; each family has a default
    #[serde(default)]
    pub exec: Option<String>,
    /// CPU set the worker is moved into
    #[serde(default = "default_cset")]
    pub taker_cset: String,
    /// Real-time priority of the worker
    #[serde(default)]
    pub taker_rtprio: Option<u32>,
    /// DETECTOR keyword; defaults to the family's name
    #[serde(default)]
    pub detector: Option<String>,
    /// Store prefix, e.g. `x_C`. No mirroring when unset
    #[serde(default)]
    pub keyword_prefix: Option<String>,
    /// Mirror keywords to the store on every poll
    #[serde(default = "default_true")]
    pub push_keywords: bool,
    /// Number of placeholder WCS keyword sets
    #[serde(default)]
    pub n_wcs: usize,
    /// Worker launch attempts before giving up
    #[serde(default = "default_start_attempts")]
    pub start_attempts: u32,
    /// Worker `-8`: byte pairs cast to uint16 at grab
    #[serde(default)]
    pub cast_to_u16: bool,
    /// Worker `-U`: keep unsigned output
    #[serde(default)]
    pub unsigned: bool,
    /// Worker `-t`: embed a grab timestamp
    #[serde(default)]
    pub timestamp: bool,
    /// Mode considered uncropped
    #[serde(default = "default_full_mode")]
    pub full_mode: ModeId,
    /// Segment directory; `$MILK_SHM_DIR` when unset
    #[serde(default)]
    pub shm_dir: Option<PathBuf>,
}

impl CameraConfig {
    /// Defaults for everything but the identity and family.
    pub fn new(name: &str, stream_name: &str, family: CameraFamily) -> Self {
        Self {
            name: name.to_string(),
            stream_name: stream_name.to_string(),
            family,
            initial_mode: None,
            no_start: false,
            unit: 0,
            channel: 0,
            taps: default_taps(),
            base_config: None,
            initcam: default_initcam(),
            exec: None,
            taker_cset: default_cset(),
            taker_rtprio: None,
            detector: None,
            keyword_prefix: None,
            push_keywords: true,
            n_wcs: 0,
            start_attempts: default_start_attempts(),
            cast_to_u16: false,
            unsigned: false,
            timestamp: false,
            full_mode: default_full_mode(),
            shm_dir: None,
        }
    }

    /// Session hosting the acquisition worker.
    pub fn worker_session(&self) -> String {
        format!("{}_fgrab", self.name)
    }

    /// Where the camera's segments live.
    pub fn stream_directory(&self) -> StreamDirectory {
        match &self.shm_dir {
            Some(dir) => StreamDirectory::new(dir),
            None => StreamDirectory::from_env(),
        }
    }
}

/// External keyword store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Mirror to the store at `url`; in-memory store otherwise
    #[serde(default)]
    pub enabled: bool,
    /// Redis-compatible URL
    #[serde(default = "default_store_url")]
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_store_url(),
        }
    }
}

/// Operator surfaces
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RpcConfig {
    /// Address of the JSON-lines server; no server when unset
    #[serde(default)]
    pub bind: Option<String>,
    /// Run the interactive shell on stdin
    #[serde(default)]
    pub shell: bool,
}

/// Delays and timeouts of the supervisor protocols.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Period of the polling task
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Between Ctrl-C and Ctrl-Z when stopping a job
    #[serde(with = "humantime_serde")]
    pub interrupt_grace: Duration,
    /// After the last suspend of a batched stop
    #[serde(with = "humantime_serde")]
    pub kill_settle: Duration,
    /// Between launching dependents and pinning them
    #[serde(with = "humantime_serde")]
    pub batch_delay: Duration,
    /// Before stopping a freshly created session (lets the shell profile load)
    #[serde(with = "humantime_serde")]
    pub session_settle: Duration,
    /// Readiness delay of framegrabber-style workers
    #[serde(with = "humantime_serde")]
    pub fixed_ready_delay: Duration,
    /// Readiness timeout of control-segment workers
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,
    /// Wait before re-checking a worker that blocks a reconfiguration
    #[serde(with = "humantime_serde")]
    pub reconfigure_retry: Duration,
    /// Control segment round-trip budget
    #[serde(with = "humantime_serde")]
    pub control_timeout: Duration,
    /// Wait for the first frame of a (re)published stream
    #[serde(with = "humantime_serde")]
    pub stream_timeout: Duration,
    /// Budget of one keyword-store push
    #[serde(with = "humantime_serde")]
    pub store_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            interrupt_grace: Duration::from_secs(2),
            kill_settle: Duration::from_millis(500),
            batch_delay: Duration::from_secs(1),
            session_settle: Duration::from_secs(3),
            fixed_ready_delay: Duration::from_secs(1),
            ready_timeout: Duration::from_secs(15),
            reconfigure_retry: Duration::from_secs(3),
            control_timeout: Duration::from_secs(1),
            stream_timeout: Duration::from_secs(15),
            store_timeout: Duration::from_secs(2),
        }
    }
}

impl TimingConfig {
    /// Millisecond-scale timings for simulated setups.
    pub fn fast() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            interrupt_grace: Duration::from_millis(20),
            kill_settle: Duration::from_millis(5),
            batch_delay: Duration::from_millis(10),
            session_settle: Duration::from_millis(10),
            fixed_ready_delay: Duration::from_millis(50),
            ready_timeout: Duration::from_secs(3),
            reconfigure_retry: Duration::from_millis(50),
            control_timeout: Duration::from_secs(1),
            stream_timeout: Duration::from_secs(3),
            store_timeout: Duration::from_millis(200),
        }
    }
}

fn default_app_name() -> String {
    "camstack".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_taps() -> u32 {
    1
}

fn default_initcam() -> String {
    "/opt/EDTpdv/initcam".to_string()
}

fn default_cset() -> String {
    "system".to_string()
}

fn default_true() -> bool {
    true
}

fn default_start_attempts() -> u32 {
    1
}

fn default_full_mode() -> ModeId {
    ModeId::Name("FULL".to_string())
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

impl CamstackConfig {
    /// Defaults around `camera`.
    pub fn new(camera: CameraConfig) -> Self {
        Self {
            application: ApplicationConfig::default(),
            camera,
            modes: ModeTable::new(),
            dependents: Vec::new(),
            store: StoreConfig::default(),
            rpc: RpcConfig::default(),
            timing: TimingConfig::default(),
        }
    }

    /// Load from a TOML file plus `CAMSTACK_` environment overrides, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CAMSTACK_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text, without environment overrides.
    pub fn from_toml_str(raw: &str) -> AppResult<Self> {
        let config: Self = Figment::new().merge(Toml::string(raw)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Family table with the configured modes merged over it.
    pub fn mode_table(&self) -> ModeTable {
        family_modes(self.camera.family).merged(&self.modes)
    }

    /// Semantic checks: log level and format, names, mode windows and dependents.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(CamstackError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(CamstackError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.camera.name.trim().is_empty() {
            return Err(CamstackError::Configuration("camera.name is empty".into()));
        }
        if self.camera.stream_name.trim().is_empty() {
            return Err(CamstackError::Configuration(
                "camera.stream_name is empty".into(),
            ));
        }
        if self.camera.start_attempts == 0 {
            return Err(CamstackError::Configuration(
                "camera.start_attempts must be >= 1".into(),
            ));
        }

        let modes = self.mode_table();
        modes.validate()?;
        if let Some(initial) = &self.camera.initial_mode {
            if !modes.contains(initial) {
                return Err(CamstackError::Configuration(format!(
                    "initial_mode '{initial}' is not in the mode table"
                )));
            }
        }

        let mut sessions = HashSet::new();
        for dep in &self.dependents {
            if dep.name.trim().is_empty() {
                return Err(CamstackError::Configuration(
                    "dependent with an empty session name".into(),
                ));
            }
            if !sessions.insert((dep.host.clone(), dep.name.clone())) {
                return Err(CamstackError::Configuration(format!(
                    "Duplicate dependent session: {}",
                    dep.name
                )));
            }
            dep.validate()?;
        }
        if sessions.contains(&(None, self.camera.worker_session())) {
            return Err(CamstackError::Configuration(format!(
                "dependent uses the worker session {}",
                self.camera.worker_session()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependents::DependentArg;
    use crate::modes::CameraMode;
    use serial_test::serial;
    use std::io::Write;

    const SAMPLE: &str = r##"
[application]
name = "simcam supervisor"
log_level = "debug"

[camera]
name = "simcam"
stream_name = "simcam"
family = "simulated"
initial_mode = "HALF"
keyword_prefix = "x_S"

[modes.HALF]
x0 = 80
x1 = 239
y0 = 64
y1 = 191
tint = 0.01

[modes.12]
x0 = 0
x1 = 63
y0 = 0
y1 = 63

[[dependents]]
name = "simcam_tcp"
command = "shmimTCPtransmit {0} {1} {width}"
args = ["simcam", "#HEIGHT#"]
start_order = 2
kill_order = 1
rtprio = 45

[timing]
poll_interval = "5s"
interrupt_grace = "250ms"
"##;

    #[test]
    fn parses_sample() {
        let config = CamstackConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.camera.family, CameraFamily::Simulated);
        assert_eq!(config.camera.worker_session(), "simcam_fgrab");
        assert_eq!(config.timing.poll_interval, Duration::from_secs(5));
        assert_eq!(config.timing.interrupt_grace, Duration::from_millis(250));
        assert_eq!(config.timing.ready_timeout, Duration::from_secs(15));

        let modes = config.mode_table();
        assert_eq!(modes.size_of(&"HALF".into()).unwrap(), (160, 128));
        assert!(modes.contains(&ModeId::Index(12)));
        assert!(modes.contains(&"FULL".into()));

        let dep = &config.dependents[0];
        assert_eq!(dep.args[1], DependentArg::Height);
        assert!(dep.kill_upon_create);
        assert_eq!(dep.cset, "system");
    }

    #[test]
    fn rejects_bad_log_level() {
        let raw = SAMPLE.replace("log_level = \"debug\"", "log_level = \"loud\"");
        assert!(matches!(
            CamstackConfig::from_toml_str(&raw),
            Err(CamstackError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_unknown_initial_mode() {
        let raw = SAMPLE.replace("initial_mode = \"HALF\"", "initial_mode = \"NOPE\"");
        assert!(CamstackConfig::from_toml_str(&raw).is_err());
    }

    #[test]
    fn rejects_inverted_mode() {
        let mut config = CamstackConfig::from_toml_str(SAMPLE).unwrap();
        config.modes.insert("BAD", CameraMode::new(10, 0, 0, 10));
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_dependent_in_worker_session() {
        let raw = SAMPLE.replace("name = \"simcam_tcp\"", "name = \"simcam_fgrab\"");
        assert!(CamstackConfig::from_toml_str(&raw).is_err());
    }

    #[test]
    #[serial]
    fn environment_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        std::env::set_var("CAMSTACK_APPLICATION__LOG_LEVEL", "warn");
        let config = CamstackConfig::load_from(file.path());
        std::env::remove_var("CAMSTACK_APPLICATION__LOG_LEVEL");

        assert_eq!(config.unwrap().application.log_level, "warn");
    }
}
