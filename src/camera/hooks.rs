//! Vendor-hook surface of a camera family.
//!
//! A new family implements [`CameraBackend`]: the three reconfiguration hooks
//! (`init_framegrab_backend`, `prepare_camera_for_size`,
//! `prepare_camera_finalize`), the serial dialogue and the telemetry poll,
//! plus how its worker is launched and how readiness is signalled.
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use camstack::camera::hooks::{ensure_worker_stopped, CameraBackend, HookContext};
//! use camstack::config::{CameraFamily, TimingConfig};
//! use camstack::error::AppResult;
//! use camstack::worker::{ParamRequest, Readiness, WorkerCommand};
//!
//! #[derive(Debug)]
//! struct Bench;
//!
//! #[async_trait]
//! impl CameraBackend for Bench {
//!     fn family(&self) -> CameraFamily { CameraFamily::Edt }
//!     fn detector(&self) -> &str { "BENCH" }
//!     fn worker_command(&self, ctx: &HookContext<'_>, reuse: bool) -> WorkerCommand {
//!         WorkerCommand::new("hwacq-edttake", ctx.camera.stream_name.clone()).reusing_stream(reuse)
//!     }
//!     fn readiness(&self, timing: &TimingConfig) -> Readiness {
//!         Readiness::FixedDelay(timing.fixed_ready_delay)
//!     }
//!     async fn init_framegrab_backend(&mut self, ctx: &HookContext<'_>) -> AppResult<()> {
//!         ensure_worker_stopped(ctx).await
//!     }
//!     async fn prepare_camera_for_size(
//!         &mut self,
//!         ctx: &HookContext<'_>,
//!         _injection: &[ParamRequest],
//!     ) -> AppResult<()> {
//!         ensure_worker_stopped(ctx).await
//!     }
//! }
//! ```

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use crate::config::{CameraConfig, CameraFamily, TimingConfig};
use crate::error::{AppResult, CamstackError};
use crate::keywords::{KeywordPipeline, KeywordTable};
use crate::modes::{CameraMode, ModeId};
use crate::shm::StreamDirectory;
use crate::worker::{
    AcquisitionWorker, ControlSegment, ParamRequest, ParamType, Readiness, WorkerCommand,
};

/// What a hook may look at while it runs.
pub struct HookContext<'a> {
    /// Camera settings
    pub camera: &'a CameraConfig,
    /// Protocol timings
    pub timing: &'a TimingConfig,
    /// Segment directory
    pub streams: &'a StreamDirectory,
    /// Header keywords of the current stream
    pub keywords: &'a KeywordPipeline,
    /// The acquisition worker
    pub worker: &'a AcquisitionWorker,
    /// Mode being configured or served
    pub mode_id: &'a ModeId,
    /// Its window
    pub mode: &'a CameraMode,
}

impl HookContext<'_> {
    /// Any mode other than the full frame.
    pub fn cropped(&self) -> bool {
        *self.mode_id != self.camera.full_mode
    }
}

/// Vendor hooks of a camera family. Defaults are no-ops or `Unsupported`.
#[async_trait]
pub trait CameraBackend: Send + Sync + fmt::Debug {
    /// Family this backend implements.
    fn family(&self) -> CameraFamily;

    /// Default `DETECTOR` keyword.
    fn detector(&self) -> &str;

    /// Keywords this family publishes.
    fn keyword_table(&self) -> AppResult<KeywordTable> {
        KeywordTable::base()
    }

    /// Worker launch command for the current mode.
    fn worker_command(&self, ctx: &HookContext<'_>, reuse_stream: bool) -> WorkerCommand;

    /// How the supervisor knows a freshly launched worker is up.
    fn readiness(&self, timing: &TimingConfig) -> Readiness;

    /// Parameter mailbox, for families that have one.
    fn control(&self) -> Option<&Arc<ControlSegment>> {
        None
    }

    /// Wire type of control-segment parameter `id`.
    fn param_type(&self, _id: u32) -> ParamType {
        ParamType::Float64
    }

    /// Parameters pushed with the geometry when an exposure is aborted.
    /// `None` when the family cannot abort.
    fn abort_injection(&self) -> Option<Vec<ParamRequest>> {
        None
    }

    /// `(height, width)` detected by the hardware when it no longer matches
    /// the current mode.
    fn detect_resize(&self, _ctx: &HookContext<'_>) -> Option<(u32, u32)> {
        None
    }

    /// Open hardware handles, rewrite framegrabber configuration.
    async fn init_framegrab_backend(&mut self, ctx: &HookContext<'_>) -> AppResult<()>;

    /// Load the geometry of `ctx.mode` into the hardware, plus `injection`.
    async fn prepare_camera_for_size(
        &mut self,
        ctx: &HookContext<'_>,
        injection: &[ParamRequest],
    ) -> AppResult<()>;

    /// Refinement once the worker runs.
    async fn prepare_camera_finalize(&mut self, _ctx: &HookContext<'_>) -> AppResult<()> {
        Ok(())
    }

    /// Serial dialogue with the camera head.
    async fn send_command(
        &self,
        _ctx: &HookContext<'_>,
        command: &str,
        _timeout: Duration,
    ) -> AppResult<String> {
        Err(CamstackError::Unsupported(format!(
            "{} has no serial link (command {command:?})",
            self.family()
        )))
    }

    /// Telemetry pulled by the polling task.
    async fn poll_camera_for_keywords(&mut self, _ctx: &HookContext<'_>) -> AppResult<()> {
        Ok(())
    }

    /// Exposure time (s).
    async fn get_tint(&mut self, _ctx: &HookContext<'_>) -> AppResult<f64> {
        Err(CamstackError::Unsupported(format!("get_tint on {}", self.family())))
    }

    /// Set the exposure, returning the value the camera accepted.
    async fn set_tint(&mut self, _ctx: &HookContext<'_>, _tint: f64) -> AppResult<f64> {
        Err(CamstackError::Unsupported(format!("set_tint on {}", self.family())))
    }

    /// Frame rate (Hz).
    async fn get_fps(&mut self, _ctx: &HookContext<'_>) -> AppResult<f64> {
        Err(CamstackError::Unsupported(format!("get_fps on {}", self.family())))
    }

    /// Set the frame rate, returning the value the camera accepted.
    async fn set_fps(&mut self, _ctx: &HookContext<'_>, _fps: f64) -> AppResult<f64> {
        Err(CamstackError::Unsupported(format!("set_fps on {}", self.family())))
    }

    /// Best-effort release of vendor resources.
    async fn release(&mut self) {}
}

/// Fail with `CannotReconfigureWhileRunning` if the worker is still up after
/// one retry.
pub async fn ensure_worker_stopped(ctx: &HookContext<'_>) -> AppResult<()> {
    if !ctx.worker.is_running().await {
        return Ok(());
    }
    warn!(
        camera = %ctx.camera.name,
        retry = ?ctx.timing.reconfigure_retry,
        "worker still running, waiting before reconfiguring"
    );
    tokio::time::sleep(ctx.timing.reconfigure_retry).await;
    if ctx.worker.is_running().await {
        error!(camera = %ctx.camera.name, "cannot change camera configuration while the worker runs");
        return Err(CamstackError::CannotReconfigureWhileRunning);
    }
    Ok(())
}
