//! EDT framegrabber cameras.
//!
//! The framegrabber is configured from a text file (`width:`, `height:`, tap
//! layout, ...) loaded by `initcam` before the worker starts; the camera head
//! itself is only reachable through the camlink serial line (`serial_cmd`).
//!
//! The auto-resize variant is for heads the supervisor cannot control: the
//! worker reports the geometry it measures on the link as `_FGDETS1` (lines
//! per frame) and `_FGDETS2` (pixels per line per tap), and a mismatch with
//! the current mode triggers a resize from the polling task.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::hooks::{ensure_worker_stopped, CameraBackend, HookContext};
use crate::config::{CameraConfig, CameraFamily, TimingConfig};
use crate::error::{AppResult, CamstackError};
use crate::modes::{CameraMode, ModeTable};
use crate::worker::{ParamRequest, Readiness, WorkerCommand};

/// Default EDT acquisition worker.
pub const EDT_EXEC: &str = "hwacq-edttake";
/// EDT serial helper.
pub const SERIAL_CMD: &str = "/opt/EDTpdv/serial_cmd";

/// Keywords the worker fills with the measured link geometry.
pub const DETECTED_LINES: &str = "_FGDETS1";
/// Keyword the worker fills with the measured pixels per line.
pub const DETECTED_PIXELS: &str = "_FGDETS2";

const MINIMAL_CONFIG: &str = "camera_class: \"Generic\"\ncamera_model: \"CameraLink 16-bit\"\ndepth: 16\nextdepth: 16\n";

/// Built-in EDT modes.
pub fn modes() -> ModeTable {
    ModeTable::new().with("FULL", CameraMode::new(0, 319, 0, 255))
}

/// `<tmp>/<user>_<camera>.cfg`
pub fn config_path(camera: &CameraConfig) -> PathBuf {
    let user = std::env::var("USER").unwrap_or_else(|_| "camstack".to_string());
    std::env::temp_dir().join(format!("{user}_{}.cfg", camera.name))
}

/// `base` with its geometry lines replaced by the transport size of `mode`.
///
/// With the byte-pair cast the link carries twice as many 8-bit pixels per line.
pub fn render_config(base: &str, mode: &CameraMode, cast_to_u16: bool) -> String {
    let (width, height) = mode.fg_size();
    let width = if cast_to_u16 { 2 * width } else { width };
    let mut out: String = base
        .lines()
        .filter(|line| {
            let line = line.trim_start();
            !line.starts_with("width:") && !line.starts_with("height:")
        })
        .flat_map(|line| [line, "\n"])
        .collect();
    out.push_str(&format!("width: {width}\nheight: {height}\n"));
    out
}

/// Camera-link head behind an EDT framegrabber.
#[derive(Debug)]
pub struct EdtCamera {
    auto_resize: bool,
    serial_cmd: String,
}

impl EdtCamera {
    /// With `auto_resize`, the mode follows the geometry the grabber detects.
    pub fn new(auto_resize: bool) -> Self {
        Self {
            auto_resize,
            serial_cmd: SERIAL_CMD.to_string(),
        }
    }

    /// Use another serial helper.
    pub fn with_serial_cmd(mut self, program: impl Into<String>) -> Self {
        self.serial_cmd = program.into();
        self
    }

    async fn write_config(&self, ctx: &HookContext<'_>) -> AppResult<PathBuf> {
        let base = match &ctx.camera.base_config {
            Some(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                CamstackError::HardwareNotFound(format!("EDT config {}: {e}", path.display()))
            })?,
            None => MINIMAL_CONFIG.to_string(),
        };
        let path = config_path(ctx.camera);
        tokio::fs::write(&path, render_config(&base, ctx.mode, ctx.camera.cast_to_u16)).await?;
        Ok(path)
    }
}

#[async_trait]
impl CameraBackend for EdtCamera {
    fn family(&self) -> CameraFamily {
        if self.auto_resize {
            CameraFamily::AutoEdt
        } else {
            CameraFamily::Edt
        }
    }

    fn detector(&self) -> &str {
        "EDT"
    }

    fn worker_command(&self, ctx: &HookContext<'_>, reuse_stream: bool) -> WorkerCommand {
        let exec = ctx.camera.exec.clone().unwrap_or_else(|| EDT_EXEC.to_string());
        let mut cmd = WorkerCommand::new(exec, ctx.camera.stream_name.clone())
            .with_unit(ctx.camera.unit, ctx.camera.channel)
            .reusing_stream(reuse_stream);
        cmd.cast_to_u16 = ctx.camera.cast_to_u16;
        cmd.unsigned = ctx.camera.unsigned;
        cmd.timestamp = ctx.camera.timestamp;
        cmd
    }

    fn readiness(&self, timing: &TimingConfig) -> Readiness {
        Readiness::FixedDelay(timing.fixed_ready_delay)
    }

    fn detect_resize(&self, ctx: &HookContext<'_>) -> Option<(u32, u32)> {
        if !self.auto_resize {
            return None;
        }
        let stream = ctx.keywords.stream()?;
        let lines = stream.get_keyword(DETECTED_LINES)?.as_i64()?;
        let pixels = stream.get_keyword(DETECTED_PIXELS)?.as_i64()?;
        let height = u32::try_from(lines).ok()?;
        let width = u32::try_from(pixels).ok()?.checked_mul(ctx.camera.taps.max(1))?;
        if height == 0 || width == 0 {
            return None;
        }
        let (cur_w, cur_h) = ctx.mode.fg_size();
        if (height, width) == (cur_h, cur_w) {
            return None;
        }
        warn!(
            camera = %ctx.camera.name,
            from = ?(cur_h, cur_w),
            to = ?(height, width),
            "frame size changed behind the supervisor"
        );
        Some((height, width))
    }

    async fn init_framegrab_backend(&mut self, ctx: &HookContext<'_>) -> AppResult<()> {
        ensure_worker_stopped(ctx).await?;
        let cfg = self.write_config(ctx).await?;
        let session = ctx
            .worker
            .session_handle()
            .ok_or_else(|| CamstackError::Session("worker session not open".into()))?;
        let args = vec![
            "-u".to_string(),
            ctx.camera.unit.to_string(),
            "-c".to_string(),
            ctx.camera.channel.to_string(),
            "-f".to_string(),
            cfg.display().to_string(),
        ];
        session
            .run_helper(&ctx.camera.initcam, &args)
            .await
            .map_err(|e| CamstackError::HardwareNotFound(format!("initcam: {e}")))?;
        info!(camera = %ctx.camera.name, config = %cfg.display(), "framegrabber initialised");
        Ok(())
    }

    async fn prepare_camera_for_size(
        &mut self,
        ctx: &HookContext<'_>,
        injection: &[ParamRequest],
    ) -> AppResult<()> {
        ensure_worker_stopped(ctx).await?;
        if !injection.is_empty() {
            warn!(camera = %ctx.camera.name, n = injection.len(), "EDT heads take no parameter injection");
        }
        Ok(())
    }

    async fn send_command(
        &self,
        ctx: &HookContext<'_>,
        command: &str,
        timeout: Duration,
    ) -> AppResult<String> {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let mut cmd = Command::new(&self.serial_cmd);
        cmd.args([
            "-u",
            &ctx.camera.unit.to_string(),
            "-c",
            &ctx.camera.channel.to_string(),
            "-t",
            &timeout_ms.to_string(),
            command,
        ])
        .kill_on_drop(true);
        debug!(camera = %ctx.camera.name, command, "serial command");

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| {
                CamstackError::HardwareNotFound(format!("{}: {e}", self.serial_cmd))
            })?,
            Err(_) => {
                warn!(camera = %ctx.camera.name, command, timeout_ms, "serial command timed out");
                return Err(CamstackError::SerialTimeout {
                    command: command.to_string(),
                    timeout_ms,
                });
            }
        };
        if !output.status.success() {
            warn!(
                camera = %ctx.camera.name,
                command,
                status = %output.status,
                "serial command failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keywords::{KeywordPipeline, KeywordTable, KeywordValue};
    use crate::modes::ModeId;
    use crate::session::mock::{MockProvider, SessionEventKind};
    use crate::shm::{PixelType, StreamDirectory};
    use crate::worker::AcquisitionWorker;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn config_geometry_is_replaced() {
        let base = "camera_class: \"FIRST\"\nwidth: 32\nheight: 32\ndepth: 16\n";
        let mode = CameraMode::new(0, 127, 0, 63);
        let cfg = render_config(base, &mode, false);
        assert!(cfg.starts_with("camera_class: \"FIRST\"\ndepth: 16\n"));
        assert!(cfg.ends_with("width: 128\nheight: 64\n"));
        assert!(!cfg.contains("width: 32"));

        let cfg = render_config(base, &mode, true);
        assert!(cfg.contains("width: 256\n"));
    }

    #[tokio::test]
    async fn init_runs_initcam_with_the_written_config() {
        let dir = tempdir().unwrap();
        let provider = Arc::new(MockProvider::new());
        let timing = TimingConfig::fast();
        let mut worker = AcquisitionWorker::new(provider.clone(), "edtcam_test_fgrab", timing.clone());
        worker.initialize().await.unwrap();

        let mut camera = CameraConfig::new("edtcam_test", "edtcam", CameraFamily::Edt);
        camera.unit = 1;
        let streams = StreamDirectory::new(dir.path());
        let keywords = KeywordPipeline::new(KeywordTable::base().unwrap());
        let mode_id = ModeId::from("FULL");
        let mode = CameraMode::new(0, 319, 0, 255);
        let ctx = HookContext {
            camera: &camera,
            timing: &timing,
            streams: &streams,
            keywords: &keywords,
            worker: &worker,
            mode_id: &mode_id,
            mode: &mode,
        };

        let mut edt = EdtCamera::new(false);
        edt.init_framegrab_backend(&ctx).await.unwrap();

        let cfg = config_path(&camera);
        let text = std::fs::read_to_string(&cfg).unwrap();
        assert!(text.ends_with("width: 320\nheight: 256\n"));
        let helpers: Vec<String> = provider
            .events_for("edtcam_test_fgrab")
            .into_iter()
            .filter_map(|e| match e.kind {
                SessionEventKind::Helper(line) => Some(line),
                _ => None,
            })
            .collect();
        assert_eq!(
            helpers,
            vec![format!("/opt/EDTpdv/initcam -u 1 -c 0 -f {}", cfg.display())]
        );
        let _ = std::fs::remove_file(cfg);
    }

    #[tokio::test]
    async fn detects_a_resize_from_the_stream_header() {
        let dir = tempdir().unwrap();
        let provider = Arc::new(MockProvider::new());
        let timing = TimingConfig::fast();
        let worker = AcquisitionWorker::new(provider, "vcam_fgrab", timing.clone());
        let mut camera = CameraConfig::new("vcam", "vcam", CameraFamily::AutoEdt);
        camera.taps = 2;
        let streams = StreamDirectory::new(dir.path());
        let image = streams.create("vcam", 8, 8, PixelType::U16, 16).unwrap();
        image.update_keyword(DETECTED_LINES, &KeywordValue::Int(256)).unwrap();
        image.update_keyword(DETECTED_PIXELS, &KeywordValue::Int(160)).unwrap();
        let mut keywords = KeywordPipeline::new(KeywordTable::base().unwrap());
        keywords.attach(Arc::new(image));

        let mode_id = ModeId::from("FULL");
        let full = CameraMode::new(0, 319, 0, 255);
        let ctx = HookContext {
            camera: &camera,
            timing: &timing,
            streams: &streams,
            keywords: &keywords,
            worker: &worker,
            mode_id: &mode_id,
            mode: &full,
        };
        let auto = EdtCamera::new(true);
        assert_eq!(auto.detect_resize(&ctx), None);
        assert_eq!(EdtCamera::new(false).detect_resize(&ctx), None);

        let half = CameraMode::new(0, 319, 0, 127);
        let ctx = HookContext { mode: &half, ..ctx };
        assert_eq!(auto.detect_resize(&ctx), Some((256, 320)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_serial_line_times_out() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let script = dir.path().join("serial_cmd");
        std::fs::write(&script, "#!/bin/sh\nsleep 5\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let provider = Arc::new(MockProvider::new());
        let timing = TimingConfig::fast();
        let worker = AcquisitionWorker::new(provider, "c_fgrab", timing.clone());
        let camera = CameraConfig::new("c", "c", CameraFamily::Edt);
        let streams = StreamDirectory::new(dir.path());
        let keywords = KeywordPipeline::new(KeywordTable::base().unwrap());
        let mode_id = ModeId::from("FULL");
        let mode = CameraMode::new(0, 9, 0, 9);
        let ctx = HookContext {
            camera: &camera,
            timing: &timing,
            streams: &streams,
            keywords: &keywords,
            worker: &worker,
            mode_id: &mode_id,
            mode: &mode,
        };

        let edt = EdtCamera::new(false).with_serial_cmd(script.display().to_string());
        let err = edt
            .send_command(&ctx, "temp", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CamstackError::SerialTimeout { timeout_ms: 100, .. }));
    }
}
