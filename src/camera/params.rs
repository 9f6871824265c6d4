//! Control-segment cameras (DCAM, PVCAM and the simulated SDK camera).
//!
//! These families never talk to the hardware themselves: geometry and
//! exposure are left in the control segment before the worker starts, and
//! every runtime change is a [`ControlSegment::transact`] round trip.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::hooks::{ensure_worker_stopped, CameraBackend, HookContext};
use crate::config::{CameraFamily, TimingConfig};
use crate::error::{AppResult, CamstackError};
use crate::keywords::{KeywordPipeline, KeywordValue};
use crate::modes::CameraMode;
use crate::worker::{ControlSegment, ParamRequest, ParamType, Readiness, WorkerCommand};

/// Hamamatsu DCAM property ids. Every property travels as a double.
pub mod dcam {
    /// `DCAM_IDPROP_EXPOSURETIME` (s)
    pub const EXPOSURETIME: u32 = 0x001F_0110;
    /// `DCAM_IDPROP_SENSORTEMPERATURE` (°C)
    pub const SENSORTEMPERATURE: u32 = 0x0020_0310;
    /// `DCAM_IDPROP_SENSORCOOLERSTATUS`
    pub const SENSORCOOLERSTATUS: u32 = 0x0020_0340;
    /// `DCAM_IDPROP_READOUTSPEED`
    pub const READOUTSPEED: u32 = 0x0040_0110;
    /// `DCAM_IDPROP_BINNING`
    pub const BINNING: u32 = 0x0040_1110;
    /// `DCAM_IDPROP_SUBARRAYHPOS`
    pub const SUBARRAYHPOS: u32 = 0x0040_2110;
    /// `DCAM_IDPROP_SUBARRAYHSIZE`
    pub const SUBARRAYHSIZE: u32 = 0x0040_2120;
    /// `DCAM_IDPROP_SUBARRAYVPOS`
    pub const SUBARRAYVPOS: u32 = 0x0040_2130;
    /// `DCAM_IDPROP_SUBARRAYVSIZE`
    pub const SUBARRAYVSIZE: u32 = 0x0040_2140;
    /// `DCAM_IDPROP_SUBARRAYMODE`
    pub const SUBARRAYMODE: u32 = 0x0040_2150;

    /// Full-frame readout
    pub const SUBARRAYMODE_OFF: f64 = 1.0;
    /// Windowed readout
    pub const SUBARRAYMODE_ON: f64 = 2.0;
}

/// PVCAM parameter ids: `(type << 24) | (class << 16) | index`.
///
/// The `PARAMMAGIC_*` entries are not SDK parameters; the worker consumes
/// them when it sets up the acquisition.
pub mod pvcam {
    use crate::worker::ParamType;

    /// `TYPE_INT16`
    pub const TYPE_INT16: u32 = 1;
    /// `TYPE_INT32`
    pub const TYPE_INT32: u32 = 2;
    /// `TYPE_FLT64`
    pub const TYPE_FLT64: u32 = 4;
    /// `TYPE_UNS8`
    pub const TYPE_UNS8: u32 = 5;
    /// `TYPE_UNS16`
    pub const TYPE_UNS16: u32 = 6;
    /// `TYPE_UNS32`
    pub const TYPE_UNS32: u32 = 7;
    /// `TYPE_UNS64`
    pub const TYPE_UNS64: u32 = 8;
    /// `TYPE_ENUM`
    pub const TYPE_ENUM: u32 = 9;
    /// `TYPE_BOOLEAN`
    pub const TYPE_BOOLEAN: u32 = 11;
    /// `TYPE_INT8`
    pub const TYPE_INT8: u32 = 12;

    const fn param(ty: u32, class: u32, index: u32) -> u32 {
        (ty << 24) | (class << 16) | index
    }

    /// Sensor temperature (c°C)
    pub const PARAM_TEMP: u32 = param(TYPE_INT16, 2, 525);
    /// Temperature setpoint (c°C)
    pub const PARAM_TEMP_SETPOINT: u32 = param(TYPE_INT16, 2, 524);
    /// Gain table index
    pub const PARAM_GAIN_INDEX: u32 = param(TYPE_INT16, 2, 512);
    /// Speed table index
    pub const PARAM_SPDTAB_INDEX: u32 = param(TYPE_INT16, 2, 513);
    /// Exposure resolution
    pub const PARAM_EXP_RES: u32 = param(TYPE_ENUM, 3, 202);
    /// Fan speed setpoint
    pub const PARAM_FAN_SPEED_SETPOINT: u32 = param(TYPE_ENUM, 2, 710);

    /// Exposure time, in units of the exposure resolution
    pub const PARAMMAGIC_EXP_TIME: u32 = param(TYPE_UNS64, 0x7F, 1);
    /// First column
    pub const PARAMMAGIC_ROI_X0: u32 = param(TYPE_UNS64, 0x7F, 2);
    /// Last column
    pub const PARAMMAGIC_ROI_X1: u32 = param(TYPE_UNS64, 0x7F, 3);
    /// Horizontal binning
    pub const PARAMMAGIC_ROI_BINX: u32 = param(TYPE_UNS64, 0x7F, 4);
    /// First row
    pub const PARAMMAGIC_ROI_Y0: u32 = param(TYPE_UNS64, 0x7F, 5);
    /// Last row
    pub const PARAMMAGIC_ROI_Y1: u32 = param(TYPE_UNS64, 0x7F, 6);
    /// Vertical binning
    pub const PARAMMAGIC_ROI_BINY: u32 = param(TYPE_UNS64, 0x7F, 7);

    /// `EXP_RES_ONE_MICROSEC`
    pub const EXP_RES_ONE_MICROSEC: i64 = 1;

    /// Type byte of a parameter id.
    pub fn type_byte(id: u32) -> u32 {
        (id >> 24) & 0xFF
    }

    /// Transport type of a parameter, read from its type byte.
    pub fn param_type(id: u32) -> ParamType {
        match type_byte(id) {
            TYPE_INT16 | TYPE_INT32 | TYPE_INT8 => ParamType::Int32,
            TYPE_FLT64 => ParamType::Float64,
            TYPE_UNS8 | TYPE_UNS16 => ParamType::UInt16,
            TYPE_UNS32 | TYPE_ENUM => ParamType::UInt32,
            TYPE_BOOLEAN => ParamType::Bool,
            _ => ParamType::Int64,
        }
    }
}

/// How one SDK family names and scales its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDialect {
    /// Acquisition worker executable
    pub exec: &'static str,
    /// Default `DETECTOR` keyword
    pub detector: &'static str,
    /// Exposure parameter id
    pub exposure: u32,
    /// Transport units per second of exposure
    pub exposure_scale: f64,
    /// Sensor temperature parameter id
    pub temperature: u32,
    /// Degrees Celsius per transport unit
    pub temperature_scale: f64,
    /// Pass the window on the command line (`-W`/`-H`)
    pub geometry_on_cmdline: bool,
    family: CameraFamily,
}

impl ParamDialect {
    /// Hamamatsu DCAM.
    pub fn dcam() -> Self {
        Self {
            exec: "hwacq-dcamtake",
            detector: "DCAM",
            exposure: dcam::EXPOSURETIME,
            exposure_scale: 1.0,
            temperature: dcam::SENSORTEMPERATURE,
            temperature_scale: 1.0,
            geometry_on_cmdline: false,
            family: CameraFamily::Dcam,
        }
    }

    /// Teledyne PVCAM.
    pub fn pvcam() -> Self {
        Self {
            exec: "hwacq-pvcamtake",
            detector: "PVCAM",
            exposure: pvcam::PARAMMAGIC_EXP_TIME,
            exposure_scale: 1e6,
            temperature: pvcam::PARAM_TEMP,
            temperature_scale: 0.01,
            geometry_on_cmdline: false,
            family: CameraFamily::Pvcam,
        }
    }

    /// DCAM property ids served by `camstack-simworker`.
    pub fn simulated() -> Self {
        Self {
            exec: "camstack-simworker",
            detector: "Simulated",
            geometry_on_cmdline: true,
            family: CameraFamily::Simulated,
            ..Self::dcam()
        }
    }

    /// Family the dialect belongs to.
    pub fn family(&self) -> CameraFamily {
        self.family
    }

    /// Wire type of parameter `id`.
    pub fn param_type(&self, id: u32) -> ParamType {
        match self.family {
            CameraFamily::Pvcam => pvcam::param_type(id),
            _ => ParamType::Float64,
        }
    }

    /// Request writing `value` to `id`.
    pub fn request_set(&self, id: u32, value: impl Into<KeywordValue>) -> ParamRequest {
        ParamRequest::set(id, self.param_type(id), value)
    }

    /// Request reading `id`.
    pub fn request_get(&self, id: u32) -> ParamRequest {
        ParamRequest::get(id, self.param_type(id))
    }

    /// Exposure request for `tint` seconds.
    pub fn exposure_request(&self, tint: f64) -> ParamRequest {
        let raw = tint * self.exposure_scale;
        match self.param_type(self.exposure) {
            ParamType::Float64 => self.request_set(self.exposure, raw),
            _ => self.request_set(self.exposure, raw.round() as i64),
        }
    }

    /// Exposure in seconds from a raw exposure value.
    pub fn exposure_seconds(&self, value: &KeywordValue) -> Option<f64> {
        value.as_f64().map(|raw| raw / self.exposure_scale)
    }

    /// Sensor temperature in kelvin from a raw value.
    pub fn temperature_kelvin(&self, value: &KeywordValue) -> Option<f64> {
        value
            .as_f64()
            .map(|raw| raw * self.temperature_scale + 273.15)
    }

    /// Window and exposure of `mode`, as left for the worker before it starts.
    pub fn geometry(&self, mode: &CameraMode) -> Vec<ParamRequest> {
        let mut out = match self.family {
            CameraFamily::Pvcam => vec![
                self.request_set(pvcam::PARAMMAGIC_ROI_X0, i64::from(mode.x0)),
                self.request_set(pvcam::PARAMMAGIC_ROI_X1, i64::from(mode.x1)),
                self.request_set(pvcam::PARAMMAGIC_ROI_BINX, i64::from(mode.binx)),
                self.request_set(pvcam::PARAMMAGIC_ROI_Y0, i64::from(mode.y0)),
                self.request_set(pvcam::PARAMMAGIC_ROI_Y1, i64::from(mode.y1)),
                self.request_set(pvcam::PARAMMAGIC_ROI_BINY, i64::from(mode.biny)),
                self.request_set(pvcam::PARAM_EXP_RES, pvcam::EXP_RES_ONE_MICROSEC),
                self.request_set(pvcam::PARAM_SPDTAB_INDEX, 1i64),
                self.request_set(pvcam::PARAM_GAIN_INDEX, 1i64),
            ],
            _ => vec![
                self.request_set(dcam::SUBARRAYMODE, dcam::SUBARRAYMODE_ON),
                self.request_set(dcam::SUBARRAYHPOS, f64::from(mode.x0)),
                self.request_set(dcam::SUBARRAYHSIZE, f64::from(mode.width())),
                self.request_set(dcam::SUBARRAYVPOS, f64::from(mode.y0)),
                self.request_set(dcam::SUBARRAYVSIZE, f64::from(mode.height())),
                self.request_set(dcam::BINNING, f64::from(mode.binx)),
            ],
        };
        if let Some(tint) = mode.tint {
            out.push(self.exposure_request(tint));
        }
        out
    }
}

/// One parameter of a `prm_*` call, with the header keyword it is mirrored to.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamCall {
    /// Header keyword, when the value is mirrored
    pub keyword: Option<String>,
    /// The control-segment request
    pub request: ParamRequest,
}

impl ParamCall {
    /// Call on `request`, mirrored to `keyword`.
    pub fn new(keyword: Option<&str>, request: ParamRequest) -> Self {
        Self {
            keyword: keyword.map(str::to_string),
            request,
        }
    }
}

/// Round trip `calls` and mirror every accepted value into its keyword.
///
/// Rejected parameters come back as `InvalidParameter` carrying the keyword
/// name; their keyword keeps its previous value.
pub async fn prm_setgetmultivalue(
    control: &ControlSegment,
    keywords: &KeywordPipeline,
    calls: &[ParamCall],
) -> AppResult<Vec<AppResult<KeywordValue>>> {
    let requests: Vec<ParamRequest> = calls.iter().map(|c| c.request.clone()).collect();
    debug!(n = requests.len(), "control segment transaction");
    let outcomes = control.transact(&requests).await?;

    Ok(calls
        .iter()
        .zip(outcomes)
        .map(|(call, outcome)| match outcome {
            Ok(value) => {
                if let Some(keyword) = &call.keyword {
                    if let Err(e) = keywords.set_formatted_keyword(keyword, value.clone()) {
                        warn!(keyword = %keyword, "cannot publish parameter: {e}");
                    }
                }
                Ok(value)
            }
            Err(CamstackError::InvalidParameter { key, .. }) => {
                warn!(key = %format!("{key:08x}"), keyword = ?call.keyword, "worker rejected parameter");
                Err(CamstackError::InvalidParameter {
                    key,
                    keyword: call.keyword.clone(),
                })
            }
            Err(other) => Err(other),
        })
        .collect())
}

/// Single-parameter form of [`prm_setgetmultivalue`].
pub async fn prm_setgetvalue(
    control: &ControlSegment,
    keywords: &KeywordPipeline,
    call: ParamCall,
) -> AppResult<KeywordValue> {
    prm_setgetmultivalue(control, keywords, std::slice::from_ref(&call))
        .await?
        .pop()
        .unwrap_or_else(|| Err(CamstackError::Segment("empty control answer".into())))
}

/// Control-segment camera.
#[derive(Debug)]
pub struct ParamsCamera {
    dialect: ParamDialect,
    control: Option<Arc<ControlSegment>>,
}

impl ParamsCamera {
    /// Backend without a control segment yet; it is created on initialization.
    pub fn new(dialect: ParamDialect) -> Self {
        Self {
            dialect,
            control: None,
        }
    }

    /// Naming and scaling rules in use.
    pub fn dialect(&self) -> &ParamDialect {
        &self.dialect
    }

    fn segment(&self) -> AppResult<&Arc<ControlSegment>> {
        self.control
            .as_ref()
            .ok_or_else(|| CamstackError::Segment("control segment not created".into()))
    }

    async fn read_exposure(&self, ctx: &HookContext<'_>) -> AppResult<f64> {
        let value = prm_setgetvalue(
            self.segment()?,
            ctx.keywords,
            ParamCall::new(None, self.dialect.request_get(self.dialect.exposure)),
        )
        .await?;
        let tint = self
            .dialect
            .exposure_seconds(&value)
            .ok_or_else(|| CamstackError::Keyword(format!("exposure {value} is not a number")))?;
        publish_exposure(ctx.keywords, tint);
        Ok(tint)
    }
}

fn publish_exposure(keywords: &KeywordPipeline, tint: f64) {
    if let Err(e) = keywords.set_formatted_keyword("EXPTIME", tint) {
        warn!("cannot publish EXPTIME: {e}");
    }
    if tint > 0.0 {
        if let Err(e) = keywords.set_formatted_keyword("FRATE", 1.0 / tint) {
            warn!("cannot publish FRATE: {e}");
        }
    }
}

#[async_trait]
impl CameraBackend for ParamsCamera {
    fn family(&self) -> CameraFamily {
        self.dialect.family
    }

    fn detector(&self) -> &str {
        self.dialect.detector
    }

    fn worker_command(&self, ctx: &HookContext<'_>, reuse_stream: bool) -> WorkerCommand {
        let exec = ctx
            .camera
            .exec
            .clone()
            .unwrap_or_else(|| self.dialect.exec.to_string());
        let mut cmd = WorkerCommand::new(exec, ctx.camera.stream_name.clone())
            .with_unit(ctx.camera.unit, ctx.camera.channel)
            .reusing_stream(reuse_stream);
        cmd.cast_to_u16 = ctx.camera.cast_to_u16;
        cmd.unsigned = ctx.camera.unsigned;
        cmd.timestamp = ctx.camera.timestamp;
        if self.dialect.geometry_on_cmdline {
            let (w, h) = ctx.mode.binned_size();
            cmd = cmd.with_geometry(w, h);
        }
        cmd
    }

    fn readiness(&self, timing: &TimingConfig) -> Readiness {
        match &self.control {
            Some(control) => Readiness::ControlPost {
                control: control.clone(),
                timeout: timing.ready_timeout,
            },
            None => Readiness::FixedDelay(timing.fixed_ready_delay),
        }
    }

    fn control(&self) -> Option<&Arc<ControlSegment>> {
        self.control.as_ref()
    }

    fn param_type(&self, id: u32) -> ParamType {
        self.dialect.param_type(id)
    }

    fn abort_injection(&self) -> Option<Vec<ParamRequest>> {
        Some(vec![self.dialect.exposure_request(0.001)])
    }

    async fn init_framegrab_backend(&mut self, ctx: &HookContext<'_>) -> AppResult<()> {
        ensure_worker_stopped(ctx).await?;
        if self.control.is_none() {
            let control =
                ControlSegment::create(ctx.streams, &ctx.camera.stream_name, ctx.timing.control_timeout)?;
            info!(camera = %ctx.camera.name, "control segment created");
            self.control = Some(Arc::new(control));
        }
        Ok(())
    }

    async fn prepare_camera_for_size(
        &mut self,
        ctx: &HookContext<'_>,
        injection: &[ParamRequest],
    ) -> AppResult<()> {
        ensure_worker_stopped(ctx).await?;
        let mut requests = self.dialect.geometry(ctx.mode);
        for extra in injection {
            requests.retain(|r| r.id != extra.id);
            requests.push(extra.clone());
        }
        debug!(camera = %ctx.camera.name, mode = %ctx.mode_id, n = requests.len(), "preloading parameters");
        self.segment()?.preload(&requests).await
    }

    async fn prepare_camera_finalize(&mut self, ctx: &HookContext<'_>) -> AppResult<()> {
        self.read_exposure(ctx).await.map(|_| ())
    }

    async fn poll_camera_for_keywords(&mut self, ctx: &HookContext<'_>) -> AppResult<()> {
        let value = prm_setgetvalue(
            self.segment()?,
            ctx.keywords,
            ParamCall::new(None, self.dialect.request_get(self.dialect.temperature)),
        )
        .await?;
        if let Some(kelvin) = self.dialect.temperature_kelvin(&value) {
            ctx.keywords.set_formatted_keyword("DET-TMP", kelvin)?;
        }
        Ok(())
    }

    async fn get_tint(&mut self, ctx: &HookContext<'_>) -> AppResult<f64> {
        self.read_exposure(ctx).await
    }

    async fn set_tint(&mut self, ctx: &HookContext<'_>, tint: f64) -> AppResult<f64> {
        if tint.is_nan() || tint <= 0.0 {
            return Err(CamstackError::Configuration(format!("exposure must be positive, got {tint}")));
        }
        let value = prm_setgetvalue(
            self.segment()?,
            ctx.keywords,
            ParamCall::new(None, self.dialect.exposure_request(tint)),
        )
        .await?;
        let tint = self
            .dialect
            .exposure_seconds(&value)
            .ok_or_else(|| CamstackError::Keyword(format!("exposure {value} is not a number")))?;
        publish_exposure(ctx.keywords, tint);
        info!(camera = %ctx.camera.name, tint, "exposure set");
        Ok(tint)
    }

    async fn get_fps(&mut self, ctx: &HookContext<'_>) -> AppResult<f64> {
        let tint = self.read_exposure(ctx).await?;
        Ok(1.0 / tint)
    }

    async fn set_fps(&mut self, ctx: &HookContext<'_>, fps: f64) -> AppResult<f64> {
        if fps.is_nan() || fps <= 0.0 {
            return Err(CamstackError::Configuration(format!("frame rate must be positive, got {fps}")));
        }
        let tint = self.set_tint(ctx, 1.0 / fps).await?;
        Ok(1.0 / tint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pvcam_type_byte() {
        assert_eq!(pvcam::param_type(pvcam::PARAM_TEMP), ParamType::Int32);
        assert_eq!(pvcam::param_type(pvcam::PARAM_EXP_RES), ParamType::UInt32);
        assert_eq!(pvcam::param_type(pvcam::PARAMMAGIC_EXP_TIME), ParamType::Int64);
        assert!(pvcam::PARAMMAGIC_ROI_BINY < 0x4000_0000);
    }

    #[test]
    fn pvcam_exposure_is_integer_microseconds() {
        let d = ParamDialect::pvcam();
        let req = d.exposure_request(0.0125);
        assert_eq!(req.ty, ParamType::Int64);
        assert_eq!(req.op, crate::worker::ParamOp::Set(KeywordValue::Int(12_500)));
        assert_eq!(d.exposure_seconds(&KeywordValue::Int(12_500)), Some(0.0125));
    }

    #[test]
    fn dcam_geometry_carries_the_window() {
        let d = ParamDialect::dcam();
        let mode = CameraMode::new(80, 239, 64, 191).with_tint(0.002);
        let reqs = d.geometry(&mode);
        let hsize = reqs.iter().find(|r| r.id == dcam::SUBARRAYHSIZE).unwrap();
        assert_eq!(hsize.op, crate::worker::ParamOp::Set(KeywordValue::Float(160.0)));
        assert!(reqs.iter().any(|r| r.id == dcam::EXPOSURETIME));
        assert!(reqs.iter().all(|r| r.ty == ParamType::Float64));
    }

    #[test]
    fn temperature_is_published_in_kelvin() {
        let d = ParamDialect::pvcam();
        let k = d.temperature_kelvin(&KeywordValue::Int(-4000)).unwrap();
        assert!((k - 233.15).abs() < 1e-9);
    }
}
