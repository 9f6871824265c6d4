//! Simulated acquisition worker.
//!
//! Stands in for the vendor workers: publishes a ramp image into the stream at
//! a fixed period and serves the control segment like an SDK worker would.
//! Geometry comes from `-W`/`-H`, else from the window preloaded in the
//! control segment, else 320x256. The detected geometry is written into the
//! header as `_FGDETS1`/`_FGDETS2`, the way framegrabber workers report it.
//!
//! Run by the `camstack-simworker` binary, and in-process by the tests.

use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::command::WorkerCommand;
use super::control::{ControlResponder, PendingParam, ParamType, INVALID_SENTINEL};
use crate::camera::params::{dcam, pvcam};
use crate::error::AppResult;
use crate::keywords::KeywordValue;
use crate::shm::{PixelType, ShmImage, StreamDirectory, DEFAULT_KEYWORD_CAPACITY};

/// Frame width when the command carries none.
pub const DEFAULT_WIDTH: u32 = 320;
/// Frame height when the command carries none.
pub const DEFAULT_HEIGHT: u32 = 256;

/// Parameters at or above this id are unknown to the simulated camera.
const FIRST_UNSUPPORTED: u32 = 0x4000_0000;

/// Parameter store of the simulated camera, raw transport values keyed by id.
#[derive(Debug, Clone)]
pub struct SimParams {
    values: HashMap<u32, f64>,
}

impl Default for SimParams {
    fn default() -> Self {
        let mut values = HashMap::new();
        values.insert(dcam::SENSORTEMPERATURE, -40.0);
        values.insert(dcam::EXPOSURETIME, 0.001);
        values.insert(
            pvcam::PARAM_TEMP,
            ParamType::Int32
                .encode(&KeywordValue::Int(-4000))
                .unwrap_or(0.0),
        );
        values.insert(
            pvcam::PARAMMAGIC_EXP_TIME,
            ParamType::Int64.encode(&KeywordValue::Int(1000)).unwrap_or(0.0),
        );
        Self { values }
    }
}

impl SimParams {
    /// Answer one pending parameter.
    pub fn answer(&mut self, param: PendingParam) -> f64 {
        if param.id >= FIRST_UNSUPPORTED {
            debug!(id = %format!("{:08x}", param.id), "unsupported parameter");
            return INVALID_SENTINEL;
        }
        if param.get {
            self.values.get(&param.id).copied().unwrap_or(0.0)
        } else {
            self.values.insert(param.id, param.raw);
            param.raw
        }
    }

    /// Raw transport value of `id`.
    pub fn raw(&self, id: u32) -> Option<f64> {
        self.values.get(&id).copied()
    }

    fn decoded(&self, id: u32) -> Option<i64> {
        let ty = if id >= 0x0100_0000 {
            pvcam::param_type(id)
        } else {
            ParamType::Float64
        };
        self.raw(id).and_then(|raw| ty.decode(raw).as_i64())
    }

    /// `(width, height)` of the window left in the store, binned.
    pub fn window(&self) -> Option<(u32, u32)> {
        let size = |v: i64| u32::try_from(v).ok().filter(|v| *v > 0);
        if let (Some(w), Some(h)) = (
            self.decoded(dcam::SUBARRAYHSIZE).and_then(size),
            self.decoded(dcam::SUBARRAYVSIZE).and_then(size),
        ) {
            let bin = self.decoded(dcam::BINNING).and_then(size).unwrap_or(1);
            return Some((w / bin, h / bin));
        }
        let x0 = self.decoded(pvcam::PARAMMAGIC_ROI_X0)?;
        let x1 = self.decoded(pvcam::PARAMMAGIC_ROI_X1)?;
        let y0 = self.decoded(pvcam::PARAMMAGIC_ROI_Y0)?;
        let y1 = self.decoded(pvcam::PARAMMAGIC_ROI_Y1)?;
        let binx = self.decoded(pvcam::PARAMMAGIC_ROI_BINX).and_then(size).unwrap_or(1);
        let biny = self.decoded(pvcam::PARAMMAGIC_ROI_BINY).and_then(size).unwrap_or(1);
        let w = size(x1 - x0 + 1)?;
        let h = size(y1 - y0 + 1)?;
        Some((w / binx, h / biny))
    }
}

/// In-process simulated acquisition worker.
#[derive(Debug)]
pub struct SimWorker {
    command: WorkerCommand,
    streams: StreamDirectory,
    pid: u32,
    period: Duration,
    params: SimParams,
}

impl SimWorker {
    /// Worker running `command`, publishing into `streams` as `pid`.
    pub fn new(command: WorkerCommand, streams: StreamDirectory, pid: u32) -> Self {
        Self {
            command,
            streams,
            pid,
            period: Duration::from_millis(5),
            params: SimParams::default(),
        }
    }

    /// Frame period.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    fn publish(&self, width: u32, height: u32) -> AppResult<ShmImage> {
        let datatype = if self.command.cast_to_u16 || self.command.unsigned {
            PixelType::U16
        } else {
            PixelType::I16
        };
        let stream = &self.command.stream;
        let image = if self.command.reuse_stream {
            self.streams
                .open_or_create(stream, width, height, datatype, DEFAULT_KEYWORD_CAPACITY)?
        } else {
            self.streams
                .create(stream, width, height, datatype, DEFAULT_KEYWORD_CAPACITY)?
        };
        image.set_owner_pid(self.pid);
        image.set_live(true);
        image.update_keyword("_FGDETS1", &KeywordValue::Int(i64::from(height)))?;
        image.update_keyword("_FGDETS2", &KeywordValue::Int(i64::from(width)))?;
        Ok(image)
    }

    /// Grab until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) -> AppResult<()> {
        let mut responder = ControlResponder::open(&self.streams, &self.command.stream);
        if let Some(responder) = &responder {
            let params = &mut self.params;
            let n = responder.apply(|p| params.answer(p))?;
            debug!(n, "preloaded parameters applied");
        }

        let (width, height) = match (self.command.width, self.command.height) {
            (Some(w), Some(h)) => (w, h),
            _ => self
                .params
                .window()
                .unwrap_or((DEFAULT_WIDTH, DEFAULT_HEIGHT)),
        };
        let image = self.publish(width, height)?;
        info!(
            stream = %self.command.stream,
            width,
            height,
            pid = self.pid,
            "simulated worker publishing"
        );
        if let Some(responder) = responder.as_mut() {
            responder.post();
        }

        let mut frame = vec![0u8; image.frame_len()];
        let mut ticker = tokio::time::interval(self.period);
        let mut n: u64 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            fill_ramp(&mut frame, width, n);
            if self.command.timestamp {
                embed_timestamp(&mut frame);
            }
            image.write_frame(&frame)?;
            n += 1;

            if let Some(responder) = responder.as_mut() {
                let params = &mut self.params;
                if responder.poll(|p| params.answer(p))? {
                    debug!("control request answered");
                }
            }
        }

        if image.owner_pid() == self.pid {
            image.set_live(false);
        } else {
            warn!(stream = %self.command.stream, "stream taken over by another worker");
        }
        info!(stream = %self.command.stream, frames = n, "simulated worker stopped");
        Ok(())
    }
}

fn fill_ramp(frame: &mut [u8], width: u32, n: u64) {
    let width = width.max(1) as usize;
    for (i, px) in frame.chunks_exact_mut(2).enumerate() {
        let (y, x) = (i / width, i % width);
        let value = ((x + y) as u64 + n) % 4096;
        px.copy_from_slice(&(value as u16).to_le_bytes());
    }
}

/// Microsecond grab time over pixels 8..12.
fn embed_timestamp(frame: &mut [u8]) {
    let now = chrono::Utc::now().timestamp_micros().max(0) as u64;
    if let Some(dst) = frame.get_mut(16..24) {
        dst.copy_from_slice(&now.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::control::ControlSegment;
    use crate::worker::ParamRequest;
    use tempfile::tempdir;

    #[test]
    fn unknown_parameters_get_the_sentinel() {
        let mut p = SimParams::default();
        let bogus = PendingParam {
            id: 0x4000_0001,
            get: true,
            raw: 0.0,
        };
        assert_eq!(p.answer(bogus), INVALID_SENTINEL);
        let temp = PendingParam {
            id: dcam::SENSORTEMPERATURE,
            get: true,
            raw: 0.0,
        };
        assert_eq!(p.answer(temp), -40.0);
    }

    #[test]
    fn pvcam_window_is_decoded_from_bit_patterns() {
        let mut p = SimParams::default();
        let set = |p: &mut SimParams, id: u32, v: i64| {
            let raw = pvcam::param_type(id).encode(&KeywordValue::Int(v)).unwrap();
            p.answer(PendingParam { id, get: false, raw });
        };
        set(&mut p, pvcam::PARAMMAGIC_ROI_X0, 512);
        set(&mut p, pvcam::PARAMMAGIC_ROI_X1, 1535);
        set(&mut p, pvcam::PARAMMAGIC_ROI_Y0, 0);
        set(&mut p, pvcam::PARAMMAGIC_ROI_Y1, 1023);
        set(&mut p, pvcam::PARAMMAGIC_ROI_BINX, 2);
        set(&mut p, pvcam::PARAMMAGIC_ROI_BINY, 2);
        assert_eq!(p.window(), Some((512, 512)));
    }

    #[tokio::test]
    async fn publishes_the_preloaded_window_and_answers_requests() {
        let dir = tempdir().unwrap();
        let streams = StreamDirectory::new(dir.path());
        let control = ControlSegment::create(&streams, "sim", Duration::from_secs(1)).unwrap();
        control
            .preload(&[
                ParamRequest::set(dcam::SUBARRAYHSIZE, ParamType::Float64, 64.0),
                ParamRequest::set(dcam::SUBARRAYVSIZE, ParamType::Float64, 32.0),
            ])
            .await
            .unwrap();

        let cmd = WorkerCommand::new("camstack-simworker", "sim");
        let cancel = CancellationToken::new();
        let task = tokio::spawn(SimWorker::new(cmd, streams.clone(), 4242).run(cancel.clone()));

        let image = streams
            .wait_for_stream("sim", Some(4242), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!((image.width(), image.height()), (64, 32));
        assert_eq!(image.get_keyword("_FGDETS2"), Some(KeywordValue::Int(64)));

        let out = control
            .transact(&[
                ParamRequest::set(dcam::EXPOSURETIME, ParamType::Float64, 0.02),
                ParamRequest::get(0x4000_0010, ParamType::Float64),
            ])
            .await
            .unwrap();
        assert_eq!(out[0].as_ref().unwrap(), &KeywordValue::Float(0.02));
        assert!(out[1].is_err());

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(!image.is_live());
    }
}
