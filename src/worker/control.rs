//! Parameter mailbox between the supervisor and a running worker.
//!
//! The control segment is a 1x1 `ShmImage` named `<stream>_params_fb`. A
//! transaction writes one keyword per parameter, named by the lowercase
//! zero-padded hex id (`GET_MAGIC` set for reads), then bumps the counter.
//! The worker checks the counter once per frame: when someone else moved it,
//! it applies or reads every pending key, writes the resulting value back
//! into the same keyword and posts. The supervisor waits for two posts past
//! its own bump, so the values it reads back are post-apply.
//!
//! Values travel as doubles. Integer-typed parameters are carried by bit
//! pattern, not by numeric conversion (see [`ParamType`]).

use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{AppResult, CamstackError};
use crate::keywords::KeywordValue;
use crate::shm::{PixelType, ShmImage, StreamDirectory};

/// Key bit discriminating a read from a write.
pub const GET_MAGIC: u32 = 0x8000_0000;

/// Value written back by the worker for a parameter it does not support.
pub const INVALID_SENTINEL: f64 = -8.0085;

/// Keyword slots of a control segment.
pub const CONTROL_CAPACITY: u32 = 64;

/// Name of the control segment of `stream`.
pub fn control_stream_name(stream: &str) -> String {
    format!("{stream}_params_fb")
}

/// Eight-digit hex keyword of a request; `get` sets bit 31.
pub fn hex_key(id: u32, get: bool) -> String {
    let key = if get { id | GET_MAGIC } else { id };
    format!("{key:08x}")
}

/// `(parameter id, is_get)` of a hex keyword.
pub fn parse_hex_key(name: &str) -> Option<(u32, bool)> {
    if name.len() != 8 {
        return None;
    }
    let key = u32::from_str_radix(name, 16).ok()?;
    Some((key & !GET_MAGIC, key & GET_MAGIC != 0))
}

/// Nominal type of a vendor parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// IEEE double
    Float64,
    /// Signed 64-bit, bit pattern carried in the double
    Int64,
    /// Signed 32-bit, bit pattern carried in the double
    Int32,
    /// Unsigned 32-bit, bit pattern carried in the double
    UInt32,
    /// Unsigned 16-bit, bit pattern carried in the double
    UInt16,
    /// Flag, bit pattern carried in the double
    Bool,
}

impl ParamType {
    /// Transport double carrying `value` in this type.
    pub fn encode(self, value: &KeywordValue) -> AppResult<f64> {
        if self == ParamType::Float64 {
            return value.as_f64().ok_or_else(|| {
                CamstackError::Keyword(format!("{value} is not a number"))
            });
        }
        let int = match value {
            KeywordValue::Bool(b) => i64::from(*b),
            KeywordValue::Float(x) => *x as i64,
            other => other
                .as_i64()
                .ok_or_else(|| CamstackError::Keyword(format!("{other} is not an integer")))?,
        };
        let bits = match self {
            ParamType::Float64 | ParamType::Int64 => int as u64,
            ParamType::Int32 => u64::from(int as i32 as u32),
            ParamType::UInt32 => u64::from(int as u32),
            ParamType::UInt16 => u64::from(int as u16),
            ParamType::Bool => u64::from(int != 0),
        };
        Ok(f64::from_bits(bits))
    }

    /// Value of this type carried by `raw`.
    pub fn decode(self, raw: f64) -> KeywordValue {
        let bits = raw.to_bits();
        match self {
            ParamType::Float64 => KeywordValue::Float(raw),
            ParamType::Int64 => KeywordValue::Int(bits as i64),
            ParamType::Int32 => KeywordValue::Int(i64::from(bits as u32 as i32)),
            ParamType::UInt32 => KeywordValue::Int(i64::from(bits as u32)),
            ParamType::UInt16 => KeywordValue::Int(i64::from(bits as u16)),
            ParamType::Bool => KeywordValue::Bool(bits as u32 != 0),
        }
    }
}

/// Direction of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamOp {
    /// Write the value
    Set(KeywordValue),
    /// Read back the current value
    Get,
}

/// One parameter of a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamRequest {
    /// Vendor parameter id
    pub id: u32,
    /// Wire type
    pub ty: ParamType,
    /// Read or write
    pub op: ParamOp,
}

impl ParamRequest {
    /// Write `value` to `id`.
    pub fn set(id: u32, ty: ParamType, value: impl Into<KeywordValue>) -> Self {
        Self {
            id,
            ty,
            op: ParamOp::Set(value.into()),
        }
    }

    /// Read `id`.
    pub fn get(id: u32, ty: ParamType) -> Self {
        Self {
            id,
            ty,
            op: ParamOp::Get,
        }
    }

    fn key(&self) -> String {
        hex_key(self.id, matches!(self.op, ParamOp::Get))
    }

    fn transport_value(&self) -> AppResult<f64> {
        match &self.op {
            ParamOp::Set(v) => self.ty.encode(v),
            ParamOp::Get => Ok(0.0),
        }
    }
}

/// Supervisor side of the mailbox.
#[derive(Debug)]
pub struct ControlSegment {
    image: ShmImage,
    lock: Mutex<()>,
    timeout: Duration,
}

impl ControlSegment {
    /// Create (or replace) `<stream>_params_fb`.
    pub fn create(streams: &StreamDirectory, stream: &str, timeout: Duration) -> AppResult<Self> {
        let image = streams.create(
            &control_stream_name(stream),
            1,
            1,
            PixelType::I32,
            CONTROL_CAPACITY,
        )?;
        image.set_owner_pid(std::process::id());
        Ok(Self {
            image,
            lock: Mutex::new(()),
            timeout,
        })
    }

    /// Post counter.
    pub fn counter(&self) -> u64 {
        self.image.counter()
    }

    /// Underlying segment.
    pub fn image(&self) -> &ShmImage {
        &self.image
    }

    fn write_requests(&self, requests: &[ParamRequest]) -> AppResult<Vec<String>> {
        let mut keys = Vec::with_capacity(requests.len());
        let mut entries = Vec::with_capacity(requests.len());
        for req in requests {
            let key = req.key();
            entries.push((key.clone(), KeywordValue::Float(req.transport_value()?)));
            keys.push(key);
        }
        self.image
            .reset_keywords(entries.iter().map(|(k, v)| (k.as_str(), v.clone())))?;
        Ok(keys)
    }

    /// Leave `requests` for the next worker to pick up at startup.
    pub async fn preload(&self, requests: &[ParamRequest]) -> AppResult<()> {
        let _guard = self.lock.lock().await;
        self.write_requests(requests)?;
        self.image.bump();
        debug!(n = requests.len(), "control segment preloaded");
        Ok(())
    }

    /// One round trip with a running worker.
    ///
    /// Returns one outcome per request, in order. A parameter the worker
    /// rejected is an `InvalidParameter` outcome; the other parameters of the
    /// transaction are unaffected. The whole call fails only when the worker
    /// does not answer within the timeout.
    pub async fn transact(
        &self,
        requests: &[ParamRequest],
    ) -> AppResult<Vec<AppResult<KeywordValue>>> {
        let _guard = self.lock.lock().await;
        let keys = self.write_requests(requests)?;
        let posted = self.image.bump();
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + self.timeout;
        while self.image.counter() < posted + 2 {
            if Instant::now() >= deadline {
                warn!(counter = self.image.counter(), posted, "control round-trip timed out");
                return Err(CamstackError::Segment(format!(
                    "worker did not answer the control segment within {:?}",
                    self.timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        Ok(requests
            .iter()
            .zip(keys)
            .map(|(req, key)| {
                let raw = self.image.get_keyword(&key).and_then(|v| v.as_f64());
                match raw {
                    Some(raw) if raw != INVALID_SENTINEL => Ok(req.ty.decode(raw)),
                    _ => Err(CamstackError::InvalidParameter {
                        key: req.id,
                        keyword: None,
                    }),
                }
            })
            .collect())
    }
}

/// One pending parameter, as seen by the worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingParam {
    /// Vendor parameter id
    pub id: u32,
    /// Read request
    pub get: bool,
    /// Transport value left by the supervisor
    pub raw: f64,
}

/// Worker side of the mailbox.
#[derive(Debug)]
pub struct ControlResponder {
    image: ShmImage,
    last: u64,
}

impl ControlResponder {
    /// Responder on an opened segment; posts before now are ignored.
    pub fn new(image: ShmImage) -> Self {
        let last = image.counter();
        Self { image, last }
    }

    /// Open `<stream>_params_fb` when a supervisor created one.
    pub fn open(streams: &StreamDirectory, stream: &str) -> Option<Self> {
        let name = control_stream_name(stream);
        if !streams.exists(&name) {
            return None;
        }
        match streams.open(&name) {
            Ok(image) => Some(Self::new(image)),
            Err(e) => {
                warn!("cannot open control segment {name}: {e}");
                None
            }
        }
    }

    /// Requests currently left in the segment.
    pub fn pending(&self) -> Vec<PendingParam> {
        self.image
            .keywords()
            .into_iter()
            .filter_map(|(name, kw)| {
                let (id, get) = parse_hex_key(&name)?;
                let raw = kw.value.as_f64()?;
                Some(PendingParam { id, get, raw })
            })
            .collect()
    }

    /// Run `handler` on every pending parameter and write its answer back.
    pub fn apply(&self, mut handler: impl FnMut(PendingParam) -> f64) -> AppResult<usize> {
        let pending = self.pending();
        for param in &pending {
            let answer = handler(*param);
            self.image
                .update_keyword(&hex_key(param.id, param.get), &KeywordValue::Float(answer))?;
        }
        Ok(pending.len())
    }

    /// Post without looking at the mailbox.
    pub fn post(&mut self) {
        self.last = self.image.bump();
    }

    /// Per-frame step: answer a new request if there is one, then post.
    pub fn poll(&mut self, handler: impl FnMut(PendingParam) -> f64) -> AppResult<bool> {
        let current = self.image.counter();
        let answered = current != self.last;
        if answered {
            self.apply(handler)?;
        }
        // Lost race with a fresh request: leave `last` so it is seen next frame
        if self.image.bump_from(current) {
            self.last = current + 1;
        }
        Ok(answered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn hex_keys() {
        assert_eq!(hex_key(0x001F_0110, false), "001f0110");
        assert_eq!(hex_key(0x001F_0110, true), "801f0110");
        assert_eq!(parse_hex_key("801f0110"), Some((0x001F_0110, true)));
        assert_eq!(parse_hex_key("EXPTIME"), None);
    }

    #[test]
    fn integer_params_travel_by_bit_pattern() {
        let raw = ParamType::Int32.encode(&KeywordValue::Int(-5)).unwrap();
        assert_eq!(raw.to_bits(), 0xFFFF_FFFB);
        assert_eq!(ParamType::Int32.decode(raw), KeywordValue::Int(-5));

        let raw = ParamType::UInt16.encode(&KeywordValue::Int(1000)).unwrap();
        assert_eq!(raw.to_bits(), 1000);
        assert_eq!(ParamType::Int64.decode(raw), KeywordValue::Int(1000));

        let raw = ParamType::Float64.encode(&KeywordValue::Float(0.25)).unwrap();
        assert_eq!(raw, 0.25);
        assert!(ParamType::Float64.encode(&KeywordValue::Str("x".into())).is_err());
    }

    /// Worker stand-in answering every 2 ms; rejects id 0xBAD.
    fn spawn_responder(streams: &StreamDirectory, stream: &str) -> Arc<AtomicBool> {
        let mut responder = ControlResponder::open(streams, stream).unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        std::thread::spawn(move || {
            let mut store = std::collections::HashMap::new();
            while !flag.load(Ordering::SeqCst) {
                responder
                    .poll(|p| {
                        if p.id == 0xBAD {
                            INVALID_SENTINEL
                        } else if p.get {
                            *store.get(&p.id).unwrap_or(&0.0)
                        } else {
                            store.insert(p.id, p.raw);
                            p.raw
                        }
                    })
                    .unwrap();
                std::thread::sleep(Duration::from_millis(2));
            }
        });
        stop
    }

    #[tokio::test]
    async fn round_trip_with_partial_rejection() {
        let dir = tempdir().unwrap();
        let streams = StreamDirectory::new(dir.path());
        let control = ControlSegment::create(&streams, "cam", Duration::from_secs(1)).unwrap();
        let stop = spawn_responder(&streams, "cam");

        let out = control
            .transact(&[
                ParamRequest::set(0x00A1, ParamType::Float64, 42i64),
                ParamRequest::set(0xBAD, ParamType::Float64, 1.0),
                ParamRequest::set(0x001F, ParamType::Float64, 0.001),
            ])
            .await
            .unwrap();
        assert_eq!(out[0].as_ref().unwrap(), &KeywordValue::Float(42.0));
        assert!(matches!(
            out[1],
            Err(CamstackError::InvalidParameter { key: 0xBAD, .. })
        ));
        assert_eq!(out[2].as_ref().unwrap(), &KeywordValue::Float(0.001));

        let out = control
            .transact(&[ParamRequest::get(0x001F, ParamType::Float64)])
            .await
            .unwrap();
        assert_eq!(out[0].as_ref().unwrap(), &KeywordValue::Float(0.001));
        stop.store(true, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn empty_transaction_bumps_once() {
        let dir = tempdir().unwrap();
        let streams = StreamDirectory::new(dir.path());
        let control = ControlSegment::create(&streams, "cam", Duration::from_millis(50)).unwrap();
        let before = control.counter();
        let out = control.transact(&[]).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(control.counter(), before + 1);
    }

    #[tokio::test]
    async fn silent_worker_times_out() {
        let dir = tempdir().unwrap();
        let streams = StreamDirectory::new(dir.path());
        let control = ControlSegment::create(&streams, "cam", Duration::from_millis(30)).unwrap();
        let err = control
            .transact(&[ParamRequest::get(1, ParamType::Float64)])
            .await
            .unwrap_err();
        assert!(matches!(err, CamstackError::Segment(_)));
    }

    #[test]
    fn preloaded_requests_are_visible_to_a_new_worker() {
        let dir = tempdir().unwrap();
        let streams = StreamDirectory::new(dir.path());
        let control = ControlSegment::create(&streams, "cam", Duration::from_millis(30)).unwrap();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(control.preload(&[ParamRequest::set(0x0040_2120, ParamType::Float64, 160)]))
            .unwrap();

        let responder = ControlResponder::open(&streams, "cam").unwrap();
        assert_eq!(
            responder.pending(),
            vec![PendingParam {
                id: 0x0040_2120,
                get: false,
                raw: 160.0
            }]
        );
    }
}
