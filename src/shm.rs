//! Memory-mapped image segments with an embedded keyword table.
//!
//! Both the primary image stream published by the acquisition worker and the
//! small control mailbox exchanged with it are `ShmImage`s: a file under the
//! stream directory (`$MILK_SHM_DIR`, `<name>.im.shm`) mapped into every
//! participating process.
//!
//! # Memory Layout
//! ```text
//! [128-byte header] [nkw x 120-byte keyword slots] [pixel data]
//!
//! Header:
//!   magic: u64              (0x4353_544B_5348_4D31)
//!   width, height: u32
//!   datatype: u32           (PixelType code)
//!   nkw: u32                (keyword slot capacity)
//!   owner_pid: AtomicU32    (pid of the process that last published)
//!   live: AtomicU32         (0 once the producer has torn the stream down)
//!   cnt0: AtomicU64         (frame / post counter)
//!   write_time_us: AtomicU64
//!   kw_lock: AtomicU32      (keyword slot allocation)
//!
//! Keyword slot:
//!   seq: AtomicU32          (seqlock, odd while a writer holds the slot)
//!   kind: u8                ('L' integer, 'D' double, 'S' string, 0 free)
//!   name: [u8; 16]
//!   value: [u8; 16]
//!   comment: [u8; 80]
//! ```
//!
//! Keyword writes are atomic per key. Concurrent writers of the same key get
//! last-writer-wins semantics.

use anyhow::{anyhow, bail, Context, Result};
use memmap2::{MmapMut, MmapOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::{AppResult, CamstackError};
use crate::keywords::format::{BOOL_FALSE, BOOL_TRUE};
use crate::keywords::KeywordValue;

/// Magic number for segment header validation
const MAGIC: u64 = 0x4353_544B_5348_4D31;

const HEADER_SIZE: usize = 128;
const SLOT_SIZE: usize = 120;

/// Name field width of a keyword slot.
pub const KEYWORD_NAME_LEN: usize = 16;
/// Value field width of a keyword slot.
pub const KEYWORD_VALUE_LEN: usize = 16;
/// Comment field width of a keyword slot.
pub const KEYWORD_COMMENT_LEN: usize = 80;

/// Default number of keyword slots of a published stream.
pub const DEFAULT_KEYWORD_CAPACITY: u32 = 96;

const KIND_FREE: u8 = 0;
const KIND_INT: u8 = b'L';
const KIND_FLOAT: u8 = b'D';
const KIND_STR: u8 = b'S';

#[repr(C)]
struct ShmHeader {
    magic: u64,
    width: u32,
    height: u32,
    datatype: u32,
    nkw: u32,
    owner_pid: AtomicU32,
    live: AtomicU32,
    cnt0: AtomicU64,
    write_time_us: AtomicU64,
    kw_lock: AtomicU32,
    _padding: [u8; 76],
}

#[repr(C)]
struct KeywordSlot {
    seq: AtomicU32,
    kind: u8,
    _pad: [u8; 3],
    name: [u8; KEYWORD_NAME_LEN],
    value: [u8; KEYWORD_VALUE_LEN],
    comment: [u8; KEYWORD_COMMENT_LEN],
}

/// Pixel encoding of the data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    /// 8-bit unsigned
    U8,
    /// 16-bit unsigned
    U16,
    /// 16-bit signed
    I16,
    /// 32-bit signed
    I32,
    /// 32-bit float
    F32,
}

impl PixelType {
    /// Header code.
    pub fn code(self) -> u32 {
        match self {
            PixelType::U8 => 1,
            PixelType::U16 => 2,
            PixelType::I16 => 3,
            PixelType::I32 => 4,
            PixelType::F32 => 5,
        }
    }

    /// Inverse of [`code`](Self::code).
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => PixelType::U8,
            2 => PixelType::U16,
            3 => PixelType::I16,
            4 => PixelType::I32,
            5 => PixelType::F32,
            _ => return None,
        })
    }

    /// Bytes per pixel.
    pub fn bytes(self) -> usize {
        match self {
            PixelType::U8 => 1,
            PixelType::U16 | PixelType::I16 => 2,
            PixelType::I32 | PixelType::F32 => 4,
        }
    }
}

/// One keyword as read back from a segment.
#[derive(Debug, Clone, PartialEq)]
pub struct ShmKeyword {
    /// Decoded value
    pub value: KeywordValue,
    /// Comment as stored, trailing blanks removed
    pub comment: String,
}

fn layout_size(width: u32, height: u32, datatype: PixelType, nkw: u32) -> (usize, usize) {
    let data_offset = (HEADER_SIZE + nkw as usize * SLOT_SIZE + 7) & !7;
    let total = data_offset + width as usize * height as usize * datatype.bytes();
    (data_offset, total)
}

fn copy_padded<const N: usize>(src: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let bytes = src.as_bytes();
    let n = bytes.len().min(N);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn read_padded(src: &[u8]) -> String {
    let end = src.iter().position(|b| *b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

fn encode_value(value: &KeywordValue) -> (u8, [u8; KEYWORD_VALUE_LEN]) {
    let mut raw = [0u8; KEYWORD_VALUE_LEN];
    match value {
        KeywordValue::Int(v) => {
            raw[..8].copy_from_slice(&v.to_le_bytes());
            (KIND_INT, raw)
        }
        KeywordValue::Float(v) => {
            raw[..8].copy_from_slice(&v.to_bits().to_le_bytes());
            (KIND_FLOAT, raw)
        }
        KeywordValue::Str(s) => (KIND_STR, copy_padded(s)),
        KeywordValue::Bool(b) => (KIND_STR, copy_padded(if *b { BOOL_TRUE } else { BOOL_FALSE })),
    }
}

fn decode_value(kind: u8, raw: &[u8; KEYWORD_VALUE_LEN]) -> Option<KeywordValue> {
    let mut word = [0u8; 8];
    word.copy_from_slice(&raw[..8]);
    match kind {
        KIND_INT => Some(KeywordValue::Int(i64::from_le_bytes(word))),
        KIND_FLOAT => Some(KeywordValue::Float(f64::from_bits(u64::from_le_bytes(word)))),
        KIND_STR => Some(KeywordValue::Str(read_padded(raw))),
        _ => None,
    }
}

/// A mapped image segment.
///
/// # Safety
/// The header and slot pointers point into `mmap`, which lives as long as the
/// struct. Header counters are atomics; keyword slots are guarded by their own
/// seqlock so that readers never observe a half-written value.
pub struct ShmImage {
    path: PathBuf,
    mmap: MmapMut,
    /// SAFETY: start of `mmap`, valid as long as `mmap` exists
    base: *mut u8,
    data_offset: usize,
}

// SAFETY: all shared mutation goes through atomics or slot seqlocks.
unsafe impl Send for ShmImage {}
// SAFETY: see above.
unsafe impl Sync for ShmImage {}

impl std::fmt::Debug for ShmImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmImage")
            .field("path", &self.path)
            .field("width", &self.width())
            .field("height", &self.height())
            .field("cnt0", &self.counter())
            .finish()
    }
}

impl ShmImage {
    /// Create a fresh segment at `path`.
    ///
    /// The file is written under a temporary name and renamed into place, so
    /// processes still mapping a previous segment keep their (now orphaned) copy
    /// instead of seeing it truncated underneath them.
    pub fn create(
        path: &Path,
        width: u32,
        height: u32,
        datatype: PixelType,
        nkw: u32,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("cannot create a {width}x{height} segment at {:?}", path);
        }
        let (data_offset, total) = layout_size(width, height, datatype, nkw);

        let tmp = path.with_extension(format!("tmp{}", std::process::id()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .with_context(|| format!("Failed to create segment file: {:?}", tmp))?;
        file.set_len(total as u64)
            .context("Failed to set segment file size")?;

        // SAFETY: the file was just created with the right size and is private until renamed
        let mut mmap = unsafe {
            MmapOptions::new()
                .map_mut(&file)
                .context("Failed to create memory mapping")?
        };

        let header = mmap.as_mut_ptr() as *mut ShmHeader;
        // SAFETY: mmap is at least HEADER_SIZE bytes; a fresh file is zero-filled
        unsafe {
            (*header).magic = MAGIC;
            (*header).width = width;
            (*header).height = height;
            (*header).datatype = datatype.code();
            (*header).nkw = nkw;
            (*header).live = AtomicU32::new(1);
        }
        mmap.flush_range(0, HEADER_SIZE)
            .context("Failed to flush segment header")?;

        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to publish segment {:?}", path))?;

        let base = mmap.as_mut_ptr();
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            base,
            data_offset,
        })
    }

    /// Attach to an existing segment.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open segment file: {:?}", path))?;

        // SAFETY: mapping an existing segment; the header is validated below
        let mut mmap = unsafe {
            MmapOptions::new()
                .map_mut(&file)
                .context("Failed to map segment file")?
        };
        if mmap.len() < HEADER_SIZE {
            bail!("Segment {:?} is truncated ({} bytes)", path, mmap.len());
        }

        // SAFETY: length checked above
        let header = unsafe { &*(mmap.as_ptr() as *const ShmHeader) };
        if header.magic != MAGIC {
            return Err(anyhow!(
                "Invalid segment magic number: expected 0x{:016X}, got 0x{:016X}",
                MAGIC,
                header.magic
            ));
        }
        let datatype = PixelType::from_code(header.datatype)
            .ok_or_else(|| anyhow!("Unknown pixel type code {}", header.datatype))?;
        let (data_offset, total) = layout_size(header.width, header.height, datatype, header.nkw);
        if mmap.len() < total {
            bail!(
                "Segment {:?} is {} bytes, header describes {}",
                path,
                mmap.len(),
                total
            );
        }

        let base = mmap.as_mut_ptr();
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            base,
            data_offset,
        })
    }

    fn header(&self) -> &ShmHeader {
        // SAFETY: validated at create/open, lives as long as self
        unsafe { &*(self.base as *const ShmHeader) }
    }

    fn slot(&self, index: usize) -> *mut KeywordSlot {
        debug_assert!(index < self.header().nkw as usize);
        // SAFETY: index < nkw, so the slot lies within the mapping
        unsafe { self.base.add(HEADER_SIZE + index * SLOT_SIZE) as *mut KeywordSlot }
    }

    /// Segment file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Frame width in pixels.
    pub fn width(&self) -> u32 {
        self.header().width
    }

    /// Frame height in pixels.
    pub fn height(&self) -> u32 {
        self.header().height
    }

    /// Pixel encoding.
    pub fn datatype(&self) -> PixelType {
        PixelType::from_code(self.header().datatype).unwrap_or(PixelType::U16)
    }

    /// Number of keyword slots.
    pub fn keyword_capacity(&self) -> usize {
        self.header().nkw as usize
    }

    /// Frames (or control posts) so far.
    pub fn counter(&self) -> u64 {
        self.header().cnt0.load(Ordering::Acquire)
    }

    /// Increment the post counter, returning the new value.
    pub fn bump(&self) -> u64 {
        self.header().cnt0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Increment the counter only if it still reads `current`.
    pub fn bump_from(&self, current: u64) -> bool {
        self.header()
            .cnt0
            .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Pid of the process that published the segment.
    pub fn owner_pid(&self) -> u32 {
        self.header().owner_pid.load(Ordering::Acquire)
    }

    /// Record the publishing process.
    pub fn set_owner_pid(&self, pid: u32) {
        self.header().owner_pid.store(pid, Ordering::Release);
    }

    /// Cleared when the publisher shuts down.
    pub fn is_live(&self) -> bool {
        self.header().live.load(Ordering::Acquire) != 0
    }

    /// Mark the segment as served or abandoned.
    pub fn set_live(&self, live: bool) {
        self.header().live.store(u32::from(live), Ordering::Release);
    }

    /// Microsecond UTC time of the last write.
    pub fn write_time_us(&self) -> u64 {
        self.header().write_time_us.load(Ordering::Acquire)
    }

    /// Bytes in one frame.
    pub fn frame_len(&self) -> usize {
        self.width() as usize * self.height() as usize * self.datatype().bytes()
    }

    /// Copy one frame into the data region and post it.
    pub fn write_frame(&self, pixels: &[u8]) -> Result<u64> {
        let len = self.frame_len();
        if pixels.len() != len {
            bail!("frame is {} bytes, segment expects {}", pixels.len(), len);
        }
        // SAFETY: data region is frame_len bytes past data_offset, checked at open
        unsafe {
            std::ptr::copy_nonoverlapping(
                pixels.as_ptr(),
                self.base.add(self.data_offset),
                len,
            );
        }
        let now = chrono::Utc::now().timestamp_micros().max(0) as u64;
        self.header().write_time_us.store(now, Ordering::Release);
        Ok(self.bump())
    }

    /// Copy of the current frame.
    pub fn read_frame(&self) -> Vec<u8> {
        let len = self.frame_len();
        self.mmap[self.data_offset..self.data_offset + len].to_vec()
    }

    fn lock_seq(seq_lock: &AtomicU32) -> u32 {
        loop {
            let seq = seq_lock.load(Ordering::Relaxed);
            if seq & 1 == 0
                && seq_lock
                    .compare_exchange_weak(seq, seq + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return seq;
            }
            std::hint::spin_loop();
        }
    }

    fn read_slot(&self, index: usize) -> Option<(String, KeywordValue, String)> {
        let ptr = self.slot(index);
        loop {
            // SAFETY: slot lies within the mapping; fields are plain bytes
            let (seq1, kind, name, value, comment) = unsafe {
                let seq1 = (*ptr).seq.load(Ordering::Acquire);
                if seq1 & 1 == 1 {
                    std::hint::spin_loop();
                    continue;
                }
                (
                    seq1,
                    std::ptr::read_volatile(&(*ptr).kind),
                    std::ptr::read_volatile(&(*ptr).name),
                    std::ptr::read_volatile(&(*ptr).value),
                    std::ptr::read_volatile(&(*ptr).comment),
                )
            };
            fence(Ordering::Acquire);
            // SAFETY: as above
            let seq2 = unsafe { (*ptr).seq.load(Ordering::Relaxed) };
            if seq1 != seq2 {
                continue;
            }
            if kind == KIND_FREE {
                return None;
            }
            return decode_value(kind, &value)
                .map(|v| (read_padded(&name), v, read_padded(&comment)));
        }
    }

    fn write_slot(&self, index: usize, name: Option<&str>, value: &KeywordValue, comment: Option<&str>) {
        let ptr = self.slot(index);
        let (kind, raw) = encode_value(value);
        // SAFETY: slot lies within the mapping; the seqlock is held while fields change
        unsafe {
            let seq = Self::lock_seq(&(*ptr).seq);
            if let Some(name) = name {
                std::ptr::write_volatile(&mut (*ptr).name, copy_padded(name));
            }
            std::ptr::write_volatile(&mut (*ptr).kind, kind);
            std::ptr::write_volatile(&mut (*ptr).value, raw);
            if let Some(comment) = comment {
                std::ptr::write_volatile(&mut (*ptr).comment, copy_padded(comment));
            }
            (*ptr).seq.store(seq + 2, Ordering::Release);
        }
    }

    fn clear_slot(&self, index: usize) {
        let ptr = self.slot(index);
        // SAFETY: as in write_slot
        unsafe {
            let seq = Self::lock_seq(&(*ptr).seq);
            std::ptr::write_volatile(&mut (*ptr).kind, KIND_FREE);
            std::ptr::write_volatile(&mut (*ptr).name, [0u8; KEYWORD_NAME_LEN]);
            std::ptr::write_volatile(&mut (*ptr).value, [0u8; KEYWORD_VALUE_LEN]);
            std::ptr::write_volatile(&mut (*ptr).comment, [0u8; KEYWORD_COMMENT_LEN]);
            (*ptr).seq.store(seq + 2, Ordering::Release);
        }
    }

    fn find_slot(&self, name: &str) -> Option<usize> {
        let wanted = copy_padded::<KEYWORD_NAME_LEN>(name);
        let wanted = read_padded(&wanted);
        (0..self.keyword_capacity()).find(|idx| {
            self.read_slot(*idx)
                .map(|(slot_name, _, _)| slot_name == wanted)
                .unwrap_or(false)
        })
    }

    fn with_alloc_lock<T>(&self, f: impl FnOnce() -> T) -> T {
        let lock = &self.header().kw_lock;
        while lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        let out = f();
        lock.store(0, Ordering::Release);
        out
    }

    /// Write a keyword, keeping its comment. Unknown names are allocated a slot.
    pub fn update_keyword(&self, name: &str, value: &KeywordValue) -> Result<()> {
        if let Some(idx) = self.find_slot(name) {
            self.write_slot(idx, None, value, None);
            return Ok(());
        }
        self.set_keyword(name, value, "")
    }

    /// Write a keyword together with its comment.
    pub fn set_keyword(&self, name: &str, value: &KeywordValue, comment: &str) -> Result<()> {
        self.with_alloc_lock(|| {
            if let Some(idx) = self.find_slot(name) {
                self.write_slot(idx, None, value, Some(comment));
                return Ok(());
            }
            let free = (0..self.keyword_capacity())
                .find(|idx| self.read_slot(*idx).is_none())
                .ok_or_else(|| {
                    anyhow!(
                        "No free keyword slot in {:?} for {name} ({} slots)",
                        self.path,
                        self.keyword_capacity()
                    )
                })?;
            self.write_slot(free, Some(name), value, Some(comment));
            Ok(())
        })
    }

    /// Value of `name`, if present.
    pub fn get_keyword(&self, name: &str) -> Option<KeywordValue> {
        self.find_slot(name)
            .and_then(|idx| self.read_slot(idx))
            .map(|(_, value, _)| value)
    }

    /// Snapshot of every keyword currently in the segment.
    pub fn keywords(&self) -> BTreeMap<String, ShmKeyword> {
        (0..self.keyword_capacity())
            .filter_map(|idx| self.read_slot(idx))
            .map(|(name, value, comment)| (name, ShmKeyword { value, comment }))
            .collect()
    }

    /// Clear the keyword table and replace it with `entries`.
    pub fn reset_keywords<'a>(
        &self,
        entries: impl IntoIterator<Item = (&'a str, KeywordValue)>,
    ) -> Result<()> {
        self.with_alloc_lock(|| {
            for idx in 0..self.keyword_capacity() {
                self.clear_slot(idx);
            }
        });
        for (name, value) in entries {
            self.set_keyword(name, &value, "")?;
        }
        Ok(())
    }
}

/// Anything the supervisor can publish header keywords into.
pub trait ImageStream: Send + Sync + std::fmt::Debug {
    /// File stem of the segment.
    fn stream_name(&self) -> String;
    /// `(width, height)` in pixels.
    fn size(&self) -> (u32, u32);
    /// Current frame counter.
    fn frame_counter(&self) -> u64;
    /// Every keyword in the header.
    fn keywords(&self) -> BTreeMap<String, ShmKeyword>;
    /// Value of one keyword.
    fn get_keyword(&self, name: &str) -> Option<KeywordValue>;
    /// Write a keyword, keeping its comment if it exists.
    fn update_keyword(&self, name: &str, value: &KeywordValue) -> AppResult<()>;
    /// Write `name`, taking a free slot if it is new.
    fn set_keyword(&self, name: &str, value: &KeywordValue, comment: &str) -> AppResult<()>;
}

impl ImageStream for ShmImage {
    fn stream_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().trim_end_matches(".im.shm").to_string())
            .unwrap_or_default()
    }

    fn size(&self) -> (u32, u32) {
        (self.width(), self.height())
    }

    fn frame_counter(&self) -> u64 {
        self.counter()
    }

    fn keywords(&self) -> BTreeMap<String, ShmKeyword> {
        ShmImage::keywords(self)
    }

    fn get_keyword(&self, name: &str) -> Option<KeywordValue> {
        ShmImage::get_keyword(self, name)
    }

    fn update_keyword(&self, name: &str, value: &KeywordValue) -> AppResult<()> {
        Ok(ShmImage::update_keyword(self, name, value)?)
    }

    fn set_keyword(&self, name: &str, value: &KeywordValue, comment: &str) -> AppResult<()> {
        Ok(ShmImage::set_keyword(self, name, value, comment)?)
    }
}

/// Directory holding the segment files (`$MILK_SHM_DIR`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDirectory {
    root: PathBuf,
}

impl Default for StreamDirectory {
    fn default() -> Self {
        Self::from_env()
    }
}

impl StreamDirectory {
    /// Directory at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$MILK_SHM_DIR`, falling back to `/milk/shm`.
    pub fn from_env() -> Self {
        let root = std::env::var_os("MILK_SHM_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/milk/shm"));
        Self { root }
    }

    /// Directory path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File of `stream`.
    pub fn path_of(&self, stream: &str) -> PathBuf {
        self.root.join(format!("{stream}.im.shm"))
    }

    /// Whether `stream` has a segment file.
    pub fn exists(&self, stream: &str) -> bool {
        self.path_of(stream).exists()
    }

    /// Map an existing segment.
    pub fn open(&self, stream: &str) -> AppResult<ShmImage> {
        Ok(ShmImage::open(&self.path_of(stream))?)
    }

    /// Publish a fresh segment, replacing any previous file.
    pub fn create(
        &self,
        stream: &str,
        width: u32,
        height: u32,
        datatype: PixelType,
        nkw: u32,
    ) -> AppResult<ShmImage> {
        fs::create_dir_all(&self.root)?;
        Ok(ShmImage::create(&self.path_of(stream), width, height, datatype, nkw)?)
    }

    /// Open `stream`, creating it when missing or when its geometry differs.
    pub fn open_or_create(
        &self,
        stream: &str,
        width: u32,
        height: u32,
        datatype: PixelType,
        nkw: u32,
    ) -> AppResult<ShmImage> {
        if let Ok(existing) = ShmImage::open(&self.path_of(stream)) {
            if existing.width() == width
                && existing.height() == height
                && existing.datatype() == datatype
            {
                return Ok(existing);
            }
        }
        self.create(stream, width, height, datatype, nkw)
    }

    /// Delete the segment file; a missing file is fine.
    pub fn remove(&self, stream: &str) -> AppResult<()> {
        match fs::remove_file(self.path_of(stream)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait until `stream` is published by `owner` (when given) and a new
    /// frame has been posted after attaching.
    pub async fn wait_for_stream(
        &self,
        stream: &str,
        owner: Option<u32>,
        timeout: Duration,
    ) -> AppResult<ShmImage> {
        let deadline = Instant::now() + timeout;
        let poll = Duration::from_millis(20);
        let mut attached: Option<(ShmImage, u64)> = None;

        loop {
            if attached.is_none() {
                if let Ok(image) = ShmImage::open(&self.path_of(stream)) {
                    let owned = owner.map(|pid| image.owner_pid() == pid).unwrap_or(true);
                    if image.is_live() && owned {
                        let c0 = image.counter();
                        attached = Some((image, c0));
                    }
                }
            }
            if let Some((image, c0)) = &attached {
                if !image.is_live() {
                    attached = None;
                } else if image.counter() > *c0 {
                    if let Some((image, _)) = attached.take() {
                        return Ok(image);
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(CamstackError::BackendStartFailed(format!(
                    "stream {stream} was not published within {:?}",
                    timeout
                )));
            }
            tokio::time::sleep(poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_and_reopen() {
        let dir = tempdir().unwrap();
        let streams = StreamDirectory::new(dir.path());
        let img = streams.create("cam", 32, 16, PixelType::U16, 8).unwrap();
        assert_eq!(img.frame_len(), 32 * 16 * 2);
        assert!(img.is_live());

        let other = streams.open("cam").unwrap();
        assert_eq!((other.width(), other.height()), (32, 16));
        assert_eq!(other.datatype(), PixelType::U16);
        assert_eq!(other.stream_name(), "cam");
    }

    #[test]
    fn frames_are_shared_between_mappings() {
        let dir = tempdir().unwrap();
        let streams = StreamDirectory::new(dir.path());
        let writer = streams.create("cam", 4, 2, PixelType::U8, 4).unwrap();
        let reader = streams.open("cam").unwrap();

        let frame: Vec<u8> = (0..8).collect();
        assert_eq!(writer.write_frame(&frame).unwrap(), 1);
        assert_eq!(reader.counter(), 1);
        assert_eq!(reader.read_frame(), frame);
        assert!(writer.write_frame(&[0u8; 3]).is_err());
    }

    #[test]
    fn keyword_slots() {
        let dir = tempdir().unwrap();
        let streams = StreamDirectory::new(dir.path());
        let img = streams.create("cam", 1, 1, PixelType::I32, 4).unwrap();

        img.set_keyword("EXPTIME", &KeywordValue::Float(0.001), "Exposure time (s)")
            .unwrap();
        img.update_keyword("DETGAIN", &KeywordValue::Int(42)).unwrap();
        img.update_keyword("DETECTOR", &KeywordValue::Str("A very long detector name".into()))
            .unwrap();
        img.update_keyword("CROPPED", &KeywordValue::Bool(true)).unwrap();

        let kws = img.keywords();
        assert_eq!(kws.len(), 4);
        assert_eq!(kws["EXPTIME"].comment, "Exposure time (s)");
        assert_eq!(img.get_keyword("DETGAIN"), Some(KeywordValue::Int(42)));
        assert_eq!(
            img.get_keyword("DETECTOR"),
            Some(KeywordValue::Str("A very long dete".into()))
        );
        assert_eq!(img.get_keyword("CROPPED"), Some(KeywordValue::Str("TT".into())));

        // Updating keeps the comment
        img.update_keyword("EXPTIME", &KeywordValue::Float(0.5)).unwrap();
        assert_eq!(img.keywords()["EXPTIME"].comment, "Exposure time (s)");

        // Table is full
        assert!(img.update_keyword("FIFTH", &KeywordValue::Int(5)).is_err());

        img.reset_keywords([("0000001f", KeywordValue::Float(1.0))]).unwrap();
        assert_eq!(img.keywords().len(), 1);
    }

    #[test]
    fn recreate_leaves_old_mapping_intact() {
        let dir = tempdir().unwrap();
        let streams = StreamDirectory::new(dir.path());
        let old = streams.create("cam", 8, 8, PixelType::U16, 4).unwrap();
        old.write_frame(&vec![1u8; 128]).unwrap();
        old.set_live(false);

        let new = streams.create("cam", 4, 4, PixelType::U16, 4).unwrap();
        assert_eq!(old.read_frame().len(), 128);
        assert!(!old.is_live());
        assert!(new.is_live());
        assert_eq!(streams.open("cam").unwrap().width(), 4);
    }

    #[test]
    fn open_or_create_reuses_matching_geometry() {
        let dir = tempdir().unwrap();
        let streams = StreamDirectory::new(dir.path());
        let first = streams.open_or_create("cam", 4, 4, PixelType::U16, 4).unwrap();
        first.bump();
        let again = streams.open_or_create("cam", 4, 4, PixelType::U16, 4).unwrap();
        assert_eq!(again.counter(), 1);
        let resized = streams.open_or_create("cam", 8, 4, PixelType::U16, 4).unwrap();
        assert_eq!(resized.counter(), 0);
    }

    #[tokio::test]
    async fn wait_for_stream_needs_a_fresh_frame() {
        let dir = tempdir().unwrap();
        let streams = StreamDirectory::new(dir.path());
        let err = streams
            .wait_for_stream("cam", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CamstackError::BackendStartFailed(_)));

        let img = streams.create("cam", 2, 2, PixelType::U8, 2).unwrap();
        img.set_owner_pid(1234);
        let producer = tokio::spawn(async move {
            for _ in 0..20 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                img.write_frame(&[0u8; 4]).unwrap();
            }
        });
        let handle = streams
            .wait_for_stream("cam", Some(1234), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(handle.counter() >= 1);
        producer.await.unwrap();
    }
}
