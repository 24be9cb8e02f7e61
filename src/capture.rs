//! Recording of DMA packet streams
//!
//! A capture holds what is needed to run a recorded session through the
//! acquisition pipeline again: the stream parameters frame geometry depends
//! on, every packet in arrival order, and the points where the transport
//! timed out (the reader force-closes partial frames there, so they shape
//! frame boundaries as much as the packets do).
//!
//! ```text
//! "SCAP" | u16 version | u32 len | CaptureHeader (JSON)
//! record*:
//!   0x01 PACKET   u32 len | bytes
//!   0x02 TIMEOUT
//!   0x03 SUMMARY  u32 len | CaptureSummary (JSON), always last
//! ```
//!
//! Integers are little endian. A capture cut short (no summary) still loads.
//!
//! ```ignore
//! let recorder = Recorder::create(&path, CaptureHeader::new(&config, 5, 16))?;
//! let acquisition = Acquisition::new(config, Box::new(recorder.transport(dma)), regs, decoder)?;
//! acquisition.set_raw_data_observer(Some(recorder.frame_counter()))?;
//! // ... acquire ...
//! acquisition.stop()?;
//! let summary = recorder.finish()?;
//! ```

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::config::{AcquisitionConfig, QuirkSet, DMA_PACKET_LENGTH};
use crate::error::AcquisitionError;
use crate::frame_assembler::{RawDataEvent, RawDataObserver};
use crate::geometry::{GeometryParams, MAX_LINES};
use crate::reader::{DmaTransport, PacketCallback};
use crate::registers::SUPPORTED_FIRMWARE;

const MAGIC: [u8; 4] = *b"SCAP";
const VERSION: u16 = 1;

const RECORD_PACKET: u8 = 0x01;
const RECORD_TIMEOUT: u8 = 0x02;
const RECORD_SUMMARY: u8 = 0x03;

/// Errors of capture recording and loading.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// The recorder was already finished.
    #[error("capture is already finished")]
    Finished,

    /// A recorder mutex was poisoned.
    #[error("capture lock poisoned: {0}")]
    LockError(String),

    /// File access failed.
    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Header or summary JSON is invalid.
    #[error("capture JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The file does not start with the capture magic.
    #[error("not a capture file (starts with {0:02x?})")]
    BadMagic([u8; 4]),

    /// Written by a newer format revision.
    #[error("unsupported capture version {0}")]
    UnsupportedVersion(u16),

    /// A record kind this reader doesn't know.
    #[error("unknown record kind {kind:#04x} at offset {offset}")]
    UnknownRecord {
        /// The kind byte.
        kind: u8,
        /// File offset of the record.
        offset: usize,
    },

    /// The file ends inside a record.
    #[error("capture truncated at offset {offset}: {needed} bytes needed, {available} left")]
    Truncated {
        /// Offset of the incomplete field.
        offset: usize,
        /// Bytes the field needs.
        needed: usize,
        /// Bytes left in the file.
        available: usize,
    },

    /// A packet longer than a record can describe.
    #[error("packet of {0} bytes can't be recorded")]
    PacketTooLarge(usize),
}

/// Result type alias for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Stream parameters a capture was taken with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureHeader {
    /// Firmware version reported by the camera.
    pub firmware: u32,
    /// Active sensor outputs (4 or 16).
    pub outputs: usize,
    /// DMA packet size the stream was read with.
    pub packet_size: usize,
    /// Workarounds active while recording.
    pub quirks: QuirkSet,
    /// Largest frame, in lines, the ring was sized for.
    pub max_lines: usize,
    /// Recording start, milliseconds since the Unix epoch.
    pub started_unix_ms: u64,
    /// Free-form notes.
    pub description: String,
}

impl Default for CaptureHeader {
    fn default() -> Self {
        Self {
            firmware: SUPPORTED_FIRMWARE,
            outputs: 16,
            packet_size: DMA_PACKET_LENGTH,
            quirks: QuirkSet::default(),
            max_lines: MAX_LINES,
            started_unix_ms: 0,
            description: String::new(),
        }
    }
}

impl CaptureHeader {
    /// Header for a stream read with `config` from a camera with the given
    /// firmware and output count, stamped with the current time.
    #[must_use]
    pub fn new(config: &AcquisitionConfig, firmware: u32, outputs: usize) -> Self {
        Self {
            firmware,
            outputs,
            packet_size: config.packet_size,
            quirks: config.quirks,
            max_lines: config.max_lines,
            started_unix_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_millis() as u64),
            description: String::new(),
        }
    }

    /// Geometry parameters of the recorded stream.
    #[must_use]
    pub fn geometry_params(&self) -> GeometryParams {
        GeometryParams {
            outputs: self.outputs,
            packet_size: self.packet_size,
            missing_payload: self.quirks.missing_payload,
        }
    }
}

/// Totals written when a recording is finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSummary {
    /// Packets recorded.
    pub packets: u64,
    /// Transport timeouts recorded.
    pub timeouts: u64,
    /// Payload bytes recorded.
    pub bytes: u64,
    /// Frames the reader completed while recording.
    pub frames: u64,
    /// Recording length in milliseconds.
    pub duration_ms: u64,
}

/// One entry of the recorded stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureRecord {
    /// A DMA packet.
    Packet(Vec<u8>),
    /// The transport timed out here.
    Timeout,
}

/// A loaded capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFile {
    /// Stream parameters.
    pub header: CaptureHeader,
    /// Packets and timeouts in arrival order.
    pub records: Vec<CaptureRecord>,
    /// Totals, missing if the recording was not finished.
    pub summary: Option<CaptureSummary>,
}

impl CaptureFile {
    /// Reads a capture from disk.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Io` if the file cannot be read and a format
    /// error if it is not a well-formed capture.
    pub fn read(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let capture = Self::parse(&data)?;
        log::debug!(
            "Read capture {}: {} records{}",
            path.display(),
            capture.records.len(),
            if capture.summary.is_some() { "" } else { ", unfinished" }
        );
        Ok(capture)
    }

    /// Parses a capture held in memory.
    ///
    /// # Errors
    ///
    /// Returns a format error if `data` is not a well-formed capture.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut input = Input { data, pos: 0 };

        let magic = input.take(4)?;
        if magic != MAGIC {
            return Err(CaptureError::BadMagic([magic[0], magic[1], magic[2], magic[3]]));
        }
        let version = input.u16()?;
        if version != VERSION {
            return Err(CaptureError::UnsupportedVersion(version));
        }
        let len = input.u32()? as usize;
        let header: CaptureHeader = serde_json::from_slice(input.take(len)?)?;

        let mut records = Vec::new();
        let mut summary = None;
        while !input.is_empty() {
            let offset = input.pos;
            match input.u8()? {
                RECORD_PACKET => {
                    let len = input.u32()? as usize;
                    records.push(CaptureRecord::Packet(input.take(len)?.to_vec()));
                }
                RECORD_TIMEOUT => records.push(CaptureRecord::Timeout),
                RECORD_SUMMARY => {
                    let len = input.u32()? as usize;
                    summary = Some(serde_json::from_slice(input.take(len)?)?);
                    break;
                }
                kind => return Err(CaptureError::UnknownRecord { kind, offset }),
            }
        }

        Ok(Self {
            header,
            records,
            summary,
        })
    }

    /// Recorded packets, without the timeouts.
    pub fn packets(&self) -> impl Iterator<Item = &[u8]> {
        self.records.iter().filter_map(|record| match record {
            CaptureRecord::Packet(packet) => Some(packet.as_slice()),
            CaptureRecord::Timeout => None,
        })
    }
}

struct Input<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Input<'a> {
    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let available = self.data.len() - self.pos;
        if n > available {
            return Err(CaptureError::Truncated {
                offset: self.pos,
                needed: n,
                available,
            });
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Streams records into any writer.
pub struct CaptureWriter<W: Write> {
    out: W,
    summary: CaptureSummary,
}

impl CaptureWriter<BufWriter<File>> {
    /// Creates (or truncates) the capture file at `path`.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Io` if the file cannot be written.
    pub fn create(path: &Path, header: &CaptureHeader) -> Result<Self> {
        Self::new(BufWriter::new(File::create(path)?), header)
    }
}

impl<W: Write> CaptureWriter<W> {
    /// Writes the file header to `out`.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Io` or `CaptureError::Json` if writing fails.
    pub fn new(mut out: W, header: &CaptureHeader) -> Result<Self> {
        let json = serde_json::to_vec(header)?;
        out.write_all(&MAGIC)?;
        out.write_all(&VERSION.to_le_bytes())?;
        out.write_all(&record_len(&json)?.to_le_bytes())?;
        out.write_all(&json)?;
        Ok(Self {
            out,
            summary: CaptureSummary::default(),
        })
    }

    /// Appends a packet record.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Io` if writing fails.
    pub fn packet(&mut self, packet: &[u8]) -> Result<()> {
        self.out.write_all(&[RECORD_PACKET])?;
        self.out.write_all(&record_len(packet)?.to_le_bytes())?;
        self.out.write_all(packet)?;
        self.summary.packets += 1;
        self.summary.bytes += packet.len() as u64;
        Ok(())
    }

    /// Appends a timeout record.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Io` if writing fails.
    pub fn timeout(&mut self) -> Result<()> {
        self.out.write_all(&[RECORD_TIMEOUT])?;
        self.summary.timeouts += 1;
        Ok(())
    }

    /// Writes the summary record and flushes, returning the writer.
    ///
    /// `frames` and `duration` complete the counts kept by the writer.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Io` or `CaptureError::Json` if writing fails.
    pub fn finish(mut self, frames: u64, duration: Duration) -> Result<(W, CaptureSummary)> {
        self.summary.frames = frames;
        self.summary.duration_ms = duration.as_millis() as u64;
        let json = serde_json::to_vec(&self.summary)?;
        self.out.write_all(&[RECORD_SUMMARY])?;
        self.out.write_all(&record_len(&json)?.to_le_bytes())?;
        self.out.write_all(&json)?;
        self.out.flush()?;
        Ok((self.out, self.summary))
    }
}

fn record_len(bytes: &[u8]) -> Result<u32> {
    u32::try_from(bytes.len()).map_err(|_| CaptureError::PacketTooLarge(bytes.len()))
}

struct RecorderState {
    writer: Option<CaptureWriter<BufWriter<File>>>,
    frames: u64,
    started: Instant,
    error: Option<CaptureError>,
}

impl RecorderState {
    /// Runs a write, turning the first failure into the end of the recording.
    fn write<F>(&mut self, op: F)
    where
        F: FnOnce(&mut CaptureWriter<BufWriter<File>>) -> Result<()>,
    {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if let Err(e) = op(writer) {
            log::error!("Capture write failed, recording stopped: {}", e);
            self.writer = None;
            self.error = Some(e);
        }
    }
}

/// Records a live stream to a capture file.
///
/// Cheap to clone; the transport wrapper and frame counter share the file
/// with the handle that finishes it.
#[derive(Clone)]
pub struct Recorder {
    state: Arc<Mutex<RecorderState>>,
}

impl Recorder {
    /// Starts a capture file at `path`.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Io` if the file cannot be created.
    pub fn create(path: &Path, header: CaptureHeader) -> Result<Self> {
        let writer = CaptureWriter::create(path, &header)?;
        log::info!(
            "Recording to {} ({} outputs, {} byte packets)",
            path.display(),
            header.outputs,
            header.packet_size
        );
        Ok(Self {
            state: Arc::new(Mutex::new(RecorderState {
                writer: Some(writer),
                frames: 0,
                started: Instant::now(),
                error: None,
            })),
        })
    }

    /// Wraps `inner` so that everything it delivers is recorded.
    pub fn transport(&self, inner: Box<dyn DmaTransport>) -> RecordingTransport {
        RecordingTransport {
            inner,
            recorder: self.clone(),
        }
    }

    /// Raw data observer counting completed frames into the summary.
    pub fn frame_counter(&self) -> RawDataObserver {
        let recorder = self.clone();
        Box::new(move |event: &RawDataEvent<'_>| {
            if event.eof {
                if let Ok(mut state) = recorder.state.lock() {
                    if state.writer.is_some() {
                        state.frames += 1;
                    }
                }
            }
            true
        })
    }

    /// Whether records are still being written.
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.state.lock().map(|s| s.writer.is_some()).unwrap_or(false)
    }

    fn record<F>(&self, op: F)
    where
        F: FnOnce(&mut CaptureWriter<BufWriter<File>>) -> Result<()>,
    {
        match self.state.lock() {
            Ok(mut state) => state.write(op),
            Err(_) => log::warn!("Capture state poisoned, record dropped"),
        }
    }

    /// Writes the summary and closes the file.
    ///
    /// # Errors
    ///
    /// Returns the write error that ended the recording early, if any,
    /// `CaptureError::Finished` when called twice, and `CaptureError::Io`
    /// if the summary cannot be written.
    pub fn finish(&self) -> Result<CaptureSummary> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))?;
        if let Some(e) = state.error.take() {
            return Err(e);
        }
        let writer = state.writer.take().ok_or(CaptureError::Finished)?;
        let (_, summary) = writer.finish(state.frames, state.started.elapsed())?;
        log::info!(
            "Capture finished: {} packets, {} timeouts, {} frames, {} ms",
            summary.packets,
            summary.timeouts,
            summary.frames,
            summary.duration_ms
        );
        Ok(summary)
    }
}

/// Transport wrapper feeding a [`Recorder`].
pub struct RecordingTransport {
    inner: Box<dyn DmaTransport>,
    recorder: Recorder,
}

impl DmaTransport for RecordingTransport {
    fn start_engine(&mut self) -> crate::error::Result<()> {
        self.inner.start_engine()
    }

    fn stop_engine(&mut self) -> crate::error::Result<()> {
        self.inner.stop_engine()
    }

    fn stream(
        &mut self,
        timeout: Duration,
        callback: &mut PacketCallback<'_>,
    ) -> crate::error::Result<()> {
        let recorder = &self.recorder;
        let result = self.inner.stream(timeout, &mut |packet: &[u8]| {
            recorder.record(|w| w.packet(packet));
            callback(packet)
        });
        if matches!(result, Err(AcquisitionError::Timeout)) {
            recorder.record(CaptureWriter::timeout);
        }
        result
    }
}
