//! Packet replay for testing without camera hardware.
//!
//! Loads a capture written by [`crate::capture`] and serves it as a
//! [`DmaTransport`], so a recorded session runs through the full acquisition
//! pipeline: reader thread, ring, decode workers and consumers.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::path::Path;
//! use streamcam_lib::replay::{ReplayConfig, ReplayTransport};
//!
//! let transport = ReplayTransport::load(Path::new("session.scap"), ReplayConfig::default())?;
//! let acquisition = Acquisition::new(config, Box::new(transport), registers, decoder)?;
//! ```

use std::path::Path;
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::capture::{CaptureError, CaptureFile, CaptureHeader, CaptureRecord, CaptureSummary};
use crate::error::AcquisitionError;
use crate::frame_assembler::{FrameAssembler, StreamRequest};
use crate::geometry::{compute_geometry, SensorFormat, FRAME_HEADER_SIZE};
use crate::reader::{DmaTransport, PacketCallback};
use crate::ring::{FrameInfo, ImageDimensions, RingBuffer};

/// Errors that can occur while loading or replaying a capture.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// The capture file could not be read.
    #[error("failed to load capture: {0}")]
    Capture(#[from] CaptureError),

    /// The capture header describes no usable stream.
    #[error("invalid capture header: {0}")]
    Header(String),

    /// The capture holds no packets.
    #[error("capture {0} contains no packets")]
    Empty(String),

    /// Frame assembly failed.
    #[error("acquisition error: {0}")]
    Acquisition(#[from] AcquisitionError),
}

/// Result type alias for replay operations.
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Configuration for packet replay.
#[derive(Debug, Clone, Default)]
pub struct ReplayConfig {
    /// Pause before each packet; zero replays as fast as possible.
    pub packet_interval: Duration,
    /// Start over when the capture is exhausted.
    pub loop_playback: bool,
}

/// A [`DmaTransport`] serving a recorded stream.
///
/// Recorded timeouts are reported at the same places they happened, without
/// waiting. Once the capture is exhausted every streaming call times out,
/// like an idle camera. With looping, the wrap-around is reported as one
/// timeout so that a frame cut by the end of the capture is closed.
pub struct ReplayTransport {
    header: CaptureHeader,
    summary: Option<CaptureSummary>,
    records: Vec<CaptureRecord>,
    config: ReplayConfig,
    cursor: usize,
    rounds: u64,
}

impl ReplayTransport {
    /// Loads a capture file.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::Capture` if the file cannot be read,
    /// `ReplayError::Header` if its header is unusable and
    /// `ReplayError::Empty` if it holds no packets.
    pub fn load(path: &Path, config: ReplayConfig) -> Result<Self> {
        let capture = CaptureFile::read(path)?;
        if capture.packets().next().is_none() {
            return Err(ReplayError::Empty(path.display().to_string()));
        }
        check_header(&capture.header)?;

        log::info!(
            "Loaded {} records from {} (firmware {}, {} outputs)",
            capture.records.len(),
            path.display(),
            capture.header.firmware,
            capture.header.outputs
        );
        match &capture.summary {
            Some(summary) => log::info!(
                "Recorded {} frames in {} ms",
                summary.frames,
                summary.duration_ms
            ),
            None => log::warn!("Capture {} was not finished", path.display()),
        }

        Ok(Self::from_capture(capture, config))
    }

    /// Serves a capture already in memory.
    #[must_use]
    pub fn from_capture(capture: CaptureFile, config: ReplayConfig) -> Self {
        Self {
            header: capture.header,
            summary: capture.summary,
            records: capture.records,
            config,
            cursor: 0,
            rounds: 0,
        }
    }

    /// Serves bare packets with a default header.
    #[must_use]
    pub fn from_packets(packets: Vec<Vec<u8>>, config: ReplayConfig) -> Self {
        Self::from_capture(
            CaptureFile {
                header: CaptureHeader::default(),
                records: packets.into_iter().map(CaptureRecord::Packet).collect(),
                summary: None,
            },
            config,
        )
    }

    /// Stream parameters of the capture.
    #[must_use]
    pub fn header(&self) -> &CaptureHeader {
        &self.header
    }

    /// Totals of the capture, if it was finished.
    #[must_use]
    pub fn summary(&self) -> Option<&CaptureSummary> {
        self.summary.as_ref()
    }

    /// Number of recorded packets.
    #[must_use]
    pub fn packet_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r, CaptureRecord::Packet(_)))
            .count()
    }

    /// Number of completed passes over the capture.
    #[must_use]
    pub fn rounds(&self) -> u64 {
        self.rounds
    }
}

impl DmaTransport for ReplayTransport {
    fn start_engine(&mut self) -> crate::error::Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn stream(
        &mut self,
        timeout: Duration,
        callback: &mut PacketCallback<'_>,
    ) -> crate::error::Result<()> {
        loop {
            let Some(record) = self.records.get(self.cursor) else {
                if self.config.loop_playback && !self.records.is_empty() {
                    self.cursor = 0;
                    self.rounds += 1;
                    log::debug!("Replay loop {} completed, restarting", self.rounds);
                } else {
                    thread::sleep(timeout);
                }
                return Err(AcquisitionError::Timeout);
            };
            self.cursor += 1;

            let packet = match record {
                CaptureRecord::Packet(packet) => packet,
                CaptureRecord::Timeout => return Err(AcquisitionError::Timeout),
            };
            if !self.config.packet_interval.is_zero() {
                thread::sleep(self.config.packet_interval);
            }
            if callback(packet)? == StreamRequest::Stop {
                return Ok(());
            }
        }
    }
}

fn check_header(header: &CaptureHeader) -> Result<()> {
    if !matches!(header.outputs, 4 | 16) || header.packet_size == 0 || header.max_lines == 0 {
        return Err(ReplayError::Header(format!(
            "{} outputs, packet size {}, {} lines",
            header.outputs, header.packet_size, header.max_lines
        )));
    }
    Ok(())
}

/// Assembles every frame of a capture on the calling thread.
///
/// Geometry and quirks come from the capture header; recorded timeouts
/// close partial frames as the reader did. Returns the metadata of each
/// assembled frame.
///
/// # Errors
///
/// Returns `ReplayError` if the capture cannot be loaded or a frame does not
/// fit the ring.
pub fn replay_frame_infos(path: &Path) -> Result<Vec<FrameInfo>> {
    let capture = CaptureFile::read(path)?;
    check_header(&capture.header)?;
    let params = capture.header.geometry_params();

    let padded_size = [SensorFormat::Cmosis, SensorFormat::Cmosis20]
        .into_iter()
        .map(|format| compute_geometry(&params, format, FRAME_HEADER_SIZE, capture.header.max_lines))
        .collect::<crate::error::Result<Vec<_>>>()?
        .into_iter()
        .map(|g| g.padded_size)
        .max()
        .unwrap_or_default();

    let (ring, writer) = RingBuffer::allocate(
        2,
        padded_size,
        ImageDimensions {
            width: 0,
            height: 0,
            bpp: 16,
        },
    )?;
    let mut assembler = FrameAssembler::new(writer, params, capture.header.quirks);

    let mut infos = Vec::new();
    for record in &capture.records {
        match record {
            CaptureRecord::Packet(packet) => {
                assembler.process_packet(packet)?;
            }
            CaptureRecord::Timeout => {
                assembler.on_timeout()?;
            }
        }
        collect_infos(&ring, &mut infos);
    }
    assembler.on_timeout()?;
    collect_infos(&ring, &mut infos);

    log::info!("Replayed {} frames from {}", infos.len(), path.display());
    Ok(infos)
}

/// Appends the metadata of frames completed since the last call.
fn collect_infos(ring: &RingBuffer, infos: &mut Vec<FrameInfo>) {
    let first = infos.len() as u64 + 1;
    for sequence in first..=ring.produced() {
        match ring.info(sequence) {
            Ok(info) => infos.push(info),
            Err(e) => log::warn!("Frame {} lost during replay: {}", sequence, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureWriter;
    use crate::test_utils::{packetize, FrameGenerator};
    use std::path::PathBuf;

    fn write_capture(path: &Path, records: &[CaptureRecord], header: &CaptureHeader) {
        let mut writer = CaptureWriter::create(path, header).unwrap();
        for record in records {
            match record {
                CaptureRecord::Packet(p) => writer.packet(p).unwrap(),
                CaptureRecord::Timeout => writer.timeout().unwrap(),
            }
        }
        writer.finish(0, Duration::ZERO).unwrap();
    }

    fn capture_file(dir: &Path, frames: u32) -> PathBuf {
        let gen = FrameGenerator::default();
        let stream: Vec<u8> = (1..=frames).flat_map(|seq| gen.padded_frame(seq, 2)).collect();
        let records: Vec<_> = packetize(&stream, 4096)
            .into_iter()
            .map(CaptureRecord::Packet)
            .collect();
        let path = dir.join("session.scap");
        write_capture(&path, &records, &CaptureHeader::default());
        path
    }

    // =========================================================================
    // Loading
    // =========================================================================

    #[test]
    fn test_load_reads_header_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = capture_file(dir.path(), 2);
        let transport = ReplayTransport::load(&path, ReplayConfig::default()).unwrap();
        assert_eq!(transport.packet_count(), 6);
        assert_eq!(transport.header().outputs, 16);
        assert_eq!(transport.summary().map(|s| s.packets), Some(6));
    }

    #[test]
    fn test_load_empty_capture() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.scap");
        write_capture(&path, &[CaptureRecord::Timeout], &CaptureHeader::default());
        assert!(matches!(
            ReplayTransport::load(&path, ReplayConfig::default()),
            Err(ReplayError::Empty(_))
        ));
    }

    #[test]
    fn test_load_rejects_bad_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.scap");
        let header = CaptureHeader {
            outputs: 3,
            ..CaptureHeader::default()
        };
        write_capture(&path, &[CaptureRecord::Packet(vec![0; 8])], &header);
        assert!(matches!(
            ReplayTransport::load(&path, ReplayConfig::default()),
            Err(ReplayError::Header(_))
        ));
    }

    // =========================================================================
    // Streaming
    // =========================================================================

    #[test]
    fn test_stream_exhausts_then_times_out() {
        let mut transport =
            ReplayTransport::from_packets(vec![vec![1; 4], vec![2; 4]], ReplayConfig::default());
        let mut seen = Vec::new();
        let result = transport.stream(Duration::from_millis(1), &mut |p: &[u8]| {
            seen.push(p[0]);
            Ok(StreamRequest::NeedFragment)
        });
        assert!(matches!(result, Err(AcquisitionError::Timeout)));
        assert_eq!(seen, vec![1, 2]);

        let mut late = 0;
        let result = transport.stream(Duration::from_millis(1), &mut |_p: &[u8]| {
            late += 1;
            Ok(StreamRequest::NeedFragment)
        });
        assert!(matches!(result, Err(AcquisitionError::Timeout)));
        assert_eq!(late, 0);
    }

    #[test]
    fn test_recorded_timeout_interrupts_stream() {
        let capture = CaptureFile {
            header: CaptureHeader::default(),
            records: vec![
                CaptureRecord::Packet(vec![1; 4]),
                CaptureRecord::Timeout,
                CaptureRecord::Packet(vec![2; 4]),
            ],
            summary: None,
        };
        let mut transport = ReplayTransport::from_capture(capture, ReplayConfig::default());

        let mut seen = Vec::new();
        let mut collect = |p: &[u8]| -> crate::error::Result<StreamRequest> {
            seen.push(p[0]);
            Ok(StreamRequest::NeedFragment)
        };
        // an hour-long timeout would hang if the recorded one waited
        let result = transport.stream(Duration::from_secs(3600), &mut collect);
        assert!(matches!(result, Err(AcquisitionError::Timeout)));
        let result = transport.stream(Duration::from_millis(1), &mut collect);
        assert!(matches!(result, Err(AcquisitionError::Timeout)));
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn test_loop_playback_restarts() {
        let config = ReplayConfig {
            loop_playback: true,
            ..ReplayConfig::default()
        };
        let mut transport = ReplayTransport::from_packets(vec![vec![7; 4]], config);
        let mut count = 0;
        for _ in 0..3 {
            let _ = transport.stream(Duration::from_millis(1), &mut |_p: &[u8]| {
                count += 1;
                Ok(StreamRequest::NeedFragment)
            });
        }
        assert_eq!(count, 3);
        assert_eq!(transport.rounds(), 3);
    }

    #[test]
    fn test_stop_request_keeps_position() {
        let mut transport = ReplayTransport::from_packets(
            vec![vec![1; 4], vec![2; 4], vec![3; 4]],
            ReplayConfig::default(),
        );
        transport
            .stream(Duration::from_millis(1), &mut |_p: &[u8]| Ok(StreamRequest::Stop))
            .unwrap();
        let mut next = 0;
        transport
            .stream(Duration::from_millis(1), &mut |p: &[u8]| {
                next = p[0];
                Ok(StreamRequest::Stop)
            })
            .unwrap();
        assert_eq!(next, 2);
    }

    // =========================================================================
    // Offline assembly
    // =========================================================================

    #[test]
    fn test_replay_frame_infos() {
        let dir = tempfile::tempdir().unwrap();
        let path = capture_file(dir.path(), 3);
        let infos = replay_frame_infos(&path).unwrap();
        assert_eq!(infos.len(), 3);
        for (i, info) in infos.iter().enumerate() {
            assert_eq!(info.sequence, i as u64 + 1);
            assert_eq!(info.hw_sequence, i as u32 + 1);
            assert_eq!(info.raw_size, 8288);
            assert!(!info.broken);
        }
    }

    #[test]
    fn test_replay_frame_infos_closes_at_recorded_timeout() {
        let gen = FrameGenerator::default();
        let frame = gen.padded_frame(9, 2);
        let mut records: Vec<_> = packetize(&frame[..5000], 4096)
            .into_iter()
            .map(CaptureRecord::Packet)
            .collect();
        records.push(CaptureRecord::Timeout);
        records.extend(
            packetize(&gen.padded_frame(10, 2), 4096)
                .into_iter()
                .map(CaptureRecord::Packet),
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cut.scap");
        write_capture(&path, &records, &CaptureHeader::default());

        let infos = replay_frame_infos(&path).unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].hw_sequence, 9);
        assert!(infos[0].broken);
        assert_eq!(infos[1].hw_sequence, 10);
        assert!(!infos[1].broken);
    }
}
