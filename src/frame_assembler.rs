//! Frame assembly from DMA packets
//!
//! Reassembles the packet stream into frames inside the ring buffer. The
//! stream carries frames back to back; the only delimiter is the magic at the
//! start of each frame header, and the transport pads the end of a frame out
//! to whole packets.
//!
//! A frame ends at whichever comes first:
//! - the accumulated size reaches the size computed from the header, or
//! - the magic of the next frame shows up earlier (the frame is then closed
//!   short and marked broken).
//!
//! Bytes following the end of a frame inside the same packet are fed back as
//! the start of the next frame; no recursion is involved.
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut assembler = FrameAssembler::new(writer, params, QuirkSet::default());
//! for packet in packets {
//!     if assembler.process_packet(&packet)? == StreamRequest::Stop {
//!         break;
//!     }
//! }
//! ```

use std::time::SystemTime;

use crate::config::{ArmedAutostop, QuirkSet};
use crate::debug::{DebugCategory, DebugSink};
use crate::error::{AcquisitionError, Result};
use crate::geometry::{compute_geometry, FrameGeometry, GeometryParams, FRAME_HEADER_SIZE};
use crate::header::{find_magic, parse_header, ENTITY_SIZE};
use crate::ring::{FrameInfo, FrameWriter};

/// Length of the run compared by the repeating-data workaround.
const REPEAT_RUN: usize = 16;

/// What the transport should do after a packet was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRequest {
    /// Packet discarded, keep waiting for data.
    Continue,
    /// A frame (or a split header) is in progress, deliver the next packet.
    NeedFragment,
    /// Stop streaming.
    Stop,
}

/// Data handed to the raw data observer.
#[derive(Debug, Clone, Copy)]
pub struct RawDataEvent<'a> {
    /// Frame the data belongs to; meaningless for padding.
    pub sequence: u64,
    /// Last chunk of the frame.
    pub eof: bool,
    /// Inter-frame padding preceding a frame header.
    pub padding: bool,
    /// The bytes themselves.
    pub data: &'a [u8],
}

/// Callback receiving every accepted chunk of the stream.
///
/// Returning `false` asks the reader to stop after the current frame.
pub type RawDataObserver = Box<dyn for<'a> FnMut(&RawDataEvent<'a>) -> bool + Send>;

struct ActiveFrame {
    geometry: FrameGeometry,
    filled: usize,
}

/// Assembles frames from DMA packets into a ring buffer.
pub struct FrameAssembler {
    writer: FrameWriter,
    params: GeometryParams,
    quirks: QuirkSet,
    store_data: bool,
    autostop: ArmedAutostop,
    active: Option<ActiveFrame>,
    /// Header bytes stashed when a header was split across packets.
    saved_header: Vec<u8>,
    packet_id: u64,
    /// Sequence for which a missing magic was already reported.
    invalid_logged_for: Option<u64>,
    observer: Option<RawDataObserver>,
    observer_stop: bool,
    debug: DebugSink,
}

impl FrameAssembler {
    /// Creates an assembler writing into the ring behind `writer`.
    pub fn new(writer: FrameWriter, params: GeometryParams, quirks: QuirkSet) -> Self {
        Self {
            writer,
            params,
            quirks,
            store_data: true,
            autostop: ArmedAutostop::default(),
            active: None,
            saved_header: Vec::with_capacity(FRAME_HEADER_SIZE * 2),
            packet_id: 0,
            invalid_logged_for: None,
            observer: None,
            observer_stop: false,
            debug: DebugSink::default(),
        }
    }

    /// Stops producing once the policy fires.
    #[must_use]
    pub fn with_autostop(mut self, autostop: ArmedAutostop) -> Self {
        self.autostop = autostop;
        self
    }

    /// Installs a raw data observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Option<RawDataObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Routes debug output to `debug`.
    #[must_use]
    pub fn with_debug(mut self, debug: DebugSink) -> Self {
        self.debug = debug;
        self
    }

    /// When `false`, frames are tracked but their bytes are not stored.
    #[must_use]
    pub fn with_data_storage(mut self, store_data: bool) -> Self {
        self.store_data = store_data;
        self
    }

    /// Removes the observer so it can be reinstalled on the next start.
    pub fn take_observer(&mut self) -> Option<RawDataObserver> {
        self.observer.take()
    }

    /// Bytes accumulated for the frame in progress.
    #[must_use]
    pub fn partial_bytes(&self) -> usize {
        self.active.as_ref().map_or(0, |f| f.filled)
    }

    /// Sequence of the frame currently being filled.
    #[must_use]
    pub fn current_sequence(&self) -> u64 {
        self.writer.sequence()
    }

    /// Whether the observer or the autostop policy asked to stop.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.observer_stop
    }

    /// Packets seen so far.
    #[must_use]
    pub fn packets(&self) -> u64 {
        self.packet_id
    }

    /// Feeds one DMA packet.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::TooBig` if a frame outgrows its slot. Any
    /// other per-packet anomaly is logged and the data discarded.
    pub fn process_packet(&mut self, packet: &[u8]) -> Result<StreamRequest> {
        self.packet_id += 1;
        self.writer.ring().count_packet();
        if self.debug.enabled(DebugCategory::RawPackets) {
            self.debug.dump(
                DebugCategory::RawPackets,
                &format!("frame{:4}/frame{:9}", self.writer.sequence(), self.packet_id),
                packet,
            );
        }

        let joined;
        let mut buf = packet;
        if self.active.is_none() && !self.saved_header.is_empty() {
            let mut data = std::mem::take(&mut self.saved_header);
            data.extend_from_slice(packet);
            joined = data;
            buf = &joined;
        }

        loop {
            if self.active.is_none() {
                match self.start_frame(buf)? {
                    Some(start) => buf = &buf[start..],
                    None if self.saved_header.is_empty() => return Ok(StreamRequest::Continue),
                    None => return Ok(StreamRequest::NeedFragment),
                }
            }

            let Some(extra) = self.accumulate(buf)? else {
                return Ok(StreamRequest::NeedFragment);
            };

            if self.complete_frame()? || self.observer_stop {
                return Ok(StreamRequest::Stop);
            }
            match extra {
                Some(offset) => buf = &buf[offset..],
                None => return Ok(StreamRequest::NeedFragment),
            }
        }
    }

    /// Called by the reader when the transport timed out.
    ///
    /// A partially accumulated frame is closed (broken if short) so that its
    /// state does not leak across timeouts. Returns whether to stop.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::LockError` if slot metadata is poisoned.
    pub fn on_timeout(&mut self) -> Result<bool> {
        if self.active.is_some() {
            log::debug!(
                "Transport timed out, closing frame {} after {} bytes",
                self.writer.sequence(),
                self.partial_bytes()
            );
            return self.complete_frame();
        }
        Ok(self.autostop.deadline_passed())
    }

    /// Looks for a frame header at the start of `buf`.
    ///
    /// Returns the offset of the header on success. `None` means the data was
    /// discarded or stashed as a split header.
    fn start_frame(&mut self, buf: &[u8]) -> Result<Option<usize>> {
        let sequence = self.writer.sequence();
        let Some(start) = find_magic(buf, 0) else {
            if self.debug.enabled(DebugCategory::RawPackets) {
                self.debug.dump(
                    DebugCategory::RawPackets,
                    &format!("frame{:4}/frame{:9}.invalid", sequence, self.packet_id),
                    buf,
                );
            }
            if self.invalid_logged_for != Some(sequence) {
                self.debug.message(
                    DebugCategory::Hardware,
                    format_args!(
                        "No frame magic in DMA packet of {} bytes, current event {}",
                        buf.len(),
                        sequence
                    ),
                );
                log::trace!("No frame magic in {} bytes, waiting for frame {}", buf.len(), sequence);
                self.invalid_logged_for = Some(sequence);
            }
            return Ok(None);
        };

        if start > 0 {
            self.notify(RawDataEvent {
                sequence: 0,
                eof: false,
                padding: true,
                data: &buf[..start],
            });
        }

        let rest = &buf[start..];
        if rest.len() < FRAME_HEADER_SIZE {
            if self.quirks.multiframe_headers && rest.len() >= ENTITY_SIZE {
                log::trace!("Frame header split across packets, stashing {} bytes", rest.len());
                self.saved_header.clear();
                self.saved_header.extend_from_slice(rest);
            } else {
                self.debug.message(
                    DebugCategory::Hardware,
                    format_args!(
                        "Frame magic is not found in the remaining {} bytes, ignoring broken data",
                        rest.len()
                    ),
                );
            }
            return Ok(None);
        }

        let header = match parse_header(rest) {
            Ok(header) => header,
            Err(e) => {
                self.debug.message(
                    DebugCategory::Hardware,
                    format_args!("Discarding frame with bad header: {e}"),
                );
                log::debug!("Discarding frame {} with bad header: {}", sequence, e);
                return Ok(None);
            }
        };

        self.debug.message(
            DebugCategory::FrameHeaders,
            format_args!(
                "frame {}: v{} {:?} {} lines, {} header bytes, offset {}",
                header.hw_sequence,
                header.version,
                header.format,
                header.lines,
                header.header_size,
                header.offset
            ),
        );

        let geometry =
            match compute_geometry(&self.params, header.format, header.header_size, header.lines) {
                Ok(geometry) => geometry,
                Err(e) => {
                    log::warn!("Discarding frame {}: {}", header.hw_sequence, e);
                    return Ok(None);
                }
            };

        self.writer.begin_frame(FrameInfo {
            hw_sequence: header.hw_sequence,
            offset: header.offset,
            timestamp: Some(SystemTime::now()),
            expected_size: geometry.raw_size,
            geometry: Some(geometry),
            ..FrameInfo::default()
        })?;
        self.active = Some(ActiveFrame {
            geometry,
            filled: 0,
        });
        Ok(Some(start))
    }

    /// Appends `buf` to the active frame.
    ///
    /// Returns `None` while the frame is incomplete. Once it is complete,
    /// returns the offset of trailing data belonging to the next frame, if
    /// any.
    fn accumulate(&mut self, buf: &[u8]) -> Result<Option<Option<usize>>> {
        let Some(frame) = self.active.as_ref() else {
            return Ok(None);
        };
        let expected = frame.geometry.raw_size;
        let filled = frame.filled;
        let remaining = expected.saturating_sub(filled);

        let mut chunk = buf;
        let mut extra = None;
        let mut eof = false;

        if self.quirks.incomplete_packets {
            let from = if filled == 0 {
                frame.geometry.header_size
            } else {
                0
            };
            if let Some(pos) = find_magic(buf, from).filter(|&pos| pos < remaining) {
                log::debug!(
                    "Next frame magic after {} of {} bytes, closing frame {} early",
                    filled + pos,
                    expected,
                    self.writer.sequence()
                );
                chunk = &buf[..pos];
                extra = Some(pos);
                eof = true;
            }
        }

        if !eof && self.quirks.multiframe_packets && buf.len() > remaining {
            if let Some(pos) = find_magic(buf, remaining) {
                extra = Some(pos);
                eof = true;
            }
            chunk = &buf[..remaining];
            if self.debug.enabled(DebugCategory::RawPackets) {
                self.debug.dump(
                    DebugCategory::RawPackets,
                    &format!("frame{:4}/frame{:9}.partial", self.writer.sequence(), self.packet_id),
                    chunk,
                );
            }
        }

        if self.store_data {
            let available = self.writer.padded_size();
            if filled + chunk.len() > available {
                log::error!(
                    "Unexpected frame data, expecting at most {} bytes but {} already read",
                    available,
                    filled + chunk.len()
                );
                return Err(AcquisitionError::TooBig {
                    required: filled + chunk.len(),
                    available,
                });
            }

            // Checked on the chunk already cut to the frame's remaining bytes:
            // a repeated run there still shortens this frame, and the data
            // after the cut is left to the next frame as before.
            if self.quirks.repeating_data && chunk.len() > REPEAT_RUN && filled > REPEAT_RUN {
                let mut previous = [0u8; REPEAT_RUN];
                self.writer.read_back(filled - REPEAT_RUN, &mut previous);
                if previous == chunk[..REPEAT_RUN] {
                    log::warn!(
                        "Skipping repeating bytes at offset {} of frame {}",
                        filled,
                        self.writer.sequence()
                    );
                    chunk = &chunk[REPEAT_RUN..];
                }
            }

            if !chunk.is_empty() {
                self.writer.write(filled, chunk)?;
            }
        }

        let filled = filled + chunk.len();
        if let Some(frame) = self.active.as_mut() {
            frame.filled = filled;
        }
        if filled >= expected {
            eof = true;
        }

        self.notify(RawDataEvent {
            sequence: self.writer.sequence(),
            eof,
            padding: false,
            data: chunk,
        });

        Ok(eof.then_some(extra))
    }

    /// Publishes the active frame. Returns whether the reader should stop.
    fn complete_frame(&mut self) -> Result<bool> {
        let Some(frame) = self.active.take() else {
            return Ok(false);
        };
        let expected = frame.geometry.raw_size;
        let broken = frame.filled < expected;
        let sequence = self.writer.sequence();

        if broken {
            self.debug.message(
                DebugCategory::BrokenFrames,
                format_args!(
                    "Frame {} is broken: {} of {} bytes received",
                    sequence, frame.filled, expected
                ),
            );
        }
        if self.store_data
            && (self.debug.enabled(DebugCategory::RawFrames)
                || (broken && self.debug.enabled(DebugCategory::BrokenFrames)))
        {
            let mut raw = vec![0u8; frame.filled.min(self.writer.padded_size())];
            self.writer.read_back(0, &mut raw);
            let category = if broken {
                DebugCategory::BrokenFrames
            } else {
                DebugCategory::RawFrames
            };
            self.debug
                .dump(category, &format!("frame{sequence:9}.raw"), &raw);
        }

        let produced = self.writer.finish(frame.filled, expected, broken)?;
        log::trace!("Frame {} complete, {} bytes", produced, frame.filled);

        if self.autostop.should_stop(produced) {
            log::info!("Autostop reached after frame {}", produced);
            return Ok(true);
        }
        Ok(false)
    }

    fn notify(&mut self, event: RawDataEvent<'_>) {
        if let Some(observer) = self.observer.as_mut() {
            if !observer(&event) {
                self.observer_stop = true;
            }
        }
    }
}
