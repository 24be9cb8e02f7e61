//! Synthetic CMOSIS frame streams
//!
//! Generates byte-exact frames (header blocks, line payloads, trailer) with
//! known pixel values, so that reassembly and decoding can be checked without
//! hardware.
//!
//! # Example
//!
//! ```rust,ignore
//! use streamcam_lib::test_utils::{packetize, FrameGenerator};
//!
//! let gen = FrameGenerator::default();
//! let frames: Vec<Vec<u8>> = (1..=3).map(|seq| gen.padded_frame(seq, 2)).collect();
//! let packets = packetize(&frames.concat(), 4096);
//! ```

use crate::config::DMA_PACKET_LENGTH;
use crate::geometry::{
    compute_geometry, pad_to_packets, FrameGeometry, GeometryParams, SensorFormat,
    FRAME_HEADER_SIZE, MAX_CHANNELS, MISSING_PAYLOAD_SIZE, PIXELS_PER_CHANNEL,
};
use crate::header::FRAME_MAGIC;

/// Last word of every frame trailer.
pub const TAIL_MARKER: u32 = 0x1F00_1001;

/// Builds synthetic frames for one camera configuration.
#[derive(Debug, Clone)]
pub struct FrameGenerator {
    /// Active sensor outputs (4 or 16).
    pub outputs: usize,
    /// DMA packet size used for padding.
    pub packet_size: usize,
    /// Leave out the first 32 payload bytes like the hardware does.
    pub missing_payload: bool,
    /// Header layout version (0 or 1).
    pub header_version: u8,
    /// Number of 32-byte header blocks.
    pub header_blocks: usize,
    /// Format code written into v1 headers.
    pub format_code: u8,
}

impl Default for FrameGenerator {
    fn default() -> Self {
        Self {
            outputs: 16,
            packet_size: DMA_PACKET_LENGTH,
            missing_payload: true,
            header_version: 1,
            header_blocks: 1,
            format_code: 0,
        }
    }
}

impl FrameGenerator {
    /// Geometry parameters matching this generator.
    pub fn params(&self) -> GeometryParams {
        GeometryParams {
            outputs: self.outputs,
            packet_size: self.packet_size,
            missing_payload: self.missing_payload,
        }
    }

    /// Geometry of a frame with `lines` lines.
    ///
    /// # Panics
    ///
    /// Panics if the generator describes an impossible configuration.
    pub fn geometry(&self, lines: usize) -> FrameGeometry {
        compute_geometry(
            &self.params(),
            SensorFormat::Cmosis,
            self.header_blocks * FRAME_HEADER_SIZE,
            lines,
        )
        .expect("generator geometry")
    }

    /// Pixel value the generator places at `(line, x)` of frame `hw_sequence`.
    pub fn expected_pixel(hw_sequence: u32, line: usize, x: usize) -> u16 {
        ((hw_sequence as usize * 31 + line * 17 + x) & 0xFFF) as u16
    }

    /// Header blocks announcing `lines` lines.
    pub fn header(&self, hw_sequence: u32, lines: usize) -> Vec<u8> {
        let mut words = Vec::with_capacity(self.header_blocks * 8);
        let version = u32::from(self.header_version & 7) << 1;
        let single = u32::from(self.header_blocks == 1);
        let lines_word = if self.header_version == 0 {
            (lines as u32) & 0x7FF
        } else {
            lines as u32
        };
        words.extend_from_slice(&[
            (FRAME_MAGIC[0] & !0xF) | version | single,
            FRAME_MAGIC[1],
            FRAME_MAGIC[2],
            0,
            0,
            lines_word,
            (u32::from(self.format_code & 0xF) << 24) | (hw_sequence & 0x00FF_FFFF),
            3,
        ]);
        for block in 1..self.header_blocks {
            let last = u32::from(block + 1 == self.header_blocks);
            words.push(last);
            words.extend((1..8).map(|i| 0xB000_0000 | (block as u32) << 8 | i));
        }
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Line payload of `lines` lines, missing payload already removed.
    pub fn payload(&self, hw_sequence: u32, lines: usize) -> Vec<u8> {
        let passes = MAX_CHANNELS / self.outputs;
        let mut out = Vec::with_capacity(lines * passes * (PIXELS_PER_CHANNEL + 1) * 32);
        for line in 0..lines {
            for pass in 0..passes {
                if !(self.missing_payload && line == 0 && pass == 0) {
                    for i in 0..8u32 {
                        let w = 0x8000_0000 | (line as u32) << 8 | (pass as u32) << 4 | i;
                        out.extend_from_slice(&w.to_le_bytes());
                    }
                }
                for s in 0..PIXELS_PER_CHANNEL {
                    for lane in 0..16 {
                        let value = if lane < self.outputs {
                            let channel = pass * self.outputs + lane;
                            Self::expected_pixel(hw_sequence, line, channel * PIXELS_PER_CHANNEL + s)
                        } else {
                            0
                        };
                        out.extend_from_slice(&value.to_le_bytes());
                    }
                }
            }
        }
        out
    }

    /// Frame trailer.
    pub fn tail(&self) -> Vec<u8> {
        let mut words: Vec<u32> = (0..7).map(|i| 0xA0 + i).collect();
        words.push(TAIL_MARKER);
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Complete frame of exactly `raw_size` bytes.
    pub fn frame(&self, hw_sequence: u32, lines: usize) -> Vec<u8> {
        self.frame_with_header(hw_sequence, lines, lines)
    }

    /// Frame whose header announces `header_lines` while `data_lines` are sent.
    pub fn frame_with_header(&self, hw_sequence: u32, header_lines: usize, data_lines: usize) -> Vec<u8> {
        let mut out = self.header(hw_sequence, header_lines);
        out.extend(self.payload(hw_sequence, data_lines));
        out.extend(self.tail());
        debug_assert!(
            !self.missing_payload
                || data_lines != header_lines
                || out.len() == self.geometry(header_lines).raw_size,
            "missing payload of {MISSING_PAYLOAD_SIZE} bytes not accounted for"
        );
        out
    }

    /// Frame zero-padded to whole packets, as the DMA engine delivers it.
    pub fn padded_frame(&self, hw_sequence: u32, lines: usize) -> Vec<u8> {
        let mut out = self.frame(hw_sequence, lines);
        out.resize(pad_to_packets(out.len(), self.packet_size), 0);
        out
    }
}

/// Cuts a byte stream into packets of `packet_size` (the last may be short).
pub fn packetize(stream: &[u8], packet_size: usize) -> Vec<Vec<u8>> {
    stream.chunks(packet_size).map(<[u8]>::to_vec).collect()
}
