//! Frame magic detection and header parsing
//!
//! Every frame starts with one or more 32-byte header blocks. Words 1 and 2
//! of the first block carry a fixed magic; word 0 carries the flags (bit 0 =
//! last header block, bits 1..3 = header version). All words are little
//! endian.

use thiserror::Error;

use crate::geometry::{SensorFormat, FRAME_HEADER_SIZE};

/// Magic words at the start of every frame header.
pub const FRAME_MAGIC: [u32; 3] = [0x5111_1111, 0x5222_2222, 0x5333_3333];

/// Smallest chunk the transport guarantees to deliver contiguously.
///
/// A header shorter than this cannot even be recognised.
pub const ENTITY_SIZE: usize = 16;

/// Reasons a frame header is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// Fewer bytes than one header block.
    #[error("header truncated: {0} bytes")]
    Truncated(usize),

    /// The magic words do not match.
    #[error("frame magic not found")]
    BadMagic,

    /// Header version 2 and above are not implemented.
    #[error("unsupported header version {0}")]
    UnsupportedVersion(u8),

    /// The header claims an empty frame.
    #[error("header claims 0 lines")]
    ZeroLines,
}

/// Fields extracted from a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Header layout version (0 or 1).
    pub version: u8,
    /// Sensor format announced by the header.
    pub format: SensorFormat,
    /// Number of lines in the frame.
    pub lines: usize,
    /// Sequence number assigned by the camera.
    pub hw_sequence: u32,
    /// Line offset of the readout window.
    pub offset: u32,
    /// Total length of all header blocks.
    pub header_size: usize,
}

/// Reads the little-endian word at word index `idx`.
#[inline]
pub fn word(buf: &[u8], idx: usize) -> u32 {
    let start = idx * 4;
    u32::from_le_bytes([buf[start], buf[start + 1], buf[start + 2], buf[start + 3]])
}

/// Checks whether `buf` starts with the frame magic.
///
/// Word 0 holds flags, so only words 1 and 2 are compared.
#[must_use]
pub fn has_magic(buf: &[u8]) -> bool {
    buf.len() >= 12 && word(buf, 1) == FRAME_MAGIC[1] && word(buf, 2) == FRAME_MAGIC[2]
}

/// Finds the first magic at or after `start`, stepping by words.
///
/// Only positions with at least [`ENTITY_SIZE`] bytes remaining qualify.
#[must_use]
pub fn find_magic(buf: &[u8], start: usize) -> Option<usize> {
    let mut pos = start;
    while pos + ENTITY_SIZE <= buf.len() {
        if has_magic(&buf[pos..]) {
            return Some(pos);
        }
        pos += 4;
    }
    None
}

/// Parses the header blocks at the start of `buf`.
///
/// Additional blocks are consumed while the "last" flag of the current block
/// is clear and the next block still fits into `buf`.
///
/// # Errors
///
/// Returns a [`HeaderError`] describing why the header cannot be used.
pub fn parse_header(buf: &[u8]) -> Result<FrameHeader, HeaderError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(HeaderError::Truncated(buf.len()));
    }
    if !has_magic(buf) {
        return Err(HeaderError::BadMagic);
    }

    let w0 = word(buf, 0);
    let version = ((w0 >> 1) & 7) as u8;
    let w5 = word(buf, 5);
    let w6 = word(buf, 6);
    let w7 = word(buf, 7);

    let (lines, format) = match version {
        0 => ((w5 & 0x7FF) as usize, SensorFormat::Cmosis),
        1 => (
            (w5 & 0xFFFF) as usize,
            SensorFormat::from_code(((w6 >> 24) & 0x0F) as u8),
        ),
        v => return Err(HeaderError::UnsupportedVersion(v)),
    };

    if lines == 0 {
        return Err(HeaderError::ZeroLines);
    }

    let mut last = w0 & 1 != 0;
    let mut size = FRAME_HEADER_SIZE;
    while !last && size + FRAME_HEADER_SIZE <= buf.len() {
        last = word(buf, size / 4) & 1 != 0;
        size += FRAME_HEADER_SIZE;
    }
    if !last {
        log::debug!(
            "Multi-block header not terminated within {} bytes, using {} bytes",
            buf.len(),
            size
        );
    }

    Ok(FrameHeader {
        version,
        format,
        lines,
        hw_sequence: w6 & 0x00FF_FFFF,
        offset: (w7 & 0x00FF_FFFF) * 80,
        header_size: size,
    })
}
