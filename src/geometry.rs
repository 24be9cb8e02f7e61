//! Frame geometry
//!
//! Computes how many bytes a frame occupies in the DMA stream for a given
//! sensor format, header length and line count. The transport delivers whole
//! packets, so the stream size is rounded up to the packet size; everything
//! past `raw_size` is padding.

use serde::{Deserialize, Serialize};

use crate::error::{AcquisitionError, Result};

/// Size of one header block.
pub const FRAME_HEADER_SIZE: usize = 32;

/// Size of the frame trailer.
pub const FRAME_TAIL_SIZE: usize = 32;

/// Bytes the sensor never transmits at the start of each frame.
pub const MISSING_PAYLOAD_SIZE: usize = 32;

/// Maximum number of lines a frame can carry.
pub const MAX_LINES: usize = 2048;

/// Number of sensor output channels at full readout.
pub const MAX_CHANNELS: usize = 16;

/// Pixels per channel on the first sensor generation.
pub const PIXELS_PER_CHANNEL: usize = 128;

/// Image width in pixels.
pub const WIDTH: usize = MAX_CHANNELS * PIXELS_PER_CHANNEL;

/// Pixels per channel on the second sensor generation.
pub const CMOSIS20_PIXELS_PER_CHANNEL: usize = 320;

/// Sensor data layout, selected per frame from the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorFormat {
    /// First generation CMOSIS readout.
    Cmosis,
    /// Second generation CMOSIS readout (half-width line words).
    Cmosis20,
    /// Format code the core does not know how to handle.
    Unknown(u8),
}

impl SensorFormat {
    /// Maps a header format code to a format.
    #[must_use]
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Cmosis,
            1 => Self::Cmosis20,
            other => Self::Unknown(other),
        }
    }

    /// Number of output channels at full readout.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::NotSupported` for unknown formats.
    pub fn max_channels(self) -> Result<usize> {
        match self {
            Self::Cmosis | Self::Cmosis20 => Ok(MAX_CHANNELS),
            Self::Unknown(code) => Err(unsupported(code)),
        }
    }

    /// Pixels read out by a single channel.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::NotSupported` for unknown formats.
    pub fn pixels_per_channel(self) -> Result<usize> {
        match self {
            Self::Cmosis => Ok(PIXELS_PER_CHANNEL),
            Self::Cmosis20 => Ok(CMOSIS20_PIXELS_PER_CHANNEL),
            Self::Unknown(code) => Err(unsupported(code)),
        }
    }

    /// Bytes one line occupies on one output, including its line header.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::NotSupported` for unknown formats.
    pub fn line_size(self) -> Result<usize> {
        match self {
            Self::Cmosis => Ok((1 + PIXELS_PER_CHANNEL) * 32),
            Self::Cmosis20 => Ok((1 + CMOSIS20_PIXELS_PER_CHANNEL) * 32 / 2),
            Self::Unknown(code) => Err(unsupported(code)),
        }
    }
}

fn unsupported(code: u8) -> AcquisitionError {
    AcquisitionError::NotSupported(format!("frame format {code}"))
}

/// Per-context constants that feed into every geometry computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryParams {
    /// Number of active sensor outputs (4 or 16).
    pub outputs: usize,
    /// Transport packet size.
    pub packet_size: usize,
    /// Whether the first payload block is missing from every frame.
    pub missing_payload: bool,
}

/// Byte layout of one frame in the DMA stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    /// Sensor format the frame was computed for.
    pub format: SensorFormat,
    /// Number of lines.
    pub lines: usize,
    /// Active sensor outputs the frame was read out with.
    pub outputs: usize,
    /// Whether the first payload block is absent from the frame.
    pub missing_payload: bool,
    /// Total header length in bytes.
    pub header_size: usize,
    /// Trailer length in bytes.
    pub footer_size: usize,
    /// Meaningful bytes of the frame.
    pub raw_size: usize,
    /// `raw_size` rounded up to whole packets.
    pub padded_size: usize,
}

/// Computes raw and padded frame sizes.
///
/// Pure function of its inputs.
///
/// # Errors
///
/// Returns `AcquisitionError::NotSupported` for unknown formats and
/// `AcquisitionError::InvalidState` if the output count does not divide the
/// channel count.
pub fn compute_geometry(
    params: &GeometryParams,
    format: SensorFormat,
    header_size: usize,
    lines: usize,
) -> Result<FrameGeometry> {
    let max_channels = format.max_channels()?;
    let line_size = format.line_size()?;

    if params.outputs == 0 || max_channels % params.outputs != 0 {
        return Err(AcquisitionError::InvalidState(format!(
            "{} active outputs do not divide {} channels",
            params.outputs, max_channels
        )));
    }

    let mut raw_size = lines * line_size * (max_channels / params.outputs)
        + header_size
        + FRAME_TAIL_SIZE;
    if params.missing_payload {
        raw_size = raw_size.saturating_sub(MISSING_PAYLOAD_SIZE);
    }

    Ok(FrameGeometry {
        format,
        lines,
        outputs: params.outputs,
        missing_payload: params.missing_payload,
        header_size,
        footer_size: FRAME_TAIL_SIZE,
        raw_size,
        padded_size: pad_to_packets(raw_size, params.packet_size),
    })
}

/// Rounds `size` up to a multiple of `packet_size`.
#[must_use]
pub fn pad_to_packets(size: usize, packet_size: usize) -> usize {
    if packet_size == 0 {
        return size;
    }
    size.div_ceil(packet_size) * packet_size
}
