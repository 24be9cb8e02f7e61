//! `streamcam` - Frame acquisition core for PCI DMA streaming cameras
//!
//! A reader thread pulls DMA packets from a [`reader::DmaTransport`],
//! reassembles them into frames ([`frame_assembler`]) and stores them in a
//! fixed ring ([`ring`]) without ever waiting for consumers. Decode workers
//! ([`decode`]) turn frames into images in the background, and consumers use
//! [`events::Acquisition`] to receive events and fetch raw data or images.
//!
//! Camera control goes through [`registers::RegisterAccess`]. Packet streams
//! can be recorded ([`capture`]) and replayed offline ([`replay`]).

pub mod capture;
pub mod config;
pub mod debug;
pub mod decode;
pub mod error;
pub mod events;
pub mod frame_assembler;
pub mod geometry;
pub mod header;
pub mod reader;
pub mod registers;
pub mod replay;
pub mod ring;
pub mod test_utils;

pub use config::{AcquisitionConfig, AutostopPolicy, QuirkSet};
pub use decode::{CmosisDecoder, FrameDecoder};
pub use error::{AcquisitionError, Result};
pub use events::{Acquisition, DataKind, FrameData, ImageGuard, Wait};
pub use reader::DmaTransport;
pub use registers::{RegisterAccess, RegisterFile};
pub use ring::{AcquisitionStats, FrameInfo, ImageDimensions};

/// Initializes logging for binaries and examples.
///
/// Honors `RUST_LOG`, defaulting to `info`. Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
