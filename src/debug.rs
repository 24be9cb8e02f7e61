//! Category-gated debug messages and buffer dumps
//!
//! Messages go through `log` under a per-category target, so they can also be
//! filtered with `RUST_LOG` (e.g. `RUST_LOG=streamcam::debug::hardware=debug`).
//! Buffer dumps are written below the configured dump directory; failing to
//! write one is logged and otherwise ignored.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::DebugCategories;

/// One debug category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebugCategory {
    /// Complete raw frames
    RawFrames,
    /// Frames closed short or failing to decode
    BrokenFrames,
    /// Individual DMA packets
    RawPackets,
    /// Hardware anomalies
    Hardware,
    /// Parsed frame headers
    FrameHeaders,
    /// Consumer API calls
    Api,
}

impl DebugCategory {
    /// `log` target used for this category.
    #[must_use]
    pub fn target(self) -> &'static str {
        match self {
            Self::RawFrames => "streamcam::debug::raw_frames",
            Self::BrokenFrames => "streamcam::debug::broken_frames",
            Self::RawPackets => "streamcam::debug::raw_packets",
            Self::Hardware => "streamcam::debug::hardware",
            Self::FrameHeaders => "streamcam::debug::frame_headers",
            Self::Api => "streamcam::debug::api",
        }
    }
}

/// Fire-and-forget sink for debug output.
#[derive(Debug, Clone, Default)]
pub struct DebugSink {
    categories: DebugCategories,
    dump_dir: Option<PathBuf>,
}

impl DebugSink {
    /// Creates a sink for the given categories.
    pub fn new(categories: DebugCategories, dump_dir: Option<PathBuf>) -> Self {
        Self {
            categories,
            dump_dir,
        }
    }

    /// Whether a category is enabled.
    #[must_use]
    pub fn enabled(&self, category: DebugCategory) -> bool {
        match category {
            DebugCategory::RawFrames => self.categories.raw_frames,
            DebugCategory::BrokenFrames => self.categories.broken_frames,
            DebugCategory::RawPackets => self.categories.raw_packets,
            DebugCategory::Hardware => self.categories.hardware,
            DebugCategory::FrameHeaders => self.categories.frame_headers,
            DebugCategory::Api => self.categories.api,
        }
    }

    /// Directory dumps are written to.
    #[must_use]
    pub fn dump_dir(&self) -> Option<&Path> {
        self.dump_dir.as_deref()
    }

    /// Emits a message if the category is enabled.
    pub fn message(&self, category: DebugCategory, args: fmt::Arguments<'_>) {
        if self.enabled(category) {
            log::debug!(target: category.target(), "{}", args);
        }
    }

    /// Writes `data` to `<dump_dir>/<name>` if the category is enabled.
    ///
    /// Parent directories are created as needed. Returns the written path.
    pub fn dump(&self, category: DebugCategory, name: &str, data: &[u8]) -> Option<PathBuf> {
        if !self.enabled(category) {
            return None;
        }
        let dir = self.dump_dir.as_ref()?;
        let path = dir.join(name);

        let result = path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|()| std::fs::write(&path, data));

        match result {
            Ok(()) => {
                log::trace!(target: category.target(), "Dumped {} bytes to {:?}", data.len(), path);
                Some(path)
            }
            Err(e) => {
                log::warn!("Failed to dump debug buffer to {:?}: {}", path, e);
                None
            }
        }
    }
}
