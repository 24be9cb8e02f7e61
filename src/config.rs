//! Acquisition configuration
//!
//! Runtime settings for the acquisition core. Defaults match the behaviour of
//! the camera firmware in the field; everything can be overridden from the
//! environment or a JSON file.
//!
//! Environment variables:
//! - `STREAMCAM_BUFFER_SIZE` - ring capacity (power of two, at least 2)
//! - `STREAMCAM_MAX_THREADS` - upper bound for decode workers
//! - `STREAMCAM_QUIRKS` - `+name`/`-name` tokens toggling hardware workarounds
//! - `STREAMCAM_DEBUG` - comma separated debug categories (`all`, `none`)
//! - `STREAMCAM_DEBUG_DIR` - directory for debug buffer dumps

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{AcquisitionError, Result};
use crate::geometry::MAX_LINES;

/// Default number of frame slots in the ring.
pub const DEFAULT_BUFFER_SIZE: usize = 64;

/// Slots kept free between the producer and any lagging counter.
pub const RESERVE_BUFFERS: usize = 2;

/// Size of a single DMA packet delivered by the transport.
pub const DMA_PACKET_LENGTH: usize = 4096;

/// Sleep between polls when no frame is available.
pub const NOFRAME_SLEEP: Duration = Duration::from_micros(100);

/// Default bound for a single transport streaming call.
pub const DMA_TIMEOUT_MS: u64 = 50;

/// Default wait for a slot's image lock before an inline decode gives up.
pub const IMAGE_LOCK_TIMEOUT_MS: u64 = 1000;

/// Hardware bug workarounds, checked at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuirkSet {
    /// The first 32-byte payload of every frame is never transmitted.
    pub missing_payload: bool,
    /// A new frame starts right after the previous one inside the same packet.
    pub multiframe_packets: bool,
    /// Frame headers may be split across two packets.
    pub multiframe_headers: bool,
    /// Close a frame early when the next magic shows up before the expected size.
    pub incomplete_packets: bool,
    /// Drop a 16-byte run that repeats the previously written 16 bytes.
    pub repeating_data: bool,
    /// Recover the camera when it stays busy across reader timeouts.
    pub stuck_busy: bool,
    /// Frames may sit in camera memory, size the ring for `max_frames`.
    pub postponed_read: bool,
}

impl Default for QuirkSet {
    fn default() -> Self {
        Self {
            missing_payload: true,
            multiframe_packets: true,
            multiframe_headers: true,
            incomplete_packets: true,
            repeating_data: false,
            stuck_busy: false,
            postponed_read: true,
        }
    }
}

impl QuirkSet {
    /// No workarounds enabled.
    #[must_use]
    pub fn none() -> Self {
        Self {
            missing_payload: false,
            multiframe_packets: false,
            multiframe_headers: false,
            incomplete_packets: false,
            repeating_data: false,
            stuck_busy: false,
            postponed_read: false,
        }
    }

    fn flag_mut(&mut self, name: &str) -> Option<&mut bool> {
        match name {
            "missing_payload" => Some(&mut self.missing_payload),
            "multiframe_packets" => Some(&mut self.multiframe_packets),
            "multiframe_headers" => Some(&mut self.multiframe_headers),
            "incomplete_packets" => Some(&mut self.incomplete_packets),
            "repeating_data" => Some(&mut self.repeating_data),
            "stuck_busy" => Some(&mut self.stuck_busy),
            "postponed_read" => Some(&mut self.postponed_read),
            _ => None,
        }
    }

    /// Parse from environment variable string
    ///
    /// Tokens are separated by commas or whitespace. `+name` or `name`
    /// enables a workaround, `-name` disables it. Unknown names are ignored
    /// with a warning.
    pub fn from_env_str(s: &str) -> Self {
        let mut quirks = Self::default();
        for token in s
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
        {
            let (enable, name) = match token.strip_prefix('-') {
                Some(rest) => (false, rest),
                None => (true, token.strip_prefix('+').unwrap_or(token)),
            };
            match quirks.flag_mut(&name.to_lowercase()) {
                Some(flag) => *flag = enable,
                None => log::warn!("Unknown quirk '{}', ignoring", name),
            }
        }
        quirks
    }
}

/// Debug categories routed to the debug sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugCategories {
    /// Raw frames handed to the decoder
    pub raw_frames: bool,
    /// Frames that failed to decode
    pub broken_frames: bool,
    /// Every DMA packet
    pub raw_packets: bool,
    /// Hardware anomalies (missing magic, skips, stuck camera)
    pub hardware: bool,
    /// Parsed frame headers
    pub frame_headers: bool,
    /// Consumer API calls
    pub api: bool,
}

impl DebugCategories {
    /// Every category enabled.
    #[must_use]
    pub fn all() -> Self {
        Self {
            raw_frames: true,
            broken_frames: true,
            raw_packets: true,
            hardware: true,
            frame_headers: true,
            api: true,
        }
    }

    /// Parse from environment variable string
    pub fn from_env_str(s: &str) -> Self {
        let mut categories = Self::default();
        for token in s
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
        {
            match token.to_lowercase().as_str() {
                "all" => categories = Self::all(),
                "none" | "off" => categories = Self::default(),
                "raw_frames" => categories.raw_frames = true,
                "broken_frames" => categories.broken_frames = true,
                "raw_packets" => categories.raw_packets = true,
                "hardware" => categories.hardware = true,
                "frame_headers" => categories.frame_headers = true,
                "api" => categories.api = true,
                other => log::warn!("Unknown debug category '{}', ignoring", other),
            }
        }
        categories
    }
}

/// Optional conditions under which the reader stops by itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutostopPolicy {
    /// Stop once this many frames have been produced.
    pub max_events: Option<u64>,
    /// Stop once this much time has passed since start (milliseconds).
    pub duration_ms: Option<u64>,
}

impl AutostopPolicy {
    /// Fixes the deadline relative to `now`.
    #[must_use]
    pub fn arm(&self, now: Instant) -> ArmedAutostop {
        ArmedAutostop {
            max_events: self.max_events.filter(|&n| n > 0),
            deadline: self
                .duration_ms
                .filter(|&ms| ms > 0)
                .map(|ms| now + Duration::from_millis(ms)),
        }
    }
}

/// Autostop policy bound to a concrete start time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArmedAutostop {
    /// Sequence number that triggers the stop.
    pub max_events: Option<u64>,
    /// Wall-clock deadline.
    pub deadline: Option<Instant>,
}

impl ArmedAutostop {
    /// Whether the deadline has passed.
    #[must_use]
    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Whether the reader should stop after producing `produced` frames.
    #[must_use]
    pub fn should_stop(&self, produced: u64) -> bool {
        self.max_events.is_some_and(|max| produced >= max) || self.deadline_passed()
    }
}

/// Settings for one acquisition context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Number of frame slots in the ring (power of two).
    pub buffer_size: usize,
    /// Upper bound for decode workers, 0 means no bound.
    pub max_threads: usize,
    /// Decode frames on background workers.
    pub preprocess: bool,
    /// Only feed the raw data observer, keep nothing in the ring.
    pub raw_data_only: bool,
    /// Announce events only once their image is decoded.
    pub announce_ready: bool,
    /// Transport packet size in bytes.
    pub packet_size: usize,
    /// Timeout of a single transport streaming call.
    pub dma_timeout_ms: u64,
    /// Conditions that stop the reader automatically.
    pub autostop: AutostopPolicy,
    /// Enabled hardware workarounds.
    pub quirks: QuirkSet,
    /// Enabled debug categories.
    pub debug: DebugCategories,
    /// Where debug buffers are dumped, if anywhere.
    pub debug_dir: Option<PathBuf>,
    /// Try to run the reader thread with real-time priority.
    pub realtime_priority: bool,
    /// Settle time between reset register writes (milliseconds).
    pub reset_settle_ms: u64,
    /// Largest frame, in lines, the ring is sized for.
    pub max_lines: usize,
    /// How long `get` waits for a slot's image lock before reporting `Busy`.
    pub image_lock_timeout_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_threads: 0,
            preprocess: true,
            raw_data_only: false,
            announce_ready: false,
            packet_size: DMA_PACKET_LENGTH,
            dma_timeout_ms: DMA_TIMEOUT_MS,
            autostop: AutostopPolicy::default(),
            quirks: QuirkSet::default(),
            debug: DebugCategories::default(),
            debug_dir: None,
            realtime_priority: true,
            reset_settle_ms: 250,
            max_lines: MAX_LINES,
            image_lock_timeout_ms: IMAGE_LOCK_TIMEOUT_MS,
        }
    }
}

impl AcquisitionConfig {
    /// Defaults overlaid with the `STREAMCAM_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from an arbitrary lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("STREAMCAM_BUFFER_SIZE") {
            match value.trim().parse::<usize>() {
                Ok(size) if validate_buffer_size(size).is_ok() => config.buffer_size = size,
                _ => log::warn!(
                    "Invalid STREAMCAM_BUFFER_SIZE '{}', keeping {}",
                    value,
                    config.buffer_size
                ),
            }
        }

        if let Some(value) = lookup("STREAMCAM_MAX_THREADS") {
            match value.trim().parse::<usize>() {
                Ok(n) => config.max_threads = n,
                Err(_) => log::warn!("Invalid STREAMCAM_MAX_THREADS '{}', ignoring", value),
            }
        }

        if let Some(value) = lookup("STREAMCAM_QUIRKS") {
            config.quirks = QuirkSet::from_env_str(&value);
        }

        if let Some(value) = lookup("STREAMCAM_DEBUG") {
            config.debug = DebugCategories::from_env_str(&value);
        }

        if let Some(value) = lookup("STREAMCAM_DEBUG_DIR") {
            if !value.is_empty() {
                config.debug_dir = Some(PathBuf::from(value));
            }
        }

        config
    }

    /// Loads a configuration from a JSON file. Missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::Io` if the file cannot be read and
    /// `AcquisitionError::InvalidRequest` if it is not valid JSON.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| AcquisitionError::InvalidRequest(format!("bad config: {e}")))?;
        validate_buffer_size(config.buffer_size)?;
        if config.max_lines == 0 || config.max_lines > MAX_LINES {
            return Err(AcquisitionError::InvalidRequest(format!(
                "max_lines must be within 1..={MAX_LINES}"
            )));
        }
        Ok(config)
    }

    /// Timeout of a single transport call.
    #[must_use]
    pub fn dma_timeout(&self) -> Duration {
        Duration::from_millis(self.dma_timeout_ms)
    }

    /// Bound for taking a slot's image lock on the consumer side.
    #[must_use]
    pub fn image_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.image_lock_timeout_ms)
    }
}

/// Checks that a ring capacity is usable.
///
/// # Errors
///
/// Returns `AcquisitionError::InvalidRequest` if `size` is below 2 or not a
/// power of two.
pub fn validate_buffer_size(size: usize) -> Result<()> {
    if size < 2 {
        return Err(AcquisitionError::InvalidRequest(format!(
            "buffer size {size} is too small"
        )));
    }
    if !size.is_power_of_two() {
        return Err(AcquisitionError::InvalidRequest(format!(
            "buffer size {size} is not a power of 2"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    // =========================================================================
    // QuirkSet
    // =========================================================================

    #[test]
    fn test_quirk_defaults() {
        let q = QuirkSet::default();
        assert!(q.missing_payload);
        assert!(q.multiframe_packets);
        assert!(q.multiframe_headers);
        assert!(q.incomplete_packets);
        assert!(!q.repeating_data);
    }

    #[test]
    fn test_quirks_from_env_str() {
        let q = QuirkSet::from_env_str("+repeating_data,-missing_payload -incomplete_packets");
        assert!(q.repeating_data);
        assert!(!q.missing_payload);
        assert!(!q.incomplete_packets);
        assert!(q.multiframe_packets);
    }

    #[test]
    fn test_quirks_unknown_ignored() {
        assert_eq!(QuirkSet::from_env_str("bogus"), QuirkSet::default());
    }

    // =========================================================================
    // DebugCategories
    // =========================================================================

    #[test]
    fn test_debug_categories_from_env_str() {
        let d = DebugCategories::from_env_str("hardware,frame_headers");
        assert!(d.hardware);
        assert!(d.frame_headers);
        assert!(!d.raw_packets);
        assert_eq!(DebugCategories::from_env_str("ALL"), DebugCategories::all());
        assert_eq!(
            DebugCategories::from_env_str("all,none"),
            DebugCategories::default()
        );
    }

    // =========================================================================
    // Autostop
    // =========================================================================

    #[test]
    fn test_autostop_max_events() {
        let armed = AutostopPolicy {
            max_events: Some(5),
            duration_ms: None,
        }
        .arm(Instant::now());
        assert!(!armed.should_stop(4));
        assert!(armed.should_stop(5));
    }

    #[test]
    fn test_autostop_zero_means_disabled() {
        let armed = AutostopPolicy {
            max_events: Some(0),
            duration_ms: Some(0),
        }
        .arm(Instant::now());
        assert_eq!(armed, ArmedAutostop::default());
        assert!(!armed.should_stop(1_000_000));
    }

    #[test]
    fn test_autostop_deadline() {
        let armed = AutostopPolicy {
            max_events: None,
            duration_ms: Some(1),
        }
        .arm(Instant::now() - Duration::from_millis(10));
        assert!(armed.deadline_passed());
        assert!(armed.should_stop(0));
    }

    // =========================================================================
    // AcquisitionConfig
    // =========================================================================

    #[test]
    fn test_validate_buffer_size() {
        assert!(validate_buffer_size(0).is_err());
        assert!(validate_buffer_size(1).is_err());
        assert!(validate_buffer_size(2).is_ok());
        assert!(validate_buffer_size(12).is_err());
        assert!(validate_buffer_size(64).is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("STREAMCAM_BUFFER_SIZE", "16"),
            ("STREAMCAM_MAX_THREADS", "3"),
            ("STREAMCAM_DEBUG", "api"),
            ("STREAMCAM_DEBUG_DIR", "/tmp/frames"),
        ]
        .into_iter()
        .collect();
        let config = AcquisitionConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.buffer_size, 16);
        assert_eq!(config.max_threads, 3);
        assert!(config.debug.api);
        assert_eq!(config.debug_dir, Some(PathBuf::from("/tmp/frames")));
    }

    #[test]
    fn test_from_lookup_invalid_buffer_size_keeps_default() {
        let config = AcquisitionConfig::from_lookup(|k| {
            (k == "STREAMCAM_BUFFER_SIZE").then(|| "10".to_string())
        });
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn test_json_round_trip_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"buffer_size": 8, "quirks": {"repeating_data": true}}"#)
            .unwrap();

        let config = AcquisitionConfig::from_json_file(&path).unwrap();
        assert_eq!(config.buffer_size, 8);
        assert!(config.quirks.repeating_data);
        assert!(config.quirks.missing_payload);
        assert_eq!(config.packet_size, DMA_PACKET_LENGTH);
    }

    #[test]
    fn test_json_rejects_bad_buffer_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"buffer_size": 3}"#).unwrap();
        assert!(matches!(
            AcquisitionConfig::from_json_file(&path),
            Err(AcquisitionError::InvalidRequest(_))
        ));
    }
}
