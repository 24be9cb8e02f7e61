//! Camera control registers
//!
//! The acquisition core reads a handful of named registers at init/start and
//! drives the control register for trigger, reset and stuck-busy recovery.
//! The register transport itself lives behind [`RegisterAccess`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::NOFRAME_SLEEP;
use crate::error::{AcquisitionError, Result};

/// Active output channel mode.
pub const OUTPUT_MODE: &str = "output_mode";
/// Frames the camera can hold in its own memory.
pub const MAX_FRAMES: &str = "max_frames";
/// FPGA control register.
pub const CONTROL: &str = "control";
/// FPGA status register.
pub const STATUS: &str = "status";
/// Second status register, carries the busy bits.
pub const STATUS2: &str = "status2";
/// Firmware revision.
pub const FIRMWARE_VERSION: &str = "firmware_version";

/// The only firmware revision the core knows about.
pub const SUPPORTED_FIRMWARE: u32 = 5;

/// Control value requesting a frame.
pub const FRAME_REQUEST: u32 = 0x8000_0209;
/// Control value of the idle camera.
pub const IDLE: u32 = 0x8000_0201;
/// Control value asserting the sensor reset.
pub const RESET_ASSERT: u32 = 0x1e4;
/// Control value releasing the sensor reset.
pub const RESET_RELEASE: u32 = 0x1e1;
/// `status2` bit set while the camera is busy reading out a frame.
pub const STATUS2_BUSY: u32 = 0x4000_0000;
/// `status2` bits that stay set when the camera hangs in busy state.
pub const STATUS2_STUCK_MASK: u32 = 0x2FFF_FFFF;

/// `output_mode` value for 16 active outputs.
pub const MODE_16_CHANNELS: u32 = 0;
/// `output_mode` value for 4 active outputs.
pub const MODE_4_CHANNELS: u32 = 2;

/// Synchronous access to named camera registers.
pub trait RegisterAccess: Send + Sync {
    /// Reads a register.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::Register` if the read fails.
    fn read(&self, name: &str) -> Result<u32>;

    /// Writes a register.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::Register` if the write fails.
    fn write(&self, name: &str, value: u32) -> Result<()>;
}

/// Maps the `output_mode` register to the number of active outputs.
///
/// # Errors
///
/// Returns `AcquisitionError::InvalidState` for any other mode.
pub fn outputs_from_mode(mode: u32) -> Result<usize> {
    match mode {
        MODE_16_CHANNELS => Ok(16),
        MODE_4_CHANNELS => Ok(4),
        other => Err(AcquisitionError::InvalidState(format!(
            "camera reports invalid output_mode 0x{other:x}"
        ))),
    }
}

/// Brings the camera back to idle after it stayed busy across a timeout.
///
/// Returns `true` if a recovery was attempted. Polls `status2` until the
/// stuck bits clear or `running` drops, then restores the saved control value.
///
/// # Errors
///
/// Propagates register failures.
pub fn recover_stuck_busy(registers: &dyn RegisterAccess, running: &AtomicBool) -> Result<bool> {
    let mut value = registers.read(STATUS2)?;
    if value & STATUS2_STUCK_MASK == 0 {
        return Ok(false);
    }

    log::warn!("Camera stuck in busy (status2 0x{:08x}), trying to recover", value);
    let saved = registers.read(CONTROL)?;
    registers.write(CONTROL, IDLE)?;
    while value & STATUS2_STUCK_MASK != 0 && running.load(Ordering::Acquire) {
        thread::sleep(NOFRAME_SLEEP);
        value = registers.read(STATUS2)?;
    }
    registers.write(CONTROL, saved)?;
    log::info!("Camera busy state cleared");
    Ok(true)
}

/// Waits up to `wait` for the busy bit to clear, polling every `poll`.
///
/// # Errors
///
/// Returns `AcquisitionError::Busy` if the camera stays busy, or a register
/// error.
pub fn wait_not_busy(registers: &dyn RegisterAccess, wait: Duration, poll: Duration) -> Result<()> {
    let deadline = Instant::now() + wait;
    let mut value = registers.read(STATUS2)?;
    while value & STATUS2_BUSY != 0 {
        if Instant::now() >= deadline {
            log::debug!("Camera still busy (status2 0x{:08x})", value);
            return Err(AcquisitionError::Busy);
        }
        thread::sleep(poll);
        value = registers.read(STATUS2)?;
    }
    Ok(())
}

#[derive(Debug, Default)]
struct RegisterState {
    values: HashMap<String, u32>,
    scripted: HashMap<String, VecDeque<u32>>,
    writes: Vec<(String, u32)>,
    failing: Option<String>,
}

/// In-memory register bank.
///
/// Serves reads from fixed values, optionally preceded by a scripted queue
/// per register, and records every write. Used by the replay binary and by
/// tests.
#[derive(Debug, Default)]
pub struct RegisterFile {
    state: Mutex<RegisterState>,
}

impl RegisterFile {
    /// Registers of an idle camera with 16 outputs and firmware 5.
    pub fn new() -> Self {
        let file = Self::default();
        file.set(FIRMWARE_VERSION, SUPPORTED_FIRMWARE);
        file.set(OUTPUT_MODE, MODE_16_CHANNELS);
        file.set(MAX_FRAMES, 0);
        file.set(CONTROL, IDLE);
        file.set(STATUS, 0);
        file.set(STATUS2, 0);
        file
    }

    /// Sets the value a register reads back.
    pub fn set(&self, name: &str, value: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.values.insert(name.to_string(), value);
        }
    }

    /// Queues values returned by the next reads of `name`, before falling
    /// back to its fixed value.
    pub fn script(&self, name: &str, values: &[u32]) {
        if let Ok(mut state) = self.state.lock() {
            state
                .scripted
                .entry(name.to_string())
                .or_default()
                .extend(values);
        }
    }

    /// Makes every access to `name` fail.
    pub fn fail_on(&self, name: Option<&str>) {
        if let Ok(mut state) = self.state.lock() {
            state.failing = name.map(str::to_string);
        }
    }

    /// All writes so far, oldest first.
    pub fn writes(&self) -> Vec<(String, u32)> {
        self.state
            .lock()
            .map(|state| state.writes.clone())
            .unwrap_or_default()
    }

    /// Writes to one register, oldest first.
    pub fn writes_to(&self, name: &str) -> Vec<u32> {
        self.writes()
            .into_iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v)
            .collect()
    }
}

impl RegisterAccess for RegisterFile {
    fn read(&self, name: &str) -> Result<u32> {
        let mut state = self.state.lock().map_err(AcquisitionError::lock)?;
        if state.failing.as_deref() == Some(name) {
            return Err(AcquisitionError::Register(format!("error reading {name}")));
        }
        if let Some(value) = state.scripted.get_mut(name).and_then(VecDeque::pop_front) {
            return Ok(value);
        }
        state
            .values
            .get(name)
            .copied()
            .ok_or_else(|| AcquisitionError::Register(format!("unknown register {name}")))
    }

    fn write(&self, name: &str, value: u32) -> Result<()> {
        let mut state = self.state.lock().map_err(AcquisitionError::lock)?;
        if state.failing.as_deref() == Some(name) {
            return Err(AcquisitionError::Register(format!("error writing {name}")));
        }
        state.writes.push((name.to_string(), value));
        state.values.insert(name.to_string(), value);
        Ok(())
    }
}
