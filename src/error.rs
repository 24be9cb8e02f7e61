//! Error taxonomy shared by the acquisition core.
//!
//! Per-packet anomalies never surface here; the reassembly engine logs and
//! discards them. These variants describe what a caller of the acquisition
//! API, the reader thread or a decode worker can observe.

use thiserror::Error;

/// Errors that can occur during frame acquisition.
#[derive(Error, Debug)]
pub enum AcquisitionError {
    /// The acquisition context has not been set up or was torn down.
    #[error("acquisition is not initialized")]
    NotInitialized,

    /// Frame access or control that needs a started acquisition.
    #[error("acquisition is not started")]
    NotStarted,

    /// The request is not valid in the current state (double start, bad buffer size).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The hardware reports a mode the core cannot work with.
    #[error("invalid hardware state: {0}")]
    InvalidState(String),

    /// Ring buffer or worker context allocation failed.
    #[error("memory allocation failed: {0}")]
    MemoryAllocation(String),

    /// The camera or the event stream is in use.
    #[error("resource is busy")]
    Busy,

    /// Nothing arrived before the deadline.
    #[error("operation timed out")]
    Timeout,

    /// The requested sequence is no longer held by the ring.
    #[error("frame {0} has been overwritten")]
    Overwritten(u64),

    /// The frame is broken or could not be decoded.
    #[error("invalid frame data: {0}")]
    InvalidData(String),

    /// Data does not fit into the available space.
    #[error("data too big: {required} bytes required, {available} available")]
    TooBig {
        /// Bytes the operation needs.
        required: usize,
        /// Bytes that were available.
        available: usize,
    },

    /// The data kind or frame format is not implemented.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Generic failure, e.g. a thread could not be spawned.
    #[error("operation failed: {0}")]
    Failed(String),

    /// Failed to acquire lock on internal state.
    #[error("failed to acquire lock: {0}")]
    LockError(String),

    /// A register read or write failed.
    #[error("register access failed: {0}")]
    Register(String),

    /// The DMA transport reported a hard error.
    #[error("transport error: {0}")]
    Transport(String),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for acquisition operations.
pub type Result<T> = std::result::Result<T, AcquisitionError>;

impl AcquisitionError {
    /// Builds a [`AcquisitionError::LockError`] from any poisoned lock.
    pub(crate) fn lock<E: std::fmt::Display>(e: E) -> Self {
        AcquisitionError::LockError(e.to_string())
    }

    /// Whether the caller may simply retry with the next sequence.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AcquisitionError::Overwritten(_)
                | AcquisitionError::InvalidData(_)
                | AcquisitionError::Timeout
        )
    }
}
