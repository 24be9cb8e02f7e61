//! DMA reader thread
//!
//! Owns the single producer of the ring. The thread repeatedly hands the
//! frame assembler to the transport's streaming call and deals with what
//! comes back:
//!
//! - stop requested by the assembler (autostop, observer): exit
//! - timeout: close a partial frame, check the autostop deadline, optionally
//!   recover a stuck camera, sleep briefly and retry
//! - any other transport error: log and exit, leaving acquisition stalled
//!
//! The shared `running` flag is cleared when the thread exits, whatever the
//! reason, so consumers blocked in `next_event` or `stream` notice. The
//! transport always comes back to the caller: from [`ReaderThread::join`],
//! including after a panic in the read loop, or inside [`SpawnFailure`] when
//! no thread could be started.

use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::NOFRAME_SLEEP;
use crate::error::{AcquisitionError, Result};
use crate::frame_assembler::{FrameAssembler, RawDataObserver, StreamRequest};
use crate::registers::{recover_stuck_busy, RegisterAccess};

/// Per-packet callback handed to a transport.
pub type PacketCallback<'a> = dyn FnMut(&[u8]) -> Result<StreamRequest> + 'a;

/// Source of DMA packets.
///
/// Engine management defaults to no-ops for transports without one.
pub trait DmaTransport: Send {
    /// Prepares the engine for streaming.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::Transport` if the engine cannot be started.
    fn start_engine(&mut self) -> Result<()> {
        Ok(())
    }

    /// Shuts the engine down.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::Transport` if the engine reports a failure.
    fn stop_engine(&mut self) -> Result<()> {
        Ok(())
    }

    /// Delivers packets to `callback` until it returns [`StreamRequest::Stop`].
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::Timeout` if no packet arrived within
    /// `timeout`, a callback error unchanged, or a transport error.
    fn stream(&mut self, timeout: Duration, callback: &mut PacketCallback<'_>) -> Result<()>;
}

/// Reader thread settings.
#[derive(Debug, Clone, Copy)]
pub struct ReaderSettings {
    /// Bound of a single streaming call.
    pub timeout: Duration,
    /// Try to raise the thread to real-time priority.
    pub realtime_priority: bool,
    /// Try to recover a camera stuck in busy state on timeouts.
    pub recover_stuck_busy: bool,
}

/// What a finished reader thread hands back.
pub struct ReaderExit {
    /// The transport, for engine shutdown and reuse.
    pub transport: Box<dyn DmaTransport>,
    /// The raw data observer, for reinstallation.
    pub observer: Option<RawDataObserver>,
    /// The error that ended the thread, if any.
    pub error: Option<AcquisitionError>,
    /// Packets processed.
    pub packets: u64,
}

/// A reader thread that could not be started, with what it was given.
pub struct SpawnFailure {
    /// Why the thread is not running.
    pub error: AcquisitionError,
    /// The transport, engine still started.
    pub transport: Box<dyn DmaTransport>,
    /// The raw data observer taken back from the assembler.
    pub observer: Option<RawDataObserver>,
}

impl fmt::Debug for SpawnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnFailure")
            .field("error", &self.error)
            .field("observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

/// Body of the reader thread. `None` if it never received its transport.
pub(crate) type ReaderBody = Box<dyn FnOnce() -> Option<ReaderExit> + Send>;

/// Starts the OS thread for a [`ReaderBody`].
pub(crate) type ThreadSpawner = fn(ReaderBody) -> io::Result<JoinHandle<Option<ReaderExit>>>;

/// The default [`ThreadSpawner`].
pub(crate) fn os_thread(body: ReaderBody) -> io::Result<JoinHandle<Option<ReaderExit>>> {
    thread::Builder::new()
        .name("streamcam-reader".into())
        .spawn(body)
}

/// Handle of a running reader thread.
pub struct ReaderThread {
    handle: Option<JoinHandle<Option<ReaderExit>>>,
    running: Arc<AtomicBool>,
}

impl ReaderThread {
    /// Spawns the reader thread. `running` must already be set.
    ///
    /// # Errors
    ///
    /// Returns a [`SpawnFailure`] holding the transport and observer if the
    /// thread cannot be spawned. `running` is cleared in that case.
    pub fn spawn(
        transport: Box<dyn DmaTransport>,
        assembler: FrameAssembler,
        settings: ReaderSettings,
        running: Arc<AtomicBool>,
        registers: Option<Arc<dyn RegisterAccess>>,
    ) -> std::result::Result<Self, SpawnFailure> {
        Self::spawn_with(os_thread, transport, assembler, settings, running, registers)
    }

    /// [`spawn`](Self::spawn) with a custom thread spawner.
    ///
    /// The transport and assembler are only sent to the thread once it runs,
    /// so a failed spawn can return them.
    pub(crate) fn spawn_with(
        spawner: ThreadSpawner,
        transport: Box<dyn DmaTransport>,
        mut assembler: FrameAssembler,
        settings: ReaderSettings,
        running: Arc<AtomicBool>,
        registers: Option<Arc<dyn RegisterAccess>>,
    ) -> std::result::Result<Self, SpawnFailure> {
        let (tx, rx) = mpsc::channel::<(Box<dyn DmaTransport>, FrameAssembler)>();
        let flag = Arc::clone(&running);
        let body: ReaderBody = Box::new(move || {
            let Ok((transport, assembler)) = rx.recv() else {
                flag.store(false, Ordering::Release);
                return None;
            };
            Some(reader_loop(transport, assembler, settings, &flag, registers))
        });

        let handle = match spawner(body) {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Can't spawn reader thread: {}", e);
                running.store(false, Ordering::Release);
                return Err(SpawnFailure {
                    error: AcquisitionError::Failed(format!("spawning reader thread: {e}")),
                    transport,
                    observer: assembler.take_observer(),
                });
            }
        };

        if let Err(mpsc::SendError((transport, mut assembler))) = tx.send((transport, assembler)) {
            // the thread is gone without waiting for its parts
            running.store(false, Ordering::Release);
            if handle.join().is_err() {
                log::error!("Reader thread panicked before start");
            }
            return Err(SpawnFailure {
                error: AcquisitionError::Failed("reader thread exited before start".into()),
                transport,
                observer: assembler.take_observer(),
            });
        }

        Ok(Self {
            handle: Some(handle),
            running,
        })
    }

    /// Asks the thread to stop after its current transport call.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Whether the thread is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the thread and waits for it.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::Failed` if the thread died outside the
    /// read loop. A panic inside the loop is reported in
    /// [`ReaderExit::error`] instead.
    pub fn join(mut self) -> Result<ReaderExit> {
        self.request_stop();
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(Some(exit)) => Ok(exit),
                Ok(None) => Err(AcquisitionError::Failed(
                    "reader thread never received its transport".into(),
                )),
                Err(_) => Err(AcquisitionError::Failed("reader thread panicked".into())),
            },
            None => Err(AcquisitionError::NotInitialized),
        }
    }
}

impl Drop for ReaderThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.request_stop();
            if handle.join().is_err() {
                log::error!("Reader thread panicked");
            }
        }
    }
}

fn reader_loop(
    mut transport: Box<dyn DmaTransport>,
    mut assembler: FrameAssembler,
    settings: ReaderSettings,
    running: &AtomicBool,
    registers: Option<Arc<dyn RegisterAccess>>,
) -> ReaderExit {
    if settings.realtime_priority {
        raise_priority();
    }
    log::debug!("Reader thread started");

    // The transport has to survive a panic so that the engine can be stopped.
    let error = match panic::catch_unwind(AssertUnwindSafe(|| {
        read_until_stopped(
            transport.as_mut(),
            &mut assembler,
            &settings,
            running,
            registers.as_deref(),
        )
    })) {
        Ok(error) => error,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            log::error!("Reader thread panicked: {}", message);
            Some(AcquisitionError::Failed(format!(
                "reader thread panicked: {message}"
            )))
        }
    };

    running.store(false, Ordering::Release);

    if assembler.partial_bytes() > 0 {
        log::info!(
            "Partially read frame after stop signal, {} bytes in the buffer",
            assembler.partial_bytes()
        );
    }
    log::debug!(
        "Reader thread finished after {} packets, next frame {}",
        assembler.packets(),
        assembler.current_sequence()
    );

    ReaderExit {
        transport,
        observer: assembler.take_observer(),
        error,
        packets: assembler.packets(),
    }
}

/// Streams until stopped. Returns the error that ended reading, if any.
fn read_until_stopped(
    transport: &mut dyn DmaTransport,
    assembler: &mut FrameAssembler,
    settings: &ReaderSettings,
    running: &AtomicBool,
    registers: Option<&dyn RegisterAccess>,
) -> Option<AcquisitionError> {
    while running.load(Ordering::Acquire) {
        let result = transport.stream(settings.timeout, &mut |packet: &[u8]| {
            let request = assembler.process_packet(packet)?;
            if request != StreamRequest::Stop
                && assembler.partial_bytes() == 0
                && !running.load(Ordering::Acquire)
            {
                return Ok(StreamRequest::Stop);
            }
            Ok(request)
        });

        match result {
            Ok(()) => return None,
            Err(AcquisitionError::Timeout) => {
                match assembler.on_timeout() {
                    Ok(false) => {}
                    Ok(true) => return None,
                    Err(e) => {
                        log::error!("Failed to close frame on timeout: {}", e);
                        return Some(e);
                    }
                }
                if settings.recover_stuck_busy {
                    if let Some(registers) = registers {
                        if let Err(e) = recover_stuck_busy(registers, running) {
                            log::warn!("Stuck busy check failed: {}", e);
                        }
                    }
                }
                thread::sleep(NOFRAME_SLEEP);
            }
            Err(e) => {
                log::error!("DMA error while reading frames: {}", e);
                return Some(e);
            }
        }
    }
    None
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Moves the calling thread to `SCHED_FIFO`, one below the maximum priority.
#[cfg(unix)]
fn raise_priority() {
    // SAFETY: sched_param is plain data, zeroed is a valid value; the calls
    // only affect the current thread and report failure via return codes.
    let rc = unsafe {
        let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
        if max < 0 {
            log::warn!("Can't query real-time priority range, keeping default scheduling");
            return;
        }
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = max - 1;
        libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param)
    };
    if rc != 0 {
        log::warn!(
            "Can't schedule a real-time reader thread ({}), you may consider running as root",
            std::io::Error::from_raw_os_error(rc)
        );
    } else {
        log::debug!("Reader thread runs with real-time priority");
    }
}

#[cfg(not(unix))]
fn raise_priority() {
    log::debug!("Real-time priority not available on this platform");
}
