//! Acquisition lifecycle and the consumer-facing event API
//!
//! [`Acquisition`] owns the collaborators (transport, registers, decoder)
//! and, while started, a session: the ring, the reader thread and the
//! decode pool. Consumers may call into it from any number of threads:
//!
//! - [`Acquisition::next_event`] hands out sequences in order, skipping
//!   forward when the consumer lags too far behind the producer
//! - [`Acquisition::stream`] does the same through a callback
//! - [`Acquisition::get`] copies raw data or returns a read guard on the
//!   decoded image, decoding inline when no workers run
//!
//! Everything a consumer gets is re-validated against the slot's sequence
//! tag, so a frame overwritten by the producer shows up as
//! [`AcquisitionError::Overwritten`] instead of mixed data.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{ArcRwLockReadGuard, RawRwLock};

use crate::config::{AcquisitionConfig, NOFRAME_SLEEP, RESERVE_BUFFERS};
use crate::debug::{DebugCategory, DebugSink};
use crate::decode::{decode_inline, worker_count, DecodePool, FrameDecoder};
use crate::error::{AcquisitionError, Result};
use crate::frame_assembler::{FrameAssembler, RawDataObserver};
use crate::geometry::{
    compute_geometry, GeometryParams, SensorFormat, FRAME_HEADER_SIZE, WIDTH,
};
use crate::reader::{os_thread, DmaTransport, ReaderSettings, ReaderThread, ThreadSpawner};
use crate::registers::{
    outputs_from_mode, wait_not_busy, RegisterAccess, CONTROL, FIRMWARE_VERSION, FRAME_REQUEST,
    IDLE, MAX_FRAMES, OUTPUT_MODE, RESET_ASSERT, RESET_RELEASE, SUPPORTED_FIRMWARE,
};
use crate::ring::{AcquisitionStats, DecodedImage, FrameInfo, ImageDimensions, RingBuffer};

/// Minimum distance between two triggers.
const NEXT_TRIGGER_DELAY: Duration = Duration::from_millis(1);

/// How long a trigger waits for the camera to leave the busy state.
const TRIGGER_WAIT_IDLE: Duration = Duration::from_millis(200);

/// Delay between consecutive status register reads.
const READ_STATUS_DELAY: Duration = Duration::from_millis(1);

/// How long a blocking call waits for the next event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Return `Timeout` right away if nothing is pending.
    Immediate,
    /// Wait up to the given duration.
    For(Duration),
    /// Wait until an event arrives or acquisition stops.
    Forever,
}

impl Wait {
    fn deadline(self) -> Option<Instant> {
        match self {
            Wait::Immediate => Some(Instant::now()),
            Wait::For(d) => Some(Instant::now() + d),
            Wait::Forever => None,
        }
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

/// What [`Acquisition::get`] should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    /// The raw frame bytes.
    Raw,
    /// The decoded image.
    Image,
    /// Per-line change mask of the decoded image.
    ChangeMask,
    /// Dimensions of decoded images.
    Dimensions,
    /// A rectangle of the decoded image.
    ImageRegion,
    /// Packed pixel data.
    PackedImage,
    /// A single packed line.
    PackedLine,
    /// Packed payload without headers.
    PackedPayload,
}

/// Read access to a decoded image.
///
/// Holds the slot's shared lock: decoders skip the slot while the guard
/// lives, so consumers should drop it (or call
/// [`Acquisition::return_data`]) as soon as they are done.
pub struct ImageGuard {
    sequence: u64,
    guard: ArcRwLockReadGuard<RawRwLock, DecodedImage>,
}

impl ImageGuard {
    /// Sequence of the frame this image belongs to.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Decoded pixels, row major.
    #[must_use]
    pub fn pixels(&self) -> &[u16] {
        &self.guard.pixels
    }

    /// Change mask, one entry per line.
    #[must_use]
    pub fn change_mask(&self) -> &[u32] {
        &self.guard.change_mask
    }
}

impl Deref for ImageGuard {
    type Target = DecodedImage;

    fn deref(&self) -> &DecodedImage {
        &self.guard
    }
}

impl std::fmt::Debug for ImageGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageGuard")
            .field("sequence", &self.sequence)
            .field("dimensions", &self.guard.dimensions)
            .finish()
    }
}

/// Data returned by [`Acquisition::get`].
#[derive(Debug)]
pub enum FrameData {
    /// Copy of the raw frame.
    Raw(Vec<u8>),
    /// Locked decoded image.
    Image(ImageGuard),
    /// Locked decoded image, for its change mask.
    ChangeMask(ImageGuard),
    /// Size of decoded images.
    Dimensions(ImageDimensions),
}

/// Everything that only exists between `start` and `stop`.
struct Session {
    ring: Arc<RingBuffer>,
    reader: Mutex<Option<ReaderThread>>,
    pool: Mutex<Option<DecodePool>>,
    /// Cleared to stop the reader, and by the reader when it exits.
    running: Arc<AtomicBool>,
    /// Workers decode in the background.
    workers: bool,
    raw_data_only: bool,
    announce_ready: bool,
    image_lock_timeout: Duration,
}

impl Session {
    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Highest sequence that may be announced.
    fn event_target(&self) -> Result<u64> {
        if self.announce_ready && self.workers {
            self.ring.decode_claimed()
        } else {
            Ok(self.ring.produced())
        }
    }

    fn workers_active(&self) -> bool {
        self.workers
            && self
                .pool
                .lock()
                .map(|pool| pool.as_ref().is_some_and(DecodePool::is_running))
                .unwrap_or(false)
    }
}

/// One camera acquisition context.
pub struct Acquisition {
    config: Mutex<AcquisitionConfig>,
    registers: Arc<dyn RegisterAccess>,
    decoder: Arc<dyn FrameDecoder>,
    /// The transport while no reader thread owns it.
    transport: Mutex<Option<Box<dyn DmaTransport>>>,
    /// The raw data observer while no reader thread owns it.
    observer: Mutex<Option<RawDataObserver>>,
    session: RwLock<Option<Arc<Session>>>,
    /// Serializes start and stop.
    lifecycle: Mutex<()>,
    /// Set while a `stream` call runs.
    streaming: AtomicBool,
    next_trigger: Mutex<Instant>,
    firmware: u32,
    debug: DebugSink,
    last_stats: Mutex<AcquisitionStats>,
    reader_spawner: ThreadSpawner,
}

impl Acquisition {
    /// Creates an acquisition context for a camera.
    ///
    /// Checks the firmware version and, with the `postponed_read` quirk,
    /// grows the ring so it can hold every frame the camera may buffer.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::InvalidRequest` for an unusable buffer size
    /// and `AcquisitionError::Register` if a register cannot be read.
    pub fn new(
        mut config: AcquisitionConfig,
        transport: Box<dyn DmaTransport>,
        registers: Arc<dyn RegisterAccess>,
        decoder: Arc<dyn FrameDecoder>,
    ) -> Result<Self> {
        crate::config::validate_buffer_size(config.buffer_size)?;

        let firmware = registers.read(FIRMWARE_VERSION)?;
        if firmware != SUPPORTED_FIRMWARE {
            log::warn!(
                "Unsupported firmware version {}, assuming version {}",
                firmware,
                SUPPORTED_FIRMWARE
            );
        }

        if config.quirks.postponed_read {
            let max_frames = registers.read(MAX_FRAMES)? as usize;
            if max_frames + RESERVE_BUFFERS + 3 > config.buffer_size {
                let grown = max_frames + 1 + RESERVE_BUFFERS + 2;
                log::info!(
                    "Camera buffers up to {} frames, growing ring from {} to {} slots",
                    max_frames,
                    config.buffer_size,
                    grown
                );
                config.buffer_size = grown;
            }
        }

        let debug = DebugSink::new(config.debug, config.debug_dir.clone());
        debug.message(
            DebugCategory::Api,
            format_args!("Initialized, firmware {firmware}, ring of {}", config.buffer_size),
        );

        Ok(Self {
            config: Mutex::new(config),
            registers,
            decoder,
            transport: Mutex::new(Some(transport)),
            observer: Mutex::new(None),
            session: RwLock::new(None),
            lifecycle: Mutex::new(()),
            streaming: AtomicBool::new(false),
            next_trigger: Mutex::new(Instant::now()),
            firmware,
            debug,
            last_stats: Mutex::new(AcquisitionStats::default()),
            reader_spawner: os_thread,
        })
    }

    /// Firmware version reported by the camera.
    #[must_use]
    pub fn firmware(&self) -> u32 {
        self.firmware
    }

    /// Copy of the current configuration.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::LockError` if the config mutex is poisoned.
    pub fn config(&self) -> Result<AcquisitionConfig> {
        Ok(self.config.lock().map_err(AcquisitionError::lock)?.clone())
    }

    /// Whether acquisition is started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.session.read().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Whether the reader thread is still producing.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.current().map(|s| s.running()).unwrap_or(false)
    }

    fn current(&self) -> Result<Arc<Session>> {
        self.session
            .read()
            .map_err(AcquisitionError::lock)?
            .clone()
            .ok_or(AcquisitionError::NotStarted)
    }

    /// Changes the ring capacity used by the next `start`.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::InvalidRequest` while started or for a size
    /// that is not a power of two of at least 2.
    pub fn set_buffer_size(&self, size: usize) -> Result<()> {
        crate::config::validate_buffer_size(size)?;
        let _lifecycle = self.lifecycle.lock().map_err(AcquisitionError::lock)?;
        if self.is_started() {
            return Err(AcquisitionError::InvalidRequest(
                "can't change buffer size while grabbing".into(),
            ));
        }
        self.config.lock().map_err(AcquisitionError::lock)?.buffer_size = size;
        Ok(())
    }

    /// Installs the observer that receives raw data on the reader thread.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::InvalidRequest` while started.
    pub fn set_raw_data_observer(&self, observer: Option<RawDataObserver>) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().map_err(AcquisitionError::lock)?;
        if self.is_started() {
            return Err(AcquisitionError::InvalidRequest(
                "can't change the raw data observer while grabbing".into(),
            ));
        }
        *self.observer.lock().map_err(AcquisitionError::lock)? = observer;
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Starts acquisition: allocates the ring, starts the DMA engine, the
    /// decode workers and the reader thread.
    ///
    /// Anything set up before a failure is torn down again.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::InvalidRequest` if already started,
    /// `AcquisitionError::InvalidState` for an unknown output mode,
    /// `AcquisitionError::MemoryAllocation` if the ring cannot be allocated,
    /// and register, transport or thread errors.
    pub fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().map_err(AcquisitionError::lock)?;
        if self.is_started() {
            return Err(AcquisitionError::InvalidRequest(
                "acquisition is already started".into(),
            ));
        }

        let config = self.config()?;
        let outputs = outputs_from_mode(self.registers.read(OUTPUT_MODE)?)?;
        let params = GeometryParams {
            outputs,
            packet_size: config.packet_size,
            missing_payload: config.quirks.missing_payload,
        };

        let mut padded_size = 0;
        for format in [SensorFormat::Cmosis, SensorFormat::Cmosis20] {
            let geometry = compute_geometry(&params, format, FRAME_HEADER_SIZE, config.max_lines)?;
            padded_size = padded_size.max(geometry.padded_size);
        }
        let dimensions = ImageDimensions {
            width: WIDTH,
            height: config.max_lines,
            bpp: 16,
        };
        let (ring, writer) = RingBuffer::allocate(config.buffer_size, padded_size, dimensions)?;

        let mut transport = self
            .transport
            .lock()
            .map_err(AcquisitionError::lock)?
            .take()
            .ok_or_else(|| AcquisitionError::Failed("DMA transport was lost".into()))?;
        if let Err(e) = transport.start_engine() {
            log::error!("Failed to start DMA engine: {}", e);
            *self.transport.lock().map_err(AcquisitionError::lock)? = Some(transport);
            return Err(e);
        }

        let workers = config.preprocess && !config.raw_data_only;
        let pool = if workers {
            let cpus = thread::available_parallelism().map_or(1, usize::from);
            match DecodePool::spawn(
                worker_count(cpus, config.max_threads),
                &ring,
                &self.decoder,
                &self.debug,
            ) {
                Ok(pool) => Some(pool),
                Err(e) => {
                    self.restore_transport(transport);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let observer = self.observer.lock().map_err(AcquisitionError::lock)?.take();
        let assembler = FrameAssembler::new(writer, params, config.quirks)
            .with_autostop(config.autostop.arm(Instant::now()))
            .with_observer(observer)
            .with_debug(self.debug.clone())
            .with_data_storage(!config.raw_data_only);

        let running = Arc::new(AtomicBool::new(true));
        let settings = ReaderSettings {
            timeout: config.dma_timeout(),
            realtime_priority: config.realtime_priority,
            recover_stuck_busy: config.quirks.stuck_busy,
        };
        let reader = match ReaderThread::spawn_with(
            self.reader_spawner,
            transport,
            assembler,
            settings,
            Arc::clone(&running),
            Some(Arc::clone(&self.registers)),
        ) {
            Ok(reader) => reader,
            Err(failure) => {
                *self.observer.lock().map_err(AcquisitionError::lock)? = failure.observer;
                self.restore_transport(failure.transport);
                if let Some(mut pool) = pool {
                    pool.stop();
                }
                return Err(failure.error);
            }
        };

        log::info!(
            "Acquisition started: {} slots x {} bytes, {} outputs, {} decode workers",
            ring.capacity(),
            ring.padded_size(),
            outputs,
            pool.as_ref().map_or(0, DecodePool::len)
        );

        let session = Arc::new(Session {
            ring,
            reader: Mutex::new(Some(reader)),
            pool: Mutex::new(pool),
            running,
            workers,
            raw_data_only: config.raw_data_only,
            announce_ready: config.announce_ready,
            image_lock_timeout: config.image_lock_timeout(),
        });
        *self.session.write().map_err(AcquisitionError::lock)? = Some(session);
        Ok(())
    }

    fn restore_transport(&self, mut transport: Box<dyn DmaTransport>) {
        if let Err(e) = transport.stop_engine() {
            log::warn!("Failed to stop DMA engine: {}", e);
        }
        if let Ok(mut slot) = self.transport.lock() {
            *slot = Some(transport);
        }
    }

    /// Asks the reader to stop after its current transport call.
    ///
    /// Unlike [`stop`](Self::stop) this does not wait and may be called from
    /// a `stream` callback.
    pub fn request_stop(&self) {
        if let Ok(session) = self.current() {
            session.running.store(false, Ordering::Release);
        }
    }

    /// Stops acquisition and releases the ring. Does nothing if not started.
    ///
    /// Must not be called from a `stream` callback, use
    /// [`request_stop`](Self::request_stop) there.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::LockError` on a poisoned lock and
    /// `AcquisitionError::Failed` if the reader thread panicked.
    pub fn stop(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().map_err(AcquisitionError::lock)?;
        let Some(session) = self.session.write().map_err(AcquisitionError::lock)?.take() else {
            return Ok(());
        };
        self.debug.message(DebugCategory::Api, format_args!("Stopping acquisition"));
        session.running.store(false, Ordering::Release);

        let mut result = Ok(());
        let reader = session.reader.lock().map_err(AcquisitionError::lock)?.take();
        if let Some(reader) = reader {
            match reader.join() {
                Ok(exit) => {
                    match exit.error {
                        Some(AcquisitionError::Failed(message)) => {
                            log::error!("Reader thread failed: {}", message);
                            result = Err(AcquisitionError::Failed(message));
                        }
                        Some(e) => log::warn!("Reader thread had stopped on error: {}", e),
                        None => {}
                    }
                    *self.observer.lock().map_err(AcquisitionError::lock)? = exit.observer;
                    self.restore_transport(exit.transport);
                }
                Err(e) => {
                    log::error!("Reader thread failed: {}", e);
                    result = Err(e);
                }
            }
        }

        if let Some(mut pool) = session.pool.lock().map_err(AcquisitionError::lock)?.take() {
            pool.stop();
        }

        while self.streaming.load(Ordering::Acquire) {
            thread::sleep(NOFRAME_SLEEP);
        }

        let stats = session.ring.stats();
        log::info!(
            "Acquisition stopped: {} frames, {} broken, {} events skipped, {} decodes skipped",
            stats.produced,
            stats.broken_frames,
            stats.skipped_events,
            stats.skipped_decode
        );
        *self.last_stats.lock().map_err(AcquisitionError::lock)? = stats;
        result
    }

    // ========================================================================
    // Camera control
    // ========================================================================

    /// Requests one frame from the camera.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::Busy` if the camera stays busy for 200 ms
    /// and `AcquisitionError::Register` on register failures.
    pub fn trigger(&self) -> Result<()> {
        let mut next = self.next_trigger.lock().map_err(AcquisitionError::lock)?;
        let now = Instant::now();
        if *next > now {
            thread::sleep(*next - now);
        }

        wait_not_busy(self.registers.as_ref(), TRIGGER_WAIT_IDLE, READ_STATUS_DELAY)?;

        let control = self.registers.read(CONTROL)?;
        self.registers.write(CONTROL, control | FRAME_REQUEST)?;
        self.registers.write(CONTROL, control)?;

        *next = Instant::now() + NEXT_TRIGGER_DELAY;
        self.debug.message(DebugCategory::Hardware, format_args!("Frame requested"));
        Ok(())
    }

    /// Resets the sensor and puts the camera back to idle.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::Register` on register failures.
    pub fn reset(&self) -> Result<()> {
        let settle = Duration::from_millis(self.config()?.reset_settle_ms);
        log::info!("Resetting camera");
        self.registers.write(CONTROL, RESET_ASSERT)?;
        thread::sleep(settle);
        self.registers.write(CONTROL, RESET_RELEASE)?;
        thread::sleep(settle);
        self.registers.write(CONTROL, IDLE)?;
        Ok(())
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Returns the next event and a copy of its frame metadata.
    ///
    /// Events are handed out in order. A consumer lagging by more than the
    /// ring can hold continues after the skipped frames.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::NotStarted` before `start`,
    /// `AcquisitionError::InvalidRequest` in raw data only mode, and
    /// `AcquisitionError::Timeout` if no event arrived
    /// in time or acquisition stopped.
    pub fn next_event(&self, wait: Wait) -> Result<(u64, FrameInfo)> {
        let session = self.current()?;
        if session.raw_data_only {
            return Err(AcquisitionError::InvalidRequest(
                "events are not tracked in raw data only mode".into(),
            ));
        }

        let deadline = wait.deadline();
        loop {
            if let Some((sequence, info)) = self.advance(&session)? {
                if session.announce_ready && session.workers {
                    self.wait_ready(&session, sequence, deadline);
                }
                return Ok((sequence, info));
            }
            if !session.running() || expired(deadline) {
                // The reader may have finished a frame while we looked.
                if let Some(event) = self.advance(&session)? {
                    return Ok(event);
                }
                self.debug.message(DebugCategory::Api, format_args!("next_event timed out"));
                return Err(AcquisitionError::Timeout);
            }
            thread::sleep(NOFRAME_SLEEP);
        }
    }

    /// Moves the consumer counter forward to the next announceable event.
    fn advance(&self, session: &Session) -> Result<Option<(u64, FrameInfo)>> {
        loop {
            let target = session.event_target()?;
            let Some(sequence) = session.ring.advance_reported(target)? else {
                return Ok(None);
            };
            match session.ring.info(sequence) {
                Ok(info) => return Ok(Some((sequence, info))),
                Err(AcquisitionError::Overwritten(_)) => {
                    log::debug!("Event {} overwritten before it was reported", sequence);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn wait_ready(&self, session: &Session, sequence: u64, deadline: Option<Instant>) {
        while !expired(deadline) && session.workers_active() {
            match session.ring.resolve(sequence) {
                Ok(index) if session.ring.slot(index).ready.load(Ordering::Acquire) != sequence => {
                    thread::sleep(NOFRAME_SLEEP);
                }
                _ => return,
            }
        }
    }

    /// Calls `callback` for every event until it returns `false` or
    /// acquisition ends. Starts acquisition if needed, and then stops it
    /// again before returning.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::Busy` if another `stream` call is running,
    /// errors from starting, and the first error returned by `callback`.
    pub fn stream<F>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(u64, &FrameInfo) -> Result<bool>,
    {
        if self
            .streaming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AcquisitionError::Busy);
        }
        self.debug.message(DebugCategory::Api, format_args!("Start streaming"));

        let mut started_here = false;
        if !self.is_started() {
            if let Err(e) = self.start() {
                self.streaming.store(false, Ordering::Release);
                return Err(e);
            }
            started_here = true;
        }

        let result = match self.current() {
            Ok(session) => self.stream_events(&session, &mut callback),
            Err(e) => Err(e),
        };

        self.streaming.store(false, Ordering::Release);
        self.debug.message(DebugCategory::Api, format_args!("Streaming finished"));

        if started_here {
            self.stop()?;
        }
        result
    }

    fn stream_events<F>(&self, session: &Session, callback: &mut F) -> Result<()>
    where
        F: FnMut(u64, &FrameInfo) -> Result<bool>,
    {
        if session.raw_data_only {
            while session.running() {
                thread::sleep(NOFRAME_SLEEP);
            }
            return Ok(());
        }

        loop {
            let running = session.running();
            while let Some((sequence, info)) = self.advance(session)? {
                if !callback(sequence, &info)? {
                    return Ok(());
                }
            }
            if !running {
                return Ok(());
            }
            thread::sleep(NOFRAME_SLEEP);
        }
    }

    /// Highest sequence completed by the reader.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::NotStarted` before `start`.
    pub fn last_event_id(&self) -> Result<u64> {
        Ok(self.current()?.ring.produced())
    }

    /// Counter snapshot of the running acquisition, or of the last one.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::LockError` on a poisoned lock.
    pub fn stats(&self) -> Result<AcquisitionStats> {
        match self.current() {
            Ok(session) => Ok(session.ring.stats()),
            Err(_) => Ok(*self.last_stats.lock().map_err(AcquisitionError::lock)?),
        }
    }

    // ========================================================================
    // Data access
    // ========================================================================

    /// Returns data of `sequence`.
    ///
    /// Image kinds are decoded first if needed: by waiting for the workers,
    /// or inline on the calling thread when no workers run.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::Overwritten` if the frame left the ring,
    /// `AcquisitionError::InvalidData` for a broken frame,
    /// `AcquisitionError::Busy` if an [`ImageGuard`] on an older frame of
    /// the same slot is still held after `image_lock_timeout_ms`,
    /// `AcquisitionError::NotSupported` for unsupported kinds,
    /// `AcquisitionError::NotStarted` before `start` and
    /// `AcquisitionError::InvalidRequest` in raw data only mode.
    pub fn get(&self, sequence: u64, kind: DataKind) -> Result<FrameData> {
        let session = self.current()?;
        if session.raw_data_only {
            return Err(AcquisitionError::InvalidRequest(
                "frames are not stored in raw data only mode".into(),
            ));
        }
        self.debug.message(
            DebugCategory::Api,
            format_args!("get {kind:?} of frame {sequence}"),
        );

        match kind {
            DataKind::Raw => {
                let mut data = Vec::new();
                session.ring.copy_frame(sequence, &mut data)?;
                Ok(FrameData::Raw(data))
            }
            DataKind::Image => Ok(FrameData::Image(self.decoded(&session, sequence)?)),
            DataKind::ChangeMask => Ok(FrameData::ChangeMask(self.decoded(&session, sequence)?)),
            DataKind::Dimensions => Ok(FrameData::Dimensions(session.ring.dimensions())),
            DataKind::ImageRegion
            | DataKind::PackedImage
            | DataKind::PackedLine
            | DataKind::PackedPayload => Err(AcquisitionError::NotSupported(format!(
                "data kind {kind:?}"
            ))),
        }
    }

    /// Copies the raw frame `sequence` into `dest`, returning its size.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::TooBig` if `dest` is too small,
    /// `AcquisitionError::Overwritten` if the frame left the ring and
    /// `AcquisitionError::NotStarted` before `start`.
    pub fn get_into(&self, sequence: u64, dest: &mut [u8]) -> Result<usize> {
        let session = self.current()?;
        session.ring.copy_frame_into(sequence, dest)
    }

    /// Hands data obtained from [`get`](Self::get) back.
    ///
    /// Releases the image lock. For raw data it checks that the frame was
    /// not overwritten while the caller used it.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::Overwritten` if it was.
    pub fn return_data(&self, sequence: u64, data: FrameData) -> Result<()> {
        drop(data);
        let session = self.current()?;
        session.ring.resolve(sequence).map(|_| ())
    }

    /// Waits until `sequence` is decoded and returns a read guard on it.
    fn decoded(&self, session: &Session, sequence: u64) -> Result<ImageGuard> {
        loop {
            let index = session.ring.resolve(sequence)?;
            let slot = session.ring.slot(index);

            if slot.ready.load(Ordering::Acquire) == sequence {
                let guard = slot.image.read_arc();
                if guard.sequence == sequence && slot.ready.load(Ordering::Acquire) == sequence {
                    session.ring.resolve(sequence)?;
                    if let Some(reason) = &guard.broken {
                        return Err(AcquisitionError::InvalidData(reason.clone()));
                    }
                    return Ok(ImageGuard { sequence, guard });
                }
                continue;
            }

            if session.workers_active() && session.ring.decode_claimed()? < sequence {
                thread::sleep(NOFRAME_SLEEP);
                continue;
            }

            // Claimed by a worker (then the write lock waits for it), skipped
            // by the workers, or no workers at all. An image guard on an
            // older frame of the same slot makes this `Busy`.
            decode_inline(
                &session.ring,
                sequence,
                self.decoder.as_ref(),
                &self.debug,
                session.image_lock_timeout,
            )?;
        }
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("Failed to stop acquisition: {}", e);
        }
    }
}
