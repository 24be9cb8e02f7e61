//! Ring buffer of frame slots
//!
//! One producer (the reader thread) fills raw frames; decode workers and
//! consumers read them. The raw region is never locked: the producer
//! overwrites a slot as soon as the ring wraps. Readers copy raw bytes and
//! then re-check the slot tag, turning any concurrent overwrite into
//! [`AcquisitionError::Overwritten`] instead of handing out mixed data.
//!
//! # Slot tag protocol
//!
//! Every slot carries the sequence number it currently holds (or is being
//! filled with). The producer stores the new tag and issues a release fence
//! *before* writing any byte of the new frame. A reader copies the bytes,
//! issues an acquire fence and loads the tag again: if it still matches, no
//! byte of the copy came from the newer frame.
//!
//! Raw bytes live in `AtomicU64` words accessed with relaxed ordering, so
//! concurrent reads and writes are well defined; a torn copy is possible and
//! is exactly what the tag check detects.
//!
//! The decoded image of each slot sits behind its own shared/exclusive lock.
//! Decode workers only ever `try_write` it, so neither the producer nor the
//! decoders wait for a slow consumer.

use parking_lot::{ArcRwLockWriteGuard, RawRwLock, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::config::RESERVE_BUFFERS;
use crate::error::{AcquisitionError, Result};
use crate::geometry::FrameGeometry;

/// Metadata of one produced frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameInfo {
    /// Sequence number assigned by the producer (1-based).
    pub sequence: u64,
    /// Sequence number reported by the camera header.
    pub hw_sequence: u32,
    /// Readout window offset from the header.
    pub offset: u32,
    /// Arrival time of the frame header.
    pub timestamp: Option<SystemTime>,
    /// Bytes actually received.
    pub raw_size: usize,
    /// Bytes the header announced.
    pub expected_size: usize,
    /// Frame ended short or was force-closed.
    pub broken: bool,
    /// Geometry computed from the header.
    pub geometry: Option<FrameGeometry>,
}

/// Image size reported for the `Dimensions` data kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDimensions {
    /// Pixels per line.
    pub width: usize,
    /// Lines per image.
    pub height: usize,
    /// Bits per pixel.
    pub bpp: u32,
}

/// Decoded pixels of one slot.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    /// Sequence the content belongs to (0 = never decoded).
    pub sequence: u64,
    /// Image size.
    pub dimensions: ImageDimensions,
    /// Row-major pixels, `width * height`.
    pub pixels: Vec<u16>,
    /// One entry per line, non-zero for lines updated by the last decode.
    pub change_mask: Vec<u32>,
    /// Why decoding failed, if it did.
    pub broken: Option<String>,
}

impl DecodedImage {
    pub(crate) fn allocate(dimensions: ImageDimensions) -> Result<Self> {
        let mut pixels = Vec::new();
        pixels
            .try_reserve_exact(dimensions.width * dimensions.height)
            .map_err(|e| AcquisitionError::MemoryAllocation(format!("image buffer: {e}")))?;
        pixels.resize(dimensions.width * dimensions.height, 0);

        let mut change_mask = Vec::new();
        change_mask
            .try_reserve_exact(dimensions.height)
            .map_err(|e| AcquisitionError::MemoryAllocation(format!("change mask: {e}")))?;
        change_mask.resize(dimensions.height, 0);

        Ok(Self {
            sequence: 0,
            dimensions,
            pixels,
            change_mask,
            broken: None,
        })
    }
}

/// One element of the ring.
pub(crate) struct FrameSlot {
    /// Sequence currently stored or being written.
    tag: AtomicU64,
    /// Sequence whose decode finished (successfully or not).
    pub(crate) ready: AtomicU64,
    info: Mutex<FrameInfo>,
    pub(crate) image: Arc<RwLock<DecodedImage>>,
}

/// Exclusive claim on a slot's decoded region for one sequence.
pub(crate) struct DecodeClaim {
    pub(crate) sequence: u64,
    pub(crate) index: usize,
    pub(crate) image: ArcRwLockWriteGuard<RawRwLock, DecodedImage>,
}

/// Counter snapshot for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionStats {
    /// Highest sequence completed by the reader.
    pub produced: u64,
    /// Highest sequence claimed by decoders.
    pub decoded: u64,
    /// Highest sequence handed to a consumer.
    pub reported: u64,
    /// Frames closed short.
    pub broken_frames: u64,
    /// Frames the decoders skipped to catch up.
    pub skipped_decode: u64,
    /// Events consumers skipped to catch up.
    pub skipped_events: u64,
    /// DMA packets seen by the reader.
    pub packets: u64,
}

/// Fixed ring of frame slots shared between producer, decoders and consumers.
pub struct RingBuffer {
    capacity: usize,
    padded_size: usize,
    words_per_slot: usize,
    raw: Box<[AtomicU64]>,
    slots: Box<[FrameSlot]>,
    dimensions: ImageDimensions,
    produced: AtomicU64,
    decode_claim: Mutex<u64>,
    reported: Mutex<u64>,
    broken_frames: AtomicU64,
    skipped_decode: AtomicU64,
    skipped_events: AtomicU64,
    packets: AtomicU64,
}

/// Lag above which a counter is pushed forward.
pub(crate) fn lag_limit(capacity: usize) -> u64 {
    (capacity.saturating_sub(RESERVE_BUFFERS) as u64).max(1)
}

/// Lag a counter is left with after a skip.
pub(crate) fn lag_after_skip(capacity: usize) -> u64 {
    (capacity.saturating_sub(1 + RESERVE_BUFFERS) as u64).max(1)
}

impl RingBuffer {
    /// Allocates a ring and hands out its only producer handle.
    ///
    /// The raw region is one contiguous block of `capacity * padded_size`
    /// bytes. Any allocation failure drops whatever was already allocated.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::InvalidRequest` for a capacity below 2 and
    /// `AcquisitionError::MemoryAllocation` if any buffer cannot be allocated.
    pub fn allocate(
        capacity: usize,
        padded_size: usize,
        dimensions: ImageDimensions,
    ) -> Result<(Arc<Self>, FrameWriter)> {
        if capacity < 2 {
            return Err(AcquisitionError::InvalidRequest(format!(
                "ring capacity {capacity} is too small"
            )));
        }

        let words_per_slot = padded_size.div_ceil(8);
        let total_words = words_per_slot
            .checked_mul(capacity)
            .ok_or_else(|| AcquisitionError::MemoryAllocation("ring size overflows".into()))?;

        let mut raw = Vec::new();
        raw.try_reserve_exact(total_words).map_err(|e| {
            AcquisitionError::MemoryAllocation(format!(
                "ring buffer ({} bytes): {e}",
                total_words * 8
            ))
        })?;
        raw.resize_with(total_words, || AtomicU64::new(0));

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|e| AcquisitionError::MemoryAllocation(format!("frame slots: {e}")))?;
        for _ in 0..capacity {
            slots.push(FrameSlot {
                tag: AtomicU64::new(0),
                ready: AtomicU64::new(0),
                info: Mutex::new(FrameInfo::default()),
                image: Arc::new(RwLock::new(DecodedImage::allocate(dimensions)?)),
            });
        }

        let ring = Arc::new(Self {
            capacity,
            padded_size,
            words_per_slot,
            raw: raw.into_boxed_slice(),
            slots: slots.into_boxed_slice(),
            dimensions,
            produced: AtomicU64::new(0),
            decode_claim: Mutex::new(0),
            reported: Mutex::new(0),
            broken_frames: AtomicU64::new(0),
            skipped_decode: AtomicU64::new(0),
            skipped_events: AtomicU64::new(0),
            packets: AtomicU64::new(0),
        });

        log::debug!(
            "Allocated ring: {} slots x {} bytes raw, {}x{} image",
            capacity,
            padded_size,
            dimensions.width,
            dimensions.height
        );

        let writer = FrameWriter {
            ring: Arc::clone(&ring),
            sequence: 1,
            open: false,
        };
        Ok((ring, writer))
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Maximum bytes a single frame may occupy.
    #[must_use]
    pub fn padded_size(&self) -> usize {
        self.padded_size
    }

    /// Decoded image size.
    #[must_use]
    pub fn dimensions(&self) -> ImageDimensions {
        self.dimensions
    }

    /// Highest completed sequence.
    #[must_use]
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Acquire)
    }

    /// Highest sequence claimed by decoders.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::LockError` if the claim mutex is poisoned.
    pub fn decode_claimed(&self) -> Result<u64> {
        Ok(*self.decode_claim.lock().map_err(AcquisitionError::lock)?)
    }

    /// Highest sequence handed to a consumer.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::LockError` if the counter mutex is poisoned.
    pub fn reported(&self) -> Result<u64> {
        Ok(*self.reported.lock().map_err(AcquisitionError::lock)?)
    }

    /// Maps a sequence to its slot index if the slot still holds it.
    ///
    /// Must be repeated after anything that may block, since the producer
    /// keeps advancing.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::Overwritten` if the sequence is not (or no
    /// longer) held by the ring.
    pub fn resolve(&self, sequence: u64) -> Result<usize> {
        let produced = self.produced();
        if sequence == 0 || sequence > produced || produced - sequence >= self.capacity as u64 {
            return Err(AcquisitionError::Overwritten(sequence));
        }
        let index = self.slot_index(sequence);
        if self.slots[index].tag.load(Ordering::Acquire) != sequence {
            return Err(AcquisitionError::Overwritten(sequence));
        }
        Ok(index)
    }

    fn slot_index(&self, sequence: u64) -> usize {
        ((sequence - 1) % self.capacity as u64) as usize
    }

    pub(crate) fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    fn slot_words(&self, index: usize) -> &[AtomicU64] {
        let start = index * self.words_per_slot;
        &self.raw[start..start + self.words_per_slot]
    }

    fn still_holds(&self, index: usize, sequence: u64) -> bool {
        fence(Ordering::Acquire);
        self.slots[index].tag.load(Ordering::Relaxed) == sequence
    }

    /// Copies the metadata of a produced frame.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::Overwritten` if the frame left the ring.
    pub fn info(&self, sequence: u64) -> Result<FrameInfo> {
        let index = self.resolve(sequence)?;
        let info = self.slots[index]
            .info
            .lock()
            .map_err(AcquisitionError::lock)?
            .clone();
        if info.sequence != sequence || !self.still_holds(index, sequence) {
            return Err(AcquisitionError::Overwritten(sequence));
        }
        Ok(info)
    }

    /// Copies a frame's raw bytes into `dest`, resizing it to the raw size.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::Overwritten` if the frame left the ring
    /// before or during the copy.
    pub fn copy_frame(&self, sequence: u64, dest: &mut Vec<u8>) -> Result<FrameInfo> {
        let info = self.info(sequence)?;
        let index = self.slot_index(sequence);
        dest.clear();
        dest.resize(info.raw_size.min(self.padded_size), 0);
        read_words(self.slot_words(index), 0, dest);
        if !self.still_holds(index, sequence) {
            return Err(AcquisitionError::Overwritten(sequence));
        }
        Ok(info)
    }

    /// Copies a frame's raw bytes into a caller buffer.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::TooBig` if `dest` is smaller than the frame
    /// and `AcquisitionError::Overwritten` if the frame left the ring.
    pub fn copy_frame_into(&self, sequence: u64, dest: &mut [u8]) -> Result<usize> {
        let info = self.info(sequence)?;
        if dest.len() < info.raw_size {
            return Err(AcquisitionError::TooBig {
                required: info.raw_size,
                available: dest.len(),
            });
        }
        let index = self.slot_index(sequence);
        read_words(self.slot_words(index), 0, &mut dest[..info.raw_size]);
        if !self.still_holds(index, sequence) {
            return Err(AcquisitionError::Overwritten(sequence));
        }
        Ok(info.raw_size)
    }

    /// Claims the next undecoded sequence for a decode worker.
    ///
    /// Falls forward when decoding lags too far behind the producer. Returns
    /// `None` when nothing is claimable or the slot is held by a consumer.
    pub(crate) fn claim_for_decode(&self) -> Result<Option<DecodeClaim>> {
        let produced = self.produced();
        let mut claimed = self.decode_claim.lock().map_err(AcquisitionError::lock)?;
        if *claimed >= produced {
            return Ok(None);
        }

        if produced - *claimed > lag_limit(self.capacity) {
            let from = *claimed + 1;
            *claimed = produced - lag_after_skip(self.capacity);
            self.skipped_decode
                .fetch_add(*claimed + 1 - from, Ordering::Relaxed);
            log::debug!(
                "Skipping decode of frames {} to {}, decoding is {} frames behind a ring of {}",
                from,
                *claimed,
                produced - from + 1,
                self.capacity
            );
        }

        let sequence = *claimed + 1;
        let index = self.slot_index(sequence);
        let Some(image) = self.slots[index].image.try_write_arc() else {
            log::trace!("Slot {} of frame {} is in use, retrying later", index, sequence);
            return Ok(None);
        };
        *claimed = sequence;

        Ok(Some(DecodeClaim {
            sequence,
            index,
            image,
        }))
    }

    /// Advances the consumer counter by one event, or skips forward when the
    /// consumer lags too far. Returns `None` once `target` is reached.
    pub(crate) fn advance_reported(&self, target: u64) -> Result<Option<u64>> {
        let mut reported = self.reported.lock().map_err(AcquisitionError::lock)?;
        if *reported >= target {
            return Ok(None);
        }
        let produced = self.produced();
        if produced - *reported > lag_limit(self.capacity) {
            let next = produced - lag_after_skip(self.capacity);
            log::debug!(
                "Skipping events {} to {}, consumer is {} frames behind a ring of {}",
                *reported + 1,
                next - 1,
                produced - *reported,
                self.capacity
            );
            self.skipped_events
                .fetch_add(next - *reported - 1, Ordering::Relaxed);
            *reported = next;
        } else {
            *reported += 1;
        }
        Ok(Some(*reported))
    }

    pub(crate) fn count_packet(&self) {
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> AcquisitionStats {
        AcquisitionStats {
            produced: self.produced(),
            decoded: self.decode_claim.lock().map(|c| *c).unwrap_or_default(),
            reported: self.reported.lock().map(|r| *r).unwrap_or_default(),
            broken_frames: self.broken_frames.load(Ordering::Relaxed),
            skipped_decode: self.skipped_decode.load(Ordering::Relaxed),
            skipped_events: self.skipped_events.load(Ordering::Relaxed),
            packets: self.packets.load(Ordering::Relaxed),
        }
    }
}

/// The single producer handle of a ring.
///
/// Not `Clone`: whoever owns it is the only writer of raw bytes.
///
/// A slot is retagged only when the next frame actually begins, so between
/// frames all `capacity` completed frames stay resolvable.
pub struct FrameWriter {
    ring: Arc<RingBuffer>,
    sequence: u64,
    /// The current sequence owns its slot.
    open: bool,
}

impl FrameWriter {
    /// Sequence of the frame currently being filled.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Maximum bytes a frame may occupy.
    #[must_use]
    pub fn padded_size(&self) -> usize {
        self.ring.padded_size
    }

    /// The ring this writer fills.
    #[must_use]
    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    fn index(&self) -> usize {
        self.ring.slot_index(self.sequence)
    }

    fn open_slot(&mut self) -> Result<()> {
        if self.open {
            return Ok(());
        }
        let index = self.index();
        let slot = &self.ring.slots[index];
        slot.tag.store(self.sequence, Ordering::Relaxed);
        fence(Ordering::Release);
        let mut info = slot.info.lock().map_err(AcquisitionError::lock)?;
        *info = FrameInfo {
            sequence: self.sequence,
            ..FrameInfo::default()
        };
        self.open = true;
        Ok(())
    }

    /// Takes over the current frame's slot, if not yet done, and stores
    /// header metadata.
    ///
    /// The oldest frame stops resolving here.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::LockError` if the slot metadata is poisoned.
    pub fn begin_frame(&mut self, mut info: FrameInfo) -> Result<()> {
        self.open_slot()?;
        info.sequence = self.sequence;
        let mut slot_info = self.ring.slots[self.index()]
            .info
            .lock()
            .map_err(AcquisitionError::lock)?;
        *slot_info = info;
        Ok(())
    }

    /// Writes `data` at `offset` of the current frame.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::TooBig` if the write would leave the slot.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if offset + data.len() > self.ring.padded_size {
            return Err(AcquisitionError::TooBig {
                required: offset + data.len(),
                available: self.ring.padded_size,
            });
        }
        self.open_slot()?;
        write_words(self.ring.slot_words(self.index()), offset, data);
        Ok(())
    }

    /// Reads back bytes of the current frame.
    pub fn read_back(&self, offset: usize, dest: &mut [u8]) {
        let end = (offset + dest.len()).min(self.ring.padded_size);
        if offset < end {
            read_words(self.ring.slot_words(self.index()), offset, &mut dest[..end - offset]);
        }
    }

    /// Publishes the current frame and moves on to the next sequence.
    ///
    /// Returns the new `produced` count.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::LockError` if slot metadata is poisoned.
    pub fn finish(&mut self, raw_size: usize, expected_size: usize, broken: bool) -> Result<u64> {
        self.open_slot()?;
        {
            let mut info = self.ring.slots[self.index()]
                .info
                .lock()
                .map_err(AcquisitionError::lock)?;
            info.raw_size = raw_size;
            info.expected_size = expected_size;
            info.broken = broken;
        }
        if broken {
            self.ring.broken_frames.fetch_add(1, Ordering::Relaxed);
        }

        let produced = self.sequence;
        self.ring.produced.store(produced, Ordering::Release);
        self.sequence += 1;
        self.open = false;
        Ok(produced)
    }
}

fn read_words(words: &[AtomicU64], offset: usize, dest: &mut [u8]) {
    let end = offset + dest.len();
    let mut pos = offset;
    while pos < end {
        let within = pos % 8;
        let n = (8 - within).min(end - pos);
        let bytes = words[pos / 8].load(Ordering::Relaxed).to_le_bytes();
        dest[pos - offset..pos - offset + n].copy_from_slice(&bytes[within..within + n]);
        pos += n;
    }
}

fn write_words(words: &[AtomicU64], offset: usize, src: &[u8]) {
    let end = offset + src.len();
    let mut pos = offset;
    while pos < end {
        let within = pos % 8;
        let n = (8 - within).min(end - pos);
        let word = &words[pos / 8];
        let mut bytes = if n == 8 {
            [0u8; 8]
        } else {
            word.load(Ordering::Relaxed).to_le_bytes()
        };
        bytes[within..within + n].copy_from_slice(&src[pos - offset..pos - offset + n]);
        word.store(u64::from_le_bytes(bytes), Ordering::Relaxed);
        pos += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> ImageDimensions {
        ImageDimensions {
            width: 4,
            height: 2,
            bpp: 16,
        }
    }

    fn produce(writer: &mut FrameWriter, fill: u8, len: usize) -> u64 {
        writer.begin_frame(FrameInfo::default()).unwrap();
        writer.write(0, &vec![fill; len]).unwrap();
        writer.finish(len, len, false).unwrap()
    }

    // =========================================================================
    // Word access
    // =========================================================================

    #[test]
    fn test_unaligned_write_and_read() {
        let words: Vec<AtomicU64> = (0..4).map(|_| AtomicU64::new(0)).collect();
        let data: Vec<u8> = (1..=19).collect();
        write_words(&words, 3, &data);

        let mut back = vec![0u8; 19];
        read_words(&words, 3, &mut back);
        assert_eq!(back, data);

        let mut head = [0xFFu8; 3];
        read_words(&words, 0, &mut head);
        assert_eq!(head, [0, 0, 0]);
    }

    // =========================================================================
    // Allocation and resolve
    // =========================================================================

    #[test]
    fn test_allocate_rejects_tiny_ring() {
        assert!(matches!(
            RingBuffer::allocate(1, 64, dims()),
            Err(AcquisitionError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_resolve_before_production() {
        let (ring, _writer) = RingBuffer::allocate(4, 64, dims()).unwrap();
        assert!(matches!(ring.resolve(0), Err(AcquisitionError::Overwritten(0))));
        assert!(matches!(ring.resolve(1), Err(AcquisitionError::Overwritten(1))));
    }

    #[test]
    fn test_overwritten_after_wrap() {
        let (ring, mut writer) = RingBuffer::allocate(4, 64, dims()).unwrap();
        for i in 0..10u8 {
            produce(&mut writer, i, 32);
        }
        assert_eq!(ring.produced(), 10);
        assert!(matches!(ring.resolve(3), Err(AcquisitionError::Overwritten(3))));
        assert!(ring.resolve(6).is_err());
        assert!(ring.resolve(7).is_ok());
        assert!(ring.resolve(10).is_ok());
        assert!(ring.resolve(11).is_err());

        // the oldest frame goes once the next one begins
        writer.begin_frame(FrameInfo::default()).unwrap();
        assert!(matches!(ring.resolve(7), Err(AcquisitionError::Overwritten(7))));
        assert!(ring.resolve(8).is_ok());
    }

    #[test]
    fn test_full_capacity_resolvable_between_frames() {
        let (ring, mut writer) = RingBuffer::allocate(4, 64, dims()).unwrap();
        for i in 1..=4u8 {
            produce(&mut writer, i, 16);
        }
        let mut buf = Vec::new();
        for seq in 1..=4u8 {
            ring.copy_frame(u64::from(seq), &mut buf).unwrap();
            assert_eq!(buf, vec![seq; 16]);
        }

        // a write without a header also claims the slot
        writer.write(0, &[0xEE; 8]).unwrap();
        assert!(ring.resolve(1).is_err());
        assert!(ring.copy_frame(2, &mut buf).is_ok());
    }

    #[test]
    fn test_copy_frame_contents() {
        let (ring, mut writer) = RingBuffer::allocate(4, 64, dims()).unwrap();
        produce(&mut writer, 0xAB, 40);
        produce(&mut writer, 0xCD, 24);

        let mut buf = Vec::new();
        let info = ring.copy_frame(1, &mut buf).unwrap();
        assert_eq!(info.sequence, 1);
        assert_eq!(info.raw_size, 40);
        assert_eq!(buf, vec![0xAB; 40]);

        let mut small = [0u8; 10];
        assert!(matches!(
            ring.copy_frame_into(2, &mut small),
            Err(AcquisitionError::TooBig {
                required: 24,
                available: 10
            })
        ));
        let mut exact = [0u8; 24];
        assert_eq!(ring.copy_frame_into(2, &mut exact).unwrap(), 24);
        assert_eq!(exact, [0xCD; 24]);
    }

    #[test]
    fn test_write_beyond_slot_rejected() {
        let (_ring, mut writer) = RingBuffer::allocate(2, 64, dims()).unwrap();
        assert!(matches!(
            writer.write(60, &[0u8; 8]),
            Err(AcquisitionError::TooBig { .. })
        ));
    }

    // =========================================================================
    // Counters and skip policy
    // =========================================================================

    #[test]
    fn test_skip_margins() {
        assert_eq!(lag_limit(8), 6);
        assert_eq!(lag_after_skip(8), 5);
        assert_eq!(lag_limit(2), 1);
        assert_eq!(lag_after_skip(2), 1);
    }

    #[test]
    fn test_advance_reported_in_order() {
        let (ring, mut writer) = RingBuffer::allocate(8, 64, dims()).unwrap();
        for _ in 0..3 {
            produce(&mut writer, 1, 8);
        }
        assert_eq!(ring.advance_reported(3).unwrap(), Some(1));
        assert_eq!(ring.advance_reported(3).unwrap(), Some(2));
        assert_eq!(ring.advance_reported(3).unwrap(), Some(3));
        assert_eq!(ring.advance_reported(3).unwrap(), None);
    }

    #[test]
    fn test_advance_reported_skips_when_lagging() {
        let (ring, mut writer) = RingBuffer::allocate(8, 64, dims()).unwrap();
        for _ in 0..20 {
            produce(&mut writer, 1, 8);
        }
        let next = ring.advance_reported(20).unwrap().unwrap();
        assert_eq!(next, 15);
        assert!(ring.produced() - next < 8);
        assert!(ring.resolve(next).is_ok());
        assert_eq!(ring.stats().skipped_events, 14);
    }

    #[test]
    fn test_claim_for_decode_skips_and_locks() {
        let (ring, mut writer) = RingBuffer::allocate(8, 64, dims()).unwrap();
        assert!(ring.claim_for_decode().unwrap().is_none());
        for _ in 0..20 {
            produce(&mut writer, 1, 8);
        }
        let claim = ring.claim_for_decode().unwrap().unwrap();
        assert_eq!(claim.sequence, 16);
        assert!(ring.produced() - ring.decode_claimed().unwrap() < 8);

        // a consumer holding the next slot blocks the claim without waiting
        let next_index = ring.slot_index(17);
        let reader = ring.slot(next_index).image.read_arc();
        assert!(ring.claim_for_decode().unwrap().is_none());
        assert_eq!(ring.decode_claimed().unwrap(), 16);
        drop(reader);
        assert_eq!(ring.claim_for_decode().unwrap().unwrap().sequence, 17);
        drop(claim);
    }

    #[test]
    fn test_concurrent_copy_never_mixes_frames() {
        let (ring, mut writer) = RingBuffer::allocate(2, 4096, dims()).unwrap();
        let reader_ring = Arc::clone(&ring);
        let consumer = std::thread::spawn(move || {
            let mut buf = Vec::new();
            let mut good = 0;
            for _ in 0..2000 {
                let seq = reader_ring.produced();
                if let Ok(info) = reader_ring.copy_frame(seq, &mut buf) {
                    let fill = (info.sequence % 251) as u8;
                    assert!(buf.iter().all(|&b| b == fill), "mixed frame data");
                    good += 1;
                }
            }
            good
        });
        for seq in 1..=3000u64 {
            writer.begin_frame(FrameInfo::default()).unwrap();
            writer.write(0, &vec![(seq % 251) as u8; 4096]).unwrap();
            writer.finish(4096, 4096, false).unwrap();
        }
        consumer.join().unwrap();
    }
}
