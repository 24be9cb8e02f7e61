//! Frame decoding and the decode worker pool
//!
//! Workers claim sequences from the ring (see [`RingBuffer::claim_for_decode`]
//! for the skip policy), copy the raw frame out of the ring, run the
//! [`FrameDecoder`] on the copy and publish the result through the slot's
//! `ready` marker. A failed decode is not an error of the worker: the reason
//! is stored with the image and reported to whoever asks for it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::NOFRAME_SLEEP;
use crate::debug::{DebugCategory, DebugSink};
use crate::error::{AcquisitionError, Result};
use crate::geometry::{SensorFormat, MAX_CHANNELS, PIXELS_PER_CHANNEL};
use crate::ring::{DecodeClaim, DecodedImage, FrameInfo, RingBuffer};

/// Mask applied to decoded pixel values.
const PIXEL_MASK: u16 = 0x0FFF;

/// Bytes of one payload word (16 lanes of 16 bits).
const PAYLOAD_WORD: usize = 32;

/// Turns a raw frame into pixels.
pub trait FrameDecoder: Send + Sync {
    /// Decodes `raw` into `image`, updating its change mask.
    ///
    /// # Errors
    ///
    /// Any error marks the frame as broken for consumers.
    fn decode(&self, raw: &[u8], info: &FrameInfo, image: &mut DecodedImage) -> Result<()>;
}

/// Decoder for first generation CMOSIS frames.
///
/// Each line is read out in `16 / outputs` passes. A pass is a 32-byte line
/// header followed by 128 payload words; lane `c` of word `s` carries pixel
/// `s` of channel `pass * outputs + c`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CmosisDecoder;

impl FrameDecoder for CmosisDecoder {
    fn decode(&self, raw: &[u8], info: &FrameInfo, image: &mut DecodedImage) -> Result<()> {
        let geometry = info
            .geometry
            .ok_or_else(|| AcquisitionError::InvalidData("frame has no geometry".into()))?;
        if geometry.format != SensorFormat::Cmosis {
            return Err(AcquisitionError::NotSupported(format!(
                "decoding {:?} frames",
                geometry.format
            )));
        }

        let width = image.dimensions.width;
        if geometry.lines > image.dimensions.height {
            return Err(AcquisitionError::TooBig {
                required: geometry.lines,
                available: image.dimensions.height,
            });
        }
        if raw.len() < geometry.raw_size {
            return Err(AcquisitionError::InvalidData(format!(
                "frame truncated: {} of {} bytes",
                raw.len(),
                geometry.raw_size
            )));
        }

        let outputs = geometry.outputs;
        let passes = MAX_CHANNELS / outputs;
        image.change_mask.fill(0);

        let mut pos = geometry.header_size;
        for line in 0..geometry.lines {
            let row = &mut image.pixels[line * width..(line + 1) * width];
            for pass in 0..passes {
                if !(geometry.missing_payload && line == 0 && pass == 0) {
                    pos += PAYLOAD_WORD;
                }
                for s in 0..PIXELS_PER_CHANNEL {
                    let word = &raw[pos..pos + PAYLOAD_WORD];
                    for lane in 0..outputs {
                        let x = (pass * outputs + lane) * PIXELS_PER_CHANNEL + s;
                        if x < width {
                            row[x] = u16::from_le_bytes([word[2 * lane], word[2 * lane + 1]])
                                & PIXEL_MASK;
                        }
                    }
                    pos += PAYLOAD_WORD;
                }
            }
            image.change_mask[line] = 1;
        }
        Ok(())
    }
}

/// Number of decode workers for `cpus` processors.
///
/// Leaves room for the reader and the consumer, clamped by `max_threads`
/// (0 = no clamp).
#[must_use]
pub fn worker_count(cpus: usize, max_threads: usize) -> usize {
    let n = match cpus {
        0 | 1 => 1,
        2..=3 => cpus - 1,
        _ => cpus - 2,
    };
    if max_threads > 0 && max_threads < n {
        max_threads
    } else {
        n
    }
}

/// Copies `sequence` out of the ring and decodes it into `image`.
///
/// A frame that is broken or fails to decode still counts as handled: the
/// reason ends up in `image.broken`.
fn decode_into(
    ring: &RingBuffer,
    sequence: u64,
    image: &mut DecodedImage,
    decoder: &dyn FrameDecoder,
    scratch: &mut Vec<u8>,
    debug: &DebugSink,
) -> Result<()> {
    let info = ring.copy_frame(sequence, scratch)?;
    image.sequence = sequence;
    image.broken = None;

    if info.broken {
        image.change_mask.fill(0);
        image.broken = Some(format!(
            "frame {} is incomplete: {} of {} bytes",
            sequence, info.raw_size, info.expected_size
        ));
        return Ok(());
    }

    if debug.enabled(DebugCategory::RawFrames) {
        debug.dump(DebugCategory::RawFrames, &format!("frame{sequence:9}.raw"), scratch);
    }

    if let Err(e) = decoder.decode(scratch, &info, image) {
        debug.message(
            DebugCategory::BrokenFrames,
            format_args!("Failed to decode frame {sequence}: {e}"),
        );
        if debug.enabled(DebugCategory::BrokenFrames) {
            debug.dump(
                DebugCategory::BrokenFrames,
                &format!("broken{sequence:9}.raw"),
                scratch,
            );
        }
        image.change_mask.fill(0);
        image.broken = Some(e.to_string());
    }
    Ok(())
}

/// Decodes the sequence held by `claim` and publishes it.
///
/// # Errors
///
/// Returns `AcquisitionError::Overwritten` if the frame left the ring before
/// or during decoding; the ready marker is rolled back in that case.
pub(crate) fn decode_claimed(
    ring: &RingBuffer,
    mut claim: DecodeClaim,
    decoder: &dyn FrameDecoder,
    scratch: &mut Vec<u8>,
    debug: &DebugSink,
) -> Result<()> {
    let sequence = claim.sequence;
    let slot = ring.slot(claim.index);

    if let Err(e) = decode_into(ring, sequence, &mut claim.image, decoder, scratch, debug) {
        claim.image.sequence = 0;
        return Err(e);
    }
    slot.ready.store(sequence, Ordering::Release);
    drop(claim);

    if ring.resolve(sequence).is_err() {
        let _ = slot
            .ready
            .compare_exchange(sequence, 0, Ordering::AcqRel, Ordering::Acquire);
        return Err(AcquisitionError::Overwritten(sequence));
    }
    Ok(())
}

/// Decodes `sequence` on the calling thread.
///
/// Used when no workers run or they skipped the frame. Does nothing if the
/// slot already holds the decoded sequence. Waits at most `lock_timeout`
/// for the slot's image lock, which a worker or a consumer's
/// [`ImageGuard`](crate::events::ImageGuard) of an older frame may hold.
///
/// # Errors
///
/// Returns `AcquisitionError::Overwritten` if the frame left the ring and
/// `AcquisitionError::Busy` if the lock stayed taken.
pub(crate) fn decode_inline(
    ring: &RingBuffer,
    sequence: u64,
    decoder: &dyn FrameDecoder,
    debug: &DebugSink,
    lock_timeout: Duration,
) -> Result<()> {
    let index = ring.resolve(sequence)?;
    let slot = ring.slot(index);
    let Some(mut image) = slot.image.try_write_arc_for(lock_timeout) else {
        debug.message(
            DebugCategory::Api,
            format_args!("Image slot of frame {sequence} still locked after {lock_timeout:?}"),
        );
        return Err(AcquisitionError::Busy);
    };
    if image.sequence == sequence && slot.ready.load(Ordering::Acquire) == sequence {
        return Ok(());
    }

    let mut scratch = Vec::with_capacity(ring.padded_size());
    if let Err(e) = decode_into(ring, sequence, &mut image, decoder, &mut scratch, debug) {
        image.sequence = 0;
        return Err(e);
    }
    slot.ready.store(sequence, Ordering::Release);
    drop(image);

    if ring.resolve(sequence).is_err() {
        let _ = slot
            .ready
            .compare_exchange(sequence, 0, Ordering::AcqRel, Ordering::Acquire);
        return Err(AcquisitionError::Overwritten(sequence));
    }
    Ok(())
}

/// Background decode workers.
pub struct DecodePool {
    workers: Vec<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl DecodePool {
    /// Spawns `count` workers decoding frames of `ring`.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError::Failed` if a worker cannot be spawned; the
    /// workers spawned so far are stopped again.
    pub fn spawn(
        count: usize,
        ring: &Arc<RingBuffer>,
        decoder: &Arc<dyn FrameDecoder>,
        debug: &DebugSink,
    ) -> Result<Self> {
        let mut pool = Self {
            workers: Vec::with_capacity(count),
            running: Arc::new(AtomicBool::new(true)),
        };

        for i in 0..count {
            let ring = Arc::clone(ring);
            let decoder = Arc::clone(decoder);
            let debug = debug.clone();
            let running = Arc::clone(&pool.running);
            let handle = thread::Builder::new()
                .name(format!("streamcam-decode-{i}"))
                .spawn(move || worker_loop(&ring, decoder.as_ref(), &debug, &running))
                .map_err(|e| AcquisitionError::Failed(format!("spawning decode worker: {e}")));
            match handle {
                Ok(handle) => pool.workers.push(handle),
                Err(e) => {
                    pool.stop();
                    return Err(e);
                }
            }
        }

        log::info!("Started {} decode workers", count);
        Ok(pool)
    }

    /// Number of workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether the pool has no workers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Whether the workers are still decoding.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stops and joins all workers.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("Decode worker panicked");
            }
        }
    }
}

impl Drop for DecodePool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    ring: &RingBuffer,
    decoder: &dyn FrameDecoder,
    debug: &DebugSink,
    running: &AtomicBool,
) {
    let mut scratch = Vec::with_capacity(ring.padded_size());
    while running.load(Ordering::Acquire) {
        match ring.claim_for_decode() {
            Ok(Some(claim)) => {
                let sequence = claim.sequence;
                match decode_claimed(ring, claim, decoder, &mut scratch, debug) {
                    Ok(()) => log::trace!("Decoded frame {}", sequence),
                    Err(AcquisitionError::Overwritten(_)) => {
                        log::debug!("Frame {} overwritten while decoding", sequence);
                    }
                    Err(e) => log::warn!("Decoding frame {} failed: {}", sequence, e),
                }
            }
            Ok(None) => thread::sleep(NOFRAME_SLEEP),
            Err(e) => {
                log::error!("Decode worker stopping: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{GeometryParams, WIDTH};
    use crate::ring::{FrameWriter, ImageDimensions};
    use crate::test_utils::FrameGenerator;
    use std::sync::Mutex;

    const LOCK_WAIT: Duration = Duration::from_millis(50);

    fn dims(height: usize) -> ImageDimensions {
        ImageDimensions {
            width: WIDTH,
            height,
            bpp: 16,
        }
    }

    fn produce(writer: &mut FrameWriter, gen: &FrameGenerator, seq: u32, lines: usize) {
        let frame = gen.frame(seq, lines);
        let geometry = gen.geometry(lines);
        writer
            .begin_frame(FrameInfo {
                hw_sequence: seq,
                expected_size: geometry.raw_size,
                geometry: Some(geometry),
                ..FrameInfo::default()
            })
            .unwrap();
        writer.write(0, &frame).unwrap();
        writer.finish(frame.len(), geometry.raw_size, false).unwrap();
    }

    fn check_pixels(image: &DecodedImage, seq: u32, lines: usize) {
        for line in 0..lines {
            for x in [0, 1, 127, 128, 1000, WIDTH - 1] {
                assert_eq!(
                    image.pixels[line * WIDTH + x],
                    FrameGenerator::expected_pixel(seq, line, x),
                    "line {line} x {x}"
                );
            }
        }
    }

    // =========================================================================
    // Reference decoder
    // =========================================================================

    #[test]
    fn test_worker_count() {
        assert_eq!(worker_count(1, 0), 1);
        assert_eq!(worker_count(2, 0), 1);
        assert_eq!(worker_count(3, 0), 2);
        assert_eq!(worker_count(8, 0), 6);
        assert_eq!(worker_count(8, 2), 2);
        assert_eq!(worker_count(8, 16), 6);
    }

    #[test]
    fn test_cmosis_decode_sixteen_outputs() {
        let gen = FrameGenerator::default();
        let frame = gen.frame(5, 3);
        let info = FrameInfo {
            geometry: Some(gen.geometry(3)),
            ..FrameInfo::default()
        };
        let mut image = DecodedImage::allocate(dims(4)).unwrap();
        CmosisDecoder.decode(&frame, &info, &mut image).unwrap();
        check_pixels(&image, 5, 3);
        assert_eq!(image.change_mask, vec![1, 1, 1, 0]);
    }

    #[test]
    fn test_cmosis_decode_four_outputs() {
        let gen = FrameGenerator {
            outputs: 4,
            ..FrameGenerator::default()
        };
        let frame = gen.frame(9, 2);
        let info = FrameInfo {
            geometry: Some(gen.geometry(2)),
            ..FrameInfo::default()
        };
        let mut image = DecodedImage::allocate(dims(2)).unwrap();
        CmosisDecoder.decode(&frame, &info, &mut image).unwrap();
        check_pixels(&image, 9, 2);
    }

    #[test]
    fn test_cmosis_decode_rejects_truncated() {
        let gen = FrameGenerator::default();
        let frame = gen.frame(1, 2);
        let info = FrameInfo {
            geometry: Some(gen.geometry(2)),
            ..FrameInfo::default()
        };
        let mut image = DecodedImage::allocate(dims(2)).unwrap();
        assert!(matches!(
            CmosisDecoder.decode(&frame[..5000], &info, &mut image),
            Err(AcquisitionError::InvalidData(_))
        ));
    }

    #[test]
    fn test_cmosis20_not_supported() {
        let params = GeometryParams {
            outputs: 16,
            packet_size: 4096,
            missing_payload: true,
        };
        let geometry =
            crate::geometry::compute_geometry(&params, SensorFormat::Cmosis20, 32, 1).unwrap();
        let info = FrameInfo {
            geometry: Some(geometry),
            ..FrameInfo::default()
        };
        let mut image = DecodedImage::allocate(dims(1)).unwrap();
        assert!(matches!(
            CmosisDecoder.decode(&vec![0; geometry.raw_size], &info, &mut image),
            Err(AcquisitionError::NotSupported(_))
        ));
    }

    // =========================================================================
    // Claim / publish
    // =========================================================================

    #[test]
    fn test_decode_claimed_marks_ready() {
        let gen = FrameGenerator::default();
        let (ring, mut writer) =
            RingBuffer::allocate(4, gen.geometry(2).padded_size, dims(2)).unwrap();
        produce(&mut writer, &gen, 1, 2);

        let claim = ring.claim_for_decode().unwrap().unwrap();
        let mut scratch = Vec::new();
        decode_claimed(&ring, claim, &CmosisDecoder, &mut scratch, &DebugSink::default()).unwrap();

        let slot = ring.slot(ring.resolve(1).unwrap());
        assert_eq!(slot.ready.load(Ordering::Acquire), 1);
        let image = slot.image.read();
        assert_eq!(image.sequence, 1);
        assert!(image.broken.is_none());
        check_pixels(&image, 1, 2);
    }

    #[test]
    fn test_broken_frame_records_reason() {
        let gen = FrameGenerator::default();
        let (ring, mut writer) =
            RingBuffer::allocate(4, gen.geometry(2).padded_size, dims(2)).unwrap();
        writer.begin_frame(FrameInfo::default()).unwrap();
        writer.write(0, &gen.frame(1, 2)[..4096]).unwrap();
        writer.finish(4096, 8288, true).unwrap();

        decode_inline(&ring, 1, &CmosisDecoder, &DebugSink::default(), LOCK_WAIT).unwrap();
        let slot = ring.slot(ring.resolve(1).unwrap());
        assert_eq!(slot.ready.load(Ordering::Acquire), 1);
        assert!(slot.image.read().broken.as_deref().unwrap().contains("incomplete"));
    }

    #[test]
    fn test_overwritten_before_decode() {
        let gen = FrameGenerator::default();
        let (ring, mut writer) =
            RingBuffer::allocate(2, gen.geometry(2).padded_size, dims(2)).unwrap();
        for seq in 1..=3 {
            produce(&mut writer, &gen, seq, 2);
        }
        assert!(matches!(
            decode_inline(&ring, 1, &CmosisDecoder, &DebugSink::default(), LOCK_WAIT),
            Err(AcquisitionError::Overwritten(1))
        ));
    }

    #[test]
    fn test_pool_decodes_everything() {
        let gen = FrameGenerator::default();
        let (ring, mut writer) =
            RingBuffer::allocate(8, gen.geometry(2).padded_size, dims(2)).unwrap();
        let decoder: Arc<dyn FrameDecoder> = Arc::new(CmosisDecoder);
        let mut pool = DecodePool::spawn(2, &ring, &decoder, &DebugSink::default()).unwrap();
        assert_eq!(pool.len(), 2);

        for seq in 1..=4 {
            produce(&mut writer, &gen, seq, 2);
        }
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let all_ready = || {
            (1..=4u64).all(|seq| {
                ring.resolve(seq)
                    .map(|i| ring.slot(i).ready.load(Ordering::Acquire) == seq)
                    .unwrap_or(false)
            })
        };
        while !all_ready() && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(all_ready());
        pool.stop();
        assert!(!pool.is_running());
        assert!(pool.is_empty());
    }

    /// Lets the producer complete `laps` frames before decoding, as a reader
    /// thread running ahead of a slow decode would.
    struct LappingDecoder {
        writer: Mutex<FrameWriter>,
        gen: FrameGenerator,
        first: u32,
        laps: u32,
    }

    impl FrameDecoder for LappingDecoder {
        fn decode(&self, raw: &[u8], info: &FrameInfo, image: &mut DecodedImage) -> Result<()> {
            let mut writer = self.writer.lock().unwrap();
            for seq in self.first..self.first + self.laps {
                produce(&mut writer, &self.gen, seq, 2);
            }
            CmosisDecoder.decode(raw, info, image)
        }
    }

    #[test]
    fn test_overwritten_during_decode_rolls_back_ready() {
        let gen = FrameGenerator::default();
        let (ring, mut writer) =
            RingBuffer::allocate(4, gen.geometry(2).padded_size, dims(2)).unwrap();
        produce(&mut writer, &gen, 1, 2);
        let decoder = LappingDecoder {
            writer: Mutex::new(writer),
            gen: FrameGenerator::default(),
            first: 2,
            laps: 4,
        };

        let claim = ring.claim_for_decode().unwrap().unwrap();
        let index = claim.index;
        let mut scratch = Vec::new();
        assert!(matches!(
            decode_claimed(&ring, claim, &decoder, &mut scratch, &DebugSink::default()),
            Err(AcquisitionError::Overwritten(1))
        ));
        assert_ne!(ring.slot(index).ready.load(Ordering::Acquire), 1);
        assert!(matches!(ring.resolve(1), Err(AcquisitionError::Overwritten(1))));
        // a late inline decode must not resurrect it
        assert!(matches!(
            decode_inline(&ring, 1, &CmosisDecoder, &DebugSink::default(), LOCK_WAIT),
            Err(AcquisitionError::Overwritten(1))
        ));
    }

    #[test]
    fn test_inline_decode_busy_while_slot_image_held() {
        let gen = FrameGenerator::default();
        let (ring, mut writer) =
            RingBuffer::allocate(2, gen.geometry(2).padded_size, dims(2)).unwrap();
        produce(&mut writer, &gen, 1, 2);
        decode_inline(&ring, 1, &CmosisDecoder, &DebugSink::default(), LOCK_WAIT).unwrap();

        let held = ring.slot(ring.resolve(1).unwrap()).image.read_arc();
        produce(&mut writer, &gen, 2, 2);
        produce(&mut writer, &gen, 3, 2);

        let started = std::time::Instant::now();
        assert!(matches!(
            decode_inline(&ring, 3, &CmosisDecoder, &DebugSink::default(), LOCK_WAIT),
            Err(AcquisitionError::Busy)
        ));
        assert!(started.elapsed() >= LOCK_WAIT);
        assert_eq!(held.sequence, 1);

        drop(held);
        decode_inline(&ring, 3, &CmosisDecoder, &DebugSink::default(), LOCK_WAIT).unwrap();
        check_pixels(&ring.slot(ring.resolve(3).unwrap()).image.read(), 3, 2);
    }
}
