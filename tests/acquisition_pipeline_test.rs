//! Integration tests for the complete acquisition pipeline.
//!
//! ```text
//! Packets → Reader Thread → Ring → Decode Workers → Consumers
//! ```
//!
//! Frames come from the synthetic generator through the in-process
//! transport, so no camera hardware is required.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use streamcam_lib::geometry::WIDTH;
use streamcam_lib::test_utils::{FrameGenerator, MockTransport, PacketFeed};
use streamcam_lib::{
    Acquisition, AcquisitionConfig, AcquisitionError, AutostopPolicy, CmosisDecoder, DataKind,
    FrameData, RegisterFile, Wait,
};

const LINES: usize = 2;
const PACKET: usize = 4096;
const EVENT_WAIT: Wait = Wait::For(Duration::from_secs(5));

fn config(buffer_size: usize, preprocess: bool) -> AcquisitionConfig {
    AcquisitionConfig {
        buffer_size,
        preprocess,
        max_threads: 1,
        max_lines: LINES,
        realtime_priority: false,
        dma_timeout_ms: 5,
        ..AcquisitionConfig::default()
    }
}

fn acquisition(config: AcquisitionConfig) -> (Acquisition, PacketFeed) {
    let (transport, feed) = MockTransport::channel();
    let acq = Acquisition::new(
        config,
        Box::new(transport),
        Arc::new(RegisterFile::new()),
        Arc::new(CmosisDecoder),
    )
    .expect("acquisition");
    (acq, feed)
}

fn wait_produced(acq: &Acquisition, count: u64) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while acq.last_event_id().unwrap() < count && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(acq.last_event_id().unwrap(), count);
}

fn check_image(data: FrameData, hw_sequence: u32) {
    let FrameData::Image(image) = data else {
        panic!("expected an image");
    };
    assert!(image.broken.is_none());
    for x in [0, 1, 127, 128, 1000, WIDTH - 1] {
        assert_eq!(
            image.pixels()[x],
            FrameGenerator::expected_pixel(hw_sequence, 0, x),
            "line 0, x {x}"
        );
        assert_eq!(
            image.pixels()[WIDTH + x],
            FrameGenerator::expected_pixel(hw_sequence, 1, x),
            "line 1, x {x}"
        );
    }
}

// ============================================================================
// End-to-end
// ============================================================================

#[test]
fn test_twenty_frames_in_order_with_one_worker() {
    let (acq, feed) = acquisition(config(8, true));
    let gen = FrameGenerator::default();
    let expected_size = gen.geometry(LINES).raw_size;
    acq.start().unwrap();

    for hw in 1..=20u32 {
        let frame = gen.padded_frame(hw, LINES);
        assert_eq!(frame.len(), 3 * PACKET);
        feed.send_frame(&frame, PACKET);

        let (sequence, info) = acq.next_event(EVENT_WAIT).unwrap();
        assert_eq!(sequence, u64::from(hw));
        assert_eq!(info.raw_size, expected_size);
        assert_eq!(info.hw_sequence, hw);
        assert!(!info.broken);

        check_image(acq.get(sequence, DataKind::Image).unwrap(), hw);
    }

    acq.stop().unwrap();
    let stats = acq.stats().unwrap();
    assert_eq!(stats.produced, 20);
    assert_eq!(stats.reported, 20);
    assert_eq!(stats.packets, 60);
    assert_eq!(stats.skipped_events, 0);
    assert_eq!(stats.broken_frames, 0);
}

#[test]
fn test_burst_of_frames_decoded_in_background() {
    let (acq, feed) = acquisition(config(16, true));
    let gen = FrameGenerator::default();
    acq.start().unwrap();

    let stream: Vec<u8> = (1..=12).flat_map(|hw| gen.padded_frame(hw, LINES)).collect();
    feed.send_frame(&stream, PACKET);
    wait_produced(&acq, 12);

    for expected in 1..=12u32 {
        let (sequence, info) = acq.next_event(EVENT_WAIT).unwrap();
        assert_eq!(sequence, u64::from(expected));
        check_image(acq.get(sequence, DataKind::Image).unwrap(), info.hw_sequence);
    }
    acq.stop().unwrap();
}

// ============================================================================
// Overwrite and skip policy
// ============================================================================

#[test]
fn test_overwritten_frame_reported() {
    let (acq, feed) = acquisition(config(4, false));
    let gen = FrameGenerator::default();
    acq.start().unwrap();

    for hw in 1..=10 {
        feed.send_frame(&gen.padded_frame(hw, LINES), PACKET);
    }
    wait_produced(&acq, 10);

    assert!(matches!(
        acq.get(3, DataKind::Raw),
        Err(AcquisitionError::Overwritten(3))
    ));
    assert!(matches!(
        acq.get(3, DataKind::Image),
        Err(AcquisitionError::Overwritten(3))
    ));
    let mut buf = vec![0u8; 3 * PACKET];
    assert!(matches!(
        acq.get_into(3, &mut buf),
        Err(AcquisitionError::Overwritten(3))
    ));
    assert_eq!(acq.get_into(10, &mut buf).unwrap(), gen.geometry(LINES).raw_size);

    // The consumer lags 10 frames behind a ring of 4 and jumps ahead.
    let (sequence, info) = acq.next_event(EVENT_WAIT).unwrap();
    assert_eq!(sequence, 9);
    assert_eq!(info.hw_sequence, 9);
    assert_eq!(acq.next_event(EVENT_WAIT).unwrap().0, 10);
    assert_eq!(acq.stats().unwrap().skipped_events, 8);
    acq.stop().unwrap();
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_decode_and_consume() {
    let (acq, feed) = acquisition(config(16, true));
    let acq = Arc::new(acq);
    let gen = FrameGenerator::default();
    acq.start().unwrap();

    let producer = thread::spawn(move || {
        for hw in 1..=12 {
            feed.send_frame(&gen.padded_frame(hw, LINES), PACKET);
            thread::sleep(Duration::from_millis(2));
        }
        feed
    });

    let mut decoded = 0;
    for _ in 0..12 {
        let (sequence, info) = acq.next_event(EVENT_WAIT).unwrap();
        thread::scope(|s| {
            let readers: Vec<_> = (0..3)
                .map(|_| {
                    let acq = Arc::clone(&acq);
                    let hw_sequence = info.hw_sequence;
                    s.spawn(move || {
                        acq.get(sequence, DataKind::Image)
                            .map(|data| check_image(data, hw_sequence))
                    })
                })
                .collect();
            for reader in readers {
                match reader.join().unwrap() {
                    Ok(()) => decoded += 1,
                    Err(AcquisitionError::Overwritten(_)) => {}
                    Err(e) => panic!("unexpected error for frame {sequence}: {e}"),
                }
            }
        });
    }
    assert_eq!(decoded, 36);

    let _feed = producer.join().unwrap();
    acq.stop().unwrap();
}

// ============================================================================
// Streaming
// ============================================================================

#[test]
fn test_stream_with_autostop() {
    let cfg = AcquisitionConfig {
        autostop: AutostopPolicy {
            max_events: Some(5),
            duration_ms: None,
        },
        ..config(8, true)
    };
    let (acq, feed) = acquisition(cfg);
    let gen = FrameGenerator::default();
    for hw in 1..=5 {
        feed.send_frame(&gen.padded_frame(hw, LINES), PACKET);
    }

    let mut seen = Vec::new();
    acq.stream(|sequence, info| {
        seen.push((sequence, info.hw_sequence));
        Ok(true)
    })
    .unwrap();

    assert_eq!(seen, (1..=5).map(|i| (i, i as u32)).collect::<Vec<_>>());
    assert!(!acq.is_started());
    assert_eq!(feed.engine_stops(), 1);
}

#[test]
fn test_stream_ends_on_request_stop() {
    let (acq, feed) = acquisition(config(8, false));
    let gen = FrameGenerator::default();
    acq.start().unwrap();
    feed.send_frame(&gen.padded_frame(1, LINES), PACKET);
    feed.send_frame(&gen.padded_frame(2, LINES), PACKET);

    let mut count = 0;
    acq.stream(|_, _| {
        count += 1;
        if count == 2 {
            acq.request_stop();
        }
        Ok(true)
    })
    .unwrap();
    assert_eq!(count, 2);
    assert!(!acq.is_running());
    acq.stop().unwrap();
}
