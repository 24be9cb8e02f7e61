//! Integration tests for packet capture and replay.
//!
//! Records the packet stream of one acquisition and feeds the capture file
//! through a second acquisition, which must see the same frames.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use streamcam_lib::capture::{CaptureFile, CaptureHeader, CaptureRecord, Recorder};
use streamcam_lib::replay::{replay_frame_infos, ReplayConfig, ReplayTransport};
use streamcam_lib::test_utils::{FrameGenerator, MockTransport};
use streamcam_lib::{
    Acquisition, AcquisitionConfig, AcquisitionError, CmosisDecoder, DataKind, FrameData,
    RegisterFile, Wait,
};

fn config() -> AcquisitionConfig {
    AcquisitionConfig {
        buffer_size: 8,
        max_threads: 1,
        max_lines: 2,
        realtime_priority: false,
        dma_timeout_ms: 5,
        ..AcquisitionConfig::default()
    }
}

/// Runs an acquisition over four frames while recording, with a transport
/// timeout after the second frame. Returns the capture file.
fn record(dir: &Path) -> PathBuf {
    let path = dir.join("session.scap");
    let header = CaptureHeader {
        description: "four synthetic frames".into(),
        ..CaptureHeader::new(&config(), 5, 16)
    };
    let recorder = Recorder::create(&path, header).unwrap();

    let (mock, feed) = MockTransport::channel();
    let acq = Acquisition::new(
        config(),
        Box::new(recorder.transport(Box::new(mock))),
        Arc::new(RegisterFile::new()),
        Arc::new(CmosisDecoder),
    )
    .unwrap();
    acq.set_raw_data_observer(Some(recorder.frame_counter()))
        .unwrap();
    acq.start().unwrap();

    let gen = FrameGenerator::default();
    for hw in 100..104 {
        feed.send_frame(&gen.padded_frame(hw, 2), 4096);
        if hw == 101 {
            feed.timeout();
        }
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while acq.last_event_id().unwrap() < 4 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    acq.stop().unwrap();

    let summary = recorder.finish().unwrap();
    assert_eq!(summary.packets, 12);
    assert_eq!(summary.frames, 4);
    assert!(summary.timeouts >= 1);
    path
}

#[test]
fn test_replayed_capture_yields_same_frames() {
    let dir = tempfile::tempdir().unwrap();
    let path = record(dir.path());

    let transport = ReplayTransport::load(&path, ReplayConfig::default()).expect("capture loads");
    assert_eq!(transport.packet_count(), 12);
    assert_eq!(transport.header().description, "four synthetic frames");
    assert_eq!(transport.header().max_lines, 2);

    let acq = Acquisition::new(
        config(),
        Box::new(transport),
        Arc::new(RegisterFile::new()),
        Arc::new(CmosisDecoder),
    )
    .unwrap();
    acq.start().unwrap();

    for hw in 100..104u32 {
        let (sequence, info) = acq.next_event(Wait::For(Duration::from_secs(5))).unwrap();
        assert_eq!(info.hw_sequence, hw);
        let Ok(FrameData::Image(image)) = acq.get(sequence, DataKind::Image) else {
            panic!("frame {sequence} not decoded");
        };
        assert_eq!(image.pixels()[42], FrameGenerator::expected_pixel(hw, 0, 42));
    }
    assert!(matches!(
        acq.next_event(Wait::For(Duration::from_millis(50))),
        Err(AcquisitionError::Timeout)
    ));
    acq.stop().unwrap();
}

#[test]
fn test_replay_frame_infos_from_capture() {
    let dir = tempfile::tempdir().unwrap();
    let path = record(dir.path());

    let infos = replay_frame_infos(&path).unwrap();
    let hw: Vec<u32> = infos.iter().map(|i| i.hw_sequence).collect();
    assert_eq!(hw, vec![100, 101, 102, 103]);
    assert!(infos.iter().all(|i| i.raw_size == 8288 && !i.broken));
}

#[test]
fn test_recorded_timeout_lands_between_frames() {
    let dir = tempfile::tempdir().unwrap();
    let capture = CaptureFile::read(&record(dir.path())).unwrap();

    // the feed's timeout follows the sixth packet (two frames of three);
    // idle timeouts may show up anywhere else
    let sixth = capture
        .records
        .iter()
        .enumerate()
        .filter(|(_, r)| matches!(r, CaptureRecord::Packet(_)))
        .nth(5)
        .map(|(i, _)| i)
        .unwrap();
    assert_eq!(capture.records[sixth + 1], CaptureRecord::Timeout);
    assert_eq!(capture.packets().count(), 12);
    assert!(capture.summary.is_some());
}
