//! In-process DMA transport
//!
//! [`MockTransport`] delivers packets pushed through a [`PacketFeed`]. Tests
//! decide exactly when data, errors or timeouts reach the reader thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::{AcquisitionError, Result};
use crate::frame_assembler::StreamRequest;
use crate::reader::{DmaTransport, PacketCallback};

use super::frame_generator::packetize;

enum FeedItem {
    Packet(Vec<u8>),
    Error(AcquisitionError),
    Timeout,
}

#[derive(Debug, Default)]
struct EngineCounters {
    starts: AtomicUsize,
    stops: AtomicUsize,
}

/// Sending side of a [`MockTransport`].
#[derive(Clone)]
pub struct PacketFeed {
    tx: Sender<FeedItem>,
    engine: Arc<EngineCounters>,
}

impl PacketFeed {
    /// Queues one packet.
    pub fn send(&self, packet: Vec<u8>) {
        let _ = self.tx.send(FeedItem::Packet(packet));
    }

    /// Queues a frame cut into packets.
    pub fn send_frame(&self, data: &[u8], packet_size: usize) {
        for packet in packetize(data, packet_size) {
            self.send(packet);
        }
    }

    /// Makes the current streaming call fail with `error`.
    pub fn fail(&self, error: AcquisitionError) {
        let _ = self.tx.send(FeedItem::Error(error));
    }

    /// Makes the current streaming call time out immediately.
    pub fn timeout(&self) {
        let _ = self.tx.send(FeedItem::Timeout);
    }

    /// Number of `start_engine` calls.
    pub fn engine_starts(&self) -> usize {
        self.engine.starts.load(Ordering::Acquire)
    }

    /// Number of `stop_engine` calls.
    pub fn engine_stops(&self) -> usize {
        self.engine.stops.load(Ordering::Acquire)
    }
}

/// Transport fed from a channel.
pub struct MockTransport {
    rx: Receiver<FeedItem>,
    engine: Arc<EngineCounters>,
}

impl MockTransport {
    /// Creates a transport and the feed driving it.
    pub fn channel() -> (Self, PacketFeed) {
        let (tx, rx) = mpsc::channel();
        let engine = Arc::new(EngineCounters::default());
        (
            Self {
                rx,
                engine: Arc::clone(&engine),
            },
            PacketFeed { tx, engine },
        )
    }

    /// Transport that delivers `packets` and then only times out.
    pub fn scripted(packets: Vec<Vec<u8>>) -> Self {
        let (transport, feed) = Self::channel();
        for packet in packets {
            feed.send(packet);
        }
        transport
    }
}

impl DmaTransport for MockTransport {
    fn start_engine(&mut self) -> Result<()> {
        self.engine.starts.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn stop_engine(&mut self) -> Result<()> {
        self.engine.stops.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn stream(&mut self, timeout: Duration, callback: &mut PacketCallback<'_>) -> Result<()> {
        loop {
            let item = match self.rx.recv_timeout(timeout) {
                Ok(item) => item,
                Err(RecvTimeoutError::Timeout) => return Err(AcquisitionError::Timeout),
                Err(RecvTimeoutError::Disconnected) => {
                    thread::sleep(timeout);
                    return Err(AcquisitionError::Timeout);
                }
            };
            match item {
                FeedItem::Packet(packet) => {
                    if callback(&packet)? == StreamRequest::Stop {
                        return Ok(());
                    }
                }
                FeedItem::Error(e) => return Err(e),
                FeedItem::Timeout => return Err(AcquisitionError::Timeout),
            }
        }
    }
}
