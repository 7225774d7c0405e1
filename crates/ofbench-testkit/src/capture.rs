//! In-memory capture backend.
//!
//! Packets are pushed through an unbounded channel by a [`MemCaptureFeed`]
//! and handed out one per readiness notification, exactly like a real
//! capture descriptor would.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::task::{Context, Poll};

use ofbench_core::{
    CaptureBackend, CaptureError, CaptureOpener, CaptureStats, CaptureTechnology, PacketEvent,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

#[derive(Debug)]
enum Injected {
    Packet(PacketEvent),
    /// A readiness notification that carries no packet.
    Nothing,
    Error(String),
}

/// Create a connected capture backend and its feed.
pub fn mem_capture() -> (MemCapture, MemCaptureFeed) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stats = Arc::new(Mutex::new(CaptureStats::default()));
    (
        MemCapture {
            rx,
            pending: None,
            stats: stats.clone(),
        },
        MemCaptureFeed { tx, stats },
    )
}

#[derive(Debug)]
pub struct MemCapture {
    rx: mpsc::UnboundedReceiver<Injected>,
    pending: Option<Injected>,
    stats: Arc<Mutex<CaptureStats>>,
}

impl CaptureBackend for MemCapture {
    fn poll_readable(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.pending.is_some() {
            return Poll::Ready(Ok(()));
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(item)) => {
                self.pending = Some(item);
                Poll::Ready(Ok(()))
            }
            // Feed dropped: nothing will ever arrive again.
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        }
    }

    fn dispatch_one(&mut self) -> Result<Option<PacketEvent>, CaptureError> {
        match self.pending.take() {
            Some(Injected::Packet(event)) => {
                self.stats.lock().received += 1;
                Ok(Some(event))
            }
            Some(Injected::Error(reason)) => Err(CaptureError::Backend(reason)),
            Some(Injected::Nothing) | None => Ok(None),
        }
    }

    fn stats(&self) -> CaptureStats {
        *self.stats.lock()
    }
}

/// Sending side of a [`MemCapture`].
#[derive(Debug, Clone)]
pub struct MemCaptureFeed {
    tx: mpsc::UnboundedSender<Injected>,
    stats: Arc<Mutex<CaptureStats>>,
}

impl MemCaptureFeed {
    pub fn inject(&self, event: PacketEvent) {
        let _ = self.tx.send(Injected::Packet(event));
    }

    pub fn inject_bytes(&self, data: impl Into<bytes::Bytes>) {
        self.inject(PacketEvent::now(data));
    }

    /// Signal readiness without a packet behind it.
    pub fn inject_spurious(&self) {
        let _ = self.tx.send(Injected::Nothing);
    }

    pub fn inject_error(&self, reason: impl Into<String>) {
        let _ = self.tx.send(Injected::Error(reason.into()));
    }

    /// Count packets the "kernel" dropped before they reached the backend.
    pub fn record_drops(&self, n: u64) {
        self.stats.lock().dropped += n;
    }

    pub fn stats(&self) -> CaptureStats {
        *self.stats.lock()
    }
}

/// Opener that hands out prepared in-memory captures by device name.
///
/// Each prepared capture can be opened once. Every open attempt is recorded
/// with its filter, including failed ones.
#[derive(Debug, Default)]
pub struct MemOpener {
    prepared: Mutex<HashMap<String, MemCapture>>,
    opened: Mutex<Vec<(String, String)>>,
}

impl MemOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare a capture for `device` and return its feed.
    pub fn prepare(&self, device: impl Into<String>) -> MemCaptureFeed {
        let (capture, feed) = mem_capture();
        self.prepared.lock().insert(device.into(), capture);
        feed
    }

    /// `(device, filter)` for every open attempt so far.
    pub fn opened(&self) -> Vec<(String, String)> {
        self.opened.lock().clone()
    }
}

impl CaptureOpener for MemOpener {
    fn open(
        &self,
        device: &str,
        technology: CaptureTechnology,
        filter: &str,
    ) -> Result<Box<dyn CaptureBackend>, CaptureError> {
        tracing::debug!(device, ?technology, filter, "opening in-memory capture");
        self.opened
            .lock()
            .push((device.to_owned(), filter.to_owned()));
        match self.prepared.lock().remove(device) {
            Some(capture) => Ok(Box::new(capture)),
            None => Err(CaptureError::Open {
                device: device.to_owned(),
                reason: "no in-memory capture prepared".into(),
            }),
        }
    }
}
