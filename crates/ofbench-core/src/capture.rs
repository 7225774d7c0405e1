//! Capture channel interfaces and the capture-event dispatcher.
//!
//! The capture backend itself (filter compilation, descriptor creation, raw
//! packet delivery) lives outside the harness. This module defines what the
//! event loop needs from it and bridges one readiness notification into at
//! most one packet delivered to the test module.

use std::io;
use std::task::{Context, Poll};
use std::time::SystemTime;

use bytes::Bytes;

use crate::context::{CaptureTechnology, ChannelId, ExecutionContext};
use crate::module::TestModule;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("cannot open capture on {device}: {reason}")]
    Open { device: String, reason: String },
    #[error("capture backend: {0}")]
    Backend(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A captured packet and its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketEvent {
    pub timestamp: SystemTime,
    /// Bytes actually captured.
    pub caplen: u32,
    /// Length of the packet on the wire.
    pub len: u32,
    pub data: Bytes,
}

impl PacketEvent {
    /// A fully captured packet stamped with the current time.
    pub fn now(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
        Self {
            timestamp: SystemTime::now(),
            caplen: len,
            len,
            data,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    pub received: u64,
    pub dropped: u64,
}

/// One open capture stream.
///
/// An open backend is always pollable; a channel without a backend is
/// closed and is left out of the readiness set.
pub trait CaptureBackend: Send {
    /// Resolve once at least one packet is buffered.
    fn poll_readable(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Hand over at most one buffered packet. `Ok(None)` means the readiness
    /// notification turned out to carry nothing.
    fn dispatch_one(&mut self) -> Result<Option<PacketEvent>, CaptureError>;

    fn stats(&self) -> CaptureStats;
}

/// Opens capture backends during per-test channel setup.
pub trait CaptureOpener: Send + Sync {
    fn open(
        &self,
        device: &str,
        technology: CaptureTechnology,
        filter: &str,
    ) -> Result<Box<dyn CaptureBackend>, CaptureError>;
}

/// Opener for builds without a capture backend. Every channel stays closed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCapture;

impl CaptureOpener for NoCapture {
    fn open(
        &self,
        device: &str,
        _technology: CaptureTechnology,
        _filter: &str,
    ) -> Result<Box<dyn CaptureBackend>, CaptureError> {
        Err(CaptureError::Open {
            device: device.to_owned(),
            reason: "no capture backend available".into(),
        })
    }
}

/// Ask the module for a filter on every channel and open the ones that
/// want traffic. An empty filter leaves the channel closed; so does a
/// backend that fails to open.
pub fn configure_channels(
    module: &mut dyn TestModule,
    ctx: &mut ExecutionContext,
    opener: &dyn CaptureOpener,
) {
    for index in 0..ctx.channels().len() {
        let id = ChannelId(index);
        let filter = module.get_pcap_filter(ctx, id);
        let Some(channel) = ctx.channel_mut(id) else {
            continue;
        };
        channel.close();
        if filter.is_empty() {
            tracing::debug!(channel = %id, device = channel.device(), "no filter, channel left closed");
            continue;
        }
        match opener.open(channel.device(), channel.technology(), &filter) {
            Ok(backend) => {
                tracing::info!(channel = %id, device = channel.device(), filter = %filter, "capture opened");
                channel.open(backend);
            }
            Err(e) => {
                tracing::warn!(channel = %id, device = channel.device(), error = %e, "capture setup failed");
            }
        }
    }
}

/// Deliver at most one packet from `channel` to the module.
///
/// Returns whether a packet was handed over. Backend errors are logged and
/// swallowed; the next readiness notification retries. The packet is
/// released as soon as the handler returns, whatever it reported.
///
/// `channel` must have capture open: the multiplexer only reports
/// readiness for channels it polled.
pub fn dispatch_capture_event(
    module: &mut dyn TestModule,
    ctx: &mut ExecutionContext,
    channel: ChannelId,
) -> bool {
    let Some(backend) = ctx.channel_mut(channel).and_then(|c| c.backend_mut()) else {
        tracing::error!(%channel, "readiness on a closed capture channel");
        debug_assert!(false, "readiness reported for closed capture channel {channel}");
        return false;
    };

    let event = match backend.dispatch_one() {
        Ok(Some(event)) => event,
        Ok(None) => return false,
        Err(e) => {
            tracing::warn!(%channel, error = %e, "capture dispatch failed");
            return false;
        }
    };

    if let Err(e) = module.handle_pcap_event(ctx, &event, channel) {
        tracing::debug!(module = module.name(), %channel, error = %e, "packet handler failed");
    }
    true
}
