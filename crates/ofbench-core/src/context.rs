//! Per-test execution context.
//!
//! One `ExecutionContext` exists per running test iteration. It is owned by
//! the module-run unit: capture channels, timers and the outbound control
//! queue are only touched from there. Other units get a clone of the stop
//! token and nothing else.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::capture::{CaptureBackend, CaptureStats};
use crate::timer::{TimerId, TimerQueue};
use crate::wire::{Message, MessageKind, WireError, DEFAULT_PROTOCOL_VERSION};

/// Index of a capture channel. Channel 0 watches the control interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub usize);

impl ChannelId {
    pub const CONTROL: ChannelId = ChannelId(0);

    pub fn is_control(self) -> bool {
        self == Self::CONTROL
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_control() {
            f.write_str("control")
        } else {
            write!(f, "data{}", self.0)
        }
    }
}

/// Capture technology behind a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureTechnology {
    /// Generic kernel packet capture.
    #[default]
    Pcap,
    /// Capture offloaded to dedicated hardware.
    Hardware,
}

pub struct Channel {
    device: String,
    technology: CaptureTechnology,
    backend: Option<Box<dyn CaptureBackend>>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("device", &self.device)
            .field("technology", &self.technology)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Channel {
    pub fn new(device: impl Into<String>, technology: CaptureTechnology) -> Self {
        Self {
            device: device.into(),
            technology,
            backend: None,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn technology(&self) -> CaptureTechnology {
        self.technology
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_some()
    }

    pub fn open(&mut self, backend: Box<dyn CaptureBackend>) {
        self.backend = Some(backend);
    }

    pub fn close(&mut self) -> Option<Box<dyn CaptureBackend>> {
        self.backend.take()
    }

    /// Capture statistics, `None` while the channel is closed.
    pub fn stats(&self) -> Option<CaptureStats> {
        self.backend.as_ref().map(|b| b.stats())
    }

    pub fn backend_mut(&mut self) -> Option<&mut (dyn CaptureBackend + 'static)> {
        self.backend.as_deref_mut()
    }
}

pub struct ExecutionContext {
    channels: Vec<Channel>,
    timers: TimerQueue,
    outbox: VecDeque<Bytes>,
    stop: CancellationToken,
    current_test: Option<String>,
    protocol_version: u8,
    next_xid: u32,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("channels", &self.channels)
            .field("timers", &self.timers.len())
            .field("outbox", &self.outbox.len())
            .field("should_end", &self.should_end())
            .field("current_test", &self.current_test)
            .field("protocol_version", &self.protocol_version)
            .finish()
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(Vec::new(), DEFAULT_PROTOCOL_VERSION)
    }
}

impl ExecutionContext {
    pub fn new(channels: impl IntoIterator<Item = Channel>, protocol_version: u8) -> Self {
        Self {
            channels: channels.into_iter().collect(),
            timers: TimerQueue::new(),
            outbox: VecDeque::new(),
            stop: CancellationToken::new(),
            current_test: None,
            protocol_version,
            next_xid: 1,
        }
    }

    /// Prepare for the next test iteration: channels are closed, timers and
    /// queued messages dropped, and a fresh stop token issued. The channel
    /// set itself is kept.
    pub fn reset(&mut self) {
        for channel in &mut self.channels {
            channel.close();
        }
        self.timers.clear();
        self.outbox.clear();
        self.stop = CancellationToken::new();
        self.current_test = None;
    }

    pub fn set_current_test(&mut self, name: impl Into<String>) {
        self.current_test = Some(name.into());
    }

    pub fn current_test(&self) -> Option<&str> {
        self.current_test.as_deref()
    }

    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channels_mut(&mut self) -> &mut [Channel] {
        &mut self.channels
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(id.0)
    }

    pub fn channel_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.channels.get_mut(id.0)
    }

    /// Ask the event loop (and the auxiliary task) to finish this test.
    pub fn end_test(&self) {
        self.stop.cancel();
    }

    pub fn should_end(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    pub fn timers_mut(&mut self) -> &mut TimerQueue {
        &mut self.timers
    }

    pub fn schedule_timer(&mut self, delay: Duration, kind: u32, arg: u64) -> TimerId {
        self.timers.schedule_in(delay, kind, arg)
    }

    pub fn next_xid(&mut self) -> u32 {
        let xid = self.next_xid;
        self.next_xid = self.next_xid.wrapping_add(1);
        xid
    }

    /// Queue a message for the control channel and return its xid.
    pub fn send_message(&mut self, kind: MessageKind, payload: &[u8]) -> Result<u32, WireError> {
        let xid = self.next_xid();
        self.send_message_with_xid(kind, xid, payload)?;
        Ok(xid)
    }

    pub fn send_message_with_xid(
        &mut self,
        kind: MessageKind,
        xid: u32,
        payload: &[u8],
    ) -> Result<(), WireError> {
        let msg = Message::build(self.protocol_version, kind, xid, payload)?;
        self.send_raw(msg.into_bytes());
        Ok(())
    }

    /// Queue already-encoded bytes for the control channel.
    pub fn send_raw(&mut self, bytes: Bytes) {
        self.outbox.push_back(bytes);
    }

    pub fn take_outbound(&mut self) -> Option<Bytes> {
        self.outbox.pop_front()
    }

    pub fn pending_outbound(&self) -> usize {
        self.outbox.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xids_increase() {
        let mut ctx = ExecutionContext::default();
        assert_eq!(ctx.next_xid(), 1);
        assert_eq!(ctx.next_xid(), 2);
    }

    #[test]
    fn test_send_message_queues_encoded_bytes() {
        let mut ctx = ExecutionContext::new(Vec::new(), 0x04);
        let xid = ctx.send_message(MessageKind::EchoRequest, b"hi").unwrap();
        let bytes = ctx.take_outbound().unwrap();
        assert_eq!(bytes[0], 0x04);
        assert_eq!(bytes[1], MessageKind::EchoRequest.as_u8());
        assert_eq!(&bytes[4..8], &xid.to_be_bytes());
        assert_eq!(&bytes[8..], b"hi");
        assert_eq!(ctx.pending_outbound(), 0);
    }

    #[test]
    fn test_reset_issues_fresh_stop_token() {
        let mut ctx = ExecutionContext::new(
            vec![Channel::new("eth0", CaptureTechnology::Pcap)],
            DEFAULT_PROTOCOL_VERSION,
        );
        ctx.set_current_test("first");
        let old = ctx.stop_token();
        ctx.end_test();
        ctx.schedule_timer(Duration::from_secs(1), 0, 0);
        ctx.send_raw(Bytes::from_static(b"x"));

        ctx.reset();
        assert!(old.is_cancelled());
        assert!(!ctx.should_end());
        assert!(ctx.timers().is_empty());
        assert_eq!(ctx.pending_outbound(), 0);
        assert_eq!(ctx.current_test(), None);
        assert_eq!(ctx.channels().len(), 1);
    }

    #[test]
    fn test_channel_display() {
        assert_eq!(ChannelId::CONTROL.to_string(), "control");
        assert_eq!(ChannelId(2).to_string(), "data2");
    }
}
