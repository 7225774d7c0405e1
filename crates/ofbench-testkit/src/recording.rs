//! A test module that records every callback it receives.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ofbench_core::{
    default_module, ChannelId, ExecutionContext, HandlerResult, Message, ModuleError, PacketEvent,
    TestModule, TimerEvent,
};
use parking_lot::Mutex;

/// Which protocol handler slot a message reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    PacketIn,
    Error,
    StatsReply,
    FlowRemoved,
    PortStatus,
    EchoRequest,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Init(String),
    Start,
    Packet { channel: ChannelId, data: Bytes },
    Message { slot: Slot, kind: u8, xid: u32, len: u16 },
    Timer { kind: u32, arg: u64 },
}

/// Shared view of what a [`RecordingModule`] has seen. Stays readable after
/// the module itself has moved into a run task.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Recorded>>>,
}

impl Recorder {
    fn push(&self, event: Recorded) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().clone()
    }

    /// Only the protocol messages, as `(slot, xid)`.
    pub fn messages(&self) -> Vec<(Slot, u32)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Recorded::Message { slot, xid, .. } => Some((*slot, *xid)),
                _ => None,
            })
            .collect()
    }

    pub fn packets(&self) -> Vec<(ChannelId, Bytes)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Recorded::Packet { channel, data } => Some((*channel, data.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn timers(&self) -> Vec<u32> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Recorded::Timer { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

/// Records every callback into a [`Recorder`].
///
/// Echo requests are recorded and then answered by the default handler.
#[derive(Debug)]
pub struct RecordingModule {
    name: String,
    recorder: Recorder,
    filters: Vec<(ChannelId, String)>,
    timers: Vec<(Duration, u32, u64)>,
    end_after: Option<usize>,
    handled: usize,
    fail_handlers: bool,
}

impl RecordingModule {
    pub fn new(name: impl Into<String>) -> (Self, Recorder) {
        let recorder = Recorder::default();
        (
            Self {
                name: name.into(),
                recorder: recorder.clone(),
                filters: Vec::new(),
                timers: Vec::new(),
                end_after: None,
                handled: 0,
                fail_handlers: false,
            },
            recorder,
        )
    }

    /// Ask for capture on `channel` with `filter`.
    pub fn with_filter(mut self, channel: ChannelId, filter: impl Into<String>) -> Self {
        self.filters.push((channel, filter.into()));
        self
    }

    /// Schedule a timer when the test starts.
    pub fn with_timer(mut self, delay: Duration, kind: u32, arg: u64) -> Self {
        self.timers.push((delay, kind, arg));
        self
    }

    /// End the test once `n` messages, packets or timers have been handled.
    pub fn end_after(mut self, n: usize) -> Self {
        self.end_after = Some(n);
        self
    }

    /// Make every handler report a failure after recording.
    pub fn failing(mut self) -> Self {
        self.fail_handlers = true;
        self
    }

    fn handled(&mut self, ctx: &mut ExecutionContext, event: Recorded) -> HandlerResult {
        self.recorder.push(event);
        self.handled += 1;
        if self.end_after.is_some_and(|n| self.handled >= n) {
            ctx.end_test();
        }
        if self.fail_handlers {
            return Err(ModuleError::new(format!("{} refuses", self.name)));
        }
        Ok(())
    }

    fn message(&mut self, ctx: &mut ExecutionContext, slot: Slot, msg: &Message) -> HandlerResult {
        let header = msg.header();
        self.handled(
            ctx,
            Recorded::Message {
                slot,
                kind: header.kind,
                xid: header.xid,
                len: header.length,
            },
        )
    }
}

impl TestModule for RecordingModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, ctx: &mut ExecutionContext) -> HandlerResult {
        self.recorder.push(Recorded::Start);
        for &(delay, kind, arg) in &self.timers {
            ctx.schedule_timer(delay, kind, arg);
        }
        Ok(())
    }

    fn init(&mut self, _ctx: &mut ExecutionContext, args: &str) -> HandlerResult {
        self.recorder.push(Recorded::Init(args.to_owned()));
        Ok(())
    }

    fn get_pcap_filter(&mut self, _ctx: &ExecutionContext, channel: ChannelId) -> String {
        self.filters
            .iter()
            .find(|(id, _)| *id == channel)
            .map(|(_, filter)| filter.clone())
            .unwrap_or_default()
    }

    fn handle_pcap_event(
        &mut self,
        ctx: &mut ExecutionContext,
        event: &PacketEvent,
        channel: ChannelId,
    ) -> HandlerResult {
        self.handled(
            ctx,
            Recorded::Packet {
                channel,
                data: event.data.clone(),
            },
        )
    }

    fn of_event_packet_in(&mut self, ctx: &mut ExecutionContext, msg: &Message) -> HandlerResult {
        self.message(ctx, Slot::PacketIn, msg)
    }

    fn of_event_error(&mut self, ctx: &mut ExecutionContext, msg: &Message) -> HandlerResult {
        self.message(ctx, Slot::Error, msg)
    }

    fn of_event_stats_reply(&mut self, ctx: &mut ExecutionContext, msg: &Message) -> HandlerResult {
        self.message(ctx, Slot::StatsReply, msg)
    }

    fn of_event_flow_removed(
        &mut self,
        ctx: &mut ExecutionContext,
        msg: &Message,
    ) -> HandlerResult {
        self.message(ctx, Slot::FlowRemoved, msg)
    }

    fn of_event_port_status(&mut self, ctx: &mut ExecutionContext, msg: &Message) -> HandlerResult {
        self.message(ctx, Slot::PortStatus, msg)
    }

    fn of_event_echo_request(
        &mut self,
        ctx: &mut ExecutionContext,
        msg: &Message,
    ) -> HandlerResult {
        default_module::of_event_echo_request(ctx, msg)?;
        self.message(ctx, Slot::EchoRequest, msg)
    }

    fn of_event_other(&mut self, ctx: &mut ExecutionContext, msg: &Message) -> HandlerResult {
        self.message(ctx, Slot::Other, msg)
    }

    fn handle_timer_event(
        &mut self,
        ctx: &mut ExecutionContext,
        event: &TimerEvent,
    ) -> HandlerResult {
        self.handled(
            ctx,
            Recorded::Timer {
                kind: event.kind,
                arg: event.arg,
            },
        )
    }
}
