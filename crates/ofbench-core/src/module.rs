//! The test-module capability set.
//!
//! A test module must provide a name and a start routine. Every other slot
//! has a default implementation in [`default_module`], so dispatch into a
//! module never hits an unbound handler.

use crate::capture::PacketEvent;
use crate::context::{ChannelId, ExecutionContext};
use crate::timer::TimerEvent;
use crate::wire::{Message, WireError};

/// Failure reported by a module handler. Handler failures are local to the
/// module: the harness logs them and carries on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ModuleError(String);

impl ModuleError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<WireError> for ModuleError {
    fn from(e: WireError) -> Self {
        Self(e.to_string())
    }
}

pub type HandlerResult = Result<(), ModuleError>;

pub trait TestModule: Send {
    fn name(&self) -> &str;

    /// Kick off the test. Runs after channel setup, right before the event
    /// loop starts.
    fn start(&mut self, ctx: &mut ExecutionContext) -> HandlerResult;

    fn init(&mut self, ctx: &mut ExecutionContext, args: &str) -> HandlerResult {
        default_module::init(ctx, args)
    }

    /// Capture filter for `channel`. An empty filter keeps the channel closed.
    fn get_pcap_filter(&mut self, ctx: &ExecutionContext, channel: ChannelId) -> String {
        default_module::get_pcap_filter(ctx, channel)
    }

    fn handle_pcap_event(
        &mut self,
        ctx: &mut ExecutionContext,
        event: &PacketEvent,
        channel: ChannelId,
    ) -> HandlerResult {
        default_module::handle_pcap_event(ctx, event, channel)
    }

    fn of_event_packet_in(&mut self, ctx: &mut ExecutionContext, msg: &Message) -> HandlerResult {
        default_module::of_event_packet_in(ctx, msg)
    }

    fn of_event_error(&mut self, ctx: &mut ExecutionContext, msg: &Message) -> HandlerResult {
        default_module::of_event_error(ctx, msg)
    }

    fn of_event_stats_reply(&mut self, ctx: &mut ExecutionContext, msg: &Message) -> HandlerResult {
        default_module::of_event_stats_reply(ctx, msg)
    }

    fn of_event_flow_removed(
        &mut self,
        ctx: &mut ExecutionContext,
        msg: &Message,
    ) -> HandlerResult {
        default_module::of_event_flow_removed(ctx, msg)
    }

    fn of_event_port_status(&mut self, ctx: &mut ExecutionContext, msg: &Message) -> HandlerResult {
        default_module::of_event_port_status(ctx, msg)
    }

    fn of_event_echo_request(
        &mut self,
        ctx: &mut ExecutionContext,
        msg: &Message,
    ) -> HandlerResult {
        default_module::of_event_echo_request(ctx, msg)
    }

    /// Any known message kind without a dedicated slot.
    fn of_event_other(&mut self, ctx: &mut ExecutionContext, msg: &Message) -> HandlerResult {
        default_module::of_event_other(ctx, msg)
    }

    fn handle_timer_event(
        &mut self,
        ctx: &mut ExecutionContext,
        event: &TimerEvent,
    ) -> HandlerResult {
        default_module::handle_timer_event(ctx, event)
    }
}

/// Default behaviour for every optional slot.
///
/// These are plain functions so they can also fill slots of a symbol table
/// loaded from a shared object.
pub mod default_module {
    use super::*;
    use crate::wire::MessageKind;

    pub fn init(_ctx: &mut ExecutionContext, _args: &str) -> HandlerResult {
        Ok(())
    }

    pub fn get_pcap_filter(_ctx: &ExecutionContext, _channel: ChannelId) -> String {
        String::new()
    }

    pub fn handle_pcap_event(
        _ctx: &mut ExecutionContext,
        event: &PacketEvent,
        channel: ChannelId,
    ) -> HandlerResult {
        tracing::trace!(%channel, caplen = event.caplen, "default packet handler");
        Ok(())
    }

    fn ignore(msg: &Message) -> HandlerResult {
        tracing::debug!(
            kind = msg.header().kind,
            xid = msg.xid(),
            len = msg.header().length,
            "default handler ignoring message"
        );
        Ok(())
    }

    pub fn of_event_packet_in(_ctx: &mut ExecutionContext, msg: &Message) -> HandlerResult {
        ignore(msg)
    }

    pub fn of_event_error(_ctx: &mut ExecutionContext, msg: &Message) -> HandlerResult {
        ignore(msg)
    }

    pub fn of_event_stats_reply(_ctx: &mut ExecutionContext, msg: &Message) -> HandlerResult {
        ignore(msg)
    }

    pub fn of_event_flow_removed(_ctx: &mut ExecutionContext, msg: &Message) -> HandlerResult {
        ignore(msg)
    }

    pub fn of_event_port_status(_ctx: &mut ExecutionContext, msg: &Message) -> HandlerResult {
        ignore(msg)
    }

    /// Answer the device's liveness probe with an echo reply carrying the
    /// same xid and payload.
    pub fn of_event_echo_request(ctx: &mut ExecutionContext, msg: &Message) -> HandlerResult {
        ctx.send_message_with_xid(MessageKind::EchoReply, msg.xid(), msg.payload())?;
        Ok(())
    }

    pub fn of_event_other(_ctx: &mut ExecutionContext, msg: &Message) -> HandlerResult {
        ignore(msg)
    }

    pub fn handle_timer_event(_ctx: &mut ExecutionContext, event: &TimerEvent) -> HandlerResult {
        tracing::debug!(timer = event.id.0, kind = event.kind, "default timer handler");
        Ok(())
    }
}

/// A module made only of defaults. Useful as a placeholder test and as the
/// reference for what an unimplemented slot does.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultModule;

impl TestModule for DefaultModule {
    fn name(&self) -> &str {
        "default"
    }

    fn start(&mut self, ctx: &mut ExecutionContext) -> HandlerResult {
        ctx.end_test();
        Ok(())
    }
}
