//! Modules described as a table of optional function slots.
//!
//! This is the shape a module has when it comes out of a shared object:
//! a handful of exported functions, most of them optional. Binding the
//! table fills every missing slot from [`default_module`] and yields a
//! [`SymbolModule`] with no unbound handler left.

use std::fmt;

use ofbench_core::{
    default_module, ChannelId, ExecutionContext, HandlerResult, Message, PacketEvent, TestModule,
    TimerEvent,
};

use crate::LoadError;

pub type NameFn = fn() -> &'static str;
pub type StartFn = fn(&mut ExecutionContext) -> HandlerResult;
pub type InitFn = fn(&mut ExecutionContext, &str) -> HandlerResult;
pub type FilterFn = fn(&ExecutionContext, ChannelId) -> String;
pub type PcapEventFn = fn(&mut ExecutionContext, &PacketEvent, ChannelId) -> HandlerResult;
pub type MessageFn = fn(&mut ExecutionContext, &Message) -> HandlerResult;
pub type TimerFn = fn(&mut ExecutionContext, &TimerEvent) -> HandlerResult;

/// Exported symbol names, in slot order. `name` and `start` are required.
pub const SLOT_NAMES: &[&str] = &[
    "name",
    "start",
    "init",
    "get_pcap_filter",
    "handle_pcap_event",
    "of_event_packet_in",
    "of_event_error",
    "of_event_stats_reply",
    "of_event_flow_removed",
    "of_event_port_status",
    "of_event_echo_request",
    "of_event_other",
    "handle_timer_event",
];

/// A module's capability set with every slot optional.
#[derive(Clone, Copy, Default)]
pub struct ModuleSymbols {
    pub name: Option<NameFn>,
    pub start: Option<StartFn>,
    pub init: Option<InitFn>,
    pub get_pcap_filter: Option<FilterFn>,
    pub handle_pcap_event: Option<PcapEventFn>,
    pub of_event_packet_in: Option<MessageFn>,
    pub of_event_error: Option<MessageFn>,
    pub of_event_stats_reply: Option<MessageFn>,
    pub of_event_flow_removed: Option<MessageFn>,
    pub of_event_port_status: Option<MessageFn>,
    pub of_event_echo_request: Option<MessageFn>,
    pub of_event_other: Option<MessageFn>,
    pub handle_timer_event: Option<TimerFn>,
}

impl ModuleSymbols {
    /// Names of the slots the module provides itself.
    pub fn bound_slots(&self) -> Vec<&'static str> {
        let bound = [
            self.name.is_some(),
            self.start.is_some(),
            self.init.is_some(),
            self.get_pcap_filter.is_some(),
            self.handle_pcap_event.is_some(),
            self.of_event_packet_in.is_some(),
            self.of_event_error.is_some(),
            self.of_event_stats_reply.is_some(),
            self.of_event_flow_removed.is_some(),
            self.of_event_port_status.is_some(),
            self.of_event_echo_request.is_some(),
            self.of_event_other.is_some(),
            self.handle_timer_event.is_some(),
        ];
        SLOT_NAMES
            .iter()
            .zip(bound)
            .filter_map(|(name, bound)| bound.then_some(*name))
            .collect()
    }

    /// Check the required slots and fill every optional one.
    pub fn bind(self, reference: &str) -> Result<SymbolModule, LoadError> {
        let missing = |symbol| LoadError::MissingRequiredSymbol {
            reference: reference.to_owned(),
            symbol,
        };
        let name = self.name.ok_or_else(|| missing("name"))?;
        let start = self.start.ok_or_else(|| missing("start"))?;

        let defaulted = SLOT_NAMES.len() - self.bound_slots().len();
        tracing::debug!(reference, defaulted, "binding module symbols");

        Ok(SymbolModule {
            name: name(),
            start,
            init: self.init.unwrap_or(default_module::init),
            get_pcap_filter: self.get_pcap_filter.unwrap_or(default_module::get_pcap_filter),
            handle_pcap_event: self
                .handle_pcap_event
                .unwrap_or(default_module::handle_pcap_event),
            of_event_packet_in: self
                .of_event_packet_in
                .unwrap_or(default_module::of_event_packet_in),
            of_event_error: self.of_event_error.unwrap_or(default_module::of_event_error),
            of_event_stats_reply: self
                .of_event_stats_reply
                .unwrap_or(default_module::of_event_stats_reply),
            of_event_flow_removed: self
                .of_event_flow_removed
                .unwrap_or(default_module::of_event_flow_removed),
            of_event_port_status: self
                .of_event_port_status
                .unwrap_or(default_module::of_event_port_status),
            of_event_echo_request: self
                .of_event_echo_request
                .unwrap_or(default_module::of_event_echo_request),
            of_event_other: self.of_event_other.unwrap_or(default_module::of_event_other),
            handle_timer_event: self
                .handle_timer_event
                .unwrap_or(default_module::handle_timer_event),
        })
    }
}

impl fmt::Debug for ModuleSymbols {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleSymbols")
            .field("bound", &self.bound_slots())
            .finish()
    }
}

/// A module whose every slot is bound, either to its own function or to
/// the default.
#[derive(Clone, Copy)]
pub struct SymbolModule {
    name: &'static str,
    start: StartFn,
    init: InitFn,
    get_pcap_filter: FilterFn,
    handle_pcap_event: PcapEventFn,
    of_event_packet_in: MessageFn,
    of_event_error: MessageFn,
    of_event_stats_reply: MessageFn,
    of_event_flow_removed: MessageFn,
    of_event_port_status: MessageFn,
    of_event_echo_request: MessageFn,
    of_event_other: MessageFn,
    handle_timer_event: TimerFn,
}

impl fmt::Debug for SymbolModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolModule")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl TestModule for SymbolModule {
    fn name(&self) -> &str {
        self.name
    }

    fn start(&mut self, ctx: &mut ExecutionContext) -> HandlerResult {
        (self.start)(ctx)
    }

    fn init(&mut self, ctx: &mut ExecutionContext, args: &str) -> HandlerResult {
        (self.init)(ctx, args)
    }

    fn get_pcap_filter(&mut self, ctx: &ExecutionContext, channel: ChannelId) -> String {
        (self.get_pcap_filter)(ctx, channel)
    }

    fn handle_pcap_event(
        &mut self,
        ctx: &mut ExecutionContext,
        event: &PacketEvent,
        channel: ChannelId,
    ) -> HandlerResult {
        (self.handle_pcap_event)(ctx, event, channel)
    }

    fn of_event_packet_in(&mut self, ctx: &mut ExecutionContext, msg: &Message) -> HandlerResult {
        (self.of_event_packet_in)(ctx, msg)
    }

    fn of_event_error(&mut self, ctx: &mut ExecutionContext, msg: &Message) -> HandlerResult {
        (self.of_event_error)(ctx, msg)
    }

    fn of_event_stats_reply(&mut self, ctx: &mut ExecutionContext, msg: &Message) -> HandlerResult {
        (self.of_event_stats_reply)(ctx, msg)
    }

    fn of_event_flow_removed(
        &mut self,
        ctx: &mut ExecutionContext,
        msg: &Message,
    ) -> HandlerResult {
        (self.of_event_flow_removed)(ctx, msg)
    }

    fn of_event_port_status(&mut self, ctx: &mut ExecutionContext, msg: &Message) -> HandlerResult {
        (self.of_event_port_status)(ctx, msg)
    }

    fn of_event_echo_request(
        &mut self,
        ctx: &mut ExecutionContext,
        msg: &Message,
    ) -> HandlerResult {
        (self.of_event_echo_request)(ctx, msg)
    }

    fn of_event_other(&mut self, ctx: &mut ExecutionContext, msg: &Message) -> HandlerResult {
        (self.of_event_other)(ctx, msg)
    }

    fn handle_timer_event(
        &mut self,
        ctx: &mut ExecutionContext,
        event: &TimerEvent,
    ) -> HandlerResult {
        (self.handle_timer_event)(ctx, event)
    }
}
