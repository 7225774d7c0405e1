//! ofbench-core: the event-driven heart of the ofbench harness.
//!
//! This crate defines:
//! - The control wire format ([`Header`], [`Message`], [`MessageKind`])
//! - Per-connection reassembly ([`ReassemblyBuffer`])
//! - The control channel and its dispatcher ([`ControlChannel`], [`dispatch_message`])
//! - The test-module capability set ([`TestModule`], [`default_module`])
//! - Per-test state ([`ExecutionContext`], [`Channel`])
//! - Timers ([`TimerQueue`]) and capture interfaces ([`CaptureBackend`], [`CaptureOpener`])
//! - The channel multiplexer ([`run_event_loop`], [`run_test_module`])

#![forbid(unsafe_code)]

mod buffer;
mod capture;
mod context;
mod control;
mod event_loop;
mod module;
mod timer;
mod wire;

pub use buffer::*;
pub use capture::*;
pub use context::*;
pub use control::*;
pub use event_loop::*;
pub use module::*;
pub use timer::*;
pub use wire::*;
