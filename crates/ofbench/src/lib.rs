//! ofbench: a pluggable benchmark harness for devices speaking a
//! length-framed control protocol.
//!
//! The [`Harness`] runs each loaded test module against one control
//! connection, with an auxiliary task and a traffic generator alongside,
//! and reports per-channel capture statistics after every test.

pub mod auxiliary;
pub mod harness;
pub mod modules;
pub mod traffic;

pub use auxiliary::{AuxiliaryTask, IdleAuxiliary};
pub use harness::{
    ChannelSpec, Harness, HarnessConfig, RunError, RunEvent, TestOutcome, TestReport,
};
pub use traffic::{IdleTraffic, TrafficGenerator};
