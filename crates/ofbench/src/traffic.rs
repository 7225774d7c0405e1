//! Traffic generation, seen from the harness.
//!
//! The generator itself (packet shaping, rates, interfaces) lives outside
//! the harness. Per test it is started next to the module run and asked to
//! stop through its token once the test is over. A generator that does not
//! wind down within the grace period is aborted, so it must tolerate being
//! dropped at any await point.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

pub trait TrafficGenerator: Send + Sync + 'static {
    /// Generate traffic until `stop` is cancelled.
    fn run(self: Arc<Self>, stop: CancellationToken) -> BoxFuture<'static, ()>;

    /// One-line summary for the test report.
    fn report(&self) -> Option<String> {
        None
    }
}

/// Sends nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleTraffic;

impl TrafficGenerator for IdleTraffic {
    fn run(self: Arc<Self>, stop: CancellationToken) -> BoxFuture<'static, ()> {
        async move { stop.cancelled().await }.boxed()
    }
}
