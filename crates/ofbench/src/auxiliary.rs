//! The auxiliary event task that runs beside each test.
//!
//! It receives a clone of the test's stop token and nothing else, so it
//! cannot touch the capture channels, timers or control stream owned by the
//! module run.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

pub trait AuxiliaryTask: Send + Sync + 'static {
    /// Run until `stop` is cancelled.
    fn run(self: Arc<Self>, stop: CancellationToken) -> BoxFuture<'static, ()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IdleAuxiliary;

impl AuxiliaryTask for IdleAuxiliary {
    fn run(self: Arc<Self>, stop: CancellationToken) -> BoxFuture<'static, ()> {
        async move { stop.cancelled().await }.boxed()
    }
}
