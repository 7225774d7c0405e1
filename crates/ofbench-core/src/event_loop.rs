//! The channel multiplexer.
//!
//! Each iteration makes a single wait across every open capture channel,
//! the control stream, the stop token and the next timer deadline, then
//! fans the wake-up out to the capture dispatcher, the control reassembler
//! or the timer handler. Queued outbound messages are written from inside
//! that same wait, so a peer that stops reading never stalls the loop. The
//! loop runs until the context's stop token is cancelled or the control
//! peer goes away.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::capture::{configure_channels, dispatch_capture_event, CaptureOpener};
use crate::context::{ChannelId, ExecutionContext};
use crate::control::{ControlChannel, ControlError};
use crate::module::{ModuleError, TestModule};

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error("waiting on capture channel {channel} failed")]
    Wait {
        channel: ChannelId,
        #[source]
        source: io::Error,
    },
    #[error("module `{module}` failed to start")]
    Start {
        module: String,
        #[source]
        source: ModuleError,
    },
}

/// Why the event loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The test asked to end.
    Ended,
    /// The control peer closed the connection.
    ControlClosed,
}

/// How long the peer gets to take the last queued messages once the test
/// has ended.
pub const CLOSING_FLUSH_GRACE: Duration = Duration::from_millis(100);

/// What a single wait produced.
enum Wake {
    Stopped,
    TimedOut,
    Ready {
        channels: Vec<ChannelId>,
        control: Option<io::Result<usize>>,
    },
    Failed {
        channel: ChannelId,
        source: io::Error,
    },
}

/// Set up the module's capture channels, start it, and run the event loop
/// until the test ends.
pub async fn run_test_module(
    module: &mut dyn TestModule,
    ctx: &mut ExecutionContext,
    control: &mut ControlChannel,
    opener: &dyn CaptureOpener,
) -> Result<LoopExit, LoopError> {
    configure_channels(module, ctx, opener);

    tracing::info!(module = module.name(), "starting test");
    module.start(ctx).map_err(|source| LoopError::Start {
        module: module.name().to_owned(),
        source,
    })?;

    run_event_loop(module, ctx, control).await
}

pub async fn run_event_loop(
    module: &mut dyn TestModule,
    ctx: &mut ExecutionContext,
    control: &mut ControlChannel,
) -> Result<LoopExit, LoopError> {
    let stop = ctx.stop_token();

    loop {
        run_due_timers(module, ctx);
        if ctx.should_end() {
            break;
        }

        let mut sleep = ctx
            .timers()
            .next_due()
            .map(|due| Box::pin(tokio::time::sleep_until(due)));
        let mut cancelled = std::pin::pin!(stop.cancelled());

        let wake = std::future::poll_fn(|cx| {
            if cancelled.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Wake::Stopped);
            }

            write_outbox(control, ctx, cx);

            let mut channels = Vec::new();
            for (index, channel) in ctx.channels_mut().iter_mut().enumerate() {
                let Some(backend) = channel.backend_mut() else {
                    continue;
                };
                match backend.poll_readable(cx) {
                    Poll::Ready(Ok(())) => channels.push(ChannelId(index)),
                    Poll::Ready(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {
                        cx.waker().wake_by_ref();
                    }
                    Poll::Ready(Err(source)) => {
                        return Poll::Ready(Wake::Failed {
                            channel: ChannelId(index),
                            source,
                        });
                    }
                    Poll::Pending => {}
                }
            }

            let control_read = match control.poll_fill(cx) {
                Poll::Ready(read) => Some(read),
                Poll::Pending => None,
            };

            if !channels.is_empty() || control_read.is_some() {
                return Poll::Ready(Wake::Ready {
                    channels,
                    control: control_read,
                });
            }

            if let Some(sleep) = sleep.as_mut() {
                if Pin::as_mut(sleep).poll(cx).is_ready() {
                    return Poll::Ready(Wake::TimedOut);
                }
            }
            Poll::Pending
        })
        .await;

        match wake {
            Wake::Stopped => break,
            Wake::TimedOut => run_next_timer(module, ctx),
            Wake::Failed { channel, source } => {
                tracing::error!(%channel, error = %source, "readiness wait failed");
                return Err(LoopError::Wait { channel, source });
            }
            Wake::Ready { channels, control: read } => {
                for channel in channels {
                    dispatch_capture_event(module, ctx, channel);
                }
                if let Some(read) = read {
                    let transient = read.is_err();
                    match control.on_read(read, module, ctx) {
                        Ok(_) => {}
                        Err(ControlError::ConnectionReset) => {
                            tracing::info!(module = module.name(), "control connection closed");
                            // A half-closed peer may still be reading.
                            drain_outbox(control, ctx).await;
                            return Ok(LoopExit::ControlClosed);
                        }
                        Err(e) => {
                            tracing::error!(module = module.name(), error = %e, "control channel failed");
                            return Err(e.into());
                        }
                    }
                    if transient {
                        // A failing socket is ready again at once.
                        tokio::task::yield_now().await;
                    }
                }
            }
        }
    }

    drain_outbox(control, ctx).await;
    tracing::info!(module = module.name(), "test ended");
    Ok(LoopExit::Ended)
}

/// Run every timer that is already due, so the next wait always has a
/// deadline strictly in the future.
fn run_due_timers(module: &mut dyn TestModule, ctx: &mut ExecutionContext) {
    while !ctx.should_end() {
        let Some(event) = ctx.timers_mut().pop_due(tokio::time::Instant::now()) else {
            break;
        };
        deliver_timer(module, ctx, event);
    }
}

/// The wait timed out: run exactly one timer.
fn run_next_timer(module: &mut dyn TestModule, ctx: &mut ExecutionContext) {
    if let Some(event) = ctx.timers_mut().pop_next() {
        deliver_timer(module, ctx, event);
    }
}

fn deliver_timer(
    module: &mut dyn TestModule,
    ctx: &mut ExecutionContext,
    event: crate::timer::TimerEvent,
) {
    tracing::trace!(timer = event.id.0, kind = event.kind, "timer due");
    if let Err(e) = module.handle_timer_event(ctx, &event) {
        tracing::warn!(module = module.name(), timer = event.id.0, error = %e, "timer handler failed");
    }
}

/// Push queued messages into the control writer without blocking the wait.
fn write_outbox(
    control: &mut ControlChannel,
    ctx: &mut ExecutionContext,
    cx: &mut Context<'_>,
) {
    if let Poll::Ready(Err(e)) = control.poll_flush_outbox(ctx, cx) {
        let lost = control.discard_outbox(ctx);
        tracing::warn!(error = %e, lost, "writing to control channel failed");
    }
}

/// Give the peer a short grace period to take what is still queued. A
/// peer that is gone fails the write at once.
async fn drain_outbox(control: &mut ControlChannel, ctx: &mut ExecutionContext) {
    if ctx.pending_outbound() == 0 && !control.is_writing() {
        return;
    }
    match tokio::time::timeout(CLOSING_FLUSH_GRACE, control.flush_outbox(ctx)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let lost = control.discard_outbox(ctx);
            tracing::warn!(error = %e, lost, "writing to control channel failed");
        }
        Err(_) => {
            let lost = control.discard_outbox(ctx);
            tracing::warn!(lost, "control peer is not reading, dropping queued messages");
        }
    }
}
