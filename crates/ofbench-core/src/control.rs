//! Control channel: reassembles the byte stream into messages and routes
//! each one to the module's handler for its kind.
//!
//! # Dispatch table
//!
//! | kind            | handler                  |
//! |-----------------|--------------------------|
//! | hello           | none (logged)            |
//! | error           | `of_event_error`         |
//! | packet-in       | `of_event_packet_in`     |
//! | stats-reply     | `of_event_stats_reply`   |
//! | flow-removed    | `of_event_flow_removed`  |
//! | port-status     | `of_event_port_status`   |
//! | echo-request    | `of_event_echo_request`  |
//! | any other known | `of_event_other`         |
//!
//! Messages with a foreign protocol version are dropped without stalling
//! the stream. Kinds outside the known range are governed by
//! [`UnknownKindPolicy`].

use std::fmt;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

use crate::buffer::{ReassemblyBuffer, DEFAULT_CAPACITY};
use crate::context::ExecutionContext;
use crate::module::{HandlerResult, TestModule};
use crate::wire::{Message, MessageKind, WireError, DEFAULT_PROTOCOL_VERSION};

/// What to do with a message whose kind is outside the known range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownKindPolicy {
    /// Treat it as stream corruption and stop the run.
    #[default]
    Abort,
    /// Skip the message by its declared length and keep going.
    Drop,
}

impl fmt::Display for UnknownKindPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abort => f.write_str("abort"),
            Self::Drop => f.write_str("drop"),
        }
    }
}

impl FromStr for UnknownKindPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abort" => Ok(Self::Abort),
            "drop" => Ok(Self::Drop),
            other => Err(format!("unknown policy `{other}` (expected `abort` or `drop`)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Messages carrying any other version are dropped.
    pub protocol_version: u8,
    pub unknown_kind: UnknownKindPolicy,
    pub initial_capacity: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            unknown_kind: UnknownKindPolicy::default(),
            initial_capacity: DEFAULT_CAPACITY,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The peer closed the connection.
    #[error("control connection reset")]
    ConnectionReset,
    #[error("control stream corrupted: {0}")]
    Framing(#[from] WireError),
    /// Unknown kind under [`UnknownKindPolicy::Abort`]: message boundaries
    /// can no longer be trusted.
    #[error("unknown message kind {kind} (xid {xid}), control stream is probably corrupted")]
    UnknownKind { kind: u8, xid: u32 },
}

/// One control connection and its reassembly state.
pub struct ControlChannel {
    reader: Box<dyn AsyncRead + Unpin + Send>,
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    buffer: ReassemblyBuffer,
    config: ControlConfig,
    /// Outbound message the writer has only partly accepted.
    writing: Option<Bytes>,
    unflushed: bool,
}

impl fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlChannel")
            .field("buffer", &self.buffer)
            .field("config", &self.config)
            .field("writing", &self.writing.as_ref().map(Bytes::len))
            .finish_non_exhaustive()
    }
}

impl ControlChannel {
    /// Wrap a connected stream. The stream is split so outbound messages can
    /// be written while reads are pending.
    pub fn new<S>(stream: S, config: ControlConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            buffer: ReassemblyBuffer::with_capacity(config.initial_capacity),
            config,
            writing: None,
            unflushed: false,
        }
    }

    /// A control channel connected to an in-memory peer, for testing.
    pub fn pair(config: ControlConfig) -> (Self, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        (Self::new(ours, config), theirs)
    }

    pub fn buffer(&self) -> &ReassemblyBuffer {
        &self.buffer
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Read whatever the stream has into the reassembly buffer, growing it
    /// first if it is full. Resolves with the number of bytes read.
    pub fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let mut read_buf = ReadBuf::new(self.buffer.read_space());
        match Pin::new(&mut self.reader).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => {
                let n = read_buf.filled().len();
                self.buffer.commit(n);
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    /// Wait for data, then dispatch every complete message.
    pub async fn read_and_dispatch(
        &mut self,
        module: &mut dyn TestModule,
        ctx: &mut ExecutionContext,
    ) -> Result<usize, ControlError> {
        let read = std::future::poll_fn(|cx| self.poll_fill(cx)).await;
        self.on_read(read, module, ctx)
    }

    /// Act on the outcome of one read.
    ///
    /// A zero-byte read, or an error saying the connection was torn down,
    /// means the peer went away. Other read errors are transient: they are
    /// logged and the next readiness retries.
    pub fn on_read(
        &mut self,
        read: io::Result<usize>,
        module: &mut dyn TestModule,
        ctx: &mut ExecutionContext,
    ) -> Result<usize, ControlError> {
        match read {
            Ok(0) => Err(ControlError::ConnectionReset),
            Ok(n) => {
                tracing::trace!(bytes = n, buffered = self.buffer.len(), "control read");
                self.process(module, ctx)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) if is_disconnect(e.kind()) => {
                tracing::debug!(error = %e, "control connection torn down");
                Err(ControlError::ConnectionReset)
            }
            Err(e) => {
                tracing::warn!(error = %e, "control read failed, will retry");
                Ok(0)
            }
        }
    }

    /// Extract and dispatch every complete message in the buffer, in arrival
    /// order. Returns how many messages reached a handler.
    pub fn process(
        &mut self,
        module: &mut dyn TestModule,
        ctx: &mut ExecutionContext,
    ) -> Result<usize, ControlError> {
        let mut dispatched = 0;
        while let Some(msg) = self.buffer.next_message()? {
            if msg.version() != self.config.protocol_version {
                tracing::warn!(
                    version = msg.version(),
                    expected = self.config.protocol_version,
                    kind = msg.header().kind,
                    xid = msg.xid(),
                    "protocol version mismatch, dropping message"
                );
                continue;
            }

            if msg.kind().is_none() {
                let (kind, xid) = (msg.header().kind, msg.xid());
                match self.config.unknown_kind {
                    UnknownKindPolicy::Abort => {
                        tracing::error!(kind, xid, "unknown message kind");
                        return Err(ControlError::UnknownKind { kind, xid });
                    }
                    UnknownKindPolicy::Drop => {
                        tracing::error!(
                            kind,
                            xid,
                            len = msg.header().length,
                            "unknown message kind, skipping by declared length"
                        );
                        continue;
                    }
                }
            }

            if let Err(e) = dispatch_message(module, ctx, &msg) {
                tracing::warn!(
                    module = module.name(),
                    kind = msg.header().kind,
                    xid = msg.xid(),
                    error = %e,
                    "message handler failed"
                );
            }
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Whether an outbound message is still half written.
    pub fn is_writing(&self) -> bool {
        self.writing.is_some()
    }

    /// Write queued outbound messages until the outbox is empty or the
    /// writer would block.
    ///
    /// A message the writer only partly accepts is kept and resumed on the
    /// next poll, so message boundaries survive a slow peer. Resolves once
    /// everything has been written and flushed.
    pub fn poll_flush_outbox(
        &mut self,
        ctx: &mut ExecutionContext,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if self.writing.is_none() {
                self.writing = ctx.take_outbound();
            }
            let Some(bytes) = self.writing.as_mut() else {
                break;
            };
            let n = ready!(Pin::new(&mut self.writer).poll_write(cx, &bytes[..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            bytes.advance(n);
            self.unflushed = true;
            if bytes.is_empty() {
                self.writing = None;
            }
        }
        if self.unflushed {
            ready!(Pin::new(&mut self.writer).poll_flush(cx))?;
            self.unflushed = false;
        }
        Poll::Ready(Ok(()))
    }

    /// Write every queued outbound message to the peer.
    pub async fn flush_outbox(&mut self, ctx: &mut ExecutionContext) -> io::Result<()> {
        std::future::poll_fn(|cx| self.poll_flush_outbox(ctx, cx)).await
    }

    /// Throw away the half-written message and everything still queued.
    /// Returns how many messages were lost.
    pub fn discard_outbox(&mut self, ctx: &mut ExecutionContext) -> usize {
        let mut lost = usize::from(self.writing.take().is_some());
        while ctx.take_outbound().is_some() {
            lost += 1;
        }
        self.unflushed = false;
        lost
    }
}

fn is_disconnect(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// Route one message of a known kind to its handler slot.
pub fn dispatch_message(
    module: &mut dyn TestModule,
    ctx: &mut ExecutionContext,
    msg: &Message,
) -> HandlerResult {
    let Some(kind) = msg.kind() else {
        return module.of_event_other(ctx, msg);
    };
    tracing::debug!(%kind, xid = msg.xid(), len = msg.header().length, "dispatching message");
    match kind {
        MessageKind::Hello => {
            tracing::debug!(xid = msg.xid(), "hello received");
            Ok(())
        }
        MessageKind::Error => module.of_event_error(ctx, msg),
        MessageKind::PacketIn => module.of_event_packet_in(ctx, msg),
        MessageKind::StatsReply => module.of_event_stats_reply(ctx, msg),
        MessageKind::FlowRemoved => module.of_event_flow_removed(ctx, msg),
        MessageKind::PortStatus => module.of_event_port_status(ctx, msg),
        MessageKind::EchoRequest => module.of_event_echo_request(ctx, msg),
        _ => module.of_event_other(ctx, msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parses() {
        assert_eq!("abort".parse(), Ok(UnknownKindPolicy::Abort));
        assert_eq!("drop".parse(), Ok(UnknownKindPolicy::Drop));
        assert!("ignore".parse::<UnknownKindPolicy>().is_err());
        assert_eq!(UnknownKindPolicy::Drop.to_string(), "drop");
    }

    #[test]
    fn test_disconnect_kinds() {
        assert!(is_disconnect(io::ErrorKind::ConnectionReset));
        assert!(is_disconnect(io::ErrorKind::BrokenPipe));
        assert!(!is_disconnect(io::ErrorKind::TimedOut));
        assert!(!is_disconnect(io::ErrorKind::Other));
    }

    #[test]
    fn test_default_config() {
        let config = ControlConfig::default();
        assert_eq!(config.protocol_version, DEFAULT_PROTOCOL_VERSION);
        assert_eq!(config.unknown_kind, UnknownKindPolicy::Abort);
    }
}
