//! ofbench-testkit: fixtures shared by the ofbench test suites.
//!
//! Provides an in-memory capture backend, a module that records every
//! callback, wire builders, and a runner that streams raw bytes through a
//! control channel and the event loop.
//!
//! # Usage
//!
//! ```ignore
//! let stream = ofbench_testkit::concat(&[
//!     ofbench_testkit::message(MessageKind::PacketIn, 1, b"abcd"),
//!     ofbench_testkit::message(MessageKind::PortStatus, 2, b""),
//! ]);
//! let run = ofbench_testkit::run_stream(stream, 3, ControlConfig::default()).await;
//! assert_eq!(run.recorder.messages().len(), 2);
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use ofbench_core::{
    run_event_loop, Channel, CaptureTechnology, ControlChannel, ControlConfig, ExecutionContext,
    Header, LoopError, LoopExit, Message, MessageKind, ReassemblyBuffer, TestModule, WireError,
    DEFAULT_PROTOCOL_VERSION, HEADER_LEN,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

mod capture;
mod recording;

pub use capture::*;
pub use recording::*;

/// Error type for fixture helpers.
#[derive(Debug)]
pub enum TestError {
    Io(std::io::Error),
    Wire(WireError),
    /// Bytes left over after the last complete message.
    Trailing(usize),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Io(e) => write!(f, "io error: {}", e),
            TestError::Wire(e) => write!(f, "wire error: {}", e),
            TestError::Trailing(n) => write!(f, "{} trailing bytes after last message", n),
        }
    }
}

impl std::error::Error for TestError {}

impl From<std::io::Error> for TestError {
    fn from(e: std::io::Error) -> Self {
        TestError::Io(e)
    }
}

impl From<WireError> for TestError {
    fn from(e: WireError) -> Self {
        TestError::Wire(e)
    }
}

// ============================================================================
// Wire builders
// ============================================================================

/// Encode a message with the default protocol version.
pub fn message(kind: MessageKind, xid: u32, payload: &[u8]) -> Bytes {
    raw_message(DEFAULT_PROTOCOL_VERSION, kind.as_u8(), xid, payload)
}

/// Encode a message with arbitrary version and kind bytes, including ones
/// the harness does not accept.
pub fn raw_message(version: u8, kind: u8, xid: u32, payload: &[u8]) -> Bytes {
    let header = Header {
        version,
        kind,
        length: (HEADER_LEN + payload.len()) as u16,
        xid,
    };
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(&header.encode());
    buf.put_slice(payload);
    buf.freeze()
}

pub fn concat(parts: &[Bytes]) -> Bytes {
    let mut buf = BytesMut::new();
    for part in parts {
        buf.put_slice(part);
    }
    buf.freeze()
}

/// Decode a byte string that must consist of whole messages.
pub fn decode_all(bytes: &[u8]) -> Result<Vec<Message>, TestError> {
    let mut buf = ReassemblyBuffer::with_capacity(bytes.len());
    buf.ingest(bytes);
    let mut out = Vec::new();
    while let Some(msg) = buf.next_message()? {
        out.push(msg);
    }
    if !buf.is_empty() {
        return Err(TestError::Trailing(buf.len()));
    }
    Ok(out)
}

/// Read exactly one message from `reader`.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, TestError> {
    let mut head = [0u8; HEADER_LEN];
    reader.read_exact(&mut head).await?;
    let header = Header::decode(&head)?.ok_or(TestError::Trailing(HEADER_LEN))?;

    let mut bytes = vec![0u8; header.total_len()];
    bytes[..HEADER_LEN].copy_from_slice(&head);
    reader.read_exact(&mut bytes[HEADER_LEN..]).await?;

    let mut messages = decode_all(&bytes)?;
    Ok(messages.remove(0))
}

/// Channels named after `devices`, all generic capture.
pub fn channels(devices: &[&str]) -> Vec<Channel> {
    devices
        .iter()
        .map(|device| Channel::new(*device, CaptureTechnology::Pcap))
        .collect()
}

// ============================================================================
// Stream runner
// ============================================================================

/// Outcome of pushing a byte stream through the event loop.
#[derive(Debug)]
pub struct StreamRun {
    pub exit: Result<LoopExit, LoopError>,
    pub recorder: Recorder,
    /// Everything the harness wrote back to the peer.
    pub replies: Bytes,
}

/// Stream `bytes` into a fresh control channel in reads of at most `chunk`
/// bytes, then close the connection. A [`RecordingModule`] sees every
/// dispatched message.
pub async fn run_stream(bytes: Bytes, chunk: usize, config: ControlConfig) -> StreamRun {
    let (mut module, recorder) = RecordingModule::new("recording");
    let mut ctx = ExecutionContext::new(Vec::new(), config.protocol_version);
    let (exit, replies) = run_stream_with(&mut module, &mut ctx, bytes, chunk, config).await;
    StreamRun {
        exit,
        recorder,
        replies,
    }
}

/// [`run_stream`] with a caller-provided module and context.
pub async fn run_stream_with(
    module: &mut dyn TestModule,
    ctx: &mut ExecutionContext,
    bytes: Bytes,
    chunk: usize,
    config: ControlConfig,
) -> (Result<LoopExit, LoopError>, Bytes) {
    let (ours, theirs) = tokio::io::duplex(chunk.max(1));
    let (mut peer_rx, mut peer_tx) = tokio::io::split(theirs);
    let mut control = ControlChannel::new(ours, config);

    let writer = tokio::spawn(async move {
        peer_tx.write_all(&bytes).await?;
        peer_tx.shutdown().await
    });
    let reader = tokio::spawn(async move {
        let mut replies = Vec::new();
        let _ = peer_rx.read_to_end(&mut replies).await;
        replies
    });

    let exit = run_event_loop(module, ctx, &mut control).await;
    drop(control);

    if let Ok(Err(e)) = writer.await {
        tracing::debug!(error = %e, "stream writer stopped early");
    }
    let replies = reader.await.unwrap_or_default();
    (exit, Bytes::from(replies))
}
