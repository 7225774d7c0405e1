//! Per-connection reassembly buffer for the control stream.
//!
//! Bytes arrive in arbitrary fragments. The buffer keeps two cursors over a
//! growable byte region:
//!
//! ```text
//! 0          start              end                capacity
//! |  consumed  |   unprocessed    |       free         |
//! ```
//!
//! Invariant: `0 <= start <= end <= capacity`, and `capacity` never shrinks.
//! When the free region is exhausted the capacity doubles; when every byte
//! has been consumed both cursors reset to zero.

use bytes::Bytes;

use crate::wire::{Header, Message, WireError};

/// Initial capacity of a fresh buffer.
pub const DEFAULT_CAPACITY: usize = 64 * 1024;

#[derive(Debug)]
pub struct ReassemblyBuffer {
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl Default for ReassemblyBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity.max(1)],
            start: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// First unprocessed byte.
    pub fn start(&self) -> usize {
        self.start
    }

    /// First free byte.
    pub fn end(&self) -> usize {
        self.end
    }

    /// Number of buffered, unprocessed bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn pending(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// Free region for the next read, doubling the capacity first if the
    /// buffer is full.
    pub fn read_space(&mut self) -> &mut [u8] {
        if self.end == self.buf.len() {
            let capacity = self.buf.len() * 2;
            tracing::debug!(
                from = self.buf.len(),
                to = capacity,
                pending = self.len(),
                "reassembly buffer full, growing"
            );
            self.buf.resize(capacity, 0);
        }
        &mut self.buf[self.end..]
    }

    /// Mark `n` bytes of the read space as filled.
    pub fn commit(&mut self, n: usize) {
        assert!(
            n <= self.buf.len() - self.end,
            "commit of {n} bytes overruns reassembly buffer"
        );
        self.end += n;
    }

    /// Copy as much of `bytes` as fits in one read, returning how many bytes
    /// were taken. Behaves like a single `read()` into the buffer.
    pub fn ingest(&mut self, bytes: &[u8]) -> usize {
        let space = self.read_space();
        let n = space.len().min(bytes.len());
        space[..n].copy_from_slice(&bytes[..n]);
        self.commit(n);
        n
    }

    /// Extract the next complete message, if one is fully buffered.
    ///
    /// Returns `Ok(None)` when more data is needed: either the header is not
    /// complete yet or the declared length runs past the buffered bytes. The
    /// buffer never grows here; growth happens on the next read.
    pub fn next_message(&mut self) -> Result<Option<Message>, WireError> {
        let available = self.end - self.start;
        if available == 0 {
            return Ok(None);
        }
        let Some(header) = Header::decode(&self.buf[self.start..self.end])? else {
            return Ok(None);
        };
        let len = header.total_len();
        if len > available || self.start + len > self.buf.len() {
            return Ok(None);
        }

        let bytes = Bytes::copy_from_slice(&self.buf[self.start..self.start + len]);
        self.start += len;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
        Ok(Some(Message::from_parts(header, bytes)))
    }

    /// Drop everything buffered. Capacity is kept.
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MessageKind;

    fn encoded(kind: MessageKind, xid: u32, payload: &[u8]) -> Vec<u8> {
        Message::build(0x01, kind, xid, payload)
            .unwrap()
            .into_bytes()
            .to_vec()
    }

    fn assert_invariant(buf: &ReassemblyBuffer) {
        assert!(buf.start() <= buf.end());
        assert!(buf.end() <= buf.capacity());
    }

    #[test]
    fn test_partial_message_is_kept() {
        let msg = encoded(MessageKind::Hello, 1, &[]);
        let mut buf = ReassemblyBuffer::with_capacity(64);

        buf.ingest(&msg[..4]);
        assert_eq!(buf.next_message().unwrap(), None);
        assert_eq!(buf.len(), 4);

        buf.ingest(&msg[4..]);
        let out = buf.next_message().unwrap().unwrap();
        assert_eq!(out.xid(), 1);
        assert!(buf.is_empty());
        assert_eq!((buf.start(), buf.end()), (0, 0));
    }

    #[test]
    fn test_full_buffer_doubles_on_next_read() {
        let mut buf = ReassemblyBuffer::with_capacity(8);
        let msg = encoded(MessageKind::PacketIn, 3, &[0xaa; 12]);

        assert_eq!(buf.ingest(&msg), 8);
        assert_eq!(buf.capacity(), 8);
        assert_eq!(buf.next_message().unwrap(), None);
        assert_invariant(&buf);

        assert_eq!(buf.ingest(&msg[8..]), 8);
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.next_message().unwrap(), None);

        assert_eq!(buf.ingest(&msg[16..]), 4);
        assert_eq!(buf.capacity(), 32);
        assert_eq!(buf.next_message().unwrap().unwrap().payload(), &[0xaa; 12]);
        assert_invariant(&buf);
    }

    #[test]
    fn test_growth_preserves_unconsumed_offset() {
        let first = encoded(MessageKind::EchoRequest, 1, &[]);
        let second = encoded(MessageKind::PacketIn, 2, &[7; 20]);
        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        let mut buf = ReassemblyBuffer::with_capacity(16);
        let mut offset = buf.ingest(&stream);
        assert_eq!(buf.next_message().unwrap().unwrap().xid(), 1);
        assert_eq!(buf.start(), 8);

        let mut seen = Vec::new();
        while offset < stream.len() {
            offset += buf.ingest(&stream[offset..]);
            assert_invariant(&buf);
            while let Some(msg) = buf.next_message().unwrap() {
                seen.push(msg.xid());
            }
        }
        assert_eq!(seen, vec![2]);
        assert!(buf.capacity() >= 32);
    }

    #[test]
    fn test_corrupt_length_is_an_error() {
        let mut buf = ReassemblyBuffer::with_capacity(16);
        buf.ingest(&[0x01, 0, 0, 2, 0, 0, 0, 0]);
        assert_eq!(
            buf.next_message(),
            Err(WireError::LengthTooShort { length: 2 })
        );
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut buf = ReassemblyBuffer::with_capacity(4);
        buf.ingest(&[1, 2, 3, 4]);
        buf.ingest(&[5]);
        assert_eq!(buf.capacity(), 8);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 8);
    }
}
