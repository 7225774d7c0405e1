//! Control-channel wire format.
//!
//! Every message on the control stream starts with a fixed 8-byte header:
//!
//! ```text
//! 0         1        2                4                          8
//! +---------+--------+----------------+--------------------------+
//! | version |  kind  | length (u16be) |        xid (u32be)       |
//! +---------+--------+----------------+--------------------------+
//! ```
//!
//! `length` counts the whole message, header included. The payload follows
//! the header directly.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

/// Size of the fixed message header in bytes.
pub const HEADER_LEN: usize = 8;

/// Largest message the 16-bit length field can describe.
pub const MAX_MESSAGE_LEN: usize = u16::MAX as usize;

/// Protocol version spoken when nothing else is configured.
pub const DEFAULT_PROTOCOL_VERSION: u8 = 0x01;

/// Errors raised while decoding or building control messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// The length field is smaller than the header itself, so the stream can
    /// never advance past this message.
    #[error("declared message length {length} is shorter than the 8-byte header")]
    LengthTooShort { length: u16 },
    #[error("payload of {len} bytes exceeds the {max}-byte message limit")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Message kinds of the control protocol.
///
/// Anything that does not decode into a `MessageKind` is outside the known
/// range and is treated as a framing problem by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Hello = 0,
    Error = 1,
    EchoRequest = 2,
    EchoReply = 3,
    Vendor = 4,
    FeaturesRequest = 5,
    FeaturesReply = 6,
    GetConfigRequest = 7,
    GetConfigReply = 8,
    SetConfig = 9,
    PacketIn = 10,
    FlowRemoved = 11,
    PortStatus = 12,
    PacketOut = 13,
    FlowMod = 14,
    PortMod = 15,
    StatsRequest = 16,
    StatsReply = 17,
    BarrierRequest = 18,
    BarrierReply = 19,
    QueueGetConfigRequest = 20,
    QueueGetConfigReply = 21,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Hello),
            1 => Some(Self::Error),
            2 => Some(Self::EchoRequest),
            3 => Some(Self::EchoReply),
            4 => Some(Self::Vendor),
            5 => Some(Self::FeaturesRequest),
            6 => Some(Self::FeaturesReply),
            7 => Some(Self::GetConfigRequest),
            8 => Some(Self::GetConfigReply),
            9 => Some(Self::SetConfig),
            10 => Some(Self::PacketIn),
            11 => Some(Self::FlowRemoved),
            12 => Some(Self::PortStatus),
            13 => Some(Self::PacketOut),
            14 => Some(Self::FlowMod),
            15 => Some(Self::PortMod),
            16 => Some(Self::StatsRequest),
            17 => Some(Self::StatsReply),
            18 => Some(Self::BarrierRequest),
            19 => Some(Self::BarrierReply),
            20 => Some(Self::QueueGetConfigRequest),
            21 => Some(Self::QueueGetConfigReply),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Hello => "hello",
            Self::Error => "error",
            Self::EchoRequest => "echo-request",
            Self::EchoReply => "echo-reply",
            Self::Vendor => "vendor",
            Self::FeaturesRequest => "features-request",
            Self::FeaturesReply => "features-reply",
            Self::GetConfigRequest => "get-config-request",
            Self::GetConfigReply => "get-config-reply",
            Self::SetConfig => "set-config",
            Self::PacketIn => "packet-in",
            Self::FlowRemoved => "flow-removed",
            Self::PortStatus => "port-status",
            Self::PacketOut => "packet-out",
            Self::FlowMod => "flow-mod",
            Self::PortMod => "port-mod",
            Self::StatsRequest => "stats-request",
            Self::StatsReply => "stats-reply",
            Self::BarrierRequest => "barrier-request",
            Self::BarrierReply => "barrier-reply",
            Self::QueueGetConfigRequest => "queue-get-config-request",
            Self::QueueGetConfigReply => "queue-get-config-reply",
        };
        f.write_str(name)
    }
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub kind: u8,
    /// Total message length, header included.
    pub length: u16,
    pub xid: u32,
}

impl Header {
    /// Decode a header from the front of `bytes`.
    ///
    /// Returns `Ok(None)` when fewer than [`HEADER_LEN`] bytes are available.
    /// Bounds are checked before any field is read; nothing is reinterpreted
    /// in place.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, WireError> {
        let Some(raw) = bytes.get(..HEADER_LEN) else {
            return Ok(None);
        };
        let length = u16::from_be_bytes([raw[2], raw[3]]);
        if usize::from(length) < HEADER_LEN {
            return Err(WireError::LengthTooShort { length });
        }
        Ok(Some(Self {
            version: raw[0],
            kind: raw[1],
            length,
            xid: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
        }))
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.version;
        out[1] = self.kind;
        out[2..4].copy_from_slice(&self.length.to_be_bytes());
        out[4..8].copy_from_slice(&self.xid.to_be_bytes());
        out
    }

    /// Total message length in bytes.
    pub fn total_len(&self) -> usize {
        usize::from(self.length)
    }

    pub fn message_kind(&self) -> Option<MessageKind> {
        MessageKind::from_u8(self.kind)
    }
}

/// One complete control message: header plus payload, owned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    header: Header,
    bytes: Bytes,
}

impl Message {
    /// Wrap bytes that were already delimited by `header`.
    pub(crate) fn from_parts(header: Header, bytes: Bytes) -> Self {
        debug_assert_eq!(bytes.len(), header.total_len());
        Self { header, bytes }
    }

    /// Build an outbound message.
    pub fn build(
        version: u8,
        kind: MessageKind,
        xid: u32,
        payload: &[u8],
    ) -> Result<Self, WireError> {
        let total = HEADER_LEN + payload.len();
        let length = u16::try_from(total).map_err(|_| WireError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_MESSAGE_LEN - HEADER_LEN,
        })?;
        let header = Header {
            version,
            kind: kind.as_u8(),
            length,
            xid,
        };
        let mut buf = BytesMut::with_capacity(total);
        buf.put_slice(&header.encode());
        buf.put_slice(payload);
        Ok(Self {
            header,
            bytes: buf.freeze(),
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn version(&self) -> u8 {
        self.header.version
    }

    /// `None` when the kind byte is outside the known range.
    pub fn kind(&self) -> Option<MessageKind> {
        self.header.message_kind()
    }

    pub fn xid(&self) -> u32 {
        self.header.xid
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..]
    }

    /// The full wire encoding, header included.
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_needs_full_header() {
        assert_eq!(Header::decode(&[1, 0, 0]), Ok(None));
        assert_eq!(Header::decode(&[]), Ok(None));
    }

    #[test]
    fn test_decode_fields_are_big_endian() {
        let raw = [0x01, 10, 0x01, 0x02, 0xde, 0xad, 0xbe, 0xef];
        let header = Header::decode(&raw).unwrap().unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.message_kind(), Some(MessageKind::PacketIn));
        assert_eq!(header.length, 0x0102);
        assert_eq!(header.xid, 0xdead_beef);
        assert_eq!(header.encode(), raw);
    }

    #[test]
    fn test_decode_rejects_length_below_header() {
        let raw = [0x01, 0, 0, 4, 0, 0, 0, 0];
        assert_eq!(
            Header::decode(&raw),
            Err(WireError::LengthTooShort { length: 4 })
        );
    }

    #[test]
    fn test_build_sets_total_length() {
        let msg = Message::build(0x01, MessageKind::EchoRequest, 7, b"ping").unwrap();
        assert_eq!(msg.header().length, 12);
        assert_eq!(msg.as_bytes().len(), 12);
        assert_eq!(msg.payload(), b"ping");
        assert_eq!(msg.xid(), 7);
        assert_eq!(msg.kind(), Some(MessageKind::EchoRequest));
    }

    #[test]
    fn test_build_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_MESSAGE_LEN];
        assert!(matches!(
            Message::build(0x01, MessageKind::PacketOut, 1, &payload),
            Err(WireError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_kind_range() {
        assert_eq!(MessageKind::from_u8(21), Some(MessageKind::QueueGetConfigReply));
        assert_eq!(MessageKind::from_u8(22), None);
        assert_eq!(MessageKind::StatsReply.to_string(), "stats-reply");
    }
}
