// Envelope framing for transport calls carried over a byte stream.
//
// Every envelope is a 10-byte header followed by its payload:
//
//   magic (u32) | version (u8) | kind (u8) | payload length (u32), big-endian
//
// Bodies travel as raw bytes. `call` and `open_stream` prefix the body with the
// call path (u16 length, UTF-8). A `status` payload is the JSON-encoded error.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

pub mod base64_body;
pub mod protocol;

pub use protocol::{
    DeadlineModification, PUBLISH_PATH, PublishOutcome, PublishRequest, PublishResponse,
    ReceivedWireMessage, STREAMING_PULL_PATH, StreamingPullRequest, StreamingPullResponse,
    WireMessage, decode_body, encode_body,
};

/// "CRR1".
pub const MAGIC: u32 = 0x4352_5231;
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 10;
/// Default cap on a single envelope payload; peers refuse anything larger before allocating.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid magic number {0:#010x}")]
    InvalidMagic(u32),
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown envelope kind {0}")]
    UnknownKind(u8),
    #[error("{kind} envelope payload truncated")]
    Truncated { kind: EnvelopeKind },
    #[error("call path is {0} bytes; at most {max} allowed", max = u16::MAX)]
    PathTooLong(usize),
    #[error("call path is not UTF-8")]
    InvalidPath,
    #[error("payload of {0} bytes does not fit a frame")]
    TooLarge(usize),
    #[error("failed to serialize message")]
    Serialize(serde_json::Error),
    #[error("failed to deserialize message")]
    Deserialize(serde_json::Error),
}

impl From<Error> for courier_common::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Serialize(inner) => {
                courier_common::Error::InvalidArgument(format!("encode body: {inner}"))
            }
            Error::Deserialize(inner) => {
                courier_common::Error::Internal(format!("decode body: {inner}"))
            }
            other => courier_common::Error::Connection(format!("framing: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvelopeKind {
    Call = 1,
    OpenStream = 2,
    Chunk = 3,
    Reply = 4,
    Status = 5,
}

impl EnvelopeKind {
    fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            1 => Self::Call,
            2 => Self::OpenStream,
            3 => Self::Chunk,
            4 => Self::Reply,
            5 => Self::Status,
            other => return Err(Error::UnknownKind(other)),
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::OpenStream => "open_stream",
            Self::Chunk => "chunk",
            Self::Reply => "reply",
            Self::Status => "status",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed envelope header. Readers check `length` against their cap before
/// reading the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub kind: EnvelopeKind,
    pub length: u32,
}

impl EnvelopeHeader {
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self> {
        let mut buf = &bytes[..];
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(Error::InvalidMagic(magic));
        }
        let version = buf.get_u8();
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let kind = EnvelopeKind::from_u8(buf.get_u8())?;
        Ok(Self {
            kind,
            length: buf.get_u32(),
        })
    }
}

/// One unit of the call protocol on a QUIC bi-directional stream.
///
/// A unary call is `Call` answered by `Reply` or `Status`. A streaming call starts
/// with `OpenStream`, after which both sides exchange `Chunk`s; the server ends the
/// stream by finishing its send side (clean end) or by sending `Status` (failure).
///
/// ```
/// use bytes::Bytes;
/// use courier_wire::{Envelope, EnvelopeHeader, HEADER_LEN};
///
/// let call = Envelope::Call {
///     path: "/courier.v1.Publisher/Publish".to_string(),
///     body: Bytes::from_static(b"{}"),
/// };
/// let encoded = call.encode().expect("encode");
/// let header = EnvelopeHeader::parse(encoded[..HEADER_LEN].try_into().expect("header"))
///     .expect("parse");
/// let decoded = Envelope::decode(header.kind, encoded.slice(HEADER_LEN..)).expect("decode");
/// assert_eq!(decoded, call);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Call { path: String, body: Bytes },
    OpenStream { path: String, body: Bytes },
    Chunk { body: Bytes },
    Reply { body: Bytes },
    Status { error: courier_common::Error },
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Call { .. } => EnvelopeKind::Call,
            Envelope::OpenStream { .. } => EnvelopeKind::OpenStream,
            Envelope::Chunk { .. } => EnvelopeKind::Chunk,
            Envelope::Reply { .. } => EnvelopeKind::Reply,
            Envelope::Status { .. } => EnvelopeKind::Status,
        }
    }

    /// Header and payload, ready to write.
    pub fn encode(&self) -> Result<Bytes> {
        let mut payload = BytesMut::new();
        match self {
            Envelope::Call { path, body } | Envelope::OpenStream { path, body } => {
                let len = u16::try_from(path.len()).map_err(|_| Error::PathTooLong(path.len()))?;
                payload.reserve(2 + path.len() + body.len());
                payload.put_u16(len);
                payload.put_slice(path.as_bytes());
                payload.put_slice(body);
            }
            Envelope::Chunk { body } | Envelope::Reply { body } => payload.put_slice(body),
            Envelope::Status { error } => {
                payload.put_slice(&serde_json::to_vec(error).map_err(Error::Serialize)?);
            }
        }
        let length = u32::try_from(payload.len()).map_err(|_| Error::TooLarge(payload.len()))?;
        let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
        frame.put_u32(MAGIC);
        frame.put_u8(VERSION);
        frame.put_u8(self.kind() as u8);
        frame.put_u32(length);
        frame.put_slice(&payload);
        Ok(frame.freeze())
    }

    pub fn decode(kind: EnvelopeKind, mut payload: Bytes) -> Result<Self> {
        Ok(match kind {
            EnvelopeKind::Call | EnvelopeKind::OpenStream => {
                if payload.remaining() < 2 {
                    return Err(Error::Truncated { kind });
                }
                let len = payload.get_u16() as usize;
                if payload.remaining() < len {
                    return Err(Error::Truncated { kind });
                }
                let path = String::from_utf8(payload.split_to(len).to_vec())
                    .map_err(|_| Error::InvalidPath)?;
                if kind == EnvelopeKind::Call {
                    Envelope::Call { path, body: payload }
                } else {
                    Envelope::OpenStream { path, body: payload }
                }
            }
            EnvelopeKind::Chunk => Envelope::Chunk { body: payload },
            EnvelopeKind::Reply => Envelope::Reply { body: payload },
            EnvelopeKind::Status => Envelope::Status {
                error: serde_json::from_slice(&payload).map_err(Error::Deserialize)?,
            },
        })
    }
}
