use std::io;

use crate::transport::types::RejectType;

/// Largest frame body accepted before the stream is treated as corrupt.
/// Matches the limit of the underlying control codec.
pub const MAX_FRAME_LEN: usize = 0x7f_ffff;

/// Failure to establish the transport. Raised before any handshake starts.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("could not resolve {host}: {source}")]
    Dns {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("connection refused by {0}")]
    Refused(String),
    #[error("tls handshake failed: {0}")]
    Tls(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("handshake could not start: {0}")]
    Handshake(#[from] TransportError),
}

/// Mid-session failure. Always fatal to the connection it happened on.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,
    #[error("connection closed by peer")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        TransportError::Io(error.to_string())
    }
}

impl From<ReconcileError> for TransportError {
    fn from(error: ReconcileError) -> Self {
        TransportError::Protocol(error.to_string())
    }
}

/// A frame on the control channel that cannot be turned into a message.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("frame header is {0} bytes, expected 6")]
    ShortHeader(usize),
    #[error("frame body is {actual} bytes, header declared {declared}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),
    #[error("malformed body for type {type_code}: {reason}")]
    Body { type_code: u16, reason: String },
}

/// A voice packet that cannot be parsed or built. Inbound packets are
/// dropped and the session continues.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum VoiceError {
    #[error("malformed voice packet: {0}")]
    Malformed(String),
    #[error("{codec} frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLong {
        codec: &'static str,
        len: usize,
        max: usize,
    },
    #[error("voice packet has no frames")]
    NoFrames,
    #[error("voice target {0} does not fit in 5 bits")]
    Target(u8),
}

impl From<io::Error> for VoiceError {
    fn from(error: io::Error) -> Self {
        VoiceError::Malformed(error.to_string())
    }
}

/// Inbound state that would break the channel tree invariants.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("channel {declared} declared itself root but channel {existing} already is")]
    DuplicateRoot { existing: u32, declared: u32 },
    #[error("channel {0} declared itself root; only channel 0 may")]
    InvalidRoot(u32),
}

/// The server refused the session.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("server rejected the session ({kind}): {reason}")]
pub struct Rejection {
    pub kind: RejectType,
    pub reason: String,
}
