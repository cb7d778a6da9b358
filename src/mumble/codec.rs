//! Control-channel framing on top of `mumble_protocol_2x`.
//!
//! Every frame is `[type: u16 BE][length: u32 BE][body]`. Bodies are the
//! protocol's protobuf messages except for the voice tunnel, whose body is a
//! raw voice packet kept as bytes until the reconciler parses it.

use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use mumble_protocol_2x::control::{msgs, RawControlCodec, RawControlPacket};
use tokio_util::codec::{Decoder, Encoder};

use crate::transport::errors::{DecodeError, TransportError, MAX_FRAME_LEN};
use crate::transport::types::ProtocolVersion;

pub const HEADER_LEN: usize = 6;

/// Protocol version advertised in our Version message.
pub const CLIENT_VERSION: ProtocolVersion = ProtocolVersion::new(1, 2, 4);

/// Message kinds with a typed representation. Any other code decodes to [`Message::Unknown`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Version,
    UdpTunnel,
    Authenticate,
    Ping,
    Reject,
    ServerSync,
    ChannelRemove,
    ChannelState,
    UserRemove,
    UserState,
    TextMessage,
    PermissionDenied,
    CryptSetup,
    PermissionQuery,
    UserStats,
    RequestBlob,
    ServerConfig,
}

impl MessageKind {
    pub const ALL: [MessageKind; 17] = [
        MessageKind::Version,
        MessageKind::UdpTunnel,
        MessageKind::Authenticate,
        MessageKind::Ping,
        MessageKind::Reject,
        MessageKind::ServerSync,
        MessageKind::ChannelRemove,
        MessageKind::ChannelState,
        MessageKind::UserRemove,
        MessageKind::UserState,
        MessageKind::TextMessage,
        MessageKind::PermissionDenied,
        MessageKind::CryptSetup,
        MessageKind::PermissionQuery,
        MessageKind::UserStats,
        MessageKind::RequestBlob,
        MessageKind::ServerConfig,
    ];

    pub fn code(self) -> u16 {
        match self {
            MessageKind::Version => msgs::id::Version,
            MessageKind::UdpTunnel => msgs::id::UDPTunnel,
            MessageKind::Authenticate => msgs::id::Authenticate,
            MessageKind::Ping => msgs::id::Ping,
            MessageKind::Reject => msgs::id::Reject,
            MessageKind::ServerSync => msgs::id::ServerSync,
            MessageKind::ChannelRemove => msgs::id::ChannelRemove,
            MessageKind::ChannelState => msgs::id::ChannelState,
            MessageKind::UserRemove => msgs::id::UserRemove,
            MessageKind::UserState => msgs::id::UserState,
            MessageKind::TextMessage => msgs::id::TextMessage,
            MessageKind::PermissionDenied => msgs::id::PermissionDenied,
            MessageKind::CryptSetup => msgs::id::CryptSetup,
            MessageKind::PermissionQuery => msgs::id::PermissionQuery,
            MessageKind::UserStats => msgs::id::UserStats,
            MessageKind::RequestBlob => msgs::id::RequestBlob,
            MessageKind::ServerConfig => msgs::id::ServerConfig,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.code() == code)
    }
}

/// Which lazily fetched attribute a RequestBlob asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlobKind {
    UserTexture,
    UserComment,
    ChannelDescription,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Version(msgs::Version),
    /// Raw voice packet; see [`crate::mumble::voice`].
    UdpTunnel(Bytes),
    Authenticate(msgs::Authenticate),
    Ping(msgs::Ping),
    Reject(msgs::Reject),
    ServerSync(msgs::ServerSync),
    ChannelRemove(msgs::ChannelRemove),
    ChannelState(msgs::ChannelState),
    UserRemove(msgs::UserRemove),
    UserState(msgs::UserState),
    TextMessage(msgs::TextMessage),
    PermissionDenied(msgs::PermissionDenied),
    CryptSetup(msgs::CryptSetup),
    PermissionQuery(msgs::PermissionQuery),
    UserStats(msgs::UserStats),
    RequestBlob(msgs::RequestBlob),
    ServerConfig(msgs::ServerConfig),
    Unknown { code: u16, payload: Bytes },
}

impl Message {
    pub fn kind(&self) -> Option<MessageKind> {
        Some(match self {
            Message::Version(_) => MessageKind::Version,
            Message::UdpTunnel(_) => MessageKind::UdpTunnel,
            Message::Authenticate(_) => MessageKind::Authenticate,
            Message::Ping(_) => MessageKind::Ping,
            Message::Reject(_) => MessageKind::Reject,
            Message::ServerSync(_) => MessageKind::ServerSync,
            Message::ChannelRemove(_) => MessageKind::ChannelRemove,
            Message::ChannelState(_) => MessageKind::ChannelState,
            Message::UserRemove(_) => MessageKind::UserRemove,
            Message::UserState(_) => MessageKind::UserState,
            Message::TextMessage(_) => MessageKind::TextMessage,
            Message::PermissionDenied(_) => MessageKind::PermissionDenied,
            Message::CryptSetup(_) => MessageKind::CryptSetup,
            Message::PermissionQuery(_) => MessageKind::PermissionQuery,
            Message::UserStats(_) => MessageKind::UserStats,
            Message::RequestBlob(_) => MessageKind::RequestBlob,
            Message::ServerConfig(_) => MessageKind::ServerConfig,
            Message::Unknown { .. } => return None,
        })
    }

    pub fn type_code(&self) -> u16 {
        match self {
            Message::Unknown { code, .. } => *code,
            known => known.kind().map_or(u16::MAX, MessageKind::code),
        }
    }

    pub fn version(release: &str) -> Self {
        let mut version = msgs::Version::new();
        version.version_v1 = Some(CLIENT_VERSION.packed());
        version.version_v2 = Some(CLIENT_VERSION.packed_v2());
        version.release = Some(release.to_string());
        version.os = Some(std::env::consts::OS.to_string());
        version.os_version = Some(std::env::consts::ARCH.to_string());
        Message::Version(version)
    }

    pub fn authenticate(username: &str, password: Option<&str>, tokens: &[String]) -> Self {
        let mut auth = msgs::Authenticate::new();
        auth.username = Some(username.to_string());
        auth.password = password.map(str::to_string);
        auth.tokens = tokens.to_vec();
        auth.opus = Some(true);
        Message::Authenticate(auth)
    }

    pub fn ping(timestamp: u64) -> Self {
        let mut ping = msgs::Ping::new();
        ping.timestamp = Some(timestamp);
        Message::Ping(ping)
    }

    pub fn text(sessions: &[u32], channels: &[u32], trees: &[u32], text: &str) -> Self {
        let mut message = msgs::TextMessage::new();
        message.session = sessions.to_vec();
        message.channel_id = channels.to_vec();
        message.tree_id = trees.to_vec();
        message.message = Some(text.to_string());
        Message::TextMessage(message)
    }

    pub fn move_user(session: u32, channel_id: u32) -> Self {
        let mut state = msgs::UserState::new();
        state.session = Some(session);
        state.channel_id = Some(channel_id);
        Message::UserState(state)
    }

    pub fn request_blob(kind: BlobKind, ids: &[u32]) -> Self {
        let mut request = msgs::RequestBlob::new();
        let target = match kind {
            BlobKind::UserTexture => &mut request.session_texture,
            BlobKind::UserComment => &mut request.session_comment,
            BlobKind::ChannelDescription => &mut request.channel_description,
        };
        target.extend_from_slice(ids);
        Message::RequestBlob(request)
    }

    pub fn user_stats(session: u32) -> Self {
        let mut stats = msgs::UserStats::new();
        stats.session = Some(session);
        stats.stats_only = Some(true);
        Message::UserStats(stats)
    }
}

impl From<Message> for RawControlPacket {
    fn from(message: Message) -> Self {
        match message {
            Message::Version(msg) => msg.into(),
            Message::UdpTunnel(packet) => RawControlPacket {
                id: msgs::id::UDPTunnel,
                bytes: packet,
            },
            Message::Authenticate(msg) => msg.into(),
            Message::Ping(msg) => msg.into(),
            Message::Reject(msg) => msg.into(),
            Message::ServerSync(msg) => msg.into(),
            Message::ChannelRemove(msg) => msg.into(),
            Message::ChannelState(msg) => msg.into(),
            Message::UserRemove(msg) => msg.into(),
            Message::UserState(msg) => msg.into(),
            Message::TextMessage(msg) => msg.into(),
            Message::PermissionDenied(msg) => msg.into(),
            Message::CryptSetup(msg) => msg.into(),
            Message::PermissionQuery(msg) => msg.into(),
            Message::UserStats(msg) => msg.into(),
            Message::RequestBlob(msg) => msg.into(),
            Message::ServerConfig(msg) => msg.into(),
            Message::Unknown { code, payload } => RawControlPacket {
                id: code,
                bytes: payload,
            },
        }
    }
}

impl TryFrom<RawControlPacket> for Message {
    type Error = DecodeError;

    /// Voice tunnel bodies stay raw so that a bad voice packet cannot fail the frame.
    fn try_from(packet: RawControlPacket) -> Result<Self, Self::Error> {
        let RawControlPacket { id, bytes } = packet;
        let Some(kind) = MessageKind::from_code(id) else {
            return Ok(Message::Unknown {
                code: id,
                payload: bytes,
            });
        };
        Ok(match kind {
            MessageKind::Version => Message::Version(body(id, bytes)?),
            MessageKind::UdpTunnel => Message::UdpTunnel(bytes),
            MessageKind::Authenticate => Message::Authenticate(body(id, bytes)?),
            MessageKind::Ping => Message::Ping(body(id, bytes)?),
            MessageKind::Reject => Message::Reject(body(id, bytes)?),
            MessageKind::ServerSync => Message::ServerSync(body(id, bytes)?),
            MessageKind::ChannelRemove => Message::ChannelRemove(body(id, bytes)?),
            MessageKind::ChannelState => Message::ChannelState(body(id, bytes)?),
            MessageKind::UserRemove => Message::UserRemove(body(id, bytes)?),
            MessageKind::UserState => Message::UserState(body(id, bytes)?),
            MessageKind::TextMessage => Message::TextMessage(body(id, bytes)?),
            MessageKind::PermissionDenied => Message::PermissionDenied(body(id, bytes)?),
            MessageKind::CryptSetup => Message::CryptSetup(body(id, bytes)?),
            MessageKind::PermissionQuery => Message::PermissionQuery(body(id, bytes)?),
            MessageKind::UserStats => Message::UserStats(body(id, bytes)?),
            MessageKind::RequestBlob => Message::RequestBlob(body(id, bytes)?),
            MessageKind::ServerConfig => Message::ServerConfig(body(id, bytes)?),
        })
    }
}

fn body<T>(type_code: u16, bytes: Bytes) -> Result<T, DecodeError>
where
    T: TryFrom<Bytes>,
    T::Error: fmt::Display,
{
    T::try_from(bytes).map_err(|err| DecodeError::Body {
        type_code,
        reason: err.to_string(),
    })
}

/// Required protobuf fields on the kinds that have them; serializing without one panics.
fn missing_required(message: &Message) -> Option<&'static str> {
    match message {
        Message::TextMessage(msg) if msg.message.is_none() => Some("message"),
        Message::ChannelRemove(msg) if msg.channel_id.is_none() => Some("channel_id"),
        Message::UserRemove(msg) if msg.session.is_none() => Some("session"),
        _ => None,
    }
}

/// Serializes a message into one complete frame.
pub fn encode(message: &Message) -> Result<BytesMut, TransportError> {
    let mut frame = BytesMut::new();
    WireCodec::new().encode(message.clone(), &mut frame)?;
    Ok(frame)
}

/// Splits a header into `(type code, declared body length)`.
pub fn parse_header(header: &[u8]) -> Result<(u16, usize), DecodeError> {
    if header.len() != HEADER_LEN {
        return Err(DecodeError::ShortHeader(header.len()));
    }
    let mut header = header;
    let code = header.get_u16();
    let length = header.get_u32() as usize;
    if length > MAX_FRAME_LEN {
        return Err(DecodeError::FrameTooLarge(length));
    }
    Ok((code, length))
}

/// Decodes one frame from its header and body. Unrecognised type codes yield [`Message::Unknown`].
pub fn decode(header: &[u8], body: &[u8]) -> Result<Message, DecodeError> {
    let (id, declared) = parse_header(header)?;
    if declared != body.len() {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }
    Message::try_from(RawControlPacket {
        id,
        bytes: Bytes::copy_from_slice(body),
    })
}

/// Incremental framing over a byte buffer that may hold partial or several frames.
#[derive(Debug, Default)]
pub struct WireCodec {
    raw: RawControlCodec,
}

impl WireCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for WireCodec {
    type Item = Message;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() >= HEADER_LEN {
            let (_, declared) = parse_header(&src[..HEADER_LEN])?;
            src.reserve((HEADER_LEN + declared).saturating_sub(src.len()));
        }
        match Decoder::decode(&mut self.raw, src)? {
            Some(packet) => Ok(Some(Message::try_from(packet)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for WireCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if let Some(field) = missing_required(&item) {
            return Err(TransportError::Protocol(format!(
                "{:?} is missing required field {field}",
                item.kind()
            )));
        }
        let packet = RawControlPacket::from(item);
        if packet.bytes.len() > MAX_FRAME_LEN {
            return Err(DecodeError::FrameTooLarge(packet.bytes.len()).into());
        }
        Encoder::encode(&mut self.raw, packet, dst)?;
        Ok(())
    }
}
