//! Voice tunnel packets.
//!
//! Parsing and serialization go through `mumble_protocol_2x`'s voice codec.
//! Its encoder writes whatever length it is given into the frame headers, so
//! [`encode`] checks every frame against the header width first.

use bytes::{Bytes, BytesMut};
use mumble_protocol_2x::voice::VoiceCodec;
use tokio_util::codec::Encoder;

pub use mumble_protocol_2x::voice::{
    Clientbound, Serverbound, VoicePacket, VoicePacketDst, VoicePacketPayload,
};

use crate::transport::errors::VoiceError;

/// Longest CELT or Speex frame; the eighth header bit is the continuation flag.
pub const MAX_FRAME_LEN: usize = 0x7f;
/// Longest Opus frame; bit 0x2000 of the length varint marks end of transmission.
pub const MAX_OPUS_FRAME_LEN: usize = 0x1fff;

const MAX_TARGET: u8 = 0x1f;

/// Who a server-relayed voice packet was addressed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoiceTarget {
    Talk,
    WhisperChannel,
    WhisperSelf,
    /// Client-to-server targets and loopback; never forwarded to bots.
    Other(u8),
}

impl VoiceTarget {
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            0 => VoiceTarget::Talk,
            1 => VoiceTarget::WhisperChannel,
            2 => VoiceTarget::WhisperSelf,
            other => VoiceTarget::Other(other),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            VoiceTarget::Talk => 0,
            VoiceTarget::WhisperChannel => 1,
            VoiceTarget::WhisperSelf => 2,
            VoiceTarget::Other(other) => other,
        }
    }
}

/// Parses a server-relayed voice packet.
pub fn parse(packet: Bytes) -> Result<VoicePacket<Clientbound>, VoiceError> {
    Ok(VoicePacket::try_from(packet)?)
}

/// Serializes a voice packet, refusing frames whose length the header cannot hold.
pub fn encode<Dst: VoicePacketDst>(packet: VoicePacket<Dst>) -> Result<Bytes, VoiceError> {
    check(&packet)?;
    let mut out = BytesMut::new();
    Encoder::encode(&mut VoiceCodec::<Dst, Dst>::default(), packet, &mut out)?;
    Ok(out.freeze())
}

/// Audio frames of a payload in transmission order.
pub fn frames(payload: VoicePacketPayload) -> Vec<Bytes> {
    match payload {
        VoicePacketPayload::CeltAlpha(frames)
        | VoicePacketPayload::CeltBeta(frames)
        | VoicePacketPayload::Speex(frames) => frames,
        VoicePacketPayload::Opus(frame, _) => vec![frame],
        _ => Vec::new(),
    }
}

fn check<Dst: VoicePacketDst>(packet: &VoicePacket<Dst>) -> Result<(), VoiceError> {
    let VoicePacket::Audio {
        target, payload, ..
    } = packet
    else {
        return Ok(());
    };
    if *target > MAX_TARGET {
        return Err(VoiceError::Target(*target));
    }
    match payload {
        VoicePacketPayload::CeltAlpha(frames) => check_frames("CELT Alpha", frames),
        VoicePacketPayload::CeltBeta(frames) => check_frames("CELT Beta", frames),
        VoicePacketPayload::Speex(frames) => check_frames("Speex", frames),
        VoicePacketPayload::Opus(frame, _) => check_len("Opus", frame.len(), MAX_OPUS_FRAME_LEN),
        _ => Ok(()),
    }
}

fn check_frames(codec: &'static str, frames: &[Bytes]) -> Result<(), VoiceError> {
    if frames.is_empty() {
        return Err(VoiceError::NoFrames);
    }
    frames
        .iter()
        .try_for_each(|frame| check_len(codec, frame.len(), MAX_FRAME_LEN))
}

fn check_len(codec: &'static str, len: usize, max: usize) -> Result<(), VoiceError> {
    if len > max {
        return Err(VoiceError::FrameTooLong { codec, len, max });
    }
    Ok(())
}
