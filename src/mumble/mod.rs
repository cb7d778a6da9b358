pub mod client;
pub mod codec;
pub mod config;
pub mod control;
pub mod events;
pub mod keepalive;
pub mod permissions;
pub mod reconcile;
pub mod server;
pub mod state;
pub mod voice;

pub use client::MumbleClient;
pub use codec::{BlobKind, Message, MessageKind, WireCodec};
pub use config::MumbleConfig;
pub use control::{Connection, ControlHandle, HandshakeRequest, SessionInfo, Timing};
pub use events::{
    Audience, Event, EventHandler, EventQueue, PermissionDenied, TextMessage, VoiceFrame,
};
pub use permissions::{Permission, Permissions};
pub use reconcile::{Outcome, Reconciler};
pub use server::{ServerDescriptor, TlsOptions};
pub use state::{Channel, ServerState, User};
pub use voice::{VoicePacket, VoicePacketPayload, VoiceTarget};
