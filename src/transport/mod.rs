pub mod errors;
#[cfg(test)]
pub(crate) mod memory;
pub mod tls;
pub mod types;

pub use errors::{
    ConnectError, DecodeError, ReconcileError, Rejection, TransportError, VoiceError,
};
pub use tls::{Readiness, TlsTransport, Transport};
pub use types::{ConnState, ProtocolVersion, RejectType, ServerStatus};
