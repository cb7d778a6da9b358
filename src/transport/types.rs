use std::fmt;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Handshaking,
    Ready,
    Rejected,
    Closed,
}

impl ConnState {
    /// Terminal states never transition again for the same connection.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnState::Rejected | ConnState::Closed)
    }
}

/// Reason codes carried by a Reject message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectType {
    None,
    WrongVersion,
    InvalidUsername,
    WrongUserPw,
    WrongServerPw,
    UsernameInUse,
    ServerFull,
    NoCertificate,
    AuthenticatorFail,
    Other(i32),
}

impl RejectType {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => RejectType::None,
            1 => RejectType::WrongVersion,
            2 => RejectType::InvalidUsername,
            3 => RejectType::WrongUserPw,
            4 => RejectType::WrongServerPw,
            5 => RejectType::UsernameInUse,
            6 => RejectType::ServerFull,
            7 => RejectType::NoCertificate,
            8 => RejectType::AuthenticatorFail,
            other => RejectType::Other(other),
        }
    }
}

impl fmt::Display for RejectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectType::Other(code) => write!(f, "Other({code})"),
            known => fmt::Debug::fmt(known, f),
        }
    }
}

/// Protocol version. Older peers pack it as `major << 16 | minor << 8 | patch`,
/// newer ones as `major << 48 | minor << 32 | patch << 16`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u8,
    pub patch: u8,
}

impl ProtocolVersion {
    pub const fn new(major: u16, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn from_packed(packed: u32) -> Self {
        Self {
            major: (packed >> 16) as u16,
            minor: ((packed >> 8) & 0xff) as u8,
            patch: (packed & 0xff) as u8,
        }
    }

    pub fn packed(self) -> u32 {
        (u32::from(self.major) << 16) | (u32::from(self.minor) << 8) | u32::from(self.patch)
    }

    pub fn from_packed_v2(packed: u64) -> Self {
        Self {
            major: (packed >> 48) as u16,
            minor: ((packed >> 32) & 0xffff).min(0xff) as u8,
            patch: ((packed >> 16) & 0xffff).min(0xff) as u8,
        }
    }

    pub fn packed_v2(self) -> u64 {
        (u64::from(self.major) << 48) | (u64::from(self.minor) << 32) | (u64::from(self.patch) << 16)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Answer to an out-of-band UDP status probe.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerStatus {
    pub version: ProtocolVersion,
    pub users: u32,
    pub max_users: u32,
    pub max_bandwidth: u32,
    pub latency: Duration,
}
