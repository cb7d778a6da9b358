use std::fmt;

/// Named permission flags as granted by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Permission {
    Write,
    Traverse,
    Enter,
    Speak,
    MuteDeafen,
    Move,
    MakeChannel,
    LinkChannel,
    Whisper,
    TextMessage,
    MakeTempChannel,
    Kick,
    Ban,
    Register,
    SelfRegister,
    Cached,
    All,
}

impl Permission {
    pub const TABLE: [(Permission, &'static str, u64); 17] = [
        (Permission::Write, "Write", 0x1),
        (Permission::Traverse, "Traverse", 0x2),
        (Permission::Enter, "Enter", 0x4),
        (Permission::Speak, "Speak", 0x8),
        (Permission::MuteDeafen, "MuteDeafen", 0x10),
        (Permission::Move, "Move", 0x20),
        (Permission::MakeChannel, "MakeChannel", 0x40),
        (Permission::LinkChannel, "LinkChannel", 0x80),
        (Permission::Whisper, "Whisper", 0x100),
        (Permission::TextMessage, "TextMessage", 0x200),
        (Permission::MakeTempChannel, "MakeTempChannel", 0x400),
        // Root channel only.
        (Permission::Kick, "Kick", 0x1_0000),
        (Permission::Ban, "Ban", 0x2_0000),
        (Permission::Register, "Register", 0x4_0000),
        (Permission::SelfRegister, "SelfRegister", 0x8_0000),
        (Permission::Cached, "Cached", 0x800_0000),
        (Permission::All, "All", 0xf_07ff),
    ];

    fn entry(self) -> (Permission, &'static str, u64) {
        Self::TABLE
            .iter()
            .copied()
            .find(|(permission, _, _)| *permission == self)
            .unwrap_or((self, "", 0))
    }

    pub fn bits(self) -> u64 {
        self.entry().2
    }

    pub fn name(self) -> &'static str {
        self.entry().1
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::TABLE
            .iter()
            .find(|(_, known, _)| known.eq_ignore_ascii_case(name))
            .map(|(permission, _, _)| *permission)
    }
}

/// Global permission snapshot. Replaced wholesale whenever the server sends a new grant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Permissions(u64);

impl Permissions {
    pub const fn new(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn has(self, permission: Permission) -> bool {
        let bits = permission.bits();
        self.0 & bits == bits
    }

    #[must_use]
    pub fn with(self, permission: Permission) -> Self {
        Self(self.0 | permission.bits())
    }

    #[must_use]
    pub fn without(self, permission: Permission) -> Self {
        Self(self.0 & !permission.bits())
    }

    pub fn replace(&mut self, bits: u64) {
        self.0 = bits;
    }

    pub fn granted(self) -> impl Iterator<Item = Permission> {
        Permission::TABLE
            .into_iter()
            .filter(move |(permission, _, _)| self.has(*permission))
            .map(|(permission, _, _)| permission)
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.granted().map(Permission::name).collect();
        write!(f, "({})", names.join(","))
    }
}
