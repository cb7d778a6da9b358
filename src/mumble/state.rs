//! In-memory model of the server: channel tree and user roster.
//!
//! Entities live in maps keyed by channel id and user session. Relationships
//! are stored as ids on both sides, so an entity referenced before its own
//! state arrives is created as a placeholder and filled in later.

use std::collections::{BTreeMap, BTreeSet};

use crate::mumble::permissions::Permissions;
use crate::transport::errors::ReconcileError;

pub const ROOT_CHANNEL_ID: u32 = 0;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Channel {
    pub id: u32,
    pub name: String,
    pub description: Option<String>,
    pub description_hash: Option<Vec<u8>>,
    pub temporary: bool,
    pub position: i32,
    pub parent: Option<u32>,
    pub children: BTreeSet<u32>,
    pub users: BTreeSet<u32>,
    pub links: BTreeSet<u32>,
    /// Referenced by another entity before its own ChannelState arrived.
    pub placeholder: bool,
}

impl Channel {
    fn placeholder(id: u32) -> Self {
        Self {
            id,
            name: String::new(),
            description: None,
            description_hash: None,
            temporary: false,
            position: 0,
            parent: None,
            children: BTreeSet::new(),
            users: BTreeSet::new(),
            links: BTreeSet::new(),
            placeholder: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketStats {
    pub good: u32,
    pub late: u32,
    pub lost: u32,
    pub resync: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UserStats {
    pub from_client: PacketStats,
    pub from_server: PacketStats,
    pub online_secs: u32,
    pub idle_secs: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub session: u32,
    /// Registered account id. `Some(0)` is the superuser.
    pub id: Option<u32>,
    pub name: String,
    pub channel: u32,
    pub muted: bool,
    pub deafened: bool,
    pub suppressed: bool,
    pub self_muted: bool,
    pub self_deafened: bool,
    pub comment: Option<String>,
    pub comment_hash: Option<Vec<u8>>,
    pub texture_hash: Option<Vec<u8>>,
    pub stats: UserStats,
}

impl User {
    fn new(session: u32) -> Self {
        Self {
            session,
            id: None,
            name: String::from("Unknown"),
            channel: ROOT_CHANNEL_ID,
            muted: false,
            deafened: false,
            suppressed: false,
            self_muted: false,
            self_deafened: false,
            comment: None,
            comment_hash: None,
            texture_hash: None,
            stats: UserStats::default(),
        }
    }

    pub fn is_superuser(&self) -> bool {
        self.id == Some(0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerState {
    channels: BTreeMap<u32, Channel>,
    users: BTreeMap<u32, User>,
    root: Option<u32>,
    self_session: Option<u32>,
    permissions: Permissions,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, id: u32) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn user(&self, session: u32) -> Option<&User> {
        self.users.get(&session)
    }

    pub fn root(&self) -> Option<&Channel> {
        self.root.and_then(|id| self.channel(id))
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn channel_by_name(&self, name: &str) -> Option<&Channel> {
        self.channels.values().find(|channel| channel.name == name)
    }

    pub fn user_by_name(&self, name: &str) -> Option<&User> {
        self.users.values().find(|user| user.name == name)
    }

    pub fn self_session(&self) -> Option<u32> {
        self.self_session
    }

    pub fn self_user(&self) -> Option<&User> {
        self.self_session.and_then(|session| self.user(session))
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    /// Children of `id` in display order.
    pub fn children(&self, id: u32) -> Vec<&Channel> {
        let mut children: Vec<_> = self
            .channel(id)
            .into_iter()
            .flat_map(|channel| channel.children.iter())
            .filter_map(|child| self.channel(*child))
            .collect();
        children.sort_by(|a, b| (a.position, &a.name).cmp(&(b.position, &b.name)));
        children
    }

    /// `id` and every channel below it.
    pub fn subtree(&self, id: u32) -> BTreeSet<u32> {
        let mut found = BTreeSet::new();
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            if let Some(channel) = self.channel(next) {
                if found.insert(next) {
                    pending.extend(channel.children.iter().copied());
                }
            }
        }
        found
    }

    /// Whether `ancestor` is on the parent chain of `id` (or is `id`).
    pub fn is_ancestor(&self, ancestor: u32, id: u32) -> bool {
        let mut current = Some(id);
        let mut steps = 0;
        while let Some(next) = current {
            if next == ancestor {
                return true;
            }
            steps += 1;
            if steps > self.channels.len() {
                break;
            }
            current = self.channel(next).and_then(|channel| channel.parent);
        }
        false
    }

    pub(crate) fn channel_mut(&mut self, id: u32) -> Option<&mut Channel> {
        self.channels.get_mut(&id)
    }

    pub(crate) fn user_mut(&mut self, session: u32) -> Option<&mut User> {
        self.users.get_mut(&session)
    }

    pub(crate) fn ensure_channel(&mut self, id: u32) -> &mut Channel {
        self.channels
            .entry(id)
            .or_insert_with(|| Channel::placeholder(id))
    }

    pub(crate) fn declare_root(&mut self, id: u32) -> Result<(), ReconcileError> {
        if let Some(existing) = self.root.filter(|existing| *existing != id) {
            return Err(ReconcileError::DuplicateRoot {
                existing,
                declared: id,
            });
        }
        if id != ROOT_CHANNEL_ID {
            return Err(ReconcileError::InvalidRoot(id));
        }
        self.detach(id);
        self.ensure_channel(id);
        self.root = Some(id);
        Ok(())
    }

    /// Re-parents `id` under `parent`. Returns false when that would create a cycle.
    pub(crate) fn set_parent(&mut self, id: u32, parent: u32) -> bool {
        if self.channel(id).and_then(|channel| channel.parent) == Some(parent) {
            return true;
        }
        if self.is_ancestor(id, parent) {
            return false;
        }
        self.detach(id);
        self.ensure_channel(parent).children.insert(id);
        self.ensure_channel(id).parent = Some(parent);
        true
    }

    fn detach(&mut self, id: u32) {
        let old_parent = self.channel_mut(id).and_then(|channel| channel.parent.take());
        if let Some(old_parent) = old_parent {
            if let Some(parent) = self.channel_mut(old_parent) {
                parent.children.remove(&id);
            }
        }
    }

    /// Creates the user in the root channel if unseen. Returns true when created.
    pub(crate) fn ensure_user(&mut self, session: u32) -> bool {
        if self.users.contains_key(&session) {
            return false;
        }
        self.users.insert(session, User::new(session));
        self.ensure_channel(ROOT_CHANNEL_ID).users.insert(session);
        true
    }

    /// Moves a user, keeping both channels' membership sets in step.
    pub(crate) fn place_user(&mut self, session: u32, channel_id: u32) {
        let Some(old_channel) = self.user(session).map(|user| user.channel) else {
            return;
        };
        if let Some(old) = self.channel_mut(old_channel) {
            old.users.remove(&session);
        }
        self.ensure_channel(channel_id).users.insert(session);
        if let Some(user) = self.user_mut(session) {
            user.channel = channel_id;
        }
    }

    /// Records the first user ever seen as ourselves, unless already known.
    pub(crate) fn claim_self(&mut self, session: u32) {
        if self.self_session.is_none() {
            self.self_session = Some(session);
        }
    }

    pub(crate) fn set_self_session(&mut self, session: u32) {
        self.self_session = Some(session);
    }

    pub(crate) fn permissions_mut(&mut self) -> &mut Permissions {
        &mut self.permissions
    }

    /// Drops the whole roster and tree on disconnect.
    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }
}
