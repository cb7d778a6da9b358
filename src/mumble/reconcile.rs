//! Applies decoded messages to the server model and derives bot-level events.
//!
//! The reconciler never touches the transport. Anything it wants sent (blob
//! fetches, stats refreshes) comes back as a request in the [`Outcome`] for
//! the connection engine to write.

use std::collections::HashMap;

use bytes::Bytes;
use log::{debug, warn};
use mumble_protocol_2x::control::msgs;

use crate::mumble::codec::{BlobKind, Message};
use crate::mumble::events::{Audience, Event, PermissionDenied, TextMessage, VoiceFrame};
use crate::mumble::state::{PacketStats, ServerState, ROOT_CHANNEL_ID};
use crate::mumble::voice::{self, VoicePacket, VoiceTarget};
use crate::transport::errors::ReconcileError;

#[derive(Debug, Default, PartialEq)]
pub struct Outcome {
    pub events: Vec<Event>,
    pub requests: Vec<Message>,
}

/// What a fetched blob will be stored on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum BlobSubject {
    UserComment(u32),
    ChannelDescription(u32),
}

#[derive(Debug, Default)]
pub struct Reconciler {
    /// Hash requested per subject, cleared when the value arrives.
    pending_blobs: HashMap<BlobSubject, Vec<u8>>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one message. Errors are fatal to the connection; every other
    /// anomaly is logged and the offending update skipped.
    pub fn apply(
        &mut self,
        state: &mut ServerState,
        message: Message,
    ) -> Result<Outcome, ReconcileError> {
        let mut outcome = Outcome::default();
        match message {
            Message::ServerSync(sync) => on_server_sync(state, &sync),
            Message::ChannelState(channel) => self.on_channel_state(state, channel, &mut outcome)?,
            Message::UserState(user) => self.on_user_state(state, user, &mut outcome),
            Message::TextMessage(text) => on_text_message(state, text, &mut outcome),
            Message::UdpTunnel(packet) => on_voice(state, packet, &mut outcome),
            Message::UserStats(stats) => on_user_stats(state, &stats),
            Message::PermissionQuery(query) => on_permission_query(state, &query),
            Message::PermissionDenied(denied) => on_permission_denied(denied, &mut outcome),
            Message::ChannelRemove(remove) => {
                debug!("ignoring removal of channel {:?}", remove.channel_id);
            }
            Message::UserRemove(remove) => {
                debug!("ignoring removal of user {:?}", remove.session);
            }
            Message::Unknown { code, payload } => {
                warn!(
                    "dropping message with unknown type {code} ({} bytes)",
                    payload.len()
                );
            }
            // Connection-level messages are consumed by the engine.
            Message::Version(_)
            | Message::Ping(_)
            | Message::Reject(_)
            | Message::CryptSetup(_)
            | Message::ServerConfig(_) => {}
            Message::Authenticate(_) => warn!("server sent a client-only Authenticate message"),
            Message::RequestBlob(_) => warn!("server sent a client-only RequestBlob message"),
        }
        Ok(outcome)
    }

    fn on_channel_state(
        &mut self,
        state: &mut ServerState,
        msg: msgs::ChannelState,
        outcome: &mut Outcome,
    ) -> Result<(), ReconcileError> {
        let Some(id) = msg.channel_id else {
            warn!("channel state without a channel id");
            return Ok(());
        };

        match msg.parent {
            Some(parent) if parent == id => state.declare_root(id)?,
            None if id == ROOT_CHANNEL_ID => state.declare_root(id)?,
            Some(parent) if id == ROOT_CHANNEL_ID => {
                warn!("ignoring parent {parent} declared for the root channel");
            }
            Some(parent) => {
                if !state.set_parent(id, parent) {
                    warn!("ignoring move of channel {id} under {parent}: it would create a cycle");
                }
            }
            None => {}
        }

        let channel = state.ensure_channel(id);
        channel.placeholder = false;
        if let Some(name) = msg.name {
            channel.name = name;
        }
        if let Some(temporary) = msg.temporary {
            channel.temporary = temporary;
        }
        if let Some(position) = msg.position {
            channel.position = position;
        }
        if !msg.links.is_empty() {
            channel.links = msg.links.into_iter().collect();
        }
        channel.links.extend(msg.links_add);
        for link in &msg.links_remove {
            channel.links.remove(link);
        }

        let subject = BlobSubject::ChannelDescription(id);
        if let Some(description) = msg.description {
            channel.description = Some(description);
            if msg.description_hash.is_some() {
                channel.description_hash = msg.description_hash;
            }
            self.pending_blobs.remove(&subject);
        } else if let Some(hash) = msg.description_hash {
            let have_value =
                channel.description.is_some() && channel.description_hash.as_ref() == Some(&hash);
            if !have_value && self.begin_fetch(subject, &hash) {
                outcome
                    .requests
                    .push(Message::request_blob(BlobKind::ChannelDescription, &[id]));
            }
            channel.description_hash = Some(hash);
        }
        Ok(())
    }

    fn on_user_state(
        &mut self,
        state: &mut ServerState,
        msg: msgs::UserState,
        outcome: &mut Outcome,
    ) {
        let Some(session) = msg.session else {
            warn!("user state without a session");
            return;
        };

        if state.ensure_user(session) {
            state.claim_self(session);
            debug!("user {session} appeared");
        }
        if let Some(channel_id) = msg.channel_id {
            state.place_user(session, channel_id);
        }

        let Some(user) = state.user_mut(session) else {
            return;
        };
        if let Some(name) = msg.name {
            user.name = name;
        }
        if msg.user_id.is_some() {
            user.id = msg.user_id;
        }
        if let Some(mute) = msg.mute {
            user.muted = mute;
        }
        if let Some(deaf) = msg.deaf {
            user.deafened = deaf;
        }
        if let Some(suppress) = msg.suppress {
            user.suppressed = suppress;
        }
        if let Some(self_mute) = msg.self_mute {
            user.self_muted = self_mute;
        }
        if let Some(self_deaf) = msg.self_deaf {
            user.self_deafened = self_deaf;
        }
        if msg.texture_hash.is_some() {
            user.texture_hash = msg.texture_hash;
        }

        let subject = BlobSubject::UserComment(session);
        if let Some(comment) = msg.comment {
            user.comment = Some(comment);
            if msg.comment_hash.is_some() {
                user.comment_hash = msg.comment_hash;
            }
            self.pending_blobs.remove(&subject);
        } else if let Some(hash) = msg.comment_hash {
            let have_value = user.comment.is_some() && user.comment_hash.as_ref() == Some(&hash);
            if !have_value && self.begin_fetch(subject, &hash) {
                outcome
                    .requests
                    .push(Message::request_blob(BlobKind::UserComment, &[session]));
            }
            user.comment_hash = Some(hash);
        }

        outcome.requests.push(Message::user_stats(session));
    }

    /// Marks `hash` as in flight for `subject`. False when it already is.
    fn begin_fetch(&mut self, subject: BlobSubject, hash: &[u8]) -> bool {
        if self.pending_blobs.get(&subject).map(Vec::as_slice) == Some(hash) {
            return false;
        }
        self.pending_blobs.insert(subject, hash.to_vec());
        true
    }
}

fn on_server_sync(state: &mut ServerState, sync: &msgs::ServerSync) {
    if let Some(session) = sync.session {
        state.set_self_session(session);
    }
    if let Some(bits) = sync.permissions {
        state.permissions_mut().replace(bits);
    }
}

fn on_permission_query(state: &mut ServerState, query: &msgs::PermissionQuery) {
    let channel = query.channel_id.unwrap_or(ROOT_CHANNEL_ID);
    match query.permissions {
        Some(bits) if channel == ROOT_CHANNEL_ID => {
            state.permissions_mut().replace(u64::from(bits));
        }
        Some(bits) => debug!("ignoring permissions {bits:#x} for channel {channel}"),
        None => {}
    }
}

fn on_permission_denied(denied: msgs::PermissionDenied, outcome: &mut Outcome) {
    warn!(
        "permission denied (permission {:?}, channel {:?}): {}",
        denied.permission,
        denied.channel_id,
        denied.reason.as_deref().unwrap_or("no reason given")
    );
    outcome.events.push(Event::PermissionDenied(PermissionDenied {
        permission: denied.permission,
        channel: denied.channel_id,
        reason: denied.reason,
    }));
}

fn on_user_stats(state: &mut ServerState, msg: &msgs::UserStats) {
    let Some(session) = msg.session else {
        warn!("user stats without a session");
        return;
    };
    let Some(user) = state.user_mut(session) else {
        warn!("stats for unknown user {session}");
        return;
    };
    if let Some(from_client) = msg.from_client.as_ref() {
        user.stats.from_client = packet_stats(from_client);
    }
    if let Some(from_server) = msg.from_server.as_ref() {
        user.stats.from_server = packet_stats(from_server);
    }
    if let Some(online) = msg.onlinesecs {
        user.stats.online_secs = online;
    }
    if let Some(idle) = msg.idlesecs {
        user.stats.idle_secs = idle;
    }
}

fn packet_stats(stats: &msgs::user_stats::Stats) -> PacketStats {
    PacketStats {
        good: stats.good.unwrap_or_default(),
        late: stats.late.unwrap_or_default(),
        lost: stats.lost.unwrap_or_default(),
        resync: stats.resync.unwrap_or_default(),
    }
}

fn on_text_message(state: &ServerState, msg: msgs::TextMessage, outcome: &mut Outcome) {
    let actor = msg.actor;
    if let Some(actor) = actor.filter(|actor| state.user(*actor).is_none()) {
        warn!("text message from unknown user {actor}");
    }

    let me = state.self_session();
    let mut to_me = false;
    let mut users = Vec::new();
    for session in msg.session {
        if Some(session) == me {
            to_me = true;
        } else if state.user(session).is_some() {
            users.push(session);
        } else {
            warn!("text message addressed to unknown user {session}");
        }
    }
    let channels = known_channels(state, msg.channel_id);
    let trees = known_channels(state, msg.tree_id);

    let text = msg.message.unwrap_or_default();
    let mut raise = |audience: Audience| {
        outcome.events.push(Event::Text(TextMessage {
            actor,
            audience,
            message: text.clone(),
        }));
    };
    if to_me {
        raise(Audience::Me);
    }
    if !users.is_empty() {
        raise(Audience::Users(users));
    }
    if !channels.is_empty() {
        raise(Audience::Channels(channels));
    }
    if !trees.is_empty() {
        raise(Audience::Trees(trees));
    }
}

fn known_channels(state: &ServerState, ids: Vec<u32>) -> Vec<u32> {
    ids.into_iter()
        .filter(|id| {
            let known = state.channel(*id).is_some();
            if !known {
                warn!("text message addressed to unknown channel {id}");
            }
            known
        })
        .collect()
}

fn on_voice(state: &ServerState, packet: Bytes, outcome: &mut Outcome) {
    let (target, session, sequence, payload) = match voice::parse(packet) {
        Ok(VoicePacket::Audio {
            target,
            session_id,
            seq_num,
            payload,
            ..
        }) => (VoiceTarget::from_bits(target), session_id, seq_num as i64, payload),
        Ok(VoicePacket::Ping { timestamp }) => {
            debug!("tunnelled voice ping {timestamp}");
            return;
        }
        Err(err) => {
            warn!("dropping voice packet: {err}");
            return;
        }
    };
    if let VoiceTarget::Other(bits) = target {
        debug!("ignoring voice packet with target {bits}");
        return;
    }
    if state.user(session).is_none() {
        warn!("voice from unknown user {session}");
        return;
    }
    outcome
        .events
        .extend(voice::frames(payload).into_iter().map(|payload| {
            Event::Voice(VoiceFrame {
                session,
                sequence,
                target,
                payload,
            })
        }));
}
