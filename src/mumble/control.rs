//! Connection engine: handshake, keepalive, the receive/dispatch thread and
//! the send path shared by every caller.
//!
//! One lock guards the transport's write side together with the keepalive
//! state, and it is only held for the duration of a write. The receive thread
//! is the sole writer of the server model; callers read it through
//! [`ControlHandle`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use mumble_protocol_2x::control::msgs;
use parking_lot::{Mutex, RwLock};
use tokio_util::codec::Decoder;

use crate::mumble::codec::{self, BlobKind, Message, WireCodec};
use crate::mumble::events::{self, Event, EventHandler};
use crate::mumble::keepalive::{KeepAlive, PING_INTERVAL};
use crate::mumble::permissions::Permissions;
use crate::mumble::reconcile::Reconciler;
use crate::mumble::state::{Channel, PacketStats, ServerState, User};
use crate::transport::errors::{Rejection, TransportError};
use crate::transport::tls::{Readiness, Transport};
use crate::transport::types::{ConnState, ProtocolVersion, RejectType};

const READ_CHUNK: usize = 4096;

/// Intervals the receive loop runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timing {
    /// Longest wait for inbound data before the loop checks for shutdown and due pings.
    pub poll_interval: Duration,
    /// Delay between a ping reply and the next ping, and the resend deadline for an unanswered one.
    pub ping_interval: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            ping_interval: PING_INTERVAL,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub username: String,
    pub password: Option<String>,
    pub tokens: Vec<String>,
    pub release: String,
}

/// What the server told us about the session and itself.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionInfo {
    pub session: Option<u32>,
    pub max_bandwidth: Option<u32>,
    pub welcome_text: Option<String>,
    pub server_version: Option<ProtocolVersion>,
    pub server_release: Option<String>,
    pub server_os: Option<String>,
    pub allow_html: Option<bool>,
    pub message_length: Option<u32>,
    pub image_message_length: Option<u32>,
    pub max_users: Option<u32>,
    /// Round trip of the last answered keepalive ping.
    pub rtt: Option<Duration>,
    /// Packet counters the server reports in its ping replies.
    pub server_packets: PacketStats,
}

/// Write side of the transport plus the state that must change with it.
struct Link {
    keepalive: KeepAlive,
    closed: bool,
    failure: Option<TransportError>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    link: Mutex<Link>,
    running: AtomicBool,
    conn_state: Mutex<ConnState>,
    session: RwLock<SessionInfo>,
    state: RwLock<ServerState>,
    epoch: Instant,
}

impl Shared {
    fn since_start(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// Writes a frame with the link already locked. A failed write closes the link.
    fn write_locked(&self, link: &mut Link, frame: &[u8]) -> Result<(), TransportError> {
        if link.closed {
            return Err(TransportError::Disconnected);
        }
        if let Err(err) = self.transport.write_all(frame) {
            log::error!("write to server failed: {err}");
            link.closed = true;
            link.failure.get_or_insert_with(|| err.clone());
            self.running.store(false, Ordering::SeqCst);
            return Err(err);
        }
        Ok(())
    }

    fn start_keepalive(&self) -> Result<(), TransportError> {
        let mut link = self.link.lock();
        match link.keepalive.start(self.since_start()) {
            Some(timestamp) => self.write_ping(&mut link, timestamp),
            None => Ok(()),
        }
    }

    fn ping_if_due(&self) -> Result<(), TransportError> {
        let mut link = self.link.lock();
        match link.keepalive.poll(self.since_start()) {
            Some(timestamp) => self.write_ping(&mut link, timestamp),
            None => Ok(()),
        }
    }

    fn write_ping(&self, link: &mut Link, timestamp: u64) -> Result<(), TransportError> {
        log::debug!("sending ping {timestamp}");
        let frame = codec::encode(&Message::ping(timestamp))?;
        self.write_locked(link, &frame)
    }

    fn set_conn_state(&self, next: ConnState) {
        let mut current = self.conn_state.lock();
        if current.is_terminal() {
            return;
        }
        *current = next;
    }
}

/// Cheap clonable handle for sending commands and reading the server model.
#[derive(Clone)]
pub struct ControlHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ControlHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlHandle")
            .field("conn_state", &self.conn_state())
            .field("running", &self.is_running())
            .finish()
    }
}

impl ControlHandle {
    /// Encodes and writes one message. Safe to call from any thread.
    pub fn send(&self, message: &Message) -> Result<(), TransportError> {
        let frame = codec::encode(message)?;
        let mut link = self.shared.link.lock();
        self.shared.write_locked(&mut link, &frame)
    }

    pub fn send_text(&self, session: u32, text: &str) -> Result<(), TransportError> {
        self.send(&Message::text(&[session], &[], &[], text))
    }

    pub fn send_channel_text(&self, channel_id: u32, text: &str) -> Result<(), TransportError> {
        self.send(&Message::text(&[], &[channel_id], &[], text))
    }

    pub fn move_user(&self, session: u32, channel_id: u32) -> Result<(), TransportError> {
        self.send(&Message::move_user(session, channel_id))
    }

    /// Moves ourselves. The channel must already be known.
    pub fn join_channel(&self, channel_id: u32) -> Result<(), TransportError> {
        let session = self
            .shared
            .state
            .read()
            .self_session()
            .ok_or_else(|| TransportError::Protocol("missing session id".to_string()))?;
        if self.channel(channel_id).is_none() {
            return Err(TransportError::Protocol(format!(
                "unknown channel {channel_id}"
            )));
        }
        self.move_user(session, channel_id)
    }

    pub fn request_blob(&self, kind: BlobKind, ids: &[u32]) -> Result<(), TransportError> {
        self.send(&Message::request_blob(kind, ids))
    }

    pub fn request_user_stats(&self, session: u32) -> Result<(), TransportError> {
        self.send(&Message::user_stats(session))
    }

    /// Asks the receive thread to finish. It exits within one poll interval.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.link.lock().closed = true;
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn conn_state(&self) -> ConnState {
        *self.shared.conn_state.lock()
    }

    pub fn session_info(&self) -> SessionInfo {
        self.shared.session.read().clone()
    }

    pub fn permissions(&self) -> Permissions {
        self.shared.state.read().permissions()
    }

    /// Runs `f` against the server model under a read lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&ServerState) -> R) -> R {
        f(&self.shared.state.read())
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.with_state(|state| state.channels().cloned().collect())
    }

    pub fn users(&self) -> Vec<User> {
        self.with_state(|state| state.users().cloned().collect())
    }

    pub fn channel(&self, id: u32) -> Option<Channel> {
        self.with_state(|state| state.channel(id).cloned())
    }

    pub fn user(&self, session: u32) -> Option<User> {
        self.with_state(|state| state.user(session).cloned())
    }

    pub fn channel_by_name(&self, name: &str) -> Option<Channel> {
        self.with_state(|state| state.channel_by_name(name).cloned())
    }

    pub fn user_by_name(&self, name: &str) -> Option<User> {
        self.with_state(|state| state.user_by_name(name).cloned())
    }

    pub fn self_user(&self) -> Option<User> {
        self.with_state(|state| state.self_user().cloned())
    }
}

/// How the receive loop ended without a transport failure.
enum Exit {
    Stopped,
    Rejected,
}

/// Receive-thread state. Owned by that thread alone.
struct Receiver {
    control: ControlHandle,
    request: HandshakeRequest,
    handler: Box<dyn EventHandler>,
    reconciler: Reconciler,
    codec: WireCodec,
    buffer: BytesMut,
    poll_interval: Duration,
}

impl Receiver {
    fn run(mut self) {
        let result = self.pump();
        let failure = self.shared().link.lock().failure.take();
        let result = match (result, failure) {
            (_, Some(err)) => Err(err),
            // A send raced with stop(); that is still a clean shutdown.
            (Err(TransportError::Disconnected), None) if !self.control.is_running() => {
                Ok(Exit::Stopped)
            }
            (result, None) => result,
        };
        self.finish(result);
    }

    fn shared(&self) -> &Shared {
        &self.control.shared
    }

    fn pump(&mut self) -> Result<Exit, TransportError> {
        while self.control.is_running() {
            self.shared().ping_if_due()?;
            match self
                .shared()
                .transport
                .wait_readable(self.poll_interval)?
            {
                Readiness::Idle => continue,
                Readiness::Closed => return Err(TransportError::Closed),
                Readiness::Readable => {}
            }
            if !self.fill()? {
                return Err(TransportError::Closed);
            }
            while let Some(message) = self.codec.decode(&mut self.buffer)? {
                if let Some(exit) = self.dispatch(message)? {
                    return Ok(exit);
                }
                if !self.control.is_running() {
                    break;
                }
            }
        }
        Ok(Exit::Stopped)
    }

    /// Appends whatever is readable. False on end of stream.
    fn fill(&mut self) -> Result<bool, TransportError> {
        let mut chunk = [0u8; READ_CHUNK];
        match self.shared().transport.read(&mut chunk)? {
            Some(0) => Ok(false),
            Some(count) => {
                self.buffer.extend_from_slice(&chunk[..count]);
                Ok(true)
            }
            None => Ok(true),
        }
    }

    fn dispatch(&mut self, message: Message) -> Result<Option<Exit>, TransportError> {
        // Unknown kinds are logged by the reconciler.
        if let Some(kind) = message.kind() {
            log::debug!("received {kind:?}");
        }
        let mut synced = false;
        match &message {
            Message::Version(version) => self.on_version(version)?,
            Message::CryptSetup(_) => self.shared().start_keepalive()?,
            Message::Ping(ping) => self.on_ping(ping),
            Message::ServerSync(sync) => {
                self.on_server_sync(sync);
                synced = true;
            }
            Message::ServerConfig(config) => self.on_server_config(config),
            Message::Reject(reject) => {
                self.on_reject(reject);
                return Ok(Some(Exit::Rejected));
            }
            _ => {}
        }

        let outcome = {
            let mut state = self.control.shared.state.write();
            self.reconciler.apply(&mut state, message)?
        };
        for request in &outcome.requests {
            self.control.send(request)?;
        }
        if synced {
            self.shared().set_conn_state(ConnState::Ready);
            self.emit(Event::Connected);
        }
        for event in outcome.events {
            self.emit(event);
        }
        Ok(None)
    }

    fn on_version(&mut self, version: &msgs::Version) -> Result<(), TransportError> {
        let server_version = version
            .version_v2
            .map(ProtocolVersion::from_packed_v2)
            .or_else(|| version.version_v1.map(ProtocolVersion::from_packed));
        {
            let mut session = self.shared().session.write();
            session.server_version = server_version;
            session.server_release = version.release.clone();
            session.server_os = version.os.clone();
        }
        log::debug!(
            "server version {:?} ({})",
            server_version,
            version.release.as_deref().unwrap_or("unknown release")
        );
        let request = &self.request;
        let authenticate = Message::authenticate(
            &request.username,
            request.password.as_deref(),
            &request.tokens,
        );
        self.control.send(&authenticate)
    }

    fn on_ping(&mut self, ping: &msgs::Ping) {
        let rtt = ping.timestamp.and_then(|echoed| {
            self.shared()
                .link
                .lock()
                .keepalive
                .on_reply(echoed, self.shared().since_start())
        });
        let mut session = self.shared().session.write();
        if let Some(rtt) = rtt {
            log::debug!("ping round trip {rtt:?}");
            session.rtt = Some(rtt);
        }
        session.server_packets = PacketStats {
            good: ping.good.unwrap_or(session.server_packets.good),
            late: ping.late.unwrap_or(session.server_packets.late),
            lost: ping.lost.unwrap_or(session.server_packets.lost),
            resync: ping.resync.unwrap_or(session.server_packets.resync),
        };
    }

    fn on_server_sync(&mut self, sync: &msgs::ServerSync) {
        let mut session = self.shared().session.write();
        session.session = sync.session;
        if sync.max_bandwidth.is_some() {
            session.max_bandwidth = sync.max_bandwidth;
        }
        if sync.welcome_text.is_some() {
            session.welcome_text = sync.welcome_text.clone();
        }
        log::info!(
            "connected as session {}",
            sync.session
                .map_or_else(|| "unknown".to_string(), |id| id.to_string())
        );
    }

    fn on_server_config(&mut self, config: &msgs::ServerConfig) {
        let mut session = self.shared().session.write();
        if config.max_bandwidth.is_some() {
            session.max_bandwidth = config.max_bandwidth;
        }
        if config.welcome_text.is_some() {
            session.welcome_text = config.welcome_text.clone();
        }
        session.allow_html = config.allow_html;
        session.message_length = config.message_length;
        session.image_message_length = config.image_message_length;
        session.max_users = config.max_users;
    }

    fn on_reject(&mut self, reject: &msgs::Reject) {
        let rejection = Rejection {
            kind: reject
                .type_
                .map_or(RejectType::None, |kind| RejectType::from_code(kind.value())),
            reason: reject.reason.clone().unwrap_or_default(),
        };
        log::info!("{rejection}");
        self.shared().set_conn_state(ConnState::Rejected);
        self.emit(Event::Rejected(rejection));
    }

    fn emit(&mut self, event: Event) {
        events::dispatch(self.handler.as_mut(), &self.control, &event);
    }

    /// Single teardown path for every way the loop can end.
    fn finish(&mut self, result: Result<Exit, TransportError>) {
        {
            let mut link = self.shared().link.lock();
            link.closed = true;
        }
        self.shared().running.store(false, Ordering::SeqCst);
        self.shared().transport.shutdown();
        self.shared().state.write().clear();

        match result {
            Ok(Exit::Rejected) => {}
            Ok(Exit::Stopped) => {
                log::info!("connection closed");
                self.shared().set_conn_state(ConnState::Closed);
            }
            Err(err) => {
                log::error!("connection lost: {err}");
                self.shared().set_conn_state(ConnState::Closed);
                self.emit(Event::TransportError(err));
            }
        }
    }
}

/// A running connection: the receive thread plus a handle to drive it.
pub struct Connection {
    control: ControlHandle,
    thread: Option<JoinHandle<()>>,
}

impl Connection {
    /// Sends Version and spawns the receive thread over an open transport.
    pub fn start(
        transport: Arc<dyn Transport>,
        request: HandshakeRequest,
        timing: Timing,
        handler: Box<dyn EventHandler>,
    ) -> Result<Self, TransportError> {
        let shared = Arc::new(Shared {
            transport,
            link: Mutex::new(Link {
                keepalive: KeepAlive::new(timing.ping_interval),
                closed: false,
                failure: None,
            }),
            running: AtomicBool::new(true),
            conn_state: Mutex::new(ConnState::Disconnected),
            session: RwLock::new(SessionInfo::default()),
            state: RwLock::new(ServerState::new()),
            epoch: Instant::now(),
        });
        let control = ControlHandle { shared };

        control.shared.set_conn_state(ConnState::Handshaking);
        if let Err(err) = control.send(&Message::version(&request.release)) {
            control.shared.set_conn_state(ConnState::Closed);
            control.shared.transport.shutdown();
            return Err(err);
        }

        let receiver = Receiver {
            control: control.clone(),
            request,
            handler,
            reconciler: Reconciler::new(),
            codec: WireCodec::new(),
            buffer: BytesMut::with_capacity(READ_CHUNK),
            poll_interval: timing.poll_interval,
        };
        let thread = thread::Builder::new()
            .name("mumble-control".to_string())
            .spawn(move || receiver.run());
        let thread = match thread {
            Ok(thread) => thread,
            Err(err) => {
                control.stop();
                control.shared.set_conn_state(ConnState::Closed);
                control.shared.transport.shutdown();
                return Err(err.into());
            }
        };

        Ok(Self {
            control,
            thread: Some(thread),
        })
    }

    pub fn control(&self) -> &ControlHandle {
        &self.control
    }

    pub fn stop(&self) {
        self.control.stop();
    }

    /// Blocks until the receive thread has torn the connection down.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("receive thread panicked");
                self.control.shared.set_conn_state(ConnState::Closed);
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use bytes::BytesMut;
    use log::Level;
    use mumble_protocol_2x::control::msgs;
    use protobuf::EnumOrUnknown;
    use tokio_util::codec::Decoder;

    use super::{Connection, ControlHandle, HandshakeRequest, Timing};
    use crate::mumble::codec::{self, BlobKind, Message, WireCodec};
    use crate::mumble::events::{Audience, Event, EventHandler, EventQueue, TextMessage};
    use crate::mumble::permissions::Permission;
    use crate::testing::{capture_logs, logged_by_thread};
    use crate::transport::errors::{DecodeError, Rejection, TransportError};
    use crate::transport::memory::MemoryTransport;
    use crate::transport::types::{ConnState, RejectType};

    const POLL: Duration = Duration::from_millis(20);

    fn request() -> HandshakeRequest {
        HandshakeRequest {
            username: "bot".to_string(),
            password: Some("secret".to_string()),
            tokens: vec!["token".to_string()],
            release: "mumbot-test".to_string(),
        }
    }

    fn timing() -> Timing {
        Timing {
            poll_interval: POLL,
            ..Timing::default()
        }
    }

    fn start_with(
        transport: &Arc<MemoryTransport>,
        events: &EventQueue,
        timing: Timing,
    ) -> Connection {
        Connection::start(
            transport.clone(),
            request(),
            timing,
            Box::new(events.clone()),
        )
        .expect("connection should start")
    }

    fn start(transport: &Arc<MemoryTransport>, events: &EventQueue) -> Connection {
        start_with(transport, events, timing())
    }

    fn push(transport: &MemoryTransport, message: &Message) {
        transport.push(&codec::encode(message).expect("encode failed"));
    }

    fn written(transport: &MemoryTransport) -> Vec<Message> {
        let mut buffer = BytesMut::from(&transport.written()[..]);
        let mut codec = WireCodec::new();
        let mut messages = Vec::new();
        while let Some(message) = codec.decode(&mut buffer).expect("written frames decode") {
            messages.push(message);
        }
        messages
    }

    fn wait_until(what: &str, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn sync(session: u32, permissions: u64) -> Message {
        Message::ServerSync(msgs::ServerSync {
            session: Some(session),
            max_bandwidth: Some(72_000),
            welcome_text: Some("welcome".to_string()),
            permissions: Some(permissions),
            ..Default::default()
        })
    }

    fn server_version() -> Message {
        Message::Version(msgs::Version {
            version_v1: Some(0x0001_0204),
            release: Some("1.2.4".to_string()),
            os: Some("Linux".to_string()),
            ..Default::default()
        })
    }

    fn ping_timestamps(transport: &MemoryTransport) -> Vec<u64> {
        written(transport)
            .into_iter()
            .filter_map(|message| match message {
                Message::Ping(ping) => ping.timestamp,
                _ => None,
            })
            .collect()
    }

    /// Drives a connection through Version, CryptSetup and ServerSync.
    fn connect(transport: &Arc<MemoryTransport>, events: &EventQueue) -> Connection {
        connect_with(transport, events, timing())
    }

    fn connect_with(
        transport: &Arc<MemoryTransport>,
        events: &EventQueue,
        timing: Timing,
    ) -> Connection {
        let connection = start_with(transport, events, timing);
        push(transport, &server_version());
        push(transport, &Message::CryptSetup(msgs::CryptSetup::default()));
        push(transport, &sync(7, 0x3));
        let control = connection.control().clone();
        wait_until("ready", || control.conn_state() == ConnState::Ready);
        wait_until("connected event", || !events.is_empty());
        connection
    }

    /// Start sends Version and the server's Version is answered with Authenticate.
    #[test]
    fn handshake_sends_version_then_authenticate() {
        // Arrange
        let transport = Arc::new(MemoryTransport::new());
        let events = EventQueue::new();
        let connection = start(&transport, &events);
        let initial = written(&transport);

        // Act
        push(&transport, &server_version());
        wait_until("authenticate", || written(&transport).len() == 2);

        // Assert
        assert!(matches!(initial.as_slice(), [Message::Version(version)]
            if version.release.as_deref() == Some("mumbot-test")));
        assert_eq!(connection.control().conn_state(), ConnState::Handshaking);
        let sent = written(&transport);
        assert!(matches!(&sent[1], Message::Authenticate(auth)
            if auth.username.as_deref() == Some("bot")
                && auth.password.as_deref() == Some("secret")
                && auth.tokens == vec!["token".to_string()]));
        let info = connection.control().session_info();
        assert_eq!(info.server_release.as_deref(), Some("1.2.4"));
        assert_eq!(info.server_version.map(|version| version.minor), Some(2));
    }

    /// CryptSetup starts the keepalive and ServerSync completes the handshake.
    #[test]
    fn server_sync_makes_the_connection_ready() {
        // Arrange
        let transport = Arc::new(MemoryTransport::new());
        let events = EventQueue::new();

        // Act
        let connection = connect(&transport, &events);

        // Assert
        let control = connection.control();
        let pings = written(&transport)
            .into_iter()
            .filter(|message| matches!(message, Message::Ping(_)))
            .count();
        assert_eq!(pings, 1);
        let info = control.session_info();
        assert_eq!(info.session, Some(7));
        assert_eq!(info.max_bandwidth, Some(72_000));
        assert_eq!(info.welcome_text.as_deref(), Some("welcome"));
        assert!(control.permissions().has(Permission::Write));
        assert!(control.permissions().has(Permission::Traverse));
        assert!(!control.permissions().has(Permission::Enter));
        assert_eq!(events.take_events(), vec![Event::Connected]);
    }

    /// A matching ping reply records the round trip; no second ping is sent meanwhile.
    #[test]
    fn ping_reply_records_round_trip() {
        // Arrange
        let transport = Arc::new(MemoryTransport::new());
        let events = EventQueue::new();
        let connection = connect(&transport, &events);
        let timestamp = written(&transport)
            .into_iter()
            .find_map(|message| match message {
                Message::Ping(ping) => ping.timestamp,
                _ => None,
            })
            .expect("a ping was sent");

        // Act
        push(
            &transport,
            &Message::Ping(msgs::Ping {
                timestamp: Some(timestamp),
                good: Some(12),
                lost: Some(1),
                ..Default::default()
            }),
        );
        let control = connection.control().clone();
        wait_until("rtt", || control.session_info().rtt.is_some());

        // Assert
        let info = control.session_info();
        assert!(info.rtt.unwrap() < Duration::from_secs(5));
        assert_eq!(info.server_packets.good, 12);
        assert_eq!(info.server_packets.lost, 1);
        let pings = written(&transport)
            .into_iter()
            .filter(|message| matches!(message, Message::Ping(_)))
            .count();
        assert_eq!(pings, 1);
    }

    /// The end-to-end scenario: a message to our session raises message-to-me once.
    #[test]
    fn text_to_self_raises_one_event() {
        // Arrange
        let transport = Arc::new(MemoryTransport::new());
        let events = EventQueue::new();
        let _connection = connect(&transport, &events);
        events.take_events();

        // Act
        push(
            &transport,
            &Message::TextMessage(msgs::TextMessage {
                actor: Some(2),
                session: vec![7],
                message: Some("hi".to_string()),
                ..Default::default()
            }),
        );
        wait_until("message event", || !events.is_empty());
        thread::sleep(POLL * 2);

        // Assert
        assert_eq!(
            events.take_events(),
            vec![Event::Text(TextMessage {
                actor: Some(2),
                audience: Audience::Me,
                message: "hi".to_string(),
            })]
        );
    }

    /// Inbound state is applied to the model and triggers stats and blob requests.
    #[test]
    fn state_messages_update_model_and_send_requests() {
        // Arrange
        let transport = Arc::new(MemoryTransport::new());
        let events = EventQueue::new();
        let connection = connect(&transport, &events);
        let control = connection.control().clone();

        // Act
        push(
            &transport,
            &Message::ChannelState(msgs::ChannelState {
                channel_id: Some(0),
                parent: Some(0),
                name: Some("Root".to_string()),
                ..Default::default()
            }),
        );
        push(
            &transport,
            &Message::ChannelState(msgs::ChannelState {
                channel_id: Some(4),
                parent: Some(0),
                name: Some("Lobby".to_string()),
                description_hash: Some(vec![9; 20]),
                ..Default::default()
            }),
        );
        push(
            &transport,
            &Message::UserState(msgs::UserState {
                session: Some(7),
                name: Some("bot".to_string()),
                channel_id: Some(4),
                ..Default::default()
            }),
        );
        let blob = Message::request_blob(BlobKind::ChannelDescription, &[4]);
        let stats = Message::user_stats(7);
        wait_until("requests", || {
            let sent = written(&transport);
            sent.contains(&blob) && sent.contains(&stats)
        });

        // Assert
        assert_eq!(control.user(7).map(|user| user.channel), Some(4));
        assert_eq!(control.channel_by_name("Lobby").map(|c| c.id), Some(4));
        assert_eq!(control.self_user().map(|user| user.name), Some("bot".to_string()));
        assert_eq!(control.channels().len(), 2);
        assert_eq!(control.users().len(), 1);
    }

    /// Outbound commands encode the expected messages.
    #[test]
    fn commands_write_messages() {
        // Arrange
        let transport = Arc::new(MemoryTransport::new());
        let events = EventQueue::new();
        let connection = connect(&transport, &events);
        let control = connection.control();

        // Act
        control.send_text(3, "hello").unwrap();
        control.send_channel_text(1, "everyone").unwrap();
        control.move_user(3, 1).unwrap();
        control.request_blob(BlobKind::UserTexture, &[3]).unwrap();
        control.request_user_stats(3).unwrap();

        // Assert
        let sent = written(&transport);
        let tail = &sent[sent.len() - 5..];
        assert_eq!(
            tail,
            &[
                Message::text(&[3], &[], &[], "hello"),
                Message::text(&[], &[1], &[], "everyone"),
                Message::move_user(3, 1),
                Message::request_blob(BlobKind::UserTexture, &[3]),
                Message::user_stats(3),
            ]
        );
    }

    /// Concurrent senders never interleave partial frames.
    #[test]
    fn concurrent_sends_stay_framed() {
        // Arrange
        let transport = Arc::new(MemoryTransport::new());
        let events = EventQueue::new();
        let connection = connect(&transport, &events);
        let before = written(&transport).len();

        // Act
        let senders: Vec<_> = (0..4)
            .map(|sender| {
                let control = connection.control().clone();
                thread::spawn(move || {
                    for n in 0..50 {
                        control
                            .send_text(sender, &format!("message {n} from {sender}"))
                            .unwrap();
                    }
                })
            })
            .collect();
        for sender in senders {
            sender.join().unwrap();
        }

        // Assert
        let texts = written(&transport)
            .into_iter()
            .skip(before)
            .filter(|message| matches!(message, Message::TextMessage(_)))
            .count();
        assert_eq!(texts, 200);
    }

    /// Reject notifies the handler, marks the state and tears down the transport.
    #[test]
    fn reject_tears_down() {
        // Arrange
        let transport = Arc::new(MemoryTransport::new());
        let events = EventQueue::new();
        let mut connection = start(&transport, &events);

        // Act
        push(
            &transport,
            &Message::Reject(msgs::Reject {
                type_: Some(EnumOrUnknown::from_i32(6)),
                reason: Some("server is full".to_string()),
                ..Default::default()
            }),
        );
        connection.join();

        // Assert
        assert_eq!(connection.control().conn_state(), ConnState::Rejected);
        assert!(transport.is_shut_down());
        assert_eq!(
            events.take_events(),
            vec![Event::Rejected(Rejection {
                kind: RejectType::ServerFull,
                reason: "server is full".to_string(),
            })]
        );
    }

    /// The peer closing the stream ends the connection with a transport error.
    #[test]
    fn peer_close_emits_transport_error() {
        // Arrange
        let transport = Arc::new(MemoryTransport::new());
        let events = EventQueue::new();
        let mut connection = connect(&transport, &events);
        events.take_events();

        // Act
        transport.close_inbound();
        connection.join();

        // Assert
        assert_eq!(connection.control().conn_state(), ConnState::Closed);
        assert_eq!(
            events.take_events(),
            vec![Event::TransportError(TransportError::Closed)]
        );
        assert!(connection.control().users().is_empty());
    }

    /// A malformed control frame is fatal.
    #[test]
    fn malformed_frame_is_fatal() {
        // Arrange
        let transport = Arc::new(MemoryTransport::new());
        let events = EventQueue::new();
        let mut connection = start(&transport, &events);

        // Act
        transport.push(&[0x00, 0x09, 0x00, 0x00, 0x00, 0x02, 0xff, 0xff]);
        connection.join();

        // Assert
        assert_eq!(connection.control().conn_state(), ConnState::Closed);
        assert!(matches!(
            events.take_events().as_slice(),
            [Event::TransportError(TransportError::Decode(DecodeError::Body { type_code: 9, .. }))]
        ));
    }

    /// Unknown types are skipped and the session carries on.
    #[test]
    fn unknown_frames_do_not_end_the_session() {
        // Arrange
        let transport = Arc::new(MemoryTransport::new());
        let events = EventQueue::new();
        let connection = connect(&transport, &events);
        let control = connection.control().clone();

        // Act
        push(
            &transport,
            &Message::Unknown {
                code: 99,
                payload: bytes::Bytes::from_static(&[1, 2, 3, 4]),
            },
        );
        push(
            &transport,
            &Message::UserState(msgs::UserState {
                session: Some(11),
                ..Default::default()
            }),
        );
        wait_until("user after unknown frame", || control.user(11).is_some());

        // Assert
        assert_eq!(control.conn_state(), ConnState::Ready);
    }

    /// stop() ends the loop within a poll interval and refuses later sends.
    #[test]
    fn stop_closes_and_refuses_sends() {
        // Arrange
        let transport = Arc::new(MemoryTransport::new());
        let events = EventQueue::new();
        let mut connection = connect(&transport, &events);
        events.take_events();

        // Act
        connection.stop();
        connection.join();

        // Assert
        let control = connection.control();
        assert_eq!(control.conn_state(), ConnState::Closed);
        assert!(transport.is_shut_down());
        assert_eq!(control.send_text(1, "late"), Err(TransportError::Disconnected));
        assert!(events.take_events().is_empty());
    }

    /// A failed write is terminal and reported once.
    #[test]
    fn write_failure_is_terminal() {
        // Arrange
        let transport = Arc::new(MemoryTransport::new());
        let events = EventQueue::new();
        let mut connection = connect(&transport, &events);
        events.take_events();
        transport.fail_writes();

        // Act
        let first = connection.control().move_user(7, 1);
        let second = connection.control().move_user(7, 1);
        connection.join();

        // Assert
        assert!(matches!(first, Err(TransportError::Io(_))));
        assert_eq!(second, Err(TransportError::Disconnected));
        assert_eq!(connection.control().conn_state(), ConnState::Closed);
        assert!(matches!(
            events.take_events().as_slice(),
            [Event::TransportError(TransportError::Io(_))]
        ));
    }

    struct Replier;

    impl EventHandler for Replier {
        fn on_message(&mut self, control: &ControlHandle, message: &TextMessage) {
            if let Some(actor) = message.actor {
                let roster = control.users().len();
                control
                    .send_text(actor, &format!("echo {} ({roster})", message.message))
                    .unwrap();
            }
        }
    }

    /// Handlers may reply and read the model from inside a callback.
    #[test]
    fn handler_can_reply_from_callback() {
        // Arrange
        let transport = Arc::new(MemoryTransport::new());
        let connection =
            Connection::start(transport.clone(), request(), timing(), Box::new(Replier)).unwrap();
        push(&transport, &sync(7, 0));

        // Act
        push(
            &transport,
            &Message::TextMessage(msgs::TextMessage {
                actor: Some(2),
                session: vec![7],
                message: Some("ping".to_string()),
                ..Default::default()
            }),
        );
        let reply = Message::text(&[2], &[], &[], "echo ping (0)");
        wait_until("reply", || written(&transport).contains(&reply));

        // Assert
        assert_eq!(connection.control().conn_state(), ConnState::Ready);
    }

    /// An unknown frame produces one warning on the receive thread and no debug line.
    #[test]
    fn unknown_frame_is_logged_once() {
        // Arrange
        capture_logs();
        let transport = Arc::new(MemoryTransport::new());
        let events = EventQueue::new();
        let connection = connect(&transport, &events);
        let receiver = connection
            .thread
            .as_ref()
            .map(|thread| thread.thread().id())
            .expect("receive thread is running");
        thread::sleep(POLL * 2);
        let before = logged_by_thread(receiver, "mumbot").len();

        // Act
        push(
            &transport,
            &Message::Unknown {
                code: 99,
                payload: bytes::Bytes::from_static(&[1, 2, 3, 4]),
            },
        );
        wait_until("unknown frame logged", || {
            logged_by_thread(receiver, "mumbot").len() > before
        });
        thread::sleep(POLL * 2);

        // Assert
        let logged = logged_by_thread(receiver, "mumbot");
        let new = &logged[before..];
        assert_eq!(new.len(), 1, "expected one log line, got {new:?}");
        assert_eq!(new[0].0, Level::Warn);
        assert!(new[0].1.contains("99"));
    }

    /// An unanswered ping is sent again at its deadline and the reply to the resend is timed.
    #[test]
    fn unanswered_ping_is_resent() {
        // Arrange
        let transport = Arc::new(MemoryTransport::new());
        let events = EventQueue::new();
        let timing = Timing {
            poll_interval: POLL,
            ping_interval: Duration::from_millis(150),
        };
        let connection = connect_with(&transport, &events, timing);
        let control = connection.control().clone();

        // Act
        wait_until("second ping", || ping_timestamps(&transport).len() >= 2);
        let stamps = ping_timestamps(&transport);
        push(&transport, &Message::ping(stamps[1]));
        wait_until("rtt", || control.session_info().rtt.is_some());

        // Assert
        assert!(stamps[1] > stamps[0]);
        assert!(stamps[1] - stamps[0] >= 150);
        assert!(control.session_info().rtt.unwrap() < Duration::from_secs(5));
        assert!(control.is_running());
    }
}
