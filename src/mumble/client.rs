use std::sync::Arc;

use crate::mumble::codec::BlobKind;
use crate::mumble::config::MumbleConfig;
use crate::mumble::control::{Connection, ControlHandle, HandshakeRequest, SessionInfo};
use crate::mumble::events::EventHandler;
use crate::mumble::permissions::Permissions;
use crate::mumble::server::ServerDescriptor;
use crate::mumble::state::{Channel, User};
use crate::transport::errors::{ConnectError, TransportError};
use crate::transport::tls::Transport;
use crate::transport::types::{ConnState, ServerStatus};

/// Bot-facing entry point: owns the config and at most one live connection.
pub struct MumbleClient {
    config: MumbleConfig,
    connection: Option<Connection>,
}

impl MumbleClient {
    pub fn new(config: MumbleConfig) -> Self {
        Self {
            config,
            connection: None,
        }
    }

    pub fn config(&self) -> &MumbleConfig {
        &self.config
    }

    /// Opens a TLS connection and starts the handshake. Returns the existing
    /// handle if a connection is already live.
    pub fn connect(
        &mut self,
        handler: impl EventHandler,
    ) -> Result<ControlHandle, ConnectError> {
        if let Some(control) = self.live_control() {
            return Ok(control);
        }
        self.config.validate()?;
        let descriptor = ServerDescriptor::from_config(&self.config);
        let transport = descriptor.connect(&self.config.tls_options())?;
        self.connect_with(Arc::new(transport), handler)
    }

    /// Starts the handshake over an already open transport.
    pub fn connect_with(
        &mut self,
        transport: Arc<dyn Transport>,
        handler: impl EventHandler,
    ) -> Result<ControlHandle, ConnectError> {
        if let Some(control) = self.live_control() {
            return Ok(control);
        }
        self.config.validate()?;
        self.disconnect();
        let request = HandshakeRequest {
            username: self.config.username.trim().to_string(),
            password: self.config.password.clone(),
            tokens: self.config.tokens.clone(),
            release: self.config.client_release.clone(),
        };
        let connection = Connection::start(
            transport,
            request,
            self.config.timing(),
            Box::new(handler),
        )?;
        let control = connection.control().clone();
        self.connection = Some(connection);
        Ok(control)
    }

    /// Stops the receive thread and waits for teardown.
    pub fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.stop();
            connection.join();
        }
    }

    /// Blocks until the connection ends on its own (rejection, error or `stop`).
    pub fn wait(&mut self) {
        if let Some(connection) = self.connection.as_mut() {
            connection.join();
        }
    }

    /// Asks the server for its status without connecting.
    pub fn probe(&self) -> Result<Option<ServerStatus>, ConnectError> {
        self.config.validate()?;
        ServerDescriptor::from_config(&self.config).probe(self.config.probe_timeout())
    }

    pub fn control(&self) -> Option<&ControlHandle> {
        self.connection.as_ref().map(Connection::control)
    }

    pub fn conn_state(&self) -> ConnState {
        self.control()
            .map_or(ConnState::Disconnected, ControlHandle::conn_state)
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.control().map(ControlHandle::session_info)
    }

    pub fn send_text(&self, session: u32, text: &str) -> Result<(), TransportError> {
        self.require()?.send_text(session, text)
    }

    pub fn send_channel_text(&self, channel_id: u32, text: &str) -> Result<(), TransportError> {
        self.require()?.send_channel_text(channel_id, text)
    }

    pub fn move_user(&self, session: u32, channel_id: u32) -> Result<(), TransportError> {
        self.require()?.move_user(session, channel_id)
    }

    pub fn join_channel(&self, channel_id: u32) -> Result<(), TransportError> {
        self.require()?.join_channel(channel_id)
    }

    pub fn request_blob(&self, kind: BlobKind, ids: &[u32]) -> Result<(), TransportError> {
        self.require()?.request_blob(kind, ids)
    }

    pub fn request_user_stats(&self, session: u32) -> Result<(), TransportError> {
        self.require()?.request_user_stats(session)
    }

    pub fn permissions(&self) -> Permissions {
        self.control()
            .map(ControlHandle::permissions)
            .unwrap_or_default()
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.control().map(ControlHandle::channels).unwrap_or_default()
    }

    pub fn users(&self) -> Vec<User> {
        self.control().map(ControlHandle::users).unwrap_or_default()
    }

    pub fn channel(&self, id: u32) -> Option<Channel> {
        self.control()?.channel(id)
    }

    pub fn user(&self, session: u32) -> Option<User> {
        self.control()?.user(session)
    }

    pub fn channel_by_name(&self, name: &str) -> Option<Channel> {
        self.control()?.channel_by_name(name)
    }

    pub fn user_by_name(&self, name: &str) -> Option<User> {
        self.control()?.user_by_name(name)
    }

    pub fn self_user(&self) -> Option<User> {
        self.control()?.self_user()
    }

    fn require(&self) -> Result<&ControlHandle, TransportError> {
        self.control()
            .filter(|control| control.is_running())
            .ok_or(TransportError::Disconnected)
    }

    fn live_control(&self) -> Option<ControlHandle> {
        self.control()
            .filter(|control| control.is_running())
            .cloned()
    }
}

impl Drop for MumbleClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}
