use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::mumble::control::ControlHandle;
use crate::mumble::voice::VoiceTarget;
use crate::transport::errors::{Rejection, TransportError};

/// Who a text message was addressed to, from this client's point of view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Audience {
    Me,
    Users(Vec<u32>),
    Channels(Vec<u32>),
    Trees(Vec<u32>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextMessage {
    /// Sender session, as sent by the server.
    pub actor: Option<u32>,
    pub audience: Audience,
    pub message: String,
}

/// One demultiplexed audio frame. The payload is opaque codec data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoiceFrame {
    pub session: u32,
    pub sequence: i64,
    pub target: VoiceTarget,
    pub payload: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermissionDenied {
    pub permission: Option<u32>,
    pub channel: Option<u32>,
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Connected,
    Rejected(Rejection),
    Text(TextMessage),
    Voice(VoiceFrame),
    PermissionDenied(PermissionDenied),
    TransportError(TransportError),
}

/// Callbacks invoked on the receive thread. The handle may be used to reply or
/// to read the server model; the model is never locked while a callback runs.
pub trait EventHandler: Send + 'static {
    fn on_connected(&mut self, _control: &ControlHandle) {}

    fn on_rejected(&mut self, _control: &ControlHandle, _rejection: &Rejection) {}

    fn on_message(&mut self, _control: &ControlHandle, _message: &TextMessage) {}

    fn on_voice(&mut self, _control: &ControlHandle, _frame: &VoiceFrame) {}

    fn on_permission_denied(&mut self, _control: &ControlHandle, _denied: &PermissionDenied) {}

    fn on_error(&mut self, _control: &ControlHandle, _error: &TransportError) {}
}

pub(crate) fn dispatch(handler: &mut dyn EventHandler, control: &ControlHandle, event: &Event) {
    match event {
        Event::Connected => handler.on_connected(control),
        Event::Rejected(rejection) => handler.on_rejected(control, rejection),
        Event::Text(message) => handler.on_message(control, message),
        Event::Voice(frame) => handler.on_voice(control, frame),
        Event::PermissionDenied(denied) => handler.on_permission_denied(control, denied),
        Event::TransportError(error) => handler.on_error(control, error),
    }
}

/// Handler that queues every event for the caller to drain.
#[derive(Clone, Debug, Default)]
pub struct EventQueue {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl EventHandler for EventQueue {
    fn on_connected(&mut self, _control: &ControlHandle) {
        self.push(Event::Connected);
    }

    fn on_rejected(&mut self, _control: &ControlHandle, rejection: &Rejection) {
        self.push(Event::Rejected(rejection.clone()));
    }

    fn on_message(&mut self, _control: &ControlHandle, message: &TextMessage) {
        self.push(Event::Text(message.clone()));
    }

    fn on_voice(&mut self, _control: &ControlHandle, frame: &VoiceFrame) {
        self.push(Event::Voice(frame.clone()));
    }

    fn on_permission_denied(&mut self, _control: &ControlHandle, denied: &PermissionDenied) {
        self.push(Event::PermissionDenied(denied.clone()));
    }

    fn on_error(&mut self, _control: &ControlHandle, error: &TransportError) {
        self.push(Event::TransportError(error.clone()));
    }
}
