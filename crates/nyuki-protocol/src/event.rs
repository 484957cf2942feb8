//! Lifecycle and bus events dispatched through the event manager.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event tag. Subscribers register per tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A session open was requested on the transport.
    Connecting,
    /// The transport session started and startup rooms were joined.
    Connected,
    /// Terminal event of every session, clean or not.
    Disconnected,
    /// The transport failed to open or lost the session.
    ConnectionError,
    /// A broadcast was received in a subscribed room.
    EventReceived,
    /// A reply matched a pending request.
    ResponseReceived,
    /// Another nyuki sent us a request.
    RequestReceived,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::Connecting,
        EventKind::Connected,
        EventKind::Disconnected,
        EventKind::ConnectionError,
        EventKind::EventReceived,
        EventKind::ResponseReceived,
        EventKind::RequestReceived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::ConnectionError => "connection_error",
            Self::EventReceived => "event_received",
            Self::ResponseReceived => "response_received",
            Self::RequestReceived => "request_received",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable event: a tag plus an optional structured payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            payload: None,
        }
    }

    pub fn with_payload(kind: EventKind, payload: Value) -> Self {
        Self {
            kind,
            payload: Some(payload),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }
}

impl From<EventKind> for Event {
    fn from(kind: EventKind) -> Self {
        Self::new(kind)
    }
}
