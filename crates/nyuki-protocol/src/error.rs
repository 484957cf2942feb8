//! Error types for the bus layers.

use std::time::Duration;

use thiserror::Error;

use crate::jid::JidError;

/// Failures reported by a transport implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("no live session")]
    NotConnected,
    #[error("session already open for {0}")]
    AlreadyConnected(String),
    #[error("transport io error: {0}")]
    Io(String),
}

/// Errors raised by bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("publish payload must be a JSON object, got {0}")]
    InvalidPayload(&'static str),
    #[error("wrong JID format given (use user@host/nyuki): {0}")]
    InvalidJid(#[from] JidError),
    #[error("wrong JID format given (use user@host/nyuki): missing user part in `{0}`")]
    MissingUser(String),
    #[error("bus is not connected")]
    NotConnected,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("request {id} got no response within {}s", timeout.as_secs_f64())]
    Timeout { id: String, timeout: Duration },
    #[error("request failed ({condition}): {text}")]
    Request { condition: String, text: String },
    #[error("session closed while request {0} was pending")]
    Disconnected(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BusError {
    /// Errors coming from the transport itself rather than from the peer.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::NotConnected)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Convenience result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;
