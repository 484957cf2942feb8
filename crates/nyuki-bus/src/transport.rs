//! Transport boundary.
//!
//! The bus only needs message and room-presence primitives from the chat
//! server; these traits are the whole contract. Wire encoding, stream
//! negotiation and authentication live behind them.

use std::sync::Arc;

use async_trait::async_trait;
use nyuki_protocol::{Jid, Message, TransportError};
use tokio::sync::mpsc;

/// What a transport needs to open a session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub jid: Jid,
    pub password: String,
    pub host: String,
    pub port: u16,
}

/// Notifications pushed by a live session.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    SessionStarted,
    Message(Message),
    Invite { room: Jid },
    /// The session ended. Always the last event of a session.
    Disconnected,
    /// The session broke; a `Disconnected` may or may not follow.
    Failed { reason: String },
}

pub struct TransportSession {
    pub link: Arc<dyn Link>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, params: &SessionParams) -> Result<TransportSession, TransportError>;
}

/// Outbound half of an open session.
#[async_trait]
pub trait Link: Send + Sync {
    async fn send(&self, message: Message) -> Result<(), TransportError>;
    async fn join_room(&self, room: &Jid, nick: &str) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}
