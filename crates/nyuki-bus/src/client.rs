use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use nyuki_protocol::jid::NYUKI_RESOURCE;
use nyuki_protocol::{BusError, BusResult, Jid, Message, TransportError};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::config::{BusConfig, DEFAULT_PORT};
use crate::transport::{Link, SessionParams, Transport, TransportSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Identity, session slot and raw send for one bus connection.
///
/// Holds at most one live [`Link`]; the session generation lets the bus tell
/// a stale open (superseded by a disconnect or a newer connect) from the
/// current one.
pub struct BusClient {
    jid: Jid,
    password: String,
    address: (String, u16),
    transport: Arc<dyn Transport>,
    link: Mutex<Option<Arc<dyn Link>>>,
    state: Mutex<ConnectionState>,
    generation: AtomicU64,
}

impl BusClient {
    pub fn new(config: &BusConfig, transport: Arc<dyn Transport>) -> BusResult<Self> {
        let jid = config.identity()?;

        let host = config
            .host
            .clone()
            .unwrap_or_else(|| jid.domain().to_owned());
        let port = config.port.unwrap_or(DEFAULT_PORT);

        Ok(Self {
            jid: jid.with_resource(NYUKI_RESOURCE),
            password: config.password.clone(),
            address: (host, port),
            transport,
            link: Mutex::new(None),
            state: Mutex::new(ConnectionState::Disconnected),
            generation: AtomicU64::new(0),
        })
    }

    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    /// Nick used in rooms: the local part of the JID.
    pub fn nick(&self) -> &str {
        self.jid.user().unwrap_or(self.jid.domain())
    }

    pub fn address(&self) -> (&str, u16) {
        (self.address.0.as_str(), self.address.1)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Moves to `Connecting` unless a session is live or opening.
    /// Returns the new session generation.
    pub(crate) fn begin_connect(&self) -> Option<u64> {
        let mut state = self.state.lock();
        match *state {
            ConnectionState::Disconnected => {
                *state = ConnectionState::Connecting;
                Some(self.generation.fetch_add(1, Ordering::SeqCst) + 1)
            }
            _ => None,
        }
    }

    /// Moves to `Disconnecting` and returns the state we left, unless there
    /// is nothing to tear down or a teardown already runs.
    pub(crate) fn begin_disconnect(&self) -> Option<ConnectionState> {
        let mut state = self.state.lock();
        match *state {
            ConnectionState::Disconnected | ConnectionState::Disconnecting => None,
            previous => {
                *state = ConnectionState::Disconnecting;
                Some(previous)
            }
        }
    }

    /// Promotes the session of `generation` from `Connecting` to `Connected`.
    pub(crate) fn mark_connected(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::Connecting && self.is_current(generation) {
            *state = ConnectionState::Connected;
            true
        } else {
            false
        }
    }

    /// Returns true when this call performed the transition.
    pub(crate) fn mark_disconnected(&self) -> bool {
        let mut state = self.state.lock();
        let changed = *state != ConnectionState::Disconnected;
        *state = ConnectionState::Disconnected;
        changed
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    pub(crate) fn is_opening(&self, generation: u64) -> bool {
        self.state() == ConnectionState::Connecting && self.is_current(generation)
    }

    #[instrument(skip(self), fields(jid = %self.jid, host = %self.address.0, port = self.address.1))]
    pub(crate) async fn open(&self) -> Result<TransportSession, TransportError> {
        let params = SessionParams {
            jid: self.jid.clone(),
            password: self.password.clone(),
            host: self.address.0.clone(),
            port: self.address.1,
        };
        self.transport.open(&params).await
    }

    pub(crate) fn attach(&self, link: Arc<dyn Link>) {
        *self.link.lock() = Some(link);
    }

    pub(crate) fn detach(&self) -> Option<Arc<dyn Link>> {
        self.link.lock().take()
    }

    fn link(&self) -> BusResult<Arc<dyn Link>> {
        self.link.lock().clone().ok_or(BusError::NotConnected)
    }

    pub async fn send(&self, message: Message) -> BusResult<()> {
        let link = self.link()?;
        debug!(id = %message.id, to = %message.to, kind = ?message.kind, "sending message");
        link.send(message).await?;
        Ok(())
    }

    pub async fn join_room(&self, room: &Jid) -> BusResult<()> {
        let link = self.link()?;
        link.join_room(room, self.nick()).await?;
        debug!(%room, nick = self.nick(), "entered room");
        Ok(())
    }

    /// Detaches and closes the current link, if any.
    pub async fn close(&self) -> Result<(), TransportError> {
        match self.detach() {
            Some(link) => link.close().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use nyuki_protocol::BusError;

    use super::*;
    use crate::memory::MemoryHub;

    #[test]
    fn address_defaults_to_jid_domain_and_port_5222() {
        let client = BusClient::new(
            &BusConfig::new("login@localhost", "password"),
            MemoryHub::new().transport(),
        )
        .unwrap();
        assert_eq!(client.address(), ("localhost", 5222));
        assert_eq!(client.jid().to_string(), "login@localhost/nyuki");
        assert_eq!(client.nick(), "login");
    }

    #[test]
    fn explicit_host_and_port_win() {
        let mut config = BusConfig::new("login", "password");
        config.host = Some("127.0.0.1".to_owned());
        config.port = Some(5555);
        let client = BusClient::new(&config, MemoryHub::new().transport()).unwrap();
        assert_eq!(client.address(), ("127.0.0.1", 5555));
    }

    #[test]
    fn jid_without_user_needs_a_host() {
        let result = BusClient::new(
            &BusConfig::new("login", "password"),
            MemoryHub::new().transport(),
        );
        assert!(matches!(result, Err(BusError::MissingUser(_))));
    }

    #[test]
    fn connect_is_refused_while_a_session_is_opening() {
        let client = BusClient::new(
            &BusConfig::new("login@localhost", "password"),
            MemoryHub::new().transport(),
        )
        .unwrap();
        let generation = client.begin_connect().unwrap();
        assert!(client.begin_connect().is_none());
        assert!(client.mark_connected(generation));
        assert_eq!(client.begin_disconnect(), Some(ConnectionState::Connected));
        assert!(client.begin_disconnect().is_none());
        assert!(client.mark_disconnected());
        assert!(!client.mark_disconnected());
    }
}
