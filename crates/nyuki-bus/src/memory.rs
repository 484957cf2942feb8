//! In-process chat switch.
//!
//! `MemoryHub` behaves like a small XMPP server with a MUC component: one
//! session per bare JID, direct delivery between sessions, rooms that fan out
//! groupchat messages to every occupant (the author included), and error
//! replies for requests sent to absent recipients. Several nyukis sharing a
//! hub form a working cluster inside one process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use nyuki_protocol::{Jid, Message, MessageBody, MessageKind, TransportError};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::{Link, SessionParams, Transport, TransportEvent, TransportSession};

#[derive(Debug)]
struct SessionEntry {
    id: u64,
    sender: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Debug, Default)]
struct HubState {
    sessions: HashMap<Jid, SessionEntry>,
    // room bare JID -> nick -> occupant bare JID
    rooms: HashMap<Jid, IndexMap<String, Jid>>,
    next_session: u64,
    refuse: Option<String>,
    send_failures: usize,
    delivered: u64,
}

impl HubState {
    fn deliver(&mut self, to: &Jid, message: Message) -> bool {
        let Some(entry) = self.sessions.get(&to.bare()) else {
            return false;
        };
        if entry.sender.send(TransportEvent::Message(message)).is_ok() {
            self.delivered += 1;
            true
        } else {
            false
        }
    }

    fn drop_session(&mut self, bare: &Jid, session: Option<u64>) -> bool {
        let matches = self
            .sessions
            .get(bare)
            .is_some_and(|entry| session.is_none_or(|id| entry.id == id));
        if !matches {
            return false;
        }
        if let Some(entry) = self.sessions.remove(bare) {
            let _ = entry.sender.send(TransportEvent::Disconnected);
        }
        for occupants in self.rooms.values_mut() {
            occupants.retain(|_, member| member != bare);
        }
        true
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(MemoryTransport { hub: self.clone() })
    }

    /// Refuse every new session with `reason` until called with `None`.
    pub fn refuse_connections(&self, reason: Option<&str>) {
        self.state.lock().refuse = reason.map(ToOwned::to_owned);
    }

    /// Make the next `count` sends, from any session, fail at the transport.
    pub fn fail_next_sends(&self, count: usize) {
        self.state.lock().send_failures = count;
    }

    /// Server-side termination of the session bound to `jid`.
    pub fn kick(&self, jid: &Jid) -> bool {
        self.state.lock().drop_session(&jid.bare(), None)
    }

    pub fn invite(&self, room: &Jid, jid: &Jid) -> bool {
        let state = self.state.lock();
        match state.sessions.get(&jid.bare()) {
            Some(entry) => entry
                .sender
                .send(TransportEvent::Invite { room: room.bare() })
                .is_ok(),
            None => false,
        }
    }

    pub fn is_connected(&self, jid: &Jid) -> bool {
        self.state.lock().sessions.contains_key(&jid.bare())
    }

    pub fn occupants(&self, room: &Jid) -> Vec<String> {
        self.state
            .lock()
            .rooms
            .get(&room.bare())
            .map(|occupants| occupants.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of messages handed to a session so far.
    pub fn delivered(&self) -> u64 {
        self.state.lock().delivered
    }
}

pub struct MemoryTransport {
    hub: MemoryHub,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, params: &SessionParams) -> Result<TransportSession, TransportError> {
        let mut state = self.hub.state.lock();
        if let Some(reason) = &state.refuse {
            return Err(TransportError::ConnectionRefused(reason.clone()));
        }

        let bare = params.jid.bare();
        if state.sessions.contains_key(&bare) {
            return Err(TransportError::AlreadyConnected(bare.to_string()));
        }

        state.next_session += 1;
        let id = state.next_session;
        let (sender, inbound) = mpsc::unbounded_channel();
        let _ = sender.send(TransportEvent::SessionStarted);
        state.sessions.insert(bare.clone(), SessionEntry { id, sender });
        debug!(jid = %params.jid, session = id, "memory session opened");

        Ok(TransportSession {
            link: Arc::new(MemoryLink {
                hub: self.hub.clone(),
                jid: params.jid.clone(),
                session: id,
            }),
            inbound,
        })
    }
}

struct MemoryLink {
    hub: MemoryHub,
    jid: Jid,
    session: u64,
}

impl MemoryLink {
    fn ensure_live(&self, state: &HubState) -> Result<(), TransportError> {
        match state.sessions.get(&self.jid.bare()) {
            Some(entry) if entry.id == self.session => Ok(()),
            _ => Err(TransportError::NotConnected),
        }
    }
}

#[async_trait]
impl Link for MemoryLink {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        let mut state = self.hub.state.lock();
        if state.send_failures > 0 {
            state.send_failures -= 1;
            return Err(TransportError::ConnectionRefused(
                "injected send failure".to_owned(),
            ));
        }
        self.ensure_live(&state)?;

        let room = message.to.bare();
        if message.kind == MessageKind::GroupChat {
            let Some(occupants) = state.rooms.get(&room) else {
                let bounce = message.error_reply("item-not-found", format!("no room {room}"));
                state.deliver(&self.jid, bounce);
                return Ok(());
            };
            let Some(nick) = occupants
                .iter()
                .find(|(_, member)| **member == self.jid.bare())
                .map(|(nick, _)| nick.clone())
            else {
                let bounce = message.error_reply("not-acceptable", format!("not in room {room}"));
                state.deliver(&self.jid, bounce);
                return Ok(());
            };

            let members: Vec<Jid> = occupants.values().cloned().collect();
            let from = room.clone().with_resource(&nick);
            for member in members {
                let mut copy = message.clone();
                copy.from = from.clone();
                copy.to = member.clone();
                state.deliver(&member, copy);
            }
            return Ok(());
        }

        let to = message.to.clone();
        let bounce = matches!(message.body, MessageBody::Request(_))
            .then(|| message.error_reply("recipient-unavailable", format!("{to} is not connected")));
        if !state.deliver(&to, message) {
            debug!(%to, "recipient unavailable");
            if let Some(bounce) = bounce {
                state.deliver(&self.jid, bounce);
            }
        }
        Ok(())
    }

    async fn join_room(&self, room: &Jid, nick: &str) -> Result<(), TransportError> {
        let mut state = self.hub.state.lock();
        self.ensure_live(&state)?;
        state
            .rooms
            .entry(room.bare())
            .or_default()
            .insert(nick.to_owned(), self.jid.bare());
        debug!(%room, nick, "joined room");
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.hub.state.lock();
        if state.drop_session(&self.jid.bare(), Some(self.session)) {
            debug!(jid = %self.jid, session = self.session, "memory session closed");
        }
        Ok(())
    }
}
