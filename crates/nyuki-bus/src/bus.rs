use std::sync::{Arc, Weak};
use std::time::Duration;

use indexmap::IndexSet;
use nyuki_events::EventManager;
use nyuki_protocol::jid::NYUKI_RESOURCE;
use nyuki_protocol::{
    BusError, BusResult, Event, EventKind, Jid, Message, MessageBody, MessageKind, Method,
    RequestBody, ResponseBody,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::client::{BusClient, ConnectionState};
use crate::config::BusConfig;
use crate::pending::PendingRequests;
use crate::response::BusResponse;
use crate::transport::{Transport, TransportEvent};

/// Grace period granted to the transport close once the disconnect budget is spent.
const CLOSE_GRACE: Duration = Duration::from_millis(50);

/// Publish/subscribe and request/response on top of a [`BusClient`].
///
/// Cheap to clone; every clone drives the same session. Lifecycle changes and
/// inbound traffic are reported through the shared [`EventManager`].
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

struct BusInner {
    client: BusClient,
    events: EventManager,
    muc_domain: String,
    request_timeout: Duration,
    connect_timeout: Duration,
    topics: Mutex<IndexSet<String>>,
    /// Leading entries of `topics` that came from the configuration.
    configured_topics: usize,
    pending: PendingRequests,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Bus {
    pub fn new(
        config: &BusConfig,
        transport: Arc<dyn Transport>,
        events: EventManager,
    ) -> BusResult<Self> {
        let client = BusClient::new(config, transport)?;

        let mut topics = IndexSet::new();
        topics.insert(client.nick().to_owned());
        topics.extend(config.rooms.iter().cloned());

        Ok(Self {
            inner: Arc::new(BusInner {
                client,
                events,
                muc_domain: config.muc_domain.clone(),
                request_timeout: config.request_timeout(),
                connect_timeout: config.connect_timeout(),
                configured_topics: topics.len(),
                topics: Mutex::new(topics),
                pending: PendingRequests::default(),
                pump: Mutex::new(None),
            }),
        })
    }

    pub fn jid(&self) -> &Jid {
        self.inner.client.jid()
    }

    pub fn nick(&self) -> &str {
        self.inner.client.nick()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.client.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn events(&self) -> &EventManager {
        &self.inner.events
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Topics joined on session start, our own first.
    pub fn topics(&self) -> Vec<String> {
        self.inner.topics.lock().iter().cloned().collect()
    }

    /// Topics added through [`Bus::subscribe`], in subscription order.
    pub fn runtime_topics(&self) -> Vec<String> {
        self.inner
            .topics
            .lock()
            .iter()
            .skip(self.inner.configured_topics)
            .cloned()
            .collect()
    }

    /// Opens the session in the background. No-op while a session is live
    /// or opening.
    pub fn connect(&self) {
        let Some(generation) = self.inner.client.begin_connect() else {
            debug!(jid = %self.jid(), "connect ignored, session already live or opening");
            return;
        };

        let (host, port) = self.inner.client.address();
        info!(jid = %self.jid(), host, port, "connecting to bus");
        self.inner.events.trigger(EventKind::Connecting);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.open_session(generation).await });
    }

    /// Ends the session. In-flight requests get up to `timeout` to settle,
    /// then fail with [`BusError::Disconnected`]; the transport is closed
    /// within what is left of the budget.
    #[instrument(skip(self), fields(jid = %self.jid()))]
    pub async fn disconnect(&self, timeout: Duration) {
        let Some(previous) = self.inner.client.begin_disconnect() else {
            debug!("disconnect ignored, no live session");
            return;
        };
        let started = Instant::now();

        if previous == ConnectionState::Connected
            && !self.inner.pending.is_empty()
            && !self.inner.pending.wait_settled(timeout).await
        {
            warn!(
                pending = self.inner.pending.len(),
                "requests still in flight, forcing disconnect"
            );
        }
        self.inner
            .pending
            .fail_all(|id| BusError::Disconnected(id.to_owned()));

        let remaining = timeout.saturating_sub(started.elapsed()).max(CLOSE_GRACE);
        match tokio::time::timeout(remaining, self.inner.client.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(%error, "transport close failed"),
            Err(_) => warn!("transport close timed out"),
        }

        self.inner.stop_pump();
        self.inner.session_lost();
    }

    /// Sends `payload` to our own topic. Only JSON objects are accepted.
    #[instrument(skip_all, fields(jid = %self.jid()))]
    pub async fn publish(&self, payload: Value) -> BusResult<()> {
        if !payload.is_object() {
            return Err(BusError::InvalidPayload(json_type_name(&payload)));
        }

        let json = serde_json::to_string(&payload)?;
        let room = Jid::room(self.nick(), &self.inner.muc_domain);
        self.inner
            .send(Message::event(self.jid().clone(), room, json))
            .await
    }

    /// Enters the room `{topic}@{muc_domain}`, now if connected or else on
    /// the next session start.
    #[instrument(skip(self), fields(jid = %self.jid()))]
    pub async fn subscribe(&self, topic: &str) -> BusResult<()> {
        let added = self.inner.topics.lock().insert(topic.to_owned());
        if !added {
            debug!(topic, "already subscribed");
        }
        if self.is_connected() {
            let room = Jid::room(topic, &self.inner.muc_domain);
            self.inner.client.join_room(&room).await?;
        }
        Ok(())
    }

    /// Calls `endpoint` on `recipient` and waits for its reply.
    ///
    /// `recipient` is a nyuki name resolved on our own domain, or a full JID.
    #[instrument(skip(self, data), fields(jid = %self.jid()))]
    pub async fn request(
        &self,
        recipient: &str,
        endpoint: &str,
        method: Method,
        data: Option<Value>,
    ) -> BusResult<BusResponse> {
        let to = self.recipient_jid(recipient)?;
        let message = Message::request(
            self.jid().clone(),
            to.clone(),
            RequestBody {
                method,
                endpoint: endpoint.to_owned(),
                json: data.clone(),
            },
        );
        let pending = self.inner.pending.insert(message.id.clone());

        if let Err(error) = self.inner.send(message).await {
            drop(pending);
            let report = json!({
                "endpoint": format!("{to}{endpoint}"),
                "error": error.to_string(),
                "data": data,
            });
            if let Err(publish_error) = self.publish(report).await {
                debug!(error = %publish_error, "could not publish request failure");
            }
            return Err(error);
        }

        debug!(id = pending.id(), %to, %method, endpoint, "request sent");
        pending.wait(self.inner.request_timeout).await
    }

    /// Answers an inbound request, reusing its id.
    pub async fn reply(&self, request: &Message, status: u16, body: String) -> BusResult<()> {
        self.inner
            .send(request.reply(ResponseBody { status, body }))
            .await
    }

    fn recipient_jid(&self, recipient: &str) -> BusResult<Jid> {
        if recipient.contains('@') {
            let jid: Jid = recipient.parse()?;
            return Ok(match jid.resource() {
                Some(_) => jid,
                None => jid.with_resource(NYUKI_RESOURCE),
            });
        }
        if recipient.is_empty() {
            return Err(BusError::MissingUser(recipient.to_owned()));
        }
        Ok(Jid::new(
            Some(recipient),
            self.jid().domain(),
            Some(NYUKI_RESOURCE),
        ))
    }
}

impl BusInner {
    async fn open_session(self: Arc<Self>, generation: u64) {
        let opened = tokio::time::timeout(self.connect_timeout, self.client.open()).await;
        let session = match opened {
            Ok(Ok(session)) => session,
            Ok(Err(error)) => {
                if self.client.is_opening(generation) {
                    self.on_failure(error.to_string()).await;
                }
                return;
            }
            Err(_) => {
                if self.client.is_opening(generation) {
                    let reason = format!(
                        "session did not open within {}s",
                        self.connect_timeout.as_secs()
                    );
                    self.on_failure(reason).await;
                }
                return;
            }
        };

        if !self.client.is_opening(generation) {
            debug!("discarding superseded session");
            if let Err(error) = session.link.close().await {
                debug!(%error, "closing superseded session failed");
            }
            return;
        }

        self.client.attach(session.link);
        let pump = tokio::spawn(pump(Arc::downgrade(&self), generation, session.inbound));
        if let Some(previous) = self.pump.lock().replace(pump) {
            previous.abort();
        }
    }

    async fn on_session_start(&self, generation: u64) {
        let topics: Vec<String> = self.topics.lock().iter().cloned().collect();
        for topic in topics {
            let room = Jid::room(&topic, &self.muc_domain);
            if let Err(error) = self.client.join_room(&room).await {
                warn!(%room, %error, "could not enter room");
            }
        }

        if self.client.mark_connected(generation) {
            info!(jid = %self.client.jid(), "connected to bus");
            self.events.trigger(EventKind::Connected);
        }
    }

    async fn on_failure(&self, reason: String) {
        warn!(jid = %self.client.jid(), %reason, "bus connection failed");
        self.events.trigger(Event::with_payload(
            EventKind::ConnectionError,
            json!({ "reason": reason }),
        ));
        if let Err(error) = self.client.close().await {
            debug!(%error, "closing failed session");
        }
        self.session_lost();
    }

    /// Fails what is pending and reports the end of the session, once.
    fn session_lost(&self) {
        self.pending
            .fail_all(|id| BusError::Disconnected(id.to_owned()));
        if self.client.mark_disconnected() {
            info!(jid = %self.client.jid(), "disconnected from bus");
            self.events.trigger(EventKind::Disconnected);
        }
    }

    fn stop_pump(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }

    async fn send(&self, message: Message) -> BusResult<()> {
        let result = self.client.send(message).await;
        if let Err(BusError::Transport(error)) = &result {
            self.events.trigger(Event::with_payload(
                EventKind::ConnectionError,
                json!({ "reason": error.to_string() }),
            ));
        }
        result
    }

    fn on_message(&self, message: Message) {
        match &message.body {
            MessageBody::Event { json } => self.on_broadcast(&message, json),
            MessageBody::Response(body) => {
                let response = BusResponse::from(body.clone());
                if self.pending.resolve(&message.id, Ok(response)) {
                    self.events.trigger(Event::with_payload(
                        EventKind::ResponseReceived,
                        json!({
                            "id": message.id,
                            "from": message.from.to_string(),
                            "status": body.status,
                            "body": body.body,
                        }),
                    ));
                } else {
                    debug!(id = %message.id, from = %message.from, "late response dropped");
                }
            }
            MessageBody::Error { condition, text } => {
                let error = BusError::Request {
                    condition: condition.clone(),
                    text: text.clone(),
                };
                if !self.pending.resolve(&message.id, Err(error)) {
                    warn!(id = %message.id, from = %message.from, %condition, %text, "error message received");
                }
            }
            MessageBody::Request(request) => {
                debug!(id = %message.id, from = %message.from, method = %request.method, endpoint = %request.endpoint, "request received");
                match serde_json::to_value(&message) {
                    Ok(payload) => {
                        self.events
                            .trigger(Event::with_payload(EventKind::RequestReceived, payload));
                    }
                    Err(error) => warn!(id = %message.id, %error, "unreadable request dropped"),
                }
            }
        }
    }

    fn on_broadcast(&self, message: &Message, json: &str) {
        if message.kind != MessageKind::GroupChat {
            debug!(id = %message.id, from = %message.from, "event outside of a room dropped");
            return;
        }
        if message.from.resource() == Some(self.client.nick()) {
            debug!(id = %message.id, "own event echo dropped");
            return;
        }

        let data: Value = match serde_json::from_str(json) {
            Ok(data) => data,
            Err(error) => {
                warn!(id = %message.id, from = %message.from, %error, "event body is not JSON");
                return;
            }
        };
        self.events.trigger(Event::with_payload(
            EventKind::EventReceived,
            json!({
                "room": message.from.bare().to_string(),
                "from": message.from.resource(),
                "data": data,
            }),
        ));
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

async fn pump(
    inner: Weak<BusInner>,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.client.is_current(generation) {
            return;
        }

        match event {
            TransportEvent::SessionStarted => inner.on_session_start(generation).await,
            TransportEvent::Message(message) => inner.on_message(message),
            TransportEvent::Invite { room } => {
                info!(%room, "invited to room");
                if let Err(error) = inner.client.join_room(&room).await {
                    warn!(%room, %error, "could not accept invitation");
                }
            }
            TransportEvent::Failed { reason } => {
                inner.on_failure(reason).await;
                return;
            }
            TransportEvent::Disconnected => {
                inner.client.detach();
                inner.session_lost();
                return;
            }
        }
    }

    // The transport dropped its sender without a farewell.
    if let Some(inner) = inner.upgrade() {
        if inner.client.is_current(generation) {
            inner.client.detach();
            inner.session_lost();
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
