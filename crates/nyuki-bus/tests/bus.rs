use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nyuki_bus::{Bus, BusConfig, ConnectionState, MemoryHub};
use nyuki_events::{EventManager, wait_for};
use nyuki_protocol::{BusError, Event, EventKind, Jid, Message, Method, TransportError};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(2);

fn bus(hub: &MemoryHub, config: BusConfig) -> Result<(Bus, broadcast::Receiver<Event>)> {
    let events = EventManager::new();
    let stream = events.subscribe();
    let bus = Bus::new(&config, hub.transport(), events)?;
    Ok((bus, stream))
}

async fn connected(hub: &MemoryHub, jid: &str) -> Result<(Bus, broadcast::Receiver<Event>)> {
    let (bus, mut stream) = bus(hub, BusConfig::new(jid, "secret"))?;
    bus.connect();
    wait_for(&mut stream, EventKind::Connected, WAIT)
        .await
        .context("bus never connected")?;
    Ok((bus, stream))
}

fn record(bus: &Bus, kinds: &[EventKind]) -> Arc<Mutex<Vec<EventKind>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    for kind in kinds {
        let seen = Arc::clone(&seen);
        bus.events().register(*kind, move |event| {
            seen.lock().push(event.kind());
            Ok(())
        });
    }
    seen
}

/// Answers every inbound request with `status` and `body`.
fn answer_requests(bus: &Bus, status: u16, body: &'static str) {
    let replier = bus.clone();
    bus.events()
        .register(EventKind::RequestReceived, move |event| {
            let payload = event.payload().cloned().context("request without payload")?;
            let message: Message = serde_json::from_value(payload)?;
            let replier = replier.clone();
            tokio::spawn(async move { replier.reply(&message, status, body.to_owned()).await });
            Ok(())
        });
}

#[tokio::test]
async fn connect_is_idempotent_and_joins_own_topic() -> Result<()> {
    let hub = MemoryHub::new();
    let (timon, mut stream) = bus(&hub, BusConfig::new("timon@localhost", "secret"))?;
    let seen = record(&timon, &[EventKind::Connecting, EventKind::Connected]);

    timon.connect();
    timon.connect();
    wait_for(&mut stream, EventKind::Connected, WAIT)
        .await
        .context("bus never connected")?;
    timon.connect();

    assert_eq!(
        *seen.lock(),
        vec![EventKind::Connecting, EventKind::Connected]
    );
    assert_eq!(timon.state(), ConnectionState::Connected);
    assert_eq!(timon.jid().to_string(), "timon@localhost/nyuki");
    assert_eq!(
        hub.occupants(&Jid::room("timon", "mucs.localhost")),
        vec!["timon"]
    );
    Ok(())
}

#[tokio::test]
async fn topics_requested_before_connect_are_joined_on_start() -> Result<()> {
    let hub = MemoryHub::new();
    let mut config = BusConfig::new("timon@localhost", "secret");
    config.rooms = vec!["savannah".to_owned()];
    let (timon, mut stream) = bus(&hub, config)?;
    timon.subscribe("jungle").await?;

    timon.connect();
    wait_for(&mut stream, EventKind::Connected, WAIT)
        .await
        .context("bus never connected")?;

    assert_eq!(timon.topics(), vec!["timon", "savannah", "jungle"]);
    timon.subscribe("savannah").await?;
    assert_eq!(timon.runtime_topics(), vec!["jungle"]);
    for room in ["savannah", "jungle"] {
        assert_eq!(
            hub.occupants(&Jid::room(room, "mucs.localhost")),
            vec!["timon"]
        );
    }
    Ok(())
}

#[tokio::test]
async fn publish_rejects_non_objects_without_io() -> Result<()> {
    let hub = MemoryHub::new();
    let (timon, _stream) = connected(&hub, "timon@localhost").await?;
    let delivered = hub.delivered();

    for payload in [json!([1, 2]), json!("text"), json!(3), Value::Null, json!(true)] {
        let error = timon.publish(payload).await.unwrap_err();
        assert!(matches!(error, BusError::InvalidPayload(_)), "{error}");
    }
    assert_eq!(hub.delivered(), delivered);
    Ok(())
}

#[tokio::test]
async fn broadcasts_reach_subscribers_but_not_their_author() -> Result<()> {
    let hub = MemoryHub::new();
    let (timon, mut timon_stream) = connected(&hub, "timon@localhost").await?;
    let (pumbaa, mut pumbaa_stream) = connected(&hub, "pumbaa@localhost").await?;
    pumbaa.subscribe("timon").await?;

    timon.publish(json!({"order": "hakuna matata"})).await?;

    let event = wait_for(&mut pumbaa_stream, EventKind::EventReceived, WAIT)
        .await
        .context("no broadcast received")?;
    assert_eq!(
        event.payload(),
        Some(&json!({
            "room": "timon@mucs.localhost",
            "from": "timon",
            "data": {"order": "hakuna matata"},
        }))
    );
    assert!(
        wait_for(
            &mut timon_stream,
            EventKind::EventReceived,
            Duration::from_millis(100)
        )
        .await
        .is_none()
    );
    Ok(())
}

#[tokio::test]
async fn request_resolves_with_the_reply() -> Result<()> {
    let hub = MemoryHub::new();
    let (timon, mut stream) = connected(&hub, "timon@localhost").await?;
    let (pumbaa, _) = connected(&hub, "pumbaa@localhost").await?;
    answer_requests(&pumbaa, 201, r#"{"created": true}"#);

    let response = timon
        .request("pumbaa", "/message", Method::Post, Some(json!({"3": "hi"})))
        .await?;

    assert_eq!(response.status(), 201);
    assert_eq!(response.json(), Some(&json!({"created": true})));
    assert_eq!(timon.pending_requests(), 0);

    let event = wait_for(&mut stream, EventKind::ResponseReceived, WAIT)
        .await
        .context("no response event")?;
    assert_eq!(
        event.payload().and_then(|payload| payload.get("status")),
        Some(&json!(201))
    );
    Ok(())
}

#[tokio::test]
async fn non_json_reply_keeps_raw_text() -> Result<()> {
    let hub = MemoryHub::new();
    let (timon, _) = connected(&hub, "timon@localhost").await?;
    let (pumbaa, _) = connected(&hub, "pumbaa@localhost").await?;
    answer_requests(&pumbaa, 200, "plain words");

    let response = timon
        .request("pumbaa@localhost", "/status", Method::Get, None)
        .await?;
    assert_eq!(response.json(), None);
    assert_eq!(response.text(), "plain words");
    Ok(())
}

#[tokio::test]
async fn request_to_absent_recipient_fails() -> Result<()> {
    let hub = MemoryHub::new();
    let (timon, _) = connected(&hub, "timon@localhost").await?;

    let error = timon
        .request("ghost", "/message", Method::Get, None)
        .await
        .unwrap_err();
    assert!(
        matches!(&error, BusError::Request { condition, .. } if condition == "recipient-unavailable"),
        "{error}"
    );
    assert_eq!(timon.pending_requests(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unanswered_requests_time_out_without_leaking() -> Result<()> {
    let hub = MemoryHub::new();
    let mut config = BusConfig::new("timon@localhost", "secret");
    config.request_timeout_secs = 1;
    let (timon, mut stream) = bus(&hub, config)?;
    timon.connect();
    wait_for(&mut stream, EventKind::Connected, WAIT)
        .await
        .context("bus never connected")?;
    let (_pumbaa, _) = connected(&hub, "pumbaa@localhost").await?;

    for _ in 0..3 {
        let error = timon
            .request("pumbaa", "/message", Method::Get, None)
            .await
            .unwrap_err();
        assert!(error.is_timeout(), "{error}");
        assert_eq!(timon.pending_requests(), 0);
    }
    Ok(())
}

#[tokio::test]
async fn send_failure_publishes_an_error_report() -> Result<()> {
    let hub = MemoryHub::new();
    let (timon, mut timon_stream) = connected(&hub, "timon@localhost").await?;
    let (pumbaa, mut pumbaa_stream) = connected(&hub, "pumbaa@localhost").await?;
    pumbaa.subscribe("timon").await?;

    hub.fail_next_sends(1);
    let error = timon
        .request("pumbaa", "/message", Method::Post, Some(json!({"a": 1})))
        .await
        .unwrap_err();
    assert!(
        matches!(error, BusError::Transport(TransportError::ConnectionRefused(_))),
        "{error}"
    );
    assert_eq!(timon.pending_requests(), 0);

    let report = wait_for(&mut pumbaa_stream, EventKind::EventReceived, WAIT)
        .await
        .context("no error report")?;
    let data = report
        .payload()
        .and_then(|payload| payload.get("data"))
        .context("report without data")?;
    assert_eq!(data["endpoint"], json!("pumbaa@localhost/nyuki/message"));
    assert_eq!(data["data"], json!({"a": 1}));
    assert!(
        data["error"]
            .as_str()
            .is_some_and(|text| text.contains("injected send failure"))
    );

    assert!(
        wait_for(&mut timon_stream, EventKind::ConnectionError, WAIT)
            .await
            .is_some()
    );
    Ok(())
}

#[tokio::test]
async fn refused_connection_reports_error_then_disconnected() -> Result<()> {
    let hub = MemoryHub::new();
    hub.refuse_connections(Some("maintenance"));
    let (timon, mut stream) = bus(&hub, BusConfig::new("timon@localhost", "secret"))?;
    let seen = record(
        &timon,
        &[
            EventKind::Connecting,
            EventKind::Connected,
            EventKind::ConnectionError,
            EventKind::Disconnected,
        ],
    );

    timon.connect();
    wait_for(&mut stream, EventKind::Disconnected, WAIT)
        .await
        .context("no disconnected event")?;
    assert_eq!(
        *seen.lock(),
        vec![
            EventKind::Connecting,
            EventKind::ConnectionError,
            EventKind::Disconnected
        ]
    );
    assert_eq!(timon.state(), ConnectionState::Disconnected);

    hub.refuse_connections(None);
    timon.connect();
    wait_for(&mut stream, EventKind::Connected, WAIT)
        .await
        .context("bus never connected")?;
    Ok(())
}

#[tokio::test]
async fn disconnect_is_bounded_by_its_timeout() -> Result<()> {
    let hub = MemoryHub::new();
    let (timon, _) = connected(&hub, "timon@localhost").await?;
    let (_pumbaa, _) = connected(&hub, "pumbaa@localhost").await?;
    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&disconnects);
    timon
        .events()
        .register(EventKind::Disconnected, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

    let requester = timon.clone();
    let stuck = tokio::spawn(async move {
        requester
            .request("pumbaa", "/slow", Method::Get, None)
            .await
    });
    while timon.pending_requests() == 0 {
        tokio::task::yield_now().await;
    }

    let started = Instant::now();
    timon.disconnect(Duration::from_millis(200)).await;
    assert!(started.elapsed() < Duration::from_secs(1));

    assert!(matches!(stuck.await?, Err(BusError::Disconnected(_))));
    assert_eq!(timon.state(), ConnectionState::Disconnected);
    assert!(!hub.is_connected(timon.jid()));

    timon.disconnect(Duration::from_millis(200)).await;
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn server_side_kick_ends_the_session() -> Result<()> {
    let hub = MemoryHub::new();
    let (timon, mut stream) = connected(&hub, "timon@localhost").await?;

    assert!(hub.kick(timon.jid()));
    wait_for(&mut stream, EventKind::Disconnected, WAIT)
        .await
        .context("no disconnected event")?;
    assert_eq!(timon.state(), ConnectionState::Disconnected);
    assert!(matches!(
        timon.publish(json!({"still": "here"})).await,
        Err(BusError::NotConnected)
    ));

    timon.connect();
    wait_for(&mut stream, EventKind::Connected, WAIT)
        .await
        .context("bus never reconnected")?;
    Ok(())
}

#[tokio::test]
async fn invitations_are_accepted() -> Result<()> {
    let hub = MemoryHub::new();
    let (timon, _) = connected(&hub, "timon@localhost").await?;
    let lounge = Jid::room("lounge", "mucs.localhost");

    assert!(hub.invite(&lounge, timon.jid()));
    tokio::time::timeout(WAIT, async {
        while hub.occupants(&lounge).is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await?;
    assert_eq!(hub.occupants(&lounge), vec!["timon"]);
    Ok(())
}
