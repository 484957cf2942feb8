use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use nyuki_protocol::{Event, EventKind};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, warn};

pub type EventHandler = Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>;

const DEFAULT_STREAM_BUFFER: usize = 256;

/// Broadcast side channel for async observers of triggered events.
#[derive(Clone, Debug)]
pub struct EventStreamHub {
    sender: broadcast::Sender<Event>,
}

impl EventStreamHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<Event> {
        BroadcastStream::new(self.sender.subscribe())
    }
}

/// Registry of event handlers, shared by the bus and the agent.
///
/// Dispatch is synchronous: `trigger` runs every handler registered for the
/// event's tag, in registration order, before returning. A handler that
/// fails or panics is logged and skipped; the remaining handlers still run.
#[derive(Clone)]
pub struct EventManager {
    handlers: Arc<RwLock<HashMap<EventKind, Vec<EventHandler>>>>,
    stream: EventStreamHub,
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EventManager {
    pub fn new() -> Self {
        Self::with_stream_buffer(DEFAULT_STREAM_BUFFER)
    }

    pub fn with_stream_buffer(buffer: usize) -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            stream: EventStreamHub::new(buffer),
        }
    }

    pub fn register<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
        debug!(event = %kind, "event handler registered");
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Runs the handlers of `event`'s tag and returns how many succeeded.
    pub fn trigger(&self, event: impl Into<Event>) -> usize {
        let event = event.into();
        // Snapshot so handlers may register more handlers without deadlocking.
        let handlers = self
            .handlers
            .read()
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();

        let mut succeeded = 0;
        for (index, handler) in handlers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(error)) => {
                    warn!(event = %event.kind(), handler = index, %error, "event handler failed");
                }
                Err(panic) => {
                    error!(
                        event = %event.kind(),
                        handler = index,
                        panic = %panic_message(panic.as_ref()),
                        "event handler panicked"
                    );
                }
            }
        }

        debug!(event = %event.kind(), handlers = handlers.len(), succeeded, "event triggered");
        self.stream.publish(event);
        succeeded
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.stream.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<Event> {
        self.stream.subscribe_stream()
    }
}

/// Waits on `receiver` for the next event tagged `kind`.
///
/// Returns `None` when the deadline passes or the stream closes.
pub async fn wait_for(
    receiver: &mut broadcast::Receiver<Event>,
    kind: EventKind,
    deadline: Duration,
) -> Option<Event> {
    let wait = async {
        loop {
            match receiver.recv().await {
                Ok(event) if event.kind() == kind => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(deadline, wait).await.ok().flatten()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{Result, bail};
    use nyuki_protocol::{Event, EventKind};
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio_stream::StreamExt;

    use crate::{EventManager, wait_for};

    fn recorder() -> (Arc<Mutex<Vec<String>>>, EventManager) {
        (Arc::new(Mutex::new(Vec::new())), EventManager::new())
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let (calls, manager) = recorder();
        for name in ["first", "second", "third"] {
            let calls = calls.clone();
            manager.register(EventKind::Connected, move |_| {
                calls.lock().push(name.to_owned());
                Ok(())
            });
        }

        assert_eq!(manager.trigger(EventKind::Connected), 3);
        assert_eq!(*calls.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn failing_handler_does_not_stop_the_others() {
        let (calls, manager) = recorder();
        {
            let calls = calls.clone();
            manager.register(EventKind::Disconnected, move |_| {
                calls.lock().push("before".to_owned());
                Ok(())
            });
        }
        manager.register(EventKind::Disconnected, |_| bail!("boom"));
        manager.register(EventKind::Disconnected, |_| panic!("kaboom"));
        {
            let calls = calls.clone();
            manager.register(EventKind::Disconnected, move |_| {
                calls.lock().push("after".to_owned());
                Ok(())
            });
        }

        assert_eq!(manager.trigger(EventKind::Disconnected), 2);
        assert_eq!(*calls.lock(), vec!["before", "after"]);
    }

    #[test]
    fn each_handler_runs_exactly_once_and_only_for_its_tag() {
        let (calls, manager) = recorder();
        {
            let calls = calls.clone();
            manager.register(EventKind::EventReceived, move |event| {
                calls.lock().push(event.payload().map(|p| p.to_string()).unwrap_or_default());
                Ok(())
            });
        }
        manager.register(EventKind::Connected, |_| bail!("must not run"));

        manager.trigger(Event::with_payload(EventKind::EventReceived, json!({"k": 1})));
        assert_eq!(*calls.lock(), vec![r#"{"k":1}"#]);
        assert_eq!(manager.handler_count(EventKind::Connected), 1);
        assert_eq!(manager.handler_count(EventKind::ResponseReceived), 0);
    }

    #[test]
    fn trigger_without_handlers_is_a_no_op() {
        let manager = EventManager::new();
        assert_eq!(manager.trigger(EventKind::ConnectionError), 0);
    }

    #[test]
    fn handlers_may_register_from_inside_a_dispatch() {
        let manager = EventManager::new();
        let inner = manager.clone();
        manager.register(EventKind::Connecting, move |_| {
            inner.register(EventKind::Connected, |_| Ok(()));
            Ok(())
        });

        manager.trigger(EventKind::Connecting);
        assert_eq!(manager.handler_count(EventKind::Connected), 1);
    }

    #[tokio::test]
    async fn triggered_events_reach_stream_subscribers() -> Result<()> {
        let manager = EventManager::new();
        let mut receiver = manager.subscribe();

        manager.trigger(EventKind::Connecting);
        manager.trigger(Event::with_payload(EventKind::Connected, json!({"n": 1})));

        let event = wait_for(&mut receiver, EventKind::Connected, Duration::from_secs(1))
            .await
            .expect("connected event");
        assert_eq!(event.payload(), Some(&json!({"n": 1})));

        let missing = wait_for(&mut receiver, EventKind::Disconnected, Duration::from_millis(20)).await;
        assert!(missing.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn event_streams_yield_every_kind_in_order() -> Result<()> {
        let manager = EventManager::new();
        let stream = manager.subscribe_stream();

        manager.trigger(EventKind::Connecting);
        manager.trigger(EventKind::Connected);
        manager.trigger(EventKind::Disconnected);

        let kinds: Vec<EventKind> = stream
            .take(3)
            .map(|event| event.map(|event| event.kind()))
            .collect::<Result<_, _>>()
            .await?;
        assert_eq!(
            kinds,
            vec![EventKind::Connecting, EventKind::Connected, EventKind::Disconnected]
        );
        Ok(())
    }
}
