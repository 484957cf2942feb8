//! Correlation of outgoing requests with their replies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nyuki_protocol::{BusError, BusResult};
use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};
use tracing::debug;

use crate::response::BusResponse;

type Completion = oneshot::Sender<BusResult<BusResponse>>;

/// Message id -> single-use completion handle.
///
/// An entry leaves the table exactly once: when a reply resolves it, when
/// the table is failed wholesale, or when its [`PendingRequest`] is dropped
/// (deadline passed or caller gave up).
#[derive(Clone, Default)]
pub struct PendingRequests {
    entries: Arc<Mutex<HashMap<String, Completion>>>,
    settled: Arc<Notify>,
}

impl PendingRequests {
    pub fn insert(&self, id: impl Into<String>) -> PendingRequest {
        let id = id.into();
        let (sender, receiver) = oneshot::channel();
        self.entries.lock().insert(id.clone(), sender);
        PendingRequest {
            id,
            receiver,
            table: self.clone(),
        }
    }

    /// Completes the entry for `id`. Returns false for unknown ids.
    pub fn resolve(&self, id: &str, result: BusResult<BusResponse>) -> bool {
        let completion = self.entries.lock().remove(id);
        let Some(completion) = completion else {
            return false;
        };
        self.settled.notify_waiters();
        // The waiter may have given up in the meantime.
        let _ = completion.send(result);
        true
    }

    pub fn fail_all(&self, error: impl Fn(&str) -> BusError) -> usize {
        let drained: Vec<(String, Completion)> = self.entries.lock().drain().collect();
        let count = drained.len();
        for (id, completion) in drained {
            let _ = completion.send(Err(error(&id)));
        }
        if count > 0 {
            debug!(count, "pending requests failed");
            self.settled.notify_waiters();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    /// Waits until the table is empty. Returns false if `deadline` passed first.
    pub async fn wait_settled(&self, deadline: Duration) -> bool {
        let settle = async {
            loop {
                let notified = self.settled.notified();
                if self.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(deadline, settle).await.is_ok()
    }

    fn forget(&self, id: &str) {
        if self.entries.lock().remove(id).is_some() {
            self.settled.notify_waiters();
        }
    }
}

/// Receiving side of one pending entry.
pub struct PendingRequest {
    id: String,
    receiver: oneshot::Receiver<BusResult<BusResponse>>,
    table: PendingRequests,
}

impl PendingRequest {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(mut self, deadline: Duration) -> BusResult<BusResponse> {
        match tokio::time::timeout(deadline, &mut self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::Disconnected(self.id.clone())),
            Err(_) => {
                debug!(id = %self.id, "no longer waiting for a response");
                Err(BusError::Timeout {
                    id: self.id.clone(),
                    timeout: deadline,
                })
            }
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.table.forget(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nyuki_protocol::BusError;

    use super::PendingRequests;
    use crate::response::BusResponse;

    #[tokio::test]
    async fn resolved_entry_is_removed() {
        let table = PendingRequests::default();
        let pending = table.insert("abc");
        assert!(table.contains("abc"));

        assert!(table.resolve("abc", Ok(BusResponse::new(200, "{}"))));
        assert!(!table.resolve("abc", Ok(BusResponse::new(200, "{}"))));
        let response = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(response.status(), 200);
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_timeouts_do_not_leak() {
        let table = PendingRequests::default();
        for round in 0..5 {
            let pending = table.insert(format!("req-{round}"));
            let error = pending.wait(Duration::from_secs(60)).await.unwrap_err();
            assert!(error.is_timeout());
        }
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn fail_all_wakes_waiters_with_disconnected() {
        let table = PendingRequests::default();
        let first = table.insert("one");
        let second = table.insert("two");

        assert_eq!(table.fail_all(|id| BusError::Disconnected(id.to_owned())), 2);
        for pending in [first, second] {
            assert!(matches!(
                pending.wait(Duration::from_secs(1)).await,
                Err(BusError::Disconnected(_))
            ));
        }
        assert!(table.wait_settled(Duration::from_millis(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_settled_honours_its_deadline() {
        let table = PendingRequests::default();
        let _pending = table.insert("stuck");
        assert!(!table.wait_settled(Duration::from_secs(5)).await);
    }
}
