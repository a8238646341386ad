//! Change notification. The DAO-side callback publishes every change through
//! `pg_notify` inside the transaction, so delivery happens on commit and an
//! aborted transaction never leaks an event. A listener task fans incoming
//! notifications out to in-process subscribers over bounded queues; a slow
//! subscriber loses events rather than blocking the relay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use foundry_api::EventKind;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use sqlx::{PgConnection, PgPool};
use tokio::sync::mpsc;

use crate::dao::{Event, EventCallback};
use crate::StoreError;

pub const EVENTS_CHANNEL: &str = "foundry_events";

// NOTIFY payloads are capped by the server at 8000 bytes; anything close to
// that travels as id-only and subscribers re-fetch.
const MAX_NOTIFY_PAYLOAD: usize = 7000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub table: String,
    pub kind: EventKind,
    pub id: String,
    /// Full object JSON, absent when the payload would exceed the NOTIFY
    /// size limit.
    #[serde(default)]
    pub object: Option<serde_json::Value>,
}

/// DAO event callback that turns store events into `pg_notify` calls.
pub struct NotifyCallback;

#[async_trait]
impl EventCallback for NotifyCallback {
    async fn on_event(&self, conn: &mut PgConnection, event: &Event) -> Result<(), StoreError> {
        let id = event
            .object
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let mut notification = Notification {
            table: event.table.clone(),
            kind: event.kind,
            id,
            object: Some(event.object.clone()),
        };
        let mut payload = serde_json::to_string(&notification)?;
        if payload.len() > MAX_NOTIFY_PAYLOAD {
            notification.object = None;
            payload = serde_json::to_string(&notification)?;
        }
        sqlx::query("select pg_notify($1, $2)")
            .bind(EVENTS_CHANNEL)
            .bind(payload)
            .execute(conn)
            .await?;
        Ok(())
    }
}

struct Subscriber {
    table: String,
    kinds: Vec<EventKind>,
    tx: mpsc::Sender<Notification>,
}

/// Fan-out relay from the events channel to in-process subscribers.
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    subscribers: Mutex<Vec<Subscriber>>,
    dropped: AtomicU64,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                subscribers: Mutex::new(Vec::new()),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a subscriber for the given table and event kinds. An empty
    /// kind list subscribes to all kinds.
    pub fn subscribe(
        &self,
        table: &str,
        kinds: &[EventKind],
        capacity: usize,
    ) -> mpsc::Receiver<Notification> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut subscribers = self.lock_subscribers();
        subscribers.push(Subscriber {
            table: table.to_string(),
            kinds: kinds.to_vec(),
            tx,
        });
        rx
    }

    /// Number of notifications dropped because a subscriber queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Delivers a notification to every matching subscriber, dropping when a
    /// queue is full and pruning subscribers that went away.
    pub fn dispatch(&self, notification: &Notification) {
        let mut subscribers = self.lock_subscribers();
        subscribers.retain(|subscriber| {
            if subscriber.table != notification.table {
                return true;
            }
            if !subscriber.kinds.is_empty() && !subscriber.kinds.contains(&notification.kind) {
                return true;
            }
            match subscriber.tx.try_send(notification.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        table = %notification.table,
                        kind = %notification.kind.as_str(),
                        "dropping change notification for slow subscriber"
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Listens on the events channel and dispatches until the pool closes.
    /// Intended to be spawned once per process.
    pub async fn run(&self, pool: PgPool) -> Result<(), StoreError> {
        let mut listener = PgListener::connect_with(&pool).await?;
        listener.listen(EVENTS_CHANNEL).await?;
        loop {
            match listener.recv().await {
                Ok(notification) => {
                    match serde_json::from_str::<Notification>(notification.payload()) {
                        Ok(parsed) => self.dispatch(&parsed),
                        Err(err) => {
                            tracing::warn!(error = %err, "discarding malformed change notification");
                        }
                    }
                }
                Err(err) => {
                    if pool.is_closed() {
                        return Ok(());
                    }
                    tracing::warn!(error = %err, "notification listener error, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        match self.inner.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(table: &str, kind: EventKind, id: &str) -> Notification {
        Notification {
            table: table.to_string(),
            kind,
            id: id.to_string(),
            object: Some(serde_json::json!({"id": id})),
        }
    }

    #[tokio::test]
    async fn dispatch_routes_by_table_and_kind() {
        let notifier = Notifier::new();
        let mut clusters = notifier.subscribe("clusters", &[EventKind::Created], 4);
        let mut hubs = notifier.subscribe("hubs", &[], 4);

        notifier.dispatch(&notification("clusters", EventKind::Created, "c1"));
        notifier.dispatch(&notification("clusters", EventKind::Deleted, "c2"));
        notifier.dispatch(&notification("hubs", EventKind::Deleted, "h1"));

        let received = clusters.recv().await.expect("subscriber should receive");
        assert_eq!(received.id, "c1");
        assert!(clusters.try_recv().is_err());

        let received = hubs.recv().await.expect("subscriber should receive");
        assert_eq!(received.id, "h1");
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe("clusters", &[], 1);

        notifier.dispatch(&notification("clusters", EventKind::Created, "c1"));
        notifier.dispatch(&notification("clusters", EventKind::Created, "c2"));

        assert_eq!(notifier.dropped(), 1);
        assert_eq!(rx.recv().await.expect("first event kept").id, "c1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let notifier = Notifier::new();
        let rx = notifier.subscribe("clusters", &[], 1);
        drop(rx);

        notifier.dispatch(&notification("clusters", EventKind::Created, "c1"));
        // A second dispatch sees no subscribers left; no drop is counted for
        // closed receivers.
        notifier.dispatch(&notification("clusters", EventKind::Created, "c2"));
        assert_eq!(notifier.dropped(), 0);
    }

    #[test]
    fn oversized_payload_falls_back_to_id_only() {
        let large = "x".repeat(MAX_NOTIFY_PAYLOAD);
        let event = Event {
            table: "clusters".to_string(),
            kind: EventKind::Updated,
            object: serde_json::json!({"id": "c1", "spec": {"blob": large}}),
        };
        let id = event.object["id"].as_str().unwrap_or_default().to_string();
        let mut notification = Notification {
            table: event.table.clone(),
            kind: event.kind,
            id,
            object: Some(event.object.clone()),
        };
        let payload = serde_json::to_string(&notification).expect("payload should serialize");
        assert!(payload.len() > MAX_NOTIFY_PAYLOAD);
        notification.object = None;
        let payload = serde_json::to_string(&notification).expect("payload should serialize");
        assert!(payload.len() <= MAX_NOTIFY_PAYLOAD);
    }
}
