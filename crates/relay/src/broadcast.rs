//! Best-effort notification fan-out to connected observers.
//!
//! Observers subscribe and receive every message broadcast while they are
//! connected; there is no queuing or replay. A subscriber whose channel is
//! closed is removed from the registry rather than failing the broadcast,
//! and a slow observer never blocks the caller (unbounded per-subscriber
//! channels decouple delivery from the request thread).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Server-to-observer message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl NotificationMessage {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new("info", message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new("warning", message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new("success", message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new("error", message)
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

/// Registry of currently-connected observers.
#[derive(Default)]
pub struct Broadcaster {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    /// Lifetime connection count.
    connections_total: AtomicU64,
    /// Lifetime delivered-message count.
    delivered_total: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new observer; returns its id and the receiving end.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock is poisoned.
    pub fn subscribe(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("broadcaster lock poisoned")
            .push(Subscriber { id, tx });
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        debug!(subscriber_id = id, "Observer subscribed");
        (id, rx)
    }

    /// Remove an observer (disconnect).
    ///
    /// # Panics
    ///
    /// Panics if the registry lock is poisoned.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("broadcaster lock poisoned")
            .retain(|s| s.id != id);
        debug!(subscriber_id = id, "Observer unsubscribed");
    }

    /// Deliver a message to every connected observer.
    ///
    /// Failed sends (observer gone) remove the subscriber instead of
    /// propagating an error. Returns the number of deliveries.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock is poisoned.
    pub fn broadcast(&self, message: &NotificationMessage) -> usize {
        let payload = serde_json::to_string(message).expect("notification serializes");

        let mut subscribers = self.subscribers.lock().expect("broadcaster lock poisoned");
        let before = subscribers.len();
        subscribers.retain(|s| s.tx.send(payload.clone()).is_ok());
        let delivered = subscribers.len();
        drop(subscribers);

        if delivered < before {
            debug!(
                removed = before - delivered,
                "Dropped dead observer connections during broadcast"
            );
        }
        self.delivered_total
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Currently-connected observer count.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock is poisoned.
    pub fn active_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("broadcaster lock poisoned")
            .len()
    }

    pub fn connections_total(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    pub fn delivered_total(&self) -> u64 {
        self.delivered_total.load(Ordering::Relaxed)
    }
}
