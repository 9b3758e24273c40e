//! In-process event bus
//!
//! `EventBus` fans typed state-change notifications out to any number of
//! subscribers. Each subscriber owns a bounded queue; publishing never
//! waits on a subscriber. When a queue is full that one delivery is
//! dropped and a warning is logged, so a slow UI client can never stall
//! approval resolution for every other consumer.
//!
//! Subscriptions are bound to a `CancellationToken`. Cancelling the token
//! (or dropping the `Subscription`) removes the subscriber and closes its
//! channel; consumers treat the closed channel as a clean shutdown.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Default per-subscriber queue depth
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 100;

/// Closed set of notification types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    NewApproval,
    ApprovalResolved,
    SessionCreated,
    SessionStatusChanged,
    SessionUpdated,
    ConversationUpdated,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::NewApproval => "new_approval",
            EventType::ApprovalResolved => "approval_resolved",
            EventType::SessionCreated => "session_created",
            EventType::SessionStatusChanged => "session_status_changed",
            EventType::SessionUpdated => "session_updated",
            EventType::ConversationUpdated => "conversation_updated",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "new_approval" => Some(EventType::NewApproval),
            "approval_resolved" => Some(EventType::ApprovalResolved),
            "session_created" => Some(EventType::SessionCreated),
            "session_status_changed" => Some(EventType::SessionStatusChanged),
            "session_updated" => Some(EventType::SessionUpdated),
            "conversation_updated" => Some(EventType::ConversationUpdated),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transient state-change notification
///
/// `data` is a flat key/value map. Every subscriber receives its own
/// clone, so consumers cannot observe each other's mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique event identifier (evt-<uuid>)
    pub id: String,

    #[serde(rename = "type")]
    pub event_type: EventType,

    pub data: serde_json::Map<String, serde_json::Value>,

    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create an event with an empty payload
    pub fn new(event_type: EventType) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            event_type,
            data: serde_json::Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Add a payload entry
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(|v| v.as_bool())
    }

    /// Read a list of strings, skipping non-string entries
    pub fn string_list(&self, key: &str) -> Vec<String> {
        self.data
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.str_field("session_id")
    }
}

/// Which events a subscription wants
///
/// An empty `types` set matches every type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    #[serde(default)]
    pub types: HashSet<EventType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl EventFilter {
    /// Match every event
    pub fn all() -> Self {
        Self::default()
    }

    /// Match only the given types
    pub fn types(types: impl IntoIterator<Item = EventType>) -> Self {
        Self {
            types: types.into_iter().collect(),
            session_id: None,
        }
    }

    /// Narrow to events about one session
    pub fn for_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.types.is_empty() && !self.types.contains(&event.event_type) {
            return false;
        }
        match &self.session_id {
            Some(wanted) => event.session_id() == Some(wanted.as_str()),
            None => true,
        }
    }
}

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::Sender<Event>,
}

/// Fan-out publish/subscribe hub
pub struct EventBus {
    subscribers: Arc<DashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    buffer: usize,
    dropped: AtomicU64,
}

impl EventBus {
    /// Create a bus whose subscribers each get a queue of `buffer` events
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a subscriber
    ///
    /// The subscription lives until `cancel` fires or the returned
    /// handle is dropped, whichever comes first. Must be called from
    /// within a Tokio runtime.
    pub fn subscribe(&self, cancel: CancellationToken, filter: EventFilter) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);

        tracing::debug!(
            subscription = id,
            types = ?filter.types,
            session_id = ?filter.session_id,
            "Subscriber registered"
        );

        let watch_tx = tx.clone();
        self.subscribers.insert(id, Subscriber { filter, tx });

        let subscribers = self.subscribers.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = watch_tx.closed() => {}
            }
            subscribers.remove(&id);
            tracing::debug!(subscription = id, "Subscriber released");
        });

        Subscription { id, rx }
    }

    /// Deliver `event` to every matching subscriber without waiting
    ///
    /// Returns the number of subscribers that accepted the event.
    pub fn publish(&self, event: Event) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if !subscriber.filter.matches(&event) {
                continue;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        subscription = *entry.key(),
                        event_id = %event.id,
                        event_type = %event.event_type,
                        "Subscriber queue full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }

        for id in closed {
            self.subscribers.remove(&id);
        }

        tracing::trace!(
            event_id = %event.id,
            event_type = %event.event_type,
            delivered,
            "Event published"
        );

        delivered
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Total deliveries dropped because a subscriber queue was full
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

/// Consumer handle for one subscription
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event; `None` means the subscription ended
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Take an already-queued event without waiting
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Convert into a `Stream` of events
    pub fn into_stream(self) -> ReceiverStream<Event> {
        ReceiverStream::new(self.rx)
    }
}
