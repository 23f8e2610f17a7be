//! Event subscription for the engine: item lifecycle, folder state
//! transitions and error reports, delivered as structured JSON payloads.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::broadcast;

pub const BUFFER_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventType {
    ItemStarted,
    ItemFinished,
    StateChanged,
    FolderErrors,
    LocalIndexUpdated,
    RemoteIndexUpdated,
    FolderScanProgress,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ItemStarted => "ItemStarted",
            EventType::ItemFinished => "ItemFinished",
            EventType::StateChanged => "StateChanged",
            EventType::FolderErrors => "FolderErrors",
            EventType::LocalIndexUpdated => "LocalIndexUpdated",
            EventType::RemoteIndexUpdated => "RemoteIndexUpdated",
            EventType::FolderScanProgress => "FolderScanProgress",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: u64,
    /// Seconds since the epoch.
    pub time: i64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: serde_json::Value,
}

/// Fan-out bus for engine events. Slow subscribers lag and lose events
/// rather than blocking producers.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUFFER_SIZE);
        Self {
            tx,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn log(&self, event_type: EventType, data: serde_json::Value) {
        let event = Event {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            time: now_unix(),
            event_type,
            data,
        };
        tracing::trace!(event = %event_type, "event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// JSON error payload: null on success, the message otherwise.
pub fn error_payload(err: Option<&str>) -> serde_json::Value {
    match err {
        Some(message) => serde_json::Value::String(message.to_string()),
        None => serde_json::Value::Null,
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
