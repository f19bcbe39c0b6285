//! Presence: freeform peer state plus cursor bookkeeping.
//!
//! Presence payloads are deliberately unstructured JSON — peers may ship
//! whatever state they like, with no ordering or delivery guarantees. The
//! one shape the session understands is the cursor beacon
//! (`{"type":"cursor", "time":…, "locs":…, "userId":…, "docId":…}`);
//! everything else is forwarded to the application as-is.
//!
//! Cursor entries are keyed `user-<userId>` when a user id is known, else
//! by the sender's client id, and are pruned after a TTL.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Entries older than this are pruned from cursor snapshots.
pub const CURSOR_TTL_MS: u64 = 60_000;

/// Presence adapter failures.
#[derive(Debug, Clone, Error)]
pub enum PresenceError {
    #[error("presence publish failed: {0}")]
    Publish(String),
}

/// One peer's published state. `payload: None` means the peer departed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub client_id: String,
    pub payload: Option<Value>,
}

/// Presence transport.
#[async_trait]
pub trait PresenceAdapter: Send + Sync {
    async fn publish(&self, update: PresenceUpdate) -> Result<(), PresenceError>;

    /// Stream of peer updates. `skip_client` filters out the caller's own
    /// echoes.
    fn subscribe(&self, skip_client: Option<&str>) -> mpsc::UnboundedReceiver<PresenceUpdate>;
}

/// The cursor beacon payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorBeacon {
    #[serde(rename = "type")]
    pub kind: String,
    /// Sender's clock, milliseconds; drives TTL pruning.
    pub time: u64,
    /// Codec-dependent cursor locations, opaque to the session.
    pub locs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
}

impl CursorBeacon {
    pub fn new(time: u64, locs: Value, user_id: Option<u32>, doc_id: Option<String>) -> Self {
        Self {
            kind: "cursor".to_string(),
            time,
            locs,
            user_id,
            doc_id,
        }
    }

    /// Parse a presence payload as a cursor beacon, if it is one.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        if payload.get("type").and_then(Value::as_str) != Some("cursor") {
            return None;
        }
        serde_json::from_value(payload.clone()).ok()
    }

    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// One tracked cursor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CursorEntry {
    /// `user-<userId>` when known, else the sender's client id.
    pub key: String,
    pub client_id: String,
    pub user_id: Option<u32>,
    pub locs: Value,
    pub time: u64,
}

/// Cursor state for one document, local peer included.
#[derive(Debug, Default)]
pub struct CursorRoom {
    entries: HashMap<String, CursorEntry>,
}

impl CursorRoom {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a beacon from `client_id`, replacing that peer's prior state.
    pub fn merge(&mut self, beacon: &CursorBeacon, client_id: &str) {
        let key = match beacon.user_id {
            Some(user) => format!("user-{user}"),
            None => client_id.to_string(),
        };
        self.entries.insert(
            key.clone(),
            CursorEntry {
                key,
                client_id: client_id.to_string(),
                user_id: beacon.user_id,
                locs: beacon.locs.clone(),
                time: beacon.time,
            },
        );
    }

    /// Drop all entries published by `client_id`. Returns whether anything
    /// was removed.
    pub fn remove_client(&mut self, client_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.client_id != client_id);
        self.entries.len() != before
    }

    /// Prune entries older than `ttl_ms` against `now_ms` and return the
    /// survivors sorted by key.
    pub fn snapshot(&mut self, now_ms: u64, ttl_ms: u64) -> Vec<CursorEntry> {
        let cutoff = now_ms.saturating_sub(ttl_ms);
        self.entries.retain(|_, e| e.time >= cutoff);
        let mut entries: Vec<CursorEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct MemoryPresenceInner {
    subscribers: Vec<(mpsc::UnboundedSender<PresenceUpdate>, Option<String>)>,
}

/// In-memory reference presence transport.
pub struct MemoryPresenceAdapter {
    inner: Mutex<MemoryPresenceInner>,
}

impl Default for MemoryPresenceAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPresenceAdapter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryPresenceInner {
                subscribers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryPresenceInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl PresenceAdapter for MemoryPresenceAdapter {
    async fn publish(&self, update: PresenceUpdate) -> Result<(), PresenceError> {
        self.lock().subscribers.retain(|(tx, skip)| {
            if skip.as_deref() == Some(update.client_id.as_str()) {
                return !tx.is_closed();
            }
            tx.send(update.clone()).is_ok()
        });
        Ok(())
    }

    fn subscribe(&self, skip_client: Option<&str>) -> mpsc::UnboundedReceiver<PresenceUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()
            .subscribers
            .push((tx, skip_client.map(str::to_string)));
        rx
    }
}
