//! Patch store adapter: durable history behind the session.
//!
//! The store contract is deliberately small: load what exists, append new
//! envelopes, and stream arrivals. Stores may redeliver — the graph dedups
//! by id — but every delivered patch's ancestry must already have been
//! delivered (or `has_more` must say the load was truncated).
//!
//! [`MemoryPatchStore`] is the in-process reference implementation. It
//! fans appended envelopes out to every subscriber and round-trips its
//! contents as newline-delimited JSON, the text transport format of the
//! patch envelope.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::mpsc;
use vellum_core::{Patch, PatchId};

/// Patch store failures.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store load failed: {0}")]
    Load(String),
    #[error("store append failed: {0}")]
    Append(String),
}

/// Result of [`PatchStore::load_initial`].
#[derive(Debug, Clone)]
pub struct InitialLoad<B> {
    pub patches: Vec<Patch<B>>,
    /// Whether older history exists beyond what was returned.
    pub has_more: bool,
}

/// Durable patch history.
#[async_trait]
pub trait PatchStore<B: Clone + Send + Sync + 'static>: Send + Sync {
    /// Load existing patches, optionally only those after `since`.
    async fn load_initial(&self, since: Option<&PatchId>) -> Result<InitialLoad<B>, StoreError>;

    /// Persist one envelope and deliver it to subscribers.
    async fn append(&self, envelope: Patch<B>) -> Result<(), StoreError>;

    /// Stream of envelopes appended after subscription.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<Patch<B>>;
}

struct MemoryStoreInner<B> {
    patches: Vec<Patch<B>>,
    subscribers: Vec<mpsc::UnboundedSender<Patch<B>>>,
}

/// In-memory reference store shared between sessions in one process.
pub struct MemoryPatchStore<B> {
    inner: Mutex<MemoryStoreInner<B>>,
}

impl<B: Clone + Send + Sync + 'static> Default for MemoryPatchStore<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Clone + Send + Sync + 'static> MemoryPatchStore<B> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryStoreInner {
                patches: Vec::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStoreInner<B>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of everything appended so far.
    pub fn patches(&self) -> Vec<Patch<B>> {
        self.lock().patches.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().patches.is_empty()
    }
}

impl<B> MemoryPatchStore<B>
where
    B: Clone + Send + Sync + Serialize + DeserializeOwned + Default + 'static,
{
    /// Serialize the store's contents as newline-delimited JSON.
    pub fn export_ndjson(&self) -> Result<String, StoreError> {
        let inner = self.lock();
        let mut lines = Vec::with_capacity(inner.patches.len());
        for patch in &inner.patches {
            lines.push(
                serde_json::to_string(patch).map_err(|e| StoreError::Load(e.to_string()))?,
            );
        }
        Ok(lines.join("\n"))
    }

    /// Build a store from newline-delimited JSON. Corrupt lines are
    /// skipped with a warning.
    pub fn import_ndjson(text: &str) -> Self {
        let store = Self::new();
        {
            let mut inner = store.lock();
            for line in text.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Patch<B>>(line) {
                    Ok(patch) => inner.patches.push(patch),
                    Err(err) => log::warn!("skipping corrupt store line: {err}"),
                }
            }
        }
        store
    }
}

#[async_trait]
impl<B: Clone + Send + Sync + 'static> PatchStore<B> for MemoryPatchStore<B> {
    async fn load_initial(&self, since: Option<&PatchId>) -> Result<InitialLoad<B>, StoreError> {
        let inner = self.lock();
        let patches = match since {
            None => inner.patches.clone(),
            Some(since) => inner
                .patches
                .iter()
                .filter(|p| &p.id > since)
                .cloned()
                .collect(),
        };
        Ok(InitialLoad {
            patches,
            has_more: false,
        })
    }

    async fn append(&self, envelope: Patch<B>) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.patches.push(envelope.clone());
        inner
            .subscribers
            .retain(|tx| tx.send(envelope.clone()).is_ok());
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Patch<B>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_core::{PatchId, TextDiff, TextPatch};

    fn patch(t: u64, from: &str, to: &str) -> Patch<TextPatch> {
        Patch::new(
            PatchId::encode(t, "store-test").unwrap(),
            TextDiff.make(from, to),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_append_and_load() {
        let store = MemoryPatchStore::new();
        store.append(patch(1, "", "a")).await.unwrap();
        store.append(patch(2, "a", "ab")).await.unwrap();

        let load = store.load_initial(None).await.unwrap();
        assert_eq!(load.patches.len(), 2);
        assert!(!load.has_more);
    }

    #[tokio::test]
    async fn test_load_since_filters() {
        let store = MemoryPatchStore::new();
        let first = patch(1, "", "a");
        let since = first.id.clone();
        store.append(first).await.unwrap();
        store.append(patch(2, "a", "ab")).await.unwrap();

        let load = store.load_initial(Some(&since)).await.unwrap();
        assert_eq!(load.patches.len(), 1);
    }

    #[tokio::test]
    async fn test_subscribers_receive_appends() {
        let store = MemoryPatchStore::new();
        let mut rx1 = store.subscribe();
        let mut rx2 = store.subscribe();

        let envelope = patch(1, "", "x");
        store.append(envelope.clone()).await.unwrap();

        assert_eq!(rx1.recv().await.unwrap().id, envelope.id);
        assert_eq!(rx2.recv().await.unwrap().id, envelope.id);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let store = MemoryPatchStore::new();
        let rx = store.subscribe();
        drop(rx);
        store.append(patch(1, "", "x")).await.unwrap();
        assert_eq!(store.lock().subscribers.len(), 0);
    }

    #[tokio::test]
    async fn test_ndjson_round_trip() {
        let store = MemoryPatchStore::new();
        store.append(patch(1, "", "a")).await.unwrap();
        store.append(patch(2, "a", "ab")).await.unwrap();

        let text = store.export_ndjson().unwrap();
        assert_eq!(text.lines().count(), 2);

        let restored: MemoryPatchStore<TextPatch> = MemoryPatchStore::import_ndjson(&text);
        assert_eq!(restored.patches(), store.patches());
    }

    #[test]
    fn test_import_skips_corrupt_lines() {
        let text = "{\"id\":\"00000000001_c\",\"parents\":[]}\nnot json\n";
        let store: MemoryPatchStore<TextPatch> = MemoryPatchStore::import_ndjson(text);
        assert_eq!(store.len(), 1);
    }
}
