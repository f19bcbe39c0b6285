//! File mirror adapter: the session's single-writer sink.
//!
//! The session serializes writes itself (one in flight, later contents
//! coalesced), so adapters may assume no concurrent writer from this core.
//! `watch` surfaces external modifications; adapters without change
//! detection return `None`.
//!
//! [`MemoryFileAdapter`] is the reference implementation used in tests and
//! demos: it records every `(content, base)` write pair, supports an
//! injectable write delay to surface queue behavior, and can simulate
//! external edits.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// File adapter failures.
#[derive(Debug, Clone, Error)]
pub enum FileError {
    #[error("file read failed: {0}")]
    Read(String),
    #[error("file write failed: {0}")]
    Write(String),
}

/// A mirrored file.
#[async_trait]
pub trait FileAdapter: Send + Sync {
    /// Current file content; empty string when the file is missing.
    async fn read(&self) -> Result<String, FileError>;

    /// Replace the file content. `base` is the content the writer believes
    /// is on disk, for adapters that can detect lost updates.
    async fn write(&self, content: &str, base: Option<&str>) -> Result<(), FileError>;

    /// Stream of external-change notifications, if the adapter watches.
    fn watch(&self) -> Option<mpsc::UnboundedReceiver<()>> {
        None
    }
}

/// One recorded write: `(content, base)`.
pub type RecordedWrite = (String, Option<String>);

struct MemoryFileInner {
    content: String,
    writes: Vec<RecordedWrite>,
    watchers: Vec<mpsc::UnboundedSender<()>>,
}

/// In-memory reference file adapter.
pub struct MemoryFileAdapter {
    inner: Mutex<MemoryFileInner>,
    write_delay: Duration,
    fail_writes: AtomicBool,
    active_writes: AtomicUsize,
    max_concurrent_writes: AtomicUsize,
}

impl Default for MemoryFileAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFileAdapter {
    pub fn new() -> Self {
        Self::with_write_delay(Duration::ZERO)
    }

    /// Writes sleep for `delay` before landing, exposing queue overlap.
    pub fn with_write_delay(delay: Duration) -> Self {
        Self {
            inner: Mutex::new(MemoryFileInner {
                content: String::new(),
                writes: Vec::new(),
                watchers: Vec::new(),
            }),
            write_delay: delay,
            fail_writes: AtomicBool::new(false),
            active_writes: AtomicUsize::new(0),
            max_concurrent_writes: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryFileInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every write observed so far, in order.
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.lock().writes.clone()
    }

    /// Highest number of writes ever in flight at once.
    pub fn max_concurrent_writes(&self) -> usize {
        self.max_concurrent_writes.load(Ordering::SeqCst)
    }

    /// Make subsequent writes fail until called with `false`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Replace the content out-of-band and notify watchers, as an external
    /// editor would.
    pub fn simulate_external_change(&self, content: impl Into<String>) {
        let mut inner = self.lock();
        inner.content = content.into();
        inner.watchers.retain(|tx| tx.send(()).is_ok());
    }
}

#[async_trait]
impl FileAdapter for MemoryFileAdapter {
    async fn read(&self) -> Result<String, FileError> {
        Ok(self.lock().content.clone())
    }

    async fn write(&self, content: &str, base: Option<&str>) -> Result<(), FileError> {
        let active = self.active_writes.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_writes.fetch_max(active, Ordering::SeqCst);

        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }

        let result = if self.fail_writes.load(Ordering::SeqCst) {
            Err(FileError::Write("injected failure".into()))
        } else {
            let mut inner = self.lock();
            inner.content = content.to_string();
            inner
                .writes
                .push((content.to_string(), base.map(str::to_string)));
            // Filesystem watchers fire for our own writes too.
            inner.watchers.retain(|tx| tx.send(()).is_ok());
            Ok(())
        };

        self.active_writes.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn watch(&self) -> Option<mpsc::UnboundedReceiver<()>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().watchers.push(tx);
        Some(rx)
    }
}
