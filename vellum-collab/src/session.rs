//! One participant's view of a shared document.
//!
//! The session owns a [`PatchGraph`] and orchestrates everything around
//! it: local commits, remote ingestion, undo/redo over the local patch
//! tail, working-copy rebase while remote history advances, the
//! single-writer file mirror queue, and cursor/presence relay.
//!
//! ```text
//! commit ──► graph.add ──► sync ──► file queue ──► FileAdapter
//!   │            ▲          │
//!   │            │          └──► events (Change / Patch / Cursors / …)
//!   └──► PatchStore.append
//!               │
//!        subscribe (remote envelopes)
//! ```
//!
//! Locally-observable state changes (graph insert, local patch list, live
//! document) happen synchronously before any await, so observers see a
//! commit immediately; persistence completes later. Adapter pump tasks
//! hold only weak references back to the session, so dropping the session
//! tears the cycle down.

use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use vellum_core::{
    client_token, CodecError, DocCodec, Document, GraphError, HistoryQuery, IdError, Patch,
    PatchGraph, PatchId, ValueQuery, VersionRange,
};

use crate::file::FileAdapter;
use crate::presence::{
    CursorBeacon, CursorEntry, CursorRoom, PresenceAdapter, PresenceUpdate, CURSOR_TTL_MS,
};
use crate::store::{PatchStore, StoreError};

/// Milliseconds-since-epoch clock. Injectable for tests.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

fn default_clock() -> Clock {
    Arc::new(|| {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    })
}

/// Session failures.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session used before init()")]
    NotInitialized,

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Id(#[from] IdError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Events emitted by the session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The live document changed.
    Change,
    /// A remote patch was ingested.
    Patch { id: PatchId },
    /// Cursor state changed.
    Cursors,
    /// A non-cursor presence payload arrived (or a peer departed).
    Presence(PresenceUpdate),
    /// A file mirror write failed; the queue continues.
    FileError(String),
}

/// Optional metadata attached to a commit.
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    /// Marks the patch as file-origin (participates in file-load dedup).
    pub file: bool,
    pub source: Option<String>,
    pub meta: Option<serde_json::Map<String, Value>>,
}

/// Session construction parameters.
pub struct SessionConfig<C: DocCodec> {
    pub codec: C,
    /// Generated from the OS RNG when not supplied.
    pub client_id: Option<String>,
    pub user_id: Option<u32>,
    pub doc_id: Option<String>,
    pub clock: Option<Clock>,
}

impl<C: DocCodec> SessionConfig<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            client_id: None,
            user_id: None,
            doc_id: None,
            clock: None,
        }
    }
}

struct WorkingCopy<D> {
    base: D,
    draft: D,
}

struct State<C: DocCodec> {
    graph: PatchGraph<C>,
    initialized: bool,
    has_more_history: bool,
    /// Last committed/synced document (no working copy applied).
    committed: C::Doc,
    /// The displayed document: committed, or the rebased draft.
    live: C::Doc,
    working_copy: Option<WorkingCopy<C::Doc>>,
    /// Ids committed by this session, in commit order.
    local_times: Vec<PatchId>,
    /// Boundary of the visible local tail; ids at and past it are hidden.
    undo_ptr: usize,
    last_encoded_ms: u64,
    cursors: CursorRoom,

    // File mirror queue.
    persisted: Option<String>,
    dirty: Option<String>,
    suppress_file_changes: u32,
    write_in_flight: bool,
}

struct Core<C: DocCodec> {
    codec: C,
    clock: Clock,
    client_id: String,
    user_id: Option<u32>,
    doc_id: Option<String>,
    store: Arc<dyn PatchStore<C::Body>>,
    file: Option<Arc<dyn FileAdapter>>,
    presence: Option<Arc<dyn PresenceAdapter>>,
    state: Mutex<State<C>>,
    events: Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
    /// Back-reference for tasks this core spawns about itself.
    self_weak: Weak<Core<C>>,
}

/// One participant's session over a shared patch graph.
pub struct Session<C: DocCodec> {
    core: Arc<Core<C>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: DocCodec> Session<C> {
    pub fn new(
        config: SessionConfig<C>,
        store: Arc<dyn PatchStore<C::Body>>,
        file: Option<Arc<dyn FileAdapter>>,
        presence: Option<Arc<dyn PresenceAdapter>>,
    ) -> Self {
        let codec = config.codec;
        let empty = codec.from_string("");
        let core = Arc::new_cyclic(|self_weak| Core {
            codec: codec.clone(),
            clock: config.clock.unwrap_or_else(default_clock),
            client_id: config.client_id.unwrap_or_else(client_token),
            user_id: config.user_id,
            doc_id: config.doc_id,
            store,
            file,
            presence,
            state: Mutex::new(State {
                graph: PatchGraph::new(codec),
                initialized: false,
                has_more_history: false,
                committed: empty.clone(),
                live: empty,
                working_copy: None,
                local_times: Vec::new(),
                undo_ptr: 0,
                last_encoded_ms: 0,
                cursors: CursorRoom::new(),
                persisted: None,
                dirty: None,
                suppress_file_changes: 0,
                write_in_flight: false,
            }),
            events: Mutex::new(Vec::new()),
            self_weak: self_weak.clone(),
        });
        Self {
            core,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.core.client_id
    }

    pub fn user_id(&self) -> Option<u32> {
        self.core.user_id
    }

    pub fn doc_id(&self) -> Option<&str> {
        self.core.doc_id.as_deref()
    }

    /// Load existing history and start the adapter pumps.
    pub async fn init(&self) -> Result<(), SessionError> {
        let initial = self.core.store.load_initial(None).await?;
        {
            let mut state = self.core.lock_state();
            state.graph.add(initial.patches);
            state.has_more_history = initial.has_more;
            state.last_encoded_ms = state
                .graph
                .versions(None)
                .iter()
                .filter_map(|id| id.time_ms().ok())
                .max()
                .unwrap_or(0);
            let committed = state.graph.current()?;
            state.live = committed.clone();
            if self.core.file.is_some() {
                state.persisted = Some(self.core.codec.to_string(&committed));
            }
            state.committed = committed;
            state.initialized = true;
        }

        let mut tasks = lock_plain(&self.tasks);

        // Remote envelopes.
        let mut patch_rx = self.core.store.subscribe();
        let weak = Arc::downgrade(&self.core);
        tasks.push(tokio::spawn(async move {
            while let Some(envelope) = patch_rx.recv().await {
                let Some(core) = weak.upgrade() else { break };
                if let Err(err) = core.apply_remote(envelope) {
                    log::warn!("failed to apply remote patch: {err}");
                }
            }
        }));

        // Peer presence.
        if let Some(presence) = &self.core.presence {
            let mut presence_rx = presence.subscribe(Some(&self.core.client_id));
            let weak = Arc::downgrade(&self.core);
            tasks.push(tokio::spawn(async move {
                while let Some(update) = presence_rx.recv().await {
                    let Some(core) = weak.upgrade() else { break };
                    core.handle_presence(update);
                }
            }));
        }

        // External file edits.
        if let Some(file) = &self.core.file {
            if let Some(mut watch_rx) = file.watch() {
                let weak = Arc::downgrade(&self.core);
                tasks.push(tokio::spawn(async move {
                    while watch_rx.recv().await.is_some() {
                        let Some(core) = weak.upgrade() else { break };
                        core.handle_file_change().await;
                    }
                }));
            }
        }
        Ok(())
    }

    /// Stop pumps, announce departure, and drop listeners. In-flight file
    /// writes complete on their own.
    pub async fn close(&self) {
        let handles: Vec<JoinHandle<()>> = lock_plain(&self.tasks).drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        if let Some(presence) = &self.core.presence {
            let _ = presence
                .publish(PresenceUpdate {
                    client_id: self.core.client_id.clone(),
                    payload: None,
                })
                .await;
        }
        lock_plain(&self.core.events).clear();
        self.core.lock_state().initialized = false;
    }

    /// Subscribe to session events.
    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock_plain(&self.core.events).push(tx);
        rx
    }

    /// Commit a new document state authored by this session.
    pub async fn commit(&self, next: C::Doc) -> Result<Patch<C::Body>, SessionError> {
        self.commit_with(next, CommitOptions::default()).await
    }

    pub async fn commit_with(
        &self,
        next: C::Doc,
        options: CommitOptions,
    ) -> Result<Patch<C::Body>, SessionError> {
        let envelope = {
            let mut state = self.core.lock_state();
            if !state.initialized {
                return Err(SessionError::NotInitialized);
            }
            let base = match &state.working_copy {
                Some(wc) => wc.base.clone(),
                None => state.committed.clone(),
            };
            self.core.commit_locked(&mut state, &base, next, &options)?
        };
        self.core.finish_commit(&envelope).await;
        Ok(envelope)
    }

    /// Ingest a remote envelope directly (normally driven by the store
    /// subscription).
    pub fn apply_remote(&self, envelope: Patch<C::Body>) -> Result<(), SessionError> {
        self.core.apply_remote(envelope)
    }

    /// The live document.
    pub fn get_document(&self) -> Result<C::Doc, SessionError> {
        let state = self.core.lock_state();
        if !state.initialized {
            return Err(SessionError::NotInitialized);
        }
        Ok(state.live.clone())
    }

    /// Whether the initial load was truncated by the store.
    pub fn has_more_history(&self) -> bool {
        self.core.lock_state().has_more_history
    }

    // ── Undo / redo ─────────────────────────────────────────────────

    pub fn can_undo(&self) -> bool {
        self.core.lock_state().undo_ptr > 0
    }

    pub fn can_redo(&self) -> bool {
        let state = self.core.lock_state();
        state.undo_ptr < state.local_times.len()
    }

    /// Hide the most recent visible local patch. Returns whether anything
    /// moved.
    pub async fn undo(&self) -> Result<bool, SessionError> {
        let ptr = {
            let mut state = self.core.lock_state();
            if !state.initialized {
                return Err(SessionError::NotInitialized);
            }
            if state.undo_ptr == 0 {
                return Ok(false);
            }
            state.undo_ptr -= 1;
            self.core.sync_doc(&mut state)?;
            state.undo_ptr
        };
        self.core.publish_undo_beacon(ptr).await;
        Ok(true)
    }

    /// Re-show the next hidden local patch. Returns whether anything
    /// moved.
    pub async fn redo(&self) -> Result<bool, SessionError> {
        let ptr = {
            let mut state = self.core.lock_state();
            if !state.initialized {
                return Err(SessionError::NotInitialized);
            }
            if state.undo_ptr >= state.local_times.len() {
                return Ok(false);
            }
            state.undo_ptr += 1;
            self.core.sync_doc(&mut state)?;
            state.undo_ptr
        };
        self.core.publish_undo_beacon(ptr).await;
        Ok(true)
    }

    /// Collapse the undo state. If the displayed document differs from the
    /// everything-applied value, the difference is committed as a forward
    /// edit; either way the redo region is cleared.
    pub async fn reset_undo(&self) -> Result<Option<Patch<C::Body>>, SessionError> {
        let envelope = {
            let mut state = self.core.lock_state();
            if !state.initialized {
                return Err(SessionError::NotInitialized);
            }
            let full = state.graph.current()?;
            if full.is_equal(&state.live) {
                state.undo_ptr = state.local_times.len();
                None
            } else {
                let live = state.live.clone();
                Some(self.core.commit_locked(
                    &mut state,
                    &full,
                    live,
                    &CommitOptions::default(),
                )?)
            }
        };
        if let Some(env) = &envelope {
            self.core.finish_commit(env).await;
        }
        Ok(envelope)
    }

    // ── Working copy ────────────────────────────────────────────────

    /// Stage an uncommitted draft on top of the committed document. No
    /// graph mutation, no persistence.
    pub fn set_working_copy(&self, draft: C::Doc) -> Result<(), SessionError> {
        {
            let mut state = self.core.lock_state();
            if !state.initialized {
                return Err(SessionError::NotInitialized);
            }
            state.working_copy = Some(WorkingCopy {
                base: state.committed.clone(),
                draft: draft.clone(),
            });
            state.live = draft;
        }
        self.core.emit(SessionEvent::Change);
        Ok(())
    }

    /// Drop the staged draft and revert to the committed document.
    pub fn clear_working_copy(&self) -> Result<(), SessionError> {
        {
            let mut state = self.core.lock_state();
            if !state.initialized {
                return Err(SessionError::NotInitialized);
            }
            state.working_copy = None;
            state.live = state.committed.clone();
        }
        self.core.emit(SessionEvent::Change);
        Ok(())
    }

    pub fn has_working_copy(&self) -> bool {
        self.core.lock_state().working_copy.is_some()
    }

    // ── Cursors ─────────────────────────────────────────────────────

    /// Publish this session's cursor locations and reflect them locally.
    pub async fn update_cursors(&self, locs: Value) -> Result<(), SessionError> {
        let beacon = {
            let mut state = self.core.lock_state();
            if !state.initialized {
                return Err(SessionError::NotInitialized);
            }
            let beacon = CursorBeacon::new(
                (self.core.clock)(),
                locs,
                self.core.user_id,
                self.core.doc_id.clone(),
            );
            state.cursors.merge(&beacon, &self.core.client_id);
            beacon
        };
        self.core.emit(SessionEvent::Cursors);
        self.core.publish_presence(beacon.to_payload()).await;
        Ok(())
    }

    /// Snapshot of tracked cursors, pruning entries older than `ttl_ms`
    /// (default 60 s).
    pub fn cursors(&self, ttl_ms: Option<u64>) -> Result<Vec<CursorEntry>, SessionError> {
        let mut state = self.core.lock_state();
        if !state.initialized {
            return Err(SessionError::NotInitialized);
        }
        let now = (self.core.clock)();
        Ok(state.cursors.snapshot(now, ttl_ms.unwrap_or(CURSOR_TTL_MS)))
    }

    // ── History helpers ─────────────────────────────────────────────

    pub fn heads(&self) -> Result<Vec<PatchId>, SessionError> {
        let state = self.guarded()?;
        Ok(state.graph.heads())
    }

    pub fn versions(&self, range: Option<&VersionRange>) -> Result<Vec<PatchId>, SessionError> {
        let mut state = self.guarded()?;
        Ok(state.graph.versions(range))
    }

    pub fn value(&self, query: &ValueQuery) -> Result<C::Doc, SessionError> {
        let mut state = self.guarded()?;
        Ok(state.graph.value(query)?)
    }

    pub fn history(&self, query: &HistoryQuery) -> Result<Vec<Patch<C::Body>>, SessionError> {
        let mut state = self.guarded()?;
        Ok(state.graph.history(query))
    }

    pub fn patch(&self, id: &PatchId) -> Result<Patch<C::Body>, SessionError> {
        let state = self.guarded()?;
        Ok(state.graph.patch(id)?.clone())
    }

    /// Human-readable rendering of the full history, one line per patch.
    pub fn summarize_history(&self) -> Result<String, SessionError> {
        let mut state = self.guarded()?;
        let patches = state.graph.history(&HistoryQuery {
            include_snapshots: true,
            ..Default::default()
        });
        let mut out = String::new();
        for patch in &patches {
            let rendering = match state.graph.version(&patch.id) {
                Ok(doc) => middle_truncate(&self.core.codec.to_string(&doc), 60),
                Err(_) => "<unavailable>".to_string(),
            };
            let parents = patch
                .parents
                .iter()
                .map(PatchId::as_str)
                .collect::<Vec<_>>()
                .join(",");
            let version = patch
                .version
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".to_string());
            let user = patch
                .user_id
                .map(|u| u.to_string())
                .unwrap_or_else(|| "-".to_string());
            let wall = patch
                .wall
                .map(|w| w.to_string())
                .unwrap_or_else(|| "-".to_string());
            let marker = if patch.is_snapshot { "snapshot" } else { "patch" };
            let _ = writeln!(
                out,
                "{} v{version} user={user} wall={wall} parents=[{parents}] {marker} {rendering}",
                patch.id
            );
        }
        Ok(out)
    }

    fn guarded(&self) -> Result<MutexGuard<'_, State<C>>, SessionError> {
        let state = self.core.lock_state();
        if !state.initialized {
            return Err(SessionError::NotInitialized);
        }
        Ok(state)
    }
}

fn lock_plain<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl<C: DocCodec> Core<C> {
    fn lock_state(&self) -> MutexGuard<'_, State<C>> {
        lock_plain(&self.state)
    }

    fn emit(&self, event: SessionEvent) {
        lock_plain(&self.events).retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Strictly monotone per-session id time: `max(last + 1, clock())`.
    fn next_patch_id(&self, state: &mut State<C>) -> Result<PatchId, SessionError> {
        let now = (self.clock)();
        state.last_encoded_ms = if now > state.last_encoded_ms {
            now
        } else {
            state.last_encoded_ms + 1
        };
        Ok(PatchId::encode(state.last_encoded_ms, &self.client_id)?)
    }

    /// The synchronous half of a commit: build the envelope, ingest it,
    /// advance the local patch list, resync. Persistence happens in
    /// [`Core::finish_commit`].
    fn commit_locked(
        &self,
        state: &mut State<C>,
        base: &C::Doc,
        next: C::Doc,
        options: &CommitOptions,
    ) -> Result<Patch<C::Body>, SessionError> {
        let body = self.codec.make_patch(base, &next)?;
        let id = self.next_patch_id(state)?;
        let parents = state.graph.heads();
        let version = state.graph.versions(None).len() as u64 + 1;

        let mut envelope = Patch::new(id.clone(), body, parents);
        envelope.wall = Some((self.clock)() as i64);
        envelope.user_id = self.user_id;
        envelope.version = Some(version);
        envelope.file = options.file;
        envelope.source = options.source.clone();
        envelope.meta = options.meta.clone();

        state.graph.add(vec![envelope.clone()]);
        state.committed = next;
        state.working_copy = None;
        state.local_times.truncate(state.undo_ptr);
        state.local_times.push(id);
        state.undo_ptr = state.local_times.len();
        self.sync_doc(state)?;
        Ok(envelope)
    }

    async fn finish_commit(&self, envelope: &Patch<C::Body>) {
        if let Err(err) = self.store.append(envelope.clone()).await {
            log::warn!("patch store append failed: {err}");
        }
        self.publish_presence(json!({
            "userId": self.user_id,
            "time": (self.clock)(),
        }))
        .await;
    }

    fn apply_remote(&self, envelope: Patch<C::Body>) -> Result<(), SessionError> {
        let id = envelope.id.clone();
        {
            let mut state = self.lock_state();
            if let Ok(time_ms) = id.time_ms() {
                state.last_encoded_ms = state.last_encoded_ms.max(time_ms);
            }
            state.graph.add(vec![envelope]);
            self.sync_doc(&mut state)?;
        }
        self.emit(SessionEvent::Patch { id });
        Ok(())
    }

    /// Recompute the live document, rebase any working copy, and mirror
    /// the result to the file queue.
    fn sync_doc(&self, state: &mut State<C>) -> Result<(), SessionError> {
        let hidden = state.local_times[state.undo_ptr..].to_vec();
        let base_value = state.graph.value(&ValueQuery::without(hidden))?;

        let live = match state.working_copy.take() {
            Some(wc) => {
                let rebased = self.codec.rebase_draft(&wc.base, &wc.draft, &base_value)?;
                state.working_copy = Some(WorkingCopy {
                    base: base_value.clone(),
                    draft: rebased.clone(),
                });
                rebased
            }
            None => base_value.clone(),
        };
        state.committed = base_value;

        let changed = !live.is_equal(&state.live);
        state.live = live;

        if self.file.is_some() {
            let text = self.codec.to_string(&state.live);
            self.queue_file_write(state, text);
        }
        if changed {
            self.emit(SessionEvent::Change);
        }
        Ok(())
    }

    // ── File mirror queue ───────────────────────────────────────────

    /// Record the desired file content and start a flush if none is in
    /// flight. At most one write is ever outstanding; newer contents
    /// coalesce into `dirty` and only the latest is written next.
    fn queue_file_write(&self, state: &mut State<C>, text: String) {
        let Some(file) = self.file.clone() else {
            return;
        };
        if state.dirty.is_none() && state.persisted.as_deref() == Some(text.as_str()) {
            return;
        }
        state.dirty = Some(text);
        if state.write_in_flight {
            return;
        }
        let Some(core) = self.self_weak.upgrade() else {
            return;
        };
        state.write_in_flight = true;
        let content = state.dirty.take().unwrap_or_default();
        let base = state.persisted.clone();
        state.suppress_file_changes += 1;

        tokio::spawn(async move {
            core.flush_file_queue(file, content, base).await;
        });
    }

    async fn flush_file_queue(
        self: Arc<Self>,
        file: Arc<dyn FileAdapter>,
        mut content: String,
        mut base: Option<String>,
    ) {
        loop {
            let result = file.write(&content, base.as_deref()).await;
            let mut state = self.lock_state();
            state.suppress_file_changes = state.suppress_file_changes.saturating_sub(1);
            match result {
                Ok(()) => {
                    state.persisted = Some(content.clone());
                }
                Err(err) => {
                    self.emit(SessionEvent::FileError(err.to_string()));
                }
            }
            match state.dirty.take() {
                Some(next) => {
                    state.suppress_file_changes += 1;
                    base = state.persisted.clone();
                    content = next;
                }
                None => {
                    state.write_in_flight = false;
                    return;
                }
            }
        }
    }

    /// External modification observed by the file watcher.
    async fn handle_file_change(&self) {
        let Some(file) = self.file.clone() else {
            return;
        };
        let content = match file.read().await {
            Ok(content) => content,
            Err(err) => {
                log::debug!("ignoring unreadable file change: {err}");
                return;
            }
        };

        let external = {
            let mut state = self.lock_state();
            if state.suppress_file_changes > 0 {
                state.suppress_file_changes -= 1;
            }
            // Self-induced or redundant events carry exactly what we last
            // persisted; everything else is a real external edit.
            if state.persisted.as_deref() == Some(content.as_str()) {
                None
            } else {
                let doc = self.codec.from_string(&content);
                state.persisted = Some(content);
                if doc.is_equal(&state.live) {
                    None
                } else {
                    Some(doc)
                }
            }
        };
        let Some(doc) = external else { return };

        let envelope = {
            let mut state = self.lock_state();
            if !state.initialized {
                return;
            }
            let base = match &state.working_copy {
                Some(wc) => wc.base.clone(),
                None => state.committed.clone(),
            };
            let options = CommitOptions {
                file: true,
                source: Some("file".to_string()),
                meta: None,
            };
            match self.commit_locked(&mut state, &base, doc, &options) {
                Ok(envelope) => envelope,
                Err(err) => {
                    log::warn!("failed to ingest external file change: {err}");
                    return;
                }
            }
        };
        self.finish_commit(&envelope).await;
    }

    // ── Presence ────────────────────────────────────────────────────

    fn handle_presence(&self, update: PresenceUpdate) {
        match &update.payload {
            Some(payload) => {
                if let Some(beacon) = CursorBeacon::from_payload(payload) {
                    if beacon.doc_id == self.doc_id {
                        {
                            let mut state = self.lock_state();
                            state.cursors.merge(&beacon, &update.client_id);
                        }
                        self.emit(SessionEvent::Cursors);
                        return;
                    }
                }
                self.emit(SessionEvent::Presence(update));
            }
            None => {
                let removed = self.lock_state().cursors.remove_client(&update.client_id);
                if removed {
                    self.emit(SessionEvent::Cursors);
                }
                self.emit(SessionEvent::Presence(update));
            }
        }
    }

    async fn publish_presence(&self, payload: Value) {
        if let Some(presence) = &self.presence {
            let result = presence
                .publish(PresenceUpdate {
                    client_id: self.client_id.clone(),
                    payload: Some(payload),
                })
                .await;
            if let Err(err) = result {
                log::debug!("presence publish failed: {err}");
            }
        }
    }

    async fn publish_undo_beacon(&self, undo_ptr: usize) {
        self.publish_presence(json!({
            "userId": self.user_id,
            "undoPtr": undo_ptr,
        }))
        .await;
    }
}

/// Shorten `text` to roughly `max` characters, eliding the middle.
fn middle_truncate(text: &str, max: usize) -> String {
    let flat = text.replace('\n', "\\n");
    let count = flat.chars().count();
    if count <= max {
        return flat;
    }
    let keep = max.saturating_sub(1) / 2;
    let head: String = flat.chars().take(keep).collect();
    let tail: String = flat
        .chars()
        .skip(count - keep)
        .collect();
    format!("{head}…{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryPatchStore;
    use vellum_core::{TextCodec, TextPatch};

    fn fixed_clock(ms: u64) -> Clock {
        Arc::new(move || ms)
    }

    fn text_session(clock_ms: u64) -> Session<TextCodec> {
        let store: Arc<MemoryPatchStore<TextPatch>> = Arc::new(MemoryPatchStore::new());
        let mut config = SessionConfig::new(TextCodec::new());
        config.client_id = Some("session-test".to_string());
        config.clock = Some(fixed_clock(clock_ms));
        Session::new(config, store, None, None)
    }

    #[tokio::test]
    async fn test_requires_init() {
        let session = text_session(1000);
        assert!(matches!(
            session.get_document(),
            Err(SessionError::NotInitialized)
        ));
        assert!(matches!(
            session.commit("x".to_string()).await,
            Err(SessionError::NotInitialized)
        ));
        assert!(matches!(session.heads(), Err(SessionError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_commit_linear_history() {
        let session = text_session(1000);
        session.init().await.unwrap();

        let first = session.commit("hello".to_string()).await.unwrap();
        let second = session.commit("hello world".to_string()).await.unwrap();

        assert_eq!(session.get_document().unwrap(), "hello world");
        assert_eq!(session.heads().unwrap(), vec![second.id.clone()]);
        assert_eq!(second.parents, vec![first.id]);
        assert_eq!(first.version, Some(1));
        assert_eq!(second.version, Some(2));
    }

    #[tokio::test]
    async fn test_commit_ids_monotone_under_frozen_clock() {
        let session = text_session(5000);
        session.init().await.unwrap();

        let a = session.commit("a".to_string()).await.unwrap();
        let b = session.commit("ab".to_string()).await.unwrap();
        let c = session.commit("abc".to_string()).await.unwrap();
        assert!(a.id < b.id);
        assert!(b.id < c.id);
        assert_eq!(b.id.decode().unwrap().time_ms, 5001);
        assert_eq!(c.id.decode().unwrap().time_ms, 5002);
    }

    #[tokio::test]
    async fn test_commit_observed_before_append_resolves() {
        // Local state reflects the commit synchronously; the store append
        // completes inside commit() but the graph already held the patch.
        let session = text_session(100);
        session.init().await.unwrap();
        let envelope = session.commit("now".to_string()).await.unwrap();
        assert_eq!(session.patch(&envelope.id).unwrap().id, envelope.id);
    }

    #[tokio::test]
    async fn test_apply_remote_updates_document() {
        let session = text_session(1000);
        session.init().await.unwrap();

        let body = vellum_core::TextDiff.make("", "from afar");
        let id = PatchId::encode(2000, "peer").unwrap();
        session
            .apply_remote(Patch::new(id, body, Vec::new()))
            .unwrap();
        assert_eq!(session.get_document().unwrap(), "from afar");
    }

    #[tokio::test]
    async fn test_remote_time_advances_id_floor() {
        let session = text_session(1000);
        session.init().await.unwrap();

        let body = vellum_core::TextDiff.make("", "x");
        let id = PatchId::encode(9000, "peer").unwrap();
        session
            .apply_remote(Patch::new(id, body, Vec::new()))
            .unwrap();

        // Local clock is stuck at 1000; the next id must still sort after
        // the remote one.
        let envelope = session.commit("xy".to_string()).await.unwrap();
        assert_eq!(envelope.id.decode().unwrap().time_ms, 9001);
    }

    #[tokio::test]
    async fn test_undo_redo() {
        let session = text_session(1000);
        session.init().await.unwrap();
        session.commit("a".to_string()).await.unwrap();
        session.commit("ab".to_string()).await.unwrap();

        assert!(session.undo().await.unwrap());
        assert_eq!(session.get_document().unwrap(), "a");
        assert!(session.undo().await.unwrap());
        assert_eq!(session.get_document().unwrap(), "");
        assert!(!session.undo().await.unwrap());

        assert!(session.redo().await.unwrap());
        assert_eq!(session.get_document().unwrap(), "a");
        assert!(session.redo().await.unwrap());
        assert_eq!(session.get_document().unwrap(), "ab");
        assert!(!session.redo().await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_truncates_redo_region() {
        let session = text_session(1000);
        session.init().await.unwrap();
        session.commit("a".to_string()).await.unwrap();
        session.commit("ab".to_string()).await.unwrap();

        session.undo().await.unwrap();
        session.commit("aX".to_string()).await.unwrap();

        // The hidden tail rejoined the replay and the redo region is gone;
        // the displayed doc is the full graph value again.
        assert!(!session.redo().await.unwrap());
        let full = session.value(&ValueQuery::default()).unwrap();
        assert_eq!(session.get_document().unwrap(), full);
    }

    #[tokio::test]
    async fn test_reset_undo_preserves_undone_state() {
        let session = text_session(1000);
        session.init().await.unwrap();
        session.commit("a".to_string()).await.unwrap();
        session.commit("ab".to_string()).await.unwrap();
        session.undo().await.unwrap();

        let envelope = session.reset_undo().await.unwrap();
        assert!(envelope.is_some());
        assert_eq!(session.get_document().unwrap(), "a");
        // The undone state is now a forward edit; redo is gone.
        assert!(!session.redo().await.unwrap());
        // All three patches replay to the displayed doc.
        assert_eq!(session.versions(None).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_reset_undo_noop_when_clean() {
        let session = text_session(1000);
        session.init().await.unwrap();
        session.commit("a".to_string()).await.unwrap();
        let envelope = session.reset_undo().await.unwrap();
        assert!(envelope.is_none());
        assert_eq!(session.versions(None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_working_copy_set_and_clear() {
        let session = text_session(1000);
        session.init().await.unwrap();
        session.commit("committed".to_string()).await.unwrap();

        session.set_working_copy("draft".to_string()).unwrap();
        assert!(session.has_working_copy());
        assert_eq!(session.get_document().unwrap(), "draft");

        session.clear_working_copy().unwrap();
        assert!(!session.has_working_copy());
        assert_eq!(session.get_document().unwrap(), "committed");
    }

    #[tokio::test]
    async fn test_commit_clears_working_copy() {
        let session = text_session(1000);
        session.init().await.unwrap();
        session.commit("base".to_string()).await.unwrap();
        session.set_working_copy("base draft".to_string()).unwrap();

        // Commit diffs against the staged base, not the draft.
        session.commit("base final".to_string()).await.unwrap();
        assert!(!session.has_working_copy());
        assert_eq!(session.get_document().unwrap(), "base final");
    }

    #[tokio::test]
    async fn test_working_copy_rebases_across_remote() {
        let session = text_session(1000);
        session.init().await.unwrap();
        session.commit("hello".to_string()).await.unwrap();
        session.set_working_copy("hello local".to_string()).unwrap();

        let body = vellum_core::TextDiff.make("hello", "REMOTE hello");
        let id = PatchId::encode(50_000, "peer").unwrap();
        let heads = {
            // The remote patch descends from our committed head.
            session.heads().unwrap()
        };
        session
            .apply_remote(Patch::new(id, body, heads))
            .unwrap();

        assert_eq!(session.get_document().unwrap(), "REMOTE hello local");
        assert!(session.has_working_copy());
    }

    #[tokio::test]
    async fn test_summarize_history() {
        let session = text_session(1000);
        session.init().await.unwrap();
        session.commit("hello".to_string()).await.unwrap();
        session.commit("hello world".to_string()).await.unwrap();

        let summary = session.summarize_history().unwrap();
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("v1"));
        assert!(lines[1].contains("v2"));
        assert!(lines[1].contains("hello world"));
        assert!(lines[1].contains("patch"));
    }

    #[tokio::test]
    async fn test_events_emitted_on_change_and_patch() {
        let session = text_session(1000);
        session.init().await.unwrap();
        let mut events = session.subscribe_events();

        session.commit("x".to_string()).await.unwrap();
        assert!(matches!(events.recv().await, Some(SessionEvent::Change)));

        let body = vellum_core::TextDiff.make("x", "xy");
        let id = PatchId::encode(77_000, "peer").unwrap();
        let heads = session.heads().unwrap();
        session.apply_remote(Patch::new(id, body, heads)).unwrap();

        let mut saw_patch = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::Patch { .. }) {
                saw_patch = true;
            }
        }
        assert!(saw_patch);
    }

    #[test]
    fn test_middle_truncate() {
        assert_eq!(middle_truncate("short", 60), "short");
        let long = "x".repeat(100);
        let out = middle_truncate(&long, 21);
        assert!(out.chars().count() <= 21);
        assert!(out.contains('…'));
        assert_eq!(middle_truncate("a\nb", 60), "a\\nb");
    }
}
