//! # vellum-collab — session orchestration for vellum patch graphs
//!
//! Connects one participant to a shared document: a [`Session`] owns a
//! patch graph from `vellum-core` and coordinates local commits, remote
//! ingestion, undo/redo, working-copy rebase, a serialized file mirror,
//! and cursor presence — all through pluggable adapters.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   append/subscribe   ┌──────────────┐
//! │   Session   │ ◄──────────────────► │  PatchStore  │
//! │ (per peer)  │                      │ (pluggable)  │
//! └──┬───┬───┬──┘                      └──────────────┘
//!    │   │   └── publish/subscribe ──► PresenceAdapter
//!    │   └────── read/write/watch ──► FileAdapter
//!    ▼
//! ┌─────────────┐
//! │ PatchGraph  │  (vellum-core)
//! └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`] — orchestration, events, undo/redo, file queue
//! - [`store`] — patch store contract + in-memory NDJSON reference store
//! - [`file`] — file mirror contract + in-memory reference adapter
//! - [`presence`] — presence contract, cursor beacons, cursor bookkeeping

pub mod file;
pub mod presence;
pub mod session;
pub mod store;

// Re-exports for convenience
pub use file::{FileAdapter, FileError, MemoryFileAdapter, RecordedWrite};
pub use presence::{
    CursorBeacon, CursorEntry, CursorRoom, MemoryPresenceAdapter, PresenceAdapter, PresenceError,
    PresenceUpdate, CURSOR_TTL_MS,
};
pub use session::{
    Clock, CommitOptions, Session, SessionConfig, SessionError, SessionEvent,
};
pub use store::{InitialLoad, MemoryPatchStore, PatchStore, StoreError};
