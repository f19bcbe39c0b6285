//! # vellum-core — patch-DAG engine for collaborative documents
//!
//! Maintains a content-addressed DAG of patches with ancestry and computes
//! any document state as the deterministic replay of reachable patches in
//! ascending id order. No per-character CRDT metadata: convergence comes
//! from replay order, snapshot floors, and codec-level structural merge.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   value / add    ┌──────────────┐
//! │  PatchGraph │ ◄───────────────►│   Session    │ (vellum-collab)
//! │ DAG + caches│                  │ orchestration│
//! └──────┬──────┘                  └──────────────┘
//!        │ apply_patch_batch / make_patch
//!        ▼
//! ┌──────────────┐     ┌───────────────┐
//! │  DocCodec    │     │   textdiff    │
//! │ text | table │ ──► │ hunked patches│
//! └──────────────┘     └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`patch_id`] — lexicographically-orderable ids (`<time36>_<client>`)
//! - [`patch`] — the wire/persistence envelope
//! - [`textdiff`] — the string diff/patch service
//! - [`merge`] — deterministic three-way text merge
//! - [`codec`] — the document codec seam (text and table families)
//! - [`graph`] — the DAG, replay, and caches

pub mod codec;
pub mod error;
pub mod graph;
pub mod merge;
pub mod patch;
pub mod patch_id;
pub mod textdiff;

// Re-exports for convenience
pub use codec::table::{Record, TableBody, TableCodec, TableConfig, TableDoc, TableOp};
pub use codec::text::TextCodec;
pub use codec::{DocCodec, Document};
pub use error::{CodecError, GraphError, IdError};
pub use graph::{
    AncestorQuery, ChainQuery, HistoryQuery, PatchGraph, ValueQuery, VersionRange,
    CHAIN_LIMIT, FILE_DEDUP_MS,
};
pub use merge::three_way;
pub use patch::{Patch, SeqInfo};
pub use patch_id::{client_token, DecodedId, PatchId};
pub use textdiff::{TextDiff, TextPatch};
