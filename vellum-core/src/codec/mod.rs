//! Document codecs: the polymorphic interface the patch graph consumes.
//!
//! A codec owns three things: a document representation, a delta ("patch
//! body") representation, and the algebra between them. The graph never
//! inspects bodies — it stores them, orders them, and hands them back to
//! the codec for application.
//!
//! Two first-class families:
//! - [`text::TextCodec`] — free-form strings, diff-patched.
//! - [`table::TableCodec`] — ordered JSONL records with primary-key
//!   indexes and optional diff-encoded string columns.

use std::fmt::Debug;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CodecError;

pub mod table;
pub mod text;

/// A materialized document value. Instances are immutable after
/// construction; every new state is a new instance.
pub trait Document: Clone + PartialEq + Send + Sync + 'static {
    /// Number of units in the document (bytes for text, records for
    /// tables).
    fn count(&self) -> usize;

    /// Cheap upper bound on in-memory size, in bytes. Drives cache
    /// eviction only — never correctness.
    fn size_hint(&self) -> usize {
        self.count()
    }

    /// Semantic equality.
    fn is_equal(&self, other: &Self) -> bool {
        self == other
    }
}

/// Codec for one document family.
pub trait DocCodec: Clone + Send + Sync + 'static {
    type Doc: Document;
    type Body: Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Parse a document from its serialized string form.
    fn from_string(&self, text: &str) -> Self::Doc;

    /// Serialize a document to its canonical string form.
    fn to_string(&self, doc: &Self::Doc) -> String;

    /// Apply one delta, producing a new document.
    fn apply_patch(&self, doc: &Self::Doc, body: &Self::Body) -> Result<Self::Doc, CodecError>;

    /// Apply a run of deltas as one logical transaction.
    ///
    /// The default iterates [`DocCodec::apply_patch`]; codecs override this
    /// when a single pass over shared working state is cheaper.
    fn apply_patch_batch(
        &self,
        doc: &Self::Doc,
        bodies: &[&Self::Body],
    ) -> Result<Self::Doc, CodecError> {
        let mut current = doc.clone();
        for body in bodies {
            current = self.apply_patch(&current, body)?;
        }
        Ok(current)
    }

    /// Compute the delta transforming `from` into `to`.
    fn make_patch(&self, from: &Self::Doc, to: &Self::Doc) -> Result<Self::Body, CodecError>;

    /// Rebase a staged draft onto an advanced base.
    ///
    /// Default: apply the `base → draft` delta onto `updated_base`. The
    /// text codec overrides this with a three-way string merge.
    fn rebase_draft(
        &self,
        base: &Self::Doc,
        draft: &Self::Doc,
        updated_base: &Self::Doc,
    ) -> Result<Self::Doc, CodecError> {
        if draft.is_equal(base) || draft.is_equal(updated_base) {
            return Ok(updated_base.clone());
        }
        let delta = self.make_patch(base, draft)?;
        self.apply_patch(updated_base, &delta)
    }
}
