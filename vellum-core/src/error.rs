//! Error types for the patch graph and its codecs.
//!
//! Data-shape and protocol errors are fatal to the caller and surface as
//! `Err`. Dirty text-patch application is *not* an error: the text codec
//! absorbs it as a no-op (see [`crate::codec::text`]).

use thiserror::Error;

use crate::patch_id::PatchId;

/// Errors from encoding or decoding a [`PatchId`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// Input shorter than the fixed time prefix plus delimiter plus token.
    #[error("patch id too short: {len} chars (need at least {min})")]
    InvalidLength { len: usize, min: usize },

    /// Character 12 was not the `_` delimiter.
    #[error("patch id missing `_` delimiter after time prefix")]
    MissingDelimiter,

    /// Time component out of range or not base-36.
    #[error("invalid patch id time: {0}")]
    InvalidTime(String),

    /// Encode called with an empty client token.
    #[error("client token must not be empty")]
    EmptyClient,
}

/// Errors from document codecs.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A `where` object referenced a column that is not a primary key.
    #[error("`where` uses non-primary-key field `{0}`")]
    InvalidWhere(String),

    /// A string-column value was neither a string nor an encoded patch array.
    #[error("field `{field}` must be a string or an encoded string patch")]
    InvalidFieldType { field: String },

    /// A patch body failed structural validation.
    #[error("corrupt patch body: {0}")]
    CorruptPatchBody(String),

    /// Codec misconfiguration (e.g. a table codec without primary keys).
    #[error("codec configuration: {0}")]
    Config(String),
}

/// Errors from graph topology and value computation.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Lookup of an id that is not in the graph.
    #[error("unknown patch id `{0}`")]
    UnknownPatchId(PatchId),

    /// Traversal reached a parent that is not in the graph.
    #[error("patch `{child}` references missing parent `{parent}`")]
    ParentMissing { child: PatchId, parent: PatchId },

    /// Root-ward path enumeration exceeded its limit.
    #[error("parent chain enumeration exceeded limit of {limit}")]
    ChainLimitExceeded { limit: usize },

    #[error(transparent)]
    Codec(#[from] CodecError),
}
