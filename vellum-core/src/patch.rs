//! The patch envelope — one node of the DAG.
//!
//! Wire format (newline-delimited JSON in the reference store):
//! ```text
//! {"id":"<time36>_<client>","parents":[…],"body":…,"wall":…,"userId":…,
//!  "version":…,"isSnapshot":…,"snapshotText":…,"file":…,"meta":…,
//!  "source":…,"seqInfo":{"seq":…,"prevSeq":…}}
//! ```
//! Everything but `id` and `parents` is optional. `body` is the codec's
//! own delta type — opaque to the graph, understood only by the active
//! codec.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::patch_id::PatchId;

/// Store-assigned sequence bookkeeping, carried opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeqInfo {
    pub seq: u64,
    pub prev_seq: u64,
}

/// One node of the patch DAG.
///
/// Immutable after insertion into a graph, except that snapshot data
/// arriving later on the same id is attached to the existing node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch<B> {
    pub id: PatchId,

    /// Ids of the direct parents; empty for a root.
    #[serde(default = "Vec::new")]
    pub parents: Vec<PatchId>,

    /// The codec-specific delta. Absent on pure snapshot nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<B>,

    /// Advisory wall-clock milliseconds at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wall: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u32>,

    /// Monotone per-appender display version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,

    /// Whether this node carries the full serialized document.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_snapshot: bool,

    /// The document's string form; present iff `is_snapshot`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_text: Option<String>,

    /// Whether this patch originated from a file mirror.
    #[serde(default, skip_serializing_if = "is_false")]
    pub file: bool,

    /// Freeform application metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq_info: Option<SeqInfo>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl<B> Patch<B> {
    /// A plain delta patch.
    pub fn new(id: PatchId, body: B, parents: Vec<PatchId>) -> Self {
        Self {
            id,
            parents,
            body: Some(body),
            wall: None,
            user_id: None,
            version: None,
            is_snapshot: false,
            snapshot_text: None,
            file: false,
            meta: None,
            source: None,
            seq_info: None,
        }
    }

    /// A pure snapshot node: full document text, no delta.
    pub fn snapshot(id: PatchId, text: impl Into<String>, parents: Vec<PatchId>) -> Self {
        Self {
            id,
            parents,
            body: None,
            wall: None,
            user_id: None,
            version: None,
            is_snapshot: true,
            snapshot_text: Some(text.into()),
            file: false,
            meta: None,
            source: None,
            seq_info: None,
        }
    }

    pub fn with_wall(mut self, wall: i64) -> Self {
        self.wall = Some(wall);
        self
    }

    pub fn with_user(mut self, user_id: u32) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_file_origin(mut self) -> Self {
        self.file = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_json_shape() {
        let id = PatchId::encode(1000, "client1").unwrap();
        let patch = Patch::new(id, vec![1, 2, 3], Vec::new()).with_wall(1000);

        let json = serde_json::to_value(&patch).unwrap();
        let obj = json.as_object().unwrap();
        assert!(obj.contains_key("id"));
        assert!(obj.contains_key("parents"));
        assert!(obj.contains_key("body"));
        assert!(obj.contains_key("wall"));
        // optional fields absent, not null
        assert!(!obj.contains_key("userId"));
        assert!(!obj.contains_key("isSnapshot"));
        assert!(!obj.contains_key("snapshotText"));
        assert!(!obj.contains_key("file"));
    }

    #[test]
    fn test_envelope_roundtrip() {
        let id = PatchId::encode(2000, "client2").unwrap();
        let parent = PatchId::encode(1000, "client1").unwrap();
        let mut patch = Patch::new(id, vec![9u8], vec![parent]).with_user(7);
        patch.seq_info = Some(SeqInfo { seq: 5, prev_seq: 4 });

        let text = serde_json::to_string(&patch).unwrap();
        let back: Patch<Vec<u8>> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, patch);
    }

    #[test]
    fn test_snapshot_constructor() {
        let id = PatchId::encode(3000, "c").unwrap();
        let snap: Patch<Vec<u8>> = Patch::snapshot(id, "hello", Vec::new());
        assert!(snap.is_snapshot);
        assert_eq!(snap.snapshot_text.as_deref(), Some("hello"));
        assert!(snap.body.is_none());
    }
}
