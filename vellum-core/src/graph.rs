//! The patch DAG: topology, deterministic replay, and bounded caches.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 PatchGraph                    │
//! │                                              │
//! │  patches:  id → Patch          (append-only) │
//! │  children: parent → {child}    (reverse idx) │
//! │                                              │
//! │  value(heads) = replay of reachable patches  │
//! │  in ascending id order, seeded from the      │
//! │  latest reachable snapshot                   │
//! │                                              │
//! │  caches: value (LRU, entry+byte bounded)     │
//! │          reachability (single head)          │
//! │          merge (sorted multi-head key)       │
//! │          versions (sorted id list)           │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Convergence is by construction: any two graphs holding the same set of
//! patches replay them in the same id order and compute identical
//! documents, regardless of insertion order. The graph tolerates
//! redelivery (ids dedup) and never fetches — every ancestor of a
//! requested head must already be present.

use std::collections::BTreeSet;
use std::sync::Arc;

use lru::LruCache;
use rustc_hash::FxHashMap;

use crate::codec::{DocCodec, Document};
use crate::error::GraphError;
use crate::patch::Patch;
use crate::patch_id::PatchId;

/// Two file-origin patches with identical bodies within this window are
/// replayed as one.
pub const FILE_DEDUP_MS: u64 = 3000;

/// Default bound on cached document values, by entry count.
pub const VALUE_CACHE_ENTRIES: usize = 100;

/// Default bound on cached document values, by estimated bytes.
pub const VALUE_CACHE_BYTES: usize = 10 * 1024 * 1024;

/// Default cap on enumerated parent chains.
pub const CHAIN_LIMIT: usize = 1000;

/// Selects the document to compute: a specific patch, or the current
/// heads; `without` hides patches from the replay.
#[derive(Debug, Clone, Default)]
pub struct ValueQuery {
    pub time: Option<PatchId>,
    pub without: Vec<PatchId>,
}

impl ValueQuery {
    pub fn at(time: PatchId) -> Self {
        Self {
            time: Some(time),
            without: Vec::new(),
        }
    }

    pub fn without(ids: Vec<PatchId>) -> Self {
        Self {
            time: None,
            without: ids,
        }
    }
}

/// Options for [`PatchGraph::ancestors`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AncestorQuery {
    pub include_self: bool,
    pub stop_at_snapshots: bool,
}

/// Options for [`PatchGraph::parent_chains`].
#[derive(Debug, Clone, Copy)]
pub struct ChainQuery {
    pub stop_at_snapshots: bool,
    pub limit: usize,
}

impl Default for ChainQuery {
    fn default() -> Self {
        Self {
            stop_at_snapshots: false,
            limit: CHAIN_LIMIT,
        }
    }
}

/// Inclusive id bounds.
#[derive(Debug, Clone, Default)]
pub struct VersionRange {
    pub start: Option<PatchId>,
    pub end: Option<PatchId>,
}

impl VersionRange {
    fn contains(&self, id: &PatchId) -> bool {
        if let Some(start) = &self.start {
            if id < start {
                return false;
            }
        }
        if let Some(end) = &self.end {
            if id > end {
                return false;
            }
        }
        true
    }
}

/// Options for [`PatchGraph::history`].
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub range: VersionRange,
    pub include_snapshots: bool,
}

struct CacheEntry<D> {
    doc: D,
    /// Replay-list length that produced `doc`; the prefix-reuse key.
    applied: usize,
    size: usize,
}

/// The DAG plus its caches. Exclusively owned by one session.
pub struct PatchGraph<C: DocCodec> {
    codec: C,
    patches: FxHashMap<PatchId, Patch<C::Body>>,
    children: FxHashMap<PatchId, BTreeSet<PatchId>>,

    value_cache: LruCache<PatchId, CacheEntry<C::Doc>>,
    value_cache_bytes: usize,
    value_entry_limit: usize,
    value_byte_limit: usize,

    reach_cache: FxHashMap<PatchId, Arc<Vec<PatchId>>>,
    merge_cache: FxHashMap<String, C::Doc>,
    versions_cache: Option<Arc<Vec<PatchId>>>,
}

impl<C: DocCodec> PatchGraph<C> {
    pub fn new(codec: C) -> Self {
        Self::with_cache_limits(codec, VALUE_CACHE_ENTRIES, VALUE_CACHE_BYTES)
    }

    pub fn with_cache_limits(codec: C, entries: usize, bytes: usize) -> Self {
        Self {
            codec,
            patches: FxHashMap::default(),
            children: FxHashMap::default(),
            value_cache: LruCache::unbounded(),
            value_cache_bytes: 0,
            value_entry_limit: entries.max(1),
            value_byte_limit: bytes,
            reach_cache: FxHashMap::default(),
            merge_cache: FxHashMap::default(),
            versions_cache: None,
        }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Insert patches. Re-delivered ids are no-ops, except that snapshot
    /// data arriving on an id that lacks it is attached to the existing
    /// node. Any mutation invalidates the reachability, merge, and
    /// versions caches; attaching a snapshot additionally drops cached
    /// values, since an existing node's meaning changed.
    pub fn add(&mut self, patches: impl IntoIterator<Item = Patch<C::Body>>) {
        let mut inserted = false;
        let mut snapshot_attached = false;

        for patch in patches {
            if let Some(existing) = self.patches.get_mut(&patch.id) {
                if patch.is_snapshot && !existing.is_snapshot {
                    existing.is_snapshot = true;
                    existing.snapshot_text = patch.snapshot_text;
                    snapshot_attached = true;
                }
                continue;
            }
            for parent in &patch.parents {
                self.children
                    .entry(parent.clone())
                    .or_default()
                    .insert(patch.id.clone());
            }
            self.patches.insert(patch.id.clone(), patch);
            inserted = true;
        }

        if inserted || snapshot_attached {
            self.reach_cache.clear();
            self.merge_cache.clear();
            self.versions_cache = None;
        }
        if snapshot_attached {
            self.value_cache.clear();
            self.value_cache_bytes = 0;
        }
    }

    /// Ids with no descendants, ascending.
    pub fn heads(&self) -> Vec<PatchId> {
        let mut heads: Vec<PatchId> = self
            .patches
            .keys()
            .filter(|id| self.children.get(*id).map_or(true, BTreeSet::is_empty))
            .cloned()
            .collect();
        heads.sort();
        heads
    }

    pub fn patch(&self, id: &PatchId) -> Result<&Patch<C::Body>, GraphError> {
        self.patches
            .get(id)
            .ok_or_else(|| GraphError::UnknownPatchId(id.clone()))
    }

    pub fn contains(&self, id: &PatchId) -> bool {
        self.patches.contains_key(id)
    }

    pub fn parents(&self, id: &PatchId) -> Result<Vec<PatchId>, GraphError> {
        Ok(self.patch(id)?.parents.clone())
    }

    /// Every id reachable root-ward from `ids`, ascending.
    pub fn ancestors(
        &self,
        ids: &[PatchId],
        query: AncestorQuery,
    ) -> Result<Vec<PatchId>, GraphError> {
        let mut visited: BTreeSet<PatchId> = BTreeSet::new();
        let mut stack: Vec<PatchId> = Vec::new();
        for id in ids {
            let patch = self.patch(id)?;
            if query.include_self {
                stack.push(id.clone());
            } else if !(query.stop_at_snapshots && patch.is_snapshot) {
                for parent in &patch.parents {
                    if !self.patches.contains_key(parent) {
                        return Err(GraphError::ParentMissing {
                            child: id.clone(),
                            parent: parent.clone(),
                        });
                    }
                    stack.push(parent.clone());
                }
            }
        }
        while let Some(id) = stack.pop() {
            if !visited.insert(id.clone()) {
                continue;
            }
            let patch = self.patch(&id)?;
            if query.stop_at_snapshots && patch.is_snapshot {
                continue;
            }
            for parent in &patch.parents {
                if !self.patches.contains_key(parent) {
                    return Err(GraphError::ParentMissing {
                        child: id.clone(),
                        parent: parent.clone(),
                    });
                }
                if !visited.contains(parent) {
                    stack.push(parent.clone());
                }
            }
        }
        Ok(visited.into_iter().collect())
    }

    /// Enumerate root-ward paths from `id`. A path terminates at a node
    /// with no parents or, when `stop_at_snapshots`, at a snapshot.
    pub fn parent_chains(
        &self,
        id: &PatchId,
        query: ChainQuery,
    ) -> Result<Vec<Vec<PatchId>>, GraphError> {
        self.patch(id)?;
        let mut complete: Vec<Vec<PatchId>> = Vec::new();
        let mut partial: Vec<Vec<PatchId>> = vec![vec![id.clone()]];

        while let Some(chain) = partial.pop() {
            if complete.len() + partial.len() >= query.limit {
                return Err(GraphError::ChainLimitExceeded { limit: query.limit });
            }
            let tip = chain.last().cloned().unwrap_or_else(|| id.clone());
            let patch = self.patch(&tip)?;
            let terminal =
                patch.parents.is_empty() || (query.stop_at_snapshots && patch.is_snapshot);
            if terminal {
                complete.push(chain);
                continue;
            }
            for parent in &patch.parents {
                if !self.patches.contains_key(parent) {
                    return Err(GraphError::ParentMissing {
                        child: tip.clone(),
                        parent: parent.clone(),
                    });
                }
                let mut next = chain.clone();
                next.push(parent.clone());
                partial.push(next);
            }
        }
        Ok(complete)
    }

    /// All known ids, ascending, optionally bounded.
    pub fn versions(&mut self, range: Option<&VersionRange>) -> Vec<PatchId> {
        if self.versions_cache.is_none() {
            let mut ids: Vec<PatchId> = self.patches.keys().cloned().collect();
            ids.sort();
            self.versions_cache = Some(Arc::new(ids));
        }
        let all = match &self.versions_cache {
            Some(ids) => Arc::clone(ids),
            None => Arc::new(Vec::new()),
        };
        match range {
            None => (*all).clone(),
            Some(range) => all.iter().filter(|id| range.contains(id)).cloned().collect(),
        }
    }

    pub fn versions_in_range(&mut self, range: &VersionRange) -> Vec<PatchId> {
        self.versions(Some(range))
    }

    /// Patches in ascending order, filtered.
    pub fn history(&mut self, query: &HistoryQuery) -> Vec<Patch<C::Body>> {
        self.versions(Some(&query.range))
            .into_iter()
            .filter_map(|id| self.patches.get(&id))
            .filter(|p| query.include_snapshots || !p.is_snapshot)
            .cloned()
            .collect()
    }

    /// The document as of a specific patch.
    pub fn version(&mut self, id: &PatchId) -> Result<C::Doc, GraphError> {
        self.value(&ValueQuery::at(id.clone()))
    }

    /// The current document across all heads.
    pub fn current(&mut self) -> Result<C::Doc, GraphError> {
        self.value(&ValueQuery::default())
    }

    /// Compute the document for a value query.
    pub fn value(&mut self, query: &ValueQuery) -> Result<C::Doc, GraphError> {
        let heads: Vec<PatchId> = match &query.time {
            Some(id) => {
                self.patch(id)?;
                vec![id.clone()]
            }
            None => self.heads(),
        };
        if heads.is_empty() {
            return Ok(self.codec.from_string(""));
        }
        let no_exclusions = query.without.is_empty();
        let single_head = heads.len() == 1;

        let merge_key = (!single_head && no_exclusions).then(|| {
            heads
                .iter()
                .map(PatchId::as_str)
                .collect::<Vec<_>>()
                .join("\u{1}")
        });
        if let Some(key) = &merge_key {
            if let Some(doc) = self.merge_cache.get(key) {
                return Ok(doc.clone());
            }
        }

        let ordered = self.ordered_reachable(&heads, single_head && no_exclusions)?;

        let ids: Vec<PatchId> = if no_exclusions {
            (*ordered).clone()
        } else {
            let without: BTreeSet<&PatchId> = query.without.iter().collect();
            ordered
                .iter()
                .filter(|id| !without.contains(id))
                .cloned()
                .collect()
        };
        if ids.is_empty() {
            return Ok(self.codec.from_string(""));
        }

        // The latest reachable, non-excluded snapshot floors the replay.
        let floor_idx = ids
            .iter()
            .rposition(|id| self.patches.get(id).is_some_and(|p| p.is_snapshot));
        let (mut doc, replay) = match floor_idx {
            Some(i) => {
                let text = self
                    .patches
                    .get(&ids[i])
                    .and_then(|p| p.snapshot_text.clone())
                    .unwrap_or_default();
                (self.codec.from_string(&text), ids[i + 1..].to_vec())
            }
            None => (self.codec.from_string(""), ids),
        };
        let replay = self.dedup_file_patches(replay);

        // Prefix reuse: any id in the replay list whose cached document was
        // produced by exactly that prefix length seeds the computation.
        let mut start = 0usize;
        for idx in (0..replay.len()).rev() {
            if let Some(entry) = self.value_cache.get(&replay[idx]) {
                if entry.applied == idx + 1 {
                    doc = entry.doc.clone();
                    start = idx + 1;
                    break;
                }
            }
        }

        let bodies: Vec<&C::Body> = replay[start..]
            .iter()
            .filter_map(|id| self.patches.get(id).and_then(|p| p.body.as_ref()))
            .collect();
        let doc = if bodies.is_empty() {
            doc
        } else {
            self.codec.apply_patch_batch(&doc, &bodies)?
        };

        if single_head && no_exclusions {
            self.cache_value(heads[0].clone(), doc.clone(), replay.len());
        }
        if let Some(key) = merge_key {
            self.merge_cache.insert(key, doc.clone());
        }
        Ok(doc)
    }

    /// Ids reachable from `heads` through parents, stopping at snapshot
    /// boundaries, ascending.
    fn ordered_reachable(
        &mut self,
        heads: &[PatchId],
        use_cache: bool,
    ) -> Result<Arc<Vec<PatchId>>, GraphError> {
        if use_cache {
            if let Some(cached) = self.reach_cache.get(&heads[0]) {
                return Ok(Arc::clone(cached));
            }
        }
        let mut visited: BTreeSet<PatchId> = BTreeSet::new();
        let mut stack: Vec<PatchId> = heads.to_vec();
        while let Some(id) = stack.pop() {
            if !visited.insert(id.clone()) {
                continue;
            }
            let patch = self.patch(&id)?;
            if patch.is_snapshot {
                // Snapshots terminate traversal.
                continue;
            }
            for parent in &patch.parents {
                if !self.patches.contains_key(parent) {
                    return Err(GraphError::ParentMissing {
                        child: id.clone(),
                        parent: parent.clone(),
                    });
                }
                if !visited.contains(parent) {
                    stack.push(parent.clone());
                }
            }
        }
        let ordered = Arc::new(visited.into_iter().collect::<Vec<_>>());
        if use_cache {
            self.reach_cache
                .insert(heads[0].clone(), Arc::clone(&ordered));
        }
        Ok(ordered)
    }

    /// Drop a file-origin patch whose kept predecessor is also
    /// file-origin, carries an identical body, and sits within
    /// [`FILE_DEDUP_MS`] of it.
    fn dedup_file_patches(&self, list: Vec<PatchId>) -> Vec<PatchId> {
        let mut out: Vec<PatchId> = Vec::with_capacity(list.len());
        for id in list {
            let duplicate = self.patches.get(&id).is_some_and(|patch| {
                patch.file
                    && out.last().is_some_and(|last_id| {
                        self.patches.get(last_id).is_some_and(|last| {
                            last.file
                                && last.body == patch.body
                                && match (last_id.time_ms(), id.time_ms()) {
                                    (Ok(t1), Ok(t2)) => t2.saturating_sub(t1) <= FILE_DEDUP_MS,
                                    _ => false,
                                }
                        })
                    })
            });
            if !duplicate {
                out.push(id);
            }
        }
        out
    }

    fn cache_value(&mut self, id: PatchId, doc: C::Doc, applied: usize) {
        let size = doc.size_hint();
        if let Some(old) = self.value_cache.put(id, CacheEntry { doc, applied, size }) {
            self.value_cache_bytes = self.value_cache_bytes.saturating_sub(old.size);
        }
        self.value_cache_bytes += size;
        while self.value_cache.len() > self.value_entry_limit
            || (self.value_cache_bytes > self.value_byte_limit && self.value_cache.len() > 1)
        {
            match self.value_cache.pop_lru() {
                Some((_, entry)) => {
                    self.value_cache_bytes = self.value_cache_bytes.saturating_sub(entry.size);
                }
                None => break,
            }
        }
    }
}
