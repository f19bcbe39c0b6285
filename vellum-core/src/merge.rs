//! Deterministic three-way text merge.
//!
//! Used by working-copy rebase when the committed document advances under
//! a staged draft. Head-merge in the graph does *not* use this — it replays
//! patches in id order.
//!
//! The weave: compute `base→local` and `base→remote` diffs, partition
//! `base` at every insert or delete boundary from either side, then walk
//! the partition emitting local inserts before remote inserts (identical
//! strings at the same boundary are emitted once) and dropping any segment
//! deleted by either side. Deterministic, conflict-marker-free, pure.

use std::collections::{BTreeMap, BTreeSet};

use crate::textdiff::{Diff, TextDiff, DELETE, EQUAL, INSERT};

/// Merge `local` and `remote`, both derived from `base`.
pub fn three_way(base: &str, local: &str, remote: &str) -> String {
    if local == remote {
        return local.to_string();
    }
    if base == remote {
        return local.to_string();
    }
    if base == local {
        return remote.to_string();
    }

    let service = TextDiff;
    let local_edits = Edits::from_diff(&service.diff(base, local));
    let remote_edits = Edits::from_diff(&service.diff(base, remote));

    let mut bounds: BTreeSet<usize> = BTreeSet::new();
    bounds.insert(0);
    bounds.insert(base.len());
    for edits in [&local_edits, &remote_edits] {
        bounds.extend(edits.inserts.keys().copied());
        for &(start, end) in &edits.deletes {
            bounds.insert(start);
            bounds.insert(end);
        }
    }
    let positions: Vec<usize> = bounds.into_iter().collect();

    let mut out = String::with_capacity(base.len().max(local.len()).max(remote.len()));
    for (i, &pos) in positions.iter().enumerate() {
        let local_ins = local_edits.inserts.get(&pos);
        if let Some(texts) = local_ins {
            for text in texts {
                out.push_str(text);
            }
        }
        if let Some(texts) = remote_edits.inserts.get(&pos) {
            for text in texts {
                let already = local_ins.is_some_and(|l| l.iter().any(|t| t == text));
                if !already {
                    out.push_str(text);
                }
            }
        }
        if let Some(&next) = positions.get(i + 1) {
            // Segment survives only if neither side deleted it.
            if !local_edits.deleted(pos, next) && !remote_edits.deleted(pos, next) {
                out.push_str(&base[pos..next]);
            }
        }
    }
    out
}

/// One side's edits against the base, in base coordinates.
struct Edits {
    inserts: BTreeMap<usize, Vec<String>>,
    deletes: Vec<(usize, usize)>,
}

impl Edits {
    fn from_diff(diffs: &[Diff]) -> Self {
        let mut inserts: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        let mut deletes = Vec::new();
        let mut pos = 0usize;
        for Diff(op, text) in diffs {
            match *op {
                EQUAL => pos += text.len(),
                DELETE => {
                    deletes.push((pos, pos + text.len()));
                    pos += text.len();
                }
                INSERT => inserts.entry(pos).or_default().push(text.clone()),
                _ => {}
            }
        }
        Edits { inserts, deletes }
    }

    /// Whether the base segment `[start, end)` falls inside a deletion.
    fn deleted(&self, start: usize, end: usize) -> bool {
        self.deletes.iter().any(|&(a, b)| a <= start && end <= b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_sides() {
        assert_eq!(three_way("base", "same", "same"), "same");
    }

    #[test]
    fn test_remote_unchanged_takes_local() {
        assert_eq!(three_way("base", "local edit", "base"), "local edit");
    }

    #[test]
    fn test_local_unchanged_takes_remote() {
        assert_eq!(three_way("base", "base", "remote edit"), "remote edit");
    }

    #[test]
    fn test_concurrent_inserts_from_empty() {
        assert_eq!(three_way("", "A", "B"), "AB");
    }

    #[test]
    fn test_prefix_remote_suffix_local() {
        assert_eq!(
            three_way("hello", "hello local", "REMOTE hello"),
            "REMOTE hello local"
        );
    }

    #[test]
    fn test_non_overlapping_edits_both_kept() {
        let merged = three_way(
            "one two three four",
            "ONE two three four",
            "one two three FOUR",
        );
        assert_eq!(merged, "ONE two three FOUR");
    }

    #[test]
    fn test_identical_inserts_deduplicated() {
        let merged = three_way("alpha beta", "alpha X beta Y", "alpha X beta Z");
        assert_eq!(merged, "alpha X beta Y Z");
    }

    #[test]
    fn test_delete_wins_over_keep() {
        // Local deleted " two"; remote kept it.
        assert_eq!(three_way("one two three", "one three", "one two three!"), "one three!");
        // And symmetrically for remote deletes.
        assert_eq!(three_way("one two three", "one two three!", "one three"), "one three!");
    }

    #[test]
    fn test_no_conflict_markers() {
        let merged = three_way("shared", "shared alpha", "shared beta");
        assert!(!merged.contains("<<<"));
        assert!(!merged.contains(">>>"));
    }

    #[test]
    fn test_deterministic() {
        let a = three_way("base text here", "base NEW text here", "base text HERE now");
        let b = three_way("base text here", "base NEW text here", "base text HERE now");
        assert_eq!(a, b);
    }

    quickcheck::quickcheck! {
        fn prop_equal_draft_returns_remote(base: String, remote: String) -> bool {
            three_way(&base, &base, &remote) == remote
        }

        fn prop_unchanged_remote_returns_local(base: String, local: String) -> bool {
            three_way(&base, &local, &base) == local
        }

        fn prop_identical_sides_stable(base: String, side: String) -> bool {
            three_way(&base, &side, &side) == side
        }
    }
}
