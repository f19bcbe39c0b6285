//! Text diff service: hunked string patches.
//!
//! Wire format of a patch body (JSON):
//! ```text
//! [ [[op, text], …], start1, start2, length1, length2 ]   × hunks
//! ```
//! with `op ∈ {-1, 0, 1}` (delete / keep / insert). Offsets and lengths are
//! byte positions into the source (`1`) and target (`2`) strings; hunk
//! boundaries always fall on UTF-8 character boundaries.
//!
//! Application is all-or-nothing: every hunk's expected source text must
//! match the document exactly at its recorded offset, otherwise the
//! document is returned unchanged and the patch reports unclean. There is
//! no fuzzy matching and there are no conflict markers.

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Delete op tag.
pub const DELETE: i8 = -1;
/// Keep-context op tag.
pub const EQUAL: i8 = 0;
/// Insert op tag.
pub const INSERT: i8 = 1;

/// Characters of unchanged context carried on each side of a hunk.
const CONTEXT_CHARS: usize = 4;

/// One diff run: `[op, text]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff(pub i8, pub String);

/// One patch hunk: a run of diffs plus source/target coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub diffs: Vec<Diff>,
    /// Byte offset of the hunk in the source string.
    pub start1: usize,
    /// Byte offset of the hunk in the target string.
    pub start2: usize,
    /// Bytes consumed from the source (equal + delete).
    pub length1: usize,
    /// Bytes produced in the target (equal + insert).
    pub length2: usize,
}

impl Serialize for Hunk {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (
            &self.diffs,
            self.start1,
            self.start2,
            self.length1,
            self.length2,
        )
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Hunk {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (diffs, start1, start2, length1, length2) =
            <(Vec<Diff>, usize, usize, usize, usize)>::deserialize(deserializer)?;
        Ok(Hunk {
            diffs,
            start1,
            start2,
            length1,
            length2,
        })
    }
}

/// An encoded string patch: zero or more non-overlapping hunks in
/// ascending source order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TextPatch(pub Vec<Hunk>);

impl TextPatch {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The diff/patch service used by the text codec and the table codec's
/// string columns.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextDiff;

impl TextDiff {
    /// Raw diff between two strings as `(op, text)` runs.
    pub fn diff(&self, a: &str, b: &str) -> Vec<Diff> {
        dissimilar::diff(a, b)
            .into_iter()
            .map(|chunk| match chunk {
                dissimilar::Chunk::Equal(text) => Diff(EQUAL, text.to_string()),
                dissimilar::Chunk::Delete(text) => Diff(DELETE, text.to_string()),
                dissimilar::Chunk::Insert(text) => Diff(INSERT, text.to_string()),
            })
            .collect()
    }

    /// Build a patch transforming `a` into `b`.
    pub fn make(&self, a: &str, b: &str) -> TextPatch {
        if a == b {
            return TextPatch::default();
        }
        let diffs = self.diff(a, b);

        let mut hunks = Vec::new();
        let mut builder: Option<HunkBuilder> = None;
        let mut pos1 = 0usize;
        let mut pos2 = 0usize;
        let mut last_equal = "";

        for Diff(op, text) in &diffs {
            match *op {
                EQUAL => {
                    let close = match builder.as_mut() {
                        // Short equality: keep it inside the hunk so the
                        // surrounding edits stay in one unit.
                        Some(b) if char_count_at_most(text, 2 * CONTEXT_CHARS) => {
                            b.push(EQUAL, text);
                            false
                        }
                        Some(b) => {
                            b.push(EQUAL, char_prefix(text, CONTEXT_CHARS));
                            true
                        }
                        None => false,
                    };
                    if close {
                        if let Some(b) = builder.take() {
                            hunks.push(b.finish());
                        }
                    }
                    last_equal = text;
                    pos1 += text.len();
                    pos2 += text.len();
                }
                DELETE | INSERT => {
                    if builder.is_none() {
                        let lead = char_suffix(last_equal, CONTEXT_CHARS);
                        builder = Some(HunkBuilder::open(pos1 - lead.len(), pos2 - lead.len(), lead));
                    }
                    if let Some(b) = builder.as_mut() {
                        b.push(*op, text);
                    }
                    if *op == DELETE {
                        pos1 += text.len();
                    } else {
                        pos2 += text.len();
                    }
                }
                _ => {}
            }
        }
        if let Some(b) = builder.take() {
            hunks.push(b.finish());
        }
        TextPatch(hunks)
    }

    /// Apply a patch to `text`.
    ///
    /// Returns the patched string and a cleanliness flag. If any hunk's
    /// expected source does not match exactly, the original text is
    /// returned unchanged with `clean == false`.
    pub fn apply(&self, text: &str, patch: &TextPatch) -> (String, bool) {
        if patch.0.is_empty() {
            return (text.to_string(), true);
        }

        // Verify every hunk before producing any output. Hunks must be
        // ascending and non-overlapping in source coordinates.
        let mut prev_end = 0usize;
        for hunk in &patch.0 {
            if hunk.start1 < prev_end {
                return (text.to_string(), false);
            }
            let expected = source_text(hunk);
            let end = hunk.start1 + expected.len();
            match text.get(hunk.start1..end) {
                Some(slice) if slice == expected => {}
                _ => return (text.to_string(), false),
            }
            prev_end = end;
        }

        let mut out = String::with_capacity(text.len());
        let mut cursor = 0usize;
        for hunk in &patch.0 {
            out.push_str(&text[cursor..hunk.start1]);
            for Diff(op, chunk) in &hunk.diffs {
                if *op == EQUAL || *op == INSERT {
                    out.push_str(chunk);
                }
            }
            cursor = hunk.start1 + source_len(hunk);
        }
        out.push_str(&text[cursor..]);
        (out, true)
    }
}

struct HunkBuilder {
    diffs: Vec<Diff>,
    start1: usize,
    start2: usize,
}

impl HunkBuilder {
    fn open(start1: usize, start2: usize, lead: &str) -> Self {
        let mut b = HunkBuilder {
            diffs: Vec::new(),
            start1,
            start2,
        };
        if !lead.is_empty() {
            b.diffs.push(Diff(EQUAL, lead.to_string()));
        }
        b
    }

    fn push(&mut self, op: i8, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(Diff(last_op, last_text)) = self.diffs.last_mut() {
            if *last_op == op {
                last_text.push_str(text);
                return;
            }
        }
        self.diffs.push(Diff(op, text.to_string()));
    }

    fn finish(self) -> Hunk {
        let mut length1 = 0;
        let mut length2 = 0;
        for Diff(op, text) in &self.diffs {
            if *op != INSERT {
                length1 += text.len();
            }
            if *op != DELETE {
                length2 += text.len();
            }
        }
        Hunk {
            diffs: self.diffs,
            start1: self.start1,
            start2: self.start2,
            length1,
            length2,
        }
    }
}

fn source_text(hunk: &Hunk) -> String {
    let mut s = String::with_capacity(hunk.length1);
    for Diff(op, text) in &hunk.diffs {
        if *op != INSERT {
            s.push_str(text);
        }
    }
    s
}

fn source_len(hunk: &Hunk) -> usize {
    hunk.diffs
        .iter()
        .filter(|Diff(op, _)| *op != INSERT)
        .map(|Diff(_, text)| text.len())
        .sum()
}

/// Up to `n` characters from the start of `s`, on a char boundary.
fn char_prefix(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Up to `n` characters from the end of `s`, on a char boundary.
fn char_suffix(s: &str, n: usize) -> &str {
    let count = s.chars().count();
    if count <= n {
        return s;
    }
    match s.char_indices().nth(count - n) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

fn char_count_at_most(s: &str, n: usize) -> bool {
    s.chars().take(n + 1).count() <= n
}
