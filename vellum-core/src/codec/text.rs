//! Text codec: plain strings patched through the diff service.
//!
//! `from_string`/`to_string` are identity. A patch that fails to apply
//! exactly is absorbed as a no-op — the unchanged document is returned and
//! the failure is logged at `debug`; nothing propagates upward.

use crate::codec::{DocCodec, Document};
use crate::error::CodecError;
use crate::merge::three_way;
use crate::textdiff::{TextDiff, TextPatch};

impl Document for String {
    fn count(&self) -> usize {
        self.len()
    }
}

/// The string-document codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec {
    diff: TextDiff,
}

impl TextCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocCodec for TextCodec {
    type Doc = String;
    type Body = TextPatch;

    fn from_string(&self, text: &str) -> String {
        text.to_string()
    }

    fn to_string(&self, doc: &String) -> String {
        doc.clone()
    }

    fn apply_patch(&self, doc: &String, body: &TextPatch) -> Result<String, CodecError> {
        let (next, clean) = self.diff.apply(doc, body);
        if !clean {
            log::debug!("text patch did not apply cleanly; keeping document unchanged");
        }
        Ok(next)
    }

    fn make_patch(&self, from: &String, to: &String) -> Result<TextPatch, CodecError> {
        Ok(self.diff.make(from, to))
    }

    fn rebase_draft(
        &self,
        base: &String,
        draft: &String,
        updated_base: &String,
    ) -> Result<String, CodecError> {
        Ok(three_way(base, draft, updated_base))
    }
}
