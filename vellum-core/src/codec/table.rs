//! Table codec: ordered JSONL records with primary-key indexes.
//!
//! A table document is a sequence of insertion slots (tombstoned slots
//! stay in place) plus one secondary index per primary-key column mapping
//! the stable JSON encoding of the key value to the set of slots holding
//! it. Documents share structure: slots and indexes live behind `Arc`s, a
//! batch clones the containers once and mutates a working copy, and the
//! records themselves stay shared.
//!
//! Patch bodies are a flat array alternating `(op, payload)`:
//! `op = -1` deletes by primary-key pattern, `op = 1` upserts records.
//! String columns listed in the config may travel either as replacement
//! strings or as encoded string patches (see [`crate::textdiff`]).
//!
//! Serialization is one JSON object per line, lines sorted
//! lexicographically; `serde_json`'s default `BTreeMap`-backed maps make
//! every encoded object's keys sorted, which is the stable encoding used
//! both for lines and for index keys.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::de::{Deserializer, Error as DeError};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{DocCodec, Document};
use crate::error::CodecError;
use crate::textdiff::{TextDiff, TextPatch};

/// One table record: a JSON object.
pub type Record = serde_json::Map<String, Value>;

/// Index shape: column → stable-JSON(key value) → slots.
type Indexes = FxHashMap<String, FxHashMap<String, BTreeSet<usize>>>;

/// Static configuration of a table family.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Columns forming the primary key. At least one is required.
    pub primary_keys: Vec<String>,
    /// Columns whose string values may travel as encoded string patches.
    pub string_cols: Vec<String>,
}

impl TableConfig {
    pub fn new<S: Into<String>>(primary_keys: impl IntoIterator<Item = S>) -> Self {
        Self {
            primary_keys: primary_keys.into_iter().map(Into::into).collect(),
            string_cols: Vec::new(),
        }
    }

    pub fn with_string_cols<S: Into<String>>(
        mut self,
        cols: impl IntoIterator<Item = S>,
    ) -> Self {
        self.string_cols = cols.into_iter().map(Into::into).collect();
        self
    }

    fn is_primary(&self, field: &str) -> bool {
        self.primary_keys.iter().any(|k| k == field)
    }

    fn is_string_col(&self, field: &str) -> bool {
        self.string_cols.iter().any(|k| k == field)
    }
}

// ───────────────────────────────────────────────────────────────────
// Patch body
// ───────────────────────────────────────────────────────────────────

/// One operation inside a table patch body.
#[derive(Debug, Clone, PartialEq)]
pub enum TableOp {
    /// `(-1, [where, …])` — delete records matching primary-key patterns.
    Delete(Vec<Record>),
    /// `(1, [record, …])` — upsert records.
    Upsert(Vec<Record>),
}

/// A table patch body: a run of operations, wire-encoded as a flat array
/// alternating op tag and payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableBody(pub Vec<TableOp>);

impl TableBody {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Convenience: a single upsert body.
    pub fn upsert(records: Vec<Record>) -> Self {
        Self(vec![TableOp::Upsert(records)])
    }

    /// Convenience: a single delete body.
    pub fn delete(wheres: Vec<Record>) -> Self {
        Self(vec![TableOp::Delete(wheres)])
    }
}

impl Serialize for TableBody {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len() * 2))?;
        for op in &self.0 {
            match op {
                TableOp::Delete(wheres) => {
                    seq.serialize_element(&-1i8)?;
                    seq.serialize_element(wheres)?;
                }
                TableOp::Upsert(records) => {
                    seq.serialize_element(&1i8)?;
                    seq.serialize_element(records)?;
                }
            }
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for TableBody {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let items = Vec::<Value>::deserialize(deserializer)?;
        if items.len() % 2 != 0 {
            return Err(D::Error::custom(
                "table patch body must alternate op and payload",
            ));
        }
        let mut ops = Vec::with_capacity(items.len() / 2);
        for pair in items.chunks(2) {
            let tag = pair[0]
                .as_i64()
                .ok_or_else(|| D::Error::custom("table op tag must be -1 or 1"))?;
            let payload = pair[1]
                .as_array()
                .ok_or_else(|| D::Error::custom("table op payload must be an array"))?;
            let records: Result<Vec<Record>, D::Error> = payload
                .iter()
                .map(|v| match v {
                    Value::Object(map) => Ok(map.clone()),
                    _ => Err(D::Error::custom("table op payload items must be objects")),
                })
                .collect();
            match tag {
                -1 => ops.push(TableOp::Delete(records?)),
                1 => ops.push(TableOp::Upsert(records?)),
                other => {
                    return Err(D::Error::custom(format!(
                        "unknown table op tag {other}"
                    )));
                }
            }
        }
        Ok(TableBody(ops))
    }
}

// ───────────────────────────────────────────────────────────────────
// Document
// ───────────────────────────────────────────────────────────────────

/// An immutable table document.
#[derive(Debug, Clone)]
pub struct TableDoc {
    slots: Arc<Vec<Option<Arc<Record>>>>,
    indexes: Arc<Indexes>,
    record_count: usize,
    config: Arc<TableConfig>,
}

impl TableDoc {
    fn empty(config: Arc<TableConfig>) -> Self {
        Self {
            slots: Arc::new(Vec::new()),
            indexes: Arc::new(Indexes::default()),
            record_count: 0,
            config,
        }
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// All live records in slot order.
    pub fn records(&self) -> impl Iterator<Item = &Arc<Record>> {
        self.slots.iter().flatten()
    }

    /// Records matching a primary-key pattern, in slot order.
    pub fn select(&self, where_: &Record) -> Result<Vec<Arc<Record>>, CodecError> {
        let slots = resolve(&self.indexes, &self.slots, &self.config, where_)?;
        Ok(slots
            .into_iter()
            .filter_map(|slot| self.slots.get(slot).cloned().flatten())
            .collect())
    }

    /// The first record matching a primary-key pattern.
    pub fn get_one(&self, where_: &Record) -> Result<Option<Arc<Record>>, CodecError> {
        Ok(self.select(where_)?.into_iter().next())
    }

    /// Records keyed by the stable encoding of their primary-key values.
    fn keyed(&self) -> BTreeMap<String, Arc<Record>> {
        self.records()
            .map(|r| (primary_key_of(r, &self.config), Arc::clone(r)))
            .collect()
    }
}

impl PartialEq for TableDoc {
    /// Semantic equality: same record count and same content per primary
    /// key, insensitive to slot layout.
    fn eq(&self, other: &Self) -> bool {
        if self.record_count != other.record_count {
            return false;
        }
        let ours = self.keyed();
        let theirs = other.keyed();
        ours.len() == theirs.len()
            && ours
                .iter()
                .all(|(key, rec)| theirs.get(key).is_some_and(|o| o.as_ref() == rec.as_ref()))
    }
}

impl Document for TableDoc {
    fn count(&self) -> usize {
        self.record_count
    }

    fn size_hint(&self) -> usize {
        // Rough per-record footprint; eviction heuristic only.
        self.record_count * 128
    }
}

/// Stable JSON encoding of a value (sorted object keys).
fn stable_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| String::from("null"))
}

/// Stable encoding of a record's primary-key values, missing keys as null.
fn primary_key_of(record: &Record, config: &TableConfig) -> String {
    let values: Vec<&Value> = config
        .primary_keys
        .iter()
        .map(|k| record.get(k).unwrap_or(&Value::Null))
        .collect();
    stable_json(&Value::Array(values.into_iter().cloned().collect()))
}

/// Resolve a `where` pattern to slot indexes via index intersection.
/// An empty pattern selects every live slot.
fn resolve(
    indexes: &Indexes,
    slots: &[Option<Arc<Record>>],
    config: &TableConfig,
    where_: &Record,
) -> Result<BTreeSet<usize>, CodecError> {
    if where_.is_empty() {
        return Ok(slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect());
    }
    let mut result: Option<BTreeSet<usize>> = None;
    for (field, value) in where_ {
        if !config.is_primary(field) {
            return Err(CodecError::InvalidWhere(field.clone()));
        }
        let bucket = indexes
            .get(field)
            .and_then(|by_key| by_key.get(&stable_json(value)))
            .cloned()
            .unwrap_or_default();
        result = Some(match result {
            None => bucket,
            Some(acc) => acc.intersection(&bucket).copied().collect(),
        });
        if result.as_ref().is_some_and(BTreeSet::is_empty) {
            break;
        }
    }
    Ok(result.unwrap_or_default())
}

// ───────────────────────────────────────────────────────────────────
// Batch transaction
// ───────────────────────────────────────────────────────────────────

/// Mutable working copy of a document for one batch of patches.
///
/// Indexes are maintained incrementally — a slot moves between key
/// buckets only when one of its primary-key columns actually changes —
/// so a batch costs O(affected records) plus O(ops), independent of the
/// table size beyond the single container clone at the start.
struct TableTxn<'a> {
    slots: Vec<Option<Arc<Record>>>,
    indexes: Indexes,
    record_count: usize,
    config: &'a TableConfig,
    diff: &'a TextDiff,
}

impl<'a> TableTxn<'a> {
    fn begin(doc: &TableDoc, config: &'a TableConfig, diff: &'a TextDiff) -> Self {
        Self {
            slots: (*doc.slots).clone(),
            indexes: (*doc.indexes).clone(),
            record_count: doc.record_count,
            config,
            diff,
        }
    }

    fn apply(&mut self, op: &TableOp) -> Result<(), CodecError> {
        match op {
            TableOp::Delete(wheres) => {
                for where_ in wheres {
                    self.delete(where_)?;
                }
            }
            TableOp::Upsert(records) => {
                for record in records {
                    self.upsert(record)?;
                }
            }
        }
        Ok(())
    }

    fn delete(&mut self, where_: &Record) -> Result<(), CodecError> {
        let matches = resolve(&self.indexes, &self.slots, self.config, where_)?;
        for slot in matches {
            if let Some(record) = self.slots[slot].take() {
                self.unindex(slot, &record);
                self.record_count -= 1;
            }
        }
        Ok(())
    }

    fn upsert(&mut self, record: &Record) -> Result<(), CodecError> {
        let mut where_keys = Record::new();
        let mut set_fields = Record::new();
        for (field, value) in record {
            if self.config.is_primary(field) && !value.is_null() {
                where_keys.insert(field.clone(), value.clone());
            } else {
                set_fields.insert(field.clone(), value.clone());
            }
        }

        let matches = resolve(&self.indexes, &self.slots, self.config, &where_keys)?;
        if matches.is_empty() {
            return self.insert(record);
        }

        for slot in matches {
            let Some(old) = self.slots[slot].clone() else {
                continue;
            };
            let updated = self.update_fields(&old, &set_fields)?;
            self.reindex(slot, &old, &updated);
            self.slots[slot] = Some(Arc::new(updated));
        }
        Ok(())
    }

    /// Apply update rules field by field, producing the new record.
    fn update_fields(&self, old: &Record, set_fields: &Record) -> Result<Record, CodecError> {
        let mut next = old.clone();
        for (field, value) in set_fields {
            if value.is_null() {
                next.remove(field);
                continue;
            }
            if self.config.is_string_col(field) {
                match value {
                    Value::Array(_) => {
                        let patch: TextPatch =
                            serde_json::from_value(value.clone()).map_err(|e| {
                                CodecError::CorruptPatchBody(format!(
                                    "bad string patch for `{field}`: {e}"
                                ))
                            })?;
                        let current = next.get(field).and_then(Value::as_str).unwrap_or("");
                        let (patched, clean) = self.diff.apply(current, &patch);
                        if !clean {
                            log::debug!("string patch for `{field}` did not apply cleanly");
                        }
                        next.insert(field.clone(), Value::String(patched));
                    }
                    Value::String(_) => {
                        next.insert(field.clone(), value.clone());
                    }
                    _ => {
                        return Err(CodecError::InvalidFieldType {
                            field: field.clone(),
                        });
                    }
                }
                continue;
            }
            match (next.get(field), value) {
                (Some(Value::Object(current)), Value::Object(change)) => {
                    let mut merged = current.clone();
                    for (key, v) in change {
                        if v.is_null() {
                            merged.remove(key);
                        } else {
                            merged.insert(key.clone(), v.clone());
                        }
                    }
                    next.insert(field.clone(), Value::Object(merged));
                }
                _ => {
                    next.insert(field.clone(), value.clone());
                }
            }
        }
        Ok(next)
    }

    /// Insert a fresh record: null fields are stripped, string-column
    /// patches without a base are dropped.
    fn insert(&mut self, record: &Record) -> Result<(), CodecError> {
        let mut fresh = Record::new();
        for (field, value) in record {
            if value.is_null() {
                continue;
            }
            if self.config.is_string_col(field) {
                match value {
                    Value::Array(_) => continue,
                    Value::String(_) => {}
                    _ => {
                        return Err(CodecError::InvalidFieldType {
                            field: field.clone(),
                        });
                    }
                }
            }
            fresh.insert(field.clone(), value.clone());
        }
        let slot = self.slots.len();
        let fresh = Arc::new(fresh);
        self.index(slot, &fresh);
        self.slots.push(Some(fresh));
        self.record_count += 1;
        Ok(())
    }

    fn index(&mut self, slot: usize, record: &Record) {
        for column in &self.config.primary_keys {
            let key = stable_json(record.get(column).unwrap_or(&Value::Null));
            self.indexes
                .entry(column.clone())
                .or_default()
                .entry(key)
                .or_default()
                .insert(slot);
        }
    }

    fn unindex(&mut self, slot: usize, record: &Record) {
        for column in &self.config.primary_keys {
            let key = stable_json(record.get(column).unwrap_or(&Value::Null));
            if let Some(by_key) = self.indexes.get_mut(column) {
                if let Some(bucket) = by_key.get_mut(&key) {
                    bucket.remove(&slot);
                    if bucket.is_empty() {
                        by_key.remove(&key);
                    }
                }
            }
        }
    }

    /// Move a slot between key buckets for any primary-key column whose
    /// stable encoding changed — including when the key column itself was
    /// rewritten by the update.
    fn reindex(&mut self, slot: usize, old: &Record, new: &Record) {
        for column in &self.config.primary_keys {
            let old_key = stable_json(old.get(column).unwrap_or(&Value::Null));
            let new_key = stable_json(new.get(column).unwrap_or(&Value::Null));
            if old_key == new_key {
                continue;
            }
            if let Some(by_key) = self.indexes.get_mut(column) {
                if let Some(bucket) = by_key.get_mut(&old_key) {
                    bucket.remove(&slot);
                    if bucket.is_empty() {
                        by_key.remove(&old_key);
                    }
                }
            }
            self.indexes
                .entry(column.clone())
                .or_default()
                .entry(new_key)
                .or_default()
                .insert(slot);
        }
    }

    fn commit(self, config: Arc<TableConfig>) -> TableDoc {
        TableDoc {
            slots: Arc::new(self.slots),
            indexes: Arc::new(self.indexes),
            record_count: self.record_count,
            config,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Codec
// ───────────────────────────────────────────────────────────────────

/// The keyed-record codec.
#[derive(Debug, Clone)]
pub struct TableCodec {
    config: Arc<TableConfig>,
    diff: TextDiff,
}

impl TableCodec {
    pub fn new(config: TableConfig) -> Result<Self, CodecError> {
        if config.primary_keys.is_empty() {
            return Err(CodecError::Config(
                "table codec requires at least one primary key".into(),
            ));
        }
        Ok(Self {
            config: Arc::new(config),
            diff: TextDiff,
        })
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    /// An empty table document for this codec's configuration.
    pub fn empty(&self) -> TableDoc {
        TableDoc::empty(Arc::clone(&self.config))
    }

    /// Per-field delta between two versions of one record; `None` when
    /// nothing changed.
    fn record_delta(&self, from: &Record, to: &Record) -> Option<Record> {
        let mut changes = Record::new();
        for (field, old_value) in from {
            if self.config.is_primary(field) {
                continue;
            }
            match to.get(field) {
                None => {
                    changes.insert(field.clone(), Value::Null);
                }
                Some(new_value) if new_value == old_value => {}
                Some(new_value) => {
                    changes.insert(field.clone(), self.field_delta(field, old_value, new_value));
                }
            }
        }
        for (field, new_value) in to {
            if self.config.is_primary(field) || from.contains_key(field) {
                continue;
            }
            changes.insert(field.clone(), new_value.clone());
        }
        if changes.is_empty() {
            None
        } else {
            Some(changes)
        }
    }

    fn field_delta(&self, field: &str, old: &Value, new: &Value) -> Value {
        if self.config.is_string_col(field) {
            if let (Value::String(old_text), Value::String(new_text)) = (old, new) {
                let patch = self.diff.make(old_text, new_text);
                if let Ok(encoded) = serde_json::to_value(&patch) {
                    return encoded;
                }
            }
            return new.clone();
        }
        if let (Value::Object(old_map), Value::Object(new_map)) = (old, new) {
            let mut merge = Record::new();
            for (key, old_v) in old_map {
                match new_map.get(key) {
                    None => {
                        merge.insert(key.clone(), Value::Null);
                    }
                    Some(new_v) if new_v == old_v => {}
                    Some(new_v) => {
                        merge.insert(key.clone(), new_v.clone());
                    }
                }
            }
            for (key, new_v) in new_map {
                if !old_map.contains_key(key) {
                    merge.insert(key.clone(), new_v.clone());
                }
            }
            return Value::Object(merge);
        }
        new.clone()
    }
}

impl DocCodec for TableCodec {
    type Doc = TableDoc;
    type Body = TableBody;

    fn from_string(&self, text: &str) -> TableDoc {
        let mut txn = TableTxn {
            slots: Vec::new(),
            indexes: Indexes::default(),
            record_count: 0,
            config: &*self.config,
            diff: &self.diff,
        };
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(Value::Object(record)) => {
                    let slot = txn.slots.len();
                    let record = Arc::new(record);
                    txn.index(slot, &record);
                    txn.slots.push(Some(record));
                    txn.record_count += 1;
                }
                Ok(_) => {
                    log::warn!("skipping non-object table line: {line}");
                }
                Err(err) => {
                    log::warn!("skipping corrupt table line: {err}");
                }
            }
        }
        txn.commit(Arc::clone(&self.config))
    }

    fn to_string(&self, doc: &TableDoc) -> String {
        let mut lines: Vec<String> = doc
            .records()
            .map(|r| stable_json(&Value::Object(r.as_ref().clone())))
            .collect();
        lines.sort();
        lines.join("\n")
    }

    fn apply_patch(&self, doc: &TableDoc, body: &TableBody) -> Result<TableDoc, CodecError> {
        self.apply_patch_batch(doc, &[body])
    }

    fn apply_patch_batch(
        &self,
        doc: &TableDoc,
        bodies: &[&TableBody],
    ) -> Result<TableDoc, CodecError> {
        let mut txn = TableTxn::begin(doc, &self.config, &self.diff);
        for body in bodies {
            for op in &body.0 {
                txn.apply(op)?;
            }
        }
        Ok(txn.commit(Arc::clone(&self.config)))
    }

    fn make_patch(&self, from: &TableDoc, to: &TableDoc) -> Result<TableBody, CodecError> {
        let from_keyed = from.keyed();
        let to_keyed = to.keyed();

        let mut deletes = Vec::new();
        let mut upserts = Vec::new();

        for (key, record) in &from_keyed {
            if !to_keyed.contains_key(key) {
                let mut where_ = Record::new();
                for column in &self.config.primary_keys {
                    if let Some(value) = record.get(column) {
                        where_.insert(column.clone(), value.clone());
                    }
                }
                deletes.push(where_);
            }
        }
        for (key, record) in &to_keyed {
            match from_keyed.get(key) {
                None => upserts.push(record.as_ref().clone()),
                Some(old) => {
                    if let Some(changes) = self.record_delta(old, record) {
                        let mut update = Record::new();
                        for column in &self.config.primary_keys {
                            if let Some(value) = record.get(column) {
                                update.insert(column.clone(), value.clone());
                            }
                        }
                        update.extend(changes);
                        upserts.push(update);
                    }
                }
            }
        }

        let mut ops = Vec::new();
        if !deletes.is_empty() {
            ops.push(TableOp::Delete(deletes));
        }
        if !upserts.is_empty() {
            ops.push(TableOp::Upsert(upserts));
        }
        Ok(TableBody(ops))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn codec() -> TableCodec {
        TableCodec::new(TableConfig::new(["id"]).with_string_cols(["body"])).unwrap()
    }

    fn record(value: Value) -> Record {
        value.as_object().cloned().expect("object literal")
    }

    #[test]
    fn test_requires_primary_key() {
        let result = TableCodec::new(TableConfig::new(Vec::<String>::new()));
        assert!(matches!(result, Err(CodecError::Config(_))));
    }

    #[test]
    fn test_upsert_update_delete_flow() {
        let codec = codec();
        let doc = codec.empty();

        let doc = codec
            .apply_patch(
                &doc,
                &TableBody::upsert(vec![
                    record(json!({"id": 1, "body": "hello"})),
                    record(json!({"id": 2, "body": "bye"})),
                ]),
            )
            .unwrap();
        assert_eq!(doc.record_count(), 2);

        let doc = codec
            .apply_patch(
                &doc,
                &TableBody::upsert(vec![record(json!({"id": 1, "body": "hello world"}))]),
            )
            .unwrap();
        let one = doc.get_one(&record(json!({"id": 1}))).unwrap().unwrap();
        assert_eq!(one.get("body"), Some(&json!("hello world")));

        let doc = codec
            .apply_patch(&doc, &TableBody::delete(vec![record(json!({"id": 2}))]))
            .unwrap();
        assert_eq!(doc.record_count(), 1);
        assert!(doc.get_one(&record(json!({"id": 2}))).unwrap().is_none());

        assert_eq!(codec.to_string(&doc), r#"{"body":"hello world","id":1}"#);
    }

    #[test]
    fn test_serialization_sorted_lines() {
        let codec = codec();
        let doc = codec
            .apply_patch(
                &codec.empty(),
                &TableBody::upsert(vec![
                    record(json!({"id": 2, "body": "z"})),
                    record(json!({"id": 1, "body": "a"})),
                ]),
            )
            .unwrap();
        let text = codec.to_string(&doc);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0] < lines[1]);
    }

    #[test]
    fn test_from_string_skips_corrupt_lines() {
        let codec = codec();
        let doc = codec.from_string(
            "{\"id\":1,\"body\":\"x\"}\nnot json at all\n42\n\n{\"id\":2,\"body\":\"y\"}",
        );
        assert_eq!(doc.record_count(), 2);
    }

    #[test]
    fn test_round_trip() {
        let codec = codec();
        let doc = codec
            .apply_patch(
                &codec.empty(),
                &TableBody::upsert(vec![
                    record(json!({"id": 1, "body": "alpha", "tags": {"a": 1}})),
                    record(json!({"id": 2, "body": "beta"})),
                ]),
            )
            .unwrap();
        let text = codec.to_string(&doc);
        let back = codec.from_string(&text);
        assert!(doc.is_equal(&back));
    }

    #[test]
    fn test_string_col_patch_application() {
        let codec = codec();
        let from = codec
            .apply_patch(
                &codec.empty(),
                &TableBody::upsert(vec![record(json!({"id": 1, "body": "hello"}))]),
            )
            .unwrap();
        let to = codec
            .apply_patch(
                &from,
                &TableBody::upsert(vec![record(json!({"id": 1, "body": "1hello2"}))]),
            )
            .unwrap();

        let body = codec.make_patch(&from, &to).unwrap();
        // The body must carry an encoded string patch, not a replacement.
        let json = serde_json::to_value(&body).unwrap();
        let payload = &json.as_array().unwrap()[1];
        let encoded_field = &payload.as_array().unwrap()[0]["body"];
        assert!(encoded_field.is_array(), "expected encoded string patch");

        let applied = codec.apply_patch(&from, &body).unwrap();
        let one = applied.get_one(&record(json!({"id": 1}))).unwrap().unwrap();
        assert_eq!(one.get("body"), Some(&json!("1hello2")));
    }

    #[test]
    fn test_string_col_patch_without_base_dropped_on_insert() {
        let codec = codec();
        let patch_value = serde_json::to_value(TextDiff.make("", "text")).unwrap();
        let mut rec = Record::new();
        rec.insert("id".into(), json!(9));
        rec.insert("body".into(), patch_value);

        let doc = codec
            .apply_patch(&codec.empty(), &TableBody::upsert(vec![rec]))
            .unwrap();
        let one = doc.get_one(&record(json!({"id": 9}))).unwrap().unwrap();
        assert!(one.get("body").is_none());
    }

    #[test]
    fn test_string_col_bad_type_errors() {
        let codec = codec();
        let doc = codec
            .apply_patch(
                &codec.empty(),
                &TableBody::upsert(vec![record(json!({"id": 1, "body": "x"}))]),
            )
            .unwrap();
        let result = codec.apply_patch(
            &doc,
            &TableBody::upsert(vec![record(json!({"id": 1, "body": 42}))]),
        );
        assert!(matches!(result, Err(CodecError::InvalidFieldType { .. })));
    }

    #[test]
    fn test_null_deletes_field() {
        let codec = codec();
        let doc = codec
            .apply_patch(
                &codec.empty(),
                &TableBody::upsert(vec![record(json!({"id": 1, "body": "x", "extra": 5}))]),
            )
            .unwrap();
        let doc = codec
            .apply_patch(
                &doc,
                &TableBody::upsert(vec![record(json!({"id": 1, "extra": null}))]),
            )
            .unwrap();
        let one = doc.get_one(&record(json!({"id": 1}))).unwrap().unwrap();
        assert!(one.get("extra").is_none());
        assert_eq!(one.get("body"), Some(&json!("x")));
    }

    #[test]
    fn test_map_shallow_merge() {
        let codec = codec();
        let doc = codec
            .apply_patch(
                &codec.empty(),
                &TableBody::upsert(vec![record(
                    json!({"id": 1, "tags": {"a": 1, "b": 2, "c": 3}}),
                )]),
            )
            .unwrap();
        let doc = codec
            .apply_patch(
                &doc,
                &TableBody::upsert(vec![record(
                    json!({"id": 1, "tags": {"a": 10, "b": null, "d": 4}}),
                )]),
            )
            .unwrap();
        let one = doc.get_one(&record(json!({"id": 1}))).unwrap().unwrap();
        assert_eq!(one.get("tags"), Some(&json!({"a": 10, "c": 3, "d": 4})));
    }

    #[test]
    fn test_where_non_primary_key_errors() {
        let codec = codec();
        let doc = codec.empty();
        let result = doc.select(&record(json!({"body": "x"})));
        assert!(matches!(result, Err(CodecError::InvalidWhere(_))));
    }

    #[test]
    fn test_key_moves_within_one_body() {
        let codec = codec();
        let doc = codec
            .apply_patch(
                &codec.empty(),
                &TableBody::upsert(vec![record(json!({"id": 1, "body": "x"}))]),
            )
            .unwrap();
        let doc = codec
            .apply_patch(
                &doc,
                &TableBody(vec![
                    TableOp::Delete(vec![record(json!({"id": 1}))]),
                    TableOp::Upsert(vec![record(json!({"id": 7, "body": "x"}))]),
                ]),
            )
            .unwrap();
        assert!(doc.get_one(&record(json!({"id": 1}))).unwrap().is_none());
        assert!(doc.get_one(&record(json!({"id": 7}))).unwrap().is_some());
        assert_eq!(doc.record_count(), 1);
    }

    #[test]
    fn test_update_rewriting_key_column_reindexes() {
        let codec = TableCodec::new(TableConfig::new(["org", "id"])).unwrap();
        let doc = codec
            .apply_patch(
                &codec.empty(),
                &TableBody::upsert(vec![record(json!({"org": "a", "id": 1, "v": 1}))]),
            )
            .unwrap();
        // `id: null` lands in the set-fields and deletes the key column;
        // the slot must move out of the old id bucket.
        let doc = codec
            .apply_patch(
                &doc,
                &TableBody::upsert(vec![record(json!({"org": "a", "id": null}))]),
            )
            .unwrap();
        assert_eq!(doc.record_count(), 1);
        assert!(doc
            .select(&record(json!({"org": "a", "id": 1})))
            .unwrap()
            .is_empty());
        let survivors = doc.select(&record(json!({"org": "a"}))).unwrap();
        assert_eq!(survivors.len(), 1);
        assert!(survivors[0].get("id").is_none());
    }

    #[test]
    fn test_batch_sees_own_writes() {
        let codec = codec();
        let doc = codec
            .apply_patch_batch(
                &codec.empty(),
                &[
                    &TableBody::upsert(vec![record(json!({"id": 1, "body": "first"}))]),
                    &TableBody::upsert(vec![record(json!({"id": 1, "body": "second"}))]),
                    &TableBody::delete(vec![record(json!({"id": 1}))]),
                    &TableBody::upsert(vec![record(json!({"id": 1, "body": "third"}))]),
                ],
            )
            .unwrap();
        assert_eq!(doc.record_count(), 1);
        let one = doc.get_one(&record(json!({"id": 1}))).unwrap().unwrap();
        assert_eq!(one.get("body"), Some(&json!("third")));
    }

    #[test]
    fn test_make_patch_round_trip() {
        let codec = codec();
        let from = codec.from_string(
            "{\"body\":\"keep\",\"id\":1}\n{\"body\":\"drop\",\"id\":2}\n{\"body\":\"edit\",\"id\":3}",
        );
        let to = codec.from_string(
            "{\"body\":\"keep\",\"id\":1}\n{\"body\":\"edited\",\"id\":3}\n{\"body\":\"new\",\"id\":4}",
        );
        let body = codec.make_patch(&from, &to).unwrap();
        let applied = codec.apply_patch(&from, &body).unwrap();
        assert!(applied.is_equal(&to));
        assert_eq!(codec.to_string(&applied), codec.to_string(&to));
    }

    #[test]
    fn test_make_patch_delete_before_upsert() {
        let codec = codec();
        let from = codec.from_string("{\"body\":\"a\",\"id\":1}");
        let to = codec.from_string("{\"body\":\"b\",\"id\":2}");
        let body = codec.make_patch(&from, &to).unwrap();
        assert!(matches!(body.0.as_slice(), [TableOp::Delete(_), TableOp::Upsert(_)]));
    }

    #[test]
    fn test_make_patch_equal_docs_empty() {
        let codec = codec();
        let doc = codec.from_string("{\"body\":\"a\",\"id\":1}");
        let body = codec.make_patch(&doc, &doc.clone()).unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn test_is_equal_order_insensitive() {
        let codec = codec();
        let a = codec.from_string("{\"body\":\"x\",\"id\":1}\n{\"body\":\"y\",\"id\":2}");
        let b = codec.from_string("{\"body\":\"y\",\"id\":2}\n{\"body\":\"x\",\"id\":1}");
        assert!(a.is_equal(&b));
    }

    #[test]
    fn test_body_wire_shape() {
        let body = TableBody(vec![
            TableOp::Upsert(vec![record(json!({"id": 1, "body": "hello"}))]),
            TableOp::Delete(vec![record(json!({"id": 2}))]),
        ]);
        let json = serde_json::to_value(&body).unwrap();
        let flat = json.as_array().unwrap();
        assert_eq!(flat.len(), 4);
        assert_eq!(flat[0], json!(1));
        assert!(flat[1].is_array());
        assert_eq!(flat[2], json!(-1));
        assert!(flat[3].is_array());

        let back: TableBody = serde_json::from_value(json).unwrap();
        assert_eq!(back, body);
    }

    #[test]
    fn test_body_rejects_odd_length() {
        let result: Result<TableBody, _> = serde_json::from_value(json!([1]));
        assert!(result.is_err());
    }

    #[test]
    fn test_body_rejects_unknown_tag() {
        let result: Result<TableBody, _> = serde_json::from_value(json!([2, []]));
        assert!(result.is_err());
    }

    #[test]
    fn test_compound_primary_keys() {
        let codec = TableCodec::new(TableConfig::new(["org", "id"])).unwrap();
        let doc = codec
            .apply_patch(
                &codec.empty(),
                &TableBody::upsert(vec![
                    record(json!({"org": "a", "id": 1, "v": 1})),
                    record(json!({"org": "a", "id": 2, "v": 2})),
                    record(json!({"org": "b", "id": 1, "v": 3})),
                ]),
            )
            .unwrap();
        let matches = doc.select(&record(json!({"org": "a", "id": 1}))).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].get("v"), Some(&json!(1)));

        let org_a = doc.select(&record(json!({"org": "a"}))).unwrap();
        assert_eq!(org_a.len(), 2);
    }
}
