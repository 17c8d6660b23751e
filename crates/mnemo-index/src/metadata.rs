//! Field→value→ids inverted index with ordered numeric side structures.
//!
//! Fully memory-resident; persisted as one posting file per
//! `(field, shard)` under `metadata/<field>/<shard>/000` so a warm process
//! can load the projection instead of rescanning every entity. Mutations
//! dirty the touched `(field, shard)` pairs and the facade folds the
//! rewritten files into the same commit as the entity write.

use std::collections::{BTreeMap, BTreeSet};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use mnemo_cow::{Change, CowStore};
use mnemo_error::{MnemoError, Result};
use mnemo_types::{Cx, IndexValue, OrdF64, Shard, Uid};

use crate::predicate::{FieldOp, Predicate};

#[derive(Default)]
struct FieldIndex {
    postings: HashMap<IndexValue, BTreeSet<Uid>>,
    /// Parallel ordered structure for range queries over numerics and
    /// timestamps.
    numeric: BTreeMap<OrdF64, BTreeSet<Uid>>,
}

impl FieldIndex {
    fn insert(&mut self, value: IndexValue, id: Uid) {
        if let Some(n) = value.as_num() {
            self.numeric.entry(n).or_default().insert(id);
        }
        self.postings.entry(value).or_default().insert(id);
    }

    fn remove(&mut self, value: &IndexValue, id: Uid) {
        if let Some(n) = value.as_num() {
            if let Some(set) = self.numeric.get_mut(&n) {
                set.remove(&id);
                if set.is_empty() {
                    self.numeric.remove(&n);
                }
            }
        }
        if let Some(set) = self.postings.get_mut(value) {
            set.remove(&id);
            if set.is_empty() {
                self.postings.remove(value);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.postings.is_empty()
    }

    fn ids_with_value(&self) -> BTreeSet<Uid> {
        self.postings.values().flatten().copied().collect()
    }
}

/// Serialized form of one `(field, shard)` posting file.
#[derive(Debug, Serialize, Deserialize)]
struct PostingFile {
    field: String,
    shard: String,
    values: Vec<PostingEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PostingEntry {
    value: serde_json::Value,
    ids: Vec<Uid>,
}

/// The metadata inverted index.
#[derive(Default)]
pub struct MetadataIndex {
    fields: HashMap<String, FieldIndex>,
    all_ids: BTreeSet<Uid>,
    dirty: BTreeSet<(String, Shard)>,
}

impl MetadataIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.all_ids.len()
    }

    /// Whether any entity is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.all_ids.is_empty()
    }

    /// Drop all state (rebuild preamble).
    pub fn clear(&mut self) {
        self.fields.clear();
        self.all_ids.clear();
        self.dirty.clear();
    }

    /// Index an entity's flattened field entries.
    pub fn insert(&mut self, id: Uid, entries: &[(String, IndexValue)]) {
        self.all_ids.insert(id);
        for (field, value) in entries {
            self.fields
                .entry(field.clone())
                .or_default()
                .insert(value.clone(), id);
            self.dirty.insert((field.clone(), id.shard()));
        }
    }

    /// Remove an entity's flattened field entries.
    pub fn remove(&mut self, id: Uid, entries: &[(String, IndexValue)]) {
        self.all_ids.remove(&id);
        for (field, value) in entries {
            if let Some(index) = self.fields.get_mut(field) {
                index.remove(value, id);
                if index.is_empty() {
                    self.fields.remove(field);
                }
            }
            self.dirty.insert((field.clone(), id.shard()));
        }
    }

    /// Candidate ids matching a predicate tree.
    pub fn eval(&self, predicate: &Predicate) -> Result<BTreeSet<Uid>> {
        match predicate {
            Predicate::All(parts) => {
                let mut out: Option<BTreeSet<Uid>> = None;
                for part in parts {
                    let set = self.eval(part)?;
                    out = Some(match out {
                        None => set,
                        Some(acc) => acc.intersection(&set).copied().collect(),
                    });
                    if out.as_ref().is_some_and(BTreeSet::is_empty) {
                        break;
                    }
                }
                Ok(out.unwrap_or_else(|| self.all_ids.clone()))
            }
            Predicate::Any(parts) => {
                let mut out = BTreeSet::new();
                for part in parts {
                    out.extend(self.eval(part)?);
                }
                Ok(out)
            }
            Predicate::None(parts) => {
                let mut excluded = BTreeSet::new();
                for part in parts {
                    excluded.extend(self.eval(part)?);
                }
                Ok(self.all_ids.difference(&excluded).copied().collect())
            }
            Predicate::Field { path, op } => Ok(self.eval_field(path, op)),
        }
    }

    fn eval_field(&self, path: &str, op: &FieldOp) -> BTreeSet<Uid> {
        let Some(field) = self.fields.get(path) else {
            // Absent field: only negative operators match anything.
            return match op {
                FieldOp::NotEquals(_) | FieldOp::NotIn(_) | FieldOp::Exists(false) => {
                    self.all_ids.clone()
                }
                _ => BTreeSet::new(),
            };
        };
        match op {
            FieldOp::Equals(v) => field.postings.get(v).cloned().unwrap_or_default(),
            FieldOp::NotEquals(v) => {
                let matching = field.postings.get(v).cloned().unwrap_or_default();
                self.all_ids.difference(&matching).copied().collect()
            }
            FieldOp::Greater(bound) => Self::range(
                field,
                (std::ops::Bound::Excluded(*bound), std::ops::Bound::Unbounded),
            ),
            FieldOp::GreaterEqual(bound) => Self::range(
                field,
                (std::ops::Bound::Included(*bound), std::ops::Bound::Unbounded),
            ),
            FieldOp::Less(bound) => Self::range(
                field,
                (std::ops::Bound::Unbounded, std::ops::Bound::Excluded(*bound)),
            ),
            FieldOp::LessEqual(bound) => Self::range(
                field,
                (std::ops::Bound::Unbounded, std::ops::Bound::Included(*bound)),
            ),
            FieldOp::In(values) => {
                let mut out = BTreeSet::new();
                for v in values {
                    if let Some(set) = field.postings.get(v) {
                        out.extend(set.iter().copied());
                    }
                }
                out
            }
            FieldOp::NotIn(values) => {
                let mut matching = BTreeSet::new();
                for v in values {
                    if let Some(set) = field.postings.get(v) {
                        matching.extend(set.iter().copied());
                    }
                }
                self.all_ids.difference(&matching).copied().collect()
            }
            FieldOp::Contains(needle) => match needle {
                // Substring over string values; exact match doubles as
                // array-element containment since arrays flatten.
                IndexValue::Str(s) => field
                    .postings
                    .iter()
                    .filter(|(value, _)| {
                        value.as_str().is_some_and(|text| text.contains(s.as_str()))
                    })
                    .flat_map(|(_, ids)| ids.iter().copied())
                    .collect(),
                other => field.postings.get(other).cloned().unwrap_or_default(),
            },
            FieldOp::StartsWith(prefix) => field
                .postings
                .iter()
                .filter(|(value, _)| {
                    value.as_str().is_some_and(|text| text.starts_with(prefix))
                })
                .flat_map(|(_, ids)| ids.iter().copied())
                .collect(),
            FieldOp::EndsWith(suffix) => field
                .postings
                .iter()
                .filter(|(value, _)| value.as_str().is_some_and(|text| text.ends_with(suffix)))
                .flat_map(|(_, ids)| ids.iter().copied())
                .collect(),
            FieldOp::Exists(true) => field.ids_with_value(),
            FieldOp::Exists(false) => {
                let present = field.ids_with_value();
                self.all_ids.difference(&present).copied().collect()
            }
            FieldOp::Regex(pattern) => {
                // Validated at parse time; a failure here means the pattern
                // was constructed out-of-band.
                let Ok(re) = regex::Regex::new(pattern) else {
                    return BTreeSet::new();
                };
                field
                    .postings
                    .iter()
                    .filter(|(value, _)| value.as_str().is_some_and(|text| re.is_match(text)))
                    .flat_map(|(_, ids)| ids.iter().copied())
                    .collect()
            }
        }
    }

    fn range(
        field: &FieldIndex,
        bounds: (std::ops::Bound<OrdF64>, std::ops::Bound<OrdF64>),
    ) -> BTreeSet<Uid> {
        field
            .numeric
            .range(bounds)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Logical path of a posting file.
    #[must_use]
    pub fn posting_path(field: &str, shard: Shard) -> String {
        format!("metadata/{field}/{shard}/000")
    }

    /// Drain dirty `(field, shard)` pairs into COW changes.
    pub fn take_dirty_changes(&mut self) -> Result<Vec<Change>> {
        let dirty = std::mem::take(&mut self.dirty);
        let mut changes = Vec::with_capacity(dirty.len());
        for (field, shard) in dirty {
            let path = Self::posting_path(&field, shard);
            let Some(index) = self.fields.get(&field) else {
                changes.push(Change::delete(path));
                continue;
            };
            let mut values: Vec<PostingEntry> = Vec::new();
            // Deterministic file bytes: values in IndexValue order.
            let mut ordered: Vec<(&IndexValue, &BTreeSet<Uid>)> =
                index.postings.iter().collect();
            ordered.sort_by(|a, b| a.0.cmp(b.0));
            for (value, ids) in ordered {
                let shard_ids: Vec<Uid> = ids
                    .iter()
                    .filter(|id| id.shard() == shard)
                    .copied()
                    .collect();
                if !shard_ids.is_empty() {
                    values.push(PostingEntry {
                        value: value.to_json(),
                        ids: shard_ids,
                    });
                }
            }
            if values.is_empty() {
                changes.push(Change::delete(path));
            } else {
                let file = PostingFile {
                    field: field.clone(),
                    shard: shard.to_string(),
                    values,
                };
                let bytes = serde_json::to_vec(&file).map_err(MnemoError::internal)?;
                changes.push(Change::put(path, bytes));
            }
        }
        Ok(changes)
    }

    /// Load the persisted projection. Returns the number of posting files
    /// read; the caller decides whether that constitutes a warm start.
    pub fn load_projection(&mut self, cx: &Cx, store: &CowStore) -> Result<usize> {
        self.clear();
        let mut offset = 0_usize;
        let mut files = 0_usize;
        loop {
            let paths = store.scan_paths(cx, "metadata/", offset, 512)?;
            if paths.is_empty() {
                break;
            }
            offset += paths.len();
            for path in &paths {
                let bytes = store.lookup(cx, path)?;
                let file: PostingFile =
                    serde_json::from_slice(&bytes).map_err(|err| MnemoError::Integrity {
                        what: "posting file",
                        detail: format!("{path}: {err}"),
                    })?;
                for entry in file.values {
                    let Some(value) = IndexValue::from_json(&entry.value) else {
                        continue;
                    };
                    let index = self.fields.entry(file.field.clone()).or_default();
                    for id in entry.ids {
                        index.insert(value.clone(), id);
                        self.all_ids.insert(id);
                    }
                }
                files += 1;
            }
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_types::value::flatten_metadata;
    use serde_json::json;

    fn uid(n: u8) -> Uid {
        Uid::from_bytes([n; 16])
    }

    fn entries(meta: serde_json::Value) -> Vec<(String, IndexValue)> {
        let serde_json::Value::Object(map) = meta else {
            panic!("metadata must be an object")
        };
        flatten_metadata(&map)
    }

    fn parse(clause: serde_json::Value) -> Predicate {
        Predicate::parse(&clause, true).unwrap()
    }

    fn index_with_people() -> MetadataIndex {
        let mut index = MetadataIndex::new();
        index.insert(
            uid(1),
            &entries(json!({"type": "Person", "name": "Alice", "age": 34, "tags": ["pm", "eng"]})),
        );
        index.insert(
            uid(2),
            &entries(json!({"type": "Person", "name": "Bob", "age": 19})),
        );
        index.insert(
            uid(3),
            &entries(json!({"type": "Org", "name": "Acme", "address": {"city": "Lisbon"}})),
        );
        index
    }

    #[test]
    fn test_equals_and_implicit_type_field() {
        let index = index_with_people();
        let hits = index.eval(&parse(json!({"type": "Person"}))).unwrap();
        assert_eq!(hits, BTreeSet::from([uid(1), uid(2)]));
    }

    #[test]
    fn test_not_equals_uses_universe() {
        let index = index_with_people();
        let hits = index
            .eval(&parse(json!({"name": {"notEquals": "Alice"}})))
            .unwrap();
        assert_eq!(hits, BTreeSet::from([uid(2), uid(3)]));
    }

    #[test]
    fn test_numeric_range() {
        let index = index_with_people();
        let hits = index
            .eval(&parse(json!({"age": {"greaterEqual": 20, "less": 40}})))
            .unwrap();
        assert_eq!(hits, BTreeSet::from([uid(1)]), "case=half_open_range");
    }

    #[test]
    fn test_in_and_not_in() {
        let index = index_with_people();
        let hits = index
            .eval(&parse(json!({"name": {"in": ["Alice", "Acme"]}})))
            .unwrap();
        assert_eq!(hits, BTreeSet::from([uid(1), uid(3)]));
        let others = index
            .eval(&parse(json!({"name": {"notIn": ["Alice", "Acme"]}})))
            .unwrap();
        assert_eq!(others, BTreeSet::from([uid(2)]));
    }

    #[test]
    fn test_contains_array_membership() {
        let index = index_with_people();
        let hits = index
            .eval(&parse(json!({"tags": {"contains": "pm"}})))
            .unwrap();
        assert_eq!(hits, BTreeSet::from([uid(1)]), "case=array_element");
    }

    #[test]
    fn test_contains_substring() {
        let index = index_with_people();
        let hits = index
            .eval(&parse(json!({"name": {"contains": "li"}})))
            .unwrap();
        assert_eq!(hits, BTreeSet::from([uid(1)]), "case=substring_alice");
    }

    #[test]
    fn test_starts_and_ends_with() {
        let index = index_with_people();
        let starts = index
            .eval(&parse(json!({"name": {"startsWith": "A"}})))
            .unwrap();
        assert_eq!(starts, BTreeSet::from([uid(1), uid(3)]));
        let ends = index
            .eval(&parse(json!({"name": {"endsWith": "ob"}})))
            .unwrap();
        assert_eq!(ends, BTreeSet::from([uid(2)]));
    }

    #[test]
    fn test_exists_and_absent_field() {
        let index = index_with_people();
        let with_age = index
            .eval(&parse(json!({"age": {"exists": true}})))
            .unwrap();
        assert_eq!(with_age, BTreeSet::from([uid(1), uid(2)]));
        let without = index
            .eval(&parse(json!({"age": {"exists": false}})))
            .unwrap();
        assert_eq!(without, BTreeSet::from([uid(3)]));
        let nothing = index.eval(&parse(json!({"ghost": "x"}))).unwrap();
        assert!(nothing.is_empty(), "case=absent_field_empty");
    }

    #[test]
    fn test_dotted_path_lookup() {
        let index = index_with_people();
        let hits = index
            .eval(&parse(json!({"address.city": "Lisbon"})))
            .unwrap();
        assert_eq!(hits, BTreeSet::from([uid(3)]));
    }

    #[test]
    fn test_regex_operator() {
        let index = index_with_people();
        let hits = index
            .eval(&parse(json!({"name": {"regex": "^A.*e$"}})))
            .unwrap();
        assert_eq!(hits, BTreeSet::from([uid(1), uid(3)]), "case=alice_acme");
    }

    #[test]
    fn test_combinators() {
        let index = index_with_people();
        let hits = index
            .eval(&parse(json!({
                "anyOf": [
                    {"name": "Bob"},
                    {"address.city": "Lisbon"}
                ]
            })))
            .unwrap();
        assert_eq!(hits, BTreeSet::from([uid(2), uid(3)]));
        let none = index
            .eval(&parse(json!({"noneOf": [{"type": "Person"}]})))
            .unwrap();
        assert_eq!(none, BTreeSet::from([uid(3)]));
    }

    #[test]
    fn test_remove_unindexes_everywhere() {
        let mut index = index_with_people();
        let alice = entries(
            json!({"type": "Person", "name": "Alice", "age": 34, "tags": ["pm", "eng"]}),
        );
        index.remove(uid(1), &alice);
        assert_eq!(index.len(), 2);
        assert!(
            index
                .eval(&parse(json!({"name": "Alice"})))
                .unwrap()
                .is_empty(),
            "case=postings_gone"
        );
        assert!(
            index
                .eval(&parse(json!({"age": {"greater": 30}})))
                .unwrap()
                .is_empty(),
            "case=numeric_gone"
        );
    }

    #[test]
    fn test_projection_round_trip() {
        use mnemo_backend::MemoryBackend;
        use mnemo_cow::CowConfig;
        use std::sync::Arc;

        let mut index = index_with_people();
        let store = CowStore::open(
            Arc::new(MemoryBackend::new()),
            Arc::new(mnemo_types::SystemClock),
            CowConfig::default(),
        );
        let cx = Cx::new();
        let changes = index.take_dirty_changes().unwrap();
        assert!(!changes.is_empty());
        store.commit(&cx, changes).unwrap();

        let mut restored = MetadataIndex::new();
        let files = restored.load_projection(&cx, &store).unwrap();
        assert!(files > 0, "case=files_loaded");
        assert_eq!(restored.len(), 3);
        for clause in [
            json!({"type": "Person"}),
            json!({"age": {"greaterEqual": 20, "less": 40}}),
            json!({"tags": {"contains": "pm"}}),
            json!({"address.city": "Lisbon"}),
        ] {
            assert_eq!(
                restored.eval(&parse(clause.clone())).unwrap(),
                index.eval(&parse(clause)).unwrap(),
                "case=projection_equivalence"
            );
        }
    }

    #[test]
    fn test_dirty_shard_tracking_and_tombstones() {
        let mut index = MetadataIndex::new();
        let meta = entries(json!({"name": "Zed"}));
        index.insert(uid(9), &meta);
        let _ = index.take_dirty_changes().unwrap();
        index.remove(uid(9), &meta);
        let changes = index.take_dirty_changes().unwrap();
        assert_eq!(changes.len(), 1);
        assert!(
            matches!(changes[0].op, mnemo_cow::ChangeOp::Delete),
            "case=empty_shard_tombstoned"
        );
    }
}
