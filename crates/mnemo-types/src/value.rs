//! Metadata value handling: index scalars, dotted-path flattening, and the
//! canonical JSON byte form used for hashing.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde_json::{Map, Value};

/// An `f64` with total ordering and hashing, for numeric postings.
#[derive(Debug, Clone, Copy)]
pub struct OrdF64(f64);

impl OrdF64 {
    /// Wrap a float, normalizing `-0.0` to `0.0` so equal keys hash equally.
    #[must_use]
    pub fn new(v: f64) -> Self {
        if v == 0.0 { Self(0.0) } else { Self(v) }
    }

    /// The wrapped value.
    #[must_use]
    pub const fn get(&self) -> f64 {
        self.0
    }
}

impl PartialEq for OrdF64 {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for OrdF64 {}

impl PartialOrd for OrdF64 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdF64 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for OrdF64 {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl fmt::Display for OrdF64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A scalar usable as a posting key. Objects and arrays never appear here;
/// flattening reduces them to scalars first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexValue {
    Null,
    Bool(bool),
    Num(OrdF64),
    Str(String),
}

impl IndexValue {
    /// Convert a JSON scalar; `None` for objects and arrays.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Self::Null),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n.as_f64().map(|f| Self::Num(OrdF64::new(f))),
            Value::String(s) => Some(Self::Str(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// The numeric value when this scalar is a number or timestamp.
    #[must_use]
    pub const fn as_num(&self) -> Option<OrdF64> {
        match self {
            Self::Num(n) => Some(*n),
            _ => None,
        }
    }

    /// The string value when this scalar is textual.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Render to JSON for posting-file persistence.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Num(n) => serde_json::Number::from_f64(n.get())
                .map_or(Value::Null, Value::Number),
            Self::Str(s) => Value::String(s.clone()),
        }
    }
}

/// Flatten a metadata map into `(dotted path, scalar)` pairs.
///
/// Nested objects extend the path with `.`; arrays flatten element-wise
/// under the parent field so containment queries become posting lookups.
#[must_use]
pub fn flatten_metadata(metadata: &Map<String, Value>) -> Vec<(String, IndexValue)> {
    let mut out = Vec::new();
    for (key, value) in metadata {
        flatten_into(key, value, &mut out);
    }
    out
}

fn flatten_into(path: &str, value: &Value, out: &mut Vec<(String, IndexValue)>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                flatten_into(&format!("{path}.{key}"), nested, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                flatten_into(path, item, out);
            }
        }
        scalar => {
            if let Some(iv) = IndexValue::from_json(scalar) {
                out.push((path.to_owned(), iv));
            }
        }
    }
}

/// Serialize JSON with recursively sorted object keys, the form that feeds
/// content digests. UTF-8, no insignificant whitespace.
#[must_use]
pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                // Object keys are JSON strings; reuse serde's escaping.
                out.extend_from_slice(
                    serde_json::to_string(key).unwrap_or_default().as_bytes(),
                );
                out.push(b':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => {
            out.extend_from_slice(
                serde_json::to_string(scalar).unwrap_or_default().as_bytes(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flatten_nested_objects_use_dotted_paths() {
        let meta = json!({
            "address": {"city": "Lisbon", "zip": "1100"},
            "age": 34
        });
        let Value::Object(map) = meta else { unreachable!() };
        let mut flat = flatten_metadata(&map);
        flat.sort();
        assert_eq!(
            flat,
            vec![
                ("address.city".to_owned(), IndexValue::Str("Lisbon".into())),
                ("address.zip".to_owned(), IndexValue::Str("1100".into())),
                ("age".to_owned(), IndexValue::Num(OrdF64::new(34.0))),
            ]
        );
    }

    #[test]
    fn test_flatten_arrays_element_wise() {
        let meta = json!({"tags": ["a", "b", "a"]});
        let Value::Object(map) = meta else { unreachable!() };
        let flat = flatten_metadata(&map);
        assert_eq!(flat.len(), 3, "case=duplicates_kept");
        assert!(
            flat.iter()
                .all(|(path, _)| path == "tags"),
            "case=parent_field_path"
        );
    }

    #[test]
    fn test_flatten_array_of_objects() {
        let meta = json!({"contacts": [{"name": "A"}, {"name": "B"}]});
        let Value::Object(map) = meta else { unreachable!() };
        let mut flat = flatten_metadata(&map);
        flat.sort();
        assert_eq!(flat[0].0, "contacts.name");
        assert_eq!(flat.len(), 2);
    }

    #[test]
    fn test_canonical_bytes_sort_keys_recursively() {
        let a = json!({"b": {"z": 1, "a": 2}, "a": true});
        let b = json!({"a": true, "b": {"a": 2, "z": 1}});
        assert_eq!(
            canonical_json_bytes(&a),
            canonical_json_bytes(&b),
            "case=order_independent"
        );
        assert_eq!(
            String::from_utf8(canonical_json_bytes(&a)).unwrap(),
            r#"{"a":true,"b":{"a":2,"z":1}}"#
        );
    }

    #[test]
    fn test_canonical_bytes_preserve_array_order() {
        let a = json!([3, 1, 2]);
        assert_eq!(String::from_utf8(canonical_json_bytes(&a)).unwrap(), "[3,1,2]");
    }

    #[test]
    fn test_ord_f64_negative_zero() {
        assert_eq!(OrdF64::new(-0.0), OrdF64::new(0.0));
        let mut set = std::collections::HashSet::new();
        set.insert(OrdF64::new(-0.0));
        assert!(set.contains(&OrdF64::new(0.0)), "case=hash_consistent");
    }

    #[test]
    fn test_index_value_ordering_groups_types() {
        let mut values = vec![
            IndexValue::Str("a".into()),
            IndexValue::Num(OrdF64::new(2.0)),
            IndexValue::Null,
            IndexValue::Num(OrdF64::new(1.0)),
            IndexValue::Bool(true),
        ];
        values.sort();
        assert_eq!(values[0], IndexValue::Null, "case=null_first");
        let nums: Vec<f64> = values
            .iter()
            .filter_map(|v| v.as_num().map(|n| n.get()))
            .collect();
        assert_eq!(nums, vec![1.0, 2.0], "case=numeric_order");
    }
}
