use std::collections::btree_map::{self, BTreeMap};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use super::value::FieldValue;

static NULL: FieldValue = FieldValue::Null;

/// Flat key/value view of one scope instance.
///
/// Nested JSON objects are flattened into dotted keys (`proveedor.cuit`)
/// on ingestion and rebuilt on output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldStore {
    fields: BTreeMap<String, FieldValue>,
}

impl FieldStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from a JSON object, flattening nested objects.
    pub fn from_json_object(object: &Map<String, Value>) -> Self {
        let mut store = Self::new();
        for (key, value) in object {
            store.ingest(key.clone(), value);
        }
        store
    }

    fn ingest(&mut self, key: String, value: &Value) {
        match value {
            Value::Object(children) if !children.is_empty() => {
                for (child_key, child) in children {
                    self.ingest(format!("{}.{}", key, child_key), child);
                }
            }
            other => {
                self.fields.insert(key, FieldValue::from_json(other));
            }
        }
    }

    /// Returns the value stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// Returns the value under `key`, treating missing fields as null.
    pub fn value(&self, key: &str) -> &FieldValue {
        self.fields.get(key).unwrap_or(&NULL)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Inserts or overwrites `key`, returning the previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Option<FieldValue> {
        self.fields.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<FieldValue> {
        self.fields.remove(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, FieldValue> {
        self.fields.iter()
    }

    /// Rebuilds nested JSON from the dotted keys.
    ///
    /// A dotted key whose prefix is already a scalar is emitted verbatim.
    pub fn to_json(&self) -> Value {
        let mut root = Map::new();
        for (key, value) in &self.fields {
            if !insert_nested(&mut root, key, value.to_json()) {
                root.insert(key.clone(), value.to_json());
            }
        }
        Value::Object(root)
    }
}

fn insert_nested(root: &mut Map<String, Value>, key: &str, value: Value) -> bool {
    let mut segments: Vec<&str> = key.split('.').collect();
    let last = match segments.pop() {
        Some(last) => last,
        None => return false,
    };

    let mut current = root;
    for segment in segments {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        match entry {
            Value::Object(map) => current = map,
            _ => return false,
        }
    }

    if current.contains_key(last) && current[last].is_object() {
        return false;
    }
    current.insert(last.to_string(), value);
    true
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for FieldStore {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

impl<'a> IntoIterator for &'a FieldStore {
    type Item = (&'a String, &'a FieldValue);
    type IntoIter = btree_map::Iter<'a, String, FieldValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

impl Serialize for FieldStore {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FieldStore {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Map::<String, Value>::deserialize(deserializer)?;
        Ok(FieldStore::from_json_object(&raw))
    }
}
