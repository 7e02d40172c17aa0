// SPDX-License-Identifier: MIT

//! Payload document threaded through a run

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use super::schema::ReducerType;

/// Prefix for fields any node may emit without declaring them
pub const EXTENSION_PREFIX: &str = "x-";

/// Field name to value mapping, ordered so serialized records are stable
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload {
    fields: BTreeMap<String, Value>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from key/value pairs
    pub fn from_pairs<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self {
            fields: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Build from a JSON object; anything else is rejected
    pub fn from_json(value: Value) -> Result<Self, String> {
        match value {
            Value::Object(obj) => Ok(Self {
                fields: obj.into_iter().collect(),
            }),
            Value::Null => Ok(Self::new()),
            other => Err(format!("payload must be a JSON object, got {}", other)),
        }
    }

    /// Insert or replace a field
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    /// Merge a value into a field using a reducer
    pub fn apply(&mut self, key: &str, value: Value, reducer: ReducerType) {
        match reducer {
            ReducerType::Overwrite => {
                self.fields.insert(key.to_string(), value);
            }
            ReducerType::Append => {
                let arr = self
                    .fields
                    .entry(key.to_string())
                    .or_insert(Value::Array(vec![]));
                match arr {
                    Value::Array(a) => match value {
                        Value::Array(new_items) => a.extend(new_items),
                        other => a.push(other),
                    },
                    // Non-array seed gets replaced rather than silently kept
                    slot => *slot = Value::Array(vec![value]),
                }
            }
            ReducerType::Max | ReducerType::Min => {
                let current = self.fields.get(key).and_then(|v| v.as_f64());
                if let Some(new) = value.as_f64() {
                    let replace = match current {
                        None => true,
                        Some(cur) if reducer == ReducerType::Max => new > cur,
                        Some(cur) => new < cur,
                    };
                    if replace {
                        self.fields.insert(key.to_string(), value);
                    }
                }
            }
            ReducerType::Merge => {
                let current = self
                    .fields
                    .entry(key.to_string())
                    .or_insert(Value::Object(Map::new()));
                match (current, value) {
                    (Value::Object(current_obj), Value::Object(new_obj)) => {
                        for (k, v) in new_obj {
                            current_obj.insert(k, v);
                        }
                    }
                    (slot, other) => *slot = other,
                }
            }
        }
    }

    /// Get a field value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Get a nested field value using dot notation (e.g., "analysis.complexity")
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                other => other.get(part)?,
            };
        }
        Some(current)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    /// Copy of the payload holding only the named fields that are present
    pub fn restrict<'a, I>(&self, keys: I) -> Payload
    where
        I: IntoIterator<Item = &'a String>,
    {
        Payload {
            fields: keys
                .into_iter()
                .filter_map(|k| self.fields.get(k).map(|v| (k.clone(), v.clone())))
                .collect(),
        }
    }

    /// Field names as an ordered set
    pub fn key_set(&self) -> BTreeSet<String> {
        self.fields.keys().cloned().collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Convert payload to JSON object
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl IntoIterator for Payload {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

/// Whether a field uses the undeclared extension namespace
pub fn is_extension_field(key: &str) -> bool {
    key.starts_with(EXTENSION_PREFIX)
}
