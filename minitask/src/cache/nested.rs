//! Nested key/value storage over JSON objects.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A JSON object addressed by key paths such as `["task", "md5"]`.
///
/// Writes create intermediate objects as needed, replacing any scalar that
/// sits where an object is required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NestedMap(Map<String, Value>);

impl NestedMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value at `key`, if every level exists.
    #[must_use]
    pub fn get(&self, key: &[&str]) -> Option<&Value> {
        let (first, rest) = key.split_first()?;
        rest.iter()
            .try_fold(self.0.get(*first)?, |node, part| node.as_object()?.get(*part))
    }

    /// Stores `value` at `key` and returns what it replaced. An empty key is
    /// ignored.
    pub fn set(&mut self, key: &[&str], value: Value) -> Option<Value> {
        let (last, parents) = key.split_last()?;
        let mut node = &mut self.0;
        for part in parents {
            let slot = node
                .entry((*part).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            let Value::Object(child) = slot else {
                return None;
            };
            node = child;
        }
        node.insert((*last).to_string(), value)
    }

    /// Removes and returns the value at `key`.
    pub fn remove(&mut self, key: &[&str]) -> Option<Value> {
        let (last, parents) = key.split_last()?;
        let mut node = &mut self.0;
        for part in parents {
            node = node.get_mut(*part)?.as_object_mut()?;
        }
        node.remove(*last)
    }

    /// Returns true when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every string stored anywhere in the map.
    #[must_use]
    pub fn string_leaves(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.0.values().for_each(|v| collect_strings(v, &mut out));
        out
    }
}

/// Every string inside `value`, at any depth.
#[must_use]
pub(crate) fn strings_in(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_strings(value, &mut out);
    out
}

fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

impl From<Map<String, Value>> for NestedMap {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
