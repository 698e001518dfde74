//! Pipeline state threaded through every stage of a run.
//!
//! The state is a schema-light key/value store over JSON values. Stages read
//! the keys their contract requires and write the keys they produce; the
//! orchestrator merges each stage's output into the running state and never
//! removes keys. A version counter is bumped on every effective change so
//! snapshots and logs can tell two captures of the same run apart.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Mapping from string keys to arbitrary JSON values, plus a change counter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    /// Number of effective writes applied to this state.
    #[serde(default)]
    version: u64,
    /// The key/value contents.
    #[serde(default)]
    values: Map<String, Value>,
}

impl PipelineState {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a state from an existing JSON object.
    pub fn from_map(values: Map<String, Value>) -> Self {
        Self { version: 0, values }
    }

    /// Builds a state from a JSON value.
    ///
    /// Accepts either a serialized `PipelineState` (exactly the keys
    /// `version`, an unsigned integer, and `values`, an object) or a bare
    /// object, which becomes the state's contents as-is. Returns `None` for
    /// anything that is not an object.
    pub fn from_json_value(value: Value) -> Option<Self> {
        let Value::Object(map) = value else {
            return None;
        };

        let is_serialized_state = map.len() == 2
            && matches!(map.get("values"), Some(Value::Object(_)))
            && map.get("version").is_some_and(Value::is_u64);

        if is_serialized_state {
            serde_json::from_value(Value::Object(map)).ok()
        } else {
            Some(Self::from_map(map))
        }
    }

    /// Builder-style insert, for seeding states in code and tests.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts or overwrites a key. Returns the previous value, if any.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        if self.values.get(&key) == Some(&value) {
            return Some(value);
        }
        self.version += 1;
        self.values.insert(key, value)
    }

    /// Merges another state into this one.
    ///
    /// Keys present in `other` overwrite or extend this state; keys missing
    /// from `other` are kept.
    pub fn merge(&mut self, other: PipelineState) {
        let mut changed = false;
        for (key, value) in other.values {
            if self.values.get(&key) != Some(&value) {
                self.values.insert(key, value);
                changed = true;
            }
        }
        if changed {
            self.version += 1;
        }
    }

    /// Consuming variant of [`merge`](Self::merge).
    pub fn merged(mut self, other: PipelineState) -> Self {
        self.merge(other);
        self
    }

    /// Returns the value for a key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Returns the value for a key if it is a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Deserializes the value for a key into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        self.values
            .get(key)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
    }

    /// Returns true if the key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Returns the keys from `keys` that are absent, preserving order.
    pub fn missing_keys(&self, keys: &[&str]) -> Vec<String> {
        keys.iter()
            .filter(|k| !self.values.contains_key(**k))
            .map(|k| k.to_string())
            .collect()
    }

    /// Iterates over the keys in insertion-independent (sorted) order.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the change counter.
    pub fn version(&self) -> u64 {
        self.version
    }

}
