use crate::{FlowError, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Conventional key under which a free-form query is placed.
pub const QUERY_KEY: &str = "user_query";

/// Key/value mapping threaded through one orchestration run.
///
/// Composers are the only writers; steps receive a resolved view of their
/// declared inputs and hand back a single output value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharedState {
    entries: BTreeMap<String, Value>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// State holding only `query` under [`QUERY_KEY`].
    pub fn from_query(query: impl Into<String>) -> Self {
        let mut state = Self::new();
        state.insert(QUERY_KEY, Value::String(query.into()));
        state
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Last write wins.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.entries.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    /// Look up a key a step declared as required.
    pub fn require(&self, step: &str, key: &str) -> Result<&Value, FlowError> {
        self.entries.get(key).ok_or_else(|| FlowError::MissingInput {
            step: step.to_string(),
            key: key.to_string(),
        })
    }

    /// True when `key` holds a truthy value.
    pub fn flag(&self, key: &str) -> bool {
        self.entries.get(key).is_some_and(Value::is_truthy)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge every entry of `delta` into this state.
    pub fn merge(&mut self, delta: SharedState) {
        self.entries.extend(delta.entries);
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.entries
    }
}

impl From<BTreeMap<String, Value>> for SharedState {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Self { entries }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for SharedState {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
