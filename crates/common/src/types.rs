use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

/// Errors from constructing a [`PartitionName`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionNameError {
    #[error("partition name must not be empty")]
    Empty,
    #[error("partition name {0:?} contains whitespace")]
    Whitespace(String),
}

/// Identity of a state partition inside the combined state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartitionName(String);

impl PartitionName {
    /// Validate and wrap a partition name.
    pub fn new(name: impl Into<String>) -> Result<Self, PartitionNameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(PartitionNameError::Empty);
        }
        if name.chars().any(char::is_whitespace) {
            return Err(PartitionNameError::Whitespace(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PartitionName {
    type Error = PartitionNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for PartitionName {
    type Error = PartitionNameError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PartitionName> for String {
    fn from(name: PartitionName) -> Self {
        name.0
    }
}

impl Borrow<str> for PartitionName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An event dispatched to every registered partition.
///
/// Serialized as a flat tagged record: `{ "type": "...", ...payload }`.
/// Partitions must return their input state unchanged for types they do not
/// recognize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Event {
    /// Create an event with an empty payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Map::new(),
        }
    }

    /// Add a payload field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

/// The whole application state: partition name to that partition's state.
///
/// Uses BTreeMap so iteration and serialization order are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CombinedState {
    slices: BTreeMap<PartitionName, Value>,
}

impl CombinedState {
    /// Create an empty combined state.
    pub fn new() -> Self {
        Self::default()
    }

    /// State of a single partition, if present.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.slices.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slices.contains_key(name)
    }

    /// Insert or replace a partition slice. Returns the previous slice.
    pub fn insert(&mut self, name: PartitionName, state: Value) -> Option<Value> {
        self.slices.insert(name, state)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.slices.remove(name)
    }

    /// Number of partition slices.
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Partition names in deterministic order.
    pub fn names(&self) -> impl Iterator<Item = &PartitionName> {
        self.slices.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PartitionName, &Value)> {
        self.slices.iter()
    }

    /// Render the combined state as a single JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.slices
                .iter()
                .map(|(name, state)| (name.as_str().to_owned(), state.clone()))
                .collect(),
        )
    }
}

impl FromIterator<(PartitionName, Value)> for CombinedState {
    fn from_iter<I: IntoIterator<Item = (PartitionName, Value)>>(iter: I) -> Self {
        Self {
            slices: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn partition_name_rejects_empty_and_whitespace() {
        assert_eq!(PartitionName::new(""), Err(PartitionNameError::Empty));
        assert!(matches!(
            PartitionName::new("two words"),
            Err(PartitionNameError::Whitespace(_))
        ));
        assert_eq!(PartitionName::new("location").unwrap().as_str(), "location");
    }

    #[test]
    fn partition_name_deserialize_is_validated() {
        let ok: PartitionName = serde_json::from_value(json!("form")).unwrap();
        assert_eq!(ok.to_string(), "form");
        assert!(serde_json::from_value::<PartitionName>(json!("")).is_err());
    }

    #[test]
    fn event_serializes_as_flat_tagged_record() {
        let event = Event::new("todos/add").with("text", "milk").with("id", 3);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({"type": "todos/add", "text": "milk", "id": 3}));

        let back: Event = serde_json::from_value(value).unwrap();
        assert!(back.is("todos/add"));
        assert_eq!(back.get("id"), Some(&json!(3)));
    }

    #[test]
    fn combined_state_lookup_by_str() {
        let mut state = CombinedState::new();
        state.insert(PartitionName::new("b").unwrap(), json!(2));
        state.insert(PartitionName::new("a").unwrap(), json!(1));

        assert_eq!(state.get("a"), Some(&json!(1)));
        assert!(!state.contains("c"));
        let names: Vec<&str> = state.names().map(PartitionName::as_str).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(state.to_value(), json!({"a": 1, "b": 2}));
    }
}
