use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{CompositionId, ExecutionId, Operator};

/// Mutable key/value scratchpad threaded through one execution run.
///
/// Keys are strings; values are JSON. The orchestrator owns the state for
/// the lifetime of a run; interpreters receive it by reference for the
/// duration of a single hook call only. Two concurrent runs of the same
/// composition never share an instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionState {
    data: HashMap<String, serde_json::Value>,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create state from initial data.
    pub fn from_map(data: HashMap<String, serde_json::Value>) -> Self {
        Self { data }
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Get a value as f64, if numeric.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.data.get(key).and_then(|v| v.as_f64())
    }

    /// Get a value as u64, if numeric.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.data.get(key).and_then(|v| v.as_u64())
    }

    /// Get a value as bool, if boolean.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(|v| v.as_bool())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Set a value.
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    /// Set a string value.
    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.data.remove(key)
    }

    /// Merge a JSON object map into this state (overwrites on conflict).
    pub fn merge_outputs(&mut self, outputs: &serde_json::Map<String, serde_json::Value>) {
        for (k, v) in outputs {
            self.data.insert(k.clone(), v.clone());
        }
    }

    /// Snapshot the state as a JSON object, used as primitive input.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.data
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Get the underlying data map.
    pub fn data(&self) -> &HashMap<String, serde_json::Value> {
        &self.data
    }
}

/// View handed to an interpreter hook: the node being interpreted plus the
/// run's identity and state. Valid for the duration of one hook call.
pub struct ExecutionContext<'a> {
    pub composition_id: &'a CompositionId,
    pub execution_id: &'a ExecutionId,
    pub operator: &'a Operator,
    pub state: &'a mut ExecutionState,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        composition_id: &'a CompositionId,
        execution_id: &'a ExecutionId,
        operator: &'a Operator,
        state: &'a mut ExecutionState,
    ) -> Self {
        Self {
            composition_id,
            execution_id,
            operator,
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let mut state = ExecutionState::new();
        state.set_str("phase", "analysis");
        state.set("confidence", serde_json::json!(0.92));

        assert_eq!(state.get_str("phase"), Some("analysis"));
        assert_eq!(state.get_f64("confidence"), Some(0.92));
        assert_eq!(state.get("missing"), None);
        assert!(state.contains("phase"));
    }

    #[test]
    fn test_merge_outputs_overwrites() {
        let mut state = ExecutionState::new();
        state.set_str("a", "old");

        let mut outputs = serde_json::Map::new();
        outputs.insert("a".into(), serde_json::json!("new"));
        outputs.insert("b".into(), serde_json::json!(2));
        state.merge_outputs(&outputs);

        assert_eq!(state.get_str("a"), Some("new"));
        assert_eq!(state.get_u64("b"), Some(2));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut state = ExecutionState::new();
        state.set("nested", serde_json::json!({"k": [1, 2, 3]}));

        let json = state.to_json();
        assert_eq!(json["nested"]["k"][2], serde_json::json!(3));

        let serialized = serde_json::to_string(&state).unwrap();
        let restored: ExecutionState = serde_json::from_str(&serialized).unwrap();
        assert_eq!(restored.get("nested"), state.get("nested"));
    }

    #[test]
    fn test_from_map() {
        let mut map = HashMap::new();
        map.insert("request".into(), serde_json::json!("explain module"));
        let state = ExecutionState::from_map(map);
        assert_eq!(state.get_str("request"), Some("explain module"));
    }
}
