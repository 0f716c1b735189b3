//! Reconciliation policies: merge a partition's fresh state with the state
//! rehydrated from storage.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Strategy for combining incoming (fresh) state with rehydrated state.
///
/// Closures `Fn(&Value, Value) -> Value` implement this trait.
pub trait ReconciliationPolicy: Send + Sync {
    fn reconcile(&self, incoming: &Value, rehydrated: Value) -> Value;

    /// Name used in logs.
    fn name(&self) -> &'static str {
        "custom"
    }
}

impl<F> ReconciliationPolicy for F
where
    F: Fn(&Value, Value) -> Value + Send + Sync,
{
    fn reconcile(&self, incoming: &Value, rehydrated: Value) -> Value {
        self(incoming, rehydrated)
    }
}

/// Hard overwrite: the rehydrated state replaces the incoming state
/// wholesale. Fields only present in the fresh state are not kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct HardSet;

impl ReconciliationPolicy for HardSet {
    fn reconcile(&self, _incoming: &Value, rehydrated: Value) -> Value {
        rehydrated
    }

    fn name(&self) -> &'static str {
        "hard_set"
    }
}

/// Shallow merge: top-level keys from the rehydrated object replace the
/// same keys of the incoming object; other incoming keys survive.
/// Non-object states fall back to a hard overwrite.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoMergeLevel1;

impl ReconciliationPolicy for AutoMergeLevel1 {
    fn reconcile(&self, incoming: &Value, rehydrated: Value) -> Value {
        match (incoming, rehydrated) {
            (Value::Object(fresh), Value::Object(stored)) => {
                let mut merged = fresh.clone();
                merged.extend(stored);
                Value::Object(merged)
            }
            (_, stored) => stored,
        }
    }

    fn name(&self) -> &'static str {
        "auto_merge_level1"
    }
}

/// Two-level merge: like [`AutoMergeLevel1`], but when both sides hold an
/// object under the same key, those objects are shallow-merged too.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoMergeLevel2;

impl ReconciliationPolicy for AutoMergeLevel2 {
    fn reconcile(&self, incoming: &Value, rehydrated: Value) -> Value {
        match (incoming, rehydrated) {
            (Value::Object(fresh), Value::Object(stored)) => {
                let mut merged = fresh.clone();
                for (key, value) in stored {
                    let next = match fresh.get(&key) {
                        Some(nested @ Value::Object(_)) => AutoMergeLevel1.reconcile(nested, value),
                        _ => value,
                    };
                    merged.insert(key, next);
                }
                Value::Object(merged)
            }
            (_, stored) => stored,
        }
    }

    fn name(&self) -> &'static str {
        "auto_merge_level2"
    }
}

/// Built-in policies by name, for configuration files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    HardSet,
    AutoMergeLevel1,
    AutoMergeLevel2,
}

impl PolicyKind {
    pub fn into_policy(self) -> Arc<dyn ReconciliationPolicy> {
        match self {
            Self::HardSet => Arc::new(HardSet),
            Self::AutoMergeLevel1 => Arc::new(AutoMergeLevel1),
            Self::AutoMergeLevel2 => Arc::new(AutoMergeLevel2),
        }
    }
}
