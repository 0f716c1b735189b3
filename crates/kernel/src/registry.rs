use crate::reducer::{ReduceError, Reducer};
use rootstore_common::{CombinedState, Event, PartitionName};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

type PartitionMap = BTreeMap<PartitionName, Arc<dyn Reducer>>;

/// The live mapping from partition name to reducer.
///
/// Uses BTreeMap so the combined reducer visits partitions in a stable order.
#[derive(Clone, Default)]
pub struct Registry {
    partitions: PartitionMap,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a partition, replacing any partition with the same name.
    /// Returns the replaced reducer.
    pub fn insert(
        &mut self,
        name: PartitionName,
        reducer: Arc<dyn Reducer>,
    ) -> Option<Arc<dyn Reducer>> {
        self.partitions.insert(name, reducer)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Reducer>> {
        self.partitions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.partitions.contains_key(name)
    }

    /// Number of registered partitions.
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Registered names in deterministic order.
    pub fn names(&self) -> impl Iterator<Item = &PartitionName> {
        self.partitions.keys()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.partitions.keys()).finish()
    }
}

/// Build the combined reducer for the current registry contents.
///
/// Pure: the registry is snapshotted, so later registry changes never leak
/// into an already-built combined reducer.
pub fn combine(registry: &Registry) -> CombinedReducer {
    CombinedReducer {
        partitions: Arc::new(registry.partitions.clone()),
    }
}

/// A partition whose reducer failed while handling an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionFault {
    pub partition: PartitionName,
    pub error: ReduceError,
}

/// Result of running one event through the combined reducer.
#[derive(Debug, Clone)]
pub struct Reduction {
    pub state: CombinedState,
    pub faults: Vec<PartitionFault>,
    /// Whether any slice differs from the input state.
    pub changed: bool,
}

/// Reducer over the whole combined state, derived from a [`Registry`].
#[derive(Clone)]
pub struct CombinedReducer {
    partitions: Arc<PartitionMap>,
}

impl CombinedReducer {
    /// Initial state of every registered partition.
    pub fn initial_state(&self) -> CombinedState {
        self.partitions
            .iter()
            .map(|(name, reducer)| (name.clone(), reducer.initial_state()))
            .collect()
    }

    /// Apply `event` to every partition's slice.
    ///
    /// Absent slices start from the partition's initial state. Slices with no
    /// registered partition are dropped. A partition that returns an error or
    /// panics keeps its previous slice and is reported in `faults`.
    pub fn reduce(&self, state: &CombinedState, event: &Event) -> Reduction {
        let mut next = CombinedState::new();
        let mut faults = Vec::new();
        let mut changed = false;

        for (name, reducer) in self.partitions.iter() {
            let current = state.get(name.as_str());
            let previous = match current {
                Some(slice) => slice.clone(),
                None => reducer.initial_state(),
            };
            let slice = match run_isolated(reducer.as_ref(), &previous, event) {
                Ok(slice) => slice,
                Err(error) => {
                    tracing::warn!(partition = %name, event = %event.kind, %error, "partition fault, keeping previous state");
                    faults.push(PartitionFault {
                        partition: name.clone(),
                        error,
                    });
                    previous
                }
            };
            if current != Some(&slice) {
                changed = true;
            }
            next.insert(name.clone(), slice);
        }

        if next.len() != state.len() {
            changed = true;
        }

        Reduction {
            state: next,
            faults,
            changed,
        }
    }

    /// Names of the partitions this reducer covers.
    pub fn partition_names(&self) -> impl Iterator<Item = &PartitionName> {
        self.partitions.keys()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

impl fmt::Debug for CombinedReducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CombinedReducer")
            .field("partitions", &self.partitions.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn run_isolated(reducer: &dyn Reducer, state: &Value, event: &Event) -> Result<Value, ReduceError> {
    match panic::catch_unwind(AssertUnwindSafe(|| reducer.reduce(state, event))) {
        Ok(result) => result,
        Err(payload) => Err(ReduceError::Panicked(panic_message(payload.as_ref()))),
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
