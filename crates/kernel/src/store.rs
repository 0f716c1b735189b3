use crate::reducer::Reducer;
use crate::registry::{CombinedReducer, PartitionFault, Registry, combine, panic_message};
use rootstore_common::{CombinedState, Event, PartitionName};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

type Subscriber = Box<dyn FnMut(&CombinedState) + Send>;

/// Handle returned by [`Store::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// The single owner of the registry and the combined state.
///
/// All mutations go through `dispatch` and `inject`, both of which take
/// `&mut self`: events are processed one at a time and injection can only
/// happen between two dispatches. Modules that register partitions receive
/// the store by reference; there is no global instance.
pub struct Store {
    registry: Registry,
    reducer: CombinedReducer,
    state: CombinedState,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    next_subscription: u64,
    last_faults: Vec<PartitionFault>,
    dispatched: u64,
}

impl Store {
    /// Start assembling a store from static partitions.
    pub fn builder() -> StoreBuilder {
        StoreBuilder::default()
    }

    /// Create a store whose state is the initial state of every partition.
    pub fn new(registry: Registry) -> Self {
        Self::with_state(registry, CombinedState::new())
    }

    fn with_state(registry: Registry, preloaded: CombinedState) -> Self {
        let reducer = combine(&registry);
        let mut state = reducer.initial_state();
        for (name, slice) in preloaded.iter() {
            if state.contains(name.as_str()) {
                state.insert(name.clone(), slice.clone());
            } else {
                tracing::debug!(partition = %name, "ignoring preloaded state for unregistered partition");
            }
        }
        tracing::debug!(partitions = registry.len(), "store created");
        Self {
            registry,
            reducer,
            state,
            subscribers: Vec::new(),
            next_subscription: 0,
            last_faults: Vec::new(),
            dispatched: 0,
        }
    }

    /// Current combined state.
    pub fn state(&self) -> &CombinedState {
        &self.state
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Faults reported by the most recent dispatch.
    pub fn last_faults(&self) -> &[PartitionFault] {
        &self.last_faults
    }

    /// Number of events dispatched so far.
    pub fn dispatch_count(&self) -> u64 {
        self.dispatched
    }

    /// Run `event` through every registered partition and return the new state.
    ///
    /// Subscribers are notified after the state is replaced. Partition faults
    /// do not abort the dispatch; see [`Store::last_faults`]. A panicking
    /// subscriber is logged and skipped.
    pub fn dispatch(&mut self, event: &Event) -> &CombinedState {
        let reduction = self.reducer.reduce(&self.state, event);
        self.dispatched += 1;
        if !reduction.faults.is_empty() {
            tracing::warn!(
                event = %event.kind,
                faults = reduction.faults.len(),
                "dispatch completed with partition faults"
            );
        }
        self.last_faults = reduction.faults;
        if reduction.changed {
            self.state = reduction.state;
        }
        self.notify();
        &self.state
    }

    /// Register a partition on the running store and rebuild the combined
    /// reducer.
    ///
    /// A new partition's slice starts at its initial state; an overwritten
    /// partition keeps its current slice. Every other slice is untouched. The
    /// partition sees events dispatched after this call returns.
    pub fn inject(&mut self, name: PartitionName, reducer: Arc<dyn Reducer>) {
        let initial = reducer.initial_state();
        let replaced = self.registry.insert(name.clone(), reducer).is_some();
        self.reducer = combine(&self.registry);

        let added = !self.state.contains(name.as_str());
        if added {
            self.state.insert(name.clone(), initial);
        }
        tracing::info!(partition = %name, replaced, partitions = self.registry.len(), "partition injected");
        if added {
            self.notify();
        }
    }

    /// Register a listener called with the combined state after every dispatch.
    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&CombinedState) + Send + 'static,
    {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push((id, Box::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub, _)| *sub != id);
        self.subscribers.len() != before
    }

    fn notify(&mut self) {
        let state = &self.state;
        for (id, listener) in self.subscribers.iter_mut() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(state))) {
                tracing::warn!(
                    subscription = id.0,
                    panic = %panic_message(payload.as_ref()),
                    "subscriber panicked"
                );
            }
        }
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("registry", &self.registry)
            .field("state", &self.state)
            .field("subscribers", &self.subscribers.len())
            .field("dispatched", &self.dispatched)
            .finish()
    }
}

/// Collects static partitions and optional preloaded state before the store
/// exists.
#[derive(Default)]
pub struct StoreBuilder {
    registry: Registry,
    preloaded: CombinedState,
}

impl StoreBuilder {
    /// Add a static partition.
    pub fn partition<R: Reducer + 'static>(self, name: PartitionName, reducer: R) -> Self {
        self.shared_partition(name, Arc::new(reducer))
    }

    /// Add a static partition that is already shared.
    pub fn shared_partition(mut self, name: PartitionName, reducer: Arc<dyn Reducer>) -> Self {
        self.registry.insert(name, reducer);
        self
    }

    /// Seed slices for registered partitions instead of their initial state.
    pub fn preloaded_state(mut self, state: CombinedState) -> Self {
        self.preloaded = state;
        self
    }

    pub fn build(self) -> Store {
        Store::with_state(self.registry, self.preloaded)
    }
}
