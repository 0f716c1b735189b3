//! Store kernel: partition registry, combined reducer, runtime injection.
//!
//! # Invariants
//! - Every dispatched event reaches every currently registered partition.
//! - Injection never resets the state of partitions it does not touch.
//! - The combined reducer is derived from the registry, never mutated in place.
//! - A faulting partition keeps its previous state; others still update.

pub mod reducer;
pub mod registry;
pub mod store;

pub use reducer::{FnReducer, ReduceError, Reducer, reducer_fn, try_reducer_fn};
pub use registry::{CombinedReducer, PartitionFault, Reduction, Registry, combine};
pub use store::{Store, StoreBuilder, SubscriptionId};
