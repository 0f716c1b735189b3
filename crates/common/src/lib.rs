//! Shared types for the rootstore workspace.
//!
//! # Invariants
//! - Partition names are non-empty and contain no whitespace.
//! - Combined state iterates in partition-name order.

mod types;

pub use types::{CombinedState, Event, PartitionName, PartitionNameError};
