//! Persistence for store partitions: rehydrate on startup, write on change.
//!
//! # Invariants
//! - A persisted partition exists only after its rehydration read finished.
//! - Read failures degrade to "no persisted state"; they are never fatal.
//! - Writes run on a background task and never block or roll back dispatch.
//! - Writes for one storage key on one backend are applied in dispatch order,
//!   also across writers of partitions re-injected under that key.

pub mod config;
pub mod envelope;
pub mod persistor;
pub mod reconcile;
pub mod storage;
pub mod wrapper;

pub use config::{KEY_PREFIX, Migration, PersistConfig, PersistSettings};
pub use envelope::{Codec, ENVELOPE_SCHEMA_VERSION, Envelope, EnvelopeError};
pub use persistor::{PersistStats, Persistor};
pub use reconcile::{AutoMergeLevel1, AutoMergeLevel2, HardSet, PolicyKind, ReconciliationPolicy};
pub use storage::{FileStorage, MemoryStorage, StorageBackend, StorageError};
pub use wrapper::{PersistError, PersistedReducer, Rehydration, persist_reducer, rehydrate};
