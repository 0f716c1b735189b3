//! The persistence decorator for a partition reducer.

use crate::config::PersistConfig;
use crate::envelope::{Codec, EnvelopeError};
use crate::persistor::Persistor;
use crate::storage::StorageError;
use rootstore_common::{Event, PartitionName};
use rootstore_kernel::{ReduceError, Reducer};
use serde_json::Value;
use std::time::Duration;

/// Errors while rehydrating a partition. Callers of [`persist_reducer`] never
/// see these; they are logged and reported through [`Rehydration::Failed`].
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("rehydration timed out after {0:?}")]
    Timeout(Duration),
    #[error("record belongs to {found:?}, expected {expected:?}")]
    KeyMismatch { expected: String, found: String },
    #[error("migration from version {from} failed: {reason}")]
    Migration { from: i64, reason: String },
}

/// Outcome of the startup read for a persisted partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rehydration {
    /// A persisted state was found and reconciled.
    Restored,
    /// Nothing was stored under the key.
    Absent,
    /// The read or decode failed; the partition started from fresh state.
    Failed(String),
}

/// Read and decode the persisted state for `config`.
///
/// Returns `Ok(None)` if nothing is stored. The state is migrated if its
/// version differs and a migration is configured, then filtered by the
/// whitelist and blacklist.
pub async fn rehydrate(config: &PersistConfig) -> Result<Option<Value>, PersistError> {
    let key = config.full_key();
    let read = config.backend.read(&key);
    let bytes = match config.timeout {
        Some(limit) => tokio::time::timeout(limit, read)
            .await
            .map_err(|_| PersistError::Timeout(limit))??,
        None => read.await?,
    };
    let Some(bytes) = bytes else {
        return Ok(None);
    };

    // Switching codecs must not orphan records written with the old one.
    let codec = Codec::detect(&bytes);
    if codec != config.codec {
        tracing::debug!(%key, ?codec, "record was written with a different codec");
    }
    let envelope = codec.decode(&bytes)?;
    if envelope.storage_key != config.storage_key {
        return Err(PersistError::KeyMismatch {
            expected: config.storage_key.clone(),
            found: envelope.storage_key,
        });
    }

    let state = if envelope.version == config.version {
        envelope.state
    } else if let Some(migrate) = &config.migrate {
        tracing::info!(%key, from = envelope.version, to = config.version, "migrating persisted state");
        migrate(envelope.state, envelope.version).map_err(|reason| PersistError::Migration {
            from: envelope.version,
            reason,
        })?
    } else {
        tracing::debug!(%key, stored = envelope.version, configured = config.version, "version differs, no migration configured");
        envelope.state
    };

    Ok(Some(config.filter_state(state)))
}

/// A partition reducer whose state is rehydrated at startup and written to
/// storage on every change.
pub struct PersistedReducer<R> {
    name: PartitionName,
    inner: R,
    config: PersistConfig,
    rehydrated: Option<Value>,
    rehydration: Rehydration,
    persistor: Persistor,
}

/// Wrap `inner` with persistence.
///
/// Completes the startup read before returning, so the store never
/// dispatches to a persisted partition that has not rehydrated yet. A failed
/// or timed-out read is logged and the partition starts from its fresh
/// initial state. Must be called inside a tokio runtime.
pub async fn persist_reducer<R: Reducer>(
    name: PartitionName,
    inner: R,
    config: PersistConfig,
) -> PersistedReducer<R> {
    let (rehydrated, rehydration) = match rehydrate(&config).await {
        Ok(Some(state)) => {
            tracing::info!(partition = %name, key = %config.full_key(), policy = config.policy.name(), "rehydrated persisted state");
            (Some(state), Rehydration::Restored)
        }
        Ok(None) => {
            tracing::debug!(partition = %name, key = %config.full_key(), "no persisted state");
            (None, Rehydration::Absent)
        }
        Err(error) => {
            tracing::warn!(partition = %name, key = %config.full_key(), %error, "rehydration failed, starting fresh");
            (None, Rehydration::Failed(error.to_string()))
        }
    };
    let persistor = Persistor::spawn(&config);

    PersistedReducer {
        name,
        inner,
        config,
        rehydrated,
        rehydration,
        persistor,
    }
}

impl<R> PersistedReducer<R> {
    pub fn name(&self) -> &PartitionName {
        &self.name
    }

    pub fn rehydration(&self) -> &Rehydration {
        &self.rehydration
    }

    /// Handle for flushing or purging this partition's record.
    pub fn persistor(&self) -> Persistor {
        self.persistor.clone()
    }

    pub fn config(&self) -> &PersistConfig {
        &self.config
    }
}

impl<R: Reducer> Reducer for PersistedReducer<R> {
    /// The fresh initial state, reconciled with the rehydrated state if any.
    fn initial_state(&self) -> Value {
        let fresh = self.inner.initial_state();
        match &self.rehydrated {
            Some(stored) => self.config.policy.reconcile(&fresh, stored.clone()),
            None => fresh,
        }
    }

    fn reduce(&self, state: &Value, event: &Event) -> Result<Value, ReduceError> {
        let next = self.inner.reduce(state, event)?;
        if &next != state {
            self.persistor.schedule(next.clone());
        }
        Ok(next)
    }
}

impl<R> std::fmt::Debug for PersistedReducer<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistedReducer")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("rehydration", &self.rehydration)
            .finish_non_exhaustive()
    }
}
