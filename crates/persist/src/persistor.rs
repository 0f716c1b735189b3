//! Background writer for one persisted partition.
//!
//! The reducer hands each new state to [`Persistor::schedule`], which only
//! stores it in a single pending slot. A tokio task takes the slot, encodes
//! the envelope, and writes it. A state scheduled while a write is in flight
//! replaces the pending one, so a hanging backend holds at most one state in
//! memory. Failures are logged and counted, never returned to the reducer.
//!
//! Every writer for the same backend and storage key shares a lane. The
//! lane numbers states in the order they were scheduled and serializes the
//! backend writes, skipping any state older than one already written. A
//! partition re-injected under a key that is still being written therefore
//! never has its newer record overwritten by the replaced writer.

use crate::config::PersistConfig;
use crate::envelope::Envelope;
use crate::storage::{StorageBackend, StorageError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use tokio::sync::{Notify, watch};

/// Counters for a partition's writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistStats {
    pub scheduled: u64,
    pub written: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    scheduled: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
}

/// Write ordering shared by all writers of one storage key.
struct Lane {
    next_seq: AtomicU64,
    /// Held across each backend write. Holds the newest sequence attempted.
    applied: tokio::sync::Mutex<u64>,
    /// Newest sequence attempted or superseded, for flush waiters.
    done: watch::Sender<u64>,
}

impl Lane {
    fn new() -> Self {
        Self {
            next_seq: AtomicU64::new(0),
            applied: tokio::sync::Mutex::new(0),
            done: watch::Sender::new(0),
        }
    }
}

/// Backend instance address plus full storage key.
type LaneId = (usize, String);

fn lanes() -> &'static Mutex<HashMap<LaneId, Weak<Lane>>> {
    static LANES: OnceLock<Mutex<HashMap<LaneId, Weak<Lane>>>> = OnceLock::new();
    LANES.get_or_init(Default::default)
}

/// The lane for `key` on `backend`. The entry stays valid while any writer
/// holds the lane, and every writer also holds the backend, so the address
/// cannot be reused by another backend in the meantime.
fn lane_for(backend: &Arc<dyn StorageBackend>, key: &str) -> Arc<Lane> {
    let id = (Arc::as_ptr(backend) as *const () as usize, key.to_owned());
    let mut lanes = lanes().lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(lane) = lanes.get(&id).and_then(Weak::upgrade) {
        return lane;
    }
    lanes.retain(|_, lane| lane.strong_count() > 0);
    let lane = Arc::new(Lane::new());
    lanes.insert(id, Arc::downgrade(&lane));
    lane
}

/// Latest scheduled state waiting for the writer task.
#[derive(Default)]
struct Slot {
    pending: Mutex<Option<(u64, Value)>>,
    wake: Notify,
    closed: AtomicBool,
}

impl Slot {
    fn put(&self, seq: u64, state: Value) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some((seq, state));
        self.wake.notify_one();
    }

    fn take(&self) -> Option<(u64, Value)> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Closes the slot once the last [`Persistor`] clone is gone. The writer task
/// still writes whatever is pending before it exits.
struct SlotOwner(Arc<Slot>);

impl Drop for SlotOwner {
    fn drop(&mut self) {
        self.0.closed.store(true, Ordering::Release);
        self.0.wake.notify_one();
    }
}

/// Handle to a persisted partition's writer task. Cheap to clone.
#[derive(Clone)]
pub struct Persistor {
    key: String,
    backend: Arc<dyn StorageBackend>,
    lane: Arc<Lane>,
    slot: Arc<SlotOwner>,
    counters: Arc<Counters>,
}

impl Persistor {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub(crate) fn spawn(config: &PersistConfig) -> Self {
        let key = config.full_key();
        let lane = lane_for(&config.backend, &key);
        let slot = Arc::new(Slot::default());
        let counters = Arc::new(Counters::default());
        tokio::spawn(run_writer(
            config.clone(),
            lane.clone(),
            slot.clone(),
            counters.clone(),
        ));
        Self {
            key,
            backend: config.backend.clone(),
            lane,
            slot: Arc::new(SlotOwner(slot)),
            counters,
        }
    }

    /// Storage key this persistor writes to.
    pub fn storage_key(&self) -> &str {
        &self.key
    }

    /// Hand `state` to the writer. Never blocks; replaces any state still
    /// waiting to be written.
    pub fn schedule(&self, state: Value) {
        self.counters.scheduled.fetch_add(1, Ordering::Relaxed);
        let seq = self.lane.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.slot.0.put(seq, state);
    }

    /// Wait until every write scheduled for this key before this call has
    /// been attempted or superseded by a newer one.
    pub async fn flush(&self) {
        let target = self.lane.next_seq.load(Ordering::SeqCst);
        let mut done = self.lane.done.subscribe();
        let _ = done.wait_for(|seq| *seq >= target).await;
    }

    /// Remove the persisted record, after pending writes have been attempted.
    pub async fn purge(&self) -> Result<(), StorageError> {
        self.flush().await;
        let _applied = self.lane.applied.lock().await;
        self.backend.remove(&self.key).await?;
        tracing::info!(key = %self.key, "persisted state purged");
        Ok(())
    }

    pub fn stats(&self) -> PersistStats {
        PersistStats {
            scheduled: self.counters.scheduled.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Persistor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistor")
            .field("key", &self.key)
            .field("stats", &self.stats())
            .finish()
    }
}

async fn run_writer(config: PersistConfig, lane: Arc<Lane>, slot: Arc<Slot>, counters: Arc<Counters>) {
    let key = config.full_key();

    loop {
        let Some((mut seq, mut state)) = slot.take() else {
            if slot.closed.load(Ordering::Acquire) {
                break;
            }
            slot.wake.notified().await;
            continue;
        };
        if !config.throttle.is_zero() {
            tokio::time::sleep(config.throttle).await;
            if let Some((newer_seq, newer)) = slot.take() {
                seq = newer_seq;
                state = newer;
            }
        }

        let mut applied = lane.applied.lock().await;
        if seq > *applied {
            match write_state(&config, &key, state).await {
                Ok(()) => {
                    counters.written.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(%key, seq, "state persisted");
                }
                Err(error) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(%key, %error, "failed to persist state");
                }
            }
            *applied = seq;
        } else {
            tracing::debug!(%key, seq, applied = *applied, "newer state already written, skipping");
        }
        drop(applied);
        lane.done.send_modify(|done| *done = (*done).max(seq));
    }

    tracing::debug!(%key, "writer task finished");
}

async fn write_state(config: &PersistConfig, key: &str, state: Value) -> Result<(), WriteError> {
    let envelope = Envelope::new(&config.storage_key, config.version, config.filter_state(state));
    let bytes = config.codec.encode(&envelope)?;
    config.backend.write(key, bytes).await?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum WriteError {
    #[error(transparent)]
    Envelope(#[from] crate::envelope::EnvelopeError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Codec;
    use crate::storage::{MemoryStorage, StorageBackend};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct FailingWrites;

    #[async_trait]
    impl StorageBackend for FailingWrites {
        async fn read(&self, _key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            Ok(None)
        }

        async fn write(&self, _key: &str, _bytes: Vec<u8>) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("disk full".into()))
        }

        async fn remove(&self, _key: &str) -> Result<(), StorageError> {
            Ok(())
        }
    }

    /// Writes wait for a permit, then land in memory.
    struct GatedWrites {
        inner: MemoryStorage,
        gate: tokio::sync::Semaphore,
        started: std::sync::atomic::AtomicUsize,
    }

    impl GatedWrites {
        fn new() -> Self {
            Self {
                inner: MemoryStorage::new(),
                gate: tokio::sync::Semaphore::new(0),
                started: Default::default(),
            }
        }
    }

    #[async_trait]
    impl StorageBackend for GatedWrites {
        async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            self.inner.read(key).await
        }

        async fn write(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.gate
                .acquire()
                .await
                .map_err(|e| StorageError::Unavailable(e.to_string()))?
                .forget();
            self.inner.write(key, bytes).await
        }

        async fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.inner.remove(key).await
        }
    }

    fn stored_state(storage: &MemoryStorage, key: &str) -> Option<serde_json::Value> {
        let bytes = storage.get(key)?;
        Some(Codec::Json.decode(&bytes).unwrap().state)
    }

    #[tokio::test]
    async fn flush_waits_for_scheduled_writes() {
        let storage = Arc::new(MemoryStorage::new());
        let persistor = Persistor::spawn(&PersistConfig::new("counter", storage.clone()));

        persistor.schedule(json!({"count": 1}));
        persistor.schedule(json!({"count": 2}));
        persistor.flush().await;

        assert_eq!(
            stored_state(&storage, "persist:counter"),
            Some(json!({"count": 2}))
        );
        let stats = persistor.stats();
        assert_eq!(stats.scheduled, 2);
        assert_eq!(stats.failed, 0);
        assert!(stats.written >= 1);
    }

    #[tokio::test]
    async fn throttled_writes_collapse_to_latest() {
        let storage = Arc::new(MemoryStorage::new());
        let config =
            PersistConfig::new("counter", storage.clone()).throttle(Duration::from_millis(20));
        let persistor = Persistor::spawn(&config);

        for count in 1..=5 {
            persistor.schedule(json!({"count": count}));
        }
        persistor.flush().await;

        assert_eq!(
            stored_state(&storage, "persist:counter"),
            Some(json!({"count": 5}))
        );
        assert_eq!(persistor.stats().written, 1);
    }

    #[tokio::test]
    async fn states_scheduled_during_a_hanging_write_collapse_to_latest() {
        let storage = Arc::new(GatedWrites::new());
        let persistor = Persistor::spawn(&PersistConfig::new("counter", storage.clone()));

        persistor.schedule(json!({"count": 0}));
        tokio::time::timeout(Duration::from_secs(1), async {
            while storage.started.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        for count in 1..=1_000 {
            persistor.schedule(json!({"count": count}));
        }
        storage.gate.add_permits(10);
        persistor.flush().await;

        assert_eq!(
            stored_state(&storage.inner, "persist:counter"),
            Some(json!({"count": 1000}))
        );
        assert_eq!(storage.started.load(Ordering::SeqCst), 2);
        let stats = persistor.stats();
        assert_eq!(stats.scheduled, 1_001);
        assert_eq!(stats.written, 2);
    }

    #[tokio::test]
    async fn writers_sharing_a_key_never_write_an_older_state_last() {
        let storage = Arc::new(GatedWrites::new());
        let config = PersistConfig::new("counter", storage.clone());
        let replaced = Persistor::spawn(&config);
        let current = Persistor::spawn(&config);

        replaced.schedule(json!({"n": 1}));
        tokio::time::timeout(Duration::from_secs(1), async {
            while storage.started.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        current.schedule(json!({"n": 2}));
        replaced.schedule(json!({"n": 3}));
        current.schedule(json!({"n": 4}));

        storage.gate.add_permits(10);
        current.flush().await;
        replaced.flush().await;

        assert_eq!(
            stored_state(&storage.inner, "persist:counter"),
            Some(json!({"n": 4}))
        );
    }

    #[tokio::test]
    async fn failed_writes_are_counted_not_raised() {
        let persistor = Persistor::spawn(&PersistConfig::new("counter", Arc::new(FailingWrites)));
        persistor.schedule(json!(1));
        persistor.flush().await;

        let stats = persistor.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.written, 0);
    }

    #[tokio::test]
    async fn purge_removes_record_after_pending_writes() {
        let storage = Arc::new(MemoryStorage::new());
        let persistor = Persistor::spawn(&PersistConfig::new("counter", storage.clone()));

        persistor.schedule(json!({"count": 1}));
        persistor.purge().await.unwrap();

        assert!(storage.get("persist:counter").is_none());
    }

    #[tokio::test]
    async fn writes_apply_filters() {
        let storage = Arc::new(MemoryStorage::new());
        let config = PersistConfig::new("firebase", storage.clone()).blacklist(["requesting"]);
        let persistor = Persistor::spawn(&config);

        persistor.schedule(json!({"auth": {"uid": "u1"}, "requesting": true}));
        persistor.flush().await;

        assert_eq!(
            stored_state(&storage, "persist:firebase"),
            Some(json!({"auth": {"uid": "u1"}}))
        );
    }
}
