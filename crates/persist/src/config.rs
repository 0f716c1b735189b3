//! Configuration for a persisted partition.

use crate::envelope::Codec;
use crate::reconcile::{HardSet, PolicyKind, ReconciliationPolicy};
use crate::storage::StorageBackend;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Prefix prepended to every storage key.
pub const KEY_PREFIX: &str = "persist:";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upgrade a rehydrated state written under an older version.
///
/// Receives the stored state and the version it was written with.
pub type Migration = Arc<dyn Fn(Value, i64) -> Result<Value, String> + Send + Sync>;

/// Everything the persistence wrapper needs for one partition.
#[derive(Clone)]
pub struct PersistConfig {
    pub storage_key: String,
    pub backend: Arc<dyn StorageBackend>,
    pub policy: Arc<dyn ReconciliationPolicy>,
    pub version: i64,
    pub migrate: Option<Migration>,
    pub codec: Codec,
    /// Only these top-level keys are persisted, when set.
    pub whitelist: Option<Vec<String>>,
    /// Top-level keys never persisted.
    pub blacklist: Vec<String>,
    /// Delay before a write; writes queued meanwhile collapse into one.
    pub throttle: Duration,
    /// Upper bound on the startup read. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl PersistConfig {
    /// Hard-overwrite JSON persistence under `storage_key`.
    pub fn new(storage_key: impl Into<String>, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage_key: storage_key.into(),
            backend,
            policy: Arc::new(HardSet),
            version: -1,
            migrate: None,
            codec: Codec::default(),
            whitelist: None,
            blacklist: Vec::new(),
            throttle: Duration::ZERO,
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }

    /// Build from deserialized settings plus a backend.
    pub fn from_settings(settings: PersistSettings, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage_key: settings.storage_key,
            backend,
            policy: settings.policy.into_policy(),
            version: settings.version,
            migrate: None,
            codec: settings.codec,
            whitelist: settings.whitelist,
            blacklist: settings.blacklist,
            throttle: Duration::from_millis(settings.throttle_ms),
            timeout: settings.timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn policy(mut self, policy: impl ReconciliationPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    pub fn migrate<F>(mut self, migrate: F) -> Self
    where
        F: Fn(Value, i64) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.migrate = Some(Arc::new(migrate));
        self
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn whitelist<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn blacklist<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blacklist = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Key used in the storage backend.
    pub fn full_key(&self) -> String {
        format!("{KEY_PREFIX}{}", self.storage_key)
    }

    /// Apply the whitelist and blacklist to the top-level keys of `state`.
    /// Non-object states pass through unchanged.
    pub fn filter_state(&self, state: Value) -> Value {
        let Value::Object(map) = state else {
            return state;
        };
        let kept = map
            .into_iter()
            .filter(|(key, _)| {
                self.whitelist
                    .as_ref()
                    .is_none_or(|allowed| allowed.iter().any(|k| k == key))
                    && !self.blacklist.iter().any(|k| k == key)
            })
            .collect();
        Value::Object(kept)
    }
}

impl fmt::Debug for PersistConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistConfig")
            .field("storage_key", &self.storage_key)
            .field("policy", &self.policy.name())
            .field("version", &self.version)
            .field("codec", &self.codec)
            .field("whitelist", &self.whitelist)
            .field("blacklist", &self.blacklist)
            .field("throttle", &self.throttle)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Serializable subset of [`PersistConfig`], for configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistSettings {
    pub storage_key: String,
    #[serde(default)]
    pub policy: PolicyKind,
    #[serde(default = "default_version")]
    pub version: i64,
    #[serde(default)]
    pub codec: Codec,
    #[serde(default)]
    pub whitelist: Option<Vec<String>>,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub throttle_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: Option<u64>,
}

fn default_version() -> i64 {
    -1
}

fn default_timeout_ms() -> Option<u64> {
    Some(DEFAULT_TIMEOUT.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn config() -> PersistConfig {
        PersistConfig::new("firestore", Arc::new(MemoryStorage::new()))
    }

    #[test]
    fn defaults_to_hard_set_json() {
        let config = config();
        assert_eq!(config.full_key(), "persist:firestore");
        assert_eq!(config.policy.name(), "hard_set");
        assert_eq!(config.codec, Codec::Json);
        assert_eq!(config.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn whitelist_keeps_only_listed_keys() {
        let config = config().whitelist(["auth"]);
        let filtered = config.filter_state(json!({"auth": 1, "requesting": true}));
        assert_eq!(filtered, json!({"auth": 1}));
    }

    #[test]
    fn blacklist_drops_listed_keys() {
        let config = config().blacklist(["requesting", "errors"]);
        let filtered = config.filter_state(json!({"auth": 1, "requesting": true, "errors": []}));
        assert_eq!(filtered, json!({"auth": 1}));
        assert_eq!(config.filter_state(json!(5)), json!(5));
    }

    #[test]
    fn settings_fill_defaults() {
        let settings: PersistSettings =
            serde_json::from_value(json!({"storage_key": "firepersist"})).unwrap();
        assert_eq!(settings.policy, PolicyKind::HardSet);
        assert_eq!(settings.timeout_ms, Some(5000));

        let config = PersistConfig::from_settings(settings, Arc::new(MemoryStorage::new()));
        assert_eq!(config.full_key(), "persist:firepersist");
        assert_eq!(config.throttle, Duration::ZERO);
    }

    #[test]
    fn settings_reject_unknown_fields() {
        let parsed = serde_json::from_value::<PersistSettings>(
            json!({"storage_key": "k", "stateReconciler": "hardSet"}),
        );
        assert!(parsed.is_err());
    }
}
