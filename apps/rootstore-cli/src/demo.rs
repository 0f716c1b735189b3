//! Demo application store.
//!
//! Static partitions `counter` and `session` are registered at boot; the
//! `todos` partition is injected afterwards, the way a lazily loaded module
//! would register itself. Which partitions persist comes from [`DemoConfig`].

use anyhow::Context;
use rootstore_common::{CombinedState, Event, PartitionName};
use rootstore_kernel::{Reducer, Store, reducer_fn};
use rootstore_persist::{
    FileStorage, PersistConfig, PersistSettings, Persistor, StorageBackend, persist_reducer,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Persistence settings per partition name. Partitions not listed are kept
/// in memory only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DemoConfig {
    pub partitions: BTreeMap<String, PersistSettings>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        let settings = |key: &str| PersistSettings {
            storage_key: key.to_owned(),
            policy: Default::default(),
            version: -1,
            codec: Default::default(),
            whitelist: None,
            blacklist: Vec::new(),
            throttle_ms: 0,
            timeout_ms: Some(5000),
        };
        Self {
            partitions: BTreeMap::from([
                ("counter".to_owned(), settings("counterpersist")),
                ("todos".to_owned(), settings("todospersist")),
            ]),
        }
    }
}

impl DemoConfig {
    /// Load a YAML configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}

fn counter() -> impl Reducer {
    reducer_fn(json!({"count": 0}), |state, event| match event.kind.as_str() {
        "counter/increment" => json!({"count": state["count"].as_i64().unwrap_or(0) + 1}),
        "counter/reset" => json!({"count": 0}),
        _ => state.clone(),
    })
}

fn session() -> impl Reducer {
    reducer_fn(json!({"started": false}), |state, event| {
        if event.is("session/start") {
            json!({"started": true})
        } else {
            state.clone()
        }
    })
}

fn todos() -> impl Reducer {
    reducer_fn(json!({"items": []}), |state, event| {
        if event.is("todos/add") {
            let mut items = state["items"].as_array().cloned().unwrap_or_default();
            items.push(event.get("text").cloned().unwrap_or(Value::Null));
            json!({"items": items})
        } else {
            state.clone()
        }
    })
}

/// Wraps partitions listed in the config with persistence and collects
/// their persistors so the demo can flush before exit.
struct Assembler<'a> {
    config: &'a DemoConfig,
    backend: Arc<dyn StorageBackend>,
    persistors: Vec<Persistor>,
}

impl Assembler<'_> {
    async fn partition<R: Reducer + 'static>(
        &mut self,
        name: &str,
        reducer: R,
    ) -> anyhow::Result<(PartitionName, Arc<dyn Reducer>)> {
        let name = PartitionName::new(name)?;
        let Some(settings) = self.config.partitions.get(name.as_str()) else {
            return Ok((name, Arc::new(reducer)));
        };
        let config = PersistConfig::from_settings(settings.clone(), self.backend.clone());
        let persisted = persist_reducer(name.clone(), reducer, config).await;
        tracing::info!(partition = %name, rehydration = ?persisted.rehydration(), "persisted partition ready");
        self.persistors.push(persisted.persistor());
        Ok((name, Arc::new(persisted)))
    }

    async fn flush(&self) {
        for persistor in &self.persistors {
            persistor.flush().await;
        }
    }
}

/// Boot the demo store from `dir`, dispatch a few events, inject `todos`,
/// and return the final combined state after all writes were attempted.
pub async fn run(dir: &Path, config: &DemoConfig, increments: u32) -> anyhow::Result<CombinedState> {
    let backend: Arc<dyn StorageBackend> = Arc::new(
        FileStorage::open(dir).with_context(|| format!("opening {}", dir.display()))?,
    );
    let mut assembler = Assembler {
        config,
        backend,
        persistors: Vec::new(),
    };

    let (counter_name, counter) = assembler.partition("counter", counter()).await?;
    let (session_name, session) = assembler.partition("session", session()).await?;
    let mut store = Store::builder()
        .shared_partition(counter_name, counter)
        .shared_partition(session_name, session)
        .build();

    store.dispatch(&Event::new("session/start"));
    for _ in 0..increments {
        store.dispatch(&Event::new("counter/increment"));
    }

    let (todos_name, todos) = assembler.partition("todos", todos()).await?;
    store.inject(todos_name, todos);
    let label = format!("run #{}", store.dispatch_count());
    store.dispatch(&Event::new("todos/add").with("text", label));

    assembler.flush().await;
    Ok(store.state().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_persists_counter_and_todos() {
        let config = DemoConfig::default();
        let names: Vec<&str> = config.partitions.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["counter", "todos"]);
    }

    #[test]
    fn yaml_config_parses() {
        let yaml = r#"
partitions:
  counter:
    storage_key: counterpersist
    policy: auto_merge_level1
    codec: compressed_cbor
    throttle_ms: 50
"#;
        let config: DemoConfig = serde_yaml::from_str(yaml).unwrap();
        let counter = &config.partitions["counter"];
        assert_eq!(counter.storage_key, "counterpersist");
        assert_eq!(counter.throttle_ms, 50);
        assert_eq!(counter.timeout_ms, Some(5000));
    }

    #[tokio::test]
    async fn demo_state_accumulates_across_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DemoConfig::default();

        let first = run(tmp.path(), &config, 2).await.unwrap();
        assert_eq!(first.get("counter"), Some(&json!({"count": 2})));
        assert_eq!(first.get("todos"), Some(&json!({"items": ["run #3"]})));

        let second = run(tmp.path(), &config, 1).await.unwrap();
        assert_eq!(second.get("counter"), Some(&json!({"count": 3})));
        assert_eq!(second.get("session"), Some(&json!({"started": true})));
        assert_eq!(
            second.get("todos"),
            Some(&json!({"items": ["run #3", "run #2"]}))
        );
    }
}
