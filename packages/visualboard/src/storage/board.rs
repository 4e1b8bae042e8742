use std::sync::Arc;

use serde_json::Value;

use super::{keys, KeyValueStore};
use crate::config::ServerEnv;
use crate::error::Result;
use crate::model::{CastStore, LastSuccessRecord, ScenarioKey};

/// Side-Panel-owned keys: the last success checkpoint and the cast store
/// per scenario, plus the global server environment.
#[derive(Clone)]
pub struct BoardStore {
    store: Arc<dyn KeyValueStore>,
}

impl BoardStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Load the checkpoint. Records missing `savedAt` are migrated from the
    /// legacy `timestamp` field and written back.
    pub async fn last_success(&self, key: &ScenarioKey) -> Result<Option<LastSuccessRecord>> {
        let Some(value) = self.store.get(&keys::last_success(key)).await? else {
            return Ok(None);
        };
        let Some((record, migrated)) = LastSuccessRecord::from_stored(value) else {
            return Ok(None);
        };
        if migrated {
            tracing::info!("Migrated legacy last success record for {}", key);
            self.save_last_success(&record).await?;
        }
        Ok(Some(record))
    }

    pub async fn save_last_success(&self, record: &LastSuccessRecord) -> Result<()> {
        self.store
            .set(
                &keys::last_success(&record.scenario_key),
                serde_json::to_value(record)?,
            )
            .await
    }

    pub async fn cast(&self, key: &ScenarioKey) -> Result<CastStore> {
        Ok(self
            .store
            .get(&keys::cast(key))
            .await?
            .and_then(CastStore::from_stored)
            .unwrap_or_default())
    }

    pub async fn save_cast(&self, key: &ScenarioKey, cast: &CastStore) -> Result<()> {
        self.store
            .set(&keys::cast(key), serde_json::to_value(cast)?)
            .await
    }

    pub async fn server_env(&self) -> Result<Option<ServerEnv>> {
        Ok(self
            .store
            .get(keys::SERVER_ENV)
            .await?
            .and_then(|v| v.as_str().and_then(|s| s.parse().ok())))
    }

    pub async fn set_server_env(&self, env: ServerEnv) -> Result<()> {
        self.store
            .set(keys::SERVER_ENV, Value::String(env.as_str().to_string()))
            .await
    }

    /// Drop both durable entries of a scenario.
    pub async fn clear_scenario(&self, key: &ScenarioKey) -> Result<()> {
        self.store.remove(&keys::last_success(key)).await?;
        self.store.remove(&keys::cast(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TurnId;
    use crate::storage::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn legacy_record_is_rewritten_with_saved_at() {
        let mem = MemoryStore::new();
        let board = BoardStore::new(Arc::new(mem.clone()));
        let key = ScenarioKey::new("https://rofan.ai/chat/a");
        mem.set(
            &keys::last_success(&key),
            json!({"scenarioKey": key, "turnId": "3:abc", "state": null, "timestamp": 99}),
        )
        .await
        .unwrap();

        let record = board.last_success(&key).await.unwrap().unwrap();
        assert_eq!(record.saved_at, 99);
        assert_eq!(record.turn_id, TurnId::new("3:abc"));

        let raw = mem.get(&keys::last_success(&key)).await.unwrap().unwrap();
        assert_eq!(raw["savedAt"], json!(99));
    }

    #[tokio::test]
    async fn legacy_cast_loads_as_empty_v2() {
        let mem = MemoryStore::new();
        let board = BoardStore::new(Arc::new(mem.clone()));
        let key = ScenarioKey::new("k");
        mem.set(&keys::cast(&key), json!({"version": "v1", "characters": []}))
            .await
            .unwrap();

        let cast = board.cast(&key).await.unwrap();
        assert!(cast.is_v2());
        assert!(cast.is_empty());
    }

    #[tokio::test]
    async fn server_env_round_trips_through_storage() {
        let board = BoardStore::new(Arc::new(MemoryStore::new()));
        assert_eq!(board.server_env().await.unwrap(), None);
        board.set_server_env(ServerEnv::Dev).await.unwrap();
        assert_eq!(board.server_env().await.unwrap(), Some(ServerEnv::Dev));
    }
}
