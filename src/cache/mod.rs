//! In-memory read-through caches fronting the durable store.
//!
//! Token and group entries are loaded lazily on miss and invalidated
//! explicitly on admin writes, quota debits and balance sync. The model and
//! channel dictionaries form one immutable snapshot swapped atomically;
//! readers clone the `Arc` at request start and hold it for the request.
//!
//! Locks are `std::sync::RwLock` and are never held across await points;
//! the store fetch happens between the read probe and the write insert.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::db::Store;
use crate::error::StoreError;
use crate::model::{Channel, Group, ModelConfig, Token};

/// Immutable view of the model catalog and channel table.
#[derive(Debug, Default)]
pub struct ModelSnapshot {
    pub channels: Vec<Arc<Channel>>,
    pub model_configs: HashMap<String, Arc<ModelConfig>>,
    /// Model-set name -> public model names contributed by enabled channels.
    pub models_by_set: HashMap<String, HashSet<String>>,
}

impl ModelSnapshot {
    pub fn all_set_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models_by_set.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn model_config(&self, model: &str) -> Option<&Arc<ModelConfig>> {
        self.model_configs.get(model)
    }

    fn build(channels: Vec<Channel>, configs: Vec<ModelConfig>) -> Self {
        let mut models_by_set: HashMap<String, HashSet<String>> = HashMap::new();
        for channel in channels.iter().filter(|c| c.is_enabled()) {
            for set in &channel.sets {
                let entry = models_by_set.entry(set.clone()).or_default();
                entry.extend(channel.models.iter().cloned());
            }
        }

        Self {
            channels: channels.into_iter().map(Arc::new).collect(),
            model_configs: configs
                .into_iter()
                .map(|c| (c.model.clone(), Arc::new(c)))
                .collect(),
            models_by_set,
        }
    }
}

/// The cache layer owns all in-memory snapshots; consumers get `Arc` copies.
pub struct CacheLayer {
    store: Store,
    tokens: RwLock<HashMap<String, Arc<Token>>>,
    groups: RwLock<HashMap<String, Arc<Group>>>,
    snapshot: RwLock<Arc<ModelSnapshot>>,
}

impl CacheLayer {
    /// Build the cache layer and load the initial snapshot.
    pub async fn new(store: Store) -> Result<Self, StoreError> {
        let layer = Self {
            store,
            tokens: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            snapshot: RwLock::new(Arc::new(ModelSnapshot::default())),
        };
        layer.reload_snapshot().await?;
        Ok(layer)
    }

    /// Current model/channel snapshot. Cheap; readers hold it per request.
    pub fn snapshot(&self) -> Arc<ModelSnapshot> {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Rebuild the snapshot from the store and swap it in. Requests that
    /// start after this returns observe the new dictionaries.
    pub async fn reload_snapshot(&self) -> Result<(), StoreError> {
        let channels = self.store.list_channels().await?;
        let configs = self.store.list_model_configs().await?;
        let next = Arc::new(ModelSnapshot::build(channels, configs));

        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = next;
        Ok(())
    }

    /// Read-through token lookup by key.
    pub async fn token(&self, key: &str) -> Result<Arc<Token>, StoreError> {
        if let Some(token) = self
            .tokens
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
        {
            return Ok(token.clone());
        }

        let token = Arc::new(self.store.get_token_by_key(key).await?);
        self.tokens
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), token.clone());
        Ok(token)
    }

    /// Read-through group lookup by id.
    pub async fn group(&self, id: &str) -> Result<Arc<Group>, StoreError> {
        if let Some(group) = self
            .groups
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
        {
            return Ok(group.clone());
        }

        let group = Arc::new(self.store.get_group(id).await?);
        self.groups
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), group.clone());
        Ok(group)
    }

    pub fn invalidate_token(&self, key: &str) {
        self.tokens
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    pub fn invalidate_group(&self, id: &str) {
        self.groups
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    /// Seed a freshly created token so the next request hits the cache.
    pub fn insert_token(&self, token: Token) {
        self.tokens
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(token.key.clone(), Arc::new(token));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    use crate::model::{ChannelStatus, ChannelType, GroupStatus, TokenStatus, UserType};
    use crate::relay::mode::Mode;

    async fn seeded_store() -> Store {
        let store = Store::open_in_memory().await.unwrap();

        store
            .insert_group(&Group {
                id: "acme".into(),
                status: GroupStatus::Enabled,
                rpm_ratio: 1.0,
                tpm_ratio: 1.0,
                available_sets: vec!["default".into()],
                model_mapping: Default::default(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        store
            .insert_token(&Token {
                id: 0,
                key: "sk-abc".into(),
                group_id: "acme".into(),
                name: "ci".into(),
                status: TokenStatus::Enabled,
                quota: dec!(10),
                subnets: vec![],
                user_type: UserType::Regular,
                is_provisioned: false,
                balance_last_sync: None,
                model_limits: Default::default(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        store
            .insert_channel(&Channel {
                id: 0,
                channel_type: ChannelType::OpenAi,
                name: "main".into(),
                key: "k".into(),
                base_url: None,
                priority: 0,
                weight: 1,
                status: ChannelStatus::Enabled,
                models: ["gpt-4o".to_string()].into_iter().collect(),
                model_mapping: Default::default(),
                sets: vec!["default".into()],
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        store
            .upsert_model_config(&ModelConfig {
                model: "gpt-4o".into(),
                mode: Mode::ChatCompletions,
                owner: "openai".into(),
                input_price: dec!(0.000001),
                output_price: dec!(0.000002),
                per_request_price: dec!(0),
                rpm: None,
                tpm: None,
                max_input_tokens: None,
            })
            .await
            .unwrap();

        store
    }

    #[tokio::test]
    async fn snapshot_contains_seeded_data() {
        let cache = CacheLayer::new(seeded_store().await).await.unwrap();
        let snapshot = cache.snapshot();

        assert_eq!(snapshot.channels.len(), 1);
        assert!(snapshot.model_config("gpt-4o").is_some());
        assert!(snapshot.models_by_set["default"].contains("gpt-4o"));
        assert_eq!(snapshot.all_set_names(), vec!["default".to_string()]);
    }

    #[tokio::test]
    async fn token_read_through_and_invalidate() {
        let store = seeded_store().await;
        let cache = CacheLayer::new(store.clone()).await.unwrap();

        let token = cache.token("sk-abc").await.unwrap();
        assert_eq!(token.quota, dec!(10));

        // Mutate behind the cache's back; cached value still served.
        store.debit_quota(token.id, dec!(4)).await.unwrap();
        assert_eq!(cache.token("sk-abc").await.unwrap().quota, dec!(10));

        // Invalidation forces a reload.
        cache.invalidate_token("sk-abc");
        assert_eq!(cache.token("sk-abc").await.unwrap().quota, dec!(6));
    }

    #[tokio::test]
    async fn missing_token_is_not_found() {
        let cache = CacheLayer::new(seeded_store().await).await.unwrap();
        assert!(cache.token("sk-nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn snapshot_swap_is_observed_by_new_readers() {
        let store = seeded_store().await;
        let cache = CacheLayer::new(store.clone()).await.unwrap();

        let before = cache.snapshot();

        let mut channel = store.get_channel(1).await.unwrap();
        channel.status = ChannelStatus::Disabled;
        store.update_channel(&channel).await.unwrap();
        cache.reload_snapshot().await.unwrap();

        // Old readers keep the old snapshot; new readers see the swap.
        assert!(before.channels[0].is_enabled());
        assert!(!cache.snapshot().channels[0].is_enabled());
        assert!(cache.snapshot().models_by_set.is_empty());
    }
}
