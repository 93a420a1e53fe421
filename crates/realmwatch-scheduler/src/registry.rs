//! RealmRegistry: the set of monitored realms and their configuration.

use std::collections::HashMap;

use realm_core::{Principal, RealmConfig};
use tokio::sync::RwLock;

use crate::error::ConfigError;

/// Registered realms keyed by principal.
///
/// Safe to read and mutate from concurrent API calls while the scheduler
/// iterates. The lock is only held for map operations, never across a
/// fetch or a store call.
#[derive(Default)]
pub struct RealmRegistry {
    realms: RwLock<HashMap<Principal, RealmConfig>>,
}

impl RealmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a realm. Returns the normalized config that was stored.
    pub async fn add(&self, config: RealmConfig) -> Result<RealmConfig, ConfigError> {
        let config = config.normalized()?;
        let mut realms = self.realms.write().await;
        if realms.contains_key(&config.principal) {
            return Err(ConfigError::DuplicateTarget(config.principal));
        }
        realms.insert(config.principal.clone(), config.clone());
        Ok(config)
    }

    pub async fn remove(&self, principal: &str) -> Result<RealmConfig, ConfigError> {
        self.realms
            .write()
            .await
            .remove(principal)
            .ok_or_else(|| ConfigError::NotFound(principal.to_string()))
    }

    pub async fn get(&self, principal: &str) -> Result<RealmConfig, ConfigError> {
        self.realms
            .read()
            .await
            .get(principal)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(principal.to_string()))
    }

    /// All registered realms, sorted by principal.
    pub async fn list(&self) -> Vec<RealmConfig> {
        let mut realms: Vec<RealmConfig> = self.realms.read().await.values().cloned().collect();
        realms.sort_by(|a, b| a.principal.cmp(&b.principal));
        realms
    }

    /// Replace the config of an existing realm. Returns `(previous, current)`.
    pub async fn update(
        &self,
        config: RealmConfig,
    ) -> Result<(RealmConfig, RealmConfig), ConfigError> {
        let config = config.normalized()?;
        let mut realms = self.realms.write().await;
        let slot = realms
            .get_mut(&config.principal)
            .ok_or_else(|| ConfigError::NotFound(config.principal.clone()))?;
        let previous = std::mem::replace(slot, config.clone());
        Ok((previous, config))
    }

    /// Toggle scheduling of a realm. Returns `(was_enabled, current)`.
    pub async fn set_enabled(
        &self,
        principal: &str,
        enabled: bool,
    ) -> Result<(bool, RealmConfig), ConfigError> {
        let mut realms = self.realms.write().await;
        let config = realms
            .get_mut(principal)
            .ok_or_else(|| ConfigError::NotFound(principal.to_string()))?;
        let was_enabled = config.enabled;
        config.enabled = enabled;
        Ok((was_enabled, config.clone()))
    }

    pub async fn len(&self) -> usize {
        self.realms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.realms.read().await.is_empty()
    }
}
