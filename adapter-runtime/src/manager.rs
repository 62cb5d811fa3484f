//! Adapter manager (registry of running adapter instances)

use crate::{
    connector::ProtocolBinding, lifecycle::AdapterState, result::OperationResult,
    runtime::AdapterRuntime, types::*, Error, Result,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Object-safe view of a running adapter
#[async_trait]
pub trait ManagedAdapter: Send + Sync {
    /// Adapter ID
    fn id(&self) -> &str;

    /// Adapter type
    fn adapter_type(&self) -> AdapterType;

    /// Lifecycle state
    fn state(&self) -> AdapterState;

    /// Health snapshot
    fn health(&self) -> AdapterHealth;

    /// Configuration summary
    fn describe(&self) -> String;

    /// Run connection checks
    async fn test_connection(&self) -> OperationResult<ConnectionReport>;

    /// Destroy the adapter
    async fn destroy(&self) -> OperationResult<()>;
}

#[async_trait]
impl<B: ProtocolBinding> ManagedAdapter for AdapterRuntime<B> {
    fn id(&self) -> &str {
        AdapterRuntime::id(self)
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterRuntime::adapter_type(self)
    }

    fn state(&self) -> AdapterState {
        AdapterRuntime::state(self)
    }

    fn health(&self) -> AdapterHealth {
        AdapterRuntime::health(self)
    }

    fn describe(&self) -> String {
        AdapterRuntime::describe(self)
    }

    async fn test_connection(&self) -> OperationResult<ConnectionReport> {
        AdapterRuntime::test_connection(self).await
    }

    async fn destroy(&self) -> OperationResult<()> {
        AdapterRuntime::destroy(self).await
    }
}

/// Adapter manager
#[derive(Default)]
pub struct AdapterManager {
    /// Adapters by ID
    adapters: Arc<RwLock<HashMap<String, Arc<dyn ManagedAdapter>>>>,
}

impl AdapterManager {
    /// Create new manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Register adapter
    pub async fn register(&self, adapter: Arc<dyn ManagedAdapter>) -> Result<()> {
        let mut adapters = self.adapters.write().await;
        let id = adapter.id().to_string();
        if adapters.contains_key(&id) {
            return Err(Error::Generic(format!("Adapter {} already registered", id)));
        }
        info!("Registered {} adapter {}", adapter.adapter_type(), id);
        adapters.insert(id, adapter);
        Ok(())
    }

    /// Get adapter
    pub async fn get(&self, id: &str) -> Option<Arc<dyn ManagedAdapter>> {
        self.adapters.read().await.get(id).cloned()
    }

    /// Remove adapter from the registry (does not destroy it)
    pub async fn unregister(&self, id: &str) -> Option<Arc<dyn ManagedAdapter>> {
        self.adapters.write().await.remove(id)
    }

    /// Registered adapter IDs
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Get adapter health
    pub async fn health(&self, id: &str) -> Option<AdapterHealth> {
        self.get(id).await.map(|adapter| adapter.health())
    }

    /// Health of every adapter, sorted by ID
    pub async fn health_all(&self) -> Vec<AdapterHealth> {
        let mut health: Vec<AdapterHealth> = self
            .snapshot()
            .await
            .iter()
            .map(|adapter| adapter.health())
            .collect();
        health.sort_by(|a, b| a.adapter_id.cmp(&b.adapter_id));
        health
    }

    /// Connection test of every adapter
    pub async fn test_all(&self) -> Vec<(String, OperationResult<ConnectionReport>)> {
        let mut results = Vec::new();
        for adapter in self.snapshot().await {
            let result = adapter.test_connection().await;
            if !result.is_success() {
                warn!("Connection test failed for {}: {}", adapter.id(), result.message());
            }
            results.push((adapter.id().to_string(), result));
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Destroy and unregister every adapter; returns how many were destroyed cleanly
    pub async fn destroy_all(&self) -> usize {
        let adapters: Vec<Arc<dyn ManagedAdapter>> = {
            let mut registry = self.adapters.write().await;
            registry.drain().map(|(_, adapter)| adapter).collect()
        };

        let mut destroyed = 0;
        for adapter in adapters {
            let result = adapter.destroy().await;
            if result.is_success() {
                destroyed += 1;
            } else {
                error!("Failed to destroy adapter {}: {}", adapter.id(), result.message());
            }
        }
        destroyed
    }

    async fn snapshot(&self) -> Vec<Arc<dyn ManagedAdapter>> {
        self.adapters.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bindings::file::{FileBinding, FileBindingConfig},
        config::AdapterConfig,
    };

    fn file_adapter(dir: &std::path::Path) -> Arc<AdapterRuntime<FileBinding>> {
        let binding = FileBinding::new(
            AdapterMode::Sender,
            FileBindingConfig {
                directory: dir.to_path_buf(),
                ..Default::default()
            },
            &AdapterConfig::default(),
        )
        .unwrap();
        Arc::new(AdapterRuntime::new(binding, AdapterConfig::default()))
    }

    #[tokio::test]
    async fn test_register_health_and_destroy_all() {
        let dir = tempfile::tempdir().unwrap();
        let manager = AdapterManager::new();

        let first = file_adapter(dir.path());
        first.initialize().await.unwrap();
        let second = file_adapter(dir.path());

        manager.register(first.clone()).await.unwrap();
        manager.register(second.clone()).await.unwrap();
        assert!(manager.register(first.clone()).await.is_err());
        assert_eq!(manager.ids().await.len(), 2);

        let health = manager.health(first.id()).await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        let health = manager.health(second.id()).await.unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);

        let tests = manager.test_all().await;
        let ok = tests.iter().filter(|(_, r)| r.is_success()).count();
        assert_eq!(ok, 1);

        assert_eq!(manager.destroy_all().await, 2);
        assert!(manager.ids().await.is_empty());
        assert_eq!(first.state(), AdapterState::Destroyed);
    }
}
