// SPDX-License-Identifier: Apache-2.0

//! Driver Registry
//!
//! Central registry for all available datasource drivers, populated at
//! startup. Lookups are by provider id, case-insensitive.

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::drivers::engine_driver::{EngineDriver, BUILTIN_PROVIDERS};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::DatasourceDriver;
use crate::engine::types::Datasource;
use crate::federation::AttachmentDispatcher;

/// Registry that holds all available datasource drivers
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn DatasourceDriver>>,
}

fn key(provider: &str) -> String {
    provider.trim().to_ascii_lowercase()
}

impl DriverRegistry {
    /// Creates a new empty registry
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// Registry with an engine-backed driver for every built-in provider.
    pub fn with_builtin_drivers(dispatcher: Arc<AttachmentDispatcher>) -> Self {
        let mut registry = Self::new();
        for provider in BUILTIN_PROVIDERS {
            registry.register(Arc::new(EngineDriver::new(*provider, Arc::clone(&dispatcher))));
        }
        registry
    }

    /// Registers a new driver
    ///
    /// The driver's `provider_id()` is used as the key.
    pub fn register(&mut self, driver: Arc<dyn DatasourceDriver>) {
        let id = key(driver.provider_id());
        self.drivers.insert(id, driver);
    }

    /// Gets a driver by its provider id
    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn DatasourceDriver>> {
        self.drivers.get(&key(provider_id)).cloned()
    }

    /// Driver for a datasource: explicit `driver` first, then `provider`.
    pub fn resolve(&self, datasource: &Datasource) -> EngineResult<Arc<dyn DatasourceDriver>> {
        datasource
            .driver
            .as_deref()
            .and_then(|driver| self.get(driver))
            .or_else(|| self.get(&datasource.provider))
            .ok_or_else(|| {
                EngineError::driver_not_found(
                    datasource.driver.as_deref().unwrap_or(&datasource.provider),
                )
            })
    }

    /// Lists all registered provider ids, sorted
    pub fn list(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.drivers.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    /// Returns the number of registered drivers
    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    /// Returns true if no drivers are registered
    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Closes every registered driver, continuing past failures.
    pub async fn close_all(&self) -> Vec<(String, EngineError)> {
        let mut failures = Vec::new();
        for (id, driver) in &self.drivers {
            if let Err(e) = driver.close().await {
                failures.push((id.clone(), e));
            }
        }
        failures
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{DatasourceMetadata, QueryResult};
    use async_trait::async_trait;

    #[derive(Debug)]
    struct MockDriver {
        id: &'static str,
    }

    impl MockDriver {
        fn new(id: &'static str) -> Self {
            Self { id }
        }
    }

    #[async_trait]
    impl DatasourceDriver for MockDriver {
        fn provider_id(&self) -> &str {
            self.id
        }

        fn driver_name(&self) -> &'static str {
            "Mock Driver"
        }

        async fn test_connection(&self, _datasource: &Datasource) -> EngineResult<()> {
            Ok(())
        }

        async fn metadata(&self, _datasource: &Datasource) -> EngineResult<DatasourceMetadata> {
            Ok(DatasourceMetadata::default())
        }

        async fn query(&self, _datasource: &Datasource, _sql: &str) -> EngineResult<QueryResult> {
            Ok(QueryResult::empty())
        }

        async fn close(&self) -> EngineResult<()> {
            if self.id == "flaky" {
                Err(EngineError::internal("close failed"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_registry_basics() {
        let mut registry = DriverRegistry::new();
        assert!(registry.is_empty());

        registry.register(Arc::new(MockDriver::new("mock1")));
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());

        registry.register(Arc::new(MockDriver::new("mock2")));
        assert_eq!(registry.len(), 2);

        assert!(registry.get("mock1").is_some());
        assert!(registry.get("MOCK2").is_some());
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn test_resolve_prefers_driver_over_provider() {
        let mut registry = DriverRegistry::new();
        registry.register(Arc::new(MockDriver::new("postgres")));
        registry.register(Arc::new(MockDriver::new("neon-http")));

        let mut ds = Datasource::new("1", "db", "postgres");
        assert_eq!(registry.resolve(&ds).unwrap().provider_id(), "postgres");

        ds.driver = Some("neon-http".into());
        assert_eq!(registry.resolve(&ds).unwrap().provider_id(), "neon-http");

        ds.driver = Some("unknown".into());
        assert_eq!(registry.resolve(&ds).unwrap().provider_id(), "postgres");

        let orphan = Datasource::new("2", "x", "oracle");
        assert!(matches!(
            registry.resolve(&orphan),
            Err(EngineError::DriverNotFound { .. })
        ));
    }

    #[test]
    fn test_list_drivers() {
        let mut registry = DriverRegistry::new();
        registry.register(Arc::new(MockDriver::new("b")));
        registry.register(Arc::new(MockDriver::new("a")));
        assert_eq!(registry.list(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_close_all_collects_failures() {
        let mut registry = DriverRegistry::new();
        registry.register(Arc::new(MockDriver::new("ok")));
        registry.register(Arc::new(MockDriver::new("flaky")));

        let failures = registry.close_all().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "flaky");
    }
}
