// SPDX-License-Identifier: Apache-2.0

//! Datasource repository collaborator.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::engine::error::EngineResult;
use crate::engine::types::Datasource;

/// Bulk lookup of datasources by id. Unknown ids are simply absent from the
/// result.
#[async_trait]
pub trait DatasourceRepository: Send + Sync {
    async fn find_by_ids(&self, ids: &[String]) -> EngineResult<Vec<Datasource>>;
}

#[derive(Default)]
pub struct InMemoryDatasourceRepository {
    datasources: RwLock<HashMap<String, Datasource>>,
}

impl InMemoryDatasourceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_datasources(datasources: impl IntoIterator<Item = Datasource>) -> Self {
        let repo = Self::new();
        for ds in datasources {
            repo.insert(ds);
        }
        repo
    }

    pub fn insert(&self, datasource: Datasource) {
        self.datasources
            .write()
            .insert(datasource.id.clone(), datasource);
    }

    pub fn remove(&self, id: &str) -> Option<Datasource> {
        self.datasources.write().remove(id)
    }
}

#[async_trait]
impl DatasourceRepository for InMemoryDatasourceRepository {
    async fn find_by_ids(&self, ids: &[String]) -> EngineResult<Vec<Datasource>> {
        let datasources = self.datasources.read();
        Ok(ids
            .iter()
            .filter_map(|id| datasources.get(id).cloned())
            .collect())
    }
}
