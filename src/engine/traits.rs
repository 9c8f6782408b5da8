// SPDX-License-Identifier: Apache-2.0

//! DatasourceDriver trait definition
//!
//! The stable capability interface every provider driver registers with the
//! [`DriverRegistry`](crate::engine::DriverRegistry). Drivers are resolved
//! by a datasource's `driver`, then by its `provider`.

use async_trait::async_trait;

use crate::engine::error::EngineResult;
use crate::engine::types::{Datasource, DatasourceMetadata, QueryResult};

#[async_trait]
pub trait DatasourceDriver: Send + Sync {
    /// Provider identifier this driver serves (e.g. "postgres", "csv")
    fn provider_id(&self) -> &str;

    /// Returns a human-readable name for this driver
    fn driver_name(&self) -> &'static str;

    /// Checks that the datasource is reachable with its current config
    async fn test_connection(&self, datasource: &Datasource) -> EngineResult<()>;

    /// Catalog of the datasource
    async fn metadata(&self, datasource: &Datasource) -> EngineResult<DatasourceMetadata>;

    /// Executes SQL against the datasource
    async fn query(&self, datasource: &Datasource, sql: &str) -> EngineResult<QueryResult>;

    /// Releases driver-held resources
    async fn close(&self) -> EngineResult<()> {
        Ok(())
    }
}
