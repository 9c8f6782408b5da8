// SPDX-License-Identifier: Apache-2.0

//! Engine-backed driver
//!
//! Serves any provider the attachment layer understands by attaching the
//! datasource into a throwaway in-memory session for each call.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::config::SessionConfig;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::session::QueryEngineSession;
use crate::engine::traits::DatasourceDriver;
use crate::engine::types::{AttachOptions, Datasource, DatasourceMetadata, QueryResult};
use crate::federation::{AttachmentDispatcher, SchemaCacheRegistry};

/// Providers registered by `DriverRegistry::with_builtin_drivers`.
pub const BUILTIN_PROVIDERS: &[&str] = &[
    "csv",
    "tsv",
    "json",
    "jsonl",
    "parquet",
    "http",
    "https",
    "file",
    "postgres",
    "postgresql",
    "mysql",
    "mariadb",
    "sqlite",
    "duckdb",
    "clickhouse",
    "google-sheets",
];

pub struct EngineDriver {
    provider: String,
    dispatcher: Arc<AttachmentDispatcher>,
}

impl EngineDriver {
    pub fn new(provider: impl Into<String>, dispatcher: Arc<AttachmentDispatcher>) -> Self {
        Self {
            provider: provider.into(),
            dispatcher,
        }
    }

    /// Runs `f` on a fresh session with only `datasource` attached.
    async fn with_session<F, Fut, T>(&self, datasource: &Datasource, f: F) -> EngineResult<T>
    where
        F: FnOnce(Arc<QueryEngineSession>) -> Fut + Send,
        Fut: std::future::Future<Output = EngineResult<T>> + Send,
        T: Send,
    {
        let session = Arc::new(QueryEngineSession::new(
            Arc::clone(&self.dispatcher),
            Arc::new(SchemaCacheRegistry::new()),
        ));
        session.initialize(&SessionConfig::default()).await?;

        let outcome = async {
            let report = session
                .attach(std::slice::from_ref(datasource), &AttachOptions::default())
                .await?;
            if let Some(failure) = report.failures.into_iter().next() {
                return Err(EngineError::attachment_failed(failure.datasource_id, failure.error));
            }
            f(Arc::clone(&session)).await
        }
        .await;

        session.close().await?;
        outcome
    }
}

#[async_trait]
impl DatasourceDriver for EngineDriver {
    fn provider_id(&self) -> &str {
        &self.provider
    }

    fn driver_name(&self) -> &'static str {
        "DuckDB attachment driver"
    }

    #[instrument(skip(self, datasource), fields(datasource_id = %datasource.id))]
    async fn test_connection(&self, datasource: &Datasource) -> EngineResult<()> {
        self.with_session(datasource, |_| async { Ok(()) }).await
    }

    #[instrument(skip(self, datasource), fields(datasource_id = %datasource.id))]
    async fn metadata(&self, datasource: &Datasource) -> EngineResult<DatasourceMetadata> {
        self.with_session(datasource, |session| async move { session.metadata().await })
            .await
    }

    #[instrument(skip(self, datasource, sql), fields(datasource_id = %datasource.id))]
    async fn query(&self, datasource: &Datasource, sql: &str) -> EngineResult<QueryResult> {
        let sql = sql.to_string();
        self.with_session(datasource, |session| async move { session.query(&sql).await })
            .await
    }
}
