// SPDX-License-Identifier: Apache-2.0

//! Attachment Dispatcher
//!
//! Closed dispatch over the four source kinds. Providers are matched
//! directly first, then through the provider mapping registry. The
//! foreign-database strategy is the last resort.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::QoreFederationConfig;
use crate::engine::error::EngineResult;

use super::clickhouse::{ClickHouseClient, ClickHouseStrategy, HttpClickHouseClient};
use super::foreign::ForeignDatabaseStrategy;
use super::native::NativeViewStrategy;
use super::provider::{classify_provider, SourceKind};
use super::spreadsheet::{HttpSpreadsheetClient, SpreadsheetClient, SpreadsheetStrategy};
use super::types::{AttachInput, AttachmentResult};

/// One way of making a datasource visible to the engine.
#[async_trait]
pub trait AttachmentStrategy: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn attach(&self, input: &AttachInput<'_>) -> EngineResult<AttachmentResult>;
}

pub struct AttachmentDispatcher {
    native: NativeViewStrategy,
    foreign: ForeignDatabaseStrategy,
    clickhouse: ClickHouseStrategy,
    spreadsheet: SpreadsheetStrategy,
}

impl AttachmentDispatcher {
    /// Dispatcher with the HTTP-backed network clients.
    pub fn from_config(config: &QoreFederationConfig) -> EngineResult<Self> {
        Ok(Self::with_clients(
            Arc::new(HttpClickHouseClient::new(&config.clickhouse)?),
            Arc::new(HttpSpreadsheetClient::new(&config.spreadsheet)?),
            config.clickhouse.row_limit,
        ))
    }

    pub fn with_clients(
        clickhouse: Arc<dyn ClickHouseClient>,
        spreadsheet: Arc<dyn SpreadsheetClient>,
        clickhouse_row_limit: Option<u64>,
    ) -> Self {
        Self {
            native: NativeViewStrategy,
            foreign: ForeignDatabaseStrategy,
            clickhouse: ClickHouseStrategy::new(clickhouse, clickhouse_row_limit),
            spreadsheet: SpreadsheetStrategy::new(spreadsheet),
        }
    }

    pub fn strategy(&self, kind: SourceKind) -> &dyn AttachmentStrategy {
        match kind {
            SourceKind::NativeView => &self.native,
            SourceKind::ForeignDatabase => &self.foreign,
            SourceKind::ClickHouse => &self.clickhouse,
            SourceKind::Spreadsheet => &self.spreadsheet,
        }
    }

    pub fn strategy_for(&self, provider: &str) -> &dyn AttachmentStrategy {
        self.strategy(classify_provider(provider))
    }

    pub async fn attach(&self, input: &AttachInput<'_>) -> EngineResult<AttachmentResult> {
        let strategy = self.strategy_for(&input.datasource.provider);
        debug!(
            datasource_id = %input.datasource.id,
            kind = ?strategy.kind(),
            "dispatching attachment"
        );
        strategy.attach(input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::error::EngineError;
    use crate::federation::clickhouse::{ClickHouseEndpoint, JsonRow};

    struct Offline;

    #[async_trait]
    impl ClickHouseClient for Offline {
        async fn query_rows(&self, _: &ClickHouseEndpoint, _: &str) -> EngineResult<Vec<JsonRow>> {
            Err(EngineError::network("offline"))
        }
    }

    #[async_trait]
    impl SpreadsheetClient for Offline {
        async fn fetch_tab_metadata(&self, _: &str) -> EngineResult<String> {
            Err(EngineError::network("offline"))
        }

        async fn fetch_tab_csv(&self, _: &str, _: &str) -> EngineResult<String> {
            Err(EngineError::network("offline"))
        }
    }

    #[test]
    fn providers_select_strategies() {
        let offline = Arc::new(Offline);
        let dispatcher = AttachmentDispatcher::with_clients(offline.clone(), offline, Some(10));

        let cases = [
            ("csv", SourceKind::NativeView),
            ("parquet", SourceKind::NativeView),
            ("postgresql-16", SourceKind::ForeignDatabase),
            ("sqlite", SourceKind::ForeignDatabase),
            ("clickhouse", SourceKind::ClickHouse),
            ("clickhouse-cloud", SourceKind::ClickHouse),
            ("google-sheets", SourceKind::Spreadsheet),
            ("something-new", SourceKind::ForeignDatabase),
        ];
        for (provider, kind) in cases {
            assert_eq!(dispatcher.strategy_for(provider).kind(), kind, "{provider}");
        }
    }
}
