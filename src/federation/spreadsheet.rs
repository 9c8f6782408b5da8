// SPDX-License-Identifier: Apache-2.0

//! Spreadsheet strategy
//!
//! Share links are resolved to a spreadsheet id, tabs are discovered from
//! the public HTML view (best-effort), and every tab that exports valid CSV
//! becomes a table in a per-conversation persistent store.

use std::collections::HashSet;
use std::io::Write;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use tracing::{debug, info, instrument, warn};

use crate::config::SpreadsheetConfig;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::handle::{self, execute_sql};
use crate::engine::types::SimpleSchema;

use super::dispatcher::AttachmentStrategy;
use super::http::{ensure_success, transport_error, with_retries, RetryPolicy};
use super::naming::{attached_database_name, format_path, qualified, quote_literal, sanitize_identifier, unique_name};
use super::provider::SourceKind;
use super::schema_cache::STORE_SCHEMA;
use super::types::{AttachInput, AttachedTable, AttachmentResult};

const LINK_KEYS: &[&str] = &["url", "shareLink", "share_link", "spreadsheetUrl", "link"];
const DEFAULT_GID: &str = "0";
const SHEETS_BASE: &str = "https://docs.google.com/spreadsheets/d";

static SPREADSHEET_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/spreadsheets/d/([a-zA-Z0-9_-]+)").expect("static regex"));

static GID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[#&?]gid=(\d+)").expect("static regex"));

static TAB_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"name:\s*"([^"]*)"[^}]*?gid:\s*"(\d+)""#).expect("static regex")
});

pub fn parse_spreadsheet_id(link: &str) -> Option<String> {
    SPREADSHEET_ID.captures(link).map(|c| c[1].to_string())
}

pub fn parse_gid(link: &str) -> Option<String> {
    GID.captures(link).map(|c| c[1].to_string())
}

/// One exportable tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetTab {
    pub gid: String,
    pub title: Option<String>,
}

/// Extracts `(title, gid)` pairs from the HTML view, deduplicated by gid.
pub fn scrape_tabs(html: &str) -> Vec<SheetTab> {
    let mut seen = HashSet::new();
    TAB_ENTRY
        .captures_iter(html)
        .filter_map(|c| {
            let gid = c[2].to_string();
            seen.insert(gid.clone()).then(|| SheetTab {
                gid,
                title: Some(c[1].to_string()).filter(|t| !t.trim().is_empty()),
            })
        })
        .collect()
}

/// Tabs to import: discovered ones plus the link's own gid, or gid 0.
pub fn plan_tabs(discovered: Vec<SheetTab>, explicit_gid: Option<String>) -> Vec<SheetTab> {
    let mut tabs = discovered;
    if let Some(gid) = explicit_gid {
        if !tabs.iter().any(|t| t.gid == gid) {
            tabs.push(SheetTab { gid, title: None });
        }
    }
    if tabs.is_empty() {
        tabs.push(SheetTab {
            gid: DEFAULT_GID.to_string(),
            title: None,
        });
    }
    tabs
}

/// Rejects HTML error pages and exports without a header row.
pub fn validate_csv(body: &str) -> EngineResult<usize> {
    let trimmed = body.trim_start();
    if trimmed.is_empty() {
        return Err(EngineError::validation("Tab export is empty"));
    }
    if trimmed.starts_with('<') {
        return Err(EngineError::validation(
            "Tab export returned HTML, the sheet is probably not shared publicly",
        ));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(body.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| EngineError::validation(format!("Tab export is not valid CSV: {e}")))?;
    let width = headers.iter().filter(|h| !h.trim().is_empty()).count();
    if width == 0 {
        return Err(EngineError::validation("Tab export has no header row"));
    }
    Ok(width)
}

/// HTTP seam for spreadsheet exports.
#[async_trait]
pub trait SpreadsheetClient: Send + Sync {
    /// HTML view used for tab discovery.
    async fn fetch_tab_metadata(&self, spreadsheet_id: &str) -> EngineResult<String>;
    async fn fetch_tab_csv(&self, spreadsheet_id: &str, gid: &str) -> EngineResult<String>;
}

pub struct HttpSpreadsheetClient {
    client: Client,
    discovery: RetryPolicy,
    download: RetryPolicy,
}

impl HttpSpreadsheetClient {
    pub fn new(config: &SpreadsheetConfig) -> EngineResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| EngineError::internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            discovery: RetryPolicy::new(config.discovery_timeout(), config.max_retries),
            download: RetryPolicy::new(config.download_timeout(), config.max_retries),
        })
    }

    async fn get_text(&self, operation: &'static str, url: String, policy: RetryPolicy) -> EngineResult<String> {
        with_retries(operation, policy, || {
            let request = self.client.get(&url).timeout(policy.timeout);
            async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| transport_error(operation, policy.timeout, e))?;
                ensure_success(operation, response)
                    .await?
                    .text()
                    .await
                    .map_err(|e| transport_error(operation, policy.timeout, e))
            }
        })
        .await
    }
}

#[async_trait]
impl SpreadsheetClient for HttpSpreadsheetClient {
    async fn fetch_tab_metadata(&self, spreadsheet_id: &str) -> EngineResult<String> {
        self.get_text(
            "spreadsheet tab discovery",
            format!("{SHEETS_BASE}/{spreadsheet_id}/htmlview"),
            self.discovery,
        )
        .await
    }

    async fn fetch_tab_csv(&self, spreadsheet_id: &str, gid: &str) -> EngineResult<String> {
        self.get_text(
            "spreadsheet tab download",
            format!("{SHEETS_BASE}/{spreadsheet_id}/export?format=csv&gid={gid}"),
            self.download,
        )
        .await
    }
}

pub struct SpreadsheetStrategy {
    client: Arc<dyn SpreadsheetClient>,
}

impl SpreadsheetStrategy {
    pub fn new(client: Arc<dyn SpreadsheetClient>) -> Self {
        Self { client }
    }

    async fn discover(&self, spreadsheet_id: &str) -> Vec<SheetTab> {
        match self.client.fetch_tab_metadata(spreadsheet_id).await {
            Ok(html) => {
                let tabs = scrape_tabs(&html);
                debug!(spreadsheet_id, tabs = tabs.len(), "spreadsheet tabs discovered");
                tabs
            }
            Err(e) => {
                warn!(spreadsheet_id, error = %e, "spreadsheet tab discovery failed");
                Vec::new()
            }
        }
    }

    async fn import_tab(
        &self,
        input: &AttachInput<'_>,
        spreadsheet_id: &str,
        store: &str,
        tab: &SheetTab,
        table_name: &str,
    ) -> EngineResult<AttachedTable> {
        let body = self.client.fetch_tab_csv(spreadsheet_id, &tab.gid).await?;
        validate_csv(&body)?;

        let target = qualified(&[store, STORE_SCHEMA, table_name]);
        let columns = input
            .handle
            .run(move |conn| {
                let mut file = tempfile::Builder::new()
                    .prefix("qore-sheet-")
                    .suffix(".csv")
                    .tempfile()
                    .map_err(|e| EngineError::internal(format!("Cannot create temp file: {e}")))?;
                file.write_all(body.as_bytes())
                    .and_then(|_| file.flush())
                    .map_err(|e| EngineError::internal(format!("Cannot write temp file: {e}")))?;

                let path = file.path().to_string_lossy().to_string();
                execute_sql(
                    conn,
                    &format!(
                        "CREATE OR REPLACE TABLE {target} AS SELECT * FROM read_csv_auto({}, header = true)",
                        quote_literal(&path)
                    ),
                )?;
                handle::describe_relation(conn, &target)
            })
            .await?;

        let schema_definition = input
            .extract_schema
            .then(|| SimpleSchema::single_table(store, STORE_SCHEMA, table_name, columns));

        Ok(AttachedTable {
            schema: STORE_SCHEMA.to_string(),
            table: table_name.to_string(),
            path: format_path(&[store, STORE_SCHEMA, table_name]),
            schema_definition,
        })
    }
}

fn tab_base_name(tab: &SheetTab, datasource_name: &str, single: bool) -> String {
    match &tab.title {
        Some(title) => sanitize_identifier(title),
        None if single => sanitize_identifier(datasource_name),
        None => format!("sheet_{}", tab.gid),
    }
}

#[async_trait]
impl AttachmentStrategy for SpreadsheetStrategy {
    fn kind(&self) -> SourceKind {
        SourceKind::Spreadsheet
    }

    #[instrument(skip(self, input), fields(datasource_id = %input.datasource.id))]
    async fn attach(&self, input: &AttachInput<'_>) -> EngineResult<AttachmentResult> {
        let ds = input.datasource;
        let link = ds
            .config_any(LINK_KEYS)
            .ok_or_else(|| EngineError::missing_field(&ds.provider, "url"))?;
        let spreadsheet_id = parse_spreadsheet_id(&link).ok_or_else(|| {
            EngineError::configuration(format!("'{link}' is not a spreadsheet share link"))
        })?;

        let tabs = plan_tabs(self.discover(&spreadsheet_id).await, parse_gid(&link));

        let store = attached_database_name(&ds.id);
        input.attach_persistent_store(&store).await?;

        // Old tables would keep stale names after a tab rename
        let stale_store = store.clone();
        input
            .handle
            .run(move |conn| {
                for (schema, table) in handle::list_catalog_tables(conn, &stale_store)? {
                    execute_sql(
                        conn,
                        &format!("DROP TABLE IF EXISTS {}", qualified(&[&stale_store, &schema, &table])),
                    )?;
                }
                Ok(())
            })
            .await?;

        let single = tabs.len() == 1;
        let mut taken = HashSet::new();
        let mut tables = Vec::new();

        for tab in &tabs {
            let name = unique_name(&tab_base_name(tab, &ds.name, single), &taken);
            match self.import_tab(input, &spreadsheet_id, &store, tab, &name).await {
                Ok(table) => {
                    taken.insert(name);
                    tables.push(table);
                }
                Err(e) => warn!(
                    datasource_id = %ds.id,
                    gid = %tab.gid,
                    error = %e,
                    "spreadsheet tab import failed"
                ),
            }
        }

        if tables.is_empty() {
            return Err(EngineError::attachment_failed(
                &ds.id,
                format!("none of {} spreadsheet tabs could be imported", tabs.len()),
            ));
        }

        info!(
            datasource_id = %ds.id,
            database = %store,
            tabs = tables.len(),
            "spreadsheet attached"
        );

        Ok(AttachmentResult::AttachedDatabase {
            attached_database_name: store,
            tables,
        })
    }
}
