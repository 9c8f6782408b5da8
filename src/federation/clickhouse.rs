// SPDX-License-Identifier: Apache-2.0

//! ClickHouse strategy
//!
//! The persisted store only exposes the `main` schema, so every table of
//! every ClickHouse database is imported over HTTP into one per-conversation
//! DuckDB file. The original database of each table is kept in the
//! attachment result so the schema cache can rebuild display paths.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use duckdb::types::Value as DuckValue;
use reqwest::Client;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::ClickHouseImportConfig;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::handle::{self, execute_sql};
use crate::engine::types::{Datasource, SimpleColumn, SimpleSchema};
use crate::engine::values::json_to_duckdb;
use crate::observability::Sensitive;

use super::dispatcher::AttachmentStrategy;
use super::http::{ensure_success, transport_error, with_retries, RetryPolicy};
use super::naming::{
    attached_database_name, format_path, qualified, quote_ident, sanitize_identifier, unique_name,
};
use super::provider::SourceKind;
use super::schema_cache::STORE_SCHEMA;
use super::types::{AttachInput, AttachedTable, AttachmentResult};

const DEFAULT_HTTP_PORT: u16 = 8123;
const DATA_SETTINGS: &str = " SETTINGS output_format_json_quote_decimals = 1";
const SYSTEM_DATABASES: &str = "'system', 'INFORMATION_SCHEMA', 'information_schema'";

pub type JsonRow = Map<String, JsonValue>;

/// Where and as whom to reach a ClickHouse HTTP interface.
#[derive(Debug, Clone)]
pub struct ClickHouseEndpoint {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<Sensitive<String>>,
}

impl ClickHouseEndpoint {
    pub fn from_datasource(ds: &Datasource) -> EngineResult<Self> {
        let user = ds.config_any(&["user", "username"]);
        let password = ds.config_str("password").map(Sensitive::new);

        if let Some(raw) = ds.config_any(&["connectionUrl", "connection_url", "url"]) {
            let raw = match raw.strip_prefix("clickhouse://") {
                Some(rest) => format!("http://{rest}"),
                None => raw,
            };
            let mut parsed = Url::parse(&raw)
                .map_err(|e| EngineError::configuration(format!("Invalid ClickHouse URL: {e}")))?;
            let url_user = (!parsed.username().is_empty()).then(|| parsed.username().to_string());
            let url_password = parsed.password().map(|p| Sensitive::new(p.to_string()));
            let _ = parsed.set_username("");
            let _ = parsed.set_password(None);
            return Ok(Self {
                url: parsed.to_string(),
                user: user.or(url_user),
                password: password.or(url_password),
            });
        }

        let host = ds
            .config_str("host")
            .ok_or_else(|| EngineError::missing_field(&ds.provider, "host"))?;
        let port = ds.config_u16("port").unwrap_or(DEFAULT_HTTP_PORT);
        let secure = ds
            .config_bool("secure")
            .or_else(|| ds.config_bool("ssl"))
            .unwrap_or(false);
        let scheme = if secure { "https" } else { "http" };

        Ok(Self {
            url: format!("{scheme}://{host}:{port}/"),
            user,
            password,
        })
    }
}

/// HTTP seam for ClickHouse. Rows come back as `JSONEachRow` objects.
#[async_trait]
pub trait ClickHouseClient: Send + Sync {
    async fn query_rows(&self, endpoint: &ClickHouseEndpoint, sql: &str) -> EngineResult<Vec<JsonRow>>;
}

pub struct HttpClickHouseClient {
    client: Client,
    policy: RetryPolicy,
}

impl HttpClickHouseClient {
    pub fn new(config: &ClickHouseImportConfig) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| EngineError::internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            policy: RetryPolicy::new(config.request_timeout(), config.max_retries),
        })
    }

    async fn send(&self, endpoint: &ClickHouseEndpoint, body: String, timeout: Duration) -> EngineResult<String> {
        let mut request = self.client.post(&endpoint.url).body(body);
        if let Some(user) = &endpoint.user {
            request = request.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &endpoint.password {
            request = request.header("X-ClickHouse-Key", password.expose());
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error("ClickHouse query", timeout, e))?;
        let response = ensure_success("ClickHouse query", response).await?;
        response
            .text()
            .await
            .map_err(|e| transport_error("ClickHouse response", timeout, e))
    }
}

#[async_trait]
impl ClickHouseClient for HttpClickHouseClient {
    async fn query_rows(&self, endpoint: &ClickHouseEndpoint, sql: &str) -> EngineResult<Vec<JsonRow>> {
        let body = format!("{} FORMAT JSONEachRow", sql.trim().trim_end_matches(';'));
        let text = with_retries("ClickHouse query", self.policy, || {
            self.send(endpoint, body.clone(), self.policy.timeout)
        })
        .await?;
        parse_json_each_row(&text)
    }
}

pub fn parse_json_each_row(text: &str) -> EngineResult<Vec<JsonRow>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str::<JsonRow>(line).map_err(|e| {
                EngineError::execution_error(format!("Malformed ClickHouse row: {e}"))
            })
        })
        .collect()
}

/// Backtick-quotes a ClickHouse identifier.
fn ch_ident(name: &str) -> String {
    format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
}

fn row_str(row: &JsonRow, key: &str) -> Option<String> {
    match row.get(key)? {
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Maps a ClickHouse column type to a DuckDB column type.
pub fn map_clickhouse_type(data_type: &str) -> String {
    let trimmed = data_type.trim();
    for wrapper in ["Nullable(", "LowCardinality(", "SimpleAggregateFunction("] {
        if let Some(inner) = trimmed.strip_prefix(wrapper).and_then(|s| s.strip_suffix(')')) {
            let inner = match wrapper {
                "SimpleAggregateFunction(" => inner.split_once(',').map(|(_, t)| t).unwrap_or(inner),
                _ => inner,
            };
            return map_clickhouse_type(inner);
        }
    }

    let base = trimmed.split('(').next().unwrap_or(trimmed);
    if let Some(mapped) = map_decimal(base, trimmed) {
        return mapped;
    }
    let mapped = match base {
        "Bool" | "Boolean" => "BOOLEAN",
        "Int8" => "TINYINT",
        "Int16" => "SMALLINT",
        "Int32" => "INTEGER",
        "Int64" => "BIGINT",
        "Int128" => "HUGEINT",
        "UInt8" => "UTINYINT",
        "UInt16" => "USMALLINT",
        "UInt32" => "UINTEGER",
        "UInt64" => "UBIGINT",
        "UInt128" => "UHUGEINT",
        "Float32" => "FLOAT",
        "Float64" => "DOUBLE",
        "Date" | "Date32" => "DATE",
        "DateTime" | "DateTime64" => "TIMESTAMP",
        // Strings, UUIDs, enums, IPs and every nested type
        _ => "VARCHAR",
    };
    mapped.to_string()
}

/// Exact DuckDB decimal for a ClickHouse decimal type. Precision beyond
/// DuckDB's 38 digits is kept as text.
fn map_decimal(base: &str, full: &str) -> Option<String> {
    let args: Vec<u32> = full
        .strip_prefix(base)
        .and_then(|rest| rest.trim().strip_prefix('('))
        .and_then(|rest| rest.strip_suffix(')'))
        .map(|inner| inner.split(',').filter_map(|a| a.trim().parse().ok()).collect())
        .unwrap_or_default();

    let (precision, scale) = match (base, args.as_slice()) {
        ("Decimal", [p, s]) => (*p, *s),
        ("Decimal", [p]) => (*p, 0),
        ("Decimal", []) => (10, 0),
        ("Decimal32", [s]) => (9, *s),
        ("Decimal64", [s]) => (18, *s),
        ("Decimal128", [s]) => (38, *s),
        ("Decimal256", [s]) => (76, *s),
        ("Decimal" | "Decimal32" | "Decimal64" | "Decimal128" | "Decimal256", _) => {
            return Some("VARCHAR".to_string());
        }
        _ => return None,
    };

    if precision == 0 || precision > 38 || scale > precision {
        return Some("VARCHAR".to_string());
    }
    Some(format!("DECIMAL({precision},{scale})"))
}

pub struct ClickHouseStrategy {
    client: Arc<dyn ClickHouseClient>,
    row_limit: Option<u64>,
}

impl ClickHouseStrategy {
    pub fn new(client: Arc<dyn ClickHouseClient>, row_limit: Option<u64>) -> Self {
        Self { client, row_limit }
    }

    async fn list_remote_tables(
        &self,
        endpoint: &ClickHouseEndpoint,
    ) -> EngineResult<BTreeMap<(String, String), Vec<SimpleColumn>>> {
        let tables = self
            .client
            .query_rows(
                endpoint,
                &format!(
                    "SELECT database, name FROM system.tables \
                     WHERE database NOT IN ({SYSTEM_DATABASES}) AND NOT is_temporary \
                     ORDER BY database, name"
                ),
            )
            .await?;

        let mut out: BTreeMap<(String, String), Vec<SimpleColumn>> = tables
            .iter()
            .filter_map(|row| Some(((row_str(row, "database")?, row_str(row, "name")?), Vec::new())))
            .collect();

        let columns = self
            .client
            .query_rows(
                endpoint,
                &format!(
                    "SELECT database, table, name, type FROM system.columns \
                     WHERE database NOT IN ({SYSTEM_DATABASES}) \
                     ORDER BY database, table, position"
                ),
            )
            .await?;

        for row in &columns {
            let (Some(db), Some(table), Some(name), Some(ty)) = (
                row_str(row, "database"),
                row_str(row, "table"),
                row_str(row, "name"),
                row_str(row, "type"),
            ) else {
                continue;
            };
            if let Some(cols) = out.get_mut(&(db, table)) {
                cols.push(SimpleColumn::new(name, map_clickhouse_type(&ty)));
            }
        }

        Ok(out)
    }

    async fn import_table(
        &self,
        input: &AttachInput<'_>,
        endpoint: &ClickHouseEndpoint,
        store: &str,
        remote: (&str, &str),
        local_name: &str,
        columns: Vec<SimpleColumn>,
    ) -> EngineResult<AttachedTable> {
        let (remote_db, remote_table) = remote;
        if columns.is_empty() {
            return Err(EngineError::validation(format!(
                "ClickHouse table {remote_db}.{remote_table} has no columns"
            )));
        }

        let mut sql = format!("SELECT * FROM {}.{}", ch_ident(remote_db), ch_ident(remote_table));
        if let Some(limit) = self.row_limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        // decimals as strings so JSON parsing never rounds them
        sql.push_str(DATA_SETTINGS);
        let rows = self.client.query_rows(endpoint, &sql).await?;

        if let Some(limit) = self.row_limit {
            if rows.len() as u64 >= limit {
                warn!(
                    datasource_id = %input.datasource.id,
                    table = %remote_table,
                    limit,
                    "ClickHouse import hit the row limit, table is truncated"
                );
            }
        }

        let values: Vec<Vec<DuckValue>> = rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|c| row.get(&c.column_name).map(json_to_duckdb).unwrap_or(DuckValue::Null))
                    .collect()
            })
            .collect();

        let target = qualified(&[store, STORE_SCHEMA, local_name]);
        let width = columns.len();
        let table_columns = columns.clone();
        let row_count = values.len();
        input
            .handle
            .run(move |conn| {
                handle::create_table(conn, &target, &table_columns)?;
                handle::insert_rows(conn, &target, width, &values)
            })
            .await?;

        debug!(table = %local_name, rows = row_count, "ClickHouse table materialized");

        let schema_definition = input.extract_schema.then(|| {
            SimpleSchema::single_table(store, STORE_SCHEMA, local_name, columns)
        });
        Ok(AttachedTable {
            schema: remote_db.to_string(),
            table: local_name.to_string(),
            path: format_path(&[store, STORE_SCHEMA, local_name]),
            schema_definition,
        })
    }
}

/// Local name for a remote table inside the single `main` namespace.
///
/// Collisions fall back to `<schema>_<table>`, then numeric suffixes.
fn local_table_name(schema: &str, table: &str, taken: &HashSet<String>) -> String {
    let table = sanitize_identifier(table);
    if !taken.contains(&table) {
        return table;
    }
    unique_name(&sanitize_identifier(&format!("{schema}_{table}")), taken)
}

#[async_trait]
impl AttachmentStrategy for ClickHouseStrategy {
    fn kind(&self) -> SourceKind {
        SourceKind::ClickHouse
    }

    #[instrument(skip(self, input), fields(datasource_id = %input.datasource.id))]
    async fn attach(&self, input: &AttachInput<'_>) -> EngineResult<AttachmentResult> {
        let ds = input.datasource;
        let endpoint = ClickHouseEndpoint::from_datasource(ds)?;
        let remote = self.list_remote_tables(&endpoint).await?;
        if remote.is_empty() {
            return Err(EngineError::attachment_failed(
                &ds.id,
                "ClickHouse reported no user tables",
            ));
        }

        let store = attached_database_name(&ds.id);
        input.attach_persistent_store(&store).await?;

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

        let mut taken = HashSet::new();
        let mut tables = Vec::new();
        let total = remote.len();

        for ((schema, table), columns) in remote {
            let local = local_table_name(&schema, &table, &taken);
            match self
                .import_table(input, &endpoint, &store, (&schema, &table), &local, columns)
                .await
            {
                Ok(attached) => {
                    taken.insert(local);
                    tables.push(attached);
                }
                Err(e) => warn!(
                    datasource_id = %ds.id,
                    schema = %schema,
                    table = %table,
                    error = %e,
                    "ClickHouse table import failed"
                ),
            }
        }

        if tables.is_empty() {
            let detach = format!("DETACH DATABASE IF EXISTS {}", quote_ident(&store));
            if let Err(e) = input.handle.run(move |conn| execute_sql(conn, &detach)).await {
                warn!(database = %store, error = %e, "could not detach empty ClickHouse store");
            }
            return Err(EngineError::attachment_failed(
                &ds.id,
                format!("none of {total} ClickHouse tables could be imported"),
            ));
        }

        info!(
            datasource_id = %ds.id,
            database = %store,
            imported = tables.len(),
            total,
            "ClickHouse datasource attached"
        );

        Ok(AttachmentResult::AttachedDatabase {
            attached_database_name: store,
            tables,
        })
    }
}
