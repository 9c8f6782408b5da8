// SPDX-License-Identifier: Apache-2.0

//! DuckDB-native strategy
//!
//! Flat files and HTTP tables become views over a DuckDB reader function.
//! The view is created under a temporary name, verified, described, and
//! renamed after its content.

use async_trait::async_trait;
use duckdb::Connection;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::handle::{self, execute_sql};
use crate::engine::types::{Datasource, SimpleColumn, SimpleSchema};

use super::dispatcher::AttachmentStrategy;
use super::naming::{native_view_prefix, quote_ident, quote_literal, semantic_name};
use super::provider::SourceKind;
use super::schema_cache::{NATIVE_CATALOG, STORE_SCHEMA};
use super::types::{AttachInput, AttachmentResult};

const LOCATION_KEYS: &[&str] = &["url", "path", "filePath", "file_path", "file", "location"];

/// DuckDB table functions used to read each file family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeReader {
    Csv,
    Tsv,
    Json,
    Parquet,
}

impl NativeReader {
    fn from_extension(location: &str) -> Option<Self> {
        let path = location.split(['?', '#']).next().unwrap_or(location);
        let lower = path.to_ascii_lowercase();
        let lower = lower.strip_suffix(".gz").unwrap_or(&lower);
        if lower.ends_with(".parquet") || lower.ends_with(".pq") {
            Some(Self::Parquet)
        } else if lower.ends_with(".json") || lower.ends_with(".jsonl") || lower.ends_with(".ndjson") {
            Some(Self::Json)
        } else if lower.ends_with(".tsv") || lower.ends_with(".tab") {
            Some(Self::Tsv)
        } else if lower.ends_with(".csv") || lower.ends_with(".txt") {
            Some(Self::Csv)
        } else {
            None
        }
    }

    /// Picks a reader from the provider, then the location's extension.
    /// CSV is the default.
    pub fn resolve(provider: &str, location: &str) -> Self {
        match provider.trim().to_ascii_lowercase().as_str() {
            "csv" => Self::Csv,
            "tsv" => Self::Tsv,
            "json" | "jsonl" | "ndjson" => Self::Json,
            "parquet" => Self::Parquet,
            _ => Self::from_extension(location).unwrap_or(Self::Csv),
        }
    }

    pub fn scan_expression(self, location: &str) -> String {
        let literal = quote_literal(location);
        match self {
            Self::Csv => format!("read_csv_auto({literal})"),
            Self::Tsv => format!("read_csv_auto({literal}, delim = '\t')"),
            Self::Json => format!("read_json_auto({literal})"),
            Self::Parquet => format!("read_parquet({literal})"),
        }
    }
}

/// True for locations that need the HTTP filesystem extension.
pub fn needs_httpfs(location: &str) -> bool {
    let lower = location.trim().to_ascii_lowercase();
    ["http://", "https://", "s3://", "s3a://", "gs://", "gcs://", "r2://", "hf://"]
        .iter()
        .any(|scheme| lower.starts_with(scheme))
}

pub fn source_location(ds: &Datasource) -> EngineResult<String> {
    ds.config_any(LOCATION_KEYS)
        .ok_or_else(|| EngineError::missing_field(&ds.provider, "url"))
}

#[derive(Debug, Default)]
pub struct NativeViewStrategy;

#[async_trait]
impl AttachmentStrategy for NativeViewStrategy {
    fn kind(&self) -> SourceKind {
        SourceKind::NativeView
    }

    #[instrument(skip(self, input), fields(datasource_id = %input.datasource.id))]
    async fn attach(&self, input: &AttachInput<'_>) -> EngineResult<AttachmentResult> {
        let ds = input.datasource;
        let location = source_location(ds)?;
        let reader = NativeReader::resolve(&ds.provider, &location);
        let prefix = native_view_prefix(&ds.id);
        let temp_name = format!("{prefix}tmp_{}", Uuid::new_v4().simple());

        let (view_name, columns) = input
            .handle
            .run(move |conn| {
                if needs_httpfs(&location) {
                    handle::ensure_extension(conn, "httpfs")?;
                }
                let scan = reader.scan_expression(&location);
                execute_sql(
                    conn,
                    &format!(
                        "CREATE OR REPLACE VIEW {} AS SELECT * FROM {scan}",
                        quote_ident(&temp_name)
                    ),
                )?;

                match finalize_view(conn, &temp_name, &prefix) {
                    Ok(done) => Ok(done),
                    Err(e) => {
                        let _ = execute_sql(
                            conn,
                            &format!("DROP VIEW IF EXISTS {}", quote_ident(&temp_name)),
                        );
                        Err(e)
                    }
                }
            })
            .await?;

        info!(
            datasource_id = %ds.id,
            view = %view_name,
            columns = columns.len(),
            "native view attached"
        );

        let schema = input.extract_schema.then(|| {
            SimpleSchema::single_table(NATIVE_CATALOG, STORE_SCHEMA, view_name.clone(), columns)
        });

        Ok(AttachmentResult::View {
            view_name,
            display_name: ds.name.clone(),
            schema,
        })
    }
}

/// Verifies the temporary view, then renames it after its columns.
fn finalize_view(
    conn: &Connection,
    temp_name: &str,
    prefix: &str,
) -> EngineResult<(String, Vec<SimpleColumn>)> {
    {
        let mut stmt = conn.prepare(&format!("SELECT * FROM {} LIMIT 1", quote_ident(temp_name)))?;
        let mut rows = stmt.query([])?;
        rows.next()?;
    }

    let columns = handle::describe_relation(conn, &quote_ident(temp_name))?;
    if columns.is_empty() {
        return Err(EngineError::validation(format!(
            "Source behind view {temp_name} has no columns"
        )));
    }

    let final_name = format!("{prefix}{}", semantic_name(&columns));
    debug!(temp = %temp_name, final_name = %final_name, "renaming native view");

    if let Err(e) = execute_sql(conn, &format!("DROP VIEW IF EXISTS {}", quote_ident(&final_name))) {
        warn!(view = %final_name, error = %e, "could not drop previous view");
    }
    execute_sql(
        conn,
        &format!(
            "ALTER VIEW {} RENAME TO {}",
            quote_ident(temp_name),
            quote_ident(&final_name)
        ),
    )?;

    Ok((final_name, columns))
}
