// SPDX-License-Identifier: Apache-2.0

//! Universal data types for the federation layer
//!
//! These types are shared between the engine session, the attachment
//! strategies and the schema cache.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

// ==================== Datasources ====================

/// A data source as supplied by the datasource repository.
///
/// Immutable for the lifetime of a session. `config` is provider specific:
/// connection fields, a `connectionUrl`, a file `path`/`url`, or a
/// spreadsheet share link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Datasource {
    pub id: String,
    pub name: String,
    pub provider: String,
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub config: Map<String, JsonValue>,
}

impl Datasource {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            provider: provider.into(),
            driver: None,
            config: Map::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Reads a config field as a string. Numbers and booleans are stringified,
    /// empty strings count as absent.
    pub fn config_str(&self, key: &str) -> Option<String> {
        match self.config.get(key)? {
            JsonValue::String(s) if s.trim().is_empty() => None,
            JsonValue::String(s) => Some(s.trim().to_string()),
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// First present field among `keys`.
    pub fn config_any(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|k| self.config_str(k))
    }

    pub fn config_u16(&self, key: &str) -> Option<u16> {
        self.config_str(key).and_then(|v| v.parse().ok())
    }

    pub fn config_bool(&self, key: &str) -> Option<bool> {
        match self.config.get(key)? {
            JsonValue::Bool(b) => Some(*b),
            JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Context passed to a batch attach.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttachOptions {
    /// Conversation owning the schema cache and the persistent attachments.
    pub conversation_id: Option<String>,
    /// Workspace directory holding per-conversation attached database files.
    pub workspace: Option<PathBuf>,
}

impl AttachOptions {
    pub fn for_conversation(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(conversation_id.into()),
            workspace: None,
        }
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }
}

// ==================== Schema ====================

/// Column name and engine type, in the source's ordinal order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SimpleColumn {
    pub column_name: String,
    pub column_type: String,
}

impl SimpleColumn {
    pub fn new(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        Self {
            column_name: name.into(),
            column_type: column_type.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SimpleTable {
    pub table_name: String,
    pub columns: Vec<SimpleColumn>,
}

/// Caller-facing schema artifact, also the unit the schema cache stores.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SimpleSchema {
    pub database_name: String,
    pub schema_name: String,
    pub tables: Vec<SimpleTable>,
}

impl SimpleSchema {
    pub fn single_table(
        database_name: impl Into<String>,
        schema_name: impl Into<String>,
        table_name: impl Into<String>,
        columns: Vec<SimpleColumn>,
    ) -> Self {
        Self {
            database_name: database_name.into(),
            schema_name: schema_name.into(),
            tables: vec![SimpleTable {
                table_name: table_name.into(),
                columns,
            }],
        }
    }
}

// ==================== Query Results ====================

/// Column of a query result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryColumn {
    pub name: String,
    pub data_type: String,
}

/// Execution statistics for one statement
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryStat {
    pub rows_affected: u64,
    pub rows_read: u64,
    pub rows_written: u64,
    pub query_duration_ms: f64,
}

/// Query execution result
///
/// Rows are positional and already converted to JSON: integers beyond the
/// safe-integer range are carried as exact decimal strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<QueryColumn>,
    pub rows: Vec<Vec<JsonValue>>,
    pub stat: QueryStat,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            stat: QueryStat::default(),
        }
    }

    /// Index of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

// ==================== Catalog Metadata ====================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataSchema {
    pub id: u32,
    pub catalog: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataTable {
    pub id: u32,
    pub schema_id: u32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataColumn {
    pub id: u32,
    pub table_id: u32,
    pub name: String,
    pub data_type: String,
}

/// Consolidated catalog across every attached database.
///
/// Ids are synthetic and assigned in catalog, then schema, then table order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasourceMetadata {
    pub schemas: Vec<MetadataSchema>,
    pub tables: Vec<MetadataTable>,
    pub columns: Vec<MetadataColumn>,
}

impl DatasourceMetadata {
    pub fn tables_of(&self, schema_id: u32) -> impl Iterator<Item = &MetadataTable> {
        self.tables.iter().filter(move |t| t.schema_id == schema_id)
    }

    pub fn columns_of(&self, table_id: u32) -> impl Iterator<Item = &MetadataColumn> {
        self.columns.iter().filter(move |c| c.table_id == table_id)
    }

    /// Regroups the flat triple into one `SimpleSchema` per catalog schema.
    pub fn to_simple_schemas(&self) -> Vec<SimpleSchema> {
        let mut columns_by_table: HashMap<u32, Vec<SimpleColumn>> = HashMap::new();
        for column in &self.columns {
            columns_by_table
                .entry(column.table_id)
                .or_default()
                .push(SimpleColumn::new(&column.name, &column.data_type));
        }

        self.schemas
            .iter()
            .map(|schema| SimpleSchema {
                database_name: schema.catalog.clone(),
                schema_name: schema.name.clone(),
                tables: self
                    .tables_of(schema.id)
                    .map(|table| SimpleTable {
                        table_name: table.name.clone(),
                        columns: columns_by_table.remove(&table.id).unwrap_or_default(),
                    })
                    .collect(),
            })
            .collect()
    }
}

/// One row of `information_schema.columns` as read by the session.
#[derive(Debug, Clone)]
pub(crate) struct CatalogColumnRow {
    pub catalog: String,
    pub schema: String,
    pub table: String,
    pub column: String,
    pub data_type: String,
}

impl DatasourceMetadata {
    /// Builds the id-keyed triple from rows already ordered by
    /// catalog, schema, table and ordinal position.
    pub(crate) fn from_catalog_rows(rows: Vec<CatalogColumnRow>) -> Self {
        let mut metadata = DatasourceMetadata::default();
        let mut schema_ids: HashMap<(String, String), u32> = HashMap::new();
        let mut table_ids: HashMap<(String, String, String), u32> = HashMap::new();

        for row in rows {
            let schema_key = (row.catalog.clone(), row.schema.clone());
            let schema_id = match schema_ids.get(&schema_key) {
                Some(id) => *id,
                None => {
                    let id = metadata.schemas.len() as u32 + 1;
                    metadata.schemas.push(MetadataSchema {
                        id,
                        catalog: row.catalog.clone(),
                        name: row.schema.clone(),
                    });
                    schema_ids.insert(schema_key, id);
                    id
                }
            };

            let table_key = (row.catalog, row.schema, row.table.clone());
            let table_id = match table_ids.get(&table_key) {
                Some(id) => *id,
                None => {
                    let id = metadata.tables.len() as u32 + 1;
                    metadata.tables.push(MetadataTable {
                        id,
                        schema_id,
                        name: row.table,
                    });
                    table_ids.insert(table_key, id);
                    id
                }
            };

            let id = metadata.columns.len() as u32 + 1;
            metadata.columns.push(MetadataColumn {
                id,
                table_id,
                name: row.column,
                data_type: row.data_type,
            });
        }

        metadata
    }
}

// ==================== DDL Results ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedTable {
    pub table_name: String,
    pub error: String,
}

/// Result of a bulk table delete
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteTablesResult {
    pub deleted_tables: Vec<String>,
    pub failed_tables: Vec<FailedTable>,
    pub message: String,
}

/// Result of a table rename
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameTableResult {
    pub old_table_name: String,
    pub new_table_name: String,
    pub message: String,
}

/// Unique identifier for an engine session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(catalog: &str, schema: &str, table: &str, column: &str) -> CatalogColumnRow {
        CatalogColumnRow {
            catalog: catalog.into(),
            schema: schema.into(),
            table: table.into(),
            column: column.into(),
            data_type: "VARCHAR".into(),
        }
    }

    #[test]
    fn datasource_config_accessors() {
        let ds = Datasource::new("1", "pg", "postgres")
            .with_config("host", "db")
            .with_config("port", json!(5432))
            .with_config("password", "")
            .with_config("ssl", "true");

        assert_eq!(ds.config_str("host").as_deref(), Some("db"));
        assert_eq!(ds.config_u16("port"), Some(5432));
        assert_eq!(ds.config_str("password"), None);
        assert_eq!(ds.config_bool("ssl"), Some(true));
        assert_eq!(ds.config_any(&["connectionUrl", "host"]).as_deref(), Some("db"));
    }

    #[test]
    fn metadata_ids_follow_catalog_schema_table_order() {
        let metadata = DatasourceMetadata::from_catalog_rows(vec![
            row("a", "main", "t1", "c1"),
            row("a", "main", "t1", "c2"),
            row("a", "main", "t2", "c1"),
            row("b", "public", "t1", "x"),
        ]);

        assert_eq!(metadata.schemas.len(), 2);
        assert_eq!(metadata.schemas[1].catalog, "b");
        assert_eq!(metadata.schemas[1].id, 2);
        assert_eq!(metadata.tables.len(), 3);
        assert_eq!(metadata.tables[2].schema_id, 2);
        assert_eq!(metadata.columns_of(1).count(), 2);

        let schemas = metadata.to_simple_schemas();
        assert_eq!(schemas[0].tables.len(), 2);
        assert_eq!(schemas[0].tables[0].columns[1].column_name, "c2");
        assert_eq!(schemas[1].tables[0].columns[0].column_name, "x");
    }
}
