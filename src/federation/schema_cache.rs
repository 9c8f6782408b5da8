// SPDX-License-Identifier: Apache-2.0

//! Schema Cache
//!
//! Per-conversation nested cache `datasource → schema → table → columns`,
//! with side-maps for provider kind, attached database name and the
//! display-path → query-path translation that ClickHouse needs (its
//! persisted store only exposes `main`, while users see the original
//! schema).
//!
//! Caches are explicit context objects. [`SchemaCacheRegistry`] hands out
//! one instance per conversation id and never shares them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::debug;

use crate::engine::types::{Datasource, DatasourceMetadata, SimpleColumn, SimpleSchema, SimpleTable};

use super::naming::{format_path, looks_fully_qualified, path_format, PathFormat};
use super::provider::{classify_provider, SourceKind};
use super::types::AttachmentResult;

/// Schema used by every table of a persisted single-schema store.
pub const STORE_SCHEMA: &str = "main";

/// Catalog that holds native views in an in-memory engine.
pub const NATIVE_CATALOG: &str = "memory";

type TableMap = BTreeMap<String, Vec<SimpleColumn>>;

/// Everything cached for one datasource.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CachedDatasource {
    pub provider: String,
    pub kind: Option<SourceKind>,
    pub attached_database_name: Option<String>,
    pub schemas: BTreeMap<String, TableMap>,
    /// ClickHouse only: table inside `main` → original schema.
    pub original_schemas: HashMap<String, String>,
    /// Display path → executable query path.
    pub display_to_query: BTreeMap<String, String>,
    /// Executable query paths of every table, sorted.
    pub query_paths: Vec<String>,
}

/// Nested schema cache of one conversation.
#[derive(Debug, Default)]
pub struct SchemaCache {
    entries: HashMap<String, CachedDatasource>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transforms engine metadata into the cache entry of `datasource`,
    /// superseding any previous entry.
    ///
    /// Catalogs match the attached database name case-insensitively. Native
    /// views live in the generic catalog and are matched by the exact view
    /// name recorded in the attachment, since sanitized ids of different
    /// datasources can share a prefix.
    pub fn load_schema_for_datasource(
        &mut self,
        datasource: &Datasource,
        metadata: &DatasourceMetadata,
        attachment: &AttachmentResult,
    ) {
        let kind = classify_provider(&datasource.provider);
        let attached_db = attachment.attached_database_name().map(str::to_string);
        let own_view = match attachment {
            AttachmentResult::View { view_name, .. } => Some(view_name.as_str()),
            AttachmentResult::AttachedDatabase { .. } => None,
        };

        let original_schemas: HashMap<String, String> = match (kind, attachment) {
            (SourceKind::ClickHouse, AttachmentResult::AttachedDatabase { tables, .. }) => tables
                .iter()
                .map(|t| (t.table.clone(), t.schema.clone()))
                .collect(),
            _ => HashMap::new(),
        };

        let mut entry = CachedDatasource {
            provider: datasource.provider.clone(),
            kind: Some(kind),
            attached_database_name: attached_db.clone(),
            original_schemas,
            ..Default::default()
        };

        for schema in metadata.to_simple_schemas() {
            let catalog_matches = match &attached_db {
                Some(db) => schema.database_name.eq_ignore_ascii_case(db),
                None => true,
            };
            if !catalog_matches {
                continue;
            }

            for table in schema.tables {
                if attached_db.is_none() && own_view != Some(table.table_name.as_str()) {
                    continue;
                }
                let query_path = match &attached_db {
                    Some(db) => format_path(&[db, &schema.schema_name, &table.table_name]),
                    None => format_path(&[&schema.schema_name, &table.table_name]),
                };

                let display_schema = entry
                    .original_schemas
                    .get(&table.table_name)
                    .cloned()
                    .unwrap_or_else(|| schema.schema_name.clone());

                if kind == SourceKind::ClickHouse {
                    if let Some(db) = &attached_db {
                        let display_path = format_path(&[db, &display_schema, &table.table_name]);
                        entry
                            .display_to_query
                            .insert(display_path, query_path.clone());
                    }
                }

                entry.query_paths.push(query_path);
                entry
                    .schemas
                    .entry(display_schema)
                    .or_default()
                    .insert(table.table_name, table.columns);
            }
        }

        entry.query_paths.sort();
        entry.query_paths.dedup();

        debug!(
            datasource_id = %datasource.id,
            tables = entry.query_paths.len(),
            "schema cache loaded"
        );
        self.entries.insert(datasource.id.clone(), entry);
    }

    pub fn contains(&self, datasource_id: &str) -> bool {
        self.entries.contains_key(datasource_id)
    }

    pub fn get(&self, datasource_id: &str) -> Option<&CachedDatasource> {
        self.entries.get(datasource_id)
    }

    pub fn datasource_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Columns of one table, in ordinal order.
    pub fn columns(&self, datasource_id: &str, schema: &str, table: &str) -> Option<&[SimpleColumn]> {
        self.entries
            .get(datasource_id)?
            .schemas
            .get(schema)?
            .get(table)
            .map(Vec::as_slice)
    }

    /// Cached schema of a datasource in caller-facing form.
    pub fn simple_schemas(&self, datasource_id: &str) -> Vec<SimpleSchema> {
        let Some(entry) = self.entries.get(datasource_id) else {
            return Vec::new();
        };
        let database_name = entry
            .attached_database_name
            .clone()
            .unwrap_or_else(|| NATIVE_CATALOG.to_string());

        entry
            .schemas
            .iter()
            .map(|(schema_name, tables)| SimpleSchema {
                database_name: database_name.clone(),
                schema_name: schema_name.clone(),
                tables: tables
                    .iter()
                    .map(|(table_name, columns)| SimpleTable {
                        table_name: table_name.clone(),
                        columns: columns.clone(),
                    })
                    .collect(),
            })
            .collect()
    }

    fn format_for(&self, datasource_id: &str) -> PathFormat {
        self.entries
            .get(datasource_id)
            .and_then(|e| e.kind)
            .map(path_format)
            .unwrap_or(PathFormat::ThreePart)
    }

    /// Formats a table reference for a datasource.
    ///
    /// Inputs that already look fully qualified are returned unchanged. For
    /// ClickHouse the result is the display path (original schema); resolve
    /// it with [`Self::get_query_path_for_display_path`] before executing.
    pub fn get_table_path(
        &self,
        datasource_id: &str,
        schema: Option<&str>,
        table: &str,
    ) -> Option<String> {
        let entry = self.entries.get(datasource_id)?;
        let format = self.format_for(datasource_id);
        if looks_fully_qualified(table, format) {
            return Some(table.to_string());
        }

        let schema = schema
            .map(str::to_string)
            .or_else(|| entry.original_schemas.get(table).cloned())
            .unwrap_or_else(|| STORE_SCHEMA.to_string());

        Some(match (format, &entry.attached_database_name) {
            (PathFormat::ThreePart, Some(db)) => format_path(&[db, &schema, table]),
            _ => format_path(&[&schema, table]),
        })
    }

    /// Translates a display path into its executable query path.
    ///
    /// Known query paths translate to themselves.
    pub fn get_query_path_for_display_path(&self, display_path: &str) -> Option<String> {
        self.entries.values().find_map(|entry| {
            entry
                .display_to_query
                .get(display_path)
                .cloned()
                .or_else(|| {
                    entry
                        .query_paths
                        .iter()
                        .find(|p| p.as_str() == display_path)
                        .cloned()
                })
        })
    }

    /// Original ClickHouse schema of a table materialized into `main`.
    pub fn get_clickhouse_original_schema(&self, datasource_id: &str, table: &str) -> Option<String> {
        self.entries
            .get(datasource_id)?
            .original_schemas
            .get(table)
            .cloned()
    }

    /// Every executable table path, across all datasources.
    pub fn get_all_table_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .entries
            .values()
            .flat_map(|e| e.query_paths.iter().cloned())
            .collect();
        paths.sort();
        paths
    }

    /// True when `path` is executable, directly or through translation.
    pub fn has_table_path(&self, path: &str) -> bool {
        self.get_query_path_for_display_path(path).is_some()
    }

    /// Drops every map held for one datasource.
    pub fn invalidate(&mut self, datasource_id: &str) {
        self.entries.remove(datasource_id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// One schema cache per conversation id, created lazily.
#[derive(Debug, Default)]
pub struct SchemaCacheRegistry {
    caches: Mutex<HashMap<String, Arc<RwLock<SchemaCache>>>>,
}

impl SchemaCacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_for(&self, conversation_id: &str) -> Arc<RwLock<SchemaCache>> {
        let mut caches = self.caches.lock();
        Arc::clone(
            caches
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(SchemaCache::new()))),
        )
    }

    pub fn existing(&self, conversation_id: &str) -> Option<Arc<RwLock<SchemaCache>>> {
        self.caches.lock().get(conversation_id).cloned()
    }

    pub fn remove(&self, conversation_id: &str) -> Option<Arc<RwLock<SchemaCache>>> {
        self.caches.lock().remove(conversation_id)
    }

    pub fn conversation_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.caches.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}
