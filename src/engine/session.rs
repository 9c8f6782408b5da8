// SPDX-License-Identifier: Apache-2.0

//! Query Engine Session
//!
//! Owns the single DuckDB connection of a session and everything attached
//! to it. Attach, detach and DDL are serialized by one async guard; queries
//! only need the connection.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use duckdb::arrow::datatypes::DataType;
use duckdb::types::Value as DuckValue;
use duckdb::Connection;
use parking_lot::RwLock;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::SessionConfig;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::handle::{self, execute_sql, EngineHandle};
use crate::engine::types::{
    AttachOptions, CatalogColumnRow, Datasource, DatasourceMetadata, DeleteTablesResult,
    FailedTable, QueryColumn, QueryResult, QueryStat, RenameTableResult, SessionId,
};
use crate::engine::values::duckdb_to_json;
use crate::federation::naming::{
    attached_database_name, format_path, quote_ident, quote_literal, split_path,
};
use crate::federation::provider::{classify_provider, SourceKind};
use crate::federation::schema_cache::{SchemaCache, SchemaCacheRegistry};
use crate::federation::types::{
    AttachFailure, AttachInput, AttachReport, AttachedSource, AttachmentResult, DetachReport,
    DEFAULT_CONVERSATION,
};
use crate::federation::AttachmentDispatcher;

const CATALOG_QUERY: &str = "SELECT table_catalog, table_schema, table_name, column_name, data_type \
     FROM information_schema.columns \
     WHERE table_catalog NOT IN ('temp', 'system') \
     AND table_schema NOT IN ('information_schema', 'pg_catalog') \
     ORDER BY table_catalog, table_schema, table_name, ordinal_position";

const ROW_KEYWORDS: &[&str] = &[
    "select", "with", "from", "values", "table", "show", "describe", "desc", "summarize",
    "pragma", "explain", "call",
];

static SETTING_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*$").expect("static regex"));

/// Extension required by a working-directory URI, if any.
pub fn extension_for_working_dir(uri: &str) -> Option<&'static str> {
    let scheme = uri.trim().split_once("://")?.0.to_ascii_lowercase();
    match scheme.as_str() {
        "s3" | "s3a" | "gs" | "gcs" | "r2" | "http" | "https" => Some("httpfs"),
        "az" | "azure" | "abfs" | "abfss" => Some("azure"),
        _ => None,
    }
}

/// True when a statement produces a result set.
pub fn returns_rows(sql: &str) -> bool {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, r)| r).unwrap_or("").trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, r)| r).unwrap_or("").trim_start();
        } else if let Some(after) = rest.strip_prefix('(') {
            rest = after.trim_start();
        } else {
            break;
        }
    }

    let keyword: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_lowercase();
    ROW_KEYWORDS.contains(&keyword.as_str())
}

fn setting_value(value: &str) -> String {
    let trimmed = value.trim();
    let is_literal = trimmed.parse::<f64>().is_ok()
        || matches!(trimmed.to_ascii_lowercase().as_str(), "true" | "false");
    if is_literal {
        trimmed.to_string()
    } else {
        quote_literal(trimmed)
    }
}

/// Engine type name for a result column.
fn type_name(data_type: &DataType) -> String {
    match data_type {
        DataType::Null => "NULL".into(),
        DataType::Boolean => "BOOLEAN".into(),
        DataType::Int8 => "TINYINT".into(),
        DataType::Int16 => "SMALLINT".into(),
        DataType::Int32 => "INTEGER".into(),
        DataType::Int64 => "BIGINT".into(),
        DataType::UInt8 => "UTINYINT".into(),
        DataType::UInt16 => "USMALLINT".into(),
        DataType::UInt32 => "UINTEGER".into(),
        DataType::UInt64 => "UBIGINT".into(),
        DataType::Float16 | DataType::Float32 => "FLOAT".into(),
        DataType::Float64 => "DOUBLE".into(),
        DataType::Decimal128(p, s) | DataType::Decimal256(p, s) => format!("DECIMAL({p},{s})"),
        DataType::Utf8 | DataType::LargeUtf8 => "VARCHAR".into(),
        DataType::Binary | DataType::LargeBinary | DataType::FixedSizeBinary(_) => "BLOB".into(),
        DataType::Date32 | DataType::Date64 => "DATE".into(),
        DataType::Time32(_) | DataType::Time64(_) => "TIME".into(),
        DataType::Timestamp(_, Some(_)) => "TIMESTAMP WITH TIME ZONE".into(),
        DataType::Timestamp(_, None) => "TIMESTAMP".into(),
        DataType::Interval(_) | DataType::Duration(_) => "INTERVAL".into(),
        DataType::List(_) | DataType::LargeList(_) | DataType::FixedSizeList(_, _) => "LIST".into(),
        DataType::Struct(_) => "STRUCT".into(),
        DataType::Map(_, _) => "MAP".into(),
        other => format!("{other:?}").to_uppercase(),
    }
}

fn classify_error(err: duckdb::Error) -> EngineError {
    EngineError::from_duckdb(err.to_string())
}

/// Runs one statement.
///
/// `column_count`/`column_name` panic before execution, so rows are
/// collected first and column info is read afterwards.
fn execute_statement(conn: &Connection, sql: &str) -> EngineResult<QueryResult> {
    let start = Instant::now();

    if !returns_rows(sql) {
        let affected = conn.execute(sql, []).map_err(classify_error)? as u64;
        return Ok(QueryResult {
            columns: Vec::new(),
            rows: Vec::new(),
            stat: QueryStat {
                rows_affected: affected,
                rows_read: 0,
                rows_written: affected,
                query_duration_ms: start.elapsed().as_micros() as f64 / 1000.0,
            },
        });
    }

    let mut stmt = conn.prepare(sql).map_err(classify_error)?;
    let mut rows = Vec::new();
    {
        let mapped = stmt
            .query_map([], |row| {
                let width = row.as_ref().column_count();
                (0..width)
                    .map(|i| row.get::<_, DuckValue>(i).map(duckdb_to_json))
                    .collect::<Result<Vec<_>, _>>()
            })
            .map_err(classify_error)?;
        for row in mapped {
            rows.push(row.map_err(|e| EngineError::execution_error(e.to_string()))?);
        }
    }

    let columns = (0..stmt.column_count())
        .map(|i| QueryColumn {
            name: stmt
                .column_name(i)
                .map(|s| s.to_string())
                .unwrap_or_else(|_| format!("col_{i}")),
            data_type: type_name(&stmt.column_type(i)),
        })
        .collect();

    let rows_read = rows.len() as u64;
    Ok(QueryResult {
        columns,
        rows,
        stat: QueryStat {
            rows_affected: 0,
            rows_read,
            rows_written: 0,
            query_duration_ms: start.elapsed().as_micros() as f64 / 1000.0,
        },
    })
}

fn read_catalog(conn: &Connection) -> EngineResult<DatasourceMetadata> {
    let rows = handle::query_string_rows(conn, CATALOG_QUERY, 5)?
        .into_iter()
        .filter_map(|row| {
            let mut fields = row.into_iter();
            Some(CatalogColumnRow {
                catalog: fields.next()??,
                schema: fields.next()??,
                table: fields.next()??,
                column: fields.next()??,
                data_type: fields.next().flatten().unwrap_or_default(),
            })
        })
        .collect();
    Ok(DatasourceMetadata::from_catalog_rows(rows))
}

/// A relation found in the engine catalog.
#[derive(Debug, Clone)]
struct Relation {
    catalog: String,
    schema: String,
    name: String,
    is_view: bool,
}

impl Relation {
    fn qualified(&self) -> String {
        [&self.catalog, &self.schema, &self.name]
            .iter()
            .map(|p| quote_ident(p))
            .collect::<Vec<_>>()
            .join(".")
    }

    fn kind_keyword(&self) -> &'static str {
        if self.is_view {
            "VIEW"
        } else {
            "TABLE"
        }
    }
}

/// Looks up `[catalog.][schema.]name` in the catalog.
fn find_relation(conn: &Connection, path: &str) -> EngineResult<Option<Relation>> {
    let parts: Vec<String> = split_path(path).into_iter().filter(|p| !p.is_empty()).collect();
    let (catalog, schema, name) = match parts.as_slice() {
        [name] => (None, None, name),
        [schema, name] => (None, Some(schema), name),
        [catalog, schema, name] => (Some(catalog), Some(schema), name),
        _ => {
            return Err(EngineError::validation(format!("Invalid table path '{path}'")));
        }
    };

    let mut sql = format!(
        "SELECT table_catalog, table_schema, table_name, table_type FROM information_schema.tables \
         WHERE lower(table_name) = lower({})",
        quote_literal(name)
    );
    if let Some(schema) = schema {
        sql.push_str(&format!(" AND lower(table_schema) = lower({})", quote_literal(schema)));
    }
    if let Some(catalog) = catalog {
        sql.push_str(&format!(" AND lower(table_catalog) = lower({})", quote_literal(catalog)));
    } else {
        sql.push_str(" AND table_catalog NOT IN ('temp', 'system')");
    }
    sql.push_str(" ORDER BY table_catalog = current_database() DESC, table_catalog, table_schema LIMIT 1");

    Ok(handle::query_string_rows(conn, &sql, 4)?
        .into_iter()
        .next()
        .and_then(|row| {
            let mut fields = row.into_iter();
            Some(Relation {
                catalog: fields.next()??,
                schema: fields.next()??,
                name: fields.next()??,
                is_view: fields.next().flatten().is_some_and(|t| t.eq_ignore_ascii_case("VIEW")),
            })
        }))
}

/// Everything kept for one attached datasource.
#[derive(Debug, Clone)]
struct AttachedEntry {
    datasource: Datasource,
    kind: SourceKind,
    conversation_id: String,
    result: AttachmentResult,
}

impl AttachedEntry {
    fn to_source(&self) -> AttachedSource {
        AttachedSource {
            datasource_id: self.datasource.id.clone(),
            datasource_name: self.datasource.name.clone(),
            kind: self.kind,
            conversation_id: self.conversation_id.clone(),
            primary: self.result.primary_table(),
            result: self.result.clone(),
        }
    }

    /// Keeps the attachment result in step with a rename.
    fn apply_rename(&mut self, old: &str, new: &str) {
        match &mut self.result {
            AttachmentResult::View { view_name, schema, .. } => {
                if view_name == old {
                    *view_name = new.to_string();
                    if let Some(table) = schema.as_mut().and_then(|s| s.tables.first_mut()) {
                        table.table_name = new.to_string();
                    }
                }
            }
            AttachmentResult::AttachedDatabase {
                attached_database_name,
                tables,
            } => {
                for table in tables.iter_mut().filter(|t| t.table == old) {
                    let schema = split_path(&table.path)
                        .get(1)
                        .cloned()
                        .unwrap_or_default();
                    table.table = new.to_string();
                    table.path = format_path(&[attached_database_name, &schema, new]);
                }
            }
        }
    }
}

#[derive(Default)]
struct SessionState {
    /// Attach order is preserved
    attached: Vec<AttachedEntry>,
}

impl SessionState {
    fn contains(&self, datasource_id: &str) -> bool {
        self.attached.iter().any(|e| e.datasource.id == datasource_id)
    }

    /// Views recorded for a native datasource, renames included.
    fn view_names(&self, datasource_id: &str) -> Vec<String> {
        self.attached
            .iter()
            .filter(|e| e.datasource.id == datasource_id)
            .filter_map(|e| match &e.result {
                AttachmentResult::View { view_name, .. } => Some(view_name.clone()),
                AttachmentResult::AttachedDatabase { .. } => None,
            })
            .collect()
    }

    fn conversation_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for entry in &self.attached {
            if !ids.contains(&entry.conversation_id.as_str()) {
                ids.push(&entry.conversation_id);
            }
        }
        ids
    }
}

pub struct QueryEngineSession {
    id: SessionId,
    handle: RwLock<Option<Arc<EngineHandle>>>,
    dispatcher: Arc<AttachmentDispatcher>,
    caches: Arc<SchemaCacheRegistry>,
    /// Serializes attach, detach and DDL
    state: Mutex<SessionState>,
}

impl QueryEngineSession {
    pub fn new(dispatcher: Arc<AttachmentDispatcher>, caches: Arc<SchemaCacheRegistry>) -> Self {
        Self {
            id: SessionId::new(),
            handle: RwLock::new(None),
            dispatcher,
            caches,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_initialized(&self) -> bool {
        self.handle.read().is_some()
    }

    pub fn caches(&self) -> &Arc<SchemaCacheRegistry> {
        &self.caches
    }

    /// Schema cache of one conversation.
    pub fn schema_cache(&self, conversation_id: &str) -> Arc<RwLock<SchemaCache>> {
        self.caches.cache_for(conversation_id)
    }

    fn engine(&self) -> EngineResult<Arc<EngineHandle>> {
        self.handle.read().clone().ok_or(EngineError::NotInitialized)
    }

    /// Opens the in-memory engine, loads the working-directory extension
    /// and applies settings. Individual settings that fail are skipped.
    #[instrument(skip(self, config), fields(session_id = %self.id.0, working_dir = ?config.working_dir))]
    pub async fn initialize(&self, config: &SessionConfig) -> EngineResult<()> {
        let _guard = self.state.lock().await;
        if self.is_initialized() {
            return Err(EngineError::AlreadyInitialized);
        }

        let engine = EngineHandle::open_in_memory()?;
        let extension = config.working_dir.as_deref().and_then(extension_for_working_dir);
        let settings = config.settings.clone();

        engine
            .run(move |conn| {
                if let Some(extension) = extension {
                    handle::ensure_extension(conn, extension)?;
                }
                for (key, value) in &settings {
                    if !SETTING_KEY.is_match(key) {
                        warn!(key = %key, "ignoring invalid setting name");
                        continue;
                    }
                    let sql = format!("SET {key} = {}", setting_value(value));
                    if let Err(e) = execute_sql(conn, &sql) {
                        warn!(key = %key, error = %e, "failed to apply setting");
                    }
                }
                Ok(())
            })
            .await?;

        *self.handle.write() = Some(engine);
        info!(session_id = %self.id.0, "query engine initialized");
        Ok(())
    }

    /// Attaches every datasource, native sources first.
    ///
    /// Already attached ids are skipped. Failures are collected and never
    /// abort the batch.
    #[instrument(skip(self, datasources, options), fields(session_id = %self.id.0, count = datasources.len()))]
    pub async fn attach(
        &self,
        datasources: &[Datasource],
        options: &AttachOptions,
    ) -> EngineResult<AttachReport> {
        let engine = self.engine()?;
        let mut state = self.state.lock().await;
        let conversation = options
            .conversation_id
            .clone()
            .unwrap_or_else(|| DEFAULT_CONVERSATION.to_string());

        let mut ordered: Vec<&Datasource> = datasources.iter().collect();
        ordered.sort_by_key(|ds| classify_provider(&ds.provider) != SourceKind::NativeView);

        let mut report = AttachReport::default();
        let mut seen = HashSet::new();
        let mut fresh = Vec::new();

        for ds in ordered {
            if state.contains(&ds.id) || !seen.insert(ds.id.clone()) {
                debug!(datasource_id = %ds.id, "datasource already attached, skipping");
                report.skipped.push(ds.id.clone());
                continue;
            }

            let input = AttachInput {
                handle: &engine,
                datasource: ds,
                conversation_id: Some(&conversation),
                workspace: options.workspace.as_deref(),
                extract_schema: true,
            };

            match self.dispatcher.attach(&input).await {
                Ok(result) => {
                    let entry = AttachedEntry {
                        datasource: ds.clone(),
                        kind: classify_provider(&ds.provider),
                        conversation_id: conversation.clone(),
                        result,
                    };
                    report.attached.push(entry.to_source());
                    fresh.push(entry.clone());
                    state.attached.push(entry);
                }
                Err(e) => {
                    warn!(datasource_id = %ds.id, provider = %ds.provider, error = %e, "datasource attachment failed");
                    report.failures.push(AttachFailure {
                        datasource_id: ds.id.clone(),
                        datasource_name: ds.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if !fresh.is_empty() {
            let metadata = engine.run(read_catalog).await;
            self.load_fresh_caches(metadata, &fresh);
        }

        info!(
            attached = report.attached.len(),
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            "attach batch finished"
        );
        Ok(report)
    }

    /// Best-effort reverse of [`Self::attach`]. Per-source errors land in
    /// the report.
    #[instrument(skip(self, datasources), fields(session_id = %self.id.0, count = datasources.len()))]
    pub async fn detach(&self, datasources: &[Datasource]) -> EngineResult<DetachReport> {
        let engine = self.engine()?;
        let mut state = self.state.lock().await;
        let mut report = DetachReport::default();

        for ds in datasources {
            let kind = classify_provider(&ds.provider);
            let outcome = match kind {
                SourceKind::NativeView => {
                    let views = state.view_names(&ds.id);
                    engine.run(move |conn| drop_views(conn, &views)).await
                }
                _ => {
                    let name = attached_database_name(&ds.id);
                    engine
                        .run(move |conn| {
                            if handle::attached_databases(conn)?.contains(&name) {
                                execute_sql(conn, &format!("DETACH {}", quote_ident(&name)))?;
                            }
                            Ok(())
                        })
                        .await
                }
            };

            let conversations: Vec<String> = state
                .attached
                .iter()
                .filter(|e| e.datasource.id == ds.id)
                .map(|e| e.conversation_id.clone())
                .collect();
            state.attached.retain(|e| e.datasource.id != ds.id);
            for conversation in conversations {
                self.caches.cache_for(&conversation).write().invalidate(&ds.id);
            }

            match outcome {
                Ok(()) => report.detached.push(ds.id.clone()),
                Err(e) => {
                    debug!(datasource_id = %ds.id, error = %e, "detach failed");
                    report.failures.push(AttachFailure {
                        datasource_id: ds.id.clone(),
                        datasource_name: ds.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    /// Executes SQL against the unified namespace.
    #[instrument(skip(self, sql), fields(session_id = %self.id.0))]
    pub async fn query(&self, sql: &str) -> EngineResult<QueryResult> {
        let engine = self.engine()?;
        let sql = sql.to_string();
        let result = engine.run(move |conn| execute_statement(conn, &sql)).await?;
        debug!(
            rows = result.rows.len(),
            duration_ms = result.stat.query_duration_ms,
            "query executed"
        );
        Ok(result)
    }

    /// Catalog of every attached database, temp and system catalogs excluded.
    pub async fn metadata(&self) -> EngineResult<DatasourceMetadata> {
        self.engine()?.run(read_catalog).await
    }

    /// Drops tables or views, whichever each name refers to. Missing names
    /// count as deleted.
    #[instrument(skip(self, table_names), fields(session_id = %self.id.0, count = table_names.len()))]
    pub async fn delete_tables(&self, table_names: &[String]) -> EngineResult<DeleteTablesResult> {
        let engine = self.engine()?;
        let mut state = self.state.lock().await;

        let mut deleted_tables = Vec::new();
        let mut failed_tables = Vec::new();

        for name in table_names {
            let path = self.resolve_query_path(&state, name);
            let outcome = engine
                .run(move |conn| match find_relation(conn, &path)? {
                    Some(relation) => execute_sql(
                        conn,
                        &format!(
                            "DROP {} IF EXISTS {}",
                            relation.kind_keyword(),
                            relation.qualified()
                        ),
                    ),
                    None => Ok(()),
                })
                .await;

            match outcome {
                Ok(()) => deleted_tables.push(name.clone()),
                Err(e) => {
                    warn!(table = %name, error = %e, "failed to delete table");
                    failed_tables.push(FailedTable {
                        table_name: name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        self.refresh_caches(&engine, &mut state).await?;

        let message = if failed_tables.is_empty() {
            format!("Deleted {} table(s)", deleted_tables.len())
        } else {
            format!(
                "Deleted {} table(s), {} failed",
                deleted_tables.len(),
                failed_tables.len()
            )
        };

        Ok(DeleteTablesResult {
            deleted_tables,
            failed_tables,
            message,
        })
    }

    /// Renames a table or view in place. The source must exist and the
    /// destination must not.
    #[instrument(skip(self), fields(session_id = %self.id.0))]
    pub async fn rename_table(&self, old_name: &str, new_name: &str) -> EngineResult<RenameTableResult> {
        let target = split_path(new_name)
            .pop()
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| EngineError::validation("New table name cannot be empty"))?;

        let engine = self.engine()?;
        let mut state = self.state.lock().await;
        let path = self.resolve_query_path(&state, old_name);
        let missing = old_name.to_string();
        let new_target = target.clone();

        let (relation, new_path) = engine
            .run(move |conn| {
                let relation = find_relation(conn, &path)?
                    .ok_or_else(|| EngineError::not_found(format!("Table '{missing}' does not exist")))?;

                let destination = format_path(&[&relation.catalog, &relation.schema, &new_target]);
                if find_relation(conn, &destination)?.is_some() {
                    return Err(EngineError::already_exists(format!(
                        "Table '{destination}' already exists"
                    )));
                }

                execute_sql(
                    conn,
                    &format!(
                        "ALTER {} {} RENAME TO {}",
                        relation.kind_keyword(),
                        relation.qualified(),
                        quote_ident(&new_target)
                    ),
                )?;
                Ok((relation, destination))
            })
            .await?;

        for entry in state.attached.iter_mut() {
            let owns = match entry.result.attached_database_name() {
                Some(db) => db.eq_ignore_ascii_case(&relation.catalog),
                None => true,
            };
            if owns {
                entry.apply_rename(&relation.name, &target);
            }
        }
        self.refresh_caches(&engine, &mut state).await?;

        info!(old = %old_name, new = %new_path, "table renamed");
        Ok(RenameTableResult {
            old_table_name: old_name.to_string(),
            new_table_name: new_path,
            message: format!("Renamed '{old_name}' to '{target}'"),
        })
    }

    /// Ids of attached datasources, in attach order.
    pub async fn attached_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .attached
            .iter()
            .map(|e| e.datasource.id.clone())
            .collect()
    }

    pub async fn attached_sources(&self) -> Vec<AttachedSource> {
        self.state
            .lock()
            .await
            .attached
            .iter()
            .map(AttachedEntry::to_source)
            .collect()
    }

    /// Releases the engine. Safe to call repeatedly or before initialize.
    #[instrument(skip(self), fields(session_id = %self.id.0))]
    pub async fn close(&self) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        let engine = self.handle.write().take();

        for entry in state.attached.drain(..) {
            if let Some(cache) = self.caches.existing(&entry.conversation_id) {
                cache.write().invalidate(&entry.datasource.id);
            }
        }

        if engine.is_some() {
            info!(session_id = %self.id.0, "query engine closed");
        }
        Ok(())
    }

    /// Display paths are translated to executable paths when known. Only
    /// conversations with sources attached to this session are consulted;
    /// the cache registry is shared with other sessions.
    fn resolve_query_path(&self, state: &SessionState, name: &str) -> String {
        state
            .conversation_ids()
            .into_iter()
            .filter_map(|c| self.caches.existing(c))
            .find_map(|cache| cache.read().get_query_path_for_display_path(name))
            .unwrap_or_else(|| name.to_string())
    }

    /// Fills the caches of freshly attached sources. The sources are already
    /// attached and recorded, so a failed catalog read only leaves their
    /// caches empty until the next refresh.
    fn load_fresh_caches(&self, metadata: EngineResult<DatasourceMetadata>, fresh: &[AttachedEntry]) {
        let metadata = match metadata {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(error = %e, sources = fresh.len(), "schema cache load failed after attach");
                return;
            }
        };
        for entry in fresh {
            self.caches
                .cache_for(&entry.conversation_id)
                .write()
                .load_schema_for_datasource(&entry.datasource, &metadata, &entry.result);
        }
    }

    /// Reloads the cache of every attached datasource after DDL.
    async fn refresh_caches(&self, engine: &Arc<EngineHandle>, state: &mut SessionState) -> EngineResult<()> {
        if state.attached.is_empty() {
            return Ok(());
        }
        let metadata = engine.run(read_catalog).await?;
        let mut by_conversation: HashMap<&str, Vec<&AttachedEntry>> = HashMap::new();
        for entry in &state.attached {
            by_conversation
                .entry(entry.conversation_id.as_str())
                .or_default()
                .push(entry);
        }
        for (conversation, entries) in by_conversation {
            let cache = self.caches.cache_for(conversation);
            let mut cache = cache.write();
            for entry in entries {
                cache.load_schema_for_datasource(&entry.datasource, &metadata, &entry.result);
            }
        }
        Ok(())
    }
}

/// Drops exactly the named views. Sanitized ids of distinct datasources can
/// share a prefix, so views are never matched by pattern.
fn drop_views(conn: &Connection, views: &[String]) -> EngineResult<()> {
    for view in views {
        execute_sql(conn, &format!("DROP VIEW IF EXISTS {}", quote_ident(view)))?;
    }
    Ok(())
}
