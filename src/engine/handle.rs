// SPDX-License-Identifier: Apache-2.0

//! DuckDB connection handle
//!
//! The `duckdb` crate is synchronous and its `Connection` is `Send` but
//! `!Sync`, so the connection lives behind a `std::sync::Mutex` and every
//! operation runs inside `tokio::task::spawn_blocking`.
//!
//! The free functions below take a `&Connection` and are meant to be called
//! from inside [`EngineHandle::run`].

use std::sync::Arc;

use duckdb::{params_from_iter, types::Value as DuckValue, Connection};
use tracing::{debug, info};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::SimpleColumn;
use crate::federation::naming::{quote_ident, quote_literal};

/// Batch size for inserting imported rows.
const INSERT_BATCH_SIZE: usize = 1000;

/// Owns the single engine connection of a session.
pub struct EngineHandle {
    conn: std::sync::Mutex<Connection>,
}

impl EngineHandle {
    /// Opens a fresh in-memory engine instance.
    pub fn open_in_memory() -> EngineResult<Arc<Self>> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::connection_failed(format!("Failed to open DuckDB: {e}")))?;
        Ok(Arc::new(Self {
            conn: std::sync::Mutex::new(conn),
        }))
    }

    /// Runs a synchronous closure on the connection inside spawn_blocking.
    pub async fn run<F, R>(self: &Arc<Self>, f: F) -> EngineResult<R>
    where
        F: FnOnce(&Connection) -> EngineResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let handle = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let conn = handle.conn.lock().map_err(|e| {
                EngineError::internal(format!("Failed to lock DuckDB connection: {e}"))
            })?;
            f(&conn)
        })
        .await
        .map_err(|e| EngineError::internal(format!("DuckDB task panicked: {e}")))?
    }

    /// Executes one statement without results.
    pub async fn execute(self: &Arc<Self>, sql: String) -> EngineResult<()> {
        self.run(move |conn| execute_sql(conn, &sql)).await
    }
}

pub fn execute_sql(conn: &Connection, sql: &str) -> EngineResult<()> {
    debug!(sql = %sql, "duckdb execute");
    conn.execute_batch(sql).map_err(EngineError::from)
}

/// Executes a statement, treating "already attached/exists" as success.
pub fn execute_idempotent(conn: &Connection, sql: &str) -> EngineResult<()> {
    match execute_sql(conn, sql) {
        Err(e) if e.is_already_exists() => {
            debug!(error = %e, "ignoring already-exists error");
            Ok(())
        }
        other => other,
    }
}

/// Runs a query whose columns are all read as nullable strings.
pub fn query_string_rows(
    conn: &Connection,
    sql: &str,
    width: usize,
) -> EngineResult<Vec<Vec<Option<String>>>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| {
        (0..width)
            .map(|i| row.get::<_, Option<String>>(i))
            .collect::<Result<Vec<_>, _>>()
    })?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Two-column string query with NULLs dropped.
pub fn query_pairs(conn: &Connection, sql: &str) -> EngineResult<Vec<(String, String)>> {
    Ok(query_string_rows(conn, sql, 2)?
        .into_iter()
        .filter_map(|mut row| {
            let second = row.pop().flatten()?;
            let first = row.pop().flatten()?;
            Some((first, second))
        })
        .collect())
}

/// Columns of a table or view, in ordinal order.
pub fn describe_relation(conn: &Connection, qualified_name: &str) -> EngineResult<Vec<SimpleColumn>> {
    let sql = format!("DESCRIBE {qualified_name}");
    Ok(query_pairs(conn, &sql)?
        .into_iter()
        .map(|(name, column_type)| SimpleColumn::new(name, column_type))
        .collect())
}

/// Installs (once) and loads an engine extension.
pub fn ensure_extension(conn: &Connection, extension: &str) -> EngineResult<()> {
    let state = conn
        .query_row(
            "SELECT installed, loaded FROM duckdb_extensions() WHERE extension_name = ?1",
            [extension],
            |row| Ok((row.get::<_, bool>(0)?, row.get::<_, bool>(1)?)),
        )
        .ok();

    let (installed, loaded) = state.unwrap_or((false, false));
    if loaded {
        return Ok(());
    }

    if !installed {
        info!(extension, "installing duckdb extension");
        conn.execute_batch(&format!("INSTALL {extension}"))
            .map_err(|e| EngineError::extension(extension, format!("install failed: {e}")))?;
    }

    conn.execute_batch(&format!("LOAD {extension}"))
        .map_err(|e| EngineError::extension(extension, format!("load failed: {e}")))?;
    debug!(extension, "duckdb extension loaded");
    Ok(())
}

/// Names of the catalogs currently attached.
pub fn attached_databases(conn: &Connection) -> EngineResult<Vec<String>> {
    Ok(query_string_rows(conn, "SELECT name FROM pragma_database_list", 1)?
        .into_iter()
        .filter_map(|mut row| row.pop().flatten())
        .collect())
}

/// Attaches a database file under `name`, tolerating "already attached".
pub fn attach_file(conn: &Connection, path: &str, name: &str) -> EngineResult<()> {
    if attached_databases(conn)?.iter().any(|db| db == name) {
        return Ok(());
    }
    execute_idempotent(
        conn,
        &format!("ATTACH {} AS {}", quote_literal(path), quote_ident(name)),
    )
}

/// Base tables of one attached catalog.
pub fn list_catalog_tables(conn: &Connection, catalog: &str) -> EngineResult<Vec<(String, String)>> {
    query_pairs(
        conn,
        &format!(
            "SELECT table_schema, table_name FROM information_schema.tables \
             WHERE table_catalog = {} AND table_type = 'BASE TABLE' \
             ORDER BY table_schema, table_name",
            quote_literal(catalog)
        ),
    )
}

/// Creates (or replaces) a table with the given engine column types.
pub fn create_table(conn: &Connection, qualified_name: &str, columns: &[SimpleColumn]) -> EngineResult<()> {
    if columns.is_empty() {
        return Err(EngineError::validation(format!(
            "Cannot create table {qualified_name}: no columns"
        )));
    }

    let col_defs: Vec<String> = columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.column_name), c.column_type))
        .collect();

    execute_sql(
        conn,
        &format!("CREATE OR REPLACE TABLE {qualified_name} ({})", col_defs.join(", ")),
    )
}

/// Inserts rows into a table in batches, one transaction per batch.
pub fn insert_rows(
    conn: &Connection,
    qualified_name: &str,
    width: usize,
    rows: &[Vec<DuckValue>],
) -> EngineResult<()> {
    if rows.is_empty() || width == 0 {
        return Ok(());
    }

    let placeholders: Vec<String> = (1..=width).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {qualified_name} VALUES ({})",
        placeholders.join(", ")
    );

    for chunk in rows.chunks(INSERT_BATCH_SIZE) {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| EngineError::internal(format!("DuckDB transaction failed: {e}")))?;
        {
            let mut stmt = tx.prepare_cached(&sql)?;
            for row in chunk {
                stmt.execute(params_from_iter(row.iter()))
                    .map_err(|e| EngineError::execution_error(format!("DuckDB insert failed: {e}")))?;
            }
        }
        tx.commit()
            .map_err(|e| EngineError::internal(format!("DuckDB commit failed: {e}")))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_executes_on_connection() {
        let handle = EngineHandle::open_in_memory().unwrap();
        let answer = handle
            .run(|conn| {
                conn.query_row("SELECT 40 + 2", [], |row| row.get::<_, i64>(0))
                    .map_err(EngineError::from)
            })
            .await
            .unwrap();
        assert_eq!(answer, 42);
    }

    #[tokio::test]
    async fn create_insert_and_describe() {
        let handle = EngineHandle::open_in_memory().unwrap();
        handle
            .run(|conn| {
                let columns = vec![
                    SimpleColumn::new("id", "BIGINT"),
                    SimpleColumn::new("name", "VARCHAR"),
                ];
                create_table(conn, "\"people\"", &columns)?;
                insert_rows(
                    conn,
                    "\"people\"",
                    2,
                    &[
                        vec![DuckValue::BigInt(1), DuckValue::Text("ada".into())],
                        vec![DuckValue::BigInt(2), DuckValue::Null],
                    ],
                )?;

                let described = describe_relation(conn, "\"people\"")?;
                assert_eq!(described, columns);

                let count: i64 =
                    conn.query_row("SELECT count(*) FROM people", [], |row| row.get(0))?;
                assert_eq!(count, 2);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_table_requires_columns() {
        let handle = EngineHandle::open_in_memory().unwrap();
        let err = handle
            .run(|conn| create_table(conn, "\"empty\"", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ValidationError { .. }));
    }

    #[tokio::test]
    async fn attach_file_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.duckdb").to_string_lossy().to_string();
        let handle = EngineHandle::open_in_memory().unwrap();
        handle
            .run(move |conn| {
                attach_file(conn, &path, "store")?;
                attach_file(conn, &path, "store")?;
                assert!(attached_databases(conn)?.contains(&"store".to_string()));
                Ok(())
            })
            .await
            .unwrap();
    }
}
