// SPDX-License-Identifier: Apache-2.0

//! Foreign-Database strategy
//!
//! Attaches Postgres, MySQL, SQLite and DuckDB-file sources through the
//! engine's `ATTACH` dialect, then lists user tables and their columns.

use std::collections::HashMap;

use async_trait::async_trait;
use duckdb::Connection;
use tracing::{debug, info, instrument, warn};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::handle::{self, execute_idempotent};
use crate::engine::types::{SimpleColumn, SimpleSchema};
use crate::observability::sensitive::redact_connection_string;

use super::dispatcher::AttachmentStrategy;
use super::naming::{attached_database_name, format_path, qualified, quote_ident, quote_literal};
use super::provider::{is_system_object, resolve_mapping, ProviderMapping, SourceKind};
use super::types::{AttachInput, AttachedTable, AttachmentResult};

#[derive(Debug, Default)]
pub struct ForeignDatabaseStrategy;

/// `ATTACH '<conn>' AS "<name>" [(TYPE <FAMILY>)]`
pub fn attach_statement(connection_string: &str, name: &str, mapping: &ProviderMapping) -> String {
    let mut sql = format!(
        "ATTACH {} AS {}",
        quote_literal(connection_string),
        quote_ident(name)
    );
    if let Some(kind) = mapping.family.attach_type() {
        sql.push_str(&format!(" (TYPE {kind})"));
    }
    sql
}

#[async_trait]
impl AttachmentStrategy for ForeignDatabaseStrategy {
    fn kind(&self) -> SourceKind {
        SourceKind::ForeignDatabase
    }

    #[instrument(skip(self, input), fields(datasource_id = %input.datasource.id, provider = %input.datasource.provider))]
    async fn attach(&self, input: &AttachInput<'_>) -> EngineResult<AttachmentResult> {
        let ds = input.datasource;
        let mapping = resolve_mapping(&ds.provider).ok_or_else(|| {
            EngineError::not_supported(format!("No attachment strategy for provider '{}'", ds.provider))
        })?;

        let connection_string = (mapping.build_connection_string)(ds)?;
        let name = attached_database_name(&ds.id);
        let extract_schema = input.extract_schema;
        debug!(
            connection = %redact_connection_string(&connection_string),
            database = %name,
            "attaching foreign database"
        );

        let tables = input
            .handle
            .run(move |conn| {
                if let Some(extension) = mapping.extension {
                    handle::ensure_extension(conn, extension)?;
                }

                if !handle::attached_databases(conn)?.iter().any(|db| db == &name) {
                    execute_idempotent(conn, &attach_statement(&connection_string, &name, &mapping))?;
                }

                let listed = list_user_tables(conn, &name, &mapping)?;
                let mut columns = if extract_schema {
                    batched_columns(conn, &name).unwrap_or_else(|e| {
                        warn!(database = %name, error = %e, "batched column query failed");
                        HashMap::new()
                    })
                } else {
                    HashMap::new()
                };

                Ok(listed
                    .into_iter()
                    .map(|(schema, table)| {
                        let schema_definition = if extract_schema {
                            columns
                                .remove(&(schema.clone(), table.clone()))
                                .or_else(|| describe_fallback(conn, &name, &schema, &table))
                                .map(|cols| SimpleSchema::single_table(&name, &schema, &table, cols))
                        } else {
                            None
                        };
                        AttachedTable {
                            path: format_path(&[&name, &schema, &table]),
                            schema,
                            table,
                            schema_definition,
                        }
                    })
                    .collect::<Vec<_>>())
            })
            .await?;

        let attached_database_name = attached_database_name(&ds.id);
        info!(
            datasource_id = %ds.id,
            database = %attached_database_name,
            tables = tables.len(),
            "foreign database attached"
        );

        Ok(AttachmentResult::AttachedDatabase {
            attached_database_name,
            tables,
        })
    }
}

/// User tables via the family's catalog query, falling back to the
/// engine's own `information_schema`.
fn list_user_tables(
    conn: &Connection,
    database: &str,
    mapping: &ProviderMapping,
) -> EngineResult<Vec<(String, String)>> {
    let listed = match handle::query_pairs(conn, &(mapping.table_listing_query)(database)) {
        Ok(rows) => rows,
        Err(e) => {
            debug!(database, error = %e, "family table listing failed, using information_schema");
            handle::query_pairs(
                conn,
                &format!(
                    "SELECT table_schema, table_name FROM information_schema.tables \
                     WHERE table_catalog = {} ORDER BY table_schema, table_name",
                    quote_literal(database)
                ),
            )?
        }
    };

    Ok(listed
        .into_iter()
        .filter(|(schema, table)| !is_system_object(schema, table))
        .collect())
}

/// Every table's columns in one query, keyed by `(schema, table)`.
fn batched_columns(
    conn: &Connection,
    database: &str,
) -> EngineResult<HashMap<(String, String), Vec<SimpleColumn>>> {
    let rows = handle::query_string_rows(
        conn,
        &format!(
            "SELECT table_schema, table_name, column_name, data_type \
             FROM information_schema.columns WHERE table_catalog = {} \
             ORDER BY table_schema, table_name, ordinal_position",
            quote_literal(database)
        ),
        4,
    )?;

    let mut out: HashMap<(String, String), Vec<SimpleColumn>> = HashMap::new();
    for row in rows {
        let mut fields = row.into_iter();
        let (Some(Some(schema)), Some(Some(table)), Some(Some(column)), Some(data_type)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        out.entry((schema, table))
            .or_default()
            .push(SimpleColumn::new(column, data_type.unwrap_or_default()));
    }
    Ok(out)
}

fn describe_fallback(
    conn: &Connection,
    database: &str,
    schema: &str,
    table: &str,
) -> Option<Vec<SimpleColumn>> {
    match handle::describe_relation(conn, &qualified(&[database, schema, table])) {
        Ok(columns) => Some(columns),
        Err(e) => {
            warn!(database, schema, table, error = %e, "schema extraction failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::handle::EngineHandle;
    use crate::engine::types::Datasource;
    use crate::federation::provider::resolve_mapping;

    #[test]
    fn attach_statement_carries_type_clause() {
        let pg = resolve_mapping("postgresql-15").unwrap();
        assert_eq!(
            attach_statement("postgresql://u:p@db:5432/d", "pg1", &pg),
            "ATTACH 'postgresql://u:p@db:5432/d' AS \"pg1\" (TYPE POSTGRES)"
        );

        let duck = resolve_mapping("duckdb").unwrap();
        assert_eq!(
            attach_statement("/tmp/it's.duckdb", "d", &duck),
            "ATTACH '/tmp/it''s.duckdb' AS \"d\""
        );
    }

    #[tokio::test]
    async fn attaches_duckdb_file_and_lists_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warehouse.duckdb");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE customers (id INTEGER, name VARCHAR);
                 CREATE SCHEMA sales;
                 CREATE TABLE sales.orders (id INTEGER, customer_id INTEGER, total DOUBLE);",
            )
            .unwrap();
        }

        let handle = EngineHandle::open_in_memory().unwrap();
        let ds = Datasource::new("wh", "Warehouse", "duckdb")
            .with_config("path", path.to_string_lossy().to_string());
        let input = AttachInput {
            handle: &handle,
            datasource: &ds,
            conversation_id: None,
            workspace: None,
            extract_schema: true,
        };

        let result = ForeignDatabaseStrategy.attach(&input).await.unwrap();
        let AttachmentResult::AttachedDatabase {
            attached_database_name,
            tables,
        } = result
        else {
            panic!("expected an attached database");
        };
        assert_eq!(attached_database_name, "wh");
        let paths: Vec<&str> = tables.iter().map(|t| t.path.as_str()).collect();
        assert_eq!(paths, vec!["wh.main.customers", "wh.sales.orders"]);

        let orders = tables[1].schema_definition.as_ref().unwrap();
        let names: Vec<&str> = orders.tables[0]
            .columns
            .iter()
            .map(|c| c.column_name.as_str())
            .collect();
        assert_eq!(names, vec!["id", "customer_id", "total"]);

        // second attach on the same connection is tolerated
        assert!(ForeignDatabaseStrategy.attach(&input).await.is_ok());
    }

    #[tokio::test]
    async fn missing_host_fails_before_attaching() {
        let handle = EngineHandle::open_in_memory().unwrap();
        let ds = Datasource::new("pg", "pg", "postgres").with_config("user", "u");
        let input = AttachInput {
            handle: &handle,
            datasource: &ds,
            conversation_id: None,
            workspace: None,
            extract_schema: false,
        };
        let err = ForeignDatabaseStrategy.attach(&input).await.unwrap_err();
        assert!(err.is_configuration());
    }
}
