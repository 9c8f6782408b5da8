// SPDX-License-Identifier: Apache-2.0

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use qore_federation::config::{QoreFederationConfig, SessionConfig};
use qore_federation::engine::{
    AttachOptions, Datasource, DriverRegistry, EngineError, EngineResult,
    InMemoryDatasourceRepository, QueryEngineSession, SessionManager,
};
use qore_federation::federation::clickhouse::{ClickHouseClient, ClickHouseEndpoint, JsonRow};
use qore_federation::federation::spreadsheet::SpreadsheetClient;
use qore_federation::federation::{AttachmentDispatcher, AttachmentResult, SchemaCacheRegistry};
use serde_json::{json, Value as JsonValue};

const CONVERSATION: &str = "conv-1";

fn rows(values: JsonValue) -> Vec<JsonRow> {
    values
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_object().unwrap().clone())
        .collect()
}

/// Answers the catalog and data queries of a two-database ClickHouse server.
struct MockClickHouse;

#[async_trait]
impl ClickHouseClient for MockClickHouse {
    async fn query_rows(&self, _endpoint: &ClickHouseEndpoint, sql: &str) -> EngineResult<Vec<JsonRow>> {
        if sql.contains("FROM system.tables") {
            return Ok(rows(json!([
                {"database": "analytics", "name": "events"},
                {"database": "default", "name": "users"},
            ])));
        }
        if sql.contains("FROM system.columns") {
            return Ok(rows(json!([
                {"database": "analytics", "table": "events", "name": "id", "type": "Int64"},
                {"database": "analytics", "table": "events", "name": "kind", "type": "LowCardinality(String)"},
                {"database": "default", "table": "users", "name": "id", "type": "UInt32"},
                {"database": "default", "table": "users", "name": "email", "type": "Nullable(String)"},
            ])));
        }
        if sql.contains("`analytics`.`events`") {
            return Ok(rows(json!([
                {"id": 1, "kind": "click"},
                {"id": 2, "kind": "view"},
            ])));
        }
        if sql.contains("`default`.`users`") {
            return Ok(rows(json!([{"id": 7, "email": null}])));
        }
        Err(EngineError::execution_error(format!("unexpected query: {sql}")))
    }
}

/// Same server as [`MockClickHouse`], but data reads of the listed tables fail.
struct FlakyClickHouse {
    failing: &'static [&'static str],
}

#[async_trait]
impl ClickHouseClient for FlakyClickHouse {
    async fn query_rows(&self, endpoint: &ClickHouseEndpoint, sql: &str) -> EngineResult<Vec<JsonRow>> {
        if self.failing.iter().any(|table| sql.contains(table)) {
            return Err(EngineError::network("connection reset by peer"));
        }
        MockClickHouse.query_rows(endpoint, sql).await
    }
}

/// One ledger table with a high-precision decimal column.
struct LedgerClickHouse;

#[async_trait]
impl ClickHouseClient for LedgerClickHouse {
    async fn query_rows(&self, _endpoint: &ClickHouseEndpoint, sql: &str) -> EngineResult<Vec<JsonRow>> {
        if sql.contains("FROM system.tables") {
            return Ok(rows(json!([{"database": "finance", "name": "ledger"}])));
        }
        if sql.contains("FROM system.columns") {
            return Ok(rows(json!([
                {"database": "finance", "table": "ledger", "name": "amount", "type": "Decimal(18, 4)"},
            ])));
        }
        if sql.contains("`finance`.`ledger`") && sql.contains("output_format_json_quote_decimals = 1") {
            return Ok(rows(json!([
                {"amount": "12345678901234.5678"},
                {"amount": "0.0001"},
            ])));
        }
        Err(EngineError::execution_error(format!("unexpected query: {sql}")))
    }
}

/// Public sheet whose HTML view cannot be fetched.
struct MockSheets;

#[async_trait]
impl SpreadsheetClient for MockSheets {
    async fn fetch_tab_metadata(&self, _spreadsheet_id: &str) -> EngineResult<String> {
        Err(EngineError::network("discovery blocked"))
    }

    async fn fetch_tab_csv(&self, _spreadsheet_id: &str, gid: &str) -> EngineResult<String> {
        match gid {
            "0" => Ok("team,score\nred,3\nblue,5\n".to_string()),
            _ => Err(EngineError::not_found(format!("no tab {gid}"))),
        }
    }
}

fn mock_dispatcher() -> Arc<AttachmentDispatcher> {
    Arc::new(AttachmentDispatcher::with_clients(
        Arc::new(MockClickHouse),
        Arc::new(MockSheets),
        Some(1000),
    ))
}

fn dispatcher_with(clickhouse: impl ClickHouseClient + 'static) -> Arc<AttachmentDispatcher> {
    Arc::new(AttachmentDispatcher::with_clients(
        Arc::new(clickhouse),
        Arc::new(MockSheets),
        Some(1000),
    ))
}

async fn open_session(dispatcher: Arc<AttachmentDispatcher>) -> QueryEngineSession {
    let session = QueryEngineSession::new(dispatcher, Arc::new(SchemaCacheRegistry::new()));
    session.initialize(&SessionConfig::default()).await.unwrap();
    session
}

fn csv_source(dir: &Path, id: &str) -> Datasource {
    let path = dir.join(format!("{id}.csv"));
    std::fs::write(&path, "id,product,amount\n1,lamp,20\n2,desk,150\n3,lamp,25\n").unwrap();
    Datasource::new(id, "Sales export", "csv").with_config("path", path.to_string_lossy().to_string())
}

fn clickhouse_source() -> Datasource {
    Datasource::new("ch", "Events warehouse", "clickhouse")
        .with_config("host", "clickhouse.internal")
        .with_config("user", "reader")
}

fn sheet_source() -> Datasource {
    Datasource::new("sheet1", "Team Scores", "google-sheets").with_config(
        "url",
        "https://docs.google.com/spreadsheets/d/1AbC-dEf_123/edit",
    )
}

#[tokio::test]
async fn csv_becomes_a_semantically_named_view() {
    let dir = tempfile::tempdir().unwrap();
    let session = open_session(mock_dispatcher()).await;

    let report = session
        .attach(&[csv_source(dir.path(), "sales")], &AttachOptions::for_conversation(CONVERSATION))
        .await
        .unwrap();
    assert!(report.is_complete_success());

    let attached = &report.attached[0];
    match &attached.result {
        AttachmentResult::View { view_name, .. } => assert_eq!(view_name, "sales_product_amount"),
        other => panic!("expected a view, got {other:?}"),
    }

    let cache = session.schema_cache(CONVERSATION);
    let path = cache.read().get_table_path("sales", None, "sales_product_amount").unwrap();
    assert_eq!(path, "main.sales_product_amount");

    let result = session
        .query(&format!("SELECT sum(amount) AS total FROM {path} WHERE product = 'lamp'"))
        .await
        .unwrap();
    assert_eq!(result.rows[0][0], json!(45));
}

#[tokio::test]
async fn clickhouse_tables_keep_their_original_schema() {
    let session = open_session(mock_dispatcher()).await;
    let report = session
        .attach(&[clickhouse_source()], &AttachOptions::for_conversation(CONVERSATION))
        .await
        .unwrap();
    assert!(report.is_complete_success(), "{:?}", report.failures);
    assert_eq!(report.attached[0].result.attached_database_name(), Some("ch"));
    assert_eq!(report.attached[0].result.table_count(), 2);

    let cache = session.schema_cache(CONVERSATION);
    let cache = cache.read();
    assert_eq!(
        cache.get_clickhouse_original_schema("ch", "events").as_deref(),
        Some("analytics")
    );
    assert_eq!(
        cache.get_clickhouse_original_schema("ch", "users").as_deref(),
        Some("default")
    );

    let display = cache.get_table_path("ch", None, "events").unwrap();
    assert_eq!(display, "ch.analytics.events");
    let query_path = cache.get_query_path_for_display_path(&display).unwrap();
    assert_eq!(query_path, "ch.main.events");
    assert!(cache.has_table_path("ch.default.users"));
    assert_eq!(
        cache.get_all_table_paths(),
        vec!["ch.main.events".to_string(), "ch.main.users".to_string()]
    );
    drop(cache);

    let result = session
        .query(&format!("SELECT count(*) AS n FROM {query_path}"))
        .await
        .unwrap();
    assert_eq!(result.rows[0][0], json!(2));

    let nulls = session
        .query("SELECT email FROM ch.main.users")
        .await
        .unwrap();
    assert_eq!(nulls.rows, vec![vec![JsonValue::Null]]);
}

#[tokio::test]
async fn clickhouse_partial_import_keeps_successful_tables() {
    let session = open_session(dispatcher_with(FlakyClickHouse {
        failing: &["`analytics`.`events`"],
    }))
    .await;
    let report = session
        .attach(&[clickhouse_source()], &AttachOptions::for_conversation(CONVERSATION))
        .await
        .unwrap();
    assert!(report.is_complete_success(), "{:?}", report.failures);
    assert_eq!(report.attached[0].result.table_count(), 1);

    let cache = session.schema_cache(CONVERSATION);
    assert_eq!(cache.read().get_all_table_paths(), vec!["ch.main.users".to_string()]);
    assert_eq!(
        cache.read().get_clickhouse_original_schema("ch", "users").as_deref(),
        Some("default")
    );
    assert!(cache.read().get_clickhouse_original_schema("ch", "events").is_none());

    let users = session.query("SELECT id FROM ch.main.users").await.unwrap();
    assert_eq!(users.rows, vec![vec![json!(7)]]);
    assert!(session.query("SELECT * FROM ch.main.events").await.is_err());
}

#[tokio::test]
async fn clickhouse_without_importable_tables_fails_alone() {
    let dir = tempfile::tempdir().unwrap();
    let session = open_session(dispatcher_with(FlakyClickHouse {
        failing: &["`analytics`.`events`", "`default`.`users`"],
    }))
    .await;

    let report = session
        .attach(
            &[clickhouse_source(), csv_source(dir.path(), "sales")],
            &AttachOptions::for_conversation(CONVERSATION),
        )
        .await
        .unwrap();
    assert_eq!(report.attached.len(), 1);
    assert_eq!(report.attached[0].datasource_id, "sales");
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].datasource_id, "ch");
    assert!(report.failures[0].error.contains("none of 2"));

    assert_eq!(session.attached_ids().await, vec!["sales".to_string()]);
    let cache = session.schema_cache(CONVERSATION);
    assert!(!cache.read().contains("ch"));
    assert!(cache.read().contains("sales"));

    let metadata = session.metadata().await.unwrap();
    assert!(metadata.schemas.iter().all(|s| s.catalog != "ch"));
}

#[tokio::test]
async fn clickhouse_decimals_import_exactly() {
    let session = open_session(dispatcher_with(LedgerClickHouse)).await;
    let report = session
        .attach(&[clickhouse_source()], &AttachOptions::for_conversation(CONVERSATION))
        .await
        .unwrap();
    assert!(report.is_complete_success(), "{:?}", report.failures);

    let result = session
        .query("SELECT amount FROM ch.main.ledger ORDER BY amount DESC")
        .await
        .unwrap();
    assert_eq!(result.columns[0].data_type, "DECIMAL(18,4)");
    assert_eq!(
        result.rows,
        vec![vec![json!("12345678901234.5678")], vec![json!("0.0001")]]
    );
}

#[tokio::test]
async fn overlapping_native_ids_keep_their_own_views() {
    let dir = tempfile::tempdir().unwrap();
    let session = open_session(mock_dispatcher()).await;
    let sales = csv_source(dir.path(), "sales");
    let sales_eu = csv_source(dir.path(), "sales-eu");

    let report = session
        .attach(
            &[sales.clone(), sales_eu],
            &AttachOptions::for_conversation(CONVERSATION),
        )
        .await
        .unwrap();
    assert!(report.is_complete_success(), "{:?}", report.failures);

    let cache = session.schema_cache(CONVERSATION);
    assert_eq!(
        cache.read().get("sales").unwrap().query_paths,
        vec!["main.sales_product_amount".to_string()]
    );
    assert_eq!(
        cache.read().get("sales-eu").unwrap().query_paths,
        vec!["main.sales_eu_product_amount".to_string()]
    );

    let detached = session.detach(&[sales]).await.unwrap();
    assert_eq!(detached.detached, vec!["sales".to_string()]);
    assert_eq!(session.attached_ids().await, vec!["sales-eu".to_string()]);
    assert!(session.query("SELECT * FROM sales_product_amount").await.is_err());

    let count = session
        .query("SELECT count(*) FROM sales_eu_product_amount")
        .await
        .unwrap();
    assert_eq!(count.rows[0][0], json!(3));
    assert_eq!(
        cache.read().get_all_table_paths(),
        vec!["main.sales_eu_product_amount".to_string()]
    );
}

#[tokio::test]
async fn spreadsheet_without_discovery_imports_first_tab() {
    let session = open_session(mock_dispatcher()).await;
    let report = session
        .attach(&[sheet_source()], &AttachOptions::for_conversation(CONVERSATION))
        .await
        .unwrap();
    assert!(report.is_complete_success(), "{:?}", report.failures);

    let primary = report.attached[0].primary.clone().unwrap();
    assert_eq!(primary.display_name, "team_scores");
    assert_eq!(primary.table_name, "sheet1.main.team_scores");

    let result = session
        .query("SELECT max(score) AS best FROM sheet1.main.team_scores")
        .await
        .unwrap();
    assert_eq!(result.rows[0][0], json!(5));
}

#[tokio::test]
async fn duplicate_ids_in_one_batch_attach_once() {
    let dir = tempfile::tempdir().unwrap();
    let session = open_session(mock_dispatcher()).await;
    let source = csv_source(dir.path(), "dup");

    let report = session
        .attach(
            &[source.clone(), source.clone()],
            &AttachOptions::for_conversation(CONVERSATION),
        )
        .await
        .unwrap();
    assert_eq!(report.attached.len(), 1);
    assert_eq!(report.skipped, vec!["dup".to_string()]);
    assert_eq!(session.schema_cache(CONVERSATION).read().len(), 1);

    let again = session
        .attach(&[source], &AttachOptions::for_conversation(CONVERSATION))
        .await
        .unwrap();
    assert!(again.attached.is_empty());
    assert_eq!(again.skipped, vec!["dup".to_string()]);
    assert_eq!(session.attached_ids().await, vec!["dup".to_string()]);
}

#[tokio::test]
async fn failures_do_not_abort_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let session = open_session(mock_dispatcher()).await;
    let broken = Datasource::new("pg", "Prod", "postgres").with_config("user", "app");
    let unknown = Datasource::new("mystery", "Mystery", "oracle");

    let report = session
        .attach(
            &[broken, csv_source(dir.path(), "sales"), unknown],
            &AttachOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(report.attached.len(), 1);
    assert_eq!(report.attached[0].datasource_id, "sales");
    let mut failed: Vec<&str> = report.failures.iter().map(|f| f.datasource_id.as_str()).collect();
    failed.sort_unstable();
    assert_eq!(failed, vec!["mystery", "pg"]);
}

#[tokio::test]
async fn duckdb_file_attaches_every_schema() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("warehouse.duckdb");
    {
        let conn = duckdb::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE customers (id INTEGER, name VARCHAR);
             INSERT INTO customers VALUES (1, 'Ada'), (2, 'Linus');
             CREATE SCHEMA finance;
             CREATE TABLE finance.invoices (id INTEGER, customer_id INTEGER, total DOUBLE);",
        )
        .unwrap();
    }
    let ds = Datasource::new("wh", "Warehouse", "duckdb").with_config("path", path.to_string_lossy().to_string());

    let session = open_session(mock_dispatcher()).await;
    let report = session
        .attach(std::slice::from_ref(&ds), &AttachOptions::for_conversation(CONVERSATION))
        .await
        .unwrap();
    assert!(report.is_complete_success(), "{:?}", report.failures);

    let cache = session.schema_cache(CONVERSATION);
    assert_eq!(
        cache.read().get_all_table_paths(),
        vec!["wh.finance.invoices".to_string(), "wh.main.customers".to_string()]
    );
    let columns: Vec<String> = cache
        .read()
        .columns("wh", "finance", "invoices")
        .unwrap()
        .iter()
        .map(|c| c.column_name.clone())
        .collect();
    assert_eq!(columns, vec!["id", "customer_id", "total"]);

    let result = session.query("SELECT name FROM wh.main.customers ORDER BY id").await.unwrap();
    assert_eq!(result.rows, vec![vec![json!("Ada")], vec![json!("Linus")]]);

    let metadata = session.metadata().await.unwrap();
    let catalogs: Vec<&str> = metadata.schemas.iter().map(|s| s.catalog.as_str()).collect();
    assert!(catalogs.contains(&"wh"));

    let detached = session.detach(&[ds]).await.unwrap();
    assert_eq!(detached.detached, vec!["wh".to_string()]);
    assert!(cache.read().is_empty());
    assert!(session.query("SELECT * FROM wh.main.customers").await.is_err());
}

#[tokio::test]
async fn rename_and_delete_refresh_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let session = open_session(mock_dispatcher()).await;
    session
        .attach(&[csv_source(dir.path(), "sales")], &AttachOptions::for_conversation(CONVERSATION))
        .await
        .unwrap();

    let renamed = session
        .rename_table("sales_product_amount", "orders")
        .await
        .unwrap();
    assert_eq!(renamed.new_table_name, "memory.main.orders");

    let cache = session.schema_cache(CONVERSATION);
    assert_eq!(cache.read().get_all_table_paths(), vec!["main.orders".to_string()]);
    let count = session.query("SELECT count(*) FROM orders").await.unwrap();
    assert_eq!(count.rows[0][0], json!(3));

    let err = session.rename_table("no_such_table", "x").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));

    let deleted = session
        .delete_tables(&["orders".to_string()])
        .await
        .unwrap();
    assert_eq!(deleted.deleted_tables, vec!["orders".to_string()]);
    assert!(deleted.failed_tables.is_empty());
    assert!(cache.read().get_all_table_paths().is_empty());
}

#[tokio::test]
async fn session_manager_replays_attachment_per_query() {
    let dir = tempfile::tempdir().unwrap();
    let repository = Arc::new(InMemoryDatasourceRepository::with_datasources([
        csv_source(dir.path(), "sales"),
        clickhouse_source(),
    ]));
    let manager = SessionManager::new(QoreFederationConfig::default(), mock_dispatcher(), repository);
    let ids = vec!["sales".to_string(), "ch".to_string(), "ghost".to_string()];

    let result = manager
        .query(
            CONVERSATION,
            "SELECT count(*) FROM sales_product_amount s JOIN ch.main.events e ON s.id = e.id",
            &ids,
        )
        .await
        .unwrap();
    assert_eq!(result.rows[0][0], json!(2));

    let cache = manager.caches().existing(CONVERSATION).unwrap();
    assert_eq!(cache.read().datasource_ids(), vec!["ch".to_string(), "sales".to_string()]);

    let report = manager.attach_datasources(CONVERSATION, &ids).await.unwrap();
    assert_eq!(report.skipped.len(), 2);
    assert_eq!(report.failures.len(), 1);

    manager.close(CONVERSATION).await.unwrap();
    assert!(manager.caches().existing(CONVERSATION).is_none());
}

#[tokio::test]
async fn builtin_registry_resolves_attachment_drivers() {
    let registry = DriverRegistry::with_builtin_drivers(mock_dispatcher());
    assert!(registry.get("clickhouse").is_some());
    assert!(registry.get("Google-Sheets").is_some());

    let dir = tempfile::tempdir().unwrap();
    let ds = csv_source(dir.path(), "sales");
    let driver = registry.resolve(&ds).unwrap();
    assert_eq!(driver.provider_id(), "csv");

    let result = driver
        .query(&ds, "SELECT count(*) FROM sales_product_amount")
        .await
        .unwrap();
    assert_eq!(result.rows[0][0], json!(3));
    assert!(registry.close_all().await.is_empty());
}
