// SPDX-License-Identifier: Apache-2.0

//! Types for the attachment layer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::handle::{self, EngineHandle};
use crate::engine::types::{Datasource, SimpleSchema};

use super::provider::SourceKind;

/// Conversation id used when a caller attaches without one.
pub const DEFAULT_CONVERSATION: &str = "default";

/// Shared input of every attachment strategy.
pub struct AttachInput<'a> {
    pub handle: &'a Arc<EngineHandle>,
    pub datasource: &'a Datasource,
    pub conversation_id: Option<&'a str>,
    pub workspace: Option<&'a Path>,
    /// Whether per-table schema should be extracted during attachment
    pub extract_schema: bool,
}

impl AttachInput<'_> {
    pub fn conversation(&self) -> &str {
        self.conversation_id.unwrap_or(DEFAULT_CONVERSATION)
    }

    /// `<workspace>/<conversation>/<name>.duckdb`, when a workspace is set.
    pub fn persistent_store_path(&self, name: &str) -> Option<PathBuf> {
        self.workspace.map(|ws| {
            ws.join(super::naming::sanitize_identifier(self.conversation()))
                .join(format!("{name}.duckdb"))
        })
    }

    /// Creates (or reuses) the per-conversation store attached as `name`.
    ///
    /// Falls back to an in-memory database when no workspace is configured.
    pub async fn attach_persistent_store(&self, name: &str) -> EngineResult<Option<PathBuf>> {
        let path = self.persistent_store_path(name);
        if let Some(ref p) = path {
            if let Some(dir) = p.parent() {
                tokio::fs::create_dir_all(dir).await.map_err(|e| {
                    EngineError::configuration(format!(
                        "Cannot create workspace directory {}: {e}",
                        dir.display()
                    ))
                })?;
            }
        }

        let target = path
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| ":memory:".to_string());
        let name = name.to_string();
        self.handle
            .run(move |conn| handle::attach_file(conn, &target, &name))
            .await?;
        Ok(path)
    }
}

/// One table made visible by an attached-database strategy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttachedTable {
    /// Schema as the source reports it (the original ClickHouse database).
    pub schema: String,
    /// Table name inside the engine.
    pub table: String,
    /// Executable path, e.g. `db.main.table`.
    pub path: String,
    /// `None` when schema extraction failed or was skipped.
    pub schema_definition: Option<SimpleSchema>,
}

/// Outcome of one strategy. Exactly one shape per strategy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttachmentResult {
    View {
        view_name: String,
        display_name: String,
        schema: Option<SimpleSchema>,
    },
    AttachedDatabase {
        attached_database_name: String,
        tables: Vec<AttachedTable>,
    },
}

/// Backward-compatible single-table view of an attachment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrimaryTable {
    pub table_name: String,
    pub display_name: String,
    pub schema: Option<SimpleSchema>,
}

impl AttachmentResult {
    pub fn attached_database_name(&self) -> Option<&str> {
        match self {
            AttachmentResult::View { .. } => None,
            AttachmentResult::AttachedDatabase {
                attached_database_name,
                ..
            } => Some(attached_database_name),
        }
    }

    pub fn table_count(&self) -> usize {
        match self {
            AttachmentResult::View { .. } => 1,
            AttachmentResult::AttachedDatabase { tables, .. } => tables.len(),
        }
    }

    /// First table, for callers that only handle one.
    pub fn primary_table(&self) -> Option<PrimaryTable> {
        match self {
            AttachmentResult::View {
                view_name,
                display_name,
                schema,
            } => Some(PrimaryTable {
                table_name: view_name.clone(),
                display_name: display_name.clone(),
                schema: schema.clone(),
            }),
            AttachmentResult::AttachedDatabase { tables, .. } => {
                tables.first().map(|t| PrimaryTable {
                    table_name: t.path.clone(),
                    display_name: t.table.clone(),
                    schema: t.schema_definition.clone(),
                })
            }
        }
    }
}

/// A datasource that was attached in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachedSource {
    pub datasource_id: String,
    pub datasource_name: String,
    pub kind: SourceKind,
    pub conversation_id: String,
    pub primary: Option<PrimaryTable>,
    pub result: AttachmentResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachFailure {
    pub datasource_id: String,
    pub datasource_name: String,
    pub error: String,
}

/// Outcome of a batch attach. Failures never abort the batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttachReport {
    pub attached: Vec<AttachedSource>,
    /// Ids skipped because they were already attached.
    pub skipped: Vec<String>,
    pub failures: Vec<AttachFailure>,
}

impl AttachReport {
    pub fn is_complete_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of a batch detach. Failures are informational only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetachReport {
    pub detached: Vec<String>,
    pub failures: Vec<AttachFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::SimpleColumn;

    #[test]
    fn primary_table_of_attached_database_is_first_table() {
        let result = AttachmentResult::AttachedDatabase {
            attached_database_name: "ch".into(),
            tables: vec![
                AttachedTable {
                    schema: "default".into(),
                    table: "events".into(),
                    path: "ch.main.events".into(),
                    schema_definition: None,
                },
                AttachedTable {
                    schema: "analytics".into(),
                    table: "sessions".into(),
                    path: "ch.main.sessions".into(),
                    schema_definition: None,
                },
            ],
        };

        let primary = result.primary_table().unwrap();
        assert_eq!(primary.table_name, "ch.main.events");
        assert_eq!(result.table_count(), 2);
        assert_eq!(result.attached_database_name(), Some("ch"));
    }

    #[test]
    fn view_result_serializes_with_kind_tag() {
        let result = AttachmentResult::View {
            view_name: "ds_name".into(),
            display_name: "People".into(),
            schema: Some(SimpleSchema::single_table(
                "memory",
                "main",
                "ds_name",
                vec![SimpleColumn::new("name", "VARCHAR")],
            )),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["kind"], "view");
        assert_eq!(json["view_name"], "ds_name");
    }

    #[test]
    fn persistent_store_path_is_per_conversation() {
        let handle = EngineHandle::open_in_memory().unwrap();
        let ds = Datasource::new("1", "x", "clickhouse");
        let ws = PathBuf::from("/tmp/ws");
        let input = AttachInput {
            handle: &handle,
            datasource: &ds,
            conversation_id: Some("Conv 42"),
            workspace: Some(&ws),
            extract_schema: true,
        };
        assert_eq!(
            input.persistent_store_path("t_1"),
            Some(PathBuf::from("/tmp/ws/conv_42/t_1.duckdb"))
        );
    }
}
