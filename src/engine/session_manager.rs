// SPDX-License-Identifier: Apache-2.0

//! Session Manager
//!
//! Owns one query engine session per conversation. Sessions are created and
//! initialized lazily on first use and every query replays attachment of the
//! datasources it references, so callers never need to track what is
//! already attached.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tokio::time::{timeout, Duration};
use tracing::{info, instrument, warn};

use crate::config::QoreFederationConfig;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::repository::DatasourceRepository;
use crate::engine::session::QueryEngineSession;
use crate::engine::types::{
    AttachOptions, Datasource, DatasourceMetadata, DeleteTablesResult, QueryResult,
    RenameTableResult,
};
use crate::federation::{
    AttachFailure, AttachReport, AttachmentDispatcher, DetachReport, SchemaCacheRegistry,
};

pub struct SessionManager {
    config: QoreFederationConfig,
    dispatcher: Arc<AttachmentDispatcher>,
    caches: Arc<SchemaCacheRegistry>,
    repository: Arc<dyn DatasourceRepository>,
    sessions: RwLock<HashMap<String, Arc<QueryEngineSession>>>,
}

impl SessionManager {
    const INIT_TIMEOUT_MS: u64 = 15000;

    pub fn new(
        config: QoreFederationConfig,
        dispatcher: Arc<AttachmentDispatcher>,
        repository: Arc<dyn DatasourceRepository>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            caches: Arc::new(SchemaCacheRegistry::new()),
            repository,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Builds the dispatcher and its HTTP clients from `config`.
    pub fn from_config(
        config: QoreFederationConfig,
        repository: Arc<dyn DatasourceRepository>,
    ) -> EngineResult<Self> {
        let dispatcher = Arc::new(AttachmentDispatcher::from_config(&config)?);
        Ok(Self::new(config, dispatcher, repository))
    }

    pub fn caches(&self) -> &Arc<SchemaCacheRegistry> {
        &self.caches
    }

    fn attach_options(&self, conversation_id: &str) -> AttachOptions {
        let options = AttachOptions::for_conversation(conversation_id);
        match &self.config.workspace_dir {
            Some(workspace) => options.with_workspace(workspace.clone()),
            None => options,
        }
    }

    /// Session of a conversation, created and initialized on first use.
    #[instrument(skip(self))]
    pub async fn session(&self, conversation_id: &str) -> EngineResult<Arc<QueryEngineSession>> {
        if let Some(session) = self.sessions.read().await.get(conversation_id) {
            return Ok(Arc::clone(session));
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(conversation_id) {
            return Ok(Arc::clone(session));
        }

        let session = Arc::new(QueryEngineSession::new(
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.caches),
        ));
        let session_config = self.config.session_config();
        match timeout(
            Duration::from_millis(Self::INIT_TIMEOUT_MS),
            session.initialize(&session_config),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(EngineError::timeout(
                    "session initialization",
                    Self::INIT_TIMEOUT_MS,
                ))
            }
        }

        sessions.insert(conversation_id.to_string(), Arc::clone(&session));
        info!(conversation_id, session_id = %session.id().0, "session created");
        Ok(session)
    }

    /// Looks up `ids` in the repository. Unknown ids come back as failures.
    async fn lookup(&self, ids: &[String]) -> EngineResult<(Vec<Datasource>, Vec<AttachFailure>)> {
        let found = self.repository.find_by_ids(ids).await?;
        let missing = ids
            .iter()
            .filter(|id| !found.iter().any(|ds| &ds.id == *id))
            .map(|id| AttachFailure {
                datasource_id: id.clone(),
                datasource_name: id.clone(),
                error: "Datasource not found".to_string(),
            })
            .collect();
        Ok((found, missing))
    }

    /// Attaches datasources by id into the conversation's session.
    #[instrument(skip(self, datasource_ids), fields(count = datasource_ids.len()))]
    pub async fn attach_datasources(
        &self,
        conversation_id: &str,
        datasource_ids: &[String],
    ) -> EngineResult<AttachReport> {
        let session = self.session(conversation_id).await?;
        let (datasources, missing) = self.lookup(datasource_ids).await?;
        let mut report = session
            .attach(&datasources, &self.attach_options(conversation_id))
            .await?;
        report.failures.extend(missing);
        Ok(report)
    }

    /// Replays attachment of `datasource_ids`, then executes `sql`.
    ///
    /// Attach failures are logged and do not stop the query.
    #[instrument(skip(self, sql, datasource_ids), fields(count = datasource_ids.len()))]
    pub async fn query(
        &self,
        conversation_id: &str,
        sql: &str,
        datasource_ids: &[String],
    ) -> EngineResult<QueryResult> {
        if !datasource_ids.is_empty() {
            let report = self.attach_datasources(conversation_id, datasource_ids).await?;
            for failure in &report.failures {
                warn!(
                    datasource_id = %failure.datasource_id,
                    error = %failure.error,
                    "datasource unavailable for query"
                );
            }
        }
        self.session(conversation_id).await?.query(sql).await
    }

    pub async fn metadata(&self, conversation_id: &str) -> EngineResult<DatasourceMetadata> {
        self.session(conversation_id).await?.metadata().await
    }

    #[instrument(skip(self, datasource_ids), fields(count = datasource_ids.len()))]
    pub async fn detach_datasources(
        &self,
        conversation_id: &str,
        datasource_ids: &[String],
    ) -> EngineResult<DetachReport> {
        let Some(session) = self.sessions.read().await.get(conversation_id).cloned() else {
            return Err(EngineError::not_found(format!(
                "No session for conversation '{conversation_id}'"
            )));
        };
        let (datasources, _) = self.lookup(datasource_ids).await?;
        session.detach(&datasources).await
    }

    pub async fn delete_tables(
        &self,
        conversation_id: &str,
        table_names: &[String],
    ) -> EngineResult<DeleteTablesResult> {
        self.session(conversation_id)
            .await?
            .delete_tables(table_names)
            .await
    }

    pub async fn rename_table(
        &self,
        conversation_id: &str,
        old_name: &str,
        new_name: &str,
    ) -> EngineResult<RenameTableResult> {
        self.session(conversation_id)
            .await?
            .rename_table(old_name, new_name)
            .await
    }

    /// Closes and forgets a conversation's session along with its cache.
    #[instrument(skip(self))]
    pub async fn close(&self, conversation_id: &str) -> EngineResult<()> {
        let session = self.sessions.write().await.remove(conversation_id);
        self.caches.remove(conversation_id);
        match session {
            Some(session) => session.close().await,
            None => Err(EngineError::not_found(format!(
                "No session for conversation '{conversation_id}'"
            ))),
        }
    }

    /// Closes every session, continuing past failures.
    pub async fn close_all(&self) -> Vec<(String, EngineError)> {
        let drained: Vec<(String, Arc<QueryEngineSession>)> =
            self.sessions.write().await.drain().collect();
        let closes = drained.into_iter().map(|(conversation_id, session)| async move {
            self.caches.remove(&conversation_id);
            session.close().await.err().map(|e| (conversation_id, e))
        });
        join_all(closes).await.into_iter().flatten().collect()
    }

    /// Conversation ids with a live session, sorted.
    pub async fn list_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn session_exists(&self, conversation_id: &str) -> bool {
        self.sessions.read().await.contains_key(conversation_id)
    }
}
