// SPDX-License-Identifier: Apache-2.0

// QoreDB Federation - datasource attachment and federated query layer
// Core library

pub mod config;
pub mod engine;
pub mod federation;
pub mod observability;

pub use config::{QoreFederationConfig, SessionConfig};
pub use engine::{
    DatasourceDriver, DriverRegistry, EngineError, EngineResult, QueryEngineSession,
    SessionManager,
};
pub use federation::{AttachReport, AttachmentDispatcher, SchemaCacheRegistry};
