// SPDX-License-Identifier: Apache-2.0

//! Datasource Attachment Layer
//!
//! Decides per provider how a datasource becomes visible to the embedded
//! DuckDB engine, and caches the resulting schema with the display-path to
//! query-path translation.

pub mod clickhouse;
pub mod dispatcher;
pub mod foreign;
pub mod http;
pub mod naming;
pub mod native;
pub mod provider;
pub mod schema_cache;
pub mod spreadsheet;
pub mod types;

pub use dispatcher::{AttachmentDispatcher, AttachmentStrategy};
pub use provider::{classify_provider, resolve_mapping, ProviderMapping, SourceKind};
pub use schema_cache::{SchemaCache, SchemaCacheRegistry};
pub use types::{AttachFailure, AttachReport, AttachmentResult, AttachedTable, DetachReport};
