// SPDX-License-Identifier: Apache-2.0

//! Normalized error types for the federation layer
//!
//! DuckDB, HTTP and configuration failures are all mapped onto one enum so
//! that batch operations can collect per-source errors uniformly.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all attachment and query operations
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum EngineError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Extension '{extension}' failed: {message}")]
    Extension { extension: String, message: String },

    #[error("Query engine is already initialized")]
    AlreadyInitialized,

    #[error("Query engine is not initialized")]
    NotInitialized,

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Query syntax error: {message}")]
    SyntaxError { message: String },

    #[error("Query execution error: {message}")]
    ExecutionError { message: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Driver not found: {driver_id}")]
    DriverNotFound { driver_id: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Already exists: {message}")]
    AlreadyExists { message: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Attachment of datasource '{datasource_id}' failed: {message}")]
    AttachmentFailed {
        datasource_id: String,
        message: String,
    },

    #[error("Feature not supported: {message}")]
    NotSupported { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration { message: msg.into() }
    }

    pub fn missing_field(provider: &str, field: &str) -> Self {
        Self::Configuration {
            message: format!("{provider} datasource is missing required field '{field}'"),
        }
    }

    pub fn extension(extension: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Extension {
            extension: extension.into(),
            message: msg.into(),
        }
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed { message: msg.into() }
    }

    pub fn syntax_error(msg: impl Into<String>) -> Self {
        Self::SyntaxError { message: msg.into() }
    }

    pub fn execution_error(msg: impl Into<String>) -> Self {
        Self::ExecutionError { message: msg.into() }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn driver_not_found(id: impl Into<String>) -> Self {
        Self::DriverNotFound { driver_id: id.into() }
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network { message: msg.into() }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound { message: msg.into() }
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists { message: msg.into() }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError { message: msg.into() }
    }

    pub fn attachment_failed(datasource_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::AttachmentFailed {
            datasource_id: datasource_id.into(),
            message: msg.into(),
        }
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported { message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal { message: msg.into() }
    }

    /// Classifies a raw DuckDB error message into syntax or execution error.
    pub fn from_duckdb(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        let lower = msg.to_lowercase();
        if lower.contains("syntax") || lower.contains("parser") {
            Self::syntax_error(msg)
        } else {
            Self::execution_error(msg)
        }
    }

    /// True when the error only says the object is already there.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::AlreadyExists { .. } => true,
            Self::ExecutionError { message } | Self::SyntaxError { message } => {
                is_already_exists_message(message)
            }
            _ => false,
        }
    }

    /// Configuration errors are never worth retrying.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }
}

/// Matches the engine's "already attached" / "already exists" wording.
pub fn is_already_exists_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("already attached")
        || lower.contains("already exists")
        || lower.contains("unique file handle conflict")
}

impl From<duckdb::Error> for EngineError {
    fn from(err: duckdb::Error) -> Self {
        Self::from_duckdb(err.to_string())
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
