// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration
//!
//! Defaults are overridden by a JSON document or by `QOREDB_FEDERATION_*`
//! environment variables.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};

const ENV_PREFIX: &str = "QOREDB_FEDERATION_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QoreFederationConfig {
    /// Working directory URI. Its scheme decides which extension is loaded.
    pub working_dir: Option<String>,
    /// Root of per-conversation attached database files.
    pub workspace_dir: Option<PathBuf>,
    /// `SET key = value` pairs applied at initialize.
    pub settings: BTreeMap<String, String>,
    pub clickhouse: ClickHouseImportConfig,
    pub spreadsheet: SpreadsheetConfig,
    pub log: LogConfig,
}

impl Default for QoreFederationConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            workspace_dir: None,
            settings: BTreeMap::new(),
            clickhouse: ClickHouseImportConfig::default(),
            spreadsheet: SpreadsheetConfig::default(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickHouseImportConfig {
    /// Rows imported per table. `None` imports everything.
    pub row_limit: Option<u64>,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for ClickHouseImportConfig {
    fn default() -> Self {
        Self {
            row_limit: Some(1000),
            request_timeout_ms: 30_000,
            max_retries: 2,
        }
    }
}

impl ClickHouseImportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpreadsheetConfig {
    pub discovery_timeout_ms: u64,
    pub download_timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for SpreadsheetConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_ms: 10_000,
            download_timeout_ms: 30_000,
            max_retries: 2,
        }
    }
}

impl SpreadsheetConfig {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_millis(self.download_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Defaults to `<data_local_dir>/com.qoredb.federation/logs`.
    pub directory: Option<PathBuf>,
    pub default_filter: String,
    pub retention_days: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: None,
            default_filter: "qore_federation=info".to_string(),
            retention_days: 7,
        }
    }
}

/// The subset of configuration a query engine session initializes with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    pub working_dir: Option<String>,
    pub settings: BTreeMap<String, String>,
}

impl SessionConfig {
    pub fn with_working_dir(mut self, working_dir: impl Into<String>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }
}

impl QoreFederationConfig {
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| EngineError::configuration(format!("Invalid configuration: {e}")))
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> EngineResult<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Applies `QOREDB_FEDERATION_*` variables over the defaults.
    ///
    /// `SETTING_<KEY>` variables become engine settings. A `ROW_LIMIT` of
    /// `0`, `none` or `unlimited` disables the ClickHouse import limit.
    pub fn from_vars<I>(vars: I) -> EngineResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = Self::default();

        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.trim().to_string();

            if let Some(setting) = name.strip_prefix("SETTING_") {
                config
                    .settings
                    .insert(setting.to_ascii_lowercase(), value);
                continue;
            }

            match name {
                "WORKING_DIR" => config.working_dir = Some(value),
                "WORKSPACE_DIR" => config.workspace_dir = Some(PathBuf::from(value)),
                "CLICKHOUSE_ROW_LIMIT" => {
                    config.clickhouse.row_limit = match value.to_ascii_lowercase().as_str() {
                        "0" | "none" | "unlimited" => None,
                        other => Some(parse_number(&key, other)?),
                    }
                }
                "CLICKHOUSE_TIMEOUT_MS" => {
                    config.clickhouse.request_timeout_ms = parse_number(&key, &value)?
                }
                "CLICKHOUSE_MAX_RETRIES" => {
                    config.clickhouse.max_retries = parse_number(&key, &value)?
                }
                "SPREADSHEET_DISCOVERY_TIMEOUT_MS" => {
                    config.spreadsheet.discovery_timeout_ms = parse_number(&key, &value)?
                }
                "SPREADSHEET_DOWNLOAD_TIMEOUT_MS" => {
                    config.spreadsheet.download_timeout_ms = parse_number(&key, &value)?
                }
                "SPREADSHEET_MAX_RETRIES" => {
                    config.spreadsheet.max_retries = parse_number(&key, &value)?
                }
                "LOG_DIR" => config.log.directory = Some(PathBuf::from(value)),
                "LOG_FILTER" => config.log.default_filter = value,
                "LOG_RETENTION_DAYS" => {
                    config.log.retention_days = parse_number(&key, &value)?
                }
                _ => {}
            }
        }

        Ok(config)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            working_dir: self.working_dir.clone(),
            settings: self.settings.clone(),
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> EngineResult<T> {
    value
        .parse()
        .map_err(|_| EngineError::configuration(format!("{key} must be a number, got '{value}'")))
}
