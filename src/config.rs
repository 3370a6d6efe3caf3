// SPDX-License-Identifier: Apache-2.0

//! Engine configuration.
//!
//! Loaded from a JSON file (a missing file means defaults), then adjusted by
//! `FEDSTAGE_*` environment variables.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::drivers::http_tool::ToolAuth;
use crate::engine::error::{EngineError, EngineResult};
use crate::federation::scratch::DEFAULT_INSERT_BATCH_SIZE;
use crate::federation::types::SCRATCH_SOURCE_ID;
use crate::observability::Sensitive;

pub const ENV_SCRATCH_DIR: &str = "FEDSTAGE_SCRATCH_DIR";
pub const ENV_SOURCE_TIMEOUT_MS: &str = "FEDSTAGE_SOURCE_TIMEOUT_MS";

/// Supported relational source drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationalDriver {
    Postgres,
    Mysql,
    Sqlite,
}

/// A relational source the engine may connect to on first use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationalSourceConfig {
    pub id: String,
    pub driver: RelationalDriver,
    /// Connection URL (`postgres://…`, `mysql://…`, `sqlite:path` or a file path)
    pub url: Sensitive<String>,
}

/// A remote tool endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSourceConfig {
    pub id: String,
    pub endpoint: String,
    #[serde(default)]
    pub auth: Option<ToolAuth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding the per-session scratch files
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// Timeout for a single source call
    #[serde(default = "default_source_timeout_ms")]
    pub source_timeout_ms: u64,

    /// Rows per insert transaction when staging results
    #[serde(default = "default_insert_batch_size")]
    pub insert_batch_size: usize,

    /// Reject combination SQL that is not a single read-only query
    #[serde(default = "default_true")]
    pub sandbox_combination: bool,

    #[serde(default = "default_pool_max_connections")]
    pub pool_max_connections: u32,

    #[serde(default)]
    pub relational_sources: Vec<RelationalSourceConfig>,

    #[serde(default)]
    pub tool_sources: Vec<ToolSourceConfig>,
}

fn default_scratch_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("fedstage")
        .join("scratch")
}

fn default_source_timeout_ms() -> u64 {
    30_000
}

fn default_insert_batch_size() -> usize {
    DEFAULT_INSERT_BATCH_SIZE
}

fn default_true() -> bool {
    true
}

fn default_pool_max_connections() -> u32 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            source_timeout_ms: default_source_timeout_ms(),
            insert_batch_size: default_insert_batch_size(),
            sandbox_combination: true,
            pool_max_connections: default_pool_max_connections(),
            relational_sources: Vec::new(),
            tool_sources: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Reads a JSON config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> EngineResult<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::config(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            EngineError::config(format!("Failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `FEDSTAGE_SCRATCH_DIR` and `FEDSTAGE_SOURCE_TIMEOUT_MS`.
    pub fn with_env_overrides(self) -> EngineResult<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> EngineResult<Self> {
        if let Some(dir) = lookup(ENV_SCRATCH_DIR).filter(|v| !v.trim().is_empty()) {
            self.scratch_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup(ENV_SOURCE_TIMEOUT_MS) {
            self.source_timeout_ms = raw.trim().parse().map_err(|_| {
                EngineError::config(format!("{ENV_SOURCE_TIMEOUT_MS} must be an integer, got '{raw}'"))
            })?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.insert_batch_size == 0 {
            return Err(EngineError::config("insert_batch_size must be positive"));
        }
        if self.pool_max_connections == 0 {
            return Err(EngineError::config("pool_max_connections must be positive"));
        }

        let mut seen = HashSet::new();
        let ids = self
            .relational_sources
            .iter()
            .map(|s| s.id.as_str())
            .chain(self.tool_sources.iter().map(|s| s.id.as_str()));
        for id in ids {
            if id == SCRATCH_SOURCE_ID {
                return Err(EngineError::config(format!("source id '{id}' is reserved")));
            }
            if id.trim().is_empty() {
                return Err(EngineError::config("source id cannot be empty"));
            }
            if !seen.insert(id) {
                return Err(EngineError::config(format!("duplicate source id '{id}'")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.source_timeout_ms, 30_000);
        assert_eq!(config.insert_batch_size, 1000);
        assert!(config.sandbox_combination);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fedstage.json");
        std::fs::write(
            &path,
            r#"{
                "source_timeout_ms": 500,
                "relational_sources": [
                    {"id": "warehouse", "driver": "postgres", "url": "postgres://u:p@db/w"}
                ],
                "tool_sources": [
                    {"id": "crm", "endpoint": "https://crm.local/mcp",
                     "auth": {"type": "api_key", "key": "k"}}
                ]
            }"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.source_timeout_ms, 500);
        assert_eq!(config.pool_max_connections, 5);
        assert_eq!(config.relational_sources[0].driver, RelationalDriver::Postgres);
        assert!(!format!("{config:?}").contains("u:p@db"));
    }

    #[test]
    fn reserved_and_duplicate_ids_are_rejected() {
        let mut config = EngineConfig::default();
        config.tool_sources.push(ToolSourceConfig {
            id: SCRATCH_SOURCE_ID.into(),
            endpoint: "http://x".into(),
            auth: None,
        });
        assert!(config.validate().is_err());

        config.tool_sources[0].id = "a".into();
        config.tool_sources.push(config.tool_sources[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> =
            HashMap::from([(ENV_SCRATCH_DIR, "/tmp/fs"), (ENV_SOURCE_TIMEOUT_MS, "1500")]);
        let config = EngineConfig::default()
            .with_overrides_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.scratch_dir, PathBuf::from("/tmp/fs"));
        assert_eq!(config.source_timeout_ms, 1500);

        let bad = EngineConfig::default()
            .with_overrides_from(|k| (k == ENV_SOURCE_TIMEOUT_MS).then(|| "soon".to_string()));
        assert!(matches!(bad, Err(EngineError::Config { .. })));
    }
}
