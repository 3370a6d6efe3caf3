//! Source Registries
//!
//! Map source ids to live backends. Configured sources are connected lazily on
//! first use and cached; prebuilt backends can be registered directly.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::{RelationalDriver, RelationalSourceConfig, ToolSourceConfig};
use crate::engine::drivers::http_tool::HttpToolClient;
use crate::engine::drivers::mysql::MySqlBackend;
use crate::engine::drivers::postgres::PostgresBackend;
use crate::engine::drivers::scratch::ScratchBackend;
use crate::engine::drivers::sqlite::SqliteBackend;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::{RelationalBackend, ToolInvoker};
use crate::federation::scratch::ScratchStore;
use crate::federation::types::SCRATCH_SOURCE_ID;

/// Registry of relational sources, including the scratch store under `__session__`
pub struct SourceRegistry {
    configs: HashMap<String, RelationalSourceConfig>,
    backends: RwLock<HashMap<String, Arc<dyn RelationalBackend>>>,
    /// Serializes lazy connects so one id never gets two pools
    connect_lock: Mutex<()>,
    max_connections: u32,
}

impl SourceRegistry {
    pub fn new(
        configs: Vec<RelationalSourceConfig>,
        scratch: Arc<ScratchStore>,
        max_connections: u32,
    ) -> Self {
        let mut backends: HashMap<String, Arc<dyn RelationalBackend>> = HashMap::new();
        backends.insert(
            SCRATCH_SOURCE_ID.to_string(),
            Arc::new(ScratchBackend::new(scratch)),
        );
        Self {
            configs: configs.into_iter().map(|c| (c.id.clone(), c)).collect(),
            backends: RwLock::new(backends),
            connect_lock: Mutex::new(()),
            max_connections: max_connections.max(1),
        }
    }

    /// Registers an already connected backend under `source_id`.
    pub fn register_backend(
        &self,
        source_id: impl Into<String>,
        backend: Arc<dyn RelationalBackend>,
    ) -> EngineResult<()> {
        let source_id = source_id.into();
        if source_id == SCRATCH_SOURCE_ID {
            return Err(EngineError::config(format!(
                "source id '{SCRATCH_SOURCE_ID}' is reserved"
            )));
        }
        self.backends.write().insert(source_id, backend);
        Ok(())
    }

    /// Whether `source_id` is registered or configured
    pub fn contains(&self, source_id: &str) -> bool {
        self.backends.read().contains_key(source_id) || self.configs.contains_key(source_id)
    }

    /// Returns the backend for `source_id`, connecting on first use.
    pub async fn resolve(&self, source_id: &str) -> EngineResult<Arc<dyn RelationalBackend>> {
        let cached = self.backends.read().get(source_id).cloned();
        if let Some(backend) = cached {
            return Ok(backend);
        }

        let config = self
            .configs
            .get(source_id)
            .ok_or_else(|| EngineError::source_not_found(source_id))?;

        let _guard = self.connect_lock.lock().await;
        // Another task may have connected while we waited.
        let cached = self.backends.read().get(source_id).cloned();
        if let Some(backend) = cached {
            return Ok(backend);
        }

        let url = config.url.expose();
        let backend: Arc<dyn RelationalBackend> = match config.driver {
            RelationalDriver::Postgres => {
                Arc::new(PostgresBackend::connect(url, self.max_connections).await?)
            }
            RelationalDriver::Mysql => {
                Arc::new(MySqlBackend::connect(url, self.max_connections).await?)
            }
            RelationalDriver::Sqlite => {
                Arc::new(SqliteBackend::connect(url, self.max_connections).await?)
            }
        };
        info!(source_id, driver = backend.driver_id(), "Relational source connected");

        self.backends
            .write()
            .insert(source_id.to_string(), Arc::clone(&backend));
        Ok(backend)
    }

    /// Lists registered and configured source ids
    pub fn list(&self) -> Vec<String> {
        let mut ids: BTreeSet<String> = self.backends.read().keys().cloned().collect();
        ids.extend(self.configs.keys().cloned());
        ids.into_iter().collect()
    }

    /// Closes every connected pool.
    pub async fn close_all(&self) {
        let backends: Vec<Arc<dyn RelationalBackend>> =
            self.backends.read().values().cloned().collect();
        for backend in backends {
            backend.close().await;
        }
    }
}

/// Registry of remote tool sources
pub struct ToolRegistry {
    configs: HashMap<String, ToolSourceConfig>,
    invokers: RwLock<HashMap<String, Arc<dyn ToolInvoker>>>,
    timeout: Duration,
}

impl ToolRegistry {
    pub fn new(configs: Vec<ToolSourceConfig>, timeout: Duration) -> Self {
        Self {
            configs: configs.into_iter().map(|c| (c.id.clone(), c)).collect(),
            invokers: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    pub fn register_invoker(&self, source_id: impl Into<String>, invoker: Arc<dyn ToolInvoker>) {
        self.invokers.write().insert(source_id.into(), invoker);
    }

    pub fn contains(&self, source_id: &str) -> bool {
        self.invokers.read().contains_key(source_id) || self.configs.contains_key(source_id)
    }

    /// Returns the invoker for `source_id`, building an HTTP client on first use.
    pub fn resolve(&self, source_id: &str) -> EngineResult<Arc<dyn ToolInvoker>> {
        if let Some(invoker) = self.invokers.read().get(source_id).cloned() {
            return Ok(invoker);
        }

        let config = self
            .configs
            .get(source_id)
            .ok_or_else(|| EngineError::source_not_found(source_id))?;
        let client: Arc<dyn ToolInvoker> = Arc::new(HttpToolClient::new(
            &config.endpoint,
            config.auth.clone(),
            self.timeout,
        )?);

        // entry() keeps the first client if two callers raced here
        let mut invokers = self.invokers.write();
        let invoker = invokers
            .entry(source_id.to_string())
            .or_insert(client)
            .clone();
        Ok(invoker)
    }
}
