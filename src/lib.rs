// fedstage - federated query execution over a per-session scratch store
// Core library

pub mod config;
pub mod engine;
pub mod federation;
pub mod metrics;
pub mod observability;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, instrument};

pub use config::EngineConfig;
pub use engine::{
    EngineError, EngineResult, RelationalBackend, ResultSet, Row, SourceRegistry, ToolInvoker,
    ToolRegistry, Value,
};
pub use federation::{
    metadata_of, CombinationPlanner, CombinedResult, DataMetadata, FederationMetadata,
    FixedCombination, QueryPlan, RelationalSubQuery, ScratchTable, SessionTables, StagedPlan,
    ToolCall,
};

use engine::SourceExecutor;
use federation::ident::sanitize_session_id;
use federation::{CountBasedPolicy, FederationOrchestrator, ScratchStore, ALIAS_TABLE_PREFIX};

/// One engine per conversation session.
///
/// Owns the session's scratch file, the source registries and the session
/// table registry. Plan runs and scratch cleanup are serialized per engine.
pub struct FederationEngine {
    config: EngineConfig,
    store: Arc<ScratchStore>,
    sources: Arc<SourceRegistry>,
    tools: Arc<ToolRegistry>,
    orchestrator: FederationOrchestrator,
    sessions: SessionTables,
    run_lock: Mutex<()>,
}

impl FederationEngine {
    /// Creates an engine whose scratch file is
    /// `{scratch_dir}/scratch_{sanitized session_key}.duckdb`.
    pub fn new(config: EngineConfig, session_key: &str) -> EngineResult<Self> {
        let file = format!("scratch_{}.duckdb", sanitize_session_id(session_key)?);
        let path = config.scratch_dir.join(file);
        Self::with_scratch_path(config, path)
    }

    /// Creates an engine on an explicit scratch file. An existing file at
    /// `path` is discarded.
    pub fn with_scratch_path(config: EngineConfig, path: impl Into<PathBuf>) -> EngineResult<Self> {
        config.validate()?;

        let store = Arc::new(ScratchStore::open(path, config.insert_batch_size)?);
        let sources = Arc::new(SourceRegistry::new(
            config.relational_sources.clone(),
            Arc::clone(&store),
            config.pool_max_connections,
        ));
        let timeout = Duration::from_millis(config.source_timeout_ms);
        let tools = Arc::new(ToolRegistry::new(config.tool_sources.clone(), timeout));

        let executor = SourceExecutor::new(Arc::clone(&sources), Arc::clone(&tools), Some(timeout));
        let orchestrator = FederationOrchestrator::new(
            executor,
            Arc::clone(&store),
            Arc::new(CountBasedPolicy),
            config.sandbox_combination,
        );
        let sessions = SessionTables::new(Arc::clone(&store));

        info!(scratch = %store.path().display(), "Federation engine ready");
        Ok(Self {
            config,
            store,
            sources,
            tools,
            orchestrator,
            sessions,
            run_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scratch_path(&self) -> &Path {
        self.store.path()
    }

    /// Registers an already connected relational backend.
    pub fn register_relational_backend(
        &self,
        source_id: impl Into<String>,
        backend: Arc<dyn RelationalBackend>,
    ) -> EngineResult<()> {
        self.sources.register_backend(source_id, backend)
    }

    /// Registers a tool invoker, replacing any configured endpoint of that id.
    pub fn register_tool_invoker(&self, source_id: impl Into<String>, invoker: Arc<dyn ToolInvoker>) {
        self.tools.register_invoker(source_id, invoker);
    }

    /// Relational source ids, `__session__` included.
    pub fn relational_sources(&self) -> Vec<String> {
        self.sources.list()
    }

    /// Runs a plan and returns the combined (or primary) result.
    #[instrument(skip_all)]
    pub async fn execute_plan(
        &self,
        plan: &QueryPlan,
        planner: Option<&dyn CombinationPlanner>,
    ) -> EngineResult<(CombinedResult, FederationMetadata)> {
        let _guard = self.run_lock.lock().await;
        self.orchestrator.execute(plan, planner).await
    }

    /// Runs and stages a plan without combining. The staged tables stay in
    /// the scratch store for [`FederationEngine::combine`].
    pub async fn stage_plan(&self, plan: &QueryPlan) -> EngineResult<StagedPlan> {
        let _guard = self.run_lock.lock().await;
        self.orchestrator.stage(plan).await
    }

    /// Runs combination SQL against the staged tables.
    pub async fn combine(&self, sql: &str) -> EngineResult<CombinedResult> {
        let _guard = self.run_lock.lock().await;
        self.orchestrator.combine(sql).await
    }

    pub fn sessions(&self) -> &SessionTables {
        &self.sessions
    }

    /// Discards all scratch state, session tables included, by deleting the
    /// scratch file. The engine stays usable.
    pub async fn cleanup(&self) -> EngineResult<()> {
        let _guard = self.run_lock.lock().await;
        self.store.blocking(|store| store.drop_all()).await
    }

    /// Drops the `temp_*` tables of earlier plans and keeps session tables.
    pub async fn discard_staging(&self) -> EngineResult<usize> {
        let _guard = self.run_lock.lock().await;
        self.store
            .blocking(|store| store.drop_with_prefix(ALIAS_TABLE_PREFIX))
            .await
    }

    /// Closes source pools and deletes the scratch file.
    pub async fn shutdown(&self) -> EngineResult<()> {
        self.sources.close_all().await;
        self.cleanup().await
    }
}
