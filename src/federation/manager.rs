// SPDX-License-Identifier: Apache-2.0

//! Federation execution manager.
//!
//! Orchestrates the full pipeline for one plan:
//! validate → fetch from sources → stage into the scratch store → combine.
//!
//! Independent calls fan out as one tokio task each and are joined before
//! anything is staged. When the scheduling policy asks for a chain, relational
//! sub-queries run one at a time and each result is staged before the next
//! statement starts, so later statements can read `temp_{alias}` through the
//! `__session__` source. Tool calls always fan out.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::executor::{SourceCall, SourceExecutor};
use crate::engine::types::ResultSet;
use crate::federation::policy::{ExecutionOrder, SchedulingPolicy};
use crate::federation::sandbox::check_combination_sql;
use crate::federation::schema;
use crate::federation::scratch::ScratchStore;
use crate::federation::types::{
    alias_table_name, CombinationPlanner, CombinedResult, DataMetadata, FederationMetadata,
    PlanState, QueryPlan, ScratchTable, SourceFetchResult, SourceKind,
};
use crate::metrics;

type CallOutcome = EngineResult<(ResultSet, SourceFetchResult)>;

/// Tracks and logs the lifecycle of one plan run.
#[derive(Debug)]
struct PlanRun {
    id: Uuid,
    state: PlanState,
}

impl PlanRun {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: PlanState::Planning,
        }
    }

    fn advance(&mut self, next: PlanState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!(plan_id = %self.id, from = %self.state, to = %next, "Unexpected plan state transition");
        }
        info!(plan_id = %self.id, from = %self.state, to = %next, "Plan state changed");
        self.state = next;
    }
}

/// A source result kept for the caller, staged or not.
#[derive(Debug, Clone)]
pub struct StagedOutput {
    pub alias: String,
    pub kind: SourceKind,
    /// Scratch table holding the result; `None` for columnless results
    pub table: Option<String>,
    pub result: ResultSet,
}

/// Everything a plan produced before combination.
#[derive(Debug)]
pub struct StagedPlan {
    /// Staged tables in plan order
    pub tables: Vec<ScratchTable>,
    /// Source results in plan order
    pub outputs: Vec<StagedOutput>,
    pub source_results: Vec<SourceFetchResult>,
    pub order: ExecutionOrder,
    pub touched_origin: bool,
    pub warnings: Vec<String>,
    pub scratch_time_ms: f64,
    run: PlanRun,
    started: Instant,
}

impl StagedPlan {
    /// Result returned when no combination is requested: the last relational
    /// result, else the first tool result, else an empty result.
    pub fn primary_result(&self) -> ResultSet {
        self.outputs
            .iter()
            .rev()
            .find(|o| o.kind == SourceKind::Relational)
            .or_else(|| self.outputs.iter().find(|o| o.kind == SourceKind::Tool))
            .map(|o| o.result.clone())
            .unwrap_or_default()
    }

    pub fn final_state(&self) -> PlanState {
        self.run.state
    }

    fn into_metadata(self) -> FederationMetadata {
        FederationMetadata {
            source_results: self.source_results,
            tables: self.tables,
            order: self.order,
            scratch_time_ms: self.scratch_time_ms,
            total_time_ms: self.started.elapsed().as_secs_f64() * 1000.0,
            final_state: self.run.state,
            touched_origin: self.touched_origin,
            warnings: self.warnings,
        }
    }
}

/// Drives plans against the source executors and one scratch store.
pub struct FederationOrchestrator {
    executor: SourceExecutor,
    store: Arc<ScratchStore>,
    policy: Arc<dyn SchedulingPolicy>,
    sandbox: bool,
}

impl FederationOrchestrator {
    pub fn new(
        executor: SourceExecutor,
        store: Arc<ScratchStore>,
        policy: Arc<dyn SchedulingPolicy>,
        sandbox: bool,
    ) -> Self {
        Self {
            executor,
            store,
            policy,
            sandbox,
        }
    }

    /// Executes a plan end-to-end.
    ///
    /// Without combination the primary result is returned as-is. With
    /// combination the planner receives the staged tables and its SQL runs
    /// against the scratch store.
    #[instrument(skip_all, fields(sources = plan.source_count(), combine = plan.needs_combination))]
    pub async fn execute(
        &self,
        plan: &QueryPlan,
        planner: Option<&dyn CombinationPlanner>,
    ) -> EngineResult<(CombinedResult, FederationMetadata)> {
        let total_start = Instant::now();
        let outcome = self.execute_inner(plan, planner).await;
        let total_ms = total_start.elapsed().as_secs_f64() * 1000.0;
        metrics::record_plan(total_ms, outcome.is_ok());

        if let Err(e) = &outcome {
            warn!(error = %e, total_ms, "Plan failed");
        }
        outcome
    }

    async fn execute_inner(
        &self,
        plan: &QueryPlan,
        planner: Option<&dyn CombinationPlanner>,
    ) -> EngineResult<(CombinedResult, FederationMetadata)> {
        if plan.needs_combination && planner.is_none() {
            return Err(EngineError::invalid_plan(
                "plan needs combination but no combination planner was given",
            ));
        }
        let mut staged = self.stage(plan).await?;

        let result = if let Some(planner) = planner.filter(|_| plan.needs_combination) {
            staged.run.advance(PlanState::Combining);
            let sql = planner.combination_sql(&staged.tables);
            let combined = match sql {
                Ok(sql) => self.run_combination(sql, &mut staged).await,
                Err(e) => Err(e),
            };
            match combined {
                Ok(rs) => rs,
                Err(e) => {
                    staged.run.advance(PlanState::Failed);
                    return Err(e);
                }
            }
        } else {
            staged.primary_result()
        };

        staged.run.advance(PlanState::Done);
        let metadata = staged.into_metadata();
        info!(
            rows = result.rows.len(),
            tables = metadata.tables.len(),
            total_ms = metadata.total_time_ms,
            "Plan finished"
        );
        Ok((result, metadata))
    }

    async fn run_combination(
        &self,
        sql: String,
        staged: &mut StagedPlan,
    ) -> EngineResult<ResultSet> {
        let start = Instant::now();
        let result = self.combine(&sql).await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        staged.scratch_time_ms += elapsed_ms;
        metrics::record_combination(elapsed_ms, result.is_ok());
        result
    }

    /// Runs combination SQL against the scratch store.
    pub async fn combine(&self, sql: &str) -> EngineResult<CombinedResult> {
        if self.sandbox {
            check_combination_sql(sql)?;
        }
        let sql = sql.to_string();
        self.store
            .blocking(move |store| store.query(&sql))
            .await
            .map_err(|e| match e {
                EngineError::ExecutionError { message } | EngineError::Scratch { message } => {
                    EngineError::combination(message)
                }
                other => other,
            })
    }

    /// Executes every source call of `plan` and stages the results.
    ///
    /// A failed source fails the whole plan; sibling calls already in flight
    /// still run to completion and their results are discarded.
    #[instrument(skip_all, fields(sources = plan.source_count()))]
    pub async fn stage(&self, plan: &QueryPlan) -> EngineResult<StagedPlan> {
        plan.validate()?;

        let order = self.policy.order_for(plan);
        let mut staged = StagedPlan {
            tables: Vec::new(),
            outputs: Vec::new(),
            source_results: Vec::new(),
            order,
            touched_origin: plan.touches_origin(),
            warnings: Vec::new(),
            scratch_time_ms: 0.0,
            run: PlanRun::new(),
            started: Instant::now(),
        };
        info!(plan_id = %staged.run.id, ?order, "Plan accepted");
        staged.run.advance(PlanState::Executing);

        let outcome = match order {
            ExecutionOrder::Parallel => self.stage_parallel(plan, &mut staged).await,
            ExecutionOrder::Sequential => self.stage_sequential(plan, &mut staged).await,
        };

        if let Err(e) = outcome {
            staged.run.advance(PlanState::Failed);
            return Err(e);
        }
        staged.run.advance(PlanState::Materializing);
        let rows = staged.tables.iter().map(|t| t.row_count).sum();
        metrics::record_staging(order, staged.tables.len(), rows);
        Ok(staged)
    }

    async fn stage_parallel(&self, plan: &QueryPlan, staged: &mut StagedPlan) -> EngineResult<()> {
        let calls: Vec<SourceCall> = plan
            .relational
            .iter()
            .cloned()
            .map(SourceCall::Relational)
            .chain(plan.tool_calls.iter().cloned().map(SourceCall::Tool))
            .collect();

        let handles = calls.iter().cloned().map(|call| self.spawn_call(call)).collect();
        let outcomes = join_outcomes(handles).await;

        let mut fetched = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok((rs, meta)) => {
                    staged.source_results.push(meta);
                    fetched.push(rs);
                }
                Err(e) => failures.push(e),
            }
        }
        fail_if_any(failures)?;

        staged.run.advance(PlanState::Materializing);
        for (call, rs) in calls.iter().zip(fetched) {
            self.stage_result(call, rs, plan.needs_combination, staged).await?;
        }
        Ok(())
    }

    async fn stage_sequential(&self, plan: &QueryPlan, staged: &mut StagedPlan) -> EngineResult<()> {
        let tool_calls: Vec<SourceCall> = plan.tool_calls.iter().cloned().map(SourceCall::Tool).collect();
        let tool_handles: Vec<_> = tool_calls
            .iter()
            .cloned()
            .map(|call| self.spawn_call(call))
            .collect();

        let mut failures = Vec::new();
        let mut chain_error = None;
        for query in &plan.relational {
            let call = SourceCall::Relational(query.clone());
            staged.run.advance(PlanState::Executing);
            match self.executor.execute(&call).await {
                Ok((rs, meta)) => {
                    staged.source_results.push(meta);
                    staged.run.advance(PlanState::Materializing);
                    if let Err(e) = self.stage_result(&call, rs, plan.needs_combination, staged).await {
                        chain_error = Some(e);
                        break;
                    }
                }
                Err(e) => {
                    failures.push(e);
                    break;
                }
            }
        }

        // Tool calls were started up front; let them finish before failing.
        let tool_outcomes = join_outcomes(tool_handles).await;
        let mut fetched = Vec::with_capacity(tool_outcomes.len());
        for outcome in tool_outcomes {
            match outcome {
                Ok((rs, meta)) => {
                    staged.source_results.push(meta);
                    fetched.push(rs);
                }
                Err(e) => failures.push(e),
            }
        }
        if let Some(e) = chain_error {
            if failures.is_empty() {
                return Err(e);
            }
            failures.insert(0, e);
        }
        fail_if_any(failures)?;

        staged.run.advance(PlanState::Materializing);
        for (call, rs) in tool_calls.iter().zip(fetched) {
            self.stage_result(call, rs, plan.needs_combination, staged).await?;
        }
        Ok(())
    }

    fn spawn_call(&self, call: SourceCall) -> JoinHandle<CallOutcome> {
        let executor = self.executor.clone();
        tokio::spawn(async move { executor.execute(&call).await })
    }

    /// Stages one result as `temp_{alias}` and records it.
    async fn stage_result(
        &self,
        call: &SourceCall,
        result: ResultSet,
        needs_combination: bool,
        staged: &mut StagedPlan,
    ) -> EngineResult<()> {
        let alias = call.alias().to_string();
        let table_name = alias_table_name(&alias);

        if result.columns.is_empty() {
            if needs_combination {
                return Err(EngineError::no_columns(table_name));
            }
            staged.warnings.push(format!(
                "Source '{}' ({alias}) returned no columns; nothing was staged",
                call.source_id()
            ));
            staged.outputs.push(StagedOutput {
                alias,
                kind: call.kind(),
                table: None,
                result,
            });
            return Ok(());
        }

        if result.rows.is_empty() {
            staged.warnings.push(format!(
                "Source '{}' ({alias}) returned no rows",
                call.source_id()
            ));
        }

        let start = Instant::now();
        let name = table_name.clone();
        let source_alias = alias.clone();
        let (table, result) = self
            .store
            .blocking(move |store| {
                store
                    .materialize(&name, &source_alias, &result)
                    .map(|table| (table, result))
            })
            .await?;
        staged.scratch_time_ms += start.elapsed().as_secs_f64() * 1000.0;

        staged.tables.push(table);
        staged.outputs.push(StagedOutput {
            alias,
            kind: call.kind(),
            table: Some(table_name),
            result,
        });
        Ok(())
    }
}

/// Waits for every spawned call; a panicked task counts as an internal failure.
async fn join_outcomes(handles: Vec<JoinHandle<CallOutcome>>) -> Vec<CallOutcome> {
    join_all(handles)
        .await
        .into_iter()
        .map(|joined| {
            joined.unwrap_or_else(|e| {
                Err(EngineError::internal(format!("Source task panicked: {e}")))
            })
        })
        .collect()
}

fn fail_if_any(failures: Vec<EngineError>) -> EngineResult<()> {
    if failures.is_empty() {
        return Ok(());
    }
    for _ in &failures {
        metrics::record_source_failure();
    }
    Err(EngineError::PlanFailed { failures })
}

/// Describes a combined result for the caller.
pub fn metadata_of(result: &CombinedResult) -> DataMetadata {
    DataMetadata {
        columns: result.columns.clone(),
        column_types: schema::describe(result),
        row_count: result.rows.len() as u64,
    }
}
