// SPDX-License-Identifier: Apache-2.0

//! Types for the federation engine: query plans, staged tables and run metadata.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::ResultSet;
use crate::federation::ident::{validate_identifier, validate_table_name};
use crate::federation::schema::InferredSchema;

/// Reserved source id that routes a relational sub-query to the scratch store.
pub const SCRATCH_SOURCE_ID: &str = "__session__";

/// Prefix of the scratch table a plan alias is materialized into.
pub const ALIAS_TABLE_PREFIX: &str = "temp_";

/// Scratch table name for a plan alias (e.g., `orders` → `temp_orders`).
pub fn alias_table_name(alias: &str) -> String {
    format!("{ALIAS_TABLE_PREFIX}{alias}")
}

/// A statement to run against one relational source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationalSubQuery {
    pub source_id: String,
    pub statement: String,
    pub result_alias: String,
}

/// A named tool invocation against one remote tool source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub source_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub parameters: Map<String, JsonValue>,
    pub result_alias: String,
}

/// The complete execution plan handed over by the plan producer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    #[serde(default)]
    pub relational: Vec<RelationalSubQuery>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub needs_combination: bool,
}

impl QueryPlan {
    /// Checks alias uniqueness and identifier safety before anything runs.
    pub fn validate(&self) -> EngineResult<()> {
        let mut seen = HashSet::new();
        let aliases = self
            .relational
            .iter()
            .map(|q| q.result_alias.as_str())
            .chain(self.tool_calls.iter().map(|t| t.result_alias.as_str()));

        for alias in aliases {
            validate_identifier(alias)?;
            validate_table_name(&alias_table_name(alias))?;
            if !seen.insert(alias) {
                return Err(EngineError::invalid_plan(format!(
                    "duplicate result alias '{alias}'"
                )));
            }
        }

        for q in &self.relational {
            if q.statement.trim().is_empty() {
                return Err(EngineError::invalid_plan(format!(
                    "sub-query '{}' has an empty statement",
                    q.result_alias
                )));
            }
        }
        for t in &self.tool_calls {
            if t.tool_name.trim().is_empty() {
                return Err(EngineError::invalid_plan(format!(
                    "tool call '{}' has no tool name",
                    t.result_alias
                )));
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.relational.is_empty() && self.tool_calls.is_empty()
    }

    /// True when any call leaves the scratch store: a relational sub-query on a
    /// real source, or any tool call.
    pub fn touches_origin(&self) -> bool {
        !self.tool_calls.is_empty()
            || self
                .relational
                .iter()
                .any(|q| q.source_id != SCRATCH_SOURCE_ID)
    }

    pub fn source_count(&self) -> usize {
        self.relational.len() + self.tool_calls.len()
    }
}

/// A table staged in the scratch store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScratchTable {
    pub name: String,
    pub schema: InferredSchema,
    pub source_alias: String,
    pub row_count: u64,
}

/// The final result of a plan.
pub type CombinedResult = ResultSet;

/// Lifecycle of a single plan run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanState {
    Planning,
    Executing,
    Materializing,
    Combining,
    Done,
    Failed,
}

impl PlanState {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: PlanState) -> bool {
        use PlanState::*;
        match (self, next) {
            (Done | Failed, _) => false,
            (_, Failed) => true,
            (Planning, Executing) => true,
            // Sequential chains interleave execution and materialization.
            (Executing, Materializing) | (Materializing, Executing) => true,
            (Executing | Materializing, Done) => true,
            (Materializing, Combining) => true,
            (Combining, Done) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PlanState::Done | PlanState::Failed)
    }
}

impl fmt::Display for PlanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlanState::Planning => "planning",
            PlanState::Executing => "executing",
            PlanState::Materializing => "materializing",
            PlanState::Combining => "combining",
            PlanState::Done => "done",
            PlanState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Relational,
    Tool,
}

/// Result metadata for a single source call.
#[derive(Debug, Clone, Serialize)]
pub struct SourceFetchResult {
    pub source_id: String,
    pub alias: String,
    pub kind: SourceKind,
    /// Number of rows fetched
    pub row_count: u64,
    /// Fetch duration in milliseconds
    pub fetch_time_ms: f64,
}

/// Run report returned next to the combined result.
#[derive(Debug, Clone, Serialize)]
pub struct FederationMetadata {
    /// Per-source fetch results, in completion order
    pub source_results: Vec<SourceFetchResult>,
    /// Tables staged in the scratch store, in plan order
    pub tables: Vec<ScratchTable>,
    pub order: crate::federation::policy::ExecutionOrder,
    /// Scratch-store time (materialization + combination) in milliseconds
    pub scratch_time_ms: f64,
    /// Total pipeline time in milliseconds
    pub total_time_ms: f64,
    pub final_state: PlanState,
    pub touched_origin: bool,
    /// Warnings (e.g., sources that returned no rows)
    pub warnings: Vec<String>,
}

/// Description of a combined result for the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataMetadata {
    pub columns: Vec<String>,
    pub column_types: InferredSchema,
    pub row_count: u64,
}

/// Produces the combination SQL once the per-source tables are staged.
///
/// This is the boundary to the plan producer: it sees table names and inferred
/// schemas, never the rows.
pub trait CombinationPlanner: Send + Sync {
    fn combination_sql(&self, tables: &[ScratchTable]) -> EngineResult<String>;
}

/// A planner that already knows its SQL (the common case when the plan
/// producer wrote the combination query up front).
#[derive(Debug, Clone)]
pub struct FixedCombination(pub String);

impl CombinationPlanner for FixedCombination {
    fn combination_sql(&self, _tables: &[ScratchTable]) -> EngineResult<String> {
        Ok(self.0.clone())
    }
}

impl<F> CombinationPlanner for F
where
    F: Fn(&[ScratchTable]) -> EngineResult<String> + Send + Sync,
{
    fn combination_sql(&self, tables: &[ScratchTable]) -> EngineResult<String> {
        self(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rel(source: &str, alias: &str) -> RelationalSubQuery {
        RelationalSubQuery {
            source_id: source.into(),
            statement: "SELECT 1".into(),
            result_alias: alias.into(),
        }
    }

    #[test]
    fn plan_deserializes_with_defaults() {
        let plan: QueryPlan = serde_json::from_value(json!({
            "tool_calls": [
                {"source_id": "crm", "tool_name": "list_contacts", "result_alias": "contacts"}
            ]
        }))
        .unwrap();
        assert!(plan.relational.is_empty());
        assert!(!plan.needs_combination);
        assert!(plan.tool_calls[0].parameters.is_empty());
    }

    #[test]
    fn duplicate_aliases_are_rejected() {
        let plan = QueryPlan {
            relational: vec![rel("pg", "orders")],
            tool_calls: vec![ToolCall {
                source_id: "crm".into(),
                tool_name: "t".into(),
                parameters: Map::new(),
                result_alias: "orders".into(),
            }],
            needs_combination: true,
        };
        assert!(matches!(plan.validate(), Err(EngineError::InvalidPlan { .. })));
    }

    #[test]
    fn unsafe_alias_is_rejected() {
        let plan = QueryPlan {
            relational: vec![rel("pg", "x; DROP TABLE y")],
            ..Default::default()
        };
        assert!(matches!(
            plan.validate(),
            Err(EngineError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn session_only_plans_do_not_touch_origin() {
        let plan = QueryPlan {
            relational: vec![rel(SCRATCH_SOURCE_ID, "again")],
            ..Default::default()
        };
        assert!(!plan.touches_origin());

        let plan = QueryPlan {
            relational: vec![rel(SCRATCH_SOURCE_ID, "a"), rel("pg", "b")],
            ..Default::default()
        };
        assert!(plan.touches_origin());
    }

    #[test]
    fn terminal_states_are_final() {
        assert!(PlanState::Planning.can_transition_to(PlanState::Executing));
        assert!(PlanState::Materializing.can_transition_to(PlanState::Combining));
        assert!(!PlanState::Done.can_transition_to(PlanState::Failed));
        assert!(!PlanState::Planning.can_transition_to(PlanState::Combining));
    }
}
