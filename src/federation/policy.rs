// SPDX-License-Identifier: Apache-2.0

//! Execution-order policy.
//!
//! Decides whether the relational sub-queries of a plan may be fanned out or
//! must run as a chain, each result staged before the next statement starts.
//! Tool calls always fan out.

use serde::Serialize;

use crate::federation::types::QueryPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOrder {
    /// Every call fans out; results are staged afterwards in plan order.
    Parallel,
    /// Relational sub-queries run one after another and may read earlier
    /// results from the scratch store.
    Sequential,
}

pub trait SchedulingPolicy: Send + Sync {
    fn order_for(&self, plan: &QueryPlan) -> ExecutionOrder;
}

/// More than one relational sub-query means the later ones may depend on the
/// earlier ones, so they run in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountBasedPolicy;

impl SchedulingPolicy for CountBasedPolicy {
    fn order_for(&self, plan: &QueryPlan) -> ExecutionOrder {
        if plan.relational.len() > 1 {
            ExecutionOrder::Sequential
        } else {
            ExecutionOrder::Parallel
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::types::{RelationalSubQuery, ToolCall};

    fn rel(alias: &str) -> RelationalSubQuery {
        RelationalSubQuery {
            source_id: "pg".into(),
            statement: "SELECT 1".into(),
            result_alias: alias.into(),
        }
    }

    fn tool(alias: &str) -> ToolCall {
        ToolCall {
            source_id: "crm".into(),
            tool_name: "list".into(),
            parameters: Default::default(),
            result_alias: alias.into(),
        }
    }

    #[test]
    fn single_relational_query_runs_in_parallel() {
        let plan = QueryPlan {
            relational: vec![rel("a")],
            tool_calls: vec![tool("b"), tool("c")],
            needs_combination: true,
        };
        assert_eq!(CountBasedPolicy.order_for(&plan), ExecutionOrder::Parallel);
    }

    #[test]
    fn several_relational_queries_run_in_order() {
        let plan = QueryPlan {
            relational: vec![rel("a"), rel("b")],
            ..Default::default()
        };
        assert_eq!(CountBasedPolicy.order_for(&plan), ExecutionOrder::Sequential);
    }

    #[test]
    fn tool_only_plan_runs_in_parallel() {
        let plan = QueryPlan {
            tool_calls: vec![tool("a"), tool("b"), tool("c")],
            ..Default::default()
        };
        assert_eq!(CountBasedPolicy.order_for(&plan), ExecutionOrder::Parallel);
    }
}
