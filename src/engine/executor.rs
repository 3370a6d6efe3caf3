// SPDX-License-Identifier: Apache-2.0

//! Source executors
//!
//! One entry point, [`SourceExecutor::execute`], runs either kind of source
//! call and hands back a validated [`ResultSet`]. Every failure comes out
//! attributed to the source that caused it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::registry::{SourceRegistry, ToolRegistry};
use crate::engine::types::{ResultSet, Row, Value};
use crate::federation::types::{RelationalSubQuery, SourceFetchResult, SourceKind, ToolCall};

/// A single call against one source.
#[derive(Debug, Clone)]
pub enum SourceCall {
    Relational(RelationalSubQuery),
    Tool(ToolCall),
}

impl SourceCall {
    pub fn source_id(&self) -> &str {
        match self {
            SourceCall::Relational(q) => &q.source_id,
            SourceCall::Tool(t) => &t.source_id,
        }
    }

    pub fn alias(&self) -> &str {
        match self {
            SourceCall::Relational(q) => &q.result_alias,
            SourceCall::Tool(t) => &t.result_alias,
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            SourceCall::Relational(_) => SourceKind::Relational,
            SourceCall::Tool(_) => SourceKind::Tool,
        }
    }
}

#[derive(Clone)]
pub struct RelationalExecutor {
    registry: Arc<SourceRegistry>,
}

impl RelationalExecutor {
    pub fn new(registry: Arc<SourceRegistry>) -> Self {
        Self { registry }
    }

    pub async fn execute(&self, query: &RelationalSubQuery) -> EngineResult<ResultSet> {
        let backend = self.registry.resolve(&query.source_id).await?;
        backend
            .execute(&query.statement)
            .await
            .map_err(|e| e.for_source(&query.source_id))
    }
}

#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub async fn execute(&self, call: &ToolCall) -> EngineResult<ResultSet> {
        let invoker = self.registry.resolve(&call.source_id)?;
        let payload = invoker
            .call_tool(&call.tool_name, &call.parameters)
            .await
            .map_err(|e| e.for_source(&call.source_id))?;
        validate_tabular(&call.source_id, &call.tool_name, &payload)
    }
}

/// Checks that a tool payload is a table and converts it.
///
/// The payload must be a JSON array of objects, and every object must carry
/// exactly the key set of the first one. Columns follow the first object's
/// key order; an empty array is an empty, columnless result.
pub fn validate_tabular(source_id: &str, tool: &str, payload: &JsonValue) -> EngineResult<ResultSet> {
    let items = payload.as_array().ok_or_else(|| {
        EngineError::non_tabular(
            source_id,
            tool,
            format!("expected an array of objects, got {}", json_kind(payload)),
        )
    })?;

    let Some(first) = items.first() else {
        return Ok(ResultSet::empty());
    };
    let first = first.as_object().ok_or_else(|| {
        EngineError::non_tabular(source_id, tool, format!("element 0 is {}", json_kind(&items[0])))
    })?;
    let columns: Vec<String> = first.keys().cloned().collect();

    let mut rows = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let obj = item.as_object().ok_or_else(|| {
            EngineError::non_tabular(source_id, tool, format!("element {idx} is {}", json_kind(item)))
        })?;
        if obj.len() != columns.len() || !columns.iter().all(|c| obj.contains_key(c)) {
            return Err(EngineError::non_tabular(
                source_id,
                tool,
                format!("element {idx} has a different key set than element 0"),
            ));
        }
        let values = columns
            .iter()
            .map(|c| obj.get(c).map(Value::from_json).unwrap_or(Value::Null))
            .collect();
        rows.push(Row::new(values));
    }

    ResultSet::new(columns, rows)
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// Dispatches source calls to the matching executor, with a per-call timeout.
#[derive(Clone)]
pub struct SourceExecutor {
    relational: RelationalExecutor,
    tools: ToolExecutor,
    timeout: Option<Duration>,
}

impl SourceExecutor {
    pub fn new(
        sources: Arc<SourceRegistry>,
        tools: Arc<ToolRegistry>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            relational: RelationalExecutor::new(sources),
            tools: ToolExecutor::new(tools),
            timeout,
        }
    }

    /// Runs one call. Errors are always source-attributed.
    pub async fn execute(&self, call: &SourceCall) -> EngineResult<(ResultSet, SourceFetchResult)> {
        let start = Instant::now();
        let source_id = call.source_id();

        let fut = async {
            match call {
                SourceCall::Relational(q) => self.relational.execute(q).await,
                SourceCall::Tool(t) => self.tools.execute(t).await,
            }
        };

        let result = match self.timeout {
            Some(limit) => timeout(limit, fut).await.unwrap_or_else(|_| {
                Err(EngineError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                })
            }),
            None => fut.await,
        }
        .map_err(|e| e.for_source(source_id));

        let fetch_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        match result {
            Ok(rs) => {
                debug!(
                    source_id,
                    alias = call.alias(),
                    rows = rs.rows.len(),
                    fetch_time_ms,
                    "Source call finished"
                );
                let meta = SourceFetchResult {
                    source_id: source_id.to_string(),
                    alias: call.alias().to_string(),
                    kind: call.kind(),
                    row_count: rs.rows.len() as u64,
                    fetch_time_ms,
                };
                Ok((rs, meta))
            }
            Err(e) => {
                warn!(source_id, alias = call.alias(), error = %e, "Source call failed");
                Err(e)
            }
        }
    }
}
