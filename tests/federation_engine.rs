// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests for `FederationEngine`.
//!
//! Sources are a SQLite file and in-process tool invokers, so no external
//! services are needed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Map, Value as JsonValue};

use fedstage::config::{RelationalDriver, RelationalSourceConfig};
use fedstage::engine::drivers::sqlite::SqliteBackend;
use fedstage::federation::{ExecutionOrder, PlanState};
use fedstage::observability::Sensitive;
use fedstage::{
    metadata_of, EngineConfig, EngineError, EngineResult, FederationEngine, FixedCombination,
    QueryPlan, RelationalBackend, RelationalSubQuery, ResultSet, Row, ToolCall, ToolInvoker,
    Value,
};

struct SlowTool {
    delay: Duration,
    payload: JsonValue,
}

#[async_trait]
impl ToolInvoker for SlowTool {
    async fn call_tool(
        &self,
        _tool_name: &str,
        _arguments: &Map<String, JsonValue>,
    ) -> EngineResult<JsonValue> {
        tokio::time::sleep(self.delay).await;
        Ok(self.payload.clone())
    }
}

struct SlowBackend {
    delay: Duration,
}

#[async_trait]
impl RelationalBackend for SlowBackend {
    fn driver_id(&self) -> &'static str {
        "slow"
    }

    async fn execute(&self, _statement: &str) -> EngineResult<ResultSet> {
        tokio::time::sleep(self.delay).await;
        ResultSet::new(vec!["n".into()], vec![Row::new(vec![Value::Int(1)])])
    }
}

fn rel(source: &str, statement: &str, alias: &str) -> RelationalSubQuery {
    RelationalSubQuery {
        source_id: source.into(),
        statement: statement.into(),
        result_alias: alias.into(),
    }
}

fn tool(source: &str, alias: &str) -> ToolCall {
    ToolCall {
        source_id: source.into(),
        tool_name: "list_records".into(),
        parameters: Map::new(),
        result_alias: alias.into(),
    }
}

/// Engine with a seeded SQLite `shop` source, scratch files under a temp dir.
async fn engine_with_shop() -> (tempfile::TempDir, FederationEngine) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("shop.db").display().to_string();

    let seed = SqliteBackend::connect(&db_path, 1).await.unwrap();
    seed.execute(
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER, amount INTEGER);
         INSERT INTO orders (customer_id, amount) VALUES (1, 80), (1, 70), (2, 40), (3, 500);",
    )
    .await
    .unwrap();
    seed.close().await;

    let config = EngineConfig {
        scratch_dir: dir.path().join("scratch"),
        relational_sources: vec![RelationalSourceConfig {
            id: "shop".into(),
            driver: RelationalDriver::Sqlite,
            url: Sensitive::new(db_path),
        }],
        ..Default::default()
    };
    let engine = FederationEngine::new(config, "test-session").unwrap();
    (dir, engine)
}

#[tokio::test]
async fn dependent_sub_queries_run_in_order() {
    let (_dir, engine) = engine_with_shop().await;
    let plan = QueryPlan {
        relational: vec![
            rel(
                "shop",
                "SELECT customer_id, SUM(amount) AS total FROM orders GROUP BY customer_id",
                "first",
            ),
            rel(
                "__session__",
                "SELECT customer_id FROM temp_first WHERE total > 100 ORDER BY customer_id",
                "second",
            ),
        ],
        ..Default::default()
    };

    let (result, meta) = engine.execute_plan(&plan, None).await.unwrap();
    assert_eq!(meta.order, ExecutionOrder::Sequential);
    assert_eq!(result.columns, vec!["customer_id"]);
    assert_eq!(
        result.rows,
        vec![
            Row::new(vec![Value::Int(1)]),
            Row::new(vec![Value::Int(3)]),
        ]
    );
    assert_eq!(meta.tables.len(), 2);
    assert_eq!(meta.final_state, PlanState::Done);
}

#[tokio::test]
async fn independent_sources_run_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        scratch_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let engine = FederationEngine::new(config, "concurrent").unwrap();
    let delay = Duration::from_millis(200);
    engine
        .register_relational_backend("warehouse", Arc::new(SlowBackend { delay }))
        .unwrap();
    for id in ["crm", "billing"] {
        engine.register_tool_invoker(
            id,
            Arc::new(SlowTool {
                delay,
                payload: json!([{"id": 1}]),
            }),
        );
    }

    let plan = QueryPlan {
        relational: vec![rel("warehouse", "SELECT 1", "w")],
        tool_calls: vec![tool("crm", "c"), tool("billing", "b")],
        needs_combination: false,
    };

    let start = Instant::now();
    let (_, meta) = engine.execute_plan(&plan, None).await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(meta.order, ExecutionOrder::Parallel);
    assert_eq!(meta.source_results.len(), 3);
    assert!(elapsed < Duration::from_millis(550), "took {elapsed:?}");
}

#[tokio::test]
async fn relational_and_tool_results_are_joined() {
    let (_dir, engine) = engine_with_shop().await;
    engine.register_tool_invoker(
        "crm",
        Arc::new(SlowTool {
            delay: Duration::ZERO,
            payload: json!([
                {"customer_id": 1, "name": "Ada", "vip": true},
                {"customer_id": 2, "name": "Bob", "vip": false},
                {"customer_id": 3, "name": "Cy", "vip": true}
            ]),
        }),
    );

    let plan = QueryPlan {
        relational: vec![rel(
            "shop",
            "SELECT customer_id, SUM(amount) AS total FROM orders GROUP BY customer_id",
            "spend",
        )],
        tool_calls: vec![tool("crm", "customers")],
        needs_combination: true,
    };
    let planner = FixedCombination(
        "SELECT c.name, s.total FROM temp_spend s \
         JOIN temp_customers c ON c.customer_id = s.customer_id \
         WHERE c.vip ORDER BY s.total DESC"
            .into(),
    );

    let (result, meta) = engine.execute_plan(&plan, Some(&planner)).await.unwrap();
    assert_eq!(result.columns, vec!["name", "total"]);
    assert_eq!(
        result.rows,
        vec![
            Row::new(vec!["Cy".into(), Value::Int(500)]),
            Row::new(vec!["Ada".into(), Value::Int(150)]),
        ]
    );
    assert!(meta.touched_origin);

    let described = metadata_of(&result);
    assert_eq!(described.row_count, 2);
    assert_eq!(described.columns, vec!["name", "total"]);
}

#[tokio::test]
async fn two_phase_staging_then_combine() {
    let (_dir, engine) = engine_with_shop().await;
    let plan = QueryPlan {
        relational: vec![rel("shop", "SELECT * FROM orders", "orders")],
        needs_combination: true,
        ..Default::default()
    };

    let staged = engine.stage_plan(&plan).await.unwrap();
    assert_eq!(staged.tables.len(), 1);
    assert_eq!(staged.tables[0].name, "temp_orders");
    assert_eq!(staged.tables[0].row_count, 4);

    let result = engine
        .combine("SELECT COUNT(DISTINCT customer_id) AS customers FROM temp_orders")
        .await
        .unwrap();
    assert_eq!(result.get(0, "customers"), Some(&Value::Int(3)));

    let err = engine.combine("DELETE FROM temp_orders").await.unwrap_err();
    assert!(matches!(err, EngineError::CombinationQuery { .. }));
}

#[tokio::test]
async fn non_tabular_tool_fails_the_plan() {
    let (_dir, engine) = engine_with_shop().await;
    engine.register_tool_invoker(
        "crm",
        Arc::new(SlowTool {
            delay: Duration::ZERO,
            payload: json!([{"a": 1}, {"b": 2}]),
        }),
    );
    let plan = QueryPlan {
        relational: vec![rel("shop", "SELECT * FROM orders", "orders")],
        tool_calls: vec![tool("crm", "crm_rows")],
        needs_combination: false,
    };

    let err = engine.execute_plan(&plan, None).await.unwrap_err();
    match err {
        EngineError::PlanFailed { failures } => {
            assert_eq!(failures.len(), 1);
            assert!(matches!(
                &failures[0],
                EngineError::NonTabularResponse { source_id, .. } if source_id == "crm"
            ));
        }
        other => panic!("expected PlanFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn failing_statement_is_attributed_to_its_source() {
    let (_dir, engine) = engine_with_shop().await;
    let plan = QueryPlan {
        relational: vec![rel("shop", "SELECT * FROM no_such_table", "x")],
        ..Default::default()
    };
    let err = engine.execute_plan(&plan, None).await.unwrap_err();
    let EngineError::PlanFailed { failures } = err else {
        panic!("expected PlanFailed");
    };
    assert!(matches!(
        &failures[0],
        EngineError::SourceExecution { source_id, .. } if source_id == "shop"
    ));
}

#[tokio::test]
async fn duplicate_aliases_are_rejected_before_running() {
    let (_dir, engine) = engine_with_shop().await;
    let plan = QueryPlan {
        relational: vec![rel("shop", "SELECT 1", "dup")],
        tool_calls: vec![tool("crm", "dup")],
        needs_combination: false,
    };
    let err = engine.execute_plan(&plan, None).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidPlan { .. }));
}

#[tokio::test]
async fn session_tables_live_until_dropped() {
    let (_dir, engine) = engine_with_shop().await;
    let result = ResultSet::new(
        vec!["customer_id".into(), "total".into()],
        vec![
            Row::new(vec![Value::Int(1), Value::Int(150)]),
            Row::new(vec![Value::Int(3), Value::Int(500)]),
        ],
    )
    .unwrap();

    let sessions = engine.sessions();
    let name = sessions.create("abc-123", 1, &result).await.unwrap();
    assert_eq!(name, "session_abc_123_interaction_1");
    assert_eq!(
        sessions.list_for_session("abc-123").await.unwrap(),
        vec![name.clone()]
    );

    let page = sessions.query(&name, Some(1), 1).await.unwrap();
    assert_eq!(page.rows, vec![Row::new(vec![Value::Int(3), Value::Int(500)])]);

    // Later plans can read the table through the session source.
    let plan = QueryPlan {
        relational: vec![rel(
            "__session__",
            "SELECT SUM(total) AS grand_total FROM session_abc_123_interaction_1",
            "reuse",
        )],
        ..Default::default()
    };
    let (reused, meta) = engine.execute_plan(&plan, None).await.unwrap();
    assert_eq!(reused.get(0, "grand_total"), Some(&Value::Int(650)));
    assert!(!meta.touched_origin);

    assert_eq!(engine.discard_staging().await.unwrap(), 1);
    assert_eq!(sessions.drop_for_session("abc-123").await.unwrap(), 1);
    assert!(sessions.list_for_session("abc-123").await.unwrap().is_empty());
}

#[tokio::test]
async fn cleanup_deletes_the_scratch_file() {
    let (_dir, engine) = engine_with_shop().await;
    let plan = QueryPlan {
        relational: vec![rel("shop", "SELECT * FROM orders", "orders")],
        ..Default::default()
    };
    engine.execute_plan(&plan, None).await.unwrap();
    let session_rows = ResultSet::new(vec!["x".into()], vec![Row::new(vec![Value::Int(1)])]).unwrap();
    engine.sessions().create("s", 1, &session_rows).await.unwrap();
    assert!(engine.scratch_path().exists());

    engine.cleanup().await.unwrap();
    assert!(!engine.scratch_path().exists());

    // The engine keeps working on a fresh, empty store.
    assert!(engine.sessions().list_for_session("s").await.unwrap().is_empty());
    let err = engine.combine("SELECT * FROM temp_orders").await.unwrap_err();
    assert!(matches!(err, EngineError::CombinationQuery { .. }));

    engine.shutdown().await.unwrap();
}
