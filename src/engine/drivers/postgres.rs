//! PostgreSQL Driver
//!
//! Implements [`RelationalBackend`] for PostgreSQL using SQLx.
//!
//! Statement text with several statements runs them in order on one pooled
//! connection, so session-level settings (`SET search_path`, temp tables)
//! carry over to the final query.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::{Column, Executor, Row, Statement};
use tracing::{debug, instrument};

use crate::engine::drivers::{returns_rows, split_statements};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::RelationalBackend;
use crate::engine::types::{hex_encode, ResultSet, Row as QRow, Value};

/// PostgreSQL backend over a connection pool
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub async fn connect(url: &str, max_connections: u32) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Converts a SQLx row to our universal Row type
    fn convert_row(pg_row: &PgRow) -> QRow {
        let values: Vec<Value> = pg_row
            .columns()
            .iter()
            .map(|col| Self::extract_value(pg_row, col.ordinal()))
            .collect();

        QRow { values }
    }

    /// Extracts a value from a PgRow at the given index
    fn extract_value(row: &PgRow, idx: usize) -> Value {
        // try_get checks type compatibility, so the first match is the column's type
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i64::from(i))).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|i| Value::Int(i64::from(i))).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
            return v.map(|f| Value::Float(f64::from(f))).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<rust_decimal::Decimal>, _>(idx) {
            return v.map(decimal_to_value).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<uuid::Uuid>, _>(idx) {
            return v.map(|u| Value::Text(u.to_string())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
            return v.map(|j| Value::Text(j.to_string())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
            return v.map(|dt| Value::Text(dt.to_rfc3339())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
            return v
                .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
            return v
                .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(idx) {
            return v
                .map(|t| Value::Text(t.format("%H:%M:%S").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(|b| Value::Text(hex_encode(&b))).unwrap_or(Value::Null);
        }

        // Unsupported types (arrays, ranges, geometric) have no scalar form
        Value::Null
    }

    async fn fetch(conn: &mut PoolConnection<Postgres>, statement: &str) -> EngineResult<ResultSet> {
        let pg_rows: Vec<PgRow> = sqlx::query(statement)
            .fetch_all(&mut **conn)
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?;

        let columns: Vec<String> = match pg_rows.first() {
            Some(first) => first.columns().iter().map(|c| c.name().to_string()).collect(),
            None => {
                // No rows to read names from; ask the server to describe the statement.
                let described = (&mut **conn)
                    .prepare(statement)
                    .await
                    .map_err(|e| EngineError::execution_error(e.to_string()))?;
                described
                    .columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect()
            }
        };

        let rows = pg_rows.iter().map(Self::convert_row).collect();
        ResultSet::new(columns, rows)
    }
}

pub(crate) fn decimal_to_value(d: rust_decimal::Decimal) -> Value {
    use rust_decimal::prelude::ToPrimitive;

    d.to_f64()
        .map(Value::Float)
        .unwrap_or_else(|| Value::Text(d.to_string()))
}

#[async_trait]
impl RelationalBackend for PostgresBackend {
    fn driver_id(&self) -> &'static str {
        "postgres"
    }

    #[instrument(skip(self, statement), fields(driver = "postgres"))]
    async fn execute(&self, statement: &str) -> EngineResult<ResultSet> {
        let statements = split_statements(statement);
        if statements.is_empty() {
            return Err(EngineError::execution_error("empty statement"));
        }

        let start = Instant::now();
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;

        let mut last = None;
        for stmt in &statements {
            if returns_rows(stmt) {
                last = Some(Self::fetch(&mut conn, stmt).await?);
            } else {
                sqlx::query(stmt)
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| EngineError::execution_error(e.to_string()))?;
            }
        }

        let result = last.unwrap_or_default();
        debug!(
            statements = statements.len(),
            rows = result.rows.len(),
            elapsed_ms = start.elapsed().as_micros() as f64 / 1000.0,
            "Statement executed"
        );
        Ok(result)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
