//! MySQL Driver
//!
//! Implements [`RelationalBackend`] for MySQL/MariaDB using SQLx.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::mysql::{MySql, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::{Column, Executor, Row, Statement};
use tracing::{debug, instrument};

use crate::engine::drivers::postgres::decimal_to_value;
use crate::engine::drivers::{returns_rows, split_statements};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::RelationalBackend;
use crate::engine::types::{hex_encode, ResultSet, Row as QRow, Value};

/// MySQL backend over a connection pool
pub struct MySqlBackend {
    pool: MySqlPool,
}

impl MySqlBackend {
    pub async fn connect(url: &str, max_connections: u32) -> EngineResult<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;
        Ok(Self { pool })
    }

    fn convert_row(row: &MySqlRow) -> QRow {
        QRow {
            values: (0..row.columns().len())
                .map(|idx| Self::extract_value(row, idx))
                .collect(),
        }
    }

    fn extract_value(row: &MySqlRow, idx: usize) -> Value {
        // BIGINT UNSIGNED first; values past i64::MAX keep their magnitude as floats
        if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
            return v
                .map(|u| i64::try_from(u).map(Value::Int).unwrap_or(Value::Float(u as f64)))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i64::from(i))).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u32>, _>(idx) {
            return v.map(|u| Value::Int(i64::from(u))).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|i| Value::Int(i64::from(i))).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u16>, _>(idx) {
            return v.map(|u| Value::Int(i64::from(u))).unwrap_or(Value::Null);
        }
        // TINYINT(1) is MySQL's BOOLEAN
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i8>, _>(idx) {
            return v.map(|i| Value::Int(i64::from(i))).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u8>, _>(idx) {
            return v.map(|u| Value::Int(i64::from(u))).unwrap_or(Value::Null);
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
        if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
            return v.map(|j| Value::Text(j.to_string())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(|b| Value::Text(hex_encode(&b))).unwrap_or(Value::Null);
        }

        Value::Null
    }

    async fn fetch(conn: &mut PoolConnection<MySql>, statement: &str) -> EngineResult<ResultSet> {
        let rows: Vec<MySqlRow> = sqlx::query(statement)
            .fetch_all(&mut **conn)
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?;

        let columns: Vec<String> = match rows.first() {
            Some(first) => first.columns().iter().map(|c| c.name().to_string()).collect(),
            None => (&mut **conn)
                .prepare(statement)
                .await
                .map_err(|e| EngineError::execution_error(e.to_string()))?
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
        };

        ResultSet::new(columns, rows.iter().map(Self::convert_row).collect())
    }
}

#[async_trait]
impl RelationalBackend for MySqlBackend {
    fn driver_id(&self) -> &'static str {
        "mysql"
    }

    #[instrument(skip(self, statement), fields(driver = "mysql"))]
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
