// SPDX-License-Identifier: Apache-2.0

//! SQLite Driver
//!
//! Implements [`RelationalBackend`] for SQLite files using SQLx.

use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Executor, Row, Statement, TypeInfo};
use tracing::{debug, instrument};

use crate::engine::drivers::{returns_rows, split_statements};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::RelationalBackend;
use crate::engine::types::{hex_encode, ResultSet, Row as QRow, Value};

/// SQLite backend over a connection pool
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Connects to a SQLite database given as `sqlite:` URL or plain file path.
    pub async fn connect(url: &str, max_connections: u32) -> EngineResult<Self> {
        let options = Self::build_connect_options(url)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;
        Ok(Self { pool })
    }

    fn build_connect_options(url: &str) -> EngineResult<SqliteConnectOptions> {
        let url = url.trim();
        if url.is_empty() {
            return Err(EngineError::connection_failed("SQLite path cannot be empty"));
        }

        let conn_str = if url == ":memory:" {
            "sqlite::memory:".to_string()
        } else if url.starts_with("sqlite:") {
            url.to_string()
        } else {
            format!("sqlite:{url}")
        };

        let options = SqliteConnectOptions::from_str(&conn_str)
            .map_err(|e| EngineError::connection_failed(format!("Invalid SQLite URL: {e}")))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));
        Ok(options)
    }

    fn convert_row(row: &SqliteRow) -> QRow {
        QRow {
            values: (0..row.columns().len())
                .map(|idx| Self::extract_value(row, idx))
                .collect(),
        }
    }

    fn extract_value(row: &SqliteRow, idx: usize) -> Value {
        // SQLite stores booleans as integers; only the declared type tells them apart
        let declared_bool = row
            .columns()
            .get(idx)
            .is_some_and(|c| c.type_info().name().eq_ignore_ascii_case("BOOLEAN"));
        if declared_bool {
            if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
                return v.map(Value::Bool).unwrap_or(Value::Null);
            }
        }
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(|b| Value::Text(hex_encode(&b))).unwrap_or(Value::Null);
        }

        Value::Null
    }

    async fn fetch(conn: &mut PoolConnection<Sqlite>, statement: &str) -> EngineResult<ResultSet> {
        let rows: Vec<SqliteRow> = sqlx::query(statement)
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
impl RelationalBackend for SqliteBackend {
    fn driver_id(&self) -> &'static str {
        "sqlite"
    }

    #[instrument(skip(self, statement), fields(driver = "sqlite"))]
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

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend() -> (tempfile::TempDir, SqliteBackend) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.db");
        let backend = SqliteBackend::connect(path.to_str().unwrap(), 2).await.unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn multi_statement_returns_last_result() {
        let (_dir, backend) = backend().await;
        let rs = backend
            .execute(
                "CREATE TABLE users (id INTEGER, name TEXT);\
                 INSERT INTO users VALUES (1, 'ada'), (2, 'bob');\
                 SELECT id, name FROM users ORDER BY id",
            )
            .await
            .unwrap();
        assert_eq!(rs.columns, vec!["id", "name"]);
        assert_eq!(rs.rows.len(), 2);
        assert_eq!(rs.get(1, "name"), Some(&Value::Text("bob".into())));
    }

    #[tokio::test]
    async fn empty_result_keeps_columns() {
        let (_dir, backend) = backend().await;
        backend
            .execute("CREATE TABLE t (a INTEGER, b TEXT)")
            .await
            .unwrap();
        let rs = backend.execute("SELECT a, b FROM t").await.unwrap();
        assert_eq!(rs.columns, vec!["a", "b"]);
        assert!(rs.rows.is_empty());
    }

    #[tokio::test]
    async fn statements_without_rows_return_empty() {
        let (_dir, backend) = backend().await;
        let rs = backend.execute("CREATE TABLE t (a INTEGER)").await.unwrap();
        assert!(rs.columns.is_empty());
    }

    #[tokio::test]
    async fn errors_are_reported() {
        let (_dir, backend) = backend().await;
        let err = backend.execute("SELECT * FROM missing").await.unwrap_err();
        assert!(matches!(err, EngineError::ExecutionError { .. }));
    }
}
