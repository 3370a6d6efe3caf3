// SPDX-License-Identifier: Apache-2.0

//! On-disk DuckDB scratch store.
//!
//! Every source result of a plan is staged here as a real table so the
//! combination query (and later plans, through the `__session__` source) can
//! read it with plain SQL. The store is ephemeral: a stale file left by a
//! previous process is removed on open, and [`ScratchStore::drop_all`] deletes
//! the file instead of truncating it.
//!
//! ## Concurrency Model
//!
//! The `duckdb` crate is synchronous and `Connection` is `!Sync`, so the
//! connection lives behind a mutex and every operation is serialized. Async
//! callers go through [`ScratchStore::blocking`], which runs the closure on
//! `spawn_blocking`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate};
use duckdb::types::{TimeUnit, Value as DuckValue};
use duckdb::{params_from_iter, Config, Connection};
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use tracing::{debug, info, warn};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{hex_encode, ResultSet, Row, Value};
use crate::federation::ident::{quote_ident, sanitize_session_id, validate_table_name};
use crate::federation::schema::{self, ColumnType, InferredSchema, SchemaColumn};
use crate::federation::types::ScratchTable;

/// Default number of rows per insert transaction.
pub const DEFAULT_INSERT_BATCH_SIZE: usize = 1000;

/// Days between 0001-01-01 (CE day 1) and the Unix epoch.
const UNIX_EPOCH_CE_DAYS: i32 = 719_163;

pub struct ScratchStore {
    path: PathBuf,
    batch_size: usize,
    conn: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for ScratchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchStore")
            .field("path", &self.path)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl ScratchStore {
    /// Opens a fresh scratch store at `path`.
    ///
    /// Whatever a previous process left at `path` is discarded first.
    pub fn open(path: impl Into<PathBuf>, batch_size: usize) -> EngineResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    EngineError::scratch(format!(
                        "Failed to create scratch directory '{}': {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        remove_store_files(&path)?;

        let conn = open_connection(&path)?;
        info!(path = %path.display(), "Scratch store opened");

        Ok(Self {
            path,
            batch_size: batch_size.max(1),
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs a synchronous closure on this store inside `spawn_blocking`.
    pub async fn blocking<F, R>(self: &Arc<Self>, f: F) -> EngineResult<R>
    where
        F: FnOnce(&ScratchStore) -> EngineResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| EngineError::internal(format!("Scratch store task panicked: {e}")))?
    }

    /// Runs `f` on the connection, reopening an empty store after `drop_all`.
    fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> EngineResult<R>) -> EngineResult<R> {
        let mut guard = self.conn.lock();
        if guard.is_none() {
            *guard = Some(open_connection(&self.path)?);
            debug!(path = %self.path.display(), "Scratch store reopened");
        }
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(EngineError::internal("Scratch connection unavailable")),
        }
    }

    /// Creates (or replaces) a table with the given schema.
    pub fn create_table(&self, name: &str, schema: &InferredSchema) -> EngineResult<()> {
        validate_table_name(name)?;
        if schema.is_empty() {
            return Err(EngineError::no_columns(name));
        }
        self.with_conn(|conn| create_table_on(conn, name, schema))
    }

    /// Loads rows into an existing table, coercing each value to the column's
    /// stored type. Returns the number of rows inserted.
    pub fn bulk_load(&self, name: &str, result: &ResultSet) -> EngineResult<u64> {
        validate_table_name(name)?;
        if result.rows.is_empty() {
            return Ok(0);
        }
        self.with_conn(|conn| {
            let stored = table_schema_on(conn, name)?
                .ok_or_else(|| EngineError::scratch(format!("Unknown scratch table '{name}'")))?;
            let columns = result
                .columns
                .iter()
                .map(|c| {
                    stored.type_of(c).map(|ty| SchemaColumn {
                        name: c.clone(),
                        column_type: ty,
                    })
                    .ok_or_else(|| {
                        EngineError::scratch(format!("Table '{name}' has no column '{c}'"))
                    })
                })
                .collect::<EngineResult<Vec<_>>>()?;
            insert_rows_on(conn, name, &InferredSchema::new(columns), &result.rows, self.batch_size)
        })
    }

    /// Infers a schema for `result`, creates table `name` and loads every row.
    ///
    /// Columns holding more than one kind of value are widened (see
    /// [`schema::storage_schema`]) so the load never rejects a row.
    pub fn materialize(
        &self,
        name: &str,
        source_alias: &str,
        result: &ResultSet,
    ) -> EngineResult<ScratchTable> {
        validate_table_name(name)?;
        if result.columns.is_empty() {
            return Err(EngineError::no_columns(name));
        }

        let start = Instant::now();
        let mut schema = schema::storage_schema(result);
        dedupe_column_names(&mut schema);

        let row_count = self.with_conn(|conn| {
            create_table_on(conn, name, &schema)?;
            insert_rows_on(conn, name, &schema, &result.rows, self.batch_size)
        })?;

        debug!(
            table = name,
            alias = source_alias,
            rows = row_count,
            columns = schema.len(),
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Materialized scratch table"
        );

        Ok(ScratchTable {
            name: name.to_string(),
            schema,
            source_alias: source_alias.to_string(),
            row_count,
        })
    }

    /// Executes a read statement and returns its columns and rows.
    pub fn query(&self, sql: &str) -> EngineResult<ResultSet> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(sql)
                .map_err(|e| EngineError::execution_error(e.to_string()))?;

            // column_count/column_name are only valid once the statement ran,
            // so the width comes from each row and the names are read after.
            let rows_iter = stmt
                .query_map([], |row| {
                    let width = row.as_ref().column_count();
                    let values = (0..width)
                        .map(|i| row.get::<_, DuckValue>(i).map(from_duckdb))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(Row { values })
                })
                .map_err(|e| EngineError::execution_error(e.to_string()))?;

            let mut rows = Vec::new();
            for row in rows_iter {
                rows.push(row.map_err(|e| EngineError::execution_error(e.to_string()))?);
            }

            let columns = (0..stmt.column_count())
                .map(|i| {
                    stmt.column_name(i)
                        .map(|s| s.to_string())
                        .unwrap_or_else(|_| format!("col_{i}"))
                })
                .collect();

            ResultSet::new(columns, rows)
        })
    }

    /// Names of every table in the store, sorted.
    pub fn list_tables(&self) -> EngineResult<Vec<String>> {
        self.with_conn(list_tables_on)
    }

    pub fn table_exists(&self, name: &str) -> EngineResult<bool> {
        Ok(self.list_tables()?.iter().any(|t| t == name))
    }

    /// Stored schema of a table, read back from `information_schema`.
    pub fn table_schema(&self, name: &str) -> EngineResult<InferredSchema> {
        self.with_conn(|conn| table_schema_on(conn, name))?
            .ok_or_else(|| EngineError::scratch(format!("Unknown scratch table '{name}'")))
    }

    pub fn row_count(&self, name: &str) -> EngineResult<u64> {
        validate_table_name(name)?;
        self.with_conn(|conn| {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", quote_ident(name)), [], |row| {
                    row.get(0)
                })
                .map_err(|e| EngineError::scratch(format!("Failed to count '{name}': {e}")))?;
            Ok(count.max(0) as u64)
        })
    }

    /// Drops a table. Returns whether it existed.
    pub fn drop_table(&self, name: &str) -> EngineResult<bool> {
        validate_table_name(name)?;
        self.with_conn(|conn| {
            let existed = list_tables_on(conn)?.iter().any(|t| t == name);
            if existed {
                conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)))
                    .map_err(|e| EngineError::scratch(format!("Failed to drop '{name}': {e}")))?;
            }
            Ok(existed)
        })
    }

    /// Drops every table whose name starts with `prefix`. Returns the count.
    pub fn drop_with_prefix(&self, prefix: &str) -> EngineResult<usize> {
        self.with_conn(|conn| {
            let doomed: Vec<String> = list_tables_on(conn)?
                .into_iter()
                .filter(|t| t.starts_with(prefix))
                .collect();
            if doomed.is_empty() {
                return Ok(0);
            }
            let sql = doomed
                .iter()
                .map(|t| format!("DROP TABLE IF EXISTS {};", quote_ident(t)))
                .collect::<Vec<_>>()
                .join("\n");
            conn.execute_batch(&sql)
                .map_err(|e| EngineError::scratch(format!("Failed to drop tables: {e}")))?;
            Ok(doomed.len())
        })
    }

    /// Drops every session table of `session_id`. Returns the count.
    pub fn drop_by_session_prefix(&self, session_id: &str) -> EngineResult<usize> {
        let prefix = session_table_prefix(session_id)?;
        self.drop_with_prefix(&prefix)
    }

    /// Closes the connection and deletes the backing file.
    ///
    /// The store stays usable; the next operation starts from an empty file.
    pub fn drop_all(&self) -> EngineResult<()> {
        let mut guard = self.conn.lock();
        // Dropping the connection closes the database before the unlink.
        drop(guard.take());
        remove_store_files(&self.path)?;
        info!(path = %self.path.display(), "Scratch store discarded");
        Ok(())
    }
}

/// Name prefix shared by every session table of `session_id`.
pub fn session_table_prefix(session_id: &str) -> EngineResult<String> {
    Ok(format!("session_{}_interaction_", sanitize_session_id(session_id)?))
}

fn open_connection(path: &Path) -> EngineResult<Connection> {
    let config = Config::default()
        .enable_external_access(false)
        .map_err(|e| EngineError::scratch(format!("Invalid scratch store config: {e}")))?;
    Connection::open_with_flags(path, config).map_err(|e| {
        EngineError::scratch(format!(
            "Failed to open scratch store '{}': {e}",
            path.display()
        ))
    })
}

fn remove_store_files(path: &Path) -> EngineResult<()> {
    let mut wal = path.as_os_str().to_owned();
    wal.push(".wal");
    for file in [path.to_path_buf(), PathBuf::from(wal)] {
        match std::fs::remove_file(&file) {
            Ok(()) => debug!(file = %file.display(), "Removed scratch file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(EngineError::scratch(format!(
                    "Failed to delete '{}': {e}",
                    file.display()
                )))
            }
        }
    }
    Ok(())
}

fn create_table_on(conn: &Connection, name: &str, schema: &InferredSchema) -> EngineResult<()> {
    if schema.is_empty() {
        return Err(EngineError::no_columns(name));
    }
    let col_defs: Vec<String> = schema
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.column_type.sql_type()))
        .collect();
    let table = quote_ident(name);
    let sql = format!(
        "DROP TABLE IF EXISTS {table};\nCREATE TABLE {table} ({});",
        col_defs.join(", ")
    );
    conn.execute_batch(&sql)
        .map_err(|e| EngineError::scratch(format!("Failed to create table '{name}': {e}")))
}

fn insert_rows_on(
    conn: &Connection,
    name: &str,
    schema: &InferredSchema,
    rows: &[Row],
    batch_size: usize,
) -> EngineResult<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let column_list: Vec<String> = schema.columns.iter().map(|c| quote_ident(&c.name)).collect();
    let placeholders: Vec<String> = (1..=schema.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(name),
        column_list.join(", "),
        placeholders.join(", ")
    );

    let mut inserted = 0u64;
    for chunk in rows.chunks(batch_size.max(1)) {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| EngineError::scratch(format!("Scratch transaction failed: {e}")))?;
        {
            let mut stmt = tx
                .prepare_cached(&sql)
                .map_err(|e| EngineError::scratch(format!("Scratch prepare failed: {e}")))?;

            for row in chunk {
                if row.values.len() != schema.len() {
                    return Err(EngineError::scratch(format!(
                        "Row has {} values but '{name}' has {} columns",
                        row.values.len(),
                        schema.len()
                    )));
                }
                let params = row
                    .values
                    .iter()
                    .zip(&schema.columns)
                    .map(|(value, column)| coerce(value, column))
                    .collect::<EngineResult<Vec<DuckValue>>>()?;
                stmt.execute(params_from_iter(params.iter()))
                    .map_err(|e| EngineError::scratch(format!("Insert into '{name}' failed: {e}")))?;
                inserted += 1;
            }
        }
        tx.commit()
            .map_err(|e| EngineError::scratch(format!("Scratch commit failed: {e}")))?;
    }
    Ok(inserted)
}

fn list_tables_on(conn: &Connection) -> EngineResult<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = 'main' ORDER BY table_name",
        )
        .map_err(|e| EngineError::scratch(e.to_string()))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| EngineError::scratch(e.to_string()))?;
    names
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| EngineError::scratch(e.to_string()))
}

fn table_schema_on(conn: &Connection, name: &str) -> EngineResult<Option<InferredSchema>> {
    let mut stmt = conn
        .prepare(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_schema = 'main' AND table_name = ?1 \
             ORDER BY ordinal_position",
        )
        .map_err(|e| EngineError::scratch(e.to_string()))?;
    let rows = stmt
        .query_map([name], |row| {
            let column: String = row.get(0)?;
            let data_type: String = row.get(1)?;
            Ok(SchemaColumn {
                name: column,
                column_type: ColumnType::from_sql_type(&data_type),
            })
        })
        .map_err(|e| EngineError::scratch(e.to_string()))?;
    let columns = rows
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| EngineError::scratch(e.to_string()))?;

    Ok((!columns.is_empty()).then(|| InferredSchema::new(columns)))
}

/// Renames repeated column names (`id`, `id` → `id`, `id_2`).
fn dedupe_column_names(schema: &mut InferredSchema) {
    let mut seen: Vec<String> = Vec::with_capacity(schema.len());
    for column in &mut schema.columns {
        if seen.iter().any(|s| s.eq_ignore_ascii_case(&column.name)) {
            let base = column.name.clone();
            let mut n = 2;
            while seen
                .iter()
                .any(|s| s.eq_ignore_ascii_case(&format!("{base}_{n}")))
            {
                n += 1;
            }
            column.name = format!("{base}_{n}");
            warn!(column = %base, renamed = %column.name, "Duplicate column renamed");
        }
        seen.push(column.name.clone());
    }
}

/// Converts a value for a column of the given stored type.
///
/// Only lossless conversions are allowed; anything else fails the load.
fn coerce(value: &Value, column: &SchemaColumn) -> EngineResult<DuckValue> {
    let mismatch = || {
        EngineError::scratch(format!(
            "Cannot store {} value '{value}' in {} column '{}'",
            value.kind(),
            column.column_type.sql_type(),
            column.name
        ))
    };

    let converted = match (column.column_type, value) {
        (_, Value::Null) => DuckValue::Null,
        (ColumnType::Null | ColumnType::Text, v) => DuckValue::Text(v.to_string()),

        (ColumnType::Integer, Value::Int(i)) => DuckValue::BigInt(*i),
        (ColumnType::Integer, Value::Bool(b)) => DuckValue::BigInt(i64::from(*b)),
        (ColumnType::Integer, Value::Float(f))
            if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 =>
        {
            DuckValue::BigInt(*f as i64)
        }
        (ColumnType::Integer, Value::Text(s)) => {
            DuckValue::BigInt(s.trim().parse().map_err(|_| mismatch())?)
        }

        (ColumnType::Float, Value::Float(f)) => DuckValue::Double(*f),
        (ColumnType::Float, Value::Int(i)) => DuckValue::Double(*i as f64),
        (ColumnType::Float, Value::Text(s)) => {
            DuckValue::Double(s.trim().parse().map_err(|_| mismatch())?)
        }

        (ColumnType::Boolean, Value::Bool(b)) => DuckValue::Boolean(*b),
        (ColumnType::Boolean, Value::Int(0)) => DuckValue::Boolean(false),
        (ColumnType::Boolean, Value::Int(1)) => DuckValue::Boolean(true),
        (ColumnType::Boolean, Value::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => DuckValue::Boolean(true),
            "false" => DuckValue::Boolean(false),
            _ => return Err(mismatch()),
        },

        _ => return Err(mismatch()),
    };
    Ok(converted)
}

/// Normalizes a DuckDB value into the closed [`Value`] type.
pub(crate) fn from_duckdb(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(i) => Value::Int(i64::from(i)),
        DuckValue::SmallInt(i) => Value::Int(i64::from(i)),
        DuckValue::Int(i) => Value::Int(i64::from(i)),
        DuckValue::BigInt(i) => Value::Int(i),
        DuckValue::HugeInt(i) => i64::try_from(i)
            .map(Value::Int)
            .unwrap_or(Value::Float(i as f64)),
        DuckValue::UTinyInt(i) => Value::Int(i64::from(i)),
        DuckValue::USmallInt(i) => Value::Int(i64::from(i)),
        DuckValue::UInt(i) => Value::Int(i64::from(i)),
        DuckValue::UBigInt(i) => i64::try_from(i)
            .map(Value::Int)
            .unwrap_or(Value::Float(i as f64)),
        DuckValue::Float(f) => Value::Float(f64::from(f)),
        DuckValue::Double(f) => Value::Float(f),
        DuckValue::Decimal(d) => d
            .to_f64()
            .map(Value::Float)
            .unwrap_or_else(|| Value::Text(d.to_string())),
        DuckValue::Text(s) | DuckValue::Enum(s) => Value::Text(s),
        DuckValue::Blob(b) => Value::Text(hex_encode(&b)),
        DuckValue::Date32(days) => NaiveDate::from_num_days_from_ce_opt(UNIX_EPOCH_CE_DAYS + days)
            .map(|d| Value::Text(d.to_string()))
            .unwrap_or(Value::Int(i64::from(days))),
        DuckValue::Timestamp(unit, raw) => {
            let micros = match unit {
                TimeUnit::Second => raw.saturating_mul(1_000_000),
                TimeUnit::Millisecond => raw.saturating_mul(1_000),
                TimeUnit::Microsecond => raw,
                TimeUnit::Nanosecond => raw / 1_000,
            };
            DateTime::from_timestamp_micros(micros)
                .map(|ts| Value::Text(ts.naive_utc().format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
                .unwrap_or(Value::Int(raw))
        }
        other => Value::Text(format!("{other:?}")),
    }
}
