// SPDX-License-Identifier: Apache-2.0

//! Session-scoped result tables.
//!
//! A conversation keeps its earlier outputs in the scratch store as
//! `session_{sanitized_session_id}_interaction_{seq}` so follow-up plans can
//! read them through the `__session__` source instead of re-hitting origins.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::ResultSet;
use crate::federation::ident::quote_ident;
use crate::federation::schema::InferredSchema;
use crate::federation::scratch::{session_table_prefix, ScratchStore};
use crate::federation::types::QueryPlan;

/// Schema and size of a session table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionTableInfo {
    pub name: String,
    pub schema: InferredSchema,
    pub row_count: u64,
}

/// Table name for interaction `seq` of `session_id`.
pub fn session_table_name(session_id: &str, seq: u32) -> EngineResult<String> {
    Ok(format!("{}{seq}", session_table_prefix(session_id)?))
}

/// Whether a finished plan's result is worth keeping as a session table.
///
/// True when the plan reached an origin source or combined several results;
/// a plain re-read of an existing session table is not persisted again.
pub fn should_persist(plan: &QueryPlan) -> bool {
    plan.touches_origin() || plan.needs_combination
}

#[derive(Debug, Clone)]
pub struct SessionTables {
    store: Arc<ScratchStore>,
}

impl SessionTables {
    pub fn new(store: Arc<ScratchStore>) -> Self {
        Self { store }
    }

    /// Persists `result` as interaction `seq` of `session_id`, replacing any
    /// table of the same name. Returns the table name.
    #[instrument(skip(self, result), fields(rows = result.rows.len()))]
    pub async fn create(
        &self,
        session_id: &str,
        seq: u32,
        result: &ResultSet,
    ) -> EngineResult<String> {
        let name = session_table_name(session_id, seq)?;
        if result.columns.is_empty() {
            return Err(EngineError::no_columns(name));
        }

        let result = result.clone();
        let table = name.clone();
        let staged = self
            .store
            .blocking(move |store| store.materialize(&table, &table, &result))
            .await?;

        info!(table = %name, rows = staged.row_count, "Session table created");
        Ok(name)
    }

    /// Session tables of `session_id`, sorted by name.
    pub async fn list_for_session(&self, session_id: &str) -> EngineResult<Vec<String>> {
        let prefix = session_table_prefix(session_id)?;
        let mut tables: Vec<String> = self
            .store
            .blocking(|store| store.list_tables())
            .await?
            .into_iter()
            .filter(|t| t.starts_with(&prefix))
            .collect();
        tables.sort();
        Ok(tables)
    }

    pub async fn schema_of(&self, table: &str) -> EngineResult<InferredSchema> {
        self.ensure_session_table(table).await?;
        let name = table.to_string();
        self.store
            .blocking(move |store| store.table_schema(&name))
            .await
    }

    pub async fn describe(&self, table: &str) -> EngineResult<SessionTableInfo> {
        self.ensure_session_table(table).await?;
        let name = table.to_string();
        self.store
            .blocking(move |store| {
                Ok(SessionTableInfo {
                    schema: store.table_schema(&name)?,
                    row_count: store.row_count(&name)?,
                    name,
                })
            })
            .await
    }

    /// Reads rows of a session table, optionally paged.
    pub async fn query(
        &self,
        table: &str,
        limit: Option<u64>,
        offset: u64,
    ) -> EngineResult<ResultSet> {
        self.ensure_session_table(table).await?;

        let mut sql = format!("SELECT * FROM {}", quote_ident(table));
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if offset > 0 {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        debug!(table, ?limit, offset, "Reading session table");
        self.store.blocking(move |store| store.query(&sql)).await
    }

    /// Drops every table of `session_id`. Returns how many were dropped.
    #[instrument(skip(self))]
    pub async fn drop_for_session(&self, session_id: &str) -> EngineResult<usize> {
        let session_id = session_id.to_string();
        let dropped = self
            .store
            .blocking(move |store| store.drop_by_session_prefix(&session_id))
            .await?;
        info!(dropped, "Session tables dropped");
        Ok(dropped)
    }

    async fn ensure_session_table(&self, table: &str) -> EngineResult<()> {
        if !table.starts_with("session_") || !table.contains("_interaction_") {
            return Err(EngineError::unknown_session_table(table));
        }
        let name = table.to_string();
        let exists = self
            .store
            .blocking(move |store| store.table_exists(&name))
            .await?;
        if exists {
            Ok(())
        } else {
            Err(EngineError::unknown_session_table(table))
        }
    }
}
