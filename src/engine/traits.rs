//! Source trait definitions
//!
//! These are the two seams every data source is reached through. Relational
//! backends (PostgreSQL, MySQL, SQLite and the scratch store itself) implement
//! [`RelationalBackend`]; remote tool endpoints implement [`ToolInvoker`].

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};

use crate::engine::error::EngineResult;
use crate::engine::types::ResultSet;

/// A connected relational source.
///
/// Implementations own their connection pool. Values are normalized into the
/// closed [`crate::engine::types::Value`] type before they leave the backend.
#[async_trait]
pub trait RelationalBackend: Send + Sync {
    /// Returns the driver identifier (e.g., "postgres", "mysql", "sqlite")
    fn driver_id(&self) -> &'static str;

    /// Executes a statement and returns its columns and rows
    ///
    /// A statement that yields zero rows still reports its column list.
    /// Statement text containing several `;`-separated statements runs them in
    /// order and returns the last row-returning result.
    async fn execute(&self, statement: &str) -> EngineResult<ResultSet>;

    /// Releases pooled connections
    async fn close(&self) {}
}

/// A remote tool endpoint.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Invokes `tool_name` with named arguments and returns the tool's payload
    ///
    /// The payload is returned as-is; tabular validation is the executor's job.
    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: &Map<String, JsonValue>,
    ) -> EngineResult<JsonValue>;
}
