// SPDX-License-Identifier: Apache-2.0

//! Normalized error types for the federation engine
//!
//! Driver-specific errors (sqlx, DuckDB, HTTP) are mapped to these unified
//! variants at the boundary so callers see one taxonomy regardless of which
//! source failed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all engine operations
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum EngineError {
    #[error("Unknown source: {source_id}")]
    SourceNotFound { source_id: String },

    #[error("Source '{source_id}' failed: {message}")]
    SourceExecution { source_id: String, message: String },

    #[error("Tool '{tool}' on source '{source_id}' returned a non-tabular response: {reason}")]
    NonTabularResponse {
        source_id: String,
        tool: String,
        reason: String,
    },

    #[error("Cannot create table '{table}': no columns")]
    NoColumns { table: String },

    #[error("Combination query failed: {message}")]
    CombinationQuery { message: String },

    #[error("Unknown session table: {table}")]
    UnknownSessionTable { table: String },

    #[error("Invalid identifier '{value}': {reason}")]
    InvalidIdentifier { value: String, reason: String },

    #[error("Invalid plan: {message}")]
    InvalidPlan { message: String },

    #[error("Plan execution failed: {}", join_failures(.failures))]
    PlanFailed { failures: Vec<EngineError> },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Query execution error: {message}")]
    ExecutionError { message: String },

    #[error("Scratch store error: {message}")]
    Scratch { message: String },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn join_failures(failures: &[EngineError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl EngineError {
    pub fn source_not_found(id: impl Into<String>) -> Self {
        Self::SourceNotFound { source_id: id.into() }
    }

    pub fn source_execution(id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SourceExecution {
            source_id: id.into(),
            message: msg.into(),
        }
    }

    pub fn non_tabular(
        id: impl Into<String>,
        tool: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::NonTabularResponse {
            source_id: id.into(),
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    pub fn no_columns(table: impl Into<String>) -> Self {
        Self::NoColumns { table: table.into() }
    }

    pub fn combination(msg: impl Into<String>) -> Self {
        Self::CombinationQuery { message: msg.into() }
    }

    pub fn unknown_session_table(table: impl Into<String>) -> Self {
        Self::UnknownSessionTable { table: table.into() }
    }

    pub fn invalid_identifier(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidIdentifier {
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_plan(msg: impl Into<String>) -> Self {
        Self::InvalidPlan { message: msg.into() }
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed { message: msg.into() }
    }

    pub fn execution_error(msg: impl Into<String>) -> Self {
        Self::ExecutionError { message: msg.into() }
    }

    pub fn scratch(msg: impl Into<String>) -> Self {
        Self::Scratch { message: msg.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config { message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal { message: msg.into() }
    }

    /// Attributes an error to the source that produced it.
    ///
    /// Errors that already carry a source id are returned unchanged; anything
    /// else (driver, transport, timeout) is wrapped as `SourceExecution`.
    pub fn for_source(self, source_id: &str) -> Self {
        match self {
            Self::SourceNotFound { .. }
            | Self::SourceExecution { .. }
            | Self::NonTabularResponse { .. } => self,
            other => Self::source_execution(source_id, other.to_string()),
        }
    }

    /// True for failures raised by a single source call, as opposed to
    /// scratch-store or plan-level failures.
    pub fn is_source_failure(&self) -> bool {
        matches!(
            self,
            Self::SourceNotFound { .. }
                | Self::SourceExecution { .. }
                | Self::NonTabularResponse { .. }
        )
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_source_wraps_driver_errors() {
        let err = EngineError::execution_error("relation \"users\" does not exist")
            .for_source("prod_pg");
        match err {
            EngineError::SourceExecution { source_id, message } => {
                assert_eq!(source_id, "prod_pg");
                assert!(message.contains("does not exist"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn for_source_keeps_attributed_errors() {
        let err = EngineError::non_tabular("crm", "list_contacts", "not an array").for_source("other");
        assert!(matches!(
            err,
            EngineError::NonTabularResponse { ref source_id, .. } if source_id == "crm"
        ));
    }

    #[test]
    fn plan_failed_lists_every_failure() {
        let err = EngineError::PlanFailed {
            failures: vec![
                EngineError::source_not_found("missing"),
                EngineError::source_execution("crm", "HTTP 502"),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("Unknown source: missing"));
        assert!(text.contains("Source 'crm' failed: HTTP 502"));
    }
}
