// SPDX-License-Identifier: Apache-2.0

//! Read-only guard for combination SQL.
//!
//! Combination statements come from the plan producer and run against the
//! scratch store, so they must be a single SELECT-like query that only reads
//! staged tables. The scratch connection is also opened with external access
//! disabled; this check rejects the obvious cases early with a clear error.

use std::sync::OnceLock;

use regex::Regex;
use sqlparser::ast::Statement;
use sqlparser::dialect::DuckDbDialect;
use sqlparser::parser::Parser;

use crate::engine::error::{EngineError, EngineResult};

fn file_function_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(read_csv(_auto)?|read_parquet|parquet_scan|read_json(_auto|_objects)?|read_ndjson(_auto|_objects)?|read_text|read_blob|glob|sniff_csv|getenv|query_table)\s*\(",
        )
        .expect("file function regex")
    })
}

/// Validates that `sql` is exactly one read-only query.
pub fn check_combination_sql(sql: &str) -> EngineResult<()> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err(EngineError::combination("combination query is empty"));
    }

    let statements = Parser::parse_sql(&DuckDbDialect {}, trimmed)
        .map_err(|e| EngineError::combination(format!("Failed to parse combination query: {e}")))?;

    if statements.len() != 1 {
        return Err(EngineError::combination(
            "Combination queries must be a single statement",
        ));
    }

    if !matches!(statements[0], Statement::Query(_)) {
        return Err(EngineError::combination(
            "Combination queries must be SELECT statements",
        ));
    }

    if let Some(m) = file_function_regex().find(trimmed) {
        return Err(EngineError::combination(format!(
            "Combination queries may only read staged tables (found '{}')",
            m.as_str().trim_end_matches('(').trim()
        )));
    }

    Ok(())
}
