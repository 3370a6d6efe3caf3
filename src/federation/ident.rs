// SPDX-License-Identifier: Apache-2.0

//! Identifier guard for scratch-store table and column names.
//!
//! Table names are built from plan aliases and session ids, so they are
//! checked against an allow-list before they are spliced into DDL. Column
//! names come from source results and are always quoted instead.

use std::sync::OnceLock;

use regex::Regex;

use crate::engine::error::{EngineError, EngineResult};

/// Upper bound for plan aliases. Table names built by the engine from
/// session ids are not bounded.
pub const MAX_ALIAS_LEN: usize = 63;

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex"))
}

/// Checks a plan alias: a safe identifier of at most [`MAX_ALIAS_LEN`] characters.
pub fn validate_identifier(value: &str) -> EngineResult<()> {
    if value.len() > MAX_ALIAS_LEN {
        return Err(EngineError::invalid_identifier(
            value,
            format!("longer than {MAX_ALIAS_LEN} characters"),
        ));
    }
    validate_table_name(value)
}

/// Checks a scratch table name against the safe identifier set.
pub fn validate_table_name(value: &str) -> EngineResult<()> {
    if value.is_empty() {
        return Err(EngineError::invalid_identifier(value, "empty identifier"));
    }
    if !identifier_regex().is_match(value) {
        return Err(EngineError::invalid_identifier(
            value,
            "only letters, digits and underscores are allowed, and it must not start with a digit",
        ));
    }
    Ok(())
}

/// Replaces every non-alphanumeric character of a session id with `_`.
pub fn sanitize_session_id(session_id: &str) -> EngineResult<String> {
    if session_id.is_empty() {
        return Err(EngineError::invalid_identifier(session_id, "empty session id"));
    }
    Ok(session_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect())
}

/// Double-quotes an identifier, escaping embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_identifiers() {
        assert!(validate_identifier("temp_orders").is_ok());
        assert!(validate_identifier("_x1").is_ok());
    }

    #[test]
    fn rejects_unsafe_identifiers() {
        for bad in ["", "1abc", "a-b", "users; DROP TABLE x", "naïve", &"a".repeat(64)] {
            assert!(
                matches!(validate_identifier(bad), Err(EngineError::InvalidIdentifier { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn table_names_have_no_length_bound() {
        let long = format!("session_{}_interaction_1", "e3b0c442".repeat(8));
        assert!(validate_table_name(&long).is_ok());
        assert!(validate_identifier(&long).is_err());
        assert!(validate_table_name("bad-name").is_err());
        assert!(validate_table_name("").is_err());
    }

    #[test]
    fn sanitizes_session_ids() {
        assert_eq!(sanitize_session_id("abc-123").unwrap(), "abc_123");
        assert_eq!(sanitize_session_id("a.b c").unwrap(), "a_b_c");
        assert!(sanitize_session_id("").is_err());
    }

    #[test]
    fn quotes_embedded_quotes() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
