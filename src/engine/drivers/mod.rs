// SPDX-License-Identifier: Apache-2.0

// Source drivers module

pub mod http_tool;
pub mod mysql;
pub mod postgres;
pub mod scratch;
pub mod sqlite;

/// Splits statement text on `;`, ignoring semicolons inside quotes and comments.
///
/// Empty statements are dropped and each statement is trimmed.
pub fn split_statements(sql: &str) -> Vec<String> {
    #[derive(PartialEq)]
    enum State {
        Normal,
        Single,
        Double,
        Backtick,
        LineComment,
        BlockComment,
    }

    let mut statements = Vec::new();
    let mut current = String::new();
    let mut state = State::Normal;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Normal => match c {
                ';' => {
                    let stmt = current.trim();
                    if !stmt.is_empty() {
                        statements.push(stmt.to_string());
                    }
                    current.clear();
                    continue;
                }
                '\'' => state = State::Single,
                '"' => state = State::Double,
                '`' => state = State::Backtick,
                '-' if chars.peek() == Some(&'-') => state = State::LineComment,
                '/' if chars.peek() == Some(&'*') => state = State::BlockComment,
                _ => {}
            },
            State::Single if c == '\'' => state = State::Normal,
            State::Double if c == '"' => state = State::Normal,
            State::Backtick if c == '`' => state = State::Normal,
            State::LineComment if c == '\n' => state = State::Normal,
            State::BlockComment if c == '*' && chars.peek() == Some(&'/') => {
                current.push(c);
                if let Some(slash) = chars.next() {
                    current.push(slash);
                }
                state = State::Normal;
                continue;
            }
            _ => {}
        }
        current.push(c);
    }

    let stmt = current.trim();
    if !stmt.is_empty() {
        statements.push(stmt.to_string());
    }
    statements
}

/// Strips leading whitespace, comments and opening parentheses.
fn skip_preamble(sql: &str) -> &str {
    let mut rest = sql;
    loop {
        let trimmed = rest.trim_start().trim_start_matches('(');
        if let Some(after) = trimmed.strip_prefix("--") {
            rest = after.split_once('\n').map_or("", |(_, tail)| tail);
        } else if let Some(after) = trimmed.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, tail)| tail);
        } else {
            return trimmed;
        }
    }
}

/// Whether a single statement produces a result set.
pub fn returns_rows(statement: &str) -> bool {
    let body = skip_preamble(statement);
    let keyword: String = body
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();

    match keyword.as_str() {
        "SELECT" | "WITH" | "VALUES" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" | "PRAGMA"
        | "TABLE" | "FROM" => true,
        "INSERT" | "UPDATE" | "DELETE" => body.to_ascii_uppercase().contains("RETURNING"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_top_level_semicolons() {
        let parts = split_statements(
            "CREATE TABLE t (a TEXT); INSERT INTO t VALUES ('x;y'); -- done; really\nSELECT * FROM t;",
        );
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1], "INSERT INTO t VALUES ('x;y')");
        assert!(parts[2].ends_with("SELECT * FROM t"));
    }

    #[test]
    fn block_comments_hide_semicolons() {
        let parts = split_statements("/* a; b */ SELECT 1");
        assert_eq!(parts, vec!["/* a; b */ SELECT 1"]);
    }

    #[test]
    fn classifies_row_returning_statements() {
        assert!(returns_rows("  select 1"));
        assert!(returns_rows("-- note\nWITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(returns_rows("(SELECT 1) UNION (SELECT 2)"));
        assert!(returns_rows("INSERT INTO t VALUES (1) RETURNING id"));
        assert!(!returns_rows("INSERT INTO t VALUES (1)"));
        assert!(!returns_rows("CREATE TABLE t (a INT)"));
    }
}
