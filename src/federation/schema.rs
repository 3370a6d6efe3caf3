// SPDX-License-Identifier: Apache-2.0

//! Column type inference for staged result sets.
//!
//! Each column is classified by its first non-null value. A column with no
//! non-null values (including any column of an empty result) is TEXT, since
//! TEXT accepts anything a later load might bring.
//!
//! [`storage_schema`] widens that classification so every value of the result
//! fits the stored column: integers mixed with floats are stored as FLOAT, any
//! other mix as TEXT.

use serde::{Deserialize, Serialize};

use crate::engine::types::{ResultSet, Value};

/// Closed type lattice for scratch-store columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    Null,
    Integer,
    Float,
    Boolean,
    Text,
}

impl ColumnType {
    /// Classifies a single value.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ColumnType::Null,
            // Bool is matched on its own variant, never through an integer view.
            Value::Bool(_) => ColumnType::Boolean,
            Value::Int(_) => ColumnType::Integer,
            Value::Float(_) => ColumnType::Float,
            Value::Text(_) => ColumnType::Text,
        }
    }

    /// Smallest type that holds values of both `self` and `other`.
    pub fn widen(self, other: ColumnType) -> Self {
        match (self, other) {
            (a, b) if a == b => a,
            (ColumnType::Null, b) => b,
            (a, ColumnType::Null) => a,
            (ColumnType::Integer, ColumnType::Float) | (ColumnType::Float, ColumnType::Integer) => {
                ColumnType::Float
            }
            _ => ColumnType::Text,
        }
    }

    /// DuckDB column type used when the scratch table is created.
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Integer => "BIGINT",
            ColumnType::Float => "DOUBLE",
            ColumnType::Null | ColumnType::Text => "VARCHAR",
        }
    }

    /// Maps a DuckDB `data_type` back onto the lattice.
    pub fn from_sql_type(data_type: &str) -> Self {
        let upper = data_type.trim().to_ascii_uppercase();
        match upper.as_str() {
            "BOOLEAN" | "BOOL" => ColumnType::Boolean,
            "TINYINT" | "SMALLINT" | "INTEGER" | "INT" | "BIGINT" | "HUGEINT" | "UTINYINT"
            | "USMALLINT" | "UINTEGER" | "UBIGINT" => ColumnType::Integer,
            "FLOAT" | "REAL" | "DOUBLE" => ColumnType::Float,
            _ if upper.starts_with("DECIMAL") || upper.starts_with("NUMERIC") => ColumnType::Float,
            _ => ColumnType::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaColumn {
    pub name: String,
    pub column_type: ColumnType,
}

/// Ordered `column → type` mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferredSchema {
    pub columns: Vec<SchemaColumn>,
}

impl InferredSchema {
    pub fn new(columns: Vec<SchemaColumn>) -> Self {
        Self { columns }
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn type_of(&self, column: &str) -> Option<ColumnType> {
        self.columns
            .iter()
            .find(|c| c.name == column)
            .map(|c| c.column_type)
    }
}

/// Infers the scratch-table schema of a result set.
pub fn infer(result: &ResultSet) -> InferredSchema {
    let columns = result
        .columns
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            let column_type = result
                .rows
                .iter()
                .filter_map(|row| row.values.get(idx))
                .find(|v| !v.is_null())
                .map(ColumnType::of)
                .unwrap_or(ColumnType::Text);
            SchemaColumn {
                name: name.clone(),
                column_type,
            }
        })
        .collect();

    InferredSchema { columns }
}

/// Column types wide enough to store every value of `result`.
pub fn storage_schema(result: &ResultSet) -> InferredSchema {
    let mut schema = infer(result);
    for (idx, column) in schema.columns.iter_mut().enumerate() {
        for value in result.rows.iter().filter_map(|row| row.values.get(idx)) {
            if column.column_type == ColumnType::Text {
                break;
            }
            column.column_type = column.column_type.widen(ColumnType::of(value));
        }
    }
    schema
}

/// Like [`infer`], but reports all-null columns of a non-empty result as NULL.
///
/// Used for describing final results to the caller, where "we saw rows and
/// they were all null" is more useful than a storage type.
pub fn describe(result: &ResultSet) -> InferredSchema {
    let mut schema = infer(result);
    if result.rows.is_empty() {
        return schema;
    }
    for (idx, column) in schema.columns.iter_mut().enumerate() {
        let all_null = result
            .rows
            .iter()
            .all(|row| row.values.get(idx).map_or(true, Value::is_null));
        if all_null {
            column.column_type = ColumnType::Null;
        }
    }
    schema
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::Row;

    fn result(columns: &[&str], rows: Vec<Vec<Value>>) -> ResultSet {
        ResultSet::new(
            columns.iter().map(|c| c.to_string()).collect(),
            rows.into_iter().map(Row::new).collect(),
        )
        .unwrap()
    }

    #[test]
    fn boolean_is_not_classified_as_integer() {
        let rs = result(&["flag"], vec![vec![Value::Bool(true)], vec![Value::Bool(false)]]);
        assert_eq!(infer(&rs).type_of("flag"), Some(ColumnType::Boolean));
    }

    #[test]
    fn first_non_null_value_decides() {
        let rs = result(
            &["a", "b", "c"],
            vec![
                vec![Value::Null, Value::Float(1.5), Value::Null],
                vec![Value::Int(3), Value::Int(2), Value::Null],
            ],
        );
        let schema = infer(&rs);
        assert_eq!(schema.type_of("a"), Some(ColumnType::Integer));
        assert_eq!(schema.type_of("b"), Some(ColumnType::Float));
        assert_eq!(schema.type_of("c"), Some(ColumnType::Text));
    }

    #[test]
    fn empty_result_is_all_text() {
        let rs = ResultSet::with_columns(vec!["id".into(), "name".into()]);
        let schema = infer(&rs);
        assert_eq!(schema.names(), vec!["id", "name"]);
        assert!(schema.columns.iter().all(|c| c.column_type == ColumnType::Text));
    }

    #[test]
    fn describe_reports_null_columns() {
        let rs = result(&["x", "y"], vec![vec![Value::Null, Value::from("a")]]);
        let schema = describe(&rs);
        assert_eq!(schema.type_of("x"), Some(ColumnType::Null));
        assert_eq!(schema.type_of("y"), Some(ColumnType::Text));
    }

    #[test]
    fn mixed_columns_are_widened_for_storage() {
        let rs = result(
            &["price", "code", "flag", "same"],
            vec![
                vec![Value::Int(10), Value::Int(1), Value::Bool(true), Value::Int(1)],
                vec![Value::Float(10.5), Value::from("n/a"), Value::Int(0), Value::Null],
            ],
        );
        let stored = storage_schema(&rs);
        assert_eq!(stored.type_of("price"), Some(ColumnType::Float));
        assert_eq!(stored.type_of("code"), Some(ColumnType::Text));
        assert_eq!(stored.type_of("flag"), Some(ColumnType::Text));
        assert_eq!(stored.type_of("same"), Some(ColumnType::Integer));

        // The first-value classification itself is unchanged.
        assert_eq!(infer(&rs).type_of("price"), Some(ColumnType::Integer));
    }

    #[test]
    fn sql_types_round_trip_through_the_lattice() {
        for ty in [
            ColumnType::Boolean,
            ColumnType::Integer,
            ColumnType::Float,
            ColumnType::Text,
        ] {
            assert_eq!(ColumnType::from_sql_type(ty.sql_type()), ty);
        }
        assert_eq!(ColumnType::from_sql_type("DECIMAL(18,3)"), ColumnType::Float);
    }
}
