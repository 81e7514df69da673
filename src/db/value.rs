//! Dynamic row values for replicated tables.
//!
//! Synced tables are configured at runtime, so rows travel through the
//! engine as ordered maps of column name to [`Value`] instead of typed
//! structs. The same representation is used on the wire (JSON) and when
//! binding parameters into SQLite.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::query::Query;
use sqlx::{Column, Row as _, TypeInfo, ValueRef};

/// Primary key of a replicated row. Keys minted offline are temporary
/// until the remote translates them.
pub type RowKey = i64;

/// Milliseconds since the Unix epoch, minted by the remote authority.
pub type Timestamp = i64;

/// A single column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Text(String),
}

impl Value {
    /// Interprets the value as a row key.
    ///
    /// Remote payloads are not consistent about numeric keys, they may
    /// arrive as numbers or as numeric strings.
    pub fn as_key(&self) -> Option<RowKey> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Real(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Option<i64>> for Value {
    fn from(v: Option<i64>) -> Self {
        v.map(Value::Int).unwrap_or(Value::Null)
    }
}

/// A data row: column name to value, ordered by column name.
pub type Row = BTreeMap<String, Value>;

/// Builds a [`Row`] from `(column, value)` pairs.
pub fn row<I, K, V>(pairs: I) -> Row
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Binds a dynamic value onto a sqlx query.
pub(crate) fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(Option::<i64>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Real(f) => query.bind(*f),
        Value::Text(s) => query.bind(s.clone()),
    }
}

/// Decodes one column of a SQLite row by its runtime storage class.
pub(crate) fn decode_column(row: &SqliteRow, index: usize) -> Result<Value, sqlx::Error> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let storage_class = raw.type_info().name().to_ascii_uppercase();
    let value = match storage_class.as_str() {
        "INTEGER" | "BOOLEAN" | "INT" | "BIGINT" => Value::Int(row.try_get::<i64, _>(index)?),
        "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => Value::Real(row.try_get::<f64, _>(index)?),
        "BLOB" => {
            let bytes: Vec<u8> = row.try_get(index)?;
            Value::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
        _ => Value::Text(row.try_get::<String, _>(index)?),
    };
    Ok(value)
}

/// Decodes every column of a SQLite row, skipping the named columns.
pub(crate) fn decode_row(row: &SqliteRow, skip: &[&str]) -> Result<Row, sqlx::Error> {
    let mut out = Row::new();
    for column in row.columns() {
        if skip.contains(&column.name()) {
            continue;
        }
        out.insert(
            column.name().to_string(),
            decode_column(row, column.ordinal())?,
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_from_json() {
        let parsed: Row =
            serde_json::from_str(r#"{"id": 3, "name": "a", "score": 1.5, "ok": true, "x": null}"#)
                .unwrap();
        assert_eq!(parsed["id"], Value::Int(3));
        assert_eq!(parsed["name"], Value::Text("a".to_string()));
        assert_eq!(parsed["score"], Value::Real(1.5));
        assert_eq!(parsed["ok"], Value::Bool(true));
        assert_eq!(parsed["x"], Value::Null);
    }

    #[test]
    fn test_as_key_accepts_numeric_strings() {
        assert_eq!(Value::from("104").as_key(), Some(104));
        assert_eq!(Value::from(" -7 ").as_key(), Some(-7));
        assert_eq!(Value::Int(9).as_key(), Some(9));
        assert_eq!(Value::Real(4.0).as_key(), Some(4));
        assert_eq!(Value::Real(4.5).as_key(), None);
        assert_eq!(Value::Null.as_key(), None);
        assert_eq!(Value::from("abc").as_key(), None);
    }

    #[test]
    fn test_row_builder() {
        let r = row([("id", Value::Int(1)), ("name", Value::from("x"))]);
        assert_eq!(r.len(), 2);
        assert_eq!(r["name"], Value::Text("x".into()));
    }
}
