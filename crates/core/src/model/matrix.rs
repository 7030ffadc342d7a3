//! Tabular query results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// A single cell of a result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(#[serde(with = "float_cell")] f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// Approximate in-memory footprint, used for chunk budgeting.
    pub fn approx_size(&self) -> usize {
        match self {
            Value::Null | Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 8,
            Value::Text(s) => s.len() + 8,
            Value::Bytes(b) => b.len() + 8,
        }
    }

    /// Type name reported for a column whose first value is `self`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Int(_) => "INTEGER",
            Value::Float(_) => "REAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
        }
    }
}

/// JSON has no encoding for infinities or NaN; those are written as their
/// display text (`inf`, `-inf`, `NaN`) and parsed back.
mod float_cell {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() { serializer.serialize_f64(*value) } else { serializer.collect_str(value) }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(f64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Text(text) => text.parse().map_err(|_| D::Error::custom(format!("invalid float cell {text:?}"))),
        }
    }
}

pub type Row = Vec<Value>;

/// Approximate footprint of a whole row.
pub fn row_size(row: &[Value]) -> usize {
    row.iter().map(Value::approx_size).sum()
}

/// A materialized tabular result.
///
/// `key` and `from_cache` are bookkeeping for the caller and are never
/// persisted: a matrix reached through references or a chunk manifest reports
/// the key that was originally requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMatrix {
    pub columns: Vec<String>,
    pub column_types: Vec<String>,
    pub rows: Vec<Row>,
    pub executed_at: DateTime<Utc>,
    #[serde(default)]
    pub has_more: bool,

    #[serde(skip)]
    pub key: Option<String>,
    #[serde(skip)]
    pub from_cache: bool,
}

impl RawMatrix {
    pub fn new(columns: Vec<String>, column_types: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, column_types, rows, executed_at: Utc::now(), has_more: false, key: None, from_cache: false }
    }

    /// An empty result carrying only the column layout of `self`.
    pub fn empty_like(&self) -> Self {
        Self {
            columns: self.columns.clone(),
            column_types: self.column_types.clone(),
            rows: Vec::new(),
            executed_at: self.executed_at,
            has_more: false,
            key: None,
            from_cache: false,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Append the rows of `other`, preserving order.
    ///
    /// Both matrices must share the same columns; a mismatch means the chunks
    /// were not produced by one execution.
    pub fn merge(&mut self, other: RawMatrix) -> Result<(), Error> {
        if self.columns != other.columns {
            return Err(Error::Decode(format!(
                "chunk columns {:?} do not match {:?}",
                other.columns, self.columns
            )));
        }
        self.rows.extend(other.rows);
        Ok(())
    }

    pub fn tagged(mut self, key: &str, from_cache: bool) -> Self {
        self.key = Some(key.to_string());
        self.from_cache = from_cache;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: &[i64]) -> RawMatrix {
        RawMatrix::new(
            vec!["id".into()],
            vec!["INTEGER".into()],
            rows.iter().map(|v| vec![Value::Int(*v)]).collect(),
        )
    }

    #[test]
    fn test_merge_preserves_order() {
        let mut first = matrix(&[1, 2]);
        first.merge(matrix(&[3, 4])).unwrap();
        let ids: Vec<_> = first.rows.iter().map(|r| r[0].clone()).collect();
        assert_eq!(ids, vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4)]);
    }

    #[test]
    fn test_merge_rejects_mismatched_columns() {
        let mut first = matrix(&[1]);
        let mut other = matrix(&[2]);
        other.columns = vec!["name".into()];
        assert!(matches!(first.merge(other), Err(Error::Decode(_))));
    }

    #[test]
    fn test_bookkeeping_fields_not_serialized() {
        let tagged = matrix(&[1]).tagged("k1", true);
        let json = serde_json::to_string(&tagged).unwrap();
        assert!(!json.contains("from_cache"));

        let back: RawMatrix = serde_json::from_str(&json).unwrap();
        assert_eq!(back.key, None);
        assert!(!back.from_cache);
        assert_eq!(back.rows, tagged.rows);
    }

    #[test]
    fn test_non_finite_floats_survive_serialization() {
        let cells = vec![
            Value::Float(f64::INFINITY),
            Value::Float(f64::NEG_INFINITY),
            Value::Float(f64::NAN),
            Value::Float(-0.5),
        ];
        let json = serde_json::to_string(&cells).unwrap();
        let back: Vec<Value> = serde_json::from_str(&json).unwrap();

        assert_eq!(back[0], Value::Float(f64::INFINITY));
        assert_eq!(back[1], Value::Float(f64::NEG_INFINITY));
        assert!(matches!(back[2], Value::Float(f) if f.is_nan()));
        assert_eq!(back[3], Value::Float(-0.5));
    }

    #[test]
    fn test_float_cell_rejects_garbage_text() {
        assert!(serde_json::from_str::<Value>(r#"{"Float":"lots"}"#).is_err());
    }

    #[test]
    fn test_value_sizes() {
        assert_eq!(Value::Text("abcd".into()).approx_size(), 12);
        assert_eq!(row_size(&[Value::Int(1), Value::Null]), 9);
    }
}
