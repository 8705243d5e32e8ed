//! Data carried between pipeline stages

use super::error::{IngestError, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::Serialize;
use std::fmt;

/// A single typed cell of a normalized record
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<FixedOffset>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view used by range checks. Numeric strings count as numbers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            _ => None,
        }
    }

    /// Column type this value would be stored as, `None` for null
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnType::Boolean),
            Value::Integer(_) => Some(ColumnType::Integer),
            Value::Float(_) => Some(ColumnType::Float),
            Value::Text(_) => Some(ColumnType::Text),
            Value::Date(_) => Some(ColumnType::Date),
            Value::Timestamp(_) => Some(ColumnType::Timestamp),
        }
    }

    /// Empty or whitespace-only strings are treated as missing by quality checks
    pub fn is_blank(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => f.write_str(s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

/// Warehouse column types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    Date,
    Timestamp,
}

impl ColumnType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "BIGINT",
            ColumnType::Float => "DOUBLE PRECISION",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Date => "DATE",
            ColumnType::Timestamp => "TIMESTAMPTZ",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_type())
    }
}

/// Uniformly keyed rows produced by the normalizer.
///
/// Every row has exactly `columns.len()` cells, in column order.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSet {
    domain: String,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl RecordSet {
    pub fn new(domain: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            domain: domain.into(),
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a record set, rejecting rows whose width differs from the schema
    pub fn from_rows(
        domain: impl Into<String>,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    ) -> Result<Self> {
        let mut set = Self::new(domain, columns);
        for row in rows {
            set.push_row(row)?;
        }
        Ok(set)
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(IngestError::Schema(format!(
                "row has {} values but {} columns are defined",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// All values of one column, in row order
    pub fn column_values<'a>(&'a self, name: &str) -> Option<impl Iterator<Item = &'a Value> + 'a> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(move |row| &row[idx]))
    }

    /// Type of the first non-null value in a column
    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.column_values(name)?.find_map(Value::column_type)
    }
}

/// Verbatim CRM response for one domain. Immutable once built.
#[derive(Debug, Clone)]
pub struct RawPayload {
    domain: String,
    fetched_at: DateTime<Utc>,
    body: Vec<u8>,
    value: serde_json::Value,
}

impl RawPayload {
    /// Decode a response body, failing with `Schema` when it is not JSON
    pub fn from_body(
        domain: impl Into<String>,
        fetched_at: DateTime<Utc>,
        body: Vec<u8>,
    ) -> Result<Self> {
        let domain = domain.into();
        let value = serde_json::from_slice(&body).map_err(|e| {
            IngestError::Schema(format!("{} response is not valid JSON: {}", domain, e))
        })?;
        Ok(Self {
            domain,
            fetched_at,
            body,
            value,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn value(&self) -> &serde_json::Value {
        &self.value
    }
}
