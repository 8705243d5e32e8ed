//! Raw payload to record set
//!
//! Pure and deterministic: the load timestamp is injected by the caller.
//!
//! 1. Split the payload into row objects (top-level array, or the array under
//!    the domain's `records_field`).
//! 2. Flatten nested objects into `parent.child` columns; arrays become JSON text.
//! 3. Apply the rename map.
//! 4. Coerce declared date, numeric and text fields.
//! 5. Stamp `load_timestamp` in the domain timezone.

use super::config::{DomainConfig, NumericType};
use super::error::{IngestError, Result};
use super::models::{ColumnType, RawPayload, RecordSet, Value};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Map;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, instrument, warn};

pub const LOAD_TIMESTAMP_COLUMN: &str = "load_timestamp";

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];
/// `%.f` also matches values without a fractional part
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];
const OFFSET_DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"];

#[instrument(skip_all, fields(domain = %domain.id))]
pub fn normalize(
    payload: &RawPayload,
    domain: &DomainConfig,
    loaded_at: DateTime<Utc>,
) -> Result<RecordSet> {
    let objects = row_objects(payload.value(), domain)?;

    let flat_rows: Vec<HashMap<String, Value>> = objects
        .iter()
        .map(|obj| {
            let mut row = HashMap::new();
            flatten_into(None, obj, &mut row);
            row
        })
        .collect();

    let source_columns = source_columns(&objects);
    let mapping = column_mapping(&source_columns, domain);

    let mut columns: Vec<String> = mapping.iter().map(|(dest, _)| dest.clone()).collect();
    let mut rows: Vec<Vec<Value>> = flat_rows
        .into_iter()
        .map(|mut flat| {
            mapping
                .iter()
                .map(|(_, source)| flat.remove(source.as_str()).unwrap_or(Value::Null))
                .collect()
        })
        .collect();

    coerce_columns(&columns, &mut rows, domain);

    let stamp = Value::Timestamp(loaded_at.with_timezone(&domain.timezone).fixed_offset());
    match columns.iter().position(|c| c == LOAD_TIMESTAMP_COLUMN) {
        Some(idx) => rows.iter_mut().for_each(|row| row[idx] = stamp.clone()),
        None => {
            columns.push(LOAD_TIMESTAMP_COLUMN.to_string());
            rows.iter_mut().for_each(|row| row.push(stamp.clone()));
        },
    }

    let records = RecordSet::from_rows(domain.id.clone(), columns, rows)?;
    info!(
        domain = %domain.id,
        rows = records.len(),
        columns = records.columns().len(),
        "Normalized payload"
    );
    Ok(records)
}

/// Locate the row boundary of the payload
fn row_objects<'a>(
    value: &'a serde_json::Value,
    domain: &DomainConfig,
) -> Result<Vec<&'a Map<String, serde_json::Value>>> {
    let items = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(obj) => {
            let field = domain.records_field.as_deref().ok_or_else(|| {
                IngestError::Schema(format!(
                    "{} payload is an object but no records_field is configured",
                    domain.id
                ))
            })?;
            match obj.get(field) {
                Some(serde_json::Value::Array(items)) => items,
                Some(_) => {
                    return Err(IngestError::Schema(format!(
                        "{} payload field '{}' is not an array",
                        domain.id, field
                    )))
                },
                None => {
                    return Err(IngestError::Schema(format!(
                        "{} payload has no '{}' field",
                        domain.id, field
                    )))
                },
            }
        },
        other => {
            return Err(IngestError::Schema(format!(
                "{} payload is a {} and has no rows",
                domain.id,
                json_type_name(other)
            )))
        },
    };

    items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            item.as_object().ok_or_else(|| {
                IngestError::Schema(format!(
                    "{} record {} is a {}, expected an object",
                    domain.id,
                    idx,
                    json_type_name(item)
                ))
            })
        })
        .collect()
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

fn flatten_into(
    prefix: Option<&str>,
    obj: &Map<String, serde_json::Value>,
    out: &mut HashMap<String, Value>,
) {
    for (key, value) in obj {
        let name = match prefix {
            Some(p) => format!("{}.{}", p, key),
            None => key.clone(),
        };
        match value {
            serde_json::Value::Object(nested) if !nested.is_empty() => {
                flatten_into(Some(&name), nested, out)
            },
            _ => {
                out.insert(name, from_json(value));
            },
        }
    }
}

/// Union of flattened keys in first-seen order
fn source_columns(objects: &[&Map<String, serde_json::Value>]) -> Vec<String> {
    fn collect(prefix: Option<&str>, obj: &Map<String, serde_json::Value>, seen: &mut Vec<String>) {
        for (key, value) in obj {
            let name = match prefix {
                Some(p) => format!("{}.{}", p, key),
                None => key.clone(),
            };
            match value {
                serde_json::Value::Object(nested) if !nested.is_empty() => {
                    collect(Some(&name), nested, seen)
                },
                _ => {
                    if !seen.contains(&name) {
                        seen.push(name);
                    }
                },
            }
        }
    }

    let mut seen = Vec::new();
    for obj in objects {
        collect(None, obj, &mut seen);
    }
    seen
}

/// Destination column paired with the source column that feeds it.
///
/// When a renamed field and a passthrough field land on the same destination,
/// the renamed field wins.
fn column_mapping(source_columns: &[String], domain: &DomainConfig) -> Vec<(String, String)> {
    let mut mapping: Vec<(String, String)> = Vec::new();

    for source in source_columns {
        let renamed = domain.rename.get(source);
        let dest = renamed.cloned().unwrap_or_else(|| source.clone());

        match mapping.iter_mut().find(|(d, _)| *d == dest) {
            None => mapping.push((dest, source.clone())),
            Some(entry) => {
                let existing_renamed = entry.1 != entry.0;
                if renamed.is_some() && !existing_renamed {
                    warn!(
                        domain = %domain.id,
                        column = %dest,
                        dropped = %entry.1,
                        kept = %source,
                        "Renamed field collides with an existing column"
                    );
                    entry.1 = source.clone();
                } else {
                    warn!(
                        domain = %domain.id,
                        column = %dest,
                        dropped = %source,
                        kept = %entry.1,
                        "Renamed field collides with an existing column"
                    );
                }
            },
        }
    }

    mapping
}

fn from_json(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => n.as_f64().map_or(Value::Null, Value::Float),
        },
        serde_json::Value::String(s) => Value::Text(s.clone()),
        serde_json::Value::Array(_) => Value::Text(value.to_string()),
        // Only empty objects reach here; non-empty ones are flattened.
        serde_json::Value::Object(_) => Value::Null,
    }
}

fn coerce_columns(columns: &[String], rows: &mut [Vec<Value>], domain: &DomainConfig) {
    for (idx, column) in columns.iter().enumerate() {
        let is_date = domain.date_fields.contains(column);
        let numeric = domain.numeric_fields.get(column).copied();
        let is_text = domain.text_fields.contains(column);

        let mut nulled = 0usize;
        for row in rows.iter_mut() {
            let cell = &mut row[idx];
            let before_null = cell.is_null();

            if is_date {
                *cell = coerce_date(cell);
            }
            if let Some(target) = numeric {
                *cell = coerce_numeric(cell, target);
            }
            if is_text {
                *cell = coerce_text(cell);
            }

            if !before_null && cell.is_null() {
                nulled += 1;
            }
        }

        if nulled > 0 {
            debug!(
                domain = %domain.id,
                column = %column,
                count = nulled,
                "Invalid values coerced to null"
            );
        }

        if !is_date && numeric.is_none() && !is_text {
            unify_column(idx, rows);
        }
    }
}

/// Give an undeclared column a single type: integers and floats widen to
/// float, any other mix becomes text.
fn unify_column(idx: usize, rows: &mut [Vec<Value>]) {
    let types: HashSet<ColumnType> = rows
        .iter()
        .filter_map(|row| row[idx].column_type())
        .collect();
    if types.len() <= 1 {
        return;
    }

    let numeric_only = types
        .iter()
        .all(|t| matches!(t, ColumnType::Integer | ColumnType::Float));
    for row in rows.iter_mut() {
        let cell = &mut row[idx];
        *cell = match (&*cell, numeric_only) {
            (Value::Null, _) => Value::Null,
            (Value::Integer(i), true) => Value::Float(*i as f64),
            (_, true) => cell.clone(),
            (other, false) => Value::Text(other.to_string()),
        };
    }
}

pub(crate) fn coerce_date(value: &Value) -> Value {
    match value {
        Value::Date(d) => Value::Date(*d),
        Value::Timestamp(ts) => Value::Date(ts.date_naive()),
        Value::Text(s) => parse_date(s.trim()).map_or(Value::Null, Value::Date),
        _ => Value::Null,
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    if s.is_empty() {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive()))
        .or_else(|| {
            OFFSET_DATETIME_FORMATS
                .iter()
                .find_map(|fmt| DateTime::parse_from_str(s, fmt).ok())
                .map(|dt| dt.date_naive())
        })
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|dt| dt.date())
        })
}

pub(crate) fn coerce_numeric(value: &Value, target: NumericType) -> Value {
    let as_float = match value {
        Value::Integer(i) => {
            return match target {
                NumericType::Integer => Value::Integer(*i),
                NumericType::Float => Value::Float(*i as f64),
            }
        },
        Value::Float(f) => Some(*f),
        Value::Text(s) => {
            let s = s.trim();
            if target == NumericType::Integer {
                if let Ok(i) = s.parse::<i64>() {
                    return Value::Integer(i);
                }
            }
            s.parse::<f64>().ok()
        },
        _ => None,
    };

    match (as_float.filter(|f| f.is_finite()), target) {
        (Some(f), NumericType::Float) => Value::Float(f),
        (Some(f), NumericType::Integer)
            if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 =>
        {
            Value::Integer(f as i64)
        },
        _ => Value::Null,
    }
}

pub(crate) fn coerce_text(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Text(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}
