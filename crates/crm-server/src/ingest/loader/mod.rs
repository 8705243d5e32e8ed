//! Warehouse loaders
//!
//! - **Replace**: the table is dropped, recreated from the record set schema and
//!   filled in one transaction.
//! - **Append**: the table is created if absent, new columns are added (never
//!   dropped) and rows are appended. Integer values widen into float columns;
//!   any other type mismatch is a `Load` error. A new column whose values are all
//!   null is not added until a load supplies a typed value.

pub mod memory;
pub mod postgres;

pub use memory::MemoryWarehouse;
pub use postgres::PostgresLoader;

use super::config::{DomainConfig, LoadMode};
use super::error::{IngestError, Result};
use super::models::{ColumnType, RecordSet, Value};
use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadOutcome {
    pub table: String,
    pub mode: LoadMode,
    pub rows_written: usize,
    /// Row count read back from the table after commit
    pub committed_rows: u64,
    pub added_columns: Vec<String>,
}

#[async_trait]
pub trait TableLoader: Send + Sync {
    async fn load(&self, records: &RecordSet, domain: &DomainConfig) -> Result<LoadOutcome>;
}

/// Single storage type for a record set column; `None` when every value is null.
///
/// Mixed integer and float values resolve to float.
pub fn column_storage_type(records: &RecordSet, column: &str, table: &str) -> Result<Option<ColumnType>> {
    let Some(values) = records.column_values(column) else {
        return Ok(None);
    };

    let mut resolved: Option<ColumnType> = None;
    for ty in values.filter_map(Value::column_type) {
        resolved = match (resolved, ty) {
            (None, t) => Some(t),
            (Some(a), b) if a == b => Some(a),
            (Some(ColumnType::Integer), ColumnType::Float)
            | (Some(ColumnType::Float), ColumnType::Integer) => Some(ColumnType::Float),
            (Some(a), b) => {
                return Err(IngestError::load(
                    table,
                    records.len(),
                    format!("column '{}' mixes {} and {} values", column, a, b),
                ))
            },
        };
    }
    Ok(resolved)
}

/// Insert targets for every column of a freshly created table
pub fn full_targets(schema: &[(String, ColumnType)]) -> Vec<TargetColumn> {
    schema
        .iter()
        .enumerate()
        .map(|(index, (name, target))| TargetColumn {
            index,
            name: name.clone(),
            target: *target,
        })
        .collect()
}

/// Schema for a freshly created table. All-null columns are created as text.
pub fn table_schema(records: &RecordSet, table: &str) -> Result<Vec<(String, ColumnType)>> {
    records
        .columns()
        .iter()
        .map(|c| {
            column_storage_type(records, c, table)
                .map(|ty| (c.clone(), ty.unwrap_or(ColumnType::Text)))
        })
        .collect()
}

/// Incoming column written by a load, with its destination type
#[derive(Debug, Clone, PartialEq)]
pub struct TargetColumn {
    /// Position in the record set
    pub index: usize,
    pub name: String,
    pub target: ColumnType,
}

/// Schema changes needed to append a record set to an existing table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppendPlan {
    /// Columns to add, in record set order
    pub added: Vec<(String, ColumnType)>,
    /// Incoming columns to insert, in record set order
    pub columns: Vec<TargetColumn>,
    /// New columns left out of this load because every incoming value is null.
    /// They are added by the first load that carries a typed value.
    pub deferred: Vec<String>,
}

impl AppendPlan {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Values of `row` for the planned columns, in plan order
    pub fn project<'a>(&'a self, row: &'a [Value]) -> impl Iterator<Item = (&'a Value, ColumnType)> + 'a {
        self.columns.iter().map(move |c| (&row[c.index], c.target))
    }
}

/// Reconcile incoming columns with an existing table.
///
/// `existing` holds the destination columns; `None` marks a column type the
/// loader does not manage, which only accepts all-null incoming values. All-null
/// columns are never used to pick a new column's type, and all-null values for
/// unmanaged columns are left to the column default.
pub fn plan_append(
    existing: &[(String, Option<ColumnType>)],
    records: &RecordSet,
    table: &str,
) -> Result<AppendPlan> {
    let mut plan = AppendPlan::default();

    for (index, column) in records.columns().iter().enumerate() {
        let incoming = column_storage_type(records, column, table)?;
        let current = existing.iter().find(|(name, _)| name == column);

        let target = match (current, incoming) {
            (None, None) => {
                plan.deferred.push(column.clone());
                continue;
            },
            (None, Some(ty)) => {
                plan.added.push((column.clone(), ty));
                ty
            },
            (Some((_, None)), None) => continue,
            (Some((_, Some(existing_ty))), None) => *existing_ty,
            (Some((_, Some(existing_ty))), Some(incoming_ty)) if *existing_ty == incoming_ty => {
                incoming_ty
            },
            (Some((_, Some(ColumnType::Float))), Some(ColumnType::Integer)) => ColumnType::Float,
            (Some((_, existing_ty)), Some(incoming_ty)) => {
                let existing_name = existing_ty.map_or("an unsupported type".to_string(), |t| t.to_string());
                return Err(IngestError::load(
                    table,
                    records.len(),
                    format!(
                        "column '{}' is {} in the table but incoming values are {}",
                        column, existing_name, incoming_ty
                    ),
                ));
            },
        };
        plan.columns.push(TargetColumn {
            index,
            name: column.clone(),
            target,
        });
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(columns: &[&str], rows: Vec<Vec<Value>>) -> RecordSet {
        RecordSet::from_rows("calls", columns.iter().map(|c| c.to_string()).collect(), rows).unwrap()
    }

    #[test]
    fn test_table_schema_defaults_null_columns_to_text() {
        let set = records(
            &["id", "notes"],
            vec![vec![Value::Integer(1), Value::Null]],
        );
        assert_eq!(
            table_schema(&set, "calls").unwrap(),
            vec![
                ("id".to_string(), ColumnType::Integer),
                ("notes".to_string(), ColumnType::Text)
            ]
        );
    }

    #[test]
    fn test_mixed_numeric_column_resolves_to_float() {
        let set = records(&["score"], vec![vec![Value::Integer(1)], vec![Value::Float(2.5)]]);
        assert_eq!(
            column_storage_type(&set, "score", "calls").unwrap(),
            Some(ColumnType::Float)
        );
    }

    #[test]
    fn test_mixed_text_and_number_is_load_error() {
        let set = records(&["code"], vec![vec![Value::Integer(1)], vec![Value::Text("x".into())]]);
        let err = column_storage_type(&set, "code", "calls").unwrap_err();
        assert!(matches!(err, IngestError::Load { rows: 2, .. }));
    }

    #[test]
    fn test_plan_append_adds_new_columns() {
        let existing = vec![("id".to_string(), Some(ColumnType::Integer))];
        let set = records(
            &["id", "outcome"],
            vec![vec![Value::Integer(1), Value::Text("SUCC".into())]],
        );

        let plan = plan_append(&existing, &set, "calls").unwrap();

        assert_eq!(plan.added, vec![("outcome".to_string(), ColumnType::Text)]);
        assert_eq!(plan.column_names(), vec!["id", "outcome"]);
        assert_eq!(plan.columns[1].target, ColumnType::Text);
    }

    #[test]
    fn test_plan_append_widens_integer_into_float() {
        let existing = vec![("duration".to_string(), Some(ColumnType::Float))];
        let set = records(&["duration"], vec![vec![Value::Integer(30)]]);

        let plan = plan_append(&existing, &set, "calls").unwrap();

        assert!(plan.added.is_empty());
        assert_eq!(plan.columns[0].target, ColumnType::Float);
    }

    #[test]
    fn test_plan_append_rejects_type_conflict() {
        let existing = vec![("duration".to_string(), Some(ColumnType::Integer))];
        let set = records(&["duration"], vec![vec![Value::Text("long".into())]]);

        let err = plan_append(&existing, &set, "calls").unwrap_err();
        assert!(err.to_string().contains("duration"));
    }

    #[test]
    fn test_plan_append_accepts_all_null_column() {
        let existing = vec![("agent".to_string(), Some(ColumnType::Text))];
        let set = records(&["agent"], vec![vec![Value::Null]]);

        let plan = plan_append(&existing, &set, "calls").unwrap();
        assert_eq!(plan.columns[0].target, ColumnType::Text);
    }

    #[test]
    fn test_plan_append_defers_all_null_new_column() {
        let existing = vec![("id".to_string(), Some(ColumnType::Integer))];
        let set = records(&["id", "rating"], vec![vec![Value::Integer(1), Value::Null]]);

        let plan = plan_append(&existing, &set, "calls").unwrap();

        assert!(plan.added.is_empty());
        assert_eq!(plan.deferred, vec!["rating".to_string()]);
        assert_eq!(plan.column_names(), vec!["id"]);
    }

    #[test]
    fn test_deferred_column_takes_type_of_first_typed_load() {
        let existing = vec![("id".to_string(), Some(ColumnType::Integer))];
        let set = records(&["id", "rating"], vec![vec![Value::Integer(2), Value::Integer(4)]]);

        let plan = plan_append(&existing, &set, "calls").unwrap();

        assert_eq!(plan.added, vec![("rating".to_string(), ColumnType::Integer)]);
        assert_eq!(plan.columns[1].index, 1);
    }

    #[test]
    fn test_plan_append_skips_null_values_for_unmanaged_column() {
        let existing = vec![("payload".to_string(), None)];
        let set = records(&["payload"], vec![vec![Value::Null]]);

        let plan = plan_append(&existing, &set, "calls").unwrap();

        assert!(plan.columns.is_empty());
        assert!(plan.deferred.is_empty());
    }

    #[test]
    fn test_plan_projects_row_values() {
        let existing = vec![("id".to_string(), Some(ColumnType::Float))];
        let set = records(&["note", "id"], vec![vec![Value::Null, Value::Integer(7)]]);

        let plan = plan_append(&existing, &set, "calls").unwrap();
        let projected: Vec<_> = plan.project(&set.rows()[0]).collect();

        assert_eq!(projected, vec![(&Value::Integer(7), ColumnType::Float)]);
    }
}
