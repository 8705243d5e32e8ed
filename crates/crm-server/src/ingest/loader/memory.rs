//! In-memory warehouse for local runs and tests

use super::{plan_append, table_schema, LoadOutcome, TableLoader};
use crate::ingest::config::{DomainConfig, LoadMode};
use crate::ingest::error::Result;
use crate::ingest::models::{ColumnType, RecordSet, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTable {
    pub columns: Vec<(String, ColumnType)>,
    pub rows: Vec<Vec<Value>>,
}

impl MemoryTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|(c, _)| c == name)
    }
}

#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    tables: Mutex<HashMap<String, MemoryTable>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn table(&self, name: &str) -> Option<MemoryTable> {
        self.tables.lock().await.get(name).cloned()
    }

    pub async fn row_count(&self, name: &str) -> Option<usize> {
        self.tables.lock().await.get(name).map(|t| t.rows.len())
    }

    pub async fn column_names(&self, name: &str) -> Option<Vec<String>> {
        self.tables
            .lock()
            .await
            .get(name)
            .map(|t| t.columns.iter().map(|(c, _)| c.clone()).collect())
    }
}

fn to_target(value: &Value, target: ColumnType) -> Value {
    match (value, target) {
        (Value::Integer(i), ColumnType::Float) => Value::Float(*i as f64),
        (other, _) => other.clone(),
    }
}

#[async_trait]
impl TableLoader for MemoryWarehouse {
    #[instrument(skip_all, fields(domain = %domain.id, table = %domain.table, mode = domain.load_mode.as_str()))]
    async fn load(&self, records: &RecordSet, domain: &DomainConfig) -> Result<LoadOutcome> {
        let mut tables = self.tables.lock().await;

        let added_columns = match domain.load_mode {
            LoadMode::Replace => {
                let columns = table_schema(records, &domain.table)?;
                let rows = records
                    .rows()
                    .iter()
                    .map(|row| {
                        row.iter()
                            .zip(&columns)
                            .map(|(v, (_, ty))| to_target(v, *ty))
                            .collect()
                    })
                    .collect();
                tables.insert(domain.table.clone(), MemoryTable { columns, rows });
                Vec::new()
            },
            LoadMode::Append => {
                let existing: Vec<(String, Option<ColumnType>)> = tables
                    .get(&domain.table)
                    .map(|t| t.columns.iter().map(|(c, ty)| (c.clone(), Some(*ty))).collect())
                    .unwrap_or_default();
                let plan = plan_append(&existing, records, &domain.table)?;

                let table = tables.entry(domain.table.clone()).or_default();
                for (name, ty) in &plan.added {
                    table.columns.push((name.clone(), *ty));
                    table.rows.iter_mut().for_each(|row| row.push(Value::Null));
                }

                let positions: Vec<usize> = plan
                    .columns
                    .iter()
                    .filter_map(|c| table.column_index(&c.name))
                    .collect();
                let width = table.columns.len();
                for row in records.rows() {
                    let mut stored = vec![Value::Null; width];
                    for ((value, target), pos) in plan.project(row).zip(&positions) {
                        stored[*pos] = to_target(value, target);
                    }
                    table.rows.push(stored);
                }
                if !plan.deferred.is_empty() {
                    debug!(table = %domain.table, deferred = ?plan.deferred, "Skipped all-null new columns");
                }

                plan.added.into_iter().map(|(name, _)| name).collect()
            },
        };

        let committed_rows = tables.get(&domain.table).map_or(0, |t| t.rows.len()) as u64;
        info!(
            domain = %domain.id,
            table = %domain.table,
            rows = records.len(),
            committed_rows,
            "Loaded records into memory warehouse"
        );

        Ok(LoadOutcome {
            table: domain.table.clone(),
            mode: domain.load_mode,
            rows_written: records.len(),
            committed_rows,
            added_columns,
        })
    }
}
