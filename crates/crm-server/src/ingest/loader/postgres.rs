//! PostgreSQL warehouse loader

use super::{full_targets, plan_append, table_schema, LoadOutcome, TableLoader, TargetColumn};
use crate::ingest::config::{DomainConfig, LoadMode};
use crate::ingest::error::{IngestError, Result};
use crate::ingest::models::{ColumnType, RecordSet, Value};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{postgres::Postgres, query_builder::Separated, PgPool, QueryBuilder, Transaction};
use tracing::{debug, info, instrument};

/// Postgres caps a statement at 65535 bind parameters
const MAX_BIND_PARAMS: usize = 65_535;
const MAX_ROWS_PER_INSERT: usize = 1_000;

#[derive(Clone)]
pub struct PostgresLoader {
    pool: PgPool,
}

impl PostgresLoader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn existing_columns(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
    ) -> std::result::Result<Vec<(String, Option<ColumnType>)>, sqlx::Error> {
        let (schema, name) = split_table(table);
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT column_name::text, data_type::text
            FROM information_schema.columns
            WHERE table_schema = COALESCE($1::text, current_schema())
              AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(schema)
        .bind(name)
        .fetch_all(&mut **tx)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(column, data_type)| (column, column_type_from_pg(&data_type)))
            .collect())
    }

    async fn insert_rows(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        records: &RecordSet,
        columns: &[TargetColumn],
    ) -> std::result::Result<(), sqlx::Error> {
        if records.is_empty() || columns.is_empty() {
            return Ok(());
        }

        let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        let prefix = insert_prefix(table, &names);
        for chunk in records.rows().chunks(rows_per_insert(columns.len())) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(&prefix);
            builder.push_values(chunk, |mut separated, row| {
                for column in columns {
                    bind_value(&mut separated, &row[column.index], column.target);
                }
            });
            builder.build().execute(&mut **tx).await?;
            debug!(table, rows = chunk.len(), "Inserted batch");
        }
        Ok(())
    }

    async fn write(&self, records: &RecordSet, domain: &DomainConfig) -> std::result::Result<Vec<String>, LoadFailure> {
        let table = qualified_table(&domain.table);
        let mut tx = self.pool.begin().await?;

        let added = match domain.load_mode {
            LoadMode::Replace => {
                let schema = table_schema(records, &domain.table)?;

                sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(&create_table_sql(&table, &schema, false))
                    .execute(&mut *tx)
                    .await?;
                Self::insert_rows(&mut tx, &table, records, &full_targets(&schema)).await?;
                Vec::new()
            },
            LoadMode::Append => {
                let existing = Self::existing_columns(&mut tx, &domain.table).await?;
                let plan = plan_append(&existing, records, &domain.table)?;

                sqlx::query(&create_table_sql(&table, &[], true))
                    .execute(&mut *tx)
                    .await?;
                for (column, ty) in &plan.added {
                    sqlx::query(&add_column_sql(&table, column, *ty))
                        .execute(&mut *tx)
                        .await?;
                }
                if !plan.deferred.is_empty() {
                    debug!(table = %domain.table, deferred = ?plan.deferred, "Skipped all-null new columns");
                }
                Self::insert_rows(&mut tx, &table, records, &plan.columns).await?;
                plan.added.into_iter().map(|(name, _)| name).collect()
            },
        };

        tx.commit().await?;
        Ok(added)
    }

    async fn count_rows(&self, table: &str) -> std::result::Result<u64, sqlx::Error> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", qualified_table(table)))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

/// Failure inside the load transaction; the transaction is rolled back on drop
enum LoadFailure {
    Database(sqlx::Error),
    Pipeline(IngestError),
}

impl From<sqlx::Error> for LoadFailure {
    fn from(err: sqlx::Error) -> Self {
        LoadFailure::Database(err)
    }
}

impl From<IngestError> for LoadFailure {
    fn from(err: IngestError) -> Self {
        LoadFailure::Pipeline(err)
    }
}

#[async_trait]
impl TableLoader for PostgresLoader {
    #[instrument(skip_all, fields(domain = %domain.id, table = %domain.table, mode = domain.load_mode.as_str()))]
    async fn load(&self, records: &RecordSet, domain: &DomainConfig) -> Result<LoadOutcome> {
        let added_columns = self.write(records, domain).await.map_err(|failure| match failure {
            LoadFailure::Database(e) => IngestError::load(&domain.table, records.len(), e),
            LoadFailure::Pipeline(e) => e,
        })?;

        let committed_rows = self
            .count_rows(&domain.table)
            .await
            .map_err(|e| IngestError::load(&domain.table, records.len(), format!("row count verification failed: {}", e)))?;

        info!(
            domain = %domain.id,
            table = %domain.table,
            rows = records.len(),
            committed_rows,
            added_columns = ?added_columns,
            "Loaded records into PostgreSQL"
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

fn bind_value(separated: &mut Separated<'_, '_, Postgres, &'static str>, value: &Value, target: ColumnType) {
    match (value, target) {
        (Value::Null, ColumnType::Text) => {
            separated.push_bind(None::<String>);
        },
        (Value::Null, ColumnType::Integer) => {
            separated.push_bind(None::<i64>);
        },
        (Value::Null, ColumnType::Float) => {
            separated.push_bind(None::<f64>);
        },
        (Value::Null, ColumnType::Boolean) => {
            separated.push_bind(None::<bool>);
        },
        (Value::Null, ColumnType::Date) => {
            separated.push_bind(None::<NaiveDate>);
        },
        (Value::Null, ColumnType::Timestamp) => {
            separated.push_bind(None::<DateTime<Utc>>);
        },
        (Value::Integer(i), ColumnType::Float) => {
            separated.push_bind(*i as f64);
        },
        (Value::Integer(i), _) => {
            separated.push_bind(*i);
        },
        (Value::Float(f), _) => {
            separated.push_bind(*f);
        },
        (Value::Bool(b), _) => {
            separated.push_bind(*b);
        },
        (Value::Text(s), _) => {
            separated.push_bind(s.clone());
        },
        (Value::Date(d), _) => {
            separated.push_bind(*d);
        },
        (Value::Timestamp(ts), _) => {
            separated.push_bind(ts.with_timezone(&Utc));
        },
    }
}

/// Double-quote an identifier, escaping embedded quotes
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn split_table(table: &str) -> (Option<&str>, &str) {
    match table.split_once('.') {
        Some((schema, name)) => (Some(schema), name),
        None => (None, table),
    }
}

/// `schema.table` with each part quoted
pub(crate) fn qualified_table(table: &str) -> String {
    match split_table(table) {
        (Some(schema), name) => format!("{}.{}", quote_ident(schema), quote_ident(name)),
        (None, name) => quote_ident(name),
    }
}

pub(crate) fn create_table_sql(table: &str, schema: &[(String, ColumnType)], if_not_exists: bool) -> String {
    let columns = schema
        .iter()
        .map(|(name, ty)| format!("{} {}", quote_ident(name), ty.sql_type()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE TABLE {}{} ({})",
        if if_not_exists { "IF NOT EXISTS " } else { "" },
        table,
        columns
    )
}

pub(crate) fn add_column_sql(table: &str, column: &str, ty: ColumnType) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
        table,
        quote_ident(column),
        ty.sql_type()
    )
}

pub(crate) fn insert_prefix(table: &str, columns: &[String]) -> String {
    let columns = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {} ({}) ", table, columns)
}

pub(crate) fn rows_per_insert(column_count: usize) -> usize {
    (MAX_BIND_PARAMS / column_count.max(1)).clamp(1, MAX_ROWS_PER_INSERT)
}

/// Map `information_schema.columns.data_type` onto managed column types
pub(crate) fn column_type_from_pg(data_type: &str) -> Option<ColumnType> {
    match data_type {
        "text" | "character varying" | "character" => Some(ColumnType::Text),
        "bigint" | "integer" | "smallint" => Some(ColumnType::Integer),
        "double precision" | "real" | "numeric" => Some(ColumnType::Float),
        "boolean" => Some(ColumnType::Boolean),
        "date" => Some(ColumnType::Date),
        "timestamp with time zone" | "timestamp without time zone" => Some(ColumnType::Timestamp),
        _ => None,
    }
}
