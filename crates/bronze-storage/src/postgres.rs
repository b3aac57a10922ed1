//! Postgres backend.
//!
//! Provisioning takes a transaction-scoped advisory lock keyed on the qualified
//! table name, so check-then-create for tables and constraints runs under mutual
//! exclusion across processes. Staging areas are `ON COMMIT DROP` temp tables.

use anyhow::Context;
use async_trait::async_trait;
use bronze_core::{Column, ColumnType, Record, TableRef, TableShape, Value};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::query_builder::Separated;
use sqlx::{Connection, Postgres, QueryBuilder, Row, Transaction};

use crate::{staging_name, StagingHandle, Store, StoreError, StoreSession};

/// Bind parameters Postgres accepts in one statement.
const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgSession { tx: Some(tx) }))
    }
}

struct PgSession {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgSession {
    fn conn(&mut self) -> Result<&mut PgConnection, StoreError> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| StoreError::Rejected("session already committed".to_string()))
    }

    async fn advisory_lock(&mut self, key: &str) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(key)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StoreSession for PgSession {
    async fn create_namespace(&mut self, namespace: &str) -> Result<(), StoreError> {
        // concurrent CREATE SCHEMA IF NOT EXISTS can still collide on pg_namespace
        self.advisory_lock(&format!("schema:{namespace}")).await?;
        let sql = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(namespace));
        sqlx::query(&sql).execute(self.conn()?).await?;
        Ok(())
    }

    async fn lock_table(&mut self, table: &TableRef) -> Result<(), StoreError> {
        self.advisory_lock(&format!("table:{table}")).await
    }

    async fn describe_table(&mut self, table: &TableRef) -> Result<Option<TableShape>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT column_name::text AS column_name, data_type::text AS data_type
              FROM information_schema.columns
             WHERE table_schema = $1
               AND table_name = $2
             ORDER BY ordinal_position
            "#,
        )
        .bind(&table.schema)
        .bind(&table.name)
        .fetch_all(self.conn()?)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }
        let columns = rows
            .iter()
            .map(|row| -> Result<Column, sqlx::Error> {
                let name: String = row.try_get("column_name")?;
                let data_type: String = row.try_get("data_type")?;
                Ok(Column::new(name, column_type_for(&data_type)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(TableShape::new(columns)))
    }

    async fn create_table(&mut self, table: &TableRef, shape: &TableShape) -> Result<(), StoreError> {
        let columns = shape
            .columns()
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), sql_type(c.column_type)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("CREATE TABLE IF NOT EXISTS {} ({columns})", qualify(table));
        sqlx::query(&sql).execute(self.conn()?).await?;
        Ok(())
    }

    async fn constraint_exists(
        &mut self,
        table: &TableRef,
        constraint: &str,
    ) -> Result<bool, StoreError> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1
                  FROM pg_constraint
                 WHERE conname = $1
                   AND conrelid = $2::text::regclass
            )
            "#,
        )
        .bind(constraint)
        .bind(qualify(table))
        .fetch_one(self.conn()?)
        .await?;
        Ok(exists)
    }

    async fn add_primary_key(
        &mut self,
        table: &TableRef,
        constraint: &str,
        columns: &[String],
    ) -> Result<(), StoreError> {
        let sql = format!(
            "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
            qualify(table),
            quote_ident(constraint),
            column_list(columns.iter().map(String::as_str))
        );

        // a failed statement would abort the whole transaction; isolate it
        let mut savepoint = self.conn()?.begin().await?;
        match sqlx::query(&sql).execute(&mut *savepoint).await {
            Ok(_) => {
                savepoint.commit().await?;
                Ok(())
            }
            Err(err) if is_duplicate_constraint(&err) => {
                savepoint.rollback().await?;
                Err(StoreError::ConstraintRace {
                    constraint: constraint.to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn create_staging(
        &mut self,
        target: &TableRef,
        shape: &TableShape,
    ) -> Result<StagingHandle, StoreError> {
        let name = staging_name(target);
        let columns = shape.column_names().map(str::to_string).collect::<Vec<_>>();

        let drop_sql = format!("DROP TABLE IF EXISTS pg_temp.{}", quote_ident(&name));
        sqlx::query(&drop_sql).execute(self.conn()?).await?;

        let create_sql = format!(
            "CREATE TEMP TABLE {} ON COMMIT DROP AS SELECT {} FROM {} WHERE FALSE",
            quote_ident(&name),
            column_list(shape.column_names()),
            qualify(target)
        );
        sqlx::query(&create_sql).execute(self.conn()?).await?;

        Ok(StagingHandle::new(name, columns))
    }

    async fn insert_rows(
        &mut self,
        staging: &StagingHandle,
        shape: &TableShape,
        rows: &[Record],
    ) -> Result<u64, StoreError> {
        let columns = shape.columns();
        if rows.is_empty() || columns.is_empty() {
            return Ok(0);
        }

        let prefix = format!(
            "INSERT INTO pg_temp.{} ({}) ",
            quote_ident(staging.name()),
            column_list(shape.column_names())
        );
        let chunk_size = (MAX_BIND_PARAMS / columns.len()).max(1);
        let mut inserted = 0u64;
        for chunk in rows.chunks(chunk_size) {
            let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(prefix.as_str());
            builder.push_values(chunk, |mut b, record| {
                for column in columns {
                    bind_value(&mut b, column.column_type, record.get(&column.name));
                }
            });
            let result = builder.build().execute(self.conn()?).await?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    async fn insert_from_staging(
        &mut self,
        staging: &StagingHandle,
        target: &TableRef,
        conflict_columns: Option<&[String]>,
    ) -> Result<u64, StoreError> {
        let columns = column_list(staging.columns().iter().map(String::as_str));
        let mut sql = format!(
            "INSERT INTO {} ({columns}) SELECT {columns} FROM pg_temp.{}",
            qualify(target),
            quote_ident(staging.name())
        );
        if let Some(keys) = conflict_columns {
            sql.push_str(&format!(
                " ON CONFLICT ({}) DO NOTHING",
                column_list(keys.iter().map(String::as_str))
            ));
        }
        let result = sqlx::query(&sql).execute(self.conn()?).await?;
        Ok(result.rows_affected())
    }

    async fn drop_staging(&mut self, staging: StagingHandle) -> Result<(), StoreError> {
        let sql = format!("DROP TABLE IF EXISTS pg_temp.{}", quote_ident(staging.name()));
        sqlx::query(&sql).execute(self.conn()?).await?;
        Ok(())
    }

    async fn select_all(
        &mut self,
        table: &TableRef,
        shape: &TableShape,
    ) -> Result<Vec<Record>, StoreError> {
        let select_list = shape
            .columns()
            .iter()
            .map(|c| format!("{}::{}", quote_ident(&c.name), sql_type(c.column_type)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {select_list} FROM {}", qualify(table));
        let rows = sqlx::query(&sql).fetch_all(self.conn()?).await?;
        rows.iter()
            .map(|row| decode_row(row, shape).map_err(StoreError::from))
            .collect()
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }
}

fn bind_value<'qb, 'args: 'qb>(
    b: &mut Separated<'qb, 'args, Postgres, &'static str>,
    column_type: ColumnType,
    value: Option<&Value>,
) {
    match column_type {
        ColumnType::Text => {
            b.push_bind(value.and_then(Value::as_text).map(str::to_string));
        }
        ColumnType::BigInt => {
            b.push_bind(value.and_then(Value::as_int));
        }
        ColumnType::TimestampTz => {
            b.push_bind(value.and_then(Value::as_timestamp));
        }
    }
}

fn decode_row(row: &PgRow, shape: &TableShape) -> Result<Record, sqlx::Error> {
    let mut record = Record::new();
    for (idx, column) in shape.columns().iter().enumerate() {
        let value = match column.column_type {
            ColumnType::Text => Value::from(row.try_get::<Option<String>, _>(idx)?),
            ColumnType::BigInt => Value::from(row.try_get::<Option<i64>, _>(idx)?),
            ColumnType::TimestampTz => Value::from(row.try_get::<Option<DateTime<Utc>>, _>(idx)?),
        };
        record.set(column.name.clone(), value);
    }
    Ok(record)
}

/// duplicate_table (the key's index), duplicate_object, multiple primary keys
fn is_duplicate_constraint(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("42P07" | "42710" | "42P16"))
        }
        _ => false,
    }
}

fn sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Text => "TEXT",
        ColumnType::BigInt => "BIGINT",
        ColumnType::TimestampTz => "TIMESTAMPTZ",
    }
}

fn column_type_for(data_type: &str) -> ColumnType {
    match data_type {
        "bigint" | "integer" | "smallint" => ColumnType::BigInt,
        "timestamp with time zone" | "timestamp without time zone" => ColumnType::TimestampTz,
        _ => ColumnType::Text,
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn qualify(table: &TableRef) -> String {
    format!("{}.{}", quote_ident(&table.schema), quote_ident(&table.name))
}

fn column_list<'a>(names: impl Iterator<Item = &'a str>) -> String {
    names.map(quote_ident).collect::<Vec<_>>().join(", ")
}
