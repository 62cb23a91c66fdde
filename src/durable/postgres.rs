//! PostgreSQL durable store using sqlx

use super::sqlite::check_row_count;
use super::{DurableStore, PromotionPlan};
use crate::catalog::CATALOG_TABLE;
use crate::ephemeral::ScanMessage;
use crate::error::{ApiError, Result};
use crate::models::TableRecord;
use crate::query::{
    build_select, create_text_table, float_value, insert_statement, text_value, Dialect, QueryOutput,
    QuerySpec,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Executor, Row, Statement, TypeInfo};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect, verify the connection and create the catalog table if needed.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| ApiError::Storage(format!("Failed to open database: {}", e)))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| ApiError::Storage(format!("Database is not reachable: {}", e)))?;

        let store = Self { pool };
        store.init_schema().await?;
        info!("Connected to PostgreSQL durable store");
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                storage_name TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                persisted BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#,
            CATALOG_TABLE
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| ApiError::Storage(format!("Failed to create {}: {}", CATALOG_TABLE, e)))?;
        Ok(())
    }
}

#[async_trait]
impl DurableStore for PostgresStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn insert_record(&self, record: &TableRecord) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (id, filename, storage_name, created_at, persisted) VALUES ($1, $2, $3, $4, FALSE)",
            CATALOG_TABLE
        ))
        .bind(&record.id)
        .bind(&record.filename)
        .bind(&record.storage_name)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| ApiError::Storage(format!("Failed to store CSV reference: {}", e)))?;
        Ok(())
    }

    async fn get_record(&self, id: &str) -> Result<TableRecord> {
        let row = sqlx::query(&format!(
            "SELECT id, filename, storage_name, created_at, persisted FROM {} WHERE id = $1",
            CATALOG_TABLE
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ApiError::Storage(format!("Failed to get CSV table: {}", e)))?
        .ok_or_else(|| ApiError::NotFound(format!("CSV table with ID {} not found", id)))?;

        let decode = |e: sqlx::Error| ApiError::Storage(format!("Failed to decode CSV table: {}", e));
        Ok(TableRecord {
            id: row.try_get("id").map_err(decode)?,
            filename: row.try_get("filename").map_err(decode)?,
            storage_name: row.try_get("storage_name").map_err(decode)?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(decode)?,
            persisted: row.try_get("persisted").map_err(decode)?,
        })
    }

    async fn query_table(&self, table: &str, spec: &QuerySpec) -> Result<QueryOutput> {
        let sql = build_select(Dialect::Postgres, table, spec);
        debug!(sql = %sql, "Querying PostgreSQL durable store");

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| ApiError::Query(format!("Failed to acquire connection: {}", e)))?;

        let started = Instant::now();
        let statement = (&mut *conn)
            .prepare(&sql)
            .await
            .map_err(|e| ApiError::Query(format!("Failed to query data: {}", e)))?;
        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let rows = statement
            .query()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ApiError::Query(format!("Failed to query data: {}", e)))?;

        let mut tuple_rows = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(pg_value_to_json(row, i)?);
            }
            tuple_rows.push(values);
        }

        Ok(QueryOutput::assemble(columns, tuple_rows, started))
    }

    async fn promote(&self, plan: PromotionPlan, mut rows: mpsc::Receiver<ScanMessage>) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ApiError::Persistence(format!("Failed to begin transaction: {}", e)))?;

        // row lock serializes concurrent promotions of the same id
        let persisted: Option<bool> = sqlx::query_scalar(&format!(
            "SELECT persisted FROM {} WHERE id = $1 FOR UPDATE",
            CATALOG_TABLE
        ))
        .bind(&plan.id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| ApiError::Persistence(format!("Failed to read catalog: {}", e)))?;
        match persisted {
            None => {
                return Err(ApiError::NotFound(format!(
                    "CSV table with ID {} not found",
                    plan.id
                )))
            }
            Some(true) => {
                return Err(ApiError::AlreadyPersisted(format!(
                    "Table {} is already persisted",
                    plan.id
                )))
            }
            Some(false) => {}
        }

        sqlx::query(&create_text_table(&plan.destination, &plan.columns))
            .execute(&mut *tx)
            .await
            .map_err(|e| ApiError::Persistence(format!("Failed to create permanent table: {}", e)))?;

        let insert = insert_statement(Dialect::Postgres, &plan.destination, &plan.columns);
        let mut inserted = 0u64;
        loop {
            match rows.recv().await {
                Some(ScanMessage::Batch(batch)) => {
                    for row in batch {
                        let mut query = sqlx::query(&insert);
                        for value in row {
                            query = query.bind(value);
                        }
                        query
                            .execute(&mut *tx)
                            .await
                            .map_err(|e| ApiError::Persistence(format!("Failed to insert data: {}", e)))?;
                        inserted += 1;
                    }
                }
                Some(ScanMessage::Done(expected)) => {
                    check_row_count(expected, inserted)?;
                    break;
                }
                Some(ScanMessage::Failed(e)) => return Err(e),
                None => {
                    return Err(ApiError::Persistence(
                        "Source scan ended without completing".to_string(),
                    ))
                }
            }
        }

        sqlx::query(&format!(
            "UPDATE {} SET persisted = TRUE, storage_name = $1 WHERE id = $2",
            CATALOG_TABLE
        ))
        .bind(&plan.destination)
        .bind(&plan.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            ApiError::Persistence(format!("Failed to update CSV table persistence status: {}", e))
        })?;

        tx.commit()
            .await
            .map_err(|e| ApiError::Persistence(format!("Failed to commit transaction: {}", e)))?;
        Ok(inserted)
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let found: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
            .bind(crate::query::quote_ident(table))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ApiError::Storage(format!("Failed to inspect schema: {}", e)))?;
        Ok(found.is_some())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("Closed PostgreSQL pool");
    }
}

fn pg_value_to_json(row: &PgRow, index: usize) -> Result<Value> {
    let decoded = match row.column(index).type_info().name() {
        "INT8" => row
            .try_get::<Option<i64>, _>(index)
            .map(|v| v.map(Value::from)),
        "INT4" => row
            .try_get::<Option<i32>, _>(index)
            .map(|v| v.map(Value::from)),
        "INT2" => row
            .try_get::<Option<i16>, _>(index)
            .map(|v| v.map(Value::from)),
        "FLOAT8" => row
            .try_get::<Option<f64>, _>(index)
            .map(|v| v.map(float_value)),
        "BOOL" => row
            .try_get::<Option<bool>, _>(index)
            .map(|v| v.map(Value::Bool)),
        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .map(|v| v.map(|b| text_value(&b))),
        _ => row
            .try_get::<Option<String>, _>(index)
            .map(|v| v.map(Value::String)),
    };

    decoded
        .map(|v| v.unwrap_or(Value::Null))
        .map_err(|e| ApiError::Query(format!("Failed to scan row: {}", e)))
}
