//! SQLite durable store
//!
//! One connection guarded by a mutex; all work runs on blocking threads.
//! Promotion holds the connection for the whole transaction and starts it
//! with `BEGIN IMMEDIATE` so the persisted check and the catalog update see
//! the same state.

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
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `location`; `:memory:` opens a
    /// private in-memory database.
    pub fn open(location: &str) -> Result<Self> {
        let conn = if location == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(location)
        }
        .map_err(|e| ApiError::Storage(format!("Failed to open database: {}", e)))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        info!(location = %location, "Opened SQLite durable store");
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    filename TEXT NOT NULL,
                    storage_name TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    persisted BOOLEAN NOT NULL DEFAULT 0
                )
                "#,
                CATALOG_TABLE
            ),
            [],
        )
        .map_err(|e| ApiError::Storage(format!("Failed to create {}: {}", CATALOG_TABLE, e)))?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| ApiError::Storage(format!("SQLite task failed: {}", e)))?
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn insert_record(&self, record: &TableRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {} (id, filename, storage_name, created_at, persisted) VALUES (?1, ?2, ?3, ?4, 0)",
                    CATALOG_TABLE
                ),
                params![
                    record.id,
                    record.filename,
                    record.storage_name,
                    record.created_at.to_rfc3339()
                ],
            )
            .map_err(|e| ApiError::Storage(format!("Failed to store CSV reference: {}", e)))?;
            Ok(())
        })
        .await
    }

    async fn get_record(&self, id: &str) -> Result<TableRecord> {
        let id = id.to_string();
        self.with_conn(move |conn| read_record(conn, &id)).await
    }

    async fn query_table(&self, table: &str, spec: &QuerySpec) -> Result<QueryOutput> {
        let sql = build_select(Dialect::Sqlite, table, spec);
        debug!(sql = %sql, "Querying SQLite durable store");

        self.with_conn(move |conn| {
            let started = Instant::now();
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| ApiError::Query(format!("Failed to query data: {}", e)))?;
            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

            let mut rows = stmt
                .query([])
                .map_err(|e| ApiError::Query(format!("Failed to query data: {}", e)))?;
            let mut tuple_rows = Vec::new();
            while let Some(row) = rows
                .next()
                .map_err(|e| ApiError::Query(format!("Error iterating rows: {}", e)))?
            {
                let mut values = Vec::with_capacity(columns.len());
                for i in 0..columns.len() {
                    let value = row
                        .get_ref(i)
                        .map_err(|e| ApiError::Query(format!("Failed to scan row: {}", e)))?;
                    values.push(sqlite_value_to_json(value));
                }
                tuple_rows.push(values);
            }

            Ok(QueryOutput::assemble(columns, tuple_rows, started))
        })
        .await
    }

    async fn promote(&self, plan: PromotionPlan, mut rows: mpsc::Receiver<ScanMessage>) -> Result<u64> {
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| ApiError::Persistence(format!("Failed to begin transaction: {}", e)))?;

            let persisted: Option<bool> = tx
                .query_row(
                    &format!("SELECT persisted FROM {} WHERE id = ?1", CATALOG_TABLE),
                    [&plan.id],
                    |row| row.get(0),
                )
                .optional()
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

            tx.execute_batch(&create_text_table(&plan.destination, &plan.columns))
                .map_err(|e| ApiError::Persistence(format!("Failed to create permanent table: {}", e)))?;

            let mut inserted = 0u64;
            {
                let mut stmt = tx
                    .prepare(&insert_statement(Dialect::Sqlite, &plan.destination, &plan.columns))
                    .map_err(|e| {
                        ApiError::Persistence(format!("Failed to prepare insert statement: {}", e))
                    })?;

                loop {
                    match rows.blocking_recv() {
                        Some(ScanMessage::Batch(batch)) => {
                            for row in batch {
                                stmt.execute(params_from_iter(row.iter())).map_err(|e| {
                                    ApiError::Persistence(format!("Failed to insert data: {}", e))
                                })?;
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
            }

            tx.execute(
                &format!(
                    "UPDATE {} SET persisted = 1, storage_name = ?1 WHERE id = ?2",
                    CATALOG_TABLE
                ),
                params![plan.destination, plan.id],
            )
            .map_err(|e| {
                ApiError::Persistence(format!("Failed to update CSV table persistence status: {}", e))
            })?;

            tx.commit()
                .map_err(|e| ApiError::Persistence(format!("Failed to commit transaction: {}", e)))?;
            Ok(inserted)
        })
        .await
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let table = table.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [&table],
                    |row| row.get(0),
                )
                .map_err(|e| ApiError::Storage(format!("Failed to inspect schema: {}", e)))?;
            Ok(count > 0)
        })
        .await
    }

    async fn close(&self) {
        // the connection closes when the last handle drops
        debug!("SQLite durable store released");
    }
}

pub(crate) fn check_row_count(expected: usize, inserted: u64) -> Result<()> {
    if expected as u64 == inserted {
        Ok(())
    } else {
        Err(ApiError::Persistence(format!(
            "Copied {} rows but the source produced {}",
            inserted, expected
        )))
    }
}

fn read_record(conn: &Connection, id: &str) -> Result<TableRecord> {
    let row = conn
        .query_row(
            &format!(
                "SELECT id, filename, storage_name, created_at, persisted FROM {} WHERE id = ?1",
                CATALOG_TABLE
            ),
            [id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            },
        )
        .optional()
        .map_err(|e| ApiError::Storage(format!("Failed to get CSV table: {}", e)))?;

    let Some((id, filename, storage_name, created_at, persisted)) = row else {
        return Err(ApiError::NotFound(format!("CSV table with ID {} not found", id)));
    };
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| ApiError::Storage(format!("Invalid created_at for {}: {}", id, e)))?
        .with_timezone(&Utc);

    Ok(TableRecord {
        id,
        filename,
        storage_name,
        created_at,
        persisted,
    })
}

fn sqlite_value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => float_value(f),
        ValueRef::Text(s) | ValueRef::Blob(s) => text_value(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(id: &str) -> PromotionPlan {
        PromotionPlan {
            id: id.to_string(),
            destination: crate::catalog::destination_table_name(id),
            columns: vec!["a".to_string(), "b".to_string()],
        }
    }

    #[tokio::test]
    async fn test_record_roundtrip() {
        let store = SqliteStore::open(":memory:").unwrap();
        let record = TableRecord::imported("r-1", "r.csv");
        store.insert_record(&record).await.unwrap();

        let stored = store.get_record("r-1").await.unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_storage_error() {
        let store = SqliteStore::open(":memory:").unwrap();
        let record = TableRecord::imported("r-1", "r.csv");
        store.insert_record(&record).await.unwrap();
        assert!(matches!(
            store.insert_record(&record).await,
            Err(ApiError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_promote_commits_rows_and_catalog() {
        let store = SqliteStore::open(":memory:").unwrap();
        store.insert_record(&TableRecord::imported("p-1", "p.csv")).await.unwrap();

        let (tx, rx) = mpsc::channel(4);
        tx.send(ScanMessage::Batch(vec![
            vec![Some("1".to_string()), None],
            vec![Some("2".to_string()), Some("two".to_string())],
        ]))
        .await
        .unwrap();
        tx.send(ScanMessage::Done(2)).await.unwrap();
        drop(tx);

        assert_eq!(store.promote(plan("p-1"), rx).await.unwrap(), 2);

        let record = store.get_record("p-1").await.unwrap();
        assert!(record.persisted);
        assert_eq!(record.storage_name, "csv_p_1");

        let spec = QuerySpec::default();
        let output = store.query_table("csv_p_1", &spec).await.unwrap();
        assert_eq!(output.columns, vec!["rowid", "a", "b"]);
        assert_eq!(output.tuple_rows[0], vec![Value::from(1), Value::from("1"), Value::Null]);
    }

    #[tokio::test]
    async fn test_failed_scan_rolls_back() {
        let store = SqliteStore::open(":memory:").unwrap();
        store.insert_record(&TableRecord::imported("p-2", "p.csv")).await.unwrap();

        let (tx, rx) = mpsc::channel(4);
        tx.send(ScanMessage::Batch(vec![vec![Some("1".to_string()), None]]))
            .await
            .unwrap();
        tx.send(ScanMessage::Failed(ApiError::Persistence("scan broke".to_string())))
            .await
            .unwrap();
        drop(tx);

        assert!(matches!(
            store.promote(plan("p-2"), rx).await,
            Err(ApiError::Persistence(_))
        ));
        assert!(!store.get_record("p-2").await.unwrap().persisted);
        assert!(!store.table_exists("csv_p_2").await.unwrap());
    }

    #[tokio::test]
    async fn test_truncated_scan_rolls_back() {
        let store = SqliteStore::open(":memory:").unwrap();
        store.insert_record(&TableRecord::imported("p-3", "p.csv")).await.unwrap();

        let (tx, rx) = mpsc::channel(4);
        tx.send(ScanMessage::Batch(vec![vec![Some("1".to_string()), None]]))
            .await
            .unwrap();
        // producer vanished without Done
        drop(tx);

        assert!(store.promote(plan("p-3"), rx).await.is_err());
        assert!(!store.get_record("p-3").await.unwrap().persisted);
        assert!(!store.table_exists("csv_p_3").await.unwrap());
    }

    #[tokio::test]
    async fn test_promote_rejects_persisted_record() {
        let store = SqliteStore::open(":memory:").unwrap();
        store.insert_record(&TableRecord::imported("p-4", "p.csv")).await.unwrap();

        let (tx, rx) = mpsc::channel(1);
        tx.send(ScanMessage::Done(0)).await.unwrap();
        store.promote(plan("p-4"), rx).await.unwrap();

        let (_tx, rx) = mpsc::channel(1);
        assert!(matches!(
            store.promote(plan("p-4"), rx).await,
            Err(ApiError::AlreadyPersisted(_))
        ));
    }
}
