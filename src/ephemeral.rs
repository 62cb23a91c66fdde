//! Ephemeral engine pool
//!
//! Every imported table lives in its own DuckDB database file named after the
//! table id. Connections are opened lazily on first use and cached for the
//! lifetime of the process, so heavy scans against one table never contend
//! with another table's connection.
//!
//! The registry is a [`DashMap`]; first access goes through the entry API so
//! that concurrent callers for the same id always receive the same
//! connection. Each connection sits behind its own mutex, which serializes
//! queries against a single id.

use crate::error::{ApiError, Result};
use crate::models::{ColumnDescriptor, EPHEMERAL_TABLE};
use crate::query::{build_select, float_value, quote_ident, text_value, Dialect, QueryOutput, QuerySpec};
use chrono::{DateTime, NaiveDate, NaiveTime};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use duckdb::types::{TimeUnit, ValueRef};
use duckdb::Connection;
use futures::{Stream, StreamExt};
use itertools::Itertools;
use parking_lot::Mutex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared handle to one table's DuckDB connection.
pub type EngineHandle = Arc<Mutex<Connection>>;

/// A row of a full-table scan with every value rendered as text.
pub type TextRow = Vec<Option<String>>;

/// Messages flowing from a table scan to the promotion transaction.
///
/// A scan always ends with `Done` or `Failed`; a channel that closes without
/// either means the producer died and the receiver must not commit.
#[derive(Debug)]
pub enum ScanMessage {
    Batch(Vec<TextRow>),
    Done(usize),
    Failed(ApiError),
}

/// Rows per batch sent to the promotion sink.
pub const SCAN_BATCH_SIZE: usize = 512;

pub struct EnginePool {
    data_dir: PathBuf,
    connections: DashMap<String, EngineHandle>,
}

impl EnginePool {
    /// Create a pool whose database files live under `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(data_dir.join("staging")).map_err(|e| {
            ApiError::Storage(format!(
                "Failed to create data directory {}: {}",
                data_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            data_dir,
            connections: DashMap::new(),
        })
    }

    /// Database file backing `id`.
    pub fn database_path(&self, id: &str) -> PathBuf {
        self.data_dir.join(format!("{}.db", id))
    }

    fn staging_path(&self, id: &str) -> PathBuf {
        self.data_dir.join("staging").join(format!("{}.csv", id))
    }

    /// Number of cached connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Return the cached connection for `id`, opening it on first access.
    ///
    /// Open failures are returned and not cached; the next call retries.
    pub fn connection_for(&self, id: &str) -> Result<EngineHandle> {
        validate_id(id)?;

        match self.connections.entry(id.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let path = self.database_path(id);
                let conn = Connection::open(&path).map_err(|e| {
                    ApiError::Storage(format!("Failed to open DuckDB connection: {}", e))
                })?;
                debug!(id = %id, path = %path.display(), "Opened ephemeral store");
                let handle = Arc::new(Mutex::new(conn));
                entry.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    /// Stage `body` to disk and bulk-load it into `id`'s store as the fixed
    /// ephemeral table.
    ///
    /// DuckDB infers delimiters and column types. Malformed rows are diverted
    /// to its reject tables instead of failing the load. On failure the
    /// connection and database file for `id` are discarded.
    pub async fn import<S, B, E>(&self, id: &str, filename: &str, body: S) -> Result<()>
    where
        S: Stream<Item = std::result::Result<B, E>>,
        B: AsRef<[u8]>,
        E: std::fmt::Display,
    {
        validate_id(id)?;
        let staging = self.staging_path(id);

        let result = match stage(&staging, body).await {
            Ok(bytes) => {
                debug!(id = %id, filename = %filename, bytes, "Staged CSV upload");
                self.load_staged(id, &staging).await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = tokio::fs::remove_file(&staging).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %staging.display(), "Failed to remove staging file: {}", e);
            }
        }

        if result.is_err() {
            self.discard(id);
        }

        result
    }

    async fn load_staged(&self, id: &str, staging: &Path) -> Result<()> {
        let handle = self.connection_for(id)?;
        let sql = format!(
            "CREATE TABLE {} AS SELECT * FROM read_csv_auto({}, auto_detect = true, strict_mode = false, store_rejects = true)",
            quote_ident(EPHEMERAL_TABLE),
            quote_literal(&staging.to_string_lossy()),
        );
        let id = id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = handle.lock();
            conn.execute_batch(&sql)
                .map_err(|e| ApiError::Import(format!("Failed to import CSV into DuckDB: {}", e)))?;

            match conn.query_row("SELECT count(*) FROM reject_errors", [], |row| row.get::<_, i64>(0)) {
                Ok(0) => {}
                Ok(rejected) => warn!(id = %id, rejected, "CSV import skipped malformed rows"),
                Err(e) => debug!(id = %id, "Could not read reject table: {}", e),
            }
            info!(id = %id, "Imported CSV into ephemeral store");
            Ok(())
        })
        .await
        .map_err(|e| ApiError::Import(format!("Import task failed: {}", e)))?
    }

    /// Drop the connection for `id` and delete its database files.
    pub(crate) fn discard(&self, id: &str) {
        self.connections.remove(id);
        let path = self.database_path(id);
        for file in [path.clone(), path.with_extension("db.wal")] {
            if let Err(e) = std::fs::remove_file(&file) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %file.display(), "Failed to remove ephemeral store: {}", e);
                }
            }
        }
    }

    /// Run a page query against `table` in `id`'s store.
    pub async fn query(&self, id: &str, table: &str, spec: &QuerySpec) -> Result<QueryOutput> {
        let handle = self.connection_for(id)?;
        let sql = build_select(Dialect::DuckDb, table, spec);
        debug!(id = %id, sql = %sql, "Querying ephemeral store");

        tokio::task::spawn_blocking(move || {
            let conn = handle.lock();
            let started = Instant::now();
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| ApiError::Query(format!("Failed to query data: {}", e)))?;
            let mut rows = stmt
                .query([])
                .map_err(|e| ApiError::Query(format!("Failed to query data: {}", e)))?;
            let column_count = rows.as_ref().map(|s| s.column_count()).unwrap_or(0);

            let mut tuple_rows = Vec::new();
            while let Some(row) = rows
                .next()
                .map_err(|e| ApiError::Query(format!("Error iterating rows: {}", e)))?
            {
                let mut values = Vec::with_capacity(column_count);
                for i in 0..column_count {
                    let value = row
                        .get_ref(i)
                        .map_err(|e| ApiError::Query(format!("Failed to scan row: {}", e)))?;
                    values.push(duckdb_value_to_json(value));
                }
                tuple_rows.push(values);
            }
            drop(rows);

            let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
            Ok(QueryOutput::assemble(columns, tuple_rows, started))
        })
        .await
        .map_err(|e| ApiError::Query(format!("Query task failed: {}", e)))?
    }

    /// Column list of `table` via `PRAGMA table_info`.
    pub async fn describe(&self, id: &str, table: &str) -> Result<Vec<ColumnDescriptor>> {
        let handle = self.connection_for(id)?;
        let sql = format!("PRAGMA table_info({})", quote_literal(table));

        tokio::task::spawn_blocking(move || {
            let conn = handle.lock();
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| ApiError::Persistence(format!("Failed to get table info: {}", e)))?;
            let columns = stmt
                .query_map([], |row| {
                    Ok(ColumnDescriptor {
                        cid: row.get(0)?,
                        name: row.get(1)?,
                        data_type: row.get(2)?,
                        not_null: row.get(3)?,
                        default_value: row.get(4)?,
                        primary_key: row.get(5)?,
                    })
                })
                .map_err(|e| ApiError::Persistence(format!("Failed to get table info: {}", e)))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| ApiError::Persistence(format!("Failed to scan column info: {}", e)))?;
            Ok(columns)
        })
        .await
        .map_err(|e| ApiError::Persistence(format!("Describe task failed: {}", e)))?
    }

    /// Scan every row of `table`, casting each value to text, and push them
    /// to `sink` as [`ScanMessage::Batch`]es. Blocking; run it off the async
    /// runtime. The caller sends the terminating message.
    ///
    /// Returns the number of rows sent.
    pub fn stream_rows(
        &self,
        id: &str,
        table: &str,
        columns: &[ColumnDescriptor],
        sink: &mpsc::Sender<ScanMessage>,
    ) -> Result<usize> {
        let handle = self.connection_for(id)?;
        let select_list = columns
            .iter()
            .map(|c| format!("CAST({} AS VARCHAR)", quote_ident(&c.name)))
            .join(", ");
        let sql = format!("SELECT {} FROM {}", select_list, quote_ident(table));

        let conn = handle.lock();
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| ApiError::Persistence(format!("Failed to query DuckDB data: {}", e)))?;
        let mut rows = stmt
            .query([])
            .map_err(|e| ApiError::Persistence(format!("Failed to query DuckDB data: {}", e)))?;

        let mut sent = 0;
        let mut batch = Vec::with_capacity(SCAN_BATCH_SIZE);
        while let Some(row) = rows
            .next()
            .map_err(|e| ApiError::Persistence(format!("Error iterating data rows: {}", e)))?
        {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                let value: Option<String> = row
                    .get(i)
                    .map_err(|e| ApiError::Persistence(format!("Failed to scan data row: {}", e)))?;
                values.push(value);
            }
            batch.push(values);

            if batch.len() == SCAN_BATCH_SIZE {
                sent += batch.len();
                send_batch(sink, std::mem::take(&mut batch))?;
            }
        }
        if !batch.is_empty() {
            sent += batch.len();
            send_batch(sink, batch)?;
        }

        Ok(sent)
    }

    /// Close every cached connection. Used once at shutdown.
    pub fn close(&self) {
        let ids: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for id in ids {
            let Some((id, handle)) = self.connections.remove(&id) else {
                continue;
            };
            match Arc::try_unwrap(handle) {
                Ok(conn) => match conn.into_inner().close() {
                    Ok(()) => closed += 1,
                    Err((_, e)) => error!(id = %id, "Error closing DuckDB connection: {}", e),
                },
                Err(_) => warn!(id = %id, "DuckDB connection still in use at shutdown"),
            }
        }
        info!(closed, "Closed ephemeral stores");
    }
}

fn send_batch(sink: &mpsc::Sender<ScanMessage>, batch: Vec<TextRow>) -> Result<()> {
    sink.blocking_send(ScanMessage::Batch(batch))
        .map_err(|_| ApiError::Persistence("Destination stopped receiving rows".to_string()))
}

/// Ids name files on disk, so only a conservative alphabet is accepted.
fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("Invalid table id: {}", id)))
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Write `body` to `path`, returning the number of bytes written.
async fn stage<S, B, E>(path: &Path, body: S) -> Result<u64>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| ApiError::Import(format!("Failed to create temp file: {}", e)))?;

    let mut body = std::pin::pin!(body);
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| ApiError::Import(format!("Failed to read CSV data: {}", e)))?;
        let bytes = chunk.as_ref();
        file.write_all(bytes)
            .await
            .map_err(|e| ApiError::Import(format!("Failed to write CSV data: {}", e)))?;
        written += bytes.len() as u64;
    }
    file.flush()
        .await
        .map_err(|e| ApiError::Import(format!("Failed to write CSV data: {}", e)))?;

    Ok(written)
}

fn micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

/// Convert a DuckDB value to JSON. Temporal values become ISO-8601 text.
fn duckdb_value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(i) => Value::from(i),
        ValueRef::SmallInt(i) => Value::from(i),
        ValueRef::Int(i) => Value::from(i),
        ValueRef::BigInt(i) => Value::from(i),
        ValueRef::HugeInt(i) => match i64::try_from(i) {
            Ok(n) => Value::from(n),
            Err(_) => Value::String(i.to_string()),
        },
        ValueRef::UTinyInt(i) => Value::from(i),
        ValueRef::USmallInt(i) => Value::from(i),
        ValueRef::UInt(i) => Value::from(i),
        ValueRef::UBigInt(i) => Value::from(i),
        ValueRef::Float(f) => float_value(f as f64),
        ValueRef::Double(f) => float_value(f),
        ValueRef::Decimal(d) => {
            let text = d.to_string();
            text.parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::String(text))
        }
        ValueRef::Text(s) | ValueRef::Blob(s) => text_value(s),
        ValueRef::Date32(days) => NaiveDate::from_num_days_from_ce_opt(days + 719_163)
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null),
        ValueRef::Time64(unit, v) => {
            let us = micros(unit, v);
            NaiveTime::from_num_seconds_from_midnight_opt(
                (us / 1_000_000) as u32,
                ((us % 1_000_000) * 1_000) as u32,
            )
            .map(|t| Value::String(t.format("%H:%M:%S%.f").to_string()))
            .unwrap_or(Value::Null)
        }
        ValueRef::Timestamp(unit, v) => DateTime::from_timestamp_micros(micros(unit, v))
            .map(|ts| Value::String(ts.naive_utc().format("%Y-%m-%d %H:%M:%S%.f").to_string()))
            .unwrap_or(Value::Null),
        other => Value::String(format!("{:?}", other)),
    }
}
