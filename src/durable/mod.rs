//! Durable store: the catalog plus every promoted table.
//!
//! Backends are chosen by database URL. PostgreSQL is the shared store for
//! deployments; SQLite serves single-node setups and tests.

pub mod postgres;
pub mod sqlite;

use crate::ephemeral::ScanMessage;
use crate::error::Result;
use crate::models::TableRecord;
use crate::query::{QueryOutput, QuerySpec};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

/// Everything the durable side needs to migrate one table.
#[derive(Debug, Clone, PartialEq)]
pub struct PromotionPlan {
    pub id: String,

    /// Destination table, unique to `id`
    pub destination: String,

    /// Sanitized column names in source order
    pub columns: Vec<String>,
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Backend name for logs ("sqlite", "postgres")
    fn name(&self) -> &'static str;

    /// Add a catalog record. The record's `persisted` flag is written as false.
    async fn insert_record(&self, record: &TableRecord) -> Result<()>;

    /// Fetch a catalog record, or `NotFound`.
    async fn get_record(&self, id: &str) -> Result<TableRecord>;

    /// Run a page query against a promoted table.
    async fn query_table(&self, table: &str, spec: &QuerySpec) -> Result<QueryOutput>;

    /// Create the destination table, copy every row received on `rows` and
    /// mark the catalog record persisted, all in one transaction.
    ///
    /// Returns the number of rows copied. On any error nothing is committed.
    /// A record that is already persisted when the transaction starts yields
    /// `AlreadyPersisted`.
    async fn promote(&self, plan: PromotionPlan, rows: mpsc::Receiver<ScanMessage>) -> Result<u64>;

    /// Whether a table with this name exists.
    async fn table_exists(&self, table: &str) -> Result<bool>;

    async fn close(&self);
}

/// Open the backend selected by `database_url`.
///
/// `postgres://` and `postgresql://` URLs use PostgreSQL; anything else is a
/// SQLite location (`sqlite:`/`file:` prefixes, a path, or `:memory:`).
pub async fn connect(database_url: &str) -> Result<Arc<dyn DurableStore>> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        Ok(Arc::new(PostgresStore::connect(database_url).await?))
    } else {
        Ok(Arc::new(SqliteStore::open(sqlite_location(database_url))?))
    }
}

fn sqlite_location(database_url: &str) -> &str {
    ["sqlite://", "sqlite:", "file:"]
        .iter()
        .find_map(|prefix| database_url.strip_prefix(prefix))
        .unwrap_or(database_url)
}
