//! Catalog of imported tables and the two-state resolution rule.

use crate::durable::DurableStore;
use crate::error::Result;
use crate::models::TableRecord;
use std::sync::Arc;

/// Name of the catalog table in the durable store.
pub const CATALOG_TABLE: &str = "csv_tables";

/// Durable table name for a promoted id.
pub fn destination_table_name(id: &str) -> String {
    format!("csv_{}", id.replace('-', "_"))
}

/// Where queries for a table currently run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Not yet promoted: the id's own DuckDB store
    Ephemeral { id: String, table: String },
    /// Promoted: a table in the durable store
    Durable { table: String },
}

impl From<&TableRecord> for Resolution {
    fn from(record: &TableRecord) -> Self {
        if record.persisted {
            Resolution::Durable {
                table: record.storage_name.clone(),
            }
        } else {
            Resolution::Ephemeral {
                id: record.id.clone(),
                table: record.storage_name.clone(),
            }
        }
    }
}

#[derive(Clone)]
pub struct Catalog {
    store: Arc<dyn DurableStore>,
}

impl Catalog {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    /// The durable store the catalog lives in.
    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub async fn insert(&self, record: &TableRecord) -> Result<()> {
        self.store.insert_record(record).await
    }

    pub async fn get(&self, id: &str) -> Result<TableRecord> {
        self.store.get_record(id).await
    }

    /// Look up `id` and decide which store answers its queries.
    pub async fn resolve(&self, id: &str) -> Result<(TableRecord, Resolution)> {
        let record = self.get(id).await?;
        let resolution = Resolution::from(&record);
        Ok((record, resolution))
    }
}
