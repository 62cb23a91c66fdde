//! Records shared between the catalog, the engine pool and the promoter.

use chrono::{DateTime, Utc};

/// Fixed name of the table every import creates inside its ephemeral store.
pub const EPHEMERAL_TABLE: &str = "csv_data";

/// One imported table as recorded in the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRecord {
    pub id: String,

    /// Original source name (upload name or last URL path segment)
    pub filename: String,

    /// Backing table: `csv_data` in the ephemeral store until promoted,
    /// then the derived table in the durable store
    pub storage_name: String,

    pub created_at: DateTime<Utc>,

    pub persisted: bool,
}

impl TableRecord {
    /// A freshly imported, not yet persisted record.
    pub fn imported(id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            filename: filename.into(),
            storage_name: EPHEMERAL_TABLE.to_string(),
            created_at: Utc::now(),
            persisted: false,
        }
    }
}

/// Column as reported by the ephemeral engine's `PRAGMA table_info`.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    pub cid: i32,
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
}

impl ColumnDescriptor {
    /// Column name with quoting characters stripped, as used in durable tables.
    pub fn sanitized_name(&self) -> String {
        self.name.replace('"', "")
    }
}
