//! Promotion of an ephemeral table into the durable store.
//!
//! The ephemeral side is only read: its schema is described up front, then a
//! blocking producer scans every row (values cast to text by DuckDB) into a
//! bounded channel. The durable side consumes that channel inside a single
//! transaction that also flips the catalog record, so either the whole table
//! and the catalog change land together or nothing does.

use crate::catalog::{destination_table_name, Catalog};
use crate::durable::PromotionPlan;
use crate::ephemeral::{EnginePool, ScanMessage};
use crate::error::{ApiError, Result};
use crate::models::TableRecord;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

/// Batches buffered between the scan and the destination.
const CHANNEL_DEPTH: usize = 8;

/// Drops the per-id gate from the map once no caller holds it, including
/// when a promotion future is cancelled.
struct GateRelease<'a> {
    gate: Arc<Mutex<()>>,
    in_flight: &'a DashMap<String, Arc<Mutex<()>>>,
    id: &'a str,
}

impl Drop for GateRelease<'_> {
    fn drop(&mut self) {
        // map + this caller
        self.in_flight
            .remove_if(self.id, |_, held| Arc::strong_count(held) <= 2);
    }
}

#[derive(Clone)]
pub struct Promoter {
    catalog: Catalog,
    pool: Arc<EnginePool>,
    // One promotion per id at a time: two scans of the same table would
    // contend for its single engine connection.
    in_flight: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl Promoter {
    pub fn new(catalog: Catalog, pool: Arc<EnginePool>) -> Self {
        Self {
            catalog,
            pool,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Migrate `id` to the durable store and return its updated record.
    ///
    /// Fails with `AlreadyPersisted` if the table was promoted before,
    /// including by a concurrent call that committed first.
    pub async fn promote(&self, id: &str) -> Result<TableRecord> {
        let release = GateRelease {
            gate: self.in_flight.entry(id.to_string()).or_default().clone(),
            in_flight: &self.in_flight,
            id,
        };
        let _guard = release.gate.lock().await;
        self.promote_exclusive(id).await
    }

    async fn promote_exclusive(&self, id: &str) -> Result<TableRecord> {
        let record = self.catalog.get(id).await?;
        if record.persisted {
            return Err(ApiError::AlreadyPersisted(format!(
                "Table {} is already persisted",
                id
            )));
        }

        let columns = self.pool.describe(id, &record.storage_name).await?;
        if columns.is_empty() {
            return Err(ApiError::Persistence(format!(
                "Table {} has no columns to persist",
                id
            )));
        }

        let plan = PromotionPlan {
            id: id.to_string(),
            destination: destination_table_name(id),
            columns: columns.iter().map(|c| c.sanitized_name()).collect(),
        };
        let destination = plan.destination.clone();

        let (sender, receiver) = mpsc::channel(CHANNEL_DEPTH);
        let producer = {
            let pool = self.pool.clone();
            let id = id.to_string();
            let table = record.storage_name.clone();
            tokio::task::spawn_blocking(move || {
                let message = match pool.stream_rows(&id, &table, &columns, &sender) {
                    Ok(count) => ScanMessage::Done(count),
                    Err(e) => ScanMessage::Failed(e),
                };
                // receiver gone means the transaction already failed
                let _ = sender.blocking_send(message);
            })
        };

        let store = self.catalog.store();
        let outcome = store.promote(plan, receiver).await;
        if let Err(e) = producer.await {
            warn!(id = %id, "Row producer did not finish cleanly: {}", e);
        }

        match outcome {
            Ok(rows) => {
                info!(id = %id, table = %destination, rows, store = store.name(), "Persisted table");
                self.catalog.get(id).await
            }
            Err(e) => {
                if !matches!(e, ApiError::AlreadyPersisted(_)) {
                    warn!(id = %id, "Promotion rolled back: {}", e);
                }
                Err(e)
            }
        }
    }
}
