//! Table service: import, query and promote by table id.

use crate::catalog::{Catalog, Resolution};
use crate::durable::DurableStore;
use crate::ephemeral::EnginePool;
use crate::error::Result;
use crate::fetch;
use crate::models::TableRecord;
use crate::promote::Promoter;
use crate::query::{self, QueryOutput, QuerySource, QuerySpec};
use futures::Stream;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

pub struct TableService {
    catalog: Catalog,
    pool: Arc<EnginePool>,
    promoter: Promoter,
    http: reqwest::Client,
}

impl TableService {
    pub fn new(store: Arc<dyn DurableStore>, pool: Arc<EnginePool>) -> Self {
        let catalog = Catalog::new(store);
        Self {
            promoter: Promoter::new(catalog.clone(), pool.clone()),
            catalog,
            pool,
            // no timeout: large sources may take as long as they take
            http: reqwest::Client::new(),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn pool(&self) -> &Arc<EnginePool> {
        &self.pool
    }

    /// Import a CSV body under a fresh id.
    pub async fn import_stream<S, B, E>(&self, filename: &str, body: S) -> Result<TableRecord>
    where
        S: Stream<Item = std::result::Result<B, E>>,
        B: AsRef<[u8]>,
        E: std::fmt::Display,
    {
        let id = Uuid::new_v4().to_string();
        self.pool.import(&id, filename, body).await?;

        let record = TableRecord::imported(&id, filename);
        if let Err(e) = self.catalog.insert(&record).await {
            error!(id = %id, "Failed to record import, discarding ephemeral store: {}", e);
            self.pool.discard(&id);
            return Err(e);
        }

        info!(id = %id, filename = %filename, "Imported table");
        Ok(record)
    }

    /// Fetch `url` and import its body.
    pub async fn import_url(&self, url: &str) -> Result<TableRecord> {
        let (filename, body) = fetch::open(&self.http, url).await?;
        self.import_stream(&filename, body).await
    }

    pub async fn record(&self, id: &str) -> Result<TableRecord> {
        self.catalog.get(id).await
    }

    /// Query `id` wherever it currently lives.
    pub async fn query(&self, id: &str, spec: &QuerySpec) -> Result<(TableRecord, QueryOutput)> {
        let (record, resolution) = self.catalog.resolve(id).await?;
        let source = match &resolution {
            Resolution::Ephemeral { id, table } => QuerySource::Ephemeral {
                pool: &self.pool,
                id,
                table,
            },
            Resolution::Durable { table } => QuerySource::Durable {
                store: self.catalog.store().as_ref(),
                table,
            },
        };

        let output = query::execute(source, spec).await?;
        Ok((record, output))
    }

    pub async fn promote(&self, id: &str) -> Result<TableRecord> {
        self.promoter.promote(id).await
    }

    /// Release every engine connection and the durable store.
    pub async fn close(&self) {
        self.pool.close();
        self.catalog.store().close().await;
    }
}
