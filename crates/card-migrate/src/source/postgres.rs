//! PostgreSQL source reader.
//!
//! Rows are fetched as JSON with `row_to_json`, so column additions in the
//! source schema never break decoding. Pages are ordered by `id` and read with
//! LIMIT/OFFSET; reads have no side effects and can be restarted at any time.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use tokio::sync::mpsc;
use tracing::debug;

use super::READ_AHEAD_PAGES;
use crate::config::{SourceConfig, SourceTables};
use crate::core::record::decode_rows;
use crate::core::{EntityType, SourceReader, SourceRecord};
use crate::error::{MigrateError, Result};
use crate::postgres::{connect_pool, quote_ident};

const STORE: &str = "source";

/// Relational source on PostgreSQL.
pub struct PgSource {
    pool: Pool,
    schema: String,
    tables: SourceTables,
}

impl PgSource {
    /// Connect to the source database.
    pub async fn connect(config: &SourceConfig, tables: SourceTables, max_conns: usize) -> Result<Self> {
        let pool = connect_pool(STORE, &config.url, &config.ssl_mode, max_conns).await?;
        Ok(Self {
            pool,
            schema: config.schema.clone(),
            tables,
        })
    }

    fn table_ref(&self, entity: EntityType) -> String {
        format!(
            "{}.{}",
            quote_ident(&self.schema),
            quote_ident(self.tables.table_for(entity))
        )
    }
}

#[async_trait]
impl SourceReader for PgSource {
    fn read_all(&self, entity: EntityType, page_size: usize) -> mpsc::Receiver<Result<Vec<SourceRecord>>> {
        let (tx, rx) = mpsc::channel(READ_AHEAD_PAGES);
        let pool = self.pool.clone();
        let sql = format!(
            "SELECT row_to_json(t) FROM (SELECT * FROM {} ORDER BY id LIMIT $1 OFFSET $2) t",
            self.table_ref(entity)
        );

        tokio::spawn(async move {
            if let Err(e) = read_pages(pool, entity, sql, page_size, tx.clone()).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        rx
    }

    async fn count(&self, entity: EntityType) -> Result<i64> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "getting connection for source count"))?;
        let sql = format!("SELECT COUNT(*) FROM {}", self.table_ref(entity));
        let row = client
            .query_one(&sql, &[])
            .await
            .map_err(|e| MigrateError::connector(STORE, e))?;
        Ok(row.get(0))
    }

    async fn ping(&self) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "getting connection for source ping"))?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| MigrateError::connector(STORE, e))?;
        Ok(())
    }

    fn store_name(&self) -> &str {
        STORE
    }
}

async fn read_pages(
    pool: Pool,
    entity: EntityType,
    sql: String,
    page_size: usize,
    tx: mpsc::Sender<Result<Vec<SourceRecord>>>,
) -> Result<()> {
    let client = pool
        .get()
        .await
        .map_err(|e| MigrateError::pool(e, "getting connection for read_all"))?;
    let statement = client
        .prepare(&sql)
        .await
        .map_err(|e| MigrateError::connector(STORE, e))?;

    let limit = page_size as i64;
    let mut offset: i64 = 0;
    loop {
        let rows = client
            .query(&statement, &[&limit, &offset])
            .await
            .map_err(|e| MigrateError::connector(STORE, e))?;
        let fetched = rows.len();

        let values = rows
            .iter()
            .map(|row| row.try_get::<_, serde_json::Value>(0))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| MigrateError::connector(STORE, e))?;
        let page = decode_rows(entity, values)?;

        debug!("{}: read {} rows at offset {}", entity, fetched, offset);
        if !page.is_empty() && tx.send(Ok(page)).await.is_err() {
            // Consumer went away (cancelled or failed).
            return Ok(());
        }
        if fetched < page_size {
            return Ok(());
        }
        offset += limit;
    }
}
