//! PostgreSQL document store.
//!
//! Each collection is a table in the target schema:
//!
//! ```sql
//! id          UUID PRIMARY KEY
//! natural_key TEXT NOT NULL UNIQUE
//! source_id   TEXT UNIQUE
//! doc         JSONB NOT NULL
//! ```
//!
//! Integrity and data rejections raised by the database (SQLSTATE classes 22
//! and 23) are per-record [`MigrateError::Constraint`] errors; every other
//! failure is a fatal connector error.

use std::collections::HashMap;

use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use serde_json::Value;
use tokio_postgres::Row;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TargetConfig;
use crate::core::{BulkInsertOutcome, Document, DocumentWrite, EntityType, StoredDocument, TargetStore};
use crate::error::{MigrateError, Result};
use crate::postgres::{connect_pool, quote_ident};

const STORE: &str = "target";

/// Document-oriented target modelled as JSONB collections in PostgreSQL.
pub struct PgDocumentStore {
    pool: Pool,
    schema: String,
}

impl PgDocumentStore {
    /// Connect to the target database.
    pub async fn connect(config: &TargetConfig, max_conns: usize) -> Result<Self> {
        let pool = connect_pool(STORE, &config.url, &config.ssl_mode, max_conns).await?;
        Ok(Self {
            pool,
            schema: config.schema.clone(),
        })
    }

    /// The underlying pool, shared with the run marker backend.
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    fn collection_ref(&self, entity: EntityType) -> String {
        format!(
            "{}.{}",
            quote_ident(&self.schema),
            quote_ident(entity.collection())
        )
    }

    async fn client(&self, context: &str) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, context.to_string()))
    }

    async fn insert_one(
        &self,
        client: &Object,
        entity: EntityType,
        doc: &DocumentWrite,
    ) -> Result<String> {
        let id = Uuid::new_v4();
        let sql = format!(
            "INSERT INTO {} (id, natural_key, source_id, doc) VALUES ($1, $2, $3, $4)",
            self.collection_ref(entity)
        );
        let body = Value::Object(doc.body.clone());
        client
            .execute(&sql, &[&id, &doc.natural_key, &doc.source_id, &body])
            .await
            .map_err(|e| classify(entity, &doc.natural_key, e))?;
        Ok(id.to_string())
    }
}

#[async_trait]
impl TargetStore for PgDocumentStore {
    async fn ensure_collections(&self) -> Result<()> {
        let client = self.client("getting connection for ensure_collections").await?;
        client
            .execute(
                &format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&self.schema)),
                &[],
            )
            .await
            .map_err(|e| MigrateError::connector(STORE, e))?;

        for entity in EntityType::ALL {
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id UUID PRIMARY KEY,
                    natural_key TEXT NOT NULL UNIQUE,
                    source_id TEXT UNIQUE,
                    doc JSONB NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                self.collection_ref(entity)
            );
            client
                .execute(&sql, &[])
                .await
                .map_err(|e| MigrateError::connector(STORE, e))?;
        }

        info!("Target collections ready in schema {}", self.schema);
        Ok(())
    }

    async fn find_by_natural_key(&self, entity: EntityType, key: &str) -> Result<Option<StoredDocument>> {
        let client = self.client("getting connection for find_by_natural_key").await?;
        let sql = format!(
            "SELECT id, natural_key, source_id, doc FROM {} WHERE natural_key = $1",
            self.collection_ref(entity)
        );
        let row = client
            .query_opt(&sql, &[&key])
            .await
            .map_err(|e| MigrateError::connector(STORE, e))?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn find_by_source_id(&self, entity: EntityType, source_id: &str) -> Result<Option<StoredDocument>> {
        let client = self.client("getting connection for find_by_source_id").await?;
        let sql = format!(
            "SELECT id, natural_key, source_id, doc FROM {} WHERE source_id = $1",
            self.collection_ref(entity)
        );
        let row = client
            .query_opt(&sql, &[&source_id])
            .await
            .map_err(|e| MigrateError::connector(STORE, e))?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn find_existing_source_ids(
        &self,
        entity: EntityType,
        source_ids: &[String],
    ) -> Result<HashMap<String, StoredDocument>> {
        if source_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let client = self.client("getting connection for find_existing_source_ids").await?;
        let sql = format!(
            "SELECT id, natural_key, source_id, doc FROM {} WHERE source_id = ANY($1)",
            self.collection_ref(entity)
        );
        let ids: Vec<String> = source_ids.to_vec();
        let rows = client
            .query(&sql, &[&ids])
            .await
            .map_err(|e| MigrateError::connector(STORE, e))?;

        let mut found = HashMap::with_capacity(rows.len());
        for row in &rows {
            let doc = row_to_document(row)?;
            if let Some(sid) = doc.source_id.clone() {
                found.insert(sid, doc);
            }
        }
        Ok(found)
    }

    async fn insert(&self, entity: EntityType, doc: &DocumentWrite) -> Result<String> {
        let client = self.client("getting connection for insert").await?;
        self.insert_one(&client, entity, doc).await
    }

    async fn update_by_id(&self, entity: EntityType, id: &str, doc: &DocumentWrite) -> Result<()> {
        let uuid = Uuid::parse_str(id).map_err(|e| {
            MigrateError::constraint(entity.as_str(), &doc.natural_key, format!("invalid target id '{}': {}", id, e))
        })?;
        let client = self.client("getting connection for update_by_id").await?;
        let sql = format!(
            "UPDATE {} SET natural_key = $2, source_id = $3, doc = $4, updated_at = NOW() WHERE id = $1",
            self.collection_ref(entity)
        );
        let body = Value::Object(doc.body.clone());
        let updated = client
            .execute(&sql, &[&uuid, &doc.natural_key, &doc.source_id, &body])
            .await
            .map_err(|e| classify(entity, &doc.natural_key, e))?;
        if updated == 0 {
            return Err(MigrateError::constraint(
                entity.as_str(),
                &doc.natural_key,
                format!("document {} no longer exists", id),
            ));
        }
        Ok(())
    }

    async fn bulk_insert(&self, entity: EntityType, docs: &[DocumentWrite]) -> Result<BulkInsertOutcome> {
        if docs.is_empty() {
            return Ok(BulkInsertOutcome::default());
        }
        let mut client = self.client("getting connection for bulk_insert").await?;

        let ids: Vec<Uuid> = docs.iter().map(|_| Uuid::new_v4()).collect();
        let keys: Vec<String> = docs.iter().map(|d| d.natural_key.clone()).collect();
        let source_ids: Vec<Option<String>> = docs.iter().map(|d| d.source_id.clone()).collect();
        let bodies: Vec<Value> = docs.iter().map(|d| Value::Object(d.body.clone())).collect();
        let sql = format!(
            "INSERT INTO {} (id, natural_key, source_id, doc)
             SELECT * FROM UNNEST($1::uuid[], $2::text[], $3::text[], $4::jsonb[])",
            self.collection_ref(entity)
        );

        // One statement for the whole chunk; fall back to row-by-row when the
        // database rejects any of its rows.
        let tx = client
            .transaction()
            .await
            .map_err(|e| MigrateError::connector(STORE, e))?;
        match tx.execute(&sql, &[&ids, &keys, &source_ids, &bodies]).await {
            Ok(_) => {
                tx.commit().await.map_err(|e| MigrateError::connector(STORE, e))?;
                return Ok(BulkInsertOutcome {
                    inserted: ids
                        .iter()
                        .enumerate()
                        .map(|(i, id)| (i, id.to_string()))
                        .collect(),
                    errors: Vec::new(),
                });
            }
            Err(e) => {
                let err = classify(entity, "<chunk>", e);
                if err.is_fatal() {
                    return Err(err);
                }
                tx.rollback().await.map_err(|e| MigrateError::connector(STORE, e))?;
                warn!(
                    "{}: bulk insert of {} documents rejected ({}), retrying row by row",
                    entity,
                    docs.len(),
                    err
                );
            }
        }

        let mut outcome = BulkInsertOutcome::default();
        for (i, doc) in docs.iter().enumerate() {
            match self.insert_one(&client, entity, doc).await {
                Ok(id) => outcome.inserted.push((i, id)),
                Err(e) if !e.is_fatal() => outcome.errors.push((i, e.to_string())),
                Err(e) => return Err(e),
            }
        }
        debug!(
            "{}: row-by-row insert done, {} inserted, {} rejected",
            entity,
            outcome.inserted.len(),
            outcome.errors.len()
        );
        Ok(outcome)
    }

    async fn count(&self, entity: EntityType) -> Result<i64> {
        let client = self.client("getting connection for target count").await?;
        let sql = format!("SELECT COUNT(*) FROM {}", self.collection_ref(entity));
        let row = client
            .query_one(&sql, &[])
            .await
            .map_err(|e| MigrateError::connector(STORE, e))?;
        Ok(row.get(0))
    }

    async fn scan_all(&self, entity: EntityType) -> Result<Vec<StoredDocument>> {
        let client = self.client("getting connection for scan_all").await?;
        let sql = format!(
            "SELECT id, natural_key, source_id, doc FROM {} ORDER BY created_at, natural_key",
            self.collection_ref(entity)
        );
        let rows = client
            .query(&sql, &[])
            .await
            .map_err(|e| MigrateError::connector(STORE, e))?;
        rows.iter().map(row_to_document).collect()
    }

    async fn ping(&self) -> Result<()> {
        let client = self.client("getting connection for target ping").await?;
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

fn row_to_document(row: &Row) -> Result<StoredDocument> {
    let id: Uuid = row.try_get(0).map_err(|e| MigrateError::connector(STORE, e))?;
    let natural_key: String = row.try_get(1).map_err(|e| MigrateError::connector(STORE, e))?;
    let source_id: Option<String> = row.try_get(2).map_err(|e| MigrateError::connector(STORE, e))?;
    let doc: Value = row.try_get(3).map_err(|e| MigrateError::connector(STORE, e))?;
    let body = match doc {
        Value::Object(map) => map,
        _ => Document::new(),
    };
    Ok(StoredDocument {
        id: id.to_string(),
        natural_key,
        source_id,
        body,
    })
}

/// Map a database error to a per-record constraint error or a fatal connector error.
fn classify(entity: EntityType, key: &str, err: tokio_postgres::Error) -> MigrateError {
    if let Some(db) = err.as_db_error() {
        let code = db.code().code();
        if code.starts_with("23") || code.starts_with("22") {
            let message = match db.constraint() {
                Some(constraint) => format!("{} ({})", db.message(), constraint),
                None => db.message().to_string(),
            };
            return MigrateError::constraint(entity.as_str(), key, message);
        }
    }
    MigrateError::connector(STORE, err)
}
