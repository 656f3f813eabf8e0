//! Connector traits over the two stores.
//!
//! - [`SourceReader`]: paginated, side-effect-free reads from the relational source
//! - [`TargetStore`]: look-ups and writes against the document target
//!
//! Errors returned by these traits are fatal unless they are
//! [`MigrateError::Constraint`](crate::error::MigrateError::Constraint), which
//! reports a single rejected write.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::error::Result;

use super::entity::EntityType;
use super::record::{BulkInsertOutcome, DocumentWrite, SourceRecord, StoredDocument};

/// Read records from the source store.
///
/// # Streaming
///
/// [`read_all`](SourceReader::read_all) returns a channel receiver that yields
/// pages. The reader spawns a background task that fills the channel, so a
/// slow consumer applies backpressure to the reads. Re-reading is always safe.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Stream every record of an entity type, `page_size` rows at a time.
    ///
    /// The stream ends after the last page or after the first error.
    fn read_all(&self, entity: EntityType, page_size: usize) -> mpsc::Receiver<Result<Vec<SourceRecord>>>;

    /// Number of source records of an entity type.
    async fn count(&self, entity: EntityType) -> Result<i64>;

    /// Check connectivity.
    async fn ping(&self) -> Result<()>;

    /// Store name for logs.
    fn store_name(&self) -> &str;
}

/// Read and write documents in the target store.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Create collections and indexes if they do not exist. Idempotent.
    async fn ensure_collections(&self) -> Result<()>;

    /// Find a document by natural key.
    async fn find_by_natural_key(&self, entity: EntityType, key: &str) -> Result<Option<StoredDocument>>;

    /// Find a document by its source back-reference.
    async fn find_by_source_id(&self, entity: EntityType, source_id: &str) -> Result<Option<StoredDocument>>;

    /// Find the documents carrying any of the given source ids, keyed by source id.
    async fn find_existing_source_ids(
        &self,
        entity: EntityType,
        source_ids: &[String],
    ) -> Result<HashMap<String, StoredDocument>>;

    /// Insert a document, returning its new target id.
    async fn insert(&self, entity: EntityType, doc: &DocumentWrite) -> Result<String>;

    /// Replace the natural key, source id and body of an existing document.
    async fn update_by_id(&self, entity: EntityType, id: &str, doc: &DocumentWrite) -> Result<()>;

    /// Insert many documents. Rejected documents are reported per index and do
    /// not stop the rest of the batch.
    async fn bulk_insert(&self, entity: EntityType, docs: &[DocumentWrite]) -> Result<BulkInsertOutcome>;

    /// Number of documents in a collection.
    async fn count(&self, entity: EntityType) -> Result<i64>;

    /// Every document of a collection.
    async fn scan_all(&self, entity: EntityType) -> Result<Vec<StoredDocument>>;

    /// Check connectivity.
    async fn ping(&self) -> Result<()>;

    /// Store name for logs.
    fn store_name(&self) -> &str;
}
