//! In-memory document store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::core::{BulkInsertOutcome, DocumentWrite, EntityType, StoredDocument, TargetStore};
use crate::error::{MigrateError, Result};

const STORE: &str = "target";

#[derive(Default)]
struct Inner {
    collections: HashMap<EntityType, Vec<StoredDocument>>,
    markers: HashMap<String, Value>,
    unavailable: bool,
}

/// Document collections held in memory.
///
/// Enforces the same uniqueness rules as [`PgDocumentStore`](super::PgDocumentStore)
/// and counts document reads and writes (run markers are not counted) so tests
/// can assert on store traffic.
#[derive(Clone, Default)]
pub struct InMemoryTarget {
    inner: Arc<Mutex<Inner>>,
    reads: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
    schema_setups: Arc<AtomicUsize>,
}

impl InMemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Document read operations performed so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Document write operations performed so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Calls to [`TargetStore::ensure_collections`] so far.
    pub fn schema_setups(&self) -> usize {
        self.schema_setups.load(Ordering::SeqCst)
    }

    /// Make every subsequent call fail like an unreachable database.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.unavailable = unavailable;
        }
    }

    /// Snapshot of a collection, in insertion order.
    pub fn documents(&self, entity: EntityType) -> Vec<StoredDocument> {
        self.inner
            .lock()
            .map(|inner| inner.collections.get(&entity).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Seed a document directly, bypassing the counters.
    pub fn seed(&self, entity: EntityType, doc: DocumentWrite) -> Result<String> {
        let mut inner = self.lock()?;
        insert_locked(&mut inner, entity, &doc)
    }

    pub(crate) fn load_marker(&self, scope: &str) -> Result<Option<Value>> {
        let inner = self.lock()?;
        Ok(inner.markers.get(scope).cloned())
    }

    pub(crate) fn store_marker(&self, scope: &str, marker: Value) -> Result<()> {
        let mut inner = self.lock()?;
        inner.markers.insert(scope.to_string(), marker);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| MigrateError::connector(STORE, "document store lock poisoned"))?;
        if inner.unavailable {
            return Err(MigrateError::connector(STORE, "connection refused"));
        }
        Ok(inner)
    }

    fn read(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self.lock()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(inner)
    }

    fn write(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self.lock()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(inner)
    }
}

/// Reject a write that would duplicate a natural key or source id held by
/// another document.
fn check_unique(
    docs: &[StoredDocument],
    entity: EntityType,
    doc: &DocumentWrite,
    except_id: Option<&str>,
) -> Result<()> {
    for existing in docs {
        if Some(existing.id.as_str()) == except_id {
            continue;
        }
        if existing.natural_key == doc.natural_key {
            return Err(MigrateError::constraint(
                entity.as_str(),
                &doc.natural_key,
                "duplicate natural_key",
            ));
        }
        if doc.source_id.is_some() && existing.source_id == doc.source_id {
            return Err(MigrateError::constraint(
                entity.as_str(),
                &doc.natural_key,
                "duplicate source_id",
            ));
        }
    }
    Ok(())
}

fn insert_locked(inner: &mut Inner, entity: EntityType, doc: &DocumentWrite) -> Result<String> {
    let docs = inner.collections.entry(entity).or_default();
    check_unique(docs.as_slice(), entity, doc, None)?;
    let id = Uuid::new_v4().to_string();
    docs.push(StoredDocument {
        id: id.clone(),
        natural_key: doc.natural_key.clone(),
        source_id: doc.source_id.clone(),
        body: doc.body.clone(),
    });
    Ok(id)
}

#[async_trait]
impl TargetStore for InMemoryTarget {
    async fn ensure_collections(&self) -> Result<()> {
        let mut inner = self.lock()?;
        self.schema_setups.fetch_add(1, Ordering::SeqCst);
        for entity in EntityType::ALL {
            inner.collections.entry(entity).or_default();
        }
        Ok(())
    }

    async fn find_by_natural_key(&self, entity: EntityType, key: &str) -> Result<Option<StoredDocument>> {
        let inner = self.read()?;
        Ok(inner
            .collections
            .get(&entity)
            .and_then(|docs| docs.iter().find(|d| d.natural_key == key))
            .cloned())
    }

    async fn find_by_source_id(&self, entity: EntityType, source_id: &str) -> Result<Option<StoredDocument>> {
        let inner = self.read()?;
        Ok(inner
            .collections
            .get(&entity)
            .and_then(|docs| docs.iter().find(|d| d.source_id.as_deref() == Some(source_id)))
            .cloned())
    }

    async fn find_existing_source_ids(
        &self,
        entity: EntityType,
        source_ids: &[String],
    ) -> Result<HashMap<String, StoredDocument>> {
        let inner = self.read()?;
        let mut found = HashMap::new();
        if let Some(docs) = inner.collections.get(&entity) {
            for doc in docs {
                if let Some(sid) = &doc.source_id {
                    if source_ids.contains(sid) {
                        found.insert(sid.clone(), doc.clone());
                    }
                }
            }
        }
        Ok(found)
    }

    async fn insert(&self, entity: EntityType, doc: &DocumentWrite) -> Result<String> {
        let mut inner = self.write()?;
        insert_locked(&mut inner, entity, doc)
    }

    async fn update_by_id(&self, entity: EntityType, id: &str, doc: &DocumentWrite) -> Result<()> {
        let mut inner = self.write()?;
        let docs = inner.collections.entry(entity).or_default();
        check_unique(docs.as_slice(), entity, doc, Some(id))?;
        let existing = docs.iter_mut().find(|d| d.id == id).ok_or_else(|| {
            MigrateError::constraint(
                entity.as_str(),
                &doc.natural_key,
                format!("document {} no longer exists", id),
            )
        })?;
        existing.natural_key = doc.natural_key.clone();
        existing.source_id = doc.source_id.clone();
        existing.body = doc.body.clone();
        Ok(())
    }

    async fn bulk_insert(&self, entity: EntityType, docs: &[DocumentWrite]) -> Result<BulkInsertOutcome> {
        let mut inner = self.write()?;
        let mut outcome = BulkInsertOutcome::default();
        for (i, doc) in docs.iter().enumerate() {
            match insert_locked(&mut inner, entity, doc) {
                Ok(id) => outcome.inserted.push((i, id)),
                Err(e) => outcome.errors.push((i, e.to_string())),
            }
        }
        Ok(outcome)
    }

    async fn count(&self, entity: EntityType) -> Result<i64> {
        let inner = self.read()?;
        Ok(inner.collections.get(&entity).map(|d| d.len()).unwrap_or(0) as i64)
    }

    async fn scan_all(&self, entity: EntityType) -> Result<Vec<StoredDocument>> {
        let inner = self.read()?;
        Ok(inner.collections.get(&entity).cloned().unwrap_or_default())
    }

    async fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }

    fn store_name(&self) -> &str {
        STORE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(key: &str, sid: Option<&str>) -> DocumentWrite {
        DocumentWrite {
            natural_key: key.to_string(),
            source_id: sid.map(str::to_string),
            body: json!({"username": key}).as_object().cloned().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_natural_key_is_unique() {
        let target = InMemoryTarget::new();
        target.insert(EntityType::Cards, &write("carter", Some("10"))).await.unwrap();
        let err = target
            .insert(EntityType::Cards, &write("carter", Some("11")))
            .await
            .unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(target.count(EntityType::Cards).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_keeps_id() {
        let target = InMemoryTarget::new();
        let id = target.insert(EntityType::Cards, &write("carter", None)).await.unwrap();
        target
            .update_by_id(EntityType::Cards, &id, &write("carter", Some("10")))
            .await
            .unwrap();
        let doc = target.find_by_source_id(EntityType::Cards, "10").await.unwrap().unwrap();
        assert_eq!(doc.id, id);
    }

    #[tokio::test]
    async fn test_bulk_insert_reports_per_record_errors() {
        let target = InMemoryTarget::new();
        let docs = vec![
            write("analytics-1", Some("1")),
            write("analytics-1", Some("1")),
            write("analytics-2", Some("2")),
        ];
        let outcome = target.bulk_insert(EntityType::Analytics, &docs).await.unwrap();
        assert_eq!(outcome.inserted_count(), 2);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].0, 1);
    }

    #[tokio::test]
    async fn test_unavailable_is_fatal() {
        let target = InMemoryTarget::new();
        target.set_unavailable(true);
        let err = target.count(EntityType::Users).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_counters() {
        let target = InMemoryTarget::new();
        target.insert(EntityType::Users, &write("a@x.com", Some("1"))).await.unwrap();
        target.find_by_natural_key(EntityType::Users, "a@x.com").await.unwrap();
        assert_eq!(target.writes(), 1);
        assert_eq!(target.reads(), 1);
    }
}
