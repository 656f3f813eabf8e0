//! In-memory source store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::READ_AHEAD_PAGES;
use crate::core::record::decode_rows;
use crate::core::{EntityType, SourceReader, SourceRecord};
use crate::error::{MigrateError, Result};

const STORE: &str = "source";

/// Source rows held in memory as JSON objects, one list per entity type.
///
/// Counts every row handed out by [`SourceReader::read_all`] so callers can
/// assert that a skipped phase read nothing.
#[derive(Clone, Default)]
pub struct InMemorySource {
    rows: Arc<Mutex<HashMap<EntityType, Vec<Value>>>>,
    rows_read: Arc<AtomicUsize>,
    unavailable: Arc<Mutex<bool>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style row seeding.
    pub fn with_rows(self, entity: EntityType, rows: Vec<Value>) -> Self {
        self.insert_rows(entity, rows);
        self
    }

    pub fn insert_rows(&self, entity: EntityType, rows: Vec<Value>) {
        if let Ok(mut guard) = self.rows.lock() {
            guard.entry(entity).or_default().extend(rows);
        }
    }

    /// Total rows handed out so far.
    pub fn rows_read(&self) -> usize {
        self.rows_read.load(Ordering::SeqCst)
    }

    /// Make every subsequent call fail like an unreachable database.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut guard) = self.unavailable.lock() {
            *guard = unavailable;
        }
    }

    fn check_available(&self) -> Result<()> {
        let down = self.unavailable.lock().map(|g| *g).unwrap_or(true);
        if down {
            return Err(MigrateError::connector(STORE, "connection refused"));
        }
        Ok(())
    }

    fn snapshot(&self, entity: EntityType) -> Result<Vec<Value>> {
        let guard = self
            .rows
            .lock()
            .map_err(|_| MigrateError::connector(STORE, "row store lock poisoned"))?;
        Ok(guard.get(&entity).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl SourceReader for InMemorySource {
    fn read_all(&self, entity: EntityType, page_size: usize) -> mpsc::Receiver<Result<Vec<SourceRecord>>> {
        let (tx, rx) = mpsc::channel(READ_AHEAD_PAGES);
        let rows = self.check_available().and_then(|_| self.snapshot(entity));
        let rows_read = self.rows_read.clone();
        let page_size = page_size.max(1);

        tokio::spawn(async move {
            let rows = match rows {
                Ok(rows) => rows,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            for chunk in rows.chunks(page_size) {
                let page = decode_rows(entity, chunk.to_vec());
                if page.is_ok() {
                    rows_read.fetch_add(chunk.len(), Ordering::SeqCst);
                }
                let failed = page.is_err();
                if tx.send(page).await.is_err() || failed {
                    return;
                }
            }
        });

        rx
    }

    async fn count(&self, entity: EntityType) -> Result<i64> {
        self.check_available()?;
        Ok(self.snapshot(entity)?.len() as i64)
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }

    fn store_name(&self) -> &str {
        STORE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_read_all_pages() {
        let rows = (1..=5).map(|i| json!({"id": i, "email": format!("u{}@x.com", i)})).collect();
        let source = InMemorySource::new().with_rows(EntityType::Users, rows);

        let mut rx = source.read_all(EntityType::Users, 2);
        let mut sizes = Vec::new();
        while let Some(page) = rx.recv().await {
            sizes.push(page.unwrap().len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(source.rows_read(), 5);
        assert_eq!(source.count(EntityType::Users).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_empty_entity_yields_nothing() {
        let source = InMemorySource::new();
        let mut rx = source.read_all(EntityType::Cards, 10);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_source_errors() {
        let source = InMemorySource::new();
        source.set_unavailable(true);
        let mut rx = source.read_all(EntityType::Users, 10);
        assert!(rx.recv().await.unwrap().is_err());
        assert!(source.ping().await.is_err());
    }
}
