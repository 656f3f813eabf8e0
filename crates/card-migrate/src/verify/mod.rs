//! Read-only reconciliation of the source store against the target store.
//!
//! For each entity type the engine reads every source record, scans the target
//! collection and indexes it by `sourceId`, then classifies each record:
//!
//! - **Matched**: a target document exists and every compared field agrees
//! - **Mismatched**: a target document exists but some fields differ
//! - **MissingInTarget**: no target document carries the source id
//! - **ExtraInTarget**: a target document no source record accounts for
//!
//! Expected values come from [`Transformer::map`], so the comparison applies
//! the same coercions as the migration. Nothing is written to either store.

pub mod compare;
pub mod types;

pub use types::{
    EntityVerifyResult, ReconciliationEntry, ReconciliationStatus, VerifyProgressUpdate,
    VerifyResult,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{DateGranularity, VerifyConfig};
use crate::core::{EntityType, SourceReader, SourceRecord, StoredDocument, TargetStore};
use crate::error::Result;
use crate::transform::Transformer;

/// Engine for field-level reconciliation.
pub struct VerifyEngine {
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetStore>,
    config: VerifyConfig,
    page_size: usize,
    transformer: Transformer,
    progress_tx: Option<mpsc::Sender<VerifyProgressUpdate>>,
}

impl VerifyEngine {
    /// Create a new verification engine.
    pub fn new(
        source: Arc<dyn SourceReader>,
        target: Arc<dyn TargetStore>,
        config: VerifyConfig,
        page_size: usize,
    ) -> Self {
        Self {
            source,
            target,
            config,
            page_size: page_size.max(1),
            transformer: Transformer::new(),
            progress_tx: None,
        }
    }

    /// Set progress channel for updates.
    pub fn with_progress(mut self, tx: mpsc::Sender<VerifyProgressUpdate>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    async fn send_progress(&self, update: VerifyProgressUpdate) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(update).await;
        }
    }

    /// Reconcile several entity types in order.
    pub async fn verify(&self, entities: &[EntityType]) -> Result<VerifyResult> {
        let start = Instant::now();
        let mut result = VerifyResult::new();

        for &entity in entities {
            let entity_result = self.verify_entity(entity).await?;
            result.add_entity(entity_result);
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Verification complete: {} in sync, {} with differences ({}ms)",
            result.entities_in_sync, result.entities_with_differences, result.duration_ms
        );
        Ok(result)
    }

    /// Reconcile one entity type.
    pub async fn verify_entity(&self, entity: EntityType) -> Result<EntityVerifyResult> {
        let start = Instant::now();
        let granularity = self.config.granularity_for(entity);
        let mut result = EntityVerifyResult::new(entity, granularity);

        info!("Starting verification for {}", entity);

        let docs = self.target.scan_all(entity).await?;
        result.target_total = docs.len() as u64;

        let mut by_source_id: HashMap<String, StoredDocument> = HashMap::with_capacity(docs.len());
        for doc in docs {
            match doc.source_id.clone() {
                Some(sid) => {
                    by_source_id.insert(sid, doc);
                }
                None => result.add_entry(
                    ReconciliationEntry::new(None, Some(doc.natural_key), ReconciliationStatus::ExtraInTarget)
                        .with_note("created natively in the target"),
                ),
            }
        }

        let parent_sources = match entity.parent() {
            Some(parent) => self.parent_index(parent).await?,
            None => HashMap::new(),
        };

        let mut rx = self.source.read_all(entity, self.page_size);
        let mut processed = 0u64;
        while let Some(page) = rx.recv().await {
            for record in page? {
                let entry = self.reconcile(&record, &mut by_source_id, granularity, &parent_sources);
                if entry.status != ReconciliationStatus::Matched {
                    debug!(
                        "{} {}: {:?} {:?}",
                        entity,
                        record.display_id(),
                        entry.status,
                        entry.mismatched_fields
                    );
                }
                result.add_entry(entry);
                processed += 1;
            }
            self.send_progress(VerifyProgressUpdate {
                entity,
                processed,
                mismatches_found: result.mismatched + result.missing_in_target,
            })
            .await;
        }
        result.source_total = processed;

        let mut extras: Vec<StoredDocument> = by_source_id.into_values().collect();
        extras.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        for doc in extras {
            result.add_entry(ReconciliationEntry::new(
                doc.source_id,
                Some(doc.natural_key),
                ReconciliationStatus::ExtraInTarget,
            ));
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        if result.is_in_sync() {
            info!(
                "{}: {} matched, {} extra in target ({}ms)",
                entity, result.matched, result.extra_in_target, result.duration_ms
            );
        } else {
            warn!(
                "{}: {} matched, {} mismatched, {} missing in target, {} extra in target",
                entity, result.matched, result.mismatched, result.missing_in_target, result.extra_in_target
            );
        }
        Ok(result)
    }

    /// Classify one source record, removing its document from the index.
    fn reconcile(
        &self,
        record: &SourceRecord,
        by_source_id: &mut HashMap<String, StoredDocument>,
        granularity: DateGranularity,
        parent_sources: &HashMap<String, Option<String>>,
    ) -> ReconciliationEntry {
        let Some(sid) = record.source_id() else {
            return ReconciliationEntry::new(None, None, ReconciliationStatus::MissingInTarget)
                .with_note("source record has no id");
        };
        let sid = sid.to_string();
        let mapped = self.transformer.map(record);

        let Some(doc) = by_source_id.remove(&sid) else {
            let key = mapped.as_ref().ok().map(|m| m.natural_key.clone());
            let entry = ReconciliationEntry::new(Some(sid), key, ReconciliationStatus::MissingInTarget);
            return match mapped {
                Ok(_) => entry,
                Err(e) => entry.with_note(e.to_string()),
            };
        };

        match mapped {
            Ok(expected) => {
                let fields = compare::compare(&expected, &doc, granularity, parent_sources);
                let status = if fields.is_empty() {
                    ReconciliationStatus::Matched
                } else {
                    ReconciliationStatus::Mismatched
                };
                ReconciliationEntry::new(Some(sid), Some(doc.natural_key), status).with_fields(fields)
            }
            Err(e) => ReconciliationEntry::new(Some(sid), Some(doc.natural_key), ReconciliationStatus::Mismatched)
                .with_note(e.to_string()),
        }
    }

    /// Parent target id -> parent source id.
    async fn parent_index(&self, parent: EntityType) -> Result<HashMap<String, Option<String>>> {
        let docs = self.target.scan_all(parent).await?;
        Ok(docs.into_iter().map(|d| (d.id, d.source_id)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DocumentWrite;
    use crate::source::InMemorySource;
    use crate::target::InMemoryTarget;
    use serde_json::{json, Value};

    fn body(value: Value) -> crate::core::Document {
        value.as_object().cloned().unwrap()
    }

    fn engine(source: &InMemorySource, target: &InMemoryTarget) -> VerifyEngine {
        VerifyEngine::new(
            Arc::new(source.clone()),
            Arc::new(target.clone()),
            VerifyConfig::default(),
            2,
        )
    }

    #[tokio::test]
    async fn test_classifies_every_status() {
        let source = InMemorySource::new().with_rows(
            EntityType::Users,
            vec![
                json!({"id": 1, "email": "a@x.com", "name": "Ann", "created_at": "2024-01-01T00:00:00Z"}),
                json!({"id": 2, "email": "b@x.com", "name": "Bob", "created_at": "2024-01-01T00:00:00Z"}),
                json!({"id": 3, "email": "c@x.com"}),
            ],
        );
        let target = InMemoryTarget::new();
        target
            .seed(
                EntityType::Users,
                DocumentWrite {
                    natural_key: "a@x.com".into(),
                    source_id: Some("1".into()),
                    body: body(json!({"email": "a@x.com", "name": "Ann", "emailVerified": false, "createdAt": "2024-01-01T00:00:00.000Z"})),
                },
            )
            .unwrap();
        target
            .seed(
                EntityType::Users,
                DocumentWrite {
                    natural_key: "b@x.com".into(),
                    source_id: Some("2".into()),
                    body: body(json!({"email": "b@x.com", "name": "Robert", "emailVerified": false, "createdAt": "2024-01-01T00:00:00.000Z"})),
                },
            )
            .unwrap();
        target
            .seed(
                EntityType::Users,
                DocumentWrite {
                    natural_key: "z@x.com".into(),
                    source_id: Some("99".into()),
                    body: body(json!({"email": "z@x.com"})),
                },
            )
            .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let result = engine(&source, &target)
            .with_progress(tx)
            .verify_entity(EntityType::Users)
            .await
            .unwrap();

        assert_eq!(result.source_total, 3);
        assert_eq!(result.target_total, 3);
        assert_eq!(result.matched, 1);
        assert_eq!(result.mismatched, 1);
        assert_eq!(result.missing_in_target, 1);
        assert_eq!(result.extra_in_target, 1);
        assert!(!result.is_in_sync());

        let mismatch = result
            .entries
            .iter()
            .find(|e| e.status == ReconciliationStatus::Mismatched)
            .unwrap();
        assert_eq!(mismatch.source_id.as_deref(), Some("2"));
        assert_eq!(mismatch.mismatched_fields, vec!["name"]);

        let mut last = None;
        while let Ok(update) = rx.try_recv() {
            last = Some(update);
        }
        assert_eq!(last.map(|u| u.processed), Some(3));

        assert_eq!(target.writes(), 0);
    }

    #[tokio::test]
    async fn test_native_documents_are_extra() {
        let source = InMemorySource::new();
        let target = InMemoryTarget::new();
        target
            .seed(
                EntityType::Users,
                DocumentWrite {
                    natural_key: "native@x.com".into(),
                    source_id: None,
                    body: body(json!({"email": "native@x.com"})),
                },
            )
            .unwrap();

        let result = engine(&source, &target).verify(&[EntityType::Users]).await.unwrap();
        let users = result.entity(EntityType::Users).unwrap();
        assert_eq!(users.extra_in_target, 1);
        assert!(users.is_in_sync());
        assert!(result.is_in_sync());
    }

    #[tokio::test]
    async fn test_unreachable_target_is_fatal() {
        let source = InMemorySource::new();
        let target = InMemoryTarget::new();
        target.set_unavailable(true);
        assert!(engine(&source, &target).verify_entity(EntityType::Users).await.is_err());
    }
}
