//! Batch upsert engine.
//!
//! Every record ends in exactly one [`UpsertOutcome`]. Per-record failures
//! (constraint violations, rejected bulk rows) become [`UpsertOutcome::Errored`];
//! only fatal connector errors leave the engine as `Err`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::{DocumentWrite, StoredDocument, TargetRecord, TargetStore};
use crate::error::{MigrateError, Result};

/// Result of writing one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted { target_id: String },
    Updated { target_id: String },
    Errored { error: String },
}

impl UpsertOutcome {
    pub fn target_id(&self) -> Option<&str> {
        match self {
            UpsertOutcome::Inserted { target_id } | UpsertOutcome::Updated { target_id } => {
                Some(target_id)
            }
            UpsertOutcome::Errored { .. } => None,
        }
    }

    fn from_error(err: MigrateError) -> Result<Self> {
        if err.is_fatal() {
            return Err(err);
        }
        Ok(UpsertOutcome::Errored {
            error: err.to_string(),
        })
    }
}

/// Writes transformed records to the target store.
#[derive(Clone)]
pub struct UpsertEngine {
    target: Arc<dyn TargetStore>,
    dry_run: bool,
}

impl UpsertEngine {
    pub fn new(target: Arc<dyn TargetStore>) -> Self {
        Self {
            target,
            dry_run: false,
        }
    }

    /// In dry-run mode look-ups still happen but nothing is written.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Insert or update a single record.
    ///
    /// The existing document is found by source id first, then by natural key.
    /// Updates merge the record's fields into the stored body.
    pub async fn upsert(&self, record: &TargetRecord) -> Result<UpsertOutcome> {
        let existing = match self.find_existing(record).await? {
            Ok(existing) => existing,
            Err(outcome) => return Ok(outcome),
        };

        match existing {
            Some(doc) => self.update(record, &doc).await,
            None => self.insert(record).await,
        }
    }

    /// Write a chunk of records: known source ids are updated one by one, the
    /// rest is bulk inserted. Outcomes are returned in input order.
    pub async fn upsert_chunk(&self, records: &[TargetRecord]) -> Result<Vec<UpsertOutcome>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let entity = records[0].entity;
        let source_ids: Vec<String> = records.iter().map(|r| r.source_id.clone()).collect();
        let existing: HashMap<String, StoredDocument> = self
            .target
            .find_existing_source_ids(entity, &source_ids)
            .await?;

        let mut outcomes: Vec<Option<UpsertOutcome>> = vec![None; records.len()];
        let mut to_insert: Vec<usize> = Vec::new();
        for (i, record) in records.iter().enumerate() {
            match existing.get(&record.source_id) {
                Some(doc) => outcomes[i] = Some(self.update(record, doc).await?),
                None => to_insert.push(i),
            }
        }

        if !to_insert.is_empty() {
            if self.dry_run {
                for &i in &to_insert {
                    outcomes[i] = Some(UpsertOutcome::Inserted {
                        target_id: dry_run_id(&records[i]),
                    });
                }
            } else {
                let docs: Vec<DocumentWrite> = to_insert
                    .iter()
                    .map(|&i| insert_write(&records[i]))
                    .collect();
                match self.target.bulk_insert(entity, &docs).await {
                    Ok(result) => {
                        for (j, target_id) in result.inserted {
                            if let Some(&i) = to_insert.get(j) {
                                outcomes[i] = Some(UpsertOutcome::Inserted { target_id });
                            }
                        }
                        for (j, error) in result.errors {
                            if let Some(&i) = to_insert.get(j) {
                                outcomes[i] = Some(UpsertOutcome::Errored { error });
                            }
                        }
                    }
                    Err(e) if !e.is_fatal() => {
                        warn!("{}: bulk insert of {} records failed: {}", entity, docs.len(), e);
                        let error = e.to_string();
                        for &i in &to_insert {
                            outcomes[i] = Some(UpsertOutcome::Errored {
                                error: error.clone(),
                            });
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(outcomes
            .into_iter()
            .map(|o| {
                o.unwrap_or_else(|| UpsertOutcome::Errored {
                    error: "bulk insert returned no result for record".to_string(),
                })
            })
            .collect())
    }

    /// Locate the document a record should be merged into.
    ///
    /// The inner `Err` carries a per-record outcome for a natural key that is
    /// held by a different source record.
    async fn find_existing(
        &self,
        record: &TargetRecord,
    ) -> Result<std::result::Result<Option<StoredDocument>, UpsertOutcome>> {
        if let Some(doc) = self
            .target
            .find_by_source_id(record.entity, &record.source_id)
            .await?
        {
            return Ok(Ok(Some(doc)));
        }

        match self
            .target
            .find_by_natural_key(record.entity, &record.natural_key)
            .await?
        {
            Some(doc) if doc.source_id.is_some() => {
                let err = MigrateError::constraint(
                    record.entity.as_str(),
                    &record.natural_key,
                    format!(
                        "natural key belongs to source record {}",
                        doc.source_id.unwrap_or_default()
                    ),
                );
                Ok(Err(UpsertOutcome::from_error(err)?))
            }
            other => Ok(Ok(other)),
        }
    }

    async fn insert(&self, record: &TargetRecord) -> Result<UpsertOutcome> {
        if self.dry_run {
            return Ok(UpsertOutcome::Inserted {
                target_id: dry_run_id(record),
            });
        }
        match self.target.insert(record.entity, &insert_write(record)).await {
            Ok(target_id) => {
                debug!("{} {}: inserted as {}", record.entity, record.source_id, target_id);
                Ok(UpsertOutcome::Inserted { target_id })
            }
            Err(e) => UpsertOutcome::from_error(e),
        }
    }

    async fn update(&self, record: &TargetRecord, existing: &StoredDocument) -> Result<UpsertOutcome> {
        if self.dry_run {
            return Ok(UpsertOutcome::Updated {
                target_id: existing.id.clone(),
            });
        }
        let write = DocumentWrite {
            natural_key: record.natural_key.clone(),
            source_id: Some(record.source_id.clone()),
            body: record.merged_body(&existing.body),
        };
        match self.target.update_by_id(record.entity, &existing.id, &write).await {
            Ok(()) => {
                debug!("{} {}: updated {}", record.entity, record.source_id, existing.id);
                Ok(UpsertOutcome::Updated {
                    target_id: existing.id.clone(),
                })
            }
            Err(e) => UpsertOutcome::from_error(e),
        }
    }
}

fn insert_write(record: &TargetRecord) -> DocumentWrite {
    DocumentWrite {
        natural_key: record.natural_key.clone(),
        source_id: Some(record.source_id.clone()),
        body: record.insert_body(),
    }
}

/// Placeholder id for records a dry run would insert.
fn dry_run_id(record: &TargetRecord) -> String {
    format!("dry-run:{}", record.source_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Document, EntityType};
    use crate::target::InMemoryTarget;
    use serde_json::json;

    fn record(entity: EntityType, sid: &str, key: &str, fields: serde_json::Value) -> TargetRecord {
        TargetRecord {
            entity,
            target_id: None,
            natural_key: key.into(),
            source_id: sid.into(),
            fields: fields.as_object().cloned().unwrap_or_default(),
            insert_defaults: Document::new(),
        }
    }

    #[tokio::test]
    async fn test_insert_then_update() {
        let target = Arc::new(InMemoryTarget::new());
        let engine = UpsertEngine::new(target.clone());

        let mut card = record(EntityType::Cards, "10", "carter", json!({"name": "Carter"}));
        card.insert_defaults.insert("viewCount".into(), json!(0));
        let first = engine.upsert(&card).await.unwrap();
        let id = first.target_id().unwrap().to_string();
        assert!(matches!(first, UpsertOutcome::Inserted { .. }));

        card.fields.insert("name".into(), json!("Carter B."));
        let second = engine.upsert(&card).await.unwrap();
        assert_eq!(second, UpsertOutcome::Updated { target_id: id });

        let docs = target.documents(EntityType::Cards);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].body["name"], json!("Carter B."));
        assert_eq!(docs[0].body["viewCount"], json!(0));
    }

    #[tokio::test]
    async fn test_update_keeps_target_only_fields() {
        let target = Arc::new(InMemoryTarget::new());
        target
            .seed(
                EntityType::Cards,
                DocumentWrite {
                    natural_key: "carter".into(),
                    source_id: Some("10".into()),
                    body: json!({"name": "Old", "viewCount": 42}).as_object().cloned().unwrap(),
                },
            )
            .unwrap();
        let engine = UpsertEngine::new(target.clone());

        let card = record(EntityType::Cards, "10", "carter", json!({"name": "New"}));
        engine.upsert(&card).await.unwrap();
        let doc = &target.documents(EntityType::Cards)[0];
        assert_eq!(doc.body["viewCount"], json!(42));
        assert_eq!(doc.body["name"], json!("New"));
    }

    #[tokio::test]
    async fn test_native_document_is_adopted() {
        let target = Arc::new(InMemoryTarget::new());
        let id = target
            .seed(
                EntityType::Users,
                DocumentWrite {
                    natural_key: "a@x.com".into(),
                    source_id: None,
                    body: Document::new(),
                },
            )
            .unwrap();
        let engine = UpsertEngine::new(target.clone());

        let outcome = engine
            .upsert(&record(EntityType::Users, "1", "a@x.com", json!({"email": "a@x.com"})))
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated { target_id: id });
        assert_eq!(
            target.documents(EntityType::Users)[0].source_id.as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn test_key_owned_by_other_record_errors() {
        let target = Arc::new(InMemoryTarget::new());
        let engine = UpsertEngine::new(target.clone());
        engine
            .upsert(&record(EntityType::Users, "1", "a@x.com", json!({})))
            .await
            .unwrap();
        let outcome = engine
            .upsert(&record(EntityType::Users, "2", "a@x.com", json!({})))
            .await
            .unwrap();
        assert!(matches!(outcome, UpsertOutcome::Errored { .. }));
    }

    #[tokio::test]
    async fn test_chunk_updates_known_and_inserts_new() {
        let target = Arc::new(InMemoryTarget::new());
        let engine = UpsertEngine::new(target.clone());
        let chunk: Vec<_> = (1..=3)
            .map(|i| {
                record(
                    EntityType::Analytics,
                    &i.to_string(),
                    &format!("analytics-{}", i),
                    json!({"eventType": "view"}),
                )
            })
            .collect();

        let first = engine.upsert_chunk(&chunk[..2]).await.unwrap();
        assert!(first.iter().all(|o| matches!(o, UpsertOutcome::Inserted { .. })));

        let second = engine.upsert_chunk(&chunk).await.unwrap();
        assert!(matches!(second[0], UpsertOutcome::Updated { .. }));
        assert!(matches!(second[1], UpsertOutcome::Updated { .. }));
        assert!(matches!(second[2], UpsertOutcome::Inserted { .. }));
        assert_eq!(target.documents(EntityType::Analytics).len(), 3);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let target = Arc::new(InMemoryTarget::new());
        let engine = UpsertEngine::new(target.clone()).with_dry_run(true);

        let outcome = engine
            .upsert(&record(EntityType::Users, "1", "a@x.com", json!({})))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            UpsertOutcome::Inserted {
                target_id: "dry-run:1".into()
            }
        );
        let chunk = vec![record(EntityType::Analytics, "5", "analytics-5", json!({}))];
        engine.upsert_chunk(&chunk).await.unwrap();
        assert_eq!(target.writes(), 0);
        assert!(target.reads() > 0);
    }

    #[tokio::test]
    async fn test_connector_failure_is_fatal() {
        let target = Arc::new(InMemoryTarget::new());
        let engine = UpsertEngine::new(target.clone());
        target.set_unavailable(true);
        let err = engine
            .upsert(&record(EntityType::Users, "1", "a@x.com", json!({})))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
