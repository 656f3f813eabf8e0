//! Type definitions for reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DateGranularity;
use crate::core::EntityType;

/// Classification of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    Matched,
    Mismatched,
    MissingInTarget,
    /// A target document no source record accounts for. Reported, not an error.
    ExtraInTarget,
}

/// One reconciled record. Reported, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationEntry {
    /// `None` for source rows without an id and for target documents created
    /// natively in the target.
    pub source_id: Option<String>,
    pub natural_key: Option<String>,
    pub status: ReconciliationStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mismatched_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ReconciliationEntry {
    pub fn new(
        source_id: Option<String>,
        natural_key: Option<String>,
        status: ReconciliationStatus,
    ) -> Self {
        Self {
            source_id,
            natural_key,
            status,
            mismatched_fields: Vec::new(),
            note: None,
        }
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.mismatched_fields = fields;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Reconciliation result for one entity type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityVerifyResult {
    pub entity: EntityType,
    pub date_granularity: DateGranularity,
    pub source_total: u64,
    pub target_total: u64,
    pub matched: u64,
    pub mismatched: u64,
    pub missing_in_target: u64,
    pub extra_in_target: u64,
    pub entries: Vec<ReconciliationEntry>,
    pub duration_ms: u64,
}

impl EntityVerifyResult {
    pub fn new(entity: EntityType, date_granularity: DateGranularity) -> Self {
        Self {
            entity,
            date_granularity,
            source_total: 0,
            target_total: 0,
            matched: 0,
            mismatched: 0,
            missing_in_target: 0,
            extra_in_target: 0,
            entries: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn add_entry(&mut self, entry: ReconciliationEntry) {
        match entry.status {
            ReconciliationStatus::Matched => self.matched += 1,
            ReconciliationStatus::Mismatched => self.mismatched += 1,
            ReconciliationStatus::MissingInTarget => self.missing_in_target += 1,
            ReconciliationStatus::ExtraInTarget => self.extra_in_target += 1,
        }
        self.entries.push(entry);
    }

    /// Every source record is present and equal. Extra target records do not
    /// break sync.
    pub fn is_in_sync(&self) -> bool {
        self.mismatched == 0 && self.missing_in_target == 0
    }

    /// Entries that are not Matched.
    pub fn findings(&self) -> impl Iterator<Item = &ReconciliationEntry> {
        self.entries
            .iter()
            .filter(|e| e.status != ReconciliationStatus::Matched)
    }
}

/// Result of a reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResult {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub entities_in_sync: usize,
    pub entities_with_differences: usize,
    pub entities: Vec<EntityVerifyResult>,
}

impl VerifyResult {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            duration_ms: 0,
            entities_in_sync: 0,
            entities_with_differences: 0,
            entities: Vec::new(),
        }
    }

    pub fn add_entity(&mut self, result: EntityVerifyResult) {
        if result.is_in_sync() {
            self.entities_in_sync += 1;
        } else {
            self.entities_with_differences += 1;
        }
        self.entities.push(result);
    }

    pub fn is_in_sync(&self) -> bool {
        self.entities_with_differences == 0
    }

    pub fn entity(&self, entity: EntityType) -> Option<&EntityVerifyResult> {
        self.entities.iter().find(|e| e.entity == entity)
    }
}

impl Default for VerifyResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress update for reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyProgressUpdate {
    pub entity: EntityType,
    /// Source records reconciled so far.
    pub processed: u64,
    pub mismatches_found: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extra_records_do_not_break_sync() {
        let mut result = EntityVerifyResult::new(EntityType::Users, DateGranularity::Exact);
        result.add_entry(ReconciliationEntry::new(
            Some("1".into()),
            Some("a@x.com".into()),
            ReconciliationStatus::Matched,
        ));
        result.add_entry(ReconciliationEntry::new(
            None,
            Some("native@x.com".into()),
            ReconciliationStatus::ExtraInTarget,
        ));
        assert!(result.is_in_sync());
        assert_eq!(result.findings().count(), 1);
    }

    #[test]
    fn test_add_entity_counts() {
        let mut in_sync = EntityVerifyResult::new(EntityType::Users, DateGranularity::Exact);
        in_sync.add_entry(ReconciliationEntry::new(Some("1".into()), None, ReconciliationStatus::Matched));
        let mut differs = EntityVerifyResult::new(EntityType::Cards, DateGranularity::Exact);
        differs.add_entry(
            ReconciliationEntry::new(Some("10".into()), Some("carter".into()), ReconciliationStatus::Mismatched)
                .with_fields(vec!["title".into()]),
        );

        let mut result = VerifyResult::new();
        result.add_entity(in_sync);
        result.add_entity(differs);
        assert_eq!(result.entities_in_sync, 1);
        assert_eq!(result.entities_with_differences, 1);
        assert!(!result.is_in_sync());
        assert_eq!(result.entity(EntityType::Cards).unwrap().mismatched, 1);
    }

    #[test]
    fn test_entry_json_omits_empty_fields() {
        let entry = ReconciliationEntry::new(Some("1".into()), None, ReconciliationStatus::MissingInTarget);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["status"], "missing_in_target");
        assert!(json.get("mismatched_fields").is_none());
    }
}
