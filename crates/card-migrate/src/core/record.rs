//! Source and target record types.
//!
//! Source rows are decoded into one typed struct per entity. Unknown columns
//! are ignored, scalar columns are read leniently (a numeric `username` still
//! becomes a string) and loosely typed flags and timestamps are kept as raw
//! JSON values for the transformer to coerce.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::entity::EntityType;
use crate::error::{MigrateError, Result};

/// A JSON document body.
pub type Document = Map<String, Value>;

/// A row from the `users` table.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SourceUser {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub email: Option<String>,
    #[serde(default, alias = "full_name", alias = "display_name", deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub email_verified: Option<Value>,
    #[serde(default)]
    pub created_at: Option<Value>,
    #[serde(default)]
    pub updated_at: Option<Value>,
}

/// A row from the `cards` (profiles) table.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SourceCard {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default, alias = "owner_id", deserialize_with = "lenient_string")]
    pub user_id: Option<String>,
    #[serde(default, alias = "slug", deserialize_with = "lenient_string")]
    pub username: Option<String>,
    #[serde(default, alias = "full_name", deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(default, alias = "job_title", deserialize_with = "lenient_string")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub company: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bio: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub phone: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub website: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub avatar_url: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub theme: Option<String>,
    #[serde(default)]
    pub is_public: Option<Value>,
    #[serde(default)]
    pub created_at: Option<Value>,
    #[serde(default)]
    pub updated_at: Option<Value>,
}

/// A row from the card analytics table.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SourceAnalytics {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default, alias = "profile_id", deserialize_with = "lenient_string")]
    pub card_id: Option<String>,
    #[serde(default, alias = "event", deserialize_with = "lenient_string")]
    pub event_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub visitor_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub referrer: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub created_at: Option<Value>,
}

/// A decoded source row. Read-only input to the transformer.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRecord {
    User(SourceUser),
    Card(SourceCard),
    Analytics(SourceAnalytics),
}

impl SourceRecord {
    /// Decode a JSON row (as produced by `row_to_json`) for an entity type.
    pub fn decode(entity: EntityType, row: Value) -> Result<Self> {
        let record = match entity {
            EntityType::Users => SourceRecord::User(serde_json::from_value(row)?),
            EntityType::Cards => SourceRecord::Card(serde_json::from_value(row)?),
            EntityType::Analytics => SourceRecord::Analytics(serde_json::from_value(row)?),
        };
        Ok(record)
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            SourceRecord::User(_) => EntityType::Users,
            SourceRecord::Card(_) => EntityType::Cards,
            SourceRecord::Analytics(_) => EntityType::Analytics,
        }
    }

    /// The source-native identifier, trimmed; `None` when absent or blank.
    pub fn source_id(&self) -> Option<&str> {
        let id = match self {
            SourceRecord::User(u) => u.id.as_deref(),
            SourceRecord::Card(c) => c.id.as_deref(),
            SourceRecord::Analytics(a) => a.id.as_deref(),
        };
        id.map(str::trim).filter(|s| !s.is_empty())
    }

    /// Source id for logs and error samples.
    pub fn display_id(&self) -> String {
        self.source_id().unwrap_or("<no id>").to_string()
    }
}

/// A transformed record ready to be written to the target.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRecord {
    pub entity: EntityType,
    /// Target-native id, once known.
    pub target_id: Option<String>,
    pub natural_key: String,
    pub source_id: String,
    /// Fields owned by the transform, written on insert and update.
    pub fields: Document,
    /// Fields written only when the document is created.
    pub insert_defaults: Document,
}

impl TargetRecord {
    /// Full document body for an insert.
    pub fn insert_body(&self) -> Document {
        let mut body = self.insert_defaults.clone();
        for (key, value) in &self.fields {
            body.insert(key.clone(), value.clone());
        }
        body
    }

    /// Merge the transform-owned fields into an existing document body.
    ///
    /// Fields the transform does not own (view counters, fields written by the
    /// application after migration) are kept.
    pub fn merged_body(&self, existing: &Document) -> Document {
        let mut body = existing.clone();
        for (key, value) in &self.fields {
            body.insert(key.clone(), value.clone());
        }
        body
    }
}

/// A document as stored in the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    pub natural_key: String,
    pub source_id: Option<String>,
    pub body: Document,
}

/// A document write: insert or full replacement of an existing body.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWrite {
    pub natural_key: String,
    pub source_id: Option<String>,
    pub body: Document,
}

/// Result of a bulk insert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkInsertOutcome {
    /// (index into the submitted slice, new target id)
    pub inserted: Vec<(usize, String)>,
    /// (index into the submitted slice, error message)
    pub errors: Vec<(usize, String)>,
}

impl BulkInsertOutcome {
    pub fn inserted_count(&self) -> usize {
        self.inserted.len()
    }
}

/// Accept strings, numbers and booleans as text; null becomes `None`.
fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(other) => Some(other.to_string()),
    })
}

/// Decode a page of JSON rows, failing on the first row that is not an object.
pub fn decode_rows(entity: EntityType, rows: Vec<Value>) -> Result<Vec<SourceRecord>> {
    rows.into_iter()
        .map(|row| {
            if !row.is_object() {
                return Err(MigrateError::connector(
                    "source",
                    format!("{} row is not an object: {}", entity, row),
                ));
            }
            SourceRecord::decode(entity, row)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_ids_become_strings() {
        let record = SourceRecord::decode(
            EntityType::Cards,
            json!({"id": 10, "user_id": 1, "username": "carter"}),
        )
        .unwrap();
        assert_eq!(record.source_id(), Some("10"));
        match record {
            SourceRecord::Card(card) => assert_eq!(card.user_id.as_deref(), Some("1")),
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_unknown_columns_ignored() {
        let record = SourceRecord::decode(
            EntityType::Users,
            json!({"id": "u-1", "email": "a@x.com", "stripe_customer": "cus_1", "legacy": {"a": 1}}),
        )
        .unwrap();
        assert_eq!(record.entity_type(), EntityType::Users);
    }

    #[test]
    fn test_aliases() {
        let record = SourceRecord::decode(
            EntityType::Analytics,
            json!({"id": 5, "profile_id": 10, "event": "click"}),
        )
        .unwrap();
        match record {
            SourceRecord::Analytics(a) => {
                assert_eq!(a.card_id.as_deref(), Some("10"));
                assert_eq!(a.event_type.as_deref(), Some("click"));
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_blank_id_is_none() {
        let record = SourceRecord::decode(EntityType::Users, json!({"id": "  ", "email": "a@x.com"})).unwrap();
        assert_eq!(record.source_id(), None);
        assert_eq!(record.display_id(), "<no id>");
    }

    #[test]
    fn test_decode_rows_rejects_non_objects() {
        assert!(decode_rows(EntityType::Users, vec![json!([1, 2])]).is_err());
    }

    #[test]
    fn test_merged_body_keeps_target_only_fields() {
        let mut fields = Document::new();
        fields.insert("name".into(), json!("Carter"));
        let mut defaults = Document::new();
        defaults.insert("viewCount".into(), json!(0));
        let record = TargetRecord {
            entity: EntityType::Cards,
            target_id: None,
            natural_key: "carter".into(),
            source_id: "10".into(),
            fields,
            insert_defaults: defaults,
        };

        let existing = json!({"name": "Old", "viewCount": 42})
            .as_object()
            .cloned()
            .unwrap();
        let merged = record.merged_body(&existing);
        assert_eq!(merged["name"], json!("Carter"));
        assert_eq!(merged["viewCount"], json!(42));

        let inserted = record.insert_body();
        assert_eq!(inserted["viewCount"], json!(0));
    }
}
