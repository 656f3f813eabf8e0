//! Source-to-target record transformation.
//!
//! [`Transformer::map`] is a pure function of the source record: field
//! renaming, defaults, coercion and the base natural key. [`Transformer::transform`]
//! adds foreign-key resolution from the [`TransformContext`]. Collision
//! handling needs target look-ups and lives in [`KeyResolver`].

pub mod coerce;
mod context;
mod keys;

pub use context::{SharedContext, TransformContext};
pub use keys::KeyResolver;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::core::{
    Document, EntityType, SourceAnalytics, SourceCard, SourceRecord, SourceUser, TargetRecord,
};
use crate::error::TransformError;

use coerce::{clean_text, coerce_bool, format_timestamp, non_blank, normalize_key, parse_timestamp};

/// Event type written when the source row has none.
pub const DEFAULT_EVENT_TYPE: &str = "view";

/// A reference from a mapped record to its parent record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentRef {
    pub entity: EntityType,
    /// Target field holding the parent's target id.
    pub field: &'static str,
    /// Parent source id as found in the source row.
    pub source_id: String,
}

/// Output of the pure mapping step.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRecord {
    pub entity: EntityType,
    pub source_id: String,
    /// Natural key before collision handling.
    pub natural_key: String,
    pub fields: Document,
    pub insert_defaults: Document,
    pub parent: Option<ParentRef>,
    /// Timestamp fields that were absent or malformed and got the default.
    pub defaulted: Vec<&'static str>,
}

/// Maps source records to target records.
#[derive(Debug, Clone)]
pub struct Transformer {
    now: DateTime<Utc>,
}

impl Default for Transformer {
    fn default() -> Self {
        Self::new()
    }
}

impl Transformer {
    /// A transformer that fills missing timestamps with the current time.
    pub fn new() -> Self {
        Self { now: Utc::now() }
    }

    /// A transformer with a fixed "now".
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now }
    }

    /// Map a source record without resolving its parent reference.
    pub fn map(&self, record: &SourceRecord) -> Result<MappedRecord, TransformError> {
        let entity = record.entity_type();
        let source_id = record
            .source_id()
            .map(str::to_string)
            .ok_or_else(|| TransformError::MissingField {
                entity: entity.to_string(),
                source_id: record.display_id(),
                field: "id".to_string(),
            })?;

        let mut mapped = MappedRecord {
            entity,
            natural_key: String::new(),
            fields: Document::new(),
            insert_defaults: Document::new(),
            parent: None,
            defaulted: Vec::new(),
            source_id,
        };
        mapped.put("sourceId", mapped.source_id.clone());

        match record {
            SourceRecord::User(user) => self.map_user(user, &mut mapped)?,
            SourceRecord::Card(card) => self.map_card(card, &mut mapped)?,
            SourceRecord::Analytics(event) => self.map_analytics(event, &mut mapped)?,
        }
        Ok(mapped)
    }

    /// Map a source record and resolve its parent reference from the context.
    pub fn transform(
        &self,
        record: &SourceRecord,
        ctx: &TransformContext,
    ) -> Result<TargetRecord, TransformError> {
        let mut mapped = self.map(record)?;

        if let Some(parent) = &mapped.parent {
            let target_id = ctx
                .parent_target_id(parent.entity, &parent.source_id)
                .ok_or_else(|| TransformError::MissingParent {
                    entity: mapped.entity.to_string(),
                    source_id: mapped.source_id.clone(),
                    parent: parent.entity.to_string(),
                    parent_id: parent.source_id.clone(),
                })?
                .to_string();
            mapped.fields.insert(parent.field.to_string(), Value::String(target_id));
        }

        Ok(TargetRecord {
            entity: mapped.entity,
            target_id: None,
            natural_key: mapped.natural_key,
            source_id: mapped.source_id,
            fields: mapped.fields,
            insert_defaults: mapped.insert_defaults,
        })
    }

    fn map_user(&self, user: &SourceUser, out: &mut MappedRecord) -> Result<(), TransformError> {
        let email = non_blank(user.email.as_deref()).map(normalize_key);
        out.natural_key = match &email {
            Some(email) => email.clone(),
            None => synthesized_key(out.entity, &out.source_id),
        };

        out.put("email", email.unwrap_or_default());
        out.put("name", clean_text(user.name.as_deref()));
        out.put("avatarUrl", clean_text(user.avatar_url.as_deref()));
        let verified = out.flag("emailVerified", user.email_verified.as_ref())?;
        out.put("emailVerified", verified);
        self.timestamp(out, "createdAt", user.created_at.as_ref());
        self.timestamp(out, "updatedAt", user.updated_at.as_ref());
        Ok(())
    }

    fn map_card(&self, card: &SourceCard, out: &mut MappedRecord) -> Result<(), TransformError> {
        let user_id = out.required("user_id", card.user_id.as_deref())?;
        out.parent = Some(ParentRef {
            entity: EntityType::Users,
            field: "userId",
            source_id: user_id,
        });

        out.natural_key = match non_blank(card.username.as_deref()) {
            Some(username) => normalize_key(username),
            None => synthesized_key(out.entity, &out.source_id),
        };

        out.put("username", out.natural_key.clone());
        out.put("name", clean_text(card.name.as_deref()));
        out.put("title", clean_text(card.title.as_deref()));
        out.put("company", clean_text(card.company.as_deref()));
        out.put("bio", clean_text(card.bio.as_deref()));
        out.put("email", clean_text(card.email.as_deref()));
        out.put("phone", clean_text(card.phone.as_deref()));
        out.put("website", clean_text(card.website.as_deref()));
        out.put("avatarUrl", clean_text(card.avatar_url.as_deref()));
        out.put("theme", clean_text(card.theme.as_deref()));
        let public = out.flag("isPublic", card.is_public.as_ref())?;
        out.put("isPublic", public);
        self.timestamp(out, "createdAt", card.created_at.as_ref());
        self.timestamp(out, "updatedAt", card.updated_at.as_ref());

        out.insert_defaults.insert("viewCount".to_string(), Value::from(0));
        Ok(())
    }

    fn map_analytics(&self, event: &SourceAnalytics, out: &mut MappedRecord) -> Result<(), TransformError> {
        let card_id = out.required("card_id", event.card_id.as_deref())?;
        out.parent = Some(ParentRef {
            entity: EntityType::Cards,
            field: "cardId",
            source_id: card_id,
        });
        out.natural_key = synthesized_key(out.entity, &out.source_id);

        let event_type = non_blank(event.event_type.as_deref())
            .map(normalize_key)
            .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string());
        out.put("eventType", event_type);
        out.put("visitorId", clean_text(event.visitor_id.as_deref()));
        out.put("referrer", clean_text(event.referrer.as_deref()));
        out.put("userAgent", clean_text(event.user_agent.as_deref()));
        self.timestamp(out, "createdAt", event.created_at.as_ref());
        Ok(())
    }

    fn timestamp(&self, out: &mut MappedRecord, field: &'static str, value: Option<&Value>) {
        let ts = match parse_timestamp(value) {
            Some(ts) => ts,
            None => {
                if let Some(raw) = value.filter(|v| !v.is_null()) {
                    debug!(
                        "{} {}: unparseable {} {}, using current time",
                        out.entity, out.source_id, field, raw
                    );
                }
                out.defaulted.push(field);
                self.now
            }
        };
        out.put(field, format_timestamp(&ts));
    }
}

impl MappedRecord {
    fn put(&mut self, field: &str, value: impl Into<Value>) {
        self.fields.insert(field.to_string(), value.into());
    }

    fn required(&self, field: &str, value: Option<&str>) -> Result<String, TransformError> {
        non_blank(value)
            .map(str::to_string)
            .ok_or_else(|| TransformError::MissingField {
                entity: self.entity.to_string(),
                source_id: self.source_id.clone(),
                field: field.to_string(),
            })
    }

    fn flag(&self, field: &str, value: Option<&Value>) -> Result<bool, TransformError> {
        coerce_bool(value).map_err(|raw| TransformError::InvalidBoolean {
            entity: self.entity.to_string(),
            source_id: self.source_id.clone(),
            field: field.to_string(),
            value: raw,
        })
    }
}

/// Key for records without a usable human key: `<prefix>-<sourceId>`.
pub fn synthesized_key(entity: EntityType, source_id: &str) -> String {
    normalize_key(&format!("{}-{}", entity.key_prefix(), source_id))
}
