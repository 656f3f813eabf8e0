//! Field-level comparison of an expected (mapped) record with a stored document.

use std::collections::HashMap;

use serde_json::Value;

use crate::config::DateGranularity;
use crate::core::{EntityType, StoredDocument};
use crate::transform::coerce::{coerce_bool, parse_timestamp};
use crate::transform::MappedRecord;

/// How a field is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Trimmed text; null and absent equal `""`.
    Text,
    /// A natural key that may carry a collision suffix.
    Key,
    Bool,
    Timestamp,
    /// Target id of a parent document, compared through the parent's source id.
    ParentRef,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

const fn field(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { name, kind }
}

const USER_FIELDS: &[FieldSpec] = &[
    field("email", FieldKind::Text),
    field("name", FieldKind::Text),
    field("avatarUrl", FieldKind::Text),
    field("emailVerified", FieldKind::Bool),
    field("createdAt", FieldKind::Timestamp),
    field("updatedAt", FieldKind::Timestamp),
];

const CARD_FIELDS: &[FieldSpec] = &[
    field("userId", FieldKind::ParentRef),
    field("username", FieldKind::Key),
    field("name", FieldKind::Text),
    field("title", FieldKind::Text),
    field("company", FieldKind::Text),
    field("bio", FieldKind::Text),
    field("email", FieldKind::Text),
    field("phone", FieldKind::Text),
    field("website", FieldKind::Text),
    field("avatarUrl", FieldKind::Text),
    field("theme", FieldKind::Text),
    field("isPublic", FieldKind::Bool),
    field("createdAt", FieldKind::Timestamp),
    field("updatedAt", FieldKind::Timestamp),
];

const ANALYTICS_FIELDS: &[FieldSpec] = &[
    field("cardId", FieldKind::ParentRef),
    field("eventType", FieldKind::Text),
    field("visitorId", FieldKind::Text),
    field("referrer", FieldKind::Text),
    field("userAgent", FieldKind::Text),
    field("createdAt", FieldKind::Timestamp),
];

/// Fields compared for an entity type.
pub fn fields_for(entity: EntityType) -> &'static [FieldSpec] {
    match entity {
        EntityType::Users => USER_FIELDS,
        EntityType::Cards => CARD_FIELDS,
        EntityType::Analytics => ANALYTICS_FIELDS,
    }
}

/// Compare a mapped source record with its stored document.
///
/// `parent_sources` maps parent target ids to parent source ids. Returns the
/// names of the fields that differ.
pub fn compare(
    expected: &MappedRecord,
    doc: &StoredDocument,
    granularity: DateGranularity,
    parent_sources: &HashMap<String, Option<String>>,
) -> Vec<String> {
    let mut differing = Vec::new();
    for check in fields_for(expected.entity) {
        let actual = doc.body.get(check.name);
        let equal = match check.kind {
            FieldKind::Text => text(expected.fields.get(check.name)) == text(actual),
            FieldKind::Key => {
                key_matches(&text(expected.fields.get(check.name)), &text(actual))
            }
            FieldKind::Bool => {
                let want = coerce_bool(expected.fields.get(check.name)).unwrap_or(false);
                coerce_bool(actual).map(|got| got == want).unwrap_or(false)
            }
            FieldKind::Timestamp => {
                expected.defaulted.contains(&check.name)
                    || timestamps_equal(expected.fields.get(check.name), actual, granularity)
            }
            FieldKind::ParentRef => {
                let want = expected.parent.as_ref().map(|p| p.source_id.as_str());
                let got = actual
                    .and_then(Value::as_str)
                    .and_then(|target_id| parent_sources.get(target_id))
                    .and_then(|sid| sid.as_deref());
                want.is_some() && want == got
            }
        };
        if !equal {
            differing.push(check.name.to_string());
        }
    }
    differing
}

fn text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => other.to_string(),
    }
}

/// `actual` is `base` itself, `base` with a numeric suffix, or `base` with
/// the random fallback suffix.
pub fn key_matches(base: &str, actual: &str) -> bool {
    let base = base.to_lowercase();
    let actual = actual.to_lowercase();
    if actual == base {
        return true;
    }
    match actual.strip_prefix(base.as_str()) {
        Some(rest) if rest.chars().all(|c| c.is_ascii_digit()) => !rest.is_empty(),
        Some(rest) => match rest.strip_prefix('-') {
            Some(hex) => hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit()),
            None => false,
        },
        None => false,
    }
}

fn timestamps_equal(expected: Option<&Value>, actual: Option<&Value>, granularity: DateGranularity) -> bool {
    match (parse_timestamp(expected), parse_timestamp(actual)) {
        (Some(a), Some(b)) => match granularity {
            DateGranularity::Day => a.date_naive() == b.date_naive(),
            DateGranularity::Exact => a.timestamp_millis() == b.timestamp_millis(),
        },
        _ => false,
    }
}
