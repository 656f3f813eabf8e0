//! Natural-key collision resolution.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::context::SharedContext;
use crate::core::{KeyPolicy, TargetRecord, TargetStore};
use crate::error::{MigrateError, Result, TransformError};

/// Hex characters in the random fallback suffix.
const RANDOM_SUFFIX_LEN: usize = 6;

/// Who holds a candidate key.
enum Holder {
    Free,
    Other(String),
}

/// Resolves natural-key collisions against the keys claimed in this run and
/// the keys already present in the target.
///
/// Records must be resolved one at a time in source order: the suffix a record
/// gets depends on the claims of every record before it.
pub struct KeyResolver {
    target: Arc<dyn TargetStore>,
    max_attempts: usize,
    random_suffix: fn() -> String,
}

impl KeyResolver {
    pub fn new(target: Arc<dyn TargetStore>, max_attempts: usize) -> Self {
        Self {
            target,
            max_attempts: max_attempts.max(1),
            random_suffix: uuid_suffix,
        }
    }

    #[cfg(test)]
    fn with_random_suffix(mut self, random_suffix: fn() -> String) -> Self {
        self.random_suffix = random_suffix;
        self
    }

    /// Settle the natural key of `record` and claim it in the context.
    ///
    /// A collision under [`KeyPolicy::Reject`] is returned as a
    /// [`TransformError::DuplicateKey`]; connector failures are fatal.
    pub async fn resolve(&self, record: &mut TargetRecord, ctx: &SharedContext) -> Result<()> {
        let policy = record.entity.key_policy();
        if policy == KeyPolicy::Intrinsic {
            claim(ctx, &record.natural_key, &record.source_id)?;
            return Ok(());
        }

        let base = record.natural_key.clone();
        let mut resolved = None;
        for attempt in 0..self.max_attempts {
            let candidate = if attempt == 0 {
                base.clone()
            } else {
                format!("{}{}", base, attempt)
            };
            match self.holder(record, &candidate, ctx).await? {
                Holder::Free => {
                    resolved = Some(candidate);
                    break;
                }
                Holder::Other(owner) if policy == KeyPolicy::Reject => {
                    return Err(TransformError::DuplicateKey {
                        entity: record.entity.to_string(),
                        source_id: record.source_id.clone(),
                        key: candidate,
                        owner,
                    }
                    .into());
                }
                Holder::Other(owner) => {
                    debug!(
                        "{} {}: key '{}' held by {}, trying next suffix",
                        record.entity, record.source_id, candidate, owner
                    );
                }
            }
        }

        let key = match resolved {
            Some(key) => key,
            None => self.random_key(record, &base, ctx).await?,
        };
        if key != base {
            debug!(
                "{} {}: natural key '{}' resolved to '{}'",
                record.entity, record.source_id, base, key
            );
        }

        claim(ctx, &key, &record.source_id)?;
        if record.fields.contains_key("username") {
            record.fields.insert("username".to_string(), Value::String(key.clone()));
        }
        record.natural_key = key;
        Ok(())
    }

    /// Random suffixes, tried at most `max_attempts` times.
    async fn random_key(&self, record: &TargetRecord, base: &str, ctx: &SharedContext) -> Result<String> {
        let mut last = (String::new(), String::new());
        for _ in 0..self.max_attempts {
            let candidate = format!("{}-{}", base, (self.random_suffix)());
            match self.holder(record, &candidate, ctx).await? {
                Holder::Free => return Ok(candidate),
                Holder::Other(owner) => last = (candidate, owner),
            }
        }
        let (key, owner) = last;
        Err(TransformError::DuplicateKey {
            entity: record.entity.to_string(),
            source_id: record.source_id.clone(),
            key,
            owner,
        }
        .into())
    }

    async fn holder(&self, record: &TargetRecord, candidate: &str, ctx: &SharedContext) -> Result<Holder> {
        {
            let guard = ctx
                .lock()
                .map_err(|_| MigrateError::Worker("transform context lock poisoned".into()))?;
            match guard.claimed_by(candidate) {
                Some(owner) if owner == record.source_id => return Ok(Holder::Free),
                Some(owner) => return Ok(Holder::Other(owner.to_string())),
                None => {}
            }
        }

        let existing = self
            .target
            .find_by_natural_key(record.entity, candidate)
            .await?;
        Ok(match existing {
            None => Holder::Free,
            // Created natively in the target: adopted by the upsert.
            Some(doc) if doc.source_id.is_none() => Holder::Free,
            Some(doc) if doc.source_id.as_deref() == Some(record.source_id.as_str()) => Holder::Free,
            Some(doc) => Holder::Other(doc.source_id.unwrap_or_default()),
        })
    }
}

fn uuid_suffix() -> String {
    Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(RANDOM_SUFFIX_LEN)
        .collect()
}

fn claim(ctx: &SharedContext, key: &str, source_id: &str) -> Result<()> {
    let mut guard = ctx
        .lock()
        .map_err(|_| MigrateError::Worker("transform context lock poisoned".into()))?;
    guard.claim(key, source_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DocumentWrite, EntityType, SourceRecord};
    use crate::target::InMemoryTarget;
    use crate::transform::{TransformContext, Transformer};
    use serde_json::json;
    use std::collections::HashMap;

    fn card(id: u32, username: &str) -> TargetRecord {
        let mut users = HashMap::new();
        users.insert("1".to_string(), "u1".to_string());
        let ctx = TransformContext::new().with_parent_map(EntityType::Users, users);
        let row = SourceRecord::decode(
            EntityType::Cards,
            json!({"id": id, "user_id": 1, "username": username}),
        )
        .unwrap();
        Transformer::new().transform(&row, &ctx).unwrap()
    }

    fn user(id: u32, email: &str) -> TargetRecord {
        let row = SourceRecord::decode(EntityType::Users, json!({"id": id, "email": email})).unwrap();
        Transformer::new().transform(&row, &TransformContext::new()).unwrap()
    }

    fn seed(target: &InMemoryTarget, entity: EntityType, key: &str, sid: Option<&str>) {
        target
            .seed(
                entity,
                DocumentWrite {
                    natural_key: key.into(),
                    source_id: sid.map(str::to_string),
                    body: serde_json::Map::new(),
                },
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_suffixes_in_claim_order() {
        let target = Arc::new(InMemoryTarget::new());
        let resolver = KeyResolver::new(target, 100);
        let ctx = TransformContext::new().into_shared();

        let mut first = card(10, "carter");
        let mut second = card(11, "Carter");
        let mut third = card(12, "carter ");
        resolver.resolve(&mut first, &ctx).await.unwrap();
        resolver.resolve(&mut second, &ctx).await.unwrap();
        resolver.resolve(&mut third, &ctx).await.unwrap();

        assert_eq!(first.natural_key, "carter");
        assert_eq!(second.natural_key, "carter1");
        assert_eq!(third.natural_key, "carter2");
        assert_eq!(second.fields["username"], json!("carter1"));
    }

    #[tokio::test]
    async fn test_existing_target_keys_are_respected() {
        let target = Arc::new(InMemoryTarget::new());
        seed(&target, EntityType::Cards, "carter", Some("99"));
        let resolver = KeyResolver::new(target, 100);
        let ctx = TransformContext::new().into_shared();

        let mut record = card(10, "carter");
        resolver.resolve(&mut record, &ctx).await.unwrap();
        assert_eq!(record.natural_key, "carter1");
    }

    #[tokio::test]
    async fn test_own_and_native_keys_are_reused() {
        let target = Arc::new(InMemoryTarget::new());
        seed(&target, EntityType::Cards, "carter", Some("10"));
        seed(&target, EntityType::Cards, "dana", None);
        let resolver = KeyResolver::new(target, 100);
        let ctx = TransformContext::new().into_shared();

        let mut rerun = card(10, "carter");
        let mut native = card(11, "dana");
        resolver.resolve(&mut rerun, &ctx).await.unwrap();
        resolver.resolve(&mut native, &ctx).await.unwrap();
        assert_eq!(rerun.natural_key, "carter");
        assert_eq!(native.natural_key, "dana");
    }

    #[tokio::test]
    async fn test_random_suffix_after_exhaustion() {
        let target = Arc::new(InMemoryTarget::new());
        let resolver = KeyResolver::new(target, 2);
        let ctx = TransformContext::new().into_shared();

        let mut records: Vec<_> = (10..13).map(|id| card(id, "carter")).collect();
        for record in records.iter_mut() {
            resolver.resolve(record, &ctx).await.unwrap();
        }
        assert_eq!(records[0].natural_key, "carter");
        assert_eq!(records[1].natural_key, "carter1");
        let last = &records[2].natural_key;
        assert!(last.starts_with("carter-"));
        assert_eq!(last.len(), "carter-".len() + RANDOM_SUFFIX_LEN);
    }

    #[tokio::test]
    async fn test_random_suffix_attempts_are_bounded() {
        let target = Arc::new(InMemoryTarget::new());
        let resolver = KeyResolver::new(target, 2).with_random_suffix(|| "abcdef".to_string());
        let ctx = TransformContext::new().into_shared();
        ctx.lock().unwrap().claim("carter-abcdef", "99");

        let mut first = card(10, "carter");
        let mut second = card(11, "carter");
        let mut third = card(12, "carter");
        resolver.resolve(&mut first, &ctx).await.unwrap();
        resolver.resolve(&mut second, &ctx).await.unwrap();
        let err = resolver.resolve(&mut third, &ctx).await.unwrap_err();
        assert!(!err.is_fatal());
        assert!(matches!(
            err,
            MigrateError::Transform(TransformError::DuplicateKey { ref key, .. }) if key == "carter-abcdef"
        ));
    }

    #[tokio::test]
    async fn test_user_email_collision_is_rejected() {
        let target = Arc::new(InMemoryTarget::new());
        let resolver = KeyResolver::new(target, 100);
        let ctx = TransformContext::new().into_shared();

        let mut first = user(1, "a@x.com");
        let mut second = user(2, "A@X.COM");
        resolver.resolve(&mut first, &ctx).await.unwrap();
        let err = resolver.resolve(&mut second, &ctx).await.unwrap_err();
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("already belongs to source record 1"));
    }

    #[tokio::test]
    async fn test_intrinsic_keys_skip_lookups() {
        let target = Arc::new(InMemoryTarget::new());
        let resolver = KeyResolver::new(target.clone(), 100);
        let ctx = TransformContext::new().into_shared();
        let mut users = HashMap::new();
        users.insert("10".to_string(), "c10".to_string());
        let parent_ctx = TransformContext::new().with_parent_map(EntityType::Cards, users);

        let row = SourceRecord::decode(EntityType::Analytics, json!({"id": 5, "card_id": 10})).unwrap();
        let mut record = Transformer::new().transform(&row, &parent_ctx).unwrap();
        resolver.resolve(&mut record, &ctx).await.unwrap();
        assert_eq!(record.natural_key, "analytics-5");
        assert_eq!(target.reads(), 0);
    }
}
