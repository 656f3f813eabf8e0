//! Per-phase transform context.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::core::EntityType;

/// Context shared between the phase loop and its write tasks.
///
/// Never held across an `.await`.
pub type SharedContext = Arc<Mutex<TransformContext>>;

/// Id remaps and claimed natural keys for one phase.
#[derive(Debug, Default, Clone)]
pub struct TransformContext {
    /// Parent entity -> (parent source id -> parent target id).
    parents: HashMap<EntityType, HashMap<String, String>>,
    /// Current phase: source id -> target id.
    migrated: HashMap<String, String>,
    /// Natural key -> owning source id, for keys claimed during this run.
    claimed: HashMap<String, String>,
}

impl TransformContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parent_map(mut self, parent: EntityType, map: HashMap<String, String>) -> Self {
        self.parents.insert(parent, map);
        self
    }

    pub fn into_shared(self) -> SharedContext {
        Arc::new(Mutex::new(self))
    }

    /// Target id of a migrated parent record.
    pub fn parent_target_id(&self, parent: EntityType, source_id: &str) -> Option<&str> {
        self.parents
            .get(&parent)
            .and_then(|m| m.get(source_id))
            .map(String::as_str)
    }

    pub fn parent_count(&self, parent: EntityType) -> usize {
        self.parents.get(&parent).map(HashMap::len).unwrap_or(0)
    }

    pub fn record_migrated(&mut self, source_id: impl Into<String>, target_id: impl Into<String>) {
        self.migrated.insert(source_id.into(), target_id.into());
    }

    pub fn migrated(&self) -> &HashMap<String, String> {
        &self.migrated
    }

    pub fn take_migrated(&mut self) -> HashMap<String, String> {
        std::mem::take(&mut self.migrated)
    }

    /// Source id owning a key claimed earlier in this run.
    pub fn claimed_by(&self, key: &str) -> Option<&str> {
        self.claimed.get(key).map(String::as_str)
    }

    pub fn claim(&mut self, key: impl Into<String>, source_id: impl Into<String>) {
        self.claimed.insert(key.into(), source_id.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_lookup() {
        let mut users = HashMap::new();
        users.insert("1".to_string(), "t-1".to_string());
        let ctx = TransformContext::new().with_parent_map(EntityType::Users, users);

        assert_eq!(ctx.parent_target_id(EntityType::Users, "1"), Some("t-1"));
        assert_eq!(ctx.parent_target_id(EntityType::Users, "2"), None);
        assert_eq!(ctx.parent_count(EntityType::Users), 1);
        assert_eq!(ctx.parent_count(EntityType::Cards), 0);
    }

    #[test]
    fn test_claims_and_migrated() {
        let mut ctx = TransformContext::new();
        ctx.claim("carter", "10");
        assert_eq!(ctx.claimed_by("carter"), Some("10"));
        assert_eq!(ctx.claimed_by("carter1"), None);

        ctx.record_migrated("10", "t-10");
        assert_eq!(ctx.migrated().len(), 1);
        assert_eq!(ctx.take_migrated().len(), 1);
        assert!(ctx.migrated().is_empty());
    }
}
