//! Entity types and run scopes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MigrateError;

/// The three migrated entity types, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Users,
    Cards,
    Analytics,
}

/// How a natural-key collision is handled for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPolicy {
    /// Append a numeric suffix until the key is free.
    Suffix,
    /// Reject the record; the key is an identity that must not be altered.
    Reject,
    /// The key embeds the source id and cannot collide.
    Intrinsic,
}

impl EntityType {
    /// All entity types in phase order.
    pub const ALL: [EntityType; 3] = [EntityType::Users, EntityType::Cards, EntityType::Analytics];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Users => "users",
            EntityType::Cards => "cards",
            EntityType::Analytics => "analytics",
        }
    }

    /// Target collection name.
    pub fn collection(&self) -> &'static str {
        self.as_str()
    }

    /// Prefix used when a natural key has to be synthesized.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            EntityType::Users => "user",
            EntityType::Cards => "card",
            EntityType::Analytics => "analytics",
        }
    }

    /// The entity whose ids this entity references.
    pub fn parent(&self) -> Option<EntityType> {
        match self {
            EntityType::Users => None,
            EntityType::Cards => Some(EntityType::Users),
            EntityType::Analytics => Some(EntityType::Cards),
        }
    }

    /// The entity that references this one.
    pub fn child(&self) -> Option<EntityType> {
        match self {
            EntityType::Users => Some(EntityType::Cards),
            EntityType::Cards => Some(EntityType::Analytics),
            EntityType::Analytics => None,
        }
    }

    /// High-volume entities are written in bulk chunks.
    pub fn is_bulk(&self) -> bool {
        matches!(self, EntityType::Analytics)
    }

    pub fn key_policy(&self) -> KeyPolicy {
        match self {
            EntityType::Users => KeyPolicy::Reject,
            EntityType::Cards => KeyPolicy::Suffix,
            EntityType::Analytics => KeyPolicy::Intrinsic,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "users" | "user" => Ok(EntityType::Users),
            "cards" | "card" | "profiles" => Ok(EntityType::Cards),
            "analytics" => Ok(EntityType::Analytics),
            other => Err(MigrateError::Config(format!(
                "unknown entity type '{}'. Valid values: users, cards, analytics",
                other
            ))),
        }
    }
}

/// What a migration run (and its marker) covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunScope {
    Users,
    Cards,
    Analytics,
    Full,
}

impl RunScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunScope::Users => "users",
            RunScope::Cards => "cards",
            RunScope::Analytics => "analytics",
            RunScope::Full => "full",
        }
    }

    /// Entities covered by this scope, in phase order.
    pub fn entities(&self) -> Vec<EntityType> {
        match self {
            RunScope::Users => vec![EntityType::Users],
            RunScope::Cards => vec![EntityType::Cards],
            RunScope::Analytics => vec![EntityType::Analytics],
            RunScope::Full => EntityType::ALL.to_vec(),
        }
    }
}

impl From<EntityType> for RunScope {
    fn from(entity: EntityType) -> Self {
        match entity {
            EntityType::Users => RunScope::Users,
            EntityType::Cards => RunScope::Cards,
            EntityType::Analytics => RunScope::Analytics,
        }
    }
}

impl fmt::Display for RunScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunScope {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "full" => Ok(RunScope::Full),
            other => other.parse::<EntityType>().map(RunScope::from),
        }
    }
}
