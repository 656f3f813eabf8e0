//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::EntityType;

/// Root configuration structure.
///
/// Connection descriptors come from the environment; everything else can be
/// tuned through an optional YAML file (see [`TuningFile`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Relational source store (PostgreSQL).
    pub source: SourceConfig,

    /// Document target store.
    pub target: TargetConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Reconciliation behavior configuration.
    #[serde(default)]
    pub verify: VerifyConfig,

    /// Source table names per entity.
    #[serde(default)]
    pub tables: SourceTables,
}

/// The YAML tuning file accepted by `--config`.
///
/// It deliberately has no connection fields: those are only read from the
/// environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TuningFile {
    #[serde(default)]
    pub migration: Option<MigrationConfig>,

    #[serde(default)]
    pub verify: Option<VerifyConfig>,

    #[serde(default)]
    pub tables: Option<SourceTables>,
}

/// Relational source store configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Connection URL (`SOURCE_DATABASE_URL`).
    pub url: String,

    /// Schema holding the source tables (default: "public").
    #[serde(default = "default_source_schema")]
    pub schema: String,

    /// SSL mode (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("url", &redact_url(&self.url))
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Document target store configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Connection URL (`TARGET_DATABASE_URL`).
    pub url: String,

    /// Schema holding the document collections (default: "card_documents").
    #[serde(default = "default_target_schema")]
    pub schema: String,

    /// SSL mode (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("url", &redact_url(&self.url))
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Migration behavior configuration.
/// Fields use Option<T> to distinguish between "not set" (use default) and
/// "explicitly set" (use provided value), so env and CLI overrides can layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Concurrent target writes within a phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Records per bulk chunk for high-volume entities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,

    /// Rows per source page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,

    /// Maximum PostgreSQL connections per store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,

    /// Numeric suffix attempts before falling back to a random suffix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_key_attempts: Option<usize>,

    /// Errors kept per phase in the report sample.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_sample_limit: Option<usize>,
}

impl MigrationConfig {
    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(1)
    }

    pub fn get_chunk_size(&self) -> usize {
        self.chunk_size.unwrap_or(100)
    }

    pub fn get_page_size(&self) -> usize {
        self.page_size.unwrap_or(1_000)
    }

    pub fn get_max_connections(&self) -> usize {
        self.max_connections
            .unwrap_or_else(|| (self.get_workers() * 2).clamp(4, 32))
    }

    pub fn get_max_key_attempts(&self) -> usize {
        self.max_key_attempts.unwrap_or(100)
    }

    pub fn get_error_sample_limit(&self) -> usize {
        self.error_sample_limit.unwrap_or(10)
    }

    /// Layer explicitly set values from `other` over this config.
    pub fn merge(&mut self, other: &MigrationConfig) {
        if other.workers.is_some() {
            self.workers = other.workers;
        }
        if other.chunk_size.is_some() {
            self.chunk_size = other.chunk_size;
        }
        if other.page_size.is_some() {
            self.page_size = other.page_size;
        }
        if other.max_connections.is_some() {
            self.max_connections = other.max_connections;
        }
        if other.max_key_attempts.is_some() {
            self.max_key_attempts = other.max_key_attempts;
        }
        if other.error_sample_limit.is_some() {
            self.error_sample_limit = other.error_sample_limit;
        }
    }
}

/// How timestamps are compared during reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateGranularity {
    /// Same calendar day (UTC).
    Day,
    /// Same instant, to the millisecond.
    Exact,
}

impl std::str::FromStr for DateGranularity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "day" => Ok(DateGranularity::Day),
            "exact" => Ok(DateGranularity::Exact),
            other => Err(format!(
                "invalid date granularity '{}', expected 'day' or 'exact'",
                other
            )),
        }
    }
}

/// Reconciliation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Timestamp granularity for users.
    #[serde(default = "default_exact")]
    pub users_date_granularity: DateGranularity,

    /// Timestamp granularity for cards.
    #[serde(default = "default_exact")]
    pub cards_date_granularity: DateGranularity,

    /// Timestamp granularity for analytics events.
    #[serde(default = "default_day")]
    pub analytics_date_granularity: DateGranularity,

    /// Mismatches kept per entity in the report sample.
    #[serde(default = "default_sample_limit")]
    pub sample_limit: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            users_date_granularity: DateGranularity::Exact,
            cards_date_granularity: DateGranularity::Exact,
            analytics_date_granularity: DateGranularity::Day,
            sample_limit: default_sample_limit(),
        }
    }
}

impl VerifyConfig {
    /// Granularity used for the given entity's timestamps.
    pub fn granularity_for(&self, entity: EntityType) -> DateGranularity {
        match entity {
            EntityType::Users => self.users_date_granularity,
            EntityType::Cards => self.cards_date_granularity,
            EntityType::Analytics => self.analytics_date_granularity,
        }
    }

    /// Force one granularity for every entity.
    pub fn with_granularity(mut self, granularity: DateGranularity) -> Self {
        self.users_date_granularity = granularity;
        self.cards_date_granularity = granularity;
        self.analytics_date_granularity = granularity;
        self
    }
}

/// Source table names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceTables {
    #[serde(default = "default_users_table")]
    pub users: String,

    #[serde(default = "default_cards_table")]
    pub cards: String,

    #[serde(default = "default_analytics_table")]
    pub analytics: String,
}

impl Default for SourceTables {
    fn default() -> Self {
        Self {
            users: default_users_table(),
            cards: default_cards_table(),
            analytics: default_analytics_table(),
        }
    }
}

impl SourceTables {
    /// Source table for an entity type.
    pub fn table_for(&self, entity: EntityType) -> &str {
        match entity {
            EntityType::Users => &self.users,
            EntityType::Cards => &self.cards,
            EntityType::Analytics => &self.analytics,
        }
    }
}

/// Replace the password component of a connection URL.
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return "[REDACTED]".to_string();
    };
    match rest.rsplit_once('@') {
        Some((credentials, host)) => {
            let user = credentials.split(':').next().unwrap_or_default();
            format!("{}://{}:[REDACTED]@{}", scheme, user, host)
        }
        None => url.to_string(),
    }
}

// Default value functions for serde
fn default_source_schema() -> String {
    "public".to_string()
}

pub(crate) fn default_target_schema() -> String {
    "card_documents".to_string()
}

fn default_require() -> String {
    "require".to_string()
}

fn default_exact() -> DateGranularity {
    DateGranularity::Exact
}

fn default_day() -> DateGranularity {
    DateGranularity::Day
}

fn default_sample_limit() -> usize {
    10
}

fn default_users_table() -> String {
    "users".to_string()
}

fn default_cards_table() -> String {
    "cards".to_string()
}

fn default_analytics_table() -> String {
    "card_analytics".to_string()
}
