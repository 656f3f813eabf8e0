//! Error types for the migration library.
//!
//! Errors fall into two classes. Fatal errors (configuration, connector,
//! marker and phase-ordering failures) stop the current phase and bubble up to
//! the CLI. Record-level errors (transform failures and target constraint
//! violations) are caught at the upsert boundary, counted, and sampled.

use thiserror::Error;

/// Exit code for configuration errors.
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for connector (store) failures.
pub const EXIT_CONNECTOR_ERROR: u8 = 2;
/// Exit code for run marker failures.
pub const EXIT_STATE_ERROR: u8 = 3;
/// Exit code when a phase runs without its parent data.
pub const EXIT_PHASE_ORDER_ERROR: u8 = 4;
/// Exit code for serialization failures and record-level data errors.
pub const EXIT_SERIALIZATION_ERROR: u8 = 5;
/// Exit code when a worker task panics or the worker pool fails.
pub const EXIT_WORKER_ERROR: u8 = 6;
/// Exit code for file system failures.
pub const EXIT_IO_ERROR: u8 = 7;
/// Exit code for a cancelled run (SIGINT/SIGTERM).
pub const EXIT_CANCELLED: u8 = 130;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (missing connection descriptor, invalid YAML value, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A store could not be reached or returned a non-record-level failure.
    #[error("{store} store error: {message}")]
    Connector { store: String, message: String },

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// The target rejected a single write (e.g. uniqueness violation).
    #[error("Constraint violation on {entity} '{key}': {message}")]
    Constraint {
        entity: String,
        key: String,
        message: String,
    },

    /// A single source record could not be transformed.
    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    /// A child phase was started before its parent phase produced any data.
    #[error("Cannot migrate {entity}: no migrated {parent} found in the target. Run the {parent} phase first.")]
    MissingParentPhase { entity: String, parent: String },

    /// Run marker could not be read or written.
    #[error("Run marker error: {0}")]
    State(String),

    /// A spawned worker task panicked or the worker pool was closed.
    #[error("Worker task failed: {0}")]
    Worker(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

/// Reasons a single source record is skipped by the transformer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// The referenced parent record has not been migrated.
    #[error("{entity} {source_id}: parent {parent} '{parent_id}' has not been migrated")]
    MissingParent {
        entity: String,
        source_id: String,
        parent: String,
        parent_id: String,
    },

    /// A required source column is absent or empty.
    #[error("{entity} {source_id}: required field '{field}' is missing")]
    MissingField {
        entity: String,
        source_id: String,
        field: String,
    },

    /// A loosely typed flag could not be mapped to a boolean.
    #[error("{entity} {source_id}: field '{field}' has non-boolean value {value}")]
    InvalidBoolean {
        entity: String,
        source_id: String,
        field: String,
        value: String,
    },

    /// The natural key is owned by another source record and cannot be suffixed.
    #[error("{entity} {source_id}: natural key '{key}' already belongs to source record {owner}")]
    DuplicateKey {
        entity: String,
        source_id: String,
        key: String,
        owner: String,
    },
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl std::fmt::Display, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Connector error for the named store.
    pub fn connector(store: impl Into<String>, message: impl std::fmt::Display) -> Self {
        MigrateError::Connector {
            store: store.into(),
            message: message.to_string(),
        }
    }

    /// Create a Constraint error for a single record.
    pub fn constraint(
        entity: impl Into<String>,
        key: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        MigrateError::Constraint {
            entity: entity.into(),
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error must stop the current phase.
    ///
    /// Transform and constraint errors affect a single record only.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            MigrateError::Transform(_) | MigrateError::Constraint { .. }
        )
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => EXIT_CONFIG_ERROR,
            MigrateError::Connector { .. } | MigrateError::Pool { .. } => EXIT_CONNECTOR_ERROR,
            MigrateError::Constraint { .. } | MigrateError::Transform(_) => EXIT_SERIALIZATION_ERROR,
            MigrateError::State(_) => EXIT_STATE_ERROR,
            MigrateError::MissingParentPhase { .. } => EXIT_PHASE_ORDER_ERROR,
            MigrateError::Json(_) => EXIT_SERIALIZATION_ERROR,
            MigrateError::Worker(_) => EXIT_WORKER_ERROR,
            MigrateError::Io(_) => EXIT_IO_ERROR,
            MigrateError::Cancelled => EXIT_CANCELLED,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

impl From<deadpool_postgres::PoolError> for MigrateError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        MigrateError::pool(err, "acquiring PostgreSQL connection")
    }
}

impl From<tokio_postgres::Error> for MigrateError {
    fn from(err: tokio_postgres::Error) -> Self {
        MigrateError::connector("postgres", err)
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_parent() -> TransformError {
        TransformError::MissingParent {
            entity: "cards".into(),
            source_id: "10".into(),
            parent: "users".into(),
            parent_id: "99".into(),
        }
    }

    #[test]
    fn test_record_level_errors_are_not_fatal() {
        assert!(!MigrateError::Transform(missing_parent()).is_fatal());
        assert!(!MigrateError::constraint("cards", "carter", "duplicate").is_fatal());
    }

    #[test]
    fn test_connector_and_config_errors_are_fatal() {
        assert!(MigrateError::connector("target", "connection refused").is_fatal());
        assert!(MigrateError::Config("SOURCE_DATABASE_URL is required".into()).is_fatal());
        assert!(MigrateError::Cancelled.is_fatal());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(MigrateError::Config("x".into()).exit_code(), EXIT_CONFIG_ERROR);
        assert_eq!(
            MigrateError::connector("source", "down").exit_code(),
            EXIT_CONNECTOR_ERROR
        );
        assert_eq!(
            MigrateError::MissingParentPhase {
                entity: "cards".into(),
                parent: "users".into()
            }
            .exit_code(),
            EXIT_PHASE_ORDER_ERROR
        );
        assert_eq!(MigrateError::Cancelled.exit_code(), EXIT_CANCELLED);
    }

    #[test]
    fn test_record_errors_use_serialization_exit_code() {
        assert_eq!(
            MigrateError::Transform(missing_parent()).exit_code(),
            EXIT_SERIALIZATION_ERROR
        );
        assert_eq!(
            MigrateError::constraint("cards", "carter", "duplicate key").exit_code(),
            EXIT_SERIALIZATION_ERROR
        );
    }

    #[test]
    fn test_transform_error_message_names_parent() {
        let msg = missing_parent().to_string();
        assert!(msg.contains("cards 10"));
        assert!(msg.contains("users '99'"));
    }

    #[test]
    fn test_format_detailed_includes_message() {
        let err = MigrateError::State("marker table missing".into());
        assert!(err.format_detailed().starts_with("Error: Run marker error"));
    }
}
