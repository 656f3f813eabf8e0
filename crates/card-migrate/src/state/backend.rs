//! State backend trait for run marker storage.
//!
//! - **PostgreSQL**: [`DbStateBackend`](super::DbStateBackend), a
//!   `migration_runs` table in the target schema
//! - **In-memory**: [`InMemoryTarget`](crate::target::InMemoryTarget) keeps
//!   markers next to its collections
//!
//! The orchestrator works with `Arc<dyn StateBackend>` without knowing the
//! concrete type.

use async_trait::async_trait;

use super::{MigrationRun, RunState};
use crate::core::RunScope;
use crate::error::{MigrateError, Result};

/// Trait for run marker persistence backends.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Initialize the marker storage. Idempotent.
    async fn init_schema(&self) -> Result<()>;

    /// Load the marker for a scope, if any.
    async fn load(&self, scope: RunScope) -> Result<Option<MigrationRun>>;

    /// Save a marker, replacing the previous marker for the same scope.
    async fn save(&self, run: &MigrationRun) -> Result<()>;

    /// Get the backend type name for logging/debugging.
    fn backend_type(&self) -> &'static str;
}

pub fn run_state_to_str(state: RunState) -> &'static str {
    match state {
        RunState::Pending => "pending",
        RunState::Running => "running",
        RunState::Completed => "completed",
        RunState::Failed => "failed",
    }
}

pub fn str_to_run_state(s: &str) -> Result<RunState> {
    match s {
        "pending" => Ok(RunState::Pending),
        "running" => Ok(RunState::Running),
        "completed" => Ok(RunState::Completed),
        "failed" => Ok(RunState::Failed),
        _ => Err(MigrateError::State(format!("Invalid run state: {}", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_roundtrip() {
        for state in [
            RunState::Pending,
            RunState::Running,
            RunState::Completed,
            RunState::Failed,
        ] {
            assert_eq!(str_to_run_state(run_state_to_str(state)).unwrap(), state);
        }
    }

    #[test]
    fn test_invalid_run_state() {
        assert!(str_to_run_state("cancelled").is_err());
    }
}
