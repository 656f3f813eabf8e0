//! Run markers.
//!
//! One [`MigrationRun`] marker per scope (`users`, `cards`, `analytics`,
//! `full`) is persisted in the target store. A Completed marker makes a second
//! invocation a no-op unless it is forced; a Failed marker allows a retry.
//! Markers are never deleted automatically.

mod backend;
mod db;
mod memory;

pub use backend::{run_state_to_str, str_to_run_state, StateBackend};
pub use db::DbStateBackend;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::RunScope;
use crate::report::PhaseStats;

/// Marker state machine: `Pending -> Running -> {Completed | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

/// A persisted migration run marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRun {
    /// Unique run identifier.
    pub run_id: String,

    pub entity_type: RunScope,

    pub state: RunState,

    pub started_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Whether a Completed marker was overridden to start this run.
    pub forced: bool,

    /// Final counters of the phases covered by this run.
    #[serde(default)]
    pub stats: Vec<PhaseStats>,

    /// Error message if failed.
    #[serde(default)]
    pub error: Option<String>,
}

impl MigrationRun {
    /// Create a Pending marker.
    pub fn new(entity_type: RunScope, forced: bool) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            entity_type,
            state: RunState::Pending,
            started_at: Utc::now(),
            completed_at: None,
            forced,
            stats: Vec::new(),
            error: None,
        }
    }

    pub fn start(&mut self) {
        self.state = RunState::Running;
        self.started_at = Utc::now();
    }

    pub fn complete(&mut self, stats: Vec<PhaseStats>) {
        self.state = RunState::Completed;
        self.completed_at = Some(Utc::now());
        self.stats = stats;
        self.error = None;
    }

    pub fn fail(&mut self, error: impl Into<String>, stats: Vec<PhaseStats>) {
        self.state = RunState::Failed;
        self.completed_at = Some(Utc::now());
        self.stats = stats;
        self.error = Some(error.into());
    }

    pub fn is_completed(&self) -> bool {
        self.state == RunState::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EntityType;

    #[test]
    fn test_marker_lifecycle() {
        let mut run = MigrationRun::new(RunScope::Users, false);
        assert_eq!(run.state, RunState::Pending);
        assert!(!run.state.is_terminal());

        run.start();
        assert_eq!(run.state, RunState::Running);

        run.complete(vec![PhaseStats::new(EntityType::Users)]);
        assert!(run.is_completed());
        assert!(run.completed_at.is_some());
        assert!(run.error.is_none());
    }

    #[test]
    fn test_failed_marker_keeps_message() {
        let mut run = MigrationRun::new(RunScope::Cards, true);
        run.start();
        run.fail("target store error: connection refused", Vec::new());
        assert_eq!(run.state, RunState::Failed);
        assert!(!run.is_completed());
        assert!(run.forced);
        assert_eq!(
            run.error.as_deref(),
            Some("target store error: connection refused")
        );
    }

    #[test]
    fn test_marker_json_shape() {
        let run = MigrationRun::new(RunScope::Full, false);
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["entity_type"], "full");
        assert_eq!(json["state"], "pending");
        let parsed: MigrationRun = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, run);
    }
}
