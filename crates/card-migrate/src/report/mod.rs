//! Phase statistics and run reports.

mod progress;
mod verify;

pub use progress::{ProgressReporter, ProgressUpdate};
pub use verify::VerifyReport;

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{EntityType, RunScope};
use crate::error::Result;
use crate::upsert::UpsertOutcome;

/// A sampled per-record error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSample {
    pub source_id: String,
    pub message: String,
}

/// Counters for one entity phase.
///
/// Every processed record increments exactly one of `migrated`, `updated` and
/// `errors`, so their sum equals `total`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseStats {
    pub entity: EntityType,
    /// Source records processed.
    pub total: u64,
    /// Records inserted into the target.
    pub migrated: u64,
    /// Records merged into an existing target document.
    pub updated: u64,
    pub errors: u64,
    /// The phase did not run because it was already Completed.
    #[serde(default)]
    pub skipped: bool,
    /// First errors of the phase, capped.
    #[serde(default)]
    pub error_samples: Vec<ErrorSample>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl PhaseStats {
    pub fn new(entity: EntityType) -> Self {
        Self {
            entity,
            total: 0,
            migrated: 0,
            updated: 0,
            errors: 0,
            skipped: false,
            error_samples: Vec::new(),
            duration_ms: 0,
        }
    }

    /// Stats of a phase that was skipped without touching data.
    pub fn skipped(entity: EntityType) -> Self {
        Self {
            skipped: true,
            ..Self::new(entity)
        }
    }

    /// Count the outcome of one record.
    pub fn record_outcome(&mut self, source_id: &str, outcome: &UpsertOutcome, sample_limit: usize) {
        match outcome {
            UpsertOutcome::Inserted { .. } => {
                self.total += 1;
                self.migrated += 1;
            }
            UpsertOutcome::Updated { .. } => {
                self.total += 1;
                self.updated += 1;
            }
            UpsertOutcome::Errored { error } => self.record_error(source_id, error, sample_limit),
        }
    }

    /// Count a record that failed before reaching the target.
    pub fn record_error(&mut self, source_id: &str, message: impl Into<String>, sample_limit: usize) {
        self.total += 1;
        self.errors += 1;
        if self.error_samples.len() < sample_limit {
            self.error_samples.push(ErrorSample {
                source_id: source_id.to_string(),
                message: message.into(),
            });
        }
    }

    /// Records that made it into the target (inserted or updated).
    pub fn succeeded(&self) -> u64 {
        self.migrated + self.updated
    }

    pub fn is_balanced(&self) -> bool {
        self.migrated + self.updated + self.errors == self.total
    }

    pub fn records_per_second(&self) -> f64 {
        if self.duration_ms == 0 {
            return 0.0;
        }
        self.total as f64 * 1000.0 / self.duration_ms as f64
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every phase ran (possibly with per-record errors).
    Completed,
    /// The run was already Completed and was not forced.
    Skipped,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Unique run identifier.
    pub run_id: String,

    pub scope: RunScope,

    pub status: RunOutcome,

    pub dry_run: bool,

    pub forced: bool,

    pub started_at: DateTime<Utc>,

    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Per-phase counters, in phase order.
    pub phases: Vec<PhaseStats>,
}

impl MigrationReport {
    pub fn total_errors(&self) -> u64 {
        self.phases.iter().map(|p| p.errors).sum()
    }

    pub fn phase(&self, entity: EntityType) -> Option<&PhaseStats> {
        self.phases.iter().find(|p| p.entity == entity)
    }

    /// Convert the report to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Human-readable summary.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let title = if self.dry_run {
            "Migration Dry Run"
        } else {
            "Migration"
        };
        let _ = writeln!(out, "\n{} {}: {:?}", title, self.scope, self.status);
        let _ = writeln!(out, "  Run ID:   {}", self.run_id);
        let _ = writeln!(out, "  Duration: {:.2}s", self.duration_seconds);
        if self.forced {
            let _ = writeln!(out, "  Forced:   yes");
        }

        for phase in &self.phases {
            if phase.skipped {
                let _ = writeln!(out, "\n  {:<10} skipped (already completed)", phase.entity.as_str());
                continue;
            }
            let _ = writeln!(
                out,
                "\n  {:<10} total {:>8}  migrated {:>8}  updated {:>8}  errors {:>6}  ({:.0} rec/s)",
                phase.entity.as_str(),
                phase.total,
                phase.migrated,
                phase.updated,
                phase.errors,
                phase.records_per_second()
            );
            for sample in &phase.error_samples {
                let _ = writeln!(out, "    - {}: {}", sample.source_id, sample.message);
            }
            let hidden = phase.errors.saturating_sub(phase.error_samples.len() as u64);
            if hidden > 0 {
                let _ = writeln!(out, "    ... and {} more errors", hidden);
            }
        }
        out
    }
}
