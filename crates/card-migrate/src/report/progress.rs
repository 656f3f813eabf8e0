//! Incremental progress during long phases.

use std::time::Instant;

use serde::Serialize;
use tracing::info;

use crate::core::EntityType;

/// Progress is reported every `100 / PERCENT_STEPS` percent.
const PERCENT_STEPS: u64 = 20;
/// Progress interval when the total is unknown.
const RECORD_STEP: u64 = 1000;

/// A progress snapshot, printed as a JSON line with `--progress`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub entity: EntityType,
    pub processed: u64,
    pub total: Option<u64>,
    pub percent: Option<f64>,
    pub errors: u64,
    pub records_per_second: f64,
}

/// Emits progress when a phase crosses a 5% step (or every 1000 records when
/// the total is unknown).
pub struct ProgressReporter {
    entity: EntityType,
    total: Option<u64>,
    json_lines: bool,
    started: Instant,
    last_step: u64,
}

impl ProgressReporter {
    pub fn new(entity: EntityType, total: Option<u64>, json_lines: bool) -> Self {
        Self {
            entity,
            total: total.filter(|t| *t > 0),
            json_lines,
            started: Instant::now(),
            last_step: 0,
        }
    }

    /// Report progress if a step boundary was crossed since the last report.
    pub fn update(&mut self, processed: u64, errors: u64) -> Option<ProgressUpdate> {
        let step = match self.total {
            Some(total) => processed.min(total) * PERCENT_STEPS / total,
            None => processed / RECORD_STEP,
        };
        if step <= self.last_step {
            return None;
        }
        self.last_step = step;
        Some(self.emit(processed, errors))
    }

    fn emit(&self, processed: u64, errors: u64) -> ProgressUpdate {
        let elapsed = self.started.elapsed().as_secs_f64();
        let update = ProgressUpdate {
            entity: self.entity,
            processed,
            total: self.total,
            percent: self
                .total
                .map(|t| (processed.min(t) as f64 * 100.0 / t as f64 * 10.0).round() / 10.0),
            errors,
            records_per_second: if elapsed > 0.0 {
                processed as f64 / elapsed
            } else {
                0.0
            },
        };

        match (update.total, update.percent) {
            (Some(total), Some(percent)) => info!(
                "{}: {}/{} records ({:.0}%), {} errors",
                self.entity, processed, total, percent, errors
            ),
            _ => info!("{}: {} records, {} errors", self.entity, processed, errors),
        }
        if self.json_lines {
            if let Ok(line) = serde_json::to_string(&update) {
                eprintln!("{}", line);
            }
        }
        update
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_every_five_percent() {
        let mut reporter = ProgressReporter::new(EntityType::Analytics, Some(200), false);
        let reported: Vec<u64> = (1..=200)
            .filter_map(|n| reporter.update(n, 0))
            .map(|u| u.processed)
            .collect();
        assert_eq!(reported.len(), 20);
        assert_eq!(reported[0], 10);
        assert_eq!(*reported.last().unwrap(), 200);
    }

    #[test]
    fn test_unknown_total_reports_every_thousand() {
        let mut reporter = ProgressReporter::new(EntityType::Users, None, false);
        assert!(reporter.update(999, 0).is_none());
        let update = reporter.update(1000, 2).unwrap();
        assert_eq!(update.percent, None);
        assert_eq!(update.errors, 2);
        assert!(reporter.update(1500, 2).is_none());
    }

    #[test]
    fn test_percent_is_capped() {
        let mut reporter = ProgressReporter::new(EntityType::Cards, Some(10), false);
        let update = reporter.update(12, 0).unwrap();
        assert_eq!(update.percent, Some(100.0));
    }
}
