//! Rendering of reconciliation results.

use std::fmt::Write as _;
use std::path::Path;

use serde::Serialize;

use crate::config::DateGranularity;
use crate::core::EntityType;
use crate::error::Result;
use crate::verify::{ReconciliationEntry, VerifyResult};

/// Summary view over a [`VerifyResult`] with a capped sample of findings.
pub struct VerifyReport<'a> {
    result: &'a VerifyResult,
    sample_limit: usize,
}

#[derive(Serialize)]
struct EntitySummary<'a> {
    entity: EntityType,
    date_granularity: DateGranularity,
    in_sync: bool,
    source_total: u64,
    target_total: u64,
    matched: u64,
    mismatched: u64,
    missing_in_target: u64,
    extra_in_target: u64,
    duration_ms: u64,
    sample: Vec<&'a ReconciliationEntry>,
}

#[derive(Serialize)]
struct Summary<'a> {
    in_sync: bool,
    entities_in_sync: usize,
    entities_with_differences: usize,
    duration_ms: u64,
    entities: Vec<EntitySummary<'a>>,
}

impl<'a> VerifyReport<'a> {
    pub fn new(result: &'a VerifyResult, sample_limit: usize) -> Self {
        Self { result, sample_limit }
    }

    fn summary(&self) -> Summary<'a> {
        Summary {
            in_sync: self.result.is_in_sync(),
            entities_in_sync: self.result.entities_in_sync,
            entities_with_differences: self.result.entities_with_differences,
            duration_ms: self.result.duration_ms,
            entities: self
                .result
                .entities
                .iter()
                .map(|e| EntitySummary {
                    entity: e.entity,
                    date_granularity: e.date_granularity,
                    in_sync: e.is_in_sync(),
                    source_total: e.source_total,
                    target_total: e.target_total,
                    matched: e.matched,
                    mismatched: e.mismatched,
                    missing_in_target: e.missing_in_target,
                    extra_in_target: e.extra_in_target,
                    duration_ms: e.duration_ms,
                    sample: e.findings().take(self.sample_limit).collect(),
                })
                .collect(),
        }
    }

    /// Machine-readable summary with capped samples.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.summary())?)
    }

    /// Write the full result, every entry included, to a JSON file.
    pub fn write_entries(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self.result)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Human-readable summary.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let status = if self.result.is_in_sync() {
            "IN SYNC"
        } else {
            "DIFFERENCES FOUND"
        };
        let _ = writeln!(out, "\nVerification: {}", status);
        let _ = writeln!(out, "  Duration: {:.2}s", self.result.duration_ms as f64 / 1000.0);

        for entity in &self.result.entities {
            let _ = writeln!(
                out,
                "\n  {:<10} source {:>8}  target {:>8}  matched {:>8}  mismatched {:>6}  missing {:>6}  extra {:>6}",
                entity.entity.as_str(),
                entity.source_total,
                entity.target_total,
                entity.matched,
                entity.mismatched,
                entity.missing_in_target,
                entity.extra_in_target
            );
            let findings = entity.findings().count();
            for finding in entity.findings().take(self.sample_limit) {
                let id = finding.source_id.as_deref().unwrap_or("<none>");
                let _ = write!(out, "    - {:?} {}", finding.status, id);
                if let Some(key) = &finding.natural_key {
                    let _ = write!(out, " ({})", key);
                }
                if !finding.mismatched_fields.is_empty() {
                    let _ = write!(out, ": {}", finding.mismatched_fields.join(", "));
                }
                if let Some(note) = &finding.note {
                    let _ = write!(out, " [{}]", note);
                }
                let _ = writeln!(out);
            }
            if findings > self.sample_limit {
                let _ = writeln!(out, "    ... and {} more", findings - self.sample_limit);
            }
        }
        out
    }
}
