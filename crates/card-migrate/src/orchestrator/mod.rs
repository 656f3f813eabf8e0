//! Migration orchestrator - phase sequencing and run markers.
//!
//! Each entity phase follows `Pending -> Running -> {Completed | Failed}` and
//! persists its marker through the [`StateBackend`]. A Completed marker makes
//! later invocations skip the phase unless forced; a Failed marker allows a
//! retry. `migrate-full` wraps the three phase markers in a `full` marker.

mod phase;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::core::{EntityType, RunScope, SourceReader, TargetStore};
use crate::error::{MigrateError, Result};
use crate::report::{MigrationReport, PhaseStats, RunOutcome};
use crate::source::PgSource;
use crate::state::{DbStateBackend, MigrationRun, StateBackend};
use crate::target::PgDocumentStore;
use crate::verify::VerifyEngine;

/// Source id -> target id for the records a phase wrote.
type IdMap = HashMap<String, String>;

/// Output of one phase.
struct PhaseOutput {
    stats: PhaseStats,
    /// `None` when the phase was skipped and its ids have to be read back
    /// from the target.
    migrated: Option<IdMap>,
}

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetStore>,
    state: Arc<dyn StateBackend>,
    dry_run: bool,
    force: bool,
    progress: bool,
}

impl Orchestrator {
    /// Connect to both PostgreSQL stores. Nothing is created until a run
    /// needs it.
    pub async fn connect(config: Config) -> Result<Self> {
        let max_conns = config.migration.get_max_connections();
        let source = PgSource::connect(&config.source, config.tables.clone(), max_conns).await?;
        let target = PgDocumentStore::connect(&config.target, max_conns).await?;
        let state = DbStateBackend::new(target.pool(), target.schema());

        Ok(Self::with_stores(
            config,
            Arc::new(source),
            Arc::new(target),
            Arc::new(state),
        ))
    }

    /// Build an orchestrator over already connected stores.
    pub fn with_stores(
        config: Config,
        source: Arc<dyn SourceReader>,
        target: Arc<dyn TargetStore>,
        state: Arc<dyn StateBackend>,
    ) -> Self {
        Self {
            config,
            source,
            target,
            state,
            dry_run: false,
            force: false,
            progress: false,
        }
    }

    /// Look up but do not write; no markers are persisted.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Re-run phases that are already Completed.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Print progress as JSON lines to stderr.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A reconciliation engine over the same stores.
    pub fn verify_engine(&self) -> VerifyEngine {
        VerifyEngine::new(
            self.source.clone(),
            self.target.clone(),
            self.config.verify.clone(),
            self.config.migration.get_page_size(),
        )
    }

    /// Ping both stores.
    pub async fn health_check(&self) -> Result<()> {
        self.source.ping().await?;
        info!("{} store reachable", self.source.store_name());
        self.target.ping().await?;
        info!("{} store reachable", self.target.store_name());
        Ok(())
    }

    /// Run a migration scope.
    pub async fn run(&self, scope: RunScope, cancel: CancellationToken) -> Result<MigrationReport> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4().to_string();

        info!(
            "Starting {} migration run {}{}",
            scope,
            run_id,
            if self.dry_run { " (dry run)" } else { "" }
        );

        self.state.init_schema().await?;
        debug!("Run markers in {} storage", self.state.backend_type());

        let result = match scope {
            RunScope::Full => self.run_full(&run_id, &cancel).await?,
            single => {
                let entity = single.entities()[0];
                let output = self.run_phase(&run_id, entity, None, &cancel).await?;
                let status = if output.stats.skipped {
                    RunOutcome::Skipped
                } else {
                    RunOutcome::Completed
                };
                (status, vec![output.stats])
            }
        };

        let (status, phases) = result;
        let report = self.report(run_id, scope, status, started_at, phases);
        info!(
            "Migration {} {:?}: {} errors in {:.1}s",
            scope,
            report.status,
            report.total_errors(),
            report.duration_seconds
        );
        Ok(report)
    }

    async fn run_full(
        &self,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(RunOutcome, Vec<PhaseStats>)> {
        if self.is_completed(RunScope::Full).await? {
            info!("Full migration already completed, skipping (use --force to re-run)");
            let phases = EntityType::ALL.iter().map(|&e| PhaseStats::skipped(e)).collect();
            return Ok((RunOutcome::Skipped, phases));
        }

        let mut marker = self.new_marker(run_id, RunScope::Full);
        self.save_marker(&marker).await?;

        let mut phases = Vec::new();
        let mut previous: Option<IdMap> = None;
        for entity in EntityType::ALL {
            match self.run_phase(run_id, entity, previous.take(), cancel).await {
                Ok(output) => {
                    previous = output.migrated;
                    phases.push(output.stats);
                }
                Err(e) => {
                    marker.fail(failure_message(&e), phases);
                    self.save_marker_after_failure(&marker).await;
                    return Err(e);
                }
            }
        }

        marker.complete(phases.clone());
        self.save_marker(&marker).await?;
        Ok((RunOutcome::Completed, phases))
    }

    /// Run one entity phase, honouring and persisting its marker.
    ///
    /// `parent_ids` is the id map of the parent phase when it ran in this
    /// process; otherwise the map is read back from the target.
    async fn run_phase(
        &self,
        run_id: &str,
        entity: EntityType,
        parent_ids: Option<IdMap>,
        cancel: &CancellationToken,
    ) -> Result<PhaseOutput> {
        let scope = RunScope::from(entity);
        if self.is_completed(scope).await? {
            info!("{} already migrated, skipping (use --force to re-run)", entity);
            return Ok(PhaseOutput {
                stats: PhaseStats::skipped(entity),
                migrated: None,
            });
        }

        self.target.ensure_collections().await?;

        let mut marker = self.new_marker(run_id, scope);
        self.save_marker(&marker).await?;

        let span = info_span!("phase", entity = %entity, run_id = %run_id);
        match self.execute_phase(entity, parent_ids, cancel).instrument(span).await {
            Ok((stats, migrated)) => {
                marker.complete(vec![stats.clone()]);
                self.save_marker(&marker).await?;
                Ok(PhaseOutput {
                    stats,
                    migrated: Some(migrated),
                })
            }
            Err(e) => {
                error!("{} phase failed: {}", entity, e);
                marker.fail(failure_message(&e), Vec::new());
                self.save_marker_after_failure(&marker).await;
                Err(e)
            }
        }
    }

    async fn is_completed(&self, scope: RunScope) -> Result<bool> {
        if self.force {
            return Ok(false);
        }
        Ok(self
            .state
            .load(scope)
            .await?
            .map(|marker| marker.is_completed())
            .unwrap_or(false))
    }

    fn new_marker(&self, run_id: &str, scope: RunScope) -> MigrationRun {
        let mut marker = MigrationRun::new(scope, self.force);
        marker.run_id = run_id.to_string();
        marker.start();
        marker
    }

    async fn save_marker(&self, marker: &MigrationRun) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        self.state.save(marker).await
    }

    /// The phase error takes precedence over a marker write failure.
    async fn save_marker_after_failure(&self, marker: &MigrationRun) {
        if let Err(e) = self.save_marker(marker).await {
            error!("Failed to persist {} marker: {}", marker.entity_type, e);
        }
    }

    fn report(
        &self,
        run_id: String,
        scope: RunScope,
        status: RunOutcome,
        started_at: DateTime<Utc>,
        phases: Vec<PhaseStats>,
    ) -> MigrationReport {
        let completed_at = Utc::now();
        MigrationReport {
            run_id,
            scope,
            status,
            dry_run: self.dry_run,
            forced: self.force,
            started_at,
            completed_at,
            duration_seconds: (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
            phases,
        }
    }
}

fn failure_message(err: &MigrateError) -> String {
    match err {
        MigrateError::Cancelled => "cancelled".to_string(),
        other => other.to_string(),
    }
}
