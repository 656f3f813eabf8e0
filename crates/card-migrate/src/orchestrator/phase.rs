//! The record pipeline of one phase: read, transform, resolve keys, write.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{IdMap, Orchestrator};
use crate::core::{EntityType, TargetRecord};
use crate::error::{MigrateError, Result};
use crate::report::{PhaseStats, ProgressReporter};
use crate::transform::{KeyResolver, SharedContext, TransformContext, Transformer};
use crate::upsert::{UpsertEngine, UpsertOutcome};

/// Per-phase write settings and collaborators.
struct PhaseWriter {
    upsert: UpsertEngine,
    semaphore: Arc<Semaphore>,
    ctx: SharedContext,
    sample_limit: usize,
}

impl Orchestrator {
    /// Stream every source record of `entity` through transform and upsert.
    ///
    /// Returns the phase counters and the source id -> target id map of the
    /// records written.
    pub(super) async fn execute_phase(
        &self,
        entity: EntityType,
        parent_ids: Option<IdMap>,
        cancel: &CancellationToken,
    ) -> Result<(PhaseStats, IdMap)> {
        let start = Instant::now();
        let migration = &self.config.migration;

        let total = self.source.count(entity).await?;

        let mut ctx = TransformContext::new();
        match entity.parent() {
            Some(parent) if total > 0 => {
                let ids = match parent_ids {
                    Some(ids) => ids,
                    None => self.hydrate_ids(parent).await?,
                };
                if ids.is_empty() {
                    return Err(MigrateError::MissingParentPhase {
                        entity: entity.to_string(),
                        parent: parent.to_string(),
                    });
                }
                info!("{}: {} {} available as parents", entity, ids.len(), parent);
                ctx = ctx.with_parent_map(parent, ids);
            }
            Some(parent) => debug!("{}: source is empty, {} not needed", entity, parent),
            None => {}
        }

        let writer = PhaseWriter {
            upsert: UpsertEngine::new(self.target.clone()).with_dry_run(self.dry_run),
            semaphore: Arc::new(Semaphore::new(migration.get_workers().max(1))),
            ctx: ctx.into_shared(),
            sample_limit: migration.get_error_sample_limit(),
        };
        let transformer = Transformer::new();
        let resolver = KeyResolver::new(self.target.clone(), migration.get_max_key_attempts());
        let chunk_size = migration.get_chunk_size();

        info!(
            "{}: migrating {} records with {} workers",
            entity,
            total,
            migration.get_workers()
        );
        let mut progress = ProgressReporter::new(entity, Some(total.max(0) as u64), self.progress);
        let mut stats = PhaseStats::new(entity);
        let mut pending: Vec<TargetRecord> = Vec::new();

        let mut pages = self.source.read_all(entity, migration.get_page_size());
        while let Some(page) = pages.recv().await {
            for record in page? {
                if cancel.is_cancelled() {
                    warn!("{}: cancellation requested after {} records", entity, stats.total);
                    return Err(MigrateError::Cancelled);
                }

                let transformed = {
                    let guard = lock(&writer.ctx)?;
                    transformer.transform(&record, &guard)
                };
                let mut target = match transformed {
                    Ok(target) => target,
                    Err(e) => {
                        debug!("{}: skipping {}: {}", entity, record.display_id(), e);
                        stats.record_error(&record.display_id(), e.to_string(), writer.sample_limit);
                        continue;
                    }
                };

                match resolver.resolve(&mut target, &writer.ctx).await {
                    Ok(()) => pending.push(target),
                    Err(e) if !e.is_fatal() => {
                        debug!("{}: skipping {}: {}", entity, target.source_id, e);
                        stats.record_error(&target.source_id, e.to_string(), writer.sample_limit);
                    }
                    Err(e) => return Err(e),
                }

                if entity.is_bulk() && pending.len() >= chunk_size {
                    writer.write_chunk(std::mem::take(&mut pending), &mut stats).await?;
                    progress.update(stats.total, stats.errors);
                }
            }

            if !entity.is_bulk() && !pending.is_empty() {
                writer.write_concurrent(std::mem::take(&mut pending), &mut stats).await?;
            }
            progress.update(stats.total, stats.errors);
        }

        if !pending.is_empty() {
            if cancel.is_cancelled() {
                return Err(MigrateError::Cancelled);
            }
            writer.write_chunk(pending, &mut stats).await?;
            progress.update(stats.total, stats.errors);
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "{}: {} processed, {} migrated, {} updated, {} errors in {:.1}s",
            entity,
            stats.total,
            stats.migrated,
            stats.updated,
            stats.errors,
            stats.duration_ms as f64 / 1000.0
        );

        let migrated = lock(&writer.ctx)?.take_migrated();
        Ok((stats, migrated))
    }

    /// Read the source id -> target id map of a phase back from the target.
    async fn hydrate_ids(&self, entity: EntityType) -> Result<IdMap> {
        let docs = self.target.scan_all(entity).await?;
        let ids: IdMap = docs
            .into_iter()
            .filter_map(|doc| doc.source_id.map(|sid| (sid, doc.id)))
            .collect();
        debug!("Hydrated {} {} ids from the target", ids.len(), entity);
        Ok(ids)
    }
}

impl PhaseWriter {
    /// Upsert records one by one on the worker pool.
    async fn write_concurrent(&self, records: Vec<TargetRecord>, stats: &mut PhaseStats) -> Result<()> {
        let mut handles = Vec::with_capacity(records.len());
        for record in records {
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| MigrateError::Worker(e.to_string()))?;
            let upsert = self.upsert.clone();

            handles.push(tokio::spawn(async move {
                let outcome = upsert.upsert(&record).await;
                drop(permit);
                (record.source_id, outcome)
            }));
        }

        let mut fatal = None;
        for joined in join_all(handles).await {
            let (source_id, outcome) =
                joined.map_err(|e| MigrateError::Worker(format!("upsert task panicked: {}", e)))?;
            match outcome {
                Ok(outcome) => self.apply(&source_id, &outcome, stats)?,
                Err(e) => {
                    fatal.get_or_insert(e);
                }
            }
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Upsert a chunk through the bulk path.
    async fn write_chunk(&self, records: Vec<TargetRecord>, stats: &mut PhaseStats) -> Result<()> {
        let outcomes = self.upsert.upsert_chunk(&records).await?;
        for (record, outcome) in records.iter().zip(outcomes.iter()) {
            self.apply(&record.source_id, outcome, stats)?;
        }
        Ok(())
    }

    fn apply(&self, source_id: &str, outcome: &UpsertOutcome, stats: &mut PhaseStats) -> Result<()> {
        stats.record_outcome(source_id, outcome, self.sample_limit);
        match outcome {
            UpsertOutcome::Errored { error } => {
                debug!("{}: write failed: {}", source_id, error);
            }
            _ => {
                if let Some(target_id) = outcome.target_id() {
                    lock(&self.ctx)?.record_migrated(source_id, target_id);
                }
            }
        }
        Ok(())
    }
}

fn lock(ctx: &SharedContext) -> Result<std::sync::MutexGuard<'_, TransformContext>> {
    ctx.lock()
        .map_err(|_| MigrateError::Worker("transform context lock poisoned".into()))
}
