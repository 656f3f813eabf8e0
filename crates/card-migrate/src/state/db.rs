//! Database-backed run markers.
//!
//! Markers live in a `migration_runs` table in the target schema, one row per
//! scope, upserted on every state change.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use uuid::Uuid;

use super::backend::{run_state_to_str, str_to_run_state, StateBackend};
use super::MigrationRun;
use crate::core::RunScope;
use crate::error::{MigrateError, Result};
use crate::postgres::quote_ident;
use crate::report::PhaseStats;

/// PostgreSQL run marker backend.
pub struct DbStateBackend {
    pool: Pool,
    schema: String,
}

impl DbStateBackend {
    pub fn new(pool: Pool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    fn table(&self) -> String {
        format!("{}.migration_runs", quote_ident(&self.schema))
    }

    async fn client(&self, context: &str) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, context.to_string()))
    }
}

fn state_err(e: impl std::fmt::Display) -> MigrateError {
    MigrateError::State(e.to_string())
}

#[async_trait]
impl StateBackend for DbStateBackend {
    async fn init_schema(&self) -> Result<()> {
        let conn = self.client("getting connection for marker schema").await?;
        conn.execute(
            &format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&self.schema)),
            &[],
        )
        .await
        .map_err(state_err)?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    entity_type TEXT PRIMARY KEY,
                    run_id UUID NOT NULL,
                    state TEXT NOT NULL CHECK (state IN ('pending', 'running', 'completed', 'failed')),
                    started_at TIMESTAMPTZ NOT NULL,
                    completed_at TIMESTAMPTZ,
                    forced BOOLEAN NOT NULL DEFAULT FALSE,
                    stats JSONB NOT NULL DEFAULT '[]'::jsonb,
                    error TEXT,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                self.table()
            ),
            &[],
        )
        .await
        .map_err(state_err)?;

        Ok(())
    }

    async fn load(&self, scope: RunScope) -> Result<Option<MigrationRun>> {
        let conn = self.client("getting connection for marker load").await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT run_id, state, started_at, completed_at, forced, stats, error
                     FROM {} WHERE entity_type = $1",
                    self.table()
                ),
                &[&scope.as_str()],
            )
            .await
            .map_err(state_err)?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let run_id: Uuid = row.try_get(0).map_err(state_err)?;
        let state: String = row.try_get(1).map_err(state_err)?;
        let started_at: DateTime<Utc> = row.try_get(2).map_err(state_err)?;
        let completed_at: Option<DateTime<Utc>> = row.try_get(3).map_err(state_err)?;
        let forced: bool = row.try_get(4).map_err(state_err)?;
        let stats: serde_json::Value = row.try_get(5).map_err(state_err)?;
        let error: Option<String> = row.try_get(6).map_err(state_err)?;

        let stats: Vec<PhaseStats> = serde_json::from_value(stats).map_err(state_err)?;

        Ok(Some(MigrationRun {
            run_id: run_id.to_string(),
            entity_type: scope,
            state: str_to_run_state(&state)?,
            started_at,
            completed_at,
            forced,
            stats,
            error,
        }))
    }

    async fn save(&self, run: &MigrationRun) -> Result<()> {
        let run_id = Uuid::parse_str(&run.run_id).map_err(state_err)?;
        let stats = serde_json::to_value(&run.stats).map_err(state_err)?;
        let conn = self.client("getting connection for marker save").await?;
        conn.execute(
            &format!(
                "INSERT INTO {} (entity_type, run_id, state, started_at, completed_at, forced, stats, error)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (entity_type) DO UPDATE SET
                    run_id = EXCLUDED.run_id,
                    state = EXCLUDED.state,
                    started_at = EXCLUDED.started_at,
                    completed_at = EXCLUDED.completed_at,
                    forced = EXCLUDED.forced,
                    stats = EXCLUDED.stats,
                    error = EXCLUDED.error,
                    updated_at = NOW()",
                self.table()
            ),
            &[
                &run.entity_type.as_str(),
                &run_id,
                &run_state_to_str(run.state),
                &run.started_at,
                &run.completed_at,
                &run.forced,
                &stats,
                &run.error,
            ],
        )
        .await
        .map_err(state_err)?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}
