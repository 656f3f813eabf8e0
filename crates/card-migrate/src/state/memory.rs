//! Run markers kept by the in-memory target.

use async_trait::async_trait;

use super::backend::StateBackend;
use super::MigrationRun;
use crate::core::RunScope;
use crate::error::{MigrateError, Result};
use crate::target::InMemoryTarget;

#[async_trait]
impl StateBackend for InMemoryTarget {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn load(&self, scope: RunScope) -> Result<Option<MigrationRun>> {
        let marker = self
            .load_marker(scope.as_str())
            .map_err(|e| MigrateError::State(e.to_string()))?;
        marker
            .map(|value| serde_json::from_value(value).map_err(|e| MigrateError::State(e.to_string())))
            .transpose()
    }

    async fn save(&self, run: &MigrationRun) -> Result<()> {
        let value = serde_json::to_value(run).map_err(|e| MigrateError::State(e.to_string()))?;
        self.store_marker(run.entity_type.as_str(), value)
            .map_err(|e| MigrateError::State(e.to_string()))
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RunState;

    #[tokio::test]
    async fn test_markers_are_kept_per_scope() {
        let target = InMemoryTarget::new();
        assert!(target.load(RunScope::Users).await.unwrap().is_none());

        let mut run = MigrationRun::new(RunScope::Users, false);
        run.start();
        run.complete(Vec::new());
        target.save(&run).await.unwrap();

        let loaded = target.load(RunScope::Users).await.unwrap().unwrap();
        assert_eq!(loaded.state, RunState::Completed);
        assert!(target.load(RunScope::Cards).await.unwrap().is_none());
        assert_eq!(target.reads(), 0);
        assert_eq!(target.writes(), 0);
    }
}
