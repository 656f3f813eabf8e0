//! # card-migrate
//!
//! Migration and reconciliation engine for moving card platform data (Users,
//! Cards and their Analytics) from a relational PostgreSQL source into a
//! document store, then proving the two stores agree.
//!
//! - **Phased migration** in dependency order with persisted run markers
//! - **Idempotent upserts** keyed by the source id carried on every document
//! - **Deterministic natural-key collision handling** (`carter`, `carter1`, ...)
//! - **Field-level reconciliation** with per-record findings
//!
//! ## Example
//!
//! ```rust,no_run
//! use card_migrate::{Config, Orchestrator, RunScope};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> card_migrate::Result<()> {
//! let config = Config::load(None)?;
//! let orchestrator = Orchestrator::connect(config).await?;
//! let report = orchestrator.run(RunScope::Full, CancellationToken::new()).await?;
//! println!("{}", report.render_text());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod orchestrator;
pub mod postgres;
pub mod report;
pub mod source;
pub mod state;
pub mod target;
pub mod transform;
pub mod upsert;
pub mod verify;

// Re-exports for convenient access
pub use config::{Config, DateGranularity, MigrationConfig, SourceConfig, TargetConfig, VerifyConfig};
pub use core::{EntityType, RunScope, SourceReader, TargetStore};
pub use error::{MigrateError, Result};
pub use orchestrator::Orchestrator;
pub use report::{MigrationReport, PhaseStats, RunOutcome, VerifyReport};
pub use source::{InMemorySource, PgSource};
pub use state::{DbStateBackend, MigrationRun, RunState, StateBackend};
pub use target::{InMemoryTarget, PgDocumentStore};
pub use verify::{VerifyEngine, VerifyResult};
