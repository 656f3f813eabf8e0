//! Core abstractions shared by the migration and reconciliation engines.
//!
//! - [`entity`]: entity types, phase order and run scopes
//! - [`record`]: typed source rows and target documents
//! - [`traits`]: connector traits for the source and target stores
//!
//! The engines only talk to the stores through [`SourceReader`] and
//! [`TargetStore`], so they can be driven by the PostgreSQL connectors in
//! production and by the in-memory connectors in tests.

pub mod entity;
pub mod record;
pub mod traits;

// Re-export commonly used types for convenience
pub use entity::{EntityType, KeyPolicy, RunScope};
pub use record::{
    BulkInsertOutcome, Document, DocumentWrite, SourceAnalytics, SourceCard, SourceRecord,
    SourceUser, StoredDocument, TargetRecord,
};
pub use traits::{SourceReader, TargetStore};
