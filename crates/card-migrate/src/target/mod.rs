//! Target document stores.
//!
//! - [`PgDocumentStore`]: JSONB collections in PostgreSQL
//! - [`InMemoryTarget`]: collections held in memory, for tests and previews
//!
//! Both enforce the same rules: `natural_key` is unique within a collection
//! and a `source_id` back-reference, when present, is unique as well.

mod memory;
mod postgres;

pub use memory::InMemoryTarget;
pub use postgres::PgDocumentStore;
