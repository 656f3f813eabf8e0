//! Source store readers.
//!
//! - [`PgSource`]: the relational source on PostgreSQL
//! - [`InMemorySource`]: rows held in memory, for tests and previews

mod memory;
mod postgres;

pub use memory::InMemorySource;
pub use postgres::PgSource;

/// Pages buffered ahead of the consumer.
pub(crate) const READ_AHEAD_PAGES: usize = 4;
