//! State store substrates for the conveyor job queue.
//!
//! - [`PostgresStore`]: the production relational backing (one row per job)
//! - [`MemoryStore`]: the same contract over process-local maps, for tests
//!   and embedded development

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
