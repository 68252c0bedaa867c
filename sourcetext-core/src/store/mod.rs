//! Store adapters implementing [`crate::contract::DocumentStore`] and
//! [`crate::contract::SourceTextStore`].
//!
//! - [`memory::MemoryStore`]: process-local, enforces the same uniqueness
//!   rules as a database, supports injected failures for tests.
//! - [`sqlite::SqliteStore`]: rusqlite-backed, schema migrated on open.

pub mod memory;
pub mod sqlite;

pub use memory::{MemoryStore, Operation};
pub use sqlite::SqliteStore;
