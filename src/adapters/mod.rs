//! Adapters implementing the domain ports.

pub mod executors;
pub mod memory;
pub mod sqlite;

pub use executors::{MockExecutor, MockFault};
pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
