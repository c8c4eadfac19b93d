//! Work executor adapters.

pub mod mock;

pub use mock::{MockCall, MockExecutor, MockFault};
