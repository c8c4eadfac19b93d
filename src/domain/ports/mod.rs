//! Port trait definitions (Hexagonal Architecture)
//!
//! - `WorkExecutor`: performs a unit of work (LLM call or tool invocation)
//! - `PersistenceStore`: append-only storage for nodes, agents, orchestrators
//!   and execution records

pub mod persistence_store;
pub mod work_executor;

pub use persistence_store::PersistenceStore;
pub use work_executor::{ExecutionError, WorkContext, WorkExecutor, WorkOutput, WorkPurpose};
