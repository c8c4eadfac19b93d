//! Domain layer for the Arbor orchestration engine
//!
//! This module contains the core models, the error taxonomy and the port
//! traits external collaborators implement.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DomainError, DomainResult, ErrorKind, OrchestrationError, OrchestrationResult};
