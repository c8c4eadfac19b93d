//! Structured logging on `tracing-subscriber`, with optional rolling JSON
//! files through `tracing-appender`.

pub mod config;
pub mod logger;

pub use config::{LogConfig, LogFormat, RotationPolicy};
pub use logger::LoggerImpl;
