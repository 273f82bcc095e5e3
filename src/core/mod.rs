//! Configuration and error types shared by every part of the engine.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{Config, ConfigBuilder, LogLevel, MetricsConfig, RetentionConfig};
pub use error::{MetricsError, Result};
