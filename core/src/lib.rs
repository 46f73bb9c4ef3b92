//! Stratum Core - Foundational Types
//!
//! Error taxonomy, configuration and build events shared by the
//! Stratum builder and CLI.

pub mod config;
pub mod error;
pub mod event;

// Re-export commonly used types
pub use config::{ExecutorKind, LogConfig, LogFormat, LogLevel, StratumConfig};
pub use error::{Result, StratumError};
pub use event::{events, BuildEvent, EventEmitter, EventPayload, EventStream};

/// Stratum version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
