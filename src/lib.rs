//! plughost library
//!
//! This library resolves plugin dependencies for game servers and
//! orchestrates their installation, including validation, conflict
//! detection, persistence and progress streaming.

pub mod core;
pub mod db;
pub mod plugin;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use crate::core::{Config, HostError};
pub use db::DatabaseManager;
pub use plugin::PluginHost;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
