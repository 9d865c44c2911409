//! Core infrastructure module
//!
//! This module provides the ambient layer shared by every component:
//! - Configuration management
//! - Structured logging system
//! - Error handling and type system

pub mod config;
pub mod error;
pub mod logging;

pub use config::Config;
pub use error::{ErrorResponse, HostError, Result};
pub use logging::Logger;
