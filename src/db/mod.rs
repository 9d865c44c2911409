//! Database module
//!
//! This module provides database management functionality including:
//! - Database connection pool management
//! - Repository traits and their SQLite implementations
//! - Database migrations

pub mod manager;
pub mod migrations;
pub mod repository;

pub use manager::DatabaseManager;
pub use repository::{
    InstallationRepository, PluginCatalog, ServerRepository, SqliteInstallationRepository,
    SqlitePluginCatalog, SqliteServerRepository,
};
