//! Database migrations
//!
//! Schema versions are tracked in `schema_migrations`; each migration runs in
//! its own transaction.

use crate::core::error::{HostError, Result};
use rusqlite::Connection;
use tracing::{info, warn};

/// Migration version tracking table
const MIGRATION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
)
"#;

/// Initial schema migration (version 1)
const MIGRATION_V1: &str = r#"
-- Plugin catalog: one row per published plugin version
CREATE TABLE IF NOT EXISTS plugin_packages (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    description TEXT,
    author TEXT,
    category TEXT NOT NULL,
    game_versions TEXT NOT NULL DEFAULT '[]',
    dependencies TEXT NOT NULL DEFAULT '{}',
    optional_dependencies TEXT NOT NULL DEFAULT '{}',
    is_approved INTEGER NOT NULL DEFAULT 0,
    downloads INTEGER NOT NULL DEFAULT 0,
    rating REAL NOT NULL DEFAULT 0,
    commands TEXT NOT NULL DEFAULT '[]',
    ports TEXT NOT NULL DEFAULT '[]',
    config_schema TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(name, version)
);

-- Game servers known to the host
CREATE TABLE IF NOT EXISTS game_servers (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    game_version TEXT NOT NULL
);

-- Installation records joining servers and plugins
CREATE TABLE IF NOT EXISTS server_plugin_installations (
    id TEXT PRIMARY KEY,
    server_id TEXT NOT NULL,
    plugin_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    config TEXT NOT NULL DEFAULT '{}',
    enabled INTEGER NOT NULL DEFAULT 1,
    installed_at TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(server_id, plugin_id)
);
"#;

/// Lookup indexes (version 2)
const MIGRATION_V2: &str = r#"
CREATE INDEX IF NOT EXISTS idx_plugin_packages_name ON plugin_packages(name);
CREATE INDEX IF NOT EXISTS idx_plugin_packages_category ON plugin_packages(category);
CREATE INDEX IF NOT EXISTS idx_installations_server ON server_plugin_installations(server_id);
CREATE INDEX IF NOT EXISTS idx_installations_status ON server_plugin_installations(server_id, status);
"#;

/// Run all pending migrations
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    info!("Running database migrations");

    conn.execute_batch(MIGRATION_TABLE)?;

    let current_version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    info!("Current database schema version: {}", current_version);

    if current_version < 1 {
        info!("Applying migration v1: Initial schema");
        apply_migration(conn, 1, MIGRATION_V1)?;
    }

    if current_version < 2 {
        info!("Applying migration v2: Lookup indexes");
        apply_migration(conn, 2, MIGRATION_V2)?;
    }

    info!("Database migrations completed successfully");
    Ok(())
}

/// Apply a single migration
fn apply_migration(conn: &mut Connection, version: i64, sql: &str) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(sql).map_err(|e| {
        warn!("Migration v{} failed: {}", version, e);
        HostError::DatabaseError(e)
    })?;

    tx.execute("INSERT INTO schema_migrations (version) VALUES (?)", [version])?;
    tx.commit()?;

    info!("Migration v{} applied successfully", version);
    Ok(())
}
