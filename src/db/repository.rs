//! Repository pattern implementation for data access layer
//!
//! The orchestration code only sees the traits below; the SQLite types are the
//! implementations shipped with the crate.

use crate::core::error::{HostError, Result};
use crate::db::manager::DatabaseManager;
use crate::plugin::types::{
    GameServer, InstallationStatus, PluginPackage, ServerPluginInstallation,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Read-only plugin catalog
#[async_trait]
pub trait PluginCatalog: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<Option<PluginPackage>>;

    async fn get_by_name_and_version(&self, name: &str, version: &str)
        -> Result<Option<PluginPackage>>;

    /// Every published version of the plugin with exactly this name
    async fn find_by_name(&self, name: &str) -> Result<Vec<PluginPackage>>;

    /// Case-insensitive substring match on the plugin name
    async fn search_by_name(&self, text: &str) -> Result<Vec<PluginPackage>>;

    async fn get_by_game_version(&self, game_version: &str) -> Result<Vec<PluginPackage>>;

    async fn list_all(&self) -> Result<Vec<PluginPackage>>;
}

/// CRUD access to installation records
#[async_trait]
pub trait InstallationRepository: Send + Sync {
    async fn create(&self, installation: &ServerPluginInstallation) -> Result<()>;

    async fn update(&self, installation: &ServerPluginInstallation) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn find_by_id(&self, id: &str) -> Result<Option<ServerPluginInstallation>>;

    async fn find_by_server_and_plugin(
        &self,
        server_id: &str,
        plugin_id: &str,
    ) -> Result<Option<ServerPluginInstallation>>;

    async fn find_by_server(
        &self,
        server_id: &str,
        status: Option<InstallationStatus>,
    ) -> Result<Vec<ServerPluginInstallation>>;
}

#[async_trait]
pub trait ServerRepository: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<Option<GameServer>>;
}

const PACKAGE_COLUMNS: &str = "id, name, version, description, author, category, game_versions, \
     dependencies, optional_dependencies, is_approved, downloads, rating, commands, ports, \
     config_schema, created_at, updated_at";

const INSTALLATION_COLUMNS: &str = "id, server_id, plugin_id, status, config, enabled, \
     installed_at, error_message, created_at, updated_at";

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn json_column<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn time_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn optional_time_column(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| HostError::SerializationError(e.to_string()))
}

fn package_from_row(row: &Row) -> rusqlite::Result<PluginPackage> {
    let category: String = row.get(5)?;
    let config_schema: Option<String> = row.get(14)?;
    Ok(PluginPackage {
        id: row.get(0)?,
        name: row.get(1)?,
        version: row.get(2)?,
        description: row.get(3)?,
        author: row.get(4)?,
        category: category.parse().map_err(|e| conversion_error(5, e))?,
        game_versions: json_column(row, 6)?,
        dependencies: json_column(row, 7)?,
        optional_dependencies: json_column(row, 8)?,
        is_approved: row.get(9)?,
        downloads: row.get::<_, i64>(10)?.max(0) as u64,
        rating: row.get(11)?,
        commands: json_column(row, 12)?,
        ports: json_column(row, 13)?,
        config_schema: config_schema
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|e| conversion_error(14, e))?,
        created_at: time_column(row, 15)?,
        updated_at: time_column(row, 16)?,
    })
}

fn installation_from_row(row: &Row) -> rusqlite::Result<ServerPluginInstallation> {
    let status: String = row.get(3)?;
    Ok(ServerPluginInstallation {
        id: row.get(0)?,
        server_id: row.get(1)?,
        plugin_id: row.get(2)?,
        status: status.parse().map_err(|e| conversion_error(3, e))?,
        config: json_column(row, 4)?,
        enabled: row.get(5)?,
        installed_at: optional_time_column(row, 6)?,
        error_message: row.get(7)?,
        created_at: time_column(row, 8)?,
        updated_at: time_column(row, 9)?,
    })
}

/// Escape LIKE wildcards in user input
fn like_pattern(text: &str) -> String {
    let escaped = text
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

fn insert_package(conn: &Connection, package: &PluginPackage) -> Result<()> {
    let config_schema = match &package.config_schema {
        Some(schema) => Some(to_json(schema)?),
        None => None,
    };

    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO plugin_packages ({}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            PACKAGE_COLUMNS
        ),
        rusqlite::params![
            &package.id,
            &package.name,
            &package.version,
            &package.description,
            &package.author,
            package.category.as_str(),
            to_json(&package.game_versions)?,
            to_json(&package.dependencies)?,
            to_json(&package.optional_dependencies)?,
            package.is_approved,
            i64::try_from(package.downloads).unwrap_or(i64::MAX),
            package.rating,
            to_json(&package.commands)?,
            to_json(&package.ports)?,
            config_schema,
            package.created_at.to_rfc3339(),
            package.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// SQLite-backed plugin catalog
pub struct SqlitePluginCatalog {
    db: Arc<DatabaseManager>,
}

impl SqlitePluginCatalog {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    /// Insert or replace a catalog entry
    pub async fn upsert(&self, package: &PluginPackage) -> Result<()> {
        let package = package.clone();
        self.db
            .execute(move |conn| insert_package(conn, &package))
            .await
    }

    /// Insert or replace a batch of catalog entries atomically
    pub async fn import(&self, packages: &[PluginPackage]) -> Result<usize> {
        let packages = packages.to_vec();
        self.db
            .transaction(move |tx| {
                for package in &packages {
                    insert_package(tx, package)?;
                }
                Ok(packages.len())
            })
            .await
    }

    async fn query_packages(
        &self,
        filter: &'static str,
        arg: Option<String>,
    ) -> Result<Vec<PluginPackage>> {
        self.db
            .execute(move |conn| {
                let sql = format!(
                    "SELECT {} FROM plugin_packages {} ORDER BY name, version",
                    PACKAGE_COLUMNS, filter
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = match &arg {
                    Some(arg) => stmt.query_map([arg], package_from_row)?,
                    None => stmt.query_map([], package_from_row)?,
                };
                Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
            })
            .await
    }
}

#[async_trait]
impl PluginCatalog for SqlitePluginCatalog {
    async fn get_by_id(&self, id: &str) -> Result<Option<PluginPackage>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {} FROM plugin_packages WHERE id = ?", PACKAGE_COLUMNS),
                        [&id],
                        package_from_row,
                    )
                    .optional()?)
            })
            .await
    }

    async fn get_by_name_and_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<PluginPackage>> {
        let name = name.to_string();
        let version = version.to_string();
        self.db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        &format!(
                            "SELECT {} FROM plugin_packages WHERE name = ? AND version = ?",
                            PACKAGE_COLUMNS
                        ),
                        [&name, &version],
                        package_from_row,
                    )
                    .optional()?)
            })
            .await
    }

    async fn find_by_name(&self, name: &str) -> Result<Vec<PluginPackage>> {
        self.query_packages("WHERE name = ?", Some(name.to_string()))
            .await
    }

    async fn search_by_name(&self, text: &str) -> Result<Vec<PluginPackage>> {
        self.query_packages("WHERE name LIKE ? ESCAPE '\\'", Some(like_pattern(text)))
            .await
    }

    async fn get_by_game_version(&self, game_version: &str) -> Result<Vec<PluginPackage>> {
        self.query_packages(
            "WHERE EXISTS (SELECT 1 FROM json_each(plugin_packages.game_versions) WHERE value = ?)",
            Some(game_version.to_string()),
        )
        .await
    }

    async fn list_all(&self) -> Result<Vec<PluginPackage>> {
        self.query_packages("", None).await
    }
}

/// SQLite-backed installation records
pub struct SqliteInstallationRepository {
    db: Arc<DatabaseManager>,
}

impl SqliteInstallationRepository {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl InstallationRepository for SqliteInstallationRepository {
    async fn create(&self, installation: &ServerPluginInstallation) -> Result<()> {
        let record = installation.clone();
        let config = to_json(&record.config)?;
        self.db
            .execute(move |conn| {
                let result = conn.execute(
                    &format!(
                        "INSERT INTO server_plugin_installations ({}) \
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                        INSTALLATION_COLUMNS
                    ),
                    rusqlite::params![
                        &record.id,
                        &record.server_id,
                        &record.plugin_id,
                        record.status.as_str(),
                        config,
                        record.enabled,
                        record.installed_at.map(|t| t.to_rfc3339()),
                        &record.error_message,
                        record.created_at.to_rfc3339(),
                        record.updated_at.to_rfc3339(),
                    ],
                );

                match result {
                    Ok(_) => Ok(()),
                    Err(rusqlite::Error::SqliteFailure(err, _))
                        if err.code == ErrorCode::ConstraintViolation =>
                    {
                        Err(HostError::AlreadyInstalled {
                            server_id: record.server_id,
                            plugin_id: record.plugin_id,
                        })
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    async fn update(&self, installation: &ServerPluginInstallation) -> Result<()> {
        let record = installation.clone();
        let config = to_json(&record.config)?;
        self.db
            .execute(move |conn| {
                let changed = conn.execute(
                    "UPDATE server_plugin_installations SET plugin_id = ?, status = ?, config = ?, \
                     enabled = ?, installed_at = ?, error_message = ?, updated_at = ? WHERE id = ?",
                    rusqlite::params![
                        &record.plugin_id,
                        record.status.as_str(),
                        config,
                        record.enabled,
                        record.installed_at.map(|t| t.to_rfc3339()),
                        &record.error_message,
                        record.updated_at.to_rfc3339(),
                        &record.id,
                    ],
                )?;
                if changed == 0 {
                    return Err(HostError::InstallationNotFound(record.id));
                }
                Ok(())
            })
            .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                conn.execute("DELETE FROM server_plugin_installations WHERE id = ?", [&id])?;
                Ok(())
            })
            .await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<ServerPluginInstallation>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        &format!(
                            "SELECT {} FROM server_plugin_installations WHERE id = ?",
                            INSTALLATION_COLUMNS
                        ),
                        [&id],
                        installation_from_row,
                    )
                    .optional()?)
            })
            .await
    }

    async fn find_by_server_and_plugin(
        &self,
        server_id: &str,
        plugin_id: &str,
    ) -> Result<Option<ServerPluginInstallation>> {
        let server_id = server_id.to_string();
        let plugin_id = plugin_id.to_string();
        self.db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        &format!(
                            "SELECT {} FROM server_plugin_installations \
                             WHERE server_id = ? AND plugin_id = ?",
                            INSTALLATION_COLUMNS
                        ),
                        [&server_id, &plugin_id],
                        installation_from_row,
                    )
                    .optional()?)
            })
            .await
    }

    async fn find_by_server(
        &self,
        server_id: &str,
        status: Option<InstallationStatus>,
    ) -> Result<Vec<ServerPluginInstallation>> {
        let server_id = server_id.to_string();
        self.db
            .execute(move |conn| {
                let mut sql = format!(
                    "SELECT {} FROM server_plugin_installations WHERE server_id = ?",
                    INSTALLATION_COLUMNS
                );
                let mut params: Vec<String> = vec![server_id];
                if let Some(status) = status {
                    sql.push_str(" AND status = ?");
                    params.push(status.as_str().to_string());
                }
                sql.push_str(" ORDER BY created_at");

                let mut stmt = conn.prepare(&sql)?;
                let records = stmt
                    .query_map(rusqlite::params_from_iter(params.iter()), installation_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await
    }
}

/// SQLite-backed game server lookup
pub struct SqliteServerRepository {
    db: Arc<DatabaseManager>,
}

impl SqliteServerRepository {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    /// Register a server or update its name and game version
    pub async fn upsert(&self, server: &GameServer) -> Result<()> {
        let server = server.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO game_servers (id, name, game_version) VALUES (?, ?, ?) \
                     ON CONFLICT(id) DO UPDATE SET name = excluded.name, \
                     game_version = excluded.game_version",
                    [&server.id, &server.name, &server.game_version],
                )?;
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl ServerRepository for SqliteServerRepository {
    async fn get_by_id(&self, id: &str) -> Result<Option<GameServer>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, name, game_version FROM game_servers WHERE id = ?",
                        [&id],
                        |row| {
                            Ok(GameServer {
                                id: row.get(0)?,
                                name: row.get(1)?,
                                game_version: row.get(2)?,
                            })
                        },
                    )
                    .optional()?)
            })
            .await
    }
}
