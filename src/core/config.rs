//! Configuration management

use clap::{Parser, Subcommand};
use config::builder::{ConfigBuilder as Builder, DefaultState};
use config::{Config as ConfigBuilder, ConfigError as BuilderError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid database configuration: {0}")]
    InvalidDatabase(String),

    #[error("Invalid plugin policy configuration: {0}")]
    InvalidPlugins(String),

    #[error("Invalid orchestrator configuration: {0}")]
    InvalidOrchestrator(String),

    #[error("Invalid logging configuration: {0}")]
    InvalidLogging(String),

    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
}

impl From<BuilderError> for ConfigError {
    fn from(err: BuilderError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub plugins: PluginPolicyConfig,
    pub orchestrator: OrchestratorConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration with precedence: CLI args > Environment variables > Config file > Defaults
    pub fn load(cli_args: &CliArgs) -> Result<Self, ConfigError> {
        let mut builder = Self::with_defaults()?;

        if let Some(config_path) = &cli_args.config {
            if !config_path.exists() {
                return Err(ConfigError::FileNotFound(config_path.display().to_string()));
            }
            builder = builder.add_source(File::from(config_path.as_path()));
        }

        // Example: PLUGHOST_PLUGINS__ALLOW_UNAPPROVED=true
        builder = builder.add_source(
            Environment::with_prefix("PLUGHOST")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(db_path) = &cli_args.database {
            builder = builder.set_override("database.path", db_path.display().to_string())?;
        }
        if let Some(log_level) = &cli_args.log_level {
            builder = builder.set_override("logging.level", log_level.clone())?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    fn with_defaults() -> Result<Builder<DefaultState>, ConfigError> {
        Ok(ConfigBuilder::builder()
            .set_default("database.path", "./data/plughost.db")?
            .set_default("database.connection_pool_size", 10)?
            .set_default("database.busy_timeout", 5000)?
            .set_default("plugins.allow_unapproved", false)?
            .set_default("plugins.version_scheme", "lexical")?
            .set_default("plugins.strict_dependencies", false)?
            .set_default("plugins.max_bulk_items", 50)?
            .set_default("plugins.max_config_keys", 100)?
            .set_default("plugins.max_config_bytes", 65536)?
            .set_default("orchestrator.step_delay_ms", 500)?
            .set_default("orchestrator.update_buffer", 32)?
            .set_default("orchestrator.estimated_install_secs", 30)?
            .set_default("orchestrator.estimated_uninstall_secs", 15)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "text")?
            .set_default("logging.output", "stdout")?)
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.database.validate()?;
        self.plugins.validate()?;
        self.orchestrator.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// Command-line arguments for configuration override
#[derive(Debug, Parser)]
#[command(name = "plughost")]
#[command(about = "Game server plugin installation control plane", long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Database file path
    #[arg(short, long, value_name = "PATH")]
    pub database: Option<PathBuf>,

    /// Log level (debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Import plugin packages from a JSON array file into the catalog
    ImportCatalog {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Register or update a game server
    AddServer {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        game_version: String,
    },
    /// Search the plugin catalog
    Search {
        query: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        game_version: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the dependency graph and install order for a plugin
    Resolve {
        plugin_id: String,
        #[arg(long)]
        game_version: Option<String>,
    },
    /// Install a plugin and follow its progress
    Install {
        #[arg(long)]
        server: String,
        #[arg(long)]
        plugin: String,
        #[arg(long)]
        auto_dependencies: bool,
        #[arg(long)]
        force: bool,
    },
    /// List plugins installed on a server
    List {
        #[arg(long)]
        server: String,
        #[arg(long)]
        status: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub connection_pool_size: usize,
    pub busy_timeout: u64, // milliseconds
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidDatabase("path cannot be empty".to_string()));
        }

        if self.connection_pool_size == 0 {
            return Err(ConfigError::InvalidDatabase(
                "connection_pool_size must be greater than 0".to_string(),
            ));
        }

        if self.busy_timeout == 0 {
            return Err(ConfigError::InvalidDatabase(
                "busy_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Installation policy knobs
#[derive(Debug, Clone, Deserialize)]
pub struct PluginPolicyConfig {
    /// Allow plugins whose catalog entry is not approved
    pub allow_unapproved: bool,
    /// "lexical" or "semver"
    pub version_scheme: String,
    /// Abort the primary install when any auto-installed dependency fails
    pub strict_dependencies: bool,
    pub max_bulk_items: usize,
    pub max_config_keys: usize,
    pub max_config_bytes: usize,
}

impl Default for PluginPolicyConfig {
    fn default() -> Self {
        Self {
            allow_unapproved: false,
            version_scheme: "lexical".to_string(),
            strict_dependencies: false,
            max_bulk_items: 50,
            max_config_keys: 100,
            max_config_bytes: 65536,
        }
    }
}

impl PluginPolicyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_schemes = ["lexical", "semver"];
        if !valid_schemes.contains(&self.version_scheme.as_str()) {
            return Err(ConfigError::InvalidPlugins(format!(
                "version_scheme must be one of: {:?}",
                valid_schemes
            )));
        }

        if self.max_bulk_items == 0 {
            return Err(ConfigError::InvalidPlugins(
                "max_bulk_items must be greater than 0".to_string(),
            ));
        }

        if self.max_config_keys == 0 || self.max_config_bytes == 0 {
            return Err(ConfigError::InvalidPlugins(
                "max_config_keys and max_config_bytes must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Delay between simulated provisioning steps
    pub step_delay_ms: u64,
    /// Per-subscriber update channel capacity
    pub update_buffer: usize,
    pub estimated_install_secs: u64,
    pub estimated_uninstall_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            step_delay_ms: 500,
            update_buffer: 32,
            estimated_install_secs: 30,
            estimated_uninstall_secs: 15,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.update_buffer == 0 {
            return Err(ConfigError::InvalidOrchestrator(
                "update_buffer must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "level must be one of: {:?}",
                valid_levels
            )));
        }

        let valid_formats = ["json", "text"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "format must be one of: {:?}",
                valid_formats
            )));
        }

        let valid_outputs = ["stdout", "file"];
        if !valid_outputs.contains(&self.output.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "output must be one of: {:?}",
                valid_outputs
            )));
        }

        if self.output == "file" && self.log_file.is_none() {
            return Err(ConfigError::InvalidLogging(
                "log_file must be specified when output is 'file'".to_string(),
            ));
        }

        Ok(())
    }
}
