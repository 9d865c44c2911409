//! plughost - game server plugin installation control plane
//!
//! Runs one catalog, resolution or installation command against the local
//! SQLite database.

use plughost::core::{self, ErrorResponse, HostError};
use plughost::db::{DatabaseManager, SqlitePluginCatalog, SqliteServerRepository};
use plughost::core::config::{CliArgs, Command};
use plughost::plugin::{
    GameServer, InstallRequest, InstallationStatus, ListFilter, PluginCategory, PluginHost,
    PluginPackage, SearchQuery,
};

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration (handles CLI args, env vars, and config file)
    let config = match core::Config::load(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            // Print error to stderr since logging isn't initialized yet
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let _logger = match core::Logger::init(&config.logging) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return Err(e);
        }
    };

    info!("Starting plughost v{}", plughost::VERSION);
    info!(
        path = ?config.database.path,
        "Database configuration"
    );

    let db = Arc::new(DatabaseManager::new(
        &config.database.path,
        config.database.connection_pool_size as u32,
        std::time::Duration::from_millis(config.database.busy_timeout),
    )?);
    let host = PluginHost::from_database(&config, db.clone())?;

    let result = run(args.command, &host, db).await;
    host.shutdown().await;

    if let Err(e) = &result {
        if let Some(host_error) = e.downcast_ref::<HostError>() {
            let response = ErrorResponse::from_error(host_error);
            eprintln!("{}", serde_json::to_string_pretty(&response)?);
        }
    }
    result
}

async fn run(command: Command, host: &PluginHost, db: Arc<DatabaseManager>) -> Result<()> {
    match command {
        Command::ImportCatalog { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read catalog file {}", file.display()))?;
            let packages: Vec<PluginPackage> =
                serde_json::from_str(&raw).context("Invalid catalog file")?;

            let count = SqlitePluginCatalog::new(db).import(&packages).await?;
            info!(count, "Catalog imported");
            println!("Imported {} plugin packages", count);
        }
        Command::AddServer {
            id,
            name,
            game_version,
        } => {
            plughost::plugin::orchestrator::validate_identifier("server_id", &id)?;
            let server = GameServer {
                id,
                name,
                game_version,
            };
            SqliteServerRepository::new(db).upsert(&server).await?;
            println!("Server {} registered ({})", server.id, server.game_version);
        }
        Command::Search {
            query,
            category,
            game_version,
            limit,
        } => {
            let category = category
                .map(|c| c.parse::<PluginCategory>())
                .transpose()?;
            let page = host
                .search(&SearchQuery {
                    text: query,
                    category,
                    game_version,
                    limit: Some(limit),
                    ..SearchQuery::default()
                })
                .await?;

            println!("{} matching plugins", page.total);
            for package in page.items {
                println!(
                    "{:<32} {:<12} {:<12} downloads={} rating={:.1}",
                    package.id,
                    package.version,
                    package.category.as_str(),
                    package.downloads,
                    package.rating
                );
            }
        }
        Command::Resolve {
            plugin_id,
            game_version,
        } => {
            let requested = vec![plugin_id];
            let game_version = game_version.unwrap_or_default();
            let graph = host.resolve_dependencies(&requested, &game_version).await?;
            for edge in &graph.edges {
                println!(
                    "{} -> {} ({}{})",
                    edge.from,
                    edge.to,
                    edge.constraint,
                    if edge.optional { ", optional" } else { "" }
                );
            }
            for missing in &graph.unresolved {
                println!("unresolved: {} needs {} {}", missing.from, missing.name, missing.constraint);
            }

            let order = host.get_install_order(&requested, &game_version).await?;
            println!("Install order:");
            for (step, plugin_id) in order.iter().enumerate() {
                let required_by = graph.dependents_of(plugin_id);
                if required_by.is_empty() {
                    println!("{:>3}. {}", step + 1, plugin_id);
                } else {
                    println!("{:>3}. {} (required by {})", step + 1, plugin_id, required_by.join(", "));
                }
            }
        }
        Command::Install {
            server,
            plugin,
            auto_dependencies,
            force,
        } => {
            let response = host
                .install(InstallRequest {
                    server_id: server,
                    plugin_id: plugin,
                    auto_dependencies,
                    force,
                    ..InstallRequest::default()
                })
                .await?;

            for dependency in &response.dependencies {
                println!("dependency scheduled: {}", dependency.plugin_id);
            }
            for failure in &response.dependency_failures {
                println!("dependency failed: {} ({})", failure.plugin_id, failure.reason);
            }
            for warning in &response.warnings {
                println!("warning: {}", warning);
            }

            let mut subscription = host
                .subscribe_to_installation(&response.installation_id)
                .await?;
            while let Some(update) = subscription.recv().await {
                match &update.error {
                    Some(error) => println!(
                        "[{:>3}%] {} {}: {}",
                        update.progress, update.status, update.message, error
                    ),
                    None => println!("[{:>3}%] {} {}", update.progress, update.status, update.message),
                }
            }
            if response.requires_restart {
                println!("A server restart is required to activate the plugin");
            }
        }
        Command::List { server, status } => {
            let status = status.map(|s| s.parse::<InstallationStatus>()).transpose()?;
            let records = host
                .list_server_plugins(
                    &server,
                    &ListFilter {
                        status,
                        ..ListFilter::default()
                    },
                )
                .await?;

            for record in records {
                println!(
                    "{:<32} {:<12} enabled={} {}",
                    record.plugin_id,
                    record.status.as_str(),
                    record.enabled,
                    record.error_message.unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}
