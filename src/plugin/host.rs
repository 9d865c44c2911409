//! Plugin host facade
//!
//! Wires the validator, graph builder, planner, conflict detector,
//! orchestrator and query service together from configuration, and exposes
//! the operations callers use.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::core::config::Config;
use crate::core::error::{HostError, Result};
use crate::db::manager::DatabaseManager;
use crate::db::repository::{
    SqliteInstallationRepository, SqlitePluginCatalog, SqliteServerRepository,
};
use crate::plugin::backend::{NoopComputeBackend, TracingAuditSink};
use crate::plugin::conflict::ConflictDetector;
use crate::plugin::executor::{InstallExecutor, SimulatedExecutor};
use crate::plugin::graph::DependencyGraphBuilder;
use crate::plugin::orchestrator::{
    validate_identifier, BulkInstallItem, BulkOperationResult, ConfigureResponse,
    InstallRequest, InstallResponse, InstallationOrchestrator, Ports, UninstallOptions,
    UninstallResponse, UpdateResponse,
};
use crate::plugin::planner::InstallOrderPlanner;
use crate::plugin::query::{ListFilter, QueryService, SearchPage, SearchQuery};
use crate::plugin::types::{
    ConflictAnalysis, DependencyGraph, PluginId, PluginPackage, ServerPluginInstallation,
};
use crate::plugin::updates::{Subscription, UpdateRegistry};
use crate::plugin::validator::{CompatibilityReport, CompatibilityValidator, ValidationOptions};
use crate::plugin::version::{VersionComparator, VersionScheme};

pub struct PluginHost {
    ports: Ports,
    validator: Arc<CompatibilityValidator>,
    detector: Arc<ConflictDetector>,
    graph: DependencyGraphBuilder,
    planner: InstallOrderPlanner,
    orchestrator: InstallationOrchestrator,
    query: QueryService,
}

impl PluginHost {
    pub fn new(config: &Config, ports: Ports, executor: Arc<dyn InstallExecutor>) -> Result<Self> {
        let versions = VersionComparator::new(config.plugins.version_scheme.parse::<VersionScheme>()?);
        let detector = Arc::new(ConflictDetector::new(versions));
        let validator = Arc::new(CompatibilityValidator::new(
            ports.catalog.clone(),
            ports.installations.clone(),
            ports.servers.clone(),
            detector.clone(),
            versions,
            config.plugins.allow_unapproved,
        ));
        let registry = Arc::new(UpdateRegistry::new(config.orchestrator.update_buffer));

        let orchestrator = InstallationOrchestrator::new(
            ports.clone(),
            validator.clone(),
            executor,
            registry,
            versions,
            config.plugins.clone(),
            config.orchestrator.clone(),
        );
        let query = QueryService::new(
            ports.catalog.clone(),
            ports.installations.clone(),
            ports.servers.clone(),
            versions,
            config.plugins.allow_unapproved,
        );

        tracing::info!(
            version_scheme = ?versions.scheme(),
            strict_dependencies = config.plugins.strict_dependencies,
            conflict_rules = ?detector.rule_names(),
            "Plugin host initialized"
        );

        Ok(Self {
            graph: DependencyGraphBuilder::new(ports.catalog.clone(), versions),
            planner: InstallOrderPlanner::new(),
            ports,
            validator,
            detector,
            orchestrator,
            query,
        })
    }

    /// Host backed by the SQLite repositories and the simulated executor
    pub fn from_database(config: &Config, db: Arc<DatabaseManager>) -> Result<Self> {
        let ports = Ports {
            catalog: Arc::new(SqlitePluginCatalog::new(db.clone())),
            installations: Arc::new(SqliteInstallationRepository::new(db.clone())),
            servers: Arc::new(SqliteServerRepository::new(db)),
            backend: Arc::new(NoopComputeBackend),
            audit: Arc::new(TracingAuditSink),
        };
        let executor = Arc::new(SimulatedExecutor::new(Duration::from_millis(
            config.orchestrator.step_delay_ms,
        )));
        Self::new(config, ports, executor)
    }

    pub async fn install(&self, request: InstallRequest) -> Result<InstallResponse> {
        self.orchestrator.install(request).await
    }

    pub async fn uninstall(
        &self,
        server_id: &str,
        plugin_id: &str,
        options: UninstallOptions,
    ) -> Result<UninstallResponse> {
        self.orchestrator.uninstall(server_id, plugin_id, options).await
    }

    pub async fn update(
        &self,
        server_id: &str,
        plugin_id: &str,
        new_version: &str,
        force: bool,
    ) -> Result<UpdateResponse> {
        self.orchestrator
            .update(server_id, plugin_id, new_version, force)
            .await
    }

    pub async fn configure(
        &self,
        server_id: &str,
        plugin_id: &str,
        config: Map<String, Value>,
    ) -> Result<ConfigureResponse> {
        self.orchestrator.configure(server_id, plugin_id, config).await
    }

    pub async fn get_config(&self, server_id: &str, plugin_id: &str) -> Result<Map<String, Value>> {
        self.orchestrator.get_config(server_id, plugin_id).await
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchPage> {
        self.query.search(query).await
    }

    pub async fn get_compatible(&self, server_id: &str) -> Result<Vec<PluginPackage>> {
        validate_identifier("server_id", server_id)?;
        self.query.get_compatible(server_id).await
    }

    pub async fn validate_compatibility(
        &self,
        plugin_id: &str,
        server_id: &str,
        force: bool,
    ) -> Result<CompatibilityReport> {
        validate_identifier("plugin_id", plugin_id)?;
        validate_identifier("server_id", server_id)?;
        let options = ValidationOptions {
            force,
            ..ValidationOptions::default()
        };
        self.validator.validate(plugin_id, server_id, &options).await
    }

    pub async fn resolve_dependencies(
        &self,
        plugin_ids: &[PluginId],
        game_version: &str,
    ) -> Result<DependencyGraph> {
        check_request(plugin_ids)?;
        self.graph.build(plugin_ids, game_version).await
    }

    /// Dependency-first install order for the requested plugins' closure
    pub async fn get_install_order(
        &self,
        plugin_ids: &[PluginId],
        game_version: &str,
    ) -> Result<Vec<PluginId>> {
        let graph = self.resolve_dependencies(plugin_ids, game_version).await?;
        self.planner.plan(&graph)
    }

    /// Conflicts between a server's active plugins and a set of candidates
    pub async fn check_conflicts(
        &self,
        server_id: &str,
        plugin_ids: &[PluginId],
    ) -> Result<ConflictAnalysis> {
        validate_identifier("server_id", server_id)?;
        check_request(plugin_ids)?;
        if self.ports.servers.get_by_id(server_id).await?.is_none() {
            return Err(HostError::ServerNotFound(server_id.to_string()));
        }

        let mut candidates = Vec::with_capacity(plugin_ids.len());
        for id in plugin_ids {
            let package = self
                .ports
                .catalog
                .get_by_id(id)
                .await?
                .ok_or_else(|| HostError::PluginNotFound(id.clone()))?;
            candidates.push(package);
        }

        let exclude: Vec<&str> = plugin_ids.iter().map(String::as_str).collect();
        let installed = self.validator.installed_packages(server_id, &exclude).await?;
        Ok(self.detector.detect(&installed, &candidates))
    }

    pub async fn get_status(
        &self,
        server_id: &str,
        plugin_id: &str,
    ) -> Result<ServerPluginInstallation> {
        self.orchestrator.get_status(server_id, plugin_id).await
    }

    pub async fn list_server_plugins(
        &self,
        server_id: &str,
        filter: &ListFilter,
    ) -> Result<Vec<ServerPluginInstallation>> {
        validate_identifier("server_id", server_id)?;
        self.query.list_server_plugins(server_id, filter).await
    }

    pub async fn subscribe_to_installation(&self, installation_id: &str) -> Result<Subscription> {
        self.orchestrator.subscribe(installation_id).await
    }

    pub async fn bulk_install(
        &self,
        server_id: &str,
        items: Vec<BulkInstallItem>,
    ) -> Result<BulkOperationResult> {
        self.orchestrator.bulk_install(server_id, items).await
    }

    pub async fn bulk_uninstall(
        &self,
        server_id: &str,
        plugin_ids: Vec<PluginId>,
        options: UninstallOptions,
    ) -> Result<BulkOperationResult> {
        self.orchestrator
            .bulk_uninstall(server_id, plugin_ids, options)
            .await
    }

    /// Wait for every running installation task
    pub async fn wait_idle(&self) {
        self.orchestrator.wait_idle().await;
    }

    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
    }
}

fn check_request(plugin_ids: &[PluginId]) -> Result<()> {
    if plugin_ids.is_empty() {
        return Err(HostError::InvalidRequest("No plugins requested".to_string()));
    }
    for id in plugin_ids {
        validate_identifier("plugin_id", id)?;
    }
    Ok(())
}
