//! Installation orchestration
//!
//! Owns the per-(server, plugin) lifecycle:
//!
//! ```text
//! pending -> installing -> installed -> removing -> (deleted)
//!                 |            |            |
//!                 v            v            v
//!               failed    installing     failed
//! ```
//!
//! Requests are validated synchronously; accepted work runs on tracked tokio
//! tasks and reports progress through the [`UpdateRegistry`].
//!
//! Installs, updates and uninstalls on one server hold that server's
//! membership lock from validation until their records are written, so a
//! dependency check never races a removal.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::core::config::{OrchestratorConfig, PluginPolicyConfig};
use crate::core::error::{HostError, Result};
use crate::db::repository::{InstallationRepository, PluginCatalog, ServerRepository};
use crate::plugin::backend::{AuditAction, AuditEvent, AuditSink, ComputeBackend};
use crate::plugin::executor::{InstallExecutor, InstallJob, JobKind};
use crate::plugin::graph::DependencyGraphBuilder;
use crate::plugin::planner::InstallOrderPlanner;
use crate::plugin::types::{
    GameServer, InstallUpdate, InstallationId, InstallationStatus, PluginId, PluginPackage,
    ServerId, ServerPluginInstallation,
};
use crate::plugin::updates::{ProgressReporter, Subscription, UpdateRegistry};
use crate::plugin::validator::{CompatibilityValidator, ValidationOptions};
use crate::plugin::version::VersionComparator;

const MAX_IDENTIFIER_LEN: usize = 128;

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:@-]*$").unwrap();
}

/// Reject empty, oversized or malformed identifiers
pub fn validate_identifier(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(HostError::InvalidRequest(format!("{} must not be empty", field)));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(HostError::InvalidRequest(format!(
            "{} exceeds {} characters",
            field, MAX_IDENTIFIER_LEN
        )));
    }
    if !IDENTIFIER.is_match(value) {
        return Err(HostError::InvalidRequest(format!(
            "{} contains invalid characters: {}",
            field, value
        )));
    }
    Ok(())
}

/// External collaborators the orchestrator talks to
#[derive(Clone)]
pub struct Ports {
    pub catalog: Arc<dyn PluginCatalog>,
    pub installations: Arc<dyn InstallationRepository>,
    pub servers: Arc<dyn ServerRepository>,
    pub backend: Arc<dyn ComputeBackend>,
    pub audit: Arc<dyn AuditSink>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstallRequest {
    pub server_id: ServerId,
    pub plugin_id: PluginId,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub auto_dependencies: bool,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyInstall {
    pub plugin_id: PluginId,
    pub installation_id: InstallationId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyFailure {
    pub plugin_id: PluginId,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallResponse {
    pub installation_id: InstallationId,
    pub status: InstallationStatus,
    pub estimated_duration_secs: u64,
    /// Dependencies scheduled ahead of the plugin, in install order
    pub dependencies: Vec<DependencyInstall>,
    pub dependency_failures: Vec<DependencyFailure>,
    pub requires_restart: bool,
    pub forced: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct UninstallOptions {
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub skip_dependencies: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UninstallResponse {
    pub installation_id: InstallationId,
    pub status: InstallationStatus,
    pub estimated_duration_secs: u64,
    pub requires_restart: bool,
    /// Installed plugins that depend on the removed one (forced removals)
    pub affected_dependents: Vec<PluginId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateResponse {
    pub installation_id: InstallationId,
    pub status: InstallationStatus,
    pub from_version: String,
    pub to_version: String,
    pub breaking_changes: bool,
    pub requires_restart: bool,
    pub estimated_duration_secs: u64,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigureResponse {
    pub installation_id: InstallationId,
    pub config: Map<String, Value>,
    /// The compute backend accepted the configuration
    pub applied: bool,
    pub apply_error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BulkInstallItem {
    pub plugin_id: PluginId,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub auto_dependencies: bool,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkItemSuccess {
    pub plugin_id: PluginId,
    pub installation_id: InstallationId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkItemFailure {
    pub plugin_id: PluginId,
    pub reason: String,
    pub message: String,
}

impl BulkItemFailure {
    fn new(plugin_id: PluginId, error: &HostError) -> Self {
        Self {
            plugin_id,
            reason: error.reason_code().to_string(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkOperationResult {
    pub successful: Vec<BulkItemSuccess>,
    pub failed: Vec<BulkItemFailure>,
    pub total_estimated_secs: u64,
}

/// Held while a request for a (server, plugin) pair is being admitted
struct Admission<'a> {
    slots: &'a Mutex<HashSet<(ServerId, PluginId)>>,
    keys: Vec<(ServerId, PluginId)>,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        for key in &self.keys {
            slots.remove(key);
        }
    }
}

pub struct InstallationOrchestrator {
    ports: Ports,
    validator: Arc<CompatibilityValidator>,
    graph: DependencyGraphBuilder,
    planner: InstallOrderPlanner,
    executor: Arc<dyn InstallExecutor>,
    registry: Arc<UpdateRegistry>,
    versions: VersionComparator,
    policy: PluginPolicyConfig,
    settings: OrchestratorConfig,
    tracker: TaskTracker,
    admissions: Mutex<HashSet<(ServerId, PluginId)>>,
    server_locks: Mutex<HashMap<ServerId, Arc<AsyncMutex<()>>>>,
}

impl InstallationOrchestrator {
    pub fn new(
        ports: Ports,
        validator: Arc<CompatibilityValidator>,
        executor: Arc<dyn InstallExecutor>,
        registry: Arc<UpdateRegistry>,
        versions: VersionComparator,
        policy: PluginPolicyConfig,
        settings: OrchestratorConfig,
    ) -> Self {
        Self {
            graph: DependencyGraphBuilder::new(ports.catalog.clone(), versions),
            planner: InstallOrderPlanner::new(),
            ports,
            validator,
            executor,
            registry,
            versions,
            policy,
            settings,
            tracker: TaskTracker::new(),
            admissions: Mutex::new(HashSet::new()),
            server_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<UpdateRegistry> {
        &self.registry
    }

    /// Install a plugin, optionally with its dependency closure
    pub async fn install(&self, request: InstallRequest) -> Result<InstallResponse> {
        validate_identifier("server_id", &request.server_id)?;
        validate_identifier("plugin_id", &request.plugin_id)?;

        let server = self.load_server(&request.server_id).await?;
        let plugin = self.load_plugin(&request.plugin_id).await?;

        let _admission = self.admit(&server.id, &[plugin.id.as_str()])?;
        let membership = self.server_lock(&server.id);
        let _membership = membership.lock().await;

        let replaced = self.check_slot(&server.id, &plugin.id).await?;
        self.validate_config(&plugin, &request.config)?;

        let options = ValidationOptions {
            force: request.force,
            resolve_dependencies: request.auto_dependencies,
            replacing: None,
        };
        let report = self.validator.validate_package(&plugin, &server, &options).await?;
        if !report.compatible {
            return Err(report.to_error());
        }
        if report.forced {
            warn!(
                server_id = %server.id,
                plugin_id = %plugin.id,
                issues = report.issues.len(),
                "Installing despite compatibility issues (forced)"
            );
        }

        let mut dependencies = Vec::new();
        let mut dependency_failures = Vec::new();
        if request.auto_dependencies {
            self.install_dependencies(
                &server,
                &plugin,
                request.force,
                &mut dependencies,
                &mut dependency_failures,
            )
            .await?;
        }

        let record = self
            .start_install(&server, &plugin, request.config, replaced)
            .await?;

        info!(
            installation_id = %record.id,
            server_id = %server.id,
            plugin_id = %plugin.id,
            dependencies = dependencies.len(),
            dependency_failures = dependency_failures.len(),
            "Installation accepted"
        );

        Ok(InstallResponse {
            installation_id: record.id,
            status: record.status,
            estimated_duration_secs: self.settings.estimated_install_secs
                * (1 + dependencies.len() as u64),
            dependencies,
            dependency_failures,
            requires_restart: plugin.category.requires_restart(),
            forced: report.forced,
            warnings: report.warnings,
        })
    }

    /// Schedule every required dependency not already on the server
    async fn install_dependencies(
        &self,
        server: &GameServer,
        plugin: &PluginPackage,
        force: bool,
        installed: &mut Vec<DependencyInstall>,
        failures: &mut Vec<DependencyFailure>,
    ) -> Result<()> {
        let resolution = self
            .graph
            .resolve(std::slice::from_ref(&plugin.id), &server.game_version)
            .await?;
        let order = self.planner.plan(&resolution.graph)?;
        let present = self.validator.installed_packages(&server.id, &[]).await?;

        for dependency_id in order {
            if dependency_id == plugin.id {
                continue;
            }
            let (Some(node), Some(dependency)) = (
                resolution.graph.node(&dependency_id),
                resolution.package(&dependency_id),
            ) else {
                continue;
            };
            if !node.required {
                continue;
            }
            if present.iter().any(|p| p.name == node.name) {
                debug!(
                    server_id = %server.id,
                    dependency = %dependency_id,
                    "Dependency already present on server"
                );
                continue;
            }

            match self.install_single(server, dependency, force).await {
                Ok(record) => installed.push(DependencyInstall {
                    plugin_id: dependency_id,
                    installation_id: record.id,
                }),
                Err(e) if self.policy.strict_dependencies => {
                    return Err(HostError::DependencyInstallFailed(format!(
                        "{}: {}",
                        dependency_id, e
                    )));
                }
                Err(e) => {
                    warn!(
                        server_id = %server.id,
                        plugin_id = %plugin.id,
                        dependency = %dependency_id,
                        error = %e,
                        "Dependency installation failed, continuing"
                    );
                    failures.push(DependencyFailure {
                        plugin_id: dependency_id,
                        reason: e.reason_code().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Install one plugin without touching its dependencies
    ///
    /// Runs under the caller's membership lock.
    async fn install_single(
        &self,
        server: &GameServer,
        plugin: &PluginPackage,
        force: bool,
    ) -> Result<ServerPluginInstallation> {
        let _admission = self.admit(&server.id, &[plugin.id.as_str()])?;
        let replaced = self.check_slot(&server.id, &plugin.id).await?;

        let options = ValidationOptions {
            force,
            ..ValidationOptions::default()
        };
        let report = self.validator.validate_package(plugin, server, &options).await?;
        if !report.compatible {
            return Err(report.to_error());
        }

        self.start_install(server, plugin, Map::new(), replaced).await
    }

    async fn start_install(
        &self,
        server: &GameServer,
        plugin: &PluginPackage,
        config: Map<String, Value>,
        replaced: Option<ServerPluginInstallation>,
    ) -> Result<ServerPluginInstallation> {
        if let Some(old) = replaced {
            debug!(
                installation_id = %old.id,
                plugin_id = %plugin.id,
                "Replacing failed installation record"
            );
            self.ports.installations.delete(&old.id).await?;
        }

        let record = ServerPluginInstallation::new(&server.id, &plugin.id, config);
        self.ports.installations.create(&record).await?;

        self.ports.audit.record(
            AuditEvent::new(AuditAction::InstallRequested, &server.id, &plugin.id)
                .with_installation(&record.id),
        );
        self.spawn_install(record.clone(), plugin.clone(), JobKind::Install);

        Ok(record)
    }

    /// Remove an installed plugin
    pub async fn uninstall(
        &self,
        server_id: &str,
        plugin_id: &str,
        options: UninstallOptions,
    ) -> Result<UninstallResponse> {
        validate_identifier("server_id", server_id)?;
        validate_identifier("plugin_id", plugin_id)?;
        self.load_server(server_id).await?;

        let _admission = self.admit(server_id, &[plugin_id])?;
        let membership = self.server_lock(server_id);
        let _membership = membership.lock().await;

        let mut record = self.installed_record(server_id, plugin_id).await?;
        let plugin = self.load_plugin(plugin_id).await?;

        let mut affected_dependents = Vec::new();
        if !options.skip_dependencies {
            let dependents: Vec<PluginId> = self
                .validator
                .installed_packages(server_id, &[plugin_id])
                .await?
                .into_iter()
                .filter(|p| p.depends_on(&plugin.name))
                .map(|p| p.id)
                .collect();

            if !dependents.is_empty() {
                if !options.force {
                    return Err(HostError::DependencyBlocked {
                        plugin_id: plugin_id.to_string(),
                        dependents,
                    });
                }
                warn!(
                    server_id = %server_id,
                    plugin_id = %plugin_id,
                    dependents = ?dependents,
                    "Removing plugin that others depend on (forced)"
                );
                affected_dependents = dependents;
            }
        }

        record.transition(InstallationStatus::Removing)?;
        self.ports.installations.update(&record).await?;

        self.ports.audit.record(
            AuditEvent::new(AuditAction::UninstallRequested, server_id, plugin_id)
                .with_installation(&record.id),
        );

        let driver = self.driver();
        let job = InstallJob {
            installation_id: record.id.clone(),
            server_id: server_id.to_string(),
            plugin: plugin.clone(),
            kind: JobKind::Uninstall,
        };
        let installation_id = record.id.clone();
        self.tracker.spawn(async move { driver.run_uninstall(job, record).await });

        info!(
            installation_id = %installation_id,
            server_id = %server_id,
            plugin_id = %plugin_id,
            "Uninstallation accepted"
        );

        Ok(UninstallResponse {
            installation_id,
            status: InstallationStatus::Removing,
            estimated_duration_secs: self.settings.estimated_uninstall_secs,
            requires_restart: plugin.category.requires_restart(),
            affected_dependents,
        })
    }

    /// Move an installation to another published version of the same plugin
    pub async fn update(
        &self,
        server_id: &str,
        plugin_id: &str,
        new_version: &str,
        force: bool,
    ) -> Result<UpdateResponse> {
        validate_identifier("server_id", server_id)?;
        validate_identifier("plugin_id", plugin_id)?;
        if new_version.trim().is_empty() {
            return Err(HostError::InvalidRequest("new_version must not be empty".to_string()));
        }

        let server = self.load_server(server_id).await?;
        let _admission = self.admit(server_id, &[plugin_id])?;
        let membership = self.server_lock(server_id);
        let _membership = membership.lock().await;

        let mut record = self.installed_record(server_id, plugin_id).await?;
        let current = self.load_plugin(plugin_id).await?;

        if current.version == new_version {
            return Err(HostError::InvalidRequest(format!(
                "{} is already at version {}",
                current.name, new_version
            )));
        }

        let target = self
            .ports
            .catalog
            .get_by_name_and_version(&current.name, new_version)
            .await?
            .ok_or_else(|| HostError::PluginNotFound(format!("{} {}", current.name, new_version)))?;

        let _target_admission = self.admit(server_id, &[target.id.as_str()])?;
        if let Some(stale) = self.check_slot(server_id, &target.id).await? {
            self.ports.installations.delete(&stale.id).await?;
        }

        let options = ValidationOptions {
            force,
            resolve_dependencies: false,
            replacing: Some(current.id.clone()),
        };
        let report = self.validator.validate_package(&target, &server, &options).await?;
        if !report.compatible {
            return Err(report.to_error());
        }

        let breaking_changes = self
            .versions
            .is_breaking_change(&current.version, &target.version);

        record.transition(InstallationStatus::Installing)?;
        record.plugin_id = target.id.clone();
        record.error_message = None;
        self.ports.installations.update(&record).await?;

        self.ports.audit.record(
            AuditEvent::new(AuditAction::UpdateRequested, server_id, &target.id)
                .with_installation(&record.id)
                .with_details(serde_json::json!({
                    "from_version": current.version,
                    "to_version": target.version,
                })),
        );

        let installation_id = record.id.clone();
        self.spawn_install(
            record,
            target.clone(),
            JobKind::Update {
                from_version: current.version.clone(),
            },
        );

        info!(
            installation_id = %installation_id,
            server_id = %server_id,
            from = %current.version,
            to = %target.version,
            breaking_changes,
            "Update accepted"
        );

        Ok(UpdateResponse {
            installation_id,
            status: InstallationStatus::Installing,
            from_version: current.version,
            to_version: target.version,
            breaking_changes,
            requires_restart: target.category.requires_restart(),
            estimated_duration_secs: self.settings.estimated_install_secs,
            warnings: report.warnings,
        })
    }

    /// Replace an installation's configuration overrides and apply them
    pub async fn configure(
        &self,
        server_id: &str,
        plugin_id: &str,
        config: Map<String, Value>,
    ) -> Result<ConfigureResponse> {
        validate_identifier("server_id", server_id)?;
        validate_identifier("plugin_id", plugin_id)?;

        let mut record = self.installed_record(server_id, plugin_id).await?;
        let plugin = self.load_plugin(plugin_id).await?;
        self.validate_config(&plugin, &config)?;

        record.config = config;
        record.updated_at = Utc::now();
        self.ports.installations.update(&record).await?;

        // The persisted overrides stay even when applying them fails
        let apply_error = match self
            .ports
            .backend
            .apply_config(server_id, plugin_id, &record.config)
            .await
        {
            Ok(()) => None,
            Err(e) => {
                warn!(
                    server_id = %server_id,
                    plugin_id = %plugin_id,
                    error = %e,
                    "Failed to apply configuration"
                );
                Some(e.to_string())
            }
        };

        self.ports.audit.record(
            AuditEvent::new(AuditAction::Configured, server_id, plugin_id)
                .with_installation(&record.id)
                .with_details(serde_json::json!({ "keys": record.config.len() })),
        );

        Ok(ConfigureResponse {
            installation_id: record.id,
            config: record.config,
            applied: apply_error.is_none(),
            apply_error,
        })
    }

    pub async fn get_config(&self, server_id: &str, plugin_id: &str) -> Result<Map<String, Value>> {
        Ok(self.get_status(server_id, plugin_id).await?.config)
    }

    /// Current installation record for a (server, plugin) pair
    pub async fn get_status(
        &self,
        server_id: &str,
        plugin_id: &str,
    ) -> Result<ServerPluginInstallation> {
        validate_identifier("server_id", server_id)?;
        validate_identifier("plugin_id", plugin_id)?;

        self.ports
            .installations
            .find_by_server_and_plugin(server_id, plugin_id)
            .await?
            .ok_or_else(|| HostError::NotInstalled {
                server_id: server_id.to_string(),
                plugin_id: plugin_id.to_string(),
            })
    }

    /// Watch an installation's progress
    ///
    /// Installations that already settled yield a single snapshot update and
    /// then close.
    pub async fn subscribe(&self, installation_id: &str) -> Result<Subscription> {
        validate_identifier("installation_id", installation_id)?;

        // Register before reading the record so no terminal update is missed
        let subscription = self.registry.subscribe(installation_id);

        let record = self
            .ports
            .installations
            .find_by_id(installation_id)
            .await?
            .ok_or_else(|| HostError::InstallationNotFound(installation_id.to_string()))?;

        if !record.status.is_transitional() {
            self.registry.settle(
                installation_id,
                subscription.id(),
                InstallUpdate {
                    installation_id: record.id.clone(),
                    status: record.status,
                    progress: 100,
                    message: format!("Installation is {}", record.status),
                    error: record.error_message.clone(),
                    timestamp: Utc::now(),
                },
            );
        }

        Ok(subscription)
    }

    pub async fn bulk_install(
        &self,
        server_id: &str,
        items: Vec<BulkInstallItem>,
    ) -> Result<BulkOperationResult> {
        self.check_envelope(items.len())?;

        let mut result = BulkOperationResult::default();
        for item in items {
            let request = InstallRequest {
                server_id: server_id.to_string(),
                plugin_id: item.plugin_id.clone(),
                config: item.config,
                auto_dependencies: item.auto_dependencies,
                force: item.force,
            };
            match self.install(request).await {
                Ok(response) => {
                    result.total_estimated_secs += response.estimated_duration_secs;
                    result.successful.push(BulkItemSuccess {
                        plugin_id: item.plugin_id,
                        installation_id: response.installation_id,
                    });
                }
                Err(e) => {
                    warn!(
                        server_id = %server_id,
                        plugin_id = %item.plugin_id,
                        error = %e,
                        "Bulk install item failed"
                    );
                    result.failed.push(BulkItemFailure::new(item.plugin_id, &e));
                }
            }
        }

        info!(
            server_id = %server_id,
            successful = result.successful.len(),
            failed = result.failed.len(),
            "Bulk install processed"
        );
        Ok(result)
    }

    pub async fn bulk_uninstall(
        &self,
        server_id: &str,
        plugin_ids: Vec<PluginId>,
        options: UninstallOptions,
    ) -> Result<BulkOperationResult> {
        self.check_envelope(plugin_ids.len())?;

        let mut result = BulkOperationResult::default();
        for plugin_id in plugin_ids {
            match self.uninstall(server_id, &plugin_id, options).await {
                Ok(response) => {
                    result.total_estimated_secs += response.estimated_duration_secs;
                    result.successful.push(BulkItemSuccess {
                        plugin_id,
                        installation_id: response.installation_id,
                    });
                }
                Err(e) => {
                    warn!(
                        server_id = %server_id,
                        plugin_id = %plugin_id,
                        error = %e,
                        "Bulk uninstall item failed"
                    );
                    result.failed.push(BulkItemFailure::new(plugin_id, &e));
                }
            }
        }

        info!(
            server_id = %server_id,
            successful = result.successful.len(),
            failed = result.failed.len(),
            "Bulk uninstall processed"
        );
        Ok(result)
    }

    /// Wait until every spawned installation task has finished
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Stop accepting work and wait for running tasks
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        info!("Installation orchestrator stopped");
    }

    fn check_envelope(&self, len: usize) -> Result<()> {
        if len == 0 {
            return Err(HostError::InvalidRequest("Bulk request has no items".to_string()));
        }
        if len > self.policy.max_bulk_items {
            return Err(HostError::InvalidRequest(format!(
                "Bulk request has {} items, maximum is {}",
                len, self.policy.max_bulk_items
            )));
        }
        Ok(())
    }

    fn validate_config(&self, plugin: &PluginPackage, config: &Map<String, Value>) -> Result<()> {
        if config.len() > self.policy.max_config_keys {
            return Err(HostError::InvalidConfig(format!(
                "{} keys given, maximum is {}",
                config.len(),
                self.policy.max_config_keys
            )));
        }
        if config.keys().any(|k| k.trim().is_empty()) {
            return Err(HostError::InvalidConfig("Configuration keys must not be empty".to_string()));
        }

        let size = serde_json::to_vec(config)
            .map_err(|e| HostError::SerializationError(e.to_string()))?
            .len();
        if size > self.policy.max_config_bytes {
            return Err(HostError::InvalidConfig(format!(
                "Configuration is {} bytes, maximum is {}",
                size, self.policy.max_config_bytes
            )));
        }

        if let Some(schema) = &plugin.config_schema {
            let compiled = jsonschema::JSONSchema::compile(schema).map_err(|e| {
                HostError::InvalidConfig(format!(
                    "{} ships an invalid configuration schema: {}",
                    plugin.id, e
                ))
            })?;

            let instance = Value::Object(config.clone());
            let result = compiled.validate(&instance);
            if let Err(errors) = result {
                let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
                return Err(HostError::InvalidConfig(format!(
                    "Configuration validation failed: {}",
                    messages.join(", ")
                )));
            }
        }

        Ok(())
    }

    fn admit(&self, server_id: &str, plugin_ids: &[&str]) -> Result<Admission<'_>> {
        let mut slots = self.admissions.lock().unwrap_or_else(PoisonError::into_inner);
        let keys: Vec<(ServerId, PluginId)> = plugin_ids
            .iter()
            .map(|p| (server_id.to_string(), p.to_string()))
            .collect();

        if let Some((server_id, plugin_id)) = keys.iter().find(|k| slots.contains(*k)) {
            return Err(HostError::InstallInProgress {
                server_id: server_id.clone(),
                plugin_id: plugin_id.clone(),
                status: InstallationStatus::Pending.to_string(),
            });
        }
        slots.extend(keys.iter().cloned());

        Ok(Admission {
            slots: &self.admissions,
            keys,
        })
    }

    fn server_lock(&self, server_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.server_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(server_id.to_string()).or_default().clone()
    }

    /// Check that a pair is free; returns a failed record to be replaced
    async fn check_slot(
        &self,
        server_id: &str,
        plugin_id: &str,
    ) -> Result<Option<ServerPluginInstallation>> {
        let Some(existing) = self
            .ports
            .installations
            .find_by_server_and_plugin(server_id, plugin_id)
            .await?
        else {
            return Ok(None);
        };

        match existing.status {
            InstallationStatus::Failed => Ok(Some(existing)),
            InstallationStatus::Installed => Err(HostError::AlreadyInstalled {
                server_id: server_id.to_string(),
                plugin_id: plugin_id.to_string(),
            }),
            status => Err(HostError::InstallInProgress {
                server_id: server_id.to_string(),
                plugin_id: plugin_id.to_string(),
                status: status.to_string(),
            }),
        }
    }

    /// The pair's record, which must be `installed`
    async fn installed_record(
        &self,
        server_id: &str,
        plugin_id: &str,
    ) -> Result<ServerPluginInstallation> {
        let not_installed = || HostError::NotInstalled {
            server_id: server_id.to_string(),
            plugin_id: plugin_id.to_string(),
        };

        let record = self
            .ports
            .installations
            .find_by_server_and_plugin(server_id, plugin_id)
            .await?
            .ok_or_else(not_installed)?;

        match record.status {
            InstallationStatus::Installed => Ok(record),
            InstallationStatus::Failed => Err(not_installed()),
            status => Err(HostError::InstallInProgress {
                server_id: server_id.to_string(),
                plugin_id: plugin_id.to_string(),
                status: status.to_string(),
            }),
        }
    }

    async fn load_server(&self, server_id: &str) -> Result<GameServer> {
        self.ports
            .servers
            .get_by_id(server_id)
            .await?
            .ok_or_else(|| HostError::ServerNotFound(server_id.to_string()))
    }

    async fn load_plugin(&self, plugin_id: &str) -> Result<PluginPackage> {
        self.ports
            .catalog
            .get_by_id(plugin_id)
            .await?
            .ok_or_else(|| HostError::PluginNotFound(plugin_id.to_string()))
    }

    fn spawn_install(&self, record: ServerPluginInstallation, plugin: PluginPackage, kind: JobKind) {
        let driver = self.driver();
        let job = InstallJob {
            installation_id: record.id.clone(),
            server_id: record.server_id.clone(),
            plugin,
            kind,
        };
        self.tracker.spawn(async move { driver.run_install(job, record).await });
    }

    fn driver(&self) -> Driver {
        Driver {
            installations: self.ports.installations.clone(),
            audit: self.ports.audit.clone(),
            executor: self.executor.clone(),
            registry: self.registry.clone(),
        }
    }
}

/// State needed by a spawned installation task
struct Driver {
    installations: Arc<dyn InstallationRepository>,
    audit: Arc<dyn AuditSink>,
    executor: Arc<dyn InstallExecutor>,
    registry: Arc<UpdateRegistry>,
}

impl Driver {
    async fn run_install(self, job: InstallJob, mut record: ServerPluginInstallation) {
        let reporter =
            ProgressReporter::new(self.registry.clone(), &record.id, InstallationStatus::Installing);
        let name = format!("{} {}", job.plugin.name, job.plugin.version);

        // updates arrive already installing
        if record.status == InstallationStatus::Pending {
            self.advance(&mut record, InstallationStatus::Installing).await;
        }
        reporter.progress(10, format!("Starting installation of {}", name));

        match self.executor.install(&job, &reporter).await {
            Ok(()) => {
                record.installed_at = Some(Utc::now());
                record.error_message = None;
                self.advance(&mut record, InstallationStatus::Installed).await;
                reporter.complete(InstallationStatus::Installed, format!("{} installed", name));

                self.audit.record(
                    AuditEvent::new(AuditAction::Completed, &job.server_id, &job.plugin.id)
                        .with_installation(&record.id),
                );
                info!(
                    installation_id = %record.id,
                    server_id = %job.server_id,
                    plugin_id = %job.plugin.id,
                    "Plugin installed"
                );
            }
            Err(e) => self.fail(&job, &mut record, &reporter, e).await,
        }
    }

    async fn run_uninstall(self, job: InstallJob, mut record: ServerPluginInstallation) {
        let reporter =
            ProgressReporter::new(self.registry.clone(), &record.id, InstallationStatus::Removing);
        reporter.progress(10, format!("Starting removal of {}", job.plugin.name));

        match self.executor.uninstall(&job, &reporter).await {
            Ok(()) => {
                if let Err(e) = self.installations.delete(&record.id).await {
                    error!(installation_id = %record.id, error = %e, "Failed to delete installation record");
                }
                reporter.complete(
                    InstallationStatus::Removing,
                    format!("{} removed", job.plugin.name),
                );

                self.audit.record(
                    AuditEvent::new(AuditAction::Completed, &job.server_id, &job.plugin.id)
                        .with_installation(&record.id)
                        .with_details(serde_json::json!({ "removed": true })),
                );
                info!(
                    installation_id = %record.id,
                    server_id = %job.server_id,
                    plugin_id = %job.plugin.id,
                    "Plugin removed"
                );
            }
            Err(e) => self.fail(&job, &mut record, &reporter, e).await,
        }
    }

    async fn fail(
        &self,
        job: &InstallJob,
        record: &mut ServerPluginInstallation,
        reporter: &ProgressReporter,
        err: HostError,
    ) {
        record.error_message = Some(err.to_string());
        self.advance(record, InstallationStatus::Failed).await;
        reporter.fail(
            format!("{} of {} failed", operation(&job.kind), job.plugin.name),
            err.to_string(),
        );

        self.audit.record(
            AuditEvent::new(AuditAction::Failed, &job.server_id, &job.plugin.id)
                .with_installation(&record.id)
                .with_details(serde_json::json!({ "error": err.to_string() })),
        );
        error!(
            installation_id = %record.id,
            server_id = %job.server_id,
            plugin_id = %job.plugin.id,
            error = %err,
            "Plugin operation failed"
        );
    }

    /// Move the record to `next` and store it
    async fn advance(&self, record: &mut ServerPluginInstallation, next: InstallationStatus) {
        if let Err(e) = record.transition(next) {
            error!(installation_id = %record.id, error = %e, "Rejected installation status change");
            return;
        }
        if let Err(e) = self.installations.update(record).await {
            error!(installation_id = %record.id, error = %e, "Failed to persist installation status");
        }
    }
}

fn operation(kind: &JobKind) -> &'static str {
    match kind {
        JobKind::Install => "Installation",
        JobKind::Update { .. } => "Update",
        JobKind::Uninstall => "Removal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PluginPolicyConfig;
    use crate::plugin::types::PluginCategory;
    use crate::test_support::{package, Fixture, ScriptedExecutor};
    use serde_json::json;

    async fn setup(packages: Vec<PluginPackage>) -> (Fixture, Arc<ScriptedExecutor>) {
        let fixture = Fixture::new().await;
        fixture.add_server("srv-1", "1.20.1").await;
        fixture.add_packages(&packages).await;
        (fixture, Arc::new(ScriptedExecutor::new()))
    }

    fn request(plugin_id: &str) -> InstallRequest {
        InstallRequest {
            server_id: "srv-1".to_string(),
            plugin_id: plugin_id.to_string(),
            ..InstallRequest::default()
        }
    }

    #[tokio::test]
    async fn test_install_lifecycle_and_progress() {
        let (fixture, executor) = setup(vec![package("warps", "1.0")]).await;
        let orchestrator = fixture.orchestrator(executor.clone(), PluginPolicyConfig::default());

        let response = orchestrator.install(request("warps@1.0")).await.unwrap();
        assert_eq!(response.status, InstallationStatus::Pending);
        assert!(!response.requires_restart);

        let mut subscription = orchestrator.subscribe(&response.installation_id).await.unwrap();
        let mut updates = Vec::new();
        while let Some(update) = subscription.recv().await {
            updates.push((update.status, update.progress));
        }
        assert_eq!(
            updates,
            vec![
                (InstallationStatus::Installing, 10),
                (InstallationStatus::Installing, 50),
                (InstallationStatus::Installing, 80),
                (InstallationStatus::Installed, 100),
            ]
        );

        orchestrator.wait_idle().await;
        let record = orchestrator.get_status("srv-1", "warps@1.0").await.unwrap();
        assert_eq!(record.status, InstallationStatus::Installed);
        assert!(record.installed_at.is_some());
        assert_eq!(executor.calls(), vec!["install:warps@1.0"]);
    }

    #[tokio::test]
    async fn test_failed_install_then_fresh_install_replaces_record() {
        let (fixture, _) = setup(vec![package("broken", "1.0")]).await;
        let executor = Arc::new(ScriptedExecutor::new().fail_on("broken@1.0"));
        let orchestrator = fixture.orchestrator(executor.clone(), PluginPolicyConfig::default());

        let first = orchestrator.install(request("broken@1.0")).await.unwrap();
        orchestrator.wait_idle().await;

        let record = orchestrator.get_status("srv-1", "broken@1.0").await.unwrap();
        assert_eq!(record.status, InstallationStatus::Failed);
        assert!(record.error_message.unwrap().contains("scripted failure"));

        // late subscriber gets the terminal snapshot
        let mut subscription = orchestrator.subscribe(&first.installation_id).await.unwrap();
        let snapshot = subscription.recv().await.unwrap();
        assert_eq!(snapshot.status, InstallationStatus::Failed);
        assert_eq!(snapshot.progress, 100);
        assert!(snapshot.error.is_some());
        assert!(subscription.recv().await.is_none());

        executor.clear_failures();
        let second = orchestrator.install(request("broken@1.0")).await.unwrap();
        assert_ne!(first.installation_id, second.installation_id);
        orchestrator.wait_idle().await;
        assert_eq!(
            orchestrator.get_status("srv-1", "broken@1.0").await.unwrap().status,
            InstallationStatus::Installed
        );
    }

    #[tokio::test]
    async fn test_duplicate_install_guard() {
        let (fixture, executor) = setup(vec![package("warps", "1.0")]).await;
        let orchestrator = fixture.orchestrator(executor, PluginPolicyConfig::default());

        let (a, b) = tokio::join!(
            orchestrator.install(request("warps@1.0")),
            orchestrator.install(request("warps@1.0"))
        );

        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let err = results.into_iter().find_map(|r| r.err()).unwrap();
        assert!(matches!(
            err.reason_code(),
            "install_in_progress" | "already_installed"
        ));

        orchestrator.wait_idle().await;
        let err = orchestrator.install(request("warps@1.0")).await.unwrap_err();
        assert_eq!(err.reason_code(), "already_installed");
    }

    #[tokio::test]
    async fn test_auto_dependencies_install_leaf_first() {
        let (fixture, executor) = setup(vec![
            package("a", "1.0").with_dependency("b", "any"),
            package("b", "1.0").with_dependency("c", "any"),
            package("c", "1.0"),
        ])
        .await;
        let orchestrator = fixture.orchestrator(executor, PluginPolicyConfig::default());

        let response = orchestrator
            .install(InstallRequest {
                auto_dependencies: true,
                ..request("a@1.0")
            })
            .await
            .unwrap();

        let scheduled: Vec<&str> = response
            .dependencies
            .iter()
            .map(|d| d.plugin_id.as_str())
            .collect();
        assert_eq!(scheduled, vec!["c@1.0", "b@1.0"]);
        assert!(response.dependency_failures.is_empty());
        assert_eq!(response.estimated_duration_secs, 30 * 3);

        orchestrator.wait_idle().await;
        for id in ["a@1.0", "b@1.0", "c@1.0"] {
            assert_eq!(
                orchestrator.get_status("srv-1", id).await.unwrap().status,
                InstallationStatus::Installed
            );
        }
    }

    #[tokio::test]
    async fn test_dependency_failures_best_effort_and_strict() {
        let unsupported = PluginPackage::new("b@1.0", "b", "1.0", PluginCategory::Utility)
            .with_game_version("1.12");
        let (fixture, executor) = setup(vec![
            package("a", "1.0").with_dependency("b", "any"),
            unsupported,
        ])
        .await;

        let best_effort = fixture.orchestrator(executor.clone(), PluginPolicyConfig::default());
        let response = best_effort
            .install(InstallRequest {
                auto_dependencies: true,
                ..request("a@1.0")
            })
            .await
            .unwrap();
        assert_eq!(response.dependency_failures.len(), 1);
        assert_eq!(response.dependency_failures[0].reason, "game_version_mismatch");
        best_effort.wait_idle().await;

        let strict = fixture.orchestrator(
            executor,
            PluginPolicyConfig {
                strict_dependencies: true,
                ..PluginPolicyConfig::default()
            },
        );
        fixture.add_server("srv-2", "1.20.1").await;
        let err = strict
            .install(InstallRequest {
                server_id: "srv-2".to_string(),
                auto_dependencies: true,
                ..request("a@1.0")
            })
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "dependency_install_failed");
        assert!(strict.get_status("srv-2", "a@1.0").await.is_err());
    }

    #[tokio::test]
    async fn test_circular_dependency_is_synchronous() {
        let (fixture, executor) = setup(vec![
            package("a", "1.0").with_dependency("b", "any"),
            package("b", "1.0").with_dependency("a", "any"),
        ])
        .await;
        let orchestrator = fixture.orchestrator(executor.clone(), PluginPolicyConfig::default());

        let err = orchestrator
            .install(InstallRequest {
                auto_dependencies: true,
                ..request("a@1.0")
            })
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "circular_dependency");

        orchestrator.wait_idle().await;
        assert!(executor.calls().is_empty());
        assert!(orchestrator.get_status("srv-1", "a@1.0").await.is_err());
    }

    #[tokio::test]
    async fn test_game_version_mismatch_and_force() {
        let (fixture, executor) = setup(vec![package("maps", "1.0")]).await;
        fixture.add_server("srv-old", "1.19").await;
        let orchestrator = fixture.orchestrator(executor, PluginPolicyConfig::default());

        let plain = InstallRequest {
            server_id: "srv-old".to_string(),
            ..request("maps@1.0")
        };
        let err = orchestrator.install(plain.clone()).await.unwrap_err();
        assert_eq!(err.reason_code(), "game_version_mismatch");

        let response = orchestrator
            .install(InstallRequest { force: true, ..plain })
            .await
            .unwrap();
        assert!(response.forced);
    }

    #[tokio::test]
    async fn test_uninstall_dependency_guard() {
        let (fixture, executor) = setup(vec![
            package("shop", "1.0").with_dependency("vault", "any"),
            package("vault", "1.0"),
        ])
        .await;
        let orchestrator = fixture.orchestrator(executor, PluginPolicyConfig::default());
        orchestrator
            .install(InstallRequest {
                auto_dependencies: true,
                ..request("shop@1.0")
            })
            .await
            .unwrap();
        orchestrator.wait_idle().await;

        let err = orchestrator
            .uninstall("srv-1", "vault@1.0", UninstallOptions::default())
            .await
            .unwrap_err();
        match err {
            HostError::DependencyBlocked { dependents, .. } => {
                assert_eq!(dependents, vec!["shop@1.0"])
            }
            other => panic!("expected dependency_blocked, got {:?}", other),
        }

        let response = orchestrator
            .uninstall(
                "srv-1",
                "vault@1.0",
                UninstallOptions {
                    force: true,
                    ..UninstallOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(response.status, InstallationStatus::Removing);
        assert_eq!(response.affected_dependents, vec!["shop@1.0"]);

        orchestrator.wait_idle().await;
        let err = orchestrator.get_status("srv-1", "vault@1.0").await.unwrap_err();
        assert_eq!(err.reason_code(), "not_installed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_install_and_uninstall_keep_dependency() {
        let (fixture, executor) = setup(vec![
            package("shop", "1.0").with_dependency("vault", "any"),
            package("vault", "1.0"),
        ])
        .await;
        let orchestrator = Arc::new(fixture.orchestrator(executor, PluginPolicyConfig::default()));

        for round in 0..20 {
            let server_id = format!("srv-race-{}", round);
            fixture.add_server(&server_id, "1.20.1").await;
            orchestrator
                .install(InstallRequest {
                    server_id: server_id.clone(),
                    ..request("vault@1.0")
                })
                .await
                .unwrap();
            orchestrator.wait_idle().await;

            let installer = {
                let orchestrator = orchestrator.clone();
                let request = InstallRequest {
                    server_id: server_id.clone(),
                    ..request("shop@1.0")
                };
                tokio::spawn(async move { orchestrator.install(request).await })
            };
            let remover = {
                let orchestrator = orchestrator.clone();
                let server_id = server_id.clone();
                tokio::spawn(async move {
                    orchestrator
                        .uninstall(&server_id, "vault@1.0", UninstallOptions::default())
                        .await
                })
            };

            let installed = installer.await.unwrap();
            let removed = remover.await.unwrap();
            assert!(
                installed.is_ok() != removed.is_ok(),
                "round {}: install {:?}, uninstall {:?}",
                round,
                installed,
                removed
            );
            orchestrator.wait_idle().await;
        }
    }

    #[tokio::test]
    async fn test_uninstall_skipping_dependency_check() {
        let (fixture, executor) = setup(vec![
            package("shop", "1.0").with_dependency("vault", "any"),
            package("vault", "1.0"),
        ])
        .await;
        fixture
            .add_installation("srv-1", "vault@1.0", InstallationStatus::Installed)
            .await;
        fixture
            .add_installation("srv-1", "shop@1.0", InstallationStatus::Installed)
            .await;
        let orchestrator = fixture.orchestrator(executor, PluginPolicyConfig::default());

        let response = orchestrator
            .uninstall(
                "srv-1",
                "vault@1.0",
                UninstallOptions {
                    skip_dependencies: true,
                    ..UninstallOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(response.affected_dependents.is_empty());

        orchestrator.wait_idle().await;
        assert!(orchestrator.get_status("srv-1", "vault@1.0").await.is_err());
        assert_eq!(
            orchestrator.get_status("srv-1", "shop@1.0").await.unwrap().status,
            InstallationStatus::Installed
        );
    }

    #[tokio::test]
    async fn test_failed_uninstall_keeps_failed_record() {
        let (fixture, _) = setup(vec![package("warps", "1.0")]).await;
        fixture
            .add_installation("srv-1", "warps@1.0", InstallationStatus::Installed)
            .await;
        let executor = Arc::new(ScriptedExecutor::new().fail_on("warps@1.0"));
        let orchestrator = fixture.orchestrator(executor.clone(), PluginPolicyConfig::default());

        let response = orchestrator
            .uninstall("srv-1", "warps@1.0", UninstallOptions::default())
            .await
            .unwrap();
        orchestrator.wait_idle().await;

        let record = orchestrator.get_status("srv-1", "warps@1.0").await.unwrap();
        assert_eq!(record.id, response.installation_id);
        assert_eq!(record.status, InstallationStatus::Failed);
        assert!(record.error_message.unwrap().contains("scripted failure"));
        assert_eq!(executor.calls(), vec!["uninstall:warps@1.0"]);

        let mut subscription = orchestrator.subscribe(&response.installation_id).await.unwrap();
        let snapshot = subscription.recv().await.unwrap();
        assert_eq!(snapshot.status, InstallationStatus::Failed);

        // a failed record no longer counts as installed
        let err = orchestrator
            .uninstall("srv-1", "warps@1.0", UninstallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "not_installed");
    }

    #[tokio::test]
    async fn test_uninstall_state_checks() {
        let (fixture, _) = setup(vec![package("warps", "1.0")]).await;
        let (executor, gate) = ScriptedExecutor::gated();
        let orchestrator = fixture.orchestrator(Arc::new(executor), PluginPolicyConfig::default());

        let err = orchestrator
            .uninstall("srv-1", "warps@1.0", UninstallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "not_installed");

        orchestrator.install(request("warps@1.0")).await.unwrap();
        let err = orchestrator
            .uninstall("srv-1", "warps@1.0", UninstallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "install_in_progress");

        gate.add_permits(1);
        orchestrator.wait_idle().await;
        orchestrator
            .uninstall("srv-1", "warps@1.0", UninstallOptions::default())
            .await
            .unwrap();
        gate.add_permits(1);
        orchestrator.wait_idle().await;
    }

    #[tokio::test]
    async fn test_update_flow() {
        let mut next = package("x", "2.0");
        next.category = PluginCategory::World;
        let (fixture, executor) = setup(vec![package("x", "1.0"), next]).await;
        let orchestrator = fixture.orchestrator(executor.clone(), PluginPolicyConfig::default());

        let err = orchestrator.update("srv-1", "x@1.0", "2.0", false).await.unwrap_err();
        assert_eq!(err.reason_code(), "not_installed");

        orchestrator.install(request("x@1.0")).await.unwrap();
        orchestrator.wait_idle().await;

        let err = orchestrator.update("srv-1", "x@1.0", "1.0", false).await.unwrap_err();
        assert_eq!(err.reason_code(), "invalid_request");
        let err = orchestrator.update("srv-1", "x@1.0", "9.9", false).await.unwrap_err();
        assert_eq!(err.reason_code(), "plugin_not_found");

        let response = orchestrator.update("srv-1", "x@1.0", "2.0", false).await.unwrap();
        assert_eq!(response.from_version, "1.0");
        assert_eq!(response.to_version, "2.0");
        assert!(response.breaking_changes);
        assert!(response.requires_restart);

        orchestrator.wait_idle().await;
        let record = orchestrator.get_status("srv-1", "x@2.0").await.unwrap();
        assert_eq!(record.status, InstallationStatus::Installed);
        assert_eq!(record.id, response.installation_id);
        assert!(orchestrator.get_status("srv-1", "x@1.0").await.is_err());
        assert_eq!(executor.calls(), vec!["install:x@1.0", "install:x@2.0"]);
    }

    #[tokio::test]
    async fn test_failed_update_reports_terminal_failure() {
        let (fixture, _) = setup(vec![package("x", "1.0"), package("x", "1.1")]).await;
        fixture
            .add_installation("srv-1", "x@1.0", InstallationStatus::Installed)
            .await;
        let (executor, gate) = ScriptedExecutor::gated();
        let orchestrator = fixture.orchestrator(
            Arc::new(executor.fail_on("x@1.1")),
            PluginPolicyConfig::default(),
        );

        let response = orchestrator.update("srv-1", "x@1.0", "1.1", false).await.unwrap();
        assert_eq!(response.status, InstallationStatus::Installing);
        assert!(!response.breaking_changes);

        let mut subscription = orchestrator.subscribe(&response.installation_id).await.unwrap();
        gate.add_permits(1);
        let mut last = None;
        while let Some(update) = subscription.recv().await {
            last = Some(update);
        }
        let last = last.unwrap();
        assert_eq!(last.status, InstallationStatus::Failed);
        assert_eq!(last.progress, 100);
        assert!(last.error.unwrap().contains("scripted failure"));

        orchestrator.wait_idle().await;
        let record = orchestrator.get_status("srv-1", "x@1.1").await.unwrap();
        assert_eq!(record.id, response.installation_id);
        assert_eq!(record.status, InstallationStatus::Failed);
        assert!(record.error_message.is_some());
    }

    #[tokio::test]
    async fn test_configure_validates_and_persists() {
        let mut motd = package("motd", "1.0");
        motd.config_schema = Some(json!({
            "type": "object",
            "properties": { "message": { "type": "string" } },
            "additionalProperties": false
        }));
        let (fixture, executor) = setup(vec![motd]).await;
        let orchestrator = fixture.orchestrator(
            executor,
            PluginPolicyConfig {
                max_config_keys: 2,
                ..PluginPolicyConfig::default()
            },
        );

        let mut bad = Map::new();
        bad.insert("message".to_string(), json!(42));
        let err = orchestrator
            .install(InstallRequest {
                config: bad,
                ..request("motd@1.0")
            })
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "invalid_config");

        orchestrator.install(request("motd@1.0")).await.unwrap();
        orchestrator.wait_idle().await;

        let mut good = Map::new();
        good.insert("message".to_string(), json!("welcome"));
        let response = orchestrator
            .configure("srv-1", "motd@1.0", good.clone())
            .await
            .unwrap();
        assert!(response.applied);
        assert_eq!(orchestrator.get_config("srv-1", "motd@1.0").await.unwrap(), good);

        let mut too_many = Map::new();
        for key in ["a", "b", "c"] {
            too_many.insert(key.to_string(), json!(1));
        }
        let err = orchestrator
            .configure("srv-1", "motd@1.0", too_many)
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "invalid_config");

        // lifecycle unchanged by configuration
        assert_eq!(
            orchestrator.get_status("srv-1", "motd@1.0").await.unwrap().status,
            InstallationStatus::Installed
        );
    }

    struct RejectingBackend;

    #[async_trait::async_trait]
    impl ComputeBackend for RejectingBackend {
        async fn apply_config(&self, _: &str, _: &str, _: &Map<String, Value>) -> Result<()> {
            Err(HostError::ExecutionError("server offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_configure_keeps_overrides_when_apply_fails() {
        let (fixture, executor) = setup(vec![package("motd", "1.0")]).await;
        let policy = PluginPolicyConfig::default();
        let orchestrator = InstallationOrchestrator::new(
            Ports {
                backend: Arc::new(RejectingBackend),
                ..fixture.ports()
            },
            Arc::new(fixture.validator(false)),
            executor,
            Arc::new(UpdateRegistry::new(8)),
            VersionComparator::default(),
            policy,
            OrchestratorConfig::default(),
        );
        orchestrator.install(request("motd@1.0")).await.unwrap();
        orchestrator.wait_idle().await;

        let mut config = Map::new();
        config.insert("message".to_string(), json!("hi"));
        let response = orchestrator
            .configure("srv-1", "motd@1.0", config.clone())
            .await
            .unwrap();
        assert!(!response.applied);
        assert!(response.apply_error.unwrap().contains("server offline"));
        assert_eq!(orchestrator.get_config("srv-1", "motd@1.0").await.unwrap(), config);
    }

    #[tokio::test]
    async fn test_bulk_install_isolates_failures() {
        let (fixture, executor) = setup(vec![package("a", "1.0"), package("b", "1.0")]).await;
        let orchestrator = fixture.orchestrator(
            executor,
            PluginPolicyConfig {
                max_bulk_items: 3,
                ..PluginPolicyConfig::default()
            },
        );

        let items: Vec<BulkInstallItem> = ["a@1.0", "ghost@1.0", "b@1.0"]
            .iter()
            .map(|id| BulkInstallItem {
                plugin_id: id.to_string(),
                ..BulkInstallItem::default()
            })
            .collect();

        let result = orchestrator.bulk_install("srv-1", items.clone()).await.unwrap();
        assert_eq!(result.successful.len(), 2);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].plugin_id, "ghost@1.0");
        assert_eq!(result.failed[0].reason, "plugin_not_found");
        assert_eq!(result.total_estimated_secs, 60);

        let err = orchestrator.bulk_install("srv-1", Vec::new()).await.unwrap_err();
        assert_eq!(err.reason_code(), "invalid_request");
        let mut oversized = items.clone();
        oversized.extend(items);
        let err = orchestrator.bulk_install("srv-1", oversized).await.unwrap_err();
        assert_eq!(err.reason_code(), "invalid_request");

        orchestrator.wait_idle().await;
        let result = orchestrator
            .bulk_uninstall(
                "srv-1",
                vec!["a@1.0".to_string(), "ghost@1.0".to_string()],
                UninstallOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.successful.len(), 1);
        assert_eq!(result.failed[0].reason, "not_installed");
        orchestrator.wait_idle().await;
    }

    #[tokio::test]
    async fn test_request_validation() {
        let (fixture, executor) = setup(vec![package("a", "1.0")]).await;
        let orchestrator = fixture.orchestrator(executor, PluginPolicyConfig::default());

        for (server, plugin) in [("", "a@1.0"), ("srv-1", ""), ("srv 1", "a@1.0"), ("srv-1", "-a")] {
            let err = orchestrator
                .install(InstallRequest {
                    server_id: server.to_string(),
                    ..request(plugin)
                })
                .await
                .unwrap_err();
            assert_eq!(err.reason_code(), "invalid_request", "{:?}", (server, plugin));
        }

        assert!(validate_identifier("id", &"x".repeat(129)).is_err());
        assert!(validate_identifier("id", "essentials:core@2.1_b").is_ok());

        let err = orchestrator
            .install(InstallRequest {
                server_id: "srv-404".to_string(),
                ..request("a@1.0")
            })
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "server_not_found");

        let err = orchestrator.subscribe("no-such-installation").await.unwrap_err();
        assert_eq!(err.reason_code(), "installation_not_found");
    }
}
