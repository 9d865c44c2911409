//! Compatibility validation
//!
//! Checks a plugin against a server before anything is installed: game
//! version support, approval policy, direct dependencies and conflicts with
//! what is already on the server.

use std::sync::Arc;

use serde::Serialize;

use crate::core::error::{HostError, Result};
use crate::db::repository::{InstallationRepository, PluginCatalog, ServerRepository};
use crate::plugin::conflict::ConflictDetector;
use crate::plugin::types::{
    ConflictAnalysis, ConflictType, GameServer, InstallationStatus, PluginId, PluginPackage,
};
use crate::plugin::version::VersionComparator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    GameVersionMismatch,
    PluginNotApproved,
    DependencyMissing,
    DependencyVersionMismatch,
    ResourceConflict,
}

impl IssueKind {
    pub fn reason_code(&self) -> &'static str {
        match self {
            IssueKind::GameVersionMismatch => "game_version_mismatch",
            IssueKind::PluginNotApproved => "plugin_not_approved",
            IssueKind::DependencyMissing => "dependency_missing",
            IssueKind::DependencyVersionMismatch => "dependency_version_mismatch",
            IssueKind::ResourceConflict => "resource_conflict",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompatibilityIssue {
    pub kind: IssueKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompatibilityReport {
    pub compatible: bool,
    /// Issues were found but overridden
    pub forced: bool,
    pub issues: Vec<CompatibilityIssue>,
    pub warnings: Vec<String>,
    pub conflicts: ConflictAnalysis,
}

impl CompatibilityReport {
    pub fn has_issue(&self, kind: IssueKind) -> bool {
        self.issues.iter().any(|i| i.kind == kind)
    }

    /// Typed error for an incompatible report, keyed by the first issue
    pub fn to_error(&self) -> HostError {
        let reason = self
            .issues
            .first()
            .map_or("resource_conflict", |i| i.kind.reason_code());
        let message = self
            .issues
            .iter()
            .map(|i| i.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        HostError::Incompatible {
            reason: reason.to_string(),
            message,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationOptions {
    /// Report issues but accept the plugin anyway
    pub force: bool,
    /// Missing dependencies will be auto-installed
    pub resolve_dependencies: bool,
    /// Installed plugin being replaced (updates); left out of the installed set
    pub replacing: Option<PluginId>,
}

pub struct CompatibilityValidator {
    catalog: Arc<dyn PluginCatalog>,
    installations: Arc<dyn InstallationRepository>,
    servers: Arc<dyn ServerRepository>,
    detector: Arc<ConflictDetector>,
    versions: VersionComparator,
    allow_unapproved: bool,
}

impl CompatibilityValidator {
    pub fn new(
        catalog: Arc<dyn PluginCatalog>,
        installations: Arc<dyn InstallationRepository>,
        servers: Arc<dyn ServerRepository>,
        detector: Arc<ConflictDetector>,
        versions: VersionComparator,
        allow_unapproved: bool,
    ) -> Self {
        Self {
            catalog,
            installations,
            servers,
            detector,
            versions,
            allow_unapproved,
        }
    }

    /// Validate a catalog plugin against a server by id
    pub async fn validate(
        &self,
        plugin_id: &str,
        server_id: &str,
        options: &ValidationOptions,
    ) -> Result<CompatibilityReport> {
        let plugin = self
            .catalog
            .get_by_id(plugin_id)
            .await?
            .ok_or_else(|| HostError::PluginNotFound(plugin_id.to_string()))?;
        let server = self
            .servers
            .get_by_id(server_id)
            .await?
            .ok_or_else(|| HostError::ServerNotFound(server_id.to_string()))?;

        self.validate_package(&plugin, &server, options).await
    }

    /// Validate an already-loaded package against an already-loaded server
    pub async fn validate_package(
        &self,
        plugin: &PluginPackage,
        server: &GameServer,
        options: &ValidationOptions,
    ) -> Result<CompatibilityReport> {
        let mut report = CompatibilityReport::default();

        let mut exclude: Vec<&str> = vec![plugin.id.as_str()];
        if let Some(replacing) = &options.replacing {
            exclude.push(replacing.as_str());
        }
        let installed = self.installed_packages(&server.id, &exclude).await?;

        if !plugin.supports_game_version(&server.game_version) {
            report.issues.push(CompatibilityIssue {
                kind: IssueKind::GameVersionMismatch,
                message: format!(
                    "{} {} does not support game version {} (supports: {})",
                    plugin.name,
                    plugin.version,
                    server.game_version,
                    plugin
                        .game_versions
                        .iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            });
        }

        if !plugin.is_approved && !self.allow_unapproved {
            report.issues.push(CompatibilityIssue {
                kind: IssueKind::PluginNotApproved,
                message: format!("{} {} is not approved", plugin.name, plugin.version),
            });
        }

        for (name, constraint) in &plugin.dependencies {
            match installed.iter().find(|p| &p.name == name) {
                Some(present) if self.versions.satisfies(&present.version, constraint) => {}
                Some(present) => report.issues.push(CompatibilityIssue {
                    kind: IssueKind::DependencyVersionMismatch,
                    message: format!(
                        "{} requires {} {} but {} is installed",
                        plugin.name, name, constraint, present.version
                    ),
                }),
                None => {
                    if options.resolve_dependencies
                        && self.catalog_can_supply(name, constraint).await?
                    {
                        report.warnings.push(format!(
                            "Dependency {} {} will be installed automatically",
                            name, constraint
                        ));
                    } else {
                        report.issues.push(CompatibilityIssue {
                            kind: IssueKind::DependencyMissing,
                            message: format!("{} requires {} {}", plugin.name, name, constraint),
                        });
                    }
                }
            }
        }

        for (name, constraint) in &plugin.optional_dependencies {
            if let Some(present) = installed.iter().find(|p| &p.name == name) {
                if !self.versions.satisfies(&present.version, constraint) {
                    report.warnings.push(format!(
                        "Optional dependency {} {} does not match installed {}",
                        name, constraint, present.version
                    ));
                }
            }
        }

        let conflicts = self.detector.detect(&installed, std::slice::from_ref(plugin));
        for conflict in &conflicts.conflicts {
            let kind = match conflict.conflict_type {
                // the plugin's own requirements were checked above
                ConflictType::Dependency if conflict.plugin_a == plugin.id => continue,
                ConflictType::Dependency => IssueKind::DependencyVersionMismatch,
                ConflictType::DuplicateVersion | ConflictType::Resource => {
                    IssueKind::ResourceConflict
                }
            };
            report.issues.push(CompatibilityIssue {
                kind,
                message: conflict.description.clone(),
            });
        }
        report.conflicts = conflicts;

        report.forced = options.force && !report.issues.is_empty();
        report.compatible = report.issues.is_empty() || options.force;

        tracing::debug!(
            plugin_id = %plugin.id,
            server_id = %server.id,
            compatible = report.compatible,
            issues = report.issues.len(),
            warnings = report.warnings.len(),
            "Compatibility checked"
        );

        Ok(report)
    }

    /// Packages behind the server's active installations
    ///
    /// Installations being removed are left out: nothing may come to rely on
    /// them.
    pub async fn installed_packages(
        &self,
        server_id: &str,
        exclude: &[&str],
    ) -> Result<Vec<PluginPackage>> {
        let mut packages = Vec::new();
        for record in self.installations.find_by_server(server_id, None).await? {
            if !record.status.is_active()
                || record.status == InstallationStatus::Removing
                || exclude.contains(&record.plugin_id.as_str())
            {
                continue;
            }
            match self.catalog.get_by_id(&record.plugin_id).await? {
                Some(package) => packages.push(package),
                None => tracing::warn!(
                    server_id = %server_id,
                    plugin_id = %record.plugin_id,
                    "Installed plugin missing from catalog"
                ),
            }
        }
        Ok(packages)
    }

    async fn catalog_can_supply(&self, name: &str, constraint: &str) -> Result<bool> {
        Ok(self
            .catalog
            .find_by_name(name)
            .await?
            .iter()
            .any(|p| self.versions.satisfies(&p.version, constraint)))
    }
}
