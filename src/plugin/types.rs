//! Plugin type definitions
//!
//! This module defines the catalog entries, installation records and the
//! request-scoped values (graphs, conflict analyses, progress updates) passed
//! between the plugin subsystem's components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use crate::core::error::HostError;

/// Catalog identifier of a published plugin version
pub type PluginId = String;

/// Identifier of a game server instance
pub type ServerId = String;

/// Identifier of an installation record
pub type InstallationId = String;

/// Plugin category
///
/// A closed set; behaviour that depends on the category is a match over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginCategory {
    Gameplay,
    Admin,
    Economy,
    Chat,
    World,
    Performance,
    Utility,
}

impl PluginCategory {
    pub const ALL: [PluginCategory; 7] = [
        PluginCategory::Gameplay,
        PluginCategory::Admin,
        PluginCategory::Economy,
        PluginCategory::Chat,
        PluginCategory::World,
        PluginCategory::Performance,
        PluginCategory::Utility,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginCategory::Gameplay => "gameplay",
            PluginCategory::Admin => "admin",
            PluginCategory::Economy => "economy",
            PluginCategory::Chat => "chat",
            PluginCategory::World => "world",
            PluginCategory::Performance => "performance",
            PluginCategory::Utility => "utility",
        }
    }

    /// Whether installing or updating a plugin of this category needs a server restart
    pub fn requires_restart(&self) -> bool {
        match self {
            PluginCategory::Performance | PluginCategory::World => true,
            PluginCategory::Gameplay
            | PluginCategory::Admin
            | PluginCategory::Economy
            | PluginCategory::Chat
            | PluginCategory::Utility => false,
        }
    }
}

impl std::fmt::Display for PluginCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginCategory {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PluginCategory::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| HostError::InvalidRequest(format!("Unknown plugin category: {}", s)))
    }
}

/// A published plugin version in the catalog
///
/// Immutable once published; a new version is a new package sharing the name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginPackage {
    pub id: PluginId,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    pub category: PluginCategory,
    /// Game versions this build supports
    #[serde(default)]
    pub game_versions: BTreeSet<String>,
    /// Dependency name -> version constraint
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    /// Soft dependencies, never auto-installed
    #[serde(default)]
    pub optional_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub is_approved: bool,
    #[serde(default)]
    pub downloads: u64,
    #[serde(default)]
    pub rating: f64,
    /// Chat/console commands the plugin registers
    #[serde(default)]
    pub commands: BTreeSet<String>,
    /// Network ports the plugin binds
    #[serde(default)]
    pub ports: BTreeSet<u16>,
    /// JSON Schema for configuration overrides
    #[serde(default)]
    pub config_schema: Option<Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl PluginPackage {
    /// Create a package with the required fields and empty metadata
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        category: PluginCategory,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            description: None,
            author: None,
            category,
            game_versions: BTreeSet::new(),
            dependencies: BTreeMap::new(),
            optional_dependencies: BTreeMap::new(),
            is_approved: true,
            downloads: 0,
            rating: 0.0,
            commands: BTreeSet::new(),
            ports: BTreeSet::new(),
            config_schema: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_game_version(mut self, game_version: impl Into<String>) -> Self {
        self.game_versions.insert(game_version.into());
        self
    }

    pub fn with_dependency(mut self, name: impl Into<String>, constraint: impl Into<String>) -> Self {
        self.dependencies.insert(name.into(), constraint.into());
        self
    }

    pub fn with_optional_dependency(
        mut self,
        name: impl Into<String>,
        constraint: impl Into<String>,
    ) -> Self {
        self.optional_dependencies.insert(name.into(), constraint.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.commands.insert(command.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.ports.insert(port);
        self
    }

    pub fn supports_game_version(&self, game_version: &str) -> bool {
        self.game_versions.contains(game_version)
    }

    /// Whether this package declares a required dependency on `name`
    pub fn depends_on(&self, name: &str) -> bool {
        self.dependencies.contains_key(name)
    }
}

/// A game server instance, as exposed by the server repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameServer {
    pub id: ServerId,
    pub name: String,
    pub game_version: String,
}

/// Lifecycle status of an installation
///
/// `pending -> installing -> installed`, `installing -> failed`,
/// `installed -> removing -> (deleted)`, `removing -> failed`,
/// `installed -> installing` during an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallationStatus {
    Pending,
    Installing,
    Installed,
    Removing,
    Failed,
}

impl InstallationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallationStatus::Pending => "pending",
            InstallationStatus::Installing => "installing",
            InstallationStatus::Installed => "installed",
            InstallationStatus::Removing => "removing",
            InstallationStatus::Failed => "failed",
        }
    }

    /// Active installations occupy their (server, plugin) slot
    pub fn is_active(&self) -> bool {
        !matches!(self, InstallationStatus::Failed)
    }

    /// An operation is running against the installation
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            InstallationStatus::Pending | InstallationStatus::Installing | InstallationStatus::Removing
        )
    }

    pub fn can_transition_to(&self, next: InstallationStatus) -> bool {
        use InstallationStatus::*;
        matches!(
            (self, next),
            (Pending, Installing)
                | (Pending, Failed)
                | (Installing, Installed)
                | (Installing, Failed)
                | (Installed, Installing)
                | (Installed, Removing)
                | (Removing, Failed)
        )
    }
}

impl std::fmt::Display for InstallationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstallationStatus {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(InstallationStatus::Pending),
            "installing" => Ok(InstallationStatus::Installing),
            "installed" => Ok(InstallationStatus::Installed),
            "removing" => Ok(InstallationStatus::Removing),
            "failed" => Ok(InstallationStatus::Failed),
            other => Err(HostError::InvalidRequest(format!(
                "Unknown installation status: {}",
                other
            ))),
        }
    }
}

/// Join record between a server and a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerPluginInstallation {
    pub id: InstallationId,
    pub server_id: ServerId,
    pub plugin_id: PluginId,
    pub status: InstallationStatus,
    /// Opaque configuration overrides
    pub config: Map<String, Value>,
    pub enabled: bool,
    pub installed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServerPluginInstallation {
    pub fn new(server_id: impl Into<String>, plugin_id: impl Into<String>, config: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            server_id: server_id.into(),
            plugin_id: plugin_id.into(),
            status: InstallationStatus::Pending,
            config,
            enabled: true,
            installed_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, refusing moves the lifecycle does not allow
    pub fn transition(&mut self, next: InstallationStatus) -> Result<(), HostError> {
        if !self.status.can_transition_to(next) {
            return Err(HostError::InvalidTransition {
                installation_id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// A node of a dependency graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyNode {
    pub plugin_id: PluginId,
    pub name: String,
    pub version: String,
    /// Reachable from a requested plugin through required edges only
    pub required: bool,
}

/// A "requires" edge: `from` needs `to` installed first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: PluginId,
    pub to: PluginId,
    pub constraint: String,
    pub optional: bool,
}

/// A declared dependency that no catalog entry could satisfy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedDependency {
    pub from: PluginId,
    pub name: String,
    pub constraint: String,
}

/// Request-scoped dependency graph
///
/// Nodes keep discovery order so that planning is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub nodes: Vec<DependencyNode>,
    pub edges: Vec<DependencyEdge>,
    pub unresolved: Vec<UnresolvedDependency>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, plugin_id: &str) -> bool {
        self.nodes.iter().any(|n| n.plugin_id == plugin_id)
    }

    pub fn node(&self, plugin_id: &str) -> Option<&DependencyNode> {
        self.nodes.iter().find(|n| n.plugin_id == plugin_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_node(&mut self, node: DependencyNode) {
        if !self.contains(&node.plugin_id) {
            self.nodes.push(node);
        }
    }

    /// Add an edge unless an identical from/to pair already exists
    pub fn add_edge(&mut self, edge: DependencyEdge) {
        if !self.edges.iter().any(|e| e.from == edge.from && e.to == edge.to) {
            self.edges.push(edge);
        }
    }

    /// Plugins that require `plugin_id` directly
    pub fn dependents_of(&self, plugin_id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.to == plugin_id)
            .map(|e| e.from.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    DuplicateVersion,
    Resource,
    Dependency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// A conflict between two plugins slated for, or present on, one server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConflict {
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub plugin_a: PluginId,
    pub plugin_b: PluginId,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    RemoveOlderVersion,
    ReassignCommand,
    ChangePort,
    InstallCompatibleVersion,
}

/// Advisory remediation; never applied automatically
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    /// Index into `ConflictAnalysis::conflicts`
    pub conflict_index: usize,
    pub action: RemediationAction,
    pub target_plugin_id: PluginId,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictAnalysis {
    pub has_conflicts: bool,
    pub conflicts: Vec<PluginConflict>,
    pub recommendations: Vec<Recommendation>,
}

/// One progress event on an installation's update stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallUpdate {
    pub installation_id: InstallationId,
    pub status: InstallationStatus,
    /// 0..=100, strictly increasing per installation
    pub progress: u8,
    pub message: String,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl InstallUpdate {
    pub fn is_terminal(&self) -> bool {
        self.progress >= 100
    }
}
