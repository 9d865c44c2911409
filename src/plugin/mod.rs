//! Plugin system module
//!
//! This module provides plugin installation management including:
//! - Compatibility validation against a game server
//! - Dependency graph construction and install ordering
//! - Pairwise conflict detection with advisory remediation
//! - Asynchronous installation orchestration with progress streams
//! - Catalog search and installation listings

pub mod backend;
pub mod conflict;
pub mod executor;
pub mod graph;
pub mod host;
pub mod orchestrator;
pub mod planner;
pub mod query;
pub mod types;
pub mod updates;
pub mod validator;
pub mod version;

pub use backend::{AuditAction, AuditEvent, AuditSink, ComputeBackend};
pub use conflict::{ConflictDetector, ConflictRule};
pub use executor::{InstallExecutor, InstallJob, JobKind, SimulatedExecutor};
pub use graph::DependencyGraphBuilder;
pub use host::PluginHost;
pub use orchestrator::{
    BulkInstallItem, BulkOperationResult, InstallRequest, InstallResponse,
    InstallationOrchestrator, Ports, UninstallOptions,
};
pub use planner::InstallOrderPlanner;
pub use query::{ListFilter, QueryService, SearchPage, SearchQuery, SortKey, SortOrder};
pub use types::{
    DependencyGraph, GameServer, InstallUpdate, InstallationStatus, PluginCategory, PluginId,
    PluginPackage, ServerPluginInstallation,
};
pub use updates::{ProgressReporter, Subscription, UpdateRegistry};
pub use validator::{CompatibilityReport, CompatibilityValidator};
pub use version::{VersionComparator, VersionScheme};
