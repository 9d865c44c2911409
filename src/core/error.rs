//! Error type system for plughost
//!
//! This module provides the error taxonomy shared by every component:
//! - Validation, not-found, conflict, incompatibility and graph failures
//! - Stable machine-readable reason codes for client-side branching
//! - Error responses with trace IDs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Main error type for the plugin hosting subsystem
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    // Validation errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid plugin configuration: {0}")]
    InvalidConfig(String),

    // Not-found errors
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Installation not found: {0}")]
    InstallationNotFound(String),

    // Conflict errors
    #[error("Plugin {plugin_id} is already installed on server {server_id}")]
    AlreadyInstalled { server_id: String, plugin_id: String },

    #[error("Plugin {plugin_id} has an operation in progress on server {server_id} ({status})")]
    InstallInProgress {
        server_id: String,
        plugin_id: String,
        status: String,
    },

    #[error("Plugin {plugin_id} is not installed on server {server_id}")]
    NotInstalled { server_id: String, plugin_id: String },

    #[error("Cannot remove plugin {plugin_id}: required by {}", dependents.join(", "))]
    DependencyBlocked {
        plugin_id: String,
        dependents: Vec<String>,
    },

    // Incompatibility errors
    #[error("Plugin is incompatible: {message}")]
    Incompatible { reason: String, message: String },

    // Graph errors
    #[error("Circular dependency detected among: {}", .0.join(", "))]
    CircularDependency(Vec<String>),

    #[error("Dependency installation failed: {0}")]
    DependencyInstallFailed(String),

    // Execution errors (only ever recorded on installations)
    #[error("Execution failed: {0}")]
    ExecutionError(String),

    // Infrastructure errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Task error: {0}")]
    TaskError(String),

    #[error("Installation {installation_id} cannot move from {from} to {to}")]
    InvalidTransition {
        installation_id: String,
        from: String,
        to: String,
    },
}

impl HostError {
    /// Get the error type name for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            HostError::InvalidRequest(_) | HostError::InvalidConfig(_) => "Validation",
            HostError::PluginNotFound(_)
            | HostError::ServerNotFound(_)
            | HostError::InstallationNotFound(_) => "NotFound",
            HostError::AlreadyInstalled { .. }
            | HostError::InstallInProgress { .. }
            | HostError::NotInstalled { .. }
            | HostError::DependencyBlocked { .. } => "Conflict",
            HostError::Incompatible { .. } => "Incompatibility",
            HostError::CircularDependency(_) | HostError::DependencyInstallFailed(_) => "Graph",
            HostError::ExecutionError(_) => "Execution",
            HostError::ConfigError(_)
            | HostError::DatabaseError(_)
            | HostError::StorageError(_)
            | HostError::IoError(_)
            | HostError::SerializationError(_)
            | HostError::InvalidTransition { .. }
            | HostError::TaskError(_) => "Internal",
        }
    }

    /// Stable machine-readable reason code
    ///
    /// Clients branch on these strings; they must never change once published.
    pub fn reason_code(&self) -> &str {
        match self {
            HostError::InvalidRequest(_) => "invalid_request",
            HostError::InvalidConfig(_) => "invalid_config",
            HostError::PluginNotFound(_) => "plugin_not_found",
            HostError::ServerNotFound(_) => "server_not_found",
            HostError::InstallationNotFound(_) => "installation_not_found",
            HostError::AlreadyInstalled { .. } => "already_installed",
            HostError::InstallInProgress { .. } => "install_in_progress",
            HostError::NotInstalled { .. } => "not_installed",
            HostError::DependencyBlocked { .. } => "dependency_blocked",
            HostError::Incompatible { reason, .. } => reason.as_str(),
            HostError::CircularDependency(_) => "circular_dependency",
            HostError::DependencyInstallFailed(_) => "dependency_install_failed",
            HostError::ExecutionError(_) => "execution_failed",
            HostError::ConfigError(_) => "configuration_error",
            HostError::DatabaseError(_) | HostError::StorageError(_) => "storage_error",
            HostError::IoError(_)
            | HostError::SerializationError(_)
            | HostError::InvalidTransition { .. }
            | HostError::TaskError(_) => "internal_error",
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HostError::DatabaseError(_)
                | HostError::StorageError(_)
                | HostError::InstallInProgress { .. }
        )
    }
}

/// Error response structure for API consumers
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable reason code
    pub error: String,
    /// Error category (`Validation`, `NotFound`, `Conflict`, ...)
    pub kind: String,
    /// Human-readable error message
    pub message: String,
    /// The same request may succeed later
    pub retryable: bool,
    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Unique trace ID for this error
    pub trace_id: String,
}

impl ErrorResponse {
    /// Create an error response from a HostError
    ///
    /// Dependency-blocked and circular-dependency failures carry the offending
    /// plugin ids as details.
    pub fn from_error(error: &HostError) -> Self {
        let details = match error {
            HostError::DependencyBlocked { dependents, .. } => {
                Some(serde_json::json!({ "dependents": dependents }))
            }
            HostError::CircularDependency(nodes) => Some(serde_json::json!({ "cycle": nodes })),
            _ => None,
        };

        Self {
            error: error.reason_code().to_string(),
            kind: error.error_type().to_string(),
            message: error.to_string(),
            retryable: error.is_retryable(),
            details,
            trace_id: Uuid::new_v4().to_string(),
        }
    }
}

/// Result type alias for operations that can fail with HostError
pub type Result<T> = std::result::Result<T, HostError>;
