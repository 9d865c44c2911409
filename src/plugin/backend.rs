//! Outbound ports: the compute platform and the audit log
//!
//! Both live outside this crate. The provided implementations only log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::core::error::Result;

/// Applies configuration to a running server
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    async fn apply_config(
        &self,
        server_id: &str,
        plugin_id: &str,
        config: &Map<String, Value>,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    InstallRequested,
    UninstallRequested,
    UpdateRequested,
    Configured,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub server_id: String,
    pub plugin_id: String,
    pub installation_id: Option<String>,
    pub details: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, server_id: &str, plugin_id: &str) -> Self {
        Self {
            action,
            server_id: server_id.to_string(),
            plugin_id: plugin_id.to_string(),
            installation_id: None,
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_installation(mut self, installation_id: &str) -> Self {
        self.installation_id = Some(installation_id.to_string());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Fire-and-forget audit recording
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

#[derive(Debug, Clone, Default)]
pub struct NoopComputeBackend;

#[async_trait]
impl ComputeBackend for NoopComputeBackend {
    async fn apply_config(
        &self,
        server_id: &str,
        plugin_id: &str,
        config: &Map<String, Value>,
    ) -> Result<()> {
        tracing::debug!(
            server_id = %server_id,
            plugin_id = %plugin_id,
            keys = config.len(),
            "Configuration applied (no compute backend attached)"
        );
        Ok(())
    }
}

/// Writes audit events to the `audit` tracing target
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let details = event
            .details
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_default();
        tracing::info!(
            target: "audit",
            action = ?event.action,
            server_id = %event.server_id,
            plugin_id = %event.plugin_id,
            installation_id = event.installation_id.as_deref().unwrap_or(""),
            details = %details,
            timestamp = %event.timestamp.to_rfc3339(),
            "audit"
        );
    }
}
