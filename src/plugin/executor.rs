//! Installation execution
//!
//! The executor performs the actual work against a server. The orchestrator
//! owns the lifecycle around it: the executor only reports intermediate
//! progress and returns success or an error.

use std::time::Duration;

use async_trait::async_trait;

use crate::core::error::Result;
use crate::plugin::types::{InstallationId, PluginPackage, ServerId};
use crate::plugin::updates::ProgressReporter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    Install,
    Update { from_version: String },
    Uninstall,
}

/// One unit of work handed to an executor
#[derive(Debug, Clone)]
pub struct InstallJob {
    pub installation_id: InstallationId,
    pub server_id: ServerId,
    pub plugin: PluginPackage,
    pub kind: JobKind,
}

#[async_trait]
pub trait InstallExecutor: Send + Sync {
    /// Install or update `job.plugin` on the server
    async fn install(&self, job: &InstallJob, reporter: &ProgressReporter) -> Result<()>;

    /// Remove `job.plugin` from the server
    async fn uninstall(&self, job: &InstallJob, reporter: &ProgressReporter) -> Result<()>;
}

/// Executor that only waits between milestones
pub struct SimulatedExecutor {
    step_delay: Duration,
}

impl SimulatedExecutor {
    pub fn new(step_delay: Duration) -> Self {
        Self { step_delay }
    }

    async fn step(&self) {
        if !self.step_delay.is_zero() {
            tokio::time::sleep(self.step_delay).await;
        }
    }
}

#[async_trait]
impl InstallExecutor for SimulatedExecutor {
    async fn install(&self, job: &InstallJob, reporter: &ProgressReporter) -> Result<()> {
        tracing::debug!(
            installation_id = %job.installation_id,
            plugin_id = %job.plugin.id,
            kind = ?job.kind,
            "Simulating plugin installation"
        );

        self.step().await;
        reporter.progress(50, format!("Downloading {} {}", job.plugin.name, job.plugin.version));
        self.step().await;
        reporter.progress(80, format!("Installing {}", job.plugin.name));
        self.step().await;
        Ok(())
    }

    async fn uninstall(&self, job: &InstallJob, reporter: &ProgressReporter) -> Result<()> {
        tracing::debug!(
            installation_id = %job.installation_id,
            plugin_id = %job.plugin.id,
            "Simulating plugin removal"
        );

        self.step().await;
        reporter.progress(50, format!("Removing {}", job.plugin.name));
        self.step().await;
        Ok(())
    }
}
