//! Shared fixtures for unit tests

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Map;
use tokio::sync::Semaphore;

use crate::core::config::{
    Config, DatabaseConfig, LoggingConfig, OrchestratorConfig, PluginPolicyConfig,
};
use crate::core::error::{HostError, Result};
use crate::db::manager::DatabaseManager;
use crate::db::repository::{
    InstallationRepository, SqliteInstallationRepository, SqlitePluginCatalog,
    SqliteServerRepository,
};
use crate::plugin::backend::{NoopComputeBackend, TracingAuditSink};
use crate::plugin::conflict::ConflictDetector;
use crate::plugin::executor::{InstallExecutor, InstallJob};
use crate::plugin::host::PluginHost;
use crate::plugin::orchestrator::{InstallationOrchestrator, Ports};
use crate::plugin::query::QueryService;
use crate::plugin::types::{
    GameServer, InstallationStatus, PluginCategory, PluginPackage, ServerPluginInstallation,
};
use crate::plugin::updates::{ProgressReporter, UpdateRegistry};
use crate::plugin::validator::CompatibilityValidator;
use crate::plugin::version::VersionComparator;

/// Approved utility package `name@version` supporting game version 1.20.1
pub fn package(name: &str, version: &str) -> PluginPackage {
    PluginPackage::new(
        format!("{}@{}", name, version),
        name,
        version,
        PluginCategory::Utility,
    )
    .with_game_version("1.20.1")
}

pub fn test_config() -> Config {
    Config {
        database: DatabaseConfig {
            path: PathBuf::from(":memory:"),
            connection_pool_size: 1,
            busy_timeout: 1000,
        },
        plugins: PluginPolicyConfig::default(),
        orchestrator: OrchestratorConfig {
            step_delay_ms: 0,
            ..OrchestratorConfig::default()
        },
        logging: LoggingConfig {
            level: "debug".to_string(),
            format: "text".to_string(),
            output: "stdout".to_string(),
            log_file: None,
        },
    }
}

/// In-memory database with the SQLite repositories on top
pub struct Fixture {
    pub db: Arc<DatabaseManager>,
    pub catalog: Arc<SqlitePluginCatalog>,
    pub installations: Arc<SqliteInstallationRepository>,
    pub servers: Arc<SqliteServerRepository>,
}

impl Fixture {
    pub async fn new() -> Self {
        let db = Arc::new(DatabaseManager::new_in_memory().unwrap());
        Self {
            catalog: Arc::new(SqlitePluginCatalog::new(db.clone())),
            installations: Arc::new(SqliteInstallationRepository::new(db.clone())),
            servers: Arc::new(SqliteServerRepository::new(db.clone())),
            db,
        }
    }

    pub async fn add_server(&self, id: &str, game_version: &str) -> GameServer {
        let server = GameServer {
            id: id.to_string(),
            name: format!("Server {}", id),
            game_version: game_version.to_string(),
        };
        self.servers.upsert(&server).await.unwrap();
        server
    }

    pub async fn add_packages(&self, packages: &[PluginPackage]) {
        for package in packages {
            self.catalog.upsert(package).await.unwrap();
        }
    }

    /// Insert an installation record directly, bypassing the orchestrator
    pub async fn add_installation(
        &self,
        server_id: &str,
        plugin_id: &str,
        status: InstallationStatus,
    ) -> ServerPluginInstallation {
        let mut record = ServerPluginInstallation::new(server_id, plugin_id, Map::new());
        record.status = status;
        if status == InstallationStatus::Installed {
            record.installed_at = Some(record.created_at);
        }
        self.installations.create(&record).await.unwrap();
        record
    }

    pub fn ports(&self) -> Ports {
        Ports {
            catalog: self.catalog.clone(),
            installations: self.installations.clone(),
            servers: self.servers.clone(),
            backend: Arc::new(NoopComputeBackend),
            audit: Arc::new(TracingAuditSink),
        }
    }

    pub fn validator(&self, allow_unapproved: bool) -> CompatibilityValidator {
        let versions = VersionComparator::default();
        CompatibilityValidator::new(
            self.catalog.clone(),
            self.installations.clone(),
            self.servers.clone(),
            Arc::new(ConflictDetector::new(versions)),
            versions,
            allow_unapproved,
        )
    }

    pub fn query_service(&self, allow_unapproved: bool) -> QueryService {
        QueryService::new(
            self.catalog.clone(),
            self.installations.clone(),
            self.servers.clone(),
            VersionComparator::default(),
            allow_unapproved,
        )
    }

    pub fn orchestrator(
        &self,
        executor: Arc<dyn InstallExecutor>,
        policy: PluginPolicyConfig,
    ) -> InstallationOrchestrator {
        let config = test_config();
        InstallationOrchestrator::new(
            self.ports(),
            Arc::new(self.validator(policy.allow_unapproved)),
            executor,
            Arc::new(UpdateRegistry::new(config.orchestrator.update_buffer)),
            VersionComparator::default(),
            policy,
            config.orchestrator,
        )
    }

    pub fn host(&self, executor: Arc<dyn InstallExecutor>) -> PluginHost {
        PluginHost::new(&test_config(), self.ports(), executor).unwrap()
    }
}

/// Executor with scripted outcomes
///
/// Records every call, fails for configured plugin ids and, when gated, waits
/// for one semaphore permit per call.
pub struct ScriptedExecutor {
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            failing: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// Executor blocked until permits are added to the returned semaphore
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let executor = Self {
            gate: Some(gate.clone()),
            ..Self::new()
        };
        (executor, gate)
    }

    pub fn fail_on(self, plugin_id: &str) -> Self {
        self.failing.lock().unwrap().insert(plugin_id.to_string());
        self
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn enter(&self, call: String) {
        self.calls.lock().unwrap().push(call);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
    }

    fn outcome(&self, job: &InstallJob) -> Result<()> {
        if self.failing.lock().unwrap().contains(&job.plugin.id) {
            return Err(HostError::ExecutionError(format!(
                "scripted failure for {}",
                job.plugin.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl InstallExecutor for ScriptedExecutor {
    async fn install(&self, job: &InstallJob, reporter: &ProgressReporter) -> Result<()> {
        self.enter(format!("install:{}", job.plugin.id)).await;
        reporter.progress(50, "Downloading");
        reporter.progress(80, "Installing");
        self.outcome(job)
    }

    async fn uninstall(&self, job: &InstallJob, reporter: &ProgressReporter) -> Result<()> {
        self.enter(format!("uninstall:{}", job.plugin.id)).await;
        reporter.progress(50, "Removing");
        self.outcome(job)
    }
}
