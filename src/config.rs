use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::service::ExecutionSettings;
use crate::backend::{ExecutorKind, JobTypeRegistry, JobTypeSpec, LocalProcessConfig, PodConfig};
use crate::error::OpsflowError;
use crate::scheduler::SchedulerSettings;
use crate::valve::{CheckpointGate, Valve};
use crate::worker::stop::MIN_CHECK_INTERVAL;

/// Name of the config file looked up in the working directory.
pub const CONFIG_FILE: &str = "opsflow.toml";

/// Main configuration structure for opsflow
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct OpsflowConfig {
    pub scheduler: SchedulerSettings,
    pub store: StoreConfig,
    pub execution: ExecutionConfig,
    pub workflows: WorkflowConfig,
    pub migration: MigrationConfig,
    pub observability: ObservabilityConfig,
    /// Local process backend; always available.
    pub local: LocalProcessConfig,
    /// Pod backend; only registered when present.
    pub pod: Option<PodConfig>,
    pub job_types: Vec<JobTypeConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one JSON file per workflow and job record
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".opsflow/state"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub dispatch_timeout_ms: u64,
    /// How often workers check their stop signal
    pub stop_check_interval_ms: u64,
    /// Timeout for each kubectl invocation
    pub command_timeout_ms: u64,
    /// Seal job contexts with the key from `OPSFLOW_CONTEXT_SECRET` and
    /// `OPSFLOW_CONTEXT_SALT`
    pub encrypt_context: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout_ms: 60_000,
            stop_check_interval_ms: 5_000,
            command_timeout_ms: 30_000,
            encrypt_context: false,
        }
    }
}

impl ExecutionConfig {
    pub fn settings(&self) -> ExecutionSettings {
        ExecutionSettings {
            dispatch_timeout: Duration::from_millis(self.dispatch_timeout_ms),
            stop_check_interval: Duration::from_millis(self.stop_check_interval_ms).max(MIN_CHECK_INTERVAL),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Delay before a failed workflow step is retried
    pub retry_delay_ms: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self { retry_delay_ms: 30_000 }
    }
}

impl WorkflowConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Oldest acceptable replication checkpoint, relative to now
    pub allowed_skew_secs: u64,
    /// Bound on the wait before each cut over attempt
    pub catch_up: Valve,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            allowed_skew_secs: 5,
            catch_up: Valve::default(),
        }
    }
}

impl MigrationConfig {
    pub fn gate(&self) -> CheckpointGate {
        CheckpointGate::new(Duration::from_secs(self.allowed_skew_secs), self.catch_up)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter when `RUST_LOG` is unset
    pub log_level: String,
    /// JSON lines instead of human-readable output
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobTypeConfig {
    pub name: String,
    pub executor: ExecutorKind,
    pub timeout_secs: u64,
}

impl OpsflowConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. `path`, or `opsflow.toml` in the working directory
    /// 3. Environment variables (`OPSFLOW__SCHEDULER__SCAN_INTERVAL_MS=1000`)
    pub fn load(path: Option<&Path>) -> Result<Self, OpsflowError> {
        let mut builder = Config::builder();

        match path {
            Some(path) => builder = builder.add_source(File::from(path)),
            None if Path::new(CONFIG_FILE).exists() => {
                builder = builder.add_source(File::from(Path::new(CONFIG_FILE)));
            }
            None => {}
        }

        builder = builder.add_source(
            Environment::with_prefix("OPSFLOW")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|e| OpsflowError::configuration(format!("failed to load configuration: {e}")))
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), OpsflowError> {
        let toml_content = toml::to_string_pretty(self)
            .map_err(|e| OpsflowError::configuration(format!("failed to render configuration: {e}")))?;
        std::fs::write(path.as_ref(), toml_content).map_err(|e| {
            OpsflowError::configuration(format!("failed to write {}: {e}", path.as_ref().display()))
        })?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<(), OpsflowError> {
        if Path::new(".env").exists() {
            dotenvy::dotenv().map_err(|e| OpsflowError::configuration(format!("failed to read .env: {e}")))?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }

    /// Job types from config, plus the built-in `shell` and `sleep` types on
    /// the local backend unless configured otherwise.
    pub fn job_type_registry(&self) -> JobTypeRegistry {
        let mut registry = JobTypeRegistry::new();
        for builtin in ["shell", "sleep"] {
            registry = registry.register(JobTypeSpec::new(builtin, ExecutorKind::LocalProcess, Duration::from_secs(3600)));
        }
        for job_type in &self.job_types {
            registry = registry.register(JobTypeSpec::new(
                job_type.name.clone(),
                job_type.executor,
                Duration::from_secs(job_type.timeout_secs),
            ));
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("opsflow.toml");
        std::fs::write(
            &path,
            r#"
[scheduler]
scan_interval_ms = 250

[[job_types]]
name = "backfill"
executor = "pod"
timeout_secs = 7200
"#,
        )
        .unwrap();

        let config = OpsflowConfig::load(Some(&path)).unwrap();
        assert_eq!(config.scheduler.scan_interval_ms, 250);
        assert_eq!(config.scheduler.max_concurrent_workflows, 8);
        assert_eq!(config.migration.allowed_skew_secs, 5);
        assert!(config.pod.is_none());

        let registry = config.job_type_registry();
        assert_eq!(registry.names(), vec!["backfill", "shell", "sleep"]);
        assert_eq!(registry.get("backfill").unwrap().default_executor, ExecutorKind::Pod);
    }

    #[test]
    fn test_saved_config_loads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("opsflow.toml");
        let mut config = OpsflowConfig::default();
        config.pod = Some(PodConfig::default());
        config.save_to_file(&path).unwrap();

        let loaded = OpsflowConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.pod.unwrap().namespace, "default");
        assert_eq!(loaded.store.path, PathBuf::from(".opsflow/state"));
    }

    #[test]
    fn test_zero_intervals_are_raised_to_a_floor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("opsflow.toml");
        std::fs::write(
            &path,
            r#"
[scheduler]
scan_interval_ms = 0

[execution]
stop_check_interval_ms = 0
"#,
        )
        .unwrap();

        let config = OpsflowConfig::load(Some(&path)).unwrap();
        assert!(config.scheduler.scan_interval() > Duration::ZERO);
        assert_eq!(config.execution.settings().stop_check_interval, MIN_CHECK_INTERVAL);
    }

    #[test]
    fn test_missing_explicit_file_is_a_configuration_error() {
        let err = OpsflowConfig::load(Some(Path::new("/nonexistent/opsflow.toml"))).unwrap_err();
        assert!(matches!(err, OpsflowError::Configuration(_)));
    }
}
