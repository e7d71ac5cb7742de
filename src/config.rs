//! Settings
//!
//! Orchestrator and session pool configuration, loaded from YAML with
//! per-field defaults and a small set of environment overrides.
//!
//! # Example YAML Format
//!
//! ```yaml
//! orchestrator:
//!   max_concurrent_workflows: 5
//!   retry_delay_secs: 5.0
//!   checkpoint_dir: .flowdirector/checkpoints
//! pool:
//!   max_total_sessions: 5
//!   acquire_timeout_secs: 30
//!   task_types:
//!     job_discovery: { min_sessions: 1, max_sessions: 2 }
//! ```

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::session::SessionConfig;
use crate::workflow::planner::RetryPolicy;

fn default_max_concurrent_workflows() -> usize {
    5
}

fn default_retry_delay() -> f64 {
    5.0
}

fn default_retry_backoff() -> f64 {
    2.0
}

fn default_max_retry_delay() -> f64 {
    300.0
}

fn default_max_payload_bytes() -> usize {
    64 * 1024
}

fn default_true() -> bool {
    true
}

fn default_command_buffer() -> usize {
    256
}

fn default_max_total_sessions() -> usize {
    5
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_session_lifetime() -> u64 {
    30 * 60
}

fn default_error_threshold() -> u32 {
    3
}

fn default_health_check_interval() -> u64 {
    60
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_task_types() -> BTreeMap<String, TaskTypeLimits> {
    let mut task_types = BTreeMap::new();
    task_types.insert("job_discovery".to_string(), TaskTypeLimits::new(1, 2));
    task_types.insert("proposal_submission".to_string(), TaskTypeLimits::new(1, 2));
    task_types.insert("profile_management".to_string(), TaskTypeLimits::new(0, 1));
    task_types
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Executions allowed in RUNNING at once
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: usize,

    /// Delay before the first retry of a failed step
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: f64,

    /// Multiplier applied to the delay for each further retry
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: f64,

    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: f64,

    /// Limit on step parameters, execution input and step results
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// When set, checkpoints are also appended to JSONL files here
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Register the predefined workflows at start
    #[serde(default = "default_true")]
    pub preload_templates: bool,

    /// Capacity of the API command channel
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: default_max_concurrent_workflows(),
            retry_delay_secs: default_retry_delay(),
            retry_backoff: default_retry_backoff(),
            max_retry_delay_secs: default_max_retry_delay(),
            max_payload_bytes: default_max_payload_bytes(),
            checkpoint_dir: None,
            preload_templates: default_true(),
            command_buffer: default_command_buffer(),
        }
    }
}

impl OrchestratorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::try_from_secs_f64(self.retry_delay_secs).unwrap_or_default(),
            self.retry_backoff,
            Duration::try_from_secs_f64(self.max_retry_delay_secs).unwrap_or_default(),
        )
    }
}

/// Session count limits for one task type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTypeLimits {
    /// Sessions kept alive even when idle
    #[serde(default)]
    pub min_sessions: usize,

    /// Hard cap on sessions of this type
    pub max_sessions: usize,
}

impl TaskTypeLimits {
    pub fn new(min_sessions: usize, max_sessions: usize) -> Self {
        Self {
            min_sessions,
            max_sessions,
        }
    }
}

/// Session pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Cap on sessions across all task types
    #[serde(default = "default_max_total_sessions")]
    pub max_total_sessions: usize,

    #[serde(default = "default_task_types")]
    pub task_types: BTreeMap<String, TaskTypeLimits>,

    /// Limits for task types missing from `task_types`
    #[serde(default = "PoolConfig::default_limits")]
    pub default_limits: TaskTypeLimits,

    /// Wait budget of `acquire`
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    #[serde(default = "default_session_lifetime")]
    pub max_session_age_secs: u64,

    #[serde(default = "default_session_lifetime")]
    pub max_idle_secs: u64,

    /// Sessions with more recorded errors than this are unhealthy
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,

    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Settings used for every new session
    #[serde(default)]
    pub session: SessionConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total_sessions: default_max_total_sessions(),
            task_types: default_task_types(),
            default_limits: Self::default_limits(),
            acquire_timeout_secs: default_acquire_timeout(),
            max_session_age_secs: default_session_lifetime(),
            max_idle_secs: default_session_lifetime(),
            error_threshold: default_error_threshold(),
            health_check_interval_secs: default_health_check_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
            session: SessionConfig::default(),
        }
    }
}

impl PoolConfig {
    fn default_limits() -> TaskTypeLimits {
        TaskTypeLimits::new(0, 2)
    }

    /// Limits that apply to `task_type`.
    pub fn limits_for(&self, task_type: &str) -> TaskTypeLimits {
        self.task_types
            .get(task_type)
            .copied()
            .unwrap_or(self.default_limits)
    }

    /// Sets the limits of one task type.
    pub fn with_task_type(mut self, task_type: impl Into<String>, min: usize, max: usize) -> Self {
        self.task_types
            .insert(task_type.into(), TaskTypeLimits::new(min, max));
        self
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn max_session_age(&self) -> Duration {
        Duration::from_secs(self.max_session_age_secs)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }
}

/// Complete application settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub pool: PoolConfig,
}

impl Settings {
    /// Loads settings from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let settings = Self::from_yaml(&content)?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Parses and validates settings from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_yaml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Applies `FLOWDIRECTOR_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{} has invalid value '{}'", key, value)))
        }

        if let Some(v) = lookup("FLOWDIRECTOR_MAX_CONCURRENT_WORKFLOWS") {
            self.orchestrator.max_concurrent_workflows =
                parse("FLOWDIRECTOR_MAX_CONCURRENT_WORKFLOWS", &v)?;
        }
        if let Some(v) = lookup("FLOWDIRECTOR_RETRY_DELAY_SECS") {
            self.orchestrator.retry_delay_secs = parse("FLOWDIRECTOR_RETRY_DELAY_SECS", &v)?;
        }
        if let Some(v) = lookup("FLOWDIRECTOR_POOL_SIZE") {
            self.pool.max_total_sessions = parse("FLOWDIRECTOR_POOL_SIZE", &v)?;
        }
        if let Some(v) = lookup("FLOWDIRECTOR_SESSION_TIMEOUT_MINUTES") {
            let minutes: u64 = parse("FLOWDIRECTOR_SESSION_TIMEOUT_MINUTES", &v)?;
            self.pool.max_session_age_secs = minutes * 60;
            self.pool.max_idle_secs = minutes * 60;
        }
        if let Some(v) = lookup("FLOWDIRECTOR_CHECKPOINT_DIR") {
            self.orchestrator.checkpoint_dir = Some(PathBuf::from(v));
        }

        debug!("Settings after environment overrides: {:?}", self);
        self.validate()
    }

    /// Rejects settings the orchestrator cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let o = &self.orchestrator;
        if o.max_concurrent_workflows == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_workflows must be at least 1".into(),
            ));
        }
        if o.command_buffer == 0 {
            return Err(ConfigError::Invalid("command_buffer must be at least 1".into()));
        }
        if !(o.retry_delay_secs >= 0.0 && o.retry_backoff >= 1.0 && o.max_retry_delay_secs >= 0.0) {
            return Err(ConfigError::Invalid(
                "retry delays must be non-negative and retry_backoff at least 1.0".into(),
            ));
        }

        let p = &self.pool;
        if p.max_total_sessions == 0 {
            return Err(ConfigError::Invalid("max_total_sessions must be at least 1".into()));
        }
        for (task_type, limits) in p.task_types.iter().chain([(&"<default>".to_string(), &p.default_limits)]) {
            if limits.max_sessions < limits.min_sessions {
                return Err(ConfigError::Invalid(format!(
                    "task type '{}': max_sessions {} is below min_sessions {}",
                    task_type, limits.max_sessions, limits.min_sessions
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.orchestrator.max_concurrent_workflows, 5);
        assert_eq!(settings.orchestrator.retry_delay_secs, 5.0);
        assert_eq!(settings.pool.max_total_sessions, 5);
        assert_eq!(settings.pool.acquire_timeout(), Duration::from_secs(30));
        assert_eq!(settings.pool.error_threshold, 3);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "orchestrator:\n  max_concurrent_workflows: 2\npool:\n  acquire_timeout_secs: 5\n";
        let settings = Settings::from_yaml(yaml).unwrap();
        assert_eq!(settings.orchestrator.max_concurrent_workflows, 2);
        assert_eq!(settings.orchestrator.retry_backoff, 2.0);
        assert_eq!(settings.pool.acquire_timeout_secs, 5);
        assert_eq!(settings.pool.limits_for("job_discovery"), TaskTypeLimits::new(1, 2));
    }

    #[test]
    fn test_limits_for_unknown_type() {
        let pool = PoolConfig::default();
        assert_eq!(pool.limits_for("general"), TaskTypeLimits::new(0, 2));
    }

    #[test]
    fn test_validate_rejects_inverted_limits() {
        let yaml = "pool:\n  task_types:\n    job_discovery: { min_sessions: 3, max_sessions: 1 }\n";
        assert!(matches!(Settings::from_yaml(yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let yaml = "orchestrator:\n  max_concurrent_workflows: 0\n";
        assert!(matches!(Settings::from_yaml(yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("FLOWDIRECTOR_MAX_CONCURRENT_WORKFLOWS", "3"),
            ("FLOWDIRECTOR_POOL_SIZE", "8"),
            ("FLOWDIRECTOR_SESSION_TIMEOUT_MINUTES", "10"),
            ("FLOWDIRECTOR_CHECKPOINT_DIR", "/tmp/cp"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(settings.orchestrator.max_concurrent_workflows, 3);
        assert_eq!(settings.pool.max_total_sessions, 8);
        assert_eq!(settings.pool.max_idle_secs, 600);
        assert_eq!(
            settings.orchestrator.checkpoint_dir,
            Some(PathBuf::from("/tmp/cp"))
        );
    }

    #[test]
    fn test_env_override_invalid_value() {
        let mut settings = Settings::default();
        let result = settings.apply_overrides(|key| {
            (key == "FLOWDIRECTOR_RETRY_DELAY_SECS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("settings.yaml");
        fs::write(&path, "pool:\n  max_total_sessions: 9\n").unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.pool.max_total_sessions, 9);
    }

    #[test]
    fn test_retry_policy_from_config() {
        let config = OrchestratorConfig {
            retry_delay_secs: 1.0,
            retry_backoff: 3.0,
            ..Default::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.delay_for(3), Duration::from_secs(9));
    }
}
