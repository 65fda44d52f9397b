pub mod api;
pub mod catalog;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod resolver;
pub mod secrets;
pub mod signature;
pub mod trigger;
pub mod webhook;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::catalog::ProjectCatalog;
use crate::dispatch::Dispatcher;
use crate::error::DispatchError;

pub const DEFAULT_SECRET_KEY: &str = "GHE_SECRETS";
const DEFAULT_TRIGGER_TIMEOUT_SECS: u64 = 30;
const DEFAULT_REQUEST_DEADLINE_SECS: u64 = 60;

/// Raw contents of the optional TOML config file. Every value may also come
/// from the environment, which wins.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct FileConfig {
    pub job_name_suffix: Option<String>,
    pub trigger_branch: Option<String>,
    pub secrets_name: Option<String>,
    pub secret_key: Option<String>,
    pub allow_unknown_projects: bool,
    pub trigger_timeout_secs: Option<u64>,
    pub request_deadline_secs: Option<u64>,
    pub catalog: ProjectCatalog,
    pub trigger: TriggerConfig,
    pub secrets: SecretsConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Command,
    #[default]
    Log,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TriggerConfig {
    pub kind: TriggerKind,
    pub program: Option<String>,
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SecretBackend {
    #[default]
    Env,
    File,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SecretsConfig {
    pub backend: SecretBackend,
    pub directory: Option<PathBuf>,
    pub cache: bool,
}

/// Validated dispatcher configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub job_name_suffix: String,
    pub trigger_branch: String,
    pub secrets_name: String,
    pub secret_key: String,
    pub allow_unknown_projects: bool,
    pub trigger_timeout: Duration,
    pub request_deadline: Duration,
    pub catalog: ProjectCatalog,
    pub trigger: TriggerConfig,
    pub secrets: SecretsConfig,
}

impl DispatchConfig {
    /// Configuration with the required values and defaults for the rest.
    pub fn new(trigger_branch: &str, job_name_suffix: &str, secrets_name: &str) -> Self {
        Self {
            job_name_suffix: job_name_suffix.to_string(),
            trigger_branch: trigger_branch.to_string(),
            secrets_name: secrets_name.to_string(),
            secret_key: DEFAULT_SECRET_KEY.to_string(),
            allow_unknown_projects: false,
            trigger_timeout: Duration::from_secs(DEFAULT_TRIGGER_TIMEOUT_SECS),
            request_deadline: Duration::from_secs(DEFAULT_REQUEST_DEADLINE_SECS),
            catalog: ProjectCatalog::default(),
            trigger: TriggerConfig::default(),
            secrets: SecretsConfig::default(),
        }
    }

    /// Merges the file config with environment lookups and validates the result.
    pub fn from_sources<F>(file: FileConfig, env: F) -> Result<Self, DispatchError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str, from_file: Option<String>| {
            env(key).or(from_file).ok_or_else(|| {
                DispatchError::ConfigError(format!("required setting '{}' is not set", key))
            })
        };

        let job_name_suffix = required("job_name_suffix", file.job_name_suffix)?;
        let trigger_branch = required("trigger_branch", file.trigger_branch)?;
        let secrets_name = required("secrets_name", file.secrets_name)?;
        let secret_key = env("secret_key")
            .or(file.secret_key)
            .unwrap_or_else(|| DEFAULT_SECRET_KEY.to_string());

        if trigger_branch.trim().is_empty() {
            return Err(DispatchError::ConfigError(
                "'trigger_branch' must not be empty".to_string(),
            ));
        }
        if file.trigger.kind == TriggerKind::Command
            && file.trigger.program.as_deref().is_none_or(|p| p.trim().is_empty())
        {
            return Err(DispatchError::ConfigError(
                "trigger kind 'command' requires 'trigger.program'".to_string(),
            ));
        }
        file.catalog.validate()?;
        if file.secrets.backend == SecretBackend::File && file.secrets.directory.is_none() {
            return Err(DispatchError::ConfigError(
                "secrets backend 'file' requires 'secrets.directory'".to_string(),
            ));
        }

        let trigger_timeout =
            file.trigger_timeout_secs.unwrap_or(DEFAULT_TRIGGER_TIMEOUT_SECS);
        let request_deadline =
            file.request_deadline_secs.unwrap_or(DEFAULT_REQUEST_DEADLINE_SECS);
        if trigger_timeout == 0 || request_deadline == 0 {
            return Err(DispatchError::ConfigError(
                "timeouts must be at least one second".to_string(),
            ));
        }

        Ok(Self {
            job_name_suffix,
            trigger_branch,
            secrets_name,
            secret_key,
            allow_unknown_projects: file.allow_unknown_projects,
            trigger_timeout: Duration::from_secs(trigger_timeout),
            request_deadline: Duration::from_secs(request_deadline),
            catalog: file.catalog,
            trigger: file.trigger,
            secrets: file.secrets,
        })
    }

    /// Pipeline name for a project.
    pub fn pipeline_name(&self, project: &str) -> String {
        format!("{}{}", project, self.job_name_suffix)
    }
}

/// Read the TOML config file, if present
pub fn read_config_file(path: &Path) -> Result<FileConfig, DispatchError> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }

    let config_str = std::fs::read_to_string(path).map_err(|e| {
        DispatchError::ConfigError(format!("Failed to read config file '{}': {}", path.display(), e))
    })?;

    toml::from_str(&config_str).map_err(|e| {
        DispatchError::ConfigError(format!("Failed to parse config file '{}': {}", path.display(), e))
    })
}

/// Load configuration from the file at `path` and the process environment
pub fn load_config(path: &Path) -> Result<DispatchConfig, DispatchError> {
    let file = read_config_file(path)?;
    DispatchConfig::from_sources(file, |key| std::env::var(key).ok())
}

pub struct AppState {
    pub dispatcher: Dispatcher,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            start_time: Instant::now(),
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<AppState>;
