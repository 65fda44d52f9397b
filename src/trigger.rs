//! Starting downstream pipelines
//!
//! The dispatcher only waits for a pipeline to acknowledge that it started,
//! never for it to finish.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{DispatchError, Result};
use crate::{TriggerConfig, TriggerKind};

/// Placeholder in command arguments replaced by the pipeline name.
pub const PIPELINE_PLACEHOLDER: &str = "{pipeline}";

const MAX_EXECUTION_ID_LEN: usize = 200;

/// Acknowledgment that a pipeline execution was started.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TriggerReceipt {
    pub pipeline: String,
    pub execution_id: Option<String>,
}

#[async_trait]
pub trait PipelineTrigger: Send + Sync {
    async fn start(&self, pipeline_name: &str) -> Result<TriggerReceipt>;
}

/// Starts a pipeline by spawning a configured program, e.g.
/// `aws codepipeline start-pipeline-execution --name {pipeline}`.
#[derive(Debug, Clone)]
pub struct CommandTrigger {
    program: String,
    args: Vec<String>,
}

impl CommandTrigger {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Result<Self> {
        let program = program.into();
        if program.trim().is_empty() {
            return Err(DispatchError::ConfigError(
                "command trigger requires a program".to_string(),
            ));
        }
        Ok(Self { program, args })
    }

    /// Arguments with the placeholder substituted; without any placeholder
    /// the pipeline name is appended as the last argument.
    pub fn command_args(&self, pipeline_name: &str) -> Vec<String> {
        let has_placeholder = self.args.iter().any(|a| a.contains(PIPELINE_PLACEHOLDER));
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace(PIPELINE_PLACEHOLDER, pipeline_name))
            .collect();
        if !has_placeholder {
            args.push(pipeline_name.to_string());
        }
        args
    }
}

#[async_trait]
impl PipelineTrigger for CommandTrigger {
    async fn start(&self, pipeline_name: &str) -> Result<TriggerReceipt> {
        let args = self.command_args(pipeline_name);
        info!("Running: {} {}", self.program, args.join(" "));

        let output = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                DispatchError::trigger(
                    pipeline_name,
                    format!("'{}' failed to start: {}", self.program, e),
                )
            })?;

        if !output.status.success() {
            return Err(DispatchError::trigger(
                pipeline_name,
                format!(
                    "'{}' exited with {}: {}",
                    self.program,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!("Trigger output for '{}':\n{}", pipeline_name, stdout);
        let execution_id = stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(|line| line.chars().take(MAX_EXECUTION_ID_LEN).collect());

        Ok(TriggerReceipt {
            pipeline: pipeline_name.to_string(),
            execution_id,
        })
    }
}

/// Acknowledges every start without contacting anything.
#[derive(Debug, Default, Clone)]
pub struct LogTrigger;

#[async_trait]
impl PipelineTrigger for LogTrigger {
    async fn start(&self, pipeline_name: &str) -> Result<TriggerReceipt> {
        info!("Pipeline '{}' start requested (log trigger)", pipeline_name);
        Ok(TriggerReceipt {
            pipeline: pipeline_name.to_string(),
            execution_id: None,
        })
    }
}

/// Builds the configured trigger backend.
pub fn build_trigger(config: &TriggerConfig) -> Result<Arc<dyn PipelineTrigger>> {
    match config.kind {
        TriggerKind::Command => {
            let program = config.program.clone().unwrap_or_default();
            Ok(Arc::new(CommandTrigger::new(program, config.args.clone())?))
        }
        TriggerKind::Log => Ok(Arc::new(LogTrigger)),
    }
}

type TriggerFactory = Box<dyn Fn() -> Result<Arc<dyn PipelineTrigger>> + Send + Sync>;

/// Process-wide pipeline trigger handle, constructed on first use.
///
/// Concurrent first callers share a single construction. A failed
/// construction is not cached, so the next request tries again.
pub struct TriggerClient {
    cell: OnceCell<Arc<dyn PipelineTrigger>>,
    factory: Option<TriggerFactory>,
}

impl TriggerClient {
    pub fn lazy<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn PipelineTrigger>> + Send + Sync + 'static,
    {
        Self {
            cell: OnceCell::new(),
            factory: Some(Box::new(factory)),
        }
    }

    /// A client that is already initialized with `trigger`.
    pub fn preset(trigger: Arc<dyn PipelineTrigger>) -> Self {
        Self {
            cell: OnceCell::new_with(Some(trigger)),
            factory: None,
        }
    }

    pub fn from_config(config: &TriggerConfig) -> Self {
        let config = config.clone();
        Self::lazy(move || build_trigger(&config))
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }

    pub async fn get(&self) -> Result<Arc<dyn PipelineTrigger>> {
        self.cell
            .get_or_try_init(|| async {
                let factory = self.factory.as_ref().ok_or_else(|| {
                    DispatchError::ConfigError("no pipeline trigger configured".to_string())
                })?;
                let trigger = factory()?;
                info!("Pipeline trigger client initialized");
                Ok::<_, DispatchError>(trigger)
            })
            .await
            .map(Arc::clone)
    }
}
