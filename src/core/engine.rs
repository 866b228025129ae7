use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{AutomationSpec, Config};

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("unknown automation command '{0}'")]
    UnknownCommand(String),

    #[error("invalid arguments for '{command}': {reason}")]
    InvalidArguments { command: String, reason: String },

    #[error("automation '{command}' failed with exit code {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("automation '{command}' timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("failed to run automation '{command}': {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait Automation: Send + Sync {
    /// Command name callers use
    fn name(&self) -> &str;

    /// Whether successful results may be memoized
    fn cacheable(&self) -> bool {
        true
    }

    /// Run the command, returning its serialized result
    async fn execute(&self, args: &serde_json::Value) -> Result<String, AutomationError>;
}

pub type AutomationBox = Arc<dyn Automation>;

/// Name-keyed registry of automation commands
#[derive(Default)]
pub struct AutomationEngine {
    automations: HashMap<String, AutomationBox>,
}

impl AutomationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        let mut engine = Self::new();
        for (name, spec) in &config.automations {
            engine.register(Arc::new(ExternalCommand::new(name, spec.clone())));
        }
        info!("🔧 Registered {} automation commands", engine.len());
        engine
    }

    pub fn register(&mut self, automation: AutomationBox) {
        let name = automation.name().to_string();
        if self.automations.insert(name.clone(), automation).is_some() {
            warn!("⚠️  Automation '{}' registered twice, keeping the latest", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<&AutomationBox> {
        self.automations.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.automations.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.automations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.automations.is_empty()
    }

    pub async fn execute(&self, name: &str, args: &serde_json::Value) -> Result<String, AutomationError> {
        match self.automations.get(name) {
            Some(automation) => automation.execute(args).await,
            None => Err(AutomationError::UnknownCommand(name.to_string())),
        }
    }
}

/// Runs an external program. The request arguments are passed as JSON on
/// stdin and stdout becomes the result.
pub struct ExternalCommand {
    name: String,
    spec: AutomationSpec,
}

impl ExternalCommand {
    pub fn new(name: &str, spec: AutomationSpec) -> Self {
        Self {
            name: name.to_string(),
            spec,
        }
    }

    fn timeout(&self) -> Option<Duration> {
        self.spec.timeout_secs.map(Duration::from_secs)
    }

    fn io_error(&self, source: std::io::Error) -> AutomationError {
        AutomationError::Io {
            command: self.name.clone(),
            source,
        }
    }

    async fn run(&self, input: Vec<u8>) -> Result<std::process::Output, AutomationError> {
        let mut child = Command::new(&self.spec.command)
            .args(&self.spec.args)
            .env("AUTOMATION_NAME", &self.name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.io_error(e))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command may exit without reading its input
            if let Err(e) = stdin.write_all(&input).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(self.io_error(e));
                }
            }
        }

        child.wait_with_output().await.map_err(|e| self.io_error(e))
    }
}

#[async_trait]
impl Automation for ExternalCommand {
    fn name(&self) -> &str {
        &self.name
    }

    fn cacheable(&self) -> bool {
        self.spec.cacheable
    }

    async fn execute(&self, args: &serde_json::Value) -> Result<String, AutomationError> {
        let input = serde_json::to_vec(args).map_err(|e| AutomationError::InvalidArguments {
            command: self.name.clone(),
            reason: e.to_string(),
        })?;

        debug!("🚀 Running automation '{}': {}", self.name, self.spec.command);

        let output = match self.timeout() {
            Some(limit) => tokio::time::timeout(limit, self.run(input))
                .await
                .map_err(|_| AutomationError::Timeout {
                    command: self.name.clone(),
                    after: limit,
                })??,
            None => self.run(input).await?,
        };

        if !output.status.success() {
            return Err(AutomationError::Failed {
                command: self.name.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
