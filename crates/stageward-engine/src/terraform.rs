//! `InfraEngine` over the Terraform / OpenTofu CLI.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use stageward_core::config::Settings;
use stageward_core::{EngineError, EngineOutput, Environment, EnvironmentId, InfraEngine};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::runner::{ProcessRunner, RunnerError};
use crate::stage::EngineStage;

/// First line Terraform prints when the backend state lock is taken.
pub const LOCK_ERROR_MARKER: &str = "Error acquiring the state lock";

/// Runs the engine binary in each environment's config root.
pub struct TerraformEngine {
    command: Vec<String>,
    timeout_secs: u64,
    init: bool,
    /// Per-environment init flag; each slot is held across its own init only.
    initialized: Mutex<HashMap<EnvironmentId, Arc<Mutex<bool>>>>,
}

impl TerraformEngine {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            timeout_secs: 0,
            init: true,
            initialized: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.engine_command.clone())
            .with_timeout_secs(settings.command_timeout_secs)
            .with_init(settings.init)
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Run `init` once per environment before its first plan/apply/destroy.
    pub fn with_init(mut self, init: bool) -> Self {
        self.init = init;
        self
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Checks that need no process: config root present, required variables set.
    pub fn preflight(&self, environment: &Environment) -> Result<(), EngineError> {
        if self.command.is_empty() {
            return Err(EngineError::Unavailable("engine command is empty".to_string()));
        }
        if !environment.config_root.is_dir() {
            return Err(EngineError::Unavailable(format!(
                "config root {} does not exist",
                environment.config_root.display()
            )));
        }
        let missing: Vec<&str> = environment
            .required_env
            .iter()
            .filter(|name| std::env::var_os(name.as_str()).map_or(true, |v| v.is_empty()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::Unavailable(format!(
                "missing required environment variable(s): {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    async fn invoke(
        &self,
        stage: EngineStage,
        environment: &Environment,
    ) -> Result<EngineOutput, EngineError> {
        let spec = stage.command_for(&self.command, environment, self.timeout_secs);
        let output = ProcessRunner::execute(&spec)
            .await
            .map_err(|e| self.runner_error(e))?;
        debug!(
            environment = %environment.id,
            stage = %stage,
            exit_code = output.exit_code,
            duration_ms = output.duration_ms,
            "engine finished"
        );
        if !stage.is_bounded()
            && self.timeout_secs > 0
            && output.duration_ms > self.timeout_secs.saturating_mul(1000)
        {
            warn!(
                environment = %environment.id,
                stage = %stage,
                duration_ms = output.duration_ms,
                timeout_secs = self.timeout_secs,
                "engine ran past the command timeout"
            );
        }
        Ok(output)
    }

    fn runner_error(&self, err: RunnerError) -> EngineError {
        match err {
            RunnerError::Timeout { secs, .. } => EngineError::Timeout { secs },
            e if e.is_not_found() => EngineError::Unavailable(format!(
                "engine binary `{}` not found",
                self.command.first().map(String::as_str).unwrap_or("")
            )),
            e => EngineError::Unavailable(e.to_string()),
        }
    }

    /// Returns the failed init output, if init ran and failed.
    async fn ensure_initialized(
        &self,
        environment: &Environment,
    ) -> Result<Option<EngineOutput>, EngineError> {
        if !self.init {
            return Ok(None);
        }
        let slot = {
            let mut initialized = self.initialized.lock().await;
            initialized.entry(environment.id.clone()).or_default().clone()
        };
        let mut done = slot.lock().await;
        if *done {
            return Ok(None);
        }
        let output = self.invoke(EngineStage::Init, environment).await?;
        if !output.success() {
            warn!(
                environment = %environment.id,
                exit_code = output.exit_code,
                "engine init failed"
            );
            return Ok(Some(output));
        }
        *done = true;
        Ok(None)
    }

    async fn run(
        &self,
        stage: EngineStage,
        environment: &Environment,
    ) -> Result<EngineOutput, EngineError> {
        self.preflight(environment)?;
        if let Some(failed_init) = self.ensure_initialized(environment).await? {
            return Ok(failed_init);
        }

        info!(environment = %environment.id, stage = %stage, "running engine");
        let output = self.invoke(stage, environment).await?;
        if !output.success() && output.stderr.contains(LOCK_ERROR_MARKER) {
            return Err(EngineError::LockUnavailable {
                holder: parse_lock_holder(&output.stderr),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl InfraEngine for TerraformEngine {
    fn name(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or("terraform")
    }

    async fn compute_diff(&self, environment: &Environment) -> Result<EngineOutput, EngineError> {
        self.run(EngineStage::Plan, environment).await
    }

    async fn apply_diff(&self, environment: &Environment) -> Result<EngineOutput, EngineError> {
        self.run(EngineStage::Apply, environment).await
    }

    async fn destroy(&self, environment: &Environment) -> Result<EngineOutput, EngineError> {
        self.run(EngineStage::Destroy, environment).await
    }
}

/// Pull the `Who:` field out of Terraform's lock-info block.
pub fn parse_lock_holder(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Who:"))
        .map(str::trim)
        .find(|who| !who.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCKED: &str = "\
Error: Error acquiring the state lock

Error message: ConditionalCheckFailedException: The conditional request failed
Lock Info:
  ID:        9c4d2a7e-8a1f-4f0e-b6d4-2f51e0c3a7b1
  Path:      tfstate-prod/env/prod/terraform.tfstate
  Operation: OperationTypeApply
  Who:       ci@runner-7
  Version:   1.7.5
";

    #[test]
    fn parses_lock_holder() {
        assert_eq!(parse_lock_holder(LOCKED).as_deref(), Some("ci@runner-7"));
        assert_eq!(parse_lock_holder("Error: something else"), None);
    }

    #[test]
    fn preflight_rejects_missing_config_root() {
        let engine = TerraformEngine::new(vec!["terraform".to_string()]);
        let env = Environment::new("dev", 0, "/nonexistent/stageward/environments/dev");
        let err = engine.preflight(&env).unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(msg) if msg.contains("config root")));
    }

    #[test]
    fn preflight_reports_every_missing_variable() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TerraformEngine::new(vec!["terraform".to_string()]);
        let env = Environment::new("dev", 0, dir.path())
            .with_required_env("STAGEWARD_TEST_UNSET_A")
            .with_required_env("STAGEWARD_TEST_UNSET_B");
        let err = engine.preflight(&env).unwrap_err();
        let EngineError::Unavailable(msg) = err else {
            panic!("expected unavailable");
        };
        assert!(msg.contains("STAGEWARD_TEST_UNSET_A"));
        assert!(msg.contains("STAGEWARD_TEST_UNSET_B"));
    }

    #[test]
    fn engine_name_is_binary() {
        let engine = TerraformEngine::new(vec!["tofu".to_string()]);
        assert_eq!(engine.name(), "tofu");
    }
}
