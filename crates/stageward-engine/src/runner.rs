//! Child-process execution with captured output and a wall-clock bound.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use stageward_core::EngineOutput;
use tokio::process::Command;
use tracing::debug;

/// A fully-resolved command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Label used in logs ("plan", "apply", ...).
    pub name: String,

    /// Command line; first element is the executable.
    pub command: Vec<String>,

    /// Working directory.
    pub cwd: PathBuf,

    /// Extra environment variables layered over the inherited environment.
    pub env: Vec<(String, String)>,

    /// Wall-clock bound in seconds; 0 disables it.
    pub timeout_secs: u64,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>, command: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            command,
            cwd: cwd.into(),
            env: Vec::new(),
            timeout_secs: 0,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Executable name, for diagnostics.
    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("command `{name}` is empty")]
    EmptyCommand { name: String },

    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{name}` timed out after {secs} seconds")]
    Timeout { name: String, secs: u64 },

    #[error("failed to collect output of `{name}`: {source}")]
    Wait {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl RunnerError {
    /// The executable itself was not found on disk or `PATH`.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RunnerError::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}

/// Spawns commands and captures their output.
pub struct ProcessRunner;

impl ProcessRunner {
    /// Run `spec` to completion.
    ///
    /// The child is killed when the timeout elapses. A non-zero exit is not an
    /// error; callers classify `exit_code` themselves.
    pub async fn execute(spec: &CommandSpec) -> Result<EngineOutput, RunnerError> {
        let start = Instant::now();

        let Some((exe, args)) = spec.command.split_first() else {
            return Err(RunnerError::EmptyCommand {
                name: spec.name.clone(),
            });
        };

        debug!(stage = %spec.name, program = %exe, cwd = %spec.cwd.display(), "spawning engine");

        let child = Command::new(exe)
            .args(args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: exe.clone(),
                source,
            })?;

        let waited = if spec.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(spec.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| RunnerError::Timeout {
                name: spec.name.clone(),
                secs: spec.timeout_secs,
            })?
        } else {
            child.wait_with_output().await
        };
        let output = waited.map_err(|source| RunnerError::Wait {
            name: spec.name.clone(),
            source,
        })?;

        Ok(EngineOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new(
            "test",
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            std::env::temp_dir(),
        )
    }

    #[tokio::test]
    async fn captures_both_streams_and_exit_code() {
        let out = ProcessRunner::execute(&sh("echo hello; echo oops >&2; exit 3"))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(out.stdout.contains("hello"));
        assert!(out.stderr.contains("oops"));
    }

    #[tokio::test]
    async fn passes_extra_environment() {
        let spec = sh("printf %s \"$TF_VAR_region\"").with_env("TF_VAR_region", "eu-west-1");
        let out = ProcessRunner::execute(&spec).await.unwrap();
        assert_eq!(out.stdout, "eu-west-1");
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let spec = CommandSpec::new("plan", vec![], std::env::temp_dir());
        let err = ProcessRunner::execute(&spec).await.unwrap_err();
        assert!(matches!(err, RunnerError::EmptyCommand { .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_not_found() {
        let spec = CommandSpec::new(
            "plan",
            vec!["stageward-definitely-missing-binary".to_string()],
            std::env::temp_dir(),
        );
        let err = ProcessRunner::execute(&spec).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn timeout_kills_long_running_command() {
        let spec = sh("sleep 10").with_timeout_secs(1);
        let started = Instant::now();
        let err = ProcessRunner::execute(&spec).await.unwrap_err();
        assert!(matches!(err, RunnerError::Timeout { secs: 1, .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
