//! IaC engine boundary.
//!
//! Defines the `InfraEngine` async trait the plan executor and orchestrator
//! drive. The core never interprets engine inputs; it only classifies the
//! exit code and carries the textual diff.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::Environment;

// ---------------------------------------------------------------------------
// Engine output
// ---------------------------------------------------------------------------

/// Captured result of one engine invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOutput {
    /// Process exit code; -1 when terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl EngineOutput {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration_ms: 0,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr, separated by a blank line when both are present.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n\n{}", self.stdout, self.stderr),
        }
    }
}

/// Reasons an engine invocation produced no classifiable output.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The engine could not be started (missing binary, credentials, config root).
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    /// The engine's own state lock is held by someone else.
    #[error("engine state lock is held{}", .holder.as_deref().map(|h| format!(" by {h}")).unwrap_or_default())]
    LockUnavailable { holder: Option<String> },

    #[error("engine timed out after {secs}s")]
    Timeout { secs: u64 },
}

// ---------------------------------------------------------------------------
// Engine trait
// ---------------------------------------------------------------------------

/// Capability interface over an IaC engine (Terraform, OpenTofu, ...).
#[async_trait]
pub trait InfraEngine: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Dry-run: compute the difference between declared and live state.
    async fn compute_diff(&self, environment: &Environment) -> Result<EngineOutput, EngineError>;

    /// Apply the declared configuration.
    async fn apply_diff(&self, environment: &Environment) -> Result<EngineOutput, EngineError>;

    /// Tear down everything managed in the environment.
    async fn destroy(&self, environment: &Environment) -> Result<EngineOutput, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_output_joins_streams() {
        assert_eq!(EngineOutput::new(0, "out", "").combined(), "out");
        assert_eq!(EngineOutput::new(1, "", "err").combined(), "err");
        assert_eq!(EngineOutput::new(1, "out", "err").combined(), "out\n\nerr");
    }

    #[test]
    fn lock_error_mentions_holder() {
        let err = EngineError::LockUnavailable {
            holder: Some("ci@runner-7".to_string()),
        };
        assert!(err.to_string().contains("ci@runner-7"));
    }
}
