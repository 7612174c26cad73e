//! Dry-run results.

use serde::{Deserialize, Serialize};

use super::environment::EnvironmentId;

/// Classification of a dry-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOutcome {
    NoChanges,
    ChangesPending,
    Failed,
}

impl PlanOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanOutcome::NoChanges => "no_changes",
            PlanOutcome::ChangesPending => "changes_pending",
            PlanOutcome::Failed => "failed",
        }
    }
}

/// Counts scraped from the engine's `Plan: N to add, N to change, N to destroy.` line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import: Option<u32>,
    pub add: u32,
    pub change: u32,
    pub destroy: u32,
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(import) = self.import {
            write!(f, "{import} to import, ")?;
        }
        write!(
            f,
            "{} to add, {} to change, {} to destroy",
            self.add, self.change, self.destroy
        )
    }
}

/// Result of one dry-run against one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    pub environment: EnvironmentId,
    pub outcome: PlanOutcome,
    /// Diff payload, bounded by `plan_executor::MAX_PAYLOAD_CHARS` plus the marker.
    pub payload: String,
    /// Whether `payload` was cut down.
    pub truncated: bool,
    /// Raw engine exit code; -1 when the engine was killed or timed out.
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<PlanSummary>,
    /// SHA-256 hex of the untruncated payload.
    pub payload_digest: String,
    pub duration_ms: u64,
}

impl PlanResult {
    pub fn has_changes(&self) -> bool {
        self.outcome == PlanOutcome::ChangesPending
    }

    pub fn is_failed(&self) -> bool {
        self.outcome == PlanOutcome::Failed
    }
}
