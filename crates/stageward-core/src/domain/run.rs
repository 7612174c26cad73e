//! Promotion runs and their per-environment stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::environment::EnvironmentId;
use super::error::CoreError;
use super::plan::PlanResult;

/// Operation requested by the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Plan,
    Apply,
    Destroy,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Plan => "plan",
            Action::Apply => "apply",
            Action::Destroy => "destroy",
        }
    }

    /// Whether the action mutates real infrastructure.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Action::Plan)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Action::Plan),
            "apply" => Ok(Action::Apply),
            "destroy" => Ok(Action::Destroy),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

/// Lifecycle state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageState::Success | StageState::Failed | StageState::Skipped
        )
    }

    /// Legal transitions: Pending -> Running | Skipped, Running -> Success | Failed | Skipped.
    pub fn can_transition_to(&self, next: StageState) -> bool {
        matches!(
            (self, next),
            (StageState::Pending, StageState::Running)
                | (StageState::Pending, StageState::Skipped)
                | (StageState::Running, StageState::Success)
                | (StageState::Running, StageState::Failed)
                | (StageState::Running, StageState::Skipped)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageState::Pending => "pending",
            StageState::Running => "running",
            StageState::Success => "success",
            StageState::Failed => "failed",
            StageState::Skipped => "skipped",
        }
    }
}

/// Why a stage did not run to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    UpstreamFailed,
    NoChanges,
    Cancelled,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::UpstreamFailed => "upstream failed",
            SkipReason::NoChanges => "no changes",
            SkipReason::Cancelled => "cancelled",
        }
    }
}

/// Category of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Execution,
    PlanFailed,
    ApplyFailed,
    DestroyFailed,
    LockTimeout,
    Storage,
}

/// Captured failure of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Truncated engine output explaining the failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl StageFailure {
    /// Map a stage error onto its recorded form.
    pub fn from_error(err: &CoreError) -> Self {
        let kind = match err {
            CoreError::PlanFailed { .. } => FailureKind::PlanFailed,
            CoreError::ApplyFailed { .. } => FailureKind::ApplyFailed,
            CoreError::DestroyFailed { .. } => FailureKind::DestroyFailed,
            CoreError::LockTimeout { .. } | CoreError::LockUnavailable { .. } => {
                FailureKind::LockTimeout
            }
            CoreError::Storage(_) => FailureKind::Storage,
            _ => FailureKind::Execution,
        };
        let (exit_code, diagnostic) = match err {
            CoreError::PlanFailed {
                exit_code,
                diagnostic,
                ..
            }
            | CoreError::ApplyFailed {
                exit_code,
                diagnostic,
                ..
            }
            | CoreError::DestroyFailed {
                exit_code,
                diagnostic,
                ..
            } => (Some(*exit_code), Some(diagnostic.clone())),
            _ => (None, None),
        };
        Self {
            kind,
            message: err.to_string(),
            exit_code,
            diagnostic,
        }
    }
}

/// One environment's slot in a promotion run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub environment: EnvironmentId,
    pub state: StageState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageRecord {
    pub fn pending(environment: EnvironmentId) -> Self {
        Self {
            environment,
            state: StageState::Pending,
            skip_reason: None,
            plan: None,
            failure: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    pub fn transition(&mut self, next: StageState) -> Result<(), CoreError> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                environment: self.environment.to_string(),
                from: self.state.as_str(),
                to: next.as_str(),
            });
        }
        match next {
            StageState::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        self.state = next;
        Ok(())
    }

    pub fn skip(&mut self, reason: SkipReason) -> Result<(), CoreError> {
        self.transition(StageState::Skipped)?;
        self.skip_reason = Some(reason);
        Ok(())
    }

    pub fn fail(&mut self, failure: StageFailure) -> Result<(), CoreError> {
        self.transition(StageState::Failed)?;
        self.failure = Some(failure);
        Ok(())
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// A single sequential walk through the ordered environments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionRun {
    pub run_id: Uuid,
    pub action: Action,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageRecord>,
    pub status: RunStatus,
}

impl PromotionRun {
    pub fn new(action: Action, environments: impl IntoIterator<Item = EnvironmentId>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            action,
            started_at: Utc::now(),
            finished_at: None,
            stages: environments.into_iter().map(StageRecord::pending).collect(),
            status: RunStatus::Running,
        }
    }

    pub fn stage(&self, environment: &str) -> Option<&StageRecord> {
        self.stages
            .iter()
            .find(|s| s.environment.as_str() == environment)
    }

    /// Derive the final status from the stages and stamp `finished_at`.
    pub fn finish(&mut self) {
        self.status = if self
            .stages
            .iter()
            .any(|s| s.skip_reason == Some(SkipReason::Cancelled))
        {
            RunStatus::Cancelled
        } else if self.stages.iter().any(|s| s.state == StageState::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        self.finished_at = Some(Utc::now());
    }

    /// CLI exit code for this run: 0 success, 2 engine failure, 1 cancelled.
    pub fn exit_code(&self) -> u8 {
        match self.status {
            RunStatus::Succeeded => 0,
            RunStatus::Failed => 2,
            RunStatus::Cancelled | RunStatus::Running => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_rejects_illegal_transitions() {
        let mut stage = StageRecord::pending("dev".into());
        assert!(stage.transition(StageState::Success).is_err());
        stage.transition(StageState::Running).unwrap();
        stage.transition(StageState::Success).unwrap();
        assert!(stage.transition(StageState::Running).is_err());
        assert!(stage.started_at.is_some());
        assert!(stage.finished_at.is_some());
    }

    #[test]
    fn run_status_prefers_cancelled_over_failed() {
        let mut run = PromotionRun::new(
            Action::Apply,
            [EnvironmentId::from("dev"), EnvironmentId::from("staging")],
        );
        run.stages[0].transition(StageState::Running).unwrap();
        run.stages[0]
            .fail(StageFailure {
                kind: FailureKind::ApplyFailed,
                message: "boom".into(),
                exit_code: Some(1),
                diagnostic: None,
            })
            .unwrap();
        run.stages[1].skip(SkipReason::Cancelled).unwrap();
        run.finish();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.exit_code(), 1);
    }

    #[test]
    fn run_serializes_with_snake_case_states() {
        let mut run = PromotionRun::new(Action::Plan, [EnvironmentId::from("dev")]);
        run.stages[0].skip(SkipReason::NoChanges).unwrap();
        run.finish();
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["action"], "plan");
        assert_eq!(json["status"], "succeeded");
        assert_eq!(json["stages"][0]["state"], "skipped");
        assert_eq!(json["stages"][0]["skip_reason"], "no_changes");
    }

    #[test]
    fn action_parses_from_cli_strings() {
        assert_eq!("destroy".parse::<Action>().unwrap(), Action::Destroy);
        assert!("rollback".parse::<Action>().is_err());
        assert!(!Action::Plan.is_mutating());
    }
}
