//! Drift reconciliation.
//!
//! A drift check is a dry-run against an environment whose configuration
//! has not changed. Pending changes mean live state diverged, which opens
//! (or re-finds) the environment's drift incident. Failed plans are
//! reported to the caller and never turned into incidents.

use chrono::Utc;
use futures::future::join_all;
use tracing::warn;

use crate::domain::{
    Environment, EnvironmentId, Incident, IncidentKey, PlanOutcome, PlanResult, Result,
};
use crate::incident::IncidentTracker;
use crate::metrics::METRICS;
use crate::obs;
use crate::plan_executor::PlanExecutor;

/// Outcome of one drift check.
#[derive(Debug, Clone, PartialEq)]
pub enum DriftOutcome {
    /// No differences. `closed` lists incidents closed by auto-close.
    InSync { closed: Vec<Incident> },
    /// Differences found; `created` is false when the incident was already open.
    Drifted {
        incident: Incident,
        created: bool,
        plan: PlanResult,
    },
    /// The dry-run itself failed.
    PlanFailed { plan: PlanResult },
}

impl DriftOutcome {
    /// The open drift incident, if drift was found.
    pub fn incident(&self) -> Option<&Incident> {
        match self {
            DriftOutcome::Drifted { incident, .. } => Some(incident),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DriftOutcome::InSync { .. } => "in_sync",
            DriftOutcome::Drifted { .. } => "drifted",
            DriftOutcome::PlanFailed { .. } => "plan_failed",
        }
    }
}

/// Per-environment result of [`DriftReconciler::reconcile_all`].
#[derive(Debug)]
pub struct DriftReport {
    pub environment: EnvironmentId,
    pub result: Result<DriftOutcome>,
}

impl DriftReport {
    /// Whether this check should fail the invocation.
    pub fn is_failure(&self) -> bool {
        matches!(self.result, Err(_) | Ok(DriftOutcome::PlanFailed { .. }))
    }
}

pub fn drift_title(environment: &EnvironmentId) -> String {
    format!("Drift detected in {environment}")
}

/// Incident body: a short header followed by the bounded diff.
pub fn drift_body(plan: &PlanResult) -> String {
    let summary = plan
        .summary
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unavailable".to_string());
    let mut body = format!(
        "Live infrastructure in `{}` no longer matches its declared configuration.\n\n\
         - Plan summary: {}\n\
         - Detected at: {}\n\
         - Payload sha256: `{}`\n",
        plan.environment,
        summary,
        Utc::now().to_rfc3339(),
        plan.payload_digest,
    );
    if plan.truncated {
        body.push_str("- Diff truncated; run a plan locally for the full output.\n");
    }
    body.push_str("\n```diff\n");
    body.push_str(&plan.payload);
    body.push_str("\n```\n");
    body
}

pub struct DriftReconciler {
    executor: PlanExecutor,
    tracker: IncidentTracker,
    auto_close: bool,
}

impl DriftReconciler {
    pub fn new(executor: PlanExecutor, tracker: IncidentTracker) -> Self {
        Self {
            executor,
            tracker,
            auto_close: false,
        }
    }

    /// Close the open drift incident when a later check is in sync.
    pub fn with_auto_close(mut self, auto_close: bool) -> Self {
        self.auto_close = auto_close;
        self
    }

    pub async fn reconcile(&self, environment: &Environment) -> Result<DriftOutcome> {
        let plan = self.executor.plan(environment).await?;
        let key = IncidentKey::drift(environment.id.as_str());

        match plan.outcome {
            PlanOutcome::NoChanges => {
                let closed = if self.auto_close {
                    self.tracker.close(&key).await?
                } else {
                    Vec::new()
                };
                Ok(DriftOutcome::InSync { closed })
            }
            PlanOutcome::ChangesPending => {
                METRICS.inc_drift_detected();
                let opened = self
                    .tracker
                    .open_or_skip(&key, &drift_title(&environment.id), &drift_body(&plan))
                    .await?;
                obs::emit_drift_detected(
                    environment.id.as_str(),
                    &opened.incident.id,
                    opened.created,
                );
                Ok(DriftOutcome::Drifted {
                    incident: opened.incident,
                    created: opened.created,
                    plan,
                })
            }
            PlanOutcome::Failed => {
                warn!(
                    environment = %environment.id,
                    exit_code = plan.exit_code,
                    "drift check plan failed; no incident opened"
                );
                Ok(DriftOutcome::PlanFailed { plan })
            }
        }
    }

    /// Check every environment concurrently. One failure does not stop the others.
    pub async fn reconcile_all(&self, environments: &[Environment]) -> Vec<DriftReport> {
        join_all(environments.iter().map(|env| async move {
            DriftReport {
                environment: env.id.clone(),
                result: self.reconcile(env).await,
            }
        }))
        .await
    }
}
