//! Structured observability hooks for promotion and drift lifecycle events.
//!
//! Events are emitted at `info!` level unless noted; filter with `RUST_LOG`.

use std::future::Future;

use tracing::{info, warn, Instrument};

/// Run-scoped tracing span. Everything inside [`RunSpan::scope`] carries `run_id`.
///
/// ```ignore
/// let run = RunSpan::new("6f1c...").scope(async { /* stages */ }).await;
/// ```
pub struct RunSpan {
    span: tracing::Span,
}

impl RunSpan {
    pub fn new(run_id: &str) -> Self {
        Self {
            span: tracing::info_span!("stageward.run", run_id = %run_id),
        }
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Drive `fut` inside the span without holding an entered guard across awaits.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        fut.instrument(self.span).await
    }
}

pub fn emit_run_started(run_id: &str, action: &str, environments: &[String]) {
    info!(
        event = "run.started",
        run_id = %run_id,
        action = %action,
        environments = %environments.join(","),
    );
}

pub fn emit_run_finished(run_id: &str, status: &str, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        status = %status,
        duration_ms = duration_ms,
    );
}

pub fn emit_stage_started(environment: &str, action: &str) {
    info!(event = "stage.started", environment = %environment, action = %action);
}

/// A stage reached a terminal state. Failures are logged at `warn!`.
pub fn emit_stage_finished(environment: &str, state: &str, detail: Option<&str>) {
    if state == "failed" {
        warn!(
            event = "stage.finished",
            environment = %environment,
            state = %state,
            detail = detail.unwrap_or(""),
        );
    } else {
        info!(
            event = "stage.finished",
            environment = %environment,
            state = %state,
            detail = detail.unwrap_or(""),
        );
    }
}

pub fn emit_plan_classified(environment: &str, outcome: &str, exit_code: i32, truncated: bool) {
    info!(
        event = "plan.classified",
        environment = %environment,
        outcome = %outcome,
        exit_code = exit_code,
        truncated = truncated,
    );
}

pub fn emit_lock_wait(environment: &str, attempt: u32, backoff_ms: u64) {
    warn!(
        event = "lock.wait",
        environment = %environment,
        attempt = attempt,
        backoff_ms = backoff_ms,
    );
}

pub fn emit_drift_detected(environment: &str, incident_id: &str, created: bool) {
    warn!(
        event = "drift.detected",
        environment = %environment,
        incident_id = %incident_id,
        created = created,
    );
}

pub fn emit_incident_closed(environment: &str, incident_id: &str) {
    info!(event = "incident.closed", environment = %environment, incident_id = %incident_id);
}
