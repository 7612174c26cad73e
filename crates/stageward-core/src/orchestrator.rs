//! Sequential promotion across ordered environments.
//!
//! [`PromotionOrchestrator`] validates a request up front, then walks the
//! selected environments in position order. A stage runs only while every
//! earlier stage ended `Success` or `Skipped`; after a failure the remaining
//! stages are marked `Skipped(UpstreamFailed)` without touching the engine.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use stageward_state::StateLock;
use tracing::warn;

use crate::domain::{
    Action, CoreError, Environment, EnvironmentId, PlanOutcome, PlanResult, PromotionRun, Result,
    SkipReason, StageFailure, StageState, ValidationError,
};
use crate::engine::InfraEngine;
use crate::metrics::METRICS;
use crate::obs::{self, RunSpan};
use crate::plan_executor::{engine_result, truncate_payload, ExitCodePolicy, PlanExecutor};
use crate::retry::{retry_on_lock, LockRetryPolicy};

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation, checked before each stage starts.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// What the trigger asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionRequest {
    pub action: Action,
    /// Target environments; executed in position order regardless of order here.
    pub environments: Vec<EnvironmentId>,
    /// Confirmation tokens supplied by the operator.
    pub confirmations: Vec<String>,
}

impl PromotionRequest {
    pub fn new(action: Action, environments: impl IntoIterator<Item = EnvironmentId>) -> Self {
        Self {
            action,
            environments: environments.into_iter().collect(),
            confirmations: Vec::new(),
        }
    }

    pub fn with_confirmation(mut self, token: impl Into<String>) -> Self {
        self.confirmations.push(token.into());
        self
    }

    fn confirms(&self, environment: &EnvironmentId) -> bool {
        self.confirmations.iter().any(|c| c == environment.as_str())
    }

    fn supplied(&self) -> Option<String> {
        if self.confirmations.is_empty() {
            None
        } else {
            Some(self.confirmations.join(","))
        }
    }
}

/// Whether `action` on `environment` needs an explicit confirmation token.
pub fn requires_confirmation(action: Action, environment: &Environment) -> bool {
    match action {
        Action::Destroy => true,
        Action::Apply => environment.requires_confirmation,
        Action::Plan => false,
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

enum StageEnd {
    Success,
    NoChanges,
}

pub struct PromotionOrchestrator {
    executor: PlanExecutor,
    lock: Arc<dyn StateLock>,
    environments: Vec<Environment>,
    cancel: CancellationFlag,
    owner: String,
}

impl PromotionOrchestrator {
    pub fn new(
        engine: Arc<dyn InfraEngine>,
        lock: Arc<dyn StateLock>,
        mut environments: Vec<Environment>,
    ) -> Self {
        environments.sort_by_key(|e| e.position);
        Self {
            executor: PlanExecutor::new(engine),
            lock,
            environments,
            cancel: CancellationFlag::new(),
            owner: default_owner(),
        }
    }

    pub fn with_retry_policy(mut self, policy: LockRetryPolicy) -> Self {
        self.executor = self.executor.with_retry_policy(policy);
        self
    }

    pub fn with_exit_codes(mut self, exit_codes: ExitCodePolicy) -> Self {
        self.executor = self.executor.with_exit_codes(exit_codes);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Lock owner recorded by the state lock; defaults to `user@host`.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn environments(&self) -> &[Environment] {
        &self.environments
    }

    pub fn environment(&self, id: &str) -> Option<&Environment> {
        self.environments.iter().find(|e| e.id.as_str() == id)
    }

    /// Resolve and check the whole request. No side effects.
    ///
    /// Returns the targets in promotion order.
    pub fn validate(
        &self,
        request: &PromotionRequest,
    ) -> std::result::Result<Vec<&Environment>, ValidationError> {
        if request.environments.is_empty() {
            return Err(ValidationError::NoEnvironments);
        }
        if request.action == Action::Destroy && request.environments.len() != 1 {
            return Err(ValidationError::UnsupportedAction {
                action: request.action.to_string(),
                count: request.environments.len(),
            });
        }

        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(request.environments.len());
        for id in &request.environments {
            if !seen.insert(id.clone()) {
                return Err(ValidationError::DuplicateEnvironment(id.to_string()));
            }
            let env = self
                .environment(id.as_str())
                .ok_or_else(|| ValidationError::UnknownEnvironment(id.to_string()))?;
            targets.push(env);
        }
        targets.sort_by_key(|e| e.position);

        for env in &targets {
            if requires_confirmation(request.action, env) && !request.confirms(&env.id) {
                return Err(ValidationError::ConfirmationMismatch {
                    environment: env.id.to_string(),
                    supplied: request.supplied(),
                });
            }
        }
        Ok(targets)
    }

    /// Execute a promotion run.
    ///
    /// Only validation errors are returned as `Err`; stage failures are
    /// recorded in the returned run.
    pub async fn run(&self, request: &PromotionRequest) -> Result<PromotionRun> {
        let targets = self.validate(request)?;
        let run = PromotionRun::new(request.action, targets.iter().map(|e| e.id.clone()));
        let run_id = run.run_id.to_string();
        RunSpan::new(&run_id)
            .scope(self.run_stages(&targets, run))
            .await
    }

    async fn run_stages(
        &self,
        targets: &[&Environment],
        mut run: PromotionRun,
    ) -> Result<PromotionRun> {
        let action = run.action;
        let run_id = run.run_id.to_string();
        let names: Vec<String> = targets.iter().map(|e| e.id.to_string()).collect();
        obs::emit_run_started(&run_id, action.as_str(), &names);
        let started = std::time::Instant::now();

        let mut upstream_failed = false;
        let mut cancelled = false;
        for (env, stage) in targets.iter().zip(run.stages.iter_mut()) {
            if upstream_failed {
                stage.skip(SkipReason::UpstreamFailed)?;
                obs::emit_stage_finished(env.id.as_str(), "skipped", Some("upstream_failed"));
                continue;
            }
            if cancelled || self.cancel.is_cancelled() {
                cancelled = true;
                stage.skip(SkipReason::Cancelled)?;
                obs::emit_stage_finished(env.id.as_str(), "skipped", Some("cancelled"));
                continue;
            }

            stage.transition(StageState::Running)?;
            obs::emit_stage_started(env.id.as_str(), action.as_str());

            let mut plan = None;
            let result = self.execute_stage(env, action, &mut plan).await;
            stage.plan = plan;
            match result {
                Ok(StageEnd::Success) => {
                    stage.transition(StageState::Success)?;
                    obs::emit_stage_finished(env.id.as_str(), "success", None);
                }
                Ok(StageEnd::NoChanges) => {
                    stage.skip(SkipReason::NoChanges)?;
                    obs::emit_stage_finished(env.id.as_str(), "skipped", Some("no_changes"));
                }
                Err(err) => {
                    let message = err.to_string();
                    stage.fail(StageFailure::from_error(&err))?;
                    obs::emit_stage_finished(env.id.as_str(), "failed", Some(&message));
                    upstream_failed = true;
                }
            }
        }

        run.finish();
        obs::emit_run_finished(
            &run_id,
            run.status.as_str(),
            started.elapsed().as_millis() as u64,
        );
        Ok(run)
    }

    /// Lock, run, unlock. A failed release is logged and does not change the outcome.
    async fn execute_stage(
        &self,
        env: &Environment,
        action: Action,
        plan: &mut Option<PlanResult>,
    ) -> Result<StageEnd> {
        let id = env.id.as_str();
        let guard = retry_on_lock(id, self.executor.retry_policy(), || async {
            self.lock
                .acquire(id, &self.owner)
                .await
                .map_err(CoreError::from)
        })
        .await?;

        let result = self.run_locked(env, action, plan).await;

        if let Err(err) = self.lock.release(guard).await {
            warn!(environment = %id, error = %err, "failed to release state lock");
        }
        result
    }

    async fn run_locked(
        &self,
        env: &Environment,
        action: Action,
        plan_slot: &mut Option<PlanResult>,
    ) -> Result<StageEnd> {
        if action == Action::Destroy {
            return self.mutate(env, action).await.map(|()| StageEnd::Success);
        }

        let plan = self.executor.plan(env).await?;
        let outcome = plan.outcome;
        let exit_code = plan.exit_code;
        let diagnostic = plan.payload.clone();
        *plan_slot = Some(plan);

        match (action, outcome) {
            (_, PlanOutcome::Failed) => Err(CoreError::PlanFailed {
                environment: env.id.to_string(),
                exit_code,
                diagnostic,
            }),
            (Action::Plan, _) => Ok(StageEnd::Success),
            (_, PlanOutcome::NoChanges) => Ok(StageEnd::NoChanges),
            (_, PlanOutcome::ChangesPending) => {
                self.mutate(env, action).await.map(|()| StageEnd::Success)
            }
        }
    }

    /// Apply or destroy. Lock contention reported by the engine is retried.
    async fn mutate(&self, env: &Environment, action: Action) -> Result<()> {
        let id = env.id.as_str();
        let output = retry_on_lock(id, self.executor.retry_policy(), || async {
            let engine = self.executor.engine();
            let result = match action {
                Action::Destroy => engine.destroy(env).await,
                _ => engine.apply_diff(env).await,
            };
            engine_result(env, result)
        })
        .await?;
        METRICS.inc_applies();

        if output.success() {
            return Ok(());
        }
        let (diagnostic, _) = truncate_payload(&output.combined());
        let environment = env.id.to_string();
        let exit_code = output.exit_code;
        Err(match action {
            Action::Destroy => CoreError::DestroyFailed {
                environment,
                exit_code,
                diagnostic,
            },
            _ => CoreError::ApplyFailed {
                environment,
                exit_code,
                diagnostic,
            },
        })
    }
}

fn default_owner() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "stageward".to_string());
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{user}@{host}")
}
