//! Dry-run execution and classification.
//!
//! The executor asks the engine for a diff, classifies the exit code, and
//! bounds the payload so it fits in an incident body or a run report.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::domain::{
    CoreError, Environment, EnvironmentId, PlanOutcome, PlanResult, PlanSummary, Result,
};
use crate::engine::{EngineError, EngineOutput, InfraEngine};
use crate::metrics::METRICS;
use crate::obs;
use crate::retry::{retry_on_lock, LockRetryPolicy};

/// Payload bound, in characters.
pub const MAX_PAYLOAD_CHARS: usize = 65_000;

/// Appended to a payload cut at [`MAX_PAYLOAD_CHARS`].
pub const TRUNCATION_MARKER: &str = "\n\n... (truncated)";

/// Exit code of a killed or timed-out engine process.
pub const KILLED_EXIT_CODE: i32 = -1;

/// Cut `payload` to [`MAX_PAYLOAD_CHARS`] characters plus the marker.
///
/// Returns the payload and whether it was truncated. Never splits a character.
pub fn truncate_payload(payload: &str) -> (String, bool) {
    match payload.char_indices().nth(MAX_PAYLOAD_CHARS) {
        None => (payload.to_string(), false),
        Some((cut, _)) => {
            let mut out = String::with_capacity(cut + TRUNCATION_MARKER.len());
            out.push_str(&payload[..cut]);
            out.push_str(TRUNCATION_MARKER);
            (out, true)
        }
    }
}

/// How the engine signals a dry-run with differences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodePolicy {
    /// Terraform's `-detailed-exitcode` uses 2.
    pub changes_exit_code: i32,
}

impl Default for ExitCodePolicy {
    fn default() -> Self {
        Self {
            changes_exit_code: 2,
        }
    }
}

/// 0 is no changes, the distinguished code is pending changes, anything else failed.
pub fn classify(exit_code: i32, policy: ExitCodePolicy) -> PlanOutcome {
    if exit_code == 0 {
        PlanOutcome::NoChanges
    } else if exit_code == policy.changes_exit_code {
        PlanOutcome::ChangesPending
    } else {
        PlanOutcome::Failed
    }
}

fn summary_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"Plan: (?:(\d+) to import, )?(\d+) to add, (\d+) to change, (\d+) to destroy\.",
        )
        .ok()
    })
    .as_ref()
}

/// Scrape the `Plan: N to add, N to change, N to destroy.` line, if present.
pub fn parse_plan_summary(text: &str) -> Option<PlanSummary> {
    let caps = summary_regex()?.captures(text)?;
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
    Some(PlanSummary {
        import: num(1),
        add: num(2)?,
        change: num(3)?,
        destroy: num(4)?,
    })
}

pub fn payload_digest(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

/// Build a [`PlanResult`] from raw engine output.
pub fn build_plan_result(
    environment: &EnvironmentId,
    output: &EngineOutput,
    policy: ExitCodePolicy,
) -> PlanResult {
    let outcome = classify(output.exit_code, policy);
    let raw = match outcome {
        PlanOutcome::Failed => output.combined(),
        _ => output.stdout.clone(),
    };
    let (payload, truncated) = truncate_payload(&raw);
    PlanResult {
        environment: environment.clone(),
        outcome,
        summary: parse_plan_summary(&output.stdout),
        payload_digest: payload_digest(&raw),
        payload,
        truncated,
        exit_code: output.exit_code,
        duration_ms: output.duration_ms,
    }
}

/// Map an engine failure onto the domain taxonomy.
///
/// Timeouts become a killed-process output so callers classify them as a
/// failed run rather than an engine that never started.
pub(crate) fn engine_result(
    environment: &Environment,
    result: std::result::Result<EngineOutput, EngineError>,
) -> Result<EngineOutput> {
    match result {
        Ok(output) => Ok(output),
        Err(EngineError::Timeout { secs }) => Ok(EngineOutput {
            exit_code: KILLED_EXIT_CODE,
            stdout: String::new(),
            stderr: format!("engine timed out after {secs}s and was killed"),
            duration_ms: secs.saturating_mul(1000),
        }),
        Err(EngineError::LockUnavailable { holder }) => Err(CoreError::LockUnavailable {
            environment: environment.id.to_string(),
            holder,
        }),
        Err(EngineError::Unavailable(reason)) => Err(CoreError::Execution {
            environment: environment.id.to_string(),
            reason,
        }),
    }
}

/// Runs dry-runs against one engine.
#[derive(Clone)]
pub struct PlanExecutor {
    engine: Arc<dyn InfraEngine>,
    retry: LockRetryPolicy,
    exit_codes: ExitCodePolicy,
}

impl PlanExecutor {
    pub fn new(engine: Arc<dyn InfraEngine>) -> Self {
        Self {
            engine,
            retry: LockRetryPolicy::default(),
            exit_codes: ExitCodePolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: LockRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_exit_codes(mut self, exit_codes: ExitCodePolicy) -> Self {
        self.exit_codes = exit_codes;
        self
    }

    pub fn engine(&self) -> &Arc<dyn InfraEngine> {
        &self.engine
    }

    pub fn retry_policy(&self) -> &LockRetryPolicy {
        &self.retry
    }

    /// Dry-run `environment`.
    ///
    /// Errors only when the engine could not run or its state lock stayed
    /// held past the retry bound; a plan that reports failure is an
    /// `Ok(PlanResult)` with `PlanOutcome::Failed`.
    pub async fn plan(&self, environment: &Environment) -> Result<PlanResult> {
        let output = retry_on_lock(environment.id.as_str(), &self.retry, || async {
            engine_result(environment, self.engine.compute_diff(environment).await)
        })
        .await?;
        METRICS.inc_plans();

        let result = build_plan_result(&environment.id, &output, self.exit_codes);
        obs::emit_plan_classified(
            environment.id.as_str(),
            result.outcome.as_str(),
            result.exit_code,
            result.truncated,
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{changes_output, EngineOp, ScriptedEngine};

    fn env(id: &str) -> Environment {
        Environment::new(id, 0, format!("environments/{id}"))
    }

    #[test]
    fn long_payload_is_cut_to_bound_plus_marker() {
        let payload = "x".repeat(70_000);
        let (out, truncated) = truncate_payload(&payload);
        assert!(truncated);
        assert_eq!(out.chars().count(), MAX_PAYLOAD_CHARS + TRUNCATION_MARKER.chars().count());
        assert!(out.ends_with(TRUNCATION_MARKER));
        assert_eq!(&out[..MAX_PAYLOAD_CHARS], &payload[..MAX_PAYLOAD_CHARS]);
    }

    #[test]
    fn short_payload_is_unchanged() {
        let payload = "y".repeat(1_000);
        let (out, truncated) = truncate_payload(&payload);
        assert!(!truncated);
        assert_eq!(out, payload);
    }

    #[test]
    fn payload_at_bound_is_unchanged() {
        let payload = "z".repeat(MAX_PAYLOAD_CHARS);
        assert_eq!(truncate_payload(&payload), (payload, false));
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let payload = "é".repeat(MAX_PAYLOAD_CHARS + 10);
        let (out, truncated) = truncate_payload(&payload);
        assert!(truncated);
        let kept: String = out.chars().take(MAX_PAYLOAD_CHARS).collect();
        assert_eq!(kept, "é".repeat(MAX_PAYLOAD_CHARS));
        assert_eq!(&out[kept.len()..], TRUNCATION_MARKER);
    }

    #[test]
    fn exit_codes_classify() {
        let p = ExitCodePolicy::default();
        assert_eq!(classify(0, p), PlanOutcome::NoChanges);
        assert_eq!(classify(2, p), PlanOutcome::ChangesPending);
        assert_eq!(classify(1, p), PlanOutcome::Failed);
        assert_eq!(classify(KILLED_EXIT_CODE, p), PlanOutcome::Failed);

        let custom = ExitCodePolicy {
            changes_exit_code: 3,
        };
        assert_eq!(classify(2, custom), PlanOutcome::Failed);
        assert_eq!(classify(3, custom), PlanOutcome::ChangesPending);
    }

    #[test]
    fn parses_summary_with_and_without_imports() {
        let s = parse_plan_summary("...\nPlan: 1 to add, 2 to change, 3 to destroy.\n").unwrap();
        assert_eq!((s.import, s.add, s.change, s.destroy), (None, 1, 2, 3));

        let s = parse_plan_summary("Plan: 4 to import, 0 to add, 1 to change, 0 to destroy.")
            .unwrap();
        assert_eq!(s.import, Some(4));
        assert_eq!(s.to_string(), "4 to import, 0 to add, 1 to change, 0 to destroy");

        assert!(
            parse_plan_summary("No changes. Your infrastructure matches the configuration.")
                .is_none()
        );
    }

    #[tokio::test]
    async fn plan_classifies_pending_changes() {
        let engine = Arc::new(ScriptedEngine::new().with_changes("dev"));
        let executor = PlanExecutor::new(engine.clone());
        let result = executor.plan(&env("dev")).await.unwrap();
        assert_eq!(result.outcome, PlanOutcome::ChangesPending);
        assert_eq!(result.summary.map(|s| s.add), Some(1));
        assert_eq!(result.payload_digest.len(), 64);
        assert_eq!(engine.ops_for("dev"), vec![EngineOp::Diff]);
    }

    #[tokio::test]
    async fn failed_plan_is_a_result_with_stderr_in_payload() {
        let engine = ScriptedEngine::new();
        engine.on(
            "dev",
            EngineOp::Diff,
            Ok(EngineOutput::new(1, "", "Error: Invalid provider configuration")),
        );
        let executor = PlanExecutor::new(Arc::new(engine));
        let result = executor.plan(&env("dev")).await.unwrap();
        assert!(result.is_failed());
        assert!(result.payload.contains("Invalid provider configuration"));
    }

    #[tokio::test]
    async fn unavailable_engine_is_an_execution_error() {
        let engine = ScriptedEngine::new();
        engine.on(
            "dev",
            EngineOp::Diff,
            Err(EngineError::Unavailable("terraform: not found".to_string())),
        );
        let err = PlanExecutor::new(Arc::new(engine))
            .plan(&env("dev"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Execution { .. }));
    }

    #[tokio::test]
    async fn timeout_is_a_failed_plan() {
        let engine = ScriptedEngine::new();
        engine.on("dev", EngineOp::Diff, Err(EngineError::Timeout { secs: 900 }));
        let result = PlanExecutor::new(Arc::new(engine))
            .plan(&env("dev"))
            .await
            .unwrap();
        assert_eq!(result.outcome, PlanOutcome::Failed);
        assert_eq!(result.exit_code, KILLED_EXIT_CODE);
    }

    #[tokio::test(start_paused = true)]
    async fn engine_lock_contention_is_retried() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.push(
            "prod",
            EngineOp::Diff,
            Err(EngineError::LockUnavailable {
                holder: Some("other-run".to_string()),
            }),
        );
        engine.on("prod", EngineOp::Diff, Ok(changes_output(0, 1, 0)));
        let result = PlanExecutor::new(engine.clone())
            .plan(&env("prod"))
            .await
            .unwrap();
        assert!(result.has_changes());
        assert_eq!(engine.ops_for("prod").len(), 2);
    }
}
