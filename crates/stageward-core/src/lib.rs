//! Stageward Core Library
//!
//! Promotion and drift control logic for infrastructure-as-code
//! repositories: which environments a change touches, sequential
//! plan/apply across them, and deduplicated drift incidents.
//!
//! The IaC engine sits behind [`engine::InfraEngine`]; incidents and state
//! locks sit behind the `stageward-state` traits.

pub mod change_detector;
pub mod config;
pub mod domain;
pub mod drift;
pub mod engine;
pub mod incident;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod plan_executor;
pub mod retry;
pub mod telemetry;
pub mod testing;

pub use change_detector::{
    detect, detect_detailed, detect_ordered, Detection, EnvironmentFilters, PathFilter,
};
pub use config::{IncidentBackend, LockBackend, StagewardConfig, DEFAULT_CONFIG_FILE};
pub use domain::{
    Action, ChangeSet, CoreError, Environment, EnvironmentId, FailureKind, Incident, IncidentKey,
    IncidentState, PlanOutcome, PlanResult, PlanSummary, PromotionRun, Result, RunStatus,
    SkipReason, StageFailure, StageRecord, StageState, ValidationError, VarValue,
};
pub use drift::{DriftOutcome, DriftReconciler, DriftReport};
pub use engine::{EngineError, EngineOutput, InfraEngine};
pub use incident::{IncidentTracker, OpenOutcome};
pub use orchestrator::{CancellationFlag, PromotionOrchestrator, PromotionRequest};
pub use plan_executor::{
    truncate_payload, ExitCodePolicy, PlanExecutor, MAX_PAYLOAD_CHARS, TRUNCATION_MARKER,
};
pub use retry::LockRetryPolicy;
