//! Domain types for Stageward.
//!
//! Environments are fixed at configuration time; change sets, plan results
//! and promotion runs are created per invocation.

pub mod changeset;
pub mod environment;
pub mod error;
pub mod plan;
pub mod run;

pub use changeset::ChangeSet;
pub use environment::{Environment, EnvironmentId, VarValue};
pub use error::{CoreError, Result, ValidationError};
pub use plan::{PlanOutcome, PlanResult, PlanSummary};
pub use run::{
    Action, FailureKind, PromotionRun, RunStatus, SkipReason, StageFailure, StageRecord,
    StageState,
};

pub use stageward_state::{IncidentKey, IncidentRecord as Incident, IncidentState};
