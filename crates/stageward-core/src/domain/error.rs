//! Domain-level error taxonomy for Stageward.

use stageward_state::StorageError;

/// Errors detected before any side effect. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("confirmation for {environment} does not match (got {supplied:?})")]
    ConfirmationMismatch {
        environment: String,
        supplied: Option<String>,
    },

    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),

    #[error("no environments selected")]
    NoEnvironments,

    #[error("duplicate environment: {0}")]
    DuplicateEnvironment(String),

    #[error("{action} targets one environment at a time, got {count}")]
    UnsupportedAction { action: String, count: usize },

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

/// Stageward domain errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("state lock for {environment} is held{}", .holder.as_deref().map(|h| format!(" by {h}")).unwrap_or_default())]
    LockUnavailable {
        environment: String,
        holder: Option<String>,
    },

    #[error("timed out after {waited_secs}s waiting for the state lock on {environment}")]
    LockTimeout {
        environment: String,
        waited_secs: u64,
    },

    #[error("engine could not run for {environment}: {reason}")]
    Execution { environment: String, reason: String },

    #[error("plan failed for {environment} (exit code {exit_code})")]
    PlanFailed {
        environment: String,
        exit_code: i32,
        diagnostic: String,
    },

    #[error("apply failed for {environment} (exit code {exit_code})")]
    ApplyFailed {
        environment: String,
        exit_code: i32,
        diagnostic: String,
    },

    #[error("destroy failed for {environment} (exit code {exit_code})")]
    DestroyFailed {
        environment: String,
        exit_code: i32,
        diagnostic: String,
    },

    #[error("invalid stage transition for {environment}: {from} -> {to}")]
    InvalidTransition {
        environment: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Process exit code: 1 for operator/config errors, 2 for engine and backend failures.
    pub fn exit_code(&self) -> u8 {
        match self {
            CoreError::Validation(_) => 1,
            _ => 2,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::LockUnavailable { .. })
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::LockUnavailable {
                environment,
                holder,
            } => CoreError::LockUnavailable {
                environment,
                holder,
            },
            other => CoreError::Storage(other),
        }
    }
}

/// Result type for Stageward domain operations.
pub type Result<T> = std::result::Result<T, CoreError>;
