//! Error types for stageward-state

use thiserror::Error;

/// Errors raised by incident stores and state locks.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Incident not found
    #[error("Incident not found: {id}")]
    IncidentNotFound { id: String },

    /// An open incident already exists for the key
    #[error("Open incident already exists for {key}")]
    AlreadyOpen { key: String },

    /// The environment lock is held by another run
    #[error("State lock for {environment} is held by {}", .holder.as_deref().unwrap_or("another run"))]
    LockUnavailable {
        environment: String,
        holder: Option<String>,
    },

    /// Release was attempted with a guard that no longer owns the lock
    #[error("State lock for {environment} is not held by token {token}")]
    LockNotHeld { environment: String, token: String },

    /// Backend connection error
    #[error("Backend connection failed: {0}")]
    Connection(String),

    /// Backend query or write error
    #[error("Backend error: {0}")]
    Backend(String),

    /// Remote API error (issue tracker)
    #[error("HTTP error: {0}")]
    Http(String),

    /// IO error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::LockUnavailable { .. })
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        StorageError::Http(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unavailable_names_holder() {
        let err = StorageError::LockUnavailable {
            environment: "prod".to_string(),
            holder: Some("run-42".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("prod"));
        assert!(msg.contains("run-42"));
        assert!(err.is_retryable());
    }

    #[test]
    fn lock_unavailable_without_holder() {
        let err = StorageError::LockUnavailable {
            environment: "dev".to_string(),
            holder: None,
        };
        assert!(err.to_string().contains("another run"));
    }

    #[test]
    fn backend_errors_are_not_retryable() {
        assert!(!StorageError::Backend("boom".to_string()).is_retryable());
    }
}
