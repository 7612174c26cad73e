//! Storage trait definitions for Stageward
//!
//! These traits define the durable boundaries of the controller:
//! - `IncidentStore`: incident records keyed by (environment, category)
//! - `StateLock`: exclusive per-environment lock shared across runs
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// IncidentStore: deduplicated incident records
// ---------------------------------------------------------------------------

/// Label prefix carrying the environment of an incident.
pub const ENV_LABEL_PREFIX: &str = "env:";

/// Deduplication key of an incident.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IncidentKey {
    /// Environment identifier (e.g. "prod")
    pub environment: String,
    /// Incident category (e.g. "drift")
    pub category: String,
}

impl IncidentKey {
    pub fn new(environment: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            category: category.into(),
        }
    }

    /// The drift key for an environment.
    pub fn drift(environment: impl Into<String>) -> Self {
        Self::new(environment, "drift")
    }

    /// The label set identifying this key in label-based stores.
    ///
    /// Always `[category, "env:<environment>"]`, in that order.
    pub fn labels(&self) -> Vec<String> {
        vec![
            self.category.clone(),
            format!("{}{}", ENV_LABEL_PREFIX, self.environment),
        ]
    }

    /// Stable string form, usable as a record id.
    pub fn as_id(&self) -> String {
        format!("{}/{}", self.environment, self.category)
    }

    /// Parse the form produced by [`IncidentKey::as_id`].
    pub fn parse_id(s: &str) -> Option<Self> {
        let (environment, category) = s.split_once('/')?;
        if environment.is_empty() || category.is_empty() {
            return None;
        }
        Some(Self::new(environment, category))
    }
}

impl std::fmt::Display for IncidentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.environment, self.category)
    }
}

/// Lifecycle state of an incident
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentState {
    Open,
    Closed,
}

impl IncidentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentState::Open => "open",
            IncidentState::Closed => "closed",
        }
    }
}

/// A stored incident
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    /// Store-assigned identifier (issue number, UUID, ...)
    pub id: String,
    /// Deduplication key
    pub key: IncidentKey,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub state: IncidentState,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Link to the incident in an external tracker, if any
    pub url: Option<String>,
}

impl IncidentRecord {
    pub fn is_open(&self) -> bool {
        self.state == IncidentState::Open
    }
}

/// Request to create an incident
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIncident {
    pub key: IncidentKey,
    pub title: String,
    pub body: String,
    /// Full label set; must include `key.labels()`
    pub labels: Vec<String>,
}

impl NewIncident {
    /// Build a request whose labels are the key labels plus `extra_labels`.
    pub fn new(
        key: IncidentKey,
        title: impl Into<String>,
        body: impl Into<String>,
        extra_labels: &[String],
    ) -> Self {
        let mut labels = key.labels();
        for label in extra_labels {
            if !labels.contains(label) {
                labels.push(label.clone());
            }
        }
        Self {
            key,
            title: title.into(),
            body: body.into(),
            labels,
        }
    }
}

/// Incident store.
///
/// Guarantees:
/// - `list_open_by_labels` returns only open incidents carrying every label,
///   oldest first.
/// - `create_if_absent` never creates a second open incident for a key when
///   calls are serialized. Backends that can check-and-create atomically
///   override it and report `supports_atomic_create() == true`.
#[async_trait]
pub trait IncidentStore: Send + Sync {
    /// List open incidents that carry every label in `labels`.
    async fn list_open_by_labels(&self, labels: &[String]) -> StorageResult<Vec<IncidentRecord>>;

    /// Create an open incident unconditionally.
    async fn create(&self, incident: NewIncident) -> StorageResult<IncidentRecord>;

    /// Close an incident by id.
    async fn close(&self, id: &str) -> StorageResult<IncidentRecord>;

    /// Create an incident unless one is already open for its key.
    ///
    /// Returns the open incident and whether it was created by this call.
    /// The default body is check-then-create and has a race window between
    /// the two calls.
    async fn create_if_absent(
        &self,
        incident: NewIncident,
    ) -> StorageResult<(IncidentRecord, bool)> {
        let existing = self.list_open_by_labels(&incident.key.labels()).await?;
        if let Some(open) = existing.into_iter().next() {
            return Ok((open, false));
        }
        let created = self.create(incident).await?;
        Ok((created, true))
    }

    /// Whether `create_if_absent` is atomic in this backend.
    fn supports_atomic_create(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// StateLock: per-environment mutual exclusion
// ---------------------------------------------------------------------------

/// Proof of a held environment lock. Pass it back to `release`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockGuard {
    pub environment: String,
    /// Human-readable owner (run id, hostname, ...)
    pub owner: String,
    /// Unique token for this acquisition
    pub token: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockGuard {
    pub fn new(environment: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            owner: owner.into(),
            token: uuid::Uuid::new_v4().to_string(),
            acquired_at: Utc::now(),
        }
    }
}

/// State lock keyed by environment.
///
/// Semantics:
/// - `acquire` either returns a guard or fails with
///   `StorageError::LockUnavailable` immediately; callers own retry/backoff.
/// - `release` must be given the guard returned by `acquire`.
#[async_trait]
pub trait StateLock: Send + Sync {
    async fn acquire(&self, environment: &str, owner: &str) -> StorageResult<LockGuard>;

    async fn release(&self, guard: LockGuard) -> StorageResult<()>;
}
