//! Stageward-State: persistence boundaries for the promotion controller
//!
//! Everything that must survive a single invocation lives behind the traits
//! in [`storage_traits`]: drift incidents and per-environment state locks.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: at-most-one-open incidents and exclusive environment locks.
//!
//! ## Key Components
//!
//! - `IncidentStore`: list/create/close incidents keyed by (environment, category)
//! - `StateLock`: acquire/release an exclusive lock per environment
//! - `SurrealIncidentStore`: SurrealDB-backed incident store (embedded or remote)
//! - `GithubIssueStore`: GitHub issues as the incident store
//! - `FileStateLock`: lock files under a shared directory

mod error;
pub mod fakes;
pub mod file_lock;
pub mod github;
mod migrations;
pub mod storage_traits;
pub mod surreal_incidents;

pub use error::StorageError;
pub use file_lock::{FileStateLock, NoopStateLock};
pub use github::{GithubConfig, GithubIssueStore};
pub use storage_traits::{
    IncidentKey, IncidentRecord, IncidentState, IncidentStore, LockGuard, NewIncident, StateLock,
    StorageResult,
};
pub use surreal_incidents::SurrealIncidentStore;
