//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryIncidentStore` and `MemoryStateLock` that satisfy the
//! trait contracts without any external dependencies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryIncidentStore
// ---------------------------------------------------------------------------

/// In-memory incident store backed by a `Vec` in creation order.
#[derive(Debug, Default)]
pub struct MemoryIncidentStore {
    incidents: Mutex<Vec<IncidentRecord>>,
    next_id: AtomicU64,
    create_calls: AtomicU64,
}

impl MemoryIncidentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every incident ever stored, open and closed.
    pub fn all(&self) -> Vec<IncidentRecord> {
        self.incidents.lock().unwrap().clone()
    }

    /// Number of incidents actually created.
    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Ordering::Relaxed)
    }

    fn insert(&self, incidents: &mut Vec<IncidentRecord>, incident: NewIncident) -> IncidentRecord {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.create_calls.fetch_add(1, Ordering::Relaxed);
        let record = IncidentRecord {
            id: id.to_string(),
            key: incident.key,
            title: incident.title,
            body: incident.body,
            labels: incident.labels,
            state: IncidentState::Open,
            created_at: Utc::now(),
            closed_at: None,
            url: None,
        };
        incidents.push(record.clone());
        record
    }
}

fn carries_all(record: &IncidentRecord, labels: &[String]) -> bool {
    labels.iter().all(|l| record.labels.contains(l))
}

#[async_trait]
impl IncidentStore for MemoryIncidentStore {
    async fn list_open_by_labels(&self, labels: &[String]) -> StorageResult<Vec<IncidentRecord>> {
        let incidents = self.incidents.lock().unwrap();
        Ok(incidents
            .iter()
            .filter(|r| r.is_open() && carries_all(r, labels))
            .cloned()
            .collect())
    }

    async fn create(&self, incident: NewIncident) -> StorageResult<IncidentRecord> {
        let mut incidents = self.incidents.lock().unwrap();
        Ok(self.insert(&mut incidents, incident))
    }

    async fn close(&self, id: &str) -> StorageResult<IncidentRecord> {
        let mut incidents = self.incidents.lock().unwrap();
        let record = incidents
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StorageError::IncidentNotFound { id: id.to_string() })?;
        if record.is_open() {
            record.state = IncidentState::Closed;
            record.closed_at = Some(Utc::now());
        }
        Ok(record.clone())
    }

    async fn create_if_absent(
        &self,
        incident: NewIncident,
    ) -> StorageResult<(IncidentRecord, bool)> {
        // Check and insert under one lock acquisition.
        let mut incidents = self.incidents.lock().unwrap();
        let key_labels = incident.key.labels();
        if let Some(open) = incidents
            .iter()
            .find(|r| r.is_open() && carries_all(r, &key_labels))
        {
            return Ok((open.clone(), false));
        }
        let created = self.insert(&mut incidents, incident);
        Ok((created, true))
    }

    fn supports_atomic_create(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// MemoryStateLock
// ---------------------------------------------------------------------------

/// In-memory state lock backed by a `HashMap<environment, LockGuard>`.
#[derive(Debug, Default)]
pub struct MemoryStateLock {
    held: Mutex<HashMap<String, LockGuard>>,
    acquire_attempts: AtomicU64,
}

impl MemoryStateLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any run currently holds the lock for `environment`.
    pub fn is_held(&self, environment: &str) -> bool {
        self.held.lock().unwrap().contains_key(environment)
    }

    /// Total `acquire` calls, successful or not.
    pub fn acquire_attempts(&self) -> u64 {
        self.acquire_attempts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl StateLock for MemoryStateLock {
    async fn acquire(&self, environment: &str, owner: &str) -> StorageResult<LockGuard> {
        self.acquire_attempts.fetch_add(1, Ordering::Relaxed);
        let mut held = self.held.lock().unwrap();
        if let Some(current) = held.get(environment) {
            return Err(StorageError::LockUnavailable {
                environment: environment.to_string(),
                holder: Some(current.owner.clone()),
            });
        }
        let guard = LockGuard::new(environment, owner);
        held.insert(environment.to_string(), guard.clone());
        Ok(guard)
    }

    async fn release(&self, guard: LockGuard) -> StorageResult<()> {
        let mut held = self.held.lock().unwrap();
        match held.get(&guard.environment) {
            Some(current) if current.token == guard.token => {
                held.remove(&guard.environment);
                Ok(())
            }
            _ => Err(StorageError::LockNotHeld {
                environment: guard.environment,
                token: guard.token,
            }),
        }
    }
}
