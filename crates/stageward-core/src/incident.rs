//! Deduplicated incident tracking on top of an [`IncidentStore`].

use std::sync::Arc;

use stageward_state::{IncidentStore, NewIncident};
use tracing::debug;

use crate::domain::{Incident, IncidentKey, Result};
use crate::metrics::METRICS;
use crate::obs;

/// Result of [`IncidentTracker::open_or_skip`].
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOutcome {
    pub incident: Incident,
    /// False when an incident was already open for the key.
    pub created: bool,
}

/// Opens at most one incident per key and closes them on request.
#[derive(Clone)]
pub struct IncidentTracker {
    store: Arc<dyn IncidentStore>,
    extra_labels: Vec<String>,
}

impl IncidentTracker {
    pub fn new(store: Arc<dyn IncidentStore>) -> Self {
        Self {
            store,
            extra_labels: Vec::new(),
        }
    }

    /// Labels added to every incident on top of the key labels.
    pub fn with_extra_labels(mut self, labels: Vec<String>) -> Self {
        self.extra_labels = labels;
        self
    }

    pub fn store(&self) -> &Arc<dyn IncidentStore> {
        &self.store
    }

    /// Open an incident for `key` unless one is already open.
    ///
    /// When several are open (created by a racing run against a store
    /// without atomic create), the oldest is returned.
    pub async fn open_or_skip(
        &self,
        key: &IncidentKey,
        title: &str,
        body: &str,
    ) -> Result<OpenOutcome> {
        if !self.store.supports_atomic_create() {
            debug!(key = %key, "incident store has no atomic create; using check-then-create");
        }
        let request = NewIncident::new(key.clone(), title, body, &self.extra_labels);
        let (incident, created) = self.store.create_if_absent(request).await?;
        if created {
            METRICS.inc_incidents_opened();
        }
        Ok(OpenOutcome { incident, created })
    }

    /// Open incidents for `key`, oldest first.
    pub async fn find_open(&self, key: &IncidentKey) -> Result<Vec<Incident>> {
        Ok(self.store.list_open_by_labels(&key.labels()).await?)
    }

    /// Open incidents across all keys carrying `labels`.
    pub async fn list_open(&self, labels: &[String]) -> Result<Vec<Incident>> {
        Ok(self.store.list_open_by_labels(labels).await?)
    }

    /// Close every open incident for `key`. Returns the closed records.
    pub async fn close(&self, key: &IncidentKey) -> Result<Vec<Incident>> {
        let mut closed = Vec::new();
        for open in self.find_open(key).await? {
            let record = self.store.close(&open.id).await?;
            obs::emit_incident_closed(&key.environment, &record.id);
            closed.push(record);
        }
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stageward_state::fakes::MemoryIncidentStore;
    use stageward_state::IncidentState;

    #[tokio::test]
    async fn open_or_skip_twice_yields_one_incident() {
        let store = Arc::new(MemoryIncidentStore::new());
        let tracker = IncidentTracker::new(store.clone());
        let key = IncidentKey::drift("prod");

        let first = tracker.open_or_skip(&key, "Drift detected in prod", "a").await.unwrap();
        let second = tracker.open_or_skip(&key, "Drift detected in prod", "b").await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.incident.id, second.incident.id);
        assert_eq!(tracker.find_open(&key).await.unwrap().len(), 1);
        assert_eq!(store.create_calls(), 1);
    }

    #[tokio::test]
    async fn extra_labels_are_attached() {
        let tracker = IncidentTracker::new(Arc::new(MemoryIncidentStore::new()))
            .with_extra_labels(vec!["infrastructure".to_string()]);
        let out = tracker
            .open_or_skip(&IncidentKey::drift("dev"), "t", "b")
            .await
            .unwrap();
        assert!(out.incident.labels.contains(&"infrastructure".to_string()));
        assert!(out.incident.labels.contains(&"env:dev".to_string()));
    }

    #[tokio::test]
    async fn close_closes_every_open_incident_for_key() {
        let store = Arc::new(MemoryIncidentStore::new());
        let tracker = IncidentTracker::new(store.clone());
        let key = IncidentKey::drift("staging");
        // Two open incidents, as left behind by a racing non-atomic store.
        store
            .create(NewIncident::new(key.clone(), "t", "b", &[]))
            .await
            .unwrap();
        store
            .create(NewIncident::new(key.clone(), "t", "b", &[]))
            .await
            .unwrap();
        tracker
            .open_or_skip(&IncidentKey::drift("prod"), "t", "b")
            .await
            .unwrap();

        let closed = tracker.close(&key).await.unwrap();
        assert_eq!(closed.len(), 2);
        assert!(closed.iter().all(|i| i.state == IncidentState::Closed));
        assert!(tracker.find_open(&key).await.unwrap().is_empty());
        assert_eq!(
            tracker.find_open(&IncidentKey::drift("prod")).await.unwrap().len(),
            1
        );
    }
}
