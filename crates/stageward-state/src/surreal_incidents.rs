//! SurrealDB-backed IncidentStore implementation
//!
//! Incidents live in the `incidents` table. Each open key additionally owns a
//! record in `open_incidents` whose record id is the key id; creating that
//! record is the atomic claim that backs `create_if_absent`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::migrations;
use crate::storage_traits::{
    IncidentKey, IncidentRecord, IncidentState, IncidentStore, NewIncident, StorageResult,
};

/// Default on-disk location used when no `SURREALDB_URL` is configured.
pub const DEFAULT_DB_PATH: &str = ".stageward/db";

/// A claim with no visible incident older than this is treated as abandoned.
const CLAIM_STALE_AFTER_SECS: i64 = 30;
/// Polls while a fresh claim's incident row is being written by another run.
const CLAIM_WAIT_ATTEMPTS: u32 = 20;
const CLAIM_WAIT_INTERVAL: Duration = Duration::from_millis(50);

const NAMESPACE: &str = "stageward";
const DATABASE: &str = "main";

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// Row in the `incidents` table
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbIncident {
    incident_id: String,
    key_id: String,
    environment: String,
    category: String,
    title: String,
    body: String,
    labels: Vec<String>,
    /// "open" | "closed"
    state: String,
    #[serde(with = "surreal_datetime")]
    created_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    closed_at: Option<DateTime<Utc>>,
}

impl DbIncident {
    fn open(incident_id: String, incident: NewIncident) -> Self {
        DbIncident {
            incident_id,
            key_id: incident.key.as_id(),
            environment: incident.key.environment,
            category: incident.key.category,
            title: incident.title,
            body: incident.body,
            labels: incident.labels,
            state: IncidentState::Open.as_str().to_string(),
            created_at: Utc::now(),
            closed_at: None,
        }
    }

    fn close(mut self) -> Self {
        self.state = IncidentState::Closed.as_str().to_string();
        self.closed_at = Some(Utc::now());
        self
    }

    fn into_record(self) -> StorageResult<IncidentRecord> {
        let state = match self.state.as_str() {
            "open" => IncidentState::Open,
            "closed" => IncidentState::Closed,
            other => {
                return Err(StorageError::Backend(format!(
                    "unknown incident state: {other}"
                )))
            }
        };
        Ok(IncidentRecord {
            id: self.incident_id,
            key: IncidentKey::new(self.environment, self.category),
            title: self.title,
            body: self.body,
            labels: self.labels,
            state,
            created_at: self.created_at,
            closed_at: self.closed_at,
            url: None,
        })
    }
}

/// Row in the `open_incidents` table (record id = key id)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenMarker {
    incident_id: String,
    key_id: String,
    #[serde(with = "surreal_datetime")]
    claimed_at: DateTime<Utc>,
}

/// SurrealDB-backed implementation of [`IncidentStore`].
pub struct SurrealIncidentStore {
    db: Surreal<Any>,
}

impl SurrealIncidentStore {
    /// Connect to any SurrealDB endpoint (`mem://`, `surrealkv://path`, `ws://host`).
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to connect to {url}: {e}")))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        info!("SurrealIncidentStore connected ({})", url);
        Ok(Self { db })
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> StorageResult<Self> {
        Self::connect("mem://").await
    }

    /// Open (or create) an embedded database directory.
    pub async fn at_path(path: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(path).map_err(|e| {
            StorageError::Connection(format!(
                "Failed to create database directory {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::connect(&format!("surrealkv://{}", path.display())).await
    }

    /// Create from environment variables.
    ///
    /// Uses `SURREALDB_URL` when set, otherwise local persistence under
    /// `fallback_path`.
    pub async fn from_env(fallback_path: &Path) -> StorageResult<Self> {
        if let Ok(url) = std::env::var("SURREALDB_URL") {
            return Self::connect(&url).await;
        }
        info!(
            "No SURREALDB_URL found, using local persistence: {}",
            fallback_path.display()
        );
        Self::at_path(fallback_path).await
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_incident(&self, incident_id: &str) -> StorageResult<DbIncident> {
        let iid = incident_id.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM incidents WHERE incident_id = $iid")
            .bind(("iid", iid))
            .await?;

        let rows: Vec<DbIncident> = res.take(0)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::IncidentNotFound {
                id: incident_id.to_string(),
            })
    }

    async fn open_by_key(&self, key_id: &str) -> StorageResult<Vec<DbIncident>> {
        let key = key_id.to_string();
        let mut res = self
            .db
            .query(
                "SELECT * FROM incidents WHERE key_id = $key AND state = 'open' \
                 ORDER BY created_at ASC",
            )
            .bind(("key", key))
            .await?;
        Ok(res.take(0)?)
    }

    async fn insert(&self, row: DbIncident) -> StorageResult<IncidentRecord> {
        debug!(incident_id = %row.incident_id, key = %row.key_id, "creating incident");
        let created: Option<DbIncident> = self.db.create("incidents").content(row).await?;
        created
            .ok_or_else(|| StorageError::Backend("create returned no incident row".to_string()))?
            .into_record()
    }

    /// Try to create the `open_incidents:<key>` record.
    async fn claim(&self, key_id: &str, incident_id: &str) -> StorageResult<bool> {
        let marker = OpenMarker {
            incident_id: incident_id.to_string(),
            key_id: key_id.to_string(),
            claimed_at: Utc::now(),
        };
        let claimed: Result<Option<OpenMarker>, surrealdb::Error> = self
            .db
            .create(("open_incidents", key_id.to_string()))
            .content(marker)
            .await;
        match claimed {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!(key = %key_id, error = %e, "open incident claim rejected");
                Ok(false)
            }
        }
    }

    async fn current_claim(&self, key_id: &str) -> StorageResult<Option<OpenMarker>> {
        Ok(self
            .db
            .select(("open_incidents", key_id.to_string()))
            .await?)
    }

    async fn repoint_claim(&self, key_id: &str, incident_id: &str) -> StorageResult<()> {
        let key = key_id.to_string();
        let iid = incident_id.to_string();
        self.db
            .query("UPDATE open_incidents SET incident_id = $iid WHERE key_id = $key")
            .bind(("iid", iid))
            .bind(("key", key))
            .await?;
        Ok(())
    }

    /// Wait for the open incident behind someone else's claim.
    ///
    /// Returns `None` once the claim is stale or was released without an
    /// incident; `AlreadyOpen` if it stays fresh and empty past the wait.
    async fn await_claimed_incident(&self, key_id: &str) -> StorageResult<Option<DbIncident>> {
        for _ in 0..CLAIM_WAIT_ATTEMPTS {
            if let Some(open) = self.open_by_key(key_id).await?.into_iter().next() {
                return Ok(Some(open));
            }
            match self.current_claim(key_id).await? {
                None => return Ok(None),
                Some(marker) => {
                    if self.claim_is_abandoned(&marker).await? {
                        return Ok(None);
                    }
                }
            }
            tokio::time::sleep(CLAIM_WAIT_INTERVAL).await;
        }
        Err(StorageError::AlreadyOpen {
            key: key_id.to_string(),
        })
    }

    /// Old, or pointing at an incident that has since been closed.
    async fn claim_is_abandoned(&self, marker: &OpenMarker) -> StorageResult<bool> {
        if (Utc::now() - marker.claimed_at).num_seconds() >= CLAIM_STALE_AFTER_SECS {
            return Ok(true);
        }
        match self.fetch_incident(&marker.incident_id).await {
            Ok(row) => Ok(row.state != IncidentState::Open.as_str()),
            Err(StorageError::IncidentNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn drop_claim_for_key(&self, key_id: &str) -> StorageResult<()> {
        let key = key_id.to_string();
        self.db
            .query("DELETE open_incidents WHERE key_id = $key")
            .bind(("key", key))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl IncidentStore for SurrealIncidentStore {
    async fn list_open_by_labels(&self, labels: &[String]) -> StorageResult<Vec<IncidentRecord>> {
        let wanted = labels.to_vec();
        let mut res = self
            .db
            .query(
                "SELECT * FROM incidents WHERE state = 'open' AND labels CONTAINSALL $labels \
                 ORDER BY created_at ASC",
            )
            .bind(("labels", wanted))
            .await?;

        let rows: Vec<DbIncident> = res.take(0)?;
        rows.into_iter().map(DbIncident::into_record).collect()
    }

    async fn create(&self, incident: NewIncident) -> StorageResult<IncidentRecord> {
        let incident_id = uuid::Uuid::new_v4().to_string();
        let key_id = incident.key.as_id();
        // Best effort: keep a claim for the key if nobody holds one yet.
        self.claim(&key_id, &incident_id).await?;
        self.insert(DbIncident::open(incident_id, incident)).await
    }

    async fn close(&self, id: &str) -> StorageResult<IncidentRecord> {
        let row = self.fetch_incident(id).await?;
        if row.state != IncidentState::Open.as_str() {
            return row.into_record();
        }

        let key_id = row.key_id.clone();
        let updated = row.close();
        let iid = id.to_string();
        self.db
            .query("UPDATE incidents CONTENT $row WHERE incident_id = $iid")
            .bind(("row", updated.clone()))
            .bind(("iid", iid))
            .await?;

        // Hand the claim to another open incident for the key, if any.
        match self.open_by_key(&key_id).await?.into_iter().next() {
            Some(next) => self.repoint_claim(&key_id, &next.incident_id).await?,
            None => self.drop_claim_for_key(&key_id).await?,
        }

        updated.into_record()
    }

    async fn create_if_absent(
        &self,
        incident: NewIncident,
    ) -> StorageResult<(IncidentRecord, bool)> {
        let key_id = incident.key.as_id();
        let incident_id = uuid::Uuid::new_v4().to_string();

        if !self.claim(&key_id, &incident_id).await? {
            match self.await_claimed_incident(&key_id).await? {
                Some(open) => return Ok((open.into_record()?, false)),
                None => {
                    warn!(key = %key_id, "dropping stale open-incident claim");
                    self.drop_claim_for_key(&key_id).await?;
                    if !self.claim(&key_id, &incident_id).await? {
                        return Err(StorageError::AlreadyOpen { key: key_id });
                    }
                }
            }
        }

        // Incidents created through `create` before the claim existed still count.
        if let Some(open) = self.open_by_key(&key_id).await?.into_iter().next() {
            self.repoint_claim(&key_id, &open.incident_id).await?;
            return Ok((open.into_record()?, false));
        }

        let created = self.insert(DbIncident::open(incident_id, incident)).await?;
        Ok((created, true))
    }

    fn supports_atomic_create(&self) -> bool {
        true
    }
}
