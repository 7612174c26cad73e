//! GitHub issues as an incident store
//!
//! Incidents are issues labelled `[category, "env:<environment>"]`. The key
//! is also written into the body as a hidden marker so it can be recovered
//! regardless of label order.
//!
//! GitHub offers no compare-and-swap on issue creation, so `create_if_absent`
//! keeps the trait's check-then-create default. Two reconcilers racing on the
//! same key can both observe "nothing open" and open a duplicate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StorageError;
use crate::storage_traits::{
    IncidentKey, IncidentRecord, IncidentState, IncidentStore, NewIncident, StorageResult,
    ENV_LABEL_PREFIX,
};

const KEY_MARKER_PREFIX: &str = "<!-- stageward:key=";
const KEY_MARKER_SUFFIX: &str = " -->";

/// Configuration for the GitHub issues backend
#[derive(Debug, Clone)]
pub struct GithubConfig {
    /// API base URL (`https://api.github.com` unless GitHub Enterprise)
    pub api_url: String,
    /// Repository as `owner/name`
    pub repository: String,
    /// Token with `issues: write`
    pub token: String,
}

impl GithubConfig {
    pub fn new(repository: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            repository: repository.into(),
            token: token.into(),
        }
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Read `GITHUB_TOKEN` (and optionally `GITHUB_API_URL`) from the environment.
    pub fn from_env(repository: impl Into<String>) -> Result<Self, String> {
        let token = std::env::var("GITHUB_TOKEN").map_err(|_| "GITHUB_TOKEN not set")?;
        let config = Self::new(repository, token);
        Ok(match std::env::var("GITHUB_API_URL") {
            Ok(url) => config.with_api_url(url),
            Err(_) => config,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    state: String,
    html_url: String,
    #[serde(default)]
    labels: Vec<GhLabel>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    closed_at: Option<DateTime<Utc>>,
    /// Present when the "issue" is a pull request
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct GhCreateIssue<'a> {
    title: &'a str,
    body: &'a str,
    labels: &'a [String],
}

#[derive(Debug, Serialize)]
struct GhUpdateState<'a> {
    state: &'a str,
}

/// GitHub REST API client implementing [`IncidentStore`].
pub struct GithubIssueStore {
    config: GithubConfig,
    http_client: reqwest::Client,
}

impl GithubIssueStore {
    pub fn new(config: GithubConfig) -> StorageResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("stageward/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            config,
            http_client,
        })
    }

    fn issues_url(&self) -> String {
        format!("{}/repos/{}/issues", self.config.api_url, self.config.repository)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http_client
            .request(method, url)
            .bearer_auth(&self.config.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn check(response: reqwest::Response) -> StorageResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(StorageError::Http(format!("GitHub API returned {status}: {text}")))
    }

    fn into_record(issue: GhIssue) -> Option<IncidentRecord> {
        let body = issue.body.unwrap_or_default();
        let labels: Vec<String> = issue.labels.into_iter().map(|l| l.name).collect();
        let key = parse_key_marker(&body).or_else(|| key_from_labels(&labels))?;
        let state = if issue.state == "closed" {
            IncidentState::Closed
        } else {
            IncidentState::Open
        };
        Some(IncidentRecord {
            id: issue.number.to_string(),
            key,
            title: issue.title,
            body,
            labels,
            state,
            created_at: issue.created_at,
            closed_at: issue.closed_at,
            url: Some(issue.html_url),
        })
    }
}

/// Append the hidden key marker to an issue body.
pub fn with_key_marker(body: &str, key: &IncidentKey) -> String {
    format!("{body}\n\n{KEY_MARKER_PREFIX}{}{KEY_MARKER_SUFFIX}", key.as_id())
}

fn parse_key_marker(body: &str) -> Option<IncidentKey> {
    let start = body.rfind(KEY_MARKER_PREFIX)? + KEY_MARKER_PREFIX.len();
    let rest = &body[start..];
    let end = rest.find(KEY_MARKER_SUFFIX)?;
    IncidentKey::parse_id(&rest[..end])
}

fn key_from_labels(labels: &[String]) -> Option<IncidentKey> {
    let environment = labels
        .iter()
        .find_map(|l| l.strip_prefix(ENV_LABEL_PREFIX))?;
    let category = labels.iter().find(|l| !l.starts_with(ENV_LABEL_PREFIX))?;
    Some(IncidentKey::new(environment, category.as_str()))
}

#[async_trait]
impl IncidentStore for GithubIssueStore {
    async fn list_open_by_labels(&self, labels: &[String]) -> StorageResult<Vec<IncidentRecord>> {
        let url = self.issues_url();
        let joined = labels.join(",");
        let response = self
            .request(reqwest::Method::GET, &url)
            .query(&[
                ("state", "open"),
                ("labels", joined.as_str()),
                ("sort", "created"),
                ("direction", "asc"),
                ("per_page", "100"),
            ])
            .send()
            .await?;
        let issues: Vec<GhIssue> = Self::check(response).await?.json().await?;
        debug!(count = issues.len(), labels = %joined, "listed open issues");

        Ok(issues
            .into_iter()
            .filter(|i| i.pull_request.is_none())
            .filter_map(Self::into_record)
            .filter(|r| labels.iter().all(|l| r.labels.contains(l)))
            .collect())
    }

    async fn create(&self, incident: NewIncident) -> StorageResult<IncidentRecord> {
        let url = self.issues_url();
        let body = with_key_marker(&incident.body, &incident.key);
        let payload = GhCreateIssue {
            title: &incident.title,
            body: &body,
            labels: &incident.labels,
        };
        let response = self
            .request(reqwest::Method::POST, &url)
            .json(&payload)
            .send()
            .await?;
        let issue: GhIssue = Self::check(response).await?.json().await?;
        debug!(number = issue.number, key = %incident.key, "created issue");

        let number = issue.number;
        Self::into_record(issue).ok_or_else(|| {
            StorageError::Backend(format!("created issue #{number} has no incident key"))
        })
    }

    async fn close(&self, id: &str) -> StorageResult<IncidentRecord> {
        let url = format!("{}/{}", self.issues_url(), id);
        let response = self
            .request(reqwest::Method::PATCH, &url)
            .json(&GhUpdateState { state: "closed" })
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::IncidentNotFound { id: id.to_string() });
        }
        let issue: GhIssue = Self::check(response).await?.json().await?;
        Self::into_record(issue).ok_or_else(|| StorageError::IncidentNotFound {
            id: id.to_string(),
        })
    }
}
