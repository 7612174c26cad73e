//! Maps a change set onto the environments it affects.
//!
//! Each environment owns a set of path filters; filters listed as shared
//! belong to every environment, so a change to a shared module fans out to
//! all of them.
//!
//! Filter syntax:
//! - containing `*` or `?`: wildcard pattern where `*` also crosses `/`
//!   (`modules/**` and `modules/*` both match `modules/eks/main.tf`)
//! - otherwise: directory prefix matched on component boundaries
//!   (`environments/dev` matches `environments/dev/main.tf`, not
//!   `environments/dev2/main.tf`)

use std::collections::BTreeSet;

use serde::Serialize;
use wildmatch::WildMatchPattern;

use crate::domain::changeset::normalize_path;
use crate::domain::{ChangeSet, Environment, EnvironmentId};

pub type PathPattern = WildMatchPattern<'*', '?'>;

/// A single path filter.
#[derive(Debug, Clone)]
pub enum PathFilter {
    Prefix(String),
    Pattern { raw: String, pattern: PathPattern },
}

impl PathFilter {
    /// Parse a filter. A bare `.` matches the whole repository; blank input yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed == "." || trimmed == "./" {
            return Some(PathFilter::Prefix(String::new()));
        }
        let normalized = normalize_path(trimmed)?;
        if normalized.contains('*') || normalized.contains('?') {
            let pattern = PathPattern::new(&normalized);
            Some(PathFilter::Pattern {
                raw: normalized,
                pattern,
            })
        } else {
            Some(PathFilter::Prefix(
                normalized.trim_end_matches('/').to_string(),
            ))
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathFilter::Prefix(prefix) if prefix.is_empty() => true,
            PathFilter::Prefix(prefix) => {
                path == prefix
                    || (path.starts_with(prefix.as_str())
                        && path.as_bytes().get(prefix.len()) == Some(&b'/'))
            }
            PathFilter::Pattern { pattern, .. } => pattern.matches(path),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PathFilter::Prefix(prefix) => prefix,
            PathFilter::Pattern { raw, .. } => raw,
        }
    }
}

#[derive(Debug, Clone)]
struct EnvironmentEntry {
    id: EnvironmentId,
    position: usize,
    filters: Vec<PathFilter>,
}

/// Filter sets for every configured environment.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentFilters {
    entries: Vec<EnvironmentEntry>,
}

impl EnvironmentFilters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an environment's own filters.
    pub fn insert<I, S>(&mut self, id: EnvironmentId, position: usize, filters: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let filters = filters
            .into_iter()
            .filter_map(|f| PathFilter::parse(f.as_ref()))
            .collect();
        self.entries.push(EnvironmentEntry {
            id,
            position,
            filters,
        });
        self.entries.sort_by_key(|e| e.position);
        self
    }

    /// Build filter sets from configured environments plus `shared` filters.
    ///
    /// An environment with no explicit `paths` is filtered on its config root.
    pub fn from_environments(environments: &[Environment], shared: &[String]) -> Self {
        let shared: Vec<PathFilter> = shared.iter().filter_map(|s| PathFilter::parse(s)).collect();
        let mut out = Self::new();
        for env in environments {
            let own: Vec<String> = if env.paths.is_empty() {
                vec![env.config_root.to_string_lossy().into_owned()]
            } else {
                env.paths.clone()
            };
            out.insert(env.id.clone(), env.position, own);
            if let Some(entry) = out.entries.iter_mut().find(|e| e.id == env.id) {
                entry.filters.extend(shared.iter().cloned());
            }
        }
        out
    }

    pub fn filters_for(&self, id: &str) -> Option<&[PathFilter]> {
        self.entries
            .iter()
            .find(|e| e.id.as_str() == id)
            .map(|e| e.filters.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One affected environment with the changed paths that triggered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Detection {
    pub environment: EnvironmentId,
    pub position: usize,
    pub matched_paths: Vec<String>,
}

/// Affected environments in promotion order, with the triggering paths.
pub fn detect_detailed(changeset: &ChangeSet, filters: &EnvironmentFilters) -> Vec<Detection> {
    filters
        .entries
        .iter()
        .filter_map(|entry| {
            let matched: Vec<String> = changeset
                .paths()
                .filter(|p| entry.filters.iter().any(|f| f.matches(p)))
                .map(str::to_string)
                .collect();
            (!matched.is_empty()).then(|| Detection {
                environment: entry.id.clone(),
                position: entry.position,
                matched_paths: matched,
            })
        })
        .collect()
}

/// Every environment whose filter set intersects the change set.
pub fn detect(changeset: &ChangeSet, filters: &EnvironmentFilters) -> BTreeSet<EnvironmentId> {
    detect_detailed(changeset, filters)
        .into_iter()
        .map(|d| d.environment)
        .collect()
}

/// Same as [`detect`], ordered by promotion position.
pub fn detect_ordered(changeset: &ChangeSet, filters: &EnvironmentFilters) -> Vec<EnvironmentId> {
    detect_detailed(changeset, filters)
        .into_iter()
        .map(|d| d.environment)
        .collect()
}
