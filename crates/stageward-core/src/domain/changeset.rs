//! Paths modified by a single trigger event.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Set of changed file paths, normalized to forward slashes with no `./` prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    paths: BTreeSet<String>,
}

impl ChangeSet {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            paths: paths
                .into_iter()
                .filter_map(|p| normalize_path(p.as_ref()))
                .collect(),
        }
    }

    /// Parse newline-separated output such as `git diff --name-only`.
    pub fn from_lines(text: &str) -> Self {
        Self::new(text.lines())
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Normalize a repository-relative path. Blank input yields `None`.
pub fn normalize_path(raw: &str) -> Option<String> {
    let mut path = raw.trim().replace('\\', "/");
    while let Some(rest) = path.strip_prefix("./") {
        path = rest.to_string();
    }
    let path = path.trim_start_matches('/').to_string();
    if path.is_empty() {
        None
    } else {
        Some(path)
    }
}
