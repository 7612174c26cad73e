//! Deployment targets.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Environment identifier (e.g. "dev", "staging", "prod").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentId(String);

impl EnvironmentId {
    pub fn new(id: impl Into<String>) -> Self {
        EnvironmentId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EnvironmentId {
    fn from(s: &str) -> Self {
        EnvironmentId(s.to_string())
    }
}

impl From<String> for EnvironmentId {
    fn from(s: String) -> Self {
        EnvironmentId(s)
    }
}

impl AsRef<str> for EnvironmentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// An engine input value. Secrets never appear in `Debug` output or reports.
#[derive(Clone, PartialEq, Eq)]
pub enum VarValue {
    Plain(String),
    Secret(String),
}

impl VarValue {
    /// The raw value, for handing to the engine process only.
    pub fn expose(&self) -> &str {
        match self {
            VarValue::Plain(v) | VarValue::Secret(v) => v,
        }
    }

    pub fn is_secret(&self) -> bool {
        matches!(self, VarValue::Secret(_))
    }
}

impl std::fmt::Debug for VarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VarValue::Plain(v) => write!(f, "{v:?}"),
            VarValue::Secret(_) => f.write_str("\"***\""),
        }
    }
}

/// A named deployment target with its own configuration root and state.
#[derive(Debug, Clone)]
pub struct Environment {
    pub id: EnvironmentId,
    /// Position in the promotion sequence (0 = first).
    pub position: usize,
    /// Directory the engine runs in.
    pub config_root: PathBuf,
    /// Apply needs an explicit `--confirm <id>` for this environment.
    pub requires_confirmation: bool,
    /// Path filters owned by this environment (shared filters are added by the detector).
    pub paths: Vec<String>,
    /// Engine inputs; opaque to the core.
    pub variables: BTreeMap<String, VarValue>,
    /// Extra variable files passed to the engine.
    pub var_files: Vec<PathBuf>,
    /// Process environment variables that must be present before invoking the engine
    /// (credentials, mostly).
    pub required_env: Vec<String>,
}

impl Environment {
    pub fn new(
        id: impl Into<EnvironmentId>,
        position: usize,
        config_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            position,
            config_root: config_root.into(),
            requires_confirmation: false,
            paths: Vec::new(),
            variables: BTreeMap::new(),
            var_files: Vec::new(),
            required_env: Vec::new(),
        }
    }

    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn requiring_confirmation(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: VarValue) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    pub fn with_required_env(mut self, name: impl Into<String>) -> Self {
        self.required_env.push(name.into());
        self
    }
}
