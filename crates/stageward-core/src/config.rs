//! `stageward.toml` loading and validation.
//!
//! ```toml
//! shared_paths = ["modules/**"]
//!
//! [settings]
//! engine_command = ["terraform"]
//! lock_timeout_secs = 300
//!
//! [[environments]]
//! id = "dev"
//! config_root = "environments/dev"
//!
//! [[environments]]
//! id = "prod"
//! config_root = "environments/prod"
//! requires_confirmation = true
//! required_env = ["AWS_ROLE_ARN"]
//!
//! [environments.variables]
//! region = "us-east-1"
//! db_password = { secret_env = "PROD_DB_PASSWORD" }
//!
//! [incidents]
//! backend = "github"
//! repository = "acme/infrastructure"
//! labels = ["infrastructure"]
//! ```
//!
//! Environment positions follow declaration order. Relative paths are
//! resolved against the directory holding the config file.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{Environment, EnvironmentId, Result, ValidationError, VarValue};
use crate::plan_executor::ExitCodePolicy;
use crate::retry::LockRetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "stageward.toml";

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StagewardConfig {
    /// Filters shared by every environment (module directories).
    #[serde(default)]
    pub shared_paths: Vec<String>,

    #[serde(default)]
    pub settings: Settings,

    pub environments: Vec<EnvironmentConfig>,

    #[serde(default)]
    pub incidents: IncidentsConfig,

    #[serde(default)]
    pub drift: DriftConfig,

    /// Directory relative paths resolve against. Not part of the file.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockBackend {
    /// Lock files under `lock_dir`.
    #[default]
    File,
    /// Rely on the engine's own remote-state locking.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Program and leading arguments, e.g. `["tofu"]`.
    pub engine_command: Vec<String>,
    /// Exit code the engine uses for "differences found".
    pub changes_exit_code: i32,
    /// Run `init` once per environment before its first engine command.
    pub init: bool,
    pub command_timeout_secs: u64,
    pub lock_timeout_secs: u64,
    pub state_lock: LockBackend,
    pub lock_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            engine_command: vec!["terraform".to_string()],
            changes_exit_code: 2,
            init: true,
            command_timeout_secs: 1800,
            lock_timeout_secs: 300,
            state_lock: LockBackend::File,
            lock_dir: PathBuf::from(".stageward/locks"),
        }
    }
}

/// A variable value as written in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VarConfig {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Secret { secret_env: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    pub id: String,
    pub config_root: PathBuf,
    /// Own path filters; defaults to `config_root`.
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(default)]
    pub required_env: Vec<String>,
    #[serde(default)]
    pub var_files: Vec<PathBuf>,
    #[serde(default)]
    pub variables: BTreeMap<String, VarConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentBackend {
    /// Process-local; only useful for dry runs and tests.
    Memory,
    #[default]
    Surreal,
    Github,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IncidentsConfig {
    pub backend: IncidentBackend,
    /// `owner/repo`, required for the GitHub backend.
    pub repository: Option<String>,
    /// Labels added on top of `[category, "env:<id>"]`.
    pub labels: Vec<String>,
    /// SurrealKV directory; `SURREALDB_URL` wins when set.
    pub database_path: PathBuf,
}

impl Default for IncidentsConfig {
    fn default() -> Self {
        Self {
            backend: IncidentBackend::default(),
            repository: None,
            labels: Vec::new(),
            database_path: PathBuf::from(".stageward/db"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriftConfig {
    pub auto_close: bool,
}

impl StagewardConfig {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ValidationError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config: Self = toml::from_str(&text)
            .map_err(|e| ValidationError::InvalidConfig(format!("{}: {e}", path.display())))?;
        config.validate()?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(config)
    }

    /// Parse and validate TOML text. Relative paths resolve against the working directory.
    pub fn from_toml_str(text: &str) -> std::result::Result<Self, ValidationError> {
        let config: Self =
            toml::from_str(text).map_err(|e| ValidationError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.environments.is_empty() {
            return Err(ValidationError::NoEnvironments);
        }
        let mut seen = HashSet::new();
        for env in &self.environments {
            if env.id.is_empty() || env.id.contains('/') || env.id.contains(char::is_whitespace) {
                return Err(ValidationError::InvalidConfig(format!(
                    "invalid environment id {:?}",
                    env.id
                )));
            }
            if !seen.insert(env.id.as_str()) {
                return Err(ValidationError::DuplicateEnvironment(env.id.clone()));
            }
        }
        if self.settings.engine_command.is_empty() {
            return Err(ValidationError::InvalidConfig(
                "settings.engine_command must not be empty".to_string(),
            ));
        }
        if self.settings.changes_exit_code == 0 {
            return Err(ValidationError::InvalidConfig(
                "settings.changes_exit_code must be non-zero".to_string(),
            ));
        }
        if self.incidents.backend == IncidentBackend::Github
            && !self
                .incidents
                .repository
                .as_deref()
                .is_some_and(|r| {
                    r.split_once('/')
                        .is_some_and(|(o, n)| !o.is_empty() && !n.is_empty())
                })
        {
            return Err(ValidationError::InvalidConfig(
                "incidents.repository must be owner/repo for the github backend".to_string(),
            ));
        }
        Ok(())
    }

    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Environments in promotion order, with secrets read from the process environment.
    pub fn environments(&self) -> Vec<Environment> {
        self.environments_with(|name| std::env::var(name).ok())
    }

    /// Same as [`Self::environments`] with an explicit secret lookup.
    ///
    /// An unset secret is added to `required_env` so the engine preflight
    /// reports it before running.
    pub fn environments_with<F>(&self, lookup: F) -> Vec<Environment>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.environments
            .iter()
            .enumerate()
            .map(|(position, cfg)| {
                let mut env = Environment::new(
                    EnvironmentId::new(cfg.id.clone()),
                    position,
                    self.resolve_path(&cfg.config_root),
                );
                env.requires_confirmation = cfg.requires_confirmation;
                env.paths = if cfg.paths.is_empty() {
                    vec![cfg.config_root.to_string_lossy().into_owned()]
                } else {
                    cfg.paths.clone()
                };
                env.required_env = cfg.required_env.clone();
                env.var_files = cfg.var_files.iter().map(|p| self.resolve_path(p)).collect();
                for (key, value) in &cfg.variables {
                    let resolved = match value {
                        VarConfig::Text(s) => VarValue::Plain(s.clone()),
                        VarConfig::Integer(n) => VarValue::Plain(n.to_string()),
                        VarConfig::Float(n) => VarValue::Plain(n.to_string()),
                        VarConfig::Boolean(b) => VarValue::Plain(b.to_string()),
                        VarConfig::Secret { secret_env } => match lookup(secret_env) {
                            Some(v) => VarValue::Secret(v),
                            None => {
                                if !env.required_env.contains(secret_env) {
                                    env.required_env.push(secret_env.clone());
                                }
                                continue;
                            }
                        },
                    };
                    env.variables.insert(key.clone(), resolved);
                }
                env
            })
            .collect()
    }

    pub fn retry_policy(&self) -> LockRetryPolicy {
        LockRetryPolicy::default()
            .with_timeout(Duration::from_secs(self.settings.lock_timeout_secs))
    }

    pub fn exit_code_policy(&self) -> ExitCodePolicy {
        ExitCodePolicy {
            changes_exit_code: self.settings.changes_exit_code,
        }
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.resolve_path(&self.settings.lock_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve_path(&self.incidents.database_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
shared_paths = ["modules/**"]

[settings]
engine_command = ["tofu"]
lock_timeout_secs = 60

[[environments]]
id = "dev"
config_root = "environments/dev"

[[environments]]
id = "staging"
config_root = "environments/staging"
paths = ["environments/staging", "policies/staging-*.json"]

[[environments]]
id = "prod"
config_root = "environments/prod"
requires_confirmation = true
required_env = ["AWS_ROLE_ARN"]
var_files = ["prod.tfvars"]

[environments.variables]
region = "us-east-1"
replicas = 3
db_password = { secret_env = "PROD_DB_PASSWORD" }

[incidents]
backend = "github"
repository = "acme/infrastructure"
labels = ["infrastructure"]

[drift]
auto_close = true
"#;

    #[test]
    fn parses_full_config() {
        let config = StagewardConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.settings.engine_command, vec!["tofu".to_string()]);
        assert_eq!(config.settings.changes_exit_code, 2);
        assert_eq!(config.retry_policy().timeout, Duration::from_secs(60));
        assert_eq!(config.incidents.backend, IncidentBackend::Github);
        assert!(config.drift.auto_close);

        let envs = config.environments_with(|_| Some("s3cret".to_string()));
        let order: Vec<&str> = envs.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(order, vec!["dev", "staging", "prod"]);
        assert_eq!(envs[2].position, 2);
        assert!(envs[2].requires_confirmation);
        assert_eq!(envs[0].paths, vec!["environments/dev".to_string()]);
        assert_eq!(envs[2].variables["replicas"], VarValue::Plain("3".to_string()));
        assert!(envs[2].variables["db_password"].is_secret());
        assert_eq!(envs[2].var_files, vec![PathBuf::from("prod.tfvars")]);
    }

    #[test]
    fn unset_secret_becomes_required_env() {
        let config = StagewardConfig::from_toml_str(SAMPLE).unwrap();
        let envs = config.environments_with(|_| None);
        assert!(!envs[2].variables.contains_key("db_password"));
        assert_eq!(
            envs[2].required_env,
            vec!["AWS_ROLE_ARN".to_string(), "PROD_DB_PASSWORD".to_string()]
        );
    }

    #[test]
    fn rejects_duplicate_environment_ids() {
        let text = r#"
[[environments]]
id = "dev"
config_root = "a"

[[environments]]
id = "dev"
config_root = "b"
"#;
        assert!(matches!(
            StagewardConfig::from_toml_str(text),
            Err(ValidationError::DuplicateEnvironment(id)) if id == "dev"
        ));
    }

    #[test]
    fn rejects_empty_environment_list() {
        assert!(matches!(
            StagewardConfig::from_toml_str("environments = []"),
            Err(ValidationError::NoEnvironments)
        ));
    }

    #[test]
    fn github_backend_requires_repository() {
        let text = r#"
[[environments]]
id = "dev"
config_root = "environments/dev"

[incidents]
backend = "github"
"#;
        assert!(matches!(
            StagewardConfig::from_toml_str(text),
            Err(ValidationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_unknown_keys() {
        let text = r#"
[[environments]]
id = "dev"
config_root = "environments/dev"
requires_confirmaton = true
"#;
        assert!(StagewardConfig::from_toml_str(text).is_err());
    }

    #[test]
    fn load_resolves_paths_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stageward.toml");
        std::fs::write(
            &path,
            "[[environments]]\nid = \"dev\"\nconfig_root = \"environments/dev\"\n",
        )
        .unwrap();
        let config = StagewardConfig::load(&path).unwrap();
        let envs = config.environments();
        assert_eq!(envs[0].config_root, dir.path().join("environments/dev"));
        assert_eq!(config.lock_dir(), dir.path().join(".stageward/locks"));
        assert_eq!(config.incidents.backend, IncidentBackend::Surreal);
    }
}
