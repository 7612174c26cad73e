//! Stageward CLI
//!
//! The `stageward` command promotes infrastructure changes through an
//! ordered set of environments and raises deduplicated drift incidents.
//!
//! ## Commands
//!
//! - `promote`: plan, apply or destroy one environment
//! - `run`: detect the environments a change touches and promote them in order
//! - `detect`: list the environments a change touches
//! - `drift`: plan environments and open (or close) drift incidents
//! - `incidents`: list or close open incidents
//!
//! Exit codes: 0 success, 1 validation or configuration error, 2 engine failure.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn, Level};

use stageward_core::metrics::METRICS;
use stageward_core::telemetry::init_tracing;
use stageward_core::{
    detect_detailed, Action, CancellationFlag, ChangeSet, CoreError, DriftOutcome,
    DriftReconciler, DriftReport, Environment, EnvironmentFilters, EnvironmentId, IncidentBackend,
    IncidentKey, IncidentTracker, InfraEngine, LockBackend, PlanExecutor, PromotionOrchestrator,
    PromotionRequest, PromotionRun, StageState, StagewardConfig, ValidationError,
    DEFAULT_CONFIG_FILE,
};
use stageward_engine::TerraformEngine;
use stageward_state::fakes::MemoryIncidentStore;
use stageward_state::{
    FileStateLock, GithubConfig, GithubIssueStore, IncidentStore, NoopStateLock, StateLock,
    StorageError, SurrealIncidentStore,
};

#[derive(Parser)]
#[command(name = "stageward")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Environment promotion and drift reconciliation for IaC repositories",
    long_about = None
)]
struct Cli {
    /// Path to the configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "STAGEWARD_CONFIG",
        default_value = DEFAULT_CONFIG_FILE
    )]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines; `detect` also prints JSON
    #[arg(long, global = true)]
    json: bool,

    /// Write a JSON report of the run to this path
    #[arg(long, global = true, value_name = "PATH")]
    report: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan, apply or destroy a single environment
    Promote {
        /// Environment id
        environment: String,

        /// plan | apply | destroy
        #[arg(short, long, default_value = "plan")]
        action: Action,

        /// Confirmation token; must equal the environment id
        #[arg(long)]
        confirm: Option<String>,
    },

    /// Promote every environment affected by the changed paths, in order
    Run {
        /// plan | apply
        #[arg(short, long, default_value = "plan")]
        action: Action,

        #[command(flatten)]
        changes: ChangeArgs,

        /// Confirmation token for a protected environment (repeatable)
        #[arg(long)]
        confirm: Vec<String>,
    },

    /// List the environments affected by the changed paths
    Detect {
        #[command(flatten)]
        changes: ChangeArgs,
    },

    /// Check environments for drift and raise incidents
    Drift {
        /// Environments to check
        environments: Vec<String>,

        /// Check every configured environment
        #[arg(long, conflicts_with = "environments")]
        all: bool,
    },

    /// Manage incidents
    Incidents {
        #[command(subcommand)]
        action: IncidentsAction,
    },
}

#[derive(Args)]
struct ChangeArgs {
    /// Changed file path (repeatable)
    #[arg(long = "changed", value_name = "PATH")]
    changed: Vec<String>,

    /// File listing changed paths, one per line (`-` for stdin)
    #[arg(long, value_name = "FILE")]
    changed_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum IncidentsAction {
    /// List open incidents
    List {
        /// Only incidents for this environment
        #[arg(short, long)]
        environment: Option<String>,
    },

    /// Close every open incident for an environment
    Close {
        environment: String,

        #[arg(long, default_value = "drift")]
        category: String,
    },
}

/// Global output options shared by every command.
struct Output {
    json: bool,
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(usage_exit_code(err.kind()));
        }
    };

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    };
    METRICS.flush();
    ExitCode::from(code)
}

/// Help and version requests succeed; every other parse failure is a usage error.
fn usage_exit_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
        _ => 1,
    }
}

async fn dispatch(cli: Cli) -> Result<u8> {
    let config = load_config(&cli.config)?;
    let out = Output {
        json: cli.json,
        report: cli.report,
    };

    match cli.command {
        Commands::Promote {
            environment,
            action,
            confirm,
        } => cmd_promote(&config, &out, &environment, action, confirm).await,
        Commands::Run {
            action,
            changes,
            confirm,
        } => cmd_run(&config, &out, action, &changes, confirm).await,
        Commands::Detect { changes } => cmd_detect(&config, &out, &changes),
        Commands::Drift { environments, all } => cmd_drift(&config, &out, &environments, all).await,
        Commands::Incidents { action } => match action {
            IncidentsAction::List { environment } => {
                cmd_incidents_list(&config, &out, environment.as_deref()).await
            }
            IncidentsAction::Close {
                environment,
                category,
            } => cmd_incidents_close(&config, &environment, &category).await,
        },
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<StagewardConfig> {
    StagewardConfig::load(path).with_context(|| format!("failed to load {}", path.display()))
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(core) = err.downcast_ref::<CoreError>() {
        return core.exit_code();
    }
    if err.downcast_ref::<StorageError>().is_some() {
        return 2;
    }
    1
}

fn engine(config: &StagewardConfig) -> Arc<dyn InfraEngine> {
    Arc::new(TerraformEngine::from_settings(&config.settings))
}

fn state_lock(config: &StagewardConfig) -> Arc<dyn StateLock> {
    match config.settings.state_lock {
        LockBackend::File => Arc::new(FileStateLock::new(config.lock_dir())),
        LockBackend::None => Arc::new(NoopStateLock),
    }
}

async fn incident_store(config: &StagewardConfig) -> Result<Arc<dyn IncidentStore>> {
    let store: Arc<dyn IncidentStore> = match config.incidents.backend {
        IncidentBackend::Memory => {
            warn!("incident backend is `memory`; incidents do not outlive this process");
            Arc::new(MemoryIncidentStore::new())
        }
        IncidentBackend::Surreal => Arc::new(
            SurrealIncidentStore::from_env(&config.database_path())
                .await
                .context("Failed to open incident database")?,
        ),
        IncidentBackend::Github => {
            let repository = config
                .incidents
                .repository
                .as_deref()
                .context("[incidents] repository is required for the github backend")?;
            let github = GithubConfig::from_env(repository).map_err(anyhow::Error::msg)?;
            Arc::new(GithubIssueStore::new(github)?)
        }
    };
    Ok(store)
}

fn tracker(config: &StagewardConfig, store: Arc<dyn IncidentStore>) -> IncidentTracker {
    IncidentTracker::new(store).with_extra_labels(config.incidents.labels.clone())
}

/// Ctrl-C stops the run before the next stage; a running apply finishes.
fn cancel_on_ctrl_c() -> CancellationFlag {
    let flag = CancellationFlag::new();
    let handle = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; remaining stages will be skipped");
            handle.cancel();
        }
    });
    flag
}

fn orchestrator(config: &StagewardConfig) -> PromotionOrchestrator {
    PromotionOrchestrator::new(engine(config), state_lock(config), config.environments())
        .with_retry_policy(config.retry_policy())
        .with_exit_codes(config.exit_code_policy())
        .with_cancellation(cancel_on_ctrl_c())
}

fn read_changeset(args: &ChangeArgs) -> Result<ChangeSet> {
    let mut paths = args.changed.clone();
    if let Some(file) = &args.changed_file {
        let text = if file == Path::new("-") {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read changed paths from stdin")?;
            buf
        } else {
            std::fs::read_to_string(file)
                .with_context(|| format!("Failed to read {}", file.display()))?
        };
        paths.extend(text.lines().map(str::to_string));
    }
    Ok(ChangeSet::new(paths))
}

fn write_report<T: Serialize>(out: &Output, report: &T) -> Result<()> {
    let Some(path) = &out.report else {
        return Ok(());
    };
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write report {}", path.display()))?;
    info!(path = %path.display(), "report written");
    Ok(())
}

// ---------------------------------------------------------------------------
// Promotion
// ---------------------------------------------------------------------------

async fn cmd_promote(
    config: &StagewardConfig,
    out: &Output,
    environment: &str,
    action: Action,
    confirm: Option<String>,
) -> Result<u8> {
    let mut request = PromotionRequest::new(action, [EnvironmentId::from(environment)]);
    if let Some(token) = confirm {
        request = request.with_confirmation(token);
    }
    promote(config, out, &request).await
}

async fn cmd_run(
    config: &StagewardConfig,
    out: &Output,
    action: Action,
    changes: &ChangeArgs,
    confirm: Vec<String>,
) -> Result<u8> {
    let changeset = read_changeset(changes)?;
    let affected: Vec<EnvironmentId> = detections(config, &changeset)
        .into_iter()
        .map(|d| d.environment)
        .collect();

    if action == Action::Destroy {
        return Err(CoreError::from(ValidationError::UnsupportedAction {
            action: action.to_string(),
            count: affected.len(),
        })
        .into());
    }
    if affected.is_empty() {
        println!("No environments affected by {} changed path(s).", changeset.len());
        return Ok(0);
    }

    let mut request = PromotionRequest::new(action, affected);
    for token in confirm {
        request = request.with_confirmation(token);
    }
    promote(config, out, &request).await
}

async fn promote(config: &StagewardConfig, out: &Output, request: &PromotionRequest) -> Result<u8> {
    let run = orchestrator(config).run(request).await?;
    print_run(&run);
    write_report(out, &run)?;
    Ok(run.exit_code())
}

fn print_run(run: &PromotionRun) {
    println!("Run {} ({}): {}", run.run_id, run.action, run.status.as_str());
    for stage in &run.stages {
        let detail = match (stage.state, &stage.skip_reason, &stage.failure) {
            (StageState::Skipped, Some(reason), _) => reason.as_str().to_string(),
            (StageState::Failed, _, Some(failure)) => failure.message.clone(),
            _ => stage
                .plan
                .as_ref()
                .and_then(|p| p.summary.as_ref())
                .map(|s| s.to_string())
                .unwrap_or_default(),
        };
        println!(
            "  {:<12} {:<8} {}",
            stage.environment.as_str(),
            stage.state.as_str(),
            detail
        );
    }
    if run.action == Action::Plan {
        for stage in run.stages.iter().filter(|s| s.failure.is_none()) {
            if let Some(plan) = &stage.plan {
                println!("\n--- {} plan ---\n{}", stage.environment, plan.payload);
            }
        }
    }
    for stage in &run.stages {
        if let Some(diagnostic) = stage
            .failure
            .as_ref()
            .and_then(|f| f.diagnostic.as_deref())
        {
            println!("\n--- {} ---\n{}", stage.environment, diagnostic);
        }
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

fn detections(config: &StagewardConfig, changeset: &ChangeSet) -> Vec<stageward_core::Detection> {
    let filters =
        EnvironmentFilters::from_environments(&config.environments(), &config.shared_paths);
    detect_detailed(changeset, &filters)
}

fn cmd_detect(config: &StagewardConfig, out: &Output, changes: &ChangeArgs) -> Result<u8> {
    let changeset = read_changeset(changes)?;
    let affected = detections(config, &changeset);

    if out.json {
        println!("{}", serde_json::to_string_pretty(&affected)?);
    } else if affected.is_empty() {
        println!("No environments affected.");
    } else {
        for detection in &affected {
            println!("{}", detection.environment);
        }
    }
    write_report(out, &affected)?;
    Ok(0)
}

// ---------------------------------------------------------------------------
// Drift
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct DriftSummary {
    environment: String,
    outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    incident_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    incident_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    created: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<&DriftReport> for DriftSummary {
    fn from(report: &DriftReport) -> Self {
        let mut summary = DriftSummary {
            environment: report.environment.to_string(),
            outcome: "error".to_string(),
            incident_id: None,
            incident_url: None,
            created: None,
            error: None,
        };
        match &report.result {
            Ok(outcome) => {
                summary.outcome = outcome.as_str().to_string();
                if let Some(incident) = outcome.incident() {
                    summary.incident_id = Some(incident.id.clone());
                    summary.incident_url = incident.url.clone();
                }
                match outcome {
                    DriftOutcome::Drifted { created, .. } => summary.created = Some(*created),
                    DriftOutcome::PlanFailed { plan } => {
                        summary.error =
                            Some(format!("plan failed with exit code {}", plan.exit_code))
                    }
                    DriftOutcome::InSync { .. } => {}
                }
            }
            Err(err) => summary.error = Some(err.to_string()),
        }
        summary
    }
}

/// Pick the environments a drift check covers.
fn drift_targets(
    configured: Vec<Environment>,
    requested: &[String],
    all: bool,
) -> std::result::Result<Vec<Environment>, ValidationError> {
    if all {
        return Ok(configured);
    }
    if requested.is_empty() {
        return Err(ValidationError::NoEnvironments);
    }
    let mut selected = Vec::with_capacity(requested.len());
    for id in requested {
        let env = configured
            .iter()
            .find(|e| e.id.as_str() == id)
            .ok_or_else(|| ValidationError::UnknownEnvironment(id.clone()))?;
        if !selected.iter().any(|e: &Environment| e.id == env.id) {
            selected.push(env.clone());
        }
    }
    selected.sort_by_key(|e| e.position);
    Ok(selected)
}

async fn cmd_drift(
    config: &StagewardConfig,
    out: &Output,
    requested: &[String],
    all: bool,
) -> Result<u8> {
    let targets = drift_targets(config.environments(), requested, all).map_err(CoreError::from)?;
    let store = incident_store(config).await?;

    let executor = PlanExecutor::new(engine(config))
        .with_retry_policy(config.retry_policy())
        .with_exit_codes(config.exit_code_policy());
    let reconciler = DriftReconciler::new(executor, tracker(config, store))
        .with_auto_close(config.drift.auto_close);

    let reports = reconciler.reconcile_all(&targets).await;
    let summaries: Vec<DriftSummary> = reports.iter().map(DriftSummary::from).collect();

    for summary in &summaries {
        let detail = match (&summary.incident_url, &summary.incident_id, &summary.error) {
            (_, _, Some(err)) => err.clone(),
            (Some(url), _, None) => url.clone(),
            (None, Some(id), None) => id.clone(),
            (None, None, None) => String::new(),
        };
        println!("  {:<12} {:<12} {}", summary.environment, summary.outcome, detail);
    }
    write_report(out, &summaries)?;

    Ok(if reports.iter().any(DriftReport::is_failure) { 2 } else { 0 })
}

// ---------------------------------------------------------------------------
// Incidents
// ---------------------------------------------------------------------------

async fn cmd_incidents_list(
    config: &StagewardConfig,
    out: &Output,
    environment: Option<&str>,
) -> Result<u8> {
    let tracker = tracker(config, incident_store(config).await?);
    let labels = match environment {
        Some(env) => IncidentKey::drift(env).labels(),
        None => vec!["drift".to_string()],
    };
    let incidents = tracker.list_open(&labels).await?;

    if out.json {
        println!("{}", serde_json::to_string_pretty(&incidents)?);
    } else if incidents.is_empty() {
        println!("No open incidents.");
    } else {
        for incident in &incidents {
            println!(
                "{}  {}  {}  {}",
                incident.id,
                incident.key,
                incident.created_at.format("%Y-%m-%d %H:%M"),
                incident.url.as_deref().unwrap_or(&incident.title)
            );
        }
    }
    write_report(out, &incidents)?;
    Ok(0)
}

async fn cmd_incidents_close(
    config: &StagewardConfig,
    environment: &str,
    category: &str,
) -> Result<u8> {
    let tracker = tracker(config, incident_store(config).await?);
    let closed = tracker.close(&IncidentKey::new(environment, category)).await?;
    if closed.is_empty() {
        println!("No open {category} incidents for {environment}.");
    }
    for incident in &closed {
        println!("Closed {} ({})", incident.id, incident.key);
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
shared_paths = ["modules/**"]

[[environments]]
id = "dev"
config_root = "environments/dev"

[[environments]]
id = "staging"
config_root = "environments/staging"

[[environments]]
id = "prod"
config_root = "environments/prod"
requires_confirmation = true
"#;

    fn config() -> StagewardConfig {
        StagewardConfig::from_toml_str(CONFIG).unwrap()
    }

    #[test]
    fn cli_parses_promote_with_confirmation() {
        let cli = Cli::try_parse_from([
            "stageward", "promote", "prod", "--action", "destroy", "--confirm", "prod",
        ])
        .unwrap();
        match cli.command {
            Commands::Promote {
                environment,
                action,
                confirm,
            } => {
                assert_eq!(environment, "prod");
                assert_eq!(action, Action::Destroy);
                assert_eq!(confirm.as_deref(), Some("prod"));
            }
            _ => panic!("expected promote"),
        }
    }

    #[test]
    fn cli_rejects_unknown_action() {
        let err = Cli::try_parse_from(["stageward", "promote", "dev", "--action", "rollback"])
            .err()
            .unwrap();
        assert_eq!(usage_exit_code(err.kind()), 1);
    }

    #[test]
    fn help_and_version_exit_cleanly() {
        let help = Cli::try_parse_from(["stageward", "--help"]).err().unwrap();
        assert_eq!(usage_exit_code(help.kind()), 0);
        let version = Cli::try_parse_from(["stageward", "--version"]).err().unwrap();
        assert_eq!(usage_exit_code(version.kind()), 0);
        let missing = Cli::try_parse_from(["stageward", "promote"]).err().unwrap();
        assert_eq!(usage_exit_code(missing.kind()), 1);
    }

    #[test]
    fn cli_drift_all_conflicts_with_names() {
        assert!(Cli::try_parse_from(["stageward", "drift", "dev", "--all"]).is_err());
        assert!(Cli::try_parse_from(["stageward", "drift", "--all"]).is_ok());
    }

    #[test]
    fn cli_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "stageward",
            "detect",
            "--changed",
            "modules/eks/main.tf",
            "--json",
            "--config",
            "infra.toml",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.config, PathBuf::from("infra.toml"));
    }

    #[test]
    fn changeset_merges_flags_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("changed.txt");
        std::fs::write(&file, "./environments/dev/main.tf\n\nmodules\\vpc\\main.tf\n").unwrap();

        let changes = ChangeArgs {
            changed: vec!["README.md".to_string()],
            changed_file: Some(file),
        };
        let changeset = read_changeset(&changes).unwrap();
        let paths: Vec<&str> = changeset.paths().collect();
        assert_eq!(paths, vec!["README.md", "environments/dev/main.tf", "modules/vpc/main.tf"]);
    }

    #[test]
    fn shared_module_change_reaches_every_environment() {
        let changeset = ChangeSet::new(["modules/eks/main.tf"]);
        let ids: Vec<String> = detections(&config(), &changeset)
            .into_iter()
            .map(|d| d.environment.to_string())
            .collect();
        assert_eq!(ids, vec!["dev", "staging", "prod"]);
    }

    #[test]
    fn drift_targets_require_names_or_all() {
        let envs = config().environments();
        assert_eq!(
            drift_targets(envs.clone(), &[], false).unwrap_err(),
            ValidationError::NoEnvironments
        );
        assert_eq!(drift_targets(envs.clone(), &[], true).unwrap().len(), 3);

        let picked =
            drift_targets(envs.clone(), &["prod".to_string(), "dev".to_string()], false).unwrap();
        let ids: Vec<&str> = picked.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["dev", "prod"]);

        assert_eq!(
            drift_targets(envs, &["qa".to_string()], false).unwrap_err(),
            ValidationError::UnknownEnvironment("qa".to_string())
        );
    }

    #[test]
    fn exit_codes_follow_error_class() {
        let validation = anyhow::Error::new(CoreError::from(ValidationError::NoEnvironments));
        assert_eq!(exit_code_for(&validation), 1);

        let execution = anyhow::Error::new(CoreError::Execution {
            environment: "dev".to_string(),
            reason: "terraform not found".to_string(),
        })
        .context("promotion failed");
        assert_eq!(exit_code_for(&execution), 2);

        assert_eq!(exit_code_for(&anyhow::anyhow!("bad flag")), 1);
    }

    #[test]
    fn missing_config_is_a_validation_error() {
        let err = load_config(Path::new("/nonexistent/stageward.toml")).unwrap_err();
        assert_eq!(exit_code_for(&err), 1);
    }

    #[test]
    fn drift_summary_reports_plan_failures() {
        let report = DriftReport {
            environment: EnvironmentId::from("staging"),
            result: Err(CoreError::Execution {
                environment: "staging".to_string(),
                reason: "missing required environment variable(s): AWS_ROLE_ARN".to_string(),
            }),
        };
        let summary = DriftSummary::from(&report);
        assert_eq!(summary.outcome, "error");
        assert!(summary.error.unwrap().contains("AWS_ROLE_ARN"));
    }
}
