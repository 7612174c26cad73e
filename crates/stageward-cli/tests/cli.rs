//! End-to-end runs of the `stageward` binary against a scripted engine.
//!
//! The engine is `sh fake-terraform.sh`; it logs `<environment> <argv>` to
//! `$FAKE_LOG` and reacts to `FAKE_APPLY_FAIL` / `FAKE_IN_SYNC`.

#![cfg(unix)]

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use tempfile::TempDir;

const FAKE_TERRAFORM: &str = r#"env_name=$(basename "$(pwd -P)")
echo "$env_name $*" >> "$FAKE_LOG"
case "$1" in
  plan)
    if [ "$env_name" = "${FAKE_IN_SYNC:-}" ]; then exit 0; fi
    echo '  # module.eks.aws_eks_node_group.main will be updated in-place'
    echo 'Plan: 0 to add, 1 to change, 0 to destroy.'
    exit 2 ;;
  apply)
    if [ "$env_name" = "${FAKE_APPLY_FAIL:-}" ]; then
      echo 'Error: updating EKS Node Group: AccessDeniedException' >&2
      exit 1
    fi
    echo 'Apply complete! Resources: 0 added, 1 changed, 0 destroyed.' ;;
  destroy)
    echo 'Destroy complete! Resources: 4 destroyed.' ;;
esac
exit 0
"#;

struct Repo {
    dir: TempDir,
}

impl Repo {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        for env in ["dev", "staging", "prod"] {
            std::fs::create_dir_all(dir.path().join("environments").join(env)).unwrap();
        }
        let script = dir.path().join("fake-terraform.sh");
        std::fs::write(&script, FAKE_TERRAFORM).unwrap();

        let config = format!(
            r#"
shared_paths = ["modules/**"]

[settings]
engine_command = ["sh", "{script}"]
init = false
lock_timeout_secs = 5

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

[incidents]
backend = "memory"
"#,
            script = script.display()
        );
        std::fs::write(dir.path().join("stageward.toml"), config).unwrap();
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn stageward(&self) -> Command {
        let mut cmd = Command::cargo_bin("stageward").unwrap();
        cmd.current_dir(self.dir.path())
            .env("STAGEWARD_CONFIG", self.path("stageward.toml"))
            .env("FAKE_LOG", self.path("calls.log"))
            .env_remove("RUST_LOG")
            .env_remove("FAKE_APPLY_FAIL")
            .env_remove("FAKE_IN_SYNC");
        cmd
    }

    fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.path("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn read_json(path: &Path) -> serde_json::Value {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

#[test]
fn detect_fans_out_shared_module_change() {
    let repo = Repo::new();
    let output = repo
        .stageward()
        .args(["detect", "--changed", "modules/eks/main.tf"])
        .output()
        .unwrap();

    assert!(output.status.success());
    assert_eq!(
        stdout(&output).lines().collect::<Vec<_>>(),
        vec!["dev", "staging", "prod"]
    );
}

#[test]
fn detect_json_lists_matched_paths() {
    let repo = Repo::new();
    let output = repo
        .stageward()
        .args(["--json", "detect", "--changed", "environments/staging/main.tf"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let list = parsed.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["environment"], "staging");
    assert_eq!(list[0]["matched_paths"][0], "environments/staging/main.tf");
}

#[test]
fn run_apply_promotes_in_order_and_writes_report() {
    let repo = Repo::new();
    let report = repo.path("run.json");
    let output = repo
        .stageward()
        .args(["run", "--action", "apply", "--changed", "modules/eks/main.tf"])
        .args(["--confirm", "prod", "--report"])
        .arg(&report)
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(0), "{}", stdout(&output));
    let order: Vec<String> = repo
        .calls()
        .iter()
        .filter(|c| c.contains(" apply "))
        .map(|c| c.split(' ').next().unwrap_or_default().to_string())
        .collect();
    assert_eq!(order, vec!["dev", "staging", "prod"]);

    let run = read_json(&report);
    assert_eq!(run["status"], "succeeded");
    assert_eq!(run["stages"].as_array().unwrap().len(), 3);
    assert!(run["stages"].as_array().unwrap().iter().all(|s| s["state"] == "success"));
}

#[test]
fn missing_confirmation_blocks_whole_run() {
    let repo = Repo::new();
    let output = repo
        .stageward()
        .args(["run", "--action", "apply", "--changed", "modules/eks/main.tf"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(repo.calls().is_empty());
}

#[test]
fn failed_apply_skips_later_environments() {
    let repo = Repo::new();
    let report = repo.path("run.json");
    let output = repo
        .stageward()
        .env("FAKE_APPLY_FAIL", "dev")
        .args(["run", "--action", "apply", "--changed", "modules/vpc/main.tf"])
        .args(["--confirm", "prod", "--report"])
        .arg(&report)
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
    assert!(stdout(&output).contains("AccessDeniedException"));
    assert!(!repo
        .calls()
        .iter()
        .any(|c| c.starts_with("staging") || c.starts_with("prod")));

    let run = read_json(&report);
    assert_eq!(run["status"], "failed");
    assert_eq!(run["stages"][1]["state"], "skipped");
    assert_eq!(run["stages"][1]["skip_reason"], "upstream_failed");
}

#[test]
fn destroy_with_wrong_confirmation_never_calls_engine() {
    let repo = Repo::new();
    let output = repo
        .stageward()
        .args(["promote", "prod", "--action", "destroy", "--confirm", "staging"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(repo.calls().is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(stderr.matches("does not match").count(), 1, "{stderr}");
}

#[test]
fn destroy_with_matching_confirmation_runs_destroy() {
    let repo = Repo::new();
    let output = repo
        .stageward()
        .args(["promote", "dev", "--action", "destroy", "--confirm", "dev"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(0));
    let calls = repo.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].starts_with("dev destroy -input=false -no-color -auto-approve"));
}

#[test]
fn plan_run_prints_the_diff() {
    let repo = Repo::new();
    let output = repo
        .stageward()
        .args(["promote", "dev", "--action", "plan"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(0));
    let text = stdout(&output);
    assert!(text.contains("--- dev plan ---"), "{text}");
    assert!(text.contains("module.eks.aws_eks_node_group.main will be updated in-place"));
    assert!(text.contains("Plan: 0 to add, 1 to change, 0 to destroy."));
}

#[test]
fn plan_without_changes_leaves_apply_untouched() {
    let repo = Repo::new();
    let output = repo
        .stageward()
        .env("FAKE_IN_SYNC", "staging")
        .args(["promote", "staging", "--action", "apply"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(0));
    assert!(stdout(&output).contains("no changes"));
    assert!(!repo.calls().iter().any(|c| c.contains(" apply ")));
}

#[test]
fn drift_reports_each_environment() {
    let repo = Repo::new();
    let report = repo.path("drift.json");
    let output = repo
        .stageward()
        .env("FAKE_IN_SYNC", "dev")
        .args(["drift", "--all", "--report"])
        .arg(&report)
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(0));
    let summaries = read_json(&report);
    assert_eq!(summaries[0]["outcome"], "in_sync");
    assert_eq!(summaries[1]["outcome"], "drifted");
    assert_eq!(summaries[1]["created"], true);
    assert_eq!(summaries[2]["outcome"], "drifted");
    assert!(!repo.calls().iter().any(|c| c.contains(" apply ")));
}

#[test]
fn drift_requires_targets() {
    let repo = Repo::new();
    let output = repo.stageward().arg("drift").output().unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn usage_errors_exit_with_validation_code() {
    let repo = Repo::new();
    for args in [
        vec!["promote", "dev", "--action", "bogus"],
        vec!["promote", "dev", "--action=bogus"],
        vec!["promote"],
        vec!["no-such-command"],
    ] {
        let output = repo.stageward().args(&args).output().unwrap();
        assert_eq!(output.status.code(), Some(1), "{args:?}");
    }
    assert!(repo.calls().is_empty());
}

#[test]
fn help_exits_successfully() {
    let repo = Repo::new();
    let output = repo.stageward().arg("--help").output().unwrap();
    assert_eq!(output.status.code(), Some(0));
    assert!(stdout(&output).contains("promote"));
}

#[test]
fn missing_config_exits_with_validation_code() {
    let repo = Repo::new();
    let output = repo
        .stageward()
        .env("STAGEWARD_CONFIG", repo.path("absent.toml"))
        .args(["detect", "--changed", "README.md"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("absent.toml"));
}
