//! Engine subcommands and their argument lists.

use stageward_core::Environment;

use crate::runner::CommandSpec;

/// Engine subcommands Stageward drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineStage {
    /// init -input=false
    Init,

    /// plan -input=false -no-color -detailed-exitcode -lock-timeout=0s
    Plan,

    /// apply -input=false -no-color -auto-approve
    Apply,

    /// destroy -input=false -no-color -auto-approve
    Destroy,
}

impl EngineStage {
    pub fn name(&self) -> &'static str {
        match self {
            EngineStage::Init => "init",
            EngineStage::Plan => "plan",
            EngineStage::Apply => "apply",
            EngineStage::Destroy => "destroy",
        }
    }

    /// Subcommand arguments, excluding var files.
    pub fn args(&self) -> Vec<String> {
        let args: &[&str] = match self {
            EngineStage::Init => &["init", "-input=false", "-no-color"],
            EngineStage::Plan => &[
                "plan",
                "-input=false",
                "-no-color",
                "-detailed-exitcode",
                // Lock contention must surface immediately; waiting is done by the retry policy.
                "-lock-timeout=0s",
            ],
            EngineStage::Apply => &["apply", "-input=false", "-no-color", "-auto-approve"],
            EngineStage::Destroy => &["destroy", "-input=false", "-no-color", "-auto-approve"],
        };
        args.iter().map(|a| a.to_string()).collect()
    }

    fn takes_variables(&self) -> bool {
        !matches!(self, EngineStage::Init)
    }

    /// Whether the wall-clock bound applies. An apply or destroy that has
    /// started runs to completion.
    pub fn is_bounded(&self) -> bool {
        matches!(self, EngineStage::Init | EngineStage::Plan)
    }

    /// Build the invocation of this stage for `environment`.
    ///
    /// `base` is the engine command (`["terraform"]`, `["tofu"]`, a wrapper).
    /// Variables travel as `TF_VAR_<key>` so secrets never land on the
    /// command line. `timeout_secs` only bounds init and plan.
    pub fn command_for(
        &self,
        base: &[String],
        environment: &Environment,
        timeout_secs: u64,
    ) -> CommandSpec {
        let mut command = base.to_vec();
        command.extend(self.args());

        let timeout_secs = if self.is_bounded() { timeout_secs } else { 0 };
        let mut spec = CommandSpec::new(self.name(), Vec::new(), environment.config_root.clone())
            .with_timeout_secs(timeout_secs)
            .with_env("TF_IN_AUTOMATION", "1");

        if self.takes_variables() {
            for file in &environment.var_files {
                command.push(format!("-var-file={}", file.display()));
            }
            for (key, value) in &environment.variables {
                spec = spec.with_env(format!("TF_VAR_{key}"), value.expose());
            }
        }

        spec.command = command;
        spec
    }
}

impl std::fmt::Display for EngineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stageward_core::VarValue;

    fn prod() -> Environment {
        let mut env = Environment::new("prod", 2, "/repo/environments/prod")
            .with_variable("region", VarValue::Plain("us-east-1".to_string()))
            .with_variable("db_password", VarValue::Secret("hunter2".to_string()));
        env.var_files.push("/repo/environments/prod/prod.tfvars".into());
        env
    }

    #[test]
    fn plan_uses_detailed_exitcode_and_no_lock_wait() {
        let args = EngineStage::Plan.args();
        assert!(args.contains(&"-detailed-exitcode".to_string()));
        assert!(args.contains(&"-lock-timeout=0s".to_string()));
        assert_eq!(args[0], "plan");
    }

    #[test]
    fn mutating_stages_auto_approve() {
        assert!(EngineStage::Apply.args().contains(&"-auto-approve".to_string()));
        assert!(EngineStage::Destroy.args().contains(&"-auto-approve".to_string()));
        assert!(!EngineStage::Plan.args().contains(&"-auto-approve".to_string()));
    }

    #[test]
    fn command_carries_var_files_and_tf_vars() {
        let base = vec!["tofu".to_string()];
        let spec = EngineStage::Apply.command_for(&base, &prod(), 600);

        assert_eq!(spec.command[0], "tofu");
        assert_eq!(spec.command[1], "apply");
        assert_eq!(
            spec.command.last().map(String::as_str),
            Some("-var-file=/repo/environments/prod/prod.tfvars")
        );
        assert_eq!(spec.cwd, std::path::PathBuf::from("/repo/environments/prod"));
        assert!(spec
            .env
            .contains(&("TF_VAR_region".to_string(), "us-east-1".to_string())));
        assert!(spec
            .env
            .contains(&("TF_VAR_db_password".to_string(), "hunter2".to_string())));
        assert!(!spec.command.iter().any(|a| a.contains("hunter2")));
    }

    #[test]
    fn only_init_and_plan_are_time_bounded() {
        let base = vec!["terraform".to_string()];
        let env = prod();
        assert_eq!(EngineStage::Init.command_for(&base, &env, 600).timeout_secs, 600);
        assert_eq!(EngineStage::Plan.command_for(&base, &env, 600).timeout_secs, 600);
        assert_eq!(EngineStage::Apply.command_for(&base, &env, 600).timeout_secs, 0);
        assert_eq!(EngineStage::Destroy.command_for(&base, &env, 600).timeout_secs, 0);
    }

    #[test]
    fn init_ignores_variables() {
        let spec = EngineStage::Init.command_for(&["terraform".to_string()], &prod(), 0);
        assert!(!spec.command.iter().any(|a| a.starts_with("-var-file")));
        assert!(!spec.env.iter().any(|(k, _)| k.starts_with("TF_VAR_")));
    }
}
