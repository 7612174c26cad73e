//! Stageward engine: runs the IaC CLI as a child process.
//!
//! [`TerraformEngine`] implements [`stageward_core::InfraEngine`] on top of
//! any Terraform-compatible binary (`terraform`, `tofu`, or a wrapper
//! script). Commands are built in [`stage`], spawned by [`runner`].

pub mod runner;
pub mod stage;
pub mod terraform;

pub use runner::{CommandSpec, ProcessRunner, RunnerError};
pub use stage::EngineStage;
pub use terraform::{parse_lock_holder, TerraformEngine, LOCK_ERROR_MARKER};
