//! Scripted engine for tests.
//!
//! `ScriptedEngine` records every call and answers from per-environment
//! scripts: one-shot responses are consumed first, then the sticky response
//! for that operation, then a clean default (exit 0, empty output).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::Environment;
use crate::engine::{EngineError, EngineOutput, InfraEngine};

/// Engine operation, as recorded by the spy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    Diff,
    Apply,
    Destroy,
}

/// A single recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCall {
    pub environment: String,
    pub op: EngineOp,
}

type Response = Result<EngineOutput, EngineError>;

#[derive(Debug, Default)]
pub struct ScriptedEngine {
    calls: Mutex<Vec<EngineCall>>,
    queued: Mutex<HashMap<(String, EngineOp), VecDeque<Response>>>,
    sticky: Mutex<HashMap<(String, EngineOp), Response>>,
}

/// Plan output with a summary line and the `-detailed-exitcode` changes code.
pub fn changes_output(add: u32, change: u32, destroy: u32) -> EngineOutput {
    EngineOutput::new(
        2,
        format!(
            concat!(
                "  # aws_instance.web will be updated in-place\n",
                "  ~ resource \"aws_instance\" \"web\" {{\n",
                "    }}\n",
                "\n",
                "Plan: {add} to add, {change} to change, {destroy} to destroy.\n",
            ),
            add = add,
            change = change,
            destroy = destroy,
        ),
        "",
    )
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `op` on `environment` with `response`.
    pub fn on(&self, environment: &str, op: EngineOp, response: Response) -> &Self {
        self.sticky
            .lock()
            .unwrap()
            .insert((environment.to_string(), op), response);
        self
    }

    /// Answer the next `op` on `environment` with `response`, once.
    pub fn push(&self, environment: &str, op: EngineOp, response: Response) -> &Self {
        self.queued
            .lock()
            .unwrap()
            .entry((environment.to_string(), op))
            .or_default()
            .push_back(response);
        self
    }

    /// Make every dry-run on `environment` report pending changes.
    pub fn with_changes(self, environment: &str) -> Self {
        self.on(environment, EngineOp::Diff, Ok(changes_output(1, 0, 0)));
        self
    }

    /// Make applies on `environment` fail with `stderr`.
    pub fn failing_apply(self, environment: &str, stderr: &str) -> Self {
        self.on(
            environment,
            EngineOp::Apply,
            Ok(EngineOutput::new(1, "", stderr)),
        );
        self
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Operations invoked against `environment`, in order.
    pub fn ops_for(&self, environment: &str) -> Vec<EngineOp> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.environment == environment)
            .map(|c| c.op)
            .collect()
    }

    fn answer(&self, environment: &Environment, op: EngineOp) -> Response {
        let id = environment.id.to_string();
        self.calls.lock().unwrap().push(EngineCall {
            environment: id.clone(),
            op,
        });
        let key = (id, op);
        if let Some(next) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return next;
        }
        self.sticky
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Ok(EngineOutput::default()))
    }
}

#[async_trait]
impl InfraEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn compute_diff(&self, environment: &Environment) -> Result<EngineOutput, EngineError> {
        self.answer(environment, EngineOp::Diff)
    }

    async fn apply_diff(&self, environment: &Environment) -> Result<EngineOutput, EngineError> {
        self.answer(environment, EngineOp::Apply)
    }

    async fn destroy(&self, environment: &Environment) -> Result<EngineOutput, EngineError> {
        self.answer(environment, EngineOp::Destroy)
    }
}
