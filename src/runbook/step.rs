//! Steps and their runner bindings.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::looping::{Loop, LoopSpec};
use super::operator::OperatorHandle;
use super::result::StepResult;
use super::runner::{RunnerKind, RunnerSpec};
use crate::core::{Error, Result};

/// A shell command for the built-in exec runner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecRequest {
    pub command: String,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl ExecRequest {
    /// Accepts `exec: "cmd"` or the full map.
    pub fn from_value(value: &Value) -> std::result::Result<Self, String> {
        match value {
            Value::String(command) => Ok(Self { command: command.clone(), ..Default::default() }),
            Value::Object(_) => serde_json::from_value(value.clone()).map_err(|e| e.to_string()),
            other => Err(format!("exec expects a command or a map, got {other}")),
        }
    }
}

/// Another runbook run as a nested step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncludeSpec {
    /// Resolved against the including runbook's directory.
    pub path: PathBuf,
    pub vars: Map<String, Value>,
}

/// `dump:` - an expression, optionally written to a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DumpSpec {
    Expr(String),
    Full {
        expr: String,
        #[serde(default)]
        out: Option<PathBuf>,
    },
}

impl DumpSpec {
    pub fn expr(&self) -> &str {
        match self {
            Self::Expr(expr) | Self::Full { expr, .. } => expr,
        }
    }

    pub fn out(&self) -> Option<&PathBuf> {
        match self {
            Self::Expr(_) => None,
            Self::Full { out, .. } => out.as_ref(),
        }
    }
}

/// The one main action of a step.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerBinding {
    Exec(ExecRequest),
    Include(IncludeSpec),
    /// Step-level `runners:`; defines runners for later steps.
    Define(BTreeMap<String, RunnerSpec>),
    /// A runner defined by the runbook or registered with the engine.
    Named { name: String, kind: RunnerKind, request: Value },
    /// A name not known at load time; bound when the step runs.
    Unresolved { name: String, request: Value },
}

impl RunnerBinding {
    pub fn kind(&self) -> Option<RunnerKind> {
        match self {
            Self::Exec(_) => Some(RunnerKind::Exec),
            Self::Include(_) => Some(RunnerKind::Include),
            Self::Define(_) => Some(RunnerKind::Definition),
            Self::Named { kind, .. } => Some(*kind),
            Self::Unresolved { .. } => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Unresolved { .. })
    }
}

/// A validated step as loaded from a runbook.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepDef {
    pub key: String,
    pub desc: String,
    pub condition: Option<String>,
    pub loop_spec: Option<LoopSpec>,
    pub defer: bool,
    pub force: bool,
    pub binding: Option<RunnerBinding>,
    pub dump: Option<DumpSpec>,
    pub bind: Option<Map<String, Value>>,
    pub test: Option<String>,
}

impl StepDef {
    pub fn has_auxiliary(&self) -> bool {
        self.dump.is_some() || self.bind.is_some() || self.test.is_some()
    }
}

/// A step inside a running operator.
#[derive(Debug)]
pub struct Step {
    pub index: usize,
    pub key: String,
    pub desc: String,
    pub condition: Option<String>,
    pub defer: bool,
    pub force: bool,
    pub binding: Option<RunnerBinding>,
    pub dump: Option<DumpSpec>,
    pub bind: Option<Map<String, Value>>,
    pub test: Option<String>,
    pub(super) looped: Option<Loop>,
    operator: OperatorHandle,
    result: Option<StepResult>,
}

impl Step {
    pub fn new(index: usize, def: &StepDef, operator: OperatorHandle, looped: Option<Loop>) -> Self {
        Self {
            index,
            key: def.key.clone(),
            desc: def.desc.clone(),
            condition: def.condition.clone(),
            defer: def.defer,
            force: def.force,
            binding: def.binding.clone(),
            dump: def.dump.clone(),
            bind: def.bind.clone(),
            test: def.test.clone(),
            looped,
            operator,
            result: None,
        }
    }

    /// Handle of the operator this step belongs to.
    pub fn operator(&self) -> OperatorHandle {
        self.operator
    }

    pub fn has_loop(&self) -> bool {
        self.looped.is_some()
    }

    pub fn result(&self) -> Option<&StepResult> {
        self.result.as_ref()
    }

    /// Record this attempt's result. Recording twice is a bug in the caller.
    pub fn record_result(&mut self, result: StepResult) -> Result<()> {
        if self.result.is_some() {
            return Err(Error::DuplicateResult(self.key.clone()));
        }
        self.result = Some(result);
        Ok(())
    }

    pub fn reset_result(&mut self) {
        self.result = None;
    }
}
