//! Runbook schema definitions.
//!
//! [`RunbookDef`] mirrors the YAML file. The parser turns it into a validated
//! [`Book`], which is what operators are built from.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::looping::{LoopDef, LoopSpec};
use super::runner::RunnerSpec;
use super::step::{RunnerBinding, StepDef};
use crate::core::duration;

/// A runbook file as written.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunbookDef {
    #[serde(default)]
    pub desc: String,

    #[serde(default)]
    pub labels: Vec<String>,

    /// Alias to runbook path, relative to this file.
    #[serde(default)]
    pub needs: BTreeMap<String, String>,

    /// Concurrency groups, `name` or `name:N`.
    #[serde(default)]
    pub concurrency: OneOrMany,

    #[serde(default, rename = "if")]
    pub condition: Option<String>,

    #[serde(default)]
    pub force: bool,

    #[serde(default)]
    pub fail_fast: bool,

    #[serde(default)]
    pub trace: bool,

    /// Pause between steps.
    #[serde(default, with = "duration::option")]
    pub interval: Option<Duration>,

    #[serde(default, rename = "loop")]
    pub loop_def: Option<LoopDef>,

    #[serde(default)]
    pub vars: Map<String, Value>,

    #[serde(default)]
    pub runners: BTreeMap<String, RunnerSpec>,

    #[serde(default)]
    pub steps: StepsDef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl Default for OneOrMany {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s],
            Self::Many(v) => v,
        }
    }
}

/// Steps as a list, or as a map whose keys name the steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepsDef {
    List(Vec<Map<String, Value>>),
    Keyed(serde_yaml::Mapping),
}

impl Default for StepsDef {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

/// A validated runbook.
#[derive(Debug, Clone, Default)]
pub struct Book {
    /// Absolute, cleaned path. Empty for books built in memory without one.
    pub path: PathBuf,
    pub desc: String,
    pub labels: Vec<String>,
    /// Alias and resolved path of every needed runbook.
    pub needs: Vec<(String, PathBuf)>,
    pub concurrency: Vec<String>,
    pub condition: Option<String>,
    pub force: bool,
    pub fail_fast: bool,
    pub trace: bool,
    pub interval: Option<Duration>,
    pub loop_spec: Option<LoopSpec>,
    pub vars: Map<String, Value>,
    pub runners: BTreeMap<String, RunnerSpec>,
    pub steps: Vec<StepDef>,
    /// Steps were declared as a map.
    pub keyed: bool,
}

impl Book {
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Step keys, when steps were declared as a map.
    pub fn step_keys(&self) -> Option<Vec<String>> {
        self.keyed.then(|| self.steps.iter().map(|s| s.key.clone()).collect())
    }

    /// Runbooks this one includes.
    pub fn included_paths(&self) -> Vec<PathBuf> {
        self.steps
            .iter()
            .filter_map(|s| match &s.binding {
                Some(RunnerBinding::Include(spec)) => Some(spec.path.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn display_path(&self) -> String {
        self.path.display().to_string()
    }
}
