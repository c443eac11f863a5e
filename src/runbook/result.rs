//! Run results.
//!
//! A tree mirroring operators and steps. Include steps carry the child run's
//! result. Elapsed times are filled in from the profiler after a run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::profile::{Profile, SpanKind};
use crate::core::duration::serialize_millis;

/// What happened to a step or a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    NotRun,
    Success,
    Failure,
    Skipped,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRun => "not run",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub id: String,
    pub index: usize,
    pub key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub desc: String,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub included: Vec<RunResult>,
}

impl StepResult {
    pub fn new(id: impl Into<String>, index: usize, key: impl Into<String>, desc: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            index,
            key: key.into(),
            desc: desc.into(),
            outcome: Outcome::NotRun,
            error: None,
            elapsed: Duration::ZERO,
            included: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub id: String,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub desc: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    pub included: bool,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    pub steps: Vec<StepResult>,
}

impl RunResult {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>, desc: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            desc: desc.into(),
            labels: Vec::new(),
            included: false,
            skipped: false,
            error: None,
            elapsed: Duration::ZERO,
            steps: Vec::new(),
        }
    }

    pub fn outcome(&self) -> Outcome {
        if self.error.is_some() {
            Outcome::Failure
        } else if self.skipped {
            Outcome::Skipped
        } else {
            Outcome::Success
        }
    }

    pub fn failed(&self) -> bool {
        self.outcome() == Outcome::Failure
    }

    fn annotate(&mut self, index: &HashMap<(SpanKind, String), Duration>) {
        if let Some(d) = index.get(&(SpanKind::Runbook, self.id.clone())) {
            self.elapsed = *d;
        }
        for step in &mut self.steps {
            if let Some(d) = index.get(&(SpanKind::Step, step.id.clone())) {
                step.elapsed = *d;
            }
            for child in &mut step.included {
                child.annotate(index);
            }
        }
    }
}

/// Results of one invocation of an operator set.
#[derive(Debug, Clone, Serialize)]
pub struct RunNResult {
    pub started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    pub results: Vec<RunResult>,
}

impl RunNResult {
    pub fn new(started_at: DateTime<Utc>, elapsed: Duration, results: Vec<RunResult>) -> Self {
        Self { started_at, elapsed, results }
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn succeeded(&self) -> usize {
        self.count(Outcome::Success)
    }

    pub fn failed(&self) -> usize {
        self.count(Outcome::Failure)
    }

    pub fn skipped(&self) -> usize {
        self.count(Outcome::Skipped)
    }

    pub fn has_failure(&self) -> bool {
        self.results.iter().any(RunResult::failed)
    }

    fn count(&self, outcome: Outcome) -> usize {
        self.results.iter().filter(|r| r.outcome() == outcome).count()
    }

    /// Fill in elapsed times from profiled spans, matching on trail IDs.
    pub fn annotate(&mut self, profile: &Profile) {
        let index = profile.elapsed_index();
        for result in &mut self.results {
            result.annotate(&index);
        }
    }

    /// One-line summary, e.g. `3 scenarios, 1 skipped, 1 failure`.
    pub fn summary(&self) -> String {
        let failed = self.failed();
        format!(
            "{} scenario{}, {} skipped, {} failure{}",
            self.total(),
            if self.total() == 1 { "" } else { "s" },
            self.skipped(),
            failed,
            if failed == 1 { "" } else { "s" },
        )
    }
}
