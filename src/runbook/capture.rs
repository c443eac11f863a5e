//! Lifecycle observers.
//!
//! Capturers see runbooks and steps start and finish. They cannot affect a
//! run: a failing capturer is logged and its error kept aside in
//! [`Capturers::errors`].

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::result::{RunResult, StepResult};
use crate::core::{Error, Trail};

pub trait Capturer: Send + Sync + fmt::Debug {
    fn runbook_start(&self, _trail: &Trail) -> anyhow::Result<()> {
        Ok(())
    }

    fn runbook_end(&self, _trail: &Trail, _result: &RunResult) -> anyhow::Result<()> {
        Ok(())
    }

    fn step_start(&self, _trail: &Trail) -> anyhow::Result<()> {
        Ok(())
    }

    fn step_success(&self, _trail: &Trail) -> anyhow::Result<()> {
        Ok(())
    }

    fn step_skipped(&self, _trail: &Trail) -> anyhow::Result<()> {
        Ok(())
    }

    fn step_failure(&self, _trail: &Trail, _error: &Error) -> anyhow::Result<()> {
        Ok(())
    }

    fn step_end(&self, _trail: &Trail, _result: &StepResult) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fan-out to every registered capturer.
#[derive(Debug, Clone, Default)]
pub struct Capturers {
    sinks: Vec<Arc<dyn Capturer>>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl Capturers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, capturer: Arc<dyn Capturer>) {
        self.sinks.push(capturer);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Errors returned by capturers so far.
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    fn emit(&self, event: &str, f: impl Fn(&dyn Capturer) -> anyhow::Result<()>) {
        for sink in &self.sinks {
            if let Err(e) = f(sink.as_ref()) {
                tracing::warn!(event, error = %e, "Capturer failed");
                self.errors.lock().push(format!("{event}: {e:#}"));
            }
        }
    }

    pub fn runbook_start(&self, trail: &Trail) {
        self.emit("runbook_start", |c| c.runbook_start(trail));
    }

    pub fn runbook_end(&self, trail: &Trail, result: &RunResult) {
        self.emit("runbook_end", |c| c.runbook_end(trail, result));
    }

    pub fn step_start(&self, trail: &Trail) {
        self.emit("step_start", |c| c.step_start(trail));
    }

    pub fn step_success(&self, trail: &Trail) {
        self.emit("step_success", |c| c.step_success(trail));
    }

    pub fn step_skipped(&self, trail: &Trail) {
        self.emit("step_skipped", |c| c.step_skipped(trail));
    }

    pub fn step_failure(&self, trail: &Trail, error: &Error) {
        self.emit("step_failure", |c| c.step_failure(trail, error));
    }

    pub fn step_end(&self, trail: &Trail, result: &StepResult) {
        self.emit("step_end", |c| c.step_end(trail, result));
    }
}

/// Forwards lifecycle events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCapturer;

impl Capturer for LogCapturer {
    fn runbook_start(&self, trail: &Trail) -> anyhow::Result<()> {
        tracing::info!(runbook = %trail, id = %trail.runbook_id(), "Runbook started");
        Ok(())
    }

    fn runbook_end(&self, trail: &Trail, result: &RunResult) -> anyhow::Result<()> {
        tracing::info!(runbook = %trail, outcome = result.outcome().as_str(), "Runbook finished");
        Ok(())
    }

    fn step_start(&self, trail: &Trail) -> anyhow::Result<()> {
        tracing::debug!(step = %trail, "Step started");
        Ok(())
    }

    fn step_skipped(&self, trail: &Trail) -> anyhow::Result<()> {
        tracing::info!(step = %trail, "Step skipped");
        Ok(())
    }

    fn step_failure(&self, trail: &Trail, error: &Error) -> anyhow::Result<()> {
        tracing::warn!(step = %trail, error = %error, "Step failed");
        Ok(())
    }
}
