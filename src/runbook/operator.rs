//! Single-runbook execution.
//!
//! An [`Operator`] runs one runbook: hooks, steps in order, the deferred queue
//! and an optional root loop. Step dispatch lives in `dispatch.rs`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use super::engine::{Engine, Session};
use super::looping::{Loop, LoopSpec};
use super::result::{Outcome, RunResult, StepResult};
use super::runner::{Runner, Runners};
use super::schema::Book;
use super::step::Step;
use super::store::Store;
use crate::core::{Error, Errors, Frame, Result, Trail};

/// Identifies an operator within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperatorHandle(usize);

impl OperatorHandle {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug)]
pub struct Operator {
    pub(super) handle: OperatorHandle,
    pub(super) id: String,
    pub(super) book: Arc<Book>,
    pub(super) engine: Arc<Engine>,
    pub(super) steps: Vec<Step>,
    pub(super) store: Store,
    pub(super) runners: Runners,
    /// Runners this operator built and must see closed.
    pub(super) owned_runners: Vec<Arc<dyn Runner>>,
    pub(super) root_loop: Option<Loop>,
    pub(super) deferred: Vec<usize>,
    pub(super) force: bool,
    pub(super) fail_fast: bool,
    pub(super) interval: Option<Duration>,
    pub(super) included: bool,
    pub(super) parent_trail: Trail,
    pub(super) iteration: Option<usize>,
    pub(super) skip_signal: Arc<AtomicBool>,
    /// Child results of the include step currently running.
    pub(super) included_results: Vec<RunResult>,
    pub(super) result: RunResult,
}

impl Operator {
    pub fn new(engine: Arc<Engine>, book: Arc<Book>, id: String, handle: OperatorHandle) -> Result<Self> {
        Self::build(engine, book, id, handle, Trail::new(), None)
    }

    /// An operator run from another one's include step.
    pub(super) fn included(
        engine: Arc<Engine>,
        book: Arc<Book>,
        id: String,
        handle: OperatorHandle,
        parent_trail: Trail,
        parent: Value,
    ) -> Result<Self> {
        Self::build(engine, book, id, handle, parent_trail, Some(parent))
    }

    fn build(
        engine: Arc<Engine>,
        book: Arc<Book>,
        id: String,
        handle: OperatorHandle,
        parent_trail: Trail,
        parent: Option<Value>,
    ) -> Result<Self> {
        let seed = engine.config().select.seed;
        let new_loop = |spec: &LoopSpec| {
            Loop::new(spec, engine.clock().clone())
                .map(|l| l.with_seed(seed))
                .map_err(|e| Error::book(&book.path, e.to_string()))
        };

        let steps = book
            .steps
            .iter()
            .enumerate()
            .map(|(i, def)| Ok(Step::new(i, def, handle, def.loop_spec.as_ref().map(new_loop).transpose()?)))
            .collect::<Result<Vec<_>>>()?;
        let root_loop = book.loop_spec.as_ref().map(new_loop).transpose()?;

        let mut runners = engine.runners().clone();
        let owned_runners = engine.build_runners(&book.runners, &mut runners)?;

        let mut store =
            Store::new(book.vars.clone(), book.steps.len(), book.step_keys(), engine.kv().clone());
        let included = parent.is_some();
        store.set_included(included);
        if let Some(parent) = parent {
            store.set_parent(parent);
        }

        let mut result = RunResult::new(id.clone(), book.path.clone(), book.desc.clone());
        result.labels = book.labels.clone();
        result.included = included;

        Ok(Self {
            handle,
            id,
            force: book.force,
            fail_fast: book.fail_fast || engine.config().run.fail_fast,
            interval: book.interval.or(engine.config().run.interval),
            steps,
            store,
            runners,
            owned_runners,
            root_loop,
            deferred: Vec::new(),
            included,
            parent_trail,
            iteration: None,
            skip_signal: Arc::new(AtomicBool::new(false)),
            included_results: Vec::new(),
            result,
            engine,
            book,
        })
    }

    pub fn handle(&self) -> OperatorHandle {
        self.handle
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn book(&self) -> &Arc<Book> {
        &self.book
    }

    pub fn concurrency(&self) -> &[String] {
        &self.book.concurrency
    }

    pub fn is_included(&self) -> bool {
        self.included
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn result(&self) -> &RunResult {
        &self.result
    }

    pub fn into_result(self) -> RunResult {
        self.result
    }

    /// Setting the returned flag skips the rest of the current run.
    pub fn skip_handle(&self) -> Arc<AtomicBool> {
        self.skip_signal.clone()
    }

    pub fn owned_runners(&self) -> &[Arc<dyn Runner>] {
        &self.owned_runners
    }

    /// Trail of the runbook frame, without loop iterations.
    pub fn trail(&self) -> Trail {
        self.parent_trail.with(Frame::Runbook {
            id: self.id.clone(),
            path: self.book.display_path(),
            desc: self.book.desc.clone(),
        })
    }

    fn run_trail(&self) -> Trail {
        match self.iteration {
            Some(iteration) => self.trail().with(Frame::Loop { iteration }),
            None => self.trail(),
        }
    }

    pub(super) fn step_trail(run_trail: &Trail, step: &Step) -> Trail {
        run_trail.with(Frame::Step { index: step.index, key: step.key.clone(), desc: step.desc.clone() })
    }

    /// Result for an operator that was never started.
    pub fn not_started(&self) -> RunResult {
        let trail = self.trail();
        let mut result = self.result.clone();
        result.id = trail.runbook_id();
        result.skipped = true;
        result.error = None;
        result.steps = self
            .steps
            .iter()
            .map(|s| {
                StepResult::new(Self::step_trail(&trail, s).runbook_id(), s.index, &s.key, &s.desc)
                    .with_outcome(Outcome::Skipped)
            })
            .collect();
        result
    }

    /// Run the runbook: wait for needs, run (or loop), then publish exports.
    ///
    /// Safe to call more than once; each call starts from a clean step history.
    pub fn run<'a>(&'a mut self, session: &'a Session) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let trail = self.trail();
            let span = session.profiler.start(&trail);

            let res = match self.wait_needs(session).await {
                Ok(()) if self.root_loop.is_some() => self.run_loop(session).await,
                Ok(()) => self.run_internal(session).await,
                Err(Error::Cancelled) => {
                    self.reset();
                    self.skip_all(&trail).map(|()| self.finish(&trail, &Errors::new()))
                }
                Err(e) => {
                    self.reset();
                    let mut errors = Errors::new();
                    errors.push(e);
                    self.finish(&trail, &errors);
                    errors.into_result()
                }
            };

            session.profiler.stop(span);
            if !self.included {
                session.waits.publish(&self.book.path, self.store.export());
            }
            res
        })
    }

    async fn wait_needs(&mut self, session: &Session) -> Result<()> {
        for (alias, path) in self.book.needs.clone() {
            tracing::debug!(runbook = %self.book.display_path(), need = %alias, "Waiting for needed runbook");
            let value = session.waits.wait(&alias, &path, &session.cancel).await?;
            self.store.set_needs(alias, value);
        }
        Ok(())
    }

    async fn run_loop(&mut self, session: &Session) -> Result<()> {
        let Some(mut lp) = self.root_loop.take() else {
            return self.run_internal(session).await;
        };
        let res = self.drive_root_loop(&mut lp, session).await;
        lp.reset();
        self.iteration = None;
        self.store.clear_loop_index();
        self.store.set_outcome(None);
        self.root_loop = Some(lp);
        res
    }

    /// Iteration errors are joined; with `until`, the first iteration that
    /// satisfies it wins regardless of earlier failures.
    async fn drive_root_loop(&mut self, lp: &mut Loop, session: &Session) -> Result<()> {
        let count = self.engine.evaluator().eval_count(lp.count(), &self.store.to_map())?;
        let mut errors = Errors::new();
        let mut attempts = 0;
        let mut last_trace = String::new();

        while attempts < count && lp.tick(&session.cancel).await {
            self.iteration = Some(attempts);
            self.store.set_loop_index(attempts);
            let res = self.run_internal(session).await;
            attempts += 1;

            let outcome = if res.is_err() {
                "failure"
            } else if self.result.skipped {
                "skipped"
            } else {
                "success"
            };
            if let Err(e) = res {
                errors.push(e);
            }

            let Some(until) = lp.until() else { continue };
            self.store.set_outcome(Some(outcome));
            let evaluated = self.engine.evaluator().eval_with_trace(until, &self.store.to_map());
            self.store.set_outcome(None);
            match evaluated {
                Ok(r) if r.is_true() => {
                    tracing::debug!(runbook = %self.book.display_path(), attempts, "Loop condition met");
                    return Ok(());
                }
                Ok(r) => last_trace = r.render(),
                Err(e) => {
                    errors.push(e);
                    break;
                }
            }
        }

        if let Some(until) = lp.until() {
            if !session.cancel.is_cancelled() && !last_trace.is_empty() {
                errors.push(Error::LoopExhausted { attempts, until: until.to_string(), trace: last_trace });
            }
        }
        errors.into_result()
    }

    fn reset(&mut self) {
        for step in &mut self.steps {
            step.reset_result();
        }
        self.store.clear_steps();
        self.deferred.clear();
        self.included_results.clear();

        let mut result = RunResult::new(self.id.clone(), self.book.path.clone(), self.book.desc.clone());
        result.id = self.trail().runbook_id();
        result.labels = self.book.labels.clone();
        result.included = self.included;
        self.result = result;
    }

    async fn run_internal(&mut self, session: &Session) -> Result<()> {
        self.reset();
        let trail = self.run_trail();
        self.engine.capturers().runbook_start(&trail);

        if session.cancel.is_cancelled() {
            tracing::debug!(runbook = %trail, "Cancelled before start; skipping");
            self.skip_all(&trail)?;
            self.finish(&trail, &Errors::new());
            return Ok(());
        }

        if let Some(cond) = self.book.condition.clone() {
            match self.engine.evaluator().eval_cond(&cond, &self.store.to_map()) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(runbook = %trail, condition = %cond, "Condition is false; skipping");
                    self.skip_all(&trail)?;
                    self.finish(&trail, &Errors::new());
                    return Ok(());
                }
                Err(e) => {
                    let mut errors = Errors::new();
                    errors.push(e);
                    self.finish(&trail, &errors);
                    return errors.into_result();
                }
            }
        }

        let engine = self.engine.clone();
        for (index, hook) in engine.before_hooks().iter().enumerate() {
            let hook_trail = trail.with(Frame::BeforeFunc { index });
            let span = session.profiler.start(&hook_trail);
            let res = hook(&self.result);
            session.profiler.stop(span);
            if let Err(source) = res {
                let mut errors = Errors::new();
                errors.push(Error::BeforeFunc { index, source });
                self.finish(&trail, &errors);
                return errors.into_result();
            }
        }

        let mut errors = Errors::new();
        let mut failed = false;
        let mut started_any = false;
        let mut aborted = false;

        for idx in 0..self.steps.len() {
            if aborted || self.skip_signal.load(Ordering::SeqCst) {
                aborted = true;
                self.record_skipped(&trail, idx)?;
                continue;
            }
            if self.steps[idx].defer {
                self.deferred.push(idx);
                continue;
            }
            let forced = self.force || self.steps[idx].force;
            if failed && !forced {
                self.record_skipped(&trail, idx)?;
                continue;
            }

            if started_any {
                if let Some(interval) = self.interval {
                    tokio::select! {
                        () = self.engine.clock().sleep(interval) => {}
                        () = session.cancel.cancelled() => {}
                    }
                }
            }
            if session.cancel.is_cancelled() {
                self.record_skipped(&trail, idx)?;
                continue;
            }

            started_any = true;
            match self.run_step(idx, &trail, session).await {
                Err(e) if matches!(e, Error::DuplicateResult(_)) => return Err(e),
                Err(e) if !e.is_skip() => {
                    failed = true;
                    errors.push(e);
                }
                _ => {}
            }
        }

        if aborted {
            self.result.skipped = true;
        }

        if !self.included && !aborted {
            while let Some(idx) = self.deferred.pop() {
                if session.cancel.is_cancelled() {
                    self.record_skipped(&trail, idx)?;
                    continue;
                }
                match self.run_step(idx, &trail, session).await {
                    Err(e) if matches!(e, Error::DuplicateResult(_)) => return Err(e),
                    Err(e) if !e.is_skip() => errors.push(e),
                    _ => {}
                }
            }
        }

        if !self.result.skipped {
            for (index, hook) in engine.after_hooks().iter().enumerate() {
                let hook_trail = trail.with(Frame::AfterFunc { index });
                let span = session.profiler.start(&hook_trail);
                let res = hook(&self.result);
                session.profiler.stop(span);
                if let Err(source) = res {
                    errors.push(Error::AfterFunc { index, source });
                }
            }
        }

        if failed && self.fail_fast {
            errors.push(Error::FailFast);
        }
        self.finish(&trail, &errors);
        errors.into_result()
    }

    fn record_skipped(&mut self, trail: &Trail, idx: usize) -> Result<()> {
        let step_trail = Self::step_trail(trail, &self.steps[idx]);
        let step = &mut self.steps[idx];
        step.record_result(
            StepResult::new(step_trail.runbook_id(), idx, &step.key, &step.desc).with_outcome(Outcome::Skipped),
        )?;
        self.engine.capturers().step_skipped(&step_trail);
        Ok(())
    }

    fn skip_all(&mut self, trail: &Trail) -> Result<()> {
        self.result.skipped = true;
        for idx in 0..self.steps.len() {
            if self.steps[idx].result().is_none() {
                self.record_skipped(trail, idx)?;
            }
        }
        Ok(())
    }

    fn finish(&mut self, trail: &Trail, errors: &Errors) {
        let message = errors
            .iter()
            .filter(|e| !matches!(e, Error::FailFast))
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n");
        self.result.error = (!message.is_empty()).then_some(message);
        self.result.steps = self
            .steps
            .iter()
            .map(|s| {
                s.result().cloned().unwrap_or_else(|| {
                    StepResult::new(Self::step_trail(trail, s).runbook_id(), s.index, &s.key, &s.desc)
                })
            })
            .collect();
        self.engine.capturers().runbook_end(trail, &self.result);
    }
}
