//! Step dispatch.
//!
//! Runs one step of an operator: the `if` gate, the optional step loop, the
//! main runner, then `dump`, `bind` and `test`.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::engine::Session;
use super::looping::Loop;
use super::operator::Operator;
use super::result::{Outcome, StepResult};
use super::runner::{RunContext, Runner, RunnerKind};
use super::step::{DumpSpec, IncludeSpec, RunnerBinding};
use super::store::Record;
use crate::core::identity::hash_id;
use crate::core::{Error, Errors, Frame, Result, Trail};

/// `{{ expr }}` inside exec commands and include vars.
static TEMPLATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*(.+?)\s*\}\}").expect("template pattern is valid"));

impl Operator {
    /// Run step `idx` and record its result.
    pub(super) async fn run_step(&mut self, idx: usize, run_trail: &Trail, session: &Session) -> Result<()> {
        debug_assert_eq!(self.steps[idx].operator(), self.handle);
        let trail = Self::step_trail(run_trail, &self.steps[idx]);
        let capturers = self.engine.capturers().clone();

        let span = session.profiler.start(&trail);
        self.store.enter_step(idx);
        capturers.step_start(&trail);
        let res = self.run_step_gated(idx, &trail, session).await;
        session.profiler.stop(span);

        let (outcome, error) = match &res {
            Ok(()) => {
                capturers.step_success(&trail);
                (Outcome::Success, None)
            }
            Err(e) if e.is_skip() => {
                capturers.step_skipped(&trail);
                (Outcome::Skipped, None)
            }
            Err(e) => {
                capturers.step_failure(&trail, e);
                (Outcome::Failure, Some(e.to_string()))
            }
        };

        let step = &mut self.steps[idx];
        let mut result = StepResult::new(trail.runbook_id(), idx, &step.key, &step.desc).with_outcome(outcome);
        result.error = error;
        result.included = std::mem::take(&mut self.included_results);
        capturers.step_end(&trail, &result);
        step.record_result(result)?;
        res
    }

    async fn run_step_gated(&mut self, idx: usize, trail: &Trail, session: &Session) -> Result<()> {
        if let Some(cond) = self.steps[idx].condition.clone() {
            let holds = self
                .engine
                .evaluator()
                .eval_cond(&cond, &self.store.to_map())
                .map_err(|e| Error::step(trail.to_string(), e))?;
            if !holds {
                tracing::debug!(step = %trail, condition = %cond, "Condition is false; skipping");
                return Err(Error::Skipped);
            }
        }

        match self.steps[idx].looped.take() {
            Some(mut lp) => {
                let outer = self.store.loop_index();
                let res = self.drive_step_loop(&mut lp, idx, trail, session).await;
                lp.reset();
                match outer {
                    Some(i) => self.store.set_loop_index(i),
                    None => self.store.clear_loop_index(),
                }
                self.steps[idx].looped = Some(lp);
                res
            }
            None => self.run_step_body(idx, trail, session).await,
        }
    }

    /// Re-run the body until `until` holds. Any body error ends the loop.
    async fn drive_step_loop(
        &mut self,
        lp: &mut Loop,
        idx: usize,
        trail: &Trail,
        session: &Session,
    ) -> Result<()> {
        let count = self
            .engine
            .evaluator()
            .eval_count(lp.count(), &self.store.to_map())
            .map_err(|e| Error::step(trail.to_string(), e))?;

        let mut attempts = 0;
        let mut last_trace = String::new();
        while attempts < count && lp.tick(&session.cancel).await {
            self.store.set_loop_index(attempts);
            let iteration = trail.with(Frame::Loop { iteration: attempts });
            let span = session.profiler.start(&iteration);
            let body = self.run_step_body(idx, &iteration, session).await;
            session.profiler.stop(span);
            attempts += 1;

            if let Err(e) = body {
                return Err(Error::LoopAborted(Box::new(e)));
            }
            let Some(until) = lp.until() else { continue };
            let evaluated = self
                .engine
                .evaluator()
                .eval_with_trace(until, &self.store.to_map())
                .map_err(|e| Error::step(trail.to_string(), e))?;
            if evaluated.is_true() {
                return Ok(());
            }
            last_trace = evaluated.render();
        }

        if attempts < count && session.cancel.is_cancelled() {
            return Err(Error::Skipped);
        }
        match lp.until() {
            Some(until) => Err(Error::step(
                trail.to_string(),
                Error::LoopExhausted { attempts, until: until.to_string(), trace: last_trace },
            )),
            None => Ok(()),
        }
    }

    /// Main runner, then `dump` and `bind` whatever its outcome, then `test`.
    async fn run_step_body(&mut self, idx: usize, trail: &Trail, session: &Session) -> Result<()> {
        let binding = self.bind_runner(idx).map_err(|e| Error::step(trail.to_string(), e))?;
        let step = &self.steps[idx];
        if binding.is_none() && step.dump.is_none() && step.bind.is_none() && step.test.is_none() {
            return Err(Error::InvalidRunner(trail.to_string()));
        }

        let mut errors = Errors::new();
        let main = match binding {
            Some(binding) => self.run_main(binding, trail, session).await,
            None => Ok(Record::new()),
        };
        let main_ok = match main {
            Ok(record) => {
                if self.book.trace {
                    let traced = Value::Object(record.clone());
                    tracing::info!(step = %trail, record = %traced, "Step record");
                }
                self.store.record(idx, record);
                true
            }
            Err(e) => {
                errors.push(e);
                false
            }
        };

        if let Some(dump) = self.steps[idx].dump.clone() {
            if let Err(e) = self.run_dump(idx, &dump).await {
                errors.push(Error::step(trail.to_string(), e));
            }
        }
        if let Some(bind) = self.steps[idx].bind.clone() {
            for (name, value) in bind {
                let res = match value {
                    Value::String(expr) => self.engine.evaluator().eval(&expr, &self.store.to_map()),
                    literal => Ok(literal),
                }
                .and_then(|v| self.store.set_bind_var(&name, v));
                if let Err(e) = res {
                    errors.push(Error::step(trail.to_string(), e));
                }
            }
        }

        if main_ok && errors.is_empty() {
            if let Some(cond) = self.steps[idx].test.clone() {
                let evaluated = self
                    .engine
                    .evaluator()
                    .eval_with_trace(&cond, &self.store.to_map())
                    .map_err(|e| Error::step(trail.to_string(), e))?;
                if !evaluated.is_true() {
                    return Err(Error::step(
                        trail.to_string(),
                        Error::TestFailed { cond, trace: evaluated.render() },
                    ));
                }
            }
        }
        errors.into_result()
    }

    /// The step's binding, resolving a name left open at load time.
    fn bind_runner(&mut self, idx: usize) -> Result<Option<RunnerBinding>> {
        let binding = match self.steps[idx].binding.clone() {
            Some(RunnerBinding::Unresolved { name, request }) => {
                let kind = self
                    .runners
                    .get(&name)
                    .map(|r| r.kind())
                    .ok_or_else(|| Error::UnknownRunner(name.clone()))?;
                tracing::debug!(runner = %name, %kind, "Bound runner");
                let bound = RunnerBinding::Named { name, kind, request };
                self.steps[idx].binding = Some(bound.clone());
                Some(bound)
            }
            other => other,
        };
        Ok(binding)
    }

    async fn run_main(
        &mut self,
        binding: RunnerBinding,
        trail: &Trail,
        session: &Session,
    ) -> Result<Record> {
        let wrap = |e: anyhow::Error| Error::step(trail.to_string(), Error::Runner(e));
        let snapshot = self.store.to_map();
        let cx = RunContext { cancel: &session.cancel, trail, store: &snapshot };

        match binding {
            RunnerBinding::Exec(mut req) => {
                req.command = self.expand_text(&req.command).map_err(|e| Error::step(trail.to_string(), e))?;
                self.engine.exec().execute(&session.cancel, &req).await.map_err(wrap)
            }
            RunnerBinding::Include(spec) => self.run_include(&spec, trail, session).await,
            RunnerBinding::Define(defs) => {
                let engine = self.engine.clone();
                let built = engine.build_runners(&defs, &mut self.runners)?;
                self.owned_runners.extend(built);
                Ok(Record::new())
            }
            RunnerBinding::Named { name, kind, request } => {
                let runner: Arc<dyn Runner> = match self.runners.get(&name) {
                    Some(runner) => runner.clone(),
                    None if kind == RunnerKind::Exec => Arc::new(self.engine.exec().clone()),
                    None => return Err(Error::step(trail.to_string(), Error::UnknownRunner(name))),
                };
                runner.run(&cx, &request).await.map_err(wrap)
            }
            RunnerBinding::Unresolved { name, .. } => {
                Err(Error::step(trail.to_string(), Error::UnknownRunner(name)))
            }
        }
    }

    async fn run_include(
        &mut self,
        spec: &IncludeSpec,
        trail: &Trail,
        session: &Session,
    ) -> Result<Record> {
        let wrap = |e: Error| Error::step(trail.to_string(), e);
        let book = self.engine.loader().load(&spec.path).map_err(wrap)?;
        let id = hash_id(&book.display_path());
        let mut child = Operator::included(
            self.engine.clone(),
            Arc::new(book),
            id,
            session.next_handle(),
            trail.clone(),
            self.store.to_map(),
        )
        .map_err(wrap)?;

        for (name, value) in &spec.vars {
            let value = self.expand(value).map_err(wrap)?;
            child.store.set_var(name.clone(), value);
        }

        tracing::debug!(step = %trail, include = %spec.path.display(), "Running included runbook");
        let res = child.run(session).await;
        self.owned_runners.extend(child.owned_runners.iter().cloned());
        let record = child.store.include_record();
        self.included_results.push(child.into_result());

        res.map_err(wrap)?;
        Ok(record)
    }

    async fn run_dump(&mut self, idx: usize, dump: &DumpSpec) -> Result<()> {
        let value = self.engine.evaluator().eval(dump.expr(), &self.store.to_map())?;
        match dump.out() {
            Some(path) => {
                let text = serde_json::to_string_pretty(&value)
                    .map_err(|e| Error::eval(dump.expr(), e.to_string()))?;
                tokio::fs::write(path, text).await?;
            }
            None => match &value {
                Value::String(s) => println!("{s}"),
                other => println!("{other:#}"),
            },
        }
        if let Some(record) = self.store.record_mut(idx) {
            record.insert("dump".into(), value);
        }
        Ok(())
    }

    /// Evaluate `{{ expr }}` templates. A string that is exactly one template
    /// keeps the value's type.
    fn expand(&self, value: &Value) -> Result<Value> {
        let Value::String(text) = value else {
            return Ok(value.clone());
        };
        if let Some(caps) = TEMPLATE.captures(text.trim()) {
            if caps.get(0).is_some_and(|m| m.len() == text.trim().len()) {
                return self.engine.evaluator().eval(&caps[1], &self.store.to_map());
            }
        }
        self.expand_text(text).map(Value::String)
    }

    fn expand_text(&self, text: &str) -> Result<String> {
        if !TEMPLATE.is_match(text) {
            return Ok(text.to_string());
        }
        let env = self.store.to_map();
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in TEMPLATE.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&text[last..whole.start()]);
            match self.engine.evaluator().eval(&caps[1], &env)? {
                Value::String(s) => out.push_str(&s),
                Value::Null => {}
                other => out.push_str(&other.to_string()),
            }
            last = whole.end();
        }
        out.push_str(&text[last..]);
        Ok(out)
    }
}
