//! Shared engine context.
//!
//! [`Engine`] holds what every operator of a set shares: configuration, the
//! loader, the evaluator, runners and their factories, capturers, hooks, the
//! KV and the clock. [`Session`] holds what one invocation shares: the
//! cancellation token, the needs wait-map and the profiler.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::capture::{Capturer, Capturers};
use super::eval::{Evaluator, SimpleEvaluator};
use super::exec::ExecRunner;
use super::needs::WaitMap;
use super::operator::OperatorHandle;
use super::parser::{BookLoader, FsLoader, ParseOptions};
use super::profile::Profiler;
use super::result::RunResult;
use super::runner::{Runner, RunnerFactory, RunnerKind, RunnerSpec, Runners};
use crate::core::retry::{Clock, TokioClock};
use crate::core::{Config, Error, Kv, Result};

/// A before/after hook. Sees the run's result as it stands.
pub type Hook = Arc<dyn Fn(&RunResult) -> anyhow::Result<()> + Send + Sync>;

pub struct Engine {
    config: Config,
    loader: Arc<dyn BookLoader>,
    evaluator: Arc<dyn Evaluator>,
    runners: Runners,
    factories: HashMap<RunnerKind, Arc<dyn RunnerFactory>>,
    capturers: Capturers,
    before: Vec<Hook>,
    after: Vec<Hook>,
    kv: Kv,
    clock: Arc<dyn Clock>,
    exec: ExecRunner,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("loader", &self.loader)
            .field("runners", &self.runners.len())
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .field("capturers", &self.capturers.len())
            .field("before", &self.before.len())
            .field("after", &self.after.len())
            .finish()
    }
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn loader(&self) -> &Arc<dyn BookLoader> {
        &self.loader
    }

    pub fn evaluator(&self) -> &dyn Evaluator {
        self.evaluator.as_ref()
    }

    /// Runners registered with the engine, visible to every runbook.
    pub fn runners(&self) -> &Runners {
        &self.runners
    }

    pub fn capturers(&self) -> &Capturers {
        &self.capturers
    }

    pub fn before_hooks(&self) -> &[Hook] {
        &self.before
    }

    pub fn after_hooks(&self) -> &[Hook] {
        &self.after
    }

    pub fn kv(&self) -> &Kv {
        &self.kv
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn exec(&self) -> &ExecRunner {
        &self.exec
    }

    /// Build runners from definitions into `into`, returning the new ones.
    pub fn build_runners(
        &self,
        defs: &BTreeMap<String, RunnerSpec>,
        into: &mut Runners,
    ) -> Result<Vec<Arc<dyn Runner>>> {
        let mut built = Vec::new();
        for (name, spec) in defs {
            let kind = spec.kind().ok_or_else(|| Error::UnknownRunner(name.clone()))?;
            let runner: Arc<dyn Runner> = match (kind, self.factories.get(&kind)) {
                (_, Some(factory)) => factory.build(name, spec).map_err(Error::Runner)?,
                (RunnerKind::Exec, None) => Arc::new(self.exec.clone()),
                (_, None) => {
                    tracing::debug!(runner = %name, %kind, "No factory for runner kind");
                    continue;
                }
            };
            into.insert(name.clone(), runner.clone());
            built.push(runner);
        }
        Ok(built)
    }
}

pub struct EngineBuilder {
    config: Config,
    loader: Option<Arc<dyn BookLoader>>,
    evaluator: Arc<dyn Evaluator>,
    runners: Runners,
    factories: HashMap<RunnerKind, Arc<dyn RunnerFactory>>,
    capturers: Capturers,
    before: Vec<Hook>,
    after: Vec<Hook>,
    kv: Kv,
    clock: Arc<dyn Clock>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            loader: None,
            evaluator: Arc::new(SimpleEvaluator),
            runners: Runners::new(),
            factories: HashMap::new(),
            capturers: Capturers::new(),
            before: Vec::new(),
            after: Vec::new(),
            kv: Kv::new(),
            clock: Arc::new(TokioClock),
        }
    }

    #[must_use]
    pub fn loader(mut self, loader: Arc<dyn BookLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    #[must_use]
    pub fn evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    #[must_use]
    pub fn runner(mut self, name: impl Into<String>, runner: Arc<dyn Runner>) -> Self {
        self.runners.insert(name, runner);
        self
    }

    #[must_use]
    pub fn factory(mut self, factory: Arc<dyn RunnerFactory>) -> Self {
        self.factories.insert(factory.kind(), factory);
        self
    }

    #[must_use]
    pub fn capturer(mut self, capturer: Arc<dyn Capturer>) -> Self {
        self.capturers.push(capturer);
        self
    }

    #[must_use]
    pub fn before(mut self, hook: Hook) -> Self {
        self.before.push(hook);
        self
    }

    #[must_use]
    pub fn after(mut self, hook: Hook) -> Self {
        self.after.push(hook);
        self
    }

    /// Share a KV with code outside the run.
    #[must_use]
    pub fn kv(mut self, kv: Kv) -> Self {
        self.kv = kv;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Arc<Engine> {
        let loader = self
            .loader
            .unwrap_or_else(|| Arc::new(FsLoader::new(ParseOptions::from_config(&self.config))));
        let exec = ExecRunner::new(self.config.scopes.run_exec);
        Arc::new(Engine {
            config: self.config,
            loader,
            evaluator: self.evaluator,
            runners: self.runners,
            factories: self.factories,
            capturers: self.capturers,
            before: self.before,
            after: self.after,
            kv: self.kv,
            clock: self.clock,
            exec,
        })
    }
}

/// State shared by the operators of one invocation.
#[derive(Debug, Clone)]
pub struct Session {
    pub cancel: CancellationToken,
    pub waits: Arc<WaitMap>,
    pub profiler: Profiler,
    handles: Arc<AtomicUsize>,
}

impl Session {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            waits: Arc::new(WaitMap::new()),
            profiler: Profiler::new(),
            handles: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn next_handle(&self) -> OperatorHandle {
        OperatorHandle::new(self.handles.fetch_add(1, Ordering::Relaxed))
    }
}
