//! Selection and scheduling of many runbooks.
//!
//! An [`OperatorSet`] loads runbooks (and everything they need), picks the
//! ones to run, and runs them on a bounded pool with named concurrency
//! groups. Results of every invocation are kept as [`RunNResult`]s.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use regex::Regex;
use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::engine::{Engine, Session};
use super::needs::resolve_needs;
use super::operator::Operator;
use super::parser::BookLoader;
use super::result::{RunNResult, RunResult};
use super::runner::Runner;
use super::schema::Book;
use crate::core::identity::generate_ids_using_path;
use crate::core::parallel::GroupLimiter;
use crate::core::{Error, Errors, Result};

/// A loaded runbook and its ID.
#[derive(Debug, Clone)]
pub struct Entry {
    pub id: String,
    pub book: Arc<Book>,
}

#[derive(Debug)]
pub struct OperatorSet {
    engine: Arc<Engine>,
    /// Runbooks named on load, in load order.
    roots: Vec<Entry>,
    /// Every loaded runbook, including ones only pulled in through `needs`.
    books: BTreeMap<PathBuf, Entry>,
    results: Vec<RunNResult>,
}

impl OperatorSet {
    /// Load `paths` and, recursively, the runbooks they need.
    pub fn load(engine: Arc<Engine>, paths: &[PathBuf]) -> Result<Self> {
        let loader = engine.loader().clone();
        let mut cache: BTreeMap<PathBuf, Arc<Book>> = BTreeMap::new();
        let mut root_paths = Vec::new();

        for path in paths {
            let book = load_cached(loader.as_ref(), &mut cache, path)?;
            resolve_needs(&book.path, |p| {
                let needed = load_cached(loader.as_ref(), &mut cache, p)?;
                Ok(needed.needs.iter().map(|(_, p)| p.clone()).collect())
            })?;
            if !root_paths.contains(&book.path) {
                root_paths.push(book.path.clone());
            }
        }

        let all: Vec<PathBuf> = cache.keys().cloned().collect();
        let ids = generate_ids_using_path(&all)?;
        let books: BTreeMap<PathBuf, Entry> = cache
            .into_iter()
            .zip(ids)
            .map(|((path, book), id)| (path, Entry { id, book }))
            .collect();
        let roots = root_paths.iter().filter_map(|p| books.get(p).cloned()).collect();

        Ok(Self { engine, roots, books, results: Vec::new() })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Runbooks named on load.
    pub fn books(&self) -> &[Entry] {
        &self.roots
    }

    /// Look up any loaded runbook by path.
    pub fn get(&self, path: &Path) -> Option<&Entry> {
        self.books.get(path)
    }

    /// Results of every invocation so far.
    pub fn results(&self) -> &[RunNResult] {
        &self.results
    }

    /// Apply the selection pipeline from the engine's configuration.
    pub fn select(&self) -> Result<Vec<Entry>> {
        let opts = &self.engine.config().select;
        let mut selected: Vec<Entry> = self.roots.clone();

        if let Some(pattern) = &opts.path_match {
            let re = Regex::new(pattern).map_err(|e| Error::Config(format!("invalid match pattern: {e}")))?;
            selected.retain(|e| re.is_match(&e.book.display_path()));
        }

        if !opts.labels.is_empty() {
            let mut kept = Vec::with_capacity(selected.len());
            for entry in selected {
                let env: Map<String, Value> =
                    entry.book.labels.iter().map(|l| (l.clone(), Value::Bool(true))).collect();
                let env = Value::Object(env);
                let mut matched = false;
                for cond in &opts.labels {
                    if self.engine.evaluator().eval_cond(cond, &env)? {
                        matched = true;
                        break;
                    }
                }
                if matched {
                    kept.push(entry);
                }
            }
            selected = kept;
        }

        if opts.ids.is_empty() {
            selected.sort_by(|a, b| (&a.book.path, &a.book.desc).cmp(&(&b.book.path, &b.book.desc)));
        } else {
            let mut ordered = Vec::new();
            for prefix in &opts.ids {
                let matches: Vec<&Entry> = selected.iter().filter(|e| e.id.starts_with(prefix.as_str())).collect();
                match matches.as_slice() {
                    [] => tracing::debug!(id = %prefix, "No runbook matches id"),
                    [one] => {
                        if !ordered.iter().any(|e: &Entry| e.id == one.id) {
                            ordered.push((*one).clone());
                        }
                    }
                    _ => return Err(Error::AmbiguousId(prefix.clone())),
                }
            }
            selected = ordered;
        }

        if opts.skip_included {
            let included: HashSet<PathBuf> =
                selected.iter().flat_map(|e| e.book.included_paths()).collect();
            let remaining: Vec<Entry> =
                selected.iter().filter(|e| !included.contains(&e.book.path)).cloned().collect();
            if !remaining.is_empty() {
                selected = remaining;
            }
        }

        if let Some(seed) = opts.shuffle {
            selected.shuffle(&mut StdRng::seed_from_u64(seed));
        }

        if let Some(shard) = opts.shard {
            if shard.total == 0 || shard.index >= shard.total {
                return Err(Error::Config(format!("invalid shard {}/{}", shard.index, shard.total)));
            }
            selected = selected
                .into_iter()
                .enumerate()
                .filter(|(i, _)| i % shard.total == shard.index)
                .map(|(_, e)| e)
                .collect();
        }

        let mut rng = match opts.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        if let Some(n) = opts.sample {
            selected = selected.choose_multiple(&mut rng, n).cloned().collect();
        }
        if let Some(n) = opts.random {
            if !selected.is_empty() {
                selected = (0..n).filter_map(|_| selected.choose(&mut rng).cloned()).collect();
            }
        }

        Ok(selected)
    }

    /// Put every needed runbook ahead of its dependents. A runbook needed by
    /// several others is scheduled once; duplicate picks of a selected
    /// runbook are kept.
    pub fn schedule(&self, selected: &[Entry]) -> Result<Vec<Entry>> {
        let mut order: Vec<Entry> = Vec::new();
        let mut scheduled: HashSet<PathBuf> = HashSet::new();
        let mut picked: HashSet<PathBuf> = HashSet::new();

        for entry in selected {
            let chain = resolve_needs(&entry.book.path, |p| {
                let found = self.books.get(p).ok_or_else(|| Error::UnresolvedNeed {
                    alias: String::new(),
                    target: p.display().to_string(),
                })?;
                Ok(found.book.needs.iter().map(|(_, p)| p.clone()).collect())
            })?;

            for path in &chain[..chain.len().saturating_sub(1)] {
                if scheduled.insert(path.clone()) {
                    if let Some(dep) = self.books.get(path) {
                        order.push(dep.clone());
                    }
                }
            }
            let already = scheduled.contains(&entry.book.path) && !picked.contains(&entry.book.path);
            if !already {
                scheduled.insert(entry.book.path.clone());
                picked.insert(entry.book.path.clone());
                order.push(entry.clone());
            }
        }
        Ok(order)
    }

    /// Run the selection once.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let started_at = Utc::now();
        let started = Instant::now();
        let config = self.engine.config().clone();

        let scheduled = self.schedule(&self.select()?)?;
        tracing::info!(runbooks = scheduled.len(), concurrency = config.run.concurrency, "Starting run");

        let session = Session::new(cancel.child_token());
        let stop = session.cancel.child_token();
        let mut operators = Vec::with_capacity(scheduled.len());
        for entry in &scheduled {
            if !entry.book.path.as_os_str().is_empty() {
                session.waits.register(&entry.book.path);
            }
            operators.push(Operator::new(
                self.engine.clone(),
                entry.book.clone(),
                entry.id.clone(),
                session.next_handle(),
            )?);
        }

        let limiter = GroupLimiter::new(config.run.concurrency);
        let mut tasks: JoinSet<(usize, Operator, Result<()>)> = JoinSet::new();
        let mut slots: Vec<Option<RunResult>> = vec![None; operators.len()];
        let mut owned: Vec<Arc<dyn Runner>> = Vec::new();
        let mut errors = Errors::new();

        for (i, op) in operators.into_iter().enumerate() {
            let groups = op.concurrency().to_vec();
            let permits = loop {
                tokio::select! {
                    biased;
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        collect(joined, &mut slots, &mut owned, &mut errors, &stop);
                    }
                    permits = limiter.acquire(&groups, &stop) => break permits,
                }
            };
            let Some(permits) = permits else {
                tracing::debug!(runbook = %op.book().display_path(), "Not admitted");
                slots[i] = Some(op.not_started());
                continue;
            };

            let session = session.clone();
            let mut op = op;
            tasks.spawn(async move {
                let _permits = permits;
                let res = op.run(&session).await;
                (i, op, res)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            collect(joined, &mut slots, &mut owned, &mut errors, &stop);
        }

        session.cancel.cancel();
        self.close_runners(owned, &mut errors).await;

        let mut result = RunNResult::new(started_at, started.elapsed(), slots.into_iter().flatten().collect());
        result.annotate(&session.profiler.tree());
        if config.profile.enabled {
            if let Some(path) = &config.profile.dump {
                if let Err(e) = session.profiler.dump(path) {
                    errors.push(e);
                }
            }
        }
        tracing::info!(summary = %result.summary(), "Run finished");
        self.results.push(result);

        errors.without_fail_fast().into_result()
    }

    /// Run the selection `times` times, as in load testing. Every run's
    /// errors are joined.
    pub async fn run_n(&mut self, times: usize, cancel: &CancellationToken) -> Result<()> {
        let mut errors = Errors::new();
        for n in 0..times {
            if cancel.is_cancelled() {
                tracing::info!(completed = n, "Cancelled; stopping repeated runs");
                break;
            }
            if let Err(e) = self.run(cancel).await {
                errors.push(e);
            }
        }
        errors.into_result()
    }

    /// Close engine and runbook runners, each once, bounded by the wait timeout.
    async fn close_runners(&self, owned: Vec<Arc<dyn Runner>>, errors: &mut Errors) {
        let mut seen = HashSet::new();
        let runners: Vec<Arc<dyn Runner>> = self
            .engine
            .runners()
            .iter()
            .map(|(_, r)| r.clone())
            .chain(owned)
            .filter(|r| seen.insert(Arc::as_ptr(r).cast::<()>() as usize))
            .collect();
        if runners.is_empty() {
            return;
        }

        let close_all = futures::future::join_all(runners.iter().map(|r| r.close()));
        let outcomes = match self.engine.config().run.wait_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, close_all).await {
                Ok(outcomes) => outcomes,
                Err(_) => {
                    errors.push(Error::WaitTimeout(timeout));
                    return;
                }
            },
            None => close_all.await,
        };
        for res in outcomes {
            if let Err(e) = res {
                errors.push(Error::Runner(e));
            }
        }
    }
}

/// Load through `cache`, keyed by the loaded book's cleaned path.
fn load_cached(
    loader: &dyn BookLoader,
    cache: &mut BTreeMap<PathBuf, Arc<Book>>,
    path: &Path,
) -> Result<Arc<Book>> {
    if let Some(book) = cache.get(path) {
        return Ok(book.clone());
    }
    let book = Arc::new(loader.load(path)?);
    if let Some(existing) = cache.get(&book.path) {
        return Ok(existing.clone());
    }
    tracing::debug!(path = %book.display_path(), "Loaded runbook");
    cache.insert(book.path.clone(), book.clone());
    Ok(book)
}

fn collect(
    joined: std::result::Result<(usize, Operator, Result<()>), tokio::task::JoinError>,
    slots: &mut [Option<RunResult>],
    owned: &mut Vec<Arc<dyn Runner>>,
    errors: &mut Errors,
    stop: &CancellationToken,
) {
    match joined {
        Ok((i, op, res)) => {
            owned.extend(op.owned_runners().iter().cloned());
            if let Err(e) = res {
                if e.is_fail_fast() && !stop.is_cancelled() {
                    tracing::warn!(runbook = %op.book().display_path(), "Failing fast; no more runbooks will start");
                    stop.cancel();
                }
                errors.push(e);
            }
            slots[i] = Some(op.into_result());
        }
        Err(e) => errors.push(Error::Runner(anyhow::anyhow!("runbook task failed: {e}"))),
    }
}
