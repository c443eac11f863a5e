//! Bounded, named-group concurrency limiting.
//!
//! One primitive enforces both the global concurrency limit and per-name
//! concurrency groups. A group tag is either `name` (one holder at a time) or
//! `name:N` (up to N holders).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Permits held while a unit of work runs. Dropping releases them.
#[derive(Debug)]
pub struct Permits {
    _held: Vec<OwnedSemaphorePermit>,
}

/// Global limit plus named groups.
#[derive(Debug)]
pub struct GroupLimiter {
    /// Maximum number of concurrent holders overall
    max_concurrency: usize,
    global: Arc<Semaphore>,
    groups: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Default for GroupLimiter {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Split a group tag into its name and limit.
pub fn parse_group(tag: &str) -> (String, usize) {
    match tag.rsplit_once(':') {
        Some((name, n)) => match n.trim().parse::<usize>() {
            Ok(n) if n > 0 => (name.trim().to_string(), n),
            _ => (tag.trim().to_string(), 1),
        },
        None => (tag.trim().to_string(), 1),
    }
}

impl GroupLimiter {
    /// Create a limiter allowing `max_concurrency` holders overall.
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            max_concurrency,
            global: Arc::new(Semaphore::new(max_concurrency)),
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Number of global slots currently free.
    pub fn available(&self) -> usize {
        self.global.available_permits()
    }

    fn group(&self, name: &str, limit: usize) -> Arc<Semaphore> {
        let mut groups = self.groups.lock();
        groups.entry(name.to_string()).or_insert_with(|| Arc::new(Semaphore::new(limit))).clone()
    }

    /// Acquire the named groups, then a global slot.
    ///
    /// Groups are taken in name order so two holders of overlapping groups
    /// cannot deadlock. Returns `None` if cancelled first.
    pub async fn acquire(&self, tags: &[String], cancel: &CancellationToken) -> Option<Permits> {
        let mut parsed: Vec<(String, usize)> = tags.iter().map(|t| parse_group(t)).collect();
        parsed.sort_by(|a, b| a.0.cmp(&b.0));
        parsed.dedup_by(|a, b| a.0 == b.0);

        let mut held = Vec::with_capacity(parsed.len() + 1);
        for (name, limit) in parsed {
            let sem = self.group(&name, limit);
            held.push(Self::acquire_one(sem, cancel).await?);
        }
        held.push(Self::acquire_one(self.global.clone(), cancel).await?);
        Some(Permits { _held: held })
    }

    async fn acquire_one(
        sem: Arc<Semaphore>,
        cancel: &CancellationToken,
    ) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            permit = sem.acquire_owned() => permit.ok(),
        }
    }
}
