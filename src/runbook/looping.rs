//! Loop specifications and the loop gate.
//!
//! A loop wraps either one step or a whole runbook run. [`Loop::tick`] says
//! whether another iteration may start, sleeping for the backoff delay first;
//! callers cap iterations at the evaluated count themselves.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::duration;
use crate::core::retry::{Backoff, BackoffConfig, Clock, Strategy};
use crate::core::{Error, Result};

pub const DEFAULT_COUNT: u64 = 3;
pub const DEFAULT_MULTIPLIER: f64 = 1.5;
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(10);

/// Iteration count: a number or an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Count {
    Number(u64),
    Expr(String),
}

impl Count {
    fn to_expr(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Expr(e) => e.clone(),
        }
    }
}

/// `loop:` as written in a runbook.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoopSpec {
    #[serde(default)]
    pub count: Option<Count>,
    #[serde(default)]
    pub until: Option<String>,
    #[serde(default, with = "duration::option")]
    pub interval: Option<Duration>,
    #[serde(default, with = "duration::option")]
    pub min_interval: Option<Duration>,
    #[serde(default, with = "duration::option")]
    pub max_interval: Option<Duration>,
    #[serde(default)]
    pub jitter: Option<f64>,
    #[serde(default)]
    pub multiplier: Option<f64>,
}

/// `loop: 5` shorthand or the full map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoopDef {
    Count(u64),
    Spec(LoopSpec),
}

impl From<LoopDef> for LoopSpec {
    fn from(def: LoopDef) -> Self {
        match def {
            LoopDef::Count(n) => Self { count: Some(Count::Number(n)), ..Default::default() },
            LoopDef::Spec(spec) => spec,
        }
    }
}

/// A normalized loop plus the controller state of the current invocation.
pub struct Loop {
    count: String,
    until: Option<String>,
    backoff: BackoffConfig,
    simple: bool,
    clock: Arc<dyn Clock>,
    seed: Option<u64>,
    controller: Option<Backoff>,
}

impl std::fmt::Debug for Loop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loop")
            .field("count", &self.count)
            .field("until", &self.until)
            .field("backoff", &self.backoff)
            .field("simple", &self.simple)
            .field("running", &self.controller.is_some())
            .finish()
    }
}

impl Loop {
    pub fn new(spec: &LoopSpec, clock: Arc<dyn Clock>) -> Result<Self> {
        let count = spec.count.as_ref().map_or_else(|| DEFAULT_COUNT.to_string(), Count::to_expr);
        let until = spec.until.clone().filter(|u| !u.trim().is_empty());
        let jitter = spec.jitter.unwrap_or(0.0);
        if !(0.0..=1.0).contains(&jitter) {
            return Err(Error::Config(format!("loop jitter must be within [0, 1], got {jitter}")));
        }

        let ranged = spec.min_interval.is_some() || spec.max_interval.is_some();
        if spec.interval.is_some() && ranged {
            return Err(Error::Config(
                "loop takes either `interval` or `minInterval`/`maxInterval`, not both".into(),
            ));
        }

        let simple = until.is_none() && spec.interval.is_none() && !ranged;
        let backoff = if simple {
            BackoffConfig::default()
        } else if let Some(interval) = spec.interval {
            BackoffConfig { strategy: Strategy::Constant(interval), jitter }
        } else {
            let min = spec.min_interval.unwrap_or(DEFAULT_MIN_INTERVAL);
            let max = spec.max_interval.unwrap_or(DEFAULT_MAX_INTERVAL).max(min);
            let multiplier = spec.multiplier.unwrap_or(DEFAULT_MULTIPLIER);
            if multiplier < 1.0 {
                return Err(Error::Config(format!("loop multiplier must be >= 1, got {multiplier}")));
            }
            BackoffConfig { strategy: Strategy::Exponential { min, max, multiplier }, jitter }
        };

        Ok(Self { count, until, backoff, simple, clock, seed: None, controller: None })
    }

    /// Seed the jitter source.
    #[must_use]
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn count(&self) -> &str {
        &self.count
    }

    pub fn until(&self) -> Option<&str> {
        self.until.as_deref()
    }

    pub fn is_simple(&self) -> bool {
        self.simple
    }

    pub fn backoff(&self) -> &BackoffConfig {
        &self.backoff
    }

    /// Whether another iteration may start. The first call starts the
    /// controller and never sleeps.
    pub async fn tick(&mut self, cancel: &CancellationToken) -> bool {
        if self.controller.is_none() {
            let backoff = Backoff::new(self.backoff.clone(), self.clock.clone());
            self.controller = Some(match self.seed {
                Some(seed) => backoff.with_rng(StdRng::seed_from_u64(seed)),
                None => backoff,
            });
        }
        match self.controller.as_mut() {
            Some(controller) => controller.next(cancel).await,
            None => false,
        }
    }

    /// Drop the controller state of the finished invocation.
    pub fn reset(&mut self) {
        self.controller = None;
    }
}
