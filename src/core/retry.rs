//! Backoff with optional exponential growth and jitter.
//!
//! The clock and the random source are parameters so that loops can be
//! driven in tests without real sleeps.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tokio_util::sync::CancellationToken;

/// Something that can sleep.
pub trait Clock: Send + Sync + fmt::Debug {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Real time, backed by tokio.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// A clock that returns immediately and remembers what it was asked to sleep.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    slept: Arc<Mutex<Vec<Duration>>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every sleep requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().clone()
    }
}

impl Clock for ManualClock {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.slept.lock().push(duration);
        Box::pin(async {})
    }
}

/// How delays grow between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    /// Same delay every time.
    Constant(Duration),
    /// `min * multiplier^(n-1)`, capped at `max`.
    Exponential { min: Duration, max: Duration, multiplier: f64 },
}

/// Configuration for backoff behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub strategy: Strategy,

    /// Randomization factor in `[0, 1]`: the delay is drawn from
    /// `[d * (1 - jitter), d * (1 + jitter)]`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { strategy: Strategy::Constant(Duration::ZERO), jitter: 0.0 }
    }
}

impl BackoffConfig {
    /// Delay before the given retry (1-based) with no jitter applied.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self.strategy {
            Strategy::Constant(d) => d,
            Strategy::Exponential { min, max, multiplier } => {
                let base = min.as_secs_f64() * multiplier.powi(attempt as i32 - 1);
                let capped = base.min(max.as_secs_f64());
                Duration::from_secs_f64(capped.max(0.0))
            }
        }
    }

    /// Delay before the given retry with jitter drawn from `rng`.
    pub fn delay_for_attempt(&self, attempt: u32, rng: &mut dyn RngCore) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let jitter = self.jitter.min(1.0);
        let factor = rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    }
}

/// Stateful backoff gate for one loop invocation.
///
/// The first call to [`Backoff::next`] returns immediately; later calls sleep
/// for the next delay first.
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    clock: Arc<dyn Clock>,
    rng: Box<dyn RngCore + Send>,
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backoff")
            .field("config", &self.config)
            .field("attempt", &self.attempt)
            .finish()
    }
}

impl Backoff {
    pub fn new(config: BackoffConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, attempt: 0, clock, rng: Box::new(StdRng::from_entropy()) }
    }

    /// Use a specific random source for jitter.
    #[must_use]
    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }

    /// Number of times [`Backoff::next`] has allowed an iteration.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Wait for the next slot. Returns `false` if cancelled.
    pub async fn next(&mut self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        if self.attempt > 0 {
            let delay = self.config.delay_for_attempt(self.attempt, self.rng.as_mut());
            if !delay.is_zero() {
                tokio::select! {
                    () = self.clock.sleep(delay) => {}
                    () = cancel.cancelled() => return false,
                }
            }
        }
        self.attempt += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exponential(jitter: f64) -> BackoffConfig {
        BackoffConfig {
            strategy: Strategy::Exponential {
                min: Duration::from_millis(100),
                max: Duration::from_secs(10),
                multiplier: 2.0,
            },
            jitter,
        }
    }

    #[test]
    fn test_delay_calculation() {
        let config = exponential(0.0);
        let mut rng = StdRng::seed_from_u64(1);

        assert_eq!(config.delay_for_attempt(0, &mut rng), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1, &mut rng), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2, &mut rng), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3, &mut rng), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let config = BackoffConfig {
            strategy: Strategy::Exponential {
                min: Duration::from_secs(1),
                max: Duration::from_secs(5),
                multiplier: 10.0,
            },
            jitter: 0.0,
        };
        assert_eq!(config.base_delay(5), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = exponential(0.5);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let d = config.delay_for_attempt(1, &mut rng);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(150), "{d:?}");
        }
    }

    #[tokio::test]
    async fn test_first_call_does_not_sleep() {
        let clock = ManualClock::new();
        let config = BackoffConfig { strategy: Strategy::Constant(Duration::from_secs(1)), jitter: 0.0 };
        let mut backoff = Backoff::new(config, Arc::new(clock.clone()));
        let cancel = CancellationToken::new();

        assert!(backoff.next(&cancel).await);
        assert!(clock.sleeps().is_empty());
        assert!(backoff.next(&cancel).await);
        assert!(backoff.next(&cancel).await);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1), Duration::from_secs(1)]);
        assert_eq!(backoff.attempts(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_stops_backoff() {
        let mut backoff = Backoff::new(BackoffConfig::default(), Arc::new(ManualClock::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!backoff.next(&cancel).await);
    }

    #[tokio::test]
    async fn test_seeded_rng_is_deterministic() {
        let run = || async {
            let clock = ManualClock::new();
            let mut backoff = Backoff::new(exponential(0.3), Arc::new(clock.clone()))
                .with_rng(StdRng::seed_from_u64(42));
            let cancel = CancellationToken::new();
            for _ in 0..4 {
                backoff.next(&cancel).await;
            }
            clock.sleeps()
        };
        assert_eq!(run().await, run().await);
    }
}
