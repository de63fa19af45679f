//! Exponential backoff with jitter, and a reset-after-quiet-period decorator.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_MULTIPLIER: f64 = 1.5;
pub const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.5;
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(60);
/// A run that lasted at least this long starts its retries from scratch.
pub const DEFAULT_MIN_JOB_INTERVAL: Duration = Duration::from_secs(30);

/// A source of retry delays.
pub trait Backoff {
    fn next_backoff(&mut self) -> Duration;
    fn reset(&mut self);
}

/// Exponential backoff without a maximum elapsed time.
///
/// Each delay is drawn uniformly from
/// `[current * (1 - randomization), current * (1 + randomization)]`, then
/// `current` grows by `multiplier`, capped at `max_interval`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_interval: Duration,
    multiplier: f64,
    randomization_factor: f64,
    max_interval: Duration,
    current: Duration,
    started: Instant,
}

impl ExponentialBackoff {
    pub fn new(
        initial_interval: Duration,
        multiplier: f64,
        randomization_factor: f64,
        max_interval: Duration,
    ) -> Self {
        Self {
            initial_interval,
            multiplier,
            randomization_factor,
            max_interval,
            current: initial_interval,
            started: Instant::now(),
        }
    }

    /// Time since construction or the last reset.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn randomize(&self, interval: Duration) -> Duration {
        if self.randomization_factor <= 0.0 {
            return interval;
        }
        let secs = interval.as_secs_f64();
        let delta = secs * self.randomization_factor;
        let jittered = rand::thread_rng().gen_range((secs - delta)..=(secs + delta));
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(
            DEFAULT_INITIAL_INTERVAL,
            DEFAULT_MULTIPLIER,
            DEFAULT_RANDOMIZATION_FACTOR,
            DEFAULT_MAX_INTERVAL,
        )
    }
}

impl Backoff for ExponentialBackoff {
    fn next_backoff(&mut self) -> Duration {
        let delay = self.randomize(self.current);
        self.current = self.current.mul_f64(self.multiplier).min(self.max_interval);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial_interval;
        self.started = Instant::now();
    }
}

/// Resets the wrapped backoff when the last reset is older than
/// `min_job_interval`, so a long healthy run that fails is treated as a
/// fresh failure.
#[derive(Debug, Clone)]
pub struct JobBackoff {
    inner: ExponentialBackoff,
    min_job_interval: Duration,
}

impl JobBackoff {
    pub fn new(inner: ExponentialBackoff, min_job_interval: Duration) -> Self {
        Self {
            inner,
            min_job_interval,
        }
    }
}

impl Default for JobBackoff {
    fn default() -> Self {
        Self::new(ExponentialBackoff::default(), DEFAULT_MIN_JOB_INTERVAL)
    }
}

impl Backoff for JobBackoff {
    fn next_backoff(&mut self) -> Duration {
        if !self.min_job_interval.is_zero() && self.inner.elapsed() >= self.min_job_interval {
            self.inner.reset();
        }
        self.inner.next_backoff()
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}
