//! Request pacing.
//!
//! Between two requests the crawler waits `base_delay ± 30%` (never less than
//! half a second). After every `batch_size` requests it additionally takes a
//! longer break of `batch_delay ± 5s`. Items skipped because their patch is
//! already stored are not paced.

use std::time::Duration;

use rand::Rng;

use crate::clock::Clock;

/// Pacing parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacerConfig {
    /// Nominal pause between two requests.
    pub base_delay: Duration,

    /// Relative jitter applied to `base_delay` (0.3 = ±30%).
    pub base_jitter: f64,

    /// Lower bound on the jittered base pause.
    pub min_delay: Duration,

    /// Requests per batch. Zero disables batch breaks.
    pub batch_size: usize,

    /// Nominal extra pause at a batch boundary.
    pub batch_delay: Duration,

    /// Absolute jitter applied to `batch_delay`.
    pub batch_jitter: Duration,
}

impl PacerConfig {
    pub const DEFAULT: Self = Self {
        base_delay: Duration::from_secs(2),
        base_jitter: 0.3,
        min_delay: Duration::from_millis(500),
        batch_size: 10,
        batch_delay: Duration::from_secs(30),
        batch_jitter: Duration::from_secs(5),
    };

    /// Default pacing with the given batch parameters.
    pub fn with_batches(batch_size: usize, batch_delay: Duration) -> Self {
        Self {
            batch_size,
            batch_delay,
            ..Self::DEFAULT
        }
    }

    /// Pacing that never sleeps.
    pub fn none() -> Self {
        Self {
            base_delay: Duration::ZERO,
            base_jitter: 0.0,
            min_delay: Duration::ZERO,
            batch_size: 0,
            batch_delay: Duration::ZERO,
            batch_jitter: Duration::ZERO,
        }
    }
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A batch boundary reached before a request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchBreak {
    /// 1-based number of the batch just completed.
    pub completed_batch: usize,

    /// Requests issued so far.
    pub issued: usize,

    /// Length of the extra break.
    pub delay: Duration,
}

/// The wait before one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pause {
    /// Jittered base delay.
    pub delay: Duration,

    /// Present when the request starts a new batch.
    pub batch: Option<BatchBreak>,
}

impl Pause {
    pub const NONE: Self = Self {
        delay: Duration::ZERO,
        batch: None,
    };

    /// Everything the caller will sleep.
    pub fn total(&self) -> Duration {
        self.delay + self.batch.map_or(Duration::ZERO, |b| b.delay)
    }
}

/// Sleeps between requests according to a [`PacerConfig`].
#[derive(Debug, Clone)]
pub struct BatchPacer<C> {
    config: PacerConfig,
    clock: C,
}

impl<C: Clock> BatchPacer<C> {
    pub fn new(config: PacerConfig, clock: C) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &PacerConfig {
        &self.config
    }

    /// Plans the wait before request number `index` (0-based, counting only
    /// items that issue a request). The first request is not delayed.
    pub fn plan(&self, index: usize, rng: &mut impl Rng) -> Pause {
        if index == 0 {
            return Pause::NONE;
        }

        let config = &self.config;
        let delay = jitter_relative(config.base_delay, config.base_jitter, rng).max(config.min_delay);

        let batch = (config.batch_size > 0 && index % config.batch_size == 0).then(|| BatchBreak {
            completed_batch: index / config.batch_size,
            issued: index,
            delay: jitter_absolute(config.batch_delay, config.batch_jitter, rng),
        });

        Pause { delay, batch }
    }

    /// Waits before request number `index`. `announce` sees the plan before
    /// the sleep starts, so batch breaks can be logged up front.
    pub async fn before_next(&self, index: usize, announce: impl FnOnce(&Pause)) {
        let pause = self.plan(index, &mut rand::thread_rng());
        announce(&pause);
        let total = pause.total();
        if !total.is_zero() {
            self.clock.sleep(total).await;
        }
    }
}

/// Number of batches needed for `requests` requests.
pub fn batch_count(requests: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        return usize::from(requests > 0);
    }
    requests.div_ceil(batch_size)
}

fn jitter_relative(base: Duration, ratio: f64, rng: &mut impl Rng) -> Duration {
    if ratio <= 0.0 {
        return base;
    }
    let factor = 1.0 + rng.gen_range(-ratio..=ratio);
    Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
}

fn jitter_absolute(base: Duration, spread: Duration, rng: &mut impl Rng) -> Duration {
    if spread.is_zero() {
        return base;
    }
    let spread = spread.as_secs_f64();
    let secs = base.as_secs_f64() + rng.gen_range(-spread..=spread);
    Duration::from_secs_f64(secs.max(0.0))
}
