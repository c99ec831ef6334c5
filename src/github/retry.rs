//! Retry policy for patch fetches.
//!
//! Stateless: given the outcome of an attempt and how many attempts have been
//! made, decide whether to retry and how long to wait.
//!
//! - NotFound / PermanentError: give up immediately.
//! - RateLimited: retry after the reported delay. The delay is enforced by the
//!   credential pool (the credential is put in backoff), so the next attempt
//!   can go out at once on another credential.
//! - TransientError: retry after `min(base * 2^attempt + jitter, max)`.
//!
//! Every retryable outcome consumes one attempt; after `max_attempts` the item
//! is given up for this run.

use std::time::Duration;

use rand::Rng;

use super::outcome::FetchOutcome;

/// Configuration for exponential backoff retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts per item, including the first.
    pub max_attempts: u32,

    /// Base of the exponential delay.
    pub base_delay: Duration,

    /// Cap on the delay between attempts.
    pub max_delay: Duration,

    /// Upper bound (exclusive) of the uniform jitter added to each delay.
    pub max_jitter: Duration,

    /// Multiplier for exponential backoff (typically 2.0).
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Five attempts, 2s base, 120s cap, up to 1s jitter.
    pub const DEFAULT: Self = Self {
        max_attempts: 5,
        base_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(120),
        max_jitter: Duration::from_secs(1),
        backoff_multiplier: 2.0,
    };

    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        max_jitter: Duration,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            max_jitter,
            backoff_multiplier: 2.0,
        }
    }

    /// Delay before retrying after the `attempt`-th failure (1-based),
    /// without jitter: `base_delay * backoff_multiplier^attempt`, capped at
    /// `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let delay_secs = self.base_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped_secs)
    }

    /// Like [`delay_for_attempt`](Self::delay_for_attempt) with a jitter
    /// sample added before capping.
    pub fn jittered_delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter = sample_jitter(self.max_jitter);
        (self.delay_for_attempt(attempt) + jitter).min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Who has to honour a retry delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayScope {
    /// The item waits before its next attempt.
    Item,

    /// The credential that failed waits; the pool enforces it.
    Credential,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `delay`.
    Retry { delay: Duration, scope: DelayScope },

    /// The failure is permanent; don't try again.
    GiveUpPermanent,

    /// The failure was retryable but the attempt budget is spent.
    GiveUpAfterMaxRetries,
}

/// Decides retries from a [`RetryConfig`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryController {
    config: RetryConfig,
}

impl RetryController {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decides what follows `outcome`, the result of attempt number
    /// `attempt` (1-based).
    ///
    /// A success needs no retry and is reported as `GiveUpPermanent`; callers
    /// handle successes before consulting the controller.
    pub fn decide(&self, outcome: &FetchOutcome, attempt: u32) -> RetryDecision {
        match outcome {
            FetchOutcome::Success(_) | FetchOutcome::NotFound | FetchOutcome::PermanentError(_) => {
                RetryDecision::GiveUpPermanent
            }
            _ if attempt >= self.config.max_attempts => RetryDecision::GiveUpAfterMaxRetries,
            FetchOutcome::RateLimited { retry_after } => RetryDecision::Retry {
                delay: *retry_after,
                scope: DelayScope::Credential,
            },
            FetchOutcome::TransientError(_) => RetryDecision::Retry {
                delay: self.config.jittered_delay_for_attempt(attempt),
                scope: DelayScope::Item,
            },
        }
    }
}

fn sample_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..max.as_secs_f64()))
}
