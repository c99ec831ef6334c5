//! Time source for every waiting policy in the crawler.
//!
//! Credential backoff, retry delays and batch pacing all read "now" and sleep
//! through a [`Clock`], so tests can drive them with synthetic time instead of
//! real sleeps.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Wall-clock time plus the ability to sleep.
pub trait Clock: Clone + Send + Sync + 'static {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspends the caller for `duration`.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// The real clock: `Utc::now()` and `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Returns `at + duration`, saturating at the maximum representable time.
pub fn after(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Returns how long it is from `now` until `at`, or zero if `at` has passed.
pub fn until(now: DateTime<Utc>, at: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn after_adds_duration() {
        let t0 = DateTime::from_timestamp(0, 0).unwrap();
        assert_eq!(after(t0, Duration::from_secs(90)) - t0, TimeDelta::seconds(90));
    }

    #[test]
    fn after_saturates() {
        let t0 = Utc::now();
        assert_eq!(after(t0, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn until_is_zero_for_past_instants() {
        let now = Utc::now();
        assert_eq!(until(now, now - TimeDelta::seconds(5)), Duration::ZERO);
        assert_eq!(
            until(now, now + TimeDelta::seconds(5)),
            Duration::from_secs(5)
        );
    }
}
