//! Shared test utilities: a manual clock, a scripted fetcher, and arbitrary
//! generators for property-based testing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use proptest::prelude::*;

use crate::clock::{self, Clock};
use crate::credentials::Credential;
use crate::github::{FetchOutcome, FetchReport, PatchFetcher};
use crate::types::{CredentialId, PrNumber, WorkItem};

pub fn arb_pr_number() -> impl Strategy<Value = PrNumber> {
    (1u64..100_000).prop_map(PrNumber)
}

/// Patch-like text: diff lines that never look like a record sentinel.
pub fn arb_patch_body() -> impl Strategy<Value = String> {
    prop::collection::vec("[-+ @a-zA-Z0-9(){};=]{0,60}", 0..20).prop_map(|lines| lines.join("\n"))
}

/// Clock whose time only moves when someone sleeps on it.
///
/// Every sleep is recorded and advances `now` by its duration, so waiting
/// policies can be asserted exactly without real delays.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl ManualClock {
    /// A clock at a fixed, arbitrary instant.
    pub fn new() -> Self {
        Self::at(DateTime::from_timestamp(1_700_000_000, 0).unwrap())
    }

    pub fn at(now: DateTime<Utc>) -> Self {
        ManualClock {
            now: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Moves time forward without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap();
        *now = clock::after(*now, duration);
    }

    /// Every sleep so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// One call observed by [`ScriptedFetcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub pr: PrNumber,
    pub credential: CredentialId,
    pub at: DateTime<Utc>,
}

/// Fetcher that replays queued reports per PR.
///
/// Once a PR's queue is empty, further fetches succeed with
/// [`ScriptedFetcher::body_for`]. Attempts are stamped with the shared
/// manual clock.
#[derive(Debug, Clone)]
pub struct ScriptedFetcher {
    clock: ManualClock,
    scripts: Arc<Mutex<HashMap<PrNumber, VecDeque<FetchReport>>>>,
    attempts: Arc<Mutex<Vec<Attempt>>>,
}

impl ScriptedFetcher {
    pub fn new(clock: ManualClock) -> Self {
        ScriptedFetcher {
            clock,
            scripts: Arc::default(),
            attempts: Arc::default(),
        }
    }

    /// Queues `outcomes` for `pr`, to be returned in order.
    pub fn script(&self, pr: u64, outcomes: impl IntoIterator<Item = FetchOutcome>) -> &Self {
        self.script_reports(pr, outcomes.into_iter().map(FetchReport::new))
    }

    /// Queues full reports (outcome plus quota headers) for `pr`.
    pub fn script_reports(&self, pr: u64, reports: impl IntoIterator<Item = FetchReport>) -> &Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(PrNumber(pr))
            .or_default()
            .extend(reports);
        self
    }

    /// The body returned for unscripted successes.
    pub fn body_for(pr: u64) -> String {
        format!("From 0000000 Mon Sep 17 00:00:00 2001\nSubject: [PATCH] change #{pr}\n")
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().unwrap().clone()
    }

    /// Attempts made for `pr`.
    pub fn attempts_for(&self, pr: u64) -> Vec<Attempt> {
        self.attempts()
            .into_iter()
            .filter(|a| a.pr == PrNumber(pr))
            .collect()
    }
}

impl PatchFetcher for ScriptedFetcher {
    async fn fetch(&self, item: &WorkItem, credential: &Credential) -> FetchReport {
        self.attempts.lock().unwrap().push(Attempt {
            pr: item.pr,
            credential: credential.id().clone(),
            at: self.clock.now(),
        });
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&item.pr)
            .and_then(VecDeque::pop_front);
        next.unwrap_or_else(|| FetchReport::new(FetchOutcome::Success(Self::body_for(item.pr.0))))
    }
}
