//! The per-item pipeline.
//!
//! For each manifest row, in order:
//!
//! 1. skip it if its patch is already stored (or the PR appeared earlier)
//! 2. pace, then acquire a credential (may sleep until one is usable)
//! 3. fetch once and hand the credential back with the outcome
//! 4. on success append to the store; otherwise ask the retry policy and
//!    either wait and loop or record the failure
//!
//! Up to `concurrency` items are in flight, each holding its own credential.
//! Cancellation stops new items from being issued and interrupts waits; an
//! attempt already on the wire is allowed to finish.

use std::collections::HashSet;

use futures_util::{StreamExt, future, stream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::summary::{FailedItem, RunSummary};
use super::{CrawlError, Result};
use crate::clock::Clock;
use crate::credentials::CredentialPool;
use crate::github::{
    DelayScope, FetchOutcome, PatchFetcher, RetryConfig, RetryController, RetryDecision,
};
use crate::pacer::{BatchPacer, PacerConfig, Pause, batch_count};
use crate::persistence::{AppendOutcome, PatchStore};
use crate::run_log::RunLog;
use crate::types::{PatchRecord, PrNumber, WorkItem};

/// Successes are written to the run log once per this many requests.
const SUCCESS_LOG_INTERVAL: usize = 10;

/// How one issued item ended.
#[derive(Debug)]
enum ItemResult {
    Stored,
    AlreadyStored,
    Failed(FailedItem),
    Interrupted,
}

/// Drives fetches for a list of work items.
pub struct Crawler<F, C> {
    fetcher: F,
    pool: CredentialPool<C>,
    store: Mutex<PatchStore>,
    run_log: RunLog,
    clock: C,
    retry: RetryController,
    pacer: BatchPacer<C>,
    concurrency: usize,
}

impl<F: PatchFetcher, C: Clock> Crawler<F, C> {
    /// Creates a sequential crawler with default retry and pacing settings.
    pub fn new(
        fetcher: F,
        pool: CredentialPool<C>,
        store: PatchStore,
        run_log: RunLog,
        clock: C,
    ) -> Self {
        Crawler {
            fetcher,
            pool,
            store: Mutex::new(store),
            run_log,
            pacer: BatchPacer::new(PacerConfig::DEFAULT, clock.clone()),
            clock,
            retry: RetryController::new(RetryConfig::DEFAULT),
            concurrency: 1,
        }
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = RetryController::new(config);
        self
    }

    pub fn with_pacing(mut self, config: PacerConfig) -> Self {
        self.pacer = BatchPacer::new(config, self.clock.clone());
        self
    }

    /// Sets the number of items in flight, capped at the pool size.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.clamp(1, self.pool.len().max(1));
        self
    }

    /// Appends a line to the run log, stamped with the crawler's clock.
    pub fn log(&self, message: &str) {
        self.run_log.line(self.clock.now(), message);
    }

    /// Processes `items` in order and returns the run's statistics.
    ///
    /// Per-item failures end up in the summary. Only a failure to write the
    /// patch log is returned as an error, since exactly-once storage can no
    /// longer be guaranteed after it.
    pub async fn run(&self, items: Vec<WorkItem>, cancel: &CancellationToken) -> Result<RunSummary> {
        let total = items.len();
        let (pending, skipped) = self.partition(items).await;
        if skipped > 0 {
            self.log(&format!(
                "Resuming: {skipped} PRs already downloaded, {} remaining",
                pending.len()
            ));
        }

        let mut summary = RunSummary::new(total, skipped);
        let requests = pending.len();
        let batches = batch_count(requests, self.pacer.config().batch_size);

        let results = stream::iter(pending.into_iter().enumerate())
            .then(move |(index, item)| async move {
                self.pace(index, requests, batches, cancel)
                    .await
                    .then_some((index, item))
            })
            .take_while(|next| future::ready(next.is_some()))
            .filter_map(future::ready)
            .map(move |(index, item)| self.process(index, item, cancel))
            .buffer_unordered(self.concurrency);
        let mut results = std::pin::pin!(results);

        while let Some(result) = results.next().await {
            match result? {
                ItemResult::Stored => summary.succeeded += 1,
                ItemResult::AlreadyStored => summary.skipped += 1,
                ItemResult::Failed(failed) => summary.failed.push(failed),
                ItemResult::Interrupted => {}
            }
        }

        summary.finish(cancel.is_cancelled());
        if summary.interrupted {
            self.log(&format!("Download interrupted: {summary}"));
        } else {
            self.log(&format!("Download complete: {summary}"));
        }
        Ok(summary)
    }

    /// Splits off rows that need no request: already stored, or repeating an
    /// earlier row.
    async fn partition(&self, items: Vec<WorkItem>) -> (Vec<WorkItem>, usize) {
        let store = self.store.lock().await;
        let mut seen = HashSet::new();
        let mut skipped = 0;
        let pending = items
            .into_iter()
            .filter(|item| {
                let fresh = seen.insert(item.pr) && !store.contains(item.pr);
                if !fresh {
                    skipped += 1;
                }
                fresh
            })
            .collect();
        (pending, skipped)
    }

    /// Waits before request `index`. Returns false if cancelled first.
    async fn pace(
        &self,
        index: usize,
        requests: usize,
        batches: usize,
        cancel: &CancellationToken,
    ) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        let announce = |pause: &Pause| {
            if let Some(batch) = pause.batch {
                let percent = batch.issued as f64 / requests as f64 * 100.0;
                self.log(&format!(
                    "Completed batch {} of {batches}. Progress: {}/{requests} ({percent:.1}%). \
                     Taking a {:.2} second break...",
                    batch.completed_batch,
                    batch.issued,
                    batch.delay.as_secs_f64(),
                ));
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = self.pacer.before_next(index, announce) => true,
        }
    }

    #[instrument(skip(self, item, cancel), fields(pr = %item.pr))]
    async fn process(
        &self,
        index: usize,
        item: WorkItem,
        cancel: &CancellationToken,
    ) -> Result<ItemResult> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let lease = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(ItemResult::Interrupted),
                lease = self.pool.acquire() => lease,
            };

            let report = self.fetcher.fetch(&item, lease.credential()).await;
            self.pool.release(lease, &report).await;

            let outcome = match report.outcome {
                FetchOutcome::Success(body) => {
                    return self.store_patch(index, PatchRecord::new(item.pr, body)).await;
                }
                outcome => outcome,
            };

            match self.retry.decide(&outcome, attempt) {
                RetryDecision::GiveUpPermanent => {
                    return Ok(self.fail(item.pr, failure_reason(&outcome)));
                }
                RetryDecision::GiveUpAfterMaxRetries => {
                    let reason = format!(
                        "gave up after {attempt} attempts: {}",
                        failure_reason(&outcome)
                    );
                    return Ok(self.fail(item.pr, reason));
                }
                RetryDecision::Retry {
                    delay,
                    scope: DelayScope::Credential,
                } => {
                    debug!(attempt, delay_secs = delay.as_secs(), "rate limited, switching credential");
                }
                RetryDecision::Retry {
                    delay,
                    scope: DelayScope::Item,
                } => {
                    debug!(attempt, delay_secs = delay.as_secs_f64(), outcome = %outcome, "retrying");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(ItemResult::Interrupted),
                        _ = self.clock.sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn store_patch(&self, index: usize, record: PatchRecord) -> Result<ItemResult> {
        let pr = record.pr;
        let outcome = self
            .store
            .lock()
            .await
            .append(&record)
            .map_err(CrawlError::Store)?;

        match outcome {
            AppendOutcome::Appended => {
                if index % SUCCESS_LOG_INTERVAL == 0 {
                    self.log(&format!("PR {pr}: Downloaded successfully"));
                } else {
                    debug!(%pr, bytes = record.body.len(), "patch stored");
                }
                Ok(ItemResult::Stored)
            }
            AppendOutcome::AlreadyPresent => {
                info!(%pr, "patch already stored");
                Ok(ItemResult::AlreadyStored)
            }
        }
    }

    fn fail(&self, pr: PrNumber, reason: String) -> ItemResult {
        warn!(%pr, %reason, "giving up on item");
        self.log(&format!("PR {pr}: {reason}"));
        ItemResult::Failed(FailedItem { pr, reason })
    }
}

fn failure_reason(outcome: &FetchOutcome) -> String {
    match outcome {
        FetchOutcome::NotFound => "patch not found (404)".to_string(),
        other => other.to_string(),
    }
}
