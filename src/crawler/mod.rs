//! Crawl orchestration.
//!
//! [`crawl`] wires a [`CrawlerConfig`] to the production collaborators (HTTP
//! fetcher, credential pool with its status file, patch log, run log) and
//! drives a [`Crawler`] over the manifest.
//!
//! # Module Structure
//!
//! - [`orchestrator`]: the per-item pipeline
//! - [`summary`]: run statistics

pub mod orchestrator;
pub mod summary;


use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, CrawlerConfig};
use crate::credentials::{CredentialPool, PoolError};
use crate::github::HttpPatchFetcher;
use crate::manifest::{ManifestError, load_manifest, write_metadata};
use crate::persistence::{PatchStore, PatchStoreError};
use crate::run_log::RunLog;

pub use orchestrator::Crawler;
pub use summary::{FailedItem, RunSummary};

/// Errors that abort a crawl.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("patch log: {0}")]
    Store(#[from] PatchStoreError),

    #[error("failed to open run log {}: {source}", path.display())]
    RunLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type for crawl operations.
pub type Result<T> = std::result::Result<T, CrawlError>;

/// Runs a full crawl as configured.
pub async fn crawl(config: &CrawlerConfig, cancel: &CancellationToken) -> Result<RunSummary> {
    config.ensure_output_dir()?;
    let clock = SystemClock;

    let run_log_path = config.run_log_path();
    let run_log = RunLog::open(&run_log_path, config.resume).map_err(|source| {
        CrawlError::RunLog {
            path: run_log_path.clone(),
            source,
        }
    })?;
    if config.resume {
        run_log.line(clock.now(), "Resuming previous download session");
    } else {
        run_log.line(
            clock.now(),
            &format!("Starting download of {} PR patches", config.repo),
        );
    }

    let pool = CredentialPool::with_status_file(
        config.tokens.iter().cloned(),
        clock,
        config.status_path(),
    )?;
    run_log.line(
        clock.now(),
        &format!("Using {} GitHub tokens for requests", pool.len()),
    );

    let items = load_manifest(&config.input)?;
    run_log.line(
        clock.now(),
        &format!(
            "Loaded {} PR numbers from {}",
            items.len(),
            config.input.display()
        ),
    );
    write_metadata(config.metadata_path(), &items)?;

    let (store, scan) = PatchStore::open(config.patches_path())?;
    if scan.incomplete_tail > 0 {
        run_log.line(
            clock.now(),
            &format!(
                "Discarded {} bytes of an incomplete record at the end of {}",
                scan.incomplete_tail,
                store.path().display()
            ),
        );
    }
    if scan.misframed_tail > 0 {
        run_log.line(
            clock.now(),
            &format!(
                "Kept {} bytes of {} whose record boundaries are ambiguous",
                scan.misframed_tail,
                store.path().display()
            ),
        );
    }
    info!(records = store.len(), path = %store.path().display(), "opened patch log");

    let fetcher = HttpPatchFetcher::new(config.source, config.repo.clone())?
        .with_api_base(config.api_base.as_str());

    let crawler = Crawler::new(fetcher, pool, store, run_log, clock)
        .with_pacing(config.pacing)
        .with_concurrency(config.concurrency);
    crawler.run(items, cancel).await
}
