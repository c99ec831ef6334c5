//! GitHub patch retrieval.
//!
//! - [`fetcher`]: one request per call, over the REST API or the raw patch host
//! - [`outcome`]: classification of responses into retry-relevant outcomes
//! - [`retry`]: the retry policy applied by the orchestrator

pub mod fetcher;
pub mod outcome;
pub mod retry;

pub use fetcher::{DEFAULT_API_BASE, HttpPatchFetcher, PatchFetcher, PatchSource};
pub use outcome::{DEFAULT_RETRY_AFTER, FetchOutcome, FetchReport, QuotaHeaders};
pub use retry::{DelayScope, RetryConfig, RetryController, RetryDecision};
