//! Single-attempt patch retrieval.
//!
//! A fetcher issues exactly one request per call and reports a classified
//! [`FetchReport`]. It never retries; that is the orchestrator's job.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use tracing::{debug, instrument};

use super::outcome::{FetchOutcome, FetchReport, classify_response, classify_transport_error};
use crate::credentials::Credential;
use crate::types::{RepoId, WorkItem};

/// Default REST API root.
pub const DEFAULT_API_BASE: &str = "https://api.github.com";

/// Host serving raw `.patch` files.
pub const RAW_PATCH_BASE: &str = "https://patch-diff.githubusercontent.com/raw";

/// Media type that makes the pulls endpoint return the patch text.
const PATCH_MEDIA_TYPE: &str = "application/vnd.github.patch";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Retrieves one patch with one credential.
pub trait PatchFetcher: Send + Sync {
    /// Performs exactly one attempt for `item` authorised by `credential`.
    fn fetch(
        &self,
        item: &WorkItem,
        credential: &Credential,
    ) -> impl Future<Output = FetchReport> + Send;
}

/// Where patches are downloaded from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PatchSource {
    /// `GET /repos/{owner}/{repo}/pulls/{n}` with the patch media type.
    /// Responses carry the quota headers.
    #[default]
    Api,

    /// `https://patch-diff.githubusercontent.com/raw/{owner}/{repo}/pull/{n}.patch`
    Raw,
}

impl FromStr for PatchSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "api" => Ok(PatchSource::Api),
            "raw" => Ok(PatchSource::Raw),
            other => Err(format!("unknown patch source '{other}' (expected api or raw)")),
        }
    }
}

impl fmt::Display for PatchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchSource::Api => write!(f, "api"),
            PatchSource::Raw => write!(f, "raw"),
        }
    }
}

/// Production fetcher backed by `reqwest`.
#[derive(Clone)]
pub struct HttpPatchFetcher {
    client: reqwest::Client,
    source: PatchSource,
    api_base: String,
    default_repo: RepoId,
}

impl HttpPatchFetcher {
    /// Creates a fetcher for `default_repo` (items may override the repo).
    pub fn new(source: PatchSource, default_repo: RepoId) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            source,
            api_base: DEFAULT_API_BASE.to_string(),
            default_repo,
        })
    }

    /// Overrides the REST API root (e.g. GitHub Enterprise).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// The URL a work item is fetched from.
    pub fn url_for(&self, item: &WorkItem) -> String {
        let repo = item.repo_or(&self.default_repo);
        match self.source {
            PatchSource::Api => format!(
                "{}/repos/{}/{}/pulls/{}",
                self.api_base, repo.owner, repo.repo, item.pr.0
            ),
            PatchSource::Raw => format!(
                "{}/{}/{}/pull/{}.patch",
                RAW_PATCH_BASE, repo.owner, repo.repo, item.pr.0
            ),
        }
    }
}

impl PatchFetcher for HttpPatchFetcher {
    #[instrument(skip(self, item, credential), fields(pr = %item.pr, credential = %credential.id()))]
    async fn fetch(&self, item: &WorkItem, credential: &Credential) -> FetchReport {
        let url = self.url_for(item);
        let mut request = self
            .client
            .get(&url)
            .header(USER_AGENT, concat!("patch-crawler/", env!("CARGO_PKG_VERSION")))
            .header(AUTHORIZATION, format!("token {}", credential.secret()));
        if self.source == PatchSource::Api {
            request = request.header(ACCEPT, PATCH_MEDIA_TYPE);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                debug!(error = %err, "request failed");
                return FetchReport::new(classify_transport_error(&err));
            }
        };

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                debug!(status, error = %err, "failed to read response body");
                return FetchReport::new(FetchOutcome::TransientError(format!(
                    "reading body: {err}"
                )));
            }
        };

        let report = classify_response(status, &headers, body, Utc::now());
        debug!(status, outcome = report.outcome.label(), "fetched");
        report
    }
}

impl fmt::Debug for HttpPatchFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpPatchFetcher")
            .field("source", &self.source)
            .field("api_base", &self.api_base)
            .field("default_repo", &self.default_repo)
            .finish_non_exhaustive()
    }
}
