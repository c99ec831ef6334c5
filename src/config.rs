//! Command-line interface and resolved crawler configuration.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::github::{DEFAULT_API_BASE, PatchSource};
use crate::pacer::PacerConfig;
use crate::types::RepoId;

/// Environment variable holding comma-separated tokens.
pub const TOKENS_ENV_VAR: &str = "GITHUB_TOKENS";

pub const PATCHES_FILE: &str = "all_patches.txt";
pub const STATUS_FILE: &str = "token_status.json";
pub const RUN_LOG_FILE: &str = "download_log.txt";
pub const METADATA_FILE: &str = "pr_metadata.json";

#[derive(Debug, Parser)]
#[command(
    name = "patch-crawler",
    version,
    about = "Download GitHub pull request patches under rate limits"
)]
pub struct Cli {
    /// CSV manifest with a `pr_number` column.
    #[arg(long)]
    pub input: PathBuf,

    /// Requests per batch before a longer break.
    #[arg(long, default_value_t = 10)]
    pub batch_size: usize,

    /// Length of the break between batches, in seconds.
    #[arg(long, default_value_t = 30.0)]
    pub batch_delay: f64,

    /// GitHub tokens (repeatable, or comma-separated).
    #[arg(long, num_args = 1.., value_delimiter = ',')]
    pub tokens: Vec<String>,

    /// File with one token per line.
    #[arg(long)]
    pub tokens_file: Option<PathBuf>,

    /// Continue a previous run: append to the run log instead of truncating it.
    #[arg(long)]
    pub resume: bool,

    /// Directory for the patch log, status file, run log and metadata.
    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Repository for rows without a `repo` column.
    #[arg(long, default_value = "facebook/react")]
    pub repo: RepoId,

    /// Where patches are fetched from.
    #[arg(long, default_value_t = PatchSource::Api)]
    pub source: PatchSource,

    /// REST API root, for GitHub Enterprise.
    #[arg(long, default_value = DEFAULT_API_BASE)]
    pub api_base: String,

    /// Items in flight at once (capped at the number of tokens).
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    pub concurrency: u16,
}

/// Errors that stop the crawler before any work is done.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no GitHub tokens configured (use --tokens, --tokens-file or {TOKENS_ENV_VAR})")]
    NoCredentials,

    #[error("failed to read tokens file {}: {source}", path.display())]
    TokensFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("output directory {} is unusable: {source}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid --batch-delay {0}: must be a non-negative number of seconds")]
    InvalidBatchDelay(f64),
}

/// Result type for configuration.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Fully resolved settings for one run.
#[derive(Clone)]
pub struct CrawlerConfig {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub tokens: Vec<String>,
    pub repo: RepoId,
    pub source: PatchSource,
    pub api_base: String,
    pub pacing: PacerConfig,
    pub concurrency: usize,
    pub resume: bool,
}

impl CrawlerConfig {
    /// Resolves `cli` with tokens from the process environment.
    pub fn from_env(cli: Cli) -> Result<Self> {
        Self::resolve(cli, std::env::var(TOKENS_ENV_VAR).ok().as_deref())
    }

    /// Resolves `cli`, taking `env_tokens` as the value of `GITHUB_TOKENS`.
    pub fn resolve(cli: Cli, env_tokens: Option<&str>) -> Result<Self> {
        if !cli.batch_delay.is_finite() || cli.batch_delay < 0.0 {
            return Err(ConfigError::InvalidBatchDelay(cli.batch_delay));
        }

        let file_tokens = match &cli.tokens_file {
            Some(path) => read_tokens_file(path)?,
            None => Vec::new(),
        };
        let env_tokens = env_tokens
            .map(|value| value.split(',').map(str::to_string).collect())
            .unwrap_or_else(Vec::new);

        let tokens = dedupe_tokens(cli.tokens.into_iter().chain(file_tokens).chain(env_tokens));
        if tokens.is_empty() {
            return Err(ConfigError::NoCredentials);
        }

        let concurrency = usize::from(cli.concurrency).min(tokens.len());

        Ok(CrawlerConfig {
            input: cli.input,
            output_dir: cli.output_dir,
            tokens,
            repo: cli.repo,
            source: cli.source,
            api_base: cli.api_base,
            pacing: PacerConfig::with_batches(
                cli.batch_size,
                Duration::from_secs_f64(cli.batch_delay),
            ),
            concurrency,
            resume: cli.resume,
        })
    }

    /// Creates the output directory if needed.
    pub fn ensure_output_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.output_dir).map_err(|source| ConfigError::OutputDir {
            path: self.output_dir.clone(),
            source,
        })
    }

    pub fn patches_path(&self) -> PathBuf {
        self.output_dir.join(PATCHES_FILE)
    }

    pub fn status_path(&self) -> PathBuf {
        self.output_dir.join(STATUS_FILE)
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.output_dir.join(RUN_LOG_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.output_dir.join(METADATA_FILE)
    }
}

impl std::fmt::Debug for CrawlerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrawlerConfig")
            .field("input", &self.input)
            .field("output_dir", &self.output_dir)
            .field("tokens", &self.tokens.len())
            .field("repo", &self.repo)
            .field("source", &self.source)
            .field("api_base", &self.api_base)
            .field("pacing", &self.pacing)
            .field("concurrency", &self.concurrency)
            .field("resume", &self.resume)
            .finish()
    }
}

fn read_tokens_file(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::TokensFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(contents.lines().map(str::to_string).collect())
}

/// Trims, drops blanks, and removes repeats while keeping first occurrences
/// in order.
fn dedupe_tokens(tokens: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    tokens
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect()
}
