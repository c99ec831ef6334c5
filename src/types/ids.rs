//! Newtype wrappers for domain identifiers.
//!
//! These keep PR numbers, repositories and credential fingerprints from being
//! mixed up with plain integers and strings.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A pull request number within a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrNumber(pub u64);

impl fmt::Display for PrNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for PrNumber {
    fn from(n: u64) -> Self {
        PrNumber(n)
    }
}

/// A repository identifier (owner/repo format).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoId {
    pub owner: String,
    pub repo: String,
}

impl RepoId {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        RepoId {
            owner: owner.into(),
            repo: repo.into(),
        }
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Error returned when a string is not of the form `owner/repo`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid repository '{0}': expected owner/repo")]
pub struct InvalidRepoId(pub String);

impl FromStr for RepoId {
    type Err = InvalidRepoId;

    /// Accepts `owner/repo` as well as `https://github.com/owner/repo`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let stripped = trimmed
            .strip_prefix("https://github.com/")
            .or_else(|| trimmed.strip_prefix("http://github.com/"))
            .or_else(|| trimmed.strip_prefix("github.com/"))
            .unwrap_or(trimmed)
            .trim_end_matches('/');

        match stripped.split_once('/') {
            Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') => {
                Ok(RepoId::new(owner, repo))
            }
            _ => Err(InvalidRepoId(s.to_string())),
        }
    }
}

/// A stable, non-secret identifier for a credential.
///
/// Derived from the SHA-256 of the secret so that status files and logs never
/// contain the secret itself.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialId(String);

impl CredentialId {
    /// Computes the fingerprint of a secret.
    pub fn for_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        CredentialId(format!("sha256:{}", hex::encode(digest)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short prefix of the fingerprint for log lines.
    pub fn short(&self) -> &str {
        let hex = self.0.strip_prefix("sha256:").unwrap_or(&self.0);
        hex.get(..12).unwrap_or(hex)
    }
}

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}
