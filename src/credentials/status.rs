//! Per-credential quota and health state, and its on-disk form.
//!
//! # File Format
//!
//! ```json
//! {
//!   "schema_version": 1,
//!   "credentials": {
//!     "sha256:<hex>": {
//!       "remaining_quota": 4999,
//!       "quota_reset_at": "2024-05-01T12:00:00Z",
//!       "backoff_until": null,
//!       "consecutive_errors": 0
//!     }
//!   }
//! }
//! ```
//!
//! Keys are credential fingerprints, never secrets. The file is replaced
//! atomically after every state change.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock;
use crate::persistence::write_json_atomic;
use crate::types::CredentialId;

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Hourly request quota assumed until the API reports otherwise.
pub const DEFAULT_QUOTA: u32 = 5000;

/// Length of a quota window when the API doesn't report a reset time.
pub const QUOTA_WINDOW: Duration = Duration::from_secs(3600);

/// Errors that can occur reading or writing the status file.
#[derive(Debug, Error)]
pub enum StatusFileError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("schema version mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: u32, got: u32 },
}

/// Result type for status file operations.
pub type Result<T> = std::result::Result<T, StatusFileError>;

/// Observed state of one credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialStatus {
    /// Requests left in the current quota window.
    pub remaining_quota: u32,

    /// When the quota window resets.
    pub quota_reset_at: DateTime<Utc>,

    /// The credential must not be used before this instant.
    #[serde(default)]
    pub backoff_until: Option<DateTime<Utc>>,

    /// Failed attempts since the last healthy response.
    #[serde(default)]
    pub consecutive_errors: u32,
}

impl CredentialStatus {
    /// State for a credential never seen before.
    pub fn fresh(now: DateTime<Utc>) -> Self {
        CredentialStatus {
            remaining_quota: DEFAULT_QUOTA,
            quota_reset_at: now,
            backoff_until: None,
            consecutive_errors: 0,
        }
    }

    /// Starts a new quota window if the current one has ended, and clears an
    /// expired backoff.
    pub fn refresh(&mut self, now: DateTime<Utc>) {
        if self.quota_reset_at <= now {
            self.remaining_quota = DEFAULT_QUOTA;
            self.quota_reset_at = clock::after(now, QUOTA_WINDOW);
        }
        if self.backoff_until.is_some_and(|until| until <= now) {
            self.backoff_until = None;
        }
    }

    /// True if the credential may be used at `now` while keeping `buffer`
    /// requests in reserve.
    pub fn is_usable(&self, now: DateTime<Utc>, buffer: u32) -> bool {
        self.backoff_until.is_none_or(|until| until <= now) && self.remaining_quota > buffer
    }

    /// Earliest instant at which the credential becomes usable.
    pub fn usable_at(&self, now: DateTime<Utc>, buffer: u32) -> DateTime<Utc> {
        let quota_ready = if self.remaining_quota > buffer {
            now
        } else {
            self.quota_reset_at.max(now)
        };
        match self.backoff_until {
            Some(until) => until.max(quota_ready),
            None => quota_ready,
        }
    }
}

/// The persisted status file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFile {
    pub schema_version: u32,
    pub credentials: BTreeMap<CredentialId, CredentialStatus>,
}

impl Default for StatusFile {
    fn default() -> Self {
        StatusFile {
            schema_version: SCHEMA_VERSION,
            credentials: BTreeMap::new(),
        }
    }
}

/// Writes the status file atomically.
pub fn save_status(path: &Path, status: &StatusFile) -> Result<()> {
    write_json_atomic(path, status)?;
    Ok(())
}

/// Loads the status file.
pub fn load_status(path: &Path) -> Result<StatusFile> {
    let bytes = std::fs::read(path)?;
    let status: StatusFile = serde_json::from_slice(&bytes)?;

    if status.schema_version != SCHEMA_VERSION {
        return Err(StatusFileError::SchemaMismatch {
            expected: SCHEMA_VERSION,
            got: status.schema_version,
        });
    }

    Ok(status)
}

/// Loads the status file, returning `None` if it doesn't exist.
pub fn try_load_status(path: &Path) -> Result<Option<StatusFile>> {
    match load_status(path) {
        Ok(status) => Ok(Some(status)),
        Err(StatusFileError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use tempfile::tempdir;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn fresh_credential_is_usable() {
        let status = CredentialStatus::fresh(t(0));
        assert!(status.is_usable(t(0), 10));
        assert_eq!(status.usable_at(t(0), 10), t(0));
    }

    #[test]
    fn quota_at_buffer_is_not_usable() {
        let mut status = CredentialStatus::fresh(t(0));
        status.quota_reset_at = t(600);
        status.remaining_quota = 10;

        assert!(!status.is_usable(t(0), 10));
        assert_eq!(status.usable_at(t(0), 10), t(600));
    }

    #[test]
    fn backoff_blocks_until_expiry() {
        let mut status = CredentialStatus::fresh(t(0));
        status.backoff_until = Some(t(30));

        assert!(!status.is_usable(t(29), 10));
        assert!(status.is_usable(t(30), 10));
        assert_eq!(status.usable_at(t(0), 10), t(30));
    }

    #[test]
    fn usable_at_takes_later_of_backoff_and_reset() {
        let mut status = CredentialStatus::fresh(t(0));
        status.remaining_quota = 0;
        status.quota_reset_at = t(100);
        status.backoff_until = Some(t(40));

        assert_eq!(status.usable_at(t(0), 10), t(100));
    }

    #[test]
    fn refresh_rolls_quota_window_and_clears_backoff() {
        let mut status = CredentialStatus::fresh(t(0));
        status.remaining_quota = 3;
        status.backoff_until = Some(t(5));

        status.refresh(t(10));

        assert_eq!(status.remaining_quota, DEFAULT_QUOTA);
        assert_eq!(status.quota_reset_at, t(10) + TimeDelta::hours(1));
        assert_eq!(status.backoff_until, None);
    }

    #[test]
    fn refresh_keeps_live_window() {
        let mut status = CredentialStatus::fresh(t(0));
        status.remaining_quota = 42;
        status.quota_reset_at = t(100);
        status.backoff_until = Some(t(50));

        status.refresh(t(10));

        assert_eq!(status.remaining_quota, 42);
        assert_eq!(status.backoff_until, Some(t(50)));
    }

    #[test]
    fn status_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("token_status.json");

        let mut file = StatusFile::default();
        file.credentials.insert(
            CredentialId::for_secret("ghp_a"),
            CredentialStatus {
                remaining_quota: 12,
                quota_reset_at: t(60),
                backoff_until: Some(t(30)),
                consecutive_errors: 4,
            },
        );
        save_status(&path, &file).unwrap();

        assert_eq!(try_load_status(&path).unwrap(), Some(file));
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempdir().unwrap();
        assert_eq!(
            try_load_status(&dir.path().join("token_status.json")).unwrap(),
            None
        );
    }

    #[test]
    fn schema_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("token_status.json");
        std::fs::write(&path, r#"{"schema_version": 99, "credentials": {}}"#).unwrap();

        assert!(matches!(
            load_status(&path),
            Err(StatusFileError::SchemaMismatch { got: 99, .. })
        ));
    }
}
