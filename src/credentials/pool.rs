//! Credential selection, backoff and persistence.
//!
//! # Selection
//!
//! `acquire` hands out the usable credential with the most remaining quota,
//! breaking ties in round-robin order. A credential is *usable* when it is not
//! in backoff and has more than [`QUOTA_BUFFER`] requests left. If nothing is
//! usable the caller sleeps until the earliest instant any credential becomes
//! usable, then selects again.
//!
//! # Checkout
//!
//! A credential is checked out between `acquire` and `release` and is never
//! handed to a second caller in the meantime, so requests on one credential
//! never overlap and quota accounting stays meaningful under concurrency.
//!
//! # Feedback
//!
//! `release` folds the attempt's outcome into the credential's state:
//! - healthy response (success or 404): error streak reset
//! - transient/permanent error: streak incremented; from the third
//!   consecutive error the credential backs off for
//!   `min(30s * 2^(errors - 3), 1h)`
//! - rate limited: backoff for the reported `retry_after`
//!
//! Quota headers, when present, overwrite the local estimate. The state is
//! written to the status file after every release.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use super::status::{CredentialStatus, StatusFile, save_status, try_load_status};
use crate::clock::{self, Clock};
use crate::github::{FetchOutcome, FetchReport};
use crate::types::CredentialId;

/// Requests kept in reserve on every credential.
pub const QUOTA_BUFFER: u32 = 10;

/// Consecutive errors after which a credential is put in backoff.
pub const ERROR_BACKOFF_THRESHOLD: u32 = 3;

const ERROR_BACKOFF_BASE_SECS: u64 = 30;
const ERROR_BACKOFF_CAP_SECS: u64 = 3600;

/// Errors constructing a pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no credentials configured")]
    NoCredentials,
}

/// An access token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    id: CredentialId,
    secret: String,
}

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        let secret = secret.into();
        Credential {
            id: CredentialId::for_secret(&secret),
            secret,
        }
    }

    pub fn id(&self) -> &CredentialId {
        &self.id
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// A checked-out credential. Must be handed back through
/// [`CredentialPool::release`].
#[derive(Debug)]
pub struct Lease {
    slot: usize,
    credential: Credential,
}

impl Lease {
    pub fn credential(&self) -> &Credential {
        &self.credential
    }
}

/// Backoff after `consecutive_errors` failures in a row, if any.
pub fn error_backoff(consecutive_errors: u32) -> Option<Duration> {
    let exponent = consecutive_errors.checked_sub(ERROR_BACKOFF_THRESHOLD)?;
    let secs = 2u64
        .checked_pow(exponent)
        .and_then(|factor| factor.checked_mul(ERROR_BACKOFF_BASE_SECS))
        .map_or(ERROR_BACKOFF_CAP_SECS, |secs| secs.min(ERROR_BACKOFF_CAP_SECS));
    Some(Duration::from_secs(secs))
}

struct Slot {
    credential: Credential,
    status: CredentialStatus,
    checked_out: bool,
}

struct PoolState {
    slots: Vec<Slot>,
    /// Slot indices in round-robin order; the most recently used is last.
    rotation: VecDeque<usize>,
    /// Status entries for credentials not configured in this run.
    dormant: BTreeMap<CredentialId, CredentialStatus>,
}

enum Wait {
    /// Sleep this long; a release may end the wait early.
    For(Duration),
    /// Every credential is checked out; wait for a release.
    Release,
}

impl PoolState {
    fn select(&mut self, now: DateTime<Utc>) -> Option<Lease> {
        let mut best: Option<(usize, u32)> = None;
        for (position, &slot_idx) in self.rotation.iter().enumerate() {
            let slot = &self.slots[slot_idx];
            if slot.checked_out || !slot.status.is_usable(now, QUOTA_BUFFER) {
                continue;
            }
            let remaining = slot.status.remaining_quota;
            if best.is_none_or(|(_, best_remaining)| remaining > best_remaining) {
                best = Some((position, remaining));
            }
        }

        let (position, _) = best?;
        let slot_idx = self.rotation.remove(position)?;
        self.rotation.push_back(slot_idx);

        let slot = &mut self.slots[slot_idx];
        slot.checked_out = true;
        slot.status.remaining_quota = slot.status.remaining_quota.saturating_sub(1);
        Some(Lease {
            slot: slot_idx,
            credential: slot.credential.clone(),
        })
    }

    fn wait(&self, now: DateTime<Utc>) -> Wait {
        self.slots
            .iter()
            .filter(|slot| !slot.checked_out)
            .map(|slot| slot.status.usable_at(now, QUOTA_BUFFER))
            .min()
            .map_or(Wait::Release, |at| Wait::For(clock::until(now, at)))
    }

    fn any_checked_out(&self) -> bool {
        self.slots.iter().any(|slot| slot.checked_out)
    }

    fn to_file(&self) -> StatusFile {
        let mut file = StatusFile {
            credentials: self.dormant.clone(),
            ..StatusFile::default()
        };
        for slot in &self.slots {
            file.credentials
                .insert(slot.credential.id.clone(), slot.status.clone());
        }
        file
    }
}

/// The set of credentials and their observed state.
pub struct CredentialPool<C> {
    clock: C,
    status_path: Option<PathBuf>,
    state: Mutex<PoolState>,
    released: Notify,
    size: usize,
}

impl<C: Clock> CredentialPool<C> {
    /// Creates a pool with fresh state and no status file.
    pub fn new(secrets: impl IntoIterator<Item = String>, clock: C) -> Result<Self, PoolError> {
        Self::build(secrets, clock, None, StatusFile::default())
    }

    /// Creates a pool whose state is loaded from and saved to `path`.
    ///
    /// A missing file means fresh state. An unreadable or malformed file is
    /// logged and replaced with fresh state.
    pub fn with_status_file(
        secrets: impl IntoIterator<Item = String>,
        clock: C,
        path: impl AsRef<Path>,
    ) -> Result<Self, PoolError> {
        let path = path.as_ref().to_path_buf();
        let file = match try_load_status(&path) {
            Ok(Some(file)) => {
                info!(path = %path.display(), "loaded credential status");
                file
            }
            Ok(None) => StatusFile::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable credential status");
                StatusFile::default()
            }
        };
        Self::build(secrets, clock, Some(path), file)
    }

    fn build(
        secrets: impl IntoIterator<Item = String>,
        clock: C,
        status_path: Option<PathBuf>,
        file: StatusFile,
    ) -> Result<Self, PoolError> {
        let now = clock.now();
        let mut dormant = file.credentials;
        let mut slots: Vec<Slot> = Vec::new();

        for secret in secrets {
            let credential = Credential::new(secret);
            if slots.iter().any(|s| s.credential.id == credential.id) {
                continue;
            }
            let status = dormant
                .remove(&credential.id)
                .unwrap_or_else(|| CredentialStatus::fresh(now));
            slots.push(Slot {
                credential,
                status,
                checked_out: false,
            });
        }

        if slots.is_empty() {
            return Err(PoolError::NoCredentials);
        }

        let size = slots.len();
        Ok(CredentialPool {
            clock,
            status_path,
            state: Mutex::new(PoolState {
                rotation: (0..size).collect(),
                slots,
                dormant,
            }),
            released: Notify::new(),
            size,
        })
    }

    /// Number of credentials.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Checks out the best usable credential, sleeping until one is usable.
    pub async fn acquire(&self) -> Lease {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (wait, others_checked_out) = {
                let mut state = self.state.lock().await;
                let now = self.clock.now();
                for slot in &mut state.slots {
                    slot.status.refresh(now);
                }
                if let Some(lease) = state.select(now) {
                    debug!(credential = %lease.credential.id, "credential acquired");
                    return lease;
                }
                (state.wait(now), state.any_checked_out())
            };

            match wait {
                Wait::For(duration) if others_checked_out => {
                    debug!(wait_secs = duration.as_secs_f64(), "waiting for a credential");
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = self.clock.sleep(duration) => {}
                    }
                }
                Wait::For(duration) => {
                    info!(
                        wait_secs = duration.as_secs(),
                        "all credentials are rate limited, waiting for the next available one"
                    );
                    self.clock.sleep(duration).await;
                }
                Wait::Release => notified.await,
            }
        }
    }

    /// Returns a credential and records what happened while it was out.
    pub async fn release(&self, lease: Lease, report: &FetchReport) {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let slot = &mut state.slots[lease.slot];
        let id = &slot.credential.id;
        let status = &mut slot.status;
        slot.checked_out = false;

        if let Some(remaining) = report.quota.remaining {
            status.remaining_quota = remaining;
        }
        if let Some(reset_at) = report.quota.reset_at {
            status.quota_reset_at = reset_at;
        }

        match &report.outcome {
            FetchOutcome::Success(_) | FetchOutcome::NotFound => {
                status.consecutive_errors = 0;
            }
            FetchOutcome::RateLimited { retry_after } => {
                let until = clock::after(now, *retry_after);
                status.backoff_until = Some(status.backoff_until.map_or(until, |b| b.max(until)));
                info!(
                    credential = %id,
                    backoff_secs = retry_after.as_secs(),
                    "credential hit rate limit, backing off"
                );
            }
            FetchOutcome::TransientError(_) | FetchOutcome::PermanentError(_) => {
                status.consecutive_errors += 1;
                if let Some(backoff) = error_backoff(status.consecutive_errors) {
                    status.backoff_until = Some(clock::after(now, backoff));
                    warn!(
                        credential = %id,
                        consecutive_errors = status.consecutive_errors,
                        backoff_secs = backoff.as_secs(),
                        "credential put in backoff after consecutive errors"
                    );
                }
            }
        }

        self.persist(&state);
        drop(state);
        self.released.notify_waiters();
    }

    /// Current state of every configured credential, in configuration order.
    pub async fn statuses(&self) -> Vec<(CredentialId, CredentialStatus)> {
        let state = self.state.lock().await;
        state
            .slots
            .iter()
            .map(|slot| (slot.credential.id.clone(), slot.status.clone()))
            .collect()
    }

    /// Writes the status file. Failures are logged, not propagated.
    fn persist(&self, state: &PoolState) {
        let Some(path) = &self.status_path else {
            return;
        };
        if let Err(e) = save_status(path, &state.to_file()) {
            warn!(path = %path.display(), error = %e, "failed to save credential status");
        }
    }
}

impl<C> fmt::Debug for CredentialPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPool")
            .field("size", &self.size)
            .field("status_path", &self.status_path)
            .finish_non_exhaustive()
    }
}
