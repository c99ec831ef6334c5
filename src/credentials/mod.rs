//! Access tokens and their rate-limit state.
//!
//! - [`status`]: per-credential quota/backoff state and the status file
//! - [`pool`]: selection, checkout, and outcome feedback

pub mod pool;
pub mod status;

pub use pool::{
    Credential, CredentialPool, ERROR_BACKOFF_THRESHOLD, Lease, PoolError, QUOTA_BUFFER,
    error_backoff,
};
pub use status::{
    CredentialStatus, DEFAULT_QUOTA, QUOTA_WINDOW, StatusFile, StatusFileError, load_status,
    save_status, try_load_status,
};
