//! Patch Crawler - downloads GitHub pull request patches under rate limits.
//!
//! Patches are fetched with a pool of credentials whose quota and backoff
//! state survives restarts, and stored in an append-only log that makes an
//! interrupted run resumable without fetching anything twice.

pub mod clock;
pub mod config;
pub mod crawler;
pub mod credentials;
pub mod github;
pub mod manifest;
pub mod pacer;
pub mod persistence;
pub mod run_log;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;
