//! Core domain types for the patch crawler.

pub mod ids;
pub mod work_item;

pub use ids::{CredentialId, InvalidRepoId, PrNumber, RepoId};
pub use work_item::{PatchRecord, WorkItem};
