//! Work items and the patch records produced from them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ids::{PrNumber, RepoId};

/// One unit of fetch work: a pull request whose patch should be retrieved.
///
/// `metadata` holds every other manifest column verbatim. It is carried
/// through to the metadata file and never interpreted, except for the
/// optional repository override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub pr: PrNumber,

    /// Repository override from the manifest's `repo` column, if present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<RepoId>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl WorkItem {
    /// Creates a work item with no metadata.
    pub fn new(pr: impl Into<PrNumber>) -> Self {
        WorkItem {
            pr: pr.into(),
            repo: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Returns the repository this item is fetched from.
    pub fn repo_or<'a>(&'a self, default: &'a RepoId) -> &'a RepoId {
        self.repo.as_ref().unwrap_or(default)
    }
}

/// A successfully fetched patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRecord {
    pub pr: PrNumber,
    pub body: String,
}

impl PatchRecord {
    pub fn new(pr: impl Into<PrNumber>, body: impl Into<String>) -> Self {
        PatchRecord {
            pr: pr.into(),
            body: body.into(),
        }
    }
}
