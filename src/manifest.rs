//! Work-item manifest: a CSV file with a header row and a `pr_number` column.
//!
//! Every other column is carried through verbatim as metadata. An optional
//! `repo` column (`owner/name`) overrides the default repository per row.
//! The rows are also written to `pr_metadata.json` for downstream tools.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::persistence::write_json_atomic;
use crate::types::{InvalidRepoId, PrNumber, RepoId, WorkItem};

/// Column holding the PR number.
pub const PR_COLUMN: &str = "pr_number";

/// Optional column holding a repository override.
pub const REPO_COLUMN: &str = "repo";

/// Errors reading or writing manifest data.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("manifest {} has no 'pr_number' column", path.display())]
    MissingPrColumn { path: PathBuf },

    #[error("row {row}: invalid PR number '{value}'")]
    InvalidPrNumber { row: usize, value: String },

    #[error("row {row}: {source}")]
    InvalidRepo {
        row: usize,
        #[source]
        source: InvalidRepoId,
    },

    #[error("failed to write metadata {}: {source}", path.display())]
    WriteMetadata {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result type for manifest operations.
pub type Result<T> = std::result::Result<T, ManifestError>;

/// Loads the work items in file order.
pub fn load_manifest(path: impl AsRef<Path>) -> Result<Vec<WorkItem>> {
    let path = path.as_ref();
    let read_err = |source| ManifestError::Read {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(read_err)?;
    let headers = reader.headers().map_err(read_err)?.clone();
    if !headers.iter().any(|h| h == PR_COLUMN) {
        return Err(ManifestError::MissingPrColumn {
            path: path.to_path_buf(),
        });
    }

    let mut items = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.map_err(read_err)?;
        // Header is row 1.
        items.push(parse_row(idx + 2, &headers, &record)?);
    }
    Ok(items)
}

fn parse_row(row: usize, headers: &csv::StringRecord, record: &csv::StringRecord) -> Result<WorkItem> {
    let mut pr = None;
    let mut metadata = BTreeMap::new();

    for (name, value) in headers.iter().zip(record.iter()) {
        if name == PR_COLUMN {
            pr = Some(parse_pr_number(value).ok_or_else(|| ManifestError::InvalidPrNumber {
                row,
                value: value.to_string(),
            })?);
        } else {
            metadata.insert(name.to_string(), value.to_string());
        }
    }

    let pr = pr.ok_or_else(|| ManifestError::InvalidPrNumber {
        row,
        value: String::new(),
    })?;

    let repo = match metadata.get(REPO_COLUMN).map(String::as_str) {
        None | Some("") => None,
        Some(value) => Some(
            value
                .parse::<RepoId>()
                .map_err(|source| ManifestError::InvalidRepo { row, source })?,
        ),
    };

    Ok(WorkItem { pr, repo, metadata })
}

/// Accepts `123`, `#123`, and float exports such as `123.0`.
fn parse_pr_number(value: &str) -> Option<PrNumber> {
    let value = value.strip_prefix('#').unwrap_or(value);
    let digits = value.strip_suffix(".0").unwrap_or(value);
    match digits.parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(n) => Some(PrNumber(n)),
    }
}

#[derive(Serialize)]
struct MetadataRow<'a> {
    pr_number: PrNumber,
    #[serde(flatten)]
    columns: &'a BTreeMap<String, String>,
}

/// Writes the manifest rows to `path` as a JSON array, atomically.
pub fn write_metadata(path: impl AsRef<Path>, items: &[WorkItem]) -> Result<()> {
    let path = path.as_ref();
    let rows: Vec<_> = items
        .iter()
        .map(|item| MetadataRow {
            pr_number: item.pr,
            columns: &item.metadata,
        })
        .collect();
    write_json_atomic(path, &rows).map_err(|source| ManifestError::WriteMetadata {
        path: path.to_path_buf(),
        source,
    })
}
