//! Append-only patch log with a rebuilt-at-startup membership index.
//!
//! Each record is self-delimited by sentinel lines carrying the PR number:
//!
//! ```text
//!
//!
//! ===== PR #123 =====
//! <raw patch body>
//! ===== END PR #123 =====
//! ```
//!
//! # Recovery
//!
//! The in-memory index is never persisted. `PatchStore::open` scans the log
//! once and indexes every PR whose record has a matching end sentinel. A
//! trailing record without any end sentinel (crash mid-write) is truncated
//! away before the log accepts new appends, so `contains` never reports a PR
//! whose body was only partially written.
//!
//! Bodies are opaque, so one may contain sentinel lines. When an unterminated
//! tail holds an end sentinel it is not a crash remnant: the bytes are kept
//! and every record whose start and end sentinels pair up is indexed.
//!
//! # fsync Strategy
//!
//! Every record is written with a single `write_all` and synced before the
//! index is updated.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use super::fsync::fsync_file;
use crate::types::{PatchRecord, PrNumber};

const START_PREFIX: &str = "===== PR #";
const END_PREFIX: &str = "===== END PR #";
const SENTINEL_SUFFIX: &str = " =====";

/// Errors that can occur during patch log operations.
#[derive(Debug, Error)]
pub enum PatchStoreError {
    #[error("IO error on patch log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result type for patch log operations.
pub type Result<T> = std::result::Result<T, PatchStoreError>;

/// What `PatchStore::append` did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The record was written and synced.
    Appended,
    /// A record for this PR already exists; nothing was written.
    AlreadyPresent,
}

/// Result of scanning a patch log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Complete records in log order, duplicates included.
    pub records: Vec<PrNumber>,

    /// PRs that appear more than once (written by older tooling).
    pub duplicates: Vec<PrNumber>,

    /// Byte length of the valid prefix of the log.
    pub valid_len: u64,

    /// Bytes after `valid_len` belonging to an unterminated record.
    pub incomplete_tail: u64,

    /// Bytes that could not be framed from the record boundaries alone
    /// because a body contains sentinel lines. Kept on disk; records inside
    /// are indexed where start and end sentinels pair up.
    pub misframed_tail: u64,
}

/// The append-only patch log and its membership index.
///
/// This is the only writer of the log file.
pub struct PatchStore {
    file: File,
    path: PathBuf,
    index: HashSet<PrNumber>,
}

impl PatchStore {
    /// Opens (or creates) the log, truncating an incomplete trailing record
    /// and rebuilding the membership index.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, ScanReport)> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| PatchStoreError::Io {
            path: path.clone(),
            source,
        };

        let report = Self::scan(&path)?;

        if report.incomplete_tail > 0 {
            warn!(
                path = %path.display(),
                bytes = report.incomplete_tail,
                "truncating incomplete trailing record"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(io_err)?;
            file.set_len(report.valid_len).map_err(io_err)?;
            fsync_file(&file).map_err(io_err)?;
        }

        if report.misframed_tail > 0 {
            warn!(
                path = %path.display(),
                bytes = report.misframed_tail,
                "patch log contains sentinel lines inside a record body; left unchanged"
            );
        }

        for pr in &report.duplicates {
            warn!(pr = %pr, "patch log contains duplicate records");
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .map_err(io_err)?;

        let index: HashSet<PrNumber> = report.records.iter().copied().collect();
        debug!(path = %path.display(), records = index.len(), "patch log opened");

        Ok((PatchStore { file, path, index }, report))
    }

    /// Scans a log without modifying it.
    ///
    /// A missing file scans as empty.
    pub fn scan(path: impl AsRef<Path>) -> Result<ScanReport> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ScanReport::default()),
            Err(source) => {
                return Err(PatchStoreError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        scan_reader(BufReader::new(file)).map_err(|source| PatchStoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Returns true if a complete record for `pr` is in the log.
    pub fn contains(&self, pr: PrNumber) -> bool {
        self.index.contains(&pr)
    }

    /// Appends a record unless one for the same PR already exists.
    pub fn append(&mut self, record: &PatchRecord) -> Result<AppendOutcome> {
        if self.index.contains(&record.pr) {
            return Ok(AppendOutcome::AlreadyPresent);
        }

        let bytes = encode_record(record);
        self.file
            .write_all(&bytes)
            .and_then(|()| fsync_file(&self.file))
            .map_err(|source| PatchStoreError::Io {
                path: self.path.clone(),
                source,
            })?;

        self.index.insert(record.pr);
        Ok(AppendOutcome::Appended)
    }

    /// Number of distinct PRs in the log.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Serializes a record with its start and end sentinels.
fn encode_record(record: &PatchRecord) -> Vec<u8> {
    let pr = record.pr.0;
    let mut out = Vec::with_capacity(record.body.len() + 64);
    out.extend_from_slice(format!("\n\n{START_PREFIX}{pr}{SENTINEL_SUFFIX}\n").as_bytes());
    out.extend_from_slice(record.body.as_bytes());
    out.extend_from_slice(format!("\n{END_PREFIX}{pr}{SENTINEL_SUFFIX}\n").as_bytes());
    out
}

fn scan_reader<R: BufRead>(mut reader: R) -> io::Result<ScanReport> {
    let mut report = ScanReport::default();
    let mut seen = HashSet::new();
    let mut open: Option<PrNumber> = None;
    let mut tail = TailScan::default();
    let mut pos: u64 = 0;
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            break;
        }
        pos += read as u64;

        match open {
            None => {
                if let Some(pr) = parse_sentinel(&line, START_PREFIX) {
                    open = Some(pr);
                    tail = TailScan::opened(pr);
                }
            }
            Some(pr) => {
                if parse_sentinel(&line, END_PREFIX) == Some(pr) {
                    note_record(&mut report, &mut seen, pr);
                    report.valid_len = pos;
                    open = None;
                } else {
                    tail.feed(&line);
                }
            }
        }
    }

    if open.is_none() {
        // Trailing bytes outside any record (e.g. blank lines) are harmless.
        report.valid_len = pos;
    } else if tail.saw_end {
        // A body contained its own end sentinel. Later records are intact, so
        // keep the bytes and index what frames cleanly.
        for pr in tail.records {
            note_record(&mut report, &mut seen, pr);
        }
        report.misframed_tail = pos - report.valid_len;
        report.valid_len = pos;
    } else {
        report.incomplete_tail = pos - report.valid_len;
    }

    Ok(report)
}

fn note_record(report: &mut ScanReport, seen: &mut HashSet<PrNumber>, pr: PrNumber) {
    if !seen.insert(pr) && !report.duplicates.contains(&pr) {
        report.duplicates.push(pr);
    }
    report.records.push(pr);
}

/// Resynchronising pass over an unterminated record: every start sentinel
/// opens a candidate and a matching end sentinel completes it.
#[derive(Debug, Default)]
struct TailScan {
    candidate: Option<PrNumber>,
    records: Vec<PrNumber>,
    saw_end: bool,
}

impl TailScan {
    fn opened(pr: PrNumber) -> Self {
        TailScan {
            candidate: Some(pr),
            ..Self::default()
        }
    }

    fn feed(&mut self, line: &[u8]) {
        if let Some(pr) = parse_sentinel(line, END_PREFIX) {
            self.saw_end = true;
            if self.candidate == Some(pr) {
                self.records.push(pr);
                self.candidate = None;
            }
        } else if let Some(pr) = parse_sentinel(line, START_PREFIX) {
            self.candidate = Some(pr);
        }
    }
}

/// Parses `<prefix><number> =====` from a raw line.
fn parse_sentinel(line: &[u8], prefix: &str) -> Option<PrNumber> {
    let line = std::str::from_utf8(line).ok()?;
    let line = line.trim_end_matches(['\n', '\r']);
    let number = line.strip_prefix(prefix)?.strip_suffix(SENTINEL_SUFFIX)?;
    number.parse().ok().map(PrNumber)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{arb_patch_body, arb_pr_number};
    use proptest::prelude::*;
    use std::fs;
    use tempfile::tempdir;

    fn count_records(path: &Path, pr: PrNumber) -> usize {
        PatchStore::scan(path)
            .unwrap()
            .records
            .iter()
            .filter(|p| **p == pr)
            .count()
    }

    #[test]
    fn open_creates_empty_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("all_patches.txt");

        let (store, report) = PatchStore::open(&path).unwrap();

        assert!(path.exists());
        assert!(store.is_empty());
        assert_eq!(report, ScanReport::default());
    }

    #[test]
    fn append_writes_delimited_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("all_patches.txt");
        let (mut store, _) = PatchStore::open(&path).unwrap();

        let outcome = store
            .append(&PatchRecord::new(101, "From abc\n+added line"))
            .unwrap();

        assert_eq!(outcome, AppendOutcome::Appended);
        assert!(store.contains(PrNumber(101)));
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "\n\n===== PR #101 =====\nFrom abc\n+added line\n===== END PR #101 =====\n"
        );
    }

    #[test]
    fn append_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("all_patches.txt");
        let (mut store, _) = PatchStore::open(&path).unwrap();

        store.append(&PatchRecord::new(7, "first")).unwrap();
        let len_after_first = fs::metadata(&path).unwrap().len();
        let outcome = store.append(&PatchRecord::new(7, "second")).unwrap();

        assert_eq!(outcome, AppendOutcome::AlreadyPresent);
        assert_eq!(fs::metadata(&path).unwrap().len(), len_after_first);
        assert_eq!(count_records(&path, PrNumber(7)), 1);
    }

    #[test]
    fn reopen_rebuilds_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("all_patches.txt");
        {
            let (mut store, _) = PatchStore::open(&path).unwrap();
            store.append(&PatchRecord::new(1, "a")).unwrap();
            store.append(&PatchRecord::new(2, "b")).unwrap();
        }

        let (store, report) = PatchStore::open(&path).unwrap();

        assert_eq!(report.records, vec![PrNumber(1), PrNumber(2)]);
        assert!(store.contains(PrNumber(1)));
        assert!(store.contains(PrNumber(2)));
        assert!(!store.contains(PrNumber(3)));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn incomplete_tail_is_truncated_and_not_indexed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("all_patches.txt");
        {
            let (mut store, _) = PatchStore::open(&path).unwrap();
            store.append(&PatchRecord::new(1, "a")).unwrap();
            store.append(&PatchRecord::new(2, "b")).unwrap();
        }
        let complete_len = fs::metadata(&path).unwrap().len();

        // Simulate a crash halfway through writing record 3.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"\n\n===== PR #3 =====\nFrom deadbeef\n+half").unwrap();
        drop(file);

        let (mut store, report) = PatchStore::open(&path).unwrap();

        assert!(report.incomplete_tail > 0);
        assert!(!store.contains(PrNumber(3)));
        assert_eq!(fs::metadata(&path).unwrap().len(), complete_len);

        store.append(&PatchRecord::new(3, "full body")).unwrap();
        let report = PatchStore::scan(&path).unwrap();
        assert_eq!(report.records, vec![PrNumber(1), PrNumber(2), PrNumber(3)]);
        assert_eq!(report.incomplete_tail, 0);
    }

    #[test]
    fn end_sentinel_must_match_open_record() {
        let report = scan_reader(
            &b"===== PR #5 =====\nbody\n===== END PR #6 =====\nmore\n===== END PR #5 =====\n"[..],
        )
        .unwrap();

        assert_eq!(report.records, vec![PrNumber(5)]);
        assert_eq!(report.incomplete_tail, 0);
    }

    #[test]
    fn sentinels_inside_a_body_keep_later_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("all_patches.txt");
        {
            let (mut store, _) = PatchStore::open(&path).unwrap();
            store
                .append(&PatchRecord::new(
                    5,
                    "Subject: docs\n\n===== END PR #5 =====\n===== PR #7 =====\nexample\n",
                ))
                .unwrap();
            store.append(&PatchRecord::new(6, "six")).unwrap();
            store.append(&PatchRecord::new(8, "eight")).unwrap();
        }
        let written = fs::read(&path).unwrap();

        let (mut store, report) = PatchStore::open(&path).unwrap();

        assert_eq!(fs::read(&path).unwrap(), written);
        assert_eq!(report.incomplete_tail, 0);
        assert!(report.misframed_tail > 0);
        assert!(store.contains(PrNumber(5)));
        assert!(store.contains(PrNumber(6)));
        assert!(store.contains(PrNumber(8)));
        assert!(!store.contains(PrNumber(7)));

        store.append(&PatchRecord::new(9, "nine")).unwrap();
        drop(store);
        let (store, _) = PatchStore::open(&path).unwrap();
        assert!(store.contains(PrNumber(6)));
        assert!(store.contains(PrNumber(9)));
    }

    #[test]
    fn crash_after_misframed_record_is_not_truncated() {
        let data = b"===== PR #1 =====\n===== END PR #1 =====\n===== PR #2 =====\nx\n\
                     ===== END PR #1 =====\n===== PR #3 =====\ny\n===== END PR #3 =====\n\
                     ===== PR #4 =====\nhalf";
        let report = scan_reader(&data[..]).unwrap();

        assert_eq!(report.records, vec![PrNumber(1), PrNumber(3)]);
        assert_eq!(report.incomplete_tail, 0);
        assert_eq!(report.valid_len, data.len() as u64);
    }

    #[test]
    fn end_sentinel_without_trailing_newline_counts() {
        let report =
            scan_reader(&b"\n\n===== PR #9 =====\nbody\n===== END PR #9 ====="[..]).unwrap();

        assert_eq!(report.records, vec![PrNumber(9)]);
    }

    #[test]
    fn duplicates_from_older_logs_are_reported() {
        let data = b"===== PR #4 =====\nx\n===== END PR #4 =====\n\
                     ===== PR #4 =====\ny\n===== END PR #4 =====\n";
        let report = scan_reader(&data[..]).unwrap();

        assert_eq!(report.records, vec![PrNumber(4), PrNumber(4)]);
        assert_eq!(report.duplicates, vec![PrNumber(4)]);
    }

    #[test]
    fn sentinel_parsing() {
        assert_eq!(
            parse_sentinel(b"===== PR #42 =====\n", START_PREFIX),
            Some(PrNumber(42))
        );
        assert_eq!(
            parse_sentinel(b"===== END PR #42 =====\r\n", END_PREFIX),
            Some(PrNumber(42))
        );
        assert_eq!(parse_sentinel(b"===== PR #x =====\n", START_PREFIX), None);
        assert_eq!(parse_sentinel(b"+===== PR #42 =====\n", START_PREFIX), None);
        assert_eq!(parse_sentinel(&[0xff, 0xfe], START_PREFIX), None);
    }

    proptest! {
        /// However often a PR is appended, across reopenings, the log holds
        /// exactly one record for it.
        #[test]
        fn exactly_one_record_per_pr(
            batches in prop::collection::vec(prop::collection::vec(1u64..20, 0..15), 1..4)
        ) {
            let dir = tempdir().unwrap();
            let path = dir.path().join("all_patches.txt");

            let mut expected = HashSet::new();
            for batch in &batches {
                let (mut store, _) = PatchStore::open(&path).unwrap();
                for pr in batch {
                    store.append(&PatchRecord::new(*pr, format!("patch for {pr}\n"))).unwrap();
                    expected.insert(PrNumber(*pr));
                }
            }

            let report = PatchStore::scan(&path).unwrap();
            prop_assert!(report.duplicates.is_empty());
            prop_assert_eq!(report.records.len(), expected.len());
            let found: HashSet<_> = report.records.into_iter().collect();
            prop_assert_eq!(found, expected);
        }

        #[test]
        fn bodies_never_break_framing(
            records in prop::collection::vec((arb_pr_number(), arb_patch_body()), 1..10)
        ) {
            let dir = tempdir().unwrap();
            let path = dir.path().join("all_patches.txt");

            let (mut store, _) = PatchStore::open(&path).unwrap();
            for (pr, body) in &records {
                store.append(&PatchRecord::new(*pr, body.clone())).unwrap();
            }
            let indexed = store.len();
            drop(store);

            let report = PatchStore::scan(&path).unwrap();
            prop_assert_eq!(report.incomplete_tail, 0);
            prop_assert_eq!(report.records.len(), indexed);
        }
    }
}
