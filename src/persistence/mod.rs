//! Durable storage for the crawler.
//!
//! # File Layout
//!
//! ```text
//! <output_dir>/
//!   all_patches.txt     # append-only patch log (see `patch_log`)
//!   token_status.json   # credential status, replaced atomically
//!   pr_metadata.json    # manifest rows, replaced atomically
//! ```
//!
//! # Crash Safety
//!
//! - Patch log: one write + fsync per record; an unterminated trailing record
//!   is truncated on the next open, and the membership index is always
//!   rebuilt from the log rather than trusted across restarts.
//! - JSON files: write-to-temp-then-rename with file and directory fsync.
//!
//! Neither file is protected against concurrent writers from other processes.

pub mod atomic;
pub mod fsync;
pub mod patch_log;

pub use atomic::{write_atomic, write_json_atomic};
pub use fsync::{fsync_dir, fsync_file};
pub use patch_log::{AppendOutcome, PatchStore, PatchStoreError, ScanReport};
