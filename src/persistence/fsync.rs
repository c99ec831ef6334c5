//! fsync helpers.
//!
//! Appending a patch record or replacing the credential status file is only
//! durable once both the file and, for renames, its parent directory have been
//! synced. Without the directory sync a freshly renamed status file can revert
//! to its previous contents after power loss.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// Syncs a file's contents and metadata to disk.
pub fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Syncs a directory so that entries created or renamed in it are durable.
///
/// Callers should only pass directory paths.
pub fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    let dir = OpenOptions::new().read(true).open(dir_path)?;
    dir.sync_all()
}
