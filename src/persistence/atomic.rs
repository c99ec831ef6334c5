//! Whole-file replacement that never exposes a partial write.
//!
//! Used for the credential status file and the manifest metadata file:
//! 1. Write to `<path>.tmp`
//! 2. fsync the temp file
//! 3. Rename over `<path>`
//! 4. fsync the parent directory
//!
//! Readers see either the previous contents or the new ones.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::fsync::{fsync_dir, fsync_file};

/// Atomically replaces `path` with `bytes`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = parent_dir(path);
    if let Some(parent) = &parent {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = tmp_path_for(path);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(bytes)?;
        fsync_file(&file)?;
    }

    fs::rename(&tmp_path, path)?;

    if let Some(parent) = &parent {
        fsync_dir(parent)?;
    }

    Ok(())
}

/// Serializes `value` as pretty JSON and writes it atomically.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    write_atomic(path, &bytes)
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// The directory to create and sync, or `None` for a bare relative file name.
fn parent_dir(path: &Path) -> Option<PathBuf> {
    match path.parent() {
        Some(p) if p.as_os_str().is_empty() => Some(PathBuf::from(".")),
        Some(p) => Some(p.to_path_buf()),
        None => None,
    }
}
