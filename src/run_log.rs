//! Human-readable progress log (`download_log.txt`).
//!
//! Every line is `YYYY-MM-DD HH:MM:SS - message` in UTC. Messages are also
//! emitted through `tracing` so they show up on the console.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Append-only text log of a crawl.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl RunLog {
    /// Opens the log. A fresh run truncates it; a resumed run appends.
    pub fn open(path: impl AsRef<Path>, resume: bool) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut options = OpenOptions::new();
        options.create(true);
        if resume {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        let file = options.open(&path)?;
        Ok(RunLog {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one line stamped with `at`.
    ///
    /// Failures are reported through `tracing` only.
    pub fn line(&self, at: DateTime<Utc>, message: &str) {
        info!("{message}");
        let line = format_line(at, message);
        let result = match self.file.lock() {
            Ok(mut file) => file.write_all(line.as_bytes()),
            Err(poisoned) => poisoned.into_inner().write_all(line.as_bytes()),
        };
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "failed to write run log");
        }
    }
}

fn format_line(at: DateTime<Utc>, message: &str) -> String {
    format!("{} - {message}\n", at.format(TIMESTAMP_FORMAT))
}
