//! Run statistics.

use std::fmt;

use serde::Serialize;

use crate::types::PrNumber;

/// An item given up on in this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    pub pr: PrNumber,
    pub reason: String,
}

/// Outcome counts for one run.
///
/// `succeeded + skipped + failed.len() + remaining == total` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct RunSummary {
    /// Manifest rows.
    pub total: usize,

    /// Patches fetched and stored in this run.
    pub succeeded: usize,

    /// Rows whose patch was already stored (including repeated rows).
    pub skipped: usize,

    /// Rows given up on, with reasons.
    pub failed: Vec<FailedItem>,

    /// Rows never finished because the run was interrupted.
    pub remaining: usize,

    /// True if the run was cancelled.
    pub interrupted: bool,
}

impl RunSummary {
    pub(crate) fn new(total: usize, skipped: usize) -> Self {
        RunSummary {
            total,
            skipped,
            ..Self::default()
        }
    }

    /// Sets `remaining` from the other counts. A cancellation that left
    /// nothing unfinished does not mark the run interrupted.
    pub(crate) fn finish(&mut self, cancelled: bool) {
        let accounted = self.succeeded + self.skipped + self.failed.len();
        self.remaining = self.total.saturating_sub(accounted);
        self.interrupted = cancelled && self.remaining > 0;
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} successful, {} failed, {} skipped",
            self.succeeded,
            self.failed.len(),
            self.skipped
        )?;
        if self.interrupted {
            write!(f, ", {} remaining (interrupted)", self.remaining)?;
        }
        Ok(())
    }
}
