//! Progress reporting.
//!
//! Progress is a `watch` stream separate from the one-shot completion result
//! returned by the engine future. Receivers only ever observe the latest
//! update.

use std::time::{Duration, Instant};

use tokio::sync::watch;

/// Snapshot of transfer progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// `floor(100 * transferred / total)`; 100 for zero-length files.
    pub percent: u8,
    /// Bytes accounted for so far, including units satisfied by resume.
    pub transferred: u64,
    /// Total bytes in the transfer.
    pub total: u64,
    /// Human-readable speed of this attempt, e.g. `1.2 MB/s`.
    pub speed: String,
}

/// Formats an average transfer speed over `elapsed`.
pub fn speed_label(bytes: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return "0 B/s".into();
    }
    let rate = bytes as f64 / secs;
    if rate >= 1024.0 * 1024.0 {
        format!("{:.1} MB/s", rate / (1024.0 * 1024.0))
    } else if rate >= 1024.0 {
        format!("{:.1} KB/s", rate / 1024.0)
    } else {
        format!("{rate:.0} B/s")
    }
}

/// Emits progress updates for one transfer attempt.
///
/// Speed is computed over bytes moved in this attempt only, so resumed units
/// do not inflate the rate.
#[derive(Debug)]
pub struct ProgressTracker {
    tx: watch::Sender<ProgressUpdate>,
    total: u64,
    initial: u64,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(tx: watch::Sender<ProgressUpdate>, total: u64, initial: u64) -> Self {
        Self {
            tx,
            total,
            initial,
            started: Instant::now(),
        }
    }

    /// Publishes the latest offset. `transferred` includes resumed bytes.
    pub fn emit(&self, transferred: u64, percent: u8) {
        let moved = transferred.saturating_sub(self.initial);
        let update = ProgressUpdate {
            percent,
            transferred,
            total: self.total,
            speed: speed_label(moved, self.started.elapsed()),
        };
        // Stored even when nobody is subscribed yet.
        self.tx.send_replace(update);
    }
}
