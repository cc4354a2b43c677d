//! Completion coordination for one transfer attempt.
//!
//! Every worker reports exactly once. The completed counter, the collected
//! part results, the first-observed error and the finalize-once gate all live
//! behind a single lock, so the increment and the `completed == total` check
//! are atomic with respect to each other. Exactly one reporter (or the
//! engine, when everything was satisfied by resume) observes the boundary and
//! wins the right to finalize.

use std::sync::Mutex;

use crate::error::TransferError;
use crate::models::{RemotePart, TransferState};

/// What a worker's report produced, evaluated inside the critical section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportOutcome {
    /// `floor(100 * offset / total_bytes)` after this report.
    pub percent: u8,
    /// Byte offset after this report, including resume-satisfied bytes.
    pub transferred: u64,
    /// True for exactly one report per transfer: the caller must run the
    /// finalizer.
    pub finalize: bool,
}

#[derive(Debug)]
struct ContextState {
    state: TransferState,
    total_units: usize,
    completed_units: usize,
    finalize_started: bool,
    first_error: Option<TransferError>,
    offset: u64,
    parts: Vec<RemotePart>,
}

/// Shared bookkeeping for one transfer attempt. Created per attempt and
/// discarded when the attempt (including finalize) ends.
#[derive(Debug)]
pub struct TransferContext {
    total_bytes: u64,
    inner: Mutex<ContextState>,
}

impl TransferContext {
    /// Seeds the context with the planned unit count and whatever resume
    /// detection already satisfied.
    pub fn new(
        total_units: usize,
        satisfied_units: usize,
        total_bytes: u64,
        satisfied_bytes: u64,
    ) -> Self {
        Self {
            total_bytes,
            inner: Mutex::new(ContextState {
                state: TransferState::Planned,
                total_units,
                completed_units: satisfied_units,
                finalize_started: false,
                first_error: None,
                offset: satisfied_bytes,
                parts: Vec::new(),
            }),
        }
    }

    /// Marks the first worker dispatch.
    pub fn mark_in_progress(&self) {
        let mut inner = self.inner.lock().expect("context lock poisoned");
        if inner.state == TransferState::Planned {
            inner.state = TransferState::InProgress;
        }
    }

    /// Records one successful unit. `bytes` is the unit's declared length;
    /// uploads also hand over the remote part result.
    pub fn record_success(&self, bytes: u64, part: Option<RemotePart>) -> ReportOutcome {
        let mut inner = self.inner.lock().expect("context lock poisoned");
        inner.completed_units += 1;
        inner.offset += bytes;
        if let Some(part) = part {
            inner.parts.push(part);
        }
        self.outcome_locked(&mut inner)
    }

    /// Records a failed unit. The first error wins; later errors are logged
    /// and dropped. The counter still advances so the transfer cannot stall.
    pub fn record_error(&self, err: TransferError) -> ReportOutcome {
        let mut inner = self.inner.lock().expect("context lock poisoned");
        inner.completed_units += 1;
        if inner.first_error.is_none() {
            inner.first_error = Some(err);
        } else {
            tracing::warn!(error = %err, "subsequent unit error dropped");
        }
        self.outcome_locked(&mut inner)
    }

    /// One-shot finalize gate for the case where no unit needed dispatch
    /// (zero-length file, or resume satisfied everything).
    pub fn try_begin_finalize(&self) -> bool {
        let mut inner = self.inner.lock().expect("context lock poisoned");
        Self::check_finalize_locked(&mut inner)
    }

    pub fn has_error(&self) -> bool {
        self.inner
            .lock()
            .expect("context lock poisoned")
            .first_error
            .is_some()
    }

    /// Takes the first-observed error, leaving the context error-free.
    pub fn take_error(&self) -> Option<TransferError> {
        self.inner
            .lock()
            .expect("context lock poisoned")
            .first_error
            .take()
    }

    /// Part results in the order workers reported them.
    pub fn collected_parts(&self) -> Vec<RemotePart> {
        self.inner
            .lock()
            .expect("context lock poisoned")
            .parts
            .clone()
    }

    pub fn state(&self) -> TransferState {
        self.inner.lock().expect("context lock poisoned").state
    }

    pub fn completed_units(&self) -> usize {
        self.inner
            .lock()
            .expect("context lock poisoned")
            .completed_units
    }

    /// Terminal transition, set exactly once by the engine.
    pub fn mark_completed(&self) {
        self.inner.lock().expect("context lock poisoned").state = TransferState::Completed;
    }

    /// Terminal transition, set exactly once by the engine.
    pub fn mark_failed(&self) {
        self.inner.lock().expect("context lock poisoned").state = TransferState::Failed;
    }

    fn outcome_locked(&self, inner: &mut ContextState) -> ReportOutcome {
        let finalize = Self::check_finalize_locked(inner);
        ReportOutcome {
            percent: self.percent_locked(inner),
            transferred: inner.offset,
            finalize,
        }
    }

    fn check_finalize_locked(inner: &mut ContextState) -> bool {
        if inner.completed_units == inner.total_units && !inner.finalize_started {
            inner.finalize_started = true;
            inner.state = TransferState::Finalizing;
            return true;
        }
        false
    }

    fn percent_locked(&self, inner: &ContextState) -> u8 {
        if self.total_bytes == 0 {
            return 100;
        }
        (100 * inner.offset / self.total_bytes).min(100) as u8
    }
}
