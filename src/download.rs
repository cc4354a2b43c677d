//! Download engine: plans units, resumes against on-disk temp files, moves
//! the remaining units through a bounded worker pool, and concatenates the
//! unit files into the target exactly once when every unit is accounted for.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::context::{ReportOutcome, TransferContext};
use crate::error::{BoxError, TransferError};
use crate::gate::PauseGate;
use crate::integrity::{self, IntegrityError};
use crate::models::{FileDescriptor, TransferConfig};
use crate::planner;
use crate::progress::{ProgressTracker, ProgressUpdate};
use crate::segments::{SegmentStore, UnitPlan};
use crate::worker;

/// Byte stream handed back by a range fetcher.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>;

/// Byte-range fetch collaborator.
///
/// Implementations map the half-open range `[from, to)` onto the transport:
/// an HTTP `Range` header, or an FTP `REST` offset (where `to` is advisory
/// and the engine's buffer bound enforces the unit length).
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    /// Opens a readable stream of the requested range. `to == None` reads to
    /// the end of the remote file.
    async fn fetch(&self, from: u64, to: Option<u64>) -> Result<ByteStream, BoxError>;
}

/// Segmented, resumable download of a single file.
pub struct Downloader {
    config: TransferConfig,
    fetcher: Arc<dyn RangeFetcher>,
    gate: Arc<PauseGate>,
    stop: CancellationToken,
    progress_tx: watch::Sender<ProgressUpdate>,
}

impl Downloader {
    pub fn new(config: TransferConfig, fetcher: Arc<dyn RangeFetcher>) -> Result<Self, TransferError> {
        config.validate()?;
        let (progress_tx, _) = watch::channel(ProgressUpdate::default());
        Ok(Self {
            config,
            fetcher,
            gate: Arc::new(PauseGate::new()),
            stop: CancellationToken::new(),
            progress_tx,
        })
    }

    /// Delays every unit at its next buffer read. In-flight reads finish.
    pub fn suspend(&self) {
        self.gate.suspend();
    }

    /// Releases all units blocked by [`Downloader::suspend`].
    pub fn resume(&self) {
        self.gate.resume();
    }

    /// Stops dispatching further batches. In-flight units finish (or fail);
    /// the running transfer returns [`TransferError::Stopped`].
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Progress stream for this transfer; the completion signal is the
    /// return value of [`Downloader::run`].
    pub fn progress(&self) -> watch::Receiver<ProgressUpdate> {
        self.progress_tx.subscribe()
    }

    /// Runs the transfer to completion and returns the finalized target path.
    ///
    /// Resumable: partial unit files left by an earlier attempt under the
    /// same `(file_id, version_tag)` are reused, and re-invoking after a
    /// failure retries only what is missing.
    pub async fn run(&self, desc: &FileDescriptor, target: &Path) -> Result<PathBuf, TransferError> {
        let units = planner::plan(desc.total_len, self.config.unit_size)?;
        let store = SegmentStore::new(&desc.temp_root);
        let plans = store.prepare(desc, units).await?;

        let satisfied_units = plans.iter().filter(|p| p.is_satisfied()).count();
        let satisfied_bytes: u64 = plans
            .iter()
            .filter(|p| p.is_satisfied())
            .map(|p| p.unit.length)
            .sum();
        tracing::debug!(
            file = %desc.file_id,
            total_units = plans.len(),
            satisfied_units,
            "download planned"
        );

        let ctx = Arc::new(TransferContext::new(
            plans.len(),
            satisfied_units,
            desc.total_len,
            satisfied_bytes,
        ));
        let tracker = Arc::new(ProgressTracker::new(
            self.progress_tx.clone(),
            desc.total_len,
            satisfied_bytes,
        ));

        // Zero units, or resume satisfied everything.
        let mut do_finalize = ctx.try_begin_finalize();

        let remaining: Vec<UnitPlan> = plans
            .iter()
            .filter(|p| !p.is_satisfied())
            .cloned()
            .collect();
        if !remaining.is_empty() {
            ctx.mark_in_progress();
        }

        let mut stopped = false;
        for batch in remaining.chunks(self.config.worker_count) {
            if self.stop.is_cancelled() {
                stopped = true;
                break;
            }
            let mut handles = Vec::with_capacity(batch.len());
            for plan in batch {
                let plan = plan.clone();
                let fetcher = self.fetcher.clone();
                let gate = self.gate.clone();
                let ctx = ctx.clone();
                let tracker = tracker.clone();
                handles.push(tokio::spawn(async move {
                    run_unit(fetcher.as_ref(), &plan, &gate, &ctx, &tracker).await
                }));
            }
            // The whole batch finishes before the next one starts, capping
            // open connections and buffered memory at worker_count units.
            for handle in handles {
                let outcome = handle.await.map_err(TransferError::session)?;
                if outcome.finalize {
                    do_finalize = true;
                }
            }
        }

        if !do_finalize {
            ctx.mark_failed();
            debug_assert!(stopped, "dispatch ended without reaching the unit total");
            return Err(TransferError::Stopped);
        }

        match self.finalize(&ctx, &plans, target).await {
            Ok(path) => {
                store.discard(desc).await;
                ctx.mark_completed();
                tracing::debug!(file = %desc.file_id, target = %path.display(), "download completed");
                Ok(path)
            }
            Err(err) => {
                // Temp unit files are left in place so the next attempt can
                // resume from them.
                ctx.mark_failed();
                tracing::warn!(file = %desc.file_id, error = %err.chain_message(), "download failed");
                Err(err)
            }
        }
    }

    /// Verifies the finalized target against an expected SHA-256 digest.
    pub async fn verify_sha256(&self, target: &Path, expected: &str) -> Result<bool, IntegrityError> {
        integrity::verify_file(target, expected).await
    }

    /// Concatenates the unit files into `target` in index order, then
    /// deletes the temp files best-effort.
    async fn finalize(
        &self,
        ctx: &TransferContext,
        plans: &[UnitPlan],
        target: &Path,
    ) -> Result<PathBuf, TransferError> {
        if let Some(err) = ctx.take_error() {
            return Err(err);
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(target)
            .await?;
        let mut buf = vec![0u8; self.config.copy_buffer];
        for plan in plans {
            let path = plan
                .unit
                .local_path
                .as_ref()
                .ok_or_else(|| TransferError::Configuration("unit has no local path".into()))?;
            let mut src = File::open(path).await?;
            // Each unit contributes exactly unit.length bytes to the target.
            // A longer temp file (leftover from an attempt with a different
            // unit size) is read only up to that bound; a shorter one means
            // the temp state cannot produce the declared total.
            let mut remaining = plan.unit.length;
            while remaining > 0 {
                let room = (buf.len() as u64).min(remaining) as usize;
                let n = src.read(&mut buf[..room]).await?;
                if n == 0 {
                    return Err(TransferError::Protocol(format!(
                        "unit {} temp file ends {} bytes short of its declared length",
                        plan.unit.index, remaining
                    )));
                }
                out.write_all(&buf[..n]).await?;
                remaining -= n as u64;
            }
        }
        out.flush().await?;
        drop(out);

        for plan in plans {
            if let Some(path) = &plan.unit.local_path {
                if let Err(e) = fs::remove_file(path).await {
                    if e.kind() != io::ErrorKind::NotFound {
                        tracing::debug!(path = %path.display(), error = %e, "temp file cleanup skipped");
                    }
                }
            }
        }
        Ok(target.to_path_buf())
    }
}

async fn run_unit(
    fetcher: &dyn RangeFetcher,
    plan: &UnitPlan,
    gate: &PauseGate,
    ctx: &TransferContext,
    tracker: &ProgressTracker,
) -> ReportOutcome {
    let unit = &plan.unit;
    let have = plan.bytes_on_disk();
    let from = unit.byte_from + have;

    let outcome = match fetcher.fetch(from, Some(unit.byte_to)).await {
        Err(e) => ctx.record_error(TransferError::transport(unit.index, e)),
        Ok(stream) => match worker::fill_unit(unit, have, stream, gate).await {
            Err(e) => ctx.record_error(e),
            Ok(buf) => {
                // Persist whatever arrived before judging completeness, so a
                // short stream still leaves resumable bytes on disk.
                let persisted = if unit.needs_persist && !buf.is_empty() {
                    worker::persist_unit(unit, have, &buf).await
                } else {
                    Ok(())
                };
                let got = have + buf.len() as u64;
                match persisted {
                    Err(e) => ctx.record_error(e),
                    Ok(()) if got < unit.length => ctx.record_error(TransferError::transport(
                        unit.index,
                        format!("stream ended after {got} of {} bytes", unit.length),
                    )),
                    Ok(()) => ctx.record_success(unit.length, None),
                }
            }
        },
    };
    tracker.emit(outcome.transferred, outcome.percent);
    outcome
}
