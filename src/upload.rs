//! Upload engine: plans parts over a local source file, resumes against the
//! remote part listing, uploads the missing parts through the same bounded
//! batch pool the download path uses, and completes the multipart session
//! exactly once with the parts sorted ascending by part number.

use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::context::{ReportOutcome, TransferContext};
use crate::error::{BoxError, TransferError};
use crate::gate::PauseGate;
use crate::models::{RemotePart, TransferConfig, TransferUnit};
use crate::planner;
use crate::progress::{ProgressTracker, ProgressUpdate};
use crate::segments::{self, PartResolution};
use crate::worker;

/// Multipart store collaborator (object-storage style).
#[async_trait]
pub trait MultipartStore: Send + Sync {
    /// Starts a multipart session and returns its upload id.
    async fn initiate(&self, bucket: &str, key: &str) -> Result<String, BoxError>;
    /// Lists parts the remote has already acknowledged for the session.
    async fn list_parts(&self, upload_id: &str) -> Result<Vec<RemotePart>, BoxError>;
    /// Uploads one part and returns its acknowledgement.
    async fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<RemotePart, BoxError>;
    /// Completes the session from an ordered part list; returns the remote
    /// location of the assembled object.
    async fn complete(
        &self,
        upload_id: &str,
        parts: Vec<RemotePart>,
    ) -> Result<String, BoxError>;
    /// Aborts the session, discarding its uploaded parts.
    async fn abort(&self, upload_id: &str) -> Result<(), BoxError>;
}

/// Result of a finished upload.
#[derive(Debug, Clone)]
pub struct CompletedUpload {
    pub upload_id: String,
    /// Remote location reported by the completion call.
    pub location: String,
}

/// Segmented, resumable multipart upload of a single file.
pub struct Uploader {
    config: TransferConfig,
    store: Arc<dyn MultipartStore>,
    gate: Arc<PauseGate>,
    stop: CancellationToken,
    progress_tx: watch::Sender<ProgressUpdate>,
}

impl Uploader {
    pub fn new(config: TransferConfig, store: Arc<dyn MultipartStore>) -> Result<Self, TransferError> {
        config.validate()?;
        let (progress_tx, _) = watch::channel(ProgressUpdate::default());
        Ok(Self {
            config,
            store,
            gate: Arc::new(PauseGate::new()),
            stop: CancellationToken::new(),
            progress_tx,
        })
    }

    /// Delays every part at its next source read. In-flight reads finish.
    pub fn suspend(&self) {
        self.gate.suspend();
    }

    /// Releases all parts blocked by [`Uploader::suspend`].
    pub fn resume(&self) {
        self.gate.resume();
    }

    /// Stops dispatching further batches. The running transfer returns
    /// [`TransferError::Stopped`]; the session stays open for a later resume.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn progress(&self) -> watch::Receiver<ProgressUpdate> {
        self.progress_tx.subscribe()
    }

    /// Uploads `source` to `bucket/key`.
    ///
    /// Pass `resume_upload_id` to continue an interrupted session: the remote
    /// part listing decides what still needs uploading, and previously
    /// acknowledged parts are merged into the completion call. The caller is
    /// responsible for only resuming a session created for the same source
    /// content; a new session must be started when the source changed.
    pub async fn run(
        &self,
        source: &Path,
        bucket: &str,
        key: &str,
        resume_upload_id: Option<&str>,
    ) -> Result<CompletedUpload, TransferError> {
        let total_len = fs::metadata(source).await?.len();
        let units = planner::plan(total_len, self.config.unit_size)?;
        let total_parts = units.len() as u32;

        let upload_id = match resume_upload_id {
            Some(id) => id.to_string(),
            None => self
                .store
                .initiate(bucket, key)
                .await
                .map_err(TransferError::session)?,
        };
        let listed = if resume_upload_id.is_some() {
            self.store
                .list_parts(&upload_id)
                .await
                .map_err(TransferError::session)?
        } else {
            Vec::new()
        };
        let PartResolution { needed, satisfied } = segments::resolve_parts(total_parts, listed)?;

        let satisfied_bytes: u64 = satisfied
            .iter()
            .map(|p| units[(p.part_number - 1) as usize].length)
            .sum();
        tracing::debug!(
            key,
            total_parts,
            satisfied = satisfied.len(),
            "upload planned"
        );

        let ctx = Arc::new(TransferContext::new(
            units.len(),
            satisfied.len(),
            total_len,
            satisfied_bytes,
        ));
        let tracker = Arc::new(ProgressTracker::new(
            self.progress_tx.clone(),
            total_len,
            satisfied_bytes,
        ));

        let mut do_finalize = ctx.try_begin_finalize();

        let remaining: Vec<TransferUnit> = needed
            .iter()
            .map(|n| units[(n - 1) as usize].clone())
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
            for unit in batch {
                let unit = unit.clone();
                let store = self.store.clone();
                let upload_id = upload_id.clone();
                let source = source.to_path_buf();
                let gate = self.gate.clone();
                let ctx = ctx.clone();
                let tracker = tracker.clone();
                let chunk = self.config.copy_buffer;
                handles.push(tokio::spawn(async move {
                    run_part(
                        store.as_ref(),
                        &upload_id,
                        &unit,
                        &source,
                        &gate,
                        &ctx,
                        &tracker,
                        chunk,
                    )
                    .await
                }));
            }
            // Bounded dispatch: never more than worker_count parts in flight.
            for handle in handles {
                let outcome = handle.await.map_err(TransferError::session)?;
                if outcome.finalize {
                    do_finalize = true;
                }
            }
        }

        if !do_finalize {
            ctx.mark_failed();
            debug_assert!(stopped, "dispatch ended without reaching the part total");
            return Err(TransferError::Stopped);
        }

        match self
            .finalize(&ctx, satisfied, total_parts, &upload_id)
            .await
        {
            Ok(location) => {
                ctx.mark_completed();
                tracing::debug!(key, location, "upload completed");
                Ok(CompletedUpload {
                    upload_id,
                    location,
                })
            }
            Err(err) => {
                // The session is left open; a resume retries only the
                // missing parts.
                ctx.mark_failed();
                tracing::warn!(key, error = %err.chain_message(), "upload failed");
                Err(err)
            }
        }
    }

    /// Aborts one multipart session. Only the given session is touched.
    pub async fn abort(&self, upload_id: &str) -> Result<(), TransferError> {
        self.store
            .abort(upload_id)
            .await
            .map_err(TransferError::session)
    }

    /// Merges newly uploaded parts with previously acknowledged ones, sorts
    /// ascending by part number, and issues the completion call.
    async fn finalize(
        &self,
        ctx: &TransferContext,
        satisfied: Vec<RemotePart>,
        total_parts: u32,
        upload_id: &str,
    ) -> Result<String, TransferError> {
        if let Some(err) = ctx.take_error() {
            return Err(err);
        }

        let mut parts = ctx.collected_parts();
        parts.extend(satisfied);
        parts.sort_by_key(|p| p.part_number);
        for pair in parts.windows(2) {
            if pair[0].part_number == pair[1].part_number {
                return Err(TransferError::Protocol(format!(
                    "part {} acknowledged more than once",
                    pair[0].part_number
                )));
            }
        }
        if parts.len() as u32 != total_parts {
            return Err(TransferError::Protocol(format!(
                "completion requires {} parts, have {}",
                total_parts,
                parts.len()
            )));
        }

        self.store
            .complete(upload_id, parts)
            .await
            .map_err(TransferError::session)
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_part(
    store: &dyn MultipartStore,
    upload_id: &str,
    unit: &TransferUnit,
    source: &Path,
    gate: &PauseGate,
    ctx: &TransferContext,
    tracker: &ProgressTracker,
    chunk_size: usize,
) -> ReportOutcome {
    let outcome = match worker::read_slice(source, unit.byte_from, unit.length, gate, chunk_size)
        .await
    {
        Err(e) => ctx.record_error(TransferError::Filesystem(e)),
        Ok(data) if (data.len() as u64) < unit.length => {
            ctx.record_error(TransferError::Filesystem(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "source ended at {} bytes inside part {}",
                    data.len(),
                    unit.part_number()
                ),
            )))
        }
        Ok(data) => match store.upload_part(upload_id, unit.part_number(), data).await {
            Ok(part) => ctx.record_success(unit.length, Some(part)),
            Err(e) => ctx.record_error(TransferError::transport(unit.index, e)),
        },
    };
    tracker.emit(outcome.transferred, outcome.percent);
    outcome
}
