use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default unit size: 200 KiB.
pub const DEFAULT_UNIT_SIZE: u64 = 200 * 1024;

/// Default copy buffer used when concatenating unit files.
pub const DEFAULT_COPY_BUFFER: usize = 8 * 1024;

/// One independently transferable slice of a file.
///
/// A "segment" on the download path, a "part" on the upload path. Ranges are
/// contiguous, non-overlapping and ordered by `index`; the index assigned at
/// planning time is the unit's permanent identity (0-based segment index,
/// `index + 1` is the 1-based part number).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferUnit {
    pub index: usize,
    /// First byte of the unit's range.
    pub byte_from: u64,
    /// One past the last byte of the unit's range.
    pub byte_to: u64,
    /// Declared length of the unit (`byte_to - byte_from`).
    pub length: u64,
    /// Temp file backing this unit on the download path. Unused for uploads.
    pub local_path: Option<PathBuf>,
    /// False when a complete temp file already exists and the unit must not
    /// be rewritten.
    pub needs_persist: bool,
}

impl TransferUnit {
    /// 1-based part number used by multipart upload stores.
    pub fn part_number(&self) -> u32 {
        self.index as u32 + 1
    }
}

/// A part acknowledged by the remote multipart store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePart {
    pub part_number: u32,
    pub etag: String,
}

impl RemotePart {
    pub fn new(part_number: u32, etag: impl Into<String>) -> Self {
        Self {
            part_number,
            etag: etag.into(),
        }
    }
}

/// Identity of one file transfer attempt.
///
/// `version_tag` (Last-Modified, an etag, or an upload session id) is part of
/// the resume key: temp state is namespaced by `(file_id, version_tag)`, so a
/// changed remote file never reuses stale partial data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub file_id: String,
    pub total_len: u64,
    pub version_tag: String,
    pub temp_root: PathBuf,
}

/// Lifecycle of a single transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    Planned,
    InProgress,
    Finalizing,
    Completed,
    Failed,
}

/// Engine configuration, passed explicitly at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Size of each full unit in bytes.
    pub unit_size: u64,
    /// Number of units moved concurrently per batch.
    pub worker_count: usize,
    /// Copy buffer size for finalize concatenation.
    pub copy_buffer: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            unit_size: DEFAULT_UNIT_SIZE,
            worker_count: 1,
            copy_buffer: DEFAULT_COPY_BUFFER,
        }
    }
}

impl TransferConfig {
    /// Validates the configuration, failing before any transfer starts.
    pub fn validate(&self) -> Result<(), crate::error::TransferError> {
        if self.unit_size == 0 {
            return Err(crate::error::TransferError::Configuration(
                "unit_size must be greater than 0".into(),
            ));
        }
        if self.worker_count == 0 {
            return Err(crate::error::TransferError::Configuration(
                "worker_count must be greater than 0".into(),
            ));
        }
        if self.copy_buffer == 0 {
            return Err(crate::error::TransferError::Configuration(
                "copy_buffer must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
