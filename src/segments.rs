//! Segment/part store: owns the on-disk temp layout for downloads and the
//! resume decisions for both directions.
//!
//! Download resume is driven purely by the presence and length of per-unit
//! temp files under `temp_root/<file_id>/<version_tag>/`. Upload resume is
//! driven purely by the remote part listing. The `(file_id, version_tag)`
//! namespacing means a changed remote file lands in a fresh directory and
//! never reuses stale partial data.

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;

use tokio::fs;

use crate::error::TransferError;
use crate::models::{FileDescriptor, RemotePart, TransferUnit};

/// What resume detection decided for one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitDisposition {
    /// No usable temp data; fetch the full range.
    Full,
    /// `have` bytes already on disk; fetch the tail and append.
    Partial { have: u64 },
    /// Temp file is complete; skip fetch and persist.
    Satisfied,
}

/// A planned unit plus its resume disposition.
#[derive(Debug, Clone)]
pub struct UnitPlan {
    pub unit: TransferUnit,
    pub disposition: UnitDisposition,
}

impl UnitPlan {
    pub fn is_satisfied(&self) -> bool {
        self.disposition == UnitDisposition::Satisfied
    }

    /// Bytes already on disk for this unit.
    pub fn bytes_on_disk(&self) -> u64 {
        match self.disposition {
            UnitDisposition::Full => 0,
            UnitDisposition::Partial { have } => have,
            UnitDisposition::Satisfied => self.unit.length,
        }
    }
}

/// Per-file registry of unit temp files.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    temp_root: PathBuf,
}

impl SegmentStore {
    pub fn new(temp_root: impl Into<PathBuf>) -> Self {
        Self {
            temp_root: temp_root.into(),
        }
    }

    /// Directory holding this transfer attempt's unit files.
    pub fn unit_dir(&self, desc: &FileDescriptor) -> PathBuf {
        self.temp_root
            .join(&desc.file_id)
            .join(&desc.version_tag)
    }

    /// Temp path for one unit: `<dir>/<file_id>_<index>.tmp`.
    pub fn unit_path(&self, desc: &FileDescriptor, index: usize) -> PathBuf {
        self.unit_dir(desc)
            .join(format!("{}_{}.tmp", desc.file_id, index))
    }

    /// Assigns temp paths and resolves each unit against on-disk state.
    ///
    /// Deterministic for a given disk state: running it twice yields the same
    /// dispositions, and a satisfied unit can never be re-marked as needed.
    pub async fn prepare(
        &self,
        desc: &FileDescriptor,
        units: Vec<TransferUnit>,
    ) -> Result<Vec<UnitPlan>, TransferError> {
        let dir = self.unit_dir(desc);
        fs::create_dir_all(&dir).await?;

        let mut plans = Vec::with_capacity(units.len());
        for mut unit in units {
            let path = self.unit_path(desc, unit.index);
            let have = match fs::metadata(&path).await {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
                Err(e) => return Err(TransferError::Filesystem(e)),
            };
            let disposition = if have >= unit.length {
                unit.needs_persist = false;
                UnitDisposition::Satisfied
            } else if have > 0 {
                UnitDisposition::Partial { have }
            } else {
                UnitDisposition::Full
            };
            unit.local_path = Some(path);
            plans.push(UnitPlan { unit, disposition });
        }
        Ok(plans)
    }

    /// Removes the attempt's temp directory. Best-effort: callers use this
    /// after finalize, when leftovers no longer carry resume value.
    pub async fn discard(&self, desc: &FileDescriptor) {
        let dir = self.unit_dir(desc);
        if let Err(e) = fs::remove_dir_all(&dir).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!(dir = %dir.display(), error = %e, "temp dir cleanup skipped");
            }
        }
    }
}

/// Outcome of resolving an upload against the remote part listing.
#[derive(Debug, Clone)]
pub struct PartResolution {
    /// 1-based part numbers still needing upload, ascending.
    pub needed: Vec<u32>,
    /// Parts the remote already acknowledged; merged into the completion call.
    pub satisfied: Vec<RemotePart>,
}

/// Computes `{1..=total_parts} - listed` from a remote part listing.
///
/// A listing with duplicate part numbers cannot be trusted and fails with a
/// protocol error. Part numbers outside the plan are ignored with a warning.
pub fn resolve_parts(
    total_parts: u32,
    listed: Vec<RemotePart>,
) -> Result<PartResolution, TransferError> {
    let mut seen = HashSet::new();
    let mut satisfied = Vec::with_capacity(listed.len());
    for part in listed {
        if part.part_number == 0 || part.part_number > total_parts {
            tracing::warn!(part = part.part_number, total_parts, "listed part outside plan ignored");
            continue;
        }
        if !seen.insert(part.part_number) {
            return Err(TransferError::Protocol(format!(
                "remote listing contains part {} more than once",
                part.part_number
            )));
        }
        satisfied.push(part);
    }
    let needed = (1..=total_parts)
        .filter(|n| !seen.contains(n))
        .collect();
    Ok(PartResolution { needed, satisfied })
}
