//! Per-unit transfer work: filling a unit buffer from a byte stream,
//! persisting it to the unit's temp file, and reading a unit's slice of a
//! local source file for upload.
//!
//! All reads block on the pause gate first, so suspending a transfer stalls
//! every unit at its next buffer read without aborting anything in flight.

use std::path::Path;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::error::{BoxError, TransferError};
use crate::gate::PauseGate;
use crate::models::TransferUnit;

/// Accumulates the remaining bytes of `unit` from `stream` into a private
/// buffer. `have` is how much of the unit is already on disk.
///
/// A read returning more bytes than the buffer has room for is truncated to
/// the remaining space; remotes occasionally overshoot the declared range and
/// the declared length is the invariant. The loop ends when the buffer is
/// full or the stream is exhausted; callers judge completeness by comparing
/// the returned length against the unit length.
pub async fn fill_unit<S>(
    unit: &TransferUnit,
    have: u64,
    mut stream: S,
    gate: &PauseGate,
) -> Result<Vec<u8>, TransferError>
where
    S: Stream<Item = Result<Bytes, BoxError>> + Unpin,
{
    let want = unit.length.saturating_sub(have) as usize;
    let mut buf = Vec::with_capacity(want);
    while buf.len() < want {
        gate.wait_open().await;
        match stream.next().await {
            Some(Ok(chunk)) => {
                let room = want - buf.len();
                let take = chunk.len().min(room);
                buf.extend_from_slice(&chunk[..take]);
            }
            Some(Err(e)) => return Err(TransferError::transport(unit.index, e)),
            None => {
                if buf.len() < want {
                    tracing::warn!(
                        unit = unit.index,
                        got = buf.len(),
                        want,
                        "stream exhausted before unit was full"
                    );
                }
                break;
            }
        }
    }
    Ok(buf)
}

/// Writes a unit buffer to its temp file: append when resuming a partial
/// file, create otherwise.
pub async fn persist_unit(
    unit: &TransferUnit,
    have: u64,
    data: &[u8],
) -> Result<(), TransferError> {
    let path = unit
        .local_path
        .as_ref()
        .ok_or_else(|| TransferError::Configuration("unit has no local path".into()))?;
    let mut file = if have > 0 {
        OpenOptions::new().append(true).open(path).await?
    } else {
        File::create(path).await?
    };
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

/// Reads `length` bytes starting at `from` out of a local source file in
/// gate-checked chunks. Used by the upload path to load one part's slice.
pub async fn read_slice(
    path: &Path,
    from: u64,
    length: u64,
    gate: &PauseGate,
    chunk_size: usize,
) -> Result<Vec<u8>, std::io::Error> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(from)).await?;
    let want = length as usize;
    let mut data = Vec::with_capacity(want);
    let mut buf = vec![0u8; chunk_size.max(1)];
    while data.len() < want {
        gate.wait_open().await;
        let room = (want - data.len()).min(buf.len());
        let n = file.read(&mut buf[..room]).await?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }
    Ok(data)
}
