//! End-to-end engine tests against in-memory transport doubles.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use tempfile::TempDir;

use partwise::prelude::*;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Serves ranges of an in-memory byte array, recording every request.
/// Units listed in `fail_from` fail with a transport error. `stagger` delays
/// earlier ranges longer than later ones so completion order is scrambled.
struct MemoryFetcher {
    data: Vec<u8>,
    requests: Mutex<Vec<(u64, u64)>>,
    fail_from: HashSet<u64>,
    stagger: bool,
    available: Option<u64>,
}

impl MemoryFetcher {
    fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            requests: Mutex::new(Vec::new()),
            fail_from: HashSet::new(),
            stagger: false,
            available: None,
        }
    }

    fn failing_at(mut self, from: u64) -> Self {
        self.fail_from.insert(from);
        self
    }

    /// Streams end at `len` regardless of the requested range, like a remote
    /// that closes the connection early.
    fn truncated_at(mut self, len: u64) -> Self {
        self.available = Some(len);
        self
    }

    fn staggered(mut self) -> Self {
        self.stagger = true;
        self
    }

    fn requests(&self) -> Vec<(u64, u64)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RangeFetcher for MemoryFetcher {
    async fn fetch(&self, from: u64, to: Option<u64>) -> Result<ByteStream, BoxError> {
        let to = to.unwrap_or(self.data.len() as u64);
        self.requests.lock().unwrap().push((from, to));
        if self.fail_from.contains(&from) {
            return Err(format!("simulated outage at byte {from}").into());
        }
        if self.stagger {
            // Later ranges finish first.
            let delay = 50u64.saturating_sub(from / 100);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let end = self.available.map_or(to, |len| to.min(len)).max(from);
        let slice = self.data[from as usize..end as usize].to_vec();
        let chunks: Vec<Result<Bytes, BoxError>> = slice
            .chunks(1000)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

/// In-memory multipart store recording uploads and the completion call.
#[derive(Default)]
struct MemoryStore {
    listed: Vec<RemotePart>,
    fail_parts: HashSet<u32>,
    uploaded: Mutex<Vec<u32>>,
    parts: Mutex<HashMap<u32, Vec<u8>>>,
    completed_with: Mutex<Option<Vec<RemotePart>>>,
    aborted: Mutex<Vec<String>>,
}

impl MemoryStore {
    fn listing(mut self, parts: Vec<RemotePart>) -> Self {
        self.listed = parts;
        self
    }

    fn failing_part(mut self, part: u32) -> Self {
        self.fail_parts.insert(part);
        self
    }

    fn uploaded(&self) -> Vec<u32> {
        self.uploaded.lock().unwrap().clone()
    }

    fn completed_with(&self) -> Option<Vec<RemotePart>> {
        self.completed_with.lock().unwrap().clone()
    }
}

#[async_trait]
impl MultipartStore for MemoryStore {
    async fn initiate(&self, _bucket: &str, _key: &str) -> Result<String, BoxError> {
        Ok("upload-1".into())
    }

    async fn list_parts(&self, _upload_id: &str) -> Result<Vec<RemotePart>, BoxError> {
        Ok(self.listed.clone())
    }

    async fn upload_part(
        &self,
        _upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<RemotePart, BoxError> {
        if self.fail_parts.contains(&part_number) {
            return Err(format!("simulated failure for part {part_number}").into());
        }
        // Scramble completion order: lower part numbers land later.
        tokio::time::sleep(Duration::from_millis(30 / u64::from(part_number))).await;
        self.uploaded.lock().unwrap().push(part_number);
        self.parts.lock().unwrap().insert(part_number, data);
        Ok(RemotePart::new(part_number, format!("etag-{part_number}")))
    }

    async fn complete(
        &self,
        _upload_id: &str,
        parts: Vec<RemotePart>,
    ) -> Result<String, BoxError> {
        *self.completed_with.lock().unwrap() = Some(parts);
        Ok("store://bucket/key".into())
    }

    async fn abort(&self, upload_id: &str) -> Result<(), BoxError> {
        self.aborted.lock().unwrap().push(upload_id.to_string());
        Ok(())
    }
}

fn source_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn descriptor(root: &Path, file_id: &str, total_len: u64) -> FileDescriptor {
    FileDescriptor {
        file_id: file_id.into(),
        total_len,
        version_tag: "v1".into(),
        temp_root: root.join("tmp"),
    }
}

fn config(unit_size: u64, worker_count: usize) -> TransferConfig {
    TransferConfig {
        unit_size,
        worker_count,
        ..TransferConfig::default()
    }
}

#[tokio::test]
async fn download_reassembles_byte_identical_target() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let data = source_bytes(500_000);
    let fetcher = Arc::new(MemoryFetcher::new(data.clone()));
    let downloader = Downloader::new(config(204_800, 4), fetcher.clone())?;

    let desc = descriptor(dir.path(), "big.bin", 500_000);
    let target = dir.path().join("big.bin");
    let path = downloader.run(&desc, &target).await?;

    assert_eq!(tokio::fs::read(&path).await?, data);
    // Three units were requested: two full, one remainder.
    assert_eq!(fetcher.requests().len(), 3);
    // Temp files are gone after a successful finalize.
    assert!(!desc.temp_root.join("big.bin").join("v1").exists());
    Ok(())
}

#[tokio::test]
async fn download_progress_reaches_one_hundred() -> Result<()> {
    let dir = TempDir::new()?;
    let data = source_bytes(10_000);
    let downloader = Downloader::new(config(4096, 2), Arc::new(MemoryFetcher::new(data)))?;
    let progress = downloader.progress();

    let desc = descriptor(dir.path(), "p.bin", 10_000);
    downloader.run(&desc, &dir.path().join("p.out")).await?;

    let last = progress.borrow().clone();
    assert_eq!(last.percent, 100);
    assert_eq!(last.transferred, 10_000);
    Ok(())
}

#[tokio::test]
async fn partial_unit_fetches_only_missing_tail() -> Result<()> {
    let dir = TempDir::new()?;
    let data = source_bytes(1000);
    let desc = descriptor(dir.path(), "partial.bin", 1000);

    // An earlier attempt left 400 bytes of the only unit on disk.
    let unit_dir = desc.temp_root.join("partial.bin").join("v1");
    tokio::fs::create_dir_all(&unit_dir).await?;
    tokio::fs::write(unit_dir.join("partial.bin_0.tmp"), &data[..400]).await?;

    let fetcher = Arc::new(MemoryFetcher::new(data.clone()));
    let downloader = Downloader::new(config(1000, 1), fetcher.clone())?;
    let target = dir.path().join("partial.out");
    downloader.run(&desc, &target).await?;

    assert_eq!(fetcher.requests(), vec![(400, 1000)]);
    assert_eq!(tokio::fs::read(&target).await?, data);
    Ok(())
}

#[tokio::test]
async fn satisfied_units_are_not_refetched() -> Result<()> {
    let dir = TempDir::new()?;
    let data = source_bytes(3000);
    let desc = descriptor(dir.path(), "resume.bin", 3000);

    let unit_dir = desc.temp_root.join("resume.bin").join("v1");
    tokio::fs::create_dir_all(&unit_dir).await?;
    tokio::fs::write(unit_dir.join("resume.bin_0.tmp"), &data[..1000]).await?;
    tokio::fs::write(unit_dir.join("resume.bin_2.tmp"), &data[2000..]).await?;

    let fetcher = Arc::new(MemoryFetcher::new(data.clone()));
    let downloader = Downloader::new(config(1000, 2), fetcher.clone())?;
    let target = dir.path().join("resume.out");
    downloader.run(&desc, &target).await?;

    assert_eq!(fetcher.requests(), vec![(1000, 2000)]);
    assert_eq!(tokio::fs::read(&target).await?, data);
    Ok(())
}

#[tokio::test]
async fn all_units_satisfied_finalizes_without_fetching() -> Result<()> {
    let dir = TempDir::new()?;
    let data = source_bytes(2000);
    let desc = descriptor(dir.path(), "done.bin", 2000);

    let unit_dir = desc.temp_root.join("done.bin").join("v1");
    tokio::fs::create_dir_all(&unit_dir).await?;
    tokio::fs::write(unit_dir.join("done.bin_0.tmp"), &data[..1000]).await?;
    tokio::fs::write(unit_dir.join("done.bin_1.tmp"), &data[1000..]).await?;

    let fetcher = Arc::new(MemoryFetcher::new(data.clone()));
    let downloader = Downloader::new(config(1000, 2), fetcher.clone())?;
    let target = dir.path().join("done.out");
    downloader.run(&desc, &target).await?;

    assert!(fetcher.requests().is_empty());
    assert_eq!(tokio::fs::read(&target).await?, data);
    Ok(())
}

#[tokio::test]
async fn completion_order_never_changes_output_bytes() -> Result<()> {
    let dir = TempDir::new()?;
    let data = source_bytes(5000);
    let fetcher = Arc::new(MemoryFetcher::new(data.clone()).staggered());
    // All five units in one batch so they race.
    let downloader = Downloader::new(config(1000, 5), fetcher)?;

    let desc = descriptor(dir.path(), "race.bin", 5000);
    let target = dir.path().join("race.out");
    downloader.run(&desc, &target).await?;

    assert_eq!(tokio::fs::read(&target).await?, data);
    Ok(())
}

#[tokio::test]
async fn failed_unit_fails_transfer_and_keeps_temp_state() -> Result<()> {
    let dir = TempDir::new()?;
    let data = source_bytes(3000);
    let desc = descriptor(dir.path(), "flaky.bin", 3000);
    let target = dir.path().join("flaky.out");

    // Unit 1 (bytes 1000..2000) fails.
    let fetcher = Arc::new(MemoryFetcher::new(data.clone()).failing_at(1000));
    let downloader = Downloader::new(config(1000, 3), fetcher)?;
    let err = downloader.run(&desc, &target).await.unwrap_err();
    assert!(matches!(err, TransferError::Transport { unit: 1, .. }));
    assert!(!target.exists());

    // Successful units survived; the retry fetches only the failed range.
    let fetcher = Arc::new(MemoryFetcher::new(data.clone()));
    let downloader = Downloader::new(config(1000, 3), fetcher.clone())?;
    downloader.run(&desc, &target).await?;
    assert_eq!(fetcher.requests(), vec![(1000, 2000)]);
    assert_eq!(tokio::fs::read(&target).await?, data);
    Ok(())
}

#[tokio::test]
async fn short_stream_fails_instead_of_truncating_target() -> Result<()> {
    let dir = TempDir::new()?;
    let data = source_bytes(1000);
    let desc = descriptor(dir.path(), "short.bin", 1000);
    let target = dir.path().join("short.out");

    // Remote declares 1000 bytes but the stream dies at 600.
    let fetcher = Arc::new(MemoryFetcher::new(data.clone()).truncated_at(600));
    let downloader = Downloader::new(config(1000, 1), fetcher)?;
    let err = downloader.run(&desc, &target).await.unwrap_err();
    assert!(matches!(err, TransferError::Transport { unit: 0, .. }));
    assert!(!target.exists());

    // The bytes that did arrive are kept, so the retry fetches only the tail.
    let tmp = desc
        .temp_root
        .join("short.bin")
        .join("v1")
        .join("short.bin_0.tmp");
    assert_eq!(tokio::fs::metadata(&tmp).await?.len(), 600);

    let fetcher = Arc::new(MemoryFetcher::new(data.clone()));
    let downloader = Downloader::new(config(1000, 1), fetcher.clone())?;
    downloader.run(&desc, &target).await?;
    assert_eq!(fetcher.requests(), vec![(600, 1000)]);
    assert_eq!(tokio::fs::read(&target).await?, data);
    Ok(())
}

#[tokio::test]
async fn overlong_temp_file_never_inflates_target() -> Result<()> {
    let dir = TempDir::new()?;
    let data = source_bytes(1000);
    let desc = descriptor(dir.path(), "stale.bin", 1000);
    let target = dir.path().join("stale.out");

    // An attempt run with a larger unit size left the whole file in unit 0's
    // slot; this run plans 500-byte units, so the leftover is twice as long
    // as its unit.
    let unit_dir = desc.temp_root.join("stale.bin").join("v1");
    tokio::fs::create_dir_all(&unit_dir).await?;
    tokio::fs::write(unit_dir.join("stale.bin_0.tmp"), &data).await?;

    let fetcher = Arc::new(MemoryFetcher::new(data.clone()));
    let downloader = Downloader::new(config(500, 2), fetcher.clone())?;
    downloader.run(&desc, &target).await?;

    assert_eq!(fetcher.requests(), vec![(500, 1000)]);
    assert_eq!(tokio::fs::read(&target).await?, data);
    Ok(())
}

#[tokio::test]
async fn suspended_download_stalls_until_resumed() -> Result<()> {
    let dir = TempDir::new()?;
    let data = source_bytes(2000);
    let downloader = Arc::new(Downloader::new(
        config(1000, 2),
        Arc::new(MemoryFetcher::new(data.clone())),
    )?);
    downloader.suspend();

    let desc = descriptor(dir.path(), "paused.bin", 2000);
    let target = dir.path().join("paused.out");
    let task = {
        let downloader = downloader.clone();
        tokio::spawn(async move { downloader.run(&desc, &target).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());

    downloader.resume();
    let path = tokio::time::timeout(Duration::from_secs(5), task)
        .await?
        .unwrap()?;
    assert_eq!(tokio::fs::read(&path).await?, data);
    Ok(())
}

#[tokio::test]
async fn finalized_target_passes_integrity_check() -> Result<()> {
    use sha2::{Digest, Sha256};

    let dir = TempDir::new()?;
    let data = source_bytes(3000);
    let expected = format!("{:x}", Sha256::digest(&data));

    let downloader = Downloader::new(config(1000, 2), Arc::new(MemoryFetcher::new(data)))?;
    let desc = descriptor(dir.path(), "sum.bin", 3000);
    let target = dir.path().join("sum.out");
    downloader.run(&desc, &target).await?;

    assert!(downloader.verify_sha256(&target, &expected).await?);
    assert!(!downloader.verify_sha256(&target, "deadbeef").await?);
    Ok(())
}

#[tokio::test]
async fn stopped_download_refuses_dispatch() -> Result<()> {
    let dir = TempDir::new()?;
    let data = source_bytes(2000);
    let downloader = Downloader::new(config(1000, 1), Arc::new(MemoryFetcher::new(data)))?;
    downloader.stop();

    let desc = descriptor(dir.path(), "stopped.bin", 2000);
    let err = downloader
        .run(&desc, &dir.path().join("stopped.out"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Stopped));
    Ok(())
}

async fn write_source(dir: &TempDir, name: &str, data: &[u8]) -> Result<PathBuf> {
    let path = dir.path().join(name);
    tokio::fs::write(&path, data).await?;
    Ok(path)
}

#[tokio::test]
async fn upload_completes_with_ascending_parts() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let data = source_bytes(5000);
    let source = write_source(&dir, "src.bin", &data).await?;

    let store = Arc::new(MemoryStore::default());
    let uploader = Uploader::new(config(1000, 5), store.clone())?;
    let done = uploader.run(&source, "bucket", "key", None).await?;

    assert_eq!(done.location, "store://bucket/key");
    let completed = store.completed_with().expect("complete was called");
    let numbers: Vec<u32> = completed.iter().map(|p| p.part_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    // Upload bodies carried the right slices.
    let parts = store.parts.lock().unwrap();
    assert_eq!(parts[&1], &data[..1000]);
    assert_eq!(parts[&5], &data[4000..]);
    Ok(())
}

#[tokio::test]
async fn upload_resume_skips_listed_parts() -> Result<()> {
    let dir = TempDir::new()?;
    let data = source_bytes(5000);
    let source = write_source(&dir, "src.bin", &data).await?;

    let store = Arc::new(MemoryStore::default().listing(vec![
        RemotePart::new(2, "old-2"),
        RemotePart::new(4, "old-4"),
    ]));
    let uploader = Uploader::new(config(1000, 5), store.clone())?;
    let done = uploader
        .run(&source, "bucket", "key", Some("upload-1"))
        .await?;
    assert_eq!(done.upload_id, "upload-1");

    let mut uploaded = store.uploaded();
    uploaded.sort_unstable();
    assert_eq!(uploaded, vec![1, 3, 5]);

    let completed = store.completed_with().expect("complete was called");
    let numbers: Vec<u32> = completed.iter().map(|p| p.part_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    // Old acknowledgements are carried into the completion call.
    assert_eq!(completed[1].etag, "old-2");
    assert_eq!(completed[3].etag, "old-4");
    Ok(())
}

#[tokio::test]
async fn upload_part_failure_skips_completion() -> Result<()> {
    let dir = TempDir::new()?;
    let data = source_bytes(3000);
    let source = write_source(&dir, "src.bin", &data).await?;

    let store = Arc::new(MemoryStore::default().failing_part(2));
    let uploader = Uploader::new(config(1000, 3), store.clone())?;
    let err = uploader
        .run(&source, "bucket", "key", None)
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Transport { unit: 1, .. }));
    assert!(store.completed_with().is_none());

    // The resumed attempt only moves the failed part.
    let retry_store = Arc::new(MemoryStore::default().listing(vec![
        RemotePart::new(1, "etag-1"),
        RemotePart::new(3, "etag-3"),
    ]));
    let uploader = Uploader::new(config(1000, 3), retry_store.clone())?;
    uploader
        .run(&source, "bucket", "key", Some("upload-1"))
        .await?;
    assert_eq!(retry_store.uploaded(), vec![2]);
    let numbers: Vec<u32> = retry_store
        .completed_with()
        .unwrap()
        .iter()
        .map(|p| p.part_number)
        .collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    Ok(())
}

#[tokio::test]
async fn upload_duplicate_listing_is_protocol_error() -> Result<()> {
    let dir = TempDir::new()?;
    let data = source_bytes(2000);
    let source = write_source(&dir, "src.bin", &data).await?;

    let store = Arc::new(MemoryStore::default().listing(vec![
        RemotePart::new(1, "a"),
        RemotePart::new(1, "a-again"),
    ]));
    let uploader = Uploader::new(config(1000, 2), store)?;
    let err = uploader
        .run(&source, "bucket", "key", Some("upload-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Protocol(_)));
    Ok(())
}

#[tokio::test]
async fn upload_abort_touches_only_current_session() -> Result<()> {
    let store = Arc::new(MemoryStore::default());
    let uploader = Uploader::new(config(1000, 1), store.clone())?;
    uploader.abort("upload-7").await?;
    assert_eq!(store.aborted.lock().unwrap().clone(), vec!["upload-7"]);
    Ok(())
}
