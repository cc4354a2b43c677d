//! SHA-256 digests for verifying a finalized transfer target.

use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Computes the hex-encoded SHA-256 digest of a file.
pub async fn sha256_file(path: &Path) -> Result<String, IntegrityError> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8 * 1024];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Digests `path` and compares against an expected hex digest,
/// case-insensitively.
pub async fn verify_file(path: &Path, expected: &str) -> Result<bool, IntegrityError> {
    let digest = sha256_file(path).await?;
    Ok(digest.eq_ignore_ascii_case(expected))
}
