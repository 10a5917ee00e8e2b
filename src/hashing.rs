use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Lower-case hex SHA-256 of the file at `filepath`.
pub async fn calculate_hash(filepath: &Path) -> Result<String> {
    let mut file = File::open(filepath)
        .await
        .with_context(|| format!("failed to open {} for hashing", filepath.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compares the file's digest with `expected`, ignoring case.
pub async fn verify_hash(filepath: &Path, expected: &str) -> Result<bool> {
    let actual = calculate_hash(filepath).await?;
    Ok(actual.eq_ignore_ascii_case(expected.trim()))
}
