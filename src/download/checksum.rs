use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Calculate SHA-256 checksum of a file
pub fn calculate_sha256(file_path: &Path) -> Result<String> {
    let file = File::open(file_path)
        .with_context(|| format!("open for checksum: {}", file_path.display()))?;

    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer).context("read for checksum")?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    let result = hasher.finalize();
    Ok(format!("{:x}", result))
}

/// Verify SHA-256 checksum of a file
pub fn verify_sha256(file_path: &Path, expected_hash: &str) -> Result<()> {
    if expected_hash.is_empty() {
        log::warn!("SHA-256 checksum not configured for this file, skipping verification");
        return Ok(());
    }

    let calculated_hash = calculate_sha256(file_path)?;

    if !calculated_hash.eq_ignore_ascii_case(expected_hash) {
        return Err(anyhow!(
            "SHA-256 checksum verification failed for {}: expected {}, got {}",
            file_path.display(),
            expected_hash,
            calculated_hash
        ));
    }

    log::debug!("SHA-256 checksum verified: {}", calculated_hash);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_known_digest() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("hello.txt");
        std::fs::write(&path, b"hello world").unwrap();

        let digest = calculate_sha256(&path).unwrap();
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert!(verify_sha256(&path, &digest.to_uppercase()).is_ok());
    }

    #[test]
    fn rejects_mismatched_digest() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("hello.txt");
        std::fs::write(&path, b"hello world").unwrap();

        assert!(verify_sha256(&path, &"0".repeat(64)).is_err());
        // An unconfigured checksum is skipped, not failed.
        assert!(verify_sha256(&path, "").is_ok());
    }
}
