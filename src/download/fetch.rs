use crate::error::EngineError;
use crate::hub::Hub;
use crate::types::FileSpec;
use futures_util::StreamExt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

fn storage_err(context: &str, err: std::io::Error) -> EngineError {
    EngineError::Storage(format!("{}: {}", context, err))
}

/// Staging copy a file is streamed into before the atomic rename into place.
/// Completed files only ever appear under their final name fully written.
pub(crate) fn staging_path(dest_dir: &Path, name: &str) -> PathBuf {
    dest_dir.join(format!("{}.part", name))
}

/// Transfer one hub file into `dest_dir`, resuming from previously staged
/// bytes when the hub supports ranges. One attempt: chunk errors are
/// returned to the caller, which owns the retry/backoff policy. `on_bytes`
/// receives the cumulative durably-staged byte count for this file.
pub(crate) async fn fetch_file(
    hub: &dyn Hub,
    model_id: &str,
    spec: &FileSpec,
    dest_dir: &Path,
    resume: bool,
    mut on_bytes: impl FnMut(u64),
) -> Result<(), EngineError> {
    let dest = dest_dir.join(&spec.name);
    let staging = staging_path(dest_dir, &spec.name);
    if let Some(parent) = staging.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| storage_err("create model directory", e))?;
    }

    // Bytes already durably staged by a previous attempt.
    let mut staged: u64 = if resume {
        tokio::fs::metadata(&staging)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0)
    } else {
        let _ = tokio::fs::remove_file(&staging).await;
        0
    };
    if staged > 0 {
        log::info!(
            "Found partial transfer of '{}': {} bytes, attempting resume",
            spec.name,
            staged
        );
    }

    let fetch = hub
        .fetch(model_id, &spec.name, staged)
        .await
        .map_err(EngineError::from)?;

    if let Some(total) = fetch.total {
        if total != spec.size {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(EngineError::Manifest(format!(
                "hub reports {} bytes for '{}', manifest expects {}",
                total, spec.name, spec.size
            )));
        }
    }

    if fetch.offset != staged {
        // The hub restarted the stream; the stale staging bytes are useless.
        let _ = tokio::fs::remove_file(&staging).await;
        staged = 0;
        if fetch.offset != 0 {
            return Err(EngineError::Network(format!(
                "hub resumed '{}' at unexpected offset {}",
                spec.name, fetch.offset
            )));
        }
    }

    let mut file = if staged > 0 {
        let mut f = tokio::fs::OpenOptions::new()
            .write(true)
            .append(true)
            .open(&staging)
            .await
            .map_err(|e| storage_err("open staging file for resume", e))?;
        f.seek(SeekFrom::End(0))
            .await
            .map_err(|e| storage_err("seek staging file", e))?;
        f
    } else {
        tokio::fs::File::create(&staging)
            .await
            .map_err(|e| storage_err("create staging file", e))?
    };
    on_bytes(staged);

    let mut stream = fetch.stream;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => {
                file.write_all(&chunk)
                    .await
                    .map_err(|e| storage_err("write chunk", e))?;
                staged += chunk.len() as u64;
                on_bytes(staged);
            }
            Err(e) => {
                // Keep what we have durable; the next attempt resumes here.
                file.flush()
                    .await
                    .map_err(|e| storage_err("flush staging file", e))?;
                file.sync_all()
                    .await
                    .map_err(|e| storage_err("sync staging file", e))?;
                return Err(EngineError::from(e));
            }
        }
    }

    file.flush()
        .await
        .map_err(|e| storage_err("flush staging file", e))?;
    file.sync_all()
        .await
        .map_err(|e| storage_err("sync staging file", e))?;
    drop(file);

    if staged > spec.size {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(EngineError::Manifest(format!(
            "'{}' came back with {} bytes, manifest expects {}",
            spec.name, staged, spec.size
        )));
    }
    if staged < spec.size {
        // Staging stays in place so a retry can resume the tail.
        return Err(EngineError::Network(format!(
            "truncated transfer of '{}': {} of {} bytes",
            spec.name, staged, spec.size
        )));
    }

    if let Some(expected) = &spec.sha256 {
        if let Err(e) = super::checksum::verify_sha256(&staging, expected) {
            // Remove the corrupted bytes so the retry starts clean.
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(EngineError::Network(e.to_string()));
        }
    }

    tokio::fs::rename(&staging, &dest)
        .await
        .map_err(|e| storage_err("move file into place", e))?;

    log::info!("Fetched '{}' ({} bytes)", spec.name, staged);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::DirHub;
    use std::fs;

    fn seed(root: &Path, size: usize) {
        let dir = root.join("demo/7b");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("weights.bin"), vec![0x5A; size]).unwrap();
    }

    #[tokio::test]
    async fn fetches_and_renames_into_place() {
        let hub_dir = tempfile::TempDir::new().unwrap();
        let store = tempfile::TempDir::new().unwrap();
        seed(hub_dir.path(), 100);
        let hub = DirHub::new(hub_dir.path());

        let spec = FileSpec {
            name: "weights.bin".into(),
            size: 100,
            sha256: None,
        };
        let mut seen = Vec::new();
        fetch_file(&hub, "demo/7b", &spec, store.path(), true, |staged| {
            seen.push(staged)
        })
        .await
        .unwrap();

        let written = fs::read(store.path().join("weights.bin")).unwrap();
        assert_eq!(written, vec![0x5A; 100]);
        assert!(!staging_path(store.path(), "weights.bin").exists());
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), 100);
    }

    #[tokio::test]
    async fn size_disagreement_is_a_manifest_error() {
        let hub_dir = tempfile::TempDir::new().unwrap();
        let store = tempfile::TempDir::new().unwrap();
        seed(hub_dir.path(), 100);
        let hub = DirHub::new(hub_dir.path());

        let spec = FileSpec {
            name: "weights.bin".into(),
            size: 150,
            sha256: None,
        };
        let err = fetch_file(&hub, "demo/7b", &spec, store.path(), true, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Manifest(_)));
        assert!(!store.path().join("weights.bin").exists());
    }

    #[tokio::test]
    async fn hash_mismatch_clears_staging_for_retry() {
        let hub_dir = tempfile::TempDir::new().unwrap();
        let store = tempfile::TempDir::new().unwrap();
        seed(hub_dir.path(), 100);
        let hub = DirHub::new(hub_dir.path());

        let spec = FileSpec {
            name: "weights.bin".into(),
            size: 100,
            sha256: Some("0".repeat(64)),
        };
        let err = fetch_file(&hub, "demo/7b", &spec, store.path(), true, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Network(_)));
        assert!(!staging_path(store.path(), "weights.bin").exists());
        assert!(!store.path().join("weights.bin").exists());
    }
}
