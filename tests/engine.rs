use async_trait::async_trait;
use modelguard::download::checksum::calculate_sha256;
use modelguard::error::HubError;
use modelguard::hub::FileFetch;
use modelguard::{
    DirHub, DownloadOutcome, EngineConfig, FileSpec, Hub, Manifest, ModelEngine, ModelEvent,
    VerifyPhase, VerifyStatus,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic content for a named file.
fn content_for(name: &str, size: usize) -> Vec<u8> {
    name.bytes().cycle().take(size).collect()
}

/// Lay out a model on the hub side: files plus a manifest with sizes and
/// content hashes.
fn seed_hub(hub_root: &Path, model_id: &str, files: &[(&str, usize)]) -> Manifest {
    let dir = hub_root.join(model_id);
    std::fs::create_dir_all(&dir).unwrap();

    let mut specs = Vec::new();
    for (name, size) in files {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content_for(name, *size)).unwrap();
        specs.push(FileSpec {
            name: name.to_string(),
            size: *size as u64,
            sha256: Some(calculate_sha256(&path).unwrap()),
        });
    }

    let manifest = Manifest {
        display_name: None,
        files: specs,
    };
    std::fs::write(
        dir.join("manifest.json"),
        serde_json::to_string_pretty(&manifest).unwrap(),
    )
    .unwrap();
    manifest
}

fn test_config(chain: Vec<PathBuf>) -> EngineConfig {
    EngineConfig {
        app_name: "modelguard-test".into(),
        storage_chain: Some(chain),
        retry_limit: Some(3),
        session_grace: Duration::from_millis(200),
        persist_settings: false,
    }
}

fn engine_with(hub_root: &Path, store: &Path) -> ModelEngine {
    let hub = Arc::new(DirHub::new(hub_root.to_path_buf()));
    ModelEngine::new(hub, test_config(vec![store.to_path_buf()]))
}

/// Collect events until the terminal `finished` event arrives.
async fn drain_until_finished(rx: &mut broadcast::Receiver<ModelEvent>) -> Vec<ModelEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event stream closed");
        let done = matches!(event, ModelEvent::Finished { .. });
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Collect whatever has been published so far, without blocking.
fn drain_now(rx: &mut broadcast::Receiver<ModelEvent>) -> Vec<ModelEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn count_started(events: &[ModelEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, ModelEvent::DownloadStarted { .. }))
        .count()
}

fn progress_fractions(events: &[ModelEvent]) -> Vec<f64> {
    events
        .iter()
        .filter_map(|event| match event {
            ModelEvent::Progress { fraction } => Some(*fraction),
            _ => None,
        })
        .collect()
}

fn position<F: Fn(&ModelEvent) -> bool>(events: &[ModelEvent], pred: F) -> usize {
    events
        .iter()
        .position(pred)
        .expect("expected event not found")
}

#[tokio::test]
async fn download_then_already_present() {
    init_logs();
    let hub_root = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    seed_hub(
        hub_root.path(),
        "demo/7b",
        &[("weights.bin", 100_000), ("config.json", 512)],
    );
    let engine = engine_with(hub_root.path(), store.path());
    let mut rx = engine.subscribe("demo/7b");

    let outcome = engine.ensure_downloaded("demo/7b").await;
    assert!(matches!(outcome, DownloadOutcome::Completed));

    let weights = std::fs::read(store.path().join("demo/7b/weights.bin")).unwrap();
    assert_eq!(weights, content_for("weights.bin", 100_000));
    assert!(engine.is_present("demo/7b").await);

    let again = engine.ensure_downloaded("demo/7b").await;
    assert!(matches!(again, DownloadOutcome::AlreadyPresent));

    let events = drain_now(&mut rx);
    assert_eq!(count_started(&events), 1);
    let fractions = progress_fractions(&events);
    assert!(!fractions.is_empty());
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*fractions.last().unwrap(), 1.0);

    let models = engine.list_models().await;
    assert_eq!(models.len(), 1);
    assert!(models[0].is_downloaded);
    assert_eq!(models[0].display_name, "7b");
}

#[tokio::test]
async fn verify_clean_bundle_downloads_nothing() {
    init_logs();
    let hub_root = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    seed_hub(
        hub_root.path(),
        "demo/7b",
        &[("a.bin", 100), ("b.bin", 200), ("c.bin", 50)],
    );
    let engine = engine_with(hub_root.path(), store.path());
    assert!(matches!(
        engine.ensure_downloaded("demo/7b").await,
        DownloadOutcome::Completed
    ));

    let mut rx = engine.subscribe("demo/7b");
    assert!(engine.verify("demo/7b"));
    let events = drain_until_finished(&mut rx).await;

    assert_eq!(count_started(&events), 0);
    assert!(events.iter().any(|event| matches!(
        event,
        ModelEvent::ScanResult {
            missing: 0,
            corrupt: 0,
            ..
        }
    )));
    assert!(events.iter().any(|event| matches!(
        event,
        ModelEvent::VerifyResult {
            status: VerifyStatus::Clean
        }
    )));
    assert!(matches!(
        events.last().unwrap(),
        ModelEvent::Finished { success: true, .. }
    ));

    // Phases arrive in protocol order.
    let start = position(&events, |e| matches!(e, ModelEvent::VerifyStart));
    let dir_status = position(&events, |e| matches!(e, ModelEvent::DirectoryStatus { .. }));
    let completeness = position(&events, |e| {
        matches!(e, ModelEvent::DirectoryCompleteness { .. })
    });
    let scan_start = position(&events, |e| matches!(e, ModelEvent::ScanStart { .. }));
    let scan_source = position(&events, |e| matches!(e, ModelEvent::ScanSource { .. }));
    let scan_target = position(&events, |e| matches!(e, ModelEvent::ScanTarget { .. }));
    let scan_result = position(&events, |e| matches!(e, ModelEvent::ScanResult { .. }));
    let result = position(&events, |e| matches!(e, ModelEvent::VerifyResult { .. }));
    let finished = position(&events, |e| matches!(e, ModelEvent::Finished { .. }));
    assert!(start < dir_status);
    assert!(dir_status < completeness);
    assert!(completeness < scan_start);
    assert!(scan_start < scan_source);
    assert!(scan_source < scan_target);
    assert!(scan_target < scan_result);
    assert!(scan_result < result);
    assert!(result < finished);

    // Scan progress covers every file with 1-based indices.
    let scanned: Vec<usize> = events
        .iter()
        .filter_map(|event| match event {
            ModelEvent::ScanFileProgress { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(scanned, vec![1, 2, 3]);
}

#[tokio::test]
async fn verify_repairs_missing_and_corrupt_files() {
    init_logs();
    let hub_root = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    seed_hub(
        hub_root.path(),
        "demo/7b",
        &[("a.bin", 100), ("b.bin", 200), ("c.bin", 50)],
    );

    // Target: a correct, b truncated, c absent.
    let target = store.path().join("demo/7b");
    std::fs::create_dir_all(&target).unwrap();
    std::fs::write(target.join("a.bin"), content_for("a.bin", 100)).unwrap();
    std::fs::write(target.join("b.bin"), content_for("b.bin", 150)).unwrap();

    let engine = engine_with(hub_root.path(), store.path());
    let mut rx = engine.subscribe("demo/7b");
    assert!(engine.verify("demo/7b"));
    let events = drain_until_finished(&mut rx).await;

    assert!(events.iter().any(|event| matches!(
        event,
        ModelEvent::ScanResult {
            missing: 1,
            corrupt: 1,
            ..
        }
    )));
    assert!(events
        .iter()
        .any(|event| matches!(event, ModelEvent::MissingFiles { count: 2 })));

    let repairs: Vec<(usize, String)> = events
        .iter()
        .filter_map(|event| match event {
            ModelEvent::RepairProgress { index, name, .. } => Some((*index, name.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        repairs,
        vec![(1, "b.bin".to_string()), (2, "c.bin".to_string())]
    );

    assert!(events
        .iter()
        .any(|event| matches!(event, ModelEvent::RepairComplete { success: true })));
    assert!(events
        .iter()
        .any(|event| matches!(event, ModelEvent::RedownloadComplete)));
    assert!(events.iter().any(|event| matches!(
        event,
        ModelEvent::VerifyResult {
            status: VerifyStatus::Repaired
        }
    )));
    assert!(matches!(
        events.last().unwrap(),
        ModelEvent::Finished { success: true, .. }
    ));

    // Only the broken files were repaired, and they now match the hub.
    assert_eq!(
        std::fs::read(target.join("b.bin")).unwrap(),
        content_for("b.bin", 200)
    );
    assert_eq!(
        std::fs::read(target.join("c.bin")).unwrap(),
        content_for("c.bin", 50)
    );
}

#[tokio::test]
async fn verify_twice_is_idempotent() {
    init_logs();
    let hub_root = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    seed_hub(hub_root.path(), "demo/7b", &[("a.bin", 100)]);
    let engine = engine_with(hub_root.path(), store.path());
    assert!(matches!(
        engine.ensure_downloaded("demo/7b").await,
        DownloadOutcome::Completed
    ));

    let mut rx = engine.subscribe("demo/7b");
    assert!(engine.verify("demo/7b"));
    let first = drain_until_finished(&mut rx).await;
    assert!(engine.verify("demo/7b"));
    let second = drain_until_finished(&mut rx).await;

    for events in [&first, &second] {
        assert_eq!(count_started(events), 0);
        assert!(matches!(
            events.last().unwrap(),
            ModelEvent::Finished { success: true, .. }
        ));
    }
}

#[tokio::test]
async fn unrepairable_bundle_is_surfaced_not_retried() {
    init_logs();
    let hub_root = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    seed_hub(hub_root.path(), "demo/7b", &[("a.bin", 100), ("c.bin", 50)]);
    // The hub loses one file after publishing its manifest.
    std::fs::remove_file(hub_root.path().join("demo/7b/c.bin")).unwrap();

    let engine = engine_with(hub_root.path(), store.path());
    let mut rx = engine.subscribe("demo/7b");
    assert!(engine.verify("demo/7b"));
    let events = drain_until_finished(&mut rx).await;

    assert!(events
        .iter()
        .any(|event| matches!(event, ModelEvent::RepairComplete { success: false })));
    assert!(events.iter().any(|event| matches!(
        event,
        ModelEvent::VerifyResult {
            status: VerifyStatus::Unrepaired
        }
    )));
    assert!(matches!(
        events.last().unwrap(),
        ModelEvent::Finished { success: false, .. }
    ));
}

/// A hub that takes a while per file, to make overlap deterministic.
struct SlowHub {
    inner: DirHub,
    delay: Duration,
}

#[async_trait]
impl Hub for SlowHub {
    async fn manifest(&self, model_id: &str) -> Result<Manifest, HubError> {
        self.inner.manifest(model_id).await
    }

    async fn fetch(
        &self,
        model_id: &str,
        file: &str,
        start: u64,
    ) -> Result<FileFetch, HubError> {
        tokio::time::sleep(self.delay).await;
        self.inner.fetch(model_id, file, start).await
    }

    async fn supports_resume(&self, model_id: &str, file: &str) -> bool {
        self.inner.supports_resume(model_id, file).await
    }
}

#[tokio::test]
async fn concurrent_requests_share_one_transfer() {
    init_logs();
    let hub_root = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    seed_hub(hub_root.path(), "demo/7b", &[("a.bin", 100), ("b.bin", 200)]);
    let hub = Arc::new(SlowHub {
        inner: DirHub::new(hub_root.path().to_path_buf()),
        delay: Duration::from_millis(150),
    });
    let engine = ModelEngine::new(hub, test_config(vec![store.path().to_path_buf()]));
    let mut rx = engine.subscribe("demo/7b");

    let (a, b) = tokio::join!(
        engine.ensure_downloaded("demo/7b"),
        engine.ensure_downloaded("demo/7b")
    );
    assert!(a.is_success());
    assert!(b.is_success());

    let events = drain_now(&mut rx);
    assert_eq!(count_started(&events), 1);
}

#[tokio::test]
async fn cancellation_is_observed_at_a_file_boundary() {
    init_logs();
    let hub_root = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    seed_hub(
        hub_root.path(),
        "demo/7b",
        &[("a.bin", 100), ("b.bin", 200), ("c.bin", 50)],
    );
    let hub = Arc::new(SlowHub {
        inner: DirHub::new(hub_root.path().to_path_buf()),
        delay: Duration::from_millis(300),
    });
    let engine = Arc::new(ModelEngine::new(
        hub,
        test_config(vec![store.path().to_path_buf()]),
    ));
    let mut rx = engine.subscribe("demo/7b");

    let task = tokio::spawn({
        let engine = engine.clone();
        async move { engine.ensure_downloaded("demo/7b").await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(engine.cancel_download("demo/7b"));

    let outcome = task.await.unwrap();
    assert!(matches!(outcome, DownloadOutcome::Cancelled));

    let events = drain_now(&mut rx);
    assert!(events
        .iter()
        .any(|event| matches!(event, ModelEvent::DownloadCancelled)));
    // Cancelled sessions never leave a partial file behind under its final
    // name.
    assert!(!store.path().join("demo/7b/c.bin").exists());
}

#[tokio::test]
async fn unwritable_preferred_root_falls_back_for_the_whole_run() {
    init_logs();
    let hub_root = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    seed_hub(hub_root.path(), "demo/7b", &[("a.bin", 100)]);

    // The preferred candidate's parent is a regular file, so its write
    // probe can never pass.
    let blocker = store.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();
    let preferred = blocker.join("models");
    let fallback = store.path().join("support");

    let hub = Arc::new(DirHub::new(hub_root.path().to_path_buf()));
    let engine = ModelEngine::new(hub, test_config(vec![preferred, fallback.clone()]));

    assert!(matches!(
        engine.ensure_downloaded("demo/7b").await,
        DownloadOutcome::Completed
    ));
    assert!(fallback.join("demo/7b/a.bin").exists());

    // Later work stays on the fallback root.
    assert!(matches!(
        engine.ensure_downloaded("demo/7b").await,
        DownloadOutcome::AlreadyPresent
    ));
    assert!(engine.is_present("demo/7b").await);
}

#[tokio::test]
async fn late_observers_can_read_recent_history_and_phase() {
    init_logs();
    let hub_root = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    seed_hub(hub_root.path(), "demo/7b", &[("a.bin", 100)]);
    let hub = Arc::new(DirHub::new(hub_root.path().to_path_buf()));
    let mut config = test_config(vec![store.path().to_path_buf()]);
    config.session_grace = Duration::from_secs(5);
    let engine = ModelEngine::new(hub, config);
    assert!(matches!(
        engine.ensure_downloaded("demo/7b").await,
        DownloadOutcome::Completed
    ));

    let mut rx = engine.subscribe("demo/7b");
    assert!(engine.verify("demo/7b"));
    drain_until_finished(&mut rx).await;

    // The finished session stays queryable for a grace period.
    assert_eq!(engine.current_phase("demo/7b"), Some(VerifyPhase::Finished));
    assert_eq!(engine.current_phase("other/model"), None);

    let log = engine.recent_log("demo/7b");
    assert!(!log.is_empty());
    assert!(log.iter().any(|line| line.contains("finished")));
    assert!(engine.recent_log("other/model").is_empty());
}
