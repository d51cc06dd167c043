use crate::types::{FileCheck, VerifyStatus};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

/// Capacity of each per-model broadcast channel.
const CHANNEL_CAPACITY: usize = 256;
/// Rendered log lines retained per model id for late subscribers.
const LOG_CAPACITY: usize = 200;

/// One lifecycle event for a model id. A closed set: one variant per
/// verification phase plus the download lifecycle, each carrying only the
/// fields relevant to that phase.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ModelEvent {
    DownloadStarted { files: usize, total_bytes: u64 },
    Progress { fraction: f64 },
    StorageFallback { root: String },
    DownloadComplete,
    DownloadFailed { reason: String },
    DownloadCancelled,

    VerifyStart,
    DirectoryStatus { source_present: bool, target_present: bool },
    DirectoryCompleteness { complete: bool, expected: usize, found: usize },
    ScanStart { source: String, target: String },
    ScanSource { files: usize },
    ScanTarget { files: usize },
    ScanFileProgress { index: usize, total: usize, name: String, check: FileCheck },
    ScanResult { missing: usize, corrupt: usize, source_bytes: u64, target_bytes: u64 },
    MissingFiles { count: usize },
    RepairProgress { index: usize, total: usize, name: String },
    RepairComplete { success: bool },
    RedownloadComplete,
    VerifyResult { status: VerifyStatus },
    Finished { success: bool, elapsed_ms: u64 },
}

#[derive(Default)]
struct Channel {
    tx: Option<broadcast::Sender<ModelEvent>>,
    log: VecDeque<String>,
}

/// Per-model event bus. Delivery order is the publish order for a given
/// model id; publishing never blocks the producer (slow subscribers drop
/// their oldest entries instead of stalling downloads or verification).
pub struct EventBus {
    channels: Mutex<HashMap<String, Channel>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, model_id: &str) -> broadcast::Receiver<ModelEvent> {
        let mut channels = self.lock();
        let channel = channels.entry(model_id.to_string()).or_default();
        channel
            .tx
            .get_or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn publish(&self, model_id: &str, event: ModelEvent) {
        let line = render_line(model_id, &event);
        log::debug!("{}", line);

        let mut channels = self.lock();
        let channel = channels.entry(model_id.to_string()).or_default();
        if channel.log.len() == LOG_CAPACITY {
            channel.log.pop_front();
        }
        channel.log.push_back(line);

        if let Some(tx) = &channel.tx {
            // No receivers is fine; history still lands in the ring buffer.
            let _ = tx.send(event);
        }
    }

    /// Recent rendered log lines for a model id, oldest first.
    pub fn recent_log(&self, model_id: &str) -> Vec<String> {
        let channels = self.lock();
        channels
            .get(model_id)
            .map(|channel| channel.log.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
        match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn render_line(model_id: &str, event: &ModelEvent) -> String {
    let message = match event {
        ModelEvent::DownloadStarted { files, total_bytes } => format!(
            "download started ({} files, {:.2} MB)",
            files,
            *total_bytes as f64 / 1_048_576.0
        ),
        ModelEvent::Progress { fraction } => format!("progress {:.1}%", fraction * 100.0),
        ModelEvent::StorageFallback { root } => {
            format!("storage switched to fallback: {}", root)
        }
        ModelEvent::DownloadComplete => "download complete".to_string(),
        ModelEvent::DownloadFailed { reason } => format!("download failed: {}", reason),
        ModelEvent::DownloadCancelled => "download cancelled".to_string(),
        ModelEvent::VerifyStart => "verification started".to_string(),
        ModelEvent::DirectoryStatus {
            source_present,
            target_present,
        } => format!(
            "directory status: source {}, target {}",
            if *source_present { "present" } else { "missing" },
            if *target_present { "present" } else { "missing" }
        ),
        ModelEvent::DirectoryCompleteness {
            complete,
            expected,
            found,
        } => format!(
            "directory completeness: {} ({} expected, {} found)",
            if *complete { "complete" } else { "incomplete" },
            expected,
            found
        ),
        ModelEvent::ScanStart { source, target } => {
            format!("scan started: {} -> {}", source, target)
        }
        ModelEvent::ScanSource { files } => format!("source lists {} files", files),
        ModelEvent::ScanTarget { files } => format!("target holds {} files", files),
        ModelEvent::ScanFileProgress {
            index,
            total,
            name,
            check,
        } => format!("scanned {}/{}: {} ({:?})", index, total, name, check),
        ModelEvent::ScanResult {
            missing,
            corrupt,
            source_bytes,
            target_bytes,
        } => format!(
            "scan result: {} missing, {} corrupt ({} source bytes, {} target bytes)",
            missing, corrupt, source_bytes, target_bytes
        ),
        ModelEvent::MissingFiles { count } => format!("{} files need repair", count),
        ModelEvent::RepairProgress { index, total, name } => {
            format!("repaired {}/{}: {}", index, total, name)
        }
        ModelEvent::RepairComplete { success } => format!(
            "repair pass {}",
            if *success { "succeeded" } else { "failed" }
        ),
        ModelEvent::RedownloadComplete => "re-download complete, rescanning".to_string(),
        ModelEvent::VerifyResult { status } => format!("result: {}", status.as_str()),
        ModelEvent::Finished {
            success,
            elapsed_ms,
        } => format!(
            "finished in {} ms (success: {})",
            elapsed_ms, success
        ),
    };

    format!(
        "[{}] {}: {}",
        chrono::Local::now().format("%H:%M:%S"),
        model_id,
        message
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("demo/7b");

        bus.publish("demo/7b", ModelEvent::VerifyStart);
        bus.publish("demo/7b", ModelEvent::ScanSource { files: 3 });
        bus.publish("demo/7b", ModelEvent::Finished { success: true, elapsed_ms: 1 });

        assert!(matches!(rx.recv().await.unwrap(), ModelEvent::VerifyStart));
        assert!(matches!(
            rx.recv().await.unwrap(),
            ModelEvent::ScanSource { files: 3 }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            ModelEvent::Finished { success: true, .. }
        ));
    }

    #[test]
    fn publish_without_subscribers_keeps_history() {
        let bus = EventBus::new();
        bus.publish("demo/7b", ModelEvent::DownloadComplete);

        let log = bus.recent_log("demo/7b");
        assert_eq!(log.len(), 1);
        assert!(log[0].contains("download complete"));
        assert!(bus.recent_log("other/model").is_empty());
    }

    #[test]
    fn log_ring_buffer_is_bounded() {
        let bus = EventBus::new();
        for fraction in 0..300 {
            bus.publish(
                "demo/7b",
                ModelEvent::Progress {
                    fraction: fraction as f64 / 300.0,
                },
            );
        }

        let log = bus.recent_log("demo/7b");
        assert_eq!(log.len(), 200);
        // Oldest entries were dropped, newest retained.
        assert!(log.last().unwrap().contains("99.7%"));
    }
}
