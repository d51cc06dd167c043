use super::fetch::fetch_file;
use crate::error::EngineError;
use crate::events::{EventBus, ModelEvent};
use crate::hub::Hub;
use crate::storage::RootResolver;
use crate::types::{DownloadOutcome, FileSpec};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

/// Base delay for exponential backoff (in milliseconds)
const BASE_RETRY_DELAY_MS: u64 = 1000;
/// Maximum delay between retries (in milliseconds)
const MAX_RETRY_DELAY_MS: u64 = 30000;

/// Calculate exponential backoff delay
pub(crate) fn backoff_delay(attempt: u32) -> std::time::Duration {
    let delay_ms = BASE_RETRY_DELAY_MS * 2u64.pow(attempt.min(10));
    std::time::Duration::from_millis(delay_ms.min(MAX_RETRY_DELAY_MS))
}

struct Session {
    cancel: Arc<AtomicBool>,
    done: watch::Receiver<Option<DownloadOutcome>>,
}

enum Slot {
    Attached(watch::Receiver<Option<DownloadOutcome>>),
    Started {
        tx: watch::Sender<Option<DownloadOutcome>>,
        cancel: Arc<AtomicBool>,
    },
}

/// Runs at most one active transfer per model id. A second request for the
/// same id attaches to the in-flight session instead of racing a duplicate
/// transfer; repair downloads issued during verification take the same slot.
pub struct Coordinator {
    hub: Arc<dyn Hub>,
    resolver: Arc<RootResolver>,
    bus: Arc<EventBus>,
    retry_limit: u32,
    sessions: Mutex<HashMap<String, Session>>,
}

impl Coordinator {
    pub fn new(
        hub: Arc<dyn Hub>,
        resolver: Arc<RootResolver>,
        bus: Arc<EventBus>,
        retry_limit: u32,
    ) -> Self {
        Self {
            hub,
            resolver,
            bus,
            retry_limit: retry_limit.max(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Transfer the given files of a model, attaching to an in-flight
    /// session for the id when one exists. Exactly one `download_started`
    /// event is published per underlying transfer.
    pub async fn download_files(&self, model_id: &str, files: Vec<FileSpec>) -> DownloadOutcome {
        let slot = {
            let mut sessions = self.lock();
            match sessions.entry(model_id.to_string()) {
                Entry::Occupied(entry) => Slot::Attached(entry.get().done.clone()),
                Entry::Vacant(vacant) => {
                    let (tx, rx) = watch::channel(None);
                    let cancel = Arc::new(AtomicBool::new(false));
                    vacant.insert(Session {
                        cancel: cancel.clone(),
                        done: rx,
                    });
                    Slot::Started { tx, cancel }
                }
            }
        };

        match slot {
            Slot::Attached(rx) => {
                log::info!("Attaching to in-flight download for '{}'", model_id);
                await_outcome(rx).await
            }
            Slot::Started { tx, cancel } => {
                let outcome = self.run_session(model_id, &files, &cancel).await;
                // Free the slot before waking attached callers so their
                // follow-up requests see no active session.
                self.lock().remove(model_id);
                let _ = tx.send(Some(outcome.clone()));
                outcome
            }
        }
    }

    /// Request cooperative cancellation of the active session for an id.
    /// Observed at the next file boundary. Returns false when nothing is
    /// in flight.
    pub fn cancel(&self, model_id: &str) -> bool {
        let sessions = self.lock();
        match sessions.get(model_id) {
            Some(session) => {
                session.cancel.store(true, Ordering::SeqCst);
                log::info!("Cancellation requested for '{}'", model_id);
                true
            }
            None => false,
        }
    }

    async fn run_session(
        &self,
        model_id: &str,
        files: &[FileSpec],
        cancel: &AtomicBool,
    ) -> DownloadOutcome {
        let outcome = self.run_transfer(model_id, files, cancel).await;
        match &outcome {
            DownloadOutcome::Completed | DownloadOutcome::AlreadyPresent => {
                self.bus.publish(model_id, ModelEvent::DownloadComplete);
            }
            DownloadOutcome::Cancelled => {
                self.bus.publish(model_id, ModelEvent::DownloadCancelled);
            }
            DownloadOutcome::Failed(err) => {
                self.bus.publish(
                    model_id,
                    ModelEvent::DownloadFailed {
                        reason: err.to_string(),
                    },
                );
            }
        }
        outcome
    }

    async fn run_transfer(
        &self,
        model_id: &str,
        files: &[FileSpec],
        cancel: &AtomicBool,
    ) -> DownloadOutcome {
        if files.is_empty() {
            return DownloadOutcome::AlreadyPresent;
        }
        let total: u64 = files.iter().map(|f| f.size).sum::<u64>().max(1);

        let mut root = match self.resolver.resolve() {
            Ok(root) => root,
            Err(e) => return DownloadOutcome::Failed(EngineError::Storage(e.to_string())),
        };

        self.bus.publish(
            model_id,
            ModelEvent::DownloadStarted {
                files: files.len(),
                total_bytes: files.iter().map(|f| f.size).sum(),
            },
        );

        'root: loop {
            let dest_dir = root.join(model_id);
            let mut completed: u64 = 0;
            let mut last_emitted = 0.0_f64;

            for spec in files {
                if cancel.load(Ordering::SeqCst) {
                    log::info!("Download of '{}' cancelled at file boundary", model_id);
                    return DownloadOutcome::Cancelled;
                }

                let resume = self.hub.supports_resume(model_id, &spec.name).await;
                let mut attempt: u32 = 0;
                loop {
                    attempt += 1;
                    let base = completed;
                    let result = fetch_file(
                        self.hub.as_ref(),
                        model_id,
                        spec,
                        &dest_dir,
                        resume,
                        |staged| {
                            emit_progress(&self.bus, model_id, &mut last_emitted, base + staged, total);
                        },
                    )
                    .await;

                    match result {
                        Ok(()) => {
                            completed += spec.size;
                            emit_progress(&self.bus, model_id, &mut last_emitted, completed, total);
                            break;
                        }
                        Err(EngineError::Network(reason)) if attempt < self.retry_limit => {
                            let delay = backoff_delay(attempt - 1);
                            log::warn!(
                                "Transfer of '{}' failed (attempt {}/{}): {}; retrying in {:?}",
                                spec.name,
                                attempt,
                                self.retry_limit,
                                reason,
                                delay
                            );
                            tokio::time::sleep(delay).await;
                        }
                        Err(EngineError::Storage(reason)) => {
                            log::warn!("Structural write failure under {:?}: {}", root, reason);
                            match self.resolver.fall_back() {
                                Ok(next_root) => {
                                    root = next_root;
                                    self.bus.publish(
                                        model_id,
                                        ModelEvent::StorageFallback {
                                            root: root.display().to_string(),
                                        },
                                    );
                                    // Fresh start on the new root; the reset
                                    // is reported, never silently inferred.
                                    self.bus
                                        .publish(model_id, ModelEvent::Progress { fraction: 0.0 });
                                    continue 'root;
                                }
                                Err(e) => {
                                    return DownloadOutcome::Failed(EngineError::Storage(
                                        e.to_string(),
                                    ))
                                }
                            }
                        }
                        Err(err) => return DownloadOutcome::Failed(err),
                    }
                }
            }

            return DownloadOutcome::Completed;
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Progress fractions are reported non-decreasing per session, throttled to
/// whole-percent steps; a genuine restart is reported at its lower value
/// instead of being papered over.
fn emit_progress(bus: &EventBus, model_id: &str, last: &mut f64, done: u64, total: u64) {
    let fraction = (done as f64 / total as f64).clamp(0.0, 1.0);
    if fraction + 1e-9 < *last {
        *last = fraction;
        bus.publish(model_id, ModelEvent::Progress { fraction });
        return;
    }
    if fraction >= *last + 0.01 || (fraction >= 1.0 && *last < 1.0) {
        *last = fraction;
        bus.publish(model_id, ModelEvent::Progress { fraction });
    }
}

async fn await_outcome(mut rx: watch::Receiver<Option<DownloadOutcome>>) -> DownloadOutcome {
    loop {
        let current = rx.borrow().clone();
        if let Some(outcome) = current {
            return outcome;
        }
        if rx.changed().await.is_err() {
            return DownloadOutcome::Failed(EngineError::Network(
                "download session dropped without an outcome".into(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0).as_millis(), 1000);
        assert_eq!(backoff_delay(1).as_millis(), 2000);
        assert_eq!(backoff_delay(2).as_millis(), 4000);
        // Capped regardless of how far attempts run.
        assert_eq!(backoff_delay(10).as_millis(), 30000);
        assert_eq!(backoff_delay(40).as_millis(), 30000);
    }
}
