use crate::download::{checksum, Coordinator};
use crate::events::{EventBus, ModelEvent};
use crate::hub::Hub;
use crate::storage::RootResolver;
use crate::types::{FileCheck, FileSpec, Manifest, VerifyPhase, VerifyStatus};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct SessionState {
    phase: Mutex<VerifyPhase>,
    finished: AtomicBool,
}

impl SessionState {
    fn new() -> Self {
        Self {
            phase: Mutex::new(VerifyPhase::Start),
            finished: AtomicBool::new(false),
        }
    }

    fn set_phase(&self, phase: VerifyPhase) {
        let mut guard = match self.phase.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = phase;
    }

    fn phase(&self) -> VerifyPhase {
        match self.phase.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

struct ScanReport {
    missing: usize,
    corrupt: usize,
    repair_set: Vec<FileSpec>,
}

/// Walks a model bundle through the fixed verification phase sequence and
/// drives a selective repair of whatever the scan flags. The verifier only
/// reads and classifies; every write goes through the download coordinator.
/// Results are observable on the event bus alone.
pub struct Verifier {
    hub: Arc<dyn Hub>,
    resolver: Arc<RootResolver>,
    coordinator: Arc<Coordinator>,
    bus: Arc<EventBus>,
    /// How long a finished session stays readable for late observers.
    grace: Duration,
    sessions: Mutex<HashMap<String, Arc<SessionState>>>,
}

impl Verifier {
    pub fn new(
        hub: Arc<dyn Hub>,
        resolver: Arc<RootResolver>,
        coordinator: Arc<Coordinator>,
        bus: Arc<EventBus>,
        grace: Duration,
    ) -> Self {
        Self {
            hub,
            resolver,
            coordinator,
            bus,
            grace,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start verification for a model id. Fire-and-forget: progress and the
    /// outcome arrive on the event bus. Returns false when a verification
    /// for this id is still running.
    pub fn verify(self: Arc<Self>, model_id: &str) -> bool {
        let state = {
            let mut sessions = self.lock();
            if let Some(existing) = sessions.get(model_id) {
                if !existing.finished.load(Ordering::SeqCst) {
                    log::warn!("Verification already running for '{}'", model_id);
                    return false;
                }
            }
            let state = Arc::new(SessionState::new());
            sessions.insert(model_id.to_string(), state.clone());
            state
        };

        let model_id = model_id.to_string();
        tokio::spawn(async move {
            self.run(model_id, state).await;
        });
        true
    }

    /// Phase of the session for a model id, if one is active or recently
    /// finished.
    pub fn current_phase(&self, model_id: &str) -> Option<VerifyPhase> {
        self.lock().get(model_id).map(|state| state.phase())
    }

    async fn run(&self, model_id: String, state: Arc<SessionState>) {
        let started = Instant::now();
        let success = self.run_phases(&model_id, &state).await;

        state.set_phase(VerifyPhase::Finished);
        // Mark the session reusable before the terminal event goes out, so a
        // subscriber reacting to `finished` can start a fresh verification.
        state.finished.store(true, Ordering::SeqCst);
        self.bus.publish(
            &model_id,
            ModelEvent::Finished {
                success,
                elapsed_ms: started.elapsed().as_millis() as u64,
            },
        );

        // Late observers may still query the finished session for a moment.
        tokio::time::sleep(self.grace).await;
        let mut sessions = self.lock();
        if let Some(current) = sessions.get(&model_id) {
            if Arc::ptr_eq(current, &state) {
                sessions.remove(&model_id);
            }
        }
    }

    async fn run_phases(&self, model_id: &str, state: &SessionState) -> bool {
        self.bus.publish(model_id, ModelEvent::VerifyStart);

        let manifest = self.hub.manifest(model_id).await;
        let root = match self.resolver.resolve() {
            Ok(root) => root,
            Err(e) => {
                log::error!("No usable storage root for '{}': {:#}", model_id, e);
                state.set_phase(VerifyPhase::Result);
                self.bus.publish(
                    model_id,
                    ModelEvent::VerifyResult {
                        status: VerifyStatus::Unrepaired,
                    },
                );
                return false;
            }
        };
        let target_dir = root.join(model_id);

        // Source and target existence are reported independently.
        state.set_phase(VerifyPhase::DirectoryStatus);
        let target_present = target_dir.is_dir();
        self.bus.publish(
            model_id,
            ModelEvent::DirectoryStatus {
                source_present: manifest.is_ok(),
                target_present,
            },
        );

        let manifest = match manifest {
            Ok(manifest) => manifest,
            Err(e) => {
                log::warn!("Manifest for '{}' unavailable: {}", model_id, e);
                state.set_phase(VerifyPhase::Result);
                self.bus.publish(
                    model_id,
                    ModelEvent::VerifyResult {
                        status: VerifyStatus::Unrepaired,
                    },
                );
                return false;
            }
        };

        // Coarse pre-check on names only; bytes come later.
        state.set_phase(VerifyPhase::DirectoryCompleteness);
        let target_files = list_target_files(&target_dir);
        let found: HashSet<&str> = target_files.iter().map(|(name, _)| name.as_str()).collect();
        let present = manifest
            .files
            .iter()
            .filter(|spec| found.contains(spec.name.as_str()))
            .count();
        self.bus.publish(
            model_id,
            ModelEvent::DirectoryCompleteness {
                complete: present == manifest.files.len(),
                expected: manifest.files.len(),
                found: target_files.len(),
            },
        );

        let report = self.scan(model_id, state, &manifest, &target_dir);
        if report.repair_set.is_empty() {
            state.set_phase(VerifyPhase::Result);
            self.bus.publish(
                model_id,
                ModelEvent::VerifyResult {
                    status: VerifyStatus::Clean,
                },
            );
            return true;
        }

        // Selective repair: only the files the scan flagged.
        state.set_phase(VerifyPhase::MissingFiles);
        self.bus.publish(
            model_id,
            ModelEvent::MissingFiles {
                count: report.repair_set.len(),
            },
        );

        state.set_phase(VerifyPhase::RepairProgress);
        let total = report.repair_set.len();
        for (index, spec) in report.repair_set.iter().enumerate() {
            let outcome = self
                .coordinator
                .download_files(model_id, vec![spec.clone()])
                .await;
            if !outcome.is_success() {
                log::warn!("Repair fetch of '{}' did not complete", spec.name);
            }
            self.bus.publish(
                model_id,
                ModelEvent::RepairProgress {
                    index: index + 1,
                    total,
                    name: spec.name.clone(),
                },
            );
        }

        state.set_phase(VerifyPhase::RepairComplete);
        let repair_ok = report
            .repair_set
            .iter()
            .all(|spec| check_file(spec, &target_dir) == FileCheck::Correct);
        self.bus.publish(
            model_id,
            ModelEvent::RepairComplete { success: repair_ok },
        );

        state.set_phase(VerifyPhase::RedownloadComplete);
        self.bus.publish(model_id, ModelEvent::RedownloadComplete);

        // One rescan per verify call; anything still broken is surfaced and
        // left for a caller-initiated retry, never looped on in background.
        let report = self.scan(model_id, state, &manifest, &target_dir);
        state.set_phase(VerifyPhase::Result);
        if report.repair_set.is_empty() {
            self.bus.publish(
                model_id,
                ModelEvent::VerifyResult {
                    status: VerifyStatus::Repaired,
                },
            );
            true
        } else {
            log::warn!(
                "'{}' still has {} missing and {} corrupt files after repair",
                model_id,
                report.missing,
                report.corrupt
            );
            self.bus.publish(
                model_id,
                ModelEvent::VerifyResult {
                    status: VerifyStatus::Unrepaired,
                },
            );
            false
        }
    }

    fn scan(
        &self,
        model_id: &str,
        state: &SessionState,
        manifest: &Manifest,
        target_dir: &Path,
    ) -> ScanReport {
        state.set_phase(VerifyPhase::ScanStart);
        self.bus.publish(
            model_id,
            ModelEvent::ScanStart {
                source: self.hub.describe(model_id),
                target: target_dir.display().to_string(),
            },
        );

        state.set_phase(VerifyPhase::ScanSource);
        self.bus.publish(
            model_id,
            ModelEvent::ScanSource {
                files: manifest.files.len(),
            },
        );

        state.set_phase(VerifyPhase::ScanTarget);
        let target_files = list_target_files(target_dir);
        self.bus.publish(
            model_id,
            ModelEvent::ScanTarget {
                files: target_files.len(),
            },
        );

        state.set_phase(VerifyPhase::ScanFileProgress);
        let tracked: HashSet<&str> = manifest.files.iter().map(|f| f.name.as_str()).collect();
        let untracked: Vec<&(String, u64)> = target_files
            .iter()
            .filter(|(name, _)| !tracked.contains(name.as_str()))
            .collect();
        let total = manifest.files.len() + untracked.len();
        let target_bytes: u64 = target_files.iter().map(|(_, size)| size).sum();

        let mut missing = 0;
        let mut corrupt = 0;
        let mut repair_set = Vec::new();
        let mut index = 0;

        for spec in &manifest.files {
            index += 1;
            let check = check_file(spec, target_dir);
            match check {
                FileCheck::Missing => {
                    missing += 1;
                    repair_set.push(spec.clone());
                }
                FileCheck::Corrupt => {
                    corrupt += 1;
                    repair_set.push(spec.clone());
                }
                _ => {}
            }
            self.bus.publish(
                model_id,
                ModelEvent::ScanFileProgress {
                    index,
                    total,
                    name: spec.name.clone(),
                    check,
                },
            );
        }
        // Files the manifest does not know about are reported but never
        // counted against the model, and never deleted.
        for (name, _) in untracked {
            index += 1;
            self.bus.publish(
                model_id,
                ModelEvent::ScanFileProgress {
                    index,
                    total,
                    name: name.clone(),
                    check: FileCheck::Untracked,
                },
            );
        }

        state.set_phase(VerifyPhase::ScanResult);
        self.bus.publish(
            model_id,
            ModelEvent::ScanResult {
                missing,
                corrupt,
                source_bytes: manifest.total_bytes(),
                target_bytes,
            },
        );

        ScanReport {
            missing,
            corrupt,
            repair_set,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<SessionState>>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Classify one target file against its manifest entry. Size first; when
/// the manifest carries a hash, content decides.
pub(crate) fn check_file(spec: &FileSpec, dir: &Path) -> FileCheck {
    let path = dir.join(&spec.name);
    let meta = match fs::metadata(&path) {
        Ok(meta) if meta.is_file() => meta,
        _ => return FileCheck::Missing,
    };
    if meta.len() != spec.size {
        return FileCheck::Corrupt;
    }
    if let Some(expected) = &spec.sha256 {
        match checksum::calculate_sha256(&path) {
            Ok(hash) if hash.eq_ignore_ascii_case(expected) => {}
            _ => return FileCheck::Corrupt,
        }
    }
    FileCheck::Correct
}

/// Manifest entries a download would have to fetch to make the model whole.
pub(crate) fn pending_files(manifest: &Manifest, dir: &Path) -> Vec<FileSpec> {
    manifest
        .files
        .iter()
        .filter(|spec| check_file(spec, dir) != FileCheck::Correct)
        .cloned()
        .collect()
}

/// Enumerate target files recursively as hub-relative names with sizes.
/// Staging leftovers (`*.part`) are not part of the bundle.
fn list_target_files(dir: &Path) -> Vec<(String, u64)> {
    let mut files = Vec::new();
    collect_files(dir, "", &mut files);
    files.sort();
    files
}

fn collect_files(dir: &Path, prefix: &str, out: &mut Vec<(String, u64)>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };
        if path.is_dir() {
            collect_files(&path, &rel, out);
        } else if !rel.ends_with(".part") {
            let size = fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);
            out.push((rel, size));
        }
    }
}
