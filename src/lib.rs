//! Acquisition and integrity engine for multi-file model bundles.
//!
//! A [`ModelEngine`] fetches model bundles from a [`hub::Hub`] into a
//! write-probed storage root, keeps transfer sessions exclusive per model
//! id, and verifies local copies file by file, repairing only what is
//! missing or corrupt. Every state transition is observable on the
//! per-model event bus.

pub mod download;
pub mod error;
pub mod events;
pub mod hub;
pub mod settings;
pub mod storage;
pub mod types;
pub mod verify;

pub use error::EngineError;
pub use events::{EventBus, ModelEvent};
pub use hub::{DirHub, Hub, HttpHub};
pub use types::{
    DownloadOutcome, FileCheck, FileSpec, Manifest, ModelInfo, VerifyPhase, VerifyStatus,
};

use download::Coordinator;
use settings::EngineSettings;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use storage::RootResolver;
use tokio::sync::broadcast;
use verify::Verifier;

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Namespace for the default storage chain and the settings file.
    pub app_name: String,
    /// Explicit storage candidates; `None` uses the platform default chain.
    pub storage_chain: Option<Vec<PathBuf>>,
    /// Transient-failure attempt ceiling per file; `None` reads the
    /// persisted settings (default 3).
    pub retry_limit: Option<u32>,
    /// How long finished verification sessions stay queryable.
    pub session_grace: Duration,
    /// Whether to load/store `settings.json` under the app data dir.
    pub persist_settings: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_name: "modelguard".into(),
            storage_chain: None,
            retry_limit: None,
            session_grace: Duration::from_secs(5),
            persist_settings: true,
        }
    }
}

/// The process-wide engine. Construct once and inject into consumers; all
/// state lives here, not in globals.
pub struct ModelEngine {
    hub: Arc<dyn Hub>,
    resolver: Arc<RootResolver>,
    bus: Arc<EventBus>,
    coordinator: Arc<Coordinator>,
    verifier: Arc<Verifier>,
    manifests: Mutex<HashMap<String, Manifest>>,
    recorded_root: Mutex<Option<PathBuf>>,
    app_name: String,
    persist_settings: bool,
}

impl ModelEngine {
    pub fn new(hub: Arc<dyn Hub>, config: EngineConfig) -> Self {
        let settings = if config.persist_settings {
            settings::load_settings(&config.app_name).unwrap_or_else(|e| {
                log::warn!("Failed to load settings, using defaults: {:#}", e);
                EngineSettings::default()
            })
        } else {
            EngineSettings::default()
        };

        let mut chain = config
            .storage_chain
            .clone()
            .unwrap_or_else(|| RootResolver::default_chain(&config.app_name));
        // Probe the root that survived last run first.
        if let Some(last) = &settings.last_storage_root {
            if let Some(pos) = chain.iter().position(|candidate| candidate == last) {
                if pos > 0 {
                    let preferred = chain.remove(pos);
                    chain.insert(0, preferred);
                }
            }
        }

        let retry_limit = config.retry_limit.unwrap_or(settings.retry_limit);
        let resolver = Arc::new(RootResolver::new(chain));
        let bus = Arc::new(EventBus::new());
        let coordinator = Arc::new(Coordinator::new(
            hub.clone(),
            resolver.clone(),
            bus.clone(),
            retry_limit,
        ));
        let verifier = Arc::new(Verifier::new(
            hub.clone(),
            resolver.clone(),
            coordinator.clone(),
            bus.clone(),
            config.session_grace,
        ));

        Self {
            hub,
            resolver,
            bus,
            coordinator,
            verifier,
            manifests: Mutex::new(HashMap::new()),
            recorded_root: Mutex::new(None),
            app_name: config.app_name,
            persist_settings: config.persist_settings,
        }
    }

    /// Make sure every manifest file of a model is present and correct,
    /// fetching only what is not. A call made while a transfer for the same
    /// id is in flight attaches to it instead of starting a second one.
    pub async fn ensure_downloaded(&self, model_id: &str) -> DownloadOutcome {
        let manifest = match self.manifest_for(model_id).await {
            Ok(manifest) => manifest,
            Err(e) => return DownloadOutcome::Failed(e),
        };

        let mut did_download = false;
        // An attached call may have covered only part of our file set, so
        // re-check and fetch the remainder; bounded to rule out a livelock
        // against a hub that keeps serving bad bytes.
        for _ in 0..3 {
            let root = match self.resolved_root() {
                Ok(root) => root,
                Err(e) => return DownloadOutcome::Failed(e),
            };
            let pending = verify::pending_files(&manifest, &root.join(model_id));
            if pending.is_empty() {
                return if did_download {
                    DownloadOutcome::Completed
                } else {
                    DownloadOutcome::AlreadyPresent
                };
            }

            let outcome = self.coordinator.download_files(model_id, pending).await;
            match outcome {
                DownloadOutcome::Completed | DownloadOutcome::AlreadyPresent => {
                    did_download = true;
                }
                other => return other,
            }
        }

        DownloadOutcome::Failed(EngineError::Unrepairable(format!(
            "'{}' keeps failing its checks after repeated downloads",
            model_id
        )))
    }

    /// Request cancellation of the active download for a model id.
    /// Observed at the next file boundary.
    pub fn cancel_download(&self, model_id: &str) -> bool {
        self.coordinator.cancel(model_id)
    }

    /// Start verification for a model id. Fire-and-forget; all progress and
    /// the outcome arrive on the event bus. Returns false when a
    /// verification for this id is already running.
    pub fn verify(&self, model_id: &str) -> bool {
        self.verifier.clone().verify(model_id)
    }

    /// Subscribe to the lifecycle events of one model id.
    pub fn subscribe(&self, model_id: &str) -> broadcast::Receiver<ModelEvent> {
        self.bus.subscribe(model_id)
    }

    /// Recent rendered log lines for a model id, oldest first.
    pub fn recent_log(&self, model_id: &str) -> Vec<String> {
        self.bus.recent_log(model_id)
    }

    /// Phase of the running (or just finished) verification for a model id.
    pub fn current_phase(&self, model_id: &str) -> Option<VerifyPhase> {
        self.verifier.current_phase(model_id)
    }

    /// Whether every manifest file is present and correct on disk.
    pub async fn is_present(&self, model_id: &str) -> bool {
        let Ok(manifest) = self.manifest_for(model_id).await else {
            return false;
        };
        let Ok(root) = self.resolver.resolve() else {
            return false;
        };
        verify::pending_files(&manifest, &root.join(model_id)).is_empty()
    }

    /// Availability of every model this engine has seen, sorted by id.
    pub async fn list_models(&self) -> Vec<ModelInfo> {
        let manifests: Vec<(String, Manifest)> = self
            .lock_manifests()
            .iter()
            .map(|(id, manifest)| (id.clone(), manifest.clone()))
            .collect();
        let root = self.resolver.resolve().ok();

        let mut models = Vec::new();
        for (id, manifest) in manifests {
            let dir = root.as_ref().map(|root| root.join(&id));
            let is_downloaded = dir
                .as_ref()
                .map(|dir| verify::pending_files(&manifest, dir).is_empty())
                .unwrap_or(false);
            let path = if is_downloaded {
                dir.as_ref().map(|dir| dir.to_string_lossy().to_string())
            } else {
                None
            };
            let display_name = manifest
                .display_name
                .clone()
                .unwrap_or_else(|| id.rsplit('/').next().unwrap_or(id.as_str()).to_string());
            models.push(ModelInfo {
                id,
                display_name,
                is_downloaded,
                path,
            });
        }

        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    /// Delete a model's directory under the storage root.
    pub async fn delete_model(&self, model_id: &str) -> Result<(), EngineError> {
        let root = self.resolved_root()?;
        let dir = root.join(model_id);

        if !dir.exists() {
            return Err(EngineError::Storage(format!(
                "model '{}' is not downloaded",
                model_id
            )));
        }

        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| EngineError::Storage(format!("delete '{}': {}", model_id, e)))?;

        log::info!("Model '{}' has been deleted", model_id);
        Ok(())
    }

    async fn manifest_for(&self, model_id: &str) -> Result<Manifest, EngineError> {
        if let Some(manifest) = self.lock_manifests().get(model_id).cloned() {
            return Ok(manifest);
        }

        let manifest = self
            .hub
            .manifest(model_id)
            .await
            .map_err(EngineError::from)?;
        self.lock_manifests()
            .insert(model_id.to_string(), manifest.clone());
        Ok(manifest)
    }

    /// Resolve the storage root and record it in the settings store the
    /// first time (and whenever the fallback switch changes it).
    fn resolved_root(&self) -> Result<PathBuf, EngineError> {
        let root = self
            .resolver
            .resolve()
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        if self.persist_settings {
            let mut recorded = match self.recorded_root.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if recorded.as_ref() != Some(&root) {
                *recorded = Some(root.clone());
                if let Err(e) = settings::remember_root(&self.app_name, &root) {
                    log::warn!("Failed to record storage root: {:#}", e);
                }
            }
        }

        Ok(root)
    }

    fn lock_manifests(&self) -> MutexGuard<'_, HashMap<String, Manifest>> {
        match self.manifests.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
