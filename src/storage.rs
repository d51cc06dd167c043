use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Resolves the root directory under which all model bundles are persisted.
///
/// Candidates are probed in order; the first one that survives a write probe
/// becomes the active root for the rest of the process lifetime. A structural
/// write failure later on advances to the next candidate (`fall_back`), and
/// that switch is one-way: earlier candidates are never retried within a run,
/// since the probe already proved them unusable.
pub struct RootResolver {
    chain: Vec<PathBuf>,
    active: Mutex<Option<usize>>,
}

impl RootResolver {
    pub fn new(chain: Vec<PathBuf>) -> Self {
        Self {
            chain,
            active: Mutex::new(None),
        }
    }

    /// Default candidate chain: shared data directory, then the
    /// application-private local data directory, then the process temp dir.
    pub fn default_chain(app_name: &str) -> Vec<PathBuf> {
        let mut chain = Vec::new();
        if let Some(dir) = dirs::data_dir() {
            chain.push(dir.join(app_name).join("models"));
        }
        if let Some(dir) = dirs::data_local_dir() {
            let candidate = dir.join(app_name).join("models");
            if !chain.contains(&candidate) {
                chain.push(candidate);
            }
        }
        chain.push(std::env::temp_dir().join(app_name).join("models"));
        chain
    }

    /// Resolve the active root, probing candidates in order on first use.
    pub fn resolve(&self) -> Result<PathBuf> {
        let mut active = self.lock();
        if let Some(idx) = *active {
            return Ok(self.chain[idx].clone());
        }

        for (idx, candidate) in self.chain.iter().enumerate() {
            match probe_writable(candidate) {
                Ok(()) => {
                    log::info!("Using storage root: {:?}", candidate);
                    *active = Some(idx);
                    return Ok(candidate.clone());
                }
                Err(e) => {
                    log::warn!("Storage candidate {:?} rejected: {:#}", candidate, e);
                }
            }
        }

        Err(anyhow!(
            "no writable storage location among {} candidates",
            self.chain.len()
        ))
    }

    /// Advance past the current root after a structural write failure.
    ///
    /// One-way: the previous root is skipped for the rest of the run.
    pub fn fall_back(&self) -> Result<PathBuf> {
        let mut active = self.lock();
        let start = active.map(|idx| idx + 1).unwrap_or(0);

        for idx in start..self.chain.len() {
            let candidate = &self.chain[idx];
            match probe_writable(candidate) {
                Ok(()) => {
                    log::warn!("Switched storage root to fallback: {:?}", candidate);
                    *active = Some(idx);
                    return Ok(candidate.clone());
                }
                Err(e) => {
                    log::warn!("Fallback candidate {:?} rejected: {:#}", candidate, e);
                }
            }
        }

        Err(anyhow!("storage fallback chain exhausted"))
    }

    /// The currently active root, if one has been resolved yet.
    pub fn current(&self) -> Option<PathBuf> {
        self.lock().map(|idx| self.chain[idx].clone())
    }

    fn lock(&self) -> MutexGuard<'_, Option<usize>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Confirm a directory is actually writable, not merely that it exists:
/// create it, write a uniquely named probe file, and remove it again.
fn probe_writable(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

    let probe = dir.join(format!(
        ".write-probe-{}-{}",
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    fs::write(&probe, b"probe").with_context(|| format!("write probe {}", probe.display()))?;
    fs::remove_file(&probe).with_context(|| format!("remove probe {}", probe.display()))?;
    Ok(())
}
