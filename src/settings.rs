use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Engine preferences persisted across runs. Best effort only: nothing in a
/// single run depends on this file being present or parseable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// The storage root that survived the write probe last run.
    #[serde(default)]
    pub last_storage_root: Option<PathBuf>,
    /// Transient-failure attempt ceiling per file.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
}

fn default_retry_limit() -> u32 {
    3
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            last_storage_root: None,
            retry_limit: default_retry_limit(),
        }
    }
}

/// Get path to the settings file for this engine instance.
fn settings_path(app_name: &str) -> Result<PathBuf> {
    let dir = dirs::data_dir()
        .context("Failed to get data directory")?
        .join(app_name);
    fs::create_dir_all(&dir)?;
    Ok(dir.join("settings.json"))
}

/// Load settings, falling back to defaults when the file is absent or stale.
pub fn load_settings(app_name: &str) -> Result<EngineSettings> {
    let path = settings_path(app_name)?;

    if !path.exists() {
        return Ok(EngineSettings::default());
    }

    let content = fs::read_to_string(&path).context("Failed to read settings file")?;
    let settings: EngineSettings = serde_json::from_str(&content).unwrap_or_default();

    Ok(settings)
}

/// Save settings as pretty JSON.
pub fn save_settings(app_name: &str, settings: &EngineSettings) -> Result<()> {
    let path = settings_path(app_name)?;
    let content =
        serde_json::to_string_pretty(settings).context("Failed to serialize settings")?;
    fs::write(&path, content).context("Failed to write settings file")?;

    Ok(())
}

/// Record the storage root that just passed its write probe.
pub fn remember_root(app_name: &str, root: &Path) -> Result<()> {
    let mut settings = load_settings(app_name)?;
    settings.last_storage_root = Some(root.to_path_buf());
    save_settings(app_name, &settings)?;

    Ok(())
}
