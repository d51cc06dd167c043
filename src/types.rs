use serde::{Deserialize, Serialize};

/// Authoritative description of one file in a model bundle, as published by
/// the hub. The content hash is optional; size is always known.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileSpec {
    pub name: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// File list for a model bundle, sourced from the hub.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub files: Vec<FileSpec>,
}

impl Manifest {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn file(&self, name: &str) -> Option<&FileSpec> {
        self.files.iter().find(|f| f.name == name)
    }
}

/// Classification of a local file against its manifest entry.
///
/// `Corrupt` means present but with a size (or, when the manifest carries a
/// hash, content) mismatch; a zero-byte file that should be non-zero is
/// corrupt, not missing. `Untracked` marks files on disk the manifest does
/// not know about; they are reported but never counted or deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCheck {
    Correct,
    Corrupt,
    Missing,
    Untracked,
}

/// Verification phases, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyPhase {
    Start,
    DirectoryStatus,
    DirectoryCompleteness,
    ScanStart,
    ScanSource,
    ScanTarget,
    ScanFileProgress,
    ScanResult,
    MissingFiles,
    RepairProgress,
    RepairComplete,
    RedownloadComplete,
    Result,
    Finished,
}

/// Final verification status, also used as the log-facing status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStatus {
    Clean,
    Repaired,
    Unrepaired,
}

impl VerifyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyStatus::Clean => "clean",
            VerifyStatus::Repaired => "repaired",
            VerifyStatus::Unrepaired => "unrepaired",
        }
    }
}

/// Terminal outcome of a download request.
#[derive(Debug, Clone)]
pub enum DownloadOutcome {
    /// All requested files were fetched and passed their checks.
    Completed,
    /// Nothing to do: every requested file was already present and correct.
    AlreadyPresent,
    /// The session was cancelled at a file boundary.
    Cancelled,
    Failed(crate::error::EngineError),
}

impl DownloadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            DownloadOutcome::Completed | DownloadOutcome::AlreadyPresent
        )
    }
}

/// Model information for API consumers.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    pub is_downloaded: bool,
    pub path: Option<String>,
}
