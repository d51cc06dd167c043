use thiserror::Error;

/// Terminal error classes surfaced by the engine.
///
/// Transient network failures are retried internally and only show up here
/// after the retry ceiling is exhausted. Storage failures show up only after
/// the storage fallback chain is exhausted. Cancellation is a distinct
/// terminal state, never folded into failure.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("network error: {0}")]
    Network(String),

    #[error("storage unusable: {0}")]
    Storage(String),

    #[error("manifest unavailable or malformed: {0}")]
    Manifest(String),

    #[error("model still incomplete after repair: {0}")]
    Unrepairable(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// Errors produced at the hub wire boundary.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("request failed: {0}")]
    Network(String),

    #[error("remote returned HTTP {0}")]
    Status(u16),

    #[error("file not found on hub: {0}")]
    NotFound(String),

    #[error("malformed manifest: {0}")]
    Manifest(String),
}

impl HubError {
    /// Whether a retry against the same hub may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            HubError::Network(_) => true,
            HubError::Status(code) => *code >= 500,
            _ => false,
        }
    }
}

impl From<HubError> for EngineError {
    fn from(err: HubError) -> Self {
        if err.is_transient() {
            EngineError::Network(err.to_string())
        } else {
            EngineError::Manifest(err.to_string())
        }
    }
}
