use crate::error::HubError;
use crate::types::Manifest;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::path::PathBuf;

pub type ByteStream = BoxStream<'static, Result<Bytes, HubError>>;

/// An open transfer of one hub file.
pub struct FileFetch {
    /// Total size of the file on the hub, when the hub reports one.
    pub total: Option<u64>,
    /// Byte offset the stream actually starts at. Zero when the hub ignored
    /// the requested range, in which case the caller must start over.
    pub offset: u64,
    pub stream: ByteStream,
}

impl std::fmt::Debug for FileFetch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileFetch")
            .field("total", &self.total)
            .field("offset", &self.offset)
            .field("stream", &"<stream>")
            .finish()
    }
}

/// The remote hub boundary: per-model manifests and ranged file retrieval.
#[async_trait]
pub trait Hub: Send + Sync {
    /// Fetch the authoritative manifest for a model id.
    async fn manifest(&self, model_id: &str) -> Result<Manifest, HubError>;

    /// Open a transfer of one file, resuming from `start` when supported.
    async fn fetch(&self, model_id: &str, file: &str, start: u64)
        -> Result<FileFetch, HubError>;

    /// Whether resumed (ranged) transfers are supported for this file.
    async fn supports_resume(&self, _model_id: &str, _file: &str) -> bool {
        false
    }

    /// Human-readable description of where a model's files come from.
    fn describe(&self, model_id: &str) -> String {
        format!("hub:{}", model_id)
    }
}

/// HTTP hub speaking the usual `/<model>/resolve/main/<file>` layout.
pub struct HttpHub {
    base: String,
    client: reqwest::Client,
}

impl HttpHub {
    pub fn new(base: impl Into<String>) -> Result<Self, HubError> {
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            client: create_http_client()?,
        })
    }

    fn file_url(&self, model_id: &str, file: &str) -> String {
        format!("{}/{}/resolve/main/{}", self.base, model_id, file)
    }
}

/// Create HTTP client for hub transfers.
fn create_http_client() -> Result<reqwest::Client, HubError> {
    reqwest::Client::builder()
        .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36")
        .redirect(reqwest::redirect::Policy::limited(10))
        .timeout(std::time::Duration::from_secs(600)) // 10 minutes for large models
        .connect_timeout(std::time::Duration::from_secs(30))
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .tcp_keepalive(std::time::Duration::from_secs(60))
        .build()
        .map_err(|e| HubError::Network(format!("Failed to create HTTP client: {}", e)))
}

#[async_trait]
impl Hub for HttpHub {
    async fn manifest(&self, model_id: &str) -> Result<Manifest, HubError> {
        let url = self.file_url(model_id, "manifest.json");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| HubError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(HubError::NotFound(format!("{}/manifest.json", model_id)));
        }
        if !status.is_success() {
            return Err(HubError::Status(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| HubError::Network(e.to_string()))?;
        let manifest: Manifest =
            serde_json::from_str(&body).map_err(|e| HubError::Manifest(e.to_string()))?;
        if manifest.files.is_empty() {
            return Err(HubError::Manifest(format!(
                "manifest for '{}' lists no files",
                model_id
            )));
        }

        Ok(manifest)
    }

    async fn fetch(
        &self,
        model_id: &str,
        file: &str,
        start: u64,
    ) -> Result<FileFetch, HubError> {
        let url = self.file_url(model_id, file);
        let mut request = self
            .client
            .get(&url)
            .header("Accept", "*/*")
            .header("Accept-Encoding", "identity");

        if start > 0 {
            log::info!("Resuming transfer of '{}' from byte {}", file, start);
            request = request.header("Range", format!("bytes={}-", start));
        }

        let response = request
            .send()
            .await
            .map_err(|e| HubError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(HubError::NotFound(file.to_string()));
        }
        // 200 OK for a fresh transfer, 206 Partial Content for a resume.
        if !status.is_success() && status != reqwest::StatusCode::PARTIAL_CONTENT {
            return Err(HubError::Status(status.as_u16()));
        }

        let (total, offset) = if start > 0 && status == reqwest::StatusCode::PARTIAL_CONTENT {
            // The Content-Range header carries the full size after the slash.
            let total = response
                .headers()
                .get("content-range")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.split('/').last())
                .and_then(|s| s.parse::<u64>().ok());
            (total, start)
        } else {
            (response.content_length(), 0)
        };

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| HubError::Network(e.to_string())))
            .boxed();

        Ok(FileFetch {
            total,
            offset,
            stream,
        })
    }

    async fn supports_resume(&self, model_id: &str, file: &str) -> bool {
        let url = self.file_url(model_id, file);
        match self.client.head(&url).send().await {
            Ok(response) => {
                let accepts_ranges = response
                    .headers()
                    .get("accept-ranges")
                    .map(|v| v.to_str().unwrap_or("") != "none")
                    .unwrap_or(false);
                log::debug!("Range support for '{}': {}", file, accepts_ranges);
                accepts_ranges
            }
            Err(e) => {
                log::warn!("Failed to check range support for '{}': {}", file, e);
                false
            }
        }
    }

    fn describe(&self, model_id: &str) -> String {
        format!("{}/{}", self.base, model_id)
    }
}

/// Directory-backed hub: a local mirror laid out as
/// `<root>/<model_id>/<file>` with a `manifest.json` beside the files.
pub struct DirHub {
    root: PathBuf,
}

/// Stream granularity for directory-backed transfers.
const DIR_CHUNK_SIZE: usize = 64 * 1024;

impl DirHub {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Hub for DirHub {
    async fn manifest(&self, model_id: &str) -> Result<Manifest, HubError> {
        let path = self.root.join(model_id).join("manifest.json");
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| HubError::Manifest(format!("read {}: {}", path.display(), e)))?;
        let manifest: Manifest =
            serde_json::from_str(&content).map_err(|e| HubError::Manifest(e.to_string()))?;
        if manifest.files.is_empty() {
            return Err(HubError::Manifest(format!(
                "manifest for '{}' lists no files",
                model_id
            )));
        }
        Ok(manifest)
    }

    async fn fetch(
        &self,
        model_id: &str,
        file: &str,
        start: u64,
    ) -> Result<FileFetch, HubError> {
        let path = self.root.join(model_id).join(file);
        let data = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                HubError::NotFound(file.to_string())
            } else {
                HubError::Network(format!("read {}: {}", path.display(), e))
            }
        })?;

        let total = data.len() as u64;
        let offset = start.min(total);
        let chunks: Vec<Result<Bytes, HubError>> = data[offset as usize..]
            .chunks(DIR_CHUNK_SIZE)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();

        Ok(FileFetch {
            total: Some(total),
            offset,
            stream: futures_util::stream::iter(chunks).boxed(),
        })
    }

    async fn supports_resume(&self, _model_id: &str, _file: &str) -> bool {
        true
    }

    fn describe(&self, model_id: &str) -> String {
        self.root.join(model_id).display().to_string()
    }
}
