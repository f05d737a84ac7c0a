//! Typed access to the remote analysis service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{multipart, Client, Response, StatusCode};
use shared::{
    domain::{FileId, ThresholdPercentile},
    error::{ErrorKind, Failure},
    protocol::{DetectOutliersRequest, DetectOutliersResponse, ErrorBody, UploadInfo},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::session::{AnalysisResult, SelectedFile};

pub const UPLOAD_FALLBACK_MESSAGE: &str = "Error uploading file";
pub const ANALYZE_FALLBACK_MESSAGE: &str = "Error detecting outliers";
pub const DOWNLOAD_FALLBACK_MESSAGE: &str = "Error downloading cleaned dataset";

/// The three round trips the session makes to the analysis backend. No
/// retries happen at this layer.
#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn upload(&self, file: &SelectedFile) -> Result<UploadInfo, Failure>;
    async fn analyze(
        &self,
        file_id: &FileId,
        threshold: ThresholdPercentile,
    ) -> Result<AnalysisResult, Failure>;
    async fn fetch_cleaned(&self, file_id: &FileId) -> Result<Vec<u8>, Failure>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Upload,
    Analyze,
    FetchCleaned,
}

impl Call {
    fn fallback_message(self) -> &'static str {
        match self {
            Self::Upload => UPLOAD_FALLBACK_MESSAGE,
            Self::Analyze => ANALYZE_FALLBACK_MESSAGE,
            Self::FetchCleaned => DOWNLOAD_FALLBACK_MESSAGE,
        }
    }

    fn kind_for_status(self, status: StatusCode) -> ErrorKind {
        match self {
            Self::Upload if status.is_client_error() && status != StatusCode::NOT_FOUND => {
                ErrorKind::Validation
            }
            Self::Upload => ErrorKind::Transport,
            Self::Analyze | Self::FetchCleaned if status == StatusCode::NOT_FOUND => {
                ErrorKind::NotFound
            }
            Self::Analyze => ErrorKind::Processing,
            Self::FetchCleaned => ErrorKind::Transport,
        }
    }

    /// Kind used when a 2xx body cannot be decoded.
    fn malformed_kind(self) -> ErrorKind {
        match self {
            Self::Analyze => ErrorKind::Processing,
            Self::Upload | Self::FetchCleaned => ErrorKind::Transport,
        }
    }
}

pub struct HttpAnalysisService {
    http: Client,
    api_base: Url,
}

impl HttpAnalysisService {
    /// `backend_url` is the service root; requests go to `{backend_url}/api/...`.
    pub fn new(backend_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(http, api_base(backend_url)?))
    }

    pub fn with_client(http: Client, api_base: Url) -> Self {
        Self { http, api_base }
    }

    fn endpoint(&self, path: &str) -> Result<Url, Failure> {
        self.api_base
            .join(path)
            .map_err(|e| Failure::validation(format!("invalid request path {path}: {e}")))
    }

    /// `{api_base}/download-cleaned/{file_id}` with the id escaped as a
    /// single path segment.
    fn download_url(&self, file_id: &FileId) -> Result<Url, Failure> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|()| Failure::validation(format!("invalid api base {}", self.api_base)))?
            .pop_if_empty()
            .push("download-cleaned")
            .push(file_id.as_str());
        Ok(url)
    }
}

pub fn api_base(backend_url: &str) -> anyhow::Result<Url> {
    let trimmed = backend_url.trim().trim_end_matches('/');
    let base = Url::parse(&format!("{trimmed}/api/"))
        .map_err(|e| anyhow::anyhow!("invalid backend url '{backend_url}': {e}"))?;
    Ok(base)
}

#[async_trait]
impl AnalysisService for HttpAnalysisService {
    async fn upload(&self, file: &SelectedFile) -> Result<UploadInfo, Failure> {
        let url = self.endpoint("upload")?;
        info!(filename = file.name(), bytes = file.len(), "upload: sending dataset");
        if file.is_empty() {
            warn!(filename = file.name(), "upload: dataset is empty");
        }
        let part = multipart::Part::bytes(file.bytes().to_vec())
            .file_name(file.name().to_string())
            .mime_str("text/csv")
            .map_err(|e| transport_failure(Call::Upload, e))?;
        let form = multipart::Form::new().part("file", part);
        let response = self
            .http
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport_failure(Call::Upload, e))?;
        let info: UploadInfo = decode_json(Call::Upload, response).await?;
        info!(
            file_id = %info.file_id,
            rows = info.row_count,
            columns = info.column_count,
            "upload: accepted"
        );
        Ok(info)
    }

    async fn analyze(
        &self,
        file_id: &FileId,
        threshold: ThresholdPercentile,
    ) -> Result<AnalysisResult, Failure> {
        let url = self.endpoint("detect-outliers")?;
        info!(%file_id, %threshold, "detect-outliers: requesting analysis");
        let response = self
            .http
            .post(url)
            .json(&DetectOutliersRequest {
                file_id: file_id.clone(),
                threshold_percentile: threshold.value(),
            })
            .send()
            .await
            .map_err(|e| transport_failure(Call::Analyze, e))?;
        let body: DetectOutliersResponse = decode_json(Call::Analyze, response).await?;
        let result = AnalysisResult::try_from(body)?;
        info!(
            %file_id,
            total = result.total_records(),
            outliers = result.outliers_count(),
            "detect-outliers: completed"
        );
        Ok(result)
    }

    async fn fetch_cleaned(&self, file_id: &FileId) -> Result<Vec<u8>, Failure> {
        let url = self.download_url(file_id)?;
        debug!(%file_id, "download-cleaned: fetching");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| transport_failure(Call::FetchCleaned, e))?;
        let response = check_status(Call::FetchCleaned, response).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_failure(Call::FetchCleaned, e))?;
        info!(%file_id, bytes = bytes.len(), "download-cleaned: received");
        Ok(bytes.to_vec())
    }
}

async fn decode_json<T: serde::de::DeserializeOwned>(
    call: Call,
    response: Response,
) -> Result<T, Failure> {
    let response = check_status(call, response).await?;
    let bytes = response
        .bytes()
        .await
        .map_err(|e| transport_failure(call, e))?;
    serde_json::from_slice(&bytes).map_err(|e| {
        warn!(?call, error = %e, "malformed response body");
        Failure::new(
            call.malformed_kind(),
            format!("{}: unexpected response from analysis service", call.fallback_message()),
        )
    })
}

async fn check_status(call: Call, response: Response) -> Result<Response, Failure> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.bytes().await.unwrap_or_default();
    let message = serde_json::from_slice::<ErrorBody>(&body)
        .ok()
        .and_then(|body| body.message())
        .unwrap_or_else(|| call.fallback_message().to_string());
    let kind = call.kind_for_status(status);
    warn!(?call, %status, %kind, %message, "analysis service rejected request");
    Err(Failure::new(kind, message))
}

fn transport_failure(call: Call, err: reqwest::Error) -> Failure {
    warn!(?call, error = %err, "analysis service unreachable");
    let reason = if err.is_timeout() {
        "request timed out"
    } else if err.is_connect() {
        "could not connect to analysis service"
    } else {
        "network error"
    };
    Failure::transport(format!("{} ({reason})", call.fallback_message()))
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
