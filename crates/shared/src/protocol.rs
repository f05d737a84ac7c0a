use serde::{Deserialize, Serialize};

use crate::domain::FileId;

/// Metadata returned by `POST /api/upload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadInfo {
    pub file_id: FileId,
    pub filename: String,
    #[serde(rename = "rows", alias = "row_count")]
    pub row_count: u64,
    #[serde(rename = "columns", alias = "column_count")]
    pub column_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectOutliersRequest {
    pub file_id: FileId,
    pub threshold_percentile: f64,
}

/// Base64-encoded PNG payloads. Never decoded by the session core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visualizations {
    pub scatter_plot: String,
    pub error_distribution: String,
    pub feature_distribution: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectOutliersResponse {
    pub total_records: u64,
    pub outliers_count: u64,
    pub cleaned_records: u64,
    pub visualizations: Visualizations,
}

/// Error body shape used by the analysis service (`{"detail": ...}`).
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl ErrorBody {
    /// Human-readable detail; structured details are rendered as compact JSON.
    pub fn message(&self) -> Option<String> {
        match &self.detail {
            serde_json::Value::Null => None,
            serde_json::Value::String(text) if text.trim().is_empty() => None,
            serde_json::Value::String(text) => Some(text.clone()),
            other => Some(other.to_string()),
        }
    }
}
