//! Single-session record and its legal transitions.
//!
//! Every transition here is synchronous and free of I/O. Calls to the
//! analysis service happen in two halves: a `begin_*` method that checks the
//! preconditions and hands back a ticket, and a `finish_*` method that applies
//! the service outcome only if the session has not been reset in between.

use std::{fmt, sync::Arc};

use shared::{
    domain::{FileId, ThresholdPercentile},
    error::{ErrorKind, Failure},
    protocol::{DetectOutliersResponse, UploadInfo, Visualizations},
};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
    Empty,
    FileSelected,
    Uploaded,
    Analyzing,
    Analyzed,
    Confirmed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Empty => "empty",
            Self::FileSelected => "file selected",
            Self::Uploaded => "uploaded",
            Self::Analyzing => "analyzing",
            Self::Analyzed => "analyzed",
            Self::Confirmed => "confirmed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    SelectFile,
    Upload,
    DetectOutliers,
    ConfirmRemoval,
    CancelDecision,
    DownloadCleaned,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::SelectFile => "select_file",
            Self::Upload => "upload",
            Self::DetectOutliers => "detect_outliers",
            Self::ConfirmRemoval => "confirm_removal",
            Self::CancelDecision => "cancel_decision",
            Self::DownloadCleaned => "download_cleaned",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("cannot {operation} while the session is {phase}")]
    InvalidTransition {
        operation: Operation,
        phase: SessionPhase,
    },
    #[error("outlier detection is already running for this dataset")]
    AnalysisInFlight,
    #[error("the dataset is already being uploaded")]
    UploadInFlight,
    #[error("session was reset while {operation} was in flight; response discarded")]
    Superseded { operation: Operation },
    #[error(transparent)]
    Failure(#[from] Failure),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Failure(failure) => failure.kind,
            Self::InvalidTransition { .. }
            | Self::AnalysisInFlight
            | Self::UploadInFlight
            | Self::Superseded { .. } => ErrorKind::Validation,
        }
    }

    /// Text for the failure notification, without the kind prefix.
    pub fn user_message(&self) -> String {
        match self {
            Self::Failure(failure) => failure.message.clone(),
            other => other.to_string(),
        }
    }

    /// Late responses for a reset session are dropped quietly.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, Self::Superseded { .. })
    }
}

/// Changes whenever the session is reset or a new file is selected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionToken(pub u64);

impl SessionToken {
    fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// A user-chosen dataset: its filename and raw contents.
#[derive(Clone, PartialEq, Eq)]
pub struct SelectedFile {
    name: String,
    bytes: Arc<[u8]>,
}

impl SelectedFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn has_extension(&self, extension: &str) -> bool {
        self.name.ends_with(extension)
    }
}

impl fmt::Debug for SelectedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectedFile")
            .field("name", &self.name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Outcome of a server-side outlier analysis. Only constructible when the
/// counts add up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisResult {
    total_records: u64,
    outliers_count: u64,
    cleaned_records: u64,
    visualizations: Visualizations,
}

impl AnalysisResult {
    pub fn new(
        total_records: u64,
        outliers_count: u64,
        cleaned_records: u64,
        visualizations: Visualizations,
    ) -> Result<Self, Failure> {
        if outliers_count.checked_add(cleaned_records) != Some(total_records) {
            return Err(Failure::processing(format!(
                "inconsistent analysis result: {outliers_count} outliers + {cleaned_records} cleaned records != {total_records} total records"
            )));
        }
        Ok(Self {
            total_records,
            outliers_count,
            cleaned_records,
            visualizations,
        })
    }

    pub fn total_records(&self) -> u64 {
        self.total_records
    }

    pub fn outliers_count(&self) -> u64 {
        self.outliers_count
    }

    pub fn cleaned_records(&self) -> u64 {
        self.cleaned_records
    }

    pub fn visualizations(&self) -> &Visualizations {
        &self.visualizations
    }
}

impl TryFrom<DetectOutliersResponse> for AnalysisResult {
    type Error = Failure;

    fn try_from(value: DetectOutliersResponse) -> Result<Self, Self::Error> {
        Self::new(
            value.total_records,
            value.outliers_count,
            value.cleaned_records,
            value.visualizations,
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpload {
    pub token: SessionToken,
    pub file: SelectedFile,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingAnalysis {
    pub token: SessionToken,
    pub file_id: FileId,
    pub threshold: ThresholdPercentile,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadTarget {
    pub file_id: FileId,
    pub filename: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
enum Stage {
    #[default]
    Empty,
    FileSelected {
        file: SelectedFile,
        uploading: bool,
    },
    Uploaded {
        file: SelectedFile,
        upload: UploadInfo,
    },
    Analyzing {
        file: SelectedFile,
        upload: UploadInfo,
    },
    Analyzed {
        file: SelectedFile,
        upload: UploadInfo,
        result: AnalysisResult,
    },
    Confirmed {
        file: SelectedFile,
        upload: UploadInfo,
        result: AnalysisResult,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    stage: Stage,
    token: SessionToken,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> SessionPhase {
        match &self.stage {
            Stage::Empty => SessionPhase::Empty,
            Stage::FileSelected { .. } => SessionPhase::FileSelected,
            Stage::Uploaded { .. } => SessionPhase::Uploaded,
            Stage::Analyzing { .. } => SessionPhase::Analyzing,
            Stage::Analyzed { .. } => SessionPhase::Analyzed,
            Stage::Confirmed { .. } => SessionPhase::Confirmed,
        }
    }

    pub fn token(&self) -> SessionToken {
        self.token
    }

    pub fn selected_file(&self) -> Option<&SelectedFile> {
        match &self.stage {
            Stage::Empty => None,
            Stage::FileSelected { file, .. }
            | Stage::Uploaded { file, .. }
            | Stage::Analyzing { file, .. }
            | Stage::Analyzed { file, .. }
            | Stage::Confirmed { file, .. } => Some(file),
        }
    }

    pub fn upload_info(&self) -> Option<&UploadInfo> {
        match &self.stage {
            Stage::Empty | Stage::FileSelected { .. } => None,
            Stage::Uploaded { upload, .. }
            | Stage::Analyzing { upload, .. }
            | Stage::Analyzed { upload, .. }
            | Stage::Confirmed { upload, .. } => Some(upload),
        }
    }

    pub fn analysis_result(&self) -> Option<&AnalysisResult> {
        match &self.stage {
            Stage::Analyzed { result, .. } | Stage::Confirmed { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn decision_confirmed(&self) -> bool {
        matches!(self.stage, Stage::Confirmed { .. })
    }

    pub fn is_uploading(&self) -> bool {
        matches!(self.stage, Stage::FileSelected { uploading: true, .. })
    }

    pub fn is_analyzing(&self) -> bool {
        matches!(self.stage, Stage::Analyzing { .. })
    }

    /// Replaces whatever the session held with a freshly selected file.
    pub fn select_file(&mut self, file: SelectedFile) {
        self.token = self.token.next();
        self.stage = Stage::FileSelected {
            file,
            uploading: false,
        };
    }

    pub fn reset(&mut self) {
        self.token = self.token.next();
        self.stage = Stage::Empty;
    }

    pub fn begin_upload(&mut self) -> Result<PendingUpload, SessionError> {
        let token = self.token;
        if let Stage::FileSelected { file, uploading } = &mut self.stage {
            if *uploading {
                return Err(SessionError::UploadInFlight);
            }
            *uploading = true;
            return Ok(PendingUpload {
                token,
                file: file.clone(),
            });
        }
        Err(self.invalid(Operation::Upload))
    }

    pub fn finish_upload(
        &mut self,
        token: SessionToken,
        outcome: Result<UploadInfo, Failure>,
    ) -> Result<UploadInfo, SessionError> {
        if token != self.token {
            return Err(SessionError::Superseded {
                operation: Operation::Upload,
            });
        }
        let file = match std::mem::take(&mut self.stage) {
            Stage::FileSelected {
                file,
                uploading: true,
            } => file,
            other => {
                self.stage = other;
                return Err(self.invalid(Operation::Upload));
            }
        };
        match outcome {
            Ok(upload) => {
                self.stage = Stage::Uploaded {
                    file,
                    upload: upload.clone(),
                };
                Ok(upload)
            }
            Err(failure) => {
                self.stage = Stage::FileSelected {
                    file,
                    uploading: false,
                };
                Err(failure.into())
            }
        }
    }

    /// Clears the in-flight upload mark when its response will never be
    /// applied. Returns false if the session moved on in the meantime.
    pub fn abandon_upload(&mut self, token: SessionToken) -> bool {
        if token != self.token {
            return false;
        }
        match &mut self.stage {
            Stage::FileSelected { uploading, .. } if *uploading => {
                *uploading = false;
                true
            }
            _ => false,
        }
    }

    pub fn begin_analysis(
        &mut self,
        threshold: ThresholdPercentile,
    ) -> Result<PendingAnalysis, SessionError> {
        match std::mem::take(&mut self.stage) {
            Stage::Uploaded { file, upload } => {
                let pending = PendingAnalysis {
                    token: self.token,
                    file_id: upload.file_id.clone(),
                    threshold,
                };
                self.stage = Stage::Analyzing { file, upload };
                Ok(pending)
            }
            other => {
                self.stage = other;
                if self.is_analyzing() {
                    Err(SessionError::AnalysisInFlight)
                } else {
                    Err(self.invalid(Operation::DetectOutliers))
                }
            }
        }
    }

    pub fn finish_analysis(
        &mut self,
        token: SessionToken,
        outcome: Result<AnalysisResult, Failure>,
    ) -> Result<AnalysisResult, SessionError> {
        if token != self.token {
            return Err(SessionError::Superseded {
                operation: Operation::DetectOutliers,
            });
        }
        let (file, upload) = match std::mem::take(&mut self.stage) {
            Stage::Analyzing { file, upload } => (file, upload),
            other => {
                self.stage = other;
                return Err(self.invalid(Operation::DetectOutliers));
            }
        };
        match outcome {
            Ok(result) => {
                self.stage = Stage::Analyzed {
                    file,
                    upload,
                    result: result.clone(),
                };
                Ok(result)
            }
            Err(failure) => {
                self.stage = Stage::Uploaded { file, upload };
                Err(failure.into())
            }
        }
    }

    /// Moves an analysis whose response will never be applied back to
    /// Uploaded. Returns false if the session moved on in the meantime.
    pub fn abandon_analysis(&mut self, token: SessionToken) -> bool {
        if token != self.token {
            return false;
        }
        match std::mem::take(&mut self.stage) {
            Stage::Analyzing { file, upload } => {
                self.stage = Stage::Uploaded { file, upload };
                true
            }
            other => {
                self.stage = other;
                false
            }
        }
    }

    pub fn confirm_removal(&mut self) -> Result<(), SessionError> {
        match std::mem::take(&mut self.stage) {
            Stage::Analyzed {
                file,
                upload,
                result,
            } => {
                self.stage = Stage::Confirmed {
                    file,
                    upload,
                    result,
                };
                Ok(())
            }
            other => {
                self.stage = other;
                Err(self.invalid(Operation::ConfirmRemoval))
            }
        }
    }

    pub fn cancel_decision(&mut self) -> Result<(), SessionError> {
        match self.stage {
            Stage::Analyzed { .. } | Stage::Confirmed { .. } => {
                self.reset();
                Ok(())
            }
            _ => Err(self.invalid(Operation::CancelDecision)),
        }
    }

    /// Where the cleaned dataset can be fetched from. Does not change state.
    pub fn download_target(&self) -> Result<DownloadTarget, SessionError> {
        match &self.stage {
            Stage::Confirmed { file, upload, .. } => Ok(DownloadTarget {
                file_id: upload.file_id.clone(),
                filename: cleaned_filename(file.name()),
            }),
            _ => Err(self.invalid(Operation::DownloadCleaned)),
        }
    }

    fn invalid(&self, operation: Operation) -> SessionError {
        SessionError::InvalidTransition {
            operation,
            phase: self.phase(),
        }
    }
}

pub fn cleaned_filename(original: &str) -> String {
    format!("cleaned_{original}")
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
