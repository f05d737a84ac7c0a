//! Display-ready values derived from a [`Session`]. Nothing here mutates state.

use shared::protocol::Visualizations;

use crate::session::{AnalysisResult, Session, SessionPhase};

/// Share of records flagged as outliers, in percent, rounded to one decimal.
pub fn outlier_percentage(result: &AnalysisResult) -> f64 {
    if result.total_records() == 0 {
        return 0.0;
    }
    round_one_decimal(result.outliers_count() as f64 / result.total_records() as f64 * 100.0)
}

pub fn cleaned_percentage(result: &AnalysisResult) -> f64 {
    round_one_decimal(100.0 - outlier_percentage(result))
}

fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisStats {
    pub total_records: u64,
    pub outliers_count: u64,
    pub cleaned_records: u64,
    pub outlier_percentage: f64,
    pub cleaned_percentage: f64,
}

impl From<&AnalysisResult> for AnalysisStats {
    fn from(result: &AnalysisResult) -> Self {
        Self {
            total_records: result.total_records(),
            outliers_count: result.outliers_count(),
            cleaned_records: result.cleaned_records(),
            outlier_percentage: outlier_percentage(result),
            cleaned_percentage: cleaned_percentage(result),
        }
    }
}

/// Which user actions make sense right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AvailableActions {
    pub upload: bool,
    pub detect_outliers: bool,
    pub confirm_removal: bool,
    pub cancel_decision: bool,
    pub download_cleaned: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub phase: SessionPhase,
    pub selected_filename: Option<String>,
    pub uploading: bool,
    pub upload_summary: Option<String>,
    pub stats: Option<AnalysisStats>,
    pub decision_prompt: Option<String>,
    pub visualizations: Option<Visualizations>,
    pub actions: AvailableActions,
}

impl SessionView {
    pub fn from_session(session: &Session) -> Self {
        let phase = session.phase();
        let result = session.analysis_result();
        Self {
            phase,
            selected_filename: session.selected_file().map(|file| file.name().to_string()),
            uploading: session.is_uploading(),
            upload_summary: session.upload_info().map(|info| {
                format!(
                    "{} - {} rows, {} columns",
                    info.filename, info.row_count, info.column_count
                )
            }),
            stats: result.map(AnalysisStats::from),
            decision_prompt: result.map(decision_prompt),
            visualizations: result.map(|r| r.visualizations().clone()),
            actions: AvailableActions {
                upload: phase == SessionPhase::FileSelected && !session.is_uploading(),
                detect_outliers: phase == SessionPhase::Uploaded,
                confirm_removal: phase == SessionPhase::Analyzed,
                cancel_decision: matches!(phase, SessionPhase::Analyzed | SessionPhase::Confirmed),
                download_cleaned: phase == SessionPhase::Confirmed,
            },
        }
    }
}

pub fn decision_prompt(result: &AnalysisResult) -> String {
    let count = result.outliers_count();
    let plural = if count == 1 { "" } else { "s" };
    format!("{count} outlier{plural} detected")
}
