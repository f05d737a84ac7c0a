use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use super::*;
use async_trait::async_trait;
use axum::{
    extract::Path,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use shared::{domain::FileId, protocol::Visualizations};
use tokio::{net::TcpListener, sync::Notify, time::timeout};

struct TestAnalysisService {
    upload_failure: Option<Failure>,
    analyze_failure: Option<Failure>,
    download_failure: Option<Failure>,
    analyze_counts: (u64, u64, u64),
    cleaned_bytes: Vec<u8>,
    upload_calls: Arc<AtomicUsize>,
    analyze_calls: Arc<AtomicUsize>,
    download_calls: Arc<AtomicUsize>,
    analyze_entered: Arc<Notify>,
    analyze_gate: Option<Arc<Notify>>,
    upload_gate: Option<Arc<Notify>>,
}

impl TestAnalysisService {
    fn ok() -> Self {
        Self {
            upload_failure: None,
            analyze_failure: None,
            download_failure: None,
            analyze_counts: (500, 25, 475),
            cleaned_bytes: b"a,b\n1,2\n".to_vec(),
            upload_calls: Arc::new(AtomicUsize::new(0)),
            analyze_calls: Arc::new(AtomicUsize::new(0)),
            download_calls: Arc::new(AtomicUsize::new(0)),
            analyze_entered: Arc::new(Notify::new()),
            analyze_gate: None,
            upload_gate: None,
        }
    }

    fn failing_upload(failure: Failure) -> Self {
        let mut service = Self::ok();
        service.upload_failure = Some(failure);
        service
    }

    fn failing_analysis(failure: Failure) -> Self {
        let mut service = Self::ok();
        service.analyze_failure = Some(failure);
        service
    }

    fn failing_download(failure: Failure) -> Self {
        let mut service = Self::ok();
        service.download_failure = Some(failure);
        service
    }

    fn with_counts(mut self, total: u64, outliers: u64, cleaned: u64) -> Self {
        self.analyze_counts = (total, outliers, cleaned);
        self
    }

    /// Analysis blocks until the returned gate is notified.
    fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.analyze_gate = Some(gate.clone());
        (self, gate)
    }

    /// Upload blocks until the returned gate is notified.
    fn gated_upload(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.upload_gate = Some(gate.clone());
        (self, gate)
    }
}

#[async_trait]
impl AnalysisService for TestAnalysisService {
    async fn upload(&self, file: &SelectedFile) -> Result<UploadInfo, Failure> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.upload_gate {
            gate.notified().await;
        }
        if let Some(failure) = &self.upload_failure {
            return Err(failure.clone());
        }
        Ok(UploadInfo {
            file_id: FileId("f1".into()),
            filename: file.name().to_string(),
            row_count: 500,
            column_count: 8,
        })
    }

    async fn analyze(
        &self,
        _file_id: &FileId,
        _threshold: ThresholdPercentile,
    ) -> Result<AnalysisResult, Failure> {
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        self.analyze_entered.notify_one();
        if let Some(gate) = &self.analyze_gate {
            gate.notified().await;
        }
        if let Some(failure) = &self.analyze_failure {
            return Err(failure.clone());
        }
        let (total, outliers, cleaned) = self.analyze_counts;
        AnalysisResult::new(total, outliers, cleaned, Visualizations::default())
    }

    async fn fetch_cleaned(&self, _file_id: &FileId) -> Result<Vec<u8>, Failure> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = &self.download_failure {
            return Err(failure.clone());
        }
        Ok(self.cleaned_bytes.clone())
    }
}

fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn failures(events: &[SessionEvent]) -> Vec<(Operation, ErrorKind, String)> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Failed {
                operation,
                kind,
                message,
            } => Some((*operation, *kind, message.clone())),
            _ => None,
        })
        .collect()
}

async fn uploaded(controller: &SessionController) {
    controller
        .select_file(b"a,b\n1,2\n".to_vec(), "data.csv")
        .await
        .expect("select");
    controller.upload().await.expect("upload");
}

async fn analyzed(controller: &SessionController) {
    uploaded(controller).await;
    controller.detect_outliers(95.0).await.expect("detect");
}

#[tokio::test]
async fn full_workflow_reaches_confirmed_and_downloads() {
    let service = Arc::new(TestAnalysisService::ok());
    let controller = SessionController::new(service.clone());
    let mut rx = controller.subscribe_events();

    controller
        .select_file(b"a,b\n1,2\n".to_vec(), "data.csv")
        .await
        .expect("select");
    assert_eq!(controller.phase().await, SessionPhase::FileSelected);

    let info = controller.upload().await.expect("upload");
    assert_eq!(info.file_id, FileId("f1".into()));
    assert_eq!((info.row_count, info.column_count), (500, 8));
    assert_eq!(controller.phase().await, SessionPhase::Uploaded);

    let result = controller.detect_outliers(95.0).await.expect("detect");
    assert_eq!(result.outliers_count(), 25);
    assert_eq!(controller.phase().await, SessionPhase::Analyzed);
    assert_eq!(outlier_percentage(&result), 5.0);

    controller.confirm_removal().await.expect("confirm");
    assert_eq!(controller.phase().await, SessionPhase::Confirmed);

    let cleaned = controller.download_cleaned().await.expect("download");
    assert_eq!(cleaned.filename, "cleaned_data.csv");
    assert_eq!(cleaned.bytes, b"a,b\n1,2\n".to_vec());

    let events = drain(&mut rx);
    assert!(failures(&events).is_empty());
    let successes: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Succeeded { message, .. } => Some(message.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        successes,
        vec![
            UPLOAD_SUCCESS_MESSAGE,
            DETECT_SUCCESS_MESSAGE,
            DOWNLOAD_SUCCESS_MESSAGE
        ]
    );
    assert!(events.contains(&SessionEvent::PhaseChanged(SessionPhase::Analyzing)));
}

#[tokio::test]
async fn rejects_files_without_required_extension() {
    let controller = SessionController::new(Arc::new(TestAnalysisService::ok()));
    let mut rx = controller.subscribe_events();

    let err = controller
        .select_file(b"x".to_vec(), "notes.txt")
        .await
        .expect_err("wrong extension");
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(controller.phase().await, SessionPhase::Empty);
    assert_eq!(
        failures(&drain(&mut rx)),
        vec![(
            Operation::SelectFile,
            ErrorKind::Validation,
            "Please select a valid CSV file".to_string()
        )]
    );

    uploaded(&controller).await;
    controller
        .select_file(b"x".to_vec(), "notes.txt")
        .await
        .expect_err("wrong extension");
    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.phase(), SessionPhase::Uploaded);
    assert_eq!(snapshot.selected_file().map(|f| f.name()), Some("data.csv"));
}

#[tokio::test]
async fn honours_configured_extension() {
    let controller =
        SessionController::with_required_extension(Arc::new(TestAnalysisService::ok()), ".tsv");
    controller
        .select_file(b"a\tb\n".to_vec(), "data.tsv")
        .await
        .expect("tsv accepted");
    let err = controller
        .select_file(b"a,b\n".to_vec(), "data.csv")
        .await
        .expect_err("csv rejected");
    assert_eq!(err.user_message(), "Please select a valid TSV file");
}

#[tokio::test]
async fn selecting_new_file_mid_flow_clears_results() {
    let controller = SessionController::new(Arc::new(TestAnalysisService::ok()));
    analyzed(&controller).await;
    controller.confirm_removal().await.expect("confirm");

    controller
        .select_file(b"c\n3\n".to_vec(), "second.csv")
        .await
        .expect("select");
    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.phase(), SessionPhase::FileSelected);
    assert!(snapshot.upload_info().is_none());
    assert!(snapshot.analysis_result().is_none());
    assert!(!snapshot.decision_confirmed());
}

#[tokio::test]
async fn upload_transport_failure_stays_in_file_selected() {
    let service = Arc::new(TestAnalysisService::failing_upload(Failure::transport(
        "Error uploading file (could not connect to analysis service)",
    )));
    let controller = SessionController::new(service.clone());
    let mut rx = controller.subscribe_events();
    controller
        .select_file(b"a\n1\n".to_vec(), "data.csv")
        .await
        .expect("select");

    let err = controller.upload().await.expect_err("transport");
    assert_eq!(err.kind(), ErrorKind::Transport);
    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.phase(), SessionPhase::FileSelected);
    assert!(snapshot.upload_info().is_none());
    assert!(!snapshot.is_uploading());
    assert_eq!(
        failures(&drain(&mut rx)),
        vec![(
            Operation::Upload,
            ErrorKind::Transport,
            "Error uploading file (could not connect to analysis service)".to_string()
        )]
    );

    controller.upload().await.expect_err("still failing");
    assert_eq!(service.upload_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn upload_without_file_never_calls_service() {
    let service = Arc::new(TestAnalysisService::ok());
    let controller = SessionController::new(service.clone());
    let err = controller.upload().await.expect_err("no file");
    assert!(matches!(
        err,
        SessionError::InvalidTransition {
            operation: Operation::Upload,
            phase: SessionPhase::Empty,
        }
    ));
    assert_eq!(service.upload_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn detect_processing_failure_returns_to_uploaded() {
    let controller = SessionController::new(Arc::new(TestAnalysisService::failing_analysis(
        Failure::processing("Error processing file: autoencoder failed"),
    )));
    uploaded(&controller).await;

    let err = controller.detect_outliers(95.0).await.expect_err("processing");
    assert_eq!(err.kind(), ErrorKind::Processing);
    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.phase(), SessionPhase::Uploaded);
    assert!(snapshot.analysis_result().is_none());
    assert!(!snapshot.is_analyzing());
}

#[tokio::test]
async fn inconsistent_counts_are_a_processing_failure() {
    let controller = SessionController::new(Arc::new(
        TestAnalysisService::ok().with_counts(100, 10, 80),
    ));
    uploaded(&controller).await;

    let err = controller.detect_outliers(95.0).await.expect_err("invariant");
    assert_eq!(err.kind(), ErrorKind::Processing);
    assert_eq!(controller.phase().await, SessionPhase::Uploaded);
}

#[tokio::test]
async fn out_of_range_threshold_is_rejected_locally() {
    let service = Arc::new(TestAnalysisService::ok());
    let controller = SessionController::new(service.clone());
    uploaded(&controller).await;

    for threshold in [0.0, 100.0, -5.0, f64::NAN] {
        let err = controller
            .detect_outliers(threshold)
            .await
            .expect_err("out of range");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
    assert_eq!(service.analyze_calls.load(Ordering::SeqCst), 0);
    assert_eq!(controller.phase().await, SessionPhase::Uploaded);

    controller.detect_outliers(99.5).await.expect("in range");
}

#[tokio::test]
async fn second_detect_while_in_flight_is_rejected_without_service_call() {
    let (service, gate) = TestAnalysisService::ok().gated();
    let service = Arc::new(service);
    let controller = Arc::new(SessionController::new(service.clone()));
    uploaded(&controller).await;

    let first = tokio::spawn({
        let controller = controller.clone();
        async move { controller.detect_outliers(95.0).await }
    });
    service.analyze_entered.notified().await;
    assert_eq!(controller.phase().await, SessionPhase::Analyzing);
    assert!(controller.view().await.stats.is_none());

    let err = controller
        .detect_outliers(95.0)
        .await
        .expect_err("already in flight");
    assert_eq!(err, SessionError::AnalysisInFlight);
    assert_eq!(service.analyze_calls.load(Ordering::SeqCst), 1);

    gate.notify_one();
    first.await.expect("join").expect("first analysis");
    assert_eq!(controller.phase().await, SessionPhase::Analyzed);
    assert_eq!(service.analyze_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn late_analysis_for_replaced_file_is_discarded() {
    let (service, gate) = TestAnalysisService::ok().gated();
    let service = Arc::new(service);
    let controller = Arc::new(SessionController::new(service.clone()));
    uploaded(&controller).await;
    let mut rx = controller.subscribe_events();

    let pending = tokio::spawn({
        let controller = controller.clone();
        async move { controller.detect_outliers(95.0).await }
    });
    service.analyze_entered.notified().await;
    controller
        .select_file(b"z\n9\n".to_vec(), "replacement.csv")
        .await
        .expect("select replacement");

    gate.notify_one();
    let err = pending.await.expect("join").expect_err("stale response");
    assert!(matches!(
        err,
        SessionError::Superseded {
            operation: Operation::DetectOutliers
        }
    ));

    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.phase(), SessionPhase::FileSelected);
    assert_eq!(
        snapshot.selected_file().map(|f| f.name()),
        Some("replacement.csv")
    );
    assert!(snapshot.analysis_result().is_none());
    assert!(failures(&drain(&mut rx)).is_empty());
}

#[tokio::test]
async fn reset_during_analysis_discards_response() {
    let (service, gate) = TestAnalysisService::ok().gated();
    let service = Arc::new(service);
    let controller = Arc::new(SessionController::new(service.clone()));
    uploaded(&controller).await;

    let pending = tokio::spawn({
        let controller = controller.clone();
        async move { controller.detect_outliers(95.0).await }
    });
    service.analyze_entered.notified().await;
    controller.reset().await;
    gate.notify_one();

    assert!(pending.await.expect("join").is_err());
    assert_eq!(controller.phase().await, SessionPhase::Empty);
}

#[tokio::test]
async fn confirm_outside_analyzed_is_rejected() {
    let controller = SessionController::new(Arc::new(TestAnalysisService::ok()));
    uploaded(&controller).await;
    let before = controller.snapshot().await;

    let err = controller.confirm_removal().await.expect_err("not analyzed");
    assert!(matches!(
        err,
        SessionError::InvalidTransition {
            operation: Operation::ConfirmRemoval,
            phase: SessionPhase::Uploaded,
        }
    ));
    assert_eq!(controller.snapshot().await, before);
}

#[tokio::test]
async fn cancel_decision_discards_everything() {
    let controller = SessionController::new(Arc::new(TestAnalysisService::ok()));
    analyzed(&controller).await;

    controller.cancel_decision().await.expect("cancel");
    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.phase(), SessionPhase::Empty);
    assert!(snapshot.selected_file().is_none());

    assert!(controller.cancel_decision().await.is_err());
}

#[tokio::test]
async fn download_is_repeatable_and_does_not_mutate() {
    let service = Arc::new(TestAnalysisService::ok());
    let controller = SessionController::new(service.clone());
    analyzed(&controller).await;

    controller
        .download_cleaned()
        .await
        .expect_err("needs confirmation");
    assert_eq!(service.download_calls.load(Ordering::SeqCst), 0);

    controller.confirm_removal().await.expect("confirm");
    let before = controller.snapshot().await;
    let first = controller.download_cleaned().await.expect("first");
    let second = controller.download_cleaned().await.expect("second");
    assert_eq!(first, second);
    assert_eq!(service.download_calls.load(Ordering::SeqCst), 2);
    assert_eq!(controller.snapshot().await, before);
}

#[tokio::test]
async fn detect_abandoned_by_timeout_can_be_retried() {
    let (service, gate) = TestAnalysisService::ok().gated();
    let service = Arc::new(service);
    let controller = SessionController::new(service.clone());
    uploaded(&controller).await;
    let mut rx = controller.subscribe_events();

    let elapsed = timeout(Duration::from_millis(50), controller.detect_outliers(95.0)).await;
    assert!(elapsed.is_err());
    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.phase(), SessionPhase::Uploaded);
    assert!(!snapshot.is_analyzing());
    assert_eq!(
        drain(&mut rx).last(),
        Some(&SessionEvent::PhaseChanged(SessionPhase::Uploaded))
    );

    gate.notify_one();
    controller.detect_outliers(95.0).await.expect("retry");
    assert_eq!(controller.phase().await, SessionPhase::Analyzed);
    assert_eq!(service.analyze_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn upload_abandoned_by_timeout_can_be_retried() {
    let (service, gate) = TestAnalysisService::ok().gated_upload();
    let service = Arc::new(service);
    let controller = SessionController::new(service.clone());
    controller
        .select_file(b"a,b\n1,2\n".to_vec(), "data.csv")
        .await
        .expect("select");

    assert!(timeout(Duration::from_millis(50), controller.upload())
        .await
        .is_err());
    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.phase(), SessionPhase::FileSelected);
    assert!(!snapshot.is_uploading());

    gate.notify_one();
    controller.upload().await.expect("retry");
    assert_eq!(controller.phase().await, SessionPhase::Uploaded);
    assert_eq!(service.upload_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_download_reports_and_stays_confirmed() {
    let service = Arc::new(TestAnalysisService::failing_download(Failure::not_found(
        "Cleaned file not found",
    )));
    let controller = SessionController::new(service.clone());
    analyzed(&controller).await;
    controller.confirm_removal().await.expect("confirm");
    let before = controller.snapshot().await;
    let mut rx = controller.subscribe_events();

    let err = controller.download_cleaned().await.expect_err("missing");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(controller.snapshot().await, before);
    assert_eq!(
        failures(&drain(&mut rx)),
        vec![(
            Operation::DownloadCleaned,
            ErrorKind::NotFound,
            "Cleaned file not found".to_string()
        )]
    );
    assert_eq!(service.download_calls.load(Ordering::SeqCst), 1);
}

async fn spawn_analysis_server() -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route(
            "/api/upload",
            post(|| async {
                Json(json!({"file_id": "f1", "filename": "data.csv", "rows": 500, "columns": 8}))
            }),
        )
        .route(
            "/api/detect-outliers",
            post(|| async {
                Json(json!({
                    "total_records": 500,
                    "outliers_count": 25,
                    "cleaned_records": 475,
                    "visualizations": {
                        "scatter_plot": "AAEC",
                        "error_distribution": "AwQF",
                        "feature_distribution": "BgcI"
                    }
                }))
            }),
        )
        .route(
            "/api/download-cleaned/:file_id",
            get(|Path(file_id): Path<String>| async move { format!("cleaned,{file_id}\n") }),
        );
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn end_to_end_over_http() {
    let base = spawn_analysis_server().await;
    let settings = config::Settings {
        backend_url: base,
        ..config::Settings::default()
    };
    let controller = SessionController::from_settings(&settings).expect("controller");

    controller
        .select_file(b"a,b\n1,2\n".to_vec(), "data.csv")
        .await
        .expect("select");
    controller.upload().await.expect("upload");
    controller
        .detect_outliers(settings.threshold_percentile)
        .await
        .expect("detect");

    let view = controller.view().await;
    assert_eq!(view.phase, SessionPhase::Analyzed);
    assert_eq!(view.stats.as_ref().map(|s| s.outlier_percentage), Some(5.0));
    assert_eq!(
        view.visualizations.map(|v| v.scatter_plot),
        Some("AAEC".to_string())
    );

    controller.confirm_removal().await.expect("confirm");
    let cleaned = controller.download_cleaned().await.expect("download");
    assert_eq!(cleaned.bytes, b"cleaned,f1\n".to_vec());
    assert_eq!(cleaned.filename, "cleaned_data.csv");
}
