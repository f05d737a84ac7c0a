use std::sync::Arc;

use shared::{
    domain::ThresholdPercentile,
    error::{ErrorKind, Failure},
    protocol::UploadInfo,
};
use tokio::{
    runtime::Handle,
    sync::{broadcast, Mutex},
};
use tracing::{debug, info, warn};

pub mod config;
pub mod gateway;
pub mod projection;
pub mod session;

pub use gateway::{AnalysisService, HttpAnalysisService};
pub use projection::{outlier_percentage, SessionView};
pub use session::{
    AnalysisResult, Operation, SelectedFile, Session, SessionError, SessionPhase, SessionToken,
};

pub const UPLOAD_SUCCESS_MESSAGE: &str = "File uploaded successfully!";
pub const DETECT_SUCCESS_MESSAGE: &str = "Outlier detection completed!";
pub const DOWNLOAD_SUCCESS_MESSAGE: &str = "Cleaned dataset downloaded!";

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications for whoever renders the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PhaseChanged(SessionPhase),
    Succeeded {
        operation: Operation,
        message: String,
    },
    Failed {
        operation: Operation,
        kind: ErrorKind,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanedDataset {
    pub filename: String,
    pub bytes: Vec<u8>,
}

pub struct SessionController {
    service: Arc<dyn AnalysisService>,
    required_extension: String,
    inner: Arc<Mutex<Session>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    pub fn new(service: Arc<dyn AnalysisService>) -> Self {
        Self::with_required_extension(service, ".csv")
    }

    pub fn with_required_extension(
        service: Arc<dyn AnalysisService>,
        required_extension: impl Into<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            service,
            required_extension: required_extension.into(),
            inner: Arc::new(Mutex::new(Session::new())),
            events,
        }
    }

    pub fn from_settings(settings: &config::Settings) -> anyhow::Result<Self> {
        let service =
            HttpAnalysisService::new(&settings.backend_url, settings.request_timeout())?;
        Ok(Self::with_required_extension(
            Arc::new(service),
            settings.required_extension.clone(),
        ))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> Session {
        self.inner.lock().await.clone()
    }

    pub async fn phase(&self) -> SessionPhase {
        self.inner.lock().await.phase()
    }

    pub async fn view(&self) -> SessionView {
        SessionView::from_session(&*self.inner.lock().await)
    }

    /// Starts a fresh session around `bytes`. A name without the required
    /// extension leaves the current session untouched.
    pub async fn select_file(
        &self,
        bytes: impl Into<Arc<[u8]>>,
        name: impl Into<String>,
    ) -> Result<(), SessionError> {
        let file = SelectedFile::new(name, bytes);
        if !file.has_extension(&self.required_extension) {
            let failure = Failure::validation(format!(
                "Please select a valid {} file",
                self.required_extension
                    .trim_start_matches('.')
                    .to_ascii_uppercase()
            ));
            return Err(self.report(Operation::SelectFile, failure.into()));
        }
        info!(filename = file.name(), bytes = file.len(), "session: file selected");
        self.inner.lock().await.select_file(file);
        self.phase_changed(SessionPhase::FileSelected);
        Ok(())
    }

    pub async fn upload(&self) -> Result<UploadInfo, SessionError> {
        let pending = self
            .inner
            .lock()
            .await
            .begin_upload()
            .map_err(|err| self.report(Operation::Upload, err))?;
        let guard = self.in_flight(Operation::Upload, pending.token);

        let outcome = self.service.upload(&pending.file).await;
        let applied = {
            let mut session = self.inner.lock().await;
            guard.disarm();
            session.finish_upload(pending.token, outcome)
        };
        match applied {
            Ok(info) => {
                info!(file_id = %info.file_id, "session: uploaded");
                self.phase_changed(SessionPhase::Uploaded);
                self.succeeded(Operation::Upload, UPLOAD_SUCCESS_MESSAGE);
                Ok(info)
            }
            Err(err) => Err(self.report(Operation::Upload, err)),
        }
    }

    /// Runs server-side outlier detection. At most one analysis is in flight
    /// per session; a concurrent call is rejected before reaching the service.
    pub async fn detect_outliers(
        &self,
        threshold_percentile: f64,
    ) -> Result<AnalysisResult, SessionError> {
        let threshold = ThresholdPercentile::new(threshold_percentile)
            .map_err(|failure| self.report(Operation::DetectOutliers, failure.into()))?;
        let pending = self
            .inner
            .lock()
            .await
            .begin_analysis(threshold)
            .map_err(|err| self.report(Operation::DetectOutliers, err))?;
        info!(file_id = %pending.file_id, %threshold, "session: analyzing");
        self.phase_changed(SessionPhase::Analyzing);
        let guard = self.in_flight(Operation::DetectOutliers, pending.token);

        let outcome = self.service.analyze(&pending.file_id, threshold).await;
        let applied = {
            let mut session = self.inner.lock().await;
            guard.disarm();
            session.finish_analysis(pending.token, outcome)
        };
        match applied {
            Ok(result) => {
                info!(
                    total = result.total_records(),
                    outliers = result.outliers_count(),
                    "session: analyzed"
                );
                self.phase_changed(SessionPhase::Analyzed);
                self.succeeded(Operation::DetectOutliers, DETECT_SUCCESS_MESSAGE);
                Ok(result)
            }
            Err(err) => {
                if err.is_user_facing() {
                    self.phase_changed(SessionPhase::Uploaded);
                }
                Err(self.report(Operation::DetectOutliers, err))
            }
        }
    }

    pub async fn confirm_removal(&self) -> Result<(), SessionError> {
        self.inner
            .lock()
            .await
            .confirm_removal()
            .map_err(|err| self.report(Operation::ConfirmRemoval, err))?;
        info!("session: outlier removal confirmed");
        self.phase_changed(SessionPhase::Confirmed);
        Ok(())
    }

    pub async fn cancel_decision(&self) -> Result<(), SessionError> {
        self.inner
            .lock()
            .await
            .cancel_decision()
            .map_err(|err| self.report(Operation::CancelDecision, err))?;
        info!("session: decision cancelled, starting over");
        self.phase_changed(SessionPhase::Empty);
        Ok(())
    }

    pub async fn reset(&self) {
        self.inner.lock().await.reset();
        debug!("session: reset");
        self.phase_changed(SessionPhase::Empty);
    }

    /// Fetches the cleaned dataset. Repeatable; the session is left as is.
    pub async fn download_cleaned(&self) -> Result<CleanedDataset, SessionError> {
        let target = self
            .inner
            .lock()
            .await
            .download_target()
            .map_err(|err| self.report(Operation::DownloadCleaned, err))?;
        let bytes = self
            .service
            .fetch_cleaned(&target.file_id)
            .await
            .map_err(|failure| self.report(Operation::DownloadCleaned, failure.into()))?;
        info!(filename = %target.filename, bytes = bytes.len(), "session: cleaned dataset fetched");
        self.succeeded(Operation::DownloadCleaned, DOWNLOAD_SUCCESS_MESSAGE);
        Ok(CleanedDataset {
            filename: target.filename,
            bytes,
        })
    }

    fn in_flight(&self, operation: Operation, token: SessionToken) -> InFlightGuard {
        InFlightGuard {
            session: self.inner.clone(),
            events: self.events.clone(),
            operation,
            token,
            armed: true,
        }
    }

    fn report(&self, operation: Operation, err: SessionError) -> SessionError {
        if err.is_user_facing() {
            warn!(%operation, kind = %err.kind(), error = %err, "session: operation failed");
            let _ = self.events.send(SessionEvent::Failed {
                operation,
                kind: err.kind(),
                message: err.user_message(),
            });
        } else {
            debug!(%operation, error = %err, "session: discarded stale response");
        }
        err
    }

    fn succeeded(&self, operation: Operation, message: &str) {
        let _ = self.events.send(SessionEvent::Succeeded {
            operation,
            message: message.to_string(),
        });
    }

    fn phase_changed(&self, phase: SessionPhase) {
        let _ = self.events.send(SessionEvent::PhaseChanged(phase));
    }
}

/// Undoes a `begin_*` transition when the call's future is dropped before its
/// response is applied, e.g. when a caller's timeout fires mid-request.
struct InFlightGuard {
    session: Arc<Mutex<Session>>,
    events: broadcast::Sender<SessionEvent>,
    operation: Operation,
    token: SessionToken,
    armed: bool,
}

impl InFlightGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let (operation, token) = (self.operation, self.token);
        if let Ok(mut session) = self.session.try_lock() {
            roll_back(&mut session, &self.events, operation, token);
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!(%operation, "session: abandoned call outside a runtime; not rolled back");
            return;
        };
        let session = self.session.clone();
        let events = self.events.clone();
        handle.spawn(async move {
            roll_back(&mut *session.lock().await, &events, operation, token);
        });
    }
}

fn roll_back(
    session: &mut Session,
    events: &broadcast::Sender<SessionEvent>,
    operation: Operation,
    token: SessionToken,
) {
    let restored = match operation {
        Operation::Upload => session
            .abandon_upload(token)
            .then_some(SessionPhase::FileSelected),
        Operation::DetectOutliers => session
            .abandon_analysis(token)
            .then_some(SessionPhase::Uploaded),
        _ => None,
    };
    if let Some(phase) = restored {
        warn!(%operation, %phase, "session: call abandoned before completion; rolled back");
        let _ = events.send(SessionEvent::PhaseChanged(phase));
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
