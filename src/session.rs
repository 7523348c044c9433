use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::ImageAsset;
use crate::engine::{EngineState, InferenceEngine, OutputBinding};
use crate::errors::{Result, SonoSegError};
use crate::interpreter::AnalysisResult;
use crate::overlay::{self, Surface, Threshold};
use crate::pipeline::AnalysisPipeline;
use crate::state::{Event, ToolState};
use crate::traits::SessionLoader;
use crate::upload::{Upload, UploadPolicy, UploadRejection};

/// What became of one submitted file.
#[derive(Debug, Clone)]
pub enum AnalysisOutcome {
    /// The upload guard refused the file; no decoding or inference took place.
    Rejected(UploadRejection),
    Completed(Arc<AnalysisResult>),
    Failed { message: String },
    /// A reset or a newer upload replaced this request before it finished.
    Superseded,
}

/// Point-in-time copy of everything a surface needs to draw the tool.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: ToolState,
    pub engine: EngineState,
    pub error: Option<String>,
    pub result: Option<Arc<AnalysisResult>>,
    pub threshold: Threshold,
    pub request_id: u64,
}

impl SessionSnapshot {
    pub fn status_text(&self) -> &'static str {
        self.state.status_text()
    }
}

#[derive(Default)]
struct Request {
    id: u64,
    cancel: Option<CancellationToken>,
}

impl Request {
    /// Cancels whatever is in flight and makes any late completion stale.
    fn supersede(&mut self) -> u64 {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        self.id += 1;
        self.id
    }

    fn is_current(&self, id: u64) -> bool {
        self.id == id
    }
}

struct Inner {
    state: ToolState,
    error: Option<String>,
    result: Option<Arc<AnalysisResult>>,
    asset: Option<Arc<ImageAsset>>,
    threshold: Threshold,
    request: Request,
}

impl Inner {
    fn apply(&mut self, event: Event) -> Result<ToolState> {
        let next = self
            .state
            .on(event)
            .ok_or_else(|| invalid_transition(self.state, event))?;
        if next != self.state {
            debug!(from = %self.state, to = %next, %event, "tool state changed");
        }
        self.state = next;
        Ok(next)
    }

    fn clear(&mut self) {
        self.error = None;
        self.result = None;
        self.asset = None;
    }
}

fn invalid_transition(state: ToolState, event: impl ToString) -> SonoSegError {
    SonoSegError::InvalidTransition {
        state: state.to_string(),
        event: event.to_string(),
    }
}

/// The analysis tool: owns the lifecycle, the current result and every user-facing message.
///
/// All methods take `&self`; state lives behind a short-lived lock that is never held across an
/// await, so a reset can land while an analysis is in flight.
pub struct AnalysisSession<L: SessionLoader> {
    pipeline: AnalysisPipeline<L>,
    policy: UploadPolicy,
    inner: Mutex<Inner>,
}

impl<L: SessionLoader> AnalysisSession<L> {
    pub fn new(engine: Arc<InferenceEngine<L>>, policy: UploadPolicy, binding: OutputBinding) -> Self {
        Self {
            pipeline: AnalysisPipeline::new(engine, binding),
            policy,
            inner: Mutex::new(Inner {
                state: ToolState::InitialLoading,
                error: None,
                result: None,
                asset: None,
                threshold: Threshold::default(),
                request: Request::default(),
            }),
        }
    }

    pub fn engine(&self) -> &Arc<InferenceEngine<L>> {
        self.pipeline.engine()
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    pub fn state(&self) -> ToolState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock();
        SessionSnapshot {
            state: inner.state,
            engine: self.engine().state(),
            error: inner.error.clone(),
            result: inner.result.clone(),
            threshold: inner.threshold,
            request_id: inner.request.id,
        }
    }

    /// Loads the model. Only valid in `InitialLoading`.
    pub async fn initialize(&self) -> Result<()> {
        let state = self.state();
        if state != ToolState::InitialLoading {
            return Err(invalid_transition(state, "initialize"));
        }
        self.load().await
    }

    /// Explicit retry after a failed load.
    pub async fn retry_load(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            inner.apply(Event::RetryLoad)?;
            inner.clear();
        }
        self.load().await
    }

    async fn load(&self) -> Result<()> {
        let loaded = self.engine().load_model().await;

        let mut inner = self.inner.lock();
        if inner.state != ToolState::InitialLoading {
            debug!(state = %inner.state, "load finished after the tool moved on");
            return loaded;
        }
        match &loaded {
            Ok(()) => {
                inner.apply(Event::LoadSucceeded)?;
                inner.error = None;
                info!("analysis tool ready");
            }
            Err(e) => {
                inner.apply(Event::LoadFailed)?;
                inner.error = Some(e.user_message());
            }
        }
        loaded
    }

    /// Validates `upload` and, if it passes the guard, runs the full analysis on it.
    ///
    /// Selecting a file while an analysis or model load is in progress is an
    /// `InvalidTransition`. Everything else is reported through the outcome.
    ///
    /// A rejected upload keeps any result on display and records the rejection as the error
    /// until the next threshold change or upload.
    pub async fn submit(&self, upload: Upload) -> Result<AnalysisOutcome> {
        let (request_id, cancel) = {
            let mut inner = self.inner.lock();
            if !inner.state.accepts_upload() {
                return Err(invalid_transition(inner.state, Event::FileAccepted));
            }

            let guard = if self.engine().is_ready() {
                self.policy.check(&upload)
            } else {
                Err(UploadRejection::ModelNotReady)
            };
            if let Err(rejection) = guard {
                inner.apply(Event::FileRejected)?;
                inner.error = Some(rejection.to_string());
                info!(file = %upload.name, reason = %rejection, "upload rejected");
                return Ok(AnalysisOutcome::Rejected(rejection));
            }

            inner.apply(Event::FileAccepted)?;
            inner.clear();
            let request_id = inner.request.supersede();
            let cancel = CancellationToken::new();
            inner.request.cancel = Some(cancel.clone());
            (request_id, cancel)
        };

        info!(request_id, file = %upload.name, size = upload.size(), "analysis started");
        let analysis = self.pipeline.analyze(upload, &cancel).await;

        let mut inner = self.inner.lock();
        if !inner.request.is_current(request_id) || cancel.is_cancelled() {
            debug!(request_id, "discarding superseded analysis");
            return Ok(AnalysisOutcome::Superseded);
        }
        inner.request.cancel = None;

        match analysis {
            Ok(analysis) => {
                inner.apply(Event::InferenceSucceeded)?;
                let result = Arc::new(analysis.result);
                inner.result = Some(Arc::clone(&result));
                inner.asset = Some(Arc::new(analysis.asset));
                info!(request_id, "{}", result.summary());
                Ok(AnalysisOutcome::Completed(result))
            }
            Err(SonoSegError::Cancelled { .. }) => Ok(AnalysisOutcome::Superseded),
            Err(e) => {
                inner.apply(Event::InferenceFailed)?;
                let message = e.user_message();
                warn!(request_id, error = %message, "analysis failed");
                inner.error = Some(message.clone());
                Ok(AnalysisOutcome::Failed { message })
            }
        }
    }

    /// Changes the overlay threshold. Never re-runs inference.
    ///
    /// Also dismisses the message left by an upload rejected while results were shown.
    pub fn set_threshold(&self, value: f32) -> Result<Threshold> {
        let mut inner = self.inner.lock();
        if inner.state.on(Event::ThresholdChanged).is_none() {
            return Err(invalid_transition(inner.state, Event::ThresholdChanged));
        }
        let threshold = Threshold::new(value)?;
        inner.apply(Event::ThresholdChanged)?;
        inner.threshold = threshold;
        inner.error = None;
        Ok(threshold)
    }

    /// Draws the current image and mask at the current threshold onto `surface`.
    ///
    /// A surface failure moves the tool to `ProcessingError` and discards the result.
    pub fn render_overlay<S: Surface + ?Sized>(&self, surface: &mut S) -> Result<()> {
        let (request_id, asset, result, threshold) = {
            let inner = self.inner.lock();
            match (inner.state, &inner.asset, &inner.result) {
                (ToolState::ShowingResults, Some(asset), Some(result)) => (
                    inner.request.id,
                    Arc::clone(asset),
                    Arc::clone(result),
                    inner.threshold,
                ),
                (state, ..) => return Err(invalid_transition(state, "render the overlay")),
            }
        };

        let rendered = overlay::render(
            surface,
            asset.pixels(),
            &result.segmentation_mask,
            threshold,
        );

        if let Err(e) = &rendered {
            let mut inner = self.inner.lock();
            if inner.request.is_current(request_id) && inner.state == ToolState::ShowingResults {
                inner.apply(Event::RenderFailed)?;
                inner.clear();
                inner.error = Some(e.user_message());
                warn!(request_id, error = %e, "overlay rendering failed");
            }
        }
        rendered
    }

    /// Clears image, result, error and threshold, cancelling any analysis in flight.
    ///
    /// If the model is not loaded the reset turns into a reload through `InitialLoading`.
    pub async fn reset(&self) -> Result<ToolState> {
        let engine_ready = self.engine().is_ready();
        let next = {
            let mut inner = self.inner.lock();
            let next = inner.apply(Event::Reset { engine_ready })?;
            inner.clear();
            inner.threshold = Threshold::default();
            inner.request.supersede();
            next
        };

        if next == ToolState::InitialLoading {
            info!("model not loaded, reloading on reset");
            self.load().await?;
        }
        Ok(self.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOptions;
    use crate::mocks::{MockLoader, MockSession};

    fn session(loader: MockLoader) -> AnalysisSession<MockLoader> {
        let engine = Arc::new(InferenceEngine::new(loader, EngineOptions::default()));
        AnalysisSession::new(engine, UploadPolicy::default(), OutputBinding::Positional)
    }

    #[tokio::test]
    async fn test_initialize() -> Result<()> {
        let session = session(MockLoader::new(MockSession::new(&[0.0; 3], 0.0)));
        assert_eq!(session.state(), ToolState::InitialLoading);

        session.initialize().await?;
        let snapshot = session.snapshot();
        assert_eq!(snapshot.state, ToolState::ReadyForUpload);
        assert_eq!(snapshot.engine, EngineState::Ready);
        assert_eq!(snapshot.status_text(), "Upload an USG Image for Analysis");

        assert!(matches!(
            session.initialize().await,
            Err(SonoSegError::InvalidTransition { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_threshold_needs_results() -> Result<()> {
        let session = session(MockLoader::new(MockSession::new(&[0.0; 3], 0.0)));
        session.initialize().await?;

        let err = session.set_threshold(0.3).unwrap_err();
        assert!(matches!(err, SonoSegError::InvalidTransition { .. }));
        assert_eq!(session.snapshot().threshold, Threshold::default());
        Ok(())
    }

    #[tokio::test]
    async fn test_render_needs_results() -> Result<()> {
        let session = session(MockLoader::new(MockSession::new(&[0.0; 3], 0.0)));
        session.initialize().await?;

        let mut surface = overlay::RgbaSurface::new();
        assert!(session.render_overlay(&mut surface).is_err());
        assert_eq!(session.state(), ToolState::ReadyForUpload);
        Ok(())
    }

    #[tokio::test]
    async fn test_reset_during_initial_loading() {
        let session = session(MockLoader::new(MockSession::new(&[0.0; 3], 0.0)));
        assert!(matches!(
            session.reset().await,
            Err(SonoSegError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_retry_load() -> Result<()> {
        let loader = MockLoader::new(MockSession::new(&[0.0; 3], 0.0)).failing_times(1);
        let session = session(loader);

        assert!(session.initialize().await.is_err());
        let snapshot = session.snapshot();
        assert_eq!(snapshot.state, ToolState::ProcessingError);
        assert!(snapshot.error.unwrap().contains("artifact unreachable"));

        session.retry_load().await?;
        assert_eq!(session.state(), ToolState::ReadyForUpload);
        assert!(session.snapshot().error.is_none());
        Ok(())
    }

    #[test]
    fn test_request_supersede() {
        let mut request = Request::default();
        let first = request.supersede();
        let token = CancellationToken::new();
        request.cancel = Some(token.clone());

        let second = request.supersede();
        assert!(second > first);
        assert!(token.is_cancelled());
        assert!(!request.is_current(first));
        assert!(request.is_current(second));
    }
}
