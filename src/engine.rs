use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ndarray::ArrayD;
use parking_lot::RwLock;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::codec::InputTensor;
use crate::errors::{Result, SonoSegError};
use crate::traits::{InferenceSession, SessionLoader};

/// Number of outputs every model must produce: segmentation and classification logits.
pub const REQUIRED_OUTPUTS: usize = 2;

#[derive(Debug, Clone)]
pub struct NamedTensor {
    pub name: String,
    pub data: ArrayD<f32>,
}

impl NamedTensor {
    pub fn new(name: impl Into<String>, data: ArrayD<f32>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// Engine outputs in declaration order, plus the measured inference latency.
#[derive(Debug, Clone)]
pub struct InferenceOutputs {
    tensors: Vec<NamedTensor>,
    elapsed: Duration,
}

impl InferenceOutputs {
    pub fn new(tensors: Vec<NamedTensor>) -> Self {
        Self {
            tensors,
            elapsed: Duration::ZERO,
        }
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn names(&self) -> Vec<&str> {
        self.tensors.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn at(&self, position: usize) -> Option<&NamedTensor> {
        self.tensors.get(position)
    }

    pub fn get(&self, name: &str) -> Option<&NamedTensor> {
        self.tensors.iter().find(|t| t.name == name)
    }

    /// Resolves the `(segmentation, logits)` pair according to `binding`.
    pub fn bind(&self, binding: &OutputBinding) -> Result<(&NamedTensor, &NamedTensor)> {
        if self.len() < REQUIRED_OUTPUTS {
            return Err(SonoSegError::inference(
                "output binding",
                format!(
                    "model expected at least {} outputs, but got {} ({})",
                    REQUIRED_OUTPUTS,
                    self.len(),
                    self.names().join(", ")
                ),
            ));
        }

        match binding {
            OutputBinding::Positional => Ok((&self.tensors[0], &self.tensors[1])),
            OutputBinding::Named {
                segmentation,
                classification,
            } => {
                let lookup = |name: &str| {
                    self.get(name).ok_or_else(|| {
                        SonoSegError::inference(
                            "output binding",
                            format!(
                                "output `{}` not found among [{}]",
                                name,
                                self.names().join(", ")
                            ),
                        )
                    })
                };
                Ok((lookup(segmentation)?, lookup(classification)?))
            }
        }
    }
}

/// How the two required outputs are found among the model's outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OutputBinding {
    /// Output 0 is the segmentation mask, output 1 the classification logits.
    #[default]
    Positional,
    Named {
        segmentation: String,
        classification: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub load_timeout: Option<Duration>,
    pub inference_timeout: Option<Duration>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            load_timeout: Some(Duration::from_secs(60)),
            inference_timeout: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Unloaded,
    Loading,
    Ready,
    LoadFailed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::LoadFailed => "load failed",
        };
        f.write_str(name)
    }
}

enum Slot<S> {
    Unloaded,
    Loading,
    Ready(Arc<S>),
    LoadFailed(String),
}

/// Owns the model session for the lifetime of an analysis session.
///
/// Loading is lazy and single-flight: concurrent `load_model` calls queue behind one gate and
/// the ones that arrive after a successful load return immediately. A failed load stays failed
/// until the next explicit `load_model` call.
pub struct InferenceEngine<L: SessionLoader> {
    loader: L,
    options: EngineOptions,
    slot: RwLock<Slot<L::Session>>,
    load_gate: tokio::sync::Mutex<()>,
}

impl<L: SessionLoader> InferenceEngine<L> {
    pub fn new(loader: L, options: EngineOptions) -> Self {
        Self {
            loader,
            options,
            slot: RwLock::new(Slot::Unloaded),
            load_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn state(&self) -> EngineState {
        match &*self.slot.read() {
            Slot::Unloaded => EngineState::Unloaded,
            Slot::Loading => EngineState::Loading,
            Slot::Ready(_) => EngineState::Ready,
            Slot::LoadFailed(_) => EngineState::LoadFailed,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == EngineState::Ready
    }

    /// Message of the most recent failed load, while the engine stays in `LoadFailed`.
    pub fn last_error(&self) -> Option<String> {
        match &*self.slot.read() {
            Slot::LoadFailed(message) => Some(message.clone()),
            _ => None,
        }
    }

    fn session(&self) -> Option<Arc<L::Session>> {
        match &*self.slot.read() {
            Slot::Ready(session) => Some(Arc::clone(session)),
            _ => None,
        }
    }

    pub async fn load_model(&self) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }

        let _gate = self.load_gate.lock().await;
        if self.is_ready() {
            return Ok(());
        }

        *self.slot.write() = Slot::Loading;
        let artifact = self.loader.describe();
        info!(%artifact, "loading model");
        let started = Instant::now();

        let loaded = match self.options.load_timeout {
            Some(limit) => timeout(limit, self.loader.load())
                .await
                .unwrap_or_else(|_| {
                    Err(SonoSegError::Timeout {
                        operation: "model load".to_string(),
                        after: limit,
                    })
                }),
            None => self.loader.load().await,
        };

        match loaded {
            Ok(session) => {
                info!(
                    %artifact,
                    outputs = ?session.output_names(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "model loaded"
                );
                *self.slot.write() = Slot::Ready(Arc::new(session));
                Ok(())
            }
            Err(e) => {
                error!(%artifact, error = %e, "failed to load model");
                *self.slot.write() = Slot::LoadFailed(e.user_message());
                Err(e)
            }
        }
    }

    /// Runs one inference. If the engine is not ready, one implicit reload is attempted first.
    pub async fn infer(&self, input: InputTensor) -> Result<InferenceOutputs> {
        let session = match self.session() {
            Some(session) => session,
            None => {
                warn!(state = %self.state(), "inference requested before model was ready, reloading");
                self.load_model()
                    .await
                    .map_err(|e| SonoSegError::SessionNotReady {
                        source: Some(Box::new(e)),
                    })?;
                self.session()
                    .ok_or(SonoSegError::SessionNotReady { source: None })?
            }
        };

        let (width, height) = (input.width(), input.height());
        let started = Instant::now();
        let task = tokio::task::spawn_blocking(move || session.run(input));
        let joined = match self.options.inference_timeout {
            Some(limit) => timeout(limit, task)
                .await
                .map_err(|_| SonoSegError::Timeout {
                    operation: "inference".to_string(),
                    after: limit,
                })?,
            None => task.await,
        };
        let outputs = joined??;
        let elapsed = started.elapsed();

        if outputs.len() < REQUIRED_OUTPUTS {
            return Err(SonoSegError::inference(
                "output validation",
                format!(
                    "model expected at least {} outputs, but got {} ({})",
                    REQUIRED_OUTPUTS,
                    outputs.len(),
                    outputs.names().join(", ")
                ),
            ));
        }

        debug!(
            width,
            height,
            outputs = outputs.len(),
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "inference finished"
        );
        Ok(outputs.with_elapsed(elapsed))
    }

    /// Drops the session. The next `infer` reloads it.
    pub fn dispose(&self) {
        *self.slot.write() = Slot::Unloaded;
        debug!("model session disposed");
    }
}
