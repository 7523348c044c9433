use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for the ultrasound analysis pipeline.
///
/// Each variant carries the context of the stage that failed (artifact loading, image decoding,
/// inference, interpretation, rendering) so the state machine can collapse any of them into a
/// single human-readable message without parsing strings.
#[derive(Error, Debug)]
pub enum SonoSegError {
    #[error("Model unavailable: {reason} ({path:?})")]
    ModelUnavailable {
        path: PathBuf,
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Decode error: {operation} failed")]
    Decode {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Shape mismatch in {what}: expected {expected} values, got {actual}")]
    ShapeMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("Inference session is not ready")]
    SessionNotReady {
        #[source]
        source: Option<BoxError>,
    },

    #[error("Inference error: {operation} failed")]
    Inference {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Classification output is empty")]
    EmptyLogits,

    #[error("Predicted class index {index} is out of range for {len} classes")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Drawing surface unavailable: {reason}")]
    SurfaceUnavailable { reason: String },

    #[error("{operation} was cancelled")]
    Cancelled { operation: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Invalid transition: cannot {event} while {state}")]
    InvalidTransition { state: String, event: String },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

pub type Result<T> = std::result::Result<T, SonoSegError>;

impl SonoSegError {
    pub(crate) fn inference(operation: impl Into<String>, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::Inference {
            operation: operation.into(),
            source: message.into(),
        }
    }

    /// The single line shown to the user when the pipeline collapses into an error state.
    pub fn user_message(&self) -> String {
        match self {
            Self::Decode { .. } => format!(
                "{}: {}. Please choose another image file.",
                self,
                self.root_cause()
            ),
            Self::ModelUnavailable { source: None, .. } | Self::SessionNotReady { source: None } => {
                self.to_string()
            }
            Self::ModelUnavailable { .. }
            | Self::SessionNotReady { .. }
            | Self::Inference { .. } => {
                format!("{}: {}", self, self.root_cause())
            }
            _ => self.to_string(),
        }
    }

    fn root_cause(&self) -> String {
        let mut current: &dyn std::error::Error = self;
        while let Some(next) = current.source() {
            current = next;
        }
        current.to_string()
    }
}

/// Some dependencies return anyhow::Error; at the crate boundary they become configuration errors.
impl From<anyhow::Error> for SonoSegError {
    fn from(err: anyhow::Error) -> Self {
        Self::Configuration {
            message: err.to_string(),
        }
    }
}

/// Convert image crate errors to decode errors.
impl From<image::ImageError> for SonoSegError {
    fn from(err: image::ImageError) -> Self {
        Self::Decode {
            operation: "image decoding".to_string(),
            source: Box::new(err),
        }
    }
}

/// Convert ONNX Runtime errors to inference errors.
impl From<ort::Error> for SonoSegError {
    fn from(err: ort::Error) -> Self {
        Self::Inference {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors surface while reshaping engine output, so they belong to inference.
impl From<ndarray::ShapeError> for SonoSegError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Inference {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

/// A blocking task that panicked or was cancelled.
impl From<tokio::task::JoinError> for SonoSegError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Inference {
            operation: "blocking task".to_string(),
            source: Box::new(err),
        }
    }
}
