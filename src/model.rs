use std::fmt::Display;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::Session,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::codec::InputTensor;
use crate::config::INPUT_NAME;
use crate::engine::{InferenceOutputs, NamedTensor, OutputBinding, REQUIRED_OUTPUTS};
use crate::errors::{Result, SonoSegError};
use crate::interpreter::CLASS_COUNT;
use crate::traits::{InferenceSession, SessionLoader};

/// ONNX Runtime session for the multi-task U-Net.
///
/// The artifact takes one `[1, 1, H, W]` float input and yields the segmentation mask and the
/// three classification logits (Normal, Benign, Malignant). Spatial dimensions are dynamic.
pub struct OnnxModel {
    session: Mutex<Session>,
    input_name: String,
    output_names: Vec<String>,
}

fn unavailable<E: Display>(path: &Path, reason: &'static str) -> impl FnOnce(E) -> SonoSegError {
    let path = path.to_path_buf();
    move |e| SonoSegError::ModelUnavailable {
        path,
        reason: reason.to_string(),
        source: Some(e.to_string().into()),
    }
}

impl OnnxModel {
    pub fn new(
        model_path: &Path,
        device_id: i32,
        warmup: Option<u32>,
        binding: &OutputBinding,
    ) -> Result<Self> {
        let session = Session::builder()
            .map_err(unavailable(model_path, "session builder initialisation"))?
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ])
            .map_err(unavailable(model_path, "execution provider registration"))?
            .with_memory_pattern(true)
            .map_err(unavailable(model_path, "memory pattern configuration"))?
            .commit_from_file(model_path)
            .map_err(unavailable(model_path, "model file parsing"))?;

        let input_name = match session.inputs.iter().find(|i| i.name == INPUT_NAME) {
            Some(input) => input.name.clone(),
            None => {
                let first = session.inputs.first().ok_or_else(|| SonoSegError::ModelUnavailable {
                    path: model_path.to_path_buf(),
                    reason: "model declares no inputs".to_string(),
                    source: None,
                })?;
                warn!(expected = INPUT_NAME, found = %first.name, "input name differs, using first input");
                first.name.clone()
            }
        };

        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        if output_names.len() < REQUIRED_OUTPUTS {
            return Err(SonoSegError::ModelUnavailable {
                path: model_path.to_path_buf(),
                reason: format!(
                    "model declares {} outputs, at least {} are required",
                    output_names.len(),
                    REQUIRED_OUTPUTS
                ),
                source: None,
            });
        }

        let logits_position = match binding {
            OutputBinding::Positional => Some(1),
            OutputBinding::Named { classification, .. } => {
                output_names.iter().position(|name| name == classification)
            }
        };
        let declared_classes = logits_position
            .and_then(|i| session.outputs[i].output_type.tensor_shape())
            .and_then(|shape| shape.last().copied())
            .filter(|&dim| dim > 0);
        if let Some(classes) = declared_classes {
            if classes as usize != CLASS_COUNT {
                return Err(SonoSegError::ModelUnavailable {
                    path: model_path.to_path_buf(),
                    reason: format!(
                        "classification head has {} classes, expected {}",
                        classes, CLASS_COUNT
                    ),
                    source: None,
                });
            }
        }

        debug!(input = %input_name, outputs = ?output_names, "model signature");

        let model = Self {
            session: Mutex::new(session),
            input_name,
            output_names,
        };

        if let Some(size) = warmup {
            model
                .warm_up(size, binding)
                .map_err(unavailable(model_path, "warm-up run"))?;
        }

        Ok(model)
    }

    /// Runs a zero tensor through the graph and re-checks the output contract.
    fn warm_up(&self, size: u32, binding: &OutputBinding) -> Result<()> {
        let outputs = self.run(InputTensor::zeros(size, size))?;
        let (_, logits) = outputs.bind(binding)?;
        if logits.data.len() != CLASS_COUNT {
            return Err(SonoSegError::ShapeMismatch {
                what: "classification logits".to_string(),
                expected: CLASS_COUNT,
                actual: logits.data.len(),
            });
        }
        debug!(size, "warm-up run finished");
        Ok(())
    }
}

impl InferenceSession for OnnxModel {
    fn run(&self, input: InputTensor) -> Result<InferenceOutputs> {
        let data = input.into_inner();
        let mut session = self.session.lock();
        let outputs = session.run(
            ort::inputs![self.input_name.as_str() => TensorRef::from_array_view(&data.as_standard_layout())?],
        )?;

        let tensors = self
            .output_names
            .iter()
            .map(|name| {
                let data = outputs[name.as_str()].try_extract_array::<f32>()?.to_owned();
                Ok(NamedTensor::new(name.clone(), data))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(InferenceOutputs::new(tensors))
    }

    fn output_names(&self) -> &[String] {
        &self.output_names
    }
}

/// Loads [`OnnxModel`] from a file on disk.
#[derive(Debug, Clone)]
pub struct OnnxLoader {
    model_path: PathBuf,
    device_id: i32,
    warmup: Option<u32>,
    binding: OutputBinding,
}

impl OnnxLoader {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            device_id: 0,
            warmup: None,
            binding: OutputBinding::default(),
        }
    }

    pub fn with_device_id(mut self, device_id: i32) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn with_warmup(mut self, size: Option<u32>) -> Self {
        self.warmup = size;
        self
    }

    pub fn with_binding(mut self, binding: OutputBinding) -> Self {
        self.binding = binding;
        self
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    async fn check_artifact(&self) -> Result<()> {
        match tokio::fs::metadata(&self.model_path).await {
            Ok(metadata) if metadata.is_file() => Ok(()),
            Ok(_) => Err(SonoSegError::ModelUnavailable {
                path: self.model_path.clone(),
                reason: "model path is not a file".to_string(),
                source: None,
            }),
            Err(e) => Err(SonoSegError::ModelUnavailable {
                path: self.model_path.clone(),
                reason: "failed to read model file; make sure the artifact is in place".to_string(),
                source: Some(Box::new(e)),
            }),
        }
    }
}

#[async_trait]
impl SessionLoader for OnnxLoader {
    type Session = OnnxModel;

    async fn load(&self) -> Result<OnnxModel> {
        self.check_artifact().await?;

        let loader = self.clone();
        let model = tokio::task::spawn_blocking(move || {
            OnnxModel::new(
                &loader.model_path,
                loader.device_id,
                loader.warmup,
                &loader.binding,
            )
        })
        .await
        .map_err(|e| SonoSegError::ModelUnavailable {
            path: self.model_path.clone(),
            reason: "model loading task failed".to_string(),
            source: Some(Box::new(e)),
        })??;

        info!(path = %self.model_path.display(), "onnx session ready");
        Ok(model)
    }

    fn describe(&self) -> String {
        self.model_path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let loader = OnnxLoader::new(temp_dir.path().join("multi_task_unet_dynamic.onnx"));

        let err = loader.load().await.err().unwrap();
        match err {
            SonoSegError::ModelUnavailable { path, source, .. } => {
                assert_eq!(path, loader.model_path());
                assert!(source.is_some());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_directory_is_not_an_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let loader = OnnxLoader::new(temp_dir.path());

        let err = loader.load().await.err().unwrap();
        assert!(err.to_string().contains("not a file"));
    }

    #[test]
    fn test_loader_builder() {
        let binding = OutputBinding::Named {
            segmentation: "mask".to_string(),
            classification: "logits".to_string(),
        };
        let loader = OnnxLoader::new("model.onnx")
            .with_device_id(1)
            .with_warmup(Some(64))
            .with_binding(binding.clone());

        assert_eq!(loader.model_path(), Path::new("model.onnx"));
        assert_eq!(loader.device_id, 1);
        assert_eq!(loader.warmup, Some(64));
        assert_eq!(loader.binding, binding);
        assert_eq!(loader.describe(), "model.onnx");
    }
}
