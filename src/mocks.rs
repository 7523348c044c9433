use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::RgbaImage;
use ndarray::{Array1, ArrayD, IxDyn};

use crate::codec::InputTensor;
use crate::engine::{InferenceOutputs, NamedTensor};
use crate::errors::{Result, SonoSegError};
use crate::overlay::Surface;
use crate::traits::{InferenceSession, SessionLoader};

/// Shared call counter handed out by the mocks.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[derive(Debug, Clone)]
enum MaskSource {
    Fill(f32),
    Values(Vec<f32>),
}

/// Test double for a loaded model: returns a fixed mask and fixed logits.
#[derive(Debug, Clone)]
pub struct MockSession {
    logits: Vec<f32>,
    mask: MaskSource,
    output_count: usize,
    delay: Duration,
    runs: CallCounter,
    output_names: Vec<String>,
}

impl MockSession {
    /// Every mask pixel is `mask_fill`, shaped `[1, 1, H, W]` like the input.
    pub fn new(logits: &[f32], mask_fill: f32) -> Self {
        Self {
            logits: logits.to_vec(),
            mask: MaskSource::Fill(mask_fill),
            output_count: 2,
            delay: Duration::ZERO,
            runs: CallCounter::default(),
            output_names: vec!["segmentation".to_string(), "classification".to_string()],
        }
    }

    /// Returns `mask` shaped like the input, or flat when the length does not match it.
    pub fn with_mask(mut self, mask: Vec<f32>) -> Self {
        self.mask = MaskSource::Values(mask);
        self
    }

    pub fn with_output_count(mut self, count: usize) -> Self {
        self.output_count = count;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Reports outputs as `[classification, segmentation]`.
    pub fn swapped(mut self) -> Self {
        self.output_names.reverse();
        self
    }

    pub fn run_counter(&self) -> CallCounter {
        self.runs.clone()
    }

    fn mask_for(&self, input: &InputTensor) -> ArrayD<f32> {
        let (height, width) = (input.height(), input.width());
        match &self.mask {
            MaskSource::Fill(value) => ArrayD::from_elem(IxDyn(&[1, 1, height, width]), *value),
            MaskSource::Values(values) => ArrayD::from_shape_vec(
                IxDyn(&[1, 1, height, width]),
                values.clone(),
            )
            .unwrap_or_else(|_| Array1::from(values.clone()).into_dyn()),
        }
    }
}

impl InferenceSession for MockSession {
    fn run(&self, input: InputTensor) -> Result<InferenceOutputs> {
        self.runs.bump();
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let mask = NamedTensor::new("segmentation", self.mask_for(&input));
        let logits = NamedTensor::new(
            "classification",
            ArrayD::from_shape_vec(IxDyn(&[1, self.logits.len()]), self.logits.clone())?,
        );
        let mut tensors = if self.output_names[0] == "segmentation" {
            vec![mask, logits]
        } else {
            vec![logits, mask]
        };
        tensors.truncate(self.output_count);
        Ok(InferenceOutputs::new(tensors))
    }

    fn output_names(&self) -> &[String] {
        &self.output_names[..self.output_count.min(self.output_names.len())]
    }
}

/// Test double for the artifact loader.
#[derive(Debug, Clone)]
pub struct MockLoader {
    session: MockSession,
    failures_left: Arc<AtomicUsize>,
    loads: CallCounter,
    delay: Duration,
}

impl MockLoader {
    pub fn new(session: MockSession) -> Self {
        Self {
            session,
            failures_left: Arc::new(AtomicUsize::new(0)),
            loads: CallCounter::default(),
            delay: Duration::ZERO,
        }
    }

    /// The first `times` loads fail with `ModelUnavailable`.
    pub fn failing_times(self, times: usize) -> Self {
        self.failures_left.store(times, Ordering::SeqCst);
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn load_count(&self) -> usize {
        self.loads.get()
    }

    pub fn load_counter(&self) -> CallCounter {
        self.loads.clone()
    }
}

#[async_trait]
impl SessionLoader for MockLoader {
    type Session = MockSession;

    async fn load(&self) -> Result<MockSession> {
        let attempt = self.loads.bump();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(SonoSegError::ModelUnavailable {
                path: PathBuf::from(self.describe()),
                reason: format!("mock load attempt {} failed", attempt),
                source: Some("artifact unreachable".into()),
            });
        }
        Ok(self.session.clone())
    }

    fn describe(&self) -> String {
        "mock://model.onnx".to_string()
    }
}

/// A surface whose context can never be acquired.
#[derive(Debug, Default)]
pub struct UnavailableSurface;

impl Surface for UnavailableSurface {
    fn acquire(&mut self, _width: u32, _height: u32) -> Result<&mut RgbaImage> {
        Err(SonoSegError::SurfaceUnavailable {
            reason: "2D context could not be created".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_session_shapes() -> Result<()> {
        let session = MockSession::new(&[0.1, 0.2, 0.3], 0.7);
        let outputs = session.run(InputTensor::zeros(5, 4))?;

        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs.at(0).unwrap().data.shape(), &[1, 1, 4, 5]);
        assert_eq!(outputs.at(1).unwrap().data.len(), 3);
        assert_eq!(session.run_counter().get(), 1);
        Ok(())
    }

    #[test]
    fn test_mock_session_swapped() -> Result<()> {
        let session = MockSession::new(&[0.1, 0.2, 0.3], 0.7).swapped();
        let outputs = session.run(InputTensor::zeros(2, 2))?;
        assert_eq!(outputs.names(), vec!["classification", "segmentation"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_mock_loader_failures() {
        let loader = MockLoader::new(MockSession::new(&[0.0; 3], 0.0)).failing_times(1);
        assert!(loader.load().await.is_err());
        assert!(loader.load().await.is_ok());
        assert_eq!(loader.load_count(), 2);
    }
}
