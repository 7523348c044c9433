use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span};

use crate::codec::{encode, ImageAsset};
use crate::engine::{InferenceEngine, OutputBinding};
use crate::errors::{Result, SonoSegError};
use crate::interpreter::{interpret, AnalysisResult};
use crate::traits::SessionLoader;
use crate::upload::Upload;

/// A decoded image together with what the model made of it.
#[derive(Debug)]
pub struct Analysis {
    pub asset: ImageAsset,
    pub result: AnalysisResult,
}

/// Decode, encode, infer, interpret: one upload in, one result out.
pub struct AnalysisPipeline<L: SessionLoader> {
    engine: Arc<InferenceEngine<L>>,
    binding: OutputBinding,
}

impl<L: SessionLoader> AnalysisPipeline<L> {
    pub fn new(engine: Arc<InferenceEngine<L>>, binding: OutputBinding) -> Self {
        Self { engine, binding }
    }

    pub fn engine(&self) -> &Arc<InferenceEngine<L>> {
        &self.engine
    }

    pub fn binding(&self) -> &OutputBinding {
        &self.binding
    }

    /// Runs the whole pipeline, stopping with `Cancelled` as soon as `cancel` fires.
    pub async fn analyze(&self, upload: Upload, cancel: &CancellationToken) -> Result<Analysis> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SonoSegError::Cancelled {
                operation: "analysis".to_string(),
            }),
            analysis = self.run(upload) => analysis,
        }
    }

    async fn run(&self, upload: Upload) -> Result<Analysis> {
        let name = upload.name.clone();
        let (asset, tensor) = tokio::task::spawn_blocking(move || {
            let _span = debug_span!("preprocess", file = %upload.name).entered();
            let asset = ImageAsset::from_upload(upload)?;
            let tensor = encode(&asset)?;
            Ok::<_, SonoSegError>((asset, tensor))
        })
        .await??;

        let (width, height) = (asset.width(), asset.height());
        debug!(file = %name, width, height, "image encoded");

        let outputs = self.engine.infer(tensor).await?;
        let result = interpret(&outputs, &self.binding, width, height)?;

        debug!(
            file = %name,
            class = %result.class,
            confidence = result.confidence,
            "analysis finished"
        );
        Ok(Analysis { asset, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOptions;
    use crate::interpreter::LesionClass;
    use crate::mocks::{MockLoader, MockSession};
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;
    use std::time::Duration;

    fn png_upload(width: u32, height: u32) -> Upload {
        let image = RgbaImage::from_pixel(width, height, Rgba([20, 20, 20, 255]));
        let mut bytes = Cursor::new(Vec::new());
        image.write_to(&mut bytes, ImageFormat::Png).unwrap();
        Upload::new("scan.png", "image/png", bytes.into_inner())
    }

    fn pipeline(session: MockSession) -> AnalysisPipeline<MockLoader> {
        let engine = InferenceEngine::new(MockLoader::new(session), EngineOptions::default());
        AnalysisPipeline::new(Arc::new(engine), OutputBinding::Positional)
    }

    #[tokio::test]
    async fn test_analyze() -> Result<()> {
        let pipeline = pipeline(MockSession::new(&[0.0, 0.0, 4.0], 0.8));
        pipeline.engine().load_model().await?;

        let analysis = pipeline
            .analyze(png_upload(6, 4), &CancellationToken::new())
            .await?;
        assert_eq!((analysis.asset.width(), analysis.asset.height()), (6, 4));
        assert_eq!(analysis.result.class, LesionClass::Malignant);
        assert_eq!(analysis.result.segmentation_mask.len(), 24);
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_upload() {
        let pipeline = pipeline(MockSession::new(&[0.0; 3], 0.0));
        let upload = Upload::new("scan.png", "image/png", vec![0x89, 0x50, 0x00]);

        let err = pipeline
            .analyze(upload, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SonoSegError::Decode { .. }));
        assert!(err.user_message().contains("choose another image"));
    }

    #[tokio::test]
    async fn test_cancelled() {
        let session = MockSession::new(&[0.0; 3], 0.0).with_delay(Duration::from_millis(200));
        let pipeline = pipeline(session);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = pipeline.analyze(png_upload(2, 2), &token).await.unwrap_err();
        assert!(matches!(err, SonoSegError::Cancelled { .. }));
    }
}
