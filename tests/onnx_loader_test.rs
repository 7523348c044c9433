use std::fs;
use std::sync::Arc;

use tempfile::TempDir;

use sono_seg_rs::{
    AnalysisSession, EngineOptions, EngineState, InferenceEngine, OnnxLoader, OutputBinding,
    SonoSegError, ToolState, UploadPolicy,
};

#[tokio::test]
async fn test_corrupt_artifact_is_model_unavailable() {
    let temp_dir = TempDir::new().unwrap();
    let model_path = temp_dir.path().join("multi_task_unet_dynamic.onnx");
    fs::write(&model_path, b"dummy_model").unwrap();

    let engine = InferenceEngine::new(OnnxLoader::new(&model_path), EngineOptions::default());
    let err = engine.load_model().await.unwrap_err();

    match err {
        SonoSegError::ModelUnavailable { path, .. } => assert_eq!(path, model_path),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(engine.state(), EngineState::LoadFailed);
    assert!(engine.last_error().is_some());
}

#[tokio::test]
async fn test_missing_artifact_fails_session_start() {
    let temp_dir = TempDir::new().unwrap();
    let loader = OnnxLoader::new(temp_dir.path().join("missing.onnx")).with_warmup(Some(32));
    let engine = Arc::new(InferenceEngine::new(loader, EngineOptions::default()));
    let session = AnalysisSession::new(engine, UploadPolicy::default(), OutputBinding::Positional);

    assert!(session.initialize().await.is_err());

    let snapshot = session.snapshot();
    assert_eq!(snapshot.state, ToolState::ProcessingError);
    assert_eq!(snapshot.engine, EngineState::LoadFailed);
    assert!(snapshot.error.unwrap().contains("missing.onnx"));
}
