pub mod codec;
pub mod config;
pub mod engine;
pub mod errors;
pub mod interpreter;
pub mod model;
pub mod overlay;
pub mod pipeline;
pub mod session;
pub mod state;
pub mod traits;
pub mod upload;

pub mod mocks;

pub use codec::{encode, ImageAsset, InputTensor};
pub use config::Config;
pub use engine::{EngineOptions, EngineState, InferenceEngine, InferenceOutputs, OutputBinding};
pub use errors::{Result, SonoSegError};
pub use interpreter::{AnalysisResult, LesionClass};
pub use model::{OnnxLoader, OnnxModel};
pub use overlay::{render, RgbaSurface, Surface, Threshold};
pub use pipeline::AnalysisPipeline;
pub use session::{AnalysisOutcome, AnalysisSession, SessionSnapshot};
pub use state::{Event, ToolState};
pub use traits::*;
pub use upload::{Upload, UploadPolicy, UploadRejection};
