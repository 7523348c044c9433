use async_trait::async_trait;

use crate::codec::InputTensor;
use crate::engine::InferenceOutputs;
use crate::errors::Result;

/// A loaded, read-only model artifact.
///
/// Implementations hold no per-call mutable state visible to callers, so one session can be
/// shared across requests. `run` is blocking; the engine moves it onto the blocking pool.
pub trait InferenceSession: Send + Sync + 'static {
    /// Runs the model on one tensor and returns its outputs in declaration order.
    fn run(&self, input: InputTensor) -> Result<InferenceOutputs>;

    /// Output names in declaration order.
    fn output_names(&self) -> &[String];
}

/// Produces a session from an artifact. Swapped for a fake in tests.
#[async_trait]
pub trait SessionLoader: Send + Sync {
    type Session: InferenceSession;

    async fn load(&self) -> Result<Self::Session>;

    /// Where the artifact comes from, for logs.
    fn describe(&self) -> String;
}
