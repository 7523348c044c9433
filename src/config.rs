use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::EngineOptions;
use crate::upload::UploadPolicy;

pub const DEFAULT_MODEL_NAME: &str = "multi_task_unet_dynamic.onnx";
/// Name of the single input the model artifact accepts.
pub const INPUT_NAME: &str = "input_image";

pub const ACCEPTED_IMAGE_TYPES: [&str; 4] = ["image/jpeg", "image/png", "image/webp", "image/gif"];
pub const MAX_FILE_SIZE_MB: u64 = 10;
pub const MAX_FILE_SIZE_BYTES: u64 = MAX_FILE_SIZE_MB * 1024 * 1024;

pub const DEFAULT_THRESHOLD: f32 = 0.5;
pub const MIN_THRESHOLD: f32 = 0.05;
pub const MAX_THRESHOLD: f32 = 0.95;
pub const THRESHOLD_STEP: f32 = 0.01;

pub const DEFAULT_WARMUP_SIZE: u32 = 32;

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Ultrasound image to analyse
    pub image: PathBuf,

    #[arg(short, long, default_value = DEFAULT_MODEL_NAME)]
    pub model_path: PathBuf,

    #[arg(short, long, default_value = "overlay.png")]
    pub output: PathBuf,

    #[arg(short, long, default_value_t = DEFAULT_THRESHOLD, value_parser = check_threshold)]
    pub threshold: f32,

    /// Extra thresholds rendered from the same analysis
    #[arg(long = "also-threshold", value_parser = check_threshold)]
    pub extra_thresholds: Vec<f32>,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    #[arg(long, default_value_t = MAX_FILE_SIZE_MB)]
    pub max_file_size_mb: u64,

    /// 0 disables the timeout
    #[arg(long, default_value_t = 60)]
    pub load_timeout_secs: u64,

    /// 0 disables the timeout
    #[arg(long, default_value_t = 30)]
    pub inference_timeout_secs: u64,

    /// Side of the zero tensor used to warm up the model; 0 skips warm-up
    #[arg(long, default_value_t = DEFAULT_WARMUP_SIZE)]
    pub warmup_size: u32,

    #[arg(long)]
    pub debug: bool,
}

impl Config {
    pub fn new() -> Self {
        Self::parse()
    }

    pub fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy::new(
            ACCEPTED_IMAGE_TYPES.iter().map(|s| s.to_string()).collect(),
            self.max_file_size_mb * 1024 * 1024,
        )
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            load_timeout: non_zero_secs(self.load_timeout_secs),
            inference_timeout: non_zero_secs(self.inference_timeout_secs),
        }
    }

    pub fn warmup(&self) -> Option<u32> {
        (self.warmup_size > 0).then_some(self.warmup_size)
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn check_threshold(s: &str) -> Result<f32, String> {
    let value: f32 = s
        .parse()
        .map_err(|_| format!("{} is not a number", s))?;
    if !(MIN_THRESHOLD..=MAX_THRESHOLD).contains(&value) {
        return Err(format!(
            "{} is out of range. Threshold must be between {} and {}",
            value, MIN_THRESHOLD, MAX_THRESHOLD
        ));
    }
    Ok(value)
}
