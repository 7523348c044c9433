use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};

use sono_seg_rs::{
    AnalysisOutcome, AnalysisSession, Config, InferenceEngine, OnnxLoader, OutputBinding,
    RgbaSurface, Upload,
};

fn spinner(message: &'static str) -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} [{elapsed}] {msg}")?);
    spinner.set_message(message);
    spinner.enable_steady_tick(Duration::from_millis(100));
    Ok(spinner)
}

/// `overlay.png` at 0.7 becomes `overlay_t0.70.png`.
fn threshold_path(output: &Path, threshold: f32) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "overlay".to_string());
    output.with_file_name(format!("{}_t{:.2}.png", stem, threshold))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::new();

    let log_level = if config.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    ensure!(config.image.exists(), "Image does not exist: {}", config.image.display());

    let loader = OnnxLoader::new(&config.model_path)
        .with_device_id(config.device_id)
        .with_warmup(config.warmup());
    let engine = Arc::new(InferenceEngine::new(loader, config.engine_options()));
    let session = AnalysisSession::new(engine, config.upload_policy(), OutputBinding::Positional);

    let progress = spinner(session.state().status_text())?;
    let loaded = session.initialize().await;
    progress.finish_and_clear();
    loaded.with_context(|| format!("Failed to load model: {}", config.model_path.display()))?;

    let upload = Upload::from_path(&config.image)
        .await
        .with_context(|| format!("Failed to read image: {}", config.image.display()))?;

    let progress = spinner("Analyzing Image...")?;
    let outcome = session.submit(upload).await;
    progress.finish_and_clear();

    let result = match outcome? {
        AnalysisOutcome::Completed(result) => result,
        AnalysisOutcome::Rejected(rejection) => bail!("{}", rejection),
        AnalysisOutcome::Failed { message } => bail!("{}: {}", session.state().status_text(), message),
        AnalysisOutcome::Superseded => bail!("Analysis was superseded"),
    };
    println!("{}", result.summary());

    let mut surface = RgbaSurface::new();
    let mut outputs = vec![(config.output.clone(), config.threshold)];
    outputs.extend(
        config
            .extra_thresholds
            .iter()
            .map(|&t| (threshold_path(&config.output, t), t)),
    );

    for (path, threshold) in outputs {
        session.set_threshold(threshold)?;
        session
            .render_overlay(&mut surface)
            .context("Failed to render overlay")?;
        surface
            .save(&path)
            .with_context(|| format!("Failed to save overlay: {}", path.display()))?;
        tracing::info!(path = %path.display(), threshold, "overlay saved");
    }

    Ok(())
}
