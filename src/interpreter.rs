use std::fmt;
use std::time::Duration;

use ndarray::ArrayViewD;

use crate::codec::decode_mask;
use crate::engine::{InferenceOutputs, OutputBinding};
use crate::errors::{Result, SonoSegError};

/// Width of the classification head.
pub const CLASS_COUNT: usize = 3;

/// Lesion classes in logits order. The index in the model output is the only link between a
/// score and its label, so this order is part of the model contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LesionClass {
    Normal,
    Benign,
    Malignant,
}

impl LesionClass {
    pub const ALL: [LesionClass; CLASS_COUNT] = [Self::Normal, Self::Benign, Self::Malignant];

    pub fn from_index(index: usize) -> Result<Self> {
        Self::ALL
            .get(index)
            .copied()
            .ok_or(SonoSegError::IndexOutOfRange {
                index,
                len: CLASS_COUNT,
            })
    }

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Benign => "Benign",
            Self::Malignant => "Malignant",
        }
    }
}

impl fmt::Display for LesionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Numerically stable softmax: the maximum logit is subtracted before exponentiating.
pub fn softmax(logits: &[f32]) -> Result<Vec<f32>> {
    let max = logits
        .iter()
        .copied()
        .reduce(f32::max)
        .ok_or(SonoSegError::EmptyLogits)?;

    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    Ok(exps.into_iter().map(|e| e / sum).collect())
}

/// Picks the most probable class. Ties go to the lowest index.
///
/// A non-finite score leaves no index attaining the maximum, which is reported as the
/// past-the-end index.
pub fn classify(probabilities: &[f32]) -> Result<(usize, f32)> {
    if probabilities.is_empty() {
        return Err(SonoSegError::EmptyLogits);
    }
    if probabilities.iter().any(|p| !p.is_finite()) {
        return Err(SonoSegError::IndexOutOfRange {
            index: probabilities.len(),
            len: CLASS_COUNT,
        });
    }

    let (index, confidence) = probabilities
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, p)| match best {
            Some((_, best_p)) if p <= best_p => best,
            _ => Some((i, p)),
        })
        .ok_or(SonoSegError::EmptyLogits)?;

    if index >= CLASS_COUNT {
        return Err(SonoSegError::IndexOutOfRange {
            index,
            len: CLASS_COUNT,
        });
    }
    Ok((index, confidence))
}

/// Outcome of one analysis. Immutable once assembled.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub class: LesionClass,
    pub confidence: f32,
    pub probabilities: Vec<f32>,
    pub segmentation_mask: Vec<f32>,
    pub image_width: u32,
    pub image_height: u32,
    pub inference_duration: Duration,
}

impl AnalysisResult {
    pub fn inference_duration_ms(&self) -> f64 {
        self.inference_duration.as_secs_f64() * 1000.0
    }

    pub fn probability_of(&self, class: LesionClass) -> f32 {
        self.probabilities
            .get(class.index())
            .copied()
            .unwrap_or(0.0)
    }

    /// e.g. `Result: Benign | Confidence: 87.3% | Inference Time: 0.42 s`
    pub fn summary(&self) -> String {
        format!(
            "Result: {} | Confidence: {:.1}% | Inference Time: {:.2} s",
            self.class,
            self.confidence * 100.0,
            self.inference_duration.as_secs_f64()
        )
    }
}

pub fn assemble(
    class: LesionClass,
    confidence: f32,
    probabilities: Vec<f32>,
    segmentation_mask: Vec<f32>,
    image_width: u32,
    image_height: u32,
    inference_duration: Duration,
) -> AnalysisResult {
    AnalysisResult {
        class,
        confidence,
        probabilities,
        segmentation_mask,
        image_width,
        image_height,
        inference_duration,
    }
}

fn flatten(view: ArrayViewD<'_, f32>) -> Vec<f32> {
    view.iter().copied().collect()
}

/// Turns raw engine outputs into an [`AnalysisResult`] for an image of the given size.
pub fn interpret(
    outputs: &InferenceOutputs,
    binding: &OutputBinding,
    image_width: u32,
    image_height: u32,
) -> Result<AnalysisResult> {
    let (segmentation, logits) = outputs.bind(binding)?;

    let mask = flatten(segmentation.data.view());
    decode_mask(&mask, image_width, image_height)?;

    let logits = flatten(logits.data.view());
    if !logits.is_empty() && logits.len() != CLASS_COUNT {
        return Err(SonoSegError::ShapeMismatch {
            what: "classification logits".to_string(),
            expected: CLASS_COUNT,
            actual: logits.len(),
        });
    }

    let probabilities = softmax(&logits)?;
    let (index, confidence) = classify(&probabilities)?;
    let class = LesionClass::from_index(index)?;

    Ok(assemble(
        class,
        confidence,
        probabilities,
        mask,
        image_width,
        image_height,
        outputs.elapsed(),
    ))
}
