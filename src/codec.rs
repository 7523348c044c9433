use image::{ImageFormat, RgbaImage};
use ndarray::prelude::*;
use rayon::prelude::*;

use crate::errors::{Result, SonoSegError};
use crate::upload::Upload;

/// A decoded upload. Dropping it releases the pixel buffer.
#[derive(Debug)]
pub struct ImageAsset {
    bytes: Vec<u8>,
    pixels: RgbaImage,
}

impl ImageAsset {
    /// Decodes raw bytes. The format is sniffed from the content; the declared MIME type is
    /// only consulted when the signature is not recognised.
    pub fn decode(bytes: Vec<u8>, mime_type: Option<&str>) -> Result<Self> {
        let format = image::guess_format(&bytes)
            .ok()
            .or_else(|| mime_type.and_then(ImageFormat::from_mime_type));
        let image = match format {
            Some(format) => image::load_from_memory_with_format(&bytes, format),
            None => image::load_from_memory(&bytes),
        }
        .map_err(|e| SonoSegError::Decode {
            operation: "image decoding".to_string(),
            source: Box::new(e),
        })?;

        Ok(Self {
            bytes,
            pixels: image.to_rgba8(),
        })
    }

    pub fn from_upload(upload: Upload) -> Result<Self> {
        let Upload {
            mime_type, bytes, ..
        } = upload;
        Self::decode(bytes, Some(&mime_type))
    }

    pub fn from_pixels(pixels: RgbaImage) -> Self {
        Self {
            bytes: Vec::new(),
            pixels,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

/// Model input with logical shape `[1, 1, height, width]`, row-major, values in `[-1, 1]`.
///
/// Not `Clone`: the tensor is consumed by exactly one inference call.
#[derive(Debug)]
pub struct InputTensor {
    data: Array4<f32>,
}

impl InputTensor {
    pub fn from_array(data: Array4<f32>) -> Result<Self> {
        let shape = data.shape();
        if shape[0] != 1 || shape[1] != 1 {
            return Err(SonoSegError::ShapeMismatch {
                what: "input tensor batch/channel dimensions".to_string(),
                expected: 1,
                actual: shape[0] * shape[1],
            });
        }
        Ok(Self { data })
    }

    pub fn zeros(width: u32, height: u32) -> Self {
        Self {
            data: Array4::zeros((1, 1, height as usize, width as usize)),
        }
    }

    pub fn width(&self) -> usize {
        self.data.shape()[3]
    }

    pub fn height(&self) -> usize {
        self.data.shape()[2]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    pub fn into_inner(self) -> Array4<f32> {
        self.data
    }
}

/// ITU-R BT.601 luma of an 8-bit RGB sample.
pub fn luminance(r: u8, g: u8, b: u8) -> f32 {
    0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
}

/// Maps `[0, 255]` luminance onto `[-1, 1]`.
pub fn normalize_luminance(luminance: f32) -> f32 {
    // The weights sum to slightly above 1.0 in f32.
    ((luminance / 255.0 - 0.5) / 0.5).clamp(-1.0, 1.0)
}

/// Converts an asset to the grayscale tensor the model expects. No resizing is done, so the
/// tensor has exactly one value per source pixel.
pub fn encode(asset: &ImageAsset) -> Result<InputTensor> {
    let _span = tracing::debug_span!("encode", width = asset.width(), height = asset.height())
        .entered();

    let width = asset.width() as usize;
    let height = asset.height() as usize;
    let values: Vec<f32> = asset
        .pixels()
        .as_raw()
        .par_chunks_exact(4)
        .map(|p| normalize_luminance(luminance(p[0], p[1], p[2])))
        .collect();

    let data = Array4::from_shape_vec((1, 1, height, width), values).map_err(|_| {
        SonoSegError::ShapeMismatch {
            what: "input tensor".to_string(),
            expected: width * height,
            actual: asset.pixels().as_raw().len() / 4,
        }
    })?;

    InputTensor::from_array(data)
}

/// Reinterprets a flat segmentation buffer as a `height x width` view without copying.
pub fn decode_mask(buffer: &[f32], width: u32, height: u32) -> Result<ArrayView2<'_, f32>> {
    let expected = width as usize * height as usize;
    if buffer.len() != expected {
        return Err(SonoSegError::ShapeMismatch {
            what: "segmentation mask".to_string(),
            expected,
            actual: buffer.len(),
        });
    }
    Ok(ArrayView2::from_shape((height as usize, width as usize), buffer)?)
}
