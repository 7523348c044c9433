use std::path::Path;

use image::{imageops, RgbaImage};
use ndarray::ArrayView2;
use rayon::prelude::*;

use crate::codec::decode_mask;
use crate::config::{DEFAULT_THRESHOLD, MAX_THRESHOLD, MIN_THRESHOLD};
use crate::errors::{Result, SonoSegError};

/// Segmentation sensitivity. Mask values strictly above it are painted.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Threshold(f32);

impl Threshold {
    pub fn new(value: f32) -> Result<Self> {
        if !(MIN_THRESHOLD..=MAX_THRESHOLD).contains(&value) {
            return Err(SonoSegError::Validation {
                field: "threshold".to_string(),
                reason: format!(
                    "must be between {} and {}, got {}",
                    MIN_THRESHOLD, MAX_THRESHOLD, value
                ),
            });
        }
        Ok(Self(value))
    }

    /// Clamps into range instead of failing; NaN falls back to the default.
    pub fn clamped(value: f32) -> Self {
        if value.is_nan() {
            return Self::default();
        }
        Self(value.clamp(MIN_THRESHOLD, MAX_THRESHOLD))
    }

    pub const fn value(self) -> f32 {
        self.0
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self(DEFAULT_THRESHOLD)
    }
}

impl TryFrom<f32> for Threshold {
    type Error = SonoSegError;

    fn try_from(value: f32) -> Result<Self> {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayStyle {
    pub color: [u8; 3],
    pub alpha: u8,
}

impl Default for OverlayStyle {
    /// Red at 40% opacity.
    fn default() -> Self {
        Self {
            color: [255, 0, 0],
            alpha: 102,
        }
    }
}

/// A 2D drawing target the compositor writes into.
pub trait Surface {
    /// Returns the pixel buffer, sized exactly `width x height`.
    fn acquire(&mut self, width: u32, height: u32) -> Result<&mut RgbaImage>;
}

/// In-memory surface, reallocated whenever the requested size changes.
#[derive(Debug, Default)]
pub struct RgbaSurface {
    canvas: Option<RgbaImage>,
}

impl RgbaSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn image(&self) -> Option<&RgbaImage> {
        self.canvas.as_ref()
    }

    pub fn into_image(self) -> Option<RgbaImage> {
        self.canvas
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let canvas = self
            .canvas
            .as_ref()
            .ok_or_else(|| SonoSegError::SurfaceUnavailable {
                reason: "nothing has been rendered yet".to_string(),
            })?;
        canvas.save(path).map_err(|e| SonoSegError::SurfaceUnavailable {
            reason: format!("failed to save {}: {}", path.display(), e),
        })
    }
}

impl Surface for RgbaSurface {
    fn acquire(&mut self, width: u32, height: u32) -> Result<&mut RgbaImage> {
        if width == 0 || height == 0 {
            return Err(SonoSegError::SurfaceUnavailable {
                reason: format!("cannot allocate a {}x{} surface", width, height),
            });
        }
        if self.canvas.as_ref().map(|c| c.dimensions()) != Some((width, height)) {
            self.canvas = None;
        }
        Ok(self
            .canvas
            .get_or_insert_with(|| RgbaImage::new(width, height)))
    }
}

/// Builds the transparent layer with `style` painted wherever `mask > threshold`.
pub fn mask_layer(mask: ArrayView2<'_, f32>, threshold: Threshold, style: OverlayStyle) -> RgbaImage {
    let (height, width) = mask.dim();
    let mut layer = RgbaImage::new(width as u32, height as u32);
    if width == 0 || height == 0 {
        return layer;
    }

    let [r, g, b] = style.color;
    let paint = [r, g, b, style.alpha];
    let cutoff = threshold.value();

    layer
        .par_chunks_mut(width * 4)
        .enumerate()
        .for_each(|(y, row)| {
            for (pixel, &value) in row.chunks_exact_mut(4).zip(mask.row(y).iter()) {
                if value > cutoff {
                    pixel.copy_from_slice(&paint);
                }
            }
        });

    layer
}

/// Draws `base` at native resolution and composites the thresholded mask over it.
///
/// Depends only on its arguments, so changing the threshold is a re-render, never a re-inference.
pub fn render<S: Surface + ?Sized>(
    surface: &mut S,
    base: &RgbaImage,
    mask: &[f32],
    threshold: Threshold,
) -> Result<()> {
    render_with_style(surface, base, mask, threshold, OverlayStyle::default())
}

pub fn render_with_style<S: Surface + ?Sized>(
    surface: &mut S,
    base: &RgbaImage,
    mask: &[f32],
    threshold: Threshold,
    style: OverlayStyle,
) -> Result<()> {
    let (width, height) = base.dimensions();
    let mask = decode_mask(mask, width, height)?;
    let canvas = surface.acquire(width, height)?;

    canvas.copy_from_slice(base.as_raw());
    let layer = mask_layer(mask, threshold, style);
    imageops::overlay(canvas, &layer, 0, 0);

    tracing::debug!(width, height, threshold = threshold.value(), "overlay rendered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::UnavailableSurface;
    use image::Rgba;

    const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);

    fn base(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_pixel(width, height, BLACK)
    }

    #[test]
    fn test_threshold_range() {
        assert!(Threshold::new(0.05).is_ok());
        assert!(Threshold::new(0.95).is_ok());
        assert!(matches!(
            Threshold::new(0.04),
            Err(SonoSegError::Validation { .. })
        ));
        assert!(Threshold::try_from(1.5).is_err());
        assert_eq!(Threshold::default().value(), 0.5);
        assert_eq!(Threshold::clamped(2.0).value(), MAX_THRESHOLD);
        assert_eq!(Threshold::clamped(f32::NAN), Threshold::default());
    }

    #[test]
    fn test_strict_threshold() -> Result<()> {
        // (0,0) = 0.6 is above, (1,0) = 0.5 sits exactly on the threshold.
        let mask = [0.6, 0.5, 0.1, 0.9];
        let view = decode_mask(&mask, 2, 2)?;
        let layer = mask_layer(view, Threshold::new(0.5)?, OverlayStyle::default());

        assert_eq!(layer.get_pixel(0, 0), &Rgba([255, 0, 0, 102]));
        assert_eq!(layer.get_pixel(1, 0), &Rgba([0, 0, 0, 0]));
        assert_eq!(layer.get_pixel(0, 1), &Rgba([0, 0, 0, 0]));
        assert_eq!(layer.get_pixel(1, 1), &Rgba([255, 0, 0, 102]));
        Ok(())
    }

    #[test]
    fn test_render_composites_over_base() -> Result<()> {
        let mut surface = RgbaSurface::new();
        render(&mut surface, &base(2, 1), &[0.6, 0.5], Threshold::new(0.5)?)?;

        let canvas = surface.image().unwrap();
        let marked = canvas.get_pixel(0, 0);
        assert!((marked[0] as i32 - 102).abs() <= 1, "got {:?}", marked);
        assert_eq!(marked[1], 0);
        assert_eq!(marked[3], 255);
        assert_eq!(canvas.get_pixel(1, 0), &BLACK);
        Ok(())
    }

    #[test]
    fn test_render_has_no_hidden_state() -> Result<()> {
        let image = RgbaImage::from_fn(4, 4, |x, y| Rgba([(x * 40) as u8, (y * 40) as u8, 90, 255]));
        let mask: Vec<f32> = (0..16).map(|i| i as f32 / 16.0).collect();

        let mut reused = RgbaSurface::new();
        render(&mut reused, &image, &mask, Threshold::new(0.2)?)?;
        render(&mut reused, &image, &mask, Threshold::new(0.7)?)?;

        let mut fresh = RgbaSurface::new();
        render(&mut fresh, &image, &mask, Threshold::new(0.7)?)?;

        assert_eq!(reused.image(), fresh.image());
        Ok(())
    }

    #[test]
    fn test_surface_resizes() -> Result<()> {
        let mut surface = RgbaSurface::new();
        assert_eq!(surface.acquire(3, 2)?.dimensions(), (3, 2));
        assert_eq!(surface.acquire(5, 5)?.dimensions(), (5, 5));
        assert!(matches!(
            surface.acquire(0, 5),
            Err(SonoSegError::SurfaceUnavailable { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_render_surface_unavailable() {
        let err = render(
            &mut UnavailableSurface,
            &base(2, 2),
            &[0.9; 4],
            Threshold::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SonoSegError::SurfaceUnavailable { .. }));
    }

    #[test]
    fn test_render_mask_size_mismatch() {
        let mut surface = RgbaSurface::new();
        let err = render(&mut surface, &base(2, 2), &[0.9; 3], Threshold::default()).unwrap_err();
        assert!(matches!(err, SonoSegError::ShapeMismatch { .. }));
        assert!(surface.image().is_none());
    }

    #[test]
    fn test_custom_style() -> Result<()> {
        let style = OverlayStyle {
            color: [0, 255, 0],
            alpha: 255,
        };
        let mut surface = RgbaSurface::new();
        render_with_style(&mut surface, &base(1, 1), &[0.9], Threshold::default(), style)?;
        assert_eq!(surface.image().unwrap().get_pixel(0, 0), &Rgba([0, 255, 0, 255]));
        Ok(())
    }
}
