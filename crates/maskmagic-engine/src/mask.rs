//! Binary-alpha inpainting masks.
//!
//! Opaque black marks pixels the service must keep; the fully transparent
//! centered region is what it may repaint.

use std::fmt;
use std::str::FromStr;

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};

use crate::error::{PipelineError, Result};
use crate::raster::RasterImage;

pub const DEFAULT_COVERAGE: f64 = 0.5;

const KEEP: Rgba<u8> = Rgba([0, 0, 0, 255]);
const EDIT: Rgba<u8> = Rgba([0, 0, 0, 0]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskShape {
    Circle,
    Rectangle,
}

impl MaskShape {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Circle => "circle",
            Self::Rectangle => "rectangle",
        }
    }
}

impl fmt::Display for MaskShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MaskShape {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "circle" => Ok(Self::Circle),
            "rectangle" | "rect" => Ok(Self::Rectangle),
            other => Err(format!(
                "unknown mask shape '{other}' (expected circle or rectangle)"
            )),
        }
    }
}

/// Builds a mask congruent to `target` with a transparent centered `shape`.
///
/// Circle diameter is `min(width, height) * coverage`; the rectangle spans
/// `width * coverage` by `height * coverage`. A pixel belongs to the region when
/// its center does.
pub fn generate_mask(target: &RasterImage, shape: MaskShape, coverage: f64) -> Result<RasterImage> {
    let (width, height) = (target.width(), target.height());
    if width == 0 || height == 0 {
        return Err(PipelineError::InvalidGeometry { width, height });
    }
    if !coverage.is_finite() || !(0.0..=1.0).contains(&coverage) {
        return Err(PipelineError::MaskGenerationFailed(format!(
            "coverage {coverage} outside 0..=1"
        )));
    }

    let mut pixels = RgbaImage::from_pixel(width, height, KEEP);
    let center_x = f64::from(width) / 2.0;
    let center_y = f64::from(height) / 2.0;
    match shape {
        MaskShape::Circle => {
            let radius = f64::from(width.min(height)) * coverage / 2.0;
            tracing::debug!(center_x, center_y, radius, "carving transparent circle");
            let radius_sq = radius * radius;
            clear_where(&mut pixels, |px, py| {
                let dx = px - center_x;
                let dy = py - center_y;
                dx * dx + dy * dy <= radius_sq
            });
        }
        MaskShape::Rectangle => {
            let rect_width = f64::from(width) * coverage;
            let rect_height = f64::from(height) * coverage;
            let left = center_x - rect_width / 2.0;
            let top = center_y - rect_height / 2.0;
            tracing::debug!(left, top, rect_width, rect_height, "carving transparent rectangle");
            clear_where(&mut pixels, |px, py| {
                px >= left && px < left + rect_width && py >= top && py < top + rect_height
            });
        }
    }

    let mask = RasterImage::new(pixels).with_scale(target.scale());
    if mask.is_congruent(target) {
        tracing::debug!(shape = %shape, geometry = %mask.geometry(), "mask generated");
        return Ok(mask);
    }

    tracing::warn!(
        mask = %mask.geometry(),
        image = %target.geometry(),
        "mask does not match image, re-rendering"
    );
    let fitted = fit_mask(&mask, target)?;
    if !fitted.is_congruent(target) {
        return Err(PipelineError::MaskGenerationFailed(format!(
            "mask {} could not be matched to image {}",
            fitted.geometry(),
            target.geometry()
        )));
    }
    Ok(fitted)
}

/// Re-renders `mask` at exactly the target's logical size and scale, keeping
/// alpha strictly binary.
pub fn fit_mask(mask: &RasterImage, target: &RasterImage) -> Result<RasterImage> {
    let (width, height) = (target.width(), target.height());
    if width == 0 || height == 0 {
        return Err(PipelineError::InvalidGeometry { width, height });
    }
    if !mask.has_area() {
        return Err(PipelineError::MaskGenerationFailed(
            "cannot fit an empty mask".to_string(),
        ));
    }

    let upright = crate::orientation::normalize_orientation(mask.clone());
    let mut pixels = if upright.stored_dimensions() == (width, height) {
        upright.into_pixels()
    } else {
        imageops::resize(upright.pixels(), width, height, FilterType::Nearest)
    };
    for pixel in pixels.pixels_mut() {
        *pixel = if pixel[3] >= 128 { KEEP } else { EDIT };
    }
    Ok(RasterImage::new(pixels).with_scale(target.scale()))
}

fn clear_where(pixels: &mut RgbaImage, inside: impl Fn(f64, f64) -> bool) {
    for (x, y, pixel) in pixels.enumerate_pixels_mut() {
        if inside(f64::from(x) + 0.5, f64::from(y) + 0.5) {
            *pixel = EDIT;
        }
    }
}
