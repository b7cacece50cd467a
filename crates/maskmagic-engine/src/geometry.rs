//! Crops arbitrary input to the square canvas the edit service requires.

use image::imageops::{self, FilterType};
use maskmagic_contracts::config::ServiceConfig;

use crate::error::{mib, PipelineError, Result};
use crate::orientation::normalize_orientation;
use crate::raster::RasterImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanvasSpec {
    pub canvas: u32,
    pub fallback_canvas: u32,
    pub max_bytes: u64,
}

impl CanvasSpec {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            canvas: config.canvas_size,
            fallback_canvas: config.fallback_canvas_size,
            max_bytes: config.local_max_bytes,
        }
    }
}

impl Default for CanvasSpec {
    fn default() -> Self {
        Self::from_config(&ServiceConfig::default())
    }
}

/// `prepare` with the service's default canvas and local byte ceiling.
pub fn prepare(image: RasterImage) -> Result<RasterImage> {
    prepare_with(image, &CanvasSpec::default())
}

/// Center-crops to a square, resizes to the canvas at scale 1, and falls back
/// to the smaller canvas when the lossless encoding breaks the byte ceiling.
pub fn prepare_with(image: RasterImage, layout: &CanvasSpec) -> Result<RasterImage> {
    if !image.has_area() {
        return Err(PipelineError::InvalidGeometry {
            width: image.width(),
            height: image.height(),
        });
    }
    tracing::info!(
        width = image.width(),
        height = image.height(),
        scale = image.scale(),
        "preparing image for the edit service"
    );

    if let Some(bytes) = already_prepared(&image, layout)? {
        tracing::debug!(bytes, "image is already a prepared canvas");
        return Ok(image);
    }

    let upright = normalize_orientation(image);
    let (width, height) = (upright.width(), upright.height());
    let side = width.min(height);
    let x = (width - side) / 2;
    let y = (height - side) / 2;
    tracing::debug!(side, x, y, "cropping to centered square");

    let square = imageops::crop_imm(upright.pixels(), x, y, side, side).to_image();
    let canvas = resize_square(RasterImage::new(square), layout.canvas);
    let bytes = canvas.encode_png()?.len() as u64;
    tracing::info!(
        canvas = layout.canvas,
        size_mb = %mib(&bytes),
        "prepared canvas encoded"
    );
    if bytes <= layout.max_bytes {
        return Ok(canvas);
    }

    tracing::warn!(
        size_mb = %mib(&bytes),
        fallback = layout.fallback_canvas,
        "prepared canvas over budget, trying smaller canvas"
    );
    let smaller = resize_square(canvas, layout.fallback_canvas);
    let bytes = smaller.encode_png()?.len() as u64;
    if bytes > layout.max_bytes {
        return Err(PipelineError::ImageTooLarge {
            bytes,
            limit: layout.max_bytes,
        });
    }
    Ok(smaller)
}

/// Byte size of `image` when it is already a full-size canvas, `None` otherwise.
/// A fallback-sized square still goes back through the canvas resize.
fn already_prepared(image: &RasterImage, layout: &CanvasSpec) -> Result<Option<u64>> {
    let shaped = image.is_canonical()
        && image.scale() == 1.0
        && image.stored_dimensions() == (layout.canvas, layout.canvas);
    if !shaped {
        return Ok(None);
    }
    let bytes = image.encode_png()?.len() as u64;
    Ok((bytes <= layout.max_bytes).then_some(bytes))
}

fn resize_square(image: RasterImage, side: u32) -> RasterImage {
    if image.stored_dimensions() == (side, side) {
        return image.with_scale(1.0);
    }
    let resized = imageops::resize(image.pixels(), side, side, FilterType::Triangle);
    RasterImage::new(resized)
}
