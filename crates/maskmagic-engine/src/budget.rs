//! Fits an image under a byte ceiling: first by shrinking it losslessly, then by
//! lossy compression as a last resort.

use image::imageops::{self, FilterType};
use maskmagic_contracts::config::ServiceConfig;

use crate::error::{mib, PipelineError, Result};
use crate::orientation::normalize_orientation;
use crate::raster::RasterImage;

const SCALE_STEP: f64 = 0.8;
const SCALE_FLOOR: f64 = 0.3;
const JPEG_QUALITY_START: u8 = 90;
const JPEG_QUALITY_STEP: u8 = 10;
const JPEG_QUALITY_STOP: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetPolicy {
    pub max_bytes: u64,
    /// Resolution reduction never yields a shorter side below this.
    pub min_dimension: u32,
}

impl BudgetPolicy {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            min_dimension: ServiceConfig::default().min_resolution,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            max_bytes: config.local_max_bytes,
            min_dimension: config.min_resolution,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Png,
    Jpeg { quality: u8 },
}

impl Encoding {
    pub fn mime(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg { .. } => "image/jpeg",
        }
    }
}

/// An upright image together with the encoding that met the budget.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedImage {
    pub image: RasterImage,
    pub encoding: Encoding,
    pub bytes: Vec<u8>,
}

impl FittedImage {
    pub fn encoded_len(&self) -> u64 {
        self.bytes.len() as u64
    }
}

pub fn fit_to_budget(image: RasterImage, max_bytes: u64) -> Result<FittedImage> {
    fit_to_budget_with(image, &BudgetPolicy::new(max_bytes))
}

pub fn fit_to_budget_with(image: RasterImage, policy: &BudgetPolicy) -> Result<FittedImage> {
    if !image.has_area() {
        return Err(PipelineError::InvalidGeometry {
            width: image.width(),
            height: image.height(),
        });
    }

    let image = normalize_orientation(image);
    let original = image.encode_png()?;
    let mut smallest = original.len() as u64;
    tracing::debug!(size_mb = %mib(&smallest), "original PNG size");
    if smallest <= policy.max_bytes {
        return Ok(FittedImage {
            image,
            encoding: Encoding::Png,
            bytes: original,
        });
    }

    let (width, height) = image.stored_dimensions();
    let mut scale = 1.0_f64;
    loop {
        scale *= SCALE_STEP;
        if scale < SCALE_FLOOR {
            break;
        }
        let target_width = ((f64::from(width) * scale).round() as u32).max(1);
        let target_height = ((f64::from(height) * scale).round() as u32).max(1);
        if target_width.min(target_height) < policy.min_dimension {
            tracing::debug!(
                target_width,
                target_height,
                floor = policy.min_dimension,
                "resolution floor reached"
            );
            break;
        }

        let resized = RasterImage::new(imageops::resize(
            image.pixels(),
            target_width,
            target_height,
            FilterType::Triangle,
        ));
        let bytes = resized.encode_png()?;
        let size = bytes.len() as u64;
        tracing::debug!(target_width, target_height, size_mb = %mib(&size), "resized candidate");
        smallest = smallest.min(size);
        if size <= policy.max_bytes {
            return Ok(FittedImage {
                image: resized,
                encoding: Encoding::Png,
                bytes,
            });
        }
    }

    let mut quality = JPEG_QUALITY_START;
    while quality > JPEG_QUALITY_STOP {
        let bytes = image.encode_jpeg(quality)?;
        let size = bytes.len() as u64;
        tracing::debug!(quality, size_mb = %mib(&size), "JPEG candidate");
        smallest = smallest.min(size);
        if size <= policy.max_bytes {
            let compressed = RasterImage::decode(&bytes)?;
            return Ok(FittedImage {
                image: compressed,
                encoding: Encoding::Jpeg { quality },
                bytes,
            });
        }
        quality -= JPEG_QUALITY_STEP;
    }

    tracing::warn!(max_bytes = policy.max_bytes, smallest, "failed to compress image");
    Err(PipelineError::CompressionFailed {
        max_bytes: policy.max_bytes,
        smallest_bytes: smallest,
    })
}
