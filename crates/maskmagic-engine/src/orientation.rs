//! Rewrites oriented rasters into canonical top-left-origin storage.

use image::metadata::Orientation;
use image::DynamicImage;

use crate::raster::RasterImage;

/// Logical size changed while re-rendering; callers should log this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionAnomaly {
    pub expected: (u32, u32),
    pub actual: (u32, u32),
}

impl DimensionAnomaly {
    pub fn is_transposed(&self) -> bool {
        self.expected != self.actual && self.expected == (self.actual.1, self.actual.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedOrientation {
    pub image: RasterImage,
    pub anomaly: Option<DimensionAnomaly>,
}

/// Returns `image` unchanged when already canonical; otherwise re-renders it so
/// the stored raster has the logical width/height and no orientation tag.
pub fn normalize_orientation(image: RasterImage) -> RasterImage {
    let normalized = normalize_orientation_report(image);
    if let Some(anomaly) = normalized.anomaly {
        tracing::warn!(
            expected_width = anomaly.expected.0,
            expected_height = anomaly.expected.1,
            actual_width = anomaly.actual.0,
            actual_height = anomaly.actual.1,
            transposed = anomaly.is_transposed(),
            "image dimensions changed during orientation fix"
        );
    }
    normalized.image
}

pub fn normalize_orientation_report(image: RasterImage) -> NormalizedOrientation {
    if image.is_canonical() {
        tracing::debug!("image already in UP orientation, not fixing");
        return NormalizedOrientation {
            image,
            anomaly: None,
        };
    }

    let orientation = image.orientation();
    let expected = (image.width(), image.height());
    let scale = image.scale();
    tracing::debug!(
        orientation = describe_orientation(orientation),
        width = expected.0,
        height = expected.1,
        scale,
        "re-rendering oriented image"
    );

    let mut rendered = DynamicImage::ImageRgba8(image.into_pixels());
    rendered.apply_orientation(orientation);
    let fixed = RasterImage::from_dynamic(rendered).with_scale(scale);

    let actual = (fixed.width(), fixed.height());
    let anomaly = (actual != expected).then_some(DimensionAnomaly { expected, actual });
    NormalizedOrientation {
        image: fixed,
        anomaly,
    }
}

pub fn describe_orientation(orientation: Orientation) -> &'static str {
    match orientation {
        Orientation::NoTransforms => "UP (0°)",
        Orientation::Rotate180 => "DOWN (180°)",
        Orientation::Rotate270 => "LEFT (90° CCW)",
        Orientation::Rotate90 => "RIGHT (90° CW)",
        Orientation::FlipHorizontal => "UP MIRRORED",
        Orientation::FlipVertical => "DOWN MIRRORED",
        Orientation::Rotate90FlipH => "LEFT MIRRORED",
        Orientation::Rotate270FlipH => "RIGHT MIRRORED",
    }
}
