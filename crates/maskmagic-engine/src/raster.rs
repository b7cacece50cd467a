use std::fmt;
use std::io::Cursor;
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::metadata::Orientation;
use image::{
    DynamicImage, ExtendedColorType, ImageDecoder, ImageEncoder, ImageReader, Rgb, RgbImage,
    RgbaImage,
};

use crate::error::{PipelineError, Result};

/// Logical width/height plus pixel-density scale. Two images are congruent iff
/// their geometries are equal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub scale: f32,
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}x", self.width, self.height, self.scale)
    }
}

/// An RGBA raster as it travels through the pipeline.
///
/// Pixels are kept in storage order; `orientation` says how they must be
/// transformed for display. `width()`/`height()` report the displayed size.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterImage {
    pixels: RgbaImage,
    scale: f32,
    orientation: Orientation,
}

impl RasterImage {
    pub fn new(pixels: RgbaImage) -> Self {
        Self {
            pixels,
            scale: 1.0,
            orientation: Orientation::NoTransforms,
        }
    }

    pub fn from_dynamic(image: DynamicImage) -> Self {
        Self::new(image.into_rgba8())
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn width(&self) -> u32 {
        if swaps_axes(self.orientation) {
            self.pixels.height()
        } else {
            self.pixels.width()
        }
    }

    pub fn height(&self) -> u32 {
        if swaps_axes(self.orientation) {
            self.pixels.width()
        } else {
            self.pixels.height()
        }
    }

    pub fn stored_dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn is_canonical(&self) -> bool {
        self.orientation == Orientation::NoTransforms
    }

    pub fn has_area(&self) -> bool {
        self.pixels.width() > 0 && self.pixels.height() > 0
    }

    pub fn geometry(&self) -> Geometry {
        Geometry {
            width: self.width(),
            height: self.height(),
            scale: self.scale,
        }
    }

    pub fn is_congruent(&self, other: &RasterImage) -> bool {
        self.geometry() == other.geometry()
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn into_pixels(self) -> RgbaImage {
        self.pixels
    }

    /// Lossless encoding of the stored pixels.
    pub fn encode_png(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        PngEncoder::new(&mut bytes).write_image(
            self.pixels.as_raw(),
            self.pixels.width(),
            self.pixels.height(),
            ExtendedColorType::Rgba8,
        )?;
        Ok(bytes)
    }

    /// Lossy encoding; alpha is flattened onto white first.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let flattened = RgbImage::from_fn(self.pixels.width(), self.pixels.height(), |x, y| {
            let pixel = self.pixels.get_pixel(x, y);
            let alpha = u16::from(pixel[3]);
            let blend = |channel: u8| -> u8 {
                (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
            };
            Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])])
        });
        let mut bytes = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100));
        encoder.encode_image(&flattened)?;
        Ok(bytes)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|err| {
            PipelineError::DecodeError(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::decode(&bytes)
    }

    /// Decodes PNG/JPEG bytes, keeping the stored orientation tag.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|err| PipelineError::DecodeError(format!("unreadable image data: {err}")))?;
        let mut decoder = reader
            .into_decoder()
            .map_err(|err| PipelineError::DecodeError(format!("unsupported image data: {err}")))?;
        let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
        let image = DynamicImage::from_decoder(decoder)
            .map_err(|err| PipelineError::DecodeError(format!("failed to decode image: {err}")))?;
        Ok(Self::from_dynamic(image).with_orientation(orientation))
    }
}

pub(crate) fn swaps_axes(orientation: Orientation) -> bool {
    matches!(
        orientation,
        Orientation::Rotate90
            | Orientation::Rotate270
            | Orientation::Rotate90FlipH
            | Orientation::Rotate270FlipH
    )
}


#[cfg(test)]
mod tests {
    use image::metadata::Orientation;

    use super::testing::{noise, solid};
    use super::*;

    #[test]
    fn logical_dimensions_follow_orientation() {
        let image = RasterImage::new(solid(40, 20, [1, 2, 3, 255]));
        assert_eq!((image.width(), image.height()), (40, 20));

        let rotated = image.with_orientation(Orientation::Rotate90);
        assert_eq!((rotated.width(), rotated.height()), (20, 40));
        assert_eq!(rotated.stored_dimensions(), (40, 20));

        let flipped = rotated.with_orientation(Orientation::FlipVertical);
        assert_eq!((flipped.width(), flipped.height()), (40, 20));
    }

    #[test]
    fn congruence_requires_matching_scale() {
        let a = RasterImage::new(solid(8, 8, [0, 0, 0, 255]));
        let b = RasterImage::new(solid(8, 8, [9, 9, 9, 0]));
        assert!(a.is_congruent(&b));
        assert!(!a.is_congruent(&b.clone().with_scale(2.0)));
        assert!(!a.is_congruent(&RasterImage::new(solid(8, 9, [0, 0, 0, 255]))));
        assert_eq!(a.geometry().to_string(), "8x8@1x");
    }

    #[test]
    fn png_encoding_is_lossless() -> anyhow::Result<()> {
        let image = RasterImage::new(noise(17, 9, 7));
        let decoded = RasterImage::decode(&image.encode_png()?)?;
        assert_eq!(decoded.pixels(), image.pixels());
        assert!(decoded.is_canonical());
        Ok(())
    }

    #[test]
    fn jpeg_encoding_drops_alpha() -> anyhow::Result<()> {
        let image = RasterImage::new(solid(16, 16, [200, 10, 10, 255]));
        let bytes = image.encode_jpeg(90)?;
        assert_eq!(image::guess_format(&bytes)?, image::ImageFormat::Jpeg);
        let decoded = RasterImage::decode(&bytes)?;
        assert_eq!(decoded.stored_dimensions(), (16, 16));
        assert!(decoded.pixels().pixels().all(|pixel| pixel[3] == 255));
        Ok(())
    }

    #[test]
    fn open_reads_files_from_disk() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("in.png");
        let image = RasterImage::new(noise(5, 4, 3));
        std::fs::write(&path, image.encode_png()?)?;
        assert_eq!(RasterImage::open(&path)?, image);
        assert!(matches!(
            RasterImage::open(&dir.path().join("missing.png")),
            Err(PipelineError::DecodeError(_))
        ));
        Ok(())
    }

    #[test]
    fn decode_rejects_non_image_bytes() {
        let err = RasterImage::decode(b"definitely not a png").err();
        assert!(matches!(err, Some(PipelineError::DecodeError(_))));
    }
}
