//! Classified failures of the generation pipeline.

use std::fmt;

use thiserror::Error;

use crate::raster::Geometry;

/// Which encoded file broke the service ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadPart {
    Image,
    Mask,
}

impl fmt::Display for PayloadPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image => f.write_str("Image"),
            Self::Mask => f.write_str("Mask"),
        }
    }
}

/// Every stage fails fast with one of these; none is retried.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid image geometry {width}x{height}")]
    InvalidGeometry { width: u32, height: u32 },

    #[error("prompt must not be empty")]
    EmptyPrompt,

    #[error("image is too large for the API ({} MB, limit {} MB)", mib(.bytes), mib(.limit))]
    ImageTooLarge { bytes: u64, limit: u64 },

    #[error("{part} size exceeds {} MB limit ({} MB)", mib(.limit), mib(.bytes))]
    PayloadTooLarge {
        part: PayloadPart,
        bytes: u64,
        limit: u64,
    },

    #[error("failed to generate mask: {0}")]
    MaskGenerationFailed(String),

    #[error("the mask ({mask}) and image ({image}) sizes don't match and couldn't be fixed")]
    SizeMismatch { image: Geometry, mask: Geometry },

    #[error("failed to compress image below {max_bytes} bytes (smallest candidate {smallest_bytes} bytes)")]
    CompressionFailed { max_bytes: u64, smallest_bytes: u64 },

    /// Displays the backend's message verbatim.
    #[error("{message}")]
    RemoteError { status_code: u16, message: String },

    #[error("failed to decode result: {0}")]
    DecodeError(String),

    #[error("network error: {0}")]
    TransportError(String),

    #[error("failed to encode image: {0}")]
    Encode(#[from] image::ImageError),
}

/// Copyable tag for a [`PipelineError`], used in stage trails and event logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    InvalidGeometry,
    EmptyPrompt,
    ImageTooLarge,
    PayloadTooLarge,
    MaskGenerationFailed,
    SizeMismatch,
    CompressionFailed,
    RemoteError,
    DecodeError,
    TransportError,
    Encode,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidGeometry => "invalid_geometry",
            Self::EmptyPrompt => "empty_prompt",
            Self::ImageTooLarge => "image_too_large",
            Self::PayloadTooLarge => "payload_too_large",
            Self::MaskGenerationFailed => "mask_generation_failed",
            Self::SizeMismatch => "size_mismatch",
            Self::CompressionFailed => "compression_failed",
            Self::RemoteError => "remote_error",
            Self::DecodeError => "decode_error",
            Self::TransportError => "transport_error",
            Self::Encode => "encode",
        }
    }
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidGeometry { .. } => FailureKind::InvalidGeometry,
            Self::EmptyPrompt => FailureKind::EmptyPrompt,
            Self::ImageTooLarge { .. } => FailureKind::ImageTooLarge,
            Self::PayloadTooLarge { .. } => FailureKind::PayloadTooLarge,
            Self::MaskGenerationFailed(_) => FailureKind::MaskGenerationFailed,
            Self::SizeMismatch { .. } => FailureKind::SizeMismatch,
            Self::CompressionFailed { .. } => FailureKind::CompressionFailed,
            Self::RemoteError { .. } => FailureKind::RemoteError,
            Self::DecodeError(_) => FailureKind::DecodeError,
            Self::TransportError(_) => FailureKind::TransportError,
            Self::Encode(_) => FailureKind::Encode,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

pub(crate) fn mib(bytes: &u64) -> String {
    format!("{:.2}", *bytes as f64 / (1024.0 * 1024.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_displays_message_verbatim() {
        let err = PipelineError::RemoteError {
            status_code: 500,
            message: "rate limited".to_string(),
        };
        assert_eq!(err.to_string(), "rate limited");
        assert_eq!(err.kind(), FailureKind::RemoteError);
    }

    #[test]
    fn payload_error_names_part_and_sizes() {
        let err = PipelineError::PayloadTooLarge {
            part: PayloadPart::Mask,
            bytes: 5 * 1024 * 1024,
            limit: 4 * 1024 * 1024,
        };
        assert_eq!(err.to_string(), "Mask size exceeds 4.00 MB limit (5.00 MB)");
        assert_eq!(err.kind().as_str(), "payload_too_large");
    }
}
