//! Workspace image files: listing, uploads, thumbnails, edits, WebP cache,
//! datasets and the caption files written next to images.

pub mod captions;
pub mod datasets;
pub mod edit;
pub mod images;
pub mod paths;
pub mod thumbnails;
pub mod uploads;
pub mod webp;

use std::path::Path;

use anyhow::Context;
use image::{DynamicImage, ImageFormat};

pub use paths::{
    relative_to, sanitize_filename, secure_path, validate_filename, PathError, SecurePath,
    SecurePathOptions,
};

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    TooLarge(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl MediaError {
    /// Path errors split into "does not exist" and "not allowed".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            MediaError::NotFound(_) | MediaError::Path(PathError::Missing)
        )
    }
}

/// Longest side a generated image may have.
pub const MAX_OUTPUT_SIDE: u32 = 16_384;
/// Pixel budget of a generated image (16383 x 16383).
pub const MAX_OUTPUT_PIXELS: u64 = 268_402_689;

/// Rejects thumbnail and resize targets larger than the output limits.
pub fn check_output_size(width: u32, height: u32) -> Result<(), MediaError> {
    let pixels = u64::from(width) * u64::from(height);
    if width > MAX_OUTPUT_SIDE || height > MAX_OUTPUT_SIDE || pixels > MAX_OUTPUT_PIXELS {
        return Err(MediaError::Invalid(format!(
            "Requested size {width}x{height} exceeds the limit of {MAX_OUTPUT_SIDE}px per side \
             and {MAX_OUTPUT_PIXELS} pixels"
        )));
    }
    Ok(())
}

/// Saves `img` in the format implied by `path`, dropping alpha for JPEG.
pub(crate) fn save_image(img: &DynamicImage, path: &Path) -> anyhow::Result<()> {
    let format = ImageFormat::from_path(path)
        .with_context(|| format!("unsupported output format: {}", path.display()))?;
    save_image_as(img, path, format)
}

pub(crate) fn save_image_as(
    img: &DynamicImage,
    path: &Path,
    format: ImageFormat,
) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }
    let result = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8()).save_with_format(path, format),
        ImageFormat::WebP => DynamicImage::ImageRgba8(img.to_rgba8()).save_with_format(path, format),
        _ => img.save_with_format(path, format),
    };
    result.with_context(|| format!("failed to write image: {}", path.display()))
}
