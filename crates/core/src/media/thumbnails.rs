use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use image::imageops::FilterType;
use image::ImageFormat;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{check_output_size, save_image_as, MediaError, SecurePath};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailFormat {
    Webp,
    Jpeg,
    Png,
}

impl ThumbnailFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "webp" => Some(Self::Webp),
            "jpeg" | "jpg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Webp => "webp",
            Self::Jpeg => "jpeg",
            Self::Png => "png",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Webp => "image/webp",
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }

    fn image_format(self) -> ImageFormat {
        match self {
            Self::Webp => ImageFormat::WebP,
            Self::Jpeg => ImageFormat::Jpeg,
            Self::Png => ImageFormat::Png,
        }
    }
}

/// `<sha256(path + W + "x" + H + format)>_<W>x<H>.<format>`
pub fn thumbnail_file_name(relative: &str, width: u32, height: u32, format: ThumbnailFormat) -> String {
    let digest = Sha256::digest(format!("{relative}{width}x{height}{}", format.as_str()).as_bytes());
    format!("{digest:x}_{width}x{height}.{}", format.as_str())
}

/// Thumbnails of one source share a directory so edits can drop them together.
pub fn thumbnail_dir_for(thumbnails_root: &Path, relative: &str) -> PathBuf {
    let digest = Sha256::digest(relative.as_bytes());
    let digest_hex = format!("{digest:x}");
    thumbnails_root.join(&digest_hex[..16])
}

/// Cached cover-cropped thumbnail of `source`, generated when missing or older
/// than the source.
pub fn ensure_thumbnail(
    thumbnails_root: &Path,
    source: &SecurePath,
    width: u32,
    height: u32,
    format: ThumbnailFormat,
) -> Result<PathBuf, MediaError> {
    if width == 0 || height == 0 {
        return Err(MediaError::Invalid(
            "Width and height must be positive integers".to_string(),
        ));
    }
    check_output_size(width, height)?;

    let target = thumbnail_dir_for(thumbnails_root, &source.relative).join(thumbnail_file_name(
        &source.relative,
        width,
        height,
        format,
    ));
    if is_fresh(&target, &source.absolute) {
        return Ok(target);
    }

    info!(
        source = %source.relative,
        width,
        height,
        format = format.as_str(),
        "Generating thumbnail"
    );
    let img = image::open(&source.absolute)
        .with_context(|| format!("failed to decode image: {}", source.relative))?;
    let thumb = img.resize_to_fill(width, height, FilterType::Triangle);
    save_image_as(&thumb, &target, format.image_format())?;
    Ok(target)
}

/// Removes every cached thumbnail of `relative`. Returns how many were dropped.
pub fn clear_thumbnails(thumbnails_root: &Path, relative: &str) -> anyhow::Result<usize> {
    let dir = thumbnail_dir_for(thumbnails_root, relative);
    if !dir.is_dir() {
        return Ok(0);
    }
    let count = std::fs::read_dir(&dir)
        .with_context(|| format!("failed to read thumbnail dir: {}", dir.display()))?
        .count();
    std::fs::remove_dir_all(&dir)
        .with_context(|| format!("failed to remove thumbnails: {}", dir.display()))?;
    debug!(source = relative, count, "Cleared thumbnails");
    Ok(count)
}

/// True when `cached` exists and is at least as new as `source`.
pub(crate) fn is_fresh(cached: &Path, source: &Path) -> bool {
    let modified = |path: &Path| -> Option<SystemTime> { path.metadata().ok()?.modified().ok() };
    match (modified(cached), modified(source)) {
        (Some(cached), Some(source)) => cached >= source,
        (Some(_), None) => true,
        _ => false,
    }
}
