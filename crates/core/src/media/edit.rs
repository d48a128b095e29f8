use std::path::{Path, PathBuf};

use anyhow::Context;
use image::imageops::FilterType;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::images::view_url;
use super::paths::{relative_to, secure_path, validate_filename, PathError, SecurePathOptions};
use super::thumbnails::clear_thumbnails;
use super::{check_output_size, save_image, MediaError};
use crate::config::ResolvedPaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CropRect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ResizeSpec {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Applied in field order: crop, rotate, resize, flip, flop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ImageOperations {
    pub crop: Option<CropRect>,
    pub rotate: Option<u32>,
    pub resize: Option<ResizeSpec>,
    /// Mirror top-to-bottom.
    pub flip: bool,
    /// Mirror left-to-right.
    pub flop: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRequest {
    #[serde(default)]
    pub image_path: String,
    #[serde(default)]
    pub operations: ImageOperations,
    #[serde(default)]
    pub output_name: Option<String>,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessedImage {
    pub success: bool,
    pub path: String,
    pub url: String,
}

pub fn apply_operations(
    mut img: DynamicImage,
    ops: &ImageOperations,
) -> Result<DynamicImage, MediaError> {
    if let Some(crop) = ops.crop {
        let fits = crop.width > 0
            && crop.height > 0
            && crop.left.saturating_add(crop.width) <= img.width()
            && crop.top.saturating_add(crop.height) <= img.height();
        if !fits {
            return Err(MediaError::Invalid(format!(
                "Crop area {}x{}+{}+{} is outside the {}x{} image",
                crop.width,
                crop.height,
                crop.left,
                crop.top,
                img.width(),
                img.height()
            )));
        }
        img = img.crop_imm(crop.left, crop.top, crop.width, crop.height);
    }

    match ops.rotate {
        None | Some(0) => {}
        Some(90) => img = img.rotate90(),
        Some(180) => img = img.rotate180(),
        Some(270) => img = img.rotate270(),
        Some(other) => {
            return Err(MediaError::Invalid(format!(
                "Rotation must be 90, 180 or 270 degrees (got {other})"
            )))
        }
    }

    if let Some(resize) = ops.resize {
        img = match (resize.width, resize.height) {
            (Some(0), _) | (_, Some(0)) => {
                return Err(MediaError::Invalid(
                    "Resize dimensions must be positive".to_string(),
                ))
            }
            (Some(width), Some(height)) => {
                check_output_size(width, height)?;
                img.resize_to_fill(width, height, FilterType::Lanczos3)
            }
            (Some(width), None) => {
                check_output_size(width, scale_side(img.height(), width, img.width()))?;
                img.resize(width, u32::MAX, FilterType::Lanczos3)
            }
            (None, Some(height)) => {
                check_output_size(scale_side(img.width(), height, img.height()), height)?;
                img.resize(u32::MAX, height, FilterType::Lanczos3)
            }
            (None, None) => img,
        };
    }

    if ops.flip {
        img = img.flipv();
    }
    if ops.flop {
        img = img.fliph();
    }
    Ok(img)
}

/// `side * target / reference`, rounded up and saturated.
fn scale_side(side: u32, target: u32, reference: u32) -> u32 {
    let scaled = (u64::from(side) * u64::from(target)).div_ceil(u64::from(reference.max(1)));
    u32::try_from(scaled).unwrap_or(u32::MAX)
}

/// `<stem>_edited<ext>` unless a valid `output_name` is given.
pub fn output_file_name(source: &Path, output_name: Option<&str>) -> String {
    if let Some(name) = output_name.filter(|name| !name.trim().is_empty()) {
        return match validate_filename(name) {
            Ok(valid) => valid,
            Err(PathError::InvalidFilename { sanitized }) => sanitized,
            Err(_) => default_output_name(source),
        };
    }
    default_output_name(source)
}

fn default_output_name(source: &Path) -> String {
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    match source.extension() {
        Some(ext) => format!("{stem}_edited.{}", ext.to_string_lossy()),
        None => format!("{stem}_edited"),
    }
}

pub fn process_image(
    paths: &ResolvedPaths,
    request: &ProcessRequest,
) -> Result<ProcessedImage, MediaError> {
    if request.image_path.trim().is_empty() {
        return Err(MediaError::Invalid("Image path is required".to_string()));
    }
    let source = secure_path(
        &request.image_path,
        &paths.workspace,
        SecurePathOptions::readable(),
    )?;

    let img = image::open(&source.absolute)
        .with_context(|| format!("failed to decode image: {}", source.relative))?;
    let edited = apply_operations(img, &request.operations)?;

    let output: PathBuf = if request.overwrite {
        source.absolute.clone()
    } else {
        paths.uploads.join(output_file_name(
            &source.absolute,
            request.output_name.as_deref(),
        ))
    };
    save_image(&edited, &output)?;
    clear_thumbnails(&paths.thumbnails, &source.relative)?;

    let relative = relative_to(&paths.workspace, &output).ok_or_else(|| {
        MediaError::Internal(anyhow::anyhow!(
            "edited image landed outside the workspace: {}",
            output.display()
        ))
    })?;
    info!(source = %source.relative, output = %relative, "Processed image");

    Ok(ProcessedImage {
        success: true,
        url: view_url(&relative),
        path: relative,
    })
}
