use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::Serialize;
use tracing::info;

use super::images::{list_images_in, view_url, ImageEntry};
use super::paths::{relative_to, secure_path, validate_filename, PathError, SecurePathOptions};
use super::MediaError;
use crate::config::ResolvedPaths;

/// User-created datasets live under this directory of the datasets root.
pub const LOCAL_DATASETS_DIR: &str = ".local";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dataset {
    pub name: String,
    pub images: Vec<ImageEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedDataset {
    pub name: String,
    pub path: String,
    pub images: Vec<ImageEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddedImage {
    pub success: bool,
    pub name: String,
    pub path: String,
    pub url: String,
}

/// Visible subdirectories with images, every `.local` dataset, or a
/// `default` dataset for images sitting directly in the datasets root.
pub fn list_datasets(paths: &ResolvedPaths) -> Result<Vec<Dataset>, MediaError> {
    let root = &paths.datasets;
    if !root.is_dir() {
        return Ok(Vec::new());
    }

    let mut dirs: Vec<String> = fs::read_dir(root)
        .with_context(|| format!("failed to read datasets dir: {}", root.display()))?
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    dirs.sort();

    if dirs.is_empty() {
        let images = list_images_in(&paths.workspace, root)?;
        if images.is_empty() {
            return Ok(Vec::new());
        }
        return Ok(vec![Dataset {
            name: "default".to_string(),
            images,
        }]);
    }

    let mut datasets = Vec::new();
    for dir in dirs {
        if dir == LOCAL_DATASETS_DIR {
            datasets.extend(list_local_datasets(paths)?);
        } else if !dir.starts_with('.') {
            let images = list_images_in(&paths.workspace, &root.join(&dir))?;
            if !images.is_empty() {
                datasets.push(Dataset { name: dir, images });
            }
        }
    }
    Ok(datasets)
}

fn list_local_datasets(paths: &ResolvedPaths) -> Result<Vec<Dataset>, MediaError> {
    let local = paths.datasets.join(LOCAL_DATASETS_DIR);
    let mut names: Vec<String> = fs::read_dir(&local)
        .with_context(|| format!("failed to read {}", local.display()))?
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| validate_filename(name).is_ok())
        .collect();
    names.sort();

    names
        .into_iter()
        .map(|name| {
            let images = list_images_in(&paths.workspace, &local.join(&name))?;
            Ok(Dataset { name, images })
        })
        .collect()
}

fn local_dataset_name(name: &str) -> Result<String, MediaError> {
    if name.trim().is_empty() {
        return Err(MediaError::Invalid("Dataset name is required".to_string()));
    }
    match validate_filename(name.trim()) {
        Ok(valid) => Ok(valid),
        Err(PathError::InvalidFilename { sanitized }) => Ok(sanitized),
        Err(err) => Err(MediaError::Invalid(format!("Invalid dataset name: {err}"))),
    }
}

fn workspace_relative(paths: &ResolvedPaths, path: &Path) -> Result<String, MediaError> {
    relative_to(&paths.workspace, path).ok_or_else(|| {
        MediaError::Internal(anyhow::anyhow!(
            "datasets directory is outside the workspace: {}",
            path.display()
        ))
    })
}

pub fn create_dataset(paths: &ResolvedPaths, name: &str) -> Result<CreatedDataset, MediaError> {
    let name = local_dataset_name(name)?;
    let local = paths.datasets.join(LOCAL_DATASETS_DIR);
    let target = secure_path(&name, &local, SecurePathOptions::default())?;
    if target.absolute.exists() {
        return Err(MediaError::Conflict(format!(
            "Dataset already exists: {name}"
        )));
    }
    fs::create_dir_all(&target.absolute)
        .with_context(|| format!("failed to create dataset: {}", target.absolute.display()))?;
    info!(dataset = %name, "Created dataset");

    Ok(CreatedDataset {
        path: workspace_relative(paths, &target.absolute)?,
        name,
        images: Vec::new(),
    })
}

/// Copies a workspace image into a `.local` dataset.
pub fn add_image_to_dataset(
    paths: &ResolvedPaths,
    image_path: &str,
    dataset_name: &str,
) -> Result<AddedImage, MediaError> {
    if image_path.trim().is_empty() || dataset_name.trim().is_empty() {
        return Err(MediaError::Invalid(
            "Image path and dataset name are required".to_string(),
        ));
    }
    let source = secure_path(image_path, &paths.workspace, SecurePathOptions::default())?;
    if !source.absolute.is_file() {
        return Err(MediaError::NotFound(format!(
            "Image not found: {}",
            source.relative
        )));
    }

    let name = local_dataset_name(dataset_name)?;
    let dataset = paths.datasets.join(LOCAL_DATASETS_DIR).join(&name);
    if !dataset.is_dir() {
        return Err(MediaError::NotFound(format!("Dataset not found: {name}")));
    }

    let file_name = source
        .absolute
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| MediaError::Invalid("Image path has no file name".to_string()))?;
    let target = dataset.join(&file_name);
    if target.exists() {
        return Err(MediaError::Conflict(format!(
            "Image already exists in dataset: {file_name}"
        )));
    }
    fs::copy(&source.absolute, &target)
        .with_context(|| format!("failed to copy image into dataset {name}"))?;
    info!(dataset = %name, image = %file_name, "Added image to dataset");

    let relative = workspace_relative(paths, &target)?;
    Ok(AddedImage {
        success: true,
        name: file_name,
        url: view_url(&relative),
        path: relative,
    })
}

pub fn delete_dataset(paths: &ResolvedPaths, name: &str) -> Result<(), MediaError> {
    let name = local_dataset_name(name)?;
    let dataset = paths.datasets.join(LOCAL_DATASETS_DIR).join(&name);
    if !dataset.is_dir() {
        return Err(MediaError::NotFound(format!("Dataset not found: {name}")));
    }
    fs::remove_dir_all(&dataset)
        .with_context(|| format!("failed to delete dataset: {}", dataset.display()))?;
    info!(dataset = %name, "Deleted dataset");
    Ok(())
}
