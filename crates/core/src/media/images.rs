use std::path::Path;

use serde::Serialize;
use walkdir::{DirEntry, WalkDir};

use super::paths::{relative_to, secure_path, SecurePathOptions};
use super::MediaError;
use crate::config::ResolvedPaths;

pub const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "webp", "svg"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageEntry {
    pub path: String,
    pub name: String,
    pub directory: String,
    pub url: String,
}

impl ImageEntry {
    pub fn from_relative(relative: &str) -> Self {
        let (directory, name) = match relative.rfind('/') {
            Some(0) => ("/".to_string(), relative[1..].to_string()),
            Some(idx) => (relative[..idx].to_string(), relative[idx + 1..].to_string()),
            None => ("/".to_string(), relative.to_string()),
        };
        Self {
            path: relative.to_string(),
            name,
            directory,
            url: view_url(relative),
        }
    }
}

pub fn view_url(relative: &str) -> String {
    format!("/api/images/view{relative}")
}

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

/// Every image below `directory` (workspace root when `None`), sorted by path.
pub fn list_images(
    paths: &ResolvedPaths,
    directory: Option<&str>,
) -> Result<Vec<ImageEntry>, MediaError> {
    let root = secure_path(
        directory.filter(|dir| !dir.is_empty()).unwrap_or("/"),
        &paths.workspace,
        SecurePathOptions::default(),
    )?;
    if !root.absolute.is_dir() {
        return Ok(Vec::new());
    }

    let skipped = [paths.thumbnails.as_path(), paths.webp_cache.as_path()];
    let walker = WalkDir::new(&root.absolute)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_hidden(entry) && !skipped.contains(&entry.path()));

    let mut images = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!(error = %err, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_image_file(entry.path()) {
            continue;
        }
        if let Some(relative) = relative_to(&paths.workspace, entry.path()) {
            images.push(ImageEntry::from_relative(&relative));
        }
    }
    images.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(images)
}

/// Images directly inside `dir`, sorted by name.
pub fn list_images_in(workspace: &Path, dir: &Path) -> Result<Vec<ImageEntry>, MediaError> {
    let mut images = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(|err| {
        MediaError::Internal(anyhow::anyhow!(
            "failed to read directory {}: {err}",
            dir.display()
        ))
    })?;
    for entry in entries.flatten() {
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden || !path.is_file() || !is_image_file(&path) {
            continue;
        }
        if let Some(relative) = relative_to(workspace, &path) {
            images.push(ImageEntry::from_relative(&relative));
        }
    }
    images.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(images)
}

pub fn content_type_for(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
