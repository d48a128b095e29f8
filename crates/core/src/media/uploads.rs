use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;
use tracing::info;

use super::datasets::LOCAL_DATASETS_DIR;
use super::images::view_url;
use super::paths::{relative_to, sanitize_filename};
use super::MediaError;
use crate::config::ResolvedPaths;

/// Largest accepted file, in bytes.
pub const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;
/// Files accepted by one upload request.
pub const MAX_UPLOAD_FILES: usize = 5;

/// A file received from a multipart form, not yet written.
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UploadedImage {
    pub path: String,
    pub url: String,
}

pub fn too_large_message() -> String {
    format!(
        "File too large. Maximum size is {}MB",
        MAX_UPLOAD_BYTES / (1024 * 1024)
    )
}

pub fn too_many_files_message() -> String {
    format!("Too many files. Maximum is {MAX_UPLOAD_FILES} files per upload")
}

pub fn check_upload_size(len: usize) -> Result<(), MediaError> {
    if len > MAX_UPLOAD_BYTES {
        return Err(MediaError::TooLarge(too_large_message()));
    }
    Ok(())
}

/// `<timestamp>-<name>` with everything but ASCII letters, digits, `.` and `-`
/// in the base name replaced by `_`.
pub fn upload_file_name(original: &str, timestamp_ms: i64) -> String {
    let basename = original.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = sanitize_filename(basename)
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '.' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = if cleaned.is_empty() {
        "image".to_string()
    } else {
        cleaned
    };
    format!("{timestamp_ms}-{cleaned}")
}

fn valid_dataset_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
}

fn upload_dir(paths: &ResolvedPaths, dataset: Option<&str>) -> Result<PathBuf, MediaError> {
    match dataset.map(str::trim).filter(|name| !name.is_empty()) {
        None => Ok(paths.uploads.clone()),
        Some(name) if valid_dataset_name(name) => {
            Ok(paths.datasets.join(LOCAL_DATASETS_DIR).join(name))
        }
        Some(_) => Err(MediaError::Invalid(
            "Invalid dataset name. Use only letters, numbers, underscores, and hyphens."
                .to_string(),
        )),
    }
}

/// Writes `bytes` under `dir` without replacing an existing file. A clash on
/// the timestamped name gets a numeric suffix.
fn write_new(dir: &Path, file_name: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
    for attempt in 0u32..100 {
        let candidate = if attempt == 0 {
            dir.join(file_name)
        } else {
            dir.join(format!("{attempt}-{file_name}"))
        };
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(mut file) => {
                file.write_all(bytes)
                    .with_context(|| format!("failed to write upload: {}", candidate.display()))?;
                return Ok(candidate);
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to create upload: {}", candidate.display()))
            }
        }
    }
    anyhow::bail!("no free file name for upload {file_name}")
}

/// Validates every file first, then stores them in the uploads directory or
/// in the `.local` dataset named by `dataset`.
pub fn save_uploads(
    paths: &ResolvedPaths,
    files: &[IncomingFile],
    dataset: Option<&str>,
    timestamp_ms: i64,
) -> Result<Vec<UploadedImage>, MediaError> {
    if files.is_empty() {
        return Err(MediaError::Invalid("No image file provided".to_string()));
    }
    if files.len() > MAX_UPLOAD_FILES {
        return Err(MediaError::TooLarge(too_many_files_message()));
    }
    for file in files {
        if !file.content_type.starts_with("image/") {
            return Err(MediaError::Invalid(
                "Only image files are allowed".to_string(),
            ));
        }
        check_upload_size(file.bytes.len())?;
    }

    let dir = upload_dir(paths, dataset)?;
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create upload directory: {}", dir.display()))?;

    let mut saved = Vec::with_capacity(files.len());
    for file in files {
        let name = upload_file_name(&file.file_name, timestamp_ms);
        let target = write_new(&dir, &name, &file.bytes)?;
        let relative = relative_to(&paths.workspace, &target).ok_or_else(|| {
            MediaError::Internal(anyhow::anyhow!(
                "upload directory is outside the workspace: {}",
                dir.display()
            ))
        })?;
        info!(path = %relative, bytes = file.bytes.len(), "Stored upload");
        saved.push(UploadedImage {
            url: view_url(&relative),
            path: relative,
        });
    }
    Ok(saved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, ResolvedPaths) {
        let dir = tempdir().expect("tempdir");
        let paths = PathsConfig::default().resolve(dir.path());
        paths.create_all().expect("dirs");
        (dir, paths)
    }

    fn png(name: &str) -> IncomingFile {
        IncomingFile {
            file_name: name.to_string(),
            content_type: "image/png".to_string(),
            bytes: b"png".to_vec(),
        }
    }

    #[test]
    fn file_names_are_timestamped_and_cleaned() {
        assert_eq!(upload_file_name("cat.png", 17), "17-cat.png");
        assert_eq!(upload_file_name("my cat (1).png", 17), "17-my_cat__1_.png");
        assert_eq!(upload_file_name("../../etc/passwd", 17), "17-passwd");
        assert_eq!(upload_file_name("C:\\pics\\süß.jpg", 17), "17-s__.jpg");
        assert_eq!(upload_file_name("", 17), "17-image");
    }

    #[test]
    fn stores_in_uploads_or_dataset() {
        let (_dir, paths) = setup();
        let saved = save_uploads(&paths, &[png("a b.png")], None, 5).unwrap();
        assert_eq!(saved[0].path, "/uploads/5-a_b.png");
        assert_eq!(saved[0].url, "/api/images/view/uploads/5-a_b.png");
        assert!(paths.uploads.join("5-a_b.png").is_file());

        let saved = save_uploads(&paths, &[png("a.png"), png("a.png")], Some("faves"), 5).unwrap();
        assert_eq!(saved[0].path, "/datasets/.local/faves/5-a.png");
        assert_eq!(saved[1].path, "/datasets/.local/faves/1-5-a.png");
        assert_eq!(
            fs::read(paths.datasets.join(".local/faves/5-a.png")).unwrap(),
            b"png"
        );
    }

    #[test]
    fn rejects_bad_input_before_writing() {
        let (_dir, paths) = setup();
        assert!(matches!(
            save_uploads(&paths, &[], None, 1),
            Err(MediaError::Invalid(msg)) if msg == "No image file provided"
        ));

        let mut text = png("notes.txt");
        text.content_type = "text/plain".to_string();
        assert!(matches!(
            save_uploads(&paths, &[png("ok.png"), text], None, 1),
            Err(MediaError::Invalid(msg)) if msg == "Only image files are allowed"
        ));
        assert!(!paths.uploads.join("1-ok.png").exists());

        let six: Vec<_> = (0..6).map(|i| png(&format!("{i}.png"))).collect();
        assert!(matches!(
            save_uploads(&paths, &six, None, 1),
            Err(MediaError::TooLarge(_))
        ));

        assert!(matches!(
            save_uploads(&paths, &[png("a.png")], Some("../escape"), 1),
            Err(MediaError::Invalid(_))
        ));
        assert!(!paths.datasets.join("escape").exists());

        assert!(check_upload_size(MAX_UPLOAD_BYTES).is_ok());
        assert!(matches!(
            check_upload_size(MAX_UPLOAD_BYTES + 1),
            Err(MediaError::TooLarge(msg)) if msg == "File too large. Maximum size is 50MB"
        ));
    }
}
