use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::images::view_url;
use super::paths::{sanitize_filename, secure_path, SecurePathOptions};
use super::MediaError;

pub const ANALYSIS_DIR: &str = "analysis";
pub const BATCH_DIR_PREFIX: &str = "batch_";
pub const CAPTIONS_FILE: &str = "captions.jsonl";
pub const JOB_INFO_FILE: &str = "job_info.json";

/// One line of `captions.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionRecord {
    pub filename: String,
    pub config_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub parsed: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptionedImage {
    pub path: String,
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerspectiveCaption {
    pub config_name: String,
    pub version: String,
    pub model: String,
    pub provider: String,
    pub content: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CaptionMetadata {
    pub captioned_at: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageCaptions {
    pub image: CaptionedImage,
    pub perspectives: BTreeMap<String, PerspectiveCaption>,
    pub metadata: CaptionMetadata,
}

/// `<imageDir>/analysis/batch_<perspective>`
pub fn batch_dir(image: &Path, perspective: &str) -> PathBuf {
    let parent = image.parent().unwrap_or_else(|| Path::new("."));
    parent
        .join(ANALYSIS_DIR)
        .join(format!("{BATCH_DIR_PREFIX}{}", sanitize_filename(perspective)))
}

/// Appends one caption line for `image` and returns the batch directory.
pub fn append_caption(image: &Path, perspective: &str, record: &CaptionRecord) -> Result<PathBuf> {
    let dir = batch_dir(image, perspective);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create caption dir: {}", dir.display()))?;

    let mut line = serde_json::to_string(record).context("failed to encode caption")?;
    line.push('\n');
    let captions = dir.join(CAPTIONS_FILE);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&captions)
        .with_context(|| format!("failed to open {}", captions.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("failed to append to {}", captions.display()))?;
    Ok(dir)
}

pub fn write_job_info(dir: &Path, info: &JobInfo) -> Result<()> {
    let path = dir.join(JOB_INFO_FILE);
    let encoded = serde_json::to_string_pretty(info).context("failed to encode job info")?;
    fs::write(&path, encoded).with_context(|| format!("failed to write {}", path.display()))
}

/// Collects every perspective caption stored next to `relative`. Within one
/// batch directory the last matching line wins.
pub fn read_captions(workspace: &Path, relative: &str) -> Result<ImageCaptions, MediaError> {
    if relative.trim().is_empty() {
        return Err(MediaError::Invalid("Image path is required".to_string()));
    }
    let image = secure_path(relative, workspace, SecurePathOptions::default())?;
    let name = image
        .absolute
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut captions = ImageCaptions {
        image: CaptionedImage {
            url: view_url(&image.relative),
            path: image.relative.clone(),
            name: name.clone(),
        },
        perspectives: BTreeMap::new(),
        metadata: CaptionMetadata::default(),
    };

    let analysis = image
        .absolute
        .parent()
        .map(|parent| parent.join(ANALYSIS_DIR))
        .filter(|dir| dir.is_dir());
    let Some(analysis) = analysis else {
        return Ok(captions);
    };

    let mut batch_dirs: Vec<(String, PathBuf)> = fs::read_dir(&analysis)
        .with_context(|| format!("failed to read {}", analysis.display()))?
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let dir_name = entry.file_name().to_string_lossy().into_owned();
            let perspective = dir_name.strip_prefix(BATCH_DIR_PREFIX)?.to_string();
            Some((perspective, entry.path()))
        })
        .collect();
    batch_dirs.sort();

    for (perspective, dir) in batch_dirs {
        if let Some(record) = find_caption(&dir.join(CAPTIONS_FILE), &name)? {
            merge_job_info(&dir.join(JOB_INFO_FILE), &mut captions.metadata);
            captions.perspectives.insert(
                perspective,
                PerspectiveCaption {
                    config_name: record.config_name,
                    version: record.version,
                    model: record.model,
                    provider: record.provider,
                    content: record.parsed,
                },
            );
        }
    }
    Ok(captions)
}

fn find_caption(captions: &Path, image_name: &str) -> Result<Option<CaptionRecord>> {
    if !captions.is_file() {
        return Ok(None);
    }
    let file = fs::File::open(captions)
        .with_context(|| format!("failed to open {}", captions.display()))?;

    let mut found = None;
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("failed to read {}", captions.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CaptionRecord>(&line) {
            Ok(record) if basename(&record.filename) == image_name => found = Some(record),
            Ok(_) => {}
            Err(err) => debug!(file = %captions.display(), error = %err, "Skipping bad caption line"),
        }
    }
    Ok(found)
}

fn merge_job_info(path: &Path, metadata: &mut CaptionMetadata) {
    let Ok(raw) = fs::read_to_string(path) else {
        return;
    };
    let info: JobInfo = match serde_json::from_str(&raw) {
        Ok(info) => info,
        Err(err) => {
            debug!(file = %path.display(), error = %err, "Ignoring unreadable job info");
            return;
        }
    };
    metadata.captioned_at = metadata.captioned_at.take().or(info.completed_at);
    metadata.provider = metadata.provider.take().or(info.provider);
    metadata.model = metadata.model.take().or(info.model);
}

fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}
