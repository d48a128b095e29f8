use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::ImageFormat;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::images::is_image_file;
use super::paths::relative_to;
use super::save_image_as;
use super::thumbnails::is_fresh;
use crate::config::ResolvedPaths;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmReport {
    pub generated: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// `/a/b.jpg` -> `<webp_cache>/a/b.webp`
pub fn webp_cache_path(webp_cache: &Path, relative: &str) -> PathBuf {
    let mut target = webp_cache.to_path_buf();
    target.extend(relative.trim_start_matches('/').split('/'));
    target.set_extension("webp");
    target
}

/// Sources the encoder can convert. WebP files, SVG and GIF are served as-is.
pub fn is_convertible(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    matches!(ext.as_deref(), Some("jpg" | "jpeg" | "png"))
}

/// Cached WebP for `relative` when it exists and is newer than `source`.
pub fn fresh_webp(webp_cache: &Path, relative: &str, source: &Path) -> Option<PathBuf> {
    let target = webp_cache_path(webp_cache, relative);
    is_fresh(&target, source).then_some(target)
}

/// Lossless WebP copy of `source` at `target`.
pub fn generate_webp(source: &Path, target: &Path) -> Result<()> {
    let img = image::open(source)
        .with_context(|| format!("failed to decode image: {}", source.display()))?;
    save_image_as(&img, target, ImageFormat::WebP)
}

/// Converts every convertible workspace image whose cached WebP is missing or stale.
pub fn warm_webp_cache(paths: &ResolvedPaths) -> Result<WarmReport> {
    let mut report = WarmReport::default();
    if !paths.workspace.is_dir() {
        return Ok(report);
    }

    let skipped_dirs = [paths.thumbnails.as_path(), paths.webp_cache.as_path()];
    let walker = WalkDir::new(&paths.workspace)
        .into_iter()
        .filter_entry(|entry| {
            let hidden = entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.');
            !hidden && !skipped_dirs.contains(&entry.path())
        });

    for entry in walker.filter_map(|entry| entry.ok()) {
        let source = entry.path();
        if !entry.file_type().is_file() || !is_image_file(source) || !is_convertible(source) {
            continue;
        }
        let Some(relative) = relative_to(&paths.workspace, source) else {
            continue;
        };
        if fresh_webp(&paths.webp_cache, &relative, source).is_some() {
            report.skipped += 1;
            continue;
        }

        let target = webp_cache_path(&paths.webp_cache, &relative);
        match generate_webp(source, &target) {
            Ok(()) => {
                debug!(source = %relative, "Generated WebP artifact");
                report.generated += 1;
            }
            Err(err) => {
                warn!(source = %relative, error = %format!("{err:#}"), "WebP generation failed");
                report.failed += 1;
            }
        }
    }

    info!(
        generated = report.generated,
        skipped = report.skipped,
        failed = report.failed,
        "WebP cache warm-up finished"
    );
    Ok(report)
}
