use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "GRAPHCAP_DATA_DIR";
pub const DEFAULT_JOB_PRIORITY: i64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub inference: InferenceConfig,
    pub features: FeatureFlags,
}

/// Filesystem layout. Relative entries resolve against the data directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub workspace_dir: PathBuf,
    pub datasets_dir: PathBuf,
    pub thumbnails_dir: PathBuf,
    pub webp_cache_dir: PathBuf,
    pub uploads_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    pub max_concurrent_jobs: usize,
    pub max_item_retries: u32,
    pub retry_backoff_ms: u64,
    pub poll_interval_ms: u64,
    pub default_priority: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceConfig {
    pub bridge_url: String,
    pub request_timeout_secs: u64,
    pub default_provider: String,
    /// Empty means "first enabled model of the provider".
    pub default_model: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FeatureFlags {
    pub batch_queue: bool,
    pub webp_cache: bool,
    pub image_editing: bool,
}

/// Absolute directories derived from [`PathsConfig`] for one data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub workspace: PathBuf,
    pub datasets: PathBuf,
    pub thumbnails: PathBuf,
    pub webp_cache: PathBuf,
    pub uploads: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from("workspace"),
            datasets_dir: PathBuf::from("workspace/datasets"),
            thumbnails_dir: PathBuf::from(".thumbnails"),
            webp_cache_dir: PathBuf::from(".webp_cache"),
            uploads_dir: PathBuf::from("workspace/uploads"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 32100,
            host: "127.0.0.1".to_string(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 1,
            max_item_retries: 2,
            retry_backoff_ms: 500,
            poll_interval_ms: 2000,
            default_priority: DEFAULT_JOB_PRIORITY,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            bridge_url: "http://127.0.0.1:32200".to_string(),
            request_timeout_secs: 120,
            default_provider: "gemini".to_string(),
            default_model: String::new(),
        }
    }
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            batch_queue: true,
            webp_cache: true,
            image_editing: true,
        }
    }
}

impl PathsConfig {
    pub fn resolve(&self, data_dir: &Path) -> ResolvedPaths {
        ResolvedPaths {
            workspace: resolve_relative_to(data_dir, &self.workspace_dir),
            datasets: resolve_relative_to(data_dir, &self.datasets_dir),
            thumbnails: resolve_relative_to(data_dir, &self.thumbnails_dir),
            webp_cache: resolve_relative_to(data_dir, &self.webp_cache_dir),
            uploads: resolve_relative_to(data_dir, &self.uploads_dir),
        }
    }
}

impl ResolvedPaths {
    pub fn create_all(&self) -> Result<()> {
        for dir in [
            &self.workspace,
            &self.datasets,
            &self.thumbnails,
            &self.webp_cache,
            &self.uploads,
        ] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory: CLI override, then `GRAPHCAP_DATA_DIR`, then `./data`.
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates the data directory and writes a default config.toml when none exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.workspace_dir, PathBuf::from("workspace"));
        assert_eq!(cfg.paths.datasets_dir, PathBuf::from("workspace/datasets"));
        assert_eq!(cfg.server.port, 32100);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.queue.max_concurrent_jobs, 1);
        assert_eq!(cfg.queue.default_priority, 100);
        assert_eq!(cfg.inference.default_provider, "gemini");
        assert!(cfg.features.batch_queue);
        assert!(cfg.features.webp_cache);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.queue.max_item_retries = 5;
        original.features.image_editing = false;

        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_sections() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[queue]\nmax_concurrent_jobs = 3\n").expect("write config");

        let loaded = AppConfig::load_from_path(&path).expect("load config");
        assert_eq!(loaded.queue.max_concurrent_jobs, 3);
        assert_eq!(loaded.queue.retry_backoff_ms, 500);
        assert_eq!(loaded.server, ServerConfig::default());
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let dir = tempdir().expect("tempdir");
        let loaded =
            AppConfig::load_from_path(&dir.path().join("missing.toml")).expect("load config");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn empty_file_returns_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "  \n").expect("write config");

        assert_eq!(
            AppConfig::load_from_path(&path).expect("load config"),
            AppConfig::default()
        );
    }

    #[test]
    fn data_dir_uses_cli_override() {
        assert_eq!(
            data_dir(Some(Path::new("/custom"))),
            PathBuf::from("/custom")
        );
    }

    #[test]
    fn data_dir_env_then_default() {
        env::set_var(ENV_DATA_DIR, "/env/path");
        let from_env = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        let fallback = data_dir(None);

        assert_eq!(from_env, PathBuf::from("/env/path"));
        assert_eq!(fallback, PathBuf::from("data"));
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let dir = tempdir().expect("tempdir");
        let cfg_path = dir.path().join("config.toml");
        let custom_content = "[server]\nport = 9999\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(dir.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn initialize_writes_default_config() {
        let dir = tempdir().expect("tempdir");
        let nested = dir.path().join("nested");

        initialize_data_dir(&nested).expect("initialize data dir");

        let loaded = AppConfig::load_from_path(&config_path(&nested)).expect("load config");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn resolved_paths_join_relative_entries_only() {
        let mut paths = PathsConfig::default();
        paths.thumbnails_dir = PathBuf::from("/var/cache/thumbs");

        let resolved = paths.resolve(Path::new("/srv/graphcap"));
        assert_eq!(resolved.workspace, PathBuf::from("/srv/graphcap/workspace"));
        assert_eq!(resolved.thumbnails, PathBuf::from("/var/cache/thumbs"));
        assert_eq!(
            resolved.uploads,
            PathBuf::from("/srv/graphcap/workspace/uploads")
        );
    }
}
