use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::frame::ResizeAlgorithm;
use crate::preprocess::Preprocessor;
use crate::streaming_executor::DEFAULT_BUFFER_SIZE;
use crate::transform::{ModelOptions, VideoOptions};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "TOONIFY_DATA_DIR";
pub const DEFAULT_MODEL_PATH: &str = "models/generator_quantitative.safetensors";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub preprocess: PreprocessConfig,
    pub video: VideoConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    pub path: PathBuf,
    pub key_prefix: String,
    /// Empty disables verification.
    pub sha256: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PreprocessConfig {
    pub resize: ResizeAlgorithm,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VideoConfig {
    pub codec: String,
    /// Empty omits `-tag:v`.
    pub codec_tag: String,
    /// ffmpeg `-q:v`; 0 leaves the encoder default.
    pub quality: u32,
    pub pixel_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    pub workers: usize,
    pub buffer_size: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_MODEL_PATH),
            key_prefix: String::new(),
            sha256: String::new(),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            codec: "mpeg4".to_string(),
            codec_tag: "mp4v".to_string(),
            quality: 5,
            pixel_format: "yuv420p".to_string(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
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

    /// Model settings with the checkpoint path resolved against `data_dir`.
    pub fn model_options(&self, data_dir: &Path) -> ModelOptions {
        let sha256 = self.model.sha256.trim();
        ModelOptions {
            path: resolve_relative_to(data_dir, &self.model.path),
            key_prefix: self.model.key_prefix.clone(),
            sha256: (!sha256.is_empty()).then(|| sha256.to_string()),
        }
    }

    pub fn preprocessor(&self) -> Preprocessor {
        Preprocessor::new(self.preprocess.resize)
    }

    pub fn video_options(&self) -> VideoOptions {
        let tag = self.video.codec_tag.trim();
        VideoOptions {
            codec: self.video.codec.clone(),
            codec_tag: (!tag.is_empty()).then(|| tag.to_string()),
            quality: (self.video.quality > 0).then_some(self.video.quality),
            pixel_format: self.video.pixel_format.clone(),
            preprocessor: self.preprocessor(),
            workers: self.pipeline.workers.max(1),
            buffer_size: self.pipeline.buffer_size.max(1),
        }
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. TOONIFY_DATA_DIR environment variable
/// 3. Default: ./data
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

/// Creates `data_dir` if missing and writes a default config.toml unless one
/// already exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
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

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.model.path, PathBuf::from(DEFAULT_MODEL_PATH));
        assert!(cfg.model.key_prefix.is_empty());
        assert!(cfg.model.sha256.is_empty());
        assert_eq!(cfg.preprocess.resize, ResizeAlgorithm::Bilinear);
        assert_eq!(cfg.video.codec, "mpeg4");
        assert_eq!(cfg.video.codec_tag, "mp4v");
        assert_eq!(cfg.video.quality, 5);
        assert_eq!(cfg.pipeline.workers, 1);
        assert_eq!(cfg.pipeline.buffer_size, 4);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let original = AppConfig::default();
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_missing_sections_with_defaults() {
        let cfg: AppConfig = toml::from_str(
            "[preprocess]\nresize = \"nearest\"\n\n[pipeline]\nworkers = 3\n",
        )
        .expect("deserialize partial config");
        assert_eq!(cfg.preprocess.resize, ResizeAlgorithm::Nearest);
        assert_eq!(cfg.pipeline.workers, 3);
        assert_eq!(cfg.pipeline.buffer_size, 4);
        assert_eq!(cfg.video, VideoConfig::default());
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let loaded = AppConfig::load_from_path(&temp.path().join("missing.toml"))
            .expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_from_empty_file_returns_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "  \n").unwrap();
        assert_eq!(AppConfig::load_from_path(&path).unwrap(), AppConfig::default());
    }

    #[test]
    fn malformed_toml_is_an_error_naming_the_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "[model\npath = 3").unwrap();
        let err = AppConfig::load_from_path(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse config TOML"));
    }

    #[test]
    fn model_options_resolve_against_data_dir() {
        let mut cfg = AppConfig::default();
        let opts = cfg.model_options(Path::new("/data"));
        assert_eq!(
            opts.path,
            PathBuf::from("/data/models/generator_quantitative.safetensors")
        );
        assert_eq!(opts.sha256, None);

        cfg.model.path = PathBuf::from("/abs/model.safetensors");
        cfg.model.sha256 = " abc ".into();
        let opts = cfg.model_options(Path::new("/data"));
        assert_eq!(opts.path, PathBuf::from("/abs/model.safetensors"));
        assert_eq!(opts.sha256.as_deref(), Some("abc"));
    }

    #[test]
    fn video_options_map_empty_values_to_none() {
        let mut cfg = AppConfig::default();
        cfg.video.codec_tag = String::new();
        cfg.video.quality = 0;
        cfg.pipeline.workers = 0;
        cfg.pipeline.buffer_size = 0;

        let opts = cfg.video_options();
        assert_eq!(opts.codec_tag, None);
        assert_eq!(opts.quality, None);
        assert_eq!(opts.workers, 1);
        assert_eq!(opts.buffer_size, 1);

        let defaults = AppConfig::default().video_options();
        assert_eq!(defaults, VideoOptions::default());
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_env_var_then_default() {
        let old = env::var_os(ENV_DATA_DIR);

        env::set_var(ENV_DATA_DIR, "/env/path");
        let from_env = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        let fallback = data_dir(None);

        if let Some(val) = old {
            env::set_var(ENV_DATA_DIR, val);
        }

        assert_eq!(from_env, PathBuf::from("/env/path"));
        assert_eq!(fallback, PathBuf::from("data"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("nested");
        initialize_data_dir(&dir).expect("initialize data dir");

        assert!(dir.join("config.toml").exists());
        let loaded = AppConfig::load_from_path(&config_path(&dir)).unwrap();
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().unwrap();
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[pipeline]\nworkers = 8\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn resolve_relative_to_absolute_path_unchanged() {
        let result = resolve_relative_to(Path::new("/base"), Path::new("/abs/path"));
        assert_eq!(result, PathBuf::from("/abs/path"));
    }

    #[test]
    fn resolve_relative_to_joins_relative_path() {
        let result = resolve_relative_to(Path::new("/base"), Path::new("sub"));
        assert_eq!(result, PathBuf::from("/base/sub"));
    }
}
