use anyhow::{Context, Result};
use directories::ProjectDirs;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use facegate_vision::ModelPaths;

use crate::storage::DEFAULT_EXTENSIONS;

pub static CONFIG_PATH: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("FACEGATE_CONFIG_PATH").unwrap_or("/usr/local/etc/facegate/config.toml"))
});

/// Per-user data directory, `None` when no home directory can be resolved.
pub static DATA_DIR: Lazy<Option<PathBuf>> = Lazy::new(|| {
    ProjectDirs::from("", "", "facegate").map(|dirs| dirs.data_dir().to_path_buf())
});

fn data_path(leaf: &str) -> PathBuf {
    match DATA_DIR.as_ref() {
        Some(dir) => dir.join(leaf),
        None => Path::new("/var/lib/facegate").join(leaf),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Minimum cosine similarity for two faces to count as the same person.
    pub threshold: f32,
    /// Registered-identities directory.
    pub gallery_dir: PathBuf,
    pub detector_model: PathBuf,
    pub recognizer_model: PathBuf,
    pub score_threshold: f32,
    pub nms_threshold: f32,
    /// Image extensions accepted for registration and scanned in the gallery.
    pub extensions: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let models = ModelPaths::in_dir(&data_path("models"));
        Self {
            threshold: 0.363,
            gallery_dir: data_path("faces"),
            detector_model: models.detector,
            recognizer_model: models.recognizer,
            score_threshold: 0.6,
            nms_threshold: 0.3,
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

impl Config {
    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths {
            detector: self.detector_model.clone(),
            recognizer: self.recognizer_model.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        if !(-1.0..=1.0).contains(&self.threshold) {
            anyhow::bail!("threshold must be within [-1, 1], got {}", self.threshold);
        }
        if self.extensions.is_empty() {
            anyhow::bail!("at least one image extension must be configured");
        }
        Ok(())
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        log::debug!("no config at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&CONFIG_PATH);
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}
