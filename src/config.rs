use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::session::validate_confidence;

pub static CONFIG_PATH: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("NOUNIFY_CONFIG_PATH").unwrap_or("/usr/local/etc/nounify/config.toml"))
});

pub static ASSET_PREFIX: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("NOUNIFY_ASSET_PREFIX").unwrap_or("/usr/local/share/nounify"))
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Faces scoring below this are not reported.
    pub min_confidence: f32,
    /// Directory holding the detector and landmark ONNX files.
    pub model_dir: PathBuf,
    /// Glasses overlay drawn over each face.
    pub overlay: PathBuf,
    /// Where `render` writes its PNG.
    pub output: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_confidence: 0.3,
            model_dir: ASSET_PREFIX.join("models"),
            overlay: ASSET_PREFIX.join("glasses-red.png"),
            output: PathBuf::from(crate::export::DEFAULT_OUTPUT_NAME),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        validate_confidence(self.min_confidence)?;
        Ok(())
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
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

/// Write the default config to `path` unless a file is already there.
/// Returns whether a file was created.
pub fn ensure_config_file(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    save_config(&Config::default(), Some(path))
        .with_context(|| format!("writing default config to {}", path.display()))?;
    Ok(true)
}
