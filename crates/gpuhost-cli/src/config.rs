//! Config file handling
//!
//! Settings live in ~/.gpuhost/config.yml; a missing file means defaults.

use anyhow::{Context, Result};
use gpuhost_control::GpuHostConfig;
use std::fs;
use std::path::{Path, PathBuf};

pub struct ConfigManager;

impl ConfigManager {
    /// Default config file path
    pub fn get_config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".gpuhost").join("config.yml"))
    }

    /// Load from `path`, or the default location when `None`
    pub fn load(path: Option<&Path>) -> Result<GpuHostConfig> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::get_config_path()?,
        };
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<GpuHostConfig> {
        if !path.exists() {
            return Ok(GpuHostConfig::default());
        }

        let content =
            fs::read_to_string(path).context(format!("Failed to read config file: {:?}", path))?;
        Self::parse(&content).context(format!("Invalid config file: {:?}", path))
    }

    pub fn parse(content: &str) -> Result<GpuHostConfig> {
        let config: GpuHostConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(config: &GpuHostConfig, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create config directory: {:?}", parent))?;
        }

        let yaml = serde_yaml::to_string(config).context("Failed to serialize config")?;
        fs::write(path, yaml).context(format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }
}
