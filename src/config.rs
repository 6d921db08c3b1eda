// Configuration file handling

use eyre::{Context, Result, eyre};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const APP_DIR: &str = "todostore";
const CONFIG_FILE: &str = "config.yaml";

/// What listing does when the store fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListFailurePolicy {
    /// Log the failure and show an empty list
    #[default]
    Lenient,
    /// Report the failure to the caller
    Strict,
}

/// Settings read from `config.yaml`
///
/// ```yaml
/// store_dir: /home/me/.local/share/todostore
/// list_failures: strict
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store_dir: Option<PathBuf>,
    pub list_failures: ListFailurePolicy,
}

impl Config {
    /// Load from an explicit file, which must exist
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {:?}", path))
    }

    /// Load from the per-user config file, or defaults if there is none
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                debug!("No config file, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// `<config_dir>/todostore/config.yaml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Store directory to use: configured, else `<data_dir>/todostore`
    pub fn store_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.store_dir {
            return Ok(dir.clone());
        }
        dirs::data_dir()
            .map(|dir| dir.join(APP_DIR))
            .ok_or_else(|| eyre!("Cannot determine a data directory, set store_dir in the config file"))
    }
}
