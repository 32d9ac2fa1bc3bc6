use std::path::{Path, PathBuf};

use schemaflow_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

/// Resolves and parses the runner configuration file.
///
/// An explicitly given path must exist. When no path is given the default
/// location is tried and its absence simply yields the built-in defaults.
pub struct ConfigLoader {
    path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// `<config_dir>/schemaflow/config.yml`, e.g. `~/.config/schemaflow/config.yml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("schemaflow").join("config.yml"))
    }

    pub fn load(&self) -> Result<AppConfig> {
        let config = match &self.path {
            Some(path) => {
                if !path.exists() {
                    return Err(Error::Config(format!(
                        "config file not found: {}",
                        path.display()
                    )));
                }
                parse_file(path)?
            }
            None => match Self::default_path() {
                Some(path) if path.exists() => parse_file(&path)?,
                _ => {
                    debug!("no config file found, using defaults");
                    AppConfig::default()
                }
            },
        };

        config.validate()?;
        Ok(config)
    }
}

fn parse_file(path: &Path) -> Result<AppConfig> {
    info!("loading config from {}", path.display());
    let contents = std::fs::read_to_string(path)?;

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "yml" | "yaml" => serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(format!("YAML parse error in {}: {e}", path.display()))),
        "toml" => toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("TOML parse error in {}: {e}", path.display()))),
        other => Err(Error::Config(format!(
            "unsupported config extension: {other}"
        ))),
    }
}
