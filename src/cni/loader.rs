use crate::cni::{CniConfig, CniConfigList};
use crate::error::{NetjailError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Loads CNI network configurations from a directory.
///
/// Regular files ending in `.conf` parse as single-plugin configs and files
/// ending in `.conflist` as ordered plugin lists; anything else is ignored.
/// Files are visited in lexicographic filename order so the resulting plugin
/// ordering is deterministic across repeated loads.
pub struct CniLoader {
    pub config_dir: PathBuf,
}

impl CniLoader {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn load(&self) -> Result<(Vec<CniConfig>, Vec<CniConfigList>)> {
        let mut configs = Vec::new();
        let mut config_lists = Vec::new();

        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.config_dir)
            .map_err(|e| {
                NetjailError::Config(format!(
                    "Failed to read CNI config directory {}: {}",
                    self.config_dir.display(),
                    e
                ))
            })?
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| {
                NetjailError::Config(format!(
                    "Failed to read CNI config directory {}: {}",
                    self.config_dir.display(),
                    e
                ))
            })?
            .into_iter()
            .map(|entry| entry.path())
            .collect();
        paths.sort();

        for path in paths {
            if !path.is_file() {
                continue;
            }
            match path.extension().and_then(|e| e.to_str()) {
                Some("conf") => {
                    debug!("Loading CNI config from {}", path.display());
                    configs.push(parse_file::<CniConfig>(&path)?);
                }
                Some("conflist") => {
                    debug!("Loading CNI config list from {}", path.display());
                    config_lists.push(parse_file::<CniConfigList>(&path)?);
                }
                _ => {}
            }
        }

        Ok((configs, config_lists))
    }
}

fn parse_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        NetjailError::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        NetjailError::Config(format!(
            "Unable to load config from {}: {}",
            path.display(),
            e
        ))
    })
}
