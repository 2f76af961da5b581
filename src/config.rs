use crate::error::{NetjailError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Adapter configuration, loaded from the JSON file named by `--config-file`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetjailConfig {
    /// Directory containing the CNI plugin binaries
    pub cni_plugin_dir: PathBuf,

    /// Directory scanned for `.conf` / `.conflist` plugin configurations
    pub cni_config_dir: PathBuf,

    /// Root under which container network namespaces are bind-mounted
    pub bind_mount_dir: PathBuf,

    /// CIDR whose outbound traffic is redirected to the local proxy.
    /// Empty means no proxy interception rules are installed.
    #[serde(default)]
    pub proxy_redirect_cidr: String,

    /// Local port the intercepting proxy listens on
    #[serde(default)]
    pub proxy_port: u16,

    /// UID the proxy runs as; its own traffic is exempt from redirection
    #[serde(default)]
    pub proxy_uid: u32,

    /// Persisted attachment state file
    pub state_file: PathBuf,

    /// First host port handed out for dynamic (`host_port: 0`) mappings
    pub start_port: u16,

    /// Size of the dynamic host-port window starting at `start_port`
    pub total_ports: u16,

    /// Kernel log prefix for egress rules with logging enabled
    #[serde(default = "default_log_prefix")]
    pub log_prefix: String,

    /// DNS search domains reported to the runtime; empty list is omitted
    /// from results entirely
    #[serde(default)]
    pub search_domains: Vec<String>,
}

fn default_log_prefix() -> String {
    "netjail".to_string()
}

impl NetjailConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            NetjailError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            NetjailError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.bind_mount_dir.as_os_str().is_empty() {
            return Err(NetjailError::Config(
                "bind_mount_dir must not be empty".to_string(),
            ));
        }
        if self.state_file.as_os_str().is_empty() {
            return Err(NetjailError::Config(
                "state_file must not be empty".to_string(),
            ));
        }
        if self.total_ports == 0 {
            return Err(NetjailError::Config(
                "total_ports must be greater than zero".to_string(),
            ));
        }
        if !self.proxy_redirect_cidr.is_empty() && self.proxy_port == 0 {
            return Err(NetjailError::Config(
                "proxy_port is required when proxy_redirect_cidr is set".to_string(),
            ));
        }
        Ok(())
    }
}
