use serde::{Deserialize, Serialize};

pub mod invoker;
pub mod loader;

/// CNI operation selector, exported to plugins as `CNI_COMMAND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CniCommand {
    Add,
    Del,
}

impl CniCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            CniCommand::Add => "ADD",
            CniCommand::Del => "DEL",
        }
    }
}

/// Fixed interface name inside the container, exported as `CNI_IFNAME`.
pub const CNI_IFNAME: &str = "eth0";

/// Single-plugin network configuration, parsed from a `.conf` file.
///
/// `fragment` retains every key of the original file (`cniVersion` and any
/// plugin-specific settings), so re-serializing the struct reproduces the
/// file contents verbatim for plugin stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CniConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(rename = "type")]
    pub plugin_type: String,

    #[serde(flatten)]
    pub fragment: serde_json::Map<String, serde_json::Value>,
}

/// Ordered plugin-list configuration, parsed from a `.conflist` file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CniConfigList {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    pub plugins: Vec<CniConfig>,

    #[serde(flatten)]
    pub fragment: serde_json::Map<String, serde_json::Value>,
}

/// Result reported by a plugin on stdout. Kept as raw JSON so it can be
/// chained into the next plugin's stdin unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CniResult(pub serde_json::Value);

impl CniResult {
    /// IP address assigned to the container, without the prefix length.
    /// Reads the legacy `ip4.ip` field first, then `ips[0].address`.
    pub fn container_ip(&self) -> Option<String> {
        let from_ip4 = self.0.pointer("/ip4/ip").and_then(|v| v.as_str());
        let from_ips = self.0.pointer("/ips/0/address").and_then(|v| v.as_str());
        from_ip4
            .or(from_ips)
            .map(|cidr| cidr.split('/').next().unwrap_or(cidr).to_string())
    }

    /// DNS nameservers reported by the plugin, empty when none.
    pub fn dns_servers(&self) -> Vec<String> {
        self.0
            .pointer("/dns/nameservers")
            .and_then(|v| v.as_array())
            .map(|servers| {
                servers
                    .iter()
                    .filter_map(|s| s.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}
