use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Result property key for the container's assigned IP address.
pub const PROP_CONTAINER_IP: &str = "network.container-ip";
/// Result property key for the host-side IP address.
pub const PROP_HOST_IP: &str = "network.host-ip";
/// Result property key for the JSON-encoded realized port mappings.
pub const PROP_MAPPED_PORTS: &str = "network.mapped-ports";

/// Placeholder host address reported to the runtime. Ingress traffic is
/// DNAT'd per mapping, so no single host address is meaningful to callers.
pub const HOST_IP_PLACEHOLDER: &str = "255.255.255.255";

/// Attachment request decoded from stdin (one-shot mode) or the socket
/// message payload (daemon mode). Immutable after decode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpInputs {
    /// Process whose network namespace should be attached. Required in
    /// one-shot mode; ignored on the socket path, where the namespace
    /// arrives as an ancillary file descriptor.
    #[serde(default)]
    pub pid: Option<i32>,

    /// Free-form metadata passed through to plugins and policy
    #[serde(default)]
    pub properties: HashMap<String, String>,

    /// Ingress port mappings; a host port of 0 requests dynamic allocation
    #[serde(default)]
    pub netin: Vec<PortMapping>,

    /// Egress filter rules
    #[serde(default)]
    pub netout_rules: Vec<NetOutRule>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

/// Port mapping as reported back to the container runtime. The runtime's
/// consumer contract uses capitalized key spelling, distinct from the
/// request and plugin wire formats.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MappedPort {
    #[serde(rename = "HostPort")]
    pub host_port: u16,
    #[serde(rename = "ContainerPort")]
    pub container_port: u16,
}

/// Egress filter rule. Protocol numbering: 1 = tcp, 2 = udp, 3 = icmp,
/// 4 = all.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetOutRule {
    pub protocol: u8,

    #[serde(default)]
    pub networks: Vec<IpRange>,

    #[serde(default)]
    pub ports: Vec<PortRange>,

    #[serde(default)]
    pub log: bool,
}

pub const PROTOCOL_TCP: u8 = 1;
pub const PROTOCOL_UDP: u8 = 2;
pub const PROTOCOL_ICMP: u8 = 3;
pub const PROTOCOL_ALL: u8 = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpRange {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

/// Attachment result returned to the container runtime.
///
/// `dns_servers` is omitted entirely when the plugin chain reported no
/// nameservers, and `search_domains` when none are configured, so the
/// runtime falls back to the host's resolver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpOutputs {
    pub properties: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_servers: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_domains: Option<Vec<String>>,
}
