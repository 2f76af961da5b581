//! Pure construction of ordered iptables rule specifications. Nothing here
//! touches the system; the orchestrator applies the output inside the
//! container's namespace via the iptables adapter.

use crate::types::{NetOutRule, PortMapping, PROTOCOL_ICMP, PROTOCOL_TCP, PROTOCOL_UDP};
use sha2::{Digest, Sha256};

pub const NAT_TABLE: &str = "nat";
pub const FILTER_TABLE: &str = "filter";
pub const OUTPUT_CHAIN: &str = "OUTPUT";
pub const PREROUTING_CHAIN: &str = "PREROUTING";

/// Kernel log prefixes are capped at 29 bytes including the trailing NUL.
const MAX_LOG_PREFIX: usize = 28;

/// Per-container chain names. Handles are hashed so arbitrary-length
/// handles always fit iptables' 28-character chain name limit while staying
/// deterministic per handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainNames {
    pub ingress: String,
    pub egress: String,
    pub log: String,
    pub proxy: String,
}

pub fn chain_names(handle: &str) -> ChainNames {
    let digest = hex::encode(Sha256::digest(handle.as_bytes()));
    let tag = &digest[..10];
    ChainNames {
        ingress: format!("nj-in-{tag}"),
        egress: format!("nj-out-{tag}"),
        log: format!("nj-log-{tag}"),
        proxy: format!("nj-prx-{tag}"),
    }
}

/// DNAT rules for ingress port mappings, one per mapping, in request order.
/// Dynamic entries must already carry their allocated host port.
pub fn ingress_rules(mappings: &[PortMapping], container_ip: &str) -> Vec<Vec<String>> {
    mappings
        .iter()
        .map(|mapping| {
            vec![
                "-p".to_string(),
                "tcp".to_string(),
                "-m".to_string(),
                "tcp".to_string(),
                "--dport".to_string(),
                mapping.host_port.to_string(),
                "-j".to_string(),
                "DNAT".to_string(),
                "--to-destination".to_string(),
                format!("{}:{}", container_ip, mapping.container_port),
            ]
        })
        .collect()
}

/// The single jump appended to `OUTPUT` routing traffic into the proxy
/// chain.
pub fn proxy_output_jump(proxy_chain: &str) -> Vec<String> {
    vec!["-j".to_string(), proxy_chain.to_string()]
}

/// Rules appended to the proxy chain, in order: exempt the proxy's own
/// traffic first, then redirect remaining TCP traffic for the CIDR to the
/// local proxy port. The RETURN must precede the REDIRECT or the proxy
/// would loop on its own outbound connections.
pub fn proxy_chain_rules(proxy_uid: u32, redirect_cidr: &str, proxy_port: u16) -> Vec<Vec<String>> {
    vec![
        vec![
            "-m".to_string(),
            "owner".to_string(),
            "--uid-owner".to_string(),
            proxy_uid.to_string(),
            "-j".to_string(),
            "RETURN".to_string(),
        ],
        vec![
            "-d".to_string(),
            redirect_cidr.to_string(),
            "-p".to_string(),
            "tcp".to_string(),
            "-j".to_string(),
            "REDIRECT".to_string(),
            "--to-ports".to_string(),
            proxy_port.to_string(),
        ],
    ]
}

/// Egress filter rules, one per (entry, network, port-range) combination,
/// in entry order. Entries with `log` jump to the per-container log chain
/// instead of accepting directly.
pub fn egress_rules(rules: &[NetOutRule], log_chain: &str) -> Vec<Vec<String>> {
    let mut out = Vec::new();

    for rule in rules {
        let verdict: Vec<String> = if rule.log {
            vec!["-j".to_string(), log_chain.to_string()]
        } else {
            vec!["-j".to_string(), "ACCEPT".to_string()]
        };

        let protocol = protocol_name(rule.protocol);
        let with_ports = matches!(rule.protocol, PROTOCOL_TCP | PROTOCOL_UDP);

        let networks: Vec<Option<String>> = if rule.networks.is_empty() {
            vec![None]
        } else {
            rule.networks
                .iter()
                .map(|range| Some(format!("{}-{}", range.start, range.end)))
                .collect()
        };
        let ports: Vec<Option<String>> = if !with_ports || rule.ports.is_empty() {
            vec![None]
        } else {
            rule.ports
                .iter()
                .map(|range| Some(format!("{}:{}", range.start, range.end)))
                .collect()
        };

        for network in &networks {
            for port in &ports {
                let mut args = Vec::new();
                if let Some(protocol) = protocol {
                    args.push("-p".to_string());
                    args.push(protocol.to_string());
                }
                if let Some(network) = network {
                    args.push("-m".to_string());
                    args.push("iprange".to_string());
                    args.push("--dst-range".to_string());
                    args.push(network.clone());
                }
                if let Some(port) = port {
                    args.push("--dport".to_string());
                    args.push(port.clone());
                }
                args.extend(verdict.iter().cloned());
                out.push(args);
            }
        }
    }

    out
}

/// Contents of the per-container log chain: log the packet, then accept it.
pub fn log_chain_rules(log_prefix: &str) -> Vec<Vec<String>> {
    let mut prefix: String = log_prefix.chars().take(MAX_LOG_PREFIX - 1).collect();
    prefix.push(' ');
    vec![
        vec![
            "-j".to_string(),
            "LOG".to_string(),
            "--log-prefix".to_string(),
            prefix,
        ],
        vec!["-j".to_string(), "ACCEPT".to_string()],
    ]
}

fn protocol_name(protocol: u8) -> Option<&'static str> {
    match protocol {
        PROTOCOL_TCP => Some("tcp"),
        PROTOCOL_UDP => Some("udp"),
        PROTOCOL_ICMP => Some("icmp"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IpRange, PortRange, PROTOCOL_ALL};

    #[test]
    fn test_chain_names_deterministic_and_short() {
        let first = chain_names("some-container-handle-that-is-quite-long");
        let second = chain_names("some-container-handle-that-is-quite-long");
        assert_eq!(first, second);

        for name in [&first.ingress, &first.egress, &first.log, &first.proxy] {
            assert!(name.len() <= 28, "{name} exceeds chain name limit");
        }

        let other = chain_names("other-handle");
        assert_ne!(first.ingress, other.ingress);
    }

    #[test]
    fn test_ingress_rules_preserve_request_order() {
        let rules = ingress_rules(
            &[
                PortMapping {
                    host_port: 12345,
                    container_port: 7000,
                },
                PortMapping {
                    host_port: 60000,
                    container_port: 7000,
                },
            ],
            "169.254.1.2",
        );

        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0][5], "12345");
        assert_eq!(rules[0][9], "169.254.1.2:7000");
        assert_eq!(rules[1][5], "60000");
    }

    #[test]
    fn test_proxy_rules_return_precedes_redirect() {
        let rules = proxy_chain_rules(42, "10.255.0.0/16", 9999);
        assert_eq!(
            rules[0],
            vec!["-m", "owner", "--uid-owner", "42", "-j", "RETURN"]
        );
        assert_eq!(
            rules[1],
            vec![
                "-d",
                "10.255.0.0/16",
                "-p",
                "tcp",
                "-j",
                "REDIRECT",
                "--to-ports",
                "9999"
            ]
        );
    }

    #[test]
    fn test_proxy_output_jump() {
        assert_eq!(proxy_output_jump("nj-prx-abc"), vec!["-j", "nj-prx-abc"]);
    }

    #[test]
    fn test_egress_rule_with_range_and_log() {
        let rules = egress_rules(
            &[NetOutRule {
                protocol: PROTOCOL_TCP,
                networks: vec![IpRange {
                    start: "8.8.8.8".to_string(),
                    end: "9.9.9.9".to_string(),
                }],
                ports: vec![PortRange { start: 53, end: 54 }],
                log: true,
            }],
            "nj-log-abc",
        );

        assert_eq!(
            rules,
            vec![vec![
                "-p",
                "tcp",
                "-m",
                "iprange",
                "--dst-range",
                "8.8.8.8-9.9.9.9",
                "--dport",
                "53:54",
                "-j",
                "nj-log-abc"
            ]]
        );
    }

    #[test]
    fn test_egress_expands_network_port_combinations() {
        let rules = egress_rules(
            &[NetOutRule {
                protocol: PROTOCOL_UDP,
                networks: vec![
                    IpRange {
                        start: "1.1.1.1".to_string(),
                        end: "1.1.1.9".to_string(),
                    },
                    IpRange {
                        start: "2.2.2.2".to_string(),
                        end: "2.2.2.9".to_string(),
                    },
                ],
                ports: vec![
                    PortRange { start: 53, end: 53 },
                    PortRange {
                        start: 8000,
                        end: 8100,
                    },
                ],
                log: false,
            }],
            "nj-log-abc",
        );

        assert_eq!(rules.len(), 4);
        assert!(rules.iter().all(|r| r.ends_with(&[
            "-j".to_string(),
            "ACCEPT".to_string()
        ])));
        assert_eq!(rules[0][5], "1.1.1.1-1.1.1.9");
        assert_eq!(rules[0][7], "53:53");
        assert_eq!(rules[3][5], "2.2.2.2-2.2.2.9");
        assert_eq!(rules[3][7], "8000:8100");
    }

    #[test]
    fn test_egress_icmp_and_all_skip_ports() {
        let rules = egress_rules(
            &[
                NetOutRule {
                    protocol: PROTOCOL_ICMP,
                    networks: vec![IpRange {
                        start: "8.8.8.8".to_string(),
                        end: "8.8.8.8".to_string(),
                    }],
                    ports: vec![PortRange { start: 1, end: 2 }],
                    log: false,
                },
                NetOutRule {
                    protocol: PROTOCOL_ALL,
                    networks: vec![IpRange {
                        start: "8.8.8.8".to_string(),
                        end: "8.8.8.8".to_string(),
                    }],
                    ports: vec![],
                    log: false,
                },
            ],
            "nj-log-abc",
        );

        assert_eq!(rules.len(), 2);
        assert!(rules[0].contains(&"icmp".to_string()));
        assert!(!rules[0].contains(&"--dport".to_string()));
        assert!(!rules[1].contains(&"-p".to_string()));
    }

    #[test]
    fn test_log_chain_rules_truncate_prefix() {
        let rules = log_chain_rules("a-very-long-log-prefix-that-exceeds-the-kernel-cap");
        assert_eq!(rules.len(), 2);
        assert!(rules[0][3].len() <= MAX_LOG_PREFIX);
        assert_eq!(rules[1], vec!["-j", "ACCEPT"]);
    }
}
