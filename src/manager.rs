use crate::cni::invoker::{BinaryExecutor, ChainInvoker, PluginExecutor, RuntimeConfig};
use crate::cni::loader::CniLoader;
use crate::cni::CniConfig;
use crate::config::NetjailConfig;
use crate::error::{NetjailError, Result};
use crate::iptables::{IpTables, IptablesCommand};
use crate::netns::{BindMounter, NetnsManager, NetnsSource};
use crate::ports::PortAllocator;
use crate::rules;
use crate::state::{AttachmentEntry, StateStore};
use crate::types::{
    MappedPort, PortMapping, UpInputs, UpOutputs, HOST_IP_PLACEHOLDER, PROP_CONTAINER_IP,
    PROP_HOST_IP, PROP_MAPPED_PORTS,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// The up/down state machine. One invocation runs strictly sequentially:
/// resolve the namespace, invoke the plugin chain, apply firewall rules
/// inside the namespace, persist state. Failure at any step aborts the
/// rest and returns immediately; already-applied effects are not rolled
/// back, and the caller is expected to issue `down` to clean up.
pub struct NetworkManager {
    config: NetjailConfig,
    store: StateStore,
    invoker: ChainInvoker,
    iptables: Arc<dyn IpTables>,
    netns: Arc<dyn NetnsManager>,
    allocator: PortAllocator,
    /// Ports promised to in-flight attachments that have not reached the
    /// state store yet
    reserved_ports: Mutex<HashSet<u16>>,
}

impl NetworkManager {
    pub fn new(config: NetjailConfig) -> Result<Self> {
        let executor = Box::new(BinaryExecutor::new(&config.cni_plugin_dir));
        let iptables: Arc<dyn IpTables> = Arc::new(IptablesCommand::discover()?);
        let netns: Arc<dyn NetnsManager> = Arc::new(BindMounter::new(&config.bind_mount_dir));
        Self::with_parts(config, executor, iptables, netns)
    }

    pub fn with_parts(
        config: NetjailConfig,
        executor: Box<dyn PluginExecutor>,
        iptables: Arc<dyn IpTables>,
        netns: Arc<dyn NetnsManager>,
    ) -> Result<Self> {
        let store = StateStore::open(&config.state_file)?;
        let allocator = PortAllocator::new(config.start_port, config.total_ports);
        Ok(Self {
            store,
            invoker: ChainInvoker::new(executor),
            iptables,
            netns,
            allocator,
            reserved_ports: Mutex::new(HashSet::new()),
            config,
        })
    }

    /// Attaches `handle`'s network namespace: bind mount, CNI ADD chain,
    /// firewall rules inside the namespace, persisted state, assembled
    /// result.
    pub async fn up(
        &self,
        handle: &str,
        inputs: UpInputs,
        source: NetnsSource,
    ) -> Result<UpOutputs> {
        if handle.is_empty() {
            return Err(NetjailError::Config("missing handle".to_string()));
        }
        if self.store.get(handle)?.is_some() {
            return Err(NetjailError::AlreadyAttached(handle.to_string()));
        }
        info!("Attaching network for container {}", handle);

        let netns_path = self.netns.bind(handle, &source)?;

        let (configs, config_lists) = CniLoader::new(&self.config.cni_config_dir).load()?;
        let mut chain_configs: Vec<CniConfig> = configs;
        for list in config_lists {
            chain_configs.extend(list.plugins);
        }
        if chain_configs.is_empty() {
            return Err(NetjailError::Config(format!(
                "No CNI plugin configurations found in {}",
                self.config.cni_config_dir.display()
            )));
        }

        let dynamic_count = inputs.netin.iter().filter(|m| m.host_port == 0).count();
        let allocated = self.reserve_ports(dynamic_count, &inputs.netin)?;
        let outcome = self
            .attach(handle, &inputs, &netns_path, chain_configs, &allocated)
            .await;
        // reservations are only a bridge until the entry is persisted (or
        // the attempt failed); either way they can be dropped now
        self.release_ports(&allocated);
        outcome
    }

    async fn attach(
        &self,
        handle: &str,
        inputs: &UpInputs,
        netns_path: &Path,
        chain_configs: Vec<CniConfig>,
        allocated: &[u16],
    ) -> Result<UpOutputs> {
        let resolved = resolve_mappings(&inputs.netin, allocated)?;

        let runtime = RuntimeConfig {
            port_mappings: resolved.clone(),
            net_out_rules: inputs.netout_rules.clone(),
        };
        let results = self
            .invoker
            .add(handle, netns_path, &chain_configs, &runtime, &inputs.properties)
            .await?;

        let final_result = results
            .last()
            .ok_or_else(|| NetjailError::Plugin("Plugin chain produced no result".to_string()))?;
        let container_ip = final_result.container_ip().ok_or_else(|| {
            NetjailError::Plugin("Plugin chain reported no container address".to_string())
        })?;
        let dns_servers = final_result.dns_servers();

        let chains = rules::chain_names(handle);
        let applied_chains =
            self.apply_rules(netns_path, &chains, &resolved, &container_ip, inputs)?;

        self.store.insert_new(AttachmentEntry {
            handle: handle.to_string(),
            netns_path: netns_path.to_path_buf(),
            cni_configs: chain_configs,
            plugin_results: results,
            allocated_ports: resolved.iter().map(|m| m.host_port).collect(),
            chain_names: applied_chains,
            created_at: chrono::Utc::now(),
        })?;

        let mapped: Vec<MappedPort> = resolved
            .iter()
            .map(|m| MappedPort {
                host_port: m.host_port,
                container_port: m.container_port,
            })
            .collect();

        let mut properties = HashMap::new();
        properties.insert(PROP_CONTAINER_IP.to_string(), container_ip);
        properties.insert(PROP_HOST_IP.to_string(), HOST_IP_PLACEHOLDER.to_string());
        properties.insert(PROP_MAPPED_PORTS.to_string(), serde_json::to_string(&mapped)?);

        Ok(UpOutputs {
            properties,
            dns_servers: (!dns_servers.is_empty()).then_some(dns_servers),
            search_domains: (!self.config.search_domains.is_empty())
                .then(|| self.config.search_domains.clone()),
        })
    }

    /// Creates the per-container chains and appends all synthesized rules,
    /// inside the container's namespace, in fixed order: ingress NAT, then
    /// proxy redirection, then egress filters. Returns the chains created.
    fn apply_rules(
        &self,
        netns_path: &Path,
        chains: &rules::ChainNames,
        resolved: &[PortMapping],
        container_ip: &str,
        inputs: &UpInputs,
    ) -> Result<Vec<String>> {
        let mut created = Vec::new();

        let ingress = rules::ingress_rules(resolved, container_ip);
        let proxy = (!self.config.proxy_redirect_cidr.is_empty()).then(|| {
            (
                rules::proxy_output_jump(&chains.proxy),
                rules::proxy_chain_rules(
                    self.config.proxy_uid,
                    &self.config.proxy_redirect_cidr,
                    self.config.proxy_port,
                ),
            )
        });
        let needs_log = inputs.netout_rules.iter().any(|rule| rule.log);
        let egress = rules::egress_rules(&inputs.netout_rules, &chains.log);
        let log_rules = rules::log_chain_rules(&self.config.log_prefix);

        if !ingress.is_empty() {
            created.push(chains.ingress.clone());
        }
        if proxy.is_some() {
            created.push(chains.proxy.clone());
        }
        if needs_log {
            created.push(chains.log.clone());
        }
        if !egress.is_empty() {
            created.push(chains.egress.clone());
        }
        if created.is_empty() {
            debug!("No firewall rules to apply for {}", netns_path.display());
            return Ok(created);
        }

        let iptables = self.iptables.clone();
        let chains = chains.clone();
        self.netns.enter_and_run(
            netns_path,
            Box::new(move || {
                if !ingress.is_empty() {
                    iptables.new_chain(rules::NAT_TABLE, &chains.ingress)?;
                    iptables.bulk_append(
                        rules::NAT_TABLE,
                        rules::PREROUTING_CHAIN,
                        &[vec!["-j".to_string(), chains.ingress.clone()]],
                    )?;
                    iptables.bulk_append(rules::NAT_TABLE, &chains.ingress, &ingress)?;
                }

                if let Some((jump, proxy_rules)) = proxy {
                    iptables.new_chain(rules::NAT_TABLE, &chains.proxy)?;
                    iptables.bulk_append(
                        rules::NAT_TABLE,
                        rules::OUTPUT_CHAIN,
                        std::slice::from_ref(&jump),
                    )?;
                    iptables.bulk_append(rules::NAT_TABLE, &chains.proxy, &proxy_rules)?;
                }

                if !egress.is_empty() {
                    if needs_log {
                        iptables.new_chain(rules::FILTER_TABLE, &chains.log)?;
                        iptables.bulk_append(rules::FILTER_TABLE, &chains.log, &log_rules)?;
                    }
                    iptables.new_chain(rules::FILTER_TABLE, &chains.egress)?;
                    iptables.bulk_append(
                        rules::FILTER_TABLE,
                        rules::OUTPUT_CHAIN,
                        &[vec!["-j".to_string(), chains.egress.clone()]],
                    )?;
                    iptables.bulk_append(rules::FILTER_TABLE, &chains.egress, &egress)?;
                }

                Ok(())
            }),
        )?;

        Ok(created)
    }

    /// Detaches `handle`. A missing attachment is success. Plugin DEL and
    /// unmount failures are collected but never stop the remaining
    /// cleanup; whatever went wrong is reported after cleanup has gone as
    /// far as it can.
    pub async fn down(&self, handle: &str) -> Result<()> {
        let Some(entry) = self.store.get(handle)? else {
            debug!("No attachment state for {}, nothing to tear down", handle);
            // a failed up can leave a bind mount behind with no state
            // entry; unbind is idempotent, so clear it on the way out
            self.netns.unbind(handle)?;
            return Ok(());
        };
        info!("Detaching network for container {}", handle);

        let mut problems = self
            .invoker
            .del(handle, &entry.netns_path, &entry.cni_configs)
            .await;

        if let Err(e) = self.netns.unbind(handle) {
            problems.push(format!("unbind: {e}"));
        }
        if let Err(e) = self.store.remove(handle) {
            problems.push(format!("state removal: {e}"));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(NetjailError::Teardown(problems.join("; ")))
        }
    }

    fn reserve_ports(&self, count: usize, netin: &[PortMapping]) -> Result<Vec<u16>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut reserved = self
            .reserved_ports
            .lock()
            .map_err(|_| NetjailError::PortAllocation("Reservation mutex poisoned".to_string()))?;

        let mut in_use = self.store.ports_in_use()?;
        in_use.extend(reserved.iter().copied());
        in_use.extend(netin.iter().map(|m| m.host_port).filter(|p| *p != 0));

        let ports = self.allocator.allocate(count, &in_use)?;
        reserved.extend(ports.iter().copied());
        Ok(ports)
    }

    fn release_ports(&self, ports: &[u16]) {
        if ports.is_empty() {
            return;
        }
        if let Ok(mut reserved) = self.reserved_ports.lock() {
            for port in ports {
                reserved.remove(port);
            }
        }
    }
}

/// Replaces every dynamic (zero) host port with the next allocated port,
/// preserving request order.
fn resolve_mappings(netin: &[PortMapping], allocated: &[u16]) -> Result<Vec<PortMapping>> {
    let mut next = allocated.iter();
    netin
        .iter()
        .map(|mapping| {
            let host_port = if mapping.host_port == 0 {
                *next.next().ok_or_else(|| {
                    NetjailError::PortAllocation(
                        "Dynamic mapping without an allocated port".to_string(),
                    )
                })?
            } else {
                mapping.host_port
            };
            Ok(PortMapping {
                host_port,
                container_port: mapping.container_port,
            })
        })
        .collect()
}
