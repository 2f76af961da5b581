//! In-memory stand-ins for the plugin, iptables, and namespace primitives,
//! shared by the orchestrator and transport tests.

use crate::cni::invoker::{PluginExecutor, PluginRequest};
use crate::cni::CniCommand;
use crate::config::NetjailConfig;
use crate::error::{NetjailError, Result};
use crate::iptables::IpTables;
use crate::manager::NetworkManager;
use crate::netns::{NetnsManager, NetnsSource};
use crate::types::UpInputs;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub struct FakeExecutor {
    log: Mutex<Vec<PluginRequest>>,
    fail_del_types: HashSet<String>,
    with_dns: bool,
}

impl FakeExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(Vec::new()),
            fail_del_types: HashSet::new(),
            with_dns: true,
        })
    }

    pub fn without_dns() -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(Vec::new()),
            fail_del_types: HashSet::new(),
            with_dns: false,
        })
    }

    pub fn failing_del_on(types: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(Vec::new()),
            fail_del_types: types.iter().map(|t| t.to_string()).collect(),
            with_dns: true,
        })
    }

    pub fn requests(&self) -> Vec<PluginRequest> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl PluginExecutor for Arc<FakeExecutor> {
    async fn execute(&self, request: PluginRequest) -> Result<serde_json::Value> {
        let fail = request.command == CniCommand::Del
            && self.fail_del_types.contains(&request.plugin_type);
        self.log.lock().unwrap().push(request);
        if fail {
            return Err(NetjailError::Plugin("exploded".to_string()));
        }
        let mut result = json!({"ip4": {"ip": "169.254.1.2/24"}});
        if self.with_dns {
            result["dns"] = json!({"nameservers": ["1.2.3.4"]});
        }
        Ok(result)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IptablesCall {
    NewChain(String, String),
    Append(String, String, Vec<String>),
}

pub struct RecordingIpTables {
    calls: Mutex<Vec<IptablesCall>>,
}

impl RecordingIpTables {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<IptablesCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl IpTables for RecordingIpTables {
    fn new_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(IptablesCall::NewChain(table.to_string(), chain.to_string()));
        Ok(())
    }

    fn bulk_append(&self, table: &str, chain: &str, rules: &[Vec<String>]) -> Result<()> {
        let mut calls = self.calls.lock().unwrap();
        for rule in rules {
            calls.push(IptablesCall::Append(
                table.to_string(),
                chain.to_string(),
                rule.clone(),
            ));
        }
        Ok(())
    }
}

/// Stands in for the mount/setns primitives: "binding" creates a plain
/// file and namespace entry runs the closure on the current thread.
pub struct FakeNetns {
    pub root: PathBuf,
    pub unbinds: Mutex<Vec<String>>,
}

impl FakeNetns {
    pub fn new(root: &Path) -> Arc<Self> {
        Arc::new(Self {
            root: root.to_path_buf(),
            unbinds: Mutex::new(Vec::new()),
        })
    }
}

impl NetnsManager for FakeNetns {
    fn bind(&self, handle: &str, _source: &NetnsSource) -> Result<PathBuf> {
        let path = self.root.join(handle);
        std::fs::write(&path, b"")?;
        Ok(path)
    }

    fn unbind(&self, handle: &str) -> Result<()> {
        self.unbinds.lock().unwrap().push(handle.to_string());
        match std::fs::remove_file(self.root.join(handle)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn enter_and_run(
        &self,
        _netns_path: &Path,
        f: Box<dyn FnOnce() -> Result<()> + Send>,
    ) -> Result<()> {
        f()
    }
}

/// A fully wired orchestrator over fakes, plus handles to inspect them.
pub struct TestHarness {
    pub manager: Arc<NetworkManager>,
    pub executor: Arc<FakeExecutor>,
    pub iptables: Arc<RecordingIpTables>,
    pub netns: Arc<FakeNetns>,
    pub config_dir: PathBuf,
    _dir: tempfile::TempDir,
}

pub fn harness_with(executor: Arc<FakeExecutor>, proxy_cidr: &str) -> TestHarness {
    build_harness(executor, proxy_cidr, vec!["example.com".to_string()])
}

pub fn harness_without_search_domains() -> TestHarness {
    build_harness(FakeExecutor::new(), "", Vec::new())
}

fn build_harness(
    executor: Arc<FakeExecutor>,
    proxy_cidr: &str,
    search_domains: Vec<String>,
) -> TestHarness {
    let dir = tempfile::tempdir().unwrap();
    let config_dir = dir.path().join("cni-config");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(
        config_dir.join("0-plugin-0.conf"),
        r#"{"cniVersion": "0.1.0", "name": "some-net-0", "type": "plugin-0"}"#,
    )
    .unwrap();
    std::fs::write(
        config_dir.join("1-plugin-1.conf"),
        r#"{"cniVersion": "0.1.0", "name": "some-net-1", "type": "plugin-1"}"#,
    )
    .unwrap();

    let config = NetjailConfig {
        cni_plugin_dir: dir.path().join("cni-bin"),
        cni_config_dir: config_dir.clone(),
        bind_mount_dir: dir.path().join("mounts"),
        proxy_redirect_cidr: proxy_cidr.to_string(),
        proxy_port: 9999,
        proxy_uid: 42,
        state_file: dir.path().join("state.json"),
        start_port: 60000,
        total_ports: 56,
        log_prefix: "netjail".to_string(),
        search_domains,
    };

    let mounts = dir.path().join("mounts");
    std::fs::create_dir_all(&mounts).unwrap();
    let iptables = RecordingIpTables::new();
    let netns = FakeNetns::new(&mounts);
    let manager = NetworkManager::with_parts(
        config,
        Box::new(executor.clone()),
        iptables.clone(),
        netns.clone(),
    )
    .unwrap();

    TestHarness {
        manager: Arc::new(manager),
        executor,
        iptables,
        netns,
        config_dir,
        _dir: dir,
    }
}

pub fn harness() -> TestHarness {
    harness_with(FakeExecutor::new(), "")
}

/// The canonical request: one explicit mapping, one dynamic mapping, one
/// logged egress rule.
pub fn sample_inputs() -> UpInputs {
    serde_json::from_value(json!({
        "pid": 1234,
        "properties": {"some-key": "some-value"},
        "netin": [
            {"host_port": 12345, "container_port": 7000},
            {"host_port": 0, "container_port": 7000}
        ],
        "netout_rules": [{
            "protocol": 1,
            "networks": [{"start": "8.8.8.8", "end": "9.9.9.9"}],
            "ports": [{"start": 53, "end": 54}],
            "log": true
        }]
    }))
    .unwrap()
}
