use crate::cni::{CniCommand, CniConfig, CniResult, CNI_IFNAME};
use crate::error::{NetjailError, Result};
use crate::types::{NetOutRule, PortMapping};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Runtime parameters merged into each plugin's static config on ADD.
/// Port mappings carry concrete host ports; dynamic entries are resolved
/// before the chain runs.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeConfig {
    #[serde(rename = "portMappings")]
    pub port_mappings: Vec<PortMapping>,

    #[serde(rename = "netOutRules")]
    pub net_out_rules: Vec<NetOutRule>,
}

/// One fully-assembled plugin invocation.
#[derive(Debug, Clone)]
pub struct PluginRequest {
    pub command: CniCommand,
    pub container_id: String,
    pub netns_path: PathBuf,
    pub ifname: String,
    pub plugin_type: String,
    pub stdin: serde_json::Value,
}

/// Narrow execution seam for a single plugin, so the chain can be driven
/// with in-memory stand-ins in tests.
#[async_trait]
pub trait PluginExecutor: Send + Sync {
    async fn execute(&self, request: PluginRequest) -> Result<serde_json::Value>;
}

/// Executes the plugin binary `<plugin_dir>/<type>` with the CNI
/// environment contract, feeding the request JSON on stdin and parsing
/// stdout as the plugin result.
pub struct BinaryExecutor {
    plugin_dir: PathBuf,
}

impl BinaryExecutor {
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
        }
    }
}

#[async_trait]
impl PluginExecutor for BinaryExecutor {
    async fn execute(&self, request: PluginRequest) -> Result<serde_json::Value> {
        let binary = self.plugin_dir.join(&request.plugin_type);
        debug!(
            "Invoking CNI plugin {} ({})",
            binary.display(),
            request.command.as_str()
        );

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", request.command.as_str())
            .env("CNI_CONTAINERID", &request.container_id)
            .env("CNI_NETNS", &request.netns_path)
            .env("CNI_IFNAME", &request.ifname)
            .env("CNI_PATH", &self.plugin_dir)
            .env("CNI_ARGS", "")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                NetjailError::Plugin(format!(
                    "Failed to spawn plugin {}: {}",
                    binary.display(),
                    e
                ))
            })?;

        let stdin_bytes = serde_json::to_vec(&request.stdin)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&stdin_bytes).await.map_err(|e| {
                NetjailError::Plugin(format!(
                    "Failed to write stdin to plugin {}: {}",
                    request.plugin_type, e
                ))
            })?;
        }

        let output = child.wait_with_output().await.map_err(|e| {
            NetjailError::Plugin(format!(
                "Failed to wait for plugin {}: {}",
                request.plugin_type, e
            ))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetjailError::Plugin(format!(
                "Plugin {} exited with {}: {}",
                request.plugin_type,
                output.status,
                stderr.trim()
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            NetjailError::Plugin(format!(
                "Plugin {} wrote malformed result JSON: {}",
                request.plugin_type, e
            ))
        })
    }
}

/// Drives an ordered chain of plugins: ADD front-to-back with result
/// chaining, DEL back-to-front collecting failures so every plugin gets a
/// chance to release its resources.
pub struct ChainInvoker {
    executor: Box<dyn PluginExecutor>,
}

impl ChainInvoker {
    pub fn new(executor: Box<dyn PluginExecutor>) -> Self {
        Self { executor }
    }

    /// Runs ADD across the chain. Each plugin's stdin is its static config
    /// merged with `runtimeConfig` and metadata; from the second plugin
    /// onward the previous plugin's result rides along as `prevResult`.
    /// The first failure aborts the remainder of the chain.
    pub async fn add(
        &self,
        container_id: &str,
        netns_path: &Path,
        configs: &[CniConfig],
        runtime: &RuntimeConfig,
        metadata: &HashMap<String, String>,
    ) -> Result<Vec<CniResult>> {
        let mut results: Vec<CniResult> = Vec::with_capacity(configs.len());

        for config in configs {
            let mut stdin = config_object(config)?;
            stdin.insert(
                "runtimeConfig".to_string(),
                serde_json::to_value(runtime)?,
            );
            if !metadata.is_empty() {
                stdin.insert("metadata".to_string(), serde_json::to_value(metadata)?);
            }
            if let Some(prev) = results.last() {
                stdin.insert("prevResult".to_string(), prev.0.clone());
            }

            let request = PluginRequest {
                command: CniCommand::Add,
                container_id: container_id.to_string(),
                netns_path: netns_path.to_path_buf(),
                ifname: CNI_IFNAME.to_string(),
                plugin_type: config.plugin_type.clone(),
                stdin: serde_json::Value::Object(stdin),
            };

            let result = self.executor.execute(request).await.map_err(|e| {
                NetjailError::Plugin(format!("ADD {}: {}", config.plugin_type, e))
            })?;
            results.push(CniResult(result));
        }

        Ok(results)
    }

    /// Runs DEL across the chain in reverse order. Failures are collected
    /// and returned, never short-circuiting the remaining plugins.
    pub async fn del(
        &self,
        container_id: &str,
        netns_path: &Path,
        configs: &[CniConfig],
    ) -> Vec<String> {
        let mut errors = Vec::new();

        for config in configs.iter().rev() {
            let stdin = match config_object(config) {
                Ok(object) => serde_json::Value::Object(object),
                Err(e) => {
                    errors.push(format!("DEL {}: {}", config.plugin_type, e));
                    continue;
                }
            };

            let request = PluginRequest {
                command: CniCommand::Del,
                container_id: container_id.to_string(),
                netns_path: netns_path.to_path_buf(),
                ifname: CNI_IFNAME.to_string(),
                plugin_type: config.plugin_type.clone(),
                stdin,
            };

            if let Err(e) = self.executor.execute(request).await {
                warn!("CNI DEL failed for plugin {}: {}", config.plugin_type, e);
                errors.push(format!("DEL {}: {}", config.plugin_type, e));
            }
        }

        errors
    }
}

fn config_object(config: &CniConfig) -> Result<serde_json::Map<String, serde_json::Value>> {
    match serde_json::to_value(config)? {
        serde_json::Value::Object(object) => Ok(object),
        other => Err(NetjailError::Plugin(format!(
            "CNI config for {} is not a JSON object: {}",
            config.plugin_type, other
        ))),
    }
}
