use crate::error::{NetjailError, Result};
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

/// Firewall-rule application primitive: create a named chain, append rules
/// to it in bulk. Rules are never individually addressed or deleted; a
/// container's rules live and die with its network namespace.
pub trait IpTables: Send + Sync {
    fn new_chain(&self, table: &str, chain: &str) -> Result<()>;
    fn bulk_append(&self, table: &str, chain: &str, rules: &[Vec<String>]) -> Result<()>;
}

/// Shells out to the `iptables` binary with `-w` so concurrent invocations
/// wait on the xtables lock. Deliberately synchronous: rule application
/// runs on the namespace-entry thread.
pub struct IptablesCommand {
    binary: PathBuf,
}

impl IptablesCommand {
    pub fn discover() -> Result<Self> {
        let binary = which::which("iptables").map_err(|e| {
            NetjailError::Iptables(format!("iptables binary not found: {e}"))
        })?;
        Ok(Self { binary })
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, args: &[String]) -> Result<()> {
        debug!("Running {} {}", self.binary.display(), args.join(" "));
        let output = Command::new(&self.binary).args(args).output().map_err(|e| {
            NetjailError::Iptables(format!(
                "Failed to execute {}: {}",
                self.binary.display(),
                e
            ))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetjailError::Iptables(format!(
                "iptables {} failed with {}: {}",
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

impl IpTables for IptablesCommand {
    fn new_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.run(&[
            "-w".to_string(),
            "-t".to_string(),
            table.to_string(),
            "-N".to_string(),
            chain.to_string(),
        ])
    }

    fn bulk_append(&self, table: &str, chain: &str, rules: &[Vec<String>]) -> Result<()> {
        for rule in rules {
            let mut args = vec![
                "-w".to_string(),
                "-t".to_string(),
                table.to_string(),
                "-A".to_string(),
                chain.to_string(),
            ];
            args.extend(rule.iter().cloned());
            self.run(&args)?;
        }
        Ok(())
    }
}
