use crate::cni::{CniConfig, CniResult};
use crate::error::{NetjailError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// Persisted record of one live attachment. Holds everything teardown
/// needs after the attaching process (or the daemon itself) has restarted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentEntry {
    pub handle: String,

    /// Bind-mount path of the container's network namespace
    pub netns_path: PathBuf,

    /// Static plugin configs the ADD chain ran with; reused for DEL
    pub cni_configs: Vec<CniConfig>,

    /// Results reported by each plugin, in chain order
    #[serde(default)]
    pub plugin_results: Vec<CniResult>,

    /// Host ports committed to this attachment, explicit and dynamic alike
    #[serde(default)]
    pub allocated_ports: Vec<u16>,

    /// iptables chains created inside the container namespace
    #[serde(default)]
    pub chain_names: Vec<String>,

    pub created_at: DateTime<Utc>,
}

/// File-backed map of container handle to attachment entry.
///
/// All access is serialized through one mutex and every mutation is flushed
/// atomically (temp file in the same directory, then rename into place), so
/// the store survives daemon restarts and concurrent attachments of
/// distinct handles never lose updates.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, AttachmentEntry>>,
}

impl StateStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => HashMap::new(),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                NetjailError::State(format!(
                    "Failed to parse state file {}: {}",
                    path.display(),
                    e
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(NetjailError::State(format!(
                    "Failed to read state file {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Inserts an entry for a handle that must not already be attached.
    pub fn insert_new(&self, entry: AttachmentEntry) -> Result<()> {
        let handle = entry.handle.clone();
        let mut entries = self.lock()?;
        if entries.contains_key(&handle) {
            return Err(NetjailError::AlreadyAttached(handle));
        }
        entries.insert(handle.clone(), entry);
        if let Err(e) = self.persist(&entries) {
            entries.remove(&handle);
            return Err(e);
        }
        Ok(())
    }

    /// Removes and returns the entry for `handle`, if any. Absence is not
    /// an error; teardown is idempotent.
    pub fn remove(&self, handle: &str) -> Result<Option<AttachmentEntry>> {
        let mut entries = self.lock()?;
        let Some(removed) = entries.remove(handle) else {
            return Ok(None);
        };
        if let Err(e) = self.persist(&entries) {
            entries.insert(handle.to_string(), removed);
            return Err(e);
        }
        Ok(Some(removed))
    }

    pub fn get(&self, handle: &str) -> Result<Option<AttachmentEntry>> {
        Ok(self.lock()?.get(handle).cloned())
    }

    /// Every host port currently committed to a live attachment, explicit
    /// mappings and dynamic allocations alike.
    pub fn ports_in_use(&self) -> Result<HashSet<u16>> {
        Ok(self
            .lock()?
            .values()
            .flat_map(|entry| entry.allocated_ports.iter().copied())
            .collect())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, AttachmentEntry>>> {
        self.entries
            .lock()
            .map_err(|_| NetjailError::State("State store mutex poisoned".to_string()))
    }

    fn persist(&self, entries: &HashMap<String, AttachmentEntry>) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| {
            NetjailError::State(format!(
                "Failed to create state directory {}: {}",
                parent.display(),
                e
            ))
        })?;

        let mut file = tempfile::NamedTempFile::new_in(parent).map_err(|e| {
            NetjailError::State(format!("Failed to create temp state file: {e}"))
        })?;
        let content = serde_json::to_string_pretty(entries)
            .map_err(|e| NetjailError::State(format!("Failed to serialize state: {e}")))?;
        file.write_all(content.as_bytes()).map_err(|e| {
            NetjailError::State(format!("Failed to write temp state file: {e}"))
        })?;
        file.persist(&self.path).map_err(|e| {
            NetjailError::State(format!(
                "Failed to replace state file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(())
    }
}
