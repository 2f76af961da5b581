use crate::error::{NetjailError, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Where a container's network namespace handle comes from: a live process
/// (one-shot mode) or a descriptor received over the daemon socket. The raw
/// descriptor never leaves this module.
#[derive(Debug)]
pub enum NetnsSource {
    Pid(i32),
    Fd(OwnedFd),
}

impl NetnsSource {
    /// Kernel path naming the namespace special file for this source.
    fn proc_path(&self) -> PathBuf {
        match self {
            NetnsSource::Pid(pid) => PathBuf::from(format!("/proc/{pid}/ns/net")),
            NetnsSource::Fd(fd) => {
                PathBuf::from(format!("/proc/self/fd/{}", fd.as_raw_fd()))
            }
        }
    }
}

/// Namespace primitives the orchestrator consumes: expose a namespace at a
/// stable path, tear that path down, and run work inside a namespace. Kept
/// as a seam so the orchestrator can be exercised without mount or setns
/// privileges.
pub trait NetnsManager: Send + Sync {
    fn bind(&self, handle: &str, source: &NetnsSource) -> Result<PathBuf>;
    fn unbind(&self, handle: &str) -> Result<()>;
    fn enter_and_run(
        &self,
        netns_path: &Path,
        f: Box<dyn FnOnce() -> Result<()> + Send>,
    ) -> Result<()>;
}

/// Bind-mounts container network namespaces at deterministic paths under a
/// root directory, so a namespace outlives its originating process and can
/// be referenced by path in the plugin protocol and torn down later.
pub struct BindMounter {
    root: PathBuf,
}

impl BindMounter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn mount_path(&self, handle: &str) -> PathBuf {
        self.root.join(handle)
    }

    pub fn bind(&self, handle: &str, source: &NetnsSource) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.root).map_err(|e| {
            NetjailError::Netns(format!(
                "Failed to create bind mount root {}: {}",
                self.root.display(),
                e
            ))
        })?;

        let source_path = source.proc_path();
        if !source_path.exists() {
            return Err(NetjailError::Netns(format!(
                "Namespace source {} does not exist",
                source_path.display()
            )));
        }

        let target = self.mount_path(handle);
        // the mount target must exist as a regular file before a file
        // bind mount can land on it
        drop(File::create(&target).map_err(|e| {
            NetjailError::Netns(format!(
                "Failed to create mount point {}: {}",
                target.display(),
                e
            ))
        })?);

        mount(
            Some(&source_path),
            &target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| {
            let _ = std::fs::remove_file(&target);
            NetjailError::Netns(format!(
                "Failed to bind mount {} at {}: {}",
                source_path.display(),
                target.display(),
                e
            ))
        })?;

        debug!(
            "Bind mounted namespace {} at {}",
            source_path.display(),
            target.display()
        );
        Ok(target)
    }

    /// Unmounts and removes the namespace path for `handle`. A path that no
    /// longer exists counts as already clean; any other removal failure is
    /// a hard error.
    pub fn unbind(&self, handle: &str) -> Result<()> {
        let target = self.mount_path(handle);
        if !target.exists() {
            debug!("Namespace path {} already removed", target.display());
            return Ok(());
        }

        if let Err(errno) = umount2(&target, MntFlags::MNT_DETACH) {
            // EINVAL: not a mount point (stale file only), still removable
            if errno != nix::errno::Errno::EINVAL && errno != nix::errno::Errno::ENOENT {
                return Err(NetjailError::Netns(format!(
                    "Failed to unmount {}: {}",
                    target.display(),
                    errno
                )));
            }
        }

        match std::fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(NetjailError::Netns(format!(
                "Failed to remove {}: {}",
                target.display(),
                e
            ))),
        }
    }
}

impl NetnsManager for BindMounter {
    fn bind(&self, handle: &str, source: &NetnsSource) -> Result<PathBuf> {
        BindMounter::bind(self, handle, source)
    }

    fn unbind(&self, handle: &str) -> Result<()> {
        BindMounter::unbind(self, handle)
    }

    fn enter_and_run(
        &self,
        netns_path: &Path,
        f: Box<dyn FnOnce() -> Result<()> + Send>,
    ) -> Result<()> {
        run_in_namespace(netns_path, f)
    }
}

/// Runs `f` inside the network namespace mounted at `netns_path`.
///
/// `setns(2)` affects only the calling thread, so the closure runs on a
/// dedicated thread that switches in, does its work, and switches back to
/// the host namespace on every exit path before this function returns.
pub fn run_in_namespace<T, F>(netns_path: &Path, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send,
    T: Send,
{
    let target = File::open(netns_path).map_err(|e| {
        NetjailError::Netns(format!(
            "Failed to open namespace {}: {}",
            netns_path.display(),
            e
        ))
    })?;

    std::thread::scope(|scope| {
        scope
            .spawn(move || -> Result<T> {
                let host = File::open("/proc/thread-self/ns/net").map_err(|e| {
                    NetjailError::Netns(format!("Failed to open host namespace: {e}"))
                })?;

                setns(&target, CloneFlags::CLONE_NEWNET).map_err(|errno| {
                    NetjailError::Netns(format!("setns into target namespace failed: {errno}"))
                })?;
                let _guard = NamespaceGuard { host };

                f()
            })
            .join()
            .map_err(|_| NetjailError::Netns("Namespace worker thread panicked".to_string()))?
    })
}

/// Restores the saved host namespace when the worker thread leaves the
/// enter-and-run section, error exits included.
struct NamespaceGuard {
    host: File,
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        if let Err(errno) = setns(&self.host, CloneFlags::CLONE_NEWNET) {
            error!("Failed to restore host network namespace: {errno}");
        }
    }
}
