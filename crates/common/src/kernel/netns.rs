use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use nix::sched::{setns, CloneFlags};

use crate::error::{Error, Result};

const NETNS_RUN_DIR: &str = "/var/run/netns";

/// A named network namespace, bind-mounted under `/var/run/netns` the way
/// `ip netns add`/`pyroute2.NetNS` leave it so it survives the creating
/// process exiting and other tools (`ip netns exec`, `nft`) can find it by
/// name.
pub struct NetworkNamespace {
    pub name: String,
}

impl NetworkNamespace {
    /// Creates the namespace if it doesn't already exist. Safe to call
    /// repeatedly; reconciliation calls this on every pass for every
    /// configured network instance.
    pub fn ensure(name: &str) -> Result<Self> {
        let path = PathBuf::from(NETNS_RUN_DIR).join(name);
        if path.exists() {
            return Ok(Self { name: name.to_string() });
        }

        std::fs::create_dir_all(NETNS_RUN_DIR)?;
        File::create(&path)?;

        let this_netns = File::open("/proc/self/ns/net")?;
        nix::sched::unshare(CloneFlags::CLONE_NEWNET)
            .map_err(|e| Error::Internal(format!("unshare(CLONE_NEWNET): {e}")))?;

        let new_netns = File::open("/proc/self/ns/net")?;
        let res = nix::mount::mount(
            Some("/proc/self/ns/net"),
            &path,
            None::<&str>,
            nix::mount::MsFlags::MS_BIND,
            None::<&str>,
        );

        // Whatever happens, return this thread to its original namespace
        // before propagating any error — `unshare` only affects the
        // calling thread, but leaving it switched would corrupt the next
        // namespace-scoped operation on the same worker thread.
        setns(this_netns.as_raw_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|e| Error::Internal(format!("setns(restore): {e}")))?;
        drop(new_netns);

        res.map_err(|e| Error::Internal(format!("bind mount netns: {e}")))?;

        Ok(Self { name: name.to_string() })
    }

    /// Bind-mounts the host's root network namespace under
    /// `/var/run/netns/DEFAULT`, so operator tooling (`ip netns exec
    /// DEFAULT ...`) can address it by name alongside `ni-EXTERNAL`/
    /// `ni-CORE`/downlink namespaces instead of needing a namespace-less
    /// special case. Uses pid 1's namespace rather than the calling
    /// process's own, since by the time this is unconditionally safe to
    /// call the daemon itself may already have `unshare`d for an earlier
    /// network instance.
    pub fn ensure_default_alias() -> Result<()> {
        let path = PathBuf::from(NETNS_RUN_DIR).join("DEFAULT");
        if path.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(NETNS_RUN_DIR)?;
        File::create(&path)?;
        nix::mount::mount(
            Some("/proc/1/ns/net"),
            &path,
            None::<&str>,
            nix::mount::MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| Error::Internal(format!("bind mount DEFAULT netns alias: {e}")))?;
        Ok(())
    }

    pub fn delete(name: &str) -> Result<()> {
        let path = PathBuf::from(NETNS_RUN_DIR).join(name);
        if !path.exists() {
            return Ok(());
        }
        nix::mount::umount(&path).map_err(|e| Error::Internal(format!("umount netns: {e}")))?;
        std::fs::remove_file(&path)?;
        Ok(())
    }

    /// Runs `f` with the calling thread switched into this namespace,
    /// restoring the original namespace afterwards regardless of outcome.
    /// Callers invoke this via `spawn_blocking`, mirroring the way the
    /// original always does its pyroute2 `NetNS` work from inside a
    /// `with` block scoped to one namespace at a time.
    pub fn scoped<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let path = PathBuf::from(NETNS_RUN_DIR).join(&self.name);
        let original = File::open("/proc/self/ns/net")?;
        let target = File::open(&path)?;

        setns(target.as_raw_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|e| Error::Internal(format!("setns({}): {e}", self.name)))?;

        let result = f();

        setns(original.as_raw_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|e| Error::Internal(format!("setns(restore): {e}")))?;

        result
    }
}
