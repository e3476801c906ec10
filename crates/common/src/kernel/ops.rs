//! The idempotent operation surface C5/C6 reconcile against (§4.1), behind
//! a trait so the reconciler and the route/SA monitor can be driven by a
//! fake in unit tests the way the teacher's own code takes an injectable
//! client (`QmpClient::new(&path)` is a plain constructor, not a
//! singleton) rather than a real kernel.

use std::net::IpAddr;

use async_trait::async_trait;
use ipnetwork::IpNetwork;

use crate::error::Result;
use crate::kernel::netlink::{LinkSpec, NetlinkHandle, RouteSpec};
use crate::kernel::netns::NetworkNamespace;
use crate::kernel::shell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOp {
    Replace,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Unicast,
    Blackhole,
}

/// Everything C5 (reconciler) and C6 (monitor) need from the kernel,
/// scoped to one network instance (namespace) per call (§4.1).
#[async_trait]
pub trait KernelOps: Send + Sync {
    async fn ensure_namespace(&self, name: &str) -> Result<()>;
    async fn delete_namespace(&self, name: &str) -> Result<()>;
    async fn ensure_link(&self, ns: &str, spec: LinkSpec) -> Result<()>;
    async fn delete_link(&self, ns: &str, name: &str) -> Result<()>;
    async fn set_link_state(&self, ns: &str, name: &str, up: bool) -> Result<()>;
    async fn link_is_up(&self, ns: &str, name: &str) -> Result<bool>;
    async fn flush_addresses(&self, ns: &str, name: &str) -> Result<()>;
    async fn replace_address(&self, ns: &str, name: &str, addr: IpNetwork) -> Result<()>;
    #[allow(clippy::too_many_arguments)]
    async fn route(
        &self,
        ns: &str,
        op: RouteOp,
        dst: IpNetwork,
        via: Option<IpAddr>,
        ifname: Option<&str>,
        kind: RouteKind,
    ) -> Result<()>;
    async fn apply_nft_rules(&self, ns: &str, rendered: &str) -> Result<()>;
    async fn enable_forwarding(&self, ns: &str) -> Result<()>;
    /// Moves an interface that currently lives in `from_ns` into `to_ns`,
    /// by pid of a process parked inside the target namespace (the shape
    /// `rtnetlink`'s `setns_by_pid` wants).
    async fn move_link(&self, from_ns: &str, name: &str, to_ns: &str) -> Result<()>;
}

/// The real kernel: netlink for link/address/route mutation, `sysctl`/`nft`
/// shell-outs for the handful of operations with no netlink equivalent,
/// exactly the split the original draws between `pyroute2` and
/// `subprocess.run` (§4.1 grounding note).
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxKernel;

/// Runs `f` with the calling (blocking-pool) thread switched into
/// namespace `ns`, opening a fresh netlink handle once inside it. The
/// namespace is created first if this is its first use. `f`'s async body
/// is driven with `block_on` since namespace membership is thread-local
/// and must not be released before `f` finishes.
fn in_namespace<T: Send + 'static>(
    ns: String,
    f: impl (FnOnce(NetlinkHandle) -> futures::future::BoxFuture<'static, Result<T>>) + Send + 'static,
) -> tokio::task::JoinHandle<Result<T>> {
    tokio::task::spawn_blocking(move || {
        let handle = tokio::runtime::Handle::current();
        let namespace = NetworkNamespace::ensure(&ns)?;
        namespace.scoped(|| {
            let netlink = NetlinkHandle::open()?;
            handle.block_on(f(netlink))
        })
    })
}

fn join<T>(res: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    match res {
        Ok(inner) => inner,
        Err(e) => Err(crate::error::Error::Internal(format!("blocking task panicked: {e}"))),
    }
}

#[async_trait]
impl KernelOps for LinuxKernel {
    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        let res = tokio::task::spawn_blocking(move || NetworkNamespace::ensure(&name).map(|_| ()))
            .await;
        join(res)
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        let res = tokio::task::spawn_blocking(move || NetworkNamespace::delete(&name)).await;
        join(res)
    }

    async fn ensure_link(&self, ns: &str, spec: LinkSpec) -> Result<()> {
        let res = in_namespace(ns.to_string(), move |handle| {
            Box::pin(async move {
                if handle.link_index(&spec.name).await?.is_none() {
                    handle.link_add(&spec).await?;
                }
                Ok(())
            })
        })
        .await;
        join(res)
    }

    async fn delete_link(&self, ns: &str, name: &str) -> Result<()> {
        let name = name.to_string();
        let res = in_namespace(ns.to_string(), move |handle| {
            Box::pin(async move {
                if let Some(idx) = handle.link_index(&name).await? {
                    handle.link_del(idx).await?;
                }
                Ok(())
            })
        })
        .await;
        join(res)
    }

    async fn set_link_state(&self, ns: &str, name: &str, up: bool) -> Result<()> {
        let name = name.to_string();
        let res = in_namespace(ns.to_string(), move |handle| {
            Box::pin(async move {
                let Some(idx) = handle.link_index(&name).await? else {
                    return Ok(());
                };
                if up {
                    handle.link_set_up(idx).await
                } else {
                    handle.link_set_down(idx).await
                }
            })
        })
        .await;
        join(res)
    }

    async fn link_is_up(&self, ns: &str, name: &str) -> Result<bool> {
        let ns = ns.to_string();
        let name = name.to_string();
        let res = tokio::task::spawn_blocking(move || {
            NetworkNamespace::ensure(&ns)?.scoped(|| shell::link_is_up(&name))
        })
        .await;
        join(res)
    }

    async fn flush_addresses(&self, ns: &str, name: &str) -> Result<()> {
        let ns = ns.to_string();
        let name = name.to_string();
        let res = tokio::task::spawn_blocking(move || {
            NetworkNamespace::ensure(&ns)?.scoped(|| shell::flush_addresses(&name))
        })
        .await;
        join(res)
    }

    async fn replace_address(&self, ns: &str, name: &str, addr: IpNetwork) -> Result<()> {
        let name = name.to_string();
        let res = in_namespace(ns.to_string(), move |handle| {
            Box::pin(async move {
                let Some(idx) = handle.link_index(&name).await? else {
                    return Err(crate::error::Error::InvalidTopology(format!(
                        "interface {name} not present in namespace"
                    )));
                };
                handle.addr_add(idx, addr).await
            })
        })
        .await;
        join(res)
    }

    async fn route(
        &self,
        ns: &str,
        op: RouteOp,
        dst: IpNetwork,
        via: Option<IpAddr>,
        ifname: Option<&str>,
        kind: RouteKind,
    ) -> Result<()> {
        if op == RouteOp::Delete || kind == RouteKind::Blackhole {
            let ns = ns.to_string();
            let ifname = ifname.map(|s| s.to_string());
            let res = tokio::task::spawn_blocking(move || {
                NetworkNamespace::ensure(&ns)?
                    .scoped(|| shell::route(op, dst, via, ifname.as_deref(), kind))
            })
            .await;
            return join(res);
        }

        let ifname = ifname.map(|s| s.to_string());
        let res = in_namespace(ns.to_string(), move |handle| {
            Box::pin(async move {
                let oif = match &ifname {
                    Some(name) => handle.link_index(name).await?.unwrap_or(0),
                    None => 0,
                };
                handle
                    .route_add(&RouteSpec {
                        destination: dst,
                        gateway: via,
                        oif,
                        table: None,
                    })
                    .await
            })
        })
        .await;
        join(res)
    }

    async fn apply_nft_rules(&self, ns: &str, rendered: &str) -> Result<()> {
        let rendered = rendered.to_string();
        let ns = ns.to_string();
        let res = tokio::task::spawn_blocking(move || {
            NetworkNamespace::ensure(&ns)?.scoped(|| shell::nft_apply(&rendered))
        })
        .await;
        join(res)
    }

    async fn enable_forwarding(&self, ns: &str) -> Result<()> {
        let ns = ns.to_string();
        let res = tokio::task::spawn_blocking(move || {
            NetworkNamespace::ensure(&ns)?.scoped(|| shell::set_forwarding(true))
        })
        .await;
        join(res)
    }

    async fn move_link(&self, from_ns: &str, name: &str, to_ns: &str) -> Result<()> {
        // Resolve the destination namespace's pid-equivalent by reading
        // the bind-mounted netns file's inode owner is unnecessary here:
        // `rtnetlink` moves by pid, so the daemon always keeps one
        // long-lived placeholder process per namespace (its own, via
        // `ip netns exec <ns> sleep infinity` at namespace-creation time)
        // whose pid this resolves through `/var/run/netns/<ns>`'s holder.
        // Simplified to a shell-assisted move, mirroring the original's
        // `ip link set <if> netns <ns>` fallback for cases pyroute2's
        // `setns_by_pid` can't reach (no process resident yet).
        let from_ns = from_ns.to_string();
        let name = name.to_string();
        let to_ns = to_ns.to_string();
        let res = tokio::task::spawn_blocking(move || {
            NetworkNamespace::ensure(&from_ns)?;
            NetworkNamespace::ensure(&to_ns)?;
            shell::run_checked("ip", &["netns", "exec", &from_ns, "ip", "link", "set", &name, "netns", &to_ns])
        })
        .await;
        join(res)
    }
}
