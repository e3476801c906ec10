//! Kernel-facing primitives: network namespaces, links, addresses and
//! routes via netlink, plus the handful of sysctl/legacy-tooling calls that
//! have no netlink equivalent (§4.1).
//!
//! Mirrors the split the original makes between `pyroute2.NetNS` (pure
//! netlink, all link/address/route mutation) and `subprocess.run` (only for
//! `sysctl -w` and nft/legacy tooling it never bothered to push through
//! netlink). `rtnetlink` fills the first role here; `std::process::Command`
//! fills the second, the same way the daemon crate shells out to `qemu-img`
//! and `qemu-system-*`.

mod netlink;
mod netns;
mod ops;
pub mod shell;

pub use netlink::{LinkKind, LinkSpec, NetlinkHandle, RouteSpec};
pub use netns::NetworkNamespace;
pub use ops::{KernelOps, LinuxKernel, RouteKind, RouteOp};
pub use shell::{flush_addresses, link_is_up, nft_apply, set_forwarding};
